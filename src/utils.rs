//! # Utility Functions and Helper Module
//!
//! Small helpers shared across the harness: wall-clock timestamps used for
//! cross-participant latency measurement, human-readable formatting for
//! reports, and host identification.
//!
//! ## Clocks
//!
//! Latency is computed across participants by embedding the writer's clock
//! reading in the published value and subtracting it from the reader's clock
//! reading. Both readings therefore come from the wall clock
//! ([`current_timestamp_ns`]), not from a monotonic `Instant`, and the result
//! is only meaningful when participants share a clock or run on hosts with
//! synchronized clocks.
//!
//! ## Usage Examples
//!
//! ```rust
//! use replica_bench::utils::*;
//! use std::time::Duration;
//!
//! assert_eq!(format_duration(Duration::from_micros(1500)), "1.50ms");
//! assert_eq!(format_latency_ns(2_500.0), "2.50μs");
//! assert!(current_timestamp_ns() > 0);
//! ```

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Get current timestamp as nanoseconds since Unix epoch
///
/// ## Returns
/// Number of nanoseconds since January 1, 1970, 00:00:00 UTC
///
/// ## Error Handling
///
/// If the system time is before the Unix epoch (very rare), returns 0
/// to provide a safe fallback rather than panicking.
pub fn current_timestamp_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

/// Current timestamp in milliseconds since Unix epoch
pub fn current_timestamp_ms() -> u64 {
    current_timestamp_ns() / 1_000_000
}

/// Convert nanoseconds to a human-readable duration string
pub fn format_duration_ns(ns: u64) -> String {
    format_duration(Duration::from_nanos(ns))
}

/// Format a duration with the most appropriate unit
///
/// ## Unit Selection
///
/// - Nanoseconds for values < 1μs
/// - Microseconds for values < 1ms
/// - Milliseconds for values < 1s
/// - Seconds with two decimals otherwise
pub fn format_duration(duration: Duration) -> String {
    let nanos = duration.as_nanos();

    if nanos < 1_000 {
        format!("{}ns", nanos)
    } else if nanos < 1_000_000 {
        format!("{:.2}μs", nanos as f64 / 1_000.0)
    } else if nanos < 1_000_000_000 {
        format!("{:.2}ms", nanos as f64 / 1_000_000.0)
    } else {
        format!("{:.2}s", duration.as_secs_f64())
    }
}

/// Format a fractional nanosecond latency such as a mean.
pub fn format_latency_ns(ns: f64) -> String {
    if !ns.is_finite() || ns < 0.0 {
        return format!("{:.2}ns", ns);
    }
    if ns < 1_000.0 {
        format!("{:.2}ns", ns)
    } else {
        format_duration(Duration::from_nanos(ns.round() as u64))
    }
}

/// Format an operation rate for display
pub fn format_rate(per_second: f64) -> String {
    if per_second >= 1_000_000.0 {
        format!("{:.2}M ops/s", per_second / 1_000_000.0)
    } else if per_second >= 1_000.0 {
        format!("{:.2}K ops/s", per_second / 1_000.0)
    } else {
        format!("{:.2} ops/s", per_second)
    }
}

/// Host name of this machine, `localhost` when it cannot be determined
#[cfg(unix)]
pub fn host_name() -> String {
    match nix::unistd::gethostname() {
        Ok(name) if !name.is_empty() => name.to_string_lossy().into_owned(),
        Ok(_) => "localhost".to_string(),
        Err(e) => {
            tracing::warn!("gethostname failed: {}, using localhost", e);
            "localhost".to_string()
        }
    }
}

#[cfg(not(unix))]
pub fn host_name() -> String {
    std::env::var("COMPUTERNAME").unwrap_or_else(|_| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test duration formatting with various time scales
    #[test]
    fn test_format_duration_ns() {
        assert_eq!(format_duration_ns(500), "500ns");
        assert_eq!(format_duration_ns(1500), "1.50μs");
        assert_eq!(format_duration_ns(1_500_000), "1.50ms");
        assert_eq!(format_duration_ns(1_500_000_000), "1.50s");
    }

    #[test]
    fn test_format_latency_ns() {
        assert_eq!(format_latency_ns(12.345), "12.35ns");
        assert_eq!(format_latency_ns(2_500_000.0), "2.50ms");
    }

    #[test]
    fn test_format_rate() {
        assert_eq!(format_rate(10.0), "10.00 ops/s");
        assert_eq!(format_rate(1500.0), "1.50K ops/s");
        assert_eq!(format_rate(2_000_000.0), "2.00M ops/s");
    }

    /// Wall-clock readings advance and agree across the two resolutions
    #[test]
    fn test_timestamps_monotonic_enough() {
        let first = current_timestamp_ns();
        std::thread::sleep(Duration::from_millis(2));
        let second = current_timestamp_ns();
        assert!(second > first);
        assert!(current_timestamp_ms() >= first / 1_000_000);
    }

    #[test]
    fn test_host_name_not_empty() {
        assert!(!host_name().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_host_name_matches_system() {
        let system = nix::unistd::gethostname().unwrap();
        if !system.is_empty() {
            assert_eq!(host_name(), system.to_string_lossy());
        }
    }
}
