//! # Block Distribution
//!
//! Partitions a range of `global_count` work items into contiguous blocks,
//! one block per rank of a process group. The first
//! `global_count % group_size` ranks receive one extra item, so per-rank
//! counts never differ by more than one.
//!
//! ## Padded vs. dense index spaces
//!
//! Collective gathers need every rank to contribute a buffer of the same
//! length. Each rank therefore owns `local_array_size` slots in a *padded*
//! global array (`global_array_size = local_array_size * group_size`), even
//! when it holds fewer real items. Two addressing schemes follow from this:
//!
//! - [`BlockDistribution::global_offset`] addresses the dense logical index
//!   space `[0, global_count)`
//! - [`BlockDistribution::global_array_index`] addresses the padded space
//!
//! [`BlockDistribution::compact_global_array`] converts a gathered padded
//! array back into the dense form by dropping the padding slots.
//!
//! ## Example
//!
//! ```rust
//! use replica_bench::distribution::BlockDistribution;
//!
//! // 7 items over 5 ranks: counts are [2, 2, 1, 1, 1]
//! let dist = BlockDistribution::new(7, 5, 2).unwrap();
//! assert_eq!(dist.local_count(), 1);
//! assert_eq!(dist.local_array_size(), 2);
//! assert_eq!(dist.global_offset(0).unwrap(), 4);
//! assert_eq!(dist.global_array_index(0).unwrap(), 4);
//!
//! let padded = ['a', 'a', 'b', 'b', 'c', '-', 'd', '-', 'e', '-'];
//! assert_eq!(dist.compacted(&padded).unwrap(), vec!['a', 'a', 'b', 'b', 'c', 'd', 'e']);
//! ```

use rand::Rng;
use thiserror::Error;

/// Errors raised by [`BlockDistribution`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DistributionError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("index {index} out of bounds (limit {limit})")]
    OutOfBounds { index: usize, limit: usize },
}

/// Contiguous block partition of `global_count` items over `group_size` ranks,
/// seen from one rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockDistribution {
    global_count: usize,
    group_size: usize,
    rank: usize,
    base_count: usize,
    remainder: usize,
    local_count: usize,
    local_array_size: usize,
}

impl BlockDistribution {
    /// Create the partition for `rank`.
    ///
    /// ## Errors
    /// `InvalidArgument` when `group_size` is zero or `rank >= group_size`.
    pub fn new(
        global_count: usize,
        group_size: usize,
        rank: usize,
    ) -> Result<Self, DistributionError> {
        if group_size == 0 {
            return Err(DistributionError::InvalidArgument(
                "group size must be at least 1".to_string(),
            ));
        }
        if rank >= group_size {
            return Err(DistributionError::InvalidArgument(format!(
                "rank {} is outside the group [0, {})",
                rank, group_size
            )));
        }

        let base_count = global_count / group_size;
        let remainder = global_count % group_size;
        let local_count = if rank < remainder {
            base_count + 1
        } else {
            base_count
        };
        let local_array_size = if remainder != 0 {
            base_count + 1
        } else {
            base_count
        };

        Ok(Self {
            global_count,
            group_size,
            rank,
            base_count,
            remainder,
            local_count,
            local_array_size,
        })
    }

    pub fn global_count(&self) -> usize {
        self.global_count
    }

    pub fn group_size(&self) -> usize {
        self.group_size
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Number of real items held by this rank.
    pub fn local_count(&self) -> usize {
        self.local_count
    }

    /// Padded per-rank capacity, identical on every rank.
    pub fn local_array_size(&self) -> usize {
        self.local_array_size
    }

    /// Length of the padded global array.
    pub fn global_array_size(&self) -> usize {
        self.local_array_size * self.group_size
    }

    /// Dense global index of this rank's `local_index`-th item.
    pub fn global_offset(&self, local_index: usize) -> Result<usize, DistributionError> {
        if local_index >= self.local_count {
            return Err(DistributionError::OutOfBounds {
                index: local_index,
                limit: self.local_count,
            });
        }
        Ok(self.rank * self.base_count + local_index + self.rank.min(self.remainder))
    }

    /// Position of this rank's `local_index`-th slot in the padded array.
    pub fn global_array_index(&self, local_index: usize) -> Result<usize, DistributionError> {
        if local_index >= self.local_array_size {
            return Err(DistributionError::OutOfBounds {
                index: local_index,
                limit: self.local_array_size,
            });
        }
        Ok(self.rank * self.local_array_size + local_index)
    }

    /// Number of real items held by `other_rank`.
    pub fn item_count(&self, other_rank: usize) -> Result<usize, DistributionError> {
        if other_rank >= self.group_size {
            return Err(DistributionError::OutOfBounds {
                index: other_rank,
                limit: self.group_size,
            });
        }
        if other_rank < self.remainder {
            Ok(self.base_count + 1)
        } else {
            Ok(self.base_count)
        }
    }

    /// Copy the real items of a padded global array into `dest`.
    ///
    /// Ranks are walked in increasing order; for each rank exactly
    /// `item_count(rank)` entries starting at `rank * local_array_size` are
    /// copied into the next free slots of `dest`.
    ///
    /// ## Errors
    /// `InvalidArgument` when `src` is shorter than `global_array_size()` or
    /// `dest` is shorter than `global_count()`.
    pub fn compact_global_array<T: Clone>(
        &self,
        src: &[T],
        dest: &mut [T],
    ) -> Result<(), DistributionError> {
        if src.len() < self.global_array_size() {
            return Err(DistributionError::InvalidArgument(format!(
                "padded source holds {} slots, expected {}",
                src.len(),
                self.global_array_size()
            )));
        }
        if dest.len() < self.global_count {
            return Err(DistributionError::InvalidArgument(format!(
                "destination holds {} slots, expected {}",
                dest.len(),
                self.global_count
            )));
        }

        let mut next = 0;
        for rank in 0..self.group_size {
            let count = self.item_count(rank)?;
            let start = rank * self.local_array_size;
            dest[next..next + count].clone_from_slice(&src[start..start + count]);
            next += count;
        }
        Ok(())
    }

    /// Allocating variant of [`compact_global_array`](Self::compact_global_array).
    pub fn compacted<T: Clone>(&self, src: &[T]) -> Result<Vec<T>, DistributionError> {
        if src.len() < self.global_array_size() {
            return Err(DistributionError::InvalidArgument(format!(
                "padded source holds {} slots, expected {}",
                src.len(),
                self.global_array_size()
            )));
        }
        let mut dense = Vec::with_capacity(self.global_count);
        for rank in 0..self.group_size {
            let start = rank * self.local_array_size;
            dense.extend_from_slice(&src[start..start + self.item_count(rank)?]);
        }
        Ok(dense)
    }

    /// Generate this rank's share of a random key set, padded with zeros to
    /// `local_array_size`.
    ///
    /// Keys are non-zero 32-bit values so that they can be used directly as
    /// IPv4 or MAC keys without colliding with the probe key `0`. After an
    /// all-gather of the padded buffers, [`compacted`](Self::compacted) yields
    /// the same `global_count` keys on every rank.
    pub fn generate_local_keys<R: Rng>(&self, rng: &mut R) -> Vec<i64> {
        let mut keys = vec![0i64; self.local_array_size];
        for slot in keys.iter_mut().take(self.local_count) {
            *slot = i64::from(rng.gen_range(1..=u32::MAX));
        }
        keys
    }
}
