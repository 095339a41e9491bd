use std::sync::Arc;

use dmf_common::error::{MfError, Result};
use dmf_runtime::{DeletionPolicy, Environment, RemoteVar};

use crate::dense::{Dense, Order};

/// Default block boundary: `offsets[b] = floor(b * size / blocks)`, last
/// block absorbs the remainder (spec §4.3).
pub fn default_offsets(size: usize, blocks: usize) -> Vec<usize> {
    (0..=blocks).map(|b| b * size / blocks).collect()
}

/// Default block->rank placement (spec §4.3): if `partition_by_row`, every
/// row of the block grid lives entirely on one node and row-groups are
/// spread across ranks as evenly as possible; otherwise the same holds for
/// columns.
pub fn default_locations(
    blocks1: usize,
    blocks2: usize,
    world_size: usize,
    partition_by_row: bool,
) -> Vec<Vec<usize>> {
    let groups = if partition_by_row { blocks1 } else { blocks2 };
    let rank_of_group: Vec<usize> = (0..groups).map(|g| g * world_size / groups).collect();
    let mut loc = vec![vec![0usize; blocks2]; blocks1];
    for b1 in 0..blocks1 {
        for b2 in 0..blocks2 {
            loc[b1][b2] = if partition_by_row {
                rank_of_group[b1]
            } else {
                rank_of_group[b2]
            };
        }
    }
    loc
}

pub fn default_block_name(base: &str, b1: usize, b2: usize) -> String {
    format!("{base}[{b1},{b2}]")
}

/// A `blocks1 x blocks2` description of a logical matrix whose blocks are
/// environment entries (spec §3 `DistributedMatrix<M>`).
#[derive(Clone)]
pub struct DistributedMatrix {
    pub name: String,
    pub size1: usize,
    pub size2: usize,
    pub offsets1: Vec<usize>,
    pub offsets2: Vec<usize>,
    pub location: Vec<Vec<usize>>,
    pub handles: Vec<Vec<RemoteVar>>,
}

impl DistributedMatrix {
    pub fn new(
        name: impl Into<String>,
        size1: usize,
        size2: usize,
        blocks1: usize,
        blocks2: usize,
        world_size: usize,
        partition_by_row: bool,
    ) -> Result<Self> {
        let name = name.into();
        if blocks1 == 0 || blocks2 == 0 {
            return Err(MfError::Shape(
                "DistributedMatrix: blocks1 and blocks2 must be positive".into(),
            ));
        }
        let offsets1 = default_offsets(size1, blocks1);
        let offsets2 = default_offsets(size2, blocks2);
        let location = default_locations(blocks1, blocks2, world_size, partition_by_row);
        let handles = (0..blocks1)
            .map(|b1| {
                (0..blocks2)
                    .map(|b2| RemoteVar::new(location[b1][b2], default_block_name(&name, b1, b2)))
                    .collect()
            })
            .collect();
        Self::validate(size1, size2, &offsets1, &offsets2)?;
        Ok(Self {
            name,
            size1,
            size2,
            offsets1,
            offsets2,
            location,
            handles,
        })
    }

    fn validate(size1: usize, size2: usize, offsets1: &[usize], offsets2: &[usize]) -> Result<()> {
        let strictly_increasing_bounded = |offsets: &[usize], size: usize| {
            offsets[0] == 0
                && *offsets.last().unwrap() == size
                && offsets.windows(2).all(|w| w[0] < w[1])
        };
        if !strictly_increasing_bounded(offsets1, size1) || !strictly_increasing_bounded(offsets2, size2)
        {
            return Err(MfError::Shape(
                "DistributedMatrix: offsets must be strictly increasing, start at 0, and bound the size".into(),
            ));
        }
        Ok(())
    }

    pub fn blocks1(&self) -> usize {
        self.offsets1.len() - 1
    }

    pub fn blocks2(&self) -> usize {
        self.offsets2.len() - 1
    }

    pub fn block_shape(&self, b1: usize, b2: usize) -> (usize, usize) {
        (
            self.offsets1[b1 + 1] - self.offsets1[b1],
            self.offsets2[b2 + 1] - self.offsets2[b2],
        )
    }

    /// Allocate an empty dense block of the right shape in each target
    /// node's environment (spec §4.3 `create()`).
    pub fn create_dense(&self, envs: &[Arc<Environment>], order: Order) -> Result<()> {
        for b1 in 0..self.blocks1() {
            for b2 in 0..self.blocks2() {
                let (r, c) = self.block_shape(b1, b2);
                let handle = &self.handles[b1][b2];
                envs[handle.rank].create(
                    handle.name.clone(),
                    Dense::zeros(r, c, order),
                    DeletionPolicy::DeleteValue,
                )?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_offsets_cover_the_whole_size_with_remainder_in_last_block() {
        let offsets = default_offsets(10, 3);
        assert_eq!(offsets, vec![0, 3, 6, 10]);
    }

    #[test]
    fn row_partitioned_blocks_share_a_rank_per_row() {
        let loc = default_locations(4, 3, 2, true);
        for b1 in 0..4 {
            let ranks: Vec<_> = loc[b1].iter().collect();
            assert!(ranks.iter().all(|&&r| r == *ranks[0]));
        }
    }

    #[test]
    fn distributed_matrix_rejects_non_positive_block_counts() {
        let err = DistributedMatrix::new("v", 10, 10, 0, 2, 1, true);
        assert!(err.is_err());
    }

    #[test]
    fn block_shapes_sum_to_the_whole_matrix() {
        let dm = DistributedMatrix::new("v", 10, 7, 3, 2, 1, true).unwrap();
        let mut total_rows = 0;
        for b1 in 0..dm.blocks1() {
            total_rows += dm.block_shape(b1, 0).0;
        }
        assert_eq!(total_rows, 10);
    }
}
