use std::collections::HashMap;

/// Assigns every block `(b1, b2)` of a distributed matrix to a task group
/// id in `0..world_size*tasks_per_rank`, such that:
///  (a) every block goes to a task group running on its owning node, and
///  (b) per-task-group block counts differ by at most one (spec §4.4).
///
/// The scan order is column-major over `(b1, b2)` — `b2` outer, `b1` inner
/// — "so that row blocks interleave across tasks" (spec §4.4): round-robin
/// assignment over a node's blocks in this order hands consecutive row
/// blocks to different local tasks rather than piling an entire row-block
/// run onto one task.
pub fn assign_blocks_to_tasks(
    location: &[Vec<usize>],
    world_size: usize,
    tasks_per_rank: usize,
) -> HashMap<(usize, usize), usize> {
    let blocks1 = location.len();
    let blocks2 = if blocks1 > 0 { location[0].len() } else { 0 };

    let mut per_rank_blocks: Vec<Vec<(usize, usize)>> = vec![Vec::new(); world_size];
    for b2 in 0..blocks2 {
        for b1 in 0..blocks1 {
            let rank = location[b1][b2];
            per_rank_blocks[rank].push((b1, b2));
        }
    }

    let mut assignment = HashMap::new();
    for (rank, blocks) in per_rank_blocks.into_iter().enumerate() {
        for (idx, (b1, b2)) in blocks.into_iter().enumerate() {
            let local_task = idx % tasks_per_rank;
            let group_id = rank * tasks_per_rank + local_task;
            assignment.insert((b1, b2), group_id);
        }
    }
    assignment
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::default_locations;

    #[test]
    fn every_block_maps_to_a_task_on_its_owning_node() {
        let location = default_locations(4, 3, 2, true);
        let assignment = assign_blocks_to_tasks(&location, 2, 2);
        for b1 in 0..4 {
            for b2 in 0..3 {
                let group = assignment[&(b1, b2)];
                let owner_rank = location[b1][b2];
                assert_eq!(group / 2, owner_rank);
            }
        }
    }

    #[test]
    fn per_task_counts_differ_by_at_most_one() {
        let location = default_locations(7, 5, 3, true);
        let assignment = assign_blocks_to_tasks(&location, 3, 2);
        let mut counts = HashMap::new();
        for group in assignment.values() {
            *counts.entry(*group).or_insert(0) += 1;
        }
        let min = *counts.values().min().unwrap();
        let max = *counts.values().max().unwrap();
        assert!(max - min <= 1);
    }
}
