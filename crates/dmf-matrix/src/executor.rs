use std::collections::HashMap;
use std::sync::Arc;

use dmf_common::error::Result;
use dmf_runtime::channel::Channel;
use dmf_runtime::task_manager::{Rank, TaskManager};

use crate::distributed::DistributedMatrix;
use crate::scheduler::assign_blocks_to_tasks;

/// Wire protocol for `run_task_on_blocks` (spec §4.4): the caller sends the
/// argument list it built for a task group in one shot, the task group
/// replies with one result per argument, in the same order (spec §5:
/// "Per-task, results are sent back in the order arguments arrived").
pub enum BlockMsg<A, R> {
    Args(Vec<A>),
    Results(Vec<R>),
}

/// `runTaskOnBlocks(dm, construct, taskId, tasksPerRank, ...)` (spec §4.4).
///
/// `construct(b1, b2)` builds the per-block argument (typically just the
/// block's `RemoteVar`s — the handler itself fetches the data from its own
/// node's `Environment`, since every block is assigned to a task that
/// already runs on its owning node). `handler` is the per-block kernel.
/// Returns the `blocks1 x blocks2` result matrix.
pub async fn run_task_on_blocks<A, R>(
    cluster: &[Arc<TaskManager<BlockMsg<A, R>>>],
    dm: &DistributedMatrix,
    tasks_per_rank: usize,
    construct: impl Fn(usize, usize) -> A,
    handler: Arc<dyn Fn(A) -> R + Send + Sync>,
) -> Result<Vec<Vec<R>>>
where
    A: Send + 'static,
    R: Send + 'static,
{
    let world_size = cluster.len();
    for tm in cluster {
        let handler = handler.clone();
        tm.register(
            "block-worker",
            Arc::new(move |_info, mut ch: Channel<BlockMsg<A, R>>| {
                let handler = handler.clone();
                Box::pin(async move {
                    if let Some(BlockMsg::Args(args)) = ch.recv_economic().await {
                        let results: Vec<R> = args.into_iter().map(|a| handler(a)).collect();
                        ch.send(BlockMsg::Results(results)).ok();
                    }
                    Ok(())
                })
            }),
        );
    }

    let assignment = assign_blocks_to_tasks(&dm.location, world_size, tasks_per_rank);

    // Column-major scan: (b2 outer, b1 inner), matching the assignment's
    // own scan order, so "the k-th result sent back matches the k-th
    // input in the original send list" holds per task (spec §4.4 step 4).
    let mut per_task_blocks: HashMap<usize, Vec<(usize, usize)>> = HashMap::new();
    for b2 in 0..dm.blocks2() {
        for b1 in 0..dm.blocks1() {
            let group = assignment[&(b1, b2)];
            per_task_blocks.entry(group).or_default().push((b1, b2));
        }
    }

    let mut channels_per_rank: Vec<Vec<Channel<BlockMsg<A, R>>>> = Vec::with_capacity(world_size);
    for tm in cluster {
        channels_per_rank.push(tm.spawn_group("block-worker", tasks_per_rank)?);
    }

    let mut out: Vec<Vec<Option<R>>> = (0..dm.blocks1())
        .map(|_| (0..dm.blocks2()).map(|_| None).collect())
        .collect();

    for (group_id, blocks) in per_task_blocks {
        let rank: Rank = group_id / tasks_per_rank;
        let local_task = group_id % tasks_per_rank;
        let args: Vec<A> = blocks.iter().map(|&(b1, b2)| construct(b1, b2)).collect();
        let ch = &mut channels_per_rank[rank][local_task];
        ch.send(BlockMsg::Args(args)).ok();
        if let Some(BlockMsg::Results(results)) = ch.recv_economic().await {
            for ((b1, b2), r) in blocks.into_iter().zip(results.into_iter()) {
                out[b1][b2] = Some(r);
            }
        }
    }

    for tm in cluster {
        tm.drain().await?;
    }

    Ok(out
        .into_iter()
        .map(|row| row.into_iter().map(|o| o.expect("every block collected")).collect())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn every_block_is_visited_exactly_once() {
        let cluster: Vec<_> = (0..2).map(|r| Arc::new(TaskManager::new(r))).collect();
        let dm = DistributedMatrix::new("v", 10, 10, 4, 4, 2, true).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter2 = counter.clone();
        let handler: Arc<dyn Fn((usize, usize)) -> usize + Send + Sync> =
            Arc::new(move |(b1, b2)| {
                counter2.fetch_add(1, Ordering::SeqCst);
                b1 * 100 + b2
            });
        let result = run_task_on_blocks(&cluster, &dm, 2, |b1, b2| (b1, b2), handler)
            .await
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 16);
        for b1 in 0..4 {
            for b2 in 0..4 {
                assert_eq!(result[b1][b2], b1 * 100 + b2);
            }
        }
    }
}
