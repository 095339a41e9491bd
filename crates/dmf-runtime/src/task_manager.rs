use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use dmf_common::error::{MfError, RemoteCallError, Result};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::channel::{pairwise_mesh, Channel, DEFAULT_POLL_DELAY};
use crate::tag::TagAllocator;

pub type Rank = usize;

/// Per-task-group metadata handed to every worker thread the task manager
/// launches (spec §4.1: `TaskInfo(groupSize, groupId, pairwiseChannels)`).
/// Unlike the source's global `env()` singleton, nothing here is implicit:
/// a task gets exactly the handle and metadata its `spawn` call produced
/// (spec §9 design note on replacing the global `env()`).
pub struct TaskInfo {
    pub group_size: usize,
    pub group_id: usize,
    pub rank: Rank,
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A registered remote task: given its `TaskInfo` and its inbound channel,
/// run to completion. Registered by name so `spawn`/`spawn_group` can be
/// asked for a task id that does not exist (spec §4.1/§7: `UnknownTaskId`).
pub type TaskBody<Msg> =
    Arc<dyn Fn(TaskInfo, Channel<Msg>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// One node's task manager: a worker pool (here, the ambient Tokio runtime,
/// which grows its blocking/worker threads on demand so a `spawn` issued
/// from inside a running task can never self-deadlock — spec §4.1/§5), a
/// tag allocator, and the registry of task bodies this node can run.
pub struct TaskManager<Msg: Send + 'static> {
    pub rank: Rank,
    tags: TagAllocator,
    poll_delay: Duration,
    registry: Mutex<HashMap<String, TaskBody<Msg>>>,
    pending: Mutex<Vec<JoinHandle<Result<()>>>>,
}

impl<Msg: Send + 'static> TaskManager<Msg> {
    pub fn new(rank: Rank) -> Self {
        Self::with_poll_delay(rank, DEFAULT_POLL_DELAY)
    }

    pub fn with_poll_delay(rank: Rank, poll_delay: Duration) -> Self {
        Self {
            rank,
            tags: TagAllocator::new(),
            poll_delay,
            registry: Mutex::new(HashMap::new()),
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn register(&self, task_id: impl Into<String>, body: TaskBody<Msg>) {
        self.registry.lock().insert(task_id.into(), body);
    }

    fn lookup(&self, task_id: &str) -> Result<TaskBody<Msg>> {
        self.registry
            .lock()
            .get(task_id)
            .cloned()
            .ok_or_else(|| MfError::RemoteCall(RemoteCallError::UnknownTaskId(task_id.to_string())))
    }

    /// `spawn(rank, taskId) -> Channel` (spec §4.1), specialised to "this"
    /// node: a fresh local tag is allocated, a remote tag for the callee is
    /// allocated, and a duplex channel connects them. The returned channel
    /// is the caller's endpoint; the task's endpoint is handed to its body.
    pub fn spawn(&self, task_id: &str) -> Result<Channel<Msg>> {
        let body = self.lookup(task_id)?;
        let caller_tag = self.tags.alloc()?;
        let task_tag = self.tags.alloc()?;
        let (caller_end, task_end) = Channel::duplex(caller_tag, task_tag, self.poll_delay);
        let info = TaskInfo {
            group_size: 1,
            group_id: 0,
            rank: self.rank,
        };
        let handle = tokio::spawn(body(info, task_end));
        self.pending.lock().push(handle);
        Ok(caller_end)
    }

    /// `spawn(rank, taskId, n, pairwise?) -> [Channel; n]` (spec §4.1): a
    /// task group of size `n` on this node, with no peer mesh.
    pub fn spawn_group(&self, task_id: &str, n: usize) -> Result<Vec<Channel<Msg>>> {
        self.spawn_group_with_mesh(task_id, n, None).map(|(chs, _)| chs)
    }

    /// As `spawn_group`, but when `peer_body` is supplied every launched
    /// task additionally receives its row of an `n x n` pairwise channel
    /// mesh and `peer_body` is spawned as the task responsible for driving
    /// that row. Kept as a distinct body type `PeerMsg` because a task
    /// group's control channel and its peer-exchange channel (DSGD's
    /// H-block handoff, ASGD's shuffle) rarely share a message type.
    pub fn spawn_group_with_mesh<PeerMsg: Send + 'static>(
        &self,
        task_id: &str,
        n: usize,
        peer_body: Option<TaskBody<PeerMsg>>,
    ) -> Result<(Vec<Channel<Msg>>, Option<Vec<Vec<Option<Channel<PeerMsg>>>>>)> {
        let body = self.lookup(task_id)?;
        let mut caller_ends = Vec::with_capacity(n);
        let mut task_ends = Vec::with_capacity(n);
        for _ in 0..n {
            let caller_tag = self.tags.alloc()?;
            let task_tag = self.tags.alloc()?;
            let (caller_end, task_end) = Channel::duplex(caller_tag, task_tag, self.poll_delay);
            caller_ends.push(caller_end);
            task_ends.push(task_end);
        }

        for (group_id, task_end) in task_ends.into_iter().enumerate() {
            let info = TaskInfo {
                group_size: n,
                group_id,
                rank: self.rank,
            };
            let body = body.clone();
            let handle = tokio::spawn(body(info, task_end));
            self.pending.lock().push(handle);
        }

        let mesh = match &peer_body {
            Some(_) => Some(pairwise_mesh::<PeerMsg>(n, self.poll_delay)),
            None => None,
        };
        Ok((caller_ends, mesh))
    }

    /// The task manager's main loop (spec §4.1): dispatches `Spawn`/
    /// `SpawnGroup` requests arriving on `commands` until a `Quit` command
    /// arrives, then drains every worker before returning. Ground truth:
    /// `mpi2/task-manager_impl.cc::TaskManager::run`'s receive-dispatch-or-
    /// quit loop, whose `shutdown()` on the `QUIT` branch is `threadPool_
    /// .wait()` — the same drain this loop runs on exit.
    pub async fn run(&self, commands: &mut mpsc::Receiver<Command<Msg>>) -> Result<()> {
        while let Some(cmd) = commands.recv().await {
            match cmd {
                Command::Spawn { task_id, reply } => {
                    let _ = reply.send(self.spawn(&task_id));
                }
                Command::SpawnGroup { task_id, n, reply } => {
                    let _ = reply.send(self.spawn_group(&task_id, n));
                }
                Command::Quit => break,
            }
        }
        self.drain().await
    }

    /// Reap finished task handles, surfacing the first error encountered.
    /// A panicking task is logged and treated as a closed channel rather
    /// than propagated as a Rust panic (spec §4.1 failure semantics).
    pub async fn drain(&self) -> Result<()> {
        let handles: Vec<_> = std::mem::take(&mut *self.pending.lock());
        for h in handles {
            match h.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(join_err) => {
                    tracing::warn!(?join_err, "task panicked; treating its channel as closed");
                }
            }
        }
        Ok(())
    }
}

/// One request the dispatch loop (`TaskManager::run`) accepts (spec §4.1's
/// `TaskRequest`): spawn a single task, spawn a task group, or shut down.
/// `Spawn`/`SpawnGroup` carry a `oneshot` reply standing in for the
/// source's synchronous `world_.send`/`world_.recv` round trip back to
/// whoever issued the request.
pub enum Command<Msg: Send + 'static> {
    Spawn {
        task_id: String,
        reply: oneshot::Sender<Result<Channel<Msg>>>,
    },
    SpawnGroup {
        task_id: String,
        n: usize,
        reply: oneshot::Sender<Result<Vec<Channel<Msg>>>>,
    },
    /// Spec §4.1's `TASK_ID_QUIT`: terminates the loop after all workers drain.
    Quit,
}

/// Spawn a task group identically across every rank of a simulated cluster
/// (`spawnAll`, spec §4.1). Each node's `TaskManager` must have `task_id`
/// registered.
pub fn spawn_all<Msg: Send + 'static>(
    cluster: &[Arc<TaskManager<Msg>>],
    task_id: &str,
    tasks_per_rank: usize,
) -> Result<Vec<Vec<Channel<Msg>>>> {
    cluster
        .iter()
        .map(|tm| tm.spawn_group(task_id, tasks_per_rank))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn unknown_task_id_is_recoverable() {
        let tm: TaskManager<i32> = TaskManager::new(0);
        let err = tm.spawn("does-not-exist");
        assert!(matches!(
            err,
            Err(MfError::RemoteCall(RemoteCallError::UnknownTaskId(_)))
        ));
    }

    #[tokio::test]
    async fn spawn_runs_registered_body_and_echoes() {
        let tm: TaskManager<i32> = TaskManager::new(0);
        tm.register(
            "echo",
            Arc::new(|_info, mut ch: Channel<i32>| {
                Box::pin(async move {
                    if let Some(msg) = ch.recv().await {
                        ch.send(msg * 2).ok();
                    }
                    Ok(())
                })
            }),
        );
        let mut ch = tm.spawn("echo").unwrap();
        ch.send(21).ok();
        assert_eq!(ch.recv().await, Some(42));
        tm.drain().await.unwrap();
    }

    #[tokio::test]
    async fn spawn_group_launches_n_tasks_with_distinct_group_ids() {
        let tm: TaskManager<i32> = TaskManager::new(0);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let counter = Arc::new(AtomicUsize::new(0));
        tm.register(
            "count",
            Arc::new(move |info: TaskInfo, _ch: Channel<i32>| {
                let seen = seen2.clone();
                let counter = counter.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    seen.lock().push(info.group_id);
                    Ok(())
                })
            }),
        );
        let _channels = tm.spawn_group("count", 4).unwrap();
        tm.drain().await.unwrap();
        let mut ids = seen.lock().clone();
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn quit_terminates_the_dispatch_loop_after_draining_workers() {
        let tm: Arc<TaskManager<i32>> = Arc::new(TaskManager::new(0));
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        tm.register(
            "bump",
            Arc::new(move |_info, _ch: Channel<i32>| {
                let ran = ran2.clone();
                Box::pin(async move {
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }),
        );

        let (tx, mut rx) = mpsc::channel(4);
        let loop_tm = tm.clone();
        let loop_handle = tokio::spawn(async move { loop_tm.run(&mut rx).await });

        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(Command::Spawn { task_id: "bump".into(), reply: reply_tx }).await.unwrap();
        reply_rx.await.unwrap().unwrap();

        tx.send(Command::Quit).await.unwrap();
        loop_handle.await.unwrap().unwrap();

        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
