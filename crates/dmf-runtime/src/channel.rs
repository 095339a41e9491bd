use std::time::Duration;

use tokio::sync::mpsc;

use crate::tag::Tag;

/// Default economic-wait poll delay (spec §4.1: "the *pollDelay*,
/// configurable, default 0 μs").
pub const DEFAULT_POLL_DELAY: Duration = Duration::from_micros(0);

/// A point-to-point duplex channel between two task endpoints.
///
/// Spec §4.1: "Channels expose blocking send/recv, async isend/irecv, and
/// *economic* variants that poll the request at a fixed delay ... while
/// yielding the thread". `mpsc::UnboundedSender`/`Receiver` give us FIFO
/// ordering for free (spec §5: "Per-channel messages preserve FIFO send
/// order"); the economic variants are a thin `try_recv` + sleep loop on top.
pub struct Channel<T> {
    pub local: Tag,
    pub remote: Tag,
    tx: mpsc::UnboundedSender<T>,
    rx: mpsc::UnboundedReceiver<T>,
    poll_delay: Duration,
}

impl<T> Channel<T> {
    /// Build a connected duplex pair: `a`'s sends are `b`'s receives and
    /// vice versa, wired with the tags the `TaskManager` allocated for each
    /// endpoint.
    pub fn duplex(local: Tag, remote: Tag, poll_delay: Duration) -> (Channel<T>, Channel<T>) {
        let (tx_ab, rx_ab) = mpsc::unbounded_channel();
        let (tx_ba, rx_ba) = mpsc::unbounded_channel();
        let a = Channel {
            local,
            remote,
            tx: tx_ab,
            rx: rx_ba,
            poll_delay,
        };
        let b = Channel {
            local: remote,
            remote: local,
            tx: tx_ba,
            rx: rx_ab,
            poll_delay,
        };
        (a, b)
    }

    /// Blocking send. All multi-arg sends the caller wants atomically
    /// observed should be marshalled into one `T` before calling this
    /// (spec §4.1: "marshalled into a single logical message").
    pub fn send(&self, msg: T) -> Result<(), mpsc::error::SendError<T>> {
        self.tx.send(msg)
    }

    /// Blocking recv: awaits until a message is available or the peer
    /// drops its sender.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Economic recv: polls at `poll_delay` and yields the thread between
    /// polls instead of parking on a waker immediately. This is the
    /// primary back-pressure / cooperative-scheduling mechanism (spec §5).
    pub async fn recv_economic(&mut self) -> Option<T> {
        loop {
            match self.rx.try_recv() {
                Ok(msg) => return Some(msg),
                Err(mpsc::error::TryRecvError::Empty) => {
                    if self.poll_delay.is_zero() {
                        tokio::task::yield_now().await;
                    } else {
                        tokio::time::sleep(self.poll_delay).await;
                    }
                }
                Err(mpsc::error::TryRecvError::Disconnected) => return None,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

/// An `n x n` mesh of duplex channels for a task group (spec §4.1: "every
/// member receives an `n×n` endpoint matrix from which it builds its own
/// `n` peer channels"). `channels[i]` holds task `i`'s `n` peer endpoints;
/// `channels[i][i]` is `None` (self-entry is inactive).
pub fn pairwise_mesh<T>(n: usize, poll_delay: Duration) -> Vec<Vec<Option<Channel<T>>>> {
    let mut grid: Vec<Vec<Option<Channel<T>>>> = (0..n).map(|_| (0..n).map(|_| None).collect()).collect();
    let mut next_tag = 0u64;
    for i in 0..n {
        for j in (i + 1)..n {
            let t_i = Tag(next_tag);
            next_tag += 1;
            let t_j = Tag(next_tag);
            next_tag += 1;
            let (a, b) = Channel::duplex(t_i, t_j, poll_delay);
            grid[i][j] = Some(a);
            grid[j][i] = Some(b);
        }
    }
    grid
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplex_preserves_fifo_order() {
        let (mut a, mut b) = Channel::<i32>::duplex(Tag(0), Tag(1), DEFAULT_POLL_DELAY);
        a.send(1).unwrap();
        a.send(2).unwrap();
        a.send(3).unwrap();
        assert_eq!(b.recv().await, Some(1));
        assert_eq!(b.recv().await, Some(2));
        assert_eq!(b.recv().await, Some(3));
    }

    #[tokio::test]
    async fn economic_recv_waits_for_a_late_send() {
        let (a, mut b) = Channel::<i32>::duplex(Tag(0), Tag(1), Duration::from_micros(50));
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            a.send(42).unwrap();
        });
        assert_eq!(b.recv_economic().await, Some(42));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn pairwise_mesh_has_no_self_channel() {
        let grid = pairwise_mesh::<i32>(4, DEFAULT_POLL_DELAY);
        for i in 0..4 {
            assert!(grid[i][i].is_none());
            for j in 0..4 {
                if i != j {
                    assert!(grid[i][j].is_some());
                }
            }
        }
    }
}
