use super::*;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Returned by [`TaskQueue::pop`] once the queue has been aborted.
///
/// Workers treat this as a request to shut down cleanly, not as a failure.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Task queue unblocked")]
pub struct Unblocked;

/// A FIFO of tasks drained by exactly one worker.
///
/// `push` never blocks. `pop` blocks until a task is available or the queue
/// is aborted.
pub struct TaskQueue<T> {
    tx: flume::Sender<T>,
    rx: flume::Receiver<T>,
    cancel_token: CancellationToken,
}

impl<T> TaskQueue<T> {
    pub fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            tx,
            rx,
            cancel_token: CancellationToken::new(),
        }
    }

    pub fn push(&self, task: T) {
        if self.cancel_token.is_cancelled() || self.tx.send(task).is_err() {
            trace!("Dropping task pushed to aborted queue");
        }
    }

    pub async fn pop(&self) -> Result<T, Unblocked> {
        tokio::select! {
            biased;
            _ = self.cancel_token.cancelled() => Err(Unblocked),
            r = self.rx.recv_async() => r.map_err(|_| Unblocked),
        }
    }

    /// Unblocks any waiting `pop`, and fails every later one.
    pub fn abort(&self) {
        self.cancel_token.cancel();
        self.rx.drain().for_each(drop);
    }

    pub fn is_aborted(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl<T> Default for TaskQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Pops and executes tasks one at a time until the queue is aborted.
///
/// A failing task is logged and dropped; it never stops the loop.
pub async fn drain<T, F, Fut, E>(name: &'static str, queue: &TaskQueue<T>, mut execute: F)
where
    T: std::fmt::Debug,
    F: FnMut(T) -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: std::fmt::Display,
{
    loop {
        let task = match queue.pop().await {
            Ok(task) => task,
            Err(Unblocked) => {
                debug!("{name} task queue unblocked, worker exiting");
                break;
            }
        };

        trace!("{name} processing {task:?}");

        if let Err(e) = execute(task).await {
            debug!("{name} task failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn fifo() {
        let queue = TaskQueue::new();
        queue.push(1);
        queue.push(2);
        queue.push(3);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop().await, Ok(1));
        assert_eq!(queue.pop().await, Ok(2));
        assert_eq!(queue.pop().await, Ok(3));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn abort_unblocks_pop() {
        let queue = Arc::new(TaskQueue::<u32>::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::task::yield_now().await;
        queue.abort();
        assert_eq!(waiter.await.unwrap(), Err(Unblocked));

        // Later pushes are discarded
        queue.push(7);
        assert!(queue.is_aborted());
        assert_eq!(queue.pop().await, Err(Unblocked));
    }

    #[tokio::test]
    async fn drain_survives_failures() {
        let queue = Arc::new(TaskQueue::new());
        let done = Arc::new(Mutex::new(Vec::new()));
        for i in 0..4u32 {
            queue.push(i);
        }

        let worker = {
            let queue = queue.clone();
            let done = done.clone();
            tokio::spawn(async move {
                drain("test", &queue, |i| {
                    let done = done.clone();
                    async move {
                        if i % 2 == 1 {
                            return Err(format!("odd task {i}"));
                        }
                        done.lock().unwrap().push(i);
                        Ok(())
                    }
                })
                .await
            })
        };

        while !queue.is_empty() {
            tokio::task::yield_now().await;
        }
        tokio::task::yield_now().await;
        queue.abort();
        worker.await.unwrap();
        assert_eq!(*done.lock().unwrap(), vec![0, 2]);
    }
}
