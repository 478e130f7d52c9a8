use super::*;
use eid::Eid;
use events::{AbortReason, Event};
use extension::Extension;
use router::BaseRouter;
use search::Mode;
use task_pool::TaskPool;
use task_queue::TaskQueue;

#[derive(Debug)]
enum Task {
    Search(Eid),
}

/// Offers every stored bundle to every available neighbor.
///
/// Needs no summary vectors: a bundle is sent to a neighbor until that
/// neighbor confirms or refuses it.
pub struct FloodingExtension {
    router: Arc<BaseRouter>,
    queue: TaskQueue<Task>,
    pool: TaskPool,
}

impl FloodingExtension {
    pub fn new(router: Arc<BaseRouter>) -> Arc<Self> {
        let extension = Arc::new(Self {
            router,
            queue: TaskQueue::new(),
            pool: TaskPool::new(),
        });

        let worker = extension.clone();
        extension.pool.spawn("flooding", async move {
            task_queue::drain("flooding", &worker.queue, |task| worker.execute(task)).await
        });
        extension
    }

    async fn execute(&self, task: Task) -> Result<(), router::Error> {
        let Task::Search(peer) = task;
        if !self.router.neighbors().is_available(&peer) {
            return Ok(());
        }
        search::transfer_bundles(
            &self.router,
            &peer,
            Mode::Flood,
            self.router.config().epidemic.search_limit,
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Extension for FloodingExtension {
    fn name(&self) -> &'static str {
        "flooding"
    }

    fn notify(&self, event: &Event) {
        match event {
            Event::Queued { .. } => {
                for peer in self.router.neighbors().available() {
                    self.queue.push(Task::Search(peer));
                }
            }
            Event::NodeAvailable { node: peer }
            | Event::ConnectionUp { peer }
            | Event::TransferCompleted { peer, .. }
            | Event::TransferAborted {
                peer,
                reason:
                    AbortReason::Refused | AbortReason::RetryLimitReached | AbortReason::BundleDeleted,
                ..
            } => self.queue.push(Task::Search(peer.clone())),
            _ => {}
        }
    }

    async fn shutdown(&self) {
        self.queue.abort();
        self.pool.shutdown().await;
    }
}
