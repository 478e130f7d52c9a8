use super::*;
use bundle::{BundleId, MetaBundle};
use eid::Eid;
use events::{AbortReason, Event};
use extension::Extension;
use router::BaseRouter;
use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
};
use task_pool::TaskPool;
use task_queue::TaskQueue;

#[derive(Debug)]
enum Task {
    Route(MetaBundle),
    Flush(Eid),
    Delivered(Eid, BundleId),
    Aborted(Eid, BundleId),
    Forget(BundleId),
}

/// Direct delivery to neighbors.
///
/// A bundle whose destination node is a neighbor goes straight to it,
/// without consulting summary vectors. If the neighbor is not reachable yet
/// the bundle waits for it, and is retried every time the neighbor shows up.
/// A transfer to the neighbor that breaks off puts the bundle back to wait.
pub struct NeighborRoutingExtension {
    router: Arc<BaseRouter>,
    pending: Mutex<HashMap<Eid, VecDeque<BundleId>>>,
    queue: TaskQueue<Task>,
    pool: TaskPool,
}

impl NeighborRoutingExtension {
    pub fn new(router: Arc<BaseRouter>) -> Arc<Self> {
        let extension = Arc::new(Self {
            router,
            pending: Mutex::new(HashMap::new()),
            queue: TaskQueue::new(),
            pool: TaskPool::new(),
        });

        let worker = extension.clone();
        extension.pool.spawn("neighbor_routing", async move {
            task_queue::drain("neighbor_routing", &worker.queue, |task| worker.execute(task))
                .await
        });
        extension
    }

    /// Bundles waiting for `node` to become reachable.
    pub fn pending(&self, node: &Eid) -> Vec<BundleId> {
        self.pending
            .lock()
            .trace_expect("Failed to lock mutex")
            .get(node)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn requeue(&self, node: &Eid, id: BundleId) {
        let mut pending = self.pending.lock().trace_expect("Failed to lock mutex");
        let queue = pending.entry(node.clone()).or_default();
        if !queue.contains(&id) {
            queue.push_back(id);
        }
    }

    async fn execute(&self, task: Task) -> Result<(), router::Error> {
        match task {
            Task::Route(meta) => {
                let node = meta.destination.node();
                if meta.destination.is_none() || node.same_node(self.router.local()) {
                    return Ok(());
                }
                if !meta.flags.singleton || meta.hop_limit == Some(0) {
                    return Ok(());
                }
                self.send(&node, meta.id).await
            }
            Task::Flush(node) => {
                let waiting = self
                    .pending
                    .lock()
                    .trace_expect("Failed to lock mutex")
                    .remove(&node)
                    .unwrap_or_default();
                if !waiting.is_empty() {
                    debug!("Retrying {} bundles for {node}", waiting.len());
                }
                for id in waiting {
                    if let Err(e) = self.send(&node, id).await {
                        debug!("Failed to send to {node}: {e}");
                    }
                }
                Ok(())
            }
            Task::Delivered(node, id) => {
                if let Some(queue) = self
                    .pending
                    .lock()
                    .trace_expect("Failed to lock mutex")
                    .get_mut(&node)
                {
                    queue.retain(|i| *i != id);
                }
                Ok(())
            }
            Task::Aborted(peer, id) => {
                let meta = match self.router.get_bundle(&id).await {
                    Ok(bundle) => bundle.meta,
                    Err(e) if e.is_no_bundle_found() => return Ok(()),
                    Err(e) => return Err(e),
                };
                if meta.flags.singleton && meta.destination.same_node(&peer) {
                    debug!("Transfer of {id} to {peer} aborted, waiting for it again");
                    self.requeue(&peer.node(), id);
                }
                Ok(())
            }
            Task::Forget(id) => {
                for queue in self
                    .pending
                    .lock()
                    .trace_expect("Failed to lock mutex")
                    .values_mut()
                {
                    queue.retain(|i| *i != id);
                }
                Ok(())
            }
        }
    }

    #[cfg_attr(feature = "instrument", instrument(skip(self)))]
    async fn send(&self, node: &Eid, id: BundleId) -> Result<(), router::Error> {
        let neighbors = self.router.neighbors();
        if !neighbors.is_available(node) {
            trace!("Bundle {id} waits for {node}");
            self.requeue(node, id);
            return Ok(());
        }
        if neighbors.has(node, &id, false) == Ok(true) {
            return Ok(());
        }

        match self.router.forward(node, &id).await {
            Ok(()) => Ok(()),
            Err(router::Error::Neighbor(neighbor::Error::AlreadyInTransit(_))) => Ok(()),
            Err(
                router::Error::Neighbor(
                    neighbor::Error::NoMoreTransfersAvailable(_)
                    | neighbor::Error::NeighborNotAvailable(_),
                )
                | router::Error::Transport(transport::Error::Unreachable(_)),
            ) => {
                self.requeue(node, id);
                Ok(())
            }
            Err(e) if e.is_no_bundle_found() => {
                trace!("Bundle {id} is gone, dropping it");
                Ok(())
            }
            Err(e) => {
                self.requeue(node, id);
                Err(e)
            }
        }
    }
}

#[async_trait]
impl Extension for NeighborRoutingExtension {
    fn name(&self) -> &'static str {
        "neighbor_routing"
    }

    fn notify(&self, event: &Event) {
        match event {
            Event::Queued { meta, .. } => self.queue.push(Task::Route(meta.clone())),
            Event::NodeAvailable { node: peer } | Event::ConnectionUp { peer } => {
                self.queue.push(Task::Flush(peer.node()))
            }
            Event::TransferCompleted { peer, meta } => {
                self.queue
                    .push(Task::Delivered(peer.node(), meta.id.clone()));
                self.queue.push(Task::Flush(peer.node()));
            }
            Event::TransferAborted {
                peer,
                id,
                reason: AbortReason::ConnectionDown | AbortReason::Undefined,
            } => self.queue.push(Task::Aborted(peer.clone(), id.clone())),
            Event::BundleExpired { id } | Event::BundleDeleted { id } => {
                self.queue.push(Task::Forget(id.clone()))
            }
            _ => {}
        }
    }

    async fn shutdown(&self) {
        self.queue.abort();
        self.pool.shutdown().await;
    }
}
