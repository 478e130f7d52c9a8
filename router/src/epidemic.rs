use super::*;
use bundle::MetaBundle;
use eid::Eid;
use events::{AbortReason, Event, HandshakeState};
use extension::Extension;
use handshake::{NodeHandshake, SUMMARY_VECTOR};
use router::BaseRouter;
use search::Mode;
use std::sync::Mutex;
use task_pool::TaskPool;
use task_queue::TaskQueue;
use time::OffsetDateTime;

#[derive(Debug)]
enum Task {
    SearchNextBundle(Eid),
    TransferCompleted(Eid, MetaBundle),
    Maintain(OffsetDateTime),
}

#[derive(Debug, Default)]
struct Announcements {
    // Set after a local store or delete, forces a check on the next tick
    dirty: bool,
    generation: Option<u64>,
    last: Option<OffsetDateTime>,
    new_neighbors: Vec<Eid>,
}

/// Epidemic dissemination with summary vector anti-entropy.
///
/// Every available neighbor is offered the stored bundles its summary vector
/// does not list. The vectors themselves travel over the node handshake: this
/// extension asks for them in handshake requests and announces its own when
/// the set of known bundles changes.
pub struct EpidemicExtension {
    router: Arc<BaseRouter>,
    queue: TaskQueue<Task>,
    pool: TaskPool,
    announcements: Mutex<Announcements>,
}

impl EpidemicExtension {
    pub fn new(router: Arc<BaseRouter>) -> Arc<Self> {
        let extension = Arc::new(Self {
            router,
            queue: TaskQueue::new(),
            pool: TaskPool::new(),
            announcements: Mutex::new(Announcements::default()),
        });

        let worker = extension.clone();
        extension.pool.spawn("epidemic", async move {
            task_queue::drain("epidemic", &worker.queue, |task| worker.execute(task)).await
        });
        extension
    }

    async fn execute(&self, task: Task) -> Result<(), router::Error> {
        match task {
            Task::SearchNextBundle(peer) => self.search(&peer).await,
            Task::TransferCompleted(peer, meta) => self.transfer_completed(&peer, &meta).await,
            Task::Maintain(now) => {
                self.maintain(now);
                Ok(())
            }
        }
    }

    fn search_all(&self) {
        for peer in self.router.neighbors().available() {
            self.queue.push(Task::SearchNextBundle(peer));
        }
    }

    fn set_dirty(&self) {
        self.announcements
            .lock()
            .trace_expect("Failed to lock mutex")
            .dirty = true;
    }

    #[cfg_attr(feature = "instrument", instrument(skip(self)))]
    async fn search(&self, peer: &Eid) -> Result<(), router::Error> {
        if !self.router.neighbors().is_available(peer) {
            trace!("Not searching for {peer}, it is not available");
            return Ok(());
        }

        // Without a summary vector only what is addressed to the peer goes
        let mode = match self.router.neighbors().get_bundles(peer) {
            Ok(_) => Mode::Epidemic,
            Err(_) => {
                self.router.bus().raise(Event::Handshake {
                    state: HandshakeState::Request,
                    peer: peer.clone(),
                });
                Mode::Unicast
            }
        };

        search::transfer_bundles(
            &self.router,
            peer,
            mode,
            self.router.config().epidemic.search_limit,
        )
        .await?;
        Ok(())
    }

    async fn transfer_completed(&self, peer: &Eid, meta: &MetaBundle) -> Result<(), router::Error> {
        // Delivered to its only destination, no need to keep it
        if meta.flags.singleton && meta.destination.same_node(peer) {
            match self.router.storage().remove(&meta.id).await {
                Ok(_) => {
                    info!("Bundle {} delivered to {peer}, purging", meta.id);
                    self.router
                        .add_purged_bundle(meta, OffsetDateTime::now_utc());
                    self.router.bus().raise(Event::BundleDeleted {
                        id: meta.id.clone(),
                    });
                }
                Err(storage::Error::NoBundleFound) => {
                    trace!("Bundle {} already removed", meta.id);
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.search(peer).await
    }

    fn maintain(&self, now: OffsetDateTime) {
        let expired = self.router.expire_purged(now);
        if expired > 0 {
            trace!("{expired} purge vector entries expired");
        }

        let interval =
            time::Duration::seconds(self.router.config().epidemic.announce_interval as i64);
        let targets = {
            let mut announcements = self
                .announcements
                .lock()
                .trace_expect("Failed to lock mutex");
            let due = announcements
                .last
                .is_none_or(|last| last.saturating_add(interval) <= now);
            if !announcements.dirty && !due {
                return;
            }
            announcements.dirty = false;
            announcements.last = Some(now);

            let new_neighbors = std::mem::take(&mut announcements.new_neighbors);
            let generation = self.router.summary_generation();
            if announcements.generation != Some(generation) {
                announcements.generation = Some(generation);
                self.router.neighbors().available()
            } else {
                new_neighbors
            }
        };

        for peer in targets {
            if self.router.neighbors().is_available(&peer) {
                self.router.bus().raise(Event::Handshake {
                    state: HandshakeState::Announce,
                    peer,
                });
            }
        }
    }
}

#[async_trait]
impl Extension for EpidemicExtension {
    fn name(&self) -> &'static str {
        "epidemic"
    }

    fn notify(&self, event: &Event) {
        match event {
            Event::Queued { .. } => {
                self.set_dirty();
                self.search_all();
            }
            Event::Handshake {
                state: HandshakeState::Completed | HandshakeState::Updated,
                peer,
            } => self.queue.push(Task::SearchNextBundle(peer.clone())),
            Event::TransferCompleted { peer, meta } => self
                .queue
                .push(Task::TransferCompleted(peer.clone(), meta.clone())),
            Event::TransferAborted {
                peer,
                reason:
                    AbortReason::Refused | AbortReason::RetryLimitReached | AbortReason::BundleDeleted,
                ..
            } => self.queue.push(Task::SearchNextBundle(peer.clone())),
            Event::NodeAvailable { node: peer } | Event::ConnectionUp { peer } => {
                self.announcements
                    .lock()
                    .trace_expect("Failed to lock mutex")
                    .new_neighbors
                    .push(peer.clone());
                self.queue.push(Task::SearchNextBundle(peer.clone()));
            }
            Event::BundleDeleted { .. } => self.set_dirty(),
            Event::TimeTick { now } => self.queue.push(Task::Maintain(*now)),
            _ => {}
        }
    }

    fn request_handshake(&self, _peer: &Eid, request: &mut NodeHandshake) {
        request.add_request(SUMMARY_VECTOR);
    }

    async fn shutdown(&self) {
        self.queue.abort();
        self.pool.shutdown().await;
    }
}
