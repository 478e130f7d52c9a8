use super::*;
use bloom::BloomFilter;
use bundle::{Bundle, BundleId, MetaBundle};
use config::Config;
use eid::Eid;
use events::{AbortReason, Event, EventBus, EventKind, EventReceiver};
use extension::{Endpoint, Extension};
use neighbor::NeighborDatabase;
use std::{
    collections::HashMap,
    sync::{
        Mutex, RwLock,
        atomic::{AtomicU64, Ordering},
    },
};
use storage::BundleStorage;
use summary::BundleSet;
use task_pool::TaskPool;
use task_queue::TaskQueue;
use thiserror::Error;
use time::OffsetDateTime;
use transport::Transport;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Neighbor(#[from] neighbor::Error),

    #[error(transparent)]
    Storage(#[from] storage::Error),

    #[error(transparent)]
    Transport(#[from] transport::Error),

    #[error(transparent)]
    Custody(#[from] custody::Error),

    #[error(transparent)]
    Handshake(#[from] handshake::Error),
}

impl Error {
    pub fn is_no_bundle_found(&self) -> bool {
        matches!(self, Error::Storage(storage::Error::NoBundleFound))
    }
}

/// A bundle to transfer: either already loaded, or only known by id.
#[derive(Debug, Clone)]
pub enum BundleRef {
    Bundle(Bundle),
    Id(BundleId),
}

impl From<Bundle> for BundleRef {
    fn from(value: Bundle) -> Self {
        BundleRef::Bundle(value)
    }
}

impl From<BundleId> for BundleRef {
    fn from(value: BundleId) -> Self {
        BundleRef::Id(value)
    }
}

impl From<&BundleId> for BundleRef {
    fn from(value: &BundleId) -> Self {
        BundleRef::Id(value.clone())
    }
}

#[derive(Debug)]
enum Task {
    Store {
        bundle: Bundle,
        origin: Option<Eid>,
    },
    Deliver {
        meta: MetaBundle,
    },
    Expire {
        ids: Vec<BundleId>,
    },
}

const ROUTER_EVENTS: &[EventKind] = EventKind::ALL;

/// Owns the shared routing state and fans events out to the extensions.
///
/// Received and generated bundles are stored and deduplicated against the
/// set of known bundles before being raised again as [`Event::Queued`].
/// Bundles for local endpoints stop here, everything else is offered to
/// every registered [`Extension`].
pub struct BaseRouter {
    local: Eid,
    config: Config,
    storage: Arc<dyn BundleStorage>,
    transport: Arc<dyn Transport>,
    bus: Arc<EventBus>,
    neighbors: NeighborDatabase,
    known: Mutex<BundleSet>,
    purged: Mutex<BundleSet>,
    extensions: RwLock<Vec<Arc<dyn Extension>>>,
    endpoints: RwLock<HashMap<Eid, Arc<dyn Endpoint>>>,
    tasks: TaskQueue<Task>,
    pool: TaskPool,
    sequence: AtomicU64,
}

impl BaseRouter {
    pub fn new(
        config: &Config,
        local: Eid,
        storage: Arc<dyn BundleStorage>,
        transport: Arc<dyn Transport>,
        bus: Arc<EventBus>,
    ) -> Arc<Self> {
        let summary = || {
            Mutex::new(BundleSet::new(
                config.summary_vector_length,
                BloomFilter::DEFAULT_HASHES,
            ))
        };

        Arc::new(Self {
            local: local.node(),
            config: config.clone(),
            storage,
            transport,
            bus,
            neighbors: NeighborDatabase::new(config.max_transfers_per_neighbor),
            known: summary(),
            purged: summary(),
            extensions: RwLock::new(Vec::new()),
            endpoints: RwLock::new(HashMap::new()),
            tasks: TaskQueue::new(),
            pool: TaskPool::new(),
            sequence: AtomicU64::new(0),
        })
    }

    /// Binds the router to the event bus and starts its worker and clock.
    pub fn start(self: &Arc<Self>) {
        describe_metrics();

        self.bus.bind_all(ROUTER_EVENTS, self.clone());

        let router = self.clone();
        self.pool.spawn("router", async move {
            task_queue::drain("router", &router.tasks, |task| router.execute(task)).await
        });

        if self.config.tick_interval > 0 {
            let router = self.clone();
            let cancel_token = self.pool.cancel_token().clone();
            let period = std::time::Duration::from_secs(self.config.tick_interval);
            self.pool.spawn("clock", async move {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = interval.tick() => router.bus.raise(Event::TimeTick {
                            now: OffsetDateTime::now_utc(),
                        }),
                        _ = cancel_token.cancelled() => break,
                    }
                }
            });
        }

        info!("Router for {} started", self.local);
    }

    #[cfg_attr(feature = "instrument", instrument(skip(self)))]
    pub async fn shutdown(self: &Arc<Self>) {
        let receiver: Arc<dyn EventReceiver> = self.clone();
        self.bus.unbind_all(&receiver);

        let extensions =
            std::mem::take(&mut *self.extensions.write().trace_expect("Failed to lock mutex"));
        for extension in extensions {
            trace!("Shutting down {} extension", extension.name());
            extension.shutdown().await;
        }
        self.endpoints
            .write()
            .trace_expect("Failed to lock mutex")
            .clear();

        self.tasks.abort();
        self.pool.shutdown().await;

        // Nothing is in flight any more
        self.neighbors.release_all();

        info!("Router for {} stopped", self.local);
    }

    pub fn add_extension(&self, extension: Arc<dyn Extension>) {
        info!("Adding {} routing extension", extension.name());
        self.extensions
            .write()
            .trace_expect("Failed to lock mutex")
            .push(extension);
    }

    pub fn extensions(&self) -> Vec<Arc<dyn Extension>> {
        self.extensions
            .read()
            .trace_expect("Failed to lock mutex")
            .clone()
    }

    pub fn register_endpoint(&self, eid: Eid, endpoint: Arc<dyn Endpoint>) {
        debug!("Registered local endpoint {eid}");
        self.endpoints
            .write()
            .trace_expect("Failed to lock mutex")
            .insert(eid, endpoint);
    }

    pub fn unregister_endpoint(&self, eid: &Eid) {
        self.endpoints
            .write()
            .trace_expect("Failed to lock mutex")
            .remove(eid);
    }

    pub fn local(&self) -> &Eid {
        &self.local
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn neighbors(&self) -> &NeighborDatabase {
        &self.neighbors
    }

    pub fn storage(&self) -> &Arc<dyn BundleStorage> {
        &self.storage
    }

    /// Returns `true` for singleton bundles addressed to this node.
    pub fn is_local(&self, meta: &MetaBundle) -> bool {
        meta.flags.singleton && meta.destination.same_node(&self.local)
    }

    /// A fresh id for a bundle generated by this node.
    pub fn next_bundle_id(&self, source: Eid, now: OffsetDateTime) -> BundleId {
        BundleId::new(
            source,
            now.unix_timestamp().max(0) as u64,
            self.sequence.fetch_add(1, Ordering::Relaxed),
        )
    }

    pub async fn get_bundle(&self, id: &BundleId) -> Result<Bundle, Error> {
        Ok(self.storage.get(id).await?)
    }

    /// Hands a bundle to the transport for `peer`, loading it first if only
    /// the id is given.
    ///
    /// A bundle missing from the store fails with
    /// `Error::Storage(storage::Error::NoBundleFound)`; that is not retried here.
    #[cfg_attr(feature = "instrument", instrument(skip(self, bundle)))]
    pub async fn transfer_to(&self, peer: &Eid, bundle: BundleRef) -> Result<(), Error> {
        let bundle = match bundle {
            BundleRef::Bundle(bundle) => bundle,
            BundleRef::Id(id) => self.storage.get(&id).await?,
        };
        trace!("Queuing bundle {} for {peer}", bundle.meta.id);
        self.transport.queue(peer, bundle).await?;
        metrics::counter!("router.transfers.queued").increment(1);
        Ok(())
    }

    /// Acquires a transfer slot on `peer` for `id` and transfers it.
    ///
    /// The slot is released again if the transfer cannot be queued; otherwise
    /// it is released when the outcome event arrives.
    pub async fn forward(&self, peer: &Eid, id: &BundleId) -> Result<(), Error> {
        self.neighbors.acquire_transfer(peer, id)?;
        if let Err(e) = self.transfer_to(peer, id.into()).await {
            self.neighbors.release_transfer(peer, id);
            return Err(e);
        }
        Ok(())
    }

    /// The summary vector over every bundle known to this node.
    pub fn summary_vector(&self) -> BloomFilter {
        self.known.lock().trace_expect("Failed to lock mutex").vector()
    }

    /// Changes whenever the set of known bundles changes.
    pub fn summary_generation(&self) -> u64 {
        self.known
            .lock()
            .trace_expect("Failed to lock mutex")
            .generation()
    }

    pub fn is_known(&self, id: &BundleId) -> bool {
        self.known
            .lock()
            .trace_expect("Failed to lock mutex")
            .contains(id)
    }

    /// The purge vector: bundles deleted here that neighbors may delete too.
    pub fn purged_bundles(&self) -> BloomFilter {
        self.purged
            .lock()
            .trace_expect("Failed to lock mutex")
            .vector()
    }

    pub fn is_purged(&self, id: &BundleId) -> bool {
        self.purged
            .lock()
            .trace_expect("Failed to lock mutex")
            .contains(id)
    }

    /// Returns `false` if the bundle was already in the purge vector.
    pub fn add_purged_bundle(&self, meta: &MetaBundle, now: OffsetDateTime) -> bool {
        let expires = now.saturating_add(time::Duration::seconds(
            self.config.epidemic.purge_retention as i64,
        ));
        let added = self
            .purged
            .lock()
            .trace_expect("Failed to lock mutex")
            .add(&meta.id, expires);
        if added {
            metrics::counter!("router.bundles.purged").increment(1);
        }
        added
    }

    /// Drops purge vector entries older than the retention window.
    pub fn expire_purged(&self, now: OffsetDateTime) -> usize {
        self.purged
            .lock()
            .trace_expect("Failed to lock mutex")
            .expire(now)
            .len()
    }

    fn notify_extensions(&self, event: &Event) {
        for extension in self.extensions() {
            extension.notify(event);
        }
    }

    async fn execute(&self, task: Task) -> Result<(), Error> {
        match task {
            Task::Store { bundle, origin } => {
                let meta = bundle.meta.clone();

                // Handshakes stay out of the summary vector and are never carried on
                if meta.id.source.is_service(&handshake::ROUTING) {
                    if !self.is_local(&meta) {
                        debug!("Dropping handshake {} for {}", meta.id, meta.destination);
                        return Ok(());
                    }
                    self.storage.store(bundle).await?;
                    self.bus.raise(Event::Queued { meta, origin });
                    return Ok(());
                }

                self.storage.store(bundle).await?;

                let added = self
                    .known
                    .lock()
                    .trace_expect("Failed to lock mutex")
                    .add(&meta.id, meta.expiry);
                if added {
                    self.bus.raise(Event::Queued { meta, origin });
                } else {
                    debug!("Bundle {} is already known", meta.id);
                }
                Ok(())
            }
            Task::Deliver { meta } => {
                let endpoint = self
                    .endpoints
                    .read()
                    .trace_expect("Failed to lock mutex")
                    .get(&meta.destination)
                    .cloned();
                let Some(endpoint) = endpoint else {
                    debug!(
                        "No endpoint registered for {}, keeping bundle {}",
                        meta.destination, meta.id
                    );
                    return Ok(());
                };

                let bundle = self.storage.get(&meta.id).await?;
                endpoint.deliver(bundle);
                match self.storage.remove(&meta.id).await {
                    Ok(_) | Err(storage::Error::NoBundleFound) => Ok(()),
                    Err(e) => Err(e.into()),
                }
            }
            Task::Expire { ids } => {
                for id in ids {
                    match self.storage.remove(&id).await {
                        Ok(_) => debug!("Bundle {id} expired"),
                        Err(storage::Error::NoBundleFound) => {}
                        Err(e) => warn!("Failed to remove expired bundle {id}: {e}"),
                    }
                    self.bus.raise(Event::BundleExpired { id });
                }
                Ok(())
            }
        }
    }
}

impl EventReceiver for BaseRouter {
    fn raise_event(&self, event: &Event) {
        match event {
            Event::BundleReceived { bundle, peer } => {
                self.tasks.push(Task::Store {
                    bundle: bundle.clone(),
                    origin: peer.clone(),
                });
                return;
            }
            Event::BundleGenerated { bundle } => {
                self.tasks.push(Task::Store {
                    bundle: bundle.clone(),
                    origin: None,
                });
                return;
            }
            Event::Queued { meta, .. } if self.is_local(meta) => {
                self.tasks.push(Task::Deliver { meta: meta.clone() });
                return;
            }
            Event::TimeTick { now } => {
                let expired = self
                    .known
                    .lock()
                    .trace_expect("Failed to lock mutex")
                    .expire(*now);
                if !expired.is_empty() {
                    trace!("{} known bundles expired", expired.len());
                    self.tasks.push(Task::Expire { ids: expired });
                }
                for peer in self.neighbors.expire(*now) {
                    debug!("Summary vector of {peer} expired");
                }
            }
            Event::TransferCompleted { peer, meta } => {
                self.neighbors.release_transfer(peer, &meta.id);

                // Assume the peer has it now
                _ = self.neighbors.add_bundle(peer, &meta.id);
                metrics::counter!("router.transfers.completed").increment(1);
            }
            Event::TransferAborted { peer, id, reason } => {
                self.neighbors.release_transfer(peer, id);

                // The peer refused because it holds the bundle already
                if *reason == AbortReason::Refused {
                    _ = self.neighbors.add_bundle(peer, id);
                }
                metrics::counter!("router.transfers.aborted").increment(1);
            }
            Event::Requeue { peer, id } => {
                self.neighbors.release_transfer(peer, id);
            }
            Event::NodeAvailable { node } => {
                self.neighbors
                    .set_available(node, OffsetDateTime::now_utc());
            }
            Event::ConnectionUp { peer } => {
                self.neighbors
                    .set_available(peer, OffsetDateTime::now_utc());
            }
            Event::NodeUnavailable { node } => {
                let released = self
                    .neighbors
                    .set_unavailable(node, OffsetDateTime::now_utc());
                if !released.is_empty() {
                    debug!("Released {} transfers to {node}", released.len());
                }
            }
            Event::BundleExpired { id } => {
                self.known
                    .lock()
                    .trace_expect("Failed to lock mutex")
                    .remove(id);
                self.neighbors.release_bundle(id);
                self.neighbors.forget_bundle(id);
            }
            Event::BundleDeleted { id } => {
                self.neighbors.release_bundle(id);
                self.neighbors.forget_bundle(id);
            }
            _ => {}
        }
        self.notify_extensions(event);
    }
}

fn describe_metrics() {
    metrics::describe_counter!(
        "router.transfers.queued",
        "Bundles handed to the transport"
    );
    metrics::describe_counter!(
        "router.transfers.completed",
        "Transfers reported complete"
    );
    metrics::describe_counter!("router.transfers.aborted", "Transfers reported aborted");
    metrics::describe_counter!(
        "router.bundles.purged",
        "Bundles added to the purge vector"
    );
    metrics::describe_counter!("router.retransmissions", "Transfers retried after a failure");
    metrics::describe_counter!(
        "router.retransmissions.exhausted",
        "Transfers abandoned at the retry limit"
    );
    metrics::describe_counter!("router.custody.accepted", "Custody transfers accepted");
    metrics::describe_counter!("router.custody.rejected", "Custody transfers rejected");
    metrics::describe_counter!(
        "router.custody.expired",
        "Custody timers that fired without a signal"
    );
    metrics::describe_counter!("router.handshakes.sent", "Node handshake bundles sent");
}
