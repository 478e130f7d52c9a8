use super::*;
use bundle::{BundleId, CustodySignal, MetaBundle};
use eid::Eid;
use events::{Event, EventBus};
use extension::Extension;
use router::BaseRouter;
use std::{collections::HashMap, sync::Mutex};
use task_pool::TaskPool;
use task_queue::TaskQueue;
use thiserror::Error;
use time::OffsetDateTime;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The signal acknowledges nothing we are waiting for. Duplicate and late
    /// signals are expected.
    #[error("No custody timer matches signal for {0} from {1}")]
    NoTimerFound(BundleId, Eid),

    #[error("Custody of {0} rejected, capacity exhausted")]
    CustodyRejected(BundleId),
}

#[derive(Debug, Clone)]
pub struct CustodyTimer {
    pub node: Eid,
    pub meta: MetaBundle,
    pub deadline: OffsetDateTime,
    pub attempt: u32,
}

/// Armed custody timers, sorted so that the soonest deadline is last.
#[derive(Debug, Default)]
pub struct CustodyTimers {
    timers: Vec<CustodyTimer>,
}

impl CustodyTimers {
    pub fn set_timer(&mut self, timer: CustodyTimer) {
        // Descending deadlines, a new timer goes after those due no later
        let idx = self
            .timers
            .partition_point(|t| t.deadline > timer.deadline);
        self.timers.insert(idx, timer);
    }

    /// Removes the timer the `signal` from `node` acknowledges.
    pub fn remove_timer(&mut self, node: &Eid, signal: &CustodySignal) -> Result<CustodyTimer, Error> {
        self.timers
            .iter()
            .position(|t| t.meta.id == signal.id && t.node.same_node(node))
            .map(|idx| self.timers.remove(idx))
            .ok_or_else(|| Error::NoTimerFound(signal.id.clone(), node.clone()))
    }

    /// Removes and returns every timer due at `now`.
    pub fn due(&mut self, now: OffsetDateTime) -> Vec<CustodyTimer> {
        let mut due = Vec::new();
        while self.timers.last().is_some_and(|t| t.deadline <= now) {
            if let Some(timer) = self.timers.pop() {
                due.push(timer);
            }
        }
        due
    }

    pub fn next_deadline(&self) -> Option<OffsetDateTime> {
        self.timers.last().map(|t| t.deadline)
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}

/// Bookkeeping for bundles this node has taken custody of.
///
/// Custody is accepted for queued bundles that request it, up to a fixed
/// capacity. Each transfer of such a bundle arms a timer; a custody signal
/// from the next hop cancels it. Fired timers are handed back by
/// [`CustodyManager::check`] for the bundle to be sent again.
pub struct CustodyManager {
    bus: Arc<EventBus>,
    local: Eid,
    capacity: usize,
    timeout: time::Duration,
    timers: Mutex<CustodyTimers>,
    held: Mutex<HashMap<BundleId, u32>>,
}

impl CustodyManager {
    pub fn new(config: &config::CustodyConfig, local: Eid, bus: Arc<EventBus>) -> Self {
        Self {
            bus,
            local,
            capacity: config.capacity,
            timeout: time::Duration::seconds(config.timeout as i64),
            timers: Mutex::new(CustodyTimers::default()),
            held: Mutex::new(HashMap::new()),
        }
    }

    pub fn holds(&self, id: &BundleId) -> bool {
        self.held
            .lock()
            .trace_expect("Failed to lock mutex")
            .contains_key(id)
    }

    /// Takes custody of `meta`, if there is room.
    pub fn accept(&self, meta: &MetaBundle) -> Result<(), Error> {
        {
            let mut held = self.held.lock().trace_expect("Failed to lock mutex");
            if held.contains_key(&meta.id) {
                return Ok(());
            }
            if held.len() >= self.capacity {
                metrics::counter!("router.custody.rejected").increment(1);
                return Err(Error::CustodyRejected(meta.id.clone()));
            }
            held.insert(meta.id.clone(), 0);
        }

        metrics::counter!("router.custody.accepted").increment(1);
        debug!("Accepted custody of {}", meta.id);

        let mut meta = meta.clone();
        meta.custodian = self.local.clone();
        self.bus.raise(Event::CustodyAccepted { meta });
        Ok(())
    }

    /// Gives up custody, cancelling any armed timer.
    pub fn release(&self, id: &BundleId) -> bool {
        self.timers
            .lock()
            .trace_expect("Failed to lock mutex")
            .timers
            .retain(|t| t.meta.id != *id);
        self.held
            .lock()
            .trace_expect("Failed to lock mutex")
            .remove(id)
            .is_some()
    }

    pub fn set_timer(&self, node: Eid, meta: MetaBundle, timeout: time::Duration, attempt: u32, now: OffsetDateTime) {
        trace!("Custody timer for {} armed, attempt {attempt}", meta.id);
        self.timers
            .lock()
            .trace_expect("Failed to lock mutex")
            .set_timer(CustodyTimer {
                node,
                deadline: now.saturating_add(timeout),
                meta,
                attempt,
            });
    }

    /// Arms a timer for a custody bundle just handed to `node`.
    pub fn transferred(&self, node: &Eid, meta: &MetaBundle, now: OffsetDateTime) {
        let attempt = {
            let mut held = self.held.lock().trace_expect("Failed to lock mutex");
            let Some(attempts) = held.get_mut(&meta.id) else {
                return;
            };
            *attempts += 1;
            *attempts
        };
        self.set_timer(node.clone(), meta.clone(), self.timeout, attempt, now);
    }

    pub fn remove_timer(&self, node: &Eid, signal: &CustodySignal) -> Result<CustodyTimer, Error> {
        self.timers
            .lock()
            .trace_expect("Failed to lock mutex")
            .remove_timer(node, signal)
    }

    /// Handles a custody signal from the next hop.
    ///
    /// On acceptance custody has moved on and is released here. On rejection
    /// the bundle is routed again.
    pub fn signal(&self, signal: &CustodySignal) -> Result<(), Error> {
        let timer = self.remove_timer(&signal.from, signal)?;
        if signal.accepted {
            debug!("Custody of {} accepted by {}", signal.id, signal.from);
            self.release(&signal.id);
        } else {
            debug!("Custody of {} rejected by {}, rerouting", signal.id, signal.from);
            self.bus.raise(Event::Queued {
                meta: timer.meta,
                origin: None,
            });
        }
        Ok(())
    }

    /// Removes and returns every timer due at `now`.
    pub fn check(&self, now: OffsetDateTime) -> Vec<CustodyTimer> {
        let due = self
            .timers
            .lock()
            .trace_expect("Failed to lock mutex")
            .due(now);
        for timer in &due {
            info!(
                "Custody timer for {} to {} expired after attempt {}",
                timer.meta.id, timer.node, timer.attempt
            );
            metrics::counter!("router.custody.expired").increment(1);
        }
        due
    }

    pub fn timers(&self) -> usize {
        self.timers.lock().trace_expect("Failed to lock mutex").len()
    }
}

#[derive(Debug)]
enum Task {
    Tick(OffsetDateTime),
    Queued(MetaBundle),
    Transferred(Eid, MetaBundle),
    Signal(CustodySignal),
    Forget(BundleId),
}

/// Runs a [`CustodyManager`] on its own worker, driven by router events.
///
/// When a custody timer fires the bundle goes to the same next hop again,
/// whatever that neighbor was assumed to hold. If the next hop cannot take
/// it, the bundle is queued again for the routing extensions.
pub struct CustodyExtension {
    router: Arc<BaseRouter>,
    manager: CustodyManager,
    queue: TaskQueue<Task>,
    pool: TaskPool,
}

impl CustodyExtension {
    pub fn new(router: Arc<BaseRouter>) -> Arc<Self> {
        let extension = Arc::new(Self {
            manager: CustodyManager::new(
                &router.config().custody,
                router.local().clone(),
                router.bus().clone(),
            ),
            router,
            queue: TaskQueue::new(),
            pool: TaskPool::new(),
        });

        let worker = extension.clone();
        extension.pool.spawn("custody", async move {
            task_queue::drain("custody", &worker.queue, |task| worker.execute(task)).await
        });
        extension
    }

    pub fn manager(&self) -> &CustodyManager {
        &self.manager
    }

    async fn execute(&self, task: Task) -> Result<(), router::Error> {
        match task {
            Task::Tick(now) => {
                for timer in self.manager.check(now) {
                    self.resubmit(timer).await;
                }
            }
            Task::Queued(meta) => {
                if !self.manager.holds(&meta.id) {
                    self.manager.accept(&meta)?;
                }
            }
            Task::Transferred(node, meta) => {
                self.manager
                    .transferred(&node, &meta, OffsetDateTime::now_utc());
            }
            Task::Signal(signal) => self.manager.signal(&signal)?,
            Task::Forget(id) => {
                self.manager.release(&id);
            }
        }
        Ok(())
    }

    #[cfg_attr(feature = "instrument", instrument(skip(self, timer)))]
    async fn resubmit(&self, timer: CustodyTimer) {
        let CustodyTimer { node, meta, .. } = timer;

        // No signal arrived, so the next hop may not have it after all
        self.router.neighbors().forget_delivered(&node, &meta.id);

        match self.router.forward(&node, &meta.id).await {
            Ok(()) => trace!("Resubmitted {} to {node}", meta.id),
            Err(router::Error::Neighbor(neighbor::Error::AlreadyInTransit(_))) => {}
            Err(e) if e.is_no_bundle_found() => {
                debug!("Bundle {} is gone, releasing custody", meta.id);
                self.manager.release(&meta.id);
            }
            Err(e) => {
                debug!("Cannot resubmit {} to {node}: {e}, routing it again", meta.id);
                self.router.bus().raise(Event::Queued { meta, origin: None });
            }
        }
    }
}

#[async_trait]
impl Extension for CustodyExtension {
    fn name(&self) -> &'static str {
        "custody"
    }

    fn notify(&self, event: &Event) {
        match event {
            Event::TimeTick { now } => self.queue.push(Task::Tick(*now)),
            Event::Queued { meta, .. } if meta.flags.custody_requested => {
                self.queue.push(Task::Queued(meta.clone()))
            }
            Event::TransferCompleted { peer, meta } if meta.flags.custody_requested => self
                .queue
                .push(Task::Transferred(peer.clone(), meta.clone())),
            Event::CustodySignal { signal } => self.queue.push(Task::Signal(signal.clone())),
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

#[cfg(test)]
mod tests {
    use super::*;
    use events::{EventKind, EventReceiver};

    fn at(secs: i64) -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + time::Duration::seconds(secs)
    }

    fn eid(s: &str) -> Eid {
        s.parse().unwrap()
    }

    fn meta(seq: u64) -> MetaBundle {
        let mut meta = MetaBundle::new(
            BundleId::new(eid("dtn://src/app"), 1, seq),
            eid("dtn://dst/app"),
            time::Duration::hours(1),
            at(0),
        );
        meta.flags.custody_requested = true;
        meta
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Event>>);

    impl EventReceiver for Recorder {
        fn raise_event(&self, event: &Event) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    fn manager(capacity: usize) -> (CustodyManager, Arc<Recorder>) {
        let bus = Arc::new(EventBus::new());
        let recorder = Arc::new(Recorder::default());
        bus.bind_all(
            &[EventKind::Queued, EventKind::CustodyAccepted],
            recorder.clone(),
        );
        (
            CustodyManager::new(
                &config::CustodyConfig {
                    capacity,
                    timeout: 10,
                },
                eid("dtn://local"),
                bus,
            ),
            recorder,
        )
    }

    fn queued(recorder: &Recorder) -> usize {
        recorder
            .0
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, Event::Queued { .. }))
            .count()
    }

    #[test]
    fn timers_sorted_soonest_last() {
        let mut timers = CustodyTimers::default();
        for (seq, deadline) in [(1, 30), (2, 10), (3, 20), (4, 10)] {
            timers.set_timer(CustodyTimer {
                node: eid("dtn://next"),
                meta: meta(seq),
                deadline: at(deadline),
                attempt: 0,
            });
        }
        assert_eq!(timers.next_deadline(), Some(at(10)));

        let due = timers.due(at(20));
        assert_eq!(
            due.iter().map(|t| t.deadline).collect::<Vec<_>>(),
            vec![at(10), at(10), at(20)]
        );
        assert_eq!(timers.len(), 1);
    }

    #[test]
    fn timer_fires_once_at_deadline() {
        let (manager, recorder) = manager(200);
        manager.set_timer(
            eid("dtn://next"),
            meta(1),
            time::Duration::seconds(10),
            0,
            at(100),
        );

        assert!(manager.check(at(109)).is_empty());

        let fired = manager.check(at(110));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].node, eid("dtn://next"));
        assert_eq!(fired[0].meta.id, meta(1).id);
        assert_eq!(manager.timers(), 0);

        assert!(manager.check(at(111)).is_empty());
        assert_eq!(queued(&recorder), 0);
    }

    #[test]
    fn signal_cancels_timer() {
        let (manager, recorder) = manager(200);
        manager.accept(&meta(1)).unwrap();
        manager.transferred(&eid("dtn://next"), &meta(1), at(0));
        assert_eq!(manager.timers(), 1);

        let signal = CustodySignal {
            id: meta(1).id,
            from: eid("dtn://next/admin"),
            accepted: true,
        };
        manager.signal(&signal).unwrap();
        assert_eq!(manager.timers(), 0);
        assert!(!manager.holds(&meta(1).id));

        // A duplicate signal matches nothing
        assert_eq!(
            manager.signal(&signal),
            Err(Error::NoTimerFound(meta(1).id, eid("dtn://next/admin")))
        );
        assert!(manager.check(at(100)).is_empty());
        assert_eq!(queued(&recorder), 0);
    }

    #[test]
    fn rejected_signal_reroutes() {
        let (manager, recorder) = manager(200);
        manager.accept(&meta(1)).unwrap();
        manager.transferred(&eid("dtn://next"), &meta(1), at(0));

        manager
            .signal(&CustodySignal {
                id: meta(1).id,
                from: eid("dtn://next"),
                accepted: false,
            })
            .unwrap();
        assert_eq!(queued(&recorder), 1);
        assert!(manager.holds(&meta(1).id));
    }

    #[test]
    fn capacity() {
        let (manager, recorder) = manager(2);
        manager.accept(&meta(1)).unwrap();
        manager.accept(&meta(1)).unwrap();
        manager.accept(&meta(2)).unwrap();
        assert_eq!(
            manager.accept(&meta(3)),
            Err(Error::CustodyRejected(meta(3).id))
        );

        let accepted = recorder
            .0
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                Event::CustodyAccepted { meta } => Some(meta.custodian.clone()),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(accepted, vec![eid("dtn://local"), eid("dtn://local")]);

        assert!(manager.release(&meta(1).id));
        manager.accept(&meta(3)).unwrap();
    }

    #[test]
    fn transfer_without_custody_arms_nothing() {
        let (manager, _) = manager(200);
        manager.transferred(&eid("dtn://next"), &meta(1), at(0));
        assert_eq!(manager.timers(), 0);
    }
}
