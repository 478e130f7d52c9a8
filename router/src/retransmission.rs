use super::*;
use bundle::BundleId;
use eid::Eid;
use events::{AbortReason, Event};
use extension::Extension;
use router::BaseRouter;
use std::{
    collections::{BTreeSet, HashMap},
    sync::Mutex,
};
use task_pool::TaskPool;
use task_queue::TaskQueue;
use time::OffsetDateTime;

type Key = (BundleId, Eid);

#[derive(Debug)]
struct Entry {
    attempts: u32,
    due: Option<OffsetDateTime>,
}

/// Outcome of recording a failed transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeued {
    Scheduled { attempts: u32, due: OffsetDateTime },
    Exhausted { attempts: u32 },
}

/// Attempt counts and retry deadlines per (bundle, peer) pair.
///
/// The retry delay after `n` failures is `backoff_base ^ n` seconds. Once more
/// than `ceiling` attempts have failed the pair is dropped.
#[derive(Debug)]
pub struct RetryLedger {
    ceiling: u32,
    backoff_base: u64,
    entries: HashMap<Key, Entry>,
    queue: BTreeSet<(OffsetDateTime, Key)>,
}

impl RetryLedger {
    pub fn new(config: &config::RetransmissionConfig) -> Self {
        Self {
            ceiling: config.ceiling,
            backoff_base: config.backoff_base.max(1),
            entries: HashMap::new(),
            queue: BTreeSet::new(),
        }
    }

    fn backoff(&self, attempts: u32) -> time::Duration {
        time::Duration::seconds(
            self.backoff_base
                .saturating_pow(attempts)
                .min(i64::MAX as u64) as i64,
        )
    }

    fn schedule(&mut self, key: Key, attempts: u32, due: OffsetDateTime) {
        let entry = self.entries.entry(key.clone()).or_insert(Entry {
            attempts,
            due: None,
        });
        if let Some(previous) = entry.due.replace(due) {
            self.queue.remove(&(previous, key.clone()));
        }
        entry.attempts = attempts;
        self.queue.insert((due, key));
    }

    /// Records one more failed transfer of `id` to `peer`.
    pub fn requeue(&mut self, id: &BundleId, peer: &Eid, now: OffsetDateTime) -> Requeued {
        let key = (id.clone(), peer.clone());
        let attempts = self.entries.get(&key).map_or(0, |e| e.attempts) + 1;
        if attempts > self.ceiling {
            self.remove(id, peer);
            return Requeued::Exhausted { attempts };
        }

        let due = now.saturating_add(self.backoff(attempts));
        self.schedule(key, attempts, due);
        Requeued::Scheduled { attempts, due }
    }

    /// Pushes the retry of a pair back without counting a failure.
    pub fn defer(&mut self, id: &BundleId, peer: &Eid, now: OffsetDateTime) {
        let key = (id.clone(), peer.clone());
        let attempts = self.entries.get(&key).map_or(0, |e| e.attempts);
        let due = now.saturating_add(self.backoff(attempts));
        self.schedule(key, attempts, due);
    }

    pub fn remove(&mut self, id: &BundleId, peer: &Eid) -> bool {
        let key = (id.clone(), peer.clone());
        match self.entries.remove(&key) {
            Some(entry) => {
                if let Some(due) = entry.due {
                    self.queue.remove(&(due, key));
                }
                true
            }
            None => false,
        }
    }

    /// Drops the pair if it was resubmitted and no retry is scheduled since.
    pub fn remove_resubmitted(&mut self, id: &BundleId, peer: &Eid) -> bool {
        let key = (id.clone(), peer.clone());
        if self.entries.get(&key).is_some_and(|e| e.due.is_none()) {
            self.entries.remove(&key);
            return true;
        }
        false
    }

    /// Drops `id` for every peer.
    pub fn remove_bundle(&mut self, id: &BundleId) {
        let peers = self
            .entries
            .keys()
            .filter(|(i, _)| i == id)
            .map(|(_, peer)| peer.clone())
            .collect::<Vec<_>>();
        for peer in peers {
            self.remove(id, &peer);
        }
    }

    /// Takes the head of the retry queue if it is due.
    ///
    /// The pair stays in the ledger so a further failure keeps counting.
    pub fn pop_due(&mut self, now: OffsetDateTime) -> Option<(BundleId, Eid)> {
        let (due, _) = self.queue.first()?;
        if *due > now {
            return None;
        }
        let (_, key) = self.queue.pop_first()?;
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.due = None;
        }
        Some(key)
    }

    pub fn attempts(&self, id: &BundleId, peer: &Eid) -> Option<u32> {
        self.entries
            .get(&(id.clone(), peer.clone()))
            .map(|e| e.attempts)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug)]
enum Task {
    Requeue(BundleId, Eid),
    Remove(BundleId, Eid),
    Abandoned(BundleId, Eid),
    RemoveBundle(BundleId),
    Tick(OffsetDateTime),
}

/// Retries failed transfers with exponential backoff, whatever routing
/// policy queued them.
pub struct RetransmissionExtension {
    router: Arc<BaseRouter>,
    ledger: Mutex<RetryLedger>,
    queue: TaskQueue<Task>,
    pool: TaskPool,
}

impl RetransmissionExtension {
    pub fn new(router: Arc<BaseRouter>) -> Arc<Self> {
        let extension = Arc::new(Self {
            ledger: Mutex::new(RetryLedger::new(&router.config().retransmission)),
            router,
            queue: TaskQueue::new(),
            pool: TaskPool::new(),
        });

        let worker = extension.clone();
        extension.pool.spawn("retransmission", async move {
            task_queue::drain("retransmission", &worker.queue, |task| worker.execute(task)).await
        });
        extension
    }

    fn ledger(&self) -> std::sync::MutexGuard<'_, RetryLedger> {
        self.ledger.lock().trace_expect("Failed to lock mutex")
    }

    fn requeue(&self, id: BundleId, peer: Eid, now: OffsetDateTime) {
        let requeued = self.ledger().requeue(&id, &peer, now);
        match requeued {
            Requeued::Scheduled { attempts, due } => {
                debug!("Transfer of {id} to {peer} failed {attempts} times, retrying at {due}");
            }
            Requeued::Exhausted { attempts } => {
                info!("Giving up transfer of {id} to {peer} after {attempts} attempts");
                metrics::counter!("router.retransmissions.exhausted").increment(1);
                self.router.bus().raise(Event::TransferAborted {
                    peer,
                    id,
                    reason: AbortReason::RetryLimitReached,
                });
            }
        }
    }

    async fn execute(&self, task: Task) -> Result<(), router::Error> {
        match task {
            Task::Requeue(id, peer) => self.requeue(id, peer, OffsetDateTime::now_utc()),
            Task::Remove(id, peer) => {
                self.ledger().remove(&id, &peer);
            }
            Task::Abandoned(id, peer) => {
                if self.ledger().remove_resubmitted(&id, &peer) {
                    trace!("Resubmitted transfer of {id} to {peer} aborted, forgetting it");
                }
            }
            Task::RemoveBundle(id) => self.ledger().remove_bundle(&id),
            Task::Tick(now) => {
                let head = self.ledger().pop_due(now);
                if let Some((id, peer)) = head {
                    self.resubmit(id, peer, now).await;
                }
            }
        }
        Ok(())
    }

    #[cfg_attr(feature = "instrument", instrument(skip(self)))]
    async fn resubmit(&self, id: BundleId, peer: Eid, now: OffsetDateTime) {
        metrics::counter!("router.retransmissions").increment(1);
        match self.router.forward(&peer, &id).await {
            Ok(()) => trace!("Resubmitted {id} to {peer}"),
            Err(router::Error::Neighbor(
                neighbor::Error::NoMoreTransfersAvailable(_) | neighbor::Error::AlreadyInTransit(_),
            )) => {
                trace!("{peer} is busy, deferring retry of {id}");
                self.ledger().defer(&id, &peer, now);
            }
            Err(e) if e.is_no_bundle_found() => {
                debug!("Bundle {id} is gone, dropping retry to {peer}");
                self.ledger().remove(&id, &peer);
                self.router.bus().raise(Event::TransferAborted {
                    peer,
                    id,
                    reason: AbortReason::BundleDeleted,
                });
            }
            Err(e) => {
                debug!("Failed to resubmit {id} to {peer}: {e}");
                self.requeue(id, peer, now);
            }
        }
    }
}

#[async_trait]
impl Extension for RetransmissionExtension {
    fn name(&self) -> &'static str {
        "retransmission"
    }

    fn notify(&self, event: &Event) {
        match event {
            Event::Requeue { peer, id } => self.queue.push(Task::Requeue(id.clone(), peer.clone())),
            Event::TransferCompleted { peer, meta } => {
                self.queue.push(Task::Remove(meta.id.clone(), peer.clone()))
            }
            Event::TransferAborted {
                peer,
                id,
                reason: AbortReason::Refused | AbortReason::BundleDeleted,
            } => self.queue.push(Task::Remove(id.clone(), peer.clone())),
            Event::TransferAborted {
                peer,
                id,
                reason: AbortReason::ConnectionDown | AbortReason::Undefined,
            } => self
                .queue
                .push(Task::Abandoned(id.clone(), peer.clone())),
            Event::BundleExpired { id } | Event::BundleDeleted { id } => {
                self.queue.push(Task::RemoveBundle(id.clone()))
            }
            Event::TimeTick { now } => self.queue.push(Task::Tick(*now)),
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

    fn at(secs: i64) -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + time::Duration::seconds(secs)
    }

    fn id(seq: u64) -> BundleId {
        BundleId::new("dtn://src/app".parse().unwrap(), 1, seq)
    }

    fn peer() -> Eid {
        "dtn://peer".parse().unwrap()
    }

    #[test]
    fn backoff_until_exhausted() {
        let mut ledger = RetryLedger::new(&config::RetransmissionConfig::default());
        let mut now = at(0);
        let mut last_delay = time::Duration::ZERO;

        for expected in 1..=8 {
            match ledger.requeue(&id(1), &peer(), now) {
                Requeued::Scheduled { attempts, due } => {
                    assert_eq!(attempts, expected);
                    let delay = due - now;
                    assert!(delay >= last_delay);
                    last_delay = delay;
                    now = due;
                }
                Requeued::Exhausted { .. } => panic!("Exhausted after {expected} attempts"),
            }
        }
        assert_eq!(last_delay, time::Duration::seconds(256));

        assert_eq!(
            ledger.requeue(&id(1), &peer(), now),
            Requeued::Exhausted { attempts: 9 }
        );
        assert_eq!(ledger.attempts(&id(1), &peer()), None);
        assert!(ledger.pop_due(at(i32::MAX as i64)).is_none());

        // A new failure starts from scratch
        assert!(matches!(
            ledger.requeue(&id(1), &peer(), now),
            Requeued::Scheduled { attempts: 1, .. }
        ));
    }

    #[test]
    fn head_only() {
        let mut ledger = RetryLedger::new(&config::RetransmissionConfig::default());
        ledger.requeue(&id(1), &peer(), at(0));
        ledger.requeue(&id(2), &peer(), at(0));

        assert_eq!(ledger.pop_due(at(1)), None);
        assert_eq!(ledger.pop_due(at(2)), Some((id(1), peer())));
        assert_eq!(ledger.pop_due(at(2)), Some((id(2), peer())));
        assert_eq!(ledger.pop_due(at(2)), None);

        // Popped pairs keep their attempt count
        assert_eq!(ledger.attempts(&id(1), &peer()), Some(1));
        assert!(matches!(
            ledger.requeue(&id(1), &peer(), at(2)),
            Requeued::Scheduled { attempts: 2, .. }
        ));
    }

    #[test]
    fn defer_keeps_attempts() {
        let mut ledger = RetryLedger::new(&config::RetransmissionConfig::default());
        ledger.requeue(&id(1), &peer(), at(0));
        ledger.requeue(&id(1), &peer(), at(0));
        assert_eq!(ledger.pop_due(at(4)), Some((id(1), peer())));

        ledger.defer(&id(1), &peer(), at(4));
        assert_eq!(ledger.attempts(&id(1), &peer()), Some(2));
        assert_eq!(ledger.pop_due(at(7)), None);
        assert_eq!(ledger.pop_due(at(8)), Some((id(1), peer())));
    }

    #[test]
    fn remove() {
        let mut ledger = RetryLedger::new(&config::RetransmissionConfig::default());
        let other: Eid = "dtn://other".parse().unwrap();
        ledger.requeue(&id(1), &peer(), at(0));
        ledger.requeue(&id(1), &other, at(0));
        ledger.requeue(&id(2), &peer(), at(0));

        assert!(ledger.remove(&id(2), &peer()));
        assert!(!ledger.remove(&id(2), &peer()));
        ledger.remove_bundle(&id(1));
        assert!(ledger.is_empty());
        assert_eq!(ledger.pop_due(at(100)), None);
    }

    #[test]
    fn aborted_resubmission_is_forgotten() {
        let mut ledger = RetryLedger::new(&config::RetransmissionConfig::default());
        ledger.requeue(&id(1), &peer(), at(0));
        ledger.requeue(&id(2), &peer(), at(0));

        // Still waiting for its retry, an abort does not drop it
        assert!(!ledger.remove_resubmitted(&id(1), &peer()));
        assert_eq!(ledger.attempts(&id(1), &peer()), Some(1));

        assert_eq!(ledger.pop_due(at(2)), Some((id(1), peer())));
        assert!(ledger.remove_resubmitted(&id(1), &peer()));
        assert_eq!(ledger.attempts(&id(1), &peer()), None);
        assert_eq!(ledger.len(), 1);
        assert!(!ledger.remove_resubmitted(&id(3), &peer()));
    }
}
