use super::*;
use bundle::{Bundle, BundleId, CustodySignal, MetaBundle};
use eid::Eid;
use std::sync::RwLock;
use time::OffsetDateTime;

/// Why a transfer to a peer did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AbortReason {
    Undefined,
    ConnectionDown,
    RetryLimitReached,
    Refused,
    BundleDeleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeState {
    /// Ask the peer for its routing state
    Request,
    /// We answered a request from the peer
    Replied,
    /// A response from the peer was processed
    Completed,
    /// Routing state about the peer changed without a request
    Updated,
    /// Push our own routing state to the peer unsolicited
    Announce,
}

#[derive(Debug, Clone)]
pub enum Event {
    TimeTick {
        now: OffsetDateTime,
    },
    BundleReceived {
        bundle: Bundle,
        peer: Option<Eid>,
    },
    BundleGenerated {
        bundle: Bundle,
    },
    Queued {
        meta: MetaBundle,
        origin: Option<Eid>,
    },
    TransferCompleted {
        peer: Eid,
        meta: MetaBundle,
    },
    TransferAborted {
        peer: Eid,
        id: BundleId,
        reason: AbortReason,
    },
    Requeue {
        peer: Eid,
        id: BundleId,
    },
    NodeAvailable {
        node: Eid,
    },
    NodeUnavailable {
        node: Eid,
    },
    ConnectionUp {
        peer: Eid,
    },
    ConnectionDown {
        peer: Eid,
    },
    Handshake {
        state: HandshakeState,
        peer: Eid,
    },
    CustodyAccepted {
        meta: MetaBundle,
    },
    CustodySignal {
        signal: CustodySignal,
    },
    BundleExpired {
        id: BundleId,
    },
    BundleDeleted {
        id: BundleId,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    TimeTick,
    BundleReceived,
    BundleGenerated,
    Queued,
    TransferCompleted,
    TransferAborted,
    Requeue,
    NodeAvailable,
    NodeUnavailable,
    ConnectionUp,
    ConnectionDown,
    Handshake,
    CustodyAccepted,
    CustodySignal,
    BundleExpired,
    BundleDeleted,
}

impl EventKind {
    pub const ALL: &'static [EventKind] = &[
        EventKind::TimeTick,
        EventKind::BundleReceived,
        EventKind::BundleGenerated,
        EventKind::Queued,
        EventKind::TransferCompleted,
        EventKind::TransferAborted,
        EventKind::Requeue,
        EventKind::NodeAvailable,
        EventKind::NodeUnavailable,
        EventKind::ConnectionUp,
        EventKind::ConnectionDown,
        EventKind::Handshake,
        EventKind::CustodyAccepted,
        EventKind::CustodySignal,
        EventKind::BundleExpired,
        EventKind::BundleDeleted,
    ];
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::TimeTick { .. } => EventKind::TimeTick,
            Event::BundleReceived { .. } => EventKind::BundleReceived,
            Event::BundleGenerated { .. } => EventKind::BundleGenerated,
            Event::Queued { .. } => EventKind::Queued,
            Event::TransferCompleted { .. } => EventKind::TransferCompleted,
            Event::TransferAborted { .. } => EventKind::TransferAborted,
            Event::Requeue { .. } => EventKind::Requeue,
            Event::NodeAvailable { .. } => EventKind::NodeAvailable,
            Event::NodeUnavailable { .. } => EventKind::NodeUnavailable,
            Event::ConnectionUp { .. } => EventKind::ConnectionUp,
            Event::ConnectionDown { .. } => EventKind::ConnectionDown,
            Event::Handshake { .. } => EventKind::Handshake,
            Event::CustodyAccepted { .. } => EventKind::CustodyAccepted,
            Event::CustodySignal { .. } => EventKind::CustodySignal,
            Event::BundleExpired { .. } => EventKind::BundleExpired,
            Event::BundleDeleted { .. } => EventKind::BundleDeleted,
        }
    }
}

/// Something that wants to hear about events raised on an [`EventBus`].
///
/// `raise_event` runs on the context of whoever raised the event, so
/// implementations must not block: long running work belongs on the
/// receiver's own task queue.
pub trait EventReceiver: Send + Sync {
    fn raise_event(&self, event: &Event);
}

/// Synchronous publish/subscribe of [`Event`]s.
///
/// Receivers are called in the order they were bound. The receiver list is
/// snapshotted before dispatch, so a receiver may raise further events or
/// bind and unbind without deadlocking.
#[derive(Default)]
pub struct EventBus {
    receivers: RwLock<Vec<(EventKind, Arc<dyn EventReceiver>)>>,
}

fn same_receiver(a: &Arc<dyn EventReceiver>, b: &Arc<dyn EventReceiver>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&self, kind: EventKind, receiver: Arc<dyn EventReceiver>) {
        let mut receivers = self.receivers.write().trace_expect("Failed to lock mutex");
        if !receivers
            .iter()
            .any(|(k, r)| *k == kind && same_receiver(r, &receiver))
        {
            receivers.push((kind, receiver));
        }
    }

    pub fn bind_all(&self, kinds: &[EventKind], receiver: Arc<dyn EventReceiver>) {
        for kind in kinds {
            self.bind(*kind, receiver.clone());
        }
    }

    pub fn unbind(&self, kind: EventKind, receiver: &Arc<dyn EventReceiver>) {
        self.receivers
            .write()
            .trace_expect("Failed to lock mutex")
            .retain(|(k, r)| *k != kind || !same_receiver(r, receiver));
    }

    /// Removes every binding of `receiver`
    pub fn unbind_all(&self, receiver: &Arc<dyn EventReceiver>) {
        self.receivers
            .write()
            .trace_expect("Failed to lock mutex")
            .retain(|(_, r)| !same_receiver(r, receiver));
    }

    pub fn raise(&self, event: Event) {
        let kind = event.kind();
        let receivers = self
            .receivers
            .read()
            .trace_expect("Failed to lock mutex")
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, r)| r.clone())
            .collect::<Vec<_>>();

        trace!("Raising {kind:?} to {} receivers", receivers.len());

        for receiver in receivers {
            receiver.raise_event(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<(&'static str, EventKind)>>>,
    }

    impl EventReceiver for Recorder {
        fn raise_event(&self, event: &Event) {
            self.log.lock().unwrap().push((self.name, event.kind()));
        }
    }

    fn tick() -> Event {
        Event::TimeTick {
            now: OffsetDateTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn bind_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let bus = EventBus::new();
        let a: Arc<dyn EventReceiver> = Arc::new(Recorder {
            name: "a",
            log: log.clone(),
        });
        let b: Arc<dyn EventReceiver> = Arc::new(Recorder {
            name: "b",
            log: log.clone(),
        });
        bus.bind(EventKind::TimeTick, b.clone());
        bus.bind(EventKind::TimeTick, a.clone());
        bus.bind(EventKind::TimeTick, a.clone());
        bus.bind(EventKind::NodeAvailable, a.clone());

        bus.raise(tick());
        assert_eq!(
            *log.lock().unwrap(),
            vec![("b", EventKind::TimeTick), ("a", EventKind::TimeTick)]
        );

        log.lock().unwrap().clear();
        bus.unbind(EventKind::TimeTick, &b);
        bus.raise(tick());
        bus.raise(Event::NodeAvailable {
            node: "dtn://n".parse().unwrap(),
        });
        assert_eq!(
            *log.lock().unwrap(),
            vec![("a", EventKind::TimeTick), ("a", EventKind::NodeAvailable)]
        );

        log.lock().unwrap().clear();
        bus.unbind_all(&a);
        bus.raise(tick());
        assert!(log.lock().unwrap().is_empty());
    }

    struct Reentrant {
        bus: Arc<EventBus>,
        seen: Mutex<Vec<EventKind>>,
    }

    impl EventReceiver for Reentrant {
        fn raise_event(&self, event: &Event) {
            self.seen.lock().unwrap().push(event.kind());
            if let Event::TimeTick { .. } = event {
                self.bus.raise(Event::BundleExpired {
                    id: bundle::BundleId::new("dtn://a".parse().unwrap(), 0, 0),
                });
            }
        }
    }

    #[test]
    fn raise_from_receiver() {
        let bus = Arc::new(EventBus::new());
        let r = Arc::new(Reentrant {
            bus: bus.clone(),
            seen: Mutex::new(Vec::new()),
        });
        bus.bind_all(&[EventKind::TimeTick, EventKind::BundleExpired], r.clone());
        bus.raise(tick());
        assert_eq!(
            *r.seen.lock().unwrap(),
            vec![EventKind::TimeTick, EventKind::BundleExpired]
        );
    }
}
