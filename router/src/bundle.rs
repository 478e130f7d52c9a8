use super::*;
use eid::Eid;
use time::OffsetDateTime;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FragmentInfo {
    pub offset: u64,
    pub total_len: u64,
}

/// Identity of a bundle. Never mutated once created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BundleId {
    pub source: Eid,
    pub timestamp: u64,
    pub sequence: u64,

    #[cfg_attr(feature = "serde", serde(default))]
    pub fragment_info: Option<FragmentInfo>,
}

impl BundleId {
    pub fn new(source: Eid, timestamp: u64, sequence: u64) -> Self {
        Self {
            source,
            timestamp,
            sequence,
            fragment_info: None,
        }
    }

    pub fn is_fragment(&self) -> bool {
        self.fragment_info.is_some()
    }
}

// The string form is what gets hashed into summary vectors, keep it stable
impl std::fmt::Display for BundleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.fragment_info {
            Some(fragment_info) => write!(
                f,
                "[{}.{}.{}] {}",
                self.timestamp, self.sequence, fragment_info.offset, self.source
            ),
            None => write!(f, "[{}.{}] {}", self.timestamp, self.sequence, self.source),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Flags {
    pub singleton: bool,
    pub custody_requested: bool,
}

/// The routing-relevant projection of a stored bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MetaBundle {
    pub id: BundleId,
    pub destination: Eid,
    pub report_to: Eid,
    pub custodian: Eid,
    pub flags: Flags,
    pub lifetime: time::Duration,
    pub expiry: OffsetDateTime,
    pub size: u64,

    /// Remaining scope-control hop limit, `None` when unlimited
    pub hop_limit: Option<u32>,
}

impl MetaBundle {
    /// A singleton bundle with no report-to or custodian, expiring `lifetime` after `now`.
    pub fn new(
        id: BundleId,
        destination: Eid,
        lifetime: time::Duration,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            id,
            destination,
            report_to: Eid::none(),
            custodian: Eid::none(),
            flags: Flags {
                singleton: true,
                custody_requested: false,
            },
            lifetime,
            expiry: now.saturating_add(lifetime),
            size: 0,
            hop_limit: None,
        }
    }

    pub fn has_expired(&self, now: OffsetDateTime) -> bool {
        self.expiry <= now
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bundle {
    pub meta: MetaBundle,
    pub payload: Bytes,
}

impl Bundle {
    pub fn new(mut meta: MetaBundle, payload: Bytes) -> Self {
        meta.size = payload.len() as u64;
        Self { meta, payload }
    }

    pub fn id(&self) -> &BundleId {
        &self.meta.id
    }
}

/// An acknowledgement from the next custodian for a bundle we hold custody of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustodySignal {
    pub id: BundleId,
    pub from: Eid,
    pub accepted: bool,
}
