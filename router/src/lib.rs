mod search;
mod task_pool;

pub mod bloom;
pub mod bundle;
pub mod config;
pub mod custody;
pub mod eid;
pub mod epidemic;
pub mod events;
pub mod extension;
pub mod flooding;
pub mod handshake;
pub mod neighbor;
pub mod neighbor_routing;
pub mod retransmission;
pub mod router;
pub mod static_routes;
pub mod storage;
pub mod summary;
pub mod task_queue;
pub mod transport;

use std::sync::Arc;
use trace_err::*;
use tracing::{debug, error, info, trace, warn};

#[cfg(feature = "instrument")]
use tracing::instrument;

// Re-export for consistency
pub use async_trait::async_trait;
pub use bytes::Bytes;
