use super::*;
use bundle::Bundle;
use eid::Eid;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// There is no usable connection to the peer right now.
    #[error("Peer {0} is not reachable")]
    Unreachable(Eid),

    #[error(transparent)]
    Internal(#[from] Box<dyn std::error::Error + Send + Sync>),
}

pub type Result<T> = core::result::Result<T, Error>;

/// The convergence-layer side of the router.
///
/// A successful `queue` only means the bundle was accepted for transmission.
/// The outcome is reported later by raising [`events::Event::TransferCompleted`],
/// [`events::Event::TransferAborted`] or [`events::Event::Requeue`] on the
/// router's event bus.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Enqueues `bundle` for transmission to the directly reachable `peer`.
    async fn queue(&self, peer: &Eid, bundle: Bundle) -> Result<()>;
}
