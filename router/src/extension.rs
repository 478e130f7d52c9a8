use super::*;
use bundle::Bundle;
use eid::Eid;
use events::Event;
use handshake::NodeHandshake;

/// A routing policy plugged into the [`router::BaseRouter`].
///
/// Extensions are constructed once, registered with
/// [`router::BaseRouter::add_extension`], and live until the router shuts
/// down. Each one owns a single worker that drains its own task queue, so two
/// tasks of the same extension never run concurrently.
#[async_trait]
pub trait Extension: Send + Sync {
    fn name(&self) -> &'static str;

    /// Called on the context of whoever raised `event`.
    ///
    /// Must not block: anything beyond bookkeeping is pushed onto the
    /// extension's task queue.
    fn notify(&self, event: &Event);

    /// Adds the handshake items this extension wants from `peer`.
    fn request_handshake(&self, _peer: &Eid, _request: &mut NodeHandshake) {}

    /// Adds this extension's answers to a handshake `request` from `peer`.
    fn response_handshake(
        &self,
        _peer: &Eid,
        _request: &NodeHandshake,
        _response: &mut NodeHandshake,
    ) {
    }

    /// Consumes the items of a handshake response from `peer`.
    ///
    /// Items the extension does not know are ignored.
    async fn process_handshake(&self, _peer: &Eid, _response: &NodeHandshake) {}

    /// Aborts the task queue and waits for the worker to exit.
    async fn shutdown(&self);
}

/// A local application endpoint that bundles can be delivered to.
pub trait Endpoint: Send + Sync {
    /// Must not block.
    fn deliver(&self, bundle: Bundle);
}
