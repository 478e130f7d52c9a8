use super::*;
use bloom::BloomFilter;
use bundle::{Bundle, MetaBundle};
use bytes::{Buf, BufMut, BytesMut};
use eid::{Eid, Service};
use events::{Event, HandshakeState};
use extension::{Endpoint, Extension};
use router::BaseRouter;
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::Mutex,
};
use task_pool::TaskPool;
use task_queue::TaskQueue;
use thiserror::Error;
use time::OffsetDateTime;

/// The administrative endpoint handshakes are exchanged between
pub const ROUTING: Service = Service {
    name: "/routing",
    number: 50,
};

/// Item id of a summary vector
pub const SUMMARY_VECTOR: u64 = 1;

/// Item id of a purge vector
pub const PURGE_VECTOR: u64 = 2;

const REQUEST: u64 = 1;
const RESPONSE: u64 = 2;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("Truncated handshake message")]
    Truncated,

    #[error("SDNV value overflows 64 bits")]
    Overflow,

    #[error("Unknown handshake message type {0}")]
    InvalidType(u64),

    #[error("Invalid item {0}: {1}")]
    InvalidItem(u64, #[source] bloom::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Request,
    Response,
}

/// A handshake request or response.
///
/// Requests carry the ids of the items wanted from the peer. Responses carry
/// a lifetime for the state they hold and one opaque payload per item id, so
/// new item kinds can be added without changing the message format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeHandshake {
    message_type: MessageType,
    requests: BTreeSet<u64>,
    lifetime: u64,
    items: BTreeMap<u64, Bytes>,
}

fn put_sdnv(buf: &mut BytesMut, mut value: u64) {
    let mut tmp = [0u8; 10];
    let mut i = tmp.len();
    loop {
        i -= 1;
        tmp[i] = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            break;
        }
    }
    let last = tmp.len() - 1;
    for b in &mut tmp[i..last] {
        *b |= 0x80;
    }
    buf.put_slice(&tmp[i..]);
}

fn get_sdnv(buf: &mut impl Buf) -> Result<u64, Error> {
    let mut value = 0u64;
    loop {
        if !buf.has_remaining() {
            return Err(Error::Truncated);
        }
        let b = buf.get_u8();
        if value > (u64::MAX >> 7) {
            return Err(Error::Overflow);
        }
        value = (value << 7) | (b & 0x7F) as u64;
        if b & 0x80 == 0 {
            return Ok(value);
        }
    }
}

impl NodeHandshake {
    pub fn request() -> Self {
        Self {
            message_type: MessageType::Request,
            requests: BTreeSet::new(),
            lifetime: 0,
            items: BTreeMap::new(),
        }
    }

    pub fn response(lifetime: u64) -> Self {
        Self {
            message_type: MessageType::Response,
            requests: BTreeSet::new(),
            lifetime,
            items: BTreeMap::new(),
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// Seconds the items of a response stay valid
    pub fn lifetime(&self) -> u64 {
        self.lifetime
    }

    pub fn add_request(&mut self, item: u64) {
        self.requests.insert(item);
    }

    pub fn has_request(&self, item: u64) -> bool {
        self.requests.contains(&item)
    }

    pub fn requests(&self) -> impl Iterator<Item = u64> + '_ {
        self.requests.iter().copied()
    }

    pub fn add_item(&mut self, item: u64, data: Bytes) {
        self.items.insert(item, data);
    }

    pub fn has_item(&self, item: u64) -> bool {
        self.items.contains_key(&item)
    }

    pub fn item(&self, item: u64) -> Option<&Bytes> {
        self.items.get(&item)
    }

    pub fn add_vector(&mut self, item: u64, vector: &BloomFilter) {
        let mut buf = BytesMut::with_capacity(vector.encoded_len());
        vector.encode(&mut buf);
        self.add_item(item, buf.freeze());
    }

    /// Decodes a bloom filter item, `None` if the item is absent.
    pub fn vector(&self, item: u64) -> Option<Result<BloomFilter, Error>> {
        self.items.get(&item).map(|data| {
            BloomFilter::decode(&mut data.clone()).map_err(|e| Error::InvalidItem(item, e))
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self.message_type {
            MessageType::Request => {
                put_sdnv(&mut buf, REQUEST);
                put_sdnv(&mut buf, self.requests.len() as u64);
                for r in &self.requests {
                    put_sdnv(&mut buf, *r);
                }
            }
            MessageType::Response => {
                put_sdnv(&mut buf, RESPONSE);
                put_sdnv(&mut buf, self.lifetime);
                put_sdnv(&mut buf, self.items.len() as u64);
                for (id, data) in &self.items {
                    put_sdnv(&mut buf, *id);
                    put_sdnv(&mut buf, data.len() as u64);
                    buf.put_slice(data);
                }
            }
        }
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, Error> {
        match get_sdnv(&mut buf)? {
            REQUEST => {
                let mut request = Self::request();
                for _ in 0..get_sdnv(&mut buf)? {
                    request.add_request(get_sdnv(&mut buf)?);
                }
                Ok(request)
            }
            RESPONSE => {
                let mut response = Self::response(get_sdnv(&mut buf)?);
                for _ in 0..get_sdnv(&mut buf)? {
                    let id = get_sdnv(&mut buf)?;
                    let len = get_sdnv(&mut buf)? as usize;
                    if buf.remaining() < len {
                        return Err(Error::Truncated);
                    }
                    response.add_item(id, buf.split_to(len));
                }
                Ok(response)
            }
            t => Err(Error::InvalidType(t)),
        }
    }
}

#[derive(Debug)]
enum Task {
    Query(Eid),
    Announce(Eid),
    Process(Bundle),
}

/// Exchanges routing state with neighbors over the `/routing` endpoint.
///
/// A query asks the peer for the items every registered extension wants; it
/// is rate limited per peer. The answer to an incoming request is assembled
/// from every extension's contribution. This extension itself answers
/// summary and purge vector requests from the router's state.
pub struct NodeHandshakeExtension {
    router: Arc<BaseRouter>,
    endpoint: Eid,
    queue: TaskQueue<Task>,
    pool: TaskPool,
    blacklist: Mutex<HashMap<Eid, OffsetDateTime>>,
}

struct HandshakeEndpoint(std::sync::Weak<NodeHandshakeExtension>);

impl Endpoint for HandshakeEndpoint {
    fn deliver(&self, bundle: Bundle) {
        if let Some(extension) = self.0.upgrade() {
            extension.queue.push(Task::Process(bundle));
        }
    }
}

impl NodeHandshakeExtension {
    pub fn new(router: Arc<BaseRouter>) -> Arc<Self> {
        let endpoint = router.local().service(&ROUTING);
        let extension = Arc::new(Self {
            router,
            endpoint: endpoint.clone(),
            queue: TaskQueue::new(),
            pool: TaskPool::new(),
            blacklist: Mutex::new(HashMap::new()),
        });

        extension.router.register_endpoint(
            endpoint,
            Arc::new(HandshakeEndpoint(Arc::downgrade(&extension))),
        );

        let worker = extension.clone();
        extension.pool.spawn("handshake", async move {
            task_queue::drain("handshake", &worker.queue, |task| worker.execute(task)).await
        });
        extension
    }

    async fn execute(&self, task: Task) -> Result<(), router::Error> {
        match task {
            Task::Query(peer) => self.query(&peer).await,
            Task::Announce(peer) => self.announce(&peer).await,
            Task::Process(bundle) => self.process(bundle).await,
        }
    }

    // Only query each peer once per interval
    fn should_query(&self, peer: &Eid, now: OffsetDateTime) -> bool {
        let mut blacklist = self.blacklist.lock().trace_expect("Failed to lock mutex");
        if blacklist.get(peer).is_some_and(|until| *until > now) {
            return false;
        }
        blacklist.insert(
            peer.clone(),
            now.saturating_add(time::Duration::seconds(
                self.router.config().handshake.query_interval as i64,
            )),
        );
        true
    }

    fn remove_from_blacklist(&self, peer: &Eid) {
        self.blacklist
            .lock()
            .trace_expect("Failed to lock mutex")
            .remove(peer);
    }

    fn message_bundle(&self, destination: Eid, handshake: &NodeHandshake) -> Bundle {
        let config = &self.router.config().handshake;
        let now = OffsetDateTime::now_utc();
        let mut meta = MetaBundle::new(
            self.router.next_bundle_id(self.endpoint.clone(), now),
            destination,
            time::Duration::seconds(config.lifetime as i64),
            now,
        );
        meta.hop_limit = Some(config.hop_limit);
        Bundle::new(meta, handshake.encode())
    }

    async fn send(&self, peer: &Eid, destination: Eid, handshake: &NodeHandshake) -> Result<(), router::Error> {
        let bundle = self.message_bundle(destination, handshake);
        self.router.transfer_to(peer, bundle.into()).await?;
        metrics::counter!("router.handshakes.sent").increment(1);
        Ok(())
    }

    #[cfg_attr(feature = "instrument", instrument(skip(self)))]
    async fn query(&self, peer: &Eid) -> Result<(), router::Error> {
        if !self.should_query(peer, OffsetDateTime::now_utc()) {
            trace!("Handshake with {peer} is rate limited");
            return Ok(());
        }

        let mut request = NodeHandshake::request();
        for extension in self.router.extensions() {
            extension.request_handshake(peer, &mut request);
        }

        debug!("Requesting routing state from {peer}");
        self.send(peer, peer.node().service(&ROUTING), &request).await
    }

    #[cfg_attr(feature = "instrument", instrument(skip(self)))]
    async fn announce(&self, peer: &Eid) -> Result<(), router::Error> {
        // Push what a peer configured like us would ask for
        let mut request = NodeHandshake::request();
        for extension in self.router.extensions() {
            extension.request_handshake(peer, &mut request);
        }

        let response = self.respond(peer, &request);
        debug!("Announcing routing state to {peer}");
        self.send(peer, peer.node().service(&ROUTING), &response).await
    }

    fn respond(&self, peer: &Eid, request: &NodeHandshake) -> NodeHandshake {
        let mut response = NodeHandshake::response(self.router.config().handshake.lifetime);
        for extension in self.router.extensions() {
            extension.response_handshake(peer, request, &mut response);
        }
        response
    }

    async fn process(&self, bundle: Bundle) -> Result<(), router::Error> {
        let source = bundle.meta.id.source.clone();
        let peer = source.node();
        let handshake = NodeHandshake::decode(bundle.payload)?;

        match handshake.message_type() {
            MessageType::Request => {
                let response = self.respond(&peer, &handshake);
                self.send(&peer, source, &response).await?;
                self.router.bus().raise(Event::Handshake {
                    state: HandshakeState::Replied,
                    peer,
                });
            }
            MessageType::Response => {
                for extension in self.router.extensions() {
                    extension.process_handshake(&peer, &handshake).await;
                }
                self.router.bus().raise(Event::Handshake {
                    state: HandshakeState::Completed,
                    peer,
                });
            }
        }
        Ok(())
    }

    async fn purge(&self, purge: &BloomFilter) {
        let now = OffsetDateTime::now_utc();
        loop {
            match self.router.storage().remove_matching(purge).await {
                Ok(meta) => {
                    info!("Bundle {} purged", meta.id);
                    self.router.add_purged_bundle(&meta, now);
                    self.router.bus().raise(Event::BundleDeleted { id: meta.id });
                }
                Err(storage::Error::NoBundleFound) => break,
                Err(e) => {
                    warn!("Failed to purge bundles: {e}");
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl Extension for NodeHandshakeExtension {
    fn name(&self) -> &'static str {
        "handshake"
    }

    fn notify(&self, event: &Event) {
        match event {
            Event::Handshake {
                state: HandshakeState::Request,
                peer,
            } => self.queue.push(Task::Query(peer.clone())),
            Event::Handshake {
                state: HandshakeState::Announce,
                peer,
            } => self.queue.push(Task::Announce(peer.clone())),
            Event::NodeAvailable { node } => self.queue.push(Task::Query(node.clone())),
            Event::ConnectionUp { peer } => self.queue.push(Task::Query(peer.clone())),
            Event::NodeUnavailable { node } => self.remove_from_blacklist(node),
            _ => {}
        }
    }

    fn request_handshake(&self, _peer: &Eid, request: &mut NodeHandshake) {
        request.add_request(PURGE_VECTOR);
    }

    fn response_handshake(&self, _peer: &Eid, request: &NodeHandshake, response: &mut NodeHandshake) {
        if request.has_request(SUMMARY_VECTOR) {
            response.add_vector(SUMMARY_VECTOR, &self.router.summary_vector());
        }
        if request.has_request(PURGE_VECTOR) {
            response.add_vector(PURGE_VECTOR, &self.router.purged_bundles());
        }
    }

    async fn process_handshake(&self, peer: &Eid, response: &NodeHandshake) {
        match response.vector(SUMMARY_VECTOR) {
            Some(Ok(filter)) => self.router.neighbors().update_bundles(
                peer,
                filter,
                Some(time::Duration::seconds(response.lifetime() as i64)),
                OffsetDateTime::now_utc(),
            ),
            Some(Err(e)) => warn!("Ignoring summary vector from {peer}: {e}"),
            None => {}
        }

        match response.vector(PURGE_VECTOR) {
            Some(Ok(purge)) => self.purge(&purge).await,
            Some(Err(e)) => warn!("Ignoring purge vector from {peer}: {e}"),
            None => {}
        }
    }

    async fn shutdown(&self) {
        self.router.unregister_endpoint(&self.endpoint);
        self.queue.abort();
        self.pool.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sdnv() {
        for (value, encoded) in [
            (0u64, &[0x00u8][..]),
            (127, &[0x7F]),
            (128, &[0x81, 0x00]),
            (0xABC, &[0x95, 0x3C]),
            (u64::MAX, &[0x81, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x7F]),
        ] {
            let mut buf = BytesMut::new();
            put_sdnv(&mut buf, value);
            assert_eq!(&buf[..], encoded);
            assert_eq!(get_sdnv(&mut buf.freeze()), Ok(value));
        }

        assert_eq!(get_sdnv(&mut &[0x81u8][..]), Err(Error::Truncated));
        assert_eq!(
            get_sdnv(&mut &[0x82u8, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x7F][..]),
            Err(Error::Overflow)
        );
    }

    #[test]
    fn request_message() {
        let mut request = NodeHandshake::request();
        request.add_request(PURGE_VECTOR);
        request.add_request(SUMMARY_VECTOR);
        assert_eq!(&request.encode()[..], &[1, 2, 1, 2]);

        let decoded = NodeHandshake::decode(request.encode()).unwrap();
        assert_eq!(decoded.message_type(), MessageType::Request);
        assert!(decoded.has_request(SUMMARY_VECTOR));
        assert!(decoded.has_request(PURGE_VECTOR));
        assert!(!decoded.has_request(3));
    }

    #[test]
    fn response_message() {
        let mut summary = BloomFilter::new(16, 2);
        summary.insert("[1.0] dtn://a");

        let mut response = NodeHandshake::response(60);
        response.add_vector(SUMMARY_VECTOR, &summary);
        response.add_item(99, Bytes::from_static(b"opaque"));

        let decoded = NodeHandshake::decode(response.encode()).unwrap();
        assert_eq!(decoded.message_type(), MessageType::Response);
        assert_eq!(decoded.lifetime(), 60);
        assert_eq!(decoded.vector(SUMMARY_VECTOR), Some(Ok(summary)));
        assert_eq!(decoded.vector(PURGE_VECTOR), None);
        assert_eq!(decoded.item(99).map(|b| &b[..]), Some(&b"opaque"[..]));
    }

    #[test]
    fn bad_messages() {
        assert_eq!(
            NodeHandshake::decode(Bytes::from_static(&[7])),
            Err(Error::InvalidType(7))
        );
        assert_eq!(
            NodeHandshake::decode(Bytes::from_static(&[2, 60, 1, 1, 10, 0])),
            Err(Error::Truncated)
        );

        let mut response = NodeHandshake::response(60);
        response.add_item(SUMMARY_VECTOR, Bytes::from_static(&[0, 0]));
        assert_eq!(
            response.vector(SUMMARY_VECTOR),
            Some(Err(Error::InvalidItem(SUMMARY_VECTOR, bloom::Error::Truncated)))
        );
    }
}
