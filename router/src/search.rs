use super::*;
use bundle::MetaBundle;
use eid::Eid;
use neighbor::NeighborEntry;
use router::BaseRouter;
use storage::BundleFilter;
use time::OffsetDateTime;

/// Which stored bundles are offered to a neighbor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Everything the neighbor's summary vector does not list
    Epidemic,
    /// Only bundles addressed to the neighbor's own node
    Unicast,
    /// Everything not yet confirmed to the neighbor
    Flood,
}

/// Selects the bundles to offer `peer`, from a snapshot of its entry.
pub struct SearchFilter<'a> {
    router: &'a BaseRouter,
    entry: NeighborEntry,
    mode: Mode,
    limit: usize,
    now: OffsetDateTime,
}

impl<'a> SearchFilter<'a> {
    pub fn new(router: &'a BaseRouter, entry: NeighborEntry, mode: Mode, limit: usize) -> Self {
        Self {
            router,
            entry,
            mode,
            limit,
            now: OffsetDateTime::now_utc(),
        }
    }

    fn for_peer(&self, meta: &MetaBundle) -> bool {
        meta.destination.same_node(self.entry.eid())
    }
}

impl BundleFilter for SearchFilter<'_> {
    fn limit(&self) -> usize {
        self.limit
    }

    fn should_add(&self, meta: &MetaBundle) -> bool {
        if meta.has_expired(self.now) || self.router.is_local(meta) {
            return false;
        }

        // Handshakes are exchanged, never routed
        if meta.id.source.is_service(&handshake::ROUTING) {
            return false;
        }

        match meta.hop_limit {
            Some(0) => return false,
            Some(1) if !self.for_peer(meta) => return false,
            _ => {}
        }

        match self.mode {
            Mode::Unicast => self.for_peer(meta) && self.entry.has(&meta.id, false) == Ok(false),
            Mode::Epidemic => !self.for_peer(meta) && self.entry.has(&meta.id, true) == Ok(false),
            Mode::Flood => !self.for_peer(meta) && self.entry.has(&meta.id, false) == Ok(false),
        }
    }
}

/// Offers `peer` the bundles selected by `mode`, one transfer slot each.
///
/// Stops early once the neighbor has no free slot left. Returns the number
/// of bundles handed to the transport.
pub async fn transfer_bundles(
    router: &BaseRouter,
    peer: &Eid,
    mode: Mode,
    limit: usize,
) -> Result<usize, router::Error> {
    let entry = router.neighbors().get(peer)?;
    if !entry.is_available() {
        return Err(neighbor::Error::NeighborNotAvailable(peer.clone()).into());
    }
    if !entry.has_free_slot() {
        trace!("No free transfer slot to {peer}");
        return Ok(0);
    }

    let candidates = router
        .storage()
        .query(&SearchFilter::new(router, entry, mode, limit))
        .await?;

    let mut sent = 0;
    for meta in candidates {
        match router.forward(peer, &meta.id).await {
            Ok(()) => sent += 1,
            Err(router::Error::Neighbor(neighbor::Error::AlreadyInTransit(_))) => {}
            Err(router::Error::Neighbor(neighbor::Error::NoMoreTransfersAvailable(_))) => break,
            Err(e) if e.is_no_bundle_found() => {}
            Err(e) => return Err(e),
        }
    }

    if sent > 0 {
        debug!("Offered {sent} bundles to {peer} ({mode:?})");
    }
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bloom::BloomFilter;
    use bundle::BundleId;
    use events::EventBus;
    use storage::BundleStorage;

    struct NoTransport;

    #[async_trait]
    impl transport::Transport for NoTransport {
        async fn queue(&self, peer: &Eid, _bundle: bundle::Bundle) -> transport::Result<()> {
            Err(transport::Error::Unreachable(peer.clone()))
        }
    }

    fn eid(s: &str) -> Eid {
        s.parse().unwrap()
    }

    fn meta(seq: u64, destination: &str) -> MetaBundle {
        MetaBundle::new(
            BundleId::new(eid("dtn://src/app"), 1, seq),
            eid(destination),
            time::Duration::hours(1),
            OffsetDateTime::now_utc(),
        )
    }

    fn router() -> Arc<BaseRouter> {
        BaseRouter::new(
            &config::Config::default(),
            eid("dtn://local"),
            storage::mem::Storage::new(&Default::default()),
            Arc::new(NoTransport),
            Arc::new(EventBus::new()),
        )
    }

    fn entry(router: &BaseRouter, known: &[&MetaBundle]) -> NeighborEntry {
        let peer = eid("dtn://peer");
        router
            .neighbors()
            .set_available(&peer, OffsetDateTime::now_utc());
        let mut filter = BloomFilter::default();
        for meta in known {
            filter.insert(&meta.id.to_string());
        }
        router
            .neighbors()
            .update_bundles(&peer, filter, None, OffsetDateTime::now_utc());
        router.neighbors().get(&peer).unwrap()
    }

    #[test]
    fn epidemic_skips_known() {
        let router = router();
        let known = meta(1, "dtn://far/app");
        let unknown = meta(2, "dtn://far/app");
        let filter = SearchFilter::new(&router, entry(&router, &[&known]), Mode::Epidemic, 10);

        assert!(!filter.should_add(&known));
        assert!(filter.should_add(&unknown));

        // Direct delivery is left to unicast routing
        assert!(!filter.should_add(&meta(3, "dtn://peer/app")));
        assert!(!filter.should_add(&meta(4, "dtn://local/app")));
    }

    #[test]
    fn unicast_only_for_peer() {
        let router = router();
        let filter = SearchFilter::new(&router, entry(&router, &[]), Mode::Unicast, 10);
        assert!(filter.should_add(&meta(1, "dtn://peer/app")));
        assert!(!filter.should_add(&meta(2, "dtn://far/app")));
    }

    #[test]
    fn scope_control() {
        let router = router();
        let filter = SearchFilter::new(&router, entry(&router, &[]), Mode::Flood, 10);

        let mut exhausted = meta(1, "dtn://far/app");
        exhausted.hop_limit = Some(0);
        assert!(!filter.should_add(&exhausted));

        let mut last_hop = meta(2, "dtn://far/app");
        last_hop.hop_limit = Some(1);
        assert!(!filter.should_add(&last_hop));

        last_hop.hop_limit = Some(2);
        assert!(filter.should_add(&last_hop));

        let handshake = MetaBundle::new(
            BundleId::new(eid("dtn://local/routing"), 1, 3),
            eid("dtn://far/routing"),
            time::Duration::minutes(1),
            OffsetDateTime::now_utc(),
        );
        assert!(!filter.should_add(&handshake));
    }

    #[tokio::test]
    async fn slots_released_on_transport_failure() {
        let router = router();
        let peer = eid("dtn://peer");
        entry(&router, &[]);
        for seq in 0..3 {
            router
                .storage()
                .store(bundle::Bundle::new(meta(seq, "dtn://far/app"), Bytes::new()))
                .await
                .unwrap();
        }

        assert!(matches!(
            transfer_bundles(&router, &peer, Mode::Epidemic, 10).await,
            Err(router::Error::Transport(transport::Error::Unreachable(_)))
        ));
        assert_eq!(router.neighbors().get(&peer).unwrap().transfers(), 0);
    }
}
