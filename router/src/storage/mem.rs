use super::*;
use std::{num::NonZeroUsize, sync::Mutex};

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Config {
    #[cfg_attr(feature = "serde", serde(rename = "max-bundles"))]
    pub max_bundles: NonZeroUsize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_bundles: NonZeroUsize::new(4096).trace_expect("Invalid default capacity"),
        }
    }
}

/// An in-memory [`BundleStorage`].
///
/// When full, storing a new bundle evicts the least recently stored one.
pub struct Storage {
    cache: Mutex<lru::LruCache<BundleId, Bundle>>,
}

impl Storage {
    pub fn new(config: &Config) -> Arc<dyn BundleStorage> {
        Arc::new(Self {
            cache: Mutex::new(lru::LruCache::new(config.max_bundles)),
        })
    }
}

#[async_trait]
impl BundleStorage for Storage {
    async fn store(&self, bundle: Bundle) -> Result<()> {
        let id = bundle.meta.id.clone();
        match self
            .cache
            .lock()
            .trace_expect("Failed to lock mutex")
            .push(id.clone(), bundle)
        {
            Some((previous, _)) if previous == id => trace!("Bundle {id} stored again"),
            Some((evicted, _)) => debug!("Evicted bundle {evicted} to make room for {id}"),
            None => {}
        }
        Ok(())
    }

    async fn get(&self, id: &BundleId) -> Result<Bundle> {
        self.cache
            .lock()
            .trace_expect("Failed to lock mutex")
            .peek(id)
            .cloned()
            .ok_or(Error::NoBundleFound)
    }

    async fn query(&self, filter: &dyn BundleFilter) -> Result<Vec<MetaBundle>> {
        let limit = filter.limit();
        Ok(self
            .cache
            .lock()
            .trace_expect("Failed to lock mutex")
            .iter()
            .rev()
            .map(|(_, bundle)| &bundle.meta)
            .filter(|meta| filter.should_add(meta))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn remove(&self, id: &BundleId) -> Result<MetaBundle> {
        self.cache
            .lock()
            .trace_expect("Failed to lock mutex")
            .pop(id)
            .map(|bundle| bundle.meta)
            .ok_or(Error::NoBundleFound)
    }

    async fn remove_matching(&self, filter: &BloomFilter) -> Result<MetaBundle> {
        let mut cache = self.cache.lock().trace_expect("Failed to lock mutex");
        let id = cache
            .iter()
            .rev()
            .find(|(id, _)| filter.contains(&id.to_string()))
            .map(|(id, _)| id.clone())
            .ok_or(Error::NoBundleFound)?;
        cache
            .pop(&id)
            .map(|bundle| bundle.meta)
            .ok_or(Error::NoBundleFound)
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.cache.lock().trace_expect("Failed to lock mutex").len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::OffsetDateTime;

    fn bundle(seq: u64, destination: &str) -> Bundle {
        Bundle::new(
            MetaBundle::new(
                BundleId::new("dtn://src/app".parse().unwrap(), 10, seq),
                destination.parse().unwrap(),
                time::Duration::hours(1),
                OffsetDateTime::UNIX_EPOCH,
            ),
            Bytes::from_static(b"payload"),
        )
    }

    struct ToNode(eid::Eid, usize);

    impl BundleFilter for ToNode {
        fn limit(&self) -> usize {
            self.1
        }

        fn should_add(&self, meta: &MetaBundle) -> bool {
            meta.destination.same_node(&self.0)
        }
    }

    #[tokio::test]
    async fn store_and_get() {
        let storage = Storage::new(&Config::default());
        storage.store(bundle(1, "dtn://a/x")).await.unwrap();
        storage.store(bundle(1, "dtn://a/x")).await.unwrap();
        assert_eq!(storage.count().await.unwrap(), 1);

        let b = storage.get(bundle(1, "dtn://a/x").id()).await.unwrap();
        assert_eq!(b.meta.size, 7);
        assert!(matches!(
            storage.get(bundle(2, "dtn://a/x").id()).await,
            Err(Error::NoBundleFound)
        ));
    }

    #[tokio::test]
    async fn query_respects_filter_and_limit() {
        let storage = Storage::new(&Config::default());
        for seq in 0..5 {
            storage.store(bundle(seq, "dtn://a/x")).await.unwrap();
        }
        storage.store(bundle(9, "dtn://b/x")).await.unwrap();

        let found = storage
            .query(&ToNode("dtn://a".parse().unwrap(), 3))
            .await
            .unwrap();
        assert_eq!(
            found.iter().map(|m| m.id.sequence).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[tokio::test]
    async fn drain_by_filter() {
        let storage = Storage::new(&Config::default());
        let mut filter = BloomFilter::default();
        for seq in 0..3 {
            let b = bundle(seq, "dtn://a/x");
            if seq != 1 {
                filter.insert(&b.id().to_string());
            }
            storage.store(b).await.unwrap();
        }

        let mut purged = Vec::new();
        loop {
            match storage.remove_matching(&filter).await {
                Ok(meta) => purged.push(meta.id.sequence),
                Err(Error::NoBundleFound) => break,
                Err(e) => panic!("{e}"),
            }
        }
        assert_eq!(purged, vec![0, 2]);
        assert_eq!(storage.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn evicts_oldest() {
        let storage = Storage::new(&Config {
            max_bundles: NonZeroUsize::new(2).unwrap(),
        });
        for seq in 0..3 {
            storage.store(bundle(seq, "dtn://a/x")).await.unwrap();
        }
        assert!(storage.get(bundle(0, "dtn://a/x").id()).await.is_err());
        assert!(storage.get(bundle(2, "dtn://a/x").id()).await.is_ok());
    }
}
