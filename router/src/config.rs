use super::*;
use std::path::PathBuf;

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct EpidemicConfig {
    /// Bundles offered to a neighbor per search
    pub search_limit: usize,

    /// How long a purged bundle stays in the purge vector, in seconds
    pub purge_retention: u64,

    /// Seconds between summary vector announcements
    pub announce_interval: u64,
}

impl Default for EpidemicConfig {
    fn default() -> Self {
        Self {
            search_limit: 10,
            purge_retention: 3600,
            announce_interval: 5,
        }
    }
}

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct HandshakeConfig {
    /// Minimum seconds between two queries to the same peer
    pub query_interval: u64,

    /// Lifetime of handshake bundles and of the state they carry, in seconds
    pub lifetime: u64,

    pub hop_limit: u32,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            query_interval: 60,
            lifetime: 60,
            hop_limit: 1,
        }
    }
}

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RetransmissionConfig {
    /// Failed attempts tolerated before giving up
    pub ceiling: u32,

    /// Retry delay is `backoff_base ^ attempts` seconds
    pub backoff_base: u64,
}

impl Default for RetransmissionConfig {
    fn default() -> Self {
        Self {
            ceiling: 8,
            backoff_base: 2,
        }
    }
}

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct CustodyConfig {
    /// Bundles we accept custody of at once
    pub capacity: usize,

    /// Seconds to wait for a custody signal before retransmitting
    pub timeout: u64,
}

impl Default for CustodyConfig {
    fn default() -> Self {
        Self {
            capacity: 200,
            timeout: 60,
        }
    }
}

#[derive(Debug, Default, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct StaticRoutesConfig {
    /// Inline rules, in route file syntax
    pub routes: Vec<String>,

    pub routes_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Config {
    pub max_transfers_per_neighbor: usize,

    /// Seconds between time ticks, 0 disables the internal clock
    pub tick_interval: u64,

    /// Summary vector size in bytes
    pub summary_vector_length: usize,

    pub epidemic: EpidemicConfig,
    pub handshake: HandshakeConfig,
    pub retransmission: RetransmissionConfig,
    pub custody: CustodyConfig,
    pub static_routes: StaticRoutesConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_transfers_per_neighbor: 5,
            tick_interval: 1,
            summary_vector_length: bloom::BloomFilter::DEFAULT_LENGTH,
            epidemic: EpidemicConfig::default(),
            handshake: HandshakeConfig::default(),
            retransmission: RetransmissionConfig::default(),
            custody: CustodyConfig::default(),
            static_routes: StaticRoutesConfig::default(),
        }
    }
}

#[cfg(all(test, feature = "serde"))]
mod tests {
    use super::*;

    #[test]
    fn partial_config() {
        let config: Config = serde_json::from_str(
            r#"{
                "max_transfers_per_neighbor": 3,
                "retransmission": { "ceiling": 4 },
                "static_routes": { "routes": ["dtn://a* via dtn://gw"] }
            }"#,
        )
        .unwrap();
        assert_eq!(config.max_transfers_per_neighbor, 3);
        assert_eq!(config.retransmission.ceiling, 4);
        assert_eq!(config.retransmission.backoff_base, 2);
        assert_eq!(config.epidemic.search_limit, 10);
        assert_eq!(config.static_routes.routes.len(), 1);
    }
}
