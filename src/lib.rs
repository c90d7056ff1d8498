pub mod cli;
pub mod exporter;
pub mod geoip;
pub mod metrics;
pub mod refresher;
pub mod ruleset;
pub mod snapshot;
pub mod source;
pub mod tracing_setup;
pub mod translate;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use geoip::GeoAnnotator;
use refresher::Refresher;
use snapshot::SnapshotCache;
use source::NftCli;
use tracing::info;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub update_period: Duration,
    pub namespace: String,
    pub nft_path: PathBuf,
    pub nft_timeout: Duration,
    pub geoip_database: Option<PathBuf>,
}

/// Everything that lives for the whole process: the shared snapshot cache
/// and the refresher feeding it.
pub struct App {
    pub cache: Arc<SnapshotCache>,
    pub refresher: Refresher<NftCli>,
    pub config: Config,
}

impl App {
    pub fn new(config: Config) -> Self {
        let geoip = match &config.geoip_database {
            Some(path) => GeoAnnotator::open(path),
            None => {
                info!("GeoIP lookup disabled");
                GeoAnnotator::disabled()
            }
        };
        let cache = Arc::new(SnapshotCache::default());
        let refresher = Refresher::new(
            NftCli::new(config.nft_path.clone()),
            cache.clone(),
            geoip,
            &config,
        );

        Self {
            cache,
            refresher,
            config,
        }
    }
}
