use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument};

use crate::geoip::GeoAnnotator;
use crate::metrics::{GEOIP_CACHE_ENTRIES, LAST_REFRESH_SUCCESS, REFRESH_COUNTER, REFRESH_DURATION};
use crate::snapshot::{Snapshot, SnapshotCache};
use crate::source::{RulesetSource, SourceError};
use crate::translate::Translator;
use crate::Config;

/// Periodically pulls the ruleset, translates it and publishes the result.
pub struct Refresher<S> {
    source: S,
    cache: Arc<SnapshotCache>,
    geoip: GeoAnnotator,
    namespace: String,
    period: Duration,
    timeout: Duration,
}

impl<S: RulesetSource> Refresher<S> {
    pub fn new(source: S, cache: Arc<SnapshotCache>, geoip: GeoAnnotator, config: &Config) -> Self {
        Self {
            source,
            cache,
            geoip,
            namespace: config.namespace.clone(),
            period: config.update_period,
            timeout: config.nft_timeout,
        }
    }

    /// Runs one cycle. On error the cached snapshot is left untouched.
    #[instrument(skip(self))]
    pub async fn refresh_once(&self) -> Result<(), SourceError> {
        let start = Instant::now();
        let dump = tokio::time::timeout(self.timeout, self.source.fetch())
            .await
            .map_err(|_| SourceError::Timeout(self.timeout))??;

        let samples = Translator::new(&self.namespace, &self.geoip).translate(&dump);
        let snapshot = Snapshot::new(samples, chrono::Utc::now());
        let captured_at = snapshot.captured_at.map(|t| t.timestamp()).unwrap_or_default();
        info!(
            msg = "Published snapshot",
            samples = snapshot.samples.len(),
            entries = dump.entries.len()
        );
        self.cache.publish(snapshot);

        LAST_REFRESH_SUCCESS.set(captured_at);
        REFRESH_DURATION.set(start.elapsed().as_secs_f64());
        GEOIP_CACHE_ENTRIES.set(self.geoip.cached_len() as i64);
        Ok(())
    }

    /// Refreshes on every tick until `shutdown` changes. Cycles start on the
    /// period grid; a tick whose deadline fell inside a running cycle is
    /// dropped, not queued, so the next cycle waits for the following tick.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), anyhow::Error> {
        info!(msg = "Starting refresh loop", period = ?self.period, timeout = ?self.timeout);
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_finished: Option<tokio::time::Instant> = None;

        loop {
            let scheduled = tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    info!("Stopping refresh loop");
                    return Ok(());
                }
                scheduled = interval.tick() => scheduled,
            };
            if last_finished.is_some_and(|finished| scheduled < finished) {
                debug!(msg = "Dropping tick missed during refresh");
                continue;
            }

            match self.refresh_once().await {
                Ok(()) => REFRESH_COUNTER.with_label_values(&["success"]).inc(),
                Err(err) => {
                    REFRESH_COUNTER.with_label_values(&["failure"]).inc();
                    error!(msg = "Refresh failed, keeping previous snapshot", %err);
                }
            }
            last_finished = Some(tokio::time::Instant::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::watch;

    use super::Refresher;
    use crate::geoip::GeoAnnotator;
    use crate::ruleset::RulesetDump;
    use crate::snapshot::SnapshotCache;
    use crate::source::{RulesetSource, SourceError};
    use crate::Config;

    /// Hands out queued results in order, then keeps failing.
    #[derive(Default)]
    struct FixtureSource {
        results: Mutex<VecDeque<Result<RulesetDump, SourceError>>>,
        delay: Option<Duration>,
        starts: Arc<Mutex<Vec<tokio::time::Instant>>>,
    }

    impl FixtureSource {
        fn push(&self, result: Result<RulesetDump, SourceError>) {
            self.results.lock().unwrap().push_back(result);
        }
    }

    impl RulesetSource for FixtureSource {
        async fn fetch(&self) -> Result<RulesetDump, SourceError> {
            self.starts.lock().unwrap().push(tokio::time::Instant::now());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(SourceError::MissingMetainfo))
        }
    }

    fn config(period: Duration, timeout: Duration) -> Config {
        Config {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            update_period: period,
            namespace: String::from("nftables"),
            nft_path: PathBuf::from("nft"),
            nft_timeout: timeout,
            geoip_database: None,
        }
    }

    fn counter_dump(bytes: u64) -> RulesetDump {
        RulesetDump::from_values([
            json!({"metainfo": {"json_schema_version": 1}}),
            json!({"counter": {"family": "inet", "table": "filter", "name": "http-allowed", "bytes": bytes, "packets": 1}}),
        ])
    }

    fn refresher(source: FixtureSource, cache: Arc<SnapshotCache>, timeout: Duration) -> Refresher<FixtureSource> {
        Refresher::new(
            source,
            cache,
            GeoAnnotator::disabled(),
            &config(Duration::from_secs(60), timeout),
        )
    }

    #[tokio::test]
    async fn success_publishes_snapshot() {
        let cache = Arc::new(SnapshotCache::default());
        let source = FixtureSource::default();
        source.push(Ok(counter_dump(90576)));
        let refresher = refresher(source, cache.clone(), Duration::from_secs(1));

        refresher.refresh_once().await.unwrap();

        let snapshot = cache.load();
        assert!(snapshot.is_ready());
        assert!(snapshot.captured_at.is_some());
        assert!(snapshot.render().contains(
            "nftables_counter_bytes{family=\"inet\",table=\"filter\",name=\"http-allowed\"} 90576"
        ));
    }

    #[tokio::test]
    async fn failure_keeps_previous_snapshot() {
        let cache = Arc::new(SnapshotCache::default());
        let source = FixtureSource::default();
        source.push(Ok(counter_dump(1)));
        source.push(Err(SourceError::UnsupportedSchema(2)));
        let refresher = refresher(source, cache.clone(), Duration::from_secs(1));

        refresher.refresh_once().await.unwrap();
        let before = cache.load();

        assert!(refresher.refresh_once().await.is_err());
        let after = cache.load();
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(before.captured_at, after.captured_at);
    }

    #[tokio::test]
    async fn failure_before_first_success_stays_not_ready() {
        let cache = Arc::new(SnapshotCache::default());
        let refresher = refresher(FixtureSource::default(), cache.clone(), Duration::from_secs(1));

        assert!(refresher.refresh_once().await.is_err());
        assert!(!cache.load().is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_source_times_out() {
        let cache = Arc::new(SnapshotCache::default());
        let source = FixtureSource {
            delay: Some(Duration::from_secs(30)),
            ..Default::default()
        };
        source.push(Ok(counter_dump(1)));
        let refresher = refresher(source, cache.clone(), Duration::from_secs(5));

        let result = refresher.refresh_once().await;
        assert!(matches!(result, Err(SourceError::Timeout(_))));
        assert!(!cache.load().is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn run_drops_ticks_while_refreshing_and_stops_on_shutdown() {
        let cache = Arc::new(SnapshotCache::default());
        let starts = Arc::new(Mutex::new(Vec::new()));
        let source = FixtureSource {
            // each cycle takes longer than two periods
            delay: Some(Duration::from_secs(25)),
            starts: starts.clone(),
            ..Default::default()
        };
        for bytes in 0..10 {
            source.push(Ok(counter_dump(bytes)));
        }
        let refresher = Refresher::new(
            source,
            cache.clone(),
            GeoAnnotator::disabled(),
            &config(Duration::from_secs(10), Duration::from_secs(60)),
        );

        let origin = tokio::time::Instant::now();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(refresher.run(shutdown_rx));

        tokio::time::sleep(Duration::from_secs(95)).await;
        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();

        // ticks at 10, 40 and 70 land inside a cycle and are dropped
        let offsets: Vec<u64> = starts
            .lock()
            .unwrap()
            .iter()
            .map(|start| start.duration_since(origin).as_secs())
            .collect();
        assert_eq!(offsets, [0, 30, 60, 90]);
        assert!(cache.load().is_ready());
    }
}
