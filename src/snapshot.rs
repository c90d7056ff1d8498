use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use prometheus::proto;

use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn proto(&self) -> proto::MetricType {
        match self {
            Self::Counter => proto::MetricType::COUNTER,
            Self::Gauge => proto::MetricType::GAUGE,
        }
    }
}

/// Ordered label set, keys are unique.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Labels(Vec<(&'static str, String)>);

impl Labels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &'static str, value: impl Into<String>) {
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(existing) => existing.1 = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &str)> {
        self.0.iter().map(|(k, v)| (*k, v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub name: String,
    pub help: &'static str,
    pub kind: MetricType,
    pub labels: Labels,
    pub value: f64,
}

/// Accumulates samples keyed by `(name, labels)`. Adding to an existing
/// identity sums the values.
#[derive(Debug, Default)]
pub struct SampleSet {
    samples: BTreeMap<(String, Labels), (&'static str, MetricType, f64)>,
}

impl SampleSet {
    pub fn add(
        &mut self,
        name: &str,
        help: &'static str,
        kind: MetricType,
        labels: Labels,
        value: f64,
    ) {
        self.samples
            .entry((name.to_string(), labels))
            .and_modify(|(_, _, total)| *total += value)
            .or_insert((help, kind, value));
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn into_samples(self) -> Vec<MetricSample> {
        self.samples
            .into_iter()
            .map(|((name, labels), (help, kind, value))| MetricSample {
                name,
                help,
                kind,
                labels,
                value,
            })
            .collect()
    }
}

/// Result of one translation pass. `Snapshot::default()` is the not-ready
/// placeholder served before the first successful refresh.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub samples: Vec<MetricSample>,
    pub captured_at: Option<DateTime<Utc>>,
    pub success: bool,
}

impl Snapshot {
    pub fn new(samples: Vec<MetricSample>, captured_at: DateTime<Utc>) -> Self {
        Self {
            samples,
            captured_at: Some(captured_at),
            success: true,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.success
    }

    /// One family per metric name, labels kept in insertion order.
    /// Samples must be grouped by name, which `SampleSet` guarantees.
    pub fn metric_families(&self) -> Vec<proto::MetricFamily> {
        let mut families: Vec<proto::MetricFamily> = Vec::new();
        for sample in &self.samples {
            if families.last().map(|f| f.get_name()) != Some(sample.name.as_str()) {
                let mut family = proto::MetricFamily::default();
                family.set_name(sample.name.clone());
                family.set_help(sample.help.to_string());
                family.set_field_type(sample.kind.proto());
                families.push(family);
            }

            let mut metric = proto::Metric::default();
            for (key, value) in sample.labels.iter() {
                let mut pair = proto::LabelPair::default();
                pair.set_name(key.to_string());
                pair.set_value(value.to_string());
                metric.mut_label().push(pair);
            }
            match sample.kind {
                MetricType::Counter => {
                    let mut counter = proto::Counter::default();
                    counter.set_value(sample.value);
                    metric.set_counter(counter);
                }
                MetricType::Gauge => {
                    let mut gauge = proto::Gauge::default();
                    gauge.set_value(sample.value);
                    metric.set_gauge(gauge);
                }
            }
            if let Some(family) = families.last_mut() {
                family.mut_metric().push(metric);
            }
        }
        families
    }

    /// Renders the samples in the Prometheus text exposition format.
    pub fn render(&self) -> String {
        metrics::encode_families(&self.metric_families())
    }
}

/// Holds the last good snapshot. Readers never block and always see a
/// complete snapshot.
#[derive(Debug, Default)]
pub struct SnapshotCache(ArcSwap<Snapshot>);

impl SnapshotCache {
    pub fn publish(&self, snapshot: Snapshot) {
        self.0.store(Arc::new(snapshot));
    }

    pub fn load(&self) -> Arc<Snapshot> {
        self.0.load_full()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::{Labels, MetricType, SampleSet, Snapshot, SnapshotCache};

    fn counter_labels(name: &str) -> Labels {
        Labels::new()
            .with("family", "inet")
            .with("table", "filter")
            .with("name", name)
    }

    #[test]
    fn colliding_samples_are_summed() {
        let mut set = SampleSet::default();
        set.add("x", "help", MetricType::Gauge, counter_labels("a"), 2.0);
        set.add("x", "help", MetricType::Gauge, counter_labels("a"), 3.0);
        set.add("x", "help", MetricType::Gauge, counter_labels("b"), 1.0);

        let samples = set.into_samples();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].labels.get("name"), Some("a"));
        assert_eq!(samples[0].value, 5.0);
    }

    #[test]
    fn label_insert_replaces_existing_key() {
        let labels = Labels::new().with("country", "US").with("country", "DE");
        assert_eq!(labels.iter().count(), 1);
        assert_eq!(labels.get("country"), Some("DE"));
    }

    #[test]
    fn renders_exposition_lines() {
        let mut set = SampleSet::default();
        set.add(
            "nftables_counter_bytes",
            "Byte value of named nftables counters",
            MetricType::Counter,
            counter_labels("http-allowed"),
            90576.0,
        );
        set.add(
            "nftables_chains",
            "Number of chains in nftables ruleset",
            MetricType::Gauge,
            Labels::new(),
            3.0,
        );
        let snapshot = Snapshot::new(set.into_samples(), Utc::now());

        let expected = "# HELP nftables_chains Number of chains in nftables ruleset\n\
# TYPE nftables_chains gauge\n\
nftables_chains 3\n\
# HELP nftables_counter_bytes Byte value of named nftables counters\n\
# TYPE nftables_counter_bytes counter\n\
nftables_counter_bytes{family=\"inet\",table=\"filter\",name=\"http-allowed\"} 90576\n";
        assert_eq!(snapshot.render(), expected);
    }

    #[test]
    fn one_family_per_name_keeps_label_order() {
        let mut set = SampleSet::default();
        for name in ["a", "b"] {
            set.add(
                "nftables_counter_packets",
                "Packet value of named nftables counters",
                MetricType::Counter,
                counter_labels(name),
                1.0,
            );
        }
        let snapshot = Snapshot::new(set.into_samples(), Utc::now());

        let families = snapshot.metric_families();
        assert_eq!(families.len(), 1);
        assert_eq!(
            families[0].get_field_type(),
            prometheus::proto::MetricType::COUNTER
        );
        assert_eq!(families[0].get_metric().len(), 2);
        let keys: Vec<&str> = families[0].get_metric()[0]
            .get_label()
            .iter()
            .map(|pair| pair.get_name())
            .collect();
        assert_eq!(keys, ["family", "table", "name"]);
    }

    #[test]
    fn escapes_label_values() {
        let mut set = SampleSet::default();
        set.add(
            "m",
            "h",
            MetricType::Gauge,
            Labels::new().with("name", "a\"b\\c\nd"),
            1.0,
        );
        let snapshot = Snapshot::new(set.into_samples(), Utc::now());
        assert!(snapshot
            .render()
            .contains(r#"m{name="a\"b\\c\nd"} 1"#));
    }

    #[test]
    fn cache_starts_not_ready() {
        let cache = SnapshotCache::default();
        let snapshot = cache.load();
        assert!(!snapshot.is_ready());
        assert!(snapshot.captured_at.is_none());
        assert!(snapshot.samples.is_empty());
    }

    #[test]
    fn publish_replaces_whole_snapshot() {
        let cache = SnapshotCache::default();
        let first = Snapshot::new(Vec::new(), Utc::now());
        cache.publish(first.clone());
        let held = cache.load();
        assert_eq!(*held, first);

        let second = Snapshot::new(Vec::new(), Utc::now());
        cache.publish(second.clone());
        assert_eq!(*cache.load(), second);
        // readers holding the previous snapshot keep it intact
        assert_eq!(*held, first);
    }
}
