use std::collections::HashMap;

use tracing::{debug, warn};

use crate::geoip::GeoAnnotator;
use crate::ruleset::{
    element_counter, element_literal, Counter, CounterValues, ElementKind, ElementSet, Rule,
    RulesetDump, RulesetEntry,
};
use crate::snapshot::{Labels, MetricSample, MetricType, SampleSet};

/// Turns a ruleset dump into a flat, deduplicated list of samples.
pub struct Translator<'a> {
    namespace: &'a str,
    geoip: &'a GeoAnnotator,
}

impl<'a> Translator<'a> {
    pub fn new(namespace: &'a str, geoip: &'a GeoAnnotator) -> Self {
        Self { namespace, geoip }
    }

    pub fn translate(&self, dump: &RulesetDump) -> Vec<MetricSample> {
        let mut samples = SampleSet::default();
        let mut chains = 0u64;
        let mut rules = 0u64;
        // rule position per (family, table, chain), used when a rule has no handle
        let mut positions: HashMap<(&str, &str, &str), u64> = HashMap::new();

        for entry in &dump.entries {
            match entry {
                RulesetEntry::Chain(_) => chains += 1,
                RulesetEntry::Rule(rule) => {
                    rules += 1;
                    let position = positions
                        .entry((rule.family.as_str(), rule.table.as_str(), rule.chain.as_str()))
                        .or_default();
                    self.inline_counters(&mut samples, rule, *position);
                    *position += 1;
                }
                RulesetEntry::Counter(counter) => self.named_counter(&mut samples, counter),
                RulesetEntry::Elements(kind, set) => self.elements(&mut samples, *kind, set),
                RulesetEntry::Malformed { kind, reason } => {
                    // still part of the ruleset, even if its attributes can't be read
                    match kind.as_str() {
                        "chain" => chains += 1,
                        "rule" => rules += 1,
                        _ => {}
                    }
                    warn!(msg = "Skipping malformed ruleset entry", %kind, %reason);
                }
                RulesetEntry::Metainfo(_) | RulesetEntry::Table(_) | RulesetEntry::Other(_) => {}
            }
        }

        samples.add(
            &self.metric("chains"),
            "Number of chains in nftables ruleset",
            MetricType::Gauge,
            Labels::new(),
            chains as f64,
        );
        samples.add(
            &self.metric("rules"),
            "Number of rules in nftables ruleset",
            MetricType::Gauge,
            Labels::new(),
            rules as f64,
        );

        debug!(samples = samples.len(), "Translated ruleset");
        samples.into_samples()
    }

    fn metric(&self, suffix: &str) -> String {
        format!("{}_{}", self.namespace, suffix)
    }

    fn named_counter(&self, samples: &mut SampleSet, counter: &Counter) {
        let labels = Labels::new()
            .with("family", &counter.family)
            .with("table", &counter.table)
            .with("name", &counter.name);
        self.counter_values(
            samples,
            CounterSource::Counter,
            labels,
            CounterValues {
                bytes: counter.bytes,
                packets: counter.packets,
            },
        );
    }

    /// Inline counters have no name, so one is derived from the chain and the
    /// rule handle (or the rule's position in the chain when there is no
    /// handle): `input:12`, then `input:12:1` for a second counter in the
    /// same rule.
    fn inline_counters(&self, samples: &mut SampleSet, rule: &Rule, position: u64) {
        let id = rule.handle.unwrap_or(position);
        for (idx, values) in rule.inline_counters().enumerate() {
            let name = if idx == 0 {
                format!("{}:{}", rule.chain, id)
            } else {
                format!("{}:{}:{}", rule.chain, id, idx)
            };
            let labels = Labels::new()
                .with("family", &rule.family)
                .with("table", &rule.table)
                .with("name", name);
            self.counter_values(samples, CounterSource::Counter, labels, values);
        }
    }

    fn counter_values(
        &self,
        samples: &mut SampleSet,
        source: CounterSource,
        labels: Labels,
        values: CounterValues,
    ) {
        let prefix = source.prefix();
        let (bytes_help, packets_help) = source.help();
        samples.add(
            &self.metric(&format!("{prefix}_bytes")),
            bytes_help,
            MetricType::Counter,
            labels.clone(),
            values.bytes as f64,
        );
        samples.add(
            &self.metric(&format!("{prefix}_packets")),
            packets_help,
            MetricType::Counter,
            labels,
            values.packets as f64,
        );
    }

    fn elements(&self, samples: &mut SampleSet, kind: ElementKind, set: &ElementSet) {
        if set.is_anonymous() {
            return;
        }

        let base = Labels::new()
            .with("family", &set.family)
            .with("table", &set.table)
            .with("name", &set.name)
            .with("type", set.type_.to_string());
        let annotate = self.geoip.is_active() && set.type_.is_ip_addr();
        let metric = self.metric(&format!("{}_elements", kind.as_str()));
        let help = elements_help(kind);

        if set.elem.is_empty() {
            let labels = if annotate {
                base.with("country", "")
            } else {
                base
            };
            samples.add(&metric, help, MetricType::Gauge, labels, 0.0);
            return;
        }

        for elem in &set.elem {
            let labels = if annotate {
                let country = element_literal(elem)
                    .map(|literal| self.geoip.resolve(&literal))
                    .unwrap_or_default();
                base.clone().with("country", country)
            } else {
                base.clone()
            };
            if let Some(values) = element_counter(elem) {
                self.counter_values(samples, CounterSource::Elements(kind), labels.clone(), values);
            }
            samples.add(&metric, help, MetricType::Gauge, labels, 1.0);
        }
    }
}

fn elements_help(kind: ElementKind) -> &'static str {
    match kind {
        ElementKind::Set => "Element count of named nftables sets",
        ElementKind::Map => "Element count of named nftables maps",
        ElementKind::Meter => "Element count of named nftables meters",
    }
}

/// Where a byte/packet pair comes from.
#[derive(Clone, Copy)]
enum CounterSource {
    Counter,
    Elements(ElementKind),
}

impl CounterSource {
    fn prefix(&self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Elements(ElementKind::Set) => "set_counter",
            Self::Elements(ElementKind::Map) => "map_counter",
            Self::Elements(ElementKind::Meter) => "meter_counter",
        }
    }

    fn help(&self) -> (&'static str, &'static str) {
        match self {
            Self::Counter => (
                "Byte value of nftables counters",
                "Packet value of nftables counters",
            ),
            Self::Elements(ElementKind::Set) => (
                "Byte value of nftables set element counters",
                "Packet value of nftables set element counters",
            ),
            Self::Elements(ElementKind::Map) => (
                "Byte value of nftables map element counters",
                "Packet value of nftables map element counters",
            ),
            Self::Elements(ElementKind::Meter) => (
                "Byte value of nftables meter element counters",
                "Packet value of nftables meter element counters",
            ),
        }
    }
}
