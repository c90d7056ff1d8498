use std::fmt::Display;

use ipnet::IpNet;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

/// A full `nft --json list ruleset` dump, decoded entry by entry.
#[derive(Debug, Clone, Default)]
pub struct RulesetDump {
    pub entries: Vec<RulesetEntry>,
}

#[derive(Debug, Deserialize)]
struct RawDump {
    nftables: Vec<Value>,
}

impl RulesetDump {
    /// Only the outer `{"nftables": [...]}` shape is required to be valid,
    /// a broken entry is kept as [`RulesetEntry::Malformed`].
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        let raw: RawDump = serde_json::from_slice(bytes)?;
        Ok(Self::from_values(raw.nftables))
    }

    pub fn from_values(values: impl IntoIterator<Item = Value>) -> Self {
        Self {
            entries: values.into_iter().map(RulesetEntry::decode).collect(),
        }
    }

    pub fn schema_version(&self) -> Option<u64> {
        self.entries.iter().find_map(|entry| match entry {
            RulesetEntry::Metainfo(meta) => Some(meta.json_schema_version),
            _ => None,
        })
    }
}

#[derive(Debug, Clone)]
pub enum RulesetEntry {
    Metainfo(Metainfo),
    Table(Table),
    Chain(Chain),
    Rule(Rule),
    Counter(Counter),
    Elements(ElementKind, ElementSet),
    Malformed { kind: String, reason: String },
    Other(String),
}

impl RulesetEntry {
    fn decode(value: Value) -> Self {
        let Value::Object(object) = value else {
            return Self::Malformed {
                kind: String::from("<unknown>"),
                reason: String::from("entry is not an object"),
            };
        };
        let Some((kind, body)) = object.into_iter().next() else {
            return Self::Malformed {
                kind: String::from("<unknown>"),
                reason: String::from("entry has no kind"),
            };
        };

        let decoded = match kind.as_str() {
            "metainfo" => serde_json::from_value(body).map(Self::Metainfo),
            "table" => serde_json::from_value(body).map(Self::Table),
            "chain" => serde_json::from_value(body).map(Self::Chain),
            "rule" => serde_json::from_value(body).map(Self::Rule),
            "counter" => serde_json::from_value(body).map(Self::Counter),
            "set" => serde_json::from_value(body).map(|set| Self::Elements(ElementKind::Set, set)),
            "map" => serde_json::from_value(body).map(|set| Self::Elements(ElementKind::Map, set)),
            "meter" => {
                serde_json::from_value(body).map(|set| Self::Elements(ElementKind::Meter, set))
            }
            _ => return Self::Other(kind.clone()),
        };

        decoded.unwrap_or_else(|err| Self::Malformed {
            kind,
            reason: err.to_string(),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Metainfo {
    pub json_schema_version: u64,
    pub version: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Table {
    pub family: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chain {
    pub family: String,
    pub table: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Rule {
    pub family: String,
    pub table: String,
    pub chain: String,
    pub handle: Option<u64>,
    #[serde(default)]
    pub expr: Vec<Value>,
}

impl Rule {
    /// Counter statements written inline in the rule, e.g. `tcp dport 22 counter accept`.
    /// References to named counters (`counter name "ssh"`) are not included.
    pub fn inline_counters(&self) -> impl Iterator<Item = CounterValues> + '_ {
        self.expr.iter().filter_map(|stmt| {
            let counter = stmt.get("counter")?;
            if !counter.is_object() {
                return None;
            }
            serde_json::from_value(counter.clone())
                .inspect_err(|err| {
                    warn!(msg = "Skipping malformed inline counter", chain = %self.chain, handle = ?self.handle, %err);
                })
                .ok()
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Counter {
    pub family: String,
    pub table: String,
    pub name: String,
    #[serde(default)]
    pub bytes: u64,
    #[serde(default)]
    pub packets: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct CounterValues {
    #[serde(default)]
    pub bytes: u64,
    #[serde(default)]
    pub packets: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    Set,
    Map,
    Meter,
}

impl ElementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Set => "set",
            Self::Map => "map",
            Self::Meter => "meter",
        }
    }
}

/// Named set, map or meter together with its elements.
#[derive(Debug, Clone, Deserialize)]
pub struct ElementSet {
    pub family: String,
    pub table: String,
    pub name: String,
    #[serde(rename = "type")]
    pub type_: DataType,
    #[serde(default)]
    pub flags: Flags,
    #[serde(default)]
    pub elem: Vec<Value>,
}

impl ElementSet {
    pub fn is_anonymous(&self) -> bool {
        self.name.starts_with("__") || self.flags.contains("anonymous")
    }
}

/// Older nft releases print a single flag as a bare string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Flags {
    One(String),
    Many(Vec<String>),
}

impl Default for Flags {
    fn default() -> Self {
        Self::Many(Vec::new())
    }
}

impl Flags {
    pub fn contains(&self, flag: &str) -> bool {
        match self {
            Self::One(f) => f == flag,
            Self::Many(flags) => flags.iter().any(|f| f == flag),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum DataType {
    Single(String),
    Concat(Vec<String>),
}

impl DataType {
    pub fn is_ip_addr(&self) -> bool {
        matches!(self, Self::Single(t) if t == "ipv4_addr" || t == "ipv6_addr")
    }
}

impl Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Single(t) => f.write_str(t),
            Self::Concat(types) => f.write_str(&types.join(" . ")),
        }
    }
}

/// Key literal of a set element, as far as one can be extracted.
///
/// Handles bare values, `{"elem": {"val": ..}}` wrappers, prefixes, ranges
/// and `[key, value]` map pairs. Concatenations have no single literal.
pub fn element_literal(elem: &Value) -> Option<String> {
    match elem {
        Value::String(s) => Some(prefix_address(s).unwrap_or_else(|| s.clone())),
        Value::Number(n) => Some(n.to_string()),
        Value::Array(pair) => pair.first().and_then(element_literal),
        Value::Object(object) => {
            if let Some(inner) = object.get("elem") {
                return inner.get("val").and_then(element_literal);
            }
            if let Some(prefix) = object.get("prefix") {
                return prefix.get("addr").and_then(element_literal);
            }
            if let Some(Value::Array(range)) = object.get("range") {
                return range.first().and_then(element_literal);
            }
            None
        }
        _ => None,
    }
}

/// Per-element counter, present on sets declared with the `counter` flag and
/// on meters with a counter statement.
pub fn element_counter(elem: &Value) -> Option<CounterValues> {
    match elem {
        Value::Array(pair) => pair.first().and_then(element_counter),
        Value::Object(object) => {
            let counter = object.get("elem")?.get("counter")?;
            serde_json::from_value(counter.clone())
                .inspect_err(|err| warn!(msg = "Skipping malformed element counter", %err))
                .ok()
        }
        _ => None,
    }
}

fn prefix_address(s: &str) -> Option<String> {
    if !s.contains('/') {
        return None;
    }
    s.parse::<IpNet>().ok().map(|net| net.addr().to_string())
}
