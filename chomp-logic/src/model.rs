use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

use crate::{error::ConfigError, interval::Interval, value::FieldType};

/// Acquisition strategy of an ingester. Variants match the YAML top-level
/// keys one-to-one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngesterKind {
    Scraper,
    HttpApi,
    WsApi,
    EvmCaller,
    EvmLogger,
    SvmCaller,
    SuiCaller,
    Processor,
    Monitor,
}

impl IngesterKind {
    pub const ALL: [IngesterKind; 9] = [
        IngesterKind::Scraper,
        IngesterKind::HttpApi,
        IngesterKind::WsApi,
        IngesterKind::EvmCaller,
        IngesterKind::EvmLogger,
        IngesterKind::SvmCaller,
        IngesterKind::SuiCaller,
        IngesterKind::Processor,
        IngesterKind::Monitor,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            IngesterKind::Scraper => "scraper",
            IngesterKind::HttpApi => "http_api",
            IngesterKind::WsApi => "ws_api",
            IngesterKind::EvmCaller => "evm_caller",
            IngesterKind::EvmLogger => "evm_logger",
            IngesterKind::SvmCaller => "svm_caller",
            IngesterKind::SuiCaller => "sui_caller",
            IngesterKind::Processor => "processor",
            IngesterKind::Monitor => "monitor",
        }
    }

    /// Kinds whose target must parse as `<chain_id>:<address>`.
    pub fn is_chain(self) -> bool {
        matches!(
            self,
            IngesterKind::EvmCaller
                | IngesterKind::EvmLogger
                | IngesterKind::SvmCaller
                | IngesterKind::SuiCaller
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    #[default]
    Timeseries,
    /// Single-row upsert keyed by the ingester name.
    Value,
    /// Append-only, unkeyed.
    Series,
}

/// Health of an ingester as reflected in its registry record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IngesterStatus {
    #[default]
    Pending,
    Healthy,
    Unhealthy,
}

/// Extra request parameters. YAML accepts a map, a list or a bare string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Params {
    Map(BTreeMap<String, serde_json::Value>),
    List(Vec<serde_json::Value>),
    Text(String),
}

impl Params {
    pub fn is_empty(&self) -> bool {
        match self {
            Params::Map(m) => m.is_empty(),
            Params::List(l) => l.is_empty(),
            Params::Text(s) => s.is_empty(),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Params::Map(m) => serde_json::to_value(m).unwrap_or_default(),
            Params::List(l) => serde_json::Value::Array(l.clone()),
            Params::Text(s) => serde_json::Value::String(s.clone()),
        }
    }
}

impl Default for Params {
    fn default() -> Self {
        Params::List(Vec::new())
    }
}

fn default_probability() -> f64 {
    1.0
}

/// One typed column extracted per tick. Unset attributes inherit from the
/// parent ingester during config resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: Option<FieldType>,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub selector: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub params: Params,
    #[serde(default)]
    pub transformers: Vec<String>,
    #[serde(default)]
    pub handler: Option<String>,
    #[serde(default)]
    pub reducer: Option<String>,
    #[serde(default)]
    pub transient: bool,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl ResourceField {
    pub fn field_type(&self) -> FieldType {
        self.field_type.unwrap_or_default()
    }

    fn signature(&self) -> String {
        format!(
            "{}-{}-{}-{}-[{}]-[{}]",
            self.name,
            self.field_type().sql_name(),
            self.target.as_deref().unwrap_or(""),
            self.selector.as_deref().unwrap_or(""),
            self.params.to_json(),
            if self.transformers.is_empty() {
                "raw".to_string()
            } else {
                self.transformers.join(",")
            },
        )
    }
}

/// One configured data-producing unit, executed on a fixed schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Ingester {
    pub name: String,
    /// Injected from the YAML group key; round-trips through the registry.
    #[serde(default = "default_kind")]
    pub kind: IngesterKind,
    pub interval: Interval,
    #[serde(default)]
    pub resource_type: ResourceType,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub selector: Option<String>,
    #[serde(rename = "type", default)]
    pub field_type: Option<FieldType>,
    #[serde(default = "default_probability")]
    pub probability: f64,
    #[serde(default)]
    pub pre_transformer: Option<String>,
    #[serde(default)]
    pub handler: Option<String>,
    #[serde(default)]
    pub reducer: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub params: Params,
    #[serde(default)]
    pub transient: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    pub fields: Vec<ResourceField>,
}

fn default_kind() -> IngesterKind {
    IngesterKind::HttpApi
}

impl Ingester {
    /// Resolve field-level inheritance: a field takes the parent's target,
    /// selector, type, headers, params and stream plugins when it declares
    /// none of its own. Relative field targets are concatenated onto the
    /// parent target.
    pub fn resolve_inheritance(&mut self) {
        for field in &mut self.fields {
            if field.field_type.is_none() {
                field.field_type = self.field_type;
            }
            if field.selector.is_none() {
                field.selector = self.selector.clone();
            }
            if field.headers.is_empty() {
                field.headers = self.headers.clone();
            }
            if field.params.is_empty() {
                field.params = self.params.clone();
            }
            if field.handler.is_none() {
                field.handler = self.handler.clone();
            }
            if field.reducer.is_none() {
                field.reducer = self.reducer.clone();
            }
            match (&self.target, &mut field.target) {
                (Some(parent), Some(own)) if !own.starts_with("http") && !own.starts_with('/') => {
                    if self.kind == IngesterKind::HttpApi || self.kind == IngesterKind::Scraper {
                        *own = format!("{parent}{own}");
                    }
                }
                (Some(parent), target @ None) => *target = Some(parent.clone()),
                _ => {}
            }
        }
    }

    pub fn field(&self, name: &str) -> Option<&ResourceField> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    /// Non-transient fields in declared order; these become table columns.
    pub fn persistent_fields(&self) -> impl Iterator<Item = &ResourceField> {
        self.fields.iter().filter(|f| !f.transient)
    }

    /// Distinct targets across fields, in first-appearance order.
    pub fn distinct_targets(&self) -> Vec<&str> {
        let mut seen = Vec::new();
        for field in &self.fields {
            if let Some(target) = field.target.as_deref() {
                if !seen.contains(&target) {
                    seen.push(target);
                }
            }
        }
        seen
    }

    /// Stable hash of the spec, used to detect conflicting registrations
    /// of the same name across the cluster.
    pub fn spec_hash(&self) -> String {
        let mut hasher = Md5::new();
        hasher.update(self.name.as_bytes());
        hasher.update(self.kind.as_str().as_bytes());
        hasher.update(self.interval.to_string().as_bytes());
        hasher.update(format!("{:?}", self.resource_type).as_bytes());
        for field in &self.fields {
            hasher.update(field.signature().as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

/// `<chain_id>:<address>` target of caller/logger kinds.
pub fn split_chain_addr(target: &str) -> Result<(u64, String), ConfigError> {
    let invalid = || ConfigError::InvalidChainTarget {
        ingester: String::new(),
        target: target.to_string(),
    };
    let (chain, addr) = target.split_once(':').ok_or_else(invalid)?;
    let chain_id: u64 = chain.trim().parse().map_err(|_| invalid())?;
    if addr.trim().is_empty() {
        return Err(invalid());
    }
    Ok((chain_id, addr.trim().to_string()))
}

/// Runtime half of a registry record: refreshed by the claim owner after
/// every successful store.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IngesterRecord {
    pub spec_hash: String,
    pub status: IngesterStatus,
    pub owner: Option<String>,
    pub last_tick: Option<DateTime<Utc>>,
    pub last_ingested: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn field(name: &str) -> ResourceField {
        ResourceField {
            name: name.into(),
            field_type: None,
            target: None,
            selector: None,
            headers: BTreeMap::new(),
            params: Params::default(),
            transformers: vec![],
            handler: None,
            reducer: None,
            transient: false,
            tags: vec![],
        }
    }

    fn ingester(name: &str, fields: Vec<ResourceField>) -> Ingester {
        Ingester {
            name: name.into(),
            kind: IngesterKind::HttpApi,
            interval: Interval::s30,
            resource_type: ResourceType::Timeseries,
            target: Some("https://api.example.com".into()),
            selector: Some(".data".into()),
            field_type: Some(FieldType::Float64),
            probability: 1.0,
            pre_transformer: None,
            handler: None,
            reducer: None,
            headers: BTreeMap::new(),
            params: Params::default(),
            transient: false,
            tags: vec![],
            fields,
        }
    }

    #[test]
    fn fields_inherit_parent_attributes() {
        let mut ing = ingester("a", vec![field("x")]);
        ing.resolve_inheritance();
        let f = &ing.fields[0];
        assert_eq!(f.target.as_deref(), Some("https://api.example.com"));
        assert_eq!(f.selector.as_deref(), Some(".data"));
        assert_eq!(f.field_type, Some(FieldType::Float64));
    }

    #[test]
    fn relative_field_target_concatenates() {
        let mut ing = ingester("a", vec![field("x")]);
        ing.fields[0].target = Some("v1/rate".into());
        ing.resolve_inheritance();
        assert_eq!(
            ing.fields[0].target.as_deref(),
            Some("https://api.example.comv1/rate")
        );
    }

    #[test]
    fn spec_hash_is_stable_and_spec_sensitive() {
        let a = ingester("a", vec![field("x")]);
        let b = ingester("a", vec![field("x")]);
        assert_eq!(a.spec_hash(), b.spec_hash());

        let mut c = ingester("a", vec![field("x")]);
        c.fields[0].transformers = vec!["round2".into()];
        assert_ne!(a.spec_hash(), c.spec_hash());
    }

    #[test]
    fn chain_target_parses() {
        let (chain, addr) = split_chain_addr("1:0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48").unwrap();
        assert_eq!(chain, 1);
        assert_eq!(addr, "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48");
        assert!(split_chain_addr("not-a-target").is_err());
        assert!(split_chain_addr("x:0xabc").is_err());
    }

    #[test]
    fn distinct_targets_deduplicate_in_order() {
        let mut ing = ingester("a", vec![field("x"), field("y"), field("z")]);
        ing.fields[1].target = Some("https://other.example.com".into());
        ing.resolve_inheritance();
        assert_eq!(
            ing.distinct_targets(),
            vec!["https://api.example.com", "https://other.example.com"]
        );
    }
}
