//! YAML namespace loading: parse, validate, resolve field inheritance and
//! compile every transformer expression once. All configuration errors are
//! fatal at startup.

use std::collections::{BTreeSet, HashMap};

use serde::Deserialize;

use crate::{
    error::ConfigError,
    expr::{self, Compiled},
    model::{split_chain_addr, Ingester, IngesterKind},
    plugins::PluginRegistry,
};

/// Raw document shape: top-level keys are ingester kinds, each a list of
/// entries.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawNamespace {
    #[serde(default)]
    scraper: Vec<Ingester>,
    #[serde(default)]
    http_api: Vec<Ingester>,
    #[serde(default)]
    ws_api: Vec<Ingester>,
    #[serde(default)]
    evm_caller: Vec<Ingester>,
    #[serde(default)]
    evm_logger: Vec<Ingester>,
    #[serde(default)]
    svm_caller: Vec<Ingester>,
    #[serde(default)]
    sui_caller: Vec<Ingester>,
    #[serde(default)]
    processor: Vec<Ingester>,
    #[serde(default)]
    monitor: Vec<Ingester>,
}

/// One ingester with every transformer pre-compiled and the intra-tick
/// evaluation order resolved.
#[derive(Debug, Clone)]
pub struct CompiledIngester {
    pub spec: Ingester,
    /// compiled transformer chains, parallel to `spec.fields`
    pub chains: Vec<Vec<Compiled>>,
    /// field indices in dependency order
    pub eval_order: Vec<usize>,
    /// every `{Ingester.Field}` reference across all chains
    pub cross_refs: BTreeSet<(String, String)>,
}

#[derive(Debug, Default)]
pub struct IngesterConfig {
    pub ingesters: Vec<CompiledIngester>,
}

impl IngesterConfig {
    pub fn from_yaml(yaml: &str, plugins: &PluginRegistry) -> Result<Self, ConfigError> {
        let raw: RawNamespace = serde_yaml::from_str(yaml)?;

        let mut ingesters = Vec::new();
        let groups: [(IngesterKind, Vec<Ingester>); 9] = [
            (IngesterKind::Scraper, raw.scraper),
            (IngesterKind::HttpApi, raw.http_api),
            (IngesterKind::WsApi, raw.ws_api),
            (IngesterKind::EvmCaller, raw.evm_caller),
            (IngesterKind::EvmLogger, raw.evm_logger),
            (IngesterKind::SvmCaller, raw.svm_caller),
            (IngesterKind::SuiCaller, raw.sui_caller),
            (IngesterKind::Processor, raw.processor),
            (IngesterKind::Monitor, raw.monitor),
        ];

        let mut seen_names = BTreeSet::new();
        for (kind, entries) in groups {
            for mut spec in entries {
                spec.kind = kind;
                if !seen_names.insert(spec.name.clone()) {
                    return Err(ConfigError::DuplicateIngester(spec.name));
                }
                spec.resolve_inheritance();
                ingesters.push(compile(spec, plugins)?);
            }
        }

        Ok(Self { ingesters })
    }

    pub fn specs(&self) -> Vec<Ingester> {
        self.ingesters.iter().map(|i| i.spec.clone()).collect()
    }
}

fn compile(spec: Ingester, plugins: &PluginRegistry) -> Result<CompiledIngester, ConfigError> {
    if spec.fields.is_empty() {
        return Err(ConfigError::EmptyFields(spec.name));
    }

    let mut field_names = BTreeSet::new();
    for field in &spec.fields {
        if !field_names.insert(field.name.clone()) {
            return Err(ConfigError::DuplicateField {
                ingester: spec.name.clone(),
                field: field.name.clone(),
            });
        }
    }

    if !(0.0..=1.0).contains(&spec.probability) {
        return Err(ConfigError::InvalidProbability {
            ingester: spec.name.clone(),
            value: spec.probability,
        });
    }

    if spec.kind.is_chain() {
        for target in spec.distinct_targets() {
            split_chain_addr(target).map_err(|_| ConfigError::InvalidChainTarget {
                ingester: spec.name.clone(),
                target: target.to_string(),
            })?;
        }
    }

    validate_plugins(&spec, plugins)?;

    let mut chains = Vec::with_capacity(spec.fields.len());
    let mut cross_refs = BTreeSet::new();
    for field in &spec.fields {
        let mut chain = Vec::with_capacity(field.transformers.len());
        for source in &field.transformers {
            let compiled =
                Compiled::compile(source).map_err(|message| ConfigError::InvalidExpression {
                    ingester: spec.name.clone(),
                    field: field.name.clone(),
                    message,
                })?;

            let unknown = expr::unknown_calls(&compiled.expr);
            if let Some(name) = unknown.first() {
                return Err(ConfigError::InvalidExpression {
                    ingester: spec.name.clone(),
                    field: field.name.clone(),
                    message: format!("unknown builtin '{name}'"),
                });
            }

            for reference in &compiled.field_refs {
                if !field_names.contains(reference) {
                    return Err(ConfigError::UnknownFieldReference {
                        ingester: spec.name.clone(),
                        field: field.name.clone(),
                        reference: reference.clone(),
                    });
                }
            }
            cross_refs.extend(compiled.cross_refs.iter().cloned());
            chain.push(compiled);
        }
        chains.push(chain);
    }

    // processor selectors of the form `Ingester.Field` are implicit
    // cross-resource dependencies
    if spec.kind == IngesterKind::Processor {
        for field in &spec.fields {
            if let Some(selector) = field.selector.as_deref() {
                if !selector.starts_with('.') {
                    if let Some((ingester, dep_field)) = selector.split_once('.') {
                        cross_refs.insert((ingester.to_string(), dep_field.to_string()));
                    }
                }
            }
        }
    }

    let eval_order = topo_order(&spec, &chains)?;

    Ok(CompiledIngester {
        spec,
        chains,
        eval_order,
        cross_refs,
    })
}

fn validate_plugins(spec: &Ingester, plugins: &PluginRegistry) -> Result<(), ConfigError> {
    let unknown = |plugin: &str| ConfigError::UnknownPlugin {
        ingester: spec.name.clone(),
        plugin: plugin.to_string(),
    };

    if let Some(name) = spec.pre_transformer.as_deref() {
        if !plugins.has_pre_transformer(name) {
            return Err(unknown(name));
        }
    }
    for field in &spec.fields {
        if spec.kind == IngesterKind::WsApi {
            if let Some(name) = field.handler.as_deref() {
                if !plugins.has_handler(name) {
                    return Err(unknown(name));
                }
            }
            if let Some(name) = field.reducer.as_deref() {
                if !plugins.has_reducer(name) {
                    return Err(unknown(name));
                }
            }
        }
    }
    Ok(())
}

/// Dependency order of fields within one tick: if B's chain references
/// `{A}`, A evaluates first. Cycles are a startup error naming the fields
/// involved.
fn topo_order(spec: &Ingester, chains: &[Vec<Compiled>]) -> Result<Vec<usize>, ConfigError> {
    let index_of: HashMap<&str, usize> = spec
        .fields
        .iter()
        .enumerate()
        .map(|(i, f)| (f.name.as_str(), i))
        .collect();

    // deps[i] = indices i's chain references
    let mut deps: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); spec.fields.len()];
    for (i, chain) in chains.iter().enumerate() {
        for compiled in chain {
            for reference in &compiled.field_refs {
                if let Some(&j) = index_of.get(reference.as_str()) {
                    if j != i {
                        deps[i].insert(j);
                    }
                }
            }
        }
    }

    let mut order = Vec::with_capacity(spec.fields.len());
    let mut state = vec![0u8; spec.fields.len()]; // 0 new, 1 visiting, 2 done

    fn visit(
        node: usize,
        deps: &[BTreeSet<usize>],
        state: &mut [u8],
        order: &mut Vec<usize>,
        stack: &mut Vec<usize>,
    ) -> Result<(), Vec<usize>> {
        match state[node] {
            2 => return Ok(()),
            1 => {
                let start = stack.iter().position(|n| *n == node).unwrap_or(0);
                return Err(stack[start..].to_vec());
            }
            _ => {}
        }
        state[node] = 1;
        stack.push(node);
        for &dep in &deps[node] {
            visit(dep, deps, state, order, stack)?;
        }
        stack.pop();
        state[node] = 2;
        order.push(node);
        Ok(())
    }

    for node in 0..spec.fields.len() {
        let mut stack = Vec::new();
        if let Err(cycle) = visit(node, &deps, &mut state, &mut order, &mut stack) {
            let names: Vec<&str> = cycle.iter().map(|&i| spec.fields[i].name.as_str()).collect();
            return Err(ConfigError::TransformerCycle {
                ingester: spec.name.clone(),
                fields: names.join(", "),
            });
        }
    }
    Ok(order)
}

/// Test construction helpers shared across the crate's unit tests.
#[cfg(test)]
pub mod tests_support {
    use std::collections::BTreeMap;

    use super::*;
    use crate::interval::Interval;
    use crate::model::{Params, ResourceField, ResourceType};
    use crate::value::FieldType;

    pub fn minimal_field(name: &str) -> ResourceField {
        ResourceField {
            name: name.to_string(),
            field_type: Some(FieldType::Float64),
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

    pub fn minimal_ingester(name: &str, fields: &[&str]) -> Ingester {
        Ingester {
            name: name.to_string(),
            kind: IngesterKind::HttpApi,
            interval: Interval::s30,
            resource_type: ResourceType::Timeseries,
            target: None,
            selector: None,
            field_type: Some(FieldType::Float64),
            probability: 1.0,
            pre_transformer: None,
            handler: None,
            reducer: None,
            headers: BTreeMap::new(),
            params: Params::default(),
            transient: false,
            tags: vec![],
            fields: fields.iter().map(|f| minimal_field(f)).collect(),
        }
    }

    pub fn compile_one(spec: Ingester) -> Result<CompiledIngester, ConfigError> {
        super::compile(spec, &PluginRegistry::new())
    }

    pub fn compile_with(
        spec: Ingester,
        plugins: &PluginRegistry,
    ) -> Result<CompiledIngester, ConfigError> {
        super::compile(spec, plugins)
    }
}

#[cfg(test)]
mod tests {
    use super::{tests_support::*, *};
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = r#"
http_api:
  - name: A
    interval: s30
    resource_type: timeseries
    target: https://rates.example.com/latest
    fields:
      - name: USDT
        type: float64
        selector: .data.rate
        transformers: ["1/{self}", "round6"]
  - name: B
    interval: s30
    resource_type: timeseries
    target: https://quotes.example.com/btc
    fields:
      - name: BTC
        type: float64
        selector: .p
        transformers: ["float({self})*{A.USDT}", "round2"]
"#;

    #[test]
    fn parses_and_compiles_sample() {
        let config = IngesterConfig::from_yaml(SAMPLE, &PluginRegistry::new()).unwrap();
        assert_eq!(config.ingesters.len(), 2);

        let b = &config.ingesters[1];
        assert_eq!(b.spec.name, "B");
        assert_eq!(b.spec.kind, IngesterKind::HttpApi);
        assert_eq!(
            b.cross_refs,
            BTreeSet::from([("A".to_string(), "USDT".to_string())])
        );
        assert_eq!(b.chains[0].len(), 2);
    }

    #[test]
    fn duplicate_names_rejected() {
        let yaml = r#"
http_api:
  - name: A
    interval: s30
    fields: [{name: x}]
  - name: A
    interval: m1
    fields: [{name: y}]
"#;
        let err = IngesterConfig::from_yaml(yaml, &PluginRegistry::new()).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateIngester(name) if name == "A"));
    }

    #[test]
    fn duplicate_names_rejected_across_kinds() {
        let yaml = r#"
http_api:
  - name: A
    interval: s30
    fields: [{name: x}]
processor:
  - name: A
    interval: m1
    fields: [{name: y}]
"#;
        assert!(matches!(
            IngesterConfig::from_yaml(yaml, &PluginRegistry::new()).unwrap_err(),
            ConfigError::DuplicateIngester(_)
        ));
    }

    #[test]
    fn unknown_keys_rejected() {
        let yaml = r#"
http_api:
  - name: A
    interval: s30
    cadence: fast
    fields: [{name: x}]
"#;
        assert!(matches!(
            IngesterConfig::from_yaml(yaml, &PluginRegistry::new()).unwrap_err(),
            ConfigError::Yaml(_)
        ));
    }

    #[test]
    fn invalid_interval_rejected() {
        let yaml = r#"
http_api:
  - name: A
    interval: s3
    fields: [{name: x}]
"#;
        assert!(IngesterConfig::from_yaml(yaml, &PluginRegistry::new()).is_err());
    }

    #[test]
    fn empty_fields_rejected() {
        let yaml = r#"
http_api:
  - name: A
    interval: s30
    fields: []
"#;
        assert!(matches!(
            IngesterConfig::from_yaml(yaml, &PluginRegistry::new()).unwrap_err(),
            ConfigError::EmptyFields(name) if name == "A"
        ));
    }

    #[test]
    fn transformer_cycle_names_both_fields() {
        let mut spec = minimal_ingester("looped", &["X", "Y"]);
        spec.fields[0].transformers = vec!["{Y}+1".into()];
        spec.fields[1].transformers = vec!["{X}+1".into()];
        let err = compile_one(spec).unwrap_err();
        match err {
            ConfigError::TransformerCycle { ingester, fields } => {
                assert_eq!(ingester, "looped");
                assert!(fields.contains('X') && fields.contains('Y'), "{fields}");
            }
            other => panic!("unexpected: {other}"),
        }
    }

    #[test]
    fn self_cycle_is_allowed_via_self_reference() {
        // {self} refers to the previous chain step, not the field graph
        let mut spec = minimal_ingester("ok", &["X"]);
        spec.fields[0].transformers = vec!["1/{self}".into(), "round6".into()];
        assert!(compile_one(spec).is_ok());
    }

    #[test]
    fn eval_order_respects_dependencies() {
        let mut spec = minimal_ingester("deps", &["B", "A"]);
        // B references A, so A (index 1) must come first
        spec.fields[0].transformers = vec!["{A}*2".into()];
        let compiled = compile_one(spec).unwrap();
        assert_eq!(compiled.eval_order, vec![1, 0]);
    }

    #[test]
    fn unknown_local_reference_rejected() {
        let mut spec = minimal_ingester("bad", &["X"]);
        spec.fields[0].transformers = vec!["{nope}+1".into()];
        assert!(matches!(
            compile_one(spec).unwrap_err(),
            ConfigError::UnknownFieldReference { reference, .. } if reference == "nope"
        ));
    }

    #[test]
    fn unknown_builtin_rejected() {
        let mut spec = minimal_ingester("bad", &["X"]);
        spec.fields[0].transformers = vec!["frobnicate({self})".into()];
        assert!(matches!(
            compile_one(spec).unwrap_err(),
            ConfigError::InvalidExpression { .. }
        ));
    }

    #[test]
    fn probability_out_of_range_rejected() {
        let mut spec = minimal_ingester("bad", &["X"]);
        spec.probability = 1.5;
        assert!(matches!(
            compile_one(spec).unwrap_err(),
            ConfigError::InvalidProbability { .. }
        ));
    }

    #[test]
    fn chain_kind_requires_chain_target() {
        let mut spec = minimal_ingester("bad", &["X"]);
        spec.kind = IngesterKind::EvmCaller;
        spec.target = Some("https://not-a-chain.example.com".into());
        spec.resolve_inheritance();
        assert!(matches!(
            compile_one(spec).unwrap_err(),
            ConfigError::InvalidChainTarget { .. }
        ));
    }

    #[test]
    fn ws_plugins_must_exist() {
        let mut spec = minimal_ingester("stream", &["mid"]);
        spec.kind = IngesterKind::WsApi;
        spec.fields[0].handler = Some("trades".into());
        assert!(matches!(
            compile_one(spec).unwrap_err(),
            ConfigError::UnknownPlugin { plugin, .. } if plugin == "trades"
        ));

        let mut plugins = PluginRegistry::new();
        plugins.register_handler("trades", |_msg, _epoch| {});
        let mut spec = minimal_ingester("stream", &["mid"]);
        spec.kind = IngesterKind::WsApi;
        spec.fields[0].handler = Some("trades".into());
        assert!(super::compile(spec, &plugins).is_ok());
    }

    #[test]
    fn field_inherits_parent_selector_via_yaml() {
        let yaml = r#"
http_api:
  - name: A
    interval: s30
    target: https://x.example.com
    selector: .data
    type: float32
    fields:
      - name: v
"#;
        let config = IngesterConfig::from_yaml(yaml, &PluginRegistry::new()).unwrap();
        let field = &config.ingesters[0].spec.fields[0];
        assert_eq!(field.selector.as_deref(), Some(".data"));
        assert_eq!(field.target.as_deref(), Some("https://x.example.com"));
    }
}
