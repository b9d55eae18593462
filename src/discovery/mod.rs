//! Low-level discovery: enumerate entities on an agent and turn template
//! prototypes into concrete items for each of them.
//!
//! A rule's `snmp_oid` selects one of three enumeration forms:
//!
//! * a plain OID, walked once; the index below the OID becomes `{#SNMPINDEX}`
//! * `discovery[{#M1},oid1,{#M2},oid2,...]`, several walks joined by index
//! * `walk[oid1,oid2,...]`, raw walks shaped by an `SNMP_WALK_TO_JSON` step
//!
//! Rows then go through the rule's preprocessing (as a `{"data": [...]}`
//! document) and filter, and are cached per agent and rule.

pub mod scheduler;

pub use scheduler::{DiscoveryCallback, DiscoveryScheduler};

use parking_lot::RwLock;
use serde_json_path::JsonPath;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::PreprocessPolicy;
use crate::connection::ConnectionManager;
use crate::error::{DiscoveryError, TemplateError};
use crate::item::{DiscoveryOrigin, MonitorItem};
use crate::preprocess::{self, render_snmp, Pipeline, Value};
use crate::snmp::{compare_oids, normalize_oid, oid_suffix, parse_oid, Session, VarBind};
use crate::template::{convert_value_type, DiscoveryRule, LoadedTemplate, TemplateItem};
use crate::timing::{parse_delay, DEFAULT_DISCOVERY_DELAY, DEFAULT_ITEM_DELAY};

const SNMP_INDEX: &str = "{#SNMPINDEX}";
const IF_INDEX: &str = "{#IFINDEX}";

/// One discovered entity: its macros and a stable index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryItem {
    pub macros: BTreeMap<String, String>,
    pub index: String,
}

impl DiscoveryItem {
    fn from_macros(macros: BTreeMap<String, String>) -> Self {
        let index = macros
            .get(SNMP_INDEX)
            .or_else(|| macros.get(IF_INDEX))
            .cloned()
            .unwrap_or_default();
        Self { macros, index }
    }
}

struct CacheEntry {
    items: Vec<DiscoveryItem>,
    stored: Instant,
    ttl: Duration,
}

enum Enumeration {
    Rows(Vec<DiscoveryItem>),
    Walks(Vec<(String, Vec<VarBind>)>),
}

pub struct DiscoveryEngine {
    connections: Arc<ConnectionManager>,
    template: Arc<LoadedTemplate>,
    pipeline: Arc<Pipeline>,
    policy: PreprocessPolicy,
    cache: RwLock<HashMap<String, CacheEntry>>,
}

impl DiscoveryEngine {
    pub fn new(
        connections: Arc<ConnectionManager>,
        template: Arc<LoadedTemplate>,
        pipeline: Arc<Pipeline>,
        policy: PreprocessPolicy,
    ) -> Self {
        Self {
            connections,
            template,
            pipeline,
            policy,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn template(&self) -> &Arc<LoadedTemplate> {
        &self.template
    }

    /// Run `rule` against `agent`, or return the cached rows while they are
    /// younger than the rule's cadence.
    pub async fn execute(&self, agent: &str, rule: &DiscoveryRule) -> Result<Vec<DiscoveryItem>, DiscoveryError> {
        let cache_key = format!("{}:{}", agent, rule.key);
        if let Some(entry) = self.cache.read().get(&cache_key) {
            if entry.stored.elapsed() < entry.ttl {
                return Ok(entry.items.clone());
            }
        }

        let started = Instant::now();
        let steps = preprocess::compile_steps(&rule.preprocessing, self.policy)?;

        let raw = {
            let _guard = self.connections.acquire(agent).await;
            let session = self.connections.get_session(agent).await?;
            match self.enumerate(session.as_ref(), rule).await {
                Ok(raw) => raw,
                Err(DiscoveryError::Transport(e)) => {
                    self.connections.record_error(agent, &e);
                    return Err(DiscoveryError::Transport(e));
                }
                Err(e) => return Err(e),
            }
        };

        let rows = if steps.is_empty() {
            match raw {
                Enumeration::Rows(rows) => rows,
                Enumeration::Walks(_) => {
                    return Err(DiscoveryError::Document(format!(
                        "rule '{}' uses walk[] without an SNMP_WALK_TO_JSON step",
                        rule.key
                    )))
                }
            }
        } else {
            let input = match raw {
                Enumeration::Rows(rows) => Value::Text(discovery_document(&rows)),
                Enumeration::Walks(walks) => Value::Walks(walks),
            };
            let output = self.preprocess(agent, &rule.key, input, steps).await?;
            parse_document(&output, &self.macro_paths(rule))?
        };

        let mut filtered: Vec<DiscoveryItem> = rows
            .into_iter()
            .filter(|row| rule.filter.matches(&row.macros))
            .collect();
        filtered.sort_by(|a, b| compare_oids(&a.index, &b.index));

        tracing::info!(
            agent,
            rule = %rule.key,
            rows = filtered.len(),
            "Discovery finished"
        );

        let ttl = parse_delay(&self.template.expand_macros(&rule.delay, None), DEFAULT_DISCOVERY_DELAY);
        self.cache.write().insert(
            cache_key,
            CacheEntry {
                items: filtered.clone(),
                stored: started,
                ttl,
            },
        );
        Ok(filtered)
    }

    /// Drop the cached rows of one rule.
    pub fn invalidate(&self, agent: &str, rule_key: &str) {
        self.cache.write().remove(&format!("{}:{}", agent, rule_key));
    }

    async fn preprocess(
        &self,
        agent: &str,
        rule_key: &str,
        input: Value,
        steps: Vec<preprocess::StepSpec>,
    ) -> Result<Value, DiscoveryError> {
        if preprocess::needs_blocking(&steps) {
            let pipeline = self.pipeline.clone();
            let agent = agent.to_string();
            let rule_key = rule_key.to_string();
            tokio::task::spawn_blocking(move || pipeline.apply(&agent, &rule_key, input, &steps))
                .await
                .map_err(|e| DiscoveryError::Task(e.to_string()))?
                .map_err(DiscoveryError::from)
        } else {
            Ok(self.pipeline.apply(agent, rule_key, input, &steps)?)
        }
    }

    fn macro_paths(&self, rule: &DiscoveryRule) -> Vec<(String, JsonPath)> {
        rule.lld_macro_paths
            .iter()
            .filter_map(|p| match JsonPath::parse(&p.path) {
                Ok(path) => Some((p.lld_macro.clone(), path)),
                Err(e) => {
                    tracing::warn!(rule = %rule.key, path = %p.path, error = %e, "Ignoring LLD macro path");
                    None
                }
            })
            .collect()
    }

    async fn enumerate(&self, session: &dyn Session, rule: &DiscoveryRule) -> Result<Enumeration, DiscoveryError> {
        let expr = rule.snmp_oid.trim();
        if expr.is_empty() {
            return Err(DiscoveryError::EmptyOid(rule.key.clone()));
        }

        if let Some(args) = bracket_args(expr, "walk[") {
            let mut walks = Vec::new();
            for oid in args.split(',').map(str::trim) {
                check_oid(oid)?;
                let binds = session.walk(oid).await?;
                walks.push((normalize_oid(oid).to_string(), binds));
            }
            return Ok(Enumeration::Walks(walks));
        }

        if let Some(args) = bracket_args(expr, "discovery[") {
            let pairs = parse_dependent(expr, args)?;
            return Ok(Enumeration::Rows(dependent_walk(session, &pairs).await));
        }

        check_oid(expr)?;
        let binds = session.walk(expr).await?;
        Ok(Enumeration::Rows(standard_rows(&rule.key, expr, &binds)))
    }

    /// Expand every enabled prototype of `rule` for every row.
    ///
    /// Character and text prototypes become label providers. A prototype whose
    /// preprocessing does not compile is skipped for that row.
    pub fn apply_item_prototypes(&self, agent: &str, rows: &[DiscoveryItem], rule: &DiscoveryRule) -> Vec<MonitorItem> {
        let mut items = Vec::new();
        for row in rows {
            for prototype in &rule.item_prototypes {
                if !prototype.is_enabled() || prototype.status.eq_ignore_ascii_case("UNSUPPORTED") {
                    continue;
                }
                match self.expand_prototype(agent, row, rule, prototype) {
                    Ok(item) => items.push(item),
                    Err(e) => tracing::warn!(
                        agent,
                        rule = %rule.key,
                        prototype = %prototype.key,
                        error = %e,
                        "Skipping item prototype"
                    ),
                }
            }
        }
        items
    }

    fn expand_prototype(
        &self,
        agent: &str,
        row: &DiscoveryItem,
        rule: &DiscoveryRule,
        prototype: &TemplateItem,
    ) -> Result<MonitorItem, DiscoveryError> {
        let expand = |text: &str| self.template.expand_macros(text, Some(&row.macros));

        let mut defs = prototype.preprocessing.clone();
        for def in &mut defs {
            for param in &mut def.parameters {
                *param = expand(param);
            }
            def.error_handler_params = expand(&def.error_handler_params);
        }
        let steps = preprocess::compile_steps(&defs, self.policy)?;

        let mut item = MonitorItem::new(agent, expand(&prototype.key), expand(&prototype.snmp_oid));
        item.name = expand(&prototype.name);
        item.description = expand(&prototype.description);
        item.units = prototype.units.clone();
        item.value_type = convert_value_type(&prototype.value_type);
        item.delay = parse_delay(&expand(&prototype.delay), DEFAULT_ITEM_DELAY);
        item.preprocessing = Arc::from(steps);
        item.tags = prototype
            .tags
            .iter()
            .map(|t| (t.tag.clone(), expand(&t.value)))
            .collect();
        item.discovery = Some(DiscoveryOrigin {
            rule_key: rule.key.clone(),
            index: row.index.clone(),
        });
        if is_label_type(&prototype.value_type) {
            item.label_key = Some(label_key(&prototype.key).to_string());
        }
        Ok(item)
    }
}

fn is_label_type(value_type: &str) -> bool {
    matches!(value_type.to_ascii_uppercase().as_str(), "CHAR" | "1" | "TEXT" | "4")
}

/// `net.if.alias[ifAlias.{#SNMPINDEX}]` labels as `net.if.alias`.
fn label_key(key: &str) -> &str {
    match key.find('[') {
        Some(i) if i > 0 => &key[..i],
        _ => key,
    }
}

fn bracket_args<'a>(expr: &'a str, prefix: &str) -> Option<&'a str> {
    expr.strip_prefix(prefix)?.strip_suffix(']')
}

fn check_oid(oid: &str) -> Result<(), DiscoveryError> {
    parse_oid(oid)
        .map(|_| ())
        .map_err(|_| TemplateError::InvalidOid(oid.to_string()).into())
}

fn parse_dependent(expr: &str, args: &str) -> Result<Vec<(String, String)>, DiscoveryError> {
    let invalid = |reason: String| TemplateError::InvalidDiscoveryExpr {
        expr: expr.to_string(),
        reason,
    };
    let parts: Vec<&str> = args.split(',').map(str::trim).collect();
    if parts.len() % 2 != 0 {
        return Err(invalid("expected macro, OID pairs".into()).into());
    }
    let mut pairs = Vec::with_capacity(parts.len() / 2);
    for pair in parts.chunks(2) {
        let (name, oid) = (pair[0], pair[1]);
        if !name.starts_with("{#") || !name.ends_with('}') {
            return Err(invalid(format!("invalid macro '{}'", name)).into());
        }
        check_oid(oid)?;
        pairs.push((name.to_string(), normalize_oid(oid).to_string()));
    }
    Ok(pairs)
}

/// Walk each `(macro, oid)` pair and join the values by index. A failing walk
/// is logged and contributes nothing.
async fn dependent_walk(session: &dyn Session, pairs: &[(String, String)]) -> Vec<DiscoveryItem> {
    let mut joined: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
    for (name, oid) in pairs {
        let binds = match session.walk(oid).await {
            Ok(binds) => binds,
            Err(e) => {
                tracing::warn!(oid = %oid, error = %e, "Discovery walk failed");
                continue;
            }
        };
        for bind in &binds {
            if let Some(index) = oid_suffix(&bind.oid, oid) {
                joined
                    .entry(index.to_string())
                    .or_default()
                    .insert(name.clone(), render_snmp(&bind.value));
            }
        }
    }

    joined
        .into_iter()
        .map(|(index, mut macros)| {
            macros.insert(SNMP_INDEX.to_string(), index.clone());
            macros.insert(IF_INDEX.to_string(), index.clone());
            DiscoveryItem { macros, index }
        })
        .collect()
}

fn standard_rows(rule_key: &str, root: &str, binds: &[VarBind]) -> Vec<DiscoveryItem> {
    binds
        .iter()
        .filter_map(|bind| {
            let index = oid_suffix(&bind.oid, root)?.to_string();
            let value = render_snmp(&bind.value);
            let mut macros = BTreeMap::new();
            macros.insert(SNMP_INDEX.to_string(), index.clone());
            if rule_key.contains("net.if") {
                macros.insert(IF_INDEX.to_string(), index.clone());
                macros.insert("{#IFNAME}".to_string(), value.clone());
                macros.insert("{#IFDESCR}".to_string(), value);
            } else if rule_key.contains("vfs.fs") {
                macros.insert("{#FSINDEX}".to_string(), index.clone());
                macros.insert("{#FSNAME}".to_string(), value.clone());
                macros.insert("{#FSPATH}".to_string(), value);
            } else {
                macros.insert("{#VALUE}".to_string(), value);
            }
            Some(DiscoveryItem { macros, index })
        })
        .collect()
}

fn discovery_document(rows: &[DiscoveryItem]) -> String {
    let data: Vec<&BTreeMap<String, String>> = rows.iter().map(|r| &r.macros).collect();
    serde_json::json!({ "data": data }).to_string()
}

/// Rows of a preprocessed discovery document: `{"data": [...]}` or a bare
/// array of objects. Non-string values are rendered as JSON text.
fn parse_document(value: &Value, macro_paths: &[(String, JsonPath)]) -> Result<Vec<DiscoveryItem>, DiscoveryError> {
    let document = match value {
        Value::Json(v) => v.clone(),
        other => serde_json::from_str(&other.to_text()).map_err(|e| DiscoveryError::Document(e.to_string()))?,
    };

    let rows = match document {
        serde_json::Value::Array(rows) => rows,
        serde_json::Value::Object(mut doc) => match doc.remove("data") {
            Some(serde_json::Value::Array(rows)) => rows,
            _ => return Err(DiscoveryError::Document("missing 'data' array".into())),
        },
        _ => return Err(DiscoveryError::Document("expected an object or array".into())),
    };

    Ok(rows
        .into_iter()
        .filter_map(|row| {
            let serde_json::Value::Object(fields) = &row else {
                return None;
            };
            let mut macros: BTreeMap<String, String> = fields
                .iter()
                .map(|(k, v)| (k.clone(), json_text(v)))
                .collect();
            for (name, path) in macro_paths {
                if let Some(found) = path.query(&row).first() {
                    macros.insert(name.clone(), json_text(found));
                }
            }
            Some(DiscoveryItem::from_macros(macros))
        })
        .collect())
}

fn json_text(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// A discarded or history-less discovery value: nothing new this cycle.
pub(crate) fn is_quiet(err: &DiscoveryError) -> bool {
    matches!(err, DiscoveryError::Preprocess(e) if e.is_quiet())
}
