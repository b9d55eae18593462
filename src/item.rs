use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::preprocess::StepSpec;

/// Output type of an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ValueType {
    Float,
    Unsigned,
    Text,
    /// Numeric when parsable, text otherwise.
    #[default]
    Auto,
}

impl ValueType {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "float" => ValueType::Float,
            "uint" | "unsigned" => ValueType::Unsigned,
            "string" | "text" => ValueType::Text,
            _ => ValueType::Auto,
        }
    }
}

/// Where a discovered item came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryOrigin {
    pub rule_key: String,
    pub index: String,
}

/// A schedulable unit of work, fully macro-expanded.
#[derive(Debug, Clone)]
pub struct MonitorItem {
    pub agent: String,
    pub key: String,
    pub oid: String,
    pub name: String,
    pub description: String,
    pub units: String,
    pub value_type: ValueType,
    pub delay: Duration,
    pub preprocessing: Arc<[StepSpec]>,
    pub tags: BTreeMap<String, String>,
    pub discovery: Option<DiscoveryOrigin>,
    /// Set for label providers: the label name their value is stored under.
    pub label_key: Option<String>,
}

impl MonitorItem {
    pub fn new(agent: impl Into<String>, key: impl Into<String>, oid: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            key: key.into(),
            oid: oid.into(),
            name: String::new(),
            description: String::new(),
            units: String::new(),
            value_type: ValueType::Auto,
            delay: crate::timing::DEFAULT_ITEM_DELAY,
            preprocessing: Arc::from(Vec::new()),
            tags: BTreeMap::new(),
            discovery: None,
            label_key: None,
        }
    }

    /// `agent|key`, or `agent|oid` for items without a key.
    pub fn id(&self) -> String {
        if self.key.is_empty() {
            format!("{}|{}", self.agent, self.oid)
        } else {
            format!("{}|{}", self.agent, self.key)
        }
    }

    pub fn is_discovered(&self) -> bool {
        self.discovery.is_some()
    }

    pub fn is_label_provider(&self) -> bool {
        self.label_key.is_some()
    }

    pub fn rule_key(&self) -> Option<&str> {
        self.discovery.as_ref().map(|d| d.rule_key.as_str())
    }

    pub fn index(&self) -> Option<&str> {
        self.discovery.as_ref().map(|d| d.index.as_str())
    }
}
