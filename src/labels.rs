use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

use crate::types::Tags;

/// Labels harvested from string-valued discovered items, keyed by
/// `agent|rule|index`, and read back when tagging numeric items of the same
/// discovered entity.
///
/// Entries have no TTL. They are removed by discovery reconciliation when the
/// label items that wrote them disappear.
#[derive(Default)]
pub struct LabelCache {
    entries: RwLock<HashMap<String, Tags>>,
}

fn entry_key(agent: &str, rule: &str, index: &str) -> String {
    format!("{}|{}|{}", agent, rule, index)
}

impl LabelCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, agent: &str, rule: &str, index: &str, label: &str, value: &str) {
        self.entries
            .write()
            .entry(entry_key(agent, rule, index))
            .or_default()
            .insert(label.to_string(), value.to_string());
    }

    /// A copy of the labels of one discovered entity.
    pub fn get(&self, agent: &str, rule: &str, index: &str) -> Option<Tags> {
        self.entries.read().get(&entry_key(agent, rule, index)).cloned()
    }

    /// Remove one label; the entry goes away with its last label.
    pub fn delete_label(&self, agent: &str, rule: &str, index: &str, label: &str) {
        let key = entry_key(agent, rule, index);
        let mut entries = self.entries.write();
        if let Some(labels) = entries.get_mut(&key) {
            labels.remove(label);
            if labels.is_empty() {
                entries.remove(&key);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn snapshot(&self) -> BTreeMap<String, Tags> {
        self.entries
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}
