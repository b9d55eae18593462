//! Template document model.
//!
//! Documents follow the export layout (`zabbix_export` with templates and
//! hosts). Only items, discovery rules, macros and tags are interpreted;
//! everything else is carried as raw YAML so merged documents round-trip.

pub mod filter;
pub mod macros;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_yaml::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use crate::error::TemplateError;
use crate::item::ValueType;

pub use filter::{DiscoveryFilter, FilterCondition};

/// Raw keys the model does not name, kept verbatim.
pub type Extra = BTreeMap<String, Value>;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TemplateDocument {
    #[serde(default)]
    pub zabbix_export: Export,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Export {
    #[serde(default, deserialize_with = "lenient_string")]
    pub version: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub date: String,
    #[serde(default)]
    pub groups: Vec<Value>,
    #[serde(default)]
    pub template_groups: Vec<Value>,
    #[serde(default)]
    pub templates: Vec<Template>,
    #[serde(default)]
    pub hosts: Vec<Template>,
    #[serde(default)]
    pub valuemaps: Vec<Value>,
    #[serde(default, alias = "mediatypes")]
    pub media_types: Vec<Value>,
    #[serde(flatten)]
    pub extra: Extra,
}

/// A template or a host; both carry the same nested definitions.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Template {
    #[serde(default, deserialize_with = "lenient_string")]
    pub uuid: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub template: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub host: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub name: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub description: String,
    #[serde(default)]
    pub items: Vec<TemplateItem>,
    #[serde(default)]
    pub discovery_rules: Vec<DiscoveryRule>,
    #[serde(default)]
    pub macros: Vec<Macro>,
    #[serde(default)]
    pub tags: Vec<Tag>,
    #[serde(default)]
    pub triggers: Vec<Value>,
    #[serde(default)]
    pub graphs: Vec<Value>,
    #[serde(default)]
    pub httptests: Vec<Value>,
    #[serde(default)]
    pub dashboards: Vec<Value>,
    #[serde(default)]
    pub valuemaps: Vec<Value>,
    #[serde(flatten)]
    pub extra: Extra,
}

/// An item or an item prototype.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TemplateItem {
    #[serde(default, deserialize_with = "lenient_string")]
    pub uuid: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub name: String,
    #[serde(default, rename = "type", deserialize_with = "lenient_string")]
    pub item_type: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub key: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub value_type: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub units: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub status: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub discover: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub description: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub delay: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub snmp_oid: String,
    #[serde(default)]
    pub preprocessing: Vec<PreprocessStepDef>,
    #[serde(default)]
    pub tags: Vec<Tag>,
    #[serde(default)]
    pub triggers: Vec<Value>,
    #[serde(default)]
    pub trigger_prototypes: Vec<Value>,
    #[serde(flatten)]
    pub extra: Extra,
}

impl TemplateItem {
    pub fn value_type(&self) -> ValueType {
        convert_value_type(&self.value_type)
    }

    pub fn is_snmp(&self) -> bool {
        is_snmp_type(&self.item_type)
    }

    /// Disabled items and prototypes marked "do not discover" are skipped.
    pub fn is_enabled(&self) -> bool {
        !matches!(self.status.to_ascii_uppercase().as_str(), "DISABLED" | "1")
            && !matches!(self.discover.to_ascii_uppercase().as_str(), "NO_DISCOVER" | "1")
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DiscoveryRule {
    #[serde(default, deserialize_with = "lenient_string")]
    pub uuid: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub name: String,
    #[serde(default, rename = "type", deserialize_with = "lenient_string")]
    pub rule_type: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub key: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub delay: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub status: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub description: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub snmp_oid: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub lifetime: String,
    #[serde(default)]
    pub item_prototypes: Vec<TemplateItem>,
    #[serde(default)]
    pub filter: DiscoveryFilter,
    #[serde(default)]
    pub preprocessing: Vec<PreprocessStepDef>,
    #[serde(default)]
    pub lld_macro_paths: Vec<LldMacroPath>,
    #[serde(default)]
    pub overrides: Vec<Value>,
    #[serde(default)]
    pub trigger_prototypes: Vec<Value>,
    #[serde(default)]
    pub graph_prototypes: Vec<Value>,
    #[serde(default)]
    pub host_prototypes: Vec<Value>,
    #[serde(flatten)]
    pub extra: Extra,
}

impl DiscoveryRule {
    pub fn is_snmp(&self) -> bool {
        is_snmp_type(&self.rule_type)
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self.status.to_ascii_uppercase().as_str(), "DISABLED" | "1")
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LldMacroPath {
    #[serde(default, deserialize_with = "lenient_string")]
    pub lld_macro: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub path: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct Macro {
    #[serde(rename = "macro", default, deserialize_with = "lenient_string")]
    pub name: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub value: String,
    #[serde(default, rename = "type", deserialize_with = "lenient_string")]
    pub macro_type: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub description: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct Tag {
    #[serde(default, deserialize_with = "lenient_string")]
    pub tag: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub value: String,
}

/// A preprocessing step as written in the template.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct PreprocessStepDef {
    #[serde(rename = "type", default, deserialize_with = "lenient_string")]
    pub kind: String,
    #[serde(default, deserialize_with = "lenient_strings")]
    pub parameters: Vec<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub error_handler: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub error_handler_params: String,
}

impl TemplateDocument {
    pub fn parse(content: &str) -> Result<Self, TemplateError> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn load(path: &Path) -> Result<Self, TemplateError> {
        let content = std::fs::read_to_string(path).map_err(|source| TemplateError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn to_yaml(&self) -> Result<String, TemplateError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Fold `other` into this document.
    ///
    /// Items, rules and macros from every template and host of `other` land in
    /// the first template of `self`, replacing entries with the same key and
    /// otherwise keeping first-seen order. Version and date come from `other`.
    pub fn merge(&mut self, other: TemplateDocument) {
        let export = &mut self.zabbix_export;
        if export.templates.is_empty() {
            export.templates.push(Template::default());
        }
        let base = &mut export.templates[0];

        let Export {
            version,
            date,
            templates,
            hosts,
            ..
        } = other.zabbix_export;

        for part in templates.into_iter().chain(hosts) {
            upsert_by(&mut base.items, part.items, |i| i.key.clone());
            upsert_by(&mut base.discovery_rules, part.discovery_rules, |r| r.key.clone());
            upsert_by(&mut base.macros, part.macros, |m| m.name.clone());
        }

        export.version = version;
        export.date = date;
    }
}

fn upsert_by<T, F>(base: &mut Vec<T>, incoming: Vec<T>, key: F)
where
    F: Fn(&T) -> String,
{
    let mut positions: HashMap<String, usize> = base
        .iter()
        .enumerate()
        .map(|(i, v)| (key(v), i))
        .collect();

    for value in incoming {
        let k = key(&value);
        match positions.get(&k) {
            Some(&i) => base[i] = value,
            None => {
                positions.insert(k, base.len());
                base.push(value);
            }
        }
    }
}

/// A merged, validated template with its definitions flattened across
/// templates and hosts.
#[derive(Debug, Clone, Default)]
pub struct LoadedTemplate {
    pub document: TemplateDocument,
    pub items: Vec<TemplateItem>,
    pub discovery_rules: Vec<DiscoveryRule>,
    pub macros: Vec<Macro>,
}

impl LoadedTemplate {
    /// Load files in order, then inline contents in key order, merging each
    /// into the previous. Returns `None` when there is nothing to load.
    ///
    /// A file that cannot be read or parsed fails the whole load. An inline
    /// document that does not parse is logged and skipped.
    pub fn load(
        files: &[String],
        contents: &BTreeMap<String, String>,
    ) -> Result<Option<Self>, TemplateError> {
        let mut merged: Option<TemplateDocument> = None;

        for file in files {
            let doc = TemplateDocument::load(Path::new(file))?;
            tracing::debug!(file = %file, "Loaded template file");
            merge_into(&mut merged, doc);
        }

        for (name, content) in contents {
            match TemplateDocument::parse(content) {
                Ok(doc) => merge_into(&mut merged, doc),
                Err(e) => {
                    tracing::warn!(template = %name, error = %e, "Skipping inline template");
                }
            }
        }

        merged.map(Self::from_document).transpose()
    }

    pub fn from_document(document: TemplateDocument) -> Result<Self, TemplateError> {
        let export = &document.zabbix_export;
        if export.version.is_empty() {
            return Err(TemplateError::MissingVersion);
        }
        if export.templates.is_empty() && export.hosts.is_empty() {
            return Err(TemplateError::Empty);
        }

        let mut loaded = LoadedTemplate {
            document: TemplateDocument::default(),
            items: Vec::new(),
            discovery_rules: Vec::new(),
            macros: Vec::new(),
        };

        for part in export.templates.iter().chain(&export.hosts) {
            loaded.macros.extend(part.macros.iter().cloned());

            for item in &part.items {
                let index = loaded.items.len();
                match check_item(index, item) {
                    Ok(()) => loaded.items.push(item.clone()),
                    Err(e) => tracing::warn!(error = %e, "Skipping template item"),
                }
            }

            for rule in &part.discovery_rules {
                let index = loaded.discovery_rules.len();
                match check_rule(index, rule) {
                    Ok(()) => loaded.discovery_rules.push(rule.clone()),
                    Err(e) => tracing::warn!(error = %e, "Skipping discovery rule"),
                }
            }
        }

        loaded.document = document;
        tracing::info!(
            items = loaded.items.len(),
            discovery_rules = loaded.discovery_rules.len(),
            macros = loaded.macros.len(),
            "Template loaded"
        );
        Ok(loaded)
    }

    /// Value of a user macro such as `{$IF.UTIL.MAX}`; a context macro
    /// `{$NAME:"ctx"}` falls back to `{$NAME}`.
    pub fn macro_value(&self, name: &str) -> Option<&str> {
        let exact = self
            .macros
            .iter()
            .find(|m| m.name == name)
            .map(|m| m.value.as_str());
        if exact.is_some() {
            return exact;
        }
        let (base, _) = name.strip_suffix('}')?.split_once(':')?;
        let base = format!("{}}}", base);
        self.macros
            .iter()
            .find(|m| m.name == base)
            .map(|m| m.value.as_str())
    }

    pub fn expand_macros(&self, text: &str, row: Option<&BTreeMap<String, String>>) -> String {
        macros::expand(text, row, |name| self.macro_value(name))
    }

    pub fn snmp_items(&self) -> impl Iterator<Item = &TemplateItem> {
        self.items.iter().filter(|i| i.is_snmp())
    }

    pub fn snmp_rules(&self) -> impl Iterator<Item = &DiscoveryRule> {
        self.discovery_rules.iter().filter(|r| r.is_snmp())
    }
}

fn merge_into(merged: &mut Option<TemplateDocument>, doc: TemplateDocument) {
    match merged {
        Some(base) => base.merge(doc),
        None => *merged = Some(doc),
    }
}

fn check_item(index: usize, item: &TemplateItem) -> Result<(), TemplateError> {
    let missing = |field| TemplateError::MissingField {
        kind: "item",
        index,
        field,
    };
    if item.key.is_empty() {
        return Err(missing("key"));
    }
    if item.name.is_empty() {
        return Err(missing("name"));
    }
    if item.item_type.is_empty() {
        return Err(missing("type"));
    }
    Ok(())
}

fn check_rule(index: usize, rule: &DiscoveryRule) -> Result<(), TemplateError> {
    let missing = |field| TemplateError::MissingField {
        kind: "discovery rule",
        index,
        field,
    };
    if rule.key.is_empty() {
        return Err(missing("key"));
    }
    if rule.name.is_empty() {
        return Err(missing("name"));
    }
    Ok(())
}

/// Map a template value type to the output type.
pub fn convert_value_type(value_type: &str) -> ValueType {
    match value_type.to_ascii_uppercase().as_str() {
        "FLOAT" | "0" => ValueType::Float,
        "UNSIGNED" | "3" => ValueType::Unsigned,
        _ => ValueType::Text,
    }
}

/// SNMP agent items: `SNMP_AGENT` or the legacy v1/v2c/v3 codes.
pub fn is_snmp_type(item_type: &str) -> bool {
    matches!(
        item_type.to_ascii_uppercase().as_str(),
        "SNMP_AGENT" | "1" | "4" | "6"
    )
}

fn scalar_to_string<E: serde::de::Error>(value: Value) -> Result<String, E> {
    match value {
        Value::Null => Ok(String::new()),
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(E::custom(format!("expected a scalar, found {:?}", other))),
    }
}

/// Accept strings, numbers and booleans for string fields.
fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    scalar_to_string(Value::deserialize(deserializer)?)
}

fn lenient_strings<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(Vec::new()),
        Value::Sequence(seq) => seq.into_iter().map(scalar_to_string).collect(),
        scalar @ (Value::String(_) | Value::Number(_) | Value::Bool(_)) => {
            Ok(vec![scalar_to_string(scalar)?])
        }
        other => Err(D::Error::custom(format!("expected a list, found {:?}", other))),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    pub(crate) const IF_TEMPLATE: &str = r#"
zabbix_export:
  version: '6.0'
  date: '2024-01-01T00:00:00Z'
  groups:
    - uuid: 36bff6c29af64692839d077febfc7079
      name: Templates/Network devices
  templates:
    - uuid: 1
      template: Network interfaces SNMP
      name: Network interfaces SNMP
      macros:
        - macro: '{$IF.DELAY}'
          value: 3m
      items:
        - name: Uptime
          type: SNMP_AGENT
          snmp_oid: 1.3.6.1.2.1.1.3.0
          key: system.uptime
          value_type: 3
          delay: 1m
          preprocessing:
            - type: MULTIPLIER
              parameters:
                - '0.01'
      discovery_rules:
        - name: Network interfaces discovery
          type: SNMP_AGENT
          snmp_oid: 'discovery[{#IFDESCR},1.3.6.1.2.1.2.2.1.2,{#IFOPERSTATUS},1.3.6.1.2.1.2.2.1.8]'
          key: net.if.discovery
          delay: 1h
          filter:
            evaltype: AND
            conditions:
              - macro: '{#IFOPERSTATUS}'
                value: '1'
                operator: EQUALS
                formulaid: A
          item_prototypes:
            - name: 'Interface {#IFDESCR}: Bits received'
              type: SNMP_AGENT
              snmp_oid: '1.3.6.1.2.1.31.1.1.1.6.{#SNMPINDEX}'
              key: 'net.if.in[ifHCInOctets.{#SNMPINDEX}]'
              value_type: UNSIGNED
              delay: '{$IF.DELAY}'
              preprocessing:
                - type: CHANGE_PER_SECOND
                - type: MULTIPLIER
                  parameters:
                    - 8
            - name: 'Interface {#IFDESCR}: Alias'
              type: SNMP_AGENT
              snmp_oid: '1.3.6.1.2.1.31.1.1.1.18.{#SNMPINDEX}'
              key: 'net.if.alias[ifAlias.{#SNMPINDEX}]'
              value_type: CHAR
          trigger_prototypes:
            - expression: 'last(/x/y)=0'
              name: Link down
      triggers:
        - expression: 'nodata(/x/system.uptime,5m)=1'
          name: No SNMP data
"#;

    #[test]
    fn parses_document() {
        let t = LoadedTemplate::from_document(TemplateDocument::parse(IF_TEMPLATE).unwrap()).unwrap();
        assert_eq!(t.items.len(), 1);
        assert_eq!(t.items[0].value_type, "3");
        assert_eq!(t.items[0].value_type(), ValueType::Unsigned);
        assert_eq!(t.items[0].preprocessing[0].parameters, vec!["0.01"]);

        let rule = &t.discovery_rules[0];
        assert!(rule.is_snmp());
        assert_eq!(rule.item_prototypes.len(), 2);
        assert_eq!(rule.item_prototypes[0].preprocessing[1].parameters, vec!["8"]);
        assert_eq!(rule.item_prototypes[1].value_type(), ValueType::Text);
        assert_eq!(rule.filter.conditions[0].formula_id, "A");
        assert_eq!(rule.trigger_prototypes.len(), 1);
        assert_eq!(t.macro_value("{$IF.DELAY}"), Some("3m"));
        assert_eq!(t.snmp_items().count(), 1);
    }

    #[test]
    fn inert_sections_round_trip() {
        let doc = TemplateDocument::parse(IF_TEMPLATE).unwrap();
        let again = TemplateDocument::parse(&doc.to_yaml().unwrap()).unwrap();
        let tmpl = &again.zabbix_export.templates[0];
        assert_eq!(tmpl.triggers.len(), 1);
        assert_eq!(again.zabbix_export.groups.len(), 1);
        assert_eq!(tmpl.discovery_rules[0].trigger_prototypes.len(), 1);
    }

    #[test]
    fn merge_later_document_wins() {
        let a = TemplateDocument::parse(
            r#"
zabbix_export:
  version: '5.4'
  date: a
  templates:
    - template: A
      name: A
      items:
        - { name: one, type: SNMP_AGENT, key: k1, snmp_oid: 1.1 }
        - { name: two, type: SNMP_AGENT, key: k2, snmp_oid: 1.2 }
      macros:
        - { macro: '{$M}', value: a }
"#,
        )
        .unwrap();
        let b = TemplateDocument::parse(
            r#"
zabbix_export:
  version: '6.0'
  date: b
  hosts:
    - host: h
      name: h
      items:
        - { name: two-b, type: SNMP_AGENT, key: k2, snmp_oid: 9.9 }
        - { name: three, type: SNMP_AGENT, key: k3, snmp_oid: 1.3 }
      macros:
        - { macro: '{$M}', value: b }
"#,
        )
        .unwrap();

        let mut merged = a;
        merged.merge(b);
        let t = LoadedTemplate::from_document(merged).unwrap();

        let keys: Vec<_> = t.items.iter().map(|i| (i.key.as_str(), i.snmp_oid.as_str())).collect();
        assert_eq!(keys, vec![("k1", "1.1"), ("k2", "9.9"), ("k3", "1.3")]);
        assert_eq!(t.items[1].name, "two-b");
        assert_eq!(t.macro_value("{$M}"), Some("b"));
        assert_eq!(t.document.zabbix_export.version, "6.0");
        assert_eq!(t.document.zabbix_export.date, "b");
    }

    #[test]
    fn invalid_definitions_are_skipped() {
        let doc = TemplateDocument::parse(
            r#"
zabbix_export:
  version: '6.0'
  templates:
    - template: T
      items:
        - { name: ok, type: SNMP_AGENT, key: k1 }
        - { name: no-key, type: SNMP_AGENT }
      discovery_rules:
        - { key: r1 }
"#,
        )
        .unwrap();
        let t = LoadedTemplate::from_document(doc).unwrap();
        assert_eq!(t.items.len(), 1);
        assert!(t.discovery_rules.is_empty());
    }

    #[test]
    fn document_level_errors() {
        let no_version = TemplateDocument::parse("zabbix_export:\n  templates:\n    - template: T\n").unwrap();
        assert!(matches!(
            LoadedTemplate::from_document(no_version),
            Err(TemplateError::MissingVersion)
        ));
        let empty = TemplateDocument::parse("zabbix_export:\n  version: '6.0'\n").unwrap();
        assert!(matches!(LoadedTemplate::from_document(empty), Err(TemplateError::Empty)));
    }

    #[test]
    fn load_files_then_inline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("if.yaml");
        std::fs::write(&path, IF_TEMPLATE).unwrap();

        let mut inline = BTreeMap::new();
        inline.insert("broken".to_string(), "zabbix_export: [".to_string());
        inline.insert(
            "override".to_string(),
            "zabbix_export:\n  version: '7.0'\n  templates:\n    - template: X\n      macros:\n        - { macro: '{$IF.DELAY}', value: 10m }\n"
                .to_string(),
        );

        let t = LoadedTemplate::load(&[path.display().to_string()], &inline)
            .unwrap()
            .unwrap();
        assert_eq!(t.macro_value("{$IF.DELAY}"), Some("10m"));
        assert_eq!(t.document.zabbix_export.version, "7.0");

        assert!(LoadedTemplate::load(&[], &BTreeMap::new()).unwrap().is_none());
        assert!(matches!(
            LoadedTemplate::load(&["/nonexistent/t.yaml".to_string()], &BTreeMap::new()),
            Err(TemplateError::Io { .. })
        ));
    }

    #[test]
    fn context_macro_falls_back() {
        let t = LoadedTemplate {
            macros: vec![Macro {
                name: "{$TEMP.MAX}".into(),
                value: "60".into(),
                ..Default::default()
            }],
            ..Default::default()
        };
        assert_eq!(t.macro_value("{$TEMP.MAX:\"cpu\"}"), Some("60"));
        assert_eq!(t.macro_value("{$OTHER}"), None);
    }

    #[test]
    fn type_mappings() {
        assert_eq!(convert_value_type("FLOAT"), ValueType::Float);
        assert_eq!(convert_value_type("0"), ValueType::Float);
        assert_eq!(convert_value_type("LOG"), ValueType::Text);
        assert_eq!(convert_value_type("whatever"), ValueType::Text);
        assert!(is_snmp_type("snmp_agent"));
        assert!(is_snmp_type("4"));
        assert!(!is_snmp_type("ZABBIX_ACTIVE"));
    }
}
