//! Polls items through the connection manager and turns the answers into
//! samples.
//!
//! One call handles the due items of one agent under the agent's call lock.
//! OIDs are fetched in batches; when a batch fails every item of it is
//! retried on its own, so one bad OID only costs its own result.

use futures_util::future::join_all;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::config::InstanceConfig;
use crate::connection::ConnectionManager;
use crate::error::{PreprocessError, TransportError};
use crate::item::{MonitorItem, ValueType};
use crate::labels::LabelCache;
use crate::preprocess::{self, OctetMode, Pipeline, Value};
use crate::snmp::{normalize_oid, parse_oid, Session, SnmpValue};
use crate::storage::SampleList;
use crate::types::{Sample, SampleValue, Tags};

/// Value of the `plugin` tag on every sample.
pub const PLUGIN: &str = "snmp_zabbix";

const DEFAULT_BATCH_SIZE: usize = 60;

/// Outcome counters of one collection call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectStats {
    pub polled: usize,
    pub samples: usize,
    pub labels: usize,
    /// Values held back without a fault, such as the first observation of a
    /// rate.
    pub skipped: usize,
    pub errors: usize,
}

impl CollectStats {
    pub fn merge(&mut self, other: CollectStats) {
        self.polled += other.polled;
        self.samples += other.samples;
        self.labels += other.labels;
        self.skipped += other.skipped;
        self.errors += other.errors;
    }
}

pub struct Collector {
    connections: Arc<ConnectionManager>,
    pipeline: Arc<Pipeline>,
    labels: Arc<LabelCache>,
    sink: SampleList,
    batch_size: usize,
    static_tags: Tags,
    mappings: HashMap<String, Tags>,
}

impl Collector {
    pub fn new(
        connections: Arc<ConnectionManager>,
        pipeline: Arc<Pipeline>,
        labels: Arc<LabelCache>,
        sink: SampleList,
    ) -> Self {
        Self {
            connections,
            pipeline,
            labels,
            sink,
            batch_size: DEFAULT_BATCH_SIZE,
            static_tags: Tags::new(),
            mappings: HashMap::new(),
        }
    }

    /// Apply the instance's batch size, labels and per-agent mappings.
    pub fn configure(mut self, config: &InstanceConfig) -> Self {
        self.batch_size = config.batch_size.max(1);
        self.static_tags = config.labels.clone();
        self.mappings = config
            .mappings
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn labels(&self) -> &Arc<LabelCache> {
        &self.labels
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    /// Poll `items`, which may belong to several agents. Agents are polled
    /// concurrently.
    pub async fn collect_items(&self, items: &[Arc<MonitorItem>]) -> CollectStats {
        let mut by_agent: BTreeMap<&str, Vec<Arc<MonitorItem>>> = BTreeMap::new();
        for item in items {
            by_agent.entry(item.agent.as_str()).or_default().push(item.clone());
        }

        let results = join_all(
            by_agent
                .into_iter()
                .map(|(agent, items)| async move { self.collect_agent(agent, &items).await }),
        )
        .await;

        let mut stats = CollectStats::default();
        for result in results {
            stats.merge(result);
        }
        stats
    }

    /// Poll the items of one agent. Label providers go first so their values
    /// tag the metrics of the same call.
    pub async fn collect_agent(&self, agent: &str, items: &[Arc<MonitorItem>]) -> CollectStats {
        let mut stats = CollectStats::default();
        if items.is_empty() {
            return stats;
        }

        let _guard = self.connections.acquire(agent).await;
        let session = match self.connections.get_session(agent).await {
            Ok(session) => session,
            Err(e) => {
                tracing::debug!(agent, items = items.len(), error = %e, "No session, skipping poll");
                stats.errors = items.len();
                return stats;
            }
        };

        let mut ordered: Vec<&Arc<MonitorItem>> = items.iter().collect();
        ordered.sort_by_key(|item| !item.is_label_provider());

        for batch in ordered.chunks(self.batch_size) {
            let results = self.fetch(session.as_ref(), agent, batch).await;
            for (item, result) in batch.iter().zip(results) {
                stats.polled += 1;
                let value = match result {
                    Ok(value) => value,
                    Err(e) => {
                        tracing::debug!(agent, key = %item.key, oid = %item.oid, error = %e, "Poll failed");
                        stats.errors += 1;
                        continue;
                    }
                };

                if item.is_label_provider() {
                    if self.harvest_label(agent, item, &value).await {
                        stats.labels += 1;
                    }
                    continue;
                }

                match self.process(agent, item, &value).await {
                    Processed::Sample(sample) => {
                        self.sink.push(sample);
                        stats.samples += 1;
                    }
                    Processed::Skipped => stats.skipped += 1,
                    Processed::Failed => stats.errors += 1,
                }
            }
        }

        tracing::trace!(
            agent,
            polled = stats.polled,
            samples = stats.samples,
            labels = stats.labels,
            errors = stats.errors,
            "Collection finished"
        );
        stats
    }

    /// One result per item, in item order.
    async fn fetch(
        &self,
        session: &dyn Session,
        agent: &str,
        batch: &[&Arc<MonitorItem>],
    ) -> Vec<Result<SnmpValue, TransportError>> {
        let mut results: Vec<Option<Result<SnmpValue, TransportError>>> = Vec::with_capacity(batch.len());
        let mut valid: Vec<usize> = Vec::new();
        for (i, item) in batch.iter().enumerate() {
            match parse_oid(&item.oid) {
                Ok(_) => {
                    valid.push(i);
                    results.push(None);
                }
                Err(e) => results.push(Some(Err(e))),
            }
        }

        let oids: Vec<String> = valid
            .iter()
            .map(|&i| normalize_oid(&batch[i].oid).to_string())
            .collect();

        if oids.len() > 1 {
            match session.get(&oids).await {
                Ok(binds) => {
                    self.connections.record_success(agent);
                    for (slot, &i) in valid.iter().enumerate() {
                        let value = match binds.get(slot) {
                            Some(bind) => checked(&oids[slot], bind.value.clone()),
                            None => Err(TransportError::NoSuchInstance(oids[slot].clone())),
                        };
                        results[i] = Some(value);
                    }
                    return results.into_iter().flatten().collect();
                }
                Err(e) => {
                    tracing::debug!(agent, oids = oids.len(), error = %e, "Batch poll failed, polling items one by one");
                    self.connections.record_error(agent, &e);
                }
            }
        }

        for (slot, &i) in valid.iter().enumerate() {
            let oid = std::slice::from_ref(&oids[slot]);
            let value = match session.get(oid).await {
                Ok(binds) => match binds.into_iter().next() {
                    Some(bind) => checked(&oids[slot], bind.value),
                    None => Err(TransportError::NoSuchInstance(oids[slot].clone())),
                },
                Err(e) => Err(e),
            };
            results[i] = Some(value);
        }
        results.into_iter().flatten().collect()
    }

    async fn preprocess(&self, agent: &str, item: &Arc<MonitorItem>, value: &SnmpValue) -> Result<Value, PreprocessError> {
        let input = Value::from_snmp(value, OctetMode::for_steps(&item.preprocessing));
        if item.preprocessing.is_empty() {
            return Ok(input);
        }
        if preprocess::needs_blocking(&item.preprocessing) {
            let pipeline = self.pipeline.clone();
            let item = item.clone();
            let agent = agent.to_string();
            return tokio::task::spawn_blocking(move || pipeline.apply(&agent, &item.key, input, &item.preprocessing))
                .await
                .map_err(|e| PreprocessError::Custom(format!("preprocessing task failed: {}", e)))?;
        }
        self.pipeline.apply(agent, &item.key, input, &item.preprocessing)
    }

    /// Store the value of a label provider. A failing chain falls back to the
    /// raw text; an unchanged or discarded value leaves the cache alone.
    async fn harvest_label(&self, agent: &str, item: &Arc<MonitorItem>, value: &SnmpValue) -> bool {
        let (Some(origin), Some(label)) = (item.discovery.as_ref(), item.label_key.as_deref()) else {
            return false;
        };
        let text = match self.preprocess(agent, item, value).await {
            Ok(v) => v.to_text(),
            Err(e) if e.is_quiet() => return false,
            Err(e) => {
                tracing::debug!(agent, key = %item.key, error = %e, "Label preprocessing failed, using raw value");
                Value::from_snmp(value, OctetMode::Text).to_text()
            }
        };
        self.labels.set(agent, &origin.rule_key, &origin.index, label, &text);
        true
    }

    async fn process(&self, agent: &str, item: &Arc<MonitorItem>, value: &SnmpValue) -> Processed {
        let processed = match self.preprocess(agent, item, value).await {
            Ok(v) => v,
            Err(e) if e.is_quiet() => {
                tracing::debug!(agent, key = %item.key, reason = %e, "No value this cycle");
                return Processed::Skipped;
            }
            Err(e) => {
                tracing::debug!(agent, key = %item.key, error = %e, "Preprocessing failed, dropping value");
                return Processed::Failed;
            }
        };

        let value = match cast(&processed, item.value_type) {
            Ok(v) => v,
            Err(reason) => {
                tracing::warn!(agent, key = %item.key, value_type = ?item.value_type, reason = %reason, "Cannot convert value");
                return Processed::Failed;
            }
        };

        Processed::Sample(Sample::new(measurement_name(&item.key), value, self.build_tags(agent, item)))
    }

    fn build_tags(&self, agent: &str, item: &MonitorItem) -> Tags {
        let mut tags = Tags::new();
        let host = self.connections.host_of(agent);
        tags.insert("snmp_agent".into(), agent.to_string());
        tags.insert("snmp_host".into(), host.to_string());
        tags.insert("oid".into(), item.oid.clone());
        tags.insert("plugin".into(), PLUGIN.into());

        if let Some(origin) = item.discovery.as_ref().filter(|o| !o.index.is_empty()) {
            if let Some(cached) = self.labels.get(agent, &origin.rule_key, &origin.index) {
                tags.extend(cached);
            }
        }

        index_tags(&item.key, &mut tags);

        if !item.key.is_empty() {
            tags.insert("item_key".into(), item.key.clone());
        }
        if !item.name.is_empty() {
            tags.insert("item".into(), item.name.clone());
        }
        tags.extend(item.tags.iter().map(|(k, v)| (k.clone(), v.clone())));
        tags.extend(self.static_tags.iter().map(|(k, v)| (k.clone(), v.clone())));

        if let Some(mapped) = self.mappings.get(agent).or_else(|| self.mappings.get(host)) {
            tags.extend(mapped.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        tags
    }
}

enum Processed {
    Sample(Sample),
    Skipped,
    Failed,
}

/// Exception values answer a GET but carry no data.
fn checked(oid: &str, value: SnmpValue) -> Result<SnmpValue, TransportError> {
    match value {
        SnmpValue::NoSuchObject | SnmpValue::EndOfMibView => Err(TransportError::NoSuchObject(oid.to_string())),
        SnmpValue::NoSuchInstance => Err(TransportError::NoSuchInstance(oid.to_string())),
        v => Ok(v),
    }
}

/// Tags derived from the bracket parameter of a key.
fn index_tags(key: &str, tags: &mut Tags) {
    let (Some(start), Some(end)) = (key.find('['), key.find(']')) else {
        return;
    };
    if start >= end {
        return;
    }
    let param = &key[start + 1..end];
    let base = &key[..start];

    if base.contains("if.") {
        tags.insert("interface_index".into(), param.to_string());
        if let Some((_, last)) = param.rsplit_once('.') {
            if !last.is_empty() {
                tags.insert("snmp_index".into(), last.to_string());
            }
        }
    } else if base.contains("fs.") {
        tags.insert("filesystem_index".into(), param.to_string());
    } else {
        tags.insert("index".into(), param.to_string());
    }
}

/// `net.if.in[ifHCInOctets.2]` is measured as `snmp_net_if_in`.
pub fn measurement_name(key: &str) -> String {
    let base = key.split('[').next().unwrap_or(key);
    format!("snmp_{}", base.replace('.', "_"))
}

fn cast(value: &Value, value_type: ValueType) -> Result<SampleValue, String> {
    match value_type {
        ValueType::Float => value
            .as_f64()
            .map(SampleValue::Float)
            .ok_or_else(|| format!("'{}' is not a number", value.to_text())),
        ValueType::Unsigned => match value {
            Value::Unsigned(v) => Ok(SampleValue::Uint(*v)),
            Value::Int(v) => u64::try_from(*v)
                .map(SampleValue::Uint)
                .map_err(|_| format!("negative value {} for an unsigned item", v)),
            other => match other.as_f64() {
                Some(v) if v.is_finite() && v >= 0.0 => Ok(SampleValue::Uint(v as u64)),
                Some(v) => Err(format!("{} is not a valid unsigned value", v)),
                None => Err(format!("'{}' is not a number", other.to_text())),
            },
        },
        ValueType::Text => Ok(SampleValue::Text(value.to_text())),
        ValueType::Auto => Ok(match value.as_f64() {
            Some(v) => SampleValue::Float(v),
            None => SampleValue::Text(value.to_text()),
        }),
    }
}
