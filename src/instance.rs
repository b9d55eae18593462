//! One configured poller: template, sessions, schedulers and the up metric.

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::collector::{CollectStats, Collector, PLUGIN};
use crate::config::InstanceConfig;
use crate::connection::{ConnectionManager, HealthSettings};
use crate::discovery::{DiscoveryCallback, DiscoveryEngine, DiscoveryScheduler};
use crate::item::{MonitorItem, ValueType};
use crate::labels::LabelCache;
use crate::preprocess::{self, Pipeline};
use crate::scheduler::ItemScheduler;
use crate::snmp::client::SnmpConnector;
use crate::snmp::Connector;
use crate::storage::SampleList;
use crate::template::{DiscoveryRule, LoadedTemplate};
use crate::timing::{parse_delay, DEFAULT_ITEM_DELAY};
use crate::types::{Sample, SampleValue, Tags};

pub struct Instance {
    config: InstanceConfig,
    template: Option<Arc<LoadedTemplate>>,
    connections: Arc<ConnectionManager>,
    items: Arc<ItemScheduler>,
    discovery: Option<Arc<DiscoveryScheduler>>,
    sink: SampleList,
    reporter: Arc<Reporter>,
    /// Poll newly discovered items right away. Off for one-shot runs, which
    /// poll everything themselves.
    poll_discovered: Arc<AtomicBool>,
    cancel: CancellationToken,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl Instance {
    pub fn new(config: InstanceConfig, sink: SampleList) -> Result<Self> {
        Self::with_connector(config, sink, Arc::new(SnmpConnector))
    }

    /// Build every component without touching the network.
    pub fn with_connector(config: InstanceConfig, sink: SampleList, connector: Arc<dyn Connector>) -> Result<Self> {
        config.validate()?;
        let endpoints = config.endpoints()?;

        let template = LoadedTemplate::load(&config.template_files, &config.template_file_contents)
            .context("failed to load templates")?
            .map(Arc::new);

        let connections = ConnectionManager::new(connector, endpoints, HealthSettings::from_config(&config));
        let pipeline = Arc::new(Pipeline::from_config(&config));
        let labels = Arc::new(LabelCache::new());

        let collector = Collector::new(connections.clone(), pipeline.clone(), labels, sink.clone()).configure(&config);
        let items = ItemScheduler::with_ttls(
            Arc::new(collector),
            config.discovered_delete_ttl,
            config.discovered_disable_ttl,
        );

        let cancel = CancellationToken::new();
        let poll_discovered = Arc::new(AtomicBool::new(true));

        let discovery = template.as_ref().map(|template| {
            let engine = DiscoveryEngine::new(
                connections.clone(),
                template.clone(),
                pipeline.clone(),
                config.preprocessing_policy,
            );
            let scheduler = DiscoveryScheduler::with_cancel(Arc::new(engine), cancel.child_token());
            scheduler.set_callback(discovery_callback(items.clone(), poll_discovered.clone()));
            scheduler
        });

        let reporter = Arc::new(Reporter {
            enabled: config.up_enabled(),
            labels: config.labels.clone(),
            connections: connections.clone(),
            items: items.clone(),
        });

        Ok(Self {
            config,
            template,
            connections,
            items,
            discovery,
            sink,
            reporter,
            poll_discovered,
            cancel,
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &InstanceConfig {
        &self.config
    }

    pub fn template(&self) -> Option<&Arc<LoadedTemplate>> {
        self.template.as_ref()
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn items(&self) -> &Arc<ItemScheduler> {
        &self.items
    }

    pub fn discovery(&self) -> Option<&Arc<DiscoveryScheduler>> {
        self.discovery.as_ref()
    }

    /// Connect, schedule static items and discovery rules, then start every
    /// loop. Calling it again does nothing.
    pub async fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.poll_discovered.store(true, Ordering::SeqCst);
        self.connections.connect_all().await;
        self.connections.start_health_check();

        self.schedule();
        self.items.start();
        if let Some(discovery) = &self.discovery {
            discovery.start();
        }
        self.spawn_up_loop();

        tracing::info!(
            agents = self.connections.agents().len(),
            discovery = self.discovery.is_some(),
            "Instance started"
        );
    }

    /// One discovery round followed by one poll of everything, without
    /// starting any loop.
    pub async fn run_once(&self) -> CollectStats {
        self.poll_discovered.store(false, Ordering::SeqCst);
        self.connections.connect_all().await;
        self.schedule();
        if let Some(discovery) = &self.discovery {
            let rules = discovery.run_all_now().await;
            tracing::debug!(rules, "Discovery round finished");
        }
        let stats = self.items.poll_now().await;
        self.sink.extend(self.reporter.samples());
        stats
    }

    /// Cancel every loop and close every session. Later calls do nothing.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        if let Some(discovery) = &self.discovery {
            discovery.stop();
        }
        self.items.stop();
        self.connections.close().await;
        tracing::info!("Instance stopped");
    }

    fn schedule(&self) {
        let statics = self.static_items();
        tracing::info!(items = statics.len(), "Scheduling static items");
        for item in statics {
            self.items.add_item(item);
        }
        if let (Some(discovery), Some(template)) = (&self.discovery, &self.template) {
            discovery.load_from_template(&self.connections.agents(), template, self.config.preprocessing_policy);
        }
    }

    /// Configured items without a discovery rule plus enabled template items
    /// that carry no discovery macro, for every agent.
    pub fn static_items(&self) -> Vec<MonitorItem> {
        let agents = self.connections.agents();
        let mut items = Vec::new();

        for cfg in self.config.items.iter().filter(|i| i.discovery_rule.is_empty()) {
            for agent in &agents {
                let mut item = MonitorItem::new(agent.as_str(), cfg.key.as_str(), cfg.oid.as_str());
                item.name = cfg.name.clone();
                item.units = cfg.units.clone();
                item.value_type = ValueType::parse(&cfg.value_type);
                item.delay = cfg.delay;
                items.push(item);
            }
        }

        let Some(template) = &self.template else {
            return items;
        };
        for def in template.snmp_items() {
            if !def.is_enabled() {
                continue;
            }
            let key = template.expand_macros(&def.key, None);
            let oid = template.expand_macros(&def.snmp_oid, None);
            if oid.is_empty() || key.contains("{#") || oid.contains("{#") {
                tracing::debug!(key = %def.key, "Skipping template item with discovery macros");
                continue;
            }
            let steps = match preprocess::compile_steps(&def.preprocessing, self.config.preprocessing_policy) {
                Ok(steps) => Arc::from(steps),
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Skipping template item");
                    continue;
                }
            };
            let tags: Tags = def
                .tags
                .iter()
                .map(|t| (t.tag.clone(), template.expand_macros(&t.value, None)))
                .collect();
            let delay = parse_delay(&template.expand_macros(&def.delay, None), DEFAULT_ITEM_DELAY);

            for agent in &agents {
                let mut item = MonitorItem::new(agent.as_str(), key.as_str(), oid.as_str());
                item.name = template.expand_macros(&def.name, None);
                item.description = template.expand_macros(&def.description, None);
                item.units = def.units.clone();
                item.value_type = def.value_type();
                item.delay = delay;
                item.preprocessing = Arc::clone(&steps);
                item.tags = tags.clone();
                items.push(item);
            }
        }
        items
    }

    /// `snmp_zabbix_up` per agent, tagged with the instance labels.
    pub fn up_samples(&self) -> Vec<Sample> {
        self.reporter.up_samples()
    }

    fn spawn_up_loop(&self) {
        let cancel = self.cancel.clone();
        let sink = self.sink.clone();
        let reporter = self.reporter.clone();
        let period = self.config.up_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("Stopping up loop");
                        return;
                    }
                    _ = ticker.tick() => sink.extend(reporter.samples()),
                }
            }
        });
    }
}

/// Builds the instance's own health samples.
struct Reporter {
    enabled: bool,
    labels: Tags,
    connections: Arc<ConnectionManager>,
    items: Arc<ItemScheduler>,
}

impl Reporter {
    fn up_samples(&self) -> Vec<Sample> {
        if !self.enabled {
            return Vec::new();
        }
        self.connections
            .health_report()
            .agents
            .into_iter()
            .map(|(agent, health)| {
                let mut tags = self.labels.clone();
                tags.insert("snmp_host".into(), crate::config::host_of(&agent).to_string());
                tags.insert("plugin".into(), PLUGIN.into());
                tags.insert("snmp_agent".into(), agent);
                Sample::new("snmp_zabbix_up", SampleValue::Int(i64::from(health.healthy)), tags)
            })
            .collect()
    }

    /// Up samples plus the item scheduler's discovery state samples.
    fn samples(&self) -> Vec<Sample> {
        let mut samples = self.up_samples();
        samples.extend(self.items.internal_samples());
        samples
    }
}

/// Hands discovered items to the item scheduler. Items whose OID is empty
/// or still carries a discovery macro are dropped.
fn discovery_callback(items: Arc<ItemScheduler>, poll_discovered: Arc<AtomicBool>) -> DiscoveryCallback {
    Arc::new(move |agent: &str, rule: &DiscoveryRule, discovered: Vec<MonitorItem>| {
        let total = discovered.len();
        let usable: Vec<MonitorItem> = discovered
            .into_iter()
            .filter(|item| !item.oid.is_empty() && !item.oid.contains("{#"))
            .collect();
        if usable.len() < total {
            tracing::debug!(agent, rule = %rule.key, dropped = total - usable.len(), "Dropped unresolved discovered items");
        }
        let diff = items.update_discovered_diff(&rule.key, usable, poll_discovered.load(Ordering::SeqCst));
        tracing::debug!(agent, rule = %rule.key, ?diff, "Discovered items reconciled");
    })
}
