//! Item scheduling.
//!
//! Items are grouped by `(agent, cadence)`. Every distinct cadence has one
//! timer; a tick hands the due items of each group of that cadence to the
//! collector, one call per agent. Discovered items are reconciled per rule
//! with [`ItemScheduler::update_discovered_diff`].

use futures_util::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::collector::{CollectStats, Collector, PLUGIN};
use crate::item::{DiscoveryOrigin, MonitorItem};
use crate::labels::LabelCache;
use crate::timing::{self, DEFAULT_ITEM_DELAY};
use crate::types::{Sample, SampleValue, Tags};

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

type GroupKey = (String, Duration);

struct Slot {
    item: Arc<MonitorItem>,
    next_run: Instant,
}

/// All items of one agent polled on one cadence.
#[derive(Default)]
struct Group {
    items: BTreeMap<String, Slot>,
}

/// Lifecycle of a discovered item.
struct Tracked {
    item: Arc<MonitorItem>,
    lost_since: Option<Instant>,
    disabled: bool,
}

impl Tracked {
    fn state(&self) -> u8 {
        match (self.lost_since.is_some(), self.disabled) {
            (false, _) => 0,
            (true, false) => 1,
            (true, true) => 2,
        }
    }
}

#[derive(Default)]
struct State {
    groups: HashMap<GroupKey, Group>,
    discovered: HashMap<String, Tracked>,
    timers: HashSet<Duration>,
}

impl State {
    fn insert(&mut self, item: Arc<MonitorItem>, next_run: Instant) {
        self.groups
            .entry((item.agent.clone(), item.delay))
            .or_default()
            .items
            .insert(item.id(), Slot { item, next_run });
    }

    fn remove(&mut self, item: &MonitorItem) {
        let key = (item.agent.clone(), item.delay);
        if let Some(group) = self.groups.get_mut(&key) {
            group.items.remove(&item.id());
            if group.items.is_empty() {
                self.groups.remove(&key);
            }
        }
    }

    fn has_cadence(&self, cadence: Duration) -> bool {
        self.groups.keys().any(|(_, d)| *d == cadence)
    }

    /// Cadences with groups but no timer yet, now marked as timed.
    fn untimed_cadences(&mut self) -> Vec<Duration> {
        let cadences: HashSet<Duration> = self.groups.keys().map(|(_, d)| *d).collect();
        cadences
            .into_iter()
            .filter(|d| self.timers.insert(*d))
            .collect()
    }
}

/// What one reconciliation changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiffStats {
    pub added: usize,
    pub updated: usize,
    pub moved: usize,
    pub removed: usize,
    pub lost: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub running: bool,
    pub groups: usize,
    pub items: usize,
    pub discovered: usize,
    pub lost: usize,
    pub disabled: usize,
    pub cadences: Vec<String>,
}

pub struct ItemScheduler {
    collector: Arc<Collector>,
    labels: Arc<LabelCache>,
    state: RwLock<State>,
    running: AtomicBool,
    cancel: CancellationToken,
    delete_ttl: Duration,
    disable_ttl: Duration,
}

impl ItemScheduler {
    pub fn new(collector: Arc<Collector>) -> Arc<Self> {
        Self::with_ttls(collector, Duration::ZERO, Duration::ZERO)
    }

    /// A scheduler keeping lost discovered items for `delete_ttl`, and
    /// polling them for `disable_ttl`. Zero TTLs act immediately.
    pub fn with_ttls(collector: Arc<Collector>, delete_ttl: Duration, disable_ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            labels: collector.labels().clone(),
            collector,
            state: RwLock::new(State::default()),
            running: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            delete_ttl,
            disable_ttl,
        })
    }

    /// Schedule a static item. Static items are never reconciled.
    pub fn add_item(self: &Arc<Self>, mut item: MonitorItem) {
        if item.delay.is_zero() {
            item.delay = DEFAULT_ITEM_DELAY;
        }
        let next_run = timing::jittered(Instant::now(), item.delay);
        let cadences = {
            let mut state = self.state.write();
            state.insert(Arc::new(item), next_run);
            self.untimed(&mut state)
        };
        self.spawn_timers(cadences);
    }

    /// Reconcile the discovered items of `rule_key` with its latest output.
    ///
    /// Items missing from `items` are removed (or marked lost while a TTL is
    /// configured) and their labels dropped. Known items are updated in
    /// place and only rescheduled when their OID or cadence changed. New
    /// items start at `now + jitter`. With `run_now` new and moved items are
    /// polled right away.
    pub fn update_discovered_diff(self: &Arc<Self>, rule_key: &str, items: Vec<MonitorItem>, run_now: bool) -> DiffStats {
        let now = Instant::now();
        let mut stats = DiffStats::default();

        let fresh: BTreeMap<String, Arc<MonitorItem>> = items
            .into_iter()
            .map(|mut item| {
                if item.delay.is_zero() {
                    item.delay = DEFAULT_ITEM_DELAY;
                }
                let index = item.index().unwrap_or_default().to_string();
                item.discovery = Some(DiscoveryOrigin {
                    rule_key: rule_key.to_string(),
                    index,
                });
                (item.id(), Arc::new(item))
            })
            .collect();

        let mut immediate: Vec<Arc<MonitorItem>> = Vec::new();
        let cadences = {
            let mut state = self.state.write();

            let missing: Vec<String> = state
                .discovered
                .iter()
                .filter(|(id, t)| t.item.rule_key() == Some(rule_key) && !fresh.contains_key(*id))
                .map(|(id, _)| id.clone())
                .collect();
            for id in missing {
                if self.delete_ttl.is_zero() {
                    if let Some(tracked) = state.discovered.remove(&id) {
                        state.remove(&tracked.item);
                        self.drop_label(&tracked.item);
                        stats.removed += 1;
                    }
                    continue;
                }
                let Some(tracked) = state.discovered.get_mut(&id) else {
                    continue;
                };
                if tracked.lost_since.is_none() {
                    tracked.lost_since = Some(now);
                    stats.lost += 1;
                    tracing::info!(item = %id, "Discovered item lost");
                }
                if !tracked.disabled && self.disable_ttl.is_zero() {
                    tracked.disabled = true;
                    let item = tracked.item.clone();
                    state.remove(&item);
                    tracing::info!(item = %id, "Lost item disabled");
                }
            }

            for (id, item) in fresh {
                let first_run = if run_now {
                    timing::jittered(now + item.delay, item.delay)
                } else {
                    timing::jittered(now, item.delay)
                };

                let previous = match state.discovered.get_mut(&id) {
                    Some(tracked) => {
                        if tracked.lost_since.take().is_some() {
                            tracing::info!(item = %id, "Discovered item recovered");
                        }
                        let was_disabled = std::mem::replace(&mut tracked.disabled, false);
                        let old = std::mem::replace(&mut tracked.item, item.clone());
                        Some((old, was_disabled))
                    }
                    None => {
                        state.discovered.insert(
                            id.clone(),
                            Tracked {
                                item: item.clone(),
                                lost_since: None,
                                disabled: false,
                            },
                        );
                        None
                    }
                };

                if let Some((old, _)) = &previous {
                    if old.is_label_provider() && old.label_key != item.label_key {
                        self.drop_label(old);
                    }
                }

                match previous {
                    None => {
                        state.insert(item.clone(), first_run);
                        stats.added += 1;
                        if run_now {
                            immediate.push(item);
                        }
                    }
                    Some((_, true)) => {
                        state.insert(item.clone(), first_run);
                        stats.moved += 1;
                        if run_now {
                            immediate.push(item);
                        }
                    }
                    Some((old, false)) if old.delay != item.delay => {
                        state.remove(&old);
                        state.insert(item.clone(), first_run);
                        stats.moved += 1;
                        if run_now {
                            immediate.push(item);
                        }
                    }
                    Some((old, false)) => {
                        let key = (item.agent.clone(), item.delay);
                        match state.groups.get_mut(&key).and_then(|g| g.items.get_mut(&id)) {
                            Some(slot) => {
                                if old.oid != item.oid {
                                    slot.next_run = timing::jittered(now, item.delay);
                                }
                                slot.item = item;
                            }
                            None => state.insert(item, timing::jittered(now, old.delay)),
                        }
                        stats.updated += 1;
                    }
                }
            }

            self.untimed(&mut state)
        };

        tracing::info!(
            rule = rule_key,
            added = stats.added,
            updated = stats.updated,
            moved = stats.moved,
            removed = stats.removed,
            lost = stats.lost,
            "Reconciled discovered items"
        );

        self.spawn_timers(cadences);
        if !immediate.is_empty() {
            let collector = self.collector.clone();
            let poll = tokio::spawn(async move { collector.collect_items(&immediate).await });
            let rule = rule_key.to_string();
            tokio::spawn(async move {
                match poll.await {
                    Ok(stats) => tracing::debug!(
                        rule = %rule,
                        polled = stats.polled,
                        errors = stats.errors,
                        "Immediate collection finished"
                    ),
                    Err(e) => tracing::error!(rule = %rule, error = %e, "Immediate collection task panicked"),
                }
            });
        }
        stats
    }

    fn drop_label(&self, item: &MonitorItem) {
        if let (Some(origin), Some(label)) = (item.discovery.as_ref(), item.label_key.as_deref()) {
            self.labels.delete_label(&item.agent, &origin.rule_key, &origin.index, label);
        }
    }

    fn untimed(&self, state: &mut State) -> Vec<Duration> {
        if self.running.load(Ordering::SeqCst) {
            state.untimed_cadences()
        } else {
            Vec::new()
        }
    }

    /// Apply the lost-item TTLs.
    pub fn maintain(&self, now: Instant) {
        let mut state = self.state.write();
        let lost: Vec<(String, Duration, bool)> = state
            .discovered
            .iter()
            .filter_map(|(id, t)| {
                t.lost_since
                    .map(|since| (id.clone(), now.saturating_duration_since(since), t.disabled))
            })
            .collect();

        for (id, elapsed, disabled) in lost {
            if !self.delete_ttl.is_zero() && elapsed > self.delete_ttl {
                if let Some(tracked) = state.discovered.remove(&id) {
                    state.remove(&tracked.item);
                    self.drop_label(&tracked.item);
                    tracing::info!(item = %id, "Lost item deleted");
                }
                continue;
            }
            if !disabled && !self.disable_ttl.is_zero() && elapsed > self.disable_ttl {
                let item = match state.discovered.get_mut(&id) {
                    Some(tracked) => {
                        tracked.disabled = true;
                        tracked.item.clone()
                    }
                    None => continue,
                };
                state.remove(&item);
                tracing::info!(item = %id, "Lost item disabled");
            }
        }
    }

    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let cadences = self.state.write().untimed_cadences();
        tracing::info!(cadences = cadences.len(), "Item scheduler started");
        self.spawn_timers(cadences);

        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + MAINTENANCE_INTERVAL, MAINTENANCE_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = scheduler.cancel.cancelled() => return,
                    _ = ticker.tick() => scheduler.maintain(Instant::now()),
                }
            }
        });
    }

    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            self.cancel.cancel();
            tracing::info!("Item scheduler stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn spawn_timers(self: &Arc<Self>, cadences: Vec<Duration>) {
        for cadence in cadences {
            let scheduler = self.clone();
            tokio::spawn(scheduler.run_cadence(cadence));
        }
    }

    async fn run_cadence(self: Arc<Self>, cadence: Duration) {
        tracing::debug!(cadence = ?cadence, "Starting item timer");
        let mut ticker = tokio::time::interval(cadence);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                tick = ticker.tick() => {
                    {
                        let mut state = self.state.write();
                        if !state.has_cadence(cadence) {
                            state.timers.remove(&cadence);
                            tracing::debug!(cadence = ?cadence, "No items left for cadence, stopping timer");
                            return;
                        }
                    }
                    let due = self.claim_due(Some(cadence), tick.into_std());
                    if !due.is_empty() {
                        let scheduler = self.clone();
                        tokio::spawn(async move {
                            scheduler.dispatch(due).await;
                        });
                    }
                }
            }
        }
    }

    /// Take the due items of every group of `cadence`, or every item when
    /// `cadence` is `None`, advancing their next run by one cadence plus
    /// jitter.
    fn claim_due(&self, cadence: Option<Duration>, now: Instant) -> Vec<Arc<MonitorItem>> {
        let mut state = self.state.write();
        let mut due = Vec::new();
        for ((_, group_cadence), group) in state.groups.iter_mut() {
            let group_cadence = *group_cadence;
            let horizon = match cadence {
                Some(c) if c != group_cadence => continue,
                Some(c) => Some(now + timing::jitter_magnitude(c)),
                None => None,
            };
            for slot in group.items.values_mut() {
                if horizon.is_some_and(|h| slot.next_run > h) {
                    continue;
                }
                slot.next_run = timing::jittered(now + group_cadence, group_cadence);
                due.push(slot.item.clone());
            }
        }
        due
    }

    /// One collector call per agent, each in its own task; a panicking poll
    /// is logged and does not affect the others.
    async fn dispatch(&self, due: Vec<Arc<MonitorItem>>) -> CollectStats {
        let mut by_agent: BTreeMap<String, Vec<Arc<MonitorItem>>> = BTreeMap::new();
        for item in due {
            by_agent.entry(item.agent.clone()).or_default().push(item);
        }

        let (agents, handles): (Vec<String>, Vec<_>) = by_agent
            .into_iter()
            .map(|(agent, items)| {
                let collector = self.collector.clone();
                let task_agent = agent.clone();
                let handle = tokio::spawn(async move { collector.collect_agent(&task_agent, &items).await });
                (agent, handle)
            })
            .unzip();

        let mut stats = CollectStats::default();
        for (agent, result) in agents.iter().zip(join_all(handles).await) {
            match result {
                Ok(s) => stats.merge(s),
                Err(e) => tracing::error!(agent = %agent, error = %e, "Collection task panicked"),
            }
        }
        stats
    }

    /// Poll every scheduled item now and wait for the results.
    pub async fn poll_now(&self) -> CollectStats {
        let due = self.claim_due(None, Instant::now());
        self.dispatch(due).await
    }

    /// `snmp_zabbix_item_discovery_state` and
    /// `snmp_zabbix_item_remaining_seconds` for every discovered item.
    pub fn internal_samples(&self) -> Vec<Sample> {
        let now = Instant::now();
        let state = self.state.read();
        let mut samples = Vec::new();
        for tracked in state.discovered.values() {
            let item = &tracked.item;
            let mut tags = Tags::new();
            tags.insert("agent".into(), item.agent.clone());
            tags.insert("item_key".into(), item.key.clone());
            tags.insert("discovery_rule".into(), item.rule_key().unwrap_or_default().to_string());
            tags.insert("oid".into(), item.oid.clone());
            tags.insert("plugin".into(), PLUGIN.into());

            samples.push(Sample::new(
                "snmp_zabbix_item_discovery_state",
                SampleValue::Int(i64::from(tracked.state())),
                tags.clone(),
            ));

            let Some(since) = tracked.lost_since else {
                continue;
            };
            let elapsed = now.saturating_duration_since(since);
            let mut remaining = |action: &str, ttl: Duration| {
                let mut t = tags.clone();
                t.insert("action".into(), action.into());
                samples.push(Sample::new(
                    "snmp_zabbix_item_remaining_seconds",
                    SampleValue::Float(ttl.saturating_sub(elapsed).as_secs_f64()),
                    t,
                ));
            };
            if !tracked.disabled && !self.disable_ttl.is_zero() {
                remaining("disable", self.disable_ttl);
            }
            if !self.delete_ttl.is_zero() {
                remaining("delete", self.delete_ttl);
            }
        }
        samples
    }

    pub fn stats(&self) -> SchedulerStats {
        let state = self.state.read();
        let mut cadences: Vec<Duration> = state.groups.keys().map(|(_, d)| *d).collect();
        cadences.sort();
        cadences.dedup();
        SchedulerStats {
            running: self.is_running(),
            groups: state.groups.len(),
            items: state.groups.values().map(|g| g.items.len()).sum(),
            discovered: state.discovered.len(),
            lost: state.discovered.values().filter(|t| t.lost_since.is_some()).count(),
            disabled: state.discovered.values().filter(|t| t.disabled).count(),
            cadences: cadences
                .into_iter()
                .map(|d| humantime::format_duration(d).to_string())
                .collect(),
        }
    }

    /// Scheduled item ids of one group, sorted.
    pub fn group_items(&self, agent: &str, cadence: Duration) -> Vec<String> {
        self.state
            .read()
            .groups
            .get(&(agent.to_string(), cadence))
            .map(|g| g.items.keys().cloned().collect())
            .unwrap_or_default()
    }

    #[cfg(test)]
    fn next_run(&self, agent: &str, cadence: Duration, id: &str) -> Option<Instant> {
        self.state
            .read()
            .groups
            .get(&(agent.to_string(), cadence))
            .and_then(|g| g.items.get(id))
            .map(|s| s.next_run)
    }
}
