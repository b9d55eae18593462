//! Periodic execution of discovery rules.
//!
//! Rules sharing a cadence share one timer. Every tick dispatches the ready
//! rules of that cadence as independent tasks and waits for them with a
//! bounded timeout; late tasks keep running in the background.

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::{is_quiet, DiscoveryEngine};
use crate::config::PreprocessPolicy;
use crate::item::MonitorItem;
use crate::preprocess;
use crate::template::{DiscoveryRule, LoadedTemplate};
use crate::timing::{self, parse_delay, DEFAULT_DISCOVERY_DELAY};

const DISPATCH_TIMEOUT: Duration = Duration::from_secs(300);

/// Receives the expanded items of every successful rule execution.
pub type DiscoveryCallback = Arc<dyn Fn(&str, &DiscoveryRule, Vec<MonitorItem>) + Send + Sync>;

/// Execution statistics of one `(agent, rule)` pair.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RuleStats {
    pub run_count: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub last_run: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    #[serde(with = "humantime_serde")]
    pub last_duration: Option<Duration>,
    pub last_item_count: usize,
}

/// Scheduler-wide view.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub running: bool,
    pub rules: usize,
    /// Rule count per cadence, keyed by the humanized cadence.
    pub cadences: BTreeMap<String, usize>,
    pub total_runs: u64,
    pub total_errors: u64,
}

struct ScheduledRule {
    agent: String,
    rule: Arc<DiscoveryRule>,
    cadence: Duration,
    next_run: Instant,
    stats: RuleStats,
}

#[derive(Default)]
struct State {
    rules: HashMap<String, ScheduledRule>,
    by_cadence: BTreeMap<Duration, BTreeSet<String>>,
    timers: HashSet<Duration>,
}

pub struct DiscoveryScheduler {
    engine: Arc<DiscoveryEngine>,
    state: Mutex<State>,
    callback: RwLock<Option<DiscoveryCallback>>,
    running: AtomicBool,
    cancel: CancellationToken,
    dispatch_timeout: Duration,
}

fn rule_id(agent: &str, rule_key: &str) -> String {
    format!("{}|{}", agent, rule_key)
}

impl DiscoveryScheduler {
    pub fn new(engine: Arc<DiscoveryEngine>) -> Arc<Self> {
        Self::with_cancel(engine, CancellationToken::new())
    }

    /// Build a scheduler whose timers stop with `cancel`.
    pub fn with_cancel(engine: Arc<DiscoveryEngine>, cancel: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            engine,
            state: Mutex::new(State::default()),
            callback: RwLock::new(None),
            running: AtomicBool::new(false),
            cancel,
            dispatch_timeout: DISPATCH_TIMEOUT,
        })
    }

    pub fn set_callback(&self, callback: DiscoveryCallback) {
        *self.callback.write() = Some(callback);
    }

    pub fn engine(&self) -> &Arc<DiscoveryEngine> {
        &self.engine
    }

    /// Schedule `rule` for `agent`. Re-adding a known rule replaces its
    /// definition and cadence but keeps its statistics and next run.
    pub fn add_rule(self: &Arc<Self>, agent: &str, rule: DiscoveryRule) {
        let delay = self.engine.template().expand_macros(&rule.delay, None);
        let cadence = parse_delay(&delay, DEFAULT_DISCOVERY_DELAY);
        let id = rule_id(agent, &rule.key);

        let start_timer = {
            let mut state = self.state.lock();
            let (stats, next_run) = match state.rules.remove(&id) {
                Some(previous) => {
                    if let Some(ids) = state.by_cadence.get_mut(&previous.cadence) {
                        ids.remove(&id);
                        if ids.is_empty() {
                            state.by_cadence.remove(&previous.cadence);
                        }
                    }
                    (previous.stats, previous.next_run)
                }
                None => (RuleStats::default(), Instant::now()),
            };

            tracing::debug!(agent, rule = %rule.key, cadence = ?cadence, "Discovery rule scheduled");
            state.by_cadence.entry(cadence).or_default().insert(id.clone());
            state.rules.insert(
                id,
                ScheduledRule {
                    agent: agent.to_string(),
                    rule: Arc::new(rule),
                    cadence,
                    next_run,
                    stats,
                },
            );

            self.running.load(Ordering::SeqCst) && state.timers.insert(cadence)
        };

        if start_timer {
            self.spawn_timer(cadence);
        }
    }

    /// Schedule every enabled SNMP rule of `template` for every agent.
    /// Rules whose preprocessing is refused by `policy` are skipped.
    pub fn load_from_template(self: &Arc<Self>, agents: &[String], template: &LoadedTemplate, policy: PreprocessPolicy) -> usize {
        let mut loaded = 0;
        for rule in template.snmp_rules() {
            if !rule.is_enabled() {
                tracing::debug!(rule = %rule.key, "Skipping disabled discovery rule");
                continue;
            }
            if let Err(e) = preprocess::compile_steps(&rule.preprocessing, policy) {
                tracing::warn!(rule = %rule.key, error = %e, "Skipping discovery rule");
                continue;
            }
            for agent in agents {
                self.add_rule(agent, rule.clone());
                loaded += 1;
            }
        }
        tracing::info!(rules = loaded, agents = agents.len(), "Loaded discovery rules");
        loaded
    }

    pub fn remove_rule(&self, agent: &str, rule_key: &str) -> bool {
        let id = rule_id(agent, rule_key);
        let mut state = self.state.lock();
        let Some(removed) = state.rules.remove(&id) else {
            return false;
        };
        if let Some(ids) = state.by_cadence.get_mut(&removed.cadence) {
            ids.remove(&id);
            if ids.is_empty() {
                state.by_cadence.remove(&removed.cadence);
            }
        }
        true
    }

    /// Start one timer per cadence. Each timer runs its rules immediately.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let cadences: Vec<Duration> = {
            let mut state = self.state.lock();
            let cadences: Vec<Duration> = state.by_cadence.keys().copied().collect();
            state.timers.extend(cadences.iter().copied());
            cadences
        };
        tracing::info!(cadences = cadences.len(), "Discovery scheduler started");
        for cadence in cadences {
            self.spawn_timer(cadence);
        }
    }

    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            self.cancel.cancel();
            tracing::info!("Discovery scheduler stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn spawn_timer(self: &Arc<Self>, cadence: Duration) {
        let scheduler = self.clone();
        tokio::spawn(scheduler.run_cadence(cadence));
    }

    async fn run_cadence(self: Arc<Self>, cadence: Duration) {
        self.dispatch_ready(cadence, Instant::now()).await;

        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + cadence, cadence);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                tick = ticker.tick() => {
                    {
                        let mut state = self.state.lock();
                        if !state.by_cadence.contains_key(&cadence) {
                            state.timers.remove(&cadence);
                            tracing::debug!(cadence = ?cadence, "No rules left for cadence, stopping timer");
                            return;
                        }
                    }
                    // Claim against the scheduled deadline so a late wakeup
                    // cannot push a rule past its own next tick.
                    self.dispatch_ready(cadence, tick.into_std()).await;
                }
            }
        }
    }

    /// Claim the rules of `cadence` that are due at `now`, pushing their next
    /// run one cadence (plus jitter) ahead before anything executes.
    fn claim_ready(&self, cadence: Duration, now: Instant) -> Vec<(String, String, Arc<DiscoveryRule>)> {
        let mut state = self.state.lock();
        let State { rules, by_cadence, .. } = &mut *state;
        let Some(ids) = by_cadence.get(&cadence) else {
            return Vec::new();
        };
        let horizon = now + timing::jitter_magnitude(cadence);
        ids.iter()
            .filter_map(|id| {
                let scheduled = rules.get_mut(id)?;
                if scheduled.next_run > horizon {
                    return None;
                }
                scheduled.next_run = timing::jittered(now + scheduled.cadence, scheduled.cadence);
                Some((id.clone(), scheduled.agent.clone(), scheduled.rule.clone()))
            })
            .collect()
    }

    async fn dispatch_ready(self: &Arc<Self>, cadence: Duration, now: Instant) -> usize {
        let ready = self.claim_ready(cadence, now);
        self.dispatch(ready).await
    }

    async fn dispatch(self: &Arc<Self>, ready: Vec<(String, String, Arc<DiscoveryRule>)>) -> usize {
        if ready.is_empty() {
            return 0;
        }
        let count = ready.len();
        let mut ids = Vec::with_capacity(count);
        let mut handles = Vec::with_capacity(count);
        for (id, agent, rule) in ready {
            let scheduler = self.clone();
            ids.push(id.clone());
            handles.push(tokio::spawn(async move {
                scheduler.execute(&id, &agent, &rule).await;
            }));
        }

        match tokio::time::timeout(self.dispatch_timeout, join_all(handles)).await {
            Ok(results) => {
                for (id, result) in ids.iter().zip(results) {
                    if let Err(e) = result {
                        tracing::error!(rule = %id, error = %e, "Discovery task panicked");
                    }
                }
            }
            Err(_) => tracing::warn!(
                rules = count,
                timeout = ?self.dispatch_timeout,
                "Discovery executions still running after timeout, continuing"
            ),
        }
        count
    }

    async fn execute(&self, id: &str, agent: &str, rule: &DiscoveryRule) {
        let started = Instant::now();
        let started_at = Utc::now();
        // A claimed run always walks; the cache only serves callers between runs.
        self.engine.invalidate(agent, &rule.key);
        let result = self.engine.execute(agent, rule).await;
        let elapsed = started.elapsed();

        let items = match result {
            Ok(rows) => {
                let items = self.engine.apply_item_prototypes(agent, &rows, rule);
                tracing::debug!(
                    agent,
                    rule = %rule.key,
                    rows = rows.len(),
                    items = items.len(),
                    elapsed = ?elapsed,
                    "Discovery rule executed"
                );
                self.record(id, started_at, elapsed, Ok(items.len()));
                items
            }
            Err(e) if is_quiet(&e) => {
                tracing::debug!(agent, rule = %rule.key, reason = %e, "Discovery produced nothing new");
                self.record(id, started_at, elapsed, Ok(0));
                return;
            }
            Err(e) => {
                tracing::warn!(agent, rule = %rule.key, error = %e, "Discovery rule failed");
                self.record(id, started_at, elapsed, Err(e.to_string()));
                return;
            }
        };

        let callback = self.callback.read().clone();
        if let Some(callback) = callback {
            callback(agent, rule, items);
        }
    }

    fn record(&self, id: &str, at: DateTime<Utc>, elapsed: Duration, outcome: Result<usize, String>) {
        let mut state = self.state.lock();
        let Some(scheduled) = state.rules.get_mut(id) else {
            return;
        };
        let stats = &mut scheduled.stats;
        stats.run_count += 1;
        stats.last_run = Some(at);
        stats.last_duration = Some(elapsed);
        match outcome {
            Ok(count) => {
                stats.success_count += 1;
                stats.last_item_count = count;
                stats.last_error = None;
            }
            Err(e) => {
                stats.error_count += 1;
                stats.last_error = Some(e);
            }
        }
    }

    /// Run every rule now, whatever its schedule, and wait for the results.
    pub async fn run_all_now(self: &Arc<Self>) -> usize {
        let now = Instant::now();
        let ready: Vec<_> = {
            let mut state = self.state.lock();
            let mut ready: Vec<_> = state
                .rules
                .iter_mut()
                .map(|(id, scheduled)| {
                    scheduled.next_run = timing::jittered(now + scheduled.cadence, scheduled.cadence);
                    (id.clone(), scheduled.agent.clone(), scheduled.rule.clone())
                })
                .collect();
            ready.sort_by(|a, b| a.0.cmp(&b.0));
            ready
        };
        self.dispatch(ready).await
    }

    pub fn rule_stats(&self, agent: &str, rule_key: &str) -> Option<RuleStats> {
        self.state
            .lock()
            .rules
            .get(&rule_id(agent, rule_key))
            .map(|r| r.stats.clone())
    }

    pub fn stats(&self) -> SchedulerStats {
        let state = self.state.lock();
        let cadences = state
            .by_cadence
            .iter()
            .map(|(cadence, ids)| (humantime::format_duration(*cadence).to_string(), ids.len()))
            .collect();
        SchedulerStats {
            running: self.is_running(),
            rules: state.rules.len(),
            cadences,
            total_runs: state.rules.values().map(|r| r.stats.run_count).sum(),
            total_errors: state.rules.values().map(|r| r.stats.error_count).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::tests::{engine, interface_session, AGENT};
    use crate::template::PreprocessStepDef;
    use pretty_assertions::assert_eq;

    type Seen = Arc<Mutex<Vec<(String, String, usize)>>>;

    fn recording(scheduler: &DiscoveryScheduler) -> Seen {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        scheduler.set_callback(Arc::new(move |agent: &str, rule: &DiscoveryRule, items: Vec<MonitorItem>| {
            sink.lock().push((agent.to_string(), rule.key.clone(), items.len()));
        }));
        seen
    }

    fn scheduler() -> Arc<DiscoveryScheduler> {
        DiscoveryScheduler::new(Arc::new(engine(interface_session())))
    }

    #[tokio::test]
    async fn runs_rules_and_reports_items() {
        let scheduler = scheduler();
        let seen = recording(&scheduler);
        let template = scheduler.engine().template().clone();
        assert_eq!(scheduler.load_from_template(&[AGENT.to_string()], &template, PreprocessPolicy::Reject), 1);

        assert_eq!(scheduler.run_all_now().await, 1);
        assert_eq!(
            seen.lock().clone(),
            vec![(AGENT.to_string(), "net.if.discovery".to_string(), 4)]
        );

        let stats = scheduler.rule_stats(AGENT, "net.if.discovery").unwrap();
        assert_eq!(stats.run_count, 1);
        assert_eq!(stats.success_count, 1);
        assert_eq!(stats.last_item_count, 4);
        assert!(stats.last_run.is_some());

        let overall = scheduler.stats();
        assert_eq!(overall.rules, 1);
        assert_eq!(overall.cadences.get("1h"), Some(&1));
    }

    #[tokio::test]
    async fn failures_are_counted_without_callback() {
        let session = interface_session();
        let scheduler = DiscoveryScheduler::new(Arc::new(engine(session.clone())));
        let seen = recording(&scheduler);
        let mut rule = scheduler.engine().template().discovery_rules[0].clone();
        rule.snmp_oid = "not-an-oid".into();
        scheduler.add_rule(AGENT, rule);

        scheduler.run_all_now().await;
        assert!(seen.lock().is_empty());
        let stats = scheduler.rule_stats(AGENT, "net.if.discovery").unwrap();
        assert_eq!(stats.error_count, 1);
        assert!(stats.last_error.unwrap().contains("invalid OID"));
    }

    #[tokio::test]
    async fn re_adding_keeps_stats() {
        let scheduler = scheduler();
        let rule = scheduler.engine().template().discovery_rules[0].clone();
        scheduler.add_rule(AGENT, rule.clone());
        scheduler.run_all_now().await;

        let mut faster = rule;
        faster.delay = "10m".into();
        scheduler.add_rule(AGENT, faster);

        let stats = scheduler.stats();
        assert_eq!(stats.rules, 1);
        assert_eq!(stats.cadences.keys().collect::<Vec<_>>(), vec!["10m"]);
        assert_eq!(scheduler.rule_stats(AGENT, "net.if.discovery").unwrap().run_count, 1);

        assert!(scheduler.remove_rule(AGENT, "net.if.discovery"));
        assert_eq!(scheduler.stats().rules, 0);
    }

    #[tokio::test]
    async fn rejected_rules_are_not_loaded() {
        let scheduler = scheduler();
        let mut template = (**scheduler.engine().template()).clone();
        template.discovery_rules[0].preprocessing = vec![PreprocessStepDef {
            kind: "NOT_A_STEP".into(),
            ..Default::default()
        }];
        let agents = [AGENT.to_string()];
        assert_eq!(scheduler.load_from_template(&agents, &template, PreprocessPolicy::Reject), 0);
        assert_eq!(scheduler.load_from_template(&agents, &template, PreprocessPolicy::Warn), 1);
    }

    #[tokio::test]
    async fn claimed_rules_are_not_ready_again() {
        let scheduler = scheduler();
        let rule = scheduler.engine().template().discovery_rules[0].clone();
        scheduler.add_rule(AGENT, rule);
        let now = Instant::now();
        let cadence = DEFAULT_DISCOVERY_DELAY;
        assert_eq!(scheduler.claim_ready(cadence, now).len(), 1);
        assert!(scheduler.claim_ready(cadence, now).is_empty());
        assert_eq!(scheduler.claim_ready(cadence, now + cadence + Duration::from_secs(60)).len(), 1);
    }

    #[tokio::test]
    async fn timer_runs_immediately_and_stops() {
        let scheduler = scheduler();
        let seen = recording(&scheduler);
        let template = scheduler.engine().template().clone();
        scheduler.load_from_template(&[AGENT.to_string()], &template, PreprocessPolicy::Reject);
        scheduler.start();
        assert!(scheduler.is_running());

        let deadline = Instant::now() + Duration::from_secs(5);
        while seen.lock().is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(seen.lock().len(), 1);

        scheduler.stop();
        scheduler.stop();
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn every_tick_walks_the_agent_again() {
        let session = interface_session();
        let scheduler = DiscoveryScheduler::new(Arc::new(engine(session.clone())));
        let seen = recording(&scheduler);
        let mut rule = scheduler.engine().template().discovery_rules[0].clone();
        rule.delay = "200ms".into();
        scheduler.add_rule(AGENT, rule);
        scheduler.start();

        // the immediate run plus at least three timer ticks
        let deadline = Instant::now() + Duration::from_secs(10);
        while seen.lock().len() < 4 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        scheduler.stop();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let stats = scheduler.rule_stats(AGENT, "net.if.discovery").unwrap();
        assert!(stats.run_count >= 4, "only {} runs", stats.run_count);
        assert_eq!(stats.error_count, 0);
        assert_eq!(seen.lock().len() as u64, stats.run_count);
        // the dependent rule walks two columns per enumeration
        assert_eq!(
            session.walk_calls.load(Ordering::SeqCst) as u64,
            2 * stats.run_count
        );
    }

    #[tokio::test]
    async fn scheduled_runs_bypass_cached_rows() {
        let session = interface_session();
        let scheduler = DiscoveryScheduler::new(Arc::new(engine(session.clone())));
        let rule = scheduler.engine().template().discovery_rules[0].clone();
        scheduler.add_rule(AGENT, rule.clone());

        // rows cached for the whole hour
        scheduler.engine().execute(AGENT, &rule).await.unwrap();
        assert_eq!(session.walk_calls.load(Ordering::SeqCst), 2);

        assert_eq!(scheduler.run_all_now().await, 1);
        assert_eq!(session.walk_calls.load(Ordering::SeqCst), 4);
        assert_eq!(scheduler.rule_stats(AGENT, "net.if.discovery").unwrap().last_item_count, 4);
    }
}
