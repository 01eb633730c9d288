// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-view refresh coordination.
//!
//! A [`RefreshCoordinator`] owns the [`RefreshState`] of one consuming view. A
//! refresh reads the active endpoint and its generation from the registry,
//! runs the view's query against it through a [`SingleFlight`], and commits
//! the result only if the registry still reports the same generation. Results
//! produced against an endpoint that stopped being active are discarded.
//!
//! State changes are published on a `watch` channel so views can react to
//! them without polling the coordinator. The commit itself only touches the
//! coordinator's own state under the registry lock; publication happens after
//! the lock is released.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::client::RemoteClient;
use crate::errors::Error;
use crate::registry::ConnectionRegistry;
use crate::single_flight::{RefreshStatus, SingleFlight};

/// Stale results re-run against the new endpoint at most this many times per refresh.
const MAX_STALE_RETRIGGERS: usize = 3;

/// The remote work a view needs to render itself.
#[async_trait]
pub trait ViewQuery: Send + Sync + 'static {
    type Output: Clone + Send + Sync + 'static;

    /// Short label used in logs.
    fn name(&self) -> &str;

    async fn run(&self, client: Arc<dyn RemoteClient>) -> Result<Self::Output, Error>;
}

/// What a view renders from: the last good result plus the latest attempt's status.
///
/// Snapshots reach subscribers through a `watch` channel. A borrow of that
/// channel blocks the next publication, so copy the state out rather than
/// holding a `watch::Ref` across other work.
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshState<T> {
    pub status: RefreshStatus,
    pub last_error: Option<Error>,
    /// Survives failures; only replaced by a newer committed success.
    pub last_successful_result: Option<T>,
    /// Registry generation that produced `last_successful_result`.
    pub result_generation: Option<u64>,
}

impl<T> Default for RefreshState<T> {
    fn default() -> Self {
        Self {
            status: RefreshStatus::Idle,
            last_error: None,
            last_successful_result: None,
            result_generation: None,
        }
    }
}

/// How a single pass against one endpoint ended.
enum Attempt<T> {
    Committed { value: T, generation: u64 },
    Failed(Error),
    /// The endpoint stopped being active before the pass finished.
    Stale {
        produced: u64,
        current: u64,
        error: Option<Error>,
    },
}

/// Result of one refresh as seen by every caller that joined it.
#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome<T> {
    /// The result was committed into the view's state.
    Committed { value: T, generation: u64 },
    /// The active endpoint changed while the query ran; the result was dropped.
    Stale { produced: u64, current: u64 },
}

impl<T> RefreshOutcome<T> {
    pub fn committed(self) -> Option<T> {
        match self {
            Self::Committed { value, .. } => Some(value),
            Self::Stale { .. } => None,
        }
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, Self::Stale { .. })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CoordinatorConfig {
    /// Re-run a refresh whose result went stale against the newly active endpoint.
    pub retrigger_on_stale: bool,
}

struct CoordinatorInner<Q: ViewQuery> {
    registry: ConnectionRegistry,
    query: Q,
    config: CoordinatorConfig,
    flight: SingleFlight<RefreshOutcome<Q::Output>>,
    current: Mutex<RefreshState<Q::Output>>,
    state: watch::Sender<RefreshState<Q::Output>>,
}

pub struct RefreshCoordinator<Q: ViewQuery> {
    inner: Arc<CoordinatorInner<Q>>,
}

impl<Q: ViewQuery> Clone for RefreshCoordinator<Q> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<Q: ViewQuery> std::fmt::Debug for RefreshCoordinator<Q> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshCoordinator")
            .field("view", &self.inner.query.name())
            .field("config", &self.inner.config)
            .field("flight", &self.inner.flight)
            .finish()
    }
}

impl<Q: ViewQuery> RefreshCoordinator<Q> {
    pub fn new(registry: ConnectionRegistry, query: Q) -> Self {
        Self::with_config(registry, query, CoordinatorConfig::default())
    }

    pub fn with_config(registry: ConnectionRegistry, query: Q, config: CoordinatorConfig) -> Self {
        let (state, _) = watch::channel(RefreshState::default());
        Self {
            inner: Arc::new(CoordinatorInner {
                registry,
                query,
                config,
                flight: SingleFlight::new(),
                current: Mutex::new(RefreshState::default()),
                state,
            }),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.inner.registry
    }

    pub fn query(&self) -> &Q {
        &self.inner.query
    }

    /// Current state snapshot.
    pub fn state(&self) -> RefreshState<Q::Output> {
        self.inner.lock().clone()
    }

    /// Receiver notified on every state change.
    ///
    /// Each change is published once the registry lock is released, so a
    /// subscriber may switch endpoints from its change handler.
    pub fn subscribe(&self) -> watch::Receiver<RefreshState<Q::Output>> {
        self.inner.state.subscribe()
    }

    /// Refreshes the view, or joins the refresh already in progress.
    ///
    /// All overlapping callers receive the same outcome, and at most one
    /// sequence of remote calls is issued for them.
    pub async fn refresh(&self) -> Result<RefreshOutcome<Q::Output>, Error> {
        let inner = Arc::clone(&self.inner);
        self.inner
            .flight
            .trigger(move || async move { inner.run().await })
            .await
    }
}

impl<Q: ViewQuery> CoordinatorInner<Q> {
    async fn run(&self) -> Result<RefreshOutcome<Q::Output>, Error> {
        let mut retriggers = 0;
        loop {
            match self.attempt().await {
                Attempt::Committed { value, generation } => {
                    return Ok(RefreshOutcome::Committed { value, generation })
                }
                Attempt::Failed(err) => return Err(err),
                Attempt::Stale {
                    produced,
                    current,
                    error,
                } => {
                    if self.config.retrigger_on_stale && retriggers < MAX_STALE_RETRIGGERS {
                        retriggers += 1;
                        debug!(view = self.query.name(), retriggers, "re-running stale refresh against new endpoint");
                        continue;
                    }
                    return match error {
                        Some(err) => Err(err),
                        None => Ok(RefreshOutcome::Stale { produced, current }),
                    };
                }
            }
        }
    }

    async fn attempt(&self) -> Attempt<Q::Output> {
        let active = match self.registry.active() {
            Ok(active) => active,
            Err(err) => {
                self.set(|state| {
                    state.status = RefreshStatus::Failed;
                    state.last_error = Some(err.clone());
                });
                return Attempt::Failed(err);
            }
        };
        let generation = active.generation;
        self.set(|state| state.status = RefreshStatus::Refreshing);
        debug!(
            view = self.query.name(),
            endpoint = %active.endpoint.id,
            generation,
            "refresh started"
        );

        let result = self.query.run(Arc::clone(&active.client)).await;
        let mut snapshot = None;
        let committed = self.registry.commit_if_current(generation, || {
            snapshot = Some(self.update(|state| match &result {
                Ok(value) => {
                    state.status = RefreshStatus::Idle;
                    state.last_error = None;
                    state.last_successful_result = Some(value.clone());
                    state.result_generation = Some(generation);
                }
                Err(err) => {
                    state.status = RefreshStatus::Failed;
                    state.last_error = Some(err.clone());
                }
            }));
        });
        if let Some(snapshot) = snapshot {
            self.state.send_replace(snapshot);
        }

        match (committed, result) {
            (true, Ok(value)) => {
                debug!(view = self.query.name(), generation, "refresh committed");
                Attempt::Committed { value, generation }
            }
            (true, Err(err)) => {
                warn!(
                    view = self.query.name(),
                    endpoint = %active.endpoint.id,
                    "refresh failed: {err}"
                );
                Attempt::Failed(err)
            }
            (false, result) => Attempt::Stale {
                produced: generation,
                current: self.discard_stale(generation),
                error: result.err(),
            },
        }
    }

    /// Leaves committed data untouched and returns the generation now current.
    fn discard_stale(&self, produced: u64) -> u64 {
        let current = self.registry.generation();
        debug!(
            view = self.query.name(),
            produced, current, "discarding refresh for inactive endpoint"
        );
        let mut state = self.lock();
        if state.status == RefreshStatus::Refreshing {
            state.status = RefreshStatus::Idle;
            let snapshot = state.clone();
            drop(state);
            self.state.send_replace(snapshot);
        }
        current
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RefreshState<Q::Output>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies `change` and returns the snapshot to publish.
    fn update<F: FnOnce(&mut RefreshState<Q::Output>)>(&self, change: F) -> RefreshState<Q::Output> {
        let mut state = self.lock();
        change(&mut state);
        state.clone()
    }

    fn set<F: FnOnce(&mut RefreshState<Q::Output>)>(&self, change: F) {
        let snapshot = self.update(change);
        self.state.send_replace(snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Connector;
    use crate::model::{Endpoint, LogEntry, Rule, Summary, TimeSeries};
    use crate::rules::RuleCategory;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::Notify;
    use tracing_test::traced_test;

    /// Answers `fetch_summary` with the endpoint's id after the gate opens.
    struct GatedClient {
        id: String,
        gate: Arc<Notify>,
        fail: bool,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl RemoteClient for GatedClient {
        async fn fetch_summary(&self) -> Result<Summary, Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.gate.notified().await;
            if self.fail {
                return Err(Error::Connectivity(format!("{} unreachable", self.id)));
            }
            Ok(Summary {
                status: self.id.clone(),
                ..Summary::default()
            })
        }
        async fn fetch_time_series(&self) -> Result<TimeSeries, Error> {
            Ok(TimeSeries::default())
        }
        async fn fetch_logs(&self, _limit: usize) -> Result<Vec<LogEntry>, Error> {
            Ok(Vec::new())
        }
        async fn fetch_rules(&self, _category: RuleCategory) -> Result<Vec<Rule>, Error> {
            Ok(Vec::new())
        }
        async fn add_rule(&self, _domain: &str, _category: RuleCategory) -> Result<(), Error> {
            Ok(())
        }
        async fn remove_rule(&self, _domain: &str, _category: RuleCategory) -> Result<(), Error> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct GatedConnector {
        gates: Mutex<Vec<(String, Arc<Notify>)>>,
        failing: Mutex<Vec<String>>,
        calls: Arc<AtomicUsize>,
    }

    impl GatedConnector {
        fn gate(&self, id: &str) -> Arc<Notify> {
            let mut gates = self.gates.lock().expect("gates");
            if let Some((_, gate)) = gates.iter().find(|(gate_id, _)| gate_id == id) {
                return Arc::clone(gate);
            }
            let gate = Arc::new(Notify::new());
            gates.push((id.to_string(), Arc::clone(&gate)));
            gate
        }
    }

    impl Connector for GatedConnector {
        fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn RemoteClient>, Error> {
            let id = endpoint.id.to_string();
            Ok(Arc::new(GatedClient {
                gate: self.gate(&id),
                fail: self.failing.lock().expect("failing").contains(&id),
                calls: Arc::clone(&self.calls),
                id,
            }))
        }
    }

    struct SummaryQuery;

    #[async_trait]
    impl ViewQuery for SummaryQuery {
        type Output = String;

        fn name(&self) -> &str {
            "summary"
        }

        async fn run(&self, client: Arc<dyn RemoteClient>) -> Result<String, Error> {
            Ok(client.fetch_summary().await?.status)
        }
    }

    fn setup(failing: &[&str]) -> (Arc<GatedConnector>, ConnectionRegistry) {
        let connector = Arc::new(GatedConnector::default());
        connector
            .failing
            .lock()
            .expect("failing")
            .extend(failing.iter().map(|id| id.to_string()));
        let registry = ConnectionRegistry::new(Arc::clone(&connector) as Arc<dyn Connector>);
        for id in ["e1", "e2"] {
            registry
                .upsert(Endpoint::new(id, id, format!("http://{id}"), ""))
                .expect("upsert");
        }
        (connector, registry)
    }

    async fn wait_for_calls(connector: &GatedConnector, calls: usize) {
        while connector.calls.load(Ordering::SeqCst) < calls {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn success_commits_result_and_generation() {
        let (connector, registry) = setup(&[]);
        let coordinator = RefreshCoordinator::new(registry.clone(), SummaryQuery);
        connector.gate("e1").notify_one();

        let outcome = coordinator.refresh().await.expect("refresh");
        let generation = registry.generation();
        assert_eq!(
            outcome,
            RefreshOutcome::Committed {
                value: "e1".to_string(),
                generation
            }
        );
        let state = coordinator.state();
        assert_eq!(state.status, RefreshStatus::Idle);
        assert_eq!(state.last_successful_result.as_deref(), Some("e1"));
        assert_eq!(state.result_generation, Some(generation));
    }

    #[tokio::test]
    #[traced_test]
    async fn switch_mid_flight_discards_result() {
        let (connector, registry) = setup(&[]);
        let coordinator = RefreshCoordinator::new(registry.clone(), SummaryQuery);

        let pending = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.refresh().await })
        };
        wait_for_calls(&connector, 1).await;
        let current = registry.set_active(&"e2".into()).expect("switch");
        connector.gate("e1").notify_one();

        let outcome = pending.await.expect("join").expect("refresh");
        assert_eq!(
            outcome,
            RefreshOutcome::Stale {
                produced: current - 1,
                current
            }
        );
        let state = coordinator.state();
        assert_eq!(state.status, RefreshStatus::Idle);
        assert_eq!(state.last_successful_result, None);
        assert!(logs_contain("discarding refresh for inactive endpoint"));
    }

    #[tokio::test]
    async fn stale_result_retriggers_when_configured() {
        let (connector, registry) = setup(&[]);
        let coordinator = RefreshCoordinator::with_config(
            registry.clone(),
            SummaryQuery,
            CoordinatorConfig {
                retrigger_on_stale: true,
            },
        );

        let pending = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.refresh().await })
        };
        wait_for_calls(&connector, 1).await;
        registry.set_active(&"e2".into()).expect("switch");
        connector.gate("e2").notify_one();
        connector.gate("e1").notify_one();

        let outcome = pending.await.expect("join").expect("refresh");
        assert_eq!(outcome.committed().as_deref(), Some("e2"));
        assert_eq!(connector.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stale_failure_retriggers_when_configured() {
        let (connector, registry) = setup(&["e1"]);
        let coordinator = RefreshCoordinator::with_config(
            registry.clone(),
            SummaryQuery,
            CoordinatorConfig {
                retrigger_on_stale: true,
            },
        );

        let pending = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.refresh().await })
        };
        wait_for_calls(&connector, 1).await;
        let current = registry.set_active(&"e2".into()).expect("switch");
        connector.gate("e2").notify_one();
        connector.gate("e1").notify_one();

        let outcome = pending.await.expect("join").expect("refresh");
        assert_eq!(
            outcome,
            RefreshOutcome::Committed {
                value: "e2".to_string(),
                generation: current
            }
        );
        assert_eq!(connector.calls.load(Ordering::SeqCst), 2);
        let state = coordinator.state();
        assert_eq!(state.status, RefreshStatus::Idle);
        assert_eq!(state.last_error, None);
    }

    #[tokio::test]
    async fn failure_keeps_previous_result() {
        let (connector, registry) = setup(&["e2"]);
        let coordinator = RefreshCoordinator::new(registry.clone(), SummaryQuery);
        connector.gate("e1").notify_one();
        coordinator.refresh().await.expect("first refresh");

        registry.set_active(&"e2".into()).expect("switch");
        connector.gate("e2").notify_one();
        let err = coordinator.refresh().await.expect_err("e2 is down");
        assert_eq!(err, Error::Connectivity("e2 unreachable".into()));

        let state = coordinator.state();
        assert_eq!(state.status, RefreshStatus::Failed);
        assert_eq!(state.last_error, Some(err));
        assert_eq!(state.last_successful_result.as_deref(), Some("e1"));
    }

    #[tokio::test]
    async fn stale_failure_leaves_state_untouched() {
        let (connector, registry) = setup(&["e1"]);
        let coordinator = RefreshCoordinator::new(registry.clone(), SummaryQuery);

        let pending = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.refresh().await })
        };
        wait_for_calls(&connector, 1).await;
        registry.set_active(&"e2".into()).expect("switch");
        connector.gate("e1").notify_one();

        assert!(pending.await.expect("join").is_err());
        let state = coordinator.state();
        assert_eq!(state.status, RefreshStatus::Idle);
        assert_eq!(state.last_error, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn endpoint_switch_proceeds_while_subscriber_borrows_state() {
        let (connector, registry) = setup(&[]);
        let coordinator = RefreshCoordinator::new(registry.clone(), SummaryQuery);
        let states = coordinator.subscribe();

        let pending = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.refresh().await })
        };
        wait_for_calls(&connector, 1).await;

        let borrowed = states.borrow();
        connector.gate("e1").notify_one();
        // Let the refresh reach its commit and block on publishing.
        std::thread::sleep(std::time::Duration::from_millis(50));
        let current = registry.set_active(&"e2".into()).expect("switch");
        drop(borrowed);

        assert!(pending.await.expect("join").is_ok());
        assert_eq!(registry.generation(), current);
        assert_eq!(coordinator.state().status, RefreshStatus::Idle);
    }

    #[tokio::test]
    async fn empty_registry_fails_with_no_active_endpoint() {
        let registry = ConnectionRegistry::new(Arc::new(GatedConnector::default()));
        let coordinator = RefreshCoordinator::new(registry, SummaryQuery);
        assert_eq!(coordinator.refresh().await, Err(Error::NoActiveEndpoint));
        assert_eq!(coordinator.state().status, RefreshStatus::Failed);
    }
}
