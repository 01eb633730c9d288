// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use pihole_connect_core::{
    config::Settings,
    coordinator::{RefreshCoordinator, RefreshState, ViewQuery},
    http::HttpConnector,
    model::LogEntry,
    poller::PeriodicPoller,
    registry::ConnectionRegistry,
    rules::RuleTab,
    single_flight::RefreshStatus,
    store::EndpointStore,
    views::{Dashboard, DashboardQuery, DashboardView, FilterRulesView, QueryLogQuery, QueryLogView},
};

/// Newest query log lines echoed after each committed refresh.
const LOG_LINES_SHOWN: usize = 3;

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let settings = Settings::from_env();

    let env_filter = format!(
        "h2=off,hyper=off,rustls=off,reqwest=off,{}",
        settings.log_level.to_lowercase()
    );

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let store = EndpointStore::load(&settings.config_path).with_context(|| {
        format!(
            "unable to load endpoints from {}",
            settings.config_path.display()
        )
    })?;
    let connector = Arc::new(HttpConnector::new(settings.http_options()));
    let registry = ConnectionRegistry::from_store(store, connector)
        .context("invalid endpoint configuration")?;
    if let Some(id) = &settings.active {
        registry
            .set_active(id)
            .with_context(|| format!("PIHOLE_CONNECT_ACTIVE names an unknown endpoint {id}"))?;
    }
    match registry.active() {
        Ok(active) => info!(
            endpoint = %active.endpoint.id,
            host = %active.endpoint.host,
            endpoints = registry.list().len(),
            "starting pihole-connect"
        ),
        Err(err) => warn!("starting without an active endpoint: {err}"),
    }

    let rules = FilterRulesView::new(registry.clone());
    match rules.refresh().await {
        Ok(_) => info!(
            allow = rules.visible_rules(RuleTab::Allow).len(),
            block = rules.visible_rules(RuleTab::Block).len(),
            "filter rules loaded"
        ),
        Err(err) => error!("unable to load filter rules: {err}"),
    }

    let dashboard: DashboardView = RefreshCoordinator::new(registry.clone(), DashboardQuery);
    let query_log: QueryLogView = RefreshCoordinator::new(
        registry.clone(),
        QueryLogQuery {
            limit: settings.log_limit,
        },
    );

    tokio::spawn(report_changes(dashboard.subscribe(), "dashboard", log_dashboard));
    tokio::spawn(report_changes(query_log.subscribe(), "query_log", log_entries));

    let dashboard_poller = PeriodicPoller::new("dashboard");
    let query_log_poller = PeriodicPoller::new("query_log");
    dashboard_poller.start(settings.dashboard_interval, refresh_on_tick(dashboard));
    query_log_poller.start(settings.log_interval, refresh_on_tick(query_log));

    tokio::signal::ctrl_c()
        .await
        .context("unable to listen for shutdown signal")?;
    info!("shutting down");
    dashboard_poller.stop().await;
    query_log_poller.stop().await;
    Ok(())
}

/// Tick callback for a poller. Failures already land in the view's state.
fn refresh_on_tick<Q: ViewQuery>(
    coordinator: RefreshCoordinator<Q>,
) -> impl Fn() -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> + Send + 'static
{
    move || {
        let coordinator = coordinator.clone();
        Box::pin(async move {
            if let Ok(outcome) = coordinator.refresh().await {
                if outcome.is_stale() {
                    debug!(view = coordinator.query().name(), "poll result dropped after endpoint switch");
                }
            }
        })
    }
}

async fn report_changes<T>(
    mut changes: watch::Receiver<RefreshState<T>>,
    view: &'static str,
    log_result: fn(&T),
) where
    T: Clone + Send + Sync + 'static,
{
    while changes.changed().await.is_ok() {
        let state = changes.borrow_and_update().clone();
        match state.status {
            RefreshStatus::Refreshing => debug!(view, "refreshing"),
            RefreshStatus::Failed => {
                if let Some(err) = &state.last_error {
                    warn!(view, "refresh failed: {err}");
                }
            }
            RefreshStatus::Idle => {
                if let Some(result) = &state.last_successful_result {
                    log_result(result);
                }
            }
        }
    }
}

fn log_dashboard(dashboard: &Dashboard) {
    info!(
        total = dashboard.total_queries(),
        blocked = dashboard.blocked_queries(),
        percent = %format_args!("{:.1}", dashboard.blocked_percentage()),
        blocklist = dashboard.blocklist_size(),
        buckets = dashboard.time_series.permitted.len(),
        "dashboard updated"
    );
}

#[allow(clippy::ptr_arg)]
fn log_entries(entries: &Vec<LogEntry>) {
    info!(entries = entries.len(), "query log updated");
    for entry in entries.iter().take(LOG_LINES_SHOWN) {
        info!(
            timestamp = entry.timestamp,
            kind = %entry.query_type,
            domain = %entry.domain,
            client = %entry.client,
            status = ?entry.status,
            "query"
        );
    }
}
