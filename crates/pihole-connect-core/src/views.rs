// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The queries behind the dashboard, query log and filter rules views.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::client::RemoteClient;
use crate::coordinator::{
    CoordinatorConfig, RefreshCoordinator, RefreshOutcome, RefreshState, ViewQuery,
};
use crate::errors::Error;
use crate::fan_out::{FanOutAggregator, SubQueryDescriptor};
use crate::model::{LogEntry, Rule, Summary, TimeSeries};
use crate::registry::ConnectionRegistry;
use crate::rules::{wildcard_regex, RuleCategory, RuleTab};

pub const DEFAULT_LOG_LIMIT: usize = 200;

/// Headline statistics plus the ten minute activity graph.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Dashboard {
    pub summary: Summary,
    pub time_series: TimeSeries,
}

impl Dashboard {
    pub fn total_queries(&self) -> u64 {
        self.summary.total_queries
    }

    pub fn blocked_queries(&self) -> u64 {
        self.summary.blocked_queries
    }

    pub fn blocked_percentage(&self) -> f64 {
        self.summary.blocked_percentage
    }

    pub fn blocklist_size(&self) -> u64 {
        self.summary.blocklist_size
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DashboardQuery;

#[async_trait]
impl ViewQuery for DashboardQuery {
    type Output = Dashboard;

    fn name(&self) -> &str {
        "dashboard"
    }

    async fn run(&self, client: Arc<dyn RemoteClient>) -> Result<Dashboard, Error> {
        let (summary, time_series) =
            tokio::try_join!(client.fetch_summary(), client.fetch_time_series())?;
        Ok(Dashboard {
            summary,
            time_series,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QueryLogQuery {
    pub limit: usize,
}

impl Default for QueryLogQuery {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LOG_LIMIT,
        }
    }
}

#[async_trait]
impl ViewQuery for QueryLogQuery {
    type Output = Vec<LogEntry>;

    fn name(&self) -> &str {
        "query_log"
    }

    async fn run(&self, client: Arc<dyn RemoteClient>) -> Result<Vec<LogEntry>, Error> {
        let mut entries = client.fetch_logs(self.limit).await?;
        // Newest first, whatever order the endpoint answered in.
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        entries.truncate(self.limit);
        Ok(entries)
    }
}

/// Fetches every rule category in parallel and merges them in fetch order.
#[derive(Debug, Clone)]
pub struct FilterRulesQuery {
    aggregator: FanOutAggregator<RuleCategory>,
}

impl Default for FilterRulesQuery {
    fn default() -> Self {
        Self {
            aggregator: FanOutAggregator::new(SubQueryDescriptor::sequence(
                RuleCategory::FETCH_ORDER,
            )),
        }
    }
}

#[async_trait]
impl ViewQuery for FilterRulesQuery {
    type Output = Vec<Rule>;

    fn name(&self) -> &str {
        "filter_rules"
    }

    async fn run(&self, client: Arc<dyn RemoteClient>) -> Result<Vec<Rule>, Error> {
        self.aggregator
            .aggregate(|category| {
                let client = Arc::clone(&client);
                async move {
                    let rules = client.fetch_rules(category).await?;
                    Ok(rules
                        .into_iter()
                        .map(|rule| Rule { category, ..rule })
                        .collect::<Vec<_>>())
                }
            })
            .await
    }
}

pub type DashboardView = RefreshCoordinator<DashboardQuery>;
pub type QueryLogView = RefreshCoordinator<QueryLogQuery>;

/// Filter rules view: a coordinated refresh plus the rule mutations.
#[derive(Debug, Clone)]
pub struct FilterRulesView {
    coordinator: RefreshCoordinator<FilterRulesQuery>,
}

impl FilterRulesView {
    pub fn new(registry: ConnectionRegistry) -> Self {
        Self::with_config(registry, CoordinatorConfig::default())
    }

    pub fn with_config(registry: ConnectionRegistry, config: CoordinatorConfig) -> Self {
        Self {
            coordinator: RefreshCoordinator::with_config(
                registry,
                FilterRulesQuery::default(),
                config,
            ),
        }
    }

    pub fn coordinator(&self) -> &RefreshCoordinator<FilterRulesQuery> {
        &self.coordinator
    }

    pub async fn refresh(&self) -> Result<RefreshOutcome<Vec<Rule>>, Error> {
        self.coordinator.refresh().await
    }

    pub fn state(&self) -> RefreshState<Vec<Rule>> {
        self.coordinator.state()
    }

    /// Rules of the last committed refresh that belong on `tab`.
    pub fn visible_rules(&self, tab: RuleTab) -> Vec<Rule> {
        self.state()
            .last_successful_result
            .map(|rules| tab.filter(&rules).cloned().collect())
            .unwrap_or_default()
    }

    /// Adds `input` to the list behind `tab`, then refreshes.
    ///
    /// With `wildcard` set the domain is stored as a regex that also matches
    /// its subdomains.
    pub async fn add_rule(
        &self,
        input: &str,
        tab: RuleTab,
        wildcard: bool,
    ) -> Result<RefreshOutcome<Vec<Rule>>, Error> {
        let domain = input.trim();
        if domain.is_empty() {
            return Err(Error::Api("domain must not be empty".to_string()));
        }
        let category = tab.category_for(wildcard);
        let entry = if wildcard {
            wildcard_regex(domain)
        } else {
            domain.to_string()
        };

        let active = self.coordinator.registry().active()?;
        active.client.add_rule(&entry, category).await?;
        info!(endpoint = %active.endpoint.id, %category, domain = %entry, "rule added");
        self.refresh().await
    }

    pub async fn remove_rule(&self, rule: &Rule) -> Result<RefreshOutcome<Vec<Rule>>, Error> {
        let active = self.coordinator.registry().active()?;
        active.client.remove_rule(&rule.domain, rule.category).await?;
        info!(endpoint = %active.endpoint.id, category = %rule.category, domain = %rule.domain, "rule removed");
        self.refresh().await
    }
}
