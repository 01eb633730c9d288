// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::Error;
use crate::model::{Endpoint, LogEntry, Rule, Summary, TimeSeries};
use crate::rules::RuleCategory;

/// Remote operations available against one endpoint.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    async fn fetch_summary(&self) -> Result<Summary, Error>;

    async fn fetch_time_series(&self) -> Result<TimeSeries, Error>;

    /// Returns at most `limit` of the most recent queries.
    async fn fetch_logs(&self, limit: usize) -> Result<Vec<LogEntry>, Error>;

    async fn fetch_rules(&self, category: RuleCategory) -> Result<Vec<Rule>, Error>;

    async fn add_rule(&self, domain: &str, category: RuleCategory) -> Result<(), Error>;

    async fn remove_rule(&self, domain: &str, category: RuleCategory) -> Result<(), Error>;
}

/// Builds the [`RemoteClient`] used to talk to an endpoint.
///
/// The registry calls this once per endpoint definition; replacing an endpoint
/// builds a new client.
pub trait Connector: Send + Sync {
    fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn RemoteClient>, Error>;
}
