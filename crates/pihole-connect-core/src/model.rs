// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Domain types exchanged between the registry, the remote clients and the views.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::rules::RuleCategory;

/// Stable identifier of a configured endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointId(String);

impl EndpointId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EndpointId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// API token used to authenticate against an endpoint. Never printed.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            write!(f, "Credential(<empty>)")
        } else {
            write!(f, "Credential(<redacted>)")
        }
    }
}

/// One configured remote filtering appliance.
///
/// Endpoints are immutable; editing one means replacing it wholesale through
/// [`crate::registry::ConnectionRegistry::upsert`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: EndpointId,
    #[serde(rename = "name")]
    pub display_name: String,
    /// Base URL of the appliance, e.g. `http://pi.hole`.
    pub host: String,
    #[serde(rename = "api_token", default = "empty_credential")]
    pub credential: Credential,
}

fn empty_credential() -> Credential {
    Credential::new("")
}

impl Endpoint {
    pub fn new(
        id: impl Into<String>,
        display_name: impl Into<String>,
        host: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            id: EndpointId::new(id),
            display_name: display_name.into(),
            host: host.into(),
            credential: Credential::new(credential),
        }
    }
}

/// Headline counters reported by an appliance for the current day.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Summary {
    #[serde(rename = "dns_queries_today")]
    pub total_queries: u64,
    #[serde(rename = "ads_blocked_today")]
    pub blocked_queries: u64,
    #[serde(rename = "ads_percentage_today")]
    pub blocked_percentage: f64,
    #[serde(rename = "domains_being_blocked")]
    pub blocklist_size: u64,
    #[serde(default)]
    pub unique_clients: u64,
    #[serde(default)]
    pub status: String,
}

/// Query counts bucketed in ten minute slots, keyed by the bucket's epoch seconds.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TimeSeries {
    pub permitted: BTreeMap<i64, u64>,
    pub blocked: BTreeMap<i64, u64>,
}

/// Outcome the appliance recorded for a single DNS query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    Blocked,
    Allowed,
    Cached,
    Unknown,
}

impl QueryStatus {
    /// Maps the numeric status column of the query log.
    pub fn from_code(code: u32) -> Self {
        match code {
            1 | 4..=11 | 15 => Self::Blocked,
            2 | 12..=14 => Self::Allowed,
            3 => Self::Cached,
            _ => Self::Unknown,
        }
    }

    pub fn is_blocked(self) -> bool {
        self == Self::Blocked
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Epoch seconds.
    pub timestamp: i64,
    pub query_type: String,
    pub domain: String,
    pub client: String,
    pub status: QueryStatus,
}

/// One domain filter rule as configured on an appliance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub id: u64,
    pub category: RuleCategory,
    pub domain: String,
    pub enabled: bool,
    pub date_added: i64,
    pub date_modified: i64,
    pub comment: Option<String>,
}
