// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP implementation of [`RemoteClient`] for the Pi-hole `admin/api.php` query API.
//!
//! Every operation is a `GET` against the same script, selected by query
//! parameters and authenticated with the endpoint's API token. Responses are
//! classified into the crate error taxonomy: transport failures become
//! [`Error::Connectivity`], credential rejections [`Error::Auth`], and anything
//! else the appliance says that we cannot make sense of [`Error::Api`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::debug;

use crate::client::{Connector, RemoteClient};
use crate::errors::Error;
use crate::model::{Credential, Endpoint, LogEntry, QueryStatus, Rule, Summary, TimeSeries};
use crate::rules::RuleCategory;

const API_PATH: &str = "/admin/api.php";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Options applied to every HTTP client built by [`HttpConnector`].
#[derive(Debug, Clone, Copy)]
pub struct HttpClientOptions {
    /// Upper bound for a whole request, connect included.
    pub timeout: Duration,
}

impl Default for HttpClientOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Production [`Connector`]: one [`PiHoleClient`] per endpoint definition.
#[derive(Debug, Clone, Default)]
pub struct HttpConnector {
    options: HttpClientOptions,
}

impl HttpConnector {
    pub fn new(options: HttpClientOptions) -> Self {
        Self { options }
    }
}

impl Connector for HttpConnector {
    fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn RemoteClient>, Error> {
        Ok(Arc::new(PiHoleClient::new(endpoint, self.options)?))
    }
}

#[derive(Debug, Clone)]
pub struct PiHoleClient {
    client: Client,
    base_url: String,
    credential: Credential,
}

impl PiHoleClient {
    pub fn new(endpoint: &Endpoint, options: HttpClientOptions) -> Result<Self, Error> {
        let client = Client::builder()
            .timeout(options.timeout)
            .build()
            .map_err(|err| Error::Config(format!("failed to build http client: {err}")))?;
        Ok(Self {
            client,
            base_url: normalize_base_url(&endpoint.host),
            credential: endpoint.credential.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Sends one API query and returns the decoded JSON body.
    async fn query(&self, params: &[(&str, &str)]) -> Result<Value, Error> {
        let url = format!("{}{}", self.base_url, API_PATH);
        let mut query: Vec<(&str, &str)> = params.to_vec();
        if !self.credential.is_empty() {
            query.push(("auth", self.credential.expose()));
        }

        // The token travels in the query string, so only parameter names are logged.
        let keys: Vec<&str> = params.iter().map(|(key, _)| *key).collect();
        debug!(url = %url, params = ?keys, "pihole api request");

        let response = self.client.get(&url).query(&query).send().await?;
        let status = response.status();
        let body = response.text().await?;
        debug!(url = %url, status = %status, body_len = body.len(), "pihole api response");

        classify_status(status, &body)?;
        let value: Value = serde_json::from_str(&body)?;
        classify_body(&value)?;
        Ok(value)
    }

    async fn mutate(&self, action: &str, domain: &str, category: RuleCategory) -> Result<(), Error> {
        let value = self
            .query(&[("list", category.list_name()), (action, domain)])
            .await?;
        let outcome: MutationResponse = serde_json::from_value(value)?;
        if outcome.success {
            Ok(())
        } else {
            Err(Error::Api(
                outcome
                    .message
                    .unwrap_or_else(|| format!("{action} {domain} on {category} was rejected")),
            ))
        }
    }
}

#[async_trait]
impl RemoteClient for PiHoleClient {
    async fn fetch_summary(&self) -> Result<Summary, Error> {
        let value = self.query(&[("summaryRaw", "")]).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn fetch_time_series(&self) -> Result<TimeSeries, Error> {
        let value = self.query(&[("overTimeData10mins", "")]).await?;
        let raw: RawTimeSeries = serde_json::from_value(value)?;
        Ok(TimeSeries {
            permitted: raw.domains_over_time,
            blocked: raw.ads_over_time,
        })
    }

    async fn fetch_logs(&self, limit: usize) -> Result<Vec<LogEntry>, Error> {
        let limit_param = limit.to_string();
        let value = self.query(&[("getAllQueries", limit_param.as_str())]).await?;
        let raw: RawQueryLog = serde_json::from_value(value)?;
        let mut entries = raw
            .data
            .iter()
            .map(|row| parse_log_row(row))
            .collect::<Result<Vec<_>, _>>()?;
        // The appliance answers oldest first.
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        entries.truncate(limit);
        Ok(entries)
    }

    async fn fetch_rules(&self, category: RuleCategory) -> Result<Vec<Rule>, Error> {
        let value = self.query(&[("list", category.list_name())]).await?;
        let raw: RawRuleList = serde_json::from_value(value)?;
        Ok(raw
            .data
            .into_iter()
            .map(|rule| rule.into_rule(category))
            .collect())
    }

    async fn add_rule(&self, domain: &str, category: RuleCategory) -> Result<(), Error> {
        self.mutate("add", domain, category).await
    }

    async fn remove_rule(&self, domain: &str, category: RuleCategory) -> Result<(), Error> {
        self.mutate("sub", domain, category).await
    }
}

/// Accepts `pi.hole`, `pi.hole/` or `https://pi.hole/` alike.
fn normalize_base_url(host: &str) -> String {
    let trimmed = host.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    }
}

fn classify_status(status: StatusCode, body: &str) -> Result<(), Error> {
    if status.is_success() {
        Ok(())
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        Err(Error::Auth(format!("status {}", status.as_u16())))
    } else {
        Err(Error::Api(format!(
            "status {}: {}",
            status.as_u16(),
            truncate(body, 200)
        )))
    }
}

/// The appliance reports rejected tokens inside a 200 response: either an
/// empty array in place of the payload or an `error` message.
fn classify_body(value: &Value) -> Result<(), Error> {
    match value {
        Value::Array(items) if items.is_empty() => Err(Error::Auth(
            "empty response, api token rejected".to_string(),
        )),
        Value::Object(map) => match map.get("error") {
            Some(error) => {
                let message = match error {
                    Value::String(message) => message.clone(),
                    other => other.to_string(),
                };
                if message.to_ascii_lowercase().contains("authoriz") {
                    Err(Error::Auth(message))
                } else {
                    Err(Error::Api(message))
                }
            }
            None => Ok(()),
        },
        _ => Ok(()),
    }
}

fn truncate(body: &str, max: usize) -> &str {
    match body.char_indices().nth(max) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

#[derive(Deserialize)]
struct MutationResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
struct RawTimeSeries {
    #[serde(deserialize_with = "buckets")]
    domains_over_time: BTreeMap<i64, u64>,
    #[serde(deserialize_with = "buckets")]
    ads_over_time: BTreeMap<i64, u64>,
}

/// Time series arrive as `{"<epoch>": count}`, or `[]` when there is no data yet.
fn buckets<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BTreeMap<i64, u64>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Buckets(BTreeMap<String, u64>),
        Empty(Vec<Value>),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Buckets(map) => map
            .into_iter()
            .map(|(key, count)| {
                key.parse::<i64>()
                    .map(|ts| (ts, count))
                    .map_err(|_| D::Error::custom(format!("invalid bucket timestamp {key:?}")))
            })
            .collect(),
        Raw::Empty(items) if items.is_empty() => Ok(BTreeMap::new()),
        Raw::Empty(_) => Err(D::Error::custom("expected a bucket map")),
    }
}

#[derive(Deserialize)]
struct RawQueryLog {
    #[serde(default)]
    data: Vec<Vec<Value>>,
}

/// Rows are positional: timestamp, type, domain, client, status, ...
fn parse_log_row(row: &[Value]) -> Result<LogEntry, Error> {
    let column = |idx: usize| -> Result<String, Error> {
        match row.get(idx) {
            Some(Value::String(text)) => Ok(text.clone()),
            Some(Value::Number(number)) => Ok(number.to_string()),
            other => Err(Error::Api(format!(
                "query log column {idx} malformed: {other:?}"
            ))),
        }
    };

    let timestamp = column(0)?
        .parse::<i64>()
        .map_err(|err| Error::Api(format!("invalid query timestamp: {err}")))?;
    let status = column(4)?
        .parse::<u32>()
        .map(QueryStatus::from_code)
        .unwrap_or(QueryStatus::Unknown);

    Ok(LogEntry {
        timestamp,
        query_type: column(1)?,
        domain: column(2)?,
        client: column(3)?,
        status,
    })
}

#[derive(Deserialize)]
struct RawRuleList {
    #[serde(default)]
    data: Vec<RawRule>,
}

#[derive(Deserialize)]
struct RawRule {
    id: u64,
    domain: String,
    #[serde(default = "enabled_by_default", deserialize_with = "flag")]
    enabled: bool,
    #[serde(default)]
    date_added: i64,
    #[serde(default)]
    date_modified: i64,
    #[serde(default)]
    comment: Option<String>,
}

fn enabled_by_default() -> bool {
    true
}

impl RawRule {
    fn into_rule(self, category: RuleCategory) -> Rule {
        Rule {
            id: self.id,
            category,
            domain: self.domain,
            enabled: self.enabled,
            date_added: self.date_added,
            date_modified: self.date_modified,
            comment: self.comment.filter(|comment| !comment.is_empty()),
        }
    }
}

/// `enabled` is a `0`/`1` integer on the wire, a boolean on newer releases.
fn flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Bool(flag) => Ok(flag),
        Value::Number(number) => Ok(number.as_i64().unwrap_or(0) != 0),
        other => Err(D::Error::custom(format!("invalid flag {other}"))),
    }
}
