// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::http::HttpClientOptions;
use crate::model::EndpointId;
use crate::views::DEFAULT_LOG_LIMIT;

const DEFAULT_CONFIG_PATH: &str = "pihole-connect.json";
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;

/// Process settings read from `PIHOLE_CONNECT_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub config_path: PathBuf,
    pub log_level: String,
    pub request_timeout: Duration,
    pub dashboard_interval: Duration,
    pub log_interval: Duration,
    pub log_limit: usize,
    /// Overrides the active endpoint recorded in the store.
    pub active: Option<EndpointId>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from(DEFAULT_CONFIG_PATH),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            dashboard_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            log_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            log_limit: DEFAULT_LOG_LIMIT,
            active: None,
        }
    }
}

impl Settings {
    /// Unparseable values fall back to their defaults.
    pub fn from_env() -> Self {
        let config_path = env::var("PIHOLE_CONNECT_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        let log_level = env::var("PIHOLE_CONNECT_LOG_LEVEL")
            .ok()
            .filter(|level| !level.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string());
        let request_timeout = Duration::from_secs(
            parse_var("PIHOLE_CONNECT_REQUEST_TIMEOUT_SECS")
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
        );
        let log_limit = parse_var("PIHOLE_CONNECT_LOG_LIMIT").unwrap_or(DEFAULT_LOG_LIMIT);
        let active = env::var("PIHOLE_CONNECT_ACTIVE")
            .ok()
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .map(EndpointId::new);

        Self {
            config_path,
            log_level,
            request_timeout,
            dashboard_interval: interval_var("PIHOLE_CONNECT_DASHBOARD_INTERVAL_SECS"),
            log_interval: interval_var("PIHOLE_CONNECT_LOG_INTERVAL_SECS"),
            log_limit,
            active,
        }
    }

    pub fn http_options(&self) -> HttpClientOptions {
        HttpClientOptions {
            timeout: self.request_timeout,
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|raw| raw.trim().parse().ok())
}

// A zero period would spin the poller; clamp to one second.
fn interval_var(name: &str) -> Duration {
    let secs = parse_var(name).unwrap_or(DEFAULT_POLL_INTERVAL_SECS);
    Duration::from_secs(secs.max(1))
}
