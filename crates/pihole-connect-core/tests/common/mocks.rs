// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Scripted remote client and connector doubles.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pihole_connect_core::client::{Connector, RemoteClient};
use pihole_connect_core::model::{Endpoint, LogEntry, Rule, Summary, TimeSeries};
use pihole_connect_core::rules::RuleCategory;
use pihole_connect_core::Error;
use tokio::sync::Notify;

/// How one remote operation answers: after an optional delay and an optional
/// gate, with a fixed result.
#[derive(Clone)]
pub struct Reply<T> {
    pub delay: Duration,
    pub gate: Option<Arc<Notify>>,
    pub result: Result<T, Error>,
}

impl<T: Clone> Reply<T> {
    pub fn ok(value: T) -> Self {
        Self {
            delay: Duration::ZERO,
            gate: None,
            result: Ok(value),
        }
    }

    pub fn err(err: Error) -> Self {
        Self {
            delay: Duration::ZERO,
            gate: None,
            result: Err(err),
        }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Blocks the call until `gate` is notified.
    pub fn gated(mut self, gate: &Arc<Notify>) -> Self {
        self.gate = Some(Arc::clone(gate));
        self
    }

    async fn answer(&self) -> Result<T, Error> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.result.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    Add(String, RuleCategory),
    Remove(String, RuleCategory),
}

/// Counts every call; answers from a script that tests can change between calls.
pub struct MockRemoteClient {
    summary: Mutex<Reply<Summary>>,
    time_series: Mutex<Reply<TimeSeries>>,
    logs: Mutex<Reply<Vec<LogEntry>>>,
    rules: Mutex<HashMap<RuleCategory, Reply<Vec<Rule>>>>,
    mutation: Mutex<Reply<()>>,
    pub summary_calls: AtomicUsize,
    pub time_series_calls: AtomicUsize,
    pub log_calls: AtomicUsize,
    pub rule_calls: AtomicUsize,
    pub rules_completed: AtomicUsize,
    pub log_limits: Mutex<Vec<usize>>,
    pub mutations: Mutex<Vec<Mutation>>,
}

impl Default for MockRemoteClient {
    fn default() -> Self {
        Self {
            summary: Mutex::new(Reply::ok(Summary::default())),
            time_series: Mutex::new(Reply::ok(TimeSeries::default())),
            logs: Mutex::new(Reply::ok(Vec::new())),
            rules: Mutex::new(HashMap::new()),
            mutation: Mutex::new(Reply::ok(())),
            summary_calls: AtomicUsize::new(0),
            time_series_calls: AtomicUsize::new(0),
            log_calls: AtomicUsize::new(0),
            rule_calls: AtomicUsize::new(0),
            rules_completed: AtomicUsize::new(0),
            log_limits: Mutex::new(Vec::new()),
            mutations: Mutex::new(Vec::new()),
        }
    }
}

#[allow(dead_code)]
impl MockRemoteClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_summary(&self, reply: Reply<Summary>) {
        *self.summary.lock().expect("summary script") = reply;
    }

    pub fn set_time_series(&self, reply: Reply<TimeSeries>) {
        *self.time_series.lock().expect("time series script") = reply;
    }

    pub fn set_logs(&self, reply: Reply<Vec<LogEntry>>) {
        *self.logs.lock().expect("log script") = reply;
    }

    pub fn set_rules(&self, category: RuleCategory, reply: Reply<Vec<Rule>>) {
        self.rules
            .lock()
            .expect("rule script")
            .insert(category, reply);
    }

    pub fn set_mutation(&self, reply: Reply<()>) {
        *self.mutation.lock().expect("mutation script") = reply;
    }

    pub fn summary_calls(&self) -> usize {
        self.summary_calls.load(Ordering::SeqCst)
    }

    pub fn rule_calls(&self) -> usize {
        self.rule_calls.load(Ordering::SeqCst)
    }

    pub fn rules_completed(&self) -> usize {
        self.rules_completed.load(Ordering::SeqCst)
    }

    pub fn mutations(&self) -> Vec<Mutation> {
        self.mutations.lock().expect("mutations").clone()
    }
}

#[async_trait]
impl RemoteClient for MockRemoteClient {
    async fn fetch_summary(&self) -> Result<Summary, Error> {
        self.summary_calls.fetch_add(1, Ordering::SeqCst);
        let reply = self.summary.lock().expect("summary script").clone();
        reply.answer().await
    }

    async fn fetch_time_series(&self) -> Result<TimeSeries, Error> {
        self.time_series_calls.fetch_add(1, Ordering::SeqCst);
        let reply = self.time_series.lock().expect("time series script").clone();
        reply.answer().await
    }

    async fn fetch_logs(&self, limit: usize) -> Result<Vec<LogEntry>, Error> {
        self.log_calls.fetch_add(1, Ordering::SeqCst);
        self.log_limits.lock().expect("log limits").push(limit);
        let reply = self.logs.lock().expect("log script").clone();
        reply.answer().await
    }

    async fn fetch_rules(&self, category: RuleCategory) -> Result<Vec<Rule>, Error> {
        self.rule_calls.fetch_add(1, Ordering::SeqCst);
        let reply = self
            .rules
            .lock()
            .expect("rule script")
            .get(&category)
            .cloned()
            .unwrap_or_else(|| Reply::ok(Vec::new()));
        let result = reply.answer().await;
        self.rules_completed.fetch_add(1, Ordering::SeqCst);
        result
    }

    async fn add_rule(&self, domain: &str, category: RuleCategory) -> Result<(), Error> {
        self.mutations
            .lock()
            .expect("mutations")
            .push(Mutation::Add(domain.to_string(), category));
        let reply = self.mutation.lock().expect("mutation script").clone();
        reply.answer().await
    }

    async fn remove_rule(&self, domain: &str, category: RuleCategory) -> Result<(), Error> {
        self.mutations
            .lock()
            .expect("mutations")
            .push(Mutation::Remove(domain.to_string(), category));
        let reply = self.mutation.lock().expect("mutation script").clone();
        reply.answer().await
    }
}

/// Hands out a preconfigured [`MockRemoteClient`] per endpoint id.
#[derive(Default)]
pub struct MockConnector {
    clients: Mutex<HashMap<String, Arc<MockRemoteClient>>>,
}

#[allow(dead_code)]
impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The client for `id`, created on first use.
    pub fn client(&self, id: &str) -> Arc<MockRemoteClient> {
        Arc::clone(
            self.clients
                .lock()
                .expect("clients")
                .entry(id.to_string())
                .or_insert_with(MockRemoteClient::new),
        )
    }
}

impl Connector for MockConnector {
    fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn RemoteClient>, Error> {
        Ok(self.client(endpoint.id.as_str()))
    }
}
