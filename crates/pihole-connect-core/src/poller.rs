// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fixed-interval polling loop with an explicit cancellation handle.

use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Invokes a tick callback immediately and then every `interval` until stopped.
///
/// Ticks never overlap: a slow tick delays the next one rather than stacking
/// up behind it.
pub struct PeriodicPoller {
    name: String,
    running: Mutex<Option<Running>>,
}

impl std::fmt::Debug for PeriodicPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodicPoller")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish()
    }
}

impl PeriodicPoller {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            running: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Starts polling. Does nothing if the poller is already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<F, Fut>(&self, period: Duration, on_tick: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.is_some() {
            debug!(poller = %self.name, "poller already running");
            return;
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let name = self.name.clone();
        let handle = tokio::spawn(async move {
            debug!(poller = %name, period_ms = period.as_millis() as u64, "poller started");
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                // A tick runs to completion; cancellation is only observed between ticks.
                on_tick().await;
            }
            debug!(poller = %name, "poller stopped");
        });
        *running = Some(Running { cancel, handle });
    }

    /// Stops polling and waits for the loop to exit.
    ///
    /// A tick caught mid-flight finishes before this returns. Once it returns
    /// no tick is running and none will begin.
    pub async fn stop(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(Running { cancel, handle }) = running {
            cancel.cancel();
            if let Err(err) = handle.await {
                if err.is_panic() {
                    error!(poller = %self.name, "poller task panicked: {err}");
                }
            }
        }
    }
}

impl Drop for PeriodicPoller {
    fn drop(&mut self) {
        if let Some(running) = self
            .running
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            running.cancel.cancel();
        }
    }
}
