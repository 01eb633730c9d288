// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Coalescing of overlapping refresh requests.
//!
//! The first caller while idle becomes the leader: its work is spawned onto the
//! runtime and every caller arriving before it finishes follows it, receiving
//! a clone of the same outcome. The work runs detached from the callers, so a
//! caller that gives up waiting (for example a stopped poller) does not abort
//! a refresh other callers are waiting on.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::errors::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefreshStatus {
    #[default]
    Idle,
    Refreshing,
    Failed,
}

type Outcome<T> = Option<Result<T, Error>>;

struct FlightState<T> {
    status: RefreshStatus,
    last_error: Option<Error>,
    in_flight: Option<watch::Receiver<Outcome<T>>>,
}

/// Runs at most one piece of work at a time and shares its outcome with all
/// callers that overlapped with it.
pub struct SingleFlight<T> {
    state: Arc<Mutex<FlightState<T>>>,
}

impl<T> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(FlightState {
                status: RefreshStatus::Idle,
                last_error: None,
                in_flight: None,
            })),
        }
    }
}

impl<T> std::fmt::Debug for SingleFlight<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("SingleFlight")
            .field("status", &state.status)
            .field("last_error", &state.last_error)
            .finish()
    }
}

fn lock<T>(state: &Mutex<FlightState<T>>) -> MutexGuard<'_, FlightState<T>> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> RefreshStatus {
        lock(&self.state).status
    }

    /// Error of the most recent attempt, cleared by the next success.
    pub fn last_error(&self) -> Option<Error> {
        lock(&self.state).last_error.clone()
    }

    /// Starts `work` unless an attempt is already running, then waits for the
    /// outcome of whichever attempt this call ended up joining.
    ///
    /// `work` is only invoked when this call leads a new attempt.
    pub async fn trigger<F, Fut>(&self, work: F) -> Result<T, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Error>> + Send + 'static,
    {
        let (mut outcome_rx, leader_tx) = {
            let mut state = lock(&self.state);
            match &state.in_flight {
                Some(rx) => {
                    debug!("joining in-flight refresh");
                    (rx.clone(), None)
                }
                None => {
                    let (tx, rx) = watch::channel(None);
                    state.in_flight = Some(rx.clone());
                    state.status = RefreshStatus::Refreshing;
                    (rx, Some(tx))
                }
            }
        };

        if let Some(outcome_tx) = leader_tx {
            let task = tokio::spawn(work());
            let shared = Arc::clone(&self.state);
            tokio::spawn(async move {
                let outcome = match task.await {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        warn!("refresh task ended without an outcome: {err}");
                        Err(Error::Interrupted(err.to_string()))
                    }
                };
                {
                    let mut state = lock(&shared);
                    state.in_flight = None;
                    match &outcome {
                        Ok(_) => {
                            state.status = RefreshStatus::Idle;
                            state.last_error = None;
                        }
                        Err(err) => {
                            state.status = RefreshStatus::Failed;
                            state.last_error = Some(err.clone());
                        }
                    }
                }
                outcome_tx.send_replace(Some(outcome));
            });
        }

        let outcome = match outcome_rx.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).clone(),
            Err(_) => None,
        };
        outcome.unwrap_or_else(|| {
            Err(Error::Interrupted(
                "refresh dropped before completing".to_string(),
            ))
        })
    }
}
