// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Registry of configured endpoints and the currently active selection.
//!
//! The active endpoint id and its generation live under one lock, so a reader
//! never observes a generation paired with the wrong endpoint. Every change of
//! the active endpoint (switch, removal, or wholesale replacement of the active
//! definition) bumps the generation; refreshes stamped with an older generation
//! are discarded at commit time.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::watch;
use tracing::{debug, info};

use crate::client::{Connector, RemoteClient};
use crate::errors::Error;
use crate::model::{Endpoint, EndpointId};
use crate::store::EndpointStore;

/// The active endpoint id together with the generation it was selected at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveSelection {
    pub endpoint_id: Option<EndpointId>,
    pub generation: u64,
}

/// Consistent snapshot of the active endpoint, valid for one refresh.
#[derive(Clone)]
pub struct ActiveEndpoint {
    pub endpoint: Endpoint,
    pub client: Arc<dyn RemoteClient>,
    pub generation: u64,
}

impl fmt::Debug for ActiveEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveEndpoint")
            .field("endpoint", &self.endpoint)
            .field("generation", &self.generation)
            .finish()
    }
}

struct Entry {
    endpoint: Endpoint,
    client: Arc<dyn RemoteClient>,
}

struct RegistryState {
    entries: Vec<Entry>,
    active: Option<EndpointId>,
    generation: u64,
}

impl RegistryState {
    fn position(&self, id: &EndpointId) -> Option<usize> {
        self.entries.iter().position(|entry| &entry.endpoint.id == id)
    }

    fn selection(&self) -> ActiveSelection {
        ActiveSelection {
            endpoint_id: self.active.clone(),
            generation: self.generation,
        }
    }
}

struct RegistryInner {
    state: RwLock<RegistryState>,
    connector: Arc<dyn Connector>,
    changes: watch::Sender<ActiveSelection>,
}

/// Shared handle to the endpoint registry. Cloning is cheap.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.read();
        f.debug_struct("ConnectionRegistry")
            .field("endpoints", &state.entries.len())
            .field("active", &state.active)
            .field("generation", &state.generation)
            .finish()
    }
}

impl ConnectionRegistry {
    /// Creates a registry with no endpoints and no active selection.
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self::from_parts(Vec::new(), None, connector)
    }

    /// Loads a persisted endpoint store, building one client per endpoint.
    pub fn from_store(store: EndpointStore, connector: Arc<dyn Connector>) -> Result<Self, Error> {
        store.validate()?;
        let active = store.effective_active();
        let entries = store
            .endpoints
            .into_iter()
            .map(|endpoint| {
                let client = connector.connect(&endpoint)?;
                Ok(Entry { endpoint, client })
            })
            .collect::<Result<Vec<_>, Error>>()?;
        debug!(endpoints = entries.len(), active = ?active, "endpoint registry loaded");
        Ok(Self::from_parts(entries, active, connector))
    }

    fn from_parts(
        entries: Vec<Entry>,
        active: Option<EndpointId>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let state = RegistryState {
            entries,
            active,
            generation: 0,
        };
        let (changes, _) = watch::channel(state.selection());
        Self {
            inner: Arc::new(RegistryInner {
                state: RwLock::new(state),
                connector,
                changes,
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.inner.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.inner
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of the registry in its persisted form.
    pub fn to_store(&self) -> EndpointStore {
        let state = self.read();
        EndpointStore {
            active: state.active.clone(),
            endpoints: state
                .entries
                .iter()
                .map(|entry| entry.endpoint.clone())
                .collect(),
        }
    }

    /// Endpoints in configuration order.
    pub fn list(&self) -> Vec<Endpoint> {
        self.read()
            .entries
            .iter()
            .map(|entry| entry.endpoint.clone())
            .collect()
    }

    pub fn get(&self, id: &EndpointId) -> Option<Endpoint> {
        let state = self.read();
        state
            .position(id)
            .map(|idx| state.entries[idx].endpoint.clone())
    }

    pub fn selection(&self) -> ActiveSelection {
        self.read().selection()
    }

    pub fn generation(&self) -> u64 {
        self.read().generation
    }

    /// Returns the active endpoint, its client and the generation, read atomically.
    pub fn active(&self) -> Result<ActiveEndpoint, Error> {
        let state = self.read();
        let id = state.active.as_ref().ok_or(Error::NoActiveEndpoint)?;
        let entry = state
            .position(id)
            .map(|idx| &state.entries[idx])
            .ok_or(Error::NoActiveEndpoint)?;
        Ok(ActiveEndpoint {
            endpoint: entry.endpoint.clone(),
            client: Arc::clone(&entry.client),
            generation: state.generation,
        })
    }

    /// Makes `id` the active endpoint and returns the resulting generation.
    ///
    /// Selecting the endpoint that is already active changes nothing.
    pub fn set_active(&self, id: &EndpointId) -> Result<u64, Error> {
        let mut state = self.write();
        if state.position(id).is_none() {
            return Err(Error::UnknownEndpoint(id.clone()));
        }
        if state.active.as_ref() == Some(id) {
            return Ok(state.generation);
        }
        state.active = Some(id.clone());
        Ok(self.bump(&mut state))
    }

    /// Inserts a new endpoint or replaces an existing one in place.
    pub fn upsert(&self, endpoint: Endpoint) -> Result<(), Error> {
        if endpoint.id.as_str().is_empty() {
            return Err(Error::Config("endpoint id must not be empty".to_string()));
        }
        // Client construction stays outside the lock.
        let client = self.inner.connector.connect(&endpoint)?;
        let id = endpoint.id.clone();

        let mut state = self.write();
        match state.position(&id) {
            Some(idx) => {
                state.entries[idx] = Entry { endpoint, client };
                debug!(endpoint = %id, "endpoint replaced");
                if state.active.as_ref() == Some(&id) {
                    self.bump(&mut state);
                }
            }
            None => {
                state.entries.push(Entry { endpoint, client });
                debug!(endpoint = %id, "endpoint added");
                if state.active.is_none() {
                    state.active = Some(id);
                    self.bump(&mut state);
                }
            }
        }
        Ok(())
    }

    /// Removes an endpoint. Removing the active one falls back to the first remaining.
    pub fn remove(&self, id: &EndpointId) -> Result<Endpoint, Error> {
        let mut state = self.write();
        let idx = state
            .position(id)
            .ok_or_else(|| Error::UnknownEndpoint(id.clone()))?;
        let removed = state.entries.remove(idx);
        debug!(endpoint = %id, "endpoint removed");
        if state.active.as_ref() == Some(id) {
            state.active = state
                .entries
                .first()
                .map(|entry| entry.endpoint.id.clone());
            self.bump(&mut state);
        }
        Ok(removed.endpoint)
    }

    /// Stream of active-selection changes; always exposes the latest selection.
    ///
    /// Selections are published while the registry lock is held. Copy a
    /// selection out of the receiver before calling back into the registry.
    pub fn subscribe(&self) -> watch::Receiver<ActiveSelection> {
        self.inner.changes.subscribe()
    }

    /// Runs `commit` only if `generation` is still current, and reports whether it ran.
    ///
    /// The registry's read side is held for the duration of `commit`, so a
    /// concurrent [`set_active`](Self::set_active) is ordered strictly before or
    /// after it. `commit` must not block.
    pub fn commit_if_current<F: FnOnce()>(&self, generation: u64, commit: F) -> bool {
        let state = self.read();
        if state.generation != generation {
            return false;
        }
        commit();
        true
    }

    /// Increments the generation and publishes the new selection. Caller holds the write lock.
    fn bump(&self, state: &mut RegistryState) -> u64 {
        state.generation += 1;
        let selection = state.selection();
        info!(
            endpoint = ?selection.endpoint_id,
            generation = selection.generation,
            "active endpoint changed"
        );
        self.inner.changes.send_replace(selection);
        state.generation
    }
}
