// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Persisted endpoint configuration.
//!
//! The store is a small JSON document owned by the host application:
//!
//! ```json
//! { "active": "home", "endpoints": [ { "id": "home", "name": "Home", "host": "http://pi.hole", "api_token": "..." } ] }
//! ```

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::Error;
use crate::model::{Endpoint, EndpointId};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointStore {
    #[serde(default)]
    pub active: Option<EndpointId>,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
}

impl EndpointStore {
    /// Reads and validates the store at `path`.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let raw = fs::read_to_string(path)
            .map_err(|err| Error::Config(format!("failed to read {}: {err}", path.display())))?;
        let store: EndpointStore = serde_json::from_str(&raw)
            .map_err(|err| Error::Config(format!("failed to parse {}: {err}", path.display())))?;
        store.validate()?;
        debug!(path = %path.display(), endpoints = store.endpoints.len(), "endpoint store loaded");
        Ok(store)
    }

    /// Writes the store to `path` through a sibling temporary file.
    pub fn save(&self, path: &Path) -> Result<(), Error> {
        self.validate()?;
        let rendered = serde_json::to_string_pretty(self)
            .map_err(|err| Error::Config(format!("failed to render endpoint store: {err}")))?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, rendered)
            .map_err(|err| Error::Config(format!("failed to write {}: {err}", tmp.display())))?;
        fs::rename(&tmp, path)
            .map_err(|err| Error::Config(format!("failed to replace {}: {err}", path.display())))?;
        Ok(())
    }

    /// Ids must be non-empty and unique; `active`, when set, must name a listed endpoint.
    pub fn validate(&self) -> Result<(), Error> {
        let mut seen = HashSet::new();
        for endpoint in &self.endpoints {
            if endpoint.id.as_str().is_empty() {
                return Err(Error::Config("endpoint id must not be empty".to_string()));
            }
            if !seen.insert(&endpoint.id) {
                return Err(Error::Config(format!(
                    "duplicate endpoint id {}",
                    endpoint.id
                )));
            }
        }
        match &self.active {
            Some(active) if !seen.contains(active) => Err(Error::UnknownEndpoint(active.clone())),
            _ => Ok(()),
        }
    }

    /// Active endpoint after defaulting: the stored one, else the first listed.
    pub fn effective_active(&self) -> Option<EndpointId> {
        self.active
            .clone()
            .or_else(|| self.endpoints.first().map(|endpoint| endpoint.id.clone()))
    }
}
