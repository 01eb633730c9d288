// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fixtures shared by the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use pihole_connect_core::model::{Endpoint, Rule};
use pihole_connect_core::registry::ConnectionRegistry;
use pihole_connect_core::rules::RuleCategory;
use pihole_connect_core::store::EndpointStore;

use super::mocks::MockConnector;

/// Registry over `ids`, the first one active, backed by mock clients.
pub fn registry(ids: &[&str]) -> (Arc<MockConnector>, ConnectionRegistry) {
    let connector = MockConnector::new();
    let store = EndpointStore {
        active: None,
        endpoints: ids
            .iter()
            .map(|id| Endpoint::new(*id, id.to_uppercase(), format!("http://{id}.lan"), "token"))
            .collect(),
    };
    let registry = ConnectionRegistry::from_store(store, connector.clone()).expect("valid store");
    (connector, registry)
}

pub fn rule(id: u64, domain: &str, category: RuleCategory) -> Rule {
    Rule {
        id,
        category,
        domain: domain.to_string(),
        enabled: true,
        date_added: 1_600_000_000,
        date_modified: 1_600_000_000,
        comment: None,
    }
}

pub fn domains(rules: &[Rule]) -> Vec<&str> {
    rules.iter().map(|rule| rule.domain.as_str()).collect()
}

/// Yields to the runtime until `condition` holds.
pub async fn settle(mut condition: impl FnMut() -> bool) {
    while !condition() {
        tokio::task::yield_now().await;
    }
}
