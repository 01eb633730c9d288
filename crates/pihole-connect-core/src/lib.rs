// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Refresh coordination and multi-endpoint aggregation for Pi-hole administration clients.
//!
//! The [`registry::ConnectionRegistry`] tracks the configured endpoints and which
//! one is active. Views refresh through a [`coordinator::RefreshCoordinator`],
//! which coalesces overlapping refreshes with [`single_flight::SingleFlight`] and
//! drops results produced against an endpoint that stopped being active.
//! [`poller::PeriodicPoller`] drives the live views, and
//! [`fan_out::FanOutAggregator`] merges parallel sub-queries into one result.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod client;
pub mod config;
pub mod coordinator;
pub mod errors;
pub mod fan_out;
pub mod http;
pub mod model;
pub mod poller;
pub mod registry;
pub mod rules;
pub mod single_flight;
pub mod store;
pub mod views;

pub use errors::Error;
