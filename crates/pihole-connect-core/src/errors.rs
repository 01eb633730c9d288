// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy shared by the registry, the remote clients and the refresh machinery.
//!
//! Every variant is `Clone`: a single refresh outcome is handed to all callers that
//! joined the same in-flight attempt, so the error has to be cheap to duplicate.

use thiserror::Error;

use crate::model::EndpointId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The active endpoint could not be reached (DNS, TLS, socket, timeout).
    #[error("connectivity error: {0}")]
    Connectivity(String),
    /// The endpoint rejected the configured credential.
    #[error("authentication rejected: {0}")]
    Auth(String),
    /// The endpoint answered, but not with something we understand.
    #[error("unexpected api response: {0}")]
    Api(String),
    /// One sub-query of a fan-out failed; the whole aggregate failed with it.
    #[error("sub-query {descriptor} failed: {source}")]
    Aggregate {
        descriptor: String,
        #[source]
        source: Box<Error>,
    },
    #[error("no active endpoint configured")]
    NoActiveEndpoint,
    #[error("unknown endpoint: {0}")]
    UnknownEndpoint(EndpointId),
    /// Endpoint store or settings could not be read or failed validation.
    #[error("configuration error: {0}")]
    Config(String),
    /// A refresh task ended without producing an outcome (panic or abort).
    #[error("refresh interrupted: {0}")]
    Interrupted(String),
}

impl Error {
    pub fn aggregate(descriptor: impl Into<String>, source: Error) -> Self {
        Self::Aggregate {
            descriptor: descriptor.into(),
            source: Box::new(source),
        }
    }

    /// Returns the innermost error, looking through aggregate wrappers.
    pub fn root_cause(&self) -> &Error {
        match self {
            Self::Aggregate { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        // The request URL carries the API token in its query string.
        let err = err.without_url();
        if err.is_decode() {
            Self::Api(err.to_string())
        } else {
            Self::Connectivity(err.to_string())
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Api(format!("invalid json payload: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_names_descriptor_and_wraps_source() {
        let err = Error::aggregate("BLACK", Error::Connectivity("connection refused".into()));
        assert_eq!(
            err.to_string(),
            "sub-query BLACK failed: connectivity error: connection refused"
        );
        assert_eq!(
            err.root_cause(),
            &Error::Connectivity("connection refused".into())
        );
    }

    #[test]
    fn json_errors_are_api_errors() {
        let err: Error = serde_json::from_str::<u32>("not json")
            .expect_err("should fail")
            .into();
        assert!(matches!(err, Error::Api(_)));
    }
}
