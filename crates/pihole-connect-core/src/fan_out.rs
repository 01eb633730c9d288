// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Parallel sub-queries merged into one ordered result.
//!
//! Sub-queries complete in any order; the merged output always follows the
//! descriptors' order keys. The aggregate is all-or-nothing: the first failure
//! observed aborts the siblings still running and fails the whole call.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;

use tokio::task::{Id, JoinSet};
use tracing::{debug, error, warn};

use crate::errors::Error;

/// One unit of fan-out work and the key its items are merged by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubQueryDescriptor<K> {
    pub key: K,
    pub order: usize,
}

impl<K> SubQueryDescriptor<K> {
    /// Descriptors ordered as given.
    pub fn sequence(keys: impl IntoIterator<Item = K>) -> Vec<Self> {
        keys.into_iter()
            .enumerate()
            .map(|(order, key)| Self { key, order })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct FanOutAggregator<K> {
    descriptors: Vec<SubQueryDescriptor<K>>,
}

impl<K> FanOutAggregator<K>
where
    K: Display + Clone + Send + 'static,
{
    pub fn new(descriptors: Vec<SubQueryDescriptor<K>>) -> Self {
        Self { descriptors }
    }

    pub fn descriptors(&self) -> &[SubQueryDescriptor<K>] {
        &self.descriptors
    }

    /// Runs `fetch` for every descriptor concurrently and concatenates the
    /// results in descriptor order.
    pub async fn aggregate<I, F, Fut>(&self, fetch: F) -> Result<Vec<I>, Error>
    where
        I: Send + 'static,
        F: Fn(K) -> Fut,
        Fut: Future<Output = Result<Vec<I>, Error>> + Send + 'static,
    {
        let mut tasks = JoinSet::new();
        let mut slots: HashMap<Id, usize> = HashMap::with_capacity(self.descriptors.len());
        for (slot, descriptor) in self.descriptors.iter().enumerate() {
            let handle = tasks.spawn(fetch(descriptor.key.clone()));
            slots.insert(handle.id(), slot);
        }

        let mut completed: Vec<Option<Vec<I>>> =
            std::iter::repeat_with(|| None).take(self.descriptors.len()).collect();
        while let Some(joined) = tasks.join_next_with_id().await {
            let id = match &joined {
                Ok((id, _)) => *id,
                Err(err) => err.id(),
            };
            let Some(&slot) = slots.get(&id) else {
                tasks.abort_all();
                return Err(Error::Interrupted(format!("unknown sub-query task {id}")));
            };
            match joined {
                Ok((_, Ok(items))) => {
                    debug!(
                        descriptor = %self.descriptors[slot].key,
                        items = items.len(),
                        "sub-query completed"
                    );
                    completed[slot] = Some(items);
                }
                Ok((_, Err(err))) => {
                    let descriptor = &self.descriptors[slot].key;
                    warn!(%descriptor, "sub-query failed, cancelling {} siblings: {err}", tasks.len());
                    tasks.abort_all();
                    return Err(Error::aggregate(descriptor.to_string(), err));
                }
                Err(err) => {
                    let descriptor = &self.descriptors[slot].key;
                    error!(%descriptor, "sub-query task failed: {err}");
                    tasks.abort_all();
                    return Err(Error::aggregate(
                        descriptor.to_string(),
                        Error::Interrupted(err.to_string()),
                    ));
                }
            }
        }

        let mut ordered: Vec<(usize, Vec<I>)> = self
            .descriptors
            .iter()
            .zip(completed)
            .map(|(descriptor, items)| (descriptor.order, items.unwrap_or_default()))
            .collect();
        ordered.sort_by_key(|(order, _)| *order);
        Ok(ordered.into_iter().flat_map(|(_, items)| items).collect())
    }
}
