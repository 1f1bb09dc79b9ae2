// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Pub/sub with short-lived durable payloads.
//!
//! Publishing stores the payload under `fluxmsg:{id}` with a TTL, then
//! publishes only the id on `flux:{channel}`. Subscribers fetch the payload
//! by id, so a message stays readable for the TTL even if the subscriber
//! was slow to pick the id up. Ids whose payload already expired are
//! dropped.

use std::sync::Arc;

use futures::StreamExt;
use tracing::debug;

use crate::keys;
use crate::metrics;
use crate::storage::{KvOp, KvStore, MessageStream, StorageError};

pub struct FluxBus {
    store: Arc<dyn KvStore>,
    channel: String,
    ttl_secs: u64,
}

impl FluxBus {
    pub fn new(store: Arc<dyn KvStore>, channel: &str, ttl_secs: u64) -> Self {
        Self {
            store,
            channel: keys::flux_channel(channel),
            ttl_secs: ttl_secs.max(1),
        }
    }

    /// Full pub/sub channel name (`flux:{name}`).
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Store the payload, then announce its id. Returns the message id.
    pub async fn publish(&self, payload: &str) -> Result<String, StorageError> {
        let id = uuid::Uuid::new_v4().to_string();
        self.store
            .apply(&[KvOp::SetWithTtl {
                key: keys::flux_message(&id),
                value: payload.to_string(),
                ttl_secs: self.ttl_secs,
            }])
            .await?;
        self.store.publish(&self.channel, &id).await?;
        metrics::record_flux_message("published");
        Ok(id)
    }

    /// Payloads published after this call, in publish order.
    pub async fn subscribe(&self) -> Result<MessageStream, StorageError> {
        let ids = self.store.subscribe(&self.channel).await?;
        let store = self.store.clone();
        let payloads = ids.filter_map(move |id| {
            let store = store.clone();
            async move {
                match store.get(&keys::flux_message(&id)).await {
                    Ok(Some(payload)) => Some(payload),
                    Ok(None) => {
                        debug!(id = %id, "Flux payload expired before it was read");
                        metrics::record_flux_message("expired");
                        None
                    }
                    Err(e) => {
                        debug!(id = %id, error = %e, "Flux payload fetch failed");
                        None
                    }
                }
            }
        });
        Ok(payloads.boxed())
    }
}
