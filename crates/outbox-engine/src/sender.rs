//! Message sender contract and cluster-scoped sender resolution.
//!
//! The wire-level transport client is a collaborator; this module defines
//! its contract and the registry that picks the right sender for a
//! message's target cluster.

use std::{collections::HashMap, sync::Arc};

use outbox_core::{storage::BoxFuture, DeferredMessage};
use tracing::debug;

use crate::error::{OutboxError, Result, SendError};

/// Sends serialized messages to the transport.
///
/// The two methods correspond to the two timeout profiles: `send_immediate`
/// runs in the committing task and must give up quickly, `send_scheduled`
/// runs in the relay and may wait longer for a slow transport. The engine
/// additionally bounds each call with the configured profile duration;
/// exceeding it counts as an infrastructure failure.
pub trait MessageSender: Send + Sync {
    /// Sends with the immediate (short) timeout profile.
    fn send_immediate<'a>(
        &'a self,
        message: &'a DeferredMessage,
    ) -> BoxFuture<'a, std::result::Result<(), SendError>>;

    /// Sends with the scheduled (long) timeout profile.
    fn send_scheduled<'a>(
        &'a self,
        message: &'a DeferredMessage,
    ) -> BoxFuture<'a, std::result::Result<(), SendError>>;
}

/// Runs one send attempt under the profile's time budget.
///
/// Exceeding the budget is an infrastructure failure
/// ([`SendFailureReason::General`](outbox_core::SendFailureReason::General)):
/// the in-flight attempt may still complete, so the message must not be
/// marked failed.
pub(crate) async fn transmit(
    sender: &dyn MessageSender,
    message: &DeferredMessage,
    delivery: crate::metrics::DeliveryType,
    budget: std::time::Duration,
) -> std::result::Result<(), SendError> {
    let send = match delivery {
        crate::metrics::DeliveryType::Immediate => sender.send_immediate(message),
        crate::metrics::DeliveryType::Scheduled => sender.send_scheduled(message),
    };

    match tokio::time::timeout(budget, send).await {
        Ok(result) => result,
        Err(_) => Err(SendError::timed_out(&message.topic, budget)),
    }
}

/// Resolves the sender for a message's target cluster.
///
/// A plain name-to-sender registry built at startup. Construction fails
/// fast when no sender exists for the default producer cluster: the system
/// cannot function without it.
pub struct SenderProvider {
    senders: HashMap<String, Arc<dyn MessageSender>>,
    default_cluster_name: String,
    default_sender: Arc<dyn MessageSender>,
}

impl SenderProvider {
    /// Creates a provider from the configured senders.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::MissingDefaultClusterSender`] when `senders`
    /// has no entry for `default_cluster_name`.
    pub fn new(
        default_cluster_name: impl Into<String>,
        senders: HashMap<String, Arc<dyn MessageSender>>,
    ) -> Result<Self> {
        let default_cluster_name = default_cluster_name.into();
        let default_sender = senders
            .get(&default_cluster_name)
            .cloned()
            .ok_or_else(|| OutboxError::MissingDefaultClusterSender {
                cluster_name: default_cluster_name.clone(),
            })?;

        Ok(Self { senders, default_cluster_name, default_sender })
    }

    /// Creates a provider with a single cluster.
    pub fn single(
        cluster_name: impl Into<String>,
        sender: Arc<dyn MessageSender>,
    ) -> Self {
        let cluster_name = cluster_name.into();
        let mut senders: HashMap<String, Arc<dyn MessageSender>> = HashMap::new();
        senders.insert(cluster_name.clone(), sender.clone());
        Self { senders, default_cluster_name: cluster_name, default_sender: sender }
    }

    /// Name of the default producer cluster.
    pub fn default_cluster_name(&self) -> &str {
        &self.default_cluster_name
    }

    /// Resolves the sender for the given message.
    ///
    /// Returns the sender registered for the message's cluster, or the
    /// default producer cluster's sender when the message names no cluster
    /// or an unknown one.
    pub fn resolve(&self, message: &DeferredMessage) -> Arc<dyn MessageSender> {
        let Some(cluster_name) =
            message.cluster_name.as_deref().filter(|name| !name.is_empty())
        else {
            return self.default_sender.clone();
        };

        match self.senders.get(cluster_name) {
            Some(sender) => sender.clone(),
            None => {
                debug!(
                    cluster_name,
                    deferred_message_id = message.id,
                    default_cluster = %self.default_cluster_name,
                    "unknown cluster name on deferred message, using default producer cluster"
                );
                self.default_sender.clone()
            },
        }
    }
}

impl std::fmt::Debug for SenderProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SenderProvider")
            .field("clusters", &self.senders.keys().collect::<Vec<_>>())
            .field("default_cluster_name", &self.default_cluster_name)
            .finish()
    }
}
