//! Trace context capture and restoration.
//!
//! The outbox captures the ambient trace context when a message is
//! enqueued, persists it alongside the row and restores it just before the
//! message is handed to the transport, so the original request trace
//! continues across the asynchronous delivery boundary. The ids are opaque
//! to the outbox.

use std::sync::Arc;

use outbox_core::TraceContext;
use tracing::debug;

/// Supplies the current trace context at enqueue time.
pub trait TraceContextProvider: Send + Sync {
    /// Returns the ambient trace context, if one is active.
    fn current_context(&self) -> Option<TraceContext>;
}

/// Restores a persisted trace context before transmission.
pub trait TraceContextUpdater: Send + Sync {
    /// Makes the given context the current one.
    fn set_current_context(&self, context: &TraceContext);
}

/// Capture/restore facade over the optional tracing collaborators.
///
/// Both collaborators are optional; without them capture returns `None`
/// and restore is a no-op.
#[derive(Clone, Default)]
pub struct OutboxTracing {
    provider: Option<Arc<dyn TraceContextProvider>>,
    updater: Option<Arc<dyn TraceContextUpdater>>,
}

impl OutboxTracing {
    /// Creates a tracing facade with the given collaborators.
    pub fn new(
        provider: Option<Arc<dyn TraceContextProvider>>,
        updater: Option<Arc<dyn TraceContextUpdater>>,
    ) -> Self {
        Self { provider, updater }
    }

    /// A facade with no tracing configured.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Captures the current trace context for persistence.
    pub fn capture(&self) -> Option<TraceContext> {
        let Some(provider) = &self.provider else {
            debug!("no tracing information available (no trace context provider configured)");
            return None;
        };
        let context = provider.current_context();
        if context.is_none() {
            debug!("no tracing information available (no active trace context)");
        }
        context
    }

    /// Restores the context stored on a message before transmission.
    pub fn restore(&self, context: Option<&TraceContext>) {
        if let (Some(updater), Some(context)) = (&self.updater, context) {
            debug!(
                trace_id = context.trace_id_string.as_deref().unwrap_or_default(),
                "restoring trace context from deferred message"
            );
            updater.set_current_context(context);
        }
    }
}

impl std::fmt::Debug for OutboxTracing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboxTracing")
            .field("provider", &self.provider.is_some())
            .field("updater", &self.updater.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    struct FixedProvider(TraceContext);

    impl TraceContextProvider for FixedProvider {
        fn current_context(&self) -> Option<TraceContext> {
            Some(self.0.clone())
        }
    }

    #[derive(Default)]
    struct RecordingUpdater(Mutex<Vec<TraceContext>>);

    impl TraceContextUpdater for RecordingUpdater {
        fn set_current_context(&self, context: &TraceContext) {
            self.0.lock().unwrap().push(context.clone());
        }
    }

    #[test]
    fn capture_without_provider_returns_none() {
        assert!(OutboxTracing::disabled().capture().is_none());
    }

    #[test]
    fn capture_and_restore_round_trip() {
        let context = TraceContext {
            trace_id: Some(7),
            span_id: Some(9),
            trace_id_string: Some("abc123".to_string()),
            ..TraceContext::default()
        };
        let updater = Arc::new(RecordingUpdater::default());
        let tracing = OutboxTracing::new(
            Some(Arc::new(FixedProvider(context.clone()))),
            Some(updater.clone()),
        );

        let captured = tracing.capture().unwrap();
        assert_eq!(captured, context);

        tracing.restore(Some(&captured));
        assert_eq!(updater.0.lock().unwrap().as_slice(), &[context]);
    }

    #[test]
    fn restore_without_updater_is_noop() {
        let tracing = OutboxTracing::disabled();
        tracing.restore(Some(&TraceContext::default()));
    }
}
