//! Core domain models for deferred messages.
//!
//! Defines the deferred message entity, its readiness predicate, the send
//! failure classification and the trace context carried alongside each row.
//! Includes database serialization impls for the PostgreSQL store.

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

type PgDb = sqlx::Postgres;
type PgRow = sqlx::postgres::PgRow;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Classification of a message send failure.
///
/// Each variant is either caused by the message itself (permanent, the
/// message is marked failed and never retried automatically) or by the
/// infrastructure (transient, the message stays ready and the current
/// delivery batch is aborted).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendFailureReason {
    /// The target topic does not exist or its name is illegal.
    InvalidTopic,

    /// The producer is not authorized to publish on the target topic.
    UnauthorizedOnTopic,

    /// The serialized message exceeds the transport's size limit.
    MessageTooLarge,

    /// Any infrastructure failure: broker unreachable, send timeout,
    /// unknown cluster. Never marks the message failed.
    General,
}

impl SendFailureReason {
    /// Whether the failure is attributable to the message itself.
    ///
    /// Message-caused failures are absorbed into persistent state as
    /// `failed_at`/`fail_reason`; everything else defers the message to a
    /// later delivery attempt.
    pub const fn caused_by_message(self) -> bool {
        matches!(self, Self::InvalidTopic | Self::UnauthorizedOnTopic | Self::MessageTooLarge)
    }
}

impl fmt::Display for SendFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidTopic => write!(f, "invalid_topic"),
            Self::UnauthorizedOnTopic => write!(f, "unauthorized_on_topic"),
            Self::MessageTooLarge => write!(f, "message_too_large"),
            Self::General => write!(f, "general"),
        }
    }
}

impl sqlx::Type<PgDb> for SendFailureReason {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for SendFailureReason {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        match s {
            "invalid_topic" => Ok(Self::InvalidTopic),
            "unauthorized_on_topic" => Ok(Self::UnauthorizedOnTopic),
            "message_too_large" => Ok(Self::MessageTooLarge),
            "general" => Ok(Self::General),
            _ => Err(format!("invalid send failure reason: {s}").into()),
        }
    }
}

impl sqlx::Encode<'_, PgDb> for SendFailureReason {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <String as sqlx::Encode<PgDb>>::encode_by_ref(&self.to_string(), buf)
    }
}

/// Opaque tracing correlation ids captured at enqueue time.
///
/// Propagated to the transport before transmission so the original request
/// trace continues across the asynchronous delivery boundary. The outbox
/// never interprets these values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext {
    /// High 64 bits of a 128-bit trace id.
    pub trace_id_high: Option<i64>,
    /// Trace id (low 64 bits).
    pub trace_id: Option<i64>,
    /// Span id of the enqueuing operation.
    pub span_id: Option<i64>,
    /// Parent span id, if any.
    pub parent_span_id: Option<i64>,
    /// Printable trace id for log correlation.
    pub trace_id_string: Option<String>,
}

/// A message awaiting or having completed delivery.
///
/// The sole persistent entity of the outbox. Created inside the caller's
/// transaction, mutated by the post-commit sender, the relay and the resend
/// trigger, and finally removed by housekeeping.
///
/// # State invariants
///
/// - At most one of `sent_immediately_at` / `sent_scheduled_at` is set.
/// - `fail_reason` is set iff `failed_at` is set.
/// - `id` is assigned by the store, monotonically increasing, never reused;
///   it is the relay's delivery ordering key.
#[derive(Debug, Clone, PartialEq)]
pub struct DeferredMessage {
    /// Store-assigned sequence id; the relay ordering key.
    pub id: i64,

    /// Serialized message payload, opaque to the outbox.
    pub payload: Vec<u8>,

    /// Serialized routing key, if the message was enqueued with one.
    pub key: Option<Vec<u8>>,

    /// Name of the transport cluster to deliver to.
    ///
    /// When absent or unknown the sender provider falls back to the default
    /// producer cluster.
    pub cluster_name: Option<String>,

    /// Destination topic.
    pub topic: String,

    /// Domain message id, opaque to the outbox.
    pub message_id: String,

    /// Domain idempotence id, opaque to the outbox.
    pub message_idempotence_id: String,

    /// Name of the domain message type.
    pub message_type_name: String,

    /// Version of the domain message type, if the type is versioned.
    pub message_type_version: Option<String>,

    /// When the message was enqueued.
    pub created_at: DateTime<Utc>,

    /// Whether delivery was requested immediately after commit.
    pub send_immediately: bool,

    /// Earliest instant the relay may attempt delivery.
    ///
    /// Set just before commit for immediate messages so the relay cannot
    /// race an in-flight post-commit send attempt.
    pub schedule_after: Option<DateTime<Utc>>,

    /// When the post-commit sender delivered the message.
    pub sent_immediately_at: Option<DateTime<Utc>>,

    /// When the relay delivered the message.
    pub sent_scheduled_at: Option<DateTime<Utc>>,

    /// When a message-caused send failure was recorded.
    pub failed_at: Option<DateTime<Utc>>,

    /// Why the message failed; set iff `failed_at` is set.
    pub fail_reason: Option<SendFailureReason>,

    /// Explicit resend request; overrides all other readiness conditions.
    pub resend: bool,

    /// Tracing correlation ids captured at enqueue time, if a tracing
    /// provider was configured.
    pub trace_context: Option<TraceContext>,
}

impl DeferredMessage {
    /// Whether the message is eligible for a delivery attempt at `now`.
    ///
    /// A message is ready iff it has not been sent on either path, has not
    /// failed, and is either a scheduled message or an immediate message
    /// whose post-commit safety delay has elapsed. A `resend` request makes
    /// the message ready regardless of any other state.
    ///
    /// An immediate message with no `schedule_after` yet is not ready: the
    /// delay is written in the enqueuing transaction, so the value can only
    /// be missing while that transaction is still open.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        let unsent = self.sent_immediately_at.is_none()
            && self.sent_scheduled_at.is_none()
            && self.failed_at.is_none();
        let due = !self.send_immediately || self.schedule_after.is_some_and(|after| now > after);
        (unsent && due) || self.resend
    }

    /// Whether the message was delivered on either path.
    pub fn is_sent(&self) -> bool {
        self.sent_immediately_at.is_some() || self.sent_scheduled_at.is_some()
    }

    /// Payload as [`Bytes`] for zero-copy hand-off to a transport client.
    pub fn payload_bytes(&self) -> Bytes {
        Bytes::from(self.payload.clone())
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for DeferredMessage {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;

        let trace_id_high: Option<i64> = row.try_get("trace_id_high")?;
        let trace_id: Option<i64> = row.try_get("trace_id")?;
        let span_id: Option<i64> = row.try_get("span_id")?;
        let parent_span_id: Option<i64> = row.try_get("parent_span_id")?;
        let trace_id_string: Option<String> = row.try_get("trace_id_string")?;

        let trace_context = if trace_id_high.is_none()
            && trace_id.is_none()
            && span_id.is_none()
            && parent_span_id.is_none()
            && trace_id_string.is_none()
        {
            None
        } else {
            Some(TraceContext {
                trace_id_high,
                trace_id,
                span_id,
                parent_span_id,
                trace_id_string,
            })
        };

        Ok(Self {
            id: row.try_get("id")?,
            payload: row.try_get("payload")?,
            key: row.try_get("message_key")?,
            cluster_name: row.try_get("cluster_name")?,
            topic: row.try_get("topic")?,
            message_id: row.try_get("message_id")?,
            message_idempotence_id: row.try_get("message_idempotence_id")?,
            message_type_name: row.try_get("message_type_name")?,
            message_type_version: row.try_get("message_type_version")?,
            created_at: row.try_get("created_at")?,
            send_immediately: row.try_get("send_immediately")?,
            schedule_after: row.try_get("schedule_after")?,
            sent_immediately_at: row.try_get("sent_immediately_at")?,
            sent_scheduled_at: row.try_get("sent_scheduled_at")?,
            failed_at: row.try_get("failed_at")?,
            fail_reason: row.try_get("fail_reason")?,
            resend: row.try_get("resend")?,
            trace_context,
        })
    }
}

/// Insert value for a new deferred message.
///
/// The store assigns `id` and the remaining lifecycle columns start out
/// empty (`schedule_after`, both sent timestamps, failure state, `resend`).
#[derive(Debug, Clone)]
pub struct NewDeferredMessage {
    /// Serialized message payload.
    pub payload: Vec<u8>,
    /// Serialized routing key, if any.
    pub key: Option<Vec<u8>>,
    /// Target cluster name, if pinned to one.
    pub cluster_name: Option<String>,
    /// Destination topic.
    pub topic: String,
    /// Domain message id.
    pub message_id: String,
    /// Domain idempotence id.
    pub message_idempotence_id: String,
    /// Domain message type name.
    pub message_type_name: String,
    /// Domain message type version, if versioned.
    pub message_type_version: Option<String>,
    /// When the message was enqueued.
    pub created_at: DateTime<Utc>,
    /// Whether post-commit immediate delivery was requested.
    pub send_immediately: bool,
    /// Tracing correlation ids captured at enqueue time.
    pub trace_context: Option<TraceContext>,
}

/// Projection of a permanently failed message.
///
/// Returned by the failed-message query API so operators can inspect and
/// selectively resend failures without loading payload bytes.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct FailedMessage {
    /// Deferred message id.
    pub id: i64,
    /// Destination topic.
    pub topic: String,
    /// Domain message id.
    pub message_id: String,
    /// Domain idempotence id.
    pub message_idempotence_id: String,
    /// Domain message type name.
    pub message_type_name: String,
    /// When the message was enqueued.
    pub created_at: DateTime<Utc>,
    /// When the failure was recorded.
    pub failed_at: DateTime<Utc>,
    /// Failure classification.
    pub fail_reason: SendFailureReason,
    /// Whether the message is currently marked for resend.
    pub resend: bool,
}

impl FailedMessage {
    /// Builds the projection from a full row.
    ///
    /// Returns `None` when the message has no recorded failure.
    pub fn from_deferred(message: &DeferredMessage) -> Option<Self> {
        let failed_at = message.failed_at?;
        let fail_reason = message.fail_reason?;
        Some(Self {
            id: message.id,
            topic: message.topic.clone(),
            message_id: message.message_id.clone(),
            message_idempotence_id: message.message_idempotence_id.clone(),
            message_type_name: message.message_type_name.clone(),
            created_at: message.created_at,
            failed_at,
            fail_reason,
            resend: message.resend,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn base_message() -> DeferredMessage {
        DeferredMessage {
            id: 1,
            payload: b"payload".to_vec(),
            key: None,
            cluster_name: None,
            topic: "topic".to_string(),
            message_id: "m-1".to_string(),
            message_idempotence_id: "i-1".to_string(),
            message_type_name: "TestEvent".to_string(),
            message_type_version: Some("1.2.0".to_string()),
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            send_immediately: false,
            schedule_after: None,
            sent_immediately_at: None,
            sent_scheduled_at: None,
            failed_at: None,
            fail_reason: None,
            resend: false,
            trace_context: None,
        }
    }

    #[test]
    fn scheduled_message_is_ready_without_schedule_after() {
        let message = base_message();
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 1).unwrap();
        assert!(message.is_ready(now));
    }

    #[test]
    fn immediate_message_not_ready_until_schedule_after_elapsed() {
        let mut message = base_message();
        message.send_immediately = true;
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 30).unwrap();

        // Delay not yet written: not ready.
        assert!(!message.is_ready(now));

        message.schedule_after = Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, 1, 0).unwrap());
        assert!(!message.is_ready(now));

        let later = Utc.with_ymd_and_hms(2024, 5, 1, 12, 1, 1).unwrap();
        assert!(message.is_ready(later));
    }

    #[test]
    fn sent_or_failed_message_is_not_ready() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 13, 0, 0).unwrap();

        let mut sent = base_message();
        sent.sent_scheduled_at = Some(now);
        assert!(!sent.is_ready(now));

        let mut failed = base_message();
        failed.failed_at = Some(now);
        failed.fail_reason = Some(SendFailureReason::InvalidTopic);
        assert!(!failed.is_ready(now));
    }

    #[test]
    fn resend_overrides_all_other_readiness_conditions() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 13, 0, 0).unwrap();
        let mut message = base_message();
        message.failed_at = Some(now);
        message.fail_reason = Some(SendFailureReason::UnauthorizedOnTopic);
        message.resend = true;
        assert!(message.is_ready(now));
    }

    #[test]
    fn failure_reasons_classified() {
        assert!(SendFailureReason::InvalidTopic.caused_by_message());
        assert!(SendFailureReason::UnauthorizedOnTopic.caused_by_message());
        assert!(SendFailureReason::MessageTooLarge.caused_by_message());
        assert!(!SendFailureReason::General.caused_by_message());
    }

    #[test]
    fn failure_reason_display_format() {
        assert_eq!(SendFailureReason::InvalidTopic.to_string(), "invalid_topic");
        assert_eq!(SendFailureReason::UnauthorizedOnTopic.to_string(), "unauthorized_on_topic");
        assert_eq!(SendFailureReason::MessageTooLarge.to_string(), "message_too_large");
        assert_eq!(SendFailureReason::General.to_string(), "general");
    }

    #[test]
    fn failed_message_projection_requires_failure_state() {
        let mut message = base_message();
        assert!(FailedMessage::from_deferred(&message).is_none());

        message.failed_at = Some(Utc.with_ymd_and_hms(2024, 5, 2, 8, 0, 0).unwrap());
        message.fail_reason = Some(SendFailureReason::MessageTooLarge);
        let failed = FailedMessage::from_deferred(&message).unwrap();
        assert_eq!(failed.id, message.id);
        assert_eq!(failed.fail_reason, SendFailureReason::MessageTooLarge);
        assert!(!failed.resend);
    }
}
