//! Gateway wire format.
//!
//! Platform adapters talk to the daemon over a byte stream carrying one JSON
//! object per line. Adapters send [`GatewayEvent`]s; the daemon answers with
//! [`GatewayAction`]s. Both are tagged by a `"type"` field.

use crate::types::{AttachmentKind, InboundMessage, MessageRef, ParticipantId, RelayPayload};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum accepted line length in bytes, newline excluded.
pub const MAX_LINE_LEN: usize = 1_048_576;

/// Errors from decoding a gateway line.
#[derive(Error, Debug)]
pub enum WireError {
    /// The line exceeds [`MAX_LINE_LEN`].
    #[error("line exceeds maximum length ({0} bytes)")]
    TooLong(usize),
    /// The line is not valid JSON for the expected type.
    #[error("malformed line: {0}")]
    Json(#[from] serde_json::Error),
}

/// Adapter → daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayEvent {
    /// A message or command sent by a participant.
    Message {
        /// Sender id.
        from: ParticipantId,
        /// Adapter handle for the message.
        #[serde(rename = "ref")]
        message_ref: MessageRef,
        /// Text body; a leading `/` marks a command.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        /// Attachment kind, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attachment: Option<AttachmentKind>,
        /// Attachment caption, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
    /// The adapter could not carry out an earlier action.
    DeliveryFailed {
        /// Which action failed.
        kind: FailedAction,
        /// `ref` of the message the action carried.
        #[serde(rename = "ref")]
        message_ref: MessageRef,
        /// Platform error text.
        #[serde(default)]
        reason: String,
    },
    /// Liveness check.
    Ping,
}

/// Action kinds an adapter can report as failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailedAction {
    /// A [`GatewayAction::Mirror`].
    Mirror,
    /// A [`GatewayAction::Relay`].
    Relay,
}

impl GatewayEvent {
    /// Decode a single line (trailing newline tolerated).
    ///
    /// # Errors
    ///
    /// Returns [`WireError`] if the line is too long or not a valid event.
    pub fn parse(line: &str) -> Result<Self, WireError> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.len() > MAX_LINE_LEN {
            return Err(WireError::TooLong(MAX_LINE_LEN));
        }
        Ok(serde_json::from_str(line)?)
    }

    /// Convert a `Message` event into an [`InboundMessage`].
    #[must_use]
    pub fn into_inbound(self) -> Option<InboundMessage> {
        match self {
            GatewayEvent::Message {
                from,
                message_ref,
                text,
                attachment,
                caption,
            } => Some(InboundMessage {
                sender: from,
                message_ref,
                text,
                attachment,
                caption,
            }),
            GatewayEvent::DeliveryFailed { .. } | GatewayEvent::Ping => None,
        }
    }
}

/// Daemon → adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayAction {
    /// Send plain text to a participant.
    DeliverText {
        /// Recipient.
        to: ParticipantId,
        /// Text to send.
        text: String,
    },
    /// Copy a message to a partner without attribution.
    Relay {
        /// Recipient.
        to: ParticipantId,
        /// What to copy.
        #[serde(flatten)]
        payload: RelayPayload,
    },
    /// Forward a media message to the monitoring destination.
    Mirror {
        /// Monitoring chat id.
        to: i64,
        /// Message to forward.
        #[serde(rename = "ref")]
        message_ref: MessageRef,
    },
    /// Operational notice for one administrator.
    NotifyAdmin {
        /// Administrator id.
        to: ParticipantId,
        /// Notice text.
        text: String,
    },
    /// Reply to [`GatewayEvent::Ping`].
    Pong,
    /// The previous line could not be processed.
    Error {
        /// Human-readable reason.
        error: String,
    },
}

impl GatewayAction {
    /// Encode as one line, newline included.
    #[must_use]
    pub fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"type":"error","error":"encode failed: {e}"}}"#)
        });
        line.push('\n');
        line
    }

    /// Recipient participant, for actions addressed to one.
    #[must_use]
    pub fn recipient(&self) -> Option<ParticipantId> {
        match self {
            GatewayAction::DeliverText { to, .. }
            | GatewayAction::Relay { to, .. }
            | GatewayAction::NotifyAdmin { to, .. } => Some(*to),
            GatewayAction::Mirror { .. } | GatewayAction::Pong | GatewayAction::Error { .. } => {
                None
            }
        }
    }
}
