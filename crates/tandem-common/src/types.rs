//! Core value types for the pairing relay.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque platform user identifier. The relay keeps no other identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(pub i64);

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for ParticipantId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Adapter-assigned handle for an inbound platform message.
///
/// The adapter uses it to copy or forward the original message. It never
/// encodes who sent the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageRef(pub u64);

/// Media attachment carried by a message. Every kind is mirrored to the
/// monitoring destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    /// Still image.
    Photo,
    /// Video clip.
    Video,
    /// Audio file.
    Audio,
    /// Voice note.
    Voice,
    /// Arbitrary file.
    Document,
    /// Sticker.
    Sticker,
}

/// A non-command message received from a participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Who sent it.
    pub sender: ParticipantId,
    /// Handle the adapter can use to copy the message.
    pub message_ref: MessageRef,
    /// Message body, if any.
    pub text: Option<String>,
    /// Attachment, if any.
    pub attachment: Option<AttachmentKind>,
    /// Attachment caption, if any.
    pub caption: Option<String>,
}

impl InboundMessage {
    /// Returns `true` if the message carries media that must be mirrored.
    #[must_use]
    pub fn is_monitorable(&self) -> bool {
        self.attachment.is_some()
    }

    /// Strip the sender and keep only what the partner may see.
    #[must_use]
    pub fn to_payload(&self) -> RelayPayload {
        RelayPayload {
            message_ref: self.message_ref,
            text: self.text.clone(),
            attachment: self.attachment,
            caption: self.caption.clone(),
        }
    }
}

/// Content delivered to a partner. Carries no sender field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayPayload {
    /// Source message handle.
    #[serde(rename = "ref")]
    pub message_ref: MessageRef,
    /// Message body, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Attachment kind, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<AttachmentKind>,
    /// Attachment caption, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
}

/// Where a participant currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Neither waiting nor paired.
    Idle,
    /// In the waiting queue.
    Waiting,
    /// In a session with a partner.
    Paired,
}
