//! Common types shared by the tandem pairing relay and its platform adapters.
//!
//! This crate provides:
//! - Participant, message and status value types ([`types`])
//! - Slash-command parsing ([`command`])
//! - The line-delimited JSON gateway protocol ([`wire`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod command;
pub mod types;
pub mod wire;

pub use command::Command;
pub use types::{AttachmentKind, InboundMessage, MessageRef, ParticipantId, RelayPayload, Status};
