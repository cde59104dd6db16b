use crate::error::DeliveryError;
use crate::metrics::HealthState;
use async_trait::async_trait;
use std::sync::Arc;
use tandem_common::wire::GatewayAction;
use tandem_common::{MessageRef, ParticipantId, RelayPayload};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// Outbound capabilities the relay core needs from the transport.
///
/// Implementations may be slow; callers never hold registry state across
/// these calls.
#[async_trait]
pub trait NotificationPort: Send + Sync {
    /// Send plain text to one participant.
    async fn deliver_text(&self, to: ParticipantId, text: &str) -> Result<(), DeliveryError>;

    /// Copy a message to a partner without attributing it.
    async fn relay_message(
        &self,
        to: ParticipantId,
        payload: &RelayPayload,
    ) -> Result<(), DeliveryError>;

    /// Forward a media message to the monitoring destination.
    async fn mirror_to_monitor(&self, message_ref: MessageRef) -> Result<(), DeliveryError>;

    /// Send an operational notice to every administrator.
    async fn notify_admins(&self, text: &str) -> Result<(), DeliveryError>;
}

/// Outbound actions shared by every attached gateway writer. Whichever
/// writer holds the lock takes the next action, so each action leaves
/// through exactly one gateway.
pub type ActionQueue = Arc<Mutex<mpsc::Receiver<GatewayAction>>>;

/// [`NotificationPort`] that queues [`GatewayAction`]s for the attached
/// gateway adapters.
#[derive(Debug, Clone)]
pub struct GatewayPort {
    tx: mpsc::Sender<GatewayAction>,
    health: HealthState,
    monitor_chat: i64,
    admins: Vec<ParticipantId>,
}

impl GatewayPort {
    /// Port with room for `capacity` pending actions, mirroring to
    /// `monitor_chat`. `health` tells whether any gateway is attached.
    #[must_use]
    pub fn new(
        capacity: usize,
        health: HealthState,
        monitor_chat: i64,
        admins: Vec<ParticipantId>,
    ) -> (Self, ActionQueue) {
        let (tx, rx) = mpsc::channel(capacity);
        let port = Self {
            tx,
            health,
            monitor_chat,
            admins,
        };
        (port, Arc::new(Mutex::new(rx)))
    }

    fn publish(&self, action: GatewayAction) -> Result<(), DeliveryError> {
        if !self.health.is_ready() {
            return Err(DeliveryError::Unavailable);
        }
        self.tx.try_send(action).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::Rejected("gateway backlog full".to_string()),
            TrySendError::Closed(_) => DeliveryError::Unavailable,
        })
    }
}

#[async_trait]
impl NotificationPort for GatewayPort {
    async fn deliver_text(&self, to: ParticipantId, text: &str) -> Result<(), DeliveryError> {
        self.publish(GatewayAction::DeliverText {
            to,
            text: text.to_string(),
        })
    }

    async fn relay_message(
        &self,
        to: ParticipantId,
        payload: &RelayPayload,
    ) -> Result<(), DeliveryError> {
        self.publish(GatewayAction::Relay {
            to,
            payload: payload.clone(),
        })
    }

    async fn mirror_to_monitor(&self, message_ref: MessageRef) -> Result<(), DeliveryError> {
        self.publish(GatewayAction::Mirror {
            to: self.monitor_chat,
            message_ref,
        })
    }

    async fn notify_admins(&self, text: &str) -> Result<(), DeliveryError> {
        if self.admins.is_empty() {
            debug!("no administrators configured, dropping notice");
            return Ok(());
        }
        let text = format!("[ADMIN]\n{text}");
        let mut result = Ok(());
        for admin in &self.admins {
            let sent = self.publish(GatewayAction::NotifyAdmin {
                to: *admin,
                text: text.clone(),
            });
            if result.is_ok() {
                result = sent;
            }
        }
        result
    }
}
