use crate::config::ServerConfig;
use crate::metrics::counters;
use crate::notify::NotificationPort;
use crate::registry::{MatchRegistry, RelayTarget};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};
use tandem_common::command::Parsed;
use tandem_common::wire::FailedAction;
use tandem_common::{Command, InboundMessage, MessageRef, ParticipantId, Status};
use tracing::{debug, info, warn};

/// User-facing notice texts.
pub mod notices {
    /// Command overview, sent after most replies.
    pub const MENU: &str = "Anonymous Bot Activated\n\
        /anon_start - Find partner\n\
        /anon_next - Next partner\n\
        /anon_stop - Stop chat\n\
        /status - Chat status";
    /// Both sides of a fresh pair.
    pub const PARTNER_CONNECTED: &str = "Partner connected.";
    /// Both sides of a pair formed by `/anon_next`.
    pub const NEW_PARTNER_CONNECTED: &str = "New partner connected.";
    /// Caller is now waiting.
    pub const SEARCHING: &str = "Searching for partner...";
    /// The other side left.
    pub const PARTNER_DISCONNECTED: &str = "Partner disconnected.";
    /// Caller left via `/anon_stop`.
    pub const YOU_LEFT: &str = "You left the chat.";
    /// Message from a participant without a partner.
    pub const NOT_CONNECTED: &str = "Not connected to partner. Use /anon_start";
    /// Relay to the partner failed.
    pub const RELAY_FAILED: &str = "Your message could not be delivered. Please try again.";
    /// Admin command from a non-admin.
    pub const UNAUTHORIZED: &str = "Unauthorized.";
    /// Reply to `/clear_state`.
    pub const STATE_CLEARED: &str = "State cleared.";
    /// `/status` while paired.
    pub const STATUS_CONNECTED: &str = "Connected";
    /// `/status` while queued.
    pub const STATUS_WAITING: &str = "Waiting";
    /// `/status` while idle.
    pub const STATUS_IDLE: &str = "Not in chat";
}

/// Relayed messages remembered for late failure reports.
const RECENT_RELAYS: NonZeroUsize = match NonZeroUsize::new(4096) {
    Some(n) => n,
    None => NonZeroUsize::MIN,
};

/// What happened to a non-command message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to the transport for this partner.
    Relayed(ParticipantId),
    /// Dropped by the sender's cooldown.
    Throttled,
    /// Sender has no partner; guidance was sent.
    NotPaired,
    /// Transport refused the relay; sender was warned.
    Failed,
}

/// Routes inbound events to the registry and the notification port.
///
/// Registry calls return before any notification is sent, so slow delivery
/// never holds the registry lock.
pub struct RelayRouter {
    registry: Arc<MatchRegistry>,
    port: Arc<dyn NotificationPort>,
    config: ServerConfig,
    /// Relayed `ref` -> sender, so an adapter-reported failure reaches the
    /// right participant.
    recent_relays: Mutex<LruCache<MessageRef, ParticipantId>>,
}

impl RelayRouter {
    /// Router over `registry`, delivering through `port`.
    #[must_use]
    pub fn new(
        registry: Arc<MatchRegistry>,
        port: Arc<dyn NotificationPort>,
        config: &ServerConfig,
    ) -> Self {
        Self {
            registry,
            port,
            config: config.clone(),
            recent_relays: Mutex::new(LruCache::new(RECENT_RELAYS)),
        }
    }

    /// Registry this router drives.
    #[must_use]
    pub fn registry(&self) -> &MatchRegistry {
        &self.registry
    }

    /// Entry point for everything a participant sends.
    ///
    /// Slash commands are dispatched and never relayed; unknown commands are
    /// ignored. Everything else goes through [`handle_message`](Self::handle_message).
    pub async fn handle_inbound(&self, msg: &InboundMessage) -> Option<Delivery> {
        if let Some(text) = msg.text.as_deref() {
            match Command::parse(text) {
                Parsed::Known(cmd) => {
                    self.handle_command(msg.sender, cmd).await;
                    return None;
                }
                Parsed::Unknown(name) => {
                    debug!(sender = %msg.sender, command = name, "ignoring unknown command");
                    return None;
                }
                Parsed::NotCommand => {}
            }
        }
        Some(self.handle_message(msg).await)
    }

    /// Run one command for `sender`.
    pub async fn handle_command(&self, sender: ParticipantId, cmd: Command) {
        debug!(sender = %sender, command = cmd.name(), "command");
        match cmd {
            Command::Start => self.tell(sender, notices::MENU).await,
            Command::MyId => self.tell(sender, &sender.to_string()).await,
            Command::ShowConfig => {
                if !self.is_admin(sender) {
                    return self.tell(sender, notices::UNAUTHORIZED).await;
                }
                let text = self.describe_config();
                self.tell(sender, &text).await;
            }
            Command::ClearState => {
                if !self.is_admin(sender) {
                    return self.tell(sender, notices::UNAUTHORIZED).await;
                }
                let discarded = self.registry.clear();
                info!(
                    admin = %sender,
                    waiting = discarded.waiting,
                    sessions = discarded.sessions,
                    "state cleared"
                );
                self.tell_with_menu(sender, notices::STATE_CLEARED).await;
            }
            Command::AnonStart => match self.registry.request_match(sender) {
                Some(partner) => {
                    self.announce_pair(sender, partner, notices::PARTNER_CONNECTED)
                        .await;
                }
                None => self.tell_with_menu(sender, notices::SEARCHING).await,
            },
            Command::AnonNext => {
                let rotation = self.registry.rotate(sender);
                if let Some(previous) = rotation.previous {
                    self.tell_with_menu(previous, notices::PARTNER_DISCONNECTED)
                        .await;
                }
                match rotation.next {
                    Some(partner) => {
                        self.announce_pair(sender, partner, notices::NEW_PARTNER_CONNECTED)
                            .await;
                    }
                    None => self.tell_with_menu(sender, notices::SEARCHING).await,
                }
            }
            Command::AnonStop => {
                if let Some(partner) = self.registry.end_session(sender) {
                    self.tell_with_menu(partner, notices::PARTNER_DISCONNECTED)
                        .await;
                }
                self.tell_with_menu(sender, notices::YOU_LEFT).await;
            }
            Command::Status => {
                let text = match self.registry.status_of(sender) {
                    Status::Paired => notices::STATUS_CONNECTED,
                    Status::Waiting => notices::STATUS_WAITING,
                    Status::Idle => notices::STATUS_IDLE,
                };
                self.tell_with_menu(sender, text).await;
            }
        }
    }

    /// Mirror media, then relay to the partner if there is one.
    ///
    /// Mirroring does not depend on pairing status and its failure never
    /// prevents the relay.
    pub async fn handle_message(&self, msg: &InboundMessage) -> Delivery {
        if msg.is_monitorable() {
            self.mirror(msg.message_ref).await;
        }

        match self.registry.relay_target(msg.sender) {
            RelayTarget::Partner(partner) => {
                match self.port.relay_message(partner, &msg.to_payload()).await {
                    Ok(()) => {
                        counters::messages_relayed_total();
                        self.recent_relays().put(msg.message_ref, msg.sender);
                        Delivery::Relayed(partner)
                    }
                    Err(e) => {
                        self.report_relay_failure(msg.sender, &e.to_string()).await;
                        Delivery::Failed
                    }
                }
            }
            RelayTarget::Throttled => {
                counters::messages_dropped_total("rate_limit");
                debug!(sender = %msg.sender, "relay throttled");
                Delivery::Throttled
            }
            RelayTarget::NotPaired => {
                counters::messages_dropped_total("not_paired");
                self.tell_with_menu(msg.sender, notices::NOT_CONNECTED).await;
                Delivery::NotPaired
            }
        }
    }

    /// Handle an adapter's report that an earlier mirror or relay failed.
    ///
    /// Relay failures reach the original sender only while its `ref` is
    /// still among the recently relayed messages.
    pub async fn handle_delivery_failure(
        &self,
        kind: FailedAction,
        message_ref: MessageRef,
        reason: &str,
    ) {
        match kind {
            FailedAction::Mirror => self.report_mirror_failure(reason).await,
            FailedAction::Relay => {
                let sender = self.recent_relays().pop(&message_ref);
                match sender {
                    Some(sender) => self.report_relay_failure(sender, reason).await,
                    None => debug!(message_ref = message_ref.0, "relay failure for unknown ref"),
                }
            }
        }
    }

    async fn mirror(&self, message_ref: MessageRef) {
        match self.port.mirror_to_monitor(message_ref).await {
            Ok(()) => counters::mirrors_total("ok"),
            Err(e) => self.report_mirror_failure(&e.to_string()).await,
        }
    }

    async fn report_mirror_failure(&self, reason: &str) {
        counters::mirrors_total("failed");
        warn!(error = reason, "monitor mirror failed");
        let notice = format!("Group forward failed: {reason}");
        if let Err(e) = self.port.notify_admins(&notice).await {
            warn!(error = %e, "admin notification failed");
        }
    }

    async fn report_relay_failure(&self, sender: ParticipantId, reason: &str) {
        counters::messages_dropped_total("delivery");
        warn!(sender = %sender, error = reason, "relay to partner failed");
        self.tell(sender, notices::RELAY_FAILED).await;
    }

    fn recent_relays(&self) -> MutexGuard<'_, LruCache<MessageRef, ParticipantId>> {
        self.recent_relays.lock().unwrap_or_else(|poisoned| {
            warn!("recent relay cache lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    async fn announce_pair(&self, a: ParticipantId, b: ParticipantId, text: &str) {
        info!("pair formed");
        self.tell(a, text).await;
        self.tell(b, text).await;
        self.tell(a, notices::MENU).await;
        self.tell(b, notices::MENU).await;
    }

    async fn tell_with_menu(&self, to: ParticipantId, text: &str) {
        self.tell(to, text).await;
        self.tell(to, notices::MENU).await;
    }

    async fn tell(&self, to: ParticipantId, text: &str) {
        if let Err(e) = self.port.deliver_text(to, text).await {
            debug!(to = %to, error = %e, "notice not delivered");
        }
    }

    fn is_admin(&self, id: ParticipantId) -> bool {
        self.config.is_admin(id)
    }

    fn describe_config(&self) -> String {
        let admins = self
            .config
            .admin_ids
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let stats = self.registry.stats();
        format!(
            "monitor_chat: {}\nadmin_ids: [{}]\ncooldown_ms: {}\nwaiting: {}\nsessions: {}",
            self.config.monitor_chat,
            admins,
            self.config.cooldown_ms,
            stats.waiting,
            stats.sessions
        )
    }
}
