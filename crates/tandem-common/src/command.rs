//! User-facing slash commands.
//!
//! Text starting with `/` is a command. An optional `@botname` suffix and any
//! trailing arguments are ignored.

/// A recognised slash command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// `/start`: show the menu.
    Start,
    /// `/myid`: reply with the caller's id.
    MyId,
    /// `/show_config`: admin-only configuration dump.
    ShowConfig,
    /// `/clear_state`: admin-only reset of queue and sessions.
    ClearState,
    /// `/anon_start`: find a partner.
    AnonStart,
    /// `/anon_next`: drop the current partner and find another.
    AnonNext,
    /// `/anon_stop`: leave the chat or the queue.
    AnonStop,
    /// `/status`: report Idle/Waiting/Paired.
    Status,
}

/// Result of classifying message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parsed<'a> {
    /// Not a command; route as a message.
    NotCommand,
    /// A known command.
    Known(Command),
    /// Looks like a command but is not one we handle.
    Unknown(&'a str),
}

impl Command {
    /// All commands, in menu order.
    pub const ALL: [Command; 8] = [
        Command::Start,
        Command::MyId,
        Command::ShowConfig,
        Command::ClearState,
        Command::AnonStart,
        Command::AnonNext,
        Command::AnonStop,
        Command::Status,
    ];

    /// Command name without the leading slash.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Command::Start => "start",
            Command::MyId => "myid",
            Command::ShowConfig => "show_config",
            Command::ClearState => "clear_state",
            Command::AnonStart => "anon_start",
            Command::AnonNext => "anon_next",
            Command::AnonStop => "anon_stop",
            Command::Status => "status",
        }
    }

    /// Look up a command by bare name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.name() == name)
    }

    /// Classify message text.
    #[must_use]
    pub fn parse(text: &str) -> Parsed<'_> {
        let Some(rest) = text.trim_start().strip_prefix('/') else {
            return Parsed::NotCommand;
        };
        let word = rest.split_whitespace().next().unwrap_or("");
        let name = word.split('@').next().unwrap_or("");
        match Self::from_name(name) {
            Some(cmd) => Parsed::Known(cmd),
            None => Parsed::Unknown(name),
        }
    }
}
