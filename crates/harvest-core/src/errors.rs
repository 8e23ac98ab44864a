/// Why a message could not be handed to a user's connection.
///
/// `NotConnected` is an expected condition (the user left before the reply
/// was ready) and is not logged as an error. `Transport` means the handle was
/// registered but broken; the registry drops such entries.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("user not connected")]
    NotConnected,
    #[error("transport error: {0}")]
    Transport(String),
}

impl DeliveryError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::NotConnected => "not_connected",
            Self::Transport(_) => "send_error",
        }
    }
}
