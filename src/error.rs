use thiserror::Error;

/// Failure to acquire the local capture tracks. Always fatal for the
/// session being started, never retried.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct MediaError(pub String);

/// Signaling channel failures.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("websocket connect failed: {0}")]
    Connect(#[source] tokio_tungstenite::tungstenite::Error),

    /// The outbound queue is gone, i.e. the channel is already closed.
    #[error("signaling channel closed")]
    Closed,

    #[error("message encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Raised by the stats delta engine when two snapshots do not span a
/// positive interval. The caller controls snapshot retention, so a
/// non-positive interval is a programming error, not something to clamp.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum StatsError {
    #[error("non-positive stats interval: {0}s")]
    NonPositiveInterval(f64),
}

/// Top-level session error taxonomy.
///
/// `InvalidOptions` fails fast, before any network or media activity.
/// `Media` means the session never reached negotiation. `Channel` and
/// `Negotiation` are fatal once negotiation has begun; candidate-addition
/// and inbound parse failures are recovered silently and never appear
/// here.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid session options: {0}")]
    InvalidOptions(String),

    #[error("media acquisition failed: {0}")]
    Media(#[from] MediaError),

    #[error("signaling channel: {0}")]
    Channel(#[from] ChannelError),

    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error(transparent)]
    Rtc(#[from] webrtc::Error),
}
