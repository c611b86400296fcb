use super::*;

/// Why a contact or link changed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactReason {
    NoInfo,
    /// Closed by operator command.
    User,
    /// The underlying connection failed or timed out.
    Broken,
    /// Closed after the idle timer expired.
    Idle,
    /// The peer shut the session down cleanly.
    Shutdown,
}

impl ContactReason {
    /// Reasons that arm the availability retry timer.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ContactReason::User | ContactReason::Idle)
    }
}

/// Events posted to the daemon queue. The queue's single consumer is the
/// only place link state is mutated, so events for one link are processed
/// in the order posted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    LinkCreated {
        name: String,
    },
    LinkDeleted {
        name: String,
    },
    LinkAvailable {
        name: String,
    },
    LinkUnavailable {
        name: String,
        reason: ContactReason,
    },
    ContactUp {
        name: String,
    },
    ContactDown {
        name: String,
        reason: ContactReason,
    },
    /// Posted by an availability timer: the link should be reopened.
    OpenRequested {
        name: String,
    },
    /// A queued bundle was cancelled before any bytes reached the wire.
    BundleSendCancelled {
        name: String,
        bundle_id: u64,
    },
}

pub type EventTx = tokio::sync::mpsc::UnboundedSender<LinkEvent>;
pub type EventRx = tokio::sync::mpsc::UnboundedReceiver<LinkEvent>;

pub fn channel() -> (EventTx, EventRx) {
    tokio::sync::mpsc::unbounded_channel()
}
