use std::fmt::Display;

pub mod backoff;
pub mod channel;
pub mod load_balancing;
pub mod name_resolution;
pub mod service_config;

pub(crate) mod subchannel;

/// A representation of the current state of a channel, also used for the
/// state of subchannels (individual connections within the channel).
///
/// A channel begins in the Idle state. When an RPC is attempted, the channel
/// will automatically transition to Connecting. If connections to a backend
/// service are available, the state becomes Ready. Otherwise, if RPCs would
/// fail due to a lack of connections, the state becomes TransientFailure and
/// the channel continues to attempt to reconnect.
///
/// Channels re-enter the Idle state if they are unused for longer than their
/// configured idleness timeout, and end in Shutdown once destroyed.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ConnectivityState {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    Shutdown,
}

impl Display for ConnectivityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectivityState::Idle => write!(f, "Idle"),
            ConnectivityState::Connecting => write!(f, "Connecting"),
            ConnectivityState::Ready => write!(f, "Ready"),
            ConnectivityState::TransientFailure => write!(f, "TransientFailure"),
            ConnectivityState::Shutdown => write!(f, "Shutdown"),
        }
    }
}

/// Used to asynchronously request a call into a component's `work` method
/// when it needs to make progress without waiting for an update from the
/// channel first.
pub trait WorkScheduler: Send + Sync {
    /// Schedules a call into the component's work method. If there is already
    /// a pending work call that has not yet started, this may not schedule
    /// another one.
    fn schedule_work(&self);
}
