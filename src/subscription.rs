use crate::error::{AhmError, Result};
use crate::types::{ChannelId, ConnectionState, CrosspointId, Level};
use tokio::sync::broadcast;

/// Entity whose value changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKey {
    Channel(ChannelId),
    Crosspoint(CrosspointId),
    LastPreset,
}

/// New value of a changed entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateValue {
    Level(Level),
    Muted(bool),
    /// Channel was renamed
    Name(String),
    Colour(u8),
    Preset(u16),
}

/// State update delivered to subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateUpdate {
    /// An entity took a new value
    Changed { key: EntityKey, value: StateValue },

    /// Control connection changed state
    Connection(ConnectionState),
}

/// Receiver for state updates
pub struct StateReceiver {
    rx: broadcast::Receiver<StateUpdate>,
}

impl StateReceiver {
    /// Create a new state receiver
    pub(crate) fn new(rx: broadcast::Receiver<StateUpdate>) -> Self {
        Self { rx }
    }

    /// Receive the next state update
    ///
    /// Fails with [`AhmError::ConnectionLost`] once the state store is dropped.
    pub async fn recv(&mut self) -> Result<StateUpdate> {
        self.rx.recv().await.map_err(|e| match e {
            broadcast::error::RecvError::Closed => AhmError::ConnectionLost,
            broadcast::error::RecvError::Lagged(n) => {
                AhmError::ChannelError(format!("Lagged by {} messages", n))
            }
        })
    }

    /// Try to receive a state update without blocking
    ///
    /// Returns `None` if no message is available.
    pub fn try_recv(&mut self) -> Result<Option<StateUpdate>> {
        match self.rx.try_recv() {
            Ok(update) => Ok(Some(update)),
            Err(broadcast::error::TryRecvError::Empty) => Ok(None),
            Err(broadcast::error::TryRecvError::Closed) => Err(AhmError::ConnectionLost),
            Err(broadcast::error::TryRecvError::Lagged(n)) => {
                Err(AhmError::ChannelError(format!("Lagged by {} messages", n)))
            }
        }
    }
}
