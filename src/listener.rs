use crate::codec::{AhmCodec, DeviceEvent};
use crate::connection::ConnectionManager;
use crate::state::StateStore;
use crate::tracker::RequestTracker;
use futures_util::StreamExt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::tcp::OwnedReadHalf;
use tokio::time::MissedTickBehavior;
use tokio_util::codec::FramedRead;

/// How often pending requests are checked for expiry
const EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_millis(100);

/// Read loop for one connected socket
///
/// Every decoded event first resolves any matching GET, then goes through
/// [`StateStore::apply`]. Replies and unsolicited pushes take the same path.
pub struct PushListener {
    frames: FramedRead<OwnedReadHalf, AhmCodec>,
    state: Arc<StateStore>,
    tracker: Arc<RequestTracker>,
    manager: Weak<ConnectionManager>,
    generation: u64,
}

impl PushListener {
    pub(crate) fn new(
        frames: FramedRead<OwnedReadHalf, AhmCodec>,
        state: Arc<StateStore>,
        tracker: Arc<RequestTracker>,
        manager: Weak<ConnectionManager>,
        generation: u64,
    ) -> Self {
        Self {
            frames,
            state,
            tracker,
            manager,
            generation,
        }
    }

    pub async fn run(mut self) {
        let mut expiry = tokio::time::interval(EXPIRY_SWEEP_INTERVAL);
        expiry.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                frame = self.frames.next() => match frame {
                    Some(Ok(event)) => dispatch(&self.state, &self.tracker, event),
                    Some(Err(e)) => {
                        tracing::warn!("Read error: {}", e);
                        break;
                    }
                    None => {
                        tracing::info!("Device closed the connection");
                        break;
                    }
                },
                _ = expiry.tick() => {
                    self.tracker.expire();
                }
            }
        }

        if let Some(manager) = self.manager.upgrade() {
            manager.handle_loss(self.generation).await;
        }
    }
}

/// Route one decoded event to the tracker and the state store
pub(crate) fn dispatch(state: &StateStore, tracker: &RequestTracker, event: DeviceEvent) {
    tracing::debug!("Event: {:?}", event);
    if let Some(key) = event.query_key() {
        let woken = tracker.resolve(&key, &event);
        if woken > 0 {
            tracing::debug!("Resolved {:?} for {} waiter(s)", key, woken);
        }
    }
    state.apply(&event);
}
