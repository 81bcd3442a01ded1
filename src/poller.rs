//! Periodic full GET sweep
//!
//! Push frames keep state fresh most of the time; the poller exists for
//! the frames that get lost. It re-reads every tracked channel and
//! crosspoint on a fixed interval and reconnects the socket when it finds
//! it down.

use crate::channel_map::ChannelMap;
use crate::connection::ConnectionManager;
use crate::protocol::Command;
use crate::state::StateStore;
use crate::tracker::RequestOutcome;
use crate::types::ConnectionState;
use futures_util::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout_at, Instant, MissedTickBehavior};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// How long the startup sweep waits for answers before values are left unknown
pub const DEFAULT_INITIAL_WAIT: Duration = Duration::from_secs(1);

/// Tally of one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// GETs handed to the tracker (joined requests included)
    pub issued: usize,
    pub resolved: usize,
    pub timed_out: usize,
    pub cancelled: usize,
    /// Still pending when the sweep stopped waiting
    pub outstanding: usize,
}

impl SweepReport {
    fn record(&mut self, outcome: RequestOutcome) {
        match outcome {
            RequestOutcome::Resolved(_) => self.resolved += 1,
            RequestOutcome::Timeout => self.timed_out += 1,
            RequestOutcome::Cancelled => self.cancelled += 1,
        }
    }
}

pub struct SafetyPoller {
    manager: Arc<ConnectionManager>,
    state: Arc<StateStore>,
    map: ChannelMap,
    interval: Duration,
    initial_wait: Duration,
}

impl SafetyPoller {
    pub fn new(
        manager: Arc<ConnectionManager>,
        state: Arc<StateStore>,
        map: ChannelMap,
        interval: Duration,
        initial_wait: Duration,
    ) -> Self {
        Self {
            manager,
            state,
            map,
            interval,
            initial_wait,
        }
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(&self) {
        let report = self.tick(Some(self.initial_wait)).await;
        tracing::debug!("Initial poll: {:?}", report);

        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let report = self.tick(None).await;
            if report.timed_out > 0 {
                tracing::warn!(
                    "Safety poll: {} of {} requests timed out",
                    report.timed_out,
                    report.issued
                );
            } else {
                tracing::debug!("Safety poll: {:?}", report);
            }
        }
    }

    /// Reconnect if needed, then sweep
    pub async fn tick(&self, wait: Option<Duration>) -> SweepReport {
        if self.state.connection_state() == ConnectionState::Disconnected {
            if let Err(e) = self.manager.connect().await {
                tracing::warn!("Reconnect from poller failed: {}", e);
                return SweepReport::default();
            }
        }
        self.sweep(wait).await
    }

    /// Issue every GET and collect outcomes, giving up after `wait` if set
    pub async fn sweep(&self, wait: Option<Duration>) -> SweepReport {
        let mut report = SweepReport::default();
        let mut pending = FuturesUnordered::new();

        for command in self.commands() {
            match self.manager.request(command).await {
                Ok(handle) => pending.push(handle.wait()),
                Err(e) => {
                    tracing::warn!("Poll stopped early: {}", e);
                    break;
                }
            }
        }
        report.issued = pending.len();

        let deadline = wait.map(|wait| Instant::now() + wait);
        loop {
            let next = match deadline {
                Some(deadline) => match timeout_at(deadline, pending.next()).await {
                    Ok(next) => next,
                    Err(_) => break,
                },
                None => pending.next().await,
            };
            match next {
                Some(outcome) => report.record(outcome),
                None => break,
            }
        }
        report.outstanding = pending.len();
        report
    }

    /// GETs covering everything the state store tracks
    pub fn commands(&self) -> Vec<Command> {
        let mut commands = Vec::new();
        for channel in self.state.channel_ids() {
            match self.map.address_of(channel) {
                Ok(address) => {
                    commands.push(Command::GetMute { address });
                    commands.push(Command::GetLevel { address });
                }
                Err(e) => tracing::warn!("Not polling {}: {}", channel, e),
            }
        }
        for crosspoint in self.state.crosspoint_ids() {
            match self.map.send_address_of(crosspoint) {
                Ok(send) => {
                    commands.push(Command::GetSendLevel { send });
                    commands.push(Command::GetSendMute { send });
                }
                Err(e) => tracing::warn!("Not polling {}: {}", crosspoint, e),
            }
        }
        commands
    }
}
