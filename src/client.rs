use crate::channel_map::{preset_address_of, ChannelMap};
use crate::codec::DeviceEvent;
use crate::config::DeviceConfig;
use crate::connection::ConnectionManager;
use crate::error::{AhmError, Result};
use crate::level::db_to_level;
use crate::names::{load_names, NameFetcher, NameStore};
use crate::poller::{SafetyPoller, SweepReport};
use crate::protocol::{Command, Parameter};
use crate::state::{ChannelState, CrosspointState, DeviceSnapshot, StateStore};
use crate::subscription::StateReceiver;
use crate::tracker::{RequestOutcome, RequestTracker};
use crate::types::{
    ChannelId, ChannelKind, ConnectionState, CrosspointId, Level, ModelLimits, PlaybackChannel,
    MAX_LEVEL, MAX_TRACK,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Client for one Allen & Heath AHM zone mixer
///
/// The `AhmClient` owns the control connection, the live state mirror and
/// the background poller. Setters are fire-and-forget: the device echoes
/// every change, and only that echo updates state and notifies subscribers.
///
/// # Example
///
/// ```no_run
/// use ahm_control::{AhmClient, ChannelId, DeviceConfig, DeviceModel, MemoryNameStore};
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut config = DeviceConfig::new("192.168.1.70", DeviceModel::Ahm16);
///     config.inputs = vec![1, 2];
///     let client = AhmClient::new(config, Arc::new(MemoryNameStore::new()))?;
///     client.start().await?;
///     client.set_level(ChannelId::input(1), 84).await?;
///     Ok(())
/// }
/// ```
pub struct AhmClient {
    config: DeviceConfig,
    map: ChannelMap,
    state: Arc<StateStore>,
    manager: Arc<ConnectionManager>,
    poller: Arc<SafetyPoller>,
    names: NameFetcher,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl AhmClient {
    /// Build a client from a validated config. Does not touch the network.
    ///
    /// Names already in `name_store` are restored into state immediately.
    pub fn new(config: DeviceConfig, name_store: Arc<dyn NameStore>) -> Result<Self> {
        config.validate()?;
        let map = ChannelMap::new(config.model.limits());
        let state = Arc::new(StateStore::new(config.channels(), config.crosspoints()));
        let tracker = Arc::new(RequestTracker::new(config.request_timeout()));

        match load_names(name_store.as_ref()) {
            Ok(stored) => {
                let restored = state.restore_names(&stored);
                tracing::debug!("Restored {} stored channel names", restored);
            }
            Err(e) => tracing::warn!("Could not load stored names: {}", e),
        }

        let manager = Arc::new(ConnectionManager::new(
            config.host.clone(),
            config.port,
            config.connect_timeout(),
            state.clone(),
            tracker,
        ));
        let poller = Arc::new(SafetyPoller::new(
            manager.clone(),
            state.clone(),
            map,
            config.poll_interval(),
            config.initial_wait(),
        ));
        let names = NameFetcher::new(manager.clone(), state.clone(), name_store, map);

        Ok(Self {
            config,
            map,
            state,
            manager,
            poller,
            names,
            poll_task: Mutex::new(None),
        })
    }

    /// Connect and start the safety poller
    ///
    /// The poller is started even if the first connect fails; it retries on
    /// every tick.
    pub async fn start(&self) -> Result<()> {
        let result = self.manager.connect().await;
        if let Err(e) = &result {
            tracing::warn!("Initial connect to {} failed: {}", self.manager.addr(), e);
        }
        let mut task = self.poll_task.lock();
        if task.as_ref().map_or(true, |handle| handle.is_finished()) {
            *task = Some(self.poller.clone().spawn());
        }
        result
    }

    /// Open the control socket without starting the poller
    pub async fn connect(&self) -> Result<()> {
        self.manager.connect().await
    }

    /// Stop polling, close the socket and cancel pending requests
    pub async fn shutdown(&self) {
        let task = self.poll_task.lock().take();
        if let Some(handle) = task {
            handle.abort();
        }
        self.manager.disconnect().await;
    }

    /// Configuration this client was built from
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Channel and preset bounds of the configured model
    pub fn limits(&self) -> &ModelLimits {
        self.map.limits()
    }

    /// Subscribe to state and connection changes
    pub fn subscribe(&self) -> StateReceiver {
        self.state.subscribe()
    }

    /// Copy of everything currently known about the device
    pub fn snapshot(&self) -> DeviceSnapshot {
        self.state.snapshot()
    }

    /// Current state of one tracked channel
    pub fn channel(&self, id: ChannelId) -> Option<ChannelState> {
        self.state.channel(id)
    }

    /// Current state of one tracked crosspoint
    pub fn crosspoint(&self, id: CrosspointId) -> Option<CrosspointState> {
        self.state.crosspoint(id)
    }

    /// Last preset the device confirmed recalling
    pub fn last_preset(&self) -> Option<u16> {
        self.state.last_preset()
    }

    /// Socket status as last observed
    pub fn connection_state(&self) -> ConnectionState {
        self.state.connection_state()
    }

    /// Start tracking a channel; it is picked up by the next poll
    pub fn add_channel(&self, id: ChannelId) -> Result<()> {
        self.map.limits().check(id)?;
        self.state.track_channel(id);
        Ok(())
    }

    /// Stop tracking a channel. Returns false if it was not tracked.
    pub fn remove_channel(&self, id: ChannelId) -> bool {
        self.state.untrack_channel(id)
    }

    /// Start tracking a crosspoint; it is picked up by the next poll
    pub fn add_crosspoint(&self, id: CrosspointId) -> Result<()> {
        self.map.limits().check_crosspoint(id)?;
        self.state.track_crosspoint(id);
        Ok(())
    }

    /// Stop tracking a crosspoint. Returns false if it was not tracked.
    pub fn remove_crosspoint(&self, id: CrosspointId) -> bool {
        self.state.untrack_crosspoint(id)
    }

    /// Set a channel's fader level (0..=127). State follows the device echo.
    pub async fn set_level(&self, channel: ChannelId, level: Level) -> Result<()> {
        check_level(level)?;
        let address = self.map.address_of(channel)?;
        self.manager.send(Command::set_level(address, level)).await
    }

    /// Set a level given in dB, clamped to the fader range
    pub async fn set_level_db(&self, channel: ChannelId, db: f64) -> Result<()> {
        self.set_level(channel, db_to_level(db)).await
    }

    /// Mute or unmute a channel. State follows the device echo.
    pub async fn set_mute(&self, channel: ChannelId, muted: bool) -> Result<()> {
        let address = self.map.address_of(channel)?;
        self.manager.send(Command::SetMute { address, muted }).await
    }

    /// Set an NRPN parameter. Preamp parameters exist on inputs only.
    pub async fn set_parameter(
        &self,
        channel: ChannelId,
        parameter: Parameter,
        value: u8,
    ) -> Result<()> {
        if value > 0x7F {
            return Err(AhmError::invalid(format!(
                "parameter value {:#04x} out of range",
                value
            )));
        }
        if parameter != Parameter::Level && channel.kind != ChannelKind::Input {
            return Err(AhmError::invalid(format!(
                "{:?} is only available on inputs, not {}",
                parameter, channel
            )));
        }
        let address = self.map.address_of(channel)?;
        self.manager
            .send(Command::SetParameter {
                address,
                parameter,
                value,
            })
            .await
    }

    /// Set the level of a send into a zone
    pub async fn set_send_level(&self, crosspoint: CrosspointId, level: Level) -> Result<()> {
        check_level(level)?;
        let send = self.map.send_address_of(crosspoint)?;
        self.manager.send(Command::SetSendLevel { send, level }).await
    }

    /// Mute or unmute a send into a zone
    pub async fn set_send_mute(&self, crosspoint: CrosspointId, muted: bool) -> Result<()> {
        let send = self.map.send_address_of(crosspoint)?;
        self.manager.send(Command::SetSendMute { send, muted }).await
    }

    /// Recall preset 1..=500. `last_preset` changes once the device confirms.
    pub async fn recall_preset(&self, number: u16) -> Result<()> {
        let preset = preset_address_of(number)?;
        self.manager.send(Command::RecallPreset(preset)).await
    }

    /// Play track 1..=128 on a playback channel
    pub async fn play_track(&self, track: u8, channel: PlaybackChannel) -> Result<()> {
        if track == 0 || track > MAX_TRACK {
            return Err(AhmError::invalid(format!(
                "track {} out of range (1..={})",
                track, MAX_TRACK
            )));
        }
        self.manager
            .send(Command::PlayTrack {
                channel,
                track: track - 1,
            })
            .await
    }

    /// Read a channel's level from the device
    pub async fn get_level(&self, channel: ChannelId) -> Result<Level> {
        let address = self.map.address_of(channel)?;
        match self.query(Command::GetLevel { address }).await? {
            DeviceEvent::Level { level, .. } => Ok(level),
            other => Err(unexpected(other)),
        }
    }

    /// Read a channel's mute from the device
    pub async fn get_mute(&self, channel: ChannelId) -> Result<bool> {
        let address = self.map.address_of(channel)?;
        match self.query(Command::GetMute { address }).await? {
            DeviceEvent::Mute { muted, .. } => Ok(muted),
            other => Err(unexpected(other)),
        }
    }

    /// Read a send level from the device
    pub async fn get_send_level(&self, crosspoint: CrosspointId) -> Result<Level> {
        let send = self.map.send_address_of(crosspoint)?;
        match self.query(Command::GetSendLevel { send }).await? {
            DeviceEvent::SendLevel { level, .. } => Ok(level),
            other => Err(unexpected(other)),
        }
    }

    /// Read a send mute from the device
    pub async fn get_send_mute(&self, crosspoint: CrosspointId) -> Result<bool> {
        let send = self.map.send_address_of(crosspoint)?;
        match self.query(Command::GetSendMute { send }).await? {
            DeviceEvent::SendMute { muted, .. } => Ok(muted),
            other => Err(unexpected(other)),
        }
    }

    /// Read one channel name; `None` when the device has none set
    pub async fn get_name(&self, channel: ChannelId) -> Result<Option<String>> {
        let address = self.map.address_of(channel)?;
        match self.query(Command::GetName { address }).await? {
            DeviceEvent::Name { name, .. } => Ok(name),
            other => Err(unexpected(other)),
        }
    }

    /// Read a channel's colour index
    pub async fn get_colour(&self, channel: ChannelId) -> Result<u8> {
        let address = self.map.address_of(channel)?;
        match self.query(Command::GetColour { address }).await? {
            DeviceEvent::Colour { colour, .. } => Ok(colour),
            other => Err(unexpected(other)),
        }
    }

    /// Fetch and persist names for every tracked channel
    pub async fn fetch_names(&self) -> Result<HashMap<ChannelId, String>> {
        self.names.fetch_all().await
    }

    /// Fetch names for every channel the model has
    pub async fn fetch_all_names_for_model(&self) -> Result<HashMap<ChannelId, String>> {
        self.names.fetch_all_for_model().await
    }

    /// Re-read everything tracked now instead of waiting for the next poll
    pub async fn refresh(&self) -> SweepReport {
        self.poller.sweep(None).await
    }

    async fn query(&self, command: Command) -> Result<DeviceEvent> {
        match self.manager.request(command).await?.wait().await {
            RequestOutcome::Resolved(event) => Ok(event),
            RequestOutcome::Timeout => Err(AhmError::Timeout),
            RequestOutcome::Cancelled => Err(AhmError::Cancelled),
        }
    }
}

impl Drop for AhmClient {
    fn drop(&mut self) {
        if let Some(handle) = self.poll_task.lock().take() {
            handle.abort();
        }
        self.manager.abort_tasks();
    }
}

fn check_level(level: Level) -> Result<()> {
    if level > MAX_LEVEL {
        return Err(AhmError::invalid(format!(
            "level {} out of range (0..={})",
            level, MAX_LEVEL
        )));
    }
    Ok(())
}

fn unexpected(event: DeviceEvent) -> AhmError {
    AhmError::MalformedFrame(format!("unexpected reply {:?}", event))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::names::MemoryNameStore;
    use crate::types::{DeviceModel, SourceKind};

    fn client() -> AhmClient {
        let mut config = DeviceConfig::new("127.0.0.1", DeviceModel::Ahm16);
        config.port = 1;
        config.inputs = vec![1];
        AhmClient::new(config, Arc::new(MemoryNameStore::new())).unwrap()
    }

    #[tokio::test]
    async fn arguments_are_validated_before_the_socket_is_touched() {
        let client = client();
        let invalid = |r: Result<()>| matches!(r, Err(AhmError::InvalidArgument(_)));

        assert!(invalid(client.set_level(ChannelId::input(17), 10).await));
        assert!(invalid(client.set_level(ChannelId::input(1), 0x80).await));
        assert!(invalid(client.set_mute(ChannelId::room(17), true).await));
        assert!(invalid(client.recall_preset(0).await));
        assert!(invalid(client.recall_preset(501).await));
        assert!(invalid(client.play_track(0, PlaybackChannel::Mono1).await));
        assert!(invalid(client.play_track(129, PlaybackChannel::Stereo).await));
        assert!(invalid(
            client
                .set_send_level(CrosspointId::new(SourceKind::Input, 1, 17), 10)
                .await
        ));
        assert!(invalid(
            client
                .set_parameter(ChannelId::zone(1), Parameter::Phantom, 0x7F)
                .await
        ));

        // Valid arguments reach the connection, which is down
        assert!(matches!(
            client.set_level(ChannelId::input(1), 84).await,
            Err(AhmError::NotConnected)
        ));
        assert!(matches!(
            client.play_track(128, PlaybackChannel::Stereo).await,
            Err(AhmError::NotConnected)
        ));
    }

    #[test]
    fn stored_names_are_restored_on_creation() {
        let store = MemoryNameStore::new();
        store.put("input_1", "Lectern").unwrap();
        let mut config = DeviceConfig::new("127.0.0.1", DeviceModel::Ahm16);
        config.inputs = vec![1];
        let client = AhmClient::new(config, Arc::new(store)).unwrap();
        assert_eq!(
            client.channel(ChannelId::input(1)).unwrap().name.as_deref(),
            Some("Lectern")
        );
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = DeviceConfig::new("127.0.0.1", DeviceModel::Ahm16);
        config.zones = vec![0];
        assert!(AhmClient::new(config, Arc::new(MemoryNameStore::new())).is_err());
    }

    #[test]
    fn tracked_set_follows_add_and_remove() {
        let client = client();
        assert!(client.add_channel(ChannelId::zone(99)).is_err());
        client.add_channel(ChannelId::zone(2)).unwrap();
        assert!(client.channel(ChannelId::zone(2)).is_some());
        assert!(client.remove_channel(ChannelId::zone(2)));
        assert!(client.channel(ChannelId::zone(2)).is_none());
    }
}
