//! In-memory mirror of device state
//!
//! [`StateStore`] owns every tracked channel, crosspoint, the last recalled
//! preset and the connection status. All mutation goes through
//! [`StateStore::apply`] (decoded device frames) or the connection state
//! setter; every effective change is broadcast to subscribers after the
//! write lock is released.

use crate::channel_map::{crosspoint_at, Address};
use crate::codec::DeviceEvent;
use crate::protocol::SendAddress;
use crate::subscription::{EntityKey, StateReceiver, StateUpdate, StateValue};
use crate::types::{ChannelId, ConnectionState, CrosspointId, Level};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::broadcast;

const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// Live state of one channel. `None` fields have not been read yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelState {
    pub id: ChannelId,
    pub level: Option<Level>,
    pub muted: Option<bool>,
    pub name: Option<String>,
    pub colour: Option<u8>,
}

impl ChannelState {
    fn new(id: ChannelId) -> Self {
        Self {
            id,
            level: None,
            muted: None,
            name: None,
            colour: None,
        }
    }
}

/// Live state of one crosspoint send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrosspointState {
    pub id: CrosspointId,
    pub level: Option<Level>,
    pub muted: Option<bool>,
}

impl CrosspointState {
    fn new(id: CrosspointId) -> Self {
        Self {
            id,
            level: None,
            muted: None,
        }
    }
}

/// Consistent copy of everything the store tracks
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceSnapshot {
    pub connection: ConnectionState,
    pub channels: BTreeMap<ChannelId, ChannelState>,
    pub crosspoints: BTreeMap<CrosspointId, CrosspointState>,
    pub last_preset: Option<u16>,
}

/// Authoritative cache of device state
pub struct StateStore {
    state: RwLock<DeviceSnapshot>,
    update_tx: broadcast::Sender<StateUpdate>,
}

fn channel_mut<'a>(
    state: &'a mut DeviceSnapshot,
    address: &Address,
) -> Option<&'a mut ChannelState> {
    let id = address.channel()?;
    state.channels.get_mut(&id)
}

fn crosspoint_mut(state: &mut DeviceSnapshot, send: SendAddress) -> Option<&mut CrosspointState> {
    let id = crosspoint_at(send)?;
    state.crosspoints.get_mut(&id)
}

fn set_if_changed<T: PartialEq>(slot: &mut Option<T>, value: T) -> bool {
    if slot.as_ref() == Some(&value) {
        return false;
    }
    *slot = Some(value);
    true
}

impl StateStore {
    /// Create a store tracking `channels` and `crosspoints`, all values unknown
    pub fn new(
        channels: impl IntoIterator<Item = ChannelId>,
        crosspoints: impl IntoIterator<Item = CrosspointId>,
    ) -> Self {
        let (update_tx, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        let snapshot = DeviceSnapshot {
            channels: channels
                .into_iter()
                .map(|id| (id, ChannelState::new(id)))
                .collect(),
            crosspoints: crosspoints
                .into_iter()
                .map(|id| (id, CrosspointState::new(id)))
                .collect(),
            ..DeviceSnapshot::default()
        };
        Self {
            state: RwLock::new(snapshot),
            update_tx,
        }
    }

    /// Receiver for every change applied from now on
    pub fn subscribe(&self) -> StateReceiver {
        StateReceiver::new(self.update_tx.subscribe())
    }

    /// Copy of the whole mirror, taken under one lock
    pub fn snapshot(&self) -> DeviceSnapshot {
        self.state.read().clone()
    }

    /// State of one tracked channel
    pub fn channel(&self, id: ChannelId) -> Option<ChannelState> {
        self.state.read().channels.get(&id).cloned()
    }

    /// State of one tracked crosspoint
    pub fn crosspoint(&self, id: CrosspointId) -> Option<CrosspointState> {
        self.state.read().crosspoints.get(&id).cloned()
    }

    /// Last preset the device reported recalling
    pub fn last_preset(&self) -> Option<u16> {
        self.state.read().last_preset
    }

    /// Socket status as last set by the connection manager
    pub fn connection_state(&self) -> ConnectionState {
        self.state.read().connection
    }

    /// Every tracked channel, in order
    pub fn channel_ids(&self) -> Vec<ChannelId> {
        self.state.read().channels.keys().copied().collect()
    }

    /// Every tracked crosspoint, in order
    pub fn crosspoint_ids(&self) -> Vec<CrosspointId> {
        self.state.read().crosspoints.keys().copied().collect()
    }

    /// Start tracking a channel. No-op if it is already tracked.
    pub fn track_channel(&self, id: ChannelId) {
        self.state
            .write()
            .channels
            .entry(id)
            .or_insert_with(|| ChannelState::new(id));
    }

    /// Stop tracking a channel. Returns false if it was not tracked.
    pub fn untrack_channel(&self, id: ChannelId) -> bool {
        self.state.write().channels.remove(&id).is_some()
    }

    /// Start tracking a crosspoint. No-op if it is already tracked.
    pub fn track_crosspoint(&self, id: CrosspointId) {
        self.state
            .write()
            .crosspoints
            .entry(id)
            .or_insert_with(|| CrosspointState::new(id));
    }

    /// Stop tracking a crosspoint. Returns false if it was not tracked.
    pub fn untrack_crosspoint(&self, id: CrosspointId) -> bool {
        self.state.write().crosspoints.remove(&id).is_some()
    }

    /// Record a connection state change, notifying only on transitions
    pub fn set_connection_state(&self, connection: ConnectionState) -> bool {
        let changed = {
            let mut state = self.state.write();
            let changed = state.connection != connection;
            state.connection = connection;
            changed
        };
        if changed {
            tracing::debug!("Connection state -> {}", connection);
            let _ = self.update_tx.send(StateUpdate::Connection(connection));
        }
        changed
    }

    /// Apply a decoded device event, returning the updates it produced
    pub fn apply(&self, event: &DeviceEvent) -> Vec<StateUpdate> {
        let updates = {
            let mut state = self.state.write();
            Self::apply_locked(&mut state, event)
        };
        for update in &updates {
            let _ = self.update_tx.send(update.clone());
        }
        updates
    }

    /// Restore previously persisted names, without touching names already fetched
    pub fn restore_names(&self, names: &HashMap<ChannelId, String>) -> usize {
        let mut state = self.state.write();
        let mut restored = 0;
        for (id, name) in names {
            if let Some(channel) = state.channels.get_mut(id) {
                if channel.name.is_none() && !name.is_empty() {
                    channel.name = Some(name.clone());
                    restored += 1;
                }
            }
        }
        restored
    }

    fn apply_locked(state: &mut DeviceSnapshot, event: &DeviceEvent) -> Vec<StateUpdate> {
        let changed = |key: EntityKey, value: StateValue| StateUpdate::Changed { key, value };

        match event {
            DeviceEvent::Mute { address, muted } => {
                let Some(channel) = channel_mut(state, address) else {
                    return Vec::new();
                };
                if set_if_changed(&mut channel.muted, *muted) {
                    return vec![changed(
                        EntityKey::Channel(channel.id),
                        StateValue::Muted(*muted),
                    )];
                }
            }
            DeviceEvent::Level { address, level } => {
                let Some(channel) = channel_mut(state, address) else {
                    return Vec::new();
                };
                if set_if_changed(&mut channel.level, *level) {
                    return vec![changed(
                        EntityKey::Channel(channel.id),
                        StateValue::Level(*level),
                    )];
                }
            }
            DeviceEvent::Name { address, name } => {
                // A blank name never overwrites a fetched one
                let Some(name) = name else {
                    return Vec::new();
                };
                let Some(channel) = channel_mut(state, address) else {
                    return Vec::new();
                };
                if set_if_changed(&mut channel.name, name.clone()) {
                    return vec![changed(
                        EntityKey::Channel(channel.id),
                        StateValue::Name(name.clone()),
                    )];
                }
            }
            DeviceEvent::Colour { address, colour } => {
                let Some(channel) = channel_mut(state, address) else {
                    return Vec::new();
                };
                if set_if_changed(&mut channel.colour, *colour) {
                    return vec![changed(
                        EntityKey::Channel(channel.id),
                        StateValue::Colour(*colour),
                    )];
                }
            }
            DeviceEvent::SendLevel { send, level } => {
                let Some(crosspoint) = crosspoint_mut(state, *send) else {
                    return Vec::new();
                };
                if set_if_changed(&mut crosspoint.level, *level) {
                    return vec![changed(
                        EntityKey::Crosspoint(crosspoint.id),
                        StateValue::Level(*level),
                    )];
                }
            }
            DeviceEvent::SendMute { send, muted } => {
                let Some(crosspoint) = crosspoint_mut(state, *send) else {
                    return Vec::new();
                };
                if set_if_changed(&mut crosspoint.muted, *muted) {
                    return vec![changed(
                        EntityKey::Crosspoint(crosspoint.id),
                        StateValue::Muted(*muted),
                    )];
                }
            }
            DeviceEvent::PresetRecalled(number) => {
                if set_if_changed(&mut state.last_preset, *number) {
                    return vec![changed(EntityKey::LastPreset, StateValue::Preset(*number))];
                }
            }
            DeviceEvent::Parameter {
                address,
                parameter,
                value,
            } => {
                tracing::debug!(
                    "Parameter {:02X} on {:?} -> {:02X} (not tracked)",
                    parameter,
                    address,
                    value
                );
            }
        }
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SourceKind;

    fn store() -> StateStore {
        StateStore::new(
            [ChannelId::input(1), ChannelId::zone(2)],
            [CrosspointId::new(SourceKind::Input, 1, 2)],
        )
    }

    #[test]
    fn level_echo_updates_and_notifies_once() {
        let store = store();
        let mut rx = store.subscribe();
        let event = DeviceEvent::Level {
            address: Address::new(0, 0),
            level: 84,
        };

        assert_eq!(store.apply(&event).len(), 1);
        assert_eq!(store.channel(ChannelId::input(1)).unwrap().level, Some(84));
        assert_eq!(
            rx.try_recv().unwrap(),
            Some(StateUpdate::Changed {
                key: EntityKey::Channel(ChannelId::input(1)),
                value: StateValue::Level(84),
            })
        );

        // Same value again is not a change
        assert!(store.apply(&event).is_empty());
        assert_eq!(rx.try_recv().unwrap(), None);
    }

    #[test]
    fn untracked_channels_are_ignored() {
        let store = store();
        let event = DeviceEvent::Mute {
            address: Address::new(0, 5),
            muted: true,
        };
        assert!(store.apply(&event).is_empty());
        assert!(store.channel(ChannelId::input(6)).is_none());
    }

    #[test]
    fn blank_name_keeps_existing_name() {
        let store = store();
        let address = Address::new(1, 1);
        store.apply(&DeviceEvent::Name {
            address,
            name: Some("Bar".into()),
        });
        assert!(store
            .apply(&DeviceEvent::Name {
                address,
                name: None
            })
            .is_empty());
        assert_eq!(
            store.channel(ChannelId::zone(2)).unwrap().name.as_deref(),
            Some("Bar")
        );
    }

    #[test]
    fn crosspoint_updates() {
        let store = store();
        let send = SendAddress {
            source: Address::new(0, 0),
            dest_zone: 1,
        };
        store.apply(&DeviceEvent::SendLevel { send, level: 100 });
        store.apply(&DeviceEvent::SendMute { send, muted: true });
        let xp = store
            .crosspoint(CrosspointId::new(SourceKind::Input, 1, 2))
            .unwrap();
        assert_eq!(xp.level, Some(100));
        assert_eq!(xp.muted, Some(true));
    }

    #[test]
    fn preset_echo_sets_last_preset() {
        let store = store();
        assert_eq!(store.last_preset(), None);
        let updates = store.apply(&DeviceEvent::PresetRecalled(42));
        assert_eq!(
            updates,
            vec![StateUpdate::Changed {
                key: EntityKey::LastPreset,
                value: StateValue::Preset(42),
            }]
        );
        assert_eq!(store.last_preset(), Some(42));
    }

    #[test]
    fn connection_transitions_notify() {
        let store = store();
        let mut rx = store.subscribe();
        assert!(!store.set_connection_state(ConnectionState::Disconnected));
        assert!(store.set_connection_state(ConnectionState::Connecting));
        assert_eq!(
            rx.try_recv().unwrap(),
            Some(StateUpdate::Connection(ConnectionState::Connecting))
        );
        assert_eq!(store.snapshot().connection, ConnectionState::Connecting);
    }

    #[test]
    fn restored_names_do_not_clobber_fetched_ones() {
        let store = store();
        store.apply(&DeviceEvent::Name {
            address: Address::new(0, 0),
            name: Some("Mic".into()),
        });
        let stored = HashMap::from([
            (ChannelId::input(1), "Old".to_string()),
            (ChannelId::zone(2), "Patio".to_string()),
            (ChannelId::zone(9), "Untracked".to_string()),
        ]);
        assert_eq!(store.restore_names(&stored), 1);
        assert_eq!(store.channel(ChannelId::input(1)).unwrap().name.as_deref(), Some("Mic"));
        assert_eq!(store.channel(ChannelId::zone(2)).unwrap().name.as_deref(), Some("Patio"));
    }

    #[test]
    fn tracking_changes() {
        let store = store();
        store.track_channel(ChannelId::room(1));
        assert!(store.channel_ids().contains(&ChannelId::room(1)));
        assert!(store.untrack_channel(ChannelId::room(1)));
        assert!(!store.untrack_channel(ChannelId::room(1)));
    }
}
