//! Rust library for controlling Allen & Heath AHM zone mixers
//!
//! This library provides an async client for the AHM's MIDI-over-TCP
//! control protocol. It supports:
//!
//! - Input, zone, control group and room levels and mutes
//! - Crosspoint (send) levels and mutes
//! - Preset recall and audio playback triggers
//! - Channel name and colour reads, with name persistence
//! - A live state mirror with change subscriptions
//! - Automatic reconnect and periodic safety polling
//!
//! # Quick Start
//!
//! ```no_run
//! use ahm_control::{AhmClient, ChannelId, DeviceConfig, DeviceModel, MemoryNameStore};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = DeviceConfig::new("192.168.1.70", DeviceModel::Ahm32);
//!     config.inputs = vec![1, 2];
//!     config.zones = vec![1];
//!
//!     let client = AhmClient::new(config, Arc::new(MemoryNameStore::new()))?;
//!     client.start().await?;
//!
//!     // Setters are confirmed by the device echo
//!     let mut updates = client.subscribe();
//!     client.set_level(ChannelId::input(1), 84).await?;
//!     client.set_mute(ChannelId::zone(1), false).await?;
//!
//!     while let Ok(update) = updates.recv().await {
//!         println!("State update: {:?}", update);
//!     }
//!
//!     client.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! The library is organized into several layers:
//!
//! - **Client**: Command surface and argument validation
//! - **Connection**: Socket ownership, serialized writes, reconnect with backoff
//! - **Listener / Poller**: Background read loop and periodic GET sweep
//! - **Tracker**: Correlation and de-duplication of outstanding GETs
//! - **State**: In-memory device mirror and change notification
//! - **Codec / Protocol**: MIDI framing, byte layouts and channel addressing

mod channel_map;
mod client;
mod codec;
mod config;
mod connection;
mod error;
mod level;
mod listener;
mod names;
mod poller;
mod protocol;
mod state;
mod subscription;
mod tracker;
mod types;

// Public exports
pub use channel_map::{
    crosspoint_at, preset_address_of, preset_number_at, Address, ChannelMap, PresetAddress,
};
pub use client::AhmClient;
pub use codec::{decode_name, AhmCodec, DeviceEvent, EventAssembler, MidiFramer, MidiMessage};
pub use config::DeviceConfig;
pub use connection::{ConnectionManager, DEFAULT_CONNECT_TIMEOUT};
pub use error::{AhmError, Result};
pub use level::{db_to_level, level_to_db, MAX_DB, MIN_DB};
pub use listener::PushListener;
pub use names::{load_names, JsonFileNameStore, MemoryNameStore, NameFetcher, NameStore};
pub use poller::{SafetyPoller, SweepReport, DEFAULT_INITIAL_WAIT, DEFAULT_POLL_INTERVAL};
pub use protocol::{Command, Parameter, QueryKey, SendAddress, DEFAULT_PORT, SYSEX_HEADER};
pub use state::{ChannelState, CrosspointState, DeviceSnapshot, StateStore};
pub use subscription::{EntityKey, StateReceiver, StateUpdate, StateValue};
pub use tracker::{Issued, PendingHandle, RequestOutcome, RequestTracker, DEFAULT_REQUEST_TIMEOUT};
pub use types::{
    ChannelId, ChannelKind, ConnectionState, CrosspointId, DeviceModel, Level, ModelLimits,
    PlaybackChannel, SourceKind, MAX_LEVEL, MAX_PRESET, MAX_TRACK,
};
