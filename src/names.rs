//! Channel name fetching and persistence
//!
//! Names are slow to change and the device only reports them on request,
//! so they are kept in a [`NameStore`] keyed by [`ChannelId::key`] and
//! restored before the first fetch.

use crate::channel_map::ChannelMap;
use crate::codec::DeviceEvent;
use crate::connection::ConnectionManager;
use crate::error::Result;
use crate::protocol::Command;
use crate::state::StateStore;
use crate::tracker::RequestOutcome;
use crate::types::{ChannelId, ChannelKind};
use futures_util::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Persistence for fetched channel names
pub trait NameStore: Send + Sync {
    fn put(&self, key: &str, name: &str) -> Result<()>;
    fn get_all(&self) -> Result<HashMap<String, String>>;
}

/// Decode persisted names into channel ids, skipping unknown keys
pub fn load_names(store: &dyn NameStore) -> Result<HashMap<ChannelId, String>> {
    let mut names = HashMap::new();
    for (key, name) in store.get_all()? {
        match ChannelId::parse_key(&key) {
            Some(id) => {
                names.insert(id, name);
            }
            None => tracing::warn!("Ignoring stored name with unknown key {:?}", key),
        }
    }
    Ok(names)
}

#[derive(Debug, Default)]
pub struct MemoryNameStore {
    names: Mutex<HashMap<String, String>>,
}

impl MemoryNameStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NameStore for MemoryNameStore {
    fn put(&self, key: &str, name: &str) -> Result<()> {
        self.names.lock().insert(key.to_string(), name.to_string());
        Ok(())
    }

    fn get_all(&self) -> Result<HashMap<String, String>> {
        Ok(self.names.lock().clone())
    }
}

/// Names kept as a flat JSON object on disk
#[derive(Debug)]
pub struct JsonFileNameStore {
    path: PathBuf,
    names: Mutex<HashMap<String, String>>,
}

impl JsonFileNameStore {
    /// Open `path`, starting empty if the file does not exist yet
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let names = match fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents)?,
            Err(e) if e.kind() == ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            names: Mutex::new(names),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl NameStore for JsonFileNameStore {
    fn put(&self, key: &str, name: &str) -> Result<()> {
        let mut names = self.names.lock();
        if names.get(key).map(String::as_str) == Some(name) {
            return Ok(());
        }
        names.insert(key.to_string(), name.to_string());
        let json = serde_json::to_string_pretty(&*names)?;
        fs::write(&self.path, json)?;
        Ok(())
    }

    fn get_all(&self) -> Result<HashMap<String, String>> {
        Ok(self.names.lock().clone())
    }
}

/// Batch name reads across channels
pub struct NameFetcher {
    manager: Arc<ConnectionManager>,
    state: Arc<StateStore>,
    store: Arc<dyn NameStore>,
    map: ChannelMap,
}

impl NameFetcher {
    pub fn new(
        manager: Arc<ConnectionManager>,
        state: Arc<StateStore>,
        store: Arc<dyn NameStore>,
        map: ChannelMap,
    ) -> Self {
        Self {
            manager,
            state,
            store,
            map,
        }
    }

    /// Names for every tracked channel
    pub async fn fetch_all(&self) -> Result<HashMap<ChannelId, String>> {
        self.fetch(&self.state.channel_ids()).await
    }

    /// Names for every channel the model has, tracked or not
    pub async fn fetch_all_for_model(&self) -> Result<HashMap<ChannelId, String>> {
        let limits = *self.map.limits();
        let channels: Vec<ChannelId> = ChannelKind::ALL
            .into_iter()
            .flat_map(|kind| limits.channels(kind))
            .collect();
        self.fetch(&channels).await
    }

    /// Request names for `channels` and persist the non-blank ones
    ///
    /// Every channel is validated before anything is sent. Channels whose
    /// request timed out or came back blank are absent from the result.
    pub async fn fetch(&self, channels: &[ChannelId]) -> Result<HashMap<ChannelId, String>> {
        let mut addresses = Vec::with_capacity(channels.len());
        for &channel in channels {
            addresses.push((channel, self.map.address_of(channel)?));
        }

        let mut handles = Vec::with_capacity(addresses.len());
        for (channel, address) in addresses {
            let handle = self.manager.request(Command::GetName { address }).await?;
            handles.push((channel, handle));
        }

        let outcomes = join_all(
            handles
                .into_iter()
                .map(|(channel, handle)| async move { (channel, handle.wait().await) }),
        )
        .await;

        let mut names = HashMap::new();
        for (channel, outcome) in outcomes {
            match outcome {
                RequestOutcome::Resolved(DeviceEvent::Name {
                    name: Some(name), ..
                }) => {
                    if let Err(e) = self.store.put(&channel.key(), &name) {
                        tracing::warn!("Failed to persist name for {}: {}", channel, e);
                    }
                    names.insert(channel, name);
                }
                RequestOutcome::Resolved(_) => {
                    tracing::debug!("{} has no name", channel);
                }
                RequestOutcome::Timeout => {
                    tracing::warn!("Name request for {} timed out", channel);
                }
                RequestOutcome::Cancelled => {
                    tracing::debug!("Name request for {} cancelled", channel);
                }
            }
        }
        tracing::info!("Fetched {} of {} channel names", names.len(), channels.len());
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn memory_store_round_trip() {
        let store = MemoryNameStore::new();
        store.put("input_1", "Mic").unwrap();
        store.put("input_1", "Vocal").unwrap();
        assert_eq!(
            store.get_all().unwrap(),
            HashMap::from([("input_1".to_string(), "Vocal".to_string())])
        );
    }

    #[test]
    fn json_store_persists_across_opens() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("names.json");

        let store = JsonFileNameStore::open(&path).unwrap();
        assert!(store.get_all().unwrap().is_empty());
        store.put("zone_2", "Patio").unwrap();
        store.put("input_3", "Spotify").unwrap();

        let reopened = JsonFileNameStore::open(&path).unwrap();
        let names = reopened.get_all().unwrap();
        assert_eq!(names.get("zone_2").map(String::as_str), Some("Patio"));
        assert_eq!(names.get("input_3").map(String::as_str), Some("Spotify"));
    }

    #[test]
    fn corrupt_json_store_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("names.json");
        fs::write(&path, "not json").unwrap();
        assert!(JsonFileNameStore::open(&path).is_err());
    }

    #[test]
    fn stored_keys_decode_to_channels() {
        let store = MemoryNameStore::new();
        store.put("control_group_4", "Bars").unwrap();
        store.put("mystery", "?").unwrap();
        let names = load_names(&store).unwrap();
        assert_eq!(names.len(), 1);
        assert_eq!(
            names.get(&ChannelId::control_group(4)).map(String::as_str),
            Some("Bars")
        );
    }
}
