//! The storage-channels registry: owns the overflow engine, the channel
//! table, and a free-list pool of storage engines.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use snafu::ResultExt;
use tracing::{debug, instrument, warn};

use crate::channel::Channel;
use crate::config::EngineConfig;
use crate::error::{RecoveryError, StorageError};
use crate::naming::StorageName;
use crate::overflow::DiskOverflowEngine;
use crate::storage::StorageEngine;

pub struct StorageChannelsRegistry {
    dir: PathBuf,
    config: EngineConfig,
    overflow: DiskOverflowEngine,
    channels: HashMap<String, Channel>,
    /// Free list of storages recycled from removed/reset channels.
    pool: Vec<StorageEngine>,
    shutdown: bool,
}

impl StorageChannelsRegistry {
    /// Opens the overflow engine, recovers its state, then runs the
    /// directory startup scan.
    #[instrument(skip_all, fields(dir = %config.data_dir.display()))]
    pub fn open(config: EngineConfig) -> Result<Self, RecoveryError> {
        config.validate().map_err(|reason| {
            RecoveryError::IndexParse {
                path: config.data_dir.clone(),
                line: 0,
                reason,
            }
        })?;
        let overflow = DiskOverflowEngine::open(&config.data_dir)?;
        let mut registry = Self {
            dir: config.data_dir.clone(),
            config,
            overflow,
            channels: HashMap::new(),
            pool: Vec::new(),
            shutdown: false,
        };
        registry.startup_scan()?;
        Ok(registry)
    }

    pub fn overflow(&self) -> &DiskOverflowEngine {
        &self.overflow
    }

    pub fn head_truncation_supported(&self) -> bool {
        self.overflow.head_truncation_supported()
    }

    fn take_or_build_storage(&mut self, storage_id: &str, capacity: usize) -> StorageEngine {
        match self.pool.pop() {
            Some(mut storage) => {
                storage.set_storage_id(storage_id.to_string());
                storage
            }
            None => StorageEngine::new(storage_id.to_string(), capacity),
        }
    }

    // ---- startup scan -----------------------------------

    fn startup_scan(&mut self) -> Result<(), RecoveryError> {
        let mut loaded_dumps: Vec<String> = Vec::new();

        let entries = std::fs::read_dir(&self.dir).map_err(|e| crate::error::PosixError::Io {
            path: self.dir.clone(),
            op: "readdir",
            source: e,
        })?;
        for entry in entries {
            let entry = entry.map_err(|e| crate::error::PosixError::Io {
                path: self.dir.clone(),
                op: "readdir",
                source: e,
            })?;
            let path = entry.path();
            if path.is_dir() {
                warn!(path = %path.display(), "ignoring subdirectory in data directory");
                continue;
            }
            let file_name = match path.file_name().and_then(|n| n.to_str()) {
                Some(n) => n.to_string(),
                None => continue,
            };
            let Some(storage_part) = file_name.strip_suffix(".rq") else {
                if file_name != crate::overflow::DATA_FILE_NAME && file_name != crate::overflow::INDEX_FILE_NAME {
                    warn!(path = %path.display(), "ignoring file with unrecognized suffix");
                }
                continue;
            };
            let Ok(parsed) = StorageName::parse(storage_part) else {
                warn!(name = storage_part, "ignoring .rq file with invalid storage name");
                continue;
            };

            let capacity = self.config.capacity_for(&parsed.channel);
            let channel_name = parsed.channel.clone();
            let subscriber = parsed.subscriber.clone();
            let storage = StorageEngine::load_dump(&self.dir, &file_name, parsed.to_storage_id(), capacity)
                .map_err(|source| RecoveryError::Consistency {
                    name: parsed.to_storage_id(),
                    source: storage_error_to_overflow(source),
                })?;

            let channel = self
                .channels
                .entry(channel_name.clone())
                .or_insert_with(|| Channel::new(channel_name.clone()));
            channel.load_storage(subscriber.as_deref(), move |_| storage)?;
            loaded_dumps.push(file_name);
        }

        let overflow_names: Vec<String> = self.overflow.channel_names().map(|s| s.to_string()).collect();
        for storage_id in overflow_names {
            let Ok(parsed) = StorageName::parse(&storage_id) else {
                warn!(name = storage_id, "ignoring overflow channel with invalid storage name");
                continue;
            };
            let channel_name = parsed.channel.clone();
            let already_has_this_storage = self
                .channels
                .get(&channel_name)
                .map(|c| match &parsed.subscriber {
                    Some(sub) => c.storages().any(|s| s.storage_id() == subscriber_storage_id_for(sub, &channel_name)),
                    None => matches!(c.state(), crate::channel::ChannelState::Anonymous),
                })
                .unwrap_or(false);
            if already_has_this_storage {
                continue;
            }

            let capacity = self.config.capacity_for(&channel_name);
            let subscriber = parsed.subscriber.clone();
            let channel = self
                .channels
                .entry(channel_name.clone())
                .or_insert_with(|| Channel::new(channel_name.clone()));
            channel.load_storage(subscriber.as_deref(), |id| StorageEngine::new(id.to_string(), capacity))?;
        }

        for file_name in loaded_dumps {
            let path = self.dir.join(&file_name);
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "failed to remove loaded .rq dump");
            }
        }

        debug!(channels = self.channels.len(), "startup scan complete");
        Ok(())
    }

    // ---- public API ------------------------------------------------

    #[instrument(skip(self))]
    pub fn get_create(&mut self, name: &str) -> Result<&mut Channel, crate::error::OverflowError> {
        if !self.channels.contains_key(name) {
            if self.shutdown {
                return crate::error::ShutdownInProgressSnafu.fail();
            }
            self.channels.insert(name.to_string(), Channel::new(name.to_string()));
        }
        Ok(self.channels.get_mut(name).expect("just inserted or already present"))
    }

    pub fn get(&mut self, name: &str) -> Option<&mut Channel> {
        self.channels.get_mut(name)
    }

    pub fn get_ref(&self, name: &str) -> Option<&Channel> {
        self.channels.get(name)
    }

    /// Fans a push out to every storage of `name`'s channel, creating the
    /// channel (and its anonymous storage) if this is its first push.
    pub fn push(&mut self, name: &str, payload: &[u8]) -> Result<(), StorageError> {
        let capacity = self.config.capacity_for(name);
        self.get_create(name)?;
        let channel = self.channels.get_mut(name).expect("just created above");
        let overflow = &mut self.overflow;
        channel.push(payload, overflow, |id| StorageEngine::new(id.to_string(), capacity))?;
        Ok(())
    }

    /// Single-consumer pop from `name`'s anonymous storage, if any.
    pub fn pop(&mut self, name: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let Some(channel) = self.channels.get_mut(name) else {
            return Ok(None);
        };
        channel.pop(&mut self.overflow)
    }

    /// Pops from `subscriber`'s own storage on `name`'s channel, if both
    /// the channel and that subscriber's storage already exist.
    pub fn pop_subscriber(
        &mut self,
        name: &str,
        subscriber: &str,
    ) -> Result<Option<Vec<u8>>, StorageError> {
        let Some(channel) = self.channels.get_mut(name) else {
            return Ok(None);
        };
        let Some(storage) = channel.storage_for(subscriber) else {
            return Ok(None);
        };
        storage.pop(&mut self.overflow)
    }

    /// `subscribe(channel, subscriber)`, creating the
    /// channel if it doesn't exist yet.
    pub fn subscribe(
        &mut self,
        channel_name: &str,
        subscriber: &str,
    ) -> Result<&mut StorageEngine, crate::error::OverflowError> {
        let capacity = self.config.capacity_for(channel_name);
        self.get_create(channel_name)?;
        let channel = self.channels.get_mut(channel_name).expect("just created above");
        channel.subscribe(subscriber, &mut self.overflow, |id| {
            StorageEngine::new(id.to_string(), capacity)
        })
    }

    pub fn remove(&mut self, name: &str) -> Result<(), StorageError> {
        let Some(channel) = self.channels.get_mut(name) else {
            return Ok(());
        };
        for storage in channel.storages_mut() {
            if self.overflow.contains_channel(storage.storage_id()) {
                self.overflow.remove(storage.storage_id())?;
            }
        }
        let mut drained = channel.reset();
        for storage in drained.iter_mut() {
            storage.recycle();
        }
        self.pool.extend(drained);
        self.channels.remove(name);
        Ok(())
    }

    pub fn iterate(&self) -> impl Iterator<Item = (&str, &Channel)> {
        self.channels.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn channel_capacity(&self, name: &str) -> usize {
        self.config.capacity_for(name)
    }

    pub fn overflow_mut(&mut self) -> &mut DiskOverflowEngine {
        &mut self.overflow
    }

    pub fn make_storage(&mut self, storage_id: &str) -> StorageEngine {
        let capacity = self.config.capacity_for(StorageName::parse(storage_id).map(|p| p.channel).unwrap_or_default().as_str());
        self.take_or_build_storage(storage_id, capacity)
    }

    pub fn begin_shutdown(&mut self) {
        self.shutdown = true;
        self.overflow.begin_shutdown();
    }

    /// Head-minimizes and rewrites the index file of the overflow engine
    ///, plus per-storage `Flush` notification.
    pub fn flush(&mut self) -> Result<(), crate::error::OverflowError> {
        for channel in self.channels.values_mut() {
            channel.flush();
        }
        self.overflow.flush()
    }

    pub fn write_index(&self) -> Result<(), crate::error::OverflowError> {
        self.overflow.write_index()
    }

    /// Writes every storage's memory-ring dump, then closes the overflow
    /// engine.
    pub fn close(mut self) -> Result<(), StorageError> {
        for (_, mut channel) in self.channels.drain() {
            channel.close(&self.dir)?;
        }
        self.overflow.close();
        Ok(())
    }
}

fn subscriber_storage_id_for(subscriber: &str, channel: &str) -> String {
    crate::naming::subscriber_storage_id(subscriber, channel)
}

fn storage_error_to_overflow(source: StorageError) -> crate::error::OverflowError {
    match source {
        StorageError::Overflow { source } => source,
        StorageError::StorageIo { source } => crate::error::OverflowError::OverflowIo { source },
        StorageError::RingDecode { .. } => crate::error::OverflowError::InvalidStorageName {
            name: String::new(),
            reason: "corrupt ring dump",
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &Path) -> EngineConfig {
        EngineConfig::new(dir.to_path_buf())
    }

    #[test]
    fn push_pop_round_trips_through_the_registry() {
        let dir = tempdir::TempDir::new("registry").unwrap();
        let mut registry = StorageChannelsRegistry::open(config(dir.path())).unwrap();
        registry.push("ch", b"hello").unwrap();
        assert_eq!(registry.pop("ch").unwrap().unwrap(), b"hello");
    }

    #[test]
    fn remove_recycles_storage_into_pool() {
        let dir = tempdir::TempDir::new("registry").unwrap();
        let mut registry = StorageChannelsRegistry::open(config(dir.path())).unwrap();
        registry.push("ch", b"x").unwrap();
        assert!(registry.pool.is_empty());
        registry.remove("ch").unwrap();
        assert_eq!(registry.pool.len(), 1);
        assert!(registry.get("ch").is_none());
    }

    #[test]
    fn subscribe_creates_channel_on_demand() {
        let dir = tempdir::TempDir::new("registry").unwrap();
        let mut registry = StorageChannelsRegistry::open(config(dir.path())).unwrap();
        registry.subscribe("ch", "s1").unwrap();
        registry.push("ch", b"hi").unwrap();
        let channels = &mut registry.channels;
        let overflow = &mut registry.overflow;
        let storage = channels.get_mut("ch").unwrap().storage_for("s1").unwrap();
        assert_eq!(storage.pop(overflow).unwrap().unwrap(), b"hi");
    }
}
