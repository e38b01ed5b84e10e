//! The multi-storage channel state machine.
//!
//! A channel owns one storage per subscriber, or a single anonymous storage
//! when nobody has subscribed yet. Storage creation is handed to the caller
//! via a factory closure so the free-list pool lives in
//! [`crate::registry::StorageChannelsRegistry`], not here.

use std::collections::HashMap;
use std::path::Path;

use crate::error::{OverflowError, StartupSubscriberMismatchSnafu, RecoveryError, StorageError};
use crate::naming::subscriber_storage_id;
use crate::overflow::DiskOverflowEngine;
use crate::storage::StorageEngine;

/// Channel lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Reset,
    Anonymous,
    Subscribed,
}

/// A named logical queue, backed by one or more [`StorageEngine`]s.
///
/// Storages are keyed by `Option<subscriber>`: `None` is the single
/// anonymous storage (valid only in [`ChannelState::Anonymous`]); `Some(s)`
/// is subscriber `s`'s storage (valid only in [`ChannelState::Subscribed`],
/// where `s` may be the empty string, the default subscriber created by
/// promotion).
pub struct Channel {
    name: String,
    state: ChannelState,
    storages: HashMap<Option<String>, StorageEngine>,
}

impl Channel {
    pub fn new(name: String) -> Self {
        Self {
            name,
            state: ChannelState::Reset,
            storages: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Returns the anonymous storage if and only if the channel has no
    /// subscribers.
    pub fn storage_unless_subscribed(&mut self) -> Option<&mut StorageEngine> {
        match self.state {
            ChannelState::Subscribed => None,
            _ => self.storages.get_mut(&None),
        }
    }

    pub fn storages(&self) -> impl Iterator<Item = &StorageEngine> {
        self.storages.values()
    }

    pub fn storages_mut(&mut self) -> impl Iterator<Item = &mut StorageEngine> {
        self.storages.values_mut()
    }

    /// Looks up an already-existing subscriber's storage without creating
    /// one (unlike [`Self::subscribe`]).
    pub fn storage_for(&mut self, subscriber: &str) -> Option<&mut StorageEngine> {
        self.storages.get_mut(&Some(subscriber.to_string()))
    }

    pub fn num_records(&self, overflow: &DiskOverflowEngine) -> u64 {
        self.storages.values().map(|s| s.num_records(overflow)).sum()
    }

    pub fn num_bytes(&self, overflow: &DiskOverflowEngine) -> u64 {
        self.storages.values().map(|s| s.num_bytes(overflow)).sum()
    }

    /// Pushes to every storage (fan-out): the single anonymous storage, or
    /// every subscriber's independent copy. Creates the anonymous storage
    /// on first push to a reset channel.
    pub fn push(
        &mut self,
        payload: &[u8],
        overflow: &mut DiskOverflowEngine,
        make_storage: impl FnOnce(&str) -> StorageEngine,
    ) -> Result<(), StorageError> {
        if self.state == ChannelState::Reset {
            let storage = make_storage(&self.name);
            self.storages.insert(None, storage);
            self.state = ChannelState::Anonymous;
        }
        for storage in self.storages.values_mut() {
            storage.push(payload, overflow)?;
        }
        Ok(())
    }

    /// Single-consumer pop: only meaningful while nobody has subscribed.
    pub fn pop(&mut self, overflow: &mut DiskOverflowEngine) -> Result<Option<Vec<u8>>, StorageError> {
        match self.storage_unless_subscribed() {
            Some(storage) => storage.pop(overflow),
            None => Ok(None),
        }
    }

    /// `subscribe(name)`: returns the existing storage for
    /// `subscriber`, or creates one, promoting the channel's state.
    pub fn subscribe(
        &mut self,
        subscriber: &str,
        overflow: &mut DiskOverflowEngine,
        make_storage: impl FnOnce(&str) -> StorageEngine,
    ) -> Result<&mut StorageEngine, OverflowError> {
        let key = Some(subscriber.to_string());
        if self.storages.contains_key(&key) {
            return Ok(self.storages.get_mut(&key).expect("checked above"));
        }

        match self.state {
            ChannelState::Subscribed => {
                let storage_id = subscriber_storage_id(subscriber, &self.name);
                self.storages.insert(key.clone(), make_storage(&storage_id));
            }
            ChannelState::Anonymous => {
                let mut storage = self
                    .storages
                    .remove(&None)
                    .expect("anonymous storage present in Anonymous state");
                let old_id = storage.storage_id().to_string();
                let new_id = subscriber_storage_id(subscriber, &self.name);
                if overflow.contains_channel(&old_id) {
                    overflow.rename(&old_id, &new_id)?;
                }
                storage.set_storage_id(new_id);
                self.storages.insert(key.clone(), storage);
                self.state = ChannelState::Subscribed;
            }
            ChannelState::Reset => {
                let storage_id = subscriber_storage_id(subscriber, &self.name);
                self.storages.insert(key.clone(), make_storage(&storage_id));
                self.state = ChannelState::Subscribed;
            }
        }
        Ok(self.storages.get_mut(&key).expect("just inserted"))
    }

    pub fn clear(&mut self, overflow: &mut DiskOverflowEngine) -> Result<(), StorageError> {
        for storage in self.storages.values_mut() {
            storage.clear(overflow)?;
        }
        Ok(())
    }

    pub fn flush(&mut self) {
        for storage in self.storages.values_mut() {
            storage.flush();
        }
    }

    pub fn close(&mut self, dir: &Path) -> Result<(), StorageError> {
        for storage in self.storages.values_mut() {
            storage.close(dir)?;
        }
        Ok(())
    }

    /// Installs a storage discovered during the startup scan, either from a loaded `.rq` dump or freshly created for an
    /// overflow-only channel. `subscriber` mirrors [`crate::naming::StorageName::subscriber`]:
    /// `None` is the true anonymous storage, `Some("")` is the default
    /// subscriber created by promotion.
    ///
    /// Idempotent for a subscriber name already installed (the `.rq` pass
    /// may have already loaded it); fatal if the overflow pass finds an
    /// anonymous-shaped entry on an already-subscribed channel.
    pub fn load_storage(
        &mut self,
        subscriber: Option<&str>,
        make_storage: impl FnOnce(&str) -> StorageEngine,
    ) -> Result<(), RecoveryError> {
        match (subscriber, self.state) {
            (None, ChannelState::Reset) => {
                self.storages.insert(None, make_storage(&self.name));
                self.state = ChannelState::Anonymous;
                Ok(())
            }
            (None, ChannelState::Anonymous) => Ok(()),
            (None, ChannelState::Subscribed) => StartupSubscriberMismatchSnafu {
                name: self.name.clone(),
                dump_channel: self.name.clone(),
            }
            .fail(),
            (Some(sub), ChannelState::Reset) => {
                let storage_id = subscriber_storage_id(sub, &self.name);
                self.storages
                    .insert(Some(sub.to_string()), make_storage(&storage_id));
                self.state = ChannelState::Subscribed;
                Ok(())
            }
            (Some(sub), ChannelState::Subscribed) => {
                let key = Some(sub.to_string());
                if !self.storages.contains_key(&key) {
                    let storage_id = subscriber_storage_id(sub, &self.name);
                    self.storages.insert(key, make_storage(&storage_id));
                }
                Ok(())
            }
            (Some(_), ChannelState::Anonymous) => StartupSubscriberMismatchSnafu {
                name: self.name.clone(),
                dump_channel: self.name.clone(),
            }
            .fail(),
        }
    }

    /// Broadcasts `Finish` on every storage, drains them for the caller to
    /// return to the free-list pool, and returns the channel to
    /// [`ChannelState::Reset`].
    pub fn reset(&mut self) -> Vec<StorageEngine> {
        let mut drained: Vec<StorageEngine> = self.storages.drain().map(|(_, s)| s).collect();
        for storage in drained.iter_mut() {
            storage.notify_finish();
        }
        self.state = ChannelState::Reset;
        drained
    }
}
