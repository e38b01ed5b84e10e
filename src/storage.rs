//! The per-storage engine: one memory ring fronting one overflow channel,
//! plus its consumer listeners.
//!
//! A "storage" is either the anonymous storage for a channel or one
//! subscriber's storage; both are represented by the same [`StorageEngine`],
//! keyed by its `storage_id` (`subscriber@channel` or bare `channel`).

use std::path::Path;

use snafu::ResultExt;
use tracing::trace;

use crate::error::{RingDecodeSnafu, StorageError};
use crate::overflow::DiskOverflowEngine;
use crate::posix::PosixFile;
use crate::ring::MemoryRingQueue;

/// Event delivered to a registered consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerEvent {
    /// A record became available. Delivered to exactly one listener,
    /// rotating strictly across the registered set.
    DataReady,
    /// Broadcast to every listener.
    Flush,
    /// Broadcast to every listener (storage reset or removal).
    Finish,
}

/// Opaque handle returned by [`StorageEngine::register_consumer`], used to
/// unregister later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConsumerId(u64);

#[derive(Default)]
struct ConsumerRegistry {
    next_id: u64,
    listeners: Vec<(u64, Box<dyn FnMut(ConsumerEvent)>)>,
    next_round_robin: usize,
}

impl ConsumerRegistry {
    fn register(&mut self, listener: Box<dyn FnMut(ConsumerEvent)>) -> ConsumerId {
        let id = self.next_id;
        self.next_id += 1;
        self.listeners.push((id, listener));
        ConsumerId(id)
    }

    fn unregister(&mut self, id: ConsumerId) {
        if let Some(pos) = self.listeners.iter().position(|(lid, _)| *lid == id.0) {
            self.listeners.remove(pos);
            if self.next_round_robin > pos {
                self.next_round_robin -= 1;
            }
        }
    }

    fn notify_data_ready(&mut self) {
        if self.listeners.is_empty() {
            return;
        }
        let idx = self.next_round_robin % self.listeners.len();
        self.next_round_robin = (idx + 1) % self.listeners.len();
        (self.listeners[idx].1)(ConsumerEvent::DataReady);
    }

    fn broadcast(&mut self, event: ConsumerEvent) {
        for (_, listener) in self.listeners.iter_mut() {
            listener(event);
        }
    }
}

/// Combines one [`MemoryRingQueue`] and one overflow channel (addressed by
/// `storage_id` in the shared [`DiskOverflowEngine`]).
pub struct StorageEngine {
    storage_id: String,
    ring: MemoryRingQueue,
    consumers: ConsumerRegistry,
}

impl StorageEngine {
    pub fn new(storage_id: String, ring_capacity: usize) -> Self {
        Self {
            storage_id,
            ring: MemoryRingQueue::new(ring_capacity),
            consumers: ConsumerRegistry::default(),
        }
    }

    pub fn storage_id(&self) -> &str {
        &self.storage_id
    }

    /// Renames in place; no data is moved.
    pub fn set_storage_id(&mut self, storage_id: String) {
        self.storage_id = storage_id;
    }

    pub fn ring_mut(&mut self) -> &mut MemoryRingQueue {
        &mut self.ring
    }

    /// Tries the memory ring first; on overflow, delegates to the disk
    /// engine. Notifies `DataReady` on either path.
    pub fn push(&mut self, payload: &[u8], overflow: &mut DiskOverflowEngine) -> Result<(), StorageError> {
        if !self.ring.push(payload) {
            overflow.push(&self.storage_id, payload)?;
            trace!(storage = %self.storage_id, "pushed to overflow tier");
        }
        self.consumers.notify_data_ready();
        Ok(())
    }

    /// Tries the memory ring first; falls back to disk overflow.
    pub fn pop(&mut self, overflow: &mut DiskOverflowEngine) -> Result<Option<Vec<u8>>, StorageError> {
        if let Some(payload) = self.ring.pop() {
            return Ok(Some(payload));
        }
        Ok(overflow.pop(&self.storage_id)?)
    }

    pub fn num_records(&self, overflow: &DiskOverflowEngine) -> u64 {
        self.ring.length() as u64 + overflow.num_records(&self.storage_id)
    }

    pub fn num_bytes(&self, overflow: &DiskOverflowEngine) -> u64 {
        self.ring.used_space() as u64 + overflow.num_bytes(&self.storage_id)
    }

    pub fn clear(&mut self, overflow: &mut DiskOverflowEngine) -> Result<(), StorageError> {
        self.ring.clear();
        if overflow.contains_channel(&self.storage_id) {
            overflow.clear(&self.storage_id)?;
        }
        Ok(())
    }

    /// Broadcasts `Flush` to consumers. Durable sync of the overflow tier
    /// itself is a whole-engine operation driven by the registry, not a
    /// per-storage one.
    pub fn flush(&mut self) {
        self.consumers.broadcast(ConsumerEvent::Flush);
    }

    /// Writes the memory ring to `<storage_id>.rq` in `dir` if non-empty;
    /// removes a stale dump file otherwise. Broadcasts `Finish`.
    pub fn close(&mut self, dir: &Path) -> Result<(), StorageError> {
        let dump_path = format!("{}.rq", self.storage_id);
        if self.ring.is_empty() {
            let path = dir.join(&dump_path);
            if path.exists() {
                std::fs::remove_file(&path).context(crate::error::IoSnafu {
                    path,
                    op: "unlink",
                })?;
            }
        } else {
            let file = PosixFile::open(dir, &dump_path)?;
            let bytes = self.ring.to_bytes();
            file.reset()?;
            file.pwrite(&bytes, 0)?;
            file.flush()?;
        }
        self.consumers.broadcast(ConsumerEvent::Finish);
        Ok(())
    }

    /// Loads a memory ring from an on-disk `<storage_id>.rq` dump.
    pub fn load_dump(dir: &Path, file_name: &str, storage_id: String, ring_capacity: usize) -> Result<Self, StorageError> {
        let file = PosixFile::open(dir, file_name)?;
        let len = file.len()?;
        let mut buf = vec![0u8; len as usize];
        file.pread(&mut buf, 0)?;
        let path = dir.join(file_name);
        let ring = MemoryRingQueue::from_bytes(&buf, ring_capacity).context(RingDecodeSnafu { path })?;
        Ok(Self {
            storage_id,
            ring,
            consumers: ConsumerRegistry::default(),
        })
    }

    pub fn register_consumer(&mut self, listener: Box<dyn FnMut(ConsumerEvent)>) -> ConsumerId {
        self.consumers.register(listener)
    }

    pub fn unregister_consumer(&mut self, id: ConsumerId) {
        self.consumers.unregister(id);
    }

    /// Broadcasts `Finish` without touching the dump file (channel-level
    /// `reset`, as opposed to storage `close`).
    pub fn notify_finish(&mut self) {
        self.consumers.broadcast(ConsumerEvent::Finish);
    }

    /// Clears the ring and drops all registered consumers so this instance
    /// can be handed back out of the free-list pool under a new id.
    pub fn recycle(&mut self) {
        self.ring.clear();
        self.consumers = ConsumerRegistry::default();
    }

    pub fn ring_capacity(&self) -> usize {
        self.ring.total_space()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn engine(dir: &Path) -> DiskOverflowEngine {
        DiskOverflowEngine::open(dir).unwrap()
    }

    #[test]
    fn push_pop_stays_in_memory_tier_when_it_fits() {
        let dir = tempdir::TempDir::new("storage").unwrap();
        let mut overflow = engine(dir.path());
        let mut storage = StorageEngine::new("ch".to_string(), 1024);
        storage.push(b"hello", &mut overflow).unwrap();
        assert_eq!(overflow.total_records(), 0);
        assert_eq!(storage.pop(&mut overflow).unwrap().unwrap(), b"hello");
    }

    #[test]
    fn push_overflows_to_disk_when_memory_full() {
        let dir = tempdir::TempDir::new("storage").unwrap();
        let mut overflow = engine(dir.path());
        let mut storage = StorageEngine::new("ch".to_string(), 4);
        storage.push(b"hello", &mut overflow).unwrap();
        assert_eq!(overflow.total_records(), 1);
        assert_eq!(storage.pop(&mut overflow).unwrap().unwrap(), b"hello");
    }

    #[test]
    fn data_ready_round_robins_across_listeners() {
        let dir = tempdir::TempDir::new("storage").unwrap();
        let mut overflow = engine(dir.path());
        let mut storage = StorageEngine::new("ch".to_string(), 1024);
        let hits: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
        let h1 = hits.clone();
        let h2 = hits.clone();
        storage.register_consumer(Box::new(move |_| h1.borrow_mut().push(1)));
        storage.register_consumer(Box::new(move |_| h2.borrow_mut().push(2)));
        storage.push(b"a", &mut overflow).unwrap();
        storage.push(b"b", &mut overflow).unwrap();
        storage.push(b"c", &mut overflow).unwrap();
        assert_eq!(*hits.borrow(), vec![1, 2, 1]);
    }

    #[test]
    fn close_writes_and_removes_dump_file() {
        let dir = tempdir::TempDir::new("storage").unwrap();
        let mut overflow = engine(dir.path());
        let mut storage = StorageEngine::new("s1@ch".to_string(), 1024);
        storage.push(b"data", &mut overflow).unwrap();
        storage.close(dir.path()).unwrap();
        assert!(dir.path().join("s1@ch.rq").exists());

        let mut reloaded =
            StorageEngine::load_dump(dir.path(), "s1@ch.rq", "s1@ch".to_string(), 1024).unwrap();
        assert_eq!(reloaded.pop(&mut overflow).unwrap().unwrap(), b"data");
    }
}
