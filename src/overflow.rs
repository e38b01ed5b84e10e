//! The disk overflow engine: owns the data and index files plus the channel
//! registry, and implements push/pop/clear/rename/remove/flush/close and
//! startup recovery.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use snafu::{OptionExt, ResultExt};
use tracing::{debug, instrument, trace, warn};

use crate::channel_meta::ChannelMeta;
use crate::data_file::{DataFile, COLLAPSE_CHUNK};
use crate::error::{
    self, BadMagicSnafu, ChannelIdSpaceExhaustedSnafu, ConsistencySnafu,
    DataFileTooSmallSnafu, DuplicateChannelIdSnafu, DuplicateChannelNameSnafu,
    DuplicateFirstOffsetSnafu, DuplicateLastOffsetSnafu, LastOffsetOutOfRangeSnafu,
    OverflowError, OverflowIoSnafu, RecoveryError, RecoveryIoSnafu, ShutdownInProgressSnafu,
    UnknownChannelSnafu,
};
use crate::index_file::IndexFile;
use crate::posix::IoSlice;
use crate::record::{RecordHeader, DATA_FILE_MAGIC, DUMMY_CHANNEL_ID, HEADER_SIZE};
use crate::tracker::FirstOffsetTracker;

pub const DATA_FILE_NAME: &str = "overflow.dat";
pub const INDEX_FILE_NAME: &str = "ofchannels.csv";

/// Owns the shared overflow files and every channel's metadata.
pub struct DiskOverflowEngine {
    dir: PathBuf,
    data_file: DataFile,
    index_file: IndexFile,
    channels: HashMap<String, ChannelMeta>,
    tracker: FirstOffsetTracker,
    total_records: u64,
    total_bytes: u64,
    highest_channel_id: u32,
    shutdown: bool,
}

impl DiskOverflowEngine {
    /// Opens (or creates) the overflow files in `dir` and recovers prior
    /// state.
    #[instrument(skip_all, fields(dir = %dir.display()))]
    pub fn open(dir: &Path) -> Result<Self, RecoveryError> {
        std::fs::create_dir_all(dir).map_err(|e| error::PosixError::Io {
            path: dir.to_path_buf(),
            op: "mkdir",
            source: e,
        })?;
        let data_file = DataFile::open(dir, DATA_FILE_NAME).context(error::RecoveryIoSnafu)?;
        let index_file = IndexFile::open(dir, INDEX_FILE_NAME)?;

        let mut engine = Self {
            dir: dir.to_path_buf(),
            data_file,
            index_file,
            channels: HashMap::new(),
            tracker: FirstOffsetTracker::new(),
            total_records: 0,
            total_bytes: 0,
            highest_channel_id: 0,
            shutdown: false,
        };
        engine.recover()?;
        Ok(engine)
    }

    fn data_path(&self) -> PathBuf {
        self.data_file.path().to_path_buf()
    }

    /// Whether this filesystem supports the `collapse_range` fast path head
    /// truncation relies on; `flush()` silently skips truncation without it.
    pub fn head_truncation_supported(&self) -> bool {
        self.data_file.collapse_range_supported
    }

    // ---- recovery -------------------------------------

    fn recover(&mut self) -> Result<(), RecoveryError> {
        let file_size = self.data_file.len().context(error::RecoveryIoSnafu)?;
        if file_size == 0 {
            debug!("data file is empty, starting with no recovered channels");
        } else {
            let mut magic = [0u8; 8];
            self.data_file
                .pread(&mut magic, 0)
                .context(error::RecoveryIoSnafu)?;
            if &magic != DATA_FILE_MAGIC {
                return BadMagicSnafu {
                    path: self.data_path(),
                    expected: DATA_FILE_MAGIC,
                    found: magic.to_vec(),
                }
                .fail();
            }
        }

        let index_path = self.index_file.path().to_path_buf();
        let mut seen_names: HashMap<String, usize> = HashMap::new();
        let mut seen_ids: HashMap<u32, String> = HashMap::new();
        let mut seen_first_offsets: HashMap<u64, String> = HashMap::new();
        let mut seen_last_offsets: HashMap<u64, String> = HashMap::new();

        let data_file = &self.data_file;
        let channels = &mut self.channels;
        let tracker = &mut self.tracker;
        let total_records = &mut self.total_records;
        let total_bytes = &mut self.total_bytes;
        let highest_channel_id = &mut self.highest_channel_id;

        self.index_file.read(|line_no, parsed| {
            if let Some(_prev) = seen_names.insert(parsed.name.clone(), line_no) {
                return DuplicateChannelNameSnafu {
                    path: index_path.clone(),
                    line: line_no,
                    name: parsed.name.clone(),
                }
                .fail();
            }
            let mut meta = parsed.meta;
            if meta.last_offset >= file_size {
                return LastOffsetOutOfRangeSnafu {
                    path: index_path.clone(),
                    line: line_no,
                    name: parsed.name.clone(),
                    last_offset: meta.last_offset as i64,
                    file_size,
                }
                .fail();
            }

            let first_header = read_and_check_header(data_file, meta.first_offset)
                .map_err(|source| ConsistencySnafu {
                    name: parsed.name.clone(),
                    source,
                }
                .build())?;
            meta.id = first_header.channel_id;
            if meta.id == DUMMY_CHANNEL_ID {
                return ConsistencySnafu {
                    name: parsed.name.clone(),
                    source: OverflowError::ZeroChannelId {
                        path: data_file.path().to_path_buf(),
                        offset: meta.first_offset,
                    },
                }
                .fail();
            }

            let last_header = read_and_check_header(data_file, meta.last_offset)
                .map_err(|source| ConsistencySnafu {
                    name: parsed.name.clone(),
                    source,
                }
                .build())?;
            if last_header.next_offset != 0 || last_header.channel_id != meta.id {
                return ConsistencySnafu {
                    name: parsed.name.clone(),
                    source: OverflowError::ChannelIdMismatch {
                        path: data_file.path().to_path_buf(),
                        offset: meta.last_offset,
                        found: last_header.channel_id,
                        expected: meta.id,
                    },
                }
                .fail();
            }
            meta.last_header = last_header;

            if let Some(first) = seen_ids.insert(meta.id, parsed.name.clone()) {
                return DuplicateChannelIdSnafu {
                    id: meta.id,
                    first,
                    second: parsed.name.clone(),
                }
                .fail();
            }
            if let Some(first) = seen_first_offsets.insert(meta.first_offset, parsed.name.clone())
            {
                return DuplicateFirstOffsetSnafu {
                    offset: meta.first_offset,
                    first,
                    second: parsed.name.clone(),
                }
                .fail();
            }
            if let Some(first) = seen_last_offsets.insert(meta.last_offset, parsed.name.clone()) {
                return DuplicateLastOffsetSnafu {
                    offset: meta.last_offset,
                    first,
                    second: parsed.name.clone(),
                }
                .fail();
            }

            tracker.insert(meta.first_offset, parsed.name.clone());
            *total_records += meta.records;
            *total_bytes += meta.bytes;
            if meta.id > *highest_channel_id {
                *highest_channel_id = meta.id;
            }
            channels.insert(parsed.name, meta);
            Ok(())
        })?;

        if *total_bytes + *total_records * HEADER_SIZE as u64 > file_size {
            return DataFileTooSmallSnafu {
                path: self.data_path(),
                file_size,
                total_bytes: *total_bytes,
                total_records: *total_records,
            }
            .fail();
        }

        debug!(
            channels = self.channels.len(),
            total_records = self.total_records,
            total_bytes = self.total_bytes,
            "overflow engine recovered"
        );
        Ok(())
    }

    // ---- accessors -------------------------------------------------

    pub fn total_records(&self) -> u64 {
        self.total_records
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn channel_names(&self) -> impl Iterator<Item = &str> {
        self.channels.keys().map(|s| s.as_str())
    }

    pub fn channel_meta(&self, name: &str) -> Option<&ChannelMeta> {
        self.channels.get(name)
    }

    pub fn contains_channel(&self, name: &str) -> bool {
        self.channels.contains_key(name)
    }

    pub fn num_records(&self, name: &str) -> u64 {
        self.channels.get(name).map(|m| m.records).unwrap_or(0)
    }

    pub fn num_bytes(&self, name: &str) -> u64 {
        self.channels.get(name).map(|m| m.bytes).unwrap_or(0)
    }

    /// `bytes + records * header size`.
    pub fn total_bytes_for(&self, name: &str) -> u64 {
        self.channels
            .get(name)
            .map(|m| m.bytes + m.records * HEADER_SIZE as u64)
            .unwrap_or(0)
    }

    pub fn begin_shutdown(&mut self) {
        self.shutdown = true;
    }

    // ---- get-or-create -----------------------------

    pub fn get_or_create_channel(&mut self, name: &str) -> Result<u32, OverflowError> {
        if self.shutdown {
            return ShutdownInProgressSnafu.fail();
        }
        if let Some(meta) = self.channels.get(name) {
            return Ok(meta.id);
        }
        if self.highest_channel_id == u32::MAX {
            return ChannelIdSpaceExhaustedSnafu.fail();
        }
        self.highest_channel_id += 1;
        let meta = ChannelMeta::new(self.highest_channel_id);
        let id = meta.id;
        self.channels.insert(name.to_string(), meta);
        Ok(id)
    }

    // ---- push ---------------------------------------

    pub fn push(&mut self, name: &str, payload: &[u8]) -> Result<(), OverflowError> {
        if self.shutdown {
            return ShutdownInProgressSnafu.fail();
        }
        self.get_or_create_channel(name)?;

        let mut pos = self.data_file.len().context(OverflowIoSnafu)?;
        if self.total_records == 0 {
            assert_eq!(pos, 0, "data file must be empty when total_records == 0");
            self.data_file
                .writev(&[IoSlice(DATA_FILE_MAGIC)], 0)
                .context(OverflowIoSnafu)?;
            pos = DATA_FILE_MAGIC.len() as u64;
        }

        let meta = self.channels.get_mut(name).expect("just created above");
        let had_records = meta.records > 0;
        if had_records {
            let mut updated = meta.last_header;
            updated.next_offset = (pos - meta.last_offset) as i64;
            updated.parity = updated.compute_parity();
            self.data_file
                .pwrite(&updated.to_bytes(), meta.last_offset)
                .context(OverflowIoSnafu)?;
            meta.last_header = updated;
        }

        let header = RecordHeader::new(meta.id, 0, payload.len() as u64);
        self.data_file
            .writev(&[IoSlice(&header.to_bytes()), IoSlice(payload)], pos)
            .context(OverflowIoSnafu)?;

        if !had_records {
            meta.first_offset = pos;
            self.tracker.insert(pos, name.to_string());
            meta.tracked = true;
        }
        meta.last_offset = pos;
        meta.last_header = header;
        meta.bytes += payload.len() as u64;
        meta.records += 1;
        self.total_records += 1;
        self.total_bytes += payload.len() as u64;

        trace!(name, offset = pos, len = payload.len(), "pushed record");
        Ok(())
    }

    // ---- pop -----------------------------------------

    /// Pops the next record from `name`'s channel, if any. `get_buffer` is
    /// handed the payload length and must return a buffer of exactly that
    /// size to read into.
    pub fn pop_with<F>(&mut self, name: &str, get_buffer: F) -> Result<Option<Vec<u8>>, OverflowError>
    where
        F: FnOnce(usize) -> Vec<u8>,
    {
        let meta = match self.channels.get(name) {
            Some(meta) if meta.records > 0 => meta.clone(),
            Some(_) => return Ok(None),
            None => return UnknownChannelSnafu { name }.fail(),
        };

        let header = read_and_check_header(&self.data_file, meta.first_offset)?;
        if header.channel_id != meta.id {
            return Err(OverflowError::ChannelIdMismatch {
                path: self.data_path(),
                offset: meta.first_offset,
                found: header.channel_id,
                expected: meta.id,
            });
        }
        if header.next_offset != 0 {
            let next_abs = meta.first_offset as i64 + header.next_offset;
            if next_abs < meta.first_offset as i64 + header.total_size() as i64 {
                return Err(OverflowError::ImpossibleNextOffset {
                    path: self.data_path(),
                    offset: meta.first_offset,
                    next_offset: header.next_offset,
                });
            }
        }

        let mut buf = get_buffer(header.length as usize);
        assert_eq!(buf.len(), header.length as usize);
        self.data_file
            .pread(&mut buf, meta.first_offset + HEADER_SIZE as u64)
            .context(OverflowIoSnafu)?;

        let channel = self.channels.get_mut(name).expect("checked above");
        channel.records -= 1;
        channel.bytes -= header.length;

        if channel.records == 0 {
            assert_eq!(header.next_offset, 0);
            assert_eq!(channel.bytes, 0);
            self.tracker.remove(channel.first_offset);
            channel.reset_to_empty();
        } else if channel.records == 1 {
            assert_eq!(
                channel.first_offset as i64 + header.next_offset,
                channel.last_offset as i64
            );
            self.tracker.remove(channel.first_offset);
            channel.first_offset = (channel.first_offset as i64 + header.next_offset) as u64;
            self.tracker.insert(channel.first_offset, name.to_string());
        } else {
            assert_ne!(header.next_offset, 0);
            self.tracker.remove(channel.first_offset);
            channel.first_offset = (channel.first_offset as i64 + header.next_offset) as u64;
            self.tracker.insert(channel.first_offset, name.to_string());
        }

        self.total_records -= 1;
        self.total_bytes -= header.length;
        if self.total_records == 0 {
            self.truncate_both_to_zero()?;
        }

        trace!(name, "popped record");
        Ok(Some(buf))
    }

    pub fn pop(&mut self, name: &str) -> Result<Option<Vec<u8>>, OverflowError> {
        self.pop_with(name, |len| vec![0u8; len])
    }

    fn truncate_both_to_zero(&mut self) -> Result<(), OverflowError> {
        self.data_file.reset().context(OverflowIoSnafu)?;
        self.index_file.reset().context(OverflowIoSnafu)?;
        Ok(())
    }

    // ---- clear -----------------------------------------

    pub fn clear(&mut self, name: &str) -> Result<(), OverflowError> {
        let meta = self
            .channels
            .get_mut(name)
            .context(UnknownChannelSnafu { name })?;
        if meta.tracked {
            self.tracker.remove(meta.first_offset);
        }
        self.total_records -= meta.records;
        self.total_bytes -= meta.bytes;
        meta.reset_to_empty();
        if self.total_records == 0 {
            self.truncate_both_to_zero()?;
        }
        Ok(())
    }

    // ---- rename / remove -------------------------------

    pub fn rename(&mut self, old_name: &str, new_name: &str) -> Result<(), OverflowError> {
        let meta = self
            .channels
            .remove(old_name)
            .context(UnknownChannelSnafu { name: old_name })?;
        if meta.tracked {
            self.tracker.remove(meta.first_offset);
            self.tracker.insert(meta.first_offset, new_name.to_string());
        }
        self.channels.insert(new_name.to_string(), meta);
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Result<(), OverflowError> {
        self.clear(name)?;
        self.channels.remove(name);
        if self.channels.is_empty() {
            self.highest_channel_id = 0;
        }
        Ok(())
    }

    // ---- flush --------------------------------

    /// Head-minimizes the data file, rewrites the index, and `fdatasync`s
    /// the data file. The only durability barrier.
    #[instrument(skip(self))]
    pub fn flush(&mut self) -> Result<(), OverflowError> {
        self.minimize_data_file_size()?;
        self.write_index()?;
        self.data_file.flush().context(OverflowIoSnafu)?;
        Ok(())
    }

    pub fn write_index(&self) -> Result<(), OverflowError> {
        let entries: Vec<(&str, &ChannelMeta)> = self
            .channels
            .iter()
            .filter(|(_, m)| m.records > 0)
            .map(|(k, v)| (k.as_str(), v))
            .collect();
        self.index_file.write(entries).context(OverflowIoSnafu)?;
        Ok(())
    }

    fn minimize_data_file_size(&mut self) -> Result<(), OverflowError> {
        if !self.data_file.collapse_range_supported || self.tracker.is_empty() {
            return Ok(());
        }
        let (min_offset, min_name) = self.tracker.minimum().unwrap();
        let min_name = min_name.to_string();
        let magic_len = DATA_FILE_MAGIC.len() as u64;
        if min_offset == magic_len {
            return Ok(());
        }

        let n = min_offset - (magic_len + HEADER_SIZE as u64);
        let removed = self.data_file.collapse_head(n).context(OverflowIoSnafu)?;
        if removed == 0 {
            return Ok(());
        }

        self.tracker.decrease_all_by(removed);
        for meta in self.channels.values_mut() {
            if meta.records > 0 {
                meta.first_offset -= removed;
                meta.last_offset -= removed;
            }
        }

        self.data_file
            .writev(&[IoSlice(DATA_FILE_MAGIC)], 0)
            .context(OverflowIoSnafu)?;
        let new_first_offset = min_offset - removed;
        let dummy_len = new_first_offset - magic_len - HEADER_SIZE as u64;
        let dummy = RecordHeader::new(DUMMY_CHANNEL_ID, 0, dummy_len);
        self.data_file
            .pwrite(&dummy.to_bytes(), magic_len)
            .context(OverflowIoSnafu)?;
        if dummy_len > 0 {
            self.data_file
                .zero_range(magic_len + HEADER_SIZE as u64, dummy_len)
                .context(OverflowIoSnafu)?;
        }

        debug!(
            removed,
            min_channel = min_name.as_str(),
            "head-truncated data file"
        );
        Ok(())
    }

    // ---- close -----------------------------------------

    /// Best-effort shutdown: writes the index (if there are records) or
    /// unlinks both files (if there are none). File errors are logged and
    /// swallowed so shutdown always proceeds.
    pub fn close(mut self) {
        if self.total_records > 0 {
            if let Err(e) = self.write_index() {
                warn!(error = %e, "failed to write index on close");
            }
            self.data_file.close();
            self.index_file.close();
        } else {
            let data_path = self.data_path();
            let index_path = self.index_file.path().to_path_buf();
            if let Err(e) = self.data_file.remove() {
                warn!(error = %e, path = %data_path.display(), "failed to remove data file on close");
            }
            if let Err(e) = self.index_file.remove() {
                warn!(error = %e, path = %index_path.display(), "failed to remove index file on close");
            }
        }
    }
}

/// `pread`s and parity/consistency-checks the header at `offset`.
fn read_and_check_header(data_file: &DataFile, offset: u64) -> Result<RecordHeader, OverflowError> {
    let mut buf = [0u8; HEADER_SIZE];
    let read = data_file.pread(&mut buf, offset).context(OverflowIoSnafu)?;
    if read != HEADER_SIZE {
        return Err(OverflowError::TruncatedHeader {
            path: data_file.path().to_path_buf(),
            offset,
            read,
            expected: HEADER_SIZE,
        });
    }
    let header = RecordHeader::from_bytes(&buf);
    if !header.parity_is_valid() {
        return Err(OverflowError::InvalidParity {
            path: data_file.path().to_path_buf(),
            offset,
        });
    }
    Ok(header)
}
