//! The index file: a buffered text stream persisting per-channel metadata
//! (`ofchannels.csv`).
//!
//! Line format: `<storage_name> <records> <bytes> <first_offset>
//! <last_offset>`. The channel id is not stored; recovery re-derives it from
//! the channel's first record header.

use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use snafu::ResultExt;
use tracing::warn;

use crate::channel_meta::ChannelMeta;
use crate::error::{IndexParseSnafu, RecoveryIoSnafu, RecoveryError};
use crate::naming::StorageName;
use crate::posix::PosixFile;
use crate::signal::with_signals_blocked;

/// One parsed line of the index file, with `id` left as `0`.
pub struct ParsedLine {
    pub name: String,
    pub meta: ChannelMeta,
}

/// Wraps the data-file-style POSIX file as a line-oriented text format.
pub struct IndexFile {
    inner: PosixFile,
}

impl IndexFile {
    pub fn open(dir: &Path, name: &str) -> Result<Self, RecoveryError> {
        let inner = PosixFile::open(dir, name).context(RecoveryIoSnafu)?;
        Ok(Self { inner })
    }

    pub fn path(&self) -> &Path {
        self.inner.path()
    }

    pub fn remove(self) -> Result<(), crate::error::PosixError> {
        self.inner.remove()
    }

    pub fn reset(&self) -> Result<(), crate::error::PosixError> {
        self.inner.reset()
    }

    pub fn close(mut self) {
        self.inner.close()
    }

    /// Reads every line, invoking `handler(line_number, parsed)` for each.
    /// `line_number` is 1-based. Blank/whitespace-only trailing content is
    /// tolerated; anything else that fails to parse is a [`RecoveryError`].
    pub fn read<F>(&self, mut handler: F) -> Result<(), RecoveryError>
    where
        F: FnMut(usize, ParsedLine) -> Result<(), RecoveryError>,
    {
        let len = self.inner.len().context(RecoveryIoSnafu)?;
        if len == 0 {
            return Ok(());
        }
        let mut buf = vec![0u8; len as usize];
        self.inner.pread(&mut buf, 0).context(RecoveryIoSnafu)?;
        let reader = BufReader::new(&buf[..]);

        for (idx, line) in reader.lines().enumerate() {
            let line_no = idx + 1;
            let line = line.map_err(|e| crate::error::PosixError::Io {
                path: self.path().to_path_buf(),
                op: "read",
                source: e,
            })?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let parsed = parse_line(self.path(), line_no, trimmed)?;
            handler(line_no, parsed)?;
        }
        Ok(())
    }

    /// Truncates the file, then writes one line per `(name, meta)` yielded
    /// by `entries`. Runs with all non-fatal signals blocked
    /// because a formatted-write stream can't safely resume after an
    /// interrupt.
    pub fn write<'a, I>(&self, entries: I) -> Result<(), crate::error::PosixError>
    where
        I: IntoIterator<Item = (&'a str, &'a ChannelMeta)>,
    {
        with_signals_blocked(|| {
            self.inner.reset()?;
            let mut out = Vec::new();
            for (name, meta) in entries {
                writeln!(
                    out,
                    "{} {} {} {} {}",
                    name, meta.records, meta.bytes, meta.first_offset, meta.last_offset
                )
                .expect("writing to an in-memory buffer cannot fail");
            }
            if !out.is_empty() {
                self.inner.pwrite(&out, 0)?;
            }
            self.inner.flush()
        })
    }
}

fn parse_line(path: &Path, line_no: usize, line: &str) -> Result<ParsedLine, RecoveryError> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() != 5 {
        return IndexParseSnafu {
            path: path.to_path_buf(),
            line: line_no,
            reason: format!("expected 5 whitespace-separated fields, found {}", tokens.len()),
        }
        .fail();
    }
    let [name, records, bytes, first_offset, last_offset] = [
        tokens[0], tokens[1], tokens[2], tokens[3], tokens[4],
    ];

    let storage_name = StorageName::parse(name).map_err(|reason| {
        IndexParseSnafu {
            path: path.to_path_buf(),
            line: line_no,
            reason: format!("invalid storage name {name:?}: {reason}"),
        }
        .build()
    })?;
    let _ = storage_name;

    let records: u64 = records.parse().map_err(|_| {
        IndexParseSnafu {
            path: path.to_path_buf(),
            line: line_no,
            reason: format!("invalid records field {records:?}"),
        }
        .build()
    })?;
    let bytes: u64 = bytes.parse().map_err(|_| {
        IndexParseSnafu {
            path: path.to_path_buf(),
            line: line_no,
            reason: format!("invalid bytes field {bytes:?}"),
        }
        .build()
    })?;
    let first_offset: i64 = first_offset.parse().map_err(|_| {
        IndexParseSnafu {
            path: path.to_path_buf(),
            line: line_no,
            reason: format!("invalid first_offset field {first_offset:?}"),
        }
        .build()
    })?;
    let last_offset: i64 = last_offset.parse().map_err(|_| {
        IndexParseSnafu {
            path: path.to_path_buf(),
            line: line_no,
            reason: format!("invalid last_offset field {last_offset:?}"),
        }
        .build()
    })?;

    if records == 0 {
        return crate::error::EmptyChannelInIndexSnafu {
            path: path.to_path_buf(),
            line: line_no,
            name: name.to_string(),
        }
        .fail();
    }
    if first_offset < 0 || last_offset < 0 {
        return IndexParseSnafu {
            path: path.to_path_buf(),
            line: line_no,
            reason: "offsets must not be negative".to_string(),
        }
        .fail();
    }

    let mut meta = ChannelMeta::new(0);
    meta.records = records;
    meta.bytes = bytes;
    meta.first_offset = first_offset as u64;
    meta.last_offset = last_offset as u64;
    meta.tracked = true;
    if records == 1 && meta.first_offset != meta.last_offset {
        warn!(
            name,
            line_no, "single-record channel in index has mismatched first/last offset"
        );
        return IndexParseSnafu {
            path: path.to_path_buf(),
            line: line_no,
            reason: "records == 1 but first_offset != last_offset".to_string(),
        }
        .fail();
    }
    if records > 1 && meta.first_offset >= meta.last_offset {
        return IndexParseSnafu {
            path: path.to_path_buf(),
            line: line_no,
            reason: "records > 1 but first_offset >= last_offset".to_string(),
        }
        .fail();
    }

    Ok(ParsedLine {
        name: name.to_string(),
        meta,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(records: u64, bytes: u64, first: u64, last: u64) -> ChannelMeta {
        let mut m = ChannelMeta::new(0);
        m.records = records;
        m.bytes = bytes;
        m.first_offset = first;
        m.last_offset = last;
        m.tracked = true;
        m
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempdir::TempDir::new("index").unwrap();
        let index = IndexFile::open(dir.path(), "ofchannels.csv").unwrap();
        let entries = vec![
            ("orders".to_string(), meta(2, 20, 8, 40)),
            ("s1@orders".to_string(), meta(1, 5, 8, 8)),
        ];
        let borrowed: Vec<(&str, &ChannelMeta)> =
            entries.iter().map(|(n, m)| (n.as_str(), m)).collect();
        index.write(borrowed).unwrap();

        let mut seen = Vec::new();
        index
            .read(|_, parsed| {
                seen.push((parsed.name, parsed.meta.records, parsed.meta.bytes));
                Ok(())
            })
            .unwrap();
        assert_eq!(
            seen,
            vec![
                ("orders".to_string(), 2, 20),
                ("s1@orders".to_string(), 1, 5),
            ]
        );
    }

    #[test]
    fn rejects_empty_channel() {
        let dir = tempdir::TempDir::new("index").unwrap();
        let index = IndexFile::open(dir.path(), "ofchannels.csv").unwrap();
        index.inner.pwrite(b"orders 0 0 0 0\n", 0).unwrap();
        let result = index.read(|_, _| Ok(()));
        assert!(result.is_err());
    }

    #[test]
    fn tolerates_trailing_whitespace() {
        let dir = tempdir::TempDir::new("index").unwrap();
        let index = IndexFile::open(dir.path(), "ofchannels.csv").unwrap();
        index.inner.pwrite(b"orders 1 5 8 8\n   \n", 0).unwrap();
        let mut count = 0;
        index
            .read(|_, _| {
                count += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(count, 1);
    }
}
