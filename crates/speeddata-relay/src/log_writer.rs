//! Rotating append-only record log.
//!
//! Each record is `long(1) long(len) payload MARKER`, where `long` is the
//! Avro zigzag varint and `MARKER` is the same 16 bytes after every record in
//! every file. Files are named `data_<epoch>.avro` and opened lazily.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use speeddata_core::RotationMode;
use speeddata_core::channel::RotationSettings;
use speeddata_core::db::unix_timestamp;
use tracing::{debug, info};

use crate::error::RelayError;

/// Record delimiter written after every record.
pub const SYNC_MARKER: [u8; 16] = [
    0xa4, 0x8a, 0x1e, 0x90, 0x05, 0x04, 0x24, 0x78, 0x0a, 0x68, 0x33, 0x7f, 0xc2, 0x50, 0x95, 0x63,
];

/// Append `value` as an Avro zigzag varint.
pub fn encode_long(value: i64, out: &mut Vec<u8>) {
    #[allow(clippy::cast_sign_loss)]
    let mut n = ((value << 1) ^ (value >> 63)) as u64;
    while n >= 0x80 {
        #[allow(clippy::cast_possible_truncation)]
        out.push((n as u8 & 0x7f) | 0x80);
        n >>= 7;
    }
    #[allow(clippy::cast_possible_truncation)]
    out.push(n as u8);
}

/// Decode an Avro zigzag varint from the front of `buf`.
/// Returns the value and the number of bytes consumed.
pub fn decode_long(buf: &[u8]) -> Option<(i64, usize)> {
    let mut n: u64 = 0;
    for (i, byte) in buf.iter().enumerate().take(10) {
        n |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            #[allow(clippy::cast_possible_wrap)]
            let value = (n >> 1) as i64 ^ -((n & 1) as i64);
            return Some((value, i + 1));
        }
    }
    None
}

/// Frame one payload as a log record.
pub fn encode_record(payload: &[u8], out: &mut Vec<u8>) {
    encode_long(1, out);
    encode_long(i64::try_from(payload.len()).unwrap_or(i64::MAX), out);
    out.extend_from_slice(payload);
    out.extend_from_slice(&SYNC_MARKER);
}

/// Split a log file's bytes back into payloads.
pub fn read_records(mut buf: &[u8]) -> io::Result<Vec<Vec<u8>>> {
    let invalid = |msg: &str| io::Error::new(io::ErrorKind::InvalidData, msg.to_string());
    let mut records = Vec::new();

    while !buf.is_empty() {
        let (count, used) = decode_long(buf).ok_or_else(|| invalid("truncated block count"))?;
        if count != 1 {
            return Err(invalid("unexpected block count"));
        }
        buf = &buf[used..];

        let (len, used) = decode_long(buf).ok_or_else(|| invalid("truncated length"))?;
        let len = usize::try_from(len).map_err(|_| invalid("negative length"))?;
        buf = &buf[used..];

        if buf.len() < len + SYNC_MARKER.len() {
            return Err(invalid("truncated record"));
        }
        records.push(buf[..len].to_vec());
        if buf[len..len + SYNC_MARKER.len()] != SYNC_MARKER {
            return Err(invalid("missing record marker"));
        }
        buf = &buf[len + SYNC_MARKER.len()..];
    }

    Ok(records)
}

struct OpenLog {
    writer: BufWriter<File>,
    path: PathBuf,
    bytes_written: u64,
}

/// Size-rotated record log for one channel.
pub struct RotatingLog {
    dir: PathBuf,
    rotation: RotationSettings,
    current: Option<OpenLog>,
    scratch: Vec<u8>,
    files_opened: u64,
}

impl RotatingLog {
    pub fn new(dir: impl Into<PathBuf>, rotation: RotationSettings) -> Self {
        Self {
            dir: dir.into(),
            rotation,
            current: None,
            scratch: Vec::with_capacity(1024),
            files_opened: 0,
        }
    }

    /// Path of the file currently open, if any.
    pub fn current_path(&self) -> Option<&Path> {
        self.current.as_ref().map(|c| c.path.as_path())
    }

    pub const fn files_opened(&self) -> u64 {
        self.files_opened
    }

    /// Append one record, rotating first if the current file is full.
    /// The record is flushed before returning.
    pub fn append(&mut self, payload: &[u8]) -> Result<(), RelayError> {
        if self.needs_rotation() {
            self.rotate()?;
        }

        self.scratch.clear();
        encode_record(payload, &mut self.scratch);

        let current = match self.current.take() {
            Some(c) => c,
            None => self.open_next()?,
        };
        let current = self.current.insert(current);
        let written = current
            .writer
            .write_all(&self.scratch)
            .and_then(|()| current.writer.flush());
        if let Err(source) = written {
            return Err(RelayError::LogWrite {
                path: current.path.clone(),
                source,
            });
        }
        current.bytes_written += self.scratch.len() as u64;
        Ok(())
    }

    /// Flush, fsync and close the current file.
    pub fn close(&mut self) -> Result<(), RelayError> {
        let Some(mut current) = self.current.take() else {
            return Ok(());
        };
        let closed = current
            .writer
            .flush()
            .and_then(|()| current.writer.get_ref().sync_all());
        closed.map_err(|source| RelayError::LogWrite {
            path: current.path.clone(),
            source,
        })?;
        debug!(path = %current.path.display(), bytes = current.bytes_written, "Log file closed");
        Ok(())
    }

    fn needs_rotation(&self) -> bool {
        match (&self.current, self.rotation.mode) {
            (Some(c), RotationMode::Size) => c.bytes_written >= self.rotation.threshold,
            _ => false,
        }
    }

    fn rotate(&mut self) -> Result<(), RelayError> {
        if let Some(c) = &self.current {
            info!(path = %c.path.display(), bytes = c.bytes_written, "Rotating log file");
        }
        self.close()
    }

    fn open_next(&mut self) -> Result<OpenLog, RelayError> {
        std::fs::create_dir_all(&self.dir).map_err(|source| RelayError::LogWrite {
            path: self.dir.clone(),
            source,
        })?;

        let epoch = unix_timestamp();
        let mut suffix = 0u32;
        loop {
            let name = if suffix == 0 {
                format!("data_{epoch}.avro")
            } else {
                format!("data_{epoch}_{suffix}.avro")
            };
            let path = self.dir.join(name);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => {
                    info!(path = %path.display(), "Created log file");
                    self.files_opened += 1;
                    return Ok(OpenLog {
                        writer: BufWriter::new(file),
                        path,
                        bytes_written: 0,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => suffix += 1,
                Err(source) => return Err(RelayError::LogWrite { path, source }),
            }
        }
    }
}
