//! Record files on disk.
//!
//! One file per pair, named by a random 64-bit integer in decimal. Names
//! are not checked for collisions.

use std::fs::{self, File, OpenOptions, Permissions};
use std::io::{self, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use prost::Message;
use thiserror::Error;

use crate::observability::metrics::{RECORDS_WRITTEN_TOTAL, RECORD_BYTES_TOTAL};
use crate::record::schema::RequestResponse;

/// Owner and group read/write, no world access.
pub const DEFAULT_FILE_MODE: u32 = 0o660;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("record is missing its request or response")]
    Incomplete,

    #[error("failed to encode record: {0}")]
    Encode(#[from] prost::EncodeError),

    #[error("failed to write record {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Writes completed pairs into a directory.
#[derive(Debug, Clone)]
pub struct RecordWriter {
    dir: PathBuf,
    mode: u32,
}

impl RecordWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_mode(dir, DEFAULT_FILE_MODE)
    }

    pub fn with_mode(dir: impl Into<PathBuf>, mode: u32) -> Self {
        Self {
            dir: dir.into(),
            mode,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn mode(&self) -> u32 {
        self.mode
    }

    /// Encode and persist one pair, returning the file it went to.
    pub fn write(&self, record: &RequestResponse) -> Result<PathBuf, RecordError> {
        if !record.is_complete() {
            return Err(RecordError::Incomplete);
        }

        let mut encoded = Vec::with_capacity(record.encoded_len());
        record.encode(&mut encoded)?;

        let path = self.dir.join(rand::random::<u64>().to_string());
        write_new_file(&path, self.mode, |file| file.write_all(&encoded)).map_err(|source| {
            RecordError::Io {
                path: path.clone(),
                source,
            }
        })?;

        metrics::counter!(RECORDS_WRITTEN_TOTAL).increment(1);
        metrics::counter!(RECORD_BYTES_TOTAL).increment(encoded.len() as u64);

        Ok(path)
    }
}

/// Create `path` with exactly `mode` and let `fill` write it.
///
/// A file that fails part way is removed again.
fn write_new_file<F>(path: &Path, mode: u32, fill: F) -> io::Result<()>
where
    F: FnOnce(&mut File) -> io::Result<()>,
{
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(path)?;

    // Creation mode is filtered by the umask.
    let result = file
        .set_permissions(Permissions::from_mode(mode))
        .and_then(|()| fill(&mut file));

    if let Err(e) = result {
        drop(file);
        if let Err(remove_err) = fs::remove_file(path) {
            tracing::warn!(path = %path.display(), error = %remove_err, "Failed to remove partial record");
        }
        return Err(e);
    }
    Ok(())
}

/// Read one record file back.
pub fn read_record(path: &Path) -> io::Result<RequestResponse> {
    let bytes = fs::read(path)?;
    RequestResponse::decode(bytes.as_slice())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
