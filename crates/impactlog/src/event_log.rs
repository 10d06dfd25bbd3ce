//! Append-only impact log.
//!
//! The log is a small CSV file: one header row followed by one
//! `timestamp,magnitude` row per recorded impact. It is shared between the
//! sampling thread (the only writer) and the HTTP server (readers). A single
//! exclusive lock covers both appends and snapshots so that a reader never
//! observes a half-written row, and the version counter is published while that
//! lock is held.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tracing::{debug, info, trace};

/// Errors surfaced by the event log.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The log file could not be created or truncated.
    #[error("failed to create event log at {path}: {source}")]
    Create {
        /// Path of the log file.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// A record could not be durably written.
    #[error("failed to append to event log at {path}: {source}")]
    Write {
        /// Path of the log file.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// The log could not be read back.
    #[error("failed to read event log at {path}: {source}")]
    Read {
        /// Path of the log file.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// A field would break the one-row-per-line format.
    #[error("field {field:?} contains a comma or line break")]
    MalformedRecord {
        /// The offending field.
        field: String,
    },
}

/// One recorded impact, already formatted by the producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    timestamp: String,
    magnitude: String,
}

impl Record {
    /// Create a record from preformatted fields.
    #[must_use]
    pub fn new(timestamp: impl Into<String>, magnitude: impl Into<String>) -> Self {
        Self {
            timestamp: timestamp.into(),
            magnitude: magnitude.into(),
        }
    }

    /// The formatted timestamp.
    #[must_use]
    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    /// The formatted magnitude.
    #[must_use]
    pub fn magnitude(&self) -> &str {
        &self.magnitude
    }

    /// Render the record as a newline-terminated log line.
    #[must_use]
    pub fn to_line(&self) -> String {
        format!("{},{}\n", self.timestamp, self.magnitude)
    }

    /// Parse a log line back into a record, splitting on the first comma.
    #[must_use]
    pub fn parse_line(line: &str) -> Option<Self> {
        let (timestamp, magnitude) = line.trim_end_matches(&['\r', '\n'][..]).split_once(',')?;
        Some(Self::new(timestamp, magnitude))
    }

    fn validate(&self) -> Result<(), StorageError> {
        check_field(&self.timestamp)?;
        check_field(&self.magnitude)
    }
}

fn check_field(field: &str) -> Result<(), StorageError> {
    if field.contains(&[',', '\n', '\r'][..]) {
        return Err(StorageError::MalformedRecord {
            field: field.to_string(),
        });
    }
    Ok(())
}

/// Content of the log as it existed at one instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSnapshot {
    content: String,
    version: u64,
}

impl LogSnapshot {
    /// The raw persisted content, header included.
    #[must_use]
    pub fn content(&self) -> &str {
        &self.content
    }

    /// The version that was current when the snapshot was taken.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// The header row, if the log is not empty.
    #[must_use]
    pub fn header(&self) -> Option<&str> {
        self.lines().next()
    }

    /// Body rows, header excluded.
    pub fn rows(&self) -> impl Iterator<Item = &str> {
        self.lines().skip(1)
    }

    /// Number of body rows.
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.rows().count()
    }

    fn lines(&self) -> impl Iterator<Item = &str> {
        self.content.lines().map(str::trim).filter(|l| !l.is_empty())
    }
}

/// Path to the log file, reopened for every append and read; only reachable
/// through the lock.
#[derive(Debug)]
struct LogFile {
    path: PathBuf,
}

impl LogFile {
    fn append_line(&mut self, line: &str) -> io::Result<()> {
        // No `create`: a missing file means the medium went away, and
        // recreating it here would lose the header.
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        let len = file.metadata()?.len();
        let written = file
            .write_all(line.as_bytes())
            .and_then(|()| file.flush())
            .and_then(|()| file.sync_data());
        if let Err(err) = written {
            // Roll back a torn row; the original error is what matters.
            let _ = file.set_len(len);
            return Err(err);
        }
        Ok(())
    }

    fn read_all(&self) -> io::Result<String> {
        fs::read_to_string(&self.path)
    }
}

/// Durable append-only record store shared by the sampler and the server.
#[derive(Debug)]
pub struct EventLog {
    path: PathBuf,
    header: String,
    file: Mutex<LogFile>,
    version: AtomicU64,
}

impl EventLog {
    /// Create the log at `path`, discarding anything already there.
    ///
    /// Parent directories are created as needed and the header row is written
    /// from `columns`. The version starts at zero.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::MalformedRecord`] if a column name contains a
    /// comma or line break, and [`StorageError::Create`] if the file cannot be
    /// written.
    pub fn create(path: impl AsRef<Path>, columns: &[String]) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        for column in columns {
            check_field(column)?;
        }
        let header = columns.join(",");

        let create_err = |source| StorageError::Create {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).map_err(create_err)?;
            }
        }

        debug!("Truncating event log at {}", path.display());
        let mut file = fs::File::create(&path).map_err(create_err)?;
        file.write_all(header.as_bytes())
            .and_then(|()| file.write_all(b"\n"))
            .and_then(|()| file.sync_all())
            .map_err(create_err)?;

        info!("Event log ready at {}", path.display());
        Ok(Self {
            file: Mutex::new(LogFile { path: path.clone() }),
            path,
            header,
            version: AtomicU64::new(0),
        })
    }

    /// Path of the log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The header row, without its line terminator.
    #[must_use]
    pub fn header(&self) -> &str {
        &self.header
    }

    /// Append one impact and bump the version.
    ///
    /// # Errors
    ///
    /// Returns a [`StorageError`] if either field is malformed or the write
    /// fails. The version is unchanged in both cases.
    pub fn append(&self, timestamp: &str, magnitude: &str) -> Result<(), StorageError> {
        self.append_record(&Record::new(timestamp, magnitude))
    }

    /// Append a prebuilt record and bump the version.
    ///
    /// # Errors
    ///
    /// See [`EventLog::append`].
    pub fn append_record(&self, record: &Record) -> Result<(), StorageError> {
        record.validate()?;
        let line = record.to_line();

        let mut file = self.lock();
        file.append_line(&line)
            .map_err(|source| StorageError::Write {
                path: self.path.clone(),
                source,
            })?;
        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        drop(file);

        trace!(version, "Appended {}", line.trim_end());
        Ok(())
    }

    /// Read the whole log under the lock.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Read`] if the file cannot be read.
    pub fn snapshot(&self) -> Result<LogSnapshot, StorageError> {
        let file = self.lock();
        let content = file.read_all().map_err(|source| StorageError::Read {
            path: self.path.clone(),
            source,
        })?;
        let version = self.version.load(Ordering::Acquire);
        drop(file);

        Ok(LogSnapshot { content, version })
    }

    /// Number of completed appends.
    #[must_use]
    pub fn current_version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    fn lock(&self) -> MutexGuard<'_, LogFile> {
        // A panic mid-append leaves at most a rolled-back row on disk, so the
        // guarded state is still usable.
        self.file.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
