//! Line-delimited record log (durable storage collaborator).

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::queue::QueueError;

/// Append / read / rewrite access to a newline-delimited file.
///
/// Rewrites go through `<path>.tmp` + rename so a crash never leaves a
/// half-written log behind. Unparseable lines can be moved aside into
/// `<path>.corrupt`.
#[derive(Debug, Clone)]
pub struct RecordLog {
    path: PathBuf,
}

impl RecordLog {
    /// Open (and create if missing) the log at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, QueueError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            fs::create_dir_all(parent)?;
        }
        OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current file size in bytes. A missing file counts as empty.
    pub fn len(&self) -> Result<u64, QueueError> {
        match fs::metadata(&self.path) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    pub fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len()? == 0)
    }

    /// Append pre-encoded, newline-terminated lines and sync them to disk.
    ///
    /// All or nothing: on failure the file is truncated back to its previous
    /// length so no line is left half-written or written twice by a retry.
    pub fn append(&self, lines: &[Vec<u8>]) -> Result<(), QueueError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let before = file.metadata()?.len();
        let written = lines
            .iter()
            .try_for_each(|line| file.write_all(line))
            .and_then(|()| file.sync_data());
        if let Err(e) = written {
            if let Err(rollback) = file.set_len(before).and_then(|()| file.sync_data()) {
                tracing::error!(
                    path = %self.path.display(),
                    error = %rollback,
                    "Failed to roll back partial append"
                );
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Read all non-empty lines.
    pub fn read_lines(&self) -> Result<Vec<String>, QueueError> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut lines = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if !line.trim().is_empty() {
                lines.push(line);
            }
        }
        Ok(lines)
    }

    /// Atomically replace the log with `lines`. Returns the new size in bytes.
    pub fn rewrite(&self, lines: &[Vec<u8>]) -> Result<u64, QueueError> {
        let tmp = self.sibling("tmp");
        let mut written = 0u64;
        {
            let mut file = File::create(&tmp)?;
            for line in lines {
                file.write_all(line)?;
                written += line.len() as u64;
            }
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(written)
    }

    /// Move unreadable lines into the `.corrupt` sidecar.
    pub fn quarantine(&self, lines: &[String]) -> Result<(), QueueError> {
        if lines.is_empty() {
            return Ok(());
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.sibling("corrupt"))?;
        for line in lines {
            file.write_all(line.as_bytes())?;
            file.write_all(b"\n")?;
        }
        file.sync_data()?;
        tracing::warn!(
            count = lines.len(),
            path = %self.path.display(),
            "Quarantined unreadable queue lines"
        );
        Ok(())
    }

    fn sibling(&self, extension: &str) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".");
        name.push(extension);
        PathBuf::from(name)
    }
}
