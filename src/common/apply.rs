use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::error::{Result, SyncError};
use super::hash::{hash_file, ContentHash};
use super::message::Message;
use super::util::resolve;

/// Result of applying one message to the mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    /// The tree already reflected the message.
    Skipped,
}

/// The local copy of the replicated tree.
///
/// Applying is idempotent: a message that already took effect leaves the
/// tree untouched and reports [`Outcome::Skipped`]. Nothing here locks
/// against local edits; whichever write lands last wins.
#[derive(Debug, Clone)]
pub struct Mirror {
    root: PathBuf,
}

impl Mirror {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Mirror { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn apply(&self, message: &Message) -> Result<Outcome> {
        match message {
            Message::Sync {
                rel_path,
                content,
                hash,
            } => {
                let computed = ContentHash::of_bytes(content.as_bytes());
                if let Some(hash) = hash {
                    if *hash != computed {
                        return Err(SyncError::apply(
                            resolve(&self.root, rel_path)?,
                            format!("content hashes to {computed}, frame announced {hash}"),
                        ));
                    }
                }
                self.write(rel_path, &computed, content.as_bytes())
            }
            Message::Delete { rel_path } => self.delete(rel_path),
            Message::Mkdir { rel_path } => self.mkdir(rel_path),
            Message::Rmdir { rel_path } => self.rmdir(rel_path),
            Message::Rename { src, dest } => self.rename(src, dest),
            Message::Image { rel_path, .. } => Err(SyncError::frame(format!(
                "image header for {rel_path} applied without its payload"
            ))),
        }
    }

    /// Writes a fully received binary transfer, checking the bytes against
    /// the advertised hash first.
    pub fn apply_binary(
        &self,
        rel_path: &str,
        hash: &ContentHash,
        bytes: &[u8],
    ) -> Result<Outcome> {
        let path = resolve(&self.root, rel_path)?;
        let received = ContentHash::of_bytes(bytes);
        if received != *hash {
            return Err(SyncError::apply(
                path,
                format!("payload hashes to {received}, header announced {hash}"),
            ));
        }
        self.write(rel_path, hash, bytes)
    }

    fn write(&self, rel_path: &str, hash: &ContentHash, bytes: &[u8]) -> Result<Outcome> {
        let path = resolve(&self.root, rel_path)?;
        if path.is_dir() {
            return Err(SyncError::apply(path, "a directory exists at this path"));
        }

        let local = hash_file(&path).map_err(|err| SyncError::apply(&path, err))?;
        if local.as_ref() == Some(hash) {
            debug!(path = %rel_path, "already up to date");
            return Ok(Outcome::Skipped);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| SyncError::apply(parent, err))?;
        }
        fs::write(&path, bytes).map_err(|err| SyncError::apply(&path, err))?;
        info!(path = %rel_path, bytes = bytes.len(), "file synchronized");
        Ok(Outcome::Applied)
    }

    fn delete(&self, rel_path: &str) -> Result<Outcome> {
        let path = resolve(&self.root, rel_path)?;
        let metadata = match fs::symlink_metadata(&path) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %rel_path, "already deleted");
                return Ok(Outcome::Skipped);
            }
            Err(err) => return Err(SyncError::apply(path, err)),
        };

        if metadata.is_dir() {
            return self.rmdir(rel_path);
        }
        match fs::remove_file(&path) {
            Ok(()) => {
                info!(path = %rel_path, "file deleted");
                Ok(Outcome::Applied)
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Outcome::Skipped),
            Err(err) => Err(SyncError::apply(path, err)),
        }
    }

    fn mkdir(&self, rel_path: &str) -> Result<Outcome> {
        let path = resolve(&self.root, rel_path)?;
        if path.exists() && !path.is_dir() {
            return Err(SyncError::apply(path, "a non-directory exists at this path"));
        }
        fs::create_dir_all(&path).map_err(|err| SyncError::apply(&path, err))?;
        info!(path = %rel_path, "directory created");
        Ok(Outcome::Applied)
    }

    fn rmdir(&self, rel_path: &str) -> Result<Outcome> {
        let path = resolve(&self.root, rel_path)?;
        let metadata = match fs::symlink_metadata(&path) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %rel_path, "directory already gone");
                return Ok(Outcome::Skipped);
            }
            Err(err) => return Err(SyncError::apply(path, err)),
        };
        if !metadata.is_dir() {
            return Err(SyncError::apply(path, "not a directory"));
        }

        let mut entries = fs::read_dir(&path).map_err(|err| SyncError::apply(&path, err))?;
        if entries.next().is_some() {
            return Err(SyncError::apply(path, "directory is not empty"));
        }
        fs::remove_dir(&path).map_err(|err| SyncError::apply(&path, err))?;
        info!(path = %rel_path, "directory removed");
        Ok(Outcome::Applied)
    }

    fn rename(&self, src: &str, dest: &str) -> Result<Outcome> {
        let from = resolve(&self.root, src)?;
        let to = resolve(&self.root, dest)?;
        if fs::symlink_metadata(&from).is_err() {
            warn!(src = %src, dest = %dest, "rename source not found");
            return Ok(Outcome::Skipped);
        }
        fs::rename(&from, &to).map_err(|err| SyncError::apply(&from, err))?;
        info!(src = %src, dest = %dest, "renamed");
        Ok(Outcome::Applied)
    }
}
