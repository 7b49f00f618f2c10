use std::path::PathBuf;

use super::hash::ContentHash;

/// A local filesystem change, as reported by the watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    FileCreatedOrModified { path: PathBuf },
    FileDeleted { path: PathBuf },
    DirCreated { path: PathBuf },
    DirDeleted { path: PathBuf },
    Renamed { path: PathBuf, dest: PathBuf },
}

impl ChangeEvent {
    pub fn path(&self) -> &PathBuf {
        match self {
            ChangeEvent::FileCreatedOrModified { path }
            | ChangeEvent::FileDeleted { path }
            | ChangeEvent::DirCreated { path }
            | ChangeEvent::DirDeleted { path }
            | ChangeEvent::Renamed { path, .. } => path,
        }
    }
}

/// One protocol message. Every path is relative to the mirrored root and
/// uses `/` as separator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Text content carried inline. `hash` is `None` only for legacy
    /// three-field frames.
    Sync {
        rel_path: String,
        content: String,
        hash: Option<ContentHash>,
    },
    Delete {
        rel_path: String,
    },
    Mkdir {
        rel_path: String,
    },
    Rmdir {
        rel_path: String,
    },
    Rename {
        src: String,
        dest: String,
    },
    /// Header of a binary transfer; `payload_len` base64 bytes follow on the
    /// same connection.
    Image {
        rel_path: String,
        hash: ContentHash,
        payload_len: usize,
    },
}

impl Message {
    pub fn command(&self) -> &'static str {
        match self {
            Message::Sync { .. } => "sync",
            Message::Delete { .. } => "delete",
            Message::Mkdir { .. } => "mkdir",
            Message::Rmdir { .. } => "rmdir",
            Message::Rename { .. } => "rename",
            Message::Image { .. } => "image",
        }
    }

    /// The path the message acts on (the source path for renames).
    pub fn rel_path(&self) -> &str {
        match self {
            Message::Sync { rel_path, .. }
            | Message::Delete { rel_path }
            | Message::Mkdir { rel_path }
            | Message::Rmdir { rel_path }
            | Message::Image { rel_path, .. } => rel_path,
            Message::Rename { src, .. } => src,
        }
    }
}
