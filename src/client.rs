use std::fs;
use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;
use tracing::{debug, info, warn};

use crate::common::codec::{self, ACK_OK, MAX_PAYLOAD};
use crate::common::error::{Result, SyncError};
use crate::common::hash::ContentHash;
use crate::common::message::{ChangeEvent, Message};
use crate::common::util::{classify, relative_path, Payload};
use crate::Config;

/// A message ready to go over the wire.
#[derive(Debug, PartialEq, Eq)]
pub enum Outgoing {
    Text(Message),
    /// An `Image` header plus the base64 payload that follows it.
    Binary { header: Message, payload: String },
}

/// Pushes local changes to the peer, one short-lived connection per change.
pub struct Dispatcher {
    root: PathBuf,
    peer: SocketAddr,
}

impl Dispatcher {
    pub fn new(config: &Config) -> Result<Dispatcher> {
        let peer = config
            .peer
            .ok_or_else(|| SyncError::Config("no peer address to send changes to".into()))?;
        Ok(Dispatcher {
            root: config.root.clone(),
            peer,
        })
    }

    /// Sends every received event in order. Failures are logged and the
    /// event dropped; nothing is retried.
    pub fn run(&self, events: Receiver<ChangeEvent>) {
        for event in events {
            match self.dispatch(&event) {
                Ok(()) => {}
                Err(SyncError::NotFound(path)) => {
                    debug!(path = %path.display(), "file vanished before it could be sent")
                }
                Err(err) => warn!(path = %event.path().display(), %err, "change not sent"),
            }
        }
    }

    pub fn dispatch(&self, event: &ChangeEvent) -> Result<()> {
        let outgoing = self.build(event)?;
        self.send(&outgoing)?;
        info!(path = %event.path().display(), peer = %self.peer, "change sent");
        Ok(())
    }

    /// Reads whatever local state the event needs and turns it into a
    /// message.
    pub fn build(&self, event: &ChangeEvent) -> Result<Outgoing> {
        let message = match event {
            ChangeEvent::FileCreatedOrModified { path } => return self.build_content(path),
            ChangeEvent::FileDeleted { path } => Message::Delete {
                rel_path: self.rel(path)?,
            },
            ChangeEvent::DirCreated { path } => Message::Mkdir {
                rel_path: self.rel(path)?,
            },
            ChangeEvent::DirDeleted { path } => Message::Rmdir {
                rel_path: self.rel(path)?,
            },
            ChangeEvent::Renamed { path, dest } => Message::Rename {
                src: self.rel(path)?,
                dest: self.rel(dest)?,
            },
        };
        Ok(Outgoing::Text(message))
    }

    fn rel(&self, path: &Path) -> Result<String> {
        relative_path(&self.root, path)
    }

    fn build_content(&self, path: &Path) -> Result<Outgoing> {
        let rel_path = self.rel(path)?;
        let not_found = |err: io::Error| match err.kind() {
            io::ErrorKind::NotFound => SyncError::NotFound(path.to_path_buf()),
            _ => err.into(),
        };

        // the receiver refuses anything larger, so do not even read it
        let len = fs::metadata(path).map_err(not_found)?.len();
        match usize::try_from(len).ok().and_then(|len| base64::encoded_len(len, true)) {
            Some(encoded) if encoded <= MAX_PAYLOAD => {}
            _ => {
                return Err(SyncError::frame(format!(
                    "{rel_path} is {len} bytes, over the {MAX_PAYLOAD}-byte payload limit \
                     once encoded"
                )))
            }
        }
        let bytes = fs::read(path).map_err(not_found)?;

        let outgoing = match classify(path, &rel_path, bytes) {
            Payload::Text(content) => Outgoing::Text(Message::Sync {
                hash: Some(ContentHash::of_bytes(content.as_bytes())),
                rel_path,
                content,
            }),
            Payload::Binary(bytes) => {
                let payload = codec::encode_payload(&bytes);
                Outgoing::Binary {
                    header: Message::Image {
                        rel_path,
                        hash: ContentHash::of_bytes(&bytes),
                        payload_len: payload.len(),
                    },
                    payload,
                }
            }
        };
        Ok(outgoing)
    }

    fn send(&self, outgoing: &Outgoing) -> Result<()> {
        match outgoing {
            Outgoing::Text(message) => {
                let frame = codec::encode(message)?;
                let mut stream = self.connect()?;
                stream.write_all(&frame).map_err(SyncError::Transport)?;
                stream.flush().map_err(SyncError::Transport)?;
                stream.shutdown(Shutdown::Write).map_err(SyncError::Transport)?;
                debug!(command = message.command(), path = %message.rel_path(), "frame written");
                Ok(())
            }
            Outgoing::Binary { header, payload } => {
                let frame = codec::encode(header)?;
                let mut stream = self.connect()?;
                stream.write_all(&frame).map_err(SyncError::Transport)?;
                codec::write_payload(&mut stream, payload.as_bytes())
                    .map_err(SyncError::Transport)?;

                let reply = codec::read_ack(&mut stream)?;
                if reply != ACK_OK {
                    return Err(SyncError::Rejected {
                        path: header.rel_path().to_string(),
                        reply: String::from_utf8_lossy(&reply).into_owned(),
                    });
                }
                debug!(path = %header.rel_path(), bytes = payload.len(), "transfer acknowledged");
                Ok(())
            }
        }
    }

    fn connect(&self) -> Result<TcpStream> {
        TcpStream::connect(self.peer).map_err(SyncError::Transport)
    }
}
