use std::io::Write;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::common::apply::{Mirror, Outcome};
use crate::common::codec;
use crate::common::error::{Result, SyncError};
use crate::common::hash::ContentHash;
use crate::common::message::Message;
use crate::Config;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Receives changes from the peer and applies them to the local mirror, one
/// connection at a time.
pub struct Server {
    listener: TcpListener,
    mirror: Mirror,
}

impl Server {
    pub fn bind(config: &Config) -> Result<Server> {
        let listener = TcpListener::bind(config.listen).map_err(SyncError::Transport)?;
        Ok(Server::from_listener(listener, Mirror::new(&config.root)))
    }

    pub fn from_listener(listener: TcpListener, mirror: Mirror) -> Server {
        Server { listener, mirror }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(SyncError::Transport)
    }

    /// Accepts and handles connections until the process exits. A failed
    /// connection is logged and never stops the loop.
    pub fn run(&self) {
        info!(
            addr = ?self.local_addr().ok(),
            root = %self.mirror.root().display(),
            "listening"
        );
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    // `serve` logs the outcome
                    let _ = self.serve(stream);
                }
                Err(err) => {
                    // e.g. out of file descriptors; retrying at once would spin
                    warn!(%err, "accept failed");
                    thread::sleep(ACCEPT_BACKOFF);
                }
            }
        }
    }

    fn serve(&self, mut stream: TcpStream) -> Result<Outcome> {
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".into());

        let result = self.handle(&mut stream);
        match &result {
            Ok(Outcome::Applied) => debug!(%peer, "change applied"),
            Ok(Outcome::Skipped) => debug!(%peer, "change already present"),
            Err(SyncError::InvalidFrame(reason)) => {
                warn!(%peer, %reason, "dropping connection with invalid frame")
            }
            Err(err) => warn!(%peer, %err, "failed to handle change"),
        }
        result
    }

    fn handle(&self, stream: &mut TcpStream) -> Result<Outcome> {
        // some platforms hand out accepted sockets in the listener's mode
        stream.set_nonblocking(false).map_err(SyncError::Transport)?;
        match codec::read_frame(stream)? {
            Message::Image {
                rel_path,
                hash,
                payload_len,
            } => self.receive_binary(stream, &rel_path, &hash, payload_len),
            message => self.mirror.apply(&message),
        }
    }

    /// Reads the chunked payload that follows an image header, applies it and
    /// acknowledges with `OK` or `ERROR`.
    fn receive_binary<S: std::io::Read + Write>(
        &self,
        stream: &mut S,
        rel_path: &str,
        hash: &ContentHash,
        payload_len: usize,
    ) -> Result<Outcome> {
        let result = codec::read_payload(stream, payload_len)
            .and_then(|payload| codec::decode_payload(&payload))
            .and_then(|bytes| self.mirror.apply_binary(rel_path, hash, &bytes));

        let acked = codec::write_ack(stream, result.is_ok());
        match (result, acked) {
            (Ok(_), Err(err)) => Err(SyncError::Transport(err)),
            (result, _) => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Dispatcher;
    use crate::common::codec::{encode, encode_payload, write_payload, ACK_ERROR};
    use crate::common::hash::hash_file;
    use crate::common::message::ChangeEvent;
    use std::fs;
    use std::io::Read;
    use std::net::Shutdown;
    use std::path::Path;
    use std::thread::JoinHandle;
    use std::time::Instant;
    use tempfile::TempDir;

    struct Pair {
        _dir: TempDir,
        local: std::path::PathBuf,
        remote: std::path::PathBuf,
        dispatcher: Dispatcher,
        server: Server,
    }

    fn pair() -> Pair {
        let dir = TempDir::new().unwrap();
        let local = dir.path().join("local");
        let remote = dir.path().join("remote");
        fs::create_dir(&local).unwrap();
        fs::create_dir(&remote).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let server = Server::from_listener(listener, Mirror::new(&remote));
        let peer = server.local_addr().unwrap();
        let dispatcher = Dispatcher::new(&Config::for_test(&local, Some(peer))).unwrap();
        Pair {
            _dir: dir,
            local,
            remote,
            dispatcher,
            server,
        }
    }

    fn serve(server: Server, connections: usize) -> JoinHandle<Vec<Result<Outcome>>> {
        thread::spawn(move || {
            (0..connections)
                .map(|_| {
                    let (stream, _) = server.listener.accept().unwrap();
                    server.serve(stream)
                })
                .collect()
        })
    }

    fn write_file(root: &Path, rel_path: &str, bytes: &[u8]) -> std::path::PathBuf {
        let path = root.join(rel_path);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn text_sync_round_trip() {
        let Pair {
            _dir,
            local,
            remote,
            dispatcher,
            server,
        } = pair();
        let handle = serve(server, 1);

        let path = write_file(&local, "a/b.txt", b"hello");
        dispatcher
            .dispatch(&ChangeEvent::FileCreatedOrModified { path: path.clone() })
            .unwrap();

        let results = handle.join().unwrap();
        assert_eq!(results[0].as_ref().unwrap(), &Outcome::Applied);
        let mirrored = remote.join("a/b.txt");
        assert_eq!(fs::read_to_string(&mirrored).unwrap(), "hello");
        assert_eq!(hash_file(&mirrored).unwrap(), hash_file(&path).unwrap());
    }

    #[test]
    fn binary_round_trip_is_acknowledged() {
        let Pair {
            _dir,
            local,
            remote,
            dispatcher,
            server,
        } = pair();
        let handle = serve(server, 2);

        let mut bytes = b"\x89PNG\r\n\x1a\n".to_vec();
        bytes.extend((0..50_000u32).map(|i| (i.wrapping_mul(2654435761) >> 24) as u8));
        let path = write_file(&local, "pics/cat.png", &bytes);

        // dispatch only returns Ok once the receiver acknowledged with OK
        let event = ChangeEvent::FileCreatedOrModified { path };
        dispatcher.dispatch(&event).unwrap();
        assert_eq!(fs::read(remote.join("pics/cat.png")).unwrap(), bytes);

        // unchanged content is acknowledged without rewriting
        dispatcher.dispatch(&event).unwrap();

        let results = handle.join().unwrap();
        assert_eq!(results[0].as_ref().unwrap(), &Outcome::Applied);
        assert_eq!(results[1].as_ref().unwrap(), &Outcome::Skipped);
    }

    #[test]
    fn binary_with_wrong_hash_is_refused() {
        let Pair {
            _dir,
            remote,
            server,
            ..
        } = pair();
        let addr = server.local_addr().unwrap();
        let handle = serve(server, 1);

        let payload = encode_payload(b"real bytes");
        let header = encode(&Message::Image {
            rel_path: "x.bin".into(),
            hash: ContentHash::of_bytes(b"other bytes"),
            payload_len: payload.len(),
        })
        .unwrap();

        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(&header).unwrap();
        write_payload(&mut stream, payload.as_bytes()).unwrap();
        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).unwrap();

        assert_eq!(reply, ACK_ERROR);
        assert!(handle.join().unwrap()[0].is_err());
        assert!(!remote.join("x.bin").exists());
    }

    #[test]
    fn malformed_frame_does_not_stop_the_server() {
        let Pair {
            _dir,
            local,
            remote,
            dispatcher,
            server,
        } = pair();
        let addr = server.local_addr().unwrap();
        let handle = serve(server, 2);

        let mut bad = TcpStream::connect(addr).unwrap();
        bad.write_all(b"this is not a frame").unwrap();
        bad.shutdown(Shutdown::Write).unwrap();
        let mut reply = Vec::new();
        bad.read_to_end(&mut reply).unwrap();
        assert!(reply.is_empty());

        let path = write_file(&local, "after.txt", b"still here");
        dispatcher
            .dispatch(&ChangeEvent::FileCreatedOrModified { path })
            .unwrap();

        let results = handle.join().unwrap();
        assert!(matches!(results[0], Err(SyncError::InvalidFrame(_))));
        assert_eq!(results[1].as_ref().unwrap(), &Outcome::Applied);
        assert_eq!(fs::read_to_string(remote.join("after.txt")).unwrap(), "still here");
    }

    #[test]
    fn traversal_over_the_wire_is_rejected() {
        let Pair {
            _dir,
            remote,
            server,
            ..
        } = pair();
        let addr = server.local_addr().unwrap();
        let handle = serve(server, 1);

        let hash = ContentHash::of_bytes(b"pwned");
        let mut stream = TcpStream::connect(addr).unwrap();
        write!(stream, "sync::../escape.txt::pwned::{hash}").unwrap();
        stream.shutdown(Shutdown::Write).unwrap();

        let results = handle.join().unwrap();
        assert!(matches!(results[0], Err(SyncError::PathViolation(_))));
        assert!(!remote.parent().unwrap().join("escape.txt").exists());
    }

    #[test]
    fn shifted_sync_frame_is_not_written() {
        let Pair {
            _dir,
            remote,
            server,
            ..
        } = pair();
        let addr = server.local_addr().unwrap();
        let handle = serve(server, 1);

        // path "a:" with content "body", as an unchecked sender would write it
        let hash = ContentHash::of_bytes(b"body");
        let mut stream = TcpStream::connect(addr).unwrap();
        write!(stream, "sync::a:::body::{hash}").unwrap();
        stream.shutdown(Shutdown::Write).unwrap();

        let results = handle.join().unwrap();
        assert!(matches!(results[0], Err(SyncError::ApplyFailure { .. })));
        assert!(!remote.join("a").exists());
        assert!(!remote.join("a:").exists());
    }

    #[test]
    fn structural_changes_replicate() {
        let Pair {
            _dir,
            local,
            remote,
            dispatcher,
            server,
        } = pair();
        let handle = serve(server, 4);
        fs::write(remote.join("old.txt"), "data").unwrap();
        fs::write(remote.join("doomed.txt"), "data").unwrap();

        for event in [
            ChangeEvent::DirCreated {
                path: local.join("docs"),
            },
            ChangeEvent::Renamed {
                path: local.join("old.txt"),
                dest: local.join("docs/new.txt"),
            },
            ChangeEvent::FileDeleted {
                path: local.join("doomed.txt"),
            },
            ChangeEvent::DirDeleted {
                path: local.join("never-existed"),
            },
        ] {
            dispatcher.dispatch(&event).unwrap();
        }

        let outcomes: Vec<Outcome> = handle
            .join()
            .unwrap()
            .into_iter()
            .map(|result| result.unwrap())
            .collect();
        assert_eq!(
            outcomes,
            [Outcome::Applied, Outcome::Applied, Outcome::Applied, Outcome::Skipped]
        );
        assert_eq!(fs::read_to_string(remote.join("docs/new.txt")).unwrap(), "data");
        assert!(!remote.join("doomed.txt").exists());
    }

    #[test]
    fn failing_accepts_do_not_stop_the_server() {
        let Pair {
            _dir,
            local,
            remote,
            dispatcher,
            server,
        } = pair();
        // every accept with no connection waiting now fails with WouldBlock
        server.listener.set_nonblocking(true).unwrap();
        thread::spawn(move || server.run());
        thread::sleep(ACCEPT_BACKOFF * 3);

        let path = write_file(&local, "late.txt", b"made it");
        dispatcher
            .dispatch(&ChangeEvent::FileCreatedOrModified { path })
            .unwrap();

        let mirrored = remote.join("late.txt");
        let deadline = Instant::now() + Duration::from_secs(5);
        while fs::read_to_string(&mirrored).ok().as_deref() != Some("made it") {
            assert!(Instant::now() < deadline, "change never applied");
            thread::sleep(Duration::from_millis(20));
        }
    }
}
