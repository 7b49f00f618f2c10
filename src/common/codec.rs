//! Wire format.
//!
//! Text commands are a single UTF-8 frame with fields joined by `::` and no
//! length prefix; the sender half-closes its side once the frame is written.
//!
//! ```text
//! sync::<rel_path>::<content>::<hash>
//! sync::<rel_path>::<content>          (legacy, no hash)
//! delete::<rel_path>::
//! mkdir::<rel_path>::
//! rmdir::<rel_path>::
//! rename::<src>|<dest>
//! ```
//!
//! Binary content uses a fixed 1024-byte header
//! `image::<rel_path>::<hash>::<payload_len>` padded with spaces, followed by
//! `payload_len` bytes of base64 written in chunks of at most 4096 bytes. The
//! receiver answers `OK` or `ERROR` before closing.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use std::io::{self, Read, Write};

use super::error::{Result, SyncError};
use super::hash::ContentHash;
use super::message::Message;

pub const DELIMITER: &str = "::";
pub const RENAME_SEPARATOR: char = '|';
pub const HEADER_LEN: usize = 1024;
pub const CHUNK_LEN: usize = 4096;
pub const MAX_TEXT_FRAME: usize = 64 * 1024;
/// Largest base64 payload a receiver is willing to buffer.
pub const MAX_PAYLOAD: usize = 256 * 1024 * 1024;
pub const ACK_OK: &[u8] = b"OK";
pub const ACK_ERROR: &[u8] = b"ERROR";

const IMAGE_PREFIX: &[u8] = b"image::";
const HEADER_FILLER: u8 = b' ';

/// Whether `value` can sit between two delimiters and split back out
/// unchanged. A `:` at either edge merges with the neighbouring `::`.
pub fn fits_in_field(value: &str) -> bool {
    !value.contains(DELIMITER) && !value.starts_with(':') && !value.ends_with(':')
}

fn check_field(name: &str, value: &str) -> Result<()> {
    if !fits_in_field(value) {
        return Err(SyncError::frame(format!(
            "{name} {value:?} would not survive the field delimiter"
        )));
    }
    Ok(())
}

/// Encodes a message as one frame. `Image` yields the padded header only;
/// the payload is written separately with [`write_payload`].
pub fn encode(message: &Message) -> Result<Vec<u8>> {
    let frame = match message {
        Message::Sync {
            rel_path,
            content,
            hash,
        } => {
            check_field("path", rel_path)?;
            check_field("content", content)?;
            match hash {
                Some(hash) => format!("sync::{rel_path}::{content}::{hash}"),
                None => format!("sync::{rel_path}::{content}"),
            }
        }
        Message::Delete { rel_path }
        | Message::Mkdir { rel_path }
        | Message::Rmdir { rel_path } => {
            check_field("path", rel_path)?;
            format!("{}::{rel_path}::", message.command())
        }
        Message::Rename { src, dest } => {
            for (name, path) in [("source", src), ("destination", dest)] {
                check_field(name, path)?;
                if path.contains(RENAME_SEPARATOR) {
                    return Err(SyncError::frame(format!(
                        "rename {name} {path:?} contains {RENAME_SEPARATOR:?}"
                    )));
                }
            }
            format!("rename::{src}{RENAME_SEPARATOR}{dest}")
        }
        Message::Image {
            rel_path,
            hash,
            payload_len,
        } => return encode_image_header(rel_path, hash, *payload_len),
    };

    if frame.len() > MAX_TEXT_FRAME {
        return Err(SyncError::frame(format!(
            "{} frame of {} bytes exceeds {MAX_TEXT_FRAME}",
            message.command(),
            frame.len()
        )));
    }
    Ok(frame.into_bytes())
}

fn encode_image_header(
    rel_path: &str,
    hash: &ContentHash,
    payload_len: usize,
) -> Result<Vec<u8>> {
    check_field("path", rel_path)?;
    if payload_len > MAX_PAYLOAD {
        return Err(SyncError::frame(format!(
            "payload of {payload_len} bytes exceeds {MAX_PAYLOAD}"
        )));
    }
    let mut header = format!("image::{rel_path}::{hash}::{payload_len}").into_bytes();
    if header.len() > HEADER_LEN {
        return Err(SyncError::frame(format!(
            "image header for {rel_path:?} is longer than {HEADER_LEN} bytes"
        )));
    }
    header.resize(HEADER_LEN, HEADER_FILLER);
    Ok(header)
}

/// Decodes one frame. Any field-count mismatch, unknown command or malformed
/// field is `InvalidFrame`.
pub fn decode(frame: &[u8]) -> Result<Message> {
    let text = std::str::from_utf8(frame)
        .map_err(|err| SyncError::frame(format!("frame is not UTF-8: {err}")))?;
    let text = if frame.starts_with(IMAGE_PREFIX) {
        text.trim_end_matches(|c: char| c == HEADER_FILLER as char || c == '\0')
    } else {
        text
    };

    let fields: Vec<&str> = text.split(DELIMITER).collect();
    let message = match fields.as_slice() {
        ["sync", rel_path, content, hash] => Message::Sync {
            rel_path: rel_path.to_string(),
            content: content.to_string(),
            hash: Some(hash.parse()?),
        },
        ["image", rel_path, hash, len] => {
            let payload_len: usize = len
                .parse()
                .map_err(|_| SyncError::frame(format!("bad payload length {len:?}")))?;
            if payload_len > MAX_PAYLOAD {
                return Err(SyncError::frame(format!(
                    "payload of {payload_len} bytes exceeds {MAX_PAYLOAD}"
                )));
            }
            Message::Image {
                rel_path: rel_path.to_string(),
                hash: hash.parse()?,
                payload_len,
            }
        }
        ["sync", rel_path, content] => Message::Sync {
            rel_path: rel_path.to_string(),
            content: content.to_string(),
            hash: None,
        },
        [command @ ("delete" | "mkdir" | "rmdir"), _, rest] if !rest.is_empty() => {
            return Err(SyncError::frame(format!(
                "{command} frame carries unexpected content"
            )))
        }
        ["delete", rel_path, _] => Message::Delete {
            rel_path: rel_path.to_string(),
        },
        ["mkdir", rel_path, _] => Message::Mkdir {
            rel_path: rel_path.to_string(),
        },
        ["rmdir", rel_path, _] => Message::Rmdir {
            rel_path: rel_path.to_string(),
        },
        ["rename", pair] => {
            let mut parts = pair.split(RENAME_SEPARATOR);
            match (parts.next(), parts.next(), parts.next()) {
                (Some(src), Some(dest), None) if !src.is_empty() && !dest.is_empty() => {
                    Message::Rename {
                        src: src.to_string(),
                        dest: dest.to_string(),
                    }
                }
                _ => return Err(SyncError::frame(format!("malformed rename pair {pair:?}"))),
            }
        }
        other => {
            return Err(SyncError::frame(format!(
                "unrecognized {}-field frame starting with {:?}",
                other.len(),
                other.first().copied().unwrap_or_default()
            )))
        }
    };
    Ok(message)
}

/// Reads until `buf` is full or the stream ends; returns the bytes read.
fn read_up_to<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

/// Reads one frame off the stream: either a full 1024-byte image header, or
/// a text frame terminated by the end of the stream.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Message> {
    let mut head = vec![0u8; HEADER_LEN];
    let n = read_up_to(reader, &mut head).map_err(SyncError::Transport)?;
    head.truncate(n);

    if n == 0 {
        return Err(SyncError::frame("connection closed before any frame"));
    }
    if head.starts_with(IMAGE_PREFIX) {
        if n < HEADER_LEN {
            return Err(SyncError::frame(format!(
                "image header truncated at {n} of {HEADER_LEN} bytes"
            )));
        }
        return decode(&head);
    }

    if n == HEADER_LEN {
        let limit = (MAX_TEXT_FRAME - HEADER_LEN + 1) as u64;
        reader
            .take(limit)
            .read_to_end(&mut head)
            .map_err(SyncError::Transport)?;
        if head.len() > MAX_TEXT_FRAME {
            return Err(SyncError::frame(format!(
                "text frame exceeds {MAX_TEXT_FRAME} bytes"
            )));
        }
    }
    decode(&head)
}

pub fn encode_payload(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn decode_payload(payload: &[u8]) -> Result<Vec<u8>> {
    STANDARD
        .decode(payload)
        .map_err(|err| SyncError::frame(format!("payload is not valid base64: {err}")))
}

/// Writes `payload` in chunks of at most [`CHUNK_LEN`] bytes.
pub fn write_payload<W: Write>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    for chunk in payload.chunks(CHUNK_LEN) {
        writer.write_all(chunk)?;
    }
    writer.flush()
}

/// Accumulates chunks until exactly `len` payload bytes have arrived.
pub fn read_payload<R: Read>(reader: &mut R, len: usize) -> Result<Vec<u8>> {
    let mut payload = Vec::with_capacity(len);
    let mut chunk = [0u8; CHUNK_LEN];
    while payload.len() < len {
        let want = (len - payload.len()).min(CHUNK_LEN);
        let n = read_up_to(reader, &mut chunk[..want]).map_err(SyncError::Transport)?;
        if n == 0 {
            return Err(SyncError::Transport(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("payload ended after {} of {len} bytes", payload.len()),
            )));
        }
        payload.extend_from_slice(&chunk[..n]);
    }
    Ok(payload)
}

pub fn write_ack<W: Write>(writer: &mut W, ok: bool) -> io::Result<()> {
    writer.write_all(if ok { ACK_OK } else { ACK_ERROR })?;
    writer.flush()
}

/// Reads the receiver's reply up to the end of the stream.
pub fn read_ack<R: Read>(reader: &mut R) -> Result<Vec<u8>> {
    let mut reply = Vec::new();
    reader
        .take(ACK_ERROR.len() as u64)
        .read_to_end(&mut reply)
        .map_err(SyncError::Transport)?;
    Ok(reply)
}
