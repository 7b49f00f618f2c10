use std::path::{Component, Path, PathBuf};

use super::codec::{fits_in_field, DELIMITER, MAX_TEXT_FRAME};
use super::error::{Result, SyncError};

const IMAGE_EXTENSIONS: [&str; 9] = [
    "png", "jpg", "jpeg", "gif", "bmp", "webp", "ico", "tif", "tiff",
];

/// How the content of a file travels to the peer.
#[derive(Debug, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

/// Turns an absolute path under `root` into the `/`-separated form used on
/// the wire.
pub fn relative_path(root: &Path, path: &Path) -> Result<String> {
    let rest = path
        .strip_prefix(root)
        .map_err(|_| SyncError::PathViolation(path.display().to_string()))?;

    let mut parts = Vec::new();
    for component in rest.components() {
        match component {
            Component::Normal(name) => match name.to_str() {
                Some(name) => parts.push(name),
                None => {
                    return Err(SyncError::PathViolation(format!(
                        "{} is not valid UTF-8",
                        path.display()
                    )))
                }
            },
            Component::CurDir => {}
            _ => return Err(SyncError::PathViolation(path.display().to_string())),
        }
    }
    if parts.is_empty() {
        return Err(SyncError::PathViolation(format!(
            "{} is the mirror root itself",
            path.display()
        )));
    }
    Ok(parts.join("/"))
}

/// Re-roots a wire path under `root`, refusing anything that could land
/// outside it. Nothing touches the filesystem.
pub fn resolve(root: &Path, rel_path: &str) -> Result<PathBuf> {
    let violation = || SyncError::PathViolation(rel_path.to_string());

    if rel_path.is_empty() || rel_path.contains('\\') || rel_path.contains('\0') {
        return Err(violation());
    }

    let mut resolved = root.to_path_buf();
    let mut depth = 0;
    for component in Path::new(rel_path).components() {
        match component {
            Component::Normal(name) => {
                resolved.push(name);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(violation())
            }
        }
    }
    if depth == 0 {
        return Err(violation());
    }
    Ok(resolved)
}

pub fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            IMAGE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// Picks the text path only for content that survives a text frame intact:
/// valid UTF-8, splitting back out of its field unchanged, not an image, and
/// small enough for a single frame. Everything else goes through the chunked transfer.
pub fn classify(path: &Path, rel_path: &str, bytes: Vec<u8>) -> Payload {
    if is_image(path) {
        return Payload::Binary(bytes);
    }
    // command, path, hash and the three delimiters around them
    let overhead = "sync".len() + rel_path.len() + 64 + 3 * DELIMITER.len();
    if bytes.len() + overhead > MAX_TEXT_FRAME {
        return Payload::Binary(bytes);
    }
    match String::from_utf8(bytes) {
        Ok(text) if fits_in_field(&text) => Payload::Text(text),
        Ok(text) => Payload::Binary(text.into_bytes()),
        Err(err) => Payload::Binary(err.into_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_path_strips_root() {
        let root = Path::new("/srv/mirror");
        assert_eq!(
            relative_path(root, Path::new("/srv/mirror/a/b.txt")).unwrap(),
            "a/b.txt"
        );
        assert!(matches!(
            relative_path(root, Path::new("/srv/other/b.txt")),
            Err(SyncError::PathViolation(_))
        ));
        assert!(relative_path(root, root).is_err());
    }

    #[test]
    fn resolve_rejects_traversal() {
        let root = Path::new("/srv/mirror");
        assert_eq!(resolve(root, "a/b.txt").unwrap(), root.join("a").join("b.txt"));
        assert_eq!(resolve(root, "./a.txt").unwrap(), root.join("a.txt"));
        for bad in ["../escape.txt", "a/../../x", "/etc/passwd", "", ".", "a\\..\\b"] {
            assert!(
                matches!(resolve(root, bad), Err(SyncError::PathViolation(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn image_extensions_are_case_insensitive() {
        assert!(is_image(Path::new("photo.PNG")));
        assert!(is_image(Path::new("dir/pic.jpeg")));
        assert!(!is_image(Path::new("notes.txt")));
        assert!(!is_image(Path::new("Makefile")));
    }

    #[test]
    fn classification() {
        let txt = Path::new("/r/a.txt");
        assert_eq!(
            classify(txt, "a.txt", b"hello".to_vec()),
            Payload::Text("hello".into())
        );
        assert_eq!(
            classify(txt, "a.txt", vec![0xff, 0xfe, 0x00]),
            Payload::Binary(vec![0xff, 0xfe, 0x00])
        );
        assert_eq!(
            classify(txt, "a.txt", b"a::b".to_vec()),
            Payload::Binary(b"a::b".to_vec())
        );
        for edged in ["Note:", ":start"] {
            assert_eq!(
                classify(txt, "a.txt", edged.into()),
                Payload::Binary(edged.into())
            );
        }
        assert_eq!(
            classify(txt, "a.txt", b"at 12:30 sharp".to_vec()),
            Payload::Text("at 12:30 sharp".into())
        );
        assert_eq!(
            classify(Path::new("/r/a.png"), "a.png", b"hello".to_vec()),
            Payload::Binary(b"hello".to_vec())
        );
        let big = vec![b'x'; MAX_TEXT_FRAME];
        assert!(matches!(classify(txt, "a.txt", big), Payload::Binary(_)));
    }
}
