use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Event, EventHandler, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, trace, warn};
use walkdir::WalkDir;

use super::error::Result;
use super::message::ChangeEvent;

/// How long the first half of a rename waits for its partner before it is
/// taken as a move out of the tree.
const RENAME_WINDOW: Duration = Duration::from_millis(100);

/// Starts watching `root` recursively. Change events are delivered on `tx`
/// for as long as the returned watcher is alive.
pub fn start(root: &Path, tx: Sender<ChangeEvent>) -> Result<RecommendedWatcher> {
    let (raw_tx, raw_rx) = mpsc::channel();
    let mut watcher = notify::recommended_watcher(ChangeNotifier { tx: raw_tx })?;
    watcher.watch(root, RecursiveMode::Recursive)?;

    let translator = Translator::new(root);
    thread::Builder::new()
        .name("watch-events".into())
        .spawn(move || translator.run(raw_rx, tx))?;
    Ok(watcher)
}

struct ChangeNotifier {
    tx: Sender<Event>,
}

impl EventHandler for ChangeNotifier {
    fn handle_event(&mut self, event: notify::Result<Event>) {
        match event {
            Ok(event) => {
                if self.tx.send(event).is_err() {
                    debug!("translator gone, dropping watch event");
                }
            }
            Err(err) => error!(%err, "watcher error"),
        }
    }
}

/// Turns raw notifications into changes, pairing the halves of a rename.
///
/// inotify reports `From`, `To` and then `Both` for a move inside the tree
/// but only one half for a move across its edge. Windows never sends `Both`
/// and FSEvents only reports `Any` for each side.
struct Translator {
    root: PathBuf,
    /// A `From` half still waiting for its `To`, with its tracker.
    pending: Option<(PathBuf, Option<usize>)>,
    /// The rename last forwarded from its halves, so the `Both` that follows
    /// is not sent again.
    paired: Option<(PathBuf, PathBuf)>,
}

impl Translator {
    fn new(root: &Path) -> Self {
        Translator {
            root: root.to_path_buf(),
            pending: None,
            paired: None,
        }
    }

    fn run(mut self, events: Receiver<Event>, tx: Sender<ChangeEvent>) {
        loop {
            let changes = match events.recv_timeout(RENAME_WINDOW) {
                Ok(event) => self.translate(&event),
                Err(RecvTimeoutError::Timeout) => self.flush(),
                Err(RecvTimeoutError::Disconnected) => return,
            };
            for change in changes {
                if tx.send(change).is_err() {
                    debug!("dispatcher gone, dropping change event");
                    return;
                }
            }
        }
    }

    fn translate(&mut self, event: &Event) -> Vec<ChangeEvent> {
        let mode = match event.kind {
            EventKind::Modify(ModifyKind::Name(mode)) => mode,
            _ => {
                let mut changes = self.flush();
                changes.extend(to_change_events(&self.root, event));
                return changes;
            }
        };

        let tracker = event.tracker();
        match (mode, event.paths.as_slice()) {
            (RenameMode::From, [from]) => {
                let changes = self.flush();
                self.pending = Some((from.clone(), tracker));
                changes
            }
            (RenameMode::To, [to]) => match self.pending.take() {
                Some((from, from_tracker)) if from_tracker == tracker => {
                    let changes = rename_events(&self.root, &from, to);
                    self.paired = Some((from, to.clone()));
                    changes
                }
                unmatched => {
                    self.pending = unmatched;
                    let mut changes = self.flush();
                    changes.extend(arrival(&self.root, to));
                    changes
                }
            },
            (RenameMode::Both, [from, to]) => {
                if matches!(&self.paired, Some((f, t)) if f == from && t == to) {
                    self.paired = None;
                    return Vec::new();
                }
                if matches!(&self.pending, Some((path, _)) if path == from) {
                    self.pending = None;
                }
                let mut changes = self.flush();
                changes.extend(rename_events(&self.root, from, to));
                changes
            }
            (_, paths) => {
                // one side of a rename with no way to tell which
                let mut changes = self.flush();
                for path in paths {
                    if path.exists() {
                        changes.extend(arrival(&self.root, path));
                    } else {
                        changes.extend(departure(&self.root, path));
                    }
                }
                changes
            }
        }
    }

    /// Gives up on a pending `From`: its partner landed outside the tree.
    fn flush(&mut self) -> Vec<ChangeEvent> {
        self.pending
            .take()
            .and_then(|(path, _)| departure(&self.root, &path))
            .into_iter()
            .collect()
    }
}

fn under_root(root: &Path, path: &Path) -> bool {
    path != root && path.starts_with(root)
}

/// Converts a non-rename notification into the changes the dispatcher acts
/// on. Paths outside the root, metadata-only changes and access events are
/// dropped.
fn to_change_events(root: &Path, event: &Event) -> Vec<ChangeEvent> {
    let mut changes = Vec::new();
    for path in event.paths.iter().filter(|path| under_root(root, path)) {
        let path = path.clone();
        let change = match event.kind {
            EventKind::Create(CreateKind::Folder) => ChangeEvent::DirCreated { path },
            EventKind::Create(CreateKind::File) => ChangeEvent::FileCreatedOrModified { path },
            EventKind::Create(_) if path.is_dir() => ChangeEvent::DirCreated { path },
            EventKind::Create(_) => ChangeEvent::FileCreatedOrModified { path },
            EventKind::Modify(ModifyKind::Metadata(_) | ModifyKind::Name(_)) => continue,
            EventKind::Modify(_) if path.is_file() => {
                ChangeEvent::FileCreatedOrModified { path }
            }
            EventKind::Remove(RemoveKind::Folder) => ChangeEvent::DirDeleted { path },
            EventKind::Remove(_) => ChangeEvent::FileDeleted { path },
            _ => {
                trace!(kind = ?event.kind, path = %path.display(), "ignored");
                continue;
            }
        };
        changes.push(change);
    }
    changes
}

fn rename_events(root: &Path, from: &Path, to: &Path) -> Vec<ChangeEvent> {
    match (under_root(root, from), under_root(root, to)) {
        (true, true) => vec![ChangeEvent::Renamed {
            path: from.to_path_buf(),
            dest: to.to_path_buf(),
        }],
        (true, false) => departure(root, from).into_iter().collect(),
        (false, true) => arrival(root, to),
        (false, false) => Vec::new(),
    }
}

/// Something left the tree. Whether it was a file or a directory can no
/// longer be checked; the peer treats a delete of a directory as `rmdir`.
fn departure(root: &Path, path: &Path) -> Option<ChangeEvent> {
    under_root(root, path).then(|| ChangeEvent::FileDeleted {
        path: path.to_path_buf(),
    })
}

/// Something moved into the tree. A directory arrives with everything in
/// it, parents before children.
fn arrival(root: &Path, path: &Path) -> Vec<ChangeEvent> {
    if !under_root(root, path) || !path.exists() {
        return Vec::new();
    }
    if !path.is_dir() {
        return vec![ChangeEvent::FileCreatedOrModified {
            path: path.to_path_buf(),
        }];
    }

    let mut changes = vec![ChangeEvent::DirCreated {
        path: path.to_path_buf(),
    }];
    for entry in WalkDir::new(path).min_depth(1).sort_by_file_name() {
        match entry {
            Ok(entry) if entry.file_type().is_dir() => changes.push(ChangeEvent::DirCreated {
                path: entry.into_path(),
            }),
            Ok(entry) if entry.file_type().is_file() => {
                changes.push(ChangeEvent::FileCreatedOrModified {
                    path: entry.into_path(),
                })
            }
            Ok(_) => {}
            Err(err) => warn!(%err, "skipping entry of moved-in directory"),
        }
    }
    changes
}
