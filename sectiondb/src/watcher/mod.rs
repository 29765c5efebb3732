use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::{Duration, Instant};

/// A debounced notice that the database file (or its journal) was touched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatcherEvent {
    pub paths: Vec<PathBuf>,
}

/// Watches a database file for writes made by other connections.
/// Debounced events are sent through an mpsc channel for the Store to process.
pub struct DbWatcher {
    _watcher: RecommendedWatcher,
    /// Handle to the background thread processing events
    _thread: std::thread::JoinHandle<()>,
    /// Receiver for debounced change notices
    pub event_rx: mpsc::Receiver<WatcherEvent>,
}

impl DbWatcher {
    /// Start watching the directory holding `db_path`.
    /// Only the database file and its `-wal` / `-journal` siblings count.
    /// Debounced events (100ms) are available via `event_rx`.
    pub fn start(db_path: &Path) -> Result<Self, notify::Error> {
        let (notify_tx, notify_rx) = mpsc::channel::<notify::Result<Event>>();
        let (event_tx, event_rx) = mpsc::channel::<WatcherEvent>();

        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = notify_tx.send(res);
            },
            Config::default(),
        )?;

        let dir = match db_path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        let file_name = db_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let thread = std::thread::spawn(move || {
            let debounce = Duration::from_millis(100);
            let mut pending: BTreeSet<PathBuf> = BTreeSet::new();
            let mut last_event = Instant::now();

            loop {
                match notify_rx.recv_timeout(debounce) {
                    Ok(Ok(event)) => {
                        if matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                            for path in event.paths {
                                if is_database_file(&path, &file_name) {
                                    pending.insert(path);
                                }
                            }
                        }
                        last_event = Instant::now();
                    }
                    Ok(Err(e)) => {
                        log::warn!("Database watcher error: {e}");
                    }
                    Err(mpsc::RecvTimeoutError::Timeout) => {
                        if !pending.is_empty() && last_event.elapsed() >= debounce {
                            let paths = std::mem::take(&mut pending).into_iter().collect();
                            if event_tx.send(WatcherEvent { paths }).is_err() {
                                return;
                            }
                        }
                    }
                    Err(mpsc::RecvTimeoutError::Disconnected) => break,
                }
            }
        });

        Ok(DbWatcher {
            _watcher: watcher,
            _thread: thread,
            event_rx,
        })
    }

    /// Drain every event received so far. Returns how many there were.
    pub fn drain(&self) -> usize {
        self.event_rx.try_iter().count()
    }
}

fn is_database_file(path: &Path, file_name: &str) -> bool {
    match path.file_name().and_then(|n| n.to_str()) {
        Some(name) => {
            name == file_name
                || name == format!("{file_name}-wal")
                || name == format!("{file_name}-journal")
        }
        None => false,
    }
}
