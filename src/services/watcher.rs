use crate::error::AppError;
use crate::models::fs_types::DiscoveredFile;
use crate::services::fs_service::{absolute_root, ExtensionFilter};
use crossbeam_channel::{Receiver, Sender};
use notify::event::{AccessKind, AccessMode, CreateKind, ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub type FileSink = Arc<dyn Fn(DiscoveredFile) + Send + Sync>;

/// How long a created file may stay silent before it is reported without
/// its writer having closed it.
pub const DEFAULT_SETTLE: Duration = Duration::from_millis(2000);

struct WatcherState {
    watcher: RecommendedWatcher,
    path: PathBuf,
    stop: Sender<()>,
    settler: JoinHandle<()>,
}

impl WatcherState {
    fn shut_down(self) {
        drop(self.watcher);
        drop(self.stop);
        if self.settler.join().is_err() {
            tracing::error!(path = %self.path.display(), "watch settle thread panicked");
        }
    }
}

/// Reports files that appear under a folder tree after the watch starts.
///
/// A created file is held back until its writer closes it, or until no
/// event touched it for the settle period, so it is never reported half
/// written. Files renamed into the tree are complete and reported at once.
/// The sink runs on the watcher's own settle thread.
pub struct FolderWatcher {
    settle: Duration,
    state: Mutex<Option<WatcherState>>,
}

impl Default for FolderWatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl FolderWatcher {
    pub fn new() -> Self {
        Self::with_settle(DEFAULT_SETTLE)
    }

    pub fn with_settle(settle: Duration) -> Self {
        Self {
            settle,
            state: Mutex::new(None),
        }
    }

    pub fn watch_folder(
        &self,
        path: &Path,
        filter: ExtensionFilter,
        sink: FileSink,
    ) -> Result<(), AppError> {
        let watch_path = absolute_root(path)?;
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());

        // Already watching this path
        if let Some(ref s) = *state {
            if s.path == watch_path {
                return Ok(());
            }
        }

        // Stop the old watch before starting the new one
        if let Some(old) = state.take() {
            old.shut_down();
        }

        let (event_tx, event_rx) = crossbeam_channel::unbounded::<Event>();
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            match res {
                Ok(event) => {
                    let _ = event_tx.send(event);
                }
                Err(e) => tracing::warn!("Watch error: {}", e),
            }
        })?;
        watcher.watch(&watch_path, RecursiveMode::Recursive)?;

        let settle = self.settle;
        let settler = thread::Builder::new()
            .name("watch-settle".to_string())
            .spawn(move || settle_loop(event_rx, stop_rx, filter, sink, settle))?;
        tracing::info!(path = %watch_path.display(), "watching for new files");

        *state = Some(WatcherState {
            watcher,
            path: watch_path,
            stop: stop_tx,
            settler,
        });
        Ok(())
    }

    pub fn watched_path(&self) -> Option<PathBuf> {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.as_ref().map(|s| s.path.clone()))
    }

    /// Stops watching. Files still waiting to settle are not reported.
    pub fn stop(&self) {
        let old = self.state.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(old) = old {
            old.shut_down();
        }
    }
}

/// Created files that have not been reported yet, with the instant each
/// one is reported if nothing else happens to it.
struct Pending {
    settle: Duration,
    filter: ExtensionFilter,
    sink: FileSink,
    deadlines: HashMap<PathBuf, Instant>,
}

impl Pending {
    fn next_wait(&self) -> Duration {
        self.deadlines
            .values()
            .min()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::from_secs(3600))
    }

    fn apply(&mut self, event: Event) {
        let deadline = Instant::now() + self.settle;
        match event.kind {
            EventKind::Create(CreateKind::File) | EventKind::Create(CreateKind::Any) => {
                for path in event.paths {
                    if self.filter.matches(&path) {
                        self.deadlines.insert(path, deadline);
                    }
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                for path in event.paths {
                    self.deadlines.remove(&path);
                    if self.filter.matches(&path) {
                        self.report(path);
                    }
                }
            }
            EventKind::Access(AccessKind::Close(AccessMode::Write)) => {
                for path in event.paths {
                    if self.deadlines.remove(&path).is_some() {
                        self.report(path);
                    }
                }
            }
            EventKind::Modify(ModifyKind::Name(_)) | EventKind::Remove(_) => {
                for path in &event.paths {
                    self.deadlines.remove(path);
                }
            }
            EventKind::Modify(_) => {
                for path in &event.paths {
                    if let Some(d) = self.deadlines.get_mut(path) {
                        *d = deadline;
                    }
                }
            }
            _ => {}
        }
    }

    fn report_due(&mut self) {
        let now = Instant::now();
        let due: Vec<PathBuf> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(path, _)| path.clone())
            .collect();
        for path in due {
            self.deadlines.remove(&path);
            tracing::debug!(path = %path.display(), "settled without close");
            self.report(path);
        }
    }

    fn report(&self, path: PathBuf) {
        if !path.is_file() {
            return;
        }
        if let Some(file) = DiscoveredFile::from_path(path) {
            tracing::debug!(path = %file.path.display(), "new file");
            (self.sink)(file);
        }
    }
}

fn settle_loop(
    events: Receiver<Event>,
    stop: Receiver<()>,
    filter: ExtensionFilter,
    sink: FileSink,
    settle: Duration,
) {
    let mut pending = Pending {
        settle,
        filter,
        sink,
        deadlines: HashMap::new(),
    };
    loop {
        crossbeam_channel::select! {
            recv(events) -> event => match event {
                Ok(event) => pending.apply(event),
                Err(_) => break,
            },
            recv(stop) -> _ => break,
            default(pending.next_wait()) => {}
        }
        pending.report_due();
    }
}
