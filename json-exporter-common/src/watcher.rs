//! Generic hot-reloadable configuration holder.
//!
//! [`ConfigWatcher`] keeps the most recently decoded value of an arbitrary
//! YAML-backed configuration type, reloads it when the file changes, and
//! survives decode errors without losing the last good value.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Minimum plausible size of a configuration file, in bytes.
const MIN_CONFIG_LEN: usize = 10;

/// How often the watch task reloads even without a filesystem event, and the
/// poll cadence when no filesystem notifier is available.
const IDLE_RELOAD: Duration = Duration::from_secs(10);

/// Errors surfaced by [`ConfigWatcher::load`].
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("could not read config at {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config at {path:?} is empty or truncated ({len} bytes)")]
    Truncated { path: PathBuf, len: usize },

    #[error("could not decode config at {path:?}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// An immutable, successfully decoded configuration plus the content
/// fingerprint of the bytes it was decoded from.
pub struct ConfigSnapshot<C> {
    pub config: Arc<C>,
    /// SHA-256 hex digest of the raw file bytes.
    pub fingerprint: String,
}

impl<C> Clone for ConfigSnapshot<C> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            fingerprint: self.fingerprint.clone(),
        }
    }
}

enum Command {
    Retarget,
    Stop,
}

struct State<C> {
    path: PathBuf,
    fingerprint: Option<String>,
    current: Option<Arc<C>>,
}

struct Inner<C> {
    state: Mutex<State<C>>,
    updates: watch::Sender<Option<ConfigSnapshot<C>>>,
}

impl<C: DeserializeOwned> Inner<C> {
    /// Read, fingerprint, and decode the watched file.
    ///
    /// The stored value and fingerprint are only replaced after a successful
    /// decode; any failure leaves the previous state untouched.
    fn load(&self) -> Result<(), LoadError> {
        let mut state = self.state.lock();
        let path = state.path.clone();

        let bytes = std::fs::read(&path).map_err(|source| LoadError::Read {
            path: path.clone(),
            source,
        })?;
        if bytes.len() < MIN_CONFIG_LEN {
            return Err(LoadError::Truncated {
                path,
                len: bytes.len(),
            });
        }

        let fingerprint = hex_digest(&bytes);
        if state.fingerprint.as_deref() == Some(fingerprint.as_str()) {
            // Same content as before, skip the decode.
            return Ok(());
        }

        let decoded: C = serde_yaml::from_slice(&bytes).map_err(|source| LoadError::Decode {
            path: path.clone(),
            source,
        })?;

        let snapshot = ConfigSnapshot {
            config: Arc::new(decoded),
            fingerprint: fingerprint.clone(),
        };
        state.current = Some(Arc::clone(&snapshot.config));
        state.fingerprint = Some(fingerprint.clone());
        drop(state);

        info!(path = %path.display(), fingerprint = %fingerprint, "loaded configuration");
        self.updates.send_replace(Some(snapshot));
        Ok(())
    }
}

/// Hot-reloadable holder of a decoded configuration value.
///
/// A background task reloads the file on filesystem change (with a periodic
/// reload as a guard against missed events), falling back to plain polling
/// when no notifier is available. Consumers either ask for the latest value
/// with [`current`](Self::current) or follow updates through
/// [`subscribe`](Self::subscribe).
pub struct ConfigWatcher<C> {
    inner: Arc<Inner<C>>,
    control: mpsc::UnboundedSender<Command>,
}

impl<C> ConfigWatcher<C>
where
    C: DeserializeOwned + Send + Sync + 'static,
{
    /// Create a watcher for `path` and start its background task.
    ///
    /// No load is attempted here; call [`load`](Self::load) to decide how a
    /// broken initial configuration should be handled.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let (updates, _) = watch::channel(None);
        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                path: path.into(),
                fingerprint: None,
                current: None,
            }),
            updates,
        });

        let (control, control_rx) = mpsc::unbounded_channel();
        tokio::spawn(watch_loop(Arc::clone(&inner), control_rx));

        Self { inner, control }
    }

    /// Reload from the watched path.
    pub fn load(&self) -> Result<(), LoadError> {
        self.inner.load()
    }

    /// Switch the watched path. A no-op when `path` is already watched;
    /// otherwise the watch task is retargeted and the new file is loaded.
    pub fn set_path(&self, path: impl Into<PathBuf>) -> Result<(), LoadError> {
        let path = path.into();
        {
            let mut state = self.inner.state.lock();
            if state.path == path {
                return Ok(());
            }
            state.path = path;
        }
        let _ = self.control.send(Command::Retarget);
        self.inner.load()
    }

    /// The most recently successfully decoded value, if any. Never blocks.
    pub fn current(&self) -> Option<Arc<C>> {
        self.inner.state.lock().current.clone()
    }

    /// Follow configuration snapshots as they are committed.
    pub fn subscribe(&self) -> watch::Receiver<Option<ConfigSnapshot<C>>> {
        self.inner.updates.subscribe()
    }

    /// Stop the background watch task.
    pub fn close(&self) {
        let _ = self.control.send(Command::Stop);
    }
}

async fn watch_loop<C>(inner: Arc<Inner<C>>, mut control: mpsc::UnboundedReceiver<Command>)
where
    C: DeserializeOwned + Send + Sync + 'static,
{
    let (event_tx, mut events) = mpsc::unbounded_channel();
    let mut watcher = match notify::recommended_watcher(move |event| {
        let _ = event_tx.send(event);
    }) {
        Ok(watcher) => watcher,
        Err(e) => {
            warn!(error = %e, "filesystem notifier unavailable, polling config file instead");
            poll_loop(inner, control).await;
            return;
        }
    };

    let mut watched = inner.state.lock().path.clone();
    let mut watched_dir = parent_dir(&watched);
    watch_dir(&mut watcher, &watched_dir);
    info!(path = %watched.display(), "watching config file");

    loop {
        tokio::select! {
            cmd = control.recv() => match cmd {
                None | Some(Command::Stop) => break,
                Some(Command::Retarget) => {
                    let next = inner.state.lock().path.clone();
                    info!(path = %next.display(), "retargeting config watch");
                    let _ = watcher.unwatch(&watched_dir);
                    watched_dir = parent_dir(&next);
                    watch_dir(&mut watcher, &watched_dir);
                    watched = next;
                }
            },
            event = events.recv() => match event {
                None => {
                    warn!("filesystem notifier closed");
                    break;
                }
                Some(Err(e)) => warn!(error = %e, "filesystem notifier error"),
                Some(Ok(event)) => {
                    if (event.kind.is_modify() || event.kind.is_create())
                        && touches(&event.paths, &watched)
                    {
                        if let Err(e) = inner.load() {
                            warn!(error = %e, "config reload failed");
                        }
                    }
                }
            },
            _ = tokio::time::sleep(IDLE_RELOAD) => {
                // Guard against missed events.
                if let Err(e) = inner.load() {
                    debug!(error = %e, "periodic config reload failed");
                }
            }
        }
    }
    debug!("config watch task stopped");
}

/// Fallback when no filesystem notifier can be created: reload on a fixed
/// cadence until told to stop.
async fn poll_loop<C>(inner: Arc<Inner<C>>, mut control: mpsc::UnboundedReceiver<Command>)
where
    C: DeserializeOwned + Send + Sync + 'static,
{
    loop {
        tokio::select! {
            cmd = control.recv() => match cmd {
                None | Some(Command::Stop) => break,
                // The next poll reads the updated path from shared state.
                Some(Command::Retarget) => {}
            },
            _ = tokio::time::sleep(IDLE_RELOAD) => {
                if let Err(e) = inner.load() {
                    warn!(error = %e, "config reload failed");
                }
            }
        }
    }
    debug!("config poll task stopped");
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn watch_dir(watcher: &mut RecommendedWatcher, dir: &Path) {
    if let Err(e) = watcher.watch(dir, RecursiveMode::NonRecursive) {
        warn!(dir = %dir.display(), error = %e, "could not watch config directory");
    }
}

/// Whether a notification concerns the watched file. Events without paths are
/// treated as relevant; the fingerprint check makes spurious reloads cheap.
fn touches(event_paths: &[PathBuf], watched: &Path) -> bool {
    if event_paths.is_empty() {
        return true;
    }
    match watched.file_name() {
        Some(name) => event_paths.iter().any(|p| p.file_name() == Some(name)),
        None => true,
    }
}

fn hex_digest(bytes: &[u8]) -> String {
    use std::fmt::Write;

    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct TestConfig {
        name: String,
        #[serde(default)]
        count: u32,
    }

    fn write_config(dir: &tempfile::TempDir, file: &str, content: &str) -> PathBuf {
        let path = dir.path().join(file);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[tokio::test]
    async fn test_load_and_current() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "config.yaml", "name: alpha\ncount: 3\n");

        let watcher = ConfigWatcher::<TestConfig>::new(&path);
        assert!(watcher.current().is_none());

        watcher.load().unwrap();
        let config = watcher.current().unwrap();
        assert_eq!(config.name, "alpha");
        assert_eq!(config.count, 3);
        watcher.close();
    }

    #[tokio::test]
    async fn test_unchanged_content_decodes_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "config.yaml", "name: alpha\ncount: 3\n");

        let watcher = ConfigWatcher::<TestConfig>::new(&path);
        watcher.load().unwrap();
        let first = watcher.current().unwrap();

        // Identical bytes: the fingerprint check short-circuits the decode
        // and the stored instance is untouched.
        watcher.load().unwrap();
        let second = watcher.current().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        watcher.close();
    }

    #[tokio::test]
    async fn test_decode_failure_keeps_last_good_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "config.yaml", "name: alpha\ncount: 3\n");

        let watcher = ConfigWatcher::<TestConfig>::new(&path);
        watcher.load().unwrap();

        std::fs::write(&path, "::: not yaml at all {{{\n").unwrap();
        let err = watcher.load().unwrap_err();
        assert!(matches!(err, LoadError::Decode { .. }));

        let config = watcher.current().unwrap();
        assert_eq!(config.name, "alpha");

        // A later good write is picked up normally.
        std::fs::write(&path, "name: beta\ncount: 7\n").unwrap();
        watcher.load().unwrap();
        assert_eq!(watcher.current().unwrap().name, "beta");
        watcher.close();
    }

    #[tokio::test]
    async fn test_truncated_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "config.yaml", "n: 1\n");

        let watcher = ConfigWatcher::<TestConfig>::new(&path);
        let err = watcher.load().unwrap_err();
        assert!(matches!(err, LoadError::Truncated { len: 5, .. }));
        assert!(watcher.current().is_none());
        watcher.close();
    }

    #[tokio::test]
    async fn test_missing_file_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = ConfigWatcher::<TestConfig>::new(dir.path().join("nope.yaml"));
        let err = watcher.load().unwrap_err();
        assert!(matches!(err, LoadError::Read { .. }));
        watcher.close();
    }

    #[tokio::test]
    async fn test_set_path_same_path_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.yaml");

        // Same path returns Ok without attempting a reload, even though the
        // file does not exist.
        let watcher = ConfigWatcher::<TestConfig>::new(&path);
        watcher.set_path(&path).unwrap();
        watcher.close();
    }

    #[tokio::test]
    async fn test_set_path_switches_file() {
        let dir = tempfile::tempdir().unwrap();
        let first = write_config(&dir, "first.yaml", "name: alpha\ncount: 1\n");
        let second = write_config(&dir, "second.yaml", "name: beta\ncount: 2\n");

        let watcher = ConfigWatcher::<TestConfig>::new(&first);
        watcher.load().unwrap();
        assert_eq!(watcher.current().unwrap().name, "alpha");

        watcher.set_path(&second).unwrap();
        assert_eq!(watcher.current().unwrap().name, "beta");
        watcher.close();
    }

    #[tokio::test]
    async fn test_subscribers_see_committed_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "config.yaml", "name: alpha\ncount: 3\n");

        let watcher = ConfigWatcher::<TestConfig>::new(&path);
        let mut updates = watcher.subscribe();
        assert!(updates.borrow().is_none());

        watcher.load().unwrap();
        assert!(updates.has_changed().unwrap());
        let snapshot = updates.borrow_and_update().clone().unwrap();
        assert_eq!(snapshot.config.name, "alpha");
        assert_eq!(snapshot.fingerprint.len(), 64);
        watcher.close();
    }
}
