// SPDX-License-Identifier: MIT

//! Turns filesystem notifications into coordinator events.
//!
//! On a local filesystem the repository root is watched recursively. Network
//! filesystems do not deliver reliable notifications, so there the root is
//! rescanned on a timer instead. The artifact directory gets a watch of its
//! own in both modes.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::event::{EventKind, ModifyKind};
use notify::{Event, PollWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::catalog::{parse_artifact_name, ArtifactKind};
use crate::error::{Error, Result};
use crate::settings::WatchMode;
use crate::sync::SyncEvent;

/// Filesystem magic numbers for which notifications are not trusted.
const NETWORK_FILESYSTEMS: &[(u32, &str)] = &[
    (0x6969, "nfs"),
    (0x517B, "smb"),
    (0xFF53_4D42, "cifs"),
    (0xFE53_4D42, "smb2"),
    (0x6573_5546, "fuse"),
    (0x7375_7245, "coda"),
    (0x5346_414F, "afs"),
    (0x0102_1997, "9p"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Events,
    Poll,
}

#[cfg(target_os = "linux")]
#[allow(clippy::unnecessary_cast)]
fn filesystem_type(path: &Path) -> Option<u32> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes()).ok()?;
    // SAFETY: statfs only writes into the zeroed buffer we own.
    let mut buf: libc::statfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statfs(c_path.as_ptr(), &mut buf) };
    if rc != 0 {
        return None;
    }
    Some(buf.f_type as u32)
}

#[cfg(not(target_os = "linux"))]
fn filesystem_type(_path: &Path) -> Option<u32> {
    None
}

/// Name of the network filesystem `path` lives on, if any.
pub fn network_filesystem(path: &Path) -> Option<&'static str> {
    let magic = filesystem_type(path)?;
    NETWORK_FILESYSTEMS
        .iter()
        .find(|(m, _)| *m == magic)
        .map(|(_, name)| *name)
}

/// Picks the operating mode once, at startup.
pub fn resolve_mode(setting: WatchMode, root: &Path) -> Mode {
    match setting {
        WatchMode::Events => Mode::Events,
        WatchMode::Poll => Mode::Poll,
        WatchMode::Auto => match network_filesystem(root) {
            Some(fs) => {
                info!("{} is on {}, polling for changes", root.display(), fs);
                Mode::Poll
            }
            None => Mode::Events,
        },
    }
}

fn is_catalog(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("xml"))
        .unwrap_or(false)
}

/// Events for a notification below the repository root.
pub fn classify_root(event: &Event, parsed: &Path) -> Vec<SyncEvent> {
    let content_write = matches!(
        event.kind,
        EventKind::Modify(ModifyKind::Data(_)) | EventKind::Modify(ModifyKind::Any)
    );
    match event.kind {
        EventKind::Access(_) | EventKind::Modify(ModifyKind::Metadata(_)) | EventKind::Other => {
            return Vec::new()
        }
        _ => {}
    }

    event
        .paths
        .iter()
        .filter(|p| !p.starts_with(parsed))
        .filter_map(|p| match (content_write, is_catalog(p)) {
            (true, true) => Some(SyncEvent::CatalogModified(p.clone())),
            // contents of package files are not tracked
            (true, false) => None,
            (false, _) => Some(SyncEvent::PathChanged(p.clone())),
        })
        .collect()
}

/// Events for a notification in the artifact directory.
pub fn classify_artifact(event: &Event) -> Vec<SyncEvent> {
    match event.kind {
        EventKind::Create(_)
        | EventKind::Modify(ModifyKind::Data(_))
        | EventKind::Modify(ModifyKind::Name(_))
        | EventKind::Modify(ModifyKind::Any) => {}
        _ => return Vec::new(),
    }
    event
        .paths
        .iter()
        .filter(|p| matches!(parse_artifact_name(p), Some((_, ArtifactKind::Components))))
        .map(|p| SyncEvent::ArtifactChanged(p.clone()))
        .collect()
}

fn forward(
    sender: UnboundedSender<SyncEvent>,
    classify: impl Fn(&Event) -> Vec<SyncEvent> + Send + 'static,
) -> impl FnMut(notify::Result<Event>) + Send + 'static {
    move |res| match res {
        Ok(event) => {
            for e in classify(&event) {
                let _ = sender.send(e);
            }
        }
        Err(e) => warn!(error = %e, "watch error"),
    }
}

pub struct FileWatcher {
    // notifications stop when these are dropped
    _watchers: Vec<Box<dyn Watcher + Send>>,
    ticker: Option<JoinHandle<()>>,
}

impl FileWatcher {
    /// Starts watching. Must be called inside a tokio runtime.
    pub fn start(
        root: &Path,
        parsed: &Path,
        mode: Mode,
        interval: Duration,
        sender: UnboundedSender<SyncEvent>,
    ) -> Result<Self> {
        fs::create_dir_all(parsed).map_err(|e| Error::io(parsed, e))?;
        let parsed_dir: PathBuf = parsed.to_path_buf();
        let mut watchers: Vec<Box<dyn Watcher + Send>> = Vec::new();
        let mut ticker = None;

        match mode {
            Mode::Events => {
                let mut w = notify::recommended_watcher(forward(sender.clone(), move |e| {
                    classify_root(e, &parsed_dir)
                }))?;
                w.watch(root, RecursiveMode::Recursive)?;
                watchers.push(Box::new(w));

                let mut a = notify::recommended_watcher(forward(sender.clone(), classify_artifact))?;
                a.watch(parsed, RecursiveMode::NonRecursive)?;
                watchers.push(Box::new(a));
            }
            Mode::Poll => {
                let config = notify::Config::default().with_poll_interval(interval);
                let mut a = PollWatcher::new(forward(sender.clone(), classify_artifact), config)?;
                a.watch(parsed, RecursiveMode::NonRecursive)?;
                watchers.push(Box::new(a));

                let tick = sender.clone();
                ticker = Some(tokio::spawn(async move {
                    let mut timer = tokio::time::interval(interval);
                    // the first tick completes immediately
                    timer.tick().await;
                    loop {
                        timer.tick().await;
                        if tick.send(SyncEvent::Rescan).is_err() {
                            break;
                        }
                    }
                }));
            }
        }

        info!(
            root = %root.display(),
            parsed = %parsed.display(),
            mode = ?mode,
            "watching for changes"
        );
        Ok(FileWatcher {
            _watchers: watchers,
            ticker,
        })
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        if let Some(t) = self.ticker.take() {
            t.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, RemoveKind, RenameMode};
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
    use tokio::time::timeout;

    fn event(kind: EventKind, path: &str) -> Event {
        Event::new(kind).add_path(PathBuf::from(path))
    }

    #[test]
    fn classify_root_test() {
        let parsed = Path::new("/srv/repos/.parsed");

        let e = event(EventKind::Create(CreateKind::Folder), "/srv/repos/r440");
        assert_eq!(
            vec![SyncEvent::PathChanged(PathBuf::from("/srv/repos/r440"))],
            classify_root(&e, parsed)
        );

        let e = event(
            EventKind::Modify(ModifyKind::Data(DataChange::Content)),
            "/srv/repos/r440/Catalog.xml",
        );
        assert_eq!(
            vec![SyncEvent::CatalogModified(PathBuf::from("/srv/repos/r440/Catalog.xml"))],
            classify_root(&e, parsed)
        );

        let e = event(
            EventKind::Modify(ModifyKind::Data(DataChange::Content)),
            "/srv/repos/r440/BIOS.EXE",
        );
        assert!(classify_root(&e, parsed).is_empty());

        let e = event(EventKind::Remove(RemoveKind::File), "/srv/repos/r440/Catalog.xml");
        assert_eq!(
            vec![SyncEvent::PathChanged(PathBuf::from("/srv/repos/r440/Catalog.xml"))],
            classify_root(&e, parsed)
        );

        let e = event(EventKind::Create(CreateKind::File), "/srv/repos/.parsed/r440_components.json");
        assert!(classify_root(&e, parsed).is_empty());
    }

    #[test]
    fn classify_artifact_test() {
        let e = event(
            EventKind::Modify(ModifyKind::Name(RenameMode::To)),
            "/var/lib/cs/r440_components.json",
        );
        assert_eq!(
            vec![SyncEvent::ArtifactChanged(PathBuf::from("/var/lib/cs/r440_components.json"))],
            classify_artifact(&e)
        );

        let e = event(EventKind::Create(CreateKind::File), "/var/lib/cs/r440_systems.json");
        assert!(classify_artifact(&e).is_empty());

        let e = event(EventKind::Remove(RemoveKind::File), "/var/lib/cs/r440_components.json");
        assert!(classify_artifact(&e).is_empty());
    }

    /// Waits for `expected`, skipping anything else the watcher reports.
    async fn wait_for(rx: &mut UnboundedReceiver<SyncEvent>, expected: SyncEvent) -> bool {
        let found = timeout(Duration::from_secs(10), async {
            while let Some(e) = rx.recv().await {
                if e == expected {
                    return true;
                }
            }
            false
        })
        .await;
        found.unwrap_or(false)
    }

    #[tokio::test]
    async fn events_mode_test() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let parsed = root.join(".parsed");
        let (tx, mut rx) = unbounded_channel();
        let _watcher = FileWatcher::start(&root, &parsed, Mode::Events, Duration::from_secs(60), tx).unwrap();
        assert!(parsed.is_dir());

        fs::create_dir(root.join("r440")).unwrap();
        assert!(wait_for(&mut rx, SyncEvent::PathChanged(root.join("r440"))).await);

        let artifact = parsed.join("r440_components.json");
        fs::write(&artifact, b"[]").unwrap();
        assert!(wait_for(&mut rx, SyncEvent::ArtifactChanged(artifact)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_mode_test() {
        let dir = tempfile::tempdir().unwrap();
        let parsed = dir.path().join(".parsed");
        let (tx, mut rx) = unbounded_channel();
        let started = tokio::time::Instant::now();
        let watcher = FileWatcher::start(dir.path(), &parsed, Mode::Poll, Duration::from_secs(60), tx).unwrap();

        // no scan at startup, one per interval after
        let first = timeout(Duration::from_secs(120), rx.recv()).await.unwrap();
        assert_eq!(Some(SyncEvent::Rescan), first);
        assert!(started.elapsed() >= Duration::from_secs(60));
        let second = timeout(Duration::from_secs(120), rx.recv()).await.unwrap();
        assert_eq!(Some(SyncEvent::Rescan), second);
        assert!(started.elapsed() >= Duration::from_secs(120));

        // dropping the watcher stops the timer
        drop(watcher);
        let after = timeout(Duration::from_secs(600), rx.recv()).await.ok().flatten();
        assert_eq!(None, after);
    }

    #[test]
    fn resolve_mode_test() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(Mode::Poll, resolve_mode(WatchMode::Poll, dir.path()));
        assert_eq!(Mode::Events, resolve_mode(WatchMode::Events, dir.path()));
    }
}
