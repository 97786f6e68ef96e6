// SPDX-License-Identifier: MIT

//! The sync coordinator.
//!
//! Every change notification, poll tick and task completion is posted to a
//! single queue as a [`SyncEvent`] and handled here one at a time. Parsing
//! and merging run on the blocking pool; their completion comes back as
//! [`SyncEvent::Finished`].
//!
//! Per repository:
//!
//! ```text
//! Unknown -> Parsing -> Merging -> Synced
//! Synced -> Purging -> Unknown
//! ```
//!
//! A failed attempt returns the repository to `Unknown`. Because the
//! repository record is only written by a committed merge, the next scan
//! sees it as new again. The trigger that started the attempt is posted
//! once more after [`SyncCoordinator::with_retry_delay`].

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, warn};

use crate::catalog::{normalize, parse_artifact_name, ArtifactKind, CatalogWriter};
use crate::error::{Error, Result};
use crate::gate::{AvailabilityGate, GateGuard};
use crate::reconcile::{MergeReport, PurgeReport, StorageReconciler};
use crate::repository::{RepositoryCandidate, RepositoryDelta, RepositoryIndex};
use crate::store::{RepositoryRecord, Store};
use crate::xml;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoState {
    Unknown,
    Parsing,
    Merging,
    Synced,
    Purging,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Synced { report: MergeReport, skipped: usize },
    Purged { report: PurgeReport },
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Something was created, renamed or deleted at this path.
    PathChanged(PathBuf),
    /// A catalog file was written in place.
    CatalogModified(PathBuf),
    /// Full enumeration and diff against storage.
    Rescan,
    /// An intermediate artifact changed.
    ArtifactChanged(PathBuf),
    Progress { key: String, state: RepoState },
    Finished { key: String, outcome: Outcome },
    Shutdown,
}

/// Lets a running task report its state transitions.
struct Reporter {
    sender: UnboundedSender<SyncEvent>,
    key: String,
}

impl Reporter {
    fn state(&self, state: RepoState) {
        let _ = self.sender.send(SyncEvent::Progress {
            key: self.key.clone(),
            state,
        });
    }
}

pub struct SyncCoordinator<S: Store + 'static> {
    index: Arc<RepositoryIndex>,
    writer: Arc<CatalogWriter>,
    reconciler: Arc<StorageReconciler<S>>,
    gate: AvailabilityGate,
    sender: UnboundedSender<SyncEvent>,
    receiver: UnboundedReceiver<SyncEvent>,
    states: HashMap<String, RepoState>,
    /// Repository key to the event that started its task.
    in_flight: HashMap<String, SyncEvent>,
    /// Triggers that arrived while the key was in flight, merged into one.
    coalesced: HashMap<String, SyncEvent>,
    retry_delay: Duration,
}

impl<S: Store + 'static> SyncCoordinator<S> {
    pub fn new(
        index: RepositoryIndex,
        writer: CatalogWriter,
        reconciler: Arc<StorageReconciler<S>>,
        gate: AvailabilityGate,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        SyncCoordinator {
            index: Arc::new(index),
            writer: Arc::new(writer),
            reconciler,
            gate,
            sender,
            receiver,
            states: HashMap::new(),
            in_flight: HashMap::new(),
            coalesced: HashMap::new(),
            retry_delay: Duration::from_secs(30),
        }
    }

    /// How long a failed attempt waits before its trigger is posted again.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Handle for event sources.
    pub fn sender(&self) -> UnboundedSender<SyncEvent> {
        self.sender.clone()
    }

    pub fn gate(&self) -> &AvailabilityGate {
        &self.gate
    }

    pub fn state(&self, key: &str) -> RepoState {
        self.states.get(key).copied().unwrap_or(RepoState::Unknown)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    fn post(&self, event: SyncEvent) {
        let _ = self.sender.send(event);
    }

    fn transition(&mut self, key: &str, to: RepoState) {
        let from = self.state(key);
        if from != to {
            info!(repository = key, from = ?from, to = ?to, "state transition");
        }
        match to {
            RepoState::Unknown => self.states.remove(key),
            _ => self.states.insert(key.to_string(), to),
        };
    }

    /// Startup: open the gate, rescan, and queue every repository with an
    /// artifact for the missing-data check.
    pub fn recover(&mut self) {
        self.gate.reset();
        self.post(SyncEvent::Rescan);
        match self.writer.repository_ids() {
            Ok(ids) => {
                for id in ids {
                    self.post(SyncEvent::ArtifactChanged(
                        self.writer.path(&id, ArtifactKind::Components),
                    ));
                }
            }
            Err(e) => warn!(error = %e, "cannot list intermediate artifacts"),
        }
    }

    /// Handles events until a shutdown is requested.
    pub async fn run(mut self) {
        while let Some(event) = self.receiver.recv().await {
            if !self.handle(event) {
                break;
            }
        }
        info!(in_flight = self.in_flight.len(), "coordinator stopped");
    }

    /// Handles events until the queue is empty and no task is running.
    pub async fn run_until_idle(&mut self) {
        loop {
            let event = match self.in_flight.is_empty() {
                true => match self.receiver.try_recv() {
                    Ok(e) => e,
                    Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return,
                },
                false => match self.receiver.recv().await {
                    Some(e) => e,
                    None => return,
                },
            };
            if !self.handle(event) {
                return;
            }
        }
    }

    /// Returns false on shutdown.
    pub fn handle(&mut self, event: SyncEvent) -> bool {
        debug!(event = ?event, "handling");
        match event {
            SyncEvent::Rescan => self.rescan(None),
            SyncEvent::PathChanged(path) => self.rescan(Some(&path)),
            SyncEvent::CatalogModified(path) => self.catalog_modified(&path),
            SyncEvent::ArtifactChanged(path) => self.artifact_changed(&path),
            SyncEvent::Progress { key, state } => {
                if self.in_flight.contains_key(&key) {
                    self.transition(&key, state);
                }
            }
            SyncEvent::Finished { key, outcome } => self.finished(key, outcome),
            SyncEvent::Shutdown => return false,
        }
        true
    }

    fn stored(&self) -> Option<Vec<RepositoryRecord>> {
        match self.reconciler.store().repositories() {
            Ok(r) => Some(r),
            Err(e) => {
                error!(error = %e, "cannot read repository records");
                None
            }
        }
    }

    fn rescan(&mut self, path: Option<&Path>) {
        let stored = match self.stored() {
            Some(s) => s,
            None => return,
        };
        let delta = match path {
            Some(p) => {
                let scope = self.index.scope(p);
                self.index.diff_scoped(&scope, &stored)
            }
            None => {
                for r in &stored {
                    let key = self.index.repo_id_of(r);
                    if !self.in_flight.contains_key(&key) {
                        self.states.entry(key).or_insert(RepoState::Synced);
                    }
                }
                crate::repository::diff(&self.index.enumerate(), &stored)
            }
        };
        self.apply(delta);
    }

    fn apply(&mut self, delta: RepositoryDelta) {
        if !delta.is_empty() {
            info!(
                added = delta.added.len(),
                removed = delta.removed.len(),
                "repository changes"
            );
        }
        for record in delta.removed {
            self.start_purge(record);
        }
        for candidate in delta.added {
            let trigger = SyncEvent::PathChanged(candidate.file_path.clone());
            self.start_add(candidate, true, trigger);
        }
    }

    fn catalog_modified(&mut self, path: &Path) {
        let candidate = path
            .parent()
            .and_then(|dir| self.index.candidate(dir))
            .filter(|c| c.catalog_path == path);
        let candidate = match candidate {
            Some(c) => c,
            None => return self.rescan(Some(path)),
        };
        let known = match self.stored() {
            Some(s) => s.iter().any(|r| r.file_name == candidate.file_name),
            None => return,
        };
        // a content update of a synced repository keeps the gate open
        self.start_add(candidate, !known, SyncEvent::CatalogModified(path.to_path_buf()));
    }

    fn artifact_changed(&mut self, path: &Path) {
        let repo_id = match parse_artifact_name(path) {
            Some((id, ArtifactKind::Components)) => id,
            _ => return,
        };
        if self.in_flight.contains_key(&repo_id) {
            return;
        }
        let record = match self.stored() {
            Some(s) => s.into_iter().find(|r| self.index.repo_id_of(r) == repo_id),
            None => return,
        };
        let record = match record {
            Some(r) => r,
            None => {
                debug!(repository = %repo_id, "artifact of an unknown repository, ignoring");
                return;
            }
        };
        match self.reconciler.store().component_count(&record.file_name) {
            Ok(0) => {
                info!(repository = %repo_id, "no stored components, merging from artifact");
                self.start_remerge(record, true);
            }
            Ok(_) => {}
            Err(e) => error!(repository = %repo_id, error = %e, "cannot count components"),
        }
    }

    /// Registers a task for `key`. Returns false if one is already running,
    /// in which case `trigger` is kept to be posted when it finishes.
    fn claim(&mut self, key: &str, trigger: SyncEvent) -> bool {
        if !self.in_flight.contains_key(key) {
            self.in_flight.insert(key.to_string(), trigger);
            return true;
        }
        debug!(repository = key, "already in flight, coalescing");
        // a pending catalog rewrite wins over plain rescans
        let merged = match self.coalesced.remove(key) {
            Some(pending @ SyncEvent::CatalogModified(_)) => pending,
            _ => trigger,
        };
        self.coalesced.insert(key.to_string(), merged);
        false
    }

    fn spawn<F>(&self, key: String, guard: Option<GateGuard>, work: F)
    where
        F: FnOnce(&Reporter) -> Result<Outcome> + Send + 'static,
    {
        let sender = self.sender.clone();
        let reporter = Reporter {
            sender: sender.clone(),
            key: key.clone(),
        };
        tokio::spawn(async move {
            let joined = tokio::task::spawn_blocking(move || {
                // released when the work ends, panics included
                let _guard = guard;
                work(&reporter)
            })
            .await;
            let outcome = match joined {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => Outcome::Failed(e.to_string()),
                Err(e) => Outcome::Failed(format!("sync task aborted: {}", e)),
            };
            let _ = sender.send(SyncEvent::Finished { key, outcome });
        });
    }

    /// Parses, writes artifacts and merges one repository.
    fn start_add(&mut self, candidate: RepositoryCandidate, gated: bool, trigger: SyncEvent) {
        let key = candidate.repo_id.clone();
        if !self.claim(&key, trigger) {
            return;
        }
        let guard = gated.then(|| self.gate.close());
        self.transition(&key, RepoState::Parsing);

        let writer = Arc::clone(&self.writer);
        let reconciler = Arc::clone(&self.reconciler);
        self.spawn(key, guard, move |reporter| {
            let root = xml::decode_file(&candidate.catalog_path)?;
            let (catalog, report) = normalize(&root, &candidate.source())?;
            writer.write(&candidate.repo_id, &catalog)?;
            info!(
                repository = %candidate.repo_id,
                systems = catalog.systems.len(),
                components = catalog.components.len(),
                devices = catalog.devices.len(),
                bundles = catalog.bundles.len(),
                skipped = report.skipped_count(),
                "catalog parsed"
            );

            reporter.state(RepoState::Merging);
            let systems = writer.read_systems(&candidate.repo_id)?;
            let components = writer.read_components(&candidate.repo_id)?;
            let merged = reconciler.merge(
                &candidate.file_name,
                &candidate.record_path(),
                &systems,
                &components,
            )?;
            Ok(Outcome::Synced {
                report: merged,
                skipped: report.skipped_count(),
            })
        });
    }

    /// Merges a known repository from its artifacts, without parsing.
    fn start_remerge(&mut self, record: RepositoryRecord, gated: bool) {
        let key = self.index.repo_id_of(&record);
        let trigger = SyncEvent::ArtifactChanged(self.writer.path(&key, ArtifactKind::Components));
        if !self.claim(&key, trigger) {
            return;
        }
        let guard = gated.then(|| self.gate.close());
        self.transition(&key, RepoState::Merging);

        let writer = Arc::clone(&self.writer);
        let reconciler = Arc::clone(&self.reconciler);
        let repo_id = key.clone();
        self.spawn(key, guard, move |_| {
            let systems = writer.read_systems(&repo_id)?;
            let components = writer.read_components(&repo_id)?;
            let merged = reconciler.merge(&record.file_name, &record.file_path, &systems, &components)?;
            Ok(Outcome::Synced {
                report: merged,
                skipped: 0,
            })
        });
    }

    /// Removes artifacts first, then rows.
    ///
    /// The hashes listed in the components artifact are read before it is
    /// removed: their links are dropped too, even for rows another
    /// repository owns. The self-heal merge that follows restores the
    /// links the remaining repositories still declare.
    fn start_purge(&mut self, record: RepositoryRecord) {
        let key = self.index.repo_id_of(&record);
        if !self.claim(&key, SyncEvent::PathChanged(PathBuf::from(&record.file_path))) {
            return;
        }
        self.transition(&key, RepoState::Purging);

        let writer = Arc::clone(&self.writer);
        let reconciler = Arc::clone(&self.reconciler);
        let repo_id = key.clone();
        self.spawn(key, None, move |_| {
            let listed: BTreeSet<String> = match writer.read_components(&repo_id) {
                Ok(components) => components.into_iter().map(|c| c.hash_md5).collect(),
                Err(Error::MissingArtifact { .. }) => BTreeSet::new(),
                Err(e) => return Err(e),
            };
            writer.remove(&repo_id)?;
            let report = reconciler.purge(&record.file_name, &listed)?;
            if reconciler.store().repositories()?.is_empty() {
                reconciler.wipe()?;
            }
            Ok(Outcome::Purged { report })
        });
    }

    fn finished(&mut self, key: String, outcome: Outcome) {
        let started_by = self.in_flight.remove(&key);
        let pending = self.coalesced.remove(&key);
        match &outcome {
            Outcome::Synced { report, skipped } => {
                info!(
                    repository = %key,
                    components = report.components_inserted,
                    skipped,
                    stripped = report.stripped.len(),
                    "repository synced"
                );
                self.transition(&key, RepoState::Synced);
            }
            Outcome::Purged { .. } => {
                self.transition(&key, RepoState::Unknown);
                self.self_heal();
            }
            Outcome::Failed(message) => {
                error!(repository = %key, error = %message, "sync attempt failed, will retry");
                self.transition(&key, RepoState::Unknown);
                if let (None, Some(trigger)) = (&pending, started_by) {
                    self.retry_later(trigger);
                }
            }
        }

        if let Some(event) = pending {
            self.post(event);
        }
    }

    /// Posts `event` again once the retry delay has passed.
    fn retry_later(&self, event: SyncEvent) {
        let sender = self.sender.clone();
        let delay = self.retry_delay;
        debug!(event = ?event, delay = ?delay, "retry scheduled");
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = sender.send(event);
        });
    }

    /// Re-merges the remaining repositories from their artifacts so that
    /// packages shared with a purged repository are stored again.
    fn self_heal(&mut self) {
        let stored = match self.stored() {
            Some(s) => s,
            None => return,
        };
        for record in stored {
            let key = self.index.repo_id_of(&record);
            if self.in_flight.contains_key(&key)
                || !self.writer.exists(&key, ArtifactKind::Components)
            {
                continue;
            }
            self.start_remerge(record, false);
        }
    }
}
