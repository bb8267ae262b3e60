//! Shadow state and version reconciliation
//!
//! `ShadowState` is what each side keeps per peer: the shadow of the last
//! agreed document, both version counters, the backup shadow and the log of
//! edits the peer has not acknowledged yet. The server keeps one per member of
//! a room and uses the room's canonical document as the working copy. The
//! client wraps its own in `SyncState` together with its working copy.

use std::mem;

use tracing::{debug, warn};

use crate::diff::DiffEngine;
use crate::error::{SyncError, SyncResult};
use crate::message::{Edit, EditMessage, InboundVersions, Rejection, Side};
use crate::Document;

/// Shadow and versions as they were before the latest outbound diff
#[derive(Debug, Clone)]
pub struct Backup {
    pub shadow: Document,
    pub local_version: u64,
    pub remote_version: u64,
}

/// Outcome of a successfully reconciled inbound batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Reconciled {
    /// Non-empty diffs applied to the shadow
    pub applied: usize,
    /// Pending edits the peer acknowledged
    pub acknowledged: usize,
    /// Whether the shadow was restored from the backup first
    pub restored: bool,
    /// Accepted diffs that could not be applied to the working copy
    pub conflicts: usize,
}

/// Per-peer synchronization state
#[derive(Debug, Clone)]
pub struct ShadowState {
    shadow: Document,
    backup: Option<Backup>,
    local_version: u64,
    remote_version: u64,
    pending: Vec<Edit>,
}

impl ShadowState {
    /// Seed a state from a document, both versions at zero
    pub fn new(document: &Document) -> Self {
        Self {
            shadow: document.clone(),
            backup: None,
            local_version: 0,
            remote_version: 0,
            pending: Vec::new(),
        }
    }

    pub fn shadow(&self) -> &Document {
        &self.shadow
    }

    pub fn local_version(&self) -> u64 {
        self.local_version
    }

    pub fn remote_version(&self) -> u64 {
        self.remote_version
    }

    /// Edits not yet acknowledged by the peer, oldest first
    pub fn pending(&self) -> &[Edit] {
        &self.pending
    }

    /// Local version recorded in the backup, if one was taken
    pub fn backup_version(&self) -> Option<u64> {
        self.backup.as_ref().map(|b| b.local_version)
    }

    /// Diff `working` against the shadow and log the result as a pending edit
    ///
    /// Returns the local version the diff was computed from. An empty diff
    /// leaves the state untouched.
    pub fn commit_local<E: DiffEngine + ?Sized>(
        &mut self,
        engine: &E,
        working: &Document,
    ) -> SyncResult<u64> {
        let base = self.local_version;
        let diff = engine.diff(&self.shadow, working);
        if diff.is_empty() {
            return Ok(base);
        }

        let mut next = self.shadow.clone();
        engine.apply(&mut next, &diff)?;

        let previous = mem::replace(&mut self.shadow, next);
        self.backup = Some(Backup {
            shadow: previous,
            local_version: self.local_version,
            remote_version: self.remote_version,
        });
        self.pending.push(Edit {
            base_version: base,
            diff,
        });
        self.local_version += 1;

        Ok(base)
    }

    /// Commit local changes and build the batch to send to the peer
    pub fn prepare<E: DiffEngine + ?Sized>(
        &mut self,
        engine: &E,
        side: Side,
        room: &str,
        working: &Document,
    ) -> SyncResult<EditMessage> {
        let base = self.commit_local(engine, working)?;
        Ok(side.outbound(room, self.pending.clone(), base, self.remote_version))
    }

    /// What `prepare` would send, without changing anything
    ///
    /// Returns `None` when there is nothing outstanding for the peer.
    pub fn preview<E: DiffEngine + ?Sized>(
        &self,
        engine: &E,
        side: Side,
        room: &str,
        working: &Document,
    ) -> Option<EditMessage> {
        let mut edits = self.pending.clone();
        let diff = engine.diff(&self.shadow, working);
        if !diff.is_empty() {
            edits.push(Edit {
                base_version: self.local_version,
                diff,
            });
        }
        if edits.is_empty() {
            return None;
        }
        Some(side.outbound(room, edits, self.local_version, self.remote_version))
    }

    /// Validate an inbound batch and apply it
    ///
    /// Diffs go to the shadow strictly and to `working` best effort. Nothing
    /// is mutated unless the whole batch validates.
    pub fn reconcile<E: DiffEngine + ?Sized>(
        &mut self,
        engine: &E,
        working: &mut Document,
        versions: InboundVersions,
        edits: &[Edit],
    ) -> SyncResult<Reconciled> {
        let view = versions.view_of_receiver;

        let restore = if view == self.local_version {
            None
        } else {
            match &self.backup {
                Some(backup) if backup.local_version == view => Some(backup),
                _ => {
                    return Err(SyncError::RejectedEdit {
                        expected: self.local_version,
                        received: view,
                    })
                }
            }
        };

        let (mut shadow, mut remote) = match restore {
            Some(backup) => (backup.shadow.clone(), backup.remote_version),
            None => (self.shadow.clone(), self.remote_version),
        };

        if versions.sender_base < remote {
            return Err(SyncError::RejectedEdit {
                expected: remote,
                received: versions.sender_base,
            });
        }

        let mut accepted = Vec::new();
        for edit in edits {
            if edit.base_version < remote {
                debug!(base = edit.base_version, remote, "Skipping edit already applied");
                continue;
            }
            if edit.base_version > remote {
                return Err(SyncError::RejectedEdit {
                    expected: remote,
                    received: edit.base_version,
                });
            }
            if edit.diff.is_empty() {
                continue;
            }
            let base = shadow.clone();
            engine.apply(&mut shadow, &edit.diff)?;
            remote += 1;
            accepted.push((base, &edit.diff));
        }

        // Validated; commit
        let restored = restore.is_some();
        if restored {
            self.local_version = view;
            self.pending.retain(|edit| edit.base_version < view);
        }
        let before = self.pending.len();
        self.pending.retain(|edit| edit.base_version >= view);
        let acknowledged = before - self.pending.len();

        self.shadow = shadow;
        self.remote_version = remote;

        // Each diff lands whole or not at all
        let mut conflicts = 0;
        for (base, diff) in &accepted {
            if let Err(e) = engine.merge(working, base, diff) {
                warn!("Diff did not apply to the working copy: {}", e);
                conflicts += 1;
            }
        }

        Ok(Reconciled {
            applied: accepted.len(),
            acknowledged,
            restored,
            conflicts,
        })
    }

    /// Drop pending edits the peer has seen, given its record of our version
    pub fn acknowledge(&mut self, view: u64) -> usize {
        let before = self.pending.len();
        self.pending.retain(|edit| edit.base_version >= view);
        before - self.pending.len()
    }

    /// Restore shadow and versions from the backup if it matches `version`
    ///
    /// Returns whether a rollback happened.
    pub fn rollback_to(&mut self, version: u64) -> bool {
        if self.local_version == version {
            return false;
        }
        let Some(backup) = self.backup.as_ref() else {
            return false;
        };
        if backup.local_version != version {
            return false;
        }

        self.shadow = backup.shadow.clone();
        self.local_version = backup.local_version;
        self.remote_version = backup.remote_version;
        self.pending.retain(|edit| edit.base_version < version);
        true
    }
}

/// Client-side state: the working copy plus its shadow state
#[derive(Debug, Clone)]
pub struct SyncState {
    working_copy: Document,
    shadow: ShadowState,
}

impl SyncState {
    /// Seed from the document received on join
    pub fn new(document: Document) -> Self {
        let shadow = ShadowState::new(&document);
        Self {
            working_copy: document,
            shadow,
        }
    }

    pub fn working_copy(&self) -> &Document {
        &self.working_copy
    }

    pub fn working_copy_mut(&mut self) -> &mut Document {
        &mut self.working_copy
    }

    pub fn shadow(&self) -> &ShadowState {
        &self.shadow
    }

    /// `(local_version, remote_version)`
    pub fn versions(&self) -> (u64, u64) {
        (self.shadow.local_version(), self.shadow.remote_version())
    }

    /// Diff the working copy and build the outbound batch for `room`
    pub fn prepare_edits<E: DiffEngine + ?Sized>(
        &mut self,
        engine: &E,
        room: &str,
    ) -> SyncResult<EditMessage> {
        self.shadow
            .prepare(engine, Side::Client, room, &self.working_copy)
    }

    /// Apply the server's reply to shadow and working copy
    pub fn apply_server_edits<E: DiffEngine + ?Sized>(
        &mut self,
        engine: &E,
        message: &EditMessage,
    ) -> SyncResult<Reconciled> {
        self.shadow.reconcile(
            engine,
            &mut self.working_copy,
            Side::Client.inbound(message),
            &message.edits,
        )
    }

    /// Realign with the server's record after it rejected a batch
    ///
    /// Returns whether the backup shadow was restored.
    pub fn recover_from_rejection(&mut self, rejection: &Rejection) -> bool {
        self.shadow.acknowledge(rejection.local_version);
        self.shadow.rollback_to(rejection.local_version)
    }
}
