//! Dialog table keyed by (Call-ID, local tag, remote tag).

use std::sync::Arc;

use dashmap::DashMap;
use tracing::trace;

use crate::dialog::{Dialog, DialogId};

/// Table of live dialogs for one account.
///
/// Lookup is by the RFC 3261 identity triple with partial matching while a
/// dialog is early (remote tag not yet pinned). One account carries at most
/// a handful of dialogs, so the triple lookup scans.
#[derive(Clone, Default)]
pub struct DialogStore {
    dialogs: Arc<DashMap<DialogId, Dialog>>,
}

impl DialogStore {
    /// Empty store.
    pub fn new() -> Self {
        DialogStore::default()
    }

    /// Insert a dialog, returning its id.
    pub fn insert(&self, dialog: Dialog) -> DialogId {
        let id = dialog.id;
        trace!(dialog = %id, call_id = %dialog.call_id, "dialog stored");
        self.dialogs.insert(id, dialog);
        id
    }

    /// Find a dialog by identity triple.
    ///
    /// `local_tag` is the tag we own on this dialog (To tag of an incoming
    /// request, From tag of an incoming response); `remote_tag` may be
    /// absent during early dialog.
    pub fn find(
        &self,
        call_id: &str,
        local_tag: &str,
        remote_tag: Option<&str>,
    ) -> Option<DialogId> {
        // Exact match wins over an early partial match.
        let mut partial = None;
        for entry in self.dialogs.iter() {
            let dialog = entry.value();
            if !dialog.matches(call_id, local_tag, remote_tag) {
                continue;
            }
            if dialog.remote_tag.as_deref() == remote_tag {
                return Some(dialog.id);
            }
            partial = Some(dialog.id);
        }
        partial
    }

    /// Find any dialog on a Call-ID.
    pub fn find_by_call_id(&self, call_id: &str) -> Option<DialogId> {
        self.dialogs
            .iter()
            .find(|e| e.value().call_id == call_id)
            .map(|e| e.value().id)
    }

    /// Snapshot of a dialog.
    pub fn get(&self, id: &DialogId) -> Option<Dialog> {
        self.dialogs.get(id).map(|d| d.value().clone())
    }

    /// Run `f` with mutable access to a dialog.
    pub fn with_mut<R>(&self, id: &DialogId, f: impl FnOnce(&mut Dialog) -> R) -> Option<R> {
        self.dialogs.get_mut(id).map(|mut d| f(&mut d))
    }

    /// Remove a dialog.
    pub fn remove(&self, id: &DialogId) -> Option<Dialog> {
        self.dialogs.remove(id).map(|(_, d)| d)
    }

    /// Number of live dialogs.
    pub fn len(&self) -> usize {
        self.dialogs.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.dialogs.is_empty()
    }
}
