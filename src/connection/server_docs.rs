//! Authoritative server state for documents that stubs have written.
//!
//! While a stub's method is outstanding, the server's view of every
//! document it touched is kept here instead of in the store. Once every
//! method that wrote a document reports its data done (`updated`), the
//! store copy is overwritten with the server's version via a synthetic
//! `replace`, which reverts stub effects the server did not confirm.

use crate::error::{DdpError, Result};
use crate::protocol::Document;
use crate::store::{Originals, StoreUpdate};
use std::collections::{HashMap, HashSet};

/// Work deferred until the current round of store writes has been applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum AfterUpdate {
    /// All writes of this method are now visible.
    DataVisible(String),
    /// The subscription's initial data is complete.
    SubReady(String),
}

#[derive(Debug, Default)]
pub(crate) struct ServerDocument {
    /// `None` means the server has no such document (or removed it).
    pub(crate) document: Option<Document>,
    pub(crate) written_by_stubs: HashSet<String>,
    flush_fences: Vec<u64>,
}

/// Counts down the documents an action is waiting on.
#[derive(Debug)]
struct Fence {
    remaining: usize,
    action: AfterUpdate,
}

#[derive(Debug, Default)]
pub(crate) struct ServerDocumentTracker {
    docs: HashMap<String, HashMap<String, ServerDocument>>,
    written_by_stub: HashMap<String, Vec<(String, String)>>,
    fences: HashMap<u64, Fence>,
    next_fence: u64,
}

impl ServerDocumentTracker {
    #[cfg(test)]
    pub(crate) fn get(&self, collection: &str, id: &str) -> Option<&ServerDocument> {
        self.docs.get(collection).and_then(|c| c.get(id))
    }

    pub(crate) fn get_mut(&mut self, collection: &str, id: &str) -> Option<&mut ServerDocument> {
        self.docs.get_mut(collection).and_then(|c| c.get_mut(id))
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.docs.values().all(HashMap::is_empty)
    }

    /// Forget every stub effect; the stores are about to be reset.
    pub(crate) fn clear(&mut self) {
        self.docs.clear();
        self.written_by_stub.clear();
        self.fences.clear();
    }

    /// Record the originals captured while `method_id`'s stub ran. The first
    /// writer of a document supplies its pre-write snapshot; later writers
    /// only join `written_by_stubs`.
    pub(crate) fn record_stub_writes(
        &mut self,
        method_id: &str,
        writes: Vec<(String, Originals)>,
    ) -> Result<()> {
        if self.written_by_stub.contains_key(method_id) {
            return Err(DdpError::invariant(format!(
                "duplicate method id {method_id} while storing originals"
            )));
        }

        let mut written = Vec::new();
        for (collection, originals) in writes {
            let mut originals: Vec<(String, Option<Document>)> = originals.into_iter().collect();
            originals.sort_by(|a, b| a.0.cmp(&b.0));
            let per_collection = self.docs.entry(collection.clone()).or_default();
            for (id, original) in originals {
                written.push((collection.clone(), id.clone()));
                per_collection
                    .entry(id)
                    .or_insert_with(|| ServerDocument {
                        document: original,
                        ..ServerDocument::default()
                    })
                    .written_by_stubs
                    .insert(method_id.to_string());
            }
        }

        if !written.is_empty() {
            self.written_by_stub.insert(method_id.to_string(), written);
        }
        Ok(())
    }

    /// Handle "data done" for one method. Returns the `replace` writes for
    /// documents no stub is waiting on any more, and the deferred actions
    /// whose fences just cleared.
    pub(crate) fn method_data_done(
        &mut self,
        method_id: &str,
    ) -> Result<(Vec<(String, StoreUpdate)>, Vec<AfterUpdate>)> {
        let mut updates = Vec::new();
        let mut released = Vec::new();

        let written = self.written_by_stub.remove(method_id).unwrap_or_default();
        for (collection, id) in written {
            let Some(per_collection) = self.docs.get_mut(&collection) else {
                return Err(lost(&collection, &id));
            };
            let Some(server_doc) = per_collection.get_mut(&id) else {
                return Err(lost(&collection, &id));
            };
            if !server_doc.written_by_stubs.remove(method_id) {
                return Err(DdpError::invariant(format!(
                    "document {collection}/{id} not written by method {method_id}"
                )));
            }
            if !server_doc.written_by_stubs.is_empty() {
                continue;
            }

            if let Some(done) = per_collection.remove(&id) {
                updates.push((
                    collection.clone(),
                    StoreUpdate::Replace {
                        id: id.clone(),
                        replace: done.document,
                    },
                ));
                for fence_id in done.flush_fences {
                    if let Some(action) = self.pass_fence(fence_id) {
                        released.push(action);
                    }
                }
            }
        }
        Ok((updates, released))
    }

    fn pass_fence(&mut self, fence_id: u64) -> Option<AfterUpdate> {
        let fence = self.fences.get_mut(&fence_id)?;
        fence.remaining = fence.remaining.saturating_sub(1);
        if fence.remaining == 0 {
            self.fences.remove(&fence_id).map(|f| f.action)
        } else {
            None
        }
    }

    /// Defer `action` until every document currently blocked on a sent
    /// method has been flushed. Returns the action straight back if nothing
    /// is blocking it.
    pub(crate) fn run_when_flushed(
        &mut self,
        action: AfterUpdate,
        is_sent: impl Fn(&str) -> bool,
    ) -> Option<AfterUpdate> {
        let fence_id = self.next_fence;
        let mut remaining = 0;
        for server_doc in self.docs.values_mut().flat_map(HashMap::values_mut) {
            if server_doc.written_by_stubs.iter().any(|m| is_sent(m)) {
                server_doc.flush_fences.push(fence_id);
                remaining += 1;
            }
        }
        if remaining == 0 {
            return Some(action);
        }
        self.next_fence += 1;
        self.fences.insert(fence_id, Fence { remaining, action });
        None
    }

    #[cfg(test)]
    pub(crate) fn has_writes_for(&self, method_id: &str) -> bool {
        self.written_by_stub.contains_key(method_id)
    }
}

fn lost(collection: &str, id: &str) -> DdpError {
    DdpError::invariant(format!("lost server document for {collection}/{id}"))
}

// ── Tests ───────────────────────────────────────────────────────
