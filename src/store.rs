//! Local document storage contract and an in-memory reference store.
//!
//! The connection never owns document contents; it drives each named
//! collection's [`Store`] through a begin/update/end transaction and asks it
//! for the pre-write "originals" of documents a stub touched. Every method
//! has a no-op default, so a store only implements what it supports.

use crate::protocol::{apply_changes, random_id, Document};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Pre-write snapshots captured while a stub ran: id -> document as it was
/// before the first stub write (`None` if it did not exist).
pub type Originals = HashMap<String, Option<Document>>;

/// One write applied to a store inside an update transaction.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "msg", rename_all = "lowercase")]
pub enum StoreUpdate {
    Added {
        id: String,
        fields: Document,
    },
    Changed {
        id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        fields: Option<Document>,
        #[serde(skip_serializing_if = "Option::is_none")]
        cleared: Option<Vec<String>>,
    },
    Removed {
        id: String,
    },
    /// Reconciliation result: overwrite the document with the authoritative
    /// server version, or delete it when `replace` is `None`.
    Replace {
        id: String,
        replace: Option<Document>,
    },
}

impl StoreUpdate {
    pub fn id(&self) -> &str {
        match self {
            Self::Added { id, .. }
            | Self::Changed { id, .. }
            | Self::Removed { id }
            | Self::Replace { id, .. } => id,
        }
    }
}

/// A named collection's local storage, as seen by the connection.
pub trait Store: Send {
    /// Start a transaction of `batch_size` updates. `reset` means the store
    /// must drop all of its documents first (fresh session after reconnect).
    fn begin_update(&mut self, _batch_size: usize, _reset: bool) {}

    fn update(&mut self, _msg: StoreUpdate) {}

    fn end_update(&mut self) {}

    /// Start recording the pre-write value of every document written until
    /// [`Store::retrieve_originals`].
    fn save_originals(&mut self) {}

    /// Stop recording and return what was captured. `None` if this store
    /// does not track originals.
    fn retrieve_originals(&mut self) -> Option<Originals> {
        None
    }

    fn get_doc(&self, _id: &str) -> Option<Document> {
        None
    }
}

/// Shared handles let stubs write to the same store the connection drives.
impl<S: Store> Store for Arc<Mutex<S>> {
    fn begin_update(&mut self, batch_size: usize, reset: bool) {
        self.lock().begin_update(batch_size, reset);
    }

    fn update(&mut self, msg: StoreUpdate) {
        self.lock().update(msg);
    }

    fn end_update(&mut self) {
        self.lock().end_update();
    }

    fn save_originals(&mut self) {
        self.lock().save_originals();
    }

    fn retrieve_originals(&mut self) -> Option<Originals> {
        self.lock().retrieve_originals()
    }

    fn get_doc(&self, id: &str) -> Option<Document> {
        self.lock().get_doc(id)
    }
}

// ── In-memory store ─────────────────────────────────────────────

/// A simple in-memory collection.
///
/// Local writes (`insert`, `update_fields`, `remove`) are what stubs use;
/// they record originals while a stub is being simulated. Server writes
/// arrive through [`Store::update`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    docs: BTreeMap<String, Document>,
    originals: Option<Originals>,
    in_update: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store wrapped for sharing between the connection and stubs.
    pub fn shared() -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self::new()))
    }

    pub fn get(&self, id: &str) -> Option<&Document> {
        self.docs.get(id)
    }

    /// All documents, ordered by id.
    pub fn find_all(&self) -> Vec<Document> {
        self.docs.values().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.docs.len()
    }

    /// Insert a document, assigning a random `_id` if it has none.
    /// Returns the id.
    pub fn insert(&mut self, mut doc: Document) -> String {
        let id = match doc.get("_id").and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => {
                let id = random_id();
                doc.insert("_id".into(), Value::String(id.clone()));
                id
            }
        };
        self.save_original(&id);
        self.docs.insert(id.clone(), doc);
        id
    }

    /// Set and clear fields on an existing document. Returns false if the
    /// document does not exist.
    pub fn update_fields(&mut self, id: &str, fields: &Document, cleared: &[String]) -> bool {
        if !self.docs.contains_key(id) {
            return false;
        }
        self.save_original(id);
        if let Some(doc) = self.docs.get_mut(id) {
            apply_changes(doc, Some(fields), Some(cleared));
        }
        true
    }

    pub fn remove(&mut self, id: &str) -> bool {
        if !self.docs.contains_key(id) {
            return false;
        }
        self.save_original(id);
        self.docs.remove(id).is_some()
    }

    fn save_original(&mut self, id: &str) {
        if let Some(originals) = self.originals.as_mut() {
            if !originals.contains_key(id) {
                originals.insert(id.to_string(), self.docs.get(id).cloned());
            }
        }
    }
}

impl Store for MemoryStore {
    fn begin_update(&mut self, _batch_size: usize, reset: bool) {
        self.in_update = true;
        if reset {
            self.docs.clear();
        }
    }

    fn update(&mut self, msg: StoreUpdate) {
        if !self.in_update {
            tracing::warn!(id = msg.id(), "store update outside of a begin/end transaction");
        }
        match msg {
            StoreUpdate::Added { id, mut fields } => {
                if self.docs.contains_key(&id) {
                    tracing::warn!(%id, "Expected not to find a document already present for an add");
                }
                fields.insert("_id".into(), Value::String(id.clone()));
                self.docs.insert(id, fields);
            }
            StoreUpdate::Changed {
                id,
                fields,
                cleared,
            } => match self.docs.get_mut(&id) {
                Some(doc) => apply_changes(doc, fields.as_ref(), cleared.as_deref()),
                None => {
                    tracing::warn!(%id, "Expected to find a document to change");
                }
            },
            StoreUpdate::Removed { id } => {
                if self.docs.remove(&id).is_none() {
                    tracing::warn!(%id, "Expected to find a document to remove");
                }
            }
            StoreUpdate::Replace { id, replace } => match replace {
                Some(mut doc) => {
                    doc.insert("_id".into(), Value::String(id.clone()));
                    self.docs.insert(id, doc);
                }
                None => {
                    self.docs.remove(&id);
                }
            },
        }
    }

    fn end_update(&mut self) {
        self.in_update = false;
    }

    fn save_originals(&mut self) {
        if self.originals.is_some() {
            tracing::warn!("saveOriginals called twice without retrieveOriginals");
        }
        self.originals = Some(Originals::new());
    }

    fn retrieve_originals(&mut self) -> Option<Originals> {
        if self.originals.is_none() {
            tracing::warn!("retrieveOriginals called without saveOriginals");
        }
        self.originals.take()
    }

    fn get_doc(&self, id: &str) -> Option<Document> {
        self.docs.get(id).cloned()
    }
}

// ── Tests ───────────────────────────────────────────────────────
