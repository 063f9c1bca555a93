//! Process-wide directory of control operations.
//!
//! Operation owners register a set of named operations under a
//! `(type, id)` key. Control requests arriving from the hub are resolved
//! against that key and the named operation is invoked with the request's
//! argument object.
//!
//! Entries are stored behind `Arc`, so a dispatcher only holds the registry
//! lock long enough to clone the entry; the operation itself always runs with
//! the lock released. An entry becomes visible to dispatchers only once it is
//! fully built.

pub mod error;
pub mod request;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info};

pub use error::{ControlError, HandlerError};
pub use request::ControlRequest;

/// A single invokable operation.
pub type Operation = Arc<dyn Fn(Value) -> Result<(), HandlerError> + Send + Sync>;

/// Named operations registered together under one `(type, id)` key.
#[derive(Clone, Default)]
pub struct OperationSet {
    ops: HashMap<String, Operation>,
}

impl OperationSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<F>(mut self, name: impl Into<String>, op: F) -> Self
    where
        F: Fn(Value) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.insert(name, op);
        self
    }

    pub fn insert<F>(&mut self, name: impl Into<String>, op: F)
    where
        F: Fn(Value) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.ops.insert(name.into(), Arc::new(op));
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.ops.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    fn get(&self, op: &str) -> Option<&Operation> {
        self.ops.get(op)
    }
}

impl fmt::Debug for OperationSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationSet")
            .field("ops", &self.names())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ControlKey {
    pub kind: String,
    pub id: String,
}

impl ControlKey {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for ControlKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

#[derive(Default)]
pub struct ControlRegistry {
    entries: RwLock<HashMap<ControlKey, Arc<OperationSet>>>,
}

static GLOBAL: OnceLock<Arc<ControlRegistry>> = OnceLock::new();

impl ControlRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry shared by everything in this process.
    pub fn global() -> Arc<ControlRegistry> {
        GLOBAL
            .get_or_init(|| Arc::new(ControlRegistry::new()))
            .clone()
    }

    pub fn register(
        &self,
        kind: impl Into<String>,
        id: impl Into<String>,
        operations: OperationSet,
    ) -> Result<(), ControlError> {
        self.insert(ControlKey::new(kind, id), Arc::new(operations))
    }

    /// Registers `operations` and returns a guard that unregisters them on drop.
    pub fn register_scoped(
        self: &Arc<Self>,
        kind: impl Into<String>,
        id: impl Into<String>,
        operations: OperationSet,
    ) -> Result<ControlRegistration, ControlError> {
        let key = ControlKey::new(kind, id);
        let entry = Arc::new(operations);
        self.insert(key.clone(), entry.clone())?;
        Ok(ControlRegistration {
            registry: Arc::downgrade(self),
            key,
            entry,
        })
    }

    fn insert(&self, key: ControlKey, entry: Arc<OperationSet>) -> Result<(), ControlError> {
        let mut guard = self.entries.write();
        if guard.contains_key(&key) {
            return Err(ControlError::AlreadyRegistered {
                kind: key.kind,
                id: key.id,
            });
        }
        info!(target: "hub.control", control = %key, ops = ?entry.names(), "control registered");
        guard.insert(key, entry);
        Ok(())
    }

    /// Removes the entry for `(kind, id)`. Returns whether one existed.
    pub fn unregister(&self, kind: &str, id: &str) -> bool {
        let key = ControlKey::new(kind, id);
        let removed = self.entries.write().remove(&key).is_some();
        if removed {
            info!(target: "hub.control", control = %key, "control unregistered");
        }
        removed
    }

    pub fn contains(&self, kind: &str, id: &str) -> bool {
        self.entries.read().contains_key(&ControlKey::new(kind, id))
    }

    pub fn operations(&self, kind: &str, id: &str) -> Option<Vec<String>> {
        self.entries
            .read()
            .get(&ControlKey::new(kind, id))
            .map(|entry| entry.names())
    }

    pub fn list(&self) -> Vec<ControlKey> {
        let mut keys: Vec<ControlKey> = self.entries.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Invokes `request.op` on the `(type, id)` target with `request.args`.
    pub fn dispatch(&self, request: &ControlRequest) -> Result<(), ControlError> {
        let entry = self
            .entries
            .read()
            .get(&ControlKey::new(request.kind.as_str(), request.id.as_str()))
            .cloned()
            .ok_or_else(|| ControlError::NotFound {
                kind: request.kind.clone(),
                id: request.id.clone(),
            })?;

        let op = entry
            .get(&request.op)
            .ok_or_else(|| ControlError::UnknownOperation {
                kind: request.kind.clone(),
                id: request.id.clone(),
                op: request.op.clone(),
            })?;

        debug!(
            target: "hub.control",
            kind = %request.kind,
            id = %request.id,
            op = %request.op,
            "dispatching control operation"
        );
        op(request.args.clone()).map_err(|source| ControlError::Handler {
            kind: request.kind.clone(),
            id: request.id.clone(),
            op: request.op.clone(),
            source,
        })
    }

    /// Decodes a JSON request body and dispatches it.
    pub fn dispatch_value(&self, value: Value) -> Result<(), ControlError> {
        let request = ControlRequest::from_value(value)?;
        self.dispatch(&request)
    }
}

/// Keeps a control registered for as long as the guard lives.
pub struct ControlRegistration {
    registry: Weak<ControlRegistry>,
    key: ControlKey,
    entry: Arc<OperationSet>,
}

impl ControlRegistration {
    pub fn key(&self) -> &ControlKey {
        &self.key
    }
}

impl fmt::Debug for ControlRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlRegistration")
            .field("key", &self.key)
            .finish()
    }
}

impl Drop for ControlRegistration {
    fn drop(&mut self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut guard = registry.entries.write();
        // Only remove our own entry; the key may have been re-registered since.
        let ours = guard
            .get(&self.key)
            .is_some_and(|current| Arc::ptr_eq(current, &self.entry));
        if ours {
            guard.remove(&self.key);
            info!(target: "hub.control", control = %self.key, "control unregistered");
        }
    }
}
