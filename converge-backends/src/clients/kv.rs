//! In-memory key-value backend.
//!
//! Models a hierarchical key tree the way a small coordination service
//! exposes one: directory nodes, leaf values, and explicit not-found /
//! already-exists outcomes. Writing a value materializes missing parent
//! directories; creating a directory that already exists reports
//! `AlreadyExists` and leaves the caller to decide whether that matters.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use converge_core::backend::{BackendClient, BackendError};
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Default)]
struct Tree {
    dirs: BTreeSet<String>,
    values: BTreeMap<String, String>,
}

/// Memory-backed client for the `kv` service.
#[derive(Default)]
pub struct MemoryKvClient {
    state: Mutex<Tree>,
    offline: AtomicBool,
}

impl MemoryKvClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the backend dropping off the network. While offline every
    /// call fails `Unavailable`, which callers classify as transient.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Leaf value at `path`, if one exists.
    pub async fn value(&self, path: &str) -> Option<String> {
        self.state.lock().await.values.get(path).cloned()
    }

    /// Whether a directory node exists at `path`.
    pub async fn has_dir(&self, path: &str) -> bool {
        self.state.lock().await.dirs.contains(path)
    }

    /// All leaf paths, sorted.
    pub async fn paths(&self) -> Vec<String> {
        self.state.lock().await.values.keys().cloned().collect()
    }

    async fn read(&self, args: &Value) -> Result<Value, BackendError> {
        let path = require_path(args, "read")?;
        let tree = self.state.lock().await;
        if let Some(value) = tree.values.get(path) {
            return Ok(json!({ "path": path, "value": value }));
        }
        if tree.dirs.contains(path) {
            return Ok(json!({ "path": path, "dir": true }));
        }
        Err(BackendError::NotFound(path.to_string()))
    }

    async fn write(&self, args: &Value) -> Result<Value, BackendError> {
        let path = require_path(args, "write")?;
        let mut tree = self.state.lock().await;
        if args.get("dir").and_then(Value::as_bool).unwrap_or(false) {
            if tree.dirs.contains(path) || tree.values.contains_key(path) {
                return Err(BackendError::AlreadyExists(path.to_string()));
            }
            insert_dir_with_parents(&mut tree.dirs, path);
            debug!("Created kv directory {}", path);
            return Ok(json!({ "path": path, "dir": true }));
        }

        let value = args.get("value").and_then(Value::as_str).ok_or_else(|| {
            BackendError::Other("write requires a string value or dir=true".to_string())
        })?;
        if tree.dirs.contains(path) {
            return Err(BackendError::AlreadyExists(format!(
                "{} is a directory",
                path
            )));
        }
        if let Some((parent, _)) = path.rsplit_once('/') {
            insert_dir_with_parents(&mut tree.dirs, parent);
        }
        tree.values.insert(path.to_string(), value.to_string());
        Ok(json!({ "path": path }))
    }

    async fn delete(&self, args: &Value) -> Result<Value, BackendError> {
        let path = require_path(args, "delete")?;
        let recursive = args
            .get("recursive")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let mut tree = self.state.lock().await;

        if tree.values.remove(path).is_some() {
            return Ok(json!({ "deleted": 1 }));
        }
        if !tree.dirs.contains(path) {
            return Err(BackendError::NotFound(path.to_string()));
        }

        let prefix = format!("{}/", path);
        let children = tree.values.keys().any(|k| k.starts_with(&prefix))
            || tree.dirs.iter().any(|d| d.starts_with(&prefix));
        if children && !recursive {
            return Err(BackendError::Other(format!("{} is not empty", path)));
        }
        tree.dirs.remove(path);
        let removed_dirs: Vec<String> = tree
            .dirs
            .iter()
            .filter(|d| d.starts_with(&prefix))
            .cloned()
            .collect();
        for dir in &removed_dirs {
            tree.dirs.remove(dir);
        }
        let removed_values: Vec<String> = tree
            .values
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .cloned()
            .collect();
        for key in &removed_values {
            tree.values.remove(key);
        }
        debug!("Removed kv subtree {} ({} values)", path, removed_values.len());
        Ok(json!({ "deleted": 1 + removed_dirs.len() + removed_values.len() }))
    }
}

fn require_path<'a>(args: &'a Value, verb: &str) -> Result<&'a str, BackendError> {
    args.get("path")
        .and_then(Value::as_str)
        .ok_or_else(|| BackendError::Other(format!("{} requires a path", verb)))
}

fn insert_dir_with_parents(dirs: &mut BTreeSet<String>, path: &str) {
    let mut end = path.len();
    loop {
        dirs.insert(path[..end].to_string());
        match path[..end].rfind('/') {
            Some(idx) => end = idx,
            None => break,
        }
    }
}

#[async_trait]
impl BackendClient for MemoryKvClient {
    fn service(&self) -> &str {
        "kv"
    }

    async fn call(&self, verb: &str, args: &Value) -> Result<Value, BackendError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("kv backend offline".to_string()));
        }
        match verb {
            "read" => self.read(args).await,
            "write" => self.write(args).await,
            "delete" => self.delete(args).await,
            _ => Err(BackendError::UnsupportedCapability(format!("kv.{}", verb))),
        }
    }
}
