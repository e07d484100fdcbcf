//! Hierarchical key-value store.
//!
//! Records live in a JSON tree addressed by slash-separated paths
//! (`posture_sessions/{user}/{id}`). Children of a node can be queried with
//! ordering, equality/range filters and first/last limits, and any path can be
//! watched for changes.
//!
//! Two implementations: [`MemoryStore`] for tests and embedding, and
//! [`JsonFileStore`](crate::file_store::JsonFileStore) for the CLI.

use crate::Result;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;

/// Capacity of each watch channel
const WATCH_BUFFER: usize = 256;

/// Slash-separated location in the tree
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default)]
pub struct StorePath {
    segments: Vec<String>,
}

impl StorePath {
    pub fn root() -> Self {
        Self::default()
    }

    /// Empty segments are ignored, so `"/a//b/"` is `a/b`
    pub fn parse(path: &str) -> Self {
        Self {
            segments: path
                .split('/')
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
        }
    }

    pub fn child(&self, segment: impl AsRef<str>) -> Self {
        self.join(segment.as_ref())
    }

    /// Append a relative path
    pub fn join(&self, relative: &str) -> Self {
        let mut segments = self.segments.clone();
        segments.extend(StorePath::parse(relative).segments);
        Self { segments }
    }

    pub fn parent(&self) -> Option<Self> {
        let (_, parents) = self.segments.split_last()?;
        Some(Self {
            segments: parents.to_vec(),
        })
    }

    /// Last segment
    pub fn key(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// True if `other` is this path or lies below it
    pub fn contains(&self, other: &StorePath) -> bool {
        other.segments.starts_with(&self.segments)
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.segments.join("/"))
    }
}

impl From<&str> for StorePath {
    fn from(path: &str) -> Self {
        StorePath::parse(path)
    }
}

/// Delivered to watchers of a path
#[derive(Clone, Debug, PartialEq)]
pub struct StoreChange {
    /// Path that was written
    pub changed: StorePath,
    /// Value at the watched path after the write
    pub snapshot: Option<Value>,
}

/// Which end of the ordered children a limit keeps
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Limit {
    First(usize),
    Last(usize),
}

/// Child query: order, filter, then limit
///
/// Children are ordered by a field (or by key when no field is given) using
/// the order null < false < true < numbers < strings < objects, ties broken by
/// key. Results are always returned in ascending order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Query {
    pub order_by: Option<String>,
    pub equal_to: Option<Value>,
    pub start_at: Option<Value>,
    pub end_at: Option<Value>,
    pub limit: Option<Limit>,
}

impl Query {
    /// Order by key
    pub fn by_key() -> Self {
        Self::default()
    }

    pub fn order_by_child(field: impl Into<String>) -> Self {
        Self {
            order_by: Some(field.into()),
            ..Self::default()
        }
    }

    pub fn equal_to(mut self, value: impl Into<Value>) -> Self {
        self.equal_to = Some(value.into());
        self
    }

    pub fn start_at(mut self, value: impl Into<Value>) -> Self {
        self.start_at = Some(value.into());
        self
    }

    pub fn end_at(mut self, value: impl Into<Value>) -> Self {
        self.end_at = Some(value.into());
        self
    }

    pub fn limit_to_first(mut self, n: usize) -> Self {
        self.limit = Some(Limit::First(n));
        self
    }

    pub fn limit_to_last(mut self, n: usize) -> Self {
        self.limit = Some(Limit::Last(n));
        self
    }

    fn sort_value(&self, key: &str, value: &Value) -> Value {
        match &self.order_by {
            Some(field) => value.get(field).cloned().unwrap_or(Value::Null),
            None => Value::String(key.to_string()),
        }
    }

    fn accepts(&self, sort_value: &Value) -> bool {
        if let Some(expected) = &self.equal_to {
            if compare_values(sort_value, expected) != Ordering::Equal {
                return false;
            }
        }
        if let Some(start) = &self.start_at {
            if compare_values(sort_value, start) == Ordering::Less {
                return false;
            }
        }
        if let Some(end) = &self.end_at {
            if compare_values(sort_value, end) == Ordering::Greater {
                return false;
            }
        }
        true
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(false) => 1,
        Value::Bool(true) => 2,
        Value::Number(_) => 3,
        Value::String(_) => 4,
        Value::Array(_) | Value::Object(_) => 5,
    }
}

/// Total order used by queries
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/// The tree itself; the root is always an object
#[derive(Clone, Debug, PartialEq)]
pub struct Tree {
    root: Value,
}

impl Default for Tree {
    fn default() -> Self {
        Self {
            root: Value::Object(Map::new()),
        }
    }
}

fn ensure_object(node: &mut Value) -> &mut Map<String, Value> {
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    match node {
        Value::Object(map) => map,
        _ => unreachable!("node was just replaced with an object"),
    }
}

fn remove_at(node: &mut Value, segments: &[String]) -> Option<Value> {
    let map = node.as_object_mut()?;
    match segments {
        [] => None,
        [last] => map.remove(last),
        [first, rest @ ..] => {
            let child = map.get_mut(first)?;
            let removed = remove_at(child, rest);
            // Empty branches disappear with their last child
            if child.as_object().is_some_and(Map::is_empty) {
                map.remove(first);
            }
            removed
        }
    }
}

impl Tree {
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(_) => Self { root: value },
            _ => Self::default(),
        }
    }

    pub fn as_value(&self) -> &Value {
        &self.root
    }

    pub fn get(&self, path: &StorePath) -> Option<&Value> {
        path.segments()
            .iter()
            .try_fold(&self.root, |node, segment| node.as_object()?.get(segment))
    }

    /// Write `value` at `path`, creating parents. `null` removes.
    pub fn set(&mut self, path: &StorePath, value: Value) {
        if value.is_null() {
            self.remove(path);
            return;
        }
        let Some((last, parents)) = path.segments().split_last() else {
            *self = Tree::from_value(value);
            return;
        };

        let mut node = &mut self.root;
        for segment in parents {
            node = ensure_object(node)
                .entry(segment.clone())
                .or_insert(Value::Null);
        }
        ensure_object(node).insert(last.clone(), value);
    }

    /// Write each field relative to `path`
    pub fn update(&mut self, path: &StorePath, fields: Map<String, Value>) {
        for (relative, value) in fields {
            self.set(&path.join(&relative), value);
        }
    }

    pub fn remove(&mut self, path: &StorePath) -> Option<Value> {
        if path.is_root() {
            return Some(std::mem::replace(&mut self.root, Value::Object(Map::new())));
        }
        remove_at(&mut self.root, path.segments())
    }

    pub fn query(&self, parent: &StorePath, query: &Query) -> Vec<(String, Value)> {
        let Some(Value::Object(children)) = self.get(parent) else {
            return Vec::new();
        };

        let mut rows: Vec<(&String, &Value, Value)> = children
            .iter()
            .map(|(key, value)| (key, value, query.sort_value(key, value)))
            .filter(|(_, _, sort_value)| query.accepts(sort_value))
            .collect();
        rows.sort_by(|a, b| compare_values(&a.2, &b.2).then_with(|| a.0.cmp(b.0)));

        match query.limit {
            Some(Limit::First(n)) => rows.truncate(n),
            Some(Limit::Last(n)) => {
                let skip = rows.len().saturating_sub(n);
                rows.drain(..skip);
            }
            None => {}
        }

        rows.into_iter()
            .map(|(key, value, _)| (key.clone(), value.clone()))
            .collect()
    }
}

/// Path subscriptions shared by the store implementations
#[derive(Default)]
pub(crate) struct Watchers {
    subscribers: Mutex<Vec<(StorePath, broadcast::Sender<StoreChange>)>>,
}

impl Watchers {
    pub(crate) fn subscribe(&self, path: &StorePath) -> broadcast::Receiver<StoreChange> {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((_, tx)) = subscribers.iter().find(|(watched, _)| watched == path) {
            return tx.subscribe();
        }
        let (tx, rx) = broadcast::channel(WATCH_BUFFER);
        subscribers.push((path.clone(), tx));
        rx
    }

    /// Notify every watcher whose path overlaps the written one
    pub(crate) fn notify(&self, tree: &Tree, changed: &StorePath) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|(_, tx)| tx.receiver_count() > 0);
        for (watched, tx) in subscribers.iter() {
            if watched.contains(changed) || changed.contains(watched) {
                let _ = tx.send(StoreChange {
                    changed: changed.clone(),
                    snapshot: tree.get(watched).cloned(),
                });
            }
        }
    }
}

/// Storage backend. Every write is all-or-nothing and is visible to watchers
/// only after it succeeded.
pub trait Store: Send + Sync {
    fn get(&self, path: &StorePath) -> Result<Option<Value>>;

    fn set(&self, path: &StorePath, value: Value) -> Result<()>;

    /// Multi-field write under `path` in one operation
    fn update(&self, path: &StorePath, fields: Map<String, Value>) -> Result<()>;

    fn remove(&self, path: &StorePath) -> Result<()>;

    fn query(&self, parent: &StorePath, query: &Query) -> Result<Vec<(String, Value)>>;

    fn watch(&self, path: &StorePath) -> broadcast::Receiver<StoreChange>;
}

pub type SharedStore = Arc<dyn Store>;

/// In-memory store
#[derive(Default)]
pub struct MemoryStore {
    tree: Mutex<Tree>,
    watchers: Watchers,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedStore {
        Arc::new(Self::new())
    }

    /// Snapshot of the whole tree
    pub fn dump(&self) -> Value {
        self.tree
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_value()
            .clone()
    }

    fn write(&self, changed: &StorePath, mutate: impl FnOnce(&mut Tree)) -> Result<()> {
        let mut tree = self.tree.lock().unwrap_or_else(PoisonError::into_inner);
        mutate(&mut tree);
        self.watchers.notify(&tree, changed);
        Ok(())
    }
}

impl Store for MemoryStore {
    fn get(&self, path: &StorePath) -> Result<Option<Value>> {
        let tree = self.tree.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(tree.get(path).cloned())
    }

    fn set(&self, path: &StorePath, value: Value) -> Result<()> {
        self.write(path, |tree| tree.set(path, value))
    }

    fn update(&self, path: &StorePath, fields: Map<String, Value>) -> Result<()> {
        self.write(path, |tree| tree.update(path, fields))
    }

    fn remove(&self, path: &StorePath) -> Result<()> {
        self.write(path, |tree| {
            tree.remove(path);
        })
    }

    fn query(&self, parent: &StorePath, query: &Query) -> Result<Vec<(String, Value)>> {
        let tree = self.tree.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(tree.query(parent, query))
    }

    fn watch(&self, path: &StorePath) -> broadcast::Receiver<StoreChange> {
        self.watchers.subscribe(path)
    }
}
