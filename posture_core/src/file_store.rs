//! JSON-file-backed store with file locking.
//!
//! The whole tree lives in one JSON document. Every write runs under an
//! exclusive lock on a sibling `.lock` file, re-reads the document so writes
//! from other processes are not lost, applies the change and atomically
//! replaces the file. The in-memory copy and watchers only see the change
//! once the file is safely on disk.

use crate::store::{Query, Store, StoreChange, StorePath, Tree, Watchers};
use crate::{Error, Result};
use fs2::FileExt;
use serde_json::{Map, Value};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tempfile::NamedTempFile;
use tokio::sync::broadcast;

pub struct JsonFileStore {
    path: PathBuf,
    tree: Mutex<Tree>,
    watchers: Watchers,
}

impl JsonFileStore {
    /// Open (or lazily create) the store at `path`
    ///
    /// A document that cannot be parsed is moved aside to `<name>.corrupt`
    /// and the store starts empty.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let tree = match read_tree(&path) {
            Ok(Some(tree)) => {
                tracing::debug!("Loaded store from {:?}", path);
                tree
            }
            Ok(None) => {
                tracing::info!("No store file at {:?}, starting empty", path);
                Tree::default()
            }
            Err(Error::Json(e)) => {
                let aside = corrupt_path(&path);
                tracing::warn!(
                    "Store file {:?} is corrupted ({}), moving it to {:?} and starting empty",
                    path,
                    e,
                    aside
                );
                std::fs::rename(&path, &aside)?;
                Tree::default()
            }
            Err(e) => return Err(e),
        };

        Ok(Self {
            path,
            tree: Mutex::new(tree),
            watchers: Watchers::default(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&self, changed: &StorePath, mutate: impl FnOnce(&mut Tree)) -> Result<()> {
        let mut cached = self.tree.lock().unwrap_or_else(PoisonError::into_inner);
        let next = self
            .locked_write(&cached, mutate)
            .map_err(|e| Error::Persistence(format!("writing {} to {:?}: {}", changed, self.path, e)))?;
        *cached = next;
        self.watchers.notify(&cached, changed);
        Ok(())
    }

    fn locked_write(&self, cached: &Tree, mutate: impl FnOnce(&mut Tree)) -> Result<Tree> {
        let parent = parent_dir(&self.path);
        std::fs::create_dir_all(parent)?;

        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(lock_path(&self.path))?;
        lock.lock_exclusive()?;

        let result = (|| -> Result<Tree> {
            let mut tree = read_tree(&self.path)?.unwrap_or_else(|| cached.clone());
            mutate(&mut tree);
            persist(&self.path, &tree)?;
            Ok(tree)
        })();

        lock.unlock()?;
        result
    }
}

fn parent_dir(path: &Path) -> &Path {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".lock");
    path.with_file_name(name)
}

fn corrupt_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".corrupt");
    path.with_file_name(name)
}

/// Read the document under a shared lock. `None` when it does not exist.
fn read_tree(path: &Path) -> Result<Option<Tree>> {
    if !path.exists() {
        return Ok(None);
    }
    let file = File::open(path)?;

    file.lock_shared()?;
    let mut contents = String::new();
    let read = BufReader::new(&file).read_to_string(&mut contents);
    file.unlock()?;
    read?;

    if contents.trim().is_empty() {
        return Ok(Some(Tree::default()));
    }
    let value: Value = serde_json::from_str(&contents)?;
    Ok(Some(Tree::from_value(value)))
}

/// Atomically replace the document: temp file, sync, rename
fn persist(path: &Path, tree: &Tree) -> Result<()> {
    let temp = NamedTempFile::new_in(parent_dir(path))?;
    {
        let mut writer = BufWriter::new(temp.as_file());
        serde_json::to_writer(&mut writer, tree.as_value())?;
        writer.flush()?;
    }
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| Error::Io(e.error))?;
    tracing::debug!("Saved store to {:?}", path);
    Ok(())
}

impl Store for JsonFileStore {
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
