//! Atomic file-backed key/value store.
//!
//! Every piece of looper state (session records, the shared rate-limit and
//! slot tables, the cost ledger) goes through [`Store`]. Updates run the
//! mutation while holding a per-key [`FileLock`] and persist the result
//! (temp file + rename) before the lock is released, so concurrent updates
//! from independent processes are linearized and never lost.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument};

use crate::error::InvalidKey;
use crate::io::lock::{FileLock, LockOptions, lock_path_for};

/// Keyed state storage with exclusive read-modify-write.
///
/// Keys are `/`-separated segments of `[A-Za-z0-9._-]`.
pub trait Store {
    /// Instantaneous read; missing keys yield `T::default()`.
    fn read<T>(&self, key: &str) -> Result<T>
    where
        T: DeserializeOwned + Default;

    /// Apply `mutate` under the key's exclusive lock and persist the result
    /// before releasing it. If `mutate` fails nothing is written.
    fn update<T, F>(&self, key: &str, mutate: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Default,
        F: FnOnce(&mut T) -> Result<()>;

    /// Replace the key's value under its lock without reading it first.
    fn write<T>(&self, key: &str, value: &T) -> Result<()>
    where
        T: Serialize;

    /// Append one record to the key's log under its lock.
    fn append<T>(&self, key: &str, record: &T) -> Result<()>
    where
        T: Serialize;

    /// Read every record of the key's log; missing logs are empty.
    fn read_log<T>(&self, key: &str) -> Result<Vec<T>>
    where
        T: DeserializeOwned;

    /// Remove a value (and its log) if present.
    fn remove(&self, key: &str) -> Result<()>;
}

/// [`Store`] backed by JSON files under a root directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
    lock_options: LockOptions,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>, lock_options: LockOptions) -> Self {
        Self {
            root: root.into(),
            lock_options,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the JSON value for `key`.
    pub fn value_path(&self, key: &str) -> Result<PathBuf> {
        Ok(self.key_base(key)?.with_extension("json"))
    }

    /// Path of the JSON-lines log for `key`.
    pub fn log_path(&self, key: &str) -> Result<PathBuf> {
        Ok(self.key_base(key)?.with_extension("jsonl"))
    }

    fn key_base(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    fn lock_for(&self, file: &Path) -> Result<FileLock> {
        FileLock::acquire(&lock_path_for(file), &self.lock_options)
    }
}

impl Store for FileStore {
    fn read<T>(&self, key: &str) -> Result<T>
    where
        T: DeserializeOwned + Default,
    {
        let path = self.value_path(key)?;
        read_value(&path)
    }

    #[instrument(skip_all, fields(key))]
    fn update<T, F>(&self, key: &str, mutate: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Default,
        F: FnOnce(&mut T) -> Result<()>,
    {
        let path = self.value_path(key)?;
        let lock = self.lock_for(&path)?;
        let mut value: T = read_value(&path)?;
        mutate(&mut value)?;
        write_atomic(&path, &value)?;
        lock.release()?;
        debug!(key, "store updated");
        Ok(value)
    }

    fn write<T>(&self, key: &str, value: &T) -> Result<()>
    where
        T: Serialize,
    {
        let path = self.value_path(key)?;
        let lock = self.lock_for(&path)?;
        write_atomic(&path, value)?;
        lock.release()
    }

    fn append<T>(&self, key: &str, record: &T) -> Result<()>
    where
        T: Serialize,
    {
        let path = self.log_path(key)?;
        let lock = self.lock_for(&path)?;
        let mut line = serde_json::to_string(record).context("serialize log record")?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open log {}", path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append log {}", path.display()))?;
        lock.release()
    }

    fn read_log<T>(&self, key: &str) -> Result<Vec<T>>
    where
        T: DeserializeOwned,
    {
        let path = self.log_path(key)?;
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err).with_context(|| format!("read log {}", path.display())),
        };
        contents
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(idx, line)| {
                serde_json::from_str(line)
                    .with_context(|| format!("parse {} line {}", path.display(), idx + 1))
            })
            .collect()
    }

    fn remove(&self, key: &str) -> Result<()> {
        for path in [self.value_path(key)?, self.log_path(key)?] {
            let lock = self.lock_for(&path)?;
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err).with_context(|| format!("remove {}", path.display()));
                }
            }
            lock.release()?;
        }
        Ok(())
    }
}

fn validate_key(key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && key.split('/').all(|segment| {
            !segment.is_empty()
                && segment != "."
                && segment != ".."
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        });
    if valid {
        Ok(())
    } else {
        Err(InvalidKey(key.to_string()).into())
    }
}

fn read_value<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    match fs::read_to_string(path) {
        Ok(contents) => {
            serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(T::default()),
        Err(err) => Err(err).with_context(|| format!("read {}", path.display())),
    }
}

/// Atomically write pretty JSON to disk (temp file + rename).
pub fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("store path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut buf = serde_json::to_string_pretty(value).context("serialize json")?;
    buf.push('\n');
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, buf).with_context(|| format!("write temp {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use serde::Deserialize;

    #[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
    struct Counter {
        value: u32,
    }

    fn store(root: &Path) -> FileStore {
        FileStore::new(root, LockOptions::default())
    }

    #[test]
    fn missing_key_reads_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let counter: Counter = store(temp.path()).read("nothing/here").expect("read");
        assert_eq!(counter, Counter::default());
    }

    #[test]
    fn update_persists_and_returns_new_state() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        let next: Counter = store
            .update("counter", |c: &mut Counter| {
                c.value += 2;
                Ok(())
            })
            .expect("update");
        assert_eq!(next.value, 2);
        let read: Counter = store.read("counter").expect("read");
        assert_eq!(read.value, 2);
        assert!(!temp.path().join("counter.json.lock").exists());
    }

    #[test]
    fn failed_mutation_writes_nothing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        store
            .update("counter", |c: &mut Counter| {
                c.value = 1;
                Ok(())
            })
            .expect("seed");

        let err = store
            .update("counter", |c: &mut Counter| {
                c.value = 99;
                Err(anyhow!("refused"))
            })
            .unwrap_err();
        assert!(err.to_string().contains("refused"));
        let read: Counter = store.read("counter").expect("read");
        assert_eq!(read.value, 1);
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().to_path_buf();
        let threads = 8;
        let per_thread = 25;

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let store = store(&root);
                std::thread::spawn(move || {
                    for _ in 0..per_thread {
                        store
                            .update("counter", |c: &mut Counter| {
                                c.value += 1;
                                Ok(())
                            })
                            .expect("update");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }

        let counter: Counter = store(&root).read("counter").expect("read");
        assert_eq!(counter.value, threads * per_thread);
    }

    #[test]
    fn append_and_read_log_preserve_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        for value in 1..=3 {
            store.append("log", &Counter { value }).expect("append");
        }
        let records: Vec<Counter> = store.read_log("log").expect("read log");
        let values: Vec<u32> = records.iter().map(|c| c.value).collect();
        assert_eq!(values, vec![1, 2, 3]);
    }

    #[test]
    fn rejects_traversal_keys() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        for key in ["", "../x", "a//b", "a/./b", "a b"] {
            let err = store.read::<Counter>(key).unwrap_err();
            assert!(err.downcast_ref::<InvalidKey>().is_some(), "key {key:?}");
        }
    }

    #[test]
    fn remove_deletes_value_and_log() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        store
            .update("k", |c: &mut Counter| {
                c.value = 1;
                Ok(())
            })
            .expect("update");
        store.append("k", &Counter { value: 1 }).expect("append");
        store.remove("k").expect("remove");
        assert!(!temp.path().join("k.json").exists());
        assert!(!temp.path().join("k.jsonl").exists());
    }
}
