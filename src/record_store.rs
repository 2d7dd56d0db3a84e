//! JSON file record storage
//!
//! One file per record kind (`<directory>/<kind>.json`) holding a JSON array.
//! A missing file reads as an empty store. Every mutation rewrites the file
//! through a temporary sibling and a rename, under the store's lock.

use std::fs;
use std::io::ErrorKind;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::error::{HealthPkiError, Result};

/// A persisted entity addressed by a string id.
pub trait Record: Serialize + DeserializeOwned + Clone {
    /// File stem of the store holding this kind.
    const KIND: &'static str;

    fn id(&self) -> &str;
}

pub struct JsonFileStore<R> {
    path: PathBuf,
    lock: Mutex<()>,
    _record: PhantomData<fn() -> R>,
}

impl<R: Record> JsonFileStore<R> {
    pub fn open(directory: &Path) -> Result<Self> {
        fs::create_dir_all(directory)?;
        Ok(Self {
            path: directory.join(format!("{}.json", R::KIND)),
            lock: Mutex::new(()),
            _record: PhantomData,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read(&self) -> Result<Vec<R>> {
        match fs::read(&self.path) {
            Ok(bytes) if bytes.is_empty() => Ok(Vec::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, records: &[R]) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(records)?)?;
        fs::rename(&tmp, &self.path)?;
        debug!(kind = R::KIND, count = records.len(), "records written");
        Ok(())
    }

    pub fn all(&self) -> Result<Vec<R>> {
        let _guard = self.guard();
        self.read()
    }

    pub fn find_by_id(&self, id: &str) -> Result<Option<R>> {
        Ok(self.all()?.into_iter().find(|r| r.id() == id))
    }

    pub fn find_all(&self, predicate: impl Fn(&R) -> bool) -> Result<Vec<R>> {
        Ok(self.all()?.into_iter().filter(|r| predicate(r)).collect())
    }

    /// # Errors
    /// `AlreadyRegistered` if a record with the same id exists.
    pub fn insert(&self, record: R) -> Result<()> {
        self.transact(|records| {
            if records.iter().any(|r| r.id() == record.id()) {
                return Err(HealthPkiError::AlreadyRegistered(record.id().to_string()));
            }
            records.push(record);
            Ok(())
        })
    }

    /// Replace the record stored under `id`.
    ///
    /// # Errors
    /// `InvalidRequest` if `record` carries a different id; `NotFound` if
    /// nothing is stored under `id`.
    pub fn update(&self, id: &str, record: R) -> Result<()> {
        if record.id() != id {
            return Err(HealthPkiError::InvalidRequest(format!(
                "{} record {} cannot replace {}",
                R::KIND,
                record.id(),
                id
            )));
        }
        self.modify(id, |stored| *stored = record).map(|_| ())
    }

    /// Read, change and write back one record under a single lock.
    pub fn modify(&self, id: &str, change: impl FnOnce(&mut R)) -> Result<R> {
        self.transact(|records| {
            let stored = records
                .iter_mut()
                .find(|r| r.id() == id)
                .ok_or_else(|| HealthPkiError::NotFound(format!("{} {}", R::KIND, id)))?;
            change(stored);
            Ok(stored.clone())
        })
    }

    /// Drop the record stored under `id`, returning it if there was one.
    pub fn remove(&self, id: &str) -> Result<Option<R>> {
        self.transact(|records| {
            Ok(records
                .iter()
                .position(|r| r.id() == id)
                .map(|index| records.remove(index)))
        })
    }

    /// Run `change` over all records under the store's lock.
    ///
    /// The file is rewritten only if `change` succeeds, so a check made inside
    /// it holds for the write that follows.
    pub fn transact<T>(&self, change: impl FnOnce(&mut Vec<R>) -> Result<T>) -> Result<T> {
        let _guard = self.guard();
        let mut records = self.read()?;
        let outcome = change(&mut records)?;
        self.write(&records)?;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        id: String,
        body: String,
    }

    impl Record for Note {
        const KIND: &'static str = "notes";

        fn id(&self) -> &str {
            &self.id
        }
    }

    fn note(id: &str, body: &str) -> Note {
        Note {
            id: id.to_string(),
            body: body.to_string(),
        }
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let store: JsonFileStore<Note> = JsonFileStore::open(dir.path()).unwrap();
        assert!(store.all().unwrap().is_empty());
        assert!(store.find_by_id("a").unwrap().is_none());
        assert!(!store.path().exists());
    }

    #[test]
    fn test_insert_find_update() {
        let dir = TempDir::new().unwrap();
        let store: JsonFileStore<Note> = JsonFileStore::open(dir.path()).unwrap();
        store.insert(note("a", "first")).unwrap();
        store.insert(note("b", "second")).unwrap();

        assert_eq!(store.find_by_id("b").unwrap(), Some(note("b", "second")));
        store.update("a", note("a", "edited")).unwrap();
        assert_eq!(store.find_by_id("a").unwrap().unwrap().body, "edited");
        assert_eq!(
            store.find_all(|n| n.body.starts_with('s')).unwrap(),
            vec![note("b", "second")]
        );

        let reopened: JsonFileStore<Note> = JsonFileStore::open(dir.path()).unwrap();
        assert_eq!(reopened.all().unwrap().len(), 2);
    }

    #[test]
    fn test_duplicate_and_missing() {
        let dir = TempDir::new().unwrap();
        let store: JsonFileStore<Note> = JsonFileStore::open(dir.path()).unwrap();
        store.insert(note("a", "first")).unwrap();
        assert!(matches!(
            store.insert(note("a", "again")),
            Err(HealthPkiError::AlreadyRegistered(_))
        ));
        assert!(matches!(
            store.update("zz", note("zz", "x")),
            Err(HealthPkiError::NotFound(_))
        ));
    }

    #[test]
    fn test_update_keeps_ids_unique() {
        let dir = TempDir::new().unwrap();
        let store: JsonFileStore<Note> = JsonFileStore::open(dir.path()).unwrap();
        store.insert(note("a", "first")).unwrap();
        store.insert(note("b", "second")).unwrap();
        assert!(matches!(
            store.update("a", note("b", "hijack")),
            Err(HealthPkiError::InvalidRequest(_))
        ));
        assert_eq!(store.find_all(|n| n.id == "b").unwrap().len(), 1);
        assert_eq!(store.find_by_id("a").unwrap(), Some(note("a", "first")));
    }

    #[test]
    fn test_remove() {
        let dir = TempDir::new().unwrap();
        let store: JsonFileStore<Note> = JsonFileStore::open(dir.path()).unwrap();
        store.insert(note("a", "first")).unwrap();
        assert_eq!(store.remove("a").unwrap(), Some(note("a", "first")));
        assert_eq!(store.remove("a").unwrap(), None);
        assert!(store.all().unwrap().is_empty());
    }

    #[test]
    fn test_failed_transaction_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let store: JsonFileStore<Note> = JsonFileStore::open(dir.path()).unwrap();
        store.insert(note("a", "first")).unwrap();
        let result: Result<()> = store.transact(|records| {
            records.clear();
            Err(HealthPkiError::InvalidRequest("abort".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(store.all().unwrap(), vec![note("a", "first")]);
    }

    #[test]
    fn test_modify_returns_updated() {
        let dir = TempDir::new().unwrap();
        let store: JsonFileStore<Note> = JsonFileStore::open(dir.path()).unwrap();
        store.insert(note("a", "first")).unwrap();
        let updated = store.modify("a", |n| n.body.push('!')).unwrap();
        assert_eq!(updated.body, "first!");
        assert_eq!(store.find_by_id("a").unwrap().unwrap().body, "first!");
    }
}
