//! Record persistence for nonce caches and tracked transactions, keyed by account.

use crate::errors::EngineError;
use alloy::primitives::Address;
use fs2::FileExt;
use serde::{de::DeserializeOwned, Serialize};
use std::{
    collections::HashMap,
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
    sync::Mutex,
};

/// Callback for [`PersistentStore::update`]: current bytes in, replacement out.
/// `None` out leaves the record as it was.
pub type UpdateFn<'a> =
    dyn FnMut(Option<&[u8]>) -> Result<Option<Vec<u8>>, EngineError> + 'a;

/// Synchronous byte records under `(namespace, account)`.
///
/// Records are small and written whole; implementations must make a write either fully
/// visible or not at all.
pub trait PersistentStore: Send + Sync + std::fmt::Debug {
    fn load(&self, namespace: &str, account: Address) -> Result<Option<Vec<u8>>, EngineError>;
    fn save(&self, namespace: &str, account: Address, bytes: &[u8]) -> Result<(), EngineError>;
    fn accounts(&self, namespace: &str) -> Result<Vec<Address>, EngineError>;

    /// Read-modify-write one record while holding off every other writer, including
    /// writers in other processes. `f` must not call back into the store.
    fn update(
        &self,
        namespace: &str,
        account: Address,
        f: &mut UpdateFn<'_>,
    ) -> Result<(), EngineError>;
}

pub fn load_json<T: DeserializeOwned>(
    store: &dyn PersistentStore,
    namespace: &str,
    account: Address,
) -> Result<Option<T>, EngineError> {
    store
        .load(namespace, account)?
        .map(|b| {
            serde_json::from_slice(&b)
                .map_err(|e| EngineError::Store(format!("decode {namespace}/{account:#x}: {e}")))
        })
        .transpose()
}

pub fn save_json<T: Serialize>(
    store: &dyn PersistentStore,
    namespace: &str,
    account: Address,
    value: &T,
) -> Result<(), EngineError> {
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| EngineError::Store(format!("encode {namespace}/{account:#x}: {e}")))?;
    store.save(namespace, account, &bytes)
}

/// Decode the current record (or `T::default()`), apply `f`, and write the result back
/// under the store's write lock. Nothing is written when `f` fails or leaves the record
/// unchanged.
pub fn update_json<T, R>(
    store: &dyn PersistentStore,
    namespace: &str,
    account: Address,
    f: impl FnOnce(&mut T) -> Result<R, EngineError>,
) -> Result<R, EngineError>
where
    T: Serialize + DeserializeOwned + Default,
{
    let mut f = Some(f);
    let mut out = None;
    store.update(namespace, account, &mut |current| {
        let apply = f
            .take()
            .ok_or_else(|| EngineError::Store("update callback ran twice".into()))?;
        let mut value: T = match current {
            Some(b) => serde_json::from_slice(b).map_err(|e| {
                EngineError::Store(format!("decode {namespace}/{account:#x}: {e}"))
            })?,
            None => T::default(),
        };
        out = Some(apply(&mut value)?);
        let bytes = serde_json::to_vec_pretty(&value)
            .map_err(|e| EngineError::Store(format!("encode {namespace}/{account:#x}: {e}")))?;
        Ok((current != Some(bytes.as_slice())).then_some(bytes))
    })?;
    out.ok_or_else(|| EngineError::Store(format!("update of {namespace}/{account:#x} never ran")))
}

fn store_err(e: impl std::fmt::Display) -> EngineError {
    EngineError::Store(e.to_string())
}

/// One JSON file per record at `<root>/<namespace>/<0xaccount>.json`.
///
/// Writers from other processes are serialized with an advisory lock on `<root>/.lock`.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let root = root.into();
        crate::fsutil::ensure_private_dir(&root).map_err(store_err)?;
        Ok(Self { root })
    }

    fn record_path(&self, namespace: &str, account: Address) -> Result<PathBuf, EngineError> {
        if namespace.is_empty()
            || !namespace
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
        {
            return Err(EngineError::InvalidInput(format!(
                "invalid store namespace: {namespace:?}"
            )));
        }
        Ok(self.root.join(namespace).join(format!("{account:#x}.json")))
    }

    fn lock(&self, exclusive: bool) -> Result<LockedFile, EngineError> {
        let p = self.root.join(".lock");
        let f = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&p)
            .map_err(|e| store_err(format!("open {}: {e}", p.display())))?;
        let locked = if exclusive {
            FileExt::lock_exclusive(&f)
        } else {
            FileExt::lock_shared(&f)
        };
        locked.map_err(|e| store_err(format!("lock {}: {e}", p.display())))?;
        Ok(LockedFile(f))
    }
}

struct LockedFile(File);

impl Drop for LockedFile {
    fn drop(&mut self) {
        drop(FileExt::unlock(&self.0));
    }
}

fn parse_record_name(p: &Path) -> Option<Address> {
    let name = p.file_name()?.to_str()?.strip_suffix(".json")?;
    crate::rpc::quantity::parse_address(name).ok()
}

impl PersistentStore for FileStore {
    fn load(&self, namespace: &str, account: Address) -> Result<Option<Vec<u8>>, EngineError> {
        let p = self.record_path(namespace, account)?;
        let _lock = self.lock(false)?;
        crate::fsutil::read_optional(&p).map_err(store_err)
    }

    fn save(&self, namespace: &str, account: Address, bytes: &[u8]) -> Result<(), EngineError> {
        let p = self.record_path(namespace, account)?;
        let _lock = self.lock(true)?;
        crate::fsutil::write_atomic_private(&p, bytes).map_err(store_err)
    }

    fn update(
        &self,
        namespace: &str,
        account: Address,
        f: &mut UpdateFn<'_>,
    ) -> Result<(), EngineError> {
        let p = self.record_path(namespace, account)?;
        let _lock = self.lock(true)?;
        let current = crate::fsutil::read_optional(&p).map_err(store_err)?;
        if let Some(next) = f(current.as_deref())? {
            crate::fsutil::write_atomic_private(&p, &next).map_err(store_err)?;
        }
        Ok(())
    }

    fn accounts(&self, namespace: &str) -> Result<Vec<Address>, EngineError> {
        let dir = self
            .record_path(namespace, Address::ZERO)?
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| store_err("namespace has no directory"))?;
        let entries = match std::fs::read_dir(&dir) {
            Ok(it) => it,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(store_err(format!("list {}: {e}", dir.display()))),
        };
        let mut out: Vec<Address> = entries
            .filter_map(Result::ok)
            .filter_map(|e| parse_record_name(&e.path()))
            .collect();
        out.sort();
        Ok(out)
    }
}

/// In-process store for tests and throwaway sessions.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<(String, Address), Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PersistentStore for MemoryStore {
    fn load(&self, namespace: &str, account: Address) -> Result<Option<Vec<u8>>, EngineError> {
        let g = self.records.lock().map_err(|e| store_err(format!("poisoned: {e}")))?;
        Ok(g.get(&(namespace.to_owned(), account)).cloned())
    }

    fn save(&self, namespace: &str, account: Address, bytes: &[u8]) -> Result<(), EngineError> {
        let mut g = self.records.lock().map_err(|e| store_err(format!("poisoned: {e}")))?;
        g.insert((namespace.to_owned(), account), bytes.to_vec());
        Ok(())
    }

    fn accounts(&self, namespace: &str) -> Result<Vec<Address>, EngineError> {
        let g = self.records.lock().map_err(|e| store_err(format!("poisoned: {e}")))?;
        let mut out: Vec<Address> = g
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, a)| *a)
            .collect();
        out.sort();
        Ok(out)
    }

    fn update(
        &self,
        namespace: &str,
        account: Address,
        f: &mut UpdateFn<'_>,
    ) -> Result<(), EngineError> {
        let mut g = self.records.lock().map_err(|e| store_err(format!("poisoned: {e}")))?;
        let key = (namespace.to_owned(), account);
        if let Some(next) = f(g.get(&key).map(Vec::as_slice))? {
            g.insert(key, next);
        }
        Ok(())
    }
}
