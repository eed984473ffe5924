use std::{
    collections::HashMap,
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::Context;
use parking_lot::Mutex;

/// Device-local key/value storage, for state that must survive restarts
/// without ever reaching the backend
pub trait LocalStorage: Send + Sync {
    fn get_raw(&self, key: &str) -> anyhow::Result<Option<String>>;
    fn set_raw(&self, key: &str, value: &str) -> anyhow::Result<()>;
    fn delete(&self, key: &str) -> anyhow::Result<()>;
}

pub fn load_json<T>(storage: &dyn LocalStorage, key: &str) -> anyhow::Result<Option<T>>
where
    T: for<'de> serde::Deserialize<'de>,
{
    match storage.get_raw(key)? {
        None => Ok(None),
        Some(raw) => Ok(Some(
            serde_json::from_str(&raw).with_context(|| format!("parsing stored value {key:?}"))?,
        )),
    }
}

pub fn store_json<T: serde::Serialize>(
    storage: &dyn LocalStorage,
    key: &str,
    value: &T,
) -> anyhow::Result<()> {
    let raw = serde_json::to_string(value).context("serializing value to store")?;
    storage.set_raw(key, &raw)
}

#[derive(Debug, Default)]
pub struct MemoryStorage(Mutex<HashMap<String, String>>);

impl MemoryStorage {
    pub fn new() -> MemoryStorage {
        MemoryStorage(Mutex::new(HashMap::new()))
    }
}

impl LocalStorage for MemoryStorage {
    fn get_raw(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.0.lock().get(key).cloned())
    }

    fn set_raw(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.0.lock().insert(String::from(key), String::from(value));
        Ok(())
    }

    fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.0.lock().remove(key);
        Ok(())
    }
}

/// One file per key in a directory
///
/// Writes go through a temporary file that is then renamed over the
/// destination, so a crash never leaves a half-written value behind.
#[derive(Debug)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn open(dir: impl Into<PathBuf>) -> anyhow::Result<FileStorage> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating storage directory {dir:?}"))?;
        Ok(FileStorage { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let name = key
            .chars()
            .map(|c| match c {
                'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
                _ => '_',
            })
            .collect::<String>();
        self.dir.join(format!("{name}.json"))
    }
}

impl LocalStorage for FileStorage {
    fn get_raw(&self, key: &str) -> anyhow::Result<Option<String>> {
        let path = self.path_for(key);
        match std::fs::read_to_string(&path) {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading {path:?}")),
        }
    }

    fn set_raw(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let path = self.path_for(key);
        let mut file = tempfile::NamedTempFile::new_in(&self.dir)
            .with_context(|| format!("creating temporary file in {:?}", self.dir))?;
        file.write_all(value.as_bytes())
            .context("writing temporary file")?;
        file.persist(&path)
            .with_context(|| format!("renaming temporary file to {path:?}"))?;
        Ok(())
    }

    fn delete(&self, key: &str) -> anyhow::Result<()> {
        let path = self.path_for(key);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing {path:?}")),
        }
    }
}
