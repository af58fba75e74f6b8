use std::{
    collections::HashMap,
    fs::{create_dir_all, read_to_string, rename, OpenOptions},
    io::Write,
    path::PathBuf,
    sync::{Arc, PoisonError, RwLock},
};

use log::{debug, warn};

use crate::error::Result;

pub const ACCESS_TOKEN_KEY: &str = "accessToken";
pub const USER_TYPE_KEY: &str = "userType";

/// Key-value persistence for session credentials.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.remove(key);
        Ok(())
    }
}

/// JSON map persisted to `<app_data_dir>/credentials.json`, rewritten on every change.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: RwLock<HashMap<String, String>>,
}

impl FileStore {
    pub fn open(app_data_dir: PathBuf) -> Result<Self> {
        create_dir_all(&app_data_dir)?;
        let path = app_data_dir.join("credentials.json");
        let entries = Self::read_entries(&path);
        debug!("Opened credential store at {:?} with {} keys", path, entries.len());
        Ok(FileStore {
            path,
            entries: RwLock::new(entries),
        })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn read_entries(path: &PathBuf) -> HashMap<String, String> {
        let Ok(content) = read_to_string(path) else {
            return HashMap::new();
        };
        match serde_json::from_str::<HashMap<String, String>>(&content) {
            Ok(entries) => entries,
            Err(err) => {
                warn!("Discarding unreadable credential file {:?}: {}", path, err);
                HashMap::new()
            }
        }
    }

    /// Writes a sibling temp file readable only by the owner, then renames it over
    /// the store so readers never see a partial file.
    fn write_entries(&self, entries: &HashMap<String, String>) -> Result<()> {
        let serialized = serde_json::to_string(entries)?;
        let staging = self.path.with_extension("json.tmp");

        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&staging)?;
        file.write_all(serialized.as_bytes())?;
        file.sync_all()?;
        drop(file);

        rename(&staging, &self.path)?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_string(), value.to_string());
        self.write_entries(&entries)
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.remove(key).is_none() {
            return Ok(());
        }
        self.write_entries(&entries)
    }
}

/// Typed view over a [`KeyValueStore`] holding the access token and the user type tag.
#[derive(Clone)]
pub struct CredentialStore {
    inner: Arc<dyn KeyValueStore>,
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore")
            .field("authenticated", &self.is_authenticated())
            .finish()
    }
}

impl CredentialStore {
    pub fn new(inner: Arc<dyn KeyValueStore>) -> Self {
        CredentialStore { inner }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    pub fn access_token(&self) -> Option<String> {
        self.inner
            .get(ACCESS_TOKEN_KEY)
            .filter(|token| !token.is_empty())
    }

    pub fn set_access_token(&self, token: &str) -> Result<()> {
        self.inner.set(ACCESS_TOKEN_KEY, token)
    }

    pub fn user_type(&self) -> Option<String> {
        self.inner.get(USER_TYPE_KEY).filter(|tag| !tag.is_empty())
    }

    pub fn store_session(&self, access_token: &str, user_type: &str) -> Result<()> {
        self.inner.set(ACCESS_TOKEN_KEY, access_token)?;
        self.inner.set(USER_TYPE_KEY, user_type)
    }

    /// Both keys must be present.
    pub fn is_authenticated(&self) -> bool {
        self.access_token().is_some() && self.user_type().is_some()
    }

    /// Removes both keys. Attempts both removals even if the first fails.
    pub fn clear(&self) -> Result<()> {
        let token = self.inner.remove(ACCESS_TOKEN_KEY);
        let user_type = self.inner.remove(USER_TYPE_KEY);
        token.and(user_type)
    }
}
