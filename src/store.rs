// Local persisted state: where it lives, and the student identity store.

use crate::error::StoreError;
use directories::ProjectDirs;
use serde::{de::DeserializeOwned, Serialize};
use std::fs::{create_dir_all, File};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

pub struct AppData {
    data_dir: PathBuf,
}

impl AppData {
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

lazy_static! {
    pub static ref APP_DATA: AppData = {
        // Some sandboxes have no home directory, in which case we just keep
        // everything next to wherever we were started.
        let data_dir = ProjectDirs::from("org", "codingforcommunity", "ChargerAuth")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".chargerauth"));

        AppData { data_dir }
    };
}

pub fn read_bincode<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    bincode::deserialize_from(file)
        .map(Some)
        .map_err(|source| StoreError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
}

pub fn write_bincode<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        create_dir_all(parent).map_err(io_err)?;
    }
    let file = File::create(path).map_err(io_err)?;
    bincode::serialize_into(file, value).map_err(|source| StoreError::Corrupt {
        path: path.to_path_buf(),
        source,
    })
}

// Who is checking in from this device (an email or a student id).
// There is exactly one writer, the login/logout commands.
pub trait IdentityStore {
    fn get(&self) -> Result<Option<String>, StoreError>;
    fn set(&mut self, identity: &str) -> Result<(), StoreError>;
    fn clear(&mut self) -> Result<(), StoreError>;
}

#[derive(Default)]
pub struct MemoryIdentityStore {
    identity: Option<String>,
}

impl MemoryIdentityStore {
    pub fn with_identity(identity: &str) -> Self {
        MemoryIdentityStore {
            identity: Some(identity.to_owned()),
        }
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn get(&self) -> Result<Option<String>, StoreError> {
        Ok(self.identity.clone())
    }

    fn set(&mut self, identity: &str) -> Result<(), StoreError> {
        self.identity = Some(identity.to_owned());
        Ok(())
    }

    fn clear(&mut self) -> Result<(), StoreError> {
        self.identity = None;
        Ok(())
    }
}

pub struct FileIdentityStore {
    path: PathBuf,
}

impl FileIdentityStore {
    pub fn new(path: PathBuf) -> Self {
        FileIdentityStore { path }
    }

    pub fn in_app_data() -> Self {
        Self::new(APP_DATA.data_dir().join("identity"))
    }
}

impl IdentityStore for FileIdentityStore {
    fn get(&self) -> Result<Option<String>, StoreError> {
        read_bincode(&self.path)
    }

    fn set(&mut self, identity: &str) -> Result<(), StoreError> {
        write_bincode(&self.path, &identity.to_owned())
    }

    fn clear(&mut self) -> Result<(), StoreError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }
}
