// Device identity: a stable fingerprint for this device + user account.
//
// The server uses it to stop one phone from checking in a whole friend group, so
// it has to come out the same every time. If we can't work it out we say so;
// making up a random one would quietly defeat the whole point.

use crate::error::IdentityError;
use crate::store::{read_bincode, write_bincode, APP_DATA};
use argon2::{Argon2, PasswordHasher};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::fmt;
use std::path::PathBuf;

// Only used to stretch the profile into a fixed-size id, not for secrecy.
static CONSTANT_SALT: &'static str = "Q2hhcmdlckF1dGhEZXZpY2U";

// The server stores device ids in a 32 character column.
const FINGERPRINT_BYTES: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceFingerprint(String);

impl DeviceFingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceProfile {
    pub machine_id: String,
    pub os: String,
    pub arch: String,
    pub user: Option<String>,
}

impl DeviceProfile {
    fn canonical(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.machine_id,
            self.os,
            self.arch,
            self.user.as_deref().unwrap_or("")
        )
    }
}

pub trait ProfileSource {
    fn profile(&self) -> Result<DeviceProfile, IdentityError>;
}

// Reads the OS install id, the closest thing a desktop has to a browser profile.
pub struct SystemProfile;

const MACHINE_ID_PATHS: [&str; 2] = ["/etc/machine-id", "/var/lib/dbus/machine-id"];

impl ProfileSource for SystemProfile {
    fn profile(&self) -> Result<DeviceProfile, IdentityError> {
        let machine_id = MACHINE_ID_PATHS
            .iter()
            .filter_map(|path| std::fs::read_to_string(path).ok())
            .map(|id| id.trim().to_owned())
            .find(|id| !id.is_empty())
            .ok_or_else(|| IdentityError::Unavailable("no machine id on this system".to_owned()))?;

        Ok(DeviceProfile {
            machine_id,
            os: std::env::consts::OS.to_owned(),
            arch: std::env::consts::ARCH.to_owned(),
            user: std::env::var("USER")
                .or_else(|_| std::env::var("USERNAME"))
                .ok(),
        })
    }
}

pub fn derive_fingerprint(profile: &DeviceProfile) -> Result<DeviceFingerprint, IdentityError> {
    let argon2 = Argon2::default();
    let hashed = argon2
        .hash_password(profile.canonical().as_bytes(), CONSTANT_SALT)
        .map_err(|e| IdentityError::Unavailable(format!("hashing failed: {}", e)))?;
    let output = hashed
        .hash
        .ok_or_else(|| IdentityError::Unavailable("hash had no output".to_owned()))?;

    let hex: String = output
        .as_bytes()
        .iter()
        .take(FINGERPRINT_BYTES)
        .map(|b| format!("{:02x}", b))
        .collect();
    Ok(DeviceFingerprint(hex))
}

// Resolves the fingerprint once and then hands out the same value forever,
// both for this process (memory) and for later runs (cache file).
pub struct FingerprintProvider<S: ProfileSource> {
    source: S,
    cache_path: Option<PathBuf>,
    cached: RefCell<Option<DeviceFingerprint>>,
}

impl<S: ProfileSource> FingerprintProvider<S> {
    pub fn new(source: S, cache_path: Option<PathBuf>) -> Self {
        FingerprintProvider {
            source,
            cache_path,
            cached: RefCell::new(None),
        }
    }

    pub fn get_fingerprint(&self) -> Result<DeviceFingerprint, IdentityError> {
        if let Some(fingerprint) = self.cached.borrow().as_ref() {
            return Ok(fingerprint.clone());
        }

        let fingerprint = match self.read_cache()? {
            Some(fingerprint) => fingerprint,
            None => {
                let fingerprint = derive_fingerprint(&self.source.profile()?)?;
                if let Some(path) = &self.cache_path {
                    write_bincode(path, &fingerprint)?;
                }
                tracing::debug!("Derived device fingerprint {}", fingerprint);
                fingerprint
            }
        };

        *self.cached.borrow_mut() = Some(fingerprint.clone());
        Ok(fingerprint)
    }

    fn read_cache(&self) -> Result<Option<DeviceFingerprint>, IdentityError> {
        match &self.cache_path {
            Some(path) => Ok(read_bincode(path)?),
            None => Ok(None),
        }
    }
}

impl FingerprintProvider<SystemProfile> {
    pub fn system() -> Self {
        Self::new(SystemProfile, Some(APP_DATA.data_dir().join("fingerprint")))
    }
}
