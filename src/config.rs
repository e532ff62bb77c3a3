// Determine config stuffs

use crate::error::ConfigError;
use crate::store::APP_DATA;
use serde::Deserialize;
use std::fs::File;
use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    pub backend_url: String,
    // What the kiosk's QR code points at. The token gets appended as a fragment.
    pub checkin_page_url: String,
    pub request_timeout_secs: u64,
    pub max_evidence_secs: u64,
    pub kiosk_retry_millis: u64,
    pub admin_poll_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            backend_url: "http://127.0.0.1:8000".to_owned(),
            checkin_page_url: "https://coding-for-community.github.io/charger-auth/".to_owned(),
            request_timeout_secs: 10,
            max_evidence_secs: 15,
            kiosk_retry_millis: 1000,
            admin_poll_secs: 5,
        }
    }
}

impl Config {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn max_evidence(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.max_evidence_secs as i64)
    }

    pub fn kiosk_retry(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.kiosk_retry_millis as i64)
    }

    pub fn admin_poll(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.admin_poll_secs as i64)
    }
}

pub fn get_config() -> Result<Config, ConfigError> {
    load_config(&APP_DATA.data_dir().join("config.json"))
}

// No config.json is fine (everything has a default), a broken one is not.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Config::default());
        }
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    serde_json::from_reader(file).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
