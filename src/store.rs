/*!
    device configuration kept by the backend store

    the store serves one JSON object per device, keyed by parameter name. The agent only reads it, at startup and
    when asked to resend its configuration, and applies every recognized parameter to the board.
*/

use core::future::Future;
use log::*;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use std::time::Duration;

use crate::{
    link::RegisterClient,
    registers::{Register, MOTOR1, MOTOR2},
    router::integer,
    };


/// parameters understood by the agent and the register each one is written to
pub const PARAMETERS: [(&str, Register<u16>); 6] = [
    ("motor1_config", MOTOR1.config),
    ("motor1_max_speed", MOTOR1.max_speed),
    ("motor1_accel", MOTOR1.acceleration),
    ("motor2_config", MOTOR2.config),
    ("motor2_max_speed", MOTOR2.max_speed),
    ("motor2_accel", MOTOR2.acceleration),
];


#[derive(Error, Debug)]
pub enum ConfigStoreError {
    #[error("backend url must start with http:// or https://, got {0:?}")]
    InvalidUrl(String),
    #[error("no configuration stored for this device")]
    NotFound,
    #[error("backend request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("configuration is not a JSON object")]
    NotAnObject,
}


/// configuration document of one device, partial documents are valid
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConfigDocument {
    entries: Map<String, Value>,
}
impl ConfigDocument {
    pub fn from_value(value: Value) -> Result<Self, ConfigStoreError> {
        match value {
            Value::Object(entries) => Ok(Self {entries}),
            _ => Err(ConfigStoreError::NotAnObject),
        }
    }
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /**
        write every recognized parameter present in the document to the board

        absent parameters are left untouched. A parameter with an invalid value is skipped without affecting the others.
        Returns the number of registers successfully written.
    */
    pub async fn apply<S: AsyncRead + AsyncWrite + Unpin>(&self, client: &RegisterClient<S>) -> usize {
        info!("applying configuration");
        for key in self.entries.keys() {
            if !PARAMETERS.iter().any(|(name, _)| *name == key.as_str()) {
                debug!("ignoring unknown configuration parameter {:?}", key);
            }
        }
        let mut applied = 0;
        for (name, register) in PARAMETERS {
            let Some(value) = self.entries.get(name) else {continue};
            let Some(value) = integer(value).and_then(|v| u16::try_from(v).ok()) else {
                error!("invalid value {} for configuration parameter {}", value, name);
                continue
            };
            if client.write(register, value).await {
                info!("applied {} = {} (register {:#04x})", name, value, register.address());
                applied += 1;
            }
            else {
                warn!("failed to apply {} (register {:#04x})", name, register.address());
            }
        }
        info!("configuration applied, {} values written", applied);
        applied
    }
}


/// source of the device configuration document
pub trait ConfigStore {
    fn fetch(&self) -> impl Future<Output = Result<ConfigDocument, ConfigStoreError>> + Send;
}

/// configuration store reached over HTTP at `GET {base}/config/{device}`
pub struct HttpConfigStore {
    http: reqwest::Client,
    base: String,
    device: String,
}
impl HttpConfigStore {
    pub fn new(base: &str, device: &str, timeout: Duration) -> Result<Self, ConfigStoreError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            base: base.trim_end_matches('/').to_owned(),
            device: device.to_owned(),
        })
    }
    pub fn url(&self) -> String {
        format!("{}/config/{}", self.base, self.device)
    }
}
impl ConfigStore for HttpConfigStore {
    async fn fetch(&self) -> Result<ConfigDocument, ConfigStoreError> {
        if !(self.base.starts_with("http://") || self.base.starts_with("https://")) {
            return Err(ConfigStoreError::InvalidUrl(self.base.clone()));
        }
        let url = self.url();
        info!("requesting configuration from {}", url);
        let response = self.http.get(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ConfigStoreError::NotFound);
        }
        let value = response.error_for_status()?
            .json::<Value>().await?;
        debug!("received configuration {}", value);
        ConfigDocument::from_value(value)
    }
}
