/*!
    agent settings

    settings are layered: built-in defaults, then the TOML settings file, then `MOTORLINK_` environment variables
    where nested keys are separated by `__`, for instance `MOTORLINK_MQTT__HOST`.
*/

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
    };
use serde::{Deserialize, Serialize};
use std::{
    path::Path,
    time::Duration,
    };

use crate::{
    bus::MqttSettings,
    poller::PollSettings,
    };


#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct AgentSettings {
    /// identifier of this device on the bus and in the configuration store
    pub device_id: String,
    pub serial: SerialSettings,
    pub backend: BackendSettings,
    pub mqtt: MqttSettings,
    #[serde(default)]
    pub poll: PollerSettings,
    #[serde(default)]
    pub supervisor: SupervisorSettings,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialSettings {
    /// serial port file, like `/dev/ttyACM0`
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// write timeout and answer deadline
    #[serde(default = "default_serial_timeout")]
    pub timeout_ms: u64,
    /// pause after opening the port, the board may reset on connection
    #[serde(default = "default_settle")]
    pub settle_ms: u64,
}
fn default_baud_rate() -> u32 {115_200}
fn default_serial_timeout() -> u64 {500}
fn default_settle() -> u64 {2000}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendSettings {
    /// base url of the configuration store
    pub url: String,
    #[serde(default = "default_backend_timeout")]
    pub timeout_s: u64,
}
fn default_backend_timeout() -> u64 {10}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerSettings {
    pub period_ms: u64,
    pub failure_backoff_ms: u64,
    pub offline_wait_ms: u64,
}
impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            period_ms: 1000,
            failure_backoff_ms: 2000,
            offline_wait_ms: 2000,
        }
    }
}
impl From<&PollerSettings> for PollSettings {
    fn from(settings: &PollerSettings) -> Self {
        Self {
            period: Duration::from_millis(settings.period_ms),
            failure_backoff: Duration::from_millis(settings.failure_backoff_ms),
            offline_wait: Duration::from_millis(settings.offline_wait_ms),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    /// delay between two checks of the bus connection
    pub check_interval_ms: u64,
    /// maximum wait for the status poller to stop on shutdown
    pub poller_join_ms: u64,
}
impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            check_interval_ms: 5000,
            poller_join_ms: 2000,
        }
    }
}

impl SerialSettings {
    pub fn timeout(&self) -> Duration {Duration::from_millis(self.timeout_ms)}
    pub fn settle(&self) -> Duration {Duration::from_millis(self.settle_ms)}
}
impl BackendSettings {
    pub fn timeout(&self) -> Duration {Duration::from_secs(self.timeout_s)}
}
impl SupervisorSettings {
    pub fn check_interval(&self) -> Duration {Duration::from_millis(self.check_interval_ms)}
    pub fn poller_join(&self) -> Duration {Duration::from_millis(self.poller_join_ms)}
}

impl AgentSettings {
    /// defaults, overridden by the given TOML file if it exists, overridden by the environment
    pub fn figment(path: impl AsRef<Path>) -> Figment {
        Figment::new()
            .merge(Serialized::default("poll", PollerSettings::default()))
            .merge(Serialized::default("supervisor", SupervisorSettings::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("MOTORLINK_").split("__"))
    }
    pub fn load(path: impl AsRef<Path>) -> Result<Self, figment::Error> {
        Self::figment(path).extract()
    }
}
