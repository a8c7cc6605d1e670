/*!
    connection to the message bus

    the agent is one MQTT client of the broker. It publishes status snapshots, keeps a retained connection state message
    up to date, and receives commands which are decoded here and handed over to the command router through a channel.

    connection lifecycle is an explicit state machine: `Disconnected -> Connecting -> Connected`, with a minimum delay
    between connection attempts. The network loop only attempts a connection when asked to by [BusClient::connect].
*/

use log::*;
use rumqttc::{AsyncClient, EventLoop, Event, Packet, Outgoing, MqttOptions, LastWill, QoS};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::{
    sync::{mpsc::{self, error::TrySendError}, Notify},
    time::{sleep, Instant},
    };
use tokio_util::sync::CancellationToken;
use std::{
    sync::Mutex,
    time::Duration,
    };

use crate::{
    poller::{StatusSink, StatusSnapshot},
    router::CommandMessage,
    };


/// minimum delay between two connection attempts
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(5);
/// time left to the network loop to deliver the graceful offline message
const OFFLINE_FLUSH: Duration = Duration::from_millis(500);
/// capacity of the request queue toward the network loop
const REQUESTS_CAPACITY: usize = 16;


/// bus settings
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct MqttSettings {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_s: u64,
}
fn default_port() -> u16 {1883}
fn default_keep_alive() -> u64 {60}


/// topics used by one device
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Topics {
    /// status snapshots, fire and forget
    pub status: String,
    /// retained connection state, also the last will
    pub connection: String,
    /// incoming commands
    pub command: String,
}
impl Topics {
    pub fn new(device: &str) -> Self {
        Self {
            status: format!("devices/{device}/status"),
            connection: format!("devices/{device}/connection"),
            command: format!("devices/{device}/command"),
        }
    }
}

/// reachability of the agent as seen by bus peers
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Online,
    /// published by the broker on the agent's behalf
    OfflineUnexpected,
    OfflineGraceful,
}
impl ConnectionState {
    pub fn payload(self) -> Value {
        match self {
            ConnectionState::Online => json!({"status": "online"}),
            ConnectionState::OfflineUnexpected => json!({"status": "offline", "reason": "unexpected disconnect"}),
            ConnectionState::OfflineGraceful => json!({"status": "offline", "reason": "graceful shutdown"}),
        }
    }
}


#[derive(Error, Debug)]
pub enum BusError {
    #[error("not connected to the broker")]
    NotConnected,
    #[error("mqtt client failure: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("cannot encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// reason for discarding a message received on the command topic
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("empty payload")]
    Empty,
    #[error("payload is not utf-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("payload is not JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("payload is not a JSON object")]
    NotObject,
}

/// decode a command message, only JSON objects are accepted
pub fn decode_command(payload: &[u8]) -> Result<CommandMessage, DecodeError> {
    let text = std::str::from_utf8(payload)?;
    if text.trim().is_empty() {
        return Err(DecodeError::Empty);
    }
    let value: Value = serde_json::from_str(text)?;
    if !value.is_object() {
        return Err(DecodeError::NotObject);
    }
    Ok(serde_json::from_value(value)?)
}


/// phase of the broker connection
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    Disconnected,
    Connecting,
    Connected,
}

/// connection state machine, throttling attempts to one per `interval`
#[derive(Clone, Debug)]
pub struct Reconnect {
    phase: Phase,
    last_attempt: Option<Instant>,
    interval: Duration,
}
impl Reconnect {
    pub fn new(interval: Duration) -> Self {
        Self {
            phase: Phase::Disconnected,
            last_attempt: None,
            interval,
        }
    }
    pub fn phase(&self) -> Phase {self.phase}

    /// start an attempt if disconnected and the last attempt is old enough
    pub fn begin(&mut self, now: Instant) -> bool {
        if self.phase != Phase::Disconnected {
            return false;
        }
        if let Some(last) = self.last_attempt {
            if now.saturating_duration_since(last) < self.interval {
                return false;
            }
        }
        self.phase = Phase::Connecting;
        self.last_attempt = Some(now);
        true
    }
    pub fn connected(&mut self) {
        self.phase = Phase::Connected;
    }
    pub fn disconnected(&mut self) {
        self.phase = Phase::Disconnected;
    }
}


/// MQTT client of the agent
pub struct BusClient {
    client: AsyncClient,
    topics: Topics,
    state: Mutex<Reconnect>,
    attempt: Notify,
}

impl BusClient {
    /**
        prepare a client for the given device, no connection is made yet

        the returned event loop must be driven by [Self::run]
    */
    pub fn new(settings: &MqttSettings, device: &str) -> (Self, EventLoop) {
        let (client, events) = AsyncClient::new(Self::options(settings, device), REQUESTS_CAPACITY);
        (Self {
            client,
            topics: Topics::new(device),
            state: Mutex::new(Reconnect::new(RECONNECT_INTERVAL)),
            attempt: Notify::new(),
            },
        events)
    }

    /// connection options for the given device, with the unexpected disconnection registered as last will
    pub fn options(settings: &MqttSettings, device: &str) -> MqttOptions {
        let topics = Topics::new(device);
        let mut options = MqttOptions::new(format!("agent_{device}"), settings.host.clone(), settings.port);
        options.set_keep_alive(Duration::from_secs(settings.keep_alive_s));
        options.set_clean_session(true);
        options.set_last_will(LastWill::new(
            topics.connection,
            ConnectionState::OfflineUnexpected.payload().to_string(),
            QoS::AtLeastOnce,
            true,
            ));
        if let Some(username) = &settings.username {
            options.set_credentials(username.clone(), settings.password.clone().unwrap_or_default());
        }
        options
    }

    pub fn topics(&self) -> &Topics {&self.topics}

    pub fn phase(&self) -> Phase {
        self.state.lock().map(|state| state.phase()).unwrap_or(Phase::Disconnected)
    }
    pub fn is_connected(&self) -> bool {
        self.phase() == Phase::Connected
    }

    fn transition(&self, change: impl FnOnce(&mut Reconnect)) {
        if let Ok(mut state) = self.state.lock() {
            change(&mut state);
        }
    }

    /**
        request a connection attempt

        does nothing if already connected, connecting, or if the last attempt is more recent than [RECONNECT_INTERVAL].
        Returns whether an attempt was started.
    */
    pub fn connect(&self) -> bool {
        let started = self.state.lock()
            .map(|mut state| state.begin(Instant::now()))
            .unwrap_or(false);
        if started {
            info!("connecting to mqtt broker");
            self.attempt.notify_one();
        }
        started
    }

    /**
        network processing loop, must be running for anything to be exchanged with the broker

        decoded commands are sent to `commands`, malformed ones are discarded here and never reach the router.
        Commands arriving while `commands` is full are dropped.
        Returns when `stop` is cancelled or after a graceful disconnection.
    */
    pub async fn run(&self, mut events: EventLoop, commands: mpsc::Sender<CommandMessage>, stop: CancellationToken) {
        loop {
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = self.attempt.notified() => {},
            }
            loop {
                let event = tokio::select! {
                    _ = stop.cancelled() => return,
                    event = events.poll() => event,
                };
                match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => self.on_connected(),
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        if publish.topic == self.topics.command {
                            self.on_command(&publish.payload, &commands);
                        }
                        else {
                            debug!("ignoring message on {}", publish.topic);
                        }
                    },
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                        info!("disconnected from mqtt broker");
                        self.transition(Reconnect::disconnected);
                        return;
                    },
                    Ok(event) => trace!("mqtt event {:?}", event),
                    Err(error) => {
                        if self.is_connected() {warn!("mqtt connection lost: {}", error)}
                        else {error!("mqtt connection failed: {}", error)}
                        self.transition(Reconnect::disconnected);
                        break
                    },
                }
            }
        }
    }

    fn on_connected(&self) {
        info!("connected to mqtt broker");
        self.transition(Reconnect::connected);
        // requests are queued without waiting: this runs inside the loop draining the queue
        let online = ConnectionState::Online.payload().to_string();
        if let Err(error) = self.client.try_publish(&self.topics.connection, QoS::AtLeastOnce, true, online) {
            error!("failed to publish online state: {}", error);
        }
        match self.client.try_subscribe(&self.topics.command, QoS::AtLeastOnce) {
            Ok(()) => info!("subscribed to {}", self.topics.command),
            Err(error) => error!("failed to subscribe to {}: {}", self.topics.command, error),
        }
    }

    /// hand a command to the router, the network loop must never wait on it
    fn on_command(&self, payload: &[u8], commands: &mpsc::Sender<CommandMessage>) {
        match decode_command(payload) {
            Ok(message) => match commands.try_send(message) {
                Ok(()) => {},
                Err(TrySendError::Full(message)) => warn!("command router is busy, dropping command {:?}", message),
                Err(TrySendError::Closed(_)) => warn!("command router is gone, dropping command"),
            },
            Err(error) => warn!("discarding command message: {} ({})", error, String::from_utf8_lossy(payload)),
        }
    }

    /// publish a JSON message, failing if not connected
    pub async fn publish(&self, topic: &str, message: &impl serde::Serialize, qos: QoS, retain: bool) -> Result<(), BusError> {
        if !self.is_connected() {
            return Err(BusError::NotConnected);
        }
        let payload = serde_json::to_vec(message)?;
        self.client.publish(topic, qos, retain, payload).await?;
        debug!("published to {}", topic);
        Ok(())
    }

    /**
        leave the bus gracefully

        the retained connection state is replaced by a graceful offline message, overriding the last will, before disconnecting
    */
    pub async fn disconnect(&self) {
        if self.is_connected() {
            info!("publishing offline state");
            let message = ConnectionState::OfflineGraceful.payload();
            match self.publish(&self.topics.connection, &message, QoS::AtLeastOnce, true).await {
                Ok(()) => sleep(OFFLINE_FLUSH).await,
                Err(error) => warn!("failed to publish offline state: {}", error),
            }
        }
        if let Err(error) = self.client.disconnect().await {
            warn!("failed to request mqtt disconnection: {}", error);
        }
    }
}

impl StatusSink for BusClient {
    fn is_connected(&self) -> bool {
        BusClient::is_connected(self)
    }
    async fn publish_status(&self, snapshot: &StatusSnapshot) -> bool {
        match self.publish(&self.topics.status, snapshot, QoS::AtMostOnce, false).await {
            Ok(()) => true,
            Err(error) => {
                warn!("failed to publish status to {}: {}", self.topics.status, error);
                false
            },
        }
    }
}
