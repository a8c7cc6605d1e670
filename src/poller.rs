/*!
    periodic reading of the board status

    the poller reads the status registers at a fixed cadence and publishes a snapshot only when the board state changed
    since the last published one, so bus traffic is bounded by actual state changes.
*/

use core::future::Future;
use log::*;
use serde::Serialize;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    time::{sleep, Instant},
    };
use tokio_util::sync::CancellationToken;
use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
    };

use crate::{
    link::RegisterClient,
    registers::{self, MOTOR1, MOTOR2},
    };


/// number of consecutive failed cycles after which the link is reported degraded
pub const DEGRADED_AFTER: u32 = 5;


/// decoded values of the polled registers
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub struct BoardState {
    pub status_flags: u8,
    pub switch_flags: u8,
    pub error_flags: u8,
    pub motor1_pos: i32,
    pub motor2_pos: i32,
}

/**
    board state at a point in time

    equality ignores the timestamp: two snapshots of an unchanged board are equal
*/
#[derive(Copy, Clone, Debug, Serialize)]
pub struct StatusSnapshot {
    /// seconds since unix epoch
    pub timestamp: f64,
    #[serde(flatten)]
    pub state: BoardState,
}
impl StatusSnapshot {
    pub fn now(state: BoardState) -> Self {
        let timestamp = SystemTime::now().duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs_f64())
            .unwrap_or_default();
        Self {timestamp, state}
    }
}
impl PartialEq for StatusSnapshot {
    fn eq(&self, other: &Self) -> bool {
        self.state == other.state
    }
}


/// destination of status snapshots
pub trait StatusSink {
    fn is_connected(&self) -> bool;
    /// true if the snapshot was handed to the bus
    fn publish_status(&self, snapshot: &StatusSnapshot) -> impl Future<Output = bool> + Send;
}

#[derive(Copy, Clone, Debug)]
pub struct PollSettings {
    /// target cycle duration
    pub period: Duration,
    /// wait after a failed cycle
    pub failure_backoff: Duration,
    /// wait while the sink is not connected
    pub offline_wait: Duration,
}
impl Default for PollSettings {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(1),
            failure_backoff: Duration::from_secs(2),
            offline_wait: Duration::from_secs(2),
        }
    }
}

/// result of one poll cycle
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Cycle {
    Published,
    Unchanged,
    /// at least one register could not be read
    ReadFailed,
    PublishFailed,
    /// the sink is not connected, nothing was read
    Offline,
}


/**
    status polling loop

    the last published snapshot is owned by the poller alone
*/
pub struct StatusPoller<S> {
    client: Arc<RegisterClient<S>>,
    settings: PollSettings,
    last: Option<StatusSnapshot>,
    failures: u32,
}

impl<S: AsyncRead + AsyncWrite + Unpin> StatusPoller<S> {
    pub fn new(client: Arc<RegisterClient<S>>, settings: PollSettings) -> Self {
        Self {
            client,
            settings,
            last: None,
            failures: 0,
        }
    }
    pub fn last_published(&self) -> Option<&StatusSnapshot> {self.last.as_ref()}
    pub fn consecutive_failures(&self) -> u32 {self.failures}

    /// read all polled registers, `None` as soon as one read fails
    pub async fn read_state(&self) -> Option<BoardState> {
        let client = &*self.client;
        Some(BoardState {
            status_flags: client.read(registers::STATUS).await?,
            switch_flags: client.read(registers::SWITCHES).await?,
            error_flags: client.read(registers::ERRORS).await?,
            motor1_pos: client.read(MOTOR1.position).await?,
            motor2_pos: client.read(MOTOR2.position).await?,
        })
    }

    /// run one cycle: read the board and publish its state if it changed
    pub async fn cycle<K: StatusSink>(&mut self, sink: &K) -> Cycle {
        if !sink.is_connected() {
            warn!("status poller: bus not connected");
            return Cycle::Offline;
        }
        let Some(state) = self.read_state().await else {
            self.failures += 1;
            warn!("failed to read status registers ({} consecutive failures)", self.failures);
            if self.failures > DEGRADED_AFTER {
                error!("status reads keep failing, board connection presumed degraded");
            }
            return Cycle::ReadFailed;
        };
        self.failures = 0;

        let snapshot = StatusSnapshot::now(state);
        if self.last.as_ref() == Some(&snapshot) {
            debug!("status unchanged, skipping publish");
            return Cycle::Unchanged;
        }
        if !sink.publish_status(&snapshot).await {
            return Cycle::PublishFailed;
        }
        debug!("published status {:?}", snapshot);
        self.last = Some(snapshot);
        Cycle::Published
    }

    /**
        poll until `stop` is cancelled

        the stop signal is only observed while waiting between cycles, a read in progress always completes.
    */
    pub async fn run<K: StatusSink>(mut self, sink: &K, stop: CancellationToken) {
        info!("status poller started");
        while !stop.is_cancelled() {
            let start = Instant::now();
            let wait = match self.cycle(sink).await {
                Cycle::ReadFailed => self.settings.failure_backoff,
                Cycle::Offline => self.settings.offline_wait,
                _ => self.settings.period.saturating_sub(start.elapsed()),
            };
            if !wait_or_stop(&stop, wait).await {
                break
            }
        }
        info!("status poller stopped");
    }
}

/// sleep for `duration`, false if `stop` was cancelled first
pub async fn wait_or_stop(stop: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = stop.cancelled() => false,
        _ = sleep(duration) => true,
    }
}
