/*!
    agent orchestration

    startup order: open the serial port, fetch and apply the initial configuration, connect to the bus, start polling.
    Shutdown stops the poller, leaves the bus gracefully, then closes the serial port.
*/

use core::future::Future;
use log::*;
use thiserror::Error;
use rumqttc::EventLoop;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
    task::JoinHandle,
    time::{sleep, timeout},
    };
use tokio_util::sync::CancellationToken;
use std::{
    sync::Arc,
    time::Duration,
    };

use crate::{
    bus::BusClient,
    link::{RegisterClient, Transport, TransportError},
    poller::{PollSettings, StatusPoller, wait_or_stop},
    registers,
    router::CommandRouter,
    settings::{AgentSettings, SupervisorSettings},
    store::{ConfigStore, ConfigStoreError, HttpConfigStore},
    };


/// maximum number of decoded commands waiting for the router
const COMMAND_QUEUE: usize = 32;
/// maximum wait for the network and command tasks to end on shutdown
const TASK_JOIN: Duration = Duration::from_secs(1);


/// failure preventing the agent from starting
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("cannot open serial port {port}: {source}")]
    Serial { port: String, source: TransportError },
    #[error("cannot create configuration store client: {0}")]
    Store(#[from] ConfigStoreError),
}


/**
    run the agent until `shutdown` completes

    only a failure to open the serial port or to set up the store client aborts the agent,
    every later failure is logged and retried by the loops.
*/
pub async fn run(settings: AgentSettings, shutdown: impl Future<Output = ()>) -> Result<(), AgentError> {
    info!("starting agent for device {}", settings.device_id);

    let transport = Transport::open(&settings.serial.port, settings.serial.baud_rate, settings.serial.timeout())
        .map_err(|source| AgentError::Serial {port: settings.serial.port.clone(), source})?;
    let client = Arc::new(RegisterClient::new(transport));
    sleep(settings.serial.settle()).await;
    match client.read(registers::STATUS).await {
        Some(status) => info!("board answered, status {:#04x}", status),
        None => warn!("board did not answer the initial status read"),
    }
    let store = HttpConfigStore::new(&settings.backend.url, &settings.device_id, settings.backend.timeout())?;
    let bus = BusClient::new(&settings.mqtt, &settings.device_id);

    run_with(client, store, bus, (&settings.poll).into(), &settings.supervisor, shutdown).await;
    Ok(())
}

/**
    run the agent on an already open link until `shutdown` completes

    startup: apply the stored configuration, connect to the bus, start polling.
    Shutdown: stop the poller, leave the bus gracefully, then close the link.
*/
pub async fn run_with<S, C>(
    client: Arc<RegisterClient<S>>,
    store: C,
    (bus, events): (BusClient, EventLoop),
    poll: PollSettings,
    supervisor: &SupervisorSettings,
    shutdown: impl Future<Output = ()>,
    )
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    C: ConfigStore + Send + Sync + 'static,
{
    // initial configuration
    match store.fetch().await {
        Ok(document) => {
            document.apply(&*client).await;
        },
        Err(error) => warn!("no initial configuration applied: {}", error),
    }

    // bus
    let bus = Arc::new(bus);
    let (commands, received) = mpsc::channel(COMMAND_QUEUE);
    let network_stop = CancellationToken::new();
    let network = tokio::spawn({
        let bus = bus.clone();
        let stop = network_stop.clone();
        async move {bus.run(events, commands, stop).await}
        });
    let router = CommandRouter::new(client.clone(), store);
    let dispatcher = tokio::spawn(async move {router.serve(received).await});
    bus.connect();

    // status polling
    let stop = CancellationToken::new();
    let poller = tokio::spawn({
        let poller = StatusPoller::new(client.clone(), poll);
        let bus = bus.clone();
        let stop = stop.clone();
        async move {poller.run(&*bus, stop).await}
        });

    info!("agent running");
    tokio::select! {
        _ = shutdown => info!("shutdown requested"),
        _ = supervise(&bus, &stop, supervisor.check_interval()) => {},
    }

    // shutdown
    stop.cancel();
    join_bounded("status poller", poller, supervisor.poller_join()).await;
    bus.disconnect().await;
    join_bounded("bus network loop", network, TASK_JOIN).await;
    network_stop.cancel();
    join_bounded("command router", dispatcher, TASK_JOIN).await;
    client.close().await;
    info!("agent stopped");
}

/// periodically request a bus connection while disconnected, until `stop` is cancelled
pub async fn supervise(bus: &BusClient, stop: &CancellationToken, interval: Duration) {
    loop {
        if !bus.is_connected() {
            warn!("bus not connected");
            bus.connect();
        }
        if !wait_or_stop(stop, interval).await {
            break
        }
    }
}

/// wait for a task to end, without forcing it if it takes longer than `limit`
async fn join_bounded(name: &str, task: JoinHandle<()>, limit: Duration) {
    match timeout(limit, task).await {
        Ok(Ok(())) => debug!("{} ended", name),
        Ok(Err(error)) => error!("{} failed: {}", name, error),
        Err(_) => warn!("{} did not end within {:?}", name, limit),
    }
}
