mod common;

use std::{
    sync::atomic::Ordering,
    time::Duration,
    };
use serde_json::{json, Value};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use motorlink::{
    agent::{run_with, supervise},
    bus::{BusClient, Phase, Topics},
    frame,
    poller::PollSettings,
    registers::status,
    settings::SupervisorSettings,
    store::{ConfigStore, ConfigStoreError, ConfigDocument},
    };
use common::{simulate, broker::{Broker, Received}};


struct FixedStore(Value);
impl ConfigStore for FixedStore {
    async fn fetch(&self) -> Result<ConfigDocument, ConfigStoreError> {
        ConfigDocument::from_value(self.0.clone())
    }
}

fn timing() -> (PollSettings, SupervisorSettings) {
    (
        PollSettings {
            period: Duration::from_millis(50),
            failure_backoff: Duration::from_millis(100),
            offline_wait: Duration::from_millis(50),
        },
        SupervisorSettings {
            check_interval_ms: 100,
            poller_join_ms: 1000,
        },
    )
}


#[test]
fn startup_and_shutdown_order() {
    simulate(|client, board| async move {
        let broker = Broker::start().await;
        let topics = Topics::new("bench-01");
        let bus = BusClient::new(&broker.settings(), "bench-01");
        let store = FixedStore(json!({"motor1_max_speed": 500}));
        let (poll, supervisor) = timing();
        board.set(0x00, &[status::READY]);
        board.moving.store(true, Ordering::SeqCst);

        let shutdown = async {
            broker.wait_for(|packets| packets.iter().filter(|p| p.is_publish_on(&topics.status)).count() >= 3).await;
            broker.publish(&topics.command, br#"{"action": "set_speed", "motor": 2, "value": 700}"#);
            while board.get(0x29, 2) != 700u16.to_le_bytes() {
                sleep(Duration::from_millis(10)).await;
            }
        };
        run_with(client.clone(), store, bus, poll, &supervisor, shutdown).await;

        // configuration is applied before the first status read
        let frames = board.frames();
        assert_eq!(frames[0][.. 3], [frame::WRITE, 0x19, 0x02]);
        assert!(frames[1 ..].iter().any(|frame| frame[0] == frame::READ));

        // the poller was stopped before the graceful offline state, and the link closed last
        let packets = broker.received();
        let offline = packets.iter()
            .position(|p| p.is_publish_on(&topics.connection) && p.json()["reason"] == "graceful shutdown")
            .expect("graceful offline state not published");
        let last_status = packets.iter()
            .rposition(|p| p.is_publish_on(&topics.status))
            .unwrap();
        assert!(last_status < offline);
        assert_eq!(packets.last(), Some(&Received::Disconnect));
        assert!(!client.is_open().await);

        let polls = board.frames().len();
        sleep(Duration::from_millis(200)).await;
        assert_eq!(board.frames().len(), polls);
    });
}

#[test]
fn shutdown_without_broker() {
    simulate(|client, board| async move {
        // nothing listens on this port
        let broker = Broker::start().await;
        let mut settings = broker.settings();
        settings.port = 1;
        let bus = BusClient::new(&settings, "bench-01");
        let (poll, supervisor) = timing();

        run_with(client.clone(), FixedStore(json!({})), bus, poll, &supervisor, sleep(Duration::from_millis(300))).await;
        // no status is read while the bus is down
        assert!(board.frames().is_empty());
        assert!(!client.is_open().await);
    });
}

#[tokio::test]
async fn supervisor_requests_connection() {
    let broker = Broker::start().await;
    let (bus, _events) = BusClient::new(&broker.settings(), "bench-01");
    let stop = CancellationToken::new();
    stop.cancel();
    supervise(&bus, &stop, Duration::from_secs(60)).await;
    assert_eq!(bus.phase(), Phase::Connecting);
}
