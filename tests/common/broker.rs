//! minimal mqtt 3.1.1 broker accepting one client and recording what it sends

use std::{
    sync::{Arc, Mutex},
    time::Duration,
    };
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, tcp::OwnedReadHalf},
    sync::mpsc,
    time::{sleep, timeout},
    };

use motorlink::bus::MqttSettings;


/// packet received from the client
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Received {
    Publish { topic: String, payload: Vec<u8>, qos: u8, retain: bool },
    Subscribe { topic: String, qos: u8 },
    Disconnect,
}

pub struct Broker {
    pub port: u16,
    received: Arc<Mutex<Vec<Received>>>,
    inject: mpsc::UnboundedSender<Vec<u8>>,
}

impl Broker {
    /// listen on a free local port, serving the first client that connects
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("cannot bind broker");
        let port = listener.local_addr().unwrap().port();
        let received = Arc::new(Mutex::new(Vec::new()));
        let (inject, mut outgoing) = mpsc::unbounded_channel::<Vec<u8>>();
        let replies = inject.clone();
        let record = received.clone();
        tokio::spawn(async move {
            let Ok((stream, _)) = listener.accept().await else {return};
            let (mut reader, mut writer) = stream.into_split();
            tokio::spawn(async move {
                while let Some(packet) = outgoing.recv().await {
                    if writer.write_all(&packet).await.is_err() {return}
                }
            });
            while let Some((header, body)) = read_packet(&mut reader).await {
                let _ = match header >> 4 {
                    // CONNECT
                    1 => replies.send(vec![0x20, 0x02, 0x00, 0x00]),
                    // PUBLISH
                    3 => {
                        let qos = (header >> 1) & 0b11;
                        let (topic, mut rest) = string(&body);
                        if qos > 0 {
                            let _ = replies.send(vec![0x40, 0x02, rest[0], rest[1]]);
                            rest = &rest[2 ..];
                        }
                        record.lock().unwrap().push(Received::Publish {
                            topic,
                            payload: rest.to_vec(),
                            qos,
                            retain: header & 1 != 0,
                        });
                        Ok(())
                    },
                    // SUBSCRIBE
                    8 => {
                        let (topic, rest) = string(&body[2 ..]);
                        record.lock().unwrap().push(Received::Subscribe {topic, qos: rest[0]});
                        replies.send(vec![0x90, 0x03, body[0], body[1], rest[0]])
                    },
                    // PINGREQ
                    12 => replies.send(vec![0xD0, 0x00]),
                    // DISCONNECT
                    14 => {
                        record.lock().unwrap().push(Received::Disconnect);
                        return
                    },
                    _ => Ok(()),
                };
            }
        });
        Self {port, received, inject}
    }

    pub fn settings(&self) -> MqttSettings {
        MqttSettings {
            host: "127.0.0.1".into(),
            port: self.port,
            username: None,
            password: None,
            keep_alive_s: 60,
        }
    }

    pub fn received(&self) -> Vec<Received> {
        self.received.lock().unwrap().clone()
    }

    /// wait until the received packets satisfy `condition`, panics after 5 seconds
    pub async fn wait_for(&self, condition: impl Fn(&[Received]) -> bool) -> Vec<Received> {
        timeout(Duration::from_secs(5), async {
            loop {
                let received = self.received();
                if condition(&received) {return received}
                sleep(Duration::from_millis(10)).await;
            }
        }).await.expect("broker did not receive the expected packets")
    }

    /// send a QoS 0 message to the client
    pub fn publish(&self, topic: &str, payload: &[u8]) {
        let mut body = (topic.len() as u16).to_be_bytes().to_vec();
        body.extend_from_slice(topic.as_bytes());
        body.extend_from_slice(payload);
        let mut packet = vec![0x30];
        let mut length = body.len();
        loop {
            let byte = (length % 128) as u8;
            length /= 128;
            if length == 0 {
                packet.push(byte);
                break
            }
            packet.push(byte | 0x80);
        }
        packet.extend_from_slice(&body);
        self.inject.send(packet).expect("broker connection is gone");
    }
}

impl Received {
    pub fn is_publish_on(&self, expected: &str) -> bool {
        matches!(self, Received::Publish {topic, ..} if topic == expected)
    }
    /// payload of a publish, decoded as JSON
    pub fn json(&self) -> serde_json::Value {
        match self {
            Received::Publish {payload, ..} => serde_json::from_slice(payload).expect("payload is not JSON"),
            other => panic!("{:?} has no payload", other),
        }
    }
}

/// length prefixed string followed by the rest of the buffer
fn string(data: &[u8]) -> (String, &[u8]) {
    let length = usize::from(u16::from_be_bytes([data[0], data[1]]));
    let text = String::from_utf8(data[2 .. 2 + length].to_vec()).expect("topic is not utf-8");
    (text, &data[2 + length ..])
}

async fn read_packet(reader: &mut OwnedReadHalf) -> Option<(u8, Vec<u8>)> {
    let header = reader.read_u8().await.ok()?;
    let mut length = 0usize;
    let mut shift = 0;
    loop {
        let byte = reader.read_u8().await.ok()?;
        length |= usize::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {break}
        shift += 7;
    }
    let mut body = vec![0; length];
    reader.read_exact(&mut body).await.ok()?;
    Some((header, body))
}
