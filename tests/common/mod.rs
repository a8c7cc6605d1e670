//! simulated motor board answering the register protocol on an in-memory stream

#![allow(dead_code)]

use core::future::Future;
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, atomic::{AtomicBool, Ordering}},
    time::Duration,
    };
use futures_concurrency::future::Race;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

pub mod broker;

use motorlink::{
    frame,
    link::{RegisterClient, Transport},
    registers::{MAP_SIZE, MOTOR1},
    };


/// answer deadline used by the client in tests
pub const TIMEOUT: Duration = Duration::from_millis(200);
/// bytes sent out of turn by [Fault::Stray]
pub const STRAY: [u8; 3] = [0xAA, 0xBB, 0xCC];

/// misbehavior applied to the reply of the next request
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Fault {
    /// reply with a wrong checksum byte
    CorruptChecksum,
    /// reject a write
    Nack,
    /// acknowledge a write with a status which is neither accept nor reject
    BadStatus,
    /// do not reply at all
    Silence,
    /// reply with a wrong checksum, then send [STRAY] bytes after the given delay
    Stray(Duration),
}

/// board state observable from tests
#[derive(Default)]
pub struct Shared {
    pub memory: Mutex<Vec<u8>>,
    /// every well formed request received, in order
    pub frames: Mutex<Vec<Vec<u8>>>,
    /// number of bytes that could not be parsed as a request
    pub garbage: Mutex<usize>,
    pub faults: Mutex<VecDeque<Fault>>,
    /// when set, motor 1 position advances by one on every read of it
    pub moving: AtomicBool,
}
impl Shared {
    pub fn fault(&self, fault: Fault) {
        self.faults.lock().unwrap().push_back(fault);
    }
    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.frames.lock().unwrap().clone()
    }
    pub fn clear_frames(&self) {
        self.frames.lock().unwrap().clear();
    }
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.frames().into_iter().filter(|frame| frame[0] == frame::WRITE).collect()
    }
    pub fn garbage(&self) -> usize {
        *self.garbage.lock().unwrap()
    }
    pub fn set(&self, address: u8, data: &[u8]) {
        let start = usize::from(address);
        self.memory.lock().unwrap()[start .. start + data.len()].copy_from_slice(data);
    }
    pub fn get(&self, address: u8, length: usize) -> Vec<u8> {
        let start = usize::from(address);
        self.memory.lock().unwrap()[start .. start + length].to_vec()
    }
}

pub struct Board {
    port: DuplexStream,
    shared: Arc<Shared>,
}

/// create a register client connected to a fresh simulated board
pub fn link() -> (Arc<RegisterClient<DuplexStream>>, Board) {
    link_with(TIMEOUT)
}
/// same as [link] with the given answer deadline
pub fn link_with(timeout: Duration) -> (Arc<RegisterClient<DuplexStream>>, Board) {
    let (host, device) = tokio::io::duplex(4096);
    let client = RegisterClient::new(Transport::new(host, "simulated", timeout));
    let shared = Arc::new(Shared {
        memory: Mutex::new(vec![0; MAP_SIZE]),
        .. Default::default()
    });
    (Arc::new(client), Board {port: device, shared})
}

impl Board {
    pub fn shared(&self) -> Arc<Shared> {self.shared.clone()}

    /// answer requests until the other end is dropped
    pub async fn serve(mut self) {
        loop {
            let mut code = [0u8; 1];
            if self.port.read_exact(&mut code).await.is_err() {return}
            let mut header = [0u8; 2];
            match code[0] {
                frame::READ | frame::WRITE => {
                    if self.port.read_exact(&mut header).await.is_err() {return}
                },
                _ => {
                    *self.shared.garbage.lock().unwrap() += 1;
                    continue
                },
            }
            let [address, length] = header;
            let remaining = if code[0] == frame::WRITE {usize::from(length) + 1} else {1};
            let mut rest = vec![0u8; remaining];
            if self.port.read_exact(&mut rest).await.is_err() {return}

            let mut request = vec![code[0], address, length];
            request.extend_from_slice(&rest);
            let (body, checksum) = request.split_at(request.len() - 1);
            let in_map = usize::from(address) + usize::from(length) <= MAP_SIZE;
            if frame::checksum(body) != checksum[0] || !in_map {
                *self.shared.garbage.lock().unwrap() += 1;
                continue
            }
            self.shared.frames.lock().unwrap().push(request.clone());

            let fault = self.shared.faults.lock().unwrap().pop_front();
            let mut reply = if code[0] == frame::WRITE {
                match fault {
                    Some(Fault::Nack) => frame::encode_write_ack(address, frame::ACK_REJECTED),
                    Some(Fault::BadStatus) => frame::encode_write_ack(address, 0x42),
                    _ => {
                        self.shared.set(address, &request[3 .. request.len() - 1]);
                        frame::encode_write_ack(address, frame::ACK_ACCEPTED)
                    },
                }
            }
            else {
                if address == MOTOR1.position.address() && self.shared.moving.load(Ordering::SeqCst) {
                    let position = i32::from_le_bytes(self.shared.get(address, 4).try_into().unwrap());
                    self.shared.set(address, &(position + 1).to_le_bytes());
                }
                let data = self.shared.get(address, usize::from(length));
                frame::encode_read_response(address, &data).unwrap()
            };
            match fault {
                Some(Fault::Silence) => continue,
                Some(Fault::CorruptChecksum) | Some(Fault::Stray(_)) => {
                    if let Some(last) = reply.last_mut() {*last ^= 0xFF}
                },
                _ => {},
            }
            if self.port.write_all(&reply).await.is_err() {return}
            if let Some(Fault::Stray(delay)) = fault {
                tokio::time::sleep(delay).await;
                if self.port.write_all(&STRAY).await.is_err() {return}
            }
        }
    }
}

/// run a test against a simulated board, aborting it if it takes too long
pub fn simulate<T, F>(test: T)
where
    T: FnOnce(Arc<RegisterClient<DuplexStream>>, Arc<Shared>) -> F,
    F: Future<Output = ()>,
{
    simulate_with(TIMEOUT, test)
}
/// same as [simulate] with the given answer deadline
pub fn simulate_with<T, F>(timeout: Duration, test: T)
where
    T: FnOnce(Arc<RegisterClient<DuplexStream>>, Arc<Shared>) -> F,
    F: Future<Output = ()>,
{
    tokio::runtime::Runtime::new()
    .expect("failed to create runtime")
    .block_on(async move {
        let (client, board) = link_with(timeout);
        let shared = board.shared();
        (
            async {
                tokio::time::timeout(Duration::from_secs(10), test(client, shared))
                .await.expect("aborted test because took too long");
            },
            board.serve(),
        ).race().await;
    });
}
