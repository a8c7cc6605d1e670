use log::*;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::Mutex,
    };

use crate::{
    frame::{self, AckStatus},
    registers::{Register, RegisterValue, Address},
    };
use super::{LinkError, Transport};


/**
    register protocol client for the motor board

    all exchanges go through one exclusive lock: the physical link has no parallelism, any interleaving of two
    frames in flight would corrupt both. A request may therefore wait behind the one currently on the wire.

    public methods never fail: failures are logged, stray input is flushed, and the caller only gets a `bool` or an `Option`
*/
pub struct RegisterClient<S> {
    link: Mutex<Link<S>>,
}
/// state guarded by the link lock
struct Link<S> {
    transport: Transport<S>,
    /// set after a protocol violation, the input must be flushed before the next request
    desynchronized: bool,
}

impl<S: AsyncRead + AsyncWrite + Unpin> RegisterClient<S> {
    pub fn new(transport: Transport<S>) -> Self {
        Self {
            link: Mutex::new(Link {
                transport,
                desynchronized: false,
            }),
        }
    }

    /// write `data` starting at `address`, true only if the board acknowledged it
    pub async fn write_register(&self, address: Address, data: &[u8]) -> bool {
        let mut link = self.link.lock().await;
        match link.write(address, data).await {
            Ok(()) => {
                debug!("write to register {:#04x} succeeded", address);
                true
            },
            Err(LinkError::Rejected) => {
                warn!("write to register {:#04x} rejected by the board", address);
                false
            },
            Err(error) => {
                error!("write to register {:#04x} failed: {}", address, error);
                link.recover(&error).await;
                false
            },
        }
    }

    /// read `length` bytes starting at `address`, `None` on any failure
    pub async fn read_register(&self, address: Address, length: usize) -> Option<Vec<u8>> {
        let mut link = self.link.lock().await;
        match link.read(address, length).await {
            Ok(data) => {
                debug!("read of register {:#04x} succeeded: {}", address, hex::encode(&data));
                Some(data)
            },
            Err(error) => {
                error!("read of {} bytes at register {:#04x} failed: {}", length, address, error);
                link.recover(&error).await;
                None
            },
        }
    }

    /// read and decode a typed register
    pub async fn read<T: RegisterValue>(&self, register: Register<T>) -> Option<T> {
        let data = self.read_register(register.address(), register.size()).await?;
        T::from_le_slice(&data)
    }
    /// encode and write a typed register
    pub async fn write<T: RegisterValue>(&self, register: Register<T>, value: T) -> bool {
        self.write_register(register.address(), &value.to_le_vec()).await
    }

    pub async fn is_open(&self) -> bool {
        self.link.lock().await.transport.is_open()
    }
    /// close the serial port, waiting for the exchange in flight if any
    pub async fn close(&self) {
        self.link.lock().await.transport.close();
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> Link<S> {
    /// flush input left by a previous failure before a new request
    async fn prepare(&mut self) {
        if self.desynchronized {
            self.transport.flush_unexpected().await;
            self.desynchronized = false;
        }
    }

    async fn recover(&mut self, error: &LinkError) {
        if error.desynchronizes() {
            self.transport.flush_unexpected().await;
            self.desynchronized = true;
        }
    }

    async fn write(&mut self, address: Address, data: &[u8]) -> Result<(), LinkError> {
        let request = frame::encode_write(address, data)?;
        self.prepare().await;
        self.transport.send(&request).await?;
        let deadline = self.transport.timeout();
        let ack = self.transport.receive_exactly(frame::ACK_SIZE, deadline).await?;
        match frame::decode_write_ack(&ack, address)?.status {
            AckStatus::Accepted => Ok(()),
            AckStatus::Rejected => Err(LinkError::Rejected),
        }
    }

    async fn read(&mut self, address: Address, length: usize) -> Result<Vec<u8>, LinkError> {
        let request = frame::encode_read(address, length)?;
        self.prepare().await;
        self.transport.send(&request).await?;
        let deadline = self.transport.timeout();
        let response = self.transport.receive_exactly(frame::read_response_size(length), deadline).await?;
        Ok(frame::decode_read_response(&response, address, length)?.to_vec())
    }
}
