use log::*;
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time::{timeout, timeout_at, Instant},
    };
use tokio_serial::{SerialStream, SerialPort, SerialPortBuilderExt, DataBits, Parity, StopBits, ClearBuffer};
use std::{
    io,
    time::Duration,
    };


/// time given to stray bytes to arrive when flushing
const FLUSH_TIMEOUT: Duration = Duration::from_millis(50);
/// maximum amount of stray bytes discarded in one flush
const FLUSH_LIMIT: usize = 4096;
/// read deadline used when the configured one does not fit in an instant
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365);


/// error regarding the serial port itself
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("cannot open serial port: {0}")]
    Open(#[from] tokio_serial::Error),
    #[error("serial port is closed")]
    Closed,
    #[error("serial i/o failure: {0}")]
    Io(#[from] io::Error),
    #[error("serial write timed out")]
    WriteTimeout,
    #[error("short serial write, {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },
    #[error("no data received, expected {expected} bytes")]
    NoData { expected: usize },
    #[error("partial read, received {} of {expected} bytes: {}", received.len(), hex::encode(received))]
    PartialRead { expected: usize, received: Vec<u8> },
}


/**
    owner of the uart port

    I/O failures and write failures close the port: the link is then considered desynchronized and unusable
    until the agent restarts. Read deadlines leave it open.
*/
pub struct Transport<S> {
    port: Option<S>,
    name: String,
    timeout: Duration,
}

impl Transport<SerialStream> {
    /// open the given serial port file with the given baud rate, 8 bits, no parity, 1 stop bit
    pub fn open(path: &str, rate: u32, timeout: Duration) -> Result<Self, TransportError> {
        let port = tokio_serial::new(path, rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .timeout(timeout)
            .open_native_async()?;
        port.clear(ClearBuffer::All)?;
        info!("serial port {} opened at {} bauds", path, rate);
        Ok(Self::new(port, path, timeout))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> Transport<S> {
    /// wrap an already open byte stream, `timeout` bounds writes and is the default read deadline
    pub fn new(port: S, name: impl Into<String>, timeout: Duration) -> Self {
        Self {
            port: Some(port),
            name: name.into(),
            timeout,
        }
    }
    pub fn name(&self) -> &str {&self.name}
    /// default deadline for receiving an answer
    pub fn timeout(&self) -> Duration {self.timeout}
    pub fn is_open(&self) -> bool {self.port.is_some()}

    /// drop the port, further exchanges fail with [TransportError::Closed]
    pub fn close(&mut self) {
        if self.port.take().is_some() {
            info!("serial port {} closed", self.name);
        }
    }

    fn port(&mut self) -> Result<&mut S, TransportError> {
        self.port.as_mut().ok_or(TransportError::Closed)
    }

    /// write exactly the given bytes, any failure closes the port
    pub async fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let deadline = self.timeout;
        let port = self.port()?;
        let written = timeout(deadline, async {
                let written = port.write(data).await?;
                port.flush().await?;
                Ok::<_, io::Error>(written)
            }).await;
        let result = match written {
            Err(_) => Err(TransportError::WriteTimeout),
            Ok(Err(error)) => Err(TransportError::Io(error)),
            Ok(Ok(written)) if written != data.len() => Err(TransportError::ShortWrite {written, expected: data.len()}),
            Ok(Ok(_)) => Ok(()),
        };
        match &result {
            Ok(()) => debug!("serial TX ({} bytes): {}", data.len(), hex::encode(data)),
            Err(error) => {
                error!("serial write on {} failed: {}", self.name, error);
                self.close();
            },
        }
        result
    }

    /**
        block until exactly `size` bytes arrived or `deadline` elapsed

        receiving nothing and receiving part of the expected bytes are reported distinctly.
        Only I/O failures close the port.
    */
    pub async fn receive_exactly(&mut self, size: usize, deadline: Duration) -> Result<Vec<u8>, TransportError> {
        let now = Instant::now();
        let end = now.checked_add(deadline).unwrap_or(now + FAR_FUTURE);
        let port = self.port()?;
        let mut received = vec![0; size];
        let mut filled = 0;
        let mut failure = None;
        while filled < size {
            match timeout_at(end, port.read(&mut received[filled ..])).await {
                Err(_) => break,
                Ok(Ok(0)) => {
                    failure = Some(io::Error::from(io::ErrorKind::UnexpectedEof));
                    break
                },
                Ok(Ok(count)) => filled += count,
                Ok(Err(error)) => {
                    failure = Some(error);
                    break
                },
            }
        }
        if let Some(error) = failure {
            error!("serial read on {} failed: {}", self.name, error);
            self.close();
            return Err(TransportError::Io(error));
        }
        if filled == 0 && size != 0 {
            return Err(TransportError::NoData {expected: size});
        }
        received.truncate(filled);
        if filled < size {
            return Err(TransportError::PartialRead {expected: size, received});
        }
        debug!("serial RX ({} bytes): {}", size, hex::encode(&received));
        Ok(received)
    }

    /**
        discard whatever is pending in the input

        bytes are read until none arrive during a short delay, this is only meant to resynchronize after a protocol violation.
        Returns the number of bytes discarded.
    */
    pub async fn flush_unexpected(&mut self) -> usize {
        let Ok(port) = self.port() else {return 0};
        let mut junk = Vec::new();
        let mut chunk = [0u8; 256];
        let mut failure = None;
        while junk.len() < FLUSH_LIMIT {
            match timeout(FLUSH_TIMEOUT, port.read(&mut chunk)).await {
                Err(_) | Ok(Ok(0)) => break,
                Ok(Ok(count)) => junk.extend_from_slice(&chunk[.. count]),
                Ok(Err(error)) => {
                    failure = Some(error);
                    break
                },
            }
        }
        if !junk.is_empty() {
            warn!("flushed {} unexpected bytes from {}: {}", junk.len(), self.name, hex::encode(&junk));
        }
        if let Some(error) = failure {
            error!("serial flush on {} failed: {}", self.name, error);
            self.close();
        }
        junk.len()
    }
}
