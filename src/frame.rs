/*!
    frames exchanged with the motor board over uart

    every frame is terminated by a checksum byte which is the bitwise xor of all the preceding bytes of the same frame.

    - write request: `[WRITE, address, length, data.., checksum]`, answered by an acknowledgment `[address, status, checksum]`
    - read request: `[READ, address, length, checksum]`, answered by a response `[address, length, data.., checksum]`
*/

use core::fmt;
use thiserror::Error;


/// request code for reading registers
pub const READ: u8 = 0x01;
/// request code for writing registers
pub const WRITE: u8 = 0x02;
/// maximum number of data bytes a frame can carry
pub const MAX_PAYLOAD: usize = 16;
/// size of a write acknowledgment
pub const ACK_SIZE: usize = 3;
/// acknowledgment status for an accepted write
pub const ACK_ACCEPTED: u8 = 0x00;
/// acknowledgment status for a rejected write
pub const ACK_REJECTED: u8 = 0xFF;

/// bitwise xor of all given bytes, 0 for an empty slice
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0, |checksum, byte| checksum ^ byte)
}

/// size of the response to a read request of `length` bytes
pub const fn read_response_size(length: usize) -> usize {
    2 + length + 1
}


/// error detected while assembling or checking a frame
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("checksum mismatch, computed {computed:#04x} but received {received:#04x}")]
    ChecksumMismatch { computed: u8, received: u8 },
    #[error("{field} mismatch, expected {expected:#04x} but received {received:#04x}")]
    FieldMismatch { field: Field, expected: u8, received: u8 },
    #[error("unknown acknowledgment status {0:#04x}")]
    UnknownStatus(u8),
    #[error("payload of {0} bytes exceeds the {MAX_PAYLOAD} bytes limit")]
    PayloadTooLong(usize),
    #[error("frame has {received} bytes where {expected} were expected")]
    Truncated { expected: usize, received: usize },
}

/// header field of a reply which did not match the request
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Field {
    Address,
    Length,
}
impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::Address => f.write_str("address"),
            Field::Length => f.write_str("length"),
        }
    }
}

/// decoded status of a write acknowledgment
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AckStatus {
    Accepted,
    Rejected,
}

/// write acknowledgment sent back by the board
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct WriteAck {
    pub address: u8,
    pub status: AckStatus,
}


fn check_payload(length: usize) -> Result<u8, FrameError> {
    if length > MAX_PAYLOAD {
        return Err(FrameError::PayloadTooLong(length));
    }
    Ok(length as u8)
}

fn seal(mut frame: Vec<u8>) -> Vec<u8> {
    frame.push(checksum(&frame));
    frame
}

/// split a received frame into its body and checksum, failing on checksum mismatch
fn verify(frame: &[u8], expected: usize) -> Result<&[u8], FrameError> {
    if frame.len() != expected {
        return Err(FrameError::Truncated { expected, received: frame.len() });
    }
    let (body, received) = frame.split_at(frame.len() - 1);
    let computed = checksum(body);
    if computed != received[0] {
        return Err(FrameError::ChecksumMismatch { computed, received: received[0] });
    }
    Ok(body)
}

fn expect_field(field: Field, expected: u8, received: u8) -> Result<(), FrameError> {
    if expected != received {
        return Err(FrameError::FieldMismatch { field, expected, received });
    }
    Ok(())
}


/// assemble a request writing `data` starting at register `address`
pub fn encode_write(address: u8, data: &[u8]) -> Result<Vec<u8>, FrameError> {
    let length = check_payload(data.len())?;
    let mut frame = Vec::with_capacity(3 + data.len() + 1);
    frame.extend_from_slice(&[WRITE, address, length]);
    frame.extend_from_slice(data);
    Ok(seal(frame))
}

/// assemble a request reading `length` bytes starting at register `address`
pub fn encode_read(address: u8, length: usize) -> Result<Vec<u8>, FrameError> {
    let length = check_payload(length)?;
    Ok(seal(vec![READ, address, length]))
}

/// assemble the acknowledgment the board sends after a write
pub fn encode_write_ack(address: u8, status: u8) -> Vec<u8> {
    seal(vec![address, status])
}

/// assemble the response the board sends after a read
pub fn encode_read_response(address: u8, data: &[u8]) -> Result<Vec<u8>, FrameError> {
    let length = check_payload(data.len())?;
    let mut frame = Vec::with_capacity(read_response_size(data.len()));
    frame.extend_from_slice(&[address, length]);
    frame.extend_from_slice(data);
    Ok(seal(frame))
}

/**
    check a write acknowledgment received for register `address`

    the checksum is verified first, then the address. A status other than accepted or rejected is a protocol violation.
*/
pub fn decode_write_ack(frame: &[u8], address: u8) -> Result<WriteAck, FrameError> {
    let body = verify(frame, ACK_SIZE)?;
    expect_field(Field::Address, address, body[0])?;
    let status = match body[1] {
        ACK_ACCEPTED => AckStatus::Accepted,
        ACK_REJECTED => AckStatus::Rejected,
        other => return Err(FrameError::UnknownStatus(other)),
    };
    Ok(WriteAck { address: body[0], status })
}

/**
    check a read response for `length` bytes at register `address` and return its data

    the checksum is verified first, then the address and length fields.
*/
pub fn decode_read_response(frame: &[u8], address: u8, length: usize) -> Result<&[u8], FrameError> {
    let expected_length = check_payload(length)?;
    let body = verify(frame, read_response_size(length))?;
    expect_field(Field::Address, address, body[0])?;
    expect_field(Field::Length, expected_length, body[1])?;
    Ok(&body[2 ..])
}
