//! Framing for the boot ROM's command mode.
//!
//! On the wire a packet is
//!
//! ```text
//! start | len (u16, big endian) | command | payload... | checksum | ETX
//! ```
//!
//! where `len` counts the command byte plus the payload, and the checksum is
//! the two's complement of the byte sum of `len`, `command` and `payload`.
//! Hosts open commands with SOH; everything else (status, acks and data, in
//! both directions) opens with SOD.

use crate::{Cmd, Error};

pub const SOH: u8 = 0x01;
pub const SOD: u8 = 0x81;
pub const ETX: u8 = 0x03;

/// Bytes in a packet besides the command and payload.
pub const OVERHEAD: usize = 5;

/// Error status responses set this bit in the echoed command.
pub const STATUS_ERROR: u8 = 0x80;

/// Error code for "serial programmer connection prohibited", which is what
/// an ID-code-protected part answers until it is unlocked.
pub const ERR_PROHIBITED: u8 = 0xDC;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum Frame {
    Command = SOH,
    Data = SOD,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Packet {
    pub frame: Frame,
    pub command: u8,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn command(cmd: Cmd, payload: &[u8]) -> Self {
        Packet { frame: Frame::Command, command: cmd as u8, payload: payload.to_vec() }
    }

    pub fn data(command: u8, payload: &[u8]) -> Self {
        Packet { frame: Frame::Data, command, payload: payload.to_vec() }
    }

    /// The status packet that acknowledges `cmd`. The host sends the same
    /// thing back to ask for the next piece of a multi-part response.
    pub fn ack(cmd: Cmd) -> Self {
        Packet::data(cmd as u8, &[])
    }

    /// Error status for `cmd` with the given code.
    pub fn error(cmd: Cmd, code: u8) -> Self {
        Packet::data(cmd as u8 | STATUS_ERROR, &[code])
    }

    /// # Panics
    ///
    /// If the payload doesn't fit the 16-bit length field.
    pub fn encode(&self) -> Vec<u8> {
        let len = u16::try_from(self.payload.len() + 1)
            .expect("payload too long for 16-bit length field");

        let mut out = Vec::with_capacity(self.payload.len() + 1 + OVERHEAD);
        out.push(self.frame as u8);
        out.extend(len.to_be_bytes());
        out.push(self.command);
        out.extend_from_slice(&self.payload);
        out.push(checksum(&out[1..]));
        out.push(ETX);
        out
    }

    /// Data length announced by the three-byte head of a packet (start and
    /// length field), not counting the command byte.
    pub fn announced_payload_len(head: [u8; 3]) -> Result<usize, Error> {
        match usize::from(u16::from_be_bytes([head[1], head[2]])).checked_sub(1) {
            Some(len) if head[0] == SOH || head[0] == SOD => Ok(len),
            Some(_) => Err(Error::Framing { reason: "bad start byte", bytes: head.to_vec() }),
            None => Err(Error::Framing { reason: "zero length", bytes: head.to_vec() }),
        }
    }
}

/// Two's complement of the byte sum.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0_u8, |sum, byte| sum.wrapping_sub(*byte))
}

/// Checks framing and checksum of a received packet and takes it apart.
///
/// Nothing from a packet that fails here should be trusted.
pub fn verify(bytes: &[u8]) -> Result<Packet, Error> {
    let malformed = |reason: &'static str| Error::Framing { reason, bytes: bytes.to_vec() };

    if bytes.len() < OVERHEAD + 1 {
        return Err(malformed("too short"));
    }
    let frame = match bytes[0] {
        SOH => Frame::Command,
        SOD => Frame::Data,
        _ => return Err(malformed("bad start byte")),
    };
    if bytes[bytes.len() - 1] != ETX {
        return Err(malformed("missing ETX"));
    }
    let len = usize::from(u16::from_be_bytes([bytes[1], bytes[2]]));
    if len == 0 || len + OVERHEAD != bytes.len() {
        return Err(malformed("length field disagrees with frame size"));
    }

    let body = &bytes[1..bytes.len() - 2];
    let carried = bytes[bytes.len() - 2];
    let computed = checksum(body);
    if carried != computed {
        return Err(Error::Checksum { expected: carried, actual: computed });
    }

    Ok(Packet {
        frame,
        command: body[2],
        payload: body[3..].to_vec(),
    })
}
