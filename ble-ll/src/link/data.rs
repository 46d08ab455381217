//! Data channel PDU header.
//!
//! The controller core only exchanges LL Control PDUs on data channels; moving L2CAP data and
//! acknowledging it is the connection event engine's job. This module provides the header format
//! used to wrap outgoing control PDUs and to unwrap incoming ones.

use crate::{bytes::*, Error};
use byteorder::{ByteOrder, LittleEndian};
use core::fmt;

/// 16-bit data channel header preceding the payload.
///
/// Layout (in Bluetooth 4.2):
///
/// ```notrust
/// LSB                                                                MSB
/// +----------+---------+---------+---------+------------+--------------+
/// |   LLID   |  NESN   |   SN    |   MD    |     -      |    Length    |
/// | (2 bits) | (1 bit) | (1 bit) | (1 bit) |  (3 bits)  |   (8 bits)   |
/// +----------+---------+---------+---------+------------+--------------+
/// ```
///
/// `NESN` and `SN` are filled in by whoever transmits the PDU, since only the connection event
/// engine knows the current sequence numbers.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Header(u16);

const NESN: u16 = 0b0100;
const SN: u16 = 0b1000;
const MD: u16 = 0b10000;

impl Header {
    /// Creates a header with the given LLID field and all other fields set to 0 (including the
    /// payload length).
    pub fn new(llid: Llid) -> Self {
        Header(llid as u16)
    }

    /// Parses a header from the first 2 bytes of `raw`.
    ///
    /// Returns `None` when `raw` contains less than 2 bytes.
    pub fn parse(raw: &[u8]) -> Option<Self> {
        if raw.len() < 2 {
            None
        } else {
            Some(Header(LittleEndian::read_u16(raw)))
        }
    }

    /// Returns the raw representation of the header.
    pub fn to_u16(&self) -> u16 {
        self.0
    }

    /// Returns the length of the payload in octets as specified in the `Length` field.
    pub fn payload_length(&self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub fn set_payload_length(&mut self, len: u8) {
        self.0 = (u16::from(len) << 8) | (self.0 & 0x00ff);
    }

    /// Returns the `LLID` field (PDU type).
    pub fn llid(&self) -> Llid {
        match self.0 & 0b11 {
            0b01 => Llid::DataCont,
            0b10 => Llid::DataStart,
            0b11 => Llid::Control,
            _ => Llid::Reserved,
        }
    }

    pub fn nesn(&self) -> bool {
        self.0 & NESN != 0
    }

    pub fn sn(&self) -> bool {
        self.0 & SN != 0
    }

    pub fn set_sn(&mut self, sn: bool) {
        self.set_bit(SN, sn);
    }

    /// Returns whether the `MD` field is set (More Data).
    pub fn md(&self) -> bool {
        self.0 & MD != 0
    }

    pub fn set_md(&mut self, md: bool) {
        self.set_bit(MD, md);
    }

    fn set_bit(&mut self, mask: u16, value: bool) {
        if value {
            self.0 |= mask;
        } else {
            self.0 &= !mask;
        }
    }
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Header")
            .field("LLID", &self.llid())
            .field("NESN", &self.nesn())
            .field("SN", &self.sn())
            .field("MD", &self.md())
            .field("Length", &self.payload_length())
            .finish()
    }
}

impl<'a> FromBytes<'a> for Header {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        Ok(Header(bytes.read_u16_le()?))
    }
}

impl ToBytes for Header {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u16_le(self.to_u16())
    }
}

/// Values of the LLID field in `Header`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Llid {
    /// Reserved for future use.
    Reserved = 0b00,

    /// Continuation of L2CAP message, or empty PDU.
    DataCont = 0b01,

    /// Start of L2CAP message.
    DataStart = 0b10,

    /// LL control PDU.
    Control = 0b11,
}

/// Splits a received data channel PDU into its header and payload.
///
/// The payload length announced in the header must match the number of bytes following it.
pub fn split(pdu: &[u8]) -> Result<(Header, &[u8]), Error> {
    let header = Header::parse(pdu).ok_or(Error::Eof)?;
    let payload = &pdu[2..];
    if payload.len() != usize::from(header.payload_length()) {
        return Err(Error::InvalidLength);
    }
    Ok((header, payload))
}
