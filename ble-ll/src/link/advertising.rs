//! Advertising channel operations.
//!
//! This module defines PDUs, states and fields used by packets transmitted on the advertising
//! channels. Generally, this includes everything needed to advertise, to scan for advertisers, and
//! to recognize connection requests.
//!
//! Note that while the types in here do not completely eliminate illegal values to be created, they
//! do employ a range of sanity checks that prevent bogus packets from being sent by the
//! controller.

use crate::{
    bytes::*,
    link::{AddressKind, DeviceAddress},
    utils::HexSlice,
    Error,
};
use byteorder::{ByteOrder, LittleEndian};
use core::fmt;
use heapless::Vec;

/// Access Address to use for all advertising channel packets.
pub const ACCESS_ADDRESS: u32 = 0x8E89BED6;

/// CRC initialization value for advertising channel packets.
///
/// Data channel packets use a CRC init value chosen by the connection initiator.
pub const CRC_PRESET: u32 = 0x555555;

/// Maximum amount of payload data in an advertising channel PDU.
pub const MAX_PAYLOAD_SIZE: usize = 37;

/// Maximum size of an advertising channel PDU, including its header.
pub const MAX_PDU_SIZE: usize = 2 + MAX_PAYLOAD_SIZE;

/// Maximum amount of advertising or scan response data (the part after `AdvA`).
pub const MAX_ADV_DATA: usize = 31;

/// Length of the `LLData` field in a `CONNECT_REQ`.
const LLDATA_LEN: usize = 22;

/// 16-bit Advertising Channel PDU header preceding the Payload.
///
/// The header looks like this:
///
/// ```notrust
/// LSB                                                                     MSB
/// +------------+------------+---------+---------+--------------+------------+
/// |  PDU Type  |     -      |  TxAdd  |  RxAdd  |    Length    |     -      |
/// |  (4 bits)  |  (2 bits)  | (1 bit) | (1 bit) |   (6 bits)   |  (2 bits)  |
/// +------------+------------+---------+---------+--------------+------------+
/// ```
///
/// The `TxAdd` and `RxAdd` field are only used for some payloads, for all others, they should be
/// set to 0.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Header(u16);

const TXADD_MASK: u16 = 0b00000000_01000000;
const RXADD_MASK: u16 = 0b00000000_10000000;
const LENGTH_MASK: u16 = 0b00111111_00000000;

impl Header {
    /// Creates a new Advertising Channel PDU header specifying the Payload type `ty`.
    pub fn new(ty: PduType) -> Self {
        Header(u16::from(u8::from(ty)))
    }

    /// Parses a header from the first 2 bytes of `raw`.
    ///
    /// Returns `None` if `raw` is too short.
    pub fn parse(raw: &[u8]) -> Option<Self> {
        if raw.len() < 2 {
            None
        } else {
            Some(Header(LittleEndian::read_u16(raw)))
        }
    }

    /// Returns the raw representation of the header.
    ///
    /// The returned `u16` must be transmitted LSb first as the first 2 octets of the PDU.
    pub fn to_u16(&self) -> u16 {
        self.0
    }

    /// Returns the PDU type specified in the header.
    pub fn type_(&self) -> PduType {
        PduType::from((self.0 & 0b00000000_00001111) as u8)
    }

    /// Returns the state of the `TxAdd` field.
    pub fn tx_add(&self) -> bool {
        self.0 & TXADD_MASK != 0
    }

    /// Sets the `TxAdd` field's value.
    pub fn set_tx_add(&mut self, value: bool) {
        if value {
            self.0 |= TXADD_MASK;
        } else {
            self.0 &= !TXADD_MASK;
        }
    }

    /// Returns the state of the `RxAdd` field.
    pub fn rx_add(&self) -> bool {
        self.0 & RXADD_MASK != 0
    }

    /// Sets the `RxAdd` field's value.
    pub fn set_rx_add(&mut self, value: bool) {
        if value {
            self.0 |= RXADD_MASK;
        } else {
            self.0 &= !RXADD_MASK;
        }
    }

    /// Returns the length of the payload in octets as specified in the `Length` field.
    pub fn payload_length(&self) -> u8 {
        ((self.0 & LENGTH_MASK) >> 8) as u8
    }

    /// Sets the payload length of this PDU.
    ///
    /// Only the low 6 bits of `length` are used.
    pub fn set_payload_length(&mut self, length: u8) {
        self.0 = (self.0 & !LENGTH_MASK) | ((u16::from(length) << 8) & LENGTH_MASK);
    }
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Header")
            .field("PDU Type", &self.type_())
            .field("TxAdd", &self.tx_add())
            .field("RxAdd", &self.rx_add())
            .field("len", &self.payload_length())
            .finish()
    }
}

enum_with_unknown! {
    /// 4-bit PDU type in `Header`.
    ///
    /// `Adv*` type PDUs are sent while in Advertising state.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum PduType(u8) {
        /// Connectable undirected advertising event.
        AdvInd = 0b0000,
        /// Connectable directed advertising event.
        AdvDirectInd = 0b0001,
        /// Non-connectable undirected advertising event.
        AdvNonconnInd = 0b0010,
        /// Scan request, sent by an active scanner.
        ScanReq = 0b0011,
        /// Response to a scan request.
        ScanRsp = 0b0100,
        /// Connection request, sent by an initiator.
        ConnectReq = 0b0101,
        /// Scannable undirected advertising event.
        AdvScanInd = 0b0110,
    }
}

/// An advertising channel PDU (header and payload) ready to be handed to the radio.
#[derive(Clone, PartialEq, Eq)]
pub struct PduBuf(Vec<u8, MAX_PDU_SIZE>);

impl PduBuf {
    fn build(
        ty: PduType,
        tx_addr: DeviceAddress,
        rx_addr: Option<DeviceAddress>,
        data: &[u8],
    ) -> Result<Self, Error> {
        if data.len() > MAX_ADV_DATA {
            return Err(Error::InvalidLength);
        }

        let mut header = Header::new(ty);
        header.set_tx_add(tx_addr.is_random());
        header.set_rx_add(rx_addr.map_or(false, |addr| addr.is_random()));
        let len = 6 + rx_addr.map_or(0, |_| 6) + data.len();
        header.set_payload_length(len as u8);

        let mut buf = Vec::new();
        let extend = |buf: &mut Vec<u8, MAX_PDU_SIZE>, bytes: &[u8]| {
            buf.extend_from_slice(bytes).map_err(|_| Error::Eof)
        };
        extend(&mut buf, &header.to_u16().to_le_bytes())?;
        extend(&mut buf, tx_addr.raw())?;
        if let Some(rx_addr) = rx_addr {
            extend(&mut buf, rx_addr.raw())?;
        }
        extend(&mut buf, data)?;
        Ok(PduBuf(buf))
    }

    /// Creates an undirected advertising PDU (`ADV_IND`, `ADV_NONCONN_IND` or `ADV_SCAN_IND`)
    /// carrying `adv_data`.
    pub fn undirected(ty: PduType, adv_a: DeviceAddress, adv_data: &[u8]) -> Result<Self, Error> {
        match ty {
            PduType::AdvInd | PduType::AdvNonconnInd | PduType::AdvScanInd => {
                Self::build(ty, adv_a, None, adv_data)
            }
            _ => Err(Error::InvalidValue),
        }
    }

    /// Creates an `ADV_DIRECT_IND` PDU addressed at `init_a`.
    pub fn directed(adv_a: DeviceAddress, init_a: DeviceAddress) -> Result<Self, Error> {
        Self::build(PduType::AdvDirectInd, adv_a, Some(init_a), &[])
    }

    /// Creates a `SCAN_RSP` PDU carrying `scan_data`.
    pub fn scan_response(adv_a: DeviceAddress, scan_data: &[u8]) -> Result<Self, Error> {
        Self::build(PduType::ScanRsp, adv_a, None, scan_data)
    }

    /// Creates a `SCAN_REQ` PDU sent from `scan_a` to the advertiser `adv_a`.
    pub fn scan_request(scan_a: DeviceAddress, adv_a: DeviceAddress) -> Result<Self, Error> {
        Self::build(PduType::ScanReq, scan_a, Some(adv_a), &[])
    }

    /// Copies a received PDU into a buffer.
    ///
    /// `bytes` must contain the header and exactly the amount of payload it announces.
    pub fn from_received(bytes: &[u8]) -> Result<Self, Error> {
        let header = Header::parse(bytes).ok_or(Error::Eof)?;
        if bytes.len() != 2 + usize::from(header.payload_length()) {
            return Err(Error::InvalidLength);
        }
        Vec::from_slice(bytes)
            .map(PduBuf)
            .map_err(|_| Error::InvalidLength)
    }

    pub fn header(&self) -> Header {
        Header(LittleEndian::read_u16(&self.0[..2]))
    }

    pub fn payload(&self) -> &[u8] {
        &self.0[2..]
    }

    /// Returns the raw PDU bytes (header followed by payload).
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Decodes the PDU.
    pub fn decode(&self) -> Result<Pdu<'_>, Error> {
        Pdu::from_header_and_payload(self.header(), &mut ByteReader::new(self.payload()))
    }
}

impl fmt::Debug for PduBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}, {:?}", self.header(), HexSlice(self.payload()))
    }
}

/// A parsed advertising channel PDU.
#[derive(Debug, Copy, Clone)]
pub enum Pdu<'a> {
    /// `ADV_IND`: Connectable and scannable undirected advertisement.
    ConnectableUndirected {
        advertiser_addr: DeviceAddress,
        advertising_data: &'a [u8],
    },

    /// `ADV_DIRECT_IND`: Connectable directed advertisement.
    ConnectableDirected {
        advertiser_addr: DeviceAddress,
        initiator_addr: DeviceAddress,
    },

    /// `ADV_NONCONN_IND`: Non-connectable, non-scannable undirected advertisement.
    NonconnectableUndirected {
        advertiser_addr: DeviceAddress,
        advertising_data: &'a [u8],
    },

    /// `ADV_SCAN_IND`: Scannable undirected advertisement.
    ScannableUndirected {
        advertiser_addr: DeviceAddress,
        advertising_data: &'a [u8],
    },

    /// `SCAN_REQ`
    ScanRequest {
        scanner_addr: DeviceAddress,
        advertiser_addr: DeviceAddress,
    },

    /// `SCAN_RSP`
    ScanResponse {
        advertiser_addr: DeviceAddress,
        scan_data: &'a [u8],
    },

    /// `CONNECT_REQ`
    ConnectRequest {
        initiator_addr: DeviceAddress,
        advertiser_addr: DeviceAddress,
        lldata: &'a [u8],
    },
}

impl<'a> Pdu<'a> {
    /// Parses a PDU from its header and the payload bytes following it.
    pub fn from_header_and_payload(
        header: Header,
        payload: &mut ByteReader<'a>,
    ) -> Result<Self, Error> {
        if payload.bytes_left() != usize::from(header.payload_length()) {
            return Err(Error::InvalidLength);
        }

        let tx_kind = AddressKind::from_bit(header.tx_add());
        let rx_kind = AddressKind::from_bit(header.rx_add());
        let read_addr = |payload: &mut ByteReader<'a>, kind| -> Result<DeviceAddress, Error> {
            Ok(DeviceAddress::new(payload.read_array()?, kind))
        };

        let pdu = match header.type_() {
            PduType::AdvInd => Pdu::ConnectableUndirected {
                advertiser_addr: read_addr(payload, tx_kind)?,
                advertising_data: read_adv_data(payload)?,
            },
            PduType::AdvDirectInd => Pdu::ConnectableDirected {
                advertiser_addr: read_addr(payload, tx_kind)?,
                initiator_addr: read_addr(payload, rx_kind)?,
            },
            PduType::AdvNonconnInd => Pdu::NonconnectableUndirected {
                advertiser_addr: read_addr(payload, tx_kind)?,
                advertising_data: read_adv_data(payload)?,
            },
            PduType::AdvScanInd => Pdu::ScannableUndirected {
                advertiser_addr: read_addr(payload, tx_kind)?,
                advertising_data: read_adv_data(payload)?,
            },
            PduType::ScanReq => Pdu::ScanRequest {
                scanner_addr: read_addr(payload, tx_kind)?,
                advertiser_addr: read_addr(payload, rx_kind)?,
            },
            PduType::ScanRsp => Pdu::ScanResponse {
                advertiser_addr: read_addr(payload, tx_kind)?,
                scan_data: read_adv_data(payload)?,
            },
            PduType::ConnectReq => Pdu::ConnectRequest {
                initiator_addr: read_addr(payload, tx_kind)?,
                advertiser_addr: read_addr(payload, rx_kind)?,
                lldata: payload.read_slice(LLDATA_LEN)?,
            },
            PduType::Unknown(_) => return Err(Error::InvalidValue),
        };

        payload.finish()?;
        Ok(pdu)
    }

    /// Returns the device address of the sender of this PDU.
    pub fn sender(&self) -> &DeviceAddress {
        match self {
            Pdu::ConnectableUndirected {
                advertiser_addr, ..
            }
            | Pdu::ConnectableDirected {
                advertiser_addr, ..
            }
            | Pdu::NonconnectableUndirected {
                advertiser_addr, ..
            }
            | Pdu::ScannableUndirected {
                advertiser_addr, ..
            }
            | Pdu::ScanResponse {
                advertiser_addr, ..
            } => advertiser_addr,
            Pdu::ScanRequest { scanner_addr, .. } => scanner_addr,
            Pdu::ConnectRequest { initiator_addr, .. } => initiator_addr,
        }
    }

    /// Returns the intended receiver of this PDU.
    ///
    /// This is `None` for undirected advertisements and scan responses.
    pub fn receiver(&self) -> Option<&DeviceAddress> {
        match self {
            Pdu::ConnectableDirected { initiator_addr, .. } => Some(initiator_addr),
            Pdu::ScanRequest {
                advertiser_addr, ..
            }
            | Pdu::ConnectRequest {
                advertiser_addr, ..
            } => Some(advertiser_addr),
            _ => None,
        }
    }

    /// Returns the PDU type.
    pub fn ty(&self) -> PduType {
        match self {
            Pdu::ConnectableUndirected { .. } => PduType::AdvInd,
            Pdu::ConnectableDirected { .. } => PduType::AdvDirectInd,
            Pdu::NonconnectableUndirected { .. } => PduType::AdvNonconnInd,
            Pdu::ScannableUndirected { .. } => PduType::AdvScanInd,
            Pdu::ScanRequest { .. } => PduType::ScanReq,
            Pdu::ScanResponse { .. } => PduType::ScanRsp,
            Pdu::ConnectRequest { .. } => PduType::ConnectReq,
        }
    }
}

fn read_adv_data<'a>(payload: &mut ByteReader<'a>) -> Result<&'a [u8], Error> {
    if payload.bytes_left() > MAX_ADV_DATA {
        return Err(Error::InvalidLength);
    }
    Ok(payload.read_rest())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8, kind: AddressKind) -> DeviceAddress {
        DeviceAddress::new([1, 2, 3, 4, 5, last], kind)
    }

    #[test]
    fn header_bits() {
        let mut header = Header::new(PduType::ScanReq);
        header.set_tx_add(true);
        header.set_payload_length(12);
        assert_eq!(header.to_u16(), 0x0C43);
        assert_eq!(header.type_(), PduType::ScanReq);
        assert!(header.tx_add());
        assert!(!header.rx_add());
        header.set_rx_add(true);
        assert_eq!(header.to_u16(), 0x0CC3);
    }

    #[test]
    fn scan_request_layout() {
        let scanner = addr(0xAA, AddressKind::Random);
        let advertiser = addr(0xBB, AddressKind::Public);
        let pdu = PduBuf::scan_request(scanner, advertiser).unwrap();
        let bytes = pdu.as_bytes();
        assert_eq!(bytes.len(), 14);
        assert_eq!(bytes[0], 0x43);
        assert_eq!(bytes[1], 12);
        assert_eq!(&bytes[2..8], scanner.raw());
        assert_eq!(&bytes[8..14], advertiser.raw());

        match pdu.decode().unwrap() {
            Pdu::ScanRequest {
                scanner_addr,
                advertiser_addr,
            } => {
                assert_eq!(scanner_addr, scanner);
                assert_eq!(advertiser_addr, advertiser);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn directed_sets_rx_add() {
        let pdu = PduBuf::directed(
            addr(1, AddressKind::Public),
            addr(2, AddressKind::Random),
        )
        .unwrap();
        let header = pdu.header();
        assert_eq!(header.type_(), PduType::AdvDirectInd);
        assert!(!header.tx_add());
        assert!(header.rx_add());
        assert_eq!(
            pdu.decode().unwrap().receiver(),
            Some(&addr(2, AddressKind::Random))
        );
    }

    #[test]
    fn adv_data_limit() {
        let a = addr(1, AddressKind::Public);
        assert!(PduBuf::undirected(PduType::AdvInd, a, &[0; 31]).is_ok());
        assert_eq!(
            PduBuf::undirected(PduType::AdvInd, a, &[0; 32]).unwrap_err(),
            Error::InvalidLength
        );
        assert_eq!(
            PduBuf::undirected(PduType::ScanReq, a, &[]).unwrap_err(),
            Error::InvalidValue
        );
    }

    #[test]
    fn rejects_truncated_pdus() {
        // SCAN_REQ announcing 12 bytes, but only carrying 6
        let raw = [0x03, 12, 1, 2, 3, 4, 5, 6];
        assert!(PduBuf::from_received(&raw).is_err());

        // Length matches, but a SCAN_REQ needs 12 bytes
        let raw = [0x03, 6, 1, 2, 3, 4, 5, 6];
        let pdu = PduBuf::from_received(&raw).unwrap();
        assert_eq!(pdu.decode().unwrap_err(), Error::Eof);
    }
}
