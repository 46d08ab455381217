//! Defines packet structures used by the Link Layer Control Protocol.

use crate::{
    bytes::*,
    hci::ErrorCode,
    link::{
        channel_map::ChannelMap,
        data::{Header, Llid},
        features::FeatureSet,
    },
    time::Duration,
    utils::Hex,
    Error,
};
use heapless::Vec;

/// Largest control PDU payload (opcode and `CtrData`) the controller sends or accepts.
pub const MAX_CTRL_PAYLOAD: usize = 1 + 23;

/// Size of a buffer holding a complete control PDU including its data channel header.
pub const MAX_CTRL_PDU: usize = 2 + MAX_CTRL_PAYLOAD;

/// A data channel PDU carrying an LL Control PDU, ready for transmission.
pub type CtrlPduBuf = Vec<u8, MAX_CTRL_PDU>;

/// Data transmitted with an `LL_CONNECTION_UPDATE_IND` Control PDU, containing a new set of
/// connection parameters.
///
/// All fields are in their on-air units (1.25 ms for window and interval, 10 ms for the timeout).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ConnectionUpdateData {
    pub win_size: u8,
    pub win_offset: u16,
    pub interval: u16,
    pub latency: u16,
    pub timeout: u16,
    pub instant: u16,
}

impl ConnectionUpdateData {
    /// Returns the duration between connection events.
    pub fn interval(&self) -> Duration {
        Duration::from_micros(u32::from(self.interval) * 1_250)
    }

    /// Returns the connection supervision timeout (`connSupervisionTimeout`).
    pub fn timeout(&self) -> Duration {
        Duration::from_micros(u32::from(self.timeout) * 10_000)
    }
}

/// Parameters carried by `LL_CONNECTION_PARAM_REQ` and `LL_CONNECTION_PARAM_RSP`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ConnParamData {
    pub interval_min: u16,
    pub interval_max: u16,
    pub latency: u16,
    pub timeout: u16,
    pub preferred_periodicity: u8,
    pub reference_conn_event_count: u16,
    pub offsets: [u16; 6],
}

impl ConnParamData {
    /// Creates parameters for the given connection interval range, latency and supervision
    /// timeout, without any preferred anchor point offsets.
    pub fn new(interval_min: u16, interval_max: u16, latency: u16, timeout: u16) -> Self {
        Self {
            interval_min,
            interval_max,
            latency,
            timeout,
            preferred_periodicity: 0,
            reference_conn_event_count: 0,
            offsets: [0xFFFF; 6],
        }
    }

    /// Checks the parameter ranges required for connection parameters.
    ///
    /// Intervals are 7.5 ms to 4 s, latency at most 499 and the timeout between 100 ms and 32 s.
    /// The timeout must also be longer than the time covered by latency and interval.
    pub fn is_valid(&self) -> bool {
        let ok_itvl = |i: u16| (0x0006..=0x0C80).contains(&i);
        if !ok_itvl(self.interval_min) || !ok_itvl(self.interval_max) {
            return false;
        }
        if self.interval_min > self.interval_max || self.latency > 0x01F3 {
            return false;
        }
        if !(0x000A..=0x0C80).contains(&self.timeout) {
            return false;
        }

        // timeout (10 ms units) > (1 + latency) * interval_max (1.25 ms units) * 2
        u32::from(self.timeout) * 4 > (1 + u32::from(self.latency)) * u32::from(self.interval_max)
    }
}

/// Parameters carried by `LL_LENGTH_REQ` and `LL_LENGTH_RSP`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct LengthData {
    pub max_rx_octets: u16,
    pub max_rx_time: u16,
    pub max_tx_octets: u16,
    pub max_tx_time: u16,
}

impl LengthData {
    /// Returns whether all values are within the ranges allowed on the air: 27 to 251 octets and
    /// 328 to 2120 µs.
    pub fn is_valid(&self) -> bool {
        let ok_octets = |o: u16| (27..=251).contains(&o);
        let ok_time = |t: u16| (328..=2120).contains(&t);
        ok_octets(self.max_rx_octets)
            && ok_octets(self.max_tx_octets)
            && ok_time(self.max_rx_time)
            && ok_time(self.max_tx_time)
    }
}

/// A structured representation of an LL Control PDU used by the Link Layer Control Protocol (LLCP).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ControlPdu<'a> {
    /// `0x00`/`LL_CONNECTION_UPDATE_IND` - Update connection parameters.
    ///
    /// Sent by the master. The slave does not send a response back.
    ConnectionUpdateInd(ConnectionUpdateData),

    /// `0x01`/`LL_CHANNEL_MAP_IND` - Update the channel map.
    ///
    /// Sent by the master. The slave does not send a response back.
    ChannelMapInd { map: ChannelMap, instant: u16 },

    /// `0x02`/`LL_TERMINATE_IND` - Close the connection.
    TerminateInd { error_code: ErrorCode },

    /// `0x07`/`LL_UNKNOWN_RSP` - Response to unknown/unsupported LL Control PDUs.
    UnknownRsp {
        /// Opcode of the unknown PDU.
        unknown_type: ControlOpcode,
    },

    /// `0x08`/`LL_FEATURE_REQ` - Master requests slave's features.
    FeatureReq { features: FeatureSet },

    /// `0x09`/`LL_FEATURE_RSP` - Answer to `LL_FEATURE_REQ` and `LL_SLAVE_FEATURE_REQ`.
    FeatureRsp { features: FeatureSet },

    /// `0x0C`/`LL_VERSION_IND` - Bluetooth version indication (sent by both master and slave).
    VersionInd {
        vers_nr: VersionNumber,
        comp_id: Hex<u16>,
        sub_vers_nr: Hex<u16>,
    },

    /// `0x0D`/`LL_REJECT_IND`
    RejectInd { error_code: ErrorCode },

    /// `0x0E`/`LL_SLAVE_FEATURE_REQ` - Slave-initiated feature exchange.
    SlaveFeatureReq { features: FeatureSet },

    /// `0x0F`/`LL_CONNECTION_PARAM_REQ`
    ConnectionParamReq(ConnParamData),

    /// `0x10`/`LL_CONNECTION_PARAM_RSP`
    ConnectionParamRsp(ConnParamData),

    /// `0x11`/`LL_REJECT_IND_EXT` - Rejects a specific control procedure.
    RejectIndExt {
        reject_opcode: ControlOpcode,
        error_code: ErrorCode,
    },

    /// `0x12`/`LL_PING_REQ`
    PingReq,

    /// `0x13`/`LL_PING_RSP`
    PingRsp,

    /// `0x14`/`LL_LENGTH_REQ`
    LengthReq(LengthData),

    /// `0x15`/`LL_LENGTH_RSP`
    LengthRsp(LengthData),

    /// Catch-all variant for opcodes the controller does not decode (eg. encryption).
    Unknown {
        /// The opcode. This can also be the `Unknown` variant.
        opcode: ControlOpcode,

        /// Additional data depending on the opcode.
        ctr_data: &'a [u8],
    },
}

impl ControlPdu<'_> {
    /// Returns the opcode of this LL Control PDU.
    pub fn opcode(&self) -> ControlOpcode {
        match self {
            ControlPdu::ConnectionUpdateInd(_) => ControlOpcode::ConnectionUpdateInd,
            ControlPdu::ChannelMapInd { .. } => ControlOpcode::ChannelMapInd,
            ControlPdu::TerminateInd { .. } => ControlOpcode::TerminateInd,
            ControlPdu::UnknownRsp { .. } => ControlOpcode::UnknownRsp,
            ControlPdu::FeatureReq { .. } => ControlOpcode::FeatureReq,
            ControlPdu::FeatureRsp { .. } => ControlOpcode::FeatureRsp,
            ControlPdu::VersionInd { .. } => ControlOpcode::VersionInd,
            ControlPdu::RejectInd { .. } => ControlOpcode::RejectInd,
            ControlPdu::SlaveFeatureReq { .. } => ControlOpcode::SlaveFeatureReq,
            ControlPdu::ConnectionParamReq(_) => ControlOpcode::ConnectionParamReq,
            ControlPdu::ConnectionParamRsp(_) => ControlOpcode::ConnectionParamRsp,
            ControlPdu::RejectIndExt { .. } => ControlOpcode::RejectIndExt,
            ControlPdu::PingReq => ControlOpcode::PingReq,
            ControlPdu::PingRsp => ControlOpcode::PingRsp,
            ControlPdu::LengthReq(_) => ControlOpcode::LengthReq,
            ControlPdu::LengthRsp(_) => ControlOpcode::LengthRsp,
            ControlPdu::Unknown { opcode, .. } => *opcode,
        }
    }

    /// Encodes this PDU behind a data channel header with `LLID` set to *LL Control*.
    pub fn to_data_pdu(&self) -> Result<CtrlPduBuf, Error> {
        let mut buf = [0; MAX_CTRL_PDU];
        let len = {
            let mut writer = ByteWriter::new(&mut buf[2..]);
            self.to_bytes(&mut writer)?;
            MAX_CTRL_PAYLOAD - writer.space_left()
        };

        let mut header = Header::new(Llid::Control);
        header.set_payload_length(len as u8);
        buf[..2].copy_from_slice(&header.to_u16().to_le_bytes());
        Vec::from_slice(&buf[..2 + len]).map_err(|_| Error::Eof)
    }
}

impl<'a> FromBytes<'a> for ControlPdu<'a> {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        let opcode = ControlOpcode::from(bytes.read_u8()?);
        Ok(match opcode {
            ControlOpcode::ConnectionUpdateInd => {
                ControlPdu::ConnectionUpdateInd(ConnectionUpdateData {
                    win_size: bytes.read_u8()?,
                    win_offset: bytes.read_u16_le()?,
                    interval: bytes.read_u16_le()?,
                    latency: bytes.read_u16_le()?,
                    timeout: bytes.read_u16_le()?,
                    instant: bytes.read_u16_le()?,
                })
            }
            ControlOpcode::ChannelMapInd => ControlPdu::ChannelMapInd {
                map: ChannelMap::from_raw(bytes.read_array()?),
                instant: bytes.read_u16_le()?,
            },
            ControlOpcode::TerminateInd => ControlPdu::TerminateInd {
                error_code: ErrorCode::from(bytes.read_u8()?),
            },
            ControlOpcode::UnknownRsp => ControlPdu::UnknownRsp {
                unknown_type: ControlOpcode::from(bytes.read_u8()?),
            },
            ControlOpcode::FeatureReq => ControlPdu::FeatureReq {
                features: FeatureSet::from_bytes(bytes)?,
            },
            ControlOpcode::FeatureRsp => ControlPdu::FeatureRsp {
                features: FeatureSet::from_bytes(bytes)?,
            },
            ControlOpcode::SlaveFeatureReq => ControlPdu::SlaveFeatureReq {
                features: FeatureSet::from_bytes(bytes)?,
            },
            ControlOpcode::VersionInd => ControlPdu::VersionInd {
                vers_nr: VersionNumber::from(bytes.read_u8()?),
                comp_id: Hex(bytes.read_u16_le()?),
                sub_vers_nr: Hex(bytes.read_u16_le()?),
            },
            ControlOpcode::RejectInd => ControlPdu::RejectInd {
                error_code: ErrorCode::from(bytes.read_u8()?),
            },
            ControlOpcode::ConnectionParamReq => {
                ControlPdu::ConnectionParamReq(read_conn_params(bytes)?)
            }
            ControlOpcode::ConnectionParamRsp => {
                ControlPdu::ConnectionParamRsp(read_conn_params(bytes)?)
            }
            ControlOpcode::RejectIndExt => ControlPdu::RejectIndExt {
                reject_opcode: ControlOpcode::from(bytes.read_u8()?),
                error_code: ErrorCode::from(bytes.read_u8()?),
            },
            ControlOpcode::PingReq => ControlPdu::PingReq,
            ControlOpcode::PingRsp => ControlPdu::PingRsp,
            ControlOpcode::LengthReq => ControlPdu::LengthReq(read_length(bytes)?),
            ControlOpcode::LengthRsp => ControlPdu::LengthRsp(read_length(bytes)?),
            _ => ControlPdu::Unknown {
                opcode,
                ctr_data: bytes.read_rest(),
            },
        })
    }
}

fn read_conn_params(bytes: &mut ByteReader<'_>) -> Result<ConnParamData, Error> {
    let mut data = ConnParamData {
        interval_min: bytes.read_u16_le()?,
        interval_max: bytes.read_u16_le()?,
        latency: bytes.read_u16_le()?,
        timeout: bytes.read_u16_le()?,
        preferred_periodicity: bytes.read_u8()?,
        reference_conn_event_count: bytes.read_u16_le()?,
        offsets: [0; 6],
    };
    for offset in data.offsets.iter_mut() {
        *offset = bytes.read_u16_le()?;
    }
    Ok(data)
}

fn read_length(bytes: &mut ByteReader<'_>) -> Result<LengthData, Error> {
    Ok(LengthData {
        max_rx_octets: bytes.read_u16_le()?,
        max_rx_time: bytes.read_u16_le()?,
        max_tx_octets: bytes.read_u16_le()?,
        max_tx_time: bytes.read_u16_le()?,
    })
}

impl<'a> ToBytes for ControlPdu<'a> {
    fn to_bytes(&self, buffer: &mut ByteWriter<'_>) -> Result<(), Error> {
        buffer.write_u8(self.opcode().into())?;
        match self {
            ControlPdu::ConnectionUpdateInd(data) => {
                buffer.write_u8(data.win_size)?;
                buffer.write_u16_le(data.win_offset)?;
                buffer.write_u16_le(data.interval)?;
                buffer.write_u16_le(data.latency)?;
                buffer.write_u16_le(data.timeout)?;
                buffer.write_u16_le(data.instant)
            }
            ControlPdu::ChannelMapInd { map, instant } => {
                buffer.write_slice(&map.to_raw())?;
                buffer.write_u16_le(*instant)
            }
            ControlPdu::TerminateInd { error_code } | ControlPdu::RejectInd { error_code } => {
                buffer.write_u8(u8::from(*error_code))
            }
            ControlPdu::UnknownRsp { unknown_type } => buffer.write_u8(u8::from(*unknown_type)),
            ControlPdu::FeatureReq { features }
            | ControlPdu::FeatureRsp { features }
            | ControlPdu::SlaveFeatureReq { features } => features.to_bytes(buffer),
            ControlPdu::VersionInd {
                vers_nr,
                comp_id,
                sub_vers_nr,
            } => {
                buffer.write_u8(u8::from(*vers_nr))?;
                buffer.write_u16_le(comp_id.0)?;
                buffer.write_u16_le(sub_vers_nr.0)
            }
            ControlPdu::ConnectionParamReq(data) | ControlPdu::ConnectionParamRsp(data) => {
                buffer.write_u16_le(data.interval_min)?;
                buffer.write_u16_le(data.interval_max)?;
                buffer.write_u16_le(data.latency)?;
                buffer.write_u16_le(data.timeout)?;
                buffer.write_u8(data.preferred_periodicity)?;
                buffer.write_u16_le(data.reference_conn_event_count)?;
                for offset in &data.offsets {
                    buffer.write_u16_le(*offset)?;
                }
                Ok(())
            }
            ControlPdu::RejectIndExt {
                reject_opcode,
                error_code,
            } => {
                buffer.write_u8(u8::from(*reject_opcode))?;
                buffer.write_u8(u8::from(*error_code))
            }
            ControlPdu::PingReq | ControlPdu::PingRsp => Ok(()),
            ControlPdu::LengthReq(data) | ControlPdu::LengthRsp(data) => {
                buffer.write_u16_le(data.max_rx_octets)?;
                buffer.write_u16_le(data.max_rx_time)?;
                buffer.write_u16_le(data.max_tx_octets)?;
                buffer.write_u16_le(data.max_tx_time)
            }
            ControlPdu::Unknown { ctr_data, .. } => buffer.write_slice(ctr_data),
        }
    }
}

enum_with_unknown! {
    /// Enumeration of all known LL Control PDU opcodes (not all of which might be supported).
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum ControlOpcode(u8) {
        ConnectionUpdateInd = 0x00,
        ChannelMapInd = 0x01,
        TerminateInd = 0x02,
        EncReq = 0x03,
        EncRsp = 0x04,
        StartEncReq = 0x05,
        StartEncRsp = 0x06,
        UnknownRsp = 0x07,
        FeatureReq = 0x08,
        FeatureRsp = 0x09,
        PauseEncReq = 0x0A,
        PauseEncRsp = 0x0B,
        VersionInd = 0x0C,
        RejectInd = 0x0D,
        SlaveFeatureReq = 0x0E,
        ConnectionParamReq = 0x0F,
        ConnectionParamRsp = 0x10,
        RejectIndExt = 0x11,
        PingReq = 0x12,
        PingRsp = 0x13,
        LengthReq = 0x14,
        LengthRsp = 0x15,
    }
}

impl ControlOpcode {
    /// Returns the length of the `CtrData` field that follows this opcode.
    ///
    /// Returns `None` for opcodes the controller does not know.
    pub fn ctr_data_len(&self) -> Option<usize> {
        use self::ControlOpcode::*;

        Some(match self {
            ConnectionUpdateInd => 1 + 2 + 2 + 2 + 2 + 2,
            ChannelMapInd => 5 + 2,
            TerminateInd => 1,
            EncReq => 8 + 2 + 8 + 4,
            EncRsp => 8 + 4,
            StartEncReq | StartEncRsp => 0,
            UnknownRsp => 1,
            FeatureReq | FeatureRsp => 8,
            PauseEncReq | PauseEncRsp => 0,
            VersionInd => 1 + 2 + 2,
            RejectInd => 1,
            SlaveFeatureReq => 8,
            ConnectionParamReq | ConnectionParamRsp => 2 + 2 + 2 + 2 + 1 + 2 + 6 * 2,
            RejectIndExt => 1 + 1,
            PingReq | PingRsp => 0,
            LengthReq | LengthRsp => 2 + 2 + 2 + 2,
            Unknown(_) => return None,
        })
    }

    /// Returns the Link-Layer feature a controller must support to accept this opcode.
    pub fn required_feature(&self) -> Option<FeatureSet> {
        use self::ControlOpcode::*;

        match self {
            EncReq | EncRsp | StartEncReq | StartEncRsp | PauseEncReq | PauseEncRsp => {
                Some(FeatureSet::LE_ENCRYPTION)
            }
            ConnectionParamReq | ConnectionParamRsp => Some(FeatureSet::CONN_PARAM_REQ),
            RejectIndExt => Some(FeatureSet::EXTENDED_REJECT_INDICATION),
            SlaveFeatureReq => Some(FeatureSet::SLAVE_FEATURE_EXCHANGE),
            PingReq | PingRsp => Some(FeatureSet::LE_PING),
            LengthReq | LengthRsp => Some(FeatureSet::LE_PACKET_LENGTH_EXTENSION),
            _ => None,
        }
    }
}

enum_with_unknown! {
    /// Enumeration of all possible `VersNr` for `LL_VERSION_IND` PDUs.
    ///
    /// According to https://www.bluetooth.com/specifications/assigned-numbers/link-layer
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum VersionNumber(u8) {
        V4_0 = 6,
        V4_1 = 7,
        V4_2 = 8,
        V5_0 = 9,
        V5_1 = 10,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(payload: &[u8]) -> ControlPdu<'_> {
        let mut reader = ByteReader::new(payload);
        let pdu = ControlPdu::from_bytes(&mut reader).unwrap();
        reader.finish().unwrap();
        pdu
    }

    #[test]
    fn length_table_matches_codec() {
        let pdus = [
            ControlPdu::TerminateInd {
                error_code: ErrorCode::RemoteUserTerminated,
            },
            ControlPdu::ConnectionParamReq(ConnParamData::new(6, 12, 0, 100)),
            ControlPdu::RejectIndExt {
                reject_opcode: ControlOpcode::ConnectionParamReq,
                error_code: ErrorCode::LmpCollision,
            },
            ControlPdu::LengthRsp(LengthData {
                max_rx_octets: 27,
                max_rx_time: 328,
                max_tx_octets: 251,
                max_tx_time: 2120,
            }),
            ControlPdu::PingRsp,
        ];
        for pdu in &pdus {
            let buf = pdu.to_data_pdu().unwrap();
            let expected = pdu.opcode().ctr_data_len().unwrap();
            assert_eq!(usize::from(buf[1]), 1 + expected, "{:?}", pdu);
            assert_eq!(parse(&buf[2..]), *pdu);
        }
    }

    #[test]
    fn reject_ind_ext_wire_format() {
        let pdu = ControlPdu::RejectIndExt {
            reject_opcode: ControlOpcode::ConnectionParamReq,
            error_code: ErrorCode::DifferentTransactionCollision,
        };
        assert_eq!(&pdu.to_data_pdu().unwrap()[..], &[0x03, 3, 0x11, 0x0F, 0x2A]);
    }

    #[test]
    fn undecoded_opcodes() {
        assert_eq!(
            parse(&[0x05]),
            ControlPdu::Unknown {
                opcode: ControlOpcode::StartEncReq,
                ctr_data: &[],
            }
        );
        assert_eq!(ControlOpcode::from(0x16).ctr_data_len(), None);
        assert_eq!(
            ControlOpcode::PingReq.required_feature(),
            Some(FeatureSet::LE_PING)
        );
        assert_eq!(ControlOpcode::VersionInd.required_feature(), None);
    }

    #[test]
    fn length_ranges() {
        let mut data = LengthData {
            max_rx_octets: 27,
            max_rx_time: 328,
            max_tx_octets: 27,
            max_tx_time: 328,
        };
        assert!(data.is_valid());
        data.max_rx_octets = 20;
        assert!(!data.is_valid());
        data.max_rx_octets = 251;
        data.max_tx_time = 2121;
        assert!(!data.is_valid());
    }

    #[test]
    fn conn_param_ranges() {
        assert!(ConnParamData::new(6, 12, 0, 100).is_valid());
        // 1 s timeout, 4 s interval
        assert!(!ConnParamData::new(6, 3200, 0, 100).is_valid());
        assert!(!ConnParamData::new(12, 6, 0, 100).is_valid());
        assert!(!ConnParamData::new(5, 6, 0, 100).is_valid());
    }
}
