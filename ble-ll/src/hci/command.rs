//! HCI command decoding and dispatch.
//!
//! Every command is answered with exactly one *Command Complete* or *Command Status* event. The
//! commands that kick off a control procedure on a connection reply with *Command Status* and
//! report their outcome later through a dedicated event.

use crate::{
    bytes::*,
    config::{Config, MAX_CONNECTIONS},
    hci::ErrorCode,
    link::{
        adv::own_address,
        channel_map::ChannelMap,
        llcp::{ConnParamData, LengthData},
        AddressKind, DeviceAddress, FeatureSet, LinkLayer,
    },
    time::Timer,
    utils::HexSlice,
    Error, BLUETOOTH_VERSION,
};
use heapless::Vec;
use rand_core::RngCore;

/// Maximum length of the return parameters following the status byte.
const MAX_RSP_LEN: usize = 64;

/// Return parameters of a *Command Complete* event.
type Rsp = Vec<u8, MAX_RSP_LEN>;

/// Largest data channel payload the controller supports.
const SUPP_MAX_OCTETS: u16 = 251;

/// Transmission time of a `SUPP_MAX_OCTETS` PDU on the 1M PHY, in µs.
const SUPP_MAX_TIME: u16 = 2120;

/// Bits set in the *Read Local Supported Commands* bitmap, as (octet, bit mask).
const SUPPORTED_COMMANDS: &[(usize, u8)] = &[
    // Disconnect
    (0, 1 << 5),
    // Read Remote Version Information
    (2, 1 << 7),
    // Set Event Mask, Reset
    (5, (1 << 6) | (1 << 7)),
    // Read Local Version Information, Read Local Supported Features
    (14, (1 << 3) | (1 << 5)),
    // Read BD_ADDR
    (15, 1 << 1),
    // LE Set Event Mask to LE Read Adv Channel TX Power, minus Read Local Supported Commands
    (25, 0b1111_0111),
    (26, 0b1100_1111),
    (27, 0b1010_1111),
    // LE Remote Conn Param Request Reply to LE Read Suggested Default Data Length
    (33, 0b1111_0000),
    (34, 1 << 0),
    // LE Read Maximum Data Length
    (35, 1 << 3),
];

enum_with_unknown! {
    /// HCI command opcodes understood by the controller.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum Opcode(u16) {
        Disconnect = 0x0406,
        ReadRemoteVersion = 0x041D,

        SetEventMask = 0x0C01,
        Reset = 0x0C03,

        ReadLocalVersion = 0x1001,
        ReadLocalSupportedCommands = 0x1002,
        ReadLocalSupportedFeatures = 0x1003,
        ReadBdAddr = 0x1009,

        LeSetEventMask = 0x2001,
        LeReadBufferSize = 0x2002,
        LeReadLocalSupportedFeatures = 0x2003,
        LeSetRandomAddress = 0x2005,
        LeSetAdvParams = 0x2006,
        LeReadAdvTxPower = 0x2007,
        LeSetAdvData = 0x2008,
        LeSetScanRspData = 0x2009,
        LeSetAdvEnable = 0x200A,
        LeSetScanParams = 0x200B,
        LeSetScanEnable = 0x200C,
        LeCreateConnection = 0x200D,
        LeReadWhiteListSize = 0x200F,
        LeClearWhiteList = 0x2010,
        LeAddToWhiteList = 0x2011,
        LeRemoveFromWhiteList = 0x2012,
        LeConnectionUpdate = 0x2013,
        LeSetHostChannelClassification = 0x2014,
        LeReadRemoteFeatures = 0x2016,
        LeRand = 0x2018,
        LeRemoteConnParamReqReply = 0x2020,
        LeRemoteConnParamReqNegReply = 0x2021,
        LeSetDataLength = 0x2022,
        LeReadSuggestedDefaultDataLength = 0x2023,
        LeWriteSuggestedDefaultDataLength = 0x2024,
        LeReadMaxDataLength = 0x202F,
    }
}

impl Opcode {
    /// Returns the Opcode Group Field.
    pub fn ogf(&self) -> u8 {
        (u16::from(*self) >> 10) as u8
    }

    /// Returns the Opcode Command Field.
    pub fn ocf(&self) -> u16 {
        u16::from(*self) & 0x3FF
    }

    /// Returns the exact parameter length of the command, or `None` if it is not supported.
    pub fn params_len(&self) -> Option<usize> {
        use self::Opcode::*;

        Some(match self {
            Reset
            | ReadLocalVersion
            | ReadLocalSupportedCommands
            | ReadLocalSupportedFeatures
            | ReadBdAddr
            | LeReadBufferSize
            | LeReadLocalSupportedFeatures
            | LeReadAdvTxPower
            | LeReadWhiteListSize
            | LeClearWhiteList
            | LeRand
            | LeReadSuggestedDefaultDataLength
            | LeReadMaxDataLength => 0,
            LeSetAdvEnable => 1,
            ReadRemoteVersion | LeReadRemoteFeatures | LeSetScanEnable => 2,
            Disconnect | LeRemoteConnParamReqNegReply => 3,
            LeWriteSuggestedDefaultDataLength => 4,
            LeSetHostChannelClassification => 5,
            LeSetDataLength | LeSetRandomAddress => 6,
            LeSetScanParams | LeAddToWhiteList | LeRemoveFromWhiteList => 7,
            SetEventMask | LeSetEventMask => 8,
            LeConnectionUpdate | LeRemoteConnParamReqReply => 14,
            LeSetAdvParams => 15,
            LeCreateConnection => 25,
            LeSetAdvData | LeSetScanRspData => 32,
            Unknown(_) => return None,
        })
    }

    /// Returns whether the command is answered with *Command Status* instead of
    /// *Command Complete*.
    pub fn replies_with_status(&self) -> bool {
        use self::Opcode::*;

        match self {
            Disconnect
            | ReadRemoteVersion
            | LeCreateConnection
            | LeConnectionUpdate
            | LeReadRemoteFeatures => true,
            _ => false,
        }
    }

    /// Returns whether the *Command Complete* event carries the connection handle, even when the
    /// command fails.
    pub fn echoes_handle(&self) -> bool {
        use self::Opcode::*;

        match self {
            LeRemoteConnParamReqReply | LeRemoteConnParamReqNegReply | LeSetDataLength => true,
            _ => false,
        }
    }
}

/// Builds return parameters with a `ByteWriter`.
fn rsp<F>(build: F) -> Result<Rsp, ErrorCode>
where
    F: FnOnce(&mut ByteWriter<'_>) -> Result<(), Error>,
{
    let mut buf = [0; MAX_RSP_LEN];
    let len = {
        let mut writer = ByteWriter::new(&mut buf);
        build(&mut writer)?;
        MAX_RSP_LEN - writer.space_left()
    };
    Rsp::from_slice(&buf[..len]).map_err(|_| ErrorCode::Unspecified)
}

fn read_address(bytes: &mut ByteReader<'_>) -> Result<DeviceAddress, ErrorCode> {
    let kind = match bytes.read_u8()? {
        0 => AddressKind::Public,
        1 => AddressKind::Random,
        _ => return Err(ErrorCode::InvalidParameters),
    };
    Ok(DeviceAddress::new(bytes.read_array()?, kind))
}

fn check_data_len(octets: u16, time: u16) -> Result<(), ErrorCode> {
    let len = LengthData {
        max_rx_octets: octets,
        max_rx_time: time,
        max_tx_octets: octets,
        max_tx_time: time,
    };
    if len.is_valid() {
        Ok(())
    } else {
        Err(ErrorCode::InvalidParameters)
    }
}

impl<C: Config> LinkLayer<C> {
    /// Processes an HCI command packet (opcode, parameter length, parameters).
    ///
    /// The reply is queued as an HCI event and delivered during the next `run_task` call. An error
    /// is returned only if the packet itself is malformed or the reply could not be queued.
    pub fn hci_command(&mut self, packet: &[u8]) -> Result<(), Error> {
        let mut bytes = ByteReader::new(packet);
        let raw = bytes.read_u16_le()?;
        let len = bytes.read_u8()?;
        let params = bytes.read_rest();
        if params.len() != usize::from(len) {
            return Err(Error::InvalidLength);
        }

        let opcode = Opcode::from(raw);
        debug!("hci: {:?} {:?}", opcode, HexSlice(params));

        let checked = match opcode.params_len() {
            None => Err(ErrorCode::UnknownCommand),
            Some(n) if n != params.len() => Err(ErrorCode::InvalidParameters),
            Some(_) => Ok(()),
        };

        if opcode.replies_with_status() {
            if let Err(status) = checked.and_then(|()| self.status_command(opcode, params)) {
                debug!("hci: {:?} failed: {:?}", opcode, status);
                self.events.command_status(raw, status)?;
            }
        } else {
            match checked.and_then(|()| self.complete_command(opcode, params)) {
                Ok(rsp) => self.events.command_complete(raw, ErrorCode::Success, &rsp)?,
                Err(status) => {
                    debug!("hci: {:?} failed: {:?}", opcode, status);
                    let ret = match params.get(..2) {
                        Some(handle) if opcode.echoes_handle() => handle,
                        _ => &[][..],
                    };
                    self.events.command_complete(raw, status, ret)?;
                }
            }
        }
        Ok(())
    }

    /// Runs a command answered with *Command Status*.
    ///
    /// Parameters are validated first. Only when they are fine is the success status queued, so
    /// that any events caused by the command follow it.
    fn status_command(&mut self, opcode: Opcode, params: &[u8]) -> Result<(), ErrorCode> {
        let mut bytes = ByteReader::new(params);
        match opcode {
            Opcode::Disconnect => {
                let handle = bytes.read_u16_le()?;
                let reason = ErrorCode::from(bytes.read_u8()?);
                self.connection(handle)
                    .ok_or(ErrorCode::UnknownConnectionId)?
                    .check_terminate()?;
                if !reason.is_disconnect_reason() {
                    return Err(ErrorCode::InvalidParameters);
                }

                self.command_ok(opcode)?;
                self.with_conn(handle, |conn, ctx| conn.host_terminate(reason, ctx));
            }
            Opcode::ReadRemoteVersion => {
                let handle = bytes.read_u16_le()?;
                self.connection(handle)
                    .ok_or(ErrorCode::UnknownConnectionId)?;

                self.command_ok(opcode)?;
                self.with_conn(handle, |conn, ctx| conn.host_read_version(ctx));
            }
            Opcode::LeReadRemoteFeatures => {
                let handle = bytes.read_u16_le()?;
                self.connection(handle)
                    .ok_or(ErrorCode::UnknownConnectionId)?;

                self.command_ok(opcode)?;
                self.with_conn(handle, |conn, ctx| conn.host_read_features(ctx));
            }
            Opcode::LeConnectionUpdate => {
                let handle = bytes.read_u16_le()?;
                let params = ConnParamData::new(
                    bytes.read_u16_le()?,
                    bytes.read_u16_le()?,
                    bytes.read_u16_le()?,
                    bytes.read_u16_le()?,
                );
                // Minimum/maximum CE length are accepted but not used.
                if !params.is_valid() {
                    return Err(ErrorCode::InvalidParameters);
                }
                self.connection(handle)
                    .ok_or(ErrorCode::UnknownConnectionId)?
                    .check_conn_update(&self.settings)?;

                self.command_ok(opcode)?;
                self.with_conn(handle, |conn, ctx| conn.host_conn_update(params, ctx));
            }
            Opcode::LeCreateConnection => {
                // The initiator state is not implemented.
                return Err(ErrorCode::UnknownCommand);
            }
            _ => return Err(ErrorCode::UnknownCommand),
        }
        Ok(())
    }

    fn command_ok(&mut self, opcode: Opcode) -> Result<(), ErrorCode> {
        self.events
            .command_status(opcode.into(), ErrorCode::Success)
            .map_err(ErrorCode::from)
    }

    /// Runs a command answered with *Command Complete*, returning its return parameters.
    fn complete_command(&mut self, opcode: Opcode, params: &[u8]) -> Result<Rsp, ErrorCode> {
        let mut bytes = ByteReader::new(params);
        match opcode {
            Opcode::SetEventMask => {
                self.events.set_event_mask(bytes.read_u64_le()?);
            }
            Opcode::Reset => self.reset(),

            Opcode::ReadLocalVersion => {
                let settings = &self.settings;
                return rsp(|w| {
                    w.write_u8(BLUETOOTH_VERSION.into())?;
                    w.write_u16_le(settings.sub_version)?;
                    w.write_u8(BLUETOOTH_VERSION.into())?;
                    w.write_u16_le(settings.company_id)?;
                    w.write_u16_le(settings.sub_version)
                });
            }
            Opcode::ReadLocalSupportedCommands => {
                let mut commands = [0; 64];
                for &(octet, bits) in SUPPORTED_COMMANDS {
                    commands[octet] |= bits;
                }
                return rsp(|w| w.write_slice(&commands));
            }
            Opcode::ReadLocalSupportedFeatures => {
                // BR/EDR not supported, LE supported (controller)
                return rsp(|w| w.write_slice(&[0, 0, 0, 0, 0x60, 0, 0, 0]));
            }
            Opcode::ReadBdAddr => {
                let addr = self.settings.public_addr;
                return rsp(|w| w.write_slice(addr.raw()));
            }

            Opcode::LeSetEventMask => {
                self.events.set_le_event_mask(bytes.read_u64_le()?);
            }
            Opcode::LeReadBufferSize => {
                let settings = &self.settings;
                return rsp(|w| {
                    w.write_u16_le(settings.acl_buf_len)?;
                    w.write_u8(settings.acl_buf_count)
                });
            }
            Opcode::LeReadLocalSupportedFeatures => {
                let features: FeatureSet = self.settings.supported_features;
                return rsp(|w| features.to_bytes(w));
            }
            Opcode::LeSetRandomAddress => {
                if self.adv.is_enabled() || self.scan.is_enabled() {
                    return Err(ErrorCode::CommandDisallowed);
                }
                self.random_addr = Some(DeviceAddress::new(
                    bytes.read_array()?,
                    AddressKind::Random,
                ));
            }
            Opcode::LeReadAdvTxPower => {
                let power = self.settings.adv_tx_power;
                return rsp(|w| w.write_i8(power));
            }
            Opcode::LeRand => {
                let mut random = [0; 8];
                self.rng.fill_bytes(&mut random);
                return rsp(|w| w.write_slice(&random));
            }

            Opcode::LeSetAdvParams => self.adv.set_params(params)?,
            Opcode::LeSetAdvData => self.adv.set_adv_data(params)?,
            Opcode::LeSetScanRspData => self.adv.set_scan_rsp_data(params)?,
            Opcode::LeSetAdvEnable => match bytes.read_u8()? {
                0 => self.adv.stop(&mut self.sched, &mut self.timer),
                1 if self.adv.is_enabled() => {}
                1 => {
                    let own_type = self
                        .adv
                        .params()
                        .ok_or(ErrorCode::CommandDisallowed)?
                        .own_addr_type;
                    let addr = own_address(own_type, &self.settings, self.random_addr)?;
                    let now = self.timer.now();
                    self.adv.start(addr, now + self.settings.tx_sched_delay)?;
                    self.schedule_adv(now);
                }
                _ => return Err(ErrorCode::InvalidParameters),
            },

            Opcode::LeSetScanParams => self.scan.set_params(params)?,
            Opcode::LeSetScanEnable => {
                let enable = bytes.read_u8()?;
                let filter_dups = bytes.read_u8()?;
                if enable > 1 || filter_dups > 1 {
                    return Err(ErrorCode::InvalidParameters);
                }

                if enable == 0 {
                    self.scan
                        .stop(&mut self.sched, &mut self.timer, &mut self.radio);
                } else if self.scan.is_enabled() {
                    self.scan.set_filter_dups(filter_dups == 1);
                } else {
                    let own_type = self.scan.params().own_addr_type;
                    let addr = own_address(own_type, &self.settings, self.random_addr)?;
                    let now = self.timer.now();
                    self.scan.start(addr, filter_dups == 1, now);
                    self.schedule_scan(now);
                }
            }

            Opcode::LeReadWhiteListSize => {
                let size = self.whitelist.capacity() as u8;
                return rsp(|w| w.write_u8(size));
            }
            Opcode::LeClearWhiteList => {
                self.check_whitelist_unused()?;
                self.whitelist.clear();
            }
            Opcode::LeAddToWhiteList => {
                let addr = read_address(&mut bytes)?;
                self.check_whitelist_unused()?;
                self.whitelist.add(addr)?;
            }
            Opcode::LeRemoveFromWhiteList => {
                let addr = read_address(&mut bytes)?;
                self.check_whitelist_unused()?;
                // Removing an address that is not in the list is not an error.
                self.whitelist.remove(&addr).ok();
            }

            Opcode::LeSetHostChannelClassification => {
                let map = ChannelMap::from_raw(bytes.read_array()?);
                if !map.is_valid() {
                    return Err(ErrorCode::InvalidParameters);
                }
                let handles: Vec<u16, MAX_CONNECTIONS> =
                    self.conns.iter().map(|c| c.handle()).collect();
                for handle in handles {
                    self.with_conn(handle, |conn, ctx| conn.host_set_chan_map(map, ctx));
                }
            }
            Opcode::LeRemoteConnParamReqReply => {
                let handle = bytes.read_u16_le()?;
                let params = ConnParamData::new(
                    bytes.read_u16_le()?,
                    bytes.read_u16_le()?,
                    bytes.read_u16_le()?,
                    bytes.read_u16_le()?,
                );
                if !params.is_valid() {
                    return Err(ErrorCode::InvalidParameters);
                }
                self.with_conn(handle, |conn, ctx| conn.host_param_reply(Ok(params), ctx))
                    .ok_or(ErrorCode::UnknownConnectionId)??;
                return rsp(|w| w.write_u16_le(handle));
            }
            Opcode::LeRemoteConnParamReqNegReply => {
                let handle = bytes.read_u16_le()?;
                let reason = ErrorCode::from(bytes.read_u8()?);
                self.with_conn(handle, |conn, ctx| conn.host_param_reply(Err(reason), ctx))
                    .ok_or(ErrorCode::UnknownConnectionId)??;
                return rsp(|w| w.write_u16_le(handle));
            }
            Opcode::LeSetDataLength => {
                let handle = bytes.read_u16_le()?;
                let tx_octets = bytes.read_u16_le()?;
                let tx_time = bytes.read_u16_le()?;
                check_data_len(tx_octets, tx_time)?;
                self.with_conn(handle, |conn, ctx| {
                    conn.host_set_data_len(tx_octets, tx_time, ctx)
                })
                .ok_or(ErrorCode::UnknownConnectionId)?;
                return rsp(|w| w.write_u16_le(handle));
            }
            Opcode::LeReadSuggestedDefaultDataLength => {
                let (octets, time) = self.suggested_len;
                return rsp(|w| {
                    w.write_u16_le(octets)?;
                    w.write_u16_le(time)
                });
            }
            Opcode::LeWriteSuggestedDefaultDataLength => {
                let octets = bytes.read_u16_le()?;
                let time = bytes.read_u16_le()?;
                check_data_len(octets, time)?;
                self.suggested_len = (octets, time);
            }
            Opcode::LeReadMaxDataLength => {
                return rsp(|w| {
                    w.write_u16_le(SUPP_MAX_OCTETS)?;
                    w.write_u16_le(SUPP_MAX_TIME)?;
                    w.write_u16_le(SUPP_MAX_OCTETS)?;
                    w.write_u16_le(SUPP_MAX_TIME)
                });
            }

            _ => return Err(ErrorCode::UnknownCommand),
        }
        Ok(Rsp::new())
    }

    fn check_whitelist_unused(&self) -> Result<(), ErrorCode> {
        if self.adv.uses_whitelist() || self.scan.uses_whitelist() {
            Err(ErrorCode::CommandDisallowed)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Opcode;
    use crate::{
        hci::ErrorCode,
        link::{channel_map::ChannelMap, ConnParams, LinkLayer, Role},
        testing::{link_layer, TestConfig},
        Error,
    };

    fn cmd(ll: &mut LinkLayer<TestConfig>, opcode: Opcode, params: &[u8]) {
        let mut packet = vec![0; 3];
        packet[..2].copy_from_slice(&u16::from(opcode).to_le_bytes());
        packet[2] = params.len() as u8;
        packet.extend_from_slice(params);
        ll.hci_command(&packet).unwrap();
    }

    /// Runs the LL task and returns the events delivered to the host.
    fn events(ll: &mut LinkLayer<TestConfig>) -> std::vec::Vec<std::vec::Vec<u8>> {
        ll.run_task();
        ll.transport().events.drain(..).collect()
    }

    /// Returns the status of the single *Command Complete* event delivered.
    fn cc_status(ll: &mut LinkLayer<TestConfig>) -> ErrorCode {
        let events = events(ll);
        assert_eq!(events.len(), 1, "{:?}", events);
        assert_eq!(events[0][0], 0x0E);
        ErrorCode::from(events[0][5])
    }

    fn connect(ll: &mut LinkLayer<TestConfig>) -> u16 {
        let params = ConnParams {
            interval: 40,
            latency: 0,
            timeout: 400,
        };
        ll.connection_created(Role::Master, params, ChannelMap::with_all_channels())
            .unwrap()
    }

    #[test]
    fn opcode_fields() {
        assert_eq!(Opcode::LeSetAdvEnable.ogf(), 0x08);
        assert_eq!(Opcode::LeSetAdvEnable.ocf(), 0x000A);
        assert_eq!(Opcode::Reset.ogf(), 0x03);
    }

    #[test]
    fn unknown_command() {
        let mut ll = link_layer();
        let packet = [0x99, 0x20, 0];
        ll.hci_command(&packet).unwrap();
        assert_eq!(events(&mut ll), vec![vec![0x0E, 4, 1, 0x99, 0x20, 0x01]]);
    }

    #[test]
    fn truncated_packet() {
        let mut ll = link_layer();
        assert_eq!(ll.hci_command(&[0x03, 0x0C, 1]), Err(Error::InvalidLength));
        assert_eq!(ll.hci_command(&[0x03]), Err(Error::Eof));
    }

    #[test]
    fn wrong_params_len() {
        let mut ll = link_layer();
        cmd(&mut ll, Opcode::LeSetAdvEnable, &[1, 0]);
        assert_eq!(cc_status(&mut ll), ErrorCode::InvalidParameters);

        cmd(&mut ll, Opcode::Disconnect, &[0, 0]);
        assert_eq!(events(&mut ll), vec![vec![0x0F, 4, 0x12, 1, 0x06, 0x04]]);
    }

    #[test]
    fn read_local_version() {
        let mut ll = link_layer();
        ll.settings.company_id = 0x0059;
        ll.settings.sub_version = 0x1234;
        cmd(&mut ll, Opcode::ReadLocalVersion, &[]);
        assert_eq!(
            events(&mut ll),
            vec![vec![
                0x0E, 12, 1, 0x01, 0x10, 0x00, 8, 0x34, 0x12, 8, 0x59, 0x00, 0x34, 0x12
            ]]
        );
    }

    #[test]
    fn supported_commands() {
        let mut ll = link_layer();
        cmd(&mut ll, Opcode::ReadLocalSupportedCommands, &[]);
        let events = events(&mut ll);
        let rsp = &events[0][6..];
        assert_eq!(rsp.len(), 64);
        assert_eq!(rsp[0], 0x20);
        assert_eq!(rsp[5], 0xC0);
        assert_eq!(rsp[25], 0xF7);
        assert_eq!(rsp[35], 0x08);
    }

    #[test]
    fn random_address() {
        let mut ll = link_layer();
        // ADV_IND, own address random
        let adv_params = [0x20, 0, 0x30, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 7, 0];
        cmd(&mut ll, Opcode::LeSetAdvParams, &adv_params);
        assert_eq!(cc_status(&mut ll), ErrorCode::Success);

        cmd(&mut ll, Opcode::LeSetAdvEnable, &[1]);
        assert_eq!(cc_status(&mut ll), ErrorCode::CommandDisallowed);
        assert!(!ll.advertiser().is_enabled());

        cmd(&mut ll, Opcode::LeSetRandomAddress, &[1, 2, 3, 4, 5, 0xC6]);
        assert_eq!(cc_status(&mut ll), ErrorCode::Success);
        cmd(&mut ll, Opcode::LeSetAdvEnable, &[1]);
        assert_eq!(cc_status(&mut ll), ErrorCode::Success);
        assert!(ll.advertiser().is_enabled());

        cmd(&mut ll, Opcode::LeSetRandomAddress, &[6, 5, 4, 3, 2, 0xC1]);
        assert_eq!(cc_status(&mut ll), ErrorCode::CommandDisallowed);
        assert_eq!(
            ll.random_address().unwrap().raw(),
            &[1, 2, 3, 4, 5, 0xC6]
        );
    }

    #[test]
    fn whitelist_commands() {
        let mut ll = link_layer();
        cmd(&mut ll, Opcode::LeReadWhiteListSize, &[]);
        let events = events(&mut ll);
        assert_eq!(events[0][6], crate::config::WHITELIST_SIZE as u8);

        cmd(&mut ll, Opcode::LeAddToWhiteList, &[2, 1, 2, 3, 4, 5, 6]);
        assert_eq!(cc_status(&mut ll), ErrorCode::InvalidParameters);

        for i in 0..crate::config::WHITELIST_SIZE as u8 {
            cmd(&mut ll, Opcode::LeAddToWhiteList, &[0, i, 2, 3, 4, 5, 6]);
            assert_eq!(cc_status(&mut ll), ErrorCode::Success);
        }
        cmd(&mut ll, Opcode::LeAddToWhiteList, &[1, 0, 2, 3, 4, 5, 6]);
        assert_eq!(cc_status(&mut ll), ErrorCode::MemoryCapacityExceeded);

        cmd(&mut ll, Opcode::LeRemoveFromWhiteList, &[0, 0, 2, 3, 4, 5, 6]);
        assert_eq!(cc_status(&mut ll), ErrorCode::Success);
        assert_eq!(
            ll.whitelist().len(),
            crate::config::WHITELIST_SIZE - 1
        );

        // Passive scanning, white list filter policy
        cmd(&mut ll, Opcode::LeSetScanParams, &[0, 0x10, 0, 0x10, 0, 0, 1]);
        assert_eq!(cc_status(&mut ll), ErrorCode::Success);
        cmd(&mut ll, Opcode::LeSetScanEnable, &[1, 0]);
        assert_eq!(cc_status(&mut ll), ErrorCode::Success);
        cmd(&mut ll, Opcode::LeClearWhiteList, &[]);
        assert_eq!(cc_status(&mut ll), ErrorCode::CommandDisallowed);
        assert!(!ll.whitelist().is_empty());
    }

    #[test]
    fn scan_enable_values() {
        let mut ll = link_layer();
        cmd(&mut ll, Opcode::LeSetScanEnable, &[2, 0]);
        assert_eq!(cc_status(&mut ll), ErrorCode::InvalidParameters);
        cmd(&mut ll, Opcode::LeSetScanEnable, &[1, 0]);
        assert_eq!(cc_status(&mut ll), ErrorCode::Success);
        assert!(ll.scanner().is_enabled());

        cmd(&mut ll, Opcode::LeSetScanParams, &[1, 0x10, 0, 0x10, 0, 0, 0]);
        assert_eq!(cc_status(&mut ll), ErrorCode::CommandDisallowed);

        cmd(&mut ll, Opcode::LeSetScanEnable, &[0, 0]);
        assert_eq!(cc_status(&mut ll), ErrorCode::Success);
        assert!(!ll.scanner().is_enabled());
        assert!(ll.next_wakeup().is_none());
    }

    #[test]
    fn disconnect() {
        let mut ll = link_layer();
        cmd(&mut ll, Opcode::Disconnect, &[5, 0, 0x13]);
        assert_eq!(events(&mut ll), vec![vec![0x0F, 4, 0x02, 1, 0x06, 0x04]]);

        let handle = connect(&mut ll);
        let h = handle.to_le_bytes();
        cmd(&mut ll, Opcode::Disconnect, &[h[0], h[1], 0x08]);
        assert_eq!(events(&mut ll), vec![vec![0x0F, 4, 0x12, 1, 0x06, 0x04]]);

        cmd(&mut ll, Opcode::Disconnect, &[h[0], h[1], 0x13]);
        assert_eq!(events(&mut ll), vec![vec![0x0F, 4, 0x00, 1, 0x06, 0x04]]);
        // LL_TERMINATE_IND with the host's reason
        let pdu = ll.next_ctrl_pdu(handle).unwrap();
        assert_eq!(&pdu[2..], &[0x02, 0x13]);

        ll.ctrl_tx_done(handle).unwrap();
        assert!(ll.connection(handle).is_none());
        assert_eq!(events(&mut ll), vec![vec![0x05, 4, 0x00, h[0], h[1], 0x16]]);
    }

    #[test]
    fn read_remote_features_then_cached() {
        let mut ll = link_layer();
        cmd(&mut ll, Opcode::SetEventMask, &0x2000_1FFF_FFFF_FFFFu64.to_le_bytes());
        assert_eq!(cc_status(&mut ll), ErrorCode::Success);

        let handle = connect(&mut ll);
        let h = handle.to_le_bytes();
        cmd(&mut ll, Opcode::LeReadRemoteFeatures, &h);
        assert_eq!(events(&mut ll), vec![vec![0x0F, 4, 0x00, 1, 0x16, 0x20]]);

        // LL_FEATURE_REQ goes out, the peer answers with LL_FEATURE_RSP
        let pdu = ll.next_ctrl_pdu(handle).unwrap();
        assert_eq!(pdu[2], 0x08);
        ll.ctrl_tx_done(handle).unwrap();
        ll.ctrl_pdu_rx(handle, &[0x09, 0x21, 0, 0, 0, 0, 0, 0, 0])
            .unwrap();
        let reported = ll.transport().take_le(0x04);
        assert!(reported.is_empty());
        ll.run_task();
        let reported = ll.transport().take_le(0x04);
        assert_eq!(reported.len(), 1);
        assert_eq!(&reported[0][3..6], &[0x00, h[0], h[1]]);

        // Known now, so the second request is answered without any PDU
        cmd(&mut ll, Opcode::LeReadRemoteFeatures, &h);
        ll.run_task();
        assert_eq!(ll.transport().take_le(0x04).len(), 1);
        assert!(ll.next_ctrl_pdu(handle).is_none());
    }

    #[test]
    fn conn_param_reply_without_request() {
        let mut ll = link_layer();
        let handle = connect(&mut ll);
        let h = handle.to_le_bytes();
        cmd(&mut ll, Opcode::LeRemoteConnParamReqNegReply, &[h[0], h[1], 0x3B]);
        assert_eq!(
            events(&mut ll),
            vec![vec![0x0E, 6, 1, 0x21, 0x20, 0x0C, h[0], h[1]]]
        );

        cmd(&mut ll, Opcode::LeRemoteConnParamReqNegReply, &[7, 0, 0x3B]);
        assert_eq!(
            events(&mut ll),
            vec![vec![0x0E, 6, 1, 0x21, 0x20, 0x02, 7, 0]]
        );
    }

    #[test]
    fn suggested_data_length() {
        let mut ll = link_layer();
        cmd(&mut ll, Opcode::LeWriteSuggestedDefaultDataLength, &[252, 0, 0x48, 0x08]);
        assert_eq!(cc_status(&mut ll), ErrorCode::InvalidParameters);

        cmd(&mut ll, Opcode::LeWriteSuggestedDefaultDataLength, &[251, 0, 0x48, 0x08]);
        assert_eq!(cc_status(&mut ll), ErrorCode::Success);
        cmd(&mut ll, Opcode::LeReadSuggestedDefaultDataLength, &[]);
        let events = events(&mut ll);
        assert_eq!(&events[0][6..], &[251, 0, 0x48, 0x08]);

        let handle = connect(&mut ll);
        let len = ll.connection(handle).unwrap().local_data_len();
        assert_eq!((len.max_tx_octets, len.max_tx_time), (251, 2120));
    }

    #[test]
    fn reset_restores_defaults() {
        let mut ll = link_layer();
        cmd(&mut ll, Opcode::LeSetRandomAddress, &[1, 2, 3, 4, 5, 0xC6]);
        cmd(&mut ll, Opcode::LeAddToWhiteList, &[0, 1, 2, 3, 4, 5, 6]);
        cmd(&mut ll, Opcode::LeSetScanEnable, &[1, 0]);
        let handle = connect(&mut ll);
        events(&mut ll);

        cmd(&mut ll, Opcode::Reset, &[]);
        assert_eq!(cc_status(&mut ll), ErrorCode::Success);
        assert!(!ll.scanner().is_enabled());
        assert!(ll.whitelist().is_empty());
        assert!(ll.random_address().is_none());
        assert!(ll.connection(handle).is_none());
        assert!(ll.next_wakeup().is_none());
    }
}
