//! HCI event packets sent to the host.
//!
//! Events are built into fixed-size buffers and queued in [`HostEvents`] until the Link-Layer task
//! hands them to the [`HciTransport`]. Whether an event is generated at all is decided by the
//! event masks the host configures.
//!
//! [`HostEvents`]: struct.HostEvents.html
//! [`HciTransport`]: trait.HciTransport.html

use crate::{
    bytes::*,
    config::{EVENT_QUEUE, MAX_EVENT_LEN},
    hci::ErrorCode,
    link::{llcp::ConnParamData, llcp::VersionNumber, DeviceAddress, FeatureSet},
    Error,
};
use heapless::{Deque, Vec};

/// Sink for HCI event packets.
///
/// Implemented by the platform, for example on top of a UART H4 transport.
pub trait HciTransport {
    /// Delivers a complete event packet (event code, parameter length, parameters) to the host.
    ///
    /// If the transport cannot take the event right now, it should return an error. The event
    /// stays queued and delivery is retried during the next Link-Layer task run.
    fn send_event(&mut self, event: &[u8]) -> Result<(), Error>;
}

/// A complete HCI event packet.
pub type EventBuf = Vec<u8, MAX_EVENT_LEN>;

const EVCODE_DISCONN_CMP: u8 = 0x05;
const EVCODE_RD_REM_VER_INFO_CMP: u8 = 0x0C;
const EVCODE_COMMAND_COMPLETE: u8 = 0x0E;
const EVCODE_COMMAND_STATUS: u8 = 0x0F;
const EVCODE_LE_META: u8 = 0x3E;

/// Page 0 event mask bits.
const MASK_DISCONN_CMP: u64 = 1 << 4;
const MASK_RD_REM_VER_INFO_CMP: u64 = 1 << 11;
const MASK_LE_META: u64 = 1 << 61;

/// Default event mask after reset.
pub const DEFAULT_EVENT_MASK: u64 = 0x0000_1FFF_FFFF_FFFF;

/// Default LE event mask after reset.
pub const DEFAULT_LE_EVENT_MASK: u64 = 0x1F;

/// Number of HCI command packets the host may send before waiting for a reply.
const NUM_HCI_CMD_PKTS: u8 = 1;

enum_with_unknown! {
    /// LE Meta event subevent codes.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum LeSubevent(u8) {
        ConnectionComplete = 0x01,
        AdvertisingReport = 0x02,
        ConnectionUpdateComplete = 0x03,
        ReadRemoteFeaturesComplete = 0x04,
        LongTermKeyRequest = 0x05,
        RemoteConnParamRequest = 0x06,
        DataLengthChange = 0x07,
        DirectAdvertisingReport = 0x0B,
    }
}

/// Queue of events waiting for the host, and the masks selecting which events to generate.
pub struct HostEvents {
    queue: Deque<EventBuf, EVENT_QUEUE>,
    event_mask: u64,
    le_event_mask: u64,
    dropped: u32,
}

impl HostEvents {
    pub fn new() -> Self {
        Self {
            queue: Deque::new(),
            event_mask: DEFAULT_EVENT_MASK,
            le_event_mask: DEFAULT_LE_EVENT_MASK,
            dropped: 0,
        }
    }

    /// Restores the default masks and drops all queued events.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn set_event_mask(&mut self, mask: u64) {
        self.event_mask = mask;
    }

    pub fn set_le_event_mask(&mut self, mask: u64) {
        self.le_event_mask = mask;
    }

    /// Returns whether the host wants to receive the given LE Meta subevent.
    pub fn le_event_enabled(&self, subevent: LeSubevent) -> bool {
        let bit = u8::from(subevent).wrapping_sub(1);
        self.event_mask & MASK_LE_META != 0
            && bit < 64
            && self.le_event_mask & (1 << bit) != 0
    }

    /// Number of events dropped because the queue was full.
    pub fn dropped(&self) -> u32 {
        self.dropped
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Removes and returns the oldest queued event.
    pub fn pop(&mut self) -> Option<EventBuf> {
        self.queue.pop_front()
    }

    /// Hands queued events to `transport` until it refuses one or the queue is empty.
    pub fn flush<T: HciTransport>(&mut self, transport: &mut T) {
        while let Some(event) = self.queue.front() {
            if let Err(e) = transport.send_event(event) {
                debug!("hci: transport busy ({}), {} events queued", e, self.queue.len());
                return;
            }
            self.queue.pop_front();
        }
    }

    fn push<F>(&mut self, code: u8, build: F) -> Result<(), Error>
    where
        F: FnOnce(&mut ByteWriter<'_>) -> Result<(), Error>,
    {
        let mut buf = [0; MAX_EVENT_LEN];
        let len = {
            let mut writer = ByteWriter::new(&mut buf[2..]);
            build(&mut writer)?;
            MAX_EVENT_LEN - 2 - writer.space_left()
        };
        buf[0] = code;
        buf[1] = len as u8;

        let event = Vec::from_slice(&buf[..2 + len]).map_err(|_| Error::Eof)?;
        trace!("hci: event {:?}", crate::utils::HexSlice(&event[..]));
        self.queue.push_back(event).map_err(|_| {
            self.dropped += 1;
            warn!("hci: event queue full, dropping event {:#04x}", code);
            Error::QueueFull
        })
    }

    fn push_le<F>(&mut self, subevent: LeSubevent, build: F) -> Result<(), Error>
    where
        F: FnOnce(&mut ByteWriter<'_>) -> Result<(), Error>,
    {
        if !self.le_event_enabled(subevent) {
            return Ok(());
        }
        self.push(EVCODE_LE_META, |w| {
            w.write_u8(subevent.into())?;
            build(w)
        })
    }

    /// Queues a *Command Complete* event. `rsp` holds the return parameters following the status.
    pub fn command_complete(
        &mut self,
        opcode: u16,
        status: ErrorCode,
        rsp: &[u8],
    ) -> Result<(), Error> {
        self.push(EVCODE_COMMAND_COMPLETE, |w| {
            w.write_u8(NUM_HCI_CMD_PKTS)?;
            w.write_u16_le(opcode)?;
            w.write_u8(status.into())?;
            w.write_slice(rsp)
        })
    }

    /// Queues a *Command Status* event.
    pub fn command_status(&mut self, opcode: u16, status: ErrorCode) -> Result<(), Error> {
        self.push(EVCODE_COMMAND_STATUS, |w| {
            w.write_u8(status.into())?;
            w.write_u8(NUM_HCI_CMD_PKTS)?;
            w.write_u16_le(opcode)
        })
    }

    /// Queues a *Disconnection Complete* event.
    pub fn disconnection_complete(&mut self, handle: u16, reason: ErrorCode) -> Result<(), Error> {
        if self.event_mask & MASK_DISCONN_CMP == 0 {
            return Ok(());
        }
        self.push(EVCODE_DISCONN_CMP, |w| {
            w.write_u8(ErrorCode::Success.into())?;
            w.write_u16_le(handle)?;
            w.write_u8(reason.into())
        })
    }

    /// Queues a *Read Remote Version Information Complete* event.
    pub fn read_remote_version_complete(
        &mut self,
        status: ErrorCode,
        handle: u16,
        version: VersionNumber,
        company_id: u16,
        sub_version: u16,
    ) -> Result<(), Error> {
        if self.event_mask & MASK_RD_REM_VER_INFO_CMP == 0 {
            return Ok(());
        }
        self.push(EVCODE_RD_REM_VER_INFO_CMP, |w| {
            w.write_u8(status.into())?;
            w.write_u16_le(handle)?;
            w.write_u8(version.into())?;
            w.write_u16_le(company_id)?;
            w.write_u16_le(sub_version)
        })
    }

    /// Queues an *LE Advertising Report* with a single report.
    pub fn adv_report(
        &mut self,
        event_type: u8,
        addr: &DeviceAddress,
        data: &[u8],
        rssi: i8,
    ) -> Result<(), Error> {
        self.push_le(LeSubevent::AdvertisingReport, |w| {
            w.write_u8(1)?;
            w.write_u8(event_type)?;
            w.write_u8(addr.kind().hci_type())?;
            w.write_slice(addr.raw())?;
            w.write_u8(data.len() as u8)?;
            w.write_slice(data)?;
            w.write_i8(rssi)
        })
    }

    /// Queues an *LE Direct Advertising Report* for an `ADV_DIRECT_IND`.
    pub fn direct_adv_report(
        &mut self,
        addr: &DeviceAddress,
        direct_addr: &DeviceAddress,
        rssi: i8,
    ) -> Result<(), Error> {
        self.push_le(LeSubevent::DirectAdvertisingReport, |w| {
            w.write_u8(1)?;
            w.write_u8(1)?;
            w.write_u8(addr.kind().hci_type())?;
            w.write_slice(addr.raw())?;
            w.write_u8(direct_addr.kind().hci_type())?;
            w.write_slice(direct_addr.raw())?;
            w.write_i8(rssi)
        })
    }

    /// Queues an *LE Connection Complete* event for a connection that was not established.
    ///
    /// `peer` is the device we tried to connect to.
    pub fn conn_complete_failed(
        &mut self,
        status: ErrorCode,
        peer: &DeviceAddress,
    ) -> Result<(), Error> {
        self.push_le(LeSubevent::ConnectionComplete, |w| {
            w.write_u8(status.into())?;
            w.write_u16_le(0)?;
            // Slave, as an advertiser would have become
            w.write_u8(1)?;
            w.write_u8(peer.kind().hci_type())?;
            w.write_slice(peer.raw())?;
            // Interval, latency, supervision timeout, master clock accuracy
            w.write_slice(&[0; 7])
        })
    }

    /// Queues an *LE Connection Update Complete* event.
    pub fn conn_update_complete(
        &mut self,
        status: ErrorCode,
        handle: u16,
        interval: u16,
        latency: u16,
        timeout: u16,
    ) -> Result<(), Error> {
        self.push_le(LeSubevent::ConnectionUpdateComplete, |w| {
            w.write_u8(status.into())?;
            w.write_u16_le(handle)?;
            w.write_u16_le(interval)?;
            w.write_u16_le(latency)?;
            w.write_u16_le(timeout)
        })
    }

    /// Queues an *LE Read Remote Features Complete* event.
    pub fn remote_features_complete(
        &mut self,
        status: ErrorCode,
        handle: u16,
        features: FeatureSet,
    ) -> Result<(), Error> {
        self.push_le(LeSubevent::ReadRemoteFeaturesComplete, |w| {
            w.write_u8(status.into())?;
            w.write_u16_le(handle)?;
            features.to_bytes(w)
        })
    }

    /// Queues an *LE Remote Connection Parameter Request* event.
    pub fn rem_conn_param_req(&mut self, handle: u16, req: &ConnParamData) -> Result<(), Error> {
        self.push_le(LeSubevent::RemoteConnParamRequest, |w| {
            w.write_u16_le(handle)?;
            w.write_u16_le(req.interval_min)?;
            w.write_u16_le(req.interval_max)?;
            w.write_u16_le(req.latency)?;
            w.write_u16_le(req.timeout)
        })
    }

    /// Queues an *LE Data Length Change* event.
    pub fn data_len_change(
        &mut self,
        handle: u16,
        max_tx_octets: u16,
        max_tx_time: u16,
        max_rx_octets: u16,
        max_rx_time: u16,
    ) -> Result<(), Error> {
        self.push_le(LeSubevent::DataLengthChange, |w| {
            w.write_u16_le(handle)?;
            w.write_u16_le(max_tx_octets)?;
            w.write_u16_le(max_tx_time)?;
            w.write_u16_le(max_rx_octets)?;
            w.write_u16_le(max_rx_time)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::AddressKind;
    use crate::testing::CollectingTransport;

    #[test]
    fn command_replies() {
        let mut events = HostEvents::new();
        events
            .command_complete(0x200C, ErrorCode::Success, &[])
            .unwrap();
        events
            .command_status(0x0406, ErrorCode::UnknownConnectionId)
            .unwrap();
        assert_eq!(
            &events.pop().unwrap()[..],
            &[0x0E, 4, 1, 0x0C, 0x20, 0x00]
        );
        assert_eq!(
            &events.pop().unwrap()[..],
            &[0x0F, 4, 0x02, 1, 0x06, 0x04]
        );
    }

    #[test]
    fn le_events_need_meta_bit() {
        let mut events = HostEvents::new();
        let addr = DeviceAddress::new([1, 2, 3, 4, 5, 6], AddressKind::Random);
        events.adv_report(0, &addr, &[0xAA], -10).unwrap();
        assert!(events.is_empty());

        events.set_event_mask(DEFAULT_EVENT_MASK | MASK_LE_META);
        events.adv_report(0, &addr, &[0xAA], -10).unwrap();
        assert_eq!(
            &events.pop().unwrap()[..],
            &[0x3E, 13, 0x02, 1, 0, 1, 1, 2, 3, 4, 5, 6, 1, 0xAA, 0xF6]
        );

        // Subevent masked out
        events.set_le_event_mask(DEFAULT_LE_EVENT_MASK & !0b10);
        events.adv_report(0, &addr, &[0xAA], -10).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn full_queue_drops() {
        let mut events = HostEvents::new();
        for _ in 0..EVENT_QUEUE {
            events.disconnection_complete(1, ErrorCode::RemoteUserTerminated).unwrap();
        }
        assert_eq!(
            events.disconnection_complete(1, ErrorCode::RemoteUserTerminated),
            Err(Error::QueueFull)
        );
        assert_eq!(events.dropped(), 1);
    }

    #[test]
    fn flush_stops_at_busy_transport() {
        let mut events = HostEvents::new();
        let mut transport = CollectingTransport::new();
        events.disconnection_complete(1, ErrorCode::LocalHostTerminated).unwrap();
        events.disconnection_complete(2, ErrorCode::LocalHostTerminated).unwrap();

        transport.busy = true;
        events.flush(&mut transport);
        assert_eq!(events.len(), 2);

        transport.busy = false;
        events.flush(&mut transport);
        assert!(events.is_empty());
        assert_eq!(transport.events[1], [0x05, 4, 0x00, 2, 0, 0x16]);
    }
}
