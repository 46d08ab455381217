//! Per-connection state used by the LL Control Protocol engine.
//!
//! The controller does not run the connection state machine's radio timing itself. The platform
//! creates a connection through [`LinkLayer::connection_created`] and then reports control PDUs,
//! acknowledgements and connection event boundaries. Everything negotiated through control
//! procedures is tracked here.
//!
//! [`LinkLayer::connection_created`]: struct.LinkLayer.html#method.connection_created

use crate::{
    config::{Settings, CTRL_TX_QUEUE},
    hci::ErrorCode,
    link::{
        channel_map::ChannelMap,
        ctrl::CtrlProc,
        llcp::{ConnParamData, ConnectionUpdateData, ControlOpcode, CtrlPduBuf, VersionNumber},
        FeatureSet,
    },
    time::Instant,
};
use bitflags::bitflags;
use heapless::Deque;

/// Default data channel payload size both sides support before any length update.
pub const DEFAULT_MAX_OCTETS: u16 = 27;

/// Transmission time of a `DEFAULT_MAX_OCTETS` PDU on the 1M PHY, in µs.
pub const DEFAULT_MAX_TIME: u16 = 328;

/// The role of the local device in a connection.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    Master,
    Slave,
}

/// Connection parameters in their on-air units.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ConnParams {
    /// Connection interval in 1.25 ms units.
    pub interval: u16,

    /// Slave latency in connection events.
    pub latency: u16,

    /// Supervision timeout in 10 ms units.
    pub timeout: u16,
}

bitflags! {
    /// Procedure bookkeeping flags of a connection.
    pub struct ConnFlags: u16 {
        /// A peer connection parameter request waits for the host's reply.
        const HOST_REPLY_PENDING = 1 << 0;
        /// We have sent our `LL_VERSION_IND` on this connection.
        const VERSION_IND_SENT = 1 << 1;
        /// A channel map update waits for its instant.
        const CHANMAP_UPDATE_SCHEDULED = 1 << 2;
        /// A connection update waits for its instant.
        const CONN_UPDATE_SCHEDULED = 1 << 3;
        /// The host asked for the remote features.
        const HOST_FEATURES_REQ = 1 << 4;
        /// The host asked for the remote version.
        const HOST_VERSION_REQ = 1 << 5;
        /// The host asked for a connection update.
        const HOST_CONN_UPDATE = 1 << 6;
        /// The peer's features have been exchanged.
        const FEATURES_KNOWN = 1 << 7;
        /// The peer answered our connection parameter request with `LL_UNKNOWN_RSP`.
        const PEER_NO_CONN_PARAM_REQ = 1 << 8;
    }
}

/// Maximum payload sizes and transmission times of data channel PDUs.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DataLength {
    pub max_tx_octets: u16,
    pub max_tx_time: u16,
    pub max_rx_octets: u16,
    pub max_rx_time: u16,
}

impl DataLength {
    /// The limits every controller supports.
    pub fn minimum() -> Self {
        Self {
            max_tx_octets: DEFAULT_MAX_OCTETS,
            max_tx_time: DEFAULT_MAX_TIME,
            max_rx_octets: DEFAULT_MAX_OCTETS,
            max_rx_time: DEFAULT_MAX_TIME,
        }
    }
}

/// Version information received in the peer's `LL_VERSION_IND`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PeerVersion {
    pub version: VersionNumber,
    pub company_id: u16,
    pub sub_version: u16,
}

/// Control engine counters of one connection.
#[derive(Debug, Default, Copy, Clone)]
pub struct CtrlStats {
    /// Control PDUs dropped because of a bad length or out-of-range parameters.
    pub rx_malformed: u32,

    /// `LL_UNKNOWN_RSP` PDUs sent.
    pub unk_rsp_tx: u32,
}

/// State of an established connection.
pub struct Connection {
    pub(super) handle: u16,
    pub(super) role: Role,
    pub(super) params: ConnParams,
    pub(super) chan_map: ChannelMap,
    pub(super) event_counter: u16,

    pub(super) cur_proc: Option<CtrlProc>,
    /// Bitmask of `CtrlProc`s waiting to run (including the current one).
    pub(super) pending: u8,
    pub(super) rsp_deadline: Option<Instant>,

    pub(super) pending_chanmap: Option<(ChannelMap, u16)>,
    pub(super) pending_update: Option<ConnectionUpdateData>,
    /// Parameters the host (or an accepted peer request) wants to move to.
    pub(super) host_params: Option<ConnParamData>,
    /// Peer request forwarded to the host.
    pub(super) peer_req: Option<ConnParamData>,
    /// Channel map to distribute with the next channel map update.
    pub(super) host_chan_map: ChannelMap,

    pub(super) local_len: DataLength,
    pub(super) remote_len: DataLength,
    pub(super) effective_len: DataLength,

    pub(super) remote_features: FeatureSet,
    pub(super) peer_version: Option<PeerVersion>,
    pub(super) flags: ConnFlags,
    pub(super) terminate_reason: ErrorCode,

    pub(super) tx_queue: Deque<CtrlPduBuf, CTRL_TX_QUEUE>,
    /// Opcode of the control PDU handed to the platform and not yet acknowledged.
    pub(super) in_flight: Option<ControlOpcode>,
    pub(super) stats: CtrlStats,
}

impl Connection {
    pub(super) fn new(
        handle: u16,
        role: Role,
        params: ConnParams,
        chan_map: ChannelMap,
        settings: &Settings,
    ) -> Self {
        Self {
            handle,
            role,
            params,
            chan_map,
            event_counter: 0,
            cur_proc: None,
            pending: 0,
            rsp_deadline: None,
            pending_chanmap: None,
            pending_update: None,
            host_params: None,
            peer_req: None,
            host_chan_map: chan_map,
            local_len: DataLength {
                max_tx_octets: settings.max_octets,
                max_tx_time: settings.max_time,
                max_rx_octets: settings.max_octets,
                max_rx_time: settings.max_time,
            },
            remote_len: DataLength::minimum(),
            effective_len: DataLength::minimum(),
            remote_features: FeatureSet::empty(),
            peer_version: None,
            flags: ConnFlags::empty(),
            terminate_reason: ErrorCode::RemoteUserTerminated,
            tx_queue: Deque::new(),
            in_flight: None,
            stats: CtrlStats::default(),
        }
    }

    pub fn handle(&self) -> u16 {
        self.handle
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Returns the connection parameters currently in use.
    pub fn params(&self) -> ConnParams {
        self.params
    }

    pub fn channel_map(&self) -> ChannelMap {
        self.chan_map
    }

    /// Returns the connection event counter last reported by the platform.
    pub fn event_counter(&self) -> u16 {
        self.event_counter
    }

    /// Returns the control procedure in progress.
    pub fn current_proc(&self) -> Option<CtrlProc> {
        self.cur_proc
    }

    /// Returns whether `proc` is current or waiting to run.
    pub fn is_pending(&self, proc: CtrlProc) -> bool {
        self.pending & proc.bit() != 0
    }

    pub fn flags(&self) -> ConnFlags {
        self.flags
    }

    /// Returns the peer's features, or `None` if they have not been exchanged yet.
    pub fn remote_features(&self) -> Option<FeatureSet> {
        if self.flags.contains(ConnFlags::FEATURES_KNOWN) {
            Some(self.remote_features)
        } else {
            None
        }
    }

    pub fn peer_version(&self) -> Option<PeerVersion> {
        self.peer_version
    }

    /// Returns the data length limits in effect on this connection.
    pub fn effective_data_len(&self) -> DataLength {
        self.effective_len
    }

    /// Returns the local data length limits.
    pub fn local_data_len(&self) -> DataLength {
        self.local_len
    }

    /// Returns when the peer has to complete the current procedure by.
    pub fn response_deadline(&self) -> Option<Instant> {
        self.cur_proc.and(self.rsp_deadline)
    }

    pub fn stats(&self) -> &CtrlStats {
        &self.stats
    }

    /// Returns the number of control PDUs waiting for transmission.
    pub fn tx_queue_len(&self) -> usize {
        self.tx_queue.len()
    }

    /// Takes the next control PDU to transmit.
    ///
    /// The platform must call [`LinkLayer::ctrl_tx_done`] once the peer has acknowledged it.
    ///
    /// [`LinkLayer::ctrl_tx_done`]: struct.LinkLayer.html#method.ctrl_tx_done
    pub(super) fn next_tx(&mut self) -> Option<CtrlPduBuf> {
        let pdu = self.tx_queue.pop_front()?;
        self.in_flight = pdu.get(2).map(|op| ControlOpcode::from(*op));
        Some(pdu)
    }
}
