//! The LL Control Protocol engine.
//!
//! Every connection runs at most one *control procedure* at a time. Procedures requested while
//! another one is in progress are remembered in a bitmask and started, in a fixed order, when the
//! current one finishes. Procedures that expect an answer from the peer must get it within 40
//! seconds, otherwise the connection is dropped.
//!
//! Incoming control PDUs are length-checked against a per-opcode table before being decoded.
//! PDUs the controller does not know or does not support are answered with `LL_UNKNOWN_RSP`,
//! malformed PDUs are silently dropped.

use crate::{
    bytes::{ByteReader, FromBytes},
    config::Settings,
    hci::{ErrorCode, HostEvents, LeSubevent},
    link::{
        channel_map::ChannelMap,
        conn::{ConnFlags, ConnParams, Connection, DataLength, PeerVersion, Role},
        llcp::{ConnParamData, ConnectionUpdateData, ControlOpcode, ControlPdu, LengthData},
        FeatureSet,
    },
    time::{Duration, Instant},
    utils::Hex,
    Error, BLUETOOTH_VERSION,
};
use core::cmp;

/// Time the peer has to complete a procedure we started.
pub const PROC_RSP_TIMEOUT: Duration = Duration::from_secs(40);

/// Number of connection events between sending an update and its instant (on top of the slave
/// latency).
const INSTANT_OFFSET: u16 = 6;

/// LL Control procedures, in the order pending ones are started.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CtrlProc {
    ConnUpdate = 0,
    ChanMapUpdate = 1,
    FeatureXchg = 2,
    VersionXchg = 3,
    Terminate = 4,
    ConnParamReq = 5,
    LePing = 6,
    DataLenUpdate = 7,
}

impl CtrlProc {
    const ALL: [CtrlProc; 8] = [
        CtrlProc::ConnUpdate,
        CtrlProc::ChanMapUpdate,
        CtrlProc::FeatureXchg,
        CtrlProc::VersionXchg,
        CtrlProc::Terminate,
        CtrlProc::ConnParamReq,
        CtrlProc::LePing,
        CtrlProc::DataLenUpdate,
    ];

    /// Returns the bit representing this procedure in the pending mask.
    pub fn bit(self) -> u8 {
        1 << self as u8
    }

    /// Returns the procedure that is started by sending `opcode`.
    fn initiated_by(opcode: ControlOpcode) -> Option<Self> {
        Some(match opcode {
            ControlOpcode::ConnectionUpdateInd => CtrlProc::ConnUpdate,
            ControlOpcode::ChannelMapInd => CtrlProc::ChanMapUpdate,
            ControlOpcode::FeatureReq | ControlOpcode::SlaveFeatureReq => CtrlProc::FeatureXchg,
            ControlOpcode::VersionInd => CtrlProc::VersionXchg,
            ControlOpcode::TerminateInd => CtrlProc::Terminate,
            ControlOpcode::ConnectionParamReq => CtrlProc::ConnParamReq,
            ControlOpcode::PingReq => CtrlProc::LePing,
            ControlOpcode::LengthReq => CtrlProc::DataLenUpdate,
            _ => return None,
        })
    }
}

/// What the control engine needs from the rest of the Link-Layer.
pub struct CtrlCtx<'a> {
    pub settings: &'a Settings,
    pub now: Instant,
    pub events: &'a mut HostEvents,
}

impl Connection {
    /// Requests the control procedure `proc`.
    ///
    /// If no procedure is running, `proc` becomes the current one and its PDU is queued. Otherwise
    /// (or when the tx queue is full) it is left pending. Requesting a procedure that is already
    /// pending has no further effect.
    pub fn proc_start(&mut self, proc: CtrlProc, ctx: &mut CtrlCtx<'_>) {
        if self.cur_proc.is_none() {
            if self.tx_queue.is_full() {
                warn!("ctrl[{}]: no tx buffer for {:?}", self.handle, proc);
            } else {
                let pdu = self.proc_pdu(proc, ctx.settings);
                match self.enqueue(pdu) {
                    Ok(()) => {
                        debug!("ctrl[{}]: start {:?}", self.handle, proc);
                        self.cur_proc = Some(proc);
                        self.rsp_deadline = if proc == CtrlProc::ChanMapUpdate {
                            None
                        } else {
                            Some(ctx.now + PROC_RSP_TIMEOUT)
                        };
                    }
                    Err(e) => warn!("ctrl[{}]: cannot start {:?}: {}", self.handle, proc, e),
                }
            }
        }

        self.pending |= proc.bit();
    }

    /// Ends `proc` and starts the next pending procedure.
    pub fn proc_stop(&mut self, proc: CtrlProc, ctx: &mut CtrlCtx<'_>) {
        if self.cur_proc == Some(proc) {
            debug!("ctrl[{}]: stop {:?}", self.handle, proc);
            self.cur_proc = None;
            self.rsp_deadline = None;
        }
        self.pending &= !proc.bit();

        self.start_next_pending(ctx);
    }

    fn start_next_pending(&mut self, ctx: &mut CtrlCtx<'_>) {
        if self.cur_proc.is_some() {
            return;
        }

        for &proc in CtrlProc::ALL.iter() {
            if !self.is_pending(proc) {
                continue;
            }

            if proc == CtrlProc::VersionXchg {
                if let Some(version) = self.peer_version {
                    // Versions are only exchanged once per connection
                    self.pending &= !proc.bit();
                    self.report_version(version, ctx);
                    continue;
                }
            }

            self.proc_start(proc, ctx);
            return;
        }
    }

    /// Checks the response timeout of the current procedure.
    ///
    /// Returns the reason to end the connection with if the peer took too long.
    pub fn check_timeout(&self, now: Instant) -> Result<(), ErrorCode> {
        match (self.rsp_deadline, self.cur_proc) {
            (Some(deadline), Some(proc)) if !now.is_before(deadline) => {
                warn!("ctrl[{}]: {:?} timed out", self.handle, proc);
                Err(ErrorCode::LlResponseTimeout)
            }
            _ => Ok(()),
        }
    }

    /// Processes the payload of a received LL Control PDU (opcode and `CtrData`).
    ///
    /// Returns an error code if the connection has to be ended because of the PDU.
    pub fn rx_pdu(&mut self, payload: &[u8], ctx: &mut CtrlCtx<'_>) -> Result<(), ErrorCode> {
        let opcode = match payload.first() {
            Some(&raw) => ControlOpcode::from(raw),
            None => {
                trace!("ctrl[{}]: empty control PDU", self.handle);
                return Ok(());
            }
        };

        let expected = match opcode.ctr_data_len() {
            Some(len) => len,
            None => {
                self.unknown_rsp(opcode);
                return Ok(());
            }
        };
        if payload.len() - 1 != expected {
            self.malformed(opcode);
            return Ok(());
        }

        if let Some(feature) = opcode.required_feature() {
            if !ctx.settings.supported_features.contains(feature) {
                self.unknown_rsp(opcode);
                return Ok(());
            }
        }

        let pdu = match ControlPdu::from_bytes(&mut ByteReader::new(payload)) {
            Ok(pdu) => pdu,
            Err(_) => {
                self.malformed(opcode);
                return Ok(());
            }
        };
        trace!("ctrl[{}]: rx {:?}", self.handle, pdu);

        self.dispatch(pdu, ctx)
    }

    fn dispatch(&mut self, pdu: ControlPdu<'_>, ctx: &mut CtrlCtx<'_>) -> Result<(), ErrorCode> {
        match pdu {
            ControlPdu::ConnectionUpdateInd(data) => {
                if self.role == Role::Master {
                    warn!("ctrl[{}]: slave sent a connection update", self.handle);
                    return Ok(());
                }
                if self.instant_passed(data.instant) {
                    return Err(ErrorCode::InstantPassed);
                }
                self.pending_update = Some(data);
                self.flags.insert(ConnFlags::CONN_UPDATE_SCHEDULED);
            }
            ControlPdu::ChannelMapInd { map, instant } => {
                if self.role == Role::Master {
                    warn!("ctrl[{}]: slave sent a channel map", self.handle);
                    return Ok(());
                }
                if self.instant_passed(instant) {
                    return Err(ErrorCode::InstantPassed);
                }
                self.pending_chanmap = Some((map, instant));
                self.flags.insert(ConnFlags::CHANMAP_UPDATE_SCHEDULED);
            }
            ControlPdu::TerminateInd { error_code } => {
                info!("ctrl[{}]: peer terminated: {:?}", self.handle, error_code);
                return Err(error_code);
            }
            ControlPdu::UnknownRsp { unknown_type } => {
                self.peer_unknown_rsp(unknown_type, ctx);
            }
            ControlPdu::FeatureReq { features } | ControlPdu::SlaveFeatureReq { features } => {
                self.remote_features = features;
                self.flags.insert(ConnFlags::FEATURES_KNOWN);
                self.respond(ControlPdu::FeatureRsp {
                    features: ctx.settings.supported_features,
                });
            }
            ControlPdu::FeatureRsp { features } => {
                self.remote_features = features;
                self.flags.insert(ConnFlags::FEATURES_KNOWN);
                if self.cur_proc == Some(CtrlProc::FeatureXchg) {
                    self.flags.remove(ConnFlags::HOST_FEATURES_REQ);
                    ctx.events
                        .remote_features_complete(ErrorCode::Success, self.handle, features)
                        .ok();
                    self.proc_stop(CtrlProc::FeatureXchg, ctx);
                }
            }
            ControlPdu::VersionInd {
                vers_nr,
                comp_id,
                sub_vers_nr,
            } => {
                let version = PeerVersion {
                    version: vers_nr,
                    company_id: comp_id.0,
                    sub_version: sub_vers_nr.0,
                };
                self.peer_version = Some(version);
                if !self.flags.contains(ConnFlags::VERSION_IND_SENT) {
                    self.respond(version_ind(ctx.settings));
                }
                if self.cur_proc == Some(CtrlProc::VersionXchg) {
                    self.report_version(version, ctx);
                    self.proc_stop(CtrlProc::VersionXchg, ctx);
                }
            }
            ControlPdu::RejectInd { error_code } => {
                self.rejected(self.cur_proc, error_code, ctx);
            }
            ControlPdu::RejectIndExt {
                reject_opcode,
                error_code,
            } => {
                self.rejected(CtrlProc::initiated_by(reject_opcode), error_code, ctx);
            }
            ControlPdu::ConnectionParamReq(req) => {
                self.peer_conn_param_req(req, ctx);
            }
            ControlPdu::ConnectionParamRsp(rsp) => {
                if self.role == Role::Master && self.cur_proc == Some(CtrlProc::ConnParamReq) {
                    // The procedure completes when the update reaches its instant
                    self.host_params = Some(rsp);
                    self.respond(ControlPdu::ConnectionUpdateInd(self.update_data()));
                }
            }
            ControlPdu::PingReq => self.respond(ControlPdu::PingRsp),
            ControlPdu::PingRsp => {
                if self.cur_proc == Some(CtrlProc::LePing) {
                    self.proc_stop(CtrlProc::LePing, ctx);
                }
            }
            ControlPdu::LengthReq(data) => {
                if !data.is_valid() {
                    self.malformed(ControlOpcode::LengthReq);
                    return Ok(());
                }
                self.update_remote_len(&data, ctx);

                // The peer's request covers a local update that has not been started yet
                if self.cur_proc != Some(CtrlProc::DataLenUpdate) {
                    self.pending &= !CtrlProc::DataLenUpdate.bit();
                }
                self.respond(ControlPdu::LengthRsp(self.local_length_data()));
            }
            ControlPdu::LengthRsp(data) => {
                if self.cur_proc == Some(CtrlProc::DataLenUpdate) {
                    if !data.is_valid() {
                        self.malformed(ControlOpcode::LengthRsp);
                        return Ok(());
                    }
                    self.update_remote_len(&data, ctx);
                    self.proc_stop(CtrlProc::DataLenUpdate, ctx);
                }
            }
            ControlPdu::Unknown { opcode, .. } => self.unknown_rsp(opcode),
        }

        Ok(())
    }

    fn peer_unknown_rsp(&mut self, opcode: ControlOpcode, ctx: &mut CtrlCtx<'_>) {
        let proc = match CtrlProc::initiated_by(opcode) {
            Some(proc) if self.cur_proc == Some(proc) => proc,
            _ => {
                debug!("ctrl[{}]: unexpected UNKNOWN_RSP({:?})", self.handle, opcode);
                return;
            }
        };

        match proc {
            CtrlProc::FeatureXchg => {
                self.flags.remove(ConnFlags::HOST_FEATURES_REQ);
                ctx.events
                    .remote_features_complete(
                        ErrorCode::UnsupportedRemoteFeature,
                        self.handle,
                        FeatureSet::empty(),
                    )
                    .ok();
                self.proc_stop(proc, ctx);
            }
            CtrlProc::ConnParamReq => {
                self.flags.insert(ConnFlags::PEER_NO_CONN_PARAM_REQ);
                self.proc_stop(proc, ctx);
                match self.role {
                    // Fall back to an update the peer cannot refuse
                    Role::Master => self.proc_start(CtrlProc::ConnUpdate, ctx),
                    Role::Slave => {
                        self.conn_update_complete(ErrorCode::UnsupportedRemoteFeature, ctx)
                    }
                }
            }
            _ => self.proc_stop(proc, ctx),
        }
    }

    fn rejected(&mut self, proc: Option<CtrlProc>, reason: ErrorCode, ctx: &mut CtrlCtx<'_>) {
        let proc = match proc {
            Some(proc) if self.cur_proc == Some(proc) => proc,
            _ => return,
        };

        debug!("ctrl[{}]: {:?} rejected: {:?}", self.handle, proc, reason);
        if proc == CtrlProc::ConnParamReq || proc == CtrlProc::ConnUpdate {
            self.conn_update_complete(reason, ctx);
        }
        self.proc_stop(proc, ctx);
    }

    fn peer_conn_param_req(&mut self, req: ConnParamData, ctx: &mut CtrlCtx<'_>) {
        let ours = self.is_pending(CtrlProc::ConnParamReq);
        match self.role {
            Role::Slave if ours => {
                // The master's request wins
                debug!("ctrl[{}]: conn param request collision", self.handle);
                self.conn_update_complete(ErrorCode::LmpCollision, ctx);
                self.proc_stop(CtrlProc::ConnParamReq, ctx);
            }
            Role::Master if ours => {
                self.reject_conn_params(ErrorCode::LmpCollision);
                return;
            }
            Role::Master if self.flags.contains(ConnFlags::CHANMAP_UPDATE_SCHEDULED) => {
                self.reject_conn_params(ErrorCode::DifferentTransactionCollision);
                return;
            }
            _ => {}
        }

        if !req.is_valid() {
            self.reject_conn_params(ErrorCode::InvalidLlParameters);
            return;
        }

        if ctx
            .events
            .le_event_enabled(LeSubevent::RemoteConnParamRequest)
        {
            self.peer_req = Some(req);
            self.flags.insert(ConnFlags::HOST_REPLY_PENDING);
            ctx.events.rem_conn_param_req(self.handle, &req).ok();
        } else {
            self.accept_conn_params(req, ctx);
        }
    }

    fn accept_conn_params(&mut self, params: ConnParamData, ctx: &mut CtrlCtx<'_>) {
        match self.role {
            Role::Master => {
                self.host_params = Some(params);
                self.proc_start(CtrlProc::ConnUpdate, ctx);
            }
            Role::Slave => self.respond(ControlPdu::ConnectionParamRsp(params)),
        }
    }

    fn reject_conn_params(&mut self, reason: ErrorCode) {
        self.respond(ControlPdu::RejectIndExt {
            reject_opcode: ControlOpcode::ConnectionParamReq,
            error_code: reason,
        });
    }

    /// Called after each connection event with the counter of the next event.
    ///
    /// Applies channel map and connection parameter updates whose instant has been reached.
    pub fn conn_event_end(&mut self, counter: u16, ctx: &mut CtrlCtx<'_>) {
        self.event_counter = counter;

        if let Some((map, instant)) = self.pending_chanmap {
            if self.instant_reached(instant) {
                debug!("ctrl[{}]: new channel map {}", self.handle, map);
                self.chan_map = map;
                self.pending_chanmap = None;
                self.flags.remove(ConnFlags::CHANMAP_UPDATE_SCHEDULED);
                if self.cur_proc == Some(CtrlProc::ChanMapUpdate) {
                    self.proc_stop(CtrlProc::ChanMapUpdate, ctx);
                }
            }
        }

        if let Some(update) = self.pending_update {
            if self.instant_reached(update.instant) {
                self.params = ConnParams {
                    interval: update.interval,
                    latency: update.latency,
                    timeout: update.timeout,
                };
                debug!("ctrl[{}]: new parameters {:?}", self.handle, self.params);
                self.pending_update = None;
                self.flags.remove(ConnFlags::CONN_UPDATE_SCHEDULED);
                self.conn_update_complete(ErrorCode::Success, ctx);
                for &proc in &[CtrlProc::ConnUpdate, CtrlProc::ConnParamReq] {
                    if self.cur_proc == Some(proc) {
                        self.proc_stop(proc, ctx);
                    }
                }
            }
        }

        // Procedures that found the tx queue full are started once it has room
        self.start_next_pending(ctx);
    }

    /// Called when the peer has acknowledged the control PDU last taken from the tx queue.
    ///
    /// Returns the reason to end the connection with once our `LL_TERMINATE_IND` got through.
    pub fn ctrl_tx_done(&mut self, ctx: &mut CtrlCtx<'_>) -> Result<(), ErrorCode> {
        match self.in_flight.take() {
            Some(ControlOpcode::TerminateInd) => Err(ErrorCode::LocalHostTerminated),
            _ => {
                self.start_next_pending(ctx);
                Ok(())
            }
        }
    }

    /// Checks whether the host may terminate the connection now.
    pub fn check_terminate(&self) -> Result<(), ErrorCode> {
        if self.is_pending(CtrlProc::Terminate) {
            Err(ErrorCode::CommandDisallowed)
        } else {
            Ok(())
        }
    }

    /// Starts the termination procedure on behalf of the host.
    pub fn host_terminate(&mut self, reason: ErrorCode, ctx: &mut CtrlCtx<'_>) {
        self.terminate_reason = reason;
        self.proc_start(CtrlProc::Terminate, ctx);
    }

    /// Handles the host asking for the peer's version, reporting it right away if it is known.
    pub fn host_read_version(&mut self, ctx: &mut CtrlCtx<'_>) {
        match self.peer_version {
            Some(version) => self.report_version(version, ctx),
            None => {
                self.flags.insert(ConnFlags::HOST_VERSION_REQ);
                self.proc_start(CtrlProc::VersionXchg, ctx);
            }
        }
    }

    /// Handles the host asking for the peer's features, reporting them right away if known.
    pub fn host_read_features(&mut self, ctx: &mut CtrlCtx<'_>) {
        if self.flags.contains(ConnFlags::FEATURES_KNOWN) {
            ctx.events
                .remote_features_complete(ErrorCode::Success, self.handle, self.remote_features)
                .ok();
        } else {
            self.flags.insert(ConnFlags::HOST_FEATURES_REQ);
            self.proc_start(CtrlProc::FeatureXchg, ctx);
        }
    }

    fn use_conn_param_req(&self, settings: &Settings) -> bool {
        let remote_ok = if self.flags.contains(ConnFlags::FEATURES_KNOWN) {
            self.remote_features.contains(FeatureSet::CONN_PARAM_REQ)
        } else {
            !self.flags.contains(ConnFlags::PEER_NO_CONN_PARAM_REQ)
        };
        settings
            .supported_features
            .contains(FeatureSet::CONN_PARAM_REQ)
            && remote_ok
    }

    /// Checks whether the host may request new connection parameters now.
    pub fn check_conn_update(&self, settings: &Settings) -> Result<(), ErrorCode> {
        if self.is_pending(CtrlProc::ConnUpdate)
            || self.is_pending(CtrlProc::ConnParamReq)
            || self.flags.contains(ConnFlags::CONN_UPDATE_SCHEDULED)
        {
            return Err(ErrorCode::CommandDisallowed);
        }
        if self.role == Role::Slave && !self.use_conn_param_req(settings) {
            return Err(ErrorCode::UnsupportedRemoteFeature);
        }
        Ok(())
    }

    /// Starts a connection update towards `params` on behalf of the host.
    pub fn host_conn_update(&mut self, params: ConnParamData, ctx: &mut CtrlCtx<'_>) {
        self.host_params = Some(params);
        self.flags.insert(ConnFlags::HOST_CONN_UPDATE);
        if self.use_conn_param_req(ctx.settings) {
            self.proc_start(CtrlProc::ConnParamReq, ctx);
        } else {
            self.proc_start(CtrlProc::ConnUpdate, ctx);
        }
    }

    /// Answers a peer connection parameter request forwarded to the host.
    ///
    /// `Ok(params)` accepts the request with the given parameters, `Err(reason)` rejects it.
    pub fn host_param_reply(
        &mut self,
        reply: Result<ConnParamData, ErrorCode>,
        ctx: &mut CtrlCtx<'_>,
    ) -> Result<(), ErrorCode> {
        if !self.flags.contains(ConnFlags::HOST_REPLY_PENDING) {
            return Err(ErrorCode::CommandDisallowed);
        }
        self.flags.remove(ConnFlags::HOST_REPLY_PENDING);
        self.peer_req = None;

        match reply {
            Ok(params) => self.accept_conn_params(params, ctx),
            Err(reason) => self.reject_conn_params(reason),
        }
        Ok(())
    }

    /// Changes the local transmit limits and starts a data length update.
    pub fn host_set_data_len(&mut self, tx_octets: u16, tx_time: u16, ctx: &mut CtrlCtx<'_>) {
        self.local_len.max_tx_octets = tx_octets;
        self.local_len.max_tx_time = tx_time;
        self.proc_start(CtrlProc::DataLenUpdate, ctx);
    }

    /// Distributes a new channel map. Only masters can do this, slaves ignore it.
    pub fn host_set_chan_map(&mut self, map: ChannelMap, ctx: &mut CtrlCtx<'_>) {
        if self.role == Role::Master && map != self.chan_map {
            self.host_chan_map = map;
            self.proc_start(CtrlProc::ChanMapUpdate, ctx);
        }
    }

    fn report_version(&mut self, version: PeerVersion, ctx: &mut CtrlCtx<'_>) {
        self.flags.remove(ConnFlags::HOST_VERSION_REQ);
        ctx.events
            .read_remote_version_complete(
                ErrorCode::Success,
                self.handle,
                version.version,
                version.company_id,
                version.sub_version,
            )
            .ok();
    }

    fn conn_update_complete(&mut self, status: ErrorCode, ctx: &mut CtrlCtx<'_>) {
        self.flags.remove(ConnFlags::HOST_CONN_UPDATE);
        self.host_params = None;
        ctx.events
            .conn_update_complete(
                status,
                self.handle,
                self.params.interval,
                self.params.latency,
                self.params.timeout,
            )
            .ok();
    }

    fn update_remote_len(&mut self, data: &LengthData, ctx: &mut CtrlCtx<'_>) {
        self.remote_len = DataLength {
            max_tx_octets: data.max_tx_octets,
            max_tx_time: data.max_tx_time,
            max_rx_octets: data.max_rx_octets,
            max_rx_time: data.max_rx_time,
        };

        let local = self.local_len;
        let remote = self.remote_len;
        let effective = DataLength {
            max_tx_octets: cmp::min(local.max_tx_octets, remote.max_rx_octets),
            max_tx_time: cmp::min(local.max_tx_time, remote.max_rx_time),
            max_rx_octets: cmp::min(local.max_rx_octets, remote.max_tx_octets),
            max_rx_time: cmp::min(local.max_rx_time, remote.max_tx_time),
        };
        if effective != self.effective_len {
            debug!("ctrl[{}]: data length {:?}", self.handle, effective);
            self.effective_len = effective;
            ctx.events
                .data_len_change(
                    self.handle,
                    effective.max_tx_octets,
                    effective.max_tx_time,
                    effective.max_rx_octets,
                    effective.max_rx_time,
                )
                .ok();
        }
    }

    fn local_length_data(&self) -> LengthData {
        LengthData {
            max_rx_octets: self.local_len.max_rx_octets,
            max_rx_time: self.local_len.max_rx_time,
            max_tx_octets: self.local_len.max_tx_octets,
            max_tx_time: self.local_len.max_tx_time,
        }
    }

    /// Returns whether `instant` lies in the past (or is too far in the future to be reachable).
    fn instant_passed(&self, instant: u16) -> bool {
        instant.wrapping_sub(self.event_counter) >= 32767
    }

    fn instant_reached(&self, instant: u16) -> bool {
        self.event_counter.wrapping_sub(instant) < 32767
    }

    fn next_instant(&self) -> u16 {
        self.event_counter
            .wrapping_add(self.params.latency)
            .wrapping_add(INSTANT_OFFSET)
    }

    fn update_data(&self) -> ConnectionUpdateData {
        let params = self.host_params.unwrap_or_else(|| self.current_params());
        ConnectionUpdateData {
            win_size: 1,
            win_offset: 0,
            interval: params.interval_max,
            latency: params.latency,
            timeout: params.timeout,
            instant: self.next_instant(),
        }
    }

    fn current_params(&self) -> ConnParamData {
        ConnParamData::new(
            self.params.interval,
            self.params.interval,
            self.params.latency,
            self.params.timeout,
        )
    }

    fn proc_pdu(&self, proc: CtrlProc, settings: &Settings) -> ControlPdu<'static> {
        match proc {
            CtrlProc::ConnUpdate => ControlPdu::ConnectionUpdateInd(self.update_data()),
            CtrlProc::ChanMapUpdate => ControlPdu::ChannelMapInd {
                map: self.host_chan_map,
                instant: self.next_instant(),
            },
            CtrlProc::FeatureXchg => {
                let features = settings.supported_features;
                match self.role {
                    Role::Master => ControlPdu::FeatureReq { features },
                    Role::Slave => ControlPdu::SlaveFeatureReq { features },
                }
            }
            CtrlProc::VersionXchg => version_ind(settings),
            CtrlProc::Terminate => ControlPdu::TerminateInd {
                error_code: self.terminate_reason,
            },
            CtrlProc::ConnParamReq => ControlPdu::ConnectionParamReq(
                self.host_params.unwrap_or_else(|| self.current_params()),
            ),
            CtrlProc::LePing => ControlPdu::PingReq,
            CtrlProc::DataLenUpdate => ControlPdu::LengthReq(self.local_length_data()),
        }
    }

    /// Queues `pdu` for transmission and records what sending it implies.
    fn enqueue(&mut self, pdu: ControlPdu<'_>) -> Result<(), Error> {
        let buf = pdu.to_data_pdu()?;
        self.tx_queue.push_back(buf).map_err(|_| Error::QueueFull)?;
        trace!("ctrl[{}]: tx {:?}", self.handle, pdu);

        match pdu {
            ControlPdu::ConnectionUpdateInd(data) => {
                self.pending_update = Some(data);
                self.flags.insert(ConnFlags::CONN_UPDATE_SCHEDULED);
            }
            ControlPdu::ChannelMapInd { map, instant } => {
                self.pending_chanmap = Some((map, instant));
                self.flags.insert(ConnFlags::CHANMAP_UPDATE_SCHEDULED);
            }
            ControlPdu::VersionInd { .. } => self.flags.insert(ConnFlags::VERSION_IND_SENT),
            _ => {}
        }
        Ok(())
    }

    fn respond(&mut self, pdu: ControlPdu<'_>) {
        if let Err(e) = self.enqueue(pdu) {
            warn!("ctrl[{}]: dropping {:?}: {}", self.handle, pdu.opcode(), e);
        }
    }

    fn unknown_rsp(&mut self, opcode: ControlOpcode) {
        debug!("ctrl[{}]: unknown or unsupported {:?}", self.handle, opcode);
        self.stats.unk_rsp_tx += 1;
        self.respond(ControlPdu::UnknownRsp {
            unknown_type: opcode,
        });
    }

    fn malformed(&mut self, opcode: ControlOpcode) {
        warn!("ctrl[{}]: malformed {:?}", self.handle, opcode);
        self.stats.rx_malformed += 1;
    }
}

fn version_ind(settings: &Settings) -> ControlPdu<'static> {
    ControlPdu::VersionInd {
        vers_nr: BLUETOOTH_VERSION,
        comp_id: Hex(settings.company_id),
        sub_vers_nr: Hex(settings.sub_version),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LE_META: u64 = 1 << 61;

    fn conn(role: Role, settings: &Settings) -> Connection {
        let params = ConnParams {
            interval: 40,
            latency: 0,
            timeout: 400,
        };
        Connection::new(1, role, params, ChannelMap::with_all_channels(), settings)
    }

    fn ctx<'a>(settings: &'a Settings, events: &'a mut HostEvents, now: u32) -> CtrlCtx<'a> {
        CtrlCtx {
            settings,
            now: Instant::from_raw_micros(now),
            events,
        }
    }

    fn payload(pdu: ControlPdu<'_>) -> Vec<u8> {
        pdu.to_data_pdu().unwrap()[2..].to_vec()
    }

    /// Drains the tx queue, returning the control payloads.
    fn sent(conn: &mut Connection) -> Vec<Vec<u8>> {
        let mut sent = Vec::new();
        while let Some(pdu) = conn.next_tx() {
            sent.push(pdu[2..].to_vec());
        }
        sent
    }

    fn le_events() -> HostEvents {
        let mut events = HostEvents::new();
        events.set_event_mask(crate::hci::DEFAULT_EVENT_MASK | LE_META);
        events
    }

    #[test]
    fn idempotent_start() {
        let settings = Settings::default();
        let mut events = HostEvents::new();
        let mut c = conn(Role::Master, &settings);
        let mut ctx = ctx(&settings, &mut events, 0);

        c.proc_start(CtrlProc::LePing, &mut ctx);
        c.proc_start(CtrlProc::LePing, &mut ctx);
        assert_eq!(c.current_proc(), Some(CtrlProc::LePing));
        assert_eq!(sent(&mut c), vec![vec![0x12]]);
    }

    #[test]
    fn one_procedure_at_a_time() {
        let settings = Settings::default();
        let mut events = HostEvents::new();
        let mut c = conn(Role::Master, &settings);
        let mut ctx = ctx(&settings, &mut events, 0);

        c.proc_start(CtrlProc::LePing, &mut ctx);
        c.proc_start(CtrlProc::FeatureXchg, &mut ctx);
        assert_eq!(c.current_proc(), Some(CtrlProc::LePing));
        assert!(c.is_pending(CtrlProc::FeatureXchg));
        assert_eq!(sent(&mut c).len(), 1);

        c.rx_pdu(&[0x13], &mut ctx).unwrap();
        assert!(!c.is_pending(CtrlProc::LePing));
        assert_eq!(c.current_proc(), Some(CtrlProc::FeatureXchg));
        let features = settings.supported_features;
        assert_eq!(
            sent(&mut c),
            vec![payload(ControlPdu::FeatureReq { features })]
        );
    }

    #[test]
    fn full_tx_queue_leaves_procedure_pending() {
        let settings = Settings::default();
        let mut events = HostEvents::new();
        let mut c = conn(Role::Slave, &settings);
        let mut ctx = ctx(&settings, &mut events, 0);

        for _ in 0..crate::config::CTRL_TX_QUEUE {
            c.rx_pdu(&[0x12], &mut ctx).unwrap();
        }
        c.proc_start(CtrlProc::LePing, &mut ctx);
        assert_eq!(c.current_proc(), None);
        assert!(c.is_pending(CtrlProc::LePing));
    }

    #[test]
    fn length_mismatch_is_dropped() {
        let settings = Settings::default();
        let mut events = HostEvents::new();
        let mut c = conn(Role::Slave, &settings);
        let mut ctx = ctx(&settings, &mut events, 0);

        c.rx_pdu(&[0x08, 1, 2, 3], &mut ctx).unwrap();
        c.rx_pdu(&[0x12, 0], &mut ctx).unwrap();
        c.rx_pdu(&[], &mut ctx).unwrap();
        assert_eq!(c.stats().rx_malformed, 2);
        assert!(sent(&mut c).is_empty());
        assert_eq!(c.remote_features(), None);
    }

    #[test]
    fn every_opcode_length_checked() {
        let settings = Settings::default();
        let mut events = HostEvents::new();
        let mut c = conn(Role::Slave, &settings);
        let mut ctx = ctx(&settings, &mut events, 0);

        let mut dropped = 0;
        for raw in 0x00..=0x15u8 {
            let len = ControlOpcode::from(raw).ctr_data_len().unwrap();
            let mut wrong = vec![len + 1];
            if len > 0 {
                wrong.push(len - 1);
            }
            for bad_len in wrong {
                let mut pdu = vec![0; bad_len + 1];
                pdu[0] = raw;
                assert_eq!(c.rx_pdu(&pdu, &mut ctx), Ok(()), "opcode {:#04x}", raw);
                dropped += 1;
                assert_eq!(c.stats().rx_malformed, dropped, "opcode {:#04x}", raw);
            }
        }
        assert!(sent(&mut c).is_empty());
        assert_eq!(c.stats().unk_rsp_tx, 0);
        assert_eq!(c.current_proc(), None);
        assert_eq!(c.remote_features(), None);
        assert_eq!(c.peer_version(), None);
    }

    #[test]
    fn blocked_start_runs_after_connection_event() {
        let settings = Settings::default();
        let mut events = HostEvents::new();
        let mut c = conn(Role::Slave, &settings);
        let mut ctx = ctx(&settings, &mut events, 1_000);

        for _ in 0..crate::config::CTRL_TX_QUEUE {
            c.rx_pdu(&[0x12], &mut ctx).unwrap();
        }
        c.host_terminate(ErrorCode::RemoteUserTerminated, &mut ctx);
        assert_eq!(c.current_proc(), None);
        assert_eq!(c.check_terminate(), Err(ErrorCode::CommandDisallowed));

        // Sent, but not acknowledged yet
        sent(&mut c);
        c.conn_event_end(1, &mut ctx);
        assert_eq!(c.current_proc(), Some(CtrlProc::Terminate));
        assert_eq!(
            c.response_deadline(),
            Some(Instant::from_raw_micros(40_001_000))
        );
        assert_eq!(sent(&mut c), vec![vec![0x02, 0x13]]);
    }

    #[test]
    fn length_req_out_of_range() {
        let settings = Settings::default();
        let mut events = le_events();
        let mut c = conn(Role::Slave, &settings);
        let mut ctx = ctx(&settings, &mut events, 0);

        let req = LengthData {
            max_rx_octets: 20,
            max_rx_time: 2120,
            max_tx_octets: 251,
            max_tx_time: 2120,
        };
        c.rx_pdu(&payload(ControlPdu::LengthReq(req)), &mut ctx)
            .unwrap();
        assert_eq!(c.stats().rx_malformed, 1);
        assert!(sent(&mut c).is_empty());
        assert_eq!(c.effective_data_len(), DataLength::minimum());
        assert!(events.is_empty());
    }

    #[test]
    fn length_req_changes_effective_length() {
        let settings = Settings {
            max_octets: 251,
            max_time: 2120,
            ..Settings::default()
        };
        let mut events = le_events();
        events.set_le_event_mask(1 << 6);
        let mut c = conn(Role::Slave, &settings);
        c.proc_start(CtrlProc::DataLenUpdate, &mut ctx(&settings, &mut events, 0));
        c.proc_stop(CtrlProc::DataLenUpdate, &mut ctx(&settings, &mut events, 0));
        sent(&mut c);

        // Peer wants to receive at most 100 octets
        let req = LengthData {
            max_rx_octets: 100,
            max_rx_time: 2120,
            max_tx_octets: 27,
            max_tx_time: 328,
        };
        c.proc_start(CtrlProc::LePing, &mut ctx(&settings, &mut events, 0));
        c.proc_start(CtrlProc::DataLenUpdate, &mut ctx(&settings, &mut events, 0));
        c.rx_pdu(
            &payload(ControlPdu::LengthReq(req)),
            &mut ctx(&settings, &mut events, 0),
        )
        .unwrap();

        // Our own pending update is no longer needed
        assert!(!c.is_pending(CtrlProc::DataLenUpdate));
        let eff = c.effective_data_len();
        assert_eq!(eff.max_tx_octets, 100);
        assert_eq!(eff.max_rx_octets, 27);
        assert_eq!(
            sent(&mut c)[1],
            payload(ControlPdu::LengthRsp(LengthData {
                max_rx_octets: 251,
                max_rx_time: 2120,
                max_tx_octets: 251,
                max_tx_time: 2120,
            }))
        );
        let ev = events.pop().unwrap();
        assert_eq!(&ev[..3], &[0x3E, 11, 0x07]);
        assert_eq!(&ev[5..7], &100u16.to_le_bytes());
    }

    #[test]
    fn unknown_opcode_gets_unknown_rsp() {
        let settings = Settings::default();
        let mut events = HostEvents::new();
        let mut c = conn(Role::Slave, &settings);
        let mut ctx = ctx(&settings, &mut events, 0);

        c.rx_pdu(&[0x16, 0xAA], &mut ctx).unwrap();
        // Encryption is not supported
        c.rx_pdu(&[0x03; 23], &mut ctx).unwrap();
        assert_eq!(sent(&mut c), vec![vec![0x07, 0x16], vec![0x07, 0x03]]);
        assert_eq!(c.stats().unk_rsp_tx, 2);
    }

    #[test]
    fn slave_conn_param_collision() {
        let settings = Settings::default();
        let mut events = le_events();
        let mut c = conn(Role::Slave, &settings);
        let req = ConnParamData::new(24, 40, 0, 400);
        {
            let mut ctx = ctx(&settings, &mut events, 0);
            c.check_conn_update(&settings).unwrap();
            c.host_conn_update(req, &mut ctx);
            assert_eq!(c.current_proc(), Some(CtrlProc::ConnParamReq));
            sent(&mut c);

            let master_req = ConnParamData::new(6, 12, 0, 100);
            c.rx_pdu(
                &payload(ControlPdu::ConnectionParamReq(master_req)),
                &mut ctx,
            )
            .unwrap();
            assert!(!c.is_pending(CtrlProc::ConnParamReq));

            // LE Remote Connection Parameter Request is masked, so the controller accepts
            assert_eq!(
                sent(&mut c),
                vec![payload(ControlPdu::ConnectionParamRsp(master_req))]
            );
        }
        let ev = events.pop().unwrap();
        assert_eq!(&ev[..4], &[0x3E, 10, 0x03, 0x23]);
    }

    #[test]
    fn master_conn_param_collision() {
        let settings = Settings::default();
        let mut events = HostEvents::new();
        let mut c = conn(Role::Master, &settings);
        let mut ctx = ctx(&settings, &mut events, 0);

        c.host_conn_update(ConnParamData::new(24, 40, 0, 400), &mut ctx);
        assert_eq!(c.current_proc(), Some(CtrlProc::ConnParamReq));
        sent(&mut c);

        let slave_req = payload(ControlPdu::ConnectionParamReq(ConnParamData::new(
            6, 12, 0, 100,
        )));
        c.rx_pdu(&slave_req, &mut ctx).unwrap();
        assert_eq!(sent(&mut c), vec![vec![0x11, 0x0F, 0x23]]);
        assert_eq!(c.current_proc(), Some(CtrlProc::ConnParamReq));
    }

    #[test]
    fn master_chanmap_collision() {
        let settings = Settings::default();
        let mut events = HostEvents::new();
        let mut c = conn(Role::Master, &settings);
        let mut ctx = ctx(&settings, &mut events, 0);

        let mut raw = ChannelMap::with_all_channels().to_raw();
        raw[0] = 0xF0;
        c.host_set_chan_map(ChannelMap::from_raw(raw), &mut ctx);
        assert_eq!(c.current_proc(), Some(CtrlProc::ChanMapUpdate));
        sent(&mut c);

        let slave_req = payload(ControlPdu::ConnectionParamReq(ConnParamData::new(
            6, 12, 0, 100,
        )));
        c.rx_pdu(&slave_req, &mut ctx).unwrap();
        assert_eq!(sent(&mut c), vec![vec![0x11, 0x0F, 0x2A]]);
    }

    #[test]
    fn chanmap_applied_at_instant() {
        let settings = Settings::default();
        let mut events = HostEvents::new();
        let mut c = conn(Role::Master, &settings);
        let mut ctx = ctx(&settings, &mut events, 0);

        let mut raw = ChannelMap::with_all_channels().to_raw();
        raw[0] = 0xF0;
        let map = ChannelMap::from_raw(raw);
        c.conn_event_end(10, &mut ctx);
        c.host_set_chan_map(map, &mut ctx);
        // No response timeout for channel map updates
        assert!(c.check_timeout(Instant::from_raw_micros(100_000_000)).is_ok());

        c.conn_event_end(15, &mut ctx);
        assert_eq!(c.current_proc(), Some(CtrlProc::ChanMapUpdate));
        c.conn_event_end(16, &mut ctx);
        assert_eq!(c.current_proc(), None);
        assert_eq!(c.channel_map(), map);
    }

    #[test]
    fn update_with_passed_instant_ends_connection() {
        let settings = Settings::default();
        let mut events = HostEvents::new();
        let mut c = conn(Role::Slave, &settings);
        let mut ctx = ctx(&settings, &mut events, 0);
        c.conn_event_end(100, &mut ctx);

        let update = ConnectionUpdateData {
            win_size: 1,
            win_offset: 0,
            interval: 80,
            latency: 0,
            timeout: 400,
            instant: 50,
        };
        assert_eq!(
            c.rx_pdu(&payload(ControlPdu::ConnectionUpdateInd(update)), &mut ctx),
            Err(ErrorCode::InstantPassed)
        );

        let update = ConnectionUpdateData {
            instant: 105,
            ..update
        };
        c.rx_pdu(&payload(ControlPdu::ConnectionUpdateInd(update)), &mut ctx)
            .unwrap();
        c.conn_event_end(105, &mut ctx);
        assert_eq!(c.params().interval, 80);
    }

    #[test]
    fn response_timeout() {
        let settings = Settings::default();
        let mut events = HostEvents::new();
        let mut c = conn(Role::Master, &settings);
        c.proc_start(CtrlProc::VersionXchg, &mut ctx(&settings, &mut events, 1_000));

        assert_eq!(c.check_timeout(Instant::from_raw_micros(40_000_999)), Ok(()));
        assert_eq!(
            c.check_timeout(Instant::from_raw_micros(40_001_000)),
            Err(ErrorCode::LlResponseTimeout)
        );
    }

    #[test]
    fn unknown_conn_param_req_falls_back_to_update() {
        let settings = Settings::default();
        let mut events = HostEvents::new();
        let mut c = conn(Role::Master, &settings);
        let mut ctx = ctx(&settings, &mut events, 0);

        c.host_conn_update(ConnParamData::new(24, 40, 2, 400), &mut ctx);
        sent(&mut c);
        c.rx_pdu(&[0x07, 0x0F], &mut ctx).unwrap();
        assert_eq!(c.current_proc(), Some(CtrlProc::ConnUpdate));

        let tx = sent(&mut c);
        assert_eq!(tx.len(), 1);
        assert_eq!(tx[0][0], 0x00);
        // interval_max, latency, timeout
        assert_eq!(&tx[0][4..10], &[40, 0, 2, 0, 0x90, 0x01]);
    }

    #[test]
    fn known_version_is_not_exchanged_again() {
        let settings = Settings::default();
        let mut events = HostEvents::new();
        let mut c = conn(Role::Slave, &settings);
        {
            let mut ctx = ctx(&settings, &mut events, 0);
            c.rx_pdu(&payload(version_ind(&settings)), &mut ctx).unwrap();
            // We answer with our own version exactly once
            c.rx_pdu(&payload(version_ind(&settings)), &mut ctx).unwrap();
            assert_eq!(sent(&mut c).len(), 1);

            c.host_read_version(&mut ctx);
            assert!(sent(&mut c).is_empty());
            assert!(!c.is_pending(CtrlProc::VersionXchg));
        }
        let ev = events.pop().unwrap();
        assert_eq!(ev[0], 0x0C);
    }

    #[test]
    fn peer_terminate_ends_connection() {
        let settings = Settings::default();
        let mut events = HostEvents::new();
        let mut c = conn(Role::Slave, &settings);
        let mut ctx = ctx(&settings, &mut events, 0);

        assert_eq!(
            c.rx_pdu(&[0x02, 0x13], &mut ctx),
            Err(ErrorCode::RemoteUserTerminated)
        );

        c.host_terminate(ErrorCode::RemoteUserTerminated, &mut ctx);
        assert_eq!(c.check_terminate(), Err(ErrorCode::CommandDisallowed));
        assert_eq!(c.next_tx().unwrap()[2..], [0x02, 0x13]);
        assert_eq!(
            c.ctrl_tx_done(&mut ctx),
            Err(ErrorCode::LocalHostTerminated)
        );
    }

    #[test]
    fn remote_features_reported_once_exchanged() {
        let settings = Settings::default();
        let mut events = le_events();
        let mut c = conn(Role::Master, &settings);
        {
            let mut ctx = ctx(&settings, &mut events, 0);
            c.host_read_features(&mut ctx);
            sent(&mut c);
            let rsp = ControlPdu::FeatureRsp {
                features: FeatureSet::LE_PING,
            };
            c.rx_pdu(&payload(rsp), &mut ctx).unwrap();
            assert_eq!(c.remote_features(), Some(FeatureSet::LE_PING));
            assert_eq!(c.current_proc(), None);
        }
        let ev = events.pop().unwrap();
        assert_eq!(&ev[..6], &[0x3E, 12, 0x04, 0x00, 1, 0]);
        assert_eq!(ev[6], FeatureSet::LE_PING.bits() as u8);
    }
}
