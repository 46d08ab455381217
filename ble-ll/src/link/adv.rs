//! The advertising state machine.
//!
//! An *advertising event* sends the advertising PDU once on every channel enabled in the channel
//! map, in ascending order, with a short gap between the PDUs. Events repeat every advertising
//! interval plus a random delay of up to 10 ms. Every PDU transmission is a separate schedule item
//! reserving enough time to also receive a scan request and send the scan response.

use crate::{
    bytes::ByteReader,
    config::Settings,
    hci::ErrorCode,
    link::{
        advertising::{Header, Pdu, PduBuf, PduType},
        filter::AddressFilter,
        AddressKind, DeviceAddress, LlEvent,
    },
    phy::{AdvertisingChannel, Radio, RxDecision, TxMode},
    sched::{ItemId, SchedCb, SchedItem, SchedStatus, SchedType, Scheduler},
    time::{Duration, Instant, Timer},
    Error,
};
use heapless::{Deque, Vec};
use rand_core::RngCore;

/// Time reserved for a single advertising PDU: `ADV + IFS + SCAN_REQ + IFS + SCAN_RSP`.
pub const ADV_PDU_WINDOW: Duration = Duration::from_micros(376 + 150 + 176 + 150 + 376);

/// Gap between PDUs of a high duty cycle directed advertising event.
const PDU_ITVL_HD: Duration = Duration::from_millis(5);

/// How long high duty cycle directed advertising may last.
const HD_DIRECTED_MAX: Duration = Duration::from_millis(1280);

/// Gap between PDUs of all other advertising events.
const PDU_ITVL_LD: Duration = Duration::from_millis(10);

/// Upper bound (exclusive) of the random delay added to every advertising interval, in µs.
const ADV_DELAY_MAX_US: u32 = 10_000;

const ITVL_MIN: u16 = 0x0020;
const ITVL_NONCONN_MIN: u16 = 0x00A0;
const ITVL_MAX: u16 = 0x4000;

/// Length of the *LE Set Advertising Parameters* command parameters.
pub const ADV_PARAMS_LEN: usize = 15;

/// Length of the *LE Set Advertising Data* and *LE Set Scan Response Data* parameters.
pub const ADV_DATA_CMD_LEN: usize = 32;

enum_with_unknown! {
    /// Advertising type selected via *LE Set Advertising Parameters*.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum AdvType(u8) {
        /// Connectable and scannable undirected (`ADV_IND`).
        AdvInd = 0x00,
        /// High duty cycle connectable directed (`ADV_DIRECT_IND`).
        DirectIndHighDuty = 0x01,
        /// Scannable undirected (`ADV_SCAN_IND`).
        ScanInd = 0x02,
        /// Non-connectable undirected (`ADV_NONCONN_IND`).
        NonconnInd = 0x03,
        /// Low duty cycle connectable directed (`ADV_DIRECT_IND`).
        DirectIndLowDuty = 0x04,
    }
}

impl AdvType {
    fn pdu_type(&self) -> PduType {
        match self {
            AdvType::AdvInd => PduType::AdvInd,
            AdvType::DirectIndHighDuty | AdvType::DirectIndLowDuty => PduType::AdvDirectInd,
            AdvType::ScanInd => PduType::AdvScanInd,
            AdvType::NonconnInd | AdvType::Unknown(_) => PduType::AdvNonconnInd,
        }
    }

    fn is_scannable(&self) -> bool {
        matches!(self, AdvType::AdvInd | AdvType::ScanInd)
    }

    fn is_directed(&self) -> bool {
        matches!(self, AdvType::DirectIndHighDuty | AdvType::DirectIndLowDuty)
    }
}

/// Own address type field of HCI commands.
///
/// Values 2 and 3 ask for a resolvable private address. Address resolution is not part of the
/// controller, so they fall back to the public and random address, respectively.
pub(crate) fn own_address(
    own_addr_type: u8,
    settings: &Settings,
    random_addr: Option<DeviceAddress>,
) -> Result<DeviceAddress, ErrorCode> {
    match own_addr_type {
        0 | 2 => Ok(settings.public_addr),
        1 | 3 => random_addr.ok_or(ErrorCode::CommandDisallowed),
        _ => Err(ErrorCode::InvalidParameters),
    }
}

/// Validated advertising parameters.
#[derive(Debug, Copy, Clone)]
pub struct AdvParams {
    pub itvl_min: u16,
    pub itvl_max: u16,
    pub ty: AdvType,
    pub own_addr_type: u8,
    pub peer_addr: DeviceAddress,
    pub chan_mask: u8,
    pub filter_policy: u8,
}

impl AdvParams {
    /// Parses and validates the parameters of *LE Set Advertising Parameters*.
    pub fn parse(cmd: &[u8]) -> Result<Self, ErrorCode> {
        let mut bytes = ByteReader::new(cmd);
        let mut read = || -> Result<Self, Error> {
            let itvl_min = bytes.read_u16_le()?;
            let itvl_max = bytes.read_u16_le()?;
            let ty = AdvType::from(bytes.read_u8()?);
            let own_addr_type = bytes.read_u8()?;
            let peer_addr_type = bytes.read_u8()?;
            let peer_addr = bytes.read_array()?;
            let chan_mask = bytes.read_u8()?;
            let filter_policy = bytes.read_u8()?;
            bytes.finish()?;

            if peer_addr_type > 1 {
                return Err(Error::InvalidValue);
            }
            Ok(Self {
                itvl_min,
                itvl_max,
                ty,
                own_addr_type,
                peer_addr: DeviceAddress::new(peer_addr, AddressKind::from_bit(peer_addr_type == 1)),
                chan_mask,
                filter_policy,
            })
        };
        let params = read().map_err(|_| ErrorCode::InvalidParameters)?;

        let min_itvl = match params.ty {
            AdvType::AdvInd | AdvType::DirectIndHighDuty | AdvType::DirectIndLowDuty => ITVL_MIN,
            AdvType::NonconnInd | AdvType::ScanInd => ITVL_NONCONN_MIN,
            AdvType::Unknown(_) => return Err(ErrorCode::InvalidParameters),
        };

        let valid = params.itvl_min < params.itvl_max
            && params.itvl_min >= min_itvl
            && params.itvl_max <= ITVL_MAX
            && params.own_addr_type <= 3
            && params.chan_mask & !0b111 == 0
            && params.chan_mask != 0
            && params.filter_policy <= 3;
        if valid {
            Ok(params)
        } else {
            Err(ErrorCode::InvalidParameters)
        }
    }

    /// Returns the first channel of an advertising event.
    fn first_channel(&self) -> AdvertisingChannel {
        (0..3)
            .find(|bit| self.chan_mask & (1 << bit) != 0)
            .and_then(AdvertisingChannel::from_map_bit)
            .unwrap_or_else(AdvertisingChannel::first)
    }

    /// Returns the last channel of an advertising event.
    fn last_channel(&self) -> AdvertisingChannel {
        (0..3)
            .rev()
            .find(|bit| self.chan_mask & (1 << bit) != 0)
            .and_then(AdvertisingChannel::from_map_bit)
            .unwrap_or_else(AdvertisingChannel::first)
    }

    fn interval(&self) -> Duration {
        Duration::from_625us_units(self.itvl_max)
    }
}

/// Advertiser statistics.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct AdvStats {
    /// PDUs whose planned start time had already passed.
    pub late: u32,

    /// PDUs that could not be put into the schedule.
    pub sched_fail: u32,

    /// Scan responses sent.
    pub scan_rsp_tx: u32,

    /// Connect requests addressed to us.
    pub conn_req_rx: u32,
}

/// The advertising state machine.
pub struct Advertiser {
    enabled: bool,
    params: Option<AdvParams>,
    adv_data: Vec<u8, 31>,
    scan_rsp_data: Vec<u8, 31>,

    /// Address we advertise with. Fixed when advertising is enabled.
    adv_addr: DeviceAddress,
    adv_pdu: Option<PduBuf>,
    scan_rsp_pdu: Option<PduBuf>,

    channel: AdvertisingChannel,
    event_start: Instant,
    pdu_start: Instant,

    /// End of high duty cycle directed advertising.
    hd_end: Option<Instant>,

    /// Scheduling failed and the advertiser is waiting for the fallback wakeup.
    retry_pending: bool,

    stats: AdvStats,
}

impl Advertiser {
    pub fn new() -> Self {
        let zero = Instant::from_raw_micros(0);
        Self {
            enabled: false,
            params: None,
            adv_data: Vec::new(),
            scan_rsp_data: Vec::new(),
            adv_addr: DeviceAddress::new([0; 6], AddressKind::Public),
            adv_pdu: None,
            scan_rsp_pdu: None,
            channel: AdvertisingChannel::first(),
            event_start: zero,
            pdu_start: zero,
            hd_end: None,
            retry_pending: false,
            stats: AdvStats::default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn stats(&self) -> &AdvStats {
        &self.stats
    }

    pub fn params(&self) -> Option<&AdvParams> {
        self.params.as_ref()
    }

    /// Returns whether the active filter policy uses the white list.
    pub fn uses_whitelist(&self) -> bool {
        self.enabled && self.params.map_or(false, |p| p.filter_policy != 0)
    }

    /// Returns the channel the next PDU will be sent on.
    pub fn channel(&self) -> AdvertisingChannel {
        self.channel
    }

    /// Handles *LE Set Advertising Parameters*.
    ///
    /// A failed attempt invalidates previously set parameters.
    pub fn set_params(&mut self, cmd: &[u8]) -> Result<(), ErrorCode> {
        if self.enabled {
            return Err(ErrorCode::CommandDisallowed);
        }

        self.params = None;
        self.params = Some(AdvParams::parse(cmd)?);
        Ok(())
    }

    /// Handles *LE Set Advertising Data*.
    pub fn set_adv_data(&mut self, cmd: &[u8]) -> Result<(), ErrorCode> {
        self.adv_data = parse_data_cmd(cmd)?;
        if self.enabled {
            self.build_pdus()?;
        }
        Ok(())
    }

    /// Handles *LE Set Scan Response Data*.
    pub fn set_scan_rsp_data(&mut self, cmd: &[u8]) -> Result<(), ErrorCode> {
        self.scan_rsp_data = parse_data_cmd(cmd)?;
        if self.enabled {
            self.build_pdus()?;
        }
        Ok(())
    }

    /// Enables advertising with `adv_addr` as our address.
    ///
    /// The first event starts at `now`. The caller must schedule the first PDU afterwards. Enabling
    /// an already enabled advertiser does nothing.
    pub fn start(&mut self, adv_addr: DeviceAddress, now: Instant) -> Result<(), ErrorCode> {
        if self.enabled {
            return Ok(());
        }
        let params = self.params.ok_or(ErrorCode::CommandDisallowed)?;

        self.adv_addr = adv_addr;
        self.build_pdus()?;
        self.channel = params.first_channel();
        self.event_start = now;
        self.pdu_start = now;
        self.hd_end = if params.ty == AdvType::DirectIndHighDuty {
            Some(now + HD_DIRECTED_MAX)
        } else {
            None
        };
        self.retry_pending = false;
        self.enabled = true;
        debug!("adv: start {:?} as {:?}", params.ty, adv_addr);
        Ok(())
    }

    /// Disables advertising and removes all its schedule items.
    pub fn stop<T: Timer, const N: usize>(&mut self, sched: &mut Scheduler<N>, timer: &mut T) {
        if self.enabled {
            debug!("adv: stop");
        }
        sched.remove_all(SchedType::Adv, timer);
        self.enabled = false;
        self.retry_pending = false;
        self.scan_rsp_pdu = None;
    }

    /// Forgets parameters, data and statistics.
    pub fn reset<T: Timer, const N: usize>(&mut self, sched: &mut Scheduler<N>, timer: &mut T) {
        self.stop(sched, timer);
        *self = Self::new();
    }

    fn build_pdus(&mut self) -> Result<(), ErrorCode> {
        let params = self.params.ok_or(ErrorCode::CommandDisallowed)?;
        let adv = if params.ty.is_directed() {
            PduBuf::directed(self.adv_addr, params.peer_addr)
        } else {
            PduBuf::undirected(params.ty.pdu_type(), self.adv_addr, &self.adv_data)
        };
        self.adv_pdu = Some(adv.map_err(|_| ErrorCode::InvalidParameters)?);

        self.scan_rsp_pdu = if params.ty != AdvType::NonconnInd && !self.scan_rsp_data.is_empty()
        {
            let rsp = PduBuf::scan_response(self.adv_addr, &self.scan_rsp_data)
                .map_err(|_| ErrorCode::InvalidParameters)?;
            Some(rsp)
        } else {
            None
        };
        Ok(())
    }

    /// Puts the next PDU transmission into the schedule.
    ///
    /// On failure, no item is left allocated and the caller decides how to proceed.
    pub fn schedule<T: Timer, const N: usize>(
        &mut self,
        sched: &mut Scheduler<N>,
        timer: &mut T,
        settings: &Settings,
    ) -> Result<(), Error> {
        let id: ItemId = sched.get_item().ok_or(Error::NoSchedItem)?;
        {
            let item = sched.item_mut(id);
            item.sched_type = SchedType::Adv;
            item.cb = SchedCb::AdvTxStart;
            item.start = self.pdu_start - settings.tx_sched_delay;
            item.end = item.start + ADV_PDU_WINDOW;
        }

        sched.add(id, timer).map_err(|e| {
            sched.free_item(id);
            e
        })
    }

    /// Records a scheduling failure.
    pub fn sched_failed(&mut self, retry: bool) {
        self.stats.sched_fail += 1;
        if retry {
            self.retry_pending = true;
        } else {
            warn!("adv: cannot schedule, stopping");
            self.enabled = false;
        }
    }

    /// Returns whether a retry is waiting for the scheduler's fallback wakeup.
    pub fn retry_pending(&self) -> bool {
        self.enabled && self.retry_pending
    }

    /// Restarts the advertising event sequence at `now` after a scheduling failure.
    pub fn restart_at(&mut self, now: Instant) {
        if let Some(params) = self.params {
            self.channel = params.first_channel();
        }
        self.event_start = now;
        self.pdu_start = now;
        self.retry_pending = false;
    }

    /// Schedule callback: transmits the advertising PDU on the current channel.
    pub fn tx_start<R: Radio, const Q: usize>(
        &mut self,
        item: &mut SchedItem,
        radio: &mut R,
        ll_events: &mut Deque<LlEvent, Q>,
    ) -> SchedStatus {
        let (pdu, ty) = match (&self.adv_pdu, self.params) {
            (Some(pdu), Some(params)) if self.enabled => (pdu, params.ty),
            _ => return SchedStatus::Done,
        };

        let mode = if ty == AdvType::NonconnInd {
            TxMode::Tx
        } else {
            TxMode::TxRx
        };

        let result = radio
            .set_channel(self.channel)
            .and_then(|_| radio.tx(pdu.as_bytes(), mode));
        match result {
            Ok(()) => {
                trace!("adv: tx on {} {:?}", self.channel.index(), pdu);
                item.next_wakeup = item.end;
                item.cb = SchedCb::AdvTxDone;
                SchedStatus::Running
            }
            Err(e) => {
                warn!("adv: tx failed: {}", e);
                self.tx_done(radio, ll_events)
            }
        }
    }

    /// Schedule callback: the time slot of the current PDU is over.
    pub fn tx_done<R: Radio, const Q: usize>(
        &mut self,
        radio: &mut R,
        ll_events: &mut Deque<LlEvent, Q>,
    ) -> SchedStatus {
        radio.disable();
        if ll_events.push_back(LlEvent::AdvEventDone).is_err() {
            warn!("adv: LL event queue full");
        }
        SchedStatus::Done
    }

    /// Advances to the next PDU after one was sent (LL task).
    ///
    /// Afterwards, the caller must schedule the next PDU. High duty cycle directed advertising
    /// disables itself when its time is up, returning `AdvertisingTimeout`.
    pub fn event_done<G: RngCore>(
        &mut self,
        now: Instant,
        rng: &mut G,
    ) -> Result<(), ErrorCode> {
        let params = match self.params {
            Some(params) if self.enabled => params,
            _ => return Ok(()),
        };

        if self.channel == params.last_channel() {
            self.channel = params.first_channel();
            self.event_start += next_event_delay(&params, rng);
            self.pdu_start = self.event_start;
        } else {
            self.channel = self.channel.cycle();
            if params.chan_mask & self.channel.map_bit() == 0 {
                self.channel = self.channel.cycle();
            }

            self.pdu_start += if params.ty == AdvType::DirectIndHighDuty {
                PDU_ITVL_HD
            } else {
                PDU_ITVL_LD
            };
        }

        if self.pdu_start.is_before(now) {
            self.stats.late += 1;
            warn!("adv: late by {}", now - self.pdu_start);
            self.channel = params.first_channel();
            while self.pdu_start.is_before(now) {
                self.event_start += next_event_delay(&params, rng);
                self.pdu_start = self.event_start;
            }
        }

        match self.hd_end {
            Some(end) if !self.pdu_start.is_before(end) => {
                info!("adv: directed advertising timed out");
                self.enabled = false;
                self.hd_end = None;
                Err(ErrorCode::AdvertisingTimeout)
            }
            _ => Ok(()),
        }
    }

    /// Radio callback: a PDU header was received after one of our PDUs.
    pub fn rx_start(&self, header: Header) -> RxDecision {
        let params = match self.params {
            Some(params) if self.enabled => params,
            _ => return RxDecision::NotInterested,
        };

        match header.type_() {
            PduType::ScanReq if params.ty.is_scannable() && self.scan_rsp_pdu.is_some() => {
                RxDecision::MayReply
            }
            PduType::ConnectReq if params.ty != AdvType::NonconnInd => RxDecision::MayReply,
            _ => RxDecision::NotInterested,
        }
    }

    /// Radio callback: a PDU was received completely.
    ///
    /// A scan request for us is answered right away by handing the scan response to the radio.
    pub fn rx_end<R: Radio>(
        &mut self,
        pdu: &PduBuf,
        crc_ok: bool,
        radio: &mut R,
        whitelist: &dyn AddressFilter,
    ) -> RxDecision {
        let params = match self.params {
            Some(params) if self.enabled => params,
            _ => return RxDecision::NotInterested,
        };
        if !crc_ok {
            return RxDecision::NotInterested;
        }

        match pdu.decode() {
            Ok(Pdu::ScanRequest {
                scanner_addr,
                advertiser_addr,
            }) => {
                let rsp = match &self.scan_rsp_pdu {
                    Some(rsp) if params.ty.is_scannable() => rsp,
                    _ => return RxDecision::NotInterested,
                };
                if advertiser_addr != self.adv_addr {
                    return RxDecision::NotInterested;
                }
                if params.filter_policy & 0b01 != 0 && !whitelist.matches(&scanner_addr) {
                    return RxDecision::NotInterested;
                }

                match radio.tx(rsp.as_bytes(), TxMode::Tx) {
                    Ok(()) => {
                        trace!("adv: scan rsp to {:?}", scanner_addr);
                        self.stats.scan_rsp_tx += 1;
                        RxDecision::WillReply
                    }
                    Err(_) => RxDecision::NotInterested,
                }
            }
            Ok(Pdu::ConnectRequest {
                initiator_addr,
                advertiser_addr,
                ..
            }) => {
                if advertiser_addr == self.adv_addr
                    && (params.filter_policy & 0b10 == 0 || whitelist.matches(&initiator_addr))
                {
                    // Entering the connection state is not supported, the request is declined.
                    self.stats.conn_req_rx += 1;
                    debug!("adv: connect request from {:?}", initiator_addr);
                }
                RxDecision::NotInterested
            }
            _ => RxDecision::NotInterested,
        }
    }
}

fn parse_data_cmd(cmd: &[u8]) -> Result<Vec<u8, 31>, ErrorCode> {
    let (&len, rest) = cmd.split_first().ok_or(ErrorCode::InvalidParameters)?;
    let len = usize::from(len);
    if len > 31 || rest.len() < len {
        return Err(ErrorCode::InvalidParameters);
    }
    Vec::from_slice(&rest[..len]).map_err(|_| ErrorCode::InvalidParameters)
}

fn next_event_delay<G: RngCore>(params: &AdvParams, rng: &mut G) -> Duration {
    params.interval() + Duration::from_micros(rng.next_u32() % ADV_DELAY_MAX_US)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockRadio, PretendRng};

    fn params_cmd(itvl_min: u16, itvl_max: u16, ty: u8, chan_mask: u8) -> [u8; ADV_PARAMS_LEN] {
        let mut cmd = [0; ADV_PARAMS_LEN];
        cmd[0..2].copy_from_slice(&itvl_min.to_le_bytes());
        cmd[2..4].copy_from_slice(&itvl_max.to_le_bytes());
        cmd[4] = ty;
        cmd[7..13].copy_from_slice(&[1, 2, 3, 4, 5, 6]);
        cmd[13] = chan_mask;
        cmd
    }

    fn at(micros: u32) -> Instant {
        Instant::from_raw_micros(micros)
    }

    #[test]
    fn params_validation() {
        let mut adv = Advertiser::new();
        assert!(adv.set_params(&params_cmd(0x20, 0x30, 0, 7)).is_ok());

        let bad = [
            params_cmd(0x30, 0x30, 0, 7),   // min == max
            params_cmd(0x1F, 0x30, 0, 7),   // below connectable minimum
            params_cmd(0x20, 0x30, 3, 7),   // below non-connectable minimum
            params_cmd(0xA0, 0x4001, 3, 7), // above maximum
            params_cmd(0x20, 0x30, 5, 7),   // unknown type
            params_cmd(0x20, 0x30, 0, 0),   // no channel
            params_cmd(0x20, 0x30, 0, 8),   // no such channel
        ];
        for cmd in &bad {
            assert_eq!(adv.set_params(cmd), Err(ErrorCode::InvalidParameters));
        }
        // The failed attempts invalidated the parameters
        assert!(adv.params().is_none());

        let mut cmd = params_cmd(0x20, 0x30, 0, 7);
        cmd[5] = 4;
        assert_eq!(adv.set_params(&cmd), Err(ErrorCode::InvalidParameters));
        cmd[5] = 0;
        cmd[14] = 4;
        assert_eq!(adv.set_params(&cmd), Err(ErrorCode::InvalidParameters));
        assert_eq!(
            adv.set_params(&cmd[..14]),
            Err(ErrorCode::InvalidParameters)
        );
    }

    #[test]
    fn params_locked_while_enabled() {
        let mut adv = Advertiser::new();
        let own = DeviceAddress::new([9; 6], AddressKind::Public);
        assert_eq!(adv.start(own, at(0)), Err(ErrorCode::CommandDisallowed));
        adv.set_params(&params_cmd(0x20, 0x30, 0, 7)).unwrap();
        adv.start(own, at(0)).unwrap();
        assert_eq!(
            adv.set_params(&params_cmd(0x20, 0x30, 0, 7)),
            Err(ErrorCode::CommandDisallowed)
        );
    }

    #[test]
    fn data_length_checked() {
        let mut adv = Advertiser::new();
        let mut cmd = [0; ADV_DATA_CMD_LEN];
        cmd[0] = 31;
        assert!(adv.set_adv_data(&cmd).is_ok());
        cmd[0] = 32;
        assert_eq!(adv.set_adv_data(&cmd), Err(ErrorCode::InvalidParameters));
        assert_eq!(
            adv.set_scan_rsp_data(&cmd),
            Err(ErrorCode::InvalidParameters)
        );
    }

    #[test]
    fn event_visits_masked_channels() {
        let mut adv = Advertiser::new();
        let mut rng = PretendRng::new(1234);
        adv.set_params(&params_cmd(0x20, 0xA0, 0, 0b101)).unwrap();
        adv.start(DeviceAddress::new([9; 6], AddressKind::Public), at(0))
            .unwrap();
        assert_eq!(adv.channel().index(), 37);

        adv.event_done(at(1_000), &mut rng).unwrap();
        assert_eq!(adv.channel().index(), 39);
        assert_eq!(adv.pdu_start, at(10_000));

        adv.event_done(at(11_000), &mut rng).unwrap();
        assert_eq!(adv.channel().index(), 37);
        // 0xA0 * 625 µs + 1234 µs delay
        assert_eq!(adv.pdu_start, at(100_000 + 1_234));
        assert_eq!(adv.stats().late, 0);
    }

    #[test]
    fn late_event_skips_ahead() {
        let mut adv = Advertiser::new();
        let mut rng = PretendRng::new(0);
        adv.set_params(&params_cmd(0x20, 0xA0, 0, 0b111)).unwrap();
        adv.start(DeviceAddress::new([9; 6], AddressKind::Public), at(0))
            .unwrap();

        adv.event_done(at(250_000), &mut rng).unwrap();
        assert_eq!(adv.stats().late, 1);
        assert_eq!(adv.channel().index(), 37);
        assert_eq!(adv.pdu_start, at(300_000));
    }

    #[test]
    fn high_duty_directed_stops_after_deadline() {
        let mut adv = Advertiser::new();
        let mut rng = PretendRng::new(0);
        adv.set_params(&params_cmd(0x20, 0x30, 1, 0b111)).unwrap();
        adv.start(DeviceAddress::new([9; 6], AddressKind::Public), at(0))
            .unwrap();

        let mut next = 0;
        loop {
            let now = adv.pdu_start;
            match adv.event_done(now, &mut rng) {
                Ok(()) => next += 1,
                Err(status) => {
                    assert_eq!(status, ErrorCode::AdvertisingTimeout);
                    break;
                }
            }
            assert!(next < 1000);
        }
        assert_eq!(next, 128);
        assert!(!adv.is_enabled());
        assert_eq!(adv.event_done(at(2_000_000), &mut rng), Ok(()));
    }

    #[test]
    fn low_duty_directed_keeps_going() {
        let mut adv = Advertiser::new();
        let mut rng = PretendRng::new(0);
        adv.set_params(&params_cmd(0x20, 0x30, 4, 0b111)).unwrap();
        adv.start(DeviceAddress::new([9; 6], AddressKind::Public), at(0))
            .unwrap();

        for _ in 0..300 {
            let now = adv.pdu_start;
            adv.event_done(now, &mut rng).unwrap();
        }
        assert!(adv.is_enabled());
        assert!(at(2_000_000).is_before(adv.pdu_start));
    }

    #[test]
    fn nonconn_is_tx_only() {
        let mut adv = Advertiser::new();
        let mut radio = MockRadio::new();
        let mut events = Deque::<LlEvent, 4>::new();
        adv.set_params(&params_cmd(0xA0, 0xB0, 3, 0b010)).unwrap();
        adv.start(DeviceAddress::new([9; 6], AddressKind::Random), at(0))
            .unwrap();

        let mut item = SchedItem {
            start: at(0),
            end: at(0) + ADV_PDU_WINDOW,
            next_wakeup: at(0),
            sched_type: SchedType::Adv,
            cb: SchedCb::AdvTxStart,
            arg: 0,
        };
        assert_eq!(
            adv.tx_start(&mut item, &mut radio, &mut events),
            SchedStatus::Running
        );
        assert_eq!(item.next_wakeup, at(1228));
        assert_eq!(radio.channel.map(|c| c.index()), Some(38));
        let (pdu, mode) = &radio.sent[0];
        assert_eq!(*mode, TxMode::Tx);
        // ADV_NONCONN_IND with TxAdd set
        assert_eq!(pdu[0], 0x42);

        radio.fail_tx = true;
        assert_eq!(
            adv.tx_start(&mut item, &mut radio, &mut events),
            SchedStatus::Done
        );
        assert_eq!(events.pop_front(), Some(LlEvent::AdvEventDone));
    }
}
