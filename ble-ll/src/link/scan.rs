//! The scanning state machine.
//!
//! The scanner listens on one advertising channel per *scan window*, moving on to the next channel
//! for every window. In active scanning, it answers scannable advertisements with a `SCAN_REQ`,
//! throttled by the backoff procedure described in Vol 6, Part B, Section 4.4.3.2 of the Core
//! Specification. Everything received is turned into advertising reports for the host.

use crate::{
    bytes::ByteReader,
    config::{ScanRspPolicy, SCAN_DUP_ADVS, SCAN_RSP_ADVS},
    hci::{ErrorCode, HostEvents},
    link::{
        advertising::{Header, Pdu, PduBuf, PduType},
        filter::AddressFilter,
        AddressKind, DeviceAddress, LlEvent,
    },
    phy::{AdvertisingChannel, Radio, RxDecision, TxMode},
    sched::{SchedCb, SchedItem, SchedStatus, SchedType, Scheduler},
    time::{Duration, Instant, Timer},
    Error,
};
use bitflags::bitflags;
use heapless::{Deque, Vec};
use rand_core::RngCore;

/// Length of the *LE Set Scan Parameters* command parameters.
pub const SCAN_PARAMS_LEN: usize = 7;

const SCAN_ITVL_MIN: u16 = 0x0004;
const SCAN_ITVL_MAX: u16 = 0x4000;

/// Largest value the backoff upper limit can reach.
const BACKOFF_MAX: u16 = 256;

/// Whether the scanner sends scan requests.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ScanType {
    Passive,
    Active,
}

/// Validated scan parameters.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ScanParams {
    pub ty: ScanType,
    /// Scan interval in 625 µs units.
    pub itvl: u16,
    /// Scan window in 625 µs units.
    pub window: u16,
    pub own_addr_type: u8,
    pub filter_policy: u8,
}

impl Default for ScanParams {
    fn default() -> Self {
        Self {
            ty: ScanType::Passive,
            itvl: 0x0010,
            window: 0x0010,
            own_addr_type: 0,
            filter_policy: 0,
        }
    }
}

impl ScanParams {
    /// Parses and validates the parameters of *LE Set Scan Parameters*.
    pub fn parse(cmd: &[u8]) -> Result<Self, ErrorCode> {
        let mut bytes = ByteReader::new(cmd);
        let mut read = || -> Result<(u8, u16, u16, u8, u8), Error> {
            let fields = (
                bytes.read_u8()?,
                bytes.read_u16_le()?,
                bytes.read_u16_le()?,
                bytes.read_u8()?,
                bytes.read_u8()?,
            );
            bytes.finish()?;
            Ok(fields)
        };
        let (ty, itvl, window, own_addr_type, filter_policy) =
            read().map_err(|_| ErrorCode::InvalidParameters)?;

        let range = SCAN_ITVL_MIN..=SCAN_ITVL_MAX;
        let valid = ty <= 1
            && range.contains(&itvl)
            && range.contains(&window)
            && window <= itvl
            && own_addr_type <= 3
            && filter_policy <= 3;
        if !valid {
            return Err(ErrorCode::InvalidParameters);
        }

        Ok(Self {
            ty: if ty == 1 {
                ScanType::Active
            } else {
                ScanType::Passive
            },
            itvl,
            window,
            own_addr_type,
            filter_policy,
        })
    }

    fn interval(&self) -> Duration {
        Duration::from_625us_units(self.itvl)
    }

    fn window(&self) -> Duration {
        Duration::from_625us_units(self.window)
    }
}

/// Active scanning backoff state.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Backoff {
    upper_limit: u16,
    count: u16,
    cons_ok: u8,
    cons_fails: u8,
}

impl Backoff {
    pub fn new() -> Self {
        Self {
            upper_limit: 1,
            count: 1,
            cons_ok: 0,
            cons_fails: 0,
        }
    }

    pub fn upper_limit(&self) -> u16 {
        self.upper_limit
    }

    pub fn count(&self) -> u16 {
        self.count
    }

    pub fn cons_ok(&self) -> u8 {
        self.cons_ok
    }

    pub fn cons_fails(&self) -> u8 {
        self.cons_fails
    }

    /// Consumes one scan request opportunity. Returns `true` when a request may be sent.
    pub fn tick(&mut self) -> bool {
        self.count = self.count.saturating_sub(1);
        self.count == 0
    }

    /// Records the outcome of a scan request and draws a new backoff count.
    pub fn update<G: RngCore>(&mut self, success: bool, rng: &mut G) {
        if success {
            self.cons_fails = 0;
            self.cons_ok += 1;
            if self.cons_ok == 2 {
                self.cons_ok = 0;
                if self.upper_limit > 1 {
                    self.upper_limit /= 2;
                }
            }
        } else {
            self.cons_ok = 0;
            self.cons_fails += 1;
            if self.cons_fails == 2 {
                self.cons_fails = 0;
                if self.upper_limit < BACKOFF_MAX {
                    self.upper_limit *= 2;
                }
            }
        }

        self.count = (rng.next_u32() as u16 & (self.upper_limit - 1)) + 1;
    }
}

bitflags! {
    /// Per-advertiser flags kept in the scanner's lists.
    pub struct AdvFlags: u8 {
        const RANDOM_ADDR = 0x01;
        const SCAN_RSP_RXD = 0x02;
        const DIRECT_RPT_SENT = 0x04;
        const ADV_RPT_SENT = 0x08;
        const SCAN_RSP_SENT = 0x10;
    }
}

/// An advertiser remembered by the scanner.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AdvEntry {
    addr: [u8; 6],
    flags: AdvFlags,
}

impl AdvEntry {
    fn matches(&self, addr: &DeviceAddress) -> bool {
        self.addr == *addr.raw() && self.flags.contains(AdvFlags::RANDOM_ADDR) == addr.is_random()
    }
}

fn find<'a, const N: usize>(
    list: &'a mut Vec<AdvEntry, N>,
    addr: &DeviceAddress,
) -> Option<&'a mut AdvEntry> {
    list.iter_mut().find(|entry| entry.matches(addr))
}

/// Sets `flags` on the entry for `addr`, adding one if needed. Adds to a full list are dropped.
fn add_flags<const N: usize>(list: &mut Vec<AdvEntry, N>, addr: &DeviceAddress, flags: AdvFlags) {
    if let Some(entry) = find(list, addr) {
        entry.flags |= flags;
        return;
    }

    let mut entry_flags = flags;
    entry_flags.set(AdvFlags::RANDOM_ADDR, addr.is_random());
    let entry = AdvEntry {
        addr: *addr.raw(),
        flags: entry_flags,
    };
    if list.push(entry).is_err() {
        trace!("scan: list full, dropping {:?}", addr);
    }
}

/// Scanner statistics.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct ScanStats {
    /// Scan windows skipped because they were already over.
    pub late: u32,

    /// Scan windows that could not be put into the schedule.
    pub sched_fail: u32,

    /// Scan requests sent.
    pub scan_req_tx: u32,

    /// Scan requests that went unanswered.
    pub scan_req_fail: u32,

    /// Advertising reports sent to the host.
    pub reports: u32,
}

/// The scanning state machine.
pub struct Scanner {
    enabled: bool,
    params: ScanParams,
    filter_dups: bool,

    /// Address sent in `SCAN_REQ`s. Fixed when scanning is enabled.
    scan_addr: DeviceAddress,

    channel: AdvertisingChannel,
    window_start: Instant,

    backoff: Backoff,
    scan_rsp_pending: bool,
    /// A `SCAN_RSP` header arrived while a response was pending.
    scan_rsp_chk: bool,
    /// Advertiser the outstanding scan request was sent to.
    pending_adv: Option<DeviceAddress>,

    /// Advertisers we received a scan response from.
    rsp_list: Vec<AdvEntry, SCAN_RSP_ADVS>,
    /// Advertisers already reported to the host.
    dup_list: Vec<AdvEntry, SCAN_DUP_ADVS>,

    retry_pending: bool,
    stats: ScanStats,
}

impl Scanner {
    pub fn new() -> Self {
        Self {
            enabled: false,
            params: ScanParams::default(),
            filter_dups: false,
            scan_addr: DeviceAddress::new([0; 6], AddressKind::Public),
            channel: AdvertisingChannel::first(),
            window_start: Instant::from_raw_micros(0),
            backoff: Backoff::new(),
            scan_rsp_pending: false,
            scan_rsp_chk: false,
            pending_adv: None,
            rsp_list: Vec::new(),
            dup_list: Vec::new(),
            retry_pending: false,
            stats: ScanStats::default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn params(&self) -> &ScanParams {
        &self.params
    }

    pub fn stats(&self) -> &ScanStats {
        &self.stats
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    pub fn channel(&self) -> AdvertisingChannel {
        self.channel
    }

    pub fn scan_rsp_pending(&self) -> bool {
        self.scan_rsp_pending
    }

    /// Returns whether the active filter policy uses the white list.
    pub fn uses_whitelist(&self) -> bool {
        self.enabled && self.params.filter_policy & 0b01 != 0
    }

    /// Handles *LE Set Scan Parameters*.
    pub fn set_params(&mut self, cmd: &[u8]) -> Result<(), ErrorCode> {
        if self.enabled {
            return Err(ErrorCode::CommandDisallowed);
        }
        self.params = ScanParams::parse(cmd)?;
        Ok(())
    }

    /// Updates duplicate filtering while scanning is enabled.
    pub fn set_filter_dups(&mut self, filter_dups: bool) {
        self.filter_dups = filter_dups;
    }

    /// Enables scanning with `scan_addr` as our address.
    ///
    /// The first window starts at `now`. The caller must schedule it afterwards.
    pub fn start(&mut self, scan_addr: DeviceAddress, filter_dups: bool, now: Instant) {
        self.backoff = Backoff::new();
        self.scan_rsp_pending = false;
        self.scan_rsp_chk = false;
        self.pending_adv = None;
        self.rsp_list.clear();
        self.dup_list.clear();
        self.scan_addr = scan_addr;
        self.filter_dups = filter_dups;
        self.channel = AdvertisingChannel::first();
        self.window_start = now;
        self.retry_pending = false;
        self.enabled = true;
        debug!("scan: start {:?} as {:?}", self.params, scan_addr);
    }

    /// Disables scanning and removes all its schedule items.
    pub fn stop<T: Timer, R: Radio, const N: usize>(
        &mut self,
        sched: &mut Scheduler<N>,
        timer: &mut T,
        radio: &mut R,
    ) {
        if self.enabled {
            debug!("scan: stop");
            radio.disable();
        }
        sched.remove_all(SchedType::Scan, timer);
        self.enabled = false;
        self.retry_pending = false;
        self.scan_rsp_pending = false;
    }

    /// Forgets parameters and statistics.
    pub fn reset<T: Timer, R: Radio, const N: usize>(
        &mut self,
        sched: &mut Scheduler<N>,
        timer: &mut T,
        radio: &mut R,
    ) {
        self.stop(sched, timer, radio);
        *self = Self::new();
    }

    /// Puts the current scan window into the schedule.
    pub fn schedule<T: Timer, const N: usize>(
        &mut self,
        sched: &mut Scheduler<N>,
        timer: &mut T,
    ) -> Result<(), Error> {
        let id = sched.get_item().ok_or(Error::NoSchedItem)?;
        {
            let item = sched.item_mut(id);
            item.sched_type = SchedType::Scan;
            item.cb = SchedCb::ScanWindowStart;
            item.start = self.window_start;
            item.end = self.window_start + self.params.window();
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
            warn!("scan: cannot schedule, stopping");
            self.enabled = false;
        }
    }

    pub fn retry_pending(&self) -> bool {
        self.enabled && self.retry_pending
    }

    /// Restarts the window sequence at `now` after a scheduling failure.
    pub fn restart_at(&mut self, now: Instant) {
        self.window_start = now;
        self.retry_pending = false;
    }

    /// Schedule callback: starts receiving for the scan window.
    pub fn window_start<R: Radio, const Q: usize>(
        &mut self,
        item: &mut SchedItem,
        radio: &mut R,
        ll_events: &mut Deque<LlEvent, Q>,
    ) -> SchedStatus {
        if !self.enabled {
            return SchedStatus::Done;
        }

        match radio.set_channel(self.channel).and_then(|_| radio.rx()) {
            Ok(()) => {
                trace!("scan: window on {}", self.channel.index());
                item.next_wakeup = item.end;
                item.cb = SchedCb::ScanWindowEnd;
                SchedStatus::Running
            }
            Err(e) => {
                warn!("scan: rx failed: {}", e);
                self.window_end_cb(radio, ll_events)
            }
        }
    }

    /// Schedule callback: the scan window is over.
    pub fn window_end_cb<R: Radio, const Q: usize>(
        &mut self,
        radio: &mut R,
        ll_events: &mut Deque<LlEvent, Q>,
    ) -> SchedStatus {
        radio.disable();
        if ll_events.push_back(LlEvent::ScanWindowEnd).is_err() {
            warn!("scan: LL event queue full");
        }
        SchedStatus::Done
    }

    /// Moves on to the next scan window (LL task).
    ///
    /// Afterwards, the caller must schedule the next window.
    pub fn window_end<G: RngCore>(&mut self, now: Instant, rng: &mut G) {
        if !self.enabled {
            return;
        }

        if self.scan_rsp_pending {
            self.backoff_failure(rng);
        }

        self.channel = self.channel.cycle();
        self.window_start += self.params.interval();
        while (self.window_start + self.params.window()).is_before(now) {
            self.stats.late += 1;
            self.channel = self.channel.cycle();
            self.window_start += self.params.interval();
        }
    }

    fn backoff_failure<G: RngCore>(&mut self, rng: &mut G) {
        self.stats.scan_req_fail += 1;
        self.scan_rsp_pending = false;
        self.scan_rsp_chk = false;
        self.pending_adv = None;
        self.backoff.update(false, rng);
    }

    fn backoff_success<G: RngCore>(&mut self, rng: &mut G) {
        self.scan_rsp_pending = false;
        self.scan_rsp_chk = false;
        self.pending_adv = None;
        self.backoff.update(true, rng);
    }

    /// Radio callback: a PDU header was received.
    pub fn rx_start<G: RngCore>(&mut self, header: Header, rng: &mut G) -> RxDecision {
        if !self.enabled {
            return RxDecision::NotInterested;
        }

        let ty = header.type_();
        if self.scan_rsp_pending {
            if ty == PduType::ScanRsp {
                self.scan_rsp_chk = true;
            } else {
                self.backoff_failure(rng);
            }
        }

        match ty {
            PduType::AdvInd | PduType::AdvScanInd if self.params.ty == ScanType::Active => {
                RxDecision::MayReply
            }
            _ => RxDecision::NotInterested,
        }
    }

    /// Radio callback: a PDU was received completely.
    ///
    /// Sends a scan request when the PDU is a scannable advertisement and the backoff allows it.
    pub fn rx_end<R: Radio>(
        &mut self,
        pdu: &PduBuf,
        crc_ok: bool,
        radio: &mut R,
        whitelist: &dyn AddressFilter,
    ) -> RxDecision {
        if !self.enabled || !crc_ok {
            return RxDecision::NotInterested;
        }
        let pdu = match pdu.decode() {
            Ok(pdu) => pdu,
            Err(_) => return RxDecision::NotInterested,
        };

        let request_candidate = self.params.ty == ScanType::Active
            && matches!(
                pdu,
                Pdu::ConnectableUndirected { .. } | Pdu::ScannableUndirected { .. }
            );
        let whitelist_candidate = matches!(
            pdu,
            Pdu::ConnectableUndirected { .. }
                | Pdu::ScannableUndirected { .. }
                | Pdu::NonconnectableUndirected { .. }
                | Pdu::ConnectableDirected { .. }
        );

        let adv_addr = *pdu.sender();
        if whitelist_candidate
            && self.params.filter_policy & 0b01 != 0
            && !whitelist.matches(&adv_addr)
        {
            return RxDecision::NotInterested;
        }

        if !request_candidate || self.scan_rsp_pending {
            return RxDecision::NotInterested;
        }
        if find(&mut self.rsp_list, &adv_addr).is_some() {
            return RxDecision::NotInterested;
        }
        if !self.backoff.tick() {
            return RxDecision::NotInterested;
        }

        let req = match PduBuf::scan_request(self.scan_addr, adv_addr) {
            Ok(req) => req,
            Err(_) => return RxDecision::NotInterested,
        };
        match radio.tx(req.as_bytes(), TxMode::TxRx) {
            Ok(()) => {
                trace!("scan: scan req to {:?}", adv_addr);
                self.stats.scan_req_tx += 1;
                self.scan_rsp_pending = true;
                self.scan_rsp_chk = false;
                self.pending_adv = Some(adv_addr);
                RxDecision::WillReply
            }
            Err(_) => RxDecision::NotInterested,
        }
    }

    /// Processes a received advertising channel PDU and reports it to the host (LL task).
    pub fn pkt_in<G: RngCore>(
        &mut self,
        pdu: &PduBuf,
        rssi: i8,
        whitelist: &dyn AddressFilter,
        unsolicited: ScanRspPolicy,
        events: &mut HostEvents,
        rng: &mut G,
    ) {
        if !self.enabled {
            return;
        }
        let pdu = match pdu.decode() {
            Ok(pdu) => pdu,
            Err(e) => {
                trace!("scan: dropping {:?}: {}", pdu, e);
                return;
            }
        };

        let adv_addr = *pdu.sender();
        let policy = self.params.filter_policy;
        let mut direct_to_rpa = None;
        match pdu {
            Pdu::ScanRequest { .. } | Pdu::ConnectRequest { .. } => return,
            Pdu::ScanResponse { .. } => {}
            _ => {
                if policy & 0b01 != 0 && !whitelist.matches(&adv_addr) {
                    return;
                }
            }
        }

        if let Pdu::ConnectableDirected { initiator_addr, .. } = pdu {
            if initiator_addr == self.scan_addr {
                // Addressed to us
            } else if policy & 0b10 != 0 && initiator_addr.is_resolvable() {
                direct_to_rpa = Some(initiator_addr);
            } else {
                return;
            }
        }

        if let Pdu::ScanResponse { .. } = pdu {
            let solicited = self.scan_rsp_pending
                && self.scan_rsp_chk
                && self.pending_adv == Some(adv_addr);
            if solicited {
                add_flags(&mut self.rsp_list, &adv_addr, AdvFlags::SCAN_RSP_RXD);
                self.backoff_success(rng);
            } else if unsolicited == ScanRspPolicy::Ignore {
                trace!("scan: ignoring unsolicited scan rsp from {:?}", adv_addr);
                return;
            }
        }

        let sent_flag = match (pdu, direct_to_rpa) {
            (_, Some(_)) => AdvFlags::DIRECT_RPT_SENT,
            (Pdu::ScanResponse { .. }, _) => AdvFlags::SCAN_RSP_SENT,
            _ => AdvFlags::ADV_RPT_SENT,
        };
        if self.filter_dups {
            if let Some(entry) = find(&mut self.dup_list, &adv_addr) {
                if entry.flags.contains(sent_flag) {
                    return;
                }
            }
        }

        let result = match direct_to_rpa {
            Some(direct_addr) => events.direct_adv_report(&adv_addr, &direct_addr, rssi),
            None => {
                let (event_type, data): (u8, &[u8]) = match pdu {
                    Pdu::ConnectableUndirected {
                        advertising_data, ..
                    } => (0, advertising_data),
                    Pdu::ConnectableDirected { .. } => (1, &[]),
                    Pdu::ScannableUndirected {
                        advertising_data, ..
                    } => (2, advertising_data),
                    Pdu::NonconnectableUndirected {
                        advertising_data, ..
                    } => (3, advertising_data),
                    Pdu::ScanResponse { scan_data, .. } => (4, scan_data),
                    Pdu::ScanRequest { .. } | Pdu::ConnectRequest { .. } => return,
                };
                events.adv_report(event_type, &adv_addr, data, rssi)
            }
        };
        match result {
            Ok(()) => self.stats.reports += 1,
            Err(e) => warn!("scan: report dropped: {}", e),
        }

        if self.filter_dups {
            add_flags(&mut self.dup_list, &adv_addr, sent_flag);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockRadio, PretendRng};

    fn params(ty: u8, itvl: u16, window: u16, filter: u8) -> [u8; SCAN_PARAMS_LEN] {
        let mut cmd = [0; SCAN_PARAMS_LEN];
        cmd[0] = ty;
        cmd[1..3].copy_from_slice(&itvl.to_le_bytes());
        cmd[3..5].copy_from_slice(&window.to_le_bytes());
        cmd[6] = filter;
        cmd
    }

    fn at(micros: u32) -> Instant {
        Instant::from_raw_micros(micros)
    }

    fn addr(last: u8) -> DeviceAddress {
        DeviceAddress::new([1, 2, 3, 4, 5, last], AddressKind::Public)
    }

    #[test]
    fn backoff_bounds() {
        let mut rng = PretendRng::new(u32::max_value());
        let mut backoff = Backoff::new();
        for _ in 0..40 {
            backoff.update(false, &mut rng);
            assert!(backoff.upper_limit() <= 256);
            assert!(backoff.count() >= 1 && backoff.count() <= backoff.upper_limit());
        }
        assert_eq!(backoff.upper_limit(), 256);
        assert_eq!(backoff.count(), 256);

        for _ in 0..40 {
            backoff.update(true, &mut rng);
            assert!(backoff.upper_limit() >= 1);
            assert!(backoff.count() >= 1 && backoff.count() <= backoff.upper_limit());
        }
        assert_eq!(backoff.upper_limit(), 1);
        assert_eq!(backoff.count(), 1);
    }

    #[test]
    fn backoff_needs_two_in_a_row() {
        let mut rng = PretendRng::new(0);
        let mut backoff = Backoff::new();
        backoff.update(false, &mut rng);
        backoff.update(true, &mut rng);
        backoff.update(false, &mut rng);
        assert_eq!(backoff.upper_limit(), 1);
        backoff.update(false, &mut rng);
        assert_eq!(backoff.upper_limit(), 2);
        assert_eq!(backoff.cons_fails(), 0);
    }

    #[test]
    fn params_validation() {
        let mut scan = Scanner::new();
        assert!(scan.set_params(&params(1, 0x10, 0x10, 0)).is_ok());
        assert_eq!(scan.params().ty, ScanType::Active);

        let bad = [
            params(2, 0x10, 0x10, 0),
            params(0, 0x03, 0x03, 0),
            params(0, 0x4001, 0x10, 0),
            params(0, 0x10, 0x11, 0),
            params(0, 0x10, 0x10, 4),
        ];
        for cmd in &bad {
            assert_eq!(scan.set_params(cmd), Err(ErrorCode::InvalidParameters));
        }
        // Unchanged by the failures
        assert_eq!(scan.params().ty, ScanType::Active);
    }

    #[test]
    fn windows_rotate_channels() {
        let mut scan = Scanner::new();
        let mut rng = PretendRng::new(0);
        // 100 ms interval, 50 ms window
        scan.set_params(&params(0, 0xA0, 0x50, 0)).unwrap();
        scan.start(addr(0), false, at(0));
        assert_eq!(scan.channel().index(), 37);

        scan.window_end(at(50_000), &mut rng);
        assert_eq!(scan.channel().index(), 38);
        assert_eq!(scan.window_start, at(100_000));

        scan.window_end(at(150_000), &mut rng);
        scan.window_end(at(250_000), &mut rng);
        assert_eq!(scan.channel().index(), 37);
        assert_eq!(scan.stats().late, 0);

        // Missed two whole windows
        scan.window_end(at(560_000), &mut rng);
        assert_eq!(scan.stats().late, 2);
        assert_eq!(scan.window_start, at(600_000));
        assert_eq!(scan.channel().index(), 37);
    }

    #[test]
    fn passive_scan_never_requests() {
        let mut scan = Scanner::new();
        let mut radio = MockRadio::new();
        let mut rng = PretendRng::new(0);
        scan.set_params(&params(0, 0x10, 0x10, 0)).unwrap();
        scan.start(addr(0), false, at(0));

        let adv = PduBuf::undirected(PduType::AdvInd, addr(1), &[]).unwrap();
        assert_eq!(
            scan.rx_start(adv.header(), &mut rng),
            RxDecision::NotInterested
        );
        assert_eq!(
            scan.rx_end(&adv, true, &mut radio, &crate::link::filter::AllowAll),
            RxDecision::NotInterested
        );
        assert!(radio.sent.is_empty());
    }

    #[test]
    fn duplicates_filtered_per_kind() {
        let mut scan = Scanner::new();
        let mut rng = PretendRng::new(0);
        let mut events = HostEvents::new();
        let allow = crate::link::filter::AllowAll;
        scan.set_params(&params(0, 0x10, 0x10, 0)).unwrap();
        scan.start(addr(0), true, at(0));

        let adv = PduBuf::undirected(PduType::AdvNonconnInd, addr(1), &[1, 2]).unwrap();
        for _ in 0..3 {
            scan.pkt_in(&adv, -40, &allow, ScanRspPolicy::Ignore, &mut events, &mut rng);
        }
        assert_eq!(scan.stats().reports, 1);

        // Same bytes, different address type
        let random = DeviceAddress::new(*addr(1).raw(), AddressKind::Random);
        let adv = PduBuf::undirected(PduType::AdvNonconnInd, random, &[1, 2]).unwrap();
        scan.pkt_in(&adv, -40, &allow, ScanRspPolicy::Ignore, &mut events, &mut rng);
        assert_eq!(scan.stats().reports, 2);

        // Unsolicited scan responses are dropped by default
        let rsp = PduBuf::scan_response(addr(1), &[]).unwrap();
        scan.pkt_in(&rsp, -40, &allow, ScanRspPolicy::Ignore, &mut events, &mut rng);
        assert_eq!(scan.stats().reports, 2);
        scan.pkt_in(&rsp, -40, &allow, ScanRspPolicy::Report, &mut events, &mut rng);
        assert_eq!(scan.stats().reports, 3);
    }

    #[test]
    fn directed_to_someone_else() {
        let mut scan = Scanner::new();
        let mut rng = PretendRng::new(0);
        let mut events = HostEvents::new();
        let allow = crate::link::filter::AllowAll;
        scan.set_params(&params(0, 0x10, 0x10, 0)).unwrap();
        scan.start(addr(0), false, at(0));

        let other = PduBuf::directed(addr(1), addr(2)).unwrap();
        scan.pkt_in(&other, 0, &allow, ScanRspPolicy::Ignore, &mut events, &mut rng);
        assert_eq!(scan.stats().reports, 0);

        let ours = PduBuf::directed(addr(1), addr(0)).unwrap();
        scan.pkt_in(&ours, 0, &allow, ScanRspPolicy::Ignore, &mut events, &mut rng);
        assert_eq!(scan.stats().reports, 1);
    }
}
