//! Link-Layer.
//!
//! The [`LinkLayer`] owns all controller state: the radio scheduler, the advertising and scanning
//! state machines, the white list and the control-procedure state of every connection. It is
//! driven from three contexts, all of which need exclusive access:
//!
//! * The timer interrupt calls [`LinkLayer::timer_fired`], which runs due schedule items.
//! * The radio interrupt calls [`LinkLayer::rx_start`] and [`LinkLayer::rx_end`]. Answers that
//!   have to go out within `T_IFS` are handed to the radio right there.
//! * A lower-priority task calls [`LinkLayer::run_task`] to process everything the interrupts
//!   queued up, and [`LinkLayer::hci_command`] for host commands.
//!
//! Nothing in here blocks or allocates.
//!
//! [`LinkLayer`]: struct.LinkLayer.html
//! [`LinkLayer::timer_fired`]: struct.LinkLayer.html#method.timer_fired
//! [`LinkLayer::rx_start`]: struct.LinkLayer.html#method.rx_start
//! [`LinkLayer::rx_end`]: struct.LinkLayer.html#method.rx_end
//! [`LinkLayer::run_task`]: struct.LinkLayer.html#method.run_task
//! [`LinkLayer::hci_command`]: struct.LinkLayer.html#method.hci_command

pub mod adv;
pub mod advertising;
pub mod channel_map;
pub mod conn;
pub mod ctrl;
pub mod data;
mod device_address;
mod features;
pub mod filter;
pub mod llcp;
pub mod scan;

pub use self::conn::{ConnParams, Connection, Role};
pub use self::ctrl::CtrlProc;
pub use self::device_address::*;
pub use self::features::*;

use self::{
    adv::Advertiser,
    advertising::{Header, PduBuf},
    channel_map::ChannelMap,
    ctrl::CtrlCtx,
    filter::Whitelist,
    llcp::CtrlPduBuf,
    scan::Scanner,
};
use crate::{
    config::{
        Config, SchedFailPolicy, Settings, LL_EVENT_QUEUE, MAX_CONNECTIONS, SCHED_ITEMS,
        WHITELIST_SIZE,
    },
    hci::{ErrorCode, HostEvents},
    phy::RxDecision,
    sched::{SchedCb, SchedStatus, SchedType, Scheduler},
    time::{Instant, Timer},
    Error,
};
use heapless::{Deque, Vec};

/// Largest valid connection handle.
const MAX_CONN_HANDLE: u16 = 0x0EFF;

/// Work handed from interrupt context to the Link-Layer task.
#[derive(Debug, PartialEq, Eq)]
pub enum LlEvent {
    /// An advertising PDU's time slot is over.
    AdvEventDone,

    /// A scan window is over.
    ScanWindowEnd,

    /// The scanner received an advertising channel PDU with a valid CRC.
    AdvRx { pdu: PduBuf, rssi: i8 },

    /// The scheduler's fallback wakeup was reached and failed activities should be rescheduled.
    SchedRetry,

    /// A control procedure response deadline was reached.
    CtrlTimeout,
}

/// Implementation of the real-time BLE Link-Layer logic.
///
/// Users of this struct must provide an interface to the platform's hardware by implementing
/// [`Config`].
///
/// [`Config`]: ../config/trait.Config.html
pub struct LinkLayer<C: Config> {
    pub(crate) settings: Settings,
    pub(crate) timer: C::Timer,
    pub(crate) radio: C::Radio,
    pub(crate) rng: C::Rng,
    pub(crate) transport: C::Transport,

    pub(crate) sched: Scheduler<SCHED_ITEMS>,
    pub(crate) adv: Advertiser,
    pub(crate) scan: Scanner,
    pub(crate) whitelist: Whitelist<WHITELIST_SIZE>,
    pub(crate) random_addr: Option<DeviceAddress>,

    /// Activity currently using the radio.
    radio_owner: Option<SchedType>,

    pub(crate) conns: Vec<Connection, MAX_CONNECTIONS>,
    next_handle: u16,

    pub(crate) events: HostEvents,
    ll_events: Deque<LlEvent, LL_EVENT_QUEUE>,

    /// Suggested max. TX octets and time for new connections, as set by the host.
    pub(crate) suggested_len: (u16, u16),
}

impl<C: Config> LinkLayer<C> {
    /// Creates a new Link-Layer.
    ///
    /// The controller starts out in standby: neither advertising nor scanning, without
    /// connections.
    pub fn new(
        settings: Settings,
        timer: C::Timer,
        radio: C::Radio,
        rng: C::Rng,
        transport: C::Transport,
    ) -> Self {
        trace!("new LinkLayer, dev={:?}", settings.public_addr);
        let suggested_len = (settings.max_octets, settings.max_time);
        Self {
            settings,
            timer,
            radio,
            rng,
            transport,
            sched: Scheduler::new(),
            adv: Advertiser::new(),
            scan: Scanner::new(),
            whitelist: Whitelist::new(),
            random_addr: None,
            radio_owner: None,
            conns: Vec::new(),
            next_handle: 0,
            events: HostEvents::new(),
            ll_events: Deque::new(),
            suggested_len,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Returns a reference to the timer instance used by the Link-Layer.
    pub fn timer(&mut self) -> &mut C::Timer {
        &mut self.timer
    }

    pub fn radio(&mut self) -> &mut C::Radio {
        &mut self.radio
    }

    pub fn transport(&mut self) -> &mut C::Transport {
        &mut self.transport
    }

    pub fn advertiser(&self) -> &Advertiser {
        &self.adv
    }

    pub fn scanner(&self) -> &Scanner {
        &self.scan
    }

    pub fn whitelist(&self) -> &Whitelist<WHITELIST_SIZE> {
        &self.whitelist
    }

    /// Returns the random device address set by the host.
    pub fn random_address(&self) -> Option<DeviceAddress> {
        self.random_addr
    }

    /// Returns the next time `timer_fired` needs to be called, if any.
    ///
    /// This includes the response deadlines of control procedures in progress.
    pub fn next_wakeup(&self) -> Option<Instant> {
        self.sched.next_wakeup()
    }

    pub fn connection(&self, handle: u16) -> Option<&Connection> {
        self.conns.iter().find(|c| c.handle() == handle)
    }

    /// Must be called when the timer reaches the deadline it was last armed for.
    ///
    /// Runs all schedule items that are due and re-arms the timer.
    pub fn timer_fired(&mut self) {
        let now = self.timer.now();
        let retry = self.sched.take_fallback(now);
        let deadline = self.sched.take_deadline(now);

        let adv = &mut self.adv;
        let scan = &mut self.scan;
        let radio = &mut self.radio;
        let ll_events = &mut self.ll_events;
        let radio_owner = &mut self.radio_owner;
        self.sched.run(&mut self.timer, |item| {
            let status = match item.cb {
                SchedCb::AdvTxStart => adv.tx_start(item, radio, ll_events),
                SchedCb::AdvTxDone => adv.tx_done(radio, ll_events),
                SchedCb::ScanWindowStart => scan.window_start(item, radio, ll_events),
                SchedCb::ScanWindowEnd => scan.window_end_cb(radio, ll_events),
            };
            *radio_owner = match status {
                SchedStatus::Running => Some(item.sched_type),
                SchedStatus::Done => None,
            };
            status
        });

        if retry && self.ll_events.push_back(LlEvent::SchedRetry).is_err() {
            warn!("LL event queue full, retry lost");
        }
        if deadline && self.ll_events.push_back(LlEvent::CtrlTimeout).is_err() {
            warn!("LL event queue full, timeout check deferred");
        }
    }

    /// Called by the radio when the header of an advertising channel PDU was received.
    ///
    /// `header` holds (at least) the two header bytes.
    pub fn rx_start(&mut self, header: &[u8]) -> RxDecision {
        let header = match Header::parse(header) {
            Some(header) => header,
            None => return RxDecision::NotInterested,
        };

        match self.radio_owner {
            Some(SchedType::Adv) => self.adv.rx_start(header),
            Some(SchedType::Scan) => self.scan.rx_start(header, &mut self.rng),
            None => RxDecision::NotInterested,
        }
    }

    /// Called by the radio when an advertising channel PDU was received completely.
    ///
    /// `pdu` holds the header and payload. If this returns `WillReply`, a response PDU has been
    /// passed to the radio's `tx` method already.
    pub fn rx_end(&mut self, pdu: &[u8], crc_ok: bool, rssi: i8) -> RxDecision {
        let pdu = match PduBuf::from_received(pdu) {
            Ok(pdu) => pdu,
            Err(e) => {
                trace!("rx: bad advertising PDU: {}", e);
                return RxDecision::NotInterested;
            }
        };

        match self.radio_owner {
            Some(SchedType::Adv) => {
                self.adv
                    .rx_end(&pdu, crc_ok, &mut self.radio, &self.whitelist)
            }
            Some(SchedType::Scan) => {
                let decision = self
                    .scan
                    .rx_end(&pdu, crc_ok, &mut self.radio, &self.whitelist);
                if crc_ok && self.ll_events.push_back(LlEvent::AdvRx { pdu, rssi }).is_err() {
                    warn!("LL event queue full, dropping received PDU");
                }
                decision
            }
            None => RxDecision::NotInterested,
        }
    }

    /// Processes the work queued by the interrupt handlers, checks control procedure timeouts and
    /// passes pending HCI events to the transport.
    pub fn run_task(&mut self) {
        while let Some(event) = self.ll_events.pop_front() {
            let now = self.timer.now();
            match event {
                LlEvent::AdvEventDone => {
                    if let Err(status) = self.adv.event_done(now, &mut self.rng) {
                        self.adv.stop(&mut self.sched, &mut self.timer);
                        if let Some(params) = self.adv.params() {
                            let peer = params.peer_addr;
                            self.events.conn_complete_failed(status, &peer).ok();
                        }
                    }
                    if self.adv.is_enabled() {
                        self.schedule_adv(now);
                    }
                }
                LlEvent::ScanWindowEnd => {
                    self.scan.window_end(now, &mut self.rng);
                    if self.scan.is_enabled() {
                        self.schedule_scan(now);
                    }
                }
                LlEvent::AdvRx { pdu, rssi } => {
                    self.scan.pkt_in(
                        &pdu,
                        rssi,
                        &self.whitelist,
                        self.settings.unsolicited_scan_rsp,
                        &mut self.events,
                        &mut self.rng,
                    );
                }
                LlEvent::SchedRetry => {
                    if self.adv.retry_pending() {
                        self.adv.restart_at(now + self.settings.tx_sched_delay);
                        self.schedule_adv(now);
                    }
                    if self.scan.retry_pending() {
                        self.scan.restart_at(now);
                        self.schedule_scan(now);
                    }
                }
                LlEvent::CtrlTimeout => self.check_ctrl_timeouts(),
            }
        }

        self.check_ctrl_timeouts();
        self.events.flush(&mut self.transport);
    }

    /// Puts the advertiser's next PDU into the schedule, applying the failure policy.
    pub(crate) fn schedule_adv(&mut self, now: Instant) {
        if let Err(e) = self
            .adv
            .schedule(&mut self.sched, &mut self.timer, &self.settings)
        {
            warn!("adv: scheduling failed: {}", e);
            match self.settings.sched_fail {
                SchedFailPolicy::Stop => self.adv.sched_failed(false),
                SchedFailPolicy::Retry(delay) => {
                    self.adv.sched_failed(true);
                    self.sched.set_fallback(now + delay, &mut self.timer);
                }
            }
        }
    }

    /// Puts the scanner's next window into the schedule, applying the failure policy.
    pub(crate) fn schedule_scan(&mut self, now: Instant) {
        if let Err(e) = self.scan.schedule(&mut self.sched, &mut self.timer) {
            warn!("scan: scheduling failed: {}", e);
            match self.settings.sched_fail {
                SchedFailPolicy::Stop => self.scan.sched_failed(false),
                SchedFailPolicy::Retry(delay) => {
                    self.scan.sched_failed(true);
                    self.sched.set_fallback(now + delay, &mut self.timer);
                }
            }
        }
    }

    /// Stops all activities, drops all connections and restores the power-on defaults.
    pub(crate) fn reset(&mut self) {
        info!("reset");
        self.adv.reset(&mut self.sched, &mut self.timer);
        self.scan
            .reset(&mut self.sched, &mut self.timer, &mut self.radio);
        self.sched.clear(&mut self.timer);
        self.radio_owner = None;
        self.whitelist.clear();
        self.random_addr = None;
        self.conns.clear();
        self.events.reset();
        self.ll_events.clear();
        self.suggested_len = (self.settings.max_octets, self.settings.max_time);
    }

    /// Registers a connection established by the platform and returns its handle.
    ///
    /// From now on, control PDUs of the connection must be passed to `ctrl_pdu_rx`, and
    /// `conn_event_end` must be called after every connection event.
    pub fn connection_created(
        &mut self,
        role: Role,
        params: ConnParams,
        chan_map: ChannelMap,
    ) -> Result<u16, Error> {
        if self.conns.is_full() {
            return Err(Error::QueueFull);
        }

        let handle = self.alloc_handle();
        let mut conn = Connection::new(handle, role, params, chan_map, &self.settings);
        conn.local_len.max_tx_octets = self.suggested_len.0;
        conn.local_len.max_tx_time = self.suggested_len.1;
        self.conns.push(conn).map_err(|_| Error::QueueFull)?;
        info!("conn[{}]: created as {:?}, {:?}", handle, role, params);
        Ok(handle)
    }

    fn alloc_handle(&mut self) -> u16 {
        loop {
            let handle = self.next_handle;
            self.next_handle = if handle == MAX_CONN_HANDLE {
                0
            } else {
                handle + 1
            };
            if self.connection(handle).is_none() {
                return handle;
            }
        }
    }

    /// Runs `f` on the connection with the given handle.
    pub(crate) fn with_conn<R>(
        &mut self,
        handle: u16,
        f: impl FnOnce(&mut Connection, &mut CtrlCtx<'_>) -> R,
    ) -> Option<R> {
        let now = self.timer.now();
        let conn = self.conns.iter_mut().find(|c| c.handle() == handle)?;
        let mut ctx = CtrlCtx {
            settings: &self.settings,
            now,
            events: &mut self.events,
        };
        let ret = f(conn, &mut ctx);
        self.update_ctrl_wakeup();
        Some(ret)
    }

    /// Processes an LL Control PDU (opcode and `CtrData`) received on a connection.
    ///
    /// If the PDU ends the connection, *Disconnection Complete* is reported to the host and the
    /// handle becomes invalid.
    pub fn ctrl_pdu_rx(&mut self, handle: u16, payload: &[u8]) -> Result<(), Error> {
        match self.with_conn(handle, |conn, ctx| conn.rx_pdu(payload, ctx)) {
            Some(Ok(())) => Ok(()),
            Some(Err(reason)) => {
                self.end_connection(handle, reason);
                Ok(())
            }
            None => Err(Error::InvalidValue),
        }
    }

    /// Called after every connection event with the counter value of the next event.
    pub fn conn_event_end(&mut self, handle: u16, counter: u16) -> Result<(), Error> {
        self.with_conn(handle, |conn, ctx| conn.conn_event_end(counter, ctx))
            .ok_or(Error::InvalidValue)
    }

    /// Takes the next LL Control PDU (data channel header included) to send on a connection.
    pub fn next_ctrl_pdu(&mut self, handle: u16) -> Option<CtrlPduBuf> {
        self.conns
            .iter_mut()
            .find(|c| c.handle() == handle)?
            .next_tx()
    }

    /// Called when the peer acknowledged the control PDU last returned by `next_ctrl_pdu`.
    pub fn ctrl_tx_done(&mut self, handle: u16) -> Result<(), Error> {
        let result = self
            .with_conn(handle, |conn, ctx| conn.ctrl_tx_done(ctx))
            .ok_or(Error::InvalidValue)?;
        if let Err(reason) = result {
            self.end_connection(handle, reason);
        }
        Ok(())
    }

    /// Removes a connection and reports *Disconnection Complete* with `reason` to the host.
    ///
    /// The platform calls this when the connection is lost (eg. on supervision timeout).
    pub fn end_connection(&mut self, handle: u16, reason: ErrorCode) {
        if let Some(pos) = self.conns.iter().position(|c| c.handle() == handle) {
            self.conns.swap_remove(pos);
            info!("conn[{}]: ended: {:?}", handle, reason);
            self.events.disconnection_complete(handle, reason).ok();
            self.update_ctrl_wakeup();
        }
    }

    fn check_ctrl_timeouts(&mut self) {
        let now = self.timer.now();
        let mut expired: Vec<(u16, ErrorCode), MAX_CONNECTIONS> = Vec::new();
        for conn in &self.conns {
            if let Err(reason) = conn.check_timeout(now) {
                expired.push((conn.handle(), reason)).ok();
            }
        }
        for (handle, reason) in expired {
            self.end_connection(handle, reason);
        }
        self.update_ctrl_wakeup();
    }

    /// Arms the scheduler for the earliest control procedure response deadline.
    fn update_ctrl_wakeup(&mut self) {
        let deadline = self
            .conns
            .iter()
            .filter_map(Connection::response_deadline)
            .fold(None, |next: Option<Instant>, at| {
                Some(next.map_or(at, |next| next.earliest(at)))
            });
        self.sched.set_deadline(deadline, &mut self.timer);
    }
}
