//! Test doubles for the platform traits.

use crate::{
    config::{Config, Settings},
    hci::HciTransport,
    link::LinkLayer,
    phy::{AdvertisingChannel, Radio, TxMode},
    time::{Duration, Instant, Timer},
    Error,
};
use rand_core::{impls, RngCore};

/// A timer whose clock only moves when told to.
pub struct MockTimer {
    now: Instant,
    armed: Option<Instant>,
}

impl MockTimer {
    pub fn new() -> Self {
        Self {
            now: Instant::from_raw_micros(0),
            armed: None,
        }
    }

    pub fn set(&mut self, now: Instant) {
        self.now = now;
    }

    pub fn advance(&mut self, by: Duration) {
        self.now += by;
    }

    /// Returns the deadline the timer is currently armed for.
    pub fn armed(&self) -> Option<Instant> {
        self.armed
    }
}

impl Timer for MockTimer {
    fn now(&self) -> Instant {
        self.now
    }

    fn start(&mut self, at: Instant) {
        self.armed = Some(at);
    }

    fn stop(&mut self) {
        self.armed = None;
    }
}

/// A radio that records everything it is asked to send.
pub struct MockRadio {
    pub channel: Option<AdvertisingChannel>,
    pub sent: Vec<(Vec<u8>, TxMode)>,
    pub listening: bool,
    pub fail_tx: bool,
}

impl MockRadio {
    pub fn new() -> Self {
        Self {
            channel: None,
            sent: Vec::new(),
            listening: false,
            fail_tx: false,
        }
    }
}

impl Radio for MockRadio {
    fn set_channel(&mut self, channel: AdvertisingChannel) -> Result<(), Error> {
        self.channel = Some(channel);
        Ok(())
    }

    fn tx(&mut self, pdu: &[u8], mode: TxMode) -> Result<(), Error> {
        if self.fail_tx {
            return Err(Error::RadioBusy);
        }
        self.sent.push((pdu.to_vec(), mode));
        Ok(())
    }

    fn rx(&mut self) -> Result<(), Error> {
        self.listening = true;
        Ok(())
    }

    fn disable(&mut self) {
        self.listening = false;
    }
}

/// An "RNG" returning the same number over and over.
pub struct PretendRng(u32);

impl PretendRng {
    pub fn new(value: u32) -> Self {
        PretendRng(value)
    }
}

impl RngCore for PretendRng {
    fn next_u32(&mut self) -> u32 {
        self.0
    }

    fn next_u64(&mut self) -> u64 {
        impls::next_u64_via_u32(self)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        impls::fill_bytes_via_next(self, dest)
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

/// An HCI transport collecting all events it receives.
pub struct CollectingTransport {
    pub events: Vec<Vec<u8>>,
    pub busy: bool,
}

impl CollectingTransport {
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            busy: false,
        }
    }

    /// Removes and returns all LE Meta events with the given subevent code.
    pub fn take_le(&mut self, subevent: u8) -> Vec<Vec<u8>> {
        let (matching, rest) = self
            .events
            .drain(..)
            .partition(|ev| ev.len() > 2 && ev[0] == 0x3E && ev[2] == subevent);
        self.events = rest;
        matching
    }
}

impl HciTransport for CollectingTransport {
    fn send_event(&mut self, event: &[u8]) -> Result<(), Error> {
        if self.busy {
            return Err(Error::QueueFull);
        }
        self.events.push(event.to_vec());
        Ok(())
    }
}

pub enum TestConfig {}

impl Config for TestConfig {
    type Timer = MockTimer;
    type Radio = MockRadio;
    type Rng = PretendRng;
    type Transport = CollectingTransport;
}

/// Creates a Link-Layer with default settings and fresh mocks.
pub fn link_layer() -> LinkLayer<TestConfig> {
    LinkLayer::new(
        Settings::default(),
        MockTimer::new(),
        MockRadio::new(),
        PretendRng::new(0),
        CollectingTransport::new(),
    )
}
