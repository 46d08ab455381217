//! Controller configuration.
//!
//! Configuration is split into three parts:
//! * The [`Config`] trait picks the platform types (timer, radio, RNG, HCI transport).
//! * The constants in this module fix the capacity of every pool, list and queue. Nothing in the
//!   controller allocates, so these bound its memory use.
//! * [`Settings`] holds runtime tunables, and is handed to [`LinkLayer::new`].
//!
//! [`Config`]: trait.Config.html
//! [`Settings`]: struct.Settings.html
//! [`LinkLayer::new`]: ../link/struct.LinkLayer.html#method.new

use crate::{
    hci::HciTransport,
    link::{AddressKind, DeviceAddress, FeatureSet},
    phy::Radio,
    time::{Duration, Timer},
};
use rand_core::RngCore;

// TODO: Use associated type defaults in the trait once stable

/// Trait for controller configurations.
///
/// This trait defines the hardware interface types used throughout the controller.
///
/// Every application must define a type implementing this trait and supply it to the
/// [`LinkLayer`].
///
/// [`LinkLayer`]: ../link/struct.LinkLayer.html
pub trait Config {
    /// A timesource with microsecond resolution and a one-shot compare channel.
    type Timer: Timer;

    /// The BLE radio.
    type Radio: Radio;

    /// Source of randomness for advertising delays and scan backoff.
    type Rng: RngCore;

    /// Sink for HCI event packets destined for the host.
    type Transport: HciTransport;
}

/// Number of schedule items in the scheduler's pool.
pub const SCHED_ITEMS: usize = 8;

/// Number of advertisers remembered as "scan response received".
pub const SCAN_RSP_ADVS: usize = 8;

/// Number of advertisers remembered for duplicate filtering.
pub const SCAN_DUP_ADVS: usize = 8;

/// Number of entries in the white list.
pub const WHITELIST_SIZE: usize = 8;

/// Maximum number of simultaneous connections.
pub const MAX_CONNECTIONS: usize = 2;

/// Number of LL Control PDUs that can be queued for transmission per connection.
pub const CTRL_TX_QUEUE: usize = 4;

/// Number of events that can be queued from interrupt context to the Link-Layer task.
pub const LL_EVENT_QUEUE: usize = 8;

/// Number of HCI events that can be waiting for the transport.
pub const EVENT_QUEUE: usize = 8;

/// Maximum length of an HCI event packet produced by the controller.
///
/// The longest event is the Command Complete for *Read Local Supported Commands*.
pub const MAX_EVENT_LEN: usize = 70;

/// What to do when an advertising or scanning activity cannot be put into the schedule.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SchedFailPolicy {
    /// Disable the activity. The failure is counted in its statistics.
    Stop,

    /// Try again after the given delay, recomputing the activity's timing from that point on.
    Retry(Duration),
}

/// What the scanner does with a `SCAN_RSP` for which no scan request is outstanding.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ScanRspPolicy {
    /// Drop the PDU. It is neither reported nor added to any list.
    Ignore,

    /// Report the PDU to the host like any other advertisement.
    Report,
}

/// Runtime settings of the controller.
#[derive(Clone, Debug)]
pub struct Settings {
    /// The controller's public device address.
    pub public_addr: DeviceAddress,

    /// Time between a schedule item's start and the actual PDU transmission, needed by the radio
    /// to ramp up.
    pub tx_sched_delay: Duration,

    /// Link-Layer features supported by this controller.
    pub supported_features: FeatureSet,

    /// Company identifier sent in `LL_VERSION_IND` and reported by *Read Local Version*.
    pub company_id: u16,

    /// Implementation-defined sub-version number.
    pub sub_version: u16,

    /// Transmit power on advertising channels, in dBm.
    pub adv_tx_power: i8,

    /// Initial maximum number of payload octets per data channel PDU in either direction.
    pub max_octets: u16,

    /// Initial maximum time for a data channel PDU in either direction, in µs.
    pub max_time: u16,

    /// Size of one ACL data buffer, reported via *LE Read Buffer Size*.
    pub acl_buf_len: u16,

    /// Number of ACL data buffers, reported via *LE Read Buffer Size*.
    pub acl_buf_count: u8,

    /// What to do when the schedule has no room for an advertising or scanning event.
    pub sched_fail: SchedFailPolicy,

    /// How to treat unsolicited scan responses.
    pub unsolicited_scan_rsp: ScanRspPolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            public_addr: DeviceAddress::new([0; 6], AddressKind::Public),
            tx_sched_delay: Duration::from_micros(150),
            supported_features: FeatureSet::supported(),
            company_id: 0xFFFF,
            sub_version: 0,
            adv_tx_power: 0,
            max_octets: 27,
            max_time: 328,
            acl_buf_len: 251,
            acl_buf_count: 4,
            sched_fail: SchedFailPolicy::Retry(Duration::from_millis(10)),
            unsolicited_scan_rsp: ScanRspPolicy::Ignore,
        }
    }
}
