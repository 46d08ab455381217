//! A portable BLE Link-Layer controller.
//!
//! This crate implements the real-time part of a Bluetooth Low Energy controller: the advertising
//! and scanning state machines, the LL Control Protocol engine that negotiates procedures on
//! established connections, and a small cooperative scheduler that decides when the radio is
//! allowed to do anything at all. The host talks to it through HCI command and event packets.
//!
//! # Using the controller
//!
//! The controller is runtime and hardware-agnostic: It does not need an RTOS and only interacts
//! with the platform through a few traits that need to be implemented once for every supported MCU
//! family:
//! * A microsecond-precision one-shot [`Timer`].
//! * A [`Radio`] that can be tuned to an advertising channel and can transmit and receive PDUs.
//! * An [`HciTransport`] that hands finished HCI event packets to the host.
//! * A random number generator implementing `rand_core::RngCore`.
//!
//! These are bundled into a [`Config`] implementation, which parameterizes the [`LinkLayer`].
//!
//! The platform then forwards three kinds of stimuli into the [`LinkLayer`]:
//! * When the timer fires, call [`LinkLayer::timer_fired`].
//! * When the radio has received a PDU header or a full PDU, call [`LinkLayer::rx_start`] or
//!   [`LinkLayer::rx_end`].
//! * From a lower-priority task (or the idle loop), call [`LinkLayer::run_task`] and feed host
//!   commands into [`LinkLayer::hci_command`].
//!
//! [`Timer`]: time/trait.Timer.html
//! [`Radio`]: phy/trait.Radio.html
//! [`HciTransport`]: hci/trait.HciTransport.html
//! [`Config`]: config/trait.Config.html
//! [`LinkLayer`]: link/struct.LinkLayer.html
//! [`LinkLayer::timer_fired`]: link/struct.LinkLayer.html#method.timer_fired
//! [`LinkLayer::rx_start`]: link/struct.LinkLayer.html#method.rx_start
//! [`LinkLayer::rx_end`]: link/struct.LinkLayer.html#method.rx_end
//! [`LinkLayer::run_task`]: link/struct.LinkLayer.html#method.run_task
//! [`LinkLayer::hci_command`]: link/struct.LinkLayer.html#method.hci_command

// We're `#[no_std]`, except when we're testing
#![cfg_attr(not(test), no_std)]
// Deny a few warnings in doctests, since rustdoc `allow`s many warnings by default
#![doc(test(attr(deny(unused_imports, unused_must_use))))]
#![warn(rust_2018_idioms)]
// The claims of this lint are dubious, disable it
#![allow(clippy::trivially_copy_pass_by_ref)]

#[macro_use]
mod log;
#[macro_use]
mod utils;
pub mod bytes;
pub mod config;
mod error;
pub mod hci;
pub mod link;
pub mod phy;
pub mod sched;
pub mod time;

#[cfg(test)]
mod testing;

pub use self::error::Error;

use self::link::llcp::VersionNumber;

/// Version of the Bluetooth specification implemented by the controller.
pub const BLUETOOTH_VERSION: VersionNumber = VersionNumber::V4_2;
