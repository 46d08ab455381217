//! Host Controller Interface.
//!
//! The host configures the controller by sending HCI command packets to
//! [`LinkLayer::hci_command`], and receives replies and asynchronous notifications as HCI event
//! packets through the [`HciTransport`].
//!
//! Only the LE controller commands needed to run advertising, scanning and the connection control
//! procedures are supported, together with the informational commands a host reads at startup.
//!
//! [`LinkLayer::hci_command`]: ../link/struct.LinkLayer.html#method.hci_command
//! [`HciTransport`]: trait.HciTransport.html

mod command;
mod event;

pub use self::command::Opcode;
pub use self::event::*;

use crate::Error;

enum_with_unknown! {
    /// Bluetooth error codes, as used in HCI events and LL Control PDUs.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum ErrorCode(u8) {
        Success = 0x00,
        UnknownCommand = 0x01,
        UnknownConnectionId = 0x02,
        AuthenticationFailure = 0x05,
        MemoryCapacityExceeded = 0x07,
        ConnectionTimeout = 0x08,
        CommandDisallowed = 0x0C,
        InvalidParameters = 0x12,
        RemoteUserTerminated = 0x13,
        RemoteLowResources = 0x14,
        RemotePowerOff = 0x15,
        LocalHostTerminated = 0x16,
        UnsupportedRemoteFeature = 0x1A,
        InvalidLlParameters = 0x1E,
        Unspecified = 0x1F,
        UnsupportedLlParameterValue = 0x20,
        LlResponseTimeout = 0x22,
        LmpCollision = 0x23,
        InstantPassed = 0x28,
        PairingWithUnitKeyNotSupported = 0x29,
        DifferentTransactionCollision = 0x2A,
        UnacceptableConnParams = 0x3B,
        AdvertisingTimeout = 0x3C,
    }
}

impl ErrorCode {
    /// Returns whether the host may use this code as the reason of an *HCI Disconnect*.
    pub fn is_disconnect_reason(&self) -> bool {
        use self::ErrorCode::*;

        match self {
            AuthenticationFailure
            | RemoteUserTerminated
            | RemoteLowResources
            | RemotePowerOff
            | UnsupportedRemoteFeature
            | PairingWithUnitKeyNotSupported
            | UnacceptableConnParams => true,
            _ => false,
        }
    }
}

impl From<Error> for ErrorCode {
    fn from(e: Error) -> Self {
        match e {
            Error::NoSchedItem | Error::QueueFull => ErrorCode::MemoryCapacityExceeded,
            Error::InvalidLength | Error::InvalidValue | Error::Eof | Error::IncompleteParse => {
                ErrorCode::InvalidParameters
            }
            Error::Overlap | Error::RadioBusy => ErrorCode::CommandDisallowed,
        }
    }
}
