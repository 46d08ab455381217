//! Physical layer interactions.
//!
//! Don't expect to see much code here: Most of this layer is hardware. The controller only needs
//! a way to tune the radio, hand it a PDU to transmit, start a receive, and switch it off again.
//!
//! BLE internally uses so-called "Channel Indices", where indices 0..=36 refer to data channels
//! and 37..=39 refer to the advertising channels. The controller only deals in channel indices;
//! mapping them to RF frequencies and whitening IVs is the radio driver's business.

use crate::Error;

/// One of the three advertising channels (channel indices 37, 38 or 39).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AdvertisingChannel(u8);

impl AdvertisingChannel {
    /// Returns the first (lowest-numbered) advertising channel.
    pub fn first() -> Self {
        AdvertisingChannel(37)
    }

    /// Returns the advertising channel selected by bit `bit` of an HCI channel map.
    ///
    /// Bit 0 selects channel 37, bit 2 selects channel 39. Other bits return `None`.
    pub fn from_map_bit(bit: u8) -> Option<Self> {
        if bit < 3 {
            Some(AdvertisingChannel(37 + bit))
        } else {
            None
        }
    }

    /// Returns the bit in an HCI advertising channel map that corresponds to this channel.
    pub fn map_bit(&self) -> u8 {
        1 << (self.0 - 37)
    }

    /// Returns the next advertising channel, or the first one if `self` is the last channel.
    pub fn cycle(&self) -> Self {
        if self.0 == 39 {
            AdvertisingChannel(37)
        } else {
            AdvertisingChannel(self.0 + 1)
        }
    }

    /// Returns the channel index (37..=39).
    pub fn index(&self) -> u8 {
        self.0
    }
}

/// One of 37 data channels on which data channel PDUs are sent between connected devices.
///
/// (channel indices 0..=36)
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DataChannel(u8);

impl DataChannel {
    /// Creates a `DataChannel` from a raw index.
    ///
    /// Returns `None` if `index` is not a valid data channel index. Valid indices are 0..=36.
    pub fn new(index: u8) -> Option<Self> {
        if index <= 36 {
            Some(DataChannel(index))
        } else {
            None
        }
    }

    /// Returns the data channel index.
    ///
    /// The returned value is always in range 0..=36.
    pub fn index(&self) -> u8 {
        self.0
    }
}

/// How the radio should proceed after transmitting a PDU.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TxMode {
    /// Transmit, then disable the radio.
    Tx,

    /// Transmit, then switch to receive mode after `T_IFS` to catch a response.
    TxRx,
}

/// Decision returned to the radio driver after it reports a PDU header or a complete PDU.
///
/// When returned from [`LinkLayer::rx_start`], this tells the driver whether it has to prepare a
/// TX turnaround. When returned from [`LinkLayer::rx_end`], it tells the driver whether a response
/// is already underway (`WillReply`) or whether it may disable the radio.
///
/// [`LinkLayer::rx_start`]: ../link/struct.LinkLayer.html#method.rx_start
/// [`LinkLayer::rx_end`]: ../link/struct.LinkLayer.html#method.rx_end
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RxDecision {
    /// The controller does not care about this PDU.
    NotInterested,

    /// The controller might answer this PDU once it has been received completely.
    MayReply,

    /// The controller has handed a response to the radio, which must transmit it after `T_IFS`.
    WillReply,
}

/// Trait for BLE radios, as seen from the Link-Layer.
///
/// All methods are synchronous: they arm the hardware and return. Received packets are reported
/// back through [`LinkLayer::rx_start`] and [`LinkLayer::rx_end`].
///
/// On advertising channels, the Access Address is always [`advertising::ACCESS_ADDRESS`] and the
/// CRC is initialized with [`advertising::CRC_PRESET`]. The driver is expected to generate the
/// preamble, apply data whitening and compute the CRC.
///
/// [`LinkLayer::rx_start`]: ../link/struct.LinkLayer.html#method.rx_start
/// [`LinkLayer::rx_end`]: ../link/struct.LinkLayer.html#method.rx_end
/// [`advertising::ACCESS_ADDRESS`]: ../link/advertising/constant.ACCESS_ADDRESS.html
/// [`advertising::CRC_PRESET`]: ../link/advertising/constant.CRC_PRESET.html
pub trait Radio {
    /// Tunes the radio to an advertising channel.
    fn set_channel(&mut self, channel: AdvertisingChannel) -> Result<(), Error>;

    /// Transmits `pdu` (16-bit header followed by the payload) on the current channel.
    ///
    /// This can fail with `Error::RadioBusy` if the radio cannot accept the PDU right now.
    fn tx(&mut self, pdu: &[u8], mode: TxMode) -> Result<(), Error>;

    /// Starts receiving on the current channel.
    fn rx(&mut self) -> Result<(), Error>;

    /// Disables the radio, aborting any transmission or reception in progress.
    fn disable(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_map_bits() {
        let ch = AdvertisingChannel::from_map_bit(2).unwrap();
        assert_eq!(ch.index(), 39);
        assert_eq!(ch.map_bit(), 0b100);
        assert_eq!(ch.cycle(), AdvertisingChannel::first());
        assert!(AdvertisingChannel::from_map_bit(3).is_none());
    }

    #[test]
    fn data_channel_range() {
        assert_eq!(DataChannel::new(36).map(|c| c.index()), Some(36));
        assert!(DataChannel::new(37).is_none());
    }
}
