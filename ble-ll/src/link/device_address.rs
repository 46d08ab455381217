use core::fmt;

/// Specifies whether a device address is randomly generated or a LAN MAC address.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum AddressKind {
    /// Publicly registered IEEE 802-2001 LAN MAC address.
    Public,
    /// Randomly generated address.
    Random,
}

impl AddressKind {
    /// Creates an `AddressKind` from the value of a `TxAdd`/`RxAdd` header bit.
    pub fn from_bit(random: bool) -> Self {
        if random {
            AddressKind::Random
        } else {
            AddressKind::Public
        }
    }

    /// Returns the address type value used in HCI events (0 = public, 1 = random).
    pub fn hci_type(&self) -> u8 {
        match self {
            AddressKind::Public => 0,
            AddressKind::Random => 1,
        }
    }
}

/// A Bluetooth device address.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct DeviceAddress {
    bytes: [u8; 6],
    kind: AddressKind,
}

impl DeviceAddress {
    /// Create a new device address from 6 raw Bytes and an address kind specifier.
    ///
    /// The `raw` array contains the address Bytes as they are sent over the air (LSB first).
    pub fn new(bytes: [u8; 6], kind: AddressKind) -> Self {
        DeviceAddress { bytes, kind }
    }

    /// Returns the address kind.
    pub fn kind(&self) -> AddressKind {
        self.kind
    }

    /// Returns whether this address is randomly generated.
    pub fn is_random(&self) -> bool {
        self.kind == AddressKind::Random
    }

    /// Returns whether this is a resolvable private address.
    ///
    /// Resolvable private addresses are random addresses whose two most significant bits are
    /// `0b01`.
    pub fn is_resolvable(&self) -> bool {
        self.is_random() && self.bytes[5] & 0xC0 == 0x40
    }

    /// Returns the raw bytes making up this address.
    pub fn raw(&self) -> &[u8; 6] {
        &self.bytes
    }
}

impl fmt::Debug for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Most significant byte first, the way addresses are usually written down
        for (i, b) in self.bytes.iter().rev().enumerate() {
            if i != 0 {
                f.write_str(":")?;
            }
            write!(f, "{:02X}", b)?;
        }

        write!(f, "({:?})", self.kind)?;

        Ok(())
    }
}
