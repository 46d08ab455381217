//! Link-Layer Device Filtering.
//!
//! Advertisers and scanners can restrict the devices they talk to via a *filter policy*. Bit 0 of
//! the policy selects whether the controller's white list applies.

use super::DeviceAddress;
use crate::Error;
use heapless::Vec;

pub trait AddressFilter {
    fn matches(&self, address: &DeviceAddress) -> bool;
}

/// An `AddressFilter` that allows all devices (ie. no white list in use).
pub struct AllowAll;

impl AddressFilter for AllowAll {
    fn matches(&self, _address: &DeviceAddress) -> bool {
        true
    }
}

/// The controller's white list.
///
/// Addresses match only when both the address bytes and the address kind are equal.
pub struct Whitelist<const N: usize> {
    addresses: Vec<DeviceAddress, N>,
}

impl<const N: usize> Whitelist<N> {
    pub fn new() -> Self {
        Self {
            addresses: Vec::new(),
        }
    }

    /// Adds `address` to the list.
    ///
    /// Adding an address that is already present does nothing. Returns `Error::QueueFull` when the
    /// list has no room left.
    pub fn add(&mut self, address: DeviceAddress) -> Result<(), Error> {
        if self.matches(&address) {
            return Ok(());
        }
        self.addresses.push(address).map_err(|_| Error::QueueFull)
    }

    /// Removes `address` from the list.
    ///
    /// Returns `Error::InvalidValue` when the address is not present.
    pub fn remove(&mut self, address: &DeviceAddress) -> Result<(), Error> {
        let pos = self
            .addresses
            .iter()
            .position(|a| a == address)
            .ok_or(Error::InvalidValue)?;
        self.addresses.swap_remove(pos);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.addresses.clear();
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    /// Returns the number of addresses the list can hold.
    pub fn capacity(&self) -> usize {
        N
    }

    /// Returns the filter to apply for a filter policy whose white list bit is `use_whitelist`.
    pub fn filter(&self, use_whitelist: bool) -> &dyn AddressFilter {
        if use_whitelist {
            self
        } else {
            &AllowAll
        }
    }
}

impl<const N: usize> AddressFilter for Whitelist<N> {
    fn matches(&self, address: &DeviceAddress) -> bool {
        self.addresses.iter().any(|a| a == address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::AddressKind;

    #[test]
    fn kind_must_match() {
        let public = DeviceAddress::new([1; 6], AddressKind::Public);
        let random = DeviceAddress::new([1; 6], AddressKind::Random);
        let mut list = Whitelist::<2>::new();
        list.add(public).unwrap();
        list.add(public).unwrap();
        assert_eq!(list.len(), 1);
        assert!(list.filter(true).matches(&public));
        assert!(!list.filter(true).matches(&random));
        assert!(list.filter(false).matches(&random));
    }

    #[test]
    fn capacity_and_removal() {
        let mut list = Whitelist::<1>::new();
        let a = DeviceAddress::new([1; 6], AddressKind::Public);
        let b = DeviceAddress::new([2; 6], AddressKind::Public);
        list.add(a).unwrap();
        assert_eq!(list.add(b), Err(Error::QueueFull));
        assert_eq!(list.remove(&b), Err(Error::InvalidValue));
        list.remove(&a).unwrap();
        assert!(list.is_empty());
    }
}
