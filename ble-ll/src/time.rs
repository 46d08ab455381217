//! Time APIs for obtaining the current time and calculating with points in time and durations.
//!
//! These APIs are made for the controller and are not meant to be general-purpose. The APIs here
//! have microsecond resolution and use 32-bit arithmetic wherever possible. Since the timer
//! abstraction counts in microseconds, no tick conversion is ever needed.

use core::fmt;
use core::ops::{Add, AddAssign, Sub, SubAssign};

/// A duration with microsecond resolution.
///
/// This can represent a maximum duration of about 1 hour, which is far more than any timing the
/// controller deals with (the longest being the 40 second LL Control procedure timeout).
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Duration(u32);

impl Duration {
    /// The duration of the interframe spacing between BLE packets.
    pub const T_IFS: Self = Duration(150);

    /// Creates a [`Duration`] from a number of microseconds.
    pub const fn from_micros(micros: u32) -> Self {
        Duration(micros)
    }

    /// Creates a [`Duration`] representing the given number of milliseconds.
    pub const fn from_millis(millis: u16) -> Self {
        Duration(millis as u32 * 1_000)
    }

    /// Creates a [`Duration`] representing a number of seconds.
    pub const fn from_secs(secs: u16) -> Self {
        Duration(secs as u32 * 1_000_000)
    }

    /// Creates a [`Duration`] from a number of 625 µs units, as used by advertising and scanning
    /// intervals in HCI commands.
    pub fn from_625us_units(units: u16) -> Self {
        Duration(u32::from(units) * 625)
    }

    /// Returns the number of microseconds represented by `self`.
    pub fn as_micros(&self) -> u32 {
        self.0
    }
}

impl Add for Duration {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Duration(self.0 + rhs.0)
    }
}

impl AddAssign for Duration {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for Duration {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Duration(self.0 - rhs.0)
    }
}

impl SubAssign for Duration {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_micros(self.0, f)
    }
}

impl fmt::Debug for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        <Self as fmt::Display>::fmt(self, f)
    }
}

fn fmt_micros(micros: u32, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if micros >= 1_000_000 {
        // s
        let (secs, subsec_micros) = (micros / 1_000_000, micros % 1_000_000);
        if subsec_micros == 0 {
            write!(f, "{}s", secs)
        } else {
            write!(f, "{}.{:06}s", secs, subsec_micros)
        }
    } else if micros >= 1000 {
        // ms
        let (millis, submilli_micros) = (micros / 1000, micros % 1000);
        if submilli_micros == 0 {
            write!(f, "{}ms", millis)
        } else {
            write!(f, "{}.{:03}ms", millis, submilli_micros)
        }
    } else {
        // µs
        write!(f, "{}µs", micros)
    }
}

/// A point in time, relative to an unspecfied epoch.
///
/// This has microsecond resolution and wraps around after about 71 minutes. All comparisons are
/// done with wrapping arithmetic, so two `Instant`s can be ordered correctly as long as they are
/// less than half the wrapping period apart.
///
/// `Instant`s are obtained from an implementation of [`Timer`]. `Instant`s created from different
/// [`Timer`] instances (even when using the same implementation) are not compatible, and mixing
/// them in operations causes unspecified results.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Instant(u32);

impl Instant {
    /// Creates an `Instant` from raw microseconds since an arbitrary implementation-defined
    /// reference point.
    ///
    /// This should only be called from a [`Timer`] implementation.
    pub fn from_raw_micros(micros: u32) -> Self {
        Instant(micros)
    }

    /// Returns the raw value from which this `Instant` was created.
    pub fn raw_micros(&self) -> u32 {
        self.0
    }

    /// Returns whether `self` lies strictly before `other`.
    pub fn is_before(&self, other: Instant) -> bool {
        (self.0.wrapping_sub(other.0) as i32) < 0
    }

    /// Returns the earlier of `self` and `other`.
    pub fn earliest(self, other: Instant) -> Instant {
        if other.is_before(self) {
            other
        } else {
            self
        }
    }

    /// Calculates the duration of time that has passed between `earlier` and `self`.
    ///
    /// If `earlier` actually lies after `self`, this returns a zero duration.
    pub fn duration_since(&self, earlier: Instant) -> Duration {
        if self.is_before(earlier) {
            Duration(0)
        } else {
            Duration(self.0.wrapping_sub(earlier.0))
        }
    }
}

/// [`Instant`]s can be subtracted, which computes the [`Duration`] between the rhs and lhs using
/// [`Instant::duration_since`].
impl Sub<Instant> for Instant {
    type Output = Duration;

    fn sub(self, rhs: Self) -> Duration {
        self.duration_since(rhs)
    }
}

/// A [`Duration`] can be added to an [`Instant`], moving the [`Instant`] forwards in time.
impl Add<Duration> for Instant {
    type Output = Self;

    fn add(self, d: Duration) -> Self {
        Instant(self.0.wrapping_add(d.as_micros()))
    }
}

impl AddAssign<Duration> for Instant {
    fn add_assign(&mut self, d: Duration) {
        *self = *self + d;
    }
}

/// A [`Duration`] can be subtracted from an [`Instant`], moving the [`Instant`] backwards in time.
impl Sub<Duration> for Instant {
    type Output = Self;

    fn sub(self, d: Duration) -> Self {
        Instant(self.0.wrapping_sub(d.as_micros()))
    }
}

impl SubAssign<Duration> for Instant {
    fn sub_assign(&mut self, d: Duration) {
        *self = *self - d;
    }
}

impl fmt::Display for Instant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_micros(self.0, f)
    }
}

impl fmt::Debug for Instant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        <Self as fmt::Display>::fmt(self, f)
    }
}

/// Trait for the controller's time source.
///
/// The hardware interface has to provide an implementation of `Timer` to the controller. It
/// combines a free-running microsecond clock with a single one-shot compare channel. When the
/// compare channel fires, the platform must call [`LinkLayer::timer_fired`].
///
/// This trait can also be implemented by a mock timer for testing.
///
/// [`LinkLayer::timer_fired`]: ../link/struct.LinkLayer.html#method.timer_fired
pub trait Timer {
    /// Obtain the current time as an [`Instant`].
    ///
    /// The [`Instant`]s returned by this function must never move backwards in time, except when
    /// the underlying value wraps around.
    fn now(&self) -> Instant;

    /// Arms the one-shot timer to fire at `at`, replacing any previously armed deadline.
    ///
    /// If `at` is already in the past, the timer must fire as soon as possible.
    fn start(&mut self, at: Instant);

    /// Disarms the timer.
    fn stop(&mut self);
}
