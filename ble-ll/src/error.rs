use core::fmt;

/// Errors returned by the controller.
///
/// Protocol-visible failures (those reported to the host or a peer) are expressed as
/// [`hci::ErrorCode`] instead; this type covers codec and resource failures inside the controller.
///
/// [`hci::ErrorCode`]: ../hci/enum.ErrorCode.html
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Packet specified an invalid length value or was too short.
    InvalidLength,

    /// Invalid value supplied for field.
    InvalidValue,

    /// Unexpectedly reached EOF while reading or writing data.
    ///
    /// This is returned when the application tries to fit too much data into a
    /// PDU or other fixed-size buffer, and also when reaching EOF prematurely
    /// while reading data from a buffer.
    Eof,

    /// Parsing didn't consume the entire buffer.
    IncompleteParse,

    /// A schedule item's time window intersects one that is already queued.
    Overlap,

    /// The schedule item pool is exhausted.
    NoSchedItem,

    /// A fixed-capacity queue or list is full.
    QueueFull,

    /// The radio refused the request (eg. because it is still busy).
    RadioBusy,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Error::InvalidLength => "invalid length value specified",
            Error::InvalidValue => "invalid value for field",
            Error::Eof => "end of buffer",
            Error::IncompleteParse => "excess data in buffer",
            Error::Overlap => "schedule item overlaps a queued item",
            Error::NoSchedItem => "no free schedule item",
            Error::QueueFull => "queue full",
            Error::RadioBusy => "radio busy",
        })
    }
}
