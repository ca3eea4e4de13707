use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

/// Internal error taxonomy. Interior layers return kinds; only the
/// lifecycle and the entry surface turn a kind into an unwind or a
/// caller-visible code.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
	/// Invalid or absent device parameters. Fatal at bring-up.
	#[error("invalid configuration")]
	Config,
	/// No device matched during probing. Fatal at bring-up.
	#[error("no device found")]
	Probe,
	/// Device present but incompatible with what was demanded of it.
	#[error("device capability mismatch")]
	Capability,
	/// Reset, command, EEPROM, or status bit did not settle in budget.
	#[error("hardware timeout")]
	HwTimeout,
	/// CRC, collision, overrun, underrun. Counted, never fatal.
	#[error("transient I/O error")]
	TransientIo,
	/// Ring full, bounce pool empty, handle table full.
	#[error("resource exhausted")]
	Exhausted,
	/// Bad handle, bad length, bad mode. Returned to the caller.
	#[error("protocol misuse")]
	Misuse,
	/// Ownership or accounting mismatch; device gets reset.
	#[error("invariant violation")]
	Invariant,
}

/// Error codes of the Packet Driver Specification v1.11, as delivered to
/// applications alongside the carry flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum PktError {
	/// Invalid handle number.
	BadHandle = 1,
	/// No interfaces of specified class found.
	NoClass = 2,
	/// No interfaces of specified type found.
	NoType = 3,
	/// No interfaces of specified number found.
	NoNumber = 4,
	/// Bad packet type specified.
	BadType = 5,
	/// Interface does not support multicast.
	NoMulticast = 6,
	/// Packet driver cannot terminate.
	CantTerminate = 7,
	/// Invalid receive mode specified.
	BadMode = 8,
	/// Insufficient space.
	NoSpace = 9,
	/// Type previously accessed and not released.
	TypeInuse = 10,
	/// Bad command, or driver not ready for it.
	BadCommand = 11,
	/// Packet could not be sent.
	CantSend = 12,
	/// Hardware address could not be changed.
	CantSet = 13,
	/// Hardware address has bad length or format.
	BadAddress = 14,
	/// Could not reset interface.
	CantReset = 15,
}

impl core::fmt::Display for PktError {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		write!(f, "{self:?} ({})", u8::from(*self))
	}
}
