//! Device drivers and the driver-level error plumbing.

pub mod net;

/// A common error module for drivers. Attach failures carry the device
/// identity so the lifecycle can skip the one device and keep the rest
/// of the fleet.
pub mod error {
	use thiserror::Error;

	use crate::pktdrv::ErrorKind;

	#[derive(Error, Debug, Clone, Copy)]
	pub enum DriverError {
		#[error("{name} at {io_base:#x}: attach failed: {kind}")]
		Attach {
			name: &'static str,
			io_base: u16,
			kind: ErrorKind,
		},
	}

	impl DriverError {
		pub fn kind(&self) -> ErrorKind {
			match self {
				Self::Attach { kind, .. } => *kind,
			}
		}
	}
}
