//! The Packet Driver Specification surface.
//!
//! The resident stub translates the software-interrupt register ABI
//! into [`Request`] values and carry/error codes out of the returned
//! result; everything behind that translation lives here. All calls are
//! gated on the readiness flag that bring-up stage 15 asserts.

pub mod error;
pub mod handle;

use core::sync::atomic::{AtomicBool, Ordering};

pub use self::error::{ErrorKind, PktError};
pub use self::handle::{dispatch_frame, FrameType, Handle, Receiver};

use crate::config::{DRIVER_VERSION, MIN_FRAME, MTU};
use crate::drivers::net::ReceiveMode;
use crate::irq;
use crate::lifecycle::fleet;
use crate::stats::DeviceStats;

/// Ethernet, the only class this driver serves.
pub const CLASS_ETHERNET: u8 = 1;
/// Interface type within the class.
pub const IF_TYPE: u16 = 1;
/// Functionality level: basic plus extended functions.
pub const FUNCTIONALITY: u8 = 2;

static READY: AtomicBool = AtomicBool::new(false);

pub(crate) fn set_ready(ready: bool) {
	READY.store(ready, Ordering::SeqCst);
}

pub fn is_ready() -> bool {
	READY.load(Ordering::SeqCst)
}

/// One application call through the entry point.
pub enum Request<'a> {
	/// Function 1.
	DriverInfo { interface: u16 },
	/// Function 2. A zero `type_len` registers the wildcard.
	AccessType {
		if_class: u8,
		if_type: u16,
		interface: u16,
		frame_type: Option<u16>,
		receiver: &'static dyn Receiver,
	},
	/// Function 3.
	ReleaseType { handle: Handle },
	/// Function 4.
	SendPacket { frame: &'a [u8] },
	/// Function 5.
	Terminate { handle: Handle },
	/// Function 6.
	GetAddress { handle: Handle, buf_len: usize },
	/// Function 7.
	ResetInterface { handle: Handle },
	/// Function 0x14.
	SetRcvMode { handle: Handle, mode: u8 },
	/// Function 0x15.
	GetRcvMode { handle: Handle },
	/// Function 0x18.
	GetStatistics { handle: Handle },
	/// Function 0x19.
	SetAddress { handle: Handle, address: &'a [u8] },
}

/// Interface description returned by function 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverInfo {
	pub version: u16,
	pub class: u8,
	pub if_type: u16,
	pub number: u8,
	pub functionality: u8,
	pub name: &'static str,
}

/// Successful entry-point results.
#[derive(Debug, Clone, Copy)]
pub enum Response {
	Ok,
	Info(DriverInfo),
	Handle(Handle),
	Address([u8; 6]),
	Mode(u8),
	Stats(DeviceStats),
}

fn interface_of(handle: Handle) -> Result<usize, PktError> {
	handle::device_of(handle)
}

/// Hash-based interface selection for unicast sends: single-interface
/// fleets route directly, larger ones fold the destination address.
fn route_for_frame(frame: &[u8], count: usize) -> usize {
	if count <= 1 {
		return 0;
	}
	let hash = frame[..6].iter().fold(0usize, |acc, b| acc ^ usize::from(*b));
	hash % count
}

fn send_on(index: usize, frame: &[u8]) -> Result<(), PktError> {
	let slot = fleet::slot(index).ok_or(PktError::CantSend)?;
	match slot.dev.try_lock() {
		Some(mut dev) => slot.ops.send(&mut dev, frame).map_err(|kind| {
			debug!("send refused: {kind}");
			PktError::CantSend
		}),
		// The device is mid-service below us (send from a receive
		// callback or a foreign interrupt): enqueue, do not drain.
		None => irq::defer_send(index, frame).map_err(|()| PktError::CantSend),
	}
}

fn send_packet(frame: &[u8]) -> Result<Response, PktError> {
	if frame.len() < MIN_FRAME || frame.len() > MTU {
		return Err(PktError::CantSend);
	}

	let count = fleet::count();
	if count == 0 {
		return Err(PktError::CantSend);
	}

	// The call carries no interface selector. Group destinations
	// (broadcast and multicast) go out every interface; unicast picks
	// one by folding the destination address.
	if frame[0] & 1 != 0 {
		let mut accepted = false;
		for index in 0..count {
			accepted |= send_on(index, frame).is_ok();
		}
		return if accepted {
			Ok(Response::Ok)
		} else {
			Err(PktError::CantSend)
		};
	}

	send_on(route_for_frame(frame, count), frame).map(|()| Response::Ok)
}

fn entry_inner(request: Request<'_>) -> Result<Response, PktError> {
	match request {
		Request::DriverInfo { interface } => {
			let count = fleet::count();
			if usize::from(interface) >= count {
				return Err(PktError::NoNumber);
			}
			let slot = fleet::slot(usize::from(interface)).ok_or(PktError::NoNumber)?;
			let name = slot.dev.lock().name;
			Ok(Response::Info(DriverInfo {
				version: DRIVER_VERSION,
				class: CLASS_ETHERNET,
				if_type: IF_TYPE,
				number: interface as u8,
				functionality: FUNCTIONALITY,
				name,
			}))
		}

		Request::AccessType {
			if_class,
			if_type,
			interface,
			frame_type,
			receiver,
		} => {
			if if_class != CLASS_ETHERNET {
				return Err(PktError::NoClass);
			}
			if if_type != 0xFFFF && if_type != IF_TYPE {
				return Err(PktError::NoType);
			}
			if usize::from(interface) >= fleet::count() {
				return Err(PktError::NoNumber);
			}
			let frame_type = match frame_type {
				Some(ethertype) => FrameType::Exact(ethertype),
				None => FrameType::Any,
			};
			handle::register(usize::from(interface), frame_type, receiver).map(Response::Handle)
		}

		Request::ReleaseType { handle } => handle::release(handle).map(|()| Response::Ok),

		Request::SendPacket { frame } => send_packet(frame),

		Request::Terminate { handle } => {
			handle::release(handle)?;
			if handle::table_is_empty() {
				info!("last handle released; resident core cannot unload itself");
			}
			Err(PktError::CantTerminate)
		}

		Request::GetAddress { handle, buf_len } => {
			let index = interface_of(handle)?;
			if buf_len < 6 {
				return Err(PktError::NoSpace);
			}
			let slot = fleet::slot(index).ok_or(PktError::BadHandle)?;
			let mut dev = slot.dev.lock();
			Ok(Response::Address(slot.ops.station_address(&mut dev)))
		}

		Request::ResetInterface { handle } => {
			let index = interface_of(handle)?;
			let slot = fleet::slot(index).ok_or(PktError::BadHandle)?;
			let mut dev = slot.dev.lock();
			slot.ops
				.reset(&mut dev)
				.and_then(|()| slot.ops.init(&mut dev))
				.map_err(|kind| {
					error!("interface reset failed: {kind}");
					PktError::CantReset
				})?;
			Ok(Response::Ok)
		}

		Request::SetRcvMode { handle, mode } => {
			let index = interface_of(handle)?;
			let mode = ReceiveMode::try_from(mode).map_err(|_| PktError::BadMode)?;
			let slot = fleet::slot(index).ok_or(PktError::BadHandle)?;
			let mut dev = slot.dev.lock();
			slot.ops
				.set_rx_mode(&mut dev, mode)
				.map_err(|_| PktError::BadMode)?;
			Ok(Response::Ok)
		}

		Request::GetRcvMode { handle } => {
			let index = interface_of(handle)?;
			let slot = fleet::slot(index).ok_or(PktError::BadHandle)?;
			let mode = slot.dev.lock().rx_mode;
			Ok(Response::Mode(mode.into()))
		}

		Request::GetStatistics { handle } => {
			let index = interface_of(handle)?;
			let slot = fleet::slot(index).ok_or(PktError::BadHandle)?;
			let mut dev = slot.dev.lock();
			// Fold in what the hardware has been counting on its own.
			dev.drain_hw_stats();
			Ok(Response::Stats(dev.stats))
		}

		Request::SetAddress { handle, address } => {
			let index = interface_of(handle)?;
			if address.len() != 6 {
				return Err(PktError::BadAddress);
			}
			let mut station = [0u8; 6];
			station.copy_from_slice(address);
			let slot = fleet::slot(index).ok_or(PktError::BadHandle)?;
			let mut dev = slot.dev.lock();
			slot.ops
				.set_station_address(&mut dev, station)
				.map_err(|_| PktError::CantSet)?;
			Ok(Response::Ok)
		}
	}
}

/// The function-code dispatcher behind the public software interrupt.
/// Returns the value the stub marshals back; an `Err` maps to carry-set
/// plus the code.
pub fn entry(request: Request<'_>) -> Result<Response, PktError> {
	if !is_ready() {
		return Err(PktError::BadCommand);
	}

	let result = entry_inner(request);

	// Service anything the interrupt path left pending while the call
	// held device locks. Re-entrant calls fall out immediately.
	irq::back_half();

	result
}
