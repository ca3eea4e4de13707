//! The handle table: frame-type registrations and receive dispatch.
//!
//! A handle binds `{interface, frame type, receiver}`. At most one
//! handle may claim an exact type on a given interface; wildcard handles
//! coexist and lose dispatch ties to exact ones. Identifiers are small
//! integers allocated lowest-free-first, so a released identifier is
//! reused.

use core::ptr::NonNull;

use crate::config::MAX_HANDLES;
use crate::pktdrv::PktError;
use crate::synch::SpinlockIrqSave;

/// Opaque handle identifier handed to applications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handle(pub u16);

/// Ethernet type discriminator of a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
	/// 16-bit type/length word at frame offset 12.
	Exact(u16),
	/// Wildcard: receives everything no exact handle claims.
	Any,
}

/// The application side of a delivery. Both invocations run in back-half
/// context; the first asks for space, the second signals that the frame
/// has been copied. Register preservation and the far-return convention
/// are the resident stub's business.
pub trait Receiver: Sync {
	/// Returns a buffer of at least `len` bytes, or `None` to decline
	/// (the frame is dropped and counted against the interface).
	fn request_buffer(&self, handle: Handle, len: usize) -> Option<NonNull<u8>>;

	/// The frame is fully copied into `buf`.
	fn frame_delivered(&self, handle: Handle, buf: NonNull<u8>, len: usize);
}

#[derive(Clone, Copy)]
struct Entry {
	handle: Handle,
	device: usize,
	frame_type: FrameType,
	receiver: &'static dyn Receiver,
}

struct HandleTable {
	entries: [Option<Entry>; MAX_HANDLES],
}

impl HandleTable {
	const fn new() -> Self {
		Self {
			entries: [None; MAX_HANDLES],
		}
	}

	fn register(
		&mut self,
		device: usize,
		frame_type: FrameType,
		receiver: &'static dyn Receiver,
	) -> Result<Handle, PktError> {
		if let FrameType::Exact(ethertype) = frame_type {
			let clash = self.entries.iter().flatten().any(|entry| {
				entry.device == device && entry.frame_type == FrameType::Exact(ethertype)
			});
			if clash {
				return Err(PktError::TypeInuse);
			}
		}

		let slot = self
			.entries
			.iter()
			.position(Option::is_none)
			.ok_or(PktError::NoSpace)?;
		let handle = Handle(slot as u16 + 1);
		self.entries[slot] = Some(Entry {
			handle,
			device,
			frame_type,
			receiver,
		});
		Ok(handle)
	}

	fn slot_of(handle: Handle) -> Option<usize> {
		let id = handle.0;
		(1..=MAX_HANDLES as u16)
			.contains(&id)
			.then(|| usize::from(id) - 1)
	}

	fn release(&mut self, handle: Handle) -> Result<(), PktError> {
		let slot = Self::slot_of(handle).ok_or(PktError::BadHandle)?;
		match self.entries[slot].take() {
			Some(_) => Ok(()),
			None => Err(PktError::BadHandle),
		}
	}

	fn lookup(&self, handle: Handle) -> Result<Entry, PktError> {
		Self::slot_of(handle)
			.and_then(|slot| self.entries[slot])
			.ok_or(PktError::BadHandle)
	}

	/// Exact match wins; wildcard is the fallback.
	fn matching(&self, device: usize, ethertype: u16) -> Option<Entry> {
		let on_device = || self.entries.iter().flatten().filter(|e| e.device == device);
		on_device()
			.find(|e| e.frame_type == FrameType::Exact(ethertype))
			.or_else(|| on_device().find(|e| e.frame_type == FrameType::Any))
			.copied()
	}

	fn is_empty(&self) -> bool {
		self.entries.iter().all(Option::is_none)
	}
}

static HANDLES: SpinlockIrqSave<HandleTable> = SpinlockIrqSave::new(HandleTable::new());

pub(crate) fn register(
	device: usize,
	frame_type: FrameType,
	receiver: &'static dyn Receiver,
) -> Result<Handle, PktError> {
	HANDLES.lock().register(device, frame_type, receiver)
}

pub(crate) fn release(handle: Handle) -> Result<(), PktError> {
	HANDLES.lock().release(handle)
}

/// The interface index a handle is bound to.
pub(crate) fn device_of(handle: Handle) -> Result<usize, PktError> {
	HANDLES.lock().lookup(handle).map(|entry| entry.device)
}

pub(crate) fn table_is_empty() -> bool {
	HANDLES.lock().is_empty()
}

/// Clears every registration; teardown.
pub(crate) fn clear() {
	*HANDLES.lock() = HandleTable::new();
}

/// Delivers a received frame: exact-match lookup on the type word at
/// offset 12, wildcard fallback, drop on no match. The receiver runs
/// outside the table lock, so callbacks may re-enter the entry point.
pub fn dispatch_frame(device: usize, frame: &[u8]) -> bool {
	if frame.len() < crate::config::MIN_FRAME {
		return false;
	}
	let ethertype = u16::from_be_bytes([frame[12], frame[13]]);

	let Some(entry) = HANDLES.lock().matching(device, ethertype) else {
		return false;
	};

	let Some(buf) = entry.receiver.request_buffer(entry.handle, frame.len()) else {
		return false;
	};
	unsafe {
		core::ptr::copy_nonoverlapping(frame.as_ptr(), buf.as_ptr(), frame.len());
	}
	entry.receiver.frame_delivered(entry.handle, buf, frame.len());
	true
}
