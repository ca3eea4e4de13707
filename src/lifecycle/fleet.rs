//! The attached-device fleet.
//!
//! Slots are leaked to `'static` at attach, since the interrupt front
//! half must reach them without taking ownership, and reclaimed once
//! by teardown, after readiness is cleared, the lines are masked, and
//! the vectors are restored, so no reference can outlive the storage.
//!
//! Only the lifecycle module mutates the attached set.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::AtomicU16;

use hermit_sync::SpinMutex;
use smallvec::SmallVec;

use crate::config::MAX_DEVICES;
use crate::drivers::net::{NetDevice, NicOps};
use crate::synch::SpinlockIrqSave;

/// One attached device: the immutable identity the front half needs,
/// the coalesced event word bridging to the back half, and the mutable
/// device state under its lock.
///
/// The `dev` lock is a plain spin mutex: the front half never takes it
/// (it only touches ports and `pending`), cooperative contexts cannot
/// preempt one another, and preempting callers (sends from foreign
/// interrupt handlers) go through `try_lock` and defer.
pub struct DeviceSlot {
	pub index: usize,
	pub io_base: u16,
	pub line: u8,
	pub ops: &'static dyn NicOps,
	pub pending: AtomicU16,
	pub dev: SpinMutex<NetDevice>,
}

static FLEET: SpinlockIrqSave<Vec<&'static DeviceSlot>> = SpinlockIrqSave::new(Vec::new());

/// Adds a device. Bring-up stage 8 only.
pub(crate) fn attach(slot: DeviceSlot) -> &'static DeviceSlot {
	let leaked: &'static DeviceSlot = Box::leak(Box::new(slot));
	FLEET.lock().push(leaked);
	leaked
}

/// Snapshot of every slot; the lock is held only for the copy.
pub(crate) fn slots() -> SmallVec<[&'static DeviceSlot; MAX_DEVICES]> {
	FLEET.lock().iter().copied().collect()
}

pub(crate) fn slot(index: usize) -> Option<&'static DeviceSlot> {
	FLEET.lock().iter().copied().find(|slot| slot.index == index)
}

/// Devices bound to one interrupt line, for shared-IRQ demultiplexing.
pub(crate) fn slots_on_line(line: u8) -> SmallVec<[&'static DeviceSlot; MAX_DEVICES]> {
	FLEET
		.lock()
		.iter()
		.copied()
		.filter(|slot| slot.line == line)
		.collect()
}

/// Distinct interrupt lines in use, for vector binding and unmasking.
pub(crate) fn lines() -> SmallVec<[u8; MAX_DEVICES]> {
	let mut lines: SmallVec<[u8; MAX_DEVICES]> = SmallVec::new();
	for slot in FLEET.lock().iter() {
		if !lines.contains(&slot.line) {
			lines.push(slot.line);
		}
	}
	lines
}

pub fn count() -> usize {
	FLEET.lock().len()
}

/// Empties the fleet and reclaims the slot storage.
///
/// # Safety contract (enforced by the stage ordering)
///
/// Callers guarantee no `&'static DeviceSlot` from the accessors above
/// is still live: readiness is cleared, device lines are masked at the
/// controller, and the vectors are restored before this runs.
pub(crate) fn detach_all() -> Vec<Box<DeviceSlot>> {
	let slots: Vec<&'static DeviceSlot> = core::mem::take(&mut *FLEET.lock());
	slots
		.into_iter()
		.map(|slot| {
			// Reverses the Box::leak in attach; unique again per the
			// contract above.
			unsafe { Box::from_raw(slot as *const DeviceSlot as *mut DeviceSlot) }
		})
		.collect()
}
