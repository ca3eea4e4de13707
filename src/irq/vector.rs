//! Interrupt-vector bookkeeping.
//!
//! Every vector the driver installs is recorded with the previous
//! occupant, so the front half can chain interrupts that are not ours
//! and teardown can restore the table. Restore is ownership-checked: a
//! handler layered on top of ours after installation is left in place.

use alloc::vec::Vec;

use crate::bus::{Bus, VectorSlot};
use crate::synch::SpinlockIrqSave;

#[derive(Debug, Clone, Copy)]
struct Installed {
	index: u8,
	ours: VectorSlot,
	previous: VectorSlot,
}

static INSTALLED: SpinlockIrqSave<Vec<Installed>> = SpinlockIrqSave::new(Vec::new());

/// Interrupt-table index of a hardware line on the cascaded controllers.
pub fn vector_for_line(line: u8) -> u8 {
	if line < 8 {
		0x08 + line
	} else {
		0x70 + (line - 8)
	}
}

/// Installs `ours` at `index`, remembering the previous occupant.
pub fn install(bus: &dyn Bus, index: u8, ours: VectorSlot) {
	let previous = bus.vector(index);
	bus.set_vector(index, ours);
	INSTALLED.lock().push(Installed {
		index,
		ours,
		previous,
	});
	debug!("vector {index:#04x}: installed {ours:?} over {previous:?}");
}

/// The handler that owned `line`'s vector before us, for shared-IRQ
/// chaining.
pub fn previous_for_line(line: u8) -> Option<VectorSlot> {
	let index = vector_for_line(line);
	INSTALLED
		.lock()
		.iter()
		.find(|entry| entry.index == index)
		.map(|entry| entry.previous)
}

/// Restores one vector if we still own it. A foreign handler installed
/// after ours is left alone (layered-install etiquette) and its presence
/// is reported to the caller.
pub fn restore(bus: &dyn Bus, index: u8) -> bool {
	let entry = {
		let mut installed = INSTALLED.lock();
		let position = installed.iter().position(|entry| entry.index == index);
		position.map(|at| installed.remove(at))
	};
	let Some(entry) = entry else {
		return true;
	};

	if bus.vector(index) == entry.ours {
		bus.set_vector(index, entry.previous);
		true
	} else {
		warn!(
			"vector {index:#04x} no longer ours, leaving the current handler in place"
		);
		false
	}
}

/// Restores every recorded vector, newest first.
pub fn restore_all(bus: &dyn Bus) {
	let indices: Vec<u8> = {
		let installed = INSTALLED.lock();
		installed.iter().rev().map(|entry| entry.index).collect()
	};
	for index in indices {
		restore(bus, index);
	}
}

/// True when nothing is installed; checked by the unwind completeness
/// tests.
pub fn is_empty() -> bool {
	INSTALLED.lock().is_empty()
}
