//! The interrupt core: hard-IRQ front half, deferred back half, and the
//! interrupt-controller plumbing between them.
//!
//! The front half runs with interrupts disabled and does the minimum:
//! classify across every device sharing the line, coalesce the event
//! sets into per-device pending words, acknowledge the controller, and,
//! back at nesting depth zero, drain the deferred work. Everything
//! that takes time (ring drains, deliveries, resets) happens in the back
//! half, which also runs from the public entry point and the idle hook.

pub mod vector;

use core::sync::atomic::{AtomicBool, Ordering};

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use hermit_sync::SpinMutex;

use crate::arch::irq as cpu_irq;
use crate::config::{MTU, TX_RING_SIZE};
use crate::dma::cache;
use crate::drivers::net::{DevIo, Events, IsrVerdict, ServiceCtx};
use crate::lifecycle::fleet;
use crate::pktdrv;
use crate::synch::SpinlockIrqSave;

// 8259A ports and the end-of-interrupt command.
const PIC1_CMD: u16 = 0x20;
const PIC1_DATA: u16 = 0x21;
const PIC2_CMD: u16 = 0xA0;
const PIC2_DATA: u16 = 0xA1;
const PIC_EOI: u8 = 0x20;
/// Cascade input of the master controller.
const CASCADE_LINE: u8 = 2;

static IN_BACK_HALF: AtomicBool = AtomicBool::new(false);

/// One scratch frame for the FIFO receive paths; the back half is
/// serial, so a single buffer serves the whole fleet.
static SCRATCH: SpinMutex<[u8; MTU]> = SpinMutex::new([0; MTU]);

/// Sends queued because the device lock was held at call time (send
/// from a receive callback, or from a foreign interrupt handler).
static DEFERRED_SENDS: SpinlockIrqSave<VecDeque<(usize, Vec<u8>)>> =
	SpinlockIrqSave::new(VecDeque::new());

/// Acknowledges `line` at the interrupt controller. Lines on the slave
/// need the command at both controllers.
pub fn send_eoi(bus: &dyn crate::bus::Bus, line: u8) {
	if line >= 8 {
		bus.outb(PIC2_CMD, PIC_EOI);
	}
	bus.outb(PIC1_CMD, PIC_EOI);
}

/// Unmasks `line` at the controller, returning whether it was masked
/// before. Slave lines also unmask the cascade input.
pub fn unmask(bus: &dyn crate::bus::Bus, line: u8) -> bool {
	let (port, bit) = if line < 8 {
		(PIC1_DATA, line)
	} else {
		(PIC2_DATA, line - 8)
	};
	let mask = bus.inb(port);
	let was_masked = mask & (1 << bit) != 0;
	bus.outb(port, mask & !(1 << bit));

	if line >= 8 {
		let master = bus.inb(PIC1_DATA);
		bus.outb(PIC1_DATA, master & !(1 << CASCADE_LINE));
	}
	was_masked
}

/// Masks `line` again; stage-14 rollback for lines we unmasked.
pub fn mask(bus: &dyn crate::bus::Bus, line: u8) {
	let (port, bit) = if line < 8 {
		(PIC1_DATA, line)
	} else {
		(PIC2_DATA, line - 8)
	};
	let mask = bus.inb(port);
	bus.outb(port, mask | (1 << bit));
}

/// The hard-IRQ entry for `line`; the resident stub's thunk calls this
/// on its private stack after the minimal register save.
pub fn front_half(line: u8) {
	cpu_irq::enter_isr();

	let Some(bus) = crate::lifecycle::bus() else {
		cpu_irq::leave_isr();
		return;
	};

	let mut ours = false;
	for slot in fleet::slots_on_line(line) {
		let verdict = slot.ops.ack_and_classify(DevIo {
			bus,
			base: slot.io_base,
		});
		if let IsrVerdict::Ours(events) = verdict {
			if !events.is_empty() {
				slot.pending.fetch_or(events.bits(), Ordering::SeqCst);
			}
			ours = true;
		}
	}

	if !ours {
		// Shared-IRQ etiquette: not our interrupt, no EOI from us;
		// forward to whoever owned the vector before installation.
		let previous = vector::previous_for_line(line);
		if cpu_irq::leave_isr() == 0 {
			cache::drain_deferred();
		}
		if let Some(previous) = previous {
			bus.chain(previous);
		}
		return;
	}

	send_eoi(bus, line);

	if cpu_irq::leave_isr() == 0 {
		cache::drain_deferred();
		back_half();
	}
}

/// Queues a frame for a device whose lock is currently held; the back
/// half posts it on the next pass. Refuses when the queue is at the
/// ring depth already.
pub(crate) fn defer_send(device_index: usize, frame: &[u8]) -> Result<(), ()> {
	let mut queue = DEFERRED_SENDS.lock();
	if queue.len() >= TX_RING_SIZE {
		return Err(());
	}
	queue.push_back((device_index, frame.to_vec()));
	Ok(())
}

fn drain_deferred_sends() {
	loop {
		let Some((device_index, frame)) = DEFERRED_SENDS.lock().pop_front() else {
			return;
		};
		let Some(slot) = fleet::slot(device_index) else {
			continue;
		};
		let Some(mut dev) = slot.dev.try_lock() else {
			// Lock holder will kick the back half again; put it back.
			DEFERRED_SENDS.lock().push_front((device_index, frame));
			return;
		};
		if let Err(kind) = slot.ops.send(&mut dev, &frame) {
			debug!("deferred send dropped: {kind}");
			dev.stats.note_tx_error();
		}
	}
}

/// The deferred half. Serial: a nested invocation (from an interrupt
/// tail that preempted a running pass) returns immediately and leaves
/// its events pending for the running pass or the next kick.
pub fn back_half() {
	if IN_BACK_HALF.swap(true, Ordering::SeqCst) {
		return;
	}

	for slot in fleet::slots() {
		let bits = slot.pending.swap(0, Ordering::SeqCst);
		let events = Events::from_bits_truncate(bits);
		if events.is_empty() {
			continue;
		}

		let Some(mut dev) = slot.dev.try_lock() else {
			// An application call holds the device; it re-enters the
			// back half when it finishes.
			slot.pending.fetch_or(bits, Ordering::SeqCst);
			continue;
		};

		let mut scratch = SCRATCH.lock();
		let mut dispatch =
			|device: usize, frame: &[u8]| pktdrv::dispatch_frame(device, frame);
		let mut ctx = ServiceCtx {
			scratch: &mut *scratch,
			dispatch: &mut dispatch,
			reset_requested: false,
		};
		slot.ops.service(&mut dev, events, &mut ctx);

		if ctx.reset_requested {
			warn!("{}: device reset from back half", dev.name);
			if slot.ops.reset(&mut dev).and_then(|()| slot.ops.init(&mut dev)).is_err() {
				error!("{}: reset failed, masking device", dev.name);
			}
		}
	}

	drain_deferred_sends();
	IN_BACK_HALF.store(false, Ordering::SeqCst);
}

/// Periodic idle hook: services anything the interrupt path left
/// pending while the machine was busy.
pub fn idle_poll() {
	back_half();
}

/// The front half's private stack. The resident stub switches onto it
/// before calling [`front_half`], so the driver survives entry from
/// contexts with tiny stacks.
static IRQ_STACK: SpinMutex<Option<alloc::boxed::Box<[u8]>>> = SpinMutex::new(None);

/// Bring-up stage 10: the back-half scheduling infrastructure.
pub(crate) fn infra_init() {
	*IRQ_STACK.lock() = Some(vec![0u8; crate::config::IRQ_STACK_SIZE].into_boxed_slice());
	IN_BACK_HALF.store(false, Ordering::SeqCst);
	DEFERRED_SENDS.lock().clear();
}

/// Stage-10 rollback and teardown.
pub(crate) fn infra_shutdown() {
	*IRQ_STACK.lock() = None;
	DEFERRED_SENDS.lock().clear();
	IN_BACK_HALF.store(false, Ordering::SeqCst);
}

/// Top of the private interrupt stack, for the stub's stack switch.
pub fn irq_stack_top() -> Option<*mut u8> {
	IRQ_STACK
		.lock()
		.as_ref()
		.map(|stack| unsafe { stack.as_ptr().add(stack.len()).cast_mut() })
}
