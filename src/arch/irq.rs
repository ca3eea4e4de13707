//! Interrupt-flag gating and interrupt-nesting bookkeeping.

use core::sync::atomic::{AtomicUsize, Ordering};

cfg_if::cfg_if! {
	if #[cfg(all(target_arch = "x86_64", target_os = "none"))] {
		use core::arch::asm;

		const IF_BIT: u64 = 1 << 9;

		fn flags() -> u64 {
			let flags: u64;
			unsafe {
				asm!("pushfq; pop {}", out(reg) flags, options(nomem, preserves_flags));
			}
			flags
		}

		/// Disables interrupts, returning whether they were enabled before.
		pub fn disable() -> bool {
			let was_enabled = flags() & IF_BIT != 0;
			unsafe {
				asm!("cli", options(nomem, nostack));
			}
			was_enabled
		}

		/// Restores the interrupt flag saved by [`disable`].
		pub fn restore(was_enabled: bool) {
			if was_enabled {
				unsafe {
					asm!("sti", options(nomem, nostack));
				}
			}
		}

		pub fn are_enabled() -> bool {
			flags() & IF_BIT != 0
		}
	} else {
		use core::sync::atomic::AtomicBool;

		// Hosted builds model the interrupt flag. The test machine's
		// simulated chips raise interrupts synchronously, so a plain
		// process-global flag reproduces the uniprocessor semantics.
		static IF_MODEL: AtomicBool = AtomicBool::new(true);

		/// Disables interrupts, returning whether they were enabled before.
		pub fn disable() -> bool {
			IF_MODEL.swap(false, Ordering::SeqCst)
		}

		/// Restores the interrupt flag saved by [`disable`].
		pub fn restore(was_enabled: bool) {
			if was_enabled {
				IF_MODEL.store(true, Ordering::SeqCst);
			}
		}

		pub fn are_enabled() -> bool {
			IF_MODEL.load(Ordering::SeqCst)
		}
	}
}

/// Runs `f` with interrupts disabled, restoring the previous state after.
pub fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
	let was_enabled = disable();
	let ret = f();
	restore(was_enabled);
	ret
}

// Interrupt-nesting depth. The front half brackets itself with
// enter_isr/leave_isr; deferred cache work and the mapping service refuse
// to run at depth > 0.
static ISR_DEPTH: AtomicUsize = AtomicUsize::new(0);

pub fn enter_isr() {
	ISR_DEPTH.fetch_add(1, Ordering::SeqCst);
}

/// Returns the new depth, so the outermost exit (depth 0) can drain
/// deferred work.
pub fn leave_isr() -> usize {
	let prev = ISR_DEPTH.fetch_sub(1, Ordering::SeqCst);
	debug_assert!(prev > 0, "unbalanced leave_isr");
	prev - 1
}

pub fn in_isr() -> bool {
	ISR_DEPTH.load(Ordering::SeqCst) > 0
}
