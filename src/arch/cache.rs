//! Cache-maintenance instruction wrappers.
//!
//! Tier selection and the decision *when* to flush live in [`crate::dma`];
//! this module only knows how to execute the primitives.

use core::sync::atomic::{fence, Ordering};

use crate::arch::irq;

/// Writes back and invalidates the cache lines covering `addr..addr+len`.
/// Surgical; safe in any context.
#[allow(unused_variables)]
pub fn clflush_range(addr: *const u8, len: usize, line_size: usize) {
	#[cfg(target_arch = "x86_64")]
	{
		let line_size = line_size.max(8);
		let start = addr as usize & !(line_size - 1);
		let end = addr as usize + len;
		let mut line = start;
		while line < end {
			unsafe {
				core::arch::x86_64::_mm_clflush(line as *const u8);
			}
			line += line_size;
		}
		unsafe {
			core::arch::x86_64::_mm_mfence();
		}
	}
	#[cfg(not(target_arch = "x86_64"))]
	fence(Ordering::SeqCst);
}

/// Global write-back + invalidate. Only the deferred-work drain may call
/// this, never the interrupt front half.
pub fn wbinvd() {
	debug_assert!(!irq::in_isr(), "WBINVD in interrupt context");

	cfg_if::cfg_if! {
		if #[cfg(all(target_arch = "x86_64", target_os = "none"))] {
			unsafe {
				core::arch::asm!("wbinvd", options(nomem, nostack));
			}
		} else {
			// WBINVD is privileged; hosted builds model it as a full
			// ordering barrier, which is sufficient on a snooping host.
			fence(Ordering::SeqCst);
		}
	}
}

/// Memory-ordering barrier for snooping-verified systems.
pub fn barrier() {
	fence(Ordering::SeqCst);
}
