use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch::irq;

/// A spin lock that keeps interrupts disabled while held.
///
/// Acquiring saves the interrupt state and disables interrupts before
/// taking the lock; releasing restores the saved state. On the single CPU
/// the driver targets this makes the held section atomic with respect to
/// the interrupt front half, which is the only preemption source.
///
/// Hold times must stay micro-bounded; the ring engine releases and
/// re-acquires between batches for that reason.
pub struct SpinlockIrqSave<T: ?Sized> {
	locked: AtomicBool,
	data: UnsafeCell<T>,
}

pub struct SpinlockIrqSaveGuard<'a, T: ?Sized> {
	locked: &'a AtomicBool,
	irq_was_enabled: bool,
	data: &'a mut T,
}

unsafe impl<T: ?Sized + Send> Sync for SpinlockIrqSave<T> {}
unsafe impl<T: ?Sized + Send> Send for SpinlockIrqSave<T> {}

impl<T> SpinlockIrqSave<T> {
	pub const fn new(user_data: T) -> Self {
		Self {
			locked: AtomicBool::new(false),
			data: UnsafeCell::new(user_data),
		}
	}

	/// Consumes the lock, returning the underlying data.
	pub fn into_inner(self) -> T {
		self.data.into_inner()
	}
}

impl<T: ?Sized> SpinlockIrqSave<T> {
	pub fn lock(&self) -> SpinlockIrqSaveGuard<'_, T> {
		let irq_was_enabled = irq::disable();

		while self
			.locked
			.compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
			.is_err()
		{
			core::hint::spin_loop();
		}

		SpinlockIrqSaveGuard {
			locked: &self.locked,
			irq_was_enabled,
			data: unsafe { &mut *self.data.get() },
		}
	}

	pub fn try_lock(&self) -> Option<SpinlockIrqSaveGuard<'_, T>> {
		let irq_was_enabled = irq::disable();

		if self
			.locked
			.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
			.is_ok()
		{
			Some(SpinlockIrqSaveGuard {
				locked: &self.locked,
				irq_was_enabled,
				data: unsafe { &mut *self.data.get() },
			})
		} else {
			irq::restore(irq_was_enabled);
			None
		}
	}
}

impl<T: ?Sized + Default> Default for SpinlockIrqSave<T> {
	fn default() -> Self {
		Self::new(T::default())
	}
}

impl<T: ?Sized> Deref for SpinlockIrqSaveGuard<'_, T> {
	type Target = T;

	fn deref(&self) -> &T {
		self.data
	}
}

impl<T: ?Sized> DerefMut for SpinlockIrqSaveGuard<'_, T> {
	fn deref_mut(&mut self) -> &mut T {
		self.data
	}
}

impl<T: ?Sized> Drop for SpinlockIrqSaveGuard<'_, T> {
	fn drop(&mut self) {
		self.locked.store(false, Ordering::Release);
		irq::restore(self.irq_was_enabled);
	}
}
