//! Synchronization primitives for the two-context execution model.
//!
//! The driver runs on one CPU with a cooperative application context and a
//! preemptive interrupt context. Plain spin mutexes (`hermit_sync`) guard
//! state that is only touched cooperatively; [`SpinlockIrqSave`] guards
//! state the interrupt front half may preempt a holder of.

mod spinlock;

pub use self::spinlock::{SpinlockIrqSave, SpinlockIrqSaveGuard};
