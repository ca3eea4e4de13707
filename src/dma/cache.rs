//! CPU/device cache-coherency tiers.
//!
//! The tier is chosen once per system and cached on every device record.
//! Before a device reads a buffer the CPU wrote, the buffer is written
//! back; before the CPU reads a buffer the device filled, it is
//! invalidated. Interrupt context never executes the global WBINVD tier;
//! it enqueues a deferred operation instead, which the outermost
//! interrupt exit drains.

use heapless::Deque;
use memory_addresses::VirtAddr;

use crate::arch::cpu::{CpuClass, CpuInfo};
use crate::arch::{cache, irq};
use crate::bus::MapFlags;
use crate::config::DEFERRED_CACHE_OPS;
use crate::synch::SpinlockIrqSave;

/// Coherency strategy, weakest sufficient one wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
	/// Fine-grained line flush; surgical, no system impact.
	Clflush { line_size: usize },
	/// Global write-back + invalidate at synchronization points.
	Wbinvd,
	/// Ordering barrier suffices; snooping keeps the caches coherent.
	SoftwareBarrier,
	/// The mapping service asserts responsibility; the driver must not
	/// issue cache instructions at all.
	None,
}

impl CacheTier {
	/// Tier selection. Independent of the DMA policy except that a
	/// service-managed system always lands in [`CacheTier::None`].
	pub fn select(cpu: &CpuInfo, service_managed: bool, snooping_verified: bool) -> Self {
		if service_managed {
			return Self::None;
		}
		if let Some(line_size) = cpu.clflush_line {
			return Self::Clflush { line_size };
		}
		if snooping_verified || cpu.class == CpuClass::I386 {
			return Self::SoftwareBarrier;
		}
		Self::Wbinvd
	}
}

/// A flush or invalidate postponed out of interrupt context.
#[derive(Debug, Clone, Copy)]
pub struct DeferredOp {
	pub virt: VirtAddr,
	pub len: usize,
}

static DEFERRED: SpinlockIrqSave<Deque<DeferredOp, DEFERRED_CACHE_OPS>> =
	SpinlockIrqSave::new(Deque::new());

fn run_tier(tier: CacheTier, virt: VirtAddr, len: usize) {
	match tier {
		CacheTier::Clflush { line_size } => {
			cache::clflush_range(virt.as_ptr(), len, line_size);
		}
		CacheTier::Wbinvd => {
			if irq::in_isr() {
				defer(DeferredOp { virt, len });
			} else {
				cache::wbinvd();
			}
		}
		CacheTier::SoftwareBarrier => cache::barrier(),
		CacheTier::None => {}
	}
}

/// Makes CPU writes to `virt..virt+len` visible to the device. Elided
/// when the mapping layer already guarantees it.
pub fn writeback(tier: CacheTier, virt: VirtAddr, len: usize, flags: MapFlags) {
	if flags.contains(MapFlags::NO_FLUSH) {
		return;
	}
	run_tier(tier, virt, len);
}

/// Makes device writes to `virt..virt+len` visible to the CPU. Elided
/// when the mapping layer already guarantees it.
pub fn invalidate(tier: CacheTier, virt: VirtAddr, len: usize, flags: MapFlags) {
	if flags.contains(MapFlags::NO_INVALIDATE) {
		return;
	}
	run_tier(tier, virt, len);
}

fn defer(op: DeferredOp) {
	let mut queue = DEFERRED.lock();
	if queue.push_back(op).is_err() {
		// Bounded queue is full. Dropping the operation is safe on every
		// configuration that can reach this tier; the elision is merely
		// lost.
		warn!("deferred cache-op queue overflow, dropping {op:?}");
	}
}

/// Number of operations waiting for the outermost interrupt exit.
pub fn deferred_pending() -> usize {
	DEFERRED.lock().len()
}

/// Executes everything deferred out of interrupt context. Called at
/// interrupt-nesting depth zero; WBINVD is global, so one execution
/// covers all queued operations.
pub fn drain_deferred() {
	debug_assert!(!irq::in_isr(), "cache drain inside interrupt");

	let drained = {
		let mut queue = DEFERRED.lock();
		let n = queue.len();
		queue.clear();
		n
	};
	if drained > 0 {
		cache::wbinvd();
		debug!("drained {drained} deferred cache ops");
	}
}
