//! The global bounce/common-buffer pool.
//!
//! One pool serves every device. Slots are physically contiguous, sized
//! for a maximum frame, verified never to span a 64 KiB physical
//! boundary, and placed below 16 MiB when any ISA bus-master is
//! attached. Allocation is a linear scan over a small pool.

use alloc::vec::Vec;

use crate::bus::{Bus, DmaLayout, DmaRegion, MapFlags};
use crate::config::{BOUNCE_BUF_SIZE, BOUNCE_POOL_SLOTS};
use crate::dma::{crosses_64k, within_isa_ceiling};
use crate::pktdrv::ErrorKind;
use crate::synch::SpinlockIrqSave;

struct Slot {
	region: DmaRegion,
	in_use: bool,
}

pub struct BouncePool {
	slots: Vec<Slot>,
	/// Set when the slots came from the mapping service; its flags apply
	/// to every slot uniformly.
	flags: MapFlags,
	service_owned: bool,
}

static POOL: SpinlockIrqSave<Option<BouncePool>> = SpinlockIrqSave::new(None);

/// A slot checked out of the pool.
#[derive(Debug, Clone, Copy)]
pub struct BounceBuf {
	pub index: usize,
	pub region: DmaRegion,
	pub flags: MapFlags,
}

impl BouncePool {
	fn build(bus: &dyn Bus, below_16m: bool, via_service: bool) -> Result<Self, ErrorKind> {
		let layout = DmaLayout {
			size: BOUNCE_BUF_SIZE,
			align: 16,
			below_16m,
			within_64k: true,
		};

		let mut slots = Vec::with_capacity(BOUNCE_POOL_SLOTS);
		let mut flags = MapFlags::empty();
		for _ in 0..BOUNCE_POOL_SLOTS {
			let acquired = if via_service {
				bus.mapping_service()
					.ok_or(ErrorKind::Config)
					.and_then(|service| service.alloc(layout).ok_or(ErrorKind::Exhausted))
					.map(|(region, service_flags)| {
						flags = service_flags;
						region
					})
			} else {
				bus.dma_alloc(layout).ok_or(ErrorKind::Exhausted)
			};

			// A refusal mid-build hands every slot acquired so far back
			// to its allocator before the error propagates.
			let region = match acquired {
				Ok(region) => region,
				Err(kind) => {
					Self::release_slots(bus, slots, via_service);
					return Err(kind);
				}
			};

			if crosses_64k(region.phys, region.size)
				|| (below_16m && !within_isa_ceiling(region.phys, region.size))
			{
				error!("allocator returned an unusable bounce slot at {:?}", region.phys);
				crate::dma::free_dma(bus, region, via_service);
				Self::release_slots(bus, slots, via_service);
				return Err(ErrorKind::Invariant);
			}
			slots.push(Slot {
				region,
				in_use: false,
			});
		}

		Ok(Self {
			slots,
			flags,
			service_owned: via_service,
		})
	}

	fn release_slots(bus: &dyn Bus, slots: Vec<Slot>, via_service: bool) {
		for slot in slots {
			crate::dma::free_dma(bus, slot.region, via_service);
		}
	}

	fn acquire(&mut self) -> Option<BounceBuf> {
		let (index, slot) = self
			.slots
			.iter_mut()
			.enumerate()
			.find(|(_, slot)| !slot.in_use)?;
		slot.in_use = true;
		Some(BounceBuf {
			index,
			region: slot.region,
			flags: self.flags,
		})
	}

	fn release(&mut self, index: usize) -> Result<(), ErrorKind> {
		let slot = self.slots.get_mut(index).ok_or(ErrorKind::Invariant)?;
		if !slot.in_use {
			return Err(ErrorKind::Invariant);
		}
		slot.in_use = false;
		Ok(())
	}

	fn in_use_count(&self) -> usize {
		self.slots.iter().filter(|slot| slot.in_use).count()
	}
}

/// Builds the global pool. Bring-up stage 9.
pub fn init(bus: &dyn Bus, below_16m: bool, via_service: bool) -> Result<(), ErrorKind> {
	let pool = BouncePool::build(bus, below_16m, via_service)?;
	*POOL.lock() = Some(pool);
	Ok(())
}

/// Returns every slot to the allocator. Stage-9 rollback and teardown.
pub fn shutdown(bus: &dyn Bus) {
	if let Some(pool) = POOL.lock().take() {
		let outstanding = pool.in_use_count();
		if outstanding != 0 {
			warn!("tearing down bounce pool with {outstanding} slots in flight");
		}
		BouncePool::release_slots(bus, pool.slots, pool.service_owned);
	}
}

/// Checks a slot out of the pool; `None` when all are in flight.
pub fn acquire() -> Option<BounceBuf> {
	POOL.lock().as_mut()?.acquire()
}

/// Returns a slot. An accounting mismatch is an invariant violation and
/// is surfaced to the caller, which schedules a device reset.
pub fn release(index: usize) -> Result<(), ErrorKind> {
	POOL.lock()
		.as_mut()
		.ok_or(ErrorKind::Invariant)?
		.release(index)
}

/// Slots currently in flight; equals the number of outstanding bounce
/// mappings at all times.
pub fn in_use() -> usize {
	POOL.lock().as_ref().map_or(0, BouncePool::in_use_count)
}
