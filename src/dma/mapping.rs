//! Transient DMA mappings for in-flight transmits.
//!
//! Receive buffers live in rings that are allocated DMA-safe up front,
//! so only the transmit path maps arbitrary application buffers. A
//! mapping resolves the physical address, substitutes a bounce slot when
//! the buffer violates a placement rule, and performs the
//! transmit-direction cache write-back, leaving a descriptor-ready
//! address behind.

use memory_addresses::{PhysAddr, VirtAddr};

use crate::bus::{Bus, Direction, DmaWindow, MapFlags};
use crate::dma::cache::{self, CacheTier};
use crate::dma::{crosses_64k, pool, within_isa_ceiling, DmaPolicy};
use crate::pktdrv::ErrorKind;

/// One in-flight transmit mapping.
#[derive(Debug)]
pub struct TxMapping {
	pub device_index: usize,
	pub phys: PhysAddr,
	pub len: usize,
	pub(crate) bounce: Option<usize>,
	pub(crate) window: Option<(VirtAddr, usize, DmaWindow)>,
}

impl TxMapping {
	pub fn is_bounced(&self) -> bool {
		self.bounce.is_some()
	}
}

fn bounce_in(
	device_index: usize,
	frame: &[u8],
	tier: CacheTier,
) -> Result<TxMapping, ErrorKind> {
	let buf = pool::acquire().ok_or(ErrorKind::Exhausted)?;
	debug_assert!(frame.len() <= buf.region.size);

	unsafe {
		core::ptr::copy_nonoverlapping(frame.as_ptr(), buf.region.as_ptr(), frame.len());
	}
	cache::writeback(tier, buf.region.virt, frame.len(), buf.flags);

	Ok(TxMapping {
		device_index,
		phys: buf.region.phys,
		len: frame.len(),
		bounce: Some(buf.index),
		window: None,
	})
}

/// Maps `frame` for a device read. The returned mapping is fully
/// cache-maintained; the caller only posts the descriptor.
pub fn map_tx(
	bus: &dyn Bus,
	device_index: usize,
	policy: DmaPolicy,
	tier: CacheTier,
	isa_ceiling: bool,
	frame: &[u8],
) -> Result<TxMapping, ErrorKind> {
	let virt = VirtAddr::from_ptr(frame.as_ptr());

	match policy {
		DmaPolicy::Pio | DmaPolicy::Forbid => Err(ErrorKind::Invariant),
		DmaPolicy::CommonBuffer => bounce_in(device_index, frame, tier),
		DmaPolicy::Direct => {
			if let Some(service) = bus.mapping_service() {
				let window = service
					.lock_region(virt, frame.len(), Direction::ToDevice)
					.ok_or(ErrorKind::Exhausted)?;
				if !crosses_64k(window.phys, frame.len())
					&& (!isa_ceiling || within_isa_ceiling(window.phys, frame.len()))
				{
					cache::writeback(tier, virt, frame.len(), window.flags);
					return Ok(TxMapping {
						device_index,
						phys: window.phys,
						len: frame.len(),
						bounce: None,
						window: Some((virt, frame.len(), window)),
					});
				}
				service.unlock_region(virt, frame.len(), window);
				return bounce_in(device_index, frame, tier);
			}

			let phys = bus.virt_to_phys(virt).ok_or(ErrorKind::Invariant)?;
			if crosses_64k(phys, frame.len())
				|| (isa_ceiling && !within_isa_ceiling(phys, frame.len()))
			{
				return bounce_in(device_index, frame, tier);
			}

			cache::writeback(tier, virt, frame.len(), MapFlags::empty());
			Ok(TxMapping {
				device_index,
				phys,
				len: frame.len(),
				bounce: None,
				window: None,
			})
		}
	}
}

/// Releases a mapping after the completion reap. Returns an invariant
/// error on bounce-accounting mismatch.
pub fn unmap(bus: &dyn Bus, mapping: TxMapping) -> Result<(), ErrorKind> {
	if let Some((virt, len, window)) = mapping.window {
		if let Some(service) = bus.mapping_service() {
			service.unlock_region(virt, len, window);
		}
	}
	if let Some(index) = mapping.bounce {
		pool::release(index)?;
	}
	Ok(())
}
