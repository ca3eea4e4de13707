//! The platform seam.
//!
//! Every access the core makes to the machine goes through the
//! [`Bus`] trait: port I/O, DMA-capable memory, the interrupt-vector
//! table, the tick source, and the optional virtual-DMA service. The
//! resident stub supplies the real implementation; the test-suite supplies
//! a simulated machine with behavioral chip models behind the same trait.

#[cfg(feature = "isa")]
pub mod isa;
#[cfg(feature = "pci")]
pub mod pci;

use memory_addresses::{PhysAddr, VirtAddr};

/// Transfer direction of a DMA mapping, seen from the CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
	/// CPU produced the data; the device will read it.
	ToDevice,
	/// The device produces the data; the CPU will read it.
	FromDevice,
}

/// Placement constraints for a DMA-capable allocation.
#[derive(Debug, Clone, Copy)]
pub struct DmaLayout {
	pub size: usize,
	pub align: usize,
	/// ISA bus-master engines address 24 bits only.
	pub below_16m: bool,
	/// The region must not span a 64 KiB physical boundary.
	pub within_64k: bool,
}

impl DmaLayout {
	pub const fn frame(size: usize) -> Self {
		Self {
			size,
			align: 16,
			below_16m: false,
			within_64k: true,
		}
	}
}

/// A physically contiguous, device-visible memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaRegion {
	pub virt: VirtAddr,
	pub phys: PhysAddr,
	pub size: usize,
}

impl DmaRegion {
	pub fn as_ptr<T>(&self) -> *mut T {
		self.virt.as_mut_ptr()
	}

	/// The region as a byte slice.
	///
	/// # Safety
	///
	/// The caller must hold the region and must not alias a concurrently
	/// device-owned portion.
	pub unsafe fn as_slice(&self) -> &[u8] {
		unsafe { core::slice::from_raw_parts(self.as_ptr(), self.size) }
	}

	/// Mutable variant of [`Self::as_slice`]; same contract.
	#[allow(clippy::mut_from_ref)]
	pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
		unsafe { core::slice::from_raw_parts_mut(self.as_ptr(), self.size) }
	}
}

bitflags::bitflags! {
	/// Cache-responsibility flags returned by the mapping service.
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
	pub struct MapFlags: u8 {
		/// The service already guarantees write-back; the driver must not
		/// flush before device reads.
		const NO_FLUSH = 0b0000_0001;
		/// The service already guarantees invalidation; the driver must
		/// not invalidate before CPU reads.
		const NO_INVALIDATE = 0b0000_0010;
	}
}

/// A locked virtual-to-physical window obtained from the mapping service.
#[derive(Debug, Clone, Copy)]
pub struct DmaWindow {
	pub phys: PhysAddr,
	pub flags: MapFlags,
}

/// Virtual-DMA mapping facility exposed by memory managers that remap
/// physical addresses. When present, it is the only licit source of
/// physical addresses; [`Bus::virt_to_phys`] lies under such managers.
pub trait MappingService: Sync {
	/// Pins `virt..virt+len` and returns its bus-visible address.
	fn lock_region(&self, virt: VirtAddr, len: usize, dir: Direction) -> Option<DmaWindow>;

	/// Releases a window obtained from [`Self::lock_region`].
	fn unlock_region(&self, virt: VirtAddr, len: usize, window: DmaWindow);

	/// Allocates a buffer that is DMA-safe under the memory manager.
	fn alloc(&self, layout: DmaLayout) -> Option<(DmaRegion, MapFlags)>;

	/// Returns a buffer obtained from [`Self::alloc`].
	fn free(&self, region: DmaRegion);
}

/// Opaque contents of one interrupt-vector-table slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VectorSlot(pub u32);

impl VectorSlot {
	pub const EMPTY: Self = Self(0);
}

/// The machine, as seen by the driver core.
///
/// Implementations must be cheap: port accessors are called from the
/// interrupt front half. The default string-I/O methods loop the scalar
/// accessors; a bare-metal bus overrides them with `rep insw`-class
/// transfers, which is where the PIO back-ends earn their throughput.
pub trait Bus: Sync {
	fn inb(&self, port: u16) -> u8;
	fn inw(&self, port: u16) -> u16;
	fn inl(&self, port: u16) -> u32;
	fn outb(&self, port: u16, value: u8);
	fn outw(&self, port: u16, value: u16);
	fn outl(&self, port: u16, value: u32);

	fn insw(&self, port: u16, buf: &mut [u16]) {
		for word in buf {
			*word = self.inw(port);
		}
	}

	fn outsw(&self, port: u16, buf: &[u16]) {
		for word in buf {
			self.outw(port, *word);
		}
	}

	fn insl(&self, port: u16, buf: &mut [u32]) {
		for dword in buf {
			*dword = self.inl(port);
		}
	}

	fn outsl(&self, port: u16, buf: &[u32]) {
		for dword in buf {
			self.outl(port, *dword);
		}
	}

	/// Monotonic tick counter at PIT channel-0 rate
	/// ([`crate::config::PIT_HZ`]); all hardware-wait budgets count these.
	fn ticks(&self) -> u64;

	/// Allocates physically contiguous memory satisfying `layout`, or
	/// `None` when the allocator is exhausted or cannot satisfy the
	/// placement constraints.
	fn dma_alloc(&self, layout: DmaLayout) -> Option<DmaRegion>;

	fn dma_free(&self, region: DmaRegion);

	/// Physical address backing `virt`, or `None` when unknown. Not
	/// meaningful while a remapping memory manager is active; the DMA
	/// policy engine consults [`Self::mapping_service`] first.
	fn virt_to_phys(&self, virt: VirtAddr) -> Option<PhysAddr>;

	fn vector(&self, index: u8) -> VectorSlot;
	fn set_vector(&self, index: u8, slot: VectorSlot);

	/// Vector-slot value of the resident stub's application entry point.
	fn api_entry(&self) -> VectorSlot;

	/// Vector-slot value of the resident stub's hardware-interrupt thunk
	/// for `line`.
	fn irq_entry(&self, line: u8) -> VectorSlot;

	/// Invokes a foreign interrupt handler; shared-IRQ pass-down.
	fn chain(&self, slot: VectorSlot);

	/// Whether a memory manager that remaps physical addresses is active.
	fn paging_active(&self) -> bool {
		false
	}

	/// Platform PCI enumeration service, when one is exposed.
	#[cfg(feature = "pci")]
	fn pci_bios(&self) -> Option<&dyn pci::PciBios> {
		None
	}

	fn mapping_service(&self) -> Option<&dyn MappingService> {
		None
	}
}

/// Spins until `predicate` holds or `budget` ticks elapse. The workhorse
/// behind every bounded hardware wait.
pub fn poll_until(bus: &dyn Bus, budget: u64, mut predicate: impl FnMut() -> bool) -> bool {
	let deadline = bus.ticks().saturating_add(budget);
	loop {
		if predicate() {
			return true;
		}
		if bus.ticks() >= deadline {
			return false;
		}
		core::hint::spin_loop();
	}
}

/// Busy-waits for `ticks` PIT ticks.
pub fn delay(bus: &dyn Bus, ticks: u64) {
	let deadline = bus.ticks().saturating_add(ticks);
	while bus.ticks() < deadline {
		core::hint::spin_loop();
	}
}
