//! DMA safety: per-device policy, cache coherency, buffer placement.
//!
//! The policy engine runs once per device at attach. Its verdict, the
//! system cache tier, and the ISA addressing ceiling are cached on the
//! device record and consulted by the transmit path and the ring engine
//! on every transfer.

pub mod cache;
pub mod mapping;
pub mod pool;

use memory_addresses::PhysAddr;

pub use self::cache::CacheTier;
pub use self::mapping::{map_tx, unmap, TxMapping};

use crate::arch::cpu::CpuInfo;
use crate::pktdrv::ErrorKind;

const ISA_DMA_CEILING: u64 = 16 * 1024 * 1024;

/// Per-device DMA verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaPolicy {
	/// Programmed I/O only; the FIFO paths carry all data.
	Pio,
	/// Descriptors carry real physical addresses.
	Direct,
	/// Every transfer flows through service-allocated bounce buffers.
	CommonBuffer,
	/// The execution environment virtualizes physical addresses and
	/// offers no mapping service; DMA would corrupt memory. The device
	/// runs its PIO paths.
	Forbid,
}

impl DmaPolicy {
	pub fn uses_dma(self) -> bool {
		matches!(self, Self::Direct | Self::CommonBuffer)
	}
}

/// Everything the send path and ring engine need to know about moving
/// bytes to and from this device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaConfig {
	pub policy: DmaPolicy,
	pub tier: CacheTier,
	/// ISA bus-masters address 24 bits; buffers above get bounced.
	pub isa_16m_ceiling: bool,
}

impl DmaConfig {
	pub const PIO: Self = Self {
		policy: DmaPolicy::Pio,
		tier: CacheTier::None,
		isa_16m_ceiling: false,
	};
}

/// True when `phys..phys+len` spans a 64 KiB physical page. The 3Com ISA
/// bus-master engine itself can cross; the rule is the buffer placement
/// contract of the descriptor, not an 8237 restriction.
pub fn crosses_64k(phys: PhysAddr, len: usize) -> bool {
	if len == 0 {
		return false;
	}
	(phys.as_u64() >> 16) != ((phys.as_u64() + len as u64 - 1) >> 16)
}

/// True when `phys..phys+len` is addressable by a 24-bit master.
pub fn within_isa_ceiling(phys: PhysAddr, len: usize) -> bool {
	phys.as_u64() + len as u64 <= ISA_DMA_CEILING
}

/// DMA-capable allocation honoring the policy: through the mapping
/// service under [`DmaPolicy::CommonBuffer`], straight from the bus
/// allocator otherwise.
pub fn alloc_dma(
	bus: &dyn crate::bus::Bus,
	layout: crate::bus::DmaLayout,
	via_service: bool,
) -> Option<(crate::bus::DmaRegion, crate::bus::MapFlags)> {
	if via_service {
		bus.mapping_service()?.alloc(layout)
	} else {
		bus.dma_alloc(layout)
			.map(|region| (region, crate::bus::MapFlags::empty()))
	}
}

/// Counterpart of [`alloc_dma`].
pub fn free_dma(bus: &dyn crate::bus::Bus, region: crate::bus::DmaRegion, via_service: bool) {
	if via_service {
		if let Some(service) = bus.mapping_service() {
			service.free(region);
		}
	} else {
		bus.dma_free(region);
	}
}

/// Inputs to the policy ladder, gathered by the probe stages.
#[derive(Debug, Clone, Copy)]
pub struct PolicyInputs<'a> {
	pub device_busmaster_capable: bool,
	pub device_is_isa: bool,
	pub forced_pio: bool,
	pub forced_busmaster: bool,
	pub cpu: &'a CpuInfo,
	pub paging_active: bool,
	pub mapping_service_present: bool,
	pub snooping_verified: bool,
}

/// The gate ladder. Evaluated once at attach; the first rejecting gate
/// wins. `smoke_test` runs a tiny transfer against scratch memory and is
/// only invoked when every earlier gate passed.
pub fn select(
	inputs: &PolicyInputs<'_>,
	smoke_test: impl FnOnce() -> bool,
) -> Result<DmaConfig, ErrorKind> {
	let tier = |service_managed: bool| {
		CacheTier::select(inputs.cpu, service_managed, inputs.snooping_verified)
	};
	let pio = || -> Result<DmaConfig, ErrorKind> {
		Ok(DmaConfig {
			policy: DmaPolicy::Pio,
			tier: tier(false),
			isa_16m_ceiling: false,
		})
	};

	// 1. Device class.
	if !inputs.device_busmaster_capable {
		if inputs.forced_busmaster {
			error!("bus-master transfers demanded of PIO-only silicon");
			return Err(ErrorKind::Capability);
		}
		return pio();
	}

	// 2. Configuration override.
	if inputs.forced_pio {
		return pio();
	}

	// 3. CPU capability.
	if !inputs.cpu.supports_busmaster() {
		return pio();
	}

	// 4. Execution environment.
	if inputs.paging_active {
		return if inputs.mapping_service_present {
			Ok(DmaConfig {
				policy: DmaPolicy::CommonBuffer,
				tier: tier(true),
				isa_16m_ceiling: inputs.device_is_isa,
			})
		} else {
			Ok(DmaConfig {
				policy: DmaPolicy::Forbid,
				tier: tier(false),
				isa_16m_ceiling: false,
			})
		};
	}

	// 5. Bus-master smoke test.
	if !smoke_test() {
		warn!("bus-master smoke test failed, falling back to PIO");
		return pio();
	}

	// 6. ISA addressing ceiling.
	Ok(DmaConfig {
		policy: DmaPolicy::Direct,
		tier: tier(false),
		isa_16m_ceiling: inputs.device_is_isa,
	})
}
