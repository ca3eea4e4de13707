//! The lifecycle orchestrator: ordered bring-up, reverse-order unwind.
//!
//! Fifteen stages run in a fixed order; each records completion before
//! the next starts. A failing stage rolls every completed stage back in
//! strictly reverse order, each rollback releasing exactly what its
//! forward stage acquired. Two ordering properties are load-bearing:
//! the resident image is final (stage 11) before any vector points into
//! it (stage 12), and handlers are bound (stage 13) before their lines
//! can fire (stage 14).

pub mod fleet;

use alloc::vec::Vec;
use core::sync::atomic::AtomicU16;

use hermit_sync::SpinMutex;
use thiserror::Error;

use crate::arch::cpu::{self, CpuInfo};
use crate::bus::{Bus, DmaLayout};
use crate::config::MAX_DEVICES;
use crate::dma::{self, pool, DmaConfig, DmaPolicy, PolicyInputs};
use crate::drivers::error::DriverError;
use crate::drivers::net::{
	self, fifo::FifoStyle, Capabilities, NetDevice, ReceiveMode,
};
use crate::irq::{self, vector};
use crate::pktdrv::{self, ErrorKind};
use crate::{env, logging};
use fleet::DeviceSlot;

/// Bring-up stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
	CpuDetect,
	PlatformProbe,
	Config,
	ChipsetDetect,
	MappingService,
	MemoryInit,
	FrameOps,
	DeviceAttach,
	DmaPools,
	BackHalfInfra,
	Relocation,
	EntryVector,
	IrqBind,
	IrqUnmask,
	Activate,
}

impl Stage {
	pub const ALL: [Stage; 15] = [
		Stage::CpuDetect,
		Stage::PlatformProbe,
		Stage::Config,
		Stage::ChipsetDetect,
		Stage::MappingService,
		Stage::MemoryInit,
		Stage::FrameOps,
		Stage::DeviceAttach,
		Stage::DmaPools,
		Stage::BackHalfInfra,
		Stage::Relocation,
		Stage::EntryVector,
		Stage::IrqBind,
		Stage::IrqUnmask,
		Stage::Activate,
	];
}

/// A failed bring-up: which stage refused and why. Everything completed
/// before it has already been rolled back when this reaches the caller.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("bring-up failed at stage {stage:?}: {kind}")]
pub struct InstallError {
	pub stage: Stage,
	pub kind: ErrorKind,
}

#[derive(Debug, Clone, Copy, Default)]
struct PlatformInfo {
	paging: bool,
	mapping_service: bool,
	/// Chipset-verified bus snooping; feeds the cache-tier choice.
	snooping_verified: bool,
	has_pci: bool,
}

static BUS: SpinMutex<Option<&'static dyn Bus>> = SpinMutex::new(None);
static CPU: SpinMutex<Option<CpuInfo>> = SpinMutex::new(None);
static PLATFORM: SpinMutex<Option<PlatformInfo>> = SpinMutex::new(None);
static COMPLETED: SpinMutex<Vec<Stage>> = SpinMutex::new(Vec::new());
/// Lines unmasked in stage 14, with their previous mask state.
static UNMASKED: SpinMutex<Vec<(u8, bool)>> = SpinMutex::new(Vec::new());

/// The machine, once [`install`] has stored it. The interrupt front
/// half reaches the bus through here.
pub(crate) fn bus() -> Option<&'static dyn Bus> {
	*BUS.lock()
}

fn cpu_info() -> CpuInfo {
	CPU.lock().expect("CPU detection has not run")
}

fn platform_info() -> PlatformInfo {
	PLATFORM.lock().expect("platform probe has not run")
}

/// The stage bit-set: which stages are currently recorded complete.
pub fn completed_stages() -> u16 {
	let completed = COMPLETED.lock();
	Stage::ALL
		.iter()
		.enumerate()
		.filter(|(_, stage)| completed.contains(stage))
		.fold(0u16, |set, (bit, _)| set | (1u16 << bit))
}

fn stage_cpu_detect() -> Result<(), ErrorKind> {
	let info = cpu::detect();
	info!("CPU class {:?}, cache line {:?}", info.class, info.clflush_line);
	*CPU.lock() = Some(info);
	Ok(())
}

fn stage_platform_probe(bus: &dyn Bus) -> Result<(), ErrorKind> {
	let info = PlatformInfo {
		paging: bus.paging_active(),
		mapping_service: bus.mapping_service().is_some(),
		snooping_verified: false,
		has_pci: false,
	};
	if info.paging {
		info!(
			"physical addresses are virtualized, mapping service {}",
			if info.mapping_service { "present" } else { "absent" }
		);
	}
	*PLATFORM.lock() = Some(info);
	Ok(())
}

fn stage_config(options: &str) -> Result<(), ErrorKind> {
	env::init(options)?;
	logging::apply_level();
	Ok(())
}

fn stage_chipset_detect(bus: &dyn Bus) -> Result<(), ErrorKind> {
	#[cfg(feature = "pci")]
	{
		// Configuration mechanism #1 echoes the address register.
		const PROBE: u32 = 0x8000_0000;
		bus.outl(crate::bus::pci::PCI_CONFIG_ADDRESS_PORT, PROBE);
		let has_pci = bus.inl(crate::bus::pci::PCI_CONFIG_ADDRESS_PORT) == PROBE;
		if let Some(platform) = PLATFORM.lock().as_mut() {
			platform.has_pci = has_pci;
		}
		debug!("PCI configuration mechanism {}", if has_pci { "present" } else { "absent" });
	}
	#[cfg(not(feature = "pci"))]
	let _ = bus;
	Ok(())
}

fn stage_mapping_service(bus: &dyn Bus) -> Result<(), ErrorKind> {
	if platform_info().paging && bus.mapping_service().is_some() {
		info!("virtual-DMA mapping service engaged");
	}
	Ok(())
}

fn stage_memory_init(bus: &dyn Bus) -> Result<(), ErrorKind> {
	// The allocator the rings and pools will draw from has to work.
	let probe = bus
		.dma_alloc(DmaLayout::frame(64))
		.ok_or(ErrorKind::Exhausted)?;
	bus.dma_free(probe);
	Ok(())
}

fn stage_frame_ops() -> Result<(), ErrorKind> {
	pktdrv::handle::clear();
	Ok(())
}

#[allow(clippy::too_many_arguments)]
fn attach_one(
	bus: &'static dyn Bus,
	index: usize,
	generation: net::Generation,
	name: &'static str,
	io_base: u16,
	mem_base: Option<u64>,
	line: u8,
	station: Option<[u8; 6]>,
	cpu: &CpuInfo,
	platform: &PlatformInfo,
) -> Result<(), DriverError> {
	let attach_err = |kind| DriverError::Attach {
		name,
		io_base,
		kind,
	};
	let ops = net::ops_for(generation);

	let mut dev = NetDevice {
		index,
		bus,
		generation,
		name,
		io_base,
		mem_base,
		irq: line,
		station: station.unwrap_or_default(),
		caps: generation.capabilities(),
		fifo_size: generation.fifo_size(),
		dma: DmaConfig::PIO,
		rx_mode: ReceiveMode::DirectBroadcast,
		link_up: false,
		stats: Default::default(),
		rx_batch: cpu.rx_batch(),
		tx_batch: cpu.tx_batch(),
		fifo: FifoStyle::for_cpu(cpu),
		window: None,
		rx_ring: None,
		tx_ring: None,
		ring_flags: Default::default(),
		tx_start_thresh: 256,
	};

	if station.is_none() {
		dev.station = dev.station_from_eeprom().map_err(attach_err)?;
	}

	let inputs = PolicyInputs {
		device_busmaster_capable: generation.busmaster_capable(),
		device_is_isa: generation.is_isa(),
		forced_pio: env::is_forced_pio(),
		forced_busmaster: env::is_forced_busmaster(),
		cpu,
		paging_active: platform.paging,
		mapping_service_present: platform.mapping_service,
		snooping_verified: platform.snooping_verified,
	};
	dev.dma = dma::select(&inputs, || ops.busmaster_probe(&mut dev)).map_err(attach_err)?;

	ops.init(&mut dev).map_err(attach_err)?;

	info!(
		"attached {name} at {io_base:#x} irq {line}, policy {:?}, station {:02x?}",
		dev.dma.policy, dev.station
	);
	fleet::attach(DeviceSlot {
		index,
		io_base,
		line,
		ops,
		pending: AtomicU16::new(0),
		dev: SpinMutex::new(dev),
	});
	Ok(())
}

fn stage_device_attach(bus: &'static dyn Bus) -> Result<(), ErrorKind> {
	let cpu = cpu_info();
	let platform = platform_info();
	let mut index = 0usize;

	#[cfg(feature = "isa")]
	for nic in crate::bus::isa::probe(bus, &env::io_bases()) {
		if index >= MAX_DEVICES {
			break;
		}
		let Some((generation, name)) = net::isa_product(nic.product_id) else {
			warn!("unrecognized ISA product {:#06x}, skipping", nic.product_id);
			continue;
		};
		let line = env::irq_for(index).unwrap_or(nic.irq);
		match attach_one(
			bus,
			index,
			generation,
			name,
			nic.io_base,
			None,
			line,
			Some(nic.station),
			&cpu,
			&platform,
		) {
			Ok(()) => index += 1,
			Err(err) => warn!("{err}"),
		}
	}

	#[cfg(feature = "pci")]
	if platform.has_pci {
		let known: Vec<u16> = net::PCI_BOARDS.iter().map(|board| board.device_id).collect();
		for nic in crate::bus::pci::enumerate(bus, &known) {
			if index >= MAX_DEVICES {
				break;
			}
			let Some(board) = net::pci_board(nic.device_id) else {
				debug!("rejecting unknown 3Com product {:#06x}", nic.device_id);
				continue;
			};
			let generation = if nic.behind_cardbus {
				net::Generation::CardBus
			} else {
				board.generation
			};
			if generation.busmaster_capable() {
				crate::bus::pci::enable_busmaster(bus, &nic);
			}
			let line = env::irq_for(index).unwrap_or(nic.irq);
			match attach_one(
				bus,
				index,
				generation,
				board.name,
				nic.io_base,
				nic.mem_base,
				line,
				None,
				&cpu,
				&platform,
			) {
				Ok(()) => index += 1,
				Err(err) => warn!("{err}"),
			}
		}
	}

	if fleet::count() == 0 {
		return Err(ErrorKind::Probe);
	}
	Ok(())
}

fn rollback_device_attach() {
	for slot in fleet::slots() {
		let mut dev = slot.dev.lock();
		slot.ops.teardown(&mut dev);
	}
	drop(fleet::detach_all());
}

fn stage_dma_pools(bus: &dyn Bus) -> Result<(), ErrorKind> {
	let mut below_16m = false;
	let mut via_service = false;
	for slot in fleet::slots() {
		let dev = slot.dev.lock();
		if dev.dma.policy.uses_dma() && dev.caps.contains(Capabilities::ISA_16M_LIMIT) {
			below_16m = true;
		}
		if dev.dma.policy == DmaPolicy::CommonBuffer {
			via_service = true;
		}
	}
	pool::init(bus, below_16m, via_service)
}

fn stage_back_half_infra() -> Result<(), ErrorKind> {
	irq::infra_init();
	Ok(())
}

fn stage_relocation() -> Result<(), ErrorKind> {
	// The resident image is in its final location in this rendition;
	// what matters is the ordering guarantee: nothing after this stage
	// may move code or data that a vector will point into.
	Ok(())
}

fn stage_entry_vector(bus: &dyn Bus) -> Result<(), ErrorKind> {
	vector::install(bus, env::vector(), bus.api_entry());
	Ok(())
}

fn stage_irq_bind(bus: &dyn Bus) -> Result<(), ErrorKind> {
	// Validate the whole set before installing anything: the stage is
	// only recorded complete on success, so a vector installed ahead of
	// a refused line would never be rolled back.
	let lines = fleet::lines();
	for line in &lines {
		if *line == 0 || *line >= 16 {
			error!("interrupt line {line} cannot be bound");
			return Err(ErrorKind::Config);
		}
	}
	for line in lines {
		vector::install(bus, vector::vector_for_line(line), bus.irq_entry(line));
	}
	Ok(())
}

fn rollback_irq_bind(bus: &dyn Bus) {
	for line in fleet::lines() {
		vector::restore(bus, vector::vector_for_line(line));
	}
}

fn stage_irq_unmask(bus: &dyn Bus) -> Result<(), ErrorKind> {
	let mut unmasked = UNMASKED.lock();
	for line in fleet::lines() {
		let was_masked = irq::unmask(bus, line);
		unmasked.push((line, was_masked));
	}
	Ok(())
}

fn rollback_irq_unmask(bus: &dyn Bus) {
	for (line, was_masked) in UNMASKED.lock().drain(..) {
		if was_masked {
			irq::mask(bus, line);
		}
	}
}

fn run_stage(bus: &'static dyn Bus, options: &str, stage: Stage) -> Result<(), ErrorKind> {
	debug!("stage {stage:?}");
	match stage {
		Stage::CpuDetect => stage_cpu_detect(),
		Stage::PlatformProbe => stage_platform_probe(bus),
		Stage::Config => stage_config(options),
		Stage::ChipsetDetect => stage_chipset_detect(bus),
		Stage::MappingService => stage_mapping_service(bus),
		Stage::MemoryInit => stage_memory_init(bus),
		Stage::FrameOps => stage_frame_ops(),
		Stage::DeviceAttach => stage_device_attach(bus),
		Stage::DmaPools => stage_dma_pools(bus),
		Stage::BackHalfInfra => stage_back_half_infra(),
		Stage::Relocation => stage_relocation(),
		Stage::EntryVector => stage_entry_vector(bus),
		Stage::IrqBind => stage_irq_bind(bus),
		Stage::IrqUnmask => stage_irq_unmask(bus),
		Stage::Activate => {
			pktdrv::set_ready(true);
			Ok(())
		}
	}
}

fn roll_back(bus: &dyn Bus, stage: Stage) {
	debug!("rolling back stage {stage:?}");
	match stage {
		Stage::Activate => pktdrv::set_ready(false),
		Stage::IrqUnmask => rollback_irq_unmask(bus),
		Stage::IrqBind => rollback_irq_bind(bus),
		Stage::EntryVector => {
			vector::restore(bus, env::vector());
		}
		Stage::Relocation => {}
		Stage::BackHalfInfra => irq::infra_shutdown(),
		Stage::DmaPools => pool::shutdown(bus),
		Stage::DeviceAttach => rollback_device_attach(),
		Stage::FrameOps => pktdrv::handle::clear(),
		Stage::MemoryInit => {}
		Stage::MappingService => {}
		Stage::ChipsetDetect => {}
		Stage::Config => env::shutdown(),
		Stage::PlatformProbe => *PLATFORM.lock() = None,
		Stage::CpuDetect => *CPU.lock() = None,
	}
}

/// Unwinds every completed stage in strictly reverse order.
fn unwind(bus: &dyn Bus) {
	loop {
		let stage = COMPLETED.lock().pop();
		match stage {
			Some(stage) => roll_back(bus, stage),
			None => break,
		}
	}
	// Backstop: nothing we installed may survive an unwind, even a
	// vector orphaned by a stage that failed mid-flight.
	vector::restore_all(bus);
}

/// Runs the staged bring-up. On failure, everything already completed
/// is unwound and the driver is back to its pre-install state; the
/// failed stage and error kind come back to the caller.
pub fn install(bus: &'static dyn Bus, options: &str) -> Result<(), InstallError> {
	logging::init();

	if !COMPLETED.lock().is_empty() {
		return Err(InstallError {
			stage: Stage::Activate,
			kind: ErrorKind::Config,
		});
	}
	*BUS.lock() = Some(bus);

	for stage in Stage::ALL {
		match run_stage(bus, options, stage) {
			Ok(()) => COMPLETED.lock().push(stage),
			Err(kind) => {
				error!("bring-up stage {stage:?} failed: {kind}");
				unwind(bus);
				*BUS.lock() = None;
				return Err(InstallError { stage, kind });
			}
		}
	}

	info!(
		"packet driver ready: {} interface(s), entry vector {:#04x}",
		fleet::count(),
		env::vector()
	);
	Ok(())
}

/// Full teardown: unwinds all fifteen stages. Memory-only; the driver
/// can be installed again afterwards.
pub fn uninstall() {
	let Some(bus) = bus() else {
		return;
	};
	unwind(bus);
	*BUS.lock() = None;
}
