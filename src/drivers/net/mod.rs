//! The hardware abstraction layer.
//!
//! One operations table per chip generation, bound at attach. The
//! dispatcher and the back-ends behind it are the only code in the crate
//! that touches EtherLink registers. Shared behaviors live here as
//! [`NetDevice`] methods the back-ends call into: the windowed register
//! file, EEPROM access, the receive filter, the statistics drain.

#[cfg(feature = "pci")]
pub mod boomerang;
#[cfg(any(feature = "isa", feature = "pci"))]
mod dma_engine;
#[cfg(feature = "isa")]
pub mod el3_busmaster;
#[cfg(feature = "isa")]
pub mod el3_pio;
pub mod fifo;
#[cfg(any(feature = "isa", feature = "pci"))]
mod pio;
pub mod regs;
pub mod rings;
#[cfg(feature = "pci")]
pub mod vortex;

use num_enum::{IntoPrimitive, TryFromPrimitive};

use self::regs::*;
use self::rings::{RxRing, TxRing};
use crate::bus::{poll_until, Bus};
use crate::config::{HW_TIMEOUT_TICKS, MTU};
use crate::dma::DmaConfig;
use crate::pktdrv::ErrorKind;
use crate::stats::DeviceStats;

/// Chip-generation bucket; decides the bound operations table and the
/// initial capability set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Generation {
	/// 3C509-class ISA, 10 Mb/s, FIFO only.
	IsaPio10,
	/// 3C515-class ISA, 100 Mb/s, single-shot bus master.
	IsaBusmaster100,
	/// 3C59x PCI, driven through the FIFOs.
	PciVortex,
	/// 3C90x PCI, descriptor engines.
	PciBoomerang,
	/// 3C905B, descriptor engines plus hardware checksums and NWAY.
	PciCyclone,
	/// 3C905C.
	PciTornado,
	/// 3C575-class CardBus.
	CardBus,
	/// 3C556-class laptop Mini-PCI.
	MiniPci,
}

impl Generation {
	pub fn is_isa(self) -> bool {
		matches!(self, Self::IsaPio10 | Self::IsaBusmaster100)
	}

	pub fn busmaster_capable(self) -> bool {
		!matches!(self, Self::IsaPio10 | Self::PciVortex)
	}

	pub fn fifo_size(self) -> usize {
		match self {
			Self::IsaPio10 => 2048,
			_ => 8192,
		}
	}

	/// Receive-ring depth for the descriptor back-ends. The earliest DMA
	/// generations are held at sixteen entries, later ones take the full
	/// configured ring.
	pub fn rx_ring_entries(self) -> usize {
		match self {
			Self::IsaBusmaster100 | Self::PciBoomerang => 16,
			_ => crate::config::RX_RING_SIZE,
		}
	}

	pub fn capabilities(self) -> Capabilities {
		let mut caps = Capabilities::empty();
		if self.busmaster_capable() {
			caps |= Capabilities::BUS_MASTER;
		}
		if self.is_isa() {
			if self.busmaster_capable() {
				caps |= Capabilities::ISA_16M_LIMIT;
			}
		} else {
			caps |= Capabilities::PERMANENT_WINDOW1;
		}
		if matches!(
			self,
			Self::PciBoomerang | Self::PciCyclone | Self::PciTornado | Self::CardBus | Self::MiniPci
		) {
			caps |= Capabilities::SCATTER_GATHER;
		}
		if matches!(
			self,
			Self::PciCyclone | Self::PciTornado | Self::CardBus | Self::MiniPci
		) {
			caps |= Capabilities::HW_CHECKSUM | Capabilities::NWAY;
		}
		caps | Capabilities::STATION_ADDR_WRITE
	}
}

bitflags::bitflags! {
	/// Per-device feature set, derived from the generation at probe time
	/// plus the few register bits that expose features unambiguously.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct Capabilities: u16 {
		const BUS_MASTER = 1 << 0;
		const HW_CHECKSUM = 1 << 1;
		const SCATTER_GATHER = 1 << 2;
		/// Window 1 stays mapped; redundant window switches elided.
		const PERMANENT_WINDOW1 = 1 << 3;
		/// 24-bit master engine; buffers above 16 MiB are bounced.
		const ISA_16M_LIMIT = 1 << 4;
		/// NWAY link auto-negotiation.
		const NWAY = 1 << 5;
		/// The station address registers are writable.
		const STATION_ADDR_WRITE = 1 << 6;
	}
}

/// A PCI product the driver claims.
pub struct PciBoard {
	pub device_id: u16,
	pub name: &'static str,
	pub generation: Generation,
}

pub static PCI_BOARDS: &[PciBoard] = &[
	PciBoard { device_id: 0x5900, name: "3C590", generation: Generation::PciVortex },
	PciBoard { device_id: 0x5950, name: "3C595-TX", generation: Generation::PciVortex },
	PciBoard { device_id: 0x5951, name: "3C595-T4", generation: Generation::PciVortex },
	PciBoard { device_id: 0x5952, name: "3C595-MII", generation: Generation::PciVortex },
	PciBoard { device_id: 0x9000, name: "3C900-TPO", generation: Generation::PciBoomerang },
	PciBoard { device_id: 0x9001, name: "3C900-Combo", generation: Generation::PciBoomerang },
	PciBoard { device_id: 0x9050, name: "3C905-TX", generation: Generation::PciBoomerang },
	PciBoard { device_id: 0x9051, name: "3C905-T4", generation: Generation::PciBoomerang },
	PciBoard { device_id: 0x9055, name: "3C905B-TX", generation: Generation::PciCyclone },
	PciBoard { device_id: 0x9058, name: "3C905B-Combo", generation: Generation::PciCyclone },
	PciBoard { device_id: 0x905A, name: "3C905B-FX", generation: Generation::PciCyclone },
	PciBoard { device_id: 0x9200, name: "3C905C-TX", generation: Generation::PciTornado },
	PciBoard { device_id: 0x9202, name: "3C920B-EMB", generation: Generation::PciTornado },
	PciBoard { device_id: 0x5057, name: "3C575", generation: Generation::CardBus },
	PciBoard { device_id: 0x5157, name: "3CCFE575BT", generation: Generation::CardBus },
	PciBoard { device_id: 0x5257, name: "3CCFE575CT", generation: Generation::CardBus },
	PciBoard { device_id: 0x6560, name: "3CCFE656", generation: Generation::CardBus },
	PciBoard { device_id: 0x5055, name: "3C555", generation: Generation::MiniPci },
	PciBoard { device_id: 0x6055, name: "3C556", generation: Generation::MiniPci },
	PciBoard { device_id: 0x6056, name: "3C556B", generation: Generation::MiniPci },
];

pub fn pci_board(device_id: u16) -> Option<&'static PciBoard> {
	PCI_BOARDS.iter().find(|board| board.device_id == device_id)
}

/// Classifies an ISA product-ID word. The 3C509 family reports 0x9050
/// with the revision in the middle nibble; the 3C515 reports 0x5051.
pub fn isa_product(product_id: u16) -> Option<(Generation, &'static str)> {
	match product_id {
		id if id & 0xF0FF == 0x9050 => Some((Generation::IsaPio10, "3C509")),
		0x5051 => Some((Generation::IsaBusmaster100, "3C515")),
		_ => None,
	}
}

/// Receive-filter level of an interface, in Packet Driver Specification
/// numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ReceiveMode {
	Off = 1,
	DirectOnly = 2,
	DirectBroadcast = 3,
	/// The family has no perfect multicast filter; requesting this level
	/// lands on [`Self::AllMulticast`] and the getter reports it.
	MulticastList = 4,
	AllMulticast = 5,
	Promiscuous = 6,
}

impl ReceiveMode {
	pub fn filter_bits(self) -> u16 {
		match self {
			Self::Off => 0,
			Self::DirectOnly => FILTER_STATION,
			Self::DirectBroadcast => FILTER_STATION | FILTER_BROADCAST,
			Self::MulticastList | Self::AllMulticast => {
				FILTER_STATION | FILTER_BROADCAST | FILTER_MULTICAST
			}
			Self::Promiscuous => {
				FILTER_STATION | FILTER_BROADCAST | FILTER_MULTICAST | FILTER_PROMISCUOUS
			}
		}
	}

	/// What the hardware will actually do for a requested level.
	pub fn effective(self) -> Self {
		match self {
			Self::MulticastList => Self::AllMulticast,
			other => other,
		}
	}
}

/// Register access of one device, usable from the interrupt front half:
/// no window state, only the window-independent command/status word.
#[derive(Clone, Copy)]
pub struct DevIo<'a> {
	pub bus: &'a dyn Bus,
	pub base: u16,
}

impl DevIo<'_> {
	pub fn status(&self) -> u16 {
		self.bus.inw(self.base + CMD_STATUS)
	}

	pub fn command(&self, command: u16) {
		self.bus.outw(self.base + CMD_STATUS, command);
	}
}

/// Event set classified by the front half; the interrupt-status sources
/// that were latched and acknowledged.
pub type Events = IntStatus;

/// Front-half verdict for one device on a shared line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsrVerdict {
	/// The device did not assert this interrupt.
	NotOurs,
	/// Acknowledged; events for the back half.
	Ours(Events),
}

/// Back-half service context. `dispatch` hands a received frame to the
/// handle table and reports whether a consumer took it.
pub struct ServiceCtx<'a> {
	pub scratch: &'a mut [u8; MTU],
	pub dispatch: &'a mut dyn FnMut(usize, &[u8]) -> bool,
	/// Set by a back-end that needs its device reset (adapter failure,
	/// ownership violation). The back half acts on it after the pass.
	pub reset_requested: bool,
}

/// One attached controller. Everything mutable lives here, guarded by
/// the per-device lock in the fleet; the operations table itself is
/// stateless and shared between devices of identical silicon.
pub struct NetDevice {
	pub index: usize,
	pub bus: &'static dyn Bus,
	pub generation: Generation,
	pub name: &'static str,
	pub io_base: u16,
	/// Memory-mapped register window of the PCI families, when assigned.
	pub mem_base: Option<u64>,
	pub irq: u8,
	pub station: [u8; 6],
	pub caps: Capabilities,
	pub fifo_size: usize,
	pub dma: DmaConfig,
	pub rx_mode: ReceiveMode,
	pub link_up: bool,
	pub stats: DeviceStats,
	pub rx_batch: usize,
	pub tx_batch: usize,
	/// FIFO inner-copy flavor, picked for the CPU at attach.
	pub fifo: fifo::FifoStyle,
	pub(crate) window: Option<u8>,
	pub(crate) rx_ring: Option<RxRing>,
	pub(crate) tx_ring: Option<TxRing>,
	/// Cache-responsibility flags of the ring memory (mapping-service
	/// allocations under the common-buffer policy).
	pub(crate) ring_flags: crate::bus::MapFlags,
	pub(crate) tx_start_thresh: u16,
}

impl NetDevice {
	pub fn io(&self) -> DevIo<'_> {
		DevIo {
			bus: self.bus,
			base: self.io_base,
		}
	}

	pub fn command(&self, command: u16) {
		self.io().command(command);
	}

	/// Issues a command that keeps `CMD_IN_PROGRESS` up and waits it out.
	pub fn command_wait(&self, command: u16) -> Result<(), ErrorKind> {
		self.command(command);
		let io = self.io();
		if poll_until(self.bus, HW_TIMEOUT_TICKS, || {
			io.status() & IntStatus::CMD_IN_PROGRESS.bits() == 0
		}) {
			Ok(())
		} else {
			Err(ErrorKind::HwTimeout)
		}
	}

	/// Asserts the register window `window`. Parts with a permanent
	/// window 1 track the current window and elide redundant switches;
	/// everything else issues the selector unconditionally.
	pub fn select_window(&mut self, window: u8) {
		if self.caps.contains(Capabilities::PERMANENT_WINDOW1) && self.window == Some(window) {
			return;
		}
		self.command(cmd_select_window(window));
		self.window = Some(window);
	}

	/// Reads one EEPROM word through window 0.
	pub fn read_eeprom(&mut self, word: u8) -> Result<u16, ErrorKind> {
		self.select_window(0);
		self.bus
			.outw(self.io_base + W0_EEPROM_CMD, EEPROM_READ | u16::from(word));
		if !poll_until(self.bus, HW_TIMEOUT_TICKS, || {
			self.bus.inw(self.io_base + W0_EEPROM_CMD) & EEPROM_BUSY == 0
		}) {
			return Err(ErrorKind::HwTimeout);
		}
		Ok(self.bus.inw(self.io_base + W0_EEPROM_DATA))
	}

	/// Station address from the EEPROM, words 0..3, big-endian per word.
	pub fn station_from_eeprom(&mut self) -> Result<[u8; 6], ErrorKind> {
		let mut station = [0u8; 6];
		for (i, word) in [EE_STATION0, EE_STATION1, EE_STATION2].iter().enumerate() {
			let w = self.read_eeprom(*word)?;
			station[2 * i] = (w >> 8) as u8;
			station[2 * i + 1] = (w & 0xFF) as u8;
		}
		Ok(station)
	}

	/// Programs `station` into the window-2 MAC registers.
	pub fn load_station_address(&mut self, station: [u8; 6]) {
		self.select_window(2);
		for (i, byte) in station.iter().enumerate() {
			self.bus.outb(self.io_base + W2_STATION_ADDR + i as u16, *byte);
		}
	}

	/// Reads the currently programmed station address back from window 2.
	pub fn station_from_registers(&mut self) -> [u8; 6] {
		self.select_window(2);
		let mut station = [0u8; 6];
		for (i, byte) in station.iter_mut().enumerate() {
			*byte = self.bus.inb(self.io_base + W2_STATION_ADDR + i as u16);
		}
		station
	}

	/// Programs the receive filter for `mode` through window 3, then
	/// returns to window 1 for the data paths.
	pub fn program_rx_filter(&mut self, mode: ReceiveMode) {
		self.select_window(3);
		self.command(cmd_set_rx_filter(mode.filter_bits()));
		self.rx_mode = mode.effective();
		self.select_window(1);
	}

	/// Folds the window-6 hardware counters into the software statistics
	/// before the 8-bit registers can wrap.
	pub fn drain_hw_stats(&mut self) {
		self.command(CMD_STATS_DISABLE);
		self.select_window(6);

		let base = self.io_base;
		let bus = self.bus;
		let rd = |off: u16| u64::from(bus.inb(base + off));
		self.stats.collisions +=
			rd(W6_MULTIPLE_COLLISIONS) + rd(W6_SINGLE_COLLISIONS) + rd(W6_LATE_COLLISIONS);
		self.stats.errors_out += rd(W6_CARRIER_LOST) + rd(W6_SQE_ERRORS);
		self.stats.overruns += rd(W6_RX_OVERRUNS);
		// Frame/byte totals are counted by the data paths; reading the
		// registers clears them so they cannot assert STATS_FULL again.
		let _ = rd(W6_TX_FRAMES_OK);
		let _ = rd(W6_RX_FRAMES_OK);
		let _ = rd(W6_TX_DEFERRALS);
		let _ = bus.inw(base + W6_RX_BYTES);
		let _ = bus.inw(base + W6_TX_BYTES);

		self.select_window(1);
		self.command(CMD_STATS_ENABLE);
	}

	/// Samples window-4 media status into the link state.
	pub fn update_link_state(&mut self) {
		self.select_window(4);
		let media = self.bus.inw(self.io_base + W4_MEDIA_STATUS);
		let up = media & MEDIA_LINK_BEAT != 0;
		if up != self.link_up {
			info!("{}: link {}", self.name, if up { "up" } else { "down" });
		}
		self.link_up = up;
		self.select_window(1);
	}
}

/// The operations table. One static instance per back-end; bound to
/// every matching device at attach and never moved afterwards.
pub trait NicOps: Sync {
	/// Brings the chip to operating state: reset, station address,
	/// receive filter, interrupt sources, transmit/receive enable.
	/// Idempotent; safe to invoke after [`Self::reset`].
	fn init(&self, dev: &mut NetDevice) -> Result<(), ErrorKind>;

	/// Global reset with bounded completion wait. Afterwards all rings
	/// are driver-owned and no DMA is in flight.
	fn reset(&self, dev: &mut NetDevice) -> Result<(), ErrorKind>;

	/// Enqueues one frame. Non-blocking; a full ring refuses with
	/// [`ErrorKind::Exhausted`].
	fn send(&self, dev: &mut NetDevice, frame: &[u8]) -> Result<(), ErrorKind>;

	/// Copies the next pending frame into `buf`, if any. `BAD_FRAME`
	/// class errors recycle the offending slot and report
	/// [`ErrorKind::TransientIo`].
	fn poll_receive(
		&self,
		dev: &mut NetDevice,
		buf: &mut [u8],
	) -> Result<Option<usize>, ErrorKind>;

	/// Front half: reads the status word, acknowledges our latched
	/// sources, and classifies. Idempotent under spurious entry.
	fn ack_and_classify(&self, io: DevIo<'_>) -> IsrVerdict;

	/// Back half: services the classified events under the batching caps.
	fn service(&self, dev: &mut NetDevice, events: Events, ctx: &mut ServiceCtx<'_>);

	/// The 6-byte station address currently in effect.
	fn station_address(&self, dev: &mut NetDevice) -> [u8; 6] {
		dev.station_from_registers()
	}

	fn set_rx_mode(&self, dev: &mut NetDevice, mode: ReceiveMode) -> Result<(), ErrorKind> {
		dev.program_rx_filter(mode);
		Ok(())
	}

	/// Masks the chip, stops the engines, releases rings and mappings.
	fn teardown(&self, dev: &mut NetDevice);

	/// Optional: definite transmit-completion indication. The transmit
	/// path never depends on it; completion is interrupt-driven.
	fn check_tx_complete(&self, _dev: &mut NetDevice) -> Option<bool> {
		None
	}

	/// Optional: definite receive-availability indication.
	fn check_rx_available(&self, _dev: &mut NetDevice) -> Option<bool> {
		None
	}

	fn set_station_address(&self, dev: &mut NetDevice, station: [u8; 6]) -> Result<(), ErrorKind> {
		if !dev.caps.contains(Capabilities::STATION_ADDR_WRITE) {
			return Err(ErrorKind::Capability);
		}
		dev.load_station_address(station);
		dev.station = station;
		Ok(())
	}

	/// DMA policy gate 5: a tiny transfer against scratch state proving
	/// the master engine moves data coherently. PIO back-ends are never
	/// asked.
	fn busmaster_probe(&self, _dev: &mut NetDevice) -> bool {
		false
	}
}

/// Interrupt sources cleared directly by the acknowledge command.
/// RX/TX completion clear through their own paths: discarding the frame
/// and popping the transmit status respectively.
pub(crate) const ACK_SOURCES: u16 = IntStatus::INT_LATCH.bits()
	| IntStatus::ADAPTER_FAILURE.bits()
	| IntStatus::TX_AVAILABLE.bits()
	| IntStatus::RX_EARLY.bits()
	| IntStatus::LINK_EVENT.bits()
	| IntStatus::STATS_FULL.bits()
	| IntStatus::DMA_DONE.bits()
	| IntStatus::DOWN_COMPLETE.bits()
	| IntStatus::UP_COMPLETE.bits();

/// The front-half classification shared by every generation: read the
/// status word, bail if the latch is clear, acknowledge what can be
/// acknowledged, and return the armed sources that were up.
pub(crate) fn classify_and_ack(io: DevIo<'_>) -> IsrVerdict {
	let status = io.status();
	if status & IntStatus::INT_LATCH.bits() == 0 {
		return IsrVerdict::NotOurs;
	}
	io.command(cmd_ack_intr(status & ACK_SOURCES));
	IsrVerdict::Ours(IntStatus::from_bits_truncate(status) & IntStatus::ARMED)
}

/// MAC bring-up shared by every generation: engine resets, station
/// address, default filter, thresholds, interrupt arming, enables.
/// Leaves window 1 asserted.
pub(crate) fn mac_bring_up(dev: &mut NetDevice) -> Result<(), ErrorKind> {
	dev.command_wait(CMD_TX_RESET)?;
	dev.command_wait(CMD_RX_RESET)?;

	let station = dev.station;
	dev.load_station_address(station);
	dev.program_rx_filter(ReceiveMode::DirectBroadcast);

	dev.tx_start_thresh = 256;
	dev.command(cmd_set_tx_start_thresh(dev.tx_start_thresh));

	let sources = IntStatus::ARMED.bits() | IntStatus::INT_LATCH.bits();
	dev.command(cmd_set_status_enb(sources));
	dev.command(cmd_set_intr_enb(sources));
	dev.command(CMD_STATS_ENABLE);

	dev.command(CMD_RX_ENABLE);
	dev.command(CMD_TX_ENABLE);
	dev.select_window(1);
	dev.update_link_state();
	Ok(())
}

/// MAC quiesce shared by every generation: disable engines, mask
/// interrupt sources, drop anything latched.
pub(crate) fn mac_quiesce(dev: &mut NetDevice) {
	dev.command(CMD_RX_DISABLE);
	dev.command(CMD_TX_DISABLE);
	dev.command(cmd_set_intr_enb(0));
	dev.command(cmd_set_status_enb(0));
	dev.command(cmd_ack_intr(ACK_SOURCES));
	dev.command(CMD_STATS_DISABLE);
}

/// Transmit-underrun recovery shared by the FIFO paths: reset the
/// transmitter, raise the start threshold (bounded by the FIFO), and
/// restart.
pub(crate) fn recover_tx_underrun(dev: &mut NetDevice) {
	dev.stats.underruns += 1;
	dev.stats.note_tx_error();
	let _ = dev.command_wait(CMD_TX_RESET);
	dev.tx_start_thresh = (dev.tx_start_thresh * 2).min(dev.fifo_size as u16);
	dev.command(cmd_set_tx_start_thresh(dev.tx_start_thresh));
	dev.command(CMD_TX_ENABLE);
}

/// Binds the operations table for `generation`. Tables are stateless
/// statics; devices of identical silicon share one.
pub fn ops_for(generation: Generation) -> &'static dyn NicOps {
	match generation {
		#[cfg(feature = "isa")]
		Generation::IsaPio10 => &el3_pio::El3PioOps,
		#[cfg(feature = "isa")]
		Generation::IsaBusmaster100 => &el3_busmaster::El3BusmasterOps,
		#[cfg(feature = "pci")]
		Generation::PciVortex => &vortex::VortexOps,
		#[cfg(feature = "pci")]
		_ => &boomerang::BoomerangOps,
		#[cfg(not(feature = "pci"))]
		_ => unreachable!("generation probed without its bus feature"),
	}
}
