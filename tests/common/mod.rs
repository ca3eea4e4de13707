//! The simulated machine behind the end-to-end tests.
//!
//! [`TestMachine`] implements the driver's `Bus` seam over an arena with
//! fake physical addresses and carries behavioral models of the
//! EtherLink chips: the windowed register file, the ID-port contention
//! protocol, the FIFO data paths, the upload/download descriptor
//! engines, the single-shot master, the 8259 pair, the vector table, and
//! PCI configuration mechanism #1. Transmitted frames loop back through
//! the receive filter, so a frame sent to the broadcast address comes
//! back byte-identical.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::ptr::NonNull;
use std::sync::{Mutex, MutexGuard, OnceLock};

use el3pkt::bus::{Bus, DmaLayout, DmaRegion, MapFlags, MappingService, VectorSlot};
use el3pkt::pktdrv::{Handle, Receiver};
use memory_addresses::{PhysAddr, VirtAddr};

/// Serializes tests within one binary; the driver state is process-wide.
pub fn serial() -> MutexGuard<'static, ()> {
	static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
	LOCK.get_or_init(|| Mutex::new(()))
		.lock()
		.unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Uninstalls the driver when a test scope ends, pass or panic.
pub struct Installed;

impl Drop for Installed {
	fn drop(&mut self) {
		el3pkt::uninstall();
	}
}

const ARENA_SIZE: usize = 4 << 20;
const PHYS_BASE: u64 = 0x0010_0000;

pub const ID_PORT: u16 = 0x110;

// Register/command values mirrored from the driver's register model.
const CMD_STATUS: u16 = 0x0E;
const INT_LATCH: u16 = 0x0001;
const ADAPTER_FAILURE: u16 = 0x0002;
const TX_COMPLETE: u16 = 0x0004;
const RX_COMPLETE: u16 = 0x0010;
const LINK_EVENT: u16 = 0x0040;
const STATS_FULL: u16 = 0x0080;
const DMA_DONE: u16 = 0x0100;
const DOWN_COMPLETE: u16 = 0x0200;
const UP_COMPLETE: u16 = 0x0400;

const RX_INCOMPLETE: u16 = 0x8000;
const RX_ERROR: u16 = 0x4000;

const TXS_COMPLETE: u8 = 0x80;
const TXS_UNDERRUN: u8 = 0x10;

const FILTER_STATION: u16 = 1;
const FILTER_MULTICAST: u16 = 2;
const FILTER_BROADCAST: u16 = 4;
const FILTER_PROMISCUOUS: u16 = 8;

const MEDIA_LINK_BEAT: u16 = 0x0800;

const UP_DESC_COMPLETE: u32 = 1 << 15;
const UP_DESC_ERROR: u32 = 1 << 14;
const DN_INDICATE: u32 = 1 << 31;
const DN_DESC_COMPLETE: u32 = 1 << 16;
const DN_ERR_UNDERRUN: u32 = 1 << 17;
const DN_ERR_MAX_COLLISIONS: u32 = 1 << 19;
const FRAG_LAST: u32 = 1 << 31;

const PIC1_CMD: u16 = 0x20;
const PIC1_DATA: u16 = 0x21;
const PIC2_CMD: u16 = 0xA0;
const PIC2_DATA: u16 = 0xA1;
const PIC_EOI: u8 = 0x20;

const PCI_ADDR: u16 = 0xCF8;
const PCI_DATA: u16 = 0xCFC;

/// Sources our models latch; RX/TX completion are live conditions.
const LATCHABLE: u16 =
	ADAPTER_FAILURE | LINK_EVENT | STATS_FULL | DMA_DONE | DOWN_COMPLETE | UP_COMPLETE;

struct MemPool {
	base: usize,
	next: usize,
	outstanding: usize,
	/// Remaining successful allocations before the allocator reports
	/// exhaustion; `None` is unlimited.
	alloc_budget: Option<usize>,
}

impl MemPool {
	fn new() -> Self {
		let arena: &'static mut [u8] = vec![0u8; ARENA_SIZE].leak();
		Self {
			base: arena.as_mut_ptr() as usize,
			next: 0,
			outstanding: 0,
			alloc_budget: None,
		}
	}

	fn carve(&mut self, offset: usize, size: usize) -> DmaRegion {
		self.next = offset + size;
		self.outstanding += 1;
		DmaRegion {
			virt: VirtAddr::new((self.base + offset) as u64),
			phys: PhysAddr::new(PHYS_BASE + offset as u64),
			size,
		}
	}

	fn alloc(&mut self, layout: DmaLayout) -> Option<DmaRegion> {
		if let Some(budget) = self.alloc_budget.as_mut() {
			if *budget == 0 {
				return None;
			}
			*budget -= 1;
		}

		let align = layout.align.max(1);
		let mut offset = (self.next + align - 1) & !(align - 1);

		if layout.within_64k {
			let start = PHYS_BASE + offset as u64;
			let end = start + layout.size as u64 - 1;
			if start >> 16 != end >> 16 {
				let boundary = ((start >> 16) + 1) << 16;
				offset = (boundary - PHYS_BASE) as usize;
			}
		}
		if offset + layout.size > ARENA_SIZE {
			return None;
		}
		if layout.below_16m && PHYS_BASE + (offset + layout.size) as u64 > 16 << 20 {
			return None;
		}
		Some(self.carve(offset, layout.size))
	}

	/// A buffer whose physical range straddles a 64 KiB boundary.
	fn alloc_crossing_64k(&mut self, size: usize) -> DmaRegion {
		assert!(size >= 2);
		let min_start = PHYS_BASE + self.next as u64 + size as u64;
		let boundary = ((min_start >> 16) + 1) << 16;
		let offset = (boundary - PHYS_BASE) as usize - size / 2;
		let region = self.carve(offset, size);
		assert_ne!(
			region.phys.as_u64() >> 16,
			(region.phys.as_u64() + size as u64 - 1) >> 16,
			"arena layout did not produce a crossing buffer"
		);
		region
	}

	fn free(&mut self, _region: DmaRegion) {
		self.outstanding -= 1;
	}

	fn virt_to_phys(&self, virt: VirtAddr) -> Option<PhysAddr> {
		let addr = virt.as_u64() as usize;
		(addr >= self.base && addr < self.base + ARENA_SIZE)
			.then(|| PhysAddr::new(PHYS_BASE + (addr - self.base) as u64))
	}

	fn ptr(&self, phys: u64) -> *mut u8 {
		let offset = (phys - PHYS_BASE) as usize;
		assert!(offset < ARENA_SIZE, "device touched memory outside the arena");
		(self.base + offset) as *mut u8
	}

	fn read_bytes(&self, phys: u64, len: usize) -> Vec<u8> {
		let mut out = vec![0u8; len];
		unsafe { std::ptr::copy_nonoverlapping(self.ptr(phys), out.as_mut_ptr(), len) };
		out
	}

	fn write_bytes(&mut self, phys: u64, data: &[u8]) {
		unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr(phys), data.len()) };
	}

	fn read_u32(&self, phys: u64) -> u32 {
		u32::from_le_bytes(self.read_bytes(phys, 4).try_into().unwrap())
	}

	fn write_u32(&mut self, phys: u64, value: u32) {
		self.write_bytes(phys, &value.to_le_bytes());
	}
}

/// Which silicon a chip model behaves as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChipKind {
	/// 3C509: ISA, FIFO only, found via the ID port.
	IsaPio,
	/// 3C515: ISA, descriptor engines plus the window-7 master.
	IsaBusmaster,
	/// 3C59x: PCI, FIFO only.
	Vortex,
	/// 3C90x family: PCI descriptor engines.
	Boomerang,
}

impl ChipKind {
	fn has_lists(self) -> bool {
		matches!(self, Self::IsaBusmaster | Self::Boomerang)
	}

	fn fifo_size(self) -> usize {
		match self {
			Self::IsaPio => 2048,
			_ => 8192,
		}
	}
}

pub struct Chip {
	pub kind: ChipKind,
	pub active: bool,
	pub tagged: bool,
	pub io_base: u16,
	pub irq: u8,
	pub eeprom: [u16; 16],

	window: u8,
	latched: u16,
	int_enable: u16,
	status_enable: u16,
	station: [u8; 6],
	rx_filter: u16,
	rx_on: bool,
	tx_on: bool,

	tx_stage: Vec<u8>,
	rx_queue: VecDeque<Vec<u8>>,
	rx_read_pos: usize,
	tx_status_stack: VecDeque<u8>,
	eeprom_addr: u8,
	media_status: u16,

	up_list_ptr: u32,
	down_list_ptr: u32,
	up_stalled: bool,
	down_stalled: bool,
	master_addr: u32,
	master_len: u16,
	master_busy: bool,

	/// Everything the chip ever put on the wire.
	pub tx_frames: Vec<Vec<u8>>,
	/// Frames looped back to the receive side by the wire model.
	pub loopback: bool,

	// Fault injection.
	pub rx_error_next: Option<u16>,
	pub rx_error_next_up: Option<u32>,
	pub tx_underrun_next: bool,
	pub collisions_next: u8,
	pub fail_busmaster_probe: bool,
	/// Parks the download engine so posted descriptors pile up.
	pub hold_downloads: bool,
}

impl Chip {
	fn new(kind: ChipKind, io_base: u16, irq: u8, station: [u8; 6], active: bool) -> Self {
		let mut eeprom = [0u16; 16];
		eeprom[0] = u16::from_be_bytes([station[0], station[1]]);
		eeprom[1] = u16::from_be_bytes([station[2], station[3]]);
		eeprom[2] = u16::from_be_bytes([station[4], station[5]]);
		eeprom[3] = match kind {
			ChipKind::IsaPio => 0x9050,
			ChipKind::IsaBusmaster => 0x5051,
			_ => 0,
		};
		eeprom[7] = 0x6D50;
		eeprom[8] = (io_base.saturating_sub(0x200)) >> 4;
		eeprom[9] = u16::from(irq) << 12;

		Self {
			kind,
			active,
			tagged: false,
			io_base,
			irq,
			eeprom,
			window: 0,
			latched: 0,
			int_enable: 0,
			status_enable: 0xFFFF,
			station,
			rx_filter: 0,
			rx_on: false,
			tx_on: false,
			tx_stage: Vec::new(),
			rx_queue: VecDeque::new(),
			rx_read_pos: 0,
			tx_status_stack: VecDeque::new(),
			eeprom_addr: 0,
			media_status: MEDIA_LINK_BEAT,
			up_list_ptr: 0,
			down_list_ptr: 0,
			up_stalled: false,
			down_stalled: false,
			master_addr: 0,
			master_len: 0,
			master_busy: false,
			tx_frames: Vec::new(),
			loopback: true,
			rx_error_next: None,
			rx_error_next_up: None,
			tx_underrun_next: false,
			collisions_next: 0,
			fail_busmaster_probe: false,
			hold_downloads: false,
		}
	}

	fn live_status(&self) -> u16 {
		let mut live = 0;
		// With no upload list published the chip is in FIFO mode and
		// queued frames surface through the window-1 receive status.
		if self.rx_on && !self.rx_queue.is_empty() && self.up_list_ptr == 0 {
			live |= RX_COMPLETE;
		}
		if !self.tx_status_stack.is_empty() {
			live |= TX_COMPLETE;
		}
		live
	}

	fn status_word(&self) -> u16 {
		((self.latched | self.live_status()) & self.status_enable)
			| (u16::from(self.window) << 13)
	}

	fn latch(&mut self, bits: u16) {
		self.latched |= (bits & LATCHABLE) | INT_LATCH;
	}

	fn asserting_irq(&self) -> bool {
		self.active
			&& self.latched & INT_LATCH != 0
			&& (self.latched | self.live_status()) & self.int_enable != 0
	}

	fn accepts(&self, dest: &[u8]) -> bool {
		if self.rx_filter & FILTER_PROMISCUOUS != 0 {
			return true;
		}
		if dest == [0xFF; 6] {
			return self.rx_filter & FILTER_BROADCAST != 0;
		}
		if dest[0] & 1 == 1 {
			return self.rx_filter & FILTER_MULTICAST != 0;
		}
		dest == self.station && self.rx_filter & FILTER_STATION != 0
	}

	fn total_reset(&mut self) {
		self.window = 0;
		self.latched = 0;
		self.int_enable = 0;
		self.status_enable = 0xFFFF;
		self.rx_filter = 0;
		self.rx_on = false;
		self.tx_on = false;
		self.tx_stage.clear();
		self.rx_queue.clear();
		self.rx_read_pos = 0;
		self.tx_status_stack.clear();
		self.up_list_ptr = 0;
		self.down_list_ptr = 0;
		self.up_stalled = false;
		self.down_stalled = false;
		self.master_busy = false;
	}
}

/// The wire model: a completed transmit, looped back if the filter
/// accepts it.
fn wire_transmit(chip: &mut Chip, mem: &mut MemPool, frame: Vec<u8>) {
	chip.tx_frames.push(frame.clone());

	if chip.tx_underrun_next {
		chip.tx_underrun_next = false;
		chip.tx_status_stack.push_back(TXS_COMPLETE | TXS_UNDERRUN);
	} else {
		chip.tx_status_stack.push_back(TXS_COMPLETE);
	}
	chip.latched |= INT_LATCH;

	if chip.loopback && frame.len() >= 14 && chip.accepts(&frame[..6]) {
		deliver_frame(chip, mem, frame);
	}
}

/// A frame arriving from the wire side.
fn deliver_frame(chip: &mut Chip, mem: &mut MemPool, frame: Vec<u8>) {
	if !chip.rx_on {
		return;
	}
	chip.rx_queue.push_back(frame);
	if chip.up_list_ptr != 0 {
		process_upload(chip, mem);
	} else {
		chip.latched |= INT_LATCH;
	}
}

/// Upload engine: move queued frames into driver-owned descriptors.
fn process_upload(chip: &mut Chip, mem: &mut MemPool) {
	while !chip.rx_queue.is_empty() {
		if chip.up_list_ptr == 0 || chip.up_stalled {
			return;
		}
		let desc = u64::from(chip.up_list_ptr);
		let status = mem.read_u32(desc + 4);
		if status & UP_DESC_COMPLETE != 0 {
			// No driver-owned descriptor at the head; engine stalls.
			return;
		}
		let frag_addr = mem.read_u32(desc + 8);
		let frag_len = (mem.read_u32(desc + 12) & !FRAG_LAST) as usize;

		let frame = chip.rx_queue.pop_front().unwrap();
		let len = frame.len().min(frag_len);
		mem.write_bytes(u64::from(frag_addr), &frame[..len]);

		let mut new_status = UP_DESC_COMPLETE | len as u32;
		if let Some(error) = chip.rx_error_next_up.take() {
			new_status |= UP_DESC_ERROR | error;
		}
		mem.write_u32(desc + 4, new_status);

		chip.up_list_ptr = mem.read_u32(desc);
		chip.latch(UP_COMPLETE);
	}
}

/// Download engine: transmit posted descriptors in list order.
fn process_download(chip: &mut Chip, mem: &mut MemPool) {
	if chip.hold_downloads {
		return;
	}
	while !chip.down_stalled && chip.down_list_ptr != 0 {
		let desc = u64::from(chip.down_list_ptr);
		let frame_start = mem.read_u32(desc + 4);
		if frame_start & DN_INDICATE == 0 || frame_start & DN_DESC_COMPLETE != 0 {
			return;
		}
		let frag_addr = mem.read_u32(desc + 8);
		let frag_len = (mem.read_u32(desc + 12) & !FRAG_LAST) as usize;

		if chip.collisions_next > 0 {
			chip.collisions_next -= 1;
			mem.write_u32(
				desc + 4,
				frame_start | DN_DESC_COMPLETE | DN_ERR_MAX_COLLISIONS,
			);
			chip.latch(DOWN_COMPLETE);
			// The engine halts on the erroring descriptor so a re-armed
			// retry is fetched again.
			return;
		}
		if chip.tx_underrun_next {
			chip.tx_underrun_next = false;
			mem.write_u32(desc + 4, frame_start | DN_DESC_COMPLETE | DN_ERR_UNDERRUN);
			chip.latch(DOWN_COMPLETE);
			chip.down_list_ptr = mem.read_u32(desc);
			continue;
		}

		let frame = mem.read_bytes(u64::from(frag_addr), frag_len);
		mem.write_u32(desc + 4, frame_start | DN_DESC_COMPLETE);
		chip.latch(DOWN_COMPLETE);
		chip.down_list_ptr = mem.read_u32(desc);
		wire_transmit(chip, mem, frame);
	}
}

fn chip_command(chip: &mut Chip, mem: &mut MemPool, command: u16) {
	let opcode = command >> 11;
	let argument = command & 0x7FF;
	match opcode {
		0 => chip.total_reset(),
		1 => chip.window = (argument & 7) as u8,
		3 => chip.rx_on = false,
		4 => chip.rx_on = true,
		5 => {
			chip.rx_queue.clear();
			chip.rx_read_pos = 0;
		}
		6 => match argument {
			0 => chip.up_stalled = true,
			1 => {
				chip.up_stalled = false;
				process_upload(chip, mem);
			}
			2 => chip.down_stalled = true,
			3 => {
				chip.down_stalled = false;
				process_download(chip, mem);
			}
			_ => {}
		},
		8 => {
			chip.rx_queue.pop_front();
			chip.rx_read_pos = 0;
			chip.rx_error_next = None;
		}
		9 => chip.tx_on = true,
		10 => chip.tx_on = false,
		11 => {
			chip.tx_stage.clear();
			chip.tx_status_stack.clear();
		}
		13 => chip.latched &= !(argument & (LATCHABLE | INT_LATCH)),
		14 => chip.int_enable = argument,
		15 => chip.status_enable = argument,
		16 => chip.rx_filter = argument,
		17 | 18 | 19 => {}
		20 => {
			// Single-shot master engine.
			if chip.fail_busmaster_probe {
				chip.master_busy = true;
			} else {
				let len = usize::from(chip.master_len);
				let _moved = mem.read_bytes(u64::from(chip.master_addr), len);
				chip.master_busy = false;
				chip.latch(DMA_DONE);
			}
		}
		21 | 22 | 25 => {}
		_ => {}
	}
}

fn chip_write(chip: &mut Chip, mem: &mut MemPool, offset: u16, bytes: &[u8]) {
	if offset == CMD_STATUS {
		let command = u16::from_le_bytes([bytes[0], bytes.get(1).copied().unwrap_or(0)]);
		chip_command(chip, mem, command);
		return;
	}

	// Window-independent descriptor registers.
	if offset == 0x24 && bytes.len() == 4 {
		chip.down_list_ptr = u32::from_le_bytes(bytes.try_into().unwrap());
		if !chip.down_stalled {
			process_download(chip, mem);
		}
		return;
	}
	if offset == 0x38 && bytes.len() == 4 {
		chip.up_list_ptr = u32::from_le_bytes(bytes.try_into().unwrap());
		if chip.fail_busmaster_probe {
			chip.up_list_ptr = 0;
		}
		if !chip.up_stalled {
			process_upload(chip, mem);
		}
		return;
	}
	if offset >= 0x10 {
		return;
	}

	match (chip.window, offset) {
		(0, 0x0A) => {
			let word = u16::from_le_bytes([bytes[0], bytes[1]]);
			chip.eeprom_addr = (word & 0x3F) as u8;
		}
		(1, 0x00) => {
			chip.tx_stage.extend_from_slice(bytes);
			if chip.tx_stage.len() >= 4 {
				let len =
					usize::from(u16::from_le_bytes([chip.tx_stage[0], chip.tx_stage[1]]));
				if chip.tx_stage.len() >= 4 + len {
					let frame = chip.tx_stage[4..4 + len].to_vec();
					chip.tx_stage.clear();
					if chip.tx_on {
						wire_transmit(chip, mem, frame);
					}
				}
			}
		}
		(1, 0x0B) => {
			chip.tx_status_stack.pop_front();
		}
		(2, 0x00..=0x05) => chip.station[usize::from(offset)] = bytes[0],
		(4, 0x0A) => {
			chip.media_status =
				(u16::from_le_bytes([bytes[0], bytes[1]]) & !MEDIA_LINK_BEAT) | MEDIA_LINK_BEAT;
		}
		(7, 0x00) if bytes.len() == 4 => {
			chip.master_addr = u32::from_le_bytes(bytes.try_into().unwrap());
		}
		(7, 0x06) => chip.master_len = u16::from_le_bytes([bytes[0], bytes[1]]),
		_ => {}
	}
}

fn chip_read(chip: &mut Chip, offset: u16, width: usize) -> u32 {
	if offset == CMD_STATUS {
		return u32::from(chip.status_word());
	}
	if offset == 0x24 {
		return chip.down_list_ptr;
	}
	if offset == 0x38 {
		return chip.up_list_ptr;
	}
	if offset >= 0x10 {
		return 0;
	}

	match (chip.window, offset) {
		(0, 0x0A) => 0, // EEPROM never busy in the model
		(0, 0x0C) => u32::from(chip.eeprom[usize::from(chip.eeprom_addr) & 0xF]),
		(1, 0x00) => {
			// Receive FIFO.
			let Some(frame) = chip.rx_queue.front() else {
				return 0;
			};
			let mut value = 0u32;
			for i in 0..width {
				let byte = frame.get(chip.rx_read_pos + i).copied().unwrap_or(0);
				value |= u32::from(byte) << (8 * i);
			}
			chip.rx_read_pos += width;
			value
		}
		(1, 0x08) => {
			if !chip.rx_on || chip.rx_queue.is_empty() {
				return u32::from(RX_INCOMPLETE);
			}
			if let Some(code) = chip.rx_error_next {
				let len = chip.rx_queue.front().map_or(0, Vec::len) as u16;
				return u32::from(RX_ERROR | code | (len & 0x07FF));
			}
			let len = chip.rx_queue.front().map_or(0, Vec::len) as u16;
			u32::from(len & 0x07FF)
		}
		(1, 0x0B) => u32::from(chip.tx_status_stack.front().copied().unwrap_or(0)),
		(1, 0x0C) => (chip.kind.fifo_size() - chip.tx_stage.len()) as u32,
		(2, 0x00..=0x05) => u32::from(chip.station[usize::from(offset)]),
		(4, 0x0A) => u32::from(chip.media_status),
		(6, _) => 0,
		(7, 0x0C) => {
			if chip.master_busy {
				0x0800
			} else {
				0
			}
		}
		_ => 0,
	}
}

#[derive(Default)]
struct IdPortState {
	zeros: u8,
	seq: u16,
	responding: Option<usize>,
	eeprom_word: u16,
	bit_pos: i8,
}

#[derive(Clone, Copy)]
pub struct PciConf {
	pub bus: u8,
	pub device: u8,
	pub vendor: u16,
	pub device_id: u16,
	pub class_code: u32,
	pub header_type: u8,
	pub bar0: u32,
	pub secondary_bus: u8,
	pub irq: u8,
	pub command: u16,
}

struct Pic {
	imr_master: u8,
	imr_slave: u8,
	master_eois: usize,
	slave_eois: usize,
}

pub struct MachineState {
	mem: MemPool,
	ticks: u64,
	pub chips: Vec<Chip>,
	id_port: IdPortState,
	pic: Pic,
	vectors: [u32; 256],
	pub chained: Vec<u32>,
	pci_addr: u32,
	pci: Vec<PciConf>,
	pub paging: bool,
	/// Every port access in order, for promptness measurements.
	port_trace: Vec<(u16, bool)>,
}

pub struct TestMachine {
	state: Mutex<MachineState>,
	service: OnceLock<&'static FakeVds>,
}

impl TestMachine {
	pub fn new() -> &'static Self {
		let mut vectors = [0u32; 256];
		for (i, slot) in vectors.iter_mut().enumerate() {
			*slot = 0xDEAD_0000 | i as u32;
		}
		Box::leak(Box::new(Self {
			state: Mutex::new(MachineState {
				mem: MemPool::new(),
				ticks: 0,
				chips: Vec::new(),
				id_port: IdPortState::default(),
				pic: Pic {
					imr_master: 0xFF,
					imr_slave: 0xFF,
					master_eois: 0,
					slave_eois: 0,
				},
				vectors,
				chained: Vec::new(),
				pci_addr: 0,
				pci: Vec::new(),
				paging: false,
				port_trace: Vec::new(),
			}),
			service: OnceLock::new(),
		}))
	}

	/// Adds a virtual-DMA mapping service and marks physical addresses
	/// as virtualized.
	pub fn with_mapping_service(machine: &'static Self) -> &'static Self {
		machine.state.lock().unwrap().paging = true;
		let service = Box::leak(Box::new(FakeVds { machine }));
		machine.service.set(service).ok().unwrap();
		machine
	}

	fn lock(&self) -> MutexGuard<'_, MachineState> {
		self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
	}

	pub fn add_isa_pio(&self, io_base: u16, irq: u8, station: [u8; 6]) -> usize {
		let mut state = self.lock();
		let chip = Chip::new(ChipKind::IsaPio, io_base, irq, station, false);
		state.chips.push(chip);
		state.chips.len() - 1
	}

	pub fn add_isa_busmaster(&self, io_base: u16, irq: u8, station: [u8; 6]) -> usize {
		let mut state = self.lock();
		let chip = Chip::new(ChipKind::IsaBusmaster, io_base, irq, station, false);
		state.chips.push(chip);
		state.chips.len() - 1
	}

	/// A PCI function on bus 0; `device_id` selects the generation via
	/// the driver's board table.
	pub fn add_pci(&self, device_id: u16, io_base: u16, irq: u8, station: [u8; 6]) -> usize {
		let mut state = self.lock();
		let kind = match device_id {
			0x5900 | 0x5950 | 0x5951 | 0x5952 => ChipKind::Vortex,
			_ => ChipKind::Boomerang,
		};
		let chip = Chip::new(kind, io_base, irq, station, true);
		state.chips.push(chip);
		let device = state.pci.len() as u8;
		state.pci.push(PciConf {
			bus: 0,
			device,
			vendor: 0x10B7,
			device_id,
			class_code: 0x0200_0000,
			header_type: 0,
			bar0: u32::from(io_base) | 1,
			secondary_bus: 0,
			irq,
			command: 0,
		});
		state.chips.len() - 1
	}

	/// A CardBus bridge on bus 0 whose subordinate bus is `secondary`.
	pub fn add_cardbus_bridge(&self, secondary: u8) {
		let mut state = self.lock();
		let device = state.pci.len() as u8;
		state.pci.push(PciConf {
			bus: 0,
			device,
			vendor: 0x104C,
			device_id: 0xAC51,
			class_code: 0x0607_0000,
			header_type: 2,
			bar0: 0,
			secondary_bus: secondary,
			irq: 0,
			command: 0,
		});
	}

	/// A PCI function behind a bridge, on bus `bus`.
	pub fn add_pci_at(&self, bus: u8, device_id: u16, io_base: u16, irq: u8, station: [u8; 6]) -> usize {
		let mut state = self.lock();
		let chip = Chip::new(ChipKind::Boomerang, io_base, irq, station, true);
		state.chips.push(chip);
		let device = state.pci.iter().filter(|c| c.bus == bus).count() as u8;
		state.pci.push(PciConf {
			bus,
			device,
			vendor: 0x10B7,
			device_id,
			class_code: 0x0200_0000,
			header_type: 0,
			bar0: u32::from(io_base) | 1,
			secondary_bus: 0,
			irq,
			command: 0,
		});
		state.chips.len() - 1
	}

	pub fn chip<R>(&self, index: usize, f: impl FnOnce(&mut Chip) -> R) -> R {
		f(&mut self.lock().chips[index])
	}

	/// Marks physical addresses as virtualized without offering a
	/// mapping service.
	pub fn set_paging(&self) {
		self.lock().paging = true;
	}

	/// Caps how many further DMA allocations succeed; `None` lifts the
	/// cap again.
	pub fn set_dma_alloc_budget(&self, budget: Option<usize>) {
		self.lock().mem.alloc_budget = budget;
	}

	/// Releases a parked download engine and lets it run.
	pub fn release_downloads(&self, index: usize) {
		let mut state = self.lock();
		let MachineState { mem, chips, .. } = &mut *state;
		chips[index].hold_downloads = false;
		process_download(&mut chips[index], mem);
	}

	/// Frame arriving from the wire at chip `index`.
	pub fn inject_frame(&self, index: usize, frame: &[u8]) {
		let mut state = self.lock();
		let MachineState { mem, chips, .. } = &mut *state;
		let chip = &mut chips[index];
		if chip.accepts(&frame[..6]) {
			deliver_frame(chip, mem, frame.to_vec());
		}
	}

	/// Delivers pending interrupts the way the PIC would: for each
	/// asserting chip whose line is unmasked and whose vector still
	/// holds the driver's thunk, run the front half.
	pub fn pump(&self) {
		for _ in 0..64 {
			let mut fired = false;
			let lines: Vec<u8> = {
				let state = self.lock();
				state
					.chips
					.iter()
					.filter(|chip| chip.asserting_irq())
					.filter(|chip| {
						let line = chip.irq;
						let masked = if line < 8 {
							state.pic.imr_master & (1 << line) != 0
						} else {
							state.pic.imr_slave & (1 << (line - 8)) != 0
						};
						!masked
					})
					.filter(|chip| {
						let vec_index = if chip.irq < 8 {
							0x08 + chip.irq
						} else {
							0x70 + chip.irq - 8
						};
						state.vectors[usize::from(vec_index)] == 0xA900_0000 | u32::from(chip.irq)
					})
					.map(|chip| chip.irq)
					.collect()
			};
			let mut seen = Vec::new();
			for line in lines {
				if !seen.contains(&line) {
					seen.push(line);
					el3pkt::irq::front_half(line);
					fired = true;
				}
			}
			if !fired {
				return;
			}
		}
		panic!("interrupt storm: chips never stopped asserting");
	}

	pub fn outstanding_dma(&self) -> usize {
		self.lock().mem.outstanding
	}

	pub fn eoi_counts(&self) -> (usize, usize) {
		let state = self.lock();
		(state.pic.master_eois, state.pic.slave_eois)
	}

	pub fn chained(&self) -> Vec<u32> {
		self.lock().chained.clone()
	}

	pub fn vector_value(&self, index: u8) -> u32 {
		self.lock().vectors[usize::from(index)]
	}

	pub fn alloc_crossing_64k(&self, size: usize) -> DmaRegion {
		self.lock().mem.alloc_crossing_64k(size)
	}

	pub fn free_region(&self, region: DmaRegion) {
		self.lock().mem.free(region);
	}

	/// Clears the recorded port-access trace.
	pub fn clear_port_trace(&self) {
		self.lock().port_trace.clear();
	}

	/// Port accesses since the last clear, `(port, is_write)` in order.
	pub fn port_trace(&self) -> Vec<(u16, bool)> {
		self.lock().port_trace.clone()
	}

	fn port_write(&self, port: u16, bytes: &[u8]) {
		let mut state = self.lock();
		state.port_trace.push((port, true));
		let MachineState {
			mem,
			chips,
			id_port,
			pic,
			pci,
			pci_addr,
			..
		} = &mut *state;

		match port {
			PIC1_CMD => {
				if bytes[0] == PIC_EOI {
					pic.master_eois += 1;
				}
			}
			PIC2_CMD => {
				if bytes[0] == PIC_EOI {
					pic.slave_eois += 1;
				}
			}
			PIC1_DATA => pic.imr_master = bytes[0],
			PIC2_DATA => pic.imr_slave = bytes[0],
			PCI_ADDR if bytes.len() == 4 => {
				*pci_addr = u32::from_le_bytes(bytes.try_into().unwrap());
			}
			PCI_DATA if bytes.len() == 4 => {
				let value = u32::from_le_bytes(bytes.try_into().unwrap());
				let (bus, device, offset) = decode_cf8(*pci_addr);
				if let Some(conf) = pci
					.iter_mut()
					.find(|c| c.bus == bus && c.device == device)
				{
					if offset == 0x04 {
						conf.command = value as u16;
					}
				}
			}
			ID_PORT => id_port_write(chips, id_port, bytes[0]),
			_ => {
				if let Some(chip) = chips
					.iter_mut()
					.find(|c| c.active && port >= c.io_base && port < c.io_base + 0x40)
				{
					chip_write(chip, mem, port - chip.io_base, bytes);
				}
			}
		}
	}

	fn port_read(&self, port: u16, width: usize) -> u32 {
		let mut state = self.lock();
		state.port_trace.push((port, false));
		let MachineState {
			chips,
			id_port,
			pic,
			pci,
			pci_addr,
			..
		} = &mut *state;

		match port {
			PIC1_DATA => u32::from(pic.imr_master),
			PIC2_DATA => u32::from(pic.imr_slave),
			PCI_ADDR => *pci_addr,
			PCI_DATA => {
				let (bus, device, offset) = decode_cf8(*pci_addr);
				pci_config_read(pci, bus, device, offset)
			}
			ID_PORT => u32::from(id_port_read(chips, id_port)),
			_ => {
				if let Some(chip) = chips
					.iter_mut()
					.find(|c| c.active && port >= c.io_base && port < c.io_base + 0x40)
				{
					chip_read(chip, port - chip.io_base, width)
				} else {
					0xFFFF_FFFF >> (32 - 8 * width as u32)
				}
			}
		}
	}
}

fn decode_cf8(addr: u32) -> (u8, u8, u16) {
	let bus = ((addr >> 16) & 0xFF) as u8;
	let device = ((addr >> 11) & 0x1F) as u8;
	let offset = (addr & 0xFC) as u16;
	(bus, device, offset)
}

fn pci_config_read(pci: &[PciConf], bus: u8, device: u8, offset: u16) -> u32 {
	let Some(conf) = pci.iter().find(|c| c.bus == bus && c.device == device) else {
		return 0xFFFF_FFFF;
	};
	match offset {
		0x00 => u32::from(conf.vendor) | (u32::from(conf.device_id) << 16),
		0x04 => u32::from(conf.command) | 0x0010_0000,
		0x08 => conf.class_code,
		0x0C => u32::from(conf.header_type) << 16,
		0x10 => conf.bar0,
		0x14 => 0,
		0x18 => u32::from(conf.secondary_bus) << 8,
		0x3C => u32::from(conf.irq) | (1 << 8),
		_ => 0,
	}
}

fn id_port_write(chips: &mut [Chip], state: &mut IdPortState, value: u8) {
	// While the contention window is open, every byte is a sequence
	// byte, whatever its value; commands are only decoded between
	// windows.
	if state.zeros >= 2 && state.responding.is_none() {
		state.seq += 1;
		if state.seq >= 255 {
			state.responding = chips
				.iter()
				.position(|chip| !chip.tagged && !chip.active && chip.kind.has_id_port());
			state.zeros = 0;
			state.seq = 0;
		}
		return;
	}

	match value {
		0xC0 => {
			// Global reset returns every ISA adapter to the ID_WAIT
			// state, active ones included.
			*state = IdPortState::default();
			for chip in chips.iter_mut().filter(|c| c.kind.has_id_port()) {
				chip.tagged = false;
				chip.active = false;
			}
		}
		0x00 => {
			if state.responding.is_none() {
				state.zeros = state.zeros.saturating_add(1);
			}
		}
		0x80..=0x9F => {
			if let Some(index) = state.responding {
				state.eeprom_word = chips[index].eeprom[usize::from(value & 0x0F)];
				state.bit_pos = 15;
			}
		}
		0xD1..=0xDF => {
			if let Some(index) = state.responding {
				chips[index].tagged = true;
			}
		}
		0xE0..=0xFF => {
			if let Some(index) = state.responding.take() {
				chips[index].io_base = 0x200 + (u16::from(value & 0x1F) << 4);
				chips[index].active = true;
			}
			state.zeros = 0;
			state.seq = 0;
		}
		_ => {}
	}
}

fn id_port_read(_chips: &mut [Chip], state: &mut IdPortState) -> u8 {
	if state.responding.is_none() || state.bit_pos < 0 {
		return 0;
	}
	let bit = (state.eeprom_word >> state.bit_pos) & 1;
	state.bit_pos -= 1;
	bit as u8
}

impl ChipKind {
	fn has_id_port(self) -> bool {
		matches!(self, Self::IsaPio | Self::IsaBusmaster)
	}
}

impl Bus for TestMachine {
	fn inb(&self, port: u16) -> u8 {
		self.port_read(port, 1) as u8
	}

	fn inw(&self, port: u16) -> u16 {
		self.port_read(port, 2) as u16
	}

	fn inl(&self, port: u16) -> u32 {
		self.port_read(port, 4)
	}

	fn outb(&self, port: u16, value: u8) {
		self.port_write(port, &[value]);
	}

	fn outw(&self, port: u16, value: u16) {
		self.port_write(port, &value.to_le_bytes());
	}

	fn outl(&self, port: u16, value: u32) {
		self.port_write(port, &value.to_le_bytes());
	}

	fn ticks(&self) -> u64 {
		let mut state = self.lock();
		state.ticks += 500;
		state.ticks
	}

	fn dma_alloc(&self, layout: DmaLayout) -> Option<DmaRegion> {
		self.lock().mem.alloc(layout)
	}

	fn dma_free(&self, region: DmaRegion) {
		self.lock().mem.free(region);
	}

	fn virt_to_phys(&self, virt: VirtAddr) -> Option<PhysAddr> {
		self.lock().mem.virt_to_phys(virt)
	}

	fn vector(&self, index: u8) -> VectorSlot {
		VectorSlot(self.lock().vectors[usize::from(index)])
	}

	fn set_vector(&self, index: u8, slot: VectorSlot) {
		self.lock().vectors[usize::from(index)] = slot.0;
	}

	fn api_entry(&self) -> VectorSlot {
		VectorSlot(0xA915_0000)
	}

	fn irq_entry(&self, line: u8) -> VectorSlot {
		VectorSlot(0xA900_0000 | u32::from(line))
	}

	fn chain(&self, slot: VectorSlot) {
		self.lock().chained.push(slot.0);
	}

	fn paging_active(&self) -> bool {
		self.lock().paging
	}

	fn mapping_service(&self) -> Option<&dyn MappingService> {
		self.service.get().map(|s| *s as &dyn MappingService)
	}
}

/// Minimal virtual-DMA service: identity windows over the arena, with
/// the service owning cache coherency.
pub struct FakeVds {
	machine: &'static TestMachine,
}

impl MappingService for FakeVds {
	fn lock_region(
		&self,
		virt: VirtAddr,
		_len: usize,
		_dir: el3pkt::bus::Direction,
	) -> Option<el3pkt::bus::DmaWindow> {
		let phys = self.machine.lock().mem.virt_to_phys(virt)?;
		Some(el3pkt::bus::DmaWindow {
			phys,
			flags: MapFlags::NO_FLUSH | MapFlags::NO_INVALIDATE,
		})
	}

	fn unlock_region(&self, _virt: VirtAddr, _len: usize, _window: el3pkt::bus::DmaWindow) {}

	fn alloc(&self, layout: DmaLayout) -> Option<(DmaRegion, MapFlags)> {
		let region = self.machine.lock().mem.alloc(layout)?;
		Some((region, MapFlags::NO_FLUSH | MapFlags::NO_INVALIDATE))
	}

	fn free(&self, region: DmaRegion) {
		self.machine.lock().mem.free(region);
	}
}

/// A test consumer: collects every delivered frame.
pub struct CollectingReceiver {
	pub frames: Mutex<Vec<Vec<u8>>>,
	staging: Mutex<Vec<(usize, Vec<u8>)>>,
}

impl CollectingReceiver {
	pub fn leaked() -> &'static Self {
		Box::leak(Box::new(Self {
			frames: Mutex::new(Vec::new()),
			staging: Mutex::new(Vec::new()),
		}))
	}

	pub fn count(&self) -> usize {
		self.frames.lock().unwrap().len()
	}

	pub fn frame(&self, index: usize) -> Vec<u8> {
		self.frames.lock().unwrap()[index].clone()
	}
}

impl Receiver for CollectingReceiver {
	fn request_buffer(&self, _handle: Handle, len: usize) -> Option<NonNull<u8>> {
		let mut buf = vec![0u8; len];
		let ptr = NonNull::new(buf.as_mut_ptr()).unwrap();
		self.staging.lock().unwrap().push((len, buf));
		Some(ptr)
	}

	fn frame_delivered(&self, _handle: Handle, _buf: NonNull<u8>, len: usize) {
		let (expected, buf) = self.staging.lock().unwrap().pop().unwrap();
		assert_eq!(expected, len);
		self.frames.lock().unwrap().push(buf);
	}
}

/// Builds a valid Ethernet frame with the given addresses and type.
pub fn build_frame(dest: [u8; 6], src: [u8; 6], ethertype: u16, payload: &[u8]) -> Vec<u8> {
	let mut frame = Vec::with_capacity(14 + payload.len());
	frame.extend_from_slice(&dest);
	frame.extend_from_slice(&src);
	frame.extend_from_slice(&ethertype.to_be_bytes());
	frame.extend_from_slice(payload);
	frame
}
