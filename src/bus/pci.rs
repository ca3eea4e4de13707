//! PCI configuration access and EtherLink enumeration.
//!
//! Enumeration prefers the platform's PCI BIOS service when the bus
//! exposes one and falls back to direct configuration mechanism #1
//! through the `0xCF8`/`0xCFC` port pair. CardBus bridges (class 0x0607)
//! are walked so cards behind them are picked up in bus order.

use alloc::vec::Vec;
use core::fmt;

use pci_types::{
	Bar, CommandRegister, ConfigRegionAccess, EndpointHeader, HeaderType, InterruptLine,
	PciAddress, PciHeader,
};

use crate::bus::Bus;

pub const PCI_CONFIG_ADDRESS_PORT: u16 = 0xCF8;
pub const PCI_CONFIG_DATA_PORT: u16 = 0xCFC;
const PCI_CONFIG_ADDRESS_ENABLE: u32 = 1 << 31;

const PCI_MAX_BUS: u8 = 8;
const PCI_MAX_DEVICE: u8 = 32;

/// 3Com's PCI vendor identifier.
pub const VENDOR_3COM: u16 = 0x10B7;

const CLASS_BRIDGE: u8 = 0x06;
const SUBCLASS_CARDBUS: u8 = 0x07;

/// Configuration mechanism #1 over the port seam.
#[derive(Clone, Copy)]
pub struct PciConfigRegion<'b> {
	bus: &'b dyn Bus,
}

impl<'b> PciConfigRegion<'b> {
	pub fn new(bus: &'b dyn Bus) -> Self {
		Self { bus }
	}

	fn address(addr: PciAddress, offset: u16) -> u32 {
		PCI_CONFIG_ADDRESS_ENABLE
			| (u32::from(addr.bus()) << 16)
			| (u32::from(addr.device()) << 11)
			| (u32::from(addr.function()) << 8)
			| u32::from(offset & 0xFC)
	}
}

impl ConfigRegionAccess for PciConfigRegion<'_> {
	unsafe fn read(&self, addr: PciAddress, offset: u16) -> u32 {
		self.bus
			.outl(PCI_CONFIG_ADDRESS_PORT, Self::address(addr, offset));
		self.bus.inl(PCI_CONFIG_DATA_PORT)
	}

	unsafe fn write(&self, addr: PciAddress, offset: u16, value: u32) {
		self.bus
			.outl(PCI_CONFIG_ADDRESS_PORT, Self::address(addr, offset));
		self.bus.outl(PCI_CONFIG_DATA_PORT, value);
	}
}

/// Platform PCI enumeration service (the INT 1Ah BIOS interface, seen
/// through the stub). Preferred over direct configuration access when
/// present.
pub trait PciBios: Sync {
	/// The `index`-th device matching `(vendor, device)`, in bus order.
	fn find_device(&self, vendor: u16, device: u16, index: u16) -> Option<(u8, u8, u8)>;
}

/// One accepted PCI function, with everything the attach path needs read
/// out of configuration space.
#[derive(Clone, Copy)]
pub struct PciNic {
	pub address: PciAddress,
	pub device_id: u16,
	pub io_base: u16,
	pub mem_base: Option<u64>,
	pub irq: InterruptLine,
	pub behind_cardbus: bool,
}

impl fmt::Display for PciNic {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"{:04x}:{:04x} at {} io {:#x} irq {}",
			VENDOR_3COM, self.device_id, self.address, self.io_base, self.irq
		)
	}
}

fn read_function(
	access: &PciConfigRegion<'_>,
	address: PciAddress,
	behind_cardbus: bool,
) -> Option<PciNic> {
	let header = PciHeader::new(address);
	let (vendor_id, device_id) = header.id(access);
	if vendor_id != VENDOR_3COM {
		return None;
	}

	let endpoint = EndpointHeader::from_header(header, access)?;

	let io_base = match endpoint.bar(0, access) {
		Some(Bar::Io { port }) => u16::try_from(port & !0x3).ok()?,
		_ => return None,
	};
	// BAR1 is the optional memory window; a raw read suffices, the
	// driver never sizes it.
	let bar1 = unsafe { access.read(address, 0x14) };
	let mem_base = (bar1 != 0 && bar1 & 0x1 == 0).then(|| u64::from(bar1 & 0xFFFF_FFF0));
	let (_pin, irq) = endpoint.interrupt(access);

	Some(PciNic {
		address,
		device_id,
		io_base,
		mem_base,
		irq,
		behind_cardbus,
	})
}

fn scan_bus(
	access: &PciConfigRegion<'_>,
	bus_no: u8,
	behind_cardbus: bool,
	found: &mut Vec<PciNic>,
	cardbus_buses: &mut Vec<u8>,
) {
	for device in 0..PCI_MAX_DEVICE {
		let address = PciAddress::new(0, bus_no, device, 0);
		let header = PciHeader::new(address);
		let (vendor_id, _device_id) = header.id(access);
		if vendor_id == 0xFFFF {
			continue;
		}

		let (_revision, class, subclass, _interface) = header.revision_and_class(access);
		if class == CLASS_BRIDGE && subclass == SUBCLASS_CARDBUS {
			// CardBus bus number lives at offset 0x19 of the type-2 header.
			let secondary = unsafe { (access.read(address, 0x18) >> 8) & 0xFF } as u8;
			if secondary != 0 {
				cardbus_buses.push(secondary);
			}
			continue;
		}

		if header.header_type(access) != HeaderType::Endpoint {
			continue;
		}

		if let Some(nic) = read_function(access, address, behind_cardbus) {
			debug!("PCI probe accepted {nic}");
			found.push(nic);
		}
	}
}

/// All 3Com functions in the system, in bus order. `table` restricts the
/// BIOS-service path to known device identifiers; the direct walk matches
/// on the vendor alone and lets the caller reject unknown products.
pub fn enumerate(bus: &dyn Bus, table: &[u16]) -> Vec<PciNic> {
	let access = PciConfigRegion::new(bus);
	let mut found = Vec::new();

	if let Some(bios) = bus.pci_bios() {
		for &device_id in table {
			for index in 0u16.. {
				let Some((bus_no, device, function)) =
					bios.find_device(VENDOR_3COM, device_id, index)
				else {
					break;
				};
				let address = PciAddress::new(0, bus_no, device, function);
				if let Some(nic) = read_function(&access, address, false) {
					debug!("PCI BIOS reported {nic}");
					found.push(nic);
				}
			}
		}
		if !found.is_empty() {
			return found;
		}
		debug!("PCI BIOS service reported nothing, falling back to direct access");
	}

	let mut cardbus_buses = Vec::new();
	for bus_no in 0..PCI_MAX_BUS {
		scan_bus(&access, bus_no, false, &mut found, &mut cardbus_buses);
	}
	for bus_no in cardbus_buses.clone() {
		if bus_no >= PCI_MAX_BUS {
			scan_bus(&access, bus_no, true, &mut found, &mut Vec::new());
		}
	}

	found
}

/// Sets the bus-master enable bit for `nic`; descriptor-based back-ends
/// cannot move data without it.
pub fn enable_busmaster(bus: &dyn Bus, nic: &PciNic) {
	let access = PciConfigRegion::new(bus);
	let mut header = PciHeader::new(nic.address);
	header.update_command(&access, |command| {
		command | CommandRegister::BUS_MASTER_ENABLE | CommandRegister::IO_ENABLE
	});
}
