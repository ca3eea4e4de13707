//! ISA EtherLink detection through the ID-port contention protocol.
//!
//! The ISA parts power up inactive and listen on a shared ID port for a
//! 255-byte pseudo-random sequence. After the sequence, every untagged
//! adapter answers EEPROM reads bit-serially on the same port; the probe
//! validates the manufacturer token, tags the adapter, and activates it
//! at its I/O base. One pass finds one adapter, so the probe loops until
//! a pass fails the manufacturer check.

use alloc::vec::Vec;

use crate::bus::{delay, Bus};
use crate::config::EEPROM_TIMEOUT_TICKS;

/// ID-port candidates; the first one that answers wins.
const ID_PORTS: [u16; 4] = [0x110, 0x120, 0x130, 0x140];

/// EEPROM word 7 of every EtherLink III.
pub const MANUFACTURER_ID: u16 = 0x6D50;

const ID_GLOBAL_RESET: u8 = 0xC0;
const ID_SET_TAG: u8 = 0xD0;
const ID_ACTIVATE: u8 = 0xE0;
const ID_EEPROM_READ: u8 = 0x80;

const EE_STATION_ADDR: [u8; 3] = [0, 1, 2];
const EE_PRODUCT_ID: u8 = 3;
const EE_MANUFACTURER: u8 = 7;
const EE_ADDR_CONFIG: u8 = 8;
const EE_RESOURCE_CONFIG: u8 = 9;

/// One activated ISA adapter.
#[derive(Debug, Clone, Copy)]
pub struct IsaNic {
	pub io_base: u16,
	pub irq: u8,
	pub product_id: u16,
	pub station: [u8; 6],
}

fn send_id_sequence(bus: &dyn Bus, id_port: u16) {
	bus.outb(id_port, 0x00);
	bus.outb(id_port, 0x00);

	let mut ox: u8 = 0xFF;
	for _ in 0..255 {
		bus.outb(id_port, ox);
		ox = if ox & 0x80 != 0 {
			(ox << 1) ^ 0xCF
		} else {
			ox << 1
		};
	}
}

/// Bit-serial EEPROM read through the ID port; one bit per `inb`, most
/// significant first.
fn id_read_eeprom(bus: &dyn Bus, id_port: u16, word: u8) -> u16 {
	bus.outb(id_port, ID_EEPROM_READ | word);

	// The parts need 162 us before the first bit is valid.
	delay(bus, EEPROM_TIMEOUT_TICKS);

	let mut value = 0u16;
	for _ in 0..16 {
		value = (value << 1) | u16::from(bus.inb(id_port) & 0x01);
	}
	value
}

/// Probes and activates every ISA EtherLink. `requested_bases`
/// positionally overrides the EEPROM-configured I/O base.
pub fn probe(bus: &dyn Bus, requested_bases: &[u16]) -> Vec<IsaNic> {
	let mut found = Vec::new();

	for id_port in ID_PORTS {
		bus.outb(id_port, ID_GLOBAL_RESET);
		send_id_sequence(bus, id_port);
		if id_read_eeprom(bus, id_port, EE_MANUFACTURER) != MANUFACTURER_ID {
			continue;
		}
		// Adapters answer here; untag everything and enumerate them.
		bus.outb(id_port, ID_GLOBAL_RESET);

		for tag in 0..u8::try_from(crate::config::MAX_DEVICES).unwrap() {
			send_id_sequence(bus, id_port);

			if id_read_eeprom(bus, id_port, EE_MANUFACTURER) != MANUFACTURER_ID {
				break;
			}

			let product_id = id_read_eeprom(bus, id_port, EE_PRODUCT_ID);
			let mut station = [0u8; 6];
			for (i, word) in EE_STATION_ADDR.iter().enumerate() {
				let w = id_read_eeprom(bus, id_port, *word);
				station[2 * i] = (w >> 8) as u8;
				station[2 * i + 1] = (w & 0xFF) as u8;
			}

			let addr_config = id_read_eeprom(bus, id_port, EE_ADDR_CONFIG);
			let resource_config = id_read_eeprom(bus, id_port, EE_RESOURCE_CONFIG);
			let eeprom_base = 0x200 + ((addr_config & 0x1F) << 4);
			let irq = (resource_config >> 12) as u8;

			let io_base = requested_bases
				.get(found.len())
				.copied()
				.unwrap_or(eeprom_base);

			bus.outb(id_port, ID_SET_TAG | (tag + 1));
			bus.outb(id_port, ID_ACTIVATE | u8::try_from(io_base >> 4).unwrap_or(0));

			debug!(
				"ISA probe found product {product_id:#06x} at io {io_base:#x} irq {irq}"
			);
			found.push(IsaNic {
				io_base,
				irq,
				product_id,
				station,
			});
		}

		break;
	}

	found
}
