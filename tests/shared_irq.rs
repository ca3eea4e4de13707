//! Shared-interrupt etiquette and multi-device demultiplexing.

mod common;

use common::*;
use el3pkt::irq::front_half;
use el3pkt::{entry, install, Request, Response};

const STATION_A: [u8; 6] = [0x00, 0x60, 0x8C, 0x00, 0x00, 0x01];
const STATION_B: [u8; 6] = [0x00, 0x60, 0x8C, 0x00, 0x00, 0x02];

fn access(interface: u16) -> &'static CollectingReceiver {
	let receiver = CollectingReceiver::leaked();
	match entry(Request::AccessType {
		if_class: 1,
		if_type: 0xFFFF,
		interface,
		frame_type: Some(0x0800),
		receiver,
	}) {
		Ok(Response::Handle(_)) => receiver,
		other => panic!("access_type failed: {other:?}"),
	}
}

#[test]
fn foreign_interrupt_is_chained_without_eoi() {
	let _serial = serial();
	let machine = TestMachine::new();
	machine.add_isa_pio(0x300, 10, STATION_A);
	install(machine, "io=0x300 irq=10").unwrap();
	let _installed = Installed;

	let receiver = access(0);
	let eois_before = machine.eoi_counts();

	// The line fires, but only the co-hooked non-3Com device asserted:
	// our chip's interrupt latch is clear.
	front_half(10);

	let chained = machine.chained();
	assert_eq!(chained.len(), 1, "forwarded to the previous handler");
	assert_eq!(chained[0], 0xDEAD_0000 | 0x72, "IRQ 10 vector's old occupant");
	assert_eq!(machine.eoi_counts(), eois_before, "no EOI from our handler");
	assert_eq!(receiver.count(), 0, "no back-half work was scheduled");
}

#[test]
fn our_interrupt_gets_eoi_and_no_chain() {
	let _serial = serial();
	let machine = TestMachine::new();
	machine.add_isa_pio(0x300, 10, STATION_A);
	install(machine, "io=0x300 irq=10").unwrap();
	let _installed = Installed;

	let receiver = access(0);
	machine.inject_frame(0, &build_frame(STATION_A, [2; 6], 0x0800, &[9; 46]));
	machine.pump();

	assert_eq!(receiver.count(), 1);
	let (master, slave) = machine.eoi_counts();
	assert!(master >= 1);
	assert_eq!(slave, 1, "IRQ 10 lives on the slave controller");
	assert!(machine.chained().is_empty());
}

#[test]
fn devices_sharing_a_line_are_each_classified() {
	let _serial = serial();
	let machine = TestMachine::new();
	machine.add_pci(0x9055, 0x6000, 11, STATION_A);
	machine.add_pci(0x9200, 0x6400, 11, STATION_B);
	install(machine, "").unwrap();
	let _installed = Installed;

	let rx_a = access(0);
	let rx_b = access(1);

	let frame_a = build_frame(STATION_A, [2; 6], 0x0800, &[0xAA; 46]);
	let frame_b = build_frame(STATION_B, [2; 6], 0x0800, &[0xBB; 46]);
	machine.inject_frame(0, &frame_a);
	machine.inject_frame(1, &frame_b);
	machine.pump();

	assert_eq!(rx_a.count(), 1);
	assert_eq!(rx_a.frame(0), frame_a);
	assert_eq!(rx_b.count(), 1);
	assert_eq!(rx_b.frame(0), frame_b);
}

/// Port accesses from interrupt entry to the EOI command; everything
/// after the EOI belongs to the deferred half.
fn ops_before_eoi(trace: &[(u16, bool)]) -> usize {
	trace
		.iter()
		.position(|&(port, write)| write && (port == 0x20 || port == 0xA0))
		.expect("no EOI in trace")
}

#[test]
fn front_half_is_prompt_regardless_of_pending_work() {
	let _serial = serial();
	let machine = TestMachine::new();
	let chip = machine.add_pci(0x9200, 0x6000, 11, STATION_A);
	install(machine, "").unwrap();
	let _installed = Installed;

	let _receiver = access(0);
	machine.chip(chip, |c| c.loopback = false);

	// One pending frame.
	machine.inject_frame(0, &build_frame(STATION_A, [2; 6], 0x0800, &[1; 46]));
	machine.clear_port_trace();
	machine.pump();
	let light = ops_before_eoi(&machine.port_trace());

	// An order of magnitude more pending work.
	for seq in 0..16u8 {
		machine.inject_frame(0, &build_frame(STATION_A, [2; 6], 0x0800, &[seq; 200]));
	}
	machine.clear_port_trace();
	machine.pump();
	let heavy = ops_before_eoi(&machine.port_trace());

	assert_eq!(
		light, heavy,
		"acknowledge-and-classify cost must not depend on ring contents"
	);
}

#[test]
fn cardbus_cards_behind_a_bridge_are_found() {
	let _serial = serial();
	let machine = TestMachine::new();
	machine.add_cardbus_bridge(9);
	let _chip = machine.add_pci_at(9, 0x5257, 0x6000, 11, STATION_A);
	install(machine, "").unwrap();
	let _installed = Installed;

	let info = match entry(Request::DriverInfo { interface: 0 }) {
		Ok(Response::Info(info)) => info,
		other => panic!("driver_info failed: {other:?}"),
	};
	assert_eq!(info.name, "3CCFE575CT");

	let receiver = access(0);
	machine.inject_frame(0, &build_frame(STATION_A, [2; 6], 0x0800, &[5; 46]));
	machine.pump();
	assert_eq!(receiver.count(), 1);
}
