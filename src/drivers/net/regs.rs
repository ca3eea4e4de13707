//! The EtherLink III register model.
//!
//! Every generation exposes sixteen I/O addresses, most of them banked:
//! a window selector in the command register chooses which 16-byte bank
//! is visible. The command/status word at offset 0x0E is reachable from
//! every window. Vortex and later additionally decode a handful of
//! window-independent registers above 0x10 for the descriptor engines.

#![allow(dead_code)]

/// Write: command register. Read: interrupt/status register.
/// Reachable from every window.
pub const CMD_STATUS: u16 = 0x0E;

// Commands are `opcode << 11 | argument`.

pub const fn cmd(opcode: u16, argument: u16) -> u16 {
	(opcode << 11) | argument
}

pub const CMD_TOTAL_RESET: u16 = cmd(0, 0);
pub const fn cmd_select_window(window: u8) -> u16 {
	cmd(1, window as u16)
}
pub const CMD_RX_DISABLE: u16 = cmd(3, 0);
pub const CMD_RX_ENABLE: u16 = cmd(4, 0);
pub const CMD_RX_RESET: u16 = cmd(5, 0);
pub const CMD_UP_STALL: u16 = cmd(6, 0);
pub const CMD_UP_UNSTALL: u16 = cmd(6, 1);
pub const CMD_DOWN_STALL: u16 = cmd(6, 2);
pub const CMD_DOWN_UNSTALL: u16 = cmd(6, 3);
pub const CMD_RX_DISCARD: u16 = cmd(8, 0);
pub const CMD_TX_ENABLE: u16 = cmd(9, 0);
pub const CMD_TX_DISABLE: u16 = cmd(10, 0);
pub const CMD_TX_RESET: u16 = cmd(11, 0);
pub const CMD_REQ_INTR: u16 = cmd(12, 0);
/// Acknowledge the interrupt sources given in the low bits.
pub const fn cmd_ack_intr(sources: u16) -> u16 {
	cmd(13, sources)
}
/// Select which sources may assert the interrupt pin.
pub const fn cmd_set_intr_enb(mask: u16) -> u16 {
	cmd(14, mask)
}
/// Select which sources appear in the status register at all.
pub const fn cmd_set_status_enb(mask: u16) -> u16 {
	cmd(15, mask)
}
pub const fn cmd_set_rx_filter(filter: u16) -> u16 {
	cmd(16, filter)
}
pub const fn cmd_set_tx_avail_thresh(thresh: u16) -> u16 {
	cmd(18, thresh)
}
/// Bytes that must be in the FIFO before transmission starts; raised
/// after underruns.
pub const fn cmd_set_tx_start_thresh(thresh: u16) -> u16 {
	cmd(19, thresh)
}
pub const CMD_START_DMA_UP: u16 = cmd(20, 0);
pub const CMD_START_DMA_DOWN: u16 = cmd(20, 1);
pub const CMD_STATS_ENABLE: u16 = cmd(21, 0);
pub const CMD_STATS_DISABLE: u16 = cmd(22, 0);

bitflags::bitflags! {
	/// Interrupt/status word, and therefore also the event set the front
	/// half hands to the back half.
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
	pub struct IntStatus: u16 {
		const INT_LATCH = 0x0001;
		const ADAPTER_FAILURE = 0x0002;
		const TX_COMPLETE = 0x0004;
		const TX_AVAILABLE = 0x0008;
		const RX_COMPLETE = 0x0010;
		const RX_EARLY = 0x0020;
		/// Media/link status changed; latched by the auto-negotiating
		/// parts.
		const LINK_EVENT = 0x0040;
		const STATS_FULL = 0x0080;
		/// Single-shot master transfer finished (ISA bus master).
		const DMA_DONE = 0x0100;
		/// Download (transmit) list advanced.
		const DOWN_COMPLETE = 0x0200;
		/// Upload (receive) list advanced.
		const UP_COMPLETE = 0x0400;
		const DMA_IN_PROGRESS = 0x0800;
		const CMD_IN_PROGRESS = 0x1000;
	}
}

impl IntStatus {
	/// Sources the driver arms on every generation.
	pub const ARMED: Self = Self::ADAPTER_FAILURE
		.union(Self::TX_COMPLETE)
		.union(Self::RX_COMPLETE)
		.union(Self::LINK_EVENT)
		.union(Self::STATS_FULL)
		.union(Self::DMA_DONE)
		.union(Self::DOWN_COMPLETE)
		.union(Self::UP_COMPLETE);

	/// Only simple data-movement work; the front half's fast path.
	pub const FAST_PATH: Self = Self::TX_COMPLETE
		.union(Self::TX_AVAILABLE)
		.union(Self::RX_COMPLETE)
		.union(Self::DOWN_COMPLETE)
		.union(Self::UP_COMPLETE);
}

// Receive filter bits, `cmd_set_rx_filter`.
pub const FILTER_STATION: u16 = 1;
pub const FILTER_MULTICAST: u16 = 2;
pub const FILTER_BROADCAST: u16 = 4;
pub const FILTER_PROMISCUOUS: u16 = 8;

// Window 0: configuration and EEPROM.
pub const W0_EEPROM_CMD: u16 = 0x0A;
pub const W0_EEPROM_DATA: u16 = 0x0C;
pub const EEPROM_READ: u16 = 0x80;
pub const EEPROM_BUSY: u16 = 0x8000;

// EEPROM word layout (all generations store the station address first).
pub const EE_STATION0: u8 = 0;
pub const EE_STATION1: u8 = 1;
pub const EE_STATION2: u8 = 2;
pub const EE_PRODUCT_ID: u8 = 3;
pub const EE_MANUFACTURER: u8 = 7;

// Window 1: operating set of the PIO generations.
pub const W1_TX_FIFO: u16 = 0x00;
pub const W1_RX_FIFO: u16 = 0x00;
pub const W1_RX_STATUS: u16 = 0x08;
pub const W1_TX_STATUS: u16 = 0x0B;
pub const W1_TX_FREE: u16 = 0x0C;

/// Receive has not finished yet.
pub const RX_INCOMPLETE: u16 = 0x8000;
pub const RX_ERROR: u16 = 0x4000;
pub const RX_LEN_MASK: u16 = 0x07FF;
/// Error code field inside an erroneous RX status.
pub const RX_ERR_CODE_MASK: u16 = 0x3800;
pub const RX_ERR_OVERRUN: u16 = 0x0000;
pub const RX_ERR_RUNT: u16 = 0x1800;
pub const RX_ERR_ALIGNMENT: u16 = 0x2000;
pub const RX_ERR_CRC: u16 = 0x2800;
pub const RX_ERR_OVERSIZE: u16 = 0x0800;

// Transmit status byte, one per completed frame, popped by writing 0.
pub const TXS_COMPLETE: u8 = 0x80;
pub const TXS_INTR_REQUESTED: u8 = 0x40;
pub const TXS_JABBER: u8 = 0x20;
pub const TXS_UNDERRUN: u8 = 0x10;
pub const TXS_MAX_COLLISIONS: u8 = 0x08;
pub const TXS_STATUS_OVERFLOW: u8 = 0x04;

// Window 2: station address.
pub const W2_STATION_ADDR: u16 = 0x00;

// Window 3: internal configuration.
pub const W3_INTERNAL_CONFIG: u16 = 0x00;
pub const W3_MAC_CONTROL: u16 = 0x06;
pub const W3_OPTIONS: u16 = 0x08;
/// Full-duplex enable in the MAC control word.
pub const MAC_FULL_DUPLEX: u16 = 0x0020;

// Window 4: diagnostics and media.
pub const W4_NET_DIAG: u16 = 0x06;
pub const W4_MEDIA_STATUS: u16 = 0x0A;
pub const MEDIA_LINK_BEAT: u16 = 0x0800;
/// NWAY auto-negotiation enable (Cyclone and later).
pub const MEDIA_NWAY_ENABLE: u16 = 0x0080;

// Window 6: statistics, 8-bit rollover counters plus two byte counts.
pub const W6_CARRIER_LOST: u16 = 0x00;
pub const W6_SQE_ERRORS: u16 = 0x01;
pub const W6_MULTIPLE_COLLISIONS: u16 = 0x02;
pub const W6_SINGLE_COLLISIONS: u16 = 0x03;
pub const W6_LATE_COLLISIONS: u16 = 0x04;
pub const W6_RX_OVERRUNS: u16 = 0x05;
pub const W6_TX_FRAMES_OK: u16 = 0x06;
pub const W6_RX_FRAMES_OK: u16 = 0x07;
pub const W6_TX_DEFERRALS: u16 = 0x08;
pub const W6_RX_BYTES: u16 = 0x0A;
pub const W6_TX_BYTES: u16 = 0x0C;

// Window 7: single-shot master engine of the ISA bus master.
pub const W7_MASTER_ADDR: u16 = 0x00;
pub const W7_MASTER_LEN: u16 = 0x06;
pub const W7_MASTER_STATUS: u16 = 0x0C;
pub const MASTER_IN_PROGRESS: u16 = 0x0800;
/// Set when the engine is moving data up (device to host).
pub const MASTER_UP: u16 = 0x4000;

// Window-independent registers of the descriptor engines (Vortex+).
pub const DOWN_LIST_PTR: u16 = 0x24;
pub const UP_LIST_PTR: u16 = 0x38;
/// Packet status / free transmit bytes on Vortex.
pub const TX_FREE_THRESH: u16 = 0x2F;
