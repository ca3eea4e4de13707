//! Per-device traffic counters.
//!
//! The layout mirrors the structure returned by the get-statistics entry
//! point. Hardware keeps its own 8-bit rollover counters in window 6;
//! the interrupt back half folds them in here before they can wrap.

/// Counter block of one interface.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeviceStats {
	pub packets_in: u64,
	pub packets_out: u64,
	pub bytes_in: u64,
	pub bytes_out: u64,
	pub errors_in: u64,
	pub errors_out: u64,
	/// Frames dropped for want of buffers or handles; invisible to senders.
	pub packets_lost: u64,
	pub collisions: u64,
	pub crc_errors: u64,
	pub alignment_errors: u64,
	pub overruns: u64,
	pub underruns: u64,
}

impl DeviceStats {
	pub fn note_rx(&mut self, len: usize) {
		self.packets_in += 1;
		self.bytes_in += len as u64;
	}

	pub fn note_tx(&mut self, len: usize) {
		self.packets_out += 1;
		self.bytes_out += len as u64;
	}

	pub fn note_rx_error(&mut self) {
		self.errors_in += 1;
	}

	pub fn note_tx_error(&mut self) {
		self.errors_out += 1;
	}

	pub fn note_lost(&mut self) {
		self.packets_lost += 1;
	}
}
