//! Shared FIFO datapath of the programmed-I/O back-ends.
//!
//! The 3C509, the 3C515 in PIO mode, and the PCI Vortex all move frames
//! through the same window-1 FIFO protocol; the per-generation tables
//! wrap these flows and add their quirks.

use super::regs::*;
use super::{recover_tx_underrun, Events, NetDevice, ServiceCtx};
use crate::pktdrv::ErrorKind;

/// FIFO slack the chip wants on top of the frame: length word, reserved
/// word, and the internal preamble slot.
const TX_FIFO_SLACK: usize = 4;

/// Length word, reserved word, then the padded payload through the
/// attach-selected inner copy.
fn write_tx_fifo(dev: &NetDevice, frame: &[u8]) {
	let base = dev.io_base;
	dev.bus.outw(base + W1_TX_FIFO, frame.len() as u16);
	dev.bus.outw(base + W1_TX_FIFO, 0);
	dev.fifo.write(dev.bus, base + W1_TX_FIFO, frame);
}

/// Non-blocking FIFO send; refuses when the FIFO cannot take the frame.
pub(super) fn send(dev: &mut NetDevice, frame: &[u8]) -> Result<(), ErrorKind> {
	dev.select_window(1);
	let free = usize::from(dev.bus.inw(dev.io_base + W1_TX_FREE));
	if free < frame.len() + TX_FIFO_SLACK {
		return Err(ErrorKind::Exhausted);
	}
	write_tx_fifo(dev, frame);
	dev.stats.note_tx(frame.len());
	Ok(())
}

/// Copies the next completed frame out of the receive FIFO. Erroneous
/// frames are discarded, counted by class, and reported transient.
pub(super) fn poll_receive(
	dev: &mut NetDevice,
	buf: &mut [u8],
) -> Result<Option<usize>, ErrorKind> {
	dev.select_window(1);
	let status = dev.bus.inw(dev.io_base + W1_RX_STATUS);
	if status & RX_INCOMPLETE != 0 {
		return Ok(None);
	}

	if status & RX_ERROR != 0 {
		match status & RX_ERR_CODE_MASK {
			RX_ERR_CRC => dev.stats.crc_errors += 1,
			RX_ERR_ALIGNMENT => dev.stats.alignment_errors += 1,
			RX_ERR_OVERRUN => dev.stats.overruns += 1,
			_ => {}
		}
		dev.stats.note_rx_error();
		dev.command_wait(CMD_RX_DISCARD)?;
		return Err(ErrorKind::TransientIo);
	}

	let len = usize::from(status & RX_LEN_MASK);
	if len > buf.len() {
		dev.stats.note_rx_error();
		dev.command_wait(CMD_RX_DISCARD)?;
		return Err(ErrorKind::TransientIo);
	}

	dev.fifo.read(dev.bus, dev.io_base + W1_RX_FIFO, buf, len);
	dev.command_wait(CMD_RX_DISCARD)?;
	dev.stats.note_rx(len);
	Ok(Some(len))
}

/// Pops completed transmit statuses and recovers the error classes. The
/// chip retries collisions itself; only the terminal classes reach us.
pub(super) fn reap_tx_status(dev: &mut NetDevice, budget: usize) {
	dev.select_window(1);
	for _ in 0..budget {
		let status = dev.bus.inb(dev.io_base + W1_TX_STATUS);
		if status & TXS_COMPLETE == 0 {
			break;
		}
		// Pop the status stack.
		dev.bus.outb(dev.io_base + W1_TX_STATUS, 0);

		if status & TXS_UNDERRUN != 0 {
			recover_tx_underrun(dev);
		} else if status & TXS_JABBER != 0 {
			dev.stats.note_tx_error();
			let _ = dev.command_wait(CMD_TX_RESET);
			dev.command(CMD_TX_ENABLE);
		} else if status & TXS_MAX_COLLISIONS != 0 {
			dev.stats.collisions += 1;
			dev.stats.note_tx_error();
			dev.command(CMD_TX_ENABLE);
		}
	}
}

/// The full back-half pass of a FIFO device.
pub(super) fn service(dev: &mut NetDevice, events: Events, ctx: &mut ServiceCtx<'_>) {
	if events.contains(Events::RX_COMPLETE) {
		for _ in 0..dev.rx_batch {
			match poll_receive(dev, ctx.scratch) {
				Ok(Some(len)) => {
					if !(ctx.dispatch)(dev.index, &ctx.scratch[..len]) {
						dev.stats.note_lost();
					}
				}
				Ok(None) => break,
				Err(ErrorKind::HwTimeout) => {
					ctx.reset_requested = true;
					break;
				}
				Err(_) => {}
			}
		}
	}

	if events.contains(Events::TX_COMPLETE) {
		reap_tx_status(dev, dev.tx_batch);
	}

	if events.contains(Events::LINK_EVENT) {
		dev.update_link_state();
	}

	if events.contains(Events::STATS_FULL) {
		dev.drain_hw_stats();
	}

	if events.contains(Events::ADAPTER_FAILURE) {
		error!("{}: adapter failure, scheduling reset", dev.name);
		ctx.reset_requested = true;
	}
}
