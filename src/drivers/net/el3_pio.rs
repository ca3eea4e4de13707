//! Back-end for the ISA 10 Mb/s parts (3C509 class).
//!
//! Pure programmed I/O: frames move through the window-1 data FIFOs,
//! length word first, payload padded to the transfer width. The chip
//! retries collisions on its own; the driver only restarts the
//! transmitter after the terminal error classes.

use super::regs::*;
use super::{
	classify_and_ack, mac_bring_up, mac_quiesce, pio, DevIo, Events, IsrVerdict, NetDevice,
	NicOps, ServiceCtx,
};
use crate::pktdrv::ErrorKind;

pub struct El3PioOps;

impl NicOps for El3PioOps {
	fn init(&self, dev: &mut NetDevice) -> Result<(), ErrorKind> {
		mac_bring_up(dev)
	}

	fn reset(&self, dev: &mut NetDevice) -> Result<(), ErrorKind> {
		dev.command_wait(CMD_TOTAL_RESET)?;
		dev.window = None;
		dev.command(cmd_ack_intr(super::ACK_SOURCES));
		Ok(())
	}

	fn send(&self, dev: &mut NetDevice, frame: &[u8]) -> Result<(), ErrorKind> {
		pio::send(dev, frame)
	}

	fn poll_receive(
		&self,
		dev: &mut NetDevice,
		buf: &mut [u8],
	) -> Result<Option<usize>, ErrorKind> {
		pio::poll_receive(dev, buf)
	}

	fn ack_and_classify(&self, io: DevIo<'_>) -> IsrVerdict {
		classify_and_ack(io)
	}

	fn service(&self, dev: &mut NetDevice, events: Events, ctx: &mut ServiceCtx<'_>) {
		pio::service(dev, events, ctx);
	}

	fn teardown(&self, dev: &mut NetDevice) {
		mac_quiesce(dev);
	}

	fn check_rx_available(&self, dev: &mut NetDevice) -> Option<bool> {
		dev.select_window(1);
		let status = dev.bus.inw(dev.io_base + W1_RX_STATUS);
		Some(status & RX_INCOMPLETE == 0)
	}
}
