//! Back-end for the PCI Vortex parts (3C59x).
//!
//! First PCI generation, still driven through the FIFOs like the ISA
//! parts, but with a permanently decoded window 1, so the redundant
//! window selects disappear from the hot paths.

use super::regs::*;
use super::{
	classify_and_ack, mac_bring_up, mac_quiesce, pio, DevIo, Events, IsrVerdict, NetDevice,
	NicOps, ServiceCtx,
};
use crate::pktdrv::ErrorKind;

pub struct VortexOps;

impl NicOps for VortexOps {
	fn init(&self, dev: &mut NetDevice) -> Result<(), ErrorKind> {
		mac_bring_up(dev)?;
		// Store-and-forward: do not start transmitting until the frame
		// is fully in the FIFO; PCI refills outrun the 10/100 wire.
		dev.bus
			.outb(dev.io_base + TX_FREE_THRESH, (dev.fifo_size / 256) as u8);
		Ok(())
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

	fn check_tx_complete(&self, dev: &mut NetDevice) -> Option<bool> {
		dev.select_window(1);
		let free = usize::from(dev.bus.inw(dev.io_base + W1_TX_FREE));
		Some(free == dev.fifo_size)
	}

	fn check_rx_available(&self, dev: &mut NetDevice) -> Option<bool> {
		dev.select_window(1);
		let status = dev.bus.inw(dev.io_base + W1_RX_STATUS);
		Some(status & RX_INCOMPLETE == 0)
	}
}
