//! Back-end for the ISA 100 Mb/s bus master (3C515 class).
//!
//! Runs the same upload/download descriptor lists as the PCI parts, but
//! over ISA: sixteen-deep rings, every buffer below 16 MiB, and the
//! window-7 single-shot master engine kept around as the smoke-test
//! vehicle for the DMA policy ladder.

use super::regs::*;
use super::{
	classify_and_ack, dma_engine, mac_bring_up, mac_quiesce, pio, DevIo, Events, IsrVerdict,
	NetDevice, NicOps, ServiceCtx,
};
use crate::bus::{poll_until, DmaLayout};
use crate::config::HW_TIMEOUT_TICKS;
use crate::pktdrv::ErrorKind;

pub struct El3BusmasterOps;

impl NicOps for El3BusmasterOps {
	fn init(&self, dev: &mut NetDevice) -> Result<(), ErrorKind> {
		mac_bring_up(dev)?;
		if dev.dma.policy.uses_dma() {
			dma_engine::setup_rings(dev)?;
		}
		Ok(())
	}

	fn reset(&self, dev: &mut NetDevice) -> Result<(), ErrorKind> {
		if dev.dma.policy.uses_dma() {
			dma_engine::stop_engines(dev);
		}
		dev.command_wait(CMD_TOTAL_RESET)?;
		dev.window = None;
		dev.command(cmd_ack_intr(super::ACK_SOURCES));
		Ok(())
	}

	fn send(&self, dev: &mut NetDevice, frame: &[u8]) -> Result<(), ErrorKind> {
		if dev.dma.policy.uses_dma() {
			dma_engine::send(dev, frame)
		} else {
			pio::send(dev, frame)
		}
	}

	fn poll_receive(
		&self,
		dev: &mut NetDevice,
		buf: &mut [u8],
	) -> Result<Option<usize>, ErrorKind> {
		if dev.dma.policy.uses_dma() {
			dma_engine::poll_receive(dev, buf)
		} else {
			pio::poll_receive(dev, buf)
		}
	}

	fn ack_and_classify(&self, io: DevIo<'_>) -> IsrVerdict {
		classify_and_ack(io)
	}

	fn service(&self, dev: &mut NetDevice, events: Events, ctx: &mut ServiceCtx<'_>) {
		if !dev.dma.policy.uses_dma() {
			return pio::service(dev, events, ctx);
		}

		if events.intersects(Events::UP_COMPLETE | Events::RX_COMPLETE) {
			dma_engine::drain_rx_ring(dev, ctx);
		}

		if events.intersects(Events::DOWN_COMPLETE | Events::TX_COMPLETE) {
			dma_engine::reap_tx_ring(dev);
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

	fn teardown(&self, dev: &mut NetDevice) {
		if dev.dma.policy.uses_dma() {
			dma_engine::stop_engines(dev);
		}
		mac_quiesce(dev);
		dma_engine::release_rings(dev);
	}

	/// A real transfer through the window-7 single-shot engine: move a
	/// scratch buffer into the transmit FIFO, watch the engine go idle,
	/// then throw the FIFO contents away.
	fn busmaster_probe(&self, dev: &mut NetDevice) -> bool {
		const PROBE_LEN: usize = 64;

		let layout = DmaLayout {
			size: PROBE_LEN,
			align: 16,
			below_16m: true,
			within_64k: true,
		};
		let Some(scratch) = dev.bus.dma_alloc(layout) else {
			return false;
		};
		unsafe {
			scratch.as_mut_slice().fill(0xA5);
		}

		dev.select_window(7);
		dev.bus
			.outl(dev.io_base + W7_MASTER_ADDR, scratch.phys.as_u64() as u32);
		dev.bus.outw(dev.io_base + W7_MASTER_LEN, PROBE_LEN as u16);
		dev.command(CMD_START_DMA_DOWN);

		let done = poll_until(dev.bus, HW_TIMEOUT_TICKS, || {
			dev.bus.inw(dev.io_base + W7_MASTER_STATUS) & MASTER_IN_PROGRESS == 0
		});

		let completed = done
			&& IsrVerdict::NotOurs
				!= classify_and_ack(DevIo {
					bus: dev.bus,
					base: dev.io_base,
				});

		// Discard whatever landed in the FIFO.
		let _ = dev.command_wait(CMD_TX_RESET);
		dev.select_window(1);
		dev.bus.dma_free(scratch);
		completed
	}
}
