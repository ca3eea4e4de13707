//! Back-end for the descriptor-engine PCI parts: Boomerang (3C90x),
//! Cyclone (3C905B), Tornado (3C905C), and their CardBus and Mini-PCI
//! derivatives.
//!
//! Frames move through the linked upload and download lists of the
//! shared descriptor datapath. When the DMA policy forbids mastering,
//! the same silicon is driven through its Vortex-compatible FIFO paths
//! instead; every operation branches on the cached policy, never on the
//! generation.

use super::regs::*;
use super::{
	classify_and_ack, dma_engine, mac_bring_up, mac_quiesce, pio, Capabilities, DevIo, Events,
	IsrVerdict, NetDevice, NicOps, ServiceCtx,
};
use crate::pktdrv::ErrorKind;

pub struct BoomerangOps;

impl NicOps for BoomerangOps {
	fn init(&self, dev: &mut NetDevice) -> Result<(), ErrorKind> {
		mac_bring_up(dev)?;
		if dev.caps.contains(Capabilities::NWAY) {
			dev.select_window(4);
			let media = dev.bus.inw(dev.io_base + W4_MEDIA_STATUS);
			dev.bus
				.outw(dev.io_base + W4_MEDIA_STATUS, media | MEDIA_NWAY_ENABLE);
			dev.select_window(1);
		}
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

	/// Register-path probe: the engine must hold a list pointer and hand
	/// it back. Runs before rings exist, with the engine stalled.
	fn busmaster_probe(&self, dev: &mut NetDevice) -> bool {
		const PATTERN: u32 = 0x5A5A_5A40;
		if dev.command_wait(CMD_UP_STALL).is_err() {
			return false;
		}
		dev.bus.outl(dev.io_base + UP_LIST_PTR, PATTERN);
		let read_back = dev.bus.inl(dev.io_base + UP_LIST_PTR);
		dev.bus.outl(dev.io_base + UP_LIST_PTR, 0);
		dev.command(CMD_UP_UNSTALL);
		read_back == PATTERN
	}
}
