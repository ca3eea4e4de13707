//! Shared descriptor-engine datapath.
//!
//! The ISA bus master and every descriptor-based PCI part drive the same
//! upload/download list protocol: stall the engine, publish descriptors,
//! point the list register, unstall. The per-generation tables wrap
//! these flows; placement constraints (16 MiB ceiling, common-buffer
//! allocation) arrive through the device's cached DMA configuration.

use memory_addresses::PhysAddr;

use super::regs::*;
use super::rings::{
	RxRing, TxReap, TxRing, DN_ERR_UNDERRUN, UP_ERR_ALIGNMENT, UP_ERR_CRC, UP_ERR_OVERRUN,
};
use super::{recover_tx_underrun, NetDevice, ServiceCtx};
use crate::config::{BOUNCE_BUF_SIZE, TX_RING_SIZE};
use crate::dma::{cache, mapping, DmaPolicy};
use crate::pktdrv::ErrorKind;

fn stall(dev: &mut NetDevice, command: u16) -> Result<(), ErrorKind> {
	dev.command_wait(command)
}

fn writeback_desc_region(dev: &NetDevice, region: crate::bus::DmaRegion) {
	cache::writeback(dev.dma.tier, region.virt, region.size, dev.ring_flags);
}

/// Rings the download doorbell for a posted descriptor: write the
/// descriptors back, point an idle engine at the descriptor, run.
pub(super) fn down_doorbell(dev: &mut NetDevice, desc_phys: PhysAddr) {
	if let Some(ring) = dev.tx_ring.as_ref() {
		let region = *ring.desc_region();
		writeback_desc_region(dev, region);
	}

	let _ = stall(dev, CMD_DOWN_STALL);
	if dev.bus.inl(dev.io_base + DOWN_LIST_PTR) == 0 {
		dev.bus
			.outl(dev.io_base + DOWN_LIST_PTR, desc_phys.as_u64() as u32);
	}
	dev.command(CMD_DOWN_UNSTALL);
}

/// Allocates rings if absent and publishes the upload list. The
/// download list stays idle until the first send posts into it.
pub(super) fn setup_rings(dev: &mut NetDevice) -> Result<(), ErrorKind> {
	let via_service = dev.dma.policy == DmaPolicy::CommonBuffer;
	let below_16m = dev.dma.isa_16m_ceiling;

	if dev.rx_ring.is_none() {
		let (ring, flags) = RxRing::new(
			dev.bus,
			dev.generation.rx_ring_entries(),
			BOUNCE_BUF_SIZE,
			below_16m,
			via_service,
		)?;
		dev.ring_flags = flags;
		dev.rx_ring = Some(ring);
	}
	if dev.tx_ring.is_none() {
		dev.tx_ring = Some(TxRing::new(dev.bus, TX_RING_SIZE, below_16m, via_service)?);
	}

	let ring = dev.rx_ring.as_mut().unwrap();
	ring.rearm();
	let rx_base = ring.base_phys();
	let rx_region = *ring.desc_region();
	writeback_desc_region(dev, rx_region);
	stall(dev, CMD_UP_STALL)?;
	dev.bus
		.outl(dev.io_base + UP_LIST_PTR, rx_base.as_u64() as u32);
	dev.command(CMD_UP_UNSTALL);

	stall(dev, CMD_DOWN_STALL)?;
	dev.bus.outl(dev.io_base + DOWN_LIST_PTR, 0);
	dev.command(CMD_DOWN_UNSTALL);
	Ok(())
}

/// Quiesces the engines and zeroes the list pointers; every in-flight
/// mapping comes back to the driver.
pub(super) fn stop_engines(dev: &mut NetDevice) {
	let _ = stall(dev, CMD_UP_STALL);
	let _ = stall(dev, CMD_DOWN_STALL);
	dev.bus.outl(dev.io_base + UP_LIST_PTR, 0);
	dev.bus.outl(dev.io_base + DOWN_LIST_PTR, 0);

	if let Some(ring) = dev.tx_ring.as_mut() {
		for aborted in ring.abort_in_flight() {
			if let Err(kind) = mapping::unmap(dev.bus, aborted) {
				warn!("{}: leaked mapping on abort: {kind}", dev.name);
			}
		}
	}
}

/// Releases the rings back to the allocator. Engines must be stopped.
pub(super) fn release_rings(dev: &mut NetDevice) {
	if let Some(ring) = dev.rx_ring.take() {
		ring.release(dev.bus);
	}
	if let Some(ring) = dev.tx_ring.take() {
		ring.release(dev.bus);
	}
}

/// Posts one frame into the download list.
pub(super) fn send(dev: &mut NetDevice, frame: &[u8]) -> Result<(), ErrorKind> {
	if dev.tx_ring.as_ref().is_none_or(TxRing::is_full) {
		return Err(ErrorKind::Exhausted);
	}

	let mapped = mapping::map_tx(
		dev.bus,
		dev.index,
		dev.dma.policy,
		dev.dma.tier,
		dev.dma.isa_16m_ceiling,
		frame,
	)?;
	let desc_phys = dev.tx_ring.as_mut().unwrap().post(mapped)?;
	down_doorbell(dev, desc_phys);
	Ok(())
}

fn count_rx_error(dev: &mut NetDevice, error: u32) {
	if error & UP_ERR_CRC != 0 {
		dev.stats.crc_errors += 1;
	}
	if error & UP_ERR_ALIGNMENT != 0 {
		dev.stats.alignment_errors += 1;
	}
	if error & UP_ERR_OVERRUN != 0 {
		dev.stats.overruns += 1;
	}
	dev.stats.note_rx_error();
}

/// One receive-drain pass under the batching cap: invalidate, deliver,
/// recycle in place, hand ownership back.
pub(super) fn drain_rx_ring(dev: &mut NetDevice, ctx: &mut ServiceCtx<'_>) {
	for _ in 0..dev.rx_batch {
		let Some(ring) = dev.rx_ring.as_mut() else {
			return;
		};
		let Some(peek) = ring.peek() else {
			break;
		};

		if let Some(error) = peek.error {
			count_rx_error(dev, error);
			dev.rx_ring.as_mut().unwrap().recycle();
			continue;
		}

		let ring = dev.rx_ring.as_mut().unwrap();
		let buf = *ring.current_buf();
		// Device wrote the buffer; invalidate before the CPU reads it.
		cache::invalidate(dev.dma.tier, buf.virt, peek.len, dev.ring_flags);

		let frame = unsafe { core::slice::from_raw_parts(buf.virt.as_ptr::<u8>(), peek.len) };
		if (ctx.dispatch)(dev.index, frame) {
			dev.stats.note_rx(peek.len);
		} else {
			dev.stats.note_lost();
		}

		let ring = dev.rx_ring.as_mut().unwrap();
		ring.recycle();
		let region = *ring.desc_region();
		writeback_desc_region(dev, region);
	}

	// The engine stalls itself when it runs out of device-owned
	// descriptors; recycling handed some back, so let it run.
	dev.command(CMD_UP_UNSTALL);
}

/// One transmit-reap pass under the batching cap.
pub(super) fn reap_tx_ring(dev: &mut NetDevice) {
	for _ in 0..dev.tx_batch {
		let Some(ring) = dev.tx_ring.as_mut() else {
			return;
		};
		match ring.reap() {
			None => break,
			Some(TxReap::Done(done)) => {
				let len = done.len;
				if let Err(kind) = mapping::unmap(dev.bus, done) {
					warn!("{}: bounce accounting mismatch: {kind}", dev.name);
					dev.stats.note_tx_error();
				} else {
					dev.stats.note_tx(len);
				}
			}
			Some(TxReap::Retry(desc_phys)) => {
				dev.stats.collisions += 1;
				down_doorbell(dev, desc_phys);
			}
			Some(TxReap::Failed(failed, errors)) => {
				if errors & DN_ERR_UNDERRUN != 0 {
					recover_tx_underrun(dev);
				} else {
					dev.stats.note_tx_error();
				}
				if mapping::unmap(dev.bus, failed).is_err() {
					warn!("{}: bounce accounting mismatch on failed send", dev.name);
				}
			}
		}
	}
}

/// `poll_receive` over the upload list: copy out, recycle in place.
pub(super) fn poll_receive(
	dev: &mut NetDevice,
	buf: &mut [u8],
) -> Result<Option<usize>, ErrorKind> {
	let tier = dev.dma.tier;
	let flags = dev.ring_flags;
	let Some(ring) = dev.rx_ring.as_mut() else {
		return Ok(None);
	};
	let Some(peek) = ring.peek() else {
		return Ok(None);
	};

	if let Some(error) = peek.error {
		count_rx_error(dev, error);
		dev.rx_ring.as_mut().unwrap().recycle();
		return Err(ErrorKind::TransientIo);
	}
	if peek.len > buf.len() {
		dev.stats.note_rx_error();
		dev.rx_ring.as_mut().unwrap().recycle();
		return Err(ErrorKind::TransientIo);
	}

	let src = *ring.current_buf();
	cache::invalidate(tier, src.virt, peek.len, flags);
	buf[..peek.len].copy_from_slice(unsafe { &src.as_slice()[..peek.len] });
	dev.rx_ring.as_mut().unwrap().recycle();
	dev.stats.note_rx(peek.len);
	dev.command(CMD_UP_UNSTALL);
	Ok(Some(peek.len))
}
