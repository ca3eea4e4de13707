//! Descriptor rings of the DMA back-ends.
//!
//! The download (transmit) and upload (receive) engines walk linked
//! descriptor lists in host memory. The driver lays the lists out as
//! fixed circular rings: the producer index advances only on the driver
//! side (receive refill, transmit post), the consumer index only when the
//! device has passed a descriptor back. Ownership is carried in the
//! descriptor status words; at every moment each descriptor belongs to
//! exactly one side.

use alloc::vec::Vec;
use core::ptr::NonNull;

use endian_num::le32;
use memory_addresses::PhysAddr;
use volatile::{VolatileFieldAccess, VolatilePtr};

use crate::bus::{Bus, DmaLayout, DmaRegion};
use crate::config::TX_COLLISION_RETRIES;
use crate::dma::mapping::TxMapping;
use crate::pktdrv::ErrorKind;

/// Upload-descriptor status: frame length as received.
pub const UP_LEN_MASK: u32 = 0x1FFF;
/// Upload-descriptor status: receive failed, error class in bits 16..21.
pub const UP_ERROR: u32 = 1 << 14;
/// Upload-descriptor status: the device has passed the descriptor back.
pub const UP_COMPLETE: u32 = 1 << 15;
pub const UP_ERR_OVERRUN: u32 = 1 << 16;
pub const UP_ERR_RUNT: u32 = 1 << 17;
pub const UP_ERR_ALIGNMENT: u32 = 1 << 18;
pub const UP_ERR_CRC: u32 = 1 << 19;
pub const UP_ERR_OVERSIZE: u32 = 1 << 20;

/// Fragment length word: no further fragments follow.
pub const FRAG_LAST: u32 = 1 << 31;

/// Download frame-start header: frame length.
pub const DN_LEN_MASK: u32 = 0x1FFF;
/// Download frame-start header: interrupt when this frame completes.
pub const DN_INDICATE: u32 = 1 << 31;
/// Download frame-start header: the device has transmitted the frame.
pub const DN_COMPLETE: u32 = 1 << 16;
pub const DN_ERR_UNDERRUN: u32 = 1 << 17;
pub const DN_ERR_JABBER: u32 = 1 << 18;
pub const DN_ERR_MAX_COLLISIONS: u32 = 1 << 19;

/// Scatter fragments one download descriptor can carry.
pub const DN_MAX_FRAGS: usize = 2;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, VolatileFieldAccess)]
pub struct Fragment {
	pub addr: le32,
	/// Length, with [`FRAG_LAST`] on the final fragment.
	pub len: le32,
}

/// Upload (receive) descriptor.
#[repr(C, align(8))]
#[derive(Debug, Default, VolatileFieldAccess)]
pub struct UpDesc {
	pub next: le32,
	pub status: le32,
	pub frag: Fragment,
}

/// Download (transmit) descriptor. Carries up to [`DN_MAX_FRAGS`]
/// scatter fragments; the send path fills the first and terminates it,
/// the second exists for scatter-capable parts.
#[repr(C, align(8))]
#[derive(Debug, Default, VolatileFieldAccess)]
pub struct DownDesc {
	pub next: le32,
	pub frame_start: le32,
	pub frag: Fragment,
	pub frag2: Fragment,
}

fn desc_ptr<T>(region: &DmaRegion, index: usize) -> VolatilePtr<'_, T> {
	debug_assert!((index + 1) * core::mem::size_of::<T>() <= region.size);
	let ptr = unsafe { region.as_ptr::<T>().add(index) };
	unsafe { VolatilePtr::new(NonNull::new_unchecked(ptr)) }
}

/// A received frame peeked at the consumer index.
#[derive(Debug, Clone, Copy)]
pub struct RxPeek {
	pub len: usize,
	pub error: Option<u32>,
}

pub struct RxRing {
	desc: DmaRegion,
	bufs: Vec<DmaRegion>,
	consumer: usize,
	entries: usize,
	buf_size: usize,
	via_service: bool,
}

impl RxRing {
	/// Builds a ring with every descriptor device-owned. Returns the
	/// ring and the cache-responsibility flags of its buffers.
	pub fn new(
		bus: &dyn Bus,
		entries: usize,
		buf_size: usize,
		below_16m: bool,
		via_service: bool,
	) -> Result<(Self, crate::bus::MapFlags), ErrorKind> {
		debug_assert!(entries.is_power_of_two());

		let desc_layout = DmaLayout {
			size: entries * core::mem::size_of::<UpDesc>(),
			align: 16,
			below_16m,
			within_64k: true,
		};
		let (desc, mut flags) =
			crate::dma::alloc_dma(bus, desc_layout, via_service).ok_or(ErrorKind::Exhausted)?;

		let mut bufs = Vec::with_capacity(entries);
		for _ in 0..entries {
			let mut layout = DmaLayout::frame(buf_size);
			layout.below_16m = below_16m;
			match crate::dma::alloc_dma(bus, layout, via_service) {
				Some((region, buf_flags)) => {
					flags = buf_flags;
					bufs.push(region);
				}
				None => {
					for region in bufs {
						crate::dma::free_dma(bus, region, via_service);
					}
					crate::dma::free_dma(bus, desc, via_service);
					return Err(ErrorKind::Exhausted);
				}
			}
		}

		let mut ring = Self::assemble(desc, bufs, buf_size);
		ring.via_service = via_service;
		Ok((ring, flags))
	}

	pub(crate) fn assemble(desc: DmaRegion, bufs: Vec<DmaRegion>, buf_size: usize) -> Self {
		let entries = bufs.len();
		let ring = Self {
			desc,
			bufs,
			consumer: 0,
			entries,
			buf_size,
			via_service: false,
		};
		for i in 0..entries {
			let next_phys = ring.desc.phys.as_u64() as u32
				+ (((i + 1) % entries) * core::mem::size_of::<UpDesc>()) as u32;
			let d = ring.up_desc(i);
			d.next().write(le32::from_ne(next_phys));
			d.status().write(le32::from_ne(0));
			d.frag().addr().write(le32::from_ne(ring.bufs[i].phys.as_u64() as u32));
			d.frag()
				.len()
				.write(le32::from_ne(buf_size as u32 | FRAG_LAST));
		}
		ring
	}

	fn up_desc(&self, index: usize) -> VolatilePtr<'_, UpDesc> {
		desc_ptr(&self.desc, index)
	}

	pub fn base_phys(&self) -> PhysAddr {
		self.desc.phys
	}

	pub fn entries(&self) -> usize {
		self.entries
	}

	/// The descriptor at the consumer index, if the device passed it back.
	pub fn peek(&self) -> Option<RxPeek> {
		let status = self.up_desc(self.consumer).status().read().to_ne();
		if status & UP_COMPLETE == 0 {
			return None;
		}
		let len = (status & UP_LEN_MASK) as usize;
		let error = (status & UP_ERROR != 0).then_some(status & !(UP_COMPLETE | UP_LEN_MASK));
		Some(RxPeek { len, error })
	}

	/// Buffer bytes of the frame at the consumer index. Valid until
	/// [`Self::recycle`]; the descriptor stays driver-owned meanwhile.
	pub fn frame(&self, len: usize) -> &[u8] {
		let region = &self.bufs[self.consumer];
		unsafe { &region.as_slice()[..len.min(self.buf_size)] }
	}

	/// The buffer region under the consumer index, for cache maintenance.
	pub fn current_buf(&self) -> &DmaRegion {
		&self.bufs[self.consumer]
	}

	/// Hands every descriptor back to the device and rewinds the
	/// consumer; the post-reset state before the list is republished.
	pub fn rearm(&mut self) {
		for i in 0..self.entries {
			self.up_desc(i).status().write(le32::from_ne(0));
		}
		self.consumer = 0;
	}

	/// Returns the consumed descriptor to the device and advances. The
	/// buffer is recycled in place, so the ring can never run out of
	/// driver-provided buffers.
	pub fn recycle(&mut self) {
		let d = self.up_desc(self.consumer);
		d.status().write(le32::from_ne(0));
		self.consumer = (self.consumer + 1) & (self.entries - 1);
	}

	/// The descriptor array itself, for cache write-back after recycling.
	pub fn desc_region(&self) -> &DmaRegion {
		&self.desc
	}

	/// Descriptors currently owned by the device (available for receive).
	pub fn device_owned(&self) -> usize {
		(0..self.entries)
			.filter(|&i| self.up_desc(i).status().read().to_ne() & UP_COMPLETE == 0)
			.count()
	}

	pub fn release(self, bus: &dyn Bus) {
		for region in self.bufs {
			crate::dma::free_dma(bus, region, self.via_service);
		}
		crate::dma::free_dma(bus, self.desc, self.via_service);
	}
}

/// Outcome of reaping one transmit descriptor.
#[derive(Debug)]
pub enum TxReap {
	/// Frame left the wire; mapping to release.
	Done(TxMapping),
	/// Collision-class error; the descriptor was re-armed for another
	/// attempt and the doorbell must be rung.
	Retry(PhysAddr),
	/// Non-retriable error; mapping to release.
	Failed(TxMapping, u32),
}

pub struct TxRing {
	desc: DmaRegion,
	slots: Vec<Option<TxMapping>>,
	retries: Vec<u8>,
	producer: usize,
	consumer: usize,
	in_flight: usize,
	entries: usize,
	via_service: bool,
}

impl TxRing {
	pub fn new(
		bus: &dyn Bus,
		entries: usize,
		below_16m: bool,
		via_service: bool,
	) -> Result<Self, ErrorKind> {
		debug_assert!(entries.is_power_of_two());

		let layout = DmaLayout {
			size: entries * core::mem::size_of::<DownDesc>(),
			align: 16,
			below_16m,
			within_64k: true,
		};
		let (desc, _flags) =
			crate::dma::alloc_dma(bus, layout, via_service).ok_or(ErrorKind::Exhausted)?;
		let mut ring = Self::assemble(desc, entries);
		ring.via_service = via_service;
		Ok(ring)
	}

	pub(crate) fn assemble(desc: DmaRegion, entries: usize) -> Self {
		let ring = Self {
			desc,
			slots: (0..entries).map(|_| None).collect(),
			retries: vec![0; entries],
			producer: 0,
			consumer: 0,
			in_flight: 0,
			entries,
			via_service: false,
		};
		for i in 0..entries {
			let next_phys = ring.desc.phys.as_u64() as u32
				+ (((i + 1) % entries) * core::mem::size_of::<DownDesc>()) as u32;
			let d = ring.down_desc(i);
			d.next().write(le32::from_ne(next_phys));
			d.frame_start().write(le32::from_ne(0));
		}
		ring
	}

	fn down_desc(&self, index: usize) -> VolatilePtr<'_, DownDesc> {
		desc_ptr(&self.desc, index)
	}

	pub fn is_full(&self) -> bool {
		self.in_flight == self.entries
	}

	pub fn in_flight(&self) -> usize {
		self.in_flight
	}

	pub fn desc_phys(&self, index: usize) -> PhysAddr {
		PhysAddr::new(self.desc.phys.as_u64() + (index * core::mem::size_of::<DownDesc>()) as u64)
	}

	/// Posts a mapped frame at the producer index and flips the
	/// descriptor to the device. Returns the descriptor's physical
	/// address for the doorbell write.
	pub fn post(&mut self, mapping: TxMapping) -> Result<PhysAddr, ErrorKind> {
		if self.is_full() {
			return Err(ErrorKind::Exhausted);
		}

		let index = self.producer;
		let d = self.down_desc(index);
		debug_assert_eq!(
			d.frame_start().read().to_ne(),
			0,
			"descriptor owned by device at producer index"
		);

		d.frag().addr().write(le32::from_ne(mapping.phys.as_u64() as u32));
		d.frag()
			.len()
			.write(le32::from_ne(mapping.len as u32 | FRAG_LAST));
		// Publish the body before the ownership-carrying header.
		crate::arch::cache::barrier();
		d.frame_start()
			.write(le32::from_ne(mapping.len as u32 | DN_INDICATE));

		self.slots[index] = Some(mapping);
		self.retries[index] = 0;
		self.producer = (self.producer + 1) & (self.entries - 1);
		self.in_flight += 1;
		Ok(self.desc_phys(index))
	}

	/// Reaps the descriptor at the consumer index, if the device has
	/// passed it back.
	pub fn reap(&mut self) -> Option<TxReap> {
		if self.in_flight == 0 {
			return None;
		}

		let index = self.consumer;
		let frame_start = desc_ptr::<DownDesc>(&self.desc, index).frame_start().read().to_ne();
		if frame_start & DN_COMPLETE == 0 {
			return None;
		}

		let errors = frame_start & (DN_ERR_UNDERRUN | DN_ERR_JABBER | DN_ERR_MAX_COLLISIONS);
		if errors & DN_ERR_MAX_COLLISIONS != 0 && self.retries[index] < TX_COLLISION_RETRIES {
			self.retries[index] += 1;
			// Re-arm the same descriptor for another attempt.
			desc_ptr::<DownDesc>(&self.desc, index)
				.frame_start()
				.write(le32::from_ne(frame_start & !(DN_COMPLETE | DN_ERR_MAX_COLLISIONS)));
			return Some(TxReap::Retry(self.desc_phys(index)));
		}

		let mapping = self.slots[index].take().expect("reaping an empty transmit slot");
		desc_ptr::<DownDesc>(&self.desc, index).frame_start().write(le32::from_ne(0));
		self.consumer = (self.consumer + 1) & (self.entries - 1);
		self.in_flight -= 1;

		if errors != 0 {
			Some(TxReap::Failed(mapping, errors))
		} else {
			Some(TxReap::Done(mapping))
		}
	}

	/// Drops every in-flight mapping; used by reset and teardown after
	/// the engines are stalled.
	pub fn abort_in_flight(&mut self) -> Vec<TxMapping> {
		let mut aborted = Vec::new();
		for i in 0..self.entries {
			if let Some(mapping) = self.slots[i].take() {
				self.down_desc(i).frame_start().write(le32::from_ne(0));
				aborted.push(mapping);
			}
		}
		self.producer = 0;
		self.consumer = 0;
		self.in_flight = 0;
		aborted
	}

	/// The descriptor array itself, for pre-doorbell cache write-back.
	pub fn desc_region(&self) -> &DmaRegion {
		&self.desc
	}

	pub fn release(self, bus: &dyn Bus) {
		debug_assert_eq!(self.in_flight, 0);
		crate::dma::free_dma(bus, self.desc, self.via_service);
	}
}
