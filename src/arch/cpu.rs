//! CPU classification for the DMA policy engine.

/// Processor generation bucket. Ordering is meaningful: later buckets are
/// supersets of earlier ones for every capability the driver cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CpuClass {
	/// 80386-class: no safe bus-master support, no cache instructions the
	/// driver may rely on.
	I386,
	/// 80486-class: bus-mastering is safe, WBINVD available.
	I486,
	/// Pentium (P5).
	Pentium,
	/// Pentium Pro / II / III (P6).
	PentiumPro,
	/// CLFLUSH-capable (Pentium 4 and everything after).
	Pentium4,
}

#[derive(Debug, Clone, Copy)]
pub struct CpuInfo {
	pub class: CpuClass,
	/// Cache-line size in bytes, when CLFLUSH is available.
	pub clflush_line: Option<usize>,
}

impl CpuInfo {
	/// Gate 3 of the DMA policy ladder: below this, bus-master transfers
	/// are considered unsafe and the device falls back to PIO.
	pub fn supports_busmaster(&self) -> bool {
		self.class >= CpuClass::I486
	}

	/// Per-pass receive batching cap; faster CPUs drain more per pass
	/// without starving co-hooked devices.
	pub fn rx_batch(&self) -> usize {
		match self.class {
			CpuClass::I386 => 8,
			CpuClass::I486 => 16,
			CpuClass::Pentium => 32,
			CpuClass::PentiumPro | CpuClass::Pentium4 => 48,
		}
	}

	/// Transmit-completion reaping cap, analogous to [`Self::rx_batch`].
	pub fn tx_batch(&self) -> usize {
		self.rx_batch() / 2
	}
}

cfg_if::cfg_if! {
	if #[cfg(target_arch = "x86_64")] {
		/// Queries CPUID. Every x86_64 part reports CLFLUSH, so real
		/// detections land in [`CpuClass::Pentium4`]; the earlier buckets
		/// are reachable through the policy engine's explicit inputs.
		pub fn detect() -> CpuInfo {
			let cpuid = raw_cpuid::CpuId::new();

			let Some(features) = cpuid.get_feature_info() else {
				return CpuInfo {
					class: CpuClass::Pentium,
					clflush_line: None,
				};
			};

			let clflush_line = features
				.has_clflush()
				.then(|| usize::from(features.cflush_cache_line_size()) * 8);

			let class = if clflush_line.is_some() {
				CpuClass::Pentium4
			} else {
				match features.family_id() {
					0..=4 => CpuClass::I486,
					5 => CpuClass::Pentium,
					_ => CpuClass::PentiumPro,
				}
			};

			CpuInfo { class, clflush_line }
		}
	} else {
		/// No CPUID on this architecture; report a conservative
		/// software-barrier-only CPU.
		pub fn detect() -> CpuInfo {
			CpuInfo {
				class: CpuClass::PentiumPro,
				clflush_line: None,
			}
		}
	}
}
