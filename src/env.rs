//! Central parsing of the driver option list.
//!
//! The resident stub hands the core one `key=value` option string at
//! bring-up stage 3. Everything the user can influence from the command
//! line funnels through the typed accessors below; no other module parses
//! option text.

use alloc::string::String;
use alloc::vec::Vec;

use ahash::RandomState;
use hashbrown::HashMap;
use hermit_sync::SpinMutex;

use crate::pktdrv::ErrorKind;

static OPTIONS: SpinMutex<Option<Options>> = SpinMutex::new(None);

/// Forced link speed, `speed=` option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Speed {
	Mbps10,
	Mbps100,
	#[default]
	Auto,
}

#[derive(Debug, Default, Clone)]
pub struct Options {
	/// `io=` candidates, in probe order.
	pub io_bases: Vec<u16>,
	/// `irq=` assignments, positionally matching `io=`.
	pub irqs: Vec<u8>,
	/// `force_pio` disables DMA on every device.
	pub force_pio: bool,
	/// `force_busmaster` demands DMA and fails PIO-only silicon.
	pub force_busmaster: bool,
	/// `vec=` software-interrupt vector of the public entry point.
	pub vector: Option<u8>,
	/// `log_level=` threshold handed to the logger.
	pub log_level: Option<String>,
	/// `speed=` override.
	pub speed: Speed,
}

fn parse_num(s: &str) -> Option<u64> {
	if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
		u64::from_str_radix(hex, 16).ok()
	} else {
		s.parse().ok()
	}
}

fn parse_list<T>(s: &str, conv: impl Fn(u64) -> Option<T>) -> Option<Vec<T>> {
	s.split(',').map(|part| parse_num(part).and_then(&conv)).collect()
}

impl Options {
	fn parse(cmdline: &str) -> Result<Self, ErrorKind> {
		let words = shell_words::split(cmdline).map_err(|_| ErrorKind::Config)?;

		let mut vars = HashMap::<String, String, RandomState>::with_hasher(
			RandomState::with_seeds(0, 0, 0, 0),
		);
		let mut flags = Vec::new();
		for word in &words {
			match word.split_once('=') {
				Some((key, value)) => {
					vars.insert(key.into(), value.into());
				}
				None => flags.push(word.as_str()),
			}
		}
		debug!("option vars = {vars:?}, flags = {flags:?}");

		let mut options = Options {
			force_pio: flags.contains(&"force_pio"),
			force_busmaster: flags.contains(&"force_busmaster"),
			..Default::default()
		};
		if options.force_pio && options.force_busmaster {
			error!("force_pio and force_busmaster are mutually exclusive");
			return Err(ErrorKind::Config);
		}

		for (key, value) in &vars {
			match key.as_str() {
				"io" => {
					options.io_bases = parse_list(value, |n| u16::try_from(n).ok())
						.ok_or(ErrorKind::Config)?;
				}
				"irq" => {
					options.irqs = parse_list(value, |n| {
						u8::try_from(n).ok().filter(|irq| *irq < 16)
					})
					.ok_or(ErrorKind::Config)?;
				}
				"vec" => {
					options.vector = Some(
						parse_num(value)
							.and_then(|n| u8::try_from(n).ok())
							.ok_or(ErrorKind::Config)?,
					);
				}
				"log_level" => options.log_level = Some(value.clone()),
				"speed" => {
					options.speed = match value.as_str() {
						"10" => Speed::Mbps10,
						"100" => Speed::Mbps100,
						"auto" => Speed::Auto,
						_ => return Err(ErrorKind::Config),
					};
				}
				other => {
					warn!("ignoring unknown option {other}={value}");
				}
			}
		}

		Ok(options)
	}
}

/// Parses `cmdline` and publishes the result. Bring-up stage 3.
pub fn init(cmdline: &str) -> Result<(), ErrorKind> {
	let options = Options::parse(cmdline)?;
	*OPTIONS.lock() = Some(options);
	Ok(())
}

/// Drops the published options again. Stage-3 rollback.
pub fn shutdown() {
	*OPTIONS.lock() = None;
}

fn with<R>(f: impl FnOnce(&Options) -> R) -> R {
	let guard = OPTIONS.lock();
	f(guard.as_ref().expect("option parsing has not run"))
}

pub fn io_bases() -> Vec<u16> {
	with(|o| o.io_bases.clone())
}

pub fn irq_for(index: usize) -> Option<u8> {
	with(|o| o.irqs.get(index).copied())
}

pub fn is_forced_pio() -> bool {
	with(|o| o.force_pio)
}

pub fn is_forced_busmaster() -> bool {
	with(|o| o.force_busmaster)
}

pub fn vector() -> u8 {
	with(|o| o.vector.unwrap_or(crate::config::DEFAULT_PKT_VECTOR))
}

pub fn log_level() -> Option<String> {
	with(|o| o.log_level.clone())
}

pub fn speed() -> Speed {
	with(|o| o.speed)
}
