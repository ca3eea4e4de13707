use core::fmt;

use hermit_sync::SpinMutex;
use log::{Level, LevelFilter, Metadata, Record};

/// Where formatted records go. The logging sink itself (serial port,
/// resident buffer, stderr of the test harness) is the embedder's
/// business; the core only formats and filters.
pub type Sink = fn(fmt::Arguments<'_>);

static SINK: SpinMutex<Option<Sink>> = SpinMutex::new(None);

/// Filters driver messages before they reach the sink.
struct DriverLogger;

impl log::Log for DriverLogger {
	fn enabled(&self, _metadata: &Metadata<'_>) -> bool {
		true
	}

	fn flush(&self) {}

	fn log(&self, record: &Record<'_>) {
		if self.enabled(record.metadata()) {
			if let Some(sink) = *SINK.lock() {
				sink(format_args!(
					"[el3pkt][{}] {}",
					ColorLevel(record.level()),
					record.args()
				));
			}
		}
	}
}

struct ColorLevel(Level);

impl fmt::Display for ColorLevel {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let level = self.0;
		let color = match level {
			Level::Trace => anstyle::AnsiColor::Magenta,
			Level::Debug => anstyle::AnsiColor::Blue,
			Level::Info => anstyle::AnsiColor::Green,
			Level::Warn => anstyle::AnsiColor::Yellow,
			Level::Error => anstyle::AnsiColor::Red,
		};
		let style = anstyle::Style::new().fg_color(Some(color.into()));
		write!(f, "{style}{level}{style:#}")
	}
}

/// Registers the logger with the `log` facade. Safe to call more than
/// once; later calls keep the first registration.
pub fn init() {
	let _ = log::set_logger(&DriverLogger);
	log::set_max_level(LevelFilter::Info);
}

/// Routes formatted records to `sink`.
pub fn set_sink(sink: Sink) {
	*SINK.lock() = Some(sink);
}

/// Applies the `log_level=` option once option parsing has run.
pub fn apply_level() {
	if let Some(level) = crate::env::log_level() {
		match level.parse::<LevelFilter>() {
			Ok(filter) => log::set_max_level(filter),
			Err(_) => warn!("unknown log_level {level:?}, keeping {}", log::max_level()),
		}
	}
}
