//! Resident packet-driver core for the 3Com EtherLink III family.
//!
//! The crate multiplexes up to [`config::MAX_DEVICES`] EtherLink III
//! controllers (ISA PIO, ISA bus-master and the PCI Vortex/Boomerang/
//! Cyclone/Tornado generations) behind the Packet Driver Specification
//! function set. All hardware access flows through the [`bus::Bus`] seam,
//! so the same core drives real ports from a resident stub and simulated
//! chips from the test-suite.
//!
//! The public surface is small: [`install`] runs the staged bring-up,
//! [`uninstall`] tears everything down again, [`pktdrv::entry`] is the
//! function-code dispatcher behind the application software interrupt, and
//! [`irq::front_half`] is what the hardware-interrupt stub invokes.

#![warn(rust_2018_idioms)]
#![warn(unsafe_op_in_unsafe_fn)]
#![allow(clippy::missing_safety_doc)]
#![no_std]

#[macro_use]
extern crate alloc;
#[macro_use]
extern crate log;
#[cfg(not(target_os = "none"))]
#[macro_use]
extern crate std;

pub mod arch;
pub mod bus;
pub mod config;
pub mod dma;
pub mod drivers;
pub mod env;
pub mod irq;
pub mod lifecycle;
mod logging;
pub mod pktdrv;
pub mod stats;
pub mod synch;

pub use crate::bus::Bus;

pub use crate::lifecycle::{install, uninstall, InstallError};
pub use crate::pktdrv::{entry, Handle, PktError, Receiver, Request, Response};
