//! Compile-time tunables of the driver core.

#![allow(dead_code)]

/// Upper bound on simultaneously attached controllers.
pub const MAX_DEVICES: usize = 8;

/// Upper bound on concurrently registered frame-type handles.
pub const MAX_HANDLES: usize = 16;

/// Longest frame accepted from or delivered to an application,
/// Ethernet header included, FCS excluded.
pub const MTU: usize = 1514;

/// Shortest frame accepted from an application (a bare Ethernet header).
pub const MIN_FRAME: usize = 14;

/// Receive-ring entries on descriptor-based back-ends.
pub const RX_RING_SIZE: usize = 32;

/// Transmit-ring entries on descriptor-based back-ends.
pub const TX_RING_SIZE: usize = 16;

/// Receive-ring refill low-water mark; a drain pass that leaves fewer
/// device-owned buffers than this triggers an immediate refill.
pub const RX_RING_LOW_WATER: usize = 8;

/// Slots in the global bounce-buffer pool.
pub const BOUNCE_POOL_SLOTS: usize = 32;

/// Size of one bounce-pool slot. Covers a maximum frame plus slack so a
/// slot never has to span a 64 KiB physical boundary.
pub const BOUNCE_BUF_SIZE: usize = 1536;

/// Capacity of the deferred cache-operation queue filled from interrupt
/// context and drained at the outermost interrupt exit.
pub const DEFERRED_CACHE_OPS: usize = 16;

/// Private stack for the interrupt front half.
pub const IRQ_STACK_SIZE: usize = 2048;

/// Default software-interrupt vector of the application entry point.
pub const DEFAULT_PKT_VECTOR: u8 = 0x60;

/// Channel-0 PIT input clock in Hz; all hardware-wait budgets count these.
pub const PIT_HZ: u64 = 1_193_182;

/// Budget for reset/command/status waits (about 100 ms).
pub const HW_TIMEOUT_TICKS: u64 = PIT_HZ / 10;

/// Budget for a single EEPROM word read (the parts settle in 162 us).
pub const EEPROM_TIMEOUT_TICKS: u64 = PIT_HZ / 4096;

/// Transmit retries after a collision-class error before the frame is
/// dropped. Underrun and jabber errors are never retried.
pub const TX_COLLISION_RETRIES: u8 = 3;

/// Reported driver version word (Packet Driver Specification v1.11).
pub const DRIVER_VERSION: u16 = 0x0111;
