//! Architecture-specific primitives.
//!
//! Everything the core needs from the CPU itself: interrupt-flag gating,
//! cache maintenance, and the capability probe feeding the DMA policy
//! engine. Bare x86_64 builds execute the real instructions; hosted builds
//! model the interrupt flag so the test-suite can drive the interrupt path
//! and still observe the gating discipline.

pub mod cache;
pub mod cpu;
pub mod irq;
