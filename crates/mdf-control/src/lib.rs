//! Control plane for the STM32MP25 MDF multi-function digital filter.
//!
//! The MDF turns sigma-delta bitstreams from external microphones and
//! sensors into decimated samples. This crate drives everything up to the
//! point where data flows: clock generation, serial interface bring-up,
//! per-filter pipeline configuration and the start/stop lifecycle,
//! including the synchronized start of interleave groups.
//!
//! Typical usage:
//!
//! 1. parse an [`MdfConfig`] from TOML,
//! 2. [`MdfDevice::probe`] the instance (identification check, clock and
//!    pipeline programming),
//! 3. drive the per-filter [`FilterInstance`] handles: `arm`, `start`,
//!    `stop`, and service interrupts through `handle_interrupt`.
//!
//! Sample transport (DMA, FIFO draining) is out of scope; this crate stops
//! at a running, interrupt-generating filter.

pub mod clock;
pub mod config;
pub mod device;
pub mod filter;
pub mod interleave;
pub mod sitf;

pub use clock::{ClockGenerator, RateLockOwner};
pub use config::MdfConfig;
pub use device::{MdfDevice, Version};
pub use filter::{FilterEvent, FilterEventHandler, FilterInstance, FilterState};
pub use interleave::InterleaveCoordinator;
pub use sitf::{SerialInterface, SitfMode};

pub use mdf_core::{MdfError, MdfResult, MmioBus, RegisterBus};
