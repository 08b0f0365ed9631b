//! Core types for the MDF (multi-channel digital filter) control plane.
//!
//! This crate holds everything the control-plane crates share and nothing
//! else: the register map of the MDF peripheral, the [`RegisterBus`]
//! abstraction over memory-mapped access, the error taxonomy, and the
//! bounded status-bit polling helper.
//!
//! Policy (clock arbitration, lifecycle sequencing, interleave
//! coordination) lives in `mdf-control`; test doubles live in `mdf-mock`.

pub mod bus;
pub mod error;
pub mod poll;
pub mod regs;

pub use bus::{MmioBus, RegisterBus};
pub use error::{MdfError, MdfResult};
pub use poll::{poll_bit, PollBudget};
