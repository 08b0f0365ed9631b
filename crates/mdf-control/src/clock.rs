//! Clock generator manager.
//!
//! The clock generator is the one hardware resource every filter and serial
//! interface depends on: it derives the processing clock from the parent
//! kernel clock and drives the CCK0/CCK1 divider chains feeding external
//! sensors. Reconfiguring it while an acquisition runs corrupts sample
//! timing for every filter at once, so all rate-affecting entry points are
//! arbitrated here:
//!
//! - [`ClockGenerator::configure`] is refused while the generator is
//!   enabled or rate-locked,
//! - [`ClockGenerator::lock_rate`] hands out an exclusive, owner-token
//!   rate lock that each start sequence must take before enabling a filter,
//! - enable/disable is reference counted so interleave groups and
//!   standalone filters share the CKGDEN bit without fighting over it.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use mdf_core::regs::{self, ckgcr};
use mdf_core::{poll_bit, MdfError, MdfResult, PollBudget, RegisterBus};

use crate::config::{ClockSettings, TriggerSensitivity};

/// Identity of a rate-lock holder.
///
/// The lock is reentrant for the same owner: an interleave group locks once
/// with its group token and the nested per-member sequences reuse it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLockOwner(u32);

impl RateLockOwner {
    /// Token for a standalone filter.
    #[must_use]
    pub fn filter(id: u32) -> Self {
        Self(id)
    }

    /// Token for an interleave group.
    #[must_use]
    pub fn group(id: u32) -> Self {
        Self(0x8000_0000 | id)
    }
}

struct CkgState {
    /// Last programmed CKGCR image, without the enable bit.
    ckgcr: u32,
    proc_divider: u32,
    common_divider: u32,
    enable_refs: u32,
    rate_lock: Option<(RateLockOwner, u32)>,
}

/// Owner of the shared clock generator block.
pub struct ClockGenerator {
    bus: Arc<dyn RegisterBus>,
    parent_hz: u64,
    budget: PollBudget,
    state: Mutex<CkgState>,
}

impl ClockGenerator {
    /// Manage the clock generator of the instance behind `bus`, fed by a
    /// parent kernel clock of `parent_hz`.
    pub fn new(bus: Arc<dyn RegisterBus>, parent_hz: u64) -> Self {
        Self {
            bus,
            parent_hz,
            budget: PollBudget::default(),
            state: Mutex::new(CkgState {
                ckgcr: 0,
                proc_divider: 1,
                common_divider: 1,
                enable_refs: 0,
                rate_lock: None,
            }),
        }
    }

    fn compose(settings: &ClockSettings) -> u32 {
        let mut value = 0;
        if settings.cck0.enabled {
            value |= ckgcr::CCK0EN;
        }
        if settings.cck1.enabled {
            value |= ckgcr::CCK1EN;
        }
        if matches!(settings.cck0.direction, crate::config::CckDirection::Output) {
            value |= ckgcr::CCK0DIR;
        }
        if matches!(settings.cck1.direction, crate::config::CckDirection::Output) {
            value |= ckgcr::CCK1DIR;
        }
        if settings.shared_mode {
            value |= ckgcr::CKGMOD;
        }
        if settings.trigger_sensitivity == TriggerSensitivity::Falling {
            value |= ckgcr::TRGSENS;
        }
        value |= regs::field_prep(ckgcr::TRGSRC, settings.trigger_source);
        value |= regs::field_prep(ckgcr::CCKDIV, settings.common_divider - 1);
        value |= regs::field_prep(ckgcr::PROCDIV, settings.proc_divider - 1);
        value
    }

    /// Program the divider chains and trigger routing.
    ///
    /// Fails with `InvalidParameter` on out-of-range dividers and with
    /// `Busy` while the generator is enabled or rate-locked; neither
    /// failure touches the hardware or the rate-lock state.
    pub fn configure(&self, settings: &ClockSettings) -> MdfResult<()> {
        settings.validate()?;

        let mut state = self.state.lock();
        if state.rate_lock.is_some() {
            return Err(MdfError::Busy("clock generator is rate-locked"));
        }
        if state.enable_refs > 0 {
            return Err(MdfError::Busy("clock generator is enabled"));
        }

        let value = Self::compose(settings);
        self.bus.write(ckgcr::OFFSET, value)?;
        state.ckgcr = value;
        state.proc_divider = settings.proc_divider;
        state.common_divider = settings.common_divider;
        debug!(
            ckgcr = format_args!("{value:#010x}"),
            proc_divider = settings.proc_divider,
            common_divider = settings.common_divider,
            "clock generator configured"
        );
        Ok(())
    }

    /// Take an enable reference; the first reference sets CKGDEN and waits
    /// for the generator to report active.
    pub fn enable(&self) -> MdfResult<()> {
        let mut state = self.state.lock();
        if state.enable_refs == 0 {
            self.bus
                .write(ckgcr::OFFSET, state.ckgcr | ckgcr::CKGDEN)?;
            if let Err(err) = self.wait_active() {
                self.bus.write(ckgcr::OFFSET, state.ckgcr)?;
                return Err(err);
            }
            info!("clock generator enabled");
        }
        state.enable_refs += 1;
        Ok(())
    }

    /// Drop an enable reference; the last reference clears CKGDEN.
    pub fn disable(&self) -> MdfResult<()> {
        let mut state = self.state.lock();
        if state.enable_refs == 0 {
            return Err(MdfError::InvalidState("clock generator is not enabled"));
        }
        state.enable_refs -= 1;
        if state.enable_refs == 0 {
            self.bus.write(ckgcr::OFFSET, state.ckgcr)?;
            info!("clock generator disabled");
        }
        Ok(())
    }

    /// Acquire the exclusive rate lock for `owner`.
    ///
    /// Reentrant for the same owner; fails with `Busy` when held by a
    /// different owner.
    pub fn lock_rate(&self, owner: RateLockOwner) -> MdfResult<()> {
        let mut state = self.state.lock();
        match &mut state.rate_lock {
            None => {
                state.rate_lock = Some((owner, 1));
                debug!(?owner, "rate lock acquired");
                Ok(())
            }
            Some((holder, depth)) if *holder == owner => {
                *depth += 1;
                Ok(())
            }
            Some(_) => Err(MdfError::Busy("clock rate is locked by another owner")),
        }
    }

    /// Release one rate-lock reference held by `owner`.
    ///
    /// A no-op when the lock is free; fails with `InvalidState` when the
    /// lock belongs to a different owner.
    pub fn unlock_rate(&self, owner: RateLockOwner) -> MdfResult<()> {
        let mut state = self.state.lock();
        match &mut state.rate_lock {
            None => Ok(()),
            Some((holder, _)) if *holder != owner => {
                Err(MdfError::InvalidState("rate lock held by another owner"))
            }
            Some((_, depth)) => {
                *depth -= 1;
                if *depth == 0 {
                    state.rate_lock = None;
                    debug!(?owner, "rate lock released");
                }
                Ok(())
            }
        }
    }

    /// Whether the rate lock is currently held.
    #[must_use]
    pub fn is_rate_locked(&self) -> bool {
        self.state.lock().rate_lock.is_some()
    }

    /// Effective processing clock frequency in Hz.
    #[must_use]
    pub fn processing_clock(&self) -> u64 {
        let state = self.state.lock();
        self.parent_hz / u64::from(state.proc_divider)
    }

    /// Effective common clock (CCK output) frequency in Hz.
    #[must_use]
    pub fn common_clock(&self) -> u64 {
        let state = self.state.lock();
        self.parent_hz / u64::from(state.proc_divider) / u64::from(state.common_divider)
    }

    /// Reprogram the generator from cached state after a low-power
    /// transition. Must run before any filter restart.
    pub fn restore(&self) -> MdfResult<()> {
        let state = self.state.lock();
        if state.enable_refs > 0 {
            self.bus
                .write(ckgcr::OFFSET, state.ckgcr | ckgcr::CKGDEN)?;
            self.wait_active()?;
        } else {
            self.bus.write(ckgcr::OFFSET, state.ckgcr)?;
        }
        info!("clock generator restored");
        Ok(())
    }

    fn wait_active(&self) -> MdfResult<()> {
        poll_bit(
            self.bus.as_ref(),
            ckgcr::OFFSET,
            ckgcr::CKGACTIVE,
            true,
            "clock generator active",
            self.budget,
        )
        .map_err(|_| {
            MdfError::HardwareFault("clock generator did not report active".into())
        })
    }
}
