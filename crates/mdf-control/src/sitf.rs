//! Serial interface (SITF) controller.
//!
//! One serial interface feeds bitstream samples to up to two filters (one
//! per signal edge), so start/stop is reference counted: the hardware is
//! programmed and enabled on the 0 -> 1 transition and disabled on the
//! 1 -> 0 transition, with everything in between a pure bookkeeping
//! operation. All state mutation happens under the per-interface lock to
//! serialize concurrent consumers.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, info};

use mdf_core::regs::{self, sitfcr};
use mdf_core::{poll_bit, MdfError, MdfResult, PollBudget, RegisterBus};

use crate::config::SitfSettings;

/// Bitstream framing mode of a serial interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SitfMode {
    /// SPI with a low-frequency serial clock.
    LfSpi = 0,
    /// SPI.
    Spi = 1,
    /// Manchester coding, rising edge is a 0.
    ManchesterRising = 2,
    /// Manchester coding, falling edge is a 0.
    ManchesterFalling = 3,
}

impl SitfMode {
    /// Value of the SITFCR.SITFMOD field.
    #[must_use]
    pub fn field(self) -> u32 {
        self as u32
    }

    /// Whether the mode carries Manchester-coded symbols.
    #[must_use]
    pub fn is_manchester(self) -> bool {
        matches!(self, Self::ManchesterRising | Self::ManchesterFalling)
    }
}

struct SitfState {
    refcnt: u32,
    /// Configuration image of SITFCR, without the enable bit.
    sitfcr: u32,
    /// Register backup captured by `save` for the next `restore`.
    backup: u32,
}

/// One bitstream serial input of the MDF instance.
pub struct SerialInterface {
    id: u32,
    mode: SitfMode,
    bus: Arc<dyn RegisterBus>,
    budget: PollBudget,
    state: Mutex<SitfState>,
}

impl SerialInterface {
    /// Build the controller for interface `settings.id`.
    pub fn new(bus: Arc<dyn RegisterBus>, settings: &SitfSettings) -> MdfResult<Self> {
        settings.validate()?;

        let mut sitfcr = regs::field_prep(sitfcr::SITFMOD, settings.mode.field())
            | regs::field_prep(sitfcr::SCKSRC, settings.clock_source);
        if let Some(threshold) = settings.manchester_threshold {
            sitfcr |= regs::field_prep(sitfcr::STH, threshold);
        }

        Ok(Self {
            id: settings.id,
            mode: settings.mode,
            bus,
            budget: PollBudget::default(),
            state: Mutex::new(SitfState {
                refcnt: 0,
                sitfcr,
                backup: sitfcr,
            }),
        })
    }

    /// Interface index.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Configured framing mode.
    #[must_use]
    pub fn mode(&self) -> SitfMode {
        self.mode
    }

    /// Current consumer reference count.
    #[must_use]
    pub fn refcount(&self) -> u32 {
        self.state.lock().refcnt
    }

    fn cr_offset(&self) -> u32 {
        regs::sitf_base(self.id) + sitfcr::OFFSET
    }

    /// Take a consumer reference; the first consumer programs and enables
    /// the interface and waits for it to report active.
    pub fn start(&self) -> MdfResult<()> {
        let mut state = self.state.lock();
        if state.refcnt == 0 {
            let value = state.sitfcr | sitfcr::SITFEN;
            self.bus.write(self.cr_offset(), value)?;
            if let Err(err) = poll_bit(
                self.bus.as_ref(),
                self.cr_offset(),
                sitfcr::SITFACTIVE,
                true,
                "serial interface active",
                self.budget,
            ) {
                self.bus.write(self.cr_offset(), state.sitfcr)?;
                return Err(err);
            }
            info!(sitf = self.id, mode = ?self.mode, "serial interface started");
        }
        state.refcnt += 1;
        debug!(sitf = self.id, refcnt = state.refcnt, "sitf reference taken");
        Ok(())
    }

    /// Drop a consumer reference; the last consumer disables the interface.
    ///
    /// A stop without a matching start is a caller programming error and
    /// fails with `InvalidState` without touching the hardware.
    pub fn stop(&self) -> MdfResult<()> {
        let mut state = self.state.lock();
        if state.refcnt == 0 {
            return Err(MdfError::InvalidState(
                "serial interface stop without matching start",
            ));
        }
        state.refcnt -= 1;
        debug!(sitf = self.id, refcnt = state.refcnt, "sitf reference dropped");
        if state.refcnt == 0 {
            self.bus.clear_bits(self.cr_offset(), sitfcr::SITFEN)?;
            info!(sitf = self.id, "serial interface stopped");
        }
        Ok(())
    }

    /// Capture the live SITFCR image ahead of a low-power transition.
    pub fn save(&self) -> MdfResult<()> {
        let mut state = self.state.lock();
        state.backup = self.bus.read(self.cr_offset())?;
        Ok(())
    }

    /// Reprogram SITFCR from the last `save`; waits for the active status
    /// when the saved image had the interface enabled.
    pub fn restore(&self) -> MdfResult<()> {
        let state = self.state.lock();
        self.bus.write(self.cr_offset(), state.backup)?;
        if state.backup & sitfcr::SITFEN != 0 {
            poll_bit(
                self.bus.as_ref(),
                self.cr_offset(),
                sitfcr::SITFACTIVE,
                true,
                "serial interface active",
                self.budget,
            )?;
        }
        debug!(sitf = self.id, "serial interface restored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdf_mock::MockBus;

    fn interface(bus: &Arc<MockBus>, id: u32) -> SerialInterface {
        SerialInterface::new(
            bus.clone() as Arc<dyn RegisterBus>,
            &SitfSettings {
                id,
                mode: SitfMode::Spi,
                clock_source: 1,
                manchester_threshold: None,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_refcounted_start_stop_toggles_enable_once() {
        let bus = Arc::new(MockBus::stm32mp25(2, 2));
        let sitf = interface(&bus, 0);
        let offset = regs::sitf_base(0);

        for _ in 0..3 {
            sitf.start().unwrap();
        }
        assert_eq!(sitf.refcount(), 3);
        assert_eq!(bus.writes_with_bits(offset, sitfcr::SITFEN), 1);
        assert_ne!(bus.raw(offset) & sitfcr::SITFACTIVE, 0);

        sitf.stop().unwrap();
        sitf.stop().unwrap();
        assert_ne!(bus.raw(offset) & sitfcr::SITFEN, 0);
        sitf.stop().unwrap();
        assert_eq!(bus.raw(offset) & sitfcr::SITFEN, 0);
    }

    #[test]
    fn test_stop_without_start_is_invalid_state() {
        let bus = Arc::new(MockBus::stm32mp25(2, 2));
        let sitf = interface(&bus, 1);
        let offset = regs::sitf_base(1);

        let err = sitf.stop().unwrap_err();
        assert!(matches!(err, MdfError::InvalidState(_)));
        assert_eq!(bus.write_count(offset), 0);
    }

    #[test]
    fn test_start_timeout_rolls_back_refcount_and_enable() {
        let bus = Arc::new(MockBus::stm32mp25(2, 2));
        let offset = regs::sitf_base(0);
        bus.set_stuck(offset, sitfcr::SITFACTIVE);

        let mut sitf = interface(&bus, 0);
        sitf.budget = PollBudget {
            attempts: 2,
            interval: std::time::Duration::ZERO,
        };

        let err = sitf.start().unwrap_err();
        assert!(matches!(err, MdfError::Timeout { .. }));
        assert_eq!(sitf.refcount(), 0);
        assert_eq!(bus.raw(offset) & sitfcr::SITFEN, 0);
    }

    #[test]
    fn test_save_restore_round_trips_register() {
        let bus = Arc::new(MockBus::stm32mp25(2, 2));
        let sitf = interface(&bus, 0);
        let offset = regs::sitf_base(0);

        sitf.start().unwrap();
        let before = bus.raw(offset);
        sitf.save().unwrap();

        // Low-power transition wipes the register.
        bus.preload(offset, 0);
        sitf.restore().unwrap();
        assert_eq!(bus.raw(offset), before);
    }

    #[test]
    fn test_manchester_threshold_programmed() {
        let bus = Arc::new(MockBus::stm32mp25(2, 2));
        let sitf = SerialInterface::new(
            bus.clone() as Arc<dyn RegisterBus>,
            &SitfSettings {
                id: 1,
                mode: SitfMode::ManchesterRising,
                clock_source: 0,
                manchester_threshold: Some(12),
            },
        )
        .unwrap();

        sitf.start().unwrap();
        let value = bus.raw(regs::sitf_base(1));
        assert_eq!(regs::field_get(sitfcr::STH, value), 12);
        assert_eq!(regs::field_get(sitfcr::SITFMOD, value), 2);
    }
}
