//! Digital filter instance controller.
//!
//! Each filter walks the lifecycle `Idle -> Configured -> Armed -> Running
//! -> Idle`. A start sequence acquires the shared resources in a fixed
//! order (serial interface reference, clock rate lock, clock enable,
//! filter enable) and releases everything it acquired on any failure, so a
//! failed start never leaves a half-started pipeline behind.
//!
//! Interrupt delivery enters through [`FilterInstance::handle_interrupt`]:
//! flags are acknowledged and forwarded to the registered
//! [`FilterEventHandler`] without changing filter state; whether to stop on
//! an error-class event is the consuming driver's decision.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use mdf_core::regs::{
    self, bsmxcr, dfltcicr, dfltcr, dfltintr, dfltirq, dfltrsfr, dlycr, oeccr, oldcr, oldthr,
    scdcr,
};
use mdf_core::{poll_bit, MdfError, MdfResult, PollBudget, RegisterBus};

use crate::clock::{ClockGenerator, RateLockOwner};
use crate::config::{FifoThreshold, FilterSettings, ReshapeDecimation};
use crate::interleave::InterleaveCoordinator;
use crate::sitf::SerialInterface;

/// Lifecycle state of a filter instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterState {
    /// No configuration written.
    Idle,
    /// Pipeline registers programmed, not armed.
    Configured,
    /// Waiting for a start (or, in a group, for the synchronized trigger).
    Armed,
    /// Consuming samples.
    Running,
}

/// Event reported by a filter interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterEvent {
    /// FIFO threshold reached; samples are ready to drain.
    DataThreshold,
    /// Output FIFO overran; samples were lost.
    DataOverrun,
    /// Snapshot data ready.
    SnapshotReady,
    /// A sample left the configured threshold band.
    OutOfLimit,
    /// Snapshot register overwritten before it was read.
    SnapshotOverrun,
    /// The short-circuit detector counter expired.
    ShortCircuit,
    /// The filter output saturated.
    Saturation,
    /// The serial clock disappeared.
    ClockAbsence,
    /// The reshape filter input overran.
    ReshapeOverrun,
}

impl FilterEvent {
    /// All events, in status-register bit order.
    pub const ALL: [FilterEvent; 9] = [
        FilterEvent::DataThreshold,
        FilterEvent::DataOverrun,
        FilterEvent::SnapshotReady,
        FilterEvent::OutOfLimit,
        FilterEvent::SnapshotOverrun,
        FilterEvent::ShortCircuit,
        FilterEvent::Saturation,
        FilterEvent::ClockAbsence,
        FilterEvent::ReshapeOverrun,
    ];

    /// DFLTIER/DFLTISR bit carrying this event.
    #[must_use]
    pub fn mask(self) -> u32 {
        match self {
            FilterEvent::DataThreshold => dfltirq::FTH,
            FilterEvent::DataOverrun => dfltirq::DOVR,
            FilterEvent::SnapshotReady => dfltirq::SSDR,
            FilterEvent::OutOfLimit => dfltirq::OLD,
            FilterEvent::SnapshotOverrun => dfltirq::SSOVR,
            FilterEvent::ShortCircuit => dfltirq::SCD,
            FilterEvent::Saturation => dfltirq::SAT,
            FilterEvent::ClockAbsence => dfltirq::CKAB,
            FilterEvent::ReshapeOverrun => dfltirq::RFOVR,
        }
    }
}

/// Consumer callback for filter events, invoked from interrupt context.
pub trait FilterEventHandler: Send + Sync {
    /// Called once per acknowledged event flag.
    fn on_event(&self, filter: u32, event: FilterEvent);
}

struct GroupLink {
    group: u32,
    coordinator: Weak<InterleaveCoordinator>,
}

struct FilterCtl {
    state: FilterState,
    /// DFLTCR configuration image (no enable/run/status bits).
    dfltcr: u32,
}

/// One digital filter pipeline of the MDF instance.
pub struct FilterInstance {
    id: u32,
    bus: Arc<dyn RegisterBus>,
    clock: Arc<ClockGenerator>,
    sitf: Arc<SerialInterface>,
    budget: PollBudget,
    ctl: Mutex<FilterCtl>,
    /// Last accepted configuration, replayed on resume.
    settings: Mutex<Option<FilterSettings>>,
    group: Mutex<Option<GroupLink>>,
    handler: Mutex<Option<Arc<dyn FilterEventHandler>>>,
}

impl FilterInstance {
    /// Build the controller for filter `id`, fed by `sitf`.
    pub fn new(
        bus: Arc<dyn RegisterBus>,
        clock: Arc<ClockGenerator>,
        sitf: Arc<SerialInterface>,
        id: u32,
    ) -> Self {
        Self {
            id,
            bus,
            clock,
            sitf,
            budget: PollBudget::default(),
            ctl: Mutex::new(FilterCtl {
                state: FilterState::Idle,
                dfltcr: 0,
            }),
            settings: Mutex::new(None),
            group: Mutex::new(None),
            handler: Mutex::new(None),
        }
    }

    /// Filter index.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> FilterState {
        self.ctl.lock().state
    }

    /// Serial interface this filter consumes.
    #[must_use]
    pub fn sitf(&self) -> &Arc<SerialInterface> {
        &self.sitf
    }

    /// Register the event consumer.
    pub fn set_event_handler(&self, handler: Arc<dyn FilterEventHandler>) {
        *self.handler.lock() = Some(handler);
    }

    /// Attach this filter to interleave group `group`. Done once at probe
    /// time, before the filter is handed to a consumer.
    pub(crate) fn attach_group(&self, group: u32, coordinator: &Arc<InterleaveCoordinator>) {
        *self.group.lock() = Some(GroupLink {
            group,
            coordinator: Arc::downgrade(coordinator),
        });
    }

    /// Interleave group this filter belongs to, if any.
    #[must_use]
    pub fn group(&self) -> Option<u32> {
        self.group.lock().as_ref().map(|link| link.group)
    }

    fn base(&self) -> u32 {
        regs::flt_base(self.id)
    }

    fn rate_lock_owner(&self) -> RateLockOwner {
        RateLockOwner::filter(self.id)
    }

    /// Program the whole pipeline from `settings`.
    ///
    /// Valid from `Idle` and `Configured`; everything is written with the
    /// filter disabled, so reconfiguring is always glitch-free.
    pub fn configure(&self, settings: &FilterSettings) -> MdfResult<()> {
        settings.validate()?;
        if settings.id != self.id {
            return Err(MdfError::InvalidParameter(format!(
                "settings for filter {} applied to filter {}",
                settings.id, self.id
            )));
        }
        if settings.sitf != self.sitf.id() {
            return Err(MdfError::InvalidParameter(format!(
                "settings route filter {} to serial interface {}, wired to {}",
                self.id,
                settings.sitf,
                self.sitf.id()
            )));
        }

        let mut ctl = self.ctl.lock();
        if !matches!(ctl.state, FilterState::Idle | FilterState::Configured) {
            return Err(MdfError::InvalidState(
                "filter must be idle to accept configuration",
            ));
        }

        let cr = self.program(settings)?;
        ctl.dfltcr = cr;
        ctl.state = FilterState::Configured;
        *self.settings.lock() = Some(settings.clone());
        info!(filter = self.id, "filter configured");
        Ok(())
    }

    /// Write the whole pipeline configuration; returns the DFLTCR image
    /// (enable bit clear).
    fn program(&self, settings: &FilterSettings) -> MdfResult<u32> {
        let base = self.base();
        self.bus.write(
            base + bsmxcr::OFFSET,
            regs::field_prep(bsmxcr::BSSEL, settings.bitstream_lane()),
        )?;

        self.bus.write(
            base + dfltcicr::OFFSET,
            regs::field_prep(dfltcicr::CICMOD, settings.cic.mode.field())
                | regs::field_prep(dfltcicr::MCICD, settings.cic.decimation - 1)
                | regs::field_prep(dfltcicr::SCALE, settings.cic.scale),
        )?;

        let mut rsfr = regs::field_prep(dfltrsfr::HPFC, settings.reshape.hpf_cutoff);
        if settings.reshape.bypass {
            rsfr |= dfltrsfr::RSFLTBYP;
        }
        if settings.reshape.decimation == ReshapeDecimation::By1 {
            rsfr |= dfltrsfr::RSFLTD;
        }
        if settings.reshape.hpf_bypass {
            rsfr |= dfltrsfr::HPFBYP;
        }
        self.bus.write(base + dfltrsfr::OFFSET, rsfr)?;

        let intr = settings.integrator.map_or(0, |integrator| {
            regs::field_prep(dfltintr::INTVAL, integrator.value - 1)
                | regs::field_prep(dfltintr::INTDIV, integrator.output_division)
        });
        self.bus.write(base + dfltintr::OFFSET, intr)?;

        if let Some(old) = &settings.old {
            self.bus.write(
                base + oldthr::LOW_OFFSET,
                (old.low as u32) & oldthr::OLDTH,
            )?;
            self.bus.write(
                base + oldthr::HIGH_OFFSET,
                (old.high as u32) & oldthr::OLDTH,
            )?;
            let mut value = oldcr::OLDEN
                | regs::field_prep(oldcr::BKOLD, old.break_mask)
                | regs::field_prep(oldcr::ACICN, old.cic_order)
                | regs::field_prep(oldcr::ACICD, old.cic_decimation);
            if old.in_band {
                value |= oldcr::THINB;
            }
            self.bus.write(base + oldcr::OFFSET, value)?;
        } else {
            self.bus.write(base + oldcr::OFFSET, 0)?;
        }

        let scd = settings.scd.map_or(0, |scd| {
            scdcr::SCDEN
                | regs::field_prep(scdcr::SCDT, scd.threshold - 1)
                | regs::field_prep(scdcr::BKSCD, scd.break_mask)
        });
        self.bus.write(base + scdcr::OFFSET, scd)?;

        self.bus.write(
            base + dlycr::OFFSET,
            regs::field_prep(dlycr::SKPDLY, settings.delay),
        )?;
        self.bus.write(
            base + oeccr::OFFSET,
            (settings.offset_compensation as u32) & oeccr::OFFSET_VALUE,
        )?;

        let mut cr = regs::field_prep(dfltcr::ACQMOD, settings.acquisition.field())
            | regs::field_prep(dfltcr::NBDIS, settings.discard);
        if settings.fifo_threshold == FifoThreshold::HalfFull {
            cr |= dfltcr::FTH;
        }
        self.bus.write(base + dfltcr::OFFSET, cr)?;
        Ok(cr)
    }

    /// Replay the accepted configuration after the register file lost its
    /// contents; a no-op for an unconfigured filter.
    pub(crate) fn reprogram(&self) -> MdfResult<()> {
        let ctl = self.ctl.lock();
        if ctl.state == FilterState::Idle {
            return Ok(());
        }
        let settings = self.settings.lock();
        if let Some(settings) = settings.as_ref() {
            self.program(settings)?;
            // The cached image carries any arm-time trigger routing.
            self.bus.write(self.base() + dfltcr::OFFSET, ctl.dfltcr)?;
            debug!(filter = self.id, "filter pipeline reprogrammed");
        }
        Ok(())
    }

    /// Arm the filter for start.
    ///
    /// Standalone filters become startable via [`FilterInstance::start`];
    /// group members notify their interleave coordinator, which fires the
    /// shared trigger once the whole group is armed.
    pub fn arm(&self) -> MdfResult<()> {
        let link = {
            let mut ctl = self.ctl.lock();
            if ctl.state != FilterState::Configured {
                return Err(MdfError::InvalidState("only a configured filter can arm"));
            }

            // Armed filters react to the global TRGO fan-out (trigger
            // source 0, rising edge), whether they start standalone or
            // with their group.
            ctl.dfltcr &= !(dfltcr::TRGSENS | dfltcr::TRGSRC);
            self.bus.write(self.base() + dfltcr::OFFSET, ctl.dfltcr)?;
            ctl.state = FilterState::Armed;

            let group = self.group.lock();
            group.as_ref().map(|link| (link.group, link.coordinator.clone()))
        };
        debug!(filter = self.id, "filter armed");

        if let Some((group, coordinator)) = link {
            let coordinator = coordinator.upgrade().ok_or(MdfError::InvalidState(
                "interleave coordinator dropped before arm",
            ))?;
            coordinator.notify_armed(group, self.id)?;
        }
        Ok(())
    }

    /// Start a standalone armed filter.
    ///
    /// Acquires the serial interface, the clock rate lock and a clock
    /// enable reference, then enables the filter and waits for it to
    /// report active. Any failure releases everything acquired and leaves
    /// the filter `Configured`.
    pub fn start(&self) -> MdfResult<()> {
        let mut ctl = self.ctl.lock();
        match ctl.state {
            FilterState::Running => {
                return Err(MdfError::InvalidState("filter is already running"))
            }
            FilterState::Armed => {}
            _ => return Err(MdfError::InvalidState("only an armed filter can start")),
        }
        if self.group.lock().is_some() {
            return Err(MdfError::InvalidState(
                "interleaved filter starts with its group",
            ));
        }

        self.sitf.start()?;

        if let Err(err) = self.clock.lock_rate(self.rate_lock_owner()) {
            self.rollback(&mut ctl, true, false, false);
            return Err(err);
        }
        if let Err(err) = self.clock.enable() {
            self.rollback(&mut ctl, true, true, false);
            return Err(err);
        }

        if let Err(err) = self.enable_hardware() {
            self.rollback(&mut ctl, true, true, true);
            return Err(err);
        }

        ctl.state = FilterState::Running;
        info!(filter = self.id, "filter running");
        Ok(())
    }

    /// Stop a running standalone filter and release its resources.
    pub fn stop(&self) -> MdfResult<()> {
        let mut ctl = self.ctl.lock();
        if ctl.state != FilterState::Running {
            return Err(MdfError::InvalidState("only a running filter can stop"));
        }
        if self.group.lock().is_some() {
            return Err(MdfError::InvalidState(
                "interleaved filter stops with its group",
            ));
        }

        let mut first_error = None;
        let mut note = |result: MdfResult<()>| {
            if let Err(err) = result {
                warn!(filter = self.id, %err, "error during filter stop");
                first_error.get_or_insert(err);
            }
        };

        note(self.disable_hardware(&ctl));
        note(self.sitf.stop());
        note(self.clock.disable());
        note(self.clock.unlock_rate(self.rate_lock_owner()));

        ctl.state = FilterState::Idle;
        info!(filter = self.id, "filter stopped");
        first_error.map_or(Ok(()), Err)
    }

    /// Release partially acquired resources after a failed start, leaving
    /// the filter `Configured`.
    fn rollback(&self, ctl: &mut FilterCtl, sitf: bool, rate: bool, clock: bool) {
        if clock {
            if let Err(err) = self.clock.disable() {
                warn!(filter = self.id, %err, "rollback: clock disable failed");
            }
        }
        if rate {
            if let Err(err) = self.clock.unlock_rate(self.rate_lock_owner()) {
                warn!(filter = self.id, %err, "rollback: rate unlock failed");
            }
        }
        if sitf {
            if let Err(err) = self.sitf.stop() {
                warn!(filter = self.id, %err, "rollback: sitf stop failed");
            }
        }
        ctl.state = FilterState::Configured;
    }

    fn enable_hardware(&self) -> MdfResult<()> {
        let offset = self.base() + dfltcr::OFFSET;
        self.bus.set_bits(offset, dfltcr::DFLTEN)?;
        if let Err(err) = poll_bit(
            self.bus.as_ref(),
            offset,
            dfltcr::DFLTACTIVE,
            true,
            "filter active",
            self.budget,
        ) {
            self.bus.clear_bits(offset, dfltcr::DFLTEN)?;
            return Err(err);
        }
        Ok(())
    }

    fn disable_hardware(&self, ctl: &FilterCtl) -> MdfResult<()> {
        // Writing the configuration image clears DFLTEN and DFLTRUN in one
        // store.
        self.bus.write(self.base() + dfltcr::OFFSET, ctl.dfltcr)
    }

    // ---- interleave group entry points (coordinator holds its own lock) ----

    /// Acquire the serial interface and enable the filter in
    /// trigger-sensitive mode; the filter starts consuming on TRGO.
    pub(crate) fn group_start(&self) -> MdfResult<()> {
        let mut ctl = self.ctl.lock();
        if ctl.state != FilterState::Armed {
            return Err(MdfError::InvalidState("group member is not armed"));
        }
        self.sitf.start()?;
        if let Err(err) = self.bus.set_bits(self.base() + dfltcr::OFFSET, dfltcr::DFLTEN) {
            self.rollback(&mut ctl, true, false, false);
            return Err(err);
        }
        Ok(())
    }

    /// Confirm the member went active after the group trigger.
    pub(crate) fn group_mark_running(&self) -> MdfResult<()> {
        let mut ctl = self.ctl.lock();
        poll_bit(
            self.bus.as_ref(),
            self.base() + dfltcr::OFFSET,
            dfltcr::DFLTACTIVE,
            true,
            "filter active",
            self.budget,
        )?;
        ctl.state = FilterState::Running;
        info!(filter = self.id, "filter running (interleaved)");
        Ok(())
    }

    /// Undo `group_start` after another member failed.
    pub(crate) fn group_abort(&self) {
        let mut ctl = self.ctl.lock();
        if let Err(err) = self.bus.clear_bits(self.base() + dfltcr::OFFSET, dfltcr::DFLTEN) {
            warn!(filter = self.id, %err, "group abort: disable failed");
        }
        if let Err(err) = self.sitf.stop() {
            warn!(filter = self.id, %err, "group abort: sitf stop failed");
        }
        ctl.state = FilterState::Configured;
    }

    /// Stop this member as part of a group teardown.
    pub(crate) fn group_stop(&self) -> MdfResult<()> {
        let mut ctl = self.ctl.lock();
        if ctl.state != FilterState::Running {
            return Err(MdfError::InvalidState("group member is not running"));
        }
        let mut first_error = None;
        if let Err(err) = self.disable_hardware(&ctl) {
            first_error.get_or_insert(err);
        }
        if let Err(err) = self.sitf.stop() {
            first_error.get_or_insert(err);
        }
        ctl.state = FilterState::Idle;
        first_error.map_or(Ok(()), Err)
    }

    /// Sever the group link after a leave; the filter becomes standalone.
    pub(crate) fn detach_group(&self) {
        *self.group.lock() = None;
    }

    /// Withdraw a pending arm, with no hardware side effects.
    pub(crate) fn disarm(&self) {
        let mut ctl = self.ctl.lock();
        if ctl.state == FilterState::Armed {
            ctl.state = FilterState::Configured;
        }
    }

    // ---- interrupts ----

    /// Enable interrupt generation for `events`.
    pub fn enable_interrupts(&self, events: &[FilterEvent]) -> MdfResult<()> {
        let mask = events.iter().fold(0, |acc, event| acc | event.mask());
        self.bus.set_bits(self.base() + dfltirq::IER_OFFSET, mask)
    }

    /// Disable interrupt generation for `events`.
    pub fn disable_interrupts(&self, events: &[FilterEvent]) -> MdfResult<()> {
        let mask = events.iter().fold(0, |acc, event| acc | event.mask());
        self.bus.clear_bits(self.base() + dfltirq::IER_OFFSET, mask)
    }

    /// Service the filter's interrupt line: acknowledge every raised flag
    /// and forward one event per flag to the registered handler.
    ///
    /// Never changes filter state; stopping on error-class events is the
    /// consuming driver's call.
    pub fn handle_interrupt(&self) -> MdfResult<()> {
        let isr_offset = self.base() + dfltirq::ISR_OFFSET;
        let flags = self.bus.read(isr_offset)? & dfltirq::ALL;
        if flags == 0 {
            return Ok(());
        }
        self.bus.write(isr_offset, flags)?;

        let handler = self.handler.lock().clone();
        for event in FilterEvent::ALL {
            if flags & event.mask() != 0 {
                debug!(filter = self.id, ?event, "filter event");
                if let Some(handler) = &handler {
                    handler.on_event(self.id, event);
                }
            }
        }
        Ok(())
    }
}
