//! MDF instance probe and top-level device handle.
//!
//! [`MdfDevice::probe`] verifies the identification registers, validates
//! the configuration against the discovered hardware, programs the clock
//! generator and every filter pipeline, and wires the interleave groups.
//! The returned handle owns the shared controllers and hands out the
//! per-filter instances.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use mdf_core::regs::{self, gcr, hwcfgr, ipidr, verr};
use mdf_core::{MdfError, MdfResult, RegisterBus};

use crate::clock::ClockGenerator;
use crate::config::MdfConfig;
use crate::filter::{FilterInstance, FilterState};
use crate::interleave::InterleaveCoordinator;
use crate::sitf::SerialInterface;

/// Hardware revision read from VERR at probe time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    /// Major revision.
    pub major: u32,
    /// Minor revision.
    pub minor: u32,
}

/// One probed MDF instance.
pub struct MdfDevice {
    bus: Arc<dyn RegisterBus>,
    clock: Arc<ClockGenerator>,
    coordinator: Arc<InterleaveCoordinator>,
    serial_interfaces: Vec<Arc<SerialInterface>>,
    filters: Vec<Arc<FilterInstance>>,
    filter_count: u32,
    fifo_size: u32,
    version: Version,
}

impl MdfDevice {
    /// Probe the instance behind `bus` and bring it to the configured,
    /// stopped state.
    ///
    /// Fails with [`MdfError::HardwareFault`] when the identification
    /// register does not match the expected peripheral, and with a
    /// configuration error when `config` violates a hardware bound or
    /// references more filters than the instance has.
    pub fn probe(
        bus: Arc<dyn RegisterBus>,
        parent_hz: u64,
        config: &MdfConfig,
    ) -> MdfResult<Self> {
        let id = bus.read(ipidr::OFFSET)?;
        if id != regs::STM32MP25_IPIDR {
            return Err(MdfError::HardwareFault(format!(
                "unexpected peripheral id {id:#010x}, want {:#010x}",
                regs::STM32MP25_IPIDR
            )));
        }

        let hwcfg = bus.read(hwcfgr::OFFSET)?;
        let filter_count = regs::field_get(hwcfgr::NBF, hwcfg);
        let fifo_size = regs::field_get(hwcfgr::FIFO_SIZE, hwcfg);
        let ver = bus.read(verr::OFFSET)?;
        let version = Version {
            major: regs::field_get(verr::MAJREV, ver),
            minor: regs::field_get(verr::MINREV, ver),
        };
        info!(
            filters = filter_count,
            fifo_size,
            version.major,
            version.minor,
            "MDF instance identified"
        );

        config.validate(filter_count)?;

        let clock = Arc::new(ClockGenerator::new(bus.clone(), parent_hz));
        clock.configure(&config.clock)?;
        debug!(
            processing_hz = clock.processing_clock(),
            common_hz = clock.common_clock(),
            "clock generator configured"
        );

        let mut sitf_by_id: HashMap<u32, Arc<SerialInterface>> = HashMap::new();
        let mut serial_interfaces = Vec::new();
        for settings in &config.serial_interfaces {
            let sitf = Arc::new(SerialInterface::new(bus.clone(), settings)?);
            sitf_by_id.insert(settings.id, sitf.clone());
            serial_interfaces.push(sitf);
        }

        let capacities: Vec<usize> = config.interleave.iter().map(|g| g.filters.len()).collect();
        let coordinator = Arc::new(InterleaveCoordinator::new(
            bus.clone(),
            clock.clone(),
            &capacities,
        ));

        let mut filters = Vec::new();
        for settings in &config.filters {
            // validate() guarantees the reference resolves.
            let sitf = sitf_by_id
                .get(&settings.sitf)
                .ok_or_else(|| {
                    MdfError::Config(format!(
                        "filter {} references unknown serial interface {}",
                        settings.id, settings.sitf
                    ))
                })?
                .clone();
            let filter = Arc::new(FilterInstance::new(
                bus.clone(),
                clock.clone(),
                sitf,
                settings.id,
            ));
            if let Some(group) = config.group_of(settings.id) {
                coordinator.join(group, &filter)?;
            }
            filter.configure(settings)?;
            filters.push(filter);
        }

        program_ilvnb(bus.as_ref(), coordinator.member_count() as u32)?;

        Ok(Self {
            bus,
            clock,
            coordinator,
            serial_interfaces,
            filters,
            filter_count,
            fifo_size,
            version,
        })
    }

    /// Take a clock generator enable reference on behalf of an external
    /// consumer (a DMA engine or an auxiliary block clocked by the MDF).
    /// Filter starts take their own reference; pairs with
    /// [`MdfDevice::stop_core`].
    pub fn start_core(&self) -> MdfResult<()> {
        self.clock.enable()
    }

    /// Drop the enable reference taken by [`MdfDevice::start_core`].
    pub fn stop_core(&self) -> MdfResult<()> {
        self.clock.disable()
    }

    /// Fire the global trigger once. Trigger-sensitive standalone filters
    /// (window, snapshot, synchronous modes) react on the pulse.
    pub fn trigger(&self) -> MdfResult<()> {
        debug!("firing global trigger");
        self.bus.set_bits(gcr::OFFSET, gcr::TRGO)
    }

    /// Capture restorable state ahead of a power-down.
    ///
    /// Rejected while anything runs; the caller stops filters and groups
    /// first.
    pub fn suspend(&self) -> MdfResult<()> {
        if self
            .filters
            .iter()
            .any(|f| f.state() == FilterState::Running)
        {
            return Err(MdfError::InvalidState("a filter is running"));
        }
        for sitf in &self.serial_interfaces {
            sitf.save()?;
        }
        info!("device state captured for suspend");
        Ok(())
    }

    /// Reprogram everything captured by [`MdfDevice::suspend`] after the
    /// register file lost its contents.
    pub fn resume(&self) -> MdfResult<()> {
        self.clock.restore()?;
        for sitf in &self.serial_interfaces {
            sitf.restore()?;
        }
        for filter in &self.filters {
            filter.reprogram()?;
        }
        program_ilvnb(self.bus.as_ref(), self.coordinator.member_count() as u32)?;
        info!("device state restored after resume");
        Ok(())
    }

    /// Filter instance `id`, if configured.
    #[must_use]
    pub fn filter(&self, id: u32) -> Option<&Arc<FilterInstance>> {
        self.filters.iter().find(|f| f.id() == id)
    }

    /// Serial interface `id`, if configured.
    #[must_use]
    pub fn serial_interface(&self, id: u32) -> Option<&Arc<SerialInterface>> {
        self.serial_interfaces.iter().find(|s| s.id() == id)
    }

    /// All configured filter instances.
    #[must_use]
    pub fn filters(&self) -> &[Arc<FilterInstance>] {
        &self.filters
    }

    /// Shared clock generator manager.
    #[must_use]
    pub fn clock(&self) -> &Arc<ClockGenerator> {
        &self.clock
    }

    /// Interleave group coordinator.
    #[must_use]
    pub fn interleave(&self) -> &Arc<InterleaveCoordinator> {
        &self.coordinator
    }

    /// Number of digital filters the hardware reports.
    #[must_use]
    pub fn filter_count(&self) -> u32 {
        self.filter_count
    }

    /// Output FIFO depth in words.
    #[must_use]
    pub fn fifo_size(&self) -> u32 {
        self.fifo_size
    }

    /// Hardware revision.
    #[must_use]
    pub fn version(&self) -> Version {
        self.version
    }
}

fn program_ilvnb(bus: &dyn RegisterBus, interleaved: u32) -> MdfResult<()> {
    bus.update(
        gcr::OFFSET,
        gcr::ILVNB,
        regs::field_prep(gcr::ILVNB, interleaved),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdf_mock::MockBus;

    const SAMPLE: &str = r#"
        [clock]
        proc_divider = 4
        common_divider = 2
        cck0 = { enabled = true, direction = "output" }

        [[sitf]]
        id = 0
        mode = "spi"

        [[filter]]
        id = 0
        sitf = 0
        cic = { mode = "single-sinc4", decimation = 64, scale = 8 }

        [[filter]]
        id = 1
        sitf = 0
        edge = "falling"
        cic = { mode = "single-sinc4", decimation = 64, scale = 8 }

        [[interleave]]
        filters = [0, 1]
    "#;

    fn probe(bus: &Arc<MockBus>) -> MdfResult<MdfDevice> {
        let config = MdfConfig::from_toml_str(SAMPLE)?;
        MdfDevice::probe(bus.clone() as Arc<dyn RegisterBus>, 49_152_000, &config)
    }

    #[test]
    fn test_probe_identifies_and_configures() {
        let bus = Arc::new(MockBus::stm32mp25(4, 1));
        let device = probe(&bus).unwrap();

        assert_eq!(device.filter_count(), 4);
        assert_eq!(device.fifo_size(), 8);
        assert_eq!(device.version(), Version { major: 1, minor: 0 });
        assert_eq!(device.clock().processing_clock(), 49_152_000 / 4);

        assert_eq!(
            regs::field_get(gcr::ILVNB, bus.raw(gcr::OFFSET)),
            2
        );
        assert!(device.filter(0).is_some());
        assert!(device.filter(3).is_none());
        assert_eq!(device.filter(1).unwrap().group(), Some(0));
    }

    #[test]
    fn test_probe_rejects_wrong_peripheral() {
        let bus = Arc::new(MockBus::stm32mp25(4, 1));
        bus.preload(ipidr::OFFSET, 0x1234_5678);
        assert!(matches!(probe(&bus), Err(MdfError::HardwareFault(_))));
        // An unidentified instance is never written to.
        assert!(bus.write_log().is_empty());
    }

    #[test]
    fn test_core_clock_refcount() {
        let bus = Arc::new(MockBus::stm32mp25(4, 1));
        let device = probe(&bus).unwrap();

        device.start_core().unwrap();
        device.start_core().unwrap();
        assert_ne!(bus.raw(regs::ckgcr::OFFSET) & regs::ckgcr::CKGDEN, 0);
        device.stop_core().unwrap();
        assert_ne!(bus.raw(regs::ckgcr::OFFSET) & regs::ckgcr::CKGDEN, 0);
        device.stop_core().unwrap();
        assert_eq!(bus.raw(regs::ckgcr::OFFSET) & regs::ckgcr::CKGDEN, 0);
        assert!(matches!(
            device.stop_core(),
            Err(MdfError::InvalidState(_))
        ));
    }

    #[test]
    fn test_probe_rejects_filter_id_beyond_hardware() {
        let bus = Arc::new(MockBus::stm32mp25(1, 1));
        assert!(matches!(probe(&bus), Err(MdfError::Config(_))));
    }

    #[test]
    fn test_trigger_pulses_once() {
        let bus = Arc::new(MockBus::stm32mp25(4, 1));
        let device = probe(&bus).unwrap();

        device.trigger().unwrap();
        assert_eq!(bus.writes_with_bits(gcr::OFFSET, gcr::TRGO), 1);
        // The pulse bit never latches.
        assert_eq!(bus.raw(gcr::OFFSET) & gcr::TRGO, 0);
    }

    #[test]
    fn test_suspend_resume_round_trip() {
        let bus = Arc::new(MockBus::stm32mp25(4, 1));
        let device = probe(&bus).unwrap();
        device.suspend().unwrap();

        // Register file loses its contents across the power cycle.
        let ckgcr_before = bus.raw(regs::ckgcr::OFFSET);
        let sitfcr_offset = regs::sitf_base(0);
        let sitfcr_before = bus.raw(sitfcr_offset);
        let cicr_offset = regs::flt_base(0) + regs::dfltcicr::OFFSET;
        let cicr_before = bus.raw(cicr_offset);
        assert_ne!(cicr_before, 0);
        bus.preload(regs::ckgcr::OFFSET, 0);
        bus.preload(sitfcr_offset, 0);
        bus.preload(cicr_offset, 0);
        bus.preload(gcr::OFFSET, 0);

        device.resume().unwrap();
        assert_eq!(bus.raw(regs::ckgcr::OFFSET), ckgcr_before);
        assert_eq!(bus.raw(sitfcr_offset), sitfcr_before);
        // Configured filter pipelines come back without a reconfigure.
        assert_eq!(bus.raw(cicr_offset), cicr_before);
        assert_eq!(regs::field_get(gcr::ILVNB, bus.raw(gcr::OFFSET)), 2);
    }

    #[test]
    fn test_suspend_while_running_rejected() {
        let filters_only = r#"
            [clock]
            proc_divider = 4

            [[sitf]]
            id = 0
            mode = "spi"

            [[filter]]
            id = 0
            sitf = 0
            cic = { mode = "single-sinc4", decimation = 64, scale = 8 }
        "#;
        let bus = Arc::new(MockBus::stm32mp25(4, 1));
        let config = MdfConfig::from_toml_str(filters_only).unwrap();
        let device =
            MdfDevice::probe(bus.clone() as Arc<dyn RegisterBus>, 49_152_000, &config).unwrap();

        let filter = device.filter(0).unwrap();
        filter.arm().unwrap();
        filter.start().unwrap();
        assert!(matches!(device.suspend(), Err(MdfError::InvalidState(_))));

        filter.stop().unwrap();
        device.suspend().unwrap();
    }
}
