//! TOML configuration schema for an MDF instance.
//!
//! The configuration describes the static, board-level facts a device tree
//! would provide: clock generator settings, the serial interfaces wired to
//! microphones or sensors, per-filter pipeline parameters, and interleave
//! group membership.
//!
//! # Schema structure
//!
//! ```toml
//! [clock]            # Clock generator dividers, outputs, trigger routing
//! [[sitf]]           # One table per serial interface
//! [[filter]]         # One table per digital filter
//! [[interleave]]     # One table per interleave group
//! ```
//!
//! # Example
//!
//! ```toml
//! [clock]
//! proc_divider = 4
//! common_divider = 2
//! cck0 = { enabled = true, direction = "output" }
//!
//! [[sitf]]
//! id = 0
//! mode = "spi"
//!
//! [[filter]]
//! id = 0
//! sitf = 0
//! cic = { mode = "single-sinc4", decimation = 64, scale = 8 }
//!
//! [[filter]]
//! id = 1
//! sitf = 0
//! edge = "falling"
//! cic = { mode = "single-sinc4", decimation = 64, scale = 8 }
//!
//! [[interleave]]
//! filters = [0, 1]
//! ```
//!
//! Values that parse correctly may still violate hardware bounds; call
//! [`MdfConfig::validate`] before handing the configuration to
//! [`MdfDevice::probe`](crate::device::MdfDevice::probe) (probe does so
//! itself).

use std::collections::HashSet;

use serde::Deserialize;

use mdf_core::regs::{CCKDIV_MAX, MCICD_MIN, PROCDIV_MAX};
use mdf_core::{MdfError, MdfResult};

use crate::sitf::SitfMode;

/// Largest signed value of a 26-bit threshold or offset field.
const FIELD26_MAX: i32 = (1 << 25) - 1;
/// Smallest signed value of a 26-bit threshold or offset field.
const FIELD26_MIN: i32 = -(1 << 25);
/// Number of serial interface register windows per instance.
const SITF_WINDOWS: u32 = 8;

fn default_divider() -> u32 {
    1
}

/// Complete configuration for one MDF instance.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MdfConfig {
    /// Clock generator settings.
    pub clock: ClockSettings,

    /// Serial interfaces feeding bitstreams into the instance.
    #[serde(default, rename = "sitf")]
    pub serial_interfaces: Vec<SitfSettings>,

    /// Digital filter pipelines.
    #[serde(default, rename = "filter")]
    pub filters: Vec<FilterSettings>,

    /// Interleave groups (each a set of filter ids started in lock-step).
    #[serde(default, rename = "interleave")]
    pub interleave: Vec<InterleaveSettings>,
}

impl MdfConfig {
    /// Parse a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> MdfResult<Self> {
        toml::from_str(text).map_err(|e| MdfError::Config(e.to_string()))
    }

    /// Validate every bound and cross-reference against an instance with
    /// `filter_count` digital filters.
    pub fn validate(&self, filter_count: u32) -> MdfResult<()> {
        self.clock.validate()?;

        let mut sitf_ids = HashSet::new();
        for sitf in &self.serial_interfaces {
            sitf.validate()?;
            if !sitf_ids.insert(sitf.id) {
                return Err(MdfError::Config(format!(
                    "duplicate serial interface id {}",
                    sitf.id
                )));
            }
        }

        let mut filter_ids = HashSet::new();
        for filter in &self.filters {
            filter.validate()?;
            if filter.id >= filter_count {
                return Err(MdfError::Config(format!(
                    "filter id {} exceeds instance filter count {}",
                    filter.id, filter_count
                )));
            }
            if !filter_ids.insert(filter.id) {
                return Err(MdfError::Config(format!("duplicate filter id {}", filter.id)));
            }
            if !sitf_ids.contains(&filter.sitf) {
                return Err(MdfError::Config(format!(
                    "filter {} references unknown serial interface {}",
                    filter.id, filter.sitf
                )));
            }
        }

        let mut interleaved = HashSet::new();
        for (index, group) in self.interleave.iter().enumerate() {
            if group.filters.len() < 2 {
                return Err(MdfError::InvalidParameter(format!(
                    "interleave group {index} needs at least 2 filters"
                )));
            }
            for id in &group.filters {
                if !filter_ids.contains(id) {
                    return Err(MdfError::Config(format!(
                        "interleave group {index} references unknown filter {id}"
                    )));
                }
                if !interleaved.insert(*id) {
                    return Err(MdfError::Config(format!(
                        "filter {id} appears in more than one interleave group"
                    )));
                }
            }
        }
        if interleaved.len() > 15 {
            return Err(MdfError::InvalidParameter(format!(
                "{} interleaved filters exceed the 15 supported by GCR.ILVNB",
                interleaved.len()
            )));
        }

        Ok(())
    }

    /// Interleave group index containing `filter_id`, if any.
    #[must_use]
    pub fn group_of(&self, filter_id: u32) -> Option<u32> {
        self.interleave
            .iter()
            .position(|g| g.filters.contains(&filter_id))
            .map(|index| index as u32)
    }
}

// =============================================================================
// Clock generator
// =============================================================================

/// Trigger edge sensitivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TriggerSensitivity {
    /// React on the rising edge (reset value).
    #[default]
    Rising,
    /// React on the falling edge.
    Falling,
}

/// Direction of a CCK pad.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CckDirection {
    /// The pad drives the divided common clock out to the sensor.
    #[default]
    Output,
    /// The pad receives an external clock.
    Input,
}

/// One common-clock divider chain (CCK0 or CCK1).
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CckSettings {
    /// Enable the divider chain.
    #[serde(default)]
    pub enabled: bool,
    /// Pad direction.
    #[serde(default)]
    pub direction: CckDirection,
}

/// Clock generator settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClockSettings {
    /// Processing clock divider, 1..=512.
    #[serde(default = "default_divider")]
    pub proc_divider: u32,

    /// Common clock divider, 1..=16.
    #[serde(default = "default_divider")]
    pub common_divider: u32,

    /// CCK0 divider chain.
    #[serde(default)]
    pub cck0: CckSettings,

    /// CCK1 divider chain.
    #[serde(default)]
    pub cck1: CckSettings,

    /// Shared clock generator mode (both CCK chains share one divider).
    #[serde(default)]
    pub shared_mode: bool,

    /// Trigger source selector, 0..=15 (0 is the global TRGO).
    #[serde(default)]
    pub trigger_source: u32,

    /// Trigger edge sensitivity.
    #[serde(default)]
    pub trigger_sensitivity: TriggerSensitivity,
}

impl ClockSettings {
    /// Check divider and trigger bounds.
    pub fn validate(&self) -> MdfResult<()> {
        if self.proc_divider == 0 || self.proc_divider > PROCDIV_MAX {
            return Err(MdfError::InvalidParameter(format!(
                "processing clock divider {} outside 1..={PROCDIV_MAX}",
                self.proc_divider
            )));
        }
        if self.common_divider == 0 || self.common_divider > CCKDIV_MAX {
            return Err(MdfError::InvalidParameter(format!(
                "common clock divider {} outside 1..={CCKDIV_MAX}",
                self.common_divider
            )));
        }
        if self.trigger_source > 15 {
            return Err(MdfError::InvalidParameter(format!(
                "trigger source {} outside 0..=15",
                self.trigger_source
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Serial interfaces
// =============================================================================

/// Static settings of one serial interface.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SitfSettings {
    /// Interface index (register window select).
    pub id: u32,

    /// Bitstream framing mode.
    pub mode: SitfMode,

    /// Serial clock source selector, 0..=3.
    #[serde(default)]
    pub clock_source: u32,

    /// Manchester symbol threshold, 0..=31. Only meaningful for the
    /// Manchester modes.
    #[serde(default)]
    pub manchester_threshold: Option<u32>,
}

impl SitfSettings {
    /// Check field bounds and mode consistency.
    pub fn validate(&self) -> MdfResult<()> {
        if self.id >= SITF_WINDOWS {
            return Err(MdfError::InvalidParameter(format!(
                "serial interface id {} outside 0..={}",
                self.id,
                SITF_WINDOWS - 1
            )));
        }
        if self.clock_source > 3 {
            return Err(MdfError::InvalidParameter(format!(
                "serial clock source {} outside 0..=3",
                self.clock_source
            )));
        }
        match self.manchester_threshold {
            Some(threshold) if !self.mode.is_manchester() => {
                Err(MdfError::InvalidParameter(format!(
                    "manchester threshold {threshold} set on a {:?} interface",
                    self.mode
                )))
            }
            Some(threshold) if threshold > 31 => Err(MdfError::InvalidParameter(format!(
                "manchester threshold {threshold} outside 0..=31"
            ))),
            _ => Ok(()),
        }
    }
}

// =============================================================================
// Digital filters
// =============================================================================

/// Which edge of the interface bitstream the filter consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BitstreamEdge {
    /// Sample on the rising edge lane.
    #[default]
    Rising,
    /// Sample on the falling edge lane.
    Falling,
}

/// CIC filter arrangement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CicMode {
    /// Split: two cascaded filters, main CIC order 2.
    SplitSinc2 = 0,
    /// Split: two cascaded filters, main CIC order 3.
    SplitSinc3 = 1,
    /// Split: two cascaded filters, main CIC order 4.
    SplitSinc4 = 2,
    /// Split: two cascaded filters, main CIC order 5.
    SplitSinc5 = 3,
    /// Single sinc4 filter.
    SingleSinc4 = 4,
    /// Single sinc5 filter.
    SingleSinc5 = 5,
}

impl CicMode {
    /// Value of the DFLTCICR.CICMOD field.
    #[must_use]
    pub fn field(self) -> u32 {
        self as u32
    }
}

/// CIC decimation stage settings.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CicSettings {
    /// Filter arrangement.
    pub mode: CicMode,
    /// Main decimation factor, 2..=512.
    pub decimation: u32,
    /// Output scale, 0..=63.
    #[serde(default)]
    pub scale: u32,
}

/// Reshape filter decimation ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReshapeDecimation {
    /// Decimate by 4 (reset value).
    #[default]
    By4,
    /// Decimate by 1.
    By1,
}

/// Reshape filter stage settings.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReshapeSettings {
    /// Bypass the reshape filter entirely.
    #[serde(default)]
    pub bypass: bool,
    /// Reshape decimation ratio.
    #[serde(default)]
    pub decimation: ReshapeDecimation,
    /// Bypass the high-pass filter.
    #[serde(default)]
    pub hpf_bypass: bool,
    /// High-pass cutoff selector, 0..=3.
    #[serde(default)]
    pub hpf_cutoff: u32,
}

/// Integrator stage settings.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IntegratorSettings {
    /// Samples accumulated per output, 1..=128.
    pub value: u32,
    /// Output division selector, 0..=3.
    #[serde(default)]
    pub output_division: u32,
}

/// Out-of-limit detector settings.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OldSettings {
    /// Low threshold, signed 26-bit.
    pub low: i32,
    /// High threshold, signed 26-bit.
    pub high: i32,
    /// Flag samples inside the band instead of outside.
    #[serde(default)]
    pub in_band: bool,
    /// Break signal routing mask, 0..=15.
    #[serde(default)]
    pub break_mask: u32,
    /// Auxiliary CIC order selector, 0..=3.
    #[serde(default)]
    pub cic_order: u32,
    /// Auxiliary CIC decimation, 0..=31.
    #[serde(default)]
    pub cic_decimation: u32,
}

/// Short-circuit detector settings.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScdSettings {
    /// Identical-sample count that flags a short, 1..=256.
    pub threshold: u32,
    /// Break signal routing mask, 0..=15.
    #[serde(default)]
    pub break_mask: u32,
}

/// Acquisition mode of a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AcquisitionMode {
    /// Free-running continuous acquisition.
    #[default]
    AsynchronousContinuous = 0,
    /// Single shot, started by software.
    AsynchronousSingleShot = 1,
    /// Continuous, started by trigger.
    SynchronousContinuous = 2,
    /// Single shot, started by trigger.
    SynchronousSingleShot = 3,
    /// Window acquisition gated by the trigger level.
    WindowContinuous = 4,
    /// Snapshot on trigger.
    Snapshot = 5,
}

impl AcquisitionMode {
    /// Value of the DFLTCR.ACQMOD field.
    #[must_use]
    pub fn field(self) -> u32 {
        self as u32
    }
}

/// FIFO interrupt threshold select.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FifoThreshold {
    /// Raise the threshold event when the FIFO is not empty.
    #[default]
    NotEmpty,
    /// Raise the threshold event when the FIFO is half full.
    HalfFull,
}

/// Static settings of one digital filter pipeline.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilterSettings {
    /// Filter index (register window select).
    pub id: u32,

    /// Serial interface feeding this filter.
    pub sitf: u32,

    /// Bitstream lane within the interface.
    #[serde(default)]
    pub edge: BitstreamEdge,

    /// CIC decimation stage.
    pub cic: CicSettings,

    /// Reshape filter stage.
    #[serde(default)]
    pub reshape: ReshapeSettings,

    /// Integrator stage; absent means bypassed.
    #[serde(default)]
    pub integrator: Option<IntegratorSettings>,

    /// Out-of-limit detector; absent means disabled.
    #[serde(default)]
    pub old: Option<OldSettings>,

    /// Short-circuit detector; absent means disabled.
    #[serde(default)]
    pub scd: Option<ScdSettings>,

    /// Bitstream skip delay in sample clocks, 0..=127.
    #[serde(default)]
    pub delay: u32,

    /// Offset error compensation, signed 26-bit.
    #[serde(default)]
    pub offset_compensation: i32,

    /// Acquisition mode.
    #[serde(default)]
    pub acquisition: AcquisitionMode,

    /// Samples discarded after start, 0..=255.
    #[serde(default)]
    pub discard: u32,

    /// FIFO interrupt threshold.
    #[serde(default)]
    pub fifo_threshold: FifoThreshold,
}

impl FilterSettings {
    /// Bitstream matrix lane selected by this filter.
    #[must_use]
    pub fn bitstream_lane(&self) -> u32 {
        self.sitf * 2
            + match self.edge {
                BitstreamEdge::Rising => 0,
                BitstreamEdge::Falling => 1,
            }
    }

    /// Check every field bound (cross-references are checked by
    /// [`MdfConfig::validate`]).
    pub fn validate(&self) -> MdfResult<()> {
        if self.cic.decimation < MCICD_MIN || self.cic.decimation > 512 {
            return Err(MdfError::InvalidParameter(format!(
                "CIC decimation {} outside {MCICD_MIN}..=512",
                self.cic.decimation
            )));
        }
        if self.cic.scale > 63 {
            return Err(MdfError::InvalidParameter(format!(
                "CIC scale {} outside 0..=63",
                self.cic.scale
            )));
        }
        if self.reshape.hpf_cutoff > 3 {
            return Err(MdfError::InvalidParameter(format!(
                "HPF cutoff {} outside 0..=3",
                self.reshape.hpf_cutoff
            )));
        }
        if let Some(integrator) = &self.integrator {
            if integrator.value == 0 || integrator.value > 128 {
                return Err(MdfError::InvalidParameter(format!(
                    "integrator value {} outside 1..=128",
                    integrator.value
                )));
            }
            if integrator.output_division > 3 {
                return Err(MdfError::InvalidParameter(format!(
                    "integrator output division {} outside 0..=3",
                    integrator.output_division
                )));
            }
        }
        if let Some(old) = &self.old {
            if old.low > old.high {
                return Err(MdfError::InvalidParameter(format!(
                    "out-of-limit low threshold {} above high threshold {}",
                    old.low, old.high
                )));
            }
            for (name, value) in [("low", old.low), ("high", old.high)] {
                if !(FIELD26_MIN..=FIELD26_MAX).contains(&value) {
                    return Err(MdfError::InvalidParameter(format!(
                        "out-of-limit {name} threshold {value} outside the signed 26-bit range"
                    )));
                }
            }
            if old.break_mask > 15 || old.cic_order > 3 || old.cic_decimation > 31 {
                return Err(MdfError::InvalidParameter(
                    "out-of-limit detector field outside its register range".into(),
                ));
            }
        }
        if let Some(scd) = &self.scd {
            if scd.threshold == 0 || scd.threshold > 256 {
                return Err(MdfError::InvalidParameter(format!(
                    "short-circuit threshold {} outside 1..=256",
                    scd.threshold
                )));
            }
            if scd.break_mask > 15 {
                return Err(MdfError::InvalidParameter(format!(
                    "short-circuit break mask {} outside 0..=15",
                    scd.break_mask
                )));
            }
        }
        if self.delay > 127 {
            return Err(MdfError::InvalidParameter(format!(
                "skip delay {} outside 0..=127",
                self.delay
            )));
        }
        if !(FIELD26_MIN..=FIELD26_MAX).contains(&self.offset_compensation) {
            return Err(MdfError::InvalidParameter(format!(
                "offset compensation {} outside the signed 26-bit range",
                self.offset_compensation
            )));
        }
        if self.discard > 255 {
            return Err(MdfError::InvalidParameter(format!(
                "discard count {} outside 0..=255",
                self.discard
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Interleave groups
// =============================================================================

/// One interleave group: filters sharing a bitstream timeslot, started in
/// lock-step by the global trigger.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InterleaveSettings {
    /// Member filter ids, in timeslot order.
    pub filters: Vec<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_toml() -> &'static str {
        r#"
            [clock]
            proc_divider = 4
            common_divider = 2
            cck0 = { enabled = true, direction = "output" }
            trigger_source = 0

            [[sitf]]
            id = 0
            mode = "spi"

            [[sitf]]
            id = 1
            mode = "manchester-rising"
            manchester_threshold = 12

            [[filter]]
            id = 0
            sitf = 0
            cic = { mode = "single-sinc4", decimation = 64, scale = 8 }

            [[filter]]
            id = 1
            sitf = 0
            edge = "falling"
            cic = { mode = "single-sinc4", decimation = 64, scale = 8 }
            old = { low = -1000, high = 1000 }

            [[interleave]]
            filters = [0, 1]
        "#
    }

    #[test]
    fn test_sample_config_parses_and_validates() {
        let config = MdfConfig::from_toml_str(sample_toml()).unwrap();
        config.validate(4).unwrap();
        assert_eq!(config.serial_interfaces.len(), 2);
        assert_eq!(config.filters[1].bitstream_lane(), 1);
        assert_eq!(config.group_of(1), Some(0));
        assert_eq!(config.group_of(3), None);
    }

    #[test]
    fn test_divider_bounds() {
        let mut config = MdfConfig::from_toml_str(sample_toml()).unwrap();
        config.clock.proc_divider = 513;
        assert!(matches!(
            config.validate(4),
            Err(MdfError::InvalidParameter(_))
        ));

        config.clock.proc_divider = 512;
        config.clock.common_divider = 17;
        assert!(matches!(
            config.validate(4),
            Err(MdfError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_unknown_sitf_reference_rejected() {
        let mut config = MdfConfig::from_toml_str(sample_toml()).unwrap();
        config.filters[0].sitf = 5;
        assert!(matches!(config.validate(4), Err(MdfError::Config(_))));
    }

    #[test]
    fn test_filter_id_beyond_instance_rejected() {
        let config = MdfConfig::from_toml_str(sample_toml()).unwrap();
        assert!(matches!(config.validate(1), Err(MdfError::Config(_))));
    }

    #[test]
    fn test_manchester_threshold_on_spi_rejected() {
        let mut config = MdfConfig::from_toml_str(sample_toml()).unwrap();
        config.serial_interfaces[0].manchester_threshold = Some(3);
        assert!(matches!(
            config.validate(4),
            Err(MdfError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_decimation_minimum() {
        let mut config = MdfConfig::from_toml_str(sample_toml()).unwrap();
        config.filters[0].cic.decimation = 1;
        assert!(matches!(
            config.validate(4),
            Err(MdfError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_filter_in_two_groups_rejected() {
        let mut config = MdfConfig::from_toml_str(sample_toml()).unwrap();
        config.interleave.push(InterleaveSettings {
            filters: vec![1, 0],
        });
        assert!(matches!(config.validate(4), Err(MdfError::Config(_))));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = MdfConfig::from_toml_str("[clock]\nbogus = 1\n").unwrap_err();
        assert!(matches!(err, MdfError::Config(_)));
    }
}
