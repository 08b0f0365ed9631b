//! Register map of the MDF peripheral.
//!
//! Three word-addressed, 32-bit address spaces:
//!
//! - a global block at the instance base (global control, clock generator
//!   control, and the read-only identification window at `0xff0..=0xffc`),
//! - one block per serial interface at `SITF_BASE + 0x80 * index`,
//! - one block per digital filter at `FLT_BASE + 0x84 * index`.
//!
//! Field constants are grouped per register in a submodule named after the
//! register. Encode with [`field_prep`], decode with [`field_get`].

/// Single-bit mask.
#[must_use]
pub const fn bit(n: u32) -> u32 {
    1 << n
}

/// Contiguous mask covering bits `hi..=lo`.
#[must_use]
pub const fn genmask(hi: u32, lo: u32) -> u32 {
    (((1u64 << (hi - lo + 1)) - 1) as u32) << lo
}

/// Shift `value` into the field described by `mask`.
#[must_use]
pub const fn field_prep(mask: u32, value: u32) -> u32 {
    (value << mask.trailing_zeros()) & mask
}

/// Extract the field described by `mask` from a register value.
#[must_use]
pub const fn field_get(mask: u32, reg: u32) -> u32 {
    (reg & mask) >> mask.trailing_zeros()
}

/// Base offset of the first serial interface block.
pub const SITF_BASE: u32 = 0x80;
/// Stride between serial interface blocks.
pub const SITF_STRIDE: u32 = 0x80;
/// Base offset of the first digital filter block (past the eight serial
/// interface windows).
pub const FLT_BASE: u32 = 0x500;
/// Stride between digital filter blocks.
pub const FLT_STRIDE: u32 = 0x84;

/// Byte offset of serial interface block `id`.
#[must_use]
pub const fn sitf_base(id: u32) -> u32 {
    SITF_BASE + SITF_STRIDE * id
}

/// Byte offset of digital filter block `id`.
#[must_use]
pub const fn flt_base(id: u32) -> u32 {
    FLT_BASE + FLT_STRIDE * id
}

/// Maximum processing clock divider accepted by the clock generator.
pub const PROCDIV_MAX: u32 = 512;
/// Maximum common clock (CCK) divider accepted by the clock generator.
pub const CCKDIV_MAX: u32 = 16;
/// Minimum CIC decimation factor.
pub const MCICD_MIN: u32 = 2;

/// Expected IPIDR identification value for the STM32MP25 MDF instance.
pub const STM32MP25_IPIDR: u32 = 0x0011_0032;

/// GCR: global control register.
pub mod gcr {
    use super::*;

    /// Register byte offset.
    pub const OFFSET: u32 = 0x00;
    /// Trigger output: write 1 to start all trigger-armed filters.
    pub const TRGO: u32 = bit(0);
    /// Number of interleaved filters.
    pub const ILVNB: u32 = genmask(7, 4);
}

/// CKGCR: clock generator control register.
pub mod ckgcr {
    use super::*;

    /// Register byte offset.
    pub const OFFSET: u32 = 0x04;
    /// Clock generator enable.
    pub const CKGDEN: u32 = bit(0);
    /// CCK0 divider chain enable.
    pub const CCK0EN: u32 = bit(1);
    /// CCK1 divider chain enable.
    pub const CCK1EN: u32 = bit(2);
    /// Shared clock generator mode.
    pub const CKGMOD: u32 = bit(4);
    /// CCK0 pad direction (output when set).
    pub const CCK0DIR: u32 = bit(5);
    /// CCK1 pad direction (output when set).
    pub const CCK1DIR: u32 = bit(6);
    /// Trigger sensitivity (falling edge when set).
    pub const TRGSENS: u32 = bit(8);
    /// Trigger source selector.
    pub const TRGSRC: u32 = genmask(15, 12);
    /// Common clock divider, encoded as divider - 1.
    pub const CCKDIV: u32 = genmask(19, 16);
    /// Processing clock divider, encoded as divider - 1.
    pub const PROCDIV: u32 = genmask(30, 24);
    /// Clock generator active status.
    pub const CKGACTIVE: u32 = bit(31);
}

/// SITFCR: serial interface control register (per-interface block).
pub mod sitfcr {
    use super::*;

    /// Byte offset within the interface block.
    pub const OFFSET: u32 = 0x00;
    /// Serial interface enable.
    pub const SITFEN: u32 = bit(0);
    /// Serial clock source selector.
    pub const SCKSRC: u32 = genmask(2, 1);
    /// Interface mode (LF-SPI, SPI, Manchester rising/falling).
    pub const SITFMOD: u32 = genmask(5, 4);
    /// Manchester symbol threshold.
    pub const STH: u32 = genmask(12, 8);
    /// Serial interface active status.
    pub const SITFACTIVE: u32 = bit(31);
}

/// BSMXCR: bitstream matrix control register.
pub mod bsmxcr {
    use super::*;

    /// Byte offset within the filter block.
    pub const OFFSET: u32 = 0x00;
    /// Bitstream lane select.
    pub const BSSEL: u32 = genmask(4, 0);
    /// Matrix routing active status.
    pub const BSMXACTIVE: u32 = bit(31);
}

/// DFLTCR: digital filter control register.
pub mod dfltcr {
    use super::*;

    /// Byte offset within the filter block.
    pub const OFFSET: u32 = 0x04;
    /// Digital filter enable.
    pub const DFLTEN: u32 = bit(0);
    /// DMA request enable.
    pub const DMAEN: u32 = bit(1);
    /// FIFO threshold select.
    pub const FTH: u32 = bit(2);
    /// Acquisition mode.
    pub const ACQMOD: u32 = genmask(6, 4);
    /// Trigger sensitivity (falling edge when set).
    pub const TRGSENS: u32 = bit(8);
    /// Trigger source selector.
    pub const TRGSRC: u32 = genmask(15, 12);
    /// Snapshot format select.
    pub const SNPSFMT: u32 = bit(16);
    /// Number of samples to discard after start.
    pub const NBDIS: u32 = genmask(27, 20);
    /// Filter is consuming samples.
    pub const DFLTRUN: u32 = bit(30);
    /// Filter active status.
    pub const DFLTACTIVE: u32 = bit(31);
}

/// DFLTCICR: CIC filter configuration register.
pub mod dfltcicr {
    use super::*;

    /// Byte offset within the filter block.
    pub const OFFSET: u32 = 0x08;
    /// Data source selector.
    pub const DATSRC: u32 = genmask(1, 0);
    /// CIC mode.
    pub const CICMOD: u32 = genmask(6, 4);
    /// Main CIC decimation factor.
    pub const MCICD: u32 = genmask(16, 8);
    /// Output scale.
    pub const SCALE: u32 = genmask(25, 20);
}

/// DFLTRSFR: reshape filter configuration register.
pub mod dfltrsfr {
    use super::*;

    /// Byte offset within the filter block.
    pub const OFFSET: u32 = 0x0c;
    /// Reshape filter bypass.
    pub const RSFLTBYP: u32 = bit(0);
    /// Reshape filter decimation select.
    pub const RSFLTD: u32 = bit(4);
    /// High-pass filter bypass.
    pub const HPFBYP: u32 = bit(7);
    /// High-pass filter cutoff select.
    pub const HPFC: u32 = genmask(9, 8);
}

/// DFLTINTR: integrator configuration register.
pub mod dfltintr {
    use super::*;

    /// Byte offset within the filter block.
    pub const OFFSET: u32 = 0x10;
    /// Integrator output division.
    pub const INTDIV: u32 = genmask(1, 0);
    /// Integrator accumulation value.
    pub const INTVAL: u32 = genmask(10, 4);
}

/// OLDCR: out-of-limit detector control register.
pub mod oldcr {
    use super::*;

    /// Byte offset within the filter block.
    pub const OFFSET: u32 = 0x14;
    /// Out-of-limit detector enable.
    pub const OLDEN: u32 = bit(0);
    /// Flag samples inside the threshold band instead of outside.
    pub const THINB: u32 = bit(1);
    /// Break signal routing mask.
    pub const BKOLD: u32 = genmask(7, 4);
    /// Auxiliary CIC order for the detector path.
    pub const ACICN: u32 = genmask(13, 12);
    /// Auxiliary CIC decimation for the detector path.
    pub const ACICD: u32 = genmask(21, 17);
    /// Detector active status.
    pub const OLDACTIVE: u32 = bit(31);
}

/// OLDTHLR / OLDTHHR: out-of-limit detector threshold registers.
pub mod oldthr {
    use super::*;

    /// Byte offset of the low threshold register.
    pub const LOW_OFFSET: u32 = 0x18;
    /// Byte offset of the high threshold register.
    pub const HIGH_OFFSET: u32 = 0x1c;
    /// Signed 26-bit threshold value.
    pub const OLDTH: u32 = genmask(25, 0);
}

/// DLYCR: delay control register.
pub mod dlycr {
    use super::*;

    /// Byte offset within the filter block.
    pub const OFFSET: u32 = 0x20;
    /// Bitstream skip delay in sample clock cycles.
    pub const SKPDLY: u32 = genmask(6, 0);
}

/// SCDCR: short-circuit detector control register.
pub mod scdcr {
    use super::*;

    /// Byte offset within the filter block.
    pub const OFFSET: u32 = 0x24;
    /// Short-circuit detector enable.
    pub const SCDEN: u32 = bit(0);
    /// Break signal routing mask.
    pub const BKSCD: u32 = genmask(7, 4);
    /// Identical-sample counter threshold.
    pub const SCDT: u32 = genmask(19, 12);
    /// Detector active status.
    pub const SCDACTIVE: u32 = bit(31);
}

/// DFLTIER / DFLTISR: filter interrupt enable and status registers.
///
/// Enable and status registers share the same bit layout; the status
/// register is acknowledged by writing 1 to the set flags.
pub mod dfltirq {
    use super::*;

    /// Byte offset of the interrupt enable register.
    pub const IER_OFFSET: u32 = 0x28;
    /// Byte offset of the interrupt status register.
    pub const ISR_OFFSET: u32 = 0x2c;
    /// FIFO threshold reached.
    pub const FTH: u32 = bit(0);
    /// Data overrun.
    pub const DOVR: u32 = bit(1);
    /// Snapshot data ready.
    pub const SSDR: u32 = bit(2);
    /// Out-of-limit detection.
    pub const OLD: u32 = bit(4);
    /// Snapshot overrun.
    pub const SSOVR: u32 = bit(7);
    /// Short-circuit detection.
    pub const SCD: u32 = bit(8);
    /// Saturation.
    pub const SAT: u32 = bit(9);
    /// Clock absence.
    pub const CKAB: u32 = bit(10);
    /// Reshape filter overrun.
    pub const RFOVR: u32 = bit(11);
    /// Every defined interrupt bit.
    pub const ALL: u32 = FTH | DOVR | SSDR | OLD | SSOVR | SCD | SAT | CKAB | RFOVR;
}

/// OECCR: offset error compensation control register.
pub mod oeccr {
    use super::*;

    /// Byte offset within the filter block.
    pub const OFFSET: u32 = 0x30;
    /// Signed 26-bit offset compensation value.
    pub const OFFSET_VALUE: u32 = genmask(25, 0);
}

/// SNPSDR: snapshot data register.
pub mod snpsdr {
    use super::*;

    /// Byte offset within the filter block.
    pub const OFFSET: u32 = 0x64;
    /// Decimation counter captured with the snapshot.
    pub const MCICDC: u32 = genmask(8, 0);
    /// Extended snapshot data.
    pub const EXTSDR: u32 = genmask(15, 9);
    /// Snapshot data.
    pub const SDR: u32 = genmask(31, 16);
}

/// DFLTDR: filter output data register.
pub mod dfltdr {
    use super::*;

    /// Byte offset within the filter block.
    pub const OFFSET: u32 = 0x6c;
    /// Sample data, left-aligned.
    pub const DR: u32 = genmask(31, 8);
}

/// HWCFGR: hardware configuration register (read-only, probe time).
pub mod hwcfgr {
    use super::*;

    /// Register byte offset.
    pub const OFFSET: u32 = 0xff0;
    /// FIFO depth in words.
    pub const FIFO_SIZE: u32 = genmask(7, 0);
    /// Number of digital filters in this instance.
    pub const NBF: u32 = genmask(15, 8);
    /// Filter configuration options.
    pub const FLT_CFG: u32 = genmask(19, 16);
    /// Sound activity detector options.
    pub const SAD: u32 = genmask(23, 20);
    /// Instance option bits.
    pub const OPTION: u32 = genmask(31, 24);
}

/// VERR: version register (read-only, probe time).
pub mod verr {
    use super::*;

    /// Register byte offset.
    pub const OFFSET: u32 = 0xff4;
    /// Minor revision.
    pub const MINREV: u32 = genmask(3, 0);
    /// Major revision.
    pub const MAJREV: u32 = genmask(7, 4);
}

/// IPIDR: identification register (read-only, probe time).
pub mod ipidr {
    /// Register byte offset.
    pub const OFFSET: u32 = 0xff8;
}

/// SIDR: size identification register (read-only, probe time).
pub mod sidr {
    /// Register byte offset.
    pub const OFFSET: u32 = 0xffc;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_genmask_bounds() {
        assert_eq!(genmask(0, 0), 0x1);
        assert_eq!(genmask(7, 4), 0xf0);
        assert_eq!(genmask(31, 0), 0xffff_ffff);
        assert_eq!(genmask(30, 24), 0x7f00_0000);
    }

    #[test]
    fn test_field_roundtrip() {
        let reg = field_prep(ckgcr::PROCDIV, 0x55) | field_prep(ckgcr::CCKDIV, 0xa);
        assert_eq!(field_get(ckgcr::PROCDIV, reg), 0x55);
        assert_eq!(field_get(ckgcr::CCKDIV, reg), 0xa);
    }

    #[test]
    fn test_field_prep_masks_overflow() {
        // A value wider than the field must not bleed into neighbours.
        assert_eq!(field_prep(sitfcr::SCKSRC, 0xff), sitfcr::SCKSRC);
    }

    #[test]
    fn test_block_offsets() {
        assert_eq!(sitf_base(0), 0x80);
        assert_eq!(sitf_base(1), 0x100);
        assert_eq!(flt_base(0), 0x500);
        assert_eq!(flt_base(2), 0x500 + 2 * 0x84);
    }
}
