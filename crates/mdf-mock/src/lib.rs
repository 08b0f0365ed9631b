//! Mock register bus for MDF control-plane tests.
//!
//! [`MockBus`] is an in-memory register file with just enough hardware
//! behavior modeling to exercise the lifecycle logic:
//!
//! - **follow rules**: a status bit tracks an enable bit in the same
//!   register (CKGACTIVE follows CKGDEN, SITFACTIVE follows SITFEN, ...),
//! - **write-1-to-clear** masks for the interrupt status registers,
//! - **pulse** masks for self-clearing bits (GCR.TRGO never latches),
//! - **stuck** masks for fault injection: a stuck bit never follows its
//!   enable, so activation polls expire deterministically.
//!
//! A write log records every store for sequencing assertions.

use std::collections::HashMap;

use parking_lot::Mutex;

use mdf_core::regs::{self, ckgcr, dfltcr, dfltirq, gcr, hwcfgr, ipidr, sitfcr, verr};
use mdf_core::{MdfResult, RegisterBus};

/// A status bit that tracks an enable bit within one register.
#[derive(Debug, Clone, Copy)]
pub struct FollowRule {
    /// Register byte offset the rule applies to.
    pub offset: u32,
    /// Enable bits that drive the status.
    pub enable: u32,
    /// Status bits set while `enable` is fully set.
    pub active: u32,
}

/// In-memory register file standing in for an MDF instance.
#[derive(Default)]
pub struct MockBus {
    regs: Mutex<HashMap<u32, u32>>,
    writes: Mutex<Vec<(u32, u32)>>,
    follow: Mutex<Vec<FollowRule>>,
    w1c: Mutex<HashMap<u32, u32>>,
    pulse: Mutex<HashMap<u32, u32>>,
    stuck: Mutex<HashMap<u32, u32>>,
}

impl MockBus {
    /// Empty register file with no behavior rules.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register file preloaded to look like an STM32MP25 MDF instance with
    /// `filters` digital filters and `interfaces` serial interfaces.
    #[must_use]
    pub fn stm32mp25(filters: u32, interfaces: u32) -> Self {
        let bus = Self::new();
        bus.preload(ipidr::OFFSET, regs::STM32MP25_IPIDR);
        bus.preload(
            hwcfgr::OFFSET,
            regs::field_prep(hwcfgr::NBF, filters) | regs::field_prep(hwcfgr::FIFO_SIZE, 8),
        );
        bus.preload(
            verr::OFFSET,
            regs::field_prep(verr::MAJREV, 1) | regs::field_prep(verr::MINREV, 0),
        );

        bus.add_follow(FollowRule {
            offset: ckgcr::OFFSET,
            enable: ckgcr::CKGDEN,
            active: ckgcr::CKGACTIVE,
        });
        for id in 0..interfaces {
            bus.add_follow(FollowRule {
                offset: regs::sitf_base(id) + sitfcr::OFFSET,
                enable: sitfcr::SITFEN,
                active: sitfcr::SITFACTIVE,
            });
        }
        for id in 0..filters {
            let base = regs::flt_base(id);
            bus.add_follow(FollowRule {
                offset: base + dfltcr::OFFSET,
                enable: dfltcr::DFLTEN,
                active: dfltcr::DFLTACTIVE | dfltcr::DFLTRUN,
            });
            bus.set_w1c(base + dfltirq::ISR_OFFSET, dfltirq::ALL);
        }
        bus.set_pulse(gcr::OFFSET, gcr::TRGO);
        bus
    }

    /// Set a register without going through write rules or the log.
    pub fn preload(&self, offset: u32, value: u32) {
        self.regs.lock().insert(offset, value);
    }

    /// OR bits into a register directly, as the hardware does when raising
    /// an interrupt flag.
    pub fn raise(&self, offset: u32, bits: u32) {
        let mut regs = self.regs.lock();
        *regs.entry(offset).or_insert(0) |= bits;
    }

    /// Add a status-follows-enable rule.
    pub fn add_follow(&self, rule: FollowRule) {
        self.follow.lock().push(rule);
    }

    /// Mark `mask` at `offset` as write-1-to-clear.
    pub fn set_w1c(&self, offset: u32, mask: u32) {
        self.w1c.lock().insert(offset, mask);
    }

    /// Mark `mask` at `offset` as self-clearing pulse bits.
    pub fn set_pulse(&self, offset: u32, mask: u32) {
        self.pulse.lock().insert(offset, mask);
    }

    /// Fault injection: status bits in `mask` at `offset` never follow
    /// their enable.
    pub fn set_stuck(&self, offset: u32, mask: u32) {
        self.stuck.lock().insert(offset, mask);
    }

    /// Current raw register value, without a bus error path.
    #[must_use]
    pub fn raw(&self, offset: u32) -> u32 {
        self.regs.lock().get(&offset).copied().unwrap_or(0)
    }

    /// Number of stores issued to `offset`.
    #[must_use]
    pub fn write_count(&self, offset: u32) -> usize {
        self.writes.lock().iter().filter(|(o, _)| *o == offset).count()
    }

    /// Stores issued to `offset` where `value & mask != 0`.
    #[must_use]
    pub fn writes_with_bits(&self, offset: u32, mask: u32) -> usize {
        self.writes
            .lock()
            .iter()
            .filter(|(o, v)| *o == offset && v & mask != 0)
            .count()
    }

    /// Full write log, in issue order.
    #[must_use]
    pub fn write_log(&self) -> Vec<(u32, u32)> {
        self.writes.lock().clone()
    }

    fn apply_rules(&self, offset: u32, mut value: u32) -> u32 {
        let stuck = self.stuck.lock().get(&offset).copied().unwrap_or(0);
        for rule in self.follow.lock().iter() {
            if rule.offset != offset {
                continue;
            }
            if value & rule.enable == rule.enable {
                value |= rule.active & !stuck;
            } else {
                value &= !rule.active;
            }
        }
        if let Some(pulse) = self.pulse.lock().get(&offset) {
            value &= !pulse;
        }
        value
    }
}

impl RegisterBus for MockBus {
    fn read(&self, offset: u32) -> MdfResult<u32> {
        Ok(self.raw(offset))
    }

    fn write(&self, offset: u32, value: u32) -> MdfResult<()> {
        self.writes.lock().push((offset, value));
        tracing::trace!(offset, value, "mock write");

        if let Some(mask) = self.w1c.lock().get(&offset) {
            let mut regs = self.regs.lock();
            let current = regs.entry(offset).or_insert(0);
            *current &= !(value & mask);
            *current = (*current & mask) | (value & !mask);
            return Ok(());
        }

        let stored = self.apply_rules(offset, value);
        self.regs.lock().insert(offset, stored);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_follow_rule_sets_and_clears_status() {
        let bus = MockBus::new();
        bus.add_follow(FollowRule {
            offset: 0x80,
            enable: 0x1,
            active: 0x8000_0000,
        });

        bus.write(0x80, 0x1).unwrap();
        assert_eq!(bus.raw(0x80), 0x8000_0001);

        bus.write(0x80, 0x0).unwrap();
        assert_eq!(bus.raw(0x80), 0);
    }

    #[test]
    fn test_stuck_bit_never_follows() {
        let bus = MockBus::new();
        bus.add_follow(FollowRule {
            offset: 0x80,
            enable: 0x1,
            active: 0x8000_0000,
        });
        bus.set_stuck(0x80, 0x8000_0000);

        bus.write(0x80, 0x1).unwrap();
        assert_eq!(bus.raw(0x80), 0x1);
    }

    #[test]
    fn test_w1c_clears_only_written_flags() {
        let bus = MockBus::new();
        bus.set_w1c(0x2c, 0xfff);
        bus.raise(0x2c, 0x412);

        bus.write(0x2c, 0x010).unwrap();
        assert_eq!(bus.raw(0x2c), 0x402);
    }

    #[test]
    fn test_pulse_bit_does_not_latch() {
        let bus = MockBus::new();
        bus.set_pulse(0x0, 0x1);

        bus.write(0x0, 0x31).unwrap();
        assert_eq!(bus.raw(0x0), 0x30);
        assert_eq!(bus.writes_with_bits(0x0, 0x1), 1);
    }

    #[test]
    fn test_stm32mp25_identity() {
        let bus = MockBus::stm32mp25(4, 2);
        assert_eq!(bus.raw(mdf_core::regs::ipidr::OFFSET), 0x0011_0032);
        let hw = bus.raw(mdf_core::regs::hwcfgr::OFFSET);
        assert_eq!(mdf_core::regs::field_get(hwcfgr::NBF, hw), 4);
    }
}
