//! Bounded status-bit polling.
//!
//! Every "wait for the hardware to report active" sequence in the control
//! plane goes through [`poll_bit`] with an explicit [`PollBudget`]; there
//! is no unbounded spin anywhere.

use std::time::Duration;

use crate::bus::RegisterBus;
use crate::error::{MdfError, MdfResult};

/// Retry budget for a status-bit poll.
#[derive(Debug, Clone, Copy)]
pub struct PollBudget {
    /// Maximum read attempts before giving up.
    pub attempts: u32,
    /// Sleep between attempts.
    pub interval: Duration,
}

impl Default for PollBudget {
    fn default() -> Self {
        // Activation of the clock generator, serial interfaces and filters
        // is specified in tens of kernel clock cycles; 20 x 50us is
        // generous at any supported clock rate.
        Self {
            attempts: 20,
            interval: Duration::from_micros(50),
        }
    }
}

/// Poll `offset` until the bits in `mask` are all set (`set = true`) or all
/// clear (`set = false`), within `budget`.
pub fn poll_bit(
    bus: &dyn RegisterBus,
    offset: u32,
    mask: u32,
    set: bool,
    what: &'static str,
    budget: PollBudget,
) -> MdfResult<()> {
    for attempt in 0..budget.attempts {
        let value = bus.read(offset)?;
        let hit = if set {
            value & mask == mask
        } else {
            value & mask == 0
        };
        if hit {
            return Ok(());
        }
        if attempt + 1 < budget.attempts {
            std::thread::sleep(budget.interval);
        }
    }
    tracing::warn!(offset, mask, what, "status poll expired");
    Err(MdfError::Timeout { what, offset, mask })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct SeqBus {
        values: Mutex<Vec<u32>>,
    }

    impl RegisterBus for SeqBus {
        fn read(&self, _offset: u32) -> MdfResult<u32> {
            let mut values = self.values.lock().unwrap();
            Ok(if values.len() > 1 {
                values.remove(0)
            } else {
                values[0]
            })
        }

        fn write(&self, _offset: u32, _value: u32) -> MdfResult<()> {
            Ok(())
        }
    }

    fn budget(attempts: u32) -> PollBudget {
        PollBudget {
            attempts,
            interval: Duration::ZERO,
        }
    }

    #[test]
    fn test_poll_succeeds_once_bit_appears() {
        let bus = SeqBus {
            values: Mutex::new(vec![0, 0, 0x8000_0000]),
        };
        poll_bit(&bus, 0, 0x8000_0000, true, "active", budget(5)).unwrap();
    }

    #[test]
    fn test_poll_times_out_after_budget() {
        let bus = SeqBus {
            values: Mutex::new(vec![0]),
        };
        let err = poll_bit(&bus, 0x80, 0x8000_0000, true, "active", budget(3)).unwrap_err();
        assert!(matches!(err, MdfError::Timeout { offset: 0x80, .. }));
    }

    #[test]
    fn test_poll_for_clear() {
        let bus = SeqBus {
            values: Mutex::new(vec![0xffff_ffff, 0x1, 0x0]),
        };
        poll_bit(&bus, 0, 0x1, false, "disabled", budget(5)).unwrap();
    }
}
