//! Interleave group coordination.
//!
//! Filters in an interleave group sample the same bitstream in staggered
//! timeslots, so their decimation counters must start on the same clock
//! edge. The coordinator collects arm notifications from the members and,
//! once the last one arrives, performs the synchronized start: enable every
//! member in trigger-sensitive mode, then fire the global trigger exactly
//! once.
//!
//! Lock order is coordinator, then member filter, then shared clock; the
//! filters drop their own lock before notifying the coordinator, so the
//! fan-out back into `group_start` cannot deadlock.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use mdf_core::regs::gcr;
use mdf_core::{MdfError, MdfResult, RegisterBus};

use crate::clock::{ClockGenerator, RateLockOwner};
use crate::filter::FilterInstance;

struct Group {
    /// Member count fixed at probe time; the group fires when every
    /// member has armed.
    capacity: usize,
    members: Vec<(u32, Weak<FilterInstance>)>,
    armed: Vec<u32>,
    running: bool,
}

/// Synchronized starter for the configured interleave groups.
pub struct InterleaveCoordinator {
    bus: Arc<dyn RegisterBus>,
    clock: Arc<ClockGenerator>,
    groups: Mutex<Vec<Group>>,
}

impl InterleaveCoordinator {
    /// Coordinator for `capacities.len()` groups, where `capacities[i]` is
    /// the member count of group `i`.
    pub fn new(
        bus: Arc<dyn RegisterBus>,
        clock: Arc<ClockGenerator>,
        capacities: &[usize],
    ) -> Self {
        Self {
            bus,
            clock,
            groups: Mutex::new(
                capacities
                    .iter()
                    .map(|&capacity| Group {
                        capacity,
                        members: Vec::with_capacity(capacity),
                        armed: Vec::new(),
                        running: false,
                    })
                    .collect(),
            ),
        }
    }

    /// Number of groups managed by this coordinator.
    #[must_use]
    pub fn group_count(&self) -> usize {
        self.groups.lock().len()
    }

    /// Total members across all groups (the GCR.ILVNB value).
    #[must_use]
    pub fn member_count(&self) -> usize {
        self.groups.lock().iter().map(|g| g.members.len()).sum()
    }

    /// Whether group `group` is currently running.
    #[must_use]
    pub fn is_running(&self, group: u32) -> bool {
        self.groups
            .lock()
            .get(group as usize)
            .is_some_and(|g| g.running)
    }

    /// Register `filter` as a member of group `group`.
    ///
    /// Membership is fixed while the group runs and bounded by the capacity
    /// chosen at construction.
    pub fn join(self: &Arc<Self>, group: u32, filter: &Arc<FilterInstance>) -> MdfResult<()> {
        let mut groups = self.groups.lock();
        let slot = groups
            .get_mut(group as usize)
            .ok_or_else(|| MdfError::InvalidParameter(format!("unknown interleave group {group}")))?;
        if slot.running {
            return Err(MdfError::InvalidState("group is running"));
        }
        if slot.members.len() == slot.capacity {
            return Err(MdfError::InvalidParameter(format!(
                "interleave group {group} is full ({} members)",
                slot.capacity
            )));
        }
        if slot.members.iter().any(|(id, _)| *id == filter.id()) {
            return Err(MdfError::InvalidParameter(format!(
                "filter {} is already in group {group}",
                filter.id()
            )));
        }
        slot.members.push((filter.id(), Arc::downgrade(filter)));
        filter.attach_group(group, self);
        debug!(group, filter = filter.id(), "filter joined interleave group");
        Ok(())
    }

    /// Remove `filter_id` from group `group` and withdraw its pending arm.
    ///
    /// Rejected while the group runs; stop the group first.
    pub fn leave(&self, group: u32, filter_id: u32) -> MdfResult<()> {
        let member = {
            let mut groups = self.groups.lock();
            let slot = groups
                .get_mut(group as usize)
                .ok_or_else(|| {
                    MdfError::InvalidParameter(format!("unknown interleave group {group}"))
                })?;
            if slot.running {
                return Err(MdfError::InvalidState("group is running"));
            }
            let index = slot
                .members
                .iter()
                .position(|(id, _)| *id == filter_id)
                .ok_or_else(|| {
                    MdfError::InvalidParameter(format!(
                        "filter {filter_id} is not in group {group}"
                    ))
                })?;
            slot.armed.retain(|id| *id != filter_id);
            slot.members.remove(index).1
        };

        if let Some(filter) = member.upgrade() {
            filter.disarm();
            filter.detach_group();
        }
        info!(group, filter = filter_id, "filter left interleave group");
        Ok(())
    }

    /// Record that member `filter_id` armed; fires the synchronized start
    /// once every member of the group has.
    ///
    /// A repeated notification from an already-armed member is a no-op.
    pub(crate) fn notify_armed(&self, group: u32, filter_id: u32) -> MdfResult<()> {
        let mut groups = self.groups.lock();
        let slot = groups
            .get_mut(group as usize)
            .ok_or_else(|| MdfError::InvalidParameter(format!("unknown interleave group {group}")))?;
        if !slot.members.iter().any(|(id, _)| *id == filter_id) {
            return Err(MdfError::InvalidParameter(format!(
                "filter {filter_id} is not in group {group}"
            )));
        }
        // An already-armed member repeating its notification is a no-op,
        // before and after the group fired.
        if slot.armed.contains(&filter_id) {
            return Ok(());
        }
        if slot.running {
            return Err(MdfError::InvalidState("group is running"));
        }
        slot.armed.push(filter_id);
        debug!(
            group,
            filter = filter_id,
            armed = slot.armed.len(),
            capacity = slot.capacity,
            "interleave member armed"
        );

        if slot.members.len() == slot.capacity && slot.armed.len() == slot.capacity {
            self.fire(group, slot)?;
        }
        Ok(())
    }

    /// Synchronized start of a fully-armed group. On any failure every
    /// already-enabled member is aborted back to `Configured` and the
    /// shared resources are released.
    fn fire(&self, group: u32, slot: &mut Group) -> MdfResult<()> {
        let members: Vec<Arc<FilterInstance>> = slot
            .members
            .iter()
            .map(|(id, weak)| {
                weak.upgrade().ok_or(MdfError::InvalidState(
                    "interleave member dropped before start",
                ))
                .map_err(|err| {
                    warn!(group, filter = id, "member gone");
                    err
                })
            })
            .collect::<MdfResult<_>>()?;

        let owner = RateLockOwner::group(group);
        if let Err(err) = self.clock.lock_rate(owner) {
            Self::demote(slot, &members, 0);
            return Err(err);
        }
        if let Err(err) = self.clock.enable() {
            if let Err(unlock_err) = self.clock.unlock_rate(owner) {
                warn!(group, %unlock_err, "rate unlock failed during abort");
            }
            Self::demote(slot, &members, 0);
            return Err(err);
        }

        let mut started = 0;
        let result = (|| {
            for member in &members {
                member.group_start()?;
                started += 1;
            }
            // One trigger pulse starts every enabled member on the same
            // processing clock edge.
            self.bus.set_bits(gcr::OFFSET, gcr::TRGO)?;
            for member in &members {
                member.group_mark_running()?;
            }
            Ok(())
        })();

        match result {
            Ok(()) => {
                slot.running = true;
                info!(group, members = members.len(), "interleave group running");
                Ok(())
            }
            Err(err) => {
                warn!(group, %err, "interleave group start failed, aborting");
                Self::demote(slot, &members, started);
                if let Err(disable_err) = self.clock.disable() {
                    warn!(group, %disable_err, "clock disable failed during abort");
                }
                if let Err(unlock_err) = self.clock.unlock_rate(owner) {
                    warn!(group, %unlock_err, "rate unlock failed during abort");
                }
                Err(err)
            }
        }
    }

    /// Unwind a failed fire: members with the enable bit already set get a
    /// full hardware abort, the rest just drop their armed state.
    fn demote(slot: &mut Group, members: &[Arc<FilterInstance>], started: usize) {
        for (index, member) in members.iter().enumerate() {
            if index < started {
                member.group_abort();
            } else {
                member.disarm();
            }
        }
        slot.armed.clear();
    }

    /// Stop a running group: disable every member, release the clock
    /// reference and the rate lock. Teardown is best effort; the first
    /// error is reported after everything has been attempted.
    pub fn stop(&self, group: u32) -> MdfResult<()> {
        let mut groups = self.groups.lock();
        let slot = groups
            .get_mut(group as usize)
            .ok_or_else(|| MdfError::InvalidParameter(format!("unknown interleave group {group}")))?;
        if !slot.running {
            return Err(MdfError::InvalidState("group is not running"));
        }

        let mut first_error = None;
        for (id, weak) in &slot.members {
            match weak.upgrade() {
                Some(member) => {
                    if let Err(err) = member.group_stop() {
                        warn!(group, filter = id, %err, "member stop failed");
                        first_error.get_or_insert(err);
                    }
                }
                None => warn!(group, filter = id, "member dropped before stop"),
            }
        }
        if let Err(err) = self.clock.disable() {
            first_error.get_or_insert(err);
        }
        if let Err(err) = self.clock.unlock_rate(RateLockOwner::group(group)) {
            first_error.get_or_insert(err);
        }

        slot.armed.clear();
        slot.running = false;
        info!(group, "interleave group stopped");
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use mdf_core::regs::{self, dfltcr};
    use mdf_mock::MockBus;

    use crate::config::MdfConfig;
    use crate::filter::FilterState;
    use crate::sitf::SerialInterface;

    const SAMPLE: &str = r#"
        [clock]
        proc_divider = 4

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

        [[filter]]
        id = 2
        sitf = 0
        cic = { mode = "single-sinc4", decimation = 64, scale = 8 }

        [[interleave]]
        filters = [0, 1, 2]
    "#;

    struct Rig {
        bus: Arc<MockBus>,
        clock: Arc<ClockGenerator>,
        coordinator: Arc<InterleaveCoordinator>,
        filters: Vec<Arc<FilterInstance>>,
    }

    fn rig() -> Rig {
        let bus = Arc::new(MockBus::stm32mp25(4, 1));
        let config = MdfConfig::from_toml_str(SAMPLE).unwrap();
        config.validate(4).unwrap();

        let clock = Arc::new(ClockGenerator::new(
            bus.clone() as Arc<dyn RegisterBus>,
            49_152_000,
        ));
        clock.configure(&config.clock).unwrap();
        let sitf = Arc::new(
            SerialInterface::new(bus.clone() as Arc<dyn RegisterBus>, &config.serial_interfaces[0])
                .unwrap(),
        );
        let coordinator = Arc::new(InterleaveCoordinator::new(
            bus.clone() as Arc<dyn RegisterBus>,
            clock.clone(),
            &[config.interleave[0].filters.len()],
        ));

        let mut filters = Vec::new();
        for settings in &config.filters {
            let filter = Arc::new(FilterInstance::new(
                bus.clone() as Arc<dyn RegisterBus>,
                clock.clone(),
                sitf.clone(),
                settings.id,
            ));
            coordinator.join(0, &filter).unwrap();
            filter.configure(settings).unwrap();
            filters.push(filter);
        }

        Rig {
            bus,
            clock,
            coordinator,
            filters,
        }
    }

    #[test]
    fn test_group_fires_once_all_members_armed() {
        let rig = rig();

        rig.filters[0].arm().unwrap();
        rig.filters[1].arm().unwrap();
        assert!(!rig.coordinator.is_running(0));
        assert_eq!(rig.bus.writes_with_bits(gcr::OFFSET, gcr::TRGO), 0);

        rig.filters[2].arm().unwrap();
        assert!(rig.coordinator.is_running(0));
        for filter in &rig.filters {
            assert_eq!(filter.state(), FilterState::Running);
        }
        // Exactly one trigger pulse for the whole group.
        assert_eq!(rig.bus.writes_with_bits(gcr::OFFSET, gcr::TRGO), 1);
        assert!(rig.clock.is_rate_locked());
    }

    #[test]
    fn test_rearm_is_idempotent() {
        let rig = rig();
        rig.filters[0].arm().unwrap();
        rig.coordinator.notify_armed(0, 0).unwrap();
        assert!(!rig.coordinator.is_running(0));
    }

    #[test]
    fn test_notify_armed_after_fire_is_noop() {
        let rig = rig();
        for filter in &rig.filters {
            filter.arm().unwrap();
        }
        assert!(rig.coordinator.is_running(0));

        // A member repeating its notification after the group fired must
        // not error and must not retrigger.
        rig.coordinator.notify_armed(0, 0).unwrap();
        assert!(rig.coordinator.is_running(0));
        assert_eq!(rig.bus.writes_with_bits(gcr::OFFSET, gcr::TRGO), 1);
    }

    #[test]
    fn test_member_cannot_start_or_stop_alone() {
        let rig = rig();
        rig.filters[0].arm().unwrap();
        assert!(matches!(
            rig.filters[0].start(),
            Err(MdfError::InvalidState(_))
        ));

        rig.filters[1].arm().unwrap();
        rig.filters[2].arm().unwrap();
        assert!(matches!(
            rig.filters[0].stop(),
            Err(MdfError::InvalidState(_))
        ));
    }

    #[test]
    fn test_group_stop_releases_everything() {
        let rig = rig();
        for filter in &rig.filters {
            filter.arm().unwrap();
        }
        assert!(rig.coordinator.is_running(0));

        rig.coordinator.stop(0).unwrap();
        assert!(!rig.coordinator.is_running(0));
        assert!(!rig.clock.is_rate_locked());
        for filter in &rig.filters {
            assert_eq!(filter.state(), FilterState::Idle);
            assert_eq!(
                rig.bus.raw(regs::flt_base(filter.id()) + dfltcr::OFFSET) & dfltcr::DFLTEN,
                0
            );
        }
        assert_eq!(rig.filters[0].sitf().refcount(), 0);
    }

    #[test]
    fn test_stop_idle_group_is_invalid_state() {
        let rig = rig();
        assert!(matches!(
            rig.coordinator.stop(0),
            Err(MdfError::InvalidState(_))
        ));
    }

    #[test]
    fn test_leave_while_running_rejected() {
        let rig = rig();
        for filter in &rig.filters {
            filter.arm().unwrap();
        }
        assert!(matches!(
            rig.coordinator.leave(0, 1),
            Err(MdfError::InvalidState(_))
        ));

        rig.coordinator.stop(0).unwrap();
        rig.coordinator.leave(0, 1).unwrap();
        assert_eq!(rig.filters[1].group(), None);
        assert_eq!(rig.coordinator.member_count(), 2);
    }

    #[test]
    fn test_failed_group_start_aborts_all_members() {
        let rig = rig();
        // Filter 2 never reports active, so the last mark_running times
        // out and the whole group must unwind.
        rig.bus.set_stuck(
            regs::flt_base(2) + dfltcr::OFFSET,
            dfltcr::DFLTACTIVE,
        );
        for filter in rig.filters.iter().take(2) {
            filter.arm().unwrap();
        }
        let err = rig.filters[2].arm().unwrap_err();
        assert!(matches!(err, MdfError::Timeout { .. }));

        assert!(!rig.coordinator.is_running(0));
        assert!(!rig.clock.is_rate_locked());
        assert_eq!(rig.filters[0].sitf().refcount(), 0);
        for filter in &rig.filters {
            assert_eq!(filter.state(), FilterState::Configured);
            assert_eq!(
                rig.bus.raw(regs::flt_base(filter.id()) + dfltcr::OFFSET) & dfltcr::DFLTEN,
                0
            );
        }
    }

    #[test]
    fn test_join_bounds() {
        let rig = rig();
        let extra = Arc::new(FilterInstance::new(
            rig.bus.clone() as Arc<dyn RegisterBus>,
            rig.clock.clone(),
            rig.filters[0].sitf().clone(),
            3,
        ));
        assert!(matches!(
            rig.coordinator.join(0, &extra),
            Err(MdfError::InvalidParameter(_))
        ));
        assert!(matches!(
            rig.coordinator.join(5, &extra),
            Err(MdfError::InvalidParameter(_))
        ));
    }
}
