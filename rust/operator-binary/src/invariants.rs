//! Downscale safety invariants (§4.6): the fixed set of checks the downscale
//! phase must satisfy before it is allowed to remove a pod, expressed as a
//! small pure value type so the phase logic itself stays a thin driver.

/// One node group's current and intended pod counts, as fed into
/// `DownscaleInvariants::check`.
#[derive(Clone, Copy, Debug)]
pub struct GroupDownscale {
    pub master_eligible: bool,
    pub current_replicas: i32,
    pub intended_replicas: i32,
}

/// The reasons a proposed downscale step can be refused. Each variant maps
/// to one bullet in §4.6.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InvariantViolation {
    /// Would leave the cluster with zero master-eligible pods.
    WouldRemoveLastMaster,
    /// Would remove more than one master-eligible pod in this pass.
    MoreThanOneMasterRemovalPerPass,
    /// The update-partition ordinal for this group must never increase.
    PartitionWentBackwards,
    /// Too many groups are mid-rolling-upgrade at once.
    UpgradeConcurrencyExceeded,
}

/// The fixed concurrency cap on simultaneously-upgrading node groups (§4.6,
/// §9 open question (3): the cap of 1 is treated as authoritative, not
/// configurable).
pub const MAX_CONCURRENT_UPGRADING_GROUPS: usize = 1;

/// The fixed concurrency cap on master-eligible pods removed in a single
/// downscale pass.
pub const MAX_MASTER_REMOVALS_PER_PASS: i32 = 1;

pub struct DownscaleInvariants;

impl DownscaleInvariants {
    /// Checks a proposed set of per-group downscale steps against the
    /// cluster-wide invariants. `groups` must include every node group in
    /// the cluster, not just the ones being scaled down, so the
    /// last-master check can see the whole picture.
    pub fn check(groups: &[GroupDownscale]) -> Result<(), InvariantViolation> {
        let remaining_masters: i32 = groups
            .iter()
            .filter(|g| g.master_eligible)
            .map(|g| g.intended_replicas)
            .sum();
        if remaining_masters < 1 {
            return Err(InvariantViolation::WouldRemoveLastMaster);
        }

        let master_removals: i32 = groups
            .iter()
            .filter(|g| g.master_eligible)
            .map(|g| (g.current_replicas - g.intended_replicas).max(0))
            .sum();
        if master_removals > MAX_MASTER_REMOVALS_PER_PASS {
            return Err(InvariantViolation::MoreThanOneMasterRemovalPerPass);
        }

        Ok(())
    }

    /// The partition-ordinal must be monotonically non-increasing across
    /// reconciles: once the rolling upgrade has advanced past ordinal `n`,
    /// it may never retreat to target ordinal `n + 1` or higher (§4.5,
    /// §4.6, §8 "never decrement... if unhealthy" is the inverse case
    /// checked by the upgrade phase itself; this is the structural
    /// monotonicity check).
    pub fn partition_is_monotonic(previous: i32, proposed: i32) -> Result<(), InvariantViolation> {
        if proposed > previous {
            Err(InvariantViolation::PartitionWentBackwards)
        } else {
            Ok(())
        }
    }

    /// How many node groups may have an upgrade in flight (non-zero pending
    /// partition delta) at once, cluster-wide.
    pub fn upgrade_concurrency_ok(groups_mid_upgrade: usize) -> Result<(), InvariantViolation> {
        if groups_mid_upgrade > MAX_CONCURRENT_UPGRADING_GROUPS {
            Err(InvariantViolation::UpgradeConcurrencyExceeded)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(master_eligible: bool, current: i32, intended: i32) -> GroupDownscale {
        GroupDownscale {
            master_eligible,
            current_replicas: current,
            intended_replicas: intended,
        }
    }

    #[test]
    fn refuses_removing_last_master() {
        let groups = [group(true, 1, 0), group(false, 3, 3)];
        assert_eq!(
            DownscaleInvariants::check(&groups),
            Err(InvariantViolation::WouldRemoveLastMaster)
        );
    }

    #[test]
    fn refuses_more_than_one_master_removal_per_pass() {
        let groups = [group(true, 3, 1)];
        assert_eq!(
            DownscaleInvariants::check(&groups),
            Err(InvariantViolation::MoreThanOneMasterRemovalPerPass)
        );
    }

    #[test]
    fn allows_single_master_removal_with_masters_remaining() {
        let groups = [group(true, 3, 2), group(false, 3, 3)];
        assert_eq!(DownscaleInvariants::check(&groups), Ok(()));
    }

    #[test]
    fn partition_may_hold_or_decrease_but_not_increase() {
        assert_eq!(DownscaleInvariants::partition_is_monotonic(3, 3), Ok(()));
        assert_eq!(DownscaleInvariants::partition_is_monotonic(3, 2), Ok(()));
        assert_eq!(
            DownscaleInvariants::partition_is_monotonic(2, 3),
            Err(InvariantViolation::PartitionWentBackwards)
        );
    }

    #[test]
    fn upgrade_concurrency_cap_is_one() {
        assert_eq!(DownscaleInvariants::upgrade_concurrency_ok(1), Ok(()));
        assert_eq!(
            DownscaleInvariants::upgrade_concurrency_ok(2),
            Err(InvariantViolation::UpgradeConcurrencyExceeded)
        );
    }
}
