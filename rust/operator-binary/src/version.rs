//! The version-family strategy (§4.2, §9): a small, fixed capability set that
//! varies between the cluster's "old" and "new" coordination protocol, kept
//! as a value-carrying sum type rather than a trait object hierarchy, per the
//! design note in §9 ("prefer a value-carrying sum type over class
//! inheritance").

use crate::crd::v1alpha1;

/// The coordination protocol a cluster version speaks. New-protocol clusters
/// use voting-config exclusions; old-protocol clusters use the
/// `minimum_master_nodes` transient setting.
///
/// §9 open question (1): a cross-major upgrade that mixes old- and
/// new-protocol groups within a single cluster is not modeled as a third
/// variant here. Both `initial_masters`/`min_masters`/`voting_exclusions`
/// capabilities remain independently toggleable per the open question's
/// resolution, so callers that need mixed behavior can consult
/// `VersionFamily::of` per group rather than once per cluster.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VersionFamily {
    OldProtocol,
    NewProtocol,
}

/// The major version at which the coordination protocol switched.
const NEW_PROTOCOL_MIN_MAJOR: u64 = 7;

impl VersionFamily {
    pub fn of(version: &semver::Version) -> Self {
        if version.major >= NEW_PROTOCOL_MIN_MAJOR {
            VersionFamily::NewProtocol
        } else {
            VersionFamily::OldProtocol
        }
    }

    pub fn for_cluster(cluster: &v1alpha1::SearchCluster) -> crate::crd::Result<Self> {
        Ok(Self::of(&cluster.parsed_version()?))
    }

    /// Whether this family expects `cluster.initial_master_nodes` to be
    /// written into the bootstrap configuration of the first-ever master
    /// group (Scenario A).
    pub fn needs_initial_master_nodes(self) -> bool {
        match self {
            VersionFamily::OldProtocol => true,
            VersionFamily::NewProtocol => true,
        }
    }

    /// Whether `minimum_master_nodes` must be maintained via the admin API
    /// as masters are added or removed.
    pub fn uses_minimum_master_nodes(self) -> bool {
        matches!(self, VersionFamily::OldProtocol)
    }

    /// Whether voting-config exclusions are the mechanism for safely
    /// removing a master-eligible node.
    pub fn uses_voting_config_exclusions(self) -> bool {
        matches!(self, VersionFamily::NewProtocol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn old_protocol_below_major_7() {
        assert_eq!(
            VersionFamily::of(&semver::Version::parse("6.8.23").unwrap()),
            VersionFamily::OldProtocol
        );
    }

    #[test]
    fn new_protocol_from_major_7() {
        assert_eq!(
            VersionFamily::of(&semver::Version::parse("7.2.0").unwrap()),
            VersionFamily::NewProtocol
        );
        assert_eq!(
            VersionFamily::of(&semver::Version::parse("8.4.1").unwrap()),
            VersionFamily::NewProtocol
        );
    }

    #[test]
    fn capability_toggles_are_mutually_exclusive() {
        assert!(VersionFamily::OldProtocol.uses_minimum_master_nodes());
        assert!(!VersionFamily::OldProtocol.uses_voting_config_exclusions());
        assert!(!VersionFamily::NewProtocol.uses_minimum_master_nodes());
        assert!(VersionFamily::NewProtocol.uses_voting_config_exclusions());
    }
}
