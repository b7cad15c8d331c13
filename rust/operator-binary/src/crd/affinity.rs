use stackable_operator::{
    commons::affinity::StackableAffinityFragment, k8s_openapi::api::core::v1::PodAntiAffinity,
};

use crate::crd::APP_NAME;

/// Soft anti-affinity between pods of the same node group: prefer spreading
/// replicas across hosts without making it a hard scheduling requirement.
pub fn get_affinity(cluster_name: &str, group_name: &str) -> StackableAffinityFragment {
    StackableAffinityFragment {
        pod_affinity: None,
        pod_anti_affinity: Some(PodAntiAffinity {
            preferred_during_scheduling_ignored_during_execution: Some(vec![
                stackable_operator::commons::affinity::affinity_between_role_pods(
                    APP_NAME,
                    cluster_name,
                    group_name,
                    70,
                ),
            ]),
            required_during_scheduling_ignored_during_execution: None,
        }),
        node_affinity: None,
        node_selector: None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use stackable_operator::k8s_openapi::{
        api::core::v1::{PodAffinityTerm, PodAntiAffinity, WeightedPodAffinityTerm},
        apimachinery::pkg::apis::meta::v1::LabelSelector,
    };

    use super::*;

    #[test]
    fn test_affinity_prefers_spreading_across_hosts() {
        let affinity = get_affinity("simple-search", "masters");

        assert_eq!(
            affinity,
            StackableAffinityFragment {
                pod_affinity: None,
                pod_anti_affinity: Some(PodAntiAffinity {
                    preferred_during_scheduling_ignored_during_execution: Some(vec![
                        WeightedPodAffinityTerm {
                            pod_affinity_term: PodAffinityTerm {
                                label_selector: Some(LabelSelector {
                                    match_labels: Some(BTreeMap::from([
                                        (
                                            "app.kubernetes.io/name".to_string(),
                                            "search".to_string(),
                                        ),
                                        (
                                            "app.kubernetes.io/instance".to_string(),
                                            "simple-search".to_string(),
                                        ),
                                        (
                                            "app.kubernetes.io/component".to_string(),
                                            "masters".to_string(),
                                        )
                                    ])),
                                    ..LabelSelector::default()
                                }),
                                topology_key: "kubernetes.io/hostname".to_string(),
                                ..PodAffinityTerm::default()
                            },
                            weight: 70
                        }
                    ]),
                    required_during_scheduling_ignored_during_execution: None,
                }),
                node_affinity: None,
                node_selector: None,
            }
        );
    }
}
