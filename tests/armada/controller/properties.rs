use armada::armada::controller::allocator::{allocate_partitions, allocate_replicas};
use armada::armada::controller::inventory::{Unit, LABEL_UNIT_ORDINAL};
use armada::armada::controller::revision::LABEL_REVISION_HASH;
use armada::armada::controller::scale::{plan_scale, ScaleInput};
use armada::armada::k8s::intstr::IntOrString;
use armada::armada::k8s::pod::{ObjectMeta, Pod, PodSpec};
use armada::armada::k8s::uniteddeployment::{ManualUpdate, SubsetSpec};
use armada::armada::test_support::{labels, mark_ready, seconds_after_epoch};
use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

fn subsets(shares: &[Option<u32>]) -> Vec<SubsetSpec> {
    shares
        .iter()
        .enumerate()
        .map(|(index, share)| SubsetSpec {
            name: format!("zone-{index}"),
            node_selector: HashMap::new(),
            replicas: share.map(|count| IntOrString::Int(count as i32)),
        })
        .collect()
}

fn unit(index: usize, ready: bool, current: bool) -> Unit {
    let ordinal = index as u32;
    let ordinal_label = ordinal.to_string();
    let revision = if current { "rev-2" } else { "rev-1" };
    let mut pod = Pod::new(
        ObjectMeta {
            name: Some(format!("web-{index:03}")),
            labels: labels(&[
                (LABEL_REVISION_HASH, revision),
                (LABEL_UNIT_ORDINAL, ordinal_label.as_str()),
            ]),
            creation_timestamp: Some(seconds_after_epoch(index as i64)),
            ..Default::default()
        },
        PodSpec::default(),
    );
    if ready {
        mark_ready(&mut pod, seconds_after_epoch(index as i64), "sha256:1");
    }
    Unit {
        pod,
        ordinal,
        instance_id: None,
        volumes: Vec::new(),
    }
}

proptest! {
    #[test]
    fn allocation_covers_total_when_a_subset_is_unspecified(
        total in 0u32..200,
        fixed in proptest::collection::vec(proptest::option::of(0u32..20), 0..5),
    ) {
        let mut shares = fixed;
        shares.push(None);
        let specs = subsets(&shares);
        let specified: u32 = shares.iter().flatten().sum();
        match allocate_replicas(total, &specs) {
            Ok(allocation) => {
                prop_assert!(specified <= total);
                let sum: u32 = allocation.iter().map(|(_, count)| *count).sum();
                prop_assert_eq!(sum, total);
                let names: Vec<&str> = allocation.iter().map(|(name, _)| name.as_str()).collect();
                let declared: Vec<&str> = specs.iter().map(|spec| spec.name.as_str()).collect();
                prop_assert_eq!(names, declared);
            }
            Err(err) => {
                prop_assert!(specified > total);
                prop_assert!(err.is_terminal());
            }
        }
    }

    #[test]
    fn allocation_is_deterministic(
        total in 0u32..500,
        shares in proptest::collection::vec(proptest::option::of(0u32..10), 1..6),
    ) {
        let specs = subsets(&shares);
        let first = allocate_replicas(total, &specs).map_err(|err| err.to_string());
        let second = allocate_replicas(total, &specs).map_err(|err| err.to_string());
        prop_assert_eq!(&first, &second);
        if let Ok(allocation) = first {
            let sum: u32 = allocation.iter().map(|(_, count)| *count).sum();
            prop_assert_eq!(sum, total);
        }
    }

    #[test]
    fn partitions_never_exceed_subset_replicas(
        replicas in proptest::collection::vec(0u32..20, 1..5),
        requested in proptest::collection::vec(0u32..40, 1..5),
    ) {
        let allocation: Vec<(String, u32)> = replicas
            .iter()
            .enumerate()
            .map(|(index, count)| (format!("zone-{index}"), *count))
            .collect();
        let manual = ManualUpdate {
            partitions: requested
                .iter()
                .enumerate()
                .map(|(index, partition)| (format!("zone-{index}"), *partition))
                .collect::<BTreeMap<_, _>>(),
        };
        let partitions = allocate_partitions(&allocation, Some(&manual));
        for (name, count) in &allocation {
            prop_assert!(partitions[name] <= *count);
        }
    }

    #[test]
    fn scale_plan_converges_on_desired_without_surge(
        desired in 0u32..30,
        units in proptest::collection::vec((any::<bool>(), any::<bool>()), 0..30),
    ) {
        let active: Vec<Unit> = units
            .iter()
            .enumerate()
            .map(|(index, (ready, current))| unit(index, *ready, *current))
            .collect();
        let used: BTreeSet<u32> = active.iter().map(|unit| unit.ordinal).collect();
        let input = ScaleInput {
            desired,
            active: &active,
            terminating: 0,
            update_revision: "rev-2",
            pods_to_delete: &[],
            max_surge: 0,
            update_in_progress: false,
            orphan_instance_ids: &[],
            used_ordinals: &used,
        };
        let mut next = 0;
        let plan = plan_scale(&input, || {
            next += 1;
            format!("id{next}")
        });

        let after = active.len() + plan.creates.len() - plan.deletions.len();
        prop_assert_eq!(after, desired as usize);
        prop_assert!(plan.creates.is_empty() || plan.deletions.is_empty());
        prop_assert_eq!(plan.deferred, 0);

        let ordinals: HashSet<u32> = plan.creates.iter().map(|create| create.ordinal).collect();
        prop_assert_eq!(ordinals.len(), plan.creates.len());
        prop_assert!(ordinals.iter().all(|ordinal| !used.contains(ordinal)));

        // Ready units at the update revision go last.
        let deleted: HashSet<&str> = plan.deletions.iter().map(|deletion| deletion.name.as_str()).collect();
        let kept_worse = active.iter().any(|unit| {
            !deleted.contains(unit.name()) && (!unit.is_ready() || unit.revision() != Some("rev-2"))
        });
        let dropped_best = active.iter().any(|unit| {
            deleted.contains(unit.name()) && unit.is_ready() && unit.revision() == Some("rev-2")
        });
        prop_assert!(!(kept_worse && dropped_best));
    }
}
