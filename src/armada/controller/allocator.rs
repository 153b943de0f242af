/*
 * Copyright (C) 2024 The Nanocloud Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::armada::controller::error::ControllerError;
use crate::armada::k8s::intstr::Rounding;
use crate::armada::k8s::uniteddeployment::{ManualUpdate, SubsetSpec};
use std::collections::{BTreeMap, HashSet};

/// Replicas per subset, in declaration order.
pub type Allocation = Vec<(String, u32)>;

enum Share {
    Fixed(u32),
    Percent(u32, u32),
    Unspecified,
}

/// Splits `total` across `subsets`.
///
/// Absolute shares are taken as written and percentages are floored. What
/// is left goes evenly to subsets without a share, earliest-declared first
/// for the leftover. When every subset is a percentage and they sum to 100,
/// the leftover from flooring goes to the earliest-declared subsets instead.
/// Any other topology whose shares fall short of `total` is rejected.
pub fn allocate_replicas(total: u32, subsets: &[SubsetSpec]) -> Result<Allocation, ControllerError> {
    let mut seen = HashSet::new();
    let mut shares = Vec::with_capacity(subsets.len());
    for subset in subsets {
        if !seen.insert(subset.name.as_str()) {
            return Err(ControllerError::Invalid(format!(
                "subset {} is declared more than once",
                subset.name
            )));
        }
        let field = format!("subset {} replicas", subset.name);
        let share = match &subset.replicas {
            None => Share::Unspecified,
            Some(value) => match value.as_percent(&field).map_err(ControllerError::Invalid)? {
                Some(percent) => Share::Percent(
                    percent,
                    value
                        .scaled_value(total, Rounding::Down, &field)
                        .map_err(ControllerError::Invalid)?,
                ),
                None => Share::Fixed(
                    value
                        .scaled_value(total, Rounding::Down, &field)
                        .map_err(ControllerError::Invalid)?,
                ),
            },
        };
        shares.push(share);
    }

    let mut replicas: Vec<u32> = shares
        .iter()
        .map(|share| match share {
            Share::Fixed(count) | Share::Percent(_, count) => *count,
            Share::Unspecified => 0,
        })
        .collect();
    let specified: u64 = replicas.iter().map(|count| u64::from(*count)).sum();
    if specified > u64::from(total) {
        return Err(ControllerError::Invalid(format!(
            "subset replicas sum to {specified}, more than the {total} requested"
        )));
    }
    let remainder = total - specified as u32;

    let unspecified: Vec<usize> = shares
        .iter()
        .enumerate()
        .filter(|(_, share)| matches!(share, Share::Unspecified))
        .map(|(index, _)| index)
        .collect();
    let all_percent = !shares.is_empty() && shares.iter().all(|share| matches!(share, Share::Percent(..)));
    let percent_sum: u32 = shares
        .iter()
        .map(|share| match share {
            Share::Percent(percent, _) => *percent,
            _ => 0,
        })
        .sum();

    if !unspecified.is_empty() {
        let each = remainder / unspecified.len() as u32;
        let leftover = (remainder % unspecified.len() as u32) as usize;
        for (position, &index) in unspecified.iter().enumerate() {
            replicas[index] = each + u32::from(position < leftover);
        }
    } else if all_percent && percent_sum == 100 {
        let count = replicas.len();
        for offset in 0..remainder as usize {
            replicas[offset % count] += 1;
        }
    } else if remainder > 0 && !shares.is_empty() {
        return Err(ControllerError::Invalid(format!(
            "subset replicas sum to {specified}, fewer than the {total} requested"
        )));
    }

    Ok(subsets
        .iter()
        .zip(replicas)
        .map(|(subset, count)| (subset.name.clone(), count))
        .collect())
}

/// Manual partition per subset, capped at the subset's replicas.
pub fn allocate_partitions(
    allocation: &[(String, u32)],
    manual: Option<&ManualUpdate>,
) -> BTreeMap<String, u32> {
    allocation
        .iter()
        .map(|(name, replicas)| {
            let partition = manual
                .and_then(|manual| manual.partitions.get(name))
                .copied()
                .unwrap_or(0);
            (name.clone(), partition.min(*replicas))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::armada::k8s::intstr::IntOrString;
    use std::collections::HashMap;

    fn subset(name: &str, replicas: Option<IntOrString>) -> SubsetSpec {
        SubsetSpec {
            name: name.to_string(),
            node_selector: HashMap::new(),
            replicas,
        }
    }

    fn counts(allocation: &Allocation) -> Vec<u32> {
        allocation.iter().map(|(_, count)| *count).collect()
    }

    #[test]
    fn even_percent_split_gives_leftover_to_earliest_subset() {
        let subsets = vec![
            subset("zone-a", Some(IntOrString::percent(50))),
            subset("zone-b", Some(IntOrString::percent(50))),
        ];
        assert_eq!(counts(&allocate_replicas(5, &subsets).unwrap()), vec![3, 2]);
        assert_eq!(counts(&allocate_replicas(10, &subsets).unwrap()), vec![5, 5]);
    }

    #[test]
    fn remainder_goes_to_unspecified_subsets() {
        let subsets = vec![
            subset("fixed", Some(IntOrString::Int(2))),
            subset("share", Some(IntOrString::percent(30))),
            subset("rest-a", None),
            subset("rest-b", None),
        ];
        let allocation = allocate_replicas(10, &subsets).unwrap();
        assert_eq!(counts(&allocation), vec![2, 3, 3, 2]);
        assert_eq!(allocation[2].0, "rest-a");
    }

    #[test]
    fn fully_specified_shares_must_cover_the_total() {
        let percents = vec![
            subset("zone-a", Some(IntOrString::percent(40))),
            subset("zone-b", Some(IntOrString::percent(40))),
        ];
        let err = allocate_replicas(10, &percents).unwrap_err();
        assert!(err.is_terminal());

        let fixed = vec![
            subset("zone-a", Some(IntOrString::Int(3))),
            subset("zone-b", Some(IntOrString::Int(3))),
        ];
        assert!(allocate_replicas(10, &fixed).unwrap_err().is_terminal());
        assert_eq!(counts(&allocate_replicas(6, &fixed).unwrap()), vec![3, 3]);

        let mixed = vec![
            subset("zone-a", Some(IntOrString::Int(2))),
            subset("zone-b", Some(IntOrString::percent(50))),
        ];
        assert_eq!(counts(&allocate_replicas(4, &mixed).unwrap()), vec![2, 2]);
        assert!(allocate_replicas(5, &mixed).is_err());
    }

    #[test]
    fn oversubscribed_or_duplicate_subsets_are_invalid() {
        let subsets = vec![
            subset("zone-a", Some(IntOrString::Int(4))),
            subset("zone-b", Some(IntOrString::Int(4))),
        ];
        let err = allocate_replicas(6, &subsets).unwrap_err();
        assert!(err.is_terminal());

        let subsets = vec![subset("zone-a", None), subset("zone-a", None)];
        assert!(allocate_replicas(6, &subsets).is_err());
    }

    #[test]
    fn partitions_default_to_zero_and_cap_at_replicas() {
        let allocation = vec![("zone-a".to_string(), 3), ("zone-b".to_string(), 2)];
        let manual = ManualUpdate {
            partitions: [("zone-a".to_string(), 5)].into_iter().collect(),
        };
        let partitions = allocate_partitions(&allocation, Some(&manual));
        assert_eq!(partitions["zone-a"], 3);
        assert_eq!(partitions["zone-b"], 0);
    }
}
