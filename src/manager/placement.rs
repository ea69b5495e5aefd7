use crate::cluster::NodeId;
use std::cmp::Ordering;
use std::collections::HashSet;

/// A node eligible to receive a partition, snapshotted by the distribution
/// manager at selection time.
#[derive(Clone, Debug)]
pub struct PlacementCandidate {
    pub id: NodeId,
    pub load: f64,
    pub free_storage_bytes: u64,
    pub rack_id: String,
    pub datacenter_id: String,
}

#[derive(Debug, thiserror::Error)]
pub enum PlacementError {
    #[error("Not enough eligible nodes: need {needed}, have {available}")]
    NotEnoughNodes { needed: usize, available: usize },
}

/// Choose `needed` nodes from `candidates`, preferring ascending load with
/// descending free storage as the tiebreak, and spreading across failure
/// domains: racks not already covered first, then datacenters, then any
/// eligible node. `used_racks`/`used_datacenters` carry the domains of
/// already-placed replicas so a padded selection stays diverse.
pub fn select_targets(
    mut candidates: Vec<PlacementCandidate>,
    used_racks: &HashSet<String>,
    used_datacenters: &HashSet<String>,
    needed: usize,
) -> Result<Vec<NodeId>, PlacementError> {
    if candidates.len() < needed {
        return Err(PlacementError::NotEnoughNodes {
            needed,
            available: candidates.len(),
        });
    }

    candidates.sort_by(compare_candidates);

    let mut used_racks = used_racks.clone();
    let mut used_datacenters = used_datacenters.clone();
    let mut selected: Vec<NodeId> = Vec::with_capacity(needed);
    let mut remaining: Vec<PlacementCandidate> = Vec::new();

    // Pass 1: untouched racks.
    for candidate in candidates {
        if selected.len() < needed && !used_racks.contains(&candidate.rack_id) {
            used_racks.insert(candidate.rack_id.clone());
            used_datacenters.insert(candidate.datacenter_id.clone());
            selected.push(candidate.id);
        } else {
            remaining.push(candidate);
        }
    }

    // Pass 2: untouched datacenters among rack-colliding nodes.
    let mut leftovers: Vec<PlacementCandidate> = Vec::new();
    for candidate in remaining {
        if selected.len() < needed && !used_datacenters.contains(&candidate.datacenter_id) {
            used_datacenters.insert(candidate.datacenter_id.clone());
            selected.push(candidate.id);
        } else {
            leftovers.push(candidate);
        }
    }

    // Pass 3: anyone eligible.
    for candidate in leftovers {
        if selected.len() == needed {
            break;
        }
        selected.push(candidate.id);
    }

    Ok(selected)
}

fn compare_candidates(a: &PlacementCandidate, b: &PlacementCandidate) -> Ordering {
    a.load
        .partial_cmp(&b.load)
        .unwrap_or(Ordering::Equal)
        .then(b.free_storage_bytes.cmp(&a.free_storage_bytes))
        .then(a.id.cmp(&b.id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str, load: f64, free: u64, rack: &str, dc: &str) -> PlacementCandidate {
        PlacementCandidate {
            id: NodeId::new(id),
            load,
            free_storage_bytes: free,
            rack_id: rack.to_string(),
            datacenter_id: dc.to_string(),
        }
    }

    #[test]
    fn spreads_across_distinct_racks() {
        let candidates = vec![
            candidate("n1", 0.1, 100, "r1", "dc1"),
            candidate("n2", 0.2, 100, "r1", "dc1"),
            candidate("n3", 0.3, 100, "r2", "dc1"),
            candidate("n4", 0.4, 100, "r3", "dc1"),
        ];

        let selected =
            select_targets(candidates, &HashSet::new(), &HashSet::new(), 3).unwrap();
        assert_eq!(
            selected,
            vec![NodeId::new("n1"), NodeId::new("n3"), NodeId::new("n4")]
        );
    }

    #[test]
    fn prefers_lower_load_within_a_rack() {
        let candidates = vec![
            candidate("busy", 0.9, 100, "r1", "dc1"),
            candidate("idle", 0.1, 100, "r1", "dc1"),
        ];

        let selected = select_targets(candidates, &HashSet::new(), &HashSet::new(), 1).unwrap();
        assert_eq!(selected, vec![NodeId::new("idle")]);
    }

    #[test]
    fn free_storage_breaks_load_ties() {
        let candidates = vec![
            candidate("small", 0.5, 10, "r1", "dc1"),
            candidate("big", 0.5, 1000, "r2", "dc1"),
        ];

        let selected = select_targets(candidates, &HashSet::new(), &HashSet::new(), 1).unwrap();
        assert_eq!(selected, vec![NodeId::new("big")]);
    }

    #[test]
    fn existing_racks_are_avoided_first() {
        let mut used_racks = HashSet::new();
        used_racks.insert("r1".to_string());

        let candidates = vec![
            candidate("n1", 0.1, 100, "r1", "dc1"),
            candidate("n2", 0.5, 100, "r2", "dc1"),
        ];

        let selected = select_targets(candidates, &used_racks, &HashSet::new(), 1).unwrap();
        assert_eq!(selected, vec![NodeId::new("n2")]);
    }

    #[test]
    fn falls_back_to_shared_racks_when_needed() {
        let candidates = vec![
            candidate("n1", 0.1, 100, "r1", "dc1"),
            candidate("n2", 0.2, 100, "r1", "dc1"),
            candidate("n3", 0.3, 100, "r1", "dc2"),
        ];

        let selected =
            select_targets(candidates, &HashSet::new(), &HashSet::new(), 3).unwrap();
        assert_eq!(selected.len(), 3);
    }

    #[test]
    fn too_few_candidates_is_an_error() {
        let candidates = vec![candidate("n1", 0.1, 100, "r1", "dc1")];
        let err = select_targets(candidates, &HashSet::new(), &HashSet::new(), 3).unwrap_err();
        assert!(matches!(
            err,
            PlacementError::NotEnoughNodes { needed: 3, available: 1 }
        ));
    }

    #[test]
    fn datacenter_diversity_beats_arbitrary_fill() {
        // r1 is taken; between two r1 nodes, the one in a fresh datacenter
        // wins even though its load is higher.
        let mut used_racks = HashSet::new();
        used_racks.insert("r1".to_string());
        let mut used_dcs = HashSet::new();
        used_dcs.insert("dc1".to_string());

        let candidates = vec![
            candidate("same-dc", 0.1, 100, "r1", "dc1"),
            candidate("new-dc", 0.5, 100, "r1", "dc2"),
        ];

        let selected = select_targets(candidates, &used_racks, &used_dcs, 1).unwrap();
        assert_eq!(selected, vec![NodeId::new("new-dc")]);
    }
}
