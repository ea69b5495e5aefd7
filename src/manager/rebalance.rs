use crate::cluster::{NodeId, PartitionId};
use std::collections::HashMap;

/// One idempotent, independently retryable partition move.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MoveOperation {
    pub partition: PartitionId,
    pub source: NodeId,
    pub target: NodeId,
}

/// A rebalance plan with a cursor. Execution advances the cursor move by
/// move; a failed move leaves the cursor in place so the next pass resumes
/// instead of replanning from scratch, and completed moves are never rolled
/// back.
#[derive(Clone, Debug)]
pub struct RebalancePlan {
    pub moves: Vec<MoveOperation>,
    pub cursor: usize,
}

impl RebalancePlan {
    pub fn is_complete(&self) -> bool {
        self.cursor >= self.moves.len()
    }
}

/// Ideal partition count per node: `total / n` each, with the remainder
/// spread over the first nodes in id order.
pub fn ideal_counts(total_partitions: usize, nodes: &[NodeId]) -> HashMap<NodeId, usize> {
    let mut sorted: Vec<NodeId> = nodes.to_vec();
    sorted.sort();

    let n = sorted.len();
    if n == 0 {
        return HashMap::new();
    }
    let base = total_partitions / n;
    let remainder = total_partitions % n;

    sorted
        .into_iter()
        .enumerate()
        .map(|(i, node)| {
            let ideal = if i < remainder { base + 1 } else { base };
            (node, ideal)
        })
        .collect()
}

/// Plan the moves that take `distribution` to its ideal shape: each
/// overloaded node gives its surplus partitions to underloaded nodes,
/// greedily, until every node is within one of ideal.
pub fn compute_plan(distribution: &HashMap<NodeId, Vec<PartitionId>>) -> RebalancePlan {
    let nodes: Vec<NodeId> = distribution.keys().cloned().collect();
    let total: usize = distribution.values().map(|partitions| partitions.len()).sum();
    let ideals = ideal_counts(total, &nodes);

    // Deterministic iteration order for a reproducible plan.
    let mut sorted_nodes = nodes;
    sorted_nodes.sort();

    let mut surplus: Vec<(NodeId, Vec<PartitionId>)> = Vec::new();
    let mut deficits: Vec<(NodeId, usize)> = Vec::new();
    for node in &sorted_nodes {
        let mut owned = distribution[node].clone();
        owned.sort();
        let ideal = ideals[node];

        if owned.len() > ideal {
            let extra = owned.split_off(ideal);
            surplus.push((node.clone(), extra));
        } else if owned.len() < ideal {
            deficits.push((node.clone(), ideal - owned.len()));
        }
    }

    let mut moves = Vec::new();
    let mut deficit_iter = deficits.into_iter();
    let mut current_deficit = deficit_iter.next();
    for (source, partitions) in surplus {
        for partition in partitions {
            let (target, remaining) = match current_deficit.take() {
                Some((target, remaining)) => (target, remaining),
                None => break,
            };

            moves.push(MoveOperation {
                partition,
                source: source.clone(),
                target: target.clone(),
            });

            current_deficit = if remaining > 1 {
                Some((target, remaining - 1))
            } else {
                deficit_iter.next()
            };
        }
    }

    RebalancePlan { moves, cursor: 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> NodeId {
        NodeId::new(id)
    }

    fn partitions(prefix: &str, count: usize) -> Vec<PartitionId> {
        (0..count)
            .map(|i| PartitionId::new(format!("{}-{:02}", prefix, i)))
            .collect()
    }

    fn apply_plan(
        mut distribution: HashMap<NodeId, Vec<PartitionId>>,
        plan: &RebalancePlan,
    ) -> HashMap<NodeId, Vec<PartitionId>> {
        for move_op in &plan.moves {
            let source = distribution.get_mut(&move_op.source).unwrap();
            source.retain(|p| *p != move_op.partition);
            distribution
                .get_mut(&move_op.target)
                .unwrap()
                .push(move_op.partition.clone());
        }
        distribution
    }

    #[test]
    fn ideal_counts_spread_the_remainder() {
        let nodes = vec![node("n1"), node("n2"), node("n3")];
        let ideals = ideal_counts(10, &nodes);

        assert_eq!(ideals[&node("n1")], 4);
        assert_eq!(ideals[&node("n2")], 3);
        assert_eq!(ideals[&node("n3")], 3);
    }

    #[test]
    fn ten_zero_zero_converges_to_within_one_of_ideal() {
        let mut distribution = HashMap::new();
        distribution.insert(node("n1"), partitions("p", 10));
        distribution.insert(node("n2"), Vec::new());
        distribution.insert(node("n3"), Vec::new());

        let plan = compute_plan(&distribution);
        assert_eq!(plan.moves.len(), 6);

        let result = apply_plan(distribution, &plan);
        let mut counts: Vec<usize> = result.values().map(|p| p.len()).collect();
        counts.sort();
        assert_eq!(counts, vec![3, 3, 4]);
    }

    #[test]
    fn balanced_cluster_needs_no_moves() {
        let mut distribution = HashMap::new();
        distribution.insert(node("n1"), partitions("a", 3));
        distribution.insert(node("n2"), partitions("b", 3));
        distribution.insert(node("n3"), partitions("c", 4));

        let plan = compute_plan(&distribution);
        assert!(plan.moves.is_empty());
        assert!(plan.is_complete());
    }

    #[test]
    fn moves_go_from_overloaded_to_underloaded() {
        let mut distribution = HashMap::new();
        distribution.insert(node("n1"), partitions("a", 5));
        distribution.insert(node("n2"), partitions("b", 1));

        let plan = compute_plan(&distribution);
        for move_op in &plan.moves {
            assert_eq!(move_op.source, node("n1"));
            assert_eq!(move_op.target, node("n2"));
        }

        let result = apply_plan(distribution, &plan);
        assert_eq!(result[&node("n1")].len(), 3);
        assert_eq!(result[&node("n2")].len(), 3);
    }

    #[test]
    fn single_node_cluster_is_trivially_balanced() {
        let mut distribution = HashMap::new();
        distribution.insert(node("n1"), partitions("p", 7));

        assert!(compute_plan(&distribution).moves.is_empty());
    }
}
