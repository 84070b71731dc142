//! Static NUMA topology: nodes, CPU membership and the distance matrix.
//!
//! Distances use the ACPI SLIT convention: local access is 10, remote
//! access is larger. The topology is loaded once at init and never mutated.

extern crate alloc;

use alloc::vec;
use alloc::vec::Vec;

use crate::types::{CpuId, Distance, NodeId};

/// Local access distance
pub const LOCAL_DISTANCE: Distance = 10;

/// Distance reported for unknown node pairs
pub const UNKNOWN_DISTANCE: Distance = 255;

// ============================================================================
// NUMA NODE
// ============================================================================

/// NUMA node information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumaNode {
    /// Node ID
    pub id: NodeId,
    /// CPUs on this node
    pub cpus: Vec<CpuId>,
}

impl NumaNode {
    /// Create new NUMA node
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            cpus: Vec::new(),
        }
    }

    /// Add CPUs
    pub fn with_cpus(mut self, cpus: &[CpuId]) -> Self {
        self.cpus.extend_from_slice(cpus);
        self
    }

    /// Has CPU?
    #[inline]
    pub fn has_cpu(&self, cpu: CpuId) -> bool {
        self.cpus.contains(&cpu)
    }
}

// ============================================================================
// NUMA TOPOLOGY
// ============================================================================

/// NUMA topology information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumaTopology {
    /// Node information
    nodes: Vec<NumaNode>,
    /// Distance matrix
    distances: Vec<Vec<Distance>>,
}

impl NumaTopology {
    /// Create a topology of `node_count` empty nodes, all at local distance
    pub fn new(node_count: u32) -> Self {
        let n = node_count as usize;
        Self {
            nodes: (0..node_count).map(NumaNode::new).collect(),
            distances: vec![vec![LOCAL_DISTANCE; n]; n],
        }
    }

    /// One node containing CPUs `0..cpu_count`
    pub fn single_node(cpu_count: usize) -> Self {
        let cpus: Vec<CpuId> = (0..cpu_count as CpuId).collect();
        let mut topology = Self::new(1);
        topology.nodes[0].cpus = cpus;
        topology
    }

    /// `node_count` nodes with `cpus_per_node` consecutive CPUs each and a
    /// uniform remote distance
    pub fn uniform(node_count: u32, cpus_per_node: u32, remote: Distance) -> Self {
        let mut topology = Self::new(node_count);
        for node in 0..node_count {
            let first = node * cpus_per_node;
            topology.nodes[node as usize].cpus = (first..first + cpus_per_node).collect();
            for other in 0..node_count {
                if other != node {
                    topology.set_distance(node, other, remote);
                }
            }
        }
        topology
    }

    /// Assign CPUs to a node
    pub fn assign_cpus(&mut self, node: NodeId, cpus: &[CpuId]) {
        if let Some(n) = self.nodes.get_mut(node as usize) {
            n.cpus.extend_from_slice(cpus);
        }
    }

    /// Set distance between nodes (symmetric)
    pub fn set_distance(&mut self, from: NodeId, to: NodeId, distance: Distance) {
        let f = from as usize;
        let t = to as usize;
        if f < self.distances.len() && t < self.distances.len() {
            self.distances[f][t] = distance;
            self.distances[t][f] = distance;
        }
    }

    /// Distance between nodes
    #[inline]
    pub fn distance(&self, from: NodeId, to: NodeId) -> Distance {
        self.distances
            .get(from as usize)
            .and_then(|row| row.get(to as usize))
            .copied()
            .unwrap_or(UNKNOWN_DISTANCE)
    }

    /// Largest distance in the matrix
    pub fn max_distance(&self) -> Distance {
        self.distances
            .iter()
            .flat_map(|row| row.iter().copied())
            .max()
            .unwrap_or(LOCAL_DISTANCE)
    }

    /// Node owning `cpu`
    #[inline]
    pub fn node_for_cpu(&self, cpu: CpuId) -> Option<NodeId> {
        self.nodes.iter().find(|n| n.has_cpu(cpu)).map(|n| n.id)
    }

    /// Number of nodes
    #[inline(always)]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Nodes
    #[inline(always)]
    pub fn nodes(&self) -> &[NumaNode] {
        &self.nodes
    }

    /// Flattened CPU → node table for `cpu_count` CPUs.
    ///
    /// Fails unless every CPU belongs to exactly one node and the distance
    /// matrix is square, symmetric and local-minimal.
    pub fn cpu_node_table(&self, cpu_count: usize) -> Result<Vec<NodeId>, &'static str> {
        if self.nodes.is_empty() {
            return Err("topology has no nodes");
        }
        let n = self.nodes.len();
        if self.distances.len() != n || self.distances.iter().any(|row| row.len() != n) {
            return Err("distance matrix is not square");
        }
        for i in 0..n {
            if self.distances[i][i] != LOCAL_DISTANCE {
                return Err("local distance must be 10");
            }
            for j in 0..n {
                if self.distances[i][j] != self.distances[j][i] {
                    return Err("distance matrix is not symmetric");
                }
                if i != j && self.distances[i][j] < LOCAL_DISTANCE {
                    return Err("remote distance below local distance");
                }
            }
        }

        let mut table = vec![None; cpu_count];
        for node in &self.nodes {
            for &cpu in &node.cpus {
                let slot = table
                    .get_mut(cpu as usize)
                    .ok_or("topology names a cpu beyond cpu_count")?;
                if slot.is_some() {
                    return Err("cpu assigned to more than one node");
                }
                *slot = Some(node.id);
            }
        }
        table
            .into_iter()
            .map(|node| node.ok_or("cpu not assigned to any node"))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numa_topology_distances() {
        let mut topology = NumaTopology::new(4);
        topology.set_distance(0, 1, 20);
        topology.set_distance(0, 2, 30);

        assert_eq!(topology.distance(0, 1), 20);
        assert_eq!(topology.distance(1, 0), 20);
        assert_eq!(topology.distance(0, 0), LOCAL_DISTANCE);
        assert_eq!(topology.distance(0, 9), UNKNOWN_DISTANCE);
        assert_eq!(topology.max_distance(), 30);
    }

    #[test]
    fn test_uniform_topology_table() {
        let topology = NumaTopology::uniform(2, 2, 21);
        let table = topology.cpu_node_table(4).unwrap();
        assert_eq!(table, alloc::vec![0, 0, 1, 1]);
        assert_eq!(topology.node_for_cpu(3), Some(1));
    }

    #[test]
    fn test_table_rejects_unmapped_cpu() {
        let topology = NumaTopology::uniform(1, 2, 21);
        assert_eq!(
            topology.cpu_node_table(4),
            Err("cpu not assigned to any node")
        );
    }

    #[test]
    fn test_table_rejects_duplicate_cpu() {
        let mut topology = NumaTopology::uniform(2, 2, 21);
        topology.assign_cpus(1, &[0]);
        assert_eq!(
            topology.cpu_node_table(4),
            Err("cpu assigned to more than one node")
        );
    }

    #[test]
    fn test_single_node() {
        let topology = NumaTopology::single_node(3);
        assert_eq!(topology.cpu_node_table(3).unwrap(), alloc::vec![0, 0, 0]);
        assert_eq!(topology.nodes()[0].cpus.len(), 3);
    }
}
