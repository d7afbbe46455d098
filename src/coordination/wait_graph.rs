//! Wait-for graph construction and cycle detection.
//!
//! One reusable detector for every "who holds / who waits" relation in the
//! system: edge A -> B means agent A is blocked on a resource agent B holds,
//! and any cycle is a deadlock. Rebuilt from lock snapshots on each detection
//! pass; never stored.

use std::collections::{HashMap, HashSet};

use super::types::{AgentId, Allocation, WaitingRequest};

/// A detected deadlock: the agents forming the cycle, in traversal order,
/// and the resources whose grants close it.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadlockCycle {
    pub agents: Vec<AgentId>,
    pub resources: Vec<String>,
}

impl DeadlockCycle {
    pub fn contains(&self, agent: &AgentId) -> bool {
        self.agents.contains(agent)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

#[derive(Debug, Default)]
pub struct WaitForGraph {
    edges: HashMap<AgentId, HashSet<AgentId>>,
    /// Resources inducing each edge, keyed by (waiter, holder).
    blocking: HashMap<(AgentId, AgentId), Vec<String>>,
}

impl WaitForGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the graph from one consistent lock snapshot.
    pub fn from_snapshot(allocations: &[Allocation], waiting: &[WaitingRequest]) -> Self {
        let holders: HashMap<&str, &AgentId> = allocations
            .iter()
            .map(|a| (a.resource.as_str(), &a.holder))
            .collect();

        let mut graph = Self::new();
        for request in waiting {
            if let Some(holder) = holders.get(request.resource.as_str())
                && **holder != request.agent
            {
                graph.add_edge(request.agent.clone(), (*holder).clone(), &request.resource);
            }
        }
        graph
    }

    pub fn add_edge(&mut self, waiter: AgentId, holder: AgentId, resource: &str) {
        self.edges
            .entry(waiter.clone())
            .or_default()
            .insert(holder.clone());
        self.blocking
            .entry((waiter, holder))
            .or_default()
            .push(resource.to_string());
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// DFS cycle detection with white/gray/black coloring. Finds at least
    /// one cycle per strongly connected component containing one; nodes are
    /// visited in sorted order so results are deterministic.
    pub fn detect_cycles(&self) -> Vec<DeadlockCycle> {
        let mut nodes: Vec<&AgentId> = self.edges.keys().collect();
        nodes.sort();

        let mut color: HashMap<&AgentId, Color> = HashMap::new();
        let mut cycles = Vec::new();

        fn visit<'a>(
            node: &'a AgentId,
            edges: &'a HashMap<AgentId, HashSet<AgentId>>,
            color: &mut HashMap<&'a AgentId, Color>,
            stack: &mut Vec<&'a AgentId>,
            cycles: &mut Vec<Vec<AgentId>>,
        ) {
            color.insert(node, Color::Gray);
            stack.push(node);

            if let Some(targets) = edges.get(node) {
                let mut sorted: Vec<&AgentId> = targets.iter().collect();
                sorted.sort();
                for next in sorted {
                    match color.get(next).copied().unwrap_or(Color::White) {
                        Color::White => visit(next, edges, color, stack, cycles),
                        Color::Gray => {
                            // Back edge: the stack from `next` onward is a cycle.
                            if let Some(start) = stack.iter().position(|n| *n == next) {
                                cycles.push(stack[start..].iter().map(|n| (*n).clone()).collect());
                            }
                        }
                        Color::Black => {}
                    }
                }
            }

            stack.pop();
            color.insert(node, Color::Black);
        }

        let mut raw_cycles = Vec::new();
        for node in nodes {
            if color.get(node).copied().unwrap_or(Color::White) == Color::White {
                let mut stack = Vec::new();
                visit(node, &self.edges, &mut color, &mut stack, &mut raw_cycles);
            }
        }

        for agents in raw_cycles {
            let resources = self.cycle_resources(&agents);
            cycles.push(DeadlockCycle { agents, resources });
        }
        cycles
    }

    /// Resources whose grants close the cycle, following consecutive edges.
    fn cycle_resources(&self, agents: &[AgentId]) -> Vec<String> {
        let mut resources = Vec::new();
        for (i, waiter) in agents.iter().enumerate() {
            let holder = &agents[(i + 1) % agents.len()];
            if let Some(blocked_on) = self.blocking.get(&(waiter.clone(), holder.clone())) {
                for resource in blocked_on {
                    if !resources.contains(resource) {
                        resources.push(resource.clone());
                    }
                }
            }
        }
        resources
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Instant;

    fn allocation(resource: &str, holder: &str) -> Allocation {
        Allocation {
            resource: resource.to_string(),
            holder: AgentId::new(holder),
            locked_at: Instant::now(),
            locked_at_utc: Utc::now(),
        }
    }

    fn waiting(resource: &str, agent: &str) -> WaitingRequest {
        WaitingRequest {
            resource: resource.to_string(),
            agent: AgentId::new(agent),
            priority: 0,
            enqueued_at: Instant::now(),
        }
    }

    #[test]
    fn test_no_cycle_without_mutual_wait() {
        let allocations = vec![allocation("r1", "a"), allocation("r2", "b")];
        let waiting = vec![waiting("r2", "a")];

        let graph = WaitForGraph::from_snapshot(&allocations, &waiting);
        assert!(graph.detect_cycles().is_empty());
    }

    #[test]
    fn test_two_agent_cycle() {
        // a holds r1 and waits for r2; b holds r2 and waits for r1.
        let allocations = vec![allocation("r1", "a"), allocation("r2", "b")];
        let waits = vec![waiting("r2", "a"), waiting("r1", "b")];

        let graph = WaitForGraph::from_snapshot(&allocations, &waits);
        let cycles = graph.detect_cycles();

        assert_eq!(cycles.len(), 1);
        let cycle = &cycles[0];
        assert_eq!(cycle.agents.len(), 2);
        assert!(cycle.contains(&AgentId::new("a")));
        assert!(cycle.contains(&AgentId::new("b")));
        assert!(cycle.resources.contains(&"r1".to_string()));
        assert!(cycle.resources.contains(&"r2".to_string()));
    }

    #[test]
    fn test_three_agent_cycle() {
        let allocations = vec![
            allocation("r1", "a"),
            allocation("r2", "b"),
            allocation("r3", "c"),
        ];
        let waits = vec![waiting("r2", "a"), waiting("r3", "b"), waiting("r1", "c")];

        let graph = WaitForGraph::from_snapshot(&allocations, &waits);
        let cycles = graph.detect_cycles();

        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].agents.len(), 3);
        assert_eq!(cycles[0].resources.len(), 3);
    }

    #[test]
    fn test_waiting_on_free_resource_adds_no_edge() {
        let allocations = vec![allocation("r1", "a")];
        // r9 is not held by anyone.
        let waits = vec![waiting("r9", "a")];

        let graph = WaitForGraph::from_snapshot(&allocations, &waits);
        assert!(graph.is_empty());
    }

    #[test]
    fn test_chain_is_not_a_cycle() {
        let allocations = vec![
            allocation("r1", "a"),
            allocation("r2", "b"),
            allocation("r3", "c"),
        ];
        let waits = vec![waiting("r2", "a"), waiting("r3", "b")];

        let graph = WaitForGraph::from_snapshot(&allocations, &waits);
        assert!(graph.detect_cycles().is_empty());
    }

    #[test]
    fn test_deterministic_first_agent() {
        let allocations = vec![allocation("r1", "a"), allocation("r2", "b")];
        let waits = vec![waiting("r2", "a"), waiting("r1", "b")];

        let graph = WaitForGraph::from_snapshot(&allocations, &waits);
        let cycles = graph.detect_cycles();
        // Sorted traversal starts at "a".
        assert_eq!(cycles[0].agents[0], AgentId::new("a"));
    }
}
