//! Append-only genealogy of every agent spawned during a run.
//!
//! Nodes live in a vector; all parent/child references are indices into that
//! vector, with an id map on the side for lookups.  The DAG is guaranteed
//! acyclic by construction (parents must already exist when a child is
//! registered), but every traversal still carries a visited-set guard.
//!
//! Each node also carries an epigenetic memory record (insights, learned
//! patterns, avoided mistakes) written only by the orchestrator when it
//! spawns the agent.

use crate::evoforge::dna::AgentDna;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::error::Error;
use std::fmt;

/// Per-agent epigenetic memory, distinct from heritable DNA.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EpigeneticMemory {
    pub insights: Vec<String>,
    pub learned_patterns: Vec<String>,
    pub avoided_mistakes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LineageNode {
    id: String,
    name: String,
    generation: u32,
    parent_ids: Vec<String>,
    #[serde(skip)]
    parents: Vec<usize>,
    #[serde(skip)]
    children: Vec<usize>,
    /// 0 for roots, `1 + max(parent depth)` otherwise.
    depth: u32,
    /// Position in registration order, starting at 0.
    birth_order: u64,
    birth: DateTime<Utc>,
    memory: EpigeneticMemory,
}

/// Errors raised by lineage registration and snapshot import.
#[derive(Debug, Clone)]
pub enum LineageError {
    /// A child referenced a parent id that has not been registered.  This is
    /// a programmer error under the spawn-commit discipline; callers abort
    /// the run.
    UnknownParent { child: String, parent: String },
    /// The agent id is already present.
    DuplicateAgent(String),
    /// A snapshot could not be decoded.
    MalformedSnapshot(String),
}

impl fmt::Display for LineageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LineageError::UnknownParent { child, parent } => write!(
                f,
                "cannot register '{}': parent '{}' is unknown",
                child, parent
            ),
            LineageError::DuplicateAgent(id) => {
                write!(f, "agent '{}' is already registered", id)
            }
            LineageError::MalformedSnapshot(msg) => {
                write!(f, "malformed lineage snapshot: {}", msg)
            }
        }
    }
}

impl Error for LineageError {}

/// One node of the rendered family forest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FamilyTreeNode {
    pub id: String,
    pub name: String,
    pub generation: u32,
    pub depth: u32,
    pub children: Vec<FamilyTreeNode>,
}

/// Aggregate lineage statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LineageStats {
    pub total_agents: usize,
    pub max_depth: u32,
    pub roots: usize,
    pub mean_children: f64,
}

/// The genealogy graph for a run.
///
/// # Example
///
/// ```rust
/// use evoforge::dna::{AgentDna, Capability, TraitVector};
/// use evoforge::lineage::LineageTracker;
///
/// let mut lineage = LineageTracker::new();
/// let root = AgentDna::root("Prime", TraitVector::default(),
///     vec![Capability::Ideation], "m", "ideate");
/// lineage.register(&root).unwrap();
///
/// assert_eq!(lineage.stats().roots, 1);
/// assert!(lineage.ancestors(&root.id).unwrap().is_empty());
/// ```
#[derive(Default)]
pub struct LineageTracker {
    nodes: Vec<LineageNode>,
    index: HashMap<String, usize>,
}

impl LineageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Insert a node for `dna` and link it under its parents.
    ///
    /// Parents must already exist: the orchestrator commits DNA before
    /// children ever reference it, so a missing parent is an invariant
    /// violation rather than a recoverable condition.
    pub fn register(&mut self, dna: &AgentDna) -> Result<(), LineageError> {
        if self.index.contains_key(&dna.id) {
            return Err(LineageError::DuplicateAgent(dna.id.clone()));
        }
        let mut parents = Vec::with_capacity(dna.parent_ids.len());
        for parent_id in &dna.parent_ids {
            match self.index.get(parent_id) {
                Some(&idx) => parents.push(idx),
                None => {
                    return Err(LineageError::UnknownParent {
                        child: dna.id.clone(),
                        parent: parent_id.clone(),
                    });
                }
            }
        }
        let depth = parents
            .iter()
            .map(|&p| self.nodes[p].depth + 1)
            .max()
            .unwrap_or(0);
        let idx = self.nodes.len();
        for &p in &parents {
            self.nodes[p].children.push(idx);
        }
        self.nodes.push(LineageNode {
            id: dna.id.clone(),
            name: dna.name.clone(),
            generation: dna.generation,
            parent_ids: dna.parent_ids.clone(),
            parents,
            children: Vec::new(),
            depth,
            birth_order: idx as u64,
            birth: dna.birth,
            memory: EpigeneticMemory::default(),
        });
        Ok(())
    }

    /// Mutate an agent's epigenetic memory record.  Only the orchestrator
    /// calls this, at spawn time.
    pub fn with_memory<F>(&mut self, id: &str, f: F) -> bool
    where
        F: FnOnce(&mut EpigeneticMemory),
    {
        match self.index.get(id) {
            Some(&idx) => {
                f(&mut self.nodes[idx].memory);
                true
            }
            None => false,
        }
    }

    /// Read an agent's epigenetic memory.
    pub fn memory(&self, id: &str) -> Option<&EpigeneticMemory> {
        self.index.get(id).map(|&idx| &self.nodes[idx].memory)
    }

    /// All transitive ancestors of `id`, nearest first.  `None` for an
    /// unknown id.
    pub fn ancestors(&self, id: &str) -> Option<Vec<String>> {
        let &start = self.index.get(id)?;
        Some(self.traverse(start, |node| &node.parents))
    }

    /// All transitive descendants of `id`, nearest first.  `None` for an
    /// unknown id.
    pub fn descendants(&self, id: &str) -> Option<Vec<String>> {
        let &start = self.index.get(id)?;
        Some(self.traverse(start, |node| &node.children))
    }

    /// Agents sharing at least one parent with `id`, excluding `id` itself.
    pub fn siblings(&self, id: &str) -> Option<Vec<String>> {
        let &start = self.index.get(id)?;
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for &parent in &self.nodes[start].parents {
            for &child in &self.nodes[parent].children {
                if child != start && seen.insert(child) {
                    out.push(self.nodes[child].id.clone());
                }
            }
        }
        Some(out)
    }

    /// Breadth-first walk along `edges`, with a visited-set cycle guard.
    fn traverse<F>(&self, start: usize, edges: F) -> Vec<String>
    where
        F: Fn(&LineageNode) -> &Vec<usize>,
    {
        let mut visited = HashSet::new();
        visited.insert(start);
        let mut queue: VecDeque<usize> = edges(&self.nodes[start]).iter().cloned().collect();
        let mut out = Vec::new();
        while let Some(idx) = queue.pop_front() {
            if !visited.insert(idx) {
                continue;
            }
            out.push(self.nodes[idx].id.clone());
            for &next in edges(&self.nodes[idx]) {
                if !visited.contains(&next) {
                    queue.push_back(next);
                }
            }
        }
        out
    }

    /// The forest rooted at parentless agents, suitable for hierarchical
    /// rendering.  Children appear in birth order.  The visited set is shared
    /// across the whole forest, so an agent with two parents renders exactly
    /// once, under whichever root reaches it first.
    pub fn family_tree(&self) -> Vec<FamilyTreeNode> {
        let mut visited = HashSet::new();
        let mut forest = Vec::new();
        for (idx, node) in self.nodes.iter().enumerate() {
            if node.parents.is_empty() {
                forest.push(self.render_subtree(idx, &mut visited));
            }
        }
        forest
    }

    fn render_subtree(&self, idx: usize, visited: &mut HashSet<usize>) -> FamilyTreeNode {
        visited.insert(idx);
        let node = &self.nodes[idx];
        let mut children = Vec::new();
        for &child in &node.children {
            if !visited.contains(&child) {
                children.push(self.render_subtree(child, visited));
            }
        }
        FamilyTreeNode {
            id: node.id.clone(),
            name: node.name.clone(),
            generation: node.generation,
            depth: node.depth,
            children,
        }
    }

    /// Aggregate statistics over the whole graph.
    pub fn stats(&self) -> LineageStats {
        if self.nodes.is_empty() {
            return LineageStats::default();
        }
        let total = self.nodes.len();
        let max_depth = self.nodes.iter().map(|n| n.depth).max().unwrap_or(0);
        let roots = self.nodes.iter().filter(|n| n.parents.is_empty()).count();
        let child_edges: usize = self.nodes.iter().map(|n| n.children.len()).sum();
        LineageStats {
            total_agents: total,
            max_depth,
            roots,
            mean_children: child_edges as f64 / total as f64,
        }
    }

    /// Deterministic JSON serialization of the graph, nodes in birth order.
    /// Debugging aid; not used on the hot path.
    pub fn export_snapshot(&self) -> String {
        serde_json::to_string_pretty(&self.nodes).unwrap_or_else(|_| String::from("[]"))
    }

    /// Rebuild a tracker from [`export_snapshot`](LineageTracker::export_snapshot)
    /// output.  Traversal results on the imported tracker equal those on the
    /// original.
    pub fn import_snapshot(snapshot: &str) -> Result<Self, LineageError> {
        let mut nodes: Vec<LineageNode> = serde_json::from_str(snapshot)
            .map_err(|e| LineageError::MalformedSnapshot(e.to_string()))?;
        let index: HashMap<String, usize> = nodes
            .iter()
            .enumerate()
            .map(|(idx, node)| (node.id.clone(), idx))
            .collect();
        if index.len() != nodes.len() {
            return Err(LineageError::MalformedSnapshot(String::from(
                "duplicate node ids",
            )));
        }
        // Relink the index-based edges, which are skipped in serialization.
        for i in 0..nodes.len() {
            let parent_ids = nodes[i].parent_ids.clone();
            let mut parents = Vec::with_capacity(parent_ids.len());
            for parent_id in &parent_ids {
                let &p = index.get(parent_id).ok_or_else(|| {
                    LineageError::MalformedSnapshot(format!("unknown parent '{}'", parent_id))
                })?;
                parents.push(p);
                nodes[p].children.push(i);
            }
            nodes[i].parents = parents;
        }
        Ok(Self { nodes, index })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evoforge::dna::{breed, AgentDna, Capability, TraitVector};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn root(name: &str) -> AgentDna {
        AgentDna::root(
            name,
            TraitVector::default(),
            vec![Capability::Ideation],
            "m",
            "work",
        )
    }

    #[test]
    fn register_rejects_unknown_parent() {
        let mut lineage = LineageTracker::new();
        let a = root("A");
        let b = root("B");
        lineage.register(&a).unwrap();
        lineage.register(&b).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let child = breed(&a, &b, 0.0, &mut rng);
        let mut orphan = child.clone();
        orphan.id = String::from("orphan");
        orphan.parent_ids = vec![String::from("ghost")];
        match lineage.register(&orphan) {
            Err(LineageError::UnknownParent { .. }) => {}
            other => panic!("expected UnknownParent, got {:?}", other),
        }
        lineage.register(&child).unwrap();
        assert_eq!(lineage.len(), 3);
    }

    #[test]
    fn traversals_and_depth() {
        let mut lineage = LineageTracker::new();
        let a = root("A");
        let b = root("B");
        lineage.register(&a).unwrap();
        lineage.register(&b).unwrap();
        let mut rng = StdRng::seed_from_u64(2);
        let child = breed(&a, &b, 0.0, &mut rng);
        lineage.register(&child).unwrap();
        let grandchild = breed(&child, &a, 0.0, &mut rng);
        lineage.register(&grandchild).unwrap();

        let ancestors = lineage.ancestors(&grandchild.id).unwrap();
        assert!(ancestors.contains(&a.id));
        assert!(ancestors.contains(&b.id));
        assert!(ancestors.contains(&child.id));

        let descendants = lineage.descendants(&a.id).unwrap();
        assert!(descendants.contains(&child.id));
        assert!(descendants.contains(&grandchild.id));

        // child and grandchild share parent A
        let siblings = lineage.siblings(&child.id).unwrap();
        assert!(siblings.contains(&grandchild.id));

        let stats = lineage.stats();
        assert_eq!(stats.total_agents, 4);
        assert_eq!(stats.roots, 2);
        assert_eq!(stats.max_depth, 2);
    }

    #[test]
    fn family_tree_is_a_forest() {
        let mut lineage = LineageTracker::new();
        let a = root("A");
        let b = root("B");
        lineage.register(&a).unwrap();
        lineage.register(&b).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let child = breed(&a, &b, 0.0, &mut rng);
        lineage.register(&child).unwrap();

        let forest = lineage.family_tree();
        assert_eq!(forest.len(), 2);
        // the child renders under whichever root reaches it first
        let rendered_children: usize = forest.iter().map(|n| n.children.len()).sum();
        assert_eq!(rendered_children, 1);
    }

    #[test]
    fn snapshot_round_trip_preserves_traversals() {
        let mut lineage = LineageTracker::new();
        let a = root("A");
        let b = root("B");
        lineage.register(&a).unwrap();
        lineage.register(&b).unwrap();
        let mut rng = StdRng::seed_from_u64(4);
        let child = breed(&a, &b, 0.0, &mut rng);
        lineage.register(&child).unwrap();
        lineage.with_memory(&child.id, |m| {
            m.insights.push(String::from("spawned for coverage"))
        });

        let snapshot = lineage.export_snapshot();
        let imported = LineageTracker::import_snapshot(&snapshot).unwrap();

        assert_eq!(
            lineage.ancestors(&child.id).unwrap(),
            imported.ancestors(&child.id).unwrap()
        );
        assert_eq!(
            lineage.descendants(&a.id).unwrap(),
            imported.descendants(&a.id).unwrap()
        );
        assert_eq!(
            imported.memory(&child.id).unwrap().insights,
            vec![String::from("spawned for coverage")]
        );
        // deterministic: exporting the import yields identical text
        assert_eq!(snapshot, imported.export_snapshot());
    }
}
