//! The dependency graph over targets, imports and files, plus its
//! construction from an analyzed plan.
//!
//! An edge `a -> b` means "a depends on b": b must be ready before a is
//! built.  Output files depend on the target that produces them, so
//! consumers of a generated file transitively wait for its producer.

use crate::analyze::{self, DepSet};
use crate::densemap::{DenseMap, Index};
use crate::env::{self, Environment, Import};
use crate::error::EngineError;
use crate::parse::{Expr, Plan};
use crate::smallmap::SmallMap;
use crate::subdoc::SubdocExtractor;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::str::FromStr;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl Index for NodeId {
    fn index(&self) -> usize {
        self.0 as usize
    }
}

impl From<usize> for NodeId {
    fn from(u: usize) -> Self {
        NodeId(u as u32)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Target,
    ImportedObject,
    ImportedFunction,
    InputFile,
    OutputFile,
    SubDoc,
}

/// Per-target rebuild policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Trigger {
    /// Rebuild on any change: command, dependencies, or output files.
    #[default]
    Any,
    /// Rebuild only if the cached value is missing from the object store.
    Missing,
    /// Rebuild every run.
    Always,
    /// Rebuild only when the command changes.
    Command,
    /// Rebuild only when a dependency changes.
    Depends,
    /// Rebuild only when an output file changed or vanished.
    FileChange,
}

impl FromStr for Trigger {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "any" => Ok(Trigger::Any),
            "missing" => Ok(Trigger::Missing),
            "always" => Ok(Trigger::Always),
            "command" => Ok(Trigger::Command),
            "depends" => Ok(Trigger::Depends),
            "file" | "file_change" => Ok(Trigger::FileChange),
            other => Err(format!("unknown trigger {:?}", other)),
        }
    }
}

#[derive(Debug)]
pub struct Node {
    pub name: String,
    pub kind: NodeKind,
    /// Only targets carry a command.
    pub command: Option<Expr>,
    pub trigger: Trigger,
    /// Backend override for this target, if the plan row named one.
    pub evaluator: Option<String>,
    /// Pass-through columns from the plan row.
    pub extra: SmallMap<String, String>,
    /// For file nodes, the path on disk.
    pub path: Option<String>,
    /// Nodes this node depends on, in insertion order, deduplicated.
    pub deps: Vec<NodeId>,
    /// Reverse edges.
    pub dependents: Vec<NodeId>,
}

impl Node {
    fn new(name: String, kind: NodeKind) -> Self {
        Node {
            name,
            kind,
            command: None,
            trigger: Trigger::default(),
            evaluator: None,
            extra: SmallMap::default(),
            path: None,
            deps: Vec::new(),
            dependents: Vec::new(),
        }
    }

    pub fn is_target(&self) -> bool {
        self.kind == NodeKind::Target
    }

    pub fn is_file(&self) -> bool {
        matches!(
            self.kind,
            NodeKind::InputFile | NodeKind::OutputFile | NodeKind::SubDoc
        )
    }
}

#[derive(Debug, Default)]
pub struct Graph {
    nodes: DenseMap<NodeId, Node>,
    by_name: HashMap<String, NodeId>,
}

impl Graph {
    pub fn new() -> Graph {
        Graph::default()
    }

    pub fn node(&self, id: NodeId) -> &Node {
        self.nodes.get(id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.nodes.get_mut(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.ids()
    }

    pub fn targets(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes
            .iter()
            .filter(|(_, n)| n.is_target())
            .map(|(id, _)| id)
    }

    pub fn lookup(&self, name: &str) -> Option<NodeId> {
        self.by_name.get(name).copied()
    }

    /// Insert a node, failing on duplicate names for non-file kinds.
    /// File nodes are shared: looking up an existing path returns it.
    fn add_node(&mut self, name: String, kind: NodeKind) -> Result<NodeId, EngineError> {
        if let Some(&id) = self.by_name.get(&name) {
            return Err(EngineError::NameCollision(self.nodes.get(id).name.clone()));
        }
        let id = self.nodes.push(Node::new(name.clone(), kind));
        self.by_name.insert(name, id);
        Ok(id)
    }

    fn file_node(&mut self, path: &str, kind: NodeKind) -> NodeId {
        let name = format!("file:{}", path);
        if let Some(&id) = self.by_name.get(&name) {
            return id;
        }
        let mut node = Node::new(name.clone(), kind);
        node.path = Some(path.to_owned());
        let id = self.nodes.push(node);
        self.by_name.insert(name, id);
        id
    }

    /// Add an edge "from depends on to".  Self-loops are silently dropped.
    pub fn add_edge(&mut self, from: NodeId, to: NodeId) {
        if from == to {
            return;
        }
        if self.nodes.get(from).deps.contains(&to) {
            return;
        }
        self.nodes.get_mut(from).deps.push(to);
        self.nodes.get_mut(to).dependents.push(from);
    }

    /// Tri-color depth-first search for cycles.  Returns the offending
    /// cycle as a name sequence.
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }
        let mut color = DenseMap::<NodeId, Color>::new_sized(self.nodes.len(), Color::White);
        let mut stack: Vec<NodeId> = Vec::new();

        // Iterative DFS; the explicit stack carries (node, next dep index).
        for root in self.nodes.ids() {
            if *color.get(root) != Color::White {
                continue;
            }
            let mut work: Vec<(NodeId, usize)> = vec![(root, 0)];
            *color.get_mut(root) = Color::Gray;
            stack.push(root);
            while let Some(&(id, next)) = work.last() {
                let deps = &self.nodes.get(id).deps;
                if next < deps.len() {
                    work.last_mut().unwrap().1 += 1;
                    let dep = deps[next];
                    match *color.get(dep) {
                        Color::White => {
                            *color.get_mut(dep) = Color::Gray;
                            stack.push(dep);
                            work.push((dep, 0));
                        }
                        Color::Gray => {
                            // Found a back edge; slice the cycle out of the
                            // gray stack.
                            let start = stack.iter().position(|&n| n == dep).unwrap();
                            let mut cycle: Vec<String> = stack[start..]
                                .iter()
                                .map(|&n| self.nodes.get(n).name.clone())
                                .collect();
                            cycle.push(self.nodes.get(dep).name.clone());
                            return Some(cycle);
                        }
                        Color::Black => {}
                    }
                } else {
                    *color.get_mut(id) = Color::Black;
                    stack.pop();
                    work.pop();
                }
            }
        }
        None
    }

    /// Topological layering (Kahn): layer 0 holds nodes with no
    /// dependencies; each next layer holds nodes whose dependencies all
    /// live in earlier layers.
    pub fn layers(&self) -> Vec<Vec<NodeId>> {
        let mut remaining = DenseMap::<NodeId, usize>::new_sized(self.nodes.len(), 0);
        for id in self.nodes.ids() {
            *remaining.get_mut(id) = self.nodes.get(id).deps.len();
        }
        let mut layers = Vec::new();
        let mut current: Vec<NodeId> = self
            .nodes
            .ids()
            .filter(|&id| *remaining.get(id) == 0)
            .collect();
        let mut seen = current.len();
        while !current.is_empty() {
            let mut next = Vec::new();
            for &id in &current {
                for &dep in &self.nodes.get(id).dependents {
                    let r = remaining.get_mut(dep);
                    *r -= 1;
                    if *r == 0 {
                        next.push(dep);
                        seen += 1;
                    }
                }
            }
            layers.push(std::mem::replace(&mut current, next));
        }
        debug_assert_eq!(seen, self.nodes.len(), "layering requires an acyclic graph");
        layers
    }

    /// Parallel stages: the layering restricted to outdated targets, with
    /// empty layers dropped.  This is the staged scheduler's work list.
    pub fn parallel_stages(&self, outdated: &HashSet<NodeId>) -> Vec<Vec<NodeId>> {
        self.layers()
            .into_iter()
            .map(|layer| {
                layer
                    .into_iter()
                    .filter(|id| self.nodes.get(*id).is_target() && outdated.contains(id))
                    .collect::<Vec<_>>()
            })
            .filter(|layer| !layer.is_empty())
            .collect()
    }

    /// The widest stage that still has outdated work; workers beyond this
    /// count cannot be used.
    pub fn max_useful_parallelism(&self, outdated: &HashSet<NodeId>) -> usize {
        self.parallel_stages(outdated)
            .iter()
            .map(|layer| layer.len())
            .max()
            .unwrap_or(0)
    }
}

/// A plan analyzed into a graph, keeping the per-target dependency sets
/// around for hashing and inspection.
#[derive(Debug)]
pub struct PlanGraph {
    pub graph: Graph,
    pub depsets: HashMap<NodeId, DepSet>,
}

/// Analyze every command, scan the environment, and merge both into a DAG.
pub fn build_graph(
    plan: &Plan,
    env: &Environment,
    extractor: &dyn SubdocExtractor,
    default_trigger: Trigger,
    strict: bool,
) -> Result<PlanGraph, EngineError> {
    let mut graph = Graph::new();
    let mut depsets = HashMap::new();

    // Pass 1: one node per target row.
    let mut row_deps: Vec<(NodeId, DepSet)> = Vec::new();
    for row in &plan.rows {
        let id = graph.add_node(row.name.clone(), NodeKind::Target)?;
        let node = graph.node_mut(id);
        node.command = Some(row.command.clone());
        node.evaluator = row.evaluator.clone();
        node.extra = row.extra.clone();
        node.trigger = match &row.trigger {
            Some(text) => Trigger::from_str(text)
                .map_err(|err| EngineError::Parse(format!("target {:?}: {}", row.name, err)))?,
            None => default_trigger,
        };

        let mut deps = analyze::analyze_with_subdocs(&row.command, extractor)
            .map_err(EngineError::Parse)?;
        analyze::suppress_self(&mut deps, &row.name);
        row_deps.push((id, deps));
    }

    // Pass 2: imports reachable from the plan's references.
    let mut roots: BTreeSet<String> = BTreeSet::new();
    for (_, deps) in &row_deps {
        roots.extend(deps.name_deps().cloned());
    }
    let scanned = env::scan(env, &roots);
    for (name, _) in &scanned {
        let kind = match env.get(name) {
            Some(Import::Function(_)) => NodeKind::ImportedFunction,
            Some(Import::File(_)) => NodeKind::InputFile,
            _ => NodeKind::ImportedObject,
        };
        let id = graph.add_node(name.clone(), kind)?;
        if let Some(Import::File(path)) = env.get(name) {
            graph.node_mut(id).path = Some(path.clone());
        }
    }

    // Pass 3: edges.
    for (id, deps) in row_deps {
        let name = graph.node(id).name.clone();
        for dep in deps.name_deps() {
            match graph.lookup(dep) {
                Some(dep_id) => graph.add_edge(id, dep_id),
                None => {
                    let err = EngineError::MissingDependency {
                        target: name.clone(),
                        name: dep.clone(),
                    };
                    if strict {
                        return Err(err);
                    }
                    warn!("{}", err);
                }
            }
        }
        for path in &deps.reads {
            let file = graph.file_node(path, NodeKind::InputFile);
            graph.add_edge(id, file);
        }
        for path in &deps.subdocs {
            let file = graph.file_node(path, NodeKind::SubDoc);
            graph.add_edge(id, file);
        }
        for path in &deps.writes {
            let file = graph.file_node(path, NodeKind::OutputFile);
            graph.node_mut(file).kind = NodeKind::OutputFile;
            // The output file depends on the target that produces it.
            graph.add_edge(file, id);
        }
        depsets.insert(id, deps);
    }

    // Import-to-import edges, and file reads of imported functions.
    for (name, deps) in &scanned {
        let id = graph.lookup(name).expect("scanned import was added");
        for dep in deps.name_deps() {
            if let Some(dep_id) = graph.lookup(dep) {
                graph.add_edge(id, dep_id);
            }
        }
        for path in &deps.reads {
            let file = graph.file_node(path, NodeKind::InputFile);
            graph.add_edge(id, file);
        }
        depsets.insert(id, deps.clone());
    }

    if let Some(cycle) = graph.find_cycle() {
        return Err(EngineError::CyclicPlan(cycle));
    }

    Ok(PlanGraph { graph, depsets })
}
