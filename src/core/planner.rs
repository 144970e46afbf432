//! Custom chain planning
//!
//! Chains jump to each other, and `iptables -A X -j Y` fails unless `Y`
//! already exists. The planner turns the document's chain definitions into a
//! dependency graph (`X → Y` when a rule of `X` jumps to `Y`), rejects cycles,
//! and returns a creation order in which every chain comes after the chains
//! it jumps to. Cleanup walks the same order backwards.
//!
//! [`DependencyGraph`] is independent of the document so the removal
//! pipeline can reuse it for chains discovered in the kernel.

use crate::core::error::{Error, Result};
use crate::core::model::{ChainDefinition, ChainName, ChainRef, Document};
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

// ═══════════════════════════════════════════════════════════════════════════
// Chain reference resolution
// ═══════════════════════════════════════════════════════════════════════════

/// Resolves [`ChainRef`]s to declared chains
///
/// A reference names a chain directly, or names the section whose `chain`
/// block declared it. A section alias resolves to the first chain that
/// section declared.
#[derive(Debug)]
pub struct ChainIndex<'a> {
    chains: HashMap<&'a str, &'a ChainDefinition>,
    aliases: HashMap<&'a str, &'a ChainDefinition>,
}

impl<'a> ChainIndex<'a> {
    pub fn new(doc: &'a Document) -> Self {
        let chains: HashMap<&str, &ChainDefinition> =
            doc.chains.iter().map(|c| (c.name.as_str(), c)).collect();

        let mut aliases = HashMap::new();
        for chain in &doc.chains {
            aliases.entry(chain.declared_in.as_str()).or_insert(chain);
        }

        Self { chains, aliases }
    }

    pub fn resolve(&self, reference: &ChainRef) -> Option<&'a ChainName> {
        self.lookup(reference).map(|c| &c.name)
    }

    fn lookup(&self, reference: &ChainRef) -> Option<&'a ChainDefinition> {
        let key = reference.as_str();
        self.chains
            .get(key)
            .or_else(|| self.aliases.get(key))
            .copied()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Dependency graph
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Colour {
    White,
    Gray,
    Black,
}

/// Directed graph of chain jumps, nodes kept in insertion order
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    names: Vec<String>,
    index: HashMap<String, usize>,
    /// `edges[a]` lists the chains `a` jumps to
    edges: Vec<Vec<usize>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node if missing and returns its index
    pub fn add_node(&mut self, name: &str) -> usize {
        if let Some(&i) = self.index.get(name) {
            return i;
        }
        let i = self.names.len();
        self.names.push(name.to_string());
        self.index.insert(name.to_string(), i);
        self.edges.push(Vec::new());
        i
    }

    /// Records that `from` jumps to `to`, adding either node if missing
    pub fn add_edge(&mut self, from: &str, to: &str) {
        let a = self.add_node(from);
        let b = self.add_node(to);
        if !self.edges[a].contains(&b) {
            self.edges[a].push(b);
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Chains `name` jumps to
    pub fn targets(&self, name: &str) -> Vec<&str> {
        self.index.get(name).map_or_else(Vec::new, |&i| {
            self.edges[i].iter().map(|&j| self.names[j].as_str()).collect()
        })
    }

    /// Finds a cycle with a three-colour depth-first search.
    ///
    /// Returns the chains along the cycle with the first one repeated at the
    /// end (`["A", "B", "A"]`), or `None` for a DAG.
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        let mut colour = vec![Colour::White; self.len()];
        let mut stack = Vec::new();

        for start in 0..self.len() {
            if colour[start] == Colour::White
                && let Some(cycle) = self.visit(start, &mut colour, &mut stack)
            {
                return Some(cycle.into_iter().map(|i| self.names[i].clone()).collect());
            }
        }
        None
    }

    fn visit(&self, node: usize, colour: &mut [Colour], stack: &mut Vec<usize>) -> Option<Vec<usize>> {
        colour[node] = Colour::Gray;
        stack.push(node);

        for &next in &self.edges[node] {
            match colour[next] {
                Colour::Gray => {
                    // Back edge: the cycle is the stack suffix starting at `next`
                    let from = stack.iter().rposition(|&n| n == next).unwrap_or(0);
                    let mut cycle = stack[from..].to_vec();
                    cycle.push(next);
                    return Some(cycle);
                }
                Colour::White => {
                    if let Some(cycle) = self.visit(next, colour, stack) {
                        return Some(cycle);
                    }
                }
                Colour::Black => {}
            }
        }

        stack.pop();
        colour[node] = Colour::Black;
        None
    }

    /// Kahn's algorithm over reversed edges: a node is ready once every
    /// chain it jumps to has been emitted. Ready nodes are taken in
    /// insertion order.
    ///
    /// Returns the ordered nodes plus whatever a cycle kept from being
    /// placed, in insertion order.
    pub fn topological_order(&self) -> (Vec<String>, Vec<String>) {
        let n = self.len();
        let mut pending: Vec<usize> = self.edges.iter().map(Vec::len).collect();
        let mut callers: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (from, targets) in self.edges.iter().enumerate() {
            for &to in targets {
                callers[to].push(from);
            }
        }

        let mut ready: BTreeSet<usize> = (0..n).filter(|&i| pending[i] == 0).collect();
        let mut placed = vec![false; n];
        let mut order = Vec::with_capacity(n);

        while let Some(node) = ready.pop_first() {
            placed[node] = true;
            order.push(self.names[node].clone());
            for &caller in &callers[node] {
                pending[caller] -= 1;
                if pending[caller] == 0 {
                    ready.insert(caller);
                }
            }
        }

        let leftover = (0..n)
            .filter(|&i| !placed[i])
            .map(|i| self.names[i].clone())
            .collect();
        (order, leftover)
    }

    /// Creation order, failing on any cycle
    ///
    /// # Errors
    ///
    /// Returns [`Error::CircularChainDependency`] naming the chains on the
    /// first cycle found.
    pub fn creation_order(&self) -> Result<Vec<String>> {
        if let Some(chains) = self.find_cycle() {
            return Err(Error::CircularChainDependency { chains });
        }
        let (order, leftover) = self.topological_order();
        if leftover.is_empty() {
            Ok(order)
        } else {
            Err(Error::CircularChainDependency { chains: leftover })
        }
    }

    /// Deletion order: callers before the chains they jump to. Chains on a
    /// cycle go last in insertion order, which is safe once every chain has
    /// been flushed.
    pub fn cleanup_order(&self) -> Vec<String> {
        let (mut order, leftover) = self.topological_order();
        order.reverse();
        order.extend(leftover);
        order
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Document plan
// ═══════════════════════════════════════════════════════════════════════════

/// Chains of a document in creation order
#[derive(Debug)]
pub struct ChainPlan<'a> {
    order: Vec<&'a ChainDefinition>,
    index: ChainIndex<'a>,
}

impl<'a> ChainPlan<'a> {
    /// Chains with dependencies first
    pub fn creation_order(&self) -> &[&'a ChainDefinition] {
        &self.order
    }

    pub fn resolve(&self, reference: &ChainRef) -> Option<&'a ChainName> {
        self.index.resolve(reference)
    }
}

/// Builds the chain dependency graph of a document.
///
/// # Errors
///
/// Returns [`Error::UnknownChain`] if a chain rule jumps to an undeclared
/// chain.
pub fn build_graph<'a>(doc: &'a Document, index: &ChainIndex<'a>) -> Result<DependencyGraph> {
    let mut graph = DependencyGraph::new();
    for chain in &doc.chains {
        graph.add_node(chain.name.as_str());
    }

    for chain in &doc.chains {
        for (_, rule) in chain.rules() {
            let Some(reference) = rule.chain_reference() else {
                continue;
            };
            let target = index.resolve(reference).ok_or_else(|| Error::UnknownChain {
                referenced_from: chain.name.to_string(),
                name: reference.to_string(),
            })?;
            graph.add_edge(chain.name.as_str(), target.as_str());
        }
    }

    Ok(graph)
}

/// Orders the document's chains for creation.
///
/// # Errors
///
/// Returns [`Error::UnknownChain`] for an unresolved jump inside a chain and
/// [`Error::CircularChainDependency`] if chains jump to each other in a loop.
pub fn plan(doc: &Document) -> Result<ChainPlan<'_>> {
    let index = ChainIndex::new(doc);
    let graph = build_graph(doc, &index)?;
    let names = graph.creation_order()?;

    let order = names
        .iter()
        .filter_map(|name| doc.chain(name))
        .collect::<Vec<_>>();

    debug!(
        "Chain creation order: {}",
        order.iter().map(|c| c.name.as_str()).collect::<Vec<_>>().join(", ")
    );

    Ok(ChainPlan {
        order,
        index,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::document::parse_document;

    fn graph(edges: &[(&str, &str)], nodes: &[&str]) -> DependencyGraph {
        let mut g = DependencyGraph::new();
        for n in nodes {
            g.add_node(n);
        }
        for (a, b) in edges {
            g.add_edge(a, b);
        }
        g
    }

    #[test]
    fn test_dependencies_first() {
        let g = graph(&[("A", "B"), ("B", "C")], &["A", "B", "C"]);
        assert_eq!(g.creation_order().unwrap(), ["C", "B", "A"]);
        assert_eq!(g.cleanup_order(), ["A", "B", "C"]);
    }

    #[test]
    fn test_ties_follow_insertion_order() {
        let g = graph(&[("TOP", "Y")], &["X", "TOP", "Y", "Z"]);
        assert_eq!(g.creation_order().unwrap(), ["X", "Y", "TOP", "Z"]);
    }

    #[test]
    fn test_cycle_detected() {
        let g = graph(&[("A", "B"), ("B", "A")], &["A", "B"]);
        assert_eq!(g.find_cycle().unwrap(), ["A", "B", "A"]);
        assert!(matches!(
            g.creation_order(),
            Err(Error::CircularChainDependency { chains }) if chains.contains(&"B".to_string())
        ));
    }

    #[test]
    fn test_self_jump_is_cycle() {
        let g = graph(&[("LOOP", "LOOP")], &["LOOP"]);
        assert_eq!(g.find_cycle().unwrap(), ["LOOP", "LOOP"]);
    }

    #[test]
    fn test_cycle_reported_without_unrelated_chains() {
        let g = graph(&[("ENTRY", "A"), ("A", "B"), ("B", "C"), ("C", "A")], &["ENTRY", "A", "B", "C"]);
        assert_eq!(g.find_cycle().unwrap(), ["A", "B", "C", "A"]);
    }

    #[test]
    fn test_cleanup_order_tolerates_cycles() {
        let g = graph(&[("A", "B"), ("B", "A"), ("C", "D")], &["A", "B", "C", "D"]);
        assert_eq!(g.cleanup_order(), ["C", "D", "A", "B"]);
    }

    #[test]
    fn test_plan_resolves_section_alias() {
        let doc = parse_document(
            r"
macs:
  chain:
    - name: MAC_ETH1
      rules:
        known:
          mac:
            - mac-source: aa:bb:cc:dd:ee:ff
web:
  chain:
    - name: WEB
      rules:
        to-macs:
          ports:
            - port: 80
              chain: macs
",
        )
        .unwrap();

        let plan = plan(&doc).unwrap();
        let names: Vec<_> = plan.creation_order().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["MAC_ETH1", "WEB"]);
        assert_eq!(
            plan.resolve(&"macs".parse().unwrap()).map(ChainName::as_str),
            Some("MAC_ETH1")
        );
    }

    #[test]
    fn test_plan_unknown_chain() {
        let doc = parse_document(
            "a:\n  chain:\n    - name: A\n      rules:\n        g:\n          ports:\n            - port: 22\n              chain: MISSING\n",
        )
        .unwrap();
        assert!(matches!(
            plan(&doc),
            Err(Error::UnknownChain { referenced_from, name }) if referenced_from == "A" && name == "MISSING"
        ));
    }

    #[test]
    fn test_plan_empty_document() {
        let doc = Document::default();
        let plan = plan(&doc).unwrap();
        assert!(plan.creation_order().is_empty());
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    fn node(i: usize) -> String {
        format!("C{i}")
    }

    proptest! {
        /// Edges only run from higher to lower indices, so the graph is a DAG
        #[test]
        fn test_every_dag_is_ordered(
            n in 1usize..12,
            raw_edges in proptest::collection::vec((0usize..12, 0usize..12), 0..40)
        ) {
            let mut g = DependencyGraph::new();
            for i in 0..n {
                g.add_node(&node(i));
            }
            let edges: Vec<(usize, usize)> = raw_edges
                .into_iter()
                .filter(|(a, b)| a < &n && b < &n && a > b)
                .collect();
            for (a, b) in &edges {
                g.add_edge(&node(*a), &node(*b));
            }

            let order = g.creation_order().unwrap();
            prop_assert_eq!(order.len(), n);
            let pos = |name: &str| order.iter().position(|o| o == name).unwrap();
            for (a, b) in &edges {
                prop_assert!(pos(&node(*a)) > pos(&node(*b)));
            }
        }

        #[test]
        fn test_back_edge_is_rejected(
            n in 2usize..10,
            from in 0usize..10,
            to in 0usize..10
        ) {
            let (from, to) = (from % n, to % n);
            let mut g = DependencyGraph::new();
            for i in 1..n {
                g.add_edge(&node(i), &node(i - 1));
            }
            // Any edge from a lower to a higher-or-equal index closes a loop
            let (lo, hi) = if from <= to { (from, to) } else { (to, from) };
            g.add_edge(&node(lo), &node(hi));

            prop_assert!(g.find_cycle().is_some());
            prop_assert!(g.creation_order().is_err());
        }
    }
}
