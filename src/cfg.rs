use anyhow::Result;

use crate::interp::{self, BasicInterpreter};
use crate::ir::Method;

/// Edge classification used for CFG inspection; the fixed-point engine
/// treats both kinds identically.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum EdgeKind {
    Normal,
    Exception,
}

/// Directed graph over the instruction indices of one method body,
/// recorded by a single width-domain interpreter pass. Unreachable
/// instructions are vertices with no edges and `reachable(v) == false`.
#[derive(Clone, Debug)]
pub(crate) struct ControlFlowGraph {
    successors: Vec<Vec<(usize, EdgeKind)>>,
    predecessors: Vec<Vec<usize>>,
    reachable: Vec<bool>,
}

impl ControlFlowGraph {
    /// Build the graph for `method`. Pure: the method is never mutated, and
    /// rebuilding from the same instruction list yields the same graph.
    pub(crate) fn build(owner: &str, method: &Method) -> Result<Self> {
        let analysis = interp::analyze(owner, method, &mut BasicInterpreter)?;
        let count = method.instructions.len();
        let mut graph = ControlFlowGraph {
            successors: vec![Vec::new(); count],
            predecessors: vec![Vec::new(); count],
            reachable: analysis.frames.iter().map(|f| f.is_some()).collect(),
        };
        for (from, targets) in analysis.successors.iter().enumerate() {
            for &to in targets {
                graph.add_edge(from, to, EdgeKind::Normal);
            }
        }
        for (from, targets) in analysis.exception_successors.iter().enumerate() {
            for &to in targets {
                graph.add_edge(from, to, EdgeKind::Exception);
            }
        }
        Ok(graph)
    }

    fn add_edge(&mut self, from: usize, to: usize, kind: EdgeKind) {
        if !self.successors[from].iter().any(|(t, _)| *t == to) {
            self.successors[from].push((to, kind));
            self.predecessors[to].push(from);
        }
    }

    /// Edge-reversed copy, for backward analyses.
    pub(crate) fn reversed(&self) -> Self {
        let mut graph = ControlFlowGraph {
            successors: vec![Vec::new(); self.len()],
            predecessors: vec![Vec::new(); self.len()],
            reachable: self.reachable.clone(),
        };
        for (from, targets) in self.successors.iter().enumerate() {
            for &(to, kind) in targets {
                graph.add_edge(to, from, kind);
            }
        }
        graph
    }

    pub(crate) fn len(&self) -> usize {
        self.successors.len()
    }

    pub(crate) fn reachable(&self, vertex: usize) -> bool {
        self.reachable[vertex]
    }

    pub(crate) fn successors(&self, vertex: usize) -> &[(usize, EdgeKind)] {
        &self.successors[vertex]
    }

    pub(crate) fn successor_indices(&self, vertex: usize) -> impl Iterator<Item = usize> + '_ {
        self.successors[vertex].iter().map(|(to, _)| *to)
    }

    pub(crate) fn predecessors(&self, vertex: usize) -> &[usize] {
        &self.predecessors[vertex]
    }

    /// Reachable vertices with no incoming edge; the fixed-point seeds.
    pub(crate) fn entry_vertices(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len()).filter(|v| self.reachable[*v] && self.predecessors[*v].is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Insn, Operand, TryCatch};
    use crate::opcodes::*;

    fn method_of(insns: Vec<Insn>) -> Method {
        Method {
            name: "m".to_string(),
            descriptor: "()V".to_string(),
            access: ACC_STATIC,
            instructions: insns,
            try_catches: Vec::new(),
            exceptions: Vec::new(),
        }
    }

    #[test]
    fn branch_has_two_successors() {
        let method = method_of(vec![
            Insn::with(ICONST_0, Operand::Int(0)),
            Insn::with(IFEQ, Operand::Branch(3)),
            Insn::new(NOP),
            Insn::new(RETURN),
        ]);
        let graph = ControlFlowGraph::build("Test", &method).expect("build");
        let mut targets: Vec<usize> = graph.successor_indices(1).collect();
        targets.sort();
        assert_eq!(targets, vec![2, 3]);
        assert_eq!(graph.predecessors(3), &[1, 2]);
        assert_eq!(graph.entry_vertices().collect::<Vec<_>>(), vec![0]);
    }

    #[test]
    fn exception_edges_are_recorded_with_kind() {
        let mut method = method_of(vec![
            Insn::new(NOP),
            Insn::new(RETURN),
            Insn::new(POP),
            Insn::new(RETURN),
        ]);
        method.try_catches.push(TryCatch {
            start: 0,
            end: 2,
            handler: 2,
            catch_type: None,
        });
        let graph = ControlFlowGraph::build("Test", &method).expect("build");
        assert!(graph
            .successors(0)
            .iter()
            .any(|(to, kind)| *to == 2 && *kind == EdgeKind::Exception));
        assert!(graph
            .successors(0)
            .iter()
            .any(|(to, kind)| *to == 1 && *kind == EdgeKind::Normal));
    }

    #[test]
    fn reversal_swaps_edge_direction() {
        let method = method_of(vec![Insn::new(NOP), Insn::new(RETURN)]);
        let graph = ControlFlowGraph::build("Test", &method).expect("build");
        let reversed = graph.reversed();
        assert_eq!(reversed.successor_indices(1).collect::<Vec<_>>(), vec![0]);
        assert_eq!(reversed.predecessors(0), &[1]);
        assert_eq!(reversed.entry_vertices().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn rebuild_is_isomorphic() {
        let method = method_of(vec![
            Insn::with(GOTO, Operand::Branch(2)),
            Insn::new(NOP),
            Insn::new(RETURN),
        ]);
        let first = ControlFlowGraph::build("Test", &method).expect("build");
        let second = ControlFlowGraph::build("Test", &method).expect("build");
        for v in 0..first.len() {
            assert_eq!(first.successors(v), second.successors(v));
            assert_eq!(first.reachable(v), second.reachable(v));
        }
    }
}
