//! Generic worklist data-flow engine over per-method control-flow graphs.
//!
//! The engine is parameterized by a fact lattice through
//! [`DataFlowAnalysis`]: callers supply the bottom element, an optional entry
//! element, a join and a transfer function. Termination requires a monotone
//! transfer over a lattice of finite height; that is a caller obligation, not
//! something the engine verifies.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;

use anyhow::Result;

use crate::cfg::ControlFlowGraph;
use crate::ir::{Insn, Method};

/// FIFO worklist that ignores pushes of already-pending items.
pub(crate) struct UniqueQueue<T> {
    queue: VecDeque<T>,
    pending: HashSet<T>,
}

impl<T: Copy + Eq + Hash> UniqueQueue<T> {
    pub(crate) fn new() -> Self {
        UniqueQueue {
            queue: VecDeque::new(),
            pending: HashSet::new(),
        }
    }

    pub(crate) fn push(&mut self, value: T) -> bool {
        if self.pending.insert(value) {
            self.queue.push_back(value);
            true
        } else {
            false
        }
    }

    pub(crate) fn pop(&mut self) -> Option<T> {
        let value = self.queue.pop_front()?;
        self.pending.remove(&value);
        Some(value)
    }
}

/// One data-flow problem over a fact lattice.
pub(crate) trait DataFlowAnalysis {
    type Fact: Clone + PartialEq;

    /// Bottom element, assumed for predecessors not yet visited.
    fn initial_fact(&self) -> Self::Fact;

    /// Fact holding before the entry instruction executes. Defaults to the
    /// initial fact; override to seed parameter state.
    fn entry_fact(&self) -> Self::Fact {
        self.initial_fact()
    }

    /// Must be associative, commutative and idempotent.
    fn join(&self, a: &Self::Fact, b: &Self::Fact) -> Self::Fact;

    fn transfer(&self, fact: &Self::Fact, index: usize, insn: &Insn) -> Self::Fact;
}

/// Converged in/out facts. Vertices never reached from the entry set have no
/// entry in either map.
pub(crate) struct DataFlowResult<F> {
    in_facts: HashMap<usize, F>,
    out_facts: HashMap<usize, F>,
}

impl<F> DataFlowResult<F> {
    pub(crate) fn in_fact(&self, index: usize) -> Option<&F> {
        self.in_facts.get(&index)
    }

    pub(crate) fn out_fact(&self, index: usize) -> Option<&F> {
        self.out_facts.get(&index)
    }
}

/// Build the CFG for `method` (reversed when `backward`) and run the
/// analysis to its fixed point.
pub(crate) fn analyze<A: DataFlowAnalysis>(
    analysis: &A,
    owner: &str,
    method: &Method,
    backward: bool,
) -> Result<DataFlowResult<A::Fact>> {
    let graph = ControlFlowGraph::build(owner, method)?;
    let graph = if backward { graph.reversed() } else { graph };
    Ok(run(analysis, &graph, &method.instructions))
}

/// Run the fixed point over an already-built graph.
pub(crate) fn run<A: DataFlowAnalysis>(
    analysis: &A,
    graph: &ControlFlowGraph,
    instructions: &[Insn],
) -> DataFlowResult<A::Fact> {
    let mut result = DataFlowResult {
        in_facts: HashMap::new(),
        out_facts: HashMap::new(),
    };

    let mut worklist = UniqueQueue::new();
    for vertex in graph.entry_vertices() {
        worklist.push(vertex);
    }

    while let Some(vertex) = worklist.pop() {
        let predecessors = graph.predecessors(vertex);
        let in_fact = if predecessors.is_empty() {
            analysis.entry_fact()
        } else {
            let mut acc: Option<A::Fact> = None;
            for &pred in predecessors {
                let out = result
                    .out_facts
                    .get(&pred)
                    .cloned()
                    .unwrap_or_else(|| analysis.initial_fact());
                acc = Some(match acc {
                    Some(current) => analysis.join(&current, &out),
                    None => out,
                });
            }
            acc.expect("non-empty predecessor list")
        };

        let out_fact = analysis.transfer(&in_fact, vertex, &instructions[vertex]);
        result.in_facts.insert(vertex, in_fact);

        if result.out_facts.get(&vertex) != Some(&out_fact) {
            result.out_facts.insert(vertex, out_fact);
            for successor in graph.successor_indices(vertex) {
                worklist.push(successor);
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    use crate::ir::{Insn, Method, Operand};
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

    /// May-reach analysis: the set of instruction indices on some path to a
    /// point. Union join over a finite powerset, so the fixed point exists.
    struct Reaching;

    impl DataFlowAnalysis for Reaching {
        type Fact = BTreeSet<usize>;

        fn initial_fact(&self) -> Self::Fact {
            BTreeSet::new()
        }

        fn join(&self, a: &Self::Fact, b: &Self::Fact) -> Self::Fact {
            a.union(b).copied().collect()
        }

        fn transfer(&self, fact: &Self::Fact, index: usize, _insn: &Insn) -> Self::Fact {
            let mut out = fact.clone();
            out.insert(index);
            out
        }
    }

    fn looping_method() -> Method {
        // 0: iconst_0
        // 1: ifeq -> 4       loop head
        // 2: iconst_0
        // 3: goto -> 1
        // 4: return
        method_of(vec![
            Insn::with(ICONST_0, Operand::Int(0)),
            Insn::with(IFEQ, Operand::Branch(4)),
            Insn::with(ICONST_0, Operand::Int(0)),
            Insn::with(GOTO, Operand::Branch(1)),
            Insn::new(RETURN),
        ])
    }

    #[test]
    fn converges_on_a_loop_and_reaches_a_fixed_point() {
        let method = looping_method();
        let result = analyze(&Reaching, "Test", &method, false).expect("analyze");

        let at_return = result.in_fact(4).expect("return reached");
        assert_eq!(
            at_return.iter().copied().collect::<Vec<_>>(),
            vec![0, 1, 2, 3]
        );

        // Fixed point: transfer(join of predecessor outs) equals the stored
        // out fact at every reached vertex.
        let graph = ControlFlowGraph::build("Test", &method).expect("cfg");
        for vertex in 0..graph.len() {
            let Some(out) = result.out_fact(vertex) else {
                continue;
            };
            let in_fact = if graph.predecessors(vertex).is_empty() {
                Reaching.entry_fact()
            } else {
                graph
                    .predecessors(vertex)
                    .iter()
                    .map(|p| {
                        result
                            .out_fact(*p)
                            .cloned()
                            .unwrap_or_else(|| Reaching.initial_fact())
                    })
                    .fold(Reaching.initial_fact(), |a, b| Reaching.join(&a, &b))
            };
            assert_eq!(
                &Reaching.transfer(&in_fact, vertex, &method.instructions[vertex]),
                out
            );
        }
    }

    #[test]
    fn backward_analysis_runs_on_the_reversed_graph() {
        let method = looping_method();
        let result = analyze(&Reaching, "Test", &method, true).expect("analyze");
        // Backwards, the entry vertex is the return; the method entry sees
        // everything that can execute after it.
        let at_entry = result.in_fact(0).expect("entry reached backwards");
        assert!(at_entry.contains(&1));
        assert!(at_entry.contains(&3));
    }

    #[test]
    fn unreachable_vertices_have_no_facts() {
        let method = method_of(vec![
            Insn::with(GOTO, Operand::Branch(2)),
            Insn::new(NOP),
            Insn::new(RETURN),
        ]);
        let result = analyze(&Reaching, "Test", &method, false).expect("analyze");
        assert!(result.in_fact(1).is_none());
        assert!(result.out_fact(1).is_none());
        assert!(result.out_fact(2).is_some());
    }

    #[test]
    fn unique_queue_deduplicates_pending_entries() {
        let mut queue = UniqueQueue::new();
        assert!(queue.push(1));
        assert!(!queue.push(1));
        assert!(queue.push(2));
        assert_eq!(queue.pop(), Some(1));
        // Popped entries may be queued again.
        assert!(queue.push(1));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), None);
    }
}
