//! Deletes instructions the frame analyzer proves unreachable. Branch and
//! switch targets of surviving instructions are themselves reachable, so only
//! try-catch ranges can point into deleted code; they are remapped to the
//! next surviving index and dropped when that empties them or their handler
//! died.

use anyhow::{Context, Result};

use crate::interp::{self, BasicInterpreter};
use crate::ir::{Method, Operand};
use crate::pool::ClassPool;
use crate::transform::Transformer;

pub(crate) struct DeadCodeRemover {
    count: usize,
}

impl DeadCodeRemover {
    pub(crate) fn new() -> Self {
        DeadCodeRemover { count: 0 }
    }
}

impl Transformer for DeadCodeRemover {
    fn name(&self) -> &'static str {
        "dead-code-remover"
    }

    fn run(&mut self, pool: &mut ClassPool) -> Result<()> {
        for id in pool.active_ids() {
            let class = pool.get_mut(id).context("active class vanished")?;
            let name = class.name.clone();
            for method in &mut class.methods {
                self.count += strip_dead(&name, method)?;
            }
        }
        log::info!("removed {} dead instructions", self.count);
        Ok(())
    }
}

fn strip_dead(owner: &str, method: &mut Method) -> Result<usize> {
    if !method.has_code() || method.instructions.is_empty() {
        return Ok(0);
    }
    let analysis = interp::analyze(owner, method, &mut BasicInterpreter)?;
    let keep: Vec<bool> = analysis.frames.iter().map(|f| f.is_some()).collect();
    let dead = keep.iter().filter(|k| !**k).count();
    if dead == 0 {
        return Ok(0);
    }

    // new_index[i] is the post-deletion position of instruction i when kept,
    // and of the next surviving instruction otherwise; new_index[len] is the
    // new length, where exclusive range ends land.
    let len = keep.len();
    let mut new_index = vec![0usize; len + 1];
    let mut next = 0usize;
    for i in 0..len {
        new_index[i] = next;
        if keep[i] {
            next += 1;
        }
    }
    new_index[len] = next;
    let map = |i: usize| new_index[i.min(len)];

    let old = std::mem::take(&mut method.instructions);
    method.instructions = old
        .into_iter()
        .enumerate()
        .filter(|(i, _)| keep[*i])
        .map(|(_, mut insn)| {
            match &mut insn.operand {
                Operand::Branch(target) => *target = map(*target),
                Operand::Switch(switch) => {
                    switch.default = map(switch.default);
                    for target in &mut switch.targets {
                        *target = map(*target);
                    }
                }
                _ => {}
            }
            insn
        })
        .collect();

    method.try_catches.retain_mut(|tc| {
        if tc.handler >= len || !keep[tc.handler] {
            return false;
        }
        tc.start = map(tc.start);
        tc.end = map(tc.end);
        tc.handler = map(tc.handler);
        tc.start < tc.end
    });

    Ok(dead)
}
