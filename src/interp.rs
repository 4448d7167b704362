//! Frame-based abstract interpretation over decoded method bodies.
//!
//! A single worklist pass simulates the operand stack and local variable
//! table with a caller-supplied value domain, records every normal and
//! exceptional control-flow edge it traverses, and leaves a frame (or `None`
//! for unreachable code) at every instruction index. The CFG builder, the
//! dead-code transform and the multiplier domain are all clients of this one
//! pass, each with a different `Interpreter`.

use anyhow::{Context, Result};

use crate::codec::{field_size, method_descriptor};
use crate::dataflow::UniqueQueue;
use crate::ir::{Insn, Method, Operand};
use crate::opcodes::*;

/// Value domain plugged into the frame simulator.
pub(crate) trait Interpreter {
    type Value: Clone + PartialEq;

    /// Slot width of a value (1 or 2).
    fn size(&self, value: &Self::Value) -> u8;

    /// Value for parameters, uninitialized slots and caught exceptions.
    fn new_value(&mut self, size: u8) -> Self::Value;

    /// Result of executing `insn` over its popped operands (given in push
    /// order). Called for every value-consuming instruction, including those
    /// that push nothing; the result is discarded in that case.
    fn operation(
        &mut self,
        index: usize,
        insn: &Insn,
        popped: &[Self::Value],
        size: u8,
    ) -> Self::Value;

    /// Value transfer for loads, stores and swap. Dup-family instructions
    /// duplicate the value itself and bypass this hook.
    fn copy(&mut self, index: usize, insn: &Insn, value: &Self::Value) -> Self::Value {
        let _ = (index, insn);
        value.clone()
    }

    fn merge(&mut self, a: &Self::Value, b: &Self::Value) -> Self::Value;
}

/// Width-only domain, the `BasicInterpreter` analog: a value is its slot
/// size. Used for reachability, edge recording and max-stack computation.
pub(crate) struct BasicInterpreter;

impl Interpreter for BasicInterpreter {
    type Value = u8;

    fn size(&self, value: &u8) -> u8 {
        *value
    }

    fn new_value(&mut self, size: u8) -> u8 {
        size
    }

    fn operation(&mut self, _index: usize, _insn: &Insn, _popped: &[u8], size: u8) -> u8 {
        size
    }

    fn merge(&mut self, a: &u8, b: &u8) -> u8 {
        *a.max(b)
    }
}

/// Operand stack plus local variable table at one program point.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Frame<V> {
    /// `None` marks an uninitialized slot or the upper half of a wide value.
    pub(crate) locals: Vec<Option<V>>,
    pub(crate) stack: Vec<V>,
}

impl<V: Clone + PartialEq> Frame<V> {
    fn new(locals: usize) -> Self {
        Frame {
            locals: vec![None; locals],
            stack: Vec::new(),
        }
    }

    fn pop(&mut self) -> Result<V> {
        self.stack.pop().context("operand stack underflow")
    }

    fn store<I: Interpreter<Value = V>>(&mut self, interp: &I, slot: usize, value: V) {
        let size = interp.size(&value) as usize;
        if self.locals.len() < slot + size {
            self.locals.resize(slot + size, None);
        }
        // Clobber the upper half of a wide value that spanned this slot.
        if slot > 0 {
            if let Some(prev) = &self.locals[slot - 1] {
                if interp.size(prev) == 2 {
                    self.locals[slot - 1] = None;
                }
            }
        }
        self.locals[slot] = Some(value);
        if size == 2 {
            self.locals[slot + 1] = None;
        }
    }

    /// Slot-wise join; stack heights must agree. Returns whether `self`
    /// changed.
    fn merge<I: Interpreter<Value = V>>(&mut self, interp: &mut I, other: &Frame<V>) -> Result<bool> {
        if self.stack.len() != other.stack.len() {
            anyhow::bail!(
                "operand stack height mismatch at merge ({} vs {})",
                self.stack.len(),
                other.stack.len()
            );
        }
        let mut changed = false;
        for (mine, theirs) in self.stack.iter_mut().zip(&other.stack) {
            if mine != theirs {
                let merged = interp.merge(mine, theirs);
                if *mine != merged {
                    *mine = merged;
                    changed = true;
                }
            }
        }
        if other.locals.len() > self.locals.len() {
            self.locals.resize(other.locals.len(), None);
        }
        for slot in 0..self.locals.len() {
            let theirs = other.locals.get(slot).and_then(|v| v.as_ref());
            let updated = match (self.locals[slot].take(), theirs) {
                (Some(mine), Some(theirs)) => {
                    if mine == *theirs {
                        Some(mine)
                    } else if interp.size(&mine) == interp.size(theirs) {
                        let merged = interp.merge(&mine, theirs);
                        if merged != mine {
                            changed = true;
                        }
                        Some(merged)
                    } else {
                        changed = true;
                        None
                    }
                }
                (Some(_), None) => {
                    changed = true;
                    None
                }
                (None, _) => None,
            };
            self.locals[slot] = updated;
        }
        Ok(changed)
    }
}

/// Outcome of one analysis pass over a method body.
pub(crate) struct Analysis<V> {
    /// Per-instruction entry frame; `None` means unreachable.
    pub(crate) frames: Vec<Option<Frame<V>>>,
    /// Normal successors per instruction index.
    pub(crate) successors: Vec<Vec<usize>>,
    /// Exception-handler successors per instruction index.
    pub(crate) exception_successors: Vec<Vec<usize>>,
}

/// Number of local slots the method needs: parameters plus every slot
/// touched by a load, store or iinc.
pub(crate) fn local_capacity(method: &Method) -> Result<usize> {
    let (args, _) = method_descriptor(&method.descriptor)?;
    let mut capacity = args.iter().map(|s| *s as usize).sum::<usize>();
    if !method.is_static() {
        capacity += 1;
    }
    for insn in &method.instructions {
        let needed = match &insn.operand {
            Operand::Slot(slot) => {
                let wide = matches!(insn.opcode, LLOAD | DLOAD | LSTORE | DSTORE);
                *slot as usize + if wide { 2 } else { 1 }
            }
            Operand::Iinc { slot, .. } => *slot as usize + 1,
            _ => continue,
        };
        capacity = capacity.max(needed);
    }
    Ok(capacity)
}

/// Run the simulator over `method` with the given domain. `owner` is the
/// declaring class name, used only for error reporting.
pub(crate) fn analyze<I: Interpreter>(
    owner: &str,
    method: &Method,
    interp: &mut I,
) -> Result<Analysis<I::Value>> {
    let insns = &method.instructions;
    let count = insns.len();
    let mut analysis = Analysis {
        frames: vec![None; count],
        successors: vec![Vec::new(); count],
        exception_successors: vec![Vec::new(); count],
    };
    if count == 0 {
        return Ok(analysis);
    }

    let mut entry = Frame::new(local_capacity(method)?);
    let (args, _) = method_descriptor(&method.descriptor)?;
    let mut slot = 0usize;
    if !method.is_static() {
        let this = interp.new_value(1);
        entry.store(interp, slot, this);
        slot += 1;
    }
    for size in args {
        let value = interp.new_value(size);
        entry.store(interp, slot, value);
        slot += size as usize;
    }
    analysis.frames[0] = Some(entry);

    let mut worklist = UniqueQueue::new();
    worklist.push(0usize);

    while let Some(index) = worklist.pop() {
        let insn = &insns[index];
        let frame = analysis.frames[index]
            .clone()
            .context("worklist reached an instruction with no frame")?;

        // Exception edges leave from the pre-execution state with the stack
        // replaced by the caught value.
        for tc in &method.try_catches {
            if tc.start <= index && index < tc.end {
                let mut handler_frame = frame.clone();
                handler_frame.stack.clear();
                let caught = interp.new_value(1);
                handler_frame.stack.push(caught);
                record_edge(&mut analysis.exception_successors[index], tc.handler);
                merge_into(
                    &mut analysis.frames,
                    &mut worklist,
                    interp,
                    tc.handler,
                    handler_frame,
                )
                .with_context(|| context_for(owner, method, index))?;
            }
        }

        let mut out = frame;
        execute(&mut out, index, insn, interp)
            .with_context(|| context_for(owner, method, index))?;

        for successor in normal_successors(index, insn, count)
            .with_context(|| context_for(owner, method, index))?
        {
            record_edge(&mut analysis.successors[index], successor);
            merge_into(
                &mut analysis.frames,
                &mut worklist,
                interp,
                successor,
                out.clone(),
            )
            .with_context(|| context_for(owner, method, index))?;
        }
    }

    Ok(analysis)
}

fn context_for(owner: &str, method: &Method, index: usize) -> String {
    format!(
        "analyzing {}.{}{} at instruction {index}",
        owner, method.name, method.descriptor
    )
}

fn record_edge(edges: &mut Vec<usize>, target: usize) {
    if !edges.contains(&target) {
        edges.push(target);
    }
}

fn merge_into<I: Interpreter>(
    frames: &mut [Option<Frame<I::Value>>],
    worklist: &mut UniqueQueue<usize>,
    interp: &mut I,
    target: usize,
    frame: Frame<I::Value>,
) -> Result<()> {
    match &mut frames[target] {
        Some(existing) => {
            if existing.merge(interp, &frame)? {
                worklist.push(target);
            }
        }
        None => {
            frames[target] = Some(frame);
            worklist.push(target);
        }
    }
    Ok(())
}

fn normal_successors(index: usize, insn: &Insn, count: usize) -> Result<Vec<usize>> {
    let fall_through = || -> Result<usize> {
        if index + 1 >= count {
            anyhow::bail!("control falls off the end of the method");
        }
        Ok(index + 1)
    };
    Ok(match (&insn.operand, insn.opcode) {
        (Operand::Branch(target), GOTO) => vec![*target],
        (Operand::Branch(target), _) => vec![*target, fall_through()?],
        (Operand::Switch(switch), _) => {
            let mut all = vec![switch.default];
            for target in &switch.targets {
                record_edge(&mut all, *target);
            }
            all
        }
        _ if is_return(insn.opcode) || insn.opcode == ATHROW => Vec::new(),
        _ => vec![fall_through()?],
    })
}

fn execute<I: Interpreter>(
    frame: &mut Frame<I::Value>,
    index: usize,
    insn: &Insn,
    interp: &mut I,
) -> Result<()> {
    let opcode = insn.opcode;
    match opcode {
        NOP | GOTO => {}
        ACONST_NULL | ICONST_M1..=ICONST_5 | BIPUSH | SIPUSH | FCONST_0..=FCONST_2 | NEW => {
            let value = interp.operation(index, insn, &[], 1);
            frame.stack.push(value);
        }
        LCONST_0 | LCONST_1 | DCONST_0 | DCONST_1 => {
            let value = interp.operation(index, insn, &[], 2);
            frame.stack.push(value);
        }
        LDC => {
            let value = interp.operation(index, insn, &[], 1);
            frame.stack.push(value);
        }
        LDC2_W => {
            let value = interp.operation(index, insn, &[], 2);
            frame.stack.push(value);
        }
        ILOAD..=ALOAD => {
            let slot = slot_of(insn)?;
            let size = if matches!(opcode, LLOAD | DLOAD) { 2 } else { 1 };
            let loaded = match frame.locals.get(slot).and_then(|v| v.as_ref()) {
                Some(value) => interp.copy(index, insn, value),
                None => interp.new_value(size),
            };
            frame.stack.push(loaded);
        }
        ISTORE..=ASTORE => {
            let slot = slot_of(insn)?;
            let value = frame.pop()?;
            let stored = interp.copy(index, insn, &value);
            frame.store(interp, slot, stored);
        }
        IALOAD..=SALOAD => {
            let idx = frame.pop()?;
            let array = frame.pop()?;
            let size = if matches!(opcode, LALOAD | DALOAD) { 2 } else { 1 };
            let value = interp.operation(index, insn, &[array, idx], size);
            frame.stack.push(value);
        }
        IASTORE..=SASTORE => {
            let value = frame.pop()?;
            let idx = frame.pop()?;
            let array = frame.pop()?;
            interp.operation(index, insn, &[array, idx, value], 1);
        }
        POP => {
            let value = frame.pop()?;
            require_size(interp, &value, 1)?;
        }
        POP2 => {
            let value = frame.pop()?;
            if interp.size(&value) == 1 {
                let second = frame.pop()?;
                require_size(interp, &second, 1)?;
            }
        }
        DUP => {
            let top = frame.pop()?;
            require_size(interp, &top, 1)?;
            frame.stack.push(top.clone());
            frame.stack.push(top);
        }
        DUP_X1 => {
            let v1 = frame.pop()?;
            let v2 = frame.pop()?;
            require_size(interp, &v1, 1)?;
            require_size(interp, &v2, 1)?;
            frame.stack.push(v1.clone());
            frame.stack.push(v2);
            frame.stack.push(v1);
        }
        DUP_X2 => {
            let v1 = frame.pop()?;
            let v2 = frame.pop()?;
            if interp.size(&v2) == 2 {
                frame.stack.push(v1.clone());
                frame.stack.push(v2);
                frame.stack.push(v1);
            } else {
                let v3 = frame.pop()?;
                frame.stack.push(v1.clone());
                frame.stack.push(v3);
                frame.stack.push(v2);
                frame.stack.push(v1);
            }
        }
        DUP2 => {
            let v1 = frame.pop()?;
            if interp.size(&v1) == 2 {
                frame.stack.push(v1.clone());
                frame.stack.push(v1);
            } else {
                let v2 = frame.pop()?;
                frame.stack.push(v2.clone());
                frame.stack.push(v1.clone());
                frame.stack.push(v2);
                frame.stack.push(v1);
            }
        }
        DUP2_X1 => {
            let v1 = frame.pop()?;
            if interp.size(&v1) == 2 {
                let v2 = frame.pop()?;
                frame.stack.push(v1.clone());
                frame.stack.push(v2);
                frame.stack.push(v1);
            } else {
                let v2 = frame.pop()?;
                let v3 = frame.pop()?;
                frame.stack.push(v2.clone());
                frame.stack.push(v1.clone());
                frame.stack.push(v3);
                frame.stack.push(v2);
                frame.stack.push(v1);
            }
        }
        DUP2_X2 => {
            let v1 = frame.pop()?;
            if interp.size(&v1) == 2 {
                let v2 = frame.pop()?;
                if interp.size(&v2) == 2 {
                    frame.stack.push(v1.clone());
                    frame.stack.push(v2);
                    frame.stack.push(v1);
                } else {
                    let v3 = frame.pop()?;
                    frame.stack.push(v1.clone());
                    frame.stack.push(v3);
                    frame.stack.push(v2);
                    frame.stack.push(v1);
                }
            } else {
                let v2 = frame.pop()?;
                let v3 = frame.pop()?;
                if interp.size(&v3) == 2 {
                    frame.stack.push(v2.clone());
                    frame.stack.push(v1.clone());
                    frame.stack.push(v3);
                    frame.stack.push(v2);
                    frame.stack.push(v1);
                } else {
                    let v4 = frame.pop()?;
                    frame.stack.push(v2.clone());
                    frame.stack.push(v1.clone());
                    frame.stack.push(v4);
                    frame.stack.push(v3);
                    frame.stack.push(v2);
                    frame.stack.push(v1);
                }
            }
        }
        SWAP => {
            let v1 = frame.pop()?;
            let v2 = frame.pop()?;
            let top = interp.copy(index, insn, &v1);
            let below = interp.copy(index, insn, &v2);
            frame.stack.push(top);
            frame.stack.push(below);
        }
        IADD..=DREM | ISHL..=LXOR | LCMP..=DCMPG => {
            let b = frame.pop()?;
            let a = frame.pop()?;
            let value = interp.operation(index, insn, &[a, b], binary_result_size(opcode));
            frame.stack.push(value);
        }
        INEG..=DNEG | I2L..=I2S | CHECKCAST | INSTANCEOF | ARRAYLENGTH | NEWARRAY | ANEWARRAY => {
            let a = frame.pop()?;
            let value = interp.operation(index, insn, &[a], unary_result_size(opcode));
            frame.stack.push(value);
        }
        IINC => {
            let slot = match insn.operand {
                Operand::Iinc { slot, .. } => slot as usize,
                _ => anyhow::bail!("iinc without iinc operand"),
            };
            let value = interp.operation(index, insn, &[], 1);
            frame.store(interp, slot, value);
        }
        IFEQ..=IFLE | IFNULL | IFNONNULL | TABLESWITCH | LOOKUPSWITCH => {
            let a = frame.pop()?;
            interp.operation(index, insn, &[a], 1);
        }
        IF_ICMPEQ..=IF_ACMPNE => {
            let b = frame.pop()?;
            let a = frame.pop()?;
            interp.operation(index, insn, &[a, b], 1);
        }
        IRETURN..=ARETURN | ATHROW | MONITORENTER | MONITOREXIT => {
            let a = frame.pop()?;
            interp.operation(index, insn, &[a], 1);
        }
        RETURN => {}
        GETSTATIC | GETFIELD => {
            let field = field_of(insn)?;
            let size = field_size(&field.descriptor);
            let mut popped = Vec::new();
            if opcode == GETFIELD {
                popped.push(frame.pop()?);
            }
            let value = interp.operation(index, insn, &popped, size);
            frame.stack.push(value);
        }
        PUTSTATIC | PUTFIELD => {
            let value = frame.pop()?;
            let mut popped = Vec::new();
            if opcode == PUTFIELD {
                popped.push(frame.pop()?);
            }
            popped.push(value);
            interp.operation(index, insn, &popped, 1);
        }
        INVOKEVIRTUAL | INVOKESPECIAL | INVOKESTATIC | INVOKEINTERFACE => {
            let method = match &insn.operand {
                Operand::Method(m) => m,
                _ => anyhow::bail!("invoke without method operand"),
            };
            let (args, ret) = method_descriptor(&method.descriptor)?;
            let mut popped = Vec::with_capacity(args.len() + 1);
            for _ in 0..args.len() {
                popped.push(frame.pop()?);
            }
            if opcode != INVOKESTATIC {
                popped.push(frame.pop()?);
            }
            popped.reverse();
            let value = interp.operation(index, insn, &popped, ret.max(1));
            if ret > 0 {
                frame.stack.push(value);
            }
        }
        MULTIANEWARRAY => {
            let dims = match insn.operand {
                Operand::MultiArray { dims, .. } => dims as usize,
                _ => anyhow::bail!("multianewarray without operand"),
            };
            let mut popped = Vec::with_capacity(dims);
            for _ in 0..dims {
                popped.push(frame.pop()?);
            }
            popped.reverse();
            let value = interp.operation(index, insn, &popped, 1);
            frame.stack.push(value);
        }
        other => anyhow::bail!("unexpected opcode {other:#04x} in decoded body"),
    }
    Ok(())
}

fn require_size<I: Interpreter>(interp: &I, value: &I::Value, size: u8) -> Result<()> {
    if interp.size(value) != size {
        anyhow::bail!("wide value where a single-slot value was expected");
    }
    Ok(())
}

fn slot_of(insn: &Insn) -> Result<usize> {
    match insn.operand {
        Operand::Slot(slot) => Ok(slot as usize),
        _ => anyhow::bail!("load/store without slot operand"),
    }
}

fn field_of(insn: &Insn) -> Result<&crate::ir::FieldRef> {
    match &insn.operand {
        Operand::Field(field) => Ok(field),
        _ => anyhow::bail!("field access without field operand"),
    }
}

fn binary_result_size(opcode: u8) -> u8 {
    match opcode {
        LADD | LSUB | LMUL | LDIV | LREM | LSHL | LSHR | LUSHR | LAND | LOR | LXOR => 2,
        DADD | DSUB | DMUL | DDIV | DREM => 2,
        _ => 1,
    }
}

fn unary_result_size(opcode: u8) -> u8 {
    match opcode {
        LNEG | DNEG | I2L | I2D | L2D | F2L | F2D | D2L => 2,
        _ => 1,
    }
}
