//! Multiplier finder. Obfuscated fields are stored pre-multiplied by an odd
//! constant and decoded on read by the constant's modular inverse; this pass
//! recovers those constants by running the frame simulator with a provenance
//! domain and inspecting every field store whose value was produced by a
//! multiply of a constant and a field read.

use std::collections::{BTreeSet, HashSet};

use anyhow::{Context, Result};

use crate::interp::{self, Interpreter};
use crate::ir::{FieldRef, Insn, Operand};
use crate::opcodes::{is_add_sub, is_binary, is_field_get, is_field_put, is_multiply};
use crate::pool::ClassPool;
use crate::transform::Transformer;
use crate::transform::modmath::Number;

/// One recovered encoder constant: writes through `setter` multiply by
/// `number`, reads through `getter` must multiply by its inverse.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub(crate) struct FieldInfo {
    pub(crate) setter: String,
    pub(crate) getter: String,
    pub(crate) number: Number,
}

/// Provenance value: the set of instruction indices that could have produced
/// it. A value produced by a binary operation additionally retains its two
/// operand values until a control-flow merge collapses it.
#[derive(Clone, Debug)]
pub(crate) enum MulValue {
    Single {
        size: u8,
        sources: BTreeSet<usize>,
    },
    Two {
        size: u8,
        sources: BTreeSet<usize>,
        one: Box<MulValue>,
        two: Box<MulValue>,
    },
}

// Frame convergence compares width and provenance only; the retained operand
// structure is a lookup aid, not part of the lattice.
impl PartialEq for MulValue {
    fn eq(&self, other: &Self) -> bool {
        self.size() == other.size() && self.sources() == other.sources()
    }
}

impl MulValue {
    fn of(size: u8, index: usize) -> Self {
        MulValue::Single {
            size,
            sources: BTreeSet::from([index]),
        }
    }

    pub(crate) fn size(&self) -> u8 {
        match self {
            MulValue::Single { size, .. } | MulValue::Two { size, .. } => *size,
        }
    }

    pub(crate) fn sources(&self) -> &BTreeSet<usize> {
        match self {
            MulValue::Single { sources, .. } | MulValue::Two { sources, .. } => sources,
        }
    }

    /// The producing instruction, when there is exactly one.
    fn single_source<'a>(&self, insns: &'a [Insn]) -> Option<&'a Insn> {
        let sources = self.sources();
        if sources.len() != 1 {
            return None;
        }
        insns.get(*sources.iter().next().expect("one source"))
    }

    /// The constant, when this value is exactly one int/long immediate load.
    pub(crate) fn const_number(&self, insns: &[Insn]) -> Option<Number> {
        match self.single_source(insns)?.operand {
            Operand::Int(v) => Some(Number::Int(v)),
            Operand::Long(v) => Some(Number::Long(v)),
            _ => None,
        }
    }

    /// The accessed field, when this value is exactly one field read.
    pub(crate) fn field_get<'a>(&self, insns: &'a [Insn]) -> Option<&'a FieldRef> {
        let insn = self.single_source(insns)?;
        if !is_field_get(insn.opcode) {
            return None;
        }
        match &insn.operand {
            Operand::Field(field) => Some(field),
            _ => None,
        }
    }

    pub(crate) fn is_multiply(&self, insns: &[Insn]) -> bool {
        self.single_source(insns)
            .is_some_and(|insn| is_multiply(insn.opcode))
    }

    pub(crate) fn is_add_sub(&self, insns: &[Insn]) -> bool {
        self.single_source(insns)
            .is_some_and(|insn| is_add_sub(insn.opcode))
    }
}

#[derive(Default)]
struct Found {
    // First store wins per distinct constant.
    seen: HashSet<Number>,
    infos: Vec<FieldInfo>,
}

/// Provenance interpreter; watches field stores as a side effect.
struct MulInterpreter<'a> {
    insns: &'a [Insn],
    found: &'a mut Found,
}

impl MulInterpreter<'_> {
    fn inspect_store(&mut self, setter: &FieldRef, value: &MulValue) {
        let MulValue::Two { one, two, .. } = value else {
            return;
        };
        if !value.is_multiply(self.insns) {
            return;
        }
        let (number, getter) = if let (Some(number), Some(getter)) =
            (one.const_number(self.insns), two.field_get(self.insns))
        {
            (number, getter)
        } else if let (Some(number), Some(getter)) =
            (two.const_number(self.insns), one.field_get(self.insns))
        {
            (number, getter)
        } else {
            return;
        };
        if !number.is_invertible() || number.is_self_inverse() {
            return;
        }
        if !self.found.seen.insert(number) {
            return;
        }
        self.found.infos.push(FieldInfo {
            setter: setter.identifier(),
            getter: getter.identifier(),
            number,
        });
    }
}

impl Interpreter for MulInterpreter<'_> {
    type Value = MulValue;

    fn size(&self, value: &MulValue) -> u8 {
        value.size()
    }

    fn new_value(&mut self, size: u8) -> MulValue {
        MulValue::Single {
            size,
            sources: BTreeSet::new(),
        }
    }

    fn operation(&mut self, index: usize, insn: &Insn, popped: &[MulValue], size: u8) -> MulValue {
        if is_field_put(insn.opcode) {
            if let (Operand::Field(field), Some(value)) = (&insn.operand, popped.last()) {
                self.inspect_store(field, value);
            }
        }
        if is_binary(insn.opcode) && popped.len() == 2 {
            MulValue::Two {
                size,
                sources: BTreeSet::from([index]),
                one: Box::new(popped[0].clone()),
                two: Box::new(popped[1].clone()),
            }
        } else {
            MulValue::of(size, index)
        }
    }

    // Loads, stores and swap re-source the value at the copying instruction;
    // dup-family instructions never reach this hook.
    fn copy(&mut self, index: usize, _insn: &Insn, value: &MulValue) -> MulValue {
        MulValue::of(value.size(), index)
    }

    fn merge(&mut self, a: &MulValue, b: &MulValue) -> MulValue {
        if a == b {
            return a.clone();
        }
        MulValue::Single {
            size: a.size().max(b.size()),
            sources: a.sources().union(b.sources()).copied().collect(),
        }
    }
}

pub(crate) struct MultiplierFinder {
    found: Found,
}

impl MultiplierFinder {
    pub(crate) fn new() -> Self {
        MultiplierFinder {
            found: Found::default(),
        }
    }

    /// Everything recovered so far, in discovery order.
    pub(crate) fn multipliers(&self) -> &[FieldInfo] {
        &self.found.infos
    }
}

impl Transformer for MultiplierFinder {
    fn name(&self) -> &'static str {
        "multiplier-finder"
    }

    fn run(&mut self, pool: &mut ClassPool) -> Result<()> {
        for id in pool.active_ids() {
            let class = pool.get(id).context("active class vanished")?;
            for method in &class.methods {
                if method.instructions.is_empty() {
                    continue;
                }
                let mut interp = MulInterpreter {
                    insns: &method.instructions,
                    found: &mut self.found,
                };
                interp::analyze(&class.name, method, &mut interp)?;
            }
        }
        log::info!("found {} field multipliers", self.found.infos.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Class, Field, Method};
    use crate::opcodes::*;

    fn field_ref(name: &str, descriptor: &str) -> FieldRef {
        FieldRef {
            owner: "t".to_string(),
            name: name.to_string(),
            descriptor: descriptor.to_string(),
        }
    }

    fn int_field(name: &str) -> Field {
        Field {
            name: name.to_string(),
            descriptor: "I".to_string(),
            access: ACC_PUBLIC,
            constant_value: None,
        }
    }

    fn pool_with_store(constant: i32) -> ClassPool {
        // this.g = this.f * constant
        let method = Method {
            name: "encode".to_string(),
            descriptor: "()V".to_string(),
            access: ACC_PUBLIC,
            instructions: vec![
                Insn::with(ALOAD, Operand::Slot(0)),
                Insn::with(ALOAD, Operand::Slot(0)),
                Insn::with(GETFIELD, Operand::Field(field_ref("f", "I"))),
                Insn::with(LDC, Operand::Int(constant)),
                Insn::new(IMUL),
                Insn::with(PUTFIELD, Operand::Field(field_ref("g", "I"))),
                Insn::new(RETURN),
            ],
            try_catches: Vec::new(),
            exceptions: Vec::new(),
        };
        let mut pool = ClassPool::new();
        pool.add_class(Class {
            name: "t".to_string(),
            access: ACC_PUBLIC,
            version: (52, 0),
            super_name: None,
            interfaces: Vec::new(),
            fields: vec![int_field("f"), int_field("g")],
            methods: vec![method],
        });
        pool
    }

    #[test]
    fn recovers_an_odd_constant() {
        let mut pool = pool_with_store(3);
        let mut finder = MultiplierFinder::new();
        finder.run(&mut pool).expect("run");
        assert_eq!(
            finder.multipliers(),
            &[FieldInfo {
                setter: "t.g".to_string(),
                getter: "t.f".to_string(),
                number: Number::Int(3),
            }]
        );
    }

    #[test]
    fn even_constants_are_rejected() {
        let mut pool = pool_with_store(2);
        let mut finder = MultiplierFinder::new();
        finder.run(&mut pool).expect("run");
        assert!(finder.multipliers().is_empty());
    }

    #[test]
    fn self_inverse_constants_are_rejected() {
        let mut pool = pool_with_store(1);
        let mut finder = MultiplierFinder::new();
        finder.run(&mut pool).expect("run");
        assert!(finder.multipliers().is_empty());
    }

    #[test]
    fn static_long_fields_use_the_64_bit_path() {
        // t.g = ldc2_w 5 * t.f, operands in constant-first order
        let method = Method {
            name: "encode".to_string(),
            descriptor: "()V".to_string(),
            access: ACC_PUBLIC | ACC_STATIC,
            instructions: vec![
                Insn::with(LDC2_W, Operand::Long(5)),
                Insn::with(GETSTATIC, Operand::Field(field_ref("f", "J"))),
                Insn::new(LMUL),
                Insn::with(PUTSTATIC, Operand::Field(field_ref("g", "J"))),
                Insn::new(RETURN),
            ],
            try_catches: Vec::new(),
            exceptions: Vec::new(),
        };
        let mut pool = ClassPool::new();
        pool.add_class(Class {
            name: "t".to_string(),
            access: ACC_PUBLIC,
            version: (52, 0),
            super_name: None,
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: vec![method],
        });

        let mut finder = MultiplierFinder::new();
        finder.run(&mut pool).expect("run");
        assert_eq!(
            finder.multipliers(),
            &[FieldInfo {
                setter: "t.g".to_string(),
                getter: "t.f".to_string(),
                number: Number::Long(5),
            }]
        );
    }

    #[test]
    fn each_constant_is_recorded_once() {
        let mut pool = pool_with_store(3);
        // A second pass over the same store must not report it again.
        let mut finder = MultiplierFinder::new();
        finder.run(&mut pool).expect("first");
        finder.run(&mut pool).expect("second");
        assert_eq!(finder.multipliers().len(), 1);
    }

    #[test]
    fn provenance_predicates_identify_producers() {
        let insns = vec![
            Insn::with(LDC, Operand::Int(7)),
            Insn::new(IADD),
            Insn::new(IMUL),
        ];
        let constant = MulValue::of(1, 0);
        assert_eq!(constant.const_number(&insns), Some(Number::Int(7)));
        let add = MulValue::of(1, 1);
        assert!(add.is_add_sub(&insns));
        assert!(!add.is_multiply(&insns));
        let mul = MulValue::of(1, 2);
        assert!(mul.is_multiply(&insns));
        assert!(mul.field_get(&insns).is_none());
    }

    #[test]
    fn values_through_locals_lose_their_field_origin() {
        // istore/iload between the read and the multiply breaks provenance.
        let method = Method {
            name: "encode".to_string(),
            descriptor: "()V".to_string(),
            access: ACC_PUBLIC,
            instructions: vec![
                Insn::with(ALOAD, Operand::Slot(0)),
                Insn::with(GETFIELD, Operand::Field(field_ref("f", "I"))),
                Insn::with(ISTORE, Operand::Slot(1)),
                Insn::with(ALOAD, Operand::Slot(0)),
                Insn::with(ILOAD, Operand::Slot(1)),
                Insn::with(LDC, Operand::Int(3)),
                Insn::new(IMUL),
                Insn::with(PUTFIELD, Operand::Field(field_ref("g", "I"))),
                Insn::new(RETURN),
            ],
            try_catches: Vec::new(),
            exceptions: Vec::new(),
        };
        let mut pool = ClassPool::new();
        pool.add_class(Class {
            name: "t".to_string(),
            access: ACC_PUBLIC,
            version: (52, 0),
            super_name: None,
            interfaces: Vec::new(),
            fields: vec![int_field("f"), int_field("g")],
            methods: vec![method],
        });
        let mut finder = MultiplierFinder::new();
        finder.run(&mut pool).expect("run");
        assert!(finder.multipliers().is_empty());
    }
}
