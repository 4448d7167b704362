//! `ir::Class` back to class-file bytes. The constant pool is rebuilt from
//! scratch; code layout runs a small fixpoint because switch padding and
//! wide-goto selection depend on the byte offsets they themselves shift.

use std::collections::HashMap;

use anyhow::{Context, Result};

use crate::codec::{ByteWriter, encode_mutf8};
use crate::interp::{self, BasicInterpreter};
use crate::ir::{Class, ConstValue, Insn, Method, Operand};
use crate::opcodes::*;

enum PoolEntry {
    Utf8(Vec<u8>),
    Int(i32),
    Float(u32),
    Long(i64),
    Double(u64),
    Class(u16),
    Str(u16),
    FieldRef { class: u16, nat: u16 },
    MethodRef { class: u16, nat: u16, interface: bool },
    NameAndType { name: u16, descriptor: u16 },
}

#[derive(Default)]
struct PoolBuilder {
    entries: Vec<Option<PoolEntry>>,
    utf8: HashMap<String, u16>,
    classes: HashMap<String, u16>,
    strings: HashMap<String, u16>,
    ints: HashMap<i32, u16>,
    floats: HashMap<u32, u16>,
    longs: HashMap<i64, u16>,
    doubles: HashMap<u64, u16>,
    nats: HashMap<(u16, u16), u16>,
    field_refs: HashMap<(u16, u16), u16>,
    method_refs: HashMap<(u16, u16, bool), u16>,
}

impl PoolBuilder {
    fn push(&mut self, entry: PoolEntry) -> Result<u16> {
        let wide = matches!(entry, PoolEntry::Long(_) | PoolEntry::Double(_));
        // Slot 0 is implicit; `entries` stores slots 1..count.
        let index = self.entries.len() + 1;
        self.entries.push(Some(entry));
        if wide {
            self.entries.push(None);
        }
        u16::try_from(index)
            .ok()
            .filter(|_| self.entries.len() < 0xffff)
            .context("constant pool overflow")
    }

    fn utf8(&mut self, text: &str) -> Result<u16> {
        if let Some(index) = self.utf8.get(text) {
            return Ok(*index);
        }
        let index = self.push(PoolEntry::Utf8(encode_mutf8(text)))?;
        self.utf8.insert(text.to_string(), index);
        Ok(index)
    }

    fn class(&mut self, name: &str) -> Result<u16> {
        if let Some(index) = self.classes.get(name) {
            return Ok(*index);
        }
        let utf8 = self.utf8(name)?;
        let index = self.push(PoolEntry::Class(utf8))?;
        self.classes.insert(name.to_string(), index);
        Ok(index)
    }

    fn string(&mut self, text: &str) -> Result<u16> {
        if let Some(index) = self.strings.get(text) {
            return Ok(*index);
        }
        let utf8 = self.utf8(text)?;
        let index = self.push(PoolEntry::Str(utf8))?;
        self.strings.insert(text.to_string(), index);
        Ok(index)
    }

    fn integer(&mut self, value: i32) -> Result<u16> {
        if let Some(index) = self.ints.get(&value) {
            return Ok(*index);
        }
        let index = self.push(PoolEntry::Int(value))?;
        self.ints.insert(value, index);
        Ok(index)
    }

    fn float(&mut self, bits: u32) -> Result<u16> {
        if let Some(index) = self.floats.get(&bits) {
            return Ok(*index);
        }
        let index = self.push(PoolEntry::Float(bits))?;
        self.floats.insert(bits, index);
        Ok(index)
    }

    fn long(&mut self, value: i64) -> Result<u16> {
        if let Some(index) = self.longs.get(&value) {
            return Ok(*index);
        }
        let index = self.push(PoolEntry::Long(value))?;
        self.longs.insert(value, index);
        Ok(index)
    }

    fn double(&mut self, bits: u64) -> Result<u16> {
        if let Some(index) = self.doubles.get(&bits) {
            return Ok(*index);
        }
        let index = self.push(PoolEntry::Double(bits))?;
        self.doubles.insert(bits, index);
        Ok(index)
    }

    fn name_and_type(&mut self, name: &str, descriptor: &str) -> Result<u16> {
        let key = (self.utf8(name)?, self.utf8(descriptor)?);
        if let Some(index) = self.nats.get(&key) {
            return Ok(*index);
        }
        let index = self.push(PoolEntry::NameAndType {
            name: key.0,
            descriptor: key.1,
        })?;
        self.nats.insert(key, index);
        Ok(index)
    }

    fn field_ref(&mut self, field: &crate::ir::FieldRef) -> Result<u16> {
        let key = (
            self.class(&field.owner)?,
            self.name_and_type(&field.name, &field.descriptor)?,
        );
        if let Some(index) = self.field_refs.get(&key) {
            return Ok(*index);
        }
        let index = self.push(PoolEntry::FieldRef {
            class: key.0,
            nat: key.1,
        })?;
        self.field_refs.insert(key, index);
        Ok(index)
    }

    fn method_ref(&mut self, method: &crate::ir::MethodRef) -> Result<u16> {
        let key = (
            self.class(&method.owner)?,
            self.name_and_type(&method.name, &method.descriptor)?,
            method.interface,
        );
        if let Some(index) = self.method_refs.get(&key) {
            return Ok(*index);
        }
        let index = self.push(PoolEntry::MethodRef {
            class: key.0,
            nat: key.1,
            interface: key.2,
        })?;
        self.method_refs.insert(key, index);
        Ok(index)
    }

    fn constant(&mut self, value: &ConstValue) -> Result<u16> {
        match value {
            ConstValue::Int(v) => self.integer(*v),
            ConstValue::Long(v) => self.long(*v),
            ConstValue::Float(v) => self.float(*v),
            ConstValue::Double(v) => self.double(*v),
            ConstValue::Str(v) => self.string(v),
        }
    }

    fn serialize(&self, w: &mut ByteWriter) {
        w.u16(self.entries.len() as u16 + 1);
        for entry in self.entries.iter().flatten() {
            match entry {
                PoolEntry::Utf8(bytes) => {
                    w.u8(1);
                    w.u16(bytes.len() as u16);
                    w.bytes(bytes);
                }
                PoolEntry::Int(v) => {
                    w.u8(3);
                    w.i32(*v);
                }
                PoolEntry::Float(v) => {
                    w.u8(4);
                    w.u32(*v);
                }
                PoolEntry::Long(v) => {
                    w.u8(5);
                    w.u64(*v as u64);
                }
                PoolEntry::Double(v) => {
                    w.u8(6);
                    w.u64(*v);
                }
                PoolEntry::Class(name) => {
                    w.u8(7);
                    w.u16(*name);
                }
                PoolEntry::Str(utf8) => {
                    w.u8(8);
                    w.u16(*utf8);
                }
                PoolEntry::FieldRef { class, nat } => {
                    w.u8(9);
                    w.u16(*class);
                    w.u16(*nat);
                }
                PoolEntry::MethodRef {
                    class,
                    nat,
                    interface,
                } => {
                    w.u8(if *interface { 11 } else { 10 });
                    w.u16(*class);
                    w.u16(*nat);
                }
                PoolEntry::NameAndType { name, descriptor } => {
                    w.u8(12);
                    w.u16(*name);
                    w.u16(*descriptor);
                }
            }
        }
    }
}

struct EncodedCode {
    max_stack: u16,
    max_locals: u16,
    code: Vec<u8>,
    exception_table: Vec<(u16, u16, u16, u16)>,
}

struct EncodedMethod {
    access: u16,
    name: u16,
    descriptor: u16,
    code: Option<EncodedCode>,
    exceptions: Vec<u16>,
}

struct EncodedField {
    access: u16,
    name: u16,
    descriptor: u16,
    constant_value: Option<u16>,
}

pub(crate) fn write_class(class: &Class) -> Result<Vec<u8>> {
    let mut pool = PoolBuilder::default();

    let this_class = pool.class(&class.name)?;
    let super_class = match &class.super_name {
        Some(name) => pool.class(name)?,
        None => 0,
    };
    let interfaces: Vec<u16> = class
        .interfaces
        .iter()
        .map(|name| pool.class(name))
        .collect::<Result<_>>()?;

    let mut fields = Vec::with_capacity(class.fields.len());
    for field in &class.fields {
        fields.push(EncodedField {
            access: field.access,
            name: pool.utf8(&field.name)?,
            descriptor: pool.utf8(&field.descriptor)?,
            constant_value: match &field.constant_value {
                Some(value) => Some(pool.constant(value)?),
                None => None,
            },
        });
    }

    let mut methods = Vec::with_capacity(class.methods.len());
    for method in &class.methods {
        let code = if method.has_code() {
            Some(
                encode_code(class, method, &mut pool)
                    .with_context(|| format!("encoding {}.{}{}", class.name, method.name, method.descriptor))?,
            )
        } else {
            None
        };
        let exceptions = method
            .exceptions
            .iter()
            .map(|name| pool.class(name))
            .collect::<Result<Vec<u16>>>()?;
        methods.push(EncodedMethod {
            access: method.access,
            name: pool.utf8(&method.name)?,
            descriptor: pool.utf8(&method.descriptor)?,
            code,
            exceptions,
        });
    }

    // Attribute names must be interned before the pool serializes.
    let constant_value_attr = if fields.iter().any(|f| f.constant_value.is_some()) {
        Some(pool.utf8("ConstantValue")?)
    } else {
        None
    };
    let code_attr = if methods.iter().any(|m| m.code.is_some()) {
        Some(pool.utf8("Code")?)
    } else {
        None
    };
    let exceptions_attr = if methods.iter().any(|m| !m.exceptions.is_empty()) {
        Some(pool.utf8("Exceptions")?)
    } else {
        None
    };

    let mut w = ByteWriter::default();
    w.u32(0xCAFE_BABE);
    w.u16(class.version.1);
    w.u16(class.version.0);
    pool.serialize(&mut w);
    w.u16(class.access);
    w.u16(this_class);
    w.u16(super_class);
    w.u16(interfaces.len() as u16);
    for interface in interfaces {
        w.u16(interface);
    }

    w.u16(fields.len() as u16);
    for field in fields {
        w.u16(field.access);
        w.u16(field.name);
        w.u16(field.descriptor);
        match field.constant_value {
            Some(value) => {
                w.u16(1);
                w.u16(constant_value_attr.expect("attribute name interned"));
                w.u32(2);
                w.u16(value);
            }
            None => w.u16(0),
        }
    }

    w.u16(methods.len() as u16);
    for method in methods {
        w.u16(method.access);
        w.u16(method.name);
        w.u16(method.descriptor);
        let mut attr_count = 0u16;
        if method.code.is_some() {
            attr_count += 1;
        }
        if !method.exceptions.is_empty() {
            attr_count += 1;
        }
        w.u16(attr_count);
        if let Some(code) = method.code {
            w.u16(code_attr.expect("attribute name interned"));
            let attr_len = 2 + 2 + 4 + code.code.len() + 2 + code.exception_table.len() * 8 + 2;
            w.u32(attr_len as u32);
            w.u16(code.max_stack);
            w.u16(code.max_locals);
            w.u32(code.code.len() as u32);
            w.bytes(&code.code);
            w.u16(code.exception_table.len() as u16);
            for (start, end, handler, catch_type) in code.exception_table {
                w.u16(start);
                w.u16(end);
                w.u16(handler);
                w.u16(catch_type);
            }
            w.u16(0);
        }
        if !method.exceptions.is_empty() {
            w.u16(exceptions_attr.expect("attribute name interned"));
            w.u32(2 + method.exceptions.len() as u32 * 2);
            w.u16(method.exceptions.len() as u16);
            for exception in method.exceptions {
                w.u16(exception);
            }
        }
    }

    // No class-level attributes are carried over.
    w.u16(0);
    Ok(w.out)
}

fn encode_code(class: &Class, method: &Method, pool: &mut PoolBuilder) -> Result<EncodedCode> {
    let insns = &method.instructions;
    if insns.is_empty() {
        anyhow::bail!("concrete method has an empty body");
    }

    let analysis = interp::analyze(&class.name, method, &mut BasicInterpreter)?;
    let max_stack = analysis
        .frames
        .iter()
        .flatten()
        .map(|frame| frame.stack.iter().map(|size| *size as usize).sum::<usize>())
        .max()
        .unwrap_or(0);
    let max_locals = interp::local_capacity(method)?;

    // Per-instruction constant pool indices, fixed before layout so `ldc`
    // width decisions are stable.
    let mut cp_index: Vec<Option<u16>> = Vec::with_capacity(insns.len());
    for insn in insns {
        cp_index.push(constant_index(insn, pool)?);
    }

    // Layout fixpoint: lengths only ever grow, so this terminates.
    let mut wide_goto = vec![false; insns.len()];
    let mut offsets: Vec<usize> = vec![0; insns.len()];
    for _pass in 0..32 {
        let mut at = 0usize;
        for (index, insn) in insns.iter().enumerate() {
            offsets[index] = at;
            at += insn_length(insn, at, cp_index[index], wide_goto[index]);
        }
        let mut stable = true;
        for (index, insn) in insns.iter().enumerate() {
            if insn.opcode == GOTO && !wide_goto[index] {
                if let Operand::Branch(target) = insn.operand {
                    let delta = offsets[target] as i64 - offsets[index] as i64;
                    if i16::try_from(delta).is_err() {
                        wide_goto[index] = true;
                        stable = false;
                    }
                }
            }
        }
        if stable {
            break;
        }
    }
    let code_len = {
        let last = insns.len() - 1;
        offsets[last] + insn_length(&insns[last], offsets[last], cp_index[last], wide_goto[last])
    };
    if code_len > u16::MAX as usize {
        anyhow::bail!("method body exceeds 65535 bytes");
    }

    let mut w = ByteWriter::default();
    for (index, insn) in insns.iter().enumerate() {
        emit(&mut w, insn, index, &offsets, cp_index[index], wide_goto[index])?;
    }
    debug_assert_eq!(w.len(), code_len);

    let mut exception_table = Vec::with_capacity(method.try_catches.len());
    for tc in &method.try_catches {
        let pc = |index: usize| -> u16 {
            if index >= insns.len() {
                code_len as u16
            } else {
                offsets[index] as u16
            }
        };
        let catch_type = match &tc.catch_type {
            Some(name) => pool.class(name)?,
            None => 0,
        };
        exception_table.push((pc(tc.start), pc(tc.end), pc(tc.handler), catch_type));
    }

    Ok(EncodedCode {
        max_stack: max_stack as u16,
        max_locals: max_locals as u16,
        code: w.out,
        exception_table,
    })
}

/// Intern the instruction's constant pool entry, if it has one.
fn constant_index(insn: &Insn, pool: &mut PoolBuilder) -> Result<Option<u16>> {
    Ok(match (insn.opcode, &insn.operand) {
        (LDC, Operand::Int(v)) => Some(pool.integer(*v)?),
        (LDC, Operand::Float(v)) => Some(pool.float(*v)?),
        (LDC, Operand::Str(v)) => Some(pool.string(v)?),
        (LDC, Operand::ClassRef(v)) => Some(pool.class(v)?),
        (LDC2_W, Operand::Long(v)) => Some(pool.long(*v)?),
        (LDC2_W, Operand::Double(v)) => Some(pool.double(*v)?),
        (_, Operand::Field(field)) => Some(pool.field_ref(field)?),
        (_, Operand::Method(method)) => Some(pool.method_ref(method)?),
        (_, Operand::ClassRef(name)) => Some(pool.class(name)?),
        (MULTIANEWARRAY, Operand::MultiArray { descriptor, .. }) => {
            Some(pool.class(descriptor)?)
        }
        _ => None,
    })
}

fn insn_length(insn: &Insn, offset: usize, cp_index: Option<u16>, wide_goto: bool) -> usize {
    match (insn.opcode, &insn.operand) {
        (LDC, _) => {
            if cp_index.unwrap_or(0) > 0xff {
                3
            } else {
                2
            }
        }
        (LDC2_W, _) => 3,
        (BIPUSH, _) | (NEWARRAY, _) => 2,
        (SIPUSH, _) => 3,
        (ILOAD..=ALOAD | ISTORE..=ASTORE, Operand::Slot(slot)) => {
            if *slot <= 3 {
                1
            } else if *slot <= 0xff {
                2
            } else {
                4
            }
        }
        (IINC, Operand::Iinc { slot, delta }) => {
            if *slot <= 0xff && i8::try_from(*delta).is_ok() {
                3
            } else {
                6
            }
        }
        (GOTO, _) if wide_goto => 5,
        (IFEQ..=GOTO | IFNULL | IFNONNULL, _) => 3,
        (TABLESWITCH, Operand::Switch(switch)) => {
            1 + switch_padding(offset) + 12 + switch.targets.len() * 4
        }
        (LOOKUPSWITCH, Operand::Switch(switch)) => {
            1 + switch_padding(offset) + 8 + switch.targets.len() * 8
        }
        (GETSTATIC..=INVOKESTATIC | NEW | ANEWARRAY | CHECKCAST | INSTANCEOF, _) => 3,
        (INVOKEINTERFACE, _) => 5,
        (MULTIANEWARRAY, _) => 4,
        _ => 1,
    }
}

fn switch_padding(offset: usize) -> usize {
    (4 - (offset + 1) % 4) % 4
}

fn emit(
    w: &mut ByteWriter,
    insn: &Insn,
    index: usize,
    offsets: &[usize],
    cp_index: Option<u16>,
    wide_goto: bool,
) -> Result<()> {
    let at = offsets[index];
    let branch_to = |target: usize| -> i64 { offsets[target] as i64 - at as i64 };
    match (insn.opcode, &insn.operand) {
        (LDC, _) => {
            let cp = cp_index.expect("ldc interned");
            if cp > 0xff {
                w.u8(LDC_W);
                w.u16(cp);
            } else {
                w.u8(LDC);
                w.u8(cp as u8);
            }
        }
        (LDC2_W, _) => {
            w.u8(LDC2_W);
            w.u16(cp_index.expect("ldc2_w interned"));
        }
        (BIPUSH, Operand::Int(v)) => {
            w.u8(BIPUSH);
            w.u8(*v as i8 as u8);
        }
        (SIPUSH, Operand::Int(v)) => {
            w.u8(SIPUSH);
            w.u16(*v as i16 as u16);
        }
        (NEWARRAY, Operand::NewArray(tag)) => {
            w.u8(NEWARRAY);
            w.u8(*tag);
        }
        (opcode @ (ILOAD..=ALOAD | ISTORE..=ASTORE), Operand::Slot(slot)) => {
            if *slot <= 3 {
                let base = if opcode >= ISTORE {
                    0x3b + (opcode - ISTORE) * 4
                } else {
                    0x1a + (opcode - ILOAD) * 4
                };
                w.u8(base + *slot as u8);
            } else if *slot <= 0xff {
                w.u8(opcode);
                w.u8(*slot as u8);
            } else {
                w.u8(WIDE);
                w.u8(opcode);
                w.u16(*slot);
            }
        }
        (IINC, Operand::Iinc { slot, delta }) => {
            if *slot <= 0xff && i8::try_from(*delta).is_ok() {
                w.u8(IINC);
                w.u8(*slot as u8);
                w.u8(*delta as i8 as u8);
            } else {
                w.u8(WIDE);
                w.u8(IINC);
                w.u16(*slot);
                w.i16(*delta);
            }
        }
        (GOTO, Operand::Branch(target)) if wide_goto => {
            w.u8(GOTO_W);
            w.i32(branch_to(*target) as i32);
        }
        (opcode @ (IFEQ..=GOTO | IFNULL | IFNONNULL), Operand::Branch(target)) => {
            let delta = branch_to(*target);
            let delta = i16::try_from(delta)
                .ok()
                .with_context(|| format!("conditional branch displacement {delta} overflows"))?;
            w.u8(opcode);
            w.i16(delta);
        }
        (TABLESWITCH, Operand::Switch(switch)) => {
            w.u8(TABLESWITCH);
            for _ in 0..switch_padding(at) {
                w.u8(0);
            }
            w.i32(branch_to(switch.default) as i32);
            w.i32(switch.low);
            w.i32(switch.low + switch.targets.len() as i32 - 1);
            for target in &switch.targets {
                w.i32(branch_to(*target) as i32);
            }
        }
        (LOOKUPSWITCH, Operand::Switch(switch)) => {
            w.u8(LOOKUPSWITCH);
            for _ in 0..switch_padding(at) {
                w.u8(0);
            }
            w.i32(branch_to(switch.default) as i32);
            let keys = switch.keys.as_ref().context("lookupswitch without keys")?;
            w.i32(keys.len() as i32);
            for (key, target) in keys.iter().zip(&switch.targets) {
                w.i32(*key);
                w.i32(branch_to(*target) as i32);
            }
        }
        (opcode @ (GETSTATIC..=INVOKESTATIC | NEW | ANEWARRAY | CHECKCAST | INSTANCEOF), _) => {
            w.u8(opcode);
            w.u16(cp_index.expect("reference interned"));
        }
        (INVOKEINTERFACE, Operand::Method(method)) => {
            w.u8(INVOKEINTERFACE);
            w.u16(cp_index.expect("reference interned"));
            let (args, _) = crate::codec::method_descriptor(&method.descriptor)?;
            let count = 1 + args.iter().map(|s| *s as usize).sum::<usize>();
            w.u8(count as u8);
            w.u8(0);
        }
        (MULTIANEWARRAY, Operand::MultiArray { dims, .. }) => {
            w.u8(MULTIANEWARRAY);
            w.u16(cp_index.expect("reference interned"));
            w.u8(*dims);
        }
        (opcode, _) => w.u8(opcode),
    }
    Ok(())
}
