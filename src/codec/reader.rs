//! Class-file bytes to `ir::Class`. Branch targets are resolved to
//! instruction indices here so every later pass works on a dense graph.

use std::collections::HashMap;

use anyhow::{Context, Result};

use crate::codec::{ByteReader, decode_mutf8, method_descriptor};
use crate::ir::{Class, ConstValue, Field, FieldRef, Insn, Method, MethodRef, Operand, Switch, TryCatch};
use crate::opcodes::*;

const MAGIC: u32 = 0xCAFE_BABE;

#[derive(Clone, Debug)]
enum CpEntry {
    Empty,
    Utf8(String),
    Int(i32),
    Float(u32),
    Long(i64),
    Double(u64),
    Class(u16),
    Str(u16),
    FieldRef { class: u16, nat: u16 },
    MethodRef { class: u16, nat: u16, interface: bool },
    NameAndType { name: u16, descriptor: u16 },
    /// Method handles/types, dynamic constants, module info. Parsed past,
    /// never referenced by the instruction set the decoder accepts.
    Other,
}

struct ConstPool {
    entries: Vec<CpEntry>,
}

impl ConstPool {
    fn entry(&self, index: u16) -> Result<&CpEntry> {
        self.entries
            .get(index as usize)
            .filter(|e| !matches!(e, CpEntry::Empty))
            .with_context(|| format!("invalid constant pool index {index}"))
    }

    fn utf8(&self, index: u16) -> Result<&str> {
        match self.entry(index)? {
            CpEntry::Utf8(text) => Ok(text),
            other => anyhow::bail!("constant {index} is not Utf8: {other:?}"),
        }
    }

    fn class_name(&self, index: u16) -> Result<String> {
        match self.entry(index)? {
            CpEntry::Class(name) => Ok(self.utf8(*name)?.to_string()),
            other => anyhow::bail!("constant {index} is not a class: {other:?}"),
        }
    }

    fn name_and_type(&self, index: u16) -> Result<(String, String)> {
        match self.entry(index)? {
            CpEntry::NameAndType { name, descriptor } => Ok((
                self.utf8(*name)?.to_string(),
                self.utf8(*descriptor)?.to_string(),
            )),
            other => anyhow::bail!("constant {index} is not NameAndType: {other:?}"),
        }
    }

    fn field_ref(&self, index: u16) -> Result<FieldRef> {
        match self.entry(index)? {
            CpEntry::FieldRef { class, nat } => {
                let (name, descriptor) = self.name_and_type(*nat)?;
                Ok(FieldRef {
                    owner: self.class_name(*class)?,
                    name,
                    descriptor,
                })
            }
            other => anyhow::bail!("constant {index} is not a field ref: {other:?}"),
        }
    }

    fn method_ref(&self, index: u16) -> Result<MethodRef> {
        match self.entry(index)? {
            CpEntry::MethodRef {
                class,
                nat,
                interface,
            } => {
                let (name, descriptor) = self.name_and_type(*nat)?;
                Ok(MethodRef {
                    owner: self.class_name(*class)?,
                    name,
                    descriptor,
                    interface: *interface,
                })
            }
            other => anyhow::bail!("constant {index} is not a method ref: {other:?}"),
        }
    }
}

pub(crate) fn read_class(data: &[u8]) -> Result<Class> {
    let mut r = ByteReader::new(data);
    if r.u32()? != MAGIC {
        anyhow::bail!("not a class file (bad magic)");
    }
    let minor = r.u16()?;
    let major = r.u16()?;
    let cp = read_constant_pool(&mut r)?;

    let access = r.u16()?;
    let name = cp.class_name(r.u16()?)?;
    let super_index = r.u16()?;
    let super_name = if super_index == 0 {
        None
    } else {
        Some(cp.class_name(super_index)?)
    };

    let interface_count = r.u16()?;
    let mut interfaces = Vec::with_capacity(interface_count as usize);
    for _ in 0..interface_count {
        interfaces.push(cp.class_name(r.u16()?)?);
    }

    let field_count = r.u16()?;
    let mut fields = Vec::with_capacity(field_count as usize);
    for _ in 0..field_count {
        fields.push(read_field(&mut r, &cp)?);
    }

    let method_count = r.u16()?;
    let mut methods = Vec::with_capacity(method_count as usize);
    for _ in 0..method_count {
        let method = read_method(&mut r, &cp)
            .with_context(|| format!("in class {name}"))?;
        methods.push(method);
    }

    skip_attributes(&mut r)?;

    Ok(Class {
        name,
        access,
        version: (major, minor),
        super_name,
        interfaces,
        fields,
        methods,
    })
}

fn read_constant_pool(r: &mut ByteReader) -> Result<ConstPool> {
    let count = r.u16()?;
    let mut entries = vec![CpEntry::Empty; count as usize];
    let mut index = 1usize;
    while index < count as usize {
        let tag = r.u8()?;
        let mut wide = false;
        entries[index] = match tag {
            1 => {
                let len = r.u16()? as usize;
                CpEntry::Utf8(decode_mutf8(r.bytes(len)?)?)
            }
            3 => CpEntry::Int(r.i32()?),
            4 => CpEntry::Float(r.u32()?),
            5 => {
                wide = true;
                CpEntry::Long(r.u64()? as i64)
            }
            6 => {
                wide = true;
                CpEntry::Double(r.u64()?)
            }
            7 => CpEntry::Class(r.u16()?),
            8 => CpEntry::Str(r.u16()?),
            9 => CpEntry::FieldRef {
                class: r.u16()?,
                nat: r.u16()?,
            },
            10 => CpEntry::MethodRef {
                class: r.u16()?,
                nat: r.u16()?,
                interface: false,
            },
            11 => CpEntry::MethodRef {
                class: r.u16()?,
                nat: r.u16()?,
                interface: true,
            },
            12 => CpEntry::NameAndType {
                name: r.u16()?,
                descriptor: r.u16()?,
            },
            15 => {
                r.skip(3)?;
                CpEntry::Other
            }
            16 | 19 | 20 => {
                r.skip(2)?;
                CpEntry::Other
            }
            17 | 18 => {
                r.skip(4)?;
                CpEntry::Other
            }
            other => anyhow::bail!("unknown constant pool tag {other}"),
        };
        index += if wide { 2 } else { 1 };
    }
    Ok(ConstPool { entries })
}

fn read_field(r: &mut ByteReader, cp: &ConstPool) -> Result<Field> {
    let access = r.u16()?;
    let name = cp.utf8(r.u16()?)?.to_string();
    let descriptor = cp.utf8(r.u16()?)?.to_string();
    let mut constant_value = None;

    let attr_count = r.u16()?;
    for _ in 0..attr_count {
        let attr_name = cp.utf8(r.u16()?)?.to_string();
        let attr_len = r.u32()? as usize;
        if attr_name == "ConstantValue" {
            let index = r.u16()?;
            constant_value = Some(match cp.entry(index)? {
                CpEntry::Int(v) => ConstValue::Int(*v),
                CpEntry::Long(v) => ConstValue::Long(*v),
                CpEntry::Float(v) => ConstValue::Float(*v),
                CpEntry::Double(v) => ConstValue::Double(*v),
                CpEntry::Str(utf8) => ConstValue::Str(cp.utf8(*utf8)?.to_string()),
                other => anyhow::bail!("bad ConstantValue entry: {other:?}"),
            });
        } else {
            r.skip(attr_len)?;
        }
    }

    Ok(Field {
        name,
        descriptor,
        access,
        constant_value,
    })
}

fn read_method(r: &mut ByteReader, cp: &ConstPool) -> Result<Method> {
    let access = r.u16()?;
    let name = cp.utf8(r.u16()?)?.to_string();
    let descriptor = cp.utf8(r.u16()?)?.to_string();
    method_descriptor(&descriptor)?;

    let mut instructions = Vec::new();
    let mut try_catches = Vec::new();
    let mut exceptions = Vec::new();

    let attr_count = r.u16()?;
    for _ in 0..attr_count {
        let attr_name = cp.utf8(r.u16()?)?.to_string();
        let attr_len = r.u32()? as usize;
        match attr_name.as_str() {
            "Code" => {
                let (insns, handlers) = read_code(r, cp)
                    .with_context(|| format!("in method {name}{descriptor}"))?;
                instructions = insns;
                try_catches = handlers;
            }
            "Exceptions" => {
                let count = r.u16()?;
                for _ in 0..count {
                    exceptions.push(cp.class_name(r.u16()?)?);
                }
            }
            _ => r.skip(attr_len)?,
        }
    }

    Ok(Method {
        name,
        descriptor,
        access,
        instructions,
        try_catches,
        exceptions,
    })
}

fn read_code(r: &mut ByteReader, cp: &ConstPool) -> Result<(Vec<Insn>, Vec<TryCatch>)> {
    let _max_stack = r.u16()?;
    let _max_locals = r.u16()?;
    let code_len = r.u32()? as usize;
    let code = r.bytes(code_len)?;

    let (instructions, index_of) = decode_instructions(code, cp)?;

    let resolve = |pc: u16, end_ok: bool| -> Result<usize> {
        if end_ok && pc as usize == code.len() {
            return Ok(instructions.len());
        }
        index_of
            .get(&(pc as u32))
            .copied()
            .with_context(|| format!("exception table pc {pc} is not an instruction boundary"))
    };

    let handler_count = r.u16()?;
    let mut try_catches = Vec::with_capacity(handler_count as usize);
    for _ in 0..handler_count {
        let start_pc = r.u16()?;
        let end_pc = r.u16()?;
        let handler_pc = r.u16()?;
        let catch_index = r.u16()?;
        try_catches.push(TryCatch {
            start: resolve(start_pc, false)?,
            end: resolve(end_pc, true)?,
            handler: resolve(handler_pc, false)?,
            catch_type: if catch_index == 0 {
                None
            } else {
                Some(cp.class_name(catch_index)?)
            },
        });
    }

    skip_attributes(r)?;
    Ok((instructions, try_catches))
}

fn skip_attributes(r: &mut ByteReader) -> Result<()> {
    let count = r.u16()?;
    for _ in 0..count {
        r.skip(2)?;
        let len = r.u32()? as usize;
        r.skip(len)?;
    }
    Ok(())
}

/// Byte length of the instruction at `offset`, switch padding included.
fn insn_length(code: &[u8], offset: usize) -> Result<usize> {
    let opcode = *code.get(offset).context("truncated bytecode")?;
    Ok(match opcode {
        TABLESWITCH => {
            let base = offset + 1 + switch_padding(offset);
            let low = read_i32_at(code, base + 4)?;
            let high = read_i32_at(code, base + 8)?;
            let count = (high as i64 - low as i64 + 1).max(0) as usize;
            base + 12 + count * 4 - offset
        }
        LOOKUPSWITCH => {
            let base = offset + 1 + switch_padding(offset);
            let npairs = read_i32_at(code, base + 4)?.max(0) as usize;
            base + 8 + npairs * 8 - offset
        }
        WIDE => {
            let inner = *code.get(offset + 1).context("truncated wide instruction")?;
            if inner == IINC { 6 } else { 4 }
        }
        BIPUSH | LDC | NEWARRAY | RET => 2,
        ILOAD..=ALOAD | ISTORE..=ASTORE => 2,
        SIPUSH | LDC_W | LDC2_W | IINC => 3,
        IFEQ..=JSR | IFNULL | IFNONNULL => 3,
        GETSTATIC..=INVOKESTATIC | NEW | ANEWARRAY | CHECKCAST | INSTANCEOF => 3,
        MULTIANEWARRAY => 4,
        INVOKEINTERFACE | INVOKEDYNAMIC | GOTO_W | JSR_W => 5,
        _ => 1,
    })
}

fn switch_padding(offset: usize) -> usize {
    (4 - (offset + 1) % 4) % 4
}

fn read_i32_at(code: &[u8], offset: usize) -> Result<i32> {
    let bytes = code
        .get(offset..offset + 4)
        .context("truncated bytecode")?;
    Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_u16_at(code: &[u8], offset: usize) -> Result<u16> {
    let bytes = code
        .get(offset..offset + 2)
        .context("truncated bytecode")?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn decode_instructions(
    code: &[u8],
    cp: &ConstPool,
) -> Result<(Vec<Insn>, HashMap<u32, usize>)> {
    // First pass: instruction boundaries, so branch offsets can resolve to
    // indices in the second pass.
    let mut offsets = Vec::new();
    let mut index_of = HashMap::new();
    let mut offset = 0usize;
    while offset < code.len() {
        index_of.insert(offset as u32, offsets.len());
        offsets.push(offset);
        offset += insn_length(code, offset)?;
    }
    if offset != code.len() {
        anyhow::bail!("instruction stream overruns code length");
    }

    let target = |from: usize, delta: i64| -> Result<usize> {
        let to = from as i64 + delta;
        u32::try_from(to)
            .ok()
            .and_then(|to| index_of.get(&to).copied())
            .with_context(|| format!("branch from offset {from} to {to} lands mid-instruction"))
    };

    let mut instructions = Vec::with_capacity(offsets.len());
    for &at in &offsets {
        let opcode = code[at];
        let insn = match opcode {
            JSR | JSR_W | RET => {
                anyhow::bail!("jsr/ret subroutines are not supported (offset {at})")
            }
            INVOKEDYNAMIC => {
                anyhow::bail!("invokedynamic is not supported (offset {at})")
            }
            ICONST_M1..=ICONST_5 => Insn::with(
                opcode,
                Operand::Int(opcode as i32 - ICONST_0 as i32),
            ),
            LCONST_0 | LCONST_1 => {
                Insn::with(opcode, Operand::Long((opcode - LCONST_0) as i64))
            }
            FCONST_0..=FCONST_2 => Insn::with(
                opcode,
                Operand::Float(((opcode - FCONST_0) as f32).to_bits()),
            ),
            DCONST_0 | DCONST_1 => Insn::with(
                opcode,
                Operand::Double(((opcode - DCONST_0) as f64).to_bits()),
            ),
            BIPUSH => Insn::with(opcode, Operand::Int(code[at + 1] as i8 as i32)),
            SIPUSH => Insn::with(opcode, Operand::Int(read_u16_at(code, at + 1)? as i16 as i32)),
            LDC => decode_ldc(cp, code[at + 1] as u16)?,
            LDC_W => decode_ldc(cp, read_u16_at(code, at + 1)?)?,
            LDC2_W => match cp.entry(read_u16_at(code, at + 1)?)? {
                CpEntry::Long(v) => Insn::with(LDC2_W, Operand::Long(*v)),
                CpEntry::Double(v) => Insn::with(LDC2_W, Operand::Double(*v)),
                other => anyhow::bail!("ldc2_w of non-wide constant: {other:?}"),
            },
            ILOAD..=ALOAD | ISTORE..=ASTORE => {
                Insn::with(opcode, Operand::Slot(code[at + 1] as u16))
            }
            0x1a..=0x2d => {
                // xload_<n>, normalized to the slot-carrying form.
                let base = opcode - 0x1a;
                Insn::with(ILOAD + base / 4, Operand::Slot((base % 4) as u16))
            }
            0x3b..=0x4e => {
                let base = opcode - 0x3b;
                Insn::with(ISTORE + base / 4, Operand::Slot((base % 4) as u16))
            }
            IINC => Insn::with(
                IINC,
                Operand::Iinc {
                    slot: code[at + 1] as u16,
                    delta: code[at + 2] as i8 as i16,
                },
            ),
            WIDE => {
                let inner = code[at + 1];
                match inner {
                    ILOAD..=ALOAD | ISTORE..=ASTORE => {
                        Insn::with(inner, Operand::Slot(read_u16_at(code, at + 2)?))
                    }
                    IINC => Insn::with(
                        IINC,
                        Operand::Iinc {
                            slot: read_u16_at(code, at + 2)?,
                            delta: read_u16_at(code, at + 4)? as i16,
                        },
                    ),
                    RET => anyhow::bail!("jsr/ret subroutines are not supported (offset {at})"),
                    other => anyhow::bail!("invalid wide opcode {other:#04x}"),
                }
            }
            IFEQ..=GOTO | IFNULL | IFNONNULL => {
                let delta = read_u16_at(code, at + 1)? as i16 as i64;
                Insn::with(opcode, Operand::Branch(target(at, delta)?))
            }
            GOTO_W => {
                let delta = read_i32_at(code, at + 1)? as i64;
                Insn::with(GOTO, Operand::Branch(target(at, delta)?))
            }
            TABLESWITCH => {
                let base = at + 1 + switch_padding(at);
                let default = target(at, read_i32_at(code, base)? as i64)?;
                let low = read_i32_at(code, base + 4)?;
                let high = read_i32_at(code, base + 8)?;
                let count = (high as i64 - low as i64 + 1).max(0) as usize;
                let mut targets = Vec::with_capacity(count);
                for entry in 0..count {
                    targets.push(target(at, read_i32_at(code, base + 12 + entry * 4)? as i64)?);
                }
                Insn::with(
                    TABLESWITCH,
                    Operand::Switch(Switch {
                        default,
                        low,
                        keys: None,
                        targets,
                    }),
                )
            }
            LOOKUPSWITCH => {
                let base = at + 1 + switch_padding(at);
                let default = target(at, read_i32_at(code, base)? as i64)?;
                let npairs = read_i32_at(code, base + 4)?.max(0) as usize;
                let mut keys = Vec::with_capacity(npairs);
                let mut targets = Vec::with_capacity(npairs);
                for entry in 0..npairs {
                    keys.push(read_i32_at(code, base + 8 + entry * 8)?);
                    targets.push(target(at, read_i32_at(code, base + 12 + entry * 8)? as i64)?);
                }
                Insn::with(
                    LOOKUPSWITCH,
                    Operand::Switch(Switch {
                        default,
                        low: 0,
                        keys: Some(keys),
                        targets,
                    }),
                )
            }
            GETSTATIC..=PUTFIELD => {
                let field = cp.field_ref(read_u16_at(code, at + 1)?)?;
                Insn::with(opcode, Operand::Field(field))
            }
            INVOKEVIRTUAL | INVOKESPECIAL | INVOKESTATIC | INVOKEINTERFACE => {
                let method = cp.method_ref(read_u16_at(code, at + 1)?)?;
                method_descriptor(&method.descriptor)?;
                Insn::with(opcode, Operand::Method(method))
            }
            NEW | ANEWARRAY | CHECKCAST | INSTANCEOF => Insn::with(
                opcode,
                Operand::ClassRef(cp.class_name(read_u16_at(code, at + 1)?)?),
            ),
            NEWARRAY => Insn::with(NEWARRAY, Operand::NewArray(code[at + 1])),
            MULTIANEWARRAY => Insn::with(
                MULTIANEWARRAY,
                Operand::MultiArray {
                    descriptor: cp.class_name(read_u16_at(code, at + 1)?)?,
                    dims: code[at + 3],
                },
            ),
            _ => Insn::new(opcode),
        };
        instructions.push(insn);
    }

    Ok((instructions, index_of))
}

fn decode_ldc(cp: &ConstPool, index: u16) -> Result<Insn> {
    Ok(match cp.entry(index)? {
        CpEntry::Int(v) => Insn::with(LDC, Operand::Int(*v)),
        CpEntry::Float(v) => Insn::with(LDC, Operand::Float(*v)),
        CpEntry::Str(utf8) => Insn::with(LDC, Operand::Str(cp.utf8(*utf8)?.to_string())),
        CpEntry::Class(name) => Insn::with(LDC, Operand::ClassRef(cp.utf8(*name)?.to_string())),
        other => anyhow::bail!("unsupported ldc constant: {other:?}"),
    })
}
