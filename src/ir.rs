use crate::opcodes;

/// In-memory representation of one loaded class.
#[derive(Clone, Debug)]
pub(crate) struct Class {
    /// JVM internal name (`com/example/Foo`), the pool-wide identity.
    pub(crate) name: String,
    pub(crate) access: u16,
    /// Class file version, `(major, minor)`, preserved across a rewrite.
    pub(crate) version: (u16, u16),
    pub(crate) super_name: Option<String>,
    pub(crate) interfaces: Vec<String>,
    pub(crate) fields: Vec<Field>,
    pub(crate) methods: Vec<Method>,
}

impl Class {
    pub(crate) fn method(&self, name: &str, descriptor: &str) -> Option<&Method> {
        self.methods
            .iter()
            .find(|m| m.name == name && m.descriptor == descriptor)
    }

    pub(crate) fn field(&self, name: &str, descriptor: &str) -> Option<&Field> {
        self.fields
            .iter()
            .find(|f| f.name == name && f.descriptor == descriptor)
    }
}

/// Field declaration.
#[derive(Clone, Debug)]
pub(crate) struct Field {
    pub(crate) name: String,
    pub(crate) descriptor: String,
    pub(crate) access: u16,
    /// `ConstantValue` attribute payload for static finals, if any.
    pub(crate) constant_value: Option<ConstValue>,
}

impl Field {
    pub(crate) fn is_static(&self) -> bool {
        self.access & opcodes::ACC_STATIC != 0
    }
}

/// Method declaration plus its decoded body.
#[derive(Clone, Debug)]
pub(crate) struct Method {
    pub(crate) name: String,
    pub(crate) descriptor: String,
    pub(crate) access: u16,
    /// Empty for abstract and native methods.
    pub(crate) instructions: Vec<Insn>,
    pub(crate) try_catches: Vec<TryCatch>,
    /// Checked exception names from the `Exceptions` attribute.
    pub(crate) exceptions: Vec<String>,
}

impl Method {
    pub(crate) fn is_static(&self) -> bool {
        self.access & opcodes::ACC_STATIC != 0
    }

    pub(crate) fn is_abstract(&self) -> bool {
        self.access & opcodes::ACC_ABSTRACT != 0
    }

    pub(crate) fn is_native(&self) -> bool {
        self.access & opcodes::ACC_NATIVE != 0
    }

    pub(crate) fn has_code(&self) -> bool {
        !self.is_abstract() && !self.is_native()
    }
}

/// One decoded instruction. Branch and switch targets are instruction
/// indices, not byte offsets; the codec translates in both directions.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Insn {
    pub(crate) opcode: u8,
    pub(crate) operand: Operand,
}

impl Insn {
    pub(crate) fn new(opcode: u8) -> Self {
        Insn {
            opcode,
            operand: Operand::None,
        }
    }

    pub(crate) fn with(opcode: u8, operand: Operand) -> Self {
        Insn { opcode, operand }
    }
}

/// Operand payloads, closed over the instruction set the codec accepts.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Operand {
    None,
    /// Local variable slot (short and wide-prefixed forms are normalized).
    Slot(u16),
    Int(i32),
    Long(i64),
    /// Raw bits; float constants are never interpreted, only carried.
    Float(u32),
    Double(u64),
    Str(String),
    /// Class reference for `new`/`checkcast`/`instanceof`/`anewarray`/`ldc`.
    ClassRef(String),
    Field(FieldRef),
    Method(MethodRef),
    Branch(usize),
    Switch(Switch),
    Iinc { slot: u16, delta: i16 },
    /// Primitive array type tag for `newarray`.
    NewArray(u8),
    MultiArray { descriptor: String, dims: u8 },
}

/// Switch payload; `keys` is `None` for a tableswitch starting at `low`.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Switch {
    pub(crate) default: usize,
    pub(crate) low: i32,
    pub(crate) keys: Option<Vec<i32>>,
    pub(crate) targets: Vec<usize>,
}

/// Resolved field reference from the constant pool.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct FieldRef {
    pub(crate) owner: String,
    pub(crate) name: String,
    pub(crate) descriptor: String,
}

impl FieldRef {
    /// `owner.name`, the identifier format multiplier results are keyed by.
    pub(crate) fn identifier(&self) -> String {
        format!("{}.{}", self.owner, self.name)
    }
}

/// Resolved method reference from the constant pool.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct MethodRef {
    pub(crate) owner: String,
    pub(crate) name: String,
    pub(crate) descriptor: String,
    pub(crate) interface: bool,
}

/// Exception handler region over instruction indices; `end` is exclusive.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct TryCatch {
    pub(crate) start: usize,
    pub(crate) end: usize,
    pub(crate) handler: usize,
    /// `None` is a catch-all handler.
    pub(crate) catch_type: Option<String>,
}

/// Loadable constant attached to a field's `ConstantValue` attribute.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum ConstValue {
    Int(i32),
    Long(i64),
    Float(u32),
    Double(u64),
    Str(String),
}
