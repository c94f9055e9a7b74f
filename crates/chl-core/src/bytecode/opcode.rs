//! Instruction set of the CHL virtual machine.
//!
//! Every opcode belongs to exactly one [`OperandKind`]; relocation (linker) and
//! relativisation (comparator) both dispatch on that kind with an exhaustive match.

use core::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Capability of an opcode's operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperandKind {
    /// No operand.
    None,
    /// Absolute instruction address (jump/branch class).
    Address,
    /// Script identifier.
    Script,
    /// Variable identifier (or a paired float PUSH in reference mode).
    Variable,
    /// Plain value whose interpretation follows the declared data type.
    Value,
}

macro_rules! opcodes {
    ($($(#[$doc:meta])* $name:ident = $code:literal, $mnemo:literal, $kind:ident;)*) => {
        /// Operations understood by the VM.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
        #[repr(u8)]
        pub enum Opcode {
            $($(#[$doc])* $name = $code,)*
        }

        impl Opcode {
            /// Decode the raw byte stored in images.
            pub const fn from_u8(raw: u8) -> Option<Self> {
                match raw {
                    $($code => Some(Opcode::$name),)*
                    _ => None,
                }
            }

            /// Textual name used in reports.
            pub const fn mnemonic(self) -> &'static str {
                match self {
                    $(Opcode::$name => $mnemo,)*
                }
            }

            /// Operand capability of this opcode.
            pub const fn kind(self) -> OperandKind {
                match self {
                    $(Opcode::$name => OperandKind::$kind,)*
                }
            }
        }
    };
}

opcodes! {
    /// Does nothing.
    Nop = 0x00, "NOP", None;
    /// Terminates the current script; closes every script's instruction run.
    End = 0x01, "END", None;
    /// Pushes the operand.
    Push = 0x02, "PUSH", Value;
    /// Discards the top of stack.
    Pop = 0x03, "POP", None;
    /// Duplicates the top of stack.
    Dup = 0x04, "DUP", None;
    /// Swaps the two topmost values.
    Swap = 0x05, "SWAP", None;
    /// Converts the top of stack to the declared data type.
    Cast = 0x06, "CAST", None;
    /// Pushes the value of a variable.
    Load = 0x07, "LOAD", Variable;
    /// Pops into a variable.
    Store = 0x08, "STORE", Variable;
    /// Addition.
    Add = 0x10, "ADD", None;
    /// Subtraction.
    Sub = 0x11, "SUB", None;
    /// Multiplication.
    Mul = 0x12, "MUL", None;
    /// Division.
    Div = 0x13, "DIV", None;
    /// Remainder.
    Mod = 0x14, "MOD", None;
    /// Arithmetic negation.
    Neg = 0x15, "NEG", None;
    /// Logical not.
    Not = 0x16, "NOT", None;
    /// Logical and.
    And = 0x17, "AND", None;
    /// Logical or.
    Or = 0x18, "OR", None;
    /// Equality.
    Eq = 0x19, "EQ", None;
    /// Inequality.
    Neq = 0x1A, "NEQ", None;
    /// Less than.
    Lt = 0x1B, "LT", None;
    /// Less or equal.
    Le = 0x1C, "LEQ", None;
    /// Greater than.
    Gt = 0x1D, "GT", None;
    /// Greater or equal.
    Ge = 0x1E, "GEQ", None;
    /// Unconditional jump.
    Jmp = 0x20, "JMP", Address;
    /// Jump when the popped value is zero.
    Jz = 0x21, "JZ", Address;
    /// Jump when the popped value is non-zero.
    Jnz = 0x22, "JNZ", Address;
    /// Registers an exception handler at the operand address.
    Except = 0x23, "EXCEPT", Address;
    /// Synchronous script call.
    Call = 0x30, "CALL", Script;
    /// Starts a script in a new thread of execution.
    Start = 0x31, "START", Script;
    /// Calls a native system function whose number is the operand.
    Sys = 0x32, "SYS", Value;
    /// Returns from a called script.
    Ret = 0x33, "RET", None;
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.mnemonic()) }
}

/// Addressing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Mode {
    /// Operand is carried by the instruction itself.
    #[default]
    Direct = 0,
    /// Variable id comes from the float PUSH two instructions earlier.
    Reference = 1,
}

impl Mode {
    /// Decode the raw byte stored in images.
    pub const fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Mode::Direct),
            1 => Some(Mode::Reference),
            _ => None,
        }
    }
}

/// Declared operand data type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DataType {
    /// No data.
    #[default]
    Void = 0,
    /// 32-bit integer (also string offsets into the data section).
    Int = 1,
    /// 32-bit float.
    Float = 2,
    /// Boolean.
    Bool = 3,
    /// Variable id.
    Var = 4,
}

impl DataType {
    /// Decode the raw byte stored in images.
    pub const fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(DataType::Void),
            1 => Some(DataType::Int),
            2 => Some(DataType::Float),
            3 => Some(DataType::Bool),
            4 => Some(DataType::Var),
            _ => None,
        }
    }

    /// Short name used in reports.
    pub const fn name(self) -> &'static str {
        match self {
            DataType::Void => "void",
            DataType::Int => "int",
            DataType::Float => "float",
            DataType::Bool => "bool",
            DataType::Var => "var",
        }
    }
}

/// Reference to a script or variable.
///
/// Object modules use `External` for symbols defined in another module; the
/// linker turns every reference into `Internal` with an absolute id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum SymRef {
    /// Id within the current module or image.
    Internal(u32),
    /// Index into the module's external table (placeholder id).
    External(u32),
}

impl SymRef {
    /// Persisted encoding: non-negative id, or `-(placeholder + 1)`.
    pub fn encode(self) -> i32 {
        match self {
            SymRef::Internal(id) => i32::try_from(id).unwrap_or(i32::MAX),
            SymRef::External(p) => -i32::try_from(p).unwrap_or(i32::MAX - 1) - 1,
        }
    }

    /// Inverse of [`SymRef::encode`].
    pub fn decode(raw: i32) -> Self {
        if raw >= 0 {
            SymRef::Internal(raw.unsigned_abs())
        } else {
            SymRef::External((raw + 1).unsigned_abs())
        }
    }

    /// Resolved id, if internal.
    pub const fn internal(self) -> Option<u32> {
        match self {
            SymRef::Internal(id) => Some(id),
            SymRef::External(_) => None,
        }
    }
}

/// Operand value; exactly one variant is meaningful for an opcode/data type pair.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Operand {
    /// No operand.
    #[default]
    None,
    /// Integer value (or data-section offset).
    Int(i32),
    /// Float value.
    Float(f32),
    /// Boolean value.
    Bool(bool),
    /// Absolute instruction address.
    Addr(u32),
    /// Script reference.
    Script(SymRef),
    /// Variable reference.
    Var(SymRef),
}

impl Operand {
    /// Raw 32-bit word stored in images.
    pub fn word(self) -> i32 {
        match self {
            Operand::None => 0,
            Operand::Int(v) => v,
            Operand::Float(v) => i32::from_ne_bytes(v.to_bits().to_ne_bytes()),
            Operand::Bool(b) => i32::from(b),
            Operand::Addr(a) => i32::try_from(a).unwrap_or(i32::MAX),
            Operand::Script(r) | Operand::Var(r) => r.encode(),
        }
    }

    /// Decode a raw word according to the opcode's capability.
    /// `None` when the word cannot be an operand of that kind (negative address).
    pub fn from_word(opcode: Opcode, mode: Mode, data_type: DataType, word: i32) -> Option<Self> {
        let operand = match opcode.kind() {
            OperandKind::None => Operand::None,
            OperandKind::Address => Operand::Addr(u32::try_from(word).ok()?),
            OperandKind::Script => Operand::Script(SymRef::decode(word)),
            OperandKind::Variable => match mode {
                Mode::Direct => Operand::Var(SymRef::decode(word)),
                Mode::Reference => Operand::None,
            },
            OperandKind::Value => match data_type {
                DataType::Void => Operand::None,
                DataType::Int => Operand::Int(word),
                DataType::Float => Operand::Float(f32::from_bits(u32::from_ne_bytes(word.to_ne_bytes()))),
                DataType::Bool => Operand::Bool(word != 0),
                DataType::Var => Operand::Var(SymRef::decode(word)),
            },
        };
        Some(operand)
    }

    /// Bit-level equality (floats compared by their bits, so `NaN == NaN`).
    pub fn bits_eq(self, other: Self) -> bool {
        match (self, other) {
            (Operand::Float(a), Operand::Float(b)) => a.to_bits() == b.to_bits(),
            (a, b) => a == b,
        }
    }
}

/// One VM instruction.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Instruction {
    /// Operation.
    pub opcode: Opcode,
    /// Addressing mode.
    pub mode: Mode,
    /// Declared operand data type.
    pub data_type: DataType,
    /// Operand value.
    pub operand: Operand,
    /// Source line (diagnostics only).
    pub line: u32,
}

impl Instruction {
    /// Instruction without operand.
    pub const fn op(opcode: Opcode) -> Self {
        Self { opcode, mode: Mode::Direct, data_type: DataType::Void, operand: Operand::None, line: 0 }
    }

    /// `END`.
    pub const fn end() -> Self { Self::op(Opcode::End) }

    /// `PUSH INT v`.
    pub const fn push_int(v: i32) -> Self {
        Self { data_type: DataType::Int, operand: Operand::Int(v), ..Self::op(Opcode::Push) }
    }

    /// `PUSH FLOAT v`.
    pub const fn push_float(v: f32) -> Self {
        Self { data_type: DataType::Float, operand: Operand::Float(v), ..Self::op(Opcode::Push) }
    }

    /// `PUSH BOOL v`.
    pub const fn push_bool(v: bool) -> Self {
        Self { data_type: DataType::Bool, operand: Operand::Bool(v), ..Self::op(Opcode::Push) }
    }

    /// `PUSH VAR r` (the variable's id pushed as a value).
    pub const fn push_var(r: SymRef) -> Self {
        Self { data_type: DataType::Var, operand: Operand::Var(r), ..Self::op(Opcode::Push) }
    }

    /// Float PUSH carrying a variable id, first half of the reference idiom.
    pub fn push_var_id(r: SymRef) -> Self {
        // ids stay far below 2^24, so the float is exact
        #[allow(clippy::cast_precision_loss)]
        let v = r.encode() as f32;
        Self::push_float(v)
    }

    /// `LOAD r`.
    pub const fn load(r: SymRef) -> Self {
        Self { data_type: DataType::Float, operand: Operand::Var(r), ..Self::op(Opcode::Load) }
    }

    /// `STORE r`.
    pub const fn store(r: SymRef) -> Self {
        Self { data_type: DataType::Float, operand: Operand::Var(r), ..Self::op(Opcode::Store) }
    }

    /// Reference-mode variable access (`LOAD`/`STORE` with the id taken from the stack).
    pub const fn by_ref(opcode: Opcode) -> Self {
        Self { mode: Mode::Reference, data_type: DataType::Float, ..Self::op(opcode) }
    }

    /// Jump-class instruction to an absolute address.
    pub const fn jump(opcode: Opcode, target: u32) -> Self {
        Self { data_type: DataType::Int, operand: Operand::Addr(target), ..Self::op(opcode) }
    }

    /// `CALL r`.
    pub const fn call(r: SymRef) -> Self {
        Self { data_type: DataType::Int, operand: Operand::Script(r), ..Self::op(Opcode::Call) }
    }

    /// `START r`.
    pub const fn start(r: SymRef) -> Self {
        Self { data_type: DataType::Int, operand: Operand::Script(r), ..Self::op(Opcode::Start) }
    }

    /// `SYS n`.
    pub const fn sys(n: i32) -> Self {
        Self { data_type: DataType::Int, operand: Operand::Int(n), ..Self::op(Opcode::Sys) }
    }

    /// `CAST` to the given type.
    pub const fn cast(to: DataType) -> Self { Self { data_type: to, ..Self::op(Opcode::Cast) } }

    /// Same instruction with a source line attached.
    #[must_use]
    pub const fn at_line(mut self, line: u32) -> Self {
        self.line = line;
        self
    }

    /// True for a reference-mode variable instruction.
    pub fn is_reference(&self) -> bool {
        self.mode == Mode::Reference && self.opcode.kind() == OperandKind::Variable
    }

    /// Variable id carried by a float PUSH (reference idiom), if this is one.
    pub fn float_var_id(&self) -> Option<SymRef> {
        match (self.opcode, self.operand) {
            #[allow(clippy::cast_possible_truncation)]
            (Opcode::Push, Operand::Float(v)) if v.fract() == 0.0 => Some(SymRef::decode(v as i32)),
            _ => None,
        }
    }

    /// Field equality ignoring the source line; floats compared bitwise.
    pub fn same_encoding(&self, other: &Self) -> bool {
        self.opcode == other.opcode
            && self.mode == other.mode
            && self.data_type == other.data_type
            && self.operand.bits_eq(other.operand)
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.opcode)?;
        if self.mode == Mode::Reference {
            f.write_str(" [ref]")?;
        }
        match self.operand {
            Operand::None if self.opcode == Opcode::Cast => write!(f, " {}", self.data_type.name()),
            Operand::None => Ok(()),
            Operand::Int(v) => write!(f, " {} {v}", self.data_type.name()),
            Operand::Float(v) => write!(f, " float {v:?}"),
            Operand::Bool(v) => write!(f, " bool {v}"),
            Operand::Addr(a) => write!(f, " @{a}"),
            Operand::Script(SymRef::Internal(id)) | Operand::Var(SymRef::Internal(id)) => write!(f, " #{id}"),
            Operand::Script(SymRef::External(p)) | Operand::Var(SymRef::External(p)) => write!(f, " extern#{p}"),
        }
    }
}
