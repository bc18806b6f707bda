//! Instruction model
//!
//! Two disjoint families share the [`Instruction`] type:
//!
//! - [`Bcl`]: concrete instructions with a one-byte opcode and fixed-width
//!   operands. Only this family implements [`Readable`] / [`Writable`].
//! - [`AbstractInstruction`]: symbolic stand-ins produced by the transform
//!   passes (jump targets, inlined strings and names). They report the size of
//!   the concrete code they lower to, so layouts can be computed in either form.
//!
//! Arguments are typed struct fields. [`Instruction::args`],
//! [`Instruction::set_arg`] and [`Instruction::from_args`] give index-based
//! access for assemblers and disassemblers.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{OsiError, Result};
use crate::operand::{
    ClassIndex, FunctionIndex, Literal, Name, Operand, StringIndex, SymbolIndex, TargetId,
    VariableRef, WireOperand,
};
use crate::primitive::{PrimitiveType, Value};
use crate::view::{BinaryView, Readable, Writable};

/// Opcode of the 24-bit constant push, which is recognised but not supported
pub const PUSH_INT24_OPCODE: u8 = 0x03;

fn check_arity(name: &str, types: &[PrimitiveType], args: &[Value]) -> Result<()> {
    if types.len() != args.len() {
        return Err(OsiError::value(format!(
            "{name} takes {} argument(s), got {}",
            types.len(),
            args.len()
        )));
    }
    Ok(())
}

fn take_arg<T: Operand>(name: &str, args: &[Value], position: &mut usize) -> Result<T> {
    let value = &args[*position];
    let operand = T::from_value(value).ok_or_else(|| {
        OsiError::value(format!(
            "argument {} of {name} must be {}, got {} {value}",
            *position,
            T::TYPE,
            value.ty()
        ))
    })?;
    *position += 1;
    Ok(operand)
}

macro_rules! define_bcl {
    ($(
        $(#[$doc:meta])*
        $name:ident = $code:literal { $($field:ident : $ty:ty),* $(,)? }
    ),* $(,)?) => {
        /// Concrete instruction opcodes
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[repr(u8)]
        pub enum Opcode {
            $( $(#[$doc])* $name = $code, )*
        }

        impl Opcode {
            /// Convert from raw byte
            pub fn from_byte(byte: u8) -> Option<Self> {
                match byte {
                    $( $code => Some(Self::$name), )*
                    _ => None,
                }
            }

            /// Convert to raw byte
            #[inline]
            pub fn to_byte(self) -> u8 {
                self as u8
            }

            /// Get the name of this opcode
            pub const fn name(self) -> &'static str {
                match self {
                    $( Self::$name => stringify!($name), )*
                }
            }

            /// Look an opcode up by name
            pub fn from_name(name: &str) -> Option<Self> {
                match name {
                    $( stringify!($name) => Some(Self::$name), )*
                    _ => None,
                }
            }

            /// Declared operand types, in order
            pub fn arg_types(self) -> &'static [PrimitiveType] {
                match self {
                    $(
                        Self::$name => {
                            const TYPES: &[PrimitiveType] = &[$(<$ty as Operand>::TYPE),*];
                            TYPES
                        }
                    )*
                }
            }

            /// Encoded size: opcode byte plus operands
            pub const fn size(self) -> usize {
                match self {
                    $( Self::$name => 1 $(+ <$ty as WireOperand>::SIZE)*, )*
                }
            }
        }

        /// A concrete instruction with its operands
        #[derive(Debug, Clone, Copy, PartialEq, Serialize)]
        #[allow(missing_docs)]
        pub enum Bcl {
            $( $(#[$doc])* $name { $($field: $ty),* }, )*
        }

        impl Bcl {
            /// Opcode of this instruction
            pub const fn opcode(&self) -> Opcode {
                match self {
                    $( Self::$name { .. } => Opcode::$name, )*
                }
            }

            /// Operands as generic values
            pub fn args(&self) -> Vec<Value> {
                match self {
                    $( Self::$name { $($field),* } => vec![$( Operand::to_value($field) ),*], )*
                }
            }

            /// Build an instruction from generic values, checking types
            pub fn from_args(opcode: Opcode, args: &[Value]) -> Result<Self> {
                check_arity(opcode.name(), opcode.arg_types(), args)?;
                let mut _position = 0usize;
                Ok(match opcode {
                    $(
                        Opcode::$name => Self::$name {
                            $( $field: take_arg::<$ty>(opcode.name(), args, &mut _position)? ),*
                        },
                    )*
                })
            }

            fn read_operands(opcode: Opcode, view: &mut BinaryView) -> Result<Self> {
                Ok(match opcode {
                    $(
                        Opcode::$name => Self::$name {
                            $( $field: <$ty as WireOperand>::read(view)? ),*
                        },
                    )*
                })
            }

            fn write_operands(&self, view: &mut BinaryView) -> Result<()> {
                match self {
                    $( Self::$name { $($field),* } => { $( WireOperand::write($field, view)?; )* } )*
                }
                Ok(())
            }
        }
    };
}

define_bcl! {
    // ==================== Constants ====================
    /// No operation
    Nop = 0x00 {},
    /// Push an 8-bit integer
    PushInt8 = 0x01 { value: i8 },
    /// Push a 16-bit integer
    PushInt16 = 0x02 { value: i16 },
    /// Push a 32-bit integer
    PushInt32 = 0x04 { value: i32 },
    /// Push a 32-bit float
    PushFloat = 0x05 { value: f32 },
    /// Push a string from the string table
    PushString = 0x06 { index: StringIndex },
    /// Push `true`
    PushTrue = 0x07 {},
    /// Push `false`
    PushFalse = 0x08 {},
    /// Push `null`
    PushNull = 0x09 {},
    /// Push the receiver of the current method
    PushThis = 0x0A {},

    // ==================== Variables ====================
    /// Push a local or global variable
    PushVariable = 0x10 { variable: VariableRef },
    /// Pop into a local or global variable
    PopVariable = 0x11 { variable: VariableRef },

    // ==================== Members ====================
    /// Read a member named by a symbol
    GetMember = 0x18 { symbol: SymbolIndex },
    /// Write a member named by a symbol
    SetMember = 0x19 { symbol: SymbolIndex },
    /// Call a method named by a symbol
    CallMethod = 0x1A { symbol: SymbolIndex, argc: u8 },

    // ==================== Objects ====================
    /// Instantiate a class from the class table
    NewObject = 0x20 { class: ClassIndex },

    // ==================== Calls ====================
    /// Call a function from the function table
    CallFunction = 0x28 { function: FunctionIndex, argc: u8 },
    /// Call a host-provided native
    CallNative = 0x29 { native: u16, argc: u8 },
    /// Return without a value
    Return = 0x2A {},
    /// Return the top of stack
    ReturnValue = 0x2B {},
    /// End of a subroutine
    End = 0x2F {},

    // ==================== Arithmetic ====================
    /// Addition
    Add = 0x30 {},
    /// Subtraction
    Sub = 0x31 {},
    /// Multiplication
    Mul = 0x32 {},
    /// Division
    Div = 0x33 {},
    /// Modulo
    Mod = 0x34 {},
    /// Negation
    Neg = 0x35 {},

    // ==================== Logical ====================
    /// Logical not
    Not = 0x38 {},
    /// Logical and
    And = 0x39 {},
    /// Logical or
    Or = 0x3A {},

    // ==================== Comparison ====================
    /// Equality
    Eq = 0x40 {},
    /// Inequality
    Ne = 0x41 {},
    /// Less than
    Lt = 0x42 {},
    /// Less than or equal
    Le = 0x43 {},
    /// Greater than
    Gt = 0x44 {},
    /// Greater than or equal
    Ge = 0x45 {},

    // ==================== Stack ====================
    /// Discard the top of stack
    Pop = 0x48 {},
    /// Duplicate the top of stack
    Dup = 0x49 {},
    /// Swap the two topmost values
    Swap = 0x4A {},

    // ==================== Control flow ====================
    /// Jump by a 32-bit displacement popped from the stack
    JumpRelative = 0x50 {},
    /// Unconditional branch by an inline displacement
    Branch = 0x51 { displacement: i16 },
    /// Branch if the popped value is true
    BranchIfTrue = 0x52 { displacement: i16 },
    /// Branch if the popped value is false
    BranchIfFalse = 0x53 { displacement: i16 },

    // ==================== Debug ====================
    /// Source line marker
    Line = 0x58 { line: u16 },
}

impl Bcl {
    /// Encoded size in bytes
    #[inline]
    pub const fn size(&self) -> usize {
        self.opcode().size()
    }

    /// Check if this instruction closes a subroutine on the wire
    #[inline]
    pub const fn is_terminator(&self) -> bool {
        matches!(self, Self::End {})
    }

    /// Kind and displacement of an inline branch
    pub const fn branch(&self) -> Option<(BranchKind, i16)> {
        match *self {
            Self::Branch { displacement } => Some((BranchKind::Always, displacement)),
            Self::BranchIfTrue { displacement } => Some((BranchKind::IfTrue, displacement)),
            Self::BranchIfFalse { displacement } => Some((BranchKind::IfFalse, displacement)),
            _ => None,
        }
    }
}

impl Readable for Bcl {
    fn buffer_read(view: &mut BinaryView) -> Result<Self> {
        let byte: u8 = view.read()?;
        if byte == PUSH_INT24_OPCODE {
            return Err(OsiError::Unimplemented(format!(
                "24-bit constant push (opcode {byte:#04x})"
            )));
        }
        let opcode = Opcode::from_byte(byte)
            .ok_or_else(|| OsiError::invalid(format!("unknown opcode {byte:#04x}")))?;
        Self::read_operands(opcode, view)
    }
}

impl Writable for Bcl {
    fn buffer_size(&self) -> usize {
        self.size()
    }

    fn buffer_write(&self, view: &mut BinaryView) -> Result<()> {
        view.write(self.opcode().to_byte())?;
        self.write_operands(view)
    }
}

/// Condition of an inline branch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BranchKind {
    /// Unconditional
    Always,
    /// Taken when the popped value is true
    IfTrue,
    /// Taken when the popped value is false
    IfFalse,
}

impl BranchKind {
    /// Concrete branch with an inline displacement
    pub const fn concrete(self, displacement: i16) -> Bcl {
        match self {
            Self::Always => Bcl::Branch { displacement },
            Self::IfTrue => Bcl::BranchIfTrue { displacement },
            Self::IfFalse => Bcl::BranchIfFalse { displacement },
        }
    }

    /// Symbolic branch to a target marker
    pub const fn symbolic(self, target: TargetId, adjust: u32) -> AbstractInstruction {
        match self {
            Self::Always => AbstractInstruction::BranchTo { target, adjust },
            Self::IfTrue => AbstractInstruction::BranchIfTrueTo { target, adjust },
            Self::IfFalse => AbstractInstruction::BranchIfFalseTo { target, adjust },
        }
    }
}

macro_rules! define_abstract {
    ($(
        $(#[$doc:meta])*
        $name:ident { $($field:ident : $ty:ty),* $(,)? } => $size:expr
    ),* $(,)?) => {
        /// Kinds of abstract instruction
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum AbstractKind {
            $( $(#[$doc])* $name, )*
        }

        impl AbstractKind {
            /// Name used in assembly text
            pub const fn name(self) -> &'static str {
                match self {
                    $( Self::$name => stringify!($name), )*
                }
            }

            /// Look a kind up by name
            pub fn from_name(name: &str) -> Option<Self> {
                match name {
                    $( stringify!($name) => Some(Self::$name), )*
                    _ => None,
                }
            }

            /// Declared argument types, in order
            pub fn arg_types(self) -> &'static [PrimitiveType] {
                match self {
                    $(
                        Self::$name => {
                            const TYPES: &[PrimitiveType] = &[$(<$ty as Operand>::TYPE),*];
                            TYPES
                        }
                    )*
                }
            }

            /// Size of the concrete code this lowers to
            pub const fn size(self) -> usize {
                match self {
                    $( Self::$name => $size, )*
                }
            }
        }

        /// A symbolic instruction produced by a transform pass
        #[derive(Debug, Clone, PartialEq, Serialize)]
        #[allow(missing_docs)]
        pub enum AbstractInstruction {
            $( $(#[$doc])* $name { $($field: $ty),* }, )*
        }

        impl AbstractInstruction {
            /// Kind of this instruction
            pub const fn kind(&self) -> AbstractKind {
                match self {
                    $( Self::$name { .. } => AbstractKind::$name, )*
                }
            }

            /// Arguments as generic values
            pub fn args(&self) -> Vec<Value> {
                match self {
                    $( Self::$name { $($field),* } => vec![$( Operand::to_value($field) ),*], )*
                }
            }

            /// Build an instruction from generic values, checking types
            pub fn from_args(kind: AbstractKind, args: &[Value]) -> Result<Self> {
                check_arity(kind.name(), kind.arg_types(), args)?;
                let mut _position = 0usize;
                Ok(match kind {
                    $(
                        AbstractKind::$name => Self::$name {
                            $( $field: take_arg::<$ty>(kind.name(), args, &mut _position)? ),*
                        },
                    )*
                })
            }
        }
    };
}

define_abstract! {
    /// Position a jump can land on
    JumpTarget { id: TargetId } => 0,
    /// Push of a jump displacement towards a target marker
    JumpPush { target: TargetId, adjust: u32 } => Opcode::PushInt32.size(),
    /// Position a branch can land on
    BranchTarget { id: TargetId } => 0,
    /// Unconditional branch to a target marker
    BranchTo { target: TargetId, adjust: u32 } => Opcode::Branch.size(),
    /// Branch-if-true to a target marker
    BranchIfTrueTo { target: TargetId, adjust: u32 } => Opcode::BranchIfTrue.size(),
    /// Branch-if-false to a target marker
    BranchIfFalseTo { target: TargetId, adjust: u32 } => Opcode::BranchIfFalse.size(),
    /// Push of an inlined string literal
    PushStringLiteral { value: Literal } => Opcode::PushString.size(),
    /// Member read by symbol name
    GetMemberNamed { symbol: Name } => Opcode::GetMember.size(),
    /// Member write by symbol name
    SetMemberNamed { symbol: Name } => Opcode::SetMember.size(),
    /// Method call by symbol name
    CallMethodNamed { symbol: Name, argc: u8 } => Opcode::CallMethod.size(),
    /// Push of a global variable by name
    PushGlobal { name: Name } => Opcode::PushVariable.size(),
    /// Pop into a global variable by name
    PopGlobal { name: Name } => Opcode::PopVariable.size(),
    /// Instantiation by class name
    NewObjectNamed { class: Name } => Opcode::NewObject.size(),
}

impl AbstractInstruction {
    /// Size of the concrete code this lowers to
    #[inline]
    pub const fn size(&self) -> usize {
        self.kind().size()
    }

    /// Target marker ID, if this is a jump or branch marker
    pub const fn marker_id(&self) -> Option<TargetId> {
        match *self {
            Self::JumpTarget { id } | Self::BranchTarget { id } => Some(id),
            _ => None,
        }
    }

    /// Target ID this instruction refers to, if any
    pub const fn target_ref(&self) -> Option<TargetId> {
        match *self {
            Self::JumpPush { target, .. }
            | Self::BranchTo { target, .. }
            | Self::BranchIfTrueTo { target, .. }
            | Self::BranchIfFalseTo { target, .. } => Some(target),
            _ => None,
        }
    }

    /// Kind, target and adjustment of a symbolic branch
    pub const fn branch(&self) -> Option<(BranchKind, TargetId, u32)> {
        match *self {
            Self::BranchTo { target, adjust } => Some((BranchKind::Always, target, adjust)),
            Self::BranchIfTrueTo { target, adjust } => Some((BranchKind::IfTrue, target, adjust)),
            Self::BranchIfFalseTo { target, adjust } => {
                Some((BranchKind::IfFalse, target, adjust))
            }
            _ => None,
        }
    }
}

/// A concrete or abstract instruction
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Instruction {
    /// Wire-encodable instruction
    Bcl(Bcl),
    /// Symbolic instruction
    Abstract(AbstractInstruction),
}

impl Instruction {
    /// Build an instruction by name from generic argument values
    ///
    /// Concrete opcode names are tried first, then abstract kinds.
    pub fn from_args(name: &str, args: &[Value]) -> Result<Self> {
        if let Some(opcode) = Opcode::from_name(name) {
            return Bcl::from_args(opcode, args).map(Self::Bcl);
        }
        if let Some(kind) = AbstractKind::from_name(name) {
            return AbstractInstruction::from_args(kind, args).map(Self::Abstract);
        }
        Err(OsiError::invalid(format!("unknown instruction {name}")))
    }

    /// Instruction name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Bcl(bcl) => bcl.opcode().name(),
            Self::Abstract(instr) => instr.kind().name(),
        }
    }

    /// Encoded size (for abstract instructions, the size of their lowering)
    #[inline]
    pub fn size(&self) -> usize {
        match self {
            Self::Bcl(bcl) => bcl.size(),
            Self::Abstract(instr) => instr.size(),
        }
    }

    /// Check if this is a symbolic instruction
    #[inline]
    pub fn is_abstract(&self) -> bool {
        matches!(self, Self::Abstract(_))
    }

    /// Concrete instruction, if this is one
    #[inline]
    pub fn as_bcl(&self) -> Option<&Bcl> {
        match self {
            Self::Bcl(bcl) => Some(bcl),
            Self::Abstract(_) => None,
        }
    }

    /// Abstract instruction, if this is one
    #[inline]
    pub fn as_abstract(&self) -> Option<&AbstractInstruction> {
        match self {
            Self::Abstract(instr) => Some(instr),
            Self::Bcl(_) => None,
        }
    }

    /// Declared argument types
    pub fn arg_types(&self) -> &'static [PrimitiveType] {
        match self {
            Self::Bcl(bcl) => bcl.opcode().arg_types(),
            Self::Abstract(instr) => instr.kind().arg_types(),
        }
    }

    /// Arguments as generic values
    pub fn args(&self) -> Vec<Value> {
        match self {
            Self::Bcl(bcl) => bcl.args(),
            Self::Abstract(instr) => instr.args(),
        }
    }

    /// Argument at `position`
    pub fn arg(&self, position: usize) -> Option<Value> {
        self.args().into_iter().nth(position)
    }

    /// Replace the argument at `position`, checking its type
    pub fn set_arg(&mut self, position: usize, value: Value) -> Result<()> {
        let mut args = self.args();
        let Some(slot) = args.get_mut(position) else {
            return Err(OsiError::range(format!(
                "{} has no argument {position} (arity {})",
                self.name(),
                self.arg_types().len()
            )));
        };
        *slot = value;
        *self = Self::from_args(self.name(), &args)?;
        Ok(())
    }
}

impl From<Bcl> for Instruction {
    fn from(bcl: Bcl) -> Self {
        Self::Bcl(bcl)
    }
}

impl From<AbstractInstruction> for Instruction {
    fn from(instr: AbstractInstruction) -> Self {
        Self::Abstract(instr)
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())?;
        for (i, arg) in self.args().iter().enumerate() {
            let sep = if i == 0 { " " } else { ", " };
            write!(f, "{sep}{arg}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitive::PascalString;
    use crate::view::Endian;

    #[test]
    fn test_opcode_roundtrip() {
        let opcodes = [
            Opcode::Nop,
            Opcode::PushInt32,
            Opcode::PushString,
            Opcode::CallMethod,
            Opcode::End,
            Opcode::JumpRelative,
            Opcode::BranchIfFalse,
            Opcode::Line,
        ];
        for op in opcodes {
            let byte = op.to_byte();
            assert_eq!(Opcode::from_byte(byte), Some(op));
            assert_eq!(Opcode::from_name(op.name()), Some(op));
        }
    }

    #[test]
    fn test_invalid_opcode() {
        assert_eq!(Opcode::from_byte(0xFF), None);
        assert_eq!(Opcode::from_byte(PUSH_INT24_OPCODE), None);
    }

    #[test]
    fn test_sizes() {
        assert_eq!(Opcode::Nop.size(), 1);
        assert_eq!(Opcode::PushInt32.size(), 5);
        assert_eq!(Opcode::CallMethod.size(), 4);
        assert_eq!(Opcode::Branch.size(), 3);
        assert_eq!(AbstractKind::JumpTarget.size(), 0);
        assert_eq!(AbstractKind::JumpPush.size(), 5);
        assert_eq!(AbstractKind::CallMethodNamed.size(), 4);
    }

    #[test]
    fn test_wire_encoding() {
        let instr = Bcl::CallMethod {
            symbol: SymbolIndex(0x0102),
            argc: 3,
        };
        let mut view = BinaryView::new(instr.size(), Endian::Little);
        view.write_struct(&instr).unwrap();
        assert_eq!(view.to_hex(), "1a020103");

        view.set_offset(0).unwrap();
        let decoded: Bcl = view.read_struct().unwrap();
        assert_eq!(decoded, instr);
    }

    #[test]
    fn test_int24_push_is_unimplemented() {
        let mut view = BinaryView::from_hex("03 010203", Endian::Little).unwrap();
        assert!(matches!(
            view.read_struct::<Bcl>(),
            Err(OsiError::Unimplemented(_))
        ));
    }

    #[test]
    fn test_unknown_opcode_is_invalid() {
        let mut view = BinaryView::from_hex("ee", Endian::Little).unwrap();
        assert!(matches!(view.read_struct::<Bcl>(), Err(OsiError::Invalid(_))));
    }

    #[test]
    fn test_truncated_operand_is_range_error() {
        let mut view = BinaryView::from_hex("04 0102", Endian::Little).unwrap();
        assert!(matches!(view.read_struct::<Bcl>(), Err(OsiError::Range(_))));
        assert_eq!(view.offset(), 0);
    }

    #[test]
    fn test_generic_arguments() {
        let mut instr = Instruction::from_args("CallMethod", &[Value::U16(4), Value::U8(2)]).unwrap();
        assert_eq!(
            instr,
            Instruction::Bcl(Bcl::CallMethod {
                symbol: SymbolIndex(4),
                argc: 2
            })
        );
        assert_eq!(instr.arg(1), Some(Value::U8(2)));
        assert_eq!(instr.arg(2), None);

        instr.set_arg(1, Value::U8(5)).unwrap();
        assert_eq!(instr.arg(1), Some(Value::U8(5)));

        assert!(matches!(instr.set_arg(1, Value::I32(5)), Err(OsiError::Value(_))));
        assert!(matches!(instr.set_arg(2, Value::U8(5)), Err(OsiError::Range(_))));
        // A failed assignment leaves the instruction untouched
        assert_eq!(instr.arg(1), Some(Value::U8(5)));
    }

    #[test]
    fn test_abstract_from_args() {
        let literal = PascalString::new(b"hi".to_vec(), Literal::FLAVOR).unwrap();
        let instr = Instruction::from_args("PushStringLiteral", &[Value::Str(literal.clone())]).unwrap();
        assert!(instr.is_abstract());
        assert_eq!(instr.size(), Opcode::PushString.size());
        assert_eq!(instr.to_string(), "PushStringLiteral \"hi\"");

        let wrong_flavor = literal.with_flavor(Name::FLAVOR).unwrap();
        assert!(matches!(
            Instruction::from_args("PushStringLiteral", &[Value::Str(wrong_flavor)]),
            Err(OsiError::Value(_))
        ));
        assert!(matches!(
            Instruction::from_args("NoSuchThing", &[]),
            Err(OsiError::Invalid(_))
        ));
        assert!(matches!(
            Instruction::from_args("Add", &[Value::U8(1)]),
            Err(OsiError::Value(_))
        ));
    }

    #[test]
    fn test_display() {
        let instr = Instruction::Bcl(Bcl::PushInt32 { value: -7 });
        assert_eq!(instr.to_string(), "PushInt32 -7");
        let instr = Instruction::Abstract(AbstractInstruction::JumpPush {
            target: TargetId(3),
            adjust: 1,
        });
        assert_eq!(instr.to_string(), "JumpPush 3, 1");
    }
}
