//! # OSI Bytecode
//!
//! Reader, writer and symbolic transforms for OSI compiled-script files.
//!
//! ## Design Principles
//!
//! - **Byte-exact**: decoding then encoding an unmodified file reproduces it
//! - **Offset-addressed**: functions and methods point at subroutines by byte
//!   offset; [`Osi::update_offsets`] keeps them in step after edits
//! - **Symbolic editing**: transform passes swap raw indices and displacements
//!   for names and target markers, and lower them back before encoding
//! - **Closed instruction set**: concrete and abstract instructions are enums,
//!   matched exhaustively

#![warn(clippy::all)]
#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod error;
pub mod header;
pub mod instruction;
pub mod operand;
pub mod options;
pub mod osi;
pub mod primitive;
pub mod subroutine;
pub mod table;
mod transform;
pub mod view;

pub use error::{OsiError, Result};
pub use header::{Header, MAGIC, Version};
pub use instruction::{AbstractInstruction, AbstractKind, Bcl, BranchKind, Instruction, Opcode};
pub use operand::{
    ClassIndex, FunctionIndex, Literal, Name, StringIndex, SymbolIndex, TargetId, VariableRef,
};
pub use options::{ReadOptions, TransformOptions};
pub use osi::Osi;
pub use primitive::{LengthPrefix, PascalString, PrimitiveType, StringFlavor, Value};
pub use subroutine::{Subroutine, SubroutineId, SubroutineTable};
pub use table::{
    ClassDefinition, ClassMethod, ClassTable, CountWidth, FunctionDefinition, FunctionTable,
    StringTable,
};
pub use view::{BinaryView, Endian, Readable, Writable};
