//! Compiler and decompiler for the CRUSH map DSL.
//!
//! `compile` turns source text into a finalized [`crush::CrushMap`];
//! `decompile` renders a map back into source that recompiles to the same
//! bytes. The binary wire form itself lives in the `crush` crate.

pub mod ast;
pub mod compile;
pub mod decompile;
pub mod error;
pub mod lexer;
pub mod parser;

pub use compile::{compile, compile_program};
pub use decompile::decompile;
pub use error::CompileError;
