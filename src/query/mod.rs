//! Query processing module
//!
//! Four stages: [`lexer`] → [`parser`] (AST) → [`compiler`] (operator IR) →
//! [`executor`] (pull-based operators over a transaction).

pub mod ast;
pub mod compiler;
pub mod executor;
pub mod ir;
pub mod lexer;
pub mod parser;

pub use ast::{Query, Statement, StatementKind};
pub use compiler::{compile, CompileError, CompileResult};
pub use executor::{ExecutionError, ExecutionResult, QueryStream, Record, Value};
pub use ir::{LogicalOp, Plan};
pub use lexer::{LexError, LexResult};
pub use parser::{parse, parse_expression, ParseError, ParseResult};
