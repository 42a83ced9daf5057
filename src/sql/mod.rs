//! SQL parsing and AST types.
//!
//! Uses the `sqlparser` crate for parsing, then converts to our internal AST.
//! Join order hints live in comments, which sqlparser discards, so they are
//! recovered from the token stream by [`hints`].

mod ast;
mod error;
pub mod hints;
mod parser;

pub use ast::*;
pub use error::{ParseError, ParseResult};
pub use parser::Parser;
