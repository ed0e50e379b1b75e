//! SQL parsing into the statement tree the router inspects

pub mod adapter;
pub mod ast;

pub use adapter::SqlParserAdapter;
pub use ast::{Command, ParsedStatement, Statement};
