/// GDB/MI protocol: record types and the line lexer.
pub mod lexer;
pub mod types;

pub use lexer::parse_line;
pub use types::*;
