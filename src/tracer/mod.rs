//! Event model and line parsers for the upstream tcp tracing tools.

pub mod event;
pub mod parse;
pub mod stats;

pub use event::{EventKind, TypedEvent};
pub use parse::{parse_line, ParseError};
