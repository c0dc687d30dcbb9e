//! Decoder for the Lua literal subset that debuggees use to serialize values.
//!
//! Debug hooks running inside a Lua game send locals, upvalues and expression
//! results back as text that *looks like* Lua source (`{1, 2, x = "y"}`). This
//! crate turns that text into a [`Value`] tree without executing any of it:
//! only constants and table constructors are accepted, and anything resembling
//! code (calls, variable references, operators) is rejected.

mod parse;
mod value;

pub use parse::{parse, parse_with_depth, LiteralError, DEFAULT_MAX_DEPTH};
pub use value::{Key, Number, Table, Value};
