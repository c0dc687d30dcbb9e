use lunar_literal::{parse_with_depth, Table, Value};

use crate::{
    error::{DebugError, Result},
    wire::{Command, CommandName},
};

/// One frame of a paused call stack, innermost first.
#[derive(Debug, Clone, PartialEq)]
pub struct StackFrame {
    pub index: usize,
    /// Function name, when Lua could work one out.
    pub name: Option<String>,
    pub source: String,
    pub short_source: String,
    pub line_defined: i64,
    pub current_line: i64,
    /// `Lua`, `C` or `main`.
    pub what: String,
    pub name_what: String,
    pub locals: Vec<Variable>,
    pub upvalues: Vec<Variable>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub name: String,
    pub value: Value,
    /// The debuggee's `tostring` of the value.
    pub display: String,
}

// Frame list, frame, scope table and value pair wrap each variable.
const STACK_ENVELOPE_DEPTH: usize = 4;

pub(crate) fn stack_command(max_depth: usize) -> Command {
    Command::new(CommandName::Stack).with_option(format!("maxlevel={max_depth}"))
}

/// Decodes a `STACK` reply.
///
/// Each frame is `{ {name, source, linedefined, currentline, what, namewhat,
/// short_src}, locals, upvalues }` where every variable maps its name to
/// `{value, tostring}`.
pub fn decode_stack(body: &str, max_depth: usize) -> Result<Vec<StackFrame>> {
    let value = parse_with_depth(body, max_depth.saturating_add(STACK_ENVELOPE_DEPTH))?;
    let frames = expect_table(&value, "stack")?;
    frames
        .sequence()
        .enumerate()
        .map(|(index, frame)| decode_frame(index, expect_table(frame, "stack frame")?))
        .collect()
}

fn decode_frame(index: usize, frame: &Table) -> Result<StackFrame> {
    let info = expect_table(
        frame.get_int(1).ok_or_else(|| malformed("stack frame has no info"))?,
        "frame info",
    )?;
    let text = |i: i64| info.get_int(i).and_then(Value::as_str).map(str::to_string);
    let line = |i: i64| info.get_int(i).and_then(Value::as_integer).unwrap_or(-1);

    Ok(StackFrame {
        index,
        name: text(1),
        source: text(2).unwrap_or_default(),
        line_defined: line(3),
        current_line: line(4),
        what: text(5).unwrap_or_default(),
        name_what: text(6).unwrap_or_default(),
        short_source: text(7).unwrap_or_default(),
        locals: decode_scope(frame.get_int(2))?,
        upvalues: decode_scope(frame.get_int(3))?,
    })
}

fn decode_scope(scope: Option<&Value>) -> Result<Vec<Variable>> {
    let Some(scope) = scope else {
        return Ok(Vec::new());
    };
    expect_table(scope, "variable scope")?
        .iter()
        .map(|(name, pair)| {
            let pair = expect_table(pair, "variable")?;
            let value = pair.get_int(1).cloned().unwrap_or(Value::Nil);
            let display = match pair.get_int(2).and_then(Value::as_str) {
                Some(text) => text.to_string(),
                None => value.to_string(),
            };
            Ok(Variable {
                name: name.label(),
                value,
                display,
            })
        })
        .collect()
}

fn expect_table<'a>(value: &'a Value, what: &str) -> Result<&'a Table> {
    value
        .as_table()
        .ok_or_else(|| malformed(&format!("{what} is a {}, not a table", value.type_name())))
}

fn malformed(message: &str) -> DebugError {
    DebugError::Protocol(format!("malformed stack reply: {message}"))
}
