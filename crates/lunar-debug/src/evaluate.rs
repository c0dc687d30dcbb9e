use lunar_literal::{parse_with_depth, Value};

use crate::{
    error::{DebugError, Result},
    wire::{Command, CommandChannel, CommandName, ReplyHandle},
};

/// Evaluates Lua expressions in the context of a paused stack frame.
///
/// The debuggee runs `return <expression>` and answers with a table holding
/// one serialized literal per returned value, e.g. `{"2"}` for `1+1`.
#[derive(Debug, Clone)]
pub struct Evaluator {
    channel: CommandChannel,
    max_depth: usize,
}

impl Evaluator {
    pub fn new(channel: CommandChannel, max_depth: usize) -> Self {
        Self { channel, max_depth }
    }

    /// First returned value, or `nil` when the expression returned nothing.
    pub async fn evaluate(&self, frame: usize, expression: &str) -> Result<Value> {
        let mut values = self.evaluate_all(frame, expression).await?;
        Ok(if values.is_empty() {
            Value::Nil
        } else {
            values.swap_remove(0)
        })
    }

    pub async fn evaluate_all(&self, frame: usize, expression: &str) -> Result<Vec<Value>> {
        let handle = self.submit(frame, expression)?;
        let body = handle.await?;
        decode_results(&body, self.max_depth)
    }

    /// Callback flavour of [`Evaluator::evaluate`].
    ///
    /// The command is queued before this returns, so calls are answered in
    /// call order. Exactly one of the callbacks runs.
    pub fn evaluate_with<F, E>(&self, frame: usize, expression: &str, on_result: F, on_error: E)
    where
        F: FnOnce(Value) + Send + 'static,
        E: FnOnce(DebugError) + Send + 'static,
    {
        let handle = match self.submit(frame, expression) {
            Ok(handle) => handle,
            Err(err) => return on_error(err),
        };
        let max_depth = self.max_depth;
        tokio::spawn(async move {
            let result = handle
                .await
                .and_then(|body| decode_results(&body, max_depth));
            match result {
                Ok(values) => on_result(values.into_iter().next().unwrap_or(Value::Nil)),
                Err(err) => on_error(err),
            }
        });
    }

    fn submit(&self, frame: usize, expression: &str) -> Result<ReplyHandle> {
        self.channel
            .submit(exec_command(frame, expression, self.max_depth)?)
    }
}

pub(crate) fn exec_command(frame: usize, expression: &str, max_depth: usize) -> Result<Command> {
    let expression = expression.trim();
    if expression.is_empty() {
        return Err(DebugError::Protocol("empty expression".into()));
    }
    if expression.contains(['\n', '\r']) {
        return Err(DebugError::Protocol(
            "expression must fit on a single line".into(),
        ));
    }
    Ok(Command::new(CommandName::Exec)
        .with_args(format!("return {expression}"))
        .with_frame(frame)
        .with_option(format!("maxlevel={max_depth}")))
}

/// Decodes an `EXEC` reply: a flat table of serialized literals.
pub(crate) fn decode_results(body: &str, max_depth: usize) -> Result<Vec<Value>> {
    let results = match parse_with_depth(body, 1)? {
        Value::Table(table) => table,
        other => {
            return Err(DebugError::Protocol(format!(
                "expected a table of results, found {}",
                other.type_name()
            )))
        }
    };
    if results.sequence_len() != results.len() {
        return Err(DebugError::Protocol(
            "result table has non-positional entries".into(),
        ));
    }

    results
        .sequence()
        .map(|item| match item {
            Value::String(literal) => Ok(parse_with_depth(literal, max_depth)?),
            other => Err(DebugError::Protocol(format!(
                "expected a serialized result, found {}",
                other.type_name()
            ))),
        })
        .collect()
}
