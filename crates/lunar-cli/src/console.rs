use std::str::FromStr;

use lunar_debug::{
    DebugError, DebugSession, OutputMode, OutputStream, SessionEvent, SessionSnapshot,
    SessionState, StackFrame, StepKind, Value,
};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::broadcast::{self, error::RecvError};

const HELP: &str = "\
commands:
  run                     continue until the next breakpoint
  step | over | out       step into, over or out of the current line
  pause                   interrupt a running program
  break <file> <line>     set a breakpoint
  clear <file> <line>     remove a breakpoint
  eval <expr>             evaluate in the selected frame
  frame <n>               select a stack frame
  stack                   show the call stack
  output <c|r|d>          copy, redirect or stop forwarding program output
  state                   show the session state
  detach                  let the program continue without the debugger
  exit                    stop the program";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Run,
    Step(StepKind),
    Pause,
    Break { file: String, line: u32 },
    Clear { file: String, line: u32 },
    Eval(String),
    Frame(usize),
    Stack,
    Output(OutputMode),
    State,
    Detach,
    Exit,
    Help,
}

impl FromStr for ConsoleCommand {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (word, rest) = line
            .split_once(char::is_whitespace)
            .map_or((line, ""), |(word, rest)| (word, rest.trim()));

        let command = match word {
            "run" | "r" => ConsoleCommand::Run,
            "step" | "s" => ConsoleCommand::Step(StepKind::Into),
            "over" | "n" => ConsoleCommand::Step(StepKind::Over),
            "out" => ConsoleCommand::Step(StepKind::Out),
            "pause" => ConsoleCommand::Pause,
            "break" | "b" => {
                let (file, line) = file_and_line(rest)?;
                ConsoleCommand::Break { file, line }
            }
            "clear" => {
                let (file, line) = file_and_line(rest)?;
                ConsoleCommand::Clear { file, line }
            }
            "eval" | "e" | "p" => {
                if rest.is_empty() {
                    return Err("usage: eval <expr>".into());
                }
                ConsoleCommand::Eval(rest.to_owned())
            }
            "frame" | "f" => ConsoleCommand::Frame(
                rest.parse()
                    .map_err(|_| format!("invalid frame number {rest:?}"))?,
            ),
            "stack" | "bt" => ConsoleCommand::Stack,
            "output" => ConsoleCommand::Output(match rest {
                "c" | "copy" => OutputMode::Copy,
                "r" | "redirect" => OutputMode::Redirect,
                "d" | "default" => OutputMode::Default,
                _ => return Err("usage: output <c|r|d>".into()),
            }),
            "state" => ConsoleCommand::State,
            "detach" => ConsoleCommand::Detach,
            "exit" | "quit" | "q" => ConsoleCommand::Exit,
            "help" | "?" => ConsoleCommand::Help,
            _ => return Err(format!("unknown command {word:?}; try `help`")),
        };
        Ok(command)
    }
}

/// `file line`, where the file may contain spaces.
fn file_and_line(rest: &str) -> Result<(String, u32), String> {
    let usage = || "expected <file> <line>".to_string();
    let (file, line) = rest.rsplit_once(char::is_whitespace).ok_or_else(usage)?;
    let line = line.parse().map_err(|_| usage())?;
    let file = file.trim();
    if file.is_empty() {
        return Err(usage());
    }
    Ok((file.to_owned(), line))
}

impl ConsoleCommand {
    fn ends_session(&self) -> bool {
        matches!(self, ConsoleCommand::Detach | ConsoleCommand::Exit)
    }
}

/// Runs one command and returns what to print.
pub async fn execute(
    session: &DebugSession,
    command: &ConsoleCommand,
    json: bool,
) -> Result<Option<String>, DebugError> {
    let text = match command {
        ConsoleCommand::Run => {
            session.run().await?;
            None
        }
        ConsoleCommand::Step(kind) => {
            session.step(*kind).await?;
            None
        }
        ConsoleCommand::Pause => {
            let location = session.pause().await?;
            Some(format!("paused at {}:{}", location.file, location.line))
        }
        ConsoleCommand::Break { file, line } => {
            let added = session.set_breakpoint(file.clone(), *line).await?;
            Some(if added {
                format!("breakpoint set at {file}:{line}")
            } else {
                format!("breakpoint already set at {file}:{line}")
            })
        }
        ConsoleCommand::Clear { file, line } => {
            let removed = session.clear_breakpoint(file, *line).await?;
            Some(if removed {
                format!("breakpoint cleared at {file}:{line}")
            } else {
                format!("no breakpoint at {file}:{line}")
            })
        }
        ConsoleCommand::Eval(expression) => {
            let frame = session.snapshot().frame;
            let values = session.evaluate_all(frame, expression).await?;
            Some(render_values(&values, json))
        }
        ConsoleCommand::Frame(frame) => {
            session.select_frame(*frame)?;
            Some(format!("frame {frame} selected"))
        }
        ConsoleCommand::Stack => {
            let frames = session.stack().await?;
            Some(render_stack(&frames, json))
        }
        ConsoleCommand::Output(mode) => {
            session.set_output(OutputStream::Stdout, *mode).await?;
            None
        }
        ConsoleCommand::State => Some(render_snapshot(&session.snapshot(), json)),
        ConsoleCommand::Detach => {
            session.detach().await?;
            Some("detached".to_owned())
        }
        ConsoleCommand::Exit => {
            session.exit().await?;
            Some("debuggee asked to exit".to_owned())
        }
        ConsoleCommand::Help => Some(HELP.to_owned()),
    };
    Ok(text)
}

/// Reads commands from `input` until it ends or the session is over.
pub async fn run<R>(session: &DebugSession, json: bool, input: R) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(input).lines();
    let mut events = session.subscribe();

    loop {
        if is_over(session.state()) {
            return Ok(());
        }
        let line = tokio::select! {
            line = lines.next_line() => line?,
            event = events.recv() => {
                match event {
                    Err(RecvError::Closed) => return Ok(()),
                    _ => continue,
                }
            }
        };
        let Some(line) = line else {
            return Ok(());
        };
        if line.trim().is_empty() {
            continue;
        }

        let command = match line.parse::<ConsoleCommand>() {
            Ok(command) => command,
            Err(message) => {
                println!("error: {message}");
                continue;
            }
        };
        match execute(session, &command, json).await {
            Ok(Some(text)) => println!("{text}"),
            Ok(None) => {}
            Err(err) => println!("error: {err}"),
        }
        if command.ends_session() && is_over(session.state()) {
            return Ok(());
        }
    }
}

fn is_over(state: SessionState) -> bool {
    matches!(state, SessionState::Terminated | SessionState::Disconnected)
}

/// Prints session events as they arrive until the session goes away.
pub async fn print_events(mut events: broadcast::Receiver<SessionEvent>, json: bool) {
    let mut last_state = None;
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "console fell behind on session events");
                continue;
            }
            Err(RecvError::Closed) => return,
        };
        match event {
            SessionEvent::StateChanged(snapshot) => {
                let key = (snapshot.state, snapshot.location.clone());
                if last_state.as_ref() == Some(&key) {
                    continue;
                }
                last_state = Some(key);
                println!("{}", render_snapshot(&snapshot, json));
            }
            SessionEvent::Output(text) => {
                if json {
                    println!("{}", json!({ "event": "output", "text": text }));
                } else {
                    print!("{text}");
                }
            }
            SessionEvent::DebuggeeError(message) => {
                if json {
                    println!("{}", json!({ "event": "error", "message": message }));
                } else {
                    println!("[debuggee error] {message}");
                }
            }
        }
    }
}

fn render_snapshot(snapshot: &SessionSnapshot, json: bool) -> String {
    if json {
        return json!({
            "event": "state",
            "state": snapshot.state.to_string(),
            "frame": snapshot.frame,
            "file": snapshot.location.as_ref().map(|l| l.file.clone()),
            "line": snapshot.location.as_ref().map(|l| l.line),
            "breakpoints": snapshot
                .breakpoints
                .iter()
                .map(|bp| bp.to_string())
                .collect::<Vec<_>>(),
        })
        .to_string();
    }
    match &snapshot.location {
        Some(location) => format!(
            "[{}] {}:{} (frame {})",
            snapshot.state, location.file, location.line, snapshot.frame
        ),
        None => format!("[{}]", snapshot.state),
    }
}

fn render_values(values: &[Value], json: bool) -> String {
    if json {
        return serde_json::to_string(values).unwrap_or_else(|err| format!("error: {err}"));
    }
    if values.is_empty() {
        return "nil".to_owned();
    }
    values
        .iter()
        .map(Value::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn render_stack(frames: &[StackFrame], json: bool) -> String {
    if json {
        let frames: Vec<_> = frames
            .iter()
            .map(|frame| {
                json!({
                    "index": frame.index,
                    "name": frame.name,
                    "source": frame.short_source,
                    "line": frame.current_line,
                    "what": frame.what,
                    "locals": frame
                        .locals
                        .iter()
                        .map(|var| {
                            json!({
                                "name": var.name,
                                "value": var.value,
                                "display": var.display,
                            })
                        })
                        .collect::<Vec<_>>(),
                })
            })
            .collect();
        return serde_json::Value::Array(frames).to_string();
    }

    let mut out = String::new();
    for frame in frames {
        let name = frame.name.as_deref().unwrap_or("?");
        out.push_str(&format!(
            "#{} {name} at {}:{}\n",
            frame.index, frame.short_source, frame.current_line
        ));
        for var in &frame.locals {
            out.push_str(&format!("    {} = {}\n", var.name, var.display));
        }
    }
    out.trim_end().to_owned()
}
