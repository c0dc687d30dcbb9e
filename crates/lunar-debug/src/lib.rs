//! Client side of the MobDebug remote debugging protocol for Lua games.
//!
//! A [`DebugSession`] owns one connection to a debuggee. Requests travel over
//! a half-duplex [`wire::CommandChannel`]; values the debuggee sends back as
//! Lua table-constructor text are rebuilt with [`lunar_literal`].
//!
//! ```no_run
//! # async fn demo() -> lunar_debug::Result<()> {
//! use lunar_debug::{DebugSession, SessionConfig};
//!
//! let session = DebugSession::new(SessionConfig::default());
//! session.set_breakpoint("main.lua", 42).await?;
//! session.attach(("127.0.0.1", 8172)).await?;
//! let value = session.evaluate(0, "player.hp").await?;
//! println!("{value}");
//! # Ok(())
//! # }
//! ```

mod error;
mod evaluate;
mod poison;
mod session;
mod stack;
pub mod wire;

pub use error::{DebugError, ErrorKind, Result};
pub use evaluate::Evaluator;
pub use lunar_literal::{Key, Number, Table, Value};
pub use session::{
    Breakpoint, DebugSession, OutputMode, OutputStream, SessionConfig, SessionEvent,
    SessionSnapshot, SessionState, StepKind,
};
pub use stack::{decode_stack, StackFrame, Variable};
pub use wire::PauseLocation;
