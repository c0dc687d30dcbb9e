//! The MobDebug wire: line-oriented commands out, length-delimited responses in.

mod channel;
mod codec;

#[cfg(any(test, feature = "wire-test-support"))]
pub mod mock;

pub use channel::{ChannelConfig, ChannelEvent, CommandChannel, ReplyHandle};
pub use codec::{
    decode_header, encode_response, write_command, Command, CommandName, PauseLocation,
    Response, ResponseReader, Status, DEFAULT_MAX_BODY_BYTES, MAX_HEADER_LEN,
};
