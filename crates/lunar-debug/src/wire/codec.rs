use std::{fmt, io};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::error::{DebugError, Result};

/// Longest response header line accepted, newline included.
pub const MAX_HEADER_LEN: usize = 1024;

/// Default cap on a single response body.
pub const DEFAULT_MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Commands understood by the debuggee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandName {
    Run,
    Step,
    Over,
    Out,
    Suspend,
    SetBreakpoint,
    DeleteBreakpoint,
    Exec,
    Stack,
    BaseDir,
    Output,
    Done,
    Exit,
}

impl CommandName {
    pub fn as_str(self) -> &'static str {
        match self {
            CommandName::Run => "RUN",
            CommandName::Step => "STEP",
            CommandName::Over => "OVER",
            CommandName::Out => "OUT",
            CommandName::Suspend => "SUSPEND",
            CommandName::SetBreakpoint => "SETB",
            CommandName::DeleteBreakpoint => "DELB",
            CommandName::Exec => "EXEC",
            CommandName::Stack => "STACK",
            CommandName::BaseDir => "BASEDIR",
            CommandName::Output => "OUTPUT",
            CommandName::Done => "DONE",
            CommandName::Exit => "EXIT",
        }
    }

    pub fn from_wire(token: &str) -> Option<Self> {
        Some(match token {
            "RUN" => CommandName::Run,
            "STEP" => CommandName::Step,
            "OVER" => CommandName::Over,
            "OUT" => CommandName::Out,
            "SUSPEND" => CommandName::Suspend,
            "SETB" => CommandName::SetBreakpoint,
            "DELB" => CommandName::DeleteBreakpoint,
            "EXEC" => CommandName::Exec,
            "STACK" => CommandName::Stack,
            "BASEDIR" => CommandName::BaseDir,
            "OUTPUT" => CommandName::Output,
            "DONE" => CommandName::Done,
            "EXIT" => CommandName::Exit,
            _ => return None,
        })
    }

    /// A `PAUSED` frame doubles as the reply to these commands.
    pub(crate) fn is_answered_by_pause(self) -> bool {
        matches!(self, CommandName::Suspend)
    }
}

impl fmt::Display for CommandName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single request line: `NAME args --{stack=N; opt}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    name: CommandName,
    args: String,
    frame: Option<usize>,
    options: Vec<String>,
}

impl Command {
    pub fn new(name: CommandName) -> Self {
        Self {
            name,
            args: String::new(),
            frame: None,
            options: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: impl Into<String>) -> Self {
        self.args = args.into();
        self
    }

    /// Targets a stack frame; 0 is the innermost.
    pub fn with_frame(mut self, frame: usize) -> Self {
        self.frame = Some(frame);
        self
    }

    pub fn with_option(mut self, option: impl Into<String>) -> Self {
        self.options.push(option.into());
        self
    }

    pub fn set_breakpoint(file: &str, line: u32) -> Self {
        Command::new(CommandName::SetBreakpoint).with_args(format!("{file} {line}"))
    }

    pub fn delete_breakpoint(file: &str, line: u32) -> Self {
        Command::new(CommandName::DeleteBreakpoint).with_args(format!("{file} {line}"))
    }

    pub fn name(&self) -> CommandName {
        self.name
    }

    pub fn args(&self) -> &str {
        &self.args
    }

    pub fn frame(&self) -> Option<usize> {
        self.frame
    }

    /// Renders the command as one newline-terminated line.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut line = String::from(self.name.as_str());
        if !self.args.is_empty() {
            line.push(' ');
            line.push_str(&self.args);
        }

        let options: Vec<String> = self
            .frame
            .map(|frame| format!("stack={frame}"))
            .into_iter()
            .chain(self.options.iter().cloned())
            .collect();
        if !options.is_empty() {
            line.push_str(" --{");
            line.push_str(&options.join("; "));
            line.push('}');
        }

        if line.contains(['\n', '\r']) {
            return Err(DebugError::Protocol(format!(
                "{} command must fit on a single line",
                self.name
            )));
        }
        line.push('\n');
        Ok(line.into_bytes())
    }
}

/// Response status, accepting both the numeric and the symbolic spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Running,
    Paused,
    Output,
    BadRequest,
    Error,
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::Running => 201,
            Status::Paused => 202,
            Status::Output => 204,
            Status::BadRequest => 400,
            Status::Error => 401,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::Running => "Running",
            Status::Paused => "Paused",
            Status::Output => "Output",
            Status::BadRequest => "Bad Request",
            Status::Error => "Error",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        Some(match token {
            "200" | "OK" => Status::Ok,
            "201" | "RUNNING" => Status::Running,
            "202" | "PAUSED" => Status::Paused,
            "204" | "OUTPUT" => Status::Output,
            "400" | "BAD" => Status::BadRequest,
            "401" | "ERR" | "ERROR" => Status::Error,
            _ => return None,
        })
    }

    pub fn is_error(self) -> bool {
        matches!(self, Status::BadRequest | Status::Error)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: Status,
    /// Decoded as UTF-8; invalid bytes become U+FFFD.
    pub body: String,
}

/// Where the debuggee stopped, as carried by a `PAUSED` body (`file line`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PauseLocation {
    pub file: String,
    pub line: u32,
}

impl PauseLocation {
    pub fn new(file: impl Into<String>, line: u32) -> Self {
        Self {
            file: file.into(),
            line,
        }
    }

    /// The line is the last token so file names may contain spaces.
    pub fn parse(body: &str) -> Result<Self> {
        let body = body.trim();
        let (file, line) = body
            .rsplit_once(char::is_whitespace)
            .ok_or_else(|| DebugError::Protocol(format!("malformed pause location {body:?}")))?;
        let line = line
            .parse()
            .map_err(|_| DebugError::Protocol(format!("malformed pause line in {body:?}")))?;
        Ok(Self::new(file.trim_end(), line))
    }
}

impl fmt::Display for PauseLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.file, self.line)
    }
}

/// Parses `<STATUS> [reason...] <LENGTH>`; the trailing newline is optional.
pub fn decode_header(line: &[u8]) -> Result<(Status, usize)> {
    let line = std::str::from_utf8(line)
        .map_err(|_| DebugError::Protocol("response header is not valid UTF-8".into()))?;
    let line = line.trim_end_matches(['\n', '\r']);
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let (Some(first), Some(last)) = (tokens.first(), tokens.last()) else {
        return Err(DebugError::Protocol("empty response header".into()));
    };
    if tokens.len() < 2 {
        return Err(DebugError::Protocol(format!(
            "response header {line:?} has no body length"
        )));
    }
    let status = Status::from_token(first)
        .ok_or_else(|| DebugError::Protocol(format!("unknown response status {first:?}")))?;
    let length = last
        .parse::<usize>()
        .map_err(|_| DebugError::Protocol(format!("invalid body length {last:?}")))?;
    Ok((status, length))
}

/// Frames a response the way the debuggee does. Used by the mock debuggee
/// and handy for tests.
pub fn encode_response(status: Status, body: &str) -> Vec<u8> {
    let mut out = format!("{} {} {}\n", status.code(), status.reason(), body.len()).into_bytes();
    out.extend_from_slice(body.as_bytes());
    out
}

pub async fn write_command<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> io::Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await
}

/// Reads length-delimited responses off the debuggee's stream.
pub struct ResponseReader<R> {
    inner: BufReader<R>,
    max_body_bytes: usize,
}

impl<R: AsyncRead + Unpin> ResponseReader<R> {
    pub fn new(reader: R, max_body_bytes: usize) -> Self {
        Self {
            inner: BufReader::new(reader),
            max_body_bytes,
        }
    }

    /// Reads one complete response.
    ///
    /// A clean end of stream before any header byte yields
    /// [`DebugError::ConnectionClosed`]; ending anywhere later is an
    /// unexpected EOF.
    pub async fn read_response(&mut self) -> Result<Response> {
        let mut line = Vec::with_capacity(64);
        let read = (&mut self.inner)
            .take(MAX_HEADER_LEN as u64)
            .read_until(b'\n', &mut line)
            .await?;
        if read == 0 {
            return Err(DebugError::ConnectionClosed);
        }
        if line.last() != Some(&b'\n') {
            if line.len() >= MAX_HEADER_LEN {
                return Err(DebugError::Protocol(format!(
                    "response header exceeds {MAX_HEADER_LEN} bytes"
                )));
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream ended inside a response header",
            )
            .into());
        }

        let (status, length) = decode_header(&line)?;
        if length > self.max_body_bytes {
            return Err(DebugError::Protocol(format!(
                "response body of {length} bytes exceeds the {} byte limit",
                self.max_body_bytes
            )));
        }

        let mut body = vec![0u8; length];
        self.inner.read_exact(&mut body).await.map_err(|err| {
            if err.kind() == io::ErrorKind::UnexpectedEof {
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("stream ended inside a {length} byte response body"),
                )
            } else {
                err
            }
        })?;

        Ok(Response {
            status,
            body: String::from_utf8_lossy(&body).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn encodes_frame_and_options() {
        let cmd = Command::new(CommandName::Exec)
            .with_args("return 1+1")
            .with_frame(2)
            .with_option("maxlevel=8");
        assert_eq!(
            String::from_utf8(cmd.encode().unwrap()).unwrap(),
            "EXEC return 1+1 --{stack=2; maxlevel=8}\n"
        );
        assert_eq!(Command::new(CommandName::Run).encode().unwrap(), b"RUN\n");
        assert_eq!(
            Command::set_breakpoint("scripts/main.lua", 42).encode().unwrap(),
            b"SETB scripts/main.lua 42\n"
        );
    }

    #[test]
    fn rejects_multi_line_arguments() {
        let err = Command::new(CommandName::Exec)
            .with_args("return 1\nreturn 2")
            .encode()
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Protocol);
    }

    #[test]
    fn decodes_numeric_and_symbolic_headers() {
        assert_eq!(decode_header(b"200 OK 5\n").unwrap(), (Status::Ok, 5));
        assert_eq!(decode_header(b"PAUSED 12").unwrap(), (Status::Paused, 12));
        assert_eq!(
            decode_header(b"401 Error in Execution 7\r\n").unwrap(),
            (Status::Error, 7)
        );
        assert_eq!(decode_header(b"ERR 0\n").unwrap(), (Status::Error, 0));
    }

    #[test]
    fn rejects_malformed_headers() {
        let headers: [&[u8]; 5] = [b"\n", b"200\n", b"999 OK 3\n", b"200 OK -1\n", b"200 OK x\n"];
        for header in headers {
            let err = decode_header(header).unwrap_err();
            assert_eq!(err.kind(), crate::ErrorKind::Protocol, "{header:?}");
        }
    }

    #[test]
    fn pause_location_allows_spaces_in_file() {
        assert_eq!(
            PauseLocation::parse("my game/main.lua 42\n").unwrap(),
            PauseLocation::new("my game/main.lua", 42)
        );
        assert!(PauseLocation::parse("main.lua").is_err());
        assert!(PauseLocation::parse("main.lua abc").is_err());
    }

    #[tokio::test]
    async fn reads_back_to_back_responses() {
        let mut bytes = encode_response(Status::Ok, "hello");
        bytes.extend(encode_response(Status::Paused, "main.lua 3"));
        bytes.extend(b"204 0\n");
        let mut reader = ResponseReader::new(&bytes[..], DEFAULT_MAX_BODY_BYTES);

        let first = reader.read_response().await.unwrap();
        assert_eq!(first.status, Status::Ok);
        assert_eq!(first.body, "hello");
        let second = reader.read_response().await.unwrap();
        assert_eq!(second.status, Status::Paused);
        assert_eq!(second.body, "main.lua 3");
        let third = reader.read_response().await.unwrap();
        assert_eq!(third.body, "");

        assert!(matches!(
            reader.read_response().await,
            Err(DebugError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn body_may_contain_newlines() {
        let bytes = encode_response(Status::Ok, "{\"a\\n\",\n\"b\"}");
        let mut reader = ResponseReader::new(&bytes[..], DEFAULT_MAX_BODY_BYTES);
        assert_eq!(reader.read_response().await.unwrap().body, "{\"a\\n\",\n\"b\"}");
    }

    #[tokio::test]
    async fn truncated_body_is_a_network_error() {
        let bytes = b"200 OK 10\nabc";
        let mut reader = ResponseReader::new(&bytes[..], DEFAULT_MAX_BODY_BYTES);
        let err = reader.read_response().await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Network);
    }

    #[tokio::test]
    async fn oversized_header_and_body_are_rejected() {
        let long = vec![b'2'; MAX_HEADER_LEN + 10];
        let mut reader = ResponseReader::new(&long[..], DEFAULT_MAX_BODY_BYTES);
        assert_eq!(
            reader.read_response().await.unwrap_err().kind(),
            crate::ErrorKind::Protocol
        );

        let bytes = b"200 OK 100\n";
        let mut reader = ResponseReader::new(&bytes[..], 10);
        assert_eq!(
            reader.read_response().await.unwrap_err().kind(),
            crate::ErrorKind::Protocol
        );
    }
}
