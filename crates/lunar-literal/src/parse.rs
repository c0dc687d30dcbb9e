use thiserror::Error;

use crate::value::{Key, Number, Table, Value, KEYWORDS};

/// Table nesting accepted by [`parse`].
pub const DEFAULT_MAX_DEPTH: usize = 64;

#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("malformed literal at byte {offset}: {message}")]
pub struct LiteralError {
    pub offset: usize,
    pub message: String,
}

type Result<T> = std::result::Result<T, LiteralError>;

/// Parse a single literal value, allowing tables nested up to
/// [`DEFAULT_MAX_DEPTH`] levels.
pub fn parse(text: &str) -> Result<Value> {
    parse_with_depth(text, DEFAULT_MAX_DEPTH)
}

/// Parse a single literal value. A table nested deeper than `max_depth` is
/// rejected (`max_depth = 0` forbids tables altogether).
///
/// The whole input must be consumed: trailing tokens other than whitespace and
/// comments are an error, so a truncated or concatenated body never yields a
/// partial value.
pub fn parse_with_depth(text: &str, max_depth: usize) -> Result<Value> {
    let mut parser = Parser {
        src: text.as_bytes(),
        pos: 0,
        depth: 0,
        max_depth,
    };
    let value = parser.value()?;
    parser.skip_trivia()?;
    if parser.pos != parser.src.len() {
        return Err(parser.error("unexpected trailing input"));
    }
    Ok(value)
}

struct Parser<'a> {
    src: &'a [u8],
    pos: usize,
    depth: usize,
    max_depth: usize,
}

impl<'a> Parser<'a> {
    fn error(&self, message: impl Into<String>) -> LiteralError {
        LiteralError {
            offset: self.pos,
            message: message.into(),
        }
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.src.get(self.pos + offset).copied()
    }

    fn rest(&self) -> &'a [u8] {
        &self.src[self.pos..]
    }

    fn expect(&mut self, byte: u8) -> Result<()> {
        self.skip_trivia()?;
        match self.peek() {
            Some(b) if b == byte => {
                self.pos += 1;
                Ok(())
            }
            Some(b) => Err(self.error(format!(
                "expected '{}', found '{}'",
                byte as char, b as char
            ))),
            None => Err(self.error(format!("expected '{}', found end of input", byte as char))),
        }
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\r' | b'\n' | b'\x0B' | b'\x0C')) {
            self.pos += 1;
        }
    }

    /// Skips whitespace and comments.
    fn skip_trivia(&mut self) -> Result<()> {
        loop {
            self.skip_whitespace();
            if !self.rest().starts_with(b"--") {
                return Ok(());
            }
            self.pos += 2;
            if self.peek() == Some(b'[') && self.long_bracket()?.is_some() {
                continue;
            }
            while !matches!(self.peek(), None | Some(b'\n')) {
                self.pos += 1;
            }
        }
    }

    /// Reads a long bracket (`[[...]]`, `[==[...]==]`) starting at the current
    /// `[`. Returns `None` without consuming anything when the `[` does not
    /// open a long bracket.
    fn long_bracket(&mut self) -> Result<Option<&'a [u8]>> {
        let start = self.pos;
        let mut level = 0usize;
        while self.peek_at(1 + level) == Some(b'=') {
            level += 1;
        }
        if self.peek_at(1 + level) != Some(b'[') {
            return Ok(None);
        }
        self.pos += level + 2;

        // A newline directly after the opening bracket is not part of the content.
        if self.rest().starts_with(b"\r\n") {
            self.pos += 2;
        } else if matches!(self.peek(), Some(b'\n' | b'\r')) {
            self.pos += 1;
        }

        let content_start = self.pos;
        while let Some(b) = self.peek() {
            if b == b']'
                && self.src[self.pos + 1..]
                    .iter()
                    .take(level)
                    .all(|&c| c == b'=')
                && self.peek_at(1 + level) == Some(b']')
            {
                let content = &self.src[content_start..self.pos];
                self.pos += level + 2;
                return Ok(Some(content));
            }
            self.pos += 1;
        }

        self.pos = start;
        Err(self.error("unterminated long bracket"))
    }

    fn value(&mut self) -> Result<Value> {
        self.skip_trivia()?;
        match self.peek() {
            None => Err(self.error("unexpected end of input")),
            Some(b'{') => self.table(),
            Some(q @ (b'"' | b'\'')) => self.short_string(q).map(Value::String),
            Some(b'[') => match self.long_bracket()? {
                Some(content) => Ok(Value::String(bytes_to_string(content.to_vec()))),
                None => Err(self.error("unexpected '['")),
            },
            Some(b'-') => {
                self.pos += 1;
                self.skip_trivia()?;
                if self.peek_name() == Some("math") {
                    return self.math_huge().map(|n| Value::Number(n.negate()));
                }
                match self.peek() {
                    Some(b) if is_number_start(b, self.peek_at(1)) => {
                        self.number().map(|n| Value::Number(n.negate()))
                    }
                    _ => Err(self.error("unary minus is only allowed before a number")),
                }
            }
            Some(b) if is_number_start(b, self.peek_at(1)) => {
                if self.rest().starts_with(b"0/0") && !self.peek_at(3).is_some_and(is_name_char) {
                    self.pos += 3;
                    return Ok(Value::Number(Number::Float(f64::NAN)));
                }
                self.number().map(Value::Number)
            }
            Some(b) if is_name_start(b) => self.name_value(),
            Some(b) => Err(self.error(format!("unexpected character '{}'", b as char))),
        }
    }

    fn peek_name(&self) -> Option<&'a str> {
        let rest = self.rest();
        if !rest.first().copied().is_some_and(is_name_start) {
            return None;
        }
        let len = rest.iter().take_while(|&&b| is_name_char(b)).count();
        std::str::from_utf8(&rest[..len]).ok()
    }

    fn name(&mut self) -> Result<&'a str> {
        match self.peek_name() {
            Some(name) => {
                self.pos += name.len();
                Ok(name)
            }
            None => Err(self.error("expected a name")),
        }
    }

    fn name_value(&mut self) -> Result<Value> {
        let start = self.pos;
        let name = self.name()?;
        match name {
            "nil" => self.nil_or_reference(),
            "true" => Ok(Value::Boolean(true)),
            "false" => Ok(Value::Boolean(false)),
            "math" => {
                self.pos = start;
                self.math_huge().map(Value::Number)
            }
            "function" => self.function_placeholder(),
            other => {
                self.pos = start;
                Err(self.error(format!(
                    "`{other}` is not a literal; names, calls and expressions are rejected"
                )))
            }
        }
    }

    /// `nil` optionally followed by a `--[[ref label]]` marker that serializers
    /// emit in place of an already-visited table.
    fn nil_or_reference(&mut self) -> Result<Value> {
        let after_nil = self.pos;
        self.skip_whitespace();
        if self.rest().starts_with(b"--[") {
            self.pos += 2;
            if let Some(content) = self.long_bracket()? {
                let text = String::from_utf8_lossy(content);
                let text = text.trim();
                if let Some(label) = text.strip_prefix("ref") {
                    if label.is_empty() || label.starts_with(char::is_whitespace) {
                        return Ok(Value::Reference(label.trim().to_string()));
                    }
                }
                return Ok(Value::Nil);
            }
        }
        self.pos = after_nil;
        Ok(Value::Nil)
    }

    fn math_huge(&mut self) -> Result<Number> {
        if self.rest().starts_with(b"math.huge") && !self.peek_at(9).is_some_and(is_name_char) {
            self.pos += "math.huge".len();
            Ok(Number::Float(f64::INFINITY))
        } else {
            Err(self.error("only `math.huge` is accepted from the math library"))
        }
    }

    /// `function() --[[..skipped..]] end`: the shape serializers use when
    /// function bodies are not dumped. Any real function body is rejected.
    fn function_placeholder(&mut self) -> Result<Value> {
        self.expect(b'(')?;
        self.expect(b')')?;
        self.skip_trivia()?;
        match self.peek_name() {
            Some("end") => {
                self.pos += 3;
                Ok(Value::Function)
            }
            _ => Err(self.error("function bodies are not literals")),
        }
    }

    fn table(&mut self) -> Result<Value> {
        if self.depth >= self.max_depth {
            return Err(self.error(format!(
                "table nesting exceeds the maximum depth of {}",
                self.max_depth
            )));
        }
        self.depth += 1;
        self.pos += 1; // '{'

        let mut table = Table::new();
        let mut next_position = 1i64;
        loop {
            self.skip_trivia()?;
            if self.peek() == Some(b'}') {
                self.pos += 1;
                break;
            }

            if let Some((key, value)) = self.keyed_entry()? {
                table.insert(key, value);
            } else {
                let value = self.value()?;
                table.insert(Key::Integer(next_position), value);
                next_position += 1;
            }

            self.skip_trivia()?;
            match self.peek() {
                Some(b',' | b';') => self.pos += 1,
                Some(b'}') => {
                    self.pos += 1;
                    break;
                }
                Some(b) => {
                    return Err(self.error(format!(
                        "expected ',' or '}}' in table, found '{}'",
                        b as char
                    )))
                }
                None => return Err(self.error("unterminated table")),
            }
        }

        self.depth -= 1;
        Ok(Value::Table(table))
    }

    /// Parses `[k] = v` or `name = v`. Returns `None` (consuming nothing) when
    /// the next entry is positional.
    fn keyed_entry(&mut self) -> Result<Option<(Key, Value)>> {
        let start = self.pos;

        if self.peek() == Some(b'[') && !matches!(self.peek_at(1), Some(b'[' | b'=')) {
            self.pos += 1;
            let key_offset = self.pos;
            let key = self.value()?;
            self.expect(b']')?;
            self.expect(b'=')?;
            let value = self.value()?;
            let key = Key::from_value(key).ok_or(LiteralError {
                offset: key_offset,
                message: "invalid table key".to_string(),
            })?;
            return Ok(Some((key, value)));
        }

        let Some(name) = self.peek_name() else {
            return Ok(None);
        };
        self.pos += name.len();
        self.skip_trivia()?;
        if self.peek() != Some(b'=') || self.peek_at(1) == Some(b'=') {
            self.pos = start;
            return Ok(None);
        }
        if KEYWORDS.contains(&name) {
            self.pos = start;
            return Err(self.error(format!("reserved word `{name}` cannot be a field name")));
        }
        self.pos += 1;
        let value = self.value()?;
        Ok(Some((Key::String(name.to_string()), value)))
    }

    fn number(&mut self) -> Result<Number> {
        let start = self.pos;
        let rest = self.rest();
        let is_hex = rest.len() > 1 && rest[0] == b'0' && matches!(rest[1], b'x' | b'X');

        let number = if is_hex {
            self.pos += 2;
            self.hex_number(start)?
        } else {
            let mut is_float = false;
            while let Some(b) = self.peek() {
                match b {
                    b'0'..=b'9' => self.pos += 1,
                    b'.' => {
                        is_float = true;
                        self.pos += 1;
                    }
                    b'e' | b'E' => {
                        is_float = true;
                        self.pos += 1;
                        if matches!(self.peek(), Some(b'+' | b'-')) {
                            self.pos += 1;
                        }
                    }
                    _ => break,
                }
            }
            let text = std::str::from_utf8(&self.src[start..self.pos])
                .map_err(|_| self.error("invalid number"))?;
            if is_float {
                Number::Float(text.parse::<f64>().map_err(|_| LiteralError {
                    offset: start,
                    message: format!("invalid number `{text}`"),
                })?)
            } else {
                match text.parse::<i64>() {
                    Ok(v) => Number::Integer(v),
                    // Decimal integers that do not fit become floats.
                    Err(_) => Number::Float(text.parse::<f64>().map_err(|_| LiteralError {
                        offset: start,
                        message: format!("invalid number `{text}`"),
                    })?),
                }
            }
        };

        if self.peek().is_some_and(is_name_char) {
            return Err(self.error("malformed number"));
        }
        Ok(number)
    }

    fn hex_number(&mut self, start: usize) -> Result<Number> {
        let mut int_value = 0u64;
        let mut mantissa = 0f64;
        let mut exponent = 0i64;
        let mut digits = 0usize;
        let mut is_float = false;
        let mut seen_dot = false;

        while let Some(b) = self.peek() {
            if let Some(d) = (b as char).to_digit(16) {
                int_value = int_value.wrapping_mul(16).wrapping_add(d.into());
                mantissa = mantissa * 16.0 + f64::from(d);
                if seen_dot {
                    exponent -= 4;
                }
                digits += 1;
                self.pos += 1;
            } else if b == b'.' && !seen_dot {
                seen_dot = true;
                is_float = true;
                self.pos += 1;
            } else {
                break;
            }
        }
        if digits == 0 {
            return Err(LiteralError {
                offset: start,
                message: "hexadecimal number without digits".to_string(),
            });
        }

        if matches!(self.peek(), Some(b'p' | b'P')) {
            is_float = true;
            self.pos += 1;
            let negative = match self.peek() {
                Some(b'-') => {
                    self.pos += 1;
                    true
                }
                Some(b'+') => {
                    self.pos += 1;
                    false
                }
                _ => false,
            };
            let exp_start = self.pos;
            while self.peek().is_some_and(|b| b.is_ascii_digit()) {
                self.pos += 1;
            }
            let text = std::str::from_utf8(&self.src[exp_start..self.pos]).unwrap_or_default();
            let value: i64 = text
                .parse()
                .map_err(|_| self.error("malformed hexadecimal exponent"))?;
            exponent += if negative { -value } else { value };
        }

        if is_float {
            let exponent = exponent.clamp(i32::MIN.into(), i32::MAX.into()) as i32;
            Ok(Number::Float(mantissa * 2f64.powi(exponent)))
        } else {
            // Lua wraps hexadecimal integer literals modulo 2^64.
            Ok(Number::Integer(int_value as i64))
        }
    }

    fn short_string(&mut self, quote: u8) -> Result<String> {
        self.pos += 1;
        let mut out = Vec::new();
        loop {
            let Some(b) = self.peek() else {
                return Err(self.error("unterminated string"));
            };
            self.pos += 1;
            match b {
                b if b == quote => break,
                b'\n' | b'\r' => return Err(self.error("unfinished string")),
                b'\\' => self.escape(&mut out)?,
                b => out.push(b),
            }
        }
        Ok(bytes_to_string(out))
    }

    fn escape(&mut self, out: &mut Vec<u8>) -> Result<()> {
        let Some(b) = self.peek() else {
            return Err(self.error("unterminated string"));
        };
        self.pos += 1;
        match b {
            b'a' => out.push(0x07),
            b'b' => out.push(0x08),
            b'f' => out.push(0x0C),
            b'n' => out.push(b'\n'),
            b'r' => out.push(b'\r'),
            b't' => out.push(b'\t'),
            b'v' => out.push(0x0B),
            b'\\' | b'"' | b'\'' => out.push(b),
            b'\n' | b'\r' => {
                out.push(b'\n');
                // `\` followed by CRLF or LFCR is a single line break.
                if matches!(self.peek(), Some(next @ (b'\n' | b'\r')) if next != b) {
                    self.pos += 1;
                }
            }
            b'z' => self.skip_whitespace(),
            b'x' => {
                let hi = self.peek().and_then(|c| (c as char).to_digit(16));
                let lo = self.peek_at(1).and_then(|c| (c as char).to_digit(16));
                match (hi, lo) {
                    (Some(hi), Some(lo)) => {
                        self.pos += 2;
                        out.push((hi * 16 + lo) as u8);
                    }
                    _ => return Err(self.error("\\x must be followed by two hex digits")),
                }
            }
            b'0'..=b'9' => {
                let mut value = u32::from(b - b'0');
                for _ in 0..2 {
                    match self.peek() {
                        Some(d @ b'0'..=b'9') => {
                            value = value * 10 + u32::from(d - b'0');
                            self.pos += 1;
                        }
                        _ => break,
                    }
                }
                let byte = u8::try_from(value).map_err(|_| self.error("decimal escape too large"))?;
                out.push(byte);
            }
            b'u' => {
                if self.peek() != Some(b'{') {
                    return Err(self.error("missing '{' in \\u{XXXX}"));
                }
                self.pos += 1;
                let mut code = 0u32;
                let mut digits = 0usize;
                while let Some(d) = self.peek().and_then(|c| (c as char).to_digit(16)) {
                    code = code
                        .checked_mul(16)
                        .and_then(|c| c.checked_add(d))
                        .ok_or_else(|| self.error("UTF-8 value too large"))?;
                    digits += 1;
                    self.pos += 1;
                }
                if digits == 0 || self.peek() != Some(b'}') {
                    return Err(self.error("malformed \\u{XXXX} escape"));
                }
                self.pos += 1;
                let ch = char::from_u32(code).ok_or_else(|| self.error("invalid code point"))?;
                let mut buf = [0u8; 4];
                out.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
            }
            other => {
                return Err(self.error(format!("invalid escape sequence '\\{}'", other as char)))
            }
        }
        Ok(())
    }
}

fn is_name_start(b: u8) -> bool {
    b == b'_' || b.is_ascii_alphabetic()
}

fn is_name_char(b: u8) -> bool {
    b == b'_' || b.is_ascii_alphanumeric()
}

fn is_number_start(b: u8, next: Option<u8>) -> bool {
    b.is_ascii_digit() || (b == b'.' && next.is_some_and(|n| n.is_ascii_digit()))
}

/// Lua strings are byte strings; anything that is not UTF-8 is decoded lossily.
fn bytes_to_string(bytes: Vec<u8>) -> String {
    match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(err) => String::from_utf8_lossy(err.as_bytes()).into_owned(),
    }
}
