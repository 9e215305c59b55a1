//! Minimal line discipline for SSH channels.
//!
//! SSH clients with a pty send raw keystrokes and expect the server to echo
//! them. `LineEditor` turns that byte stream into complete lines plus the
//! bytes to echo back.

const CTRL_C: u8 = 0x03;
const CTRL_D: u8 = 0x04;
const BACKSPACE: u8 = 0x08;
const CTRL_U: u8 = 0x15;
const ESC: u8 = 0x1b;
const DEL: u8 = 0x7f;

/// Something the reader of a line editor should act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Line(String),
    Eof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Escape {
    None,
    Start,
    Csi,
    Ss3,
}

#[derive(Debug)]
pub struct LineEditor {
    line: Vec<u8>,
    escape: Escape,
    after_cr: bool,
}

/// Result of feeding bytes to a [`LineEditor`].
#[derive(Debug, Default)]
pub struct Feed {
    pub echo: Vec<u8>,
    pub inputs: Vec<Input>,
}

impl LineEditor {
    pub fn new() -> Self {
        Self {
            line: Vec::new(),
            escape: Escape::None,
            after_cr: false,
        }
    }

    pub fn feed(&mut self, data: &[u8]) -> Feed {
        let mut feed = Feed::default();
        for &b in data {
            if self.skip_escape(b) {
                continue;
            }
            let after_cr = std::mem::replace(&mut self.after_cr, false);
            match b {
                b'\r' => {
                    self.after_cr = true;
                    self.enter(&mut feed);
                }
                b'\n' if after_cr => {}
                b'\n' => self.enter(&mut feed),
                BACKSPACE | DEL => {
                    if self.pop_char() {
                        feed.echo.extend_from_slice(b"\x08 \x08");
                    }
                }
                CTRL_U => {
                    while self.pop_char() {
                        feed.echo.extend_from_slice(b"\x08 \x08");
                    }
                }
                CTRL_C => {
                    self.line.clear();
                    feed.echo.extend_from_slice(b"^C\r\n");
                    feed.inputs.push(Input::Eof);
                }
                CTRL_D if self.line.is_empty() => feed.inputs.push(Input::Eof),
                ESC => self.escape = Escape::Start,
                b if b < 0x20 => {}
                b => {
                    self.line.push(b);
                    feed.echo.push(b);
                }
            }
        }
        feed
    }

    /// Returns true while `b` belongs to an escape sequence.
    fn skip_escape(&mut self, b: u8) -> bool {
        self.escape = match (self.escape, b) {
            (Escape::None, _) => return false,
            (Escape::Start, b'[') => Escape::Csi,
            (Escape::Start, b'O') => Escape::Ss3,
            (Escape::Csi, 0x20..=0x3f) => Escape::Csi,
            _ => Escape::None,
        };
        true
    }

    fn enter(&mut self, feed: &mut Feed) {
        let line = String::from_utf8_lossy(&self.line).into_owned();
        self.line.clear();
        feed.echo.extend_from_slice(b"\r\n");
        feed.inputs.push(Input::Line(line));
    }

    fn pop_char(&mut self) -> bool {
        let Some(mut b) = self.line.pop() else {
            return false;
        };
        while b & 0xc0 == 0x80 {
            match self.line.pop() {
                Some(prev) => b = prev,
                None => break,
            }
        }
        true
    }
}

impl Default for LineEditor {
    fn default() -> Self {
        Self::new()
    }
}

/// Translate `\n` to `\r\n` for a terminal in raw mode.
pub fn crlf(buf: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(buf.len() + 8);
    for &b in buf {
        if b == b'\n' {
            out.push(b'\r');
        }
        out.push(b);
    }
    out
}
