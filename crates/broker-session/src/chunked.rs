//! Chunked body boundary tracking
//!
//! Bytes are never decoded or altered. The framer only reports how many of
//! the bytes it is shown belong to the current message, so the relay knows
//! where the next request head begins.

use crate::SessionError;

/// Longest chunk-size or trailer line accepted
const MAX_LINE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Size,
    Extension,
    SizeLf,
    Data(u64),
    DataCr,
    DataLf,
    Trailer,
    Done,
}

#[derive(Debug)]
pub struct ChunkedFramer {
    state: State,
    size: u64,
    digits: usize,
    line_len: usize,
}

impl Default for ChunkedFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkedFramer {
    pub fn new() -> Self {
        Self {
            state: State::Size,
            size: 0,
            digits: 0,
            line_len: 0,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// Advance over `data`, returning how many bytes belong to this body
    ///
    /// Stops at the end of the body; bytes after that are left unconsumed.
    pub fn advance(&mut self, data: &[u8]) -> Result<usize, SessionError> {
        let mut pos = 0;

        while pos < data.len() && self.state != State::Done {
            if let State::Data(remaining) = self.state {
                let take = remaining.min((data.len() - pos) as u64);
                pos += take as usize;
                self.state = if take == remaining {
                    State::DataCr
                } else {
                    State::Data(remaining - take)
                };
                continue;
            }

            let byte = data[pos];
            pos += 1;
            self.step(byte)?;
        }

        Ok(pos)
    }

    fn step(&mut self, byte: u8) -> Result<(), SessionError> {
        self.line_len += 1;
        if self.line_len > MAX_LINE {
            return Err(malformed("chunk line too long"));
        }

        match self.state {
            State::Size => match byte {
                b'0'..=b'9' | b'a'..=b'f' | b'A'..=b'F' => {
                    let digit = (byte as char).to_digit(16).unwrap_or(0) as u64;
                    self.size = self
                        .size
                        .checked_mul(16)
                        .and_then(|s| s.checked_add(digit))
                        .ok_or_else(|| malformed("chunk size overflow"))?;
                    self.digits += 1;
                }
                b';' | b' ' | b'\t' => self.state = State::Extension,
                b'\r' => self.state = State::SizeLf,
                b'\n' => self.end_size_line()?,
                _ => return Err(malformed("invalid chunk size")),
            },
            State::Extension => match byte {
                b'\r' => self.state = State::SizeLf,
                b'\n' => self.end_size_line()?,
                _ => {}
            },
            State::SizeLf => match byte {
                b'\n' => self.end_size_line()?,
                _ => return Err(malformed("expected LF after chunk size")),
            },
            State::DataCr => match byte {
                b'\r' => self.state = State::DataLf,
                b'\n' => self.start_line(State::Size),
                _ => return Err(malformed("missing CRLF after chunk data")),
            },
            State::DataLf => match byte {
                b'\n' => self.start_line(State::Size),
                _ => return Err(malformed("missing LF after chunk data")),
            },
            State::Trailer => match byte {
                b'\r' => self.line_len -= 1,
                b'\n' => {
                    // line_len counts this LF, so 1 means an empty line
                    if self.line_len == 1 {
                        self.state = State::Done;
                    }
                    self.line_len = 0;
                }
                _ => {}
            },
            State::Data(_) | State::Done => {}
        }

        Ok(())
    }

    fn end_size_line(&mut self) -> Result<(), SessionError> {
        if self.digits == 0 {
            return Err(malformed("empty chunk size"));
        }

        let size = self.size;
        self.size = 0;
        self.digits = 0;

        if size == 0 {
            self.start_line(State::Trailer);
        } else {
            self.start_line(State::Data(size));
        }
        Ok(())
    }

    fn start_line(&mut self, state: State) {
        self.state = state;
        self.line_len = 0;
    }
}

fn malformed(reason: &str) -> SessionError {
    SessionError::Protocol(format!("malformed chunked body: {reason}"))
}
