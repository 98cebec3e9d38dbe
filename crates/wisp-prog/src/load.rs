//! Incremental binary program loader.
//!
//! A mirror of [`Program::dump`], implemented as a byte-driven state
//! machine so callers can stream a serialized program in arbitrary
//! chunks. On reaching the terminator the loader runs the validator and
//! hands back the finished [`Program`].

use crate::program::{PcCmd, PcPos, Program, MAGIC, TERMINATOR};
use crate::validate::validate;
use wisp_util::{ValidateError, ValidateResult};

#[derive(Debug, Clone, Copy, PartialEq)]
enum LState {
    Magic { got: u8 },
    Header { field: usize },
    StrLen,
    StrBytes { len: usize },
    Keys,
    DbgLen,
    DbgBytes { len: usize },
    Pos,
    Cmd,
    Ops,
    Term,
    Done,
}

/// Streaming loader for serialized programs.
pub struct Loader {
    state: LState,
    buf: Vec<u8>,
    counts: [u32; 6],
    prog: Program,
}

impl Default for Loader {
    fn default() -> Self {
        Self::new()
    }
}

impl Loader {
    pub fn new() -> Self {
        Self {
            state: LState::Magic { got: 0 },
            buf: Vec::new(),
            counts: [0; 6],
            prog: Program::new(false),
        }
    }

    /// True once the terminator has been consumed and validation passed.
    pub fn is_done(&self) -> bool {
        self.state == LState::Done
    }

    /// Move to the next non-empty section after the current one.
    fn advance(&mut self, from: LState) -> LState {
        let order: [(LState, usize); 6] = [
            (LState::StrLen, 0),
            (LState::Keys, 1),
            (LState::DbgLen, 2),
            (LState::Pos, 3),
            (LState::Cmd, 4),
            (LState::Ops, 5),
        ];
        let start = match from {
            LState::Header { .. } => 0,
            LState::StrLen | LState::StrBytes { .. } => 1,
            LState::Keys => 2,
            LState::DbgLen | LState::DbgBytes { .. } => 3,
            LState::Pos => 4,
            LState::Cmd => 5,
            _ => 6,
        };
        for &(state, field) in &order[start..] {
            if self.counts[field] > 0 {
                return state;
            }
        }
        LState::Term
    }

    fn take_u32(&mut self) -> u32 {
        let v = u32::from_le_bytes(self.buf[..4].try_into().unwrap());
        self.buf.clear();
        v
    }

    /// Feed one byte.
    pub fn push(&mut self, byte: u8) -> ValidateResult<()> {
        match self.state {
            LState::Magic { got } => {
                if byte != MAGIC[got as usize] {
                    return Err(ValidateError::BadMagic);
                }
                self.state = if got as usize + 1 == MAGIC.len() {
                    LState::Header { field: 0 }
                } else {
                    LState::Magic { got: got + 1 }
                };
            }
            LState::Header { field } => {
                self.buf.push(byte);
                if self.buf.len() == 4 {
                    self.counts[field] = self.take_u32();
                    if field + 1 < 6 {
                        self.state = LState::Header { field: field + 1 };
                    } else {
                        self.prog.debug =
                            self.counts[2] > 0 || self.counts[3] > 0 || self.counts[4] > 0;
                        self.state = self.advance(LState::Header { field });
                    }
                }
            }
            LState::StrLen => {
                self.buf.push(byte);
                if self.buf.len() == 4 {
                    let len = self.take_u32() as usize;
                    if len == 0 {
                        self.prog.strings.push(Vec::new());
                        self.state = self.next_string_state();
                    } else {
                        self.state = LState::StrBytes { len };
                    }
                }
            }
            LState::StrBytes { len } => {
                self.buf.push(byte);
                if self.buf.len() == len {
                    self.prog.strings.push(std::mem::take(&mut self.buf));
                    self.state = self.next_string_state();
                }
            }
            LState::Keys => {
                self.buf.push(byte);
                if self.buf.len() == 8 {
                    let key = u64::from_le_bytes(self.buf[..8].try_into().unwrap());
                    self.buf.clear();
                    self.prog.keys.push(key);
                    if self.prog.keys.len() as u32 == self.counts[1] {
                        self.state = self.advance(LState::Keys);
                    }
                }
            }
            LState::DbgLen => {
                self.buf.push(byte);
                if self.buf.len() == 4 {
                    let len = self.take_u32() as usize;
                    if len == 0 {
                        self.prog.debug_strings.push(String::new());
                        self.state = self.next_debug_state();
                    } else {
                        self.state = LState::DbgBytes { len };
                    }
                }
            }
            LState::DbgBytes { len } => {
                self.buf.push(byte);
                if self.buf.len() == len {
                    let s = String::from_utf8_lossy(&self.buf).into_owned();
                    self.buf.clear();
                    self.prog.debug_strings.push(s);
                    self.state = self.next_debug_state();
                }
            }
            LState::Pos => {
                self.buf.push(byte);
                if self.buf.len() == 16 {
                    let get = |b: &[u8], i: usize| {
                        u32::from_le_bytes(b[i..i + 4].try_into().unwrap())
                    };
                    self.prog.pos_table.push(PcPos {
                        pc: get(&self.buf, 0),
                        line: get(&self.buf, 4),
                        chr: get(&self.buf, 8),
                        basefile: get(&self.buf, 12),
                    });
                    self.buf.clear();
                    if self.prog.pos_table.len() as u32 == self.counts[3] {
                        self.state = self.advance(LState::Pos);
                    }
                }
            }
            LState::Cmd => {
                self.buf.push(byte);
                if self.buf.len() == 8 {
                    let pc = u32::from_le_bytes(self.buf[0..4].try_into().unwrap());
                    let hint = u32::from_le_bytes(self.buf[4..8].try_into().unwrap());
                    self.buf.clear();
                    self.prog.cmd_table.push(PcCmd { pc, hint });
                    if self.prog.cmd_table.len() as u32 == self.counts[4] {
                        self.state = self.advance(LState::Cmd);
                    }
                }
            }
            LState::Ops => {
                self.prog.ops.push(byte);
                if self.prog.ops.len() as u32 == self.counts[5] {
                    self.state = LState::Term;
                }
            }
            LState::Term => {
                if byte != TERMINATOR {
                    return Err(ValidateError::MissingTerminator);
                }
                validate(&self.prog)?;
                self.state = LState::Done;
            }
            LState::Done => return Err(ValidateError::TrailingData),
        }
        Ok(())
    }

    fn next_string_state(&mut self) -> LState {
        if (self.prog.strings.len() as u32) < self.counts[0] {
            LState::StrLen
        } else {
            self.advance(LState::StrLen)
        }
    }

    fn next_debug_state(&mut self) -> LState {
        if (self.prog.debug_strings.len() as u32) < self.counts[2] {
            LState::DbgLen
        } else {
            self.advance(LState::DbgLen)
        }
    }

    /// Feed a whole buffer.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> ValidateResult<()> {
        for &b in bytes {
            self.push(b)?;
        }
        Ok(())
    }

    /// Take the finished program.
    pub fn finish(self) -> ValidateResult<Program> {
        if self.state == LState::Done {
            Ok(self.prog)
        } else {
            Err(ValidateError::Truncated)
        }
    }
}
