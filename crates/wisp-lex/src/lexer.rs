//! The lexer: a character-driven finite state machine.
//!
//! Bytes are fed in one at a time with [`Lexer::push`]; completed tokens
//! are appended to the caller's output vector. Feeding the same source in
//! any chunking pattern produces the same token stream, which is what lets
//! the compiler's write entry point accept arbitrary slices.
//!
//! Two quirks deserve a note:
//!
//! - Prefix `+`/`-` are resolved here, not in the parser. The lexer keeps a
//!   four-byte lookbehind buffer; a sign preceded by whitespace and followed
//!   by a non-space is unary (`say -1` negates), while `x-1` and `x - 1`
//!   subtract.
//! - Interpolated strings are lowered during lexing. `"a${x}b"` comes out
//!   as the token run `( "a" ~ x ~ "b" )`, so the parser only ever sees
//!   plain concatenation.

use crate::number::NumBuilder;
use crate::token::{keyword, KeySym, Lexed, Token};
use wisp_util::{FileId, Pos};

#[derive(Debug, Clone, PartialEq)]
enum State {
    Start,
    Backslash,
    LineComment,
    BlockComment { star: bool },
    Slash,
    Ident,
    NumZero,
    Num,
    Sign { ch: u8, space_before: bool, prev_expr: bool },
    Dot { count: u8 },
    Op { ch: u8 },
    Op2 { ch: u8 },
    Str1,
    Str1Quote,
    Str2,
    Str2Esc,
    Str2EscHex { digits: u8, accum: u8 },
    Str2Dollar,
    Str2Ident,
}

/// One `${...}` splice in flight. Brace depth is tracked per level so the
/// spliced expression may itself contain braces.
#[derive(Debug, Clone)]
struct Splice {
    depth: u32,
}

/// Incremental lexer.
pub struct Lexer {
    state: State,
    file: FileId,
    line: u32,
    chr: u32,
    tok_pos: Pos,
    /// Rolling buffer of the last four raw bytes, newest last.
    behind: [u8; 4],
    /// Whether the previously emitted token can end an expression.
    prev_ends_expr: bool,
    /// Open `(`/`[`/`{` count; newlines inside are soft.
    bracket_depth: u32,
    /// Identifier accumulator.
    ident: String,
    /// String piece accumulator.
    sbuf: Vec<u8>,
    /// Numeric literal accumulator.
    num: Option<NumBuilder>,
    /// Active `${...}` splices, innermost last.
    splices: Vec<Splice>,
}

impl Lexer {
    pub fn new(file: FileId, start_line: u32) -> Self {
        Self {
            state: State::Start,
            file,
            line: start_line.max(1),
            chr: 1,
            tok_pos: Pos::new(file, start_line.max(1), 1),
            behind: [b' '; 4],
            prev_ends_expr: false,
            bracket_depth: 0,
            ident: String::new(),
            sbuf: Vec::new(),
            num: None,
            splices: Vec::new(),
        }
    }

    /// Current position (of the next byte to be fed).
    pub fn pos(&self) -> Pos {
        Pos::new(self.file, self.line, self.chr)
    }

    /// Reposition the line counter; the compiler's write entry point uses
    /// this when the host supplies a starting line.
    pub fn set_line(&mut self, line: u32) {
        self.line = line.max(1);
        self.chr = 1;
    }

    fn emit(&mut self, tok: Token, pos: Pos, out: &mut Vec<Lexed>) {
        match &tok {
            Token::Key(KeySym::LParen | KeySym::LBracket | KeySym::LBrace) => {
                self.bracket_depth += 1;
            }
            Token::Key(KeySym::RParen | KeySym::RBracket | KeySym::RBrace) => {
                self.bracket_depth = self.bracket_depth.saturating_sub(1);
            }
            _ => {}
        }
        self.prev_ends_expr = tok.ends_expr();
        out.push((tok, pos));
    }

    fn emit_here(&mut self, tok: Token, out: &mut Vec<Lexed>) {
        let pos = self.tok_pos;
        self.emit(tok, pos, out);
    }

    /// The byte just before the current one, for sign disambiguation.
    fn byte_behind(&self) -> u8 {
        self.behind[3]
    }

    fn flush_ident(&mut self, out: &mut Vec<Lexed>) {
        let name = std::mem::take(&mut self.ident);
        let tok = match keyword(&name) {
            Some(ks) => Token::Key(ks),
            None => Token::Ident(name),
        };
        self.emit_here(tok, out);
    }

    fn flush_num(&mut self, out: &mut Vec<Lexed>) {
        let nb = self.num.take().expect("number state without builder");
        if nb.is_complete() {
            self.emit_here(Token::Num(nb.finish()), out);
        } else {
            self.emit_here(Token::Error("invalid number".to_string()), out);
        }
    }

    /// Feed one source byte.
    pub fn push(&mut self, byte: u8, out: &mut Vec<Lexed>) {
        self.step(byte, out);
        self.behind = [self.behind[1], self.behind[2], self.behind[3], byte];
        if byte == b'\n' {
            self.line += 1;
            self.chr = 1;
        } else {
            self.chr += 1;
        }
    }

    /// Feed a whole buffer.
    pub fn push_bytes(&mut self, bytes: &[u8], out: &mut Vec<Lexed>) {
        for &b in bytes {
            self.push(b, out);
        }
    }

    fn step(&mut self, byte: u8, out: &mut Vec<Lexed>) {
        // A state may consume the byte or finish a token and reprocess it;
        // the loop runs until some state consumes.
        let mut byte = byte;
        loop {
            match self.state.clone() {
                State::Start => {
                    self.tok_pos = self.pos();
                    match byte {
                        b' ' | b'\t' | b'\r' => {}
                        b'\n' => {
                            let soft = self.bracket_depth > 0 || !self.splices.is_empty();
                            self.emit_here(Token::Newline { soft }, out);
                        }
                        b';' => self.emit_here(Token::Newline { soft: false }, out),
                        b'#' => self.state = State::LineComment,
                        b'/' => self.state = State::Slash,
                        b'\\' => self.state = State::Backslash,
                        b'\'' => {
                            self.sbuf.clear();
                            self.state = State::Str1;
                        }
                        b'"' => {
                            self.emit_here(Token::Key(KeySym::LParen), out);
                            self.sbuf.clear();
                            self.state = State::Str2;
                        }
                        b'+' | b'-' => {
                            self.state = State::Sign {
                                ch: byte,
                                space_before: matches!(self.byte_behind(), b' ' | b'\t' | b'\n' | b'\r'),
                                prev_expr: self.prev_ends_expr,
                            };
                        }
                        b'.' => self.state = State::Dot { count: 1 },
                        b'0' => {
                            self.state = State::NumZero;
                        }
                        b'1'..=b'9' => {
                            self.num = Some(NumBuilder::new((byte - b'0') as u32));
                            self.state = State::Num;
                        }
                        b'a'..=b'z' | b'A'..=b'Z' | b'_' => {
                            self.ident.clear();
                            self.ident.push(byte as char);
                            self.state = State::Ident;
                        }
                        b'<' | b'>' | b'!' | b'=' | b'%' | b'*' | b'^' | b'~' | b'&' | b'|' => {
                            self.state = State::Op { ch: byte };
                        }
                        b'(' => self.emit_here(Token::Key(KeySym::LParen), out),
                        b')' => self.emit_here(Token::Key(KeySym::RParen), out),
                        b'[' => self.emit_here(Token::Key(KeySym::LBracket), out),
                        b']' => self.emit_here(Token::Key(KeySym::RBracket), out),
                        b'{' => {
                            if let Some(sp) = self.splices.last_mut() {
                                sp.depth += 1;
                            }
                            self.emit_here(Token::Key(KeySym::LBrace), out);
                        }
                        b'}' => {
                            if let Some(sp) = self.splices.last_mut() {
                                if sp.depth == 0 {
                                    // End of `${...}`: back into the string.
                                    self.splices.pop();
                                    self.emit_here(Token::Key(KeySym::Tilde), out);
                                    self.sbuf.clear();
                                    self.state = State::Str2;
                                    return;
                                }
                                sp.depth -= 1;
                            }
                            self.emit_here(Token::Key(KeySym::RBrace), out);
                        }
                        b':' => self.emit_here(Token::Key(KeySym::Colon), out),
                        b',' => self.emit_here(Token::Key(KeySym::Comma), out),
                        _ => {
                            self.emit_here(
                                Token::Error(format!("unexpected character 0x{:02X}", byte)),
                                out,
                            );
                        }
                    }
                    return;
                }
                State::Backslash => {
                    match byte {
                        b' ' | b'\t' | b'\r' => {}
                        b'\n' => self.state = State::Start,
                        _ => {
                            self.emit_here(
                                Token::Error("invalid character after line continuation".to_string()),
                                out,
                            );
                            self.state = State::Start;
                            continue;
                        }
                    }
                    return;
                }
                State::LineComment => {
                    if byte == b'\n' {
                        self.state = State::Start;
                        continue;
                    }
                    return;
                }
                State::BlockComment { star } => {
                    // No nesting: the first `*/` closes the comment.
                    self.state = match byte {
                        b'*' => State::BlockComment { star: true },
                        b'/' if star => State::Start,
                        _ => State::BlockComment { star: false },
                    };
                    return;
                }
                State::Slash => match byte {
                    b'*' => {
                        self.state = State::BlockComment { star: false };
                        return;
                    }
                    b'=' => {
                        self.emit_here(Token::Key(KeySym::SlashEqu), out);
                        self.state = State::Start;
                        return;
                    }
                    _ => {
                        self.emit_here(Token::Key(KeySym::Slash), out);
                        self.state = State::Start;
                        continue;
                    }
                },
                State::Ident => match byte {
                    b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'_' => {
                        self.ident.push(byte as char);
                        return;
                    }
                    _ => {
                        self.flush_ident(out);
                        self.state = State::Start;
                        continue;
                    }
                },
                State::NumZero => match byte {
                    b'b' => {
                        self.num = Some(NumBuilder::with_base(2));
                        self.state = State::Num;
                        return;
                    }
                    b'c' => {
                        self.num = Some(NumBuilder::with_base(8));
                        self.state = State::Num;
                        return;
                    }
                    b'x' => {
                        self.num = Some(NumBuilder::with_base(16));
                        self.state = State::Num;
                        return;
                    }
                    _ => {
                        self.num = Some(NumBuilder::new(0));
                        self.state = State::Num;
                        continue;
                    }
                },
                State::Num => {
                    let nb = self.num.as_mut().expect("number state without builder");
                    if nb.push(byte) {
                        return;
                    }
                    if byte.is_ascii_alphanumeric() || byte == b'.' {
                        // `12abc`, `1.2.3` and friends: swallow the byte.
                        self.num = None;
                        self.emit_here(Token::Error("invalid number".to_string()), out);
                        self.state = State::Start;
                        return;
                    }
                    self.flush_num(out);
                    self.state = State::Start;
                    continue;
                }
                State::Sign { ch, space_before, prev_expr } => {
                    if byte == b'=' {
                        let ks = if ch == b'+' { KeySym::PlusEqu } else { KeySym::MinusEqu };
                        self.emit_here(Token::Key(ks), out);
                        self.state = State::Start;
                        return;
                    }
                    let space_after = matches!(byte, b' ' | b'\t' | b'\n' | b'\r');
                    let unary = !prev_expr || (space_before && !space_after);
                    let ks = match (ch, unary) {
                        (b'+', true) => KeySym::UnPlus,
                        (b'+', false) => KeySym::Plus,
                        (b'-', true) => KeySym::UnMinus,
                        _ => KeySym::Minus,
                    };
                    self.emit_here(Token::Key(ks), out);
                    self.state = State::Start;
                    continue;
                }
                State::Dot { count } => match (count, byte) {
                    (1, b'.') => {
                        self.state = State::Dot { count: 2 };
                        return;
                    }
                    (2, b'.') => {
                        self.emit_here(Token::Key(KeySym::Period3), out);
                        self.state = State::Start;
                        return;
                    }
                    (1, _) => {
                        self.emit_here(Token::Key(KeySym::Period), out);
                        self.state = State::Start;
                        continue;
                    }
                    _ => {
                        self.emit_here(Token::Error("invalid token \"..\"".to_string()), out);
                        self.state = State::Start;
                        continue;
                    }
                },
                State::Op { ch } => {
                    let two = match (ch, byte) {
                        (b'<', b'=') => Some(KeySym::LtEqu),
                        (b'>', b'=') => Some(KeySym::GtEqu),
                        (b'!', b'=') => Some(KeySym::BangEqu),
                        (b'=', b'=') => Some(KeySym::Equ2),
                        (b'%', b'=') => Some(KeySym::PercentEqu),
                        (b'*', b'=') => Some(KeySym::StarEqu),
                        (b'^', b'=') => Some(KeySym::CaretEqu),
                        (b'~', b'=') => Some(KeySym::TildeEqu),
                        _ => None,
                    };
                    if let Some(ks) = two {
                        self.emit_here(Token::Key(ks), out);
                        self.state = State::Start;
                        return;
                    }
                    if (ch, byte) == (b'&', b'&') || (ch, byte) == (b'|', b'|') {
                        self.state = State::Op2 { ch };
                        return;
                    }
                    let ks = match ch {
                        b'<' => KeySym::Lt,
                        b'>' => KeySym::Gt,
                        b'!' => KeySym::Bang,
                        b'=' => KeySym::Equ,
                        b'%' => KeySym::Percent,
                        b'*' => KeySym::Star,
                        b'^' => KeySym::Caret,
                        b'~' => KeySym::Tilde,
                        b'&' => KeySym::Amp,
                        _ => KeySym::Pipe,
                    };
                    self.emit_here(Token::Key(ks), out);
                    self.state = State::Start;
                    continue;
                }
                State::Op2 { ch } => {
                    if byte == b'=' {
                        let ks = if ch == b'&' { KeySym::Amp2Equ } else { KeySym::Pipe2Equ };
                        self.emit_here(Token::Key(ks), out);
                        self.state = State::Start;
                        return;
                    }
                    let ks = if ch == b'&' { KeySym::Amp2 } else { KeySym::Pipe2 };
                    self.emit_here(Token::Key(ks), out);
                    self.state = State::Start;
                    continue;
                }
                State::Str1 => match byte {
                    b'\'' => {
                        self.state = State::Str1Quote;
                        return;
                    }
                    b'\n' => {
                        self.emit_here(Token::Error("missing end of string".to_string()), out);
                        self.state = State::Start;
                        continue;
                    }
                    _ => {
                        self.sbuf.push(byte);
                        return;
                    }
                },
                State::Str1Quote => {
                    if byte == b'\'' {
                        // Doubled quote embeds a literal quote.
                        self.sbuf.push(b'\'');
                        self.state = State::Str1;
                        return;
                    }
                    let s = std::mem::take(&mut self.sbuf);
                    self.emit_here(Token::Str(s), out);
                    self.state = State::Start;
                    continue;
                }
                State::Str2 => match byte {
                    b'"' => {
                        let s = std::mem::take(&mut self.sbuf);
                        self.emit_here(Token::Str(s), out);
                        self.emit_here(Token::Key(KeySym::RParen), out);
                        self.state = State::Start;
                        return;
                    }
                    b'\\' => {
                        self.state = State::Str2Esc;
                        return;
                    }
                    b'$' => {
                        self.state = State::Str2Dollar;
                        return;
                    }
                    b'\n' => {
                        self.emit_here(Token::Error("missing end of string".to_string()), out);
                        self.emit_here(Token::Key(KeySym::RParen), out);
                        self.state = State::Start;
                        continue;
                    }
                    _ => {
                        self.sbuf.push(byte);
                        return;
                    }
                },
                State::Str2Esc => {
                    let esc = match byte {
                        b'0' => Some(0x00),
                        b'b' => Some(0x08),
                        b't' => Some(0x09),
                        b'n' => Some(0x0A),
                        b'v' => Some(0x0B),
                        b'f' => Some(0x0C),
                        b'r' => Some(0x0D),
                        b'e' => Some(0x1B),
                        b'\\' => Some(b'\\'),
                        b'\'' => Some(b'\''),
                        b'"' => Some(b'"'),
                        b'$' => Some(b'$'),
                        b'x' => {
                            self.state = State::Str2EscHex { digits: 0, accum: 0 };
                            return;
                        }
                        _ => None,
                    };
                    match esc {
                        Some(b) => {
                            self.sbuf.push(b);
                            self.state = State::Str2;
                        }
                        None => {
                            self.emit_here(
                                Token::Error(format!("invalid escape sequence \\{}", byte as char)),
                                out,
                            );
                            self.state = State::Str2;
                        }
                    }
                    return;
                }
                State::Str2EscHex { digits, accum } => {
                    let v = match byte {
                        b'0'..=b'9' => byte - b'0',
                        b'a'..=b'f' => byte - b'a' + 10,
                        b'A'..=b'F' => byte - b'A' + 10,
                        _ => {
                            self.emit_here(
                                Token::Error("invalid escape sequence \\x".to_string()),
                                out,
                            );
                            self.state = State::Str2;
                            continue;
                        }
                    };
                    let accum = (accum << 4) | v;
                    if digits == 0 {
                        self.state = State::Str2EscHex { digits: 1, accum };
                    } else {
                        self.sbuf.push(accum);
                        self.state = State::Str2;
                    }
                    return;
                }
                State::Str2Dollar => match byte {
                    b'{' => {
                        let s = std::mem::take(&mut self.sbuf);
                        self.emit_here(Token::Str(s), out);
                        self.emit_here(Token::Key(KeySym::Tilde), out);
                        self.splices.push(Splice { depth: 0 });
                        self.state = State::Start;
                        return;
                    }
                    b'a'..=b'z' | b'A'..=b'Z' | b'_' => {
                        let s = std::mem::take(&mut self.sbuf);
                        self.emit_here(Token::Str(s), out);
                        self.emit_here(Token::Key(KeySym::Tilde), out);
                        self.ident.clear();
                        self.ident.push(byte as char);
                        self.state = State::Str2Ident;
                        return;
                    }
                    _ => {
                        self.emit_here(
                            Token::Error("expected identifier or { after $".to_string()),
                            out,
                        );
                        self.state = State::Str2;
                        continue;
                    }
                },
                State::Str2Ident => match byte {
                    b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'_' => {
                        self.ident.push(byte as char);
                        return;
                    }
                    _ => {
                        let name = std::mem::take(&mut self.ident);
                        self.emit_here(Token::Ident(name), out);
                        self.emit_here(Token::Key(KeySym::Tilde), out);
                        self.state = State::Str2;
                        continue;
                    }
                },
            }
        }
    }

    /// Finish the stream: flush any pending token, report unterminated
    /// constructs, and emit a final hard newline.
    pub fn close(&mut self, out: &mut Vec<Lexed>) {
        match self.state.clone() {
            State::Start | State::Backslash | State::LineComment => {}
            State::BlockComment { .. } => {
                self.emit_here(Token::Error("missing end of block comment".to_string()), out);
            }
            State::Slash => self.emit_here(Token::Key(KeySym::Slash), out),
            State::Ident => self.flush_ident(out),
            State::NumZero => self.emit_here(Token::Num(0.0), out),
            State::Num => self.flush_num(out),
            State::Sign { ch, .. } => {
                let ks = if ch == b'+' { KeySym::Plus } else { KeySym::Minus };
                self.emit_here(Token::Key(ks), out);
            }
            State::Dot { count: 1 } => self.emit_here(Token::Key(KeySym::Period), out),
            State::Dot { .. } => {
                self.emit_here(Token::Error("invalid token \"..\"".to_string()), out)
            }
            State::Op { ch } => {
                let ks = match ch {
                    b'<' => KeySym::Lt,
                    b'>' => KeySym::Gt,
                    b'!' => KeySym::Bang,
                    b'=' => KeySym::Equ,
                    b'%' => KeySym::Percent,
                    b'*' => KeySym::Star,
                    b'^' => KeySym::Caret,
                    b'~' => KeySym::Tilde,
                    b'&' => KeySym::Amp,
                    _ => KeySym::Pipe,
                };
                self.emit_here(Token::Key(ks), out);
            }
            State::Op2 { ch } => {
                let ks = if ch == b'&' { KeySym::Amp2 } else { KeySym::Pipe2 };
                self.emit_here(Token::Key(ks), out);
            }
            State::Str1Quote => {
                // The closing quote was the last byte; the string is done.
                let s = std::mem::take(&mut self.sbuf);
                self.emit_here(Token::Str(s), out);
            }
            State::Str1 | State::Str2 | State::Str2Esc | State::Str2EscHex { .. }
            | State::Str2Dollar | State::Str2Ident => {
                self.emit_here(Token::Error("missing end of string".to_string()), out);
            }
        }
        self.state = State::Start;
        let pos = self.pos();
        self.emit(Token::Newline { soft: false }, pos, out);
    }
}

#[cfg(test)]
mod tests;
