//! Expression parsing without recursion.
//!
//! The machine keeps explicit stacks: one of partially built operand
//! expressions, one of pending operators and open-bracket markers. Feeding
//! a token either extends a stack, reduces (building `Infix`/`Prefix`/...
//! nodes), or reports that the expression is finished.
//!
//! # Operator precedence (tight binding first)
//!
//! | Level | Operators |
//! |-------|-----------|
//! | 1 | `^` (right-assoc) |
//! | 2 | `*` `/` `%` |
//! | 3 | `+` `-` |
//! | 4 | `~` |
//! | 5 | `<` `<=` `>` `>=` |
//! | 6 | `==` `!=` |
//! | 7 | `&&` |
//! | 8 | `||` |
//! | 9 | `,` |
//! | 10 | `|` |
//! | 20 | assignments (right-assoc) |
//!
//! Unary `+`/`-` lose to `^` on their right operand but win otherwise, so
//! `-2 ^ 2` is `-(2 ^ 2)`. A bare name path followed by a term starts a
//! command call; the call's params bind tighter than `|` and looser than
//! `,`, which is what makes `a | f b, c` mean `f(a, b, c)`.

use crate::ast::Expr;
use wisp_lex::{KeySym, Token};
use wisp_util::Pos;

/// Binding levels. Smaller numbers bind tighter.
mod prec {
    pub const CARET: u8 = 1;
    pub const MUL: u8 = 2;
    pub const ADD: u8 = 3;
    pub const CAT: u8 = 4;
    pub const CMP: u8 = 5;
    pub const EQ: u8 = 6;
    pub const AND: u8 = 7;
    pub const OR: u8 = 8;
    pub const GROUP: u8 = 9;
    pub const PIPE: u8 = 10;
    pub const ASSIGN: u8 = 20;
}

fn infix_prec(ks: KeySym) -> Option<u8> {
    Some(match ks {
        KeySym::Caret => prec::CARET,
        KeySym::Star | KeySym::Slash | KeySym::Percent => prec::MUL,
        KeySym::Plus | KeySym::Minus => prec::ADD,
        KeySym::Tilde => prec::CAT,
        KeySym::Lt | KeySym::LtEqu | KeySym::Gt | KeySym::GtEqu => prec::CMP,
        KeySym::Equ2 | KeySym::BangEqu => prec::EQ,
        KeySym::Amp2 => prec::AND,
        KeySym::Pipe2 => prec::OR,
        KeySym::Comma => prec::GROUP,
        KeySym::Pipe => prec::PIPE,
        KeySym::Equ
        | KeySym::PlusEqu
        | KeySym::MinusEqu
        | KeySym::StarEqu
        | KeySym::SlashEqu
        | KeySym::PercentEqu
        | KeySym::CaretEqu
        | KeySym::TildeEqu
        | KeySym::Amp2Equ
        | KeySym::Pipe2Equ => prec::ASSIGN,
        _ => return None,
    })
}

fn right_assoc(p: u8) -> bool {
    p == prec::CARET || p == prec::ASSIGN
}

fn is_prefix(ks: KeySym) -> bool {
    matches!(
        ks,
        KeySym::UnPlus | KeySym::UnMinus | KeySym::Bang | KeySym::Amp | KeySym::Period3
    )
}

/// Can this token begin a term? Used both for starting expressions and for
/// detecting paren-less command calls (`f 5`).
pub fn starts_term(tok: &Token) -> bool {
    match tok {
        Token::Num(_) | Token::Str(_) | Token::Ident(_) => true,
        Token::Key(ks) => matches!(ks, KeySym::Nil | KeySym::LBrace | KeySym::LParen) || is_prefix(*ks),
        _ => false,
    }
}

#[derive(Debug, Clone)]
enum OpEnt {
    Prefix(Pos, KeySym),
    Infix(Pos, KeySym),
    Paren(Pos),
    Brace(Pos),
    Bracket(Pos),
    Slice { pos: Pos, has_start: bool },
    Call(Pos),
}

impl OpEnt {
    fn is_marker(&self) -> bool {
        matches!(
            self,
            OpEnt::Paren(_) | OpEnt::Brace(_) | OpEnt::Bracket(_) | OpEnt::Slice { .. } | OpEnt::Call(_)
        )
    }
}

/// Outcome of feeding one token.
#[derive(Debug)]
pub enum Step {
    /// Token consumed; expression still in progress.
    Taken,
    /// A comma-separated item finished (only with `stop_at_comma`); the
    /// comma itself was consumed.
    Item(Expr),
    /// The expression is complete. The terminating token was NOT consumed;
    /// the caller must reprocess it. `None` means no tokens formed an
    /// expression at all.
    Done(Option<Expr>),
    Err(String),
}

/// The incremental expression parser.
#[derive(Debug)]
pub struct ExprMachine {
    exprs: Vec<Expr>,
    ops: Vec<OpEnt>,
    /// True when the machine expects a term next.
    term: bool,
    /// The expression on top of `exprs` is a name path that may extend.
    names_open: bool,
    /// Just saw `.` on an open name path.
    names_dot: bool,
    stop_at_comma: bool,
}

impl ExprMachine {
    pub fn new(stop_at_comma: bool) -> Self {
        Self {
            exprs: Vec::new(),
            ops: Vec::new(),
            term: true,
            names_open: false,
            names_dot: false,
            stop_at_comma,
        }
    }

    fn has_open_marker(&self) -> bool {
        self.ops.iter().any(|o| o.is_marker())
    }

    fn push_expr(&mut self, e: Expr) {
        self.exprs.push(e);
        self.term = false;
    }

    /// Pop one prefix operator and apply it.
    fn reduce_prefix(&mut self) -> Result<(), String> {
        let (pos, ks) = match self.ops.pop() {
            Some(OpEnt::Prefix(p, k)) => (p, k),
            _ => unreachable!("reduce_prefix without prefix on top"),
        };
        let operand = self.exprs.pop().expect("prefix without operand");
        let folded = match (ks, &operand) {
            (KeySym::UnMinus, Expr::Num(_, n)) => Some(Expr::Num(pos, -n)),
            (KeySym::UnPlus, Expr::Num(_, n)) => Some(Expr::Num(pos, *n)),
            _ => None,
        };
        self.exprs.push(folded.unwrap_or(Expr::Prefix(pos, ks, Box::new(operand))));
        Ok(())
    }

    /// Pop one infix operator and combine the top two operands.
    fn reduce_infix(&mut self) -> Result<(), String> {
        let (pos, ks) = match self.ops.pop() {
            Some(OpEnt::Infix(p, k)) => (p, k),
            _ => unreachable!("reduce_infix without infix on top"),
        };
        let rhs = self.exprs.pop().expect("infix without rhs");
        let lhs = self.exprs.pop().expect("infix without lhs");
        let built = match ks {
            KeySym::Comma => {
                let mut items = match lhs {
                    Expr::Group(_, items) => items,
                    other => vec![other],
                };
                items.push(rhs);
                Expr::Group(pos, items)
            }
            KeySym::Tilde => {
                let mut items = match lhs {
                    Expr::Cat(_, items) => items,
                    other => vec![other],
                };
                // Fold two adjacent literal strings.
                let folds = matches!(
                    (items.last(), &rhs),
                    (Some(Expr::Str(..)), Expr::Str(..))
                );
                if folds {
                    if let (Some(Expr::Str(_, a)), Expr::Str(_, b)) = (items.last_mut(), &rhs) {
                        a.extend_from_slice(b);
                    }
                } else {
                    items.push(rhs);
                }
                if items.len() == 1 && matches!(items[0], Expr::Str(..)) {
                    items.pop().unwrap()
                } else {
                    Expr::Cat(pos, items)
                }
            }
            KeySym::Pipe => match rhs {
                Expr::Call(cpos, cmd, params) => {
                    let mut items = vec![lhs];
                    items.extend(params.into_items());
                    Expr::Call(cpos, cmd, Box::new(Expr::Group(pos, items)))
                }
                Expr::Names(npos, names) => Expr::Call(
                    npos,
                    Box::new(Expr::Names(npos, names)),
                    Box::new(lhs),
                ),
                _ => return Err("pipe must feed into a command".to_string()),
            },
            _ => {
                if let (Expr::Num(_, a), Expr::Num(_, b)) = (&lhs, &rhs) {
                    let folded = match ks {
                        KeySym::Plus => Some(a + b),
                        KeySym::Minus => Some(a - b),
                        KeySym::Star => Some(a * b),
                        KeySym::Slash => Some(a / b),
                        KeySym::Percent => Some(a % b),
                        KeySym::Caret => Some(a.powf(*b)),
                        _ => None,
                    };
                    if let Some(n) = folded {
                        self.exprs.push(Expr::Num(pos, n));
                        return Ok(());
                    }
                }
                Expr::Infix(pos, ks, Box::new(lhs), Some(Box::new(rhs)))
            }
        };
        self.exprs.push(built);
        Ok(())
    }

    fn reduce_call(&mut self) -> Result<(), String> {
        let pos = match self.ops.pop() {
            Some(OpEnt::Call(p)) => p,
            _ => unreachable!("reduce_call without call marker"),
        };
        let params = match self.exprs.pop().expect("call without params") {
            // `f(a, b)`: the parens group the argument list.
            Expr::Paren(_, inner) => *inner,
            other => other,
        };
        let cmd = self.exprs.pop().expect("call without command");
        self.exprs.push(Expr::Call(pos, Box::new(cmd), Box::new(params)));
        Ok(())
    }

    /// Reduce operators that bind tighter than a new infix of level `p`.
    fn reduce_for(&mut self, new_ks: KeySym, p: u8) -> Result<(), String> {
        loop {
            match self.ops.last() {
                Some(OpEnt::Prefix(_, pk)) => {
                    let sign = matches!(pk, KeySym::UnPlus | KeySym::UnMinus);
                    if new_ks == KeySym::Caret && sign {
                        // Unary sign loses to ^ on its right operand.
                        break;
                    }
                    self.reduce_prefix()?;
                }
                Some(OpEnt::Infix(_, tk)) => {
                    let tp = infix_prec(*tk).expect("infix entry with no precedence");
                    if tp < p || (tp == p && !right_assoc(p)) {
                        self.reduce_infix()?;
                    } else {
                        break;
                    }
                }
                Some(OpEnt::Call(_)) => {
                    if p >= prec::PIPE {
                        self.reduce_call()?;
                    } else {
                        break;
                    }
                }
                _ => break,
            }
        }
        Ok(())
    }

    /// Reduce down to the innermost marker, which is left in place.
    fn reduce_to_marker(&mut self) -> Result<(), String> {
        loop {
            match self.ops.last() {
                Some(OpEnt::Prefix(..)) => self.reduce_prefix()?,
                Some(OpEnt::Infix(..)) => self.reduce_infix()?,
                Some(OpEnt::Call(_)) => self.reduce_call()?,
                _ => return Ok(()),
            }
        }
    }

    /// Reduce everything; the expression must be closed.
    fn finish(&mut self) -> Result<Option<Expr>, String> {
        if self.term {
            if self.exprs.is_empty() && self.ops.is_empty() {
                return Ok(None);
            }
            return Err("expected expression".to_string());
        }
        loop {
            match self.ops.last() {
                None => break,
                Some(OpEnt::Prefix(..)) => self.reduce_prefix()?,
                Some(OpEnt::Infix(..)) => self.reduce_infix()?,
                Some(OpEnt::Call(_)) => self.reduce_call()?,
                Some(OpEnt::Paren(_)) => return Err("missing )".to_string()),
                Some(OpEnt::Brace(_)) => return Err("missing }".to_string()),
                Some(OpEnt::Bracket(_) | OpEnt::Slice { .. }) => {
                    return Err("missing ]".to_string())
                }
            }
        }
        debug_assert_eq!(self.exprs.len(), 1);
        Ok(self.exprs.pop())
    }

    /// Feed one token.
    pub fn feed(&mut self, tok: &Token, pos: Pos) -> Step {
        match self.feed_inner(tok, pos) {
            Ok(step) => step,
            Err(msg) => Step::Err(msg),
        }
    }

    fn feed_inner(&mut self, tok: &Token, pos: Pos) -> Result<Step, String> {
        // A pending `.` on a name path must be followed by an identifier.
        if self.names_dot {
            return match tok {
                Token::Ident(name) => {
                    if let Some(Expr::Names(_, names)) = self.exprs.last_mut() {
                        names.push(name.clone());
                    }
                    self.names_dot = false;
                    Ok(Step::Taken)
                }
                _ => Err("expected identifier after .".to_string()),
            };
        }

        if let Token::Newline { soft: true } = tok {
            return Ok(Step::Taken);
        }
        if let Token::Error(msg) = tok {
            return Err(msg.clone());
        }

        if self.term {
            self.feed_term(tok, pos)
        } else {
            self.feed_post(tok, pos)
        }
    }

    /// Expecting a term.
    fn feed_term(&mut self, tok: &Token, pos: Pos) -> Result<Step, String> {
        self.names_open = false;
        match tok {
            Token::Num(n) => {
                self.push_expr(Expr::Num(pos, *n));
                Ok(Step::Taken)
            }
            Token::Str(s) => {
                self.push_expr(Expr::Str(pos, s.clone()));
                Ok(Step::Taken)
            }
            Token::Ident(name) => {
                self.push_expr(Expr::Names(pos, vec![name.clone()]));
                self.names_open = true;
                Ok(Step::Taken)
            }
            Token::Key(KeySym::Nil) => {
                self.push_expr(Expr::Nil(pos));
                Ok(Step::Taken)
            }
            Token::Key(KeySym::LParen) => {
                self.ops.push(OpEnt::Paren(pos));
                Ok(Step::Taken)
            }
            Token::Key(KeySym::LBrace) => {
                self.ops.push(OpEnt::Brace(pos));
                Ok(Step::Taken)
            }
            Token::Key(KeySym::RBrace) => {
                // `{}` is the empty list.
                match self.ops.last() {
                    Some(OpEnt::Brace(_)) => {
                        let bpos = match self.ops.pop() {
                            Some(OpEnt::Brace(p)) => p,
                            _ => unreachable!(),
                        };
                        self.push_expr(Expr::List(bpos, None));
                        Ok(Step::Taken)
                    }
                    _ => Err("expected expression, found }".to_string()),
                }
            }
            Token::Key(KeySym::Colon) => {
                // `x[:len]`: colon straight after the bracket.
                match self.ops.last_mut() {
                    Some(top @ OpEnt::Bracket(_)) => {
                        let bpos = match top {
                            OpEnt::Bracket(p) => *p,
                            _ => unreachable!(),
                        };
                        *top = OpEnt::Slice { pos: bpos, has_start: false };
                        Ok(Step::Taken)
                    }
                    _ => Err("expected expression, found :".to_string()),
                }
            }
            Token::Key(KeySym::RBracket) => {
                // `x[a:]` / `x[:]`: close a slice with no length.
                match self.ops.last() {
                    Some(OpEnt::Slice { .. }) => self.close_bracket(None),
                    _ => Err("expected expression, found ]".to_string()),
                }
            }
            Token::Key(ks) if is_prefix(*ks) => {
                self.ops.push(OpEnt::Prefix(pos, *ks));
                Ok(Step::Taken)
            }
            Token::Newline { soft: false } => {
                let done = self.finish()?;
                Ok(Step::Done(done))
            }
            tok => Err(format!("expected expression, found {}", tok)),
        }
    }

    /// After a complete term.
    fn feed_post(&mut self, tok: &Token, pos: Pos) -> Result<Step, String> {
        // Paren-less command call: a bare name path followed by a term.
        if self.names_open && starts_term(tok) {
            if matches!(self.exprs.last(), Some(Expr::Names(..))) {
                self.names_open = false;
                self.ops.push(OpEnt::Call(pos));
                self.term = true;
                return self.feed_inner(tok, pos);
            }
        }
        match tok {
            Token::Key(KeySym::Period) if self.names_open => {
                self.names_dot = true;
                Ok(Step::Taken)
            }
            Token::Key(KeySym::LBracket) => {
                self.names_open = false;
                self.ops.push(OpEnt::Bracket(pos));
                self.term = true;
                Ok(Step::Taken)
            }
            Token::Key(KeySym::Colon) => {
                // Slice divider: reduce the start expression to the bracket.
                self.names_open = false;
                self.reduce_to_marker()?;
                match self.ops.last_mut() {
                    Some(top @ OpEnt::Bracket(_)) => {
                        let bpos = match top {
                            OpEnt::Bracket(p) => *p,
                            _ => unreachable!(),
                        };
                        *top = OpEnt::Slice { pos: bpos, has_start: true };
                        self.term = true;
                        Ok(Step::Taken)
                    }
                    _ => Err("unexpected :".to_string()),
                }
            }
            Token::Key(KeySym::RBracket) => {
                self.names_open = false;
                self.reduce_to_marker()?;
                let len = match self.ops.last() {
                    Some(OpEnt::Slice { .. }) => Some(self.exprs.pop().expect("slice len")),
                    Some(OpEnt::Bracket(_)) => None,
                    _ => return Err("unexpected ]".to_string()),
                };
                match self.ops.last() {
                    Some(OpEnt::Bracket(_)) => {
                        self.ops.pop();
                        let key = self.exprs.pop().expect("index key");
                        let obj = self.exprs.pop().expect("index object");
                        self.push_expr(Expr::Index(pos, Box::new(obj), Box::new(key)));
                        Ok(Step::Taken)
                    }
                    Some(OpEnt::Slice { .. }) => self.close_bracket(len),
                    _ => unreachable!(),
                }
            }
            Token::Key(KeySym::RParen) => {
                self.names_open = false;
                self.reduce_to_marker()?;
                match self.ops.pop() {
                    Some(OpEnt::Paren(ppos)) => {
                        let inner = self.exprs.pop().expect("paren body");
                        // Parens around a literal fold away.
                        let e = match inner {
                            lit @ (Expr::Num(..) | Expr::Str(..) | Expr::Nil(..)) => lit,
                            other => Expr::Paren(ppos, Box::new(other)),
                        };
                        self.push_expr(e);
                        Ok(Step::Taken)
                    }
                    _ => Err("unexpected )".to_string()),
                }
            }
            Token::Key(KeySym::RBrace) => {
                self.names_open = false;
                self.reduce_to_marker()?;
                match self.ops.pop() {
                    Some(OpEnt::Brace(bpos)) => {
                        let inner = self.exprs.pop().expect("list body");
                        self.push_expr(Expr::List(bpos, Some(Box::new(inner))));
                        Ok(Step::Taken)
                    }
                    _ => Err("unexpected }".to_string()),
                }
            }
            Token::Key(ks) if infix_prec(*ks).is_some() => {
                self.names_open = false;
                let p = infix_prec(*ks).unwrap();
                if *ks == KeySym::Comma && self.stop_at_comma && !self.has_open_marker() {
                    let done = self.finish()?;
                    let item = done.expect("comma after complete expression");
                    self.term = true;
                    return Ok(Step::Item(item));
                }
                self.reduce_for(*ks, p)?;
                self.ops.push(OpEnt::Infix(pos, *ks));
                self.term = true;
                Ok(Step::Taken)
            }
            Token::Newline { soft: false }
            | Token::Key(KeySym::End | KeySym::Else | KeySym::Elseif | KeySym::While) => {
                let done = self.finish()?;
                Ok(Step::Done(done))
            }
            tok => Err(format!("unexpected {}", tok)),
        }
    }

    /// Close the innermost slice marker with an optional length.
    fn close_bracket(&mut self, len: Option<Expr>) -> Result<Step, String> {
        let (_, has_start) = match self.ops.pop() {
            Some(OpEnt::Slice { pos, has_start }) => (pos, has_start),
            _ => unreachable!("close_bracket without slice marker"),
        };
        let start = if has_start {
            Some(self.exprs.pop().expect("slice start"))
        } else {
            None
        };
        let obj = self.exprs.pop().expect("slice object");
        let pos = obj.pos();
        self.push_expr(Expr::Slice(
            pos,
            Box::new(obj),
            start.map(Box::new),
            len.map(Box::new),
        ));
        Ok(Step::Taken)
    }

    /// Seed the machine with an identifier already consumed by the caller.
    pub fn seed_ident(&mut self, name: String, pos: Pos) {
        self.push_expr(Expr::Names(pos, vec![name]));
        self.names_open = true;
    }

    /// True if no tokens have been fed.
    pub fn is_empty(&self) -> bool {
        self.exprs.is_empty() && self.ops.is_empty() && self.term
    }
}
