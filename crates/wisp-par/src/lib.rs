//! wisp-par - Incremental parser for the wisp scripting language.
//!
//! ============================================================================
//! OVERVIEW
//! ============================================================================
//!
//! The parser is a pushdown state machine fed one token at a time. It never
//! builds a whole-program tree: as soon as a statement is syntactically
//! complete it is appended to the caller's output vector, which is how the
//! compiler stays incremental for REPL use. Block constructs (`if`, `do`,
//! `for`, `def`, `namespace`) are emitted as begin/mid/end statement
//! sequences and a block stack tracks nesting; [`Parser::level`] exposes
//! the depth so an embedding REPL can draw continuation prompts.
//!
//! Expressions are parsed by [`expr::ExprMachine`] using explicit operator
//! and operand stacks, so arbitrarily nested expressions never recurse.
//!
//! The parser does not attempt recovery: the first error is returned with
//! its position and the caller decides whether to reset.

pub mod ast;
pub mod expr;

pub use ast::{DeclareItem, Expr, ForHeader, IncludeItem, Stmt};
pub use expr::{ExprMachine, Step};

use wisp_lex::{KeySym, Token};
use wisp_util::Pos;

/// Where a finished expression goes.
#[derive(Debug)]
enum ExprCtx {
    Eval,
    IfCond,
    ElseifCond,
    DoWhile,
    Return,
    Var,
    Enum,
    DefParams { def_pos: Pos, names: Vec<String> },
    ForIter { for_pos: Pos, new_vars: bool, names: Vec<String> },
}

impl ExprCtx {
    fn stops_at_comma(&self) -> bool {
        matches!(
            self,
            ExprCtx::Var | ExprCtx::Enum | ExprCtx::DefParams { .. }
        )
    }
}

/// An open block construct.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Block {
    If { saw_else: bool },
    Do { saw_while: bool },
    For,
    Def,
    Namespace,
}

#[derive(Debug)]
enum SState {
    Idle,
    NeedNewline,
    /// Saw a lone identifier at statement start; `name:` is a label,
    /// anything else restarts as an expression.
    MaybeLabel { pos: Pos, name: String },
    Expr {
        pos: Pos,
        ctx: ExprCtx,
        m: ExprMachine,
        items: Vec<Expr>,
    },
    DefNames { pos: Pos, names: Vec<String>, dot: bool },
    ForHead {
        pos: Pos,
        new_vars: bool,
        names: Vec<String>,
        expect_name: bool,
    },
    NamespaceName { pos: Pos, names: Vec<String>, dot: bool },
    UsingList {
        pos: Pos,
        list: Vec<Vec<String>>,
        cur: Vec<String>,
        dot: bool,
    },
    GotoName { pos: Pos },
    DeclareList {
        pos: Pos,
        items: Vec<DeclareItem>,
        cur_pos: Pos,
        cur: Vec<String>,
        dot: bool,
        after_key: bool,
    },
    IncludeList {
        pos: Pos,
        items: Vec<IncludeItem>,
        cur_pos: Pos,
        cur: Vec<String>,
        dot: bool,
    },
}

pub type ParseResult = Result<(), (Pos, String)>;

/// The incremental statement parser.
pub struct Parser {
    state: SState,
    blocks: Vec<Block>,
    last_pos: Pos,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser {
    pub fn new() -> Self {
        Self {
            state: SState::Idle,
            blocks: Vec::new(),
            last_pos: Pos::DUMMY,
        }
    }

    /// Open block depth, used for REPL continuation prompts.
    pub fn level(&self) -> usize {
        self.blocks.len()
    }

    /// Drop any half-parsed statement after an error. Open blocks are kept;
    /// the REPL keeps accepting input at the same level.
    pub fn reset(&mut self) {
        self.state = SState::Idle;
    }

    /// Finish the token stream. The lexer has already delivered a final
    /// hard newline, so a clean parse ends in the idle state with no open
    /// blocks.
    pub fn close(&mut self, _out: &mut Vec<Stmt>) -> ParseResult {
        if !matches!(self.state, SState::Idle | SState::NeedNewline) {
            return Err((self.last_pos, "unexpected end of input".to_string()));
        }
        if !self.blocks.is_empty() {
            return Err((self.last_pos, "missing end of block".to_string()));
        }
        Ok(())
    }

    /// Feed one token. Completed statements are appended to `out`.
    pub fn add(&mut self, tok: &Token, pos: Pos, out: &mut Vec<Stmt>) -> ParseResult {
        self.last_pos = pos;
        let mut again = true;
        while again {
            again = self.dispatch(tok, pos, out)?;
        }
        Ok(())
    }

    /// Process `tok` in the current state. Returns true when the same token
    /// must be reprocessed in the new state.
    fn dispatch(&mut self, tok: &Token, pos: Pos, out: &mut Vec<Stmt>) -> Result<bool, (Pos, String)> {
        let err = |msg: String| Err((pos, msg));
        let state = std::mem::replace(&mut self.state, SState::Idle);
        match state {
            SState::Idle => {
                match tok {
                    Token::Newline { .. } => {}
                    Token::Error(msg) => return err(msg.clone()),
                    Token::Ident(name) => {
                        self.state = SState::MaybeLabel {
                            pos,
                            name: name.clone(),
                        };
                    }
                    Token::Key(KeySym::Break) => {
                        out.push(Stmt::Break(pos));
                        self.state = SState::NeedNewline;
                    }
                    Token::Key(KeySym::Continue) => {
                        out.push(Stmt::Continue(pos));
                        self.state = SState::NeedNewline;
                    }
                    Token::Key(KeySym::Var) => {
                        self.state = SState::Expr {
                            pos,
                            ctx: ExprCtx::Var,
                            m: ExprMachine::new(true),
                            items: Vec::new(),
                        };
                    }
                    Token::Key(KeySym::Def) => {
                        self.state = SState::DefNames {
                            pos,
                            names: Vec::new(),
                            dot: false,
                        };
                    }
                    Token::Key(KeySym::If) => {
                        out.push(Stmt::IfBegin(pos));
                        self.blocks.push(Block::If { saw_else: false });
                        self.state = SState::Expr {
                            pos,
                            ctx: ExprCtx::IfCond,
                            m: ExprMachine::new(false),
                            items: Vec::new(),
                        };
                    }
                    Token::Key(KeySym::Elseif) => match self.blocks.last() {
                        Some(Block::If { saw_else: false }) => {
                            self.state = SState::Expr {
                                pos,
                                ctx: ExprCtx::ElseifCond,
                                m: ExprMachine::new(false),
                                items: Vec::new(),
                            };
                        }
                        Some(Block::If { saw_else: true }) => {
                            return err("elseif after else".to_string())
                        }
                        _ => return err("unexpected elseif".to_string()),
                    },
                    Token::Key(KeySym::Else) => match self.blocks.last_mut() {
                        Some(Block::If { saw_else }) if !*saw_else => {
                            *saw_else = true;
                            out.push(Stmt::IfElse(pos));
                            self.state = SState::NeedNewline;
                        }
                        Some(Block::If { .. }) => return err("duplicate else".to_string()),
                        _ => return err("unexpected else".to_string()),
                    },
                    Token::Key(KeySym::End) => match self.blocks.pop() {
                        Some(Block::If { .. }) => {
                            out.push(Stmt::IfEnd(pos));
                            self.state = SState::NeedNewline;
                        }
                        Some(Block::Do { .. }) => {
                            out.push(Stmt::DoEnd(pos));
                            self.state = SState::NeedNewline;
                        }
                        Some(Block::For) => {
                            out.push(Stmt::ForEnd(pos));
                            self.state = SState::NeedNewline;
                        }
                        Some(Block::Def) => {
                            out.push(Stmt::DefEnd(pos));
                            self.state = SState::NeedNewline;
                        }
                        Some(Block::Namespace) => {
                            out.push(Stmt::NamespaceEnd(pos));
                            self.state = SState::NeedNewline;
                        }
                        None => return err("unexpected end".to_string()),
                    },
                    Token::Key(KeySym::Do) => {
                        out.push(Stmt::DoBegin(pos));
                        self.blocks.push(Block::Do { saw_while: false });
                        self.state = SState::NeedNewline;
                    }
                    Token::Key(KeySym::While) => match self.blocks.last_mut() {
                        Some(Block::Do { saw_while }) if !*saw_while => {
                            *saw_while = true;
                            self.state = SState::Expr {
                                pos,
                                ctx: ExprCtx::DoWhile,
                                m: ExprMachine::new(false),
                                items: Vec::new(),
                            };
                        }
                        _ => return err("unexpected while".to_string()),
                    },
                    Token::Key(KeySym::For) => {
                        self.blocks.push(Block::For);
                        self.state = SState::ForHead {
                            pos,
                            new_vars: false,
                            names: Vec::new(),
                            expect_name: true,
                        };
                    }
                    Token::Key(KeySym::Namespace) => {
                        self.state = SState::NamespaceName {
                            pos,
                            names: Vec::new(),
                            dot: false,
                        };
                    }
                    Token::Key(KeySym::Using) => {
                        self.state = SState::UsingList {
                            pos,
                            list: Vec::new(),
                            cur: Vec::new(),
                            dot: false,
                        };
                    }
                    Token::Key(KeySym::Include) => {
                        self.state = SState::IncludeList {
                            pos,
                            items: Vec::new(),
                            cur_pos: pos,
                            cur: Vec::new(),
                            dot: false,
                        };
                    }
                    Token::Key(KeySym::Enum) => {
                        self.state = SState::Expr {
                            pos,
                            ctx: ExprCtx::Enum,
                            m: ExprMachine::new(true),
                            items: Vec::new(),
                        };
                    }
                    Token::Key(KeySym::Goto) => {
                        self.state = SState::GotoName { pos };
                    }
                    Token::Key(KeySym::Return) => {
                        self.state = SState::Expr {
                            pos,
                            ctx: ExprCtx::Return,
                            m: ExprMachine::new(false),
                            items: Vec::new(),
                        };
                    }
                    Token::Key(KeySym::Declare) => {
                        self.state = SState::DeclareList {
                            pos,
                            items: Vec::new(),
                            cur_pos: pos,
                            cur: Vec::new(),
                            dot: false,
                            after_key: false,
                        };
                    }
                    tok if expr::starts_term(tok) => {
                        self.state = SState::Expr {
                            pos,
                            ctx: ExprCtx::Eval,
                            m: ExprMachine::new(false),
                            items: Vec::new(),
                        };
                        return Ok(true);
                    }
                    tok => return err(format!("unexpected {}", tok)),
                }
                Ok(false)
            }

            SState::NeedNewline => match tok {
                Token::Newline { .. } => Ok(false),
                Token::Error(msg) => err(msg.clone()),
                tok => err(format!("expected end of statement, found {}", tok)),
            },

            SState::MaybeLabel { pos: ipos, name } => match tok {
                Token::Key(KeySym::Colon) => {
                    out.push(Stmt::Label(ipos, name));
                    self.state = SState::NeedNewline;
                    Ok(false)
                }
                _ => {
                    let mut m = ExprMachine::new(false);
                    m.seed_ident(name, ipos);
                    self.state = SState::Expr {
                        pos: ipos,
                        ctx: ExprCtx::Eval,
                        m,
                        items: Vec::new(),
                    };
                    Ok(true)
                }
            },

            SState::Expr { pos: spos, ctx, mut m, mut items } => {
                match m.feed(tok, pos) {
                    Step::Taken => {
                        self.state = SState::Expr { pos: spos, ctx, m, items };
                        Ok(false)
                    }
                    Step::Item(e) => {
                        items.push(e);
                        let stop = ctx.stops_at_comma();
                        self.state = SState::Expr {
                            pos: spos,
                            ctx,
                            m: ExprMachine::new(stop),
                            items,
                        };
                        Ok(false)
                    }
                    Step::Done(done) => {
                        self.finish_expr(spos, ctx, done, items, out).map_err(|msg| (pos, msg))?;
                        Ok(true)
                    }
                    Step::Err(msg) => err(msg),
                }
            }

            SState::DefNames { pos: dpos, mut names, dot } => match tok {
                Token::Ident(name) if names.is_empty() || dot => {
                    names.push(name.clone());
                    self.state = SState::DefNames { pos: dpos, names, dot: false };
                    Ok(false)
                }
                Token::Key(KeySym::Period) if !names.is_empty() && !dot => {
                    self.state = SState::DefNames { pos: dpos, names, dot: true };
                    Ok(false)
                }
                Token::Error(msg) => err(msg.clone()),
                _ if names.is_empty() || dot => err("expected command name".to_string()),
                _ => {
                    self.state = SState::Expr {
                        pos: dpos,
                        ctx: ExprCtx::DefParams { def_pos: dpos, names },
                        m: ExprMachine::new(true),
                        items: Vec::new(),
                    };
                    Ok(true)
                }
            },

            SState::ForHead { pos: fpos, new_vars, mut names, expect_name } => match tok {
                Token::Key(KeySym::Var) if names.is_empty() && !new_vars => {
                    self.state = SState::ForHead {
                        pos: fpos,
                        new_vars: true,
                        names,
                        expect_name: true,
                    };
                    Ok(false)
                }
                Token::Ident(name) if expect_name => {
                    if names.len() >= 2 {
                        return err("too many loop variables".to_string());
                    }
                    names.push(name.clone());
                    self.state = SState::ForHead {
                        pos: fpos,
                        new_vars,
                        names,
                        expect_name: false,
                    };
                    Ok(false)
                }
                Token::Key(KeySym::Comma) if !expect_name && !names.is_empty() => {
                    self.state = SState::ForHead {
                        pos: fpos,
                        new_vars,
                        names,
                        expect_name: true,
                    };
                    Ok(false)
                }
                Token::Key(KeySym::Colon) if !expect_name && !names.is_empty() => {
                    self.state = SState::Expr {
                        pos: fpos,
                        ctx: ExprCtx::ForIter { for_pos: fpos, new_vars, names },
                        m: ExprMachine::new(false),
                        items: Vec::new(),
                    };
                    Ok(false)
                }
                Token::Error(msg) => err(msg.clone()),
                _ => err("expected loop variables".to_string()),
            },

            SState::NamespaceName { pos: npos, mut names, dot } => match tok {
                Token::Ident(name) if names.is_empty() || dot => {
                    names.push(name.clone());
                    self.state = SState::NamespaceName { pos: npos, names, dot: false };
                    Ok(false)
                }
                Token::Key(KeySym::Period) if !names.is_empty() && !dot => {
                    self.state = SState::NamespaceName { pos: npos, names, dot: true };
                    Ok(false)
                }
                Token::Newline { .. } if !names.is_empty() && !dot => {
                    out.push(Stmt::NamespaceBegin(npos, names));
                    self.blocks.push(Block::Namespace);
                    self.state = SState::Idle;
                    Ok(false)
                }
                Token::Error(msg) => err(msg.clone()),
                _ => err("expected namespace name".to_string()),
            },

            SState::UsingList { pos: upos, mut list, mut cur, dot } => match tok {
                Token::Ident(name) if cur.is_empty() || dot => {
                    cur.push(name.clone());
                    self.state = SState::UsingList { pos: upos, list, cur, dot: false };
                    Ok(false)
                }
                Token::Key(KeySym::Period) if !cur.is_empty() && !dot => {
                    self.state = SState::UsingList { pos: upos, list, cur, dot: true };
                    Ok(false)
                }
                Token::Key(KeySym::Comma) if !cur.is_empty() && !dot => {
                    list.push(std::mem::take(&mut cur));
                    self.state = SState::UsingList { pos: upos, list, cur, dot: false };
                    Ok(false)
                }
                Token::Newline { .. } if !cur.is_empty() && !dot => {
                    list.push(cur);
                    out.push(Stmt::Using(upos, list));
                    self.state = SState::Idle;
                    Ok(false)
                }
                Token::Error(msg) => err(msg.clone()),
                _ => err("expected namespace name".to_string()),
            },

            SState::GotoName { pos: gpos } => match tok {
                Token::Ident(name) => {
                    out.push(Stmt::Goto(gpos, name.clone()));
                    self.state = SState::NeedNewline;
                    Ok(false)
                }
                Token::Error(msg) => err(msg.clone()),
                _ => err("expected label name after goto".to_string()),
            },

            SState::DeclareList {
                pos: dpos,
                mut items,
                cur_pos,
                mut cur,
                dot,
                after_key,
            } => match tok {
                Token::Ident(name) if !after_key && (cur.is_empty() || dot) => {
                    let cur_pos = if cur.is_empty() { pos } else { cur_pos };
                    cur.push(name.clone());
                    self.state = SState::DeclareList {
                        pos: dpos,
                        items,
                        cur_pos,
                        cur,
                        dot: false,
                        after_key: false,
                    };
                    Ok(false)
                }
                Token::Key(KeySym::Period) if !cur.is_empty() && !dot => {
                    self.state = SState::DeclareList {
                        pos: dpos,
                        items,
                        cur_pos,
                        cur,
                        dot: true,
                        after_key,
                    };
                    Ok(false)
                }
                Token::Str(key) if !cur.is_empty() && !dot => {
                    items.push(DeclareItem {
                        pos: cur_pos,
                        names: std::mem::take(&mut cur),
                        key: Some(key.clone()),
                    });
                    self.state = SState::DeclareList {
                        pos: dpos,
                        items,
                        cur_pos,
                        cur,
                        dot: false,
                        after_key: true,
                    };
                    Ok(false)
                }
                Token::Key(KeySym::Comma) if !dot => {
                    if !cur.is_empty() {
                        items.push(DeclareItem {
                            pos: cur_pos,
                            names: std::mem::take(&mut cur),
                            key: None,
                        });
                    } else if !after_key {
                        return err("expected name to declare".to_string());
                    }
                    self.state = SState::DeclareList {
                        pos: dpos,
                        items,
                        cur_pos,
                        cur,
                        dot: false,
                        after_key: false,
                    };
                    Ok(false)
                }
                Token::Newline { .. } if !dot => {
                    if !cur.is_empty() {
                        items.push(DeclareItem {
                            pos: cur_pos,
                            names: cur,
                            key: None,
                        });
                    }
                    if items.is_empty() {
                        return err("expected name to declare".to_string());
                    }
                    out.push(Stmt::Declare(dpos, items));
                    self.state = SState::Idle;
                    Ok(false)
                }
                Token::Error(msg) => err(msg.clone()),
                _ => err("invalid declare statement".to_string()),
            },

            SState::IncludeList {
                pos: ipos,
                mut items,
                cur_pos,
                mut cur,
                dot,
            } => match tok {
                Token::Ident(name) if cur.is_empty() || dot => {
                    let cur_pos = if cur.is_empty() { pos } else { cur_pos };
                    cur.push(name.clone());
                    self.state = SState::IncludeList {
                        pos: ipos,
                        items,
                        cur_pos,
                        cur,
                        dot: false,
                    };
                    Ok(false)
                }
                Token::Key(KeySym::Period) if !cur.is_empty() && !dot => {
                    self.state = SState::IncludeList {
                        pos: ipos,
                        items,
                        cur_pos,
                        cur,
                        dot: true,
                    };
                    Ok(false)
                }
                Token::Str(path) if !dot => {
                    let names = if cur.is_empty() {
                        None
                    } else {
                        Some(std::mem::take(&mut cur))
                    };
                    items.push(IncludeItem {
                        pos: if names.is_some() { cur_pos } else { pos },
                        names,
                        path: path.clone(),
                    });
                    self.state = SState::IncludeList {
                        pos: ipos,
                        items,
                        cur_pos,
                        cur,
                        dot: false,
                    };
                    Ok(false)
                }
                Token::Key(KeySym::Comma) if !dot && cur.is_empty() && !items.is_empty() => {
                    self.state = SState::IncludeList {
                        pos: ipos,
                        items,
                        cur_pos,
                        cur,
                        dot: false,
                    };
                    Ok(false)
                }
                Token::Newline { .. } if !dot && cur.is_empty() => {
                    if items.is_empty() {
                        return err("expected file to include".to_string());
                    }
                    out.push(Stmt::Include(ipos, items));
                    self.state = SState::Idle;
                    Ok(false)
                }
                Token::Error(msg) => err(msg.clone()),
                _ => err("invalid include statement".to_string()),
            },
        }
    }

    /// Dispatch a completed expression to its statement.
    fn finish_expr(
        &mut self,
        pos: Pos,
        ctx: ExprCtx,
        done: Option<Expr>,
        mut items: Vec<Expr>,
        out: &mut Vec<Stmt>,
    ) -> Result<(), String> {
        self.state = SState::Idle;
        match ctx {
            ExprCtx::Eval => {
                if let Some(e) = done {
                    out.push(Stmt::Eval(pos, e));
                }
                Ok(())
            }
            ExprCtx::IfCond | ExprCtx::ElseifCond => match done {
                Some(cond) => {
                    out.push(Stmt::IfCond(pos, cond));
                    Ok(())
                }
                None => Err("expected condition".to_string()),
            },
            ExprCtx::DoWhile => match done {
                Some(cond) => {
                    out.push(Stmt::DoWhile(pos, cond));
                    Ok(())
                }
                None => Err("expected condition".to_string()),
            },
            ExprCtx::Return => {
                let e = done.unwrap_or(Expr::Nil(pos));
                out.push(Stmt::Return(pos, e));
                Ok(())
            }
            ExprCtx::Var => {
                match done {
                    Some(e) => items.push(e),
                    None if items.is_empty() => {
                        return Err("expected variable declaration".to_string())
                    }
                    None => return Err("expected declaration after ,".to_string()),
                }
                out.push(Stmt::Var(pos, items));
                Ok(())
            }
            ExprCtx::Enum => {
                match done {
                    Some(e) => items.push(e),
                    None if items.is_empty() => return Err("expected enum values".to_string()),
                    None => return Err("expected enum value after ,".to_string()),
                }
                let mut entries = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Expr::Names(_, names) if names.len() == 1 => {
                            entries.push((names.into_iter().next().unwrap(), None));
                        }
                        Expr::Infix(_, KeySym::Equ, lhs, Some(rhs)) => match *lhs {
                            Expr::Names(_, names) if names.len() == 1 => {
                                entries.push((names.into_iter().next().unwrap(), Some(*rhs)));
                            }
                            _ => return Err("invalid enum value name".to_string()),
                        },
                        _ => return Err("invalid enum value".to_string()),
                    }
                }
                out.push(Stmt::Enum(pos, entries));
                Ok(())
            }
            ExprCtx::DefParams { def_pos, names } => {
                match done {
                    Some(e) => items.push(e),
                    None if !items.is_empty() => {
                        return Err("expected parameter after ,".to_string())
                    }
                    None => {}
                }
                out.push(Stmt::DefBegin(def_pos, names, items));
                self.blocks.push(Block::Def);
                Ok(())
            }
            ExprCtx::ForIter { for_pos, new_vars, names } => match done {
                Some(iter) => {
                    out.push(Stmt::ForBegin(
                        for_pos,
                        ForHeader { new_vars, names, iter },
                    ));
                    Ok(())
                }
                None => Err("expected loop expression".to_string()),
            },
        }
    }
}
