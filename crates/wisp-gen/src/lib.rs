//! wisp-gen - Bytecode generation.
//!
//! ============================================================================
//! OVERVIEW
//! ============================================================================
//!
//! The generator consumes AST statements one at a time (matching the
//! parser's incremental emission) and appends opcodes to a [`Program`].
//! Block statements arrive as begin/mid/end triples; a block stack carries
//! the labels each construct needs:
//!
//! ```text
//! if c1 ... elseif c2 ... else ... end
//!
//!     eval c1 -> t
//!     jumpFalse t, next1
//!     <body1>
//!     jump done
//! next1:
//!     eval c2 -> t
//!     jumpFalse t, next2
//!     <body2>
//!     jump done
//! next2:
//!     <body3>
//! done:
//! ```
//!
//! Jumps to labels that are not yet placed are emitted as the sentinel
//! `0xFFFFFFFF` and recorded on the label; placing the label patches every
//! recorded site, and later references patch immediately. In REPL mode a
//! sentinel that survives to run time makes the VM report "more input
//! needed" instead of failing.
//!
//! Expression lowering threads a purpose through evaluation: `Empty`
//! discards results, `Create` produces a fresh temporary, and `Into`
//! targets a pre-allocated slot so `x = expr` lands directly in `x`.

mod lower;

pub use lower::{Purpose, VarRef};

use rustc_hash::{FxHashMap, FxHashSet};
use wisp_lex::KeySym;
use wisp_par::{DeclareItem, Expr, ForHeader, Stmt};
use wisp_prog::{Op, OpCmd, Program, HINT_NONE};
use wisp_sym::{LblIdx, NsName, SymTable};
use wisp_util::{hash64, FileId, Pos};

/// Position-tagged generation error.
pub type GenErr = (Pos, String);

/// Reads files for `embed` at compile time. The driver backs this with the
/// same include resolver used for `include` statements.
pub trait EmbedResolver {
    fn read(&mut self, path: &[u8]) -> Option<Vec<u8>>;
}

/// Resolver that refuses everything; useful for tests and pure strings.
pub struct NoEmbeds;

impl EmbedResolver for NoEmbeds {
    fn read(&mut self, _path: &[u8]) -> Option<Vec<u8>> {
        None
    }
}

/// Loop shape picked by `for` lowering.
#[derive(Debug)]
enum ForKind {
    /// `for v[, i]: range a, b, c` with a known step direction: counted
    /// loop, no list materialized.
    Counted {
        v: VarRef,
        stop: VarRef,
        step: VarRef,
        idx: Option<VarRef>,
        one: Option<VarRef>,
        t: VarRef,
        down: bool,
    },
    /// Iterate any value by index using size + getat each step.
    Generic {
        lst: VarRef,
        idx: VarRef,
        sz: VarRef,
        t: VarRef,
        one: VarRef,
    },
}

#[derive(Debug)]
enum GBlock {
    If {
        next: LblIdx,
        done: LblIdx,
        seen_cond: bool,
        seen_else: bool,
    },
    Do {
        top: LblIdx,
        cond: LblIdx,
        finish: LblIdx,
        saw_while: bool,
    },
    For {
        top: LblIdx,
        cont: LblIdx,
        finish: LblIdx,
        kind: ForKind,
    },
    Def {
        skip: LblIdx,
        prev_hint: u32,
    },
    Namespace {
        pushed: usize,
    },
}

/// The code generator.
pub struct Gen {
    pub sym: SymTable,
    pub prog: Program,
    blocks: Vec<GBlock>,
    /// FileId -> debug-string index of the basefile name.
    files: FxHashMap<u32, u32>,
    /// Native hashes the host has registered, for `isnative`.
    natives: FxHashSet<u64>,
    /// Command hint active at the current pc.
    cur_hint: u32,
    pub(crate) cur_pos: Pos,
}

impl Gen {
    pub fn new(repl: bool) -> Self {
        Self {
            sym: SymTable::new(repl),
            prog: Program::new(repl),
            blocks: Vec::new(),
            files: FxHashMap::default(),
            natives: FxHashSet::default(),
            cur_hint: HINT_NONE,
            cur_pos: Pos::DUMMY,
        }
    }

    /// Register the basefile name for a file id.
    pub fn set_file(&mut self, id: FileId, name: &str) {
        let idx = self.prog.add_debug_string(name);
        self.files.insert(id.0, idx);
    }

    pub(crate) fn file_index(&mut self, id: FileId) -> u32 {
        if let Some(&idx) = self.files.get(&id.0) {
            return idx;
        }
        let idx = self.prog.add_debug_string("<input>");
        self.files.insert(id.0, idx);
        idx
    }

    /// Tell the generator about a host-registered native, so `isnative`
    /// can resolve at compile time.
    pub fn add_native_hash(&mut self, hash: u64) {
        self.natives.insert(hash);
    }

    pub(crate) fn has_native(&self, hash: u64) -> bool {
        self.natives.contains(&hash)
    }

    /// Basefile name for a position, for error rendering.
    pub fn file_name(&self, pos: Pos) -> Option<String> {
        self.files
            .get(&pos.file.0)
            .and_then(|&i| self.prog.basefile(i))
            .map(|s| s.to_string())
    }

    /// Enter an included file: a named namespace wraps it in that path, an
    /// anonymous one is entered and `using`'d. Returns the pushed count
    /// for [`Gen::include_end`].
    pub fn include_begin(&mut self, names: Option<&[String]>) -> Result<usize, String> {
        match names {
            Some(path) => self.sym.push_namespace(path),
            None => {
                self.sym.push_namespace_unique();
                Ok(1)
            }
        }
    }

    pub fn include_end(&mut self, pushed: usize) {
        self.sym.pop_namespaces(pushed);
    }

    /// Compile one statement.
    pub fn add_stmt(
        &mut self,
        stmt: &Stmt,
        resolver: &mut dyn EmbedResolver,
    ) -> Result<(), GenErr> {
        match stmt {
            Stmt::Eval(pos, e) => {
                self.cur_pos = *pos;
                self.eval(e, Purpose::Empty, resolver)?;
                Ok(())
            }

            Stmt::Var(pos, items) => self.stmt_var(*pos, items, resolver),

            Stmt::Break(pos) => {
                self.cur_pos = *pos;
                match self.sym.lbl_break() {
                    Some(lbl) => {
                        self.emit_op(Op::Jump);
                        self.emit_loc(lbl);
                        Ok(())
                    }
                    None => Err((*pos, "break outside of loop".to_string())),
                }
            }

            Stmt::Continue(pos) => {
                self.cur_pos = *pos;
                match self.sym.lbl_continue() {
                    Some(lbl) => {
                        self.emit_op(Op::Jump);
                        self.emit_loc(lbl);
                        Ok(())
                    }
                    None => Err((*pos, "continue outside of loop".to_string())),
                }
            }

            Stmt::IfBegin(pos) => {
                self.cur_pos = *pos;
                let next = self.sym.new_label("if_next");
                let done = self.sym.new_label("if_done");
                self.blocks.push(GBlock::If {
                    next,
                    done,
                    seen_cond: false,
                    seen_else: false,
                });
                Ok(())
            }

            Stmt::IfCond(pos, cond) => self.stmt_if_cond(*pos, cond, resolver),

            Stmt::IfElse(pos) => {
                self.cur_pos = *pos;
                match self.blocks.last() {
                    Some(GBlock::If { next, done, .. }) => {
                        let (next, done) = (*next, *done);
                        self.sym.pop_scope().map_err(|m| (*pos, m))?;
                        self.emit_op(Op::Jump);
                        self.emit_loc(done);
                        self.place_label(next);
                        self.sym.push_scope();
                        match self.blocks.last_mut() {
                            Some(GBlock::If { seen_else, .. }) => *seen_else = true,
                            _ => unreachable!(),
                        }
                        Ok(())
                    }
                    _ => Err((*pos, "unexpected else".to_string())),
                }
            }

            Stmt::IfEnd(pos) => {
                self.cur_pos = *pos;
                match self.blocks.pop() {
                    Some(GBlock::If {
                        next,
                        done,
                        seen_cond,
                        seen_else,
                    }) => {
                        if seen_cond || seen_else {
                            self.sym.pop_scope().map_err(|m| (*pos, m))?;
                        }
                        if !seen_else {
                            self.place_label(next);
                        }
                        self.place_label(done);
                        Ok(())
                    }
                    _ => Err((*pos, "unexpected end".to_string())),
                }
            }

            Stmt::DoBegin(pos) => {
                self.cur_pos = *pos;
                let top = self.sym.new_label("loop_top");
                let cond = self.sym.new_label("loop_cond");
                let finish = self.sym.new_label("loop_done");
                self.place_label(top);
                self.sym.push_scope();
                self.sym.set_loop_labels(finish, Some(cond));
                self.blocks.push(GBlock::Do {
                    top,
                    cond,
                    finish,
                    saw_while: false,
                });
                Ok(())
            }

            Stmt::DoWhile(pos, cond_expr) => {
                self.cur_pos = *pos;
                let (cond, finish) = match self.blocks.last_mut() {
                    Some(GBlock::Do {
                        cond,
                        finish,
                        saw_while,
                        ..
                    }) => {
                        *saw_while = true;
                        (*cond, *finish)
                    }
                    _ => return Err((*pos, "unexpected while".to_string())),
                };
                self.place_label(cond);
                let t = self.eval_want(cond_expr, resolver)?;
                self.emit_op(Op::JumpFalse);
                self.emit_var(t);
                self.emit_loc(finish);
                self.sym.release_temp(t.level, t.index);
                Ok(())
            }

            Stmt::DoEnd(pos) => {
                self.cur_pos = *pos;
                match self.blocks.pop() {
                    Some(GBlock::Do {
                        top,
                        cond,
                        finish,
                        saw_while,
                    }) => {
                        if !saw_while {
                            // Plain `do ... end` loops forever; continue
                            // lands on the back-jump.
                            self.place_label(cond);
                        }
                        self.emit_op(Op::Jump);
                        self.emit_loc(top);
                        self.place_label(finish);
                        self.sym.pop_scope().map_err(|m| (*pos, m))?;
                        Ok(())
                    }
                    _ => Err((*pos, "unexpected end".to_string())),
                }
            }

            Stmt::ForBegin(pos, header) => self.stmt_for_begin(*pos, header, resolver),

            Stmt::ForEnd(pos) => self.stmt_for_end(*pos),

            Stmt::DefBegin(pos, names, params) => {
                self.stmt_def_begin(*pos, names, params, resolver)
            }

            Stmt::DefEnd(pos) => self.stmt_def_end(*pos),

            Stmt::Return(pos, e) => self.stmt_return(*pos, e, resolver),

            Stmt::NamespaceBegin(pos, names) => {
                self.cur_pos = *pos;
                let pushed = self.sym.push_namespace(names).map_err(|m| (*pos, m))?;
                self.blocks.push(GBlock::Namespace { pushed });
                Ok(())
            }

            Stmt::NamespaceEnd(pos) => match self.blocks.pop() {
                Some(GBlock::Namespace { pushed }) => {
                    self.sym.pop_namespaces(pushed);
                    Ok(())
                }
                _ => Err((*pos, "unexpected end".to_string())),
            },

            Stmt::Using(pos, paths) => {
                for path in paths {
                    self.sym.using(path).map_err(|m| (*pos, m))?;
                }
                Ok(())
            }

            Stmt::Enum(pos, entries) => {
                let mut next = 0.0;
                for (name, expr) in entries {
                    let val = match expr {
                        Some(e) => self.const_eval(e).map_err(|m| (*pos, m))?,
                        None => next,
                    };
                    next = val + 1.0;
                    self.sym.add_enum(name, val).map_err(|m| (*pos, m))?;
                }
                Ok(())
            }

            Stmt::Declare(_, items) => self.stmt_declare(items),

            Stmt::Goto(pos, name) => {
                self.cur_pos = *pos;
                let lbl = self.sym.goto_label(name);
                self.emit_op(Op::Jump);
                self.emit_loc(lbl);
                Ok(())
            }

            Stmt::Label(pos, name) => {
                self.cur_pos = *pos;
                let lbl = self.sym.goto_label(name);
                if self.sym.label(lbl).pc.is_some() {
                    return Err((*pos, format!("duplicate label \"{}\"", name)));
                }
                self.place_label(lbl);
                Ok(())
            }

            Stmt::Include(pos, _) => Err((
                *pos,
                "include must be expanded before code generation".to_string(),
            )),
        }
    }

    // ========================================================================
    // STATEMENT LOWERING
    // ========================================================================

    fn stmt_if_cond(
        &mut self,
        pos: Pos,
        cond: &Expr,
        resolver: &mut dyn EmbedResolver,
    ) -> Result<(), GenErr> {
        self.cur_pos = pos;
        let (next, done, seen_cond) = match self.blocks.last() {
            Some(GBlock::If {
                next,
                done,
                seen_cond,
                ..
            }) => (*next, *done, *seen_cond),
            _ => return Err((pos, "unexpected condition".to_string())),
        };
        let next = if seen_cond {
            // Finish the previous branch: jump to done, land the old
            // false-target here, and make a fresh one.
            self.sym.pop_scope().map_err(|m| (pos, m))?;
            self.emit_op(Op::Jump);
            self.emit_loc(done);
            self.place_label(next);
            let fresh = self.sym.new_label("if_next");
            match self.blocks.last_mut() {
                Some(GBlock::If { next, .. }) => *next = fresh,
                _ => unreachable!(),
            }
            fresh
        } else {
            next
        };
        let t = self.eval_want(cond, resolver)?;
        self.emit_op(Op::JumpFalse);
        self.emit_var(t);
        self.emit_loc(next);
        self.sym.release_temp(t.level, t.index);
        self.sym.push_scope();
        match self.blocks.last_mut() {
            Some(GBlock::If { seen_cond, .. }) => *seen_cond = true,
            _ => unreachable!(),
        }
        Ok(())
    }

    fn stmt_var(
        &mut self,
        pos: Pos,
        items: &[Expr],
        resolver: &mut dyn EmbedResolver,
    ) -> Result<(), GenErr> {
        self.cur_pos = pos;
        for item in items {
            match item {
                Expr::Names(npos, names) => {
                    if names.len() != 1 {
                        return Err((*npos, "cannot declare a dotted name".to_string()));
                    }
                    let (level, index) =
                        self.sym.add_var(&names[0]).map_err(|m| (*npos, m))?;
                    self.emit_op(Op::Nil);
                    self.emit_var(VarRef { level, index });
                }
                Expr::Infix(_, KeySym::Equ, lhs, Some(rhs)) => {
                    self.declare_pattern_vars(lhs)?;
                    if let Expr::Names(_, names) = lhs.as_ref() {
                        if names.len() == 1 {
                            if let Some(NsName::Var { level, index }) = self.sym.lookup(names) {
                                self.eval(
                                    rhs,
                                    Purpose::Into(VarRef { level, index }),
                                    resolver,
                                )?;
                                continue;
                            }
                        }
                    }
                    let lv = self.lval_prepare(lhs, resolver)?;
                    let v = self.eval_want(rhs, resolver)?;
                    self.lval_set(&lv, v)?;
                    self.sym.release_temp(v.level, v.index);
                    self.lval_release(&lv);
                }
                other => {
                    return Err((other.pos(), "invalid variable declaration".to_string()))
                }
            }
        }
        Ok(())
    }

    /// Declare every name appearing in a `var` pattern.
    fn declare_pattern_vars(&mut self, pat: &Expr) -> Result<(), GenErr> {
        match pat {
            Expr::Names(pos, names) => {
                if names.len() != 1 {
                    return Err((*pos, "cannot declare a dotted name".to_string()));
                }
                self.sym.add_var(&names[0]).map_err(|m| (*pos, m))?;
                Ok(())
            }
            Expr::List(pos, inner) => match inner {
                Some(group) => {
                    for item in group.as_ref().clone().into_items() {
                        self.declare_pattern_vars(&item)?;
                    }
                    Ok(())
                }
                None => Err((*pos, "empty destructuring pattern".to_string())),
            },
            Expr::Prefix(_, KeySym::Period3, inner) => self.declare_pattern_vars(inner),
            Expr::Paren(_, inner) => self.declare_pattern_vars(inner),
            other => Err((other.pos(), "invalid variable declaration".to_string())),
        }
    }

    fn stmt_declare(&mut self, items: &[DeclareItem]) -> Result<(), GenErr> {
        for item in items {
            match &item.key {
                Some(key) => {
                    let hash = hash64(key);
                    self.sym
                        .add_native(&item.names, hash)
                        .map_err(|m| (item.pos, m))?;
                }
                None => {
                    if item.names.len() != 1 {
                        return Err((
                            item.pos,
                            "cannot forward-declare a dotted name".to_string(),
                        ));
                    }
                    self.sym
                        .declare_cmd(&item.names[0])
                        .map_err(|m| (item.pos, m))?;
                }
            }
        }

        Ok(())
    }

    fn stmt_def_begin(
        &mut self,
        pos: Pos,
        names: &[String],
        params: &[Expr],
        resolver: &mut dyn EmbedResolver,
    ) -> Result<(), GenErr> {
        self.cur_pos = pos;
        let lbl = self.sym.define_cmd(names).map_err(|m| (pos, m))?;
        let skip = self.sym.new_label("def_skip");
        self.emit_op(Op::Jump);
        self.emit_loc(skip);

        self.place_label(lbl);
        let hint = self.prog.add_debug_string(&names.join("."));
        let prev_hint = self.cur_hint;
        self.prog.add_cmd_hint(self.pc(), hint);
        self.cur_hint = hint;

        let level = self.sym.push_frame().map_err(|m| (pos, m))?;
        self.sym.push_scope();

        let mut restpos = 0xFFu8;
        let mut defaults: Vec<(VarRef, Expr)> = Vec::new();
        for (i, param) in params.iter().enumerate() {
            match param {
                Expr::Names(ppos, pnames) => {
                    if pnames.len() != 1 {
                        return Err((*ppos, "invalid parameter name".to_string()));
                    }
                    self.sym.add_var(&pnames[0]).map_err(|m| (*ppos, m))?;
                }
                Expr::Infix(_, KeySym::Equ, lhs, Some(dflt)) => match lhs.as_ref() {
                    Expr::Names(ppos, pnames) if pnames.len() == 1 => {
                        let (lv, ix) = self.sym.add_var(&pnames[0]).map_err(|m| (*ppos, m))?;
                        defaults.push((VarRef { level: lv, index: ix }, (**dflt).clone()));
                    }
                    other => return Err((other.pos(), "invalid parameter".to_string())),
                },
                Expr::Prefix(ppos, KeySym::Period3, inner) => {
                    if i != params.len() - 1 {
                        return Err((*ppos, "rest parameter must be last".to_string()));
                    }
                    match inner.as_ref() {
                        Expr::Names(_, pnames) if pnames.len() == 1 => {
                            self.sym.add_var(&pnames[0]).map_err(|m| (*ppos, m))?;
                            restpos = i as u8;
                        }
                        other => {
                            return Err((other.pos(), "invalid rest parameter".to_string()))
                        }
                    }
                }
                other => return Err((other.pos(), "invalid parameter".to_string())),
            }
        }

        self.emit_op(Op::CmdHead);
        self.prog.ops.push(level);
        self.prog.ops.push(restpos);

        // Defaults apply when the caller passed nil.
        for (slot, dflt) in defaults {
            let have = self.sym.new_label("dflt_done");
            self.emit_op(Op::JumpTrue);
            self.emit_var(slot);
            self.emit_loc(have);
            self.eval(&dflt, Purpose::Into(slot), resolver)?;
            self.place_label(have);
        }

        self.blocks.push(GBlock::Def { skip, prev_hint });
        Ok(())
    }

    fn stmt_def_end(&mut self, pos: Pos) -> Result<(), GenErr> {
        self.cur_pos = pos;
        match self.blocks.pop() {
            Some(GBlock::Def { skip, prev_hint }) => {
                // Implicit `return nil` for bodies that fall off the end.
                let (level, index) = self.sym.add_temp().map_err(|m| (pos, m))?;
                let t = VarRef { level, index };
                self.emit_op(Op::Nil);
                self.emit_var(t);
                self.emit_op(Op::Return);
                self.emit_var(t);
                self.sym.release_temp(level, index);

                self.sym.pop_scope().map_err(|m| (pos, m))?;
                self.sym.pop_frame().map_err(|m| (pos, m))?;
                self.place_label(skip);
                self.prog.add_cmd_hint(self.pc(), prev_hint);
                self.cur_hint = prev_hint;
                Ok(())
            }
            _ => Err((pos, "unexpected end".to_string())),
        }
    }

    fn stmt_return(
        &mut self,
        pos: Pos,
        e: &Expr,
        resolver: &mut dyn EmbedResolver,
    ) -> Result<(), GenErr> {
        self.cur_pos = pos;
        // Tail call: `return f ...` where f is a local command whose body
        // runs at this very frame level.
        if self.sym.level() > 0 {
            if let Expr::Call(_, cmd, params) = e {
                if let Expr::Names(_, names) = cmd.as_ref() {
                    if let Some(NsName::CmdLocal { level, lbl }) = self.sym.lookup(names) {
                        if level == self.sym.level() {
                            let args = self.eval_args(params, resolver)?;
                            self.emit_op(Op::ReturnTail);
                            self.emit_loc(lbl);
                            self.prog.ops.push(args.len() as u8);
                            for a in &args {
                                self.emit_var(*a);
                            }
                            for a in args {
                                self.sym.release_temp(a.level, a.index);
                            }
                            return Ok(());
                        }
                    }
                }
            }
        }
        let v = self.eval_want(e, resolver)?;
        self.emit_op(Op::Return);
        self.emit_var(v);
        self.sym.release_temp(v.level, v.index);
        Ok(())
    }

    fn stmt_for_begin(
        &mut self,
        pos: Pos,
        header: &ForHeader,
        resolver: &mut dyn EmbedResolver,
    ) -> Result<(), GenErr> {
        self.cur_pos = pos;
        self.sym.push_scope();

        // Bind the loop variables.
        let mut bind = |gen: &mut Gen, name: &str| -> Result<VarRef, GenErr> {
            if header.new_vars {
                let (level, index) = gen.sym.add_var(name).map_err(|m| (pos, m))?;
                Ok(VarRef { level, index })
            } else {
                match gen.sym.lookup(&[name.to_string()]) {
                    Some(NsName::Var { level, index }) => Ok(VarRef { level, index }),
                    _ => Err((pos, format!("undefined variable \"{}\"", name))),
                }
            }
        };
        let v = bind(self, &header.names[0])?;
        let idx_var = match header.names.get(1) {
            Some(name) => Some(bind(self, name)?),
            None => None,
        };

        // `for v: range ...` with a constant-signed step gets the counted
        // form; everything else materializes its iterand.
        if let Some((start, stop, step)) = self.match_range(&header.iter) {
            let step_val = match &step {
                None => Some(1.0),
                Some(Expr::Num(_, n)) => Some(*n),
                Some(_) => None,
            };
            if let Some(sv) = step_val {
                return self.for_counted(v, idx_var, start, stop, sv, resolver);
            }
        }
        self.for_generic(v, idx_var, &header.iter, resolver)
    }

    /// If the iterand is a direct call to the built-in `range`, return its
    /// 1-3 arguments as (start, stop, step).
    #[allow(clippy::type_complexity)]
    fn match_range(&self, iter: &Expr) -> Option<(Option<Expr>, Expr, Option<Expr>)> {
        let (cmd, params) = match iter {
            Expr::Call(_, cmd, params) => (cmd, params),
            _ => return None,
        };
        let names = match cmd.as_ref() {
            Expr::Names(_, names) => names,
            _ => return None,
        };
        match self.sym.lookup(names) {
            Some(NsName::CmdOpcode(OpCmd::Fixed(Op::Range, _))) => {}
            _ => return None,
        }
        let items = params.as_ref().clone().into_items();
        match items.len() {
            1 => Some((None, items[0].clone(), None)),
            2 => Some((Some(items[0].clone()), items[1].clone(), None)),
            3 => Some((
                Some(items[0].clone()),
                items[1].clone(),
                Some(items[2].clone()),
            )),
            _ => None,
        }
    }

    fn for_counted(
        &mut self,
        v: VarRef,
        idx_var: Option<VarRef>,
        start: Option<Expr>,
        stop: Expr,
        step: f64,
        resolver: &mut dyn EmbedResolver,
    ) -> Result<(), GenErr> {
        let pos = self.cur_pos;
        match start {
            Some(e) => {
                self.eval(&e, Purpose::Into(v), resolver)?;
            }
            None => {
                self.emit_op(Op::NumP8);
                self.emit_var(v);
                self.prog.ops.push(0);
            }
        }
        // The bound lives in a loop-owned temp so body writes to the
        // variables it came from cannot move the goalposts.
        let stop_t = self.alloc_temp(pos)?;
        self.eval(&stop, Purpose::Into(stop_t), resolver)?;
        let step_t = self.alloc_temp(pos)?;
        self.emit_num_const(step_t, step);
        let (one, idx) = match idx_var {
            Some(iv) => {
                let one = self.alloc_temp(pos)?;
                self.emit_num_const(one, 1.0);
                self.emit_op(Op::NumP8);
                self.emit_var(iv);
                self.prog.ops.push(0);
                (Some(one), Some(iv))
            }
            None => (None, None),
        };
        let t = self.alloc_temp(pos)?;

        let top = self.sym.new_label("for_top");
        let cont = self.sym.new_label("for_cont");
        let finish = self.sym.new_label("for_done");
        self.place_label(top);
        // `v < stop` counting up, `stop < v` counting down.
        let down = step < 0.0;
        self.emit_op(Op::Lt);
        self.emit_var(t);
        if down {
            self.emit_var(stop_t);
            self.emit_var(v);
        } else {
            self.emit_var(v);
            self.emit_var(stop_t);
        }
        self.emit_op(Op::JumpFalse);
        self.emit_var(t);
        self.emit_loc(finish);

        self.sym.set_loop_labels(finish, Some(cont));
        self.blocks.push(GBlock::For {
            top,
            cont,
            finish,
            kind: ForKind::Counted {
                v,
                stop: stop_t,
                step: step_t,
                idx,
                one,
                t,
                down,
            },
        });
        Ok(())
    }

    fn for_generic(
        &mut self,
        v: VarRef,
        idx_var: Option<VarRef>,
        iter: &Expr,
        resolver: &mut dyn EmbedResolver,
    ) -> Result<(), GenErr> {
        let pos = self.cur_pos;
        let lst = self.alloc_temp(pos)?;
        self.eval(iter, Purpose::Into(lst), resolver)?;
        let idx = match idx_var {
            Some(iv) => iv,
            None => self.alloc_temp(pos)?,
        };
        self.emit_op(Op::NumP8);
        self.emit_var(idx);
        self.prog.ops.push(0);
        let one = self.alloc_temp(pos)?;
        self.emit_num_const(one, 1.0);
        let sz = self.alloc_temp(pos)?;
        let t = self.alloc_temp(pos)?;

        let top = self.sym.new_label("for_top");
        let cont = self.sym.new_label("for_cont");
        let finish = self.sym.new_label("for_done");
        self.place_label(top);
        // The size is re-read every pass so the loop sees growth.
        self.emit_op(Op::Size);
        self.emit_var(sz);
        self.emit_var(lst);
        self.emit_op(Op::Lt);
        self.emit_var(t);
        self.emit_var(idx);
        self.emit_var(sz);
        self.emit_op(Op::JumpFalse);
        self.emit_var(t);
        self.emit_loc(finish);
        self.emit_op(Op::GetAt);
        self.emit_var(v);
        self.emit_var(lst);
        self.emit_var(idx);

        self.sym.set_loop_labels(finish, Some(cont));
        self.blocks.push(GBlock::For {
            top,
            cont,
            finish,
            kind: ForKind::Generic {
                lst,
                idx,
                sz,
                t,
                one,
            },
        });
        Ok(())
    }

    fn stmt_for_end(&mut self, pos: Pos) -> Result<(), GenErr> {
        self.cur_pos = pos;
        match self.blocks.pop() {
            Some(GBlock::For {
                top,
                cont,
                finish,
                kind,
            }) => {
                self.place_label(cont);
                match &kind {
                    ForKind::Counted {
                        v,
                        stop,
                        step,
                        idx,
                        one,
                        t,
                        ..
                    } => {
                        self.emit_op(Op::Add);
                        self.emit_var(*v);
                        self.emit_var(*v);
                        self.emit_var(*step);
                        if let (Some(idx), Some(one)) = (idx, one) {
                            self.emit_op(Op::Add);
                            self.emit_var(*idx);
                            self.emit_var(*idx);
                            self.emit_var(*one);
                        }
                        self.emit_op(Op::Jump);
                        self.emit_loc(top);
                        self.place_label(finish);
                        for r in [Some(*stop), Some(*step), *one, Some(*t)].into_iter().flatten() {
                            self.sym.release_temp(r.level, r.index);
                        }
                    }
                    ForKind::Generic {
                        lst,
                        idx,
                        sz,
                        t,
                        one,
                    } => {
                        self.emit_op(Op::Add);
                        self.emit_var(*idx);
                        self.emit_var(*idx);
                        self.emit_var(*one);
                        self.emit_op(Op::Jump);
                        self.emit_loc(top);
                        self.place_label(finish);
                        for r in [*lst, *idx, *sz, *t, *one] {
                            self.sym.release_temp(r.level, r.index);
                        }
                    }
                }
                self.sym.pop_scope().map_err(|m| (pos, m))?;
                Ok(())
            }
            _ => Err((pos, "unexpected end".to_string())),
        }
    }
}

#[cfg(test)]
mod tests;
