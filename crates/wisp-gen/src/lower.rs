//! Expression and lvalue lowering.
//!
//! Evaluation threads a [`Purpose`] through the tree. `Empty` evaluates
//! for side effects only, `Create` yields a value in a fresh temporary
//! (or, for a plain variable read, the variable's own slot with no copy),
//! and `Into` steers the result into a pre-allocated slot. Temporaries are
//! released as soon as their enclosing expression is done with them so
//! the frame's slot count stays at the true high-water mark.

use crate::{EmbedResolver, Gen, GenErr};
use wisp_lex::KeySym;
use wisp_par::Expr;
use wisp_prog::{Op, OpCmd, OpParams, LOC_SENTINEL};
use wisp_sym::{LblIdx, NsName};
use wisp_util::{hash64, hash_words, Pos};

/// A register reference: frame level + slot index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VarRef {
    pub level: u8,
    pub index: u8,
}

/// What the caller wants from an evaluation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Purpose {
    /// Result discarded; side effects only.
    Empty,
    /// Result in a caller-released temporary (or aliased variable slot).
    Create,
    /// Result written into this slot.
    Into(VarRef),
}

/// An assignment target, prepared once and then read and/or written.
pub(crate) enum LVal {
    Var(VarRef),
    Index { obj: VarRef, key: VarRef },
    Slice { obj: VarRef, start: VarRef, len: VarRef },
    List { items: Vec<LVal>, rest: Option<Box<LVal>> },
}

impl Gen {
    // ========================================================================
    // EMIT HELPERS
    // ========================================================================

    pub(crate) fn pc(&self) -> u32 {
        self.prog.ops.len() as u32
    }

    /// Append an opcode byte, recording the current source position.
    pub(crate) fn emit_op(&mut self, op: Op) {
        let file = self.file_index(self.cur_pos.file);
        let pos = self.cur_pos;
        self.prog.add_pos(self.pc(), pos.line, pos.chr, file);
        self.prog.ops.push(op as u8);
    }

    pub(crate) fn emit_var(&mut self, v: VarRef) {
        self.prog.ops.push(v.level);
        self.prog.ops.push(v.index);
    }

    /// Append a jump location, patched now or queued on the label.
    pub(crate) fn emit_loc(&mut self, lbl: LblIdx) {
        let at = self.prog.ops.len();
        match self.sym.label(lbl).pc {
            Some(pc) => self.prog.ops.extend_from_slice(&pc.to_le_bytes()),
            None => {
                self.prog.ops.extend_from_slice(&LOC_SENTINEL.to_le_bytes());
                self.sym.label_mut(lbl).rewrites.push(at);
            }
        }
    }

    /// Declare a label at the current pc and patch queued references.
    pub(crate) fn place_label(&mut self, lbl: LblIdx) {
        let pc = self.pc();
        let label = self.sym.label_mut(lbl);
        label.pc = Some(pc);
        let sites = std::mem::take(&mut label.rewrites);
        for at in sites {
            self.prog.write_loc(at, pc);
        }
    }

    pub(crate) fn alloc_temp(&mut self, pos: Pos) -> Result<VarRef, GenErr> {
        let (level, index) = self.sym.add_temp().map_err(|m| (pos, m))?;
        Ok(VarRef { level, index })
    }

    fn release(&mut self, v: VarRef) {
        self.sym.release_temp(v.level, v.index);
    }

    /// Load a numeric constant, using the short byte forms when possible.
    pub(crate) fn emit_num_const(&mut self, t: VarRef, n: f64) {
        if n.fract() == 0.0 && (0.0..=255.0).contains(&n) {
            self.emit_op(Op::NumP8);
            self.emit_var(t);
            self.prog.ops.push(n as u8);
        } else if n.fract() == 0.0 && (-255.0..=-1.0).contains(&n) {
            self.emit_op(Op::NumN8);
            self.emit_var(t);
            self.prog.ops.push((-n) as u8);
        } else {
            self.emit_op(Op::Num);
            self.emit_var(t);
            self.prog.ops.extend_from_slice(&n.to_le_bytes());
        }
    }

    /// Resolve the purpose into a concrete slot. Returns the slot and
    /// whether it is a temporary this call allocated.
    fn target(&mut self, purpose: Purpose, pos: Pos) -> Result<(VarRef, bool), GenErr> {
        match purpose {
            Purpose::Into(v) => Ok((v, false)),
            Purpose::Create | Purpose::Empty => Ok((self.alloc_temp(pos)?, true)),
        }
    }

    /// Wrap up a value-producing evaluation: `Empty` releases the temp.
    fn deliver(&mut self, t: VarRef, purpose: Purpose) -> Option<VarRef> {
        match purpose {
            Purpose::Empty => {
                self.release(t);
                None
            }
            _ => Some(t),
        }
    }

    /// Accumulator for lowerings that write the slot before their operands
    /// finish reading (list builds, short-circuit chains). Always a fresh
    /// temp; [`Gen::deliver_accum`] moves it into an `Into` target.
    fn accum(&mut self, pos: Pos) -> Result<VarRef, GenErr> {
        self.alloc_temp(pos)
    }

    fn deliver_accum(&mut self, t: VarRef, purpose: Purpose) -> Option<VarRef> {
        match purpose {
            Purpose::Empty => {
                self.release(t);
                None
            }
            Purpose::Create => Some(t),
            Purpose::Into(dst) => {
                if dst != t {
                    self.emit_op(Op::Move);
                    self.emit_var(dst);
                    self.emit_var(t);
                }
                self.release(t);
                Some(dst)
            }
        }
    }

    // ========================================================================
    // EVALUATION
    // ========================================================================

    /// Evaluate for a value; always yields a slot.
    pub(crate) fn eval_want(
        &mut self,
        e: &Expr,
        resolver: &mut dyn EmbedResolver,
    ) -> Result<VarRef, GenErr> {
        match self.eval(e, Purpose::Create, resolver)? {
            Some(v) => Ok(v),
            None => Err((e.pos(), "expression has no value".to_string())),
        }
    }

    pub(crate) fn eval(
        &mut self,
        e: &Expr,
        purpose: Purpose,
        resolver: &mut dyn EmbedResolver,
    ) -> Result<Option<VarRef>, GenErr> {
        self.cur_pos = e.pos();
        match e {
            Expr::Nil(pos) => match purpose {
                Purpose::Empty => Ok(None),
                _ => {
                    let (t, _) = self.target(purpose, *pos)?;
                    self.emit_op(Op::Nil);
                    self.emit_var(t);
                    Ok(Some(t))
                }
            },

            Expr::Num(pos, n) => match purpose {
                Purpose::Empty => Ok(None),
                _ => {
                    let (t, _) = self.target(purpose, *pos)?;
                    self.emit_num_const(t, *n);
                    Ok(Some(t))
                }
            },

            Expr::Str(pos, s) => match purpose {
                Purpose::Empty => Ok(None),
                _ => {
                    let (t, _) = self.target(purpose, *pos)?;
                    let idx = self.prog.add_string(s.clone());
                    self.emit_op(Op::Str);
                    self.emit_var(t);
                    self.prog.ops.extend_from_slice(&idx.to_le_bytes());
                    Ok(Some(t))
                }
            },

            Expr::List(pos, inner) => {
                let items = match inner {
                    Some(g) => g.as_ref().clone().into_items(),
                    None => Vec::new(),
                };
                if purpose == Purpose::Empty {
                    for item in &items {
                        self.eval(item, Purpose::Empty, resolver)?;
                    }
                    return Ok(None);
                }
                // Built in an accumulator: the items may read the slot an
                // `Into` purpose targets (`x = {x, 1}`).
                let t = self.accum(*pos)?;
                self.emit_op(Op::List);
                self.emit_var(t);
                self.prog.ops.push(items.len().min(255) as u8);
                for item in &items {
                    let iv = self.eval_want(item, resolver)?;
                    self.cur_pos = item.pos();
                    self.emit_op(Op::ListPush);
                    self.emit_var(t);
                    self.emit_var(t);
                    self.emit_var(iv);
                    self.release(iv);
                }
                Ok(self.deliver_accum(t, purpose))
            }

            Expr::Names(pos, names) => match self.sym.lookup(names) {
                Some(NsName::Var { level, index }) => {
                    let src = VarRef { level, index };
                    match purpose {
                        Purpose::Empty => Ok(None),
                        Purpose::Create => Ok(Some(src)),
                        Purpose::Into(t) => {
                            if t != src {
                                self.emit_op(Op::Move);
                                self.emit_var(t);
                                self.emit_var(src);
                            }
                            Ok(Some(t))
                        }
                    }
                }
                Some(NsName::EnumVal(n)) => self.eval(&Expr::Num(*pos, n), purpose, resolver),
                Some(
                    NsName::CmdLocal { .. } | NsName::CmdNative(_) | NsName::CmdOpcode(_),
                ) => {
                    // Bare command name: call with no arguments.
                    self.eval_call(*pos, e, &[], purpose, resolver)
                }
                Some(NsName::Sub(_)) => Err((
                    *pos,
                    format!("cannot use namespace \"{}\" as a value", names.join(".")),
                )),
                None => Err((*pos, format!("undefined name \"{}\"", names.join(".")))),
            },

            Expr::Paren(_, inner) => self.eval(inner, purpose, resolver),

            Expr::Group(_, items) => {
                let mut result = None;
                for (i, item) in items.iter().enumerate() {
                    if i + 1 == items.len() {
                        result = self.eval(item, purpose, resolver)?;
                    } else {
                        self.eval(item, Purpose::Empty, resolver)?;
                    }
                }
                Ok(result)
            }

            Expr::Cat(pos, items) => {
                let (t, _) = self.target(purpose, *pos)?;
                let mut args = Vec::with_capacity(items.len());
                for item in items {
                    args.push(self.eval_want(item, resolver)?);
                }
                self.cur_pos = *pos;
                self.emit_op(Op::Cat);
                self.emit_var(t);
                self.prog.ops.push(args.len() as u8);
                for a in &args {
                    self.emit_var(*a);
                }
                for a in args {
                    self.release(a);
                }
                Ok(self.deliver(t, purpose))
            }

            Expr::Prefix(pos, ks, inner) => {
                let op = match ks {
                    KeySym::UnMinus => Op::Neg,
                    KeySym::UnPlus => Op::ToNum,
                    KeySym::Bang => Op::Not,
                    KeySym::Amp => Op::Size,
                    KeySym::Period3 => {
                        return Err((
                            *pos,
                            "\"...\" is only allowed in assignment targets".to_string(),
                        ))
                    }
                    other => {
                        return Err((*pos, format!("invalid prefix operator \"{}\"", other.name())))
                    }
                };
                let (t, _) = self.target(purpose, *pos)?;
                let iv = self.eval_want(inner, resolver)?;
                self.cur_pos = *pos;
                self.emit_op(op);
                self.emit_var(t);
                self.emit_var(iv);
                self.release(iv);
                Ok(self.deliver(t, purpose))
            }

            Expr::Infix(pos, ks, lhs, rhs) => self.eval_infix(*pos, *ks, lhs, rhs.as_deref(), purpose, resolver),

            Expr::Call(pos, cmd, params) => {
                let items = params.as_ref().clone().into_items();
                self.eval_call(*pos, cmd, &items, purpose, resolver)
            }

            Expr::Index(pos, obj, key) => {
                let (t, _) = self.target(purpose, *pos)?;
                let ov = self.eval_want(obj, resolver)?;
                let kv = self.eval_want(key, resolver)?;
                self.cur_pos = *pos;
                self.emit_op(Op::GetAt);
                self.emit_var(t);
                self.emit_var(ov);
                self.emit_var(kv);
                self.release(ov);
                self.release(kv);
                Ok(self.deliver(t, purpose))
            }

            Expr::Slice(pos, obj, start, len) => {
                let (t, _) = self.target(purpose, *pos)?;
                let ov = self.eval_want(obj, resolver)?;
                let sv = self.eval_opt_nil(start.as_deref(), *pos, resolver)?;
                let lv = self.eval_opt_nil(len.as_deref(), *pos, resolver)?;
                self.cur_pos = *pos;
                self.emit_op(Op::Slice);
                self.emit_var(t);
                self.emit_var(ov);
                self.emit_var(sv);
                self.emit_var(lv);
                self.release(ov);
                self.release(sv);
                self.release(lv);
                Ok(self.deliver(t, purpose))
            }
        }
    }

    /// Evaluate an optional expression, loading nil when absent.
    fn eval_opt_nil(
        &mut self,
        e: Option<&Expr>,
        pos: Pos,
        resolver: &mut dyn EmbedResolver,
    ) -> Result<VarRef, GenErr> {
        match e {
            Some(e) => self.eval_want(e, resolver),
            None => {
                let t = self.alloc_temp(pos)?;
                self.emit_op(Op::Nil);
                self.emit_var(t);
                Ok(t)
            }
        }
    }

    fn eval_infix(
        &mut self,
        pos: Pos,
        ks: KeySym,
        lhs: &Expr,
        rhs: Option<&Expr>,
        purpose: Purpose,
        resolver: &mut dyn EmbedResolver,
    ) -> Result<Option<VarRef>, GenErr> {
        // Assignments.
        if matches!(
            ks,
            KeySym::Equ
                | KeySym::PlusEqu
                | KeySym::MinusEqu
                | KeySym::StarEqu
                | KeySym::SlashEqu
                | KeySym::PercentEqu
                | KeySym::CaretEqu
                | KeySym::TildeEqu
                | KeySym::Amp2Equ
                | KeySym::Pipe2Equ
        ) {
            let rhs = rhs.ok_or((pos, "missing assignment value".to_string()))?;
            return self.eval_assign(pos, ks, lhs, rhs, purpose, resolver);
        }

        let rhs = rhs.ok_or((pos, "missing operand".to_string()))?;

        // Short-circuit logic: && yields the deciding operand, as does ||.
        // Accumulated in a temp so the right side may read an `Into`
        // target before the result lands in it.
        if ks == KeySym::Amp2 || ks == KeySym::Pipe2 {
            let t = self.accum(pos)?;
            let done = self.sym.new_label("sc_done");
            self.eval(lhs, Purpose::Into(t), resolver)?;
            self.cur_pos = pos;
            self.emit_op(if ks == KeySym::Amp2 {
                Op::JumpFalse
            } else {
                Op::JumpTrue
            });
            self.emit_var(t);
            self.emit_loc(done);
            self.eval(rhs, Purpose::Into(t), resolver)?;
            self.place_label(done);
            return Ok(self.deliver_accum(t, purpose));
        }

        // `>` and `>=` swap operands and reuse `<` / `<=`.
        let (op, swap) = match ks {
            KeySym::Plus => (Op::Add, false),
            KeySym::Minus => (Op::Sub, false),
            KeySym::Star => (Op::Mul, false),
            KeySym::Slash => (Op::Div, false),
            KeySym::Percent => (Op::Mod, false),
            KeySym::Caret => (Op::Pow, false),
            KeySym::Lt => (Op::Lt, false),
            KeySym::LtEqu => (Op::LtEqu, false),
            KeySym::Gt => (Op::Lt, true),
            KeySym::GtEqu => (Op::LtEqu, true),
            KeySym::Equ2 => (Op::Equ, false),
            KeySym::BangEqu => (Op::Neq, false),
            other => {
                return Err((pos, format!("invalid operator \"{}\"", other.name())));
            }
        };
        let (t, _) = self.target(purpose, pos)?;
        let lv = self.eval_want(lhs, resolver)?;
        let rv = self.eval_want(rhs, resolver)?;
        self.cur_pos = pos;
        self.emit_op(op);
        self.emit_var(t);
        if swap {
            self.emit_var(rv);
            self.emit_var(lv);
        } else {
            self.emit_var(lv);
            self.emit_var(rv);
        }
        self.release(lv);
        self.release(rv);
        Ok(self.deliver(t, purpose))
    }

    // ========================================================================
    // ASSIGNMENT
    // ========================================================================

    fn eval_assign(
        &mut self,
        pos: Pos,
        ks: KeySym,
        lhs: &Expr,
        rhs: &Expr,
        purpose: Purpose,
        resolver: &mut dyn EmbedResolver,
    ) -> Result<Option<VarRef>, GenErr> {
        if ks == KeySym::Equ {
            // Straight store into a variable goes direct, no copy.
            if let Expr::Names(npos, names) = lhs {
                match self.sym.lookup(names) {
                    Some(NsName::Var { level, index }) => {
                        let dst = VarRef { level, index };
                        self.eval(rhs, Purpose::Into(dst), resolver)?;
                        return Ok(match purpose {
                            Purpose::Empty => None,
                            Purpose::Create => Some(dst),
                            Purpose::Into(t) => {
                                if t != dst {
                                    self.emit_op(Op::Move);
                                    self.emit_var(t);
                                    self.emit_var(dst);
                                }
                                Some(t)
                            }
                        });
                    }
                    Some(_) => {
                        return Err((*npos, format!("cannot assign to \"{}\"", names.join("."))))
                    }
                    None => {
                        return Err((
                            *npos,
                            format!("undefined variable \"{}\"", names.join(".")),
                        ))
                    }
                }
            }
            let lv = self.lval_prepare(lhs, resolver)?;
            let v = self.eval_want(rhs, resolver)?;
            self.lval_set(&lv, v)?;
            self.lval_release(&lv);
            return Ok(self.finish_assign(v, purpose));
        }

        let lv = self.lval_prepare(lhs, resolver)?;
        let t = self.alloc_temp(pos)?;

        if ks == KeySym::Amp2Equ || ks == KeySym::Pipe2Equ {
            // Conditional set: evaluate the RHS only when the current
            // value decides it.
            let done = self.sym.new_label("cset_done");
            self.lval_get(&lv, t)?;
            self.cur_pos = pos;
            self.emit_op(if ks == KeySym::Amp2Equ {
                Op::JumpFalse
            } else {
                Op::JumpTrue
            });
            self.emit_var(t);
            self.emit_loc(done);
            self.eval(rhs, Purpose::Into(t), resolver)?;
            self.lval_set(&lv, t)?;
            self.place_label(done);
            self.lval_release(&lv);
            return Ok(self.finish_assign(t, purpose));
        }

        let op = match ks {
            KeySym::PlusEqu => Op::Add,
            KeySym::MinusEqu => Op::Sub,
            KeySym::StarEqu => Op::Mul,
            KeySym::SlashEqu => Op::Div,
            KeySym::PercentEqu => Op::Mod,
            KeySym::CaretEqu => Op::Pow,
            KeySym::TildeEqu => Op::Cat,
            _ => unreachable!("non-assignment key in eval_assign"),
        };
        self.lval_get(&lv, t)?;
        let rv = self.eval_want(rhs, resolver)?;
        self.cur_pos = pos;
        if op == Op::Cat {
            self.emit_op(Op::Cat);
            self.emit_var(t);
            self.prog.ops.push(2);
            self.emit_var(t);
            self.emit_var(rv);
        } else {
            self.emit_op(op);
            self.emit_var(t);
            self.emit_var(t);
            self.emit_var(rv);
        }
        self.release(rv);
        self.lval_set(&lv, t)?;
        self.lval_release(&lv);
        Ok(self.finish_assign(t, purpose))
    }

    /// Deliver an assignment's value (held in `v`, usually a temp).
    fn finish_assign(&mut self, v: VarRef, purpose: Purpose) -> Option<VarRef> {
        match purpose {
            Purpose::Empty => {
                self.release(v);
                None
            }
            Purpose::Create => Some(v),
            Purpose::Into(t) => {
                if t != v {
                    self.emit_op(Op::Move);
                    self.emit_var(t);
                    self.emit_var(v);
                    self.release(v);
                }
                Some(t)
            }
        }
    }

    // ========================================================================
    // LVALUES
    // ========================================================================

    pub(crate) fn lval_prepare(
        &mut self,
        e: &Expr,
        resolver: &mut dyn EmbedResolver,
    ) -> Result<LVal, GenErr> {
        match e {
            Expr::Names(pos, names) => match self.sym.lookup(names) {
                Some(NsName::Var { level, index }) => Ok(LVal::Var(VarRef { level, index })),
                Some(_) => Err((*pos, format!("cannot assign to \"{}\"", names.join(".")))),
                None => Err((*pos, format!("undefined variable \"{}\"", names.join(".")))),
            },
            Expr::Paren(_, inner) => self.lval_prepare(inner, resolver),
            Expr::Index(_, obj, key) => {
                let obj = self.eval_want(obj, resolver)?;
                let key = self.eval_want(key, resolver)?;
                Ok(LVal::Index { obj, key })
            }
            Expr::Slice(pos, obj, start, len) => {
                let obj = self.eval_want(obj, resolver)?;
                let start = self.eval_opt_nil(start.as_deref(), *pos, resolver)?;
                let len = self.eval_opt_nil(len.as_deref(), *pos, resolver)?;
                Ok(LVal::Slice { obj, start, len })
            }
            Expr::List(pos, inner) => {
                let items = match inner {
                    Some(g) => g.as_ref().clone().into_items(),
                    None => {
                        return Err((*pos, "empty destructuring pattern".to_string()));
                    }
                };
                let mut targets = Vec::new();
                let mut rest = None;
                for (i, item) in items.iter().enumerate() {
                    if let Expr::Prefix(ppos, KeySym::Period3, inner) = item {
                        if i != items.len() - 1 {
                            return Err((*ppos, "rest target must be last".to_string()));
                        }
                        rest = Some(Box::new(self.lval_prepare(inner, resolver)?));
                    } else {
                        targets.push(self.lval_prepare(item, resolver)?);
                    }
                }
                Ok(LVal::List {
                    items: targets,
                    rest,
                })
            }
            other => Err((other.pos(), "invalid assignment target".to_string())),
        }
    }

    /// Read the current value of an lvalue into `t`.
    pub(crate) fn lval_get(&mut self, lv: &LVal, t: VarRef) -> Result<(), GenErr> {
        match lv {
            LVal::Var(src) => {
                if *src != t {
                    self.emit_op(Op::Move);
                    self.emit_var(t);
                    self.emit_var(*src);
                }
                Ok(())
            }
            LVal::Index { obj, key } => {
                self.emit_op(Op::GetAt);
                self.emit_var(t);
                self.emit_var(*obj);
                self.emit_var(*key);
                Ok(())
            }
            LVal::Slice { obj, start, len } => {
                self.emit_op(Op::Slice);
                self.emit_var(t);
                self.emit_var(*obj);
                self.emit_var(*start);
                self.emit_var(*len);
                Ok(())
            }
            LVal::List { .. } => Err((
                self.cur_pos,
                "cannot compound-assign a destructuring pattern".to_string(),
            )),
        }
    }

    /// Store `v` through an lvalue.
    pub(crate) fn lval_set(&mut self, lv: &LVal, v: VarRef) -> Result<(), GenErr> {
        match lv {
            LVal::Var(dst) => {
                if *dst != v {
                    self.emit_op(Op::Move);
                    self.emit_var(*dst);
                    self.emit_var(v);
                }
                Ok(())
            }
            LVal::Index { obj, key } => {
                self.emit_op(Op::SetAt);
                self.emit_var(*obj);
                self.emit_var(*key);
                self.emit_var(v);
                Ok(())
            }
            LVal::Slice { obj, start, len } => {
                self.emit_op(Op::Splice);
                self.emit_var(*obj);
                self.emit_var(*start);
                self.emit_var(*len);
                self.emit_var(v);
                Ok(())
            }
            LVal::List { items, rest } => {
                let pos = self.cur_pos;
                for (i, item) in items.iter().enumerate() {
                    let kt = self.alloc_temp(pos)?;
                    self.emit_num_const(kt, i as f64);
                    let vt = self.alloc_temp(pos)?;
                    self.emit_op(Op::GetAt);
                    self.emit_var(vt);
                    self.emit_var(v);
                    self.emit_var(kt);
                    self.lval_set(item, vt)?;
                    self.release(vt);
                    self.release(kt);
                }
                if let Some(rest) = rest {
                    let st = self.alloc_temp(pos)?;
                    self.emit_num_const(st, items.len() as f64);
                    let ln = self.alloc_temp(pos)?;
                    self.emit_op(Op::Nil);
                    self.emit_var(ln);
                    let vt = self.alloc_temp(pos)?;
                    self.emit_op(Op::Slice);
                    self.emit_var(vt);
                    self.emit_var(v);
                    self.emit_var(st);
                    self.emit_var(ln);
                    self.lval_set(rest, vt)?;
                    self.release(vt);
                    self.release(ln);
                    self.release(st);
                }
                Ok(())
            }
        }
    }

    pub(crate) fn lval_release(&mut self, lv: &LVal) {
        match lv {
            LVal::Var(_) => {}
            LVal::Index { obj, key } => {
                self.release(*obj);
                self.release(*key);
            }
            LVal::Slice { obj, start, len } => {
                self.release(*obj);
                self.release(*start);
                self.release(*len);
            }
            LVal::List { items, rest } => {
                for item in items {
                    self.lval_release(item);
                }
                if let Some(rest) = rest {
                    self.lval_release(rest);
                }
            }
        }
    }

    // ========================================================================
    // CALLS
    // ========================================================================

    pub(crate) fn eval_args(
        &mut self,
        params: &Expr,
        resolver: &mut dyn EmbedResolver,
    ) -> Result<Vec<VarRef>, GenErr> {
        let items = params.clone().into_items();
        let mut args = Vec::with_capacity(items.len());
        for item in &items {
            args.push(self.eval_want(item, resolver)?);
        }
        if args.len() > 255 {
            return Err((params.pos(), "too many arguments".to_string()));
        }
        Ok(args)
    }

    fn eval_call(
        &mut self,
        pos: Pos,
        cmd: &Expr,
        args: &[Expr],
        purpose: Purpose,
        resolver: &mut dyn EmbedResolver,
    ) -> Result<Option<VarRef>, GenErr> {
        let names = match cmd {
            Expr::Names(_, names) => names,
            other => return Err((other.pos(), "cannot call this expression".to_string())),
        };

        match self.sym.lookup(names) {
            Some(NsName::CmdOpcode(oc)) => {
                self.eval_opcmd(pos, names, oc, args, purpose, resolver)
            }
            Some(NsName::CmdLocal { lbl, .. }) => {
                let argv = self.eval_args_slice(args, resolver)?;
                let (t, _) = self.target(purpose, pos)?;
                self.cur_pos = pos;
                self.emit_op(Op::Call);
                self.emit_var(t);
                self.emit_loc(lbl);
                self.prog.ops.push(argv.len() as u8);
                for a in &argv {
                    self.emit_var(*a);
                }
                for a in argv {
                    self.release(a);
                }
                Ok(self.deliver(t, purpose))
            }
            Some(NsName::CmdNative(hash)) => self.emit_native(pos, hash, args, purpose, resolver),
            Some(NsName::Var { .. } | NsName::EnumVal(_)) => Err((
                pos,
                format!("\"{}\" is not a command", names.join(".")),
            )),
            Some(NsName::Sub(_)) => Err((
                pos,
                format!("cannot call namespace \"{}\"", names.join(".")),
            )),
            None => {
                // Forward reference to a host command: the hash is seeded
                // with the auto-native prefix.
                let hash = hash64(format!("autonative.{}", names.join(".")).as_bytes());
                self.emit_native(pos, hash, args, purpose, resolver)
            }
        }
    }

    fn eval_args_slice(
        &mut self,
        args: &[Expr],
        resolver: &mut dyn EmbedResolver,
    ) -> Result<Vec<VarRef>, GenErr> {
        let mut argv = Vec::with_capacity(args.len());
        for a in args {
            argv.push(self.eval_want(a, resolver)?);
        }
        Ok(argv)
    }

    fn emit_native(
        &mut self,
        pos: Pos,
        hash: u64,
        args: &[Expr],
        purpose: Purpose,
        resolver: &mut dyn EmbedResolver,
    ) -> Result<Option<VarRef>, GenErr> {
        let argv = self.eval_args_slice(args, resolver)?;
        let key = self.prog.add_key(hash);
        let (t, _) = self.target(purpose, pos)?;
        self.cur_pos = pos;
        self.emit_op(Op::Native);
        self.emit_var(t);
        self.prog.ops.extend_from_slice(&key.to_le_bytes());
        self.prog.ops.push(argv.len() as u8);
        for a in &argv {
            self.emit_var(*a);
        }
        for a in argv {
            self.release(a);
        }
        Ok(self.deliver(t, purpose))
    }

    fn eval_opcmd(
        &mut self,
        pos: Pos,
        names: &[String],
        oc: OpCmd,
        args: &[Expr],
        purpose: Purpose,
        resolver: &mut dyn EmbedResolver,
    ) -> Result<Option<VarRef>, GenErr> {
        match oc {
            OpCmd::Pick => {
                if args.is_empty() || args.len() > 3 {
                    return Err((pos, "pick expects 1 to 3 arguments".to_string()));
                }
                let (t, _) = self.target(purpose, pos)?;
                let lfalse = self.sym.new_label("pick_false");
                let ldone = self.sym.new_label("pick_done");
                let c = self.eval_want(&args[0], resolver)?;
                self.cur_pos = pos;
                self.emit_op(Op::JumpFalse);
                self.emit_var(c);
                self.emit_loc(lfalse);
                self.release(c);
                match args.get(1) {
                    Some(e) => {
                        self.eval(e, Purpose::Into(t), resolver)?;
                    }
                    None => {
                        self.emit_op(Op::Nil);
                        self.emit_var(t);
                    }
                }
                self.emit_op(Op::Jump);
                self.emit_loc(ldone);
                self.place_label(lfalse);
                match args.get(2) {
                    Some(e) => {
                        self.eval(e, Purpose::Into(t), resolver)?;
                    }
                    None => {
                        self.emit_op(Op::Nil);
                        self.emit_var(t);
                    }
                }
                self.place_label(ldone);
                Ok(self.deliver(t, purpose))
            }

            OpCmd::Embed => {
                let path = match args {
                    [Expr::Str(_, path)] => path.clone(),
                    _ => {
                        return Err((
                            pos,
                            "embed expects one literal file path".to_string(),
                        ))
                    }
                };
                let bytes = resolver.read(&path).ok_or_else(|| {
                    (
                        pos,
                        format!("cannot embed \"{}\"", String::from_utf8_lossy(&path)),
                    )
                })?;
                self.eval(&Expr::Str(pos, bytes), purpose, resolver)
            }

            OpCmd::IsNative => {
                let known = match args {
                    [Expr::Names(_, cnames)] => match self.sym.lookup(cnames) {
                        Some(NsName::CmdNative(hash)) => self.has_native(hash),
                        None => {
                            let hash = hash64(
                                format!("autonative.{}", cnames.join(".")).as_bytes(),
                            );
                            self.has_native(hash)
                        }
                        Some(_) => false,
                    },
                    _ => return Err((pos, "isnative expects a command name".to_string())),
                };
                if purpose == Purpose::Empty {
                    return Ok(None);
                }
                let (t, _) = self.target(purpose, pos)?;
                if known {
                    self.emit_num_const(t, 1.0);
                } else {
                    self.emit_op(Op::Nil);
                    self.emit_var(t);
                }
                Ok(Some(t))
            }

            OpCmd::Fixed(op, arity) => {
                // str.hash of two literals folds at compile time.
                if op == Op::StrHash {
                    if let Some(folded) = self.try_const_hash(pos, args, purpose)? {
                        return Ok(folded);
                    }
                }
                if args.len() > arity as usize {
                    return Err((
                        pos,
                        format!(
                            "\"{}\" expects at most {} argument{}",
                            names.join("."),
                            arity,
                            if arity == 1 { "" } else { "s" }
                        ),
                    ));
                }
                let mut argv = self.eval_args_slice(args, resolver)?;
                while argv.len() < arity as usize {
                    let t = self.alloc_temp(pos)?;
                    self.emit_op(Op::Nil);
                    self.emit_var(t);
                    argv.push(t);
                }
                let (t, _) = self.target(purpose, pos)?;
                self.cur_pos = pos;
                self.emit_op(op);
                self.emit_var(t);
                for a in &argv {
                    self.emit_var(*a);
                }
                for a in argv {
                    self.release(a);
                }
                Ok(self.deliver(t, purpose))
            }

            OpCmd::Variadic(op) => {
                let argv = self.eval_args_slice(args, resolver)?;
                match op.params() {
                    OpParams::VArgs => {
                        let (t, _) = self.target(purpose, pos)?;
                        self.cur_pos = pos;
                        self.emit_op(op);
                        self.emit_var(t);
                        self.prog.ops.push(argv.len() as u8);
                        for a in &argv {
                            self.emit_var(*a);
                        }
                        for a in argv {
                            self.release(a);
                        }
                        Ok(self.deliver(t, purpose))
                    }
                    OpParams::Args => {
                        // exit/abort: no result slot; anything downstream
                        // of them sees nil (and never runs anyway).
                        self.cur_pos = pos;
                        self.emit_op(op);
                        self.prog.ops.push(argv.len() as u8);
                        for a in &argv {
                            self.emit_var(*a);
                        }
                        for a in argv {
                            self.release(a);
                        }
                        match purpose {
                            Purpose::Empty => Ok(None),
                            _ => {
                                let (t, _) = self.target(purpose, pos)?;
                                self.emit_op(Op::Nil);
                                self.emit_var(t);
                                Ok(Some(t))
                            }
                        }
                    }
                    _ => unreachable!("variadic command with fixed params"),
                }
            }
        }
    }

    /// Compile-time `str.hash` on literal arguments.
    fn try_const_hash(
        &mut self,
        pos: Pos,
        args: &[Expr],
        purpose: Purpose,
    ) -> Result<Option<Option<VarRef>>, GenErr> {
        let (data, seed) = match args {
            [Expr::Str(_, s)] => (s.clone(), 0u64),
            [Expr::Str(_, s), Expr::Num(_, n)] => (s.clone(), *n as u64),
            _ => return Ok(None),
        };
        let words = hash_words(&data, seed);
        if purpose == Purpose::Empty {
            return Ok(Some(None));
        }
        let (t, _) = self.target(purpose, pos)?;
        self.emit_op(Op::List);
        self.emit_var(t);
        self.prog.ops.push(4);
        for w in words {
            let wt = self.alloc_temp(pos)?;
            self.emit_num_const(wt, w as f64);
            self.emit_op(Op::ListPush);
            self.emit_var(t);
            self.emit_var(t);
            self.emit_var(wt);
            self.release(wt);
        }
        Ok(Some(Some(t)))
    }

    // ========================================================================
    // CONSTANT EVALUATION
    // ========================================================================

    /// Evaluate a compile-time numeric constant (enum values).
    pub(crate) fn const_eval(&self, e: &Expr) -> Result<f64, String> {
        match e {
            Expr::Num(_, n) => Ok(*n),
            Expr::Paren(_, inner) => self.const_eval(inner),
            Expr::Prefix(_, KeySym::UnMinus, inner) => Ok(-self.const_eval(inner)?),
            Expr::Prefix(_, KeySym::UnPlus, inner) => self.const_eval(inner),
            Expr::Infix(_, ks, l, Some(r)) => {
                let a = self.const_eval(l)?;
                let b = self.const_eval(r)?;
                match ks {
                    KeySym::Plus => Ok(a + b),
                    KeySym::Minus => Ok(a - b),
                    KeySym::Star => Ok(a * b),
                    KeySym::Slash => Ok(a / b),
                    KeySym::Percent => Ok(a % b),
                    KeySym::Caret => Ok(a.powf(b)),
                    _ => Err("enum value must be a constant expression".to_string()),
                }
            }
            Expr::Names(_, names) => match self.sym.lookup(names) {
                Some(NsName::EnumVal(n)) => Ok(n),
                _ => Err(format!(
                    "enum value must be a constant expression (\"{}\" is not)",
                    names.join(".")
                )),
            },
            _ => Err("enum value must be a constant expression".to_string()),
        }
    }
}
