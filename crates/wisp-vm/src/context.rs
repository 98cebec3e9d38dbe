//! The runtime context: registers, call stack, effects, and the
//! byte-at-a-time interpreter loop.
//!
//! A context owns every piece of mutable run-time state for one script:
//! the lexical-frame chains (one stack of 256-slot register frames per
//! nesting depth), the call stack, the list arena, the PRNG, the timeout
//! budget, and the latched pass/fail status. It is single-threaded and
//! cooperative; nothing here is `Sync`.
//!
//! # Suspension
//!
//! `say`, `warn`, `ask`, and native commands suspend the VM: [`Context::run`]
//! returns [`RunResult::Waiting`] with the request recorded as a pending
//! [`Effect`]. The host performs the effect and delivers the result with
//! [`Context::resume`]; the next `run` continues right after the
//! suspending instruction.
//!
//! # Timeouts
//!
//! With a timeout configured, every instruction consumes one tick; when
//! the budget runs dry `run` returns [`RunResult::Timeout`] with all state
//! preserved, and the next call starts a fresh budget.

use crate::rand::Rand;
use crate::stdlib;
use crate::value::{order, tostr, ListArena, ListRef, UserData, Value};
use std::any::Any;
use std::rc::Rc;
use wisp_prog::{Op, Program, LOC_SENTINEL};
use wisp_util::FxHashSet;

/// Slots per lexical frame; slot indices are one byte.
const FRAME_SLOTS: usize = 256;

/// Call-stack depth limit; tail calls do not count against it.
const MAX_CALL_DEPTH: usize = 2048;

/// Frames of the stack trace shown in runtime errors.
const TRACE_FRAMES: usize = 9;

/// Outcome of one [`Context::run`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunResult {
    /// Script finished successfully.
    Pass,
    /// Script failed; see [`Context::err`].
    Fail,
    /// Tick budget exhausted; call `run` again to continue.
    Timeout,
    /// A pending [`Effect`] needs the host; see [`Context::pending`].
    Waiting,
    /// REPL mode: execution reached code that has not been compiled yet.
    ReplMore,
}

/// Externally visible status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CtxStatus {
    Ready,
    Waiting,
    Passed,
    Failed,
}

/// A host request the VM is suspended on.
#[derive(Clone, Debug)]
pub enum Effect {
    Say(Vec<u8>),
    Warn(Vec<u8>),
    Ask(Vec<u8>),
    Native { hash: u64, args: Vec<Value> },
}

struct CallFrame {
    ret_pc: usize,
    ret_var: (u8, u8),
    /// Level declared by the callee's command head; set on entry.
    level: u8,
}

/// The virtual machine.
pub struct Context {
    prog: Rc<Program>,
    pub arena: ListArena,
    /// chains[depth] is the stack of live frames at that lexical depth,
    /// innermost invocation last.
    chains: Vec<Vec<Vec<Value>>>,
    free_frames: Vec<Vec<Value>>,
    calls: Vec<CallFrame>,
    /// Arguments in flight between a call and its command head.
    pending_args: Vec<Value>,
    pc: usize,
    lastpc: usize,
    status: CtxStatus,
    err: Option<String>,
    effect: Option<Effect>,
    resume_slot: Option<(u8, u8)>,
    exit_after_resume: bool,
    /// Configured ticks per run; `None` disables the budget.
    timeout: Option<u32>,
    ticks: u32,
    pub rand: Rand,
    usertypes: Vec<String>,
    /// Interned string constants, filled lazily.
    str_cache: Vec<Option<Rc<Vec<u8>>>>,
    gc_threshold: usize,
}

impl Context {
    pub fn new(prog: Rc<Program>) -> Self {
        log::debug!("context created: {} op bytes", prog.ops.len());
        let cache_len = prog.strings.len();
        Self {
            prog,
            arena: ListArena::new(),
            chains: vec![vec![vec![Value::Nil; FRAME_SLOTS]]],
            free_frames: Vec::new(),
            calls: Vec::new(),
            pending_args: Vec::new(),
            pc: 0,
            lastpc: 0,
            status: CtxStatus::Ready,
            err: None,
            effect: None,
            resume_slot: None,
            exit_after_resume: false,
            timeout: None,
            ticks: 0,
            rand: Rand::new(),
            usertypes: Vec::new(),
            str_cache: vec![None; cache_len],
            gc_threshold: 4096,
        }
    }

    pub fn status(&self) -> CtxStatus {
        self.status
    }

    pub fn err(&self) -> Option<&str> {
        self.err.as_deref()
    }

    /// The effect the VM is suspended on, if any.
    pub fn pending(&self) -> Option<&Effect> {
        self.effect.as_ref()
    }

    /// Deliver the result of the pending effect and leave the waiting
    /// state. The value lands in the suspending instruction's result slot.
    pub fn resume(&mut self, v: Value) -> Result<(), String> {
        if self.status != CtxStatus::Waiting {
            return Err("resume without a pending effect".to_string());
        }
        log::trace!("resume");
        self.effect = None;
        if let Some(slot) = self.resume_slot.take() {
            let _ = self.set_var(slot.0, slot.1, v);
        }
        self.status = if self.exit_after_resume {
            CtxStatus::Passed
        } else {
            CtxStatus::Ready
        };
        Ok(())
    }

    /// Set the tick budget consumed by each `run` call. Zero disables it.
    pub fn set_timeout(&mut self, ticks: u32) {
        if ticks == 0 {
            self.timeout = None;
        } else {
            self.timeout = Some(ticks);
            self.ticks = ticks;
        }
    }

    pub fn timeout(&self) -> u32 {
        self.timeout.unwrap_or(0)
    }

    /// Burn budget explicitly (for expensive host operations).
    pub fn consume_ticks(&mut self, n: u32) {
        if self.timeout.is_some() {
            self.ticks = self.ticks.saturating_sub(n);
        }
    }

    /// Make the current `run` return `Timeout` at the next instruction.
    pub fn force_timeout(&mut self) {
        if self.timeout.is_some() {
            self.ticks = 0;
        }
    }

    /// Register a user type; the returned tag orders by registration.
    pub fn add_usertype(&mut self, name: &str) -> u32 {
        self.usertypes.push(name.to_string());
        (self.usertypes.len() - 1) as u32
    }

    /// Attach host data to a list.
    pub fn set_user(&mut self, list: ListRef, usertype: u32, payload: Rc<dyn Any>) {
        self.arena.get_mut(list).user = Some(UserData { usertype, payload });
    }

    /// Read host data back, if the list carries the given type.
    pub fn get_user(&self, list: ListRef, usertype: u32) -> Option<Rc<dyn Any>> {
        self.arena
            .get(list)
            .user
            .as_ref()
            .filter(|u| u.usertype == usertype)
            .map(|u| u.payload.clone())
    }

    /// Script-visible rendering of a value.
    pub fn render(&self, v: &Value) -> Vec<u8> {
        tostr(&self.arena, v)
    }

    /// Swap in a newer snapshot of the program. REPL hosts call this
    /// after each incremental compile: the program only ever grows and
    /// existing offsets stay valid, so execution resumes where it left
    /// off with the sentinels now patched.
    pub fn update_program(&mut self, prog: Rc<Program>) {
        self.str_cache.resize(prog.strings.len(), None);
        self.prog = prog;
    }

    /// Read a register, for hosts inspecting results.
    pub fn peek(&self, level: u8, index: u8) -> Option<Value> {
        self.chains
            .get(level as usize)?
            .last()
            .map(|f| f[index as usize].clone())
    }

    // ========================================================================
    // REGISTERS
    // ========================================================================

    fn get_var(&self, level: u8, index: u8) -> Result<Value, String> {
        match self.chains.get(level as usize).and_then(|c| c.last()) {
            Some(frame) => Ok(frame[index as usize].clone()),
            None => Err("invalid frame reference".to_string()),
        }
    }

    fn set_var(&mut self, level: u8, index: u8, v: Value) -> Result<(), String> {
        match self.chains.get_mut(level as usize).and_then(|c| c.last_mut()) {
            Some(frame) => {
                frame[index as usize] = v;
                Ok(())
            }
            None => Err("invalid frame reference".to_string()),
        }
    }

    /// Write an op result into its destination slot.
    pub(crate) fn store(&mut self, dst: (u8, u8), v: Value) -> Result<(), String> {
        self.set_var(dst.0, dst.1, v)
    }

    fn alloc_frame(&mut self) -> Vec<Value> {
        match self.free_frames.pop() {
            Some(mut f) => {
                f.iter_mut().for_each(|v| *v = Value::Nil);
                f
            }
            None => vec![Value::Nil; FRAME_SLOTS],
        }
    }

    // ========================================================================
    // DECODING
    // ========================================================================

    pub(crate) fn du8(&mut self) -> Result<u8, String> {
        let b = *self
            .prog
            .ops
            .get(self.pc)
            .ok_or("truncated instruction")?;
        self.pc += 1;
        Ok(b)
    }

    pub(crate) fn dv(&mut self) -> Result<(u8, u8), String> {
        let l = self.du8()?;
        let i = self.du8()?;
        Ok((l, i))
    }

    pub(crate) fn du32(&mut self) -> Result<u32, String> {
        if self.pc + 4 > self.prog.ops.len() {
            return Err("truncated instruction".to_string());
        }
        let v = u32::from_le_bytes(self.prog.ops[self.pc..self.pc + 4].try_into().unwrap());
        self.pc += 4;
        Ok(v)
    }

    pub(crate) fn df64(&mut self) -> Result<f64, String> {
        if self.pc + 8 > self.prog.ops.len() {
            return Err("truncated instruction".to_string());
        }
        let v = f64::from_le_bytes(self.prog.ops[self.pc..self.pc + 8].try_into().unwrap());
        self.pc += 8;
        Ok(v)
    }

    /// Decode an argument list into values.
    pub(crate) fn dargs(&mut self) -> Result<Vec<Value>, String> {
        let count = self.du8()? as usize;
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            let (l, i) = self.dv()?;
            out.push(self.get_var(l, i)?);
        }
        Ok(out)
    }

    pub(crate) fn read(&mut self) -> Result<Value, String> {
        let (l, i) = self.dv()?;
        self.get_var(l, i)
    }

    // ========================================================================
    // ERRORS
    // ========================================================================

    fn pos_str(&self, pc: u32) -> String {
        match self.prog.pos_at(pc) {
            Some(p) => {
                let file = self.prog.basefile(p.basefile);
                match file {
                    Some(f) if !f.is_empty() => format!("{}:{}:{}", f, p.line, p.chr),
                    _ => format!("{}:{}", p.line, p.chr),
                }
            }
            None => "?:?".to_string(),
        }
    }

    /// Latch a failure, formatting the message with the current position
    /// and up to nine stack frames.
    fn fail(&mut self, msg: Option<String>) -> RunResult {
        let mut text = match msg {
            Some(m) => format!("{}: {}", self.pos_str(self.lastpc as u32), m),
            None => String::new(),
        };
        for line in self.trace_lines() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(&format!("  at {}", line));
        }
        log::warn!("script failed: {}", text);
        self.err = Some(text);
        self.status = CtxStatus::Failed;
        RunResult::Fail
    }

    /// Stack trace entries, innermost first.
    fn trace_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        let mut pcs = vec![self.lastpc as u32];
        for cf in self.calls.iter().rev() {
            pcs.push(cf.ret_pc as u32);
        }
        for pc in pcs.into_iter().take(TRACE_FRAMES) {
            let loc = self.pos_str(pc);
            match self.prog.cmd_hint_at(pc) {
                Some(hint) => lines.push(format!("{} ({})", hint, loc)),
                None => lines.push(format!("({})", loc)),
            }
        }
        lines
    }

    // ========================================================================
    // GARBAGE COLLECTION
    // ========================================================================

    fn maybe_gc(&mut self) {
        if self.arena.live_count() < self.gc_threshold {
            return;
        }
        let mut marked = FxHashSet::default();
        for chain in &self.chains {
            for frame in chain {
                for v in frame {
                    self.arena.mark_value(v, &mut marked);
                }
            }
        }
        for v in &self.pending_args {
            self.arena.mark_value(v, &mut marked);
        }
        if let Some(Effect::Native { args, .. }) = &self.effect {
            for v in args {
                self.arena.mark_value(v, &mut marked);
            }
        }
        self.arena.sweep(&marked);
        self.gc_threshold = (self.arena.live_count() * 2).max(4096);
        log::trace!("gc: {} lists live", self.arena.live_count());
    }

    // ========================================================================
    // THE INTERPRETER LOOP
    // ========================================================================

    /// Execute until completion, suspension, timeout, or (in REPL mode)
    /// the edge of compiled code.
    pub fn run(&mut self) -> RunResult {
        match self.status {
            CtxStatus::Passed => return RunResult::Pass,
            CtxStatus::Failed => return RunResult::Fail,
            CtxStatus::Waiting => return RunResult::Waiting,
            CtxStatus::Ready => {}
        }
        loop {
            if self.timeout.is_some() {
                if self.ticks == 0 {
                    self.ticks = self.timeout.unwrap();
                    return RunResult::Timeout;
                }
                self.ticks -= 1;
            }
            if self.pc >= self.prog.ops.len() {
                if self.prog.repl {
                    return RunResult::ReplMore;
                }
                self.status = CtxStatus::Passed;
                return RunResult::Pass;
            }
            self.lastpc = self.pc;
            match self.step() {
                Ok(None) => {}
                Ok(Some(result)) => return result,
                Err(msg) => return self.fail(Some(msg)),
            }
        }
    }

    /// Execute one instruction. `Ok(Some(_))` ends the run.
    fn step(&mut self) -> Result<Option<RunResult>, String> {
        let byte = self.prog.ops[self.pc];
        self.pc += 1;
        let op = Op::from_u8(byte).ok_or_else(|| format!("invalid opcode 0x{:02X}", byte))?;

        match op {
            Op::Nop => {}

            Op::Move => {
                let dst = self.dv()?;
                let v = self.read()?;
                self.set_var(dst.0, dst.1, v)?;
            }

            Op::Nil => {
                let dst = self.dv()?;
                self.set_var(dst.0, dst.1, Value::Nil)?;
            }

            Op::NumP8 => {
                let dst = self.dv()?;
                let n = self.du8()? as f64;
                self.set_var(dst.0, dst.1, Value::Num(n))?;
            }

            Op::NumN8 => {
                let dst = self.dv()?;
                let n = -(self.du8()? as f64);
                self.set_var(dst.0, dst.1, Value::Num(n))?;
            }

            Op::Num => {
                let dst = self.dv()?;
                let n = self.df64()?;
                self.set_var(dst.0, dst.1, Value::Num(n))?;
            }

            Op::Str => {
                let dst = self.dv()?;
                let idx = self.du32()? as usize;
                let s = match self.str_cache.get(idx).and_then(|c| c.clone()) {
                    Some(rc) => rc,
                    None => {
                        let rc = Rc::new(
                            self.prog
                                .strings
                                .get(idx)
                                .ok_or("invalid string constant")?
                                .clone(),
                        );
                        if idx < self.str_cache.len() {
                            self.str_cache[idx] = Some(rc.clone());
                        }
                        rc
                    }
                };
                self.set_var(dst.0, dst.1, Value::Str(s))?;
            }

            Op::List => {
                let dst = self.dv()?;
                let cap = self.du8()? as usize;
                let r = self.arena.alloc(Vec::with_capacity(cap));
                self.set_var(dst.0, dst.1, Value::List(r))?;
                self.maybe_gc();
            }

            Op::IsNum => self.unary(|_, v| Ok(Value::bool(matches!(v, Value::Num(_)))))?,
            Op::IsStr => self.unary(|_, v| Ok(Value::bool(matches!(v, Value::Str(_)))))?,
            Op::IsList => self.unary(|_, v| Ok(Value::bool(matches!(v, Value::List(_)))))?,
            Op::Not => self.unary(|_, v| Ok(Value::bool(!v.is_true())))?,

            Op::Size => self.unary(|ctx, v| match v {
                Value::Str(s) => Ok(Value::Num(s.len() as f64)),
                Value::List(r) => Ok(Value::Num(ctx.get(r).items.len() as f64)),
                other => Err(format!("expecting string or list, found {}", other.type_name())),
            })?,

            Op::ToNum => {
                let dst = self.dv()?;
                let v = self.read()?;
                let res = self.tonum(&v, 0)?;
                self.set_var(dst.0, dst.1, res)?;
            }

            Op::Cat => {
                let dst = self.dv()?;
                let args = self.dargs()?;
                let res = self.do_cat(&args);
                self.set_var(dst.0, dst.1, res)?;
            }

            Op::Lt | Op::LtEqu => {
                let dst = self.dv()?;
                let a = self.read()?;
                let b = self.read()?;
                let res = match (&a, &b) {
                    (Value::Num(x), Value::Num(y)) => {
                        if op == Op::Lt {
                            Value::bool(x < y)
                        } else {
                            Value::bool(x <= y)
                        }
                    }
                    (Value::Str(x), Value::Str(y)) => {
                        if op == Op::Lt {
                            Value::bool(x < y)
                        } else {
                            Value::bool(x <= y)
                        }
                    }
                    _ => {
                        return Err(format!(
                            "cannot compare {} with {}",
                            a.type_name(),
                            b.type_name()
                        ))
                    }
                };
                self.set_var(dst.0, dst.1, res)?;
            }

            Op::Equ | Op::Neq => {
                let dst = self.dv()?;
                let a = self.read()?;
                let b = self.read()?;
                let eq = a.equals(&b);
                self.set_var(dst.0, dst.1, Value::bool(if op == Op::Equ { eq } else { !eq }))?;
            }

            Op::GetAt => {
                let dst = self.dv()?;
                let obj = self.read()?;
                let key = self.read()?;
                let res = self.do_getat(&obj, &key)?;
                self.set_var(dst.0, dst.1, res)?;
            }

            Op::SetAt => {
                let obj = self.read()?;
                let key = self.read()?;
                let val = self.read()?;
                self.do_setat(&obj, &key, val)?;
            }

            Op::Slice => {
                let dst = self.dv()?;
                let obj = self.read()?;
                let start = self.read()?;
                let len = self.read()?;
                let res = self.do_slice(&obj, &start, &len)?;
                self.set_var(dst.0, dst.1, res)?;
            }

            Op::Splice => {
                let obj = self.read()?;
                let start = self.read()?;
                let len = self.read()?;
                let val = self.read()?;
                self.do_splice(&obj, &start, &len, &val)?;
            }

            Op::Neg => {
                let dst = self.dv()?;
                let v = self.read()?;
                let res = self.broadcast1(&v, &|n| -n, 0)?;
                self.set_var(dst.0, dst.1, res)?;
            }

            Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Mod | Op::Pow => {
                let dst = self.dv()?;
                let a = self.read()?;
                let b = self.read()?;
                let f: &dyn Fn(f64, f64) -> f64 = match op {
                    Op::Add => &|x, y| x + y,
                    Op::Sub => &|x, y| x - y,
                    Op::Mul => &|x, y| x * y,
                    Op::Div => &|x, y| x / y,
                    Op::Mod => &|x, y| x % y,
                    _ => &|x, y| x.powf(y),
                };
                let res = self.broadcast2(&a, &b, f, 0)?;
                self.set_var(dst.0, dst.1, res)?;
            }

            Op::Jump => {
                let loc = self.du32()?;
                if loc == LOC_SENTINEL {
                    return self.sentinel();
                }
                self.pc = loc as usize;
            }

            Op::JumpTrue | Op::JumpFalse => {
                let v = self.read()?;
                let loc = self.du32()?;
                if loc == LOC_SENTINEL {
                    return self.sentinel();
                }
                if v.is_true() == (op == Op::JumpTrue) {
                    self.pc = loc as usize;
                }
            }

            Op::CmdHead => {
                let level = self.du8()? as usize;
                let restpos = self.du8()?;
                if self.calls.is_empty() {
                    return Err("cannot enter a command without a call".to_string());
                }
                let args = std::mem::take(&mut self.pending_args);
                let mut frame = self.alloc_frame();
                if restpos != 0xFF {
                    let rp = restpos as usize;
                    for (i, slot) in frame.iter_mut().enumerate().take(rp.min(args.len())) {
                        *slot = args[i].clone();
                    }
                    let rest: Vec<Value> = args.iter().skip(rp).cloned().collect();
                    let r = self.arena.alloc(rest);
                    frame[rp] = Value::List(r);
                } else {
                    for (i, arg) in args.iter().enumerate().take(FRAME_SLOTS) {
                        frame[i] = arg.clone();
                    }
                }
                while self.chains.len() <= level {
                    self.chains.push(Vec::new());
                }
                self.chains[level].push(frame);
                self.calls.last_mut().unwrap().level = level as u8;
            }

            Op::Call => {
                let ret = self.dv()?;
                let loc = self.du32()?;
                if loc == LOC_SENTINEL {
                    return self.sentinel();
                }
                let args = self.dargs()?;
                if self.calls.len() >= MAX_CALL_DEPTH {
                    return Err("call stack exhausted".to_string());
                }
                self.pending_args = args;
                self.calls.push(CallFrame {
                    ret_pc: self.pc,
                    ret_var: ret,
                    level: 0xFF,
                });
                self.pc = loc as usize;
            }

            Op::ReturnTail => {
                let loc = self.du32()?;
                if loc == LOC_SENTINEL {
                    return self.sentinel();
                }
                let args = self.dargs()?;
                let level = match self.calls.last() {
                    Some(cf) => cf.level as usize,
                    None => return Err("tail call outside of a command".to_string()),
                };
                self.pending_args = args;
                if let Some(frame) = self.chains[level].pop() {
                    self.free_frames.push(frame);
                }
                self.pc = loc as usize;
            }

            Op::Return => {
                let v = self.read()?;
                match self.calls.pop() {
                    None => {
                        // Top-level return ends the script.
                        self.status = CtxStatus::Passed;
                        return Ok(Some(RunResult::Pass));
                    }
                    Some(cf) => {
                        if let Some(frame) = self.chains[cf.level as usize].pop() {
                            self.free_frames.push(frame);
                        }
                        self.pc = cf.ret_pc;
                        self.set_var(cf.ret_var.0, cf.ret_var.1, v)?;
                        self.maybe_gc();
                    }
                }
            }

            Op::Native => {
                let ret = self.dv()?;
                let key = self.du32()? as usize;
                let args = self.dargs()?;
                let hash = *self.prog.keys.get(key).ok_or("invalid native key")?;
                self.resume_slot = Some(ret);
                self.effect = Some(Effect::Native { hash, args });
                self.status = CtxStatus::Waiting;
                log::trace!("suspend on native {:016x}", hash);
                return Ok(Some(RunResult::Waiting));
            }

            Op::Say | Op::Warn | Op::Ask => {
                let ret = self.dv()?;
                let args = self.dargs()?;
                let text = self.format_args(&args);
                self.resume_slot = Some(ret);
                self.effect = Some(match op {
                    Op::Say => Effect::Say(text),
                    Op::Warn => Effect::Warn(text),
                    _ => Effect::Ask(text),
                });
                self.status = CtxStatus::Waiting;
                return Ok(Some(RunResult::Waiting));
            }

            Op::Exit => {
                let args = self.dargs()?;
                if args.is_empty() {
                    self.status = CtxStatus::Passed;
                    return Ok(Some(RunResult::Pass));
                }
                let text = self.format_args(&args);
                self.resume_slot = None;
                self.effect = Some(Effect::Say(text));
                self.exit_after_resume = true;
                self.status = CtxStatus::Waiting;
                return Ok(Some(RunResult::Waiting));
            }

            Op::Abort => {
                let args = self.dargs()?;
                let msg = if args.is_empty() {
                    None
                } else {
                    Some(String::from_utf8_lossy(&self.format_args(&args)).into_owned())
                };
                return Ok(Some(self.fail(msg)));
            }

            Op::StackTrace => {
                let dst = self.dv()?;
                let lines: Vec<Value> = self
                    .trace_lines()
                    .into_iter()
                    .map(Value::str)
                    .collect();
                let r = self.arena.alloc(lines);
                self.set_var(dst.0, dst.1, Value::List(r))?;
            }

            Op::Range => {
                let dst = self.dv()?;
                let start = self.read()?;
                let stop = self.read()?;
                let step = self.read()?;
                let res = self.do_range(&start, &stop, &step)?;
                self.set_var(dst.0, dst.1, res)?;
            }

            Op::Order => {
                let dst = self.dv()?;
                let a = self.read()?;
                let b = self.read()?;
                let ord = order(&self.arena, &a, &b)?;
                self.set_var(dst.0, dst.1, Value::Num(ord as i8 as f64))?;
            }

            _ => return self.step_stdlib(op),
        }
        Ok(None)
    }

    /// A jump/call location still holding the back-patch sentinel: in REPL
    /// mode rewind and ask for more input, otherwise fail.
    fn sentinel(&mut self) -> Result<Option<RunResult>, String> {
        if self.prog.repl {
            self.pc = self.lastpc;
            Ok(Some(RunResult::ReplMore))
        } else {
            Err("jump to unresolved location".to_string())
        }
    }

    // ========================================================================
    // SHARED OP HELPERS
    // ========================================================================

    /// Decode result + operand, apply.
    fn unary(
        &mut self,
        f: impl Fn(&ListArena, Value) -> Result<Value, String>,
    ) -> Result<(), String> {
        let dst = self.dv()?;
        let v = self.read()?;
        let res = f(&self.arena, v)?;
        self.set_var(dst.0, dst.1, res)
    }

    /// Element-wise application of a unary numeric operation.
    pub(crate) fn broadcast1(
        &mut self,
        v: &Value,
        f: &dyn Fn(f64) -> f64,
        depth: u32,
    ) -> Result<Value, String> {
        if depth > 64 {
            return Err("list too deep".to_string());
        }
        match v {
            Value::Num(n) => Ok(Value::Num(f(*n))),
            Value::List(r) => {
                let items = self.arena.get(*r).items.clone();
                let mut out = Vec::with_capacity(items.len());
                for item in &items {
                    out.push(self.broadcast1(item, f, depth + 1)?);
                }
                Ok(Value::List(self.arena.alloc(out)))
            }
            other => Err(format!(
                "expecting number or list of numbers, found {}",
                other.type_name()
            )),
        }
    }

    /// Element-wise application of a binary numeric operation. Two lists
    /// combine at the longer length; the missing side reads as nil, which
    /// is an error when the operation touches it.
    pub(crate) fn broadcast2(
        &mut self,
        a: &Value,
        b: &Value,
        f: &dyn Fn(f64, f64) -> f64,
        depth: u32,
    ) -> Result<Value, String> {
        if depth > 64 {
            return Err("list too deep".to_string());
        }
        match (a, b) {
            (Value::Num(x), Value::Num(y)) => Ok(Value::Num(f(*x, *y))),
            (Value::List(x), Value::List(y)) => {
                let xs = self.arena.get(*x).items.clone();
                let ys = self.arena.get(*y).items.clone();
                let len = xs.len().max(ys.len());
                let mut out = Vec::with_capacity(len);
                for i in 0..len {
                    let xa = xs.get(i).cloned().unwrap_or(Value::Nil);
                    let yb = ys.get(i).cloned().unwrap_or(Value::Nil);
                    out.push(self.broadcast2(&xa, &yb, f, depth + 1)?);
                }
                Ok(Value::List(self.arena.alloc(out)))
            }
            (Value::List(x), other) => {
                let xs = self.arena.get(*x).items.clone();
                let mut out = Vec::with_capacity(xs.len());
                for item in &xs {
                    out.push(self.broadcast2(item, other, f, depth + 1)?);
                }
                Ok(Value::List(self.arena.alloc(out)))
            }
            (other, Value::List(y)) => {
                let ys = self.arena.get(*y).items.clone();
                let mut out = Vec::with_capacity(ys.len());
                for item in &ys {
                    out.push(self.broadcast2(other, item, f, depth + 1)?);
                }
                Ok(Value::List(self.arena.alloc(out)))
            }
            _ => Err(format!(
                "expecting number or list of numbers, found {}",
                if matches!(a, Value::Num(_)) {
                    b.type_name()
                } else {
                    a.type_name()
                }
            )),
        }
    }

    /// Convert to number: nil stays nil, strings parse like literals,
    /// lists broadcast.
    fn tonum(&mut self, v: &Value, depth: u32) -> Result<Value, String> {
        if depth > 64 {
            return Err("list too deep".to_string());
        }
        match v {
            Value::Nil => Ok(Value::Nil),
            Value::Num(n) => Ok(Value::Num(*n)),
            Value::Str(s) => Ok(stdlib::parse_num(s)
                .map(Value::Num)
                .unwrap_or(Value::Nil)),
            Value::List(r) => {
                let items = self.arena.get(*r).items.clone();
                let mut out = Vec::with_capacity(items.len());
                for item in &items {
                    out.push(self.tonum(item, depth + 1)?);
                }
                Ok(Value::List(self.arena.alloc(out)))
            }
        }
    }

    /// `~`: list concatenation when every operand is a list, string
    /// concatenation of rendered values otherwise.
    fn do_cat(&mut self, args: &[Value]) -> Value {
        if !args.is_empty() && args.iter().all(|v| matches!(v, Value::List(_))) {
            let mut out = Vec::new();
            for v in args {
                if let Value::List(r) = v {
                    out.extend(self.arena.get(*r).items.iter().cloned());
                }
            }
            return Value::List(self.arena.alloc(out));
        }
        let mut out = Vec::new();
        for v in args {
            out.extend(tostr(&self.arena, v));
        }
        Value::str(out)
    }

    fn index_of(&self, key: &Value) -> Result<i64, String> {
        match key {
            Value::Num(n) => Ok(*n as i64),
            other => Err(format!("expecting index number, found {}", other.type_name())),
        }
    }

    fn do_getat(&mut self, obj: &Value, key: &Value) -> Result<Value, String> {
        let idx = self.index_of(key)?;
        match obj {
            Value::List(r) => {
                let items = &self.arena.get(*r).items;
                let i = if idx < 0 { idx + items.len() as i64 } else { idx };
                if i < 0 || i as usize >= items.len() {
                    Ok(Value::Nil)
                } else {
                    Ok(items[i as usize].clone())
                }
            }
            Value::Str(s) => {
                let i = if idx < 0 { idx + s.len() as i64 } else { idx };
                if i < 0 || i as usize >= s.len() {
                    Ok(Value::Nil)
                } else {
                    Ok(Value::str(vec![s[i as usize]]))
                }
            }
            other => Err(format!("cannot index {}", other.type_name())),
        }
    }

    fn do_setat(&mut self, obj: &Value, key: &Value, val: Value) -> Result<(), String> {
        let idx = self.index_of(key)?;
        match obj {
            Value::List(r) => {
                let items = &mut self.arena.get_mut(*r).items;
                let i = if idx < 0 { idx + items.len() as i64 } else { idx };
                if i < 0 {
                    return Err("index out of range".to_string());
                }
                let i = i as usize;
                if i >= items.len() {
                    items.resize(i + 1, Value::Nil);
                }
                items[i] = val;
                Ok(())
            }
            other => Err(format!("cannot store into {}", other.type_name())),
        }
    }

    /// Resolve (start, len) against a sequence length. Nil start is 0,
    /// negative counts from the end; nil len runs to the end.
    fn slice_bounds(
        &self,
        seq_len: usize,
        start: &Value,
        len: &Value,
    ) -> Result<(usize, usize), String> {
        let s = match start {
            Value::Nil => 0,
            Value::Num(n) => {
                let i = *n as i64;
                if i < 0 {
                    (i + seq_len as i64).max(0)
                } else {
                    i
                }
            }
            other => return Err(format!("expecting slice start, found {}", other.type_name())),
        };
        let s = (s as usize).min(seq_len);
        let l = match len {
            Value::Nil => seq_len - s,
            Value::Num(n) => (*n as i64).max(0) as usize,
            other => return Err(format!("expecting slice length, found {}", other.type_name())),
        };
        Ok((s, l.min(seq_len - s)))
    }

    fn do_slice(&mut self, obj: &Value, start: &Value, len: &Value) -> Result<Value, String> {
        match obj {
            Value::List(r) => {
                let items = self.arena.get(*r).items.clone();
                let (s, l) = self.slice_bounds(items.len(), start, len)?;
                let out = items[s..s + l].to_vec();
                Ok(Value::List(self.arena.alloc(out)))
            }
            Value::Str(bytes) => {
                let (s, l) = self.slice_bounds(bytes.len(), start, len)?;
                Ok(Value::str(bytes[s..s + l].to_vec()))
            }
            other => Err(format!("cannot slice {}", other.type_name())),
        }
    }

    fn do_splice(
        &mut self,
        obj: &Value,
        start: &Value,
        len: &Value,
        val: &Value,
    ) -> Result<(), String> {
        match obj {
            Value::List(r) => {
                let cur_len = self.arena.get(*r).items.len();
                let (s, l) = self.slice_bounds(cur_len, start, len)?;
                let repl: Vec<Value> = match val {
                    Value::Nil => Vec::new(),
                    Value::List(v) => self.arena.get(*v).items.clone(),
                    other => {
                        return Err(format!(
                            "expecting list or nil to splice, found {}",
                            other.type_name()
                        ))
                    }
                };
                self.arena.get_mut(*r).items.splice(s..s + l, repl);
                Ok(())
            }
            other => Err(format!("cannot splice {}", other.type_name())),
        }
    }

    fn do_range(&mut self, start: &Value, stop: &Value, step: &Value) -> Result<Value, String> {
        let (start, stop) = match (start, stop) {
            (Value::Num(a), Value::Nil) => (0.0, *a),
            (Value::Num(a), Value::Num(b)) => (*a, *b),
            _ => return Err("expecting number for range".to_string()),
        };
        let step = match step {
            Value::Nil => 1.0,
            Value::Num(s) => *s,
            other => return Err(format!("expecting range step, found {}", other.type_name())),
        };
        if step == 0.0 {
            return Err("range step cannot be 0".to_string());
        }
        let count = ((stop - start) / step).ceil().max(0.0);
        if count > 10_000_000.0 {
            return Err("range too large".to_string());
        }
        let count = count as usize;
        let mut out = Vec::with_capacity(count);
        for i in 0..count {
            out.push(Value::Num(start + step * i as f64));
        }
        Ok(Value::List(self.arena.alloc(out)))
    }

    /// Render arguments the way say/warn/ask/str.new do: joined by one
    /// space.
    pub(crate) fn format_args(&self, args: &[Value]) -> Vec<u8> {
        let mut out = Vec::new();
        for (i, v) in args.iter().enumerate() {
            if i > 0 {
                out.push(b' ');
            }
            out.extend(tostr(&self.arena, v));
        }
        out
    }
}
