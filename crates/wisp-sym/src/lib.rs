//! wisp-sym - The compile-time symbol table.
//!
//! A symbol table is three cooperating stacks:
//!
//! - a FRAME stack: one frame per command being compiled, each with up to
//!   256 slots and its own labels;
//! - a SCOPE stack: one scope per open block, owning a namespace for names
//!   declared inside it, the forward declarations still waiting for a
//!   definition, and the break/continue targets when the block is a loop;
//! - a NAMESPACE tree: named collections of symbols, composable with
//!   `namespace`/`using`; `using` adds a back-reference that lookup
//!   follows transitively (with a visited set, so cyclic usings are
//!   harmless).
//!
//! Name lookup walks scopes innermost-first; inside each scope the
//! namespace stack innermost-first; inside each namespace the usings
//! transitively. Built-in commands are registered into the root namespace
//! when the table is created.
//!
//! In REPL mode redefinitions replace the old binding instead of erroring.

pub mod frame;
pub mod namespace;

pub use frame::{Frame, Label, FRAME_SLOTS};
pub use namespace::{LblIdx, NsIdx, NsName, Namespace};

use rustc_hash::FxHashSet;
use wisp_prog::STDLIB;

/// One open block.
#[derive(Debug)]
struct Scope {
    frame_level: u8,
    /// Namespaces entered within this scope, innermost last. Index 0 is
    /// the scope's own anonymous namespace.
    ns_stack: Vec<NsIdx>,
    /// Commands declared but not yet defined in this scope.
    declares: Vec<(String, LblIdx)>,
    /// Variable slots to release when the scope pops.
    vars: Vec<u8>,
    lbl_break: Option<LblIdx>,
    lbl_continue: Option<LblIdx>,
}

/// The symbol table.
pub struct SymTable {
    pub repl: bool,
    namespaces: Vec<Namespace>,
    labels: Vec<Label>,
    frames: Vec<Frame>,
    scopes: Vec<Scope>,
}

impl SymTable {
    pub fn new(repl: bool) -> Self {
        let mut sym = Self {
            repl,
            namespaces: vec![Namespace::new()],
            labels: Vec::new(),
            frames: vec![Frame::new(0)],
            scopes: Vec::new(),
        };
        sym.scopes.push(Scope {
            frame_level: 0,
            ns_stack: vec![NsIdx(0)],
            declares: Vec::new(),
            vars: Vec::new(),
            lbl_break: None,
            lbl_continue: None,
        });
        sym.register_stdlib();
        sym
    }

    fn register_stdlib(&mut self) {
        for (path, opcmd) in STDLIB {
            let parts: Vec<&str> = path.split('.').collect();
            let mut ns = NsIdx(0);
            for part in &parts[..parts.len() - 1] {
                ns = self.ensure_sub(ns, part);
            }
            let leaf = parts[parts.len() - 1].to_string();
            self.namespaces[ns.0 as usize]
                .names
                .insert(leaf, NsName::CmdOpcode(*opcmd));
        }
    }

    fn ensure_sub(&mut self, ns: NsIdx, name: &str) -> NsIdx {
        if let Some(NsName::Sub(idx)) = self.namespaces[ns.0 as usize].names.get(name) {
            return *idx;
        }
        let idx = NsIdx(self.namespaces.len() as u32);
        self.namespaces.push(Namespace::new());
        self.namespaces[ns.0 as usize]
            .names
            .insert(name.to_string(), NsName::Sub(idx));
        idx
    }

    fn new_namespace(&mut self) -> NsIdx {
        let idx = NsIdx(self.namespaces.len() as u32);
        self.namespaces.push(Namespace::new());
        idx
    }

    // ========================================================================
    // LOOKUP
    // ========================================================================

    fn resolve_in(&self, ns: NsIdx, name: &str, visited: &mut FxHashSet<u32>) -> Option<NsName> {
        if !visited.insert(ns.0) {
            return None;
        }
        let space = &self.namespaces[ns.0 as usize];
        if let Some(entry) = space.names.get(name) {
            return Some(*entry);
        }
        for &used in &space.usings {
            if let Some(entry) = self.resolve_in(used, name, visited) {
                return Some(entry);
            }
        }
        None
    }

    /// Resolve the tail of a dotted path inside a namespace entry.
    fn resolve_path(&self, mut entry: NsName, rest: &[String]) -> Option<NsName> {
        for name in rest {
            match entry {
                NsName::Sub(idx) => {
                    let mut visited = FxHashSet::default();
                    entry = self.resolve_in(idx, name, &mut visited)?;
                }
                _ => return None,
            }
        }
        Some(entry)
    }

    /// Look up a dotted name path: scopes innermost-first, namespace stack
    /// innermost-first, usings transitively.
    pub fn lookup(&self, names: &[String]) -> Option<NsName> {
        let (first, rest) = names.split_first()?;
        for scope in self.scopes.iter().rev() {
            for &ns in scope.ns_stack.iter().rev() {
                let mut visited = FxHashSet::default();
                if let Some(entry) = self.resolve_in(ns, first, &mut visited) {
                    return self.resolve_path(entry, rest);
                }
            }
        }
        None
    }

    // ========================================================================
    // FRAMES AND SLOTS
    // ========================================================================

    fn frame(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("frame stack empty")
    }

    /// Lexical level of the frame being compiled.
    pub fn level(&self) -> u8 {
        self.frames.last().expect("frame stack empty").level
    }

    /// High-water slot count of the current frame.
    pub fn frame_size(&self) -> usize {
        self.frames.last().expect("frame stack empty").size()
    }

    pub fn push_frame(&mut self) -> Result<u8, String> {
        let level = self.level();
        if level as usize + 1 >= FRAME_SLOTS {
            return Err("commands nested too deeply".to_string());
        }
        self.frames.push(Frame::new(level + 1));
        Ok(level + 1)
    }

    /// Pop the current frame, checking that every referenced label was
    /// declared.
    pub fn pop_frame(&mut self) -> Result<(), String> {
        let frame = self.frames.pop().expect("frame stack empty");
        for &lbl in &frame.lbls {
            let label = &self.labels[lbl.0 as usize];
            if label.pc.is_none() && !label.rewrites.is_empty() {
                return Err(format!("missing label \"{}\"", label.name));
            }
        }
        Ok(())
    }

    /// Declare a variable in the current scope, allocating a slot.
    pub fn add_var(&mut self, name: &str) -> Result<(u8, u8), String> {
        let level = self.level();
        let index = self.frame().alloc_var()?;
        let entry = NsName::Var { level, index };
        self.add_name(name, entry)?;
        let scope = self.scopes.last_mut().expect("scope stack empty");
        scope.vars.push(index);
        Ok((level, index))
    }

    /// Allocate an anonymous temporary in the current frame.
    pub fn add_temp(&mut self) -> Result<(u8, u8), String> {
        let level = self.level();
        let index = self.frame().alloc_temp()?;
        Ok((level, index))
    }

    /// Release a temporary for reuse. Only slots of the current frame are
    /// eligible; anything else is a caller bug and is ignored.
    pub fn release_temp(&mut self, level: u8, index: u8) {
        if level == self.level() {
            self.frame().release(index);
        }
    }

    // ========================================================================
    // SCOPES
    // ========================================================================

    pub fn push_scope(&mut self) {
        let frame_level = self.level();
        let ns = self.new_namespace();
        self.scopes.push(Scope {
            frame_level,
            ns_stack: vec![ns],
            declares: Vec::new(),
            vars: Vec::new(),
            lbl_break: None,
            lbl_continue: None,
        });
    }

    /// Pop a scope. Declared-but-undefined commands are an error; the
    /// scope's variable slots are released.
    pub fn pop_scope(&mut self) -> Result<(), String> {
        let scope = self.scopes.pop().expect("scope stack empty");
        if let Some((name, _)) = scope.declares.first() {
            let name = name.clone();
            self.scopes.push(scope);
            return Err(format!("\"{}\" declared but never defined", name));
        }
        for index in scope.vars {
            self.frame().release_var(index);
        }
        Ok(())
    }

    /// Mark the current scope as a loop body.
    pub fn set_loop_labels(&mut self, brk: LblIdx, cont: Option<LblIdx>) {
        let scope = self.scopes.last_mut().expect("scope stack empty");
        scope.lbl_break = Some(brk);
        scope.lbl_continue = cont;
    }

    fn loop_label(&self, pick: impl Fn(&Scope) -> Option<LblIdx>) -> Option<LblIdx> {
        let level = self.level();
        for scope in self.scopes.iter().rev() {
            if scope.frame_level != level {
                return None;
            }
            if let Some(lbl) = pick(scope) {
                return Some(lbl);
            }
        }
        None
    }

    /// Innermost `break` target in the current frame.
    pub fn lbl_break(&self) -> Option<LblIdx> {
        self.loop_label(|s| s.lbl_break)
    }

    /// Innermost `continue` target in the current frame.
    pub fn lbl_continue(&self) -> Option<LblIdx> {
        self.loop_label(|s| s.lbl_continue)
    }

    // ========================================================================
    // NAMESPACES
    // ========================================================================

    fn head_ns(&self) -> NsIdx {
        *self
            .scopes
            .last()
            .expect("scope stack empty")
            .ns_stack
            .last()
            .expect("namespace stack empty")
    }

    /// Enter (creating as needed) the namespace path. Returns how many
    /// levels were pushed, for the matching [`SymTable::pop_namespaces`].
    pub fn push_namespace(&mut self, names: &[String]) -> Result<usize, String> {
        let mut pushed = 0;
        for name in names {
            let head = self.head_ns();
            let existing = self.namespaces[head.0 as usize].names.get(name).copied();
            let next = match existing {
                Some(NsName::Sub(idx)) => idx,
                Some(_) => {
                    self.pop_namespaces(pushed);
                    return Err(format!("\"{}\" is not a namespace", name));
                }
                None => self.ensure_sub(head, name),
            };
            self.scopes
                .last_mut()
                .expect("scope stack empty")
                .ns_stack
                .push(next);
            pushed += 1;
        }
        Ok(pushed)
    }

    /// Create a fresh anonymous namespace, `using` it from the current
    /// head, and enter it. This models a lexical `include`: names defined
    /// inside stay visible after the pop through the using edge.
    pub fn push_namespace_unique(&mut self) {
        let anon = self.new_namespace();
        let head = self.head_ns();
        self.namespaces[head.0 as usize].usings.push(anon);
        self.scopes
            .last_mut()
            .expect("scope stack empty")
            .ns_stack
            .push(anon);
    }

    pub fn pop_namespaces(&mut self, count: usize) {
        let scope = self.scopes.last_mut().expect("scope stack empty");
        for _ in 0..count {
            if scope.ns_stack.len() > 1 {
                scope.ns_stack.pop();
            }
        }
    }

    /// `using names`: add the target namespace to the head's search list.
    pub fn using(&mut self, names: &[String]) -> Result<(), String> {
        match self.lookup(names) {
            Some(NsName::Sub(idx)) => {
                let head = self.head_ns();
                let space = &mut self.namespaces[head.0 as usize];
                if !space.usings.contains(&idx) {
                    space.usings.push(idx);
                }
                Ok(())
            }
            Some(_) => Err(format!("\"{}\" is not a namespace", names.join("."))),
            None => Err(format!("undefined namespace \"{}\"", names.join("."))),
        }
    }

    // ========================================================================
    // NAMES
    // ========================================================================

    /// Add a name to the head namespace. Duplicates error outside REPL
    /// mode and silently replace inside it.
    pub fn add_name(&mut self, name: &str, entry: NsName) -> Result<(), String> {
        let head = self.head_ns();
        let space = &mut self.namespaces[head.0 as usize];
        if space.names.contains_key(name) && !self.repl {
            return Err(format!("\"{}\" is already defined", name));
        }
        space.names.insert(name.to_string(), entry);
        Ok(())
    }

    pub fn add_enum(&mut self, name: &str, val: f64) -> Result<(), String> {
        self.add_name(name, NsName::EnumVal(val))
    }

    /// Bind a native command under a dotted path.
    pub fn add_native(&mut self, names: &[String], hash: u64) -> Result<(), String> {
        let (leaf, parents) = names.split_last().expect("empty native path");
        if parents.is_empty() {
            return self.add_name(leaf, NsName::CmdNative(hash));
        }
        let pushed = self.push_namespace(parents)?;
        let result = self.add_name(leaf, NsName::CmdNative(hash));
        self.pop_namespaces(pushed);
        result
    }

    /// Forward-declare a local command; the definition must follow in the
    /// same scope.
    pub fn declare_cmd(&mut self, name: &str) -> Result<LblIdx, String> {
        let lbl = self.new_label(name);
        let level = self.level() + 1;
        self.add_name(name, NsName::CmdLocal { level, lbl })?;
        self.scopes
            .last_mut()
            .expect("scope stack empty")
            .declares
            .push((name.to_string(), lbl));
        Ok(lbl)
    }

    /// Define a command, resolving a pending declaration if one exists.
    /// Returns the label to place at the command head.
    pub fn define_cmd(&mut self, names: &[String]) -> Result<LblIdx, String> {
        let (leaf, parents) = names.split_last().expect("empty command path");

        if parents.is_empty() {
            // A pending declare in any scope of this frame is resolved by
            // this definition.
            let level = self.level();
            for scope in self.scopes.iter_mut().rev() {
                if scope.frame_level != level {
                    break;
                }
                if let Some(i) = scope.declares.iter().position(|(n, _)| n == leaf) {
                    let (_, lbl) = scope.declares.remove(i);
                    return Ok(lbl);
                }
            }
            let lbl = self.new_label(leaf);
            self.add_name(
                leaf,
                NsName::CmdLocal {
                    level: level + 1,
                    lbl,
                },
            )?;
            return Ok(lbl);
        }

        let pushed = self.push_namespace(parents)?;
        let lbl = self.new_label(&names.join("."));
        let level = self.level() + 1;
        let result = self.add_name(leaf, NsName::CmdLocal { level, lbl });
        self.pop_namespaces(pushed);
        result?;
        Ok(lbl)
    }

    // ========================================================================
    // LABELS
    // ========================================================================

    /// Create a label owned by the current frame.
    pub fn new_label(&mut self, name: &str) -> LblIdx {
        let idx = LblIdx(self.labels.len() as u32);
        self.labels.push(Label::new(name));
        self.frame().lbls.push(idx);
        idx
    }

    pub fn label(&self, idx: LblIdx) -> &Label {
        &self.labels[idx.0 as usize]
    }

    pub fn label_mut(&mut self, idx: LblIdx) -> &mut Label {
        &mut self.labels[idx.0 as usize]
    }

    /// Find or create the goto target `name` in the current frame.
    pub fn goto_label(&mut self, name: &str) -> LblIdx {
        if let Some(&lbl) = self.frame().goto_lbls.get(name) {
            return lbl;
        }
        let lbl = self.new_label(name);
        self.frame().goto_lbls.insert(name.to_string(), lbl);
        lbl
    }
}

#[cfg(test)]
mod tests;
