//! The compiler front: an incremental script builder.
//!
//! A [`Script`] accepts source bytes in arbitrary chunks through
//! [`Script::write`]. The very first byte decides the input kind: `0xFC`
//! can never start UTF-8 text, so it selects the binary program loader;
//! anything else spins up the lexer/parser/generator pipeline. Statements
//! compile as soon as they are syntactically complete, which is what makes
//! REPL use work: compile, run to the edge of the bytecode, print a
//! prompt at [`Script::level`], write more.
//!
//! `include` statements are expanded here. Each included file is lexed and
//! parsed with its own machinery (positions keep their own file id), and
//! the symbol table wraps the content in a namespace: a named one when the
//! include is written `include gfx 'gfx.wisp'`, an anonymous `using`'d one
//! otherwise.

use crate::host::{FsType, IncludeResolver, NoIncludes};
use std::rc::Rc;
use wisp_gen::{EmbedResolver, Gen};
use wisp_lex::Lexer;
use wisp_par::{IncludeItem, Parser, Stmt};
use wisp_prog::{Loader, Program};
use wisp_util::{hash64, CompileError, FileId, Pos};
use wisp_vm::Context;

const MAX_INCLUDE_DEPTH: usize = 32;

struct TextState {
    lexer: Lexer,
    parser: Parser,
}

enum Mode {
    /// No bytes seen yet.
    Unknown,
    Text(Option<TextState>),
    Binary(Box<Loader>),
    Loaded(Box<Program>),
}

/// An incremental compiler for one program.
pub struct Script {
    repl: bool,
    mode: Mode,
    gen: Gen,
    resolver: Box<dyn IncludeResolver>,
    err: Option<CompileError>,
    /// File names by file id; index 0 is the main input.
    files: Vec<String>,
    /// Directory stack for resolving relative includes/embeds.
    dirs: Vec<String>,
    include_depth: usize,
}

impl Script {
    pub fn new(repl: bool) -> Self {
        Self::with_resolver(repl, Box::new(NoIncludes))
    }

    pub fn with_resolver(repl: bool, resolver: Box<dyn IncludeResolver>) -> Self {
        let mut gen = Gen::new(repl);
        gen.set_file(FileId::MAIN, "<input>");
        Self {
            repl,
            mode: Mode::Unknown,
            gen,
            resolver,
            err: None,
            files: vec!["<input>".to_string()],
            dirs: vec![String::new()],
            include_depth: 0,
        }
    }

    /// Name the main input, used in error messages and debug info.
    pub fn set_name(&mut self, name: &str) {
        self.files[0] = name.to_string();
        self.dirs[0] = dir_of(name);
        self.gen.set_file(FileId::MAIN, name);
    }

    /// Register a host native by qualified name. Returns the hash the host
    /// will see in native effects. Also feeds `isnative`.
    pub fn add_native(&mut self, name: &str) -> u64 {
        let hash = hash64(name.as_bytes());
        self.gen.add_native_hash(hash);
        hash
    }

    /// Open block depth, for REPL continuation prompts.
    pub fn level(&self) -> usize {
        match &self.mode {
            Mode::Text(Some(st)) => st.parser.level(),
            _ => 0,
        }
    }

    /// The latched compile error, if any.
    pub fn err(&self) -> Option<&CompileError> {
        self.err.as_ref()
    }

    /// Feed source (or serialized program) bytes, starting at line 1.
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), CompileError> {
        self.write_at(bytes, 0)
    }

    /// Feed bytes; a non-zero `start_line` repositions the lexer first
    /// (REPL hosts report the prompt's line number).
    pub fn write_at(&mut self, bytes: &[u8], start_line: u32) -> Result<(), CompileError> {
        if let Some(err) = &self.err {
            return Err(err.clone());
        }
        if bytes.is_empty() {
            return Ok(());
        }
        if matches!(self.mode, Mode::Unknown) {
            self.mode = if bytes[0] == 0xFC {
                Mode::Binary(Box::new(Loader::new()))
            } else {
                Mode::Text(Some(TextState {
                    lexer: Lexer::new(FileId::MAIN, 1),
                    parser: Parser::new(),
                }))
            };
        }
        let result = match &mut self.mode {
            Mode::Unknown => unreachable!(),
            Mode::Binary(loader) => {
                let mut r = loader
                    .push_bytes(bytes)
                    .map_err(|e| CompileError::new(None, Pos::DUMMY, e.to_string()));
                let done = r.is_ok() && loader.is_done();
                if done {
                    let taken = match std::mem::replace(&mut self.mode, Mode::Unknown) {
                        Mode::Binary(loader) => loader,
                        _ => unreachable!(),
                    };
                    match taken.finish() {
                        Ok(prog) => self.mode = Mode::Loaded(Box::new(prog)),
                        Err(e) => {
                            r = Err(CompileError::new(None, Pos::DUMMY, e.to_string()))
                        }
                    }
                }
                r
            }
            Mode::Loaded(_) => Err(CompileError::new(
                None,
                Pos::DUMMY,
                "unexpected data after terminator".to_string(),
            )),
            Mode::Text(_) => self.consume_top(bytes, start_line, false),
        };
        self.latch(result)
    }

    /// Finish the input: flush the lexer, require all blocks closed (or,
    /// for binary input, the terminator consumed).
    pub fn close(&mut self) -> Result<(), CompileError> {
        if let Some(err) = &self.err {
            return Err(err.clone());
        }
        let result = match &mut self.mode {
            Mode::Unknown => Ok(()),
            Mode::Loaded(_) => Ok(()),
            Mode::Binary(_) => Err(CompileError::new(
                None,
                Pos::DUMMY,
                "unexpected end of program data".to_string(),
            )),
            Mode::Text(_) => self.consume_top(b"", 0, true),
        };
        self.latch(result)
    }

    /// Run the top-level text pipeline; the state is moved out for the
    /// duration so statement processing can borrow the rest of `self`.
    fn consume_top(
        &mut self,
        bytes: &[u8],
        start_line: u32,
        close: bool,
    ) -> Result<(), CompileError> {
        let mut st = match &mut self.mode {
            Mode::Text(state) => state.take().expect("text state in use"),
            _ => unreachable!("consume_top outside text mode"),
        };
        if start_line != 0 {
            st.lexer.set_line(start_line);
        }
        let result = self.consume(&mut st, bytes, close);
        if let Mode::Text(state) = &mut self.mode {
            *state = Some(st);
        }
        result
    }

    /// Load a whole file through the include resolver.
    pub fn load_file(&mut self, path: &str) -> Result<(), CompileError> {
        match self.resolver.fs_type(path.as_bytes()) {
            FsType::File => {}
            FsType::Dir => {
                return Err(CompileError::new(
                    None,
                    Pos::DUMMY,
                    format!("cannot load directory \"{}\"", path),
                ))
            }
            FsType::None => {
                return Err(CompileError::new(
                    None,
                    Pos::DUMMY,
                    format!("file not found: \"{}\"", path),
                ))
            }
        }
        let bytes = self.resolver.read(path.as_bytes()).ok_or_else(|| {
            CompileError::new(None, Pos::DUMMY, format!("cannot read \"{}\"", path))
        })?;
        self.set_name(path);
        self.write(&bytes)?;
        self.close()
    }

    /// The compiled program so far.
    pub fn program(&self) -> Program {
        match &self.mode {
            Mode::Loaded(prog) => (**prog).clone(),
            _ => self.gen.prog.clone(),
        }
    }

    /// Serialize the program; see the program-format docs.
    pub fn dump(&self) -> Vec<u8> {
        self.program().dump()
    }

    /// Build a fresh execution context over the compiled program.
    pub fn context(&self) -> Context {
        Context::new(Rc::new(self.program()))
    }

    // ========================================================================
    // INTERNALS
    // ========================================================================

    fn latch(&mut self, result: Result<(), CompileError>) -> Result<(), CompileError> {
        if let Err(e) = &result {
            // The REPL keeps accepting input after an error; batch
            // compilation stops at the first one.
            if !self.repl {
                self.err = Some(e.clone());
            }
        }
        result
    }

    fn error_at(&self, pos: Pos, msg: String) -> CompileError {
        let file = self
            .files
            .get(pos.file.index())
            .filter(|f| !f.is_empty())
            .cloned();
        CompileError::new(file, pos, msg)
    }

    /// Lex, parse, and compile a chunk within one text stream.
    fn consume(
        &mut self,
        st: &mut TextState,
        bytes: &[u8],
        close: bool,
    ) -> Result<(), CompileError> {
        let mut toks = Vec::new();
        st.lexer.push_bytes(bytes, &mut toks);
        if close {
            st.lexer.close(&mut toks);
        }
        let mut stmts = Vec::new();
        for (tok, pos) in &toks {
            if let Err((epos, msg)) = st.parser.add(tok, *pos, &mut stmts) {
                st.parser.reset();
                return Err(self.error_at(epos, msg));
            }
            for stmt in stmts.drain(..) {
                self.process_stmt(&stmt)?;
            }
        }
        if close {
            let mut rest = Vec::new();
            st.parser
                .close(&mut rest)
                .map_err(|(p, m)| self.error_at(p, m))?;
        }
        Ok(())
    }

    fn process_stmt(&mut self, stmt: &Stmt) -> Result<(), CompileError> {
        if let Stmt::Include(pos, items) = stmt {
            for item in items.iter().cloned() {
                self.process_include(*pos, item)?;
            }
            return Ok(());
        }
        let base = self.dirs.last().cloned().unwrap_or_default();
        let mut embeds = EmbedAdapter {
            resolver: self.resolver.as_mut(),
            base: &base,
        };
        let result = self.gen.add_stmt(stmt, &mut embeds);
        result.map_err(|(p, m)| self.error_at(p, m))
    }

    fn process_include(&mut self, pos: Pos, item: IncludeItem) -> Result<(), CompileError> {
        if self.include_depth >= MAX_INCLUDE_DEPTH {
            return Err(self.error_at(pos, "includes nested too deeply".to_string()));
        }
        let rel = String::from_utf8_lossy(&item.path).into_owned();
        let base = self.dirs.last().cloned().unwrap_or_default();
        let path = resolve_path(&base, &rel);
        match self.resolver.fs_type(path.as_bytes()) {
            FsType::File => {}
            FsType::Dir => {
                return Err(
                    self.error_at(pos, format!("cannot include directory \"{}\"", path))
                )
            }
            FsType::None => {
                return Err(self.error_at(pos, format!("file not found: \"{}\"", path)))
            }
        }
        let bytes = self
            .resolver
            .read(path.as_bytes())
            .ok_or_else(|| self.error_at(pos, format!("cannot read \"{}\"", path)))?;

        let file = FileId::new(self.files.len() as u32);
        self.files.push(path.clone());
        self.gen.set_file(file, &path);

        let pushed = self
            .gen
            .include_begin(item.names.as_deref())
            .map_err(|m| self.error_at(pos, m))?;
        self.dirs.push(dir_of(&path));
        self.include_depth += 1;

        let mut st = TextState {
            lexer: Lexer::new(file, 1),
            parser: Parser::new(),
        };
        let result = self.consume(&mut st, &bytes, true);

        self.include_depth -= 1;
        self.dirs.pop();
        self.gen.include_end(pushed);
        result
    }
}

struct EmbedAdapter<'a> {
    resolver: &'a mut dyn IncludeResolver,
    base: &'a str,
}

impl EmbedResolver for EmbedAdapter<'_> {
    fn read(&mut self, path: &[u8]) -> Option<Vec<u8>> {
        let rel = String::from_utf8_lossy(path);
        let full = resolve_path(self.base, &rel);
        self.resolver.read(full.as_bytes())
    }
}

/// Directory part of a posix-style path; empty for bare names.
fn dir_of(path: &str) -> String {
    match path.rfind('/') {
        Some(i) => path[..i].to_string(),
        None => String::new(),
    }
}

/// Resolve `rel` against `base`, collapsing `.` and `..` components.
fn resolve_path(base: &str, rel: &str) -> String {
    let mut parts: Vec<&str> = if rel.starts_with('/') {
        Vec::new()
    } else {
        base.split('/').filter(|p| !p.is_empty()).collect()
    };
    for part in rel.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            p => parts.push(p),
        }
    }
    let joined = parts.join("/");
    if rel.starts_with('/') {
        format!("/{}", joined)
    } else {
        joined
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_path() {
        assert_eq!(resolve_path("", "boot.wisp"), "boot.wisp");
        assert_eq!(resolve_path("lib", "util.wisp"), "lib/util.wisp");
        assert_eq!(resolve_path("lib/gfx", "../snd/mix.wisp"), "lib/snd/mix.wisp");
        assert_eq!(resolve_path("lib", "/abs.wisp"), "/abs.wisp");
        assert_eq!(resolve_path("a/b", "./c.wisp"), "a/b/c.wisp");
    }

    #[test]
    fn test_dir_of() {
        assert_eq!(dir_of("a/b/c.wisp"), "a/b");
        assert_eq!(dir_of("c.wisp"), "");
    }
}
