//! The in-memory program and its serialized form.
//!
//! A program is six parallel tables plus flags:
//!
//! 1. string constants
//! 2. native-command key hashes
//! 3. debug strings (basefile names and command hints)
//! 4. pc -> source position map
//! 5. pc -> command hint map
//! 6. the opcode byte stream
//!
//! # Serialized layout (all integers little-endian)
//!
//! ```text
//! FC 53 6B 01                      magic
//! u32 x6                           table sizes: strings, keys, debug
//!                                  strings, positions, hints, op bytes
//! strings                          u32 length + raw bytes, each
//! keys                             u64 each
//! debug strings                    u32 length + raw bytes, each
//! positions                        u32 pc, line, chr, basefile, each
//! hints                            u32 pc, hint index, each
//! op bytes
//! FD                               terminator
//! ```
//!
//! When the program was compiled without debug info the three debug tables
//! are written with size zero and their sections are omitted.

use crate::op::LOC_SENTINEL;

/// First bytes of a serialized program. `0xFC` can never begin UTF-8 text,
/// which is how binary and source input are told apart.
pub const MAGIC: [u8; 4] = [0xFC, 0x53, 0x6B, 0x01];

/// Final byte of a serialized program.
pub const TERMINATOR: u8 = 0xFD;

/// Hint index meaning "no command" (top-level code).
pub const HINT_NONE: u32 = 0xFFFF_FFFF;

/// One pc -> source position entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PcPos {
    pub pc: u32,
    pub line: u32,
    pub chr: u32,
    /// Index into the debug strings (basefile name).
    pub basefile: u32,
}

/// One pc -> command hint entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PcCmd {
    pub pc: u32,
    /// Index into the debug strings, or [`HINT_NONE`].
    pub hint: u32,
}

/// A compiled program.
#[derive(Clone, Debug, Default)]
pub struct Program {
    /// REPL mode: back-patch sentinels may appear in jump targets and
    /// definitions may be replaced.
    pub repl: bool,
    /// Basefile paths use forward slashes.
    pub posix: bool,
    /// Whether debug tables are written on dump.
    pub debug: bool,
    pub strings: Vec<Vec<u8>>,
    pub keys: Vec<u64>,
    pub debug_strings: Vec<String>,
    pub pos_table: Vec<PcPos>,
    pub cmd_table: Vec<PcCmd>,
    pub ops: Vec<u8>,
}

impl Program {
    pub fn new(repl: bool) -> Self {
        Self {
            repl,
            posix: true,
            debug: true,
            ..Self::default()
        }
    }

    /// Intern a string constant, returning its table index.
    pub fn add_string(&mut self, s: Vec<u8>) -> u32 {
        if let Some(i) = self.strings.iter().position(|x| *x == s) {
            return i as u32;
        }
        self.strings.push(s);
        (self.strings.len() - 1) as u32
    }

    /// Intern a native key hash, returning its table index.
    pub fn add_key(&mut self, key: u64) -> u32 {
        if let Some(i) = self.keys.iter().position(|x| *x == key) {
            return i as u32;
        }
        self.keys.push(key);
        (self.keys.len() - 1) as u32
    }

    /// Intern a debug string, returning its table index.
    pub fn add_debug_string(&mut self, s: &str) -> u32 {
        if let Some(i) = self.debug_strings.iter().position(|x| x == s) {
            return i as u32;
        }
        self.debug_strings.push(s.to_string());
        (self.debug_strings.len() - 1) as u32
    }

    /// Record the source position of the op starting at `pc`. Consecutive
    /// duplicate positions collapse into one entry.
    pub fn add_pos(&mut self, pc: u32, line: u32, chr: u32, basefile: u32) {
        if let Some(last) = self.pos_table.last() {
            if last.line == line && last.chr == chr && last.basefile == basefile {
                return;
            }
            if last.pc == pc {
                self.pos_table.pop();
            }
        }
        self.pos_table.push(PcPos {
            pc,
            line,
            chr,
            basefile,
        });
    }

    /// Record which command the code from `pc` onward belongs to.
    pub fn add_cmd_hint(&mut self, pc: u32, hint: u32) {
        if let Some(last) = self.cmd_table.last_mut() {
            if last.pc == pc {
                last.hint = hint;
                return;
            }
        }
        self.cmd_table.push(PcCmd { pc, hint });
    }

    /// Latest position entry at or before `pc`.
    pub fn pos_at(&self, pc: u32) -> Option<PcPos> {
        match self.pos_table.partition_point(|e| e.pc <= pc) {
            0 => None,
            n => Some(self.pos_table[n - 1]),
        }
    }

    /// Command hint covering `pc`, if any.
    pub fn cmd_hint_at(&self, pc: u32) -> Option<&str> {
        match self.cmd_table.partition_point(|e| e.pc <= pc) {
            0 => None,
            n => {
                let hint = self.cmd_table[n - 1].hint;
                if hint == HINT_NONE {
                    None
                } else {
                    self.debug_strings.get(hint as usize).map(|s| s.as_str())
                }
            }
        }
    }

    /// Basefile name for a position entry.
    pub fn basefile(&self, index: u32) -> Option<&str> {
        self.debug_strings.get(index as usize).map(|s| s.as_str())
    }

    /// Read a 4-byte location at `at` in the op stream.
    pub fn read_loc(&self, at: usize) -> u32 {
        u32::from_le_bytes(self.ops[at..at + 4].try_into().unwrap())
    }

    /// Patch a 4-byte location at `at`.
    pub fn write_loc(&mut self, at: usize, loc: u32) {
        self.ops[at..at + 4].copy_from_slice(&loc.to_le_bytes());
    }

    /// True if any jump location still holds the REPL sentinel at `at`.
    pub fn loc_is_sentinel(&self, at: usize) -> bool {
        self.read_loc(at) == LOC_SENTINEL
    }

    /// Serialize per the layout in the module docs.
    pub fn dump(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&MAGIC);

        let (nd, np, nc) = if self.debug {
            (
                self.debug_strings.len(),
                self.pos_table.len(),
                self.cmd_table.len(),
            )
        } else {
            (0, 0, 0)
        };
        for count in [
            self.strings.len(),
            self.keys.len(),
            nd,
            np,
            nc,
            self.ops.len(),
        ] {
            out.extend_from_slice(&(count as u32).to_le_bytes());
        }

        for s in &self.strings {
            out.extend_from_slice(&(s.len() as u32).to_le_bytes());
            out.extend_from_slice(s);
        }
        for k in &self.keys {
            out.extend_from_slice(&k.to_le_bytes());
        }
        if self.debug {
            for s in &self.debug_strings {
                out.extend_from_slice(&(s.len() as u32).to_le_bytes());
                out.extend_from_slice(s.as_bytes());
            }
            for p in &self.pos_table {
                out.extend_from_slice(&p.pc.to_le_bytes());
                out.extend_from_slice(&p.line.to_le_bytes());
                out.extend_from_slice(&p.chr.to_le_bytes());
                out.extend_from_slice(&p.basefile.to_le_bytes());
            }
            for c in &self.cmd_table {
                out.extend_from_slice(&c.pc.to_le_bytes());
                out.extend_from_slice(&c.hint.to_le_bytes());
            }
        }
        out.extend_from_slice(&self.ops);
        out.push(TERMINATOR);
        out
    }
}
