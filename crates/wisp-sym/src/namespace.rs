//! Namespaces and the entries they hold.

use indexmap::IndexMap;
use wisp_prog::OpCmd;

/// Index into the symbol table's namespace arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NsIdx(pub u32);

/// Index into the symbol table's label arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LblIdx(pub u32);

/// What a name resolves to.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum NsName {
    /// A variable slot: frame level and slot index.
    Var { level: u8, index: u8 },
    /// A compile-time enum constant.
    EnumVal(f64),
    /// A script-defined command; `level` is the lexical level its body
    /// runs at, `lbl` its entry label.
    CmdLocal { level: u8, lbl: LblIdx },
    /// A host command addressed by the hash of its qualified name.
    CmdNative(u64),
    /// A built-in that lowers to an opcode (or compile-time form).
    CmdOpcode(OpCmd),
    /// A child namespace.
    Sub(NsIdx),
}

/// One namespace: an ordered name map plus `using` back-references to
/// other namespaces searched after it.
#[derive(Debug, Default)]
pub struct Namespace {
    pub names: IndexMap<String, NsName>,
    pub usings: Vec<NsIdx>,
}

impl Namespace {
    pub fn new() -> Self {
        Self::default()
    }
}
