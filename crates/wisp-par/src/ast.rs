//! Abstract syntax tree.
//!
//! Two layers: expressions and statements. Statements are emitted by the
//! parser one at a time and consumed by the code generator immediately, so
//! there is no whole-program tree; block constructs appear as
//! begin/mid/end statement triples and the generator keeps its own stack.

use wisp_lex::KeySym;
use wisp_util::Pos;

/// An expression.
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Nil(Pos),
    Num(Pos, f64),
    Str(Pos, Vec<u8>),
    /// `{...}` list literal; `None` is the empty list.
    List(Pos, Option<Box<Expr>>),
    /// Dotted name path: `a`, `str.hash`, ...
    Names(Pos, Vec<String>),
    Paren(Pos, Box<Expr>),
    /// Comma group: evaluates each, yields the last; flattened.
    Group(Pos, Vec<Expr>),
    /// `~` concatenation chain; flattened.
    Cat(Pos, Vec<Expr>),
    Prefix(Pos, KeySym, Box<Expr>),
    /// The right side is optional so an assignment target with a missing
    /// operand can still be reported by the generator with a position.
    Infix(Pos, KeySym, Box<Expr>, Option<Box<Expr>>),
    /// Command invocation: `cmd params`. The command is a name path; the
    /// params expression is usually a `Group`.
    Call(Pos, Box<Expr>, Box<Expr>),
    Index(Pos, Box<Expr>, Box<Expr>),
    /// `obj[start:len]`; either bound may be omitted.
    Slice(
        Pos,
        Box<Expr>,
        Option<Box<Expr>>,
        Option<Box<Expr>>,
    ),
}

impl Expr {
    pub fn pos(&self) -> Pos {
        match self {
            Expr::Nil(p)
            | Expr::Num(p, _)
            | Expr::Str(p, _)
            | Expr::List(p, _)
            | Expr::Names(p, _)
            | Expr::Paren(p, _)
            | Expr::Group(p, _)
            | Expr::Cat(p, _)
            | Expr::Prefix(p, _, _)
            | Expr::Infix(p, _, _, _)
            | Expr::Call(p, _, _)
            | Expr::Index(p, _, _)
            | Expr::Slice(p, _, _, _) => *p,
        }
    }

    /// Flatten a group into its items, or wrap a single expression.
    pub fn into_items(self) -> Vec<Expr> {
        match self {
            Expr::Group(_, items) => items,
            other => vec![other],
        }
    }
}

/// One name declared by a `declare` statement.
#[derive(Clone, Debug, PartialEq)]
pub struct DeclareItem {
    pub pos: Pos,
    pub names: Vec<String>,
    /// Native key string; `None` declares a forward local command.
    pub key: Option<Vec<u8>>,
}

/// One file pulled in by an `include` statement.
#[derive(Clone, Debug, PartialEq)]
pub struct IncludeItem {
    pub pos: Pos,
    /// Optional namespace to wrap the included file in.
    pub names: Option<Vec<String>>,
    pub path: Vec<u8>,
}

/// Loop header for `for`.
#[derive(Clone, Debug, PartialEq)]
pub struct ForHeader {
    /// True when written `for var v ...`, declaring fresh variables.
    pub new_vars: bool,
    /// Value name, and optionally the index name.
    pub names: Vec<String>,
    pub iter: Expr,
}

/// A statement, as emitted incrementally by the parser.
#[derive(Clone, Debug, PartialEq)]
pub enum Stmt {
    Break(Pos),
    Continue(Pos),
    Declare(Pos, Vec<DeclareItem>),
    /// `def names params...` opening a command body.
    DefBegin(Pos, Vec<String>, Vec<Expr>),
    DefEnd(Pos),
    DoBegin(Pos),
    /// The `while cond` divider inside a `do` block.
    DoWhile(Pos, Expr),
    DoEnd(Pos),
    Enum(Pos, Vec<(String, Option<Expr>)>),
    ForBegin(Pos, ForHeader),
    ForEnd(Pos),
    Goto(Pos, String),
    IfBegin(Pos),
    /// The condition of `if` or `elseif`.
    IfCond(Pos, Expr),
    IfElse(Pos),
    IfEnd(Pos),
    Include(Pos, Vec<IncludeItem>),
    NamespaceBegin(Pos, Vec<String>),
    NamespaceEnd(Pos),
    Return(Pos, Expr),
    Using(Pos, Vec<Vec<String>>),
    /// Variable declarations; each item is a name, an assignment, or a
    /// destructuring pattern.
    Var(Pos, Vec<Expr>),
    /// Bare expression evaluated for effect.
    Eval(Pos, Expr),
    Label(Pos, String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use wisp_util::Pos;

    #[test]
    fn test_into_items_flattens_group() {
        let g = Expr::Group(
            Pos::DUMMY,
            vec![Expr::Num(Pos::DUMMY, 1.0), Expr::Num(Pos::DUMMY, 2.0)],
        );
        assert_eq!(g.into_items().len(), 2);
    }

    #[test]
    fn test_into_items_wraps_single() {
        let e = Expr::Nil(Pos::DUMMY);
        assert_eq!(e.into_items(), vec![Expr::Nil(Pos::DUMMY)]);
    }
}
