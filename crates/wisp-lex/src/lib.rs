//! wisp-lex - Lexical analysis for the wisp scripting language.
//!
//! ============================================================================
//! OVERVIEW
//! ============================================================================
//!
//! The lexer is a character-driven finite state machine. It is fed source
//! bytes incrementally (the compiler's write entry point accepts arbitrary
//! chunks) and appends [`Token`]s to an output vector as they complete.
//!
//! Token categories:
//!
//! 1. KEYWORDS AND OPERATORS - one [`KeySym`] enum covers both, including
//!    the distinct unary `+`/`-` symbols resolved via lookbehind.
//! 2. IDENTIFIERS - `[A-Za-z_][A-Za-z0-9_]*`.
//! 3. NUMBERS - base 10 by default, `0b`/`0c`/`0x` prefixes, fraction and
//!    exponent parts read in the literal's base.
//! 4. STRINGS - single-quoted (doubled `''` embeds a quote) and
//!    double-quoted with escapes and `$ident` / `${expr}` interpolation.
//!    Interpolation lowers to concatenation tokens during lexing.
//! 5. NEWLINES - every `\n` or `;` becomes a newline token; newlines inside
//!    brackets are soft and the parser may skip them.
//! 6. ERRORS - malformed input becomes an inline [`Token::Error`] and
//!    lexing continues.
//!
//! Comments: `#` to end of line, `/* ... */` blocks (no nesting). A `\` at
//! end of line continues the statement.

pub mod lexer;
pub mod number;
pub mod token;

pub use lexer::Lexer;
pub use number::NumBuilder;
pub use token::{keyword, KeySym, Lexed, Token};
