//! Opcode definitions and parameter categories.
//!
//! The bytecode is a variable-length byte stream: one opcode byte followed
//! by a parameter block whose shape is drawn from a fixed set of
//! categories ([`OpParams`]). The same table drives the code generator's
//! emitter, the VM's decoder, and the validator's boundary scan, so the
//! three can never disagree about instruction lengths.
//!
//! A "var" parameter is two bytes: frame level, then slot index. Jump and
//! call locations are 4-byte little-endian byte offsets into the opcode
//! stream; `0xFFFFFFFF` is the REPL back-patch sentinel. Argument lists
//! are a 1-byte count followed by that many vars.

/// Parameter block shapes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpParams {
    /// No parameters.
    None,
    /// One var.
    V,
    /// Two vars.
    VV,
    /// Three vars.
    VVV,
    /// Four vars.
    VVVV,
    /// Var + 8-byte IEEE-754 immediate.
    VF,
    /// Var + one immediate byte.
    VU8,
    /// Var + 4-byte string-table index.
    VS,
    /// Two immediate bytes (command head: level, rest position).
    U8U8,
    /// 4-byte jump location.
    L,
    /// Var + 4-byte jump location.
    VL,
    /// Result var + 4-byte call location + argument list.
    Call,
    /// 4-byte call location + argument list (tail call).
    TailCall,
    /// Result var + 4-byte key-table index + argument list.
    Native,
    /// Result var + argument list.
    VArgs,
    /// Argument list only.
    Args,
}

macro_rules! ops {
    ($($name:ident = $val:literal => $params:ident,)*) => {
        /// Every primary opcode. Synthetic commands (`>`, `>=`, `pick`,
        /// `embed`, `isnative`) are resolved at emit time and never appear
        /// in the byte stream.
        #[repr(u8)]
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub enum Op {
            $($name = $val,)*
        }

        impl Op {
            /// Decode one opcode byte.
            pub fn from_u8(byte: u8) -> Option<Op> {
                match byte {
                    $($val => Some(Op::$name),)*
                    _ => None,
                }
            }

            /// The parameter block shape that follows this opcode.
            pub fn params(self) -> OpParams {
                match self {
                    $(Op::$name => OpParams::$params,)*
                }
            }
        }
    };
}

ops! {
    // Core
    Nop        = 0x00 => None,
    Move       = 0x01 => VV,
    Nil        = 0x02 => V,
    NumP8      = 0x03 => VU8,
    NumN8      = 0x04 => VU8,
    Num        = 0x05 => VF,
    Str        = 0x06 => VS,
    List       = 0x07 => VU8,
    IsNum      = 0x08 => VV,
    IsStr      = 0x09 => VV,
    IsList     = 0x0A => VV,
    Not        = 0x0B => VV,
    Size       = 0x0C => VV,
    Cat        = 0x0D => VArgs,
    Lt         = 0x0E => VVV,
    LtEqu      = 0x0F => VVV,
    Neq        = 0x10 => VVV,
    Equ        = 0x11 => VVV,
    GetAt      = 0x12 => VVV,
    SetAt      = 0x13 => VVV,
    Slice      = 0x14 => VVVV,
    Splice     = 0x15 => VVVV,
    Neg        = 0x16 => VV,
    Add        = 0x17 => VVV,
    Sub        = 0x18 => VVV,
    Mul        = 0x19 => VVV,
    Div        = 0x1A => VVV,
    Mod        = 0x1B => VVV,
    Pow        = 0x1C => VVV,
    Jump       = 0x1D => L,
    JumpTrue   = 0x1E => VL,
    JumpFalse  = 0x1F => VL,
    CmdHead    = 0x20 => U8U8,
    Call       = 0x21 => Call,
    Native     = 0x22 => Native,
    Return     = 0x23 => V,
    ReturnTail = 0x24 => TailCall,
    Range      = 0x25 => VVVV,
    Order      = 0x26 => VVV,
    Say        = 0x27 => VArgs,
    Warn       = 0x28 => VArgs,
    Ask        = 0x29 => VArgs,
    Exit       = 0x2A => Args,
    Abort      = 0x2B => Args,
    StackTrace = 0x2C => V,
    ToNum      = 0x2D => VV,

    // num
    NumAbs      = 0x30 => VV,
    NumSign     = 0x31 => VV,
    NumMax      = 0x32 => VArgs,
    NumMin      = 0x33 => VArgs,
    NumClamp    = 0x34 => VVVV,
    NumFloor    = 0x35 => VV,
    NumCeil     = 0x36 => VV,
    NumRound    = 0x37 => VV,
    NumTrunc    = 0x38 => VV,
    NumNan      = 0x39 => V,
    NumInf      = 0x3A => V,
    NumIsNan    = 0x3B => VV,
    NumIsFinite = 0x3C => VV,
    NumSin      = 0x3D => VV,
    NumCos      = 0x3E => VV,
    NumTan      = 0x3F => VV,
    NumAsin     = 0x40 => VV,
    NumAcos     = 0x41 => VV,
    NumAtan     = 0x42 => VV,
    NumAtan2    = 0x43 => VVV,
    NumLog      = 0x44 => VV,
    NumLog2     = 0x45 => VV,
    NumLog10    = 0x46 => VV,
    NumExp      = 0x47 => VV,
    NumLerp     = 0x48 => VVVV,
    NumHex      = 0x49 => VVV,
    NumOct      = 0x4A => VVV,
    NumBin      = 0x4B => VVV,

    // int (32-bit wrapping)
    IntNew   = 0x50 => VV,
    IntNot   = 0x51 => VV,
    IntAnd   = 0x52 => VArgs,
    IntOr    = 0x53 => VArgs,
    IntXor   = 0x54 => VArgs,
    IntShl   = 0x55 => VVV,
    IntShr   = 0x56 => VVV,
    IntSar   = 0x57 => VVV,
    IntAdd   = 0x58 => VVV,
    IntSub   = 0x59 => VVV,
    IntMul   = 0x5A => VVV,
    IntDiv   = 0x5B => VVV,
    IntMod   = 0x5C => VVV,
    IntClz   = 0x5D => VV,
    IntPop   = 0x5E => VV,
    IntBswap = 0x5F => VV,

    // rand
    RandSeed     = 0x60 => VV,
    RandSeedAuto = 0x61 => V,
    RandInt      = 0x62 => V,
    RandNum      = 0x63 => V,
    RandRange    = 0x64 => VVVV,
    RandGetState = 0x65 => V,
    RandSetState = 0x66 => VV,
    RandPick     = 0x67 => VV,
    RandShuffle  = 0x68 => VV,

    // str
    StrNew     = 0x70 => VArgs,
    StrSplit   = 0x71 => VVV,
    StrReplace = 0x72 => VVVV,
    StrBegins  = 0x73 => VVV,
    StrEnds    = 0x74 => VVV,
    StrPad     = 0x75 => VVV,
    StrFind    = 0x76 => VVVV,
    StrRFind   = 0x77 => VVVV,
    StrLower   = 0x78 => VV,
    StrUpper   = 0x79 => VV,
    StrTrim    = 0x7A => VV,
    StrRev     = 0x7B => VV,
    StrRep     = 0x7C => VVV,
    StrList    = 0x7D => VV,
    StrByte    = 0x7E => VVV,
    StrHash    = 0x7F => VVV,

    // utf8
    Utf8Valid = 0x80 => VV,
    Utf8List  = 0x81 => VV,
    Utf8Str   = 0x82 => VV,

    // struct
    StructSize = 0x83 => VV,
    StructStr  = 0x84 => VVV,
    StructList = 0x85 => VVV,
    StructIsLE = 0x86 => V,

    // list
    ListNew     = 0x90 => VVV,
    ListShift   = 0x91 => VV,
    ListPop     = 0x92 => VV,
    ListPush    = 0x93 => VVV,
    ListUnshift = 0x94 => VVV,
    ListAppend  = 0x95 => VVV,
    ListPrepend = 0x96 => VVV,
    ListFind    = 0x97 => VVVV,
    ListRFind   = 0x98 => VVVV,
    ListJoin    = 0x99 => VVV,
    ListRev     = 0x9A => VV,
    ListStr     = 0x9B => VV,
    ListSort    = 0x9C => VV,
    ListRSort   = 0x9D => VV,

    // pickle
    PickleJson     = 0xA0 => VV,
    PickleBin      = 0xA1 => VV,
    PickleVal      = 0xA2 => VV,
    PickleValid    = 0xA3 => VV,
    PickleSibling  = 0xA4 => VV,
    PickleCircular = 0xA5 => VV,
    PickleCopy     = 0xA6 => VV,
}

/// The REPL back-patch sentinel for jump/call locations.
pub const LOC_SENTINEL: u32 = 0xFFFF_FFFF;

/// How a built-in command lowers at a call site.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpCmd {
    /// Inline op with a fixed parameter count; missing arguments are
    /// filled with nil.
    Fixed(Op, u8),
    /// Inline op taking the whole argument list.
    Variadic(Op),
    /// `pick(c, t, f)`: compiles to a short-circuit conditional.
    Pick,
    /// `embed 'path'`: file contents inlined as a string constant.
    Embed,
    /// `isnative cmd`: compile-time check for a registered native.
    IsNative,
}

/// Built-in commands, registered into the symbol table at startup.
/// Dotted entries live in sub-namespaces (`num.abs` is `abs` inside the
/// `num` namespace).
pub const STDLIB: &[(&str, OpCmd)] = &[
    ("say", OpCmd::Variadic(Op::Say)),
    ("warn", OpCmd::Variadic(Op::Warn)),
    ("ask", OpCmd::Variadic(Op::Ask)),
    ("exit", OpCmd::Variadic(Op::Exit)),
    ("abort", OpCmd::Variadic(Op::Abort)),
    ("stacktrace", OpCmd::Fixed(Op::StackTrace, 0)),
    ("range", OpCmd::Fixed(Op::Range, 3)),
    ("order", OpCmd::Fixed(Op::Order, 2)),
    ("pick", OpCmd::Pick),
    ("embed", OpCmd::Embed),
    ("isnative", OpCmd::IsNative),
    ("isnum", OpCmd::Fixed(Op::IsNum, 1)),
    ("isstr", OpCmd::Fixed(Op::IsStr, 1)),
    ("islist", OpCmd::Fixed(Op::IsList, 1)),
    ("num.abs", OpCmd::Fixed(Op::NumAbs, 1)),
    ("num.sign", OpCmd::Fixed(Op::NumSign, 1)),
    ("num.max", OpCmd::Variadic(Op::NumMax)),
    ("num.min", OpCmd::Variadic(Op::NumMin)),
    ("num.clamp", OpCmd::Fixed(Op::NumClamp, 3)),
    ("num.floor", OpCmd::Fixed(Op::NumFloor, 1)),
    ("num.ceil", OpCmd::Fixed(Op::NumCeil, 1)),
    ("num.round", OpCmd::Fixed(Op::NumRound, 1)),
    ("num.trunc", OpCmd::Fixed(Op::NumTrunc, 1)),
    ("num.nan", OpCmd::Fixed(Op::NumNan, 0)),
    ("num.inf", OpCmd::Fixed(Op::NumInf, 0)),
    ("num.isnan", OpCmd::Fixed(Op::NumIsNan, 1)),
    ("num.isfinite", OpCmd::Fixed(Op::NumIsFinite, 1)),
    ("num.sin", OpCmd::Fixed(Op::NumSin, 1)),
    ("num.cos", OpCmd::Fixed(Op::NumCos, 1)),
    ("num.tan", OpCmd::Fixed(Op::NumTan, 1)),
    ("num.asin", OpCmd::Fixed(Op::NumAsin, 1)),
    ("num.acos", OpCmd::Fixed(Op::NumAcos, 1)),
    ("num.atan", OpCmd::Fixed(Op::NumAtan, 1)),
    ("num.atan2", OpCmd::Fixed(Op::NumAtan2, 2)),
    ("num.log", OpCmd::Fixed(Op::NumLog, 1)),
    ("num.log2", OpCmd::Fixed(Op::NumLog2, 1)),
    ("num.log10", OpCmd::Fixed(Op::NumLog10, 1)),
    ("num.exp", OpCmd::Fixed(Op::NumExp, 1)),
    ("num.lerp", OpCmd::Fixed(Op::NumLerp, 3)),
    ("num.hex", OpCmd::Fixed(Op::NumHex, 2)),
    ("num.oct", OpCmd::Fixed(Op::NumOct, 2)),
    ("num.bin", OpCmd::Fixed(Op::NumBin, 2)),
    ("int.new", OpCmd::Fixed(Op::IntNew, 1)),
    ("int.not", OpCmd::Fixed(Op::IntNot, 1)),
    ("int.and", OpCmd::Variadic(Op::IntAnd)),
    ("int.or", OpCmd::Variadic(Op::IntOr)),
    ("int.xor", OpCmd::Variadic(Op::IntXor)),
    ("int.shl", OpCmd::Fixed(Op::IntShl, 2)),
    ("int.shr", OpCmd::Fixed(Op::IntShr, 2)),
    ("int.sar", OpCmd::Fixed(Op::IntSar, 2)),
    ("int.add", OpCmd::Fixed(Op::IntAdd, 2)),
    ("int.sub", OpCmd::Fixed(Op::IntSub, 2)),
    ("int.mul", OpCmd::Fixed(Op::IntMul, 2)),
    ("int.div", OpCmd::Fixed(Op::IntDiv, 2)),
    ("int.mod", OpCmd::Fixed(Op::IntMod, 2)),
    ("int.clz", OpCmd::Fixed(Op::IntClz, 1)),
    ("int.pop", OpCmd::Fixed(Op::IntPop, 1)),
    ("int.bswap", OpCmd::Fixed(Op::IntBswap, 1)),
    ("rand.seed", OpCmd::Fixed(Op::RandSeed, 1)),
    ("rand.seedauto", OpCmd::Fixed(Op::RandSeedAuto, 0)),
    ("rand.int", OpCmd::Fixed(Op::RandInt, 0)),
    ("rand.num", OpCmd::Fixed(Op::RandNum, 0)),
    ("rand.range", OpCmd::Fixed(Op::RandRange, 3)),
    ("rand.getstate", OpCmd::Fixed(Op::RandGetState, 0)),
    ("rand.setstate", OpCmd::Fixed(Op::RandSetState, 1)),
    ("rand.pick", OpCmd::Fixed(Op::RandPick, 1)),
    ("rand.shuffle", OpCmd::Fixed(Op::RandShuffle, 1)),
    ("str.new", OpCmd::Variadic(Op::StrNew)),
    ("str.split", OpCmd::Fixed(Op::StrSplit, 2)),
    ("str.replace", OpCmd::Fixed(Op::StrReplace, 3)),
    ("str.begins", OpCmd::Fixed(Op::StrBegins, 2)),
    ("str.ends", OpCmd::Fixed(Op::StrEnds, 2)),
    ("str.pad", OpCmd::Fixed(Op::StrPad, 2)),
    ("str.find", OpCmd::Fixed(Op::StrFind, 3)),
    ("str.rfind", OpCmd::Fixed(Op::StrRFind, 3)),
    ("str.lower", OpCmd::Fixed(Op::StrLower, 1)),
    ("str.upper", OpCmd::Fixed(Op::StrUpper, 1)),
    ("str.trim", OpCmd::Fixed(Op::StrTrim, 1)),
    ("str.rev", OpCmd::Fixed(Op::StrRev, 1)),
    ("str.rep", OpCmd::Fixed(Op::StrRep, 2)),
    ("str.list", OpCmd::Fixed(Op::StrList, 1)),
    ("str.byte", OpCmd::Fixed(Op::StrByte, 2)),
    ("str.hash", OpCmd::Fixed(Op::StrHash, 2)),
    ("utf8.valid", OpCmd::Fixed(Op::Utf8Valid, 1)),
    ("utf8.list", OpCmd::Fixed(Op::Utf8List, 1)),
    ("utf8.str", OpCmd::Fixed(Op::Utf8Str, 1)),
    ("struct.size", OpCmd::Fixed(Op::StructSize, 1)),
    ("struct.str", OpCmd::Fixed(Op::StructStr, 2)),
    ("struct.list", OpCmd::Fixed(Op::StructList, 2)),
    ("struct.isLE", OpCmd::Fixed(Op::StructIsLE, 0)),
    ("list.new", OpCmd::Fixed(Op::ListNew, 2)),
    ("list.shift", OpCmd::Fixed(Op::ListShift, 1)),
    ("list.pop", OpCmd::Fixed(Op::ListPop, 1)),
    ("list.push", OpCmd::Fixed(Op::ListPush, 2)),
    ("list.unshift", OpCmd::Fixed(Op::ListUnshift, 2)),
    ("list.append", OpCmd::Fixed(Op::ListAppend, 2)),
    ("list.prepend", OpCmd::Fixed(Op::ListPrepend, 2)),
    ("list.find", OpCmd::Fixed(Op::ListFind, 3)),
    ("list.rfind", OpCmd::Fixed(Op::ListRFind, 3)),
    ("list.join", OpCmd::Fixed(Op::ListJoin, 2)),
    ("list.rev", OpCmd::Fixed(Op::ListRev, 1)),
    ("list.str", OpCmd::Fixed(Op::ListStr, 1)),
    ("list.sort", OpCmd::Fixed(Op::ListSort, 1)),
    ("list.rsort", OpCmd::Fixed(Op::ListRSort, 1)),
    ("pickle.json", OpCmd::Fixed(Op::PickleJson, 1)),
    ("pickle.bin", OpCmd::Fixed(Op::PickleBin, 1)),
    ("pickle.val", OpCmd::Fixed(Op::PickleVal, 1)),
    ("pickle.valid", OpCmd::Fixed(Op::PickleValid, 1)),
    ("pickle.sibling", OpCmd::Fixed(Op::PickleSibling, 1)),
    ("pickle.circular", OpCmd::Fixed(Op::PickleCircular, 1)),
    ("pickle.copy", OpCmd::Fixed(Op::PickleCopy, 1)),
];
