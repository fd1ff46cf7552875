//! The Murmur opcode set and instruction encoding.
//!
//! Instructions are one-byte opcodes followed by 0-3 bytes of immediate operands. 16-bit
//! constant indices are big-endian. A send site is three bytes (opcode + 16-bit constant index);
//! the high bit of the index is the compiler's tail-call-allowed flag and must be masked off
//! before use.
//!
//! Several opcode families rely on their declaration order:
//! - the block-send variants are addressed as `SendBlock + adjust` where bit 0 of `adjust` is
//!   the tail flag and bit 1 the local flag;
//! - the match-send and call-message block variants are addressed as `base + tail`;
//! - the trim specializations are addressed as `TrimExactly0 + want`, `TrimDown1 + (delta - 1)`
//!   and `TrimUp1 + (delta - 1)`.

/// Width of a send site in bytes: the opcode plus a 16-bit constant index.
pub const SEND_SITE_LEN: usize = 3;

/// Number of `(type, spec, offset)` entries in a send-site cache block.
pub const SEND_CACHE_SIZE: usize = 4;

/// High bit of a send's 16-bit operand: the compiler's tail-call-allowed flag.
pub const TAIL_FLAG: u16 = 0x8000;

/// Offsets of the cells within a send-site cache block in the constant pool.
///
/// The block spans `SEND_CACHE_LEN` cells: the message, the specs-generation snapshot, the
/// generic call-message slot, then `SEND_CACHE_SIZE` entries of three cells each.
pub mod cache {
    use super::SEND_CACHE_SIZE;

    pub const MESSAGE: usize = 0;
    pub const GENERATION: usize = 1;
    pub const GENERIC: usize = 2;
    pub const ENTRIES: usize = 3;

    pub const ENTRY_TYPE: usize = 0;
    pub const ENTRY_SPEC: usize = 1;
    pub const ENTRY_OFFSET: usize = 2;
    pub const ENTRY_LEN: usize = 3;

    /// Total cells reserved per send site.
    pub const LEN: usize = ENTRIES + SEND_CACHE_SIZE * ENTRY_LEN;

    /// Index of cell `cell` of entry `entry`, relative to the cache base.
    pub const fn entry(entry: usize, cell: usize) -> usize {
        ENTRIES + entry * ENTRY_LEN + cell
    }
}

macro_rules! define_opcodes {
    ($($name:ident),+ $(,)?) => {
        /// A bytecode operation.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum Op {
            $($name),+
        }

        impl Op {
            const TABLE: &'static [Op] = &[$(Op::$name),+];

            /// Number of defined opcodes.
            pub const COUNT: usize = Self::TABLE.len();

            /// Decodes an opcode byte.
            #[inline(always)]
            pub fn decode(byte: u8) -> Option<Self> {
                Self::TABLE.get(byte as usize).copied()
            }

            /// The opcode's declared name, for logging and disassembly.
            pub const fn name(self) -> &'static str {
                match self {
                    $(Op::$name => stringify!($name)),+
                }
            }
        }
    };
}

define_opcodes! {
    Nop,

    // constants and locals
    Constant,
    NConstant,
    LoadLocal,
    NLoadLocal,
    StoreLocal,
    PopStoreLocal,
    NPopStoreLocal,
    NPopStoreStoreLocal,
    LoadUpvalue,
    NLoadUpvalue,
    Pop,
    PopN,
    Block,

    // tuple discipline
    Tuple,
    NTuple,
    Cons,
    TupleConstant,
    TupleNConstant,
    TupleLoadLocal,
    TupleNLoadLocal,
    NTupleConstant,
    NTupleNConstant,
    NTupleLoadLocal,
    NTupleNLoadLocal,
    PackRecord,
    PackList,

    // arity reconciliation; the specialized forms are addressed arithmetically from Trim
    Trim,
    TrimExactly0,
    TrimExactly1,
    TrimExactly2,
    TrimExactly3,
    TrimExactly4,
    TrimExactly5,
    TrimExactly6,
    TrimExactly7,
    TrimExactly8,
    TrimExactly9,
    TrimDown1,
    TrimDown2,
    TrimDown3,
    TrimDown4,
    TrimDown5,
    TrimDown6,
    TrimDown7,
    TrimDown8,
    TrimDown9,
    TrimUp1,
    TrimUp2,
    TrimUp3,
    TrimUp4,
    TrimUp5,
    TrimUp6,
    TrimUp7,
    TrimUp8,
    TrimUp9,

    Return,

    // sends: slow path, then the specialized variants
    Send,
    SendBlock,
    TailsendBlock,
    LocalsendBlock,
    LocaltailsendBlock,
    SendNative,
    SendProperty,
    SendConstant,
    MatchsendBlock,
    MatchtailsendBlock,

    // generic message calls and their specializations
    SendPrimitiveCallMessage,
    CallMessageBlock,
    TailcallMessageBlock,
    CallMessageNative,
    CallMessageConstant,
    CallMessageProperty,
    CallMessagePrimitive,

    // primitive sends
    SendPrimitiveAdd,
    SendPrimitiveSub,
    SendPrimitiveMul,
    SendPrimitiveDiv,
    SendPrimitiveMod,
    SendPrimitiveLt,
    SendPrimitiveLte,
    SendPrimitiveGt,
    SendPrimitiveGte,
    SendPrimitiveEq,
    SendPrimitiveBnd,
    SendPrimitiveBor,
    SendPrimitiveBin,
    SendPrimitiveLsh,
    SendPrimitiveRsh,
    SendPrimitiveLnd,
    SendPrimitiveLor,
    SendPrimitiveLin,
    SendPrimitiveConcat,
    SendPrimitiveType,
    SendPrimitiveTake,
    SendPrimitivePut,
    SendPrimitiveFiber,
    SendPrimitiveChannel,
    SendPrimitiveRecord,
    SendPrimitiveList,
    SendPrimitiveShape,
    SendPrimitiveMakeShape,
    SendPrimitiveSplatList,
    SendPrimitiveSplatDict,
    SendPrimitiveSplatShape,
    SendPrimitiveCons,
    SendPrimitiveConsList,
    SendPrimitiveUse,
    SendPrimitiveCallBlock,
    TailsendPrimitiveCallBlock,
    SendPrimitiveCallNative,
}

impl Op {
    /// Whether this opcode begins a three-byte send site.
    pub const fn is_send(self) -> bool {
        (self as u8) >= (Op::Send as u8)
    }
}

// Declaration-order contracts relied on by the dispatch loop's opcode arithmetic.
const _: () = {
    assert!(Op::TailsendBlock as u8 == Op::SendBlock as u8 + 1);
    assert!(Op::LocalsendBlock as u8 == Op::SendBlock as u8 + 2);
    assert!(Op::LocaltailsendBlock as u8 == Op::SendBlock as u8 + 3);
    assert!(Op::MatchtailsendBlock as u8 == Op::MatchsendBlock as u8 + 1);
    assert!(Op::TailcallMessageBlock as u8 == Op::CallMessageBlock as u8 + 1);
    assert!(Op::TailsendPrimitiveCallBlock as u8 == Op::SendPrimitiveCallBlock as u8 + 1);
    assert!(Op::TrimExactly9 as u8 == Op::TrimExactly0 as u8 + 9);
    assert!(Op::TrimDown9 as u8 == Op::TrimDown1 as u8 + 8);
    assert!(Op::TrimUp9 as u8 == Op::TrimUp1 as u8 + 8);
    assert!(Op::COUNT <= u8::MAX as usize);
};

// TESTS
// ================================================================================================
