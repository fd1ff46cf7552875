//! Hand-assembly helpers for the test suite.
//!
//! The compiler is out of scope, so tests lower programs by hand through [Asm], a thin layer
//! over [ModuleBuilder] that knows the instruction encodings: send sites reserve their cache
//! block, 16-bit operands are big-endian, and the tail flag rides the operand's high bit.

use murmur_core::{ModuleBuilder, ModuleId, Op, Prototype, TAIL_FLAG, Value};

use crate::{engine::Engine, fiber::Outcome, scheduler::CodeBank};

pub(crate) struct Asm {
    b: ModuleBuilder,
}

impl Asm {
    pub fn new(name: &str) -> Self {
        Self { b: ModuleBuilder::new(name) }
    }

    pub fn token(&mut self, token: u32, line: u32) -> &mut Self {
        self.b.token(token, line);
        self
    }

    pub fn offset(&self) -> usize {
        self.b.offset()
    }

    pub fn op(&mut self, op: Op) -> &mut Self {
        self.b.byte(op as u8);
        self
    }

    pub fn byte(&mut self, byte: u8) -> &mut Self {
        self.b.byte(byte);
        self
    }

    /// Emits `Constant` over a pooled constant.
    pub fn constant(&mut self, value: Value) -> &mut Self {
        let k = self.b.constant(value);
        self.op(Op::Constant);
        self.b.short(k);
        self
    }

    /// Adds a constant to the pool without emitting an instruction.
    pub fn pool(&mut self, value: Value) -> u16 {
        self.b.constant(value)
    }

    /// Emits a three-byte send site for `message`, reserving its cache block.
    pub fn send(&mut self, message: Value, tail: bool) -> &mut Self {
        let base = self.b.send_cache(message);
        debug_assert_eq!(base & TAIL_FLAG, 0, "constant pool grew past the send-index space");
        self.op(Op::Send);
        self.b.short(base | if tail { TAIL_FLAG } else { 0 });
        self
    }

    pub fn trim(&mut self, want: u8) -> &mut Self {
        self.op(Op::Trim);
        self.byte(want)
    }

    pub fn ret(&mut self) -> &mut Self {
        self.op(Op::Return)
    }

    pub fn finish(mut self, engine: &Engine) -> ModuleId {
        engine.add_module(self.b.build())
    }
}

/// A block over a fresh prototype at `begin` with no upvalues and an empty environment shape.
pub(crate) fn block_at(
    engine: &Engine,
    module: ModuleId,
    begin: usize,
    nargs: u8,
    nslots: u16,
) -> Value {
    let shape = engine.shape_of(&[]);
    let proto = engine.prototype(Prototype::new(module, begin as u32, nargs, nslots, [], shape));
    engine.block_of(proto, &[])
}

/// Runs a block on a private code bank, driving re-entries until the fiber completes.
///
/// Unlike [Engine::run_main] this exposes the bank, so tests can assert on the in-place
/// rewriting a run performed. Panics if the fiber never finishes within the retry bound.
pub(crate) fn run_direct(
    engine: &Engine,
    bank: &mut CodeBank,
    block: Value,
    args: &[Value],
) -> Vec<Value> {
    let fiber = engine.make_fiber(block, args).expect("block is a block");
    for _ in 0..10_000 {
        match crate::vm::execute(engine, 0, bank, fiber) {
            Outcome::Valid(values) => return values,
            Outcome::Invalid(trace) => panic!("fiber terminated: {}", engine.inspect(trace)),
            Outcome::Timeout(_) => continue,
        }
    }
    panic!("fiber did not finish");
}
