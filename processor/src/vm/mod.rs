//! The dispatch loop.
//!
//! One function owns execution: register state (`ip`, `sp`, `fb`, current module) lives in the
//! [Exec] struct and a dense `loop { match opcode }` transfers control between handlers without
//! growing the native stack. This is the switch realization of the tail-chained handler design:
//! each arm reads its immediates, mutates stack and frame state, and falls through to the next
//! dispatch.
//!
//! Invariants the handlers maintain:
//! - `fb <= sp < STACK_MAX`, and the var cell at `stack[sp]` holds the count of values pushed
//!   since the last tuple boundary;
//! - the three cells below `fb` hold the active block, the saved return ip, and the saved
//!   return frame pointer (null-encoded as raw 0 at the bottom frame);
//! - before any opcode that may suspend, the worker's signal word has been checked;
//! - a suspension rewinds `ip` to the start of the active send site, publishes registers, and
//!   records the reentrant tag before returning `timeout` to the driver.

use murmur_core::{Kind, ModuleId, Op, SEND_SITE_LEN, Status, TAIL_FLAG, Value};
use tracing::trace;

use crate::{
    engine::Engine,
    errors::panic_trace,
    fiber::{FRAME_HEADER, FiberObj, Lifecycle, Outcome, STACK_MAX, VmState},
    scheduler::{CodeBank, signal},
};

mod primitives;
mod sends;

// ENTRY
// ================================================================================================

/// Runs a fiber until it finishes, terminates, or yields.
///
/// Execution resumes at the opcode `fiber.ip` points at, with the fiber's published register
/// state. The returned pair is `Valid` (results, possibly err-tagged), `Invalid` (terminated
/// with a trace), or `Timeout` (suspended; the reentrant tag names what the fiber waits on).
pub(crate) fn execute(engine: &Engine, wkid: usize, bank: &mut CodeBank, fiber: Value) -> Outcome {
    let object = engine.heap().get(fiber);
    let fiber_obj = object.as_fiber();
    debug_assert_ne!(fiber_obj.state(), Lifecycle::Done);
    fiber_obj.set_state(Lifecycle::Running);

    let mut guard = fiber_obj.vm();
    let state = &mut *guard;
    bank.ensure(engine, state.module);

    let mut exec = Exec {
        engine,
        wkid,
        bank,
        fiber,
        fiber_obj,
        ip: state.ip,
        sp: state.sp,
        fb: state.fb,
        mid: state.module,
        state,
    };
    exec.run()
}

// EXECUTOR
// ================================================================================================

pub(crate) struct Exec<'a> {
    engine: &'a Engine,
    wkid: usize,
    bank: &'a mut CodeBank,
    /// The value addressing the running fiber; channels use it as the putter identity.
    fiber: Value,
    fiber_obj: &'a FiberObj,
    state: &'a mut VmState,
    ip: usize,
    sp: usize,
    fb: usize,
    mid: ModuleId,
}

impl Exec<'_> {
    fn run(&mut self) -> Outcome {
        macro_rules! ctl {
            ($e:expr) => {
                if let Some(out) = $e {
                    return out;
                }
            };
        }

        loop {
            debug_assert!(self.fb <= self.sp);
            debug_assert!(self.sp < STACK_MAX);

            let byte = self.read_byte();
            let op = Op::decode(byte).expect("invalid opcode byte");
            match op {
                Op::Nop => {},

                // constants and locals
                // --------------------------------------------------------------------------------
                Op::Constant => {
                    let k = self.read_short() as usize;
                    let have = self.var();
                    let value = self.konst(k);
                    self.push(value);
                    self.set_var(have + 1);
                },
                Op::NConstant => {
                    let n = self.read_byte();
                    ctl!(self.guard_stackspace(n as usize));
                    let have = self.var();
                    for _ in 0..n {
                        let k = self.read_short() as usize;
                        let value = self.konst(k);
                        self.push(value);
                    }
                    self.set_var(have + n as u64);
                },
                Op::LoadLocal => {
                    let slot = self.read_byte();
                    let have = self.var();
                    let value = self.local(slot);
                    self.push(value);
                    self.set_var(have + 1);
                },
                Op::NLoadLocal => {
                    let n = self.read_byte();
                    ctl!(self.guard_stackspace(n as usize));
                    let have = self.var();
                    for _ in 0..n {
                        let slot = self.read_byte();
                        let value = self.local(slot);
                        self.push(value);
                    }
                    self.set_var(have + n as u64);
                },
                Op::StoreLocal => {
                    let slot = self.read_byte();
                    let value = self.peek();
                    self.set_local(slot, value);
                },
                Op::PopStoreLocal => {
                    let have = self.var();
                    let slot = self.read_byte();
                    let value = self.pop();
                    self.set_local(slot, value);
                    debug_assert!(have >= 1);
                    self.set_var(have - 1);
                },
                Op::NPopStoreLocal => {
                    let have = self.var();
                    let n = self.read_byte();
                    debug_assert!(have >= n as u64);
                    for _ in 0..n {
                        let slot = self.read_byte();
                        let value = self.pop();
                        self.set_local(slot, value);
                    }
                    self.set_var(have - n as u64);
                },
                Op::NPopStoreStoreLocal => {
                    let have = self.var();
                    let n = self.read_byte();
                    debug_assert!(have >= n as u64);
                    for _ in 0..n.saturating_sub(1) {
                        let slot = self.read_byte();
                        let value = self.pop();
                        self.set_local(slot, value);
                    }
                    let slot = self.read_byte();
                    let value = self.peek();
                    self.set_local(slot, value);
                    self.set_var(have - n as u64 + 1);
                },
                Op::LoadUpvalue => {
                    let slot = self.read_byte();
                    let have = self.var();
                    let value = self.upvalue(slot);
                    self.push(value);
                    self.set_var(have + 1);
                },
                Op::NLoadUpvalue => {
                    let n = self.read_byte();
                    ctl!(self.guard_stackspace(n as usize));
                    let have = self.var();
                    for _ in 0..n {
                        let slot = self.read_byte();
                        let value = self.upvalue(slot);
                        self.push(value);
                    }
                    self.set_var(have + n as u64);
                },
                Op::Pop => {
                    let have = self.var();
                    debug_assert!(have >= 1);
                    self.sp -= 1;
                    self.set_var(have - 1);
                },
                Op::PopN => {
                    let have = self.var();
                    let n = self.read_byte();
                    debug_assert!(have >= n as u64);
                    self.sp -= n as usize;
                    self.set_var(have - n as u64);
                },
                Op::Block => {
                    let k = self.read_short() as usize;
                    let have = self.var();
                    let prototype = self.konst(k);
                    let block = self.make_block(prototype);
                    self.push(block);
                    self.set_var(have + 1);
                },

                // tuple discipline
                // --------------------------------------------------------------------------------
                Op::Tuple => self.open_tuple(),
                Op::NTuple => {
                    let n = self.read_byte();
                    for _ in 0..n {
                        self.open_tuple();
                    }
                },
                Op::Cons => {
                    let have = self.var();
                    let below = self.peek_n(have + 1).raw_bits();
                    let start = self.sp - have as usize;
                    self.state.stack.copy_within(start..self.sp, start - 1);
                    self.sp -= 1;
                    self.set_var(have + below);
                },
                Op::TupleConstant => {
                    let have = self.var();
                    self.push(Value::raw(have));
                    let k = self.read_short() as usize;
                    let value = self.konst(k);
                    self.push(value);
                    self.set_var(1);
                },
                Op::TupleNConstant => {
                    let have = self.var();
                    self.push(Value::raw(have));
                    let n = self.read_byte();
                    ctl!(self.guard_stackspace(n as usize));
                    for _ in 0..n {
                        let k = self.read_short() as usize;
                        let value = self.konst(k);
                        self.push(value);
                    }
                    self.set_var(n as u64);
                },
                Op::TupleLoadLocal => {
                    let have = self.var();
                    self.push(Value::raw(have));
                    let slot = self.read_byte();
                    let value = self.local(slot);
                    self.push(value);
                    self.set_var(1);
                },
                Op::TupleNLoadLocal => {
                    let have = self.var();
                    self.push(Value::raw(have));
                    let n = self.read_byte();
                    ctl!(self.guard_stackspace(n as usize));
                    for _ in 0..n {
                        let slot = self.read_byte();
                        let value = self.local(slot);
                        self.push(value);
                    }
                    self.set_var(n as u64);
                },
                Op::NTupleConstant => {
                    let n = self.read_byte();
                    for _ in 0..n {
                        self.open_tuple();
                    }
                    let k = self.read_short() as usize;
                    let value = self.konst(k);
                    self.push(value);
                    self.set_var(1);
                },
                Op::NTupleNConstant => {
                    let n = self.read_byte();
                    for _ in 0..n {
                        self.open_tuple();
                    }
                    let m = self.read_byte();
                    ctl!(self.guard_stackspace(m as usize));
                    for _ in 0..m {
                        let k = self.read_short() as usize;
                        let value = self.konst(k);
                        self.push(value);
                    }
                    self.set_var(m as u64);
                },
                Op::NTupleLoadLocal => {
                    let n = self.read_byte();
                    for _ in 0..n {
                        self.open_tuple();
                    }
                    let slot = self.read_byte();
                    let value = self.local(slot);
                    self.push(value);
                    self.set_var(1);
                },
                Op::NTupleNLoadLocal => {
                    let n = self.read_byte();
                    for _ in 0..n {
                        self.open_tuple();
                    }
                    let m = self.read_byte();
                    ctl!(self.guard_stackspace(m as usize));
                    for _ in 0..m {
                        let slot = self.read_byte();
                        let value = self.local(slot);
                        self.push(value);
                    }
                    self.set_var(m as u64);
                },
                Op::PackRecord => ctl!(self.op_pack(true)),
                Op::PackList => ctl!(self.op_pack(false)),

                // arity reconciliation
                // --------------------------------------------------------------------------------
                Op::Trim => self.op_trim(),
                Op::TrimExactly0
                | Op::TrimExactly1
                | Op::TrimExactly2
                | Op::TrimExactly3
                | Op::TrimExactly4
                | Op::TrimExactly5
                | Op::TrimExactly6
                | Op::TrimExactly7
                | Op::TrimExactly8
                | Op::TrimExactly9 => {
                    let n = (op as u8 - Op::TrimExactly0 as u8) as u64;
                    self.ip += 1;
                    if self.var() != n {
                        self.miss_trim();
                    }
                },
                Op::TrimDown1
                | Op::TrimDown2
                | Op::TrimDown3
                | Op::TrimDown4
                | Op::TrimDown5
                | Op::TrimDown6
                | Op::TrimDown7
                | Op::TrimDown8
                | Op::TrimDown9 => {
                    let n = (op as u8 - Op::TrimDown1 as u8 + 1) as u64;
                    let want = self.read_byte() as u64;
                    if self.var().wrapping_sub(n) != want {
                        self.miss_trim();
                    } else {
                        self.sp -= n as usize;
                        self.set_var(want);
                    }
                },
                Op::TrimUp1
                | Op::TrimUp2
                | Op::TrimUp3
                | Op::TrimUp4
                | Op::TrimUp5
                | Op::TrimUp6
                | Op::TrimUp7
                | Op::TrimUp8
                | Op::TrimUp9 => {
                    let n = (op as u8 - Op::TrimUp1 as u8 + 1) as u64;
                    let want = self.read_byte() as u64;
                    if self.var() + n != want {
                        self.miss_trim();
                    } else {
                        for _ in 0..n {
                            self.push(Value::NIL);
                        }
                        self.set_var(want);
                    }
                },

                Op::Return => ctl!(self.op_return()),

                // sends
                // --------------------------------------------------------------------------------
                Op::Send => ctl!(self.op_send()),
                Op::SendBlock | Op::TailsendBlock | Op::LocalsendBlock | Op::LocaltailsendBlock => {
                    ctl!(self.op_send_block(op))
                },
                Op::SendNative => ctl!(self.op_send_native()),
                Op::SendProperty => ctl!(self.op_send_property()),
                Op::SendConstant => ctl!(self.op_send_constant()),
                Op::MatchsendBlock | Op::MatchtailsendBlock => ctl!(self.op_matchsend(op)),

                Op::SendPrimitiveCallMessage => ctl!(self.op_send_call_message()),
                Op::CallMessageBlock | Op::TailcallMessageBlock => {
                    ctl!(self.op_call_message_block(op))
                },
                Op::CallMessageNative => ctl!(self.op_call_message_native()),
                Op::CallMessageConstant => ctl!(self.op_call_message_constant()),
                Op::CallMessageProperty => ctl!(self.op_call_message_property()),
                Op::CallMessagePrimitive => ctl!(self.op_call_message_primitive()),

                // primitive sends
                // --------------------------------------------------------------------------------
                Op::SendPrimitiveAdd
                | Op::SendPrimitiveSub
                | Op::SendPrimitiveMul
                | Op::SendPrimitiveDiv
                | Op::SendPrimitiveMod
                | Op::SendPrimitiveLt
                | Op::SendPrimitiveLte
                | Op::SendPrimitiveGt
                | Op::SendPrimitiveGte
                | Op::SendPrimitiveBnd
                | Op::SendPrimitiveBor
                | Op::SendPrimitiveLsh
                | Op::SendPrimitiveRsh
                | Op::SendPrimitiveLnd
                | Op::SendPrimitiveLor => {
                    let (kbase, _) = self.read_send_operand();
                    ctl!(self.prim_binary(op, kbase, 0))
                },
                Op::SendPrimitiveBin | Op::SendPrimitiveLin => {
                    let (kbase, _) = self.read_send_operand();
                    ctl!(self.prim_unary(op, kbase, 0))
                },
                Op::SendPrimitiveEq => {
                    let (kbase, _) = self.read_send_operand();
                    ctl!(self.prim_eq(kbase, 0))
                },
                Op::SendPrimitiveConcat => {
                    let (kbase, _) = self.read_send_operand();
                    ctl!(self.prim_concat(kbase, 0))
                },
                Op::SendPrimitiveType => {
                    let (_, _) = self.read_send_operand();
                    self.prim_type(0);
                },
                Op::SendPrimitiveTake => {
                    let (kbase, _) = self.read_send_operand();
                    ctl!(self.prim_take(kbase, 0))
                },
                Op::SendPrimitivePut => {
                    let (kbase, _) = self.read_send_operand();
                    ctl!(self.prim_put(kbase, 0))
                },
                Op::SendPrimitiveFiber => {
                    let (kbase, _) = self.read_send_operand();
                    ctl!(self.prim_fiber(kbase, 0))
                },
                Op::SendPrimitiveChannel => {
                    let (kbase, _) = self.read_send_operand();
                    ctl!(self.prim_channel(kbase, 0))
                },
                Op::SendPrimitiveRecord => {
                    let (kbase, _) = self.read_send_operand();
                    ctl!(self.prim_record(kbase, 0))
                },
                Op::SendPrimitiveList => {
                    let (kbase, _) = self.read_send_operand();
                    ctl!(self.prim_list(kbase, 0))
                },
                Op::SendPrimitiveShape => {
                    let (kbase, _) = self.read_send_operand();
                    ctl!(self.prim_shape(kbase, 0))
                },
                Op::SendPrimitiveMakeShape => {
                    let (kbase, _) = self.read_send_operand();
                    ctl!(self.prim_make_shape(kbase, 0))
                },
                Op::SendPrimitiveSplatList => {
                    let (kbase, _) = self.read_send_operand();
                    ctl!(self.prim_splat_list(kbase, 0))
                },
                Op::SendPrimitiveSplatDict => {
                    let (kbase, _) = self.read_send_operand();
                    ctl!(self.prim_splat_dict(kbase, 0))
                },
                Op::SendPrimitiveSplatShape => {
                    let (kbase, _) = self.read_send_operand();
                    ctl!(self.prim_splat_shape(kbase, 0))
                },
                Op::SendPrimitiveCons => {
                    let (kbase, _) = self.read_send_operand();
                    ctl!(self.prim_cons(kbase, 0))
                },
                Op::SendPrimitiveConsList => {
                    let (_, _) = self.read_send_operand();
                    ctl!(self.prim_cons_list(0))
                },
                Op::SendPrimitiveUse => {
                    let (kbase, _) = self.read_send_operand();
                    ctl!(self.prim_use(kbase, 0))
                },
                Op::SendPrimitiveCallBlock | Op::TailsendPrimitiveCallBlock => {
                    ctl!(self.op_call_block_primitive(op))
                },
                Op::SendPrimitiveCallNative => ctl!(self.op_call_native_primitive()),
            }
        }
    }

    // REGISTER & STACK HELPERS
    // --------------------------------------------------------------------------------------------

    #[inline(always)]
    fn read_byte(&mut self) -> u8 {
        let byte = self.bank.byte(self.mid, self.ip);
        self.ip += 1;
        byte
    }

    #[inline(always)]
    fn read_short(&mut self) -> u16 {
        let hi = self.read_byte();
        let lo = self.read_byte();
        u16::from_be_bytes([hi, lo])
    }

    /// Reads a send's 16-bit operand, returning the masked cache base and the tail flag.
    #[inline(always)]
    fn read_send_operand(&mut self) -> (usize, bool) {
        let short = self.read_short();
        ((short & !TAIL_FLAG) as usize, short & TAIL_FLAG != 0)
    }

    #[inline(always)]
    fn konst(&self, ix: usize) -> Value {
        self.bank.konst(self.mid, ix)
    }

    #[inline(always)]
    fn set_konst(&mut self, ix: usize, value: Value) {
        self.bank.patch_konst(self.mid, ix, value);
    }

    /// Rewrites the opcode byte `dist` bytes behind `ip`.
    #[inline(always)]
    fn patch_site(&mut self, dist: usize, op: u8) {
        self.bank.patch_byte(self.mid, self.ip - dist, op);
    }

    /// The var cell: the count of values in the tuple in progress.
    #[inline(always)]
    fn var(&self) -> u64 {
        self.state.stack[self.sp].raw_bits()
    }

    #[inline(always)]
    fn set_var(&mut self, count: u64) {
        debug_assert!(self.sp >= self.fb);
        self.state.stack[self.sp] = Value::raw(count);
    }

    #[inline(always)]
    fn push(&mut self, value: Value) {
        self.state.stack[self.sp] = value;
        self.sp += 1;
    }

    #[inline(always)]
    fn pop(&mut self) -> Value {
        self.sp -= 1;
        self.state.stack[self.sp]
    }

    #[inline(always)]
    fn peek(&self) -> Value {
        self.state.stack[self.sp - 1]
    }

    /// The `n`th value from the top of the tuple region (1 is the topmost value).
    #[inline(always)]
    fn peek_n(&self, n: u64) -> Value {
        self.state.stack[self.sp - n as usize]
    }

    #[inline(always)]
    fn drop_n(&mut self, n: u64) {
        self.sp -= n as usize;
    }

    #[inline(always)]
    fn local(&self, slot: u8) -> Value {
        self.state.stack[self.fb + slot as usize]
    }

    #[inline(always)]
    fn set_local(&mut self, slot: u8, value: Value) {
        self.state.stack[self.fb + slot as usize] = value;
    }

    fn upvalue(&self, slot: u8) -> Value {
        let block = self.current_block();
        self.engine.heap().get(block).as_block().upvalues[slot as usize]
    }

    /// The block of the active frame.
    #[inline(always)]
    fn current_block(&self) -> Value {
        self.state.stack[self.fb - 3]
    }

    fn has_stackspace(&self, needed: usize) -> bool {
        self.sp + FRAME_HEADER + needed < STACK_MAX
    }

    fn guard_stackspace(&mut self, needed: usize) -> Option<Outcome> {
        if self.has_stackspace(needed) {
            None
        } else {
            Some(self.panic(Status::Overflow, String::new()))
        }
    }

    /// Writes the register state back to the fiber record so external agents see a consistent
    /// view.
    fn publish(&mut self) {
        self.state.sp = self.sp;
        self.state.fb = self.fb;
        self.state.ip = self.ip;
        self.state.module = self.mid;
    }

    // SIGNALS & SUSPENSION
    // --------------------------------------------------------------------------------------------

    /// Non-blocking read of the worker's signal word.
    fn check_signal(&mut self) -> Option<Outcome> {
        let worker = self.engine.worker(self.wkid);
        if !worker.signal_waiting() {
            return None;
        }
        match worker.take_signal() {
            signal::COLLECT => {
                self.publish();
                worker.next_epoch();
                self.engine.propagate_collect(self.wkid);
                None
            },
            signal::TERMINATE => Some(self.terminate()),
            _ => None,
        }
    }

    /// Suspends the fiber at the active send site.
    ///
    /// `ip` rewinds to the start of the three-byte site so that the same opcode re-enters on
    /// resume; the tag identifies what the fiber waits on.
    fn yield_with(&mut self, tag: Value) -> Outcome {
        self.ip -= SEND_SITE_LEN;
        self.publish();
        self.state.reentrant = Some(tag);
        self.fiber_obj.set_state(Lifecycle::Suspended);
        trace!(wkid = self.wkid, tag = ?tag, "fiber suspending");
        Outcome::Timeout(tag)
    }

    fn take_reentrant(&mut self) -> Option<Value> {
        self.state.reentrant.take()
    }

    // COMPLETION
    // --------------------------------------------------------------------------------------------

    /// The environment record of the active frame.
    fn frame_env(&self) -> Value {
        let block = self.current_block();
        if block.kind() != Kind::Block {
            return self.engine.record_of(&[]);
        }
        let proto = self.proto_obj(block);
        let proto = proto.as_prototype();
        let shape = proto.shape();
        let len = self.engine.heap().get(shape).as_shape().len();
        let available = self.sp.saturating_sub(self.fb).min(len);
        let mut values = Vec::with_capacity(len);
        values.extend_from_slice(&self.state.stack[self.fb..self.fb + available]);
        values.resize(len, Value::NIL);
        self.engine.record_from(shape, &values)
    }

    /// Packages the remaining tuple as an ok-prefixed result and finishes the fiber.
    fn finish_ok(&mut self) -> Outcome {
        let have = self.var() as usize;
        let mut results = Vec::with_capacity(have + 1);
        results.push(Value::OK);
        results.extend_from_slice(&self.state.stack[self.sp - have..self.sp]);

        let env = self.frame_env();
        self.publish();
        self.fiber_obj.finish(Outcome::Valid(results.clone()), env);
        Outcome::Valid(results)
    }

    /// Surfaces a panic: builds the trace, logs it, finishes the fiber with an err-tagged pair.
    pub(crate) fn panic(&mut self, status: Status, note: String) -> Outcome {
        self.publish();
        let trace =
            panic_trace(self.engine, &self.state.stack, self.fb, self.ip, status, &note, self.wkid);
        self.engine.log_error(trace);

        let results = vec![Value::ERR, trace];
        let env = self.frame_env();
        self.fiber_obj.finish(Outcome::Valid(results.clone()), env);
        Outcome::Valid(results)
    }

    /// Cooperative termination: invalid result carrying the trace.
    fn terminate(&mut self) -> Outcome {
        self.publish();
        let trace = panic_trace(
            self.engine,
            &self.state.stack,
            self.fb,
            self.ip,
            Status::Term,
            "terminate signal observed",
            self.wkid,
        );
        self.engine.log_error(trace);

        let env = self.frame_env();
        self.fiber_obj.finish(Outcome::Invalid(trace), env);
        Outcome::Invalid(trace)
    }

    /// Ends the fiber with a pair a native or awaited fiber already produced.
    fn finish_given(&mut self, given: Outcome) -> Outcome {
        self.publish();
        let env = self.frame_env();
        self.fiber_obj.finish(given.clone(), env);
        given
    }

    // BLOCKS, CALLS & RETURNS
    // --------------------------------------------------------------------------------------------

    /// Builds a closure over `prototype`, resolving upvalue descriptors against the current
    /// frame.
    fn make_block(&mut self, prototype: Value) -> Value {
        let proto_obj = self.proto_value_obj(prototype);
        let proto = proto_obj.as_prototype();
        let mut upvalues = Vec::with_capacity(proto.upvalues().len());
        for desc in proto.upvalues() {
            if desc.is_local {
                upvalues.push(self.local(desc.index));
            } else {
                upvalues.push(self.upvalue(desc.index));
            }
        }
        self.engine.block_of(prototype, &upvalues)
    }

    fn proto_value_obj(&self, prototype: Value) -> std::sync::Arc<crate::heap::Object> {
        debug_assert_eq!(prototype.kind(), Kind::Prototype);
        self.engine.heap().get(prototype)
    }

    /// The prototype object behind a block value.
    pub(crate) fn proto_obj(&self, block: Value) -> std::sync::Arc<crate::heap::Object> {
        let prototype = self.engine.heap().get(block).as_block().prototype;
        self.engine.heap().get(prototype)
    }

    fn enter_module(&mut self, module: ModuleId) {
        if module != self.mid {
            self.bank.ensure(self.engine, module);
            self.mid = module;
        }
    }

    /// Pushes a three-cell frame header above the argument tuple and enters the callee.
    pub(crate) fn call_block(
        &mut self,
        block: Value,
        have: u64,
        entry: usize,
        module: ModuleId,
        nslots: usize,
    ) -> Option<Outcome> {
        if !self.has_stackspace(nslots.saturating_sub(have as usize)) {
            return Some(self.panic(Status::Overflow, String::new()));
        }

        let have = have as usize;
        let base = self.sp - have;
        self.state.stack.copy_within(base..self.sp, base + FRAME_HEADER);
        self.state.stack[base] = block;
        self.state.stack[base + 1] = Value::raw(self.ip as u64);
        self.state.stack[base + 2] = Value::raw(self.fb as u64 + 1);
        self.sp += FRAME_HEADER;
        self.fb = base + FRAME_HEADER;

        self.ip = entry;
        self.enter_module(module);
        self.set_var(have as u64);

        self.check_signal()
    }

    /// Reuses the current frame: the argument tuple moves down to the frame base and the frame
    /// header is rewritten only where the block changes.
    pub(crate) fn tailcall_block(
        &mut self,
        block: Value,
        have: u64,
        entry: usize,
        module: ModuleId,
        nslots: usize,
    ) -> Option<Outcome> {
        if !self.has_stackspace(nslots.saturating_sub(have as usize)) {
            return Some(self.panic(Status::Overflow, String::new()));
        }

        let have = have as usize;
        self.state.stack.copy_within(self.sp - have..self.sp, self.fb);
        self.sp = self.fb + have;
        self.state.stack[self.fb - 3] = block;

        self.ip = entry;
        self.enter_module(module);
        self.set_var(have as u64);

        self.check_signal()
    }

    fn op_return(&mut self) -> Option<Outcome> {
        let have = self.var() as usize;

        let saved_fb = self.state.stack[self.fb - 1].raw_bits();
        if saved_fb == 0 {
            // Bottom frame: the call stack is empty.
            self.publish();
            return Some(self.finish_ok());
        }

        let saved_ip = self.state.stack[self.fb - 2].raw_bits() as usize;
        let below = self.state.stack[self.fb - 4].raw_bits();
        let to = self.fb - 4;

        // Copy the returning tuple down over the frame header, then restore the caller's
        // registers. The caller's constants come from its own block's prototype.
        self.state.stack.copy_within(self.sp - have..self.sp, to);
        self.sp = to + have;
        self.fb = (saved_fb - 1) as usize;
        self.ip = saved_ip;

        let caller = self.current_block();
        debug_assert_eq!(caller.kind(), Kind::Block);
        let proto = self.proto_obj(caller);
        self.enter_module(proto.as_prototype().module());

        self.set_var(have as u64 + below);
        None
    }

    // TUPLES, TRIM & PACK
    // --------------------------------------------------------------------------------------------

    /// Closes the current tuple: its count becomes a data cell and a fresh tuple opens.
    fn open_tuple(&mut self) {
        let have = self.var();
        self.push(Value::raw(have));
        self.set_var(0);
    }

    /// Generic arity reconciliation, self-rewriting to a specialized form when the delta is
    /// small and stable.
    fn op_trim(&mut self) {
        let want = self.read_byte();
        let have = self.var();

        if have == want as u64 && want < 10 {
            self.patch_site(2, Op::TrimExactly0 as u8 + want);
            self.ip -= 2;
            return;
        }
        if have > want as u64 && (have - want as u64) < 10 {
            self.patch_site(2, Op::TrimDown1 as u8 + (have - want as u64) as u8 - 1);
            self.ip -= 2;
            return;
        }
        if (want as u64) > have && want as u64 - have < 10 {
            self.patch_site(2, Op::TrimUp1 as u8 + (want as u64 - have) as u8 - 1);
            self.ip -= 2;
            return;
        }

        let want = want as u64;
        if have > want {
            self.sp -= (have - want) as usize;
        } else {
            for _ in 0..(want - have) {
                self.push(Value::NIL);
            }
        }
        self.set_var(want);
    }

    /// A specialized trim observed an unexpected arity: restore the generic opcode and retry.
    fn miss_trim(&mut self) {
        trace!(wkid = self.wkid, "trim specialization missed");
        self.patch_site(2, Op::Trim as u8);
        self.ip -= 2;
    }

    /// Collects the middle of an over-long tuple into a record or list, between `below` fixed
    /// leading values and `above` fixed trailing values.
    fn op_pack(&mut self, as_record: bool) -> Option<Outcome> {
        let mut have = self.var();
        let below = self.read_byte() as u64;
        let above = self.read_byte() as u64;
        let want = below + above;

        while have < want {
            self.push(Value::NIL);
            have += 1;
        }

        let len = (have - want) as usize;
        let gather_end = self.sp - above as usize;
        let gather_start = gather_end - len;

        let packed = {
            let middle = &self.state.stack[gather_start..gather_end];
            if as_record {
                let pairs: Vec<(Value, Value)> =
                    middle.chunks_exact(2).map(|pair| (pair[0], pair[1])).collect();
                self.engine.record_of(&pairs)
            } else {
                self.engine.list_of(middle)
            }
        };

        // Shift the trailing values down over the packed region and drop the packed value in
        // front of them.
        self.state.stack.copy_within(gather_end..self.sp, gather_start + 1);
        self.state.stack[gather_start] = packed;
        self.sp = gather_start + 1 + above as usize;
        self.set_var(want + 1);
        None
    }
}
