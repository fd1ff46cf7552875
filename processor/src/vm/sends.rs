//! The send opcodes: the slow-path resolver, the inline-cache protocol, and the specialized
//! dispatch variants a send site rewrites itself into.
//!
//! A send site is three bytes: the opcode and a 16-bit constant index whose high bit carries
//! the compiler's tail-call-allowed flag. The constant pool at that index reserves a cache
//! block (see [murmur_core::opcode::cache]): the message, a specs-generation snapshot, the
//! generic call-message slot, and up to four `(type, spec, offset)` entries.
//!
//! A specialized site is valid only while (a) its generation snapshot equals the current specs
//! generation and (b) the receiver still matches the cached type. Either failure falls back to
//! the slow path, which re-resolves against the message table and rewrites the site in place.
//! Rewrites touch only this worker's copy of the bytecode.

use murmur_core::{Kind, Op, SEND_SITE_LEN, Status, Value, opcode::cache};
use tracing::trace;

use super::Exec;
use crate::{
    fiber::Outcome,
    messages::Spec,
    native::{NativeCall, NativeOutcome},
};

impl Exec<'_> {
    // CACHE PLUMBING
    // --------------------------------------------------------------------------------------------

    /// Cached-generation guard: the slot is valid only if the specs generation it snapshotted
    /// is still current.
    pub(super) fn cache_generation_ok(&self, kbase: usize) -> bool {
        let cell = self.konst(kbase + cache::GENERATION);
        cell.kind() == Kind::Raw && cell.raw_bits() == self.engine.messages().generation()
    }

    /// Cached-type guard for monomorphic sites (entry 0).
    pub(super) fn cache_type_ok(&self, kbase: usize, receiver: Value) -> bool {
        let cached = self.konst(kbase + cache::entry(0, cache::ENTRY_TYPE));
        self.engine.value_isa(receiver, cached)
    }

    /// Both guards at once; the common prologue of most specialized sends.
    pub(super) fn cache_ok(&self, kbase: usize, receiver: Value) -> bool {
        self.cache_generation_ok(kbase) && self.cache_type_ok(kbase, receiver)
    }

    /// Falls back to the slow path after a specialized send missed. The site keeps its current
    /// opcode; the slow path re-resolves and rewrites it.
    pub(super) fn miss_send(&mut self, reason: &'static str) -> Option<Outcome> {
        trace!(wkid = self.wkid, reason, "cached send missed");
        self.ip -= SEND_SITE_LEN - 1;
        self.op_send()
    }

    /// The receiver of the current send, padding the tuple with *nil* when it is empty.
    fn send_receiver(&mut self) -> (u64, Value) {
        let mut have = self.var();
        if have == 0 {
            self.push(Value::NIL);
            self.set_var(1);
            have = 1;
        }
        (have, self.peek_n(have))
    }

    fn missing_impl_note(&self, message: Value, receiver: Value) -> String {
        format!(
            "message {} does not specialize for {} of type {}",
            self.engine.inspect(message),
            self.engine.inspect(receiver),
            self.engine.inspect(self.engine.type_of(receiver)),
        )
    }

    pub(super) fn type_mismatch_note(&self, kbase: usize, found: Value, expected: &str) -> String {
        format!(
            "message {} found {} of type {} but expected type {}",
            self.engine.inspect(self.konst(kbase + cache::MESSAGE)),
            self.engine.inspect(found),
            self.engine.inspect(self.engine.type_of(found)),
            expected,
        )
    }

    // SLOW PATH
    // --------------------------------------------------------------------------------------------

    /// The generic send: resolve, fill the cache, rewrite the site, re-dispatch.
    pub(super) fn op_send(&mut self) -> Option<Outcome> {
        let (kbase, tail) = self.read_send_operand();
        let (_, receiver) = self.send_receiver();
        let message = self.konst(kbase + cache::MESSAGE);

        // When every specialization of this message is a block compiled in this module, the
        // site becomes an inline polymorphic match over up to four receiver types.
        if self.try_setup_localmatch(message, kbase) {
            self.patch_site(SEND_SITE_LEN, Op::MatchsendBlock as u8 + tail as u8);
            self.ip -= SEND_SITE_LEN;
            return None;
        }

        // Snapshot the generation before resolving: a racing table write then leaves a stale
        // snapshot behind and the next send re-resolves.
        let generation = self.engine.messages().generation();
        let Some((type_key, spec)) = self.engine.resolve(message, receiver) else {
            let note = self.missing_impl_note(message, receiver);
            return Some(self.panic(Status::SpecializationMissing, note));
        };

        self.set_konst(kbase + cache::GENERATION, Value::raw(generation));
        self.set_konst(kbase + cache::entry(0, cache::ENTRY_TYPE), type_key);
        self.set_konst(kbase + cache::entry(0, cache::ENTRY_SPEC), spec.cache_value());

        let opcode = match &spec {
            Spec::Primitive(op) => {
                let mut byte = *op as u8;
                if *op == Op::SendPrimitiveCallBlock {
                    byte += tail as u8;
                }
                byte
            },
            Spec::Block(block) => {
                let proto = self.proto_obj(*block);
                let proto = proto.as_prototype();
                let local = proto.module() == self.mid;
                if local {
                    self.set_konst(
                        kbase + cache::entry(0, cache::ENTRY_OFFSET),
                        Value::raw(proto.begin() as u64),
                    );
                }
                Op::SendBlock as u8 + tail as u8 + ((local as u8) << 1)
            },
            Spec::Native(_) => Op::SendNative as u8,
            Spec::Property(_) => Op::SendProperty as u8,
            Spec::Constant(_) => Op::SendConstant as u8,
        };

        self.patch_site(SEND_SITE_LEN, opcode);
        self.ip -= SEND_SITE_LEN;
        None
    }

    /// Attempts to turn this site into an inline polymorphic match: the message must have two
    /// to four specializations, all blocks compiled in the current module, hashing to distinct
    /// cache entries.
    fn try_setup_localmatch(&mut self, message: Value, kbase: usize) -> bool {
        let generation = self.engine.messages().generation();
        let specs = self.engine.messages().specs_of(message);
        if !(2..=4).contains(&specs.len()) {
            return false;
        }

        for (type_key, spec) in &specs {
            let Spec::Block(block) = spec else {
                return false;
            };
            let proto = self.proto_obj(*block);
            let proto = proto.as_prototype();
            if proto.module() != self.mid {
                return false;
            }

            let entry = type_hash(*type_key);
            if self.konst(kbase + cache::entry(entry, cache::ENTRY_SPEC)) != Value::INVALID {
                // Hash collision: leave the site monomorphic.
                return false;
            }
            self.set_konst(kbase + cache::entry(entry, cache::ENTRY_TYPE), *type_key);
            self.set_konst(kbase + cache::entry(entry, cache::ENTRY_SPEC), *block);
            self.set_konst(
                kbase + cache::entry(entry, cache::ENTRY_OFFSET),
                Value::raw(proto.begin() as u64),
            );
        }

        self.set_konst(kbase + cache::GENERATION, Value::raw(generation));
        true
    }

    // SPECIALIZED BLOCK SENDS
    // --------------------------------------------------------------------------------------------

    pub(super) fn op_send_block(&mut self, op: Op) -> Option<Outcome> {
        let (kbase, _) = self.read_send_operand();
        let have = self.var();
        let receiver = self.peek_n(have);

        if !self.cache_ok(kbase, receiver) {
            return self.miss_send("generation or receiver type changed");
        }

        let block = self.konst(kbase + cache::entry(0, cache::ENTRY_SPEC));
        let tail = matches!(op, Op::TailsendBlock | Op::LocaltailsendBlock);
        let local = matches!(op, Op::LocalsendBlock | Op::LocaltailsendBlock);

        let (entry, module, nslots) = if local {
            let offset = self.konst(kbase + cache::entry(0, cache::ENTRY_OFFSET));
            let proto = self.proto_obj(block);
            (offset.raw_bits() as usize, self.mid, proto.as_prototype().nslots())
        } else {
            let proto = self.proto_obj(block);
            let proto = proto.as_prototype();
            (proto.begin(), proto.module(), proto.nslots())
        };

        if tail {
            self.tailcall_block(block, have, entry, module, nslots)
        } else {
            self.call_block(block, have, entry, module, nslots)
        }
    }

    pub(super) fn op_matchsend(&mut self, op: Op) -> Option<Outcome> {
        let (kbase, _) = self.read_send_operand();
        let have = self.var();
        let receiver = self.peek_n(have);
        let type_key = self.engine.type_of(receiver);

        if !self.cache_generation_ok(kbase) {
            return self.miss_send("generation changed under match site");
        }

        let entry = type_hash(type_key);
        if self.konst(kbase + cache::entry(entry, cache::ENTRY_TYPE)) != type_key {
            return self.miss_send("receiver type not in match cache");
        }

        let block = self.konst(kbase + cache::entry(entry, cache::ENTRY_SPEC));
        let offset = self.konst(kbase + cache::entry(entry, cache::ENTRY_OFFSET)).raw_bits();
        let nslots = {
            let proto = self.proto_obj(block);
            proto.as_prototype().nslots()
        };

        if op == Op::MatchtailsendBlock {
            self.tailcall_block(block, have, offset as usize, self.mid, nslots)
        } else {
            self.call_block(block, have, offset as usize, self.mid, nslots)
        }
    }

    // NATIVE, PROPERTY & CONSTANT SENDS
    // --------------------------------------------------------------------------------------------

    pub(super) fn op_send_native(&mut self) -> Option<Outcome> {
        let (kbase, _) = self.read_send_operand();
        let have = self.var();
        let below = self.peek_n(have + 1).raw_bits();
        let receiver = self.peek_n(have);

        if !self.cache_ok(kbase, receiver) {
            return self.miss_send("generation or receiver type changed");
        }

        let native = self.konst(kbase + cache::entry(0, cache::ENTRY_SPEC));
        self.call_native(native, have, below, true, false)
    }

    pub(super) fn op_send_property(&mut self) -> Option<Outcome> {
        let (kbase, _) = self.read_send_operand();
        let have = self.var();
        let below = self.peek_n(have + 1).raw_bits();
        let receiver = self.peek_n(have);

        if receiver.kind() != Kind::Record {
            return self.miss_send("property receiver is not a record");
        }
        if !self.cache_type_ok(kbase, receiver) {
            return self.miss_send("receiver shape changed");
        }

        let key = self.konst(kbase + cache::entry(0, cache::ENTRY_SPEC));
        let value = self.record_field(receiver, key);
        self.drop_n(have + 1);
        self.push(value);
        self.set_var(below + 1);
        None
    }

    pub(super) fn record_field(&self, record: Value, key: Value) -> Value {
        let object = self.engine.heap().get(record);
        let record = object.as_record();
        let shape = self.engine.heap().get(record.shape);
        match shape.as_shape().position(key) {
            Some(pos) => record.values[pos],
            None => Value::NIL,
        }
    }

    pub(super) fn op_send_constant(&mut self) -> Option<Outcome> {
        let (kbase, _) = self.read_send_operand();
        let have = self.var();
        let below = self.peek_n(have + 1).raw_bits();
        let receiver = self.peek_n(have);

        if !self.cache_ok(kbase, receiver) {
            return self.miss_send("generation or receiver type changed");
        }

        let value = self.konst(kbase + cache::entry(0, cache::ENTRY_SPEC));
        self.drop_n(have + 1);
        self.push(value);
        self.set_var(below + 1);
        None
    }

    // NATIVE CALLS
    // --------------------------------------------------------------------------------------------

    /// Invokes a foreign handler against the caller's stack.
    ///
    /// `message` distinguishes message sends (the receiver is argument 0) from direct calls
    /// (the callee itself occupies the first tuple slot and is not passed); `via_message`
    /// additionally skips the callee message sitting below the true receiver.
    pub(super) fn call_native(
        &mut self,
        native: Value,
        have: u64,
        below: u64,
        message: bool,
        via_message: bool,
    ) -> Option<Outcome> {
        self.publish();
        if let Some(out) = self.check_signal() {
            return Some(out);
        }

        let pass = if message { have - via_message as u64 } else { have - 1 } as usize;
        let args_start = self.sp - pass;
        let reentrant = self.take_reentrant();

        let (outcome, pushed) = {
            let object = self.engine.heap().get(native);
            let function = object.as_native().function;
            let mut call =
                NativeCall::new(self.engine, &self.state.stack[args_start..self.sp], reentrant);
            let outcome = function(&mut call);
            (outcome, call.into_pushed())
        };

        match outcome {
            NativeOutcome::Timeout(tag) => Some(self.yield_with(tag)),
            NativeOutcome::Invalid(err) => Some(self.finish_given(Outcome::Invalid(err))),
            NativeOutcome::Valid => {
                let to = self.sp - (have as usize + 1);
                let count = pushed.len().max(1);
                if !self.has_stackspace(count.saturating_sub(have as usize + 1)) {
                    return Some(self.panic(Status::Overflow, String::new()));
                }
                if pushed.is_empty() {
                    self.state.stack[to] = Value::NIL;
                } else {
                    self.state.stack[to..to + pushed.len()].copy_from_slice(&pushed);
                }
                self.sp = to + count;
                self.set_var(below + count as u64);
                self.check_signal()
            },
        }
    }

    // GENERIC MESSAGE CALLS
    // --------------------------------------------------------------------------------------------

    /// A message value called as the receiver: resolve against the true receiver at depth
    /// `have - 1` and specialize to a called-via-message opcode.
    pub(super) fn op_send_call_message(&mut self) -> Option<Outcome> {
        let (kbase, tail) = self.read_send_operand();
        let mut have = self.var();
        if have < 2 {
            self.push(Value::NIL);
            self.set_var(have + 1);
            have += 1;
        }

        let message = self.peek_n(have);
        let receiver = self.peek_n(have - 1);

        if message.kind() != Kind::Sigil {
            return self.miss_send("callee is not a message");
        }

        let Some((type_key, spec)) = self.engine.resolve(message, receiver) else {
            let note = self.missing_impl_note(message, receiver);
            return Some(self.panic(Status::SpecializationMissing, note));
        };

        self.set_konst(kbase + cache::entry(0, cache::ENTRY_TYPE), type_key);
        self.set_konst(kbase + cache::entry(0, cache::ENTRY_SPEC), spec.cache_value());
        self.set_konst(kbase + cache::GENERIC, message);

        let opcode = match &spec {
            Spec::Property(_) => Op::CallMessageProperty as u8,
            Spec::Primitive(_) => Op::CallMessagePrimitive as u8,
            Spec::Block(_) => Op::CallMessageBlock as u8 + tail as u8,
            Spec::Native(_) => Op::CallMessageNative as u8,
            Spec::Constant(_) => Op::CallMessageConstant as u8,
        };
        self.patch_site(SEND_SITE_LEN, opcode);
        self.ip -= SEND_SITE_LEN;
        None
    }

    /// The guard prologue shared by the called-via-message variants: the callee must still be
    /// the cached message, the generation current, and the true receiver's type cached.
    fn call_message_guard(&mut self, kbase: usize, have: u64) -> Result<(), &'static str> {
        if have < 2 {
            return Err("tuple too short for a message call");
        }
        let message = self.peek_n(have);
        let receiver = self.peek_n(have - 1);
        if message.kind() != Kind::Sigil {
            return Err("callee is not a message");
        }
        if self.konst(kbase + cache::GENERIC) != message {
            return Err("cached generic message changed");
        }
        if !self.cache_ok(kbase, receiver) {
            return Err("generation or receiver type changed");
        }
        Ok(())
    }

    pub(super) fn op_call_message_block(&mut self, op: Op) -> Option<Outcome> {
        let (kbase, _) = self.read_send_operand();
        let mut have = self.var();
        if let Err(reason) = self.call_message_guard(kbase, have) {
            return self.miss_send(reason);
        }

        // Shift the callee message out so the true receiver becomes argument 0.
        let start = self.sp - (have - 1) as usize;
        self.state.stack.copy_within(start..self.sp, start - 1);
        have -= 1;
        self.sp -= 1;

        let block = self.konst(kbase + cache::entry(0, cache::ENTRY_SPEC));
        let (entry, module, nslots) = {
            let proto = self.proto_obj(block);
            let proto = proto.as_prototype();
            (proto.begin(), proto.module(), proto.nslots())
        };

        if op == Op::TailcallMessageBlock {
            self.tailcall_block(block, have, entry, module, nslots)
        } else {
            self.call_block(block, have, entry, module, nslots)
        }
    }

    pub(super) fn op_call_message_native(&mut self) -> Option<Outcome> {
        let (kbase, _) = self.read_send_operand();
        let have = self.var();
        let below = self.peek_n(have + 1).raw_bits();
        if let Err(reason) = self.call_message_guard(kbase, have) {
            return self.miss_send(reason);
        }

        let native = self.konst(kbase + cache::entry(0, cache::ENTRY_SPEC));
        self.call_native(native, have, below, true, true)
    }

    pub(super) fn op_call_message_constant(&mut self) -> Option<Outcome> {
        let (kbase, _) = self.read_send_operand();
        let have = self.var();
        let below = self.peek_n(have + 1).raw_bits();
        if let Err(reason) = self.call_message_guard(kbase, have) {
            return self.miss_send(reason);
        }

        let value = self.konst(kbase + cache::entry(0, cache::ENTRY_SPEC));
        self.drop_n(have + 1);
        self.push(value);
        self.set_var(below + 1);
        None
    }

    pub(super) fn op_call_message_property(&mut self) -> Option<Outcome> {
        let (kbase, _) = self.read_send_operand();
        let have = self.var();
        let below = self.peek_n(have + 1).raw_bits();
        if let Err(reason) = self.call_message_guard(kbase, have) {
            return self.miss_send(reason);
        }

        let receiver = self.peek_n(have - 1);
        if receiver.kind() != Kind::Record {
            return self.miss_send("property receiver is not a record");
        }

        let key = self.konst(kbase + cache::entry(0, cache::ENTRY_SPEC));
        let value = self.record_field(receiver, key);
        self.drop_n(have + 1);
        self.push(value);
        self.set_var(below + 1);
        None
    }

    /// A primitive reached through a generic message call.
    ///
    /// The cached primitive is evaluated reading the true receiver from depth `have - 1`; the
    /// stack is never shuffled before the final write, so a suspension inside the primitive
    /// re-enters this opcode and re-observes the identical stack.
    pub(super) fn op_call_message_primitive(&mut self) -> Option<Outcome> {
        let (kbase, _) = self.read_send_operand();
        let have = self.var();
        if let Err(reason) = self.call_message_guard(kbase, have) {
            return self.miss_send(reason);
        }

        let spec = self.konst(kbase + cache::entry(0, cache::ENTRY_SPEC));
        debug_assert_eq!(spec.kind(), Kind::Primitive);
        let op = Op::decode(spec.to_op_byte()).expect("cached primitive is a real opcode");

        match op {
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
            | Op::SendPrimitiveLor => self.prim_binary(op, kbase, 1),
            Op::SendPrimitiveBin | Op::SendPrimitiveLin => self.prim_unary(op, kbase, 1),
            Op::SendPrimitiveEq => self.prim_eq(kbase, 1),
            Op::SendPrimitiveConcat => self.prim_concat(kbase, 1),
            Op::SendPrimitiveType => {
                self.prim_type(1);
                None
            },
            Op::SendPrimitiveTake => self.prim_take(kbase, 1),
            Op::SendPrimitivePut => self.prim_put(kbase, 1),
            Op::SendPrimitiveFiber => self.prim_fiber(kbase, 1),
            Op::SendPrimitiveChannel => self.prim_channel(kbase, 1),
            Op::SendPrimitiveRecord => self.prim_record(kbase, 1),
            Op::SendPrimitiveList => self.prim_list(kbase, 1),
            Op::SendPrimitiveShape => self.prim_shape(kbase, 1),
            Op::SendPrimitiveMakeShape => self.prim_make_shape(kbase, 1),
            Op::SendPrimitiveSplatList => self.prim_splat_list(kbase, 1),
            Op::SendPrimitiveSplatDict => self.prim_splat_dict(kbase, 1),
            Op::SendPrimitiveSplatShape => self.prim_splat_shape(kbase, 1),
            Op::SendPrimitiveCons => self.prim_cons(kbase, 1),
            Op::SendPrimitiveConsList => self.prim_cons_list(1),
            Op::SendPrimitiveUse => self.prim_use(kbase, 1),
            _ => self.miss_send("primitive has no message-called form"),
        }
    }

    // PRIMITIVE CALL OPCODES
    // --------------------------------------------------------------------------------------------

    /// `SendPrimitiveCallBlock` / tail variant: the receiver itself is the block to call.
    pub(super) fn op_call_block_primitive(&mut self, op: Op) -> Option<Outcome> {
        let (kbase, _) = self.read_send_operand();
        let have = self.var();
        let receiver = self.peek_n(have);

        if !self.cache_type_ok(kbase, receiver) {
            return self.miss_send("receiver type changed");
        }
        if receiver.kind() != Kind::Block {
            let note = self.type_mismatch_note(kbase, receiver, "block");
            return Some(self.panic(Status::TypeMismatch, note));
        }

        let (entry, module, nslots) = {
            let proto = self.proto_obj(receiver);
            let proto = proto.as_prototype();
            (proto.begin(), proto.module(), proto.nslots())
        };

        if op == Op::TailsendPrimitiveCallBlock {
            self.tailcall_block(receiver, have, entry, module, nslots)
        } else {
            self.call_block(receiver, have, entry, module, nslots)
        }
    }

    /// `SendPrimitiveCallNative`: the receiver itself is the native to call.
    pub(super) fn op_call_native_primitive(&mut self) -> Option<Outcome> {
        let (kbase, _) = self.read_send_operand();
        let have = self.var();
        let below = self.peek_n(have + 1).raw_bits();
        let receiver = self.peek_n(have);

        if !self.cache_type_ok(kbase, receiver) {
            return self.miss_send("receiver type changed");
        }
        if receiver.kind() != Kind::Native {
            let note = self.type_mismatch_note(kbase, receiver, "native");
            return Some(self.panic(Status::TypeMismatch, note));
        }

        self.call_native(receiver, have, below, false, false)
    }
}

// TYPE HASH
// ================================================================================================

/// The 2-bit hash indexing a match cache by receiver type.
///
/// Type keys are interned sigils and shapes, whose low payload bits are dense ids; masking them
/// spreads small working sets across the four entries without any mixing cost.
pub(super) fn type_hash(type_key: Value) -> usize {
    (type_key.bits() as usize) & (murmur_core::SEND_CACHE_SIZE - 1)
}
