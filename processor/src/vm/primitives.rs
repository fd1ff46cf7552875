//! The primitive sends: one opcode per primitive, each performing its type guards, computing a
//! result, and writing it over the call tuple at `sp - have - 1`.
//!
//! Every body takes a `skip` argument: 0 when the primitive was reached as a plain send, 1 when
//! it was reached through a generic message call, in which case the callee message still sits
//! at depth `have` and the true receiver at `have - 1`. Bodies never move the stack before
//! their final write, so the suspending primitives (take, put, fiber, use) can re-enter with
//! the stack exactly as they left it.

use murmur_core::{Kind, Op, Status, Value};

use super::Exec;
use crate::{
    channel::{CHANNEL_TAKE_TRIES, PutOutcome, TakeOutcome},
    engine::SpawnError,
    fiber::{FRAME_HEADER, Outcome, STACK_MAX},
};

impl Exec<'_> {
    // NUMERIC, BOOLEAN & EQUALITY
    // --------------------------------------------------------------------------------------------

    pub(super) fn prim_binary(&mut self, op: Op, kbase: usize, skip: u64) -> Option<Outcome> {
        let mut have = self.var();
        let below = self.peek_n(have + 1).raw_bits();
        let receiver = self.peek_n(have - skip);

        if !self.cache_type_ok(kbase, receiver) {
            return self.miss_send("receiver type changed");
        }

        if have - skip < 2 {
            self.push(Value::NIL);
            have += 1;
        }

        let a = self.peek_n(have - skip);
        let b = self.peek_n(have - skip - 1);

        let boolean = matches!(op, Op::SendPrimitiveLnd | Op::SendPrimitiveLor);
        if boolean {
            for operand in [a, b] {
                if !operand.is_bool() {
                    let note = self.type_mismatch_note(kbase, operand, "boolean");
                    return Some(self.panic(Status::TypeMismatch, note));
                }
            }
        } else {
            for operand in [a, b] {
                if !operand.is_number() {
                    let note = self.type_mismatch_note(kbase, operand, "number");
                    return Some(self.panic(Status::TypeMismatch, note));
                }
            }
        }

        let result = match op {
            Op::SendPrimitiveAdd => Value::number(a.to_f64() + b.to_f64()),
            Op::SendPrimitiveSub => Value::number(a.to_f64() - b.to_f64()),
            Op::SendPrimitiveMul => Value::number(a.to_f64() * b.to_f64()),
            Op::SendPrimitiveDiv => Value::number(a.to_f64() / b.to_f64()),
            Op::SendPrimitiveMod => {
                let divisor = b.to_i64();
                if divisor == 0 {
                    Value::number(f64::NAN)
                } else {
                    Value::number((a.to_i64() % divisor) as f64)
                }
            },
            Op::SendPrimitiveLt => Value::bool(a.to_f64() < b.to_f64()),
            Op::SendPrimitiveLte => Value::bool(a.to_f64() <= b.to_f64()),
            Op::SendPrimitiveGt => Value::bool(a.to_f64() > b.to_f64()),
            Op::SendPrimitiveGte => Value::bool(a.to_f64() >= b.to_f64()),
            Op::SendPrimitiveBnd => Value::number((a.to_i64() & b.to_i64()) as f64),
            Op::SendPrimitiveBor => Value::number((a.to_i64() | b.to_i64()) as f64),
            Op::SendPrimitiveLsh => shift(a, b, false),
            Op::SendPrimitiveRsh => shift(a, b, true),
            Op::SendPrimitiveLnd => Value::bool(a.as_bool() & b.as_bool()),
            Op::SendPrimitiveLor => Value::bool(a.as_bool() | b.as_bool()),
            _ => unreachable!("not a binary primitive"),
        };

        self.drop_n(have + 1);
        self.push(result);
        self.set_var(below + 1);
        None
    }

    pub(super) fn prim_unary(&mut self, op: Op, kbase: usize, skip: u64) -> Option<Outcome> {
        let have = self.var();
        let below = self.peek_n(have + 1).raw_bits();
        let operand = self.peek_n(have - skip);

        if !self.cache_type_ok(kbase, operand) {
            return self.miss_send("receiver type changed");
        }

        let result = match op {
            Op::SendPrimitiveBin => {
                if !operand.is_number() {
                    let note = self.type_mismatch_note(kbase, operand, "number");
                    return Some(self.panic(Status::TypeMismatch, note));
                }
                Value::number(!operand.to_i64() as f64)
            },
            Op::SendPrimitiveLin => {
                if !operand.is_bool() {
                    let note = self.type_mismatch_note(kbase, operand, "boolean");
                    return Some(self.panic(Status::TypeMismatch, note));
                }
                Value::bool(!operand.as_bool())
            },
            _ => unreachable!("not a unary primitive"),
        };

        self.drop_n(have + 1);
        self.push(result);
        self.set_var(below + 1);
        None
    }

    /// Bitwise equality; structural for interned kinds by construction.
    pub(super) fn prim_eq(&mut self, kbase: usize, skip: u64) -> Option<Outcome> {
        let mut have = self.var();
        let below = self.peek_n(have + 1).raw_bits();
        let receiver = self.peek_n(have - skip);

        if !self.cache_ok(kbase, receiver) {
            return self.miss_send("generation or receiver type changed");
        }

        if have - skip < 2 {
            self.push(Value::NIL);
            have += 1;
        }

        let a = self.peek_n(have - skip);
        let b = self.peek_n(have - skip - 1);

        self.drop_n(have + 1);
        self.push(Value::bool(a == b));
        self.set_var(below + 1);
        None
    }

    // STRINGS
    // --------------------------------------------------------------------------------------------

    pub(super) fn prim_concat(&mut self, kbase: usize, skip: u64) -> Option<Outcome> {
        let mut have = self.var();
        let below = self.peek_n(have + 1).raw_bits();
        let receiver = self.peek_n(have - skip);

        if !self.cache_type_ok(kbase, receiver) {
            return self.miss_send("receiver type changed");
        }

        if have - skip < 2 {
            self.push(Value::NIL);
            have += 1;
        }

        let a = self.peek_n(have - skip);
        let b = self.peek_n(have - skip - 1);
        for operand in [a, b] {
            if !operand.is_string() {
                let note = self.type_mismatch_note(kbase, operand, "string");
                return Some(self.panic(Status::TypeMismatch, note));
            }
        }

        let joined = format!("{}{}", self.engine.text_of(a), self.engine.text_of(b));
        let result = self.engine.string(&joined);

        self.drop_n(have + 1);
        self.push(result);
        self.set_var(below + 1);
        None
    }

    // TYPE QUERY
    // --------------------------------------------------------------------------------------------

    pub(super) fn prim_type(&mut self, skip: u64) {
        let have = self.var();
        let below = self.peek_n(have + 1).raw_bits();
        let type_key = self.engine.type_of(self.peek_n(have - skip));

        self.drop_n(have + 1);
        self.push(type_key);
        self.set_var(below + 1);
    }

    // CHANNELS
    // --------------------------------------------------------------------------------------------

    pub(super) fn prim_take(&mut self, kbase: usize, skip: u64) -> Option<Outcome> {
        let have = self.var();
        let below = self.peek_n(have + 1).raw_bits();
        let chan_val = self.peek_n(have - skip);

        if !self.cache_generation_ok(kbase) {
            return self.miss_send("generation changed");
        }
        if chan_val.kind() != Kind::Channel {
            return self.miss_send("receiver is not a channel");
        }

        self.publish();
        if let Some(out) = self.check_signal() {
            return Some(out);
        }
        let _ = self.take_reentrant();

        let space = STACK_MAX.saturating_sub(self.sp + FRAME_HEADER);
        let object = self.engine.heap().get(chan_val);
        let chan = object.as_channel();

        for _ in 0..CHANNEL_TAKE_TRIES {
            match chan.try_take() {
                TakeOutcome::Values(values) => {
                    if values.len() > space {
                        return Some(self.panic(Status::Overflow, String::new()));
                    }
                    self.drop_n(have + 1);
                    self.push(Value::OK);
                    for value in &values {
                        self.push(*value);
                    }
                    self.set_var(below + 1 + values.len() as u64);
                    return None;
                },
                TakeOutcome::Drained => {
                    self.drop_n(have + 1);
                    self.push(Value::NONE);
                    self.set_var(below + 1);
                    return None;
                },
                TakeOutcome::Empty => std::thread::yield_now(),
            }
        }

        Some(self.yield_with(Value::TIMEOUT))
    }

    pub(super) fn prim_put(&mut self, kbase: usize, skip: u64) -> Option<Outcome> {
        let have = self.var();
        let below = self.peek_n(have + 1).raw_bits();
        let chan_val = self.peek_n(have - skip);

        if !self.cache_generation_ok(kbase) {
            return self.miss_send("generation changed");
        }
        if chan_val.kind() != Kind::Channel {
            return self.miss_send("receiver is not a channel");
        }

        self.publish();
        if let Some(out) = self.check_signal() {
            return Some(out);
        }

        let object = self.engine.heap().get(chan_val);
        let chan = object.as_channel();

        if self.take_reentrant() == Some(chan_val) {
            // Re-entering: the handoff completed only if the channel no longer holds our
            // descriptor. Fibers never migrate and never share stacks, so our identity is
            // enough to name the pending put.
            if chan.holds_put_from(self.fiber) {
                return Some(self.yield_with(chan_val));
            }
            self.drop_n(have + 1);
            self.push(chan_val);
            self.set_var(below + 1);
            return None;
        }

        // Everything in the tuple but the channel (and the callee message) goes in.
        let count = (have - skip - 1) as usize;
        let values = &self.state.stack[self.sp - count..self.sp];

        match chan.try_put(self.fiber, values) {
            PutOutcome::Closed => {
                self.drop_n(have + 1);
                self.push(Value::NONE);
                self.set_var(below + 1);
                None
            },
            PutOutcome::Full => Some(self.yield_with(Value::TIMEOUT)),
            PutOutcome::Placed => Some(self.yield_with(chan_val)),
        }
    }

    pub(super) fn prim_channel(&mut self, kbase: usize, skip: u64) -> Option<Outcome> {
        let have = self.var();
        let below = self.peek_n(have + 1).raw_bits();
        let receiver = self.peek_n(have - skip);

        if !self.cache_type_ok(kbase, receiver) {
            return self.miss_send("receiver type changed");
        }

        let chan = self.engine.channel();
        self.drop_n(have + 1);
        self.push(chan);
        self.set_var(below + 1);
        None
    }

    // FIBERS
    // --------------------------------------------------------------------------------------------

    pub(super) fn prim_fiber(&mut self, kbase: usize, skip: u64) -> Option<Outcome> {
        let have = self.var();
        let below = self.peek_n(have + 1).raw_bits();
        let receiver = self.peek_n(have - skip);

        if !self.cache_type_ok(kbase, receiver) {
            return self.miss_send("receiver type changed");
        }

        let block = if have - skip >= 2 { self.peek_n(have - skip - 1) } else { Value::NIL };
        if block.kind() != Kind::Block {
            let note = self.type_mismatch_note(kbase, block, "block");
            return Some(self.panic(Status::TypeMismatch, note));
        }

        self.publish();
        if let Some(out) = self.check_signal() {
            return Some(out);
        }

        match self.engine.try_spawn(block, &[]) {
            Ok(fiber) => {
                let _ = self.take_reentrant();
                self.drop_n(have + 1);
                self.push(fiber);
                self.set_var(below + 1);
                None
            },
            // The scheduler pushed back; retry once the queue drains.
            Err(SpawnError::QueueFull) => Some(self.yield_with(Value::TIMEOUT)),
            Err(SpawnError::NotABlock) => unreachable!("kind guarded above"),
        }
    }

    /// Awaits another fiber's completion and splats its results into the current tuple.
    pub(super) fn prim_use(&mut self, kbase: usize, skip: u64) -> Option<Outcome> {
        let have = self.var();
        let below = self.peek_n(have + 1).raw_bits();
        let awaited = self.peek_n(have - skip);

        if !self.cache_type_ok(kbase, awaited) {
            return self.miss_send("receiver type changed");
        }
        if awaited.kind() != Kind::Fiber {
            return self.miss_send("receiver is not a fiber");
        }

        self.publish();
        if let Some(out) = self.check_signal() {
            return Some(out);
        }
        let _ = self.take_reentrant();

        let object = self.engine.heap().get(awaited);
        let fiber = object.as_fiber();
        if !fiber.is_done() {
            return Some(self.yield_with(awaited));
        }

        let done = fiber.result().expect("done fiber has a result");
        match done.result {
            Outcome::Valid(values) if values.first() == Some(&Value::OK) => {
                let count = values.len() - 1;
                if let Some(out) = self.guard_stackspace(count) {
                    return Some(out);
                }
                self.drop_n(have + 1);
                for value in &values[1..] {
                    self.push(*value);
                }
                self.set_var(below + count as u64);
                None
            },
            other => Some(self.finish_given(other)),
        }
    }

    // STRUCTURE CONSTRUCTION
    // --------------------------------------------------------------------------------------------

    pub(super) fn prim_record(&mut self, kbase: usize, skip: u64) -> Option<Outcome> {
        let mut have = self.var();
        let below = self.peek_n(have + 1).raw_bits();
        let receiver = self.peek_n(have - skip);

        if !self.cache_type_ok(kbase, receiver) {
            return self.miss_send("receiver type changed");
        }

        let mut len = have - skip - 1;
        if len % 2 == 1 {
            self.push(Value::NIL);
            len += 1;
            have += 1;
        }

        let start = self.sp - len as usize;
        let record = {
            let pairs: Vec<(Value, Value)> = self.state.stack[start..self.sp]
                .chunks_exact(2)
                .map(|pair| (pair[0], pair[1]))
                .collect();
            self.engine.record_of(&pairs)
        };

        self.drop_n(have + 1);
        self.push(record);
        self.set_var(below + 1);
        None
    }

    pub(super) fn prim_list(&mut self, kbase: usize, skip: u64) -> Option<Outcome> {
        let have = self.var();
        let below = self.peek_n(have + 1).raw_bits();
        let receiver = self.peek_n(have - skip);

        if !self.cache_type_ok(kbase, receiver) {
            return self.miss_send("receiver type changed");
        }

        let len = (have - skip - 1) as usize;
        let list = self.engine.list_of(&self.state.stack[self.sp - len..self.sp]);

        self.drop_n(have + 1);
        self.push(list);
        self.set_var(below + 1);
        None
    }

    pub(super) fn prim_shape(&mut self, kbase: usize, skip: u64) -> Option<Outcome> {
        let have = self.var();
        let below = self.peek_n(have + 1).raw_bits();
        let receiver = self.peek_n(have - skip);

        if !self.cache_type_ok(kbase, receiver) {
            return self.miss_send("receiver type changed");
        }

        let len = (have - skip - 1) as usize;
        let shape = self.engine.shape_of(&self.state.stack[self.sp - len..self.sp]);

        self.drop_n(have + 1);
        self.push(shape);
        self.set_var(below + 1);
        None
    }

    /// Builds a record over an existing shape from positional values.
    pub(super) fn prim_make_shape(&mut self, kbase: usize, skip: u64) -> Option<Outcome> {
        let have = self.var();
        let below = self.peek_n(have + 1).raw_bits();
        let shape = self.peek_n(have - skip);

        if !self.cache_type_ok(kbase, shape) {
            return self.miss_send("receiver type changed");
        }
        if shape.kind() != Kind::Shape {
            return self.miss_send("receiver is not a shape");
        }

        let len = (have - skip - 1) as usize;
        let expected = self.engine.heap().get(shape).as_shape().len();
        if expected != len {
            let note = format!("expected {expected} arguments, got {len}");
            return Some(self.panic(Status::Panic, note));
        }

        let start = self.sp - len;
        let record = {
            let values = &self.state.stack[start..self.sp];
            self.engine.record_from(shape, values)
        };

        self.drop_n(have + 1);
        self.push(record);
        self.set_var(below + 1);
        None
    }

    // SPLATS
    // --------------------------------------------------------------------------------------------

    pub(super) fn prim_splat_list(&mut self, kbase: usize, skip: u64) -> Option<Outcome> {
        let have = self.var();
        let below = self.peek_n(have + 1).raw_bits();
        let receiver = self.peek_n(have - skip);

        if !self.cache_generation_ok(kbase) {
            return self.miss_send("generation changed");
        }
        if receiver.kind() != Kind::List {
            return self.miss_send("receiver is not a list");
        }

        let object = self.engine.heap().get(receiver);
        let items = &object.as_list().items;
        if let Some(out) = self.guard_stackspace(items.len()) {
            return Some(out);
        }

        self.drop_n(have + 1);
        for item in items.iter() {
            self.push(*item);
        }
        self.set_var(below + items.len() as u64);
        None
    }

    pub(super) fn prim_splat_dict(&mut self, kbase: usize, skip: u64) -> Option<Outcome> {
        let have = self.var();
        let below = self.peek_n(have + 1).raw_bits();
        let receiver = self.peek_n(have - skip);

        if !self.cache_generation_ok(kbase) {
            return self.miss_send("generation changed");
        }
        if receiver.kind() != Kind::Record {
            return self.miss_send("receiver is not a record");
        }

        let object = self.engine.heap().get(receiver);
        let record = object.as_record();
        let shape = self.engine.heap().get(record.shape);
        let keys = &shape.as_shape().keys;
        if let Some(out) = self.guard_stackspace(keys.len() * 2) {
            return Some(out);
        }

        self.drop_n(have + 1);
        for (key, value) in keys.iter().zip(record.values.iter()) {
            self.push(*key);
            self.push(*value);
        }
        self.set_var(below + 2 * keys.len() as u64);
        None
    }

    pub(super) fn prim_splat_shape(&mut self, kbase: usize, skip: u64) -> Option<Outcome> {
        let have = self.var();
        let below = self.peek_n(have + 1).raw_bits();
        let receiver = self.peek_n(have - skip);

        if !self.cache_generation_ok(kbase) {
            return self.miss_send("generation changed");
        }
        if receiver.kind() != Kind::Shape {
            return self.miss_send("receiver is not a shape");
        }

        let object = self.engine.heap().get(receiver);
        let keys = &object.as_shape().keys;
        if let Some(out) = self.guard_stackspace(keys.len().max(1)) {
            return Some(out);
        }

        self.drop_n(have + 1);
        let mut count = keys.len() as u64;
        if keys.is_empty() {
            self.push(Value::NIL);
            count = 1;
        } else {
            for key in keys.iter() {
                self.push(*key);
            }
        }
        self.set_var(below + count);
        None
    }

    // CONS
    // --------------------------------------------------------------------------------------------

    pub(super) fn prim_cons(&mut self, kbase: usize, skip: u64) -> Option<Outcome> {
        let have = self.var();
        let below = self.peek_n(have + 1).raw_bits();
        let receiver = self.peek_n(have - skip);

        if !self.cache_ok(kbase, receiver) {
            return self.miss_send("generation or receiver type changed");
        }

        if have - skip < 2 {
            self.drop_n(have + 1);
            self.push(receiver);
            self.set_var(below + 1);
            return None;
        }

        let a = self.peek_n(have - skip);
        let b = self.peek_n(have - skip - 1);
        let pair = self.engine.list_of(&[a, b]);

        self.drop_n(have + 1);
        self.push(pair);
        self.set_var(below + 1);
        None
    }

    /// Appends a value to a list receiver.
    pub(super) fn prim_cons_list(&mut self, skip: u64) -> Option<Outcome> {
        let have = self.var();
        let below = self.peek_n(have + 1).raw_bits();
        let receiver = self.peek_n(have - skip);

        if receiver.kind() != Kind::List {
            return self.miss_send("receiver is not a list");
        }

        if have - skip < 2 {
            self.drop_n(have + 1);
            self.push(receiver);
            self.set_var(below + 1);
            return None;
        }

        let appended = self.peek_n(have - skip - 1);
        let list = {
            let object = self.engine.heap().get(receiver);
            let items = &object.as_list().items;
            let mut extended = Vec::with_capacity(items.len() + 1);
            extended.extend_from_slice(items);
            extended.push(appended);
            self.engine.list_of(&extended)
        };

        self.drop_n(have + 1);
        self.push(list);
        self.set_var(below + 1);
        None
    }
}

// SHIFTS
// ================================================================================================

/// Shift semantics: counts at or beyond the integer width produce 0; negative counts shift the
/// opposite direction.
fn shift(a: Value, b: Value, right: bool) -> Value {
    let value = a.to_i64() as u64;
    let amount = b.to_i64();

    let shifted = if amount.unsigned_abs() >= u64::BITS as u64 {
        0
    } else if (amount >= 0) == right {
        value >> amount.unsigned_abs() as u32
    } else {
        value << amount.unsigned_abs() as u32
    };

    Value::number(shifted as i64 as f64)
}
