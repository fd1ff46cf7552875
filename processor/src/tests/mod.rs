//! End-to-end interpreter tests over hand-assembled bytecode.
//!
//! Programs here follow the lowering the compiler would produce: every body opens with a
//! `Trim` reconciling the argument tuple against the frame's slots, expressions open a fresh
//! tuple with `Tuple`, and results merge back into the enclosing tuple when a send completes.

use murmur_core::{Kind, Op, Status, Value, well_known};
use pretty_assertions::assert_eq;
use rstest::rstest;

use crate::{
    engine::{Engine, EngineOptions, EngineOptionsError},
    fiber::Outcome,
    messages::Spec,
    native::{NativeCall, NativeOutcome},
    scheduler::CodeBank,
    test_utils::{Asm, block_at, run_direct},
};


fn number_key() -> Value {
    Value::sigil(well_known::NUMBER)
}

fn record_get(engine: &Engine, record: Value, key: &str) -> Value {
    let object = engine.heap().get(record);
    let record = object.as_record();
    let shape = engine.heap().get(record.shape);
    let pos = shape.as_shape().position(engine.message(key)).expect("key present");
    record.values[pos]
}

fn list_items(engine: &Engine, list: Value) -> Vec<Value> {
    engine.heap().get(list).as_list().items.to_vec()
}

// PRIMITIVE SENDS
// ================================================================================================

#[test]
fn primitive_add_on_a_two_element_tuple() {
    let engine = Engine::new();
    let plus = engine.message("+");
    engine.define(plus, number_key(), Spec::Primitive(Op::SendPrimitiveAdd)).unwrap();

    let mut a = Asm::new("add");
    a.trim(1);
    a.op(Op::Tuple);
    a.constant(Value::number(2.0));
    a.constant(Value::number(3.0));
    let site = a.offset();
    a.send(plus, false);
    a.ret();
    let module = a.finish(&engine);

    let block = block_at(&engine, module, 0, 1, 1);
    let mut bank = CodeBank::new();
    let results = run_direct(&engine, &mut bank, block, &[]);

    assert_eq!(results.len(), 3);
    assert_eq!(results[0], Value::OK);
    assert_eq!(results[2], Value::number(5.0));
    // The site specialized itself in this worker's copy of the bytecode.
    assert_eq!(bank.code(module)[site], Op::SendPrimitiveAdd as u8);
}

#[test]
fn primitive_concat_on_strings() {
    let engine = Engine::new();
    let cat = engine.message("+");
    engine
        .define(cat, Value::sigil(well_known::STRING), Spec::Primitive(Op::SendPrimitiveConcat))
        .unwrap();

    let mut a = Asm::new("concat");
    a.trim(1);
    a.op(Op::Tuple);
    a.constant(engine.string("ab"));
    a.constant(engine.string("cd"));
    a.send(cat, false);
    a.ret();
    let module = a.finish(&engine);

    let block = block_at(&engine, module, 0, 1, 1);
    let mut bank = CodeBank::new();
    let results = run_direct(&engine, &mut bank, block, &[]);

    assert_eq!(*results.last().unwrap(), engine.string("abcd"));
}

#[rstest]
#[case("-", Op::SendPrimitiveSub, 7.0, 3.0, Value::number(4.0))]
#[case("*", Op::SendPrimitiveMul, 6.0, 7.0, Value::number(42.0))]
#[case("/", Op::SendPrimitiveDiv, 9.0, 2.0, Value::number(4.5))]
#[case("%", Op::SendPrimitiveMod, 9.0, 4.0, Value::number(1.0))]
#[case("<", Op::SendPrimitiveLt, 2.0, 3.0, Value::TRUE)]
#[case(">=", Op::SendPrimitiveGte, 2.0, 3.0, Value::FALSE)]
#[case("&", Op::SendPrimitiveBnd, 6.0, 3.0, Value::number(2.0))]
#[case("|", Op::SendPrimitiveBor, 6.0, 3.0, Value::number(7.0))]
#[case("<<", Op::SendPrimitiveLsh, 1.0, 4.0, Value::number(16.0))]
#[case(">>", Op::SendPrimitiveRsh, 16.0, 2.0, Value::number(4.0))]
fn arithmetic_family_results(
    #[case] name: &str,
    #[case] op: Op,
    #[case] lhs: f64,
    #[case] rhs: f64,
    #[case] expected: Value,
) {
    let engine = Engine::new();
    let message = engine.message(name);
    engine.define(message, number_key(), Spec::Primitive(op)).unwrap();

    let mut a = Asm::new(name);
    a.trim(1);
    a.op(Op::Tuple);
    a.constant(Value::number(lhs));
    a.constant(Value::number(rhs));
    a.send(message, false);
    a.ret();
    let module = a.finish(&engine);

    let block = block_at(&engine, module, 0, 1, 1);
    let mut bank = CodeBank::new();
    let results = run_direct(&engine, &mut bank, block, &[]);
    assert_eq!(*results.last().unwrap(), expected, "operator {name}");
}

#[test]
fn equality_is_bitwise() {
    let engine = Engine::new();
    let eq = engine.message("==");
    engine.define(eq, number_key(), Spec::Primitive(Op::SendPrimitiveEq)).unwrap();

    let mut a = Asm::new("eq");
    a.trim(1);
    a.op(Op::Tuple);
    a.constant(Value::number(2.0));
    a.constant(Value::number(2.0));
    a.send(eq, false);
    a.ret();
    let module = a.finish(&engine);

    let block = block_at(&engine, module, 0, 1, 1);
    let mut bank = CodeBank::new();
    let results = run_direct(&engine, &mut bank, block, &[]);
    assert_eq!(*results.last().unwrap(), Value::TRUE);
}

#[test]
fn missing_second_operand_pads_nil_and_fails_the_guard() {
    let engine = Engine::new();
    let plus = engine.message("+");
    engine.define(plus, number_key(), Spec::Primitive(Op::SendPrimitiveAdd)).unwrap();

    let mut a = Asm::new("pad");
    a.trim(1);
    a.op(Op::Tuple);
    a.constant(Value::number(2.0));
    a.send(plus, false);
    a.ret();
    let module = a.finish(&engine);

    let block = block_at(&engine, module, 0, 1, 1);
    let mut bank = CodeBank::new();
    let results = run_direct(&engine, &mut bank, block, &[]);

    assert_eq!(results[0], Value::ERR);
    let frames = list_items(&engine, results[1]);
    let status = record_get(&engine, frames[0], "status");
    assert_eq!(status, engine.message(Status::TypeMismatch.sigil_name()));
}

// BLOCK SENDS & CACHE INVALIDATION
// ================================================================================================

/// Builds a module with a main body sending `m` to the number 3, plus two callee bodies that
/// multiply their receiver by 2 and 3 respectively. Returns (module, site, main, double,
/// triple).
fn redefinition_fixture(engine: &Engine) -> (murmur_core::ModuleId, usize, Value, Value, Value) {
    let m = engine.message("m");
    let times = engine.message("*");
    engine.define(times, number_key(), Spec::Primitive(Op::SendPrimitiveMul)).unwrap();

    let mut a = Asm::new("redefine");
    a.trim(1);
    a.op(Op::Tuple);
    a.constant(Value::number(3.0));
    let site = a.offset();
    a.send(m, false);
    a.ret();

    let double_at = a.offset();
    a.trim(1);
    a.op(Op::Tuple);
    a.op(Op::LoadLocal).byte(0);
    a.constant(Value::number(2.0));
    a.send(times, false);
    a.op(Op::PopStoreLocal).byte(0);
    a.ret();

    let triple_at = a.offset();
    a.trim(1);
    a.op(Op::Tuple);
    a.op(Op::LoadLocal).byte(0);
    a.constant(Value::number(3.0));
    a.send(times, false);
    a.op(Op::PopStoreLocal).byte(0);
    a.ret();

    let module = a.finish(engine);
    let main = block_at(engine, module, 0, 1, 1);
    let double = block_at(engine, module, double_at, 1, 2);
    let triple = block_at(engine, module, triple_at, 1, 2);
    (module, site, main, double, triple)
}

#[test]
fn redefinition_misses_the_cache_and_reresolves() {
    let engine = Engine::new();
    let (module, site, main, double, triple) = redefinition_fixture(&engine);
    let m = engine.message("m");

    engine.define(m, number_key(), Spec::Block(double)).unwrap();
    let mut bank = CodeBank::new();
    let results = run_direct(&engine, &mut bank, main, &[]);
    assert_eq!(*results.last().unwrap(), Value::number(6.0));
    // Callee and caller share a module, so the site took the local-call fast path.
    assert_eq!(bank.code(module)[site], Op::LocalsendBlock as u8);

    // Redefining m bumps the generation; the next send misses, re-resolves, and observes the
    // new specialization.
    engine.define(m, number_key(), Spec::Block(triple)).unwrap();
    let results = run_direct(&engine, &mut bank, main, &[]);
    assert_eq!(*results.last().unwrap(), Value::number(9.0));
}

#[test]
fn generation_bumps_by_one_per_definition() {
    let engine = Engine::new();
    let before = engine.messages().generation();
    engine
        .define(engine.message("m"), number_key(), Spec::Constant(Value::NIL))
        .unwrap();
    assert_eq!(engine.messages().generation(), before + 1);
}

#[test]
fn constant_send_pushes_the_spec() {
    let engine = Engine::new();
    let answer = engine.message("answer");
    engine.define(answer, number_key(), Spec::Constant(Value::number(42.0))).unwrap();

    let mut a = Asm::new("constant");
    a.trim(1);
    a.op(Op::Tuple);
    a.constant(Value::number(7.0));
    let site = a.offset();
    a.send(answer, false);
    a.ret();
    let module = a.finish(&engine);

    let block = block_at(&engine, module, 0, 1, 1);
    let mut bank = CodeBank::new();
    let results = run_direct(&engine, &mut bank, block, &[]);
    assert_eq!(*results.last().unwrap(), Value::number(42.0));
    assert_eq!(bank.code(module)[site], Op::SendConstant as u8);
}

#[test]
fn property_send_reads_the_field() {
    let engine = Engine::new();
    let record = engine.record_of(&[(engine.message("x"), Value::number(9.0))]);

    let mut a = Asm::new("property");
    a.trim(1);
    a.op(Op::Tuple);
    a.op(Op::LoadLocal).byte(0);
    let site = a.offset();
    a.send(engine.message("x"), false);
    a.ret();
    let module = a.finish(&engine);

    let block = block_at(&engine, module, 0, 1, 1);
    let mut bank = CodeBank::new();
    let results = run_direct(&engine, &mut bank, block, &[record]);
    assert_eq!(*results.last().unwrap(), Value::number(9.0));
    assert_eq!(bank.code(module)[site], Op::SendProperty as u8);
}

#[test]
fn native_send_results_are_the_pushed_values() {
    fn two_values(call: &mut NativeCall<'_>) -> NativeOutcome {
        call.push(Value::number(10.0));
        call.push(Value::number(20.0));
        NativeOutcome::Valid
    }

    let engine = Engine::new();
    let native = engine.native("two", two_values);
    let message = engine.message("two");
    engine.define(message, number_key(), Spec::Native(native)).unwrap();

    let mut a = Asm::new("native");
    a.trim(1);
    a.op(Op::Tuple);
    a.constant(Value::number(1.0));
    let site = a.offset();
    a.send(message, false);
    a.ret();
    let module = a.finish(&engine);

    let block = block_at(&engine, module, 0, 1, 1);
    let mut bank = CodeBank::new();
    let results = run_direct(&engine, &mut bank, block, &[]);

    let n = results.len();
    assert_eq!(results[n - 2], Value::number(10.0));
    assert_eq!(results[n - 1], Value::number(20.0));
    assert_eq!(bank.code(module)[site], Op::SendNative as u8);
}

// MATCH SITES & TAIL CALLS
// ================================================================================================

#[test]
fn polymorphic_blocks_in_one_module_become_a_match_site() {
    let engine = Engine::new();
    let m = engine.message("describe");
    let times = engine.message("*");
    engine.define(times, number_key(), Spec::Primitive(Op::SendPrimitiveMul)).unwrap();

    let mut a = Asm::new("match");
    // main: send describe to 3, then to "ab"; return both results.
    a.trim(2);
    a.op(Op::Tuple);
    a.constant(Value::number(3.0));
    let site_number = a.offset();
    a.send(m, false);
    a.op(Op::PopStoreLocal).byte(1);
    a.op(Op::Tuple);
    a.constant(engine.string("ab"));
    let site_string = a.offset();
    a.send(m, false);
    a.ret();

    let double_at = a.offset();
    a.trim(1);
    a.op(Op::Tuple);
    a.op(Op::LoadLocal).byte(0);
    a.constant(Value::number(2.0));
    a.send(times, false);
    a.op(Op::PopStoreLocal).byte(0);
    a.ret();

    let echo_at = a.offset();
    a.trim(1);
    a.op(Op::Tuple);
    a.op(Op::LoadLocal).byte(0);
    a.ret();
    let module = a.finish(&engine);

    let main = block_at(&engine, module, 0, 1, 2);
    let double = block_at(&engine, module, double_at, 1, 2);
    let echo = block_at(&engine, module, echo_at, 1, 1);

    engine.define(m, number_key(), Spec::Block(double)).unwrap();
    engine.define(m, Value::sigil(well_known::STRING), Spec::Block(echo)).unwrap();

    let mut bank = CodeBank::new();
    let results = run_direct(&engine, &mut bank, main, &[]);

    assert_eq!(*results.last().unwrap(), engine.string("ab"));
    assert_eq!(bank.code(module)[site_number], Op::MatchsendBlock as u8);
    assert_eq!(bank.code(module)[site_string], Op::MatchsendBlock as u8);
}

#[test]
fn tail_sends_reuse_the_bottom_frame() {
    let engine = Engine::new();
    let step = engine.message("step");
    let done = engine.message("done");

    let mut a = Asm::new("tail");
    // Body for numbers: tail-send step to the done sigil.
    a.trim(1);
    a.op(Op::Tuple);
    a.constant(done);
    let site = a.offset();
    a.send(step, true);
    a.ret();

    // Body for the done sigil: return 99.
    let stop_at = a.offset();
    a.trim(1);
    a.op(Op::Tuple);
    a.constant(Value::number(99.0));
    a.ret();
    let module = a.finish(&engine);

    let spin = block_at(&engine, module, 0, 1, 1);
    let stop = block_at(&engine, module, stop_at, 1, 1);
    engine.define(step, number_key(), Spec::Block(spin)).unwrap();
    engine.define(step, done, Spec::Block(stop)).unwrap();

    let mut bank = CodeBank::new();
    let results = run_direct(&engine, &mut bank, spin, &[Value::number(5.0)]);

    // The tail call replaced the bottom frame, so the stop body returned straight out of the
    // fiber: ok plus exactly one value.
    assert_eq!(results, vec![Value::OK, Value::number(99.0)]);
    assert_eq!(bank.code(module)[site], Op::MatchtailsendBlock as u8);
}

// TRIM SPECIALIZATION
// ================================================================================================

#[test]
fn trim_rewrites_itself_and_converges() {
    let engine = Engine::new();
    let call = engine.message("call");
    engine
        .define(
            call,
            Value::sigil(well_known::BLOCK),
            Spec::Primitive(Op::SendPrimitiveCallBlock),
        )
        .unwrap();

    let mut a = Asm::new("trim");
    // main: invoke the callee with two extra arguments.
    a.trim(1);
    a.op(Op::Tuple);
    a.op(Op::LoadLocal).byte(0);
    a.constant(Value::number(1.0));
    a.constant(Value::number(2.0));
    a.send(call, false);
    a.ret();

    // callee of arity 1: trims three incoming values down to two slots.
    let callee_at = a.offset();
    let trim_at = a.offset();
    a.trim(2);
    a.op(Op::Tuple);
    a.op(Op::LoadLocal).byte(1);
    a.ret();
    let module = a.finish(&engine);

    let main = block_at(&engine, module, 0, 1, 1);
    let callee = block_at(&engine, module, callee_at, 1, 2);

    let mut bank = CodeBank::new();
    let results = run_direct(&engine, &mut bank, main, &[callee]);
    assert_eq!(*results.last().unwrap(), Value::number(1.0));
    // First execution with a surplus of one rewrote the generic trim.
    assert_eq!(bank.code(module)[trim_at], Op::TrimDown1 as u8);

    // Identical arity hits the specialized form and stays put.
    let results = run_direct(&engine, &mut bank, main, &[callee]);
    assert_eq!(*results.last().unwrap(), Value::number(1.0));
    assert_eq!(bank.code(module)[trim_at], Op::TrimDown1 as u8);
}

#[test]
fn trim_miss_restores_the_generic_form() {
    let engine = Engine::new();
    let call = engine.message("call");
    engine
        .define(
            call,
            Value::sigil(well_known::BLOCK),
            Spec::Primitive(Op::SendPrimitiveCallBlock),
        )
        .unwrap();

    let mut a = Asm::new("trim-miss");
    // main with one extra argument.
    a.trim(1);
    a.op(Op::Tuple);
    a.op(Op::LoadLocal).byte(0);
    a.constant(Value::number(1.0));
    a.constant(Value::number(2.0));
    a.send(call, false);
    a.ret();

    // main2 with exact arity.
    let main2_at = a.offset();
    a.trim(1);
    a.op(Op::Tuple);
    a.op(Op::LoadLocal).byte(0);
    a.constant(Value::number(9.0));
    a.send(call, false);
    a.ret();

    let callee_at = a.offset();
    let trim_at = a.offset();
    a.trim(2);
    a.op(Op::Tuple);
    a.op(Op::LoadLocal).byte(1);
    a.ret();
    let module = a.finish(&engine);

    let main = block_at(&engine, module, 0, 1, 1);
    let main2 = block_at(&engine, module, main2_at, 1, 1);
    let callee = block_at(&engine, module, callee_at, 1, 2);

    let mut bank = CodeBank::new();
    run_direct(&engine, &mut bank, main, &[callee]);
    assert_eq!(bank.code(module)[trim_at], Op::TrimDown1 as u8);

    // A different arity misses, restores the generic opcode, and respecializes.
    let results = run_direct(&engine, &mut bank, main2, &[callee]);
    assert_eq!(*results.last().unwrap(), Value::number(9.0));
    assert_eq!(bank.code(module)[trim_at], Op::TrimExactly2 as u8);
}

// GENERIC MESSAGE CALLS
// ================================================================================================

#[test]
fn a_message_value_called_with_a_block_spec() {
    let engine = Engine::new();
    let call = engine.message("call");
    let dbl = engine.message("dbl");
    let times = engine.message("*");
    engine
        .define(
            call,
            Value::sigil(well_known::MESSAGE),
            Spec::Primitive(Op::SendPrimitiveCallMessage),
        )
        .unwrap();
    engine.define(times, number_key(), Spec::Primitive(Op::SendPrimitiveMul)).unwrap();

    let mut a = Asm::new("call-message");
    a.trim(1);
    a.op(Op::Tuple);
    a.constant(dbl);
    a.constant(Value::number(3.0));
    let site = a.offset();
    a.send(call, false);
    a.ret();

    let double_at = a.offset();
    a.trim(1);
    a.op(Op::Tuple);
    a.op(Op::LoadLocal).byte(0);
    a.constant(Value::number(2.0));
    a.send(times, false);
    a.op(Op::PopStoreLocal).byte(0);
    a.ret();
    let module = a.finish(&engine);

    let main = block_at(&engine, module, 0, 1, 1);
    let double = block_at(&engine, module, double_at, 1, 2);
    engine.define(dbl, number_key(), Spec::Block(double)).unwrap();

    let mut bank = CodeBank::new();
    let results = run_direct(&engine, &mut bank, main, &[]);
    assert_eq!(*results.last().unwrap(), Value::number(6.0));
    assert_eq!(bank.code(module)[site], Op::CallMessageBlock as u8);
}

#[test]
fn a_message_value_called_with_a_primitive_spec_reads_the_true_receiver() {
    let engine = Engine::new();
    let call = engine.message("call");
    let plus = engine.message("+");
    engine
        .define(
            call,
            Value::sigil(well_known::MESSAGE),
            Spec::Primitive(Op::SendPrimitiveCallMessage),
        )
        .unwrap();
    engine.define(plus, number_key(), Spec::Primitive(Op::SendPrimitiveAdd)).unwrap();

    let mut a = Asm::new("call-message-primitive");
    a.trim(1);
    a.op(Op::Tuple);
    a.constant(plus);
    a.constant(Value::number(2.0));
    a.constant(Value::number(3.0));
    let site = a.offset();
    a.send(call, false);
    a.ret();
    let module = a.finish(&engine);

    let main = block_at(&engine, module, 0, 1, 1);
    let mut bank = CodeBank::new();
    let results = run_direct(&engine, &mut bank, main, &[]);
    assert_eq!(*results.last().unwrap(), Value::number(5.0));
    assert_eq!(bank.code(module)[site], Op::CallMessagePrimitive as u8);
}

// CHANNELS & FIBERS
// ================================================================================================

fn channel_messages(engine: &Engine) {
    let chan = Value::sigil(well_known::CHANNEL);
    engine
        .define(engine.message("put"), chan, Spec::Primitive(Op::SendPrimitivePut))
        .unwrap();
    engine
        .define(engine.message("take"), chan, Spec::Primitive(Op::SendPrimitiveTake))
        .unwrap();
}

#[test]
fn two_fibers_rendezvous_in_put_order() {
    let engine = Engine::new();
    channel_messages(&engine);
    let put = engine.message("put");
    let take = engine.message("take");

    let mut a = Asm::new("putter");
    a.trim(1);
    a.op(Op::Tuple);
    a.op(Op::LoadLocal).byte(0);
    a.constant(Value::number(1.0));
    a.send(put, false);
    a.trim(1);
    a.op(Op::Tuple);
    a.op(Op::LoadLocal).byte(0);
    a.constant(Value::number(2.0));
    a.send(put, false);
    a.trim(1);
    a.ret();
    let putter_module = a.finish(&engine);
    let putter = block_at(&engine, putter_module, 0, 1, 1);

    let mut b = Asm::new("taker");
    b.trim(3);
    b.op(Op::Tuple);
    b.op(Op::LoadLocal).byte(0);
    b.send(take, false);
    b.op(Op::PopStoreLocal).byte(1);
    b.op(Op::Pop);
    b.op(Op::Tuple);
    b.op(Op::LoadLocal).byte(0);
    b.send(take, false);
    b.op(Op::PopStoreLocal).byte(2);
    b.op(Op::Pop);
    b.op(Op::Tuple);
    b.op(Op::LoadLocal).byte(1);
    b.op(Op::LoadLocal).byte(2);
    b.ret();
    let taker_module = b.finish(&engine);
    let taker = block_at(&engine, taker_module, 0, 1, 3);

    let chan = engine.channel();
    engine.try_spawn(putter, &[chan]).unwrap();
    let taker_fiber = engine.try_spawn(taker, &[chan]).unwrap();

    let done = engine.run_until_done(taker_fiber).unwrap();
    match done.result {
        Outcome::Valid(values) => {
            assert_eq!(values, vec![Value::OK, Value::number(1.0), Value::number(2.0)]);
        },
        other => panic!("taker failed: {other:?}"),
    }
}

#[test]
fn closing_a_channel_unblocks_a_take_with_none() {
    let engine = Engine::new();
    channel_messages(&engine);
    engine.install_channel_natives();
    let take = engine.message("take");
    let close = engine.message("close");

    let mut a = Asm::new("blocked-taker");
    a.trim(1);
    a.op(Op::Tuple);
    a.op(Op::LoadLocal).byte(0);
    a.send(take, false);
    a.ret();
    let taker_module = a.finish(&engine);
    let taker = block_at(&engine, taker_module, 0, 1, 1);

    let mut b = Asm::new("closer");
    b.trim(1);
    b.op(Op::Tuple);
    b.op(Op::LoadLocal).byte(0);
    b.send(close, false);
    b.ret();
    let closer_module = b.finish(&engine);
    let closer = block_at(&engine, closer_module, 0, 1, 1);

    let chan = engine.channel();
    let taker_fiber = engine.try_spawn(taker, &[chan]).unwrap();
    engine.try_spawn(closer, &[chan]).unwrap();

    let done = engine.run_until_done(taker_fiber).unwrap();
    match done.result {
        // The drained take surfaces bare none: no ok prefix.
        Outcome::Valid(values) => assert_eq!(values, vec![Value::OK, chan, Value::NONE]),
        other => panic!("taker failed: {other:?}"),
    }
}

#[test]
fn spawn_and_await_a_child_fiber() {
    let engine = Engine::new();
    let go = engine.message("go");
    let await_msg = engine.message("await");
    engine.define(go, number_key(), Spec::Primitive(Op::SendPrimitiveFiber)).unwrap();
    engine
        .define(await_msg, Value::sigil(well_known::FIBER), Spec::Primitive(Op::SendPrimitiveUse))
        .unwrap();

    let mut a = Asm::new("parent");
    a.trim(1);
    a.op(Op::Tuple);
    a.constant(Value::number(1.0));
    a.op(Op::LoadLocal).byte(0);
    a.send(go, false);
    a.op(Op::PopStoreLocal).byte(0);
    a.op(Op::Tuple);
    a.op(Op::LoadLocal).byte(0);
    a.send(await_msg, false);
    a.ret();
    let parent_module = a.finish(&engine);
    let parent = block_at(&engine, parent_module, 0, 1, 1);

    let mut c = Asm::new("child");
    c.trim(1);
    c.op(Op::Tuple);
    c.constant(Value::number(7.0));
    c.ret();
    let child_module = c.finish(&engine);
    let child = block_at(&engine, child_module, 0, 1, 1);

    let parent_fiber = engine.try_spawn(parent, &[child]).unwrap();
    let done = engine.run_until_done(parent_fiber).unwrap();
    match done.result {
        Outcome::Valid(values) => assert_eq!(*values.last().unwrap(), Value::number(7.0)),
        other => panic!("parent failed: {other:?}"),
    }
}

// ERRORS & TRACES
// ================================================================================================

#[test]
fn unresolvable_sends_panic_with_specialization_missing() {
    let engine = Engine::new();
    let nope = engine.message("nope");

    let mut a = Asm::new("missing");
    a.trim(1);
    a.token(4, 12);
    a.op(Op::Tuple);
    a.constant(Value::number(3.0));
    a.send(nope, false);
    a.ret();
    let module = a.finish(&engine);

    let block = block_at(&engine, module, 0, 1, 1);
    let mut bank = CodeBank::new();
    let results = run_direct(&engine, &mut bank, block, &[]);

    assert_eq!(results[0], Value::ERR);
    let frames = list_items(&engine, results[1]);
    assert_eq!(frames.len(), 1);
    let status = record_get(&engine, frames[0], "status");
    assert_eq!(status, engine.message(Status::SpecializationMissing.sigil_name()));
    assert_eq!(record_get(&engine, frames[0], "source"), engine.string("missing"));
    assert_eq!(record_get(&engine, frames[0], "tok"), Value::number(4.0));
    assert_eq!(engine.errors().len(), 1);
}

#[test]
fn runaway_recursion_overflows_the_fixed_stack() {
    let engine = Engine::new();
    let spin = engine.message("spin");

    let mut a = Asm::new("overflow");
    a.trim(1);
    a.op(Op::Tuple);
    a.op(Op::LoadLocal).byte(0);
    a.send(spin, false);
    a.ret();
    let module = a.finish(&engine);

    let block = block_at(&engine, module, 0, 1, 1);
    engine.define(spin, Value::sigil(well_known::BLOCK), Spec::Block(block)).unwrap();

    let mut bank = CodeBank::new();
    let results = run_direct(&engine, &mut bank, block, &[]);

    assert_eq!(results[0], Value::ERR);
    let frames = list_items(&engine, results[1]);
    let status = record_get(&engine, frames[0], "status");
    assert_eq!(status, engine.message(Status::Overflow.sigil_name()));
    // The walk recorded the chain of active frames, not just the faulting one.
    assert!(frames.len() > 1);
}

#[test]
fn terminate_signal_surfaces_an_invalid_result() {
    let engine = Engine::new();
    let spin = engine.message("spin");

    let mut a = Asm::new("term");
    a.trim(1);
    a.op(Op::Tuple);
    a.op(Op::LoadLocal).byte(0);
    a.send(spin, true);
    a.ret();
    let module = a.finish(&engine);

    let block = block_at(&engine, module, 0, 1, 1);
    engine.define(spin, Value::sigil(well_known::BLOCK), Spec::Block(block)).unwrap();

    // The tail-recursive spin never returns; the terminate signal is its only exit.
    engine.signal_terminate();

    let fiber = engine.make_fiber(block, &[]).unwrap();
    let mut bank = CodeBank::new();
    match crate::vm::execute(&engine, 0, &mut bank, fiber) {
        Outcome::Invalid(trace) => {
            let frames = list_items(&engine, trace);
            let status = record_get(&engine, frames[0], "status");
            assert_eq!(status, engine.message(Status::Term.sigil_name()));
        },
        other => panic!("expected invalid, got {other:?}"),
    }
}

// STRUCTURES, SPLATS & PACKING
// ================================================================================================

#[test]
fn record_list_and_shape_construction() {
    let engine = Engine::new();
    let rec = engine.message("rec");
    let lst = engine.message("lst");
    engine.define(rec, number_key(), Spec::Primitive(Op::SendPrimitiveRecord)).unwrap();
    engine.define(lst, number_key(), Spec::Primitive(Op::SendPrimitiveList)).unwrap();

    let mut a = Asm::new("construct");
    a.trim(1);
    a.op(Op::Tuple);
    a.constant(Value::number(0.0));
    a.constant(engine.message("x"));
    a.constant(Value::number(5.0));
    a.send(rec, false);
    a.op(Op::PopStoreLocal).byte(0);
    a.op(Op::Tuple);
    a.constant(Value::number(0.0));
    a.constant(Value::number(1.0));
    a.constant(Value::number(2.0));
    a.send(lst, false);
    a.ret();
    let module = a.finish(&engine);

    let block = block_at(&engine, module, 0, 1, 1);
    let mut bank = CodeBank::new();
    let results = run_direct(&engine, &mut bank, block, &[]);

    let list = *results.last().unwrap();
    assert_eq!(list.kind(), Kind::List);
    assert_eq!(list_items(&engine, list), vec![Value::number(1.0), Value::number(2.0)]);

    let record = results[1];
    assert_eq!(record.kind(), Kind::Record);
    assert_eq!(record_get(&engine, record, "x"), Value::number(5.0));
}

#[test]
fn splat_list_flattens_into_the_tuple() {
    let engine = Engine::new();
    let splat = engine.message("splat");
    engine
        .define(splat, Value::sigil(well_known::LIST), Spec::Primitive(Op::SendPrimitiveSplatList))
        .unwrap();

    let list = engine.list_of(&[Value::number(1.0), Value::number(2.0), Value::number(3.0)]);

    let mut a = Asm::new("splat");
    a.trim(1);
    a.op(Op::Tuple);
    a.op(Op::LoadLocal).byte(0);
    a.send(splat, false);
    a.ret();
    let module = a.finish(&engine);

    let block = block_at(&engine, module, 0, 1, 1);
    let mut bank = CodeBank::new();
    let results = run_direct(&engine, &mut bank, block, &[list]);

    assert_eq!(
        &results[2..],
        &[Value::number(1.0), Value::number(2.0), Value::number(3.0)],
    );
}

#[test]
fn pack_list_gathers_the_middle_of_a_long_tuple() {
    let engine = Engine::new();

    let mut a = Asm::new("pack");
    a.trim(1);
    a.op(Op::Tuple);
    for n in 1..=5 {
        a.constant(Value::number(n as f64));
    }
    a.op(Op::PackList).byte(1).byte(1);
    a.ret();
    let module = a.finish(&engine);

    let block = block_at(&engine, module, 0, 1, 1);
    let mut bank = CodeBank::new();
    let results = run_direct(&engine, &mut bank, block, &[]);

    assert_eq!(results.len(), 4);
    assert_eq!(results[1], Value::number(1.0));
    assert_eq!(results[3], Value::number(5.0));
    assert_eq!(
        list_items(&engine, results[2]),
        vec![Value::number(2.0), Value::number(3.0), Value::number(4.0)],
    );
}

// ENGINE SURFACE
// ================================================================================================

#[test]
fn engine_options_are_validated() {
    let err = Engine::with_options(EngineOptions::default().with_spawn_queue_limit(0));
    assert!(matches!(err, Err(EngineOptionsError::ZeroQueueLimit)));

    let err = Engine::with_options(EngineOptions::default().with_workers(1000));
    assert!(matches!(err, Err(EngineOptionsError::TooManyWorkers(1000))));
}

#[test]
fn background_workers_run_fibers_to_completion() {
    let engine = Engine::with_options(EngineOptions::default().with_workers(1)).unwrap();
    let plus = engine.message("+");
    engine.define(plus, number_key(), Spec::Primitive(Op::SendPrimitiveAdd)).unwrap();

    let mut a = Asm::new("threaded");
    a.trim(1);
    a.op(Op::Tuple);
    a.constant(Value::number(20.0));
    a.constant(Value::number(22.0));
    a.send(plus, false);
    a.ret();
    let module = a.finish(&engine);

    let block = block_at(&engine, module, 0, 1, 1);
    let done = engine.run_main(block, &[]).unwrap();
    match done.result {
        Outcome::Valid(values) => assert_eq!(*values.last().unwrap(), Value::number(42.0)),
        other => panic!("threaded run failed: {other:?}"),
    }
    engine.stop();
}

#[test]
fn fused_tuple_opcodes_agree_with_their_expansions() {
    let engine = Engine::new();

    let mut fused = Asm::new("fused");
    fused.trim(1);
    let k = fused.pool(Value::number(7.0));
    fused.op(Op::TupleConstant);
    fused.byte((k >> 8) as u8).byte(k as u8);
    fused.ret();
    let fused_module = fused.finish(&engine);

    let mut plain = Asm::new("plain");
    plain.trim(1);
    plain.op(Op::Tuple);
    plain.constant(Value::number(7.0));
    plain.ret();
    let plain_module = plain.finish(&engine);

    let mut bank = CodeBank::new();
    let fused_block = block_at(&engine, fused_module, 0, 1, 1);
    let plain_block = block_at(&engine, plain_module, 0, 1, 1);

    assert_eq!(
        run_direct(&engine, &mut bank, fused_block, &[]),
        run_direct(&engine, &mut bank, plain_block, &[]),
    );
}
