use murmur_core::{Kind, Value};
use smallvec::SmallVec;

use crate::engine::Engine;

// NATIVE CONTRACT
// ================================================================================================

/// A foreign handler: `(engine, argc, argv, reentrant) -> result-pair`.
///
/// `argv` views the caller's stack and is valid for the duration of the call. Values pushed
/// through [NativeCall::push] land on the caller's VM and become the call's result tuple. The
/// reentrant tag is consumed once per call; the VM resets it before the next checkpoint.
pub type NativeFn = fn(&mut NativeCall<'_>) -> NativeOutcome;

/// Result-pair statuses a native may produce.
#[derive(Debug, Clone, PartialEq)]
pub enum NativeOutcome {
    /// Normal completion; the pushed values are the call's results.
    Valid,
    /// Suspend the calling fiber with this reentrant tag.
    Timeout(Value),
    /// Fatal; terminate the fiber with this value.
    Invalid(Value),
}

/// The engine-provided view a native executes against.
#[derive(Debug)]
pub struct NativeCall<'a> {
    engine: &'a Engine,
    args: &'a [Value],
    reentrant: Option<Value>,
    pushed: SmallVec<[Value; 8]>,
}

impl<'a> NativeCall<'a> {
    pub(crate) fn new(engine: &'a Engine, args: &'a [Value], reentrant: Option<Value>) -> Self {
        Self { engine, args, reentrant, pushed: SmallVec::new() }
    }

    pub fn engine(&self) -> &Engine {
        self.engine
    }

    pub fn argc(&self) -> usize {
        self.args.len()
    }

    pub fn argv(&self) -> &[Value] {
        self.args
    }

    /// Argument `ix`, or *nil* past the end.
    pub fn arg(&self, ix: usize) -> Value {
        self.args.get(ix).copied().unwrap_or(Value::NIL)
    }

    /// The suspension tag this call is re-entering with, if any.
    pub fn reentrant(&self) -> Option<Value> {
        self.reentrant
    }

    /// Pushes a result value onto the caller's VM.
    pub fn push(&mut self, value: Value) {
        self.pushed.push(value);
    }

    pub fn push_all(&mut self, values: impl IntoIterator<Item = Value>) {
        self.pushed.extend(values);
    }

    pub(crate) fn into_pushed(self) -> SmallVec<[Value; 8]> {
        self.pushed
    }
}

// CHANNEL NATIVES
// ================================================================================================

fn channel_arg(call: &NativeCall<'_>) -> Option<Value> {
    let receiver = call.arg(0);
    (receiver.kind() == Kind::Channel).then_some(receiver)
}

/// `channel close`: closes the receiver and returns it.
pub fn native_channel_close(call: &mut NativeCall<'_>) -> NativeOutcome {
    let Some(chan) = channel_arg(call) else {
        return NativeOutcome::Invalid(Value::NIL);
    };
    call.engine().heap().get(chan).as_channel().close();
    call.push(chan);
    NativeOutcome::Valid
}

/// `channel is\closed`.
pub fn native_channel_is_closed(call: &mut NativeCall<'_>) -> NativeOutcome {
    let Some(chan) = channel_arg(call) else {
        return NativeOutcome::Invalid(Value::NIL);
    };
    let closed = call.engine().heap().get(chan).as_channel().is_closed();
    call.push(Value::bool(closed));
    NativeOutcome::Valid
}

/// `channel is\full`.
pub fn native_channel_is_full(call: &mut NativeCall<'_>) -> NativeOutcome {
    let Some(chan) = channel_arg(call) else {
        return NativeOutcome::Invalid(Value::NIL);
    };
    let full = call.engine().heap().get(chan).as_channel().is_full();
    call.push(Value::bool(full));
    NativeOutcome::Valid
}

/// `channel is\empty`.
pub fn native_channel_is_empty(call: &mut NativeCall<'_>) -> NativeOutcome {
    let Some(chan) = channel_arg(call) else {
        return NativeOutcome::Invalid(Value::NIL);
    };
    let empty = call.engine().heap().get(chan).as_channel().is_empty();
    call.push(Value::bool(empty));
    NativeOutcome::Valid
}
