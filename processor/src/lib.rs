//! The Murmur VM processor: the execution core of a dynamically typed, message-oriented
//! language.
//!
//! The interpreter is stack-based with a stack-resident tuple discipline: the cell at the top
//! of the stack carries the count of values in the tuple being built, which is how calls and
//! returns communicate variable arity without allocating. Message dispatch runs through
//! per-send-site inline caches that specialize the instruction stream in place (each worker
//! rewrites only its own copy of the bytecode) and fall back to the global resolver whenever
//! the message table's generation moves. Concurrency is cooperative: fibers pinned to worker
//! threads, suspending on channel rendezvous, fiber awaits, and signal checks.
//!
//! Out of scope here: the compiler (modules arrive already lowered), the collector's marking
//! algorithm, and the module loader.

mod channel;
mod engine;
mod errors;
mod fiber;
mod heap;
mod interner;
mod messages;
mod native;
mod scheduler;
mod vm;

#[cfg(test)]
mod test_utils;

#[cfg(test)]
mod tests;

// RE-EXPORTS
// ================================================================================================

pub use murmur_core::{
    Kind, Module, ModuleBuilder, ModuleId, Op, Prototype, SEND_CACHE_SIZE, SEND_SITE_LEN, Status,
    TAIL_FLAG, UpvalueDesc, Value, opcode, well_known,
};

pub use crate::{
    channel::{CHANNEL_TAKE_TRIES, ChannelObj, PutOutcome, TakeOutcome},
    engine::{DefineError, Engine, EngineError, EngineOptions, EngineOptionsError, SpawnError},
    fiber::{FiberDone, FiberObj, Lifecycle, Outcome, STACK_MAX, VmState},
    heap::{BlockObj, BoxObj, Heap, ListObj, NativeObj, Object, RecordObj, ShapeObj},
    interner::Interner,
    messages::{MessageTable, Spec},
    native::{NativeCall, NativeFn, NativeOutcome},
    scheduler::{CodeBank, WorkerShared, signal},
};
