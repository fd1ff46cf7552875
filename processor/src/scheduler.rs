use std::{
    collections::VecDeque,
    sync::{
        Arc, Condvar, Mutex,
        atomic::{AtomicU64, AtomicU8, Ordering},
    },
};

use murmur_core::{ModuleId, Value};
use tracing::trace;

use crate::{engine::Engine, fiber::Outcome};

// SIGNALS
// ================================================================================================

/// Values of a worker's signal word.
pub mod signal {
    pub const NONE: u8 = 0;
    pub const COLLECT: u8 = 1;
    pub const TERMINATE: u8 = 2;
}

// WORKER
// ================================================================================================

/// The shared face of a worker: its run queue, its signal word, and its collection epoch.
///
/// Fibers are pinned to a worker at spawn and never migrate. Exactly one fiber of a worker runs
/// at any instant; the rest sit in the queue at a yield point.
#[derive(Debug, Default)]
pub struct WorkerShared {
    queue: Mutex<VecDeque<Value>>,
    wake: Condvar,
    signal: AtomicU8,
    epoch: AtomicU64,
}

impl WorkerShared {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues a fiber at the back of the run queue.
    pub fn enqueue(&self, fiber: Value) {
        self.queue.lock().expect("worker queue poisoned").push_back(fiber);
        self.wake.notify_one();
    }

    /// Pops the next runnable fiber without blocking.
    pub fn try_dequeue(&self) -> Option<Value> {
        self.queue.lock().expect("worker queue poisoned").pop_front()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().expect("worker queue poisoned").len()
    }

    /// Whether a signal is waiting, without consuming it.
    #[inline(always)]
    pub fn signal_waiting(&self) -> bool {
        self.signal.load(Ordering::Acquire) != signal::NONE
    }

    /// Consumes and returns the pending signal.
    pub fn take_signal(&self) -> u8 {
        self.signal.swap(signal::NONE, Ordering::AcqRel)
    }

    /// Raises a signal on this worker. Terminate wins over collect.
    pub fn raise_signal(&self, sig: u8) {
        self.signal.fetch_max(sig, Ordering::AcqRel);
        self.wake.notify_one();
    }

    /// Advances this worker's collection epoch.
    pub fn next_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    fn wait_for_work(&self, engine: &Engine) -> Option<Value> {
        let mut queue = self.queue.lock().expect("worker queue poisoned");
        loop {
            if engine.is_shutting_down() {
                return None;
            }
            if let Some(fiber) = queue.pop_front() {
                return Some(fiber);
            }
            queue = self.wake.wait(queue).expect("worker queue poisoned");
        }
    }
}

// CODE BANK
// ================================================================================================

/// A worker's private copies of module bytecode and constants.
///
/// Inline caches rewrite the instruction stream and fill constant-pool cells in place; giving
/// each worker its own copy makes every rewrite thread-local, so no synchronization guards the
/// hot path. Copies are materialized from the module master the first time a worker executes
/// into it.
#[derive(Debug, Default)]
pub struct CodeBank {
    slots: Vec<Option<WorkerCode>>,
}

#[derive(Debug, Clone)]
pub struct WorkerCode {
    pub code: Vec<u8>,
    pub constants: Vec<Value>,
}

impl CodeBank {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes sure this bank holds a copy of `module`.
    pub fn ensure(&mut self, engine: &Engine, module: ModuleId) {
        let ix = module.as_usize();
        if ix >= self.slots.len() {
            self.slots.resize(ix + 1, None);
        }
        if self.slots[ix].is_none() {
            let master = engine.module(module);
            self.slots[ix] = Some(WorkerCode {
                code: master.code().to_vec(),
                constants: master.constants().to_vec(),
            });
        }
    }

    #[inline(always)]
    fn slot(&self, module: ModuleId) -> &WorkerCode {
        self.slots[module.as_usize()].as_ref().expect("module not materialized in bank")
    }

    #[inline(always)]
    fn slot_mut(&mut self, module: ModuleId) -> &mut WorkerCode {
        self.slots[module.as_usize()].as_mut().expect("module not materialized in bank")
    }

    #[inline(always)]
    pub fn byte(&self, module: ModuleId, offset: usize) -> u8 {
        self.slot(module).code[offset]
    }

    #[inline(always)]
    pub fn patch_byte(&mut self, module: ModuleId, offset: usize, byte: u8) {
        self.slot_mut(module).code[offset] = byte;
    }

    #[inline(always)]
    pub fn konst(&self, module: ModuleId, ix: usize) -> Value {
        self.slot(module).constants[ix]
    }

    #[inline(always)]
    pub fn patch_konst(&mut self, module: ModuleId, ix: usize, value: Value) {
        self.slot_mut(module).constants[ix] = value;
    }

    /// Test-facing view of a module's worker copy.
    pub fn code(&self, module: ModuleId) -> &[u8] {
        &self.slot(module).code
    }
}

// WORKER LOOP
// ================================================================================================

/// The body of a worker thread: pop a fiber, run a slice, requeue on yield.
///
/// A `timeout` outcome means the fiber suspended cooperatively; it goes to the back of the
/// queue and will retry its suspended opcode when it comes around again. Completed fibers have
/// already published their result.
pub(crate) fn worker_main(engine: Arc<Engine>, wkid: usize) {
    let mut bank = CodeBank::new();
    let shared = engine.worker(wkid);

    while let Some(fiber) = shared.wait_for_work(&engine) {
        match crate::vm::execute(&engine, wkid, &mut bank, fiber) {
            Outcome::Timeout(tag) => {
                trace!(wkid, ?tag, "fiber yielded");
                shared.enqueue(fiber);
            },
            Outcome::Valid(_) | Outcome::Invalid(_) => {},
        }
    }
}
