use std::sync::{
    Condvar, Mutex,
    atomic::{AtomicU8, Ordering},
};

use murmur_core::{ModuleId, Value};

// CONSTANTS
// ================================================================================================

/// The fixed size of a fiber stack, in values. Stacks never resize; exceeding this raises an
/// overflow panic.
pub const STACK_MAX: usize = 8192;

/// Cells below the frame base holding the frame header: `[block][return-ip][return-fb]`.
pub const FRAME_HEADER: usize = 3;

// LIFECYCLE
// ================================================================================================

/// The scheduler-visible state of a fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Lifecycle {
    New = 0,
    Running = 1,
    Suspended = 2,
    Done = 3,
}

impl Lifecycle {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Lifecycle::New,
            1 => Lifecycle::Running,
            2 => Lifecycle::Suspended,
            _ => Lifecycle::Done,
        }
    }
}

// RESULT PAIR
// ================================================================================================

/// The tagged pair a run slice produces.
///
/// `Valid` carries the result tuple (which itself leads with `ok` or `err`); `Timeout` carries
/// the reentrant tag of a suspension; `Invalid` carries the trace of a terminated fiber.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Valid(Vec<Value>),
    Timeout(Value),
    Invalid(Value),
}

/// The final state published when a fiber transitions to [Lifecycle::Done].
#[derive(Debug, Clone)]
pub struct FiberDone {
    /// `Valid` or `Invalid`; never `Timeout`.
    pub result: Outcome,
    /// The environment record of the bottom frame at completion.
    pub env: Value,
}

// VM STATE
// ================================================================================================

/// The published register state of a fiber.
///
/// While a fiber runs, `sp/fb/ip/module` live in the dispatch loop's locals; suspension and
/// signal checks write them back here so external agents observe a consistent view.
#[derive(Debug)]
pub struct VmState {
    pub stack: Box<[Value]>,
    pub sp: usize,
    pub fb: usize,
    pub ip: usize,
    pub module: ModuleId,
    /// Suspension tag consumed once on re-entry; `None` when the fiber is not mid-primitive.
    pub reentrant: Option<Value>,
}

impl VmState {
    pub fn new(module: ModuleId, ip: usize) -> Self {
        Self {
            stack: vec![Value::NIL; STACK_MAX].into_boxed_slice(),
            sp: 0,
            fb: 0,
            ip,
            module,
            reentrant: None,
        }
    }
}

// FIBER
// ================================================================================================

/// A cooperatively scheduled coroutine with its own fixed-size stack.
///
/// A fiber in `Running` state is owned by exactly one worker; the vm mutex is held by that
/// worker for the duration of the run slice. All other fields are safe to observe concurrently.
#[derive(Debug)]
pub struct FiberObj {
    state: AtomicU8,
    vm: Mutex<VmState>,
    done: Mutex<Option<FiberDone>>,
    done_cv: Condvar,
    /// The block this fiber was created to run.
    main: Value,
}

impl FiberObj {
    pub fn new(main: Value, vm: VmState) -> Self {
        Self {
            state: AtomicU8::new(Lifecycle::New as u8),
            vm: Mutex::new(vm),
            done: Mutex::new(None),
            done_cv: Condvar::new(),
            main,
        }
    }

    pub fn main(&self) -> Value {
        self.main
    }

    pub fn state(&self) -> Lifecycle {
        Lifecycle::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: Lifecycle) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn is_done(&self) -> bool {
        self.state() == Lifecycle::Done
    }

    /// Locks the fiber's vm state for a run slice.
    pub fn vm(&self) -> std::sync::MutexGuard<'_, VmState> {
        self.vm.lock().expect("fiber vm poisoned")
    }

    /// Publishes the final result and environment and transitions to `Done`.
    pub fn finish(&self, result: Outcome, env: Value) {
        debug_assert!(!matches!(result, Outcome::Timeout(_)));
        {
            let mut done = self.done.lock().expect("fiber result poisoned");
            *done = Some(FiberDone { result, env });
        }
        self.set_state(Lifecycle::Done);
        self.done_cv.notify_all();
    }

    /// The final state, if the fiber has completed.
    pub fn result(&self) -> Option<FiberDone> {
        self.done.lock().expect("fiber result poisoned").clone()
    }

    /// Blocks the calling thread until the fiber completes.
    pub fn wait_done(&self) -> FiberDone {
        let mut done = self.done.lock().expect("fiber result poisoned");
        loop {
            if let Some(result) = done.clone() {
                return result;
            }
            done = self.done_cv.wait(done).expect("fiber result poisoned");
        }
    }
}
