use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread::JoinHandle,
};

use itertools::Itertools;
use murmur_core::{Kind, Module, ModuleId, Prototype, Value, well_known};
use tracing::{debug, instrument};

use crate::{
    channel::ChannelObj,
    fiber::{FiberDone, FiberObj, Lifecycle, Outcome, STACK_MAX, VmState},
    heap::{BlockObj, BoxObj, Heap, ListObj, NativeObj, Object, RecordObj, ShapeObj},
    interner::Interner,
    messages::{MessageTable, Spec},
    native::NativeFn,
    scheduler::{CodeBank, WorkerShared, signal, worker_main},
};

// OPTIONS
// ================================================================================================

/// Upper bound on background workers; chosen to keep worker ids comfortably inside error
/// records.
const MAX_WORKERS: usize = 64;

/// How many consecutive all-yield slices the inline driver tolerates before declaring the
/// program stalled.
const STALL_LIMIT: usize = 100_000;

#[derive(Debug, thiserror::Error)]
pub enum EngineOptionsError {
    #[error("worker count {0} exceeds the maximum of {MAX_WORKERS}")]
    TooManyWorkers(usize),
    #[error("spawn queue limit must be non-zero")]
    ZeroQueueLimit,
}

/// Configuration of an [Engine].
///
/// With zero background workers the engine runs fibers inline on the calling thread; this is
/// the configuration the test suite uses. With `n > 0` workers, `n` OS threads each run a
/// cooperative scheduler over their own fibers.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    workers: usize,
    spawn_queue_limit: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self { workers: 0, spawn_queue_limit: 1024 }
    }
}

impl EngineOptions {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_spawn_queue_limit(mut self, limit: usize) -> Self {
        self.spawn_queue_limit = limit;
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn spawn_queue_limit(&self) -> usize {
        self.spawn_queue_limit
    }

    fn validate(&self) -> Result<(), EngineOptionsError> {
        if self.workers > MAX_WORKERS {
            return Err(EngineOptionsError::TooManyWorkers(self.workers));
        }
        if self.spawn_queue_limit == 0 {
            return Err(EngineOptionsError::ZeroQueueLimit);
        }
        Ok(())
    }
}

// ERRORS
// ================================================================================================

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Options(#[from] EngineOptionsError),
    #[error("no runnable fiber can make progress")]
    Stalled,
    #[error(transparent)]
    Spawn(#[from] SpawnError),
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("fiber main must be a block")]
    NotABlock,
    #[error("target worker's queue is saturated")]
    QueueFull,
}

#[derive(Debug, thiserror::Error)]
pub enum DefineError {
    #[error("dispatch key must be a message")]
    NotAMessage,
    #[error("spec value does not match its declared kind")]
    SpecKindMismatch,
}

// ENGINE
// ================================================================================================

/// The shared face of a Murmur VM instance: the object heap, the interner, the message table,
/// the compiled-module store, the error log, and the workers.
#[derive(Debug)]
pub struct Engine {
    heap: Heap,
    interner: Interner,
    shapes: Mutex<HashMap<Vec<u64>, Value>>,
    modules: RwLock<Vec<Arc<Module>>>,
    messages: MessageTable,
    errors: Mutex<Vec<Value>>,
    workers: Vec<Arc<WorkerShared>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    inline_bank: Mutex<CodeBank>,
    next_worker: AtomicUsize,
    shutdown: AtomicBool,
    options: EngineOptions,
}

impl Engine {
    // CONSTRUCTORS
    // --------------------------------------------------------------------------------------------

    /// Creates an engine with default options (inline execution, no background workers).
    pub fn new() -> Arc<Self> {
        Self::with_options(EngineOptions::default()).expect("default options are valid")
    }

    /// Creates an engine with the given options, spawning its worker threads.
    pub fn with_options(options: EngineOptions) -> Result<Arc<Self>, EngineOptionsError> {
        options.validate()?;

        let worker_count = options.workers.max(1);
        let engine = Arc::new(Self {
            heap: Heap::new(),
            interner: Interner::new(),
            shapes: Mutex::new(HashMap::new()),
            modules: RwLock::new(Vec::new()),
            messages: MessageTable::new(),
            errors: Mutex::new(Vec::new()),
            workers: (0..worker_count).map(|_| Arc::new(WorkerShared::new())).collect(),
            threads: Mutex::new(Vec::new()),
            inline_bank: Mutex::new(CodeBank::new()),
            next_worker: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            options,
        });

        if engine.options.workers > 0 {
            let mut threads = engine.threads.lock().expect("threads poisoned");
            for wkid in 0..engine.options.workers {
                let engine = engine.clone();
                threads.push(std::thread::spawn(move || worker_main(engine, wkid)));
            }
        }

        Ok(engine)
    }

    /// Stops the worker threads. Suspended fibers are abandoned; finished fibers keep their
    /// results. Idempotent.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        for worker in &self.workers {
            worker.raise_signal(signal::NONE);
        }
        let threads = {
            let mut threads = self.threads.lock().expect("threads poisoned");
            std::mem::take(&mut *threads)
        };
        for handle in threads {
            let _ = handle.join();
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    // ACCESSORS
    // --------------------------------------------------------------------------------------------

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn messages(&self) -> &MessageTable {
        &self.messages
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub(crate) fn worker(&self, wkid: usize) -> &Arc<WorkerShared> {
        &self.workers[wkid]
    }

    // INTERNING
    // --------------------------------------------------------------------------------------------

    /// Interns a message (sigil).
    pub fn message(&self, name: &str) -> Value {
        Value::sigil(self.interner.intern(name))
    }

    /// Interns a string.
    pub fn string(&self, text: &str) -> Value {
        Value::string(self.interner.intern(text))
    }

    /// The spelling behind an interned sigil or string.
    pub fn text_of(&self, value: Value) -> Arc<str> {
        debug_assert!(value.is_sigil() || value.is_string());
        self.interner.name(value.index())
    }

    // VALUE CONSTRUCTORS
    // --------------------------------------------------------------------------------------------

    /// The interned shape over the given keys.
    pub fn shape_of(&self, keys: &[Value]) -> Value {
        let fingerprint: Vec<u64> = keys.iter().map(|k| k.bits()).collect();
        let mut shapes = self.shapes.lock().expect("shape table poisoned");
        if let Some(&shape) = shapes.get(&fingerprint) {
            return shape;
        }
        let shape = Value::shape(self.heap.alloc(Object::Shape(ShapeObj { keys: keys.into() })));
        shapes.insert(fingerprint, shape);
        shape
    }

    /// A record over an existing shape. `values` must be shape-length.
    pub fn record_from(&self, shape: Value, values: &[Value]) -> Value {
        debug_assert_eq!(self.heap.get(shape).as_shape().len(), values.len());
        Value::record(self.heap.alloc(Object::Record(RecordObj { shape, values: values.into() })))
    }

    /// A record from key/value pairs.
    pub fn record_of(&self, pairs: &[(Value, Value)]) -> Value {
        let keys: Vec<Value> = pairs.iter().map(|(k, _)| *k).collect();
        let values: Vec<Value> = pairs.iter().map(|(_, v)| *v).collect();
        let shape = self.shape_of(&keys);
        self.record_from(shape, &values)
    }

    pub fn list_of(&self, items: &[Value]) -> Value {
        Value::list(self.heap.alloc(Object::List(ListObj { items: items.into() })))
    }

    pub fn prototype(&self, prototype: Prototype) -> Value {
        Value::prototype(self.heap.alloc(Object::Prototype(prototype)))
    }

    /// A closure over a prototype with already-resolved upvalues.
    pub fn block_of(&self, prototype: Value, upvalues: &[Value]) -> Value {
        debug_assert_eq!(prototype.kind(), Kind::Prototype);
        Value::block(self.heap.alloc(Object::Block(BlockObj {
            prototype,
            upvalues: upvalues.iter().copied().collect(),
        })))
    }

    pub fn native(&self, name: &str, function: NativeFn) -> Value {
        let name = self.string(name);
        Value::native(self.heap.alloc(Object::Native(NativeObj { name, function })))
    }

    pub fn channel(&self) -> Value {
        Value::channel(self.heap.alloc(Object::Channel(ChannelObj::new())))
    }

    pub fn box_of(&self, type_key: Value, data: &[u8]) -> Value {
        Value::boxed_datum(self.heap.alloc(Object::Box(BoxObj { type_key, data: data.into() })))
    }

    // MODULES
    // --------------------------------------------------------------------------------------------

    pub fn add_module(&self, module: Arc<Module>) -> ModuleId {
        let mut modules = self.modules.write().expect("module store poisoned");
        let id = ModuleId::new(modules.len() as u32);
        modules.push(module);
        id
    }

    pub fn module(&self, id: ModuleId) -> Arc<Module> {
        self.modules.read().expect("module store poisoned")[id.as_usize()].clone()
    }

    // TYPES & DISPATCH
    // --------------------------------------------------------------------------------------------

    /// The kind-wide type sigil of a value, used as the dispatch fallback key.
    pub fn kind_sigil(&self, value: Value) -> Value {
        let id = match value.kind() {
            Kind::Number => well_known::NUMBER,
            Kind::String => well_known::STRING,
            Kind::Sigil => well_known::MESSAGE,
            Kind::Record => well_known::RECORD,
            Kind::Shape => well_known::SHAPE,
            Kind::List => well_known::LIST,
            Kind::Block => well_known::BLOCK,
            Kind::Native => well_known::NATIVE,
            Kind::Prototype => well_known::PROTOTYPE,
            Kind::Fiber => well_known::FIBER,
            Kind::Channel => well_known::CHANNEL,
            Kind::Box => well_known::BOX,
            Kind::Primitive | Kind::Raw | Kind::Undefined | Kind::Invalid | Kind::Timeout => {
                return value;
            },
        };
        Value::sigil(id)
    }

    /// The dispatch type of a value: sigils type themselves, records type as their shape, boxes
    /// as their declared type, everything else as its kind sigil.
    pub fn type_of(&self, value: Value) -> Value {
        match value.kind() {
            Kind::Sigil => value,
            Kind::Record => self.heap.get(value).as_record().shape,
            Kind::Box => self.heap.get(value).as_box().type_key,
            _ => self.kind_sigil(value),
        }
    }

    /// The cached-type acceptance test: a receiver matches a cached type key if the key is its
    /// dispatch type or its kind-wide sigil.
    pub fn value_isa(&self, value: Value, type_key: Value) -> bool {
        self.type_of(value) == type_key || self.kind_sigil(value) == type_key
    }

    /// Resolves a message against a receiver: exact type key first, then record properties,
    /// then the kind-wide sigil.
    pub fn resolve(&self, message: Value, receiver: Value) -> Option<(Value, Spec)> {
        let type_key = self.type_of(receiver);
        if let Some(spec) = self.messages.lookup(message, type_key) {
            return Some((type_key, spec));
        }

        if receiver.kind() == Kind::Record {
            let shape = self.heap.get(receiver).as_record().shape;
            if self.heap.get(shape).as_shape().position(message).is_some() {
                return Some((shape, Spec::Property(message)));
            }
        }

        let kind_key = self.kind_sigil(receiver);
        if kind_key != type_key
            && let Some(spec) = self.messages.lookup(message, kind_key)
        {
            return Some((kind_key, spec));
        }

        None
    }

    /// Registers a specialization, bumping the specs generation.
    pub fn define(&self, message: Value, type_key: Value, spec: Spec) -> Result<(), DefineError> {
        if !message.is_sigil() {
            return Err(DefineError::NotAMessage);
        }
        let well_formed = match &spec {
            Spec::Block(v) => v.kind() == Kind::Block,
            Spec::Native(v) => v.kind() == Kind::Native,
            Spec::Property(v) => v.is_sigil(),
            Spec::Primitive(_) | Spec::Constant(_) => true,
        };
        if !well_formed {
            return Err(DefineError::SpecKindMismatch);
        }

        debug!(message = %self.text_of(message), ?spec, "defining specialization");
        self.messages.define(message, type_key, spec);
        Ok(())
    }

    /// Registers the built-in channel natives (`close`, `is\closed`, `is\full`, `is\empty`).
    pub fn install_channel_natives(&self) {
        use crate::native;

        let chan = Value::sigil(well_known::CHANNEL);
        let pairs: [(&str, NativeFn); 4] = [
            ("close", native::native_channel_close),
            ("is\\closed", native::native_channel_is_closed),
            ("is\\full", native::native_channel_is_full),
            ("is\\empty", native::native_channel_is_empty),
        ];
        for (name, function) in pairs {
            let native = self.native(name, function);
            self.define(self.message(name), chan, Spec::Native(native))
                .expect("channel natives are well-formed");
        }
    }

    // FIBERS & SCHEDULING
    // --------------------------------------------------------------------------------------------

    /// Creates a fiber that will run `block`. `args` is the initial tuple; the receiver
    /// defaults to the block itself when no arguments are given.
    pub fn make_fiber(&self, block: Value, args: &[Value]) -> Result<Value, SpawnError> {
        if block.kind() != Kind::Block {
            return Err(SpawnError::NotABlock);
        }
        let proto_value = self.heap.get(block).as_block().prototype;
        let proto_obj = self.heap.get(proto_value);
        let proto = proto_obj.as_prototype();

        let mut vm = VmState::new(proto.module(), proto.begin());

        // Bottom frame: a zero tuple-count cell, then [block][return-ip][return-fb] with the
        // null return sentinel, then the argument tuple.
        vm.stack[0] = Value::raw(0);
        vm.stack[1] = block;
        vm.stack[2] = Value::raw(0);
        vm.stack[3] = Value::raw(0);
        vm.fb = 4;

        let args = if args.is_empty() { std::slice::from_ref(&block) } else { args };
        assert!(4 + args.len() < STACK_MAX, "fiber arguments exceed the stack");
        for (i, arg) in args.iter().enumerate() {
            vm.stack[vm.fb + i] = *arg;
        }
        vm.sp = vm.fb + args.len();
        vm.stack[vm.sp] = Value::raw(args.len() as u64);

        Ok(Value::fiber(self.heap.alloc(Object::Fiber(FiberObj::new(block, vm)))))
    }

    /// Creates and enqueues a fiber, pinning it to a worker round-robin. Fails with
    /// [SpawnError::QueueFull] when the chosen worker's queue is saturated.
    #[instrument(skip_all)]
    pub fn try_spawn(&self, block: Value, args: &[Value]) -> Result<Value, SpawnError> {
        let wkid = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        let worker = &self.workers[wkid];
        if worker.queue_len() >= self.options.spawn_queue_limit {
            return Err(SpawnError::QueueFull);
        }

        let fiber = self.make_fiber(block, args)?;
        worker.enqueue(fiber);
        Ok(fiber)
    }

    /// Runs `block` to completion and returns its final state.
    #[instrument(skip_all)]
    pub fn run_main(&self, block: Value, args: &[Value]) -> Result<FiberDone, EngineError> {
        let fiber = self.try_spawn(block, args)?;
        self.run_until_done(fiber)
    }

    /// Waits for `fiber` to finish. With background workers this blocks the calling thread;
    /// without, it drives the scheduler inline.
    pub fn run_until_done(&self, fiber: Value) -> Result<FiberDone, EngineError> {
        debug_assert_eq!(fiber.kind(), Kind::Fiber);

        if self.options.workers > 0 {
            let object = self.heap.get(fiber);
            return Ok(object.as_fiber().wait_done());
        }

        let mut bank = self.inline_bank.lock().expect("inline bank poisoned");
        let shared = self.worker(0).clone();
        let mut idle = 0usize;

        loop {
            let target = self.heap.get(fiber);
            let target = target.as_fiber();
            if target.state() == Lifecycle::Done {
                return Ok(target.result().expect("done fiber has a result"));
            }

            let Some(next) = shared.try_dequeue() else {
                return Err(EngineError::Stalled);
            };

            match crate::vm::execute(self, 0, &mut bank, next) {
                Outcome::Timeout(_) => {
                    shared.enqueue(next);
                    idle += 1;
                    if idle > STALL_LIMIT {
                        return Err(EngineError::Stalled);
                    }
                },
                Outcome::Valid(_) | Outcome::Invalid(_) => idle = 0,
            }
        }
    }

    // SIGNALS
    // --------------------------------------------------------------------------------------------

    /// Raises the cooperative terminate signal on every worker.
    pub fn signal_terminate(&self) {
        for worker in &self.workers {
            worker.raise_signal(signal::TERMINATE);
        }
    }

    /// Starts a collection epoch by signalling the first worker; the signal propagates
    /// worker-to-worker at their next check points.
    pub fn signal_collect(&self) {
        self.workers[0].raise_signal(signal::COLLECT);
    }

    /// Forwards the collect signal to the next worker, if any.
    pub(crate) fn propagate_collect(&self, wkid: usize) {
        if wkid + 1 < self.workers.len() {
            self.workers[wkid + 1].raise_signal(signal::COLLECT);
        }
    }

    // ERROR LOG
    // --------------------------------------------------------------------------------------------

    /// Appends a rendered error value to the engine's error log.
    pub fn log_error(&self, error: Value) {
        self.errors.lock().expect("error log poisoned").push(error);
    }

    /// Snapshot of the error log.
    pub fn errors(&self) -> Vec<Value> {
        self.errors.lock().expect("error log poisoned").clone()
    }

    // RENDERING
    // --------------------------------------------------------------------------------------------

    /// Renders a value for notes and logs.
    pub fn inspect(&self, value: Value) -> String {
        match value.kind() {
            Kind::Number => {
                let n = value.to_f64();
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    format!("{}", n as i64)
                } else {
                    format!("{n}")
                }
            },
            Kind::Sigil => format!(".{}", self.text_of(value)),
            Kind::String => format!("{:?}", &*self.text_of(value)),
            Kind::Primitive => {
                let name =
                    murmur_core::Op::decode(value.to_op_byte()).map(|op| op.name()).unwrap_or("?");
                format!("<primitive {name}>")
            },
            Kind::Undefined => "undefined".into(),
            Kind::Invalid => "invalid".into(),
            Kind::Timeout => "timeout".into(),
            Kind::Raw => format!("<raw {}>", value.raw_bits()),
            Kind::Record => {
                let object = self.heap.get(value);
                let record = object.as_record();
                let shape_obj = self.heap.get(record.shape);
                let fields = shape_obj
                    .as_shape()
                    .keys
                    .iter()
                    .zip(record.values.iter())
                    .map(|(k, v)| format!("{}: {}", self.text_of(*k), self.inspect(*v)))
                    .join(", ");
                format!("{{ {fields} }}")
            },
            Kind::Shape => {
                let object = self.heap.get(value);
                let keys = object.as_shape().keys.iter().map(|k| self.text_of(*k)).join(" ");
                format!("<shape {keys}>")
            },
            Kind::List => {
                let object = self.heap.get(value);
                let items = object.as_list().items.iter().map(|v| self.inspect(*v)).join(", ");
                format!("[{items}]")
            },
            Kind::Block => "<block>".into(),
            Kind::Native => {
                let object = self.heap.get(value);
                format!("<native {}>", self.text_of(object.as_native().name))
            },
            Kind::Prototype => "<prototype>".into(),
            Kind::Fiber => "<fiber>".into(),
            Kind::Channel => "<channel>".into(),
            Kind::Box => {
                let object = self.heap.get(value);
                format!("<box {}>", self.inspect(object.as_box().type_key))
            },
        }
    }
}
