use std::sync::{Arc, RwLock};

use murmur_core::{Prototype, Value};
use smallvec::SmallVec;

use crate::{channel::ChannelObj, fiber::FiberObj, native::NativeFn};

// OBJECTS
// ================================================================================================

/// A heap-resident object. Values address objects by arena index; the value tag already names
/// the kind, so lookups go straight to the payload.
///
/// Records, shapes, lists, blocks, natives, prototypes and boxes are immutable after creation.
/// Fibers and channels carry their own synchronization.
#[derive(Debug)]
pub enum Object {
    Record(RecordObj),
    Shape(ShapeObj),
    List(ListObj),
    Block(BlockObj),
    Native(NativeObj),
    Prototype(Prototype),
    Fiber(FiberObj),
    Channel(ChannelObj),
    Box(BoxObj),
}

/// A record: a shape plus one value per key.
#[derive(Debug)]
pub struct RecordObj {
    pub shape: Value,
    pub values: Box<[Value]>,
}

/// A shape: an ordered set of keys. Shapes are interned by the engine so that records built
/// from the same keys share one shape value.
#[derive(Debug)]
pub struct ShapeObj {
    pub keys: Box<[Value]>,
}

impl ShapeObj {
    /// Position of a key within the shape.
    pub fn position(&self, key: Value) -> Option<usize> {
        self.keys.iter().position(|k| *k == key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[derive(Debug)]
pub struct ListObj {
    pub items: Box<[Value]>,
}

/// A closure: a prototype together with its captured upvalues.
#[derive(Debug)]
pub struct BlockObj {
    pub prototype: Value,
    pub upvalues: SmallVec<[Value; 8]>,
}

/// A foreign callable.
pub struct NativeObj {
    pub name: Value,
    pub function: NativeFn,
}

impl std::fmt::Debug for NativeObj {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeObj").field("name", &self.name).finish_non_exhaustive()
    }
}

/// An opaque foreign datum tagged with the sigil that types it.
#[derive(Debug)]
pub struct BoxObj {
    pub type_key: Value,
    pub data: Box<[u8]>,
}

// HEAP
// ================================================================================================

/// The object arena: an append-only vector of shared cells.
///
/// Allocation takes the write lock briefly; reads clone the `Arc` under the read lock. Cells
/// are never replaced or removed (collection is a collaborator outside this crate), so an index
/// handed out once stays valid for the life of the engine.
#[derive(Debug, Default)]
pub struct Heap {
    cells: RwLock<Vec<Arc<Object>>>,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates an object, returning the value addressing it.
    pub fn alloc(&self, object: Object) -> u32 {
        let mut cells = self.cells.write().expect("heap poisoned");
        let ix = cells.len() as u32;
        cells.push(Arc::new(object));
        ix
    }

    /// Fetches the object a value addresses.
    pub fn get(&self, value: Value) -> Arc<Object> {
        let cells = self.cells.read().expect("heap poisoned");
        cells[value.index() as usize].clone()
    }

    pub fn len(&self) -> usize {
        self.cells.read().expect("heap poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// KIND ACCESSORS
// ================================================================================================

impl Object {
    pub fn as_record(&self) -> &RecordObj {
        match self {
            Object::Record(r) => r,
            _ => unreachable!("value tag said record"),
        }
    }

    pub fn as_shape(&self) -> &ShapeObj {
        match self {
            Object::Shape(s) => s,
            _ => unreachable!("value tag said shape"),
        }
    }

    pub fn as_list(&self) -> &ListObj {
        match self {
            Object::List(l) => l,
            _ => unreachable!("value tag said list"),
        }
    }

    pub fn as_block(&self) -> &BlockObj {
        match self {
            Object::Block(b) => b,
            _ => unreachable!("value tag said block"),
        }
    }

    pub fn as_native(&self) -> &NativeObj {
        match self {
            Object::Native(n) => n,
            _ => unreachable!("value tag said native"),
        }
    }

    pub fn as_prototype(&self) -> &Prototype {
        match self {
            Object::Prototype(p) => p,
            _ => unreachable!("value tag said prototype"),
        }
    }

    pub fn as_fiber(&self) -> &FiberObj {
        match self {
            Object::Fiber(f) => f,
            _ => unreachable!("value tag said fiber"),
        }
    }

    pub fn as_channel(&self) -> &ChannelObj {
        match self {
            Object::Channel(c) => c,
            _ => unreachable!("value tag said channel"),
        }
    }

    pub fn as_box(&self) -> &BoxObj {
        match self {
            Object::Box(b) => b,
            _ => unreachable!("value tag said box"),
        }
    }
}
