//! Core components of the Murmur virtual machine: the NaN-boxed value representation, the
//! opcode set and instruction encoding, compiled modules and prototypes, and the panic
//! taxonomy.
//!
//! Everything here is shared between the processor and any host embedding the VM. Nothing in
//! this crate is mutable after construction; per-worker mutable state (code banks, caches)
//! lives in the processor.

mod module;
mod prototype;
mod status;
mod value;

pub mod opcode;

pub use module::{Module, ModuleBuilder, ModuleId};
pub use opcode::{Op, SEND_CACHE_SIZE, SEND_SITE_LEN, TAIL_FLAG};
pub use prototype::{Prototype, UpvalueDesc};
pub use status::Status;
pub use value::{Kind, Value, well_known};
