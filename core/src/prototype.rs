use smallvec::SmallVec;

use crate::{ModuleId, Value};

// UPVALUE DESCRIPTOR
// ================================================================================================

/// How a block resolves one captured upvalue at creation time: from a local slot of the
/// enclosing frame, or from the enclosing block's own upvalue array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpvalueDesc {
    pub is_local: bool,
    pub index: u8,
}

impl UpvalueDesc {
    pub const fn local(index: u8) -> Self {
        Self { is_local: true, index }
    }

    pub const fn upvalue(index: u8) -> Self {
        Self { is_local: false, index }
    }
}

// PROTOTYPE
// ================================================================================================

/// The immutable compiled form of a function body.
///
/// A prototype does not own bytecode; it references a region of its module's stream by offset.
/// The environment shape describes the frame's locals and is used to build the environment
/// record surfaced when the frame is the bottom of a finishing or panicking fiber.
#[derive(Debug)]
pub struct Prototype {
    module: ModuleId,
    begin: u32,
    nargs: u8,
    nslots: u16,
    upvalues: SmallVec<[UpvalueDesc; 8]>,
    shape: Value,
}

impl Prototype {
    pub fn new(
        module: ModuleId,
        begin: u32,
        nargs: u8,
        nslots: u16,
        upvalues: impl IntoIterator<Item = UpvalueDesc>,
        shape: Value,
    ) -> Self {
        Self {
            module,
            begin,
            nargs,
            nslots,
            upvalues: upvalues.into_iter().collect(),
            shape,
        }
    }

    pub fn module(&self) -> ModuleId {
        self.module
    }

    /// Bytecode offset where this prototype's body begins.
    pub fn begin(&self) -> usize {
        self.begin as usize
    }

    pub fn nargs(&self) -> u8 {
        self.nargs
    }

    /// Stack slots the frame requires beyond the three header cells.
    pub fn nslots(&self) -> usize {
        self.nslots as usize
    }

    pub fn upvalues(&self) -> &[UpvalueDesc] {
        &self.upvalues
    }

    /// Shape of the environment record produced when the frame surfaces.
    pub fn shape(&self) -> Value {
        self.shape
    }
}
