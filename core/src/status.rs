// STATUS
// ================================================================================================

/// The panic taxonomy. These are tags carried by error values, not language types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum Status {
    /// A frame that contributes context to a trace without being the fault itself.
    #[error("ok")]
    None,
    /// An operand failed a primitive type guard.
    #[error("type mismatch")]
    TypeMismatch,
    /// No specialization exists for the (message, receiver type) pair.
    #[error("specialization missing")]
    SpecializationMissing,
    /// The stack-space guard failed.
    #[error("stack overflow")]
    Overflow,
    /// An explicit user-level panic.
    #[error("panic")]
    Panic,
    /// The cooperative terminate signal was observed.
    #[error("terminated")]
    Term,
}

impl Status {
    /// The sigil spelling under which this status appears in error records.
    pub const fn sigil_name(self) -> &'static str {
        match self {
            Status::None => "ok",
            Status::TypeMismatch => "type\\mismatch",
            Status::SpecializationMissing => "specialization\\missing",
            Status::Overflow => "overflow",
            Status::Panic => "panic",
            Status::Term => "term",
        }
    }
}
