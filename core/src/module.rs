use std::sync::Arc;

use crate::{Value, opcode::cache};

// MODULE ID
// ================================================================================================

/// Identifier of a compiled module within an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleId(u32);

impl ModuleId {
    pub const fn new(ix: u32) -> Self {
        Self(ix)
    }

    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

// MODULE
// ================================================================================================

/// A compiled source: the master bytecode stream, the master constant pool, and the
/// offset-to-token map used to attribute errors.
///
/// The master copies are immutable. Workers materialize their own mutable copies (see the
/// processor's code bank) so that inline-cache rewrites stay thread-local.
#[derive(Debug)]
pub struct Module {
    name: String,
    code: Vec<u8>,
    constants: Vec<Value>,
    /// One token per bytecode offset.
    tokens: Vec<u32>,
    /// One source line per token.
    token_lines: Vec<u32>,
}

impl Module {
    pub fn new(
        name: impl Into<String>,
        code: Vec<u8>,
        constants: Vec<Value>,
        tokens: Vec<u32>,
        token_lines: Vec<u32>,
    ) -> Arc<Self> {
        debug_assert_eq!(code.len(), tokens.len());
        Arc::new(Self {
            name: name.into(),
            code,
            constants,
            tokens,
            token_lines,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn constants(&self) -> &[Value] {
        &self.constants
    }

    /// The token active at the given bytecode offset, or 0 when the module carries no map.
    pub fn token_at(&self, offset: usize) -> u32 {
        self.tokens.get(offset).copied().unwrap_or(0)
    }

    /// The source line of a token, or 0 when unknown.
    pub fn line_of(&self, token: u32) -> u32 {
        self.token_lines.get(token as usize).copied().unwrap_or(0)
    }
}

// MODULE BUILDER
// ================================================================================================

/// Incremental builder for [Module] values.
///
/// The compiler proper is out of scope; this builder is the runtime-side contract it targets,
/// and what the test suite uses to assemble bytecode by hand.
#[derive(Debug, Default)]
pub struct ModuleBuilder {
    name: String,
    code: Vec<u8>,
    constants: Vec<Value>,
    tokens: Vec<u32>,
    token_lines: Vec<u32>,
    token: u32,
}

impl ModuleBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Self::default() }
    }

    /// Sets the token attributed to subsequently emitted bytes.
    pub fn token(&mut self, token: u32, line: u32) -> &mut Self {
        self.token = token;
        while self.token_lines.len() <= token as usize {
            self.token_lines.push(0);
        }
        self.token_lines[token as usize] = line;
        self
    }

    /// Current bytecode offset.
    pub fn offset(&self) -> usize {
        self.code.len()
    }

    pub fn byte(&mut self, byte: u8) -> &mut Self {
        self.code.push(byte);
        self.tokens.push(self.token);
        self
    }

    /// Emits a big-endian 16-bit operand.
    pub fn short(&mut self, short: u16) -> &mut Self {
        self.byte((short >> 8) as u8);
        self.byte(short as u8)
    }

    /// Adds a constant, reusing an existing pool slot on bitwise equality.
    pub fn constant(&mut self, value: Value) -> u16 {
        if let Some(ix) = self.constants.iter().position(|k| *k == value) {
            return ix as u16;
        }
        self.constants.push(value);
        (self.constants.len() - 1) as u16
    }

    /// Reserves a send-site cache block seeded with the message, returning the block's base
    /// index. Every cell other than the message starts out invalid.
    pub fn send_cache(&mut self, message: Value) -> u16 {
        let base = self.constants.len() as u16;
        self.constants.push(message);
        for _ in 1..cache::LEN {
            self.constants.push(Value::INVALID);
        }
        base
    }

    pub fn build(&mut self) -> Arc<Module> {
        Module::new(
            core::mem::take(&mut self.name),
            core::mem::take(&mut self.code),
            core::mem::take(&mut self.constants),
            core::mem::take(&mut self.tokens),
            core::mem::take(&mut self.token_lines),
        )
    }
}

// TESTS
// ================================================================================================
