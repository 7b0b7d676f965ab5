//! Null backend for testing
//!
//! Has a real (if tiny) shader compiler so the cache machinery can be
//! exercised without a GPU: it checks the entry point, brace balance and
//! `#error` directives, and emits self-verifying bytecode.

use super::ShaderBackend;
use crate::shader::{CompileUnit, ShaderCompiler, ShaderStage};
use sha1::{Digest, Sha1};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

const NULL_BYTECODE_MAGIC: [u8; 4] = *b"NULB";
/// magic + stage + reserved + flags + sha1
const NULL_BYTECODE_HEADER: usize = 4 + 1 + 3 + 4 + 20;

/// Program object handed out by the null backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NullProgram {
    pub id: u32,
    pub stage: ShaderStage,
    /// SHA-1 of the compiled source
    pub digest: [u8; 20],
}

/// Worker-side compiler of the null backend
#[derive(Debug, Default)]
pub struct NullCompiler {
    compiled: AtomicUsize,
}

impl NullCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of units this compiler has been asked to compile
    pub fn compile_count(&self) -> usize {
        self.compiled.load(Ordering::SeqCst)
    }
}

impl ShaderCompiler for NullCompiler {
    fn compile(&self, unit: &CompileUnit) -> Result<Vec<u8>, String> {
        self.compiled.fetch_add(1, Ordering::SeqCst);

        for (line_no, line) in unit.source.lines().enumerate() {
            if let Some(message) = line.trim_start().strip_prefix("#error") {
                return Err(format!("({}): error: {}", line_no + 1, message.trim()));
            }
        }

        if !unit.source.contains(&format!("void {}(", unit.entry_point)) {
            return Err(format!("error: entry point '{}' not found", unit.entry_point));
        }

        let mut depth = 0i32;
        for c in unit.source.chars() {
            match c {
                '{' => depth += 1,
                '}' => depth -= 1,
                _ => {}
            }
            if depth < 0 {
                return Err("error: unexpected '}'".to_string());
            }
        }
        if depth != 0 {
            return Err("error: unexpected end of file, missing '}'".to_string());
        }

        let digest = Sha1::digest(unit.source.as_bytes());
        let mut bytecode = Vec::with_capacity(NULL_BYTECODE_HEADER + unit.source.len());
        bytecode.extend_from_slice(&NULL_BYTECODE_MAGIC);
        bytecode.push(unit.stage.bits());
        bytecode.extend_from_slice(&[0; 3]);
        bytecode.extend_from_slice(&unit.flags.bits().to_le_bytes());
        bytecode.extend_from_slice(&digest);
        bytecode.extend_from_slice(unit.source.as_bytes());
        Ok(bytecode)
    }
}

/// Shader backend without a GPU
pub struct NullBackend {
    compiler: Arc<NullCompiler>,
    next_program: AtomicU32,
    links_programs: bool,
    device: String,
}

impl NullBackend {
    pub fn new() -> Self {
        Self {
            compiler: Arc::new(NullCompiler::new()),
            next_program: AtomicU32::new(1),
            links_programs: false,
            device: "null-device/1.0".to_string(),
        }
    }

    /// Null backend that draws with linked programs (GL style)
    pub fn with_linked_programs() -> Self {
        Self {
            links_programs: true,
            ..Self::new()
        }
    }

    /// Units compiled by the worker-side compiler
    pub fn compile_count(&self) -> usize {
        self.compiler.compile_count()
    }

    /// Program objects created so far
    pub fn artifacts_created(&self) -> u32 {
        self.next_program.load(Ordering::SeqCst) - 1
    }
}

impl Default for NullBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ShaderBackend for NullBackend {
    type Artifact = NullProgram;

    fn name(&self) -> &'static str {
        "NULL"
    }

    fn device_signature(&self) -> String {
        self.device.clone()
    }

    fn target_profile(&self, stage: ShaderStage) -> String {
        format!("null_{}_1_0", stage.short_name())
    }

    fn compiler(&self) -> Arc<dyn ShaderCompiler> {
        self.compiler.clone()
    }

    fn create_artifact(&self, stage: ShaderStage, bytecode: &[u8]) -> Option<NullProgram> {
        if bytecode.len() < NULL_BYTECODE_HEADER || bytecode[0..4] != NULL_BYTECODE_MAGIC {
            return None;
        }
        if bytecode[4] != stage.bits() {
            return None;
        }

        let mut digest = [0u8; 20];
        digest.copy_from_slice(&bytecode[12..32]);
        if Sha1::digest(&bytecode[NULL_BYTECODE_HEADER..]).as_slice() != digest {
            return None;
        }

        Some(NullProgram {
            id: self.next_program.fetch_add(1, Ordering::SeqCst),
            stage,
            digest,
        })
    }

    fn links_programs(&self) -> bool {
        self.links_programs
    }
}
