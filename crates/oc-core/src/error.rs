//! Error types for the oxidized-cell emulator

use thiserror::Error;

/// Main error type for the emulator
#[derive(Error, Debug)]
pub enum EmulatorError {
    #[error("RSX error: {0}")]
    Rsx(#[from] RsxError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(String),
}

/// RSX (Reality Synthesizer) graphics errors
#[derive(Error, Debug)]
pub enum RsxError {
    #[error("Shader cache error: {0}")]
    ShaderCache(#[from] ShaderCacheError),

    #[error("Backend error: {0}")]
    Backend(String),
}

/// Shader program cache errors
///
/// None of these abort rendering: a failing entry is marked failed, a corrupt
/// record is skipped, and a failing disk cache drops to memory-only operation.
#[derive(Error, Debug)]
pub enum ShaderCacheError {
    #[error("{stage} shader generation failed: {reason}")]
    Generation { stage: &'static str, reason: String },

    #[error("{stage} shader compilation failed ({target}): {diagnostics}")]
    Compile {
        stage: &'static str,
        target: String,
        diagnostics: String,
    },

    #[error("Corrupt shader cache record at offset {offset}: {reason}")]
    Corrupt { offset: u64, reason: String },

    #[error("Shader cache header mismatch: {0}")]
    VersionMismatch(String),

    #[error("Shader cache write failed: {0}")]
    DiskWrite(std::io::Error),

    #[error("Shader cache IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for emulator operations
pub type Result<T> = std::result::Result<T, EmulatorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ShaderCacheError::Corrupt {
            offset: 0x40,
            reason: "zero-length bytecode".to_string(),
        };
        assert_eq!(
            format!("{}", err),
            "Corrupt shader cache record at offset 64: zero-length bytecode"
        );

        let err = ShaderCacheError::Compile {
            stage: "vertex",
            target: "vs_5_0".to_string(),
            diagnostics: "missing entry point".to_string(),
        };
        assert_eq!(
            format!("{}", err),
            "vertex shader compilation failed (vs_5_0): missing entry point"
        );
    }

    #[test]
    fn test_error_conversion() {
        let cache_err = ShaderCacheError::VersionMismatch("bad magic".to_string());
        let rsx_err: RsxError = cache_err.into();
        let emu_err: EmulatorError = rsx_err.into();
        assert!(matches!(
            emu_err,
            EmulatorError::Rsx(RsxError::ShaderCache(ShaderCacheError::VersionMismatch(_)))
        ));
    }
}
