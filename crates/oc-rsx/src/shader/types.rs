//! Shared shader types

use bitflags::bitflags;

bitflags! {
    /// Shader stage flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ShaderStage: u8 {
        const VERTEX = 0x01;
        const FRAGMENT = 0x02;
        const GEOMETRY = 0x04;
        /// Vertex + fragment (+ geometry) linked into one program
        const PROGRAM = Self::VERTEX.bits() | Self::FRAGMENT.bits() | Self::GEOMETRY.bits();
    }
}

impl ShaderStage {
    /// Short tag used in file names and target profiles
    pub fn short_name(self) -> &'static str {
        if self == Self::PROGRAM {
            "prog"
        } else if self == Self::VERTEX {
            "vs"
        } else if self == Self::FRAGMENT {
            "fs"
        } else if self == Self::GEOMETRY {
            "gs"
        } else {
            "mixed"
        }
    }
}

bitflags! {
    /// Options forwarded to the backend compiler
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CompileFlags: u32 {
        const SKIP_VALIDATION = 0x01;
        const OPTIMIZE = 0x02;
        const BACKWARDS_COMPATIBILITY = 0x04;
        const DEBUG_INFO = 0x08;
    }
}

impl CompileFlags {
    /// Swap optimization for debug info when shader debugging is on
    pub fn for_debugging(self, debugging: bool) -> Self {
        if debugging {
            (self - Self::OPTIMIZE - Self::SKIP_VALIDATION) | Self::DEBUG_INFO
        } else {
            self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_short_names() {
        assert_eq!(ShaderStage::VERTEX.short_name(), "vs");
        assert_eq!(ShaderStage::GEOMETRY.short_name(), "gs");
        assert_eq!(ShaderStage::PROGRAM.short_name(), "prog");
        assert!(ShaderStage::PROGRAM.contains(ShaderStage::FRAGMENT));
    }

    #[test]
    fn test_debug_flags() {
        let flags = CompileFlags::OPTIMIZE | CompileFlags::SKIP_VALIDATION;
        assert_eq!(flags.for_debugging(false), flags);
        assert_eq!(flags.for_debugging(true), CompileFlags::DEBUG_INFO);
    }
}
