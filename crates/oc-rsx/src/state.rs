//! RSX pipeline state relevant to shader selection
//!
//! The command processor owns the full register file; this is the snapshot it
//! hands to the shader caches once per draw.

/// Primitive topology types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum PrimitiveType {
    Points = 1,
    Lines = 2,
    LineLoop = 3,
    LineStrip = 4,
    #[default]
    Triangles = 5,
    TriangleStrip = 6,
    TriangleFan = 7,
    Quads = 8,
    QuadStrip = 9,
    Polygon = 10,
}

impl PrimitiveType {
    /// Decode the NV4097_SET_BEGIN_END primitive value
    pub fn from_raw(value: u32) -> Option<Self> {
        Some(match value {
            1 => Self::Points,
            2 => Self::Lines,
            3 => Self::LineLoop,
            4 => Self::LineStrip,
            5 => Self::Triangles,
            6 => Self::TriangleStrip,
            7 => Self::TriangleFan,
            8 => Self::Quads,
            9 => Self::QuadStrip,
            10 => Self::Polygon,
            _ => return None,
        })
    }

    /// Topology class seen by the geometry stage after primitive assembly
    pub fn class(self) -> PrimitiveClass {
        match self {
            Self::Points => PrimitiveClass::Points,
            Self::Lines | Self::LineLoop | Self::LineStrip => PrimitiveClass::Lines,
            _ => PrimitiveClass::Triangles,
        }
    }
}

/// Assembled primitive class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PrimitiveClass {
    Points = 0,
    Lines = 1,
    Triangles = 2,
}

/// Shader-relevant slice of the RSX graphics state
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineState {
    pub primitive_type: PrimitiveType,

    // Programs (hashed microcode, see `shader::program_hash`)
    pub vertex_program_hash: u64,
    pub fragment_program_hash: u64,

    // Vertex attribute state (16 attributes max)
    pub vertex_attrib_input_mask: u32,
    pub vertex_attrib_output_mask: u32,
    /// Low nibble of NV4097_SET_VERTEX_DATA_ARRAY_FORMAT per attribute
    pub vertex_attrib_type: [u8; 16],

    /// Bit per texture unit sampled by the fragment program
    pub texture_mask: u16,

    // Alpha test state
    pub alpha_test_enable: bool,
    pub alpha_test_func: u32,

    pub fog_mode: u32,

    // Line and point state
    pub point_sprite_enable: bool,
    /// Front and back polygons drawn as lines
    pub wireframe: bool,

    /// Two-view stereoscopic rendering
    pub stereo: bool,
}

impl PipelineState {
    /// Create a new pipeline state with default values
    pub fn new() -> Self {
        Self {
            primitive_type: PrimitiveType::Triangles,
            vertex_program_hash: 0,
            fragment_program_hash: 0,
            vertex_attrib_input_mask: 0x1,
            vertex_attrib_output_mask: 0x1,
            vertex_attrib_type: [2; 16], // CELL_GCM_VERTEX_F
            texture_mask: 0,
            alpha_test_enable: false,
            alpha_test_func: 0x0207, // ALWAYS
            fog_mode: 0,
            point_sprite_enable: false,
            wireframe: false,
            stereo: false,
        }
    }
}

impl Default for PipelineState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_from_raw() {
        assert_eq!(PrimitiveType::from_raw(5), Some(PrimitiveType::Triangles));
        assert_eq!(PrimitiveType::from_raw(10), Some(PrimitiveType::Polygon));
        assert_eq!(PrimitiveType::from_raw(0), None);
        assert_eq!(PrimitiveType::from_raw(11), None);
    }

    #[test]
    fn test_primitive_class() {
        assert_eq!(PrimitiveType::Points.class(), PrimitiveClass::Points);
        assert_eq!(PrimitiveType::LineLoop.class(), PrimitiveClass::Lines);
        assert_eq!(PrimitiveType::Quads.class(), PrimitiveClass::Triangles);
    }
}
