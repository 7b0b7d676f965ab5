//! Concrete RSX shader stages
//!
//! Keys are `repr(C)` structs of `u32`s so they have no padding and can be
//! written to disk byte for byte.

use super::key::{join_hash, split_hash, CacheKey};
use super::stage::ShaderStageDesc;
use super::types::{CompileFlags, ShaderStage};
use crate::state::{PipelineState, PrimitiveClass};
use bytemuck::{Pod, Zeroable};
use oc_core::ShaderCacheError;
use std::fmt::Write;

/// Version of the source generators below
pub const SHADER_GEN_VERSION: u32 = 1;

const MAX_VERTEX_ATTRIBS: usize = 16;
const MAX_TEXTURE_UNITS: usize = 16;

/// Highest valid CELL_GCM_VERTEX_* type
const VERTEX_TYPE_MAX: u32 = 7;

const VS_FLAG_POINT_SIZE: u32 = 0x1;
const VS_FLAG_MASK: u32 = 0x1;

const FS_FLAG_ALPHA_TEST: u32 = 0x1;
const FS_ALPHA_FUNC_SHIFT: u32 = 1;
const FS_FOG_SHIFT: u32 = 4;
const FS_FLAG_MASK: u32 = 0x7F;

const GS_FLAG_STEREO: u32 = 0x1;
const GS_FLAG_WIREFRAME: u32 = 0x2;
const GS_FLAG_POINT_SPRITE: u32 = 0x4;
const GS_FLAG_MASK: u32 = 0x7;

// ============================================================================
// Keys
// ============================================================================

/// Vertex shader variant
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Pod, Zeroable)]
pub struct VertexShaderKey {
    pub program_hash: [u32; 2],
    pub input_mask: u32,
    pub output_mask: u32,
    /// 4 bits per attribute, attribute 0 in the low nibble of word 0
    pub attrib_types: [u32; 2],
    pub flags: u32,
    pub reserved: u32,
}

impl VertexShaderKey {
    pub fn attrib_type(&self, index: usize) -> u32 {
        (self.attrib_types[index / 8] >> ((index % 8) * 4)) & 0xF
    }
}

impl CacheKey for VertexShaderKey {
    fn is_valid(&self) -> bool {
        self.reserved == 0
            && self.input_mask <= 0xFFFF
            && self.flags & !VS_FLAG_MASK == 0
            && (0..MAX_VERTEX_ATTRIBS).all(|i| self.attrib_type(i) <= VERTEX_TYPE_MAX)
    }
}

/// Fragment shader variant
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Pod, Zeroable)]
pub struct FragmentShaderKey {
    pub program_hash: [u32; 2],
    pub texture_mask: u32,
    /// alpha test enable | alpha func (3 bits) | fog mode (3 bits)
    pub flags: u32,
}

impl FragmentShaderKey {
    pub fn alpha_test(&self) -> Option<u32> {
        (self.flags & FS_FLAG_ALPHA_TEST != 0).then_some((self.flags >> FS_ALPHA_FUNC_SHIFT) & 0x7)
    }

    pub fn fog(&self) -> u32 {
        (self.flags >> FS_FOG_SHIFT) & 0x7
    }
}

impl CacheKey for FragmentShaderKey {
    fn is_valid(&self) -> bool {
        self.texture_mask <= 0xFFFF
            && self.flags & !FS_FLAG_MASK == 0
            && self.fog() <= FOG_MODES.len() as u32
    }
}

/// Geometry shader variant
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Pod, Zeroable)]
pub struct GeometryShaderKey {
    pub primitive_class: u32,
    pub output_mask: u32,
    pub flags: u32,
    pub reserved: u32,
}

impl GeometryShaderKey {
    fn class(&self) -> Option<PrimitiveClass> {
        match self.primitive_class {
            0 => Some(PrimitiveClass::Points),
            1 => Some(PrimitiveClass::Lines),
            2 => Some(PrimitiveClass::Triangles),
            _ => None,
        }
    }

    /// The geometry stage would only copy its input through
    pub fn is_passthrough(&self) -> bool {
        self.class() == Some(PrimitiveClass::Triangles)
            && self.flags & (GS_FLAG_STEREO | GS_FLAG_WIREFRAME) == 0
    }
}

impl CacheKey for GeometryShaderKey {
    fn is_valid(&self) -> bool {
        self.class().is_some() && self.flags & !GS_FLAG_MASK == 0 && self.reserved == 0
    }
}

/// Linked program variant
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Pod, Zeroable)]
pub struct ProgramKey {
    pub vertex: VertexShaderKey,
    pub fragment: FragmentShaderKey,
    /// Zeroed when `geometry_enabled` is 0
    pub geometry: GeometryShaderKey,
    pub geometry_enabled: u32,
    pub reserved: u32,
}

impl CacheKey for ProgramKey {
    fn is_valid(&self) -> bool {
        let geometry_ok = match self.geometry_enabled {
            0 => self.geometry == GeometryShaderKey::default(),
            1 => self.geometry.is_valid(),
            _ => false,
        };
        self.reserved == 0 && self.vertex.is_valid() && self.fragment.is_valid() && geometry_ok
    }
}

// ============================================================================
// Key derivation
// ============================================================================

fn vertex_key(state: &PipelineState) -> VertexShaderKey {
    let mut attrib_types = [0u32; 2];
    for (i, ty) in state.vertex_attrib_type.iter().enumerate() {
        if state.vertex_attrib_input_mask & (1 << i) != 0 {
            attrib_types[i / 8] |= (*ty as u32 & 0x7) << ((i % 8) * 4);
        }
    }

    VertexShaderKey {
        program_hash: split_hash(state.vertex_program_hash),
        input_mask: state.vertex_attrib_input_mask & 0xFFFF,
        output_mask: state.vertex_attrib_output_mask,
        attrib_types,
        flags: if state.point_sprite_enable
            && state.primitive_type.class() == PrimitiveClass::Points
        {
            VS_FLAG_POINT_SIZE
        } else {
            0
        },
        reserved: 0,
    }
}

/// RSX fog modes in the order they are encoded in keys (0 = off)
const FOG_MODES: [u32; 6] = [0x2601, 0x0800, 0x0801, 0x2802, 0x2803, 0x2804];

fn fog_index(mode: u32) -> u32 {
    FOG_MODES
        .iter()
        .position(|m| *m == mode)
        .map(|i| i as u32 + 1)
        .unwrap_or(0)
}

fn fragment_key(state: &PipelineState) -> FragmentShaderKey {
    let mut flags = fog_index(state.fog_mode) << FS_FOG_SHIFT;
    if state.alpha_test_enable {
        // NV4097 compare funcs are 0x0200 (NEVER) .. 0x0207 (ALWAYS)
        flags |= FS_FLAG_ALPHA_TEST | ((state.alpha_test_func & 0x7) << FS_ALPHA_FUNC_SHIFT);
    }

    FragmentShaderKey {
        program_hash: split_hash(state.fragment_program_hash),
        texture_mask: state.texture_mask as u32,
        flags,
    }
}

fn geometry_key(state: &PipelineState) -> GeometryShaderKey {
    let mut flags = 0;
    if state.stereo {
        flags |= GS_FLAG_STEREO;
    }
    if state.wireframe {
        flags |= GS_FLAG_WIREFRAME;
    }
    if state.point_sprite_enable && state.primitive_type.class() == PrimitiveClass::Points {
        flags |= GS_FLAG_POINT_SPRITE;
    }

    GeometryShaderKey {
        primitive_class: state.primitive_type.class() as u32,
        output_mask: state.vertex_attrib_output_mask,
        flags,
        reserved: 0,
    }
}

fn geometry_passthrough(state: &PipelineState) -> bool {
    state.primitive_type.class() == PrimitiveClass::Triangles && !state.stereo && !state.wireframe
}

// ============================================================================
// Source generation
// ============================================================================

fn generation_error(stage: &'static str, reason: impl Into<String>) -> ShaderCacheError {
    ShaderCacheError::Generation {
        stage,
        reason: reason.into(),
    }
}

fn vertex_type_name(ty: u32) -> &'static str {
    match ty {
        1 => "s1",
        2 => "f",
        3 => "sf",
        4 => "ub",
        5 => "s32k",
        6 => "cmp",
        7 => "ub256",
        _ => "none",
    }
}

fn generate_vertex(key: &VertexShaderKey) -> Result<String, ShaderCacheError> {
    if key.output_mask == 0 {
        return Err(generation_error("vertex", "vertex program writes no outputs"));
    }

    let mut src = String::new();
    let hash = join_hash(key.program_hash);
    // Writing to a String cannot fail
    let _ = writeln!(src, "#version 450");
    let _ = writeln!(src, "// vertex program {:016x}", hash);
    let _ = writeln!(
        src,
        "layout(std140, binding = 0) uniform VertexConstants {{ vec4 vc[468]; }};"
    );

    for i in (0..MAX_VERTEX_ATTRIBS).filter(|i| key.input_mask & (1 << i) != 0) {
        let _ = writeln!(
            src,
            "layout(location = {i}) in vec4 in_attr{i}; // {}",
            vertex_type_name(key.attrib_type(i))
        );
    }
    for i in (1..32).filter(|i| key.output_mask & (1 << i) != 0) {
        let _ = writeln!(src, "layout(location = {i}) out vec4 out_{i};");
    }

    let _ = writeln!(src, "\nvoid main()\n{{");
    if key.input_mask & 1 != 0 {
        let _ = writeln!(src, "    gl_Position = in_attr0;");
    } else {
        let _ = writeln!(src, "    gl_Position = vc[0];");
    }
    for i in (1..32).filter(|i| key.output_mask & (1 << i) != 0) {
        if i < MAX_VERTEX_ATTRIBS && key.input_mask & (1 << i) != 0 {
            let _ = writeln!(src, "    out_{i} = in_attr{i};");
        } else {
            let _ = writeln!(src, "    out_{i} = vec4(0.0, 0.0, 0.0, 1.0);");
        }
    }
    if key.flags & VS_FLAG_POINT_SIZE != 0 {
        let _ = writeln!(src, "    gl_PointSize = vc[467].x;");
    }
    let _ = writeln!(src, "}}");
    Ok(src)
}

const ALPHA_COMPARE: [&str; 8] = ["false", "<", "==", "<=", ">", "!=", ">=", "true"];

fn generate_fragment(key: &FragmentShaderKey) -> Result<String, ShaderCacheError> {
    let mut src = String::new();
    let _ = writeln!(src, "#version 450");
    let _ = writeln!(src, "// fragment program {:016x}", join_hash(key.program_hash));
    let _ = writeln!(
        src,
        "layout(std140, binding = 1) uniform FragmentState {{ float alpha_ref; vec4 fog_params; }};"
    );
    let _ = writeln!(src, "layout(location = 1) in vec4 v_color;");
    let _ = writeln!(src, "layout(location = 0) out vec4 out_color;");

    for unit in (0..MAX_TEXTURE_UNITS).filter(|u| key.texture_mask & (1 << u) != 0) {
        let _ = writeln!(src, "layout(binding = {}) uniform sampler2D tex{unit};", unit + 2);
        let _ = writeln!(src, "layout(location = {}) in vec4 v_tex{unit};", unit + 4);
    }

    let _ = writeln!(src, "\nvoid main()\n{{");
    let _ = writeln!(src, "    vec4 color = v_color;");
    for unit in (0..MAX_TEXTURE_UNITS).filter(|u| key.texture_mask & (1 << u) != 0) {
        let _ = writeln!(src, "    color *= texture(tex{unit}, v_tex{unit}.xy);");
    }

    match key.fog() {
        0 => {}
        1 | 6 => {
            let _ = writeln!(
                src,
                "    float fog = clamp(fog_params.x + gl_FragCoord.z * fog_params.y, 0.0, 1.0);"
            );
            let _ = writeln!(src, "    color.rgb = mix(fog_params.zzz, color.rgb, fog);");
        }
        _ => {
            let _ = writeln!(
                src,
                "    float fog = clamp(exp(-abs(gl_FragCoord.z * fog_params.y)), 0.0, 1.0);"
            );
            let _ = writeln!(src, "    color.rgb = mix(fog_params.zzz, color.rgb, fog);");
        }
    }

    if let Some(func) = key.alpha_test() {
        match ALPHA_COMPARE[func as usize] {
            "true" => {}
            "false" => {
                let _ = writeln!(src, "    discard;");
            }
            op => {
                let _ = writeln!(src, "    if (!(color.a {op} alpha_ref)) {{ discard; }}");
            }
        }
    }

    let _ = writeln!(src, "    out_color = color;\n}}");
    Ok(src)
}

fn generate_geometry(key: &GeometryShaderKey) -> Result<String, ShaderCacheError> {
    if key.is_passthrough() {
        return Err(generation_error("geometry", "passthrough state reached the generator"));
    }
    let class = key
        .class()
        .ok_or_else(|| {
            generation_error("geometry", format!("bad primitive class {}", key.primitive_class))
        })?;

    let stereo = key.flags & GS_FLAG_STEREO != 0;
    let wireframe = key.flags & GS_FLAG_WIREFRAME != 0;
    let layers = if stereo { 2 } else { 1 };

    let (input, in_vertices) = match class {
        PrimitiveClass::Points => ("points", 1),
        PrimitiveClass::Lines => ("lines", 2),
        PrimitiveClass::Triangles => ("triangles", 3),
    };
    // Points become quads, everything else is re-emitted (closed for wireframe)
    let (output, per_prim) = match class {
        PrimitiveClass::Points => ("triangle_strip", 4),
        _ if wireframe => ("line_strip", in_vertices + 1),
        PrimitiveClass::Lines => ("triangle_strip", 4),
        PrimitiveClass::Triangles => ("triangle_strip", 3),
    };

    let mut src = String::new();
    let _ = writeln!(src, "#version 450");
    let _ = writeln!(src, "// geometry {} stereo={} wireframe={}", input, stereo, wireframe);
    let _ = writeln!(src, "layout({input}) in;");
    let _ = writeln!(src, "layout({output}, max_vertices = {}) out;", per_prim * layers);
    let _ = writeln!(
        src,
        "layout(std140, binding = 2) uniform GeometryState {{ vec4 line_point; vec4 stereo_offset; }};"
    );
    for i in (1..32).filter(|i| key.output_mask & (1 << i) != 0) {
        let _ = writeln!(src, "layout(location = {i}) in vec4 gs_in_{i}[];");
        let _ = writeln!(src, "layout(location = {i}) out vec4 gs_out_{i};");
    }

    let _ = writeln!(src, "\nvoid emit(int i, vec4 offset, int layer)\n{{");
    let _ = writeln!(src, "    gl_Position = gl_in[i].gl_Position + offset;");
    let _ = writeln!(src, "    gl_Layer = layer;");
    for i in (1..32).filter(|i| key.output_mask & (1 << i) != 0) {
        let _ = writeln!(src, "    gs_out_{i} = gs_in_{i}[i];");
    }
    let _ = writeln!(src, "    EmitVertex();\n}}");

    let _ = writeln!(src, "\nvoid main()\n{{");
    let _ = writeln!(src, "    for (int layer = 0; layer < {layers}; ++layer) {{");
    let _ = writeln!(src, "        vec4 eye = stereo_offset * float(layer);");
    match (class, wireframe) {
        (PrimitiveClass::Points, _) => {
            let _ = writeln!(src, "        vec2 size = line_point.zw * gl_in[0].gl_Position.w;");
            let corners = [
                "-size.x, -size.y",
                "size.x, -size.y",
                "-size.x, size.y",
                "size.x, size.y",
            ];
            for corner in corners {
                let _ = writeln!(src, "        emit(0, eye + vec4({corner}, 0.0, 0.0), layer);");
            }
        }
        (_, true) => {
            let _ = writeln!(
                src,
                "        for (int i = 0; i < {in_vertices}; ++i) {{ emit(i, eye, layer); }}"
            );
            let _ = writeln!(src, "        emit(0, eye, layer);");
        }
        (PrimitiveClass::Lines, false) => {
            let _ = writeln!(
                src,
                "        vec2 dir = normalize(gl_in[1].gl_Position.xy - gl_in[0].gl_Position.xy);"
            );
            let _ = writeln!(
                src,
                "        vec4 side = vec4(-dir.y, dir.x, 0.0, 0.0) * line_point.x;"
            );
            let _ = writeln!(src, "        emit(0, eye - side, layer);");
            let _ = writeln!(src, "        emit(0, eye + side, layer);");
            let _ = writeln!(src, "        emit(1, eye - side, layer);");
            let _ = writeln!(src, "        emit(1, eye + side, layer);");
        }
        (PrimitiveClass::Triangles, false) => {
            let _ = writeln!(src, "        for (int i = 0; i < 3; ++i) {{ emit(i, eye, layer); }}");
        }
    }
    let _ = writeln!(src, "        EndPrimitive();\n    }}\n}}");
    Ok(src)
}

// ============================================================================
// Stages
// ============================================================================

/// Vertex stage (separate-stage backends)
#[derive(Debug, Clone, Copy, Default)]
pub struct VertexStage;

impl ShaderStageDesc for VertexStage {
    type State = PipelineState;
    type Key = VertexShaderKey;

    fn stage(&self) -> ShaderStage {
        ShaderStage::VERTEX
    }

    fn name(&self) -> &'static str {
        "vertex"
    }

    fn generator_version(&self) -> u32 {
        SHADER_GEN_VERSION
    }

    fn derive_key(&self, state: &PipelineState) -> VertexShaderKey {
        vertex_key(state)
    }

    fn generate_source(&self, key: &VertexShaderKey) -> Result<String, ShaderCacheError> {
        generate_vertex(key)
    }

    fn compile_flags(&self) -> CompileFlags {
        CompileFlags::SKIP_VALIDATION
            | CompileFlags::OPTIMIZE
            | CompileFlags::BACKWARDS_COMPATIBILITY
    }
}

/// Fragment stage (separate-stage backends)
#[derive(Debug, Clone, Copy, Default)]
pub struct FragmentStage;

impl ShaderStageDesc for FragmentStage {
    type State = PipelineState;
    type Key = FragmentShaderKey;

    fn stage(&self) -> ShaderStage {
        ShaderStage::FRAGMENT
    }

    fn name(&self) -> &'static str {
        "fragment"
    }

    fn generator_version(&self) -> u32 {
        SHADER_GEN_VERSION
    }

    fn derive_key(&self, state: &PipelineState) -> FragmentShaderKey {
        fragment_key(state)
    }

    fn generate_source(&self, key: &FragmentShaderKey) -> Result<String, ShaderCacheError> {
        generate_fragment(key)
    }
}

/// Geometry stage; an identity for plain triangle rendering
#[derive(Debug, Clone, Copy, Default)]
pub struct GeometryStage;

impl ShaderStageDesc for GeometryStage {
    type State = PipelineState;
    type Key = GeometryShaderKey;

    fn stage(&self) -> ShaderStage {
        ShaderStage::GEOMETRY
    }

    fn name(&self) -> &'static str {
        "geometry"
    }

    fn generator_version(&self) -> u32 {
        SHADER_GEN_VERSION
    }

    fn derive_key(&self, state: &PipelineState) -> GeometryShaderKey {
        geometry_key(state)
    }

    fn is_passthrough(&self, state: &PipelineState) -> bool {
        geometry_passthrough(state)
    }

    fn generate_source(&self, key: &GeometryShaderKey) -> Result<String, ShaderCacheError> {
        generate_geometry(key)
    }
}

/// Whole linked program (backends that link vertex + fragment + geometry)
#[derive(Debug, Clone, Copy, Default)]
pub struct ProgramStage;

impl ShaderStageDesc for ProgramStage {
    type State = PipelineState;
    type Key = ProgramKey;

    fn stage(&self) -> ShaderStage {
        ShaderStage::PROGRAM
    }

    fn name(&self) -> &'static str {
        "program"
    }

    fn generator_version(&self) -> u32 {
        SHADER_GEN_VERSION
    }

    fn derive_key(&self, state: &PipelineState) -> ProgramKey {
        let geometry_enabled = !geometry_passthrough(state);
        ProgramKey {
            vertex: vertex_key(state),
            fragment: fragment_key(state),
            geometry: if geometry_enabled {
                geometry_key(state)
            } else {
                GeometryShaderKey::default()
            },
            geometry_enabled: geometry_enabled as u32,
            reserved: 0,
        }
    }

    fn generate_source(&self, key: &ProgramKey) -> Result<String, ShaderCacheError> {
        let mut src = String::from("// ---- vertex ----\n");
        src.push_str(&generate_vertex(&key.vertex)?);
        src.push_str("// ---- fragment ----\n");
        src.push_str(&generate_fragment(&key.fragment)?);
        if key.geometry_enabled != 0 {
            src.push_str("// ---- geometry ----\n");
            src.push_str(&generate_geometry(&key.geometry)?);
        }
        Ok(src)
    }
}
