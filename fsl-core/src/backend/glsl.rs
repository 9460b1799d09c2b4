//! Vulkan GLSL (`#version 450`): descriptor sets, separate textures and samplers,
//! stage plumbing through `in`/`out` globals.

use super::*;
use crate::ast::{ResourceKind, SystemValue, TextureDim};
use crate::lowering::{Passing, VaryingBinding};
use crate::resolver::check_limits;
use std::fmt::Write;

pub struct GlslGenerator {
    options: GeneratorOptions,
}

impl GlslGenerator {
    pub fn new(options: GeneratorOptions) -> Self {
        GlslGenerator { options }
    }
}

struct Glsl {
    strategy: NonUniformStrategy,
}

const RESERVED: &[&str] = &[
    "input", "output", "filter", "sample", "common", "partition", "active", "smooth", "flat", "patch", "buffer",
    "shared", "texture", "sampler", "image", "main", "resource",
];

fn vector_prefix(scalar: ScalarKind) -> &'static str {
    match scalar {
        ScalarKind::Float | ScalarKind::Half => "",
        ScalarKind::Int | ScalarKind::AtomicInt => "i",
        ScalarKind::Uint | ScalarKind::AtomicUint => "u",
        ScalarKind::Bool => "b",
    }
}

fn scalar_name(scalar: ScalarKind) -> &'static str {
    match scalar {
        ScalarKind::Float | ScalarKind::Half => "float",
        ScalarKind::Int | ScalarKind::AtomicInt => "int",
        ScalarKind::Uint | ScalarKind::AtomicUint => "uint",
        ScalarKind::Bool => "bool",
    }
}

fn dim_suffix(dim: TextureDim) -> &'static str {
    match dim {
        TextureDim::Tex1D => "1D",
        TextureDim::Tex2D => "2D",
        TextureDim::Tex2DArray => "2DArray",
        TextureDim::Tex2DMS => "2DMS",
        TextureDim::Tex3D => "3D",
        TextureDim::TexCube => "Cube",
    }
}

fn elem_prefix(elem: &DataType) -> &'static str {
    match elem.scalar() {
        Some(ScalarKind::Int | ScalarKind::AtomicInt) => "i",
        Some(ScalarKind::Uint | ScalarKind::AtomicUint) => "u",
        _ => "",
    }
}

fn image_format(elem: &DataType) -> Option<&'static str> {
    let base = match elem.scalar()? {
        ScalarKind::Float | ScalarKind::Half => "f",
        ScalarKind::Int | ScalarKind::AtomicInt => "i",
        ScalarKind::Uint | ScalarKind::AtomicUint => "ui",
        ScalarKind::Bool => return None,
    };
    let channels = match elem.components() {
        1 => "r32",
        2 => "rg32",
        4 => "rgba32",
        _ => return None,
    };
    Some(match (channels, base) {
        ("r32", "f") => "r32f",
        ("rg32", "f") => "rg32f",
        ("rgba32", "f") => "rgba32f",
        ("r32", "i") => "r32i",
        ("rg32", "i") => "rg32i",
        ("rgba32", "i") => "rgba32i",
        ("r32", _) => "r32ui",
        ("rg32", _) => "rg32ui",
        _ => "rgba32ui",
    })
}

fn is_integer(ty: &DataType) -> bool {
    matches!(
        ty.scalar(),
        Some(ScalarKind::Int | ScalarKind::Uint | ScalarKind::AtomicInt | ScalarKind::AtomicUint | ScalarKind::Bool)
    )
}

fn builtin_input(sv: SystemValue) -> &'static str {
    match sv {
        SystemValue::Position => "gl_FragCoord",
        SystemValue::VertexId => "gl_VertexIndex",
        SystemValue::InstanceId => "gl_InstanceIndex",
        SystemValue::PrimitiveId => "gl_PrimitiveID",
        SystemValue::IsFrontFace => "gl_FrontFacing",
        SystemValue::ViewId => "gl_ViewIndex",
        SystemValue::DispatchThreadId => "gl_GlobalInvocationID",
        SystemValue::GroupThreadId => "gl_LocalInvocationID",
        SystemValue::GroupId => "gl_WorkGroupID",
        SystemValue::GroupIndex => "gl_LocalInvocationIndex",
        SystemValue::Target(_) | SystemValue::Depth => "",
    }
}

fn output_name(varying: &StageVarying) -> String {
    match (&varying.field, varying.binding) {
        (Some(field), _) => format!("_out_{}", field),
        (None, VaryingBinding::System(SystemValue::Target(n))) => format!("_out_target{}", n),
        (None, _) => "_out_value".to_string(),
    }
}

impl Glsl {
    fn rename(&self, name: &str) -> String {
        self.identifier(name).unwrap_or_else(|| name.to_string())
    }

    fn sampler_type(&self, call: &CallSite<'_>, shadow: bool) -> Result<&'static str> {
        let res = call.expect_resource(0)?;
        let ResourceKind::Texture { dim, elem } = &res.kind else {
            return Err(err_semantic!(&call.unit.name, "'{}' at {} samples a non-texture", call.name, call.loc));
        };
        Ok(match (dim, shadow, elem_prefix(elem)) {
            (TextureDim::Tex2DMS, _, _) => return Err(call.unsupported("multisampled textures cannot be sampled")),
            (TextureDim::Tex2D, true, _) => "sampler2DShadow",
            (TextureDim::Tex2DArray, true, _) => "sampler2DArrayShadow",
            (TextureDim::TexCube, true, _) => "samplerCubeShadow",
            (_, true, _) => return Err(call.unsupported("comparison sampling needs a 2D, 2D array or cube texture")),
            (TextureDim::Tex1D, _, "i") => "isampler1D",
            (TextureDim::Tex1D, _, "u") => "usampler1D",
            (TextureDim::Tex1D, _, _) => "sampler1D",
            (TextureDim::Tex2D, _, "i") => "isampler2D",
            (TextureDim::Tex2D, _, "u") => "usampler2D",
            (TextureDim::Tex2D, _, _) => "sampler2D",
            (TextureDim::Tex2DArray, _, "i") => "isampler2DArray",
            (TextureDim::Tex2DArray, _, "u") => "usampler2DArray",
            (TextureDim::Tex2DArray, _, _) => "sampler2DArray",
            (TextureDim::Tex3D, _, "i") => "isampler3D",
            (TextureDim::Tex3D, _, "u") => "usampler3D",
            (TextureDim::Tex3D, _, _) => "sampler3D",
            (TextureDim::TexCube, _, "i") => "isamplerCube",
            (TextureDim::TexCube, _, "u") => "usamplerCube",
            (TextureDim::TexCube, _, _) => "samplerCube",
        })
    }
}

impl Dialect for Glsl {
    fn target(&self) -> Target {
        Target::Vulkan
    }

    fn type_name(&self, ty: &DataType) -> String {
        match ty {
            DataType::Void => "void".into(),
            DataType::Scalar(s) => scalar_name(*s).into(),
            DataType::Vector(s, n) => format!("{}vec{}", vector_prefix(*s), n),
            DataType::Matrix { columns, rows, .. } if columns == rows => format!("mat{}", columns),
            DataType::Matrix { columns, rows, .. } => format!("mat{}x{}", columns, rows),
            DataType::Struct(name) => name.clone(),
        }
    }

    fn strategy(&self) -> NonUniformStrategy {
        self.strategy
    }

    fn identifier(&self, word: &str) -> Option<String> {
        match word {
            "groupshared" => Some("shared".into()),
            w if RESERVED.contains(&w) => Some(format!("{}_", w)),
            _ => None,
        }
    }

    fn float_literal(&self, text: &str) -> String {
        text.trim_end_matches(['h', 'H']).to_string()
    }

    fn nonuniform_index(&self, index: &str) -> String {
        match self.strategy {
            NonUniformStrategy::Qualifier => format!("nonuniformEXT({})", index),
            _ => index.to_string(),
        }
    }

    fn intrinsic(&self, call: &CallSite<'_>) -> Result<String> {
        let a = &call.args;
        Ok(match call.intrinsic {
            Intrinsic::Sample => format!("texture({}({}, {}), {})", self.sampler_type(call, false)?, a[0], a[1], a[2]),
            Intrinsic::SampleLvl => format!(
                "textureLod({}({}, {}), {}, {})",
                self.sampler_type(call, false)?,
                a[0],
                a[1],
                a[2],
                a[3]
            ),
            Intrinsic::SampleCmp => {
                let sampler = self.sampler_type(call, true)?;
                let coord = if sampler == "sampler2DShadow" { "vec3" } else { "vec4" };
                format!("texture({}({}, {}), {}({}, {}))", sampler, a[0], a[1], coord, a[2], a[3])
            }
            Intrinsic::LoadRw | Intrinsic::StoreRw => {
                let res = call.expect_resource(0)?;
                match &res.kind {
                    ResourceKind::RwBuffer { .. } if call.intrinsic == Intrinsic::LoadRw => format!("{}[{}]", a[0], a[1]),
                    ResourceKind::RwBuffer { .. } => format!("{}[{}] = {}", a[0], a[1], a[2]),
                    ResourceKind::RwTexture { dim, elem } => {
                        let coord = match dim.texel_coord_components() {
                            1 => format!("int({})", a[1]),
                            n => format!("ivec{}({})", n, a[1]),
                        };
                        let comps = elem.components();
                        if call.intrinsic == Intrinsic::LoadRw {
                            let swizzle = match comps {
                                1 => ".x",
                                2 => ".xy",
                                3 => ".xyz",
                                _ => "",
                            };
                            format!("imageLoad({}, {}){}", a[0], coord, swizzle)
                        } else {
                            let scalar = elem.scalar().unwrap_or(ScalarKind::Float);
                            let pad = match comps {
                                1 => "",
                                2 => ", 0, 0",
                                3 => ", 0",
                                _ => "",
                            };
                            format!("imageStore({}, {}, {}vec4({}{}))", a[0], coord, vector_prefix(scalar), a[2], pad)
                        }
                    }
                    _ => {
                        return Err(err_semantic!(
                            &call.unit.name,
                            "'{}' at {} needs a read-write resource",
                            call.name,
                            call.loc
                        ))
                    }
                }
            }
            Intrinsic::Atomic(AtomicOp::Load) => format!(
                "{} = atomicLoad({}, gl_ScopeDevice, gl_StorageSemanticsBuffer, gl_SemanticsRelaxed)",
                a[1], a[0]
            ),
            Intrinsic::Atomic(AtomicOp::Store) => format!(
                "atomicStore({}, {}, gl_ScopeDevice, gl_StorageSemanticsBuffer, gl_SemanticsRelaxed)",
                a[0], a[1]
            ),
            Intrinsic::Atomic(AtomicOp::CompareExchange) => {
                format!("{} = atomicCompSwap({}, {}, {})", a[3], a[0], a[1], a[2])
            }
            Intrinsic::Atomic(op) => match a.get(2) {
                Some(original) => format!("{} = atomic{}({}, {})", original, op.verb(), a[0], a[1]),
                None => format!("atomic{}({}, {})", op.verb(), a[0], a[1]),
            },
            _ => format!("{}({})", call.name, a.join(", ")),
        })
    }

    fn init_main(&self, unit: &LoweredUnit) -> Result<Vec<Piece>> {
        let mut lines = Vec::new();
        let Some(prologue) = unit.entry.convention.prologue.as_ref() else {
            return Ok(lines);
        };
        if let Some((param, struct_name)) = &prologue.struct_param {
            let param = self.rename(param);
            lines.push(Piece::Line(format!("{} {};", struct_name, param)));
            for input in &prologue.inputs {
                let Some(field) = &input.field else { continue };
                let value = match input.binding {
                    VaryingBinding::Location(_) => format!("_in_{}", field),
                    VaryingBinding::System(sv) => format!("{}({})", self.type_name(&input.ty), builtin_input(sv)),
                };
                lines.push(Piece::Line(format!("{}.{} = {};", param, field, value)));
            }
        }
        for sv_param in &prologue.system_values {
            if let Some(sv) = sv_param.system_value {
                let ty = self.type_name(&sv_param.ty);
                lines.push(Piece::Line(format!(
                    "{} {} = {}({});",
                    ty,
                    self.rename(&sv_param.name),
                    ty,
                    builtin_input(sv)
                )));
            }
        }
        Ok(lines)
    }

    fn return_value(&self, unit: &LoweredUnit, value: Option<&str>) -> Result<Vec<Piece>> {
        let Some(value) = value else {
            return Ok(vec![Piece::Line("return;".into())]);
        };
        let conv = &unit.entry.convention;
        let outputs = conv.epilogue.as_ref().map(|e| e.outputs.as_slice()).unwrap_or_default();
        let mut pieces = vec![Piece::LBrace];
        let source = if matches!(conv.return_type, DataType::Struct(_)) {
            pieces.push(Piece::Line(format!("{} _ret = {};", self.type_name(&conv.return_type), value)));
            None
        } else {
            Some(value)
        };
        for output in outputs {
            let from = match (&output.field, source) {
                (Some(field), _) => format!("_ret.{}", field),
                (None, Some(v)) => v.to_string(),
                (None, None) => continue,
            };
            let to = match output.binding {
                VaryingBinding::System(SystemValue::Position) => "gl_Position".to_string(),
                VaryingBinding::System(SystemValue::Depth) => "gl_FragDepth".to_string(),
                _ => output_name(output),
            };
            pieces.push(Piece::Line(format!("{} = {};", to, from)));
        }
        pieces.push(Piece::Line("return;".into()));
        pieces.push(Piece::RBrace);
        Ok(pieces)
    }
}

impl Generator for GlslGenerator {
    fn target(&self) -> Target {
        Target::Vulkan
    }

    fn generate(&self, unit: &LoweredUnit) -> Result<GeneratedShader> {
        let strategy = if self.options.descriptor_indexing {
            NonUniformStrategy::Qualifier
        } else {
            NonUniformStrategy::Scan
        };
        let dialect = Glsl { strategy };
        let mut metadata = ShaderMetadata::new(unit, "main", BindingModel::DescriptorSets, strategy);
        let calls = called_names(unit);
        let conv = &unit.entry.convention;

        let mut out = String::from("#version 450\n");
        out.push_str(&header_comment(unit));
        let mut extensions = BTreeSet::new();
        if strategy == NonUniformStrategy::Qualifier && calls.contains("NonUniformResourceIndex") {
            extensions.insert("GL_EXT_nonuniform_qualifier");
        }
        if calls.contains("AtomicLoad") || calls.contains("AtomicStore") {
            extensions.insert("GL_KHR_memory_scope_semantics");
        }
        if calls.iter().any(|c| c.starts_with("Wave")) {
            extensions.extend([
                "GL_KHR_shader_subgroup_basic",
                "GL_KHR_shader_subgroup_vote",
                "GL_KHR_shader_subgroup_arithmetic",
                "GL_KHR_shader_subgroup_ballot",
            ]);
        }
        let uses_view_id = conv.prologue.as_ref().is_some_and(|p| {
            p.inputs.iter().any(|i| i.binding == VaryingBinding::System(SystemValue::ViewId))
                || p.system_values.iter().any(|s| s.system_value == Some(SystemValue::ViewId))
        });
        if uses_view_id {
            extensions.insert("GL_EXT_multiview");
        }
        for ext in &extensions {
            writeln!(out, "#extension {} : require", ext)?;
        }
        if let Some([x, y, z]) = unit.num_threads {
            writeln!(out, "layout(local_size_x = {}, local_size_y = {}, local_size_z = {}) in;", x, y, z)?;
        }

        for def in &unit.structs {
            writeln!(out)?;
            writeln!(out, "struct {}", def.name)?;
            writeln!(out, "{{")?;
            for field in &def.fields {
                writeln!(
                    out,
                    "    {} {}{};",
                    dialect.type_name(&field.ty),
                    field.name,
                    array_suffix(field.array_len)
                )?;
            }
            writeln!(out, "}};")?;
        }

        if let Some(table) = &unit.table {
            check_limits(table, Target::Vulkan, self.options.descriptor_indexing)?;
            for set in &table.sets {
                writeln!(out)?;
                writeln!(out, "// {} (set {})", set.frequency, set.frequency.index())?;
                for res in &set.resources {
                    let slot = format!("set = {}, binding = {}", set.frequency.index(), res.index);
                    writeln!(out, "{}", declare_resource(&dialect, unit, res, &slot)?)?;
                    metadata.bindings.push(BindingInfo {
                        name: res.name.clone(),
                        kind: res.kind.label(),
                        frequency: set.frequency,
                        index: res.index,
                        array_len: res.array_len,
                        slot,
                    });
                }
            }
        }

        // Stage interface.
        let mut interface = Vec::new();
        if let Some(prologue) = &conv.prologue {
            for input in &prologue.inputs {
                if let (VaryingBinding::Location(n), Some(field)) = (input.binding, &input.field) {
                    let flat = if unit.stage == Stage::Pixel && is_integer(&input.ty) { "flat " } else { "" };
                    interface.push(format!(
                        "layout(location = {}) {}in {} _in_{}{};",
                        n,
                        flat,
                        dialect.type_name(&input.ty),
                        field,
                        array_suffix(input.array_len)
                    ));
                }
            }
        }
        if let Some(epilogue) = &conv.epilogue {
            for output in &epilogue.outputs {
                let location = match output.binding {
                    VaryingBinding::Location(n) => n,
                    VaryingBinding::System(SystemValue::Target(n)) => u32::from(n),
                    VaryingBinding::System(_) => continue,
                };
                let flat = if unit.stage == Stage::Vertex && is_integer(&output.ty) { "flat " } else { "" };
                interface.push(format!(
                    "layout(location = {}) {}out {} {}{};",
                    location,
                    flat,
                    dialect.type_name(&output.ty),
                    output_name(output),
                    array_suffix(output.array_len)
                ));
            }
        }
        if !interface.is_empty() {
            writeln!(out)?;
            for line in interface {
                writeln!(out, "{}", line)?;
            }
        }

        if !unit.globals.is_empty() {
            writeln!(out)?;
        }
        for global in &unit.globals {
            let (qualifiers, rest) = split_qualifiers(&global.frags);
            let mut text = String::new();
            for q in qualifiers {
                match q {
                    "const" => text.push_str("const "),
                    "groupshared" => text.push_str("shared "),
                    _ => {}
                }
            }
            text.push_str(&BodyWriter::new(&dialect, unit, Scope::Helper).expression(rest)?);
            writeln!(out, "{};", text)?;
        }

        for helper in &unit.helpers {
            let conv = &helper.convention;
            let params: Vec<String> = conv
                .params
                .iter()
                .map(|p| {
                    let qualifier = match p.passing {
                        Passing::Value => "",
                        Passing::Out => "out ",
                        Passing::InOut => "inout ",
                    };
                    format!(
                        "{}{} {}{}",
                        qualifier,
                        dialect.type_name(&p.ty),
                        dialect.rename(&p.name),
                        array_suffix(p.array_len)
                    )
                })
                .collect();
            writeln!(out)?;
            writeln!(out, "{} {}({})", dialect.type_name(&conv.return_type), conv.name, params.join(", "))?;
            writeln!(out, "{{")?;
            out.push_str(&BodyWriter::new(&dialect, unit, Scope::Helper).body(&helper.func.body, 1)?);
            writeln!(out, "}}")?;
        }

        writeln!(out)?;
        writeln!(out, "void main()")?;
        writeln!(out, "{{")?;
        out.push_str(&BodyWriter::new(&dialect, unit, Scope::Entry).body(&unit.entry.func.body, 1)?);
        writeln!(out, "}}")?;

        Ok(GeneratedShader { source: out, metadata })
    }
}

fn declare_resource(dialect: &Glsl, unit: &LoweredUnit, res: &ResolvedResource, slot: &str) -> Result<String> {
    let array = if res.array_len > 1 {
        format!("[{}]", res.array_len)
    } else {
        String::new()
    };
    let no_arrays = |what: &str| -> Result<()> {
        if res.array_len > 1 {
            bail_unsupported!(
                unit.target,
                what,
                "'{}' is an array of buffers, which Vulkan GLSL cannot bind as one declaration",
                res.name
            );
        }
        Ok(())
    };
    Ok(match &res.kind {
        ResourceKind::Sampler { comparison } => format!(
            "layout({}) uniform {} {}{};",
            slot,
            if *comparison { "samplerShadow" } else { "sampler" },
            res.name,
            array
        ),
        ResourceKind::Texture { dim, elem } => format!(
            "layout({}) uniform {}texture{} {}{};",
            slot,
            elem_prefix(elem),
            dim_suffix(*dim),
            res.name,
            array
        ),
        ResourceKind::RwTexture { dim, elem } => {
            let Some(format) = image_format(elem) else {
                bail_unsupported!(unit.target, "DECL_RWTEXTURE", "no storage image format for '{}' elements of '{}'", elem, res.name);
            };
            format!(
                "layout({}, {}) uniform {}image{} {}{};",
                slot,
                format,
                elem_prefix(elem),
                dim_suffix(*dim),
                res.name,
                array
            )
        }
        ResourceKind::Buffer { elem } => {
            no_arrays("DECL_BUFFER")?;
            format!(
                "layout({}, std430) readonly buffer {}_Block\n{{\n    {} {}[];\n}};",
                slot,
                res.name,
                dialect.type_name(elem),
                res.name
            )
        }
        ResourceKind::RwBuffer { elem } => {
            no_arrays("DECL_RWBUFFER")?;
            format!(
                "layout({}, std430) buffer {}_Block\n{{\n    {} {}[];\n}};",
                slot,
                res.name,
                dialect.type_name(elem),
                res.name
            )
        }
        ResourceKind::ConstantBuffer { elem } => {
            no_arrays("DECL_CBUFFER")?;
            format!(
                "layout({}, std140) uniform {}_Block\n{{\n    {} {};\n}};",
                slot,
                res.name,
                dialect.type_name(elem),
                res.name
            )
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::test_support::*;

    fn glsl(source: &str, descriptor_indexing: bool) -> Result<GeneratedShader> {
        let unit = lower_source(source, Target::Vulkan)?;
        let options = GeneratorOptions {
            descriptor_indexing,
            ..GeneratorOptions::default()
        };
        generate(&unit, &options)
    }

    #[test]
    fn test_vertex_shader() {
        let shader = glsl(&format!("{}{}", TABLE, VERTEX), true).unwrap();
        let src = &shader.source;
        assert!(src.starts_with("#version 450\n"));
        assert!(src.contains("layout(set = 0, binding = 0) uniform texture2D uTextures[4];"), "{}", src);
        assert!(src.contains("layout(set = 0, binding = 6) uniform samplerShadow uShadowSampler;"), "{}", src);
        assert!(src.contains("layout(set = 1, binding = 0, std140) uniform camera_Block"), "{}", src);
        assert!(src.contains("layout(set = 1, binding = 1, std430) buffer counters_Block"), "{}", src);
        assert!(src.contains("layout(set = 1, binding = 2, rgba32f) uniform image2D uOutput;"), "{}", src);
        assert!(src.contains("layout(location = 1) in vec2 _in_uv;"), "{}", src);
        assert!(src.contains("layout(location = 0) out vec2 _out_uv;"), "{}", src);
        assert!(src.contains("    VSInput input_;\n    input_.position = _in_position;"), "{}", src);
        assert!(src.contains("uint vid = uint(gl_VertexIndex);"), "{}", src);
        assert!(src.contains("o.position = (camera * vec4(input_.position, 1.0));"), "{}", src);
        assert!(src.contains("VSOutput _ret = o;"), "{}", src);
        assert!(src.contains("gl_Position = _ret.position;"), "{}", src);
        assert!(src.contains("_out_uv = _ret.uv;"), "{}", src);
        assert_eq!(shader.metadata.binding_model, BindingModel::DescriptorSets);
    }

    #[test]
    fn test_pixel_shader_with_descriptor_indexing() {
        let shader = glsl(&format!("{}{}", TABLE, with_flag(PIXEL, "FT_PRIM_ID")), true).unwrap();
        let src = &shader.source;
        assert!(src.contains("#extension GL_EXT_nonuniform_qualifier : require"), "{}", src);
        assert!(
            src.contains("texture(sampler2D(uTextures[nonuniformEXT(prim)], uSampler0), input_.uv)"),
            "{}",
            src
        );
        assert!(
            src.contains("texture(sampler2DShadow(uShadow, uShadowSampler), vec3(input_.uv, 0.5))"),
            "{}",
            src
        );
        assert!(src.contains("weight = clamp(weight, 0.0, 1.0);"), "{}", src);
        assert!(src.contains("return mix(c,"), "{}", src);
        assert!(src.contains("layout(location = 0) out vec4 _out_target0;"), "{}", src);
        assert!(src.contains("_out_target0 = tint(c, w) * s;"), "{}", src);
        assert!(src.contains("uint prim = uint(gl_PrimitiveID);"), "{}", src);
    }

    #[test]
    fn test_pixel_shader_scans_without_descriptor_indexing() {
        let shader = glsl(&format!("{}{}", TABLE, with_flag(PIXEL, "FT_PRIM_ID")), false).unwrap();
        let src = &shader.source;
        assert!(!src.contains("nonuniformEXT"), "{}", src);
        assert!(src.contains("    vec4 c;\n    for (uint _nu0 = 0u; _nu0 < 4u; ++_nu0)"), "{}", src);
        assert!(src.contains("if (_nu0 == uint(prim))"), "{}", src);
        assert!(src.contains("c = texture(sampler2D(uTextures[_nu0], uSampler0), input_.uv);"), "{}", src);
        assert_eq!(shader.metadata.nonuniform, NonUniformStrategy::Scan);
    }

    #[test]
    fn test_compute_shader() {
        let source = format!(
            "{}{}",
            TABLE,
            COMPUTE.replace("uint before;", "uint before;\n    uint seen;\n    AtomicLoad(counters[1], seen);")
        );
        let shader = glsl(&source, true).unwrap();
        let src = &shader.source;
        assert!(src.contains("layout(local_size_x = 8, local_size_y = 8, local_size_z = 1) in;"), "{}", src);
        assert!(src.contains("#extension GL_KHR_memory_scope_semantics : require"), "{}", src);
        assert!(src.contains("seen = atomicLoad(counters[1], gl_ScopeDevice"), "{}", src);
        assert!(src.contains("before = atomicAdd(counters[0], 1);"), "{}", src);
        assert!(src.contains("mat4 m = mat4(vec4(1, 0, 0, 0),"), "{}", src);
        assert!(src.contains("imageStore(uOutput, ivec2(id.xy), vec4(m[0] * float(before)));"), "{}", src);
        assert!(src.contains("uvec3 id = uvec3(gl_GlobalInvocationID);"), "{}", src);
    }
}
