//! Metal Shading Language. Resources are bound either directly as entry-point
//! parameters or through one argument buffer per frequency set; helpers receive
//! the resources they touch as extra parameters.

use super::*;
use crate::ast::{ResourceKind, SystemValue, TextureDim};
use crate::lowering::{visit_value_idents, Passing, VaryingBinding};
use crate::resolver::{check_limits, ResolvedTable};
use std::collections::HashMap;
use std::fmt::Write;

pub struct MslGenerator {
    options: GeneratorOptions,
}

impl MslGenerator {
    pub fn new(options: GeneratorOptions) -> Self {
        MslGenerator { options }
    }

    /// Ray tracing and indirect command buffers only exist with argument buffers.
    fn argument_buffers(&self, unit: &LoweredUnit) -> bool {
        self.options.argument_buffers || unit.flags.intersects(FeatureFlags::RAYTRACING | FeatureFlags::ICB)
    }
}

struct Msl {
    argument_buffers: bool,
}

const RESERVED: &[&str] = &[
    "vertex", "fragment", "kernel", "sampler", "texture", "constant", "device", "thread", "threadgroup", "namespace",
    "class", "template", "new", "delete", "this", "operator", "private", "public", "using", "auto", "signed",
    "unsigned", "char", "short", "long", "union", "enum", "typedef", "virtual", "friend", "explicit", "mutable",
    "volatile", "register", "goto", "sizeof", "typename", "and", "or", "not", "xor",
];

/// Where a resource type is spelled; constant buffers differ between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Place {
    ArgumentBuffer,
    Parameter,
}

fn scalar_name(scalar: ScalarKind) -> &'static str {
    match scalar {
        ScalarKind::Float => "float",
        ScalarKind::Half => "half",
        ScalarKind::Int => "int",
        ScalarKind::Uint => "uint",
        ScalarKind::Bool => "bool",
        ScalarKind::AtomicInt => "atomic_int",
        ScalarKind::AtomicUint => "atomic_uint",
    }
}

fn texel_scalar(elem: &DataType) -> &'static str {
    match elem.scalar() {
        Some(ScalarKind::Half) => "half",
        Some(ScalarKind::Int | ScalarKind::AtomicInt) => "int",
        Some(ScalarKind::Uint | ScalarKind::AtomicUint) => "uint",
        _ => "float",
    }
}

fn is_integer(ty: &DataType) -> bool {
    matches!(
        ty.scalar(),
        Some(ScalarKind::Int | ScalarKind::Uint | ScalarKind::AtomicInt | ScalarKind::AtomicUint | ScalarKind::Bool)
    )
}

fn attribute(sv: SystemValue) -> &'static str {
    match sv {
        SystemValue::Position => "position",
        SystemValue::VertexId => "vertex_id",
        SystemValue::InstanceId => "instance_id",
        SystemValue::PrimitiveId => "primitive_id",
        SystemValue::IsFrontFace => "front_facing",
        SystemValue::ViewId => "amplification_id",
        SystemValue::DispatchThreadId => "thread_position_in_grid",
        SystemValue::GroupThreadId => "thread_position_in_threadgroup",
        SystemValue::GroupId => "threadgroup_position_in_grid",
        SystemValue::GroupIndex => "thread_index_in_threadgroup",
        SystemValue::Depth => "depth(any)",
        SystemValue::Target(_) => "color",
    }
}

fn stage_keyword(stage: Stage) -> &'static str {
    match stage {
        Stage::Vertex => "vertex",
        Stage::Pixel => "fragment",
        Stage::Compute => "kernel",
    }
}

fn output_field(varying: &StageVarying) -> String {
    match (&varying.field, varying.binding) {
        (Some(field), _) => field.clone(),
        (None, VaryingBinding::System(SystemValue::Target(n))) => format!("target{}", n),
        (None, _) => "value".to_string(),
    }
}

/// Stage-in struct fields: located varyings, plus the fragment position.
fn stage_in_fields(unit: &LoweredUnit) -> Vec<&StageVarying> {
    let Some(prologue) = &unit.entry.convention.prologue else {
        return Vec::new();
    };
    prologue
        .inputs
        .iter()
        .filter(|i| match i.binding {
            VaryingBinding::Location(_) => true,
            VaryingBinding::System(SystemValue::Position) => unit.stage == Stage::Pixel,
            VaryingBinding::System(_) => false,
        })
        .collect()
}

/// System values delivered through the input struct become separate entry parameters.
fn struct_system_param(param: &str, field: &str) -> String {
    format!("_sv_{}_{}", param, field)
}

impl Msl {
    fn rename(&self, name: &str) -> String {
        self.identifier(name).unwrap_or_else(|| name.to_string())
    }

    fn texture_type(&self, unit: &LoweredUnit, res: &ResolvedResource) -> Result<String> {
        let (dim, elem, write) = match &res.kind {
            ResourceKind::Texture { dim, elem } => (*dim, elem, false),
            ResourceKind::RwTexture { dim, elem } => (*dim, elem, true),
            _ => return Ok(String::new()),
        };
        if unit.compare_textures.contains(&res.name) {
            let depth = match dim {
                TextureDim::Tex2D => "depth2d",
                TextureDim::Tex2DArray => "depth2d_array",
                TextureDim::TexCube => "depthcube",
                _ => bail_unsupported!(
                    unit.target,
                    "SampleCmp",
                    "'{}' is compared but only 2D, 2D array and cube depth textures exist",
                    res.name
                ),
            };
            return Ok(format!("{}<float>", depth));
        }
        let base = match dim {
            TextureDim::Tex1D => "texture1d",
            TextureDim::Tex2D => "texture2d",
            TextureDim::Tex2DArray => "texture2d_array",
            TextureDim::Tex2DMS => "texture2d_ms",
            TextureDim::Tex3D => "texture3d",
            TextureDim::TexCube => "texturecube",
        };
        Ok(if write {
            format!("{}<{}, access::read_write>", base, texel_scalar(elem))
        } else {
            format!("{}<{}>", base, texel_scalar(elem))
        })
    }

    fn resource_type(&self, unit: &LoweredUnit, res: &ResolvedResource, place: Place) -> Result<String> {
        let single = match &res.kind {
            ResourceKind::Sampler { .. } => "sampler".to_string(),
            ResourceKind::Texture { .. } | ResourceKind::RwTexture { .. } => self.texture_type(unit, res)?,
            ResourceKind::Buffer { elem } => format!("const device {}*", self.type_name(elem)),
            ResourceKind::RwBuffer { elem } => format!("device {}*", self.type_name(elem)),
            ResourceKind::ConstantBuffer { elem } if place == Place::ArgumentBuffer => {
                format!("constant {}*", self.type_name(elem))
            }
            ResourceKind::ConstantBuffer { elem } => format!("constant {}&", self.type_name(elem)),
        };
        if res.array_len <= 1 {
            return Ok(single);
        }
        match res.kind {
            ResourceKind::Sampler { .. } | ResourceKind::Texture { .. } | ResourceKind::RwTexture { .. } => {
                Ok(format!("array<{}, {}>", single, res.array_len))
            }
            _ => bail_unsupported!(
                unit.target,
                res.kind.label(),
                "'{}' is an array of buffers, which Metal cannot bind as one parameter",
                res.name
            ),
        }
    }

    fn texture_call(&self, call: &CallSite<'_>, method: &str, rest: &[&String]) -> Result<String> {
        let res = call.expect_resource(0)?;
        if !matches!(res.kind, ResourceKind::Texture { .. }) {
            return Err(err_semantic!(&call.unit.name, "'{}' at {} samples a non-texture", call.name, call.loc));
        }
        let args: Vec<&str> = rest.iter().map(|s| s.as_str()).collect();
        Ok(format!("{}.{}({})", call.args[0], method, args.join(", ")))
    }
}

impl Dialect for Msl {
    fn target(&self) -> Target {
        Target::Metal
    }

    fn type_name(&self, ty: &DataType) -> String {
        match ty {
            DataType::Void => "void".into(),
            DataType::Scalar(s) => scalar_name(*s).into(),
            DataType::Vector(s, n) => format!("{}{}", scalar_name(*s), n),
            DataType::Matrix { scalar, columns, rows } => format!("{}{}x{}", scalar_name(*scalar), columns, rows),
            DataType::Struct(name) => name.clone(),
        }
    }

    fn strategy(&self) -> NonUniformStrategy {
        if self.argument_buffers {
            NonUniformStrategy::Native
        } else {
            NonUniformStrategy::Scan
        }
    }

    fn identifier(&self, word: &str) -> Option<String> {
        match word {
            "discard" => Some("discard_fragment()".into()),
            "groupshared" => Some("threadgroup".into()),
            w if RESERVED.contains(&w) => Some(format!("{}_", w)),
            _ => None,
        }
    }

    fn resource_ref(&self, resource: &ResolvedResource, frequency: Frequency, scope: Scope) -> String {
        if !self.argument_buffers || scope == Scope::Helper {
            return resource.name.clone();
        }
        let member = format!("srt_{}.{}", frequency, resource.name);
        match resource.kind {
            ResourceKind::ConstantBuffer { .. } => format!("(*{})", member),
            _ => member,
        }
    }

    fn helper_args(&self, unit: &LoweredUnit, helper: &LoweredFunction, scope: Scope) -> Vec<String> {
        let Some(table) = &unit.table else {
            return Vec::new();
        };
        helper
            .resources
            .iter()
            .filter_map(|name| table.resource(name))
            .map(|(frequency, res)| self.resource_ref(res, frequency, scope))
            .collect()
    }

    fn nonuniform_index(&self, index: &str) -> String {
        index.to_string()
    }

    fn intrinsic(&self, call: &CallSite<'_>) -> Result<String> {
        let a = &call.args;
        Ok(match call.intrinsic {
            Intrinsic::Sample => self.texture_call(call, "sample", &[&a[1], &a[2]])?,
            Intrinsic::SampleLvl => {
                let level = format!("level({})", a[3]);
                self.texture_call(call, "sample", &[&a[1], &a[2], &level])?
            }
            Intrinsic::SampleCmp => self.texture_call(call, "sample_compare", &[&a[1], &a[2], &a[3]])?,
            Intrinsic::LoadRw | Intrinsic::StoreRw => {
                let res = call.expect_resource(0)?;
                match &res.kind {
                    ResourceKind::RwBuffer { .. } if call.intrinsic == Intrinsic::LoadRw => format!("{}[{}]", a[0], a[1]),
                    ResourceKind::RwBuffer { .. } => format!("{}[{}] = {}", a[0], a[1], a[2]),
                    ResourceKind::RwTexture { dim, elem } => {
                        let coord = match dim {
                            TextureDim::Tex1D => format!("uint({})", a[1]),
                            TextureDim::Tex2D | TextureDim::Tex3D => {
                                format!("uint{}({})", dim.texel_coord_components(), a[1])
                            }
                            _ => return Err(call.unsupported("texel access needs a 1D, 2D or 3D image")),
                        };
                        let comps = elem.components();
                        if call.intrinsic == Intrinsic::LoadRw {
                            let swizzle = match comps {
                                1 => ".x",
                                2 => ".xy",
                                3 => ".xyz",
                                _ => "",
                            };
                            format!("{}.read({}){}", a[0], coord, swizzle)
                        } else {
                            let pad = match comps {
                                1 => ", 0, 0, 0",
                                2 => ", 0, 0",
                                3 => ", 0",
                                _ => "",
                            };
                            format!("{}.write({}4({}{}), {})", a[0], texel_scalar(elem), a[2], pad, coord)
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
            Intrinsic::Atomic(AtomicOp::Load) => {
                format!("{} = atomic_load_explicit(&{}, memory_order_relaxed)", a[1], a[0])
            }
            Intrinsic::Atomic(AtomicOp::Store) => {
                format!("atomic_store_explicit(&{}, {}, memory_order_relaxed)", a[0], a[1])
            }
            Intrinsic::Atomic(AtomicOp::CompareExchange) => format!(
                "{{ {o} = {c}; atomic_compare_exchange_weak_explicit(&{d}, &{o}, {v}, memory_order_relaxed, memory_order_relaxed); }}",
                o = a[3],
                c = a[1],
                d = a[0],
                v = a[2]
            ),
            Intrinsic::Atomic(op) => {
                let func = match op {
                    AtomicOp::Exchange => "atomic_exchange_explicit".to_string(),
                    _ => format!("atomic_fetch_{}_explicit", op.verb().to_ascii_lowercase()),
                };
                let call_text = format!("{}(&{}, {}, memory_order_relaxed)", func, a[0], a[1]);
                match a.get(2) {
                    Some(original) => format!("{} = {}", original, call_text),
                    None => call_text,
                }
            }
            _ => format!("{}({})", call.name, a.join(", ")),
        })
    }

    fn init_main(&self, unit: &LoweredUnit) -> Result<Vec<Piece>> {
        let mut lines = Vec::new();
        let Some(prologue) = unit.entry.convention.prologue.as_ref() else {
            return Ok(lines);
        };
        let Some((param, struct_name)) = &prologue.struct_param else {
            return Ok(lines);
        };
        let in_stage = stage_in_fields(unit);
        let renamed = self.rename(param);
        lines.push(Piece::Line(format!("{} {};", struct_name, renamed)));
        for input in &prologue.inputs {
            let Some(field) = &input.field else { continue };
            let value = if in_stage.iter().any(|i| i.field.as_ref() == Some(field)) {
                format!("_stage_in.{}", field)
            } else {
                struct_system_param(param, field)
            };
            lines.push(Piece::Line(format!("{}.{} = {};", renamed, field, value)));
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
        pieces.push(Piece::Line("_StageOut _out;".into()));
        for output in outputs {
            let from = match (&output.field, source) {
                (Some(field), _) => format!("_ret.{}", field),
                (None, Some(v)) => v.to_string(),
                (None, None) => continue,
            };
            pieces.push(Piece::Line(format!("_out.{} = {};", output_field(output), from)));
        }
        pieces.push(Piece::Line("return _out;".into()));
        pieces.push(Piece::RBrace);
        Ok(pieces)
    }
}

/// Running `[[texture(n)]]`, `[[buffer(n)]]` and `[[sampler(n)]]` slots in table order.
fn direct_slots(table: &ResolvedTable) -> HashMap<String, String> {
    let (mut textures, mut buffers, mut samplers) = (0u32, 0u32, 0u32);
    let mut slots = HashMap::new();
    for set in &table.sets {
        for res in &set.resources {
            let (class, counter) = match res.kind {
                ResourceKind::Sampler { .. } => ("sampler", &mut samplers),
                ResourceKind::Texture { .. } | ResourceKind::RwTexture { .. } => ("texture", &mut textures),
                _ => ("buffer", &mut buffers),
            };
            slots.insert(res.name.clone(), format!("{}({})", class, counter));
            *counter += res.array_len.max(1);
        }
    }
    slots
}

impl Generator for MslGenerator {
    fn target(&self) -> Target {
        Target::Metal
    }

    fn generate(&self, unit: &LoweredUnit) -> Result<GeneratedShader> {
        let argument_buffers = self.argument_buffers(unit);
        let dialect = Msl { argument_buffers };
        let binding_model = if argument_buffers {
            BindingModel::ArgumentBuffers
        } else {
            BindingModel::DirectBinding
        };
        let entry_name = format!("{}Main", stage_keyword(unit.stage));
        let mut metadata = ShaderMetadata::new(unit, &entry_name, binding_model, dialect.strategy());
        let conv = &unit.entry.convention;

        let mut out = String::new();
        out.push_str(&header_comment(unit));
        writeln!(out, "#include <metal_stdlib>")?;
        writeln!(out, "using namespace metal;")?;

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

        // Resource declarations: argument buffer structs, or direct parameters for the entry point.
        let mut resource_params = Vec::new();
        if let Some(table) = &unit.table {
            check_limits(table, Target::Metal, argument_buffers)?;
            let slots = direct_slots(table);
            for set in &table.sets {
                if argument_buffers {
                    writeln!(out)?;
                    writeln!(out, "struct Srt_{}", set.frequency)?;
                    writeln!(out, "{{")?;
                }
                for res in &set.resources {
                    let slot = if argument_buffers {
                        let ty = dialect.resource_type(unit, res, Place::ArgumentBuffer)?;
                        writeln!(out, "    {} {} [[id({})]];", ty, res.name, res.index)?;
                        format!("buffer({}), id({})", set.frequency.index(), res.index)
                    } else {
                        let slot = slots.get(&res.name).cloned().unwrap_or_default();
                        if unit.entry.resources.contains(&res.name) {
                            let ty = dialect.resource_type(unit, res, Place::Parameter)?;
                            resource_params.push(format!("{} {} [[{}]]", ty, res.name, slot));
                        }
                        slot
                    };
                    metadata.bindings.push(BindingInfo {
                        name: res.name.clone(),
                        kind: res.kind.label(),
                        frequency: set.frequency,
                        index: res.index,
                        array_len: res.array_len,
                        slot,
                    });
                }
                if argument_buffers {
                    writeln!(out, "}};")?;
                    resource_params.push(format!(
                        "constant Srt_{f}& srt_{f} [[buffer({i})]]",
                        f = set.frequency,
                        i = set.frequency.index()
                    ));
                }
            }
        }

        // Stage interface structs.
        let in_stage = stage_in_fields(unit);
        if !in_stage.is_empty() {
            writeln!(out)?;
            writeln!(out, "struct _StageIn")?;
            writeln!(out, "{{")?;
            for input in &in_stage {
                let attr = match (input.binding, unit.stage) {
                    (VaryingBinding::Location(n), Stage::Vertex) => format!("attribute({})", n),
                    (VaryingBinding::Location(n), _) if is_integer(&input.ty) => format!("user(loc{}), flat", n),
                    (VaryingBinding::Location(n), _) => format!("user(loc{})", n),
                    (VaryingBinding::System(sv), _) => attribute(sv).to_string(),
                };
                writeln!(
                    out,
                    "    {} {}{} [[{}]];",
                    dialect.type_name(&input.ty),
                    input.field.as_deref().unwrap_or("value"),
                    array_suffix(input.array_len),
                    attr
                )?;
            }
            writeln!(out, "}};")?;
        }
        let outputs = conv.epilogue.as_ref().map(|e| e.outputs.as_slice()).unwrap_or_default();
        if !outputs.is_empty() {
            writeln!(out)?;
            writeln!(out, "struct _StageOut")?;
            writeln!(out, "{{")?;
            for output in outputs {
                let attr = match output.binding {
                    VaryingBinding::Location(n) if unit.stage == Stage::Vertex && is_integer(&output.ty) => {
                        format!("user(loc{}), flat", n)
                    }
                    VaryingBinding::Location(n) => format!("user(loc{})", n),
                    VaryingBinding::System(SystemValue::Target(n)) => format!("color({})", n),
                    VaryingBinding::System(sv) => attribute(sv).to_string(),
                };
                writeln!(
                    out,
                    "    {} {}{} [[{}]];",
                    dialect.type_name(&output.ty),
                    output_field(output),
                    array_suffix(output.array_len),
                    attr
                )?;
            }
            writeln!(out, "}};")?;
        }

        // Program-scope variables: constants stay global, threadgroup memory moves into the kernel.
        let mut threadgroup = Vec::new();
        let mut constants = Vec::new();
        for global in &unit.globals {
            let (qualifiers, rest) = split_qualifiers(&global.frags);
            let text = BodyWriter::new(&dialect, unit, Scope::Helper).expression(rest)?;
            if qualifiers.contains(&"groupshared") {
                let name = rest.get(1).and_then(Fragment::ident).unwrap_or_default();
                if unit.stage != Stage::Compute {
                    bail_unsupported!(Target::Metal, "groupshared", "'{}' at {} outside a compute shader", name, global.loc);
                }
                let mut in_helper = false;
                for helper in &unit.helpers {
                    visit_value_idents(&helper.func.body, &mut |ident, _| in_helper |= ident == name);
                }
                if in_helper {
                    bail_unsupported!(
                        Target::Metal,
                        "groupshared",
                        "'{}' at {} is used by a helper; Metal threadgroup memory is declared in the kernel",
                        name,
                        global.loc
                    );
                }
                threadgroup.push(format!("threadgroup {};", text));
            } else if qualifiers.contains(&"const") {
                constants.push(format!("constant {};", text));
            } else {
                bail_unsupported!(
                    Target::Metal,
                    "global",
                    "mutable program-scope variable at {} (declare it const or groupshared)",
                    global.loc
                );
            }
        }
        if !constants.is_empty() {
            writeln!(out)?;
            for line in constants {
                writeln!(out, "{}", line)?;
            }
        }

        let table = unit.table.as_ref();
        for helper in &unit.helpers {
            let hconv = &helper.convention;
            let mut params: Vec<String> = hconv
                .params
                .iter()
                .map(|p| {
                    let ty = dialect.type_name(&p.ty);
                    let name = dialect.rename(&p.name);
                    match (p.passing, p.array_len) {
                        (Passing::Value, len) => format!("{} {}{}", ty, name, array_suffix(len)),
                        (_, Some(n)) => format!("thread {} (&{})[{}]", ty, name, n),
                        (_, None) => format!("thread {}& {}", ty, name),
                    }
                })
                .collect();
            for name in &helper.resources {
                if let Some((_, res)) = table.and_then(|t| t.resource(name)) {
                    params.push(format!("{} {}", dialect.resource_type(unit, res, Place::Parameter)?, res.name));
                }
            }
            writeln!(out)?;
            writeln!(out, "{} {}({})", dialect.type_name(&hconv.return_type), hconv.name, params.join(", "))?;
            writeln!(out, "{{")?;
            out.push_str(&BodyWriter::new(&dialect, unit, Scope::Helper).body(&helper.func.body, 1)?);
            writeln!(out, "}}")?;
        }

        let mut params = Vec::new();
        if !in_stage.is_empty() {
            params.push("_StageIn _stage_in [[stage_in]]".to_string());
        }
        if let Some(prologue) = &conv.prologue {
            if let Some((param, _)) = &prologue.struct_param {
                for input in &prologue.inputs {
                    let (Some(field), VaryingBinding::System(sv)) = (&input.field, input.binding) else {
                        continue;
                    };
                    if in_stage.iter().any(|i| i.field.as_ref() == Some(field)) {
                        continue;
                    }
                    params.push(format!(
                        "{} {} [[{}]]",
                        dialect.type_name(&input.ty),
                        struct_system_param(param, field),
                        attribute(sv)
                    ));
                }
            }
            for sv_param in &prologue.system_values {
                if let Some(sv) = sv_param.system_value {
                    params.push(format!(
                        "{} {} [[{}]]",
                        dialect.type_name(&sv_param.ty),
                        dialect.rename(&sv_param.name),
                        attribute(sv)
                    ));
                }
            }
        }
        params.extend(resource_params);
        let return_type = if outputs.is_empty() { "void" } else { "_StageOut" };

        writeln!(out)?;
        writeln!(
            out,
            "{} {} {}({})",
            stage_keyword(unit.stage),
            return_type,
            entry_name,
            params.join(", ")
        )?;
        writeln!(out, "{{")?;
        for line in threadgroup {
            writeln!(out, "    {}", line)?;
        }
        out.push_str(&BodyWriter::new(&dialect, unit, Scope::Entry).body(&unit.entry.func.body, 1)?);
        writeln!(out, "}}")?;

        Ok(GeneratedShader { source: out, metadata })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::test_support::*;

    fn msl(source: &str, argument_buffers: bool) -> Result<GeneratedShader> {
        let unit = lower_source(source, Target::Metal)?;
        let options = GeneratorOptions {
            argument_buffers,
            ..GeneratorOptions::default()
        };
        generate(&unit, &options)
    }

    #[test]
    fn test_vertex_shader_direct_binding() {
        let shader = msl(&format!("{}{}", TABLE, VERTEX), false).unwrap();
        let src = &shader.source;
        assert!(src.contains("#include <metal_stdlib>\nusing namespace metal;"), "{}", src);
        assert!(src.contains("    float3 position [[attribute(0)]];"), "{}", src);
        assert!(src.contains("    float4 position [[position]];"), "{}", src);
        assert!(src.contains("    float2 uv [[user(loc0)]];"), "{}", src);
        assert!(
            src.contains(
                "vertex _StageOut vertexMain(_StageIn _stage_in [[stage_in]], uint vid [[vertex_id]], constant float4x4& camera [[buffer(0)]])"
            ),
            "{}",
            src
        );
        assert!(src.contains("    VSInput input;\n    input.position = _stage_in.position;"), "{}", src);
        assert!(src.contains("o.position = (camera * float4(input.position, 1.0));"), "{}", src);
        assert!(src.contains("_out.uv = _ret.uv;"), "{}", src);
        assert!(src.contains("return _out;"), "{}", src);
        assert_eq!(shader.metadata.binding_model, BindingModel::DirectBinding);
        assert_eq!(shader.metadata.entry, "vertexMain");
        let camera = shader.metadata.bindings.iter().find(|b| b.name == "camera").unwrap();
        assert_eq!(camera.slot, "buffer(0)");
        let output = shader.metadata.bindings.iter().find(|b| b.name == "uOutput").unwrap();
        assert_eq!(output.slot, "texture(5)");
    }

    #[test]
    fn test_pixel_shader_scans_in_direct_mode() {
        let shader = msl(&format!("{}{}", TABLE, with_flag(PIXEL, "FT_PRIM_ID")), false).unwrap();
        let src = &shader.source;
        assert_eq!(shader.metadata.nonuniform, NonUniformStrategy::Scan);
        assert!(src.contains("depth2d<float> uShadow [[texture(4)]]"), "{}", src);
        assert!(src.contains("array<texture2d<float>, 4> uTextures [[texture(0)]]"), "{}", src);
        assert!(src.contains("uint prim [[primitive_id]]"), "{}", src);
        assert!(
            src.contains("float4 tint(float4 c, thread float& weight, array<texture2d<float>, 4> uTextures, sampler uSampler0)"),
            "{}",
            src
        );
        assert!(src.contains("    float4 c;\n    for (uint _nu0 = 0u; _nu0 < 4u; ++_nu0)"), "{}", src);
        assert!(src.contains("c = uTextures[_nu0].sample(uSampler0, input.uv);"), "{}", src);
        assert!(src.contains("uShadow.sample_compare(uShadowSampler, input.uv, 0.5)"), "{}", src);
        assert!(src.contains("    float4 position [[position]];"), "{}", src);
        assert!(src.contains("    float4 target0 [[color(0)]];"), "{}", src);
        assert!(src.contains("_out.target0 = tint(c, w, uTextures, uSampler0) * s;"), "{}", src);
    }

    #[test]
    fn test_raytracing_promotes_to_argument_buffers() {
        let shader = msl(&format!("{}{}", TABLE, with_flag(PIXEL, "FT_PRIM_ID FT_RAYTRACING")), false).unwrap();
        let src = &shader.source;
        assert_eq!(shader.metadata.binding_model, BindingModel::ArgumentBuffers);
        assert_eq!(shader.metadata.nonuniform, NonUniformStrategy::Native);
        assert!(src.contains("struct Srt_Persistent\n{"), "{}", src);
        assert!(src.contains("    array<texture2d<float>, 4> uTextures [[id(0)]];"), "{}", src);
        assert!(src.contains("    constant float4x4* camera [[id(0)]];"), "{}", src);
        assert!(src.contains("constant Srt_Persistent& srt_Persistent [[buffer(0)]]"), "{}", src);
        assert!(src.contains("constant Srt_PerFrame& srt_PerFrame [[buffer(1)]]"), "{}", src);
        assert!(src.contains("srt_Persistent.uTextures[prim].sample(srt_Persistent.uSampler0, input.uv)"), "{}", src);
        assert!(src.contains("tint(c, w, srt_Persistent.uTextures, srt_Persistent.uSampler0)"), "{}", src);
    }

    #[test]
    fn test_compute_shader() {
        let shader = msl(&format!("{}{}", TABLE, COMPUTE), false).unwrap();
        let src = &shader.source;
        assert!(
            src.contains(
                "kernel void kernelMain(uint3 id [[thread_position_in_grid]], device atomic_uint* counters [[buffer(1)]], texture2d<float, access::read_write> uOutput [[texture(5)]])"
            ),
            "{}",
            src
        );
        assert!(
            src.contains("before = atomic_fetch_add_explicit(&counters[0], 1, memory_order_relaxed);"),
            "{}",
            src
        );
        assert!(src.contains("float4x4 m = float4x4(float4(1, 0, 0, 0),"), "{}", src);
        assert!(src.contains("uOutput.write(float4(m[0] * float(before)), uint2(id.xy));"), "{}", src);
        assert_eq!(shader.metadata.num_threads, Some([8, 8, 1]));
    }

    #[test]
    fn test_mutable_global_is_unsupported() {
        let source = format!("{}float scratch;\n{}", TABLE, VERTEX);
        let err = msl(&source, false).unwrap_err();
        assert_eq!(err.target(), Some(Target::Metal));
    }
}
