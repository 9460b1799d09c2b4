//! HLSL for Direct3D 12: register/space bindings, native entry-point semantics.

use super::*;
use crate::ast::ResourceKind;
use crate::ast::TextureDim;
use crate::lowering::{Passing, VaryingBinding};
use crate::resolver::check_limits;
use std::fmt::Write;

pub struct HlslGenerator {
    options: GeneratorOptions,
}

impl HlslGenerator {
    pub fn new(options: GeneratorOptions) -> Self {
        HlslGenerator { options }
    }
}

struct Hlsl;

fn texture_type(dim: TextureDim) -> &'static str {
    match dim {
        TextureDim::Tex1D => "Texture1D",
        TextureDim::Tex2D => "Texture2D",
        TextureDim::Tex2DArray => "Texture2DArray",
        TextureDim::Tex2DMS => "Texture2DMS",
        TextureDim::Tex3D => "Texture3D",
        TextureDim::TexCube => "TextureCube",
    }
}

fn register_class(kind: &ResourceKind) -> char {
    match kind {
        ResourceKind::Sampler { .. } => 's',
        ResourceKind::Texture { .. } | ResourceKind::Buffer { .. } => 't',
        ResourceKind::RwTexture { .. } | ResourceKind::RwBuffer { .. } => 'u',
        ResourceKind::ConstantBuffer { .. } => 'b',
    }
}

impl Dialect for Hlsl {
    fn target(&self) -> Target {
        Target::Direct3D12
    }

    fn type_name(&self, ty: &DataType) -> String {
        match ty {
            DataType::Void => "void".into(),
            DataType::Scalar(s) => s.hlsl_name().into(),
            DataType::Vector(s, n) => format!("{}{}", s.hlsl_name(), n),
            // HLSL spells rows first.
            DataType::Matrix { scalar, columns, rows } => format!("{}{}x{}", scalar.hlsl_name(), rows, columns),
            DataType::Struct(name) => name.clone(),
        }
    }

    fn strategy(&self) -> NonUniformStrategy {
        NonUniformStrategy::Qualifier
    }

    fn constructor_takes_columns(&self) -> bool {
        false
    }

    fn nonuniform_index(&self, index: &str) -> String {
        format!("NonUniformResourceIndex({})", index)
    }

    fn intrinsic(&self, call: &CallSite<'_>) -> Result<String> {
        let a = &call.args;
        Ok(match call.intrinsic {
            Intrinsic::Sample => format!("{}.Sample({}, {})", a[0], a[1], a[2]),
            Intrinsic::SampleLvl => format!("{}.SampleLevel({}, {}, {})", a[0], a[1], a[2], a[3]),
            Intrinsic::SampleCmp => format!("{}.SampleCmp({}, {}, {})", a[0], a[1], a[2], a[3]),
            Intrinsic::LoadRw | Intrinsic::StoreRw => {
                if !call.expect_resource(0)?.kind.is_read_write() {
                    return Err(err_semantic!(&call.unit.name, "'{}' at {} needs a read-write resource", call.name, call.loc));
                }
                if call.intrinsic == Intrinsic::LoadRw {
                    format!("{}[{}]", a[0], a[1])
                } else {
                    format!("{}[{}] = {}", a[0], a[1], a[2])
                }
            }
            Intrinsic::Atomic(AtomicOp::Load | AtomicOp::Store) => {
                return Err(call.unsupported(
                    "HLSL has no plain atomic load or store; use AtomicAdd with 0 or AtomicExchange",
                ))
            }
            Intrinsic::Atomic(op) => format!("Interlocked{}({})", op.verb(), a.join(", ")),
            _ => format!("{}({})", call.name, a.join(", ")),
        })
    }

    fn init_main(&self, _unit: &LoweredUnit) -> Result<Vec<Piece>> {
        // Entry parameters are the dialect parameters as written.
        Ok(Vec::new())
    }

    fn return_value(&self, _unit: &LoweredUnit, value: Option<&str>) -> Result<Vec<Piece>> {
        Ok(vec![Piece::Line(match value {
            Some(v) => format!("return {};", v),
            None => "return;".to_string(),
        })])
    }
}

impl Generator for HlslGenerator {
    fn target(&self) -> Target {
        Target::Direct3D12
    }

    fn generate(&self, unit: &LoweredUnit) -> Result<GeneratedShader> {
        let dialect = Hlsl;
        let mut metadata = ShaderMetadata::new(unit, "main", BindingModel::DescriptorTables, dialect.strategy());
        let mut out = header_comment(unit);
        if let Some(model) = &self.options.shader_model {
            writeln!(out, "// shader model {}", model)?;
        }
        writeln!(out, "#pragma pack_matrix(column_major)")?;

        for def in &unit.structs {
            writeln!(out)?;
            writeln!(out, "struct {}", def.name)?;
            writeln!(out, "{{")?;
            for field in &def.fields {
                let semantic = match field.semantic.as_ref() {
                    Some(s) => match s.system_value() {
                        Some(sv) => format!(" : {}", sv.hlsl_semantic()),
                        None => format!(" : {}", s.as_str()),
                    },
                    None => String::new(),
                };
                writeln!(
                    out,
                    "    {} {}{}{};",
                    dialect.type_name(&field.ty),
                    field.name,
                    array_suffix(field.array_len),
                    semantic
                )?;
            }
            writeln!(out, "}};")?;
        }

        if let Some(table) = &unit.table {
            check_limits(table, Target::Direct3D12, false)?;
            for set in &table.sets {
                writeln!(out)?;
                writeln!(out, "// {} (space{})", set.frequency, set.frequency.index())?;
                for res in &set.resources {
                    let slot = format!("{}{}, space{}", register_class(&res.kind), res.index, set.frequency.index());
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

        if !unit.globals.is_empty() {
            writeln!(out)?;
        }
        for global in &unit.globals {
            let text = BodyWriter::new(&dialect, unit, Scope::Helper).expression(&global.frags)?;
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
                    format!("{}{} {}{}", qualifier, dialect.type_name(&p.ty), p.name, array_suffix(p.array_len))
                })
                .collect();
            writeln!(out)?;
            writeln!(out, "{} {}({})", dialect.type_name(&conv.return_type), conv.name, params.join(", "))?;
            writeln!(out, "{{")?;
            out.push_str(&BodyWriter::new(&dialect, unit, Scope::Helper).body(&helper.func.body, 1)?);
            writeln!(out, "}}")?;
        }

        let conv = &unit.entry.convention;
        let params: Vec<String> = conv
            .params
            .iter()
            .map(|p| match p.system_value {
                Some(sv) => format!("{} {} : {}", dialect.type_name(&p.ty), p.name, sv.hlsl_semantic()),
                None => format!("{} {}", dialect.type_name(&p.ty), p.name),
            })
            .collect();
        let return_semantic = match conv.epilogue.as_ref().map(|e| e.outputs.as_slice()) {
            Some(
                [StageVarying {
                    field: None,
                    binding: VaryingBinding::System(sv),
                    ..
                }],
            ) => format!(" : {}", sv.hlsl_semantic()),
            _ => String::new(),
        };
        writeln!(out)?;
        if let Some([x, y, z]) = unit.num_threads {
            writeln!(out, "[numthreads({}, {}, {})]", x, y, z)?;
        }
        writeln!(
            out,
            "{} main({}){}",
            dialect.type_name(&conv.return_type),
            params.join(", "),
            return_semantic
        )?;
        writeln!(out, "{{")?;
        out.push_str(&BodyWriter::new(&dialect, unit, Scope::Entry).body(&unit.entry.func.body, 1)?);
        writeln!(out, "}}")?;

        Ok(GeneratedShader { source: out, metadata })
    }
}

fn declare_resource(dialect: &Hlsl, unit: &LoweredUnit, res: &ResolvedResource, slot: &str) -> Result<String> {
    let array = if res.array_len > 1 {
        format!("[{}]", res.array_len)
    } else {
        String::new()
    };
    Ok(match &res.kind {
        ResourceKind::Sampler { comparison: false } => format!("SamplerState {}{} : register({});", res.name, array, slot),
        ResourceKind::Sampler { comparison: true } => {
            format!("SamplerComparisonState {}{} : register({});", res.name, array, slot)
        }
        ResourceKind::Texture { dim, elem } => format!(
            "{}<{}> {}{} : register({});",
            texture_type(*dim),
            dialect.type_name(elem),
            res.name,
            array,
            slot
        ),
        ResourceKind::RwTexture { dim, elem } => format!(
            "RW{}<{}> {}{} : register({});",
            texture_type(*dim),
            dialect.type_name(elem),
            res.name,
            array,
            slot
        ),
        ResourceKind::Buffer { elem } => format!(
            "StructuredBuffer<{}> {}{} : register({});",
            dialect.type_name(elem),
            res.name,
            array,
            slot
        ),
        ResourceKind::RwBuffer { elem } => format!(
            "RWStructuredBuffer<{}> {}{} : register({});",
            dialect.type_name(elem),
            res.name,
            array,
            slot
        ),
        ResourceKind::ConstantBuffer { elem } if res.array_len == 1 => format!(
            "cbuffer {}_Block : register({})\n{{\n    {} {};\n}};",
            res.name,
            slot,
            dialect.type_name(elem),
            res.name
        ),
        ResourceKind::ConstantBuffer { elem: DataType::Struct(name) } => {
            format!("ConstantBuffer<{}> {}{} : register({});", name, res.name, array, slot)
        }
        ResourceKind::ConstantBuffer { .. } => bail_unsupported!(
            unit.target,
            "DECL_CBUFFER",
            "constant buffer array '{}' needs a struct element type",
            res.name
        ),
    })
}
