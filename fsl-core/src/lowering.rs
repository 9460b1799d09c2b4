//! Entry-point lowering
//!
//! Selects the items one output sees for a target (evaluating conditional blocks),
//! validates the entry point and turns its `INIT_MAIN`/`RETURN` markers and parameter
//! modifiers into a [`CallConvention`] that every generator consumes.

use crate::ast::*;
use crate::error::{CompilerError, Result};
use crate::resolver::{ResolvedProgram, ResolvedTable};
use crate::target::Target;
use crate::variant::FeatureFlags;
use crate::{bail_semantic, err_semantic};
use log::{debug, trace};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// Root signature names shared by every entry point of a build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoweringOptions {
    pub graphics_root_signature: String,
    pub compute_root_signature: String,
}

impl Default for LoweringOptions {
    fn default() -> Self {
        LoweringOptions {
            graphics_root_signature: "DefaultRootSignature".into(),
            compute_root_signature: "ComputeRootSignature".into(),
        }
    }
}

/// One binary output of a file: a shader block, or the lone entry point of a file without blocks.
#[derive(Debug, Clone)]
pub struct OutputDecl<'a> {
    pub name: String,
    pub stage: Stage,
    pub flags: FeatureFlags,
    pub block: Option<&'a ShaderBlock>,
}

/// Lists the outputs of a program. Files without shader blocks produce one output per
/// entry stage, named after `default_name`.
pub fn output_decls<'a>(program: &'a Program, default_name: &str) -> Result<Vec<OutputDecl<'a>>> {
    let blocks: Vec<_> = program.shader_blocks().collect();
    let mut loose_stages = BTreeSet::new();
    collect_entry_stages(&program.items, &mut loose_stages);

    if !blocks.is_empty() {
        if !loose_stages.is_empty() {
            bail_semantic!(default_name, "entry points must be inside a shader block when the file declares blocks");
        }
        return Ok(blocks
            .into_iter()
            .map(|block| OutputDecl {
                name: block.name.clone(),
                stage: block.stage,
                flags: block.flags,
                block: Some(block),
            })
            .collect());
    }

    let single = loose_stages.len() == 1;
    Ok(loose_stages
        .into_iter()
        .map(|stage| OutputDecl {
            name: if single {
                default_name.to_string()
            } else {
                format!("{}_{}", default_name, stage_suffix(stage))
            },
            stage,
            flags: FeatureFlags::empty(),
            block: None,
        })
        .collect())
}

fn collect_entry_stages(items: &[Item], stages: &mut BTreeSet<Stage>) {
    for item in items {
        match item {
            Item::EntryPoint(entry) => {
                stages.insert(entry.stage);
            }
            Item::Conditional { then, otherwise, .. } => {
                collect_entry_stages(then, stages);
                collect_entry_stages(otherwise, stages);
            }
            _ => {}
        }
    }
}

pub fn stage_suffix(stage: Stage) -> &'static str {
    match stage {
        Stage::Vertex => "vert",
        Stage::Pixel => "frag",
        Stage::Compute => "comp",
    }
}

#[derive(Debug, Clone)]
pub struct StructDef {
    pub name: String,
    pub fields: Vec<Field>,
    pub loc: SourceLoc,
}

/// Everything one output sees for one target, with conditional blocks already evaluated.
#[derive(Debug, Clone)]
pub struct Unit {
    pub structs: Vec<StructDef>,
    pub functions: Vec<Function>,
    pub globals: Vec<Global>,
    pub entries: Vec<EntryPoint>,
    pub tables: Vec<String>,
}

/// Evaluates conditional blocks with the output's flags and the target symbol defined.
pub fn select_unit(program: &Program, output: &OutputDecl, target: Target) -> Result<Unit> {
    let defined = |symbol: &str| symbol == target.symbol() || output.flags.is_defined(symbol);
    let mut unit = Unit {
        structs: Vec::new(),
        functions: Vec::new(),
        globals: Vec::new(),
        entries: Vec::new(),
        tables: Vec::new(),
    };
    let top: Vec<&Item> = program
        .items
        .iter()
        .filter(|item| !matches!(item, Item::ShaderBlock(_)))
        .collect();
    for item in top {
        add_item(item, &defined, &mut unit, &output.name)?;
    }
    match output.block {
        Some(block) => {
            for item in &block.items {
                add_item(item, &defined, &mut unit, &output.name)?;
            }
        }
        // A blockless file yields one output per stage; each keeps only its own entry.
        None => unit.entries.retain(|entry| entry.stage == output.stage),
    }
    Ok(unit)
}

fn add_item(item: &Item, defined: &dyn Fn(&str) -> bool, unit: &mut Unit, scope: &str) -> Result<()> {
    match item {
        Item::Struct(decl) => {
            if unit.structs.iter().any(|s| s.name == decl.name) {
                bail_semantic!(scope, "struct '{}' is defined twice", decl.name);
            }
            unit.structs.push(StructDef {
                name: decl.name.clone(),
                fields: select_members(&decl.members, defined),
                loc: decl.loc.clone(),
            });
        }
        Item::Srt(srt) => {
            if !unit.tables.contains(&srt.name) {
                unit.tables.push(srt.name.clone());
            }
        }
        Item::SharedSet(_) | Item::ShaderBlock(_) => {}
        Item::Function(func) => {
            if unit.functions.iter().any(|f| f.name == func.name) {
                bail_semantic!(scope, "function '{}' is defined twice", func.name);
            }
            unit.functions.push(select_function(func, defined));
        }
        Item::EntryPoint(entry) => {
            let mut entry = entry.clone();
            entry.func = select_function(&entry.func, defined);
            unit.entries.push(entry);
        }
        Item::Global(global) => unit.globals.push(Global {
            frags: select_fragments(&global.frags, defined),
            loc: global.loc.clone(),
        }),
        Item::Conditional {
            cond, then, otherwise, ..
        } => {
            let branch = if cond.evaluate(defined) { then } else { otherwise };
            for item in branch {
                add_item(item, defined, unit, scope)?;
            }
        }
    }
    Ok(())
}

fn select_members(members: &[StructMember], defined: &dyn Fn(&str) -> bool) -> Vec<Field> {
    let mut fields = Vec::new();
    for member in members {
        match member {
            StructMember::Field(field) => fields.push(field.clone()),
            StructMember::Conditional { cond, then, otherwise } => {
                let branch = if cond.evaluate(defined) { then } else { otherwise };
                fields.extend(select_members(branch, defined));
            }
        }
    }
    fields
}

fn select_function(func: &Function, defined: &dyn Fn(&str) -> bool) -> Function {
    Function {
        body: select_fragments(&func.body, defined),
        ..func.clone()
    }
}

/// Replaces every conditional fragment by the branch that is taken.
pub fn select_fragments(frags: &[Fragment], defined: &dyn Fn(&str) -> bool) -> Vec<Fragment> {
    let mut out = Vec::with_capacity(frags.len());
    for frag in frags {
        match frag {
            Fragment::Conditional {
                cond, then, otherwise, ..
            } => {
                let branch = if cond.evaluate(defined) { then } else { otherwise };
                out.extend(select_fragments(branch, defined));
            }
            Fragment::Call { name, args, loc } => out.push(Fragment::Call {
                name: name.clone(),
                args: args.iter().map(|a| select_fragments(a, defined)).collect(),
                loc: loc.clone(),
            }),
            Fragment::Return { args, loc } => out.push(Fragment::Return {
                args: args.iter().map(|a| select_fragments(a, defined)).collect(),
                loc: loc.clone(),
            }),
            other => out.push(other.clone()),
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Passing {
    Value,
    Out,
    InOut,
}

/// What a target must do to honour a parameter's passing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Obligation {
    None,
    /// Writes must reach the caller: `out`/`inout` qualifiers or `thread T&`.
    ByReference,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoweredParam {
    pub name: String,
    pub ty: DataType,
    pub array_len: Option<u32>,
    pub passing: Passing,
    pub obligation: Obligation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_value: Option<SystemValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VaryingBinding {
    Location(u32),
    System(SystemValue),
}

/// One stage input or output. `field` is `None` when the value itself is the output.
#[derive(Debug, Clone, Serialize)]
pub struct StageVarying {
    pub field: Option<String>,
    pub ty: DataType,
    pub array_len: Option<u32>,
    pub binding: VaryingBinding,
    /// Source semantic text for non-system varyings, e.g. `TEXCOORD0`.
    pub semantic: Option<String>,
}

/// How the dialect parameters are rebuilt at `INIT_MAIN`.
#[derive(Debug, Clone, Serialize)]
pub struct Prologue {
    /// `(parameter name, struct name)` of the stage-input struct.
    pub struct_param: Option<(String, String)>,
    pub inputs: Vec<StageVarying>,
    pub system_values: Vec<LoweredParam>,
}

/// How `RETURN(value)` is taken apart into stage outputs.
#[derive(Debug, Clone, Serialize)]
pub struct Epilogue {
    pub outputs: Vec<StageVarying>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallConvention {
    pub name: String,
    pub stage: Option<Stage>,
    pub returns_value: bool,
    pub return_type: DataType,
    pub params: Vec<LoweredParam>,
    pub prologue: Option<Prologue>,
    pub epilogue: Option<Epilogue>,
}

#[derive(Debug, Clone)]
pub struct LoweredFunction {
    pub func: Function,
    pub convention: CallConvention,
    /// Resources used by this function and everything it calls, in table order.
    pub resources: Vec<String>,
}

/// A validated output ready for a generator.
#[derive(Debug, Clone)]
pub struct LoweredUnit {
    pub name: String,
    pub stage: Stage,
    pub flags: FeatureFlags,
    pub target: Target,
    pub structs: Vec<StructDef>,
    pub globals: Vec<Global>,
    /// Helpers in post-order: callees before callers.
    pub helpers: Vec<LoweredFunction>,
    pub entry: LoweredFunction,
    pub table: Option<ResolvedTable>,
    pub num_threads: Option<[u32; 3]>,
    /// Textures used with comparison sampling.
    pub compare_textures: BTreeSet<String>,
}

impl LoweredUnit {
    pub fn find_struct(&self, name: &str) -> Option<&StructDef> {
        self.structs.iter().find(|s| s.name == name)
    }

    pub fn is_helper(&self, name: &str) -> bool {
        self.helpers.iter().any(|h| h.func.name == name)
    }

    pub fn helper(&self, name: &str) -> Option<&LoweredFunction> {
        self.helpers.iter().find(|h| h.func.name == name)
    }
}

/// Lowers one output for one target.
pub fn lower(
    program: &Program,
    resolved: &ResolvedProgram,
    output: &OutputDecl,
    target: Target,
    options: &LoweringOptions,
) -> Result<LoweredUnit> {
    let scope = output.name.as_str();
    let unit = select_unit(program, output, target)?;
    debug!(
        "lowering '{}' for {} ({} structs, {} functions)",
        scope,
        target,
        unit.structs.len(),
        unit.functions.len()
    );

    let mut entries = unit.entries.iter();
    let entry = match (entries.next(), entries.next()) {
        (Some(entry), None) => entry,
        (None, _) => bail_semantic!(scope, "no {} entry point", output.stage),
        (Some(_), Some(_)) => bail_semantic!(scope, "more than one entry point"),
    };
    if entry.stage != output.stage {
        bail_semantic!(
            scope,
            "'{}' is a {} entry point inside a {} block",
            entry.func.name,
            entry.stage,
            output.stage
        );
    }

    check_entry_markers(entry, options, scope)?;
    let table = select_table(entry, &unit, resolved, scope)?;

    let structs: HashMap<&str, &StructDef> = unit.structs.iter().map(|s| (s.name.as_str(), s)).collect();
    let convention = entry_convention(entry, &structs, output.flags, scope)?;
    check_entry_body(entry, scope)?;

    let functions: HashMap<&str, &Function> = unit.functions.iter().map(|f| (f.name.as_str(), f)).collect();
    let order = collect_helpers(&entry.func, &functions, scope)?;
    for name in &order {
        check_helper_body(functions[name.as_str()], scope)?;
    }
    for func in order.iter().map(|n| functions[n.as_str()]).chain(std::iter::once(&entry.func)) {
        check_calls(&func.body, output.flags, scope)?;
    }

    // Resource usage, checked against every table this output can see.
    let foreign: HashMap<String, String> = unit
        .tables
        .iter()
        .filter_map(|name| resolved.tables.get(name))
        .filter(|t| table.map_or(true, |own| own.name != t.name))
        .flat_map(|t| t.resources().map(move |(_, r)| (r.name.clone(), t.name.clone())))
        .collect();
    let own_names: HashSet<&str> = table
        .map(|t| t.resources().map(|(_, r)| r.name.as_str()).collect())
        .unwrap_or_default();

    let mut transitive: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    let mut helpers = Vec::new();
    for name in &order {
        let func = functions[name.as_str()];
        let used = function_resources(func, &own_names, &foreign, &transitive, table, scope)?;
        transitive.insert(name.clone(), used.clone());
        helpers.push(LoweredFunction {
            func: func.clone(),
            convention: helper_convention(func, scope)?,
            resources: in_table_order(&used, table),
        });
    }
    let entry_used = function_resources(&entry.func, &own_names, &foreign, &transitive, table, scope)?;

    let mut compare_textures = BTreeSet::new();
    for func in helpers.iter().map(|h| &h.func).chain(std::iter::once(&entry.func)) {
        for frag in &func.body {
            frag.walk(&mut |f| {
                if let Fragment::Call { name, args, .. } = f {
                    if name == "SampleCmp" {
                        if let Some(tex) = args.first().and_then(|a| a.first()).and_then(Fragment::ident) {
                            compare_textures.insert(tex.to_string());
                        }
                    }
                }
            });
        }
    }

    Ok(LoweredUnit {
        name: output.name.clone(),
        stage: output.stage,
        flags: output.flags,
        target,
        structs: unit.structs.clone(),
        globals: unit.globals.clone(),
        helpers,
        entry: LoweredFunction {
            func: entry.func.clone(),
            convention,
            resources: in_table_order(&entry_used, table),
        },
        table: table.cloned(),
        num_threads: entry.num_threads,
        compare_textures,
    })
}

fn check_entry_markers(entry: &EntryPoint, options: &LoweringOptions, scope: &str) -> Result<()> {
    match (entry.stage, entry.num_threads) {
        (Stage::Compute, None) => bail_semantic!(scope, "compute entry point needs NUM_THREADS(x, y, z)"),
        (Stage::Vertex | Stage::Pixel, Some(_)) => {
            bail_semantic!(scope, "NUM_THREADS only applies to compute entry points")
        }
        _ => {}
    }
    if entry.stage == Stage::Compute && !entry.func.return_type.is_void() {
        bail_semantic!(scope, "compute entry point must return void");
    }
    if let Some(signature) = &entry.root_signature {
        let expected = if entry.stage.is_graphics() {
            &options.graphics_root_signature
        } else {
            &options.compute_root_signature
        };
        if signature != expected {
            bail_semantic!(
                scope,
                "root signature '{}' does not match the {} signature '{}' shared by this build",
                signature,
                if entry.stage.is_graphics() { "graphics" } else { "compute" },
                expected
            );
        }
    }
    Ok(())
}

fn select_table<'r>(
    entry: &EntryPoint,
    unit: &Unit,
    resolved: &'r ResolvedProgram,
    scope: &str,
) -> Result<Option<&'r ResolvedTable>> {
    match &entry.srt {
        Some(name) => {
            if !unit.tables.contains(name) {
                bail_semantic!(scope, "USE_SRT({}) names a table that is not declared for this output", name);
            }
            resolved.table(name).map(Some)
        }
        None => match unit.tables.as_slice() {
            [] => Ok(None),
            [only] => resolved.table(only).map(Some),
            _ => bail_semantic!(
                scope,
                "several resource tables are visible ({}); select one with USE_SRT",
                unit.tables.join(", ")
            ),
        },
    }
}

fn system_value_allowed(sv: SystemValue, stage: Stage, output: bool) -> bool {
    use SystemValue::*;
    match (stage, output) {
        (Stage::Vertex, false) => matches!(sv, VertexId | InstanceId | ViewId),
        (Stage::Vertex, true) => matches!(sv, Position),
        (Stage::Pixel, false) => matches!(sv, Position | PrimitiveId | IsFrontFace | ViewId),
        (Stage::Pixel, true) => matches!(sv, Target(_) | Depth),
        (Stage::Compute, false) => matches!(sv, DispatchThreadId | GroupThreadId | GroupId | GroupIndex),
        (Stage::Compute, true) => false,
    }
}

fn check_system_value(sv: SystemValue, stage: Stage, output: bool, flags: FeatureFlags, scope: &str) -> Result<()> {
    if !system_value_allowed(sv, stage, output) {
        bail_semantic!(
            scope,
            "{} is not a valid {} {}",
            sv.hlsl_semantic(),
            stage,
            if output { "output" } else { "input" }
        );
    }
    match sv {
        SystemValue::PrimitiveId if !flags.contains(FeatureFlags::PRIM_ID) => {
            bail_semantic!(scope, "SV_PrimitiveID requires the FT_PRIM_ID feature flag")
        }
        SystemValue::ViewId if !flags.contains(FeatureFlags::MULTIVIEW) => {
            bail_semantic!(scope, "SV_ViewID requires the FT_MULTIVIEW feature flag")
        }
        _ => Ok(()),
    }
}

fn struct_varyings(
    def: &StructDef,
    stage: Stage,
    output: bool,
    flags: FeatureFlags,
    scope: &str,
) -> Result<Vec<StageVarying>> {
    let mut next_location = 0u32;
    let mut varyings = Vec::with_capacity(def.fields.len());
    for field in &def.fields {
        let system = field.semantic.as_ref().and_then(Semantic::system_value);
        let binding = match system {
            Some(sv) => {
                check_system_value(sv, stage, output, flags, scope)?;
                VaryingBinding::System(sv)
            }
            None if stage == Stage::Pixel && output => {
                bail_semantic!(scope, "pixel output '{}.{}' needs an SV_Target semantic", def.name, field.name)
            }
            None => {
                let location = next_location;
                next_location += field.array_len.unwrap_or(1);
                VaryingBinding::Location(location)
            }
        };
        if field.ty.is_atomic() || matches!(field.ty, DataType::Struct(_)) {
            bail_semantic!(scope, "stage field '{}.{}' must have a scalar, vector or matrix type", def.name, field.name);
        }
        varyings.push(StageVarying {
            field: Some(field.name.clone()),
            ty: field.ty.clone(),
            array_len: field.array_len,
            binding,
            semantic: match system {
                Some(_) => None,
                None => field.semantic.as_ref().map(|s| s.as_str().to_string()),
            },
        });
    }
    Ok(varyings)
}

fn entry_convention(
    entry: &EntryPoint,
    structs: &HashMap<&str, &StructDef>,
    flags: FeatureFlags,
    scope: &str,
) -> Result<CallConvention> {
    let func = &entry.func;
    let mut struct_param = None;
    let mut inputs = Vec::new();
    let mut system_values = Vec::new();
    let mut params = Vec::new();

    for param in &func.params {
        if param.modifier != ParamModifier::In {
            bail_semantic!(scope, "entry point parameter '{}' cannot be out or inout", param.name);
        }
        let lowered = LoweredParam {
            name: param.name.clone(),
            ty: param.ty.clone(),
            array_len: param.array_len,
            passing: Passing::Value,
            obligation: Obligation::None,
            system_value: param.system_value,
        };
        match (&param.ty, param.system_value) {
            (_, Some(sv)) => {
                check_system_value(sv, entry.stage, false, flags, scope)?;
                system_values.push(lowered.clone());
            }
            (DataType::Struct(name), None) => {
                if struct_param.is_some() {
                    bail_semantic!(scope, "entry point takes more than one stage-input struct");
                }
                let def = structs
                    .get(name.as_str())
                    .ok_or_else(|| err_semantic!(scope, "unknown struct '{}'", name))?;
                inputs = struct_varyings(def, entry.stage, false, flags, scope)?;
                struct_param = Some((param.name.clone(), name.clone()));
            }
            _ => bail_semantic!(
                scope,
                "entry point parameter '{}' must be a stage-input struct or a system value",
                param.name
            ),
        }
        params.push(lowered);
    }

    let outputs = match &func.return_type {
        DataType::Void => Vec::new(),
        DataType::Struct(name) => {
            let def = structs
                .get(name.as_str())
                .ok_or_else(|| err_semantic!(scope, "unknown struct '{}'", name))?;
            struct_varyings(def, entry.stage, true, flags, scope)?
        }
        ty if entry.stage == Stage::Pixel => vec![StageVarying {
            field: None,
            ty: ty.clone(),
            array_len: None,
            binding: VaryingBinding::System(SystemValue::Target(0)),
            semantic: None,
        }],
        ty => bail_semantic!(scope, "a {} entry point cannot return a bare '{}'", entry.stage, ty),
    };
    if entry.stage == Stage::Vertex
        && !outputs
            .iter()
            .any(|o| o.binding == VaryingBinding::System(SystemValue::Position))
    {
        bail_semantic!(scope, "vertex output must include an SV_Position field");
    }

    trace!("entry '{}': {} inputs, {} outputs", func.name, inputs.len(), outputs.len());
    Ok(CallConvention {
        name: func.name.clone(),
        stage: Some(entry.stage),
        returns_value: !func.return_type.is_void(),
        return_type: func.return_type.clone(),
        params,
        prologue: Some(Prologue {
            struct_param,
            inputs,
            system_values,
        }),
        epilogue: Some(Epilogue { outputs }),
    })
}

fn helper_convention(func: &Function, scope: &str) -> Result<CallConvention> {
    let params = func
        .params
        .iter()
        .map(|p| {
            if p.system_value.is_some() {
                bail_semantic!(scope, "helper '{}' cannot take system value '{}'", func.name, p.name);
            }
            let (passing, obligation) = match p.modifier {
                ParamModifier::In => (Passing::Value, Obligation::None),
                ParamModifier::Out => (Passing::Out, Obligation::ByReference),
                ParamModifier::InOut => (Passing::InOut, Obligation::ByReference),
            };
            Ok(LoweredParam {
                name: p.name.clone(),
                ty: p.ty.clone(),
                array_len: p.array_len,
                passing,
                obligation,
                system_value: None,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(CallConvention {
        name: func.name.clone(),
        stage: None,
        returns_value: !func.return_type.is_void(),
        return_type: func.return_type.clone(),
        params,
        prologue: None,
        epilogue: None,
    })
}

fn check_entry_body(entry: &EntryPoint, scope: &str) -> Result<()> {
    let body = &entry.func.body;
    let mut init_count = 0;
    let mut error = None;
    let wants_value = !entry.func.return_type.is_void();
    for frag in body {
        frag.walk(&mut |f| {
            if error.is_some() {
                return;
            }
            match f {
                Fragment::InitMain(_) => init_count += 1,
                Fragment::Return { args, loc } => {
                    let expected = usize::from(wants_value);
                    if args.len() != expected {
                        error = Some(if wants_value {
                            err_semantic!(scope, "RETURN at {} must supply exactly one value", loc)
                        } else {
                            err_semantic!(scope, "RETURN at {} must be empty in a void entry point", loc)
                        });
                    }
                }
                Fragment::Token(Tok {
                    token: crate::lexer::Token::Identifier(word),
                    loc,
                }) if word == "return" => {
                    error = Some(err_semantic!(scope, "use RETURN(...) instead of 'return' at {}", loc));
                }
                _ => {}
            }
        });
    }
    if let Some(err) = error {
        return Err(err);
    }
    if init_count != 1 || !matches!(body.first(), Some(Fragment::InitMain(_))) {
        bail_semantic!(
            scope,
            "entry point '{}' must start with exactly one INIT_MAIN",
            entry.func.name
        );
    }
    Ok(())
}

fn check_helper_body(func: &Function, scope: &str) -> Result<()> {
    let mut marker = None;
    for frag in &func.body {
        frag.walk(&mut |f| match f {
            Fragment::InitMain(loc) => {
                marker.get_or_insert(("INIT_MAIN", loc.clone()));
            }
            Fragment::Return { loc, .. } => {
                marker.get_or_insert(("RETURN", loc.clone()));
            }
            _ => {}
        });
    }
    match marker {
        Some((name, loc)) => bail_semantic!(
            scope,
            "{} at {} is only valid in entry points; '{}' is a helper",
            name,
            loc,
            func.name
        ),
        None => Ok(()),
    }
}

/// Rejects multi-argument matrix constructors and unflagged wave operations.
fn check_calls(body: &[Fragment], flags: FeatureFlags, scope: &str) -> Result<()> {
    let mut error = None;
    for frag in body {
        frag.walk(&mut |f| {
            let Fragment::Call { name, args, loc } = f else {
                return;
            };
            if error.is_some() {
                return;
            }
            if let Some(DataType::Matrix { columns, rows, .. }) = DataType::builtin(name) {
                if args.len() > 1 {
                    error = Some(err_semantic!(
                        scope,
                        "matrix constructor '{}' at {} is ambiguous across targets; use make_f{}x{}_cols or make_f{}x{}_rows",
                        name,
                        loc,
                        columns,
                        rows,
                        columns,
                        rows
                    ));
                }
            } else if name.starts_with("Wave") && !flags.contains(FeatureFlags::SUBGROUP_OPS) {
                error = Some(err_semantic!(scope, "'{}' at {} requires the FT_SUBGROUP_OPS feature flag", name, loc));
            }
        });
    }
    match error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Helpers reachable from `root`, callees first. Recursion is an error.
fn collect_helpers(root: &Function, functions: &HashMap<&str, &Function>, scope: &str) -> Result<Vec<String>> {
    let mut order = Vec::new();
    let mut done = HashSet::new();
    let mut stack = Vec::new();
    collect_helpers_recursive(root, functions, &mut order, &mut done, &mut stack, scope)?;
    Ok(order)
}

fn collect_helpers_recursive(
    func: &Function,
    functions: &HashMap<&str, &Function>,
    order: &mut Vec<String>,
    done: &mut HashSet<String>,
    stack: &mut Vec<String>,
    scope: &str,
) -> Result<()> {
    stack.push(func.name.clone());
    let mut callees = Vec::new();
    for frag in &func.body {
        frag.walk(&mut |f| {
            if let Fragment::Call { name, .. } = f {
                if functions.contains_key(name.as_str()) && !callees.contains(name) {
                    callees.push(name.clone());
                }
            }
        });
    }
    for callee in callees {
        if stack.contains(&callee) {
            bail_semantic!(scope, "recursive call from '{}' to '{}'", func.name, callee);
        }
        if done.contains(&callee) {
            continue;
        }
        collect_helpers_recursive(functions[callee.as_str()], functions, order, done, stack, scope)?;
    }
    stack.pop();
    if stack.is_empty() {
        // The root itself is the entry point, not a helper.
        return Ok(());
    }
    done.insert(func.name.clone());
    order.push(func.name.clone());
    Ok(())
}

/// Calls `visit` for every identifier that names a value (not a member after `.`).
pub fn visit_value_idents<'a>(frags: &'a [Fragment], visit: &mut dyn FnMut(&'a str, &'a SourceLoc)) {
    let mut after_dot = false;
    for frag in frags {
        match frag {
            Fragment::Token(Tok {
                token: crate::lexer::Token::Identifier(name),
                loc,
            }) if !after_dot => visit(name, loc),
            Fragment::Call { args, .. } | Fragment::Return { args, .. } => {
                for arg in args {
                    visit_value_idents(arg, visit);
                }
            }
            Fragment::Conditional { then, otherwise, .. } => {
                visit_value_idents(then, visit);
                visit_value_idents(otherwise, visit);
            }
            _ => {}
        }
        after_dot = matches!(frag.as_token(), Some(crate::lexer::Token::Dot));
    }
}

fn function_resources(
    func: &Function,
    own: &HashSet<&str>,
    foreign: &HashMap<String, String>,
    callee_resources: &BTreeMap<String, BTreeSet<String>>,
    table: Option<&ResolvedTable>,
    scope: &str,
) -> Result<BTreeSet<String>> {
    let mut used = BTreeSet::new();
    let mut error: Option<CompilerError> = None;
    visit_value_idents(&func.body, &mut |name, loc| {
        if own.contains(name) {
            used.insert(name.to_string());
        } else if let Some(other) = foreign.get(name) {
            if error.is_none() {
                error = Some(match table {
                    Some(t) => err_semantic!(
                        scope,
                        "resource '{}' used at {} belongs to table '{}', not '{}'",
                        name,
                        loc,
                        other,
                        t.name
                    ),
                    None => err_semantic!(
                        scope,
                        "resource '{}' used at {} belongs to table '{}'; select it with USE_SRT",
                        name,
                        loc,
                        other
                    ),
                });
            }
        }
    });
    if let Some(err) = error {
        return Err(err);
    }
    for frag in &func.body {
        frag.walk(&mut |f| {
            if let Fragment::Call { name, .. } = f {
                if let Some(inner) = callee_resources.get(name) {
                    used.extend(inner.iter().cloned());
                }
            }
        });
    }
    Ok(used)
}

fn in_table_order(used: &BTreeSet<String>, table: Option<&ResolvedTable>) -> Vec<String> {
    table
        .map(|t| {
            t.resources()
                .filter(|(_, r)| used.contains(&r.name))
                .map(|(_, r)| r.name.clone())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;
    use crate::resolver::resolve_program;
    use crate::source::SourceLoader;

    fn parse(input: &str) -> Program {
        let loaded = SourceLoader::default().load_str("t.fsl", input, None).unwrap();
        Parser::new(loaded.tokens, loaded.name).parse().unwrap()
    }

    fn lower_first(input: &str, target: Target) -> Result<LoweredUnit> {
        let program = parse(input);
        let resolved = resolve_program(&program)?;
        let outputs = output_decls(&program, "t")?;
        lower(&program, &resolved, &outputs[0], target, &LoweringOptions::default())
    }

    const COMMON: &str = "
STRUCT(VSInput)
{
    DATA(float3, position, POSITION);
    DATA(float2, uv, TEXCOORD0);
};
STRUCT(VSOutput)
{
    DATA(float4, position, SV_Position);
    DATA(float2, uv, TEXCOORD0);
#ifdef FT_PRIM_ID
    DATA(uint, prim, TEXCOORD1);
#endif
};
BEGIN_SRT(SrtData)
    BEGIN_SRT_SET(Persistent)
        DECL_TEXTURE(Persistent, Tex2D(float4), uTexture0)
        DECL_SAMPLER(Persistent, SamplerState, uSampler0)
    END_SRT_SET(Persistent)
END_SRT(SrtData)
";

    fn with_common(rest: &str) -> String {
        format!("{}{}", COMMON, rest)
    }

    #[test]
    fn test_vertex_convention() {
        let src = with_common(
            "#vert basic\nVSOutput VS_MAIN(VSInput input, SV_VertexID(uint) vid)\n{\n    INIT_MAIN;\n    VSOutput o;\n    o.position = float4(input.position, 1.0);\n    o.uv = input.uv;\n    RETURN(o);\n}\n#end\n",
        );
        let unit = lower_first(&src, Target::Vulkan).unwrap();
        let conv = &unit.entry.convention;
        let prologue = conv.prologue.as_ref().unwrap();
        assert_eq!(prologue.struct_param, Some(("input".to_string(), "VSInput".to_string())));
        assert_eq!(prologue.inputs[1].binding, VaryingBinding::Location(1));
        assert_eq!(prologue.system_values[0].system_value, Some(SystemValue::VertexId));
        let outputs = &conv.epilogue.as_ref().unwrap().outputs;
        assert_eq!(outputs[0].binding, VaryingBinding::System(SystemValue::Position));
        assert_eq!(outputs[1].binding, VaryingBinding::Location(0));
        assert!(unit.entry.resources.is_empty());
    }

    #[test]
    fn test_flags_select_struct_fields() {
        let src = with_common(
            "#frag FT_PRIM_ID lit\nfloat4 PS_MAIN(VSOutput input, SV_PrimitiveID(uint) prim)\n{\n    INIT_MAIN;\n    RETURN(SampleLvl(uTexture0, uSampler0, input.uv, 0));\n}\n#end\n",
        );
        let unit = lower_first(&src, Target::Direct3D12).unwrap();
        assert_eq!(unit.find_struct("VSOutput").unwrap().fields.len(), 3);
        assert_eq!(unit.entry.resources, vec!["uTexture0", "uSampler0"]);
        let outputs = &unit.entry.convention.epilogue.as_ref().unwrap().outputs;
        assert_eq!(outputs[0].binding, VaryingBinding::System(SystemValue::Target(0)));
    }

    #[test]
    fn test_primitive_id_needs_flag() {
        let src = with_common(
            "#frag lit\nfloat4 PS_MAIN(SV_PrimitiveID(uint) prim)\n{\n    INIT_MAIN;\n    RETURN(float4(0, 0, 0, 1));\n}\n#end\n",
        );
        let err = lower_first(&src, Target::Vulkan).unwrap_err();
        assert!(err.to_string().contains("FT_PRIM_ID"), "{}", err);
    }

    #[test]
    fn test_init_main_and_return_rules() {
        let missing = with_common("#frag a\nfloat4 PS_MAIN()\n{\n    RETURN(float4(0, 0, 0, 1));\n}\n#end\n");
        assert!(lower_first(&missing, Target::Metal).unwrap_err().to_string().contains("INIT_MAIN"));

        let arity = with_common("#frag a\nfloat4 PS_MAIN()\n{\n    INIT_MAIN;\n    RETURN();\n}\n#end\n");
        assert!(lower_first(&arity, Target::Metal).unwrap_err().to_string().contains("exactly one value"));

        let plain = with_common("#frag a\nfloat4 PS_MAIN()\n{\n    INIT_MAIN;\n    return float4(1, 1, 1, 1);\n}\n#end\n");
        assert!(lower_first(&plain, Target::Metal).unwrap_err().to_string().contains("RETURN"));
    }

    #[test]
    fn test_compute_markers() {
        let no_threads = "#comp c\nvoid CS_MAIN(SV_DispatchThreadID(uint3) id)\n{\n    INIT_MAIN;\n    RETURN();\n}\n#end\n";
        assert!(lower_first(no_threads, Target::Vulkan).unwrap_err().to_string().contains("NUM_THREADS"));

        let wrong_sig = "#comp c\nROOT_SIGNATURE(DefaultRootSignature)\nNUM_THREADS(64, 1, 1)\nvoid CS_MAIN(SV_DispatchThreadID(uint3) id)\n{\n    INIT_MAIN;\n    RETURN();\n}\n#end\n";
        assert!(lower_first(wrong_sig, Target::Vulkan).unwrap_err().to_string().contains("root signature"));

        let ok = "#comp c\nROOT_SIGNATURE(ComputeRootSignature)\nNUM_THREADS(64, 1, 1)\nvoid CS_MAIN(SV_DispatchThreadID(uint3) id)\n{\n    INIT_MAIN;\n    RETURN();\n}\n#end\n";
        assert_eq!(lower_first(ok, Target::Vulkan).unwrap().num_threads, Some([64, 1, 1]));
    }

    #[test]
    fn test_helpers_are_post_ordered_and_carry_resources() {
        let src = with_common(
            "float4 fetch(float2 uv) { return Sample(uTexture0, uSampler0, uv); }\n\
             float4 shade(in(float2) uv, out(float) alpha) { float4 c = fetch(uv); alpha = c.a; return c; }\n\
             #frag a\nfloat4 PS_MAIN(VSOutput input)\n{\n    INIT_MAIN;\n    float a;\n    RETURN(shade(input.uv, a));\n}\n#end\n",
        );
        let unit = lower_first(&src, Target::Metal).unwrap();
        let names: Vec<&str> = unit.helpers.iter().map(|h| h.func.name.as_str()).collect();
        assert_eq!(names, vec!["fetch", "shade"]);
        let shade = unit.helper("shade").unwrap();
        assert_eq!(shade.resources, vec!["uTexture0", "uSampler0"]);
        assert_eq!(shade.convention.params[1].obligation, Obligation::ByReference);
        assert_eq!(shade.convention.params[1].passing, Passing::Out);
    }

    #[test]
    fn test_recursion_and_matrix_constructors_are_rejected() {
        let recursive = with_common(
            "float f(float x) { return f(x); }\n#frag a\nfloat4 PS_MAIN()\n{\n    INIT_MAIN;\n    RETURN(float4(f(1.0), 0, 0, 1));\n}\n#end\n",
        );
        assert!(lower_first(&recursive, Target::Vulkan).unwrap_err().to_string().contains("recursive"));

        let ctor = with_common(
            "#frag a\nfloat4 PS_MAIN()\n{\n    INIT_MAIN;\n    float2x2 m = float2x2(1, 0, 0, 1);\n    RETURN(float4(m[0], 0, 1));\n}\n#end\n",
        );
        assert!(lower_first(&ctor, Target::Vulkan).unwrap_err().to_string().contains("make_f2x2_cols"));
    }

    #[test]
    fn test_resource_from_another_table_is_rejected() {
        let src = with_common(
            "BEGIN_SRT(Other)\nBEGIN_SRT_SET(PerDraw)\nDECL_BUFFER(PerDraw, Buffer(float4), gColors)\nEND_SRT_SET(PerDraw)\nEND_SRT(Other)\n\
             #frag a\nUSE_SRT(SrtData)\nfloat4 PS_MAIN()\n{\n    INIT_MAIN;\n    RETURN(gColors[0]);\n}\n#end\n",
        );
        let err = lower_first(&src, Target::Direct3D12).unwrap_err();
        assert!(err.to_string().contains("belongs to table 'Other'"), "{}", err);
    }

    #[test]
    fn test_several_tables_need_use_srt() {
        let src = with_common(
            "BEGIN_SRT(Other)\nBEGIN_SRT_SET(PerDraw)\nDECL_BUFFER(PerDraw, Buffer(float4), gColors)\nEND_SRT_SET(PerDraw)\nEND_SRT(Other)\n\
             #frag a\nfloat4 PS_MAIN()\n{\n    INIT_MAIN;\n    RETURN(float4(0, 0, 0, 1));\n}\n#end\n",
        );
        assert!(lower_first(&src, Target::Vulkan).unwrap_err().to_string().contains("USE_SRT"));
    }

    #[test]
    fn test_target_symbol_selects_branch() {
        let src = "float4 PS_MAIN()\n{\n    INIT_MAIN;\n#if METAL\n    RETURN(float4(1, 0, 0, 1));\n#else\n    RETURN(float4(0, 1, 0, 1));\n#endif\n}\n";
        let program = parse(src);
        let outputs = output_decls(&program, "solid").unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].name, "solid");
        let unit = select_unit(&program, &outputs[0], Target::Metal).unwrap();
        let Fragment::Return { args, .. } = &unit.entries[0].func.body[1] else {
            panic!("expected RETURN");
        };
        let Fragment::Call { args: ctor, .. } = &args[0][0] else {
            panic!("expected constructor");
        };
        assert_eq!(ctor[0][0].as_token(), Some(&crate::lexer::Token::IntLiteral("1".into())));
    }
}
