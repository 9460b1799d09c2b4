//! Source generators for HLSL, Vulkan GLSL and MSL.
//!
//! The generators share the body writer below. Per-target differences (type names,
//! resource declarations, intrinsic spellings, stage plumbing) sit behind [`Dialect`].

pub mod glsl;
pub mod hlsl;
pub mod msl;

use crate::ast::{DataType, Fragment, Frequency, ScalarKind, SourceLoc, Stage, Tok};
use crate::error::{CompilerError, Result};
use crate::lexer::Token;
use crate::lowering::{LoweredFunction, LoweredUnit, StageVarying};
use crate::resolver::ResolvedResource;
use crate::target::{BindingModel, Target};
use crate::variant::{serialize_flags, FeatureFlags};
use crate::{bail_unsupported, err_semantic};
use serde::Serialize;
use std::collections::BTreeSet;

/// How non-uniform resource indexing is expressed on a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NonUniformStrategy {
    /// The index is wrapped in a qualifier (`NonUniformResourceIndex`, `nonuniformEXT`).
    Qualifier,
    /// Dynamic indexing is non-uniform-safe as written.
    Native,
    /// A masked loop over the array visits each element with a uniform index.
    Scan,
}

/// Per-target generation switches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratorOptions {
    pub descriptor_indexing: bool,
    pub argument_buffers: bool,
    pub shader_model: Option<String>,
}

impl Default for GeneratorOptions {
    fn default() -> Self {
        GeneratorOptions {
            descriptor_indexing: true,
            argument_buffers: false,
            shader_model: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BindingInfo {
    pub name: String,
    pub kind: &'static str,
    pub frequency: Frequency,
    pub index: u32,
    pub array_len: u32,
    /// Target spelling of the binding, e.g. `t3, space1`.
    pub slot: String,
}

/// Sidecar metadata written next to every generated source.
#[derive(Debug, Clone, Serialize)]
pub struct ShaderMetadata {
    pub name: String,
    pub target: Target,
    pub stage: Stage,
    pub entry: String,
    #[serde(serialize_with = "serialize_flags")]
    pub flags: FeatureFlags,
    pub binding_model: BindingModel,
    pub nonuniform: NonUniformStrategy,
    pub table: Option<String>,
    pub num_threads: Option<[u32; 3]>,
    pub bindings: Vec<BindingInfo>,
    pub inputs: Vec<StageVarying>,
    pub outputs: Vec<StageVarying>,
}

impl ShaderMetadata {
    fn new(unit: &LoweredUnit, entry: &str, binding_model: BindingModel, nonuniform: NonUniformStrategy) -> Self {
        let convention = &unit.entry.convention;
        ShaderMetadata {
            name: unit.name.clone(),
            target: unit.target,
            stage: unit.stage,
            entry: entry.to_string(),
            flags: unit.flags,
            binding_model,
            nonuniform,
            table: unit.table.as_ref().map(|t| t.name.clone()),
            num_threads: unit.num_threads,
            bindings: Vec::new(),
            inputs: convention.prologue.as_ref().map(|p| p.inputs.clone()).unwrap_or_default(),
            outputs: convention.epilogue.as_ref().map(|e| e.outputs.clone()).unwrap_or_default(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[derive(Debug, Clone)]
pub struct GeneratedShader {
    pub source: String,
    pub metadata: ShaderMetadata,
}

pub trait Generator: Send + Sync {
    fn target(&self) -> Target;
    fn generate(&self, unit: &LoweredUnit) -> Result<GeneratedShader>;
}

pub fn generator(target: Target, options: &GeneratorOptions) -> Box<dyn Generator> {
    match target {
        Target::Direct3D12 => Box::new(hlsl::HlslGenerator::new(options.clone())),
        Target::Vulkan => Box::new(glsl::GlslGenerator::new(options.clone())),
        Target::Metal => Box::new(msl::MslGenerator::new(options.clone())),
    }
}

/// Lowered unit to target source in one call.
pub fn generate(unit: &LoweredUnit, options: &GeneratorOptions) -> Result<GeneratedShader> {
    generator(unit.target, options).generate(unit)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AtomicOp {
    Add,
    And,
    Or,
    Xor,
    Min,
    Max,
    Exchange,
    CompareExchange,
    Load,
    Store,
}

impl AtomicOp {
    fn from_name(name: &str) -> Option<AtomicOp> {
        Some(match name.strip_prefix("Atomic")? {
            "Add" => AtomicOp::Add,
            "And" => AtomicOp::And,
            "Or" => AtomicOp::Or,
            "Xor" => AtomicOp::Xor,
            "Min" => AtomicOp::Min,
            "Max" => AtomicOp::Max,
            "Exchange" => AtomicOp::Exchange,
            "CompareExchange" => AtomicOp::CompareExchange,
            "Load" => AtomicOp::Load,
            "Store" => AtomicOp::Store,
            _ => return None,
        })
    }

    /// Suffix shared by the HLSL, GLSL and MSL spellings: `InterlockedAdd`, `atomicAdd`, `atomic_fetch_add_explicit`.
    pub(crate) fn verb(self) -> &'static str {
        match self {
            AtomicOp::Add => "Add",
            AtomicOp::And => "And",
            AtomicOp::Or => "Or",
            AtomicOp::Xor => "Xor",
            AtomicOp::Min => "Min",
            AtomicOp::Max => "Max",
            AtomicOp::Exchange => "Exchange",
            AtomicOp::CompareExchange => "CompareExchange",
            AtomicOp::Load => "Load",
            AtomicOp::Store => "Store",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Intrinsic {
    Sample,
    SampleLvl,
    SampleCmp,
    LoadRw,
    StoreRw,
    Atomic(AtomicOp),
    NonUniformIndex,
    MakeMatrix { size: u8, columns: bool },
    GetCol,
    GetRow,
    GetElem,
    Mul,
    /// Spelling per target, `[hlsl, glsl, msl]`. `$N` inserts argument N.
    Mapped(&'static [&'static str; 3]),
    UnknownWave,
}

const MAPPED: &[(&str, [&str; 3])] = &[
    ("lerp", ["lerp", "mix", "mix"]),
    ("frac", ["frac", "fract", "fract"]),
    ("saturate", ["saturate", "clamp($0, 0.0, 1.0)", "saturate"]),
    ("rsqrt", ["rsqrt", "inversesqrt", "rsqrt"]),
    ("rcp", ["rcp", "(1.0 / $0)", "(1.0 / $0)"]),
    ("ddx", ["ddx", "dFdx", "dfdx"]),
    ("ddy", ["ddy", "dFdy", "dfdy"]),
    ("atan2", ["atan2", "atan", "atan2"]),
    ("fmod", ["fmod", "($0 - $1 * trunc($0 / $1))", "fmod"]),
    ("mad", ["mad", "fma", "fma"]),
    (
        "GroupMemoryBarrierWithGroupSync",
        [
            "GroupMemoryBarrierWithGroupSync()",
            "barrier()",
            "threadgroup_barrier(mem_flags::mem_threadgroup)",
        ],
    ),
    (
        "DeviceMemoryBarrierWithGroupSync",
        [
            "DeviceMemoryBarrierWithGroupSync()",
            "memoryBarrierBuffer(); barrier()",
            "threadgroup_barrier(mem_flags::mem_device)",
        ],
    ),
    ("WaveActiveSum", ["WaveActiveSum", "subgroupAdd", "simd_sum"]),
    ("WaveActiveProduct", ["WaveActiveProduct", "subgroupMul", "simd_product"]),
    ("WaveActiveMin", ["WaveActiveMin", "subgroupMin", "simd_min"]),
    ("WaveActiveMax", ["WaveActiveMax", "subgroupMax", "simd_max"]),
    ("WaveActiveBitOr", ["WaveActiveBitOr", "subgroupOr", "simd_or"]),
    ("WaveActiveAnyTrue", ["WaveActiveAnyTrue", "subgroupAny", "simd_any"]),
    ("WaveActiveAllTrue", ["WaveActiveAllTrue", "subgroupAll", "simd_all"]),
    ("WaveReadLaneFirst", ["WaveReadLaneFirst", "subgroupBroadcastFirst", "simd_broadcast_first"]),
    ("WaveIsFirstLane", ["WaveIsFirstLane()", "subgroupElect()", "simd_is_first()"]),
    ("WavePrefixSum", ["WavePrefixSum", "subgroupExclusiveAdd", "simd_prefix_exclusive_sum"]),
];

pub(crate) fn classify(name: &str) -> Option<Intrinsic> {
    let intrinsic = match name {
        "Sample" => Intrinsic::Sample,
        "SampleLvl" => Intrinsic::SampleLvl,
        "SampleCmp" => Intrinsic::SampleCmp,
        "LoadRw" => Intrinsic::LoadRw,
        "StoreRw" => Intrinsic::StoreRw,
        "NonUniformResourceIndex" => Intrinsic::NonUniformIndex,
        "getCol" => Intrinsic::GetCol,
        "getRow" => Intrinsic::GetRow,
        "getElem" => Intrinsic::GetElem,
        "mul" => Intrinsic::Mul,
        _ => {
            if let Some(op) = AtomicOp::from_name(name) {
                return Some(Intrinsic::Atomic(op));
            }
            if let Some((_, spelled)) = MAPPED.iter().find(|(n, _)| *n == name) {
                return Some(Intrinsic::Mapped(spelled));
            }
            if let Some(matrix) = parse_make_matrix(name) {
                return Some(matrix);
            }
            if name.starts_with("Wave") {
                return Some(Intrinsic::UnknownWave);
            }
            return None;
        }
    };
    Some(intrinsic)
}

/// `make_f4x4_cols` and friends.
fn parse_make_matrix(name: &str) -> Option<Intrinsic> {
    let rest = name.strip_prefix("make_f")?;
    let (dims, order) = rest.split_once('_')?;
    let (c, r) = dims.split_once('x')?;
    let size: u8 = c.parse().ok()?;
    if c != r || !(2..=4).contains(&size) {
        return None;
    }
    let columns = match order {
        "cols" => true,
        "rows" => false,
        _ => return None,
    };
    Some(Intrinsic::MakeMatrix { size, columns })
}

impl Intrinsic {
    fn arity(self) -> &'static [usize] {
        match self {
            Intrinsic::Sample => &[3],
            Intrinsic::SampleLvl | Intrinsic::SampleCmp => &[4],
            Intrinsic::LoadRw => &[2],
            Intrinsic::StoreRw => &[3],
            Intrinsic::Atomic(AtomicOp::CompareExchange) => &[4],
            Intrinsic::Atomic(AtomicOp::Load | AtomicOp::Store) => &[2],
            Intrinsic::Atomic(_) => &[2, 3],
            Intrinsic::NonUniformIndex => &[1],
            Intrinsic::MakeMatrix { size: 2, .. } => &[2],
            Intrinsic::MakeMatrix { size: 3, .. } => &[3],
            Intrinsic::MakeMatrix { .. } => &[4],
            Intrinsic::GetCol | Intrinsic::GetRow | Intrinsic::Mul => &[2],
            Intrinsic::GetElem => &[3],
            Intrinsic::Mapped(_) | Intrinsic::UnknownWave => &[],
        }
    }
}

fn target_slot(target: Target) -> usize {
    match target {
        Target::Direct3D12 => 0,
        Target::Vulkan => 1,
        Target::Metal => 2,
    }
}

/// Fills a mapped spelling. Plain names become calls; templates substitute `$N`.
fn apply_mapped(spelling: &str, args: &[String]) -> String {
    if !spelling.contains('$') && !spelling.contains('(') {
        return format!("{}({})", spelling, args.join(", "));
    }
    let mut out = String::with_capacity(spelling.len());
    let mut chars = spelling.chars().peekable();
    while let Some(c) = chars.next() {
        match (c, chars.peek().and_then(|d| d.to_digit(10))) {
            ('$', Some(n)) => {
                chars.next();
                out.push_str(args.get(n as usize).map(String::as_str).unwrap_or_default());
            }
            _ => out.push(c),
        }
    }
    out
}

/// Which entity a body belongs to; resources are spelled differently in entry points and helpers on some targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Scope {
    Entry,
    Helper,
}

/// A call of a recognised intrinsic, with rendered and raw arguments.
pub(crate) struct CallSite<'a> {
    pub name: &'a str,
    pub intrinsic: Intrinsic,
    pub args: Vec<String>,
    pub raw: &'a [Vec<Fragment>],
    pub loc: &'a SourceLoc,
    pub unit: &'a LoweredUnit,
}

impl CallSite<'_> {
    /// Resource named by the first identifier of argument `i`.
    pub fn resource(&self, i: usize) -> Option<&ResolvedResource> {
        let name = self.raw.get(i)?.first()?.ident()?;
        self.unit.table.as_ref()?.resource(name).map(|(_, r)| r)
    }

    pub fn expect_resource(&self, i: usize) -> Result<&ResolvedResource> {
        self.resource(i).ok_or_else(|| {
            err_semantic!(
                &self.unit.name,
                "argument {} of '{}' at {} must name a resource",
                i + 1,
                self.name,
                self.loc
            )
        })
    }

    pub fn unsupported(&self, message: &str) -> CompilerError {
        CompilerError::unsupported(self.unit.target, self.name, format!("{} (at {})", message, self.loc))
    }
}

/// Output unit of the body writer, laid out into lines by [`Layout`].
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Piece {
    Word(String),
    Op(String),
    Open(char),
    Close(char),
    Dot,
    Comma,
    Colon,
    Semi,
    LBrace,
    RBrace,
    /// A complete line.
    Line(String),
}

impl Piece {
    fn text(&self) -> &str {
        match self {
            Piece::Word(s) | Piece::Op(s) | Piece::Line(s) => s,
            Piece::Open('[') => "[",
            Piece::Open(_) => "(",
            Piece::Close(']') => "]",
            Piece::Close(_) => ")",
            Piece::Dot => ".",
            Piece::Comma => ",",
            Piece::Colon => ":",
            Piece::Semi => ";",
            Piece::LBrace => "{",
            Piece::RBrace => "}",
        }
    }
}

fn needs_space(prev: &Piece, next: &Piece) -> bool {
    match (prev, next) {
        (Piece::Open(_) | Piece::Dot, _) => false,
        (_, Piece::Close(_) | Piece::Comma | Piece::Semi | Piece::Dot) => false,
        (Piece::Word(_) | Piece::Close(_), Piece::Open(_)) => false,
        _ => true,
    }
}

pub(crate) fn join_inline(pieces: &[Piece]) -> String {
    let mut out = String::new();
    let mut prev: Option<&Piece> = None;
    for piece in pieces {
        if prev.is_some_and(|p| needs_space(p, piece)) {
            out.push(' ');
        }
        out.push_str(piece.text());
        prev = Some(piece);
    }
    out
}

/// Lays pieces out into indented lines: one statement per line, braces on their own lines.
pub(crate) struct Layout {
    out: String,
    indent: usize,
    line: Vec<Piece>,
    parens: usize,
}

impl Layout {
    pub fn new(indent: usize) -> Self {
        Layout {
            out: String::new(),
            indent,
            line: Vec::new(),
            parens: 0,
        }
    }

    pub fn push(&mut self, piece: Piece) {
        match piece {
            Piece::Open(_) => {
                self.parens += 1;
                self.line.push(piece);
            }
            Piece::Close(_) => {
                self.parens = self.parens.saturating_sub(1);
                self.line.push(piece);
            }
            Piece::Semi if self.parens == 0 => {
                if self.line.is_empty() && self.out.ends_with("}\n") {
                    self.out.pop();
                    self.out.push_str(";\n");
                    return;
                }
                self.line.push(piece);
                self.flush();
            }
            Piece::LBrace => {
                self.flush();
                self.write_line("{");
                self.indent += 1;
            }
            Piece::RBrace => {
                self.flush();
                self.indent = self.indent.saturating_sub(1);
                self.write_line("}");
            }
            Piece::Line(text) => {
                self.flush();
                self.write_line(&text);
            }
            other => self.line.push(other),
        }
    }

    fn flush(&mut self) {
        if !self.line.is_empty() {
            let text = join_inline(&self.line);
            self.line.clear();
            self.write_line(&text);
        }
    }

    fn write_line(&mut self, text: &str) {
        for _ in 0..self.indent {
            self.out.push_str("    ");
        }
        self.out.push_str(text);
        self.out.push('\n');
    }

    pub fn finish(mut self) -> String {
        self.flush();
        self.out
    }
}

/// Target hooks used by [`BodyWriter`].
pub(crate) trait Dialect {
    fn target(&self) -> Target;
    fn type_name(&self, ty: &DataType) -> String;
    fn strategy(&self) -> NonUniformStrategy;

    /// Whether `floatNxN(a, b, ...)` takes columns (GLSL, MSL) rather than rows (HLSL).
    fn constructor_takes_columns(&self) -> bool {
        true
    }

    /// Respelling of an identifier that is reserved or spelled differently on the target.
    fn identifier(&self, _word: &str) -> Option<String> {
        None
    }

    fn float_literal(&self, text: &str) -> String {
        text.to_string()
    }

    fn resource_ref(&self, resource: &ResolvedResource, _frequency: Frequency, _scope: Scope) -> String {
        resource.name.clone()
    }

    /// Extra arguments appended to a helper call, e.g. the resources it reads.
    fn helper_args(&self, _unit: &LoweredUnit, _helper: &LoweredFunction, _scope: Scope) -> Vec<String> {
        Vec::new()
    }

    fn nonuniform_index(&self, index: &str) -> String;

    /// Resource-facing intrinsics: sampling, image access and atomics.
    fn intrinsic(&self, call: &CallSite<'_>) -> Result<String>;

    fn init_main(&self, unit: &LoweredUnit) -> Result<Vec<Piece>>;
    fn return_value(&self, unit: &LoweredUnit, value: Option<&str>) -> Result<Vec<Piece>>;
}

/// Renders function bodies and expressions through a [`Dialect`].
pub(crate) struct BodyWriter<'a> {
    dialect: &'a dyn Dialect,
    unit: &'a LoweredUnit,
    scope: Scope,
    nonuniform_var: Option<String>,
    scan_count: usize,
}

impl<'a> BodyWriter<'a> {
    pub fn new(dialect: &'a dyn Dialect, unit: &'a LoweredUnit, scope: Scope) -> Self {
        BodyWriter {
            dialect,
            unit,
            scope,
            nonuniform_var: None,
            scan_count: 0,
        }
    }

    /// Renders a body, `indent` levels deep, one statement per line.
    pub fn body(&mut self, frags: &[Fragment], indent: usize) -> Result<String> {
        let mut layout = Layout::new(indent);
        for piece in self.statement_pieces(frags)? {
            layout.push(piece);
        }
        Ok(layout.finish())
    }

    pub fn expression(&mut self, frags: &[Fragment]) -> Result<String> {
        Ok(join_inline(&self.pieces(frags)?))
    }

    fn statement_pieces(&mut self, frags: &[Fragment]) -> Result<Vec<Piece>> {
        if self.dialect.strategy() != NonUniformStrategy::Scan {
            return self.pieces(frags);
        }
        let mut out = Vec::new();
        let mut start = 0;
        let mut depth = 0usize;
        for (i, frag) in frags.iter().enumerate() {
            match frag {
                Fragment::InitMain(_) | Fragment::Return { .. } if depth == 0 => {
                    out.extend(self.statement(&frags[start..i])?);
                    out.extend(self.pieces(std::slice::from_ref(frag))?);
                    start = i + 1;
                }
                Fragment::Token(Tok { token, loc }) => match token {
                    Token::LeftParen | Token::LeftBracket => depth += 1,
                    Token::RightParen | Token::RightBracket => depth = depth.saturating_sub(1),
                    Token::Semicolon if depth == 0 => {
                        out.extend(self.statement(&frags[start..=i])?);
                        start = i + 1;
                    }
                    Token::LeftBrace | Token::RightBrace => {
                        if find_nonuniform(&frags[start..i]).is_some() {
                            bail_unsupported!(
                                self.unit.target,
                                "NonUniformResourceIndex",
                                "non-uniform indexing in a control-flow header at {} needs descriptor indexing",
                                loc
                            );
                        }
                        out.extend(self.pieces(&frags[start..=i])?);
                        start = i + 1;
                    }
                    _ => {}
                },
                _ => {}
            }
        }
        out.extend(self.statement(&frags[start..])?);
        Ok(out)
    }

    fn statement(&mut self, stmt: &[Fragment]) -> Result<Vec<Piece>> {
        match find_nonuniform(stmt) {
            Some((resource, index, loc)) => self.scan_statement(stmt, resource, index, loc),
            None => self.pieces(stmt),
        }
    }

    /// Rewrites a statement that indexes a resource array non-uniformly into a loop
    /// that runs it once with a uniform index equal to the requested one.
    fn scan_statement(
        &mut self,
        stmt: &[Fragment],
        resource: &str,
        index: &[Fragment],
        loc: &SourceLoc,
    ) -> Result<Vec<Piece>> {
        let len = self
            .unit
            .table
            .as_ref()
            .and_then(|t| t.resource(resource))
            .map(|(_, r)| r.array_len)
            .ok_or_else(|| {
                CompilerError::unsupported(
                    self.unit.target,
                    "NonUniformResourceIndex",
                    format!("'{}' at {} is not a resource array", resource, loc),
                )
            })?;
        let var = format!("_nu{}", self.scan_count);
        self.scan_count += 1;
        let index_text = self.expression(index)?;

        let mut pieces = Vec::new();
        let body = match declared_local(stmt, self.unit) {
            Some(name) => {
                let ty = self.expression(&stmt[..1])?;
                pieces.push(Piece::Line(format!("{} {};", ty, name)));
                &stmt[1..]
            }
            None => stmt,
        };
        self.nonuniform_var = Some(var.clone());
        let text = self.expression(body);
        self.nonuniform_var = None;
        let text = text?;

        pieces.push(Piece::Line(format!("for (uint {v} = 0u; {v} < {len}u; ++{v})", v = var, len = len)));
        pieces.push(Piece::LBrace);
        pieces.push(Piece::Line(format!("if ({} == uint({}))", var, index_text)));
        pieces.push(Piece::LBrace);
        pieces.push(Piece::Line(text));
        pieces.push(Piece::RBrace);
        pieces.push(Piece::RBrace);
        Ok(pieces)
    }

    fn pieces(&mut self, frags: &[Fragment]) -> Result<Vec<Piece>> {
        let mut out = Vec::with_capacity(frags.len());
        let mut after_dot = false;
        for frag in frags {
            match frag {
                Fragment::Token(tok) => out.push(self.token_piece(&tok.token, after_dot)),
                Fragment::Call { name, args, loc } => out.push(Piece::Word(self.call(name, args, loc)?)),
                Fragment::InitMain(_) => out.extend(self.dialect.init_main(self.unit)?),
                Fragment::Return { args, .. } => {
                    let value = match args.first() {
                        Some(arg) => Some(self.expression(arg)?),
                        None => None,
                    };
                    out.extend(self.dialect.return_value(self.unit, value.as_deref())?);
                }
                Fragment::Conditional { loc, .. } => {
                    return Err(err_semantic!(&self.unit.name, "unresolved conditional block at {}", loc))
                }
            }
            after_dot = matches!(frag.as_token(), Some(Token::Dot));
        }
        Ok(out)
    }

    fn token_piece(&self, token: &Token, after_dot: bool) -> Piece {
        match token {
            Token::Identifier(name) if after_dot => Piece::Word(name.clone()),
            Token::Identifier(name) => {
                if let Some((frequency, resource)) = self.unit.table.as_ref().and_then(|t| t.resource(name)) {
                    return Piece::Word(self.dialect.resource_ref(resource, frequency, self.scope));
                }
                if let Some(ty) = DataType::builtin(name) {
                    return Piece::Word(self.dialect.type_name(&ty));
                }
                Piece::Word(self.dialect.identifier(name).unwrap_or_else(|| name.clone()))
            }
            Token::FloatLiteral(text) => Piece::Word(self.dialect.float_literal(text)),
            Token::Op(op) => Piece::Op(op.clone()),
            Token::LeftParen => Piece::Open('('),
            Token::RightParen => Piece::Close(')'),
            Token::LeftBracket => Piece::Open('['),
            Token::RightBracket => Piece::Close(']'),
            Token::LeftBrace => Piece::LBrace,
            Token::RightBrace => Piece::RBrace,
            Token::Comma => Piece::Comma,
            Token::Semicolon => Piece::Semi,
            Token::Colon => Piece::Colon,
            Token::Dot => Piece::Dot,
            other => Piece::Word(other.to_string()),
        }
    }

    fn call(&mut self, name: &str, raw: &[Vec<Fragment>], loc: &SourceLoc) -> Result<String> {
        if name == "NonUniformResourceIndex" {
            if let Some(var) = &self.nonuniform_var {
                return Ok(var.clone());
            }
        }
        let args = raw.iter().map(|a| self.expression(a)).collect::<Result<Vec<_>>>()?;

        if let Some(helper) = self.unit.helper(name) {
            let mut all = args;
            all.extend(self.dialect.helper_args(self.unit, helper, self.scope));
            return Ok(format!("{}({})", name, all.join(", ")));
        }
        if let Some(intrinsic) = classify(name) {
            let arity = intrinsic.arity();
            if !arity.is_empty() && !arity.contains(&args.len()) {
                return Err(err_semantic!(
                    &self.unit.name,
                    "'{}' at {} takes {} arguments, got {}",
                    name,
                    loc,
                    arity.iter().map(|n| n.to_string()).collect::<Vec<_>>().join(" or "),
                    args.len()
                ));
            }
            return self.intrinsic(name, intrinsic, args, raw, loc);
        }
        if let Some(ty) = DataType::builtin(name) {
            return Ok(format!("{}({})", self.dialect.type_name(&ty), args.join(", ")));
        }
        Ok(format!("{}({})", name, args.join(", ")))
    }

    fn intrinsic(
        &self,
        name: &str,
        intrinsic: Intrinsic,
        args: Vec<String>,
        raw: &[Vec<Fragment>],
        loc: &SourceLoc,
    ) -> Result<String> {
        let target = self.unit.target;
        let columns_first = self.dialect.constructor_takes_columns();
        Ok(match intrinsic {
            Intrinsic::Mapped(spellings) => apply_mapped(spellings[target_slot(target)], &args),
            Intrinsic::UnknownWave if target == Target::Direct3D12 => format!("{}({})", name, args.join(", ")),
            Intrinsic::UnknownWave => bail_unsupported!(target, name, "no {} equivalent (at {})", target, loc),
            Intrinsic::NonUniformIndex => self.dialect.nonuniform_index(&args[0]),
            Intrinsic::MakeMatrix { size, columns } => {
                let ty = self.dialect.type_name(&DataType::Matrix {
                    scalar: ScalarKind::Float,
                    columns: size,
                    rows: size,
                });
                let ctor = format!("{}({})", ty, args.join(", "));
                if columns == columns_first {
                    ctor
                } else {
                    format!("transpose({})", ctor)
                }
            }
            Intrinsic::GetCol if columns_first => format!("{}[{}]", args[0], args[1]),
            Intrinsic::GetCol => format!("transpose({})[{}]", args[0], args[1]),
            Intrinsic::GetRow if columns_first => format!("transpose({})[{}]", args[0], args[1]),
            Intrinsic::GetRow => format!("{}[{}]", args[0], args[1]),
            Intrinsic::GetElem if columns_first => format!("{}[{}][{}]", args[0], args[1], args[2]),
            Intrinsic::GetElem => format!("{}[{}][{}]", args[0], args[2], args[1]),
            Intrinsic::Mul if target == Target::Direct3D12 => format!("mul({}, {})", args[0], args[1]),
            Intrinsic::Mul => format!("({} * {})", args[0], args[1]),
            _ => self.dialect.intrinsic(&CallSite {
                name,
                intrinsic,
                args,
                raw,
                loc,
                unit: self.unit,
            })?,
        })
    }
}

/// Finds `res[NonUniformResourceIndex(i)]`, returning the resource and the index expression.
fn find_nonuniform(frags: &[Fragment]) -> Option<(&str, &[Fragment], &SourceLoc)> {
    for (k, frag) in frags.iter().enumerate() {
        match frag {
            Fragment::Call { name, args, loc } if name == "NonUniformResourceIndex" => {
                let indexed = k >= 2 && matches!(frags[k - 1].as_token(), Some(Token::LeftBracket));
                if let (true, Some(resource), Some(index)) = (indexed, frags[k.saturating_sub(2)].ident(), args.first()) {
                    return Some((resource, index, loc));
                }
            }
            Fragment::Call { args, .. } | Fragment::Return { args, .. } => {
                if let Some(found) = args.iter().find_map(|a| find_nonuniform(a)) {
                    return Some(found);
                }
            }
            _ => {}
        }
    }
    None
}

/// `Type name = ...;` declares `name`; returns it so the declaration can be hoisted.
fn declared_local<'f>(stmt: &'f [Fragment], unit: &LoweredUnit) -> Option<&'f str> {
    let ty = stmt.first()?.ident()?;
    let name = stmt.get(1)?.ident()?;
    let assigns = matches!(stmt.get(2).and_then(Fragment::as_token), Some(t) if t.is_op("="));
    let is_type = DataType::builtin(ty).is_some() || unit.find_struct(ty).is_some();
    (assigns && is_type).then_some(name)
}

/// Names of every call made by the entry point and its helpers.
pub(crate) fn called_names(unit: &LoweredUnit) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    for func in unit.helpers.iter().chain(std::iter::once(&unit.entry)) {
        for frag in &func.func.body {
            frag.walk(&mut |f| {
                if let Fragment::Call { name, .. } = f {
                    names.insert(name.clone());
                }
            });
        }
    }
    names
}

/// Splits leading storage qualifiers off a global declaration.
pub(crate) fn split_qualifiers(frags: &[Fragment]) -> (Vec<&str>, &[Fragment]) {
    let mut qualifiers = Vec::new();
    let mut rest = frags;
    while let Some(word @ ("static" | "const" | "groupshared" | "uniform")) = rest.first().and_then(Fragment::ident) {
        qualifiers.push(word);
        rest = &rest[1..];
    }
    (qualifiers, rest)
}

/// `[N]` suffix for array declarations.
pub(crate) fn array_suffix(len: Option<u32>) -> String {
    len.map(|n| format!("[{}]", n)).unwrap_or_default()
}

pub(crate) fn header_comment(unit: &LoweredUnit) -> String {
    let flags = unit.flags.label();
    format!(
        "// {} ({} {} shader{}{}). Generated file, do not edit.\n",
        unit.name,
        unit.target,
        unit.stage,
        if flags.is_empty() { "" } else { ", " },
        flags
    )
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::lowering::{lower, output_decls, LoweredUnit, LoweringOptions};
    use crate::parser::Parser;
    use crate::resolver::resolve_program;
    use crate::source::SourceLoader;
    use crate::target::Target;

    pub const TABLE: &str = "
STRUCT(VSInput)
{
    DATA(float3, position, POSITION);
    DATA(float2, uv, TEXCOORD0);
};
STRUCT(VSOutput)
{
    DATA(float4, position, SV_Position);
    DATA(float2, uv, TEXCOORD0);
};
BEGIN_SRT(SrtData)
    BEGIN_SRT_SET(Persistent)
        DECL_TEXTURE(Persistent, Tex2D(float4), uTextures[4])
        DECL_TEXTURE(Persistent, Tex2D(float), uShadow)
        DECL_SAMPLER(Persistent, SamplerState, uSampler0)
        DECL_SAMPLER(Persistent, SamplerComparisonState, uShadowSampler)
    END_SRT_SET(Persistent)
    BEGIN_SRT_SET(PerFrame)
        DECL_CBUFFER(PerFrame, CBUFFER(float4x4), camera)
        DECL_RWBUFFER(PerFrame, RWBuffer(atomic_uint), counters)
        DECL_RWTEXTURE(PerFrame, RWTex2D(float4), uOutput)
    END_SRT_SET(PerFrame)
END_SRT(SrtData)
";

    pub const VERTEX: &str = "
#vert basic
VSOutput VS_MAIN(VSInput input, SV_VertexID(uint) vid)
{
    INIT_MAIN;
    VSOutput o;
    o.position = mul(camera, float4(input.position, 1.0));
    o.uv = input.uv;
    RETURN(o);
}
#end
";

    pub const PIXEL: &str = "
float4 tint(float4 c, inout(float) weight)
{
    weight = saturate(weight);
    return lerp(c, Sample(uTextures[0], uSampler0, float2(0.5, 0.5)), weight);
}
#frag lit
float4 PS_MAIN(VSOutput input, SV_PrimitiveID(uint) prim)
{
    INIT_MAIN;
    float w = 0.25;
    float4 c = Sample(uTextures[NonUniformResourceIndex(prim)], uSampler0, input.uv);
    float s = SampleCmp(uShadow, uShadowSampler, input.uv, 0.5);
    RETURN(tint(c, w) * s);
}
#end
";

    pub const COMPUTE: &str = "
#comp count
NUM_THREADS(8, 8, 1)
void CS_MAIN(SV_DispatchThreadID(uint3) id)
{
    INIT_MAIN;
    uint before;
    AtomicAdd(counters[0], 1, before);
    float4x4 m = make_f4x4_cols(float4(1, 0, 0, 0), float4(0, 1, 0, 0), float4(0, 0, 1, 0), float4(0, 0, 0, 1));
    StoreRw(uOutput, id.xy, getCol(m, 0) * float(before));
    RETURN();
}
#end
";

    pub fn lower_source(source: &str, target: Target) -> crate::error::Result<LoweredUnit> {
        let loaded = SourceLoader::default().load_str("test.fsl", source, None)?;
        let program = Parser::new(loaded.tokens, loaded.name).parse()?;
        let resolved = resolve_program(&program)?;
        let outputs = output_decls(&program, "test")?;
        lower(&program, &resolved, &outputs[0], target, &LoweringOptions::default())
    }

    pub fn with_flag(source: &str, flag: &str) -> String {
        source.replacen("#frag lit", &format!("#frag {} lit", flag), 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(classify("Sample"), Some(Intrinsic::Sample));
        assert_eq!(classify("AtomicCompareExchange"), Some(Intrinsic::Atomic(AtomicOp::CompareExchange)));
        assert_eq!(
            classify("make_f3x3_rows"),
            Some(Intrinsic::MakeMatrix {
                size: 3,
                columns: false
            })
        );
        assert_eq!(classify("make_f3x4_rows"), None);
        assert_eq!(classify("WaveActiveCountBits"), Some(Intrinsic::UnknownWave));
        assert_eq!(classify("normalize"), None);
    }

    #[test]
    fn test_mapped_templates() {
        let args = vec!["a".to_string(), "b".to_string()];
        assert_eq!(apply_mapped("mix", &args), "mix(a, b)");
        assert_eq!(apply_mapped("($0 - $1 * trunc($0 / $1))", &args), "(a - b * trunc(a / b))");
        assert_eq!(apply_mapped("barrier()", &[]), "barrier()");
    }

    #[test]
    fn test_layout() {
        let mut layout = Layout::new(1);
        for piece in [
            Piece::Word("for".into()),
            Piece::Open('('),
            Piece::Word("int".into()),
            Piece::Word("i".into()),
            Piece::Op("=".into()),
            Piece::Word("0".into()),
            Piece::Semi,
            Piece::Word("i".into()),
            Piece::Op("<".into()),
            Piece::Word("4".into()),
            Piece::Semi,
            Piece::Op("++".into()),
            Piece::Word("i".into()),
            Piece::Close(')'),
            Piece::LBrace,
            Piece::Word("x".into()),
            Piece::Op("+=".into()),
            Piece::Word("a".into()),
            Piece::Open('['),
            Piece::Word("i".into()),
            Piece::Close(']'),
            Piece::Dot,
            Piece::Word("y".into()),
            Piece::Semi,
            Piece::RBrace,
        ] {
            layout.push(piece);
        }
        assert_eq!(
            layout.finish(),
            "    for(int i = 0; i < 4; ++ i)\n    {\n        x += a[i].y;\n    }\n"
        );
    }
}
