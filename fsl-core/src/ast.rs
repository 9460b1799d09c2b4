//! Typed intermediate representation produced by the parser.

use crate::lexer::Token;
use crate::variant::FeatureFlags;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// File and line a construct was read from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceLoc {
    pub file: Arc<str>,
    pub line: u32,
}

impl SourceLoc {
    pub fn new(file: impl Into<Arc<str>>, line: u32) -> Self {
        SourceLoc {
            file: file.into(),
            line,
        }
    }
}

impl fmt::Display for SourceLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// A token tagged with where it came from (after include splicing).
#[derive(Debug, Clone, PartialEq)]
pub struct Tok {
    pub token: Token,
    pub loc: SourceLoc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalarKind {
    Float,
    Half,
    Int,
    Uint,
    Bool,
    AtomicInt,
    AtomicUint,
}

impl ScalarKind {
    fn from_prefix(name: &str) -> Option<(ScalarKind, &str)> {
        // Longest prefixes first so "uint" is not read as "int".
        const PREFIXES: [(&str, ScalarKind); 5] = [
            ("float", ScalarKind::Float),
            ("half", ScalarKind::Half),
            ("uint", ScalarKind::Uint),
            ("int", ScalarKind::Int),
            ("bool", ScalarKind::Bool),
        ];
        PREFIXES
            .iter()
            .find_map(|(prefix, kind)| name.strip_prefix(prefix).map(|rest| (*kind, rest)))
    }

    pub fn hlsl_name(self) -> &'static str {
        match self {
            ScalarKind::Float => "float",
            ScalarKind::Half => "half",
            ScalarKind::Int | ScalarKind::AtomicInt => "int",
            ScalarKind::Uint | ScalarKind::AtomicUint => "uint",
            ScalarKind::Bool => "bool",
        }
    }
}

/// Value types of the dialect. Matrices are `floatCxR`: C columns of R-component vectors.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum DataType {
    Void,
    Scalar(ScalarKind),
    Vector(ScalarKind, u8),
    Matrix { scalar: ScalarKind, columns: u8, rows: u8 },
    Struct(String),
}

impl DataType {
    /// Parses a built-in type name; returns `None` for anything else.
    pub fn builtin(name: &str) -> Option<DataType> {
        match name {
            "void" => return Some(DataType::Void),
            "atomic_uint" => return Some(DataType::Scalar(ScalarKind::AtomicUint)),
            "atomic_int" => return Some(DataType::Scalar(ScalarKind::AtomicInt)),
            _ => {}
        }
        let (scalar, rest) = ScalarKind::from_prefix(name)?;
        let dim = |c: u8| (b'2'..=b'4').contains(&c).then_some(c - b'0');
        match rest.as_bytes() {
            [] => Some(DataType::Scalar(scalar)),
            [n] => dim(*n).map(|n| DataType::Vector(scalar, n)),
            [c, b'x', r] => {
                if matches!(scalar, ScalarKind::Float | ScalarKind::Half) {
                    Some(DataType::Matrix {
                        scalar,
                        columns: dim(*c)?,
                        rows: dim(*r)?,
                    })
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Resolves a type name as written in source: built-in or user struct.
    pub fn from_name(name: &str) -> DataType {
        DataType::builtin(name).unwrap_or_else(|| DataType::Struct(name.to_string()))
    }

    pub fn is_void(&self) -> bool {
        matches!(self, DataType::Void)
    }

    pub fn is_atomic(&self) -> bool {
        matches!(
            self,
            DataType::Scalar(ScalarKind::AtomicInt | ScalarKind::AtomicUint)
        )
    }

    pub fn scalar(&self) -> Option<ScalarKind> {
        match self {
            DataType::Scalar(s) | DataType::Vector(s, _) => Some(*s),
            DataType::Matrix { scalar, .. } => Some(*scalar),
            _ => None,
        }
    }

    pub fn components(&self) -> u8 {
        match self {
            DataType::Vector(_, n) => *n,
            _ => 1,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Void => f.write_str("void"),
            DataType::Scalar(ScalarKind::AtomicUint) => f.write_str("atomic_uint"),
            DataType::Scalar(ScalarKind::AtomicInt) => f.write_str("atomic_int"),
            DataType::Scalar(s) => f.write_str(s.hlsl_name()),
            DataType::Vector(s, n) => write!(f, "{}{}", s.hlsl_name(), n),
            DataType::Matrix {
                scalar,
                columns,
                rows,
            } => write!(f, "{}{}x{}", scalar.hlsl_name(), columns, rows),
            DataType::Struct(name) => f.write_str(name),
        }
    }
}

/// Update-frequency classes; the ordinal is the set/space/argument-buffer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Frequency {
    Persistent,
    PerFrame,
    PerBatch,
    PerDraw,
}

impl Frequency {
    pub const ALL: [Frequency; 4] = [
        Frequency::Persistent,
        Frequency::PerFrame,
        Frequency::PerBatch,
        Frequency::PerDraw,
    ];

    pub fn index(self) -> u32 {
        self as u32
    }

    pub fn name(self) -> &'static str {
        match self {
            Frequency::Persistent => "Persistent",
            Frequency::PerFrame => "PerFrame",
            Frequency::PerBatch => "PerBatch",
            Frequency::PerDraw => "PerDraw",
        }
    }

    pub fn from_name(name: &str) -> Option<Frequency> {
        Frequency::ALL.into_iter().find(|f| f.name() == name)
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TextureDim {
    Tex1D,
    Tex2D,
    Tex2DArray,
    Tex2DMS,
    Tex3D,
    TexCube,
}

impl TextureDim {
    pub fn from_name(name: &str) -> Option<(TextureDim, bool)> {
        let (rw, base) = match name.strip_prefix("RW") {
            Some(rest) => (true, rest),
            None => (false, name),
        };
        let dim = match base {
            "Tex1D" => TextureDim::Tex1D,
            "Tex2D" => TextureDim::Tex2D,
            "Tex2DArray" => TextureDim::Tex2DArray,
            "Tex2DMS" => TextureDim::Tex2DMS,
            "Tex3D" => TextureDim::Tex3D,
            "TexCube" => TextureDim::TexCube,
            _ => return None,
        };
        Some((dim, rw))
    }

    /// Number of integer components addressing a texel (without mip level).
    pub fn texel_coord_components(self) -> u8 {
        match self {
            TextureDim::Tex1D => 1,
            TextureDim::Tex2D | TextureDim::Tex2DMS => 2,
            TextureDim::Tex2DArray | TextureDim::Tex3D | TextureDim::TexCube => 3,
        }
    }
}

/// Kind of a bindable resource, with its element type where it has one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum ResourceKind {
    Sampler { comparison: bool },
    Texture { dim: TextureDim, elem: DataType },
    RwTexture { dim: TextureDim, elem: DataType },
    Buffer { elem: DataType },
    RwBuffer { elem: DataType },
    ConstantBuffer { elem: DataType },
}

impl ResourceKind {
    pub fn is_read_write(&self) -> bool {
        matches!(self, ResourceKind::RwTexture { .. } | ResourceKind::RwBuffer { .. })
    }

    pub fn is_sampler(&self) -> bool {
        matches!(self, ResourceKind::Sampler { .. })
    }

    pub fn texture_dim(&self) -> Option<TextureDim> {
        match self {
            ResourceKind::Texture { dim, .. } | ResourceKind::RwTexture { dim, .. } => Some(*dim),
            _ => None,
        }
    }

    pub fn elem(&self) -> Option<&DataType> {
        match self {
            ResourceKind::Sampler { .. } => None,
            ResourceKind::Texture { elem, .. }
            | ResourceKind::RwTexture { elem, .. }
            | ResourceKind::Buffer { elem }
            | ResourceKind::RwBuffer { elem }
            | ResourceKind::ConstantBuffer { elem } => Some(elem),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ResourceKind::Sampler { .. } => "sampler",
            ResourceKind::Texture { .. } => "texture",
            ResourceKind::RwTexture { .. } => "rw-texture",
            ResourceKind::Buffer { .. } => "buffer",
            ResourceKind::RwBuffer { .. } => "rw-buffer",
            ResourceKind::ConstantBuffer { .. } => "constant-buffer",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResourceDecl {
    pub name: String,
    pub kind: ResourceKind,
    /// 1 for scalar declarations.
    pub array_len: u32,
    /// Frequency named by the DECL_ marker itself.
    pub frequency: Frequency,
    pub loc: SourceLoc,
}

#[derive(Debug, Clone)]
pub struct SetBlock {
    pub frequency: Frequency,
    pub decls: Vec<ResourceDecl>,
    pub loc: SourceLoc,
}

/// A set fragment declared outside any table, shared by name.
#[derive(Debug, Clone)]
pub struct SharedSet {
    pub name: String,
    pub set: SetBlock,
}

#[derive(Debug, Clone)]
pub enum SetSource {
    Local(SetBlock),
    Shared { fragment: String, loc: SourceLoc },
}

#[derive(Debug, Clone)]
pub struct SrtDecl {
    pub name: String,
    pub sets: Vec<SetSource>,
    pub loc: SourceLoc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SystemValue {
    Position,
    Target(u8),
    Depth,
    VertexId,
    InstanceId,
    PrimitiveId,
    IsFrontFace,
    ViewId,
    DispatchThreadId,
    GroupThreadId,
    GroupId,
    GroupIndex,
}

impl SystemValue {
    /// Parses an `SV_` semantic case-insensitively.
    pub fn parse(semantic: &str) -> Option<SystemValue> {
        let upper = semantic.to_ascii_uppercase();
        let sv = upper.strip_prefix("SV_")?;
        if let Some(index) = sv.strip_prefix("TARGET") {
            return if index.is_empty() {
                Some(SystemValue::Target(0))
            } else {
                index.parse().ok().map(SystemValue::Target)
            };
        }
        Some(match sv {
            "POSITION" => SystemValue::Position,
            "DEPTH" => SystemValue::Depth,
            "VERTEXID" => SystemValue::VertexId,
            "INSTANCEID" => SystemValue::InstanceId,
            "PRIMITIVEID" => SystemValue::PrimitiveId,
            "ISFRONTFACE" => SystemValue::IsFrontFace,
            "VIEWID" => SystemValue::ViewId,
            "DISPATCHTHREADID" => SystemValue::DispatchThreadId,
            "GROUPTHREADID" => SystemValue::GroupThreadId,
            "GROUPID" => SystemValue::GroupId,
            "GROUPINDEX" => SystemValue::GroupIndex,
            _ => return None,
        })
    }

    pub fn hlsl_semantic(self) -> String {
        match self {
            SystemValue::Position => "SV_Position".into(),
            SystemValue::Target(n) => format!("SV_Target{}", n),
            SystemValue::Depth => "SV_Depth".into(),
            SystemValue::VertexId => "SV_VertexID".into(),
            SystemValue::InstanceId => "SV_InstanceID".into(),
            SystemValue::PrimitiveId => "SV_PrimitiveID".into(),
            SystemValue::IsFrontFace => "SV_IsFrontFace".into(),
            SystemValue::ViewId => "SV_ViewID".into(),
            SystemValue::DispatchThreadId => "SV_DispatchThreadID".into(),
            SystemValue::GroupThreadId => "SV_GroupThreadID".into(),
            SystemValue::GroupId => "SV_GroupID".into(),
            SystemValue::GroupIndex => "SV_GroupIndex".into(),
        }
    }
}

/// Semantic attached to a struct field, stored upper-cased.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Semantic(String);

impl Semantic {
    pub fn new(text: &str) -> Self {
        Semantic(text.to_ascii_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn system_value(&self) -> Option<SystemValue> {
        SystemValue::parse(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct Field {
    pub ty: DataType,
    pub name: String,
    pub array_len: Option<u32>,
    pub semantic: Option<Semantic>,
    pub loc: SourceLoc,
}

#[derive(Debug, Clone)]
pub enum StructMember {
    Field(Field),
    Conditional {
        cond: Condition,
        then: Vec<StructMember>,
        otherwise: Vec<StructMember>,
    },
}

#[derive(Debug, Clone)]
pub struct StructDecl {
    pub name: String,
    pub members: Vec<StructMember>,
    pub loc: SourceLoc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Vertex,
    Pixel,
    Compute,
}

impl Stage {
    pub fn from_entry_name(name: &str) -> Option<Stage> {
        match name {
            "VS_MAIN" => Some(Stage::Vertex),
            "PS_MAIN" | "FS_MAIN" => Some(Stage::Pixel),
            "CS_MAIN" => Some(Stage::Compute),
            _ => None,
        }
    }

    pub fn from_block_directive(name: &str) -> Option<Stage> {
        match name {
            "vert" => Some(Stage::Vertex),
            "frag" => Some(Stage::Pixel),
            "comp" => Some(Stage::Compute),
            _ => None,
        }
    }

    pub fn is_graphics(self) -> bool {
        !matches!(self, Stage::Compute)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Vertex => "vertex",
            Stage::Pixel => "pixel",
            Stage::Compute => "compute",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamModifier {
    In,
    Out,
    InOut,
}

#[derive(Debug, Clone)]
pub struct Param {
    pub ty: DataType,
    pub name: String,
    pub array_len: Option<u32>,
    pub modifier: ParamModifier,
    pub system_value: Option<SystemValue>,
    pub loc: SourceLoc,
}

/// Body content: raw tokens with calls and markers lifted into structure.
#[derive(Debug, Clone)]
pub enum Fragment {
    Token(Tok),
    Call {
        name: String,
        args: Vec<Vec<Fragment>>,
        loc: SourceLoc,
    },
    Conditional {
        cond: Condition,
        then: Vec<Fragment>,
        otherwise: Vec<Fragment>,
        loc: SourceLoc,
    },
    InitMain(SourceLoc),
    Return {
        args: Vec<Vec<Fragment>>,
        loc: SourceLoc,
    },
}

impl Fragment {
    pub fn loc(&self) -> &SourceLoc {
        match self {
            Fragment::Token(tok) => &tok.loc,
            Fragment::Call { loc, .. }
            | Fragment::Conditional { loc, .. }
            | Fragment::Return { loc, .. }
            | Fragment::InitMain(loc) => loc,
        }
    }

    pub fn as_token(&self) -> Option<&Token> {
        match self {
            Fragment::Token(tok) => Some(&tok.token),
            _ => None,
        }
    }

    pub fn ident(&self) -> Option<&str> {
        match self.as_token() {
            Some(Token::Identifier(name)) => Some(name),
            _ => None,
        }
    }

    /// Visits this fragment and every fragment nested inside it.
    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&'a Fragment)) {
        visit(self);
        match self {
            Fragment::Call { args, .. } | Fragment::Return { args, .. } => {
                for frag in args.iter().flatten() {
                    frag.walk(visit);
                }
            }
            Fragment::Conditional { then, otherwise, .. } => {
                for frag in then.iter().chain(otherwise) {
                    frag.walk(visit);
                }
            }
            Fragment::Token(_) | Fragment::InitMain(_) => {}
        }
    }
}

#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub return_type: DataType,
    pub params: Vec<Param>,
    pub body: Vec<Fragment>,
    pub loc: SourceLoc,
}

#[derive(Debug, Clone)]
pub struct EntryPoint {
    pub stage: Stage,
    pub func: Function,
    pub root_signature: Option<String>,
    pub srt: Option<String>,
    pub num_threads: Option<[u32; 3]>,
}

/// A file-scope declaration such as `static const float PI = 3.14159f;`.
#[derive(Debug, Clone)]
pub struct Global {
    pub frags: Vec<Fragment>,
    pub loc: SourceLoc,
}

/// Boolean condition of `#if`-style blocks over flag and target symbols.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Literal(bool),
    Symbol(String),
    Not(Box<Condition>),
    And(Box<Condition>, Box<Condition>),
    Or(Box<Condition>, Box<Condition>),
}

impl Condition {
    pub fn evaluate(&self, defined: &dyn Fn(&str) -> bool) -> bool {
        match self {
            Condition::Literal(value) => *value,
            Condition::Symbol(name) => defined(name),
            Condition::Not(inner) => !inner.evaluate(defined),
            Condition::And(a, b) => a.evaluate(defined) && b.evaluate(defined),
            Condition::Or(a, b) => a.evaluate(defined) || b.evaluate(defined),
        }
    }
}

/// One `#vert|#frag|#comp [flags] name` ... `#end` binary output declaration.
#[derive(Debug, Clone)]
pub struct ShaderBlock {
    pub stage: Stage,
    pub flags: FeatureFlags,
    pub name: String,
    pub items: Vec<Item>,
    pub loc: SourceLoc,
}

#[derive(Debug, Clone)]
pub enum Item {
    Struct(StructDecl),
    Srt(SrtDecl),
    SharedSet(SharedSet),
    Function(Function),
    EntryPoint(EntryPoint),
    Global(Global),
    Conditional {
        cond: Condition,
        then: Vec<Item>,
        otherwise: Vec<Item>,
        loc: SourceLoc,
    },
    ShaderBlock(ShaderBlock),
}

#[derive(Debug, Clone, Default)]
pub struct Program {
    pub items: Vec<Item>,
}

impl Program {
    pub fn shader_blocks(&self) -> impl Iterator<Item = &ShaderBlock> {
        self.items.iter().filter_map(|item| match item {
            Item::ShaderBlock(block) => Some(block),
            _ => None,
        })
    }

    /// Visits every item, descending into shader blocks and both branches of conditionals.
    pub fn walk_items<'a>(&'a self, visit: &mut dyn FnMut(&'a Item)) {
        fn walk<'a>(items: &'a [Item], visit: &mut dyn FnMut(&'a Item)) {
            for item in items {
                visit(item);
                match item {
                    Item::ShaderBlock(block) => walk(&block.items, visit),
                    Item::Conditional { then, otherwise, .. } => {
                        walk(then, visit);
                        walk(otherwise, visit);
                    }
                    _ => {}
                }
            }
        }
        walk(&self.items, visit);
    }
}
