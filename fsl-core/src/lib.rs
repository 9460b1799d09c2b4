pub mod error;

pub mod artifacts;
pub mod ast;
pub mod backend;
pub mod cache;
pub mod config;
pub mod driver;
pub mod lexer;
pub mod lowering;
pub mod parser;
pub mod reload;
pub mod resolver;
pub mod source;
pub mod target;
pub mod toolchain;
pub mod variant;

use ast::Program;
use backend::{GeneratedShader, GeneratorOptions};
use error::Result;
use lowering::{LoweringOptions, OutputDecl};
use resolver::ResolvedProgram;
use source::{LoadedSource, SourceLoader};
use std::path::{Path, PathBuf};
use target::Target;

/// A parsed and resolved input file.
#[derive(Debug)]
pub struct ParsedFile {
    pub source: LoadedSource,
    pub program: Program,
    pub resolved: ResolvedProgram,
    /// Output name for files without shader blocks.
    pub default_name: String,
}

impl ParsedFile {
    pub fn outputs(&self) -> Result<Vec<OutputDecl<'_>>> {
        lowering::output_decls(&self.program, &self.default_name)
    }
}

/// Front-to-back translation of single files, without the build driver's
/// scheduling, caching or artifact layout.
#[derive(Debug, Clone, Default)]
pub struct Compiler {
    loader: SourceLoader,
    lowering: LoweringOptions,
}

impl Compiler {
    pub fn new(include_paths: Vec<PathBuf>, lowering: LoweringOptions) -> Self {
        Compiler {
            loader: SourceLoader::new(include_paths),
            lowering,
        }
    }

    pub fn parse_file(&self, path: &Path) -> Result<ParsedFile> {
        let source = self.loader.load(path)?;
        let default_name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "shader".to_string());
        self.finish(source, default_name)
    }

    pub fn parse_str(&self, name: &str, text: &str) -> Result<ParsedFile> {
        let source = self.loader.load_str(name, text, None)?;
        let default_name = Path::new(name)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| name.to_string());
        self.finish(source, default_name)
    }

    fn finish(&self, source: LoadedSource, default_name: String) -> Result<ParsedFile> {
        let program = parser::Parser::new(source.tokens.clone(), source.name.clone()).parse()?;
        let resolved = resolver::resolve_program(&program)?;
        Ok(ParsedFile {
            source,
            program,
            resolved,
            default_name,
        })
    }

    /// Lowers one output for `target` and generates its source.
    pub fn translate(
        &self,
        parsed: &ParsedFile,
        output: &OutputDecl<'_>,
        target: Target,
        options: &GeneratorOptions,
    ) -> Result<GeneratedShader> {
        let unit = lowering::lower(&parsed.program, &parsed.resolved, output, target, &self.lowering)?;
        backend::generate(&unit, options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translate_blockless_file() {
        let compiler = Compiler::default();
        let parsed = compiler
            .parse_str(
                "blit.fsl",
                "float4 PS_MAIN(SV_Position(float4) pos) { INIT_MAIN; RETURN(float4(pos.xy, 0, 1)); }",
            )
            .unwrap();
        let outputs = parsed.outputs().unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].name, "blit");
        for target in Target::ALL {
            let shader = compiler
                .translate(&parsed, &outputs[0], target, &GeneratorOptions::default())
                .unwrap();
            assert_eq!(shader.metadata.target, target);
            assert!(!shader.source.is_empty());
        }
    }

    #[test]
    fn test_blockless_file_with_two_stages() {
        let source = "
STRUCT(VSOutput)
{
    DATA(float4, position, SV_Position);
    DATA(float2, uv, TEXCOORD0);
};
VSOutput VS_MAIN(SV_VertexID(uint) vid)
{
    INIT_MAIN;
    VSOutput o;
    o.uv = float2(float(vid), 0.5);
    o.position = float4(o.uv, 0, 1);
    RETURN(o);
}
float4 PS_MAIN(VSOutput input)
{
    INIT_MAIN;
    RETURN(float4(input.uv, 0, 1));
}
";
        let compiler = Compiler::default();
        let parsed = compiler.parse_str("basic.fsl", source).unwrap();
        let outputs = parsed.outputs().unwrap();
        let names: Vec<&str> = outputs.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, vec!["basic_vert", "basic_frag"]);
        for target in Target::ALL {
            for output in &outputs {
                let shader = compiler
                    .translate(&parsed, output, target, &GeneratorOptions::default())
                    .unwrap_or_else(|e| panic!("{} ({}): {}", output.name, target, e));
                assert_eq!(shader.metadata.stage, output.stage);
            }
        }
    }
}
