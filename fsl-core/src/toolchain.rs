//! Native shader compilers (DXC, glslang, the Metal toolchain) run as subprocesses.
//!
//! A tool that cannot be found or started is an environment error and disables
//! its target for the whole batch. A tool that runs and rejects the source is a
//! compiler error for that one file.

use crate::ast::Stage;
use crate::error::{CompilerError, Result};
use crate::target::Target;
use log::debug;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

/// One generated source to compile.
#[derive(Debug, Clone)]
pub struct CompileRequest<'a> {
    /// Label used in error messages, usually `<input>:<output name>`.
    pub label: &'a str,
    pub stage: Stage,
    pub entry: &'a str,
    pub source: &'a str,
    pub shader_model: Option<&'a str>,
    pub extra_args: &'a [String],
}

pub trait ShaderCompiler: Send + Sync {
    fn target(&self) -> Target;
    fn compile(&self, request: &CompileRequest<'_>) -> Result<Vec<u8>>;
}

/// A compiler found on disk.
#[derive(Debug, Clone)]
pub struct NativeCompiler {
    target: Target,
    program: PathBuf,
}

fn default_program(target: Target) -> &'static str {
    match target {
        Target::Direct3D12 => "dxc",
        Target::Vulkan => "glslangValidator",
        Target::Metal => "xcrun",
    }
}

/// Environment variable that overrides the tool location.
pub fn env_var(target: Target) -> &'static str {
    match target {
        Target::Direct3D12 => "FSL_DXC",
        Target::Vulkan => "FSL_GLSLANG",
        Target::Metal => "FSL_XCRUN",
    }
}

fn find_in_path(program: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .flat_map(|dir| {
            let plain = dir.join(program);
            let exe = dir.join(format!("{}.exe", program));
            [plain, exe]
        })
        .find(|candidate| candidate.is_file())
}

fn stage_profile(stage: Stage) -> &'static str {
    match stage {
        Stage::Vertex => "vs",
        Stage::Pixel => "ps",
        Stage::Compute => "cs",
    }
}

fn glslang_stage(stage: Stage) -> &'static str {
    match stage {
        Stage::Vertex => "vert",
        Stage::Pixel => "frag",
        Stage::Compute => "comp",
    }
}

impl NativeCompiler {
    /// Resolves the tool: explicit configuration, then the environment variable, then `PATH`.
    pub fn locate(target: Target, configured: Option<&Path>) -> Result<Self> {
        let program = match configured {
            Some(path) => Some(path.to_path_buf()),
            None => std::env::var_os(env_var(target)).map(PathBuf::from),
        }
        .or_else(|| find_in_path(default_program(target)));

        match program {
            Some(program) if program.is_file() => {
                debug!("{}: using {}", target, program.display());
                Ok(NativeCompiler { target, program })
            }
            Some(program) => Err(CompilerError::Environment {
                target,
                message: format!("'{}' does not exist", program.display()),
            }),
            None => Err(CompilerError::Environment {
                target,
                message: format!(
                    "'{}' not found on PATH (set {} or the toolchain path in fsl.toml)",
                    default_program(target),
                    env_var(target)
                ),
            }),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn run(&self, label: &str, args: &[String]) -> Result<Output> {
        debug!("{}: {} {}", label, self.program.display(), args.join(" "));
        let output = Command::new(&self.program).args(args).output().map_err(|e| match e.kind() {
            ErrorKind::NotFound | ErrorKind::PermissionDenied => CompilerError::Environment {
                target: self.target,
                message: format!("cannot start '{}': {}", self.program.display(), e),
            },
            _ => CompilerError::Io(e),
        })?;
        if output.status.success() {
            return Ok(output);
        }
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Err(CompilerError::Compiler {
            file: label.to_string(),
            target: self.target,
            output: text,
        })
    }
}

impl ShaderCompiler for NativeCompiler {
    fn target(&self) -> Target {
        self.target
    }

    fn compile(&self, request: &CompileRequest<'_>) -> Result<Vec<u8>> {
        let dir = tempfile::Builder::new().prefix("fsl-").tempdir()?;
        let input = dir.path().join(format!("shader.{}", self.target.source_extension()));
        let output = dir.path().join(format!("shader.{}", self.target.binary_extension()));
        std::fs::write(&input, request.source).map_err(|e| CompilerError::path_io(&input, e))?;
        let path = |p: &Path| p.display().to_string();

        match self.target {
            Target::Direct3D12 => {
                let model = request.shader_model.unwrap_or("6_6").replace('.', "_");
                let mut args = vec![
                    "-T".to_string(),
                    format!("{}_{}", stage_profile(request.stage), model),
                    "-E".to_string(),
                    request.entry.to_string(),
                    "-Fo".to_string(),
                    path(&output),
                ];
                args.extend(request.extra_args.iter().cloned());
                args.push(path(&input));
                self.run(request.label, &args)?;
            }
            Target::Vulkan => {
                let mut args = vec![
                    "-V".to_string(),
                    "--target-env".to_string(),
                    "vulkan1.2".to_string(),
                    "-S".to_string(),
                    glslang_stage(request.stage).to_string(),
                    "-o".to_string(),
                    path(&output),
                ];
                args.extend(request.extra_args.iter().cloned());
                args.push(path(&input));
                self.run(request.label, &args)?;
            }
            Target::Metal => {
                let air = dir.path().join("shader.air");
                let mut args = vec![
                    "-sdk".to_string(),
                    "macosx".to_string(),
                    "metal".to_string(),
                    "-c".to_string(),
                    path(&input),
                    "-o".to_string(),
                    path(&air),
                ];
                args.extend(request.extra_args.iter().cloned());
                self.run(request.label, &args)?;
                let link = vec![
                    "-sdk".to_string(),
                    "macosx".to_string(),
                    "metallib".to_string(),
                    path(&air),
                    "-o".to_string(),
                    path(&output),
                ];
                self.run(request.label, &link)?;
            }
        }
        std::fs::read(&output).map_err(|e| CompilerError::path_io(&output, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_configured_tool_is_environment_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("no-such-dxc");
        match NativeCompiler::locate(Target::Direct3D12, Some(&missing)) {
            Err(CompilerError::Environment { target, message }) => {
                assert_eq!(target, Target::Direct3D12);
                assert!(message.contains("no-such-dxc"), "{}", message);
            }
            other => panic!("expected environment error, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_failing_tool_reports_output_verbatim() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-glslang");
        std::fs::write(&script, "#!/bin/sh\necho 'ERROR: 0:3: syntax error'\nexit 2\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let compiler = NativeCompiler::locate(Target::Vulkan, Some(&script)).unwrap();
        let request = CompileRequest {
            label: "lit.fsl:lit",
            stage: Stage::Pixel,
            entry: "main",
            source: "#version 450\nvoid main() {}\n",
            shader_model: None,
            extra_args: &[],
        };
        match compiler.compile(&request) {
            Err(CompilerError::Compiler { file, target, output }) => {
                assert_eq!(file, "lit.fsl:lit");
                assert_eq!(target, Target::Vulkan);
                assert_eq!(output, "ERROR: 0:3: syntax error\n");
            }
            other => panic!("expected compiler error, got {:?}", other),
        }
    }
}
