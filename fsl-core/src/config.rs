//! `fsl.toml` project configuration.
//!
//! ```toml
//! [build]
//! targets = ["direct3d12", "vulkan", "metal"]
//! include_paths = ["shaders/include"]
//! out_dir = "build/shaders"
//! workers = 8
//! incremental = true
//!
//! [build.toolchain.metal]
//! argument_buffers = true
//!
//! [reload]
//! port = 6543
//! ```
//!
//! Relative paths are resolved against the directory holding the file.

use crate::backend::GeneratorOptions;
use crate::error::{CompilerError, Result};
use crate::lowering::LoweringOptions;
use crate::target::Target;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const DEFAULT_RELOAD_PORT: u16 = 6543;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProjectConfig {
    pub build: BuildConfig,
    pub reload: ReloadConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildConfig {
    pub targets: Vec<Target>,
    pub include_paths: Vec<PathBuf>,
    pub out_dir: PathBuf,
    /// Defaults to `<out_dir>/.fslcache`.
    pub cache_dir: Option<PathBuf>,
    /// Worker threads; 0 uses the available parallelism.
    pub workers: usize,
    pub incremental: bool,
    /// Run the native compilers. When off, containers carry generated source.
    pub compile: bool,
    pub graphics_root_signature: String,
    pub compute_root_signature: String,
    pub toolchain: BTreeMap<Target, TargetOptions>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        let lowering = LoweringOptions::default();
        BuildConfig {
            targets: Target::ALL.to_vec(),
            include_paths: Vec::new(),
            out_dir: PathBuf::from("out"),
            cache_dir: None,
            workers: 0,
            incremental: false,
            compile: true,
            graphics_root_signature: lowering.graphics_root_signature,
            compute_root_signature: lowering.compute_root_signature,
            toolchain: BTreeMap::new(),
        }
    }
}

/// Per-target generator and compiler settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TargetOptions {
    /// Path to the native compiler; otherwise the environment and `PATH` are searched.
    pub compiler: Option<PathBuf>,
    pub descriptor_indexing: bool,
    pub argument_buffers: bool,
    pub shader_model: Option<String>,
    pub extra_args: Vec<String>,
}

impl Default for TargetOptions {
    fn default() -> Self {
        TargetOptions {
            compiler: None,
            descriptor_indexing: true,
            argument_buffers: false,
            shader_model: None,
            extra_args: Vec::new(),
        }
    }
}

impl TargetOptions {
    pub fn generator_options(&self) -> GeneratorOptions {
        GeneratorOptions {
            descriptor_indexing: self.descriptor_indexing,
            argument_buffers: self.argument_buffers,
            shader_model: self.shader_model.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReloadConfig {
    pub bind: String,
    pub port: u16,
    /// Extra projects the server can build, by name, as paths to their `fsl.toml`.
    pub projects: BTreeMap<String, PathBuf>,
}

impl Default for ReloadConfig {
    fn default() -> Self {
        ReloadConfig {
            bind: "127.0.0.1".to_string(),
            port: DEFAULT_RELOAD_PORT,
            projects: BTreeMap::new(),
        }
    }
}

impl ReloadConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn resolve(base: &Path, path: &mut PathBuf) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

impl ProjectConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| CompilerError::path_io(path, e))?;
        let mut config = Self::parse(&text).map_err(|e| match e {
            CompilerError::Config(message) => CompilerError::Config(format!("{}: {}", path.display(), message)),
            other => other,
        })?;
        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        Ok(config)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let config: ProjectConfig = toml::from_str(text).map_err(|e| CompilerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.build.targets.is_empty() {
            return Err(CompilerError::Config("build.targets must name at least one target".into()));
        }
        for name in [&self.build.graphics_root_signature, &self.build.compute_root_signature] {
            if name.trim().is_empty() {
                return Err(CompilerError::Config("root signature names must not be empty".into()));
            }
        }
        Ok(())
    }

    pub fn resolve_paths(&mut self, base: &Path) {
        let build = &mut self.build;
        resolve(base, &mut build.out_dir);
        for path in &mut build.include_paths {
            resolve(base, path);
        }
        if let Some(cache) = &mut build.cache_dir {
            resolve(base, cache);
        }
        for options in build.toolchain.values_mut() {
            if let Some(compiler) = &mut options.compiler {
                // Bare program names are looked up on PATH, not next to the config.
                if compiler.components().count() > 1 {
                    resolve(base, compiler);
                }
            }
        }
        for path in self.reload.projects.values_mut() {
            resolve(base, path);
        }
    }
}

impl BuildConfig {
    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(|| self.out_dir.join(".fslcache"))
    }

    pub fn workers(&self) -> usize {
        match self.workers {
            0 => std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            n => n,
        }
    }

    pub fn target_options(&self, target: Target) -> TargetOptions {
        self.toolchain.get(&target).cloned().unwrap_or_default()
    }

    pub fn lowering_options(&self) -> LoweringOptions {
        LoweringOptions {
            graphics_root_signature: self.graphics_root_signature.clone(),
            compute_root_signature: self.compute_root_signature.clone(),
        }
    }

    /// Everything that changes generated output, as one string for the cache key.
    /// Worker count and the incremental switch do not.
    pub fn invocation_arguments(&self) -> String {
        let key = serde_json::json!({
            "targets": self.targets,
            "include_paths": self.include_paths,
            "out_dir": self.out_dir,
            "compile": self.compile,
            "graphics_root_signature": self.graphics_root_signature,
            "compute_root_signature": self.compute_root_signature,
            "toolchain": self.targets.iter().map(|t| (t.name(), self.target_options(*t))).collect::<BTreeMap<_, _>>(),
            "version": env!("CARGO_PKG_VERSION"),
        });
        key.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ProjectConfig::parse("").unwrap();
        assert_eq!(config.build.targets, Target::ALL.to_vec());
        assert_eq!(config.reload.port, DEFAULT_RELOAD_PORT);
        assert!(config.build.compile);
        assert!(config.build.target_options(Target::Vulkan).descriptor_indexing);
        assert_eq!(config.build.cache_dir(), PathBuf::from("out/.fslcache"));
    }

    #[test]
    fn test_parse_and_resolve() {
        let text = r#"
[build]
targets = ["vulkan", "metal"]
include_paths = ["include", "/abs/include"]
out_dir = "build"
workers = 3

[build.toolchain.metal]
argument_buffers = true
compiler = "tools/xcrun"

[build.toolchain.vulkan]
compiler = "glslangValidator"

[reload]
port = 7000
"#;
        let mut config = ProjectConfig::parse(text).unwrap();
        config.resolve_paths(Path::new("/proj"));
        let build = &config.build;
        assert_eq!(build.targets, vec![Target::Vulkan, Target::Metal]);
        assert_eq!(build.include_paths, vec![PathBuf::from("/proj/include"), PathBuf::from("/abs/include")]);
        assert_eq!(build.out_dir, PathBuf::from("/proj/build"));
        assert_eq!(build.workers(), 3);
        assert!(build.target_options(Target::Metal).argument_buffers);
        assert_eq!(build.target_options(Target::Metal).compiler, Some(PathBuf::from("/proj/tools/xcrun")));
        assert_eq!(build.target_options(Target::Vulkan).compiler, Some(PathBuf::from("glslangValidator")));
        assert_eq!(config.reload.address(), "127.0.0.1:7000");
    }

    #[test]
    fn test_rejects_unknown_keys_and_targets() {
        assert!(matches!(ProjectConfig::parse("[build]\nworkerz = 2\n"), Err(CompilerError::Config(_))));
        assert!(matches!(ProjectConfig::parse("[build]\ntargets = [\"gl\"]\n"), Err(CompilerError::Config(_))));
        assert!(matches!(ProjectConfig::parse("[build]\ntargets = []\n"), Err(CompilerError::Config(_))));
    }

    #[test]
    fn test_arguments_ignore_worker_count() {
        let mut a = BuildConfig::default();
        let mut b = BuildConfig::default();
        a.workers = 1;
        b.workers = 16;
        assert_eq!(a.invocation_arguments(), b.invocation_arguments());
        b.toolchain.insert(
            Target::Metal,
            TargetOptions {
                argument_buffers: true,
                ..TargetOptions::default()
            },
        );
        assert_ne!(a.invocation_arguments(), b.invocation_arguments());
    }
}
