//! Parallel build driver.
//!
//! Inputs go through a shared queue to a fixed pool of scoped worker threads.
//! Each worker takes one file through every configured target:
//!
//! ```text
//! <out>/<target>/<name>[.<FLAGS>].<hlsl|glsl|metal>   generated source
//! <out>/<target>/<name>[.<FLAGS>].meta.json           generation metadata
//! <out>/<target>/<name>.<dxil|spv|metallib>           binary of a single unflagged output
//! <out>/<target>/<name>.fslv                          variant container otherwise
//! <out>/reflection/<Table>.srt.{json,h}               cross-reference tables
//! ```
//!
//! Scoping of failures: a syntax error stops the file; a failed table stops the
//! outputs using it; unsupported and compiler errors stop one target of one file;
//! a missing toolchain disables its target for the rest of the batch.

use crate::artifacts::{write_locked, OutputLocks};
use crate::backend::GeneratedShader;
use crate::cache::{fingerprint_arguments, fingerprint_files, BuildCache, CacheRow};
use crate::config::{BuildConfig, TargetOptions};
use crate::error::{CompilerError, Result};
use crate::lowering::OutputDecl;
use crate::target::Target;
use crate::toolchain::{CompileRequest, NativeCompiler, ShaderCompiler};
use crate::variant::{FeatureFlags, ShaderVariant, VariantContainer};
use crate::{Compiler, ParsedFile};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Shared cancellation switch, checked between stages.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(CompilerError::Cancelled);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "message", rename_all = "snake_case")]
pub enum TargetStatus {
    Built,
    Failed(String),
    /// The target was disabled for the batch before this file reached it.
    Skipped(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct TargetReport {
    pub target: Target,
    pub status: TargetStatus,
    pub artifacts: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    pub input: PathBuf,
    /// Skipped as unchanged by the incremental cache.
    pub cached: bool,
    /// File-level errors: syntax, unreadable input, failed tables.
    pub errors: Vec<String>,
    /// Cross-reference tables written for this file.
    pub reflection: Vec<PathBuf>,
    pub targets: Vec<TargetReport>,
}

impl FileReport {
    fn new(input: &Path) -> Self {
        FileReport {
            input: input.to_path_buf(),
            cached: false,
            errors: Vec::new(),
            reflection: Vec::new(),
            targets: Vec::new(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.errors.is_empty() && self.targets.iter().all(|t| t.status == TargetStatus::Built)
    }

    pub fn artifacts(&self) -> impl Iterator<Item = &PathBuf> {
        self.reflection.iter().chain(self.targets.iter().flat_map(|t| t.artifacts.iter()))
    }

    /// One line per problem, prefixed with the input and target.
    pub fn failures(&self) -> Vec<String> {
        let mut out: Vec<String> = self.errors.iter().map(|e| format!("{}: {}", self.input.display(), e)).collect();
        for t in &self.targets {
            if let TargetStatus::Failed(message) | TargetStatus::Skipped(message) = &t.status {
                out.push(format!("{} [{}]: {}", self.input.display(), t.target, message));
            }
        }
        out
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BuildReport {
    /// Sorted by input path.
    pub files: Vec<FileReport>,
    pub disabled_targets: BTreeMap<Target, String>,
    pub cancelled: bool,
}

impl BuildReport {
    pub fn succeeded(&self) -> bool {
        !self.cancelled && self.files.iter().all(FileReport::succeeded)
    }

    pub fn built_files(&self) -> usize {
        self.files.iter().filter(|f| !f.cached && f.succeeded()).count()
    }

    pub fn cached_files(&self) -> usize {
        self.files.iter().filter(|f| f.cached).count()
    }

    pub fn failures(&self) -> Vec<String> {
        self.files.iter().flat_map(FileReport::failures).collect()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

pub struct BuildDriver {
    config: BuildConfig,
    compiler: Compiler,
    compilers: BTreeMap<Target, Arc<dyn ShaderCompiler>>,
    disabled: Mutex<BTreeMap<Target, String>>,
    cache: BuildCache,
    locks: OutputLocks,
    cancel: CancelFlag,
    arguments: String,
}

/// `<name>` or `<name>.<FLAGS>` for a flagged variant.
fn variant_stem(name: &str, flags: FeatureFlags) -> String {
    if flags.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", name, flags.label())
    }
}

impl BuildDriver {
    /// Creates a driver, locating native compilers when compilation is enabled.
    /// Targets whose compiler cannot be found are disabled up front.
    pub fn new(config: BuildConfig) -> Self {
        let mut compilers: BTreeMap<Target, Arc<dyn ShaderCompiler>> = BTreeMap::new();
        let mut disabled = BTreeMap::new();
        if config.compile {
            for &target in &config.targets {
                let options = config.target_options(target);
                match NativeCompiler::locate(target, options.compiler.as_deref()) {
                    Ok(found) => {
                        compilers.insert(target, Arc::new(found));
                    }
                    Err(e) => {
                        warn!("{}", e);
                        disabled.insert(target, e.to_string());
                    }
                }
            }
        }
        BuildDriver {
            compiler: Compiler::new(config.include_paths.clone(), config.lowering_options()),
            cache: BuildCache::new(config.cache_dir()),
            arguments: fingerprint_arguments(&config.invocation_arguments()),
            compilers,
            disabled: Mutex::new(disabled),
            locks: OutputLocks::new(),
            cancel: CancelFlag::default(),
            config,
        }
    }

    /// Replaces the compiler for its target, re-enabling the target.
    pub fn with_compiler(mut self, compiler: Arc<dyn ShaderCompiler>) -> Self {
        let target = compiler.target();
        self.disabled.get_mut().remove(&target);
        self.compilers.insert(target, compiler);
        self
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn run(&self, inputs: &[PathBuf]) -> BuildReport {
        let start = Instant::now();
        let (tx, rx) = crossbeam_channel::unbounded::<&Path>();
        for input in inputs {
            // The receiver lives until the workers finish, so sending cannot fail.
            let _ = tx.send(input);
        }
        drop(tx);

        let workers = self.config.workers().clamp(1, inputs.len().max(1));
        info!("building {} file(s) with {} worker(s)", inputs.len(), workers);
        let reports = Mutex::new(Vec::with_capacity(inputs.len()));
        std::thread::scope(|scope| {
            for _ in 0..workers {
                let rx = rx.clone();
                let reports = &reports;
                scope.spawn(move || {
                    for input in rx.iter() {
                        let report = if self.cancel.is_cancelled() {
                            let mut report = FileReport::new(input);
                            report.errors.push(CompilerError::Cancelled.to_string());
                            report
                        } else {
                            self.build_file(input)
                        };
                        reports.lock().push(report);
                    }
                });
            }
        });

        let mut files = reports.into_inner();
        files.sort_by(|a, b| a.input.cmp(&b.input));
        self.reject_shared_outputs(&mut files);
        let report = BuildReport {
            files,
            disabled_targets: self.disabled.lock().clone(),
            cancelled: self.cancel.is_cancelled(),
        };
        info!(
            "{} built, {} up to date, {} failed in {:.2?}",
            report.built_files(),
            report.cached_files(),
            report.files.iter().filter(|f| !f.succeeded()).count(),
            start.elapsed()
        );
        report
    }

    /// Target outputs a file owns: the paths it just wrote, or those its cache row recorded.
    fn owned_outputs(&self, report: &FileReport) -> Vec<PathBuf> {
        if !report.cached {
            return report.targets.iter().flat_map(|t| t.artifacts.iter().cloned()).collect();
        }
        let reflection = self.config.out_dir.join("reflection");
        report
            .input
            .canonicalize()
            .ok()
            .and_then(|input| self.cache.load(&input))
            .map(|row| row.outputs.into_iter().filter(|p| !p.starts_with(&reflection)).collect())
            .unwrap_or_default()
    }

    /// Two inputs declaring the same output name write the same paths, so neither
    /// result can be trusted. Every file involved fails and loses its cache row.
    fn reject_shared_outputs(&self, files: &mut [FileReport]) {
        let mut owners: BTreeMap<PathBuf, Vec<usize>> = BTreeMap::new();
        for (i, file) in files.iter().enumerate() {
            for path in self.owned_outputs(file) {
                let entry = owners.entry(path).or_default();
                if !entry.contains(&i) {
                    entry.push(i);
                }
            }
        }

        let mut clashes: BTreeMap<usize, BTreeMap<usize, PathBuf>> = BTreeMap::new();
        for (path, ids) in owners.into_iter().filter(|(_, ids)| ids.len() > 1) {
            for &i in &ids {
                for &j in ids.iter().filter(|&&j| j != i) {
                    clashes.entry(i).or_default().entry(j).or_insert_with(|| path.clone());
                }
            }
        }

        for (i, others) in clashes {
            for (j, path) in others {
                let message = format!(
                    "output {} is also produced by {}",
                    path.display(),
                    files[j].input.display()
                );
                files[i].errors.push(message);
            }
            let file = &mut files[i];
            file.cached = false;
            if let Ok(input) = file.input.canonicalize() {
                if let Err(e) = self.cache.invalidate(&input) {
                    warn!("{}: {}", file.input.display(), e);
                }
            }
        }
    }

    fn build_file(&self, input: &Path) -> FileReport {
        let mut report = FileReport::new(input);
        let start = Instant::now();
        if let Err(e) = self.build_file_inner(input, &mut report) {
            report.errors.push(e.to_string());
        }
        if report.succeeded() {
            debug!("{}: done in {:.2?}", input.display(), start.elapsed());
        } else {
            for failure in report.failures() {
                warn!("{}", failure);
            }
        }
        report
    }

    fn build_file_inner(&self, input: &Path, report: &mut FileReport) -> Result<()> {
        let canonical = input.canonicalize().map_err(|e| CompilerError::path_io(input, e))?;
        if self.config.incremental && self.cache.is_fresh(&canonical, &self.arguments) {
            debug!("{}: up to date", input.display());
            report.cached = true;
            return Ok(());
        }
        self.cancel.check()?;

        let parsed = self.compiler.parse_file(input)?;
        let fingerprint = fingerprint_files(&parsed.source.dependencies)?;
        report.errors.extend(parsed.resolved.errors.iter().map(|e| e.to_string()));

        let reflection_dir = self.config.out_dir.join("reflection");
        for table in parsed.resolved.tables.values() {
            let json = reflection_dir.join(format!("{}.srt.json", table.name));
            let header = reflection_dir.join(format!("{}.srt.h", table.name));
            write_locked(&self.locks, &json, table.to_json()?.as_bytes())?;
            write_locked(&self.locks, &header, table.c_header()?.as_bytes())?;
            report.reflection.extend([json, header]);
        }

        let outputs = parsed.outputs()?;
        for &target in &self.config.targets {
            let skipped = self.disabled.lock().get(&target).cloned();
            let target_report = match skipped {
                Some(reason) => TargetReport {
                    target,
                    status: TargetStatus::Skipped(reason),
                    artifacts: Vec::new(),
                },
                None => {
                    let mut artifacts = Vec::new();
                    let status = match self.build_target(&parsed, &outputs, target, &mut artifacts) {
                        Ok(()) => TargetStatus::Built,
                        Err(e) => TargetStatus::Failed(e.to_string()),
                    };
                    TargetReport {
                        target,
                        status,
                        artifacts,
                    }
                }
            };
            report.targets.push(target_report);
        }

        if report.succeeded() {
            self.cache.record(&CacheRow {
                input: canonical,
                dependencies: parsed.source.dependencies.clone(),
                fingerprint,
                arguments: self.arguments.clone(),
                outputs: report.artifacts().cloned().collect(),
            })?;
        }
        Ok(())
    }

    fn build_target(
        &self,
        parsed: &ParsedFile,
        outputs: &[OutputDecl<'_>],
        target: Target,
        artifacts: &mut Vec<PathBuf>,
    ) -> Result<()> {
        let options = self.config.target_options(target);
        let generator_options = options.generator_options();
        let dir = self.config.out_dir.join(target.name());

        // Blocks sharing a name form one container.
        let mut groups: BTreeMap<&str, Vec<&OutputDecl<'_>>> = BTreeMap::new();
        for output in outputs {
            groups.entry(output.name.as_str()).or_default().push(output);
        }

        for (name, decls) in groups {
            let mut container = VariantContainer::new();
            for decl in &decls {
                self.cancel.check()?;
                let shader = self.compiler.translate(parsed, decl, target, &generator_options)?;
                let stem = variant_stem(name, decl.flags);
                let source_path = dir.join(format!("{}.{}", stem, target.source_extension()));
                let meta_path = dir.join(format!("{}.meta.json", stem));
                write_locked(&self.locks, &source_path, shader.source.as_bytes())?;
                write_locked(&self.locks, &meta_path, shader.metadata.to_json()?.as_bytes())?;
                artifacts.extend([source_path, meta_path]);

                let bytes = if self.config.compile {
                    self.cancel.check()?;
                    self.compile(parsed, decl, target, &options, &shader)?
                } else {
                    shader.source.into_bytes()
                };
                container.insert(ShaderVariant {
                    target,
                    flags: decl.flags,
                    bytes,
                })?;
            }

            let single = decls.len() == 1 && decls[0].flags.is_empty();
            if single && self.config.compile {
                if let Some(variant) = container.iter().next() {
                    let path = dir.join(format!("{}.{}", name, target.binary_extension()));
                    write_locked(&self.locks, &path, &variant.bytes)?;
                    artifacts.push(path);
                }
            } else if !single {
                let path = dir.join(format!("{}.fslv", name));
                write_locked(&self.locks, &path, &container.to_bytes())?;
                artifacts.push(path);
            }
        }
        Ok(())
    }

    fn compile(
        &self,
        parsed: &ParsedFile,
        decl: &OutputDecl<'_>,
        target: Target,
        options: &TargetOptions,
        shader: &GeneratedShader,
    ) -> Result<Vec<u8>> {
        let compiler = self.compilers.get(&target).ok_or_else(|| CompilerError::Environment {
            target,
            message: "no compiler available".to_string(),
        })?;
        let label = format!("{}:{}", parsed.source.name, decl.name);
        let request = CompileRequest {
            label: &label,
            stage: decl.stage,
            entry: &shader.metadata.entry,
            source: &shader.source,
            shader_model: options.shader_model.as_deref(),
            extra_args: &options.extra_args,
        };
        match compiler.compile(&request) {
            Err(e @ CompilerError::Environment { .. }) => {
                warn!("disabling {} for this build: {}", target, e);
                self.disabled.lock().insert(target, e.to_string());
                Err(e)
            }
            other => other,
        }
    }
}
