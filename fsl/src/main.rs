use clap::{Args, Parser, Subcommand};
use fsl_core::config::{BuildConfig, ProjectConfig};
use fsl_core::driver::BuildDriver;
use fsl_core::reload::{ReloadClient, ReloadRequest, ReloadServer};
use fsl_core::target::Target;
use fsl_core::variant::VariantContainer;
use fsl_core::Compiler;
use log::{error, info, warn};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

const DEFAULT_PROJECT: &str = "default";

#[derive(Parser)]
#[command(name = "fsl")]
#[command(about = "Translates portable shader sources to HLSL, Vulkan GLSL and MSL", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct BuildArgs {
    /// Project file (defaults to ./fsl.toml when present)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Targets: direct3d12, vulkan, metal, a comma-separated list, or all
    #[arg(short, long, value_parser = parse_targets)]
    target: Option<TargetList>,

    /// Include directory (repeatable)
    #[arg(short = 'I', long = "include", value_name = "DIR")]
    include_paths: Vec<PathBuf>,
}

#[derive(Clone)]
struct TargetList(Vec<Target>);

fn parse_targets(value: &str) -> Result<TargetList, String> {
    Target::parse_list(value).map(TargetList)
}

#[derive(Subcommand)]
enum Commands {
    /// Translate and compile source files
    Compile {
        /// Input source files
        #[arg(value_name = "FILE", required = true)]
        inputs: Vec<PathBuf>,

        #[command(flatten)]
        build: BuildArgs,

        /// Output directory
        #[arg(short, long, value_name = "DIR")]
        out: Option<PathBuf>,

        /// Number of worker threads
        #[arg(long = "mp", value_name = "N")]
        workers: Option<usize>,

        /// Skip inputs whose sources, includes and arguments are unchanged
        #[arg(long)]
        incremental: bool,

        /// Only generate source; do not run the native compilers
        #[arg(long)]
        no_compile: bool,

        /// Write the build report as JSON
        #[arg(long, value_name = "FILE")]
        report: Option<PathBuf>,
    },

    /// Translate source files in memory and report errors without writing anything
    Check {
        #[arg(value_name = "FILE", required = true)]
        inputs: Vec<PathBuf>,

        #[command(flatten)]
        build: BuildArgs,
    },

    /// Run the hot-reload server
    Serve {
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,

        #[arg(long)]
        bind: Option<String>,

        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Ask a running hot-reload server to rebuild files
    Reload {
        #[arg(value_name = "FILE", required = true)]
        inputs: Vec<PathBuf>,

        #[arg(long, default_value = DEFAULT_PROJECT)]
        project: String,

        /// Server address (defaults to the configured bind address and port)
        #[arg(short, long)]
        address: Option<String>,

        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
    },

    /// List the variants of a container
    Inspect {
        #[arg(value_name = "FILE")]
        container: PathBuf,
    },
}

#[derive(Debug, Error)]
enum DriverError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Compilation error: {0}")]
    CompilationError(#[from] fsl_core::error::CompilerError),

    #[error("{0} file(s) failed")]
    BuildFailed(usize),

    #[error("build task failed: {0}")]
    TaskFailed(#[from] tokio::task::JoinError),
}

#[tokio::main]
async fn main() -> Result<(), DriverError> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Compile {
            inputs,
            build,
            out,
            workers,
            incremental,
            no_compile,
            report,
        } => {
            let mut config = load_project(build.config.as_deref())?.build;
            apply_build_args(&mut config, build);
            if let Some(out) = out {
                config.out_dir = out;
            }
            if let Some(workers) = workers {
                config.workers = workers;
            }
            config.incremental |= incremental;
            config.compile &= !no_compile;
            compile_files(config, inputs, report).await?;
        }
        Commands::Check { inputs, build } => {
            let mut config = load_project(build.config.as_deref())?.build;
            apply_build_args(&mut config, build);
            check_files(&config, &inputs)?;
        }
        Commands::Serve { config, bind, port } => {
            let mut project = load_project(config.as_deref())?;
            if let Some(bind) = bind {
                project.reload.bind = bind;
            }
            if let Some(port) = port {
                project.reload.port = port;
            }
            serve(project).await?;
        }
        Commands::Reload {
            inputs,
            project,
            address,
            config,
        } => {
            let address = match address {
                Some(address) => address,
                None => load_project(config.as_deref())?.reload.address(),
            };
            reload(address, project, inputs).await?;
        }
        Commands::Inspect { container } => inspect(&container)?,
    }

    Ok(())
}

fn load_project(path: Option<&Path>) -> Result<ProjectConfig, DriverError> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => {
            let default = PathBuf::from("fsl.toml");
            if !default.is_file() {
                return Ok(ProjectConfig::default());
            }
            default
        }
    };
    info!("Using project file {}", path.display());
    Ok(ProjectConfig::load(&path)?)
}

fn apply_build_args(config: &mut BuildConfig, args: BuildArgs) {
    if let Some(TargetList(targets)) = args.target {
        config.targets = targets;
    }
    config.include_paths.extend(args.include_paths);
}

async fn compile_files(config: BuildConfig, inputs: Vec<PathBuf>, report_path: Option<PathBuf>) -> Result<(), DriverError> {
    let driver = BuildDriver::new(config);
    let cancel = driver.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling build");
            cancel.cancel();
        }
    });

    let report = tokio::task::spawn_blocking(move || driver.run(&inputs)).await?;
    if let Some(path) = report_path {
        std::fs::write(&path, report.to_json()?)?;
    }
    for (target, reason) in &report.disabled_targets {
        warn!("{} disabled: {}", target, reason);
    }
    for failure in report.failures() {
        eprintln!("{}", failure);
    }
    info!("{} built, {} up to date", report.built_files(), report.cached_files());
    if report.succeeded() {
        Ok(())
    } else {
        Err(DriverError::BuildFailed(report.files.iter().filter(|f| !f.succeeded()).count()))
    }
}

fn check_files(config: &BuildConfig, inputs: &[PathBuf]) -> Result<(), DriverError> {
    let compiler = Compiler::new(config.include_paths.clone(), config.lowering_options());
    let mut failed = 0;
    for input in inputs {
        let mut errors = Vec::new();
        match compiler.parse_file(input) {
            Ok(parsed) => {
                errors.extend(parsed.resolved.errors.iter().map(|e| e.to_string()));
                match parsed.outputs() {
                    Ok(outputs) => {
                        for target in &config.targets {
                            let options = config.target_options(*target).generator_options();
                            for output in &outputs {
                                if let Err(e) = compiler.translate(&parsed, output, *target, &options) {
                                    errors.push(format!("{} ({}): {}", output.name, target, e));
                                }
                            }
                        }
                    }
                    Err(e) => errors.push(e.to_string()),
                }
            }
            Err(e) => errors.push(e.to_string()),
        }
        if errors.is_empty() {
            info!("{}: ok", input.display());
        } else {
            failed += 1;
            for e in errors {
                eprintln!("{}: {}", input.display(), e);
            }
        }
    }
    if failed > 0 {
        return Err(DriverError::BuildFailed(failed));
    }
    Ok(())
}

async fn serve(project: ProjectConfig) -> Result<(), DriverError> {
    let mut projects = BTreeMap::from([(DEFAULT_PROJECT.to_string(), project.build.clone())]);
    for (name, path) in &project.reload.projects {
        projects.insert(name.clone(), ProjectConfig::load(path)?.build);
    }
    let listener = tokio::net::TcpListener::bind(project.reload.address()).await?;
    let server = Arc::new(ReloadServer::new(projects));
    server
        .serve(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Cannot listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;
    Ok(())
}

async fn reload(address: String, project: String, inputs: Vec<PathBuf>) -> Result<(), DriverError> {
    let paths = inputs
        .iter()
        .map(std::path::absolute)
        .collect::<std::io::Result<Vec<_>>>()?;
    let client = ReloadClient::new(address);
    let response = client.request(&ReloadRequest { project, paths }).await?;
    if let Some(message) = &response.error {
        eprintln!("{}", message);
    }
    for artifact in &response.artifacts {
        println!("{} ({} bytes)", artifact.path, artifact.bytes.len());
    }
    if response.success {
        Ok(())
    } else {
        Err(DriverError::BuildFailed(inputs.len()))
    }
}

fn inspect(path: &Path) -> Result<(), DriverError> {
    let bytes = std::fs::read(path)?;
    let container = VariantContainer::from_bytes(&bytes)?;
    println!("{}: {} variant(s)", path.display(), container.len());
    for variant in container.iter() {
        let flags = variant.flags.label();
        println!(
            "  {:<10} {:<40} {} bytes",
            variant.target.name(),
            if flags.is_empty() { "-" } else { flags.as_str() },
            variant.bytes.len()
        );
    }
    Ok(())
}
