use fsl_core::backend::GeneratorOptions;
use fsl_core::config::{BuildConfig, TargetOptions};
use fsl_core::driver::{BuildDriver, TargetStatus};
use fsl_core::error::{CompilerError, Result};
use fsl_core::resolver::ResolvedTable;
use fsl_core::target::Target;
use fsl_core::toolchain::{CompileRequest, ShaderCompiler};
use fsl_core::variant::{FeatureFlags, VariantContainer};
use fsl_core::Compiler;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const TABLE: &str = "#pragma once
STRUCT(VSOutput)
{
    DATA(float4, position, SV_Position);
    DATA(float2, uv, TEXCOORD0);
};
BEGIN_SHARED_SRT_SET(Common, Persistent)
    DECL_TEXTURE(Persistent, Tex2D(float4), uTextures[4])
    DECL_SAMPLER(Persistent, SamplerState, uSampler0)
END_SHARED_SRT_SET(Common)
BEGIN_SRT(Scene)
    INCLUDE_SRT_SET(Common)
    BEGIN_SRT_SET(PerFrame)
        DECL_CBUFFER(PerFrame, CBUFFER(float4), tint)
    END_SRT_SET(PerFrame)
END_SRT(Scene)
BEGIN_SRT(Post)
    INCLUDE_SRT_SET(Common)
END_SRT(Post)
";

const SHADER: &str = "
#frag FT_RAYTRACING lit
#include \"table.h\"
USE_SRT(Scene)
float4 PS_MAIN(VSOutput input)
{
    INIT_MAIN;
    RETURN(Sample(uTextures[1], uSampler0, input.uv) * tint);
}
#end
#frag lit
#include \"table.h\"
USE_SRT(Scene)
float4 PS_MAIN(VSOutput input)
{
    INIT_MAIN;
    RETURN(Sample(uTextures[0], uSampler0, input.uv) * tint);
}
#end
";

const BLIT: &str = "
#include \"table.h\"
USE_SRT(Post)
float4 PS_MAIN(VSOutput input)
{
    INIT_MAIN;
    RETURN(Sample(uTextures[0], uSampler0, input.uv));
}
";

/// Returns the generated source as the "binary" and counts invocations.
struct CountingCompiler {
    target: Target,
    calls: AtomicUsize,
}

impl ShaderCompiler for CountingCompiler {
    fn target(&self) -> Target {
        self.target
    }

    fn compile(&self, request: &CompileRequest<'_>) -> Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(request.source.as_bytes().to_vec())
    }
}

/// A compiler whose tool has gone missing after it was located.
struct MissingCompiler;

impl ShaderCompiler for MissingCompiler {
    fn target(&self) -> Target {
        Target::Direct3D12
    }

    fn compile(&self, _request: &CompileRequest<'_>) -> Result<Vec<u8>> {
        Err(CompilerError::Environment {
            target: Target::Direct3D12,
            message: "dxc was removed".into(),
        })
    }
}

fn project(dir: &Path) {
    std::fs::write(dir.join("table.h"), TABLE).unwrap();
    std::fs::write(dir.join("lit.fsl"), SHADER).unwrap();
    std::fs::write(dir.join("blit.fsl"), BLIT).unwrap();
}

fn config(dir: &Path, targets: Vec<Target>) -> BuildConfig {
    BuildConfig {
        targets,
        include_paths: vec![dir.to_path_buf()],
        out_dir: dir.join("out"),
        workers: 2,
        ..BuildConfig::default()
    }
}

#[test]
fn test_translation_is_deterministic() {
    let dir = tempfile::tempdir().unwrap();
    project(dir.path());
    let input = dir.path().join("lit.fsl");

    let first = Compiler::new(vec![dir.path().to_path_buf()], Default::default());
    let second = Compiler::new(vec![dir.path().to_path_buf()], Default::default());
    let a = first.parse_file(&input).unwrap();
    let b = second.parse_file(&input).unwrap();
    for target in Target::ALL {
        for (x, y) in a.outputs().unwrap().iter().zip(b.outputs().unwrap().iter()) {
            let x = first.translate(&a, x, target, &GeneratorOptions::default()).unwrap();
            let y = second.translate(&b, y, target, &GeneratorOptions::default()).unwrap();
            assert_eq!(x.source, y.source);
            assert_eq!(x.metadata.to_json().unwrap(), y.metadata.to_json().unwrap());
        }
    }
}

#[test]
fn test_builds_are_byte_identical() {
    let dir = tempfile::tempdir().unwrap();
    project(dir.path());
    let inputs = [dir.path().join("lit.fsl"), dir.path().join("blit.fsl")];
    let mut config = config(dir.path(), Target::ALL.to_vec());
    config.compile = false;

    let report = BuildDriver::new(config.clone()).run(&inputs);
    assert!(report.succeeded(), "{:?}", report.failures());
    let container = dir.path().join("out/metal/lit.fslv");
    let before = std::fs::read(&container).unwrap();

    config.workers = 1;
    let report = BuildDriver::new(config).run(&inputs);
    assert!(report.succeeded(), "{:?}", report.failures());
    assert_eq!(std::fs::read(&container).unwrap(), before);
}

#[test]
fn test_shared_fragment_indices_match_across_tables() {
    let dir = tempfile::tempdir().unwrap();
    project(dir.path());
    let mut config = config(dir.path(), vec![Target::Vulkan]);
    config.compile = false;
    let report = BuildDriver::new(config).run(&[dir.path().join("blit.fsl")]);
    assert!(report.succeeded(), "{:?}", report.failures());

    let read = |name: &str| -> serde_json::Value {
        let text = std::fs::read_to_string(dir.path().join(format!("out/reflection/{}.srt.json", name))).unwrap();
        serde_json::from_str(&text).unwrap()
    };
    let scene = read("Scene");
    let post = read("Post");
    assert_eq!(scene["sets"][0], post["sets"][0]);
    assert_eq!(scene["sets"][0]["fragment"], "Common");
    // uTextures[4] takes indices 0..4, the sampler follows.
    assert_eq!(scene["sets"][0]["resources"][1]["index"], 4);

    let header = std::fs::read_to_string(dir.path().join("out/reflection/Post.srt.h")).unwrap();
    assert!(header.contains("#define SRT_RES_IDX_Post_Persistent_uSampler0 4"), "{}", header);
}

#[test]
fn test_resolved_tables_drive_generated_bindings() {
    let compiler = Compiler::default();
    let parsed = compiler.parse_str("blit.fsl", &format!("{}{}", TABLE, BLIT.replace("#include \"table.h\"", ""))).unwrap();
    let post: &ResolvedTable = parsed.resolved.table("Post").unwrap();
    assert_eq!(post.resource("uSampler0").map(|(_, r)| r.index), Some(4));

    let outputs = parsed.outputs().unwrap();
    let shader = compiler
        .translate(&parsed, &outputs[0], Target::Direct3D12, &GeneratorOptions::default())
        .unwrap();
    assert!(shader.source.contains("SamplerState uSampler0 : register(s4, space0);"), "{}", shader.source);
}

#[test]
fn test_incremental_build_skips_unchanged_inputs() {
    let dir = tempfile::tempdir().unwrap();
    project(dir.path());
    let inputs = [dir.path().join("lit.fsl"), dir.path().join("blit.fsl")];
    let mut config = config(dir.path(), vec![Target::Vulkan]);
    config.incremental = true;
    let compiler = Arc::new(CountingCompiler {
        target: Target::Vulkan,
        calls: AtomicUsize::new(0),
    });

    let driver = BuildDriver::new(config.clone()).with_compiler(compiler.clone());
    let report = driver.run(&inputs);
    assert!(report.succeeded(), "{:?}", report.failures());
    assert_eq!(report.built_files(), 2);
    assert_eq!(compiler.calls.load(Ordering::SeqCst), 3);
    assert!(dir.path().join("out/vulkan/blit.spv").is_file());
    assert!(dir.path().join("out/vulkan/lit.fslv").is_file());

    let driver = BuildDriver::new(config.clone()).with_compiler(compiler.clone());
    let report = driver.run(&inputs);
    assert_eq!(report.cached_files(), 2);
    assert_eq!(compiler.calls.load(Ordering::SeqCst), 3);

    // An include change invalidates every file that pulls it in.
    std::fs::write(dir.path().join("table.h"), format!("{}\n// touched\n", TABLE)).unwrap();
    let driver = BuildDriver::new(config.clone()).with_compiler(compiler.clone());
    let report = driver.run(&inputs);
    assert_eq!(report.built_files(), 2);
    assert_eq!(compiler.calls.load(Ordering::SeqCst), 6);

    // So does a change to an output-affecting setting.
    config.graphics_root_signature = "AltRootSig".into();
    let driver = BuildDriver::new(config).with_compiler(compiler.clone());
    let report = driver.run(&inputs);
    assert_eq!(report.built_files(), 2);
    assert_eq!(compiler.calls.load(Ordering::SeqCst), 9);
}

#[test]
fn test_missing_tool_disables_target_for_the_batch() {
    let dir = tempfile::tempdir().unwrap();
    project(dir.path());
    let inputs = [dir.path().join("lit.fsl"), dir.path().join("blit.fsl")];
    let mut config = config(dir.path(), vec![Target::Direct3D12, Target::Vulkan]);
    config.workers = 1;
    let vulkan = Arc::new(CountingCompiler {
        target: Target::Vulkan,
        calls: AtomicUsize::new(0),
    });
    let driver = BuildDriver::new(config)
        .with_compiler(Arc::new(MissingCompiler))
        .with_compiler(vulkan.clone());
    let report = driver.run(&inputs);

    assert!(!report.succeeded());
    assert!(report.disabled_targets[&Target::Direct3D12].contains("dxc was removed"));
    // The first file hits the failure; the second never runs the tool.
    let d3d: Vec<_> = report
        .files
        .iter()
        .map(|f| f.targets.iter().find(|t| t.target == Target::Direct3D12).unwrap().status.clone())
        .collect();
    assert!(d3d.iter().any(|s| matches!(s, TargetStatus::Failed(_))));
    assert!(d3d.iter().any(|s| matches!(s, TargetStatus::Skipped(_))));
    // Other targets keep building.
    assert_eq!(vulkan.calls.load(Ordering::SeqCst), 3);
}

#[test]
fn test_raytracing_variant_uses_argument_buffers_on_metal() {
    let dir = tempfile::tempdir().unwrap();
    project(dir.path());
    let mut config = config(dir.path(), vec![Target::Metal]);
    config.compile = false;
    config.toolchain.insert(Target::Metal, TargetOptions::default());
    let report = BuildDriver::new(config).run(&[dir.path().join("lit.fsl")]);
    assert!(report.succeeded(), "{:?}", report.failures());

    let container = VariantContainer::from_bytes(&std::fs::read(dir.path().join("out/metal/lit.fslv")).unwrap()).unwrap();
    let raytracing = String::from_utf8(container.lookup(Target::Metal, FeatureFlags::RAYTRACING).unwrap().to_vec()).unwrap();
    let plain = String::from_utf8(container.lookup(Target::Metal, FeatureFlags::empty()).unwrap().to_vec()).unwrap();
    assert!(raytracing.contains("struct Srt_Persistent"), "{}", raytracing);
    assert!(!plain.contains("struct Srt_"), "{}", plain);
    assert!(matches!(
        container.lookup(Target::Metal, FeatureFlags::RAYTRACING | FeatureFlags::MULTIVIEW),
        Err(CompilerError::NoMatchingVariant { .. })
    ));
}
