//! pixopt CLI entrypoint.
//!
//! ```bash
//! pixopt optimize photos/ --output-dir out/ --format webp --max-width 2048
//! pixopt info photo.jpg --json
//! pixopt formats --json
//! pixopt devices --json
//! pixopt version
//! ```

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::time::Instant;

use clap::{Args, Parser, Subcommand};
use serde_json::{Value, json};

use pixopt_core::backend::{ModelType, StyleOptions};
use pixopt_core::callbacks::Callbacks;
use pixopt_core::error::{OptimizerError, Result};
use pixopt_core::types::{ColorSpace, CompressionLevel, ImageFormat, ProcessingOptions};
use pixopt_device::BackendPreference;
use pixopt_pipeline::{Optimizer, OptimizerConfig, system_info, version_info};

const JSON_SCHEMA_VERSION: u32 = 1;

/// Extensions picked up when an input is a directory.
const INPUT_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "tiff", "bmp", "heic"];

#[derive(Parser, Debug)]
#[command(
    name = "pixopt",
    version,
    about = "GPU-accelerated image optimizer",
    arg_required_else_help = true,
    after_help = "Examples:\n  pixopt optimize photos/ -o out/ --format webp --quality 80\n  pixopt optimize in.png -o out/ --model denoise=dn.json --denoise 0.4\n  pixopt info photo.jpg --json\n  pixopt devices --json"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Recompress, resize, and optionally enhance images.
    Optimize(OptimizeArgs),
    /// Probe an image without decoding its pixels.
    Info(InfoArgs),
    /// List the active output formats.
    Formats(FormatsArgs),
    /// List compute devices of the selected backend.
    Devices(DevicesArgs),
    /// Print version and system information.
    Version(VersionArgs),
}

#[derive(Args, Debug, Clone)]
struct RuntimeArgs {
    /// JSON configuration file.
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Device backend: auto, host, or cuda. Overrides the config file.
    #[arg(long = "backend")]
    backend: Option<BackendPreference>,

    /// Device ordinal. Overrides the config file.
    #[arg(short = 'd', long = "device")]
    device: Option<usize>,
}

impl RuntimeArgs {
    fn load_config(&self) -> Result<OptimizerConfig> {
        let mut config = match &self.config {
            Some(path) => OptimizerConfig::from_json_file(path)?,
            None => OptimizerConfig::default(),
        };
        if let Some(backend) = self.backend {
            config.backend = backend;
        }
        if let Some(device) = self.device {
            config.device = device;
        }
        Ok(config)
    }
}

#[derive(Args, Debug, Clone)]
struct OptimizeArgs {
    /// Input files or directories.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Directory for optimized files, named `<stem>.<format extension>`.
    #[arg(short = 'o', long = "output-dir")]
    output_dir: PathBuf,

    /// Descend into subdirectories of directory inputs.
    #[arg(short = 'r', long = "recursive", default_value_t = false)]
    recursive: bool,

    #[command(flatten)]
    runtime: RuntimeArgs,

    /// Output format: jpeg, png, webp, avif.
    #[arg(short = 'f', long = "format", default_value_t = ImageFormat::Webp)]
    format: ImageFormat,

    /// Encoder quality, 1-100.
    #[arg(short = 'q', long = "quality", default_value_t = 85)]
    quality: u8,

    /// Compression effort: none, fast, balanced, max.
    #[arg(long = "compression", default_value_t = CompressionLevel::Balanced)]
    compression: CompressionLevel,

    /// Output colorspace: rgb, rgba, gray, cmyk.
    #[arg(long = "colorspace", default_value_t = ColorSpace::Rgb)]
    colorspace: ColorSpace,

    /// Fit within this width, keeping aspect ratio (0 = unbounded).
    #[arg(long = "max-width", default_value_t = 0)]
    max_width: u32,

    /// Fit within this height, keeping aspect ratio (0 = unbounded).
    #[arg(long = "max-height", default_value_t = 0)]
    max_height: u32,

    /// Drop the input's ICC profile instead of carrying it over.
    #[arg(long = "strip-metadata", default_value_t = false)]
    strip_metadata: bool,

    /// Run on the host-emulated device even when a GPU is available.
    #[arg(long = "cpu", default_value_t = false)]
    cpu: bool,

    /// Kernel worker threads (0 = automatic).
    #[arg(short = 't', long = "threads", default_value_t = 0)]
    threads: usize,

    /// Load a model manifest: TYPE=PATH (e.g. denoise=models/dn.json).
    #[arg(short = 'm', long = "model", value_parser = parse_model_arg)]
    models: Vec<(ModelType, PathBuf)>,

    /// Denoise with this strength (0-1). Needs a denoise model.
    #[arg(long = "denoise")]
    denoise: Option<f32>,

    /// Upscale by this factor (2-8). Needs a super_resolution model.
    #[arg(long = "super-resolution")]
    super_resolution: Option<u32>,

    /// Detect and enhance faces. Needs a face_enhance model.
    #[arg(long = "face-enhance", default_value_t = false)]
    face_enhance: bool,

    /// Enhance colour. Needs a color_enhance model.
    #[arg(long = "color-enhance", default_value_t = false)]
    color_enhance: bool,

    /// Apply a named style look. Needs a style_transfer model.
    #[arg(long = "style")]
    style: Option<String>,

    /// Style blend strength (0-1).
    #[arg(long = "style-strength", default_value_t = 0.75)]
    style_strength: f32,

    /// Emit structured JSON output to stdout.
    #[arg(long = "json", default_value_t = false)]
    json: bool,
}

impl OptimizeArgs {
    fn processing_options(&self) -> ProcessingOptions {
        let mut options = ProcessingOptions {
            output_format: self.format,
            compression: self.compression,
            colorspace: self.colorspace,
            quality: self.quality,
            max_width: self.max_width,
            max_height: self.max_height,
            preserve_metadata: !self.strip_metadata,
            use_gpu: !self.cpu,
            thread_count: self.threads,
            enable_preview: false,
            ..ProcessingOptions::default()
        };
        let enh = &mut options.enhancements;
        enh.denoise = self.denoise;
        enh.super_resolution = self.super_resolution;
        enh.face_enhance = self.face_enhance;
        enh.color_enhance = self.color_enhance;
        enh.style = self.style.as_ref().map(|name| StyleOptions {
            style_name: name.clone(),
            strength: self.style_strength,
            ..StyleOptions::default()
        });
        options
    }
}

#[derive(Args, Debug, Clone)]
struct InfoArgs {
    /// Image file to probe.
    path: PathBuf,

    /// Emit structured JSON output to stdout.
    #[arg(long = "json", default_value_t = false)]
    json: bool,
}

#[derive(Args, Debug, Clone)]
struct FormatsArgs {
    /// JSON configuration file (its `enable_formats` apply).
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Emit structured JSON output to stdout.
    #[arg(long = "json", default_value_t = false)]
    json: bool,
}

#[derive(Args, Debug, Clone)]
struct DevicesArgs {
    #[command(flatten)]
    runtime: RuntimeArgs,

    /// Emit structured JSON output to stdout.
    #[arg(long = "json", default_value_t = false)]
    json: bool,
}

#[derive(Args, Debug, Clone)]
struct VersionArgs {
    /// Emit structured JSON output to stdout.
    #[arg(long = "json", default_value_t = false)]
    json: bool,
}

fn parse_model_arg(raw: &str) -> std::result::Result<(ModelType, PathBuf), String> {
    let (ty, path) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected TYPE=PATH, got `{raw}`"))?;
    let ty = ty.parse::<ModelType>().map_err(|e| e.to_string())?;
    if path.is_empty() {
        return Err(format!("empty manifest path for {ty}"));
    }
    Ok((ty, PathBuf::from(path)))
}

/// How a command that ran to completion should exit.
#[derive(Debug)]
enum Outcome {
    AllOk,
    SomeFailed,
}

fn main() {
    init_tracing();

    let cli = Cli::parse();
    let json_error_command = match &cli.command {
        Commands::Optimize(args) if args.json => Some("optimize"),
        Commands::Info(args) if args.json => Some("info"),
        Commands::Formats(args) if args.json => Some("formats"),
        Commands::Devices(args) if args.json => Some("devices"),
        Commands::Version(args) if args.json => Some("version"),
        _ => None,
    };

    let result = match cli.command {
        Commands::Optimize(args) => run_optimize(args),
        Commands::Info(args) => run_info(args).map(|()| Outcome::AllOk),
        Commands::Formats(args) => run_formats(args).map(|()| Outcome::AllOk),
        Commands::Devices(args) => run_devices(args).map(|()| Outcome::AllOk),
        Commands::Version(args) => {
            run_version(args);
            Ok(Outcome::AllOk)
        }
    };

    match result {
        Ok(Outcome::AllOk) => std::process::exit(0),
        Ok(Outcome::SomeFailed) => std::process::exit(1),
        Err(err) => {
            if let Some(command) = json_error_command {
                println!("{}", command_error_json(command, &err));
            } else {
                tracing::error!(error = %err, code = err.code().as_raw(), "Command failed");
            }
            std::process::exit(exit_code(&err));
        }
    }
}

fn init_tracing() {
    let ansi_enabled = std::env::var_os("NO_COLOR").is_none() && std::io::stderr().is_terminal();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_ansi(ansi_enabled)
        .init();
}

/// Result codes are negative; the process exit status is their magnitude.
fn exit_code(err: &OptimizerError) -> i32 {
    err.code().as_raw().saturating_abs().max(1)
}

fn command_error_json(command: &str, err: &OptimizerError) -> Value {
    json!({
        "schema_version": JSON_SCHEMA_VERSION,
        "command": command,
        "ok": false,
        "code": err.code().as_raw(),
        "error": err.to_string(),
    })
}

// ─── optimize ──

fn collect_inputs(inputs: &[PathBuf], recursive: bool) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for input in inputs {
        if input.is_dir() {
            walk_dir(input, recursive, &mut files)?;
        } else {
            // Explicit files are taken as given; a missing one fails as its own item.
            files.push(input.clone());
        }
    }
    Ok(files)
}

fn walk_dir(dir: &Path, recursive: bool, files: &mut Vec<PathBuf>) -> Result<()> {
    let entries = std::fs::read_dir(dir).map_err(|e| OptimizerError::file_io(dir, e))?;
    let mut found = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| OptimizerError::file_io(dir, e))?.path();
        if path.is_dir() {
            if recursive {
                walk_dir(&path, recursive, files)?;
            }
        } else if has_input_extension(&path) {
            found.push(path);
        }
    }
    found.sort();
    files.extend(found);
    Ok(())
}

fn has_input_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| INPUT_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn output_path(output_dir: &Path, input: &Path, format: ImageFormat) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".into());
    output_dir.join(format!("{stem}.{}", format.extension()))
}

struct ItemReport {
    input: PathBuf,
    output: PathBuf,
    elapsed_ms: f64,
    result: Result<(u64, u64)>,
}

impl ItemReport {
    fn to_json(&self) -> Value {
        match &self.result {
            Ok((in_bytes, out_bytes)) => json!({
                "input": self.input.display().to_string(),
                "output": self.output.display().to_string(),
                "ok": true,
                "input_bytes": in_bytes,
                "output_bytes": out_bytes,
                "elapsed_ms": self.elapsed_ms,
            }),
            Err(err) => json!({
                "input": self.input.display().to_string(),
                "output": self.output.display().to_string(),
                "ok": false,
                "code": err.code().as_raw(),
                "error": err.to_string(),
            }),
        }
    }

    fn to_human(&self) -> String {
        match &self.result {
            Ok((in_bytes, out_bytes)) => format!(
                "ok     {} -> {} ({in_bytes} -> {out_bytes} bytes, {:.1} ms)",
                self.input.display(),
                self.output.display(),
                self.elapsed_ms
            ),
            Err(err) => format!("failed {}: {err}", self.input.display()),
        }
    }
}

fn run_optimize(args: OptimizeArgs) -> Result<Outcome> {
    let mut config = args.runtime.load_config()?;
    config.models.extend(args.models.iter().cloned());
    let options = args.processing_options();
    options.validate()?;

    let inputs = collect_inputs(&args.inputs, args.recursive)?;
    if inputs.is_empty() {
        return Err(OptimizerError::InvalidParam("no input images found".into()));
    }
    std::fs::create_dir_all(&args.output_dir)
        .map_err(|e| OptimizerError::file_io(&args.output_dir, e))?;

    let optimizer = Optimizer::new(config);
    optimizer.init()?;

    let started = Instant::now();
    let mut reports = Vec::with_capacity(inputs.len());
    for input in inputs {
        let output = output_path(&args.output_dir, &input, options.output_format);
        let item_started = Instant::now();
        let result = optimizer
            .process_file(&input, &output, &options, &mut Callbacks::none())
            .and_then(|()| Ok((file_len(&input)?, file_len(&output)?)));
        if let Err(err) = &result {
            tracing::warn!(input = %input.display(), error = %err, "Item failed");
        }
        reports.push(ItemReport {
            input,
            output,
            elapsed_ms: item_started.elapsed().as_secs_f64() * 1000.0,
            result,
        });
    }
    optimizer.cleanup()?;

    let failed = reports.iter().filter(|r| r.result.is_err()).count();
    if args.json {
        println!(
            "{}",
            json!({
                "schema_version": JSON_SCHEMA_VERSION,
                "command": "optimize",
                "ok": failed == 0,
                "processed": reports.len() - failed,
                "failed": failed,
                "elapsed_ms": started.elapsed().as_secs_f64() * 1000.0,
                "items": reports.iter().map(ItemReport::to_json).collect::<Vec<_>>(),
            })
        );
    } else {
        for report in &reports {
            println!("{}", report.to_human());
        }
        println!(
            "optimize: processed={} failed={}",
            reports.len() - failed,
            failed
        );
    }
    Ok(if failed == 0 {
        Outcome::AllOk
    } else {
        Outcome::SomeFailed
    })
}

fn file_len(path: &Path) -> Result<u64> {
    Ok(std::fs::metadata(path)
        .map_err(|e| OptimizerError::file_io(path, e))?
        .len())
}

// ─── info / formats / devices / version ──

/// Optimizer on the host device, for commands that never run kernels.
fn host_optimizer(mut config: OptimizerConfig) -> Result<Optimizer> {
    config.backend = BackendPreference::Host;
    config.device = 0;
    config.models.clear();
    let optimizer = Optimizer::new(config);
    optimizer.init()?;
    Ok(optimizer)
}

fn run_info(args: InfoArgs) -> Result<()> {
    let optimizer = host_optimizer(OptimizerConfig::default())?;
    let info = optimizer.image_info(&args.path)?;
    let format = info.format.map(ImageFormat::name);
    if args.json {
        println!(
            "{}",
            json!({
                "schema_version": JSON_SCHEMA_VERSION,
                "command": "info",
                "ok": true,
                "path": args.path.display().to_string(),
                "width": info.width,
                "height": info.height,
                "colorspace": info.colorspace.name(),
                "bits_per_pixel": info.bits_per_pixel,
                "file_size": info.file_size,
                "container": info.container,
                "format": format,
                "exif_bytes": info.metadata.exif.as_ref().map(Vec::len),
                "icc_bytes": info.metadata.icc.as_ref().map(Vec::len),
            })
        );
    } else {
        println!("path={}", args.path.display());
        println!("container={}", info.container);
        println!("format={}", format.unwrap_or("none"));
        println!("size={}x{}", info.width, info.height);
        println!("colorspace={}", info.colorspace);
        println!("bits_per_pixel={}", info.bits_per_pixel);
        println!("file_size={}", info.file_size);
        if let Some(icc) = &info.metadata.icc {
            println!("icc_bytes={}", icc.len());
        }
        if let Some(exif) = &info.metadata.exif {
            println!("exif_bytes={}", exif.len());
        }
    }
    Ok(())
}

fn run_formats(args: FormatsArgs) -> Result<()> {
    let config = match &args.config {
        Some(path) => OptimizerConfig::from_json_file(path)?,
        None => OptimizerConfig::default(),
    };
    let optimizer = host_optimizer(config)?;
    let formats = optimizer.supported_formats()?;
    if args.json {
        let entries: Vec<Value> = formats
            .iter()
            .map(|f| {
                json!({
                    "name": f.name(),
                    "extension": f.extension(),
                    "mime_type": f.mime_type(),
                })
            })
            .collect();
        println!(
            "{}",
            json!({
                "schema_version": JSON_SCHEMA_VERSION,
                "command": "formats",
                "ok": true,
                "formats": entries,
            })
        );
    } else {
        println!("formats: {}", formats.len());
        for f in &formats {
            println!("{} ext={} mime={}", f.name(), f.extension(), f.mime_type());
        }
    }
    Ok(())
}

fn run_devices(args: DevicesArgs) -> Result<()> {
    let mut config = args.runtime.load_config()?;
    config.models.clear();
    let optimizer = Optimizer::new(config);
    optimizer.init()?;
    let devices = optimizer.devices()?;
    let active = optimizer.active_device()?;
    if args.json {
        println!(
            "{}",
            json!({
                "schema_version": JSON_SCHEMA_VERSION,
                "command": "devices",
                "ok": true,
                "cuda_runtime_enabled": pixopt_device::CUDA_RUNTIME_ENABLED,
                "active": active,
                "devices": devices,
            })
        );
    } else {
        println!("devices: {}", devices.len());
        for dev in &devices {
            println!(
                "device={} name={} compute_units={} total_mem_mb={} fp16={} int8={} driver={}{}",
                dev.ordinal,
                dev.name,
                dev.compute_units,
                dev.memory_bytes / (1024 * 1024),
                dev.supports_fp16,
                dev.supports_int8,
                dev.driver_version,
                if dev.ordinal == active { " (active)" } else { "" }
            );
        }
    }
    Ok(())
}

fn run_version(args: VersionArgs) {
    let version = version_info();
    let system = system_info();
    if args.json {
        println!(
            "{}",
            json!({
                "schema_version": JSON_SCHEMA_VERSION,
                "command": "version",
                "ok": true,
                "version": version,
                "system": system,
            })
        );
    } else {
        println!(
            "pixopt {}.{}.{} ({})",
            version.major, version.minor, version.patch, version.build_platform
        );
        println!("gpu_support={}", version.has_gpu_support);
        println!("ai_support={}", version.has_ai_support);
        println!("cpu_cores={}", system.cpu_cores);
        println!("cuda_available={}", system.cuda_available);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn model_arg_parses_type_and_path() {
        let (ty, path) = parse_model_arg("super-resolution=models/sr.json").unwrap();
        assert_eq!(ty, ModelType::SuperResolution);
        assert_eq!(path, PathBuf::from("models/sr.json"));
        assert!(parse_model_arg("denoise").is_err());
        assert!(parse_model_arg("sharpen=x.json").is_err());
        assert!(parse_model_arg("denoise=").is_err());
    }

    #[test]
    fn output_name_uses_format_extension() {
        let input = Path::new("in/photo.large.png");
        let out = output_path(Path::new("out"), input, ImageFormat::Jpeg);
        assert_eq!(out, PathBuf::from("out/photo.large.jpg"));
    }

    #[test]
    fn directory_scan_filters_extensions() {
        assert!(has_input_extension(Path::new("a/B.JPEG")));
        assert!(has_input_extension(Path::new("scan.tiff")));
        assert!(!has_input_extension(Path::new("notes.txt")));
        assert!(!has_input_extension(Path::new("no_extension")));
    }

    #[test]
    fn exit_code_is_positive() {
        let err = OptimizerError::UnsupportedFormat("heic".into());
        assert_eq!(exit_code(&err), 4);
    }
}
