use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use image::{DynamicImage, RgbImage};

fn pixopt(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_pixopt"))
        .args(args)
        .env("NO_COLOR", "1")
        .output()
        .expect("run pixopt")
}

fn stdout_json(output: &Output) -> serde_json::Value {
    serde_json::from_slice(&output.stdout).unwrap_or_else(|e| {
        panic!(
            "stdout is not JSON ({e}): {}\nstderr: {}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        )
    })
}

fn assert_schema_version(value: &serde_json::Value) {
    assert_eq!(
        value.get("schema_version").and_then(|v| v.as_u64()),
        Some(1),
        "missing schema_version=1 field"
    );
}

fn write_png(path: &Path, width: u32, height: u32) {
    let img = RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x * 5) as u8, (y * 9) as u8, 200])
    });
    DynamicImage::ImageRgb8(img)
        .save_with_format(path, image::ImageFormat::Png)
        .expect("write png");
}

fn path_str(path: &Path) -> &str {
    path.to_str().expect("utf-8 temp path")
}

#[test]
fn help_lists_subcommands() {
    let output = pixopt(&["help"]);
    assert!(
        output.status.success(),
        "pixopt help failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    for command in ["optimize", "info", "formats", "devices", "version"] {
        assert!(stdout.contains(command), "missing {command} in help output");
    }
}

#[test]
fn optimize_help_lists_pipeline_flags() {
    let output = pixopt(&["optimize", "--help"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for flag in [
        "--output-dir",
        "--format",
        "--quality",
        "--max-width",
        "--strip-metadata",
        "--cpu",
        "--model",
        "--denoise",
        "--json",
    ] {
        assert!(stdout.contains(flag), "missing {flag} in optimize help");
    }
}

#[test]
fn version_json_reports_build() {
    let output = pixopt(&["version", "--json"]);
    assert!(output.status.success());
    let value = stdout_json(&output);
    assert_schema_version(&value);
    assert_eq!(value["command"], "version");
    assert_eq!(value["version"]["major"], 0);
    assert_eq!(value["version"]["has_ai_support"], true);
    assert!(value["system"]["cpu_cores"].as_u64().unwrap() >= 1);
}

#[test]
fn formats_follow_the_config() {
    let output = pixopt(&["formats", "--json"]);
    assert!(output.status.success());
    let value = stdout_json(&output);
    assert_schema_version(&value);
    let names: Vec<&str> = value["formats"]
        .as_array()
        .unwrap()
        .iter()
        .map(|f| f["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, ["jpeg", "png", "webp", "avif"]);

    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("pixopt.json");
    fs::write(&config, r#"{"enable_formats":["heic"]}"#).unwrap();
    let output = pixopt(&["formats", "--json", "--config", path_str(&config)]);
    assert!(output.status.success());
    assert_eq!(stdout_json(&output)["formats"].as_array().unwrap().len(), 5);
}

#[test]
fn devices_json_lists_the_host_device() {
    let output = pixopt(&["devices", "--backend", "host", "--json"]);
    assert!(
        output.status.success(),
        "devices failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let value = stdout_json(&output);
    assert_schema_version(&value);
    assert_eq!(value["devices"].as_array().unwrap().len(), 1);
    assert_eq!(value["active"], 0);
}

#[test]
fn info_json_probes_dimensions() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("probe.png");
    write_png(&input, 31, 17);
    let output = pixopt(&["info", path_str(&input), "--json"]);
    assert!(output.status.success());
    let value = stdout_json(&output);
    assert_schema_version(&value);
    assert_eq!(value["width"], 31);
    assert_eq!(value["height"], 17);
    assert_eq!(value["format"], "png");
    assert_eq!(value["colorspace"], "rgb");
}

#[test]
fn info_on_missing_file_reports_file_io() {
    let output = pixopt(&["info", "/nonexistent/photo.png", "--json"]);
    assert!(!output.status.success());
    let value = stdout_json(&output);
    assert_schema_version(&value);
    assert_eq!(value["ok"], false);
    assert_eq!(value["code"], -2);
}

#[test]
fn optimize_directory_writes_one_file_per_image() {
    let dir = tempfile::tempdir().unwrap();
    let inputs = dir.path().join("in");
    let out = dir.path().join("out");
    fs::create_dir_all(&inputs).unwrap();
    write_png(&inputs.join("a.png"), 40, 30);
    write_png(&inputs.join("b.png"), 12, 12);
    fs::write(inputs.join("notes.txt"), b"not an image").unwrap();

    let output = pixopt(&[
        "optimize",
        path_str(&inputs),
        "--output-dir",
        path_str(&out),
        "--format",
        "png",
        "--max-width",
        "20",
        "--backend",
        "host",
        "--json",
    ]);
    assert!(
        output.status.success(),
        "optimize failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let value = stdout_json(&output);
    assert_schema_version(&value);
    assert_eq!(value["processed"], 2);
    assert_eq!(value["failed"], 0);

    let a = image::open(out.join("a.png")).unwrap();
    assert_eq!((a.width(), a.height()), (20, 15));
    let b = image::open(out.join("b.png")).unwrap();
    assert_eq!((b.width(), b.height()), (12, 12));
    assert!(!out.join("notes.png").exists());
}

#[test]
fn failed_item_sets_exit_status() {
    let dir = tempfile::tempdir().unwrap();
    let good = dir.path().join("good.png");
    let bad = dir.path().join("bad.png");
    write_png(&good, 8, 8);
    fs::write(&bad, b"\x89PNG garbage").unwrap();
    let out = dir.path().join("out");

    let output = pixopt(&[
        "optimize",
        path_str(&good),
        path_str(&bad),
        "-o",
        path_str(&out),
        "--format",
        "jpeg",
        "--backend",
        "host",
        "--json",
    ]);
    assert_eq!(output.status.code(), Some(1));
    let value = stdout_json(&output);
    assert_eq!(value["ok"], false);
    assert_eq!(value["processed"], 1);
    assert_eq!(value["failed"], 1);
    assert!(out.join("good.jpg").exists());
    assert!(!out.join("bad.jpg").exists());
}

#[test]
fn enhancement_without_model_fails_each_item() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.png");
    write_png(&input, 8, 8);
    let output = pixopt(&[
        "optimize",
        path_str(&input),
        "-o",
        path_str(&dir.path().join("out")),
        "--denoise",
        "0.3",
        "--backend",
        "host",
        "--json",
    ]);
    assert_eq!(output.status.code(), Some(1));
    let value = stdout_json(&output);
    assert_eq!(value["items"][0]["code"], -1);
}

#[test]
fn enhancement_with_manifest_runs() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.png");
    write_png(&input, 10, 8);
    let manifest = dir.path().join("sr.json");
    fs::write(&manifest, r#"{"name":"sr-x2","model_type":"super_resolution"}"#).unwrap();
    let out = dir.path().join("out");

    let model = format!("super_resolution={}", path_str(&manifest));
    let output = pixopt(&[
        "optimize",
        path_str(&input),
        "-o",
        path_str(&out),
        "--format",
        "png",
        "--model",
        &model,
        "--super-resolution",
        "2",
        "--backend",
        "host",
    ]);
    assert!(
        output.status.success(),
        "optimize failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let upscaled = image::open(out.join("in.png")).unwrap();
    assert_eq!((upscaled.width(), upscaled.height()), (20, 16));
}

#[test]
fn bad_quality_is_rejected_before_work() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out");
    let output = pixopt(&[
        "optimize",
        "whatever.png",
        "-o",
        path_str(&out),
        "--quality",
        "0",
        "--json",
    ]);
    assert!(!output.status.success());
    let value = stdout_json(&output);
    assert_eq!(value["code"], -1);
    assert!(!out.exists());
}
