//! Version and system information.

use serde::Serialize;

use pixopt_device::{CUDA_RUNTIME_ENABLED, cuda_available};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct VersionInfo {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    /// `<os>-<arch>` this binary was built for.
    pub build_platform: String,
    /// Whether the CUDA driver backend is linked.
    pub has_gpu_support: bool,
    /// Whether any inference backend is linked (the reference backend always is).
    pub has_ai_support: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SystemInfo {
    pub cpu_cores: usize,
    pub os: &'static str,
    pub arch: &'static str,
    pub cuda_runtime_enabled: bool,
    /// A CUDA device answered at probe time.
    pub cuda_available: bool,
}

/// `major.minor.patch`.
pub fn version_string() -> String {
    env!("CARGO_PKG_VERSION").to_owned()
}

pub fn version_info() -> VersionInfo {
    VersionInfo {
        major: env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0),
        minor: env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0),
        patch: env!("CARGO_PKG_VERSION_PATCH").parse().unwrap_or(0),
        build_platform: format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
        has_gpu_support: CUDA_RUNTIME_ENABLED,
        has_ai_support: true,
    }
}

pub fn system_info() -> SystemInfo {
    SystemInfo {
        cpu_cores: std::thread::available_parallelism().map_or(1, |n| n.get()),
        os: std::env::consts::OS,
        arch: std::env::consts::ARCH,
        cuda_runtime_enabled: CUDA_RUNTIME_ENABLED,
        cuda_available: cuda_available(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_parts_match_string() {
        let info = version_info();
        assert_eq!(
            version_string(),
            format!("{}.{}.{}", info.major, info.minor, info.patch)
        );
        assert!(info.has_ai_support);
    }

    #[test]
    fn system_info_reports_at_least_one_core() {
        let info = system_info();
        assert!(info.cpu_cores >= 1);
        if !info.cuda_runtime_enabled {
            assert!(!info.cuda_available);
        }
    }
}
