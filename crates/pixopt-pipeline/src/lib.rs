#![doc = include_str!("../README.md")]

pub mod config;
pub mod info;
pub mod optimizer;
mod stages;

pub use config::OptimizerConfig;
pub use info::{SystemInfo, VersionInfo, system_info, version_info, version_string};
pub use optimizer::{BackendFactory, Optimizer, OptimizerBuilder};

#[cfg(test)]
mod tests {
    use super::OptimizerConfig;

    #[test]
    fn strict_no_host_copies_defaults_to_off() {
        assert!(!OptimizerConfig::default().strict_no_host_copies);
    }

    #[cfg(feature = "audit-no-host-copies")]
    #[test]
    fn audit_feature_wires_to_core_guard() {
        let baseline = pixopt_core::host_copy_audit::is_strict_mode();
        {
            let _guard = pixopt_core::host_copy_audit::push_strict_mode(true);
            assert!(pixopt_core::host_copy_audit::is_strict_mode());
        }
        assert_eq!(pixopt_core::host_copy_audit::is_strict_mode(), baseline);
    }
}
