#![doc = include_str!("../README.md")]

pub mod filters;
pub mod manifest;
pub mod reference;
pub mod registry;

pub use manifest::load_manifest;
pub use reference::ReferenceBackend;
pub use registry::{Enhanced, ModelRegistry};
