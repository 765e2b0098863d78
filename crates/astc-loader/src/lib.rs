//! ASTC module loader
//!
//! Everything between a `.native` file on disk and a callable symbol:
//! - **platform**: host architecture and pointer-width detection
//! - **semver**: version parsing, ordering, and constraint matching
//! - **deps**: dependency kinds, platform gates, resolution and load order
//! - **dynlib**: host dynamic-library fallback (dlopen / LoadLibraryW)
//! - **registry**: the name-keyed module registry with refcounts and
//!   most-recently-loaded-first global symbol resolution

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod deps;
pub mod dynlib;
pub mod platform;
pub mod registry;
pub mod semver;

pub use deps::{
    DepError, DependencyKind, DependencyManager, DependencySpec, ModuleDependencyInfo,
    ModuleProvider, PlatformGate,
};
pub use dynlib::DynLibrary;
pub use platform::{detect, module_file_name, Os, Platform};
pub use registry::{LoaderConfig, LoaderError, ModuleHandle, ModuleInfo, ModuleRegistry};
pub use semver::{ConstraintKind, SemverError, Version, VersionConstraint};
