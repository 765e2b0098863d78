//! Dependency and version resolution for modules
//!
//! Each module may declare dependency specs: a target module, a kind
//! (required, optional, conflicting, suggested), a version constraint, and
//! an optional platform gate. The manager checks declarations against what
//! is loaded, auto-resolves missing required dependencies through a
//! `ModuleProvider`, detects cycles with an in-flight set, and produces a
//! topological load order.

use std::collections::{HashMap, HashSet, VecDeque};
use thiserror::Error;

use astc_container::ArchTag;

use crate::platform::{Os, Platform};
use crate::semver::{SemverError, Version, VersionConstraint};

/// Errors from dependency checking and resolution
#[derive(Debug, Error)]
pub enum DepError {
    /// A version string failed to parse
    #[error(transparent)]
    InvalidVersion(#[from] SemverError),

    /// A present dependency does not satisfy its constraint
    #[error("Version conflict: {module} requires {dependency} {constraint}, found {found}")]
    VersionConflict {
        /// The module declaring the dependency
        module: String,
        /// The dependency target
        dependency: String,
        /// The unsatisfied constraint, rendered
        constraint: String,
        /// The version that was found
        found: Version,
    },

    /// A required dependency is absent and could not be auto-resolved
    #[error("Missing dependency: {module} requires {dependency}{detail}")]
    MissingDependency {
        /// The module declaring the dependency
        module: String,
        /// The absent dependency
        dependency: String,
        /// Extra failure detail (load error text), possibly empty
        detail: String,
    },

    /// A module declared as conflicting is loaded
    #[error("Conflicting module: {module} conflicts with loaded {conflict}")]
    ConflictingModule {
        /// The module declaring the conflict
        module: String,
        /// The loaded module it conflicts with
        conflict: String,
    },

    /// A dependency's platform gate does not match the host
    #[error("Incompatible platform: {module} dependency {dependency} is gated off {platform}")]
    IncompatiblePlatform {
        /// The module declaring the dependency
        module: String,
        /// The gated dependency
        dependency: String,
        /// The host platform description
        platform: String,
    },

    /// The dependency graph contains a cycle
    #[error("Cyclic dependency: {0}")]
    CyclicDependency(String),

    /// A module name has no registered dependency info
    #[error("Unknown module: {0}")]
    UnknownModule(String),
}

/// How a module relates to a dependency target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyKind {
    /// Must be present (auto-resolved when possible)
    Required,
    /// Used when present, skipped when absent
    Optional,
    /// Must not be present
    Conflicting,
    /// Recorded for diagnostics only
    Suggested,
}

/// Platform/architecture gate on a dependency spec
///
/// `None` fields match anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformGate {
    /// Required OS family
    pub os: Option<Os>,
    /// Required architecture
    pub arch: Option<ArchTag>,
}

impl PlatformGate {
    /// Whether the host platform passes this gate
    pub fn allows(&self, platform: &Platform) -> bool {
        if let Some(os) = self.os {
            if os != platform.os {
                return false;
            }
        }
        if let Some(arch) = self.arch {
            if Some(arch) != platform.arch {
                return false;
            }
        }
        true
    }
}

/// One declared dependency of a module
#[derive(Debug, Clone)]
pub struct DependencySpec {
    /// Target module name
    pub target: String,
    /// Relationship kind
    pub kind: DependencyKind,
    /// Version constraint on the target, if any
    pub constraint: Option<VersionConstraint>,
    /// Platform gate, if any
    pub gate: Option<PlatformGate>,
}

impl DependencySpec {
    /// A required dependency with a constraint
    pub fn required(target: &str, constraint: VersionConstraint) -> Self {
        Self {
            target: target.to_string(),
            kind: DependencyKind::Required,
            constraint: Some(constraint),
            gate: None,
        }
    }

    /// An optional dependency
    pub fn optional(target: &str) -> Self {
        Self {
            target: target.to_string(),
            kind: DependencyKind::Optional,
            constraint: None,
            gate: None,
        }
    }

    /// A conflicting dependency
    pub fn conflicting(target: &str) -> Self {
        Self {
            target: target.to_string(),
            kind: DependencyKind::Conflicting,
            constraint: None,
            gate: None,
        }
    }

    /// Attach a platform gate
    pub fn gated(mut self, gate: PlatformGate) -> Self {
        self.gate = Some(gate);
        self
    }
}

/// A module's identity and declared dependencies
///
/// Whether the module is currently loaded is the registry's business, not
/// this record's.
#[derive(Debug, Clone)]
pub struct ModuleDependencyInfo {
    /// Module name
    pub name: String,
    /// Module version
    pub version: Version,
    /// Declared dependency specs
    pub deps: Vec<DependencySpec>,
}

impl ModuleDependencyInfo {
    /// Create a record with no dependencies
    pub fn new(name: &str, version: Version) -> Self {
        Self {
            name: name.to_string(),
            version,
            deps: Vec::new(),
        }
    }

    /// Add a dependency spec
    pub fn with_dep(mut self, spec: DependencySpec) -> Self {
        self.deps.push(spec);
        self
    }
}

/// Source of loadedness and on-demand loading for auto-resolution
///
/// The module registry implements this for real loads; tests substitute a
/// table-backed fake.
pub trait ModuleProvider {
    /// Version of the named module if it is currently loaded
    fn loaded_version(&self, name: &str) -> Option<Version>;

    /// Attempt to load the named module, returning its version
    fn load(&mut self, name: &str) -> Result<Version, String>;
}

/// Dependency manager: registered dep info, resolution policy, and checks
pub struct DependencyManager {
    modules: HashMap<String, ModuleDependencyInfo>,
    platform: Platform,
    /// Auto-load absent required dependencies through the provider
    pub auto_resolve: bool,
    /// Let prereleases satisfy constraints that did not opt in
    pub allow_prerelease: bool,
}

impl DependencyManager {
    /// Create a manager for the given host platform
    pub fn new(platform: Platform) -> Self {
        Self {
            modules: HashMap::new(),
            platform,
            auto_resolve: true,
            allow_prerelease: false,
        }
    }

    /// Register (or replace) a module's dependency info
    pub fn register(&mut self, info: ModuleDependencyInfo) {
        self.modules.insert(info.name.clone(), info);
    }

    /// Registered info for a module
    pub fn info(&self, name: &str) -> Option<&ModuleDependencyInfo> {
        self.modules.get(name)
    }

    /// Check the named module's dependencies against the provider's state,
    /// auto-resolving absent required deps when enabled
    pub fn check(
        &self,
        name: &str,
        provider: &mut dyn ModuleProvider,
    ) -> Result<(), DepError> {
        let mut in_flight = HashSet::new();
        self.check_inner(name, provider, &mut in_flight)
    }

    fn check_inner(
        &self,
        name: &str,
        provider: &mut dyn ModuleProvider,
        in_flight: &mut HashSet<String>,
    ) -> Result<(), DepError> {
        if !in_flight.insert(name.to_string()) {
            let mut path: Vec<&str> = in_flight.iter().map(|s| s.as_str()).collect();
            path.sort_unstable();
            return Err(DepError::CyclicDependency(format!(
                "{} re-entered while resolving {{{}}}",
                name,
                path.join(", ")
            )));
        }

        let result = self.check_deps(name, provider, in_flight);
        in_flight.remove(name);
        result
    }

    fn check_deps(
        &self,
        name: &str,
        provider: &mut dyn ModuleProvider,
        in_flight: &mut HashSet<String>,
    ) -> Result<(), DepError> {
        let info = match self.modules.get(name) {
            Some(info) => info,
            // No declarations means nothing to check.
            None => return Ok(()),
        };

        for dep in &info.deps {
            if let Some(gate) = &dep.gate {
                if !gate.allows(&self.platform) {
                    return Err(DepError::IncompatiblePlatform {
                        module: info.name.clone(),
                        dependency: dep.target.clone(),
                        platform: format!("{}/{}", self.platform.os, self.platform.arch_str()),
                    });
                }
            }

            let present = provider.loaded_version(&dep.target);
            match dep.kind {
                DependencyKind::Required => {
                    let version = match present {
                        Some(v) => v,
                        None => {
                            if !self.auto_resolve {
                                return Err(DepError::MissingDependency {
                                    module: info.name.clone(),
                                    dependency: dep.target.clone(),
                                    detail: String::new(),
                                });
                            }
                            if in_flight.contains(&dep.target) {
                                return Err(DepError::CyclicDependency(format!(
                                    "{} -> {} closes a load cycle",
                                    info.name, dep.target
                                )));
                            }
                            let loaded =
                                provider.load(&dep.target).map_err(|e| {
                                    DepError::MissingDependency {
                                        module: info.name.clone(),
                                        dependency: dep.target.clone(),
                                        detail: format!(" ({})", e),
                                    }
                                })?;
                            // A freshly loaded dependency gets its own deps
                            // checked while this module is still in flight.
                            self.check_inner(&dep.target, provider, in_flight)?;
                            loaded
                        }
                    };
                    if let Some(constraint) = &dep.constraint {
                        if !constraint.matches(&version, self.allow_prerelease) {
                            return Err(DepError::VersionConflict {
                                module: info.name.clone(),
                                dependency: dep.target.clone(),
                                constraint: constraint.to_string(),
                                found: version,
                            });
                        }
                    }
                }
                DependencyKind::Conflicting => {
                    if let Some(version) = present {
                        let conflicts = match &dep.constraint {
                            Some(c) => c.matches(&version, true),
                            None => true,
                        };
                        if conflicts {
                            return Err(DepError::ConflictingModule {
                                module: info.name.clone(),
                                conflict: dep.target.clone(),
                            });
                        }
                    }
                }
                DependencyKind::Optional | DependencyKind::Suggested => {
                    // Absent is fine; a present optional still has to satisfy
                    // its constraint.
                    if let (Some(version), Some(constraint)) = (present, &dep.constraint) {
                        if dep.kind == DependencyKind::Optional
                            && !constraint.matches(&version, self.allow_prerelease)
                        {
                            return Err(DepError::VersionConflict {
                                module: info.name.clone(),
                                dependency: dep.target.clone(),
                                constraint: constraint.to_string(),
                                found: version,
                            });
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Produce a load order over all registered modules: dependencies before
    /// dependents
    ///
    /// Verifies required constraints and conflicts against the registered
    /// versions first, then runs Kahn's algorithm; a cycle is reported with
    /// its path.
    pub fn resolve_order(&self) -> Result<Vec<String>, DepError> {
        // Constraint pass over declared versions.
        for info in self.modules.values() {
            for dep in &info.deps {
                match dep.kind {
                    DependencyKind::Required => {
                        let target = self.modules.get(&dep.target).ok_or_else(|| {
                            DepError::MissingDependency {
                                module: info.name.clone(),
                                dependency: dep.target.clone(),
                                detail: String::new(),
                            }
                        })?;
                        if let Some(constraint) = &dep.constraint {
                            if !constraint.matches(&target.version, self.allow_prerelease) {
                                return Err(DepError::VersionConflict {
                                    module: info.name.clone(),
                                    dependency: dep.target.clone(),
                                    constraint: constraint.to_string(),
                                    found: target.version.clone(),
                                });
                            }
                        }
                    }
                    DependencyKind::Conflicting => {
                        if self.modules.contains_key(&dep.target) {
                            return Err(DepError::ConflictingModule {
                                module: info.name.clone(),
                                conflict: dep.target.clone(),
                            });
                        }
                    }
                    DependencyKind::Optional | DependencyKind::Suggested => {}
                }
            }
        }

        if let Some(cycle) = self.detect_cycle() {
            return Err(DepError::CyclicDependency(cycle.join(" -> ")));
        }

        // Kahn's algorithm over required edges (and optional edges whose
        // target is registered): in-degree = number of dependencies.
        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for info in self.modules.values() {
            in_degree.entry(info.name.as_str()).or_insert(0);
            for dep in &info.deps {
                if self.edge_applies(dep) {
                    *in_degree.entry(info.name.as_str()).or_insert(0) += 1;
                    dependents
                        .entry(dep.target.as_str())
                        .or_default()
                        .push(info.name.as_str());
                }
            }
        }

        let mut ready: VecDeque<&str> = {
            let mut roots: Vec<&str> = in_degree
                .iter()
                .filter(|(_, &d)| d == 0)
                .map(|(&n, _)| n)
                .collect();
            // Deterministic order for ties.
            roots.sort_unstable();
            roots.into()
        };

        let mut order = Vec::with_capacity(self.modules.len());
        while let Some(name) = ready.pop_front() {
            order.push(name.to_string());
            if let Some(deps) = dependents.get(name) {
                let mut unblocked: Vec<&str> = Vec::new();
                for &dependent in deps {
                    let degree = in_degree.get_mut(dependent).unwrap();
                    *degree -= 1;
                    if *degree == 0 {
                        unblocked.push(dependent);
                    }
                }
                unblocked.sort_unstable();
                ready.extend(unblocked);
            }
        }
        Ok(order)
    }

    fn edge_applies(&self, dep: &DependencySpec) -> bool {
        match dep.kind {
            DependencyKind::Required => true,
            DependencyKind::Optional => self.modules.contains_key(&dep.target),
            DependencyKind::Conflicting | DependencyKind::Suggested => false,
        }
    }

    fn detect_cycle(&self) -> Option<Vec<String>> {
        let mut visited = HashSet::new();
        let mut stack = HashSet::new();
        let mut path = Vec::new();
        let mut names: Vec<&String> = self.modules.keys().collect();
        names.sort_unstable();
        for name in names {
            if !visited.contains(name.as_str()) {
                if let Some(cycle) = self.dfs_cycle(name, &mut visited, &mut stack, &mut path) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    fn dfs_cycle(
        &self,
        node: &str,
        visited: &mut HashSet<String>,
        stack: &mut HashSet<String>,
        path: &mut Vec<String>,
    ) -> Option<Vec<String>> {
        visited.insert(node.to_string());
        stack.insert(node.to_string());
        path.push(node.to_string());

        if let Some(info) = self.modules.get(node) {
            for dep in &info.deps {
                if !self.edge_applies(dep) || !self.modules.contains_key(&dep.target) {
                    continue;
                }
                if !visited.contains(&dep.target) {
                    if let Some(cycle) = self.dfs_cycle(&dep.target, visited, stack, path) {
                        return Some(cycle);
                    }
                } else if stack.contains(&dep.target) {
                    let start = path.iter().position(|m| m == &dep.target).unwrap();
                    let mut cycle = path[start..].to_vec();
                    cycle.push(dep.target.clone());
                    return Some(cycle);
                }
            }
        }

        stack.remove(node);
        path.pop();
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semver::ConstraintKind;

    fn test_platform() -> Platform {
        Platform {
            arch: Some(ArchTag::X64),
            bits: 64,
            os: Os::Linux,
        }
    }

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    /// Table-backed provider: a set of loaded modules plus loadable ones.
    struct FakeProvider {
        loaded: HashMap<String, Version>,
        available: HashMap<String, Version>,
        load_log: Vec<String>,
    }

    impl FakeProvider {
        fn new() -> Self {
            Self {
                loaded: HashMap::new(),
                available: HashMap::new(),
                load_log: Vec::new(),
            }
        }

        fn loaded(mut self, name: &str, version: &str) -> Self {
            self.loaded.insert(name.to_string(), v(version));
            self
        }

        fn available(mut self, name: &str, version: &str) -> Self {
            self.available.insert(name.to_string(), v(version));
            self
        }
    }

    impl ModuleProvider for FakeProvider {
        fn loaded_version(&self, name: &str) -> Option<Version> {
            self.loaded.get(name).cloned()
        }

        fn load(&mut self, name: &str) -> Result<Version, String> {
            let version = self
                .available
                .get(name)
                .cloned()
                .ok_or_else(|| format!("no such module: {}", name))?;
            self.loaded.insert(name.to_string(), version.clone());
            self.load_log.push(name.to_string());
            Ok(version)
        }
    }

    fn chain_manager(c_version: &str) -> DependencyManager {
        // A v1.0.0 requires B ^1.0; B v1.2.3 requires C >= 1.0; C is a leaf.
        let mut mgr = DependencyManager::new(test_platform());
        mgr.register(ModuleDependencyInfo::new("a", v("1.0.0")).with_dep(
            DependencySpec::required("b", VersionConstraint::new(ConstraintKind::CompatibleMajor(v("1.0.0")))),
        ));
        mgr.register(ModuleDependencyInfo::new("b", v("1.2.3")).with_dep(
            DependencySpec::required("c", VersionConstraint::new(ConstraintKind::Min(v("1.0.0")))),
        ));
        mgr.register(ModuleDependencyInfo::new("c", v(c_version)));
        mgr
    }

    #[test]
    fn test_resolve_order_chain() {
        let order = chain_manager("1.0.0").resolve_order().unwrap();
        assert_eq!(order, vec!["c", "b", "a"]);
    }

    #[test]
    fn test_resolve_order_version_conflict_points_at_dependent() {
        let err = chain_manager("0.9.0").resolve_order().unwrap_err();
        match err {
            DepError::VersionConflict {
                module, dependency, ..
            } => {
                assert_eq!(module, "b");
                assert_eq!(dependency, "c");
            }
            other => panic!("expected VersionConflict, got {:?}", other),
        }
    }

    #[test]
    fn test_resolve_order_cycle() {
        let mut mgr = DependencyManager::new(test_platform());
        mgr.register(ModuleDependencyInfo::new("a", v("1.0.0")).with_dep(
            DependencySpec::required("b", VersionConstraint::new(ConstraintKind::Min(v("1.0.0")))),
        ));
        mgr.register(ModuleDependencyInfo::new("b", v("1.0.0")).with_dep(
            DependencySpec::required("a", VersionConstraint::new(ConstraintKind::Min(v("1.0.0")))),
        ));
        assert!(matches!(
            mgr.resolve_order(),
            Err(DepError::CyclicDependency(_))
        ));
    }

    #[test]
    fn test_check_satisfied() {
        let mgr = chain_manager("1.0.0");
        let mut provider = FakeProvider::new()
            .loaded("b", "1.2.3")
            .loaded("c", "1.0.0");
        mgr.check("a", &mut provider).unwrap();
    }

    #[test]
    fn test_check_auto_resolves_missing_required() {
        let mgr = chain_manager("1.0.0");
        let mut provider = FakeProvider::new()
            .available("b", "1.2.3")
            .available("c", "1.0.0");
        mgr.check("a", &mut provider).unwrap();
        // b's own deps were resolved too.
        assert_eq!(provider.load_log, vec!["b", "c"]);
    }

    #[test]
    fn test_check_missing_without_auto_resolve() {
        let mut mgr = chain_manager("1.0.0");
        mgr.auto_resolve = false;
        let mut provider = FakeProvider::new();
        assert!(matches!(
            mgr.check("a", &mut provider),
            Err(DepError::MissingDependency { .. })
        ));
    }

    #[test]
    fn test_check_unresolvable_required() {
        let mgr = chain_manager("1.0.0");
        let mut provider = FakeProvider::new().available("b", "1.2.3");
        // c is nowhere to be found.
        let err = mgr.check("a", &mut provider).unwrap_err();
        match err {
            DepError::MissingDependency { module, dependency, .. } => {
                assert_eq!(module, "b");
                assert_eq!(dependency, "c");
            }
            other => panic!("expected MissingDependency, got {:?}", other),
        }
    }

    #[test]
    fn test_check_version_conflict() {
        let mgr = chain_manager("1.0.0");
        let mut provider = FakeProvider::new()
            .loaded("b", "2.0.0")
            .loaded("c", "1.0.0");
        assert!(matches!(
            mgr.check("a", &mut provider),
            Err(DepError::VersionConflict { .. })
        ));
    }

    #[test]
    fn test_check_conflicting_module() {
        let mut mgr = DependencyManager::new(test_platform());
        mgr.register(
            ModuleDependencyInfo::new("app", v("1.0.0"))
                .with_dep(DependencySpec::conflicting("legacy_rt")),
        );
        let mut provider = FakeProvider::new().loaded("legacy_rt", "0.4.0");
        assert!(matches!(
            mgr.check("app", &mut provider),
            Err(DepError::ConflictingModule { .. })
        ));
        // Absent conflict is fine.
        let mut clean = FakeProvider::new();
        mgr.check("app", &mut clean).unwrap();
    }

    #[test]
    fn test_check_optional_absent_is_ok() {
        let mut mgr = DependencyManager::new(test_platform());
        mgr.register(
            ModuleDependencyInfo::new("app", v("1.0.0"))
                .with_dep(DependencySpec::optional("extras")),
        );
        let mut provider = FakeProvider::new();
        mgr.check("app", &mut provider).unwrap();
    }

    #[test]
    fn test_platform_gate_failure() {
        let mut mgr = DependencyManager::new(test_platform());
        mgr.register(ModuleDependencyInfo::new("app", v("1.0.0")).with_dep(
            DependencySpec::optional("win_shim").gated(PlatformGate {
                os: Some(Os::Windows),
                arch: None,
            }),
        ));
        let mut provider = FakeProvider::new();
        assert!(matches!(
            mgr.check("app", &mut provider),
            Err(DepError::IncompatiblePlatform { .. })
        ));
    }

    #[test]
    fn test_cyclic_auto_resolve() {
        let mut mgr = DependencyManager::new(test_platform());
        mgr.register(ModuleDependencyInfo::new("x", v("1.0.0")).with_dep(
            DependencySpec::required("y", VersionConstraint::new(ConstraintKind::Min(v("1.0.0")))),
        ));
        mgr.register(ModuleDependencyInfo::new("y", v("1.0.0")).with_dep(
            DependencySpec::required("x", VersionConstraint::new(ConstraintKind::Min(v("1.0.0")))),
        ));
        let mut provider = FakeProvider::new()
            .available("x", "1.0.0")
            .available("y", "1.0.0");
        assert!(matches!(
            mgr.check("x", &mut provider),
            Err(DepError::CyclicDependency(_))
        ));
    }

    #[test]
    fn test_prerelease_gate() {
        let mut mgr = DependencyManager::new(test_platform());
        mgr.register(ModuleDependencyInfo::new("app", v("1.0.0")).with_dep(
            DependencySpec::required("core", VersionConstraint::new(ConstraintKind::Min(v("1.0.0")))),
        ));
        let mut provider = FakeProvider::new().loaded("core", "1.1.0-beta.1");
        assert!(matches!(
            mgr.check("app", &mut provider),
            Err(DepError::VersionConflict { .. })
        ));
        mgr.allow_prerelease = true;
        mgr.check("app", &mut provider).unwrap();
    }

    #[test]
    fn test_diamond_order() {
        let mut mgr = DependencyManager::new(test_platform());
        let min = |s: &str| VersionConstraint::new(ConstraintKind::Min(v(s)));
        mgr.register(
            ModuleDependencyInfo::new("top", v("1.0.0"))
                .with_dep(DependencySpec::required("left", min("1.0.0")))
                .with_dep(DependencySpec::required("right", min("1.0.0"))),
        );
        mgr.register(
            ModuleDependencyInfo::new("left", v("1.0.0"))
                .with_dep(DependencySpec::required("base", min("1.0.0"))),
        );
        mgr.register(
            ModuleDependencyInfo::new("right", v("1.0.0"))
                .with_dep(DependencySpec::required("base", min("1.0.0"))),
        );
        mgr.register(ModuleDependencyInfo::new("base", v("1.0.0")));

        let order = mgr.resolve_order().unwrap();
        let pos = |n: &str| order.iter().position(|m| m == n).unwrap();
        assert!(pos("base") < pos("left"));
        assert!(pos("base") < pos("right"));
        assert!(pos("left") < pos("top"));
        assert!(pos("right") < pos("top"));
    }
}
