// Dependency Resolver
// Pinned and minimum-version resolution over declared constraints

pub mod constraint;
pub mod lockfile;
pub mod version;

pub use constraint::{normalize_package_name, DependencyConstraint};
pub use lockfile::LockSet;
pub use version::PackageVersion;

use constraint::format_bound;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Reasons a job's dependency set cannot be resolved.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("no version of '{package}' satisfies {bound}")]
    Unsatisfiable { package: String, bound: String },

    #[error("constraints on '{package}' conflict: '{lower}' and '{upper}' have disjoint bounds")]
    Conflict {
        package: String,
        lower: String,
        upper: String,
    },

    #[error("lock file has no pin for required package '{package}'")]
    MissingPin { package: String },

    #[error("invalid constraint '{input}': {reason}")]
    InvalidConstraint { input: String, reason: String },

    #[error("invalid version '{input}'")]
    InvalidVersion { input: String },

    #[error("cannot read lock file {path}: {reason}")]
    LockFile { path: String, reason: String },
}

/// How a job's dependency set is chosen.
#[derive(Debug, Clone)]
pub enum ResolutionMode {
    /// Use the supplied lock set as-is
    Pinned(LockSet),
    /// Use the tightest declared lower bound per package. The lock set, when
    /// present, only names transitive packages to report as unconstrained.
    Minimum(Option<LockSet>),
}

impl ResolutionMode {
    pub fn kind(&self) -> ResolutionKind {
        match self {
            ResolutionMode::Pinned(_) => ResolutionKind::Pinned,
            ResolutionMode::Minimum(_) => ResolutionKind::Minimum,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionKind {
    Pinned,
    Minimum,
}

impl fmt::Display for ResolutionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolutionKind::Pinned => write!(f, "pinned"),
            ResolutionKind::Minimum => write!(f, "minimum"),
        }
    }
}

/// The version chosen for one package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolvedVersion {
    Exact(PackageVersion),
    /// Left to the installer. The installed version may differ between runs.
    Unconstrained,
}

impl fmt::Display for ResolvedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolvedVersion::Exact(v) => write!(f, "{}", v),
            ResolvedVersion::Unconstrained => write!(f, "*"),
        }
    }
}

/// Resolution output: one entry per package named by any constraint, plus
/// the lock file's remaining packages as transitive entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedDependencySet {
    pub mode: ResolutionKind,
    pub packages: BTreeMap<String, ResolvedVersion>,
    pub transitive: BTreeMap<String, ResolvedVersion>,
}

impl ResolvedDependencySet {
    pub fn get(&self, package: &str) -> Option<&ResolvedVersion> {
        let name = normalize_package_name(package);
        self.packages.get(&name).or_else(|| self.transitive.get(&name))
    }

    /// Packages whose version is left to the installer.
    pub fn unconstrained(&self) -> impl Iterator<Item = &String> {
        self.packages
            .iter()
            .chain(self.transitive.iter())
            .filter(|(_, v)| matches!(v, ResolvedVersion::Unconstrained))
            .map(|(name, _)| name)
    }

    pub fn len(&self) -> usize {
        self.packages.len() + self.transitive.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Render as a requirements file for the installer.
    pub fn to_requirements(&self) -> String {
        let mut out = String::new();
        for (name, version) in self.packages.iter().chain(self.transitive.iter()) {
            match version {
                ResolvedVersion::Exact(v) => out.push_str(&format!("{}=={}\n", name, v)),
                ResolvedVersion::Unconstrained => out.push_str(&format!("{}\n", name)),
            }
        }
        out
    }
}

/// Versions known to exist for a package.
pub trait PackageIndex: Send + Sync {
    /// Available versions, or `None` when the index knows nothing about the package.
    fn versions(&self, package: &str) -> Option<Vec<PackageVersion>>;
}

/// An index backed by a fixed table.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct StaticPackageIndex {
    entries: BTreeMap<String, Vec<PackageVersion>>,
}

impl StaticPackageIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_versions(mut self, package: &str, versions: Vec<PackageVersion>) -> Self {
        self.entries.insert(normalize_package_name(package), versions);
        self
    }
}

impl PackageIndex for StaticPackageIndex {
    fn versions(&self, package: &str) -> Option<Vec<PackageVersion>> {
        self.entries.get(&normalize_package_name(package)).cloned()
    }
}

/// Merged bound for one package, remembering which constraint set each side.
struct MergedBound<'a> {
    lower: Option<(&'a PackageVersion, &'a DependencyConstraint)>,
    upper: Option<(&'a PackageVersion, &'a DependencyConstraint)>,
}

/// Resolves constraint sets in either [`ResolutionMode`].
#[derive(Clone, Default)]
pub struct DependencyResolver {
    index: Option<Arc<dyn PackageIndex>>,
}

impl DependencyResolver {
    pub fn new() -> Self {
        Self { index: None }
    }

    /// Consult an index so minimum mode picks the smallest published version
    /// inside the bound instead of the bound itself.
    pub fn with_index(mut self, index: Arc<dyn PackageIndex>) -> Self {
        self.index = Some(index);
        self
    }

    pub fn resolve(
        &self,
        constraints: &[DependencyConstraint],
        mode: &ResolutionMode,
    ) -> Result<ResolvedDependencySet, ResolveError> {
        let bounds = merge_bounds(constraints)?;

        let result = match mode {
            ResolutionMode::Pinned(lock) => self.resolve_pinned(&bounds, lock)?,
            ResolutionMode::Minimum(lock) => self.resolve_minimum(&bounds, lock.as_ref())?,
        };

        tracing::debug!(
            mode = %result.mode,
            packages = result.packages.len(),
            transitive = result.transitive.len(),
            "resolved dependency set"
        );

        Ok(result)
    }

    fn resolve_pinned(
        &self,
        bounds: &BTreeMap<&str, MergedBound<'_>>,
        lock: &LockSet,
    ) -> Result<ResolvedDependencySet, ResolveError> {
        let mut packages = BTreeMap::new();

        for (&name, bound) in bounds {
            let pinned = lock.get(name).ok_or_else(|| ResolveError::MissingPin {
                package: name.to_string(),
            })?;

            let below = bound.lower.map_or(false, |(min, _)| pinned < min);
            let above = bound.upper.map_or(false, |(max, _)| pinned > max);
            if below || above {
                tracing::warn!(
                    package = name,
                    pinned = %pinned,
                    bound = %format_bound(bound.lower.map(|b| b.0), bound.upper.map(|b| b.0)),
                    "pinned version lies outside the declared bound"
                );
            }

            packages.insert(name.to_string(), ResolvedVersion::Exact(pinned.clone()));
        }

        let transitive = lock
            .iter()
            .filter(|(name, _)| !packages.contains_key(*name))
            .map(|(name, v)| (name.clone(), ResolvedVersion::Exact(v.clone())))
            .collect();

        Ok(ResolvedDependencySet {
            mode: ResolutionKind::Pinned,
            packages,
            transitive,
        })
    }

    fn resolve_minimum(
        &self,
        bounds: &BTreeMap<&str, MergedBound<'_>>,
        lock: Option<&LockSet>,
    ) -> Result<ResolvedDependencySet, ResolveError> {
        let mut packages = BTreeMap::new();

        for (&name, bound) in bounds {
            let resolved = match bound.lower {
                Some((min, _)) => {
                    ResolvedVersion::Exact(self.smallest_in_bound(name, min, bound)?)
                }
                None => ResolvedVersion::Unconstrained,
            };
            packages.insert(name.to_string(), resolved);
        }

        let transitive: BTreeMap<String, ResolvedVersion> = lock
            .into_iter()
            .flat_map(|l| l.iter())
            .filter(|(name, _)| !packages.contains_key(*name))
            .map(|(name, _)| (name.clone(), ResolvedVersion::Unconstrained))
            .collect();

        let unconstrained: BTreeSet<&String> = packages
            .iter()
            .chain(transitive.iter())
            .filter(|(_, v)| matches!(v, ResolvedVersion::Unconstrained))
            .map(|(n, _)| n)
            .collect();
        if !unconstrained.is_empty() {
            // Only direct constraints are pinned to their minimum; the rest float.
            tracing::warn!(
                count = unconstrained.len(),
                packages = ?unconstrained,
                "minimum-version resolution leaves packages unconstrained"
            );
        }

        Ok(ResolvedDependencySet {
            mode: ResolutionKind::Minimum,
            packages,
            transitive,
        })
    }

    fn smallest_in_bound(
        &self,
        name: &str,
        min: &PackageVersion,
        bound: &MergedBound<'_>,
    ) -> Result<PackageVersion, ResolveError> {
        let Some(available) = self.index.as_ref().and_then(|idx| idx.versions(name)) else {
            return Ok(min.clone());
        };

        let mut available = available;
        available.sort();

        available
            .into_iter()
            .find(|v| v >= min && bound.upper.map_or(true, |(max, _)| v <= max))
            .ok_or_else(|| ResolveError::Unsatisfiable {
                package: name.to_string(),
                bound: format_bound(Some(min), bound.upper.map(|b| b.0)),
            })
    }
}

fn merge_bounds(
    constraints: &[DependencyConstraint],
) -> Result<BTreeMap<&str, MergedBound<'_>>, ResolveError> {
    let mut bounds: BTreeMap<&str, MergedBound<'_>> = BTreeMap::new();

    for constraint in constraints {
        if !constraint.is_satisfiable() {
            return Err(ResolveError::Unsatisfiable {
                package: constraint.package.clone(),
                bound: constraint.bound_text(),
            });
        }

        let entry = bounds
            .entry(constraint.package.as_str())
            .or_insert(MergedBound {
                lower: None,
                upper: None,
            });

        if let Some(min) = &constraint.minimum {
            if entry.lower.map_or(true, |(current, _)| min > current) {
                entry.lower = Some((min, constraint));
            }
        }
        if let Some(max) = &constraint.maximum {
            if entry.upper.map_or(true, |(current, _)| max < current) {
                entry.upper = Some((max, constraint));
            }
        }
    }

    for (name, bound) in &bounds {
        if let (Some((min, lower)), Some((max, upper))) = (bound.lower, bound.upper) {
            if min > max {
                return Err(ResolveError::Conflict {
                    package: name.to_string(),
                    lower: lower.to_string(),
                    upper: upper.to_string(),
                });
            }
        }
    }

    Ok(bounds)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(spec: &str) -> DependencyConstraint {
        spec.parse().unwrap()
    }

    fn v(s: &str) -> PackageVersion {
        PackageVersion::parse(s).unwrap()
    }

    #[test]
    fn test_minimum_takes_tightest_lower_bound() {
        let resolver = DependencyResolver::new();
        let set = resolver
            .resolve(&[c("A>=1.2"), c("A>=1.5")], &ResolutionMode::Minimum(None))
            .unwrap();

        assert_eq!(set.get("a"), Some(&ResolvedVersion::Exact(v("1.5"))));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_disjoint_bounds_conflict() {
        let resolver = DependencyResolver::new();
        let err = resolver
            .resolve(&[c("A>=1.0"), c("A<=0.9")], &ResolutionMode::Minimum(None))
            .unwrap_err();

        assert!(matches!(err, ResolveError::Conflict { ref package, .. } if package == "a"));
    }

    #[test]
    fn test_self_contradicting_constraint_is_unsatisfiable() {
        let resolver = DependencyResolver::new();
        let err = resolver
            .resolve(&[c("A>=2.0,<=1.0")], &ResolutionMode::Minimum(None))
            .unwrap_err();

        assert!(matches!(err, ResolveError::Unsatisfiable { .. }));
    }

    #[test]
    fn test_minimum_uses_index_when_bound_is_not_published() {
        let index = StaticPackageIndex::new().with_versions(
            "numpy",
            vec![v("1.20.3"), v("1.22.0"), v("1.21.6")],
        );
        let resolver = DependencyResolver::new().with_index(Arc::new(index));

        let set = resolver
            .resolve(&[c("numpy>=1.21")], &ResolutionMode::Minimum(None))
            .unwrap();
        assert_eq!(set.get("numpy"), Some(&ResolvedVersion::Exact(v("1.21.6"))));
    }

    #[test]
    fn test_index_without_version_in_bound_is_unsatisfiable() {
        let index = StaticPackageIndex::new().with_versions("numpy", vec![v("1.20"), v("2.0")]);
        let resolver = DependencyResolver::new().with_index(Arc::new(index));

        let err = resolver
            .resolve(&[c("numpy>=1.21,<=1.26")], &ResolutionMode::Minimum(None))
            .unwrap_err();
        assert!(matches!(err, ResolveError::Unsatisfiable { ref package, .. } if package == "numpy"));
    }

    #[test]
    fn test_minimum_marks_unbounded_and_transitive_packages() {
        let lock = LockSet::new()
            .pin("numpy", v("1.26.4"))
            .pin("packaging", v("24.0"));
        let resolver = DependencyResolver::new();

        let set = resolver
            .resolve(
                &[c("numpy>=1.21"), c("pyvisa")],
                &ResolutionMode::Minimum(Some(lock)),
            )
            .unwrap();

        assert_eq!(set.get("numpy"), Some(&ResolvedVersion::Exact(v("1.21"))));
        assert_eq!(set.get("pyvisa"), Some(&ResolvedVersion::Unconstrained));
        assert_eq!(set.get("packaging"), Some(&ResolvedVersion::Unconstrained));

        let unconstrained: Vec<_> = set.unconstrained().cloned().collect();
        assert_eq!(unconstrained, vec!["pyvisa".to_string(), "packaging".to_string()]);
    }

    #[test]
    fn test_pinned_uses_lock_as_is() {
        let lock = LockSet::new()
            .pin("numpy", v("1.26.4"))
            .pin("packaging", v("24.0"));
        let resolver = DependencyResolver::new();

        let set = resolver
            .resolve(&[c("numpy>=1.21")], &ResolutionMode::Pinned(lock))
            .unwrap();

        assert_eq!(set.mode, ResolutionKind::Pinned);
        assert_eq!(set.get("numpy"), Some(&ResolvedVersion::Exact(v("1.26.4"))));
        assert_eq!(
            set.transitive.get("packaging"),
            Some(&ResolvedVersion::Exact(v("24.0")))
        );
        assert_eq!(set.unconstrained().count(), 0);
    }

    #[test]
    fn test_pinned_requires_every_package() {
        let lock = LockSet::new().pin("numpy", v("1.26.4"));
        let resolver = DependencyResolver::new();

        let err = resolver
            .resolve(&[c("numpy>=1.21"), c("scipy>=1.7")], &ResolutionMode::Pinned(lock))
            .unwrap_err();
        assert_eq!(
            err,
            ResolveError::MissingPin {
                package: "scipy".to_string()
            }
        );
    }

    #[test]
    fn test_requirements_rendering() {
        let resolver = DependencyResolver::new();
        let set = resolver
            .resolve(&[c("numpy>=1.21"), c("pyvisa")], &ResolutionMode::Minimum(None))
            .unwrap();

        assert_eq!(set.to_requirements(), "numpy==1.21\npyvisa\n");
    }
}
