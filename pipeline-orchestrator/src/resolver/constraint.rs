// Dependency Constraints
// Declared version bounds on a single package

use crate::resolver::version::PackageVersion;
use crate::resolver::ResolveError;

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

/// A declared bound on one package: `name>=min`, `name<=max`, `name==v`
/// (both bounds), or a bare `name` with no bound at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencyConstraint {
    /// Normalised package name
    pub package: String,
    /// Inclusive lower bound
    pub minimum: Option<PackageVersion>,
    /// Inclusive upper bound
    pub maximum: Option<PackageVersion>,
}

impl DependencyConstraint {
    pub fn new(package: impl AsRef<str>) -> Self {
        Self {
            package: normalize_package_name(package.as_ref()),
            minimum: None,
            maximum: None,
        }
    }

    pub fn at_least(mut self, version: PackageVersion) -> Self {
        self.minimum = Some(version);
        self
    }

    pub fn at_most(mut self, version: PackageVersion) -> Self {
        self.maximum = Some(version);
        self
    }

    /// Whether a version falls inside this constraint's bounds.
    pub fn allows(&self, version: &PackageVersion) -> bool {
        self.minimum.as_ref().map_or(true, |min| version >= min)
            && self.maximum.as_ref().map_or(true, |max| version <= max)
    }

    /// Whether the constraint's own bounds admit at least one version.
    pub fn is_satisfiable(&self) -> bool {
        match (&self.minimum, &self.maximum) {
            (Some(min), Some(max)) => min <= max,
            _ => true,
        }
    }

    /// Human-readable bound, e.g. `[1.2, 2.0]` or `[1.2, *)`.
    pub fn bound_text(&self) -> String {
        format_bound(self.minimum.as_ref(), self.maximum.as_ref())
    }
}

pub(crate) fn format_bound(min: Option<&PackageVersion>, max: Option<&PackageVersion>) -> String {
    match (min, max) {
        (Some(min), Some(max)) => format!("[{}, {}]", min, max),
        (Some(min), None) => format!("[{}, *)", min),
        (None, Some(max)) => format!("(*, {}]", max),
        (None, None) => "(*, *)".to_string(),
    }
}

impl fmt::Display for DependencyConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.minimum, &self.maximum) {
            (Some(min), Some(max)) if min == max => write!(f, "{}=={}", self.package, min),
            (Some(min), Some(max)) => write!(f, "{}>={},<={}", self.package, min, max),
            (Some(min), None) => write!(f, "{}>={}", self.package, min),
            (None, Some(max)) => write!(f, "{}<={}", self.package, max),
            (None, None) => write!(f, "{}", self.package),
        }
    }
}

impl FromStr for DependencyConstraint {
    type Err = ResolveError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ResolveError::InvalidConstraint {
            input: input.to_string(),
            reason: reason.to_string(),
        };

        let text = input.trim();
        let name_end = text
            .find(|c: char| matches!(c, '<' | '>' | '=' | '!' | '~' | ' '))
            .unwrap_or(text.len());
        let (name, rest) = text.split_at(name_end);

        if name.is_empty() {
            return Err(invalid("missing package name"));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(invalid("package name contains unsupported characters"));
        }

        let mut constraint = DependencyConstraint::new(name);

        for clause in rest.split(',').map(str::trim).filter(|c| !c.is_empty()) {
            if let Some(v) = clause.strip_prefix(">=") {
                constraint.minimum = Some(tighter_min(constraint.minimum, v.trim().parse()?));
            } else if let Some(v) = clause.strip_prefix("<=") {
                constraint.maximum = Some(tighter_max(constraint.maximum, v.trim().parse()?));
            } else if let Some(v) = clause.strip_prefix("==") {
                let version: PackageVersion = v.trim().parse()?;
                constraint.minimum = Some(tighter_min(constraint.minimum, version.clone()));
                constraint.maximum = Some(tighter_max(constraint.maximum, version));
            } else {
                return Err(invalid("only >=, <= and == clauses are supported"));
            }
        }

        Ok(constraint)
    }
}

fn tighter_min(current: Option<PackageVersion>, new: PackageVersion) -> PackageVersion {
    match current {
        Some(existing) if existing > new => existing,
        _ => new,
    }
}

fn tighter_max(current: Option<PackageVersion>, new: PackageVersion) -> PackageVersion {
    match current {
        Some(existing) if existing < new => existing,
        _ => new,
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawConstraint {
    Spec(String),
    Table {
        package: String,
        #[serde(default)]
        minimum: Option<PackageVersion>,
        #[serde(default)]
        maximum: Option<PackageVersion>,
    },
}

impl<'de> Deserialize<'de> for DependencyConstraint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match RawConstraint::deserialize(deserializer)? {
            RawConstraint::Spec(spec) => spec.parse().map_err(serde::de::Error::custom),
            RawConstraint::Table {
                package,
                minimum,
                maximum,
            } => Ok(DependencyConstraint {
                package: normalize_package_name(&package),
                minimum,
                maximum,
            }),
        }
    }
}

/// Normalise a package name so `Foo_Bar`, `foo.bar` and `foo-bar` compare equal.
pub fn normalize_package_name(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| match c {
            '_' | '.' => '-',
            c => c.to_ascii_lowercase(),
        })
        .collect()
}
