// Lock Files
// Requirements-style pinned dependency sets

use crate::resolver::constraint::normalize_package_name;
use crate::resolver::version::PackageVersion;
use crate::resolver::ResolveError;

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Externally supplied pins, one exact version per package.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockSet {
    pins: BTreeMap<String, PackageVersion>,
}

impl LockSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a pin.
    pub fn pin(mut self, package: &str, version: PackageVersion) -> Self {
        self.pins.insert(normalize_package_name(package), version);
        self
    }

    /// Parse `name==version` lines. Blank lines, `#` comments and trailing
    /// environment markers (`; python_version < "3.11"`) are ignored.
    pub fn parse(content: &str) -> Result<Self, ResolveError> {
        let mut pins = BTreeMap::new();

        for line in content.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            let line = line.split(';').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }

            let (name, version) =
                line.split_once("==")
                    .ok_or_else(|| ResolveError::InvalidConstraint {
                        input: line.to_string(),
                        reason: "lock entries must be exact `name==version` pins".to_string(),
                    })?;

            pins.insert(normalize_package_name(name), PackageVersion::parse(version)?);
        }

        Ok(Self { pins })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ResolveError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| ResolveError::LockFile {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::parse(&content)
    }

    pub fn get(&self, package: &str) -> Option<&PackageVersion> {
        self.pins.get(&normalize_package_name(package))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PackageVersion)> {
        self.pins.iter()
    }

    pub fn len(&self) -> usize {
        self.pins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pins.is_empty()
    }
}
