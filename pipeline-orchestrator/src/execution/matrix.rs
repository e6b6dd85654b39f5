// Matrix Strategy Expansion
// Expands declared axes plus include/exclude rules into concrete job specs

use crate::workflow::models::{JobDefinition, Matrix};

use serde::Serialize;
use serde_yaml::{Mapping, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;

/// Variant flag selecting minimum-version dependency resolution.
pub const MIN_VERSION_FLAG: &str = "min-version";

/// Problems with a declared matrix, reported before any job runs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MatrixError {
    #[error("value of axis '{axis}' must be a string, number or boolean")]
    NonScalarValue { axis: String },

    #[error("include rule #{rule} does not assign axis '{axis}'")]
    IncompleteInclusion { rule: usize, axis: String },

    #[error("key '{key}' is not a declared axis, so it must be a boolean variant flag")]
    NonBooleanFlag { key: String },

    #[error("matrix rule keys must be strings")]
    NonStringKey,
}

/// One named axis and its ordered candidate values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Axis {
    pub name: String,
    pub values: Vec<String>,
}

/// Ordered axes, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AxisSet {
    axes: Vec<Axis>,
}

impl AxisSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_axis<I, S>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.axes.push(Axis {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        });
        self
    }

    pub fn axes(&self) -> &[Axis] {
        &self.axes
    }

    pub fn contains(&self, name: &str) -> bool {
        self.axes.iter().any(|a| a.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.axes.is_empty()
    }
}

/// A value for every axis, kept in axis declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
pub struct AxisAssignment(Vec<(String, String)>);

impl AxisAssignment {
    pub fn get(&self, axis: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(name, _)| name == axis)
            .map(|(_, value)| value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(_, v)| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Display for AxisAssignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let values: Vec<&str> = self.values().collect();
        write!(f, "{}", values.join(", "))
    }
}

/// A partial assignment used to add (include) or remove (exclude) combinations.
///
/// Keys naming an axis constrain that axis; any other key is a boolean
/// variant flag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatrixRule {
    pub axes: BTreeMap<String, String>,
    pub flags: BTreeMap<String, bool>,
}

pub type InclusionRule = MatrixRule;
pub type ExclusionRule = MatrixRule;

impl MatrixRule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn axis(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.axes.insert(name.into(), value.into());
        self
    }

    pub fn flag(mut self, name: impl Into<String>, value: bool) -> Self {
        self.flags.insert(name.into(), value);
        self
    }

    fn enabled_flags(&self) -> BTreeSet<String> {
        self.flags
            .iter()
            .filter(|(_, on)| **on)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Axis constraints must all hold; unnamed axes are wildcards. Variant
    /// flags compare exactly, a flag the rule leaves out must be off.
    fn matches(&self, combination: &Combination) -> bool {
        self.axes
            .iter()
            .all(|(axis, value)| combination.assignment.get(axis) == Some(value.as_str()))
            && self.enabled_flags() == combination.flags
    }
}

/// Where a job spec came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecOrigin {
    Product,
    Included,
}

/// One expanded combination before it is bound to a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Combination {
    pub assignment: AxisAssignment,
    pub flags: BTreeSet<String>,
    pub origin: SpecOrigin,
}

/// A concrete job instance. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobSpec {
    /// Position in definition order
    pub index: usize,
    /// Job id from the definition
    pub job: String,
    /// Human-readable name, e.g. `Tests (ubuntu-latest, 3.10)`
    pub display_name: String,
    pub assignment: AxisAssignment,
    pub flags: BTreeSet<String>,
    pub origin: SpecOrigin,
}

impl JobSpec {
    /// Stable identity used for coverage tags and directories,
    /// e.g. `pytest[ubuntu-latest,3.10;min-version]`.
    pub fn id(&self) -> String {
        let values: Vec<&str> = self.assignment.values().collect();
        let mut id = self.job.clone();
        if !values.is_empty() || !self.flags.is_empty() {
            id.push('[');
            id.push_str(&values.join(","));
            if !self.flags.is_empty() {
                id.push(';');
                id.push_str(&self.flags.iter().cloned().collect::<Vec<_>>().join(","));
            }
            id.push(']');
        }
        id
    }

    /// File-system safe form of [`JobSpec::id`], prefixed by the instance index
    /// so duplicate inclusions stay apart.
    pub fn slug(&self) -> String {
        let id: String = self
            .id()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .collect();
        format!("{:03}-{}", self.index, id.trim_end_matches('_'))
    }

    /// Whether this instance installs the minimum dependency set. Either a
    /// variant flag or a `min-version` axis set to `true` selects it.
    pub fn is_minimum_version(&self) -> bool {
        self.flags.contains(MIN_VERSION_FLAG)
            || self.assignment.get(MIN_VERSION_FLAG) == Some("true")
    }
}

/// A matrix declaration converted to axis set and rules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatrixPlan {
    pub axis_set: AxisSet,
    pub inclusions: Vec<InclusionRule>,
    pub exclusions: Vec<ExclusionRule>,
}

/// Matrix expander for job strategies
pub struct MatrixExpander;

impl MatrixExpander {
    /// Expand an axis set and rules into combinations.
    ///
    /// Cartesian product in declaration order (last axis varies fastest),
    /// then one combination per inclusion, then exclusions over everything.
    pub fn expand(
        axis_set: &AxisSet,
        inclusions: &[InclusionRule],
        exclusions: &[ExclusionRule],
    ) -> Vec<Combination> {
        let mut combinations = Self::product(axis_set);

        combinations.extend(inclusions.iter().map(|rule| Combination {
            assignment: AxisAssignment(
                axis_set
                    .axes()
                    .iter()
                    .filter_map(|axis| {
                        rule.axes
                            .get(&axis.name)
                            .map(|v| (axis.name.clone(), v.clone()))
                    })
                    .collect(),
            ),
            flags: rule.enabled_flags(),
            origin: SpecOrigin::Included,
        }));

        combinations.retain(|combination| !exclusions.iter().any(|rule| rule.matches(combination)));
        combinations
    }

    fn product(axis_set: &AxisSet) -> Vec<Combination> {
        if axis_set.is_empty() {
            return Vec::new();
        }

        let mut partials: Vec<Vec<(String, String)>> = vec![Vec::new()];
        for axis in axis_set.axes() {
            partials = partials
                .into_iter()
                .flat_map(|prefix| {
                    axis.values.iter().map(move |value| {
                        let mut next = prefix.clone();
                        next.push((axis.name.clone(), value.clone()));
                        next
                    })
                })
                .collect();
        }

        partials
            .into_iter()
            .map(|pairs| Combination {
                assignment: AxisAssignment(pairs),
                flags: BTreeSet::new(),
                origin: SpecOrigin::Product,
            })
            .collect()
    }

    /// Convert a declared matrix into an axis set and rules, validating that
    /// every inclusion assigns every axis.
    pub fn plan(matrix: &Matrix) -> Result<MatrixPlan, MatrixError> {
        let mut axis_set = AxisSet::new();
        for (name, values) in &matrix.axes {
            let values = values
                .iter()
                .map(|v| scalar_text(v).ok_or_else(|| MatrixError::NonScalarValue { axis: name.clone() }))
                .collect::<Result<Vec<_>, _>>()?;
            axis_set = axis_set.with_axis(name.clone(), values);
        }

        let inclusions = matrix
            .include
            .iter()
            .map(|m| parse_rule(m, &axis_set))
            .collect::<Result<Vec<_>, _>>()?;

        for (index, rule) in inclusions.iter().enumerate() {
            if let Some(axis) = axis_set.axes().iter().find(|a| !rule.axes.contains_key(&a.name)) {
                return Err(MatrixError::IncompleteInclusion {
                    rule: index + 1,
                    axis: axis.name.clone(),
                });
            }
        }

        let exclusions = matrix
            .exclude
            .iter()
            .map(|m| parse_rule(m, &axis_set))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(MatrixPlan {
            axis_set,
            inclusions,
            exclusions,
        })
    }

    /// Expand one job definition into its job specs. A job without a matrix
    /// yields a single spec with an empty assignment.
    pub fn expand_job(job_id: &str, job: &JobDefinition) -> Result<Vec<JobSpec>, MatrixError> {
        let combinations = match job.matrix() {
            Some(matrix) => {
                let plan = Self::plan(matrix)?;
                Self::expand(&plan.axis_set, &plan.inclusions, &plan.exclusions)
            }
            None => vec![Combination {
                assignment: AxisAssignment::default(),
                flags: BTreeSet::new(),
                origin: SpecOrigin::Product,
            }],
        };

        let base_name = job.name.clone().unwrap_or_else(|| job_id.to_string());

        Ok(combinations
            .into_iter()
            .enumerate()
            .map(|(index, combination)| {
                let mut display_name = base_name.clone();
                if !combination.assignment.is_empty() {
                    display_name.push_str(&format!(" ({})", combination.assignment));
                }
                if !combination.flags.is_empty() {
                    let flags: Vec<&str> = combination.flags.iter().map(String::as_str).collect();
                    display_name.push_str(&format!(" [{}]", flags.join(", ")));
                }

                JobSpec {
                    index,
                    job: job_id.to_string(),
                    display_name,
                    assignment: combination.assignment,
                    flags: combination.flags,
                    origin: combination.origin,
                }
            })
            .collect())
    }

    /// Get the maximum parallel limit from a job's strategy
    pub fn max_parallel(job: &JobDefinition) -> Option<u32> {
        job.strategy.as_ref().and_then(|s| s.max_parallel)
    }
}

fn parse_rule(mapping: &Mapping, axis_set: &AxisSet) -> Result<MatrixRule, MatrixError> {
    let mut rule = MatrixRule::new();

    for (key, value) in mapping {
        let key = key.as_str().ok_or(MatrixError::NonStringKey)?;

        if axis_set.contains(key) {
            let text = scalar_text(value).ok_or_else(|| MatrixError::NonScalarValue {
                axis: key.to_string(),
            })?;
            rule.axes.insert(key.to_string(), text);
        } else {
            let enabled = value.as_bool().ok_or_else(|| MatrixError::NonBooleanFlag {
                key: key.to_string(),
            })?;
            rule.flags.insert(key.to_string(), enabled);
        }
    }

    Ok(rule)
}

/// Canonical text of a scalar YAML value. Numbers keep their YAML form, so
/// versions like `3.10` must be quoted to survive.
fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assignment_values(combinations: &[Combination]) -> Vec<Vec<String>> {
        combinations
            .iter()
            .map(|c| c.assignment.values().map(String::from).collect())
            .collect()
    }

    fn python_axes() -> AxisSet {
        AxisSet::new()
            .with_axis("os", ["ubuntu", "windows"])
            .with_axis("pyver", ["3.9", "3.10", "3.11", "3.12"])
    }

    #[test]
    fn test_product_size_and_order() {
        let axes = AxisSet::new()
            .with_axis("os", ["linux", "mac", "windows"])
            .with_axis("rt", ["1", "2"])
            .with_axis("variant", ["a", "b"]);

        let combinations = MatrixExpander::expand(&axes, &[], &[]);
        assert_eq!(combinations.len(), 3 * 2 * 2);

        let values = assignment_values(&combinations);
        assert_eq!(values[0], vec!["linux", "1", "a"]);
        assert_eq!(values[1], vec!["linux", "1", "b"]);
        assert_eq!(values[2], vec!["linux", "2", "a"]);
        assert_eq!(values[11], vec!["windows", "2", "b"]);

        for combination in &combinations {
            assert_eq!(combination.assignment.len(), 3);
        }
    }

    #[test]
    fn test_includes_and_excludes() {
        let inclusions = vec![MatrixRule::new()
            .axis("os", "ubuntu")
            .axis("pyver", "3.9")
            .flag(MIN_VERSION_FLAG, true)];
        let exclusions = vec![
            MatrixRule::new().axis("os", "ubuntu").axis("pyver", "3.9"),
            MatrixRule::new().axis("os", "windows").axis("pyver", "3.11"),
            MatrixRule::new().axis("os", "windows").axis("pyver", "3.12"),
        ];

        let combinations = MatrixExpander::expand(&python_axes(), &inclusions, &exclusions);
        assert_eq!(combinations.len(), 6);

        assert_eq!(
            assignment_values(&combinations),
            vec![
                vec!["ubuntu", "3.10"],
                vec!["ubuntu", "3.11"],
                vec!["ubuntu", "3.12"],
                vec!["windows", "3.9"],
                vec!["windows", "3.10"],
                vec!["ubuntu", "3.9"],
            ]
        );

        let included = combinations.last().unwrap();
        assert_eq!(included.origin, SpecOrigin::Included);
        assert!(included.flags.contains(MIN_VERSION_FLAG));
    }

    #[test]
    fn test_exclusion_applies_to_inclusions() {
        let inclusions = vec![
            MatrixRule::new()
                .axis("os", "ubuntu")
                .axis("pyver", "3.9")
                .flag(MIN_VERSION_FLAG, true),
            // duplicates a product member
            MatrixRule::new().axis("os", "windows").axis("pyver", "3.12"),
        ];
        let exclusions = vec![
            MatrixRule::new()
                .axis("os", "ubuntu")
                .flag(MIN_VERSION_FLAG, true),
            MatrixRule::new().axis("pyver", "3.12"),
        ];

        let combinations = MatrixExpander::expand(&python_axes(), &inclusions, &exclusions);

        assert_eq!(combinations.len(), 6);
        assert!(combinations.iter().all(|c| c.origin == SpecOrigin::Product));
        assert!(combinations
            .iter()
            .all(|c| c.assignment.get("pyver") != Some("3.12")));
    }

    #[test]
    fn test_duplicate_inclusions_are_kept() {
        let inclusion = MatrixRule::new().axis("os", "ubuntu").axis("pyver", "3.9");
        let combinations =
            MatrixExpander::expand(&python_axes(), &[inclusion.clone(), inclusion], &[]);

        assert_eq!(combinations.len(), 10);
        let duplicates = combinations
            .iter()
            .filter(|c| c.assignment.get("os") == Some("ubuntu") && c.assignment.get("pyver") == Some("3.9"))
            .count();
        assert_eq!(duplicates, 3);
    }

    #[test]
    fn test_empty_axis_keeps_inclusions() {
        let axes = AxisSet::new()
            .with_axis("os", Vec::<String>::new())
            .with_axis("pyver", ["3.9"]);
        let inclusion = MatrixRule::new().axis("os", "ubuntu").axis("pyver", "3.9");

        let combinations = MatrixExpander::expand(&axes, &[inclusion], &[]);
        assert_eq!(combinations.len(), 1);
        assert_eq!(combinations[0].origin, SpecOrigin::Included);
    }

    #[test]
    fn test_expansion_is_idempotent() {
        let inclusions = vec![MatrixRule::new().axis("os", "ubuntu").axis("pyver", "3.9")];
        let exclusions = vec![MatrixRule::new().axis("os", "windows")];

        let first = MatrixExpander::expand(&python_axes(), &inclusions, &exclusions);
        let second = MatrixExpander::expand(&python_axes(), &inclusions, &exclusions);
        assert_eq!(first, second);
    }

    #[test]
    fn test_plan_from_yaml() {
        let matrix: Matrix = serde_yaml::from_str(
            r#"
os: [ubuntu-latest]
python-version: ["3.10", 3.11]
include:
  - { os: ubuntu-latest, python-version: "3.10", min-version: true }
exclude:
  - { python-version: 3.11 }
"#,
        )
        .unwrap();

        let plan = MatrixExpander::plan(&matrix).unwrap();
        assert_eq!(plan.axis_set.axes()[1].values, vec!["3.10", "3.11"]);
        assert_eq!(plan.inclusions[0].flags.get(MIN_VERSION_FLAG), Some(&true));
        assert_eq!(plan.exclusions[0].axes.get("python-version").map(String::as_str), Some("3.11"));
    }

    #[test]
    fn test_plan_rejects_partial_inclusion() {
        let matrix: Matrix = serde_yaml::from_str(
            r#"
os: [ubuntu-latest]
python-version: ["3.10"]
include:
  - { os: windows-latest }
"#,
        )
        .unwrap();

        assert_eq!(
            MatrixExpander::plan(&matrix),
            Err(MatrixError::IncompleteInclusion {
                rule: 1,
                axis: "python-version".to_string()
            })
        );
    }

    #[test]
    fn test_plan_rejects_non_boolean_flag() {
        let matrix: Matrix = serde_yaml::from_str(
            r#"
os: [ubuntu-latest]
exclude:
  - { os: ubuntu-latest, experimental: "yes" }
"#,
        )
        .unwrap();

        assert!(matches!(
            MatrixExpander::plan(&matrix),
            Err(MatrixError::NonBooleanFlag { key }) if key == "experimental"
        ));
    }

    #[test]
    fn test_expand_job_names_and_ids() {
        let job: JobDefinition = serde_yaml::from_str(
            r#"
name: Tests
strategy:
  matrix:
    os: [ubuntu-latest]
    python-version: ["3.10"]
    include:
      - { os: ubuntu-latest, python-version: "3.10", min-version: true }
runtime: { axis: python-version }
"#,
        )
        .unwrap();

        let specs = MatrixExpander::expand_job("pytest", &job).unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].index, 0);
        assert_eq!(specs[0].display_name, "Tests (ubuntu-latest, 3.10)");
        assert_eq!(specs[0].id(), "pytest[ubuntu-latest,3.10]");
        assert!(!specs[0].is_minimum_version());

        assert_eq!(specs[1].display_name, "Tests (ubuntu-latest, 3.10) [min-version]");
        assert_eq!(specs[1].id(), "pytest[ubuntu-latest,3.10;min-version]");
        assert_eq!(specs[1].slug(), "001-pytest_ubuntu-latest_3.10_min-version");
        assert!(specs[1].is_minimum_version());
    }

    #[test]
    fn test_min_version_axis_selects_minimum() {
        let job: JobDefinition = serde_yaml::from_str(
            r#"
strategy:
  matrix:
    python-version: ["3.10"]
    min-version: [false, true]
"#,
        )
        .unwrap();

        let specs = MatrixExpander::expand_job("pytest", &job).unwrap();
        assert!(!specs[0].is_minimum_version());
        assert!(specs[1].is_minimum_version());
    }

    #[test]
    fn test_job_without_matrix() {
        let job: JobDefinition = serde_yaml::from_str("lint: { path: src }").unwrap();
        let specs = MatrixExpander::expand_job("lint", &job).unwrap();

        assert_eq!(specs.len(), 1);
        assert!(specs[0].assignment.is_empty());
        assert_eq!(specs[0].id(), "lint");
        assert_eq!(specs[0].display_name, "lint");
    }
}
