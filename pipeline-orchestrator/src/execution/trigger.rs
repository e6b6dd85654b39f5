// Trigger Events
// Incoming events and the definition's trigger filters

use crate::utils::any_pattern_matches;
use crate::workflow::models::{EventConfig, EventSpec, Trigger};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kinds of event that can start a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Push,
    PullRequest,
    Schedule,
    Manual,
    MergeGroup,
}

impl EventKind {
    /// Names this kind is listed under in a definition's `on:` block.
    pub fn trigger_names(&self) -> &'static [&'static str] {
        match self {
            EventKind::Push => &["push"],
            EventKind::PullRequest => &["pull_request"],
            EventKind::Schedule => &["schedule"],
            EventKind::Manual => &["workflow_dispatch", "manual"],
            EventKind::MergeGroup => &["merge_group"],
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.trigger_names()[0])
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "push" => Ok(EventKind::Push),
            "pull_request" | "pull-request" | "pr" => Ok(EventKind::PullRequest),
            "schedule" => Ok(EventKind::Schedule),
            "manual" | "workflow_dispatch" => Ok(EventKind::Manual),
            "merge_group" | "merge-group" => Ok(EventKind::MergeGroup),
            other => Err(format!("unknown event kind '{}'", other)),
        }
    }
}

/// An incoming event. Immutable, drives exactly one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TriggerEvent {
    pub kind: EventKind,
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub commit: String,
    /// Target branch of a pull request
    pub base_ref: Option<String>,
    /// Cron expression of the schedule that fired
    pub schedule: Option<String>,
}

impl TriggerEvent {
    pub fn new(kind: EventKind, git_ref: impl Into<String>, commit: impl Into<String>) -> Self {
        Self {
            kind,
            git_ref: git_ref.into(),
            commit: commit.into(),
            base_ref: None,
            schedule: None,
        }
    }

    pub fn with_base_ref(mut self, base_ref: impl Into<String>) -> Self {
        self.base_ref = Some(base_ref.into());
        self
    }

    pub fn with_schedule(mut self, cron: impl Into<String>) -> Self {
        self.schedule = Some(cron.into());
        self
    }

    /// Tag name, if the ref is `refs/tags/...`.
    pub fn tag(&self) -> Option<&str> {
        self.git_ref.strip_prefix("refs/tags/")
    }

    /// Branch name. A ref without a `refs/` prefix counts as a branch.
    pub fn branch(&self) -> Option<&str> {
        if let Some(branch) = self.git_ref.strip_prefix("refs/heads/") {
            Some(branch)
        } else if self.git_ref.starts_with("refs/") {
            None
        } else {
            Some(&self.git_ref)
        }
    }

    pub fn is_merge_group(&self) -> bool {
        self.kind == EventKind::MergeGroup
    }
}

/// Decides whether a definition's `on:` block accepts an event.
pub struct TriggerFilter;

impl TriggerFilter {
    pub fn accepts(trigger: &Trigger, event: &TriggerEvent) -> bool {
        let names = event.kind.trigger_names();

        match trigger {
            Trigger::Single(name) => names.contains(&name.as_str()),
            Trigger::Multiple(list) => list.iter().any(|n| names.contains(&n.as_str())),
            Trigger::Detailed(events) => {
                let Some(spec) = names.iter().find_map(|n| events.get(*n)) else {
                    return false;
                };
                match spec {
                    None => true,
                    Some(EventSpec::Schedules(entries)) => match &event.schedule {
                        Some(cron) => entries.iter().any(|e| &e.cron == cron),
                        None => true,
                    },
                    Some(EventSpec::Config(config)) => Self::accepts_config(config, event),
                }
            }
        }
    }

    fn accepts_config(config: &EventConfig, event: &TriggerEvent) -> bool {
        match event.kind {
            EventKind::Push => Self::accepts_push(config, event),
            EventKind::PullRequest => {
                let target = event.base_ref.as_deref().or_else(|| event.branch());
                match target {
                    Some(branch) => Self::branch_allowed(config, branch),
                    None => config.branches.is_empty(),
                }
            }
            EventKind::Schedule => match (&config.cron, &event.schedule) {
                (Some(expected), Some(fired)) => expected == fired,
                _ => true,
            },
            EventKind::Manual | EventKind::MergeGroup => true,
        }
    }

    fn accepts_push(config: &EventConfig, event: &TriggerEvent) -> bool {
        let has_branch_filters = !config.branches.is_empty() || !config.branches_ignore.is_empty();
        let has_tag_filters = !config.tags.is_empty() || !config.tags_ignore.is_empty();

        if let Some(tag) = event.tag() {
            // With only branch filters, tag pushes do not run
            if !has_tag_filters {
                return !has_branch_filters;
            }
            return (config.tags.is_empty() || any_pattern_matches(&config.tags, tag))
                && !any_pattern_matches(&config.tags_ignore, tag);
        }

        match event.branch() {
            Some(branch) => {
                if !has_branch_filters {
                    return !has_tag_filters;
                }
                Self::branch_allowed(config, branch)
            }
            None => !has_branch_filters && !has_tag_filters,
        }
    }

    fn branch_allowed(config: &EventConfig, branch: &str) -> bool {
        (config.branches.is_empty() || any_pattern_matches(&config.branches, branch))
            && !any_pattern_matches(&config.branches_ignore, branch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trigger(yaml: &str) -> Trigger {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn push(git_ref: &str) -> TriggerEvent {
        TriggerEvent::new(EventKind::Push, git_ref, "abc123")
    }

    #[test]
    fn test_event_kind_parsing() {
        assert_eq!("workflow_dispatch".parse::<EventKind>(), Ok(EventKind::Manual));
        assert_eq!("merge_group".parse::<EventKind>(), Ok(EventKind::MergeGroup));
        assert!("release".parse::<EventKind>().is_err());
        assert_eq!(EventKind::PullRequest.to_string(), "pull_request");
    }

    #[test]
    fn test_simple_and_list_triggers() {
        assert!(TriggerFilter::accepts(&trigger("push"), &push("main")));
        assert!(!TriggerFilter::accepts(
            &trigger("push"),
            &TriggerEvent::new(EventKind::MergeGroup, "gh-readonly-queue/main", "abc")
        ));

        let list = trigger("[push, workflow_dispatch]");
        assert!(TriggerFilter::accepts(
            &list,
            &TriggerEvent::new(EventKind::Manual, "main", "abc")
        ));
    }

    #[test]
    fn test_push_branch_filters() {
        let t = trigger(
            r#"
push:
  branches: [main, "release/*"]
  branches-ignore: ["release/old"]
"#,
        );

        assert!(TriggerFilter::accepts(&t, &push("refs/heads/main")));
        assert!(TriggerFilter::accepts(&t, &push("release/1.0")));
        assert!(!TriggerFilter::accepts(&t, &push("release/old")));
        assert!(!TriggerFilter::accepts(&t, &push("release/1.0/fix")));
        assert!(!TriggerFilter::accepts(&t, &push("feature/x")));
        assert!(!TriggerFilter::accepts(&t, &push("refs/tags/v1.0")));
    }

    #[test]
    fn test_push_tag_filters() {
        let t = trigger(
            r#"
push:
  branches: [main]
  tags: ["v*"]
"#,
        );

        assert!(TriggerFilter::accepts(&t, &push("refs/tags/v0.40.0")));
        assert!(!TriggerFilter::accepts(&t, &push("refs/tags/nightly")));
        assert!(TriggerFilter::accepts(&t, &push("main")));
    }

    #[test]
    fn test_pull_request_matches_base_ref() {
        let t = trigger("pull_request: { branches: [main] }");

        let to_main = TriggerEvent::new(EventKind::PullRequest, "refs/pull/7/merge", "abc")
            .with_base_ref("main");
        let to_other = TriggerEvent::new(EventKind::PullRequest, "refs/pull/8/merge", "abc")
            .with_base_ref("develop");

        assert!(TriggerFilter::accepts(&t, &to_main));
        assert!(!TriggerFilter::accepts(&t, &to_other));
    }

    #[test]
    fn test_schedule_and_merge_group() {
        let t = trigger(
            r#"
schedule:
  - cron: "0 6 * * 1"
merge_group:
"#,
        );

        let fired = TriggerEvent::new(EventKind::Schedule, "main", "abc").with_schedule("0 6 * * 1");
        let other = TriggerEvent::new(EventKind::Schedule, "main", "abc").with_schedule("0 0 * * *");
        assert!(TriggerFilter::accepts(&t, &fired));
        assert!(!TriggerFilter::accepts(&t, &other));

        let queue = TriggerEvent::new(EventKind::MergeGroup, "gh-readonly-queue/main/pr-1", "abc");
        assert!(TriggerFilter::accepts(&t, &queue));
        assert!(!TriggerFilter::accepts(&t, &push("main")));
    }

    #[test]
    fn test_ref_helpers() {
        assert_eq!(push("refs/heads/main").branch(), Some("main"));
        assert_eq!(push("refs/tags/v1").tag(), Some("v1"));
        assert_eq!(push("refs/tags/v1").branch(), None);
        assert_eq!(push("main").branch(), Some("main"));
    }
}
