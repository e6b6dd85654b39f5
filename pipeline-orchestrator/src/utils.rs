// Utility Functions
// Path resolution, repository root detection and ref pattern matching

use std::path::{Path, PathBuf};

/// Find the root of a git repository by walking up from the given starting path.
///
/// Returns `None` if no ancestor holds a `.git` directory.
pub fn find_repo_root(start: &Path) -> Option<PathBuf> {
    let start = start.canonicalize().ok()?;
    start
        .ancestors()
        .find(|ancestor| ancestor.join(".git").exists())
        .map(Path::to_path_buf)
}

/// Resolve the working directory for pipeline execution: the enclosing
/// repository root, or the current directory outside a repository.
pub fn resolve_working_dir() -> PathBuf {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    find_repo_root(&cwd).unwrap_or(cwd)
}

/// Match a ref or test id against a filter pattern.
///
/// `*` matches any run of characters except `/`, `**` matches across `/`,
/// and `?` matches one character other than `/`.
pub fn pattern_matches(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    match_from(&pattern, &text)
}

fn match_from(pattern: &[char], text: &[char]) -> bool {
    match pattern {
        [] => text.is_empty(),
        ['*', '*', rest @ ..] => {
            (0..=text.len()).any(|skip| match_from(rest, &text[skip..]))
        }
        ['*', rest @ ..] => {
            let limit = text.iter().position(|c| *c == '/').unwrap_or(text.len());
            (0..=limit).any(|skip| match_from(rest, &text[skip..]))
        }
        ['?', rest @ ..] => match text {
            [c, tail @ ..] if *c != '/' => match_from(rest, tail),
            _ => false,
        },
        [p, rest @ ..] => match text {
            [c, tail @ ..] if c == p => match_from(rest, tail),
            _ => false,
        },
    }
}

/// Whether any pattern in the list matches.
pub fn any_pattern_matches(patterns: &[String], text: &str) -> bool {
    patterns.iter().any(|p| pattern_matches(p, text))
}
