//! Parser for Makefile-style `.d` dependency files, as emitted by
//! `gcc -MD`/`-MMD`.
//!
//! Used by compile tasks' [`crate::task::TaskBody::dynamic_deps`] to
//! discover transitive header inputs after a compile, so that a later
//! up-to-date check correctly depends on headers the source file doesn't
//! mention directly in the blueprint.

use std::path::PathBuf;

/// Parse a `.d` file's content into `(target, deps)` pairs.
///
/// Handles the three quirks real `.d` output exhibits:
/// - line continuations (`\` followed by a newline) are folded to a single
///   space before splitting into fields;
/// - a `|` token (GNU make's order-only-prerequisite marker) is dropped;
/// - more than one `target: deps` line may appear in one file.
pub fn parse(content: &str) -> Vec<(PathBuf, Vec<PathBuf>)> {
    let folded = content.replace("\\\n", " ").replace("\\\r\n", " ");

    folded
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() {
                return None;
            }
            let (targets, deps) = line.split_once(':')?;
            let targets: Vec<PathBuf> = targets.split_whitespace().map(PathBuf::from).collect();
            let deps: Vec<PathBuf> = deps
                .split_whitespace()
                .filter(|tok| *tok != "|")
                .map(PathBuf::from)
                .collect();
            if targets.is_empty() {
                return None;
            }
            Some((targets, deps))
        })
        .flat_map(|(targets, deps)| {
            targets
                .into_iter()
                .map(move |target| (target, deps.clone()))
        })
        .collect()
}

/// Parse a `.d` file and flatten every target's dependency list into one
/// deduplicated set. This is what compile tasks actually want: the full
/// set of header files the compile touched, regardless of which declared
/// target they're attached to.
pub fn parse_all_deps(content: &str) -> Vec<PathBuf> {
    let mut seen = std::collections::BTreeSet::new();
    for (_target, deps) in parse(content) {
        seen.extend(deps);
    }
    seen.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn parses_a_single_line() {
        let content = "build/a.o: a.c a.h\n";
        let parsed = parse(content);
        assert_eq!(
            parsed,
            vec![(PathBuf::from("build/a.o"), vec![PathBuf::from("a.c"), PathBuf::from("a.h")])]
        );
    }

    #[test]
    fn folds_line_continuations() {
        let content = "build/a.o: a.c \\\n  a.h \\\n  b.h\n";
        let parsed = parse(content);
        assert_eq!(
            parsed[0].1,
            vec![PathBuf::from("a.c"), PathBuf::from("a.h"), PathBuf::from("b.h")]
        );
    }

    #[test]
    fn strips_order_only_marker() {
        let content = "build/a.o: a.c | generated/a.h\n";
        let parsed = parse(content);
        assert_eq!(parsed[0].1, vec![PathBuf::from("a.c"), PathBuf::from("generated/a.h")]);
    }

    #[test]
    fn handles_multiple_targets_per_line() {
        let content = "build/a.o build/a.gcm: a.cppm\n";
        let parsed = parse(content);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].0, PathBuf::from("build/a.o"));
        assert_eq!(parsed[1].0, PathBuf::from("build/a.gcm"));
        assert_eq!(parsed[0].1, vec![PathBuf::from("a.cppm")]);
    }

    #[test]
    fn parse_all_deps_dedupes_and_sorts() {
        let content = "a.o: common.h a.c\nb.o: common.h b.c\n";
        assert_eq!(
            parse_all_deps(content),
            vec![PathBuf::from("a.c"), PathBuf::from("b.c"), PathBuf::from("common.h")]
        );
    }
}
