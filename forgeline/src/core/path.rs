//! Artifact path policy.
//!
//! Every artifact path is untrusted generator output. A path is accepted only
//! when it is relative, free of traversal, and lives under one of the allowed
//! logical roots.

use std::sync::LazyLock;

use regex::Regex;

/// Logical roots an artifact may live under.
pub const ALLOWED_ROOTS: [&str; 3] = ["docs/", "project/", "apps/"];

static TRAVERSAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(^|/)\.\.(/|$)|^/|^~").expect("valid traversal regex")
});

/// Normalize `raw` and return it when it satisfies the path policy.
///
/// Backslashes are folded to `/`, duplicate separators and `.` segments are
/// dropped. Returns `None` for absolute paths, home-relative paths, any `..`
/// segment, double-backslash sequences, or a path outside [`ALLOWED_ROOTS`].
pub fn sanitize_path(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.contains("\\\\") || trimmed.contains('\0') {
        return None;
    }
    let unified = trimmed.replace('\\', "/");
    if TRAVERSAL.is_match(&unified) || unified.contains("..") {
        return None;
    }

    let segments: Vec<&str> = unified
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect();
    if segments.len() < 2 {
        return None;
    }
    let normalized = segments.join("/");
    if root_of(&normalized).is_some() {
        Some(normalized)
    } else {
        None
    }
}

/// Root the normalized path lives under, if any.
pub fn root_of(path: &str) -> Option<&'static str> {
    ALLOWED_ROOTS
        .iter()
        .copied()
        .find(|root| path.starts_with(root))
}

/// Final path segment.
pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_paths_under_allowed_roots() {
        for path in [
            "docs/spec/PRODUCT_SPEC.md",
            "apps/web/src/main.ts",
            "project/Dockerfile",
        ] {
            assert_eq!(sanitize_path(path).as_deref(), Some(path));
        }
    }

    #[test]
    fn normalizes_redundant_separators_and_dot_segments() {
        for (raw, expected) in [
            ("docs//pm/./backlog.md", "docs/pm/backlog.md"),
            ("  apps\\api\\index.ts ", "apps/api/index.ts"),
            ("./docs/qa/report.md", "docs/qa/report.md"),
        ] {
            assert_eq!(sanitize_path(raw).as_deref(), Some(expected));
        }
    }

    #[test]
    fn rejects_traversal_and_absolute_forms() {
        for raw in [
            "../docs/a.md",
            "docs/../../etc/passwd",
            "/docs/a.md",
            "~/docs/a.md",
            "docs\\\\server\\share.md",
            "docs/a..md",
        ] {
            assert_eq!(sanitize_path(raw), None, "{raw} should be rejected");
        }
    }

    #[test]
    fn rejects_unknown_roots_and_bare_roots() {
        assert_eq!(sanitize_path("src/main.rs"), None);
        assert_eq!(sanitize_path("documents/a.md"), None);
        assert_eq!(sanitize_path("docs"), None);
        assert_eq!(sanitize_path("docs/"), None);
        assert_eq!(sanitize_path(""), None);
    }

    #[test]
    fn root_and_file_name_helpers() {
        assert_eq!(root_of("apps/x/y.ts"), Some("apps/"));
        assert_eq!(root_of("src/x"), None);
        assert_eq!(
            file_name("docs/engineer/engineer_proposal.md"),
            "engineer_proposal.md"
        );
    }
}
