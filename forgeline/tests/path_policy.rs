//! Property tests for artifact path sanitization.

use proptest::prelude::*;

use forgeline::core::path::{ALLOWED_ROOTS, sanitize_path};

fn segment() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9_-]{1,12}(\\.[a-z]{1,4})?"
}

proptest! {
    #[test]
    fn accepted_paths_stay_under_an_allowed_root(raw in ".{0,64}") {
        if let Some(clean) = sanitize_path(&raw) {
            prop_assert!(ALLOWED_ROOTS.iter().any(|root| clean.starts_with(root)));
            prop_assert!(!clean.split('/').any(|part| part == ".."));
            prop_assert!(!clean.starts_with('/'));
            prop_assert!(!clean.starts_with('~'));
        }
    }

    #[test]
    fn well_formed_paths_under_roots_are_kept(
        root in prop::sample::select(ALLOWED_ROOTS.to_vec()),
        parts in prop::collection::vec(segment(), 1..4),
    ) {
        let path = format!("{root}{}", parts.join("/"));
        prop_assert_eq!(sanitize_path(&path), Some(path.clone()));
    }

    #[test]
    fn traversal_is_always_rejected(
        root in prop::sample::select(ALLOWED_ROOTS.to_vec()),
        before in segment(),
        after in segment(),
    ) {
        let path = format!("{root}{before}/../{after}");
        prop_assert_eq!(sanitize_path(&path), None);
    }

    #[test]
    fn sanitizing_is_idempotent(raw in "(docs|apps|project|src)/[a-z/._-]{0,30}") {
        if let Some(clean) = sanitize_path(&raw) {
            prop_assert_eq!(sanitize_path(&clean), Some(clean.clone()));
        }
    }
}
