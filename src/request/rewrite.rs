//! Path rewriter: external URL shape → internal on-disk layout.
//!
//! Grounded on `request_rewrite` in `request.c`, with one deliberate
//! correction spec.md calls for explicitly (§4.4, §9 REDESIGN FLAGS): the
//! bucket prefix is the first **3 code points** of the slug, not the
//! first 3 bytes. The original's byte-twiddling second pass (copy,
//! backtrack, copy the prefix again) is just how C builds
//! `<prefix>/<slug>` without a growable string; in Rust we just slice and
//! `format!`, which is the same result by construction, not a
//! simplification of behavior.
//!
//! The original only special-cases `/` and `/robots.txt` as directly
//! servable files (XHTML / plain text respectively); every other valid
//! path — both `/e/<slug>` and `/<slug>` forms — rewrites to a *redirect
//! list* file under the bucket tree (spec.md §4.4's "contents of the
//! served file may override the response code").

/// What kind of file the rewritten path names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RewriteOutcome {
    /// `index.html`, served as `application/xhtml+xml`.
    Xhtml(String),
    /// `robots.txt`, served as `text/plain`.
    Text(String),
    /// A bucketed redirect-list file; its first line is the `Location`.
    Redirect(String),
}

/// Rewrites a validated, decoded request path (guaranteed by the parser
/// to start with `/`, be valid UTF-8, and contain no control bytes) to
/// its internal on-disk form. Returns `None` when the path is malformed
/// (the caller maps that to HTTP 400).
pub fn rewrite(path: &str) -> Option<RewriteOutcome> {
    if path == "/" {
        return Some(RewriteOutcome::Xhtml("index.html".to_string()));
    }
    if path == "/robots.txt" {
        return Some(RewriteOutcome::Text("robots.txt".to_string()));
    }

    let (bucket_root, slug) = if let Some(rest) = path.strip_prefix("/e/") {
        ("e", rest)
    } else {
        (
            "i",
            path.strip_prefix('/').expect("parser guarantees a leading '/'"),
        )
    };

    if slug.contains('/') || slug.contains('\\') {
        return None;
    }

    if slug.chars().count() < 3 {
        return None;
    }

    let prefix_len = slug
        .char_indices()
        .nth(3)
        .map(|(byte_idx, _)| byte_idx)
        .unwrap_or(slug.len());
    let prefix = &slug[..prefix_len];

    Some(RewriteOutcome::Redirect(format!(
        "{bucket_root}/{prefix}/{slug}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_serves_index() {
        assert_eq!(
            rewrite("/"),
            Some(RewriteOutcome::Xhtml("index.html".into()))
        );
    }

    #[test]
    fn robots_txt_served_as_text() {
        assert_eq!(
            rewrite("/robots.txt"),
            Some(RewriteOutcome::Text("robots.txt".into()))
        );
    }

    #[test]
    fn default_form_round_trip() {
        assert_eq!(
            rewrite("/abcdef"),
            Some(RewriteOutcome::Redirect("i/abc/abcdef".into()))
        );
    }

    #[test]
    fn bucket_form_round_trip() {
        assert_eq!(
            rewrite("/e/abcdef"),
            Some(RewriteOutcome::Redirect("e/abc/abcdef".into()))
        );
    }

    #[test]
    fn exact_three_codepoint_slug_is_its_own_bucket() {
        assert_eq!(
            rewrite("/abc"),
            Some(RewriteOutcome::Redirect("i/abc/abc".into()))
        );
    }

    #[test]
    fn bucket_prefix_counts_code_points_not_bytes() {
        // Each of these is a 2-byte UTF-8 code point; three of them make
        // a 6-byte prefix, not a 3-byte one.
        let slug = "\u{00e9}\u{00e8}\u{00ea}suffix"; // éèê + suffix
        match rewrite(&format!("/{slug}")) {
            Some(RewriteOutcome::Redirect(p)) => {
                assert_eq!(p, format!("i/\u{00e9}\u{00e8}\u{00ea}/{slug}"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn short_slug_is_malformed() {
        assert_eq!(rewrite("/a"), None);
        assert_eq!(rewrite("/ab"), None);
    }

    #[test]
    fn short_bucket_slug_is_malformed() {
        assert_eq!(rewrite("/e/ab"), None);
        assert_eq!(rewrite("/e/"), None);
    }

    #[test]
    fn embedded_slash_or_backslash_is_rejected() {
        assert_eq!(rewrite("/../etc"), None);
        assert_eq!(rewrite("/abc/def"), None);
        assert_eq!(rewrite("/abc\\def"), None);
    }
}
