//! Lexical path sanitizer for untrusted archive entry names
//!
//! Decisions here are purely string-level: nothing touches the filesystem,
//! and in particular nothing resolves symlinks, so a hostile archive cannot
//! influence the verdict by pre-staging filesystem state. `O_NOFOLLOW` at
//! open time is the second line of defense.

use std::path::{Component, Path, PathBuf};

/// Longest accepted path, in bytes
const MAX_PATH_LEN: usize = 4096;
/// Longest accepted single component, in bytes
const MAX_COMPONENT_LEN: usize = 255;
/// Deepest accepted component nesting
const MAX_COMPONENTS: usize = 20;

/// Validate `candidate` and resolve it under `base_dir`.
///
/// `base_dir` is trusted; `candidate` comes straight from an archive header.
/// Returns the lexical join of the two when every check passes, `None`
/// otherwise. Case is preserved.
pub fn sanitize(base_dir: &Path, candidate: &str) -> Option<PathBuf> {
    if candidate.is_empty() || candidate.len() > MAX_PATH_LEN {
        return None;
    }

    // Byte-level charset: printable ASCII plus TAB only.
    for &b in candidate.as_bytes() {
        if b >= 0x80 {
            return None;
        }
        if b < 0x20 && b != b'\t' {
            return None;
        }
    }

    // Traversal and separator-smuggling tokens, for any separator style.
    for token in ["../", "..\\", "//", "\\\\", ":\\"] {
        if candidate.contains(token) {
            return None;
        }
    }

    if candidate.starts_with('/') || candidate.starts_with('\\') || candidate.starts_with('~') {
        return None;
    }

    // Shell metacharacters have no business in an archive member name.
    if candidate.contains(|c| matches!(c, ';' | '&' | '$' | '`' | '|')) {
        return None;
    }

    let components: Vec<&str> = candidate.split('/').collect();
    if components.len() > MAX_COMPONENTS {
        return None;
    }

    for component in &components {
        if !is_safe_filename(component) {
            return None;
        }
    }

    // Lexical containment check on the join. With the component rules above
    // this cannot fire, but the sanitizer does not rely on that.
    let rel = Path::new(candidate);
    if rel.is_absolute() {
        return None;
    }
    if matches!(
        rel.components().next(),
        Some(Component::ParentDir | Component::RootDir | Component::Prefix(_))
    ) {
        return None;
    }

    Some(base_dir.join(rel))
}

/// A single path component acceptable for extraction: non-empty, bounded,
/// not a dot-name, no leading/trailing dot, no `..` substring, and drawn
/// from `[A-Za-z0-9-_. ]` only.
fn is_safe_filename(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_COMPONENT_LEN {
        return false;
    }
    if name == "." || name == ".." {
        return false;
    }
    if name.starts_with('.') || name.ends_with('.') {
        return false;
    }
    if name.contains("..") {
        return false;
    }
    name.bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b' '))
}
