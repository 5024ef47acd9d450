//! Absolute slash-delimited paths: validation, canonicalization, globs.
//!
//! Every path in the mount protocol is absolute. A path is either *concrete*
//! (a literal address) or a *glob* (contains `*`, `?`, or `[set]`, with `\`
//! escaping). Concrete path equality is byte equality after
//! [`canonicalize`].

use crate::{Error, Expected};

/// Validate an absolute protocol path.
///
/// Rejects empty paths, paths not starting with `/`, control characters,
/// the `\` separator, and any occurrence of `..`.
pub fn validate_absolute(path: &str) -> Expected<()> {
    if path.is_empty() {
        return Err(Error::InvalidPath("path must not be empty".into()));
    }
    if !path.starts_with('/') {
        return Err(Error::InvalidPath("path must start with '/'".into()));
    }
    for ch in path.chars() {
        if ch.is_control() {
            return Err(Error::InvalidPath(
                "path contains control characters".into(),
            ));
        }
        if ch == '\\' {
            return Err(Error::InvalidPath(
                "path contains unsupported separator".into(),
            ));
        }
    }
    if path.contains("..") {
        return Err(Error::InvalidPath("path must not contain '..'".into()));
    }
    Ok(())
}

/// Canonicalize a concrete path: collapse repeated slashes and strip
/// trailing slashes (except for the root itself).
///
/// Canonicalization is idempotent: `canonicalize(canonicalize(p))` equals
/// `canonicalize(p)` for any path that validates.
pub fn canonicalize(path: &str) -> Expected<String> {
    validate_absolute(path)?;
    let mut canonical = String::with_capacity(path.len());
    for segment in path.split('/') {
        if segment.is_empty() {
            continue;
        }
        if segment == "." {
            return Err(Error::InvalidPath(
                "path must not contain relative components".into(),
            ));
        }
        canonical.push('/');
        canonical.push_str(segment);
    }
    if canonical.is_empty() {
        canonical.push('/');
    }
    Ok(canonical)
}

/// Normalize a possibly sloppy configured path into canonical absolute form.
///
/// Empty input becomes `/`; a missing leading slash is added before the
/// usual validation and canonicalization.
pub fn normalize_absolute(path: &str) -> Expected<String> {
    let mut owned = path.to_string();
    if owned.is_empty() {
        owned.push('/');
    }
    if !owned.starts_with('/') {
        owned.insert(0, '/');
    }
    canonicalize(&owned)
}

/// True when `absolute` is equal to `root` or lives inside it.
pub fn path_within(absolute: &str, root: &str) -> bool {
    if root.is_empty() || root == "/" {
        return true;
    }
    if !absolute.starts_with(root) {
        return false;
    }
    if absolute.len() == root.len() {
        return true;
    }
    absolute.as_bytes()[root.len()] == b'/'
}

/// Join a canonical root with a (possibly absolute) tail.
pub fn join(root: &str, tail: &str) -> String {
    if tail.is_empty() || tail == "/" {
        return root.to_string();
    }
    let tail = tail.strip_prefix('/').unwrap_or(tail);
    if root == "/" {
        return format!("/{tail}");
    }
    if root.ends_with('/') {
        format!("{root}{tail}")
    } else {
        format!("{root}/{tail}")
    }
}

/// True when the pattern contains unescaped glob metacharacters.
pub fn is_glob(pattern: &str) -> bool {
    let mut chars = pattern.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' => {
                chars.next();
            }
            '*' | '?' | '[' => return true,
            _ => {}
        }
    }
    false
}

/// Match a glob pattern against a concrete path, segment by segment.
///
/// Within a segment `*` matches any run, `?` one character, `[set]` a
/// character set (leading `!` negates, `-` forms ranges), and `\` escapes
/// the next character. A `**` segment super-matches the entire remaining
/// tail of the path.
pub fn glob_match(pattern: &str, path: &str) -> bool {
    let pattern_segments: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
    let path_segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    match_segments(&pattern_segments, &path_segments)
}

fn match_segments(pattern: &[&str], path: &[&str]) -> bool {
    let Some((head, rest)) = pattern.split_first() else {
        return path.is_empty();
    };
    if *head == "**" {
        // Tail super-match: any number of remaining components.
        return true;
    }
    let Some((segment, path_rest)) = path.split_first() else {
        return false;
    };
    segment_match(head, segment) && match_segments(rest, path_rest)
}

/// Match a single glob segment against a single path component.
fn segment_match(pattern: &str, name: &str) -> bool {
    segment_match_bytes(pattern.as_bytes(), name.as_bytes())
}

fn segment_match_bytes(pattern: &[u8], name: &[u8]) -> bool {
    if pattern.is_empty() {
        return name.is_empty();
    }
    match pattern[0] {
        b'*' => {
            // Greedy-with-backtracking over the rest of the component.
            for skip in 0..=name.len() {
                if segment_match_bytes(&pattern[1..], &name[skip..]) {
                    return true;
                }
            }
            false
        }
        b'?' => !name.is_empty() && segment_match_bytes(&pattern[1..], &name[1..]),
        b'[' => {
            let Some(end) = find_set_end(pattern) else {
                // Unterminated set matches the literal '['.
                return !name.is_empty()
                    && name[0] == b'['
                    && segment_match_bytes(&pattern[1..], &name[1..]);
            };
            if name.is_empty() {
                return false;
            }
            if !set_contains(&pattern[1..end], name[0]) {
                return false;
            }
            segment_match_bytes(&pattern[end + 1..], &name[1..])
        }
        b'\\' if pattern.len() > 1 => {
            !name.is_empty() && name[0] == pattern[1] && segment_match_bytes(&pattern[2..], &name[1..])
        }
        literal => !name.is_empty() && name[0] == literal && segment_match_bytes(&pattern[1..], &name[1..]),
    }
}

fn find_set_end(pattern: &[u8]) -> Option<usize> {
    // pattern[0] is '['; a ']' in the first set position is a literal member.
    let mut index = 1;
    if index < pattern.len() && (pattern[index] == b'!' || pattern[index] == b'^') {
        index += 1;
    }
    if index < pattern.len() && pattern[index] == b']' {
        index += 1;
    }
    while index < pattern.len() {
        if pattern[index] == b']' {
            return Some(index);
        }
        index += 1;
    }
    None
}

fn set_contains(set: &[u8], ch: u8) -> bool {
    let (negated, set) = match set.first() {
        Some(b'!') | Some(b'^') => (true, &set[1..]),
        _ => (false, set),
    };
    let mut found = false;
    let mut index = 0;
    while index < set.len() {
        if index + 2 < set.len() && set[index + 1] == b'-' {
            if set[index] <= ch && ch <= set[index + 2] {
                found = true;
            }
            index += 3;
        } else {
            if set[index] == ch {
                found = true;
            }
            index += 1;
        }
    }
    found != negated
}

/// Validate a mount alias: alphanumerics plus `_` and `-`.
pub fn validate_alias(alias: &str) -> Expected<()> {
    if alias.is_empty() {
        return Err(Error::MalformedInput("alias: must not be empty".into()));
    }
    for ch in alias.chars() {
        if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' {
            continue;
        }
        return Err(Error::MalformedInput(
            "alias: contains invalid characters".into(),
        ));
    }
    Ok(())
}

/// Validate a protocol identifier (request, session, subscription ids):
/// alphanumerics plus `-`, `_`, `:`, `.`.
pub fn validate_identifier(value: &str, field: &str) -> Expected<()> {
    if value.is_empty() {
        return Err(Error::MalformedInput(format!("{field}: must not be empty")));
    }
    for ch in value.chars() {
        if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | ':' | '.') {
            continue;
        }
        return Err(Error::MalformedInput(format!(
            "{field}: contains invalid characters"
        )));
    }
    Ok(())
}
