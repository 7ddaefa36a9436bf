//! Shared utilities for the cache library.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Versioned namespace segment baked into every backing-store key.
///
/// Bump this when the payload envelope or key layout changes so old entries
/// are never read back by a newer build.
pub const KEY_SCHEMA_VERSION: &str = "v1";

/// Build the backing-store key for a cached value.
///
/// Format: `{prefix}:{version}:d:{key}`
pub fn build_cache_key(prefix: &str, key: &str) -> String {
    format!("{}:{}:d:{}", prefix, KEY_SCHEMA_VERSION, key)
}

/// Build the backing-store key of a tag's reverse index.
///
/// Format: `{prefix}:{version}:t:{tag}`
pub fn build_tag_key(prefix: &str, tag: &str) -> String {
    format!("{}:{}:t:{}", prefix, KEY_SCHEMA_VERSION, tag)
}

/// Build a store-wide glob matching caller keys that match `pattern`.
///
/// The prefix is escaped so glob metacharacters in it match literally.
pub fn build_pattern(prefix: &str, pattern: &str) -> String {
    format!(
        "{}:{}:d:{}",
        escape_glob(prefix),
        KEY_SCHEMA_VERSION,
        pattern
    )
}

/// Escape glob metacharacters (`*`, `?`, `[`, `]`, `\`).
pub fn escape_glob(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Match `text` against a Redis-style glob.
///
/// Supports `*`, `?`, `[abc]`, `[a-z]`, `[^a]` and backslash escapes.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    glob_match_from(&p, &t)
}

fn glob_match_from(p: &[char], t: &[char]) -> bool {
    let (mut pi, mut ti) = (0, 0);
    // Backtrack point for the most recent `*`.
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() {
            match p[pi] {
                '*' => {
                    star = Some((pi, ti));
                    pi += 1;
                    continue;
                }
                '?' => {
                    pi += 1;
                    ti += 1;
                    continue;
                }
                '[' => {
                    if let Some((matched, next)) = match_class(p, pi, t[ti])
                        && matched
                    {
                        pi = next;
                        ti += 1;
                        continue;
                    }
                }
                '\\' if pi + 1 < p.len() => {
                    if p[pi + 1] == t[ti] {
                        pi += 2;
                        ti += 1;
                        continue;
                    }
                }
                c => {
                    if c == t[ti] {
                        pi += 1;
                        ti += 1;
                        continue;
                    }
                }
            }
        }

        match star {
            Some((sp, st)) => {
                pi = sp + 1;
                ti = st + 1;
                star = Some((sp, st + 1));
            }
            None => return false,
        }
    }

    p[pi..].iter().all(|&c| c == '*')
}

/// Evaluate a `[...]` class starting at `start`. Returns whether `c` matched
/// and the index just past the closing bracket, or `None` if unterminated.
fn match_class(p: &[char], start: usize, c: char) -> Option<(bool, usize)> {
    let mut i = start + 1;
    let negate = i < p.len() && p[i] == '^';
    if negate {
        i += 1;
    }

    let mut matched = false;
    while i < p.len() && p[i] != ']' {
        if p[i] == '\\' && i + 1 < p.len() {
            matched |= p[i + 1] == c;
            i += 2;
        } else if i + 2 < p.len() && p[i + 1] == '-' && p[i + 2] != ']' {
            let (lo, hi) = if p[i] <= p[i + 2] {
                (p[i], p[i + 2])
            } else {
                (p[i + 2], p[i])
            };
            matched |= lo <= c && c <= hi;
            i += 3;
        } else {
            matched |= p[i] == c;
            i += 1;
        }
    }

    if i >= p.len() {
        return None;
    }
    Some((matched != negate, i + 1))
}

/// Get the current time in milliseconds since UNIX epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Convert a duration to whole milliseconds, saturating.
pub fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}
