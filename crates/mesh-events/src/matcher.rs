//! Event mask matching (e.g. `"user.**"`, `"order.*.created"`, `"job.?"`).
//!
//! Masks are dot-segmented topic patterns:
//!
//! | token | matches |
//! |-------|---------|
//! | `*`   | any run of characters without a `.` |
//! | `**`  | any run of characters, dots included |
//! | `?`   | exactly one character |
//!
//! The common shapes (exact names, trailing `*`/`**`, bare `*`/`**`) are
//! answered without a regex. Everything else is compiled once and kept in a
//! bounded LRU keyed by the literal mask, so the cache grows with the
//! number of distinct subscriptions rather than with traffic.

use lru::LruCache;
use regex::Regex;
use std::num::NonZeroUsize;
use std::sync::Mutex;

/// Matches event names against subscription masks.
///
/// One instance is built at broker startup and shared by the event bus and
/// the cache store (for glob `clean`).
#[derive(Debug)]
pub struct Matcher {
    compiled: Mutex<LruCache<String, Regex>>,
}

impl Matcher {
    /// Default number of compiled masks kept.
    pub const DEFAULT_CAPACITY: usize = 128;

    /// Creates a matcher whose regex cache holds at most `capacity` masks.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            compiled: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Returns `true` if `text` matches `pattern`.
    pub fn matches(&self, text: &str, pattern: &str) -> bool {
        if !pattern.contains('?') {
            if let Some(matched) = match_simple(text, pattern) {
                return matched;
            }
        }
        match self.regex_for(pattern) {
            Some(regex) => regex.is_match(text),
            None => false,
        }
    }

    /// Number of compiled masks currently cached.
    pub fn cached_patterns(&self) -> usize {
        self.lock().len()
    }

    fn regex_for(&self, pattern: &str) -> Option<Regex> {
        if let Some(regex) = self.lock().get(pattern) {
            return Some(regex.clone());
        }

        // Compile outside the lock; a concurrent compile of the same mask
        // just overwrites an identical entry.
        let regex = match Regex::new(&translate(pattern)) {
            Ok(regex) => regex,
            Err(e) => {
                tracing::warn!(pattern, "failed to compile event mask: {}", e);
                return None;
            }
        };
        self.lock().put(pattern.to_string(), regex.clone());
        Some(regex)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruCache<String, Regex>> {
        match self.compiled.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("event mask cache lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

impl Default for Matcher {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

/// Returns `true` if `mask` contains a wildcard token.
pub fn is_pattern(mask: &str) -> bool {
    mask.contains('*') || mask.contains('?')
}

/// Answers masks that need no regex; `None` sends the caller to the
/// compiled path.
fn match_simple(text: &str, pattern: &str) -> Option<bool> {
    let Some(first_star) = pattern.find('*') else {
        return Some(text == pattern);
    };
    let len = pattern.len();

    if pattern == "**" {
        return Some(true);
    }
    if pattern == "*" {
        return Some(!text.contains('.'));
    }

    // "prefix**"
    if len > 2 && pattern.ends_with("**") && first_star == len - 2 {
        return Some(text.starts_with(&pattern[..len - 2]));
    }

    // "prefix*": exactly one more segment fragment
    if len > 1 && first_star == len - 1 {
        let prefix = &pattern[..len - 1];
        return Some(
            text.strip_prefix(prefix)
                .is_some_and(|rest| !rest.contains('.')),
        );
    }

    None
}

/// Translates a mask into an anchored regex, escaping every literal
/// character (a leading `$` sentinel included).
fn translate(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 16);
    out.push('^');
    let mut buf = [0u8; 4];
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '?' => out.push('.'),
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    out.push_str(".*");
                } else {
                    out.push_str("[^.]*");
                }
            }
            literal => out.push_str(&regex::escape(literal.encode_utf8(&mut buf))),
        }
    }
    out.push('$');
    out
}
