//! Cache key grammar, ETag derivation, and wildcard pattern matching.
//!
//! Keys follow `<content-type>:<rest>`; the content type is everything
//! before the first `:` and selects the TTL. Request-derived keys sort
//! query parameters lexicographically so parameter order never fragments
//! the cache, and hash over-long values instead of embedding them.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

/// Values longer than this are hashed into the key rather than embedded.
const MAX_LITERAL_VALUE_LEN: usize = 80;
/// Hex length of hashed key components.
const COMPONENT_HASH_LEN: usize = 12;
/// Hex length of response ETags.
const ETAG_HASH_LEN: usize = 16;

/// Content type of a key: the prefix before the first `:`, or the whole
/// key when no separator is present.
pub fn content_type_of(key: &str) -> &str {
    key.split(':').next().unwrap_or(key)
}

fn sha256_hex(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hex::encode(hasher.finalize())
}

/// Opaque ETag value derived from response bytes (unquoted).
pub fn etag_for(payload: &[u8]) -> String {
    let mut digest = sha256_hex(&[payload]);
    digest.truncate(ETAG_HASH_LEN);
    digest
}

/// Short hash scoping a cache key to the caller's auth token.
pub fn auth_scope_hash(token: &str) -> String {
    let mut digest = sha256_hex(&[token.as_bytes()]);
    digest.truncate(ETAG_HASH_LEN);
    digest
}

fn component(value: &str) -> String {
    if value.len() > MAX_LITERAL_VALUE_LEN {
        let mut digest = sha256_hex(&[value.as_bytes()]);
        digest.truncate(COMPONENT_HASH_LEN);
        digest
    } else {
        value.to_string()
    }
}

/// Builder for request-derived cache keys.
///
/// Produces `<content-type>:<path>[:<p1=v1>&<p2=v2>...][:user:<hash>]`
/// with parameters sorted by name.
#[derive(Debug, Default)]
pub struct RequestKey {
    content_type: String,
    path: String,
    params: BTreeMap<String, String>,
    auth_token: Option<String>,
}

impl RequestKey {
    pub fn new(content_type: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            content_type: content_type.into(),
            path: path.into(),
            params: BTreeMap::new(),
            auth_token: None,
        }
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// Absorb a raw query string (`a=1&b=2`).
    pub fn query(mut self, raw: &str) -> Self {
        for (name, value) in url::form_urlencoded::parse(raw.as_bytes()) {
            self.params.insert(name.into_owned(), value.into_owned());
        }
        self
    }

    /// Scope the key to a caller identity. Only applied to user-specific
    /// content types by the request adapter.
    pub fn auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn build(self) -> String {
        let path = self.path.trim_matches('/').replace('/', ":");
        let mut key = if path.is_empty() {
            if self.params.is_empty() {
                // parameterless collection, e.g. `categories:all`
                format!("{}:all", self.content_type)
            } else {
                self.content_type
            }
        } else {
            format!("{}:{}", self.content_type, path)
        };
        if !self.params.is_empty() {
            let joined = self
                .params
                .iter()
                .map(|(name, value)| format!("{name}={}", component(value)))
                .collect::<Vec<_>>()
                .join("&");
            key.push(':');
            key.push_str(&joined);
        }
        if let Some(token) = &self.auth_token {
            key.push_str(":user:");
            key.push_str(&auth_scope_hash(token));
        }
        key
    }
}

// ============================================================================
// Wildcard patterns
// ============================================================================

/// Match a `*` wildcard pattern against a key.
///
/// Every `*` matches any substring; every other character is a literal.
/// No regex is involved, so metacharacters in keys (`.`, `+`, `?`) can
/// never widen a match.
pub fn pattern_matches(pattern: &str, key: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == key;
    }

    let segments: Vec<&str> = pattern.split('*').collect();
    let last_index = segments.len() - 1;

    let mut rest = match key.strip_prefix(segments[0]) {
        Some(rest) => rest,
        None => return false,
    };

    for segment in &segments[1..last_index] {
        if segment.is_empty() {
            continue;
        }
        match rest.find(segment) {
            Some(position) => rest = &rest[position + segment.len()..],
            None => return false,
        }
    }

    rest.ends_with(segments[last_index])
}

/// Translate a wildcard pattern into a Redis glob, escaping the glob
/// specials Redis recognizes beyond `*`.
pub(crate) fn redis_glob(pattern: &str) -> String {
    let mut escaped = String::with_capacity(pattern.len());
    for ch in pattern.chars() {
        match ch {
            '?' | '[' | ']' | '\\' => {
                escaped.push('\\');
                escaped.push(ch);
            }
            _ => escaped.push(ch),
        }
    }
    escaped
}

// ============================================================================
// Well-known key constructors
// ============================================================================

/// Key for a paginated post listing.
pub fn posts_list(
    page: u32,
    limit: u32,
    category: Option<&str>,
    search: Option<&str>,
    sort: Option<&str>,
) -> String {
    format!(
        "posts:{page}:{limit}:{}:{}:{}",
        category.unwrap_or("all"),
        search.unwrap_or("none"),
        sort.unwrap_or("newest"),
    )
}

/// Key for a single post by slug.
pub fn post(slug: &str) -> String {
    format!("post:{slug}")
}

pub fn categories() -> String {
    "categories:all".to_string()
}

pub fn sitemap() -> String {
    "sitemap:xml".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_is_prefix_before_colon() {
        assert_eq!(content_type_of("posts:1:20:all:none:newest"), "posts");
        assert_eq!(content_type_of("post:my-slug"), "post");
        assert_eq!(content_type_of("bare"), "bare");
    }

    #[test]
    fn bare_collection_key_gets_the_all_suffix() {
        assert_eq!(RequestKey::new("categories", "").build(), "categories:all");
        assert_eq!(
            RequestKey::new("posts", "").query("page=1").build(),
            "posts:page=1"
        );
    }

    #[test]
    fn request_key_sorts_parameters() {
        let a = RequestKey::new("posts", "/api/posts")
            .param("page", "2")
            .param("category", "rust")
            .build();
        let b = RequestKey::new("posts", "/api/posts")
            .param("category", "rust")
            .param("page", "2")
            .build();
        assert_eq!(a, b);
        assert_eq!(a, "posts:api:posts:category=rust&page=2");
    }

    #[test]
    fn request_key_parses_query_strings() {
        let key = RequestKey::new("posts", "/api/posts")
            .query("page=1&limit=20")
            .build();
        assert_eq!(key, "posts:api:posts:limit=20&page=1");
    }

    #[test]
    fn long_values_are_hashed() {
        let long = "x".repeat(200);
        let key = RequestKey::new("posts", "/api/posts")
            .param("search", &long)
            .build();
        assert!(!key.contains(&long));
        assert!(key.len() < 100);

        // deterministic
        let again = RequestKey::new("posts", "/api/posts")
            .param("search", &long)
            .build();
        assert_eq!(key, again);
    }

    #[test]
    fn auth_token_scopes_key() {
        let anon = RequestKey::new("post", "/api/post/hello").build();
        let alice = RequestKey::new("post", "/api/post/hello")
            .auth_token("Bearer aaa")
            .build();
        let bob = RequestKey::new("post", "/api/post/hello")
            .auth_token("Bearer bbb")
            .build();
        assert_ne!(anon, alice);
        assert_ne!(alice, bob);
        assert!(alice.contains(":user:"));
    }

    #[test]
    fn etag_is_stable_and_short() {
        assert_eq!(etag_for(b"[1,2,3]"), etag_for(b"[1,2,3]"));
        assert_ne!(etag_for(b"[1,2,3]"), etag_for(b"[1,2,4]"));
        assert_eq!(etag_for(b"[1,2,3]").len(), 16);
    }

    #[test]
    fn exact_pattern_matches_exactly() {
        assert!(pattern_matches("posts:1", "posts:1"));
        assert!(!pattern_matches("posts:1", "posts:12"));
    }

    #[test]
    fn wildcard_matches_any_substring() {
        assert!(pattern_matches("posts:*", "posts:1"));
        assert!(pattern_matches("posts:*", "posts:1:20:all:none:newest"));
        assert!(!pattern_matches("posts:*", "post:my-slug"));
        assert!(pattern_matches("*", "anything:at:all"));
        assert!(pattern_matches("*:xml", "sitemap:xml"));
        assert!(pattern_matches("post:*:user:*", "post:hello:user:abc"));
    }

    #[test]
    fn metacharacters_are_literal() {
        // `.` must not act as a regex wildcard
        assert!(!pattern_matches("post.x", "postax"));
        assert!(pattern_matches("post.x", "post.x"));
        assert!(!pattern_matches("posts:*", "postsX1"));
        assert!(!pattern_matches("a+b:*", "aab:1"));
        assert!(pattern_matches("a+b:*", "a+b:1"));
    }

    #[test]
    fn redis_glob_escapes_non_star_specials() {
        assert_eq!(redis_glob("posts:*"), "posts:*");
        assert_eq!(redis_glob("what?:*"), "what\\?:*");
        assert_eq!(redis_glob("a[1]:*"), "a\\[1\\]:*");
    }

    #[test]
    fn well_known_constructors() {
        assert_eq!(
            posts_list(1, 20, None, None, None),
            "posts:1:20:all:none:newest"
        );
        assert_eq!(post("my-slug"), "post:my-slug");
        assert_eq!(categories(), "categories:all");
        assert_eq!(sitemap(), "sitemap:xml");
    }
}
