// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Validation for object paths, interface/member/service names and type
//! signatures.
//!
//! Registration entry points validate eagerly so that dispatch never has to.

/// Maximum length for interface, member and service names.
const NAME_MAX: usize = 255;

/// Maximum length of a type signature.
const SIGNATURE_MAX: usize = 255;

/// Maximum container nesting depth within a signature.
const SIGNATURE_DEPTH_MAX: usize = 32;

// ============================================================================
// Object paths
// ============================================================================

/// Whether `path` is a valid absolute object path.
///
/// Paths are `/`-separated, each element non-empty and drawn from
/// `[A-Za-z0-9_]`; only the root path ends in `/`.
pub fn object_path_is_valid(path: &str) -> bool {
    let bytes = path.as_bytes();

    if bytes.first() != Some(&b'/') {
        return false;
    }
    if bytes.len() == 1 {
        return true;
    }
    if bytes.last() == Some(&b'/') {
        return false;
    }

    let mut prev_slash = true; // we just consumed the leading '/'
    for &c in &bytes[1..] {
        if c == b'/' {
            if prev_slash {
                return false;
            }
            prev_slash = true;
        } else {
            if !c.is_ascii_alphanumeric() && c != b'_' {
                return false;
            }
            prev_slash = false;
        }
    }

    true
}

/// The suffix of `path` below `prefix`, if `path` lies in that subtree.
///
/// Returns `Some("")` when the two are equal. The root prefix matches every
/// path.
pub fn object_path_startswith<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    if prefix == "/" {
        return Some(&path[1..]);
    }

    let rest = path.strip_prefix(prefix)?;
    if rest.is_empty() {
        Some(rest)
    } else {
        rest.strip_prefix('/')
    }
}

/// Parent of an object path: everything up to, but excluding, the final `/`,
/// or `/` for top-level paths. The root has no parent.
pub fn parent_path(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }

    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(i) => Some(&path[..i]),
        None => None,
    }
}

// ============================================================================
// Names
// ============================================================================

/// Whether `name` is a valid interface name: two or more dot-separated
/// elements, each starting with a non-digit, drawn from `[A-Za-z0-9_]`.
pub fn interface_name_is_valid(name: &str) -> bool {
    if name.is_empty() || name.len() > NAME_MAX {
        return false;
    }

    let mut elements = 0;
    for element in name.split('.') {
        if !element_is_valid(element) {
            return false;
        }
        elements += 1;
    }

    elements >= 2
}

/// Whether `name` is a valid member (method/signal/property) name.
pub fn member_name_is_valid(name: &str) -> bool {
    if name.is_empty() || name.len() > NAME_MAX {
        return false;
    }

    let bytes = name.as_bytes();
    if bytes[0].is_ascii_digit() {
        return false;
    }

    bytes.iter().all(|&c| c.is_ascii_alphanumeric() || c == b'_')
}

/// Whether `name` is a valid service name.
///
/// Unique names start with `:` and may have digit-leading elements;
/// well-known names may not. Both allow `-` in addition to the interface
/// character set.
pub fn service_name_is_valid(name: &str) -> bool {
    let (unique, body) = match name.strip_prefix(':') {
        Some(rest) => (true, rest),
        None => (false, name),
    };

    if body.is_empty() || name.len() > NAME_MAX {
        return false;
    }

    let mut elements = 0;
    for element in body.split('.') {
        if element.is_empty() {
            return false;
        }
        if !unique && element.as_bytes()[0].is_ascii_digit() {
            return false;
        }
        if !element
            .bytes()
            .all(|c| c.is_ascii_alphanumeric() || c == b'_' || c == b'-')
        {
            return false;
        }
        elements += 1;
    }

    elements >= 2 || unique
}

fn element_is_valid(element: &str) -> bool {
    if element.is_empty() || element.as_bytes()[0].is_ascii_digit() {
        return false;
    }

    element.bytes().all(|c| c.is_ascii_alphanumeric() || c == b'_')
}

// ============================================================================
// Signatures
// ============================================================================

/// Whether `signature` is a valid sequence of complete types.
pub fn signature_is_valid(signature: &str) -> bool {
    if signature.len() > SIGNATURE_MAX {
        return false;
    }

    let bytes = signature.as_bytes();
    let mut pos = 0;
    while pos < bytes.len() {
        match complete_type_len(bytes, pos, 0) {
            Some(n) => pos += n,
            None => return false,
        }
    }

    true
}

/// Whether `signature` is exactly one complete type.
pub fn signature_is_single(signature: &str) -> bool {
    let bytes = signature.as_bytes();
    match complete_type_len(bytes, 0, 0) {
        Some(n) => n == bytes.len(),
        None => false,
    }
}

/// Split a valid signature into its complete types.
pub fn signature_split(signature: &str) -> Option<Vec<&str>> {
    let bytes = signature.as_bytes();
    let mut out = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let n = complete_type_len(bytes, pos, 0)?;
        out.push(&signature[pos..pos + n]);
        pos += n;
    }

    Some(out)
}

/// Length in bytes of the complete type starting at `pos`, or `None` if the
/// signature is malformed there.
fn complete_type_len(bytes: &[u8], pos: usize, depth: usize) -> Option<usize> {
    if depth > SIGNATURE_DEPTH_MAX {
        return None;
    }

    match bytes.get(pos)? {
        b'y' | b'b' | b'n' | b'q' | b'i' | b'u' | b'x' | b't' | b'd' | b's' | b'o' | b'g'
        | b'h' | b'v' => Some(1),

        b'a' => {
            // Array of one complete type; dict entries only directly inside.
            if bytes.get(pos + 1) == Some(&b'{') {
                let inner = dict_entry_len(bytes, pos + 1, depth + 1)?;
                Some(1 + inner)
            } else {
                let inner = complete_type_len(bytes, pos + 1, depth + 1)?;
                Some(1 + inner)
            }
        }

        b'(' => {
            let mut n = 1;
            loop {
                match bytes.get(pos + n)? {
                    b')' => return if n > 1 { Some(n + 1) } else { None },
                    _ => n += complete_type_len(bytes, pos + n, depth + 1)?,
                }
            }
        }

        _ => None,
    }
}

/// Length of a `{kv}` dict entry starting at the opening brace. The key must
/// be a basic type.
fn dict_entry_len(bytes: &[u8], pos: usize, depth: usize) -> Option<usize> {
    if depth > SIGNATURE_DEPTH_MAX {
        return None;
    }

    let key_len = complete_type_len(bytes, pos + 1, depth + 1)?;
    if key_len != 1 || bytes[pos + 1] == b'v' {
        return None;
    }

    let value_len = complete_type_len(bytes, pos + 1 + key_len, depth + 1)?;
    if bytes.get(pos + 1 + key_len + value_len) != Some(&b'}') {
        return None;
    }

    Some(1 + key_len + value_len + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_paths() {
        assert!(object_path_is_valid("/"));
        assert!(object_path_is_valid("/foo"));
        assert!(object_path_is_valid("/foo/bar_2"));
        assert!(!object_path_is_valid(""));
        assert!(!object_path_is_valid("foo"));
        assert!(!object_path_is_valid("/foo/"));
        assert!(!object_path_is_valid("//foo"));
        assert!(!object_path_is_valid("/foo-bar"));
    }

    #[test]
    fn test_parent_path() {
        assert_eq!(parent_path("/"), None);
        assert_eq!(parent_path("/foo"), Some("/"));
        assert_eq!(parent_path("/foo/bar/baz"), Some("/foo/bar"));
    }

    #[test]
    fn test_path_startswith() {
        assert_eq!(object_path_startswith("/foo/bar", "/foo"), Some("bar"));
        assert_eq!(object_path_startswith("/foo", "/foo"), Some(""));
        assert_eq!(object_path_startswith("/foo/bar", "/"), Some("foo/bar"));
        assert_eq!(object_path_startswith("/foobar", "/foo"), None);
        assert_eq!(object_path_startswith("/baz", "/foo"), None);
    }

    #[test]
    fn test_interface_names() {
        assert!(interface_name_is_valid("org.freedesktop.DBus"));
        assert!(interface_name_is_valid("a.b"));
        assert!(!interface_name_is_valid("nosegments"));
        assert!(!interface_name_is_valid("a..b"));
        assert!(!interface_name_is_valid("a.1b"));
        assert!(!interface_name_is_valid("a.b-c"));
        assert!(!interface_name_is_valid(""));
    }

    #[test]
    fn test_member_names() {
        assert!(member_name_is_valid("Ping"));
        assert!(member_name_is_valid("Get_All2"));
        assert!(!member_name_is_valid("2Fast"));
        assert!(!member_name_is_valid("has.dot"));
        assert!(!member_name_is_valid(""));
    }

    #[test]
    fn test_service_names() {
        assert!(service_name_is_valid(":1.42"));
        assert!(service_name_is_valid("org.freedesktop.DBus"));
        assert!(service_name_is_valid("com.example-corp.App"));
        assert!(!service_name_is_valid("1.42"));
        assert!(!service_name_is_valid(":"));
        assert!(!service_name_is_valid("single"));
        assert!(!service_name_is_valid("a..b"));
    }

    #[test]
    fn test_signatures() {
        assert!(signature_is_valid(""));
        assert!(signature_is_valid("s"));
        assert!(signature_is_valid("susv"));
        assert!(signature_is_valid("a{sv}"));
        assert!(signature_is_valid("a{oa{sa{sv}}}"));
        assert!(signature_is_valid("(iis)a(uu)"));
        assert!(!signature_is_valid("a"));
        assert!(!signature_is_valid("()"));
        assert!(!signature_is_valid("(s"));
        assert!(!signature_is_valid("{sv}"));
        assert!(!signature_is_valid("a{vs}"));
        assert!(!signature_is_valid("z"));
    }

    #[test]
    fn test_signature_single() {
        assert!(signature_is_single("s"));
        assert!(signature_is_single("a{sv}"));
        assert!(signature_is_single("(ii)"));
        assert!(!signature_is_single("ss"));
        assert!(!signature_is_single(""));
    }

    #[test]
    fn test_signature_split() {
        assert_eq!(signature_split("susa{sv}").unwrap(), vec!["s", "u", "s", "a{sv}"]);
        assert_eq!(signature_split("").unwrap(), Vec::<&str>::new());
        assert!(signature_split("sa").is_none());
    }

    #[test]
    fn test_deep_nesting_rejected() {
        let deep = "a".repeat(64) + "u";
        assert!(!signature_is_valid(&deep));
    }
}
