//! Canonical forms of the request target.
//!
//! Policy decisions and forwarding must see the same host and path. The
//! dispatcher normalizes the path once, evaluates the policy against the
//! result and forwards exactly that path, so an upstream URL parser has no
//! dot segments left to collapse.

/// Host without its port. Bracketed IPv6 literals keep their brackets; a
/// suffix that is not a port (or a bare IPv6 literal) is left alone.
#[must_use]
pub fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return host.find(']').map_or(host, |end| &host[..=end]);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') && port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

/// Normalize an origin-form path (RFC 3986 §6.2.2): percent-encoded
/// unreserved characters are decoded, `.` and `..` segments resolved and
/// empty segments collapsed. A trailing slash is kept.
///
/// Returns `None` for paths that cannot be normalized safely: not starting
/// with `/`, or carrying a backslash or an encoded `/` or `\`.
#[must_use]
pub fn normalize_path(path: &str) -> Option<String> {
    let rest = path.strip_prefix('/')?;
    if path.contains('\\') {
        return None;
    }

    let mut segments: Vec<String> = Vec::new();
    let mut trailing_slash = false;
    for raw in rest.split('/') {
        let segment = decode_unreserved(raw)?;
        trailing_slash = true;
        match segment.as_str() {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            _ => {
                segments.push(segment);
                trailing_slash = false;
            }
        }
    }

    let mut normalized = String::with_capacity(path.len());
    for segment in &segments {
        normalized.push('/');
        normalized.push_str(segment);
    }
    if normalized.is_empty() || trailing_slash {
        normalized.push('/');
    }
    Some(normalized)
}

/// Decode `%XX` escapes of unreserved characters, uppercase the rest.
/// `None` when the segment hides a path separator.
fn decode_unreserved(segment: &str) -> Option<String> {
    let bytes = segment.as_bytes();
    let mut out = String::with_capacity(segment.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let escaped = segment.get(i + 1..i + 3).and_then(|hex| u8::from_str_radix(hex, 16).ok());
            if let Some(byte) = escaped {
                match byte {
                    b'/' | b'\\' => return None,
                    b if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~') => {
                        out.push(char::from(b));
                    }
                    _ => out.push_str(&segment[i..i + 3].to_ascii_uppercase()),
                }
                i += 3;
                continue;
            }
        }
        // Multi-byte UTF-8 is copied whole
        let ch = segment[i..].chars().next()?;
        out.push(ch);
        i += ch.len_utf8();
    }
    Some(out)
}
