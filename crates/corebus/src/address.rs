// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bus address parsing.
//!
//! An address is a semicolon-separated list of endpoints; each endpoint is a
//! scheme followed by comma-separated `key=value` pairs, with `%XX` hex
//! escaping for reserved bytes:
//!
//! ```text
//! unix:path=/run/dbus/system_bus_socket;tcp:host=localhost,port=7332
//! ```
//!
//! The cursor hands out one parsed endpoint at a time; the connection retries
//! endpoints in order until one of them connects.

use crate::config::EXEC_ARGV_MAX;
use crate::error::{Error, Result};
use crate::id::{unhex, ServerId};

// ============================================================================
// Endpoints
// ============================================================================

/// Address family preference for TCP endpoints.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TcpFamily {
    V4,
    V6,
}

/// One parsed endpoint descriptor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Endpoint {
    /// Filesystem unix stream socket.
    Unix { path: String },
    /// Abstract-namespace unix socket (leading NUL on the wire address).
    UnixAbstract { name: String },
    /// TCP endpoint; the host resolves with stream semantics at connect time.
    Tcp {
        host: String,
        port: u16,
        family: Option<TcpFamily>,
    },
    /// Spawn a process and speak over its stdio socketpair.
    Exec { path: String, argv: Vec<String> },
    /// Kernel transport special file.
    Kernel { path: String },
}

/// An endpoint plus the server identity pinned for it, if any.
#[derive(Clone, Debug)]
pub(crate) struct ParsedEndpoint {
    pub endpoint: Endpoint,
    pub guid: Option<ServerId>,
}

// ============================================================================
// Cursor
// ============================================================================

/// Iterates the endpoints of an address string. The cursor only moves
/// forward; each connect failure consumes one endpoint.
#[derive(Clone, Debug)]
pub(crate) struct AddressCursor {
    text: String,
    index: usize,
}

impl AddressCursor {
    pub fn new(text: impl Into<String>) -> AddressCursor {
        AddressCursor {
            text: text.into(),
            index: 0,
        }
    }

    /// Parse the next endpoint, advancing the cursor past it. `Ok(None)`
    /// means the list is exhausted.
    pub fn next(&mut self) -> Result<Option<ParsedEndpoint>> {
        let text = self.text.clone();
        let mut pos = self.index;

        let parsed = loop {
            match text.as_bytes().get(pos) {
                None => {
                    self.index = pos;
                    return Ok(None);
                }
                Some(b';') => {
                    pos += 1;
                    continue;
                }
                Some(_) => {}
            }

            if let Some(rest) = strip_scheme(&text, &mut pos, "unix:") {
                break parse_unix(rest, &mut pos)?;
            } else if let Some(rest) = strip_scheme(&text, &mut pos, "tcp:") {
                break parse_tcp(rest, &mut pos)?;
            } else if let Some(rest) = strip_scheme(&text, &mut pos, "unixexec:") {
                break parse_exec(rest, &mut pos)?;
            } else if let Some(rest) = strip_scheme(&text, &mut pos, "kernel:") {
                break parse_kernel(rest, &mut pos)?;
            }

            // Unknown scheme: skip this endpoint entirely.
            match text[pos..].find(';') {
                Some(n) => pos += n,
                None => {
                    self.index = text.len();
                    return Ok(None);
                }
            }
        };

        self.index = pos;
        Ok(Some(parsed))
    }
}

/// If the text at `*pos` starts with `scheme`, advance past it and return the
/// full text (parsing continues at the updated position).
fn strip_scheme<'a>(text: &'a str, pos: &mut usize, scheme: &str) -> Option<&'a str> {
    if text[*pos..].starts_with(scheme) {
        *pos += scheme.len();
        Some(text)
    } else {
        None
    }
}

// ============================================================================
// Key/value scanning
// ============================================================================

/// Parse `key=value` at `*pos` into `value`, consuming a trailing comma.
///
/// Returns `Ok(false)` when the key does not match. Matching twice is an
/// error. With `key == None` the raw value at `*pos` is parsed
/// unconditionally (used for `argvN` elements, where later keys overwrite).
fn parse_address_key(
    text: &str,
    pos: &mut usize,
    key: Option<&str>,
    value: &mut Option<String>,
) -> Result<bool> {
    let mut at = *pos;

    if let Some(key) = key {
        if !text[at..].starts_with(key) || text.as_bytes().get(at + key.len()) != Some(&b'=') {
            return Ok(false);
        }
        if value.is_some() {
            return Err(Error::InvalidArgument(format!(
                "duplicate address key '{}'",
                key
            )));
        }
        at += key.len() + 1;
    }

    let bytes = text.as_bytes();
    let mut out = Vec::new();
    while let Some(&c) = bytes.get(at) {
        match c {
            b';' | b',' => break,
            b'%' => {
                let hi = bytes.get(at + 1).copied().and_then(unhex);
                let lo = bytes.get(at + 2).copied().and_then(unhex);
                match (hi, lo) {
                    (Some(hi), Some(lo)) => {
                        out.push((hi << 4) | lo);
                        at += 3;
                    }
                    _ => {
                        return Err(Error::InvalidArgument(
                            "bad %XX escape in address".into(),
                        ))
                    }
                }
            }
            _ => {
                out.push(c);
                at += 1;
            }
        }
    }

    if bytes.get(at) == Some(&b',') {
        at += 1;
    }
    *pos = at;

    let s = String::from_utf8(out)
        .map_err(|_| Error::InvalidArgument("address value is not valid UTF-8".into()))?;
    *value = Some(s);
    Ok(true)
}

/// Skip one unrecognized `key=value` pair, stopping at the endpoint boundary.
fn skip_address_key(text: &str, pos: &mut usize) {
    let bytes = text.as_bytes();
    while let Some(&c) = bytes.get(*pos) {
        match c {
            b';' => return,
            b',' => {
                *pos += 1;
                return;
            }
            _ => *pos += 1,
        }
    }
}

fn at_endpoint_end(text: &str, pos: usize) -> bool {
    matches!(text.as_bytes().get(pos), None | Some(b';'))
}

fn parse_guid(guid: Option<String>) -> Result<Option<ServerId>> {
    guid.map(|g| g.parse()).transpose()
}

// ============================================================================
// Schemes
// ============================================================================

fn parse_unix(text: &str, pos: &mut usize) -> Result<ParsedEndpoint> {
    let mut guid = None;
    let mut path = None;
    let mut abstract_name = None;

    while !at_endpoint_end(text, *pos) {
        if parse_address_key(text, pos, Some("guid"), &mut guid)?
            || parse_address_key(text, pos, Some("path"), &mut path)?
            || parse_address_key(text, pos, Some("abstract"), &mut abstract_name)?
        {
            continue;
        }
        skip_address_key(text, pos);
    }

    let endpoint = match (path, abstract_name) {
        (Some(path), None) => Endpoint::Unix { path },
        (None, Some(name)) => Endpoint::UnixAbstract { name },
        _ => {
            return Err(Error::InvalidArgument(
                "unix: endpoint needs exactly one of path= or abstract=".into(),
            ))
        }
    };

    Ok(ParsedEndpoint {
        endpoint,
        guid: parse_guid(guid)?,
    })
}

fn parse_tcp(text: &str, pos: &mut usize) -> Result<ParsedEndpoint> {
    let mut guid = None;
    let mut host = None;
    let mut port = None;
    let mut family = None;

    while !at_endpoint_end(text, *pos) {
        if parse_address_key(text, pos, Some("guid"), &mut guid)?
            || parse_address_key(text, pos, Some("host"), &mut host)?
            || parse_address_key(text, pos, Some("port"), &mut port)?
            || parse_address_key(text, pos, Some("family"), &mut family)?
        {
            continue;
        }
        skip_address_key(text, pos);
    }

    let (host, port) = match (host, port) {
        (Some(h), Some(p)) => (h, p),
        _ => {
            return Err(Error::InvalidArgument(
                "tcp: endpoint needs host= and port=".into(),
            ))
        }
    };

    let port: u16 = port
        .parse()
        .map_err(|_| Error::InvalidArgument(format!("bad tcp port '{}'", port)))?;

    let family = match family.as_deref() {
        None => None,
        Some("ipv4") => Some(TcpFamily::V4),
        Some("ipv6") => Some(TcpFamily::V6),
        Some(other) => {
            return Err(Error::InvalidArgument(format!(
                "bad tcp family '{}'",
                other
            )))
        }
    };

    Ok(ParsedEndpoint {
        endpoint: Endpoint::Tcp { host, port, family },
        guid: parse_guid(guid)?,
    })
}

fn parse_exec(text: &str, pos: &mut usize) -> Result<ParsedEndpoint> {
    let mut guid = None;
    let mut path = None;
    let mut argv: Vec<Option<String>> = Vec::new();

    while !at_endpoint_end(text, *pos) {
        if parse_address_key(text, pos, Some("guid"), &mut guid)?
            || parse_address_key(text, pos, Some("path"), &mut path)?
        {
            continue;
        }

        if let Some(rest) = text[*pos..].strip_prefix("argv") {
            let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
            if digits > 0 && rest.as_bytes().get(digits) == Some(&b'=') {
                let n: usize = rest[..digits]
                    .parse()
                    .map_err(|_| Error::InvalidArgument("bad argv index".into()))?;
                if n > EXEC_ARGV_MAX {
                    return Err(Error::InvalidArgument(format!(
                        "argv index {} exceeds {}",
                        n, EXEC_ARGV_MAX
                    )));
                }

                *pos += 4 + digits + 1;
                if n >= argv.len() {
                    argv.resize(n + 1, None);
                }
                parse_address_key(text, pos, None, &mut argv[n])?;
                continue;
            }
        }

        skip_address_key(text, pos);
    }

    let path = path.ok_or_else(|| {
        Error::InvalidArgument("unixexec: endpoint needs path=".into())
    })?;

    // No holes allowed, except argv0 which defaults to the path.
    if argv.iter().skip(1).any(Option::is_none) {
        return Err(Error::InvalidArgument("unixexec: argv has holes".into()));
    }
    if argv.is_empty() {
        argv.push(None);
    }
    let argv = argv
        .into_iter()
        .enumerate()
        .map(|(i, a)| match a {
            Some(a) => a,
            None => {
                debug_assert_eq!(i, 0);
                path.clone()
            }
        })
        .collect();

    Ok(ParsedEndpoint {
        endpoint: Endpoint::Exec { path, argv },
        guid: parse_guid(guid)?,
    })
}

fn parse_kernel(text: &str, pos: &mut usize) -> Result<ParsedEndpoint> {
    let mut guid = None;
    let mut path = None;

    while !at_endpoint_end(text, *pos) {
        if parse_address_key(text, pos, Some("guid"), &mut guid)?
            || parse_address_key(text, pos, Some("path"), &mut path)?
        {
            continue;
        }
        skip_address_key(text, pos);
    }

    let path =
        path.ok_or_else(|| Error::InvalidArgument("kernel: endpoint needs path=".into()))?;

    Ok(ParsedEndpoint {
        endpoint: Endpoint::Kernel { path },
        guid: parse_guid(guid)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one(address: &str) -> ParsedEndpoint {
        let mut cursor = AddressCursor::new(address);
        cursor.next().unwrap().expect("endpoint")
    }

    #[test]
    fn test_unix_path() {
        let e = one("unix:path=/tmp/bus");
        assert_eq!(
            e.endpoint,
            Endpoint::Unix {
                path: "/tmp/bus".into()
            }
        );
        assert!(e.guid.is_none());
    }

    #[test]
    fn test_unix_abstract() {
        let e = one("unix:abstract=mybus");
        assert_eq!(
            e.endpoint,
            Endpoint::UnixAbstract {
                name: "mybus".into()
            }
        );
    }

    #[test]
    fn test_unix_needs_exactly_one() {
        let mut c = AddressCursor::new("unix:guid=0123456789abcdef0123456789abcdef");
        assert!(c.next().is_err());
        let mut c = AddressCursor::new("unix:path=/a,abstract=b");
        assert!(c.next().is_err());
    }

    #[test]
    fn test_percent_escaping() {
        let e = one("unix:path=/tmp/a%20b%3bc");
        assert_eq!(
            e.endpoint,
            Endpoint::Unix {
                path: "/tmp/a b;c".into()
            }
        );

        let mut c = AddressCursor::new("unix:path=/tmp/%zz");
        assert!(c.next().is_err());
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let mut c = AddressCursor::new("unix:path=/a,path=/b");
        assert!(c.next().is_err());
    }

    #[test]
    fn test_tcp() {
        let e = one("tcp:host=localhost,port=7332,family=ipv4");
        assert_eq!(
            e.endpoint,
            Endpoint::Tcp {
                host: "localhost".into(),
                port: 7332,
                family: Some(TcpFamily::V4),
            }
        );

        assert!(AddressCursor::new("tcp:host=x").next().is_err());
        assert!(AddressCursor::new("tcp:host=x,port=99999").next().is_err());
        assert!(AddressCursor::new("tcp:host=x,port=1,family=ipx")
            .next()
            .is_err());
    }

    #[test]
    fn test_exec_argv() {
        let e = one("unixexec:path=/bin/broker,argv1=--peer,argv2=-v");
        assert_eq!(
            e.endpoint,
            Endpoint::Exec {
                path: "/bin/broker".into(),
                argv: vec!["/bin/broker".into(), "--peer".into(), "-v".into()],
            }
        );
    }

    #[test]
    fn test_exec_argv0_override() {
        let e = one("unixexec:path=/bin/broker,argv0=broker");
        assert_eq!(
            e.endpoint,
            Endpoint::Exec {
                path: "/bin/broker".into(),
                argv: vec!["broker".into()],
            }
        );
    }

    #[test]
    fn test_exec_argv_holes_rejected() {
        let mut c = AddressCursor::new("unixexec:path=/bin/b,argv2=x");
        assert!(c.next().is_err());
    }

    #[test]
    fn test_kernel() {
        let e = one("kernel:path=/dev/kdbus/0-user/bus");
        assert_eq!(
            e.endpoint,
            Endpoint::Kernel {
                path: "/dev/kdbus/0-user/bus".into()
            }
        );
    }

    #[test]
    fn test_guid() {
        let e = one("unix:path=/tmp/bus,guid=0123456789abcdef0123456789abcdef");
        assert_eq!(
            e.guid,
            Some("0123456789abcdef0123456789abcdef".parse().unwrap())
        );

        let mut c = AddressCursor::new("unix:path=/tmp/bus,guid=nothex");
        assert!(c.next().is_err());
    }

    #[test]
    fn test_cursor_iterates_list() {
        let mut c = AddressCursor::new("unix:path=/a;tcp:host=h,port=1;unix:abstract=z");

        assert!(matches!(
            c.next().unwrap().unwrap().endpoint,
            Endpoint::Unix { .. }
        ));
        assert!(matches!(
            c.next().unwrap().unwrap().endpoint,
            Endpoint::Tcp { .. }
        ));
        assert!(matches!(
            c.next().unwrap().unwrap().endpoint,
            Endpoint::UnixAbstract { .. }
        ));
        assert!(c.next().unwrap().is_none());
        assert!(c.next().unwrap().is_none());
    }

    #[test]
    fn test_unknown_scheme_skipped() {
        let mut c = AddressCursor::new("launchd:env=FOO;unix:path=/a");
        assert!(matches!(
            c.next().unwrap().unwrap().endpoint,
            Endpoint::Unix { .. }
        ));
    }

    #[test]
    fn test_unknown_key_skipped() {
        let e = one("unix:frob=1,path=/a");
        assert_eq!(e.endpoint, Endpoint::Unix { path: "/a".into() });
    }

    #[test]
    fn test_empty_address() {
        let mut c = AddressCursor::new("");
        assert!(c.next().unwrap().is_none());
        let mut c = AddressCursor::new(";;");
        assert!(c.next().unwrap().is_none());
    }
}
