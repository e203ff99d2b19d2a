//! Connection string validation and helpers
//!
//! Local, coordinator and peer endpoints share one connection string form:
//! either `key=value` pairs or a `postgresql://` URI. Every string goes
//! through [`ConnInfo::parse`] before any network attempt is made.

use crate::common::{Error, Result};
use std::fmt;
use tokio_postgres::config::Host;

/// Longest connection string accepted, in bytes.
pub const MAX_CONNINFO: usize = 1024;

/// Default Postgres port when the connection string does not name one.
pub const POSTGRES_PORT: u16 = 5432;

/// A validated connection string.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnInfo {
    raw: String,
}

impl ConnInfo {
    /// Validate a connection string: bounded length, then a full parse.
    pub fn parse(conninfo: &str) -> Result<Self> {
        if conninfo.len() >= MAX_CONNINFO {
            tracing::error!(
                "Connection string is {} characters, the maximum supported is {}",
                conninfo.len(),
                MAX_CONNINFO - 1
            );
            return Err(Error::InvalidConnectionString(format!(
                "{} characters, the maximum supported is {}",
                conninfo.len(),
                MAX_CONNINFO - 1
            )));
        }

        if conninfo.trim().is_empty() {
            return Err(Error::InvalidConnectionString(
                "connection string is empty".into(),
            ));
        }

        conninfo
            .parse::<tokio_postgres::Config>()
            .map_err(|e| {
                Error::InvalidConnectionString(format!(
                    "failed to parse \"{}\": {}",
                    redact(conninfo),
                    e
                ))
            })?;

        Ok(Self {
            raw: conninfo.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Driver configuration for this connection string.
    pub fn to_config(&self) -> Result<tokio_postgres::Config> {
        self.raw
            .parse()
            .map_err(|e: tokio_postgres::Error| Error::InvalidConnectionString(e.to_string()))
    }

    /// First host and port named by the connection string.
    pub fn host_and_port(&self) -> Result<(String, u16)> {
        let config = self.to_config()?;

        let host = match config.get_hosts().first() {
            Some(Host::Tcp(host)) => host.clone(),
            #[cfg(unix)]
            Some(Host::Unix(path)) => path.display().to_string(),
            None => match config.get_hostaddrs().first() {
                Some(addr) => addr.to_string(),
                None => "localhost".to_string(),
            },
        };
        let port = config.get_ports().first().copied().unwrap_or(POSTGRES_PORT);

        Ok((host, port))
    }
}

impl fmt::Display for ConnInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&redact(&self.raw))
    }
}

impl fmt::Debug for ConnInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnInfo({})", redact(&self.raw))
    }
}

/// Mask passwords in a connection string before it reaches the logs.
pub fn redact(conninfo: &str) -> String {
    if let Some(rest) = conninfo
        .strip_prefix("postgresql://")
        .map(|r| ("postgresql://", r))
        .or_else(|| conninfo.strip_prefix("postgres://").map(|r| ("postgres://", r)))
    {
        let (scheme, rest) = rest;
        let authority_end = rest.find(['/', '?']).unwrap_or(rest.len());
        let (authority, tail) = rest.split_at(authority_end);
        if let Some(at) = authority.rfind('@') {
            let userinfo = &authority[..at];
            if let Some(colon) = userinfo.find(':') {
                return format!(
                    "{}{}:****{}{}",
                    scheme,
                    &userinfo[..colon],
                    &authority[at..],
                    redact_query_password(tail)
                );
            }
        }
        return format!("{}{}{}", scheme, authority, redact_query_password(tail));
    }

    let mut out = Vec::new();
    for (key, value) in keyword_fields(conninfo) {
        match (key, value) {
            ("password", _) => out.push("password=****".to_string()),
            (key, Some(value)) => out.push(format!("{}={}", key, value)),
            // unparsable from here on, hide the rest
            (_, None) => {
                out.push("****".to_string());
                break;
            }
        }
    }
    out.join(" ")
}

/// Split a keyword/value connection string into `key` and raw `value`
/// text, allowing spaces around `=` and quoted values. A field without a
/// value ends the iteration with `None`.
fn keyword_fields(conninfo: &str) -> Vec<(&str, Option<&str>)> {
    let mut fields = Vec::new();
    let mut rest = conninfo.trim_start();

    while !rest.is_empty() {
        let key_end = rest
            .find(|c: char| c == '=' || c.is_whitespace())
            .unwrap_or(rest.len());
        let key = &rest[..key_end];
        let after_key = rest[key_end..].trim_start();

        let value_start = match after_key.strip_prefix('=') {
            Some(v) => v.trim_start(),
            None => {
                fields.push((key, None));
                break;
            }
        };

        let value_len = if value_start.starts_with('\'') {
            quoted_len(value_start)
        } else {
            Some(
                value_start
                    .find(char::is_whitespace)
                    .unwrap_or(value_start.len()),
            )
        };
        match value_len {
            Some(len) => {
                fields.push((key, Some(&value_start[..len])));
                rest = value_start[len..].trim_start();
            }
            None => {
                fields.push((key, None));
                break;
            }
        }
    }
    fields
}

/// Byte length of a single-quoted value including both quotes, honoring
/// backslash escapes; `None` when the closing quote is missing.
fn quoted_len(value: &str) -> Option<usize> {
    let mut escaped = false;
    for (i, c) in value.char_indices().skip(1) {
        match c {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            '\'' => return Some(i + 1),
            _ => {}
        }
    }
    None
}

fn redact_query_password(tail: &str) -> String {
    match tail.split_once('?') {
        Some((path, query)) => {
            let params: Vec<String> = query
                .split('&')
                .map(|p| match p.split_once('=') {
                    Some(("password", _)) => "password=****".to_string(),
                    _ => p.to_string(),
                })
                .collect();
            format!("{}?{}", path, params.join("&"))
        }
        None => tail.to_string(),
    }
}

/// ` key=value` connection string field for an integer value.
pub fn conninfo_field_int(key: &str, value: i64) -> String {
    format!(" {}={}", key, value)
}

/// ` key='value'` connection string field, quoting the value.
pub fn conninfo_field_str(key: &str, value: &str) -> String {
    format!(" {}={}", key, escape_conninfo_value(value))
}

/// Quote a connection string value, escaping single quotes and backslashes.
pub fn escape_conninfo_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len() + 2);
    escaped.push('\'');
    for c in value.chars() {
        if c == '\'' || c == '\\' {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('\'');
    escaped
}
