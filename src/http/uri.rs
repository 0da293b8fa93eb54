//! Absolute and relative `http`/`https` references.
//!
//! Input without a scheme is read as an `http` authority followed by a path,
//! so `example.com:666/foo` means `http://example.com:666/foo`. Input that
//! starts with `/`, `?` or `#` is a relative reference with no host.
//!
//! ```
//! use httpony::http::Uri;
//!
//! let uri: Uri = "example.com:666/foo?x=42".parse().unwrap();
//! assert_eq!(uri.scheme().as_str(), "http");
//! assert_eq!(uri.host(), Some("example.com"));
//! assert_eq!(uri.port(), 666);
//! assert_eq!(uri.path(), "/foo");
//! assert_eq!(uri.query_params().get("x"), Some("42"));
//!
//! let uri: Uri = "https://example.org:443/baz".parse().unwrap();
//! assert_eq!(uri.to_string(), "https://example.org/baz");
//! ```

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::Deserialize;
use thiserror::Error;

use crate::context::Params;

/// Errors produced while parsing a URI.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UriError {
    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),

    #[error("invalid port: {0}")]
    InvalidPort(String),

    #[error("invalid host: {0}")]
    InvalidHost(String),
}

/// A URI scheme this crate can speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    #[default]
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scheme {
    type Err = UriError;

    fn from_str(s: &str) -> Result<Self, UriError> {
        if s.eq_ignore_ascii_case("http") {
            Ok(Scheme::Http)
        } else if s.eq_ignore_ascii_case("https") {
            Ok(Scheme::Https)
        } else {
            Err(UriError::UnsupportedScheme(s.to_owned()))
        }
    }
}

/// A parsed HTTP(S) URI reference.
///
/// Two URIs are equal when their canonical string forms are equal; the
/// canonical form lower-cases scheme and host and leaves out a port equal to
/// the scheme's default.
#[derive(Debug, Clone)]
pub struct Uri {
    scheme: Scheme,
    username: Option<String>,
    password: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    path: String,
    query: Option<String>,
    fragment: Option<String>,
}

impl Default for Uri {
    fn default() -> Self {
        Self {
            scheme: Scheme::Http,
            username: None,
            password: None,
            host: None,
            port: None,
            path: "/".to_owned(),
            query: None,
            fragment: None,
        }
    }
}

impl Uri {
    /// Parses a URI reference.
    pub fn parse(input: &str) -> Result<Self, UriError> {
        let input = input.trim();
        let mut uri = Uri::default();

        let scheme_end = input.find("://").filter(|&pos| {
            pos > 0
                && input[..pos]
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        });

        let rest = if let Some(pos) = scheme_end {
            uri.scheme = input[..pos].parse()?;
            Some(&input[pos + 3..])
        } else if let Some(rest) = input.strip_prefix("//") {
            Some(rest)
        } else if input.is_empty() || input.starts_with(['/', '?', '#']) {
            None
        } else {
            Some(input)
        };

        let reference = match rest {
            Some(rest) => {
                let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
                uri.set_authority(&rest[..end])?;
                &rest[end..]
            }
            None => input,
        };

        let (reference, fragment) = match reference.split_once('#') {
            Some((r, f)) => (r, Some(f.to_owned())),
            None => (reference, None),
        };
        let (path, query) = match reference.split_once('?') {
            Some((p, q)) => (p, Some(q.to_owned())),
            None => (reference, None),
        };
        uri.set_path(path);
        uri.query = query;
        uri.fragment = fragment;
        Ok(uri)
    }

    /// Replaces userinfo, host and port from an authority such as
    /// `user:pw@example.com:8080` or `[::1]:80`.
    pub fn set_authority(&mut self, authority: &str) -> Result<(), UriError> {
        let (userinfo, hostport) = match authority.rsplit_once('@') {
            Some((u, h)) => (Some(u), h),
            None => (None, authority),
        };
        let (host, port) = split_host_port(hostport)?;
        self.username = None;
        self.password = None;
        if let Some(userinfo) = userinfo {
            let (user, pass) = match userinfo.split_once(':') {
                Some((u, p)) => (u, Some(p.to_owned())),
                None => (userinfo, None),
            };
            self.username = Some(user.to_owned());
            self.password = pass;
        }
        self.host = (!host.is_empty()).then(|| host.to_ascii_lowercase());
        self.port = port;
        Ok(())
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn set_scheme(&mut self, scheme: Scheme) {
        self.scheme = scheme;
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    /// The port, falling back to the scheme's default.
    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.scheme.default_port())
    }

    /// Returns `true` unless the port differs from the scheme's default.
    pub fn has_default_port(&self) -> bool {
        self.port() == self.scheme.default_port()
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Replaces the path; an empty path becomes `/`.
    pub fn set_path(&mut self, path: &str) {
        self.path = if path.is_empty() {
            "/".to_owned()
        } else if path.starts_with('/') {
            path.to_owned()
        } else {
            format!("/{path}")
        };
    }

    /// The raw query string, without the leading `?`.
    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn fragment(&self) -> Option<&str> {
        self.fragment.as_deref()
    }

    /// Decoded query parameters; repeated keys collapse into a list.
    pub fn query_params(&self) -> Params {
        let mut params = Params::new();
        if let Some(query) = &self.query {
            for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
                params.append(key.into_owned(), value.into_owned());
            }
        }
        params
    }

    /// `host` or `host:port` when the port is not the default one.
    pub fn host_and_port(&self) -> Option<String> {
        let host = self.host.as_deref()?;
        Some(if self.has_default_port() {
            host.to_owned()
        } else {
            format!("{host}:{}", self.port())
        })
    }

    /// `scheme://host:port` with the port always spelled out; identifies the
    /// connection a request would use.
    pub fn authority_key(&self) -> Option<String> {
        let host = self.host.as_deref()?;
        Some(format!("{}://{}:{}", self.scheme, host, self.port()))
    }

    /// Path plus query string, as sent in a request line.
    pub fn relative_uri(&self) -> String {
        match &self.query {
            Some(q) => format!("{}?{}", self.path, q),
            None => self.path.clone(),
        }
    }

    /// `true` if the URI carries a host.
    pub fn is_absolute(&self) -> bool {
        self.host.is_some()
    }
}

fn split_host_port(hostport: &str) -> Result<(&str, Option<u16>), UriError> {
    let (host, port) = if let Some(rest) = hostport.strip_prefix('[') {
        let end = rest
            .find(']')
            .ok_or_else(|| UriError::InvalidHost(hostport.to_owned()))?;
        let after = &rest[end + 1..];
        let port = match after {
            "" => None,
            _ => Some(
                after
                    .strip_prefix(':')
                    .ok_or_else(|| UriError::InvalidHost(hostport.to_owned()))?,
            ),
        };
        (&hostport[..end + 2], port)
    } else {
        match hostport.rsplit_once(':') {
            Some((h, p)) => (h, Some(p)),
            None => (hostport, None),
        }
    };
    let port = match port {
        None | Some("") => None,
        Some(p) => Some(
            p.parse::<u16>()
                .map_err(|_| UriError::InvalidPort(p.to_owned()))?,
        ),
    };
    Ok((host, port))
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(host) = &self.host {
            write!(f, "{}://", self.scheme)?;
            if let Some(user) = &self.username {
                f.write_str(user)?;
                if let Some(pass) = &self.password {
                    write!(f, ":{pass}")?;
                }
                f.write_str("@")?;
            }
            f.write_str(host)?;
            if !self.has_default_port() {
                write!(f, ":{}", self.port())?;
            }
        }
        f.write_str(&self.path)?;
        if let Some(q) = &self.query {
            write!(f, "?{q}")?;
        }
        if let Some(frag) = &self.fragment {
            write!(f, "#{frag}")?;
        }
        Ok(())
    }
}

impl FromStr for Uri {
    type Err = UriError;

    fn from_str(s: &str) -> Result<Self, UriError> {
        Uri::parse(s)
    }
}

impl TryFrom<&str> for Uri {
    type Error = UriError;

    fn try_from(s: &str) -> Result<Self, UriError> {
        Uri::parse(s)
    }
}

impl TryFrom<String> for Uri {
    type Error = UriError;

    fn try_from(s: String) -> Result<Self, UriError> {
        Uri::parse(&s)
    }
}

impl PartialEq for Uri {
    fn eq(&self, other: &Self) -> bool {
        self.to_string() == other.to_string()
    }
}

impl Eq for Uri {}

impl Hash for Uri {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.to_string().hash(state);
    }
}

impl PartialEq<str> for Uri {
    fn eq(&self, other: &str) -> bool {
        Uri::parse(other).is_ok_and(|o| *self == o)
    }
}

impl PartialEq<&str> for Uri {
    fn eq(&self, other: &&str) -> bool {
        *self == **other
    }
}
