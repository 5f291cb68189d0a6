//! Proxy list loading
//!
//! The list file holds one proxy per line in either `IP:PORT` or
//! `IP:PORT:USERNAME:PASSWORD` form. Blank lines and `#` comments are
//! ignored; anything else that does not parse is logged and skipped.

use std::fmt;
use std::path::Path;
use url::Url;

/// A single egress proxy
#[derive(Clone, PartialEq, Eq)]
pub struct ProxyInfo {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ProxyInfo {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: None,
            password: None,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Renders the proxy as an `http://` URL, including credentials if present
    ///
    /// Credentials are percent-encoded, so characters such as `@`, `:` and
    /// `/` in a username or password survive.
    pub fn url(&self) -> String {
        let plain = format!("http://{}:{}", self.host, self.port);
        let (Some(user), Some(pass)) = (&self.username, &self.password) else {
            return plain;
        };

        match Url::parse(&plain) {
            Ok(mut url) => {
                // Only fails for URLs without a host, which `plain` always has
                let _ = url.set_username(user);
                let _ = url.set_password(Some(pass));
                url.as_str().trim_end_matches('/').to_string()
            }
            Err(e) => {
                tracing::warn!("Proxy {} does not form a valid URL: {}", self.host, e);
                plain
            }
        }
    }

    /// Parses one line of the proxy list
    ///
    /// Returns `None` for lines that are not a proxy definition.
    pub fn parse_line(line: &str) -> Option<Self> {
        let parts: Vec<&str> = line.trim().split(':').collect();
        let (host, port) = match parts.as_slice() {
            [host, port] | [host, port, _, _] => (*host, port.parse::<u16>().ok()?),
            _ => return None,
        };

        if host.is_empty() {
            return None;
        }

        let proxy = Self::new(host, port);
        match parts.as_slice() {
            [_, _, user, pass] if !user.is_empty() => Some(proxy.with_credentials(*user, *pass)),
            [_, _, _, _] => None,
            _ => Some(proxy),
        }
    }
}

// Credentials stay out of logs.
impl fmt::Debug for ProxyInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyInfo")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("authenticated", &self.username.is_some())
            .finish()
    }
}

impl fmt::Display for ProxyInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Parses a whole proxy list, skipping comments and bad lines
pub fn parse_proxy_list(content: &str) -> Vec<ProxyInfo> {
    let mut proxies = Vec::new();

    for (index, line) in content.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        match ProxyInfo::parse_line(trimmed) {
            Some(proxy) => proxies.push(proxy),
            None => tracing::error!("Invalid proxy format on line {}", index + 1),
        }
    }

    proxies
}

/// Loads the proxy list from a file
///
/// A missing or unreadable file is logged and yields an empty list; the
/// pool then reports exhaustion on every acquire instead of failing startup.
pub fn load_proxies(path: &Path) -> Vec<ProxyInfo> {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let proxies = parse_proxy_list(&content);
            tracing::info!("Loaded {} proxies from {}", proxies.len(), path.display());
            proxies
        }
        Err(e) => {
            tracing::error!("Proxy file {} could not be read: {}", path.display(), e);
            Vec::new()
        }
    }
}
