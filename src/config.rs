//! Tunnel configuration.
//!
//! [`TunnelOptions`] is the raw option surface handed over by the host (or
//! read from `config.toml` by the CLI). It is turned into an immutable,
//! validated [`TunnelConfig`] by [`TunnelConfigBuilder::build`].

use std::borrow::Cow;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use base64::Engine;
use directories::ProjectDirs;
use http::HeaderValue;
use rustls::pki_types::ServerName;
use serde::Deserialize;

use crate::error::{Result, TunnelError};
use crate::transport::check_ech_public_name;

pub const DEFAULT_WS_PATH: &str = "/tunnel";
pub const DEFAULT_ECH_DOMAIN: &str = "cloudflare-ech.com";
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Encrypted Client Hello policy.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum EchPolicy {
    #[default]
    Off,
    /// Domain-fronted: the outer (public) SNI is `outer_name`, the real server
    /// name travels in the encrypted inner hello.
    Enabled {
        outer_name: String,
        /// Raw ECHConfigList, as published in the outer name's HTTPS record.
        config_list: Option<Vec<u8>>,
    },
}

impl EchPolicy {
    pub fn outer_name(&self) -> Option<&str> {
        match self {
            EchPolicy::Off => None,
            EchPolicy::Enabled { outer_name, .. } => Some(outer_name),
        }
    }
}

/// How the server certificate is trusted.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CertVerification {
    /// Chain validated against the bundled WebPKI roots.
    #[default]
    WebPki,
    /// No verification at all.
    SkipVerify,
    /// SHA-256 of the leaf certificate must match.
    Fingerprint([u8; 32]),
}

/// Shape of the TLS ClientHello.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientFingerprint {
    #[default]
    None,
    Chrome,
    Firefox,
    Safari,
    Random,
}

impl std::str::FromStr for ClientFingerprint {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "" | "none" => Ok(Self::None),
            "chrome" | "edge" => Ok(Self::Chrome),
            "firefox" => Ok(Self::Firefox),
            "safari" | "ios" => Ok(Self::Safari),
            "random" => Ok(Self::Random),
            other => Err(TunnelError::InvalidConfig(format!(
                "unknown client fingerprint: {}",
                other
            ))),
        }
    }
}

/// Validated, immutable tunnel configuration.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    server: String,
    port: u16,
    path: String,
    token: Option<String>,
    ech: EchPolicy,
    ip: Option<String>,
    dns: Option<String>,
    udp: bool,
    verification: CertVerification,
    client_fingerprint: ClientFingerprint,
    handshake_timeout: Duration,
}

impl TunnelConfig {
    pub fn builder(server: impl Into<String>, port: u16) -> TunnelConfigBuilder {
        TunnelConfigBuilder::new(server, port)
    }

    /// Real server name: inner TLS SNI and HTTP `Host`.
    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `server:port`, bracketing IPv6 literals.
    pub fn server_addr(&self) -> String {
        join_host_port(&self.server, self.port)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn ech(&self) -> &EchPolicy {
        &self.ech
    }

    /// Address the TCP connection goes to instead of `server`.
    pub fn ip(&self) -> Option<&str> {
        self.ip.as_deref()
    }

    pub fn dns(&self) -> Option<&str> {
        self.dns.as_deref()
    }

    pub fn udp(&self) -> bool {
        self.udp
    }

    pub fn verification(&self) -> &CertVerification {
        &self.verification
    }

    pub fn client_fingerprint(&self) -> ClientFingerprint {
        self.client_fingerprint
    }

    /// Ceiling applied to each handshake phase of a dial.
    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }
}

/// `host` as it appears in a URL authority or `Host` header: IPv6 literals
/// are bracketed.
pub(crate) fn host_literal(host: &str) -> Cow<'_, str> {
    if host.contains(':') && !host.starts_with('[') {
        Cow::Owned(format!("[{}]", host))
    } else {
        Cow::Borrowed(host)
    }
}

pub(crate) fn join_host_port(host: &str, port: u16) -> String {
    format!("{}:{}", host_literal(host), port)
}

#[derive(Debug, Clone)]
pub struct TunnelConfigBuilder {
    server: String,
    port: u16,
    path: Option<String>,
    token: Option<String>,
    ech: Option<bool>,
    ech_domain: Option<String>,
    ech_config: Option<Vec<u8>>,
    ip: Option<String>,
    dns: Option<String>,
    udp: bool,
    skip_cert_verify: bool,
    fingerprint: Option<String>,
    client_fingerprint: ClientFingerprint,
    handshake_timeout: Duration,
}

impl TunnelConfigBuilder {
    pub fn new(server: impl Into<String>, port: u16) -> Self {
        Self {
            server: server.into(),
            port,
            path: None,
            token: None,
            ech: None,
            ech_domain: None,
            ech_config: None,
            ip: None,
            dns: None,
            udp: false,
            skip_cert_verify: false,
            fingerprint: None,
            client_fingerprint: ClientFingerprint::None,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Force ECH on or off. Left unset, ECH turns on when an ECH domain or
    /// config list is given.
    pub fn ech(mut self, enabled: bool) -> Self {
        self.ech = Some(enabled);
        self
    }

    pub fn ech_domain(mut self, domain: impl Into<String>) -> Self {
        self.ech_domain = Some(domain.into());
        self
    }

    pub fn ech_config_list(mut self, list: Vec<u8>) -> Self {
        self.ech_config = Some(list);
        self
    }

    pub fn ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    pub fn dns(mut self, dns: impl Into<String>) -> Self {
        self.dns = Some(dns.into());
        self
    }

    pub fn udp(mut self, udp: bool) -> Self {
        self.udp = udp;
        self
    }

    pub fn skip_cert_verify(mut self, skip: bool) -> Self {
        self.skip_cert_verify = skip;
        self
    }

    /// Pin the server leaf certificate by its SHA-256, in hex (colons allowed).
    pub fn fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }

    pub fn client_fingerprint(mut self, fingerprint: ClientFingerprint) -> Self {
        self.client_fingerprint = fingerprint;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<TunnelConfig> {
        let server = self.server.trim().to_string();
        if server.is_empty() {
            return Err(invalid("server is required"));
        }
        if server.contains("://") || server.contains('/') {
            return Err(invalid(format!("server must be a bare host name: {}", server)));
        }
        ServerName::try_from(server.clone())
            .map_err(|e| invalid(format!("server {} is not a valid TLS name: {}", server, e)))?;

        if self.port == 0 {
            return Err(invalid("port must be non-zero"));
        }

        let path = normalize_path(self.path.as_deref())?;

        let token = self.token.filter(|t| !t.is_empty());
        if let Some(token) = &token {
            HeaderValue::from_str(token)
                .map_err(|_| invalid("token contains characters not allowed in a header"))?;
        }

        let ech_domain = self.ech_domain.filter(|d| !d.trim().is_empty());
        let wants_ech = self
            .ech
            .unwrap_or(ech_domain.is_some() || self.ech_config.is_some());
        let ech = if wants_ech {
            let outer_name = ech_domain
                .map(|d| d.trim().to_string())
                .unwrap_or_else(|| DEFAULT_ECH_DOMAIN.to_string());
            ServerName::try_from(outer_name.clone())
                .map_err(|e| invalid(format!("invalid ECH domain {}: {}", outer_name, e)))?;
            let config_list = self.ech_config.filter(|c| !c.is_empty());
            if let Some(list) = &config_list {
                check_ech_public_name(list, &outer_name).map_err(invalid)?;
            }
            EchPolicy::Enabled {
                outer_name,
                config_list,
            }
        } else {
            EchPolicy::Off
        };

        let verification = match (self.skip_cert_verify, self.fingerprint) {
            (true, Some(_)) => {
                return Err(invalid(
                    "skip-cert-verify and fingerprint are mutually exclusive",
                ))
            }
            (true, None) => CertVerification::SkipVerify,
            (false, Some(fp)) => CertVerification::Fingerprint(parse_fingerprint(&fp)?),
            (false, None) => CertVerification::WebPki,
        };

        if self.handshake_timeout.is_zero() {
            return Err(invalid("handshake timeout must be non-zero"));
        }

        Ok(TunnelConfig {
            server,
            port: self.port,
            path,
            token,
            ech,
            ip: self.ip.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()),
            dns: self.dns.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()),
            udp: self.udp,
            verification,
            client_fingerprint: self.client_fingerprint,
            handshake_timeout: self.handshake_timeout,
        })
    }
}

fn invalid(msg: impl Into<String>) -> TunnelError {
    TunnelError::InvalidConfig(msg.into())
}

fn normalize_path(path: Option<&str>) -> Result<String> {
    let path = path.map(str::trim).unwrap_or("");
    if path.is_empty() {
        return Ok(DEFAULT_WS_PATH.to_string());
    }
    // The transport is already TLS; a URL here would ask for a second layer.
    if path.contains("://") {
        return Err(invalid(format!("ws-path must be a path, not a URL: {}", path)));
    }
    if path.starts_with('/') {
        Ok(path.to_string())
    } else {
        Ok(format!("/{}", path))
    }
}

fn parse_fingerprint(fp: &str) -> Result<[u8; 32]> {
    let hex: Vec<u8> = fp
        .bytes()
        .filter(|b| *b != b':' && !b.is_ascii_whitespace())
        .collect();
    if hex.len() != 64 {
        return Err(invalid("fingerprint must be a SHA-256 digest (64 hex digits)"));
    }
    if !hex.iter().all(u8::is_ascii_hexdigit) {
        return Err(invalid(format!("fingerprint is not hex: {}", fp)));
    }

    let mut out = [0u8; 32];
    for (byte, pair) in out.iter_mut().zip(hex.chunks(2)) {
        *byte = (hex_value(pair[0]) << 4) | hex_value(pair[1]);
    }
    Ok(out)
}

fn hex_value(digit: u8) -> u8 {
    match digit {
        b'0'..=b'9' => digit - b'0',
        b'a'..=b'f' => digit - b'a' + 10,
        _ => digit - b'A' + 10,
    }
}

/// Option surface as supplied by the host adapter or the CLI config file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TunnelOptions {
    pub server: Option<String>,
    pub port: Option<u16>,
    pub ws_path: Option<String>,
    pub token: Option<String>,
    pub ech: Option<bool>,
    pub ech_domain: Option<String>,
    /// Base64 ECHConfigList.
    pub ech_config: Option<String>,
    pub dns: Option<String>,
    pub ip: Option<String>,
    #[serde(default)]
    pub udp: bool,
    #[serde(default)]
    pub skip_cert_verify: bool,
    pub fingerprint: Option<String>,
    pub client_fingerprint: Option<String>,
    /// Seconds.
    pub handshake_timeout: Option<u64>,
}

impl TunnelOptions {
    pub fn validate(self) -> Result<TunnelConfig> {
        let server = self.server.ok_or_else(|| invalid("server is required"))?;
        let mut builder = TunnelConfig::builder(server, self.port.unwrap_or(443))
            .udp(self.udp)
            .skip_cert_verify(self.skip_cert_verify);

        if let Some(path) = self.ws_path {
            builder = builder.path(path);
        }
        if let Some(token) = self.token {
            builder = builder.token(token);
        }
        if let Some(ech) = self.ech {
            builder = builder.ech(ech);
        }
        if let Some(domain) = self.ech_domain {
            builder = builder.ech_domain(domain);
        }
        if let Some(encoded) = self.ech_config {
            let list = base64::engine::general_purpose::STANDARD
                .decode(encoded.trim())
                .map_err(|e| invalid(format!("ech-config is not valid base64: {}", e)))?;
            builder = builder.ech_config_list(list);
        }
        if let Some(ip) = self.ip {
            builder = builder.ip(ip);
        }
        if let Some(dns) = self.dns {
            builder = builder.dns(dns);
        }
        if let Some(fp) = self.fingerprint.filter(|f| !f.is_empty()) {
            builder = builder.fingerprint(fp);
        }
        if let Some(cf) = self.client_fingerprint {
            builder = builder.client_fingerprint(cf.parse()?);
        }
        if let Some(secs) = self.handshake_timeout {
            builder = builder.handshake_timeout(Duration::from_secs(secs));
        }

        builder.build()
    }
}

impl TryFrom<TunnelOptions> for TunnelConfig {
    type Error = TunnelError;

    fn try_from(options: TunnelOptions) -> Result<Self> {
        options.validate()
    }
}

/// CLI configuration file, `config.toml` in the platform config directory.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub tunnel: TunnelOptions,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Default, Deserialize)]
pub struct LogConfig {
    pub level: Option<String>,
}

impl Config {
    /// Load from `path`, or from the default location when `path` is `None`.
    /// A missing default file yields the default config.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let path = Self::config_path()?;
                if !path.exists() {
                    return Ok(Self::default());
                }
                path
            }
        };

        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn config_path() -> anyhow::Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("", "", "echtunnel")
            .context("Could not determine config directory")?;

        Ok(proj_dirs.config_dir().join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::sample_ech_config_list;
    use std::io::Write;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_defaults() {
        let config = TunnelConfig::builder("edge.example", 443).build().unwrap();
        assert_eq!(config.path(), "/tunnel");
        assert_eq!(config.ech(), &EchPolicy::Off);
        assert_eq!(config.verification(), &CertVerification::WebPki);
        assert_eq!(config.handshake_timeout(), Duration::from_secs(30));
        assert!(config.token().is_none());
        assert!(!config.udp());
        assert_eq!(config.server_addr(), "edge.example:443");
    }

    #[test]
    fn test_path_normalization() {
        let config = TunnelConfig::builder("edge.example", 443)
            .path("ws")
            .build()
            .unwrap();
        assert_eq!(config.path(), "/ws");

        let config = TunnelConfig::builder("edge.example", 443)
            .path("  ")
            .build()
            .unwrap();
        assert_eq!(config.path(), "/tunnel");

        assert_err!(TunnelConfig::builder("edge.example", 443)
            .path("wss://edge.example/tunnel")
            .build());
    }

    #[test]
    fn test_ech_outer_name_defaults() {
        let config = TunnelConfig::builder("edge.example", 443)
            .ech(true)
            .build()
            .unwrap();
        assert_eq!(config.ech().outer_name(), Some(DEFAULT_ECH_DOMAIN));

        let config = TunnelConfig::builder("edge.example", 443)
            .ech_domain("public.example")
            .build()
            .unwrap();
        assert_eq!(config.ech().outer_name(), Some("public.example"));

        let config = TunnelConfig::builder("edge.example", 443)
            .ech(false)
            .ech_domain("public.example")
            .build()
            .unwrap();
        assert_eq!(config.ech().outer_name(), None);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert_err!(TunnelConfig::builder("", 443).build());
        assert_err!(TunnelConfig::builder("https://edge.example", 443).build());
        assert_err!(TunnelConfig::builder("edge.example", 0).build());
        assert_err!(TunnelConfig::builder("edge.example", 443)
            .token("bad\ntoken")
            .build());
        assert_err!(TunnelConfig::builder("edge.example", 443)
            .skip_cert_verify(true)
            .fingerprint("00".repeat(32))
            .build());
        assert_err!(TunnelConfig::builder("edge.example", 443)
            .fingerprint("abcd")
            .build());
        assert_err!(TunnelConfig::builder("edge.example", 443)
            .handshake_timeout(Duration::ZERO)
            .build());
    }

    #[test]
    fn test_empty_token_is_no_token() {
        let config = TunnelConfig::builder("edge.example", 443)
            .token("")
            .build()
            .unwrap();
        assert!(config.token().is_none());
    }

    #[test]
    fn test_fingerprint_with_colons() {
        let hex = vec!["ab"; 32].join(":");
        let config = TunnelConfig::builder("edge.example", 443)
            .fingerprint(hex)
            .build()
            .unwrap();
        assert_eq!(config.verification(), &CertVerification::Fingerprint([0xab; 32]));
    }

    #[test]
    fn test_non_ascii_fingerprint_is_rejected() {
        let err = TunnelConfig::builder("edge.example", 443)
            .fingerprint(format!("a{}", "€".repeat(21)))
            .build()
            .unwrap_err();
        assert!(matches!(err, TunnelError::InvalidConfig(_)));

        let options = TunnelOptions {
            server: Some("edge.example".to_string()),
            fingerprint: Some(format!("+{}", "a".repeat(63))),
            ..TunnelOptions::default()
        };
        assert_err!(options.validate());
    }

    #[test]
    fn test_mixed_case_fingerprint() {
        let hex = "AbCd".repeat(16);
        let config = TunnelConfig::builder("edge.example", 443)
            .fingerprint(hex)
            .build()
            .unwrap();
        let expected: [u8; 32] = std::array::from_fn(|i| if i % 2 == 0 { 0xab } else { 0xcd });
        assert_eq!(config.verification(), &CertVerification::Fingerprint(expected));
    }

    #[test]
    fn test_host_literal_brackets_ipv6_once() {
        assert_eq!(host_literal("edge.example"), "edge.example");
        assert_eq!(host_literal("::1"), "[::1]");
        assert_eq!(host_literal("[::1]"), "[::1]");
    }

    #[test]
    fn test_ipv6_server_addr() {
        let config = TunnelConfig::builder("::1", 8443).build().unwrap();
        assert_eq!(config.server_addr(), "[::1]:8443");
    }

    #[test]
    fn test_options_from_toml() {
        let list = sample_ech_config_list("public.example");
        let encoded = base64::engine::general_purpose::STANDARD.encode(&list);
        let options: TunnelOptions = toml::from_str(&format!(
            r#"
            server = "edge.example"
            port = 8443
            ws-path = "/ws"
            token = "abc"
            ech-domain = "public.example"
            ech-config = "{}"
            ip = "203.0.113.7"
            udp = true
            client-fingerprint = "firefox"
            handshake-timeout = 10
            "#,
            encoded
        ))
        .unwrap();

        let config = assert_ok!(TunnelConfig::try_from(options));
        assert_eq!(config.port(), 8443);
        assert_eq!(config.path(), "/ws");
        assert_eq!(config.token(), Some("abc"));
        assert_eq!(config.ip(), Some("203.0.113.7"));
        assert!(config.udp());
        assert_eq!(config.client_fingerprint(), ClientFingerprint::Firefox);
        assert_eq!(config.handshake_timeout(), Duration::from_secs(10));
        assert_eq!(
            config.ech(),
            &EchPolicy::Enabled {
                outer_name: "public.example".to_string(),
                config_list: Some(list),
            }
        );
    }

    #[test]
    fn test_ech_config_list_must_carry_outer_name() {
        // default outer name
        let config = TunnelConfig::builder("edge.example", 443)
            .ech_config_list(sample_ech_config_list(DEFAULT_ECH_DOMAIN))
            .build()
            .unwrap();
        assert_eq!(config.ech().outer_name(), Some(DEFAULT_ECH_DOMAIN));

        let err = TunnelConfig::builder("edge.example", 443)
            .ech_config_list(sample_ech_config_list("public.example"))
            .build()
            .unwrap_err();
        assert!(matches!(err, TunnelError::InvalidConfig(ref m) if m.contains("public.example")));

        assert_err!(TunnelConfig::builder("edge.example", 443)
            .ech_domain("public.example")
            .ech_config_list(vec![0, 1, 2])
            .build());
    }

    #[test]
    fn test_options_require_server() {
        assert_err!(TunnelOptions::default().validate());
    }

    #[test]
    fn test_load_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[tunnel]\nserver = \"edge.example\"\ntoken = \"abc\"\n\n[log]\nlevel = \"debug\""
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.tunnel.server.as_deref(), Some("edge.example"));
        assert_eq!(config.log.level.as_deref(), Some("debug"));
    }

    #[test]
    fn test_load_missing_explicit_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load(Some(&dir.path().join("nope.toml"))).is_err());
    }
}
