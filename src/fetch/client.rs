//! HTTP client construction.
//!
//! One `reqwest::Client` serves the whole crawl: it owns the per-host
//! connection pool, DNS cache, Happy-Eyeballs dialing, and TLS. Redirects
//! are disabled here because the fetch session drives them itself.

use std::fs;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use reqwest::redirect::Policy;
use reqwest::{Certificate, Client, Identity};

use super::ErrorKind;

/// TLS protocol floor selected by `--secure-protocol`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SecureProtocol {
    #[default]
    Auto,
    TlsV1_2,
    TlsV1_3,
}

impl SecureProtocol {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "auto" | "pfs" => Some(Self::Auto),
            "tlsv1_2" | "tlsv1.2" => Some(Self::TlsV1_2),
            "tlsv1_3" | "tlsv1.3" => Some(Self::TlsV1_3),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub user_agent: String,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    /// Whole-exchange ceiling (`--session-timeout`).
    pub session_timeout: Option<Duration>,
    /// Idle connections kept per host.
    pub pool_per_host: usize,
    pub pool_idle_timeout: Duration,
    pub keep_alive: bool,
    /// Transparent gzip/brotli decoding (`--http-compression`).
    pub http_compression: bool,
    pub secure_protocol: SecureProtocol,
    pub check_certificate: bool,
    pub certificate: Option<PathBuf>,
    pub private_key: Option<PathBuf>,
    pub ca_certificate: Option<PathBuf>,
    /// Directory of additional trusted CA certificates (PEM files).
    pub ca_directory: Option<PathBuf>,
    pub bind_address: Option<IpAddr>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            user_agent: format!("webarc/{}", env!("CARGO_PKG_VERSION")),
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(30),
            session_timeout: None,
            pool_per_host: 4,
            pool_idle_timeout: Duration::from_secs(60),
            keep_alive: true,
            http_compression: false,
            secure_protocol: SecureProtocol::Auto,
            check_certificate: true,
            certificate: None,
            private_key: None,
            ca_certificate: None,
            ca_directory: None,
            bind_address: None,
        }
    }
}

/// Build the shared client. Proxy settings come from the environment
/// (`http_proxy`, `https_proxy`, `no_proxy`), which reqwest honors by
/// default.
pub fn build_client(options: &ClientOptions) -> Result<Client, ErrorKind> {
    let mut builder = Client::builder()
        .user_agent(&options.user_agent)
        .redirect(Policy::none())
        .connect_timeout(options.connect_timeout)
        .read_timeout(options.read_timeout)
        .pool_idle_timeout(options.pool_idle_timeout)
        .pool_max_idle_per_host(if options.keep_alive {
            options.pool_per_host
        } else {
            0
        });

    if let Some(session_timeout) = options.session_timeout {
        builder = builder.timeout(session_timeout);
    }

    if !options.http_compression {
        // Keep wire bytes: what lands in the archive is what the server
        // sent, content encoding included.
        builder = builder.no_gzip().no_brotli();
    }

    match options.secure_protocol {
        SecureProtocol::Auto => {}
        SecureProtocol::TlsV1_2 => {
            builder = builder.min_tls_version(reqwest::tls::Version::TLS_1_2);
        }
        SecureProtocol::TlsV1_3 => {
            builder = builder.min_tls_version(reqwest::tls::Version::TLS_1_3);
        }
    }

    if !options.check_certificate {
        builder = builder.danger_accept_invalid_certs(true);
    }

    if let Some(ca_path) = &options.ca_certificate {
        let pem = fs::read(ca_path)
            .map_err(|e| ErrorKind::Io(format!("reading {}: {e}", ca_path.display())))?;
        let certificate = Certificate::from_pem(&pem)
            .map_err(|e| ErrorKind::SslVerification(e.to_string()))?;
        builder = builder.add_root_certificate(certificate);
    }

    if let Some(ca_dir) = &options.ca_directory {
        let entries = fs::read_dir(ca_dir)
            .map_err(|e| ErrorKind::Io(format!("reading {}: {e}", ca_dir.display())))?;
        for entry in entries.flatten() {
            let entry_path = entry.path();
            if !entry_path.is_file() {
                continue;
            }
            let Ok(pem) = fs::read(&entry_path) else {
                continue;
            };
            match Certificate::from_pem(&pem) {
                Ok(certificate) => builder = builder.add_root_certificate(certificate),
                Err(_) => continue,
            }
        }
    }

    if let (Some(cert_path), Some(key_path)) = (&options.certificate, &options.private_key) {
        let cert_pem = fs::read(cert_path)
            .map_err(|e| ErrorKind::Io(format!("reading {}: {e}", cert_path.display())))?;
        let key_pem = fs::read(key_path)
            .map_err(|e| ErrorKind::Io(format!("reading {}: {e}", key_path.display())))?;
        let identity = Identity::from_pkcs8_pem(&cert_pem, &key_pem)
            .map_err(|e| ErrorKind::SslVerification(e.to_string()))?;
        builder = builder.identity(identity);
    }

    if let Some(address) = options.bind_address {
        builder = builder.local_address(address);
    }

    builder
        .build()
        .map_err(|e| ErrorKind::Network(format!("building HTTP client: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_client_builds() {
        build_client(&ClientOptions::default()).unwrap();
    }

    #[test]
    fn test_no_keep_alive_builds() {
        build_client(&ClientOptions {
            keep_alive: false,
            http_compression: true,
            ..ClientOptions::default()
        })
        .unwrap();
    }

    #[test]
    fn test_secure_protocol_parse() {
        assert_eq!(SecureProtocol::parse("auto"), Some(SecureProtocol::Auto));
        assert_eq!(
            SecureProtocol::parse("TLSv1_2"),
            Some(SecureProtocol::TlsV1_2)
        );
        assert_eq!(SecureProtocol::parse("sslv3"), None);
    }
}
