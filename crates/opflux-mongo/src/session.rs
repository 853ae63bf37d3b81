//! Dialing the source database.

use std::path::PathBuf;
use std::time::Duration;

use mongodb::options::{ClientOptions, ReadPreference, SelectionCriteria, Tls, TlsOptions};
use mongodb::Client;
use tracing::debug;

/// Connection establishment timeout when none is configured.
const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything needed to open the shared session.
#[derive(Debug, Clone)]
pub struct DialSettings {
    /// Connection URL; a bare host is normalized to a `mongodb://` URI.
    pub url: String,
    /// PEM file with the TLS trust root.
    pub pem_file: Option<PathBuf>,
    /// Skip TLS certificate validation.
    pub skip_verify: bool,
    /// Force TLS even without a PEM file (set by the `ssl=true` URL quirk).
    pub ssl: bool,
    /// Connection establishment timeout.
    pub dial_timeout: Option<Duration>,
    /// Socket I/O timeout.
    pub socket_timeout: Option<Duration>,
    /// Server selection timeout.
    pub sync_timeout: Option<Duration>,
}

impl Default for DialSettings {
    fn default() -> Self {
        Self {
            url: "localhost".into(),
            pem_file: None,
            skip_verify: false,
            ssl: false,
            dial_timeout: None,
            socket_timeout: None,
            sync_timeout: None,
        }
    }
}

/// Removes an `ssl=true` query parameter from a connection URL.
///
/// Returns the cleaned URL and whether the parameter was present; the
/// driver takes TLS as an option rather than a query parameter.
#[must_use]
pub fn strip_ssl_param(url: &str) -> (String, bool) {
    let Some((host, query)) = url.split_once('?') else {
        return (url.to_string(), false);
    };
    let params: Vec<&str> = query.split('&').filter(|p| !p.is_empty()).collect();
    if !params.iter().any(|p| *p == "ssl=true") {
        return (url.to_string(), false);
    }
    let rest: Vec<&str> = params.into_iter().filter(|p| *p != "ssl=true").collect();
    if rest.is_empty() {
        (host.to_string(), true)
    } else {
        (format!("{host}?{}", rest.join("&")), true)
    }
}

/// Prefixes bare `host[:port]` URLs with the `mongodb://` scheme.
#[must_use]
pub fn normalize_url(url: &str) -> String {
    if url.contains("://") {
        url.to_string()
    } else {
        format!("mongodb://{url}")
    }
}

/// Opens the shared session: reads forced to the primary, timeouts applied,
/// TLS enabled when the dial flag or a PEM file asks for it.
///
/// # Errors
///
/// Any driver error from URL parsing or client construction.
pub async fn dial(settings: &DialSettings) -> Result<Client, mongodb::error::Error> {
    let uri = normalize_url(&settings.url);
    let mut options = ClientOptions::parse(&uri).await?;

    options.app_name = Some(format!("opflux v{}", env!("CARGO_PKG_VERSION")));
    options.selection_criteria = Some(SelectionCriteria::ReadPreference(ReadPreference::Primary));
    options.connect_timeout = Some(settings.dial_timeout.unwrap_or(DEFAULT_DIAL_TIMEOUT));
    // The driver exposes no per-operation socket deadline; the socket
    // timeout folds into connection establishment instead.
    if let Some(socket) = settings.socket_timeout {
        options.connect_timeout = Some(socket);
    }
    if let Some(sync) = settings.sync_timeout {
        options.server_selection_timeout = Some(sync);
    }

    if settings.ssl || settings.pem_file.is_some() {
        let mut tls = TlsOptions::default();
        tls.ca_file_path = settings.pem_file.clone();
        if settings.skip_verify {
            tls.allow_invalid_certificates = Some(true);
        }
        options.tls = Some(Tls::Enabled(tls));
        debug!(pem = ?settings.pem_file, "TLS enabled for source session");
    }

    Client::with_options(options)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_ssl_param_only_parameter() {
        assert_eq!(
            strip_ssl_param("mongodb://host:27017?ssl=true"),
            ("mongodb://host:27017".to_string(), true)
        );
    }

    #[test]
    fn strip_ssl_param_among_others() {
        assert_eq!(
            strip_ssl_param("mongodb://host?ssl=true&replicaSet=rs0"),
            ("mongodb://host?replicaSet=rs0".to_string(), true)
        );
        assert_eq!(
            strip_ssl_param("mongodb://host?replicaSet=rs0&ssl=true"),
            ("mongodb://host?replicaSet=rs0".to_string(), true)
        );
        assert_eq!(
            strip_ssl_param("mongodb://host?a=1&ssl=true&b=2"),
            ("mongodb://host?a=1&b=2".to_string(), true)
        );
    }

    #[test]
    fn strip_ssl_param_absent() {
        assert_eq!(
            strip_ssl_param("mongodb://host?replicaSet=rs0"),
            ("mongodb://host?replicaSet=rs0".to_string(), false)
        );
        assert_eq!(
            strip_ssl_param("mongodb://host"),
            ("mongodb://host".to_string(), false)
        );
        // ssl=false is not the magic value and survives untouched.
        assert_eq!(
            strip_ssl_param("mongodb://host?ssl=false"),
            ("mongodb://host?ssl=false".to_string(), false)
        );
    }

    #[test]
    fn normalize_adds_scheme_to_bare_hosts() {
        assert_eq!(normalize_url("localhost"), "mongodb://localhost");
        assert_eq!(normalize_url("host:27017"), "mongodb://host:27017");
        assert_eq!(
            normalize_url("mongodb://already/fine"),
            "mongodb://already/fine"
        );
    }
}
