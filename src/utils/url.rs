use once_cell::sync::Lazy;
use regex::Regex;
use tracing::info;

static UNSPECIFIED_HOST: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(https?://)0\.0\.0\.0(:\d+)?").unwrap());

/// Complete a possibly partial service URL. Empty input falls back to
/// `http://{default_host}:{default_port}`; a missing scheme becomes `http`
/// and a missing port becomes `default_port`. Paths are dropped.
pub fn resolve_service_url(configured: &str, default_host: &str, default_port: u16) -> String {
    let configured = configured.trim();
    if configured.is_empty() {
        let fallback = format!("http://{}:{}", default_host, default_port);
        info!("No service URL configured, using default: {}", fallback);
        return fallback;
    }

    let (scheme, rest) = match configured.split_once("://") {
        Some((scheme, rest)) => (scheme.to_ascii_lowercase(), rest),
        None => ("http".to_string(), configured),
    };
    let authority = rest.split(['/', '?', '#']).next().unwrap_or(rest);
    let authority = authority.rsplit('@').next().unwrap_or(authority);

    let (host, port) = if let Some(end) = authority.strip_prefix('[').and_then(|a| a.find(']')) {
        // [v6]:port
        let host = &authority[..end + 2];
        let port = authority[end + 2..].strip_prefix(':').and_then(|p| p.parse::<u16>().ok());
        (host.to_string(), port)
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host.to_string(), port.parse::<u16>().ok()),
            None => (authority.to_string(), None),
        }
    };
    let host = if host.is_empty() { default_host.to_string() } else { host };

    format!("{}://{}:{}", scheme, host, port.unwrap_or(default_port))
}

/// Rewrite URLs the host published against its bind-all address so they
/// point at `host_url` instead.
pub fn normalize_host(url: &str, host_url: &str) -> String {
    if host_url.is_empty() {
        return url.to_string();
    }
    UNSPECIFIED_HOST.replace(url, host_url.trim_end_matches('/')).into_owned()
}
