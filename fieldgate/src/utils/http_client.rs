use std::sync::OnceLock;

use tracing::debug;

use crate::config::ProxyConfig;
use crate::{Error, Result};

pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Apply a named proxy to a `reqwest::ClientBuilder`.
///
/// `None` disables every proxy, including system and environment ones, so a
/// connector only goes through a proxy it was configured with. An
/// unparseable proxy address is a configuration error.
pub fn apply_proxy_config(
    builder: reqwest::ClientBuilder,
    proxy_config: Option<&ProxyConfig>,
) -> Result<reqwest::ClientBuilder> {
    let Some(proxy_config) = proxy_config else {
        return Ok(builder.no_proxy());
    };

    url::Url::parse(&proxy_config.url).map_err(|e| {
        Error::config(format!(
            "invalid address for proxy '{}': {}",
            proxy_config.name, e
        ))
    })?;

    let mut proxy = reqwest::Proxy::all(&proxy_config.url).map_err(|e| {
        Error::config(format!(
            "invalid address for proxy '{}': {}",
            proxy_config.name, e
        ))
    })?;
    if let (Some(username), Some(password)) = (
        proxy_config.username.as_ref(),
        proxy_config.password.as_ref(),
    ) {
        proxy = proxy.basic_auth(username, password);
    }
    Ok(builder.proxy(proxy))
}
