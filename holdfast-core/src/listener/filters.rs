//! Well-known listener filters.
//!
//! Filters are referenced by logical name so auto-injection stays idempotent
//! against explicit user configuration, including configs still using the
//! deprecated dotted names.

use crate::ConfigError;

pub mod name {
    pub const ORIGINAL_DST: &str = "original_dst";
    pub const PROXY_PROTOCOL: &str = "proxy_protocol";
    pub const TLS_INSPECTOR: &str = "tls_inspector";

    // Deprecated spellings still accepted from old configs.
    pub const DEPRECATED_ORIGINAL_DST: &str = "holdfast.listener.original_dst";
    pub const DEPRECATED_PROXY_PROTOCOL: &str = "holdfast.listener.proxy_protocol";
    pub const DEPRECATED_TLS_INSPECTOR: &str = "holdfast.listener.tls_inspector";
}

pub fn is_tls_inspector(filter_name: &str) -> bool {
    filter_name == name::TLS_INSPECTOR || filter_name == name::DEPRECATED_TLS_INSPECTOR
}

/// Resolved factory for a listener filter, keyed by canonical name. The
/// per-connection filter instantiation lives with the accept path; the
/// lifecycle core only needs identity and ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerFilterFactory {
    canonical: &'static str,
}

impl ListenerFilterFactory {
    pub fn name(&self) -> &'static str {
        self.canonical
    }
}

/// Resolve a configured filter name, accepting deprecated aliases. Unknown
/// names reject the listener they appear in.
pub fn resolve(filter_name: &str) -> Result<ListenerFilterFactory, ConfigError> {
    let canonical = match filter_name {
        name::ORIGINAL_DST | name::DEPRECATED_ORIGINAL_DST => name::ORIGINAL_DST,
        name::PROXY_PROTOCOL | name::DEPRECATED_PROXY_PROTOCOL => name::PROXY_PROTOCOL,
        name::TLS_INSPECTOR | name::DEPRECATED_TLS_INSPECTOR => name::TLS_INSPECTOR,
        unknown => return Err(ConfigError::UnknownListenerFilter(unknown.to_string())),
    };
    Ok(ListenerFilterFactory { canonical })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_deprecated_aliases() {
        assert_eq!(
            resolve(name::DEPRECATED_TLS_INSPECTOR).unwrap().name(),
            name::TLS_INSPECTOR
        );
        assert_eq!(
            resolve(name::PROXY_PROTOCOL).unwrap().name(),
            name::PROXY_PROTOCOL
        );
    }

    #[test]
    fn unknown_filter_is_a_config_error() {
        assert!(matches!(
            resolve("sniffer"),
            Err(ConfigError::UnknownListenerFilter(_))
        ));
    }
}
