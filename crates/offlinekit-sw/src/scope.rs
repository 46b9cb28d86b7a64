//! Resolution and validation of a script URL and scope against the page.

use std::net::IpAddr;
use url::{Host, Url};

use crate::RegistrationFailure;

/// A validated registration request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationTarget {
    pub script_url: Url,
    pub scope: Url,
}

impl RegistrationTarget {
    /// Resolve `script_url` and `scope` relative to `page`.
    ///
    /// The script must be same-origin with the page, and the scope must be a
    /// same-origin path prefix of the page path.
    pub fn resolve(page: &Url, script_url: &str, scope: &str) -> Result<Self, RegistrationFailure> {
        let script_url = page
            .join(script_url)
            .map_err(|e| RegistrationFailure::InvalidUrl(format!("{script_url}: {e}")))?;
        if script_url.origin() != page.origin() {
            return Err(RegistrationFailure::CrossOrigin(format!(
                "script {} is not on {}",
                script_url,
                page.origin().ascii_serialization()
            )));
        }

        let mut scope = page
            .join(scope)
            .map_err(|e| RegistrationFailure::InvalidUrl(format!("{scope}: {e}")))?;
        scope.set_query(None);
        scope.set_fragment(None);
        if scope.origin() != page.origin() {
            return Err(RegistrationFailure::CrossOrigin(format!(
                "scope {} is not on {}",
                scope,
                page.origin().ascii_serialization()
            )));
        }

        let target = Self { script_url, scope };
        if !target.in_scope(page) {
            return Err(RegistrationFailure::ScopeViolation(format!(
                "scope {} does not contain page path {}",
                target.scope.path(),
                page.path()
            )));
        }
        Ok(target)
    }

    /// Whether `url` falls under this target's scope.
    pub fn in_scope(&self, url: &Url) -> bool {
        url.origin() == self.scope.origin() && url.path().starts_with(self.scope.path())
    }
}

/// Whether the page is served from the local machine.
pub fn is_localhost(url: &Url) -> bool {
    match url.host() {
        Some(Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
        Some(Host::Ipv4(addr)) => IpAddr::V4(addr).is_loopback(),
        Some(Host::Ipv6(addr)) => IpAddr::V6(addr).is_loopback(),
        None => false,
    }
}
