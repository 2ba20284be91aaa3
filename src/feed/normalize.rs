use url::Url;

/// Maps item links served by different mirrors onto one canonical identity.
///
/// Mirrors publish the same item under their own host and often append a
/// fragment (`#m`). A link is canonicalized by dropping the fragment and, when
/// its host is a known mirror (or the canonical domain itself), rewriting it to
/// `https://<canonical_domain>` with no explicit port.
#[derive(Debug, Clone, Default)]
pub struct LinkNormalizer {
    canonical_domain: Option<String>,
    mirror_domains: Vec<String>,
}

impl LinkNormalizer {
    pub fn new<S: AsRef<str>>(canonical_domain: Option<&str>, mirror_domains: &[S]) -> Self {
        Self {
            canonical_domain: canonical_domain.map(bare_host),
            mirror_domains: mirror_domains
                .iter()
                .map(|m| bare_host(m.as_ref()))
                .collect(),
        }
    }

    /// Returns the canonical identity of `link`.
    pub fn canonicalize(&self, link: &Url) -> String {
        let mut url = link.clone();
        url.set_fragment(None);

        let Some(canonical) = &self.canonical_domain else {
            return url.to_string();
        };

        let is_known = url
            .host_str()
            .map(bare_host)
            .is_some_and(|host| host == *canonical || self.mirror_domains.contains(&host));

        if is_known {
            // http -> https and host/port changes cannot fail for special schemes
            // with a valid domain; keep the fragment-stripped link if they do.
            let mut rewritten = url.clone();
            if rewritten.set_scheme("https").is_ok()
                && rewritten.set_port(None).is_ok()
                && rewritten.set_host(Some(canonical.as_str())).is_ok()
            {
                return rewritten.to_string();
            }
            tracing::debug!(link = %url, "Could not rewrite mirror link, using it as-is");
        }

        url.to_string()
    }
}

/// Lowercases a host and strips a leading `www.`.
fn bare_host(host: &str) -> String {
    let host = host.trim().trim_end_matches('.').to_ascii_lowercase();
    match host.strip_prefix("www.") {
        Some(rest) => rest.to_string(),
        None => host,
    }
}
