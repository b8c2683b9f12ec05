//! The static routing table mapping public hostnames to origins and
//! dictionaries.

use std::{collections::HashMap, fs::File, path::Path};

use anyhow::{format_err, Context};
use serde::Deserialize;

use crate::Result;

/// Everything we know about one proxied site.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SiteConfig {
    /// The public hostname clients use to reach us. Filled in from the table
    /// key when loading.
    #[serde(skip)]
    pub host: String,

    /// The real origin hostname we forward requests to.
    pub origin: String,

    /// The dictionary identifier. This is both the name of the blob served by
    /// our asset store and the value clients echo back in `Dictionary-ID`.
    pub dictionary: String,

    /// An optional origin trial token to attach to document responses.
    #[serde(default)]
    pub origin_trial: Option<String>,
}

/// Our routing table, keyed by public hostname.
#[derive(Debug, Default)]
pub struct SiteTable {
    sites: HashMap<String, SiteConfig>,
}

impl SiteTable {
    /// Build a table from a list of sites.
    pub fn new(sites: impl IntoIterator<Item = SiteConfig>) -> Result<SiteTable> {
        let mut table = HashMap::new();
        for mut site in sites {
            site.host = site.host.to_ascii_lowercase();
            let host = site.host.clone();
            if host.is_empty() || site.origin.is_empty() {
                return Err(format_err!("site {:?} needs a host and an origin", host));
            }
            if site.dictionary.is_empty() || site.dictionary.contains('/') {
                return Err(format_err!(
                    "invalid dictionary id {:?} for {}",
                    site.dictionary,
                    host
                ));
            }
            if table.insert(host.clone(), site).is_some() {
                return Err(format_err!("duplicate site {:?}", host));
            }
        }
        Ok(SiteTable { sites: table })
    }

    /// Load a JSON routing table from `path`.
    pub fn from_path(path: &Path) -> Result<Self> {
        let f = File::open(path)
            .with_context(|| format_err!("cannot open {}", path.display()))?;
        let raw: HashMap<String, SiteConfig> = serde_json::from_reader(f)
            .with_context(|| format_err!("error parsing {}", path.display()))?;
        Self::new(raw.into_iter().map(|(host, mut site)| {
            site.host = host;
            site
        }))
    }

    /// Look up a site by the value of an incoming `Host` header. Any port is
    /// ignored, and the comparison is case-insensitive.
    pub fn resolve(&self, host_header: &str) -> Option<&SiteConfig> {
        let host = strip_port(host_header.trim());
        if host.bytes().any(|b| b.is_ascii_uppercase()) {
            self.sites.get(&host.to_ascii_lowercase())
        } else {
            self.sites.get(host)
        }
    }

    /// All our sites, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &SiteConfig> {
        self.sites.values()
    }

    /// How many sites do we have?
    pub fn len(&self) -> usize {
        self.sites.len()
    }

    /// Do we have any sites at all?
    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }
}

/// Remove a trailing `:port` from a host, leaving IPv6 literals alone.
fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}
