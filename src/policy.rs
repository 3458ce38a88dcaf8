//! Access control: which clients may connect and which destinations they
//! may reach.
//!
//! Both rules are optional and immutable once built. Evaluating them takes
//! `&self` only, so one [`AccessPolicy`] is shared by every session.

use crate::address::TargetAddr;
use anyhow::{Context, Result};
use regex::Regex;
use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;

/// Prefix selecting raw regular expression syntax for a host pattern
const REGEX_PREFIX: &str = "regex:";

/// HostPattern restricts CONNECT destinations by name.
///
/// The default syntax is a case-insensitive glob over the whole host:
/// `*` matches any run of characters (dots included), `?` matches exactly
/// one, everything else is literal. A pattern starting with `regex:` is
/// used as an unanchored regular expression instead.
#[derive(Clone)]
pub struct HostPattern {
    pattern: String,
    regex: Regex,
}

impl HostPattern {
    pub fn parse(pattern: &str) -> Result<Self> {
        let regex = match pattern.strip_prefix(REGEX_PREFIX) {
            Some(raw) => Regex::new(raw),
            None => Regex::new(&glob_to_regex(pattern)),
        }
        .with_context(|| format!("invalid destination pattern '{pattern}'"))?;

        Ok(Self {
            pattern: pattern.to_string(),
            regex,
        })
    }

    pub fn matches(&self, host: &str) -> bool {
        self.regex.is_match(host)
    }

    pub fn as_str(&self) -> &str {
        &self.pattern
    }
}

impl fmt::Debug for HostPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HostPattern").field(&self.pattern).finish()
    }
}

/// glob_to_regex translates a glob into an anchored, case-insensitive regex
fn glob_to_regex(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len() + 8);
    out.push_str("(?i)^");
    for c in glob.chars() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            c => out.push_str(&regex::escape(c.encode_utf8(&mut [0u8; 4]))),
        }
    }
    out.push('$');
    out
}

/// AccessPolicy answers the two authorization questions of the proxy
#[derive(Debug, Clone, Default)]
pub struct AccessPolicy {
    destination: Option<HostPattern>,
    sources: Option<HashSet<IpAddr>>,
}

impl AccessPolicy {
    /// new returns a policy that allows everything
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_destination_pattern(mut self, pattern: Option<HostPattern>) -> Self {
        self.destination = pattern;
        self
    }

    /// with_allowed_sources restricts clients to the given literal
    /// addresses. An empty list leaves sources unrestricted.
    pub fn with_allowed_sources(mut self, ips: impl IntoIterator<Item = IpAddr>) -> Self {
        let ips: HashSet<IpAddr> = ips.into_iter().map(|ip| ip.to_canonical()).collect();
        self.sources = if ips.is_empty() { None } else { Some(ips) };
        self
    }

    pub fn destination_pattern(&self) -> Option<&HostPattern> {
        self.destination.as_ref()
    }

    pub fn allowed_sources(&self) -> Option<&HashSet<IpAddr>> {
        self.sources.as_ref()
    }

    /// allows_source checks the peer address of a freshly accepted
    /// connection. IPv4-mapped IPv6 peers compare as their IPv4 form.
    pub fn allows_source(&self, ip: IpAddr) -> bool {
        match &self.sources {
            Some(sources) => sources.contains(&ip.to_canonical()),
            None => true,
        }
    }

    /// allows_destination matches the host as the client named it, before
    /// any resolution
    pub fn allows_destination(&self, target: &TargetAddr) -> bool {
        match &self.destination {
            Some(pattern) => pattern.matches(&target.host()),
            None => true,
        }
    }
}
