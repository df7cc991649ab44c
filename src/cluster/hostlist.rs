//! Host addresses and bootstrap candidate lists

use std::fmt;

use crate::utils::{EngineError, Result};

/// A host name (or literal address) plus port
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl HostPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host`, `host:port`, `[v6addr]` or `[v6addr]:port`
    pub fn parse(spec: &str, default_port: u16) -> Result<Self> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err(EngineError::Config("empty host".to_string()));
        }

        let (host, port) = if let Some(rest) = spec.strip_prefix('[') {
            let end = rest
                .find(']')
                .ok_or_else(|| EngineError::Config(format!("unterminated IPv6 literal: {}", spec)))?;
            let host = &rest[..end];
            let port = match rest[end + 1..].strip_prefix(':') {
                Some(p) => parse_port(p, spec)?,
                None if rest[end + 1..].is_empty() => default_port,
                None => return Err(EngineError::Config(format!("invalid host: {}", spec))),
            };
            (host, port)
        } else if spec.matches(':').count() > 1 {
            // Bare IPv6 literal without brackets
            (spec, default_port)
        } else if let Some((host, port)) = spec.rsplit_once(':') {
            (host, parse_port(port, spec)?)
        } else {
            (spec, default_port)
        };

        if host.is_empty() {
            return Err(EngineError::Config(format!("invalid host: {}", spec)));
        }
        Ok(Self::new(host, port))
    }
}

fn parse_port(port: &str, spec: &str) -> Result<u16> {
    port.parse()
        .map_err(|_| EngineError::Config(format!("invalid port in {}", spec)))
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Ordered list of candidate hosts with a cursor
///
/// `next(false)` walks the list once; `next(true)` wraps back to the first
/// entry after the last.
#[derive(Debug, Clone, Default)]
pub struct Hostlist {
    hosts: Vec<HostPort>,
    ix: usize,
}

impl Hostlist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a list separated by commas, semicolons or whitespace
    pub fn parse(spec: &str, default_port: u16) -> Result<Self> {
        let mut list = Self::new();
        for part in spec
            .split(|c: char| c == ',' || c == ';' || c.is_whitespace())
            .filter(|s| !s.is_empty())
        {
            list.add(HostPort::parse(part, default_port)?);
        }
        Ok(list)
    }

    /// Append unless already present
    pub fn add(&mut self, host: HostPort) {
        if !self.exists(&host) {
            self.hosts.push(host);
        }
    }

    pub fn exists(&self, host: &HostPort) -> bool {
        self.hosts.iter().any(|h| h == host)
    }

    /// Replace the contents and reset the cursor
    pub fn assign(&mut self, other: &Hostlist) {
        self.hosts = other.hosts.clone();
        self.ix = 0;
    }

    pub fn clear(&mut self) {
        self.hosts.clear();
        self.ix = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HostPort> {
        self.hosts.iter()
    }

    /// Next candidate, or `None` once the list is exhausted and `wrap` is
    /// false
    pub fn next(&mut self, wrap: bool) -> Option<HostPort> {
        if self.hosts.is_empty() {
            return None;
        }
        if self.ix >= self.hosts.len() {
            if !wrap {
                return None;
            }
            self.ix = 0;
        }
        let host = self.hosts[self.ix].clone();
        self.ix += 1;
        Some(host)
    }

    pub fn randomize(&mut self) {
        let mut rng = fastrand::Rng::new();
        self.randomize_with(&mut rng);
    }

    pub fn randomize_with(&mut self, rng: &mut fastrand::Rng) {
        rng.shuffle(&mut self.hosts);
        self.ix = 0;
    }
}

impl FromIterator<HostPort> for Hostlist {
    fn from_iter<I: IntoIterator<Item = HostPort>>(iter: I) -> Self {
        let mut list = Hostlist::new();
        for host in iter {
            list.add(host);
        }
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_forms() {
        assert_eq!(
            HostPort::parse("10.0.0.1", 8091).unwrap(),
            HostPort::new("10.0.0.1", 8091)
        );
        assert_eq!(
            HostPort::parse("cb1.example.com:9000", 8091).unwrap(),
            HostPort::new("cb1.example.com", 9000)
        );
        assert_eq!(
            HostPort::parse("[::1]:11210", 8091).unwrap(),
            HostPort::new("::1", 11210)
        );
        assert_eq!(HostPort::parse("[::1]", 8091).unwrap().port, 8091);
        assert_eq!(HostPort::parse("fe80::1", 8091).unwrap().host, "fe80::1");
    }

    #[test]
    fn test_parse_host_invalid() {
        assert!(HostPort::parse("", 8091).is_err());
        assert!(HostPort::parse("host:notaport", 8091).is_err());
        assert!(HostPort::parse("[::1", 8091).is_err());
        assert!(HostPort::parse(":8091", 8091).is_err());
    }

    #[test]
    fn test_display_brackets_ipv6() {
        assert_eq!(HostPort::new("::1", 8091).to_string(), "[::1]:8091");
        assert_eq!(HostPort::new("node", 8091).to_string(), "node:8091");
    }

    #[test]
    fn test_list_dedups() {
        let list = Hostlist::parse("a:1, b:2;a:1 c", 8091).unwrap();
        let hosts: Vec<String> = list.iter().map(|h| h.to_string()).collect();
        assert_eq!(hosts, vec!["a:1", "b:2", "c:8091"]);
    }

    #[test]
    fn test_next_without_wrap_exhausts() {
        let mut list = Hostlist::parse("a,b", 1).unwrap();
        assert_eq!(list.next(false).unwrap().host, "a");
        assert_eq!(list.next(false).unwrap().host, "b");
        assert!(list.next(false).is_none());
        assert_eq!(list.next(true).unwrap().host, "a");
    }

    #[test]
    fn test_empty_list_never_yields() {
        let mut list = Hostlist::new();
        assert!(list.next(true).is_none());
    }

    #[test]
    fn test_randomize_keeps_members() {
        let mut list = Hostlist::parse("a,b,c,d,e", 1).unwrap();
        let mut rng = fastrand::Rng::with_seed(7);
        list.randomize_with(&mut rng);

        let mut hosts: Vec<String> = list.iter().map(|h| h.host.clone()).collect();
        hosts.sort();
        assert_eq!(hosts, vec!["a", "b", "c", "d", "e"]);
    }
}
