//! Compressed hostname lists.
//!
//! `"node[0-3,7]"` expands to `node0 node1 node2 node3 node7`. Multiple
//! comma-separated entries may mix bracketed and plain names:
//! `"login,node[0-1]"`.

use crate::error::{Error, Result};
use crate::idset::IdSet;

/// An ordered list of hostnames with a compressed string codec.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Hostlist {
    hosts: Vec<String>,
}

impl Hostlist {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a compressed hostlist.
    ///
    /// # Examples
    ///
    /// ```
    /// use canopy_core::hostlist::Hostlist;
    ///
    /// let hl = Hostlist::parse("node[0-2]").unwrap();
    /// assert_eq!(hl.count(), 3);
    /// assert_eq!(hl.nth(1), Some("node1"));
    /// ```
    pub fn parse(s: &str) -> Result<Self> {
        let mut hosts = Vec::new();
        for entry in split_entries(s.trim())? {
            let entry = entry.trim();
            if entry.is_empty() {
                return Err(Error::invalid("empty hostlist entry"));
            }
            match entry.find('[') {
                None => {
                    if entry.contains(']') {
                        return Err(Error::invalid(format!("unbalanced bracket in {entry:?}")));
                    }
                    hosts.push(entry.to_string());
                }
                Some(open) => {
                    let Some(close) = entry.rfind(']') else {
                        return Err(Error::invalid(format!("unbalanced bracket in {entry:?}")));
                    };
                    if close != entry.len() - 1 || close < open {
                        return Err(Error::invalid(format!("malformed entry {entry:?}")));
                    }
                    let prefix = &entry[..open];
                    let ranges = &entry[open + 1..close];
                    let ids = IdSet::parse(ranges)?;
                    if ids.is_empty() {
                        return Err(Error::invalid(format!("empty range in {entry:?}")));
                    }
                    for id in ids.iter() {
                        hosts.push(format!("{prefix}{id}"));
                    }
                }
            }
        }
        Ok(Self { hosts })
    }

    pub fn push(&mut self, host: impl Into<String>) {
        self.hosts.push(host.into());
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.hosts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    #[must_use]
    pub fn nth(&self, index: usize) -> Option<&str> {
        self.hosts.get(index).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.hosts.iter().map(String::as_str)
    }

    /// Index of the first occurrence of `host`.
    #[must_use]
    pub fn find(&self, host: &str) -> Option<usize> {
        self.hosts.iter().position(|h| h == host)
    }

    /// Encode back to the compressed form, merging runs of a common prefix
    /// with numeric suffixes.
    #[must_use]
    pub fn encode(&self) -> String {
        let mut out: Vec<String> = Vec::new();
        let mut i = 0;
        while i < self.hosts.len() {
            let (prefix, first_id) = split_suffix(&self.hosts[i]);
            match first_id {
                None => {
                    out.push(self.hosts[i].clone());
                    i += 1;
                }
                Some(first) => {
                    let mut ids = IdSet::new();
                    ids.insert(first);
                    let mut j = i + 1;
                    while j < self.hosts.len() {
                        let (p, id) = split_suffix(&self.hosts[j]);
                        match id {
                            Some(id) if p == prefix => {
                                ids.insert(id);
                                j += 1;
                            }
                            _ => break,
                        }
                    }
                    if ids.count() == 1 {
                        out.push(self.hosts[i].clone());
                    } else {
                        out.push(format!("{prefix}[{}]", ids.encode_ranges()));
                    }
                    i = j;
                }
            }
        }
        out.join(",")
    }
}

/// Split on commas that are outside brackets.
fn split_entries(s: &str) -> Result<Vec<&str>> {
    let mut entries = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| Error::invalid(format!("unbalanced bracket in {s:?}")))?;
            }
            ',' if depth == 0 => {
                entries.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(Error::invalid(format!("unbalanced bracket in {s:?}")));
    }
    entries.push(&s[start..]);
    Ok(entries)
}

/// Split a trailing decimal suffix off a hostname.
fn split_suffix(host: &str) -> (&str, Option<u32>) {
    let digits = host
        .rfind(|c: char| !c.is_ascii_digit())
        .map_or(0, |i| i + 1);
    if digits == host.len() {
        return (host, None);
    }
    match host[digits..].parse() {
        Ok(id) => (&host[..digits], Some(id)),
        Err(_) => (host, None),
    }
}

impl std::fmt::Display for Hostlist {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_bracketed_ranges() {
        let hl = Hostlist::parse("node[0-3,7]").unwrap();
        let hosts: Vec<_> = hl.iter().collect();
        assert_eq!(hosts, vec!["node0", "node1", "node2", "node3", "node7"]);
    }

    #[test]
    fn mixes_plain_and_bracketed() {
        let hl = Hostlist::parse("login,node[0-1],gpu3").unwrap();
        assert_eq!(hl.count(), 4);
        assert_eq!(hl.nth(0), Some("login"));
        assert_eq!(hl.nth(3), Some("gpu3"));
        assert_eq!(hl.find("node1"), Some(2));
        assert_eq!(hl.find("node9"), None);
    }

    #[test]
    fn rejects_malformed_lists() {
        for bad in ["node[", "node]0[", "node[0-", "node[]", "a,,b"] {
            assert!(Hostlist::parse(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn encode_compresses_runs() {
        let hl = Hostlist::parse("node[0-3,7]").unwrap();
        assert_eq!(hl.encode(), "node[0-3,7]");

        let mut hl = Hostlist::new();
        hl.push("login");
        hl.push("node1");
        assert_eq!(hl.encode(), "login,node1");
    }

    #[test]
    fn parse_encode_round_trip() {
        for s in ["a", "a,b", "n[0-7]", "rack[0-1],login,n[3-4]"] {
            let hl = Hostlist::parse(s).unwrap();
            assert_eq!(Hostlist::parse(&hl.encode()).unwrap(), hl);
        }
    }
}
