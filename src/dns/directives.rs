//! dnsmasq directive file management
//!
//! Lines are keyed by prefix (`server=`, `port=`) or, for the
//! `ipset=/<domain>[/<domain>...]/<set>[,<set>...]` family, by exact domain.
//! A line directs every domain it names at every set it names; rewrites
//! work on those (domain, set) pairs so mappings owned by other sets
//! survive.

use super::{normalize_domain, normalize_domains, read_lines, write_lines};
use crate::error::{Store, StoreError};
use crate::netfilter::validate_set_name;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const SERVER_PREFIX: &str = "server=";
pub const PORT_PREFIX: &str = "port=";
const IPSET_PREFIX: &str = "ipset=/";

/// One parsed `ipset=/d1/d2/s1,s2` line
struct IpsetDirective<'a> {
    domains: Vec<&'a str>,
    sets: Vec<&'a str>,
}

impl IpsetDirective<'_> {
    fn names(&self, domain: &str) -> bool {
        self.domains.iter().any(|d| d.eq_ignore_ascii_case(domain))
    }

    fn targets(&self, set: &str) -> bool {
        self.sets.iter().any(|s| *s == set)
    }
}

fn parse_ipset(line: &str) -> Option<IpsetDirective<'_>> {
    let body = line.strip_prefix(IPSET_PREFIX)?;
    let (domains, sets) = body.rsplit_once('/')?;
    let domains: Vec<&str> = domains.split('/').filter(|d| !d.is_empty()).collect();
    let sets: Vec<&str> = sets
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    if domains.is_empty() || sets.is_empty() {
        return None;
    }
    Some(IpsetDirective { domains, sets })
}

fn render_ipset<D: AsRef<str>, S: AsRef<str>>(domains: &[D], sets: &[S]) -> String {
    let domains: Vec<&str> = domains.iter().map(|d| d.as_ref()).collect();
    let sets: Vec<&str> = sets.iter().map(|s| s.as_ref()).collect();
    format!("{}{}/{}", IPSET_PREFIX, domains.join("/"), sets.join(","))
}

/// Number of ipset lines mentioning `domain`
fn references(lines: &[String], domain: &str) -> usize {
    lines
        .iter()
        .filter_map(|l| parse_ipset(l))
        .filter(|d| d.names(domain))
        .count()
}

/// Every set `domain` is directed at, in file order
fn sets_of(lines: &[String], domain: &str) -> Vec<String> {
    let mut sets: Vec<String> = Vec::new();
    for directive in lines.iter().filter_map(|l| parse_ipset(l)) {
        if !directive.names(domain) {
            continue;
        }
        for set in &directive.sets {
            if !sets.iter().any(|s| s == set) {
                sets.push(set.to_string());
            }
        }
    }
    sets
}

/// `domain` sits on exactly one line and that line targets `set`
fn directed_once_at(lines: &[String], domain: &str, set: &str) -> bool {
    references(lines, domain) == 1
        && lines
            .iter()
            .filter_map(|l| parse_ipset(l))
            .any(|d| d.names(domain) && d.targets(set))
}

/// Drop every (domain, set) pair for which `discard` returns true.
///
/// Lines that lose nothing are kept byte-for-byte and non-ipset lines are
/// never touched. Within a changed line, domains left with the same sets
/// share one rewritten line; domains left with no set disappear.
fn retain_mappings<F>(lines: &[String], mut discard: F) -> Vec<String>
where
    F: FnMut(&str, &str) -> bool,
{
    let mut out = Vec::with_capacity(lines.len());
    for line in lines {
        let Some(directive) = parse_ipset(line) else {
            out.push(line.clone());
            continue;
        };

        let mut changed = false;
        let mut groups: Vec<(Vec<&str>, Vec<&str>)> = Vec::new();
        for &domain in &directive.domains {
            let kept: Vec<&str> = directive
                .sets
                .iter()
                .copied()
                .filter(|s| !discard(domain, *s))
                .collect();
            changed |= kept.len() != directive.sets.len();
            if kept.is_empty() {
                continue;
            }
            match groups.iter_mut().find(|(sets, _)| *sets == kept) {
                Some((_, domains)) => domains.push(domain),
                None => groups.push((kept, vec![domain])),
            }
        }

        if changed {
            out.extend(groups.iter().map(|(sets, domains)| render_ipset(domains, sets)));
        } else {
            out.push(line.clone());
        }
    }
    out
}

pub struct DirectiveFile {
    path: PathBuf,
}

impl DirectiveFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Non-blank lines; a missing file reads as empty
    pub fn lines(&self) -> Result<Vec<String>, StoreError> {
        read_lines(Store::DirectiveFile, &self.path)
    }

    /// The last line starting with `prefix`, if any
    pub fn singleton(&self, prefix: &str) -> Result<Option<String>, StoreError> {
        Ok(self.lines()?.into_iter().rev().find(|l| l.starts_with(prefix)))
    }

    /// Make `line` the only line starting with `prefix`, appended at the end.
    /// Returns false if the file already held exactly that line once.
    pub fn set_singleton(&self, prefix: &str, line: &str) -> Result<bool, StoreError> {
        if !line.starts_with(prefix) || line.contains('\n') {
            return Err(StoreError::invalid(
                Store::DirectiveFile,
                "directive",
                line,
                format!("must be a single line starting with '{}'", prefix),
            ));
        }
        let lines = self.lines()?;
        let matching: Vec<&String> = lines.iter().filter(|l| l.starts_with(prefix)).collect();
        if matching.len() == 1 && matching[0] == line {
            debug!("{} already set in {}", prefix, self.path.display());
            return Ok(false);
        }

        let mut updated: Vec<String> = lines.into_iter().filter(|l| !l.starts_with(prefix)).collect();
        updated.push(line.to_string());
        self.write_lines(&updated)?;
        info!("Set '{}' in {}", line, self.path.display());
        Ok(true)
    }

    /// Delete every line starting with `prefix`; returns how many were removed.
    /// The file is deleted once no lines remain.
    pub fn remove_by_prefix(&self, prefix: &str) -> Result<usize, StoreError> {
        let lines = self.lines()?;
        let before = lines.len();
        let remaining: Vec<String> = lines.into_iter().filter(|l| !l.starts_with(prefix)).collect();
        let removed = before - remaining.len();

        if removed > 0 || (remaining.is_empty() && self.exists()) {
            self.write_lines(&remaining)?;
        }
        if removed > 0 {
            info!("Removed {} '{}' line(s) from {}", removed, prefix, self.path.display());
        }
        Ok(removed)
    }

    pub fn set_server(&self, server: &str) -> Result<bool, StoreError> {
        let server = server.trim();
        if server.is_empty() || server.chars().any(char::is_whitespace) {
            return Err(StoreError::invalid(
                Store::DirectiveFile,
                "server",
                server,
                "must be a non-empty address without whitespace",
            ));
        }
        self.set_singleton(SERVER_PREFIX, &format!("{}{}", SERVER_PREFIX, server))
    }

    pub fn set_port(&self, port: u16) -> Result<bool, StoreError> {
        self.set_singleton(PORT_PREFIX, &format!("{}{}", PORT_PREFIX, port))
    }

    pub fn clear_server(&self) -> Result<usize, StoreError> {
        self.remove_by_prefix(SERVER_PREFIX)
    }

    pub fn clear_port(&self) -> Result<usize, StoreError> {
        self.remove_by_prefix(PORT_PREFIX)
    }

    /// Domain → sets mapping of every `ipset=` directive
    pub fn list_domain_directives(&self) -> Result<BTreeMap<String, Vec<String>>, StoreError> {
        let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for line in self.lines()? {
            if let Some(directive) = parse_ipset(&line) {
                for domain in &directive.domains {
                    let sets = map.entry(domain.to_ascii_lowercase()).or_default();
                    for set in &directive.sets {
                        if !sets.iter().any(|s| s == set) {
                            sets.push(set.to_string());
                        }
                    }
                }
            }
        }
        Ok(map)
    }

    /// Domains directed at `set` (alone or alongside other sets), in file order
    pub fn domains_for_set(&self, set: &str) -> Result<Vec<String>, StoreError> {
        let mut domains: Vec<String> = Vec::new();
        for line in self.lines()? {
            let Some(directive) = parse_ipset(&line) else {
                continue;
            };
            if !directive.targets(set) {
                continue;
            }
            for domain in directive.domains {
                let domain = domain.to_ascii_lowercase();
                if !domains.contains(&domain) {
                    domains.push(domain);
                }
            }
        }
        Ok(domains)
    }

    /// Ensure `domain` has exactly one directive and that it targets `set`.
    ///
    /// A single existing line already targeting `set` is left untouched.
    /// Otherwise the domain's lines are folded into one appended line that
    /// keeps every set it was already directed at.
    pub fn set_domain_directive(&self, domain: &str, set: &str) -> Result<bool, StoreError> {
        let domain = normalize_domain(domain)?;
        validate_set_name(set)?;

        let lines = self.lines()?;
        if directed_once_at(&lines, &domain, set) {
            debug!("Directive for {} already present", domain);
            return Ok(false);
        }

        let line = merged_directive(&lines, &domain, set);
        let mut updated = retain_mappings(&lines, |d, _| d.eq_ignore_ascii_case(&domain));
        updated.push(line);
        self.write_lines(&updated)?;
        info!("Directed {} to ipset {}", domain, set);
        Ok(true)
    }

    /// Remove every directive for `domain`, whatever set it targets;
    /// returns whether anything changed
    pub fn remove_domain_directive(&self, domain: &str) -> Result<bool, StoreError> {
        let domain = normalize_domain(domain)?;
        self.rewrite_mappings(|d, _| d.eq_ignore_ascii_case(&domain))
            .map(|changed| {
                if changed {
                    info!("Removed directive for {}", domain);
                }
                changed
            })
    }

    /// Stop directing `domain` at `set`, keeping its other sets
    pub fn remove_domain_from_set(&self, domain: &str, set: &str) -> Result<bool, StoreError> {
        let domain = normalize_domain(domain)?;
        let changed = self.rewrite_mappings(|d, s| s == set && d.eq_ignore_ascii_case(&domain))?;
        if changed {
            info!("Stopped directing {} to ipset {}", domain, set);
        }
        Ok(changed)
    }

    /// Make the domains directed at `set` exactly `domains` in one rewrite.
    ///
    /// Stale pairs for `set` are removed (other sets on the same line stay),
    /// lines already in the desired form are kept byte-for-byte, and missing
    /// ones are appended in input order.
    pub fn sync_set_domains<S: AsRef<str>>(&self, set: &str, domains: &[S]) -> Result<bool, StoreError> {
        validate_set_name(set)?;
        let desired = normalize_domains(domains)?;
        let lines = self.lines()?;

        let satisfied: HashSet<&str> = desired
            .iter()
            .filter(|d| directed_once_at(&lines, d, set))
            .map(String::as_str)
            .collect();
        let appended: Vec<String> = desired
            .iter()
            .filter(|d| !satisfied.contains(d.as_str()))
            .map(|d| merged_directive(&lines, d, set))
            .collect();

        let mut updated = retain_mappings(&lines, |d, s| {
            let lower = d.to_ascii_lowercase();
            if desired.contains(&lower) {
                !satisfied.contains(lower.as_str())
            } else {
                s == set
            }
        });
        updated.extend(appended);

        if updated == lines {
            debug!("Directives for ipset {} already in sync", set);
            return Ok(false);
        }
        self.write_lines(&updated)?;
        info!("Synced {} domain directive(s) for ipset {}", desired.len(), set);
        Ok(true)
    }

    /// Remove every (domain, `set`) mapping; returns the affected domains
    pub fn remove_set_directives(&self, set: &str) -> Result<Vec<String>, StoreError> {
        let lines = self.lines()?;
        let mut removed: Vec<String> = Vec::new();
        let updated = retain_mappings(&lines, |d, s| {
            let hit = s == set;
            if hit {
                let domain = d.to_ascii_lowercase();
                if !removed.contains(&domain) {
                    removed.push(domain);
                }
            }
            hit
        });
        if !removed.is_empty() {
            self.write_lines(&updated)?;
            info!("Removed {} directive(s) for ipset {}", removed.len(), set);
        }
        Ok(removed)
    }

    fn rewrite_mappings<F>(&self, discard: F) -> Result<bool, StoreError>
    where
        F: FnMut(&str, &str) -> bool,
    {
        let lines = self.lines()?;
        let updated = retain_mappings(&lines, discard);
        if updated == lines {
            return Ok(false);
        }
        self.write_lines(&updated)?;
        Ok(true)
    }

    fn write_lines(&self, lines: &[String]) -> Result<(), StoreError> {
        write_lines(Store::DirectiveFile, &self.path, lines)
    }
}

/// Single-domain line for `domain` targeting its current sets plus `set`
fn merged_directive(lines: &[String], domain: &str, set: &str) -> String {
    let mut sets = sets_of(lines, domain);
    if !sets.iter().any(|s| s == set) {
        sets.push(set.to_string());
    }
    render_ipset(&[domain], &sets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn create_test_file(temp_dir: &TempDir, content: Option<&str>) -> DirectiveFile {
        let path = temp_dir.path().join("domain-tunnel.conf");
        if let Some(content) = content {
            fs::write(&path, content).unwrap();
        }
        DirectiveFile::new(path)
    }

    fn read(file: &DirectiveFile) -> String {
        fs::read_to_string(file.path()).unwrap()
    }

    #[test]
    fn test_missing_file_reads_empty() {
        let temp_dir = TempDir::new().unwrap();
        let file = create_test_file(&temp_dir, None);

        assert!(file.lines().unwrap().is_empty());
        assert!(file.list_domain_directives().unwrap().is_empty());
        assert_eq!(file.remove_by_prefix(SERVER_PREFIX).unwrap(), 0);
        assert!(!file.exists());
    }

    #[test]
    fn test_set_singleton_replaces_and_appends() {
        let temp_dir = TempDir::new().unwrap();
        let file = create_test_file(
            &temp_dir,
            Some("server=1.1.1.1\n# keep me\nipset=/a.com/vpn\nserver=9.9.9.9\n"),
        );

        assert!(file.set_server("8.8.8.8").unwrap());

        assert_eq!(read(&file), "# keep me\nipset=/a.com/vpn\nserver=8.8.8.8\n");
    }

    #[test]
    fn test_set_singleton_noop_when_identical() {
        let temp_dir = TempDir::new().unwrap();
        let file = create_test_file(&temp_dir, Some("port=5353\nipset=/a.com/vpn\n"));

        assert!(!file.set_port(5353).unwrap());
        assert_eq!(read(&file), "port=5353\nipset=/a.com/vpn\n");

        assert!(file.set_port(53).unwrap());
        assert_eq!(read(&file), "ipset=/a.com/vpn\nport=53\n");
        assert_eq!(file.singleton(PORT_PREFIX).unwrap().as_deref(), Some("port=53"));
    }

    #[test]
    fn test_set_singleton_rejects_mismatched_line() {
        let temp_dir = TempDir::new().unwrap();
        let file = create_test_file(&temp_dir, None);

        assert!(file.set_singleton(SERVER_PREFIX, "port=1").is_err());
        assert!(file.set_singleton(SERVER_PREFIX, "server=1.1.1.1\nport=2").is_err());
        assert!(file.set_server("1.1.1.1 2.2.2.2").is_err());
        assert!(!file.exists());
    }

    #[test]
    fn test_domain_directive_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let file = create_test_file(&temp_dir, None);

        file.set_domain_directive("a.com", "s1").unwrap();
        let map = file.list_domain_directives().unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map["a.com"], vec!["s1"]);
        let a_line = read(&file);

        file.set_domain_directive("b.com", "s1").unwrap();
        let map = file.list_domain_directives().unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map["a.com"], vec!["s1"]);
        assert_eq!(map["b.com"], vec!["s1"]);

        // a.com's line is unchanged byte for byte
        assert!(read(&file).starts_with(&a_line));
        assert_eq!(read(&file), "ipset=/a.com/s1\nipset=/b.com/s1\n");
    }

    #[test]
    fn test_set_domain_directive_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let file = create_test_file(&temp_dir, Some("ipset=/a.com/s1\nserver=1.1.1.1\n"));

        assert!(!file.set_domain_directive("A.COM.", "s1").unwrap());
        assert_eq!(read(&file), "ipset=/a.com/s1\nserver=1.1.1.1\n");
    }

    #[test]
    fn test_set_domain_directive_folds_duplicates_keeping_other_sets() {
        let temp_dir = TempDir::new().unwrap();
        let file = create_test_file(
            &temp_dir,
            Some("ipset=/a.com/old\n# note\nipset=/a.com/s1\nipset=/a.com/s1\n"),
        );

        assert!(file.set_domain_directive("a.com", "s1").unwrap());
        assert_eq!(read(&file), "# note\nipset=/a.com/old,s1\n");
        assert!(!file.set_domain_directive("a.com", "s1").unwrap());
    }

    #[test]
    fn test_prefix_domains_do_not_cross_match() {
        let temp_dir = TempDir::new().unwrap();
        let file = create_test_file(
            &temp_dir,
            Some("ipset=/example.com.au/s2\nipset=/www.example.com/s2\n"),
        );

        file.set_domain_directive("example.com", "s1").unwrap();
        file.remove_domain_directive("example.com").unwrap();

        assert_eq!(
            read(&file),
            "ipset=/example.com.au/s2\nipset=/www.example.com/s2\n"
        );
    }

    #[test]
    fn test_multi_domain_lines() {
        let temp_dir = TempDir::new().unwrap();
        let file = create_test_file(&temp_dir, Some("ipset=/a.com/b.com/c.com/s1\n"));

        let map = file.list_domain_directives().unwrap();
        assert_eq!(map.len(), 3);
        assert_eq!(map["b.com"], vec!["s1"]);

        // Already directed at s1 through the shared line
        assert!(!file.set_domain_directive("b.com", "s1").unwrap());

        // Pulling one domain out keeps its siblings on the shared line
        file.set_domain_directive("b.com", "s2").unwrap();
        assert_eq!(read(&file), "ipset=/a.com/c.com/s1\nipset=/b.com/s1,s2\n");

        file.remove_domain_directive("a.com").unwrap();
        assert_eq!(read(&file), "ipset=/c.com/s1\nipset=/b.com/s1,s2\n");
    }

    #[test]
    fn test_removing_last_directive_deletes_file() {
        let temp_dir = TempDir::new().unwrap();
        let file = create_test_file(&temp_dir, None);

        file.set_domain_directive("a.com", "s1").unwrap();
        assert!(file.exists());

        assert!(file.remove_domain_directive("a.com").unwrap());
        assert!(!file.exists());
        assert!(!file.remove_domain_directive("a.com").unwrap());
    }

    #[test]
    fn test_removing_last_singleton_keeps_domain_lines() {
        let temp_dir = TempDir::new().unwrap();
        let file = create_test_file(&temp_dir, Some("server=1.1.1.1\nipset=/a.com/s1\n"));

        assert_eq!(file.clear_server().unwrap(), 1);
        assert!(file.exists());
        assert_eq!(read(&file), "ipset=/a.com/s1\n");
    }

    #[test]
    fn test_remove_by_prefix_deletes_empty_file() {
        let temp_dir = TempDir::new().unwrap();
        let file = create_test_file(&temp_dir, Some("server=1.1.1.1\nserver=2.2.2.2\n"));

        assert_eq!(file.clear_server().unwrap(), 2);
        assert!(!file.exists());

        // A pre-existing blank file is also cleaned up
        let file = create_test_file(&temp_dir, Some("\n\n"));
        assert_eq!(file.clear_port().unwrap(), 0);
        assert!(!file.exists());
    }

    #[test]
    fn test_sync_set_domains() {
        let temp_dir = TempDir::new().unwrap();
        let file = create_test_file(
            &temp_dir,
            Some("server=1.1.1.1\nipset=/stale.com/vpn\nipset=/keep.com/vpn\nipset=/other.com/other\n"),
        );

        assert!(file.sync_set_domains("vpn", &["keep.com", "new.com"]).unwrap());
        assert_eq!(
            read(&file),
            "server=1.1.1.1\nipset=/keep.com/vpn\nipset=/other.com/other\nipset=/new.com/vpn\n"
        );

        // Second pass is a no-op
        assert!(!file.sync_set_domains("vpn", &["keep.com", "new.com"]).unwrap());
        assert_eq!(file.domains_for_set("vpn").unwrap(), vec!["keep.com", "new.com"]);
    }

    #[test]
    fn test_sync_set_domains_rejects_invalid_without_writing() {
        let temp_dir = TempDir::new().unwrap();
        let file = create_test_file(&temp_dir, Some("ipset=/a.com/vpn\n"));

        let err = file.sync_set_domains("vpn", &["ok.com", "bad domain"]).unwrap_err();
        assert!(matches!(err, StoreError::InvalidEntry { .. }));
        assert_eq!(read(&file), "ipset=/a.com/vpn\n");
    }

    #[test]
    fn test_remove_set_directives() {
        let temp_dir = TempDir::new().unwrap();
        let file = create_test_file(
            &temp_dir,
            Some("port=53\nipset=/a.com/vpn\nipset=/b.com/other\nipset=/c.com/d.com/vpn\n"),
        );

        let removed = file.remove_set_directives("vpn").unwrap();
        assert_eq!(removed, vec!["a.com", "c.com", "d.com"]);
        assert_eq!(read(&file), "port=53\nipset=/b.com/other\n");
        assert!(file.remove_set_directives("vpn").unwrap().is_empty());
    }

    #[test]
    fn test_multi_set_lines_are_listed_per_set() {
        let temp_dir = TempDir::new().unwrap();
        let file = create_test_file(&temp_dir, Some("ipset=/a.com/vpn, other\nipset=/b.com/other\n"));

        let map = file.list_domain_directives().unwrap();
        assert_eq!(map["a.com"], vec!["vpn", "other"]);
        assert_eq!(file.domains_for_set("vpn").unwrap(), vec!["a.com"]);
        assert_eq!(file.domains_for_set("other").unwrap(), vec!["a.com", "b.com"]);
    }

    #[test]
    fn test_remove_set_directives_keeps_other_sets_on_line() {
        let temp_dir = TempDir::new().unwrap();
        let file = create_test_file(
            &temp_dir,
            Some("ipset=/a.com/vpn,other\nipset=/b.com/c.com/other,vpn\n"),
        );

        let removed = file.remove_set_directives("vpn").unwrap();
        assert_eq!(removed, vec!["a.com", "b.com", "c.com"]);
        assert_eq!(read(&file), "ipset=/a.com/other\nipset=/b.com/c.com/other\n");
        assert!(file.domains_for_set("vpn").unwrap().is_empty());
    }

    #[test]
    fn test_sync_prunes_stale_domain_from_multi_set_line() {
        let temp_dir = TempDir::new().unwrap();
        let file = create_test_file(&temp_dir, Some("ipset=/a.com/vpn,other\n"));

        assert!(file.sync_set_domains("vpn", &["b.com"]).unwrap());
        assert_eq!(read(&file), "ipset=/a.com/other\nipset=/b.com/vpn\n");
        assert_eq!(file.domains_for_set("vpn").unwrap(), vec!["b.com"]);
    }

    #[test]
    fn test_sync_keeps_multi_set_line_already_targeting_set() {
        let temp_dir = TempDir::new().unwrap();
        let file = create_test_file(&temp_dir, Some("ipset=/a.com/vpn,other\n"));

        assert!(!file.sync_set_domains("vpn", &["a.com"]).unwrap());
        assert_eq!(read(&file), "ipset=/a.com/vpn,other\n");
    }

    #[test]
    fn test_sync_adds_set_to_domain_owned_by_other_set() {
        let temp_dir = TempDir::new().unwrap();
        let file = create_test_file(&temp_dir, Some("ipset=/a.com/b.com/other\n"));

        assert!(file.sync_set_domains("vpn", &["a.com"]).unwrap());
        assert_eq!(read(&file), "ipset=/b.com/other\nipset=/a.com/other,vpn\n");
        assert_eq!(file.domains_for_set("other").unwrap(), vec!["b.com", "a.com"]);
    }

    #[test]
    fn test_remove_domain_from_set() {
        let temp_dir = TempDir::new().unwrap();
        let file = create_test_file(&temp_dir, Some("ipset=/a.com/b.com/vpn,other\n"));

        assert!(file.remove_domain_from_set("a.com", "vpn").unwrap());
        assert_eq!(read(&file), "ipset=/a.com/other\nipset=/b.com/vpn,other\n");
        assert!(!file.remove_domain_from_set("a.com", "vpn").unwrap());

        assert!(file.remove_domain_from_set("a.com", "other").unwrap());
        assert_eq!(read(&file), "ipset=/b.com/vpn,other\n");
    }

    #[test]
    fn test_rewrite_leaves_no_temp_files() {
        let temp_dir = TempDir::new().unwrap();
        let file = create_test_file(&temp_dir, None);

        file.set_server("1.1.1.1").unwrap();
        file.set_domain_directive("a.com", "vpn").unwrap();
        file.set_port(5353).unwrap();

        let entries: Vec<_> = fs::read_dir(temp_dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        assert!(read(&file).ends_with('\n'));
        assert!(read(&file).lines().all(|l| !l.is_empty()));
    }

    #[cfg(unix)]
    #[test]
    fn test_rewritten_file_is_world_readable() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let file = create_test_file(&temp_dir, None);
        file.set_server("1.1.1.1").unwrap();

        let mode = fs::metadata(file.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
    }

    #[test]
    fn test_unparseable_ipset_lines_are_preserved() {
        let temp_dir = TempDir::new().unwrap();
        let file = create_test_file(&temp_dir, Some("ipset=/broken\nipset=/a.com/vpn\n"));

        file.remove_set_directives("vpn").unwrap();
        assert_eq!(read(&file), "ipset=/broken\n");
    }

    #[test]
    fn test_creates_missing_parent_directory() {
        let temp_dir = TempDir::new().unwrap();
        let file = DirectiveFile::new(temp_dir.path().join("dnsmasq.d").join("tunnel.conf"));

        file.set_domain_directive("a.com", "vpn").unwrap();
        assert_eq!(read(&file), "ipset=/a.com/vpn\n");
    }
}
