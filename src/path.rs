//! Translation between domain names and store paths.
//!
//! A service published under `a.b.skydns.local.` lives at the store path
//! `/skydns/local/skydns/b/a`: labels are reversed so that a DNS subtree is a
//! store subtree, and everything hangs off a fixed anchor segment. The label
//! `*` is kept verbatim in the path and reported as a wildcard; enumeration
//! roots the scan at the longest wildcard-free prefix.

/// Convert a domain name to its store path.
///
/// The name is canonicalised to lower case and the trailing dot is ignored.
/// Returns the path plus `true` when any label is the wildcard `*`.
pub fn path_of(name: &str, prefix: &str) -> (String, bool) {
    let labels = split_labels(name);
    let wildcard = labels.iter().any(|l| *l == "*");

    let mut path = String::with_capacity(name.len() + prefix.len() + 2);
    path.push('/');
    path.push_str(prefix);
    for label in labels.iter().rev() {
        path.push('/');
        path.push_str(label);
    }
    (path, wildcard)
}

/// As [`path_of`], but truncated before the first `*` label.
///
/// This is the subtree root for a wildcard scan: labels above the first
/// wildcard (towards the root) pin the scan, everything below is matched
/// leaf by leaf.
pub fn path_prefix_no_wildcard(name: &str, prefix: &str) -> String {
    let labels = split_labels(name);

    let mut path = String::with_capacity(name.len() + prefix.len() + 2);
    path.push('/');
    path.push_str(prefix);
    for label in labels.iter().rev() {
        if *label == "*" {
            break;
        }
        path.push('/');
        path.push_str(label);
    }
    path
}

/// Convert a store path back to a fully-qualified domain name.
///
/// Inverse of [`path_of`]: strips the anchor, reverses the remaining
/// segments and rejoins them with dots, appending the trailing dot.
pub fn name_of(path: &str, prefix: &str) -> String {
    let mut segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.first() == Some(&prefix) {
        segments.remove(0);
    }

    let mut name = String::with_capacity(path.len());
    for segment in segments.iter().rev() {
        name.push_str(segment);
        name.push('.');
    }
    name
}

fn split_labels(name: &str) -> Vec<String> {
    name.trim_end_matches('.')
        .split('.')
        .filter(|l| !l.is_empty())
        .map(|l| l.to_ascii_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PREFIX: &str = "skydns";

    #[test]
    fn test_path_of_reverses_labels() {
        let (path, wildcard) = path_of("a.b.skydns.local.", PREFIX);
        assert_eq!(path, "/skydns/local/skydns/b/a");
        assert!(!wildcard);
    }

    #[test]
    fn test_path_of_lowercases() {
        let (path, _) = path_of("A.B.SkyDNS.Local.", PREFIX);
        assert_eq!(path, "/skydns/local/skydns/b/a");
    }

    #[test]
    fn test_path_of_detects_wildcard() {
        let (path, wildcard) = path_of("*.production.skydns.local.", PREFIX);
        assert_eq!(path, "/skydns/local/skydns/production/*");
        assert!(wildcard);
    }

    #[test]
    fn test_path_prefix_stops_at_wildcard() {
        let path = path_prefix_no_wildcard("web.*.east.skydns.local.", PREFIX);
        assert_eq!(path, "/skydns/local/skydns/east");
    }

    #[test]
    fn test_path_prefix_without_wildcard_is_full_path() {
        let path = path_prefix_no_wildcard("a.b.skydns.local.", PREFIX);
        assert_eq!(path, "/skydns/local/skydns/b/a");
    }

    #[test]
    fn test_name_of_inverts_path() {
        let name = name_of("/skydns/test/skydns/region1/development/server1/100", PREFIX);
        assert_eq!(name, "100.server1.development.region1.skydns.test.");
    }

    #[test]
    fn test_round_trip() {
        let original = "100.server1.development.region1.skydns.test.";
        let (path, wildcard) = path_of(original, PREFIX);
        assert!(!wildcard);
        assert_eq!(name_of(&path, PREFIX), original);
    }

    #[test]
    fn test_round_trip_canonicalises_case() {
        let (path, _) = path_of("Web.Region1.SkyDNS.Test.", PREFIX);
        assert_eq!(name_of(&path, PREFIX), "web.region1.skydns.test.");
    }
}
