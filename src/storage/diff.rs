use std::collections::HashSet;

/// Elements of `old` whose key does not occur in `new`, in `old` order.
pub fn expired<'a, T, F>(old: &'a [T], new: &[T], key: F) -> Vec<&'a T>
where
    F: Fn(&T) -> &str,
{
    if old.is_empty() {
        return Vec::new();
    }
    let current: HashSet<&str> = new.iter().map(&key).collect();
    old.iter()
        .filter(|item| !current.contains(key(*item)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    /// Reference nested scan
    fn naive<'a>(old: &'a [String], new: &[String]) -> Vec<&'a String> {
        old.iter()
            .filter(|o| !new.iter().any(|n| n == *o))
            .collect()
    }

    #[test]
    fn test_expired_basic() {
        let old = ids(&["a", "b", "c"]);
        let new = ids(&["c", "a"]);
        let gone = expired(&old, &new, |s| s.as_str());
        assert_eq!(gone, vec![&old[1]]);
    }

    #[test]
    fn test_empty_sides() {
        let some = ids(&["a", "b"]);
        let none: Vec<String> = Vec::new();

        assert!(expired(&none, &some, |s| s.as_str()).is_empty());
        assert_eq!(expired(&some, &none, |s| s.as_str()).len(), 2);
        assert!(expired(&none, &none, |s| s.as_str()).is_empty());
    }

    #[test]
    fn test_matches_nested_scan() {
        let cases: Vec<(Vec<String>, Vec<String>)> = vec![
            (ids(&["x"]), ids(&["x"])),
            (ids(&["x"]), ids(&["y"])),
            (ids(&["a", "b", "c", "d"]), ids(&["d", "b"])),
            (ids(&["a", "a", "b"]), ids(&["b"])),
            (ids(&["q", "r"]), ids(&["r", "q", "s"])),
        ];

        for (old, new) in &cases {
            assert_eq!(expired(old, new, |s| s.as_str()), naive(old, new));

            let mut reversed = new.clone();
            reversed.reverse();
            assert_eq!(expired(old, &reversed, |s| s.as_str()), naive(old, new));
        }
    }
}
