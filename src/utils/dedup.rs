//! Duplicate detection for hits relayed from several sources.

use strsim::jaro_winkler;

use crate::models::SearchHit;

/// Minimum Jaro-Winkler similarity for two titles to count as the same work
const TITLE_SIMILARITY: f64 = 0.95;

/// Check if two hits likely describe the same record
///
/// Matching ISBNs are decisive. Otherwise the normalized titles must be
/// near-identical and the descriptions must not contradict each other.
pub fn is_duplicate_hit(a: &SearchHit, b: &SearchHit) -> bool {
    if let (Some(isbn_a), Some(isbn_b)) = (&a.isbn, &b.isbn) {
        return normalize_isbn(isbn_a) == normalize_isbn(isbn_b);
    }

    let title_a = normalize_title(&a.title);
    let title_b = normalize_title(&b.title);
    if title_a.is_empty() || title_b.is_empty() {
        return false;
    }

    if title_a != title_b && jaro_winkler(&title_a, &title_b) < TITLE_SIMILARITY {
        return false;
    }

    descriptions_agree(&a.description, &b.description)
}

/// Find the first earlier hit that `hit` duplicates
pub fn find_duplicate<'a>(hit: &SearchHit, seen: &'a [SearchHit]) -> Option<&'a SearchHit> {
    seen.iter().find(|other| is_duplicate_hit(hit, other))
}

/// Descriptions agree when either is missing or they share a component
fn descriptions_agree(a: &str, b: &str) -> bool {
    if a.is_empty() || b.is_empty() {
        return true;
    }
    let parts_b: Vec<String> = b.split('/').map(|s| s.trim().to_lowercase()).collect();
    a.split('/')
        .map(|s| s.trim().to_lowercase())
        .any(|p| !p.is_empty() && parts_b.contains(&p))
}

/// Normalize a title for comparison
fn normalize_title(title: &str) -> String {
    title
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Strip separators from an ISBN
fn normalize_isbn(isbn: &str) -> String {
    isbn.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(title: &str, desc: &str, isbn: Option<&str>) -> SearchHit {
        SearchHit::new("src", title, desc).isbn(isbn.map(str::to_string))
    }

    #[test]
    fn test_isbn_match_is_decisive() {
        let a = hit("Dune", "", Some("0-441-01359-7"));
        let b = hit("Dune (Deluxe Edition)", "", Some("0441013597"));
        assert!(is_duplicate_hit(&a, &b));

        let c = hit("Dune", "", Some("9780441172719"));
        assert!(!is_duplicate_hit(&a, &c));
    }

    #[test]
    fn test_title_similarity() {
        let a = hit("The Left Hand of Darkness", "Ursula K. Le Guin/Ace/1969", None);
        let b = hit("The Left Hand of Darkness.", "Ursula K. Le Guin/1976", None);
        assert!(is_duplicate_hit(&a, &b));

        let c = hit("The Dispossessed", "Ursula K. Le Guin", None);
        assert!(!is_duplicate_hit(&a, &c));
    }

    #[test]
    fn test_conflicting_descriptions_are_not_duplicates() {
        let a = hit("Solaris", "Andrei Tarkovsky/1972", None);
        let b = hit("Solaris", "Steven Soderbergh/2002", None);
        assert!(!is_duplicate_hit(&a, &b));
    }

    #[test]
    fn test_find_duplicate() {
        let seen = vec![hit("Emma", "", None), hit("Persuasion", "", None)];
        let found = find_duplicate(&hit("persuasion", "", None), &seen);
        assert_eq!(found.map(|h| h.title.as_str()), Some("Persuasion"));
        assert!(find_duplicate(&hit("Sanditon", "", None), &seen).is_none());
    }

    #[test]
    fn test_normalize_title() {
        assert_eq!(normalize_title("  The  Hobbit: or, There & Back "), "the hobbit or there back");
    }
}
