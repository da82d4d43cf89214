use url::Url;

/// Build the canonical request URL by merging explicit params into the query.
///
/// Existing query keys keep their position; a key repeated in the original
/// query collapses to its last value. An explicit param overrides an
/// existing key of the same name, and new keys are appended in order. The
/// fragment is kept.
pub fn request_url(url: &str, params: &[(String, String)]) -> Result<Url, url::ParseError> {
    let mut parsed = Url::parse(url)?;

    // Collapse the existing query into ordered, unique keys
    let mut pairs: Vec<(String, String)> = Vec::new();
    for (key, value) in parsed.query_pairs() {
        upsert(&mut pairs, key.into_owned(), value.into_owned());
    }

    // Explicit params win over the query string
    for (key, value) in params {
        upsert(&mut pairs, key.clone(), value.clone());
    }

    if pairs.is_empty() {
        parsed.set_query(None);
    } else {
        parsed.query_pairs_mut().clear().extend_pairs(pairs.iter());
    }

    Ok(parsed)
}

fn upsert(pairs: &mut Vec<(String, String)>, key: String, value: String) {
    match pairs.iter_mut().find(|(existing, _)| *existing == key) {
        Some(pair) => pair.1 = value,
        None => pairs.push((key, value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_new_param_is_appended() {
        let url = request_url("http://x?a=1", &params(&[("b", "2")])).unwrap();
        assert_eq!(url.query(), Some("a=1&b=2"));
    }

    #[test]
    fn test_explicit_param_overrides_query() {
        let url = request_url("http://x?a=1", &params(&[("a", "9")])).unwrap();
        assert_eq!(url.query(), Some("a=9"));
    }

    #[test]
    fn test_duplicate_query_keys_collapse_to_last() {
        let url = request_url("https://example.com/search?q=a&page=1&q=b", &[]).unwrap();
        assert_eq!(url.as_str(), "https://example.com/search?q=b&page=1");
    }

    #[test]
    fn test_no_query_stays_clean() {
        let url = request_url("https://example.com/path", &[]).unwrap();
        assert_eq!(url.as_str(), "https://example.com/path");
    }

    #[test]
    fn test_fragment_is_kept() {
        let url = request_url("https://example.com/path#section", &[]).unwrap();
        assert_eq!(url.as_str(), "https://example.com/path#section");

        let url = request_url("http://x.test/?a=1#top", &params(&[("b", "2")])).unwrap();
        assert_eq!(url.as_str(), "http://x.test/?a=1&b=2#top");
    }

    #[test]
    fn test_params_are_encoded() {
        let url = request_url("https://example.com/", &params(&[("q", "a b&c")])).unwrap();
        assert_eq!(url.query(), Some("q=a+b%26c"));
    }

    #[test]
    fn test_invalid_url() {
        assert!(request_url("not a url", &[]).is_err());
    }
}
