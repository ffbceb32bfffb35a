//! `Accept` and `Origin` header checks.
use std::collections::BTreeSet;
use url::Url;

pub const APPLICATION_JSON: &str = "application/json";
pub const TEXT_EVENT_STREAM: &str = "text/event-stream";

/// Parse an `Accept` header into the set of media types it lists.
///
/// Parameters (`;q=0.9` and such) are ignored and types are lowercased.  Returns `None` if any
/// entry isn't a `type/subtype` pair.
pub fn parse_accept(header: &str) -> Option<BTreeSet<String>> {
    let mut types = BTreeSet::new();
    for entry in header.split(',') {
        let media_type = entry.split(';').next().unwrap_or_default().trim();
        if media_type.is_empty() {
            continue;
        }

        let (kind, subtype) = media_type.split_once('/')?;
        if !is_token(kind) || !is_token(subtype) {
            return None;
        }
        types.insert(media_type.to_ascii_lowercase());
    }
    Some(types)
}

/// True if the header lists exactly the required media types, no more and no fewer.
pub fn accepts_exactly(header: Option<&str>, required: &[&str]) -> bool {
    let Some(types) = header.and_then(parse_accept) else {
        return false;
    };
    types.len() == required.len() && required.iter().all(|r| types.contains(*r))
}

fn is_token(s: &str) -> bool {
    !s.is_empty()
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"!#$&-^_.+*".contains(&b))
}

/// Reduce an origin to `scheme://authority` form, with default ports dropped.
pub fn normalize_origin(origin: &str) -> Option<String> {
    let url = Url::parse(origin.trim()).ok()?;
    let origin = url.origin();
    origin.is_tuple().then(|| origin.ascii_serialization())
}

/// The set of origins allowed to talk to the server, kept in normalized form
#[derive(Clone, Debug)]
pub struct OriginAllowList(BTreeSet<String>);

impl OriginAllowList {
    pub fn new<'a>(origins: impl IntoIterator<Item = &'a String>) -> Self {
        Self(
            origins
                .into_iter()
                .filter_map(|origin| normalize_origin(origin))
                .collect(),
        )
    }

    pub fn allows(&self, origin: &str) -> bool {
        normalize_origin(origin).is_some_and(|origin| self.0.contains(&origin))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_parsing() {
        let types = parse_accept("Application/JSON; q=0.9, text/event-stream").unwrap();
        assert_eq!(
            types.into_iter().collect::<Vec<_>>(),
            vec!["application/json", "text/event-stream"]
        );
        assert_eq!(parse_accept("garbage"), None);
        assert_eq!(parse_accept("text/"), None);
    }

    #[test]
    fn exact_accept_sets() {
        let post = [APPLICATION_JSON, TEXT_EVENT_STREAM];
        assert!(accepts_exactly(
            Some("application/json, text/event-stream"),
            &post
        ));
        assert!(!accepts_exactly(Some("application/json"), &post));
        assert!(!accepts_exactly(Some("*/*"), &post));
        assert!(!accepts_exactly(None, &post));
        assert!(!accepts_exactly(
            Some("application/json, text/event-stream, text/html"),
            &post
        ));

        assert!(accepts_exactly(Some("text/event-stream"), &[TEXT_EVENT_STREAM]));
    }

    #[test]
    fn origin_allow_list() {
        let allowed = OriginAllowList::new(&vec![
            "http://localhost".to_string(),
            "https://127.0.0.1".to_string(),
        ]);

        assert!(allowed.allows("http://localhost"));
        assert!(allowed.allows("http://LOCALHOST:80/"));
        assert!(allowed.allows("https://127.0.0.1"));
        assert!(!allowed.allows("http://127.0.0.1"));
        assert!(!allowed.allows("http://localhost:3000"));
        assert!(!allowed.allows("http://evil.example"));
        assert!(!allowed.allows("null"));
    }
}
