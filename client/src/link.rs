//! Share links: `<base>?track=<id>` puts whoever opens them in viewer mode

use shared::TRACK_QUERY_PARAM;
use url::Url;

/// Builds the link that lets others follow `id`
pub fn tracking_link(base: &str, id: &str) -> Result<String, url::ParseError> {
    let mut url = Url::parse(base)?;
    url.query_pairs_mut()
        .clear()
        .append_pair(TRACK_QUERY_PARAM, id);
    Ok(url.to_string())
}

/// Extracts the identity a share link asks to follow
///
/// Unparseable links and empty `track` values yield `None`.
pub fn track_target_from_link(link: &str) -> Option<String> {
    let url = Url::parse(link).ok()?;
    let target = url
        .query_pairs()
        .find(|(key, _)| key == TRACK_QUERY_PARAM)
        .map(|(_, value)| value.into_owned())?;

    if target.is_empty() {
        None
    } else {
        Some(target)
    }
}
