//! Cache headers for immutable image content.

use axum::http::header::{CACHE_CONTROL, EXPIRES, IF_MODIFIED_SINCE, LAST_MODIFIED};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::{TimeDelta, Utc};

/// Images never change once complete, so anything cached may be kept for a year.
pub(crate) const CACHE_TTL_SECS: i64 = 31_536_000;

const CACHE_CONTROL_VALUE: &str = "public, max-age=31536000";
const EPOCH: &str = "Thu, 01 Jan 1970 00:00:00 GMT";
const HTTP_DATE: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Headers attached to every cacheable response.
pub(crate) fn cache_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CACHE_CONTROL, HeaderValue::from_static(CACHE_CONTROL_VALUE));

    let expires = (Utc::now() + TimeDelta::seconds(CACHE_TTL_SECS)).format(HTTP_DATE);
    if let Ok(value) = HeaderValue::try_from(expires.to_string()) {
        headers.insert(EXPIRES, value);
    }

    headers.insert(LAST_MODIFIED, HeaderValue::from_static(EPOCH));
    headers
}

/// A `304 Not Modified` if the client already holds a copy.
///
/// Any copy is current: content behind a cacheable endpoint never changes.
pub(crate) fn not_modified(request: &HeaderMap) -> Option<Response> {
    request
        .contains_key(IF_MODIFIED_SINCE)
        .then(|| (StatusCode::NOT_MODIFIED, cache_headers()).into_response())
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDateTime;

    use super::*;

    #[test]
    fn headers_expire_in_a_year() {
        let headers = cache_headers();
        assert_eq!(headers[CACHE_CONTROL], "public, max-age=31536000");
        assert_eq!(headers[LAST_MODIFIED], "Thu, 01 Jan 1970 00:00:00 GMT");

        let expires = headers[EXPIRES].to_str().unwrap();
        let expires = NaiveDateTime::parse_from_str(expires, HTTP_DATE)
            .unwrap()
            .and_utc();
        let ahead = expires - Utc::now();
        assert!(ahead > TimeDelta::days(364));
        assert!(ahead <= TimeDelta::days(365));
    }

    #[test]
    fn conditional_request() {
        assert!(not_modified(&HeaderMap::new()).is_none());

        let mut request = HeaderMap::new();
        request.insert(
            IF_MODIFIED_SINCE,
            HeaderValue::from_static("Thu, 01 Jan 1970 00:00:00 GMT"),
        );
        let response = not_modified(&request).unwrap();
        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
        assert!(response.headers().contains_key(EXPIRES));
        assert!(!response.headers().contains_key("set-cookie"));
    }
}
