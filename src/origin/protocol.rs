use std::time::{Duration, SystemTime};

use bytes::Bytes;
use http::header::{
    ACCEPT_RANGES, ALLOW, CACHE_CONTROL, CONTENT_DISPOSITION, CONTENT_RANGE, CONTENT_TYPE, DATE,
    ETAG, EXPIRES, IF_MATCH, IF_MODIFIED_SINCE, IF_NONE_MATCH, IF_RANGE, IF_UNMODIFIED_SINCE,
    LAST_MODIFIED,
};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};

use super::range::{self, RangeHeader};
use crate::service::Response;

/// Seconds between year 0 of the proleptic Gregorian calendar and the
/// Unix epoch; ETags count modification time from the former.
const GREGORIAN_EPOCH_OFFSET: u64 = 62_167_219_200;

const OCTET_STREAM: &str = "application/octet-stream";

/// Knobs the conditional/range machine needs from the configuration.
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    pub cache_seconds: Option<u32>,
    pub use_expires: bool,
    pub clock_skew_max: Duration,
    /// HTTP-method routing: adds `accept-ranges` and enables the full
    /// conditional/range treatment.
    pub http_methods: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Proceed,
    NotModified,
    PreconditionFailed,
}

pub fn gregorian_seconds(time: SystemTime) -> u64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
        .saturating_add(GREGORIAN_EPOCH_OFFSET)
}

/// `<mtime-gregorian-seconds-hex><counter-hex>`; the counter disambiguates
/// content generations that land on the same modification second.
pub fn etag_value(mtime_i: (SystemTime, u32)) -> String {
    format!("{:x}{:x}", gregorian_seconds(mtime_i.0), mtime_i.1)
}

fn header_str<'a>(headers: &'a HeaderMap, name: HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Evaluates the conditional request headers in their fixed order. Date
/// comparisons happen at second granularity, and client dates beyond
/// `now + clock_skew_max` are treated as invalid future times.
pub fn cache_status(
    req: &HeaderMap,
    etag: &str,
    mtime: SystemTime,
    now: SystemTime,
    clock_skew_max: Duration,
) -> CacheStatus {
    if let Some(value) = header_str(req, IF_NONE_MATCH)
        && (value.trim() == "*" || value.contains(etag))
    {
        return CacheStatus::NotModified;
    }

    if let Some(value) = header_str(req, IF_MATCH)
        && value.trim() != "*"
        && !value.contains(etag)
    {
        return CacheStatus::PreconditionFailed;
    }

    let mtime_s = gregorian_seconds(mtime);
    let ceiling_s = gregorian_seconds(now + clock_skew_max);

    if let Some(value) = header_str(req, IF_MODIFIED_SINCE)
        && let Ok(date) = httpdate::parse_http_date(value)
    {
        let date_s = gregorian_seconds(date);
        if mtime_s <= date_s && date_s <= ceiling_s {
            return CacheStatus::NotModified;
        }
    }

    if let Some(value) = header_str(req, IF_UNMODIFIED_SINCE)
        && let Ok(date) = httpdate::parse_http_date(value)
    {
        let date_s = gregorian_seconds(date);
        if mtime_s <= date_s && date_s <= ceiling_s {
            return CacheStatus::PreconditionFailed;
        }
    }

    CacheStatus::Proceed
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IfRangeStatus {
    Honor,
    Stale,
}

/// An `If-Range` validator honors the ranges when it carries the current
/// ETag or a date equal to the modification time; anything else is stale.
pub fn if_range_status(req: &HeaderMap, etag: &str, mtime: SystemTime) -> IfRangeStatus {
    let Some(value) = header_str(req, IF_RANGE) else {
        return IfRangeStatus::Honor;
    };
    if value.contains(etag) {
        return IfRangeStatus::Honor;
    }
    if let Ok(date) = httpdate::parse_http_date(value)
        && gregorian_seconds(date) == gregorian_seconds(mtime)
    {
        return IfRangeStatus::Honor;
    }
    IfRangeStatus::Stale
}

/// The headers every read/write reply carries: validators, the date, the
/// configured caching policy, and the range capability advertisement.
pub fn base_headers(cfg: &ProtocolConfig, etag: &str, mtime: SystemTime, now: SystemTime) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(etag) {
        headers.insert(ETAG, value);
    }
    insert_date(&mut headers, LAST_MODIFIED, mtime);
    insert_date(&mut headers, DATE, now);

    if let Some(seconds) = cfg.cache_seconds {
        if cfg.use_expires {
            headers.insert(CACHE_CONTROL, HeaderValue::from_static("public"));
            insert_date(&mut headers, EXPIRES, now + Duration::from_secs(seconds.into()));
        } else if let Ok(value) = HeaderValue::from_str(&format!("public,max-age={seconds}")) {
            headers.insert(CACHE_CONTROL, value);
        }
    }

    if cfg.http_methods {
        headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    }
    headers
}

fn insert_date(headers: &mut HeaderMap, name: HeaderName, time: SystemTime) {
    if let Ok(value) = HeaderValue::from_str(&httpdate::fmt_http_date(time)) {
        headers.insert(name, value);
    }
}

fn extend(headers: &mut HeaderMap, file_headers: &HeaderMap) {
    for (name, value) in file_headers {
        headers.insert(name.clone(), value.clone());
    }
}

fn range_not_satisfiable(mut headers: HeaderMap, len: u64) -> Response {
    if let Ok(value) = HeaderValue::from_str(&range::content_range_unsatisfiable(len)) {
        headers.insert(CONTENT_RANGE, value);
    }
    Response {
        status: StatusCode::RANGE_NOT_SATISFIABLE,
        headers,
        body: Bytes::new(),
    }
}

/// Runs the full GET/HEAD state machine against one content generation:
/// conditionals first, then range evaluation and body selection.
pub fn read_response(
    req: &HeaderMap,
    contents: &Bytes,
    file_headers: &HeaderMap,
    mtime_i: (SystemTime, u32),
    head: bool,
    cfg: &ProtocolConfig,
) -> Response {
    let now = SystemTime::now();
    let etag = etag_value(mtime_i);
    let mut headers = base_headers(cfg, &etag, mtime_i.0, now);

    match cache_status(req, &etag, mtime_i.0, now, cfg.clock_skew_max) {
        CacheStatus::NotModified => {
            return Response {
                status: StatusCode::NOT_MODIFIED,
                headers,
                body: Bytes::new(),
            };
        }
        CacheStatus::PreconditionFailed => {
            return Response {
                status: StatusCode::PRECONDITION_FAILED,
                headers,
                body: Bytes::new(),
            };
        }
        CacheStatus::Proceed => {}
    }

    let len = contents.len() as u64;
    let (status, body) = match range::parse(req) {
        RangeHeader::None => {
            extend(&mut headers, file_headers);
            (StatusCode::OK, contents.clone())
        }
        RangeHeader::NotBytes => return range_not_satisfiable(headers, len),
        RangeHeader::Malformed => {
            return Response {
                status: StatusCode::BAD_REQUEST,
                headers,
                body: Bytes::new(),
            };
        }
        RangeHeader::Bytes(specs) => match if_range_status(req, &etag, mtime_i.0) {
            IfRangeStatus::Stale => {
                extend(&mut headers, file_headers);
                (StatusCode::GONE, contents.clone())
            }
            IfRangeStatus::Honor => {
                let mut resolved = Vec::with_capacity(specs.len());
                for spec in specs {
                    match range::resolve_read(spec, len) {
                        Some(part) => resolved.push(part),
                        None => return range_not_satisfiable(headers, len),
                    }
                }
                if let [(start, end)] = resolved[..] {
                    headers.insert(CONTENT_TYPE, HeaderValue::from_static(OCTET_STREAM));
                    if let Ok(value) = HeaderValue::from_str(&range::content_range(start, end, len))
                    {
                        headers.insert(CONTENT_RANGE, value);
                    }
                    (
                        StatusCode::PARTIAL_CONTENT,
                        contents.slice(start as usize..=end as usize),
                    )
                } else {
                    let boundary = range::boundary();
                    if let Ok(value) = HeaderValue::from_str(&format!(
                        "multipart/byteranges; boundary={boundary}"
                    )) {
                        headers.insert(CONTENT_TYPE, value);
                    }
                    let body = range::multipart_body(contents, &resolved, &boundary, OCTET_STREAM);
                    (StatusCode::PARTIAL_CONTENT, body)
                }
            }
        },
    };

    Response {
        status,
        headers,
        body: if head { Bytes::new() } else { body },
    }
}

/// `Allow` reply for OPTIONS: the uppercased method tails of every
/// endpoint under the path.
pub fn options_response(methods: &[String], cfg: &ProtocolConfig) -> Response {
    let mut headers = HeaderMap::new();
    insert_date(&mut headers, DATE, SystemTime::now());
    if cfg.http_methods {
        headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    }
    let allow = methods
        .iter()
        .map(|tag| tag.to_ascii_uppercase())
        .collect::<Vec<_>>()
        .join(", ");
    if let Ok(value) = HeaderValue::from_str(&allow) {
        headers.insert(ALLOW, value);
    }
    Response {
        status: StatusCode::OK,
        headers,
        body: Bytes::new(),
    }
}

/// Precomputed per-file response headers: content-type by extension and
/// an attachment disposition, each behind its toggle.
pub fn file_headers(filename: &str, use_content_types: bool, use_disposition: bool) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if use_content_types {
        let mime = mime_guess::from_path(filename).first_or_octet_stream();
        if let Ok(value) = HeaderValue::from_str(mime.essence_str()) {
            headers.insert(CONTENT_TYPE, value);
        }
    }
    if use_disposition {
        let basename = filename.rsplit('/').next().unwrap_or(filename);
        if let Ok(value) = HeaderValue::from_str(&format!("attachment; filename=\"{basename}\"")) {
            headers.insert(CONTENT_DISPOSITION, value);
        }
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn cfg() -> ProtocolConfig {
        ProtocolConfig {
            cache_seconds: None,
            use_expires: false,
            clock_skew_max: Duration::from_secs(300),
            http_methods: true,
        }
    }

    fn mtime() -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000)
    }

    fn req(name: HeaderName, value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(name, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn etags_differ_across_generations() {
        let first = etag_value((mtime(), 0));
        let same_second = etag_value((mtime(), 1));
        let later = etag_value((mtime() + Duration::from_secs(1), 0));
        assert_ne!(first, same_second);
        assert_ne!(first, later);
    }

    #[test]
    fn if_none_match_star_is_not_modified() {
        let status = cache_status(
            &req(IF_NONE_MATCH, "*"),
            "abc",
            mtime(),
            mtime(),
            Duration::from_secs(300),
        );
        assert_eq!(status, CacheStatus::NotModified);
    }

    #[test]
    fn if_none_match_matches_by_substring() {
        let etag = etag_value((mtime(), 0));
        let header = format!("\"{etag}\"");
        let status = cache_status(
            &req(IF_NONE_MATCH, &header),
            &etag,
            mtime(),
            mtime(),
            Duration::from_secs(300),
        );
        assert_eq!(status, CacheStatus::NotModified);
    }

    #[test]
    fn if_match_mismatch_fails_the_precondition() {
        let status = cache_status(
            &req(IF_MATCH, "\"different\""),
            "abc",
            mtime(),
            mtime(),
            Duration::from_secs(300),
        );
        assert_eq!(status, CacheStatus::PreconditionFailed);
    }

    #[test]
    fn unmodified_since_date_is_not_modified() {
        let date = httpdate::fmt_http_date(mtime() + Duration::from_secs(10));
        let status = cache_status(
            &req(IF_MODIFIED_SINCE, &date),
            "abc",
            mtime(),
            mtime() + Duration::from_secs(20),
            Duration::from_secs(300),
        );
        assert_eq!(status, CacheStatus::NotModified);
    }

    #[test]
    fn future_date_beyond_skew_ceiling_proceeds() {
        let now = mtime();
        let date = httpdate::fmt_http_date(now + Duration::from_secs(3600));
        let status = cache_status(
            &req(IF_MODIFIED_SINCE, &date),
            "abc",
            mtime(),
            now,
            Duration::from_secs(300),
        );
        assert_eq!(status, CacheStatus::Proceed);
    }

    #[test]
    fn unparseable_date_falls_through() {
        let status = cache_status(
            &req(IF_MODIFIED_SINCE, "not a date"),
            "abc",
            mtime(),
            mtime(),
            Duration::from_secs(300),
        );
        assert_eq!(status, CacheStatus::Proceed);
    }

    #[test]
    fn if_unmodified_since_fails_when_unmodified() {
        let date = httpdate::fmt_http_date(mtime() + Duration::from_secs(5));
        let status = cache_status(
            &req(IF_UNMODIFIED_SINCE, &date),
            "abc",
            mtime(),
            mtime() + Duration::from_secs(10),
            Duration::from_secs(300),
        );
        assert_eq!(status, CacheStatus::PreconditionFailed);
    }

    #[test]
    fn full_read_carries_validators_and_accept_ranges() {
        let contents = Bytes::from_static(b"abc");
        let response = read_response(
            &HeaderMap::new(),
            &contents,
            &HeaderMap::new(),
            (mtime(), 0),
            false,
            &cfg(),
        );
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body.as_ref(), b"abc");
        assert!(response.headers.contains_key(ETAG));
        assert!(response.headers.contains_key(LAST_MODIFIED));
        assert!(response.headers.contains_key(DATE));
        assert_eq!(response.header("accept-ranges"), Some("bytes"));
    }

    #[test]
    fn single_range_is_partial_content() {
        let contents = Bytes::from_static(b"abc");
        let response = read_response(
            &req(http::header::RANGE, "bytes=0-0"),
            &contents,
            &HeaderMap::new(),
            (mtime(), 0),
            false,
            &cfg(),
        );
        assert_eq!(response.status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.header("content-range"), Some("bytes 0-0/3"));
        assert_eq!(response.header("content-type"), Some(OCTET_STREAM));
        assert_eq!(response.body.as_ref(), b"a");
    }

    #[test]
    fn multiple_ranges_are_multipart() {
        let contents = Bytes::from_static(b"abc");
        let response = read_response(
            &req(http::header::RANGE, "bytes=0-0,2-2"),
            &contents,
            &HeaderMap::new(),
            (mtime(), 0),
            false,
            &cfg(),
        );
        assert_eq!(response.status, StatusCode::PARTIAL_CONTENT);
        let content_type = response.header("content-type").unwrap();
        assert!(content_type.starts_with("multipart/byteranges; boundary="));
        let text = std::str::from_utf8(&response.body).unwrap();
        assert!(text.contains("bytes 0-0/3"));
        assert!(text.contains("bytes 2-2/3"));
    }

    #[test]
    fn unsatisfiable_range_reports_total_length() {
        let contents = Bytes::from_static(b"abc");
        let response = read_response(
            &req(http::header::RANGE, "bytes=5-9"),
            &contents,
            &HeaderMap::new(),
            (mtime(), 0),
            false,
            &cfg(),
        );
        assert_eq!(response.status, StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(response.header("content-range"), Some("bytes */3"));
        assert_eq!(response.header("accept-ranges"), Some("bytes"));
    }

    #[test]
    fn stale_if_range_is_gone_with_full_body() {
        let contents = Bytes::from_static(b"abc");
        let mut headers = req(http::header::RANGE, "bytes=0-0");
        headers.insert(IF_RANGE, HeaderValue::from_static("\"stale\""));
        let response = read_response(
            &headers,
            &contents,
            &HeaderMap::new(),
            (mtime(), 0),
            false,
            &cfg(),
        );
        assert_eq!(response.status, StatusCode::GONE);
        assert_eq!(response.body.as_ref(), b"abc");
    }

    #[test]
    fn matching_if_range_is_honored() {
        let contents = Bytes::from_static(b"abc");
        let etag = etag_value((mtime(), 0));
        let mut headers = req(http::header::RANGE, "bytes=1-2");
        headers.insert(IF_RANGE, HeaderValue::from_str(&etag).unwrap());
        let response = read_response(
            &headers,
            &contents,
            &HeaderMap::new(),
            (mtime(), 0),
            false,
            &cfg(),
        );
        assert_eq!(response.status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.body.as_ref(), b"bc");
    }

    #[test]
    fn head_strips_the_body() {
        let contents = Bytes::from_static(b"abc");
        let response = read_response(
            &HeaderMap::new(),
            &contents,
            &HeaderMap::new(),
            (mtime(), 0),
            true,
            &cfg(),
        );
        assert_eq!(response.status, StatusCode::OK);
        assert!(response.body.is_empty());
    }

    #[test]
    fn cache_control_max_age_without_expires() {
        let mut config = cfg();
        config.cache_seconds = Some(60);
        let headers = base_headers(&config, "abc", mtime(), mtime());
        assert_eq!(
            headers.get(CACHE_CONTROL).unwrap(),
            "public,max-age=60"
        );
        assert!(!headers.contains_key(EXPIRES));
    }

    #[test]
    fn cache_control_public_with_expires() {
        let mut config = cfg();
        config.cache_seconds = Some(60);
        config.use_expires = true;
        let headers = base_headers(&config, "abc", mtime(), mtime());
        assert_eq!(headers.get(CACHE_CONTROL).unwrap(), "public");
        assert!(headers.contains_key(EXPIRES));
    }

    #[test]
    fn options_uppercases_method_tails() {
        let response = options_response(
            &["get".to_string(), "head".to_string(), "options".to_string()],
            &cfg(),
        );
        assert_eq!(response.header("allow"), Some("GET, HEAD, OPTIONS"));
    }

    #[test]
    fn file_headers_follow_the_toggles() {
        let headers = file_headers("docs/report.html", true, true);
        assert_eq!(headers.get(CONTENT_TYPE).unwrap(), "text/html");
        assert_eq!(
            headers.get(CONTENT_DISPOSITION).unwrap(),
            "attachment; filename=\"report.html\""
        );
        assert!(file_headers("docs/report.html", false, false).is_empty());
    }
}
