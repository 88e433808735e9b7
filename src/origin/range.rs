use bytes::{BufMut, Bytes, BytesMut};
use http::HeaderMap;
use http::header::RANGE;

/// One byte-range specification from a `Range` header or a range-write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeSpec {
    /// Explicit start and end; a negative start counts back from EOF.
    Span(i64, u64),
    /// Start with no end: from `start` to EOF, or the last `-start` bytes
    /// when negative.
    From(i64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangeHeader {
    None,
    Bytes(Vec<RangeSpec>),
    NotBytes,
    Malformed,
}

pub fn parse(headers: &HeaderMap) -> RangeHeader {
    let Some(value) = headers.get(RANGE) else {
        return RangeHeader::None;
    };
    let Ok(value) = value.to_str() else {
        return RangeHeader::Malformed;
    };
    let Some((unit, specs)) = value.split_once('=') else {
        return RangeHeader::Malformed;
    };
    if !unit.trim().eq_ignore_ascii_case("bytes") {
        return RangeHeader::NotBytes;
    }

    let mut ranges = Vec::new();
    for part in specs.split(',') {
        let part = part.trim();
        let Some(spec) = parse_spec(part) else {
            return RangeHeader::Malformed;
        };
        ranges.push(spec);
    }
    if ranges.is_empty() {
        return RangeHeader::Malformed;
    }
    RangeHeader::Bytes(ranges)
}

fn parse_spec(part: &str) -> Option<RangeSpec> {
    if let Some(suffix) = part.strip_prefix('-') {
        // "-N": the final N bytes.
        let n: i64 = suffix.parse().ok().filter(|n| *n > 0)?;
        return Some(RangeSpec::From(-n));
    }
    match part.split_once('-') {
        Some((start, "")) => {
            let start: i64 = start.trim().parse().ok()?;
            Some(RangeSpec::From(start))
        }
        Some((start, end)) => {
            let start: i64 = start.trim().parse().ok()?;
            let end: u64 = end.trim().parse().ok()?;
            Some(RangeSpec::Span(start, end))
        }
        None => None,
    }
}

fn offset_from(start: i64, len: u64) -> Option<u64> {
    if start < 0 {
        len.checked_sub(start.unsigned_abs())
    } else {
        Some(start as u64)
    }
}

/// Resolves a range against read contents of length `len`. `None` marks
/// the range unsatisfiable: the caller answers 416 with `bytes */len`.
pub fn resolve_read(spec: RangeSpec, len: u64) -> Option<(u64, u64)> {
    if len == 0 {
        return None;
    }
    let (start, end) = match spec {
        RangeSpec::Span(start, end) => (offset_from(start, len)?, end),
        RangeSpec::From(start) => (offset_from(start, len)?, len - 1),
    };
    (start <= end && end < len).then_some((start, end))
}

/// Resolves a range for a write of `payload_len` bytes against contents
/// currently `len` bytes long. Writes may land at or past EOF (the splice
/// zero-fills); only an inverted range is unsatisfiable. `spec` of `None`
/// is a plain append at EOF.
pub fn resolve_write(spec: Option<RangeSpec>, len: u64, payload_len: u64) -> Option<(u64, u64)> {
    let payload_end = |start: u64| start.saturating_add(payload_len.saturating_sub(1));
    let (start, end) = match spec {
        None => (len, payload_end(len)),
        Some(RangeSpec::Span(start, end)) => (offset_from(start, len)?, end),
        Some(RangeSpec::From(start)) => {
            let start = offset_from(start, len)?;
            (start, payload_end(start))
        }
    };
    (start <= end).then_some((start, end))
}

pub fn content_range(start: u64, end: u64, len: u64) -> String {
    format!("bytes {start}-{end}/{len}")
}

pub fn content_range_unsatisfiable(len: u64) -> String {
    format!("bytes */{len}")
}

pub fn boundary() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Builds a `multipart/byteranges` payload: each resolved range becomes a
/// part carrying its own content-type and content-range.
pub fn multipart_body(
    contents: &[u8],
    parts: &[(u64, u64)],
    boundary: &str,
    part_type: &str,
) -> Bytes {
    let len = contents.len() as u64;
    let mut body = BytesMut::new();
    for (start, end) in parts {
        body.put_slice(format!("--{boundary}\r\n").as_bytes());
        body.put_slice(format!("content-type: {part_type}\r\n").as_bytes());
        body.put_slice(
            format!("content-range: {}\r\n\r\n", content_range(*start, *end, len)).as_bytes(),
        );
        body.put_slice(&contents[*start as usize..=*end as usize]);
        body.put_slice(b"\r\n");
    }
    body.put_slice(format!("--{boundary}--\r\n").as_bytes());
    body.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn headers(range: &str) -> HeaderMap {
        let mut map = HeaderMap::new();
        map.insert(RANGE, HeaderValue::from_str(range).unwrap());
        map
    }

    #[test]
    fn parses_single_and_multiple_ranges() {
        assert_eq!(
            parse(&headers("bytes=0-0")),
            RangeHeader::Bytes(vec![RangeSpec::Span(0, 0)])
        );
        assert_eq!(
            parse(&headers("bytes=0-0,2-2")),
            RangeHeader::Bytes(vec![RangeSpec::Span(0, 0), RangeSpec::Span(2, 2)])
        );
        assert_eq!(
            parse(&headers("bytes=5-")),
            RangeHeader::Bytes(vec![RangeSpec::From(5)])
        );
        assert_eq!(
            parse(&headers("bytes=-3")),
            RangeHeader::Bytes(vec![RangeSpec::From(-3)])
        );
    }

    #[test]
    fn rejects_other_units_and_garbage() {
        assert_eq!(parse(&headers("items=0-1")), RangeHeader::NotBytes);
        assert_eq!(parse(&headers("bytes=a-b")), RangeHeader::Malformed);
        assert_eq!(parse(&headers("bytes")), RangeHeader::Malformed);
        assert_eq!(parse(&headers("bytes=")), RangeHeader::Malformed);
        assert_eq!(parse(&HeaderMap::new()), RangeHeader::None);
    }

    #[test]
    fn read_resolution_honors_bounds() {
        assert_eq!(resolve_read(RangeSpec::Span(0, 0), 3), Some((0, 0)));
        assert_eq!(resolve_read(RangeSpec::Span(0, 2), 3), Some((0, 2)));
        assert_eq!(resolve_read(RangeSpec::Span(1, 3), 3), None);
        assert_eq!(resolve_read(RangeSpec::Span(2, 1), 3), None);
        assert_eq!(resolve_read(RangeSpec::From(1), 3), Some((1, 2)));
        assert_eq!(resolve_read(RangeSpec::From(-2), 3), Some((1, 2)));
        assert_eq!(resolve_read(RangeSpec::From(-4), 3), None);
        assert_eq!(resolve_read(RangeSpec::Span(0, 0), 0), None);
    }

    #[test]
    fn write_resolution_allows_past_eof() {
        assert_eq!(resolve_write(None, 3, 2), Some((3, 4)));
        assert_eq!(resolve_write(Some(RangeSpec::Span(3, 5)), 0, 3), Some((3, 5)));
        assert_eq!(resolve_write(Some(RangeSpec::From(10)), 3, 4), Some((10, 13)));
        assert_eq!(resolve_write(Some(RangeSpec::From(-2)), 4, 2), Some((2, 3)));
        assert_eq!(resolve_write(Some(RangeSpec::Span(5, 2)), 10, 1), None);
        assert_eq!(resolve_write(Some(RangeSpec::From(-8)), 4, 1), None);
    }

    #[test]
    fn empty_payload_append_resolves_to_zero_length_region() {
        assert_eq!(resolve_write(None, 3, 0), Some((3, 3)));
    }

    #[test]
    fn multipart_parts_carry_their_own_ranges() {
        let body = multipart_body(b"abc", &[(0, 0), (2, 2)], "B", "application/octet-stream");
        let text = std::str::from_utf8(&body).unwrap();
        assert!(text.contains("--B\r\n"));
        assert!(text.contains("content-range: bytes 0-0/3"));
        assert!(text.contains("content-range: bytes 2-2/3"));
        assert!(text.contains("\r\n\r\na\r\n"));
        assert!(text.contains("\r\n\r\nc\r\n"));
        assert!(text.ends_with("--B--\r\n"));
    }
}
