#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: i64,
    pub end: i64,
    pub partial: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RangeError {
    NotBytes,
    MultiRange,
    Invalid,
}

/// Resolves the requested byte window against the object length. Only a
/// single `bytes=` range is supported; `If-Range` downgrades the request to
/// the full entity. A missing start defaults to 0, a missing end to the
/// last byte, and an end past the object is clamped rather than rejected.
pub fn resolve_range(
    header: Option<&str>,
    has_if_range: bool,
    length: i64,
) -> Result<ByteRange, RangeError> {
    let mut start: i64 = 0;
    let mut end: i64 = length - 1;
    let mut partial = false;

    let header = if has_if_range { None } else { header };
    if let Some(raw) = header {
        let raw = raw.trim();
        if raw.len() < 6 || !raw.as_bytes()[..6].eq_ignore_ascii_case(b"bytes=") {
            return Err(RangeError::NotBytes);
        }
        if raw.contains(',') {
            return Err(RangeError::MultiRange);
        }
        if let Some((lo, hi)) = raw[6..].split_once('-') {
            start = if lo.is_empty() {
                0
            } else {
                lo.trim().parse().map_err(|_| RangeError::Invalid)?
            };
            end = if hi.is_empty() {
                length - 1
            } else {
                hi.trim().parse().map_err(|_| RangeError::Invalid)?
            };
            partial = true;
        }
    }

    if end >= length {
        // apparently, this is legal to request
        end = length - 1;
    }
    if start < 0 || start >= length || end < 0 || start > end {
        return Err(RangeError::Invalid);
    }

    Ok(ByteRange {
        start,
        end,
        partial,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_header_serves_everything() {
        let range = resolve_range(None, false, 1000).unwrap();
        assert_eq!(
            range,
            ByteRange {
                start: 0,
                end: 999,
                partial: false
            }
        );
    }

    #[test]
    fn simple_range() {
        let range = resolve_range(Some("bytes=100-199"), false, 1000).unwrap();
        assert_eq!(
            range,
            ByteRange {
                start: 100,
                end: 199,
                partial: true
            }
        );
    }

    #[test]
    fn open_endpoints_default() {
        let range = resolve_range(Some("bytes=100-"), false, 1000).unwrap();
        assert_eq!(range.end, 999);
        let range = resolve_range(Some("bytes=-500"), false, 1000).unwrap();
        assert_eq!((range.start, range.end), (0, 500));
    }

    #[test]
    fn end_is_clamped_to_length() {
        let range = resolve_range(Some("bytes=900-5000"), false, 1000).unwrap();
        assert_eq!((range.start, range.end), (900, 999));
        assert!(range.partial);
    }

    #[test]
    fn rejects_non_bytes_and_multi_range() {
        assert_eq!(
            resolve_range(Some("items=0-5"), false, 1000),
            Err(RangeError::NotBytes)
        );
        assert_eq!(
            resolve_range(Some("bytes=0-5,10-15"), false, 1000),
            Err(RangeError::MultiRange)
        );
    }

    #[test]
    fn rejects_bad_windows() {
        assert_eq!(
            resolve_range(Some("bytes=500-100"), false, 1000),
            Err(RangeError::Invalid)
        );
        assert_eq!(
            resolve_range(Some("bytes=1000-"), false, 1000),
            Err(RangeError::Invalid)
        );
        assert_eq!(
            resolve_range(Some("bytes=abc-def"), false, 1000),
            Err(RangeError::Invalid)
        );
    }

    #[test]
    fn if_range_downgrades_to_full_entity() {
        let range = resolve_range(Some("bytes=100-199"), true, 1000).unwrap();
        assert_eq!(
            range,
            ByteRange {
                start: 0,
                end: 999,
                partial: false
            }
        );
    }

    #[test]
    fn dashless_spec_serves_everything() {
        let range = resolve_range(Some("bytes=500"), false, 1000).unwrap();
        assert!(!range.partial);
        assert_eq!((range.start, range.end), (0, 999));
    }
}
