//! Paging parameters and per-item pagination across several streams.
//!
//! A page over `N` streams is split evenly: with `per_page = k·N` each stream
//! contributes `k` records, starting at its own offset. An optional overall
//! `limit` caps the number of records across all pages.

use crate::error::{Error, Result};

pub const PARAM_PAGE: &str = "page";
pub const PARAM_PER_PAGE: &str = "per_page";
pub const PARAM_LIMIT: &str = "limit";

pub const DEFAULT_PAGE: usize = 1;
pub const DEFAULT_PER_PAGE: usize = 100;

/// Parse optional `page` and `per_page` query values, applying defaults
pub fn parse_paging(
    page: Option<&str>,
    per_page: Option<&str>,
    max_per_page: usize,
) -> Result<(usize, usize)> {
    let parse = |name: &str, raw: Option<&str>, default: usize| -> Result<usize> {
        match raw.filter(|s| !s.is_empty()) {
            None => Ok(default),
            Some(s) => s
                .parse::<i64>()
                .map_err(|_| Error::bad_request(format!("invalid value for parameter {name}: {s}")))
                .and_then(|v| {
                    usize::try_from(v).map_err(|_| {
                        Error::bad_request(format!("{name} must be greater than or equal to 1"))
                    })
                }),
        }
    };
    let page = parse(PARAM_PAGE, page, DEFAULT_PAGE)?;
    let per_page = parse(PARAM_PER_PAGE, per_page, DEFAULT_PER_PAGE)?;
    validate_paging(page, per_page, max_per_page)?;
    Ok((page, per_page))
}

pub fn validate_paging(page: usize, per_page: usize, max_per_page: usize) -> Result<()> {
    if page < 1 {
        return Err(Error::bad_request(format!(
            "{PARAM_PAGE} number must be greater than or equal to 1"
        )));
    }
    if per_page < 1 {
        return Err(Error::bad_request(format!(
            "{PARAM_PER_PAGE} must be greater than or equal to 1"
        )));
    }
    if per_page > max_per_page {
        return Err(Error::bad_request(format!(
            "{PARAM_PER_PAGE} must be less than or equal to max({max_per_page})"
        )));
    }
    Ok(())
}

/// Index range of a page within `total` ordered items
pub fn page_range(page: usize, per_page: usize, total: usize) -> std::ops::Range<usize> {
    let start = page.saturating_sub(1).saturating_mul(per_page).min(total);
    let end = start.saturating_add(per_page).min(total);
    start..end
}

fn round_up(value: usize, multiple: usize) -> usize {
    value.div_ceil(multiple) * multiple
}

/// Check the preconditions of [`per_item_pagination`]
pub fn validate_per_item_limit(
    limit: Option<usize>,
    per_page: usize,
    num_streams: usize,
) -> Result<()> {
    if num_streams == 0 {
        return Err(Error::bad_request("no streams to query"));
    }
    if let Some(limit) = limit {
        if limit == 0 {
            return Err(Error::bad_request(format!("{PARAM_LIMIT} must be positive")));
        }
        if limit % num_streams != 0 {
            return Err(Error::bad_request(format!(
                "{PARAM_LIMIT} must be divisible by the number of queried sources. E.g. {PARAM_LIMIT}={}",
                round_up(limit, num_streams)
            )));
        }
    }
    if per_page % num_streams != 0 {
        return Err(Error::bad_request(format!(
            "{PARAM_PER_PAGE} must be divisible by the number of queried sources. E.g. {PARAM_PER_PAGE}={}",
            round_up(per_page, num_streams)
        )));
    }
    Ok(())
}

/// Offsets past the end of any table collapse to `i64::MAX`
fn clamp_offset(value: i128) -> usize {
    usize::try_from(value.clamp(0, i128::from(i64::MAX))).unwrap_or(usize::MAX)
}

/// Per-stream `(limit, offset)` pairs for one page
///
/// `page` is 1-based. Values that are not multiples of `num_streams` are
/// rounded up first; the last stream absorbs any remainder. Arithmetic runs in
/// `i128` so any `page` accepted by [`parse_paging`] yields an empty slice
/// rather than an overflow.
pub fn per_item_pagination(
    limit: Option<usize>,
    page: usize,
    per_page: usize,
    num_streams: usize,
) -> Vec<(usize, usize)> {
    if num_streams == 0 {
        return Vec::new();
    }
    let n = num_streams as i128;
    let page = page.saturating_sub(1) as i128;
    let per_page = round_up(per_page, num_streams) as i128;
    let limit = limit.map(|l| round_up(l, num_streams) as i128);

    // records available on this page
    let mut page_limit = per_page;
    if let Some(limit) = limit {
        if limit - page * per_page < per_page {
            page_limit = (limit - page * per_page).max(0);
        }
    }
    let per_item = (page_limit + n - 1) / n;
    let padding = page_limit - n * per_item;

    // page size ignoring the current page number
    let stride_limit = match limit {
        Some(limit) if limit < per_page => limit,
        _ => per_page,
    };
    let offset = page * ((stride_limit + n - 1) / n);

    (0..num_streams)
        .map(|i| {
            if i + 1 == num_streams {
                (
                    clamp_offset(per_item + padding),
                    clamp_offset(offset + page * padding),
                )
            } else {
                (clamp_offset(per_item), clamp_offset(offset))
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_paging_defaults() {
        assert_eq!(parse_paging(None, None, 1000).unwrap(), (1, 100));
        assert_eq!(parse_paging(Some("3"), Some("20"), 1000).unwrap(), (3, 20));
    }

    #[test]
    fn test_parse_paging_rejects_out_of_range() {
        assert!(parse_paging(Some("0"), None, 100).is_err());
        assert!(parse_paging(None, Some("0"), 100).is_err());
        assert!(parse_paging(None, Some("101"), 100).is_err());
        assert!(parse_paging(Some("-1"), None, 100).is_err());
        assert!(parse_paging(Some("abc"), None, 100).is_err());
    }

    #[test]
    fn test_page_range() {
        assert_eq!(page_range(1, 10, 25), 0..10);
        assert_eq!(page_range(3, 10, 25), 20..25);
        assert_eq!(page_range(4, 10, 25), 25..25);
    }

    #[test]
    fn test_validate_per_item_limit() {
        assert!(validate_per_item_limit(None, 10, 2).is_ok());
        assert!(validate_per_item_limit(Some(4), 10, 2).is_ok());

        let err = validate_per_item_limit(None, 10, 3).unwrap_err();
        assert!(err.message().contains("per_page=12"));

        let err = validate_per_item_limit(Some(5), 10, 2).unwrap_err();
        assert!(err.message().contains("limit=6"));

        assert!(validate_per_item_limit(Some(0), 10, 1).is_err());
    }

    #[test]
    fn test_per_item_even_split() {
        assert_eq!(per_item_pagination(None, 1, 10, 2), vec![(5, 0), (5, 0)]);
        assert_eq!(per_item_pagination(None, 3, 10, 2), vec![(5, 10), (5, 10)]);
    }

    #[test]
    fn test_per_item_limit_truncates_last_page() {
        // limit 6 over 2 streams with 4 per page: page 1 gets 2+2, page 2 gets 1+1
        assert_eq!(per_item_pagination(Some(6), 1, 4, 2), vec![(2, 0), (2, 0)]);
        assert_eq!(per_item_pagination(Some(6), 2, 4, 2), vec![(1, 2), (1, 2)]);
        assert_eq!(per_item_pagination(Some(6), 3, 4, 2), vec![(0, 4), (0, 4)]);
    }

    #[test]
    fn test_per_item_single_stream() {
        assert_eq!(per_item_pagination(None, 2, 100, 1), vec![(100, 100)]);
        assert_eq!(per_item_pagination(Some(150), 2, 100, 1), vec![(50, 100)]);
    }

    #[test]
    fn test_per_item_huge_page_does_not_overflow() {
        let (page, per_page) = parse_paging(Some("9223372036854775807"), Some("100"), 1000).unwrap();
        let slices = per_item_pagination(None, page, per_page, 1);
        assert_eq!(slices, vec![(100, i64::MAX as usize)]);

        let slices = per_item_pagination(Some(10), page, per_page, 2);
        assert_eq!(slices, vec![(0, i64::MAX as usize), (0, i64::MAX as usize)]);
    }
}
