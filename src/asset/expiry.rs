//! Expiry detection for presigned download URLs.
//!
//! Two encodings are understood:
//! - `Expires=<unix seconds>` (CloudFront-style signed URLs)
//! - `X-Amz-Date=<yyyymmddThhmmssZ>` plus `X-Amz-Expires=<seconds>` (S3 SigV4)
//!
//! An expiry that cannot be parsed is treated as "does not expire".

use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use tracing::warn;
use url::Url;

const EXPIRES_PARAM: &str = "Expires";
const AMZ_DATE_PARAM: &str = "X-Amz-Date";
const AMZ_EXPIRES_PARAM: &str = "X-Amz-Expires";

/// Format of the `X-Amz-Date` parameter, e.g. `20220222T213351Z`
const AMZ_DATE_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Expiry instant encoded in a presigned URL, if any
pub fn expiry_from_url(url: &Url) -> Option<DateTime<Utc>> {
    let mut expires = None;
    let mut amz_date = None;
    let mut amz_expires = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            EXPIRES_PARAM => expires = Some(value.into_owned()),
            AMZ_DATE_PARAM => amz_date = Some(value.into_owned()),
            AMZ_EXPIRES_PARAM => amz_expires = Some(value.into_owned()),
            _ => {}
        }
    }

    if let Some(expires) = expires {
        return match expires.trim().parse::<i64>() {
            Ok(seconds) => Utc.timestamp_opt(seconds, 0).single(),
            Err(_) => {
                warn!(value = %expires, "Failed to parse Expires parameter");
                None
            }
        };
    }

    let (amz_date, amz_expires) = (amz_date?, amz_expires?);
    let base = match parse_amz_date(&amz_date) {
        Some(base) => base,
        None => {
            warn!(value = %amz_date, "Failed to parse X-Amz-Date parameter");
            return None;
        }
    };
    let seconds_to_live = match amz_expires.trim().parse::<i64>() {
        Ok(seconds) => seconds,
        Err(_) => {
            warn!(value = %amz_expires, "Failed to parse X-Amz-Expires parameter");
            return None;
        }
    };

    base.checked_add_signed(Duration::try_seconds(seconds_to_live)?)
}

/// Whether a presigned URL is past its encoded expiry at `now`.
///
/// URLs without a parseable expiry never report as expired.
pub fn has_expired(url: &Url, now: DateTime<Utc>) -> bool {
    match expiry_from_url(url) {
        Some(expiry) => expiry < now,
        None => false,
    }
}

fn parse_amz_date(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value.trim(), AMZ_DATE_FORMAT)
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}
