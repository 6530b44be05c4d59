//! Conversion of instants to the local time expected by the payment gateway.

use time::{
    OffsetDateTime, UtcOffset, format_description::BorrowedFormatItem, macros::format_description,
};
use time_tz::{Offset, TimeZone};

/// The `YYYYMMDDHHmmss` format the gateway uses for request timestamps.
const GATEWAY_TIMESTAMP_FORMAT: &[BorrowedFormatItem] =
    format_description!("[year][month][day][hour][minute][second]");

/// Get the UTC offset of `canonical_timezone` (e.g. "Africa/Nairobi") at `at`.
///
/// Returns `None` if the timezone name is not a canonical timezone name.
pub fn get_offset_at(canonical_timezone: &str, at: OffsetDateTime) -> Option<UtcOffset> {
    time_tz::timezones::get_by_name(canonical_timezone)
        .map(|tz| tz.get_offset_utc(&at).to_utc())
}

/// Format `at` as a gateway timestamp in the local time of `canonical_timezone`.
///
/// Falls back to UTC, with a warning, if the timezone is not recognised.
pub fn gateway_timestamp(canonical_timezone: &str, at: OffsetDateTime) -> String {
    let offset = get_offset_at(canonical_timezone, at).unwrap_or_else(|| {
        tracing::warn!("Unknown timezone \"{canonical_timezone}\", using UTC for gateway timestamps.");
        UtcOffset::UTC
    });

    at.to_offset(offset)
        .format(GATEWAY_TIMESTAMP_FORMAT)
        .unwrap_or_else(|error| {
            tracing::error!("Could not format gateway timestamp for {at}: {error}");
            String::new()
        })
}
