//! Normalization of Kenyan mobile numbers to the `254XXXXXXXXX` form the
//! payment gateway requires.

use std::fmt::Display;

use serde::Serialize;

use crate::Error;

const COUNTRY_CODE: &str = "254";
/// The number of digits after the country code.
const SUBSCRIBER_LENGTH: usize = 9;

/// A phone number in the canonical international form, e.g. `254712345678`.
///
/// To create a `PhoneNumber`, use [PhoneNumber::parse].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct PhoneNumber(String);

impl PhoneNumber {
    /// Normalize `raw` into the canonical form.
    ///
    /// Accepts the local format (`0712345678`), the international format with
    /// or without a plus (`254712345678`, `+254712345678`) and the bare
    /// subscriber number (`712345678`). Spaces and dashes are ignored. The
    /// subscriber number must start with 7 or 1.
    ///
    /// # Errors
    /// Returns [Error::InvalidPhoneNumber] for any other shape.
    pub fn parse(raw: &str) -> Result<Self, Error> {
        let digits: String = raw
            .trim()
            .trim_start_matches('+')
            .chars()
            .filter(|c| !matches!(c, ' ' | '-'))
            .collect();

        if !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(Error::InvalidPhoneNumber(raw.to_owned()));
        }

        let subscriber = if digits.len() == SUBSCRIBER_LENGTH + 1 && digits.starts_with('0') {
            &digits[1..]
        } else if digits.len() == SUBSCRIBER_LENGTH + COUNTRY_CODE.len()
            && digits.starts_with(COUNTRY_CODE)
        {
            &digits[COUNTRY_CODE.len()..]
        } else if digits.len() == SUBSCRIBER_LENGTH {
            &digits[..]
        } else {
            return Err(Error::InvalidPhoneNumber(raw.to_owned()));
        };

        if !(subscriber.starts_with('7') || subscriber.starts_with('1')) {
            return Err(Error::InvalidPhoneNumber(raw.to_owned()));
        }

        Ok(Self(format!("{COUNTRY_CODE}{subscriber}")))
    }

    /// The phone number as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for PhoneNumber {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Display for PhoneNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}
