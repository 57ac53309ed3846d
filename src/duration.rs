//! Parsing of ISO 8601 / xs:duration strings (`PnYnMnDTnHnMnS`), as used for
//! `@mediaPresentationDuration`, `@minimumUpdatePeriod` and `@duration` on
//! `Period` elements.
//!
//! Years are approximated as 365 days and months as 30 days.

/// Parse an xs:duration string into a number of seconds.
///
/// Unparsable strings produce `0.0` rather than an error: callers treat a
/// missing/garbled duration the same way as an absent one.
pub fn parse_xs_duration(s: &str) -> f64 {
    match iso8601::duration(s) {
        Ok(iso8601::Duration::Weeks(w)) => (w as f64) * 7.0 * 86_400.0,
        Ok(iso8601::Duration::YMDHMS { year, month, day, hour, minute, second, millisecond }) => {
            let mut secs = second as f64;
            secs += minute as f64 * 60.0;
            secs += hour as f64 * 3600.0;
            secs += day as f64 * 86_400.0;
            secs += month as f64 * 30.0 * 86_400.0;
            secs += year as f64 * 365.0 * 86_400.0;
            secs += millisecond as f64 / 1000.0;
            secs
        }
        Err(_) => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn short_form_hms() {
        assert_eq!(parse_xs_duration("PT8S"), 8.0);
        assert_eq!(parse_xs_duration("PT1M30.5S"), 90.5);
        assert_eq!(parse_xs_duration("PT0H0M30.030S"), 30.03);
    }

    #[test]
    fn full_form() {
        // 1 day, 2 hours
        assert_eq!(parse_xs_duration("P1DT2H"), 86_400.0 + 2.0 * 3600.0);
    }

    #[test]
    fn months_and_years_use_30_and_365_day_approximation() {
        assert_eq!(parse_xs_duration("P1Y"), 365.0 * 86_400.0);
        assert_eq!(parse_xs_duration("P1M"), 30.0 * 86_400.0);
    }

    #[test]
    fn unparsable_is_zero() {
        assert_eq!(parse_xs_duration(""), 0.0);
        assert_eq!(parse_xs_duration("not a duration"), 0.0);
    }
}
