//! `$Variable$` / `$Variable%0Wd$` substitution for `SegmentTemplate`
//! `media` and `initialization` attributes, including the zero-vs-space
//! padding flag and the "RepresentationID is never padded" rule from the
//! DASH-IF interoperability guidelines.

use std::collections::HashMap;

use lazy_static::lazy_static;
use regex::Regex;

const DOLLAR_SENTINEL: &str = "\u{0}DOLLAR\u{0}";

const KNOWN_VARS: [&str; 4] = ["RepresentationID", "Number", "Time", "Bandwidth"];

lazy_static! {
    // One (simple-ident, format-spec-regex) pair per known variable name.
    static ref TEMPLATE_IDS: Vec<(&'static str, String, Regex)> = KNOWN_VARS
        .iter()
        .map(|k| {
            let ident = format!("${k}$");
            // $Var%0W<diouxX>$ or $Var%W<diouxX>$ (zero flag optional)
            let re = Regex::new(&format!(r"\${k}%(0)?([0-9]+)[diouxX]\$")).unwrap();
            (*k, ident, re)
        })
        .collect();
}

/// Parameter values available for substitution. Absent values leave the
/// corresponding `$Var$` token untouched (as if it were unknown).
#[derive(Debug, Default, Clone)]
pub struct TemplateParams<'a> {
    pub representation_id: Option<&'a str>,
    pub number: Option<u64>,
    pub time: Option<u64>,
    pub bandwidth: Option<u64>,
}

impl<'a> TemplateParams<'a> {
    fn value_for(&self, var: &str) -> Option<String> {
        match var {
            "RepresentationID" => self.representation_id.map(String::from),
            "Number" => self.number.map(|n| n.to_string()),
            "Time" => self.time.map(|t| t.to_string()),
            "Bandwidth" => self.bandwidth.map(|b| b.to_string()),
            _ => None,
        }
    }
}

/// Fill in a `SegmentTemplate` media/initialization template string.
pub fn resolve_url_template(template: &str, params: &TemplateParams) -> String {
    let mut result = template.replace("$$", DOLLAR_SENTINEL);

    for (var, ident, format_re) in TEMPLATE_IDS.iter() {
        let Some(value) = params.value_for(var) else { continue };

        // Format spec first: `$Number%04d$` etc. RepresentationID is never
        // padded, so substitute its raw value even when a format spec is
        // present around it.
        if let Some(cap) = format_re.captures(&result) {
            let padded = if *var == "RepresentationID" {
                value.clone()
            } else {
                let width: usize = cap[2].parse().unwrap_or(0);
                let zero_padded = cap.get(1).is_some();
                if zero_padded {
                    format!("{:0>width$}", value, width = width)
                } else {
                    format!("{:>width$}", value, width = width)
                }
            };
            let m = format_re.find(&result).unwrap();
            result = format!("{}{}{}", &result[..m.start()], padded, &result[m.end()..]);
        }

        // Then the bare token, which may still be present alongside (or
        // instead of) a format spec elsewhere in the template.
        if result.contains(ident) {
            result = result.replace(ident, &value);
        }
    }

    result.replace(DOLLAR_SENTINEL, "$")
}

/// Build a `HashMap`-based parameter table, kept for callers that prefer the
/// simpler lookup interface used while diffing segments across polls.
pub fn params<'a>(
    representation_id: &'a str,
    number: Option<u64>,
    time: Option<u64>,
    bandwidth: Option<u64>,
) -> TemplateParams<'a> {
    TemplateParams {
        representation_id: Some(representation_id),
        number,
        time,
        bandwidth,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn zero_padded_number() {
        let p = params("r", Some(7), Some(0), Some(1));
        let out = resolve_url_template("video/$Number%04d$.m4s", &p);
        assert_eq!(out, "video/0007.m4s");
    }

    #[test]
    fn space_padded_without_zero_flag() {
        let p = params("r", Some(7), Some(0), Some(1));
        let out = resolve_url_template("video/$Number%4d$.m4s", &p);
        assert_eq!(out, "video/   7.m4s");
    }

    #[test]
    fn dollar_escape_survives() {
        let p = params("r", Some(7), Some(0), Some(1));
        let out = resolve_url_template("price_$$_$Number$.m4s", &p);
        assert_eq!(out, "price_$_7.m4s");
    }

    #[test]
    fn unknown_variable_left_verbatim() {
        let p = params("r", Some(7), Some(0), Some(1));
        let out = resolve_url_template("$Unknown$/$Number$.m4s", &p);
        assert_eq!(out, "$Unknown$/7.m4s");
    }

    #[test]
    fn representation_id_never_padded() {
        let p = params("abc", None, None, None);
        let out = resolve_url_template("$RepresentationID%04d$/init.mp4", &p);
        assert_eq!(out, "abc/init.mp4");
    }

    #[test]
    fn bare_tokens_all_substituted() {
        let p = params("r", Some(7), Some(0), Some(1));
        let out = resolve_url_template(
            "$RepresentationID$/$Number$/$Time$/$Bandwidth$",
            &p,
        );
        assert_eq!(out, "r/7/0/1");
    }
}
