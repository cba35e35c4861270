use chrono::{NaiveDate, NaiveTime};
use regex::{Captures, Regex};
use std::sync::OnceLock;

use crate::model::{AmbiguityFlag, ParseOutcome, PartialDate};

const MONTH_NAMES: [&str; 12] = [
    "january",
    "february",
    "march",
    "april",
    "may",
    "june",
    "july",
    "august",
    "september",
    "october",
    "november",
    "december",
];
const EMPTY_MARKERS: &[&str] = &["", "none", "null", "nan", "nat"];

/// Full month name, three-letter abbreviation or `Sept`, any case.
pub fn month_from_name(raw: &str) -> Option<u32> {
    let lower = raw.trim().trim_end_matches('.').to_ascii_lowercase();
    if lower == "sept" {
        return Some(9);
    }
    if lower.len() < 3 {
        return None;
    }
    MONTH_NAMES
        .iter()
        .position(|full| *full == lower || (lower.len() == 3 && full.starts_with(&lower)))
        .map(|idx| idx as u32 + 1)
}

fn cached(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("invalid date grammar regex"))
}

fn time_start_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    cached(&RE, r"(?:^|[\sT,])(\d{1,2}:\d)")
}

fn time_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    cached(
        &RE,
        r"^(\d{1,2}):(\d{2})(?::(\d{2})(?:\.\d{1,9})?)?(?:\s*([AaPp])\.?[Mm]\.?)?$",
    )
}

fn iso_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    cached(&RE, r"^(\d{4})-(\d{1,2})-(\d{1,2})$")
}

fn ymd_numeric_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    cached(&RE, r"^(\d{4})[/.](\d{1,2})[/.](\d{1,2})$")
}

fn ymd_named_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    cached(
        &RE,
        r"^(\d{4})[\s\-/.,]+([A-Za-z]{3,9})[\s\-/.,]+(\d{1,2})(?i:st|nd|rd|th)?$",
    )
}

fn dmy_named_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    cached(
        &RE,
        r"^(\d{1,2})(?i:st|nd|rd|th)?[\s\-/.,]+([A-Za-z]{3,9})[\s\-/.,]+(\d{4})$",
    )
}

fn mdy_named_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    cached(
        &RE,
        r"^([A-Za-z]{3,9})[\s\-/.,]+(\d{1,2})(?i:st|nd|rd|th)?[\s\-/.,]+(\d{4})$",
    )
}

fn numeric_dm_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    cached(&RE, r"^(\d{1,2})[/\-.](\d{1,2})[/\-.](\d{4})$")
}

fn month_year_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    cached(&RE, r"^([A-Za-z]{3,9})[\s\-/.,]*(\d{4})$")
}

fn year_month_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    cached(&RE, r"^(\d{4})[\s\-/.,]*([A-Za-z]{3,9})$")
}

fn numeric_month_year_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    cached(&RE, r"^(\d{1,2})[/\-.](\d{4})$")
}

fn numeric_year_month_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    cached(&RE, r"^(\d{4})[/\-.](\d{1,2})$")
}

fn year_only_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    cached(&RE, r"^(\d{4})$")
}

fn day_only_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    cached(&RE, r"^(\d{1,2})(?i:st|nd|rd|th)?$")
}

fn day_year_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    cached(&RE, r"^(\d{1,2})(?i:st|nd|rd|th)?[\s\-/.,]+(\d{4})$")
}

fn day_month_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    cached(&RE, r"^(\d{1,2})(?i:st|nd|rd|th)?[\s\-/.,]*([A-Za-z]{3,9})$")
}

fn month_day_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    cached(&RE, r"^([A-Za-z]{3,9})[\s\-/.,]*(\d{1,2})(?i:st|nd|rd|th)?$")
}

enum Attempt {
    NoMatch,
    OutOfRange,
    Resolved {
        date: NaiveDate,
        format: &'static str,
        alternatives: Vec<NaiveDate>,
    },
}

fn num(caps: &Captures<'_>, idx: usize) -> Option<u32> {
    caps.get(idx)?.as_str().parse::<u32>().ok()
}

fn resolve(year: u32, month: u32, day: u32, format: &'static str) -> Attempt {
    match i32::try_from(year)
        .ok()
        .and_then(|y| NaiveDate::from_ymd_opt(y, month, day))
    {
        Some(date) => Attempt::Resolved {
            date,
            format,
            alternatives: Vec::new(),
        },
        None => Attempt::OutOfRange,
    }
}

fn try_iso(text: &str) -> Attempt {
    let Some(caps) = iso_re().captures(text) else {
        return Attempt::NoMatch;
    };
    match (num(&caps, 1), num(&caps, 2), num(&caps, 3)) {
        (Some(y), Some(m), Some(d)) => resolve(y, m, d, "iso8601"),
        _ => Attempt::NoMatch,
    }
}

fn try_ymd_numeric(text: &str) -> Attempt {
    let Some(caps) = ymd_numeric_re().captures(text) else {
        return Attempt::NoMatch;
    };
    match (num(&caps, 1), num(&caps, 2), num(&caps, 3)) {
        (Some(y), Some(m), Some(d)) => resolve(y, m, d, "ymd_numeric"),
        _ => Attempt::NoMatch,
    }
}

fn try_named(re: &Regex, text: &str, order: [usize; 3], format: &'static str) -> Attempt {
    let Some(caps) = re.captures(text) else {
        return Attempt::NoMatch;
    };
    let [y_idx, m_idx, d_idx] = order;
    let Some(month) = caps.get(m_idx).and_then(|m| month_from_name(m.as_str())) else {
        return Attempt::NoMatch;
    };
    match (num(&caps, y_idx), num(&caps, d_idx)) {
        (Some(y), Some(d)) => resolve(y, month, d, format),
        _ => Attempt::NoMatch,
    }
}

fn try_ymd_named(text: &str) -> Attempt {
    try_named(ymd_named_re(), text, [1, 2, 3], "ymd_named")
}

fn try_dmy_named(text: &str) -> Attempt {
    try_named(dmy_named_re(), text, [3, 2, 1], "dmy_named")
}

fn try_mdy_named(text: &str) -> Attempt {
    try_named(mdy_named_re(), text, [3, 1, 2], "mdy_named")
}

/// `a/b/YYYY`: day-first wins when both readings are valid, and the
/// month-first reading is reported as an alternative.
fn try_numeric_dm(text: &str) -> Attempt {
    let Some(caps) = numeric_dm_re().captures(text) else {
        return Attempt::NoMatch;
    };
    let (Some(a), Some(b), Some(y)) = (num(&caps, 1), num(&caps, 2), num(&caps, 3)) else {
        return Attempt::NoMatch;
    };
    let Ok(year) = i32::try_from(y) else {
        return Attempt::OutOfRange;
    };
    let day_first = NaiveDate::from_ymd_opt(year, b, a);
    let month_first = NaiveDate::from_ymd_opt(year, a, b);
    match (day_first, month_first) {
        (Some(dmy), Some(mdy)) if dmy != mdy => Attempt::Resolved {
            date: dmy,
            format: "dmy_numeric",
            alternatives: vec![mdy],
        },
        (Some(dmy), _) => Attempt::Resolved {
            date: dmy,
            format: "dmy_numeric",
            alternatives: Vec::new(),
        },
        (None, Some(mdy)) => Attempt::Resolved {
            date: mdy,
            format: "mdy_numeric",
            alternatives: Vec::new(),
        },
        (None, None) => Attempt::OutOfRange,
    }
}

const FULL_GRAMMARS: &[fn(&str) -> Attempt] = &[
    try_iso,
    try_ymd_numeric,
    try_ymd_named,
    try_dmy_named,
    try_mdy_named,
    try_numeric_dm,
];

/// Shapes that are recognizably a date with a field missing. These are
/// never completed here.
fn incomplete_shape(
    text: &str,
) -> Option<(&'static str, &'static [AmbiguityFlag], PartialDate)> {
    use AmbiguityFlag::{MissingDay, MissingMonth, MissingYear};

    let named_month =
        |caps: &Captures<'_>, idx: usize| caps.get(idx).and_then(|m| month_from_name(m.as_str()));
    let year = |caps: &Captures<'_>, idx: usize| num(caps, idx).and_then(|y| i32::try_from(y).ok());
    let day = |caps: &Captures<'_>, idx: usize| num(caps, idx).filter(|d| (1..=31).contains(d));
    let month = |caps: &Captures<'_>, idx: usize| num(caps, idx).filter(|m| (1..=12).contains(m));
    let partial = |year: Option<i32>, month: Option<u32>, day: Option<u32>| PartialDate {
        year,
        month,
        day,
    };

    if let Some(caps) = month_year_re().captures(text) {
        if let Some(m) = named_month(&caps, 1) {
            return Some(("month_year", &[MissingDay], partial(year(&caps, 2), Some(m), None)));
        }
    }
    if let Some(caps) = year_month_re().captures(text) {
        if let Some(m) = named_month(&caps, 2) {
            return Some(("year_month", &[MissingDay], partial(year(&caps, 1), Some(m), None)));
        }
    }
    if let Some(caps) = numeric_month_year_re().captures(text) {
        if let Some(m) = month(&caps, 1) {
            return Some((
                "numeric_month_year",
                &[MissingDay],
                partial(year(&caps, 2), Some(m), None),
            ));
        }
    }
    if let Some(caps) = numeric_year_month_re().captures(text) {
        if let Some(m) = month(&caps, 2) {
            return Some((
                "numeric_year_month",
                &[MissingDay],
                partial(year(&caps, 1), Some(m), None),
            ));
        }
    }
    if let Some(caps) = year_only_re().captures(text) {
        return Some((
            "year_only",
            &[MissingDay, MissingMonth],
            partial(year(&caps, 1), None, None),
        ));
    }
    if let Some(caps) = day_only_re().captures(text) {
        if let Some(d) = day(&caps, 1) {
            return Some((
                "day_only",
                &[MissingMonth, MissingYear],
                partial(None, None, Some(d)),
            ));
        }
    }
    if let Some(caps) = day_year_re().captures(text) {
        if let Some(d) = day(&caps, 1) {
            return Some(("day_year", &[MissingMonth], partial(year(&caps, 2), None, Some(d))));
        }
    }
    if let Some(caps) = day_month_re().captures(text) {
        if let (Some(d), Some(m)) = (day(&caps, 1), named_month(&caps, 2)) {
            return Some(("day_month", &[MissingYear], partial(None, Some(m), Some(d))));
        }
    }
    if let Some(caps) = month_day_re().captures(text) {
        if let (Some(m), Some(d)) = (named_month(&caps, 1), day(&caps, 2)) {
            return Some(("month_day", &[MissingYear], partial(None, Some(m), Some(d))));
        }
    }
    None
}

fn split_time(text: &str) -> (&str, Option<&str>) {
    match time_start_re().captures(text).and_then(|c| c.get(1)) {
        Some(m) => {
            let head = &text[..m.start()];
            let head = match head.strip_suffix('T') {
                Some(rest) if rest.ends_with(|c: char| c.is_ascii_digit()) => rest,
                _ => head,
            };
            (head, Some(text[m.start()..].trim()))
        }
        None => (text, None),
    }
}

/// `HH:MM[:SS[.fff]]` with an optional AM/PM marker, all fields in range.
pub fn parse_time(text: &str) -> Option<NaiveTime> {
    let caps = time_re().captures(text.trim())?;
    let mut hour = num(&caps, 1)?;
    let minute = num(&caps, 2)?;
    let second = match caps.get(3) {
        Some(s) => s.as_str().parse::<u32>().ok()?,
        None => 0,
    };
    if let Some(marker) = caps.get(4) {
        if !(1..=12).contains(&hour) {
            return None;
        }
        let pm = marker.as_str().eq_ignore_ascii_case("p");
        hour = match (pm, hour) {
            (false, 12) => 0,
            (true, 12) => 12,
            (true, h) => h + 12,
            (false, h) => h,
        };
    }
    if hour > 23 || minute > 59 || second > 59 {
        return None;
    }
    NaiveTime::from_hms_opt(hour, minute, second)
}

fn is_empty_marker(text: &str) -> bool {
    let lower = text.trim().to_ascii_lowercase();
    EMPTY_MARKERS.contains(&lower.as_str())
}

/// Resolves a fragment into a calendar date. Never fails: every problem is
/// reported through `resolved_date = None` and the ambiguity flags.
pub fn parse(fragment: &str) -> ParseOutcome {
    let mut outcome = ParseOutcome::default();
    let text = fragment.trim();
    if is_empty_marker(text) {
        outcome.flag(AmbiguityFlag::Empty);
        return outcome;
    }

    let (date_part, time_part) = split_time(text);
    if let Some(time_text) = time_part {
        match parse_time(time_text) {
            Some(time) => outcome.resolved_time = Some(time),
            None => outcome.flag(AmbiguityFlag::TruncatedTime),
        }
    }
    let date_part = date_part
        .trim_end_matches(|c: char| c == ',' || c == '.' || c.is_whitespace())
        .trim_start();
    if date_part.is_empty() {
        return outcome;
    }

    for grammar in FULL_GRAMMARS {
        match grammar(date_part) {
            Attempt::NoMatch => {}
            Attempt::OutOfRange => outcome.flag(AmbiguityFlag::OutOfRange),
            Attempt::Resolved {
                date,
                format,
                alternatives,
            } => {
                if !alternatives.is_empty() {
                    outcome.flag(AmbiguityFlag::ConflictingOrder);
                }
                outcome.resolved_date = Some(date);
                outcome.matched_format = Some(format.to_string());
                outcome.alternatives = alternatives;
                outcome
                    .ambiguity_flags
                    .retain(|f| *f != AmbiguityFlag::OutOfRange);
                return outcome;
            }
        }
    }

    if let Some((format, flags, partial)) = incomplete_shape(date_part) {
        outcome.matched_format = Some(format.to_string());
        outcome.partial = Some(partial);
        for flag in flags {
            outcome.flag(*flag);
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use AmbiguityFlag::*;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid test date")
    }

    #[test]
    fn resolves_common_grammars() {
        let cases = [
            ("23 Feb 2025", "dmy_named", ymd(2025, 2, 23)),
            ("23rd February, 2025", "dmy_named", ymd(2025, 2, 23)),
            ("23-feb-2025", "dmy_named", ymd(2025, 2, 23)),
            ("2025 Feb 23", "ymd_named", ymd(2025, 2, 23)),
            ("Feb 23, 2025", "mdy_named", ymd(2025, 2, 23)),
            ("Sept 1 2025", "mdy_named", ymd(2025, 9, 1)),
            ("2025-02-23", "iso8601", ymd(2025, 2, 23)),
            ("2025/2/3", "ymd_numeric", ymd(2025, 2, 3)),
            ("23/02/2025", "dmy_numeric", ymd(2025, 2, 23)),
            ("02/23/2025", "mdy_numeric", ymd(2025, 2, 23)),
        ];
        for (text, format, expected) in cases {
            let out = parse(text);
            assert_eq!(out.resolved_date, Some(expected), "{text}");
            assert_eq!(out.matched_format.as_deref(), Some(format), "{text}");
            assert!(out.ambiguity_flags.is_empty(), "{text}: {:?}", out.ambiguity_flags);
        }
    }

    #[test]
    fn month_year_is_never_resolved() {
        for text in ["Feb 2025", "February 2025", "2025 Feb", "02/2025", "2025-02", "Feb2025"] {
            let out = parse(text);
            assert_eq!(out.resolved_date, None, "{text}");
            assert_eq!(out.ambiguity_flags, vec![MissingDay], "{text}");
            let partial = out.partial.expect("partial fields");
            assert_eq!((partial.year, partial.month, partial.day), (Some(2025), Some(2), None));
        }
    }

    #[test]
    fn other_incomplete_shapes_are_flagged() {
        assert_eq!(parse("2025").ambiguity_flags, vec![MissingDay, MissingMonth]);
        assert_eq!(parse("24").ambiguity_flags, vec![MissingMonth, MissingYear]);
        assert_eq!(parse("24 2025").ambiguity_flags, vec![MissingMonth]);
        assert_eq!(parse("23 Feb").ambiguity_flags, vec![MissingYear]);
        assert_eq!(parse("Feb 23").ambiguity_flags, vec![MissingYear]);
    }

    #[test]
    fn day_first_wins_but_conflict_is_recorded() {
        let out = parse("03/04/2025");
        assert_eq!(out.resolved_date, Some(ymd(2025, 4, 3)));
        assert_eq!(out.alternatives, vec![ymd(2025, 3, 4)]);
        assert_eq!(out.ambiguity_flags, vec![ConflictingOrder]);

        let same = parse("04/04/2025");
        assert_eq!(same.resolved_date, Some(ymd(2025, 4, 4)));
        assert!(same.ambiguity_flags.is_empty());
    }

    #[test]
    fn malformed_time_is_truncated_to_date() {
        let out = parse("2025 Feb 23 09:05 38");
        assert_eq!(out.resolved_date, Some(ymd(2025, 2, 23)));
        assert_eq!(out.resolved_time, None);
        assert_eq!(out.ambiguity_flags, vec![TruncatedTime]);
    }

    #[test]
    fn valid_time_suffixes_are_kept() {
        let out = parse("2025-02-23T10:15:30");
        assert_eq!(out.resolved_date, Some(ymd(2025, 2, 23)));
        assert_eq!(out.resolved_time, NaiveTime::from_hms_opt(10, 15, 30));
        let pm = parse("23 Feb 2025 9:05 PM");
        assert_eq!(pm.resolved_time, NaiveTime::from_hms_opt(21, 5, 0));
        assert!(pm.ambiguity_flags.is_empty());
    }

    #[test]
    fn impossible_values_never_resolve() {
        let out = parse("32 Feb 2025");
        assert_eq!(out.resolved_date, None);
        assert_eq!(out.ambiguity_flags, vec![OutOfRange]);
        assert_eq!(parse("2025-02-30").resolved_date, None);

        let time_only = parse("13:45:67");
        assert_eq!(time_only.resolved_date, None);
        assert_eq!(time_only.ambiguity_flags, vec![TruncatedTime]);
        assert_eq!(time_only.matched_format, None);
    }

    #[test]
    fn empty_markers_and_garbage() {
        for text in ["", "   ", "None", "NaT", "nan"] {
            assert_eq!(parse(text).ambiguity_flags, vec![Empty], "{text:?}");
        }
        let out = parse("24Feb 2025");
        assert_eq!(out.resolved_date, None);
        assert_eq!(out.matched_format, None);
        assert!(out.ambiguity_flags.is_empty());
    }

    #[test]
    fn uppercase_month_before_time_keeps_its_letters() {
        let out = parse("2025 OCT 10:00");
        assert_eq!(out.matched_format.as_deref(), Some("year_month"));
        assert_eq!(out.ambiguity_flags, vec![MissingDay]);
        assert_eq!(out.resolved_time, NaiveTime::from_hms_opt(10, 0, 0));
    }

    #[test]
    fn month_names_accept_common_spellings() {
        assert_eq!(month_from_name("SEPT"), Some(9));
        assert_eq!(month_from_name("sep"), Some(9));
        assert_eq!(month_from_name("December"), Some(12));
        assert_eq!(month_from_name("Dece"), None);
        assert_eq!(month_from_name("Ma"), None);
    }
}
