use chrono::{Datelike, NaiveDate};
use serde::Serialize;

/// The school's fiscal cycle runs April through March.
pub const MONTH_ORDER: [&str; 12] = [
    "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec", "Jan", "Feb", "Mar",
];

pub fn month_index(token: &str) -> Option<usize> {
    MONTH_ORDER.iter().position(|m| *m == token)
}

/// Academic month token for a calendar date (Apr..Mar cycle).
pub fn academic_month_token(date: NaiveDate) -> &'static str {
    // April is month 4 and position 0 in the cycle.
    let idx = (date.month() as usize + 8) % 12;
    MONTH_ORDER[idx]
}

/// The month sequence from April through the academic month containing `date`.
pub fn months_through(date: NaiveDate) -> &'static [&'static str] {
    let idx = (date.month() as usize + 8) % 12;
    &MONTH_ORDER[..=idx]
}

/// Academic year label, e.g. 2025-08-15 -> "2025-2026", 2026-02-01 -> "2025-2026".
pub fn academic_year_for(date: NaiveDate) -> String {
    let start = if date.month() >= 4 {
        date.year()
    } else {
        date.year() - 1
    };
    format!("{}-{}", start, start + 1)
}

/// Short session label used by the legacy paid_months rows: "2025-2026" -> "2025-26".
pub fn short_session(academic_year: &str) -> String {
    match academic_year.split_once('-') {
        Some((start, end)) if end.len() == 4 => format!("{}-{}", start, &end[2..]),
        _ => academic_year.to_string(),
    }
}

/// How often a fee head is charged within the academic year.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frequency {
    Monthly,
    Quarterly,
    OneTime,
    Annual,
}

impl Frequency {
    pub fn parse(raw: &str) -> Frequency {
        match raw.trim().to_ascii_lowercase().as_str() {
            "quarterly" => Frequency::Quarterly,
            "onetime" | "one-time" | "one time" => Frequency::OneTime,
            "annual" | "yearly" => Frequency::Annual,
            _ => Frequency::Monthly,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Monthly => "Monthly",
            Frequency::Quarterly => "Quarterly",
            Frequency::OneTime => "OneTime",
            Frequency::Annual => "Annual",
        }
    }

    /// Charged at most once per year, regardless of how many months have elapsed.
    pub fn emits_once(&self) -> bool {
        matches!(self, Frequency::OneTime | Frequency::Annual)
    }

    /// Sparse applicability set: the month tokens this head is charged in.
    /// Once-per-year heads are anchored by the caller, not by a month list.
    pub fn applicable_months(&self) -> &'static [&'static str] {
        const QUARTER_STARTS: [&str; 4] = ["Apr", "Jul", "Oct", "Jan"];
        match self {
            Frequency::Quarterly => &QUARTER_STARTS,
            _ => &MONTH_ORDER,
        }
    }
}

/// Amounts are stored and computed in integer paise; rupees exist only at
/// the JSON boundary.
pub fn paise_from_json(v: &serde_json::Value) -> Option<i64> {
    let rupees = v.as_f64()?;
    if !rupees.is_finite() {
        return None;
    }
    Some((rupees * 100.0).round() as i64)
}

pub fn rupees(paise: i64) -> f64 {
    paise as f64 / 100.0
}

/// Rupee amount in words, Indian grouping (crore/lakh), for receipt printing.
pub fn amount_in_words(rupees: i64) -> String {
    if rupees == 0 {
        return "Zero".to_string();
    }
    if rupees < 0 {
        return format!("Minus {}", amount_in_words(-rupees));
    }
    format!("{} Only", words(rupees).trim_end())
}

fn words(mut num: i64) -> String {
    const ONES: [&str; 20] = [
        "", "One", "Two", "Three", "Four", "Five", "Six", "Seven", "Eight", "Nine", "Ten",
        "Eleven", "Twelve", "Thirteen", "Fourteen", "Fifteen", "Sixteen", "Seventeen",
        "Eighteen", "Nineteen",
    ];
    const TENS: [&str; 10] = [
        "", "", "Twenty", "Thirty", "Forty", "Fifty", "Sixty", "Seventy", "Eighty", "Ninety",
    ];

    let mut out = String::new();
    if num >= 10_000_000 {
        out.push_str(&words(num / 10_000_000));
        out.push_str("Crore ");
        num %= 10_000_000;
    }
    if num >= 100_000 {
        out.push_str(&words(num / 100_000));
        out.push_str("Lakh ");
        num %= 100_000;
    }
    if num >= 1_000 {
        out.push_str(&words(num / 1_000));
        out.push_str("Thousand ");
        num %= 1_000;
    }
    if num >= 100 {
        out.push_str(ONES[(num / 100) as usize]);
        out.push_str(" Hundred ");
        num %= 100;
    }
    if num >= 20 {
        out.push_str(TENS[(num / 10) as usize]);
        out.push(' ');
        num %= 10;
    }
    if num > 0 {
        out.push_str(ONES[num as usize]);
        out.push(' ');
    }
    out
}

/// Domain error surfaced through the IPC error envelope.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl LedgerError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn not_found(what: &str) -> Self {
        Self::new("not_found", format!("{} not found", what))
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::new("bad_params", message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new("conflict", message)
    }

    pub fn db(stage: &'static str, e: rusqlite::Error) -> Self {
        Self::new(stage, e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).expect("valid date")
    }

    #[test]
    fn academic_cycle_maps_calendar_months() {
        assert_eq!(academic_month_token(d(2025, 4, 1)), "Apr");
        assert_eq!(academic_month_token(d(2025, 12, 31)), "Dec");
        assert_eq!(academic_month_token(d(2026, 1, 5)), "Jan");
        assert_eq!(academic_month_token(d(2026, 3, 31)), "Mar");
    }

    #[test]
    fn months_through_august_spans_five() {
        let seq = months_through(d(2025, 8, 15));
        assert_eq!(seq, &["Apr", "May", "Jun", "Jul", "Aug"]);
        // February of the following calendar year is eleven months in.
        assert_eq!(months_through(d(2026, 2, 1)).len(), 11);
        assert_eq!(months_through(d(2026, 3, 1)).len(), 12);
    }

    #[test]
    fn academic_year_rolls_over_in_april() {
        assert_eq!(academic_year_for(d(2025, 8, 1)), "2025-2026");
        assert_eq!(academic_year_for(d(2026, 3, 31)), "2025-2026");
        assert_eq!(academic_year_for(d(2026, 4, 1)), "2026-2027");
        assert_eq!(short_session("2025-2026"), "2025-26");
    }

    #[test]
    fn frequency_parse_and_applicability() {
        assert_eq!(Frequency::parse("monthly"), Frequency::Monthly);
        assert_eq!(Frequency::parse("One-time"), Frequency::OneTime);
        assert_eq!(Frequency::parse("unknown"), Frequency::Monthly);
        assert!(Frequency::Annual.emits_once());
        assert_eq!(
            Frequency::Quarterly.applicable_months(),
            &["Apr", "Jul", "Oct", "Jan"]
        );
        assert_eq!(Frequency::Monthly.applicable_months().len(), 12);
    }

    #[test]
    fn paise_round_trips_at_the_boundary() {
        assert_eq!(paise_from_json(&serde_json::json!(1000)), Some(100_000));
        assert_eq!(paise_from_json(&serde_json::json!(10.50)), Some(1050));
        assert_eq!(paise_from_json(&serde_json::json!(0.015)), Some(2));
        assert_eq!(paise_from_json(&serde_json::json!("x")), None);
        assert_eq!(rupees(1050), 10.5);
    }

    #[test]
    fn amount_in_words_indian_grouping() {
        assert_eq!(amount_in_words(0), "Zero");
        assert_eq!(amount_in_words(5), "Five Only");
        assert_eq!(amount_in_words(3000), "Three Thousand Only");
        assert_eq!(
            amount_in_words(1350),
            "One Thousand Three Hundred Fifty Only"
        );
        assert_eq!(
            amount_in_words(12_34_567),
            "Twelve Lakh Thirty Four Thousand Five Hundred Sixty Seven Only"
        );
        assert_eq!(amount_in_words(-50), "Minus Fifty Only");
        assert_eq!(amount_in_words(10_000_000), "One Crore Only");
    }
}
