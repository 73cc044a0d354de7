//! Source date formats, all collapsed into one calendar date.

use chrono::NaiveDate;

/// Month from an English name/abbreviation ("Jan", "january") or a number ("01").
pub fn parse_month(raw: &str) -> Option<u32> {
    let raw = raw.trim();
    if let Ok(n) = raw.parse::<u32>() {
        return (1..=12).contains(&n).then_some(n);
    }
    let lower = raw.to_ascii_lowercase();
    let prefix = lower.get(..3)?;
    let month = match prefix {
        "jan" => 1, "feb" => 2, "mar" => 3, "apr" => 4,
        "may" => 5, "jun" => 6, "jul" => 7, "aug" => 8,
        "sep" => 9, "oct" => 10, "nov" => 11, "dec" => 12,
        _ => return None,
    };
    Some(month)
}

/// PubMed `PubDate`: structured Year/Month/Day, or a free-form `MedlineDate`
/// such as "2024 Jan-Feb" or "2023 Winter". Missing month/day default to 1.
pub fn parse_pubmed_date(
    year: Option<&str>,
    month: Option<&str>,
    day: Option<&str>,
    medline_date: Option<&str>,
) -> Option<NaiveDate> {
    if let Some(year) = year {
        let y: i32 = year.trim().parse().ok()?;
        let m = month.and_then(parse_month).unwrap_or(1);
        let d = day.and_then(|d| d.trim().parse().ok()).unwrap_or(1);
        return NaiveDate::from_ymd_opt(y, m, d).or_else(|| NaiveDate::from_ymd_opt(y, m, 1));
    }

    let mut parts = medline_date?.split_whitespace();
    let y: i32 = parts.next()?.get(..4)?.parse().ok()?;
    let m = parts
        .next()
        .and_then(|p| p.split('-').next())
        .and_then(parse_month)
        .unwrap_or(1);
    let d = parts
        .next()
        .and_then(|p| p.split('-').next())
        .and_then(|p| p.parse().ok())
        .unwrap_or(1);
    NaiveDate::from_ymd_opt(y, m, d).or_else(|| NaiveDate::from_ymd_opt(y, m, 1))
}

/// "2024-03-15"
pub fn parse_iso(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").ok()
}

/// "20240315"
pub fn parse_compact(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.len() != 8 {
        return None;
    }
    NaiveDate::parse_from_str(raw, "%Y%m%d").ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ymd(y: i32, m: u32, d: u32) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(y, m, d)
    }

    #[test]
    fn test_structured_pubdate() {
        assert_eq!(parse_pubmed_date(Some("2024"), Some("Jan"), Some("15"), None), ymd(2024, 1, 15));
        assert_eq!(parse_pubmed_date(Some("2024"), Some("03"), None, None), ymd(2024, 3, 1));
        assert_eq!(parse_pubmed_date(Some("2024"), None, None, None), ymd(2024, 1, 1));
        assert_eq!(parse_pubmed_date(Some("n/a"), None, None, None), None);
    }

    #[test]
    fn test_medline_date() {
        assert_eq!(parse_pubmed_date(None, None, None, Some("2024 Mar")), ymd(2024, 3, 1));
        assert_eq!(parse_pubmed_date(None, None, None, Some("2024 Jan-Feb")), ymd(2024, 1, 1));
        assert_eq!(parse_pubmed_date(None, None, None, Some("2023 Winter")), ymd(2023, 1, 1));
        assert_eq!(parse_pubmed_date(None, None, None, Some("1998 Dec-1999 Jan")), ymd(1998, 12, 1));
        assert_eq!(parse_pubmed_date(None, None, None, None), None);
    }

    #[test]
    fn test_patent_formats() {
        assert_eq!(parse_iso("2023-06-15"), ymd(2023, 6, 15));
        assert_eq!(parse_iso("June 2023"), None);
        assert_eq!(parse_compact("20240315"), ymd(2024, 3, 15));
        assert_eq!(parse_compact("20241315"), None);
        assert_eq!(parse_compact("2024"), None);
    }
}
