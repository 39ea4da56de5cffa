//! Row-level parsing: numerics with currency prefixes and thousand
//! separators, ISO and day-first dates, and three coordinate notations.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    /// "Lat: -6.2, Long: 106.8" (also LAT/LNG/LONG, case-insensitive)
    static ref LABELED_COORDS: Regex = Regex::new(
        r"(?i)lat[a-z]*\s*[:=]\s*(-?\d+(?:\.\d+)?)\s*[,;]\s*(?:long|lng|lon)[a-z]*\s*[:=]\s*(-?\d+(?:\.\d+)?)"
    ).unwrap();

    /// DMS with hemisphere suffix: 6°12'31.7"S 106°50'44.2"E
    static ref DMS_COORD: Regex = Regex::new(
        r#"(\d+(?:\.\d+)?)\s*°\s*(?:(\d+(?:\.\d+)?)\s*'\s*)?(?:(\d+(?:\.\d+)?)\s*(?:"|'')\s*)?([NSEW])"#
    ).unwrap();
}

/// Parse a monetary value: strips `Rp`/`$` prefixes, thousand separators and
/// whitespace. Returns None for empty or non-numeric input.
pub fn parse_amount(raw: &str) -> Option<f64> {
    let cleaned = raw
        .trim()
        .trim_start_matches("Rp")
        .trim_start_matches("rp")
        .trim_start_matches('$')
        .replace([',', ' '], "");
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok()
}

/// Parse a date: RFC-3339 / ISO-8601 first, then day-first local formats.
pub fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(parsed.with_timezone(&Utc));
    }
    const DATETIME_FORMATS: &[&str] = &[
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
        "%d/%m/%Y %H:%M:%S",
        "%d/%m/%Y %H:%M",
        "%d-%m-%Y %H:%M:%S",
    ];
    for format in DATETIME_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(Utc.from_utc_datetime(&parsed));
        }
    }
    const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y", "%d-%m-%Y", "%d.%m.%Y"];
    for format in DATE_FORMATS {
        if let Ok(parsed) = NaiveDate::parse_from_str(trimmed, format) {
            return Some(Utc.from_utc_datetime(&parsed.and_hms_opt(0, 0, 0)?));
        }
    }
    None
}

fn dms_to_decimal(degrees: f64, minutes: f64, seconds: f64, hemisphere: &str) -> f64 {
    let value = degrees + minutes / 60.0 + seconds / 3600.0;
    match hemisphere {
        "S" | "W" => -value,
        _ => value,
    }
}

/// Parse coordinates from any of:
/// - decimal pair: `-6.2088, 106.8456`
/// - labeled: `Lat: -6.2088, Long: 106.8456`
/// - DMS: `6°12'31.7"S 106°50'44.2"E`
pub fn parse_coordinates(raw: &str) -> Option<(f64, f64)> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Some(caps) = LABELED_COORDS.captures(trimmed) {
        let lat = caps.get(1)?.as_str().parse().ok()?;
        let lon = caps.get(2)?.as_str().parse().ok()?;
        return valid_coords(lat, lon);
    }

    let dms: Vec<(f64, &str)> = DMS_COORD
        .captures_iter(trimmed)
        .filter_map(|caps| {
            let degrees: f64 = caps.get(1)?.as_str().parse().ok()?;
            let minutes: f64 =
                caps.get(2).and_then(|m| m.as_str().parse().ok()).unwrap_or(0.0);
            let seconds: f64 =
                caps.get(3).and_then(|m| m.as_str().parse().ok()).unwrap_or(0.0);
            let hemisphere = caps.get(4)?.as_str();
            Some((dms_to_decimal(degrees, minutes, seconds, hemisphere), hemisphere))
        })
        .collect();
    if dms.len() == 2 {
        let lat = dms.iter().find(|(_, h)| *h == "N" || *h == "S")?.0;
        let lon = dms.iter().find(|(_, h)| *h == "E" || *h == "W")?.0;
        return valid_coords(lat, lon);
    }

    // Plain decimal pair
    let parts: Vec<&str> = trimmed.split(',').map(|p| p.trim()).collect();
    if parts.len() == 2 {
        let lat = parts[0].parse().ok()?;
        let lon = parts[1].parse().ok()?;
        return valid_coords(lat, lon);
    }
    None
}

fn valid_coords(lat: f64, lon: f64) -> Option<(f64, f64)> {
    if (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon) {
        Some((lat, lon))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amounts_with_prefixes_and_separators() {
        assert_eq!(parse_amount("Rp 7,550,000"), Some(7_550_000.0));
        assert_eq!(parse_amount("$1,250.50"), Some(1250.50));
        assert_eq!(parse_amount("5250000"), Some(5_250_000.0));
        assert_eq!(parse_amount("  "), None);
        assert_eq!(parse_amount("n/a"), None);
    }

    #[test]
    fn iso_and_day_first_dates() {
        assert!(parse_date("2024-01-15").is_some());
        assert!(parse_date("2024-01-15T10:30:00Z").is_some());
        let day_first = parse_date("15/01/2024").unwrap();
        assert_eq!(day_first.format("%Y-%m-%d").to_string(), "2024-01-15");
        let dashed = parse_date("15-01-2024").unwrap();
        assert_eq!(dashed.format("%Y-%m-%d").to_string(), "2024-01-15");
        assert!(parse_date("not a date").is_none());
    }

    #[test]
    fn decimal_pair_coordinates() {
        let (lat, lon) = parse_coordinates("-6.2088, 106.8456").unwrap();
        assert!((lat + 6.2088).abs() < 1e-9);
        assert!((lon - 106.8456).abs() < 1e-9);
    }

    #[test]
    fn labeled_coordinates() {
        let (lat, lon) = parse_coordinates("Lat: -6.2088, Long: 106.8456").unwrap();
        assert!((lat + 6.2088).abs() < 1e-9);
        assert!((lon - 106.8456).abs() < 1e-9);
    }

    #[test]
    fn dms_coordinates_with_hemispheres() {
        let (lat, lon) = parse_coordinates(r#"6°12'31.7"S 106°50'44.2"E"#).unwrap();
        assert!((lat + 6.208805).abs() < 1e-4, "lat {lat}");
        assert!((lon - 106.845611).abs() < 1e-4, "lon {lon}");
    }

    #[test]
    fn out_of_range_coordinates_rejected() {
        assert!(parse_coordinates("95.0, 106.8").is_none());
        assert!(parse_coordinates("-6.2, 191.0").is_none());
    }
}
