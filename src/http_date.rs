//! HTTP date parsing and formatting, RFC 7231 §7.1.1.1.
//!
//! Senders emit IMF-fixdate; receivers also accept the two obsolete forms.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

const MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];
const WEEKDAYS: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];

/// The current time in epoch milliseconds, as stamped on responses.
pub(crate) fn now_epoch_millis() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(_) => 0,
    }
}

/// Parses an HTTP date in any of the three RFC 7231 forms.
pub(crate) fn parse_http_date(input: &str) -> Option<SystemTime> {
    let input = input.trim();
    // IMF-fixdate: Sun, 06 Nov 1994 08:49:37 GMT
    // RFC 850:     Sunday, 06-Nov-94 08:49:37 GMT
    // asctime:     Sun Nov  6 08:49:37 1994
    if let Some(comma) = input.find(',') {
        let rest = input[comma + 1..].trim();
        let fields: Vec<&str> = rest.split_ascii_whitespace().collect();
        if fields.len() == 4 && fields[0].contains('-') {
            // RFC 850: 06-Nov-94
            let date: Vec<&str> = fields[0].split('-').collect();
            if date.len() != 3 {
                return None;
            }
            let day: u32 = date[0].parse().ok()?;
            let month = month_number(date[1])?;
            let mut year: i64 = date[2].parse().ok()?;
            if year < 100 {
                year += if year < 70 { 2000 } else { 1900 };
            }
            let (h, m, s) = parse_time_of_day(fields[1])?;
            return epoch_time(year, month, day, h, m, s);
        }
        if fields.len() == 5 {
            // IMF-fixdate: 06 Nov 1994 08:49:37 GMT
            let day: u32 = fields[0].parse().ok()?;
            let month = month_number(fields[1])?;
            let year: i64 = fields[2].parse().ok()?;
            let (h, m, s) = parse_time_of_day(fields[3])?;
            return epoch_time(year, month, day, h, m, s);
        }
        return None;
    }

    // asctime: Sun Nov  6 08:49:37 1994
    let fields: Vec<&str> = input.split_ascii_whitespace().collect();
    if fields.len() == 5 {
        let month = month_number(fields[1])?;
        let day: u32 = fields[2].parse().ok()?;
        let (h, m, s) = parse_time_of_day(fields[3])?;
        let year: i64 = fields[4].parse().ok()?;
        return epoch_time(year, month, day, h, m, s);
    }
    None
}

/// Formats `time` as an IMF-fixdate, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`.
pub(crate) fn format_http_date(time: SystemTime) -> String {
    let secs = match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(_) => 0,
    };
    let days = secs.div_euclid(86_400);
    let time_of_day = secs.rem_euclid(86_400);
    let (year, month, day) = civil_from_days(days);
    // 1970-01-01 was a Thursday.
    let weekday = (days + 3).rem_euclid(7) as usize;
    format!(
        "{}, {:02} {} {} {:02}:{:02}:{:02} GMT",
        WEEKDAYS[weekday],
        day,
        MONTHS[(month - 1) as usize],
        year,
        time_of_day / 3600,
        (time_of_day / 60) % 60,
        time_of_day % 60,
    )
}

fn parse_time_of_day(input: &str) -> Option<(u32, u32, u32)> {
    let parts: Vec<&str> = input.split(':').collect();
    if parts.len() != 3 {
        return None;
    }
    let h: u32 = parts[0].parse().ok()?;
    let m: u32 = parts[1].parse().ok()?;
    let s: u32 = parts[2].parse().ok()?;
    if h > 23 || m > 59 || s > 60 {
        return None;
    }
    Some((h, m, s))
}

fn month_number(name: &str) -> Option<u32> {
    MONTHS
        .iter()
        .position(|m| m.eq_ignore_ascii_case(name))
        .map(|i| i as u32 + 1)
}

fn epoch_time(year: i64, month: u32, day: u32, h: u32, m: u32, s: u32) -> Option<SystemTime> {
    if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return None;
    }
    let days = days_from_civil(year, month, day);
    let secs = days * 86_400 + (h as i64) * 3600 + (m as i64) * 60 + s as i64;
    if secs < 0 {
        return None;
    }
    Some(UNIX_EPOCH + Duration::from_secs(secs as u64))
}

// Calendar arithmetic from Howard Hinnant's algorithms.

fn days_from_civil(year: i64, month: u32, day: u32) -> i64 {
    let y = if month <= 2 { year - 1 } else { year };
    let era = y.div_euclid(400);
    let yoe = y - era * 400;
    let mp = (month as i64 + 9) % 12;
    let doy = (153 * mp + 2) / 5 + day as i64 - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    let year = if month <= 2 { y + 1 } else { y };
    (year, month, day)
}
