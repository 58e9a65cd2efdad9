//! Date scrubbing for lock operands.
//!
//! Operands frequently embed `date(1)`-style timestamps captured from command
//! output. Left alone, every run would mint a new lock. This heuristic blanks
//! the first weekday and month names it sees and, when the text after the
//! month reads like `D HH:MM:SS`, masks the digits that follow.
//!
//! It is deliberately not a date parser. Lock key collisions depend on its
//! exact behaviour, so changes here change which runs share a lock.
//!
//! Only one day and one month name are blanked per call, so scrubbing is
//! idempotent for operands holding a single stamp. Text with several weekday
//! or month names loses one more of them on each repeated call.

const DAYS: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];
const MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

/// Shortest string that could hold a full `date(1)` stamp.
const MIN_DATE_LEN: usize = "Fri Oct 1 15:15:23 EST 2010".len();

/// Digits are masked up to this many bytes past the month name.
const DIGIT_WINDOW: usize = 15;

pub fn remove_dates(s: &str) -> String {
    if s.len() < MIN_DATE_LEN {
        return s.to_string();
    }

    let mut bytes = s.as_bytes().to_vec();
    let day = replace_first_of(&mut bytes, &DAYS, b"DAY");
    let month = replace_first_of(&mut bytes, &MONTHS, b"MON");

    if let (Some(_), Some(month_at)) = (day, month) {
        let start = month_at + 4;
        let fields = scan_clock_fields(bytes.get(start..).unwrap_or_default());
        if fields.iter().product::<i64>() != 0 {
            let end = (month_at + DIGIT_WINDOW + 1).min(bytes.len());
            for b in bytes.iter_mut().take(end).skip(start) {
                if b.is_ascii_digit() {
                    *b = b't';
                }
            }
        }
    }

    // Only ASCII bytes were rewritten, so the text is still valid UTF-8
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Overwrite the first occurrence of the first name (in table order) that
/// appears anywhere in `bytes`. Returns its offset.
fn replace_first_of(bytes: &mut [u8], names: &[&str], with: &[u8; 3]) -> Option<usize> {
    for name in names {
        if let Some(at) = find(bytes, name.as_bytes()) {
            bytes[at..at + 3].copy_from_slice(with);
            return Some(at);
        }
    }
    None
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Read `%d %d:%d:%d`, leaving unread fields at zero like `sscanf` does.
fn scan_clock_fields(input: &[u8]) -> [i64; 4] {
    let mut fields = [0i64; 4];
    let mut pos = 0;

    for (i, field) in fields.iter_mut().enumerate() {
        if i >= 2 {
            if input.get(pos) != Some(&b':') {
                break;
            }
            pos += 1;
        }
        match scan_int(input, pos) {
            Some((value, next)) => {
                *field = value;
                pos = next;
            }
            None => break,
        }
    }
    fields
}

fn scan_int(input: &[u8], mut pos: usize) -> Option<(i64, usize)> {
    while input.get(pos).is_some_and(|b| b.is_ascii_whitespace()) {
        pos += 1;
    }
    let negative = match input.get(pos) {
        Some(b'-') => {
            pos += 1;
            true
        }
        Some(b'+') => {
            pos += 1;
            false
        }
        _ => false,
    };
    let digits_start = pos;
    let mut value: i64 = 0;
    while let Some(b) = input.get(pos).filter(|b| b.is_ascii_digit()) {
        value = value.saturating_mul(10).saturating_add((b - b'0') as i64);
        pos += 1;
    }
    if pos == digits_start {
        return None;
    }
    Some((if negative { -value } else { value }, pos))
}
