//! Number extraction for range labels and amount strings.
//!
//! Grammar of a number token in a range label:
//!
//! ```text
//! number := digit+ ( ',' digit{3} )* ( '.' digit+ )?
//! ```
//!
//! A comma only continues a number when exactly three digits follow it, so
//! `"1,201"` lexes as `1201` while `"1, 2"` lexes as `1` and `2`. Everything
//! outside a number token (currency signs, words, dashes) is skipped.
//!
//! Amounts are lexed more loosely: any maximal run of digits and commas is one
//! whole number with the commas dropped, so `"$1,5000"` is `15000` and the
//! cents of `"$1,500.50"` are a separate token `50`.

/// Every number in `text`, in order of appearance.
pub fn numbers(text: &str) -> Vec<f64> {
    let bytes = text.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if !bytes[i].is_ascii_digit() {
            i += 1;
            continue;
        }

        let mut digits = String::new();
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            digits.push(bytes[i] as char);
            i += 1;
        }
        while i < bytes.len() && bytes[i] == b',' && is_group(bytes, i + 1) {
            digits.extend(bytes[i + 1..i + 4].iter().map(|b| *b as char));
            i += 4;
        }
        if i + 1 < bytes.len() && bytes[i] == b'.' && bytes[i + 1].is_ascii_digit() {
            digits.push('.');
            i += 1;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                digits.push(bytes[i] as char);
                i += 1;
            }
        }

        if let Ok(value) = digits.parse::<f64>() {
            out.push(value);
        }
    }
    out
}

// Exactly three digits starting at `at`, not followed by a fourth.
fn is_group(bytes: &[u8], at: usize) -> bool {
    at + 3 <= bytes.len()
        && bytes[at..at + 3].iter().all(u8::is_ascii_digit)
        && bytes.get(at + 3).map_or(true, |b| !b.is_ascii_digit())
}

/// Largest number in an amount string such as `"$5,000 - $10,000"`.
pub fn parse_amount(text: &str) -> Option<f64> {
    amount_numbers(text).into_iter().reduce(f64::max)
}

fn amount_numbers(text: &str) -> Vec<f64> {
    text.split(|c: char| !(c.is_ascii_digit() || c == ','))
        .map(|run| run.replace(',', ""))
        .filter(|digits| !digits.is_empty())
        .filter_map(|digits| digits.parse::<f64>().ok())
        .collect()
}

/// Inclusive numeric interval encoded in a vocabulary label.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangeBounds {
    pub lower: f64,
    pub upper: f64,
}

impl RangeBounds {
    pub fn contains(&self, value: f64) -> bool {
        self.lower <= value && value <= self.upper
    }
}

/// Bounds from the first two numbers of a label; `None` if it has fewer.
pub fn parse_range_label(label: &str) -> Option<RangeBounds> {
    let mut found = numbers(label).into_iter();
    let lower = found.next()?;
    let upper = found.next()?;
    Some(RangeBounds { lower, upper })
}
