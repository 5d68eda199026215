#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerUnit {
    Watts,
    Kilowatts,
}

impl PowerUnit {
    /// Display text from the device carries its own unit suffix, if any.
    pub fn sniff(raw_text: &str) -> Self {
        if raw_text.to_ascii_lowercase().contains("kw") {
            PowerUnit::Kilowatts
        } else {
            PowerUnit::Watts
        }
    }
}

/// Every power reading leaves the extractors in watts.
pub fn normalize_power(value: f64, unit: PowerUnit) -> f64 {
    match unit {
        PowerUnit::Watts => value,
        PowerUnit::Kilowatts => value * 1000.0,
    }
}

/// Parse a number out of display text such as `"121.4 V"` or `"1,234.5W"`.
///
/// Everything except ASCII digits and `.` is dropped first, so signs and
/// thousands separators are lost. The longest numeric prefix of what remains
/// wins (`"1.2.3"` reads as `1.2`).
pub fn parse_display_number(text: &str) -> Option<f64> {
    let kept: String = text
        .chars()
        .filter(|ch| ch.is_ascii_digit() || *ch == '.')
        .collect();

    let mut end = 0;
    let mut seen_dot = false;
    for (idx, ch) in kept.char_indices() {
        if ch == '.' {
            if seen_dot {
                break;
            }
            seen_dot = true;
        }
        end = idx + ch.len_utf8();
    }

    let candidate = &kept[..end];
    if !candidate.bytes().any(|b| b.is_ascii_digit()) {
        return None;
    }
    candidate
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
}
