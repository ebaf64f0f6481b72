const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB", "PiB"];

/// Human readable byte count, `-` when unknown.
pub fn format_size(bytes: Option<u64>) -> String {
    let Some(bytes) = bytes else {
        return "-".to_string();
    };

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

/// Percentage of `size` in use, `-` when either side is unknown.
pub fn format_usage_percent(usage: Option<u64>, size: Option<u64>) -> String {
    match (usage, size) {
        (Some(usage), Some(size)) if size > 0 => {
            format!("{:.1}%", usage as f64 / size as f64 * 100.0)
        }
        _ => "-".to_string(),
    }
}
