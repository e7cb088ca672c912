const UNITS: [&str; 7] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB", "EiB"];

/// Formats a byte count with binary units, e.g. `1536` with precision 1 is `1.5 KiB`.
///
/// ```
/// use deltarepo_utils::bytes::format_bytes;
///
/// assert_eq!(format_bytes(1024_u64.pow(2), 2), "1.00 MiB");
/// ```
pub fn format_bytes(bytes: u64, precision: usize) -> String {
    let mut value = bytes as f64;
    let mut idx = 0;
    while value >= 1024.0 && idx < UNITS.len() - 1 {
        value /= 1024.0;
        idx += 1;
    }

    if idx == 0 {
        return format!("{bytes} B");
    }
    format!("{value:.precision$} {}", UNITS[idx])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0, 2), "0 B");
        assert_eq!(format_bytes(1023, 2), "1023 B");
        assert_eq!(format_bytes(1536, 1), "1.5 KiB");
        assert_eq!(format_bytes(5 * 1024_u64.pow(3), 0), "5 GiB");
    }
}
