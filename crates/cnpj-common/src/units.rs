//! Byte size formatting and parsing
//!
//! Directory listings report sizes like `12M` or `1.5G`; logs and summaries
//! print them back as `12.00 MB`.

use crate::error::{CommonError, Result};
use byte_unit::Byte;

const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];

/// Format bytes into human-readable string
pub fn format_bytes(bytes: u64) -> String {
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", size as u64, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

/// Parse a listing size such as `512`, `12K`, `3.4M`, `1G` or `2.0 GB`.
///
/// Directory listings print binary multiples with bare or SI-looking
/// suffixes, so every suffix is read as its binary unit. The result is
/// approximate whenever the listing rounded the value.
pub fn parse_size(text: &str) -> Result<u64> {
    let trimmed = text.trim();
    let split = trimmed
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(trimmed.len());
    let (number, suffix) = trimmed.split_at(split);

    let unit = match suffix.trim().to_ascii_uppercase().as_str() {
        "" | "B" => "B",
        "K" | "KB" | "KIB" => "KiB",
        "M" | "MB" | "MIB" => "MiB",
        "G" | "GB" | "GIB" => "GiB",
        "T" | "TB" | "TIB" => "TiB",
        _ => return Err(CommonError::InvalidSize(text.to_string())),
    };

    Byte::parse_str(format!("{} {}", number.trim(), unit), false)
        .map(|byte| byte.as_u64())
        .map_err(|_| CommonError::InvalidSize(text.to_string()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1048576), "1.00 MB");
        assert_eq!(format_bytes(1099511627776), "1.00 TB");
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("512").unwrap(), 512);
        assert_eq!(parse_size("12K").unwrap(), 12 * 1024);
        assert_eq!(parse_size("1.5M").unwrap(), 1_572_864);
        assert_eq!(parse_size("2 GB").unwrap(), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_size(" 22K ").unwrap(), 22 * 1024);
        assert_eq!(parse_size("3KiB").unwrap(), 3 * 1024);
        assert!(parse_size("-").is_err());
        assert!(parse_size("M").is_err());
        assert!(parse_size("12Q").is_err());
    }

    proptest! {
        #[test]
        fn parse_accepts_plain_integers(n in 0u64..1_000_000_000) {
            prop_assert_eq!(parse_size(&n.to_string()).unwrap(), n);
        }
    }
}
