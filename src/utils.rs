//! Utility functions for the rfid-reader-ble crate.

/// Normalize a Bluetooth MAC address to upper-case colon-separated form.
///
/// Accepts `:` or `-` separators, or a bare 12-digit hex string.
/// Returns `None` if the input is not a valid 48-bit address.
///
/// # Example
///
/// ```
/// use rfid_reader_ble::normalize_mac;
///
/// assert_eq!(
///     normalize_mac("00-05-c4-c1-00-13").as_deref(),
///     Some("00:05:C4:C1:00:13")
/// );
/// assert!(normalize_mac("not a mac").is_none());
/// ```
pub fn normalize_mac(input: &str) -> Option<String> {
    let hex: String = input
        .chars()
        .filter(|c| *c != ':' && *c != '-')
        .collect::<String>()
        .to_ascii_uppercase();

    if hex.len() != 12 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }

    let mut out = String::with_capacity(17);
    for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
        if i > 0 {
            out.push(':');
        }
        out.push(chunk[0] as char);
        out.push(chunk[1] as char);
    }
    Some(out)
}

/// Check whether a string is a valid Bluetooth MAC address.
#[inline]
pub fn is_valid_mac(input: &str) -> bool {
    normalize_mac(input).is_some()
}

/// Format a radio power level for display, e.g. `27.0 dBm`.
///
/// # Example
///
/// ```
/// use rfid_reader_ble::format_power_dbm;
///
/// assert_eq!(format_power_dbm(27), "27.0 dBm");
/// ```
#[inline]
pub fn format_power_dbm(dbm: i32) -> String {
    format!("{:.1} dBm", dbm as f32)
}
