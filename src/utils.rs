//! Utility functions for the pressensor-ble crate.

/// Placeholder shown in place of redacted values.
pub const REDACTED: &str = "**REDACTED**";

/// Round an integer to the nearest multiple of `step`.
///
/// Ties are broken towards the even multiple (banker's rounding), so
/// `1005` becomes `1000` while `1015` becomes `1020`.
///
/// # Example
///
/// ```
/// use pressensor_ble::round_half_even;
///
/// assert_eq!(round_half_even(1004, 10), 1000);
/// assert_eq!(round_half_even(1006, 10), 1010);
/// assert_eq!(round_half_even(1005, 10), 1000);
/// ```
#[inline]
pub fn round_half_even(value: i32, step: i32) -> i32 {
    debug_assert!(step > 0);
    let quotient = value.div_euclid(step);
    let remainder = value.rem_euclid(step);

    let twice = remainder * 2;
    let rounded = if twice < step {
        quotient
    } else if twice > step {
        quotient + 1
    } else if quotient % 2 == 0 {
        quotient
    } else {
        quotient + 1
    };

    rounded * step
}

/// Normalise a Bluetooth address to upper-case colon-separated form.
///
/// # Example
///
/// ```
/// use pressensor_ble::format_mac;
///
/// assert_eq!(format_mac("aa-bb-cc-dd-ee-ff"), "AA:BB:CC:DD:EE:FF");
/// ```
pub fn format_mac(address: &str) -> String {
    address.trim().replace('-', ":").to_ascii_uppercase()
}

/// Compare two Bluetooth addresses ignoring case and separator style.
pub fn same_address(a: &str, b: &str) -> bool {
    format_mac(a) == format_mac(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_round_half_even() {
        assert_eq!(round_half_even(1004, 10), 1000);
        assert_eq!(round_half_even(1006, 10), 1010);
        assert_eq!(round_half_even(1005, 10), 1000);
        assert_eq!(round_half_even(1015, 10), 1020);
        assert_eq!(round_half_even(0, 10), 0);
    }

    #[test]
    fn test_round_half_even_negative() {
        assert_eq!(round_half_even(-4, 10), 0);
        assert_eq!(round_half_even(-6, 10), -10);
        assert_eq!(round_half_even(-1005, 10), -1000);
        assert_eq!(round_half_even(-15, 10), -20);
        assert_eq!(round_half_even(i16::MIN as i32, 10), -32770);
    }

    #[test]
    fn test_format_mac() {
        assert_eq!(format_mac("aa:bb:cc:dd:ee:ff"), "AA:BB:CC:DD:EE:FF");
        assert!(same_address("aa-bb-cc-dd-ee-ff", "AA:BB:CC:DD:EE:FF"));
        assert!(!same_address("AA:BB:CC:DD:EE:FF", "11:22:33:44:55:66"));
    }

    proptest! {
        #[test]
        fn rounds_to_nearest_multiple_of_ten(raw in any::<i16>()) {
            let raw = raw as i32;
            let rounded = round_half_even(raw, 10);
            prop_assert_eq!(rounded % 10, 0);
            prop_assert!((rounded - raw).abs() <= 5);
            if (rounded - raw).abs() == 5 {
                prop_assert_eq!((rounded / 10) % 2, 0);
            }
        }
    }
}
