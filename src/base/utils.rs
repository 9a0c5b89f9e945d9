use std::time::Duration;

cfg_if::cfg_if! {
    if #[cfg(target_pointer_width = "64")] {
        pub const BITS_PER_WORD: usize = 64;
        pub const LOG_BITS_PER_WORD: usize = 6;
    } else {
        pub const BITS_PER_WORD: usize = 32;
        pub const LOG_BITS_PER_WORD: usize = 5;
    }
}

/// Index of the lowest clear bit of `value`. `value` must not be all ones.
#[inline]
pub const fn count_trailing_ones(value: usize) -> u32 {
    (!value).trailing_zeros()
}

#[inline]
pub const fn population_count(value: usize) -> usize {
    value.count_ones() as usize
}

/// Splits a value such as `64k`, `2M`, `1g` or `10` into the numeric part and
/// the multiplier implied by its suffix. A trailing `b`/`B` is ignored.
fn split_factor(value: &str) -> Option<(&str, usize)> {
    let mut value = value.trim();
    if value.is_empty() {
        return None;
    }

    if value.len() > 1 && (value.ends_with('b') || value.ends_with('B')) {
        value = &value[..value.len() - 1];
    }

    let (number, factor) = match value.as_bytes()[value.len() - 1] {
        b'g' | b'G' => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        b'm' | b'M' => (&value[..value.len() - 1], 1024 * 1024),
        b'k' | b'K' => (&value[..value.len() - 1], 1024),
        _ => (value, 1),
    };

    Some((number, factor))
}

pub fn parse_uint_with_factor(value: &str) -> Option<usize> {
    let (number, factor) = split_factor(value)?;
    let number = number.parse::<f64>().ok()?;
    if number < 0.0 {
        return None;
    }
    Some((number * factor as f64) as usize)
}

pub fn read_uint_from_env(var: &str) -> Option<usize> {
    let value = std::env::var(var).ok()?;
    let parsed = parse_uint_with_factor(&value);
    if parsed.is_none() {
        log::debug!(target: "objstorage", "ignoring malformed value {}={:?}", var, value);
    }
    parsed
}

pub fn read_millis_from_env(var: &str) -> Option<Duration> {
    read_uint_from_env(var).map(|ms| Duration::from_millis(ms as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_helpers() {
        assert_eq!(count_trailing_ones(0), 0);
        assert_eq!(count_trailing_ones(0b0111), 3);
        assert_eq!(count_trailing_ones(0b1011), 2);
        assert_eq!(population_count(0b1011), 3);
        assert_eq!(1usize << LOG_BITS_PER_WORD, BITS_PER_WORD);
    }

    #[test]
    fn test_parse_with_factor() {
        assert_eq!(parse_uint_with_factor("10"), Some(10));
        assert_eq!(parse_uint_with_factor("4k"), Some(4096));
        assert_eq!(parse_uint_with_factor("2MB"), Some(2 * 1024 * 1024));
        assert_eq!(parse_uint_with_factor("1G"), Some(1024 * 1024 * 1024));
        assert_eq!(parse_uint_with_factor(""), None);
        assert_eq!(parse_uint_with_factor("many"), None);
    }
}
