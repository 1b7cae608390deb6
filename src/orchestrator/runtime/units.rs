//! Orchestrator quantity strings to Docker resource units.
//!
//! Malformed input converts to `0`, which Docker reads as "no limit".

/// CPU shares Docker assigns to one full core.
pub const SHARES_PER_CORE: f64 = 1024.0;

/// `"500m"` (millicores) or `"1.5"` (cores) to CPU shares.
pub fn parse_cpu(quantity: &str) -> i64 {
    let quantity = quantity.trim();
    let cores = match quantity.strip_suffix('m') {
        Some(millis) => parse_number(millis).map(|m| m / 1000.0),
        None => parse_number(quantity),
    };
    cores
        .map(|cores| (cores * SHARES_PER_CORE).floor() as i64)
        .unwrap_or(0)
}

/// `"<number><unit>"` to bytes. Units are case-insensitive and base 1024
/// whether or not they carry the `i` (`"1G"` equals `"1Gi"`).
pub fn parse_memory(quantity: &str) -> i64 {
    let quantity = quantity.trim();
    let split = quantity
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(quantity.len());
    let (number, unit) = quantity.split_at(split);

    let multiplier: f64 = match unit.to_ascii_lowercase().as_str() {
        "" => 1.0,
        "k" | "ki" => 1024.0,
        "m" | "mi" => 1024.0 * 1024.0,
        "g" | "gi" => 1024.0 * 1024.0 * 1024.0,
        "t" | "ti" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return 0,
    };

    parse_number(number)
        .map(|n| (n * multiplier).floor() as i64)
        .unwrap_or(0)
}

fn parse_number(raw: &str) -> Option<f64> {
    raw.parse::<f64>()
        .ok()
        .filter(|n| n.is_finite() && *n >= 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpu() {
        assert_eq!(parse_cpu("500m"), 512);
        assert_eq!(parse_cpu("2"), 2048);
        assert_eq!(parse_cpu("0.5"), 512);
        assert_eq!(parse_cpu("250m"), 256);
        assert_eq!(parse_cpu("1m"), 1);
        assert_eq!(parse_cpu(" 1 "), 1024);
    }

    #[test]
    fn test_parse_cpu_malformed_is_zero() {
        assert_eq!(parse_cpu(""), 0);
        assert_eq!(parse_cpu("m"), 0);
        assert_eq!(parse_cpu("two"), 0);
        assert_eq!(parse_cpu("-1"), 0);
    }

    #[test]
    fn test_parse_memory() {
        assert_eq!(parse_memory("1Gi"), 1 << 30);
        assert_eq!(parse_memory("512Mi"), 1 << 29);
        assert_eq!(parse_memory("1G"), 1 << 30);
        assert_eq!(parse_memory("4gi"), 4 << 30);
        assert_eq!(parse_memory("1.5Ki"), 1536);
        assert_eq!(parse_memory("1Ti"), 1 << 40);
        assert_eq!(parse_memory("2048"), 2048);
    }

    #[test]
    fn test_parse_memory_malformed_is_zero() {
        assert_eq!(parse_memory("garbage"), 0);
        assert_eq!(parse_memory("12Pi"), 0);
        assert_eq!(parse_memory("Gi"), 0);
        assert_eq!(parse_memory(""), 0);
    }
}
