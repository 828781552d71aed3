pub mod bench;
pub mod cloudwatch;
pub mod engine;
pub mod host;
pub mod logging;
pub mod report;
pub mod settings;
pub mod upload;

pub const TARGET_ENGINE_REQUEST: &str = "engine_request";
pub const TARGET_AWS_REQUEST: &str = "aws_request";

/// Parse a max-pairs argument that may be given in scientific notation
/// ("1e7") or as a plain integer ("10000000").
pub fn parse_max_pairs(raw: &str) -> anyhow::Result<u64> {
    let value: f64 = raw
        .trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid max_pairs '{}': {}", raw, e))?;
    if !value.is_finite() || value < 1.0 {
        anyhow::bail!("max_pairs must be a positive number, got '{}'", raw);
    }
    Ok(value as u64)
}

#[cfg(test)]
mod tests {
    use super::parse_max_pairs;

    #[test]
    fn test_parse_max_pairs_scientific_notation() {
        assert_eq!(parse_max_pairs("1e6").unwrap(), 1_000_000);
        assert_eq!(parse_max_pairs("1e7").unwrap(), 10_000_000);
        assert_eq!(parse_max_pairs("2.5e3").unwrap(), 2_500);
    }

    #[test]
    fn test_parse_max_pairs_plain_integer() {
        assert_eq!(parse_max_pairs("50000").unwrap(), 50_000);
        assert_eq!(parse_max_pairs(" 100 ").unwrap(), 100);
    }

    #[test]
    fn test_parse_max_pairs_rejects_garbage() {
        assert!(parse_max_pairs("lots").is_err());
        assert!(parse_max_pairs("-1e6").is_err());
        assert!(parse_max_pairs("0").is_err());
        assert!(parse_max_pairs("inf").is_err());
    }
}
