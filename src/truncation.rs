use crate::config::EngineConfig;


/// Guesses whether a result of `result_count` entries was silently cut off
/// by a server-side size limit.
///
/// Servers do not reliably flag truncation, so this only compares against
/// well-known default limits. Both false negatives and false positives are
/// possible.
pub fn looks_truncated(result_count: usize, config: &EngineConfig) -> bool {
    config.truncation_sizes.contains(&result_count)
}


#[cfg(test)]
mod tests {
    use super::looks_truncated;
    use crate::config::EngineConfig;

    #[test]
    fn test_default_sizes() {
        let config = EngineConfig::default();
        for count in [350, 500, 1000, 2000, 5000] {
            assert!(looks_truncated(count, &config));
        }
        for count in [0, 1, 349, 999, 1001, 4999, 10000] {
            assert!(!looks_truncated(count, &config));
        }
    }

    #[test]
    fn test_override() {
        let config = EngineConfig {
            truncation_sizes: [42].into_iter().collect(),
            ..EngineConfig::default()
        };
        assert!(looks_truncated(42, &config));
        assert!(!looks_truncated(1000, &config));
    }
}
