use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tuning knobs shared by every slot of an [`crate::Engine`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Added to the neighborhood weight multiplier on every nomination round.
    pub neighborhood_growth: u64,
    pub nomination_timeout: Duration,
    pub ballot_timeout: Duration,
    /// Upper bound for any timeout computed from a round or counter.
    pub max_timeout: Duration,
    pub max_advance_depth: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            neighborhood_growth: 1,
            nomination_timeout: Duration::from_secs(1),
            ballot_timeout: Duration::from_secs(1),
            max_timeout: Duration::from_secs(30 * 60),
            max_advance_depth: 50,
        }
    }
}

impl EngineConfig {
    /// `min(base × round, max_timeout)`, with round 0 treated as 1.
    pub fn timeout(&self, base: Duration, round: u32) -> Duration {
        base.saturating_mul(round.max(1)).min(self.max_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeouts_grow_linearly_and_are_capped() {
        let config = EngineConfig::default();
        let base = config.ballot_timeout;
        assert_eq!(config.timeout(base, 0), Duration::from_secs(1));
        assert_eq!(config.timeout(base, 1), Duration::from_secs(1));
        assert_eq!(config.timeout(base, 7), Duration::from_secs(7));
        assert_eq!(config.timeout(base, u32::MAX), config.max_timeout);
    }

    #[test]
    fn test_config_roundtrips_through_bincode() -> eyre::Result<()> {
        let config = EngineConfig {
            neighborhood_growth: 3,
            ..Default::default()
        };
        let bytes = bincode::serialize(&config)?;
        let decoded: EngineConfig = bincode::deserialize(&bytes)?;
        assert_eq!(decoded, config);
        Ok(())
    }
}
