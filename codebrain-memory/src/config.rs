//! Tunables for memory and context assembly

use serde::{Deserialize, Serialize};

/// Memory subsystem configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Characters accumulated at a level before a summary triggers
    pub summary_trigger_chars: usize,
    /// Highest summary level
    pub max_summary_level: u8,
    /// Character budget of the recent-context window
    pub recent_context_max_chars: usize,
    /// Turn budget of the recent-context window
    pub recent_context_max_turns: usize,
    /// Summaries kept after retrieval boosting
    pub rag_max_summaries: usize,
    /// Minimum boosted score a retrieved summary must reach
    pub rag_min_score: f32,
    /// Days over which the recency boost decays to zero
    pub recency_decay_days: f32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            summary_trigger_chars: 10_000,
            max_summary_level: 3,
            recent_context_max_chars: 5_000,
            recent_context_max_turns: 10,
            rag_max_summaries: 5,
            rag_min_score: 0.7,
            recency_decay_days: 7.0,
        }
    }
}

impl MemoryConfig {
    /// Multiplier applied to a summary's score by its level
    ///
    /// Higher levels compress more history, so a hit there is worth more.
    #[must_use]
    pub fn level_boost(&self, level: u8) -> f32 {
        match level {
            0 | 1 => 1.0,
            2 => 1.1,
            _ => 1.2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = MemoryConfig::default();
        assert_eq!(config.summary_trigger_chars, 10_000);
        assert_eq!(config.max_summary_level, 3);
        assert_eq!(config.recent_context_max_chars, 5_000);
        assert_eq!(config.recent_context_max_turns, 10);
        assert_eq!(config.rag_max_summaries, 5);
        assert!((config.rag_min_score - 0.7).abs() < f32::EPSILON);
    }

    #[test]
    fn test_level_boosts() {
        let config = MemoryConfig::default();
        assert!((config.level_boost(1) - 1.0).abs() < f32::EPSILON);
        assert!((config.level_boost(2) - 1.1).abs() < f32::EPSILON);
        assert!((config.level_boost(3) - 1.2).abs() < f32::EPSILON);
    }
}
