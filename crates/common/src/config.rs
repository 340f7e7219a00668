use serde::{Deserialize, Serialize};

/// Planner configuration shared across build/rewrite/lowering/codec layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerConfig {
    /// Upper bound on full rewrite passes before the fixed-point engine
    /// reports a convergence failure. The rule set is expected to converge
    /// in a handful of passes; this bound exists so a misbehaving rule
    /// surfaces as an error instead of a hang.
    #[serde(default = "default_max_rewrite_passes")]
    pub max_rewrite_passes: usize,

    /// Encoded lists above this many bytes are written compressed on the
    /// wire (`{algo, size, data}` wrapping).
    #[serde(default = "default_compress_threshold_bytes")]
    pub compress_threshold_bytes: usize,
}

fn default_max_rewrite_passes() -> usize {
    64
}

fn default_compress_threshold_bytes() -> usize {
    16 * 1024
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_rewrite_passes: default_max_rewrite_passes(),
            compress_threshold_bytes: default_compress_threshold_bytes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::PlannerConfig;

    #[test]
    fn defaults_survive_serde() {
        let cfg = PlannerConfig::default();
        let s = serde_json::to_string(&cfg).unwrap();
        let back: PlannerConfig = serde_json::from_str(&s).unwrap();
        assert_eq!(back.max_rewrite_passes, cfg.max_rewrite_passes);
        assert_eq!(back.compress_threshold_bytes, 16 * 1024);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let back: PlannerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(back.max_rewrite_passes, 64);
    }
}
