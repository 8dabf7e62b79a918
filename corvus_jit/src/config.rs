//! Configuration surface for the profile subsystem.
//!
//! All knobs are readable from the environment so host processes can flip
//! them without recompiling, mirroring the rest of the Corvus toolchain.

use std::env;

// =============================================================================
// Profile Check Level
// =============================================================================

/// How aggressively the post-solve consistency checker reacts to problems.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileCheckLevel {
    /// Checker disabled.
    Off,
    /// Problems are logged but tolerated.
    Warn,
    /// Any problem aborts compilation.
    Assert,
}

impl ProfileCheckLevel {
    fn from_u32(v: u32) -> Self {
        match v {
            0 => Self::Off,
            1 => Self::Warn,
            _ => Self::Assert,
        }
    }
}

// =============================================================================
// Jit Config
// =============================================================================

/// Configuration for instrumentation and weight solving.
#[derive(Debug, Clone)]
pub struct JitConfig {
    /// Skip count instrumentation for trivially small methods.
    pub minimal_profiling: bool,
    /// Insert class-profile probes at virtual call sites.
    pub class_profiling: bool,
    /// Non-zero seeds the stress-weight generator, which then supersedes
    /// any measured data.
    pub stress_profile_seed: u32,
    /// Post-solve consistency checking level.
    pub profile_checks: ProfileCheckLevel,
    /// Whether the optimizer is enabled for this compile. Edge-range
    /// refinement only runs when it is.
    pub optimizing: bool,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            minimal_profiling: false,
            class_profiling: true,
            stress_profile_seed: 0,
            profile_checks: ProfileCheckLevel::Off,
            optimizing: true,
        }
    }
}

impl JitConfig {
    /// Configuration used by most unit tests: checks on, no stress.
    pub fn for_testing() -> Self {
        Self {
            profile_checks: ProfileCheckLevel::Warn,
            ..Self::default()
        }
    }

    /// Read configuration from `CORVUS_JIT_*` environment variables.
    ///
    /// Unset or unparsable variables keep their defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(v) = read_env_u32("CORVUS_JIT_MINIMAL_PROFILING") {
            config.minimal_profiling = v > 0;
        }
        if let Some(v) = read_env_u32("CORVUS_JIT_CLASS_PROFILING") {
            config.class_profiling = v > 0;
        }
        if let Some(v) = read_env_u32("CORVUS_JIT_STRESS_PROFILE") {
            config.stress_profile_seed = v;
        }
        if let Some(v) = read_env_u32("CORVUS_JIT_PROFILE_CHECKS") {
            config.profile_checks = ProfileCheckLevel::from_u32(v);
        }
        if let Some(v) = read_env_u32("CORVUS_JIT_OPT") {
            config.optimizing = v > 0;
        }
        config
    }
}

fn read_env_u32(name: &str) -> Option<u32> {
    env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = JitConfig::default();
        assert!(!config.minimal_profiling);
        assert!(config.class_profiling);
        assert_eq!(config.stress_profile_seed, 0);
        assert_eq!(config.profile_checks, ProfileCheckLevel::Off);
        assert!(config.optimizing);
    }

    #[test]
    fn test_config_for_testing() {
        let config = JitConfig::for_testing();
        assert_eq!(config.profile_checks, ProfileCheckLevel::Warn);
    }

    #[test]
    fn test_check_level_from_u32() {
        assert_eq!(ProfileCheckLevel::from_u32(0), ProfileCheckLevel::Off);
        assert_eq!(ProfileCheckLevel::from_u32(1), ProfileCheckLevel::Warn);
        assert_eq!(ProfileCheckLevel::from_u32(2), ProfileCheckLevel::Assert);
        assert_eq!(ProfileCheckLevel::from_u32(7), ProfileCheckLevel::Assert);
    }
}
