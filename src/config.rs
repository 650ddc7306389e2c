//! Environment-probed knobs this core reads directly.  The broader
//! activation decision (whether the process routes `malloc` through
//! this allocator at all) belongs to the external C-ABI wrapper; this
//! module only covers the two settings the core itself consults.
use std::time::Duration;

const SCAVENGE_MS_VAR: &str = "SLAB_ALLOCATOR_SCAVENGE_MS";
const ENABLED_VAR: &str = "SLAB_ALLOCATOR_ENABLED";

const DEFAULT_SCAVENGE_MS: u64 = 500;

#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub enabled: bool,
    pub scavenge_sleep_duration: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            enabled: true,
            scavenge_sleep_duration: Duration::from_millis(DEFAULT_SCAVENGE_MS),
        }
    }
}

impl Config {
    /// Builds a `Config` from the process environment, falling back
    /// to defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let mut config = Config::default();

        if let Ok(value) = std::env::var(ENABLED_VAR) {
            if let Ok(parsed) = value.parse::<bool>() {
                config.enabled = parsed;
            } else {
                log::warn!("{} has an unparseable value: {:?}", ENABLED_VAR, value);
            }
        }

        if let Ok(value) = std::env::var(SCAVENGE_MS_VAR) {
            match value.parse::<u64>() {
                Ok(ms) => config.scavenge_sleep_duration = Duration::from_millis(ms),
                Err(_) => log::warn!("{} has an unparseable value: {:?}", SCAVENGE_MS_VAR, value),
            }
        }

        config
    }
}

lazy_static::lazy_static! {
    pub(crate) static ref CONFIG: Config = Config::from_env();
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert!(config.enabled);
        assert_eq!(config.scavenge_sleep_duration, Duration::from_millis(DEFAULT_SCAVENGE_MS));
    }
}
