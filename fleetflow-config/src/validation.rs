use thiserror::Error;

use crate::models::FleetflowConfig;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigGuardRailError {
    #[error("scheduler.workers must be at least 1")]
    NoWorkers,
    #[error("lease.lease_ttl_secs must be positive, got {0}")]
    NonPositiveLeaseTtl(i64),
    #[error("retry.max_attempts must be at least 1")]
    NoRetryAttempts,
    #[error("{field} must be in (0, 1], got {value}")]
    FractionOutOfRange { field: &'static str, value: f64 },
}

#[derive(Debug, Clone)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct ConfigWarnings {
    pub items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    pub fn push<S: Into<String>>(&mut self, message: S) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: None,
        });
    }

    pub fn push_with_hint<S: Into<String>, H: Into<String>>(
        &mut self,
        message: S,
        hint: H,
    ) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

pub fn apply_guard_rails(
    config: &FleetflowConfig,
) -> Result<ConfigWarnings, ConfigGuardRailError> {
    let orchestrator = &config.orchestrator;
    let mut warnings = ConfigWarnings::default();

    if orchestrator.scheduler.workers == 0 {
        return Err(ConfigGuardRailError::NoWorkers);
    }
    if orchestrator.lease.lease_ttl_secs <= 0 {
        return Err(ConfigGuardRailError::NonPositiveLeaseTtl(
            orchestrator.lease.lease_ttl_secs,
        ));
    }
    if orchestrator.retry.max_attempts == 0 {
        return Err(ConfigGuardRailError::NoRetryAttempts);
    }
    check_fraction(
        "hunts.default_max_error_fraction",
        orchestrator.hunts.default_max_error_fraction,
    )?;
    // Zero jitter is allowed.
    if orchestrator.retry.jitter_ratio != 0.0 {
        check_fraction("retry.jitter_ratio", f64::from(orchestrator.retry.jitter_ratio))?;
    }

    if orchestrator.throttle.dup_interval_secs == 0 {
        warnings.push_with_hint(
            "duplicate flow suppression is disabled",
            "Set orchestrator.throttle.dup_interval_secs to re-enable it",
        );
    }

    let housekeeping_secs = orchestrator.lease.housekeeper_interval_ms / 1_000;
    if housekeeping_secs >= orchestrator.lease.lease_ttl_secs.unsigned_abs() {
        warnings.push_with_hint(
            "housekeeper runs less often than leases expire",
            "Lower lease.housekeeper_interval_ms so stale leases are noticed promptly",
        );
    }

    Ok(warnings)
}

fn check_fraction(field: &'static str, value: f64) -> Result<(), ConfigGuardRailError> {
    if value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        Err(ConfigGuardRailError::FractionOutOfRange { field, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass() {
        let warnings = apply_guard_rails(&FleetflowConfig::default()).expect("defaults are valid");
        assert!(warnings.is_empty(), "{warnings:?}");
    }

    #[test]
    fn rejects_zero_workers_and_bad_ttl() {
        let mut config = FleetflowConfig::default();
        config.orchestrator.scheduler.workers = 0;
        assert_eq!(apply_guard_rails(&config).unwrap_err(), ConfigGuardRailError::NoWorkers);

        let mut config = FleetflowConfig::default();
        config.orchestrator.lease.lease_ttl_secs = 0;
        assert_eq!(
            apply_guard_rails(&config).unwrap_err(),
            ConfigGuardRailError::NonPositiveLeaseTtl(0)
        );

        let mut config = FleetflowConfig::default();
        config.orchestrator.retry.max_attempts = 0;
        assert_eq!(
            apply_guard_rails(&config).unwrap_err(),
            ConfigGuardRailError::NoRetryAttempts
        );
    }

    #[test]
    fn rejects_fractions_outside_unit_interval() {
        for value in [0.0, -0.5, 1.5] {
            let mut config = FleetflowConfig::default();
            config.orchestrator.hunts.default_max_error_fraction = value;
            assert!(matches!(
                apply_guard_rails(&config),
                Err(ConfigGuardRailError::FractionOutOfRange { .. })
            ));
        }
    }

    #[test]
    fn disabled_throttle_warns() {
        let mut config = FleetflowConfig::default();
        config.orchestrator.throttle.dup_interval_secs = 0;
        let warnings = apply_guard_rails(&config).expect("still valid");
        assert_eq!(warnings.items.len(), 1);
        assert!(warnings.items[0].hint.is_some());
    }
}
