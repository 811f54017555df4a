use std::time::Duration;

use verity_core::config::Config;

use crate::impersonation::ImpersonationSettings;
use crate::verifier::VerifierSettings;

/// Timings and policies for one [`crate::AuthCoordinator`].
#[derive(Debug, Clone)]
pub struct AuthSettings {
    pub positive_ttl: Duration,
    pub negative_ttl: Duration,
    pub verifier: VerifierSettings,
    pub transition_deadline: Duration,
    pub device_binding: bool,
    pub grace_window: Duration,
    pub impersonation: ImpersonationSettings,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            positive_ttl: Duration::from_secs(30),
            negative_ttl: Duration::from_secs(3),
            verifier: VerifierSettings::default(),
            transition_deadline: Duration::from_secs(30),
            device_binding: true,
            grace_window: Duration::from_secs(10),
            impersonation: ImpersonationSettings::default(),
        }
    }
}

impl AuthSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            positive_ttl: Duration::from_secs(config.session.positive_ttl_secs),
            negative_ttl: Duration::from_secs(config.session.negative_ttl_secs),
            verifier: VerifierSettings {
                refresh_buffer: Duration::from_secs(config.session.refresh_buffer_secs),
                race_settle_delay: Duration::from_millis(config.session.race_settle_delay_ms),
            },
            transition_deadline: Duration::from_secs(config.transitions.deadline_secs),
            device_binding: config.device.binding_enabled,
            grace_window: Duration::from_secs(config.device.grace_window_secs),
            impersonation: ImpersonationSettings {
                login_path: config.impersonation.login_path.clone(),
                preserved_keys: config.impersonation.preserved_keys.clone(),
            },
        }
    }
}
