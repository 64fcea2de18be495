use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::remote::{DeliveryError, ErrorCategory, OfficerProfile, ReportApi};
use crate::retry::poll_until;

pub const PROFILE_WAIT_ATTEMPTS: u32 = 10;
pub const PROFILE_WAIT_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("server unreachable while loading officer profile: {0}")]
    Unreachable(DeliveryError),

    #[error("officer profile request rejected: {0}")]
    Rejected(DeliveryError),

    #[error("officer profile not found after {attempts} attempts")]
    ProfileMissing { attempts: u32 },

    #[error("account role {role:?} is not a security officer")]
    NotSecurityOfficer { role: String },

    #[error("officer {officer_id} has no assigned unit")]
    NotAssigned { officer_id: String },
}

impl SessionError {
    /// Reports can still be captured offline; they sync once the profile
    /// check passes.
    pub fn allows_offline_capture(&self) -> bool {
        matches!(self, SessionError::Unreachable(_))
    }
}

/// Waits for the signed-in officer's profile row, which the backend may
/// create a moment after sign-in, then checks the officer may file reports.
pub async fn wait_for_officer(
    api: &dyn ReportApi,
    attempts: u32,
    delay: Duration,
) -> Result<OfficerProfile, SessionError> {
    let profile = poll_until(attempts, delay, |attempt| async move {
        let result = api.current_officer().await;
        if matches!(result, Ok(None)) {
            debug!(attempt, "officer profile not ready yet");
        }
        result
    })
    .await
    .map_err(|e| match e.category {
        ErrorCategory::Network | ErrorCategory::Timeout => {
            warn!(error = %e, "profile check failed, continuing offline");
            SessionError::Unreachable(e)
        }
        _ => SessionError::Rejected(e),
    })?
    .ok_or(SessionError::ProfileMissing { attempts })?;

    if !profile.is_security() {
        return Err(SessionError::NotSecurityOfficer { role: profile.role });
    }
    if profile.assigned_unit_id.as_deref().map_or(true, str::is_empty) {
        return Err(SessionError::NotAssigned {
            officer_id: profile.id,
        });
    }

    info!(officer_id = %profile.id, "officer profile verified");
    Ok(profile)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{security_officer, FakeReportApi};

    #[tokio::test(start_paused = true)]
    async fn profile_appears_after_a_few_polls() {
        let api = FakeReportApi::new();
        api.push_profile_response(Ok(None));
        api.push_profile_response(Ok(None));
        api.set_profile(Some(security_officer(Some("unit-7"))));

        let profile = wait_for_officer(&api, PROFILE_WAIT_ATTEMPTS, PROFILE_WAIT_DELAY)
            .await
            .unwrap();
        assert_eq!(profile.assigned_unit_id.as_deref(), Some("unit-7"));
        assert_eq!(api.profile_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_bounded_attempts() {
        let api = FakeReportApi::new();
        let err = wait_for_officer(&api, PROFILE_WAIT_ATTEMPTS, PROFILE_WAIT_DELAY)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::ProfileMissing { attempts: 10 }));
        assert_eq!(api.profile_calls(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn wrong_role_is_rejected() {
        let api = FakeReportApi::new();
        let mut admin = security_officer(Some("unit-1"));
        admin.role = "admin".into();
        api.set_profile(Some(admin));

        let err = wait_for_officer(&api, 3, PROFILE_WAIT_DELAY).await.unwrap_err();
        assert!(matches!(err, SessionError::NotSecurityOfficer { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn unassigned_officer_is_rejected() {
        let api = FakeReportApi::new();
        api.set_profile(Some(security_officer(None)));
        let err = wait_for_officer(&api, 3, PROFILE_WAIT_DELAY).await.unwrap_err();
        assert!(matches!(err, SessionError::NotAssigned { .. }));
        assert!(!err.allows_offline_capture());
    }

    #[tokio::test(start_paused = true)]
    async fn network_failure_stops_polling_but_allows_capture() {
        let api = FakeReportApi::new();
        api.push_profile_response(Err(ErrorCategory::Network));
        let err = wait_for_officer(&api, PROFILE_WAIT_ATTEMPTS, PROFILE_WAIT_DELAY)
            .await
            .unwrap_err();
        assert!(err.allows_offline_capture());
        assert_eq!(api.profile_calls(), 1);
    }
}
