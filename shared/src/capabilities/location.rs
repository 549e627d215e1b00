use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::model::{LatLon, ValidatedCoordinate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PermissionState {
    #[default]
    Unknown,
    Granted,
    Denied,
    Restricted,
}

impl PermissionState {
    pub fn is_granted(self) -> bool {
        matches!(self, PermissionState::Granted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LocationAccuracy {
    Low,
    #[default]
    Balanced,
    High,
}

#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocationError {
    #[error("location permission denied")]
    PermissionDenied,
    #[error("location services unavailable: {0}")]
    Unavailable(String),
    #[error("location request timed out")]
    Timeout,
}

/// Device positioning, gated by a runtime permission.
#[async_trait::async_trait]
pub trait DeviceLocation: Send + Sync {
    async fn permission(&self) -> PermissionState;
    async fn current_position(&self, accuracy: LocationAccuracy) -> Result<LatLon, LocationError>;
}

/// Best-effort user position. Every failure degrades to `None`.
pub async fn resolve_user_location(
    location: &dyn DeviceLocation,
    accuracy: LocationAccuracy,
    timeout: Duration,
) -> Option<ValidatedCoordinate> {
    let permission = location.permission().await;
    if !permission.is_granted() {
        debug!(?permission, "location not permitted, distances unavailable");
        return None;
    }

    let fix = match tokio::time::timeout(timeout, location.current_position(accuracy)).await {
        Ok(Ok(fix)) => fix,
        Ok(Err(e)) => {
            warn!(error = %e, "failed to read device position");
            return None;
        }
        Err(_) => {
            warn!("device position request timed out");
            return None;
        }
    };

    match fix.validate() {
        Ok(coord) => Some(coord),
        Err(e) => {
            warn!(error = %e, "device reported an unusable position");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedLocation {
        permission: PermissionState,
        fix: Result<LatLon, LocationError>,
    }

    #[async_trait::async_trait]
    impl DeviceLocation for FixedLocation {
        async fn permission(&self) -> PermissionState {
            self.permission
        }

        async fn current_position(&self, _: LocationAccuracy) -> Result<LatLon, LocationError> {
            self.fix.clone()
        }
    }

    const TIMEOUT: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn denied_permission_yields_none() {
        let loc = FixedLocation {
            permission: PermissionState::Denied,
            fix: Ok(LatLon::new(12.0, 77.0)),
        };
        assert!(resolve_user_location(&loc, LocationAccuracy::High, TIMEOUT)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn provider_error_yields_none() {
        let loc = FixedLocation {
            permission: PermissionState::Granted,
            fix: Err(LocationError::Unavailable("gps off".into())),
        };
        assert!(resolve_user_location(&loc, LocationAccuracy::High, TIMEOUT)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn placeholder_fix_yields_none() {
        let loc = FixedLocation {
            permission: PermissionState::Granted,
            fix: Ok(LatLon::new(0.0, 0.0)),
        };
        assert!(resolve_user_location(&loc, LocationAccuracy::Low, TIMEOUT)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn granted_valid_fix_is_returned() {
        let loc = FixedLocation {
            permission: PermissionState::Granted,
            fix: Ok(LatLon::new(12.97, 77.59)),
        };
        let coord = resolve_user_location(&loc, LocationAccuracy::Balanced, TIMEOUT)
            .await
            .unwrap();
        assert_eq!(coord.lat(), 12.97);
    }
}
