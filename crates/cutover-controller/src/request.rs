//! Deployment requests as submitted by operators.

use serde::{Deserialize, Serialize};

use cutover_core::{HealthPolicy, ImageRef};

use crate::error::{ControllerError, ControllerResult};

/// Largest instance count a request may ask for.
pub const MAX_DESIRED_COUNT: u32 = 10_000;

/// Ask for `service_name` to run `image_ref`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentRequest {
    pub service_name: String,
    pub image_ref: String,
    /// Overrides the configured default policy.
    #[serde(default)]
    pub health_policy: Option<HealthPolicy>,
    /// Used only when the service has no live task set to copy from.
    #[serde(default)]
    pub desired_count: Option<u32>,
    #[serde(default)]
    pub secret_refs: Vec<String>,
}

impl DeploymentRequest {
    pub fn new(service_name: &str, image_ref: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            image_ref: image_ref.to_string(),
            health_policy: None,
            desired_count: None,
            secret_refs: Vec::new(),
        }
    }

    pub fn with_policy(mut self, policy: HealthPolicy) -> Self {
        self.health_policy = Some(policy);
        self
    }

    pub fn with_desired_count(mut self, count: u32) -> Self {
        self.desired_count = Some(count);
        self
    }

    /// Syntax checks only; nothing here touches infrastructure.
    pub fn validate(&self) -> ControllerResult<()> {
        let name = self.service_name.as_str();
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(ControllerError::InvalidRequest(format!(
                "invalid service name {name:?}"
            )));
        }
        ImageRef::parse(&self.image_ref)
            .map_err(|e| ControllerError::InvalidRequest(e.to_string()))?;
        if let Some(policy) = &self.health_policy {
            policy
                .validate()
                .map_err(|e| ControllerError::InvalidRequest(e.to_string()))?;
        }
        match self.desired_count {
            Some(0) => {
                return Err(ControllerError::InvalidRequest(
                    "desired_count must be at least 1".to_string(),
                ));
            }
            Some(n) if n > MAX_DESIRED_COUNT => {
                return Err(ControllerError::InvalidRequest(format!(
                    "desired_count must not exceed {MAX_DESIRED_COUNT}"
                )));
            }
            _ => {}
        }
        if let Some(secret) = self.secret_refs.iter().find(|s| s.trim().is_empty()) {
            return Err(ControllerError::InvalidRequest(format!(
                "empty secret reference {secret:?}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_minimal_request() {
        DeploymentRequest::new("web", "registry.example.com/shop/web:v2")
            .validate()
            .unwrap();
    }

    #[test]
    fn rejects_bad_fields() {
        let bad_name = DeploymentRequest::new("web app", "web:v2");
        assert!(matches!(bad_name.validate(), Err(ControllerError::InvalidRequest(_))));

        let bad_image = DeploymentRequest::new("web", "WEB::v2");
        assert!(matches!(bad_image.validate(), Err(ControllerError::InvalidRequest(_))));

        let zero = DeploymentRequest::new("web", "web:v2").with_desired_count(0);
        assert!(matches!(zero.validate(), Err(ControllerError::InvalidRequest(_))));

        let huge = DeploymentRequest::new("web", "web:v2").with_desired_count(u32::MAX);
        assert!(matches!(huge.validate(), Err(ControllerError::InvalidRequest(_))));

        let policy = HealthPolicy {
            evaluation_window: 0,
            ..HealthPolicy::default()
        };
        let bad_policy = DeploymentRequest::new("web", "web:v2").with_policy(policy);
        assert!(matches!(bad_policy.validate(), Err(ControllerError::InvalidRequest(_))));
    }

    #[test]
    fn deserializes_with_defaults() {
        let request: DeploymentRequest =
            serde_json::from_str(r#"{"service_name":"web","image_ref":"web:v2"}"#).unwrap();
        assert_eq!(request, DeploymentRequest::new("web", "web:v2"));

        let request: DeploymentRequest = serde_json::from_str(
            r#"{"service_name":"web","image_ref":"web:v2","desired_count":3,
                "health_policy":{"evaluation_window":2,"probe_interval":"1s","probe_timeout":"500ms"},
                "secret_refs":["DB_PASSWORD"]}"#,
        )
        .unwrap();
        assert_eq!(request.desired_count, Some(3));
        assert_eq!(request.health_policy.unwrap().evaluation_window, 2);
        assert_eq!(request.secret_refs, vec!["DB_PASSWORD".to_string()]);
    }

    #[test]
    fn rejects_unbounded_policy_durations() {
        let request: DeploymentRequest = serde_json::from_str(
            r#"{"service_name":"web","image_ref":"web:v2",
                "health_policy":{"deployment_timeout":"18446744073709551615s"}}"#,
        )
        .unwrap();
        assert!(matches!(request.validate(), Err(ControllerError::InvalidRequest(_))));

        let overflowing = serde_json::from_str::<DeploymentRequest>(
            r#"{"service_name":"web","image_ref":"web:v2",
                "health_policy":{"deployment_timeout":"307445734561825861m"}}"#,
        );
        assert!(overflowing.is_err());
    }
}
