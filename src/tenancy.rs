use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;

use crate::{error::AppError, repository::LeaseStore};

/// Resolves whether a user may run billing actions for an organization.
///
/// Roles and platform-admin flags are cached for a short, configured TTL so a
/// burst of admin requests does not hit the membership tables every time.
/// Role changes become visible once the entry expires.
#[derive(Clone)]
pub struct RoleResolver {
    leases: Arc<dyn LeaseStore>,
    roles: Cache<(String, String), Option<String>>,
    platform_admins: Cache<String, bool>,
    admin_roles: Vec<String>,
}

impl RoleResolver {
    pub fn new(
        leases: Arc<dyn LeaseStore>,
        admin_roles: Vec<String>,
        ttl_seconds: u64,
        max_entries: u64,
    ) -> Self {
        let ttl = Duration::from_secs(ttl_seconds.max(1));
        Self {
            leases,
            roles: Cache::builder()
                .max_capacity(max_entries.max(1))
                .time_to_live(ttl)
                .build(),
            platform_admins: Cache::builder()
                .max_capacity(max_entries.max(1))
                .time_to_live(ttl)
                .build(),
            admin_roles,
        }
    }

    pub async fn is_platform_admin(&self, user_id: &str) -> Result<bool, AppError> {
        let leases = self.leases.clone();
        let key = user_id.to_string();
        self.platform_admins
            .try_get_with(key.clone(), async move { leases.is_platform_admin(&key).await })
            .await
            .map_err(|error| AppError::Dependency(error.to_string()))
    }

    pub async fn member_role(
        &self,
        user_id: &str,
        organization_id: &str,
    ) -> Result<Option<String>, AppError> {
        let leases = self.leases.clone();
        let key = (organization_id.to_string(), user_id.to_string());
        let (org, user) = key.clone();
        self.roles
            .try_get_with(key, async move { leases.member_role(&org, &user).await })
            .await
            .map_err(|error| AppError::Dependency(error.to_string()))
    }

    /// Platform admins pass everywhere; otherwise the caller needs one of the
    /// configured admin roles in the organization.
    pub async fn assert_billing_admin(
        &self,
        user_id: &str,
        organization_id: &str,
    ) -> Result<(), AppError> {
        if user_id.trim().is_empty() {
            return Err(AppError::Unauthorized(
                "Unauthorized: missing user.".to_string(),
            ));
        }
        if self.is_platform_admin(user_id).await? {
            return Ok(());
        }
        match self.member_role(user_id, organization_id).await? {
            None => Err(AppError::Forbidden(
                "Forbidden: not a member of this organization.".to_string(),
            )),
            Some(role) if self.admin_roles.iter().any(|allowed| allowed == &role) => Ok(()),
            Some(role) => Err(AppError::Forbidden(format!(
                "Forbidden: role '{role}' is not allowed for this action."
            ))),
        }
    }
}
