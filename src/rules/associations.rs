//! Association Manager
//!
//! Attaches and detaches rules and IP lists to resources. Both endpoints are
//! checked before the link table is touched: the resource first, then the
//! target.

use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info};

use super::policy_store::PolicyStore;
use super::{Association, AssociationKind, EntityKind, PolicyError};

/// Body of `attach_rule` / `detach_rule`
#[derive(Debug, Clone, Deserialize)]
pub struct RuleLinkRequest {
    pub rule_id: String,
}

/// Body of `attach_ip_list` / `detach_ip_list`
#[derive(Debug, Clone, Deserialize)]
pub struct IpListLinkRequest {
    pub ip_list_id: String,
}

#[derive(Clone)]
pub struct AssociationManager {
    store: Arc<dyn PolicyStore>,
}

impl AssociationManager {
    pub fn new(store: Arc<dyn PolicyStore>) -> Self {
        Self { store }
    }

    pub async fn attach_rule(
        &self,
        resource_id: &str,
        rule_id: &str,
    ) -> Result<Association, PolicyError> {
        self.attach(AssociationKind::Rule, resource_id, rule_id).await
    }

    pub async fn detach_rule(&self, resource_id: &str, rule_id: &str) -> Result<(), PolicyError> {
        self.detach(AssociationKind::Rule, resource_id, rule_id).await
    }

    pub async fn attach_ip_list(
        &self,
        resource_id: &str,
        ip_list_id: &str,
    ) -> Result<Association, PolicyError> {
        self.attach(AssociationKind::IpList, resource_id, ip_list_id)
            .await
    }

    pub async fn detach_ip_list(
        &self,
        resource_id: &str,
        ip_list_id: &str,
    ) -> Result<(), PolicyError> {
        self.detach(AssociationKind::IpList, resource_id, ip_list_id)
            .await
    }

    async fn attach(
        &self,
        kind: AssociationKind,
        resource_id: &str,
        target_id: &str,
    ) -> Result<Association, PolicyError> {
        self.ensure_endpoints(kind, resource_id, target_id).await?;

        let link = self
            .store
            .attach(Association::new(kind, resource_id, target_id))
            .await?;

        info!(
            "Attached {:?} {} to resource {}",
            kind, target_id, resource_id
        );
        Ok(link)
    }

    /// Removing a link that was never there is not an error
    async fn detach(
        &self,
        kind: AssociationKind,
        resource_id: &str,
        target_id: &str,
    ) -> Result<(), PolicyError> {
        self.ensure_endpoints(kind, resource_id, target_id).await?;

        if self.store.detach(kind, resource_id, target_id).await? {
            info!(
                "Detached {:?} {} from resource {}",
                kind, target_id, resource_id
            );
        } else {
            debug!(
                "No {:?} link between resource {} and {}",
                kind, resource_id, target_id
            );
        }
        Ok(())
    }

    async fn ensure_endpoints(
        &self,
        kind: AssociationKind,
        resource_id: &str,
        target_id: &str,
    ) -> Result<(), PolicyError> {
        if self.store.get_resource(resource_id).await?.is_none() {
            return Err(PolicyError::not_found(EntityKind::Resource, resource_id));
        }

        let target_exists = match kind {
            AssociationKind::Rule => self.store.get_rule(target_id).await?.is_some(),
            AssociationKind::IpList => self.store.get_ip_list(target_id).await?.is_some(),
        };

        if !target_exists {
            let entity = match kind {
                AssociationKind::Rule => EntityKind::Rule,
                AssociationKind::IpList => EntityKind::IpList,
            };
            return Err(PolicyError::not_found(entity, target_id));
        }

        Ok(())
    }
}
