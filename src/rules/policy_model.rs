//! Policy Model
//!
//! Create, update, fetch and list resources, rules and IP lists. Inputs are
//! validated before they reach the store; updates merge only the fields the
//! caller actually supplied.

use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::policy_store::PolicyStore;
use super::{
    current_timestamp, generate_id, parse_cidr, ActionType, ActiveFlag, AttackType, EntityKind,
    IpList, PolicyError, Resource, ResourceWithPolicies, Rule,
};

// =============================================================================
// INPUTS
// =============================================================================

/// Resource fields as supplied by a caller, used for create and update
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ResourceInput {
    pub name: String,
    pub http_method: String,
    pub url: String,
    pub host: String,
    pub creator_id: String,
    pub is_active: ActiveFlag,
}

impl ResourceInput {
    fn validate_new(&self) -> Result<(), PolicyError> {
        require("name", &self.name)?;
        require("http_method", &self.http_method)?;
        require("url", &self.url)?;
        require("host", &self.host)?;
        require("creator_id", &self.creator_id)
    }

    fn has_updates(&self) -> bool {
        [&self.name, &self.http_method, &self.url, &self.host]
            .iter()
            .any(|field| supplied(field).is_some())
            || self.is_active.is_set()
    }
}

/// Rule fields as supplied by a caller
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RuleInput {
    pub name: String,
    pub attack_type: String,
    pub action_type: String,
    pub creator_id: String,
    pub is_active: ActiveFlag,
}

impl RuleInput {
    fn validate_new(&self) -> Result<(), PolicyError> {
        require("name", &self.name)?;
        require("attack_type", &self.attack_type)?;
        require("action_type", &self.action_type)?;
        require("creator_id", &self.creator_id)
    }

    fn has_updates(&self) -> bool {
        [&self.name, &self.attack_type, &self.action_type]
            .iter()
            .any(|field| supplied(field).is_some())
            || self.is_active.is_set()
    }
}

/// IP list fields as supplied by a caller
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct IpListInput {
    pub ip: String,
    pub list_type: String,
    pub creator_id: String,
}

impl IpListInput {
    fn validate_new(&self) -> Result<(), PolicyError> {
        require("ip", &self.ip)?;
        require("list_type", &self.list_type)?;
        require("creator_id", &self.creator_id)
    }

    fn has_updates(&self) -> bool {
        supplied(&self.ip).is_some() || supplied(&self.list_type).is_some()
    }
}

/// Empty strings count as "not supplied"
fn supplied(value: &str) -> Option<&str> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

fn require(field: &str, value: &str) -> Result<(), PolicyError> {
    match supplied(value) {
        Some(_) => Ok(()),
        None => Err(PolicyError::ValidationFailed(format!(
            "{} is required",
            field
        ))),
    }
}

fn nothing_to_update() -> PolicyError {
    PolicyError::ValidationFailed("at least one field must be provided".to_string())
}

// =============================================================================
// MERGE
// =============================================================================

impl Resource {
    /// Apply the supplied fields of `update`
    pub fn merge(&mut self, update: &ResourceInput) {
        if let Some(name) = supplied(&update.name) {
            self.name = name.to_string();
        }
        if let Some(method) = supplied(&update.http_method) {
            self.http_method = method.to_string();
        }
        if let Some(url) = supplied(&update.url) {
            self.url = url.to_string();
        }
        if let Some(host) = supplied(&update.host) {
            self.host = host.to_string();
        }
        if update.is_active.is_set() {
            self.is_active = update.is_active;
        }
    }
}

impl Rule {
    /// Apply the supplied fields of `update`. The action type is parsed
    /// before anything is written, so a bad value leaves the rule untouched.
    pub fn merge(&mut self, update: &RuleInput) -> Result<(), PolicyError> {
        let action = supplied(&update.action_type)
            .map(str::parse::<ActionType>)
            .transpose()?;

        if let Some(name) = supplied(&update.name) {
            self.name = name.to_string();
        }
        if let Some(attack) = supplied(&update.attack_type) {
            self.attack_type = AttackType::from(attack);
        }
        if let Some(action) = action {
            self.action_type = action;
        }
        if update.is_active.is_set() {
            self.is_active = update.is_active;
        }
        Ok(())
    }
}

impl IpList {
    /// Apply the supplied fields of `update`
    pub fn merge(&mut self, update: &IpListInput) -> Result<(), PolicyError> {
        let network = supplied(&update.ip).map(parse_cidr).transpose()?;

        if let Some(network) = network {
            self.ip = network;
        }
        if let Some(list_type) = supplied(&update.list_type) {
            self.list_type = list_type.to_string();
        }
        Ok(())
    }
}

// =============================================================================
// SERVICE
// =============================================================================

/// Validating front of the policy store
#[derive(Clone)]
pub struct PolicyService {
    store: Arc<dyn PolicyStore>,
}

impl PolicyService {
    pub fn new(store: Arc<dyn PolicyStore>) -> Self {
        Self { store }
    }

    // ----- resources -----

    pub async fn create_resource(&self, input: ResourceInput) -> Result<Resource, PolicyError> {
        input.validate_new()?;

        let resource = Resource {
            id: generate_id("res"),
            name: input.name,
            http_method: input.http_method,
            url: input.url,
            host: input.host,
            creator_id: input.creator_id,
            is_active: input.is_active,
            created_at: current_timestamp(),
        };

        let stored = self.store.insert_resource(resource).await?;
        info!(
            "Created resource {} ({} {})",
            stored.id, stored.http_method, stored.url
        );
        Ok(stored)
    }

    pub async fn update_resource(
        &self,
        id: &str,
        update: ResourceInput,
    ) -> Result<Resource, PolicyError> {
        if !update.has_updates() {
            return Err(nothing_to_update());
        }

        let mut resource = self.get_resource(id).await?;
        resource.merge(&update);

        let stored = self.store.update_resource(resource).await?;
        info!("Updated resource {}", stored.id);
        Ok(stored)
    }

    pub async fn get_resource(&self, id: &str) -> Result<Resource, PolicyError> {
        self.store
            .get_resource(id)
            .await?
            .ok_or_else(|| PolicyError::not_found(EntityKind::Resource, id))
    }

    /// A resource joined with its attached rules and IP lists
    pub async fn get_resource_with_policies(
        &self,
        id: &str,
    ) -> Result<ResourceWithPolicies, PolicyError> {
        let resource = self.get_resource(id).await?;
        let rules = self.store.rules_for_resource(id).await?;
        let ip_lists = self.store.ip_lists_for_resource(id).await?;

        Ok(ResourceWithPolicies {
            resource,
            rules,
            ip_lists,
        })
    }

    /// Active resources with their attached policies.
    ///
    /// A resource whose nested lists fail to load is still listed, with
    /// empty `rules` / `ip_lists`.
    pub async fn list_resources(&self) -> Result<Vec<ResourceWithPolicies>, PolicyError> {
        let resources = self.store.list_resources().await?;
        let mut listed = Vec::new();

        for resource in resources.into_iter().filter(|r| r.is_active.is_enabled()) {
            let rules = match self.store.rules_for_resource(&resource.id).await {
                Ok(rules) => rules,
                Err(e) => {
                    warn!("Failed to load rules for resource {}: {}", resource.id, e);
                    Vec::new()
                }
            };

            let ip_lists = match self.store.ip_lists_for_resource(&resource.id).await {
                Ok(ip_lists) => ip_lists,
                Err(e) => {
                    warn!("Failed to load ip lists for resource {}: {}", resource.id, e);
                    Vec::new()
                }
            };

            listed.push(ResourceWithPolicies {
                resource,
                rules,
                ip_lists,
            });
        }

        debug!("Listed {} active resources", listed.len());
        Ok(listed)
    }

    // ----- rules -----

    pub async fn create_rule(&self, input: RuleInput) -> Result<Rule, PolicyError> {
        input.validate_new()?;
        let action_type = input.action_type.parse::<ActionType>()?;

        let rule = Rule {
            id: generate_id("rule"),
            name: input.name,
            attack_type: AttackType::from(input.attack_type),
            action_type,
            is_active: input.is_active,
            creator_id: input.creator_id,
            created_at: current_timestamp(),
        };

        let stored = self.store.insert_rule(rule).await?;
        info!(
            "Created rule {} ({} -> {})",
            stored.id, stored.attack_type, stored.action_type
        );
        Ok(stored)
    }

    pub async fn update_rule(&self, id: &str, update: RuleInput) -> Result<Rule, PolicyError> {
        if !update.has_updates() {
            return Err(nothing_to_update());
        }

        let mut rule = self.get_rule(id).await?;
        rule.merge(&update)?;

        let stored = self.store.update_rule(rule).await?;
        info!("Updated rule {}", stored.id);
        Ok(stored)
    }

    pub async fn get_rule(&self, id: &str) -> Result<Rule, PolicyError> {
        self.store
            .get_rule(id)
            .await?
            .ok_or_else(|| PolicyError::not_found(EntityKind::Rule, id))
    }

    /// Active rules only
    pub async fn list_rules(&self) -> Result<Vec<Rule>, PolicyError> {
        let rules = self.store.list_rules().await?;
        Ok(rules
            .into_iter()
            .filter(|r| r.is_active.is_enabled())
            .collect())
    }

    // ----- ip lists -----

    pub async fn create_ip_list(&self, input: IpListInput) -> Result<IpList, PolicyError> {
        input.validate_new()?;
        let network = parse_cidr(&input.ip)?;

        let ip_list = IpList {
            id: generate_id("ipl"),
            ip: network,
            list_type: input.list_type,
            creator_id: input.creator_id,
            created_at: current_timestamp(),
        };

        let stored = self.store.insert_ip_list(ip_list).await?;
        info!(
            "Created ip list {} ({} {})",
            stored.id, stored.list_type, stored.ip
        );
        Ok(stored)
    }

    pub async fn update_ip_list(
        &self,
        id: &str,
        update: IpListInput,
    ) -> Result<IpList, PolicyError> {
        if !update.has_updates() {
            return Err(nothing_to_update());
        }

        let mut ip_list = self.get_ip_list(id).await?;
        ip_list.merge(&update)?;

        let stored = self.store.update_ip_list(ip_list).await?;
        info!("Updated ip list {}", stored.id);
        Ok(stored)
    }

    pub async fn get_ip_list(&self, id: &str) -> Result<IpList, PolicyError> {
        self.store
            .get_ip_list(id)
            .await?
            .ok_or_else(|| PolicyError::not_found(EntityKind::IpList, id))
    }

    pub async fn list_ip_lists(&self) -> Result<Vec<IpList>, PolicyError> {
        self.store.list_ip_lists().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::policy_store::{InMemoryPolicyStore, PolicyLookup};
    use crate::rules::{Association, AssociationKind};
    use async_trait::async_trait;

    fn service() -> (PolicyService, Arc<InMemoryPolicyStore>) {
        let store = Arc::new(InMemoryPolicyStore::new());
        (PolicyService::new(store.clone()), store)
    }

    fn resource_input() -> ResourceInput {
        ResourceInput {
            name: "login".to_string(),
            http_method: "POST".to_string(),
            url: "/api/login".to_string(),
            host: "http://auth:8080".to_string(),
            creator_id: "user-1".to_string(),
            is_active: ActiveFlag::Enabled,
        }
    }

    fn rule_input(attack: &str, action: &str) -> RuleInput {
        RuleInput {
            name: format!("{}-{}", attack, action),
            attack_type: attack.to_string(),
            action_type: action.to_string(),
            creator_id: "user-1".to_string(),
            is_active: ActiveFlag::Enabled,
        }
    }

    #[tokio::test]
    async fn test_create_resource_echoes_input() {
        let (service, _) = service();
        let input = resource_input();
        let created = service.create_resource(input.clone()).await.unwrap();

        assert!(!created.id.is_empty());
        assert_eq!(created.name, input.name);
        assert_eq!(created.http_method, input.http_method);
        assert_eq!(created.url, input.url);
        assert_eq!(created.host, input.host);
        assert_eq!(created.creator_id, input.creator_id);
        assert_eq!(created.is_active, ActiveFlag::Enabled);

        assert_eq!(service.get_resource(&created.id).await.unwrap(), created);
    }

    #[tokio::test]
    async fn test_create_resource_requires_fields() {
        let (service, _) = service();
        let mut input = resource_input();
        input.host = String::new();

        let err = service.create_resource(input).await.unwrap_err();
        assert_eq!(
            err,
            PolicyError::ValidationFailed("host is required".to_string())
        );
    }

    #[tokio::test]
    async fn test_empty_update_is_rejected() {
        let (service, _) = service();
        let created = service.create_resource(resource_input()).await.unwrap();

        let err = service
            .update_resource(&created.id, ResourceInput::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PolicyError::ValidationFailed(_)));
    }

    #[tokio::test]
    async fn test_single_field_update_leaves_others_untouched() {
        let (service, _) = service();
        let created = service.create_resource(resource_input()).await.unwrap();

        let updated = service
            .update_resource(
                &created.id,
                ResourceInput {
                    url: "/api/v2/login".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.url, "/api/v2/login");
        assert_eq!(
            Resource {
                url: created.url.clone(),
                ..updated.clone()
            },
            created
        );
    }

    #[tokio::test]
    async fn test_explicit_false_overwrites_but_unset_does_not() {
        let (service, _) = service();
        let created = service.create_rule(rule_input("xss", "block")).await.unwrap();

        let renamed = service
            .update_rule(
                &created.id,
                RuleInput {
                    name: "renamed".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(renamed.is_active, ActiveFlag::Enabled);

        let disabled = service
            .update_rule(
                &created.id,
                RuleInput {
                    is_active: ActiveFlag::Disabled,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(disabled.is_active, ActiveFlag::Disabled);
        assert_eq!(disabled.name, "renamed");
    }

    #[tokio::test]
    async fn test_update_missing_resource_is_not_found() {
        let (service, _) = service();
        let err = service
            .update_resource(
                "res_missing",
                ResourceInput {
                    name: "x".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err, PolicyError::not_found(EntityKind::Resource, "res_missing"));
    }

    #[tokio::test]
    async fn test_rule_action_type_is_validated() {
        let (service, _) = service();
        let err = service
            .create_rule(rule_input("xss", "quarantine"))
            .await
            .unwrap_err();
        assert!(matches!(err, PolicyError::ValidationFailed(_)));

        let created = service.create_rule(rule_input("xss", "escape")).await.unwrap();
        let err = service
            .update_rule(
                &created.id,
                RuleInput {
                    name: "should-not-stick".to_string(),
                    action_type: "explode".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PolicyError::ValidationFailed(_)));
        assert_eq!(service.get_rule(&created.id).await.unwrap(), created);
    }

    #[tokio::test]
    async fn test_unknown_attack_type_is_accepted() {
        let (service, _) = service();
        let created = service
            .create_rule(rule_input("ssrf", "block"))
            .await
            .unwrap();
        assert_eq!(
            created.attack_type,
            AttackType::Unrecognized("ssrf".to_string())
        );
    }

    #[tokio::test]
    async fn test_ip_list_is_normalized() {
        let (service, _) = service();
        let created = service
            .create_ip_list(IpListInput {
                ip: "10.0.0.5/24".to_string(),
                list_type: "blacklist".to_string(),
                creator_id: "user-1".to_string(),
            })
            .await
            .unwrap();

        let fetched = service.get_ip_list(&created.id).await.unwrap();
        assert_eq!(fetched.ip.to_string(), "10.0.0.0/24");
        assert_eq!(fetched.list_type, "blacklist");
    }

    #[tokio::test]
    async fn test_ip_list_rejects_bad_cidr() {
        let (service, _) = service();
        for ip in ["10.0.0.5", "300.0.0.0/8", "garbage"] {
            let err = service
                .create_ip_list(IpListInput {
                    ip: ip.to_string(),
                    list_type: "whitelist".to_string(),
                    creator_id: "user-1".to_string(),
                })
                .await
                .unwrap_err();
            assert!(matches!(err, PolicyError::InvalidCidr(_)), "accepted {}", ip);
        }
    }

    #[tokio::test]
    async fn test_ip_list_update_changes_only_supplied_fields() {
        let (service, _) = service();
        let created = service
            .create_ip_list(IpListInput {
                ip: "192.168.0.0/16".to_string(),
                list_type: "whitelist".to_string(),
                creator_id: "user-1".to_string(),
            })
            .await
            .unwrap();

        let updated = service
            .update_ip_list(
                &created.id,
                IpListInput {
                    list_type: "blacklist".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.ip, created.ip);
        assert_eq!(updated.list_type, "blacklist");
        assert_eq!(updated.creator_id, created.creator_id);
    }

    #[tokio::test]
    async fn test_get_missing_entities() {
        let (service, _) = service();
        assert!(matches!(
            service.get_rule("rule_nope").await,
            Err(PolicyError::NotFound { entity: EntityKind::Rule, .. })
        ));
        assert!(matches!(
            service.get_ip_list("ipl_nope").await,
            Err(PolicyError::NotFound { entity: EntityKind::IpList, .. })
        ));
    }

    #[tokio::test]
    async fn test_list_resources_joins_policies_and_skips_inactive() {
        let (service, store) = service();
        let active = service.create_resource(resource_input()).await.unwrap();
        service
            .create_resource(ResourceInput {
                is_active: ActiveFlag::Disabled,
                ..resource_input()
            })
            .await
            .unwrap();

        let rule = service.create_rule(rule_input("sqli", "escape")).await.unwrap();
        store
            .attach(Association::new(AssociationKind::Rule, &active.id, &rule.id))
            .await
            .unwrap();

        let listed = service.list_resources().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].resource, active);
        assert_eq!(listed[0].rules, vec![rule]);
        assert!(listed[0].ip_lists.is_empty());
    }

    #[tokio::test]
    async fn test_list_rules_returns_active_only() {
        let (service, _) = service();
        let active = service.create_rule(rule_input("xss", "block")).await.unwrap();
        service
            .create_rule(RuleInput {
                is_active: ActiveFlag::Unset,
                ..rule_input("csrf", "block")
            })
            .await
            .unwrap();

        assert_eq!(service.list_rules().await.unwrap(), vec![active]);
    }

    /// Store whose nested lookups always fail
    struct BrokenJoinStore(InMemoryPolicyStore);

    #[async_trait]
    impl PolicyLookup for BrokenJoinStore {
        async fn ip_lists_by_url(&self, path: &str, method: &str) -> Result<Vec<IpList>, PolicyError> {
            self.0.ip_lists_by_url(path, method).await
        }

        async fn rules_by_url(&self, path: &str, method: &str) -> Result<Vec<Rule>, PolicyError> {
            self.0.rules_by_url(path, method).await
        }
    }

    #[async_trait]
    impl PolicyStore for BrokenJoinStore {
        async fn insert_resource(&self, resource: Resource) -> Result<Resource, PolicyError> {
            self.0.insert_resource(resource).await
        }
        async fn update_resource(&self, resource: Resource) -> Result<Resource, PolicyError> {
            self.0.update_resource(resource).await
        }
        async fn get_resource(&self, id: &str) -> Result<Option<Resource>, PolicyError> {
            self.0.get_resource(id).await
        }
        async fn list_resources(&self) -> Result<Vec<Resource>, PolicyError> {
            self.0.list_resources().await
        }
        async fn insert_rule(&self, rule: Rule) -> Result<Rule, PolicyError> {
            self.0.insert_rule(rule).await
        }
        async fn update_rule(&self, rule: Rule) -> Result<Rule, PolicyError> {
            self.0.update_rule(rule).await
        }
        async fn get_rule(&self, id: &str) -> Result<Option<Rule>, PolicyError> {
            self.0.get_rule(id).await
        }
        async fn list_rules(&self) -> Result<Vec<Rule>, PolicyError> {
            self.0.list_rules().await
        }
        async fn insert_ip_list(&self, ip_list: IpList) -> Result<IpList, PolicyError> {
            self.0.insert_ip_list(ip_list).await
        }
        async fn update_ip_list(&self, ip_list: IpList) -> Result<IpList, PolicyError> {
            self.0.update_ip_list(ip_list).await
        }
        async fn get_ip_list(&self, id: &str) -> Result<Option<IpList>, PolicyError> {
            self.0.get_ip_list(id).await
        }
        async fn list_ip_lists(&self) -> Result<Vec<IpList>, PolicyError> {
            self.0.list_ip_lists().await
        }
        async fn rules_for_resource(&self, _resource_id: &str) -> Result<Vec<Rule>, PolicyError> {
            Err(PolicyError::Store("connection reset".to_string()))
        }
        async fn ip_lists_for_resource(&self, _resource_id: &str) -> Result<Vec<IpList>, PolicyError> {
            Err(PolicyError::Store("connection reset".to_string()))
        }
        async fn attach(&self, link: Association) -> Result<Association, PolicyError> {
            self.0.attach(link).await
        }
        async fn detach(
            &self,
            kind: AssociationKind,
            resource_id: &str,
            target_id: &str,
        ) -> Result<bool, PolicyError> {
            self.0.detach(kind, resource_id, target_id).await
        }
        async fn associations(&self, kind: AssociationKind) -> Result<Vec<Association>, PolicyError> {
            self.0.associations(kind).await
        }
    }

    #[tokio::test]
    async fn test_list_resources_survives_nested_failures() {
        let service = PolicyService::new(Arc::new(BrokenJoinStore(InMemoryPolicyStore::new())));
        let created = service.create_resource(resource_input()).await.unwrap();

        let listed = service.list_resources().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].resource, created);
        assert!(listed[0].rules.is_empty());

        let err = service.get_resource_with_policies(&created.id).await.unwrap_err();
        assert!(matches!(err, PolicyError::Store(_)));
    }
}
