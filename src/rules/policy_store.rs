//! Policy Storage
//!
//! Storage traits for the policy model plus a thread-safe in-memory
//! implementation. Rows are kept in insertion order so every listing and
//! every URL lookup returns entities in creation order.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{Association, AssociationKind, EntityKind, IpList, PolicyError, Resource, Rule};

/// Read-only lookups the request analyzer needs on the hot path
#[async_trait]
pub trait PolicyLookup: Send + Sync {
    /// IP lists attached to the resource(s) matching `path` and `method`
    async fn ip_lists_by_url(&self, path: &str, method: &str) -> Result<Vec<IpList>, PolicyError>;

    /// Rules attached to the resource(s) matching `path` and `method`,
    /// active or not, in creation order
    async fn rules_by_url(&self, path: &str, method: &str) -> Result<Vec<Rule>, PolicyError>;
}

/// Full policy store used by the policy model and association manager
#[async_trait]
pub trait PolicyStore: PolicyLookup {
    async fn insert_resource(&self, resource: Resource) -> Result<Resource, PolicyError>;
    async fn update_resource(&self, resource: Resource) -> Result<Resource, PolicyError>;
    async fn get_resource(&self, id: &str) -> Result<Option<Resource>, PolicyError>;
    async fn list_resources(&self) -> Result<Vec<Resource>, PolicyError>;

    async fn insert_rule(&self, rule: Rule) -> Result<Rule, PolicyError>;
    async fn update_rule(&self, rule: Rule) -> Result<Rule, PolicyError>;
    async fn get_rule(&self, id: &str) -> Result<Option<Rule>, PolicyError>;
    async fn list_rules(&self) -> Result<Vec<Rule>, PolicyError>;

    async fn insert_ip_list(&self, ip_list: IpList) -> Result<IpList, PolicyError>;
    async fn update_ip_list(&self, ip_list: IpList) -> Result<IpList, PolicyError>;
    async fn get_ip_list(&self, id: &str) -> Result<Option<IpList>, PolicyError>;
    async fn list_ip_lists(&self) -> Result<Vec<IpList>, PolicyError>;

    async fn rules_for_resource(&self, resource_id: &str) -> Result<Vec<Rule>, PolicyError>;
    async fn ip_lists_for_resource(&self, resource_id: &str) -> Result<Vec<IpList>, PolicyError>;

    /// Insert a link. An existing link for the same pair is returned as is.
    async fn attach(&self, link: Association) -> Result<Association, PolicyError>;

    /// Remove a link. Returns whether a link was removed.
    async fn detach(
        &self,
        kind: AssociationKind,
        resource_id: &str,
        target_id: &str,
    ) -> Result<bool, PolicyError>;

    async fn associations(&self, kind: AssociationKind) -> Result<Vec<Association>, PolicyError>;
}

/// Entities addressable by their opaque id
trait Keyed {
    fn key(&self) -> &str;
}

impl Keyed for Resource {
    fn key(&self) -> &str {
        &self.id
    }
}

impl Keyed for Rule {
    fn key(&self) -> &str {
        &self.id
    }
}

impl Keyed for IpList {
    fn key(&self) -> &str {
        &self.id
    }
}

/// Insertion-ordered table
#[derive(Debug)]
struct Table<T> {
    rows: BTreeMap<u64, T>,
    index: HashMap<String, u64>,
}

impl<T: Keyed + Clone> Table<T> {
    fn new() -> Self {
        Self {
            rows: BTreeMap::new(),
            index: HashMap::new(),
        }
    }

    fn insert(&mut self, seq: u64, row: T) {
        self.index.insert(row.key().to_string(), seq);
        self.rows.insert(seq, row);
    }

    fn replace(&mut self, row: T) -> bool {
        match self.index.get(row.key()) {
            Some(seq) => {
                self.rows.insert(*seq, row);
                true
            }
            None => false,
        }
    }

    fn get(&self, id: &str) -> Option<&T> {
        self.index.get(id).and_then(|seq| self.rows.get(seq))
    }

    fn values(&self) -> impl Iterator<Item = &T> {
        self.rows.values()
    }

    /// Rows whose id is in `ids`, in insertion order
    fn select(&self, ids: &HashSet<&str>) -> Vec<T> {
        self.values()
            .filter(|row| ids.contains(row.key()))
            .cloned()
            .collect()
    }
}

#[derive(Debug)]
struct StoreInner {
    next_seq: u64,
    resources: Table<Resource>,
    rules: Table<Rule>,
    ip_lists: Table<IpList>,
    rule_links: Vec<Association>,
    ip_list_links: Vec<Association>,
}

impl StoreInner {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn links(&self, kind: AssociationKind) -> &Vec<Association> {
        match kind {
            AssociationKind::Rule => &self.rule_links,
            AssociationKind::IpList => &self.ip_list_links,
        }
    }

    fn links_mut(&mut self, kind: AssociationKind) -> &mut Vec<Association> {
        match kind {
            AssociationKind::Rule => &mut self.rule_links,
            AssociationKind::IpList => &mut self.ip_list_links,
        }
    }

    fn resource_ids_for_url(&self, path: &str, method: &str) -> HashSet<&str> {
        self.resources
            .values()
            .filter(|r| r.url == path && r.http_method == method)
            .map(|r| r.id.as_str())
            .collect()
    }

    fn linked_targets<'a>(
        &'a self,
        kind: AssociationKind,
        resource_ids: &HashSet<&str>,
    ) -> HashSet<&'a str> {
        self.links(kind)
            .iter()
            .filter(|link| resource_ids.contains(link.resource_id.as_str()))
            .map(|link| link.target_id.as_str())
            .collect()
    }
}

/// Thread-safe in-memory policy store
#[derive(Clone)]
pub struct InMemoryPolicyStore {
    inner: Arc<RwLock<StoreInner>>,
}

impl InMemoryPolicyStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(StoreInner {
                next_seq: 0,
                resources: Table::new(),
                rules: Table::new(),
                ip_lists: Table::new(),
                rule_links: Vec::new(),
                ip_list_links: Vec::new(),
            })),
        }
    }
}

impl Default for InMemoryPolicyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PolicyLookup for InMemoryPolicyStore {
    async fn ip_lists_by_url(&self, path: &str, method: &str) -> Result<Vec<IpList>, PolicyError> {
        let inner = self.inner.read().await;
        let resource_ids = inner.resource_ids_for_url(path, method);
        let linked = inner.linked_targets(AssociationKind::IpList, &resource_ids);
        Ok(inner.ip_lists.select(&linked))
    }

    async fn rules_by_url(&self, path: &str, method: &str) -> Result<Vec<Rule>, PolicyError> {
        let inner = self.inner.read().await;
        let resource_ids = inner.resource_ids_for_url(path, method);
        let linked = inner.linked_targets(AssociationKind::Rule, &resource_ids);
        Ok(inner.rules.select(&linked))
    }
}

#[async_trait]
impl PolicyStore for InMemoryPolicyStore {
    async fn insert_resource(&self, resource: Resource) -> Result<Resource, PolicyError> {
        let mut inner = self.inner.write().await;
        let seq = inner.next_seq();
        inner.resources.insert(seq, resource.clone());
        Ok(resource)
    }

    async fn update_resource(&self, resource: Resource) -> Result<Resource, PolicyError> {
        let mut inner = self.inner.write().await;
        if !inner.resources.replace(resource.clone()) {
            return Err(PolicyError::not_found(EntityKind::Resource, &resource.id));
        }
        Ok(resource)
    }

    async fn get_resource(&self, id: &str) -> Result<Option<Resource>, PolicyError> {
        Ok(self.inner.read().await.resources.get(id).cloned())
    }

    async fn list_resources(&self) -> Result<Vec<Resource>, PolicyError> {
        Ok(self.inner.read().await.resources.values().cloned().collect())
    }

    async fn insert_rule(&self, rule: Rule) -> Result<Rule, PolicyError> {
        let mut inner = self.inner.write().await;
        let seq = inner.next_seq();
        inner.rules.insert(seq, rule.clone());
        Ok(rule)
    }

    async fn update_rule(&self, rule: Rule) -> Result<Rule, PolicyError> {
        let mut inner = self.inner.write().await;
        if !inner.rules.replace(rule.clone()) {
            return Err(PolicyError::not_found(EntityKind::Rule, &rule.id));
        }
        Ok(rule)
    }

    async fn get_rule(&self, id: &str) -> Result<Option<Rule>, PolicyError> {
        Ok(self.inner.read().await.rules.get(id).cloned())
    }

    async fn list_rules(&self) -> Result<Vec<Rule>, PolicyError> {
        Ok(self.inner.read().await.rules.values().cloned().collect())
    }

    async fn insert_ip_list(&self, ip_list: IpList) -> Result<IpList, PolicyError> {
        let mut inner = self.inner.write().await;
        let seq = inner.next_seq();
        inner.ip_lists.insert(seq, ip_list.clone());
        Ok(ip_list)
    }

    async fn update_ip_list(&self, ip_list: IpList) -> Result<IpList, PolicyError> {
        let mut inner = self.inner.write().await;
        if !inner.ip_lists.replace(ip_list.clone()) {
            return Err(PolicyError::not_found(EntityKind::IpList, &ip_list.id));
        }
        Ok(ip_list)
    }

    async fn get_ip_list(&self, id: &str) -> Result<Option<IpList>, PolicyError> {
        Ok(self.inner.read().await.ip_lists.get(id).cloned())
    }

    async fn list_ip_lists(&self) -> Result<Vec<IpList>, PolicyError> {
        Ok(self.inner.read().await.ip_lists.values().cloned().collect())
    }

    async fn rules_for_resource(&self, resource_id: &str) -> Result<Vec<Rule>, PolicyError> {
        let inner = self.inner.read().await;
        let resource_ids: HashSet<&str> = [resource_id].into_iter().collect();
        let linked = inner.linked_targets(AssociationKind::Rule, &resource_ids);
        Ok(inner.rules.select(&linked))
    }

    async fn ip_lists_for_resource(&self, resource_id: &str) -> Result<Vec<IpList>, PolicyError> {
        let inner = self.inner.read().await;
        let resource_ids: HashSet<&str> = [resource_id].into_iter().collect();
        let linked = inner.linked_targets(AssociationKind::IpList, &resource_ids);
        Ok(inner.ip_lists.select(&linked))
    }

    async fn attach(&self, link: Association) -> Result<Association, PolicyError> {
        let mut inner = self.inner.write().await;
        let links = inner.links_mut(link.kind);

        if let Some(existing) = links
            .iter()
            .find(|l| l.resource_id == link.resource_id && l.target_id == link.target_id)
        {
            return Ok(existing.clone());
        }

        links.push(link.clone());
        Ok(link)
    }

    async fn detach(
        &self,
        kind: AssociationKind,
        resource_id: &str,
        target_id: &str,
    ) -> Result<bool, PolicyError> {
        let mut inner = self.inner.write().await;
        let links = inner.links_mut(kind);
        let len_before = links.len();
        links.retain(|l| !(l.resource_id == resource_id && l.target_id == target_id));
        Ok(links.len() < len_before)
    }

    async fn associations(&self, kind: AssociationKind) -> Result<Vec<Association>, PolicyError> {
        Ok(self.inner.read().await.links(kind).clone())
    }
}
