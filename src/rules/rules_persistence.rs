//! Rules Persistence Layer
//!
//! SQLite storage for resources, rules, IP lists and their links. Lookups
//! order by `created_at, rowid` so rule evaluation order survives restarts.

use async_trait::async_trait;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Params, Row};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use super::policy_store::{PolicyLookup, PolicyStore};
use super::{
    parse_cidr, ActionType, ActiveFlag, Association, AssociationKind, AttackType, EntityKind,
    IpList, PolicyError, Resource, Rule,
};

const RESOURCE_COLUMNS: &str =
    "id, name, http_method, url, host, creator_id, is_active, created_at";
const RULE_COLUMNS: &str = "id, name, attack_type, action_type, is_active, creator_id, created_at";
const IP_LIST_COLUMNS: &str = "id, ip, list_type, creator_id, created_at";

/// SQLite-backed policy store
#[derive(Clone)]
pub struct SqlitePolicyStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqlitePolicyStore {
    /// Open (or create) the database at `db_path`
    pub fn new(db_path: &str) -> Result<Self, PolicyError> {
        let conn = Connection::open(db_path)
            .map_err(|e| PolicyError::Store(format!("Failed to open database: {}", e)))?;

        Self::create_tables(&conn)?;
        debug!("Opened policy database at {}", db_path);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory database (useful for testing)
    pub fn in_memory() -> Result<Self, PolicyError> {
        let conn = Connection::open_in_memory().map_err(|e| {
            PolicyError::Store(format!("Failed to open in-memory database: {}", e))
        })?;

        Self::create_tables(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn create_tables(conn: &Connection) -> Result<(), PolicyError> {
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS resources (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                http_method TEXT NOT NULL,
                url TEXT NOT NULL,
                host TEXT NOT NULL,
                creator_id TEXT NOT NULL,
                is_active INTEGER,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_resources_url ON resources(url, http_method);

            CREATE TABLE IF NOT EXISTS rules (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                attack_type TEXT NOT NULL,
                action_type TEXT NOT NULL,
                is_active INTEGER,
                creator_id TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS ip_lists (
                id TEXT PRIMARY KEY,
                ip TEXT NOT NULL,
                list_type TEXT NOT NULL,
                creator_id TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS resource_rule (
                id TEXT PRIMARY KEY,
                resource_id TEXT NOT NULL,
                rule_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                UNIQUE (resource_id, rule_id),
                FOREIGN KEY (resource_id) REFERENCES resources(id),
                FOREIGN KEY (rule_id) REFERENCES rules(id)
            );

            CREATE TABLE IF NOT EXISTS resource_ip_list (
                id TEXT PRIMARY KEY,
                resource_id TEXT NOT NULL,
                ip_list_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                UNIQUE (resource_id, ip_list_id),
                FOREIGN KEY (resource_id) REFERENCES resources(id),
                FOREIGN KEY (ip_list_id) REFERENCES ip_lists(id)
            );",
        )
        .map_err(|e| PolicyError::Store(format!("Failed to create tables: {}", e)))
    }
}

/// Link table and target column for an association kind
fn link_table(kind: AssociationKind) -> (&'static str, &'static str) {
    match kind {
        AssociationKind::Rule => ("resource_rule", "rule_id"),
        AssociationKind::IpList => ("resource_ip_list", "ip_list_id"),
    }
}

fn store_err(context: &'static str) -> impl Fn(rusqlite::Error) -> PolicyError {
    move |e| PolicyError::Store(format!("{}: {}", context, e))
}

fn conversion_err(column: usize, err: PolicyError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(err))
}

fn read_resource(row: &Row<'_>) -> rusqlite::Result<Resource> {
    Ok(Resource {
        id: row.get(0)?,
        name: row.get(1)?,
        http_method: row.get(2)?,
        url: row.get(3)?,
        host: row.get(4)?,
        creator_id: row.get(5)?,
        is_active: ActiveFlag::from(row.get::<_, Option<bool>>(6)?),
        created_at: row.get::<_, i64>(7)? as u64,
    })
}

fn read_rule(row: &Row<'_>) -> rusqlite::Result<Rule> {
    let action: String = row.get(3)?;
    Ok(Rule {
        id: row.get(0)?,
        name: row.get(1)?,
        attack_type: AttackType::from(row.get::<_, String>(2)?),
        action_type: action
            .parse::<ActionType>()
            .map_err(|e| conversion_err(3, e))?,
        is_active: ActiveFlag::from(row.get::<_, Option<bool>>(4)?),
        creator_id: row.get(5)?,
        created_at: row.get::<_, i64>(6)? as u64,
    })
}

fn read_ip_list(row: &Row<'_>) -> rusqlite::Result<IpList> {
    let cidr: String = row.get(1)?;
    Ok(IpList {
        id: row.get(0)?,
        ip: parse_cidr(&cidr).map_err(|e| conversion_err(1, e))?,
        list_type: row.get(2)?,
        creator_id: row.get(3)?,
        created_at: row.get::<_, i64>(4)? as u64,
    })
}

fn read_association(kind: AssociationKind, row: &Row<'_>) -> rusqlite::Result<Association> {
    Ok(Association {
        id: row.get(0)?,
        kind,
        resource_id: row.get(1)?,
        target_id: row.get(2)?,
        created_at: row.get::<_, i64>(3)? as u64,
    })
}

fn query_all<T, P: Params>(
    conn: &Connection,
    sql: &str,
    params: P,
    read: fn(&Row<'_>) -> rusqlite::Result<T>,
) -> Result<Vec<T>, PolicyError> {
    let mut stmt = conn.prepare(sql).map_err(store_err("Failed to prepare query"))?;
    let rows = stmt
        .query_map(params, read)
        .map_err(store_err("Failed to run query"))?;
    rows.collect::<Result<Vec<_>, _>>()
        .map_err(store_err("Failed to read row"))
}

fn query_one<T, P: Params>(
    conn: &Connection,
    sql: &str,
    params: P,
    read: fn(&Row<'_>) -> rusqlite::Result<T>,
) -> Result<Option<T>, PolicyError> {
    conn.query_row(sql, params, read)
        .optional()
        .map_err(store_err("Failed to load row"))
}

#[async_trait]
impl PolicyLookup for SqlitePolicyStore {
    async fn ip_lists_by_url(&self, path: &str, method: &str) -> Result<Vec<IpList>, PolicyError> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {} FROM ip_lists WHERE id IN (
                SELECT l.ip_list_id FROM resource_ip_list AS l
                INNER JOIN resources AS r ON l.resource_id = r.id
                WHERE r.url = ?1 AND r.http_method = ?2
             ) ORDER BY created_at, rowid",
            IP_LIST_COLUMNS
        );
        query_all(&conn, &sql, params![path, method], read_ip_list)
    }

    async fn rules_by_url(&self, path: &str, method: &str) -> Result<Vec<Rule>, PolicyError> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {} FROM rules WHERE id IN (
                SELECT l.rule_id FROM resource_rule AS l
                INNER JOIN resources AS r ON l.resource_id = r.id
                WHERE r.url = ?1 AND r.http_method = ?2
             ) ORDER BY created_at, rowid",
            RULE_COLUMNS
        );
        query_all(&conn, &sql, params![path, method], read_rule)
    }
}

#[async_trait]
impl PolicyStore for SqlitePolicyStore {
    async fn insert_resource(&self, resource: Resource) -> Result<Resource, PolicyError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO resources (id, name, http_method, url, host, creator_id, is_active, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                resource.id,
                resource.name,
                resource.http_method,
                resource.url,
                resource.host,
                resource.creator_id,
                Option::<bool>::from(resource.is_active),
                resource.created_at as i64,
            ],
        )
        .map_err(store_err("Failed to save resource"))?;
        Ok(resource)
    }

    async fn update_resource(&self, resource: Resource) -> Result<Resource, PolicyError> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE resources SET name = ?1, http_method = ?2, url = ?3, host = ?4, is_active = ?5
                 WHERE id = ?6",
                params![
                    resource.name,
                    resource.http_method,
                    resource.url,
                    resource.host,
                    Option::<bool>::from(resource.is_active),
                    resource.id,
                ],
            )
            .map_err(store_err("Failed to update resource"))?;

        if changed == 0 {
            return Err(PolicyError::not_found(EntityKind::Resource, &resource.id));
        }
        Ok(resource)
    }

    async fn get_resource(&self, id: &str) -> Result<Option<Resource>, PolicyError> {
        let conn = self.conn.lock().await;
        let sql = format!("SELECT {} FROM resources WHERE id = ?1", RESOURCE_COLUMNS);
        query_one(&conn, &sql, params![id], read_resource)
    }

    async fn list_resources(&self) -> Result<Vec<Resource>, PolicyError> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {} FROM resources ORDER BY created_at, rowid",
            RESOURCE_COLUMNS
        );
        query_all(&conn, &sql, [], read_resource)
    }

    async fn insert_rule(&self, rule: Rule) -> Result<Rule, PolicyError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO rules (id, name, attack_type, action_type, is_active, creator_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                rule.id,
                rule.name,
                rule.attack_type.as_str(),
                rule.action_type.as_str(),
                Option::<bool>::from(rule.is_active),
                rule.creator_id,
                rule.created_at as i64,
            ],
        )
        .map_err(store_err("Failed to save rule"))?;
        Ok(rule)
    }

    async fn update_rule(&self, rule: Rule) -> Result<Rule, PolicyError> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE rules SET name = ?1, attack_type = ?2, action_type = ?3, is_active = ?4
                 WHERE id = ?5",
                params![
                    rule.name,
                    rule.attack_type.as_str(),
                    rule.action_type.as_str(),
                    Option::<bool>::from(rule.is_active),
                    rule.id,
                ],
            )
            .map_err(store_err("Failed to update rule"))?;

        if changed == 0 {
            return Err(PolicyError::not_found(EntityKind::Rule, &rule.id));
        }
        Ok(rule)
    }

    async fn get_rule(&self, id: &str) -> Result<Option<Rule>, PolicyError> {
        let conn = self.conn.lock().await;
        let sql = format!("SELECT {} FROM rules WHERE id = ?1", RULE_COLUMNS);
        query_one(&conn, &sql, params![id], read_rule)
    }

    async fn list_rules(&self) -> Result<Vec<Rule>, PolicyError> {
        let conn = self.conn.lock().await;
        let sql = format!("SELECT {} FROM rules ORDER BY created_at, rowid", RULE_COLUMNS);
        query_all(&conn, &sql, [], read_rule)
    }

    async fn insert_ip_list(&self, ip_list: IpList) -> Result<IpList, PolicyError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO ip_lists (id, ip, list_type, creator_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                ip_list.id,
                ip_list.ip.to_string(),
                ip_list.list_type,
                ip_list.creator_id,
                ip_list.created_at as i64,
            ],
        )
        .map_err(store_err("Failed to save ip list"))?;
        Ok(ip_list)
    }

    async fn update_ip_list(&self, ip_list: IpList) -> Result<IpList, PolicyError> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE ip_lists SET ip = ?1, list_type = ?2 WHERE id = ?3",
                params![ip_list.ip.to_string(), ip_list.list_type, ip_list.id],
            )
            .map_err(store_err("Failed to update ip list"))?;

        if changed == 0 {
            return Err(PolicyError::not_found(EntityKind::IpList, &ip_list.id));
        }
        Ok(ip_list)
    }

    async fn get_ip_list(&self, id: &str) -> Result<Option<IpList>, PolicyError> {
        let conn = self.conn.lock().await;
        let sql = format!("SELECT {} FROM ip_lists WHERE id = ?1", IP_LIST_COLUMNS);
        query_one(&conn, &sql, params![id], read_ip_list)
    }

    async fn list_ip_lists(&self) -> Result<Vec<IpList>, PolicyError> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {} FROM ip_lists ORDER BY created_at, rowid",
            IP_LIST_COLUMNS
        );
        query_all(&conn, &sql, [], read_ip_list)
    }

    async fn rules_for_resource(&self, resource_id: &str) -> Result<Vec<Rule>, PolicyError> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {} FROM rules WHERE id IN (
                SELECT rule_id FROM resource_rule WHERE resource_id = ?1
             ) ORDER BY created_at, rowid",
            RULE_COLUMNS
        );
        query_all(&conn, &sql, params![resource_id], read_rule)
    }

    async fn ip_lists_for_resource(&self, resource_id: &str) -> Result<Vec<IpList>, PolicyError> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {} FROM ip_lists WHERE id IN (
                SELECT ip_list_id FROM resource_ip_list WHERE resource_id = ?1
             ) ORDER BY created_at, rowid",
            IP_LIST_COLUMNS
        );
        query_all(&conn, &sql, params![resource_id], read_ip_list)
    }

    async fn attach(&self, link: Association) -> Result<Association, PolicyError> {
        let conn = self.conn.lock().await;
        let (table, column) = link_table(link.kind);

        conn.execute(
            &format!(
                "INSERT OR IGNORE INTO {} (id, resource_id, {}, created_at) VALUES (?1, ?2, ?3, ?4)",
                table, column
            ),
            params![
                link.id,
                link.resource_id,
                link.target_id,
                link.created_at as i64
            ],
        )
        .map_err(store_err("Failed to save link"))?;

        let stored = conn
            .query_row(
                &format!(
                    "SELECT id, resource_id, {}, created_at FROM {} WHERE resource_id = ?1 AND {} = ?2",
                    column, table, column
                ),
                params![link.resource_id, link.target_id],
                |row| read_association(link.kind, row),
            )
            .map_err(store_err("Failed to load link"))?;

        Ok(stored)
    }

    async fn detach(
        &self,
        kind: AssociationKind,
        resource_id: &str,
        target_id: &str,
    ) -> Result<bool, PolicyError> {
        let conn = self.conn.lock().await;
        let (table, column) = link_table(kind);
        let removed = conn
            .execute(
                &format!(
                    "DELETE FROM {} WHERE resource_id = ?1 AND {} = ?2",
                    table, column
                ),
                params![resource_id, target_id],
            )
            .map_err(store_err("Failed to delete link"))?;
        Ok(removed > 0)
    }

    async fn associations(&self, kind: AssociationKind) -> Result<Vec<Association>, PolicyError> {
        let conn = self.conn.lock().await;
        let (table, column) = link_table(kind);
        let mut stmt = conn
            .prepare(&format!(
                "SELECT id, resource_id, {}, created_at FROM {} ORDER BY created_at, rowid",
                column, table
            ))
            .map_err(store_err("Failed to prepare query"))?;
        let rows = stmt
            .query_map([], |row| read_association(kind, row))
            .map_err(store_err("Failed to run query"))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(store_err("Failed to read row"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{current_timestamp, generate_id};
    use tempfile::tempdir;

    fn resource(url: &str) -> Resource {
        Resource {
            id: generate_id("res"),
            name: "checkout".to_string(),
            http_method: "POST".to_string(),
            url: url.to_string(),
            host: "http://checkout:9000".to_string(),
            creator_id: "admin".to_string(),
            is_active: ActiveFlag::Unset,
            created_at: current_timestamp(),
        }
    }

    fn rule(name: &str, attack: &str) -> Rule {
        Rule {
            id: generate_id("rule"),
            name: name.to_string(),
            attack_type: AttackType::from(attack),
            action_type: ActionType::Sanitize,
            is_active: ActiveFlag::Disabled,
            creator_id: "admin".to_string(),
            created_at: current_timestamp(),
        }
    }

    #[tokio::test]
    async fn test_resource_round_trip_keeps_unset_flag() {
        let store = SqlitePolicyStore::in_memory().unwrap();
        let res = store.insert_resource(resource("/pay")).await.unwrap();

        let loaded = store.get_resource(&res.id).await.unwrap().unwrap();
        assert_eq!(loaded, res);
        assert_eq!(loaded.is_active, ActiveFlag::Unset);

        assert!(store.get_resource("res_missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rule_round_trip_keeps_unknown_attack_type() {
        let store = SqlitePolicyStore::in_memory().unwrap();
        let r = store.insert_rule(rule("lfi", "path-traversal")).await.unwrap();

        let loaded = store.get_rule(&r.id).await.unwrap().unwrap();
        assert_eq!(
            loaded.attack_type,
            AttackType::Unrecognized("path-traversal".to_string())
        );
        assert_eq!(loaded.is_active, ActiveFlag::Disabled);
    }

    #[tokio::test]
    async fn test_rules_by_url_in_creation_order() {
        let store = SqlitePolicyStore::in_memory().unwrap();
        let res = store.insert_resource(resource("/pay")).await.unwrap();

        let mut ids = Vec::new();
        for name in ["one", "two", "three"] {
            ids.push(store.insert_rule(rule(name, "xss")).await.unwrap().id);
        }
        for id in ids.iter().rev() {
            store
                .attach(Association::new(AssociationKind::Rule, &res.id, id))
                .await
                .unwrap();
        }

        let names: Vec<_> = store
            .rules_by_url("/pay", "POST")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn test_attach_twice_returns_existing_link() {
        let store = SqlitePolicyStore::in_memory().unwrap();
        let res = store.insert_resource(resource("/pay")).await.unwrap();
        let list = store
            .insert_ip_list(IpList {
                id: generate_id("ipl"),
                ip: parse_cidr("10.0.0.0/24").unwrap(),
                list_type: "blacklist".to_string(),
                creator_id: "admin".to_string(),
                created_at: current_timestamp(),
            })
            .await
            .unwrap();

        let first = store
            .attach(Association::new(AssociationKind::IpList, &res.id, &list.id))
            .await
            .unwrap();
        let second = store
            .attach(Association::new(AssociationKind::IpList, &res.id, &list.id))
            .await
            .unwrap();
        assert_eq!(first.id, second.id);

        assert_eq!(
            store.ip_lists_by_url("/pay", "POST").await.unwrap(),
            vec![list.clone()]
        );

        assert!(store
            .detach(AssociationKind::IpList, &res.id, &list.id)
            .await
            .unwrap());
        assert!(!store
            .detach(AssociationKind::IpList, &res.id, &list.id)
            .await
            .unwrap());
        assert!(store.ip_lists_for_resource(&res.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_missing_rule_is_not_found() {
        let store = SqlitePolicyStore::in_memory().unwrap();
        let result = store.update_rule(rule("ghost", "xss")).await;
        assert!(matches!(
            result,
            Err(PolicyError::NotFound {
                entity: EntityKind::Rule,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rules.db");
        let path = path.to_str().unwrap();

        let res = {
            let store = SqlitePolicyStore::new(path).unwrap();
            store.insert_resource(resource("/persist")).await.unwrap()
        };

        let reopened = SqlitePolicyStore::new(path).unwrap();
        let listed = reopened.list_resources().await.unwrap();
        assert_eq!(listed, vec![res]);
    }
}
