//! Resource database repository.
//!
//! Status changes are conditional updates (`WHERE status IN (...)`), so two
//! writers racing on the same record cannot both win. Callers learn whether
//! their write applied from the returned `bool`.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use super::models::{Resource, ResourceStatus, timestamp};
use crate::ports::PortPair;

const COLUMNS: &str = "id, kind, status, image, env, memory_limit, cpu_shares, \
     container_ref, container_name, volume_name, primary_port, aux_port, \
     routing_domain, routing_subdomain, routing_path, monitor_session, \
     degraded_readiness, error_message, created_at, started_at, stopped_at, last_access_at";

fn now() -> String {
    timestamp(chrono::Utc::now())
}

/// `?, ?, ?` for an `IN (...)` clause.
fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// Repository for resource persistence.
#[derive(Debug, Clone)]
pub struct ResourceRepository {
    pool: SqlitePool,
}

impl ResourceRepository {
    /// Create a new repository.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a new resource.
    pub async fn create(&self, resource: &Resource) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO resources ({COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&resource.id)
        .bind(resource.kind.as_str())
        .bind(resource.status.as_str())
        .bind(&resource.image)
        .bind(&resource.env_json)
        .bind(&resource.memory_limit)
        .bind(resource.cpu_shares)
        .bind(&resource.container_ref)
        .bind(&resource.container_name)
        .bind(&resource.volume_name)
        .bind(resource.primary_port)
        .bind(resource.aux_port)
        .bind(&resource.routing_domain)
        .bind(&resource.routing_subdomain)
        .bind(&resource.routing_path)
        .bind(&resource.monitor_session)
        .bind(resource.degraded_readiness)
        .bind(&resource.error_message)
        .bind(&resource.created_at)
        .bind(&resource.started_at)
        .bind(&resource.stopped_at)
        .bind(&resource.last_access_at)
        .execute(&self.pool)
        .await
        .context("creating resource")?;

        Ok(())
    }

    /// Get a resource by ID.
    pub async fn get(&self, id: &str) -> Result<Option<Resource>> {
        let resource =
            sqlx::query_as::<_, Resource>(&format!("SELECT {COLUMNS} FROM resources WHERE id = ?"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .context("fetching resource")?;

        Ok(resource)
    }

    /// List all resources, newest first.
    pub async fn list(&self) -> Result<Vec<Resource>> {
        let resources = sqlx::query_as::<_, Resource>(&format!(
            "SELECT {COLUMNS} FROM resources ORDER BY created_at DESC"
        ))
        .fetch_all(&self.pool)
        .await
        .context("listing resources")?;

        Ok(resources)
    }

    /// Move from any of `from` to `to`. Returns whether the row changed.
    pub async fn transition(
        &self,
        id: &str,
        from: &[ResourceStatus],
        to: ResourceStatus,
    ) -> Result<bool> {
        let sql = format!(
            "UPDATE resources SET status = ? WHERE id = ? AND status IN ({})",
            placeholders(from.len())
        );
        let mut query = sqlx::query(&sql).bind(to.as_str()).bind(id);
        for status in from {
            query = query.bind(status.as_str());
        }

        let result = query
            .execute(&self.pool)
            .await
            .context("transitioning resource status")?;

        Ok(result.rows_affected() > 0)
    }

    /// Enter STARTING under a new monitor session.
    pub async fn begin_start(
        &self,
        id: &str,
        session: &str,
        from: &[ResourceStatus],
    ) -> Result<bool> {
        let sql = format!(
            "UPDATE resources SET status = 'starting', monitor_session = ?, \
             degraded_readiness = 0, error_message = NULL, started_at = ?, stopped_at = NULL, \
             last_access_at = ? \
             WHERE id = ? AND status IN ({})",
            placeholders(from.len())
        );
        let started_at = now();
        let mut query = sqlx::query(&sql)
            .bind(session)
            .bind(&started_at)
            .bind(&started_at)
            .bind(id);
        for status in from {
            query = query.bind(status.as_str());
        }

        let result = query
            .execute(&self.pool)
            .await
            .context("marking resource starting")?;

        Ok(result.rows_affected() > 0)
    }

    /// RUNNING back to STARTING for an in-place restart.
    pub async fn begin_restart(&self, id: &str, session: &str) -> Result<bool> {
        self.begin_start(id, session, &[ResourceStatus::Running])
            .await
    }

    /// Record the container backing the resource and its host ports, while
    /// the record is still `expected`.
    pub async fn set_container(
        &self,
        id: &str,
        expected: ResourceStatus,
        container_ref: Option<&str>,
        ports: Option<PortPair>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE resources SET container_ref = ?, primary_port = ?, aux_port = ? \
             WHERE id = ? AND status = ?",
        )
        .bind(container_ref)
        .bind(ports.map(|p| i64::from(p.primary)))
        .bind(ports.map(|p| i64::from(p.aux)))
        .bind(id)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await
        .context("setting resource container")?;

        Ok(result.rows_affected() > 0)
    }

    /// Terminal RUNNING write, applied only if `session` still owns the record.
    pub async fn finish_ready(&self, id: &str, session: &str, degraded: bool) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE resources SET status = 'running', degraded_readiness = ?, \
             monitor_session = NULL, last_access_at = ? \
             WHERE id = ? AND status = 'starting' AND monitor_session = ?",
        )
        .bind(degraded)
        .bind(now())
        .bind(id)
        .bind(session)
        .execute(&self.pool)
        .await
        .context("marking resource running")?;

        Ok(result.rows_affected() > 0)
    }

    /// Terminal ERROR write, applied only if `session` still owns the record.
    pub async fn finish_failed(
        &self,
        id: &str,
        session: &str,
        error: &str,
        clear_container: bool,
    ) -> Result<bool> {
        let sql = if clear_container {
            "UPDATE resources SET status = 'error', error_message = ?, monitor_session = NULL, \
             container_ref = NULL, primary_port = NULL, aux_port = NULL, stopped_at = ? \
             WHERE id = ? AND status = 'starting' AND monitor_session = ?"
        } else {
            "UPDATE resources SET status = 'error', error_message = ?, monitor_session = NULL, \
             stopped_at = ? \
             WHERE id = ? AND status = 'starting' AND monitor_session = ?"
        };

        let result = sqlx::query(sql)
            .bind(error)
            .bind(now())
            .bind(id)
            .bind(session)
            .execute(&self.pool)
            .await
            .context("marking resource failed")?;

        Ok(result.rows_affected() > 0)
    }

    /// ERROR write for failures outside a monitor session, applied only from
    /// one of `from`.
    pub async fn mark_failed(
        &self,
        id: &str,
        from: &[ResourceStatus],
        error: &str,
        clear_container: bool,
    ) -> Result<bool> {
        let cleared = if clear_container {
            "container_ref = NULL, primary_port = NULL, aux_port = NULL, "
        } else {
            ""
        };
        let sql = format!(
            "UPDATE resources SET status = 'error', error_message = ?, monitor_session = NULL, \
             {cleared}stopped_at = ? WHERE id = ? AND status IN ({})",
            placeholders(from.len())
        );
        let mut query = sqlx::query(&sql).bind(error).bind(now()).bind(id);
        for status in from {
            query = query.bind(status.as_str());
        }

        let result = query
            .execute(&self.pool)
            .await
            .context("marking resource failed")?;

        Ok(result.rows_affected() > 0)
    }

    /// STOPPING to STOPPED. A kept container keeps its reference and ports so
    /// the next start can reuse it.
    pub async fn mark_stopped(&self, id: &str, keep_container: bool) -> Result<bool> {
        let sql = if keep_container {
            "UPDATE resources SET status = 'stopped', monitor_session = NULL, \
             degraded_readiness = 0, stopped_at = ? WHERE id = ? AND status = 'stopping'"
        } else {
            "UPDATE resources SET status = 'stopped', monitor_session = NULL, \
             degraded_readiness = 0, container_ref = NULL, primary_port = NULL, aux_port = NULL, \
             stopped_at = ? WHERE id = ? AND status = 'stopping'"
        };

        let result = sqlx::query(sql)
            .bind(now())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("marking resource stopped")?;

        Ok(result.rows_affected() > 0)
    }

    /// STOPPING to STOPPED after a destroy: no container, no ports, no error.
    pub async fn mark_destroyed(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE resources SET status = 'stopped', monitor_session = NULL, \
             degraded_readiness = 0, error_message = NULL, container_ref = NULL, \
             primary_port = NULL, aux_port = NULL, stopped_at = ? \
             WHERE id = ? AND status = 'stopping'",
        )
        .bind(now())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("marking resource destroyed")?;

        Ok(result.rows_affected() > 0)
    }

    /// Forget the host ports of a resource that is STOPPED or ERROR.
    pub async fn clear_idle_ports(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE resources SET primary_port = NULL, aux_port = NULL \
             WHERE id = ? AND status IN ('stopped', 'error')",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .context("clearing resource ports")?;

        Ok(result.rows_affected() > 0)
    }

    /// Record an access. Returns false if the resource does not exist.
    pub async fn touch(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE resources SET last_access_at = ? WHERE id = ?")
            .bind(now())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("touching resource")?;

        Ok(result.rows_affected() > 0)
    }

    /// RUNNING resources not accessed since `cutoff` (RFC 3339).
    pub async fn list_idle(&self, cutoff: &str) -> Result<Vec<Resource>> {
        let resources = sqlx::query_as::<_, Resource>(&format!(
            "SELECT {COLUMNS} FROM resources \
             WHERE status = 'running' \
             AND COALESCE(last_access_at, started_at, created_at) < ?"
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .context("listing idle resources")?;

        Ok(resources)
    }

    /// Hand a STARTING record over to a new monitor session.
    pub async fn adopt_monitor(&self, id: &str, session: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE resources SET monitor_session = ? WHERE id = ? AND status = 'starting'",
        )
        .bind(session)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("adopting monitor session")?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::resource::ResourceKind;
    use std::collections::BTreeMap;

    async fn repo_with(id: &str) -> ResourceRepository {
        let db = Database::in_memory().await.unwrap();
        let repo = ResourceRepository::new(db.pool().clone());
        let resource = Resource::new(id, ResourceKind::Workspace, "img", &BTreeMap::new(), None);
        repo.create(&resource).await.unwrap();
        repo
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let repo = repo_with("ws1").await;

        let resource = repo.get("ws1").await.unwrap().unwrap();
        assert_eq!(resource.kind, ResourceKind::Workspace);
        assert_eq!(resource.status, ResourceStatus::Stopped);
        assert!(repo.get("missing").await.unwrap().is_none());
        assert_eq!(repo.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_begin_start_is_guarded() {
        let repo = repo_with("ws1").await;
        let from = [ResourceStatus::Stopped, ResourceStatus::Error];

        assert!(repo.begin_start("ws1", "s1", &from).await.unwrap());
        assert!(!repo.begin_start("ws1", "s2", &from).await.unwrap());

        let resource = repo.get("ws1").await.unwrap().unwrap();
        assert_eq!(resource.status, ResourceStatus::Starting);
        assert_eq!(resource.monitor_session.as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn test_terminal_write_requires_owning_session() {
        let repo = repo_with("ws1").await;
        repo.begin_start("ws1", "s1", &[ResourceStatus::Stopped])
            .await
            .unwrap();

        assert!(!repo.finish_ready("ws1", "stale", false).await.unwrap());
        assert!(repo.finish_ready("ws1", "s1", true).await.unwrap());
        // Second terminal write for the same session is a no-op.
        assert!(!repo.finish_failed("ws1", "s1", "late", false).await.unwrap());

        let resource = repo.get("ws1").await.unwrap().unwrap();
        assert_eq!(resource.status, ResourceStatus::Running);
        assert!(resource.degraded_readiness);
        assert!(resource.error_message.is_none());
    }

    #[tokio::test]
    async fn test_finish_failed_clears_container() {
        let repo = repo_with("ws1").await;
        repo.begin_start("ws1", "s1", &[ResourceStatus::Stopped])
            .await
            .unwrap();
        let ports = PortPair { primary: 20000, aux: 20001 };
        assert!(
            repo.set_container("ws1", ResourceStatus::Starting, Some("abc"), Some(ports))
                .await
                .unwrap()
        );

        assert!(repo.finish_failed("ws1", "s1", "gone", true).await.unwrap());

        let resource = repo.get("ws1").await.unwrap().unwrap();
        assert_eq!(resource.status, ResourceStatus::Error);
        assert_eq!(resource.error_message.as_deref(), Some("gone"));
        assert!(resource.container_ref.is_none());
        assert!(resource.ports().is_none());
    }

    #[tokio::test]
    async fn test_set_container_requires_expected_status() {
        let repo = repo_with("ws1").await;
        let ports = PortPair { primary: 20000, aux: 20001 };

        let applied = repo
            .set_container("ws1", ResourceStatus::Starting, Some("abc"), Some(ports))
            .await
            .unwrap();
        assert!(!applied);
        assert!(repo.get("ws1").await.unwrap().unwrap().container_ref.is_none());
    }

    #[tokio::test]
    async fn test_mark_stopped_only_from_stopping() {
        let repo = repo_with("db1").await;
        let ports = PortPair { primary: 20010, aux: 20011 };
        repo.set_container("db1", ResourceStatus::Stopped, Some("abc"), Some(ports))
            .await
            .unwrap();

        // Not STOPPING: nothing changes.
        assert!(!repo.mark_stopped("db1", false).await.unwrap());
        assert_eq!(
            repo.get("db1").await.unwrap().unwrap().container_ref.as_deref(),
            Some("abc")
        );

        let all = [ResourceStatus::Stopped];
        repo.transition("db1", &all, ResourceStatus::Stopping)
            .await
            .unwrap();
        assert!(repo.mark_stopped("db1", true).await.unwrap());
        let kept = repo.get("db1").await.unwrap().unwrap();
        assert_eq!(kept.status, ResourceStatus::Stopped);
        assert_eq!(kept.container_ref.as_deref(), Some("abc"));
        assert_eq!(kept.ports(), Some(ports));

        repo.transition("db1", &all, ResourceStatus::Stopping)
            .await
            .unwrap();
        assert!(repo.mark_stopped("db1", false).await.unwrap());
        let removed = repo.get("db1").await.unwrap().unwrap();
        assert!(removed.container_ref.is_none());
        assert!(removed.ports().is_none());
    }

    #[tokio::test]
    async fn test_mark_failed_and_destroyed_are_guarded() {
        let repo = repo_with("ws1").await;
        let ports = PortPair { primary: 20020, aux: 20021 };
        repo.set_container("ws1", ResourceStatus::Stopped, Some("abc"), Some(ports))
            .await
            .unwrap();

        // A RUNNING-only failure does not touch a STOPPED record.
        let failed = repo
            .mark_failed("ws1", &[ResourceStatus::Running], "vanished", true)
            .await
            .unwrap();
        assert!(!failed);
        let resource = repo.get("ws1").await.unwrap().unwrap();
        assert_eq!(resource.status, ResourceStatus::Stopped);
        assert_eq!(resource.container_ref.as_deref(), Some("abc"));

        assert!(!repo.mark_destroyed("ws1").await.unwrap());
        assert!(repo.clear_idle_ports("ws1").await.unwrap());
        assert!(repo.get("ws1").await.unwrap().unwrap().ports().is_none());

        repo.begin_start("ws1", "s1", &[ResourceStatus::Stopped])
            .await
            .unwrap();
        assert!(!repo.clear_idle_ports("ws1").await.unwrap());
        let failed = repo
            .mark_failed("ws1", &[ResourceStatus::Starting], "boom", false)
            .await
            .unwrap();
        assert!(failed);
        let resource = repo.get("ws1").await.unwrap().unwrap();
        assert_eq!(resource.status, ResourceStatus::Error);
        assert_eq!(resource.error_message.as_deref(), Some("boom"));
        assert!(resource.monitor_session.is_none());
    }

    #[tokio::test]
    async fn test_touch_and_idle() {
        let repo = repo_with("ws1").await;
        assert!(!repo.touch("missing").await.unwrap());

        repo.begin_start("ws1", "s1", &[ResourceStatus::Stopped])
            .await
            .unwrap();
        repo.finish_ready("ws1", "s1", false).await.unwrap();

        let past = timestamp(chrono::Utc::now() - chrono::Duration::minutes(5));
        let future = timestamp(chrono::Utc::now() + chrono::Duration::minutes(5));
        assert!(repo.list_idle(&past).await.unwrap().is_empty());
        assert_eq!(repo.list_idle(&future).await.unwrap().len(), 1);
    }
}
