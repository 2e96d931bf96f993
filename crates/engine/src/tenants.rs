//! Tenant context lookup.
//!
//! Every dispatch resolves the process's tenant before anything else; the
//! scheduler lists the tenants a pipeline is enabled for.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::instrument;

use pipesync_core::{PipelineType, Tenant, TenantId};

use crate::store::StoreError;
use crate::store::postgres::map_sqlx_error;

pub type SharedTenants = Arc<dyn TenantDirectory>;

#[async_trait]
pub trait TenantDirectory: Send + Sync {
    async fn get(&self, tenant_id: TenantId) -> Result<Option<Tenant>, StoreError>;

    /// Tenants with `pipeline` enabled, ordered by id.
    async fn list_enabled(&self, pipeline: PipelineType) -> Result<Vec<Tenant>, StoreError>;
}

/// In-memory tenant directory for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryTenantDirectory {
    tenants: RwLock<HashMap<TenantId, Tenant>>,
}

impl InMemoryTenantDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tenant(self, tenant: Tenant) -> Self {
        if let Ok(mut tenants) = self.tenants.write() {
            tenants.insert(tenant.id, tenant);
        }
        self
    }

    pub fn insert(&self, tenant: Tenant) -> Result<(), StoreError> {
        self.tenants
            .write()
            .map_err(|_| StoreError::Storage("tenant directory lock poisoned".to_string()))?
            .insert(tenant.id, tenant);
        Ok(())
    }

    pub fn remove(&self, tenant_id: TenantId) -> Result<Option<Tenant>, StoreError> {
        Ok(self
            .tenants
            .write()
            .map_err(|_| StoreError::Storage("tenant directory lock poisoned".to_string()))?
            .remove(&tenant_id))
    }
}

#[async_trait]
impl TenantDirectory for InMemoryTenantDirectory {
    async fn get(&self, tenant_id: TenantId) -> Result<Option<Tenant>, StoreError> {
        let tenants = self
            .tenants
            .read()
            .map_err(|_| StoreError::Storage("tenant directory lock poisoned".to_string()))?;
        Ok(tenants.get(&tenant_id).cloned())
    }

    async fn list_enabled(&self, pipeline: PipelineType) -> Result<Vec<Tenant>, StoreError> {
        let tenants = self
            .tenants
            .read()
            .map_err(|_| StoreError::Storage("tenant directory lock poisoned".to_string()))?;
        let mut enabled: Vec<_> = tenants
            .values()
            .filter(|t| t.is_enabled(pipeline))
            .cloned()
            .collect();
        enabled.sort_by_key(|t| t.id);
        Ok(enabled)
    }
}

/// Postgres tenant directory over `sync_tenants`.
#[derive(Debug, Clone)]
pub struct PostgresTenantDirectory {
    pool: Arc<PgPool>,
}

impl PostgresTenantDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Insert or replace a tenant row.
    #[instrument(skip(self, tenant), fields(tenant_id = %tenant.id), err)]
    pub async fn upsert(&self, tenant: &Tenant) -> Result<(), StoreError> {
        let pipelines: Vec<String> = tenant
            .pipelines
            .iter()
            .map(|p| p.as_str().to_string())
            .collect();

        sqlx::query(
            r#"
            INSERT INTO sync_tenants (tenant_id, shop_domain, pipelines)
            VALUES ($1, $2, $3)
            ON CONFLICT (tenant_id)
            DO UPDATE SET shop_domain = EXCLUDED.shop_domain, pipelines = EXCLUDED.pipelines
            "#,
        )
        .bind(tenant.id.as_uuid())
        .bind(&tenant.shop_domain)
        .bind(pipelines)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_tenant", e))?;
        Ok(())
    }
}

fn tenant_from_row(row: &sqlx::postgres::PgRow) -> Result<Tenant, StoreError> {
    let map = |e| map_sqlx_error("decode_tenant", e);
    let id: uuid::Uuid = row.try_get("tenant_id").map_err(map)?;
    let shop_domain: String = row.try_get("shop_domain").map_err(map)?;
    let pipelines: Vec<String> = row.try_get("pipelines").map_err(map)?;

    let mut tenant = Tenant::new(TenantId::from_uuid(id), shop_domain);
    for tag in pipelines {
        tenant = tenant.with_pipeline(tag.parse()?);
    }
    Ok(tenant)
}

#[async_trait]
impl TenantDirectory for PostgresTenantDirectory {
    async fn get(&self, tenant_id: TenantId) -> Result<Option<Tenant>, StoreError> {
        let row = sqlx::query(
            "SELECT tenant_id, shop_domain, pipelines FROM sync_tenants WHERE tenant_id = $1",
        )
        .bind(tenant_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_tenant", e))?;
        row.map(|r| tenant_from_row(&r)).transpose()
    }

    #[instrument(skip(self), fields(pipeline = %pipeline), err)]
    async fn list_enabled(&self, pipeline: PipelineType) -> Result<Vec<Tenant>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT tenant_id, shop_domain, pipelines
            FROM sync_tenants
            WHERE $1 = ANY(pipelines)
            ORDER BY tenant_id
            "#,
        )
        .bind(pipeline.as_str())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_tenants", e))?;
        rows.iter().map(tenant_from_row).collect()
    }
}
