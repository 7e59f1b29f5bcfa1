//! Cross-system contact identity

use chrono::Utc;
use sqlx::{sqlite::SqlitePool, FromRow};

use super::{parse_ts, ts};
use crate::domain::{normalize_email, normalize_phone, ContactMapping, MappingKey};
use crate::infra::{Result, SyncError};

#[derive(Clone)]
pub struct SqliteMappingStore {
    pool: SqlitePool,
}

impl SqliteMappingStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Merge identifiers into the row matching either system id.
    ///
    /// Known values are never overwritten with NULL.
    pub async fn upsert(&self, mapping: &ContactMapping) -> Result<ContactMapping> {
        let key = match (&mapping.crm_id, &mapping.dialer_id) {
            (Some(crm_id), _) => MappingKey::CrmId(crm_id.clone()),
            (None, Some(dialer_id)) => MappingKey::DialerId(dialer_id.clone()),
            (None, None) => {
                return Err(SyncError::InvalidInput(
                    "mapping needs a crm id or a dialer id".to_string(),
                ))
            }
        };

        let now = ts(Utc::now());
        let phone = mapping.phone.as_deref().map(normalize_phone);
        let email = mapping.email.as_deref().map(normalize_email);

        let updated = sqlx::query(
            r#"
            UPDATE contact_mappings SET
                crm_id = COALESCE(?, crm_id),
                dialer_id = COALESCE(?, dialer_id),
                phone = COALESCE(?, phone),
                email = COALESCE(?, email),
                updated_at = ?
            WHERE crm_id = ? OR dialer_id = ?
            "#,
        )
        .bind(&mapping.crm_id)
        .bind(&mapping.dialer_id)
        .bind(&phone)
        .bind(&email)
        .bind(&now)
        .bind(&mapping.crm_id)
        .bind(&mapping.dialer_id)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            sqlx::query(
                r#"
                INSERT INTO contact_mappings (crm_id, dialer_id, phone, email, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&mapping.crm_id)
            .bind(&mapping.dialer_id)
            .bind(&phone)
            .bind(&email)
            .bind(&now)
            .bind(&now)
            .execute(&self.pool)
            .await?;
        }

        self.resolve(&key)
            .await?
            .ok_or_else(|| SyncError::Internal("mapping vanished after upsert".to_string()))
    }

    pub async fn resolve(&self, key: &MappingKey) -> Result<Option<ContactMapping>> {
        let (column, value) = match key {
            MappingKey::CrmId(v) => ("crm_id", v.clone()),
            MappingKey::DialerId(v) => ("dialer_id", v.clone()),
            MappingKey::Phone(v) => ("phone", normalize_phone(v)),
            MappingKey::Email(v) => ("email", normalize_email(v)),
        };

        let row = sqlx::query_as::<_, MappingRow>(&format!(
            "SELECT crm_id, dialer_id, phone, email, updated_at FROM contact_mappings \
             WHERE {column} = ? ORDER BY updated_at DESC LIMIT 1"
        ))
        .bind(value)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ContactMapping::try_from).transpose()
    }
}

#[derive(Debug, FromRow)]
struct MappingRow {
    crm_id: Option<String>,
    dialer_id: Option<String>,
    phone: Option<String>,
    email: Option<String>,
    updated_at: String,
}

impl TryFrom<MappingRow> for ContactMapping {
    type Error = SyncError;

    fn try_from(row: MappingRow) -> Result<Self> {
        Ok(ContactMapping {
            crm_id: row.crm_id,
            dialer_id: row.dialer_id,
            phone: row.phone,
            email: row.email,
            updated_at: parse_ts(&row.updated_at, "updated_at")?,
        })
    }
}
