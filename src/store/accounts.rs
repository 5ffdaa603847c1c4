// =============================================================================
// Store: accounts, secret envelopes, provider API keys, monitoring log
// =============================================================================

use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::secret_store::SecretEnvelope;
use crate::store::Store;
use crate::types::{AgentMode, VerificationStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountRow {
    pub id: String,
    pub role: String,
    pub verification_status: VerificationStatus,
    pub agent_mode: AgentMode,
    pub monitoring_frequency_minutes: u64,
    pub main_wallet_address: Option<String>,
    pub created_at: String,
    pub deleted_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRow {
    pub id: String,
    pub account_id: String,
    pub provider_type: String,
    pub provider_name: String,
    pub label: String,
    #[serde(skip)]
    pub envelope: Option<SecretEnvelope>,
    pub is_active: bool,
    pub created_at: String,
    pub last_used: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringLogRow {
    pub id: String,
    pub account_id: String,
    pub state: String,
    pub triggered_by: String,
    pub outcome: String,
    pub created_at: String,
}

fn account_from_row(row: &Row<'_>) -> rusqlite::Result<AccountRow> {
    let status: String = row.get("verification_status")?;
    let mode: String = row.get("agent_mode")?;
    Ok(AccountRow {
        id: row.get("id")?,
        role: row.get("role")?,
        verification_status: VerificationStatus::parse(&status)
            .unwrap_or(VerificationStatus::Pending),
        agent_mode: AgentMode::parse(&mode).unwrap_or(AgentMode::Passive),
        monitoring_frequency_minutes: row.get::<_, i64>("monitoring_frequency_minutes")? as u64,
        main_wallet_address: row.get("main_wallet_address")?,
        created_at: row.get("created_at")?,
        deleted_at: row.get("deleted_at")?,
    })
}

impl Store {
    // -------------------------------------------------------------------------
    // Accounts
    // -------------------------------------------------------------------------

    /// Register a new account in `pending` + `passive` with monitoring off.
    pub fn create_account(&self, id: &str, main_wallet_address: Option<&str>) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO account (id, role, verification_status, agent_mode,
                                  monitoring_frequency_minutes, main_wallet_address, created_at)
             VALUES (?1, 'user', 'pending', 'passive', 0, ?2, ?3)",
            params![id, main_wallet_address, Self::now()],
        )
        .context("failed to create account")?;
        Ok(())
    }

    pub fn get_account(&self, id: &str) -> Result<Option<AccountRow>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT * FROM account WHERE id = ?1 AND deleted_at IS NULL",
            params![id],
            account_from_row,
        )
        .optional()
        .context("failed to load account")
    }

    /// Accounts eligible for a control loop on startup restore.
    pub fn active_approved_accounts(&self) -> Result<Vec<AccountRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM account
             WHERE verification_status = 'approved' AND agent_mode = 'active'
               AND deleted_at IS NULL",
        )?;
        let rows = stmt
            .query_map([], account_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn set_verification_status(&self, id: &str, status: VerificationStatus) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE account SET verification_status = ?2 WHERE id = ?1",
            params![id, status.to_string()],
        )?;
        Ok(())
    }

    pub fn set_agent_mode(&self, id: &str, mode: AgentMode) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE account SET agent_mode = ?2 WHERE id = ?1",
            params![id, mode.to_string()],
        )?;
        Ok(())
    }

    pub fn set_monitoring_frequency(&self, id: &str, minutes: u64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE account SET monitoring_frequency_minutes = ?2 WHERE id = ?1",
            params![id, minutes as i64],
        )?;
        Ok(())
    }

    /// Destruction is soft: the row stays for audit, the account disappears
    /// from every query.
    pub fn soft_delete_account(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE account SET deleted_at = ?2 WHERE id = ?1 AND deleted_at IS NULL",
            params![id, Self::now()],
        )?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Secret envelopes
    // -------------------------------------------------------------------------

    /// Insert or atomically replace the account's envelope.
    pub fn put_secret_envelope(&self, account_id: &str, envelope: &SecretEnvelope) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO secret_envelope
                 (account_id, encrypted_payload, payload_iv, encrypted_dek, dek_iv, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(account_id) DO UPDATE SET
                 encrypted_payload = excluded.encrypted_payload,
                 payload_iv        = excluded.payload_iv,
                 encrypted_dek     = excluded.encrypted_dek,
                 dek_iv            = excluded.dek_iv,
                 updated_at        = excluded.updated_at",
            params![
                account_id,
                envelope.encrypted_payload,
                envelope.payload_iv,
                envelope.encrypted_dek,
                envelope.dek_iv,
                Self::now()
            ],
        )
        .context("failed to store secret envelope")?;
        Ok(())
    }

    pub fn get_secret_envelope(&self, account_id: &str) -> Result<Option<SecretEnvelope>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT encrypted_payload, payload_iv, encrypted_dek, dek_iv
             FROM secret_envelope WHERE account_id = ?1",
            params![account_id],
            |row| {
                Ok(SecretEnvelope {
                    encrypted_payload: row.get(0)?,
                    payload_iv: row.get(1)?,
                    encrypted_dek: row.get(2)?,
                    dek_iv: row.get(3)?,
                })
            },
        )
        .optional()
        .context("failed to load secret envelope")
    }

    pub fn has_secret_envelope(&self, account_id: &str) -> Result<bool> {
        Ok(self.get_secret_envelope(account_id)?.is_some())
    }

    pub fn delete_secret_envelope(&self, account_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM secret_envelope WHERE account_id = ?1",
            params![account_id],
        )?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Provider API keys
    // -------------------------------------------------------------------------

    pub fn insert_api_key(
        &self,
        account_id: &str,
        provider_type: &str,
        provider_name: &str,
        label: &str,
        envelope: &SecretEnvelope,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO api_key
                 (id, account_id, provider_type, provider_name, label,
                  encrypted_api_key, api_key_iv, encrypted_dek, dek_iv, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                id,
                account_id,
                provider_type,
                provider_name,
                label,
                envelope.encrypted_payload,
                envelope.payload_iv,
                envelope.encrypted_dek,
                envelope.dek_iv,
                Self::now()
            ],
        )
        .context("failed to store api key")?;
        Ok(id)
    }

    /// The newest active personal key for a provider type, if any.
    pub fn active_api_key(
        &self,
        account_id: &str,
        provider_type: &str,
    ) -> Result<Option<ApiKeyRow>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, account_id, provider_type, provider_name, label,
                    encrypted_api_key, api_key_iv, encrypted_dek, dek_iv,
                    is_active, created_at, last_used
             FROM api_key
             WHERE account_id = ?1 AND provider_type = ?2 AND is_active = 1
             ORDER BY created_at DESC LIMIT 1",
            params![account_id, provider_type],
            |row| {
                Ok(ApiKeyRow {
                    id: row.get(0)?,
                    account_id: row.get(1)?,
                    provider_type: row.get(2)?,
                    provider_name: row.get(3)?,
                    label: row.get(4)?,
                    envelope: Some(SecretEnvelope {
                        encrypted_payload: row.get(5)?,
                        payload_iv: row.get(6)?,
                        encrypted_dek: row.get(7)?,
                        dek_iv: row.get(8)?,
                    }),
                    is_active: row.get::<_, i64>(9)? != 0,
                    created_at: row.get(10)?,
                    last_used: row.get(11)?,
                })
            },
        )
        .optional()
        .context("failed to load api key")
    }

    pub fn touch_api_key(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE api_key SET last_used = ?2 WHERE id = ?1",
            params![id, Self::now()],
        )?;
        Ok(())
    }

    pub fn deactivate_api_key(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE api_key SET is_active = 0 WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Monitoring log
    // -------------------------------------------------------------------------

    pub fn append_monitoring_log(
        &self,
        account_id: &str,
        state: &str,
        triggered_by: &str,
        outcome: &str,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO monitoring_log (id, account_id, state, triggered_by, outcome, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                Uuid::new_v4().to_string(),
                account_id,
                state,
                triggered_by,
                outcome,
                Self::now()
            ],
        )?;
        Ok(())
    }

    /// The most recent monitoring log row; drives the run-immediately
    /// decision on monitor restore.
    pub fn last_monitoring_log(&self, account_id: &str) -> Result<Option<MonitoringLogRow>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, account_id, state, triggered_by, outcome, created_at
             FROM monitoring_log WHERE account_id = ?1
             ORDER BY created_at DESC LIMIT 1",
            params![account_id],
            |row| {
                Ok(MonitoringLogRow {
                    id: row.get(0)?,
                    account_id: row.get(1)?,
                    state: row.get(2)?,
                    triggered_by: row.get(3)?,
                    outcome: row.get(4)?,
                    created_at: row.get(5)?,
                })
            },
        )
        .optional()
        .context("failed to load monitoring log")
    }
}
