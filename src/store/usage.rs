// =============================================================================
// Store: reasoning-provider usage log
// =============================================================================

use anyhow::{Context, Result};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::Store;

/// Originating prompts are truncated before storage.
pub const USER_PROMPT_MAX_LEN: usize = 500;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiUsageRow {
    pub id: String,
    pub account_id: String,
    pub provider: String,
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub estimated_cost: f64,
    pub success: bool,
    pub user_prompt: String,
    pub created_at: String,
}

impl Store {
    pub fn insert_ai_usage(
        &self,
        account_id: &str,
        provider: &str,
        model: &str,
        prompt_tokens: u64,
        completion_tokens: u64,
        estimated_cost: f64,
        success: bool,
        user_prompt: &str,
    ) -> Result<()> {
        let truncated: String = user_prompt.chars().take(USER_PROMPT_MAX_LEN).collect();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO ai_usage_log
                 (id, account_id, provider, model, prompt_tokens, completion_tokens,
                  estimated_cost, success, user_prompt, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                Uuid::new_v4().to_string(),
                account_id,
                provider,
                model,
                prompt_tokens as i64,
                completion_tokens as i64,
                estimated_cost,
                success as i64,
                truncated,
                Self::now()
            ],
        )
        .context("failed to insert ai usage row")?;
        Ok(())
    }

    pub fn ai_usage_for_account(&self, account_id: &str, limit: usize) -> Result<Vec<AiUsageRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, account_id, provider, model, prompt_tokens, completion_tokens,
                    estimated_cost, success, user_prompt, created_at
             FROM ai_usage_log WHERE account_id = ?1
             ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![account_id, limit as i64], |row| {
                Ok(AiUsageRow {
                    id: row.get(0)?,
                    account_id: row.get(1)?,
                    provider: row.get(2)?,
                    model: row.get(3)?,
                    prompt_tokens: row.get::<_, i64>(4)? as u64,
                    completion_tokens: row.get::<_, i64>(5)? as u64,
                    estimated_cost: row.get(6)?,
                    success: row.get::<_, i64>(7)? != 0,
                    user_prompt: row.get(8)?,
                    created_at: row.get(9)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_rows_truncate_prompt() {
        let store = Store::open_in_memory().unwrap();
        store.create_account("acct-1", None).unwrap();

        let long_prompt = "x".repeat(2000);
        store
            .insert_ai_usage("acct-1", "openai", "gpt-4o", 1200, 300, 0.012, true, &long_prompt)
            .unwrap();

        let rows = store.ai_usage_for_account("acct-1", 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].user_prompt.len(), USER_PROMPT_MAX_LEN);
        assert!(rows[0].success);
        assert_eq!(rows[0].prompt_tokens, 1200);
    }
}
