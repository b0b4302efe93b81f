use std::sync::OnceLock;

use regex::Regex;
use sqlx::SqlitePool;
use thiserror::Error;
use uuid::Uuid;

use super::models::{CreatePolicyInput, PolicyCommand, RlsPolicy};
use crate::middleware::auth::AuthContext;

#[derive(Error, Debug)]
pub enum RlsError {
    #[error("policy '{0}' already exists for this table")]
    DuplicatePolicy(String),

    #[error("policy not found")]
    PolicyNotFound,

    #[error("unknown policy command '{0}'")]
    InvalidCommand(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Loads policies, substitutes auth functions and assembles per-command
/// `WHERE`/`CHECK` fragments. Policies are user-authored SQL; beyond
/// escaping the substituted values nothing is validated here, and a
/// malformed expression surfaces as a database error at query time.
#[derive(Clone)]
pub struct RlsService {
    pool: SqlitePool,
}

impl RlsService {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // ==================== POLICY STORE ====================

    pub async fn list_policies(&self, table: &str) -> Result<Vec<RlsPolicy>, RlsError> {
        let policies = sqlx::query_as::<_, RlsPolicy>(
            "SELECT id, table_name, policy_name, command, using_expr, check_expr, enabled
             FROM _rls_policies WHERE table_name = ? ORDER BY policy_name",
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await?;
        Ok(policies)
    }

    pub async fn create_policy(
        &self,
        table: &str,
        input: CreatePolicyInput,
    ) -> Result<RlsPolicy, RlsError> {
        let command = PolicyCommand::parse(&input.command)
            .ok_or_else(|| RlsError::InvalidCommand(input.command.clone()))?;

        let id = Uuid::new_v4();
        let result = sqlx::query(
            "INSERT INTO _rls_policies (id, table_name, policy_name, command, using_expr, check_expr, enabled)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(table)
        .bind(&input.policy_name)
        .bind(command.as_str())
        .bind(&input.using_expr)
        .bind(&input.check_expr)
        .bind(input.enabled)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {}
            Err(sqlx::Error::Database(e)) if e.message().contains("UNIQUE constraint failed") => {
                return Err(RlsError::DuplicatePolicy(input.policy_name));
            }
            Err(e) => return Err(e.into()),
        }

        Ok(RlsPolicy {
            id,
            table_name: table.to_string(),
            policy_name: input.policy_name,
            command: command.as_str().to_string(),
            using_expr: input.using_expr,
            check_expr: input.check_expr,
            enabled: input.enabled,
        })
    }

    pub async fn delete_policy(&self, table: &str, policy_name: &str) -> Result<(), RlsError> {
        let result =
            sqlx::query("DELETE FROM _rls_policies WHERE table_name = ? AND policy_name = ?")
                .bind(table)
                .bind(policy_name)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(RlsError::PolicyNotFound);
        }
        Ok(())
    }

    pub async fn set_table_rls(&self, table: &str, enabled: bool) -> Result<(), RlsError> {
        sqlx::query(
            "INSERT INTO _rls_tables (table_name, enabled) VALUES (?, ?)
             ON CONFLICT (table_name) DO UPDATE SET enabled = excluded.enabled",
        )
        .bind(table)
        .bind(enabled)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn is_rls_enabled(&self, table: &str) -> Result<bool, RlsError> {
        let enabled: Option<bool> =
            sqlx::query_scalar("SELECT enabled FROM _rls_tables WHERE table_name = ?")
                .bind(table)
                .fetch_optional(&self.pool)
                .await?;
        Ok(enabled.unwrap_or(false))
    }

    // ==================== CONDITION ASSEMBLY ====================

    /// `WHERE` fragment for SELECT/UPDATE/DELETE visibility. `None` means
    /// unrestricted; with RLS enabled and no applicable policy the
    /// condition is `0 = 1` so non-bypass callers see nothing.
    pub async fn using_condition(
        &self,
        table: &str,
        command: PolicyCommand,
        ctx: &AuthContext,
    ) -> Result<Option<String>, RlsError> {
        if ctx.bypass_rls || !self.is_rls_enabled(table).await? {
            return Ok(None);
        }

        let applicable: Vec<RlsPolicy> = self
            .list_policies(table)
            .await?
            .into_iter()
            .filter(|p| p.enabled && p.applies_to(command))
            .collect();

        if applicable.is_empty() {
            return Ok(Some("0 = 1".to_string()));
        }

        let exprs: Vec<String> = applicable
            .iter()
            .filter_map(|p| p.using_expr.as_deref())
            .filter(|e| !e.trim().is_empty())
            .map(|e| format!("({})", substitute_auth_functions(e, ctx)))
            .collect();

        if exprs.is_empty() {
            return Ok(None);
        }
        Ok(Some(exprs.join(" AND ")))
    }

    /// `CHECK` fragment admitting INSERTed rows. A policy with only a
    /// USING clause (e.g. `command = ALL`) lends it as the implicit CHECK.
    pub async fn check_condition(
        &self,
        table: &str,
        ctx: &AuthContext,
    ) -> Result<Option<String>, RlsError> {
        if ctx.bypass_rls || !self.is_rls_enabled(table).await? {
            return Ok(None);
        }

        let applicable: Vec<RlsPolicy> = self
            .list_policies(table)
            .await?
            .into_iter()
            .filter(|p| p.enabled && p.applies_to(PolicyCommand::Insert))
            .collect();

        if applicable.is_empty() {
            return Ok(Some("0 = 1".to_string()));
        }

        let exprs: Vec<String> = applicable
            .iter()
            .filter_map(|p| {
                p.check_expr
                    .as_deref()
                    .filter(|e| !e.trim().is_empty())
                    .or(p.using_expr.as_deref())
            })
            .filter(|e| !e.trim().is_empty())
            .map(|e| format!("({})", substitute_auth_functions(e, ctx)))
            .collect();

        if exprs.is_empty() {
            return Ok(None);
        }
        Ok(Some(exprs.join(" AND ")))
    }
}

impl RlsService {
    /// CHECK fragment validating rows after an UPDATE. Unlike INSERT
    /// admission there is no deny-default: only explicitly written CHECK
    /// expressions participate.
    pub async fn update_check_condition(
        &self,
        table: &str,
        ctx: &AuthContext,
    ) -> Result<Option<String>, RlsError> {
        if ctx.bypass_rls || !self.is_rls_enabled(table).await? {
            return Ok(None);
        }

        let exprs: Vec<String> = self
            .list_policies(table)
            .await?
            .into_iter()
            .filter(|p| p.enabled && p.applies_to(PolicyCommand::Update))
            .filter_map(|p| p.check_expr.clone())
            .filter(|e| !e.trim().is_empty())
            .map(|e| format!("({})", substitute_auth_functions(&e, ctx)))
            .collect();

        if exprs.is_empty() {
            return Ok(None);
        }
        Ok(Some(exprs.join(" AND ")))
    }
}

fn sql_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn jwt_claim_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"auth\.jwt\(\)\s*->>\s*'([^']+)'").unwrap())
}

fn storage_fn_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"storage\.(foldername|filename)\(([^)]*)\)").unwrap())
}

/// Purely textual substitution of the auth-function vocabulary into a
/// policy expression. Values are single-quote escaped; no SQL parsing is
/// attempted.
pub fn substitute_auth_functions(expr: &str, ctx: &AuthContext) -> String {
    let uid = if ctx.user_id.is_empty() {
        "NULL".to_string()
    } else {
        sql_quote(&ctx.user_id)
    };
    let email = if ctx.email.is_empty() {
        "NULL".to_string()
    } else {
        sql_quote(&ctx.email)
    };

    let expr = jwt_claim_re().replace_all(expr, |caps: &regex::Captures| {
        match ctx.claims.get(&caps[1]) {
            Some(serde_json::Value::String(s)) => sql_quote(s),
            Some(serde_json::Value::Null) | None => "NULL".to_string(),
            Some(other) => sql_quote(&other.to_string()),
        }
    });

    // storage helpers expand to the engine's path idiom: dirname is the
    // prefix left after stripping the basename, basename is the remainder.
    let expr = storage_fn_re().replace_all(&expr, |caps: &regex::Captures| {
        let arg = &caps[2];
        match &caps[1] {
            "foldername" => format!("rtrim(rtrim({arg}, replace({arg}, '/', '')), '/')"),
            _ => format!("replace({arg}, rtrim({arg}, replace({arg}, '/', '')), '')"),
        }
    });

    expr.replace("auth.uid()", &uid)
        .replace("auth.role()", &sql_quote(&ctx.role))
        .replace("auth.email()", &email)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> AuthContext {
        AuthContext {
            user_id: "user-1".to_string(),
            email: "a@x.io".to_string(),
            role: "authenticated".to_string(),
            claims: json!({"sub": "user-1", "plan": "pro"}),
            bypass_rls: false,
        }
    }

    #[test]
    fn substitutes_uid_role_email() {
        let out = substitute_auth_functions(
            "user_id = auth.uid() AND auth.role() = 'authenticated' AND owner = auth.email()",
            &ctx(),
        );
        assert_eq!(
            out,
            "user_id = 'user-1' AND 'authenticated' = 'authenticated' AND owner = 'a@x.io'"
        );
    }

    #[test]
    fn escapes_single_quotes() {
        let mut c = ctx();
        c.user_id = "o'brien".to_string();
        let out = substitute_auth_functions("user_id = auth.uid()", &c);
        assert_eq!(out, "user_id = 'o''brien'");
    }

    #[test]
    fn anonymous_uid_becomes_null() {
        let mut c = ctx();
        c.user_id = String::new();
        c.email = String::new();
        let out = substitute_auth_functions("user_id = auth.uid() OR email = auth.email()", &c);
        assert_eq!(out, "user_id = NULL OR email = NULL");
    }

    #[test]
    fn jwt_claims_resolve_or_null() {
        let out = substitute_auth_functions(
            "plan = auth.jwt()->>'plan' AND other = auth.jwt() ->> 'missing'",
            &ctx(),
        );
        assert_eq!(out, "plan = 'pro' AND other = NULL");
    }

    #[test]
    fn storage_helpers_expand_to_path_expressions() {
        let out = substitute_auth_functions("storage.filename(name) = 'a.png'", &ctx());
        assert_eq!(
            out,
            "replace(name, rtrim(name, replace(name, '/', '')), '') = 'a.png'"
        );
    }
}
