use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Command a policy applies to. `All` matches every command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PolicyCommand {
    Select,
    Insert,
    Update,
    Delete,
    All,
}

impl PolicyCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyCommand::Select => "SELECT",
            PolicyCommand::Insert => "INSERT",
            PolicyCommand::Update => "UPDATE",
            PolicyCommand::Delete => "DELETE",
            PolicyCommand::All => "ALL",
        }
    }

    pub fn parse(s: &str) -> Option<PolicyCommand> {
        match s.to_ascii_uppercase().as_str() {
            "SELECT" => Some(PolicyCommand::Select),
            "INSERT" => Some(PolicyCommand::Insert),
            "UPDATE" => Some(PolicyCommand::Update),
            "DELETE" => Some(PolicyCommand::Delete),
            "ALL" => Some(PolicyCommand::All),
            _ => None,
        }
    }
}

/// A persisted policy. `using_expr` and `check_expr` are user-authored SQL
/// fragments; the server substitutes auth functions into them but never
/// parses them.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct RlsPolicy {
    pub id: Uuid,
    pub table_name: String,
    pub policy_name: String,
    pub command: String,
    pub using_expr: Option<String>,
    pub check_expr: Option<String>,
    pub enabled: bool,
}

impl RlsPolicy {
    pub fn applies_to(&self, command: PolicyCommand) -> bool {
        match PolicyCommand::parse(&self.command) {
            Some(PolicyCommand::All) => true,
            Some(cmd) => cmd == command,
            None => false,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreatePolicyInput {
    pub policy_name: String,
    pub command: String,
    pub using_expr: Option<String>,
    pub check_expr: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}
