//! Client-side helpers behind the `warden` command.

pub mod query;

use serde::Serialize;
use warden::rmi::RmiError;
use warden::service::PolicyClient;
use warden::PolicyValue;

pub use query::{Column, QueryError, Statement};

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    Rmi(#[from] RmiError),

    #[error("UPDATE requires --admin")]
    MissingAdmin,

    #[error("policy {policy} holds integers, {value:?} is not one")]
    InvalidValue { policy: String, value: String },
}

impl CliError {
    /// Usage errors exit with 2, everything else with 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Query(_) | CliError::MissingAdmin => 2,
            CliError::Rmi(_) | CliError::InvalidValue { .. } => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub name: String,
    pub value: PolicyValue,
}

impl Row {
    /// `name|value` for the requested columns.
    pub fn format(&self, columns: &[Column]) -> String {
        columns
            .iter()
            .map(|column| match column {
                Column::Name => self.name.clone(),
                Column::Value => self.value.to_string(),
            })
            .collect::<Vec<_>>()
            .join("|")
    }

    pub fn to_json(&self, columns: &[Column]) -> serde_json::Value {
        let mut object = serde_json::Map::new();
        for column in columns {
            let value = match column {
                Column::Name => serde_json::json!(self.name),
                Column::Value => serde_json::json!(JsonValue::from(&self.value)),
            };
            object.insert(column.as_str().to_string(), value);
        }
        serde_json::Value::Object(object)
    }
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum JsonValue<'a> {
    Int(i64),
    Str(&'a str),
}

impl<'a> From<&'a PolicyValue> for JsonValue<'a> {
    fn from(value: &'a PolicyValue) -> Self {
        match value {
            PolicyValue::Int(n) => JsonValue::Int(*n),
            PolicyValue::Str(s) => JsonValue::Str(s),
        }
    }
}

/// One line of `--watch` output.
#[derive(Debug, Serialize)]
pub struct ChangeEvent<'a> {
    pub policy: &'a str,
    #[serde(serialize_with = "serialize_policy_value")]
    pub value: &'a PolicyValue,
}

fn serialize_policy_value<S: serde::Serializer>(
    value: &&PolicyValue,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    JsonValue::from(*value).serialize(serializer)
}

/// Type the literal of an UPDATE after the policy's current value.
fn typed_value(policy: &str, current: &PolicyValue, text: &str) -> Result<PolicyValue, CliError> {
    match current {
        PolicyValue::Int(_) => text
            .parse::<i64>()
            .map(PolicyValue::Int)
            .map_err(|_| CliError::InvalidValue {
                policy: policy.to_string(),
                value: text.to_string(),
            }),
        PolicyValue::Str(_) => Ok(PolicyValue::Str(text.to_string())),
    }
}

/// Run `statement` against the daemon. UPDATE returns no rows.
pub async fn execute(
    client: &PolicyClient,
    statement: &Statement,
    admin: Option<&str>,
) -> Result<Vec<Row>, CliError> {
    match statement {
        Statement::Select { name: Some(name), .. } => {
            let value = client.get(name).await?;
            Ok(vec![Row {
                name: name.clone(),
                value,
            }])
        }
        Statement::Select { name: None, .. } => Ok(client
            .get_all()
            .await?
            .into_iter()
            .map(|(name, value)| Row { name, value })
            .collect()),
        Statement::Update { name, value } => {
            let admin = admin.ok_or(CliError::MissingAdmin)?;
            let current = client.get(name).await?;
            let value = typed_value(name, &current, value)?;
            tracing::debug!(policy = %name, %value, admin, "Submitting vote");
            client.set(name, value, admin).await?;
            Ok(Vec::new())
        }
    }
}

/// Columns a statement prints.
pub fn columns(statement: &Statement) -> &[Column] {
    match statement {
        Statement::Select { columns, .. } => columns,
        Statement::Update { .. } => &[],
    }
}
