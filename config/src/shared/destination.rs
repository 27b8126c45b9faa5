use secrecy::SecretString;
use serde::Deserialize;

/// Snowflake account and target table.
#[derive(Clone, Debug, Deserialize)]
pub struct SnowflakeConfig {
    /// Account identifier, e.g. `myorg-myaccount`.
    pub account: String,
    /// OAuth or programmatic access token used as bearer credential.
    pub token: SecretString,
    /// Login of the driver session that uploads files with `PUT`.
    pub upload_login: UploadLogin,
    pub database: String,
    pub schema: String,
    pub table: String,
    #[serde(default)]
    pub warehouse: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    /// Overrides `https://{account}.snowflakecomputing.com`.
    #[serde(default)]
    pub base_url: Option<String>,
}

/// Credentials of a Snowflake user, for the session that runs `PUT`.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum UploadLogin {
    Password {
        user: String,
        password: SecretString,
    },
    /// Key pair authentication with a PEM encoded PKCS#8 private key.
    KeyPair {
        user: String,
        private_key: SecretString,
    },
}

impl UploadLogin {
    pub fn user(&self) -> &str {
        match self {
            UploadLogin::Password { user, .. } | UploadLogin::KeyPair { user, .. } => user,
        }
    }
}

impl SnowflakeConfig {
    /// `database.schema.table`, as used in `COPY INTO`.
    pub fn qualified_table(&self) -> String {
        format!("{}.{}.{}", self.database, self.schema, self.table)
    }

    pub fn endpoint(&self) -> String {
        match &self.base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("https://{}.snowflakecomputing.com", self.account),
        }
    }
}
