use std::path::Path;

use config::shared::{
    BackoffConfig, Compression, EmptySessionPolicy, LoadConfig, SnowflakeConfig, SourceConfig,
    TransferConfig, UploadLogin,
};
use secrecy::SecretString;

/// Stage used by [`test_transfer_config`].
pub const TEST_STAGE: &str = "@test_stage";

/// Destination table used by [`test_transfer_config`], as passed to `COPY INTO`.
pub const TEST_TABLE: &str = "ANALYTICS.PUBLIC.EVENTS";

/// Transfer configuration for in-memory clients, writing files under `local_dir`.
///
/// Retries wait at most a few milliseconds so failure scenarios finish quickly.
pub fn test_transfer_config(local_dir: &Path) -> TransferConfig {
    TransferConfig {
        source: SourceConfig {
            project_id: "test-project".to_owned(),
            dataset_id: "analytics".to_owned(),
            table_id: "events".to_owned(),
            service_account_key: None,
            selected_fields: Vec::new(),
            row_restriction: None,
        },
        destination: SnowflakeConfig {
            account: "test-account".to_owned(),
            token: SecretString::new("test-token".to_owned()),
            upload_login: UploadLogin::Password {
                user: "loader".to_owned(),
                password: SecretString::new("test-password".to_owned()),
            },
            database: "ANALYTICS".to_owned(),
            schema: "PUBLIC".to_owned(),
            table: "EVENTS".to_owned(),
            warehouse: None,
            role: None,
            base_url: None,
        },
        stage: TEST_STAGE.to_owned(),
        max_stream_count: 4,
        batch_size_bytes: TransferConfig::DEFAULT_BATCH_SIZE_BYTES,
        file_size_bytes: TransferConfig::DEFAULT_FILE_SIZE_BYTES,
        compression: Compression::Snappy,
        load: LoadConfig::default(),
        backoff: BackoffConfig {
            initial_delay_ms: 1,
            multiplier: 2.0,
            max_delay_ms: 5,
            max_attempts: 3,
        },
        empty_session_policy: EmptySessionPolicy::Fail,
        timeout_ms: 30_000,
        local_dir: local_dir.to_path_buf(),
        channel_capacity: 4,
    }
}
