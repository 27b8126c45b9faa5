use config::shared::EmptySessionPolicy;
use tracing::{info, warn};

use crate::backoff::{BackoffPolicy, RetryState};
use crate::concurrency::shutdown::{ShutdownResult, ShutdownRx};
use crate::error::{ErrorKind, EtlResult};
use crate::events::SESSION_CREATED;
use crate::source::base::ReadClient;
use crate::source::reconstruct::decode_schema;
use crate::types::{ReadOptions, ReadSession, SourceTableRef};
use crate::{bail, etl_error, transfer_event};

/// Creates read sessions, retrying transient failures.
#[derive(Debug, Clone)]
pub struct ReadSessionManager<C> {
    client: C,
    policy: BackoffPolicy,
    empty_session_policy: EmptySessionPolicy,
}

impl<C> ReadSessionManager<C>
where
    C: ReadClient,
{
    pub fn new(client: C, policy: BackoffPolicy, empty_session_policy: EmptySessionPolicy) -> Self {
        Self {
            client,
            policy,
            empty_session_policy,
        }
    }

    /// Creates a session over `table` and checks that it can be read.
    ///
    /// The session must carry a decodable schema. A session without streams fails with
    /// [`ErrorKind::SessionFailed`] unless [`EmptySessionPolicy::TreatAsEmpty`] is configured, in
    /// which case it is returned as is.
    pub async fn create_session(
        &self,
        table: &SourceTableRef,
        max_stream_count: u32,
        options: &ReadOptions,
        shutdown_rx: &mut ShutdownRx,
    ) -> EtlResult<ReadSession> {
        if max_stream_count == 0 {
            bail!(
                ErrorKind::ConfigError,
                "Maximum stream count must be at least one"
            );
        }

        let mut retry = RetryState::new(self.policy.clone());
        let session = loop {
            let result = match shutdown_rx
                .run(
                    self.client
                        .create_read_session(table, max_stream_count, options),
                )
                .await
            {
                ShutdownResult::Ok(result) => result,
                ShutdownResult::Shutdown => {
                    bail!(ErrorKind::Cancelled, "Read session creation was cancelled")
                }
            };

            match result {
                Ok(session) => break session,
                Err(err) => {
                    let decision = retry.record_failure(&err);
                    if !decision.retry {
                        return Err(err);
                    }

                    warn!(
                        table = %table,
                        attempt = retry.attempts(),
                        delay_ms = decision.delay.as_millis() as u64,
                        error = %err,
                        "read session creation failed, retrying"
                    );

                    if let ShutdownResult::Shutdown =
                        shutdown_rx.run(tokio::time::sleep(decision.delay)).await
                    {
                        bail!(ErrorKind::Cancelled, "Read session creation was cancelled");
                    }
                }
            }
        };

        if session.schema_descriptor.is_empty() {
            bail!(
                ErrorKind::SessionFailed,
                "Read session has no schema",
                session.name
            );
        }

        decode_schema(&session.schema_descriptor).map_err(|err| {
            etl_error!(
                ErrorKind::SessionFailed,
                "Read session schema cannot be decoded",
                session.name,
                source: err
            )
        })?;

        if session.streams.is_empty() {
            match self.empty_session_policy {
                EmptySessionPolicy::Fail => bail!(
                    ErrorKind::SessionFailed,
                    "Read session returned no streams",
                    format!("session {} over {table}", session.name)
                ),
                EmptySessionPolicy::TreatAsEmpty => {
                    info!(
                        table = %table,
                        session = %session.name,
                        "read session has no streams, treating table as empty"
                    );
                }
            }
        }

        transfer_event!(
            SESSION_CREATED,
            table = %table,
            session = %session.name,
            streams = session.streams.len()
        );

        Ok(session)
    }
}
