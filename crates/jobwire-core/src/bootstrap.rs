//! Session bootstrap: the authentication handshake and, for user sessions,
//! the one-time resolution of the job the client will run as.
//!
//! Everything here talks directly over a freshly opened session before the
//! worker's steady loop starts, one request at a time. Nothing else can be on
//! the wire yet, so no message can overtake authentication.

use crate::config::{AccountConfig, JobCredentials, ProjectSelector};
use crate::correlator::Correlator;
use crate::error::{ClientError, Result};
use crate::message::{Inbound, Request, Response};
use crate::transport::{SessionReader, SessionWriter};
use serde_json::Value;
use tracing::{debug, info, warn};

/// The job a client runs as.
///
/// In user mode `document` is the job created during bootstrap; in job mode
/// only the id is known and the document is `null`.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedJob {
    pub id: String,
    pub document: Value,
}

impl LoadedJob {
    pub fn from_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            document: Value::Null,
        }
    }
}

/// Sequential request/response exchange over a raw session.
pub struct Handshake<'a> {
    reader: &'a mut SessionReader,
    writer: &'a mut SessionWriter,
}

impl<'a> Handshake<'a> {
    pub fn new(reader: &'a mut SessionReader, writer: &'a mut SessionWriter) -> Self {
        Self { reader, writer }
    }

    /// Send `request` under `id` and wait for the frame carrying the same id.
    pub async fn call(&mut self, id: u64, request: Request) -> Result<Inbound> {
        let bytes = request.into_message(id).encode()?;
        self.writer.send(&bytes).await?;

        loop {
            let frame = self.reader.receive().await?.ok_or_else(|| {
                ClientError::ConnectionLost("session closed during handshake".into())
            })?;
            match Inbound::decode(&frame) {
                Ok(Some(inbound)) if inbound.id == id => return Ok(inbound),
                Ok(Some(other)) => debug!("Ignoring message {} during handshake", other.id),
                Ok(None) => {}
                Err(e) => warn!("{}", e),
            }
        }
    }

    /// Authenticate; anything but an explicit `true` is fatal.
    pub async fn authenticate(&mut self, id: u64, request: Request, failure: &str) -> Result<()> {
        match self.call(id, request).await?.response() {
            Response::Authenticated(true) => Ok(()),
            _ => Err(ClientError::Auth(failure.to_string())),
        }
    }

    /// Run one `action` call and return its `next` value.
    pub async fn action(
        &mut self,
        id: u64,
        controller: &str,
        action: &str,
        args: Vec<Value>,
        timeout_secs: u64,
    ) -> Result<Option<Value>> {
        let inbound = self
            .call(id, Request::action(controller, action, args, timeout_secs))
            .await?;
        match inbound.response() {
            Response::Next(value) => Ok(value),
            Response::Error(message) => Err(ClientError::Action {
                controller: controller.to_string(),
                action: action.to_string(),
                message,
            }),
            other => Err(ClientError::Protocol(format!(
                "unexpected response to {}.{}: {:?}",
                controller, action, other
            ))),
        }
    }
}

/// Authenticate a session as an existing job.
pub async fn authenticate_job<P>(
    reader: &mut SessionReader,
    writer: &mut SessionWriter,
    correlator: &mut Correlator<P>,
    credentials: &JobCredentials,
) -> Result<()> {
    let id = correlator.next_id();
    Handshake::new(reader, writer)
        .authenticate(id, Request::authenticate_job(credentials), "Job token invalid")
        .await?;
    debug!("Authenticated as job {}", credentials.job_id);
    Ok(())
}

/// Log in with an account token, create a job and mint its access token.
///
/// `created` records the job as soon as the service has created it. When it
/// is already set, resolution skips straight to minting the token, so a
/// retry after a dropped session never creates a second job.
///
/// The session is left open; the caller closes it and reconnects as the job.
pub async fn resolve_job<P>(
    reader: &mut SessionReader,
    writer: &mut SessionWriter,
    correlator: &mut Correlator<P>,
    account: &AccountConfig,
    project: &ProjectSelector,
    created: &mut Option<LoadedJob>,
    timeout_secs: u64,
) -> Result<(JobCredentials, LoadedJob)> {
    let mut handshake = Handshake::new(reader, writer);

    handshake
        .authenticate(
            correlator.next_id(),
            Request::authenticate_user(&account.token),
            "Login invalid",
        )
        .await?;

    let job = match created.clone() {
        Some(job) => {
            debug!("Resuming with already created job {}", job.id);
            job
        }
        None => {
            let job = create_job(&mut handshake, correlator, account, project, timeout_secs).await?;
            *created = Some(job.clone());
            job
        }
    };

    let token = handshake
        .action(
            correlator.next_id(),
            "app",
            "getJobAccessToken",
            vec![Value::String(job.id.clone())],
            timeout_secs,
        )
        .await
        .map_err(bootstrap_failure)?;
    let token = match token {
        Some(Value::String(token)) => token,
        other => {
            return Err(ClientError::Bootstrap(format!(
                "getJobAccessToken returned no token: {:?}",
                other
            )))
        }
    };

    Ok((JobCredentials::new(job.id.clone(), token), job))
}

/// Resolve the project and create a job under it.
async fn create_job<P>(
    handshake: &mut Handshake<'_>,
    correlator: &mut Correlator<P>,
    account: &AccountConfig,
    project: &ProjectSelector,
    timeout_secs: u64,
) -> Result<LoadedJob> {
    let project_id = match project {
        ProjectSelector::Linked { project_id } => project_id.clone(),
        ProjectSelector::Named(name) => {
            let found = handshake
                .action(
                    correlator.next_id(),
                    "app",
                    "getProjectForPublicName",
                    vec![Value::String(name.clone())],
                    timeout_secs,
                )
                .await
                .map_err(bootstrap_failure)?;
            found
                .as_ref()
                .and_then(|p| p.get("id"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| {
                    ClientError::Bootstrap(format!(
                        "No project found for name {}. Do you use the correct account? (used {})",
                        name, account.name
                    ))
                })?
        }
    };

    let document = handshake
        .action(
            correlator.next_id(),
            "app",
            "createJob",
            vec![Value::String(project_id.clone())],
            timeout_secs,
        )
        .await
        .map_err(bootstrap_failure)?
        .unwrap_or(Value::Null);
    let job_id = document
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            ClientError::Bootstrap(format!("createJob for project {} returned no job id", project_id))
        })?;

    info!("Created job {} in project {}", job_id, project_id);
    Ok(LoadedJob {
        id: job_id,
        document,
    })
}

/// Remote refusals during resolution end the client; transport errors stay retryable.
fn bootstrap_failure(err: ClientError) -> ClientError {
    match err {
        ClientError::Action { .. } | ClientError::Protocol(_) => {
            ClientError::Bootstrap(err.to_string())
        }
        other => other,
    }
}
