//! The connection supervisor.
//!
//! A single worker task owns the session, the correlator, the dispatcher and
//! the controller registry. Public handles talk to it only through
//! [`Command`]s, so none of that state is ever shared. The worker drives
//! connect, authenticate, run and reconnect, and sequences shutdown.
//!
//! Commands are not read while a session is being established: anything a
//! caller sends waits in the channel until authentication has completed.

use crate::bootstrap::{self, LoadedJob};
use crate::config::{ClientOptions, Endpoint, Identity, JobCredentials, SessionConfig};
use crate::correlator::{Correlator, ReplySender, Routed};
use crate::dispatcher::{Dispatcher, PatchSnapshot};
use crate::error::{ClientError, Result};
use crate::message::{Inbound, Request, Response};
use crate::registry::{Controller, ControllerRegistry, ControllerSubscription};
use crate::transport::{Session, SessionReader, SessionWriter};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Lifecycle of a client. Exactly one per client, observable through a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// The service was unreachable at startup; everything is a no-op from now on.
    Offline,
    Connecting,
    Authenticating,
    Connected,
    Reconnecting,
    /// Shutdown requested; draining before close.
    Stopping,
    Closed,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }

    /// No further state change will make the client usable.
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            ConnectionState::Connected | ConnectionState::Offline | ConnectionState::Closed
        )
    }
}

/// How the tracked process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Done,
    /// Interrupted (signal, Ctrl-C).
    Aborted,
    Failed,
    /// Ended by an unhandled failure.
    Crashed,
}

impl JobOutcome {
    pub fn job_status(self) -> i64 {
        match self {
            JobOutcome::Done => 150,
            JobOutcome::Aborted => 200,
            JobOutcome::Failed => 250,
            JobOutcome::Crashed => 300,
        }
    }

    pub fn task_status(self) -> i64 {
        match self {
            JobOutcome::Done => 500,
            JobOutcome::Aborted => 550,
            JobOutcome::Failed => 600,
            JobOutcome::Crashed => 650,
        }
    }

    /// Final patches for the job, its main task and that task's only instance.
    pub fn terminal_patches(self) -> Vec<(String, Value)> {
        let ended = Value::String(chrono::Utc::now().to_rfc3339());
        vec![
            ("status".into(), self.job_status().into()),
            ("ended".into(), ended.clone()),
            ("tasks.main.ended".into(), ended.clone()),
            ("tasks.main.status".into(), self.task_status().into()),
            ("tasks.main.instances.0.ended".into(), ended),
            ("tasks.main.instances.0.status".into(), self.task_status().into()),
        ]
    }
}

type Reply<T> = oneshot::Sender<Result<T>>;

/// Work marshaled from public handles onto the worker.
pub(crate) enum Command {
    Action {
        controller: String,
        action: String,
        args: Vec<Value>,
        reply: Reply<Option<Value>>,
    },
    Patch {
        path: String,
        value: Value,
    },
    Register {
        name: String,
        controller: Arc<dyn Controller>,
        reply: Reply<()>,
    },
    Unregister {
        name: String,
    },
    Shutdown {
        outcome: JobOutcome,
        reply: Reply<()>,
    },
}

/// What the correlator keeps for a call until its response arrives.
enum Pending {
    Call {
        controller: String,
        action: String,
        reply: Reply<Option<Value>>,
    },
    PatchBatch(PatchSnapshot),
}

/// Forwarded by the receive task.
enum ReaderEvent {
    Frame(Vec<u8>),
    /// The stream ended; `None` when it closed cleanly.
    Ended(Option<ClientError>),
}

enum SessionEnd {
    Lost(String),
    Closed(Result<()>),
}

/// Channels that connect a [`Worker`] to its handles.
pub(crate) struct WorkerHandles {
    pub commands: mpsc::UnboundedSender<Command>,
    pub state: watch::Receiver<ConnectionState>,
    pub job: watch::Receiver<Option<LoadedJob>>,
}

pub(crate) struct Worker {
    options: ClientOptions,
    state: watch::Sender<ConnectionState>,
    job: watch::Sender<Option<LoadedJob>>,
    commands: mpsc::UnboundedReceiver<Command>,
    commands_open: bool,
    replies: ReplySender,
    reply_rx: mpsc::UnboundedReceiver<Request>,
    correlator: Correlator<Pending>,
    dispatcher: Dispatcher,
    registry: ControllerRegistry,
    credentials: Option<(Endpoint, JobCredentials)>,
    /// Job created by user-mode resolution, kept so a retry never creates another.
    created_job: Option<LoadedJob>,
    sessions: u64,
    stopping: bool,
    shutdown_waiters: Vec<Reply<()>>,
}

impl Worker {
    pub(crate) fn new(options: ClientOptions) -> (Self, WorkerHandles) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);

        let (credentials, job) = match &options.identity {
            Identity::Job {
                endpoint,
                credentials,
            } => (
                Some((endpoint.clone(), credentials.clone())),
                Some(LoadedJob::from_id(credentials.job_id.clone())),
            ),
            Identity::User { .. } => (None, None),
        };
        let (job_tx, job_rx) = watch::channel(job);

        let worker = Self {
            dispatcher: Dispatcher::new(options.action_timeout_secs),
            options,
            state: state_tx,
            job: job_tx,
            commands: command_rx,
            commands_open: true,
            replies: ReplySender::new(reply_tx),
            reply_rx,
            correlator: Correlator::new(),
            registry: ControllerRegistry::default(),
            credentials,
            created_job: None,
            sessions: 0,
            stopping: false,
            shutdown_waiters: Vec::new(),
        };
        let handles = WorkerHandles {
            commands: command_tx,
            state: state_rx,
            job: job_rx,
        };
        (worker, handles)
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                debug!("Connection state {:?} -> {:?}", current, state);
                *current = state;
                true
            }
        });
    }

    /// Run until the client is closed and every handle is gone.
    pub(crate) async fn run(mut self) {
        let (mut reader, mut writer) = match self.establish(true).await {
            Ok(session) => session,
            Err(Establish::Offline(reason)) => return self.run_offline(reason).await,
            Err(Establish::Fatal(e)) => return self.run_terminal(Some(e)).await,
        };

        loop {
            match self.run_session(reader, writer).await {
                SessionEnd::Closed(result) => {
                    self.finish(result);
                    return self.run_terminal(None).await;
                }
                SessionEnd::Lost(reason) if self.stopping => {
                    let result = if self.dispatcher.is_drained() && self.replies.is_idle() {
                        Ok(())
                    } else {
                        Err(ClientError::ConnectionLost(format!(
                            "lost connection while draining: {}",
                            reason
                        )))
                    };
                    self.finish(result);
                    return self.run_terminal(None).await;
                }
                SessionEnd::Lost(reason) => {
                    warn!("Lost connection ({}). Reconnecting ...", reason);
                    match self.establish(false).await {
                        Ok(session) => (reader, writer) = session,
                        Err(Establish::Offline(reason)) => return self.run_offline(reason).await,
                        Err(Establish::Fatal(e)) => return self.run_terminal(Some(e)).await,
                    }
                }
            }
        }
    }

    // ---------------------------------------------------------------------
    // Connection establishment
    // ---------------------------------------------------------------------

    async fn establish(
        &mut self,
        first: bool,
    ) -> std::result::Result<(SessionReader, SessionWriter), Establish> {
        let mut attempt: u32 = 0;
        loop {
            self.set_state(if first && attempt == 0 {
                ConnectionState::Connecting
            } else {
                ConnectionState::Reconnecting
            });

            match self.try_establish().await {
                Ok(session) => {
                    self.sessions += 1;
                    if self.sessions > 1 {
                        info!("Reconnected.");
                    }
                    return Ok(session);
                }
                // User sessions that cannot reach the service at all go offline for good
                Err(ClientError::Connect { endpoint, message })
                    if first && attempt == 0 && self.credentials.is_none() =>
                {
                    return Err(Establish::Offline(format!("{}: {}", endpoint, message)));
                }
                Err(e) if e.is_retryable() => {
                    let delay = self.options.backoff.delay_for(attempt);
                    attempt = attempt.saturating_add(1);
                    warn!(
                        "Connection attempt {} failed ({}). Retrying in {:.1}s",
                        attempt,
                        e,
                        delay.as_secs_f64()
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!("{}", e);
                    return Err(Establish::Fatal(e));
                }
            }
        }
    }

    async fn try_establish(&mut self) -> Result<(SessionReader, SessionWriter)> {
        if self.credentials.is_none() {
            let Identity::User { account, project } = self.options.identity.clone() else {
                return Err(ClientError::config("job identity without credentials"));
            };
            let endpoint = account.endpoint();

            let (mut reader, mut writer) = Session::open(&endpoint).await?;
            self.set_state(ConnectionState::Authenticating);
            let (credentials, job) = bootstrap::resolve_job(
                &mut reader,
                &mut writer,
                &mut self.correlator,
                &account,
                &project,
                &mut self.created_job,
                self.options.action_timeout_secs,
            )
            .await?;
            if let Err(e) = writer.close().await {
                debug!("Closing user session: {}", e);
            }

            self.credentials = Some((endpoint, credentials));
            self.job.send_replace(Some(job));
            self.set_state(ConnectionState::Connecting);
        }

        let Some((endpoint, credentials)) = self.credentials.clone() else {
            return Err(ClientError::config("no job credentials resolved"));
        };
        let (mut reader, mut writer) = Session::open(&endpoint).await?;
        self.set_state(ConnectionState::Authenticating);
        bootstrap::authenticate_job(&mut reader, &mut writer, &mut self.correlator, &credentials)
            .await?;
        Ok((reader, writer))
    }

    // ---------------------------------------------------------------------
    // Steady state
    // ---------------------------------------------------------------------

    async fn run_session(&mut self, reader: SessionReader, mut writer: SessionWriter) -> SessionEnd {
        if let Some(stale) = self.dispatcher.reset_session() {
            self.correlator.take_pending(stale);
        }

        // Live controllers re-register under the same ids, ahead of older work
        let resubscribe: Vec<_> = self
            .correlator
            .resubscribe_requests()
            .into_iter()
            .map(|(id, request)| request.into_message(id))
            .collect();
        if !resubscribe.is_empty() {
            debug!("Re-registering {} controllers", resubscribe.len());
            self.dispatcher.enqueue_front(resubscribe);
        }

        let (events_tx, mut events) = mpsc::unbounded_channel();
        let reader_task = spawn_reader(reader, events_tx);

        self.set_state(if self.stopping {
            ConnectionState::Stopping
        } else {
            ConnectionState::Connected
        });

        let interval = self.options.flush_interval.max(Duration::from_millis(1));
        let mut tick = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(ReaderEvent::Frame(bytes)) => self.handle_frame(&bytes),
                    Some(ReaderEvent::Ended(Some(e))) => return SessionEnd::Lost(e.to_string()),
                    Some(ReaderEvent::Ended(None)) | None => {
                        return SessionEnd::Lost("closed by the service".into())
                    }
                },
                command = self.commands.recv(), if self.commands_open => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!("All client handles dropped; closing");
                        self.commands_open = false;
                        self.begin_stopping(None);
                    }
                },
                Some(request) = self.reply_rx.recv() => {
                    let id = self.correlator.next_id();
                    self.dispatcher.enqueue(request.into_message(id));
                },
                _ = tick.tick() => {
                    // Read before draining: a reply sent before its guard drops is then queued.
                    let replies_idle = self.replies.is_idle();
                    while let Ok(request) = self.reply_rx.try_recv() {
                        let id = self.correlator.next_id();
                        self.dispatcher.enqueue(request.into_message(id));
                    }
                    if let Err(e) = self
                        .dispatcher
                        .flush(&mut writer, &mut self.correlator, Pending::PatchBatch)
                        .await
                    {
                        reader_task.abort();
                        return SessionEnd::Lost(e.to_string());
                    }
                    if self.stopping && replies_idle && self.dispatcher.is_drained() {
                        let result = self.close_session(writer, reader_task, events).await;
                        return SessionEnd::Closed(result);
                    }
                },
            }
        }
    }

    fn handle_frame(&mut self, bytes: &[u8]) {
        let inbound = match Inbound::decode(bytes) {
            Ok(Some(inbound)) => inbound,
            Ok(None) => {
                debug!("Ignoring frame without id");
                return;
            }
            Err(e) => {
                warn!("{}", e);
                return;
            }
        };

        match self.correlator.route(inbound, &self.replies) {
            Routed::Resolved(Pending::Call { controller, action, reply }, inbound) => {
                let result = match inbound.response() {
                    Response::Next(value) => Ok(value),
                    Response::Error(message) => Err(ClientError::Action {
                        controller,
                        action,
                        message,
                    }),
                    other => {
                        warn!("Unexpected response to {}.{}: {:?}", controller, action, other);
                        Err(ClientError::Protocol(format!(
                            "unexpected response to {}.{}: {:?}",
                            controller, action, other
                        )))
                    }
                };
                let _ = reply.send(result);
            }
            Routed::Resolved(Pending::PatchBatch(snapshot), inbound) => match inbound.response() {
                Response::Next(_) => self.dispatcher.patch_acknowledged(inbound.id, &snapshot),
                Response::Error(message) => self.dispatcher.patch_failed(inbound.id, &message),
                other => self
                    .dispatcher
                    .patch_failed(inbound.id, &format!("unexpected response {:?}", other)),
            },
            Routed::Delivered { id, disposed: true } => {
                if let Some(name) = self.registry.remove_subscription(id) {
                    debug!("Controller {} removed", name);
                }
            }
            Routed::Delivered { .. } | Routed::Unmatched(_) => {}
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Action {
                controller,
                action,
                args,
                reply,
            } => {
                if self.stopping {
                    let _ = reply.send(Err(ClientError::InShutdown));
                    return;
                }
                let request =
                    Request::action(&controller, &action, args, self.options.action_timeout_secs);
                let id = self.correlator.register_call(Pending::Call {
                    controller,
                    action,
                    reply,
                });
                self.dispatcher.enqueue(request.into_message(id));
            }
            Command::Patch { path, value } => {
                if !self.stopping {
                    self.dispatcher.patch(path, value);
                }
            }
            Command::Register {
                name,
                controller,
                reply,
            } => {
                if self.stopping {
                    let _ = reply.send(Err(ClientError::InShutdown));
                    return;
                }
                if self.registry.contains(&name) {
                    let _ = reply.send(Err(ClientError::Validation {
                        field: "controller".into(),
                        message: format!("{} is already registered", name),
                    }));
                    return;
                }
                let request = Request::register_controller(&name);
                let subscription = ControllerSubscription::new(name.clone(), controller, reply);
                let id = self.correlator.subscribe(Box::new(subscription));
                self.registry.insert(name, id);
                self.dispatcher.enqueue(request.into_message(id));
            }
            Command::Unregister { name } => {
                if let Some(subscription) = self.registry.remove(&name) {
                    self.correlator.unsubscribe(subscription);
                    let id = self.correlator.next_id();
                    self.dispatcher
                        .enqueue(Request::unregister_controller(&name).into_message(id));
                }
            }
            Command::Shutdown { outcome, reply } => {
                self.shutdown_waiters.push(reply);
                self.begin_stopping(Some(outcome));
            }
        }
    }

    fn begin_stopping(&mut self, outcome: Option<JobOutcome>) {
        if self.stopping {
            return;
        }
        self.stopping = true;
        self.set_state(ConnectionState::Stopping);
        if let Some(outcome) = outcome {
            info!("Shutting down ({:?})", outcome);
            for (path, value) in outcome.terminal_patches() {
                self.dispatcher.patch(path, value);
            }
        }
    }

    /// Close the write half and wait until the service has closed its side too.
    async fn close_session(
        &mut self,
        mut writer: SessionWriter,
        reader_task: JoinHandle<()>,
        mut events: mpsc::UnboundedReceiver<ReaderEvent>,
    ) -> Result<()> {
        if let Err(e) = writer.close().await {
            reader_task.abort();
            return Err(ClientError::ShutdownInvariant(e.to_string()));
        }

        let closed = tokio::time::timeout(SessionConfig::CLOSE_TIMEOUT, async {
            while let Some(event) = events.recv().await {
                match event {
                    ReaderEvent::Frame(bytes) => self.handle_frame(&bytes),
                    ReaderEvent::Ended(_) => break,
                }
            }
        })
        .await;

        match closed {
            Ok(()) => Ok(()),
            Err(_) => {
                reader_task.abort();
                Err(ClientError::ShutdownInvariant(format!(
                    "session still open {:?} after close",
                    SessionConfig::CLOSE_TIMEOUT
                )))
            }
        }
    }

    // ---------------------------------------------------------------------
    // Terminal states
    // ---------------------------------------------------------------------

    /// Resolve shutdown waiters and fail whatever can no longer complete.
    fn finish(&mut self, result: Result<()>) {
        match &result {
            Ok(()) => info!("Session closed"),
            Err(e) => error!("Shutdown failed: {}", e),
        }
        for waiter in self.shutdown_waiters.drain(..) {
            let _ = waiter.send(result.clone());
        }
    }

    fn reject_outstanding(&mut self, error: &ClientError) {
        for pending in self.correlator.drain_pending() {
            if let Pending::Call { reply, .. } = pending {
                let _ = reply.send(Err(error.clone()));
            }
        }
        self.correlator.close_subscriptions();
    }

    /// Permanently offline: every operation is a silent no-op.
    async fn run_offline(mut self, reason: String) {
        warn!("Service not reachable ({}). Monitoring disabled.", reason);
        self.set_state(ConnectionState::Offline);

        while let Some(command) = self.commands.recv().await {
            match command {
                Command::Action { reply, .. } => {
                    let _ = reply.send(Ok(None));
                }
                Command::Register { reply, .. } | Command::Shutdown { reply, .. } => {
                    let _ = reply.send(Ok(()));
                }
                Command::Patch { .. } | Command::Unregister { .. } => {}
            }
        }
    }

    /// Closed, either after shutdown or because of a fatal error.
    async fn run_terminal(mut self, fatal: Option<ClientError>) {
        let error = fatal.clone().unwrap_or(ClientError::ConnectionLost("client closed".into()));
        self.reject_outstanding(&error);
        self.set_state(ConnectionState::Closed);

        let refusal = fatal.unwrap_or(ClientError::Closed);
        for waiter in self.shutdown_waiters.drain(..) {
            let _ = waiter.send(Err(refusal.clone()));
        }

        while let Some(command) = self.commands.recv().await {
            match command {
                Command::Action { reply, .. } => {
                    let _ = reply.send(Err(refusal.clone()));
                }
                Command::Register { reply, .. } => {
                    let _ = reply.send(Err(refusal.clone()));
                }
                Command::Shutdown { reply, .. } => {
                    let result = match &refusal {
                        ClientError::Closed => Ok(()),
                        other => Err(other.clone()),
                    };
                    let _ = reply.send(result);
                }
                Command::Patch { .. } | Command::Unregister { .. } => {}
            }
        }
    }
}

enum Establish {
    Offline(String),
    Fatal(ClientError),
}

fn spawn_reader(
    mut reader: SessionReader,
    events: mpsc::UnboundedSender<ReaderEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match reader.receive().await {
                Ok(Some(frame)) => {
                    if events.send(ReaderEvent::Frame(frame)).is_err() {
                        return;
                    }
                }
                Ok(None) => {
                    let _ = events.send(ReaderEvent::Ended(None));
                    return;
                }
                Err(e) => {
                    let _ = events.send(ReaderEvent::Ended(Some(e)));
                    return;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(JobOutcome::Done.job_status(), 150);
        assert_eq!(JobOutcome::Aborted.job_status(), 200);
        assert_eq!(JobOutcome::Failed.job_status(), 250);
        assert_eq!(JobOutcome::Crashed.job_status(), 300);
        assert_eq!(JobOutcome::Done.task_status(), 500);
        assert_eq!(JobOutcome::Aborted.task_status(), 550);
        assert_eq!(JobOutcome::Failed.task_status(), 600);
        assert_eq!(JobOutcome::Crashed.task_status(), 650);
    }

    #[test]
    fn test_terminal_patches_cover_job_task_and_instance() {
        let patches: std::collections::HashMap<_, _> =
            JobOutcome::Aborted.terminal_patches().into_iter().collect();
        assert_eq!(patches.len(), 6);
        assert_eq!(patches["status"], 200);
        assert_eq!(patches["tasks.main.status"], 550);
        assert_eq!(patches["tasks.main.instances.0.status"], 550);
        let ended = patches["ended"].as_str().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(ended).is_ok());
    }

    #[test]
    fn test_settled_states() {
        assert!(ConnectionState::Connected.is_settled());
        assert!(ConnectionState::Offline.is_settled());
        assert!(!ConnectionState::Reconnecting.is_settled());
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Stopping.is_connected());
    }
}
