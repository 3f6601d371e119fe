//! Public client handle.
//!
//! [`Client::connect`] starts the worker on its own thread with a
//! single-threaded runtime and returns a cheap, cloneable handle. Every
//! operation is marshaled onto that worker; the async methods work from any
//! executor, and the `_blocking` variants serve plain threads.

use crate::bootstrap::LoadedJob;
use crate::config::ClientOptions;
use crate::error::{ClientError, Result};
use crate::registry::Controller;
use crate::supervisor::{Command, ConnectionState, JobOutcome, Worker};
use serde_json::Value;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info};

/// Handle to a running client worker.
#[derive(Clone)]
pub struct Client {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    job: watch::Receiver<Option<LoadedJob>>,
    runtime: Handle,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Start the worker and begin connecting in the background.
    ///
    /// Returns as soon as the worker thread is running; use
    /// [`Client::wait_for_connect`] to wait for the first session.
    pub fn connect(options: ClientOptions) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .thread_name("jobwire-worker")
            .build()?;
        let handle = runtime.handle().clone();

        info!("Connecting to {}", options.identity.endpoint());
        let (worker, handles) = Worker::new(options);

        std::thread::Builder::new()
            .name("jobwire-worker".into())
            .spawn(move || {
                runtime.block_on(worker.run());
                debug!("Worker stopped");
            })?;

        Ok(Self {
            commands: handles.commands,
            state: handles.state,
            job: handles.job,
            runtime: handle,
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// A receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Wait until the client is connected, offline or closed.
    ///
    /// Returns whether it ended up connected.
    pub async fn wait_for_connect(&self) -> bool {
        let mut state = self.state.clone();
        let connected = match state.wait_for(|s| s.is_settled()).await {
            Ok(s) => s.is_connected(),
            Err(_) => false,
        };
        connected
    }

    /// The job this client runs as, once known.
    pub fn job(&self) -> Option<LoadedJob> {
        self.job.borrow().clone()
    }

    /// Runtime the worker runs on; helpers spawn their timers here.
    pub(crate) fn runtime(&self) -> &Handle {
        &self.runtime
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| ClientError::Closed)
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<Result<T>>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx))?;
        rx.await.map_err(|_| ClientError::Closed)?
    }

    /// Call `controller.action(args)` on the service and return its value.
    ///
    /// Waits for authentication first. Offline clients return `Ok(None)`
    /// without touching the network.
    pub async fn action(
        &self,
        controller: &str,
        action: &str,
        args: Vec<Value>,
    ) -> Result<Option<Value>> {
        self.request(|reply| Command::Action {
            controller: controller.to_string(),
            action: action.to_string(),
            args,
            reply,
        })
        .await
    }

    /// Call an action of the `job` controller.
    pub async fn job_action(&self, action: &str, args: Vec<Value>) -> Result<Option<Value>> {
        self.action("job", action, args).await
    }

    /// Queue a `job` action without waiting for its response.
    ///
    /// The message takes its place in the outbound queue before this returns,
    /// so anything sent afterwards is transmitted after it.
    pub(crate) fn job_action_detached(&self, action: &str, args: Vec<Value>) {
        let (reply, rx) = oneshot::channel();
        let sent = self.send(Command::Action {
            controller: "job".to_string(),
            action: action.to_string(),
            args,
            reply,
        });
        if sent.is_err() {
            return;
        }
        let action = action.to_string();
        self.runtime.spawn(async move {
            if let Ok(Err(e)) = rx.await {
                debug!("job.{} failed: {}", action, e);
            }
        });
    }

    /// Record the latest value for a dotted job state path.
    ///
    /// Ignored once the client is offline or stopping.
    pub fn patch(&self, path: impl Into<String>, value: impl Into<Value>) {
        let _ = self.send(Command::Patch {
            path: path.into(),
            value: value.into(),
        });
    }

    /// Expose `controller` to the service under `name`.
    ///
    /// Resolves once the service acknowledged the registration; a rejection
    /// (for example a name collision) is returned as an error.
    pub async fn register_controller(
        &self,
        name: &str,
        controller: impl Controller,
    ) -> Result<ControllerHandle> {
        let controller: Arc<dyn Controller> = Arc::new(controller);
        self.request(|reply| Command::Register {
            name: name.to_string(),
            controller,
            reply,
        })
        .await?;
        Ok(ControllerHandle {
            name: name.to_string(),
            commands: self.commands.clone(),
        })
    }

    /// Write terminal status, wait until everything queued is delivered and close.
    pub async fn shutdown(&self, outcome: JobOutcome) -> Result<()> {
        self.request(|reply| Command::Shutdown { outcome, reply })
            .await
    }

    /// Blocking form of [`Client::action`]. Do not call from async code.
    pub fn action_blocking(
        &self,
        controller: &str,
        action: &str,
        args: Vec<Value>,
    ) -> Result<Option<Value>> {
        futures::executor::block_on(self.action(controller, action, args))
    }

    /// Blocking form of [`Client::register_controller`].
    pub fn register_controller_blocking(
        &self,
        name: &str,
        controller: impl Controller,
    ) -> Result<ControllerHandle> {
        futures::executor::block_on(self.register_controller(name, controller))
    }

    /// Blocking form of [`Client::shutdown`].
    pub fn shutdown_blocking(&self, outcome: JobOutcome) -> Result<()> {
        futures::executor::block_on(self.shutdown(outcome))
    }

    /// Blocking form of [`Client::wait_for_connect`].
    pub fn wait_for_connect_blocking(&self) -> bool {
        futures::executor::block_on(self.wait_for_connect())
    }
}

/// A registered controller.
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    name: String,
    commands: mpsc::UnboundedSender<Command>,
}

impl ControllerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tell the service to stop routing to this controller. Best effort.
    pub fn stop(&self) {
        let _ = self.commands.send(Command::Unregister {
            name: self.name.clone(),
        });
    }
}
