//! Peer controllers: local objects the tracking service can call into.
//!
//! A controller publishes a fixed list of actions with their arity and answers
//! `invoke` by name. The registry side never knows what the controller is;
//! it only routes peer messages and turns every outcome, including a panic,
//! into exactly one reply.

use crate::correlator::{Disposition, InFlight, ReplySender, SubscriptionHandler};
use crate::error::{ClientError, Result};
use crate::message::{peer_reply, Inbound, PeerRequest, PeerRequestKind, Request, Response};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// One callable action of a controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionDescriptor {
    pub name: String,
    /// Number of positional parameters, each typed as "any".
    pub arity: usize,
}

impl ActionDescriptor {
    pub fn new(name: impl Into<String>, arity: usize) -> Self {
        Self {
            name: name.into(),
            arity,
        }
    }
}

/// Failure reported by a controller action; travels back as an error payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ActionFailure(pub String);

impl From<String> for ActionFailure {
    fn from(message: String) -> Self {
        ActionFailure(message)
    }
}

impl From<&str> for ActionFailure {
    fn from(message: &str) -> Self {
        ActionFailure(message.to_string())
    }
}

impl From<ClientError> for ActionFailure {
    fn from(err: ClientError) -> Self {
        ActionFailure(err.to_string())
    }
}

/// A local object the remote side can call.
#[async_trait]
pub trait Controller: Send + Sync + 'static {
    /// The callable surface. Only listed actions can be described or invoked.
    fn actions(&self) -> Vec<ActionDescriptor>;

    /// Run `action` with positional `args`.
    async fn invoke(&self, action: &str, args: Vec<Value>)
        -> std::result::Result<Value, ActionFailure>;
}

type ActionFn = Arc<
    dyn Fn(Vec<Value>) -> BoxFuture<'static, std::result::Result<Value, ActionFailure>>
        + Send
        + Sync,
>;

/// A controller assembled from closures.
///
/// ```rust,ignore
/// let table = ActionTable::new()
///     .action("ping", 0, |_| Ok(json!("pong")))
///     .action("add", 2, |args| Ok(json!(args[0].as_i64().unwrap_or(0) + args[1].as_i64().unwrap_or(0))));
/// ```
#[derive(Default, Clone)]
pub struct ActionTable {
    actions: BTreeMap<String, (usize, ActionFn)>,
}

impl ActionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a synchronous action.
    pub fn action<F>(self, name: impl Into<String>, arity: usize, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> std::result::Result<Value, ActionFailure> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.async_action(name, arity, move |args| {
            let f = f.clone();
            async move { f(args) }
        })
    }

    /// Add an asynchronous action.
    pub fn async_action<F, Fut>(mut self, name: impl Into<String>, arity: usize, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, ActionFailure>> + Send + 'static,
    {
        let f: ActionFn = Arc::new(move |args| f(args).boxed());
        self.actions.insert(name.into(), (arity, f));
        self
    }
}

#[async_trait]
impl Controller for ActionTable {
    fn actions(&self) -> Vec<ActionDescriptor> {
        self.actions
            .iter()
            .map(|(name, (arity, _))| ActionDescriptor::new(name.clone(), *arity))
            .collect()
    }

    async fn invoke(
        &self,
        action: &str,
        args: Vec<Value>,
    ) -> std::result::Result<Value, ActionFailure> {
        match self.actions.get(action) {
            Some((_, f)) => f(args).await,
            None => Err(ActionFailure(format!("unknown action {}", action))),
        }
    }
}

/// Names of controllers registered by this client, keyed to their subscription id.
#[derive(Debug, Default)]
pub struct ControllerRegistry {
    by_name: HashMap<String, u64>,
}

impl ControllerRegistry {
    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, subscription: u64) {
        self.by_name.insert(name.into(), subscription);
    }

    pub fn remove(&mut self, name: &str) -> Option<u64> {
        self.by_name.remove(name)
    }

    /// Forget whichever controller owns `subscription`.
    pub fn remove_subscription(&mut self, subscription: u64) -> Option<String> {
        let name = self
            .by_name
            .iter()
            .find(|(_, id)| **id == subscription)
            .map(|(name, _)| name.clone())?;
        self.by_name.remove(&name);
        Some(name)
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

/// One peer request waiting for its controller.
struct PeerCall {
    client_id: Value,
    work: PeerWork,
    _in_flight: InFlight,
}

enum PeerWork {
    Request(PeerRequest),
    /// `data` did not parse; answered with an error under the id it carried.
    Malformed { id: Value, error: String },
}

/// Subscription backing one registered controller.
///
/// Peer requests are answered by a single task per controller, strictly in
/// arrival order and one at a time.
pub struct ControllerSubscription {
    name: String,
    controller: Arc<dyn Controller>,
    /// Whoever awaits the registration; answered on the first ack or error.
    registration: Option<oneshot::Sender<Result<()>>>,
    peer_calls: Option<mpsc::UnboundedSender<PeerCall>>,
}

impl ControllerSubscription {
    pub fn new(
        name: impl Into<String>,
        controller: Arc<dyn Controller>,
        registration: oneshot::Sender<Result<()>>,
    ) -> Self {
        Self {
            name: name.into(),
            controller,
            registration: Some(registration),
            peer_calls: None,
        }
    }

    fn enqueue(&mut self, client_id: Value, work: PeerWork, replies: &ReplySender) {
        let call = PeerCall {
            client_id,
            work,
            _in_flight: replies.track(),
        };
        let queue = self.peer_calls.get_or_insert_with(|| {
            spawn_peer_queue(self.name.clone(), self.controller.clone(), replies.clone())
        });
        if queue.send(call).is_err() {
            debug!("Dropping peer request for controller {}: queue closed", self.name);
        }
    }
}

fn spawn_peer_queue(
    name: String,
    controller: Arc<dyn Controller>,
    replies: ReplySender,
) -> mpsc::UnboundedSender<PeerCall> {
    let (tx, mut rx) = mpsc::unbounded_channel::<PeerCall>();
    tokio::spawn(async move {
        while let Some(call) = rx.recv().await {
            let data = answer(&name, controller.as_ref(), call.work).await;
            if !replies.send(Request::peer_reply(&name, &call.client_id, data)) {
                debug!("Dropping reply for controller {}: client closed", name);
            }
        }
    });
    tx
}

/// Produce the reply payload for one peer request.
async fn answer(name: &str, controller: &dyn Controller, work: PeerWork) -> Value {
    let request = match work {
        PeerWork::Request(request) => request,
        PeerWork::Malformed { id, error } => {
            let error = format!("Malformed peer message for controller {}: {}", name, error);
            warn!("{}", error);
            return peer_reply::error(&id, &error);
        }
    };

    let kind = request.kind();
    if let PeerRequestKind::Other(other) = &kind {
        let error = format!("Unsupported peer message {} for controller {}", other, name);
        warn!("{}", error);
        return peer_reply::error(&request.id, &error);
    }

    let Some(descriptor) = controller
        .actions()
        .into_iter()
        .find(|d| d.name == request.action)
    else {
        let error = format!(
            "Requested action {} not available in {}",
            request.action, name
        );
        warn!("{}", error);
        return peer_reply::error(&request.id, &error);
    };

    if kind == PeerRequestKind::DescribeActions {
        return peer_reply::action_types(&request.id, descriptor.arity);
    }

    let outcome = AssertUnwindSafe(controller.invoke(&request.action, request.args))
        .catch_unwind()
        .await;
    match outcome {
        Ok(Ok(value)) => peer_reply::next(&request.id, value),
        Ok(Err(failure)) => {
            debug!("{}.{} failed: {}", name, request.action, failure);
            peer_reply::error(&request.id, &failure.0)
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            warn!("{}.{} panicked: {}", name, request.action, message);
            peer_reply::error(&request.id, &message)
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "action panicked".to_string()
    }
}

impl SubscriptionHandler for ControllerSubscription {
    fn on_message(&mut self, message: Inbound, replies: &ReplySender) -> Disposition {
        match message.response() {
            Response::Ack => {
                if let Some(registration) = self.registration.take() {
                    let _ = registration.send(Ok(()));
                }
                debug!("Controller {} registered", self.name);
                Disposition::Keep
            }
            Response::Error(error) => {
                warn!("Register controller {} error: {}", self.name, error);
                if let Some(registration) = self.registration.take() {
                    let _ = registration.send(Err(ClientError::Action {
                        controller: self.name.clone(),
                        action: "register".to_string(),
                        message: error,
                    }));
                }
                Disposition::Dispose
            }
            Response::PeerMessage { client_id, data } => {
                let id = data.get("id").cloned();
                match PeerRequest::parse(data) {
                    Ok(request) => self.enqueue(client_id, PeerWork::Request(request), replies),
                    Err(e) => match id {
                        Some(id) if !id.is_null() => {
                            let work = PeerWork::Malformed {
                                id,
                                error: e.to_string(),
                            };
                            self.enqueue(client_id, work, replies);
                        }
                        _ => warn!("Controller {}: {}", self.name, e),
                    },
                }
                Disposition::Keep
            }
            other => {
                debug!("Controller {} ignoring {:?}", self.name, other);
                Disposition::Keep
            }
        }
    }

    fn resubscribe_request(&self) -> Option<Request> {
        Some(Request::register_controller(&self.name))
    }

    fn on_close(&mut self) {
        if let Some(registration) = self.registration.take() {
            let _ = registration.send(Err(ClientError::ConnectionLost(
                "client closed before the registration was acknowledged".into(),
            )));
        }
    }
}
