//! Scripted fake tracking service for integration tests.
//!
//! Listens on `127.0.0.1:0`, speaks the same length-prefixed JSON framing as
//! the client and answers the handful of requests the client sends. Every
//! frame it receives is recorded so tests can assert on wire order.

#![allow(dead_code)]

use jobwire::transport::{read_frame, write_frame};
use jobwire::{BackoffConfig, ClientOptions, Endpoint, JobCredentials};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

pub const JOB_ID: &str = "J1";
pub const JOB_TOKEN: &str = "T";
pub const USER_TOKEN: &str = "user-token";

/// Upper bound for every wait in the integration tests.
pub const WAIT: Duration = Duration::from_secs(10);

/// A frame received by the service, tagged with the connection it arrived on.
#[derive(Debug, Clone)]
pub struct Received {
    pub connection: usize,
    pub body: Value,
}

impl Received {
    pub fn name(&self) -> &str {
        self.body["name"].as_str().unwrap_or_default()
    }

    pub fn action(&self) -> &str {
        self.body["action"].as_str().unwrap_or_default()
    }

    pub fn is_action(&self, controller: &str, action: &str) -> bool {
        self.name() == "action"
            && self.body["controller"] == controller
            && self.body["action"] == action
    }
}

enum Control {
    Push(Value),
    Drop,
}

#[derive(Default)]
struct ServiceState {
    received: Vec<Received>,
    connections: usize,
    current: Option<mpsc::UnboundedSender<Control>>,
    /// Subscription id of each registered controller.
    controllers: HashMap<String, u64>,
    taken_controllers: HashSet<String>,
    reject_patches: bool,
    reject_logins: bool,
    /// Actions whose next request goes unanswered.
    held: HashSet<String>,
    /// Actions whose next request closes the connection instead of a reply.
    drop_on: HashSet<String>,
}

/// Handle to a running fake service. Dropping it stops accepting connections.
pub struct FakeService {
    pub port: u16,
    state: Arc<Mutex<ServiceState>>,
    accept_task: tokio::task::JoinHandle<()>,
}

impl Drop for FakeService {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

impl FakeService {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Self::serve(listener)
    }

    /// Serve on an already bound listener, e.g. one reserved for a later start.
    pub fn serve(listener: TcpListener) -> Self {
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(Mutex::new(ServiceState::default()));

        let accept_state = state.clone();
        let accept_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let (tx, rx) = mpsc::unbounded_channel();
                let connection = {
                    let mut state = accept_state.lock().unwrap();
                    state.connections += 1;
                    state.current = Some(tx);
                    state.connections
                };
                tokio::spawn(handle_connection(stream, connection, accept_state.clone(), rx));
            }
        });

        Self {
            port,
            state,
            accept_task,
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new("127.0.0.1", self.port)
    }

    /// Job-mode options with fast timers.
    pub fn job_options(&self) -> ClientOptions {
        fast(ClientOptions::job(
            self.endpoint(),
            JobCredentials::new(JOB_ID, JOB_TOKEN),
        ))
    }

    pub fn reject_patches(&self) {
        self.state.lock().unwrap().reject_patches = true;
    }

    pub fn reject_logins(&self) {
        self.state.lock().unwrap().reject_logins = true;
    }

    /// Leave the next `action` request unanswered.
    pub fn hold_reply_once(&self, action: &str) {
        self.state.lock().unwrap().held.insert(action.to_string());
    }

    /// Close the connection when the next `action` request arrives.
    pub fn drop_on_once(&self, action: &str) {
        self.state.lock().unwrap().drop_on.insert(action.to_string());
    }

    /// Make registrations under `name` fail as a collision.
    pub fn take_controller_name(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .taken_controllers
            .insert(name.to_string());
    }

    pub fn connections(&self) -> usize {
        self.state.lock().unwrap().connections
    }

    pub fn received(&self) -> Vec<Received> {
        self.state.lock().unwrap().received.clone()
    }

    /// Abruptly close the current connection.
    pub fn drop_connection(&self) {
        if let Some(current) = self.state.lock().unwrap().current.take() {
            let _ = current.send(Control::Drop);
        }
    }

    /// Deliver a peer request to a registered controller.
    pub fn send_peer_request(&self, controller: &str, data: Value) {
        let state = self.state.lock().unwrap();
        let id = state.controllers[controller];
        let frame = json!({
            "id": id,
            "type": "peerController/message",
            "clientId": "remote-1",
            "data": data,
        });
        if let Some(current) = &state.current {
            let _ = current.send(Control::Push(frame));
        }
    }

    /// Wait until the client has opened at least `count` connections.
    pub async fn wait_for_connections(&self, count: usize) {
        tokio::time::timeout(WAIT, async {
            while self.connections() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("client did not reconnect in time")
    }

    /// Wait until the received frames satisfy `predicate`.
    pub async fn wait_until<F>(&self, predicate: F) -> Vec<Received>
    where
        F: Fn(&[Received]) -> bool,
    {
        tokio::time::timeout(WAIT, async {
            loop {
                let received = self.received();
                if predicate(&received) {
                    return received;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("service did not observe the expected frames in time")
    }
}

/// Shrink timers so tests run quickly.
pub fn fast(options: ClientOptions) -> ClientOptions {
    options
        .with_flush_interval(Duration::from_millis(20))
        .with_backoff(
            BackoffConfig::new()
                .with_base_delay(Duration::from_millis(50))
                .with_max_delay(Duration::from_millis(200))
                .with_jitter(false),
        )
}

/// A port nothing listens on.
pub async fn unused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn handle_connection(
    stream: TcpStream,
    connection: usize,
    state: Arc<Mutex<ServiceState>>,
    mut control: mpsc::UnboundedReceiver<Control>,
) {
    let (mut reader, mut writer) = stream.into_split();

    // Frames are read on their own task so a pushed frame never interrupts a read
    let (frames_tx, mut frames) = mpsc::unbounded_channel();
    let read_task = tokio::spawn(async move {
        while let Ok(Some(frame)) = read_frame(&mut reader).await {
            if frames_tx.send(frame).is_err() {
                return;
            }
        }
    });

    loop {
        tokio::select! {
            frame = frames.recv() => {
                let Some(frame) = frame else {
                    // The client closed; close our side too
                    return;
                };
                let body: Value = serde_json::from_slice(&frame).unwrap();
                let reply = {
                    let mut state = state.lock().unwrap();
                    let received = Received { connection, body: body.clone() };
                    let action = received.action().to_string();
                    state.received.push(received);
                    if state.drop_on.remove(&action) {
                        read_task.abort();
                        return;
                    }
                    if state.held.remove(&action) {
                        None
                    } else {
                        answer(&mut state, &body)
                    }
                };
                if let Some(mut reply) = reply {
                    reply["id"] = body["id"].clone();
                    let bytes = serde_json::to_vec(&reply).unwrap();
                    if write_frame(&mut writer, &bytes).await.is_err() {
                        return;
                    }
                }
            }
            command = control.recv() => match command {
                Some(Control::Push(frame)) => {
                    let bytes = serde_json::to_vec(&frame).unwrap();
                    if write_frame(&mut writer, &bytes).await.is_err() {
                        return;
                    }
                }
                Some(Control::Drop) | None => {
                    read_task.abort();
                    return;
                }
            },
        }
    }
}

fn next(value: Value) -> Option<Value> {
    Some(json!({ "type": "next/json", "next": value }))
}

fn error(message: &str) -> Option<Value> {
    Some(json!({ "type": "error", "error": message }))
}

fn answer(state: &mut ServiceState, body: &Value) -> Option<Value> {
    match body["name"].as_str().unwrap_or_default() {
        "authenticate" => {
            let token = &body["token"];
            let ok = !state.reject_logins
                && match token["id"].as_str() {
                    Some("job") => token["token"] == JOB_TOKEN && token["job"] == JOB_ID,
                    Some("user") => token["token"] == USER_TOKEN,
                    _ => false,
                };
            Some(json!({ "result": ok }))
        }
        "action" => {
            let controller = body["controller"].as_str().unwrap_or_default();
            let action = body["action"].as_str().unwrap_or_default();
            match (controller, action) {
                ("job", "ping") => next(json!("pong")),
                ("job", "fail") => error("boom"),
                ("job", "patchJob") if state.reject_patches => error("patching not allowed"),
                ("app", "getProjectForPublicName") => {
                    if body["args"][0] == "mnist" {
                        next(json!({ "id": "p1", "name": "mnist" }))
                    } else {
                        next(Value::Null)
                    }
                }
                ("app", "createJob") => next(json!({ "id": JOB_ID, "number": 1 })),
                ("app", "getJobAccessToken") => next(json!(JOB_TOKEN)),
                _ => next(Value::Null),
            }
        }
        "peerController/register" => {
            let name = body["controllerName"].as_str().unwrap_or_default().to_string();
            if state.taken_controllers.contains(&name) {
                return error(&format!("Controller with name {} already registered", name));
            }
            let id = body["id"].as_u64().unwrap_or_default();
            state.controllers.insert(name, id);
            Some(json!({ "type": "ack" }))
        }
        "peerController/unregister" => {
            let name = body["controllerName"].as_str().unwrap_or_default();
            state.controllers.remove(name);
            None
        }
        _ => None,
    }
}
