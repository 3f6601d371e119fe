//! Integration tests for connecting, calling and patching against a live
//! (fake) tracking service.

mod common;

use common::{fast, unused_port, FakeService, JOB_ID, JOB_TOKEN, USER_TOKEN, WAIT};
use jobwire::{
    AccountConfig, Client, ClientError, ClientOptions, ConnectionState, JobContext, JobOutcome,
    ProjectSelector,
};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::timeout;

fn account(port: u16) -> AccountConfig {
    AccountConfig {
        id: "a1".into(),
        name: "local".into(),
        host: "127.0.0.1".into(),
        port,
        token: USER_TOKEN.into(),
    }
}

async fn connected(options: ClientOptions) -> Client {
    let client = Client::connect(options).expect("worker starts");
    assert!(timeout(WAIT, client.wait_for_connect()).await.unwrap());
    client
}

async fn wait_for_state(client: &Client, wanted: ConnectionState) {
    let mut state = client.watch_state();
    timeout(WAIT, state.wait_for(|s| *s == wanted))
        .await
        .expect("state reached in time")
        .expect("worker alive");
}

#[tokio::test]
async fn test_job_mode_connects_and_calls_action() {
    let service = FakeService::start().await;
    let client = connected(service.job_options()).await;

    assert_eq!(client.state(), ConnectionState::Connected);
    assert!(client.is_connected());
    assert_eq!(client.job().unwrap().id, JOB_ID);

    let pong = timeout(WAIT, client.action("job", "ping", vec![]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pong, Some(json!("pong")));

    let received = service.received();
    assert_eq!(received[0].name(), "authenticate");
    assert_eq!(
        received[0].body["token"],
        json!({"id": "job", "token": JOB_TOKEN, "job": JOB_ID})
    );
    // Ids are strictly increasing on the wire
    let ids: Vec<u64> = received.iter().filter_map(|r| r.body["id"].as_u64()).collect();
    assert!(ids.windows(2).all(|w| w[0] < w[1]));

    timeout(WAIT, client.shutdown(JobOutcome::Done))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(client.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_action_error_carries_remote_message() {
    let service = FakeService::start().await;
    let client = connected(service.job_options()).await;

    let err = timeout(WAIT, client.job_action("fail", vec![]))
        .await
        .unwrap()
        .unwrap_err();
    match err {
        ClientError::Action {
            controller,
            action,
            message,
        } => {
            assert_eq!(controller, "job");
            assert_eq!(action, "fail");
            assert_eq!(message, "boom");
        }
        other => panic!("expected action error, got {:?}", other),
    }

    // The session survives a remote error
    let pong = timeout(WAIT, client.job_action("ping", vec![])).await.unwrap();
    assert_eq!(pong.unwrap(), Some(json!("pong")));
}

#[tokio::test]
async fn test_queued_message_precedes_patch_batch() {
    let service = FakeService::start().await;
    let client = connected(service.job_options()).await;
    let context = JobContext::new(client.clone());

    context.log("created\n");
    context.flush();
    client.patch("step", 1);

    let received = service
        .wait_until(|frames| frames.iter().any(|f| f.is_action("job", "patchJob")))
        .await;
    let log = received
        .iter()
        .position(|f| f.is_action("job", "log"))
        .expect("log sent");
    let patch = received
        .iter()
        .position(|f| f.is_action("job", "patchJob"))
        .expect("patch sent");
    assert!(log < patch);
    assert_eq!(received[log].body["args"], json!(["main_0", "created\n"]));
    assert_eq!(received[patch].body["args"], json!([{"step": 1}]));
}

#[tokio::test]
async fn test_last_write_wins_within_one_batch() {
    let service = FakeService::start().await;
    let options = service
        .job_options()
        .with_flush_interval(Duration::from_millis(300));
    let client = connected(options).await;

    client.patch("iteration", 1);
    client.patch("iteration", 2);
    client.patch("title", "run");

    let received = service
        .wait_until(|frames| frames.iter().any(|f| f.is_action("job", "patchJob")))
        .await;
    let batch = received
        .iter()
        .find(|f| f.is_action("job", "patchJob"))
        .unwrap();
    assert_eq!(batch.body["args"], json!([{"iteration": 2, "title": "run"}]));

    // Acknowledged paths are not sent again
    client.patch("step", 3);
    let received = service
        .wait_until(|frames| {
            frames
                .iter()
                .filter(|f| f.is_action("job", "patchJob"))
                .count()
                == 2
        })
        .await;
    let second = received
        .iter()
        .filter(|f| f.is_action("job", "patchJob"))
        .nth(1)
        .unwrap();
    assert_eq!(second.body["args"], json!([{"step": 3}]));
}

#[tokio::test]
async fn test_rejected_patch_disables_patching_only() {
    let service = FakeService::start().await;
    service.reject_patches();
    let client = connected(service.job_options()).await;

    client.patch("step", 1);
    service
        .wait_until(|frames| frames.iter().any(|f| f.is_action("job", "patchJob")))
        .await;

    client.patch("step", 2);
    let pong = timeout(WAIT, client.job_action("ping", vec![])).await.unwrap();
    assert_eq!(pong.unwrap(), Some(json!("pong")));

    tokio::time::sleep(Duration::from_millis(150)).await;
    let batches = service
        .received()
        .iter()
        .filter(|f| f.is_action("job", "patchJob"))
        .count();
    assert_eq!(batches, 1);

    // A disabled patch buffer does not hold shutdown up
    timeout(WAIT, client.shutdown(JobOutcome::Done))
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_reconnects_and_reauthenticates_after_drop() {
    let service = FakeService::start().await;
    let client = connected(service.job_options()).await;

    service.drop_connection();
    service.wait_for_connections(2).await;

    // Issued while reconnecting; delivered on the new session
    let pong = timeout(WAIT, client.job_action("ping", vec![]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pong, Some(json!("pong")));
    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(service.connections(), 2);

    let second: Vec<_> = service
        .received()
        .into_iter()
        .filter(|f| f.connection == 2)
        .collect();
    assert_eq!(second[0].name(), "authenticate");
    assert_eq!(second[0].body["token"]["token"], JOB_TOKEN);
    assert_eq!(second[0].body["token"]["job"], JOB_ID);
    assert!(second.iter().any(|f| f.is_action("job", "ping")));
}

#[tokio::test]
async fn test_queued_message_resent_on_new_session() {
    let service = FakeService::start().await;
    let options = service
        .job_options()
        .with_flush_interval(Duration::from_millis(1000));
    let client = connected(options).await;

    // Queued but not yet flushed when the connection dies
    let caller = client.clone();
    let ping = tokio::spawn(async move { caller.job_action("ping", vec![]).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    service.drop_connection();

    let pong = timeout(WAIT, ping).await.unwrap().unwrap().unwrap();
    assert_eq!(pong, Some(json!("pong")));

    let pings: Vec<_> = service
        .received()
        .into_iter()
        .filter(|f| f.is_action("job", "ping"))
        .collect();
    assert_eq!(pings.len(), 1);
    assert_eq!(pings[0].connection, 2);
}

#[tokio::test]
async fn test_in_flight_patch_resent_and_pending_call_kept_across_reconnect() {
    let service = FakeService::start().await;
    service.hold_reply_once("patchJob");
    service.hold_reply_once("slow");
    let client = connected(service.job_options()).await;

    client.patch("step", 1);
    let caller = client.clone();
    let slow = tokio::spawn(async move { caller.job_action("slow", vec![]).await });
    service
        .wait_until(|frames| {
            frames.iter().any(|f| f.is_action("job", "patchJob"))
                && frames.iter().any(|f| f.is_action("job", "slow"))
        })
        .await;

    service.drop_connection();
    let received = service
        .wait_until(|frames| {
            frames
                .iter()
                .any(|f| f.connection == 2 && f.is_action("job", "patchJob"))
        })
        .await;
    let resent = received
        .iter()
        .find(|f| f.connection == 2 && f.is_action("job", "patchJob"))
        .unwrap();
    assert_eq!(resent.body["args"], json!([{"step": 1}]));
    assert!(!received
        .iter()
        .any(|f| f.connection == 2 && f.is_action("job", "slow")));
    assert!(!slow.is_finished());

    timeout(WAIT, client.shutdown(JobOutcome::Done))
        .await
        .unwrap()
        .unwrap();
    let result = timeout(WAIT, slow).await.unwrap().unwrap();
    assert!(matches!(result, Err(ClientError::ConnectionLost(_))));
}

#[tokio::test]
async fn test_job_mode_retries_until_service_appears() {
    let port = unused_port().await;
    let options = fast(ClientOptions::job(
        jobwire::Endpoint::new("127.0.0.1", port),
        jobwire::JobCredentials::new(JOB_ID, JOB_TOKEN),
    ));
    let client = Client::connect(options).unwrap();

    wait_for_state(&client, ConnectionState::Reconnecting).await;

    let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    let service = FakeService::serve(listener);

    assert!(timeout(WAIT, client.wait_for_connect()).await.unwrap());
    assert_eq!(service.received()[0].name(), "authenticate");
}

#[tokio::test]
async fn test_user_mode_creates_job_and_hands_off() {
    let service = FakeService::start().await;
    let options = fast(ClientOptions::user(
        account(service.port),
        ProjectSelector::Named("mnist".into()),
    ));
    let client = connected(options).await;

    let job = client.job().expect("job resolved");
    assert_eq!(job.id, JOB_ID);
    assert_eq!(job.document["number"], 1);

    let received = service.received();
    let first: Vec<_> = received.iter().filter(|f| f.connection == 1).collect();
    assert_eq!(first[0].body["token"], json!({"id": "user", "token": USER_TOKEN}));
    assert!(first[1].is_action("app", "getProjectForPublicName"));
    assert_eq!(first[1].body["args"], json!(["mnist"]));
    assert!(first[2].is_action("app", "createJob"));
    assert_eq!(first[2].body["args"], json!(["p1"]));
    assert!(first[3].is_action("app", "getJobAccessToken"));
    assert_eq!(first[3].body["args"], json!([JOB_ID]));

    let second: Vec<_> = received.iter().filter(|f| f.connection == 2).collect();
    assert_eq!(
        second[0].body["token"],
        json!({"id": "job", "token": JOB_TOKEN, "job": JOB_ID})
    );
}

#[tokio::test]
async fn test_user_mode_reconnect_does_not_resolve_again() {
    let service = FakeService::start().await;
    let options = fast(ClientOptions::user(
        account(service.port),
        ProjectSelector::Linked {
            project_id: "p1".into(),
        },
    ));
    let client = connected(options).await;

    service.drop_connection();
    service.wait_for_connections(3).await;
    assert!(timeout(WAIT, client.wait_for_connect()).await.unwrap());

    let received = service.received();
    let creates = received
        .iter()
        .filter(|f| f.is_action("app", "createJob"))
        .count();
    assert_eq!(creates, 1);
    let third: Vec<_> = received.iter().filter(|f| f.connection == 3).collect();
    assert_eq!(third[0].body["token"]["id"], "job");
}

#[tokio::test]
async fn test_user_mode_retry_after_job_creation_reuses_job() {
    let service = FakeService::start().await;
    service.drop_on_once("getJobAccessToken");
    let options = fast(ClientOptions::user(
        account(service.port),
        ProjectSelector::Named("mnist".into()),
    ));
    let client = connected(options).await;

    assert_eq!(client.job().expect("job resolved").id, JOB_ID);
    let received = service.received();
    let count = |action: &str| received.iter().filter(|f| f.is_action("app", action)).count();
    assert_eq!(count("createJob"), 1);
    assert_eq!(count("getProjectForPublicName"), 1);
    assert_eq!(count("getJobAccessToken"), 2);

    let second: Vec<_> = received.iter().filter(|f| f.connection == 2).collect();
    assert_eq!(second.len(), 2);
    assert_eq!(second[0].body["token"]["id"], "user");
    assert!(second[1].is_action("app", "getJobAccessToken"));
    assert_eq!(second[1].body["args"], json!([JOB_ID]));
}

#[tokio::test]
async fn test_unreachable_service_in_user_mode_goes_offline() {
    let port = unused_port().await;
    let options = fast(ClientOptions::user(
        account(port),
        ProjectSelector::Named("mnist".into()),
    ));
    let client = Client::connect(options).unwrap();

    assert!(!timeout(WAIT, client.wait_for_connect()).await.unwrap());
    assert_eq!(client.state(), ConnectionState::Offline);
    assert!(client.job().is_none());

    // Everything is a quiet no-op
    client.patch("step", 1);
    let result = timeout(Duration::from_secs(1), client.job_action("ping", vec![]))
        .await
        .expect("offline actions return immediately");
    assert_eq!(result.unwrap(), None);
    timeout(Duration::from_secs(1), client.shutdown(JobOutcome::Done))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(client.state(), ConnectionState::Offline);
}

#[tokio::test]
async fn test_invalid_job_token_is_fatal() {
    let service = FakeService::start().await;
    service.reject_logins();
    let client = Client::connect(service.job_options()).unwrap();

    assert!(!timeout(WAIT, client.wait_for_connect()).await.unwrap());
    assert_eq!(client.state(), ConnectionState::Closed);

    let err = timeout(WAIT, client.job_action("ping", vec![]))
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, ClientError::Auth(_)));
    let err = timeout(WAIT, client.shutdown(JobOutcome::Done))
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, ClientError::Auth(_)));
    // No reconnect attempts after a rejected token
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(service.connections(), 1);
}

#[tokio::test]
async fn test_job_context_metrics_and_progress() {
    let service = FakeService::start().await;
    let client = connected(service.job_options()).await;
    let context = JobContext::new(client.clone());

    context.iteration(1, Some(10));
    context.set_info("gpu", "A100");
    context.set_parameter("lr", 0.01);
    context.metric("loss", 1.0, &[0.5]);
    context.flush();

    let received = service
        .wait_until(|frames| {
            frames.iter().any(|f| f.is_action("job", "channelData"))
                && frames.iter().any(|f| {
                    f.is_action("job", "patchJob")
                        && f.body["args"][0].get("channels.loss.lastValue").is_some()
                })
        })
        .await;

    let define = received
        .iter()
        .position(|f| f.is_action("job", "defineMetric"))
        .expect("metric defined implicitly");
    let data = received
        .iter()
        .position(|f| f.is_action("job", "channelData"))
        .unwrap();
    assert!(define < data);
    assert_eq!(received[define].body["args"], json!(["loss", {}]));

    let rows = &received[data].body["args"][1];
    assert_eq!(received[data].body["args"][0], "loss");
    assert_eq!(rows[0][0], 1.0);
    assert!(rows[0][1].as_f64().unwrap() > 0.0);
    assert_eq!(rows[0][2], 0.5);

    let patches: Value = received
        .iter()
        .filter(|f| f.is_action("job", "patchJob"))
        .fold(json!({}), |mut merged, f| {
            if let (Some(merged), Some(batch)) =
                (merged.as_object_mut(), f.body["args"][0].as_object())
            {
                merged.extend(batch.clone());
            }
            merged
        });
    assert_eq!(patches["iteration"], 1);
    assert_eq!(patches["iterations"], 10);
    assert_eq!(patches["infos.gpu"], "A100");
    assert_eq!(patches["config.parameters.lr"], 0.01);
    assert_eq!(patches["channels.loss.lastValue"], json!([0.5]));
}
