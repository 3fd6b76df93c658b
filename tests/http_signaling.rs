use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, put};
use axum::{Json, Router};
use peerlaunch_lib::directory::{Directory, HttpDirectory, NodeQuery};
use peerlaunch_lib::signaling::{DirectSignalFactory, FixedBackoff, SignalFactory};
use peerlaunch_lib::{Error, StopSignal};
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

const FIRST: &str =
    r#"{"candidate":"candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host","sdpMid":"0"}"#;
const END: &str = r#"{"candidate":""}"#;
const LATE: &str =
    r#"{"candidate":"candidate:3 1 udp 41885439 198.51.100.9 50002 typ relay","sdpMid":"0"}"#;

fn second() -> Value {
    json!({
        "candidate": "candidate:2 1 udp 1686052607 203.0.113.7 50001 typ srflx",
        "sdpMid": "0",
        "sdpMLineIndex": 0
    })
}

#[derive(Default)]
struct Seen {
    queries: Vec<HashMap<String, String>>,
    secrets: Vec<Option<String>>,
    answers: Vec<(String, String, Option<String>)>,
    candidates: Vec<(String, String)>,
    polls: usize,
}

type Shared = Arc<Mutex<Seen>>;

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

async fn list_offers(
    State(seen): State<Shared>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Json<Value> {
    let mut seen = seen.lock().unwrap();
    seen.queries.push(query);
    seen.secrets.push(header(&headers, "Secret"));
    Json(json!([
        { "session_id": "n1", "peer_connection_offer": "{\"Offer\":\"{}\"}" },
        { "session_id": "n2", "peer_connection_offer": "{\"Offer\":\"{}\"}" }
    ]))
}

async fn put_answer(
    State(seen): State<Shared>,
    Path(sid): Path<String>,
    headers: HeaderMap,
    body: String,
) -> StatusCode {
    if sid == "taken" {
        return StatusCode::CONFLICT;
    }
    seen.lock()
        .unwrap()
        .answers
        .push((sid, body, header(&headers, "Content-Type")));
    StatusCode::OK
}

async fn put_candidate(
    State(seen): State<Shared>,
    Path(sid): Path<String>,
    body: String,
) -> StatusCode {
    seen.lock().unwrap().candidates.push((sid, body));
    StatusCode::OK
}

async fn get_session(
    State(seen): State<Shared>,
    Path(sid): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    match sid.as_str() {
        "missing" => Err(StatusCode::NOT_FOUND),
        "quiet" => Ok(Json(json!({ "offerIce": [] }))),
        _ => {
            let polls = {
                let mut seen = seen.lock().unwrap();
                seen.polls += 1;
                seen.polls
            };
            // Every poll returns the full list so far
            let mut ice = vec![json!(FIRST)];
            if polls >= 2 {
                ice.push(second());
            }
            if polls >= 3 {
                ice.push(json!(END));
                // Same page as the end marker: still delivered
                ice.push(json!(LATE));
            }
            if polls >= 4 {
                ice.push(json!("never delivered"));
            }
            Ok(Json(json!({ "offerIce": ice })))
        }
    }
}

async fn serve(seen: Shared) -> String {
    let app = Router::new()
        .route("/ephemeral/offers", get(list_offers))
        .route(
            "/down/offers",
            get(|| async { StatusCode::SERVICE_UNAVAILABLE }),
        )
        .route("/signal/:sid", get(get_session))
        .route("/signal/:sid/answer", put(put_answer))
        .route("/signal/:sid/answerIce", put(put_candidate))
        .with_state(seen);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/")
}

fn signals(base: &str) -> DirectSignalFactory {
    DirectSignalFactory::new(
        Client::new(),
        format!("{base}signal"),
        Some("signal-secret".to_string()),
        Arc::new(FixedBackoff(Duration::from_millis(10))),
    )
}

#[tokio::test]
async fn test_directory_listing_request() {
    let seen = Shared::default();
    let base = serve(Arc::clone(&seen)).await;
    let directory = HttpDirectory::new(
        Client::new(),
        format!("{base}ephemeral"),
        Some("default-secret".to_string()),
    );
    let stop = StopSignal::new();

    let query = NodeQuery::capability("borg").versions(Some("1.2".to_string()), None);
    let offers = directory.list_nodes(&query, &stop).await.unwrap();
    assert_eq!(offers.len(), 2);
    assert_eq!(offers[0].session_id, "n1");

    directory
        .list_nodes(&NodeQuery::default(), &stop)
        .await
        .unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.queries[0].get("verMin").map(String::as_str), Some("1.2"));
    assert!(!seen.queries[0].contains_key("verMax"));
    assert!(seen.queries[1].is_empty());
    assert_eq!(
        seen.secrets,
        vec![Some("borg".to_string()), Some("default-secret".to_string())]
    );
}

#[tokio::test]
async fn test_directory_failure_status() {
    let base = serve(Shared::default()).await;
    let directory = HttpDirectory::new(Client::new(), format!("{base}down"), None);
    let result = directory
        .list_nodes(&NodeQuery::default(), &StopSignal::new())
        .await;
    match result {
        Err(Error::DirectoryUnavailable(message)) => assert!(message.contains("503")),
        other => panic!("unexpected result: {other:?}"),
    }
}

#[tokio::test]
async fn test_answer_and_candidates_are_put() {
    let seen = Shared::default();
    let base = serve(Arc::clone(&seen)).await;
    let signal = signals(&base).create("s-1");
    assert_eq!(signal.session_id(), "s-1");

    signal.submit_answer(r#"{"type":"answer"}"#).await.unwrap();
    signal.send_candidate(FIRST).await.unwrap();

    let rejected = signals(&base).create("taken").submit_answer("{}").await;
    assert!(matches!(rejected, Err(Error::AnswerRejected(_))));

    let seen = seen.lock().unwrap();
    assert_eq!(
        seen.answers,
        vec![(
            "s-1".to_string(),
            r#"{"type":"answer"}"#.to_string(),
            Some("text/plain".to_string())
        )]
    );
    assert_eq!(seen.candidates, vec![("s-1".to_string(), FIRST.to_string())]);
}

#[tokio::test]
async fn test_remote_candidates_delivered_once_until_end() {
    let seen = Shared::default();
    let base = serve(Arc::clone(&seen)).await;
    let signal = signals(&base).create("s-2");
    let (tx, mut rx) = mpsc::unbounded_channel();

    signal.fetch_candidates(tx, &StopSignal::new()).await.unwrap();

    let mut received = Vec::new();
    while let Ok(raw) = rx.try_recv() {
        received.push(raw);
    }
    assert_eq!(
        received,
        vec![
            FIRST.to_string(),
            second().to_string(),
            END.to_string(),
            LATE.to_string()
        ]
    );
    assert_eq!(seen.lock().unwrap().polls, 3);
}

#[tokio::test]
async fn test_poll_failure_and_stop() {
    let base = serve(Shared::default()).await;
    let (tx, _rx) = mpsc::unbounded_channel();
    let result = signals(&base)
        .create("missing")
        .fetch_candidates(tx, &StopSignal::new())
        .await;
    assert!(matches!(result, Err(Error::DirectoryUnavailable(_))));

    let stop = StopSignal::new();
    let quiet = signals(&base).create("quiet");
    let stopper = {
        let stop = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stop.stop(0);
        })
    };
    let (tx, mut rx) = mpsc::unbounded_channel();
    quiet.fetch_candidates(tx, &stop).await.unwrap();
    assert!(rx.try_recv().is_err());
    stopper.await.unwrap();
}
