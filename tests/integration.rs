//! End-to-end: mock telemetry WebSockets → aggregator → mock strategy endpoint.

use std::sync::Arc;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::post;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use race_strategy_aggregator::aggregator::{Aggregator, TriggerPolicy};
use race_strategy_aggregator::cache::LatestValueCache;
use race_strategy_aggregator::metrics::{self, Metrics};
use race_strategy_aggregator::presentation::PresentationReader;
use race_strategy_aggregator::source::{Overtake, SourceConnection, SourceHandle, TireCliff, Undercut};
use race_strategy_aggregator::strategy::StrategyClient;
use race_strategy_aggregator::types::SourceId;

const WAIT: Duration = Duration::from_secs(10);

/// Serve one WebSocket client: push `frames`, then hold the connection open
/// until the client closes it.
async fn mock_stream(frames: Vec<String>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        for frame in frames {
            ws.send(Message::Text(frame)).await.unwrap();
        }
        while let Some(Ok(_)) = ws.next().await {}
    });
    format!("ws://{addr}")
}

fn overtake_frames() -> Vec<String> {
    (1..=10)
        .map(|rev| json!({"VER": rev % 4, "HAM": 1, "refresh_count": rev}).to_string())
        .collect()
}

fn tire_cliff_frames() -> Vec<String> {
    (1..=10)
        .map(|rev| {
            json!({
                "MY_CAR": {
                    "matches_found": 30,
                    "max_similarity": 0.9,
                    "risk_detected": rev > 5,
                    "simulated_vector": [0.1, 0.2]
                },
                "refresh_count": rev
            })
            .to_string()
        })
        .collect()
}

fn undercut_frames() -> Vec<String> {
    (1..=10)
        .map(|rev| {
            json!({
                "MY_CAR": {"total_matches": 10, "relevant_matches": rev / 2, "simulated_vector": []},
                "refresh_count": rev
            })
            .to_string()
        })
        .collect()
}

#[derive(Clone, Default)]
struct StrategyMock {
    calls: Arc<AtomicUsize>,
    last_body: Arc<Mutex<Option<Value>>>,
}

async fn spawn_strategy(status: StatusCode) -> (String, StrategyMock) {
    let mock = StrategyMock::default();
    let app = Router::new().route(
        "/api/strategy",
        post({
            let mock = mock.clone();
            move |axum::Json(body): axum::Json<Value>| {
                let mock = mock.clone();
                async move {
                    let n = mock.calls.fetch_add(1, Ordering::SeqCst) + 1;
                    *mock.last_body.lock().unwrap() = Some(body);
                    (status, axum::Json(json!({"strategy": format!("Box on lap {n}")})))
                }
            }
        }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}/api/strategy"), mock)
}

struct Harness {
    reader: PresentationReader,
    metrics: Arc<Metrics>,
    cache: Arc<LatestValueCache>,
    cancel: CancellationToken,
    handles: Vec<SourceHandle>,
}

async fn start(frames: [Vec<String>; 3], strategy_url: String) -> Harness {
    let [overtake, tire_cliff, undercut] = frames;
    let overtake_url = mock_stream(overtake).await;
    let tire_cliff_url = mock_stream(tire_cliff).await;
    let undercut_url = mock_stream(undercut).await;

    let metrics = Arc::new(Metrics::default());
    let cache = Arc::new(LatestValueCache::in_memory().unwrap());
    let cancel = CancellationToken::new();

    let aggregator = Aggregator::new(
        TriggerPolicy::default(),
        Arc::clone(&cache),
        StrategyClient::new(strategy_url, Duration::from_secs(5)),
        Arc::clone(&metrics),
        cancel.clone(),
    );
    let reader = aggregator.presentation();

    let (tx, rx) = mpsc::channel(16);
    let handles = vec![
        SourceConnection::new(Overtake, overtake_url, metrics.source(SourceId::Overtake))
            .reconnect(false)
            .open(tx.clone(), &cancel),
        SourceConnection::new(TireCliff, tire_cliff_url, metrics.source(SourceId::TireCliff))
            .reconnect(false)
            .open(tx.clone(), &cancel),
        SourceConnection::new(Undercut, undercut_url, metrics.source(SourceId::Undercut))
            .reconnect(false)
            .open(tx, &cancel),
    ];
    tokio::spawn(aggregator.run(rx));

    Harness {
        reader,
        metrics,
        cache,
        cancel,
        handles,
    }
}

/// Poll until `cond` holds or `WAIT` elapses.
async fn eventually(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn aligned_streams_produce_one_recommendation() {
    let (strategy_url, mock) = spawn_strategy(StatusCode::OK).await;
    let h = start([overtake_frames(), tire_cliff_frames(), undercut_frames()], strategy_url).await;

    let mut rx = h.reader.subscribe_recommendation();
    tokio::time::timeout(WAIT, rx.wait_for(Option::is_some))
        .await
        .expect("no recommendation in time")
        .unwrap();

    eventually(|| h.metrics.ingests.load(Relaxed) == 30).await;
    assert_eq!(mock.calls.load(Ordering::SeqCst), 1);

    let recommendation = h.reader.recommendation().unwrap();
    assert_eq!(recommendation.text, "Box on lap 1");
    assert_eq!(recommendation.generation, 1);

    let body = mock.last_body.lock().unwrap().take().unwrap();
    assert_eq!(body["overtake_data"], json!({"VER": 2, "HAM": 1}));
    assert_eq!(body["tire_data"]["risk_detected"], true);
    assert_eq!(body["pit_data"]["relevant_matches"], 5);
    assert!(body["overtake_data"].get("refresh_count").is_none());

    for source in SourceId::ALL {
        assert_eq!(h.reader.latest(source).unwrap().revision, 10);
        assert!(h.cache.load(source).unwrap().is_some());
    }

    h.cancel.cancel();
    for handle in h.handles {
        handle.join().await.unwrap();
    }
}

#[tokio::test]
async fn bad_frame_only_affects_its_own_stream() {
    let (strategy_url, mock) = spawn_strategy(StatusCode::OK).await;
    let mut overtake = vec!["{not json".to_string(), r#"{"VER":1}"#.to_string()];
    overtake.extend(overtake_frames());
    let h = start([overtake, tire_cliff_frames(), undercut_frames()], strategy_url).await;

    eventually(|| h.reader.recommendation().is_some()).await;
    assert_eq!(mock.calls.load(Ordering::SeqCst), 1);

    assert_eq!(h.metrics.source(SourceId::Overtake).errors.load(Relaxed), 2);
    assert_eq!(h.metrics.source(SourceId::TireCliff).errors.load(Relaxed), 0);
    assert_eq!(h.metrics.source(SourceId::Undercut).errors.load(Relaxed), 0);
    assert_eq!(h.metrics.source(SourceId::Overtake).messages.load(Relaxed), 10);
}

#[tokio::test]
async fn failing_strategy_leaves_recommendation_unset() {
    let (strategy_url, mock) = spawn_strategy(StatusCode::INTERNAL_SERVER_ERROR).await;
    let h = start([overtake_frames(), tire_cliff_frames(), undercut_frames()], strategy_url).await;

    eventually(|| h.metrics.strategy_failures.load(Relaxed) == 1).await;
    assert_eq!(mock.calls.load(Ordering::SeqCst), 1);
    assert!(h.reader.recommendation().is_none());
    assert_eq!(h.reader.latest(SourceId::Undercut).unwrap().revision, 10);
}

#[tokio::test]
async fn state_endpoint_serves_presentation_view() {
    let (strategy_url, _mock) = spawn_strategy(StatusCode::OK).await;
    let h = start([overtake_frames(), tire_cliff_frames(), undercut_frames()], strategy_url).await;
    eventually(|| h.reader.recommendation().is_some()).await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(metrics::serve_http(
        listener,
        Arc::clone(&h.metrics),
        h.reader.clone(),
        h.cancel.clone(),
    ));

    let state: Value = reqwest::get(format!("http://{addr}/api/state"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(state["strategy"]["text"], "Box on lap 1");
    assert_eq!(state["tire_cliff"]["matches_found"], 30);
    assert_eq!(state["overtake"]["HAM"], 1);

    let health = reqwest::get(format!("http://{addr}/health")).await.unwrap();
    assert_eq!(health.status(), StatusCode::OK);

    h.cancel.cancel();
}
