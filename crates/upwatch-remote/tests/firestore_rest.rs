//! ---
//! upw_section: "05-networking-external-interfaces"
//! upw_subsection: "tests"
//! upw_type: "test"
//! upw_scope: "code"
//! upw_description: "Firestore REST store against a fake document endpoint."
//! upw_version: "v0.0.0-prealpha"
//! upw_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::{Method, StatusCode, Uri};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use upwatch_common::{DeviceIdentity, RemoteConfig, ServiceDiff};
use upwatch_remote::{FirestoreRemote, RemoteError, RemoteStateStore};

const DOC_PATH: &str =
    "/v1/projects/fleet/databases/(default)/documents/users/user-1/devices/device-7";

#[derive(Default)]
struct FakeState {
    record: Option<BTreeMap<String, String>>,
    token_calls: usize,
    patches: Vec<Vec<String>>,
    reject_next: Option<StatusCode>,
}

type Shared = Arc<Mutex<FakeState>>;

fn unquote(path: &str) -> String {
    let inner = path.trim_start_matches('`').trim_end_matches('`');
    let mut out = String::new();
    let mut escaped = false;
    for ch in inner.chars() {
        if ch == '\\' && !escaped {
            escaped = true;
            continue;
        }
        escaped = false;
        out.push(ch);
    }
    out
}

async fn token(State(state): State<Shared>, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    assert_eq!(body["grantType"], "refresh_token");
    state.lock().unwrap().token_calls += 1;
    (
        StatusCode::OK,
        Json(json!({"id_token": "id-token", "user_id": "user-1", "expires_in": "3600"})),
    )
}

async fn document(
    State(state): State<Shared>,
    method: Method,
    uri: Uri,
    body: String,
) -> (StatusCode, Json<Value>) {
    let mut state = state.lock().unwrap();
    if uri.path() != DOC_PATH {
        return (StatusCode::NOT_FOUND, Json(json!({"error": "wrong path"})));
    }
    if let Some(status) = state.reject_next.take() {
        return (status, Json(json!({"error": "rejected"})));
    }
    let query: Vec<(String, String)> =
        url::form_urlencoded::parse(uri.query().unwrap_or_default().as_bytes())
            .into_owned()
            .collect();

    if method == Method::GET {
        let Some(record) = state.record.as_ref() else {
            return (StatusCode::NOT_FOUND, Json(json!({"error": "missing"})));
        };
        assert!(query.contains(&("mask.fieldPaths".into(), "updatable_services".into())));
        let fields: serde_json::Map<String, Value> = record
            .iter()
            .map(|(k, v)| (k.clone(), json!({"stringValue": v})))
            .collect();
        return (
            StatusCode::OK,
            Json(json!({"fields": {"updatable_services": {"mapValue": {"fields": fields}}}})),
        );
    }

    let payload: Value = serde_json::from_str(&body).unwrap();
    let upserts = payload["fields"]["updatable_services"]["mapValue"]["fields"].clone();
    let mask: Vec<String> = query
        .into_iter()
        .filter(|(key, _)| key == "updateMask.fieldPaths")
        .map(|(_, value)| value)
        .collect();
    let record = state.record.get_or_insert_with(BTreeMap::new);
    for path in &mask {
        let key = unquote(path.trim_start_matches("updatable_services."));
        match upserts[key.as_str()]["stringValue"].as_str() {
            Some(version) => {
                record.insert(key, version.to_owned());
            }
            None => {
                record.remove(&key);
            }
        }
    }
    state.patches.push(mask);
    (StatusCode::OK, Json(json!({})))
}

async fn fake_firestore(state: Shared) -> SocketAddr {
    let app = Router::new()
        .route("/v1/token", post(token))
        .fallback(document)
        .with_state(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn remote(addr: SocketAddr) -> FirestoreRemote {
    let config = RemoteConfig {
        firestore_url: format!("http://{addr}"),
        token_url: format!("http://{addr}/"),
        request_timeout: Duration::from_secs(2),
        ..RemoteConfig::default()
    };
    let identity = DeviceIdentity {
        device_id: "device-7".into(),
        project_id: "fleet".into(),
        api_key: "key".into(),
        refresh_token: "refresh".into(),
    };
    FirestoreRemote::new(&config, &identity).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn partial_write_sets_and_deletes_only_named_keys() {
    let state = Shared::default();
    state.lock().unwrap().record = Some(BTreeMap::from([
        ("led-driver".to_owned(), "2.0.1".to_owned()),
        ("unrelated".to_owned(), "5.0.0".to_owned()),
    ]));
    let store = remote(fake_firestore(state.clone()).await);

    let diff = ServiceDiff::default()
        .upsert("button-handler", "0.1.1")
        .remove("led-driver");
    store.write_updatable_services(&diff).await.unwrap();

    let map = store.read_updatable_services().await.unwrap();
    assert_eq!(
        map,
        BTreeMap::from([
            ("button-handler".to_owned(), "0.1.1".to_owned()),
            ("unrelated".to_owned(), "5.0.0".to_owned()),
        ])
    );
    let state = state.lock().unwrap();
    assert_eq!(
        state.patches,
        vec![vec![
            "updatable_services.`button-handler`".to_owned(),
            "updatable_services.`led-driver`".to_owned(),
        ]]
    );
    assert_eq!(state.token_calls, 1, "token is cached across calls");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_document_is_record_not_found() {
    let state = Shared::default();
    let store = remote(fake_firestore(state).await);
    let err = store.read_updatable_services().await.unwrap_err();
    assert!(matches!(err, RemoteError::RecordNotFound(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unauthorised_response_invalidates_token() {
    let state = Shared::default();
    state.lock().unwrap().record = Some(BTreeMap::new());
    state.lock().unwrap().reject_next = Some(StatusCode::UNAUTHORIZED);
    let store = remote(fake_firestore(state.clone()).await);

    let err = store.read_updatable_services().await.unwrap_err();
    assert!(matches!(err, RemoteError::Auth(_)));
    store.read_updatable_services().await.unwrap();
    assert_eq!(state.lock().unwrap().token_calls, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_error_on_write_is_rejected_and_server_error_is_unreachable() {
    let state = Shared::default();
    state.lock().unwrap().record = Some(BTreeMap::new());
    let store = remote(fake_firestore(state.clone()).await);
    let diff = ServiceDiff::default().upsert("a", "1.0.0");

    state.lock().unwrap().reject_next = Some(StatusCode::BAD_REQUEST);
    let err = store.write_updatable_services(&diff).await.unwrap_err();
    assert!(matches!(err, RemoteError::WriteRejected { status: 400, .. }));

    state.lock().unwrap().reject_next = Some(StatusCode::SERVICE_UNAVAILABLE);
    let err = store.write_updatable_services(&diff).await.unwrap_err();
    assert!(matches!(err, RemoteError::Unreachable(_)));

    store.write_updatable_services(&diff).await.unwrap();
    assert_eq!(state.lock().unwrap().record.as_ref().unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn whole_field_replace_uses_field_mask() {
    let state = Shared::default();
    state.lock().unwrap().record = Some(BTreeMap::from([("old".to_owned(), "1.0.0".to_owned())]));
    let store = remote(fake_firestore(state.clone()).await);

    let map = BTreeMap::from([("new".to_owned(), "2.0.0".to_owned())]);
    store.replace_updatable_services(&map).await.unwrap();

    assert_eq!(
        state.lock().unwrap().patches,
        vec![vec!["updatable_services".to_owned()]]
    );
}
