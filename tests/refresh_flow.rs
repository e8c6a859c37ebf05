//! Integration tests for the 401-renewal flow against a mock backend.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use portfolioos_client::{ApiClient, ApiErrorKind, ClientConfig, CredentialStore, MemoryStore};

fn client_with(
    server: &MockServer,
    store: &Arc<MemoryStore>,
    cascades: &Arc<AtomicUsize>,
) -> ApiClient {
    let store: Arc<dyn CredentialStore> = store.clone();
    let cascades = Arc::clone(cascades);
    ApiClient::new(
        ClientConfig::new(server.uri()),
        store,
        Box::new(move || {
            cascades.fetch_add(1, Ordering::SeqCst);
        }),
    )
}

/// Test: three concurrent calls hitting an expired token trigger exactly one
/// renewal, and every replay carries the new token.
#[tokio::test]
async fn test_single_flight_renewal() {
    let server = MockServer::start().await;

    // Renewal is slow enough that all three 401s land while it is in flight.
    Mock::given(method("POST"))
        .and(path("/auth/token/refresh/"))
        .and(body_partial_json(json!({"refresh": "R1"})))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"access": "A2", "refresh": "R2"}))
                .set_delay(Duration::from_millis(250)),
        )
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/buildings/"))
        .and(header("authorization", "Bearer A1"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "detail": "Given token not valid for any token type"
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/buildings/"))
        .and(header("authorization", "Bearer A2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!(["b1"])))
        .expect(3)
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());
    store.set_tokens("A1", "R1");
    let cascades = Arc::new(AtomicUsize::new(0));
    let client = Arc::new(client_with(&server, &store, &cascades));

    let (a, b, c) = tokio::join!(
        client.get_json("buildings/", &[]),
        client.get_json("buildings/", &[]),
        client.get_json("buildings/", &[]),
    );

    assert_eq!(a.unwrap(), json!(["b1"]));
    assert_eq!(b.unwrap(), json!(["b1"]));
    assert_eq!(c.unwrap(), json!(["b1"]));

    // The rotated pair was persisted before anyone replayed.
    assert_eq!(store.access().as_deref(), Some("A2"));
    assert_eq!(store.refresh_token().as_deref(), Some("R2"));
    assert_eq!(cascades.load(Ordering::SeqCst), 0);
}

/// Test: a request is replayed at most once — a 401 on the replay surfaces
/// as an error instead of looping through renewal again.
#[tokio::test]
async fn test_at_most_one_retry() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/auth/token/refresh/"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"access": "A2", "refresh": "R2"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    // The resource rejects every token, renewed or not.
    Mock::given(method("GET"))
        .and(path("/reports/"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({"detail": "nope"})))
        .expect(2)
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());
    store.set_tokens("A1", "R1");
    let cascades = Arc::new(AtomicUsize::new(0));
    let client = client_with(&server, &store, &cascades);

    let err = client.get_json("reports/", &[]).await.unwrap_err();
    assert_eq!(err.kind, ApiErrorKind::Unauthorized);
}

/// Test: when renewal itself fails, every concurrent caller rejects with the
/// renewal error and the logout cascade fires exactly once.
#[tokio::test]
async fn test_failed_renewal_cascades_once() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/auth/token/refresh/"))
        .respond_with(
            ResponseTemplate::new(401)
                .set_body_json(json!({"detail": "Token is blacklisted"}))
                .set_delay(Duration::from_millis(250)),
        )
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/buildings/"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({"detail": "expired"})))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());
    store.set_tokens("A1", "R1");
    let cascades = Arc::new(AtomicUsize::new(0));
    let client = Arc::new(client_with(&server, &store, &cascades));

    let (a, b, c) = tokio::join!(
        client.get_json("buildings/", &[]),
        client.get_json("buildings/", &[]),
        client.get_json("buildings/", &[]),
    );

    for result in [a, b, c] {
        let err = result.unwrap_err();
        assert_eq!(err.kind, ApiErrorKind::SessionExpired);
    }
    assert_eq!(cascades.load(Ordering::SeqCst), 1);
}

/// Test: a 401 from the login endpoint never triggers renewal — it returns
/// to the caller unchanged.
#[tokio::test]
async fn test_exempt_login_never_renews() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/auth/token/"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "detail": "No active account found with the given credentials"
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/auth/token/refresh/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access": "A2"})))
        .expect(0)
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());
    store.set_tokens("A1", "R1");
    let cascades = Arc::new(AtomicUsize::new(0));
    let client = client_with(&server, &store, &cascades);

    let err = client.login("user@test", "wrong").await.unwrap_err();
    assert_eq!(err.kind, ApiErrorKind::Unauthorized);
    assert!(err.message.contains("No active account"));
    assert_eq!(cascades.load(Ordering::SeqCst), 0);
}

/// Test: a 401 from the refresh endpoint called directly is returned
/// untouched instead of recursing into renewal.
#[tokio::test]
async fn test_exempt_refresh_endpoint_passthrough() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/auth/token/refresh/"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({"detail": "bad token"})))
        .expect(1)
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());
    store.set_tokens("A1", "R1");
    let cascades = Arc::new(AtomicUsize::new(0));
    let client = client_with(&server, &store, &cascades);

    let err = client
        .post_json("auth/token/refresh/", json!({"refresh": "R1"}))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ApiErrorKind::Unauthorized);
    assert_eq!(cascades.load(Ordering::SeqCst), 0);
}

/// Test: non-auth failures (403, 400, 500) pass through without renewal.
#[tokio::test]
async fn test_other_errors_pass_through() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/auth/token/refresh/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access": "A2"})))
        .expect(0)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/forbidden/"))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({"detail": "not yours"})))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/invalid/"))
        .respond_with(
            ResponseTemplate::new(400).set_body_json(json!({"name": ["This field is required."]})),
        )
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());
    store.set_tokens("A1", "R1");
    let cascades = Arc::new(AtomicUsize::new(0));
    let client = client_with(&server, &store, &cascades);

    let forbidden = client.get_json("forbidden/", &[]).await.unwrap_err();
    assert_eq!(forbidden.kind, ApiErrorKind::Forbidden);

    let invalid = client.get_json("invalid/", &[]).await.unwrap_err();
    assert_eq!(invalid.kind, ApiErrorKind::Validation);
    assert_eq!(
        invalid.details.as_deref(),
        Some(r#"{"name":["This field is required."]}"#)
    );
}
