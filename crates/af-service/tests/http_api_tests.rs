//! HTTP surface integration tests.
//!
//! Sends requests through the merged router (production middleware
//! included) with `tower::ServiceExt::oneshot`. The dispatcher behind it is
//! real; the M3 client is mocked.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use af_service::context::as_state::DistributionStatus;
use af_service::http::m1::{CreatedSession, PurgeAccepted};
use af_test_utils::*;
use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::response::Response;
use http_body_util::BodyExt;
use std::time::Duration;
use tower::ServiceExt;

const AS1: &str = "as1.example.com";
const SESSIONS: &str = "/3gpp-m1/v2/provisioning-sessions";

fn json_request(method: Method, uri: &str, body: &serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn empty_request(method: Method, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn body_json(response: Response) -> Result<serde_json::Value, anyhow::Error> {
    let bytes = response.into_body().collect().await?.to_bytes();
    Ok(serde_json::from_slice(&bytes)?)
}

/// Create a session over M1 and return its id.
async fn create(af: &TestAf) -> Result<String, anyhow::Error> {
    let body = HostingConfigurationBuilder::new("live")
        .rule(AS1, "/live/")
        .to_json();
    let response = af
        .router()
        .oneshot(json_request(Method::POST, SESSIONS, &body))
        .await?;
    assert_eq!(response.status(), StatusCode::CREATED);

    let bytes = response.into_body().collect().await?.to_bytes();
    let created: CreatedSession = serde_json::from_slice(&bytes)?;
    Ok(created.provisioning_session_id.to_string())
}

/// Test that session creation answers 201 with a Location header.
#[tokio::test]
async fn test_create_session_returns_location() -> Result<(), anyhow::Error> {
    let af = TestAf::start(test_config_vars(&[AS1])).await?;

    let body = HostingConfigurationBuilder::new("live")
        .rule(AS1, "/live/")
        .to_json();
    let response = af
        .router()
        .oneshot(json_request(Method::POST, SESSIONS, &body))
        .await?;

    assert_eq!(response.status(), StatusCode::CREATED);
    let location = response
        .headers()
        .get(header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let body = body_json(response).await?;
    let id = body["provisioningSessionId"].as_str().unwrap_or_default();
    assert_eq!(location, Some(format!("{SESSIONS}/{id}")));

    Ok(())
}

/// Test that malformed JSON is a 400, not axum's default 422.
#[tokio::test]
async fn test_create_session_rejects_malformed_body() -> Result<(), anyhow::Error> {
    let af = TestAf::start(test_config_vars(&[AS1])).await?;

    let request = Request::builder()
        .method(Method::POST)
        .uri(SESSIONS)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))?;
    let response = af.router().oneshot(request).await?;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await?;
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");

    Ok(())
}

/// Test that a rule naming an unknown server is a 400.
#[tokio::test]
async fn test_create_session_rejects_unknown_server() -> Result<(), anyhow::Error> {
    let af = TestAf::start(test_config_vars(&[AS1])).await?;

    let body = HostingConfigurationBuilder::new("live")
        .rule("elsewhere.example.com", "/live/")
        .to_json();
    let response = af
        .router()
        .oneshot(json_request(Method::POST, SESSIONS, &body))
        .await?;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    Ok(())
}

/// Test that served documents carry cache headers and honour If-None-Match.
#[tokio::test]
async fn test_hosting_configuration_conditional_get() -> Result<(), anyhow::Error> {
    let af = TestAf::start(test_config_vars(&[AS1])).await?;
    let id = create(&af).await?;
    let uri = format!("{SESSIONS}/{id}/content-hosting-configuration");

    let response = af.router().oneshot(empty_request(Method::GET, &uri)).await?;
    assert_eq!(response.status(), StatusCode::OK);

    let etag = response
        .headers()
        .get(header::ETAG)
        .cloned()
        .expect("ETag header");
    assert!(response.headers().contains_key(header::CACHE_CONTROL));
    assert!(response.headers().contains_key(header::LAST_MODIFIED));

    let body = body_json(response).await?;
    assert_eq!(body["name"], "live");

    let conditional = Request::builder()
        .method(Method::GET)
        .uri(&uri)
        .header(header::IF_NONE_MATCH, etag)
        .body(Body::empty())?;
    let response = af.router().oneshot(conditional).await?;

    assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
    let bytes = response.into_body().collect().await?.to_bytes();
    assert!(bytes.is_empty());

    Ok(())
}

/// Test that PUT replaces the document and a later GET shows the change.
#[tokio::test]
async fn test_put_hosting_configuration() -> Result<(), anyhow::Error> {
    let af = TestAf::start(test_config_vars(&[AS1])).await?;
    let id = create(&af).await?;
    let uri = format!("{SESSIONS}/{id}/content-hosting-configuration");

    let updated = HostingConfigurationBuilder::new("live-v2")
        .rule(AS1, "/live/")
        .to_json();
    let response = af
        .router()
        .oneshot(json_request(Method::PUT, &uri, &updated))
        .await?;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = af.router().oneshot(empty_request(Method::GET, &uri)).await?;
    let body = body_json(response).await?;
    assert_eq!(body["name"], "live-v2");

    Ok(())
}

/// Test that the session resource reports per-server distribution.
#[tokio::test]
async fn test_get_session_reports_distribution() -> Result<(), anyhow::Error> {
    let af = TestAf::start(test_config_vars(&[AS1])).await?;
    let id = create(&af).await?;
    af.wait_for_session(id.parse()?, |s| {
        s.servers.iter().all(|d| d.status == DistributionStatus::Uploaded)
    })
    .await?;

    let response = af
        .router()
        .oneshot(empty_request(Method::GET, &format!("{SESSIONS}/{id}")))
        .await?;

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await?;
    assert_eq!(body["provisioningSessionId"], id.as_str());

    Ok(())
}

/// Test that malformed and unknown session ids are both 404.
#[tokio::test]
async fn test_unknown_session_returns_404() -> Result<(), anyhow::Error> {
    let af = TestAf::start(test_config_vars(&[AS1])).await?;

    for id in ["not-a-uuid", "6f1c2a9e-3b4d-4e5f-8a7b-9c0d1e2f3a4b"] {
        let response = af
            .router()
            .oneshot(empty_request(Method::GET, &format!("{SESSIONS}/{id}")))
            .await?;
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "id {id}");
    }

    Ok(())
}

/// Test that delete answers 202 and the session is gone once withdrawn.
#[tokio::test]
async fn test_delete_session_returns_202() -> Result<(), anyhow::Error> {
    let af = TestAf::start(test_config_vars(&[AS1])).await?;
    let id = create(&af).await?;
    af.wait_for_session(id.parse()?, |s| {
        s.servers.iter().all(|d| d.status == DistributionStatus::Uploaded)
    })
    .await?;

    let response = af
        .router()
        .oneshot(empty_request(Method::DELETE, &format!("{SESSIONS}/{id}")))
        .await?;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    af.wait_for_release(id.parse()?).await?;
    let response = af
        .router()
        .oneshot(empty_request(Method::GET, &format!("{SESSIONS}/{id}")))
        .await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    Ok(())
}

/// Test that a session being withdrawn stays readable and reports it.
#[tokio::test]
async fn test_session_visible_while_pending_deletion() -> Result<(), anyhow::Error> {
    // The upload is acknowledged; the withdrawal never completes.
    let af = TestAf::start_with(
        test_config_vars(&[AS1]),
        MockApplicationServer::with_script(vec![MockOutcome::Ack], MockOutcome::Hang),
        MockRegistry::accepting(),
    )
    .await?;
    let id = create(&af).await?;
    af.wait_for_session(id.parse()?, |s| {
        s.servers.iter().all(|d| d.status == DistributionStatus::Uploaded)
    })
    .await?;

    let response = af
        .router()
        .oneshot(empty_request(Method::DELETE, &format!("{SESSIONS}/{id}")))
        .await?;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let response = af
        .router()
        .oneshot(empty_request(Method::GET, &format!("{SESSIONS}/{id}")))
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await?;
    assert_eq!(body["pendingDeletion"], true);

    let response = af
        .router()
        .oneshot(empty_request(
            Method::GET,
            &format!("{SESSIONS}/{id}/content-hosting-configuration"),
        ))
        .await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    Ok(())
}

/// Test that a purge without a body purges everything.
#[tokio::test]
async fn test_purge_without_body_purges_all() -> Result<(), anyhow::Error> {
    let af = TestAf::start(test_config_vars(&[AS1])).await?;
    let id = create(&af).await?;
    af.wait_for_session(id.parse()?, |s| {
        s.servers.iter().all(|d| d.status == DistributionStatus::Uploaded)
    })
    .await?;

    let uri = format!("{SESSIONS}/{id}/content-hosting-configuration/purge");
    let response = af.router().oneshot(empty_request(Method::POST, &uri)).await?;
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = response.into_body().collect().await?.to_bytes();
    let accepted: PurgeAccepted = serde_json::from_slice(&bytes)?;
    assert_eq!(accepted.purge_requests, 1);

    tokio::time::timeout(Duration::from_secs(5), af.servers.wait_for_requests(2)).await?;
    let purge = af
        .servers
        .requests()
        .into_iter()
        .last()
        .expect("purge request");
    let body = purge.body.expect("purge body");
    let body: serde_json::Value = serde_json::from_slice(&body)?;
    assert_eq!(body["pattern"], ".*");

    Ok(())
}

/// Test that M5 serves service access information for a session.
#[tokio::test]
async fn test_service_access_information() -> Result<(), anyhow::Error> {
    let af = TestAf::start(test_config_vars(&[AS1])).await?;
    let id = create(&af).await?;

    let response = af
        .router()
        .oneshot(empty_request(
            Method::GET,
            &format!("/3gpp-m5/v2/service-access-information/{id}"),
        ))
        .await?;

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key(header::ETAG));
    let body = body_json(response).await?;
    assert_eq!(body["provisioningSessionId"], id.as_str());
    assert!(body["streamingAccess"]["entryPoints"].is_array());

    Ok(())
}

/// Test application server administration over the management surface.
#[tokio::test]
async fn test_register_and_deregister_server() -> Result<(), anyhow::Error> {
    let af = TestAf::start(test_config_vars(&[AS1])).await?;
    let servers = "/maf-mgmt/v1/application-servers";

    let body = serde_json::json!({
        "canonicalHostname": "as9.example.com",
        "m3BaseUrl": "http://10.0.0.9:7777"
    });
    let response = af
        .router()
        .oneshot(json_request(Method::POST, servers, &body))
        .await?;
    assert_eq!(response.status(), StatusCode::CREATED);
    let summary = body_json(response).await?;
    let id = summary["id"].as_u64().expect("numeric server id");

    let response = af.router().oneshot(empty_request(Method::GET, servers)).await?;
    let listed = body_json(response).await?;
    assert_eq!(listed.as_array().map(Vec::len), Some(2));

    let response = af
        .router()
        .oneshot(empty_request(Method::DELETE, &format!("{servers}/{id}")))
        .await?;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = af
        .router()
        .oneshot(empty_request(Method::DELETE, &format!("{servers}/{id}")))
        .await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    Ok(())
}

/// Test that reload and the subscription callback are accepted.
#[tokio::test]
async fn test_reload_and_subscription_expiry() -> Result<(), anyhow::Error> {
    let af = TestAf::start(test_config_vars(&[AS1])).await?;

    let response = af
        .router()
        .oneshot(empty_request(Method::POST, "/maf-mgmt/v1/reload"))
        .await?;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let response = af
        .router()
        .oneshot(empty_request(
            Method::POST,
            "/nmsaf-callback/v1/subscription-expiry",
        ))
        .await?;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    Ok(())
}

/// Test that readiness follows the interfaces and liveness is always up.
#[tokio::test]
async fn test_health_and_readiness() -> Result<(), anyhow::Error> {
    let af = TestAf::spawn_with(
        test_config_vars(&[AS1]),
        MockApplicationServer::accepting(),
        MockRegistry::accepting(),
    )?;

    let response = af.router().oneshot(empty_request(Method::GET, "/health")).await?;
    assert_eq!(response.status(), StatusCode::OK);

    let response = af.router().oneshot(empty_request(Method::GET, "/ready")).await?;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    af.dispatcher.start().await?;
    tokio::time::timeout(Duration::from_secs(5), async {
        while !af.health.is_ready() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;

    let response = af.router().oneshot(empty_request(Method::GET, "/ready")).await?;
    assert_eq!(response.status(), StatusCode::OK);

    Ok(())
}

/// Test that the metrics endpoint is served.
#[tokio::test]
async fn test_metrics_endpoint() -> Result<(), anyhow::Error> {
    let af = TestAf::start(test_config_vars(&[AS1])).await?;

    let response = af.router().oneshot(empty_request(Method::GET, "/metrics")).await?;
    assert_eq!(response.status(), StatusCode::OK);

    Ok(())
}

/// Test that requests before start are refused as unavailable.
#[tokio::test]
async fn test_requests_before_start_are_unavailable() -> Result<(), anyhow::Error> {
    let af = TestAf::spawn_with(
        test_config_vars(&[AS1]),
        MockApplicationServer::accepting(),
        MockRegistry::accepting(),
    )?;

    let body = HostingConfigurationBuilder::new("live")
        .rule(AS1, "/live/")
        .to_json();
    let response = af
        .router()
        .oneshot(json_request(Method::POST, SESSIONS, &body))
        .await?;

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    Ok(())
}
