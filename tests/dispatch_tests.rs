//! End-to-end tests of the request pipeline
//!
//! Covers:
//! - Health check short-circuit
//! - Forced login and its script redirect
//! - Whitelist bypass and fence denial
//! - Path normalization ahead of the whitelist and fence
//! - Identity header propagation and anti-spoofing
//! - The browser login handshake through the router

mod common;

use axum::http::{StatusCode, header};
use beyond::session::SessionStore;
use pretty_assertions::assert_eq;

use common::{Harness, body_string, cookie_from_set_cookie, empty, get};

#[tokio::test]
async fn health_check_ignores_host_and_credentials() {
    let h = Harness::offline();
    for host in ["beyond.example.com", "docker.example.com", "anything.example.com"] {
        let request = get(host, "/healthz.html")
            .header(header::AUTHORIZATION, "Bearer garbage")
            .header(header::COOKIE, "beyond=forged.value")
            .body(empty())
            .unwrap();
        let response = h.send(request).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "OK");
    }
}

#[tokio::test]
async fn anonymous_request_forces_login_with_script() {
    // GIVEN: no session, no token, not whitelisted
    let h = Harness::offline();
    let request = get("app.example.com", "/dash?x=1").body(empty()).unwrap();

    // WHEN
    let response = h.send(request).await;

    // THEN: configured status and a script redirect to /launch on the gateway host
    assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
    assert_eq!(
        response.headers().get(header::CACHE_CONTROL).unwrap(),
        "no-cache, no-store, must-revalidate"
    );
    let body = body_string(response).await;
    assert!(body.contains("window.location.replace"));
    assert!(body.contains(
        "https://beyond.example.com/launch?next=https%3A%2F%2Fapp.example.com%2Fdash%3Fx%3D1"
    ));
}

#[tokio::test]
async fn scripted_requests_get_empty_forced_login() {
    let h = Harness::offline();
    for (name, value) in [("x-requested-with", "XMLHttpRequest"), ("upgrade", "websocket")] {
        let request = get("app.example.com", "/api").header(name, value).body(empty()).unwrap();
        let response = h.send(request).await;
        assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
        assert_eq!(body_string(response).await, "");
    }
}

#[tokio::test]
async fn whitelisted_request_is_forwarded_anonymously() {
    let h = Harness::offline();
    let request = get("status.example.com", "/public/index.html").body(empty()).unwrap();
    let response = h.send(request).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("x-upstream-host").unwrap(), "status.example.com");
    assert_eq!(body_string(response).await, "-");

    // Method outside the rule is not whitelisted
    let request = get("status.example.com", "/public/index.html")
        .method("POST")
        .body(empty())
        .unwrap();
    assert_eq!(h.send(request).await.status(), StatusCode::IM_A_TEAPOT);
}

#[tokio::test]
async fn dot_segments_cannot_escape_the_whitelist() {
    let h = Harness::offline();

    // GIVEN: /public/* is whitelisted, /admin/secret is not
    for path in [
        "/public/../admin/secret",
        "/public/%2e%2e/admin/secret",
        "/public/.%2E/admin/secret",
        "/public/x/../../admin/secret",
    ] {
        // WHEN: an anonymous request climbs out of /public
        let request = get("status.example.com", path).body(empty()).unwrap();
        let response = h.send(request).await;

        // THEN: it is judged on the resolved path and must log in
        assert_eq!(response.status(), StatusCode::IM_A_TEAPOT, "{path}");
        assert!(!response.headers().contains_key("x-upstream-path"), "{path}");
    }
}

#[tokio::test]
async fn whitelist_star_does_not_cross_segments() {
    let h = Harness::offline();
    let request = get("status.example.com", "/public/deeper/page").body(empty()).unwrap();
    assert_eq!(h.send(request).await.status(), StatusCode::IM_A_TEAPOT);
}

#[tokio::test]
async fn whitelisted_request_forwards_normalized_path() {
    let h = Harness::offline();
    let request = get("status.example.com", "//public/./docs/../index.html?v=2")
        .body(empty())
        .unwrap();
    let response = h.send(request).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("x-upstream-path").unwrap(),
        "/public/index.html?v=2"
    );
}

#[tokio::test]
async fn dot_segments_cannot_slip_past_the_fence() {
    let h = Harness::offline();
    let joe = h.session_cookie("joe@example.com");

    // GIVEN: /private/* on app.example.com admits only alice
    for path in ["/private/doc", "/./private/doc", "//private/doc", "/%70rivate/doc", "/x/../private/doc"] {
        let request = get("app.example.com", path)
            .header(header::COOKIE, joe.clone())
            .body(empty())
            .unwrap();
        let response = h.send(request).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN, "{path}");
    }

    // Alice gets the canonical path upstream
    let request = get("app.example.com", "/./private/doc")
        .header(header::COOKIE, h.session_cookie("alice@example.com"))
        .body(empty())
        .unwrap();
    let response = h.send(request).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("x-upstream-path").unwrap(), "/private/doc");
}

#[tokio::test]
async fn encoded_separators_are_rejected() {
    let h = Harness::offline();
    for path in ["/public/..%2fadmin", "/public/..%5Cadmin"] {
        let request = get("status.example.com", path).body(empty()).unwrap();
        assert_eq!(h.send(request).await.status(), StatusCode::BAD_REQUEST, "{path}");
    }
}

#[tokio::test]
async fn session_user_is_propagated() {
    let h = Harness::offline();
    let request = get("app.example.com", "/")
        .header(header::COOKIE, h.session_cookie("joe@example.com"))
        .body(empty())
        .unwrap();
    let response = h.send(request).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "joe@example.com");
}

#[tokio::test]
async fn client_supplied_identity_header_is_dropped() {
    let h = Harness::offline();

    // GIVEN: an anonymous, whitelisted request claiming to be admin
    let request = get("status.example.com", "/public/x")
        .header("Beyond-User", "admin@example.com")
        .body(empty())
        .unwrap();
    assert_eq!(body_string(h.send(request).await).await, "-");

    // GIVEN: a logged-in request claiming to be someone else
    let request = get("app.example.com", "/")
        .header(header::COOKIE, h.session_cookie("joe@example.com"))
        .header("Beyond-User", "admin@example.com")
        .body(empty())
        .unwrap();
    assert_eq!(body_string(h.send(request).await).await, "joe@example.com");
}

#[tokio::test]
async fn static_token_authenticates_without_session() {
    let h = Harness::offline();
    let basic = common::basic("x-oauth", "ci-secret");
    for authorization in ["Bearer ci-secret", "token ci-secret", basic.as_str()] {
        let request = get("app.example.com", "/api/builds")
            .header(header::AUTHORIZATION, authorization)
            .body(empty())
            .unwrap();
        let response = h.send(request).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "ci@example.com");
    }

    let request = get("app.example.com", "/api/builds")
        .header(header::AUTHORIZATION, "Bearer wrong")
        .header("x-requested-with", "XMLHttpRequest")
        .body(empty())
        .unwrap();
    assert_eq!(h.send(request).await.status(), StatusCode::IM_A_TEAPOT);
}

#[tokio::test]
async fn fence_denies_unlisted_principal() {
    let h = Harness::offline();

    let request = get("admin.example.com", "/")
        .header(header::COOKIE, h.session_cookie("joe@example.com"))
        .body(empty())
        .unwrap();
    let response = h.send(request).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_string(response).await, "Access Denied");

    let request = get("admin.example.com", "/")
        .header(header::COOKIE, h.session_cookie("amy@ops.example.com"))
        .body(empty())
        .unwrap();
    let response = h.send(request).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "amy@ops.example.com");
}

#[tokio::test]
async fn gateway_host_serves_only_login_paths() {
    let h = Harness::offline();
    let request = get("beyond.example.com", "/anything")
        .header(header::COOKIE, h.session_cookie("joe@example.com"))
        .body(empty())
        .unwrap();
    assert_eq!(h.send(request).await.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn callback_without_session_is_forbidden() {
    let h = Harness::offline();
    let request = get("beyond.example.com", "/oidc?state=abc&code=good").body(empty()).unwrap();
    let response = h.send(request).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_string(response).await, "Invalid Browser State");
}

#[tokio::test]
async fn login_handshake_end_to_end() {
    let h = Harness::offline();

    // GIVEN: the browser starts a login
    let request = get("beyond.example.com", "/launch?next=https%3A%2F%2Fapp.example.com%2Fdash")
        .body(empty())
        .unwrap();
    let response = h.send(request).await;
    assert_eq!(response.status(), StatusCode::OK);
    let cookie = cookie_from_set_cookie(response.headers());
    let body = body_string(response).await;
    let state = body
        .split("state=")
        .nth(1)
        .and_then(|rest| rest.get(..64))
        .unwrap()
        .to_string();

    // WHEN: a forged state comes back, the login is refused
    let request = get("beyond.example.com", "/oidc?state=deadbeef&code=good")
        .header(header::COOKIE, cookie.clone())
        .body(empty())
        .unwrap();
    assert_eq!(h.send(request).await.status(), StatusCode::FORBIDDEN);

    // WHEN: the real state comes back
    let request = get("beyond.example.com", &format!("/oidc?state={state}&code=good"))
        .header(header::COOKIE, cookie)
        .body(empty())
        .unwrap();
    let response = h.send(request).await;

    // THEN: redirected to next with a logged-in session
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(
        response.headers().get(header::LOCATION).unwrap(),
        "https://app.example.com/dash"
    );
    let cookie = cookie_from_set_cookie(response.headers());

    let request = get("app.example.com", "/dash")
        .header(header::COOKIE, cookie)
        .body(empty())
        .unwrap();
    let response = h.send(request).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "joe@example.com");
}

#[tokio::test]
async fn failed_code_exchange_is_unauthorized() {
    let h = Harness::offline();
    let response = h
        .send(get("beyond.example.com", "/launch").body(empty()).unwrap())
        .await;
    let cookie = cookie_from_set_cookie(response.headers());
    let state = h
        .sessions
        .load(&{
            let mut headers = axum::http::HeaderMap::new();
            headers.insert(header::COOKIE, cookie.clone());
            headers
        })
        .and_then(|s| s.state)
        .unwrap();

    let request = get("beyond.example.com", &format!("/oidc?state={state}&code=expired"))
        .header(header::COOKIE, cookie)
        .body(empty())
        .unwrap();
    let response = h.send(request).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(body_string(response).await.contains("invalid_grant"));
}

#[tokio::test]
async fn invalid_listen_address_fails() {
    assert!(beyond::gateway::bind_listener(":").await.is_err());
    assert!(beyond::gateway::bind_listener("not-an-address").await.is_err());
}
