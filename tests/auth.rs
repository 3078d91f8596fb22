#![cfg(feature = "inmem-store")]

#[macro_use]
mod common;

use actix_web::{http::StatusCode, test};
use common::{bearer, ctx, send, PASSWORD};
use schooldesk::auth::{Claims, JwtKeys, Role};
use schooldesk::rate_limit::{LoginThrottle, LoginThrottleConfig};
use schooldesk::repo::UserRepo;
use schooldesk::models::AccountFlags;
use serde_json::json;

#[actix_web::test]
async fn staff_login_issues_a_usable_token() {
    let c = ctx();
    let admin = c.user("admin", Role::Admin, None).await;
    let app = app!(c.state.clone());

    let req = test::TestRequest::post()
        .uri("/auth/staff/login")
        .set_json(json!({ "identifier": "admin", "password": PASSWORD }))
        .to_request();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["token_type"], "Bearer");
    assert_eq!(body["user"]["role"], "admin");
    let token = body["token"].as_str().unwrap().to_string();

    let req = test::TestRequest::get().uri("/auth/me").insert_header(bearer(&token)).to_request();
    let (status, me) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(me["id"], admin.id);
    assert_eq!(me["role"], "admin");

    let stored = c.repo.get_user(admin.id).await.unwrap();
    assert!(stored.last_login.is_some());
}

#[actix_web::test]
async fn wrong_password_gets_no_token() {
    let c = ctx();
    c.user("admin", Role::Admin, None).await;
    let app = app!(c.state.clone());

    let req = test::TestRequest::post()
        .uri("/auth/staff/login")
        .set_json(json!({ "username": "admin", "password": "nope-nope" }))
        .to_request();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "INVALID_CREDENTIALS");
    assert!(body.get("token").is_none());

    let req = test::TestRequest::post().uri("/auth/staff/login").set_json(json!({ "username": "admin" })).to_request();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "MISSING_FIELDS");
}

#[actix_web::test]
async fn disabled_accounts_and_non_admins_are_refused() {
    let c = ctx();
    let (_, user, _) = c.teacher_login("T01").await;
    let app = app!(c.state.clone());

    let login = |uri: &'static str| {
        test::TestRequest::post().uri(uri).set_json(json!({ "username": user.username, "password": PASSWORD })).to_request()
    };
    let (status, body) = send(&app, login("/admin/login")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "FORBIDDEN");

    c.repo.set_account_flags(user.id, AccountFlags { enabled: Some(false), ..Default::default() }).await.unwrap();
    let (status, body) = send(&app, login("/auth/staff/login")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "ACCOUNT_DISABLED");
}

#[actix_web::test]
async fn role_guards_and_token_errors() {
    let c = ctx();
    let (_, _, teacher_token) = c.teacher_login("T01").await;
    let app = app!(c.state.clone());

    let req = test::TestRequest::get().uri("/students").insert_header(bearer(&teacher_token)).to_request();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "FORBIDDEN");

    let req = test::TestRequest::get().uri("/students").to_request();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "MISSING_AUTH_HEADER");

    let req = test::TestRequest::get().uri("/students").insert_header(("Authorization", "Token abc")).to_request();
    let (_, body) = send(&app, req).await;
    assert_eq!(body["error"], "INVALID_AUTH_HEADER");

    let now = chrono::Utc::now().timestamp();
    let stale = Claims { sub: 1, role: Role::Admin, name: "admin".into(), iat: now - 7200, exp: now - 3600 };
    let expired = c.state.jwt.sign(&stale).unwrap();
    let req = test::TestRequest::get().uri("/students").insert_header(bearer(&expired)).to_request();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "TOKEN_EXPIRED");

    let forged = JwtKeys::new(b"someone-else", chrono::Duration::hours(1)).issue(1, Role::Admin, "admin").unwrap();
    let req = test::TestRequest::get().uri("/students").insert_header(bearer(&forged)).to_request();
    let (_, body) = send(&app, req).await;
    assert_eq!(body["error"], "INVALID_TOKEN");

    // teachers may use the teacher group
    let req = test::TestRequest::get().uri("/teacher/leave-requests/pending-count").insert_header(bearer(&teacher_token)).to_request();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 0);
}

#[actix_web::test]
async fn parent_registers_logs_in_and_is_kept_out_of_staff_routes() {
    let c = ctx();
    let app = app!(c.state.clone());

    let register = json!({ "email": "Mother@Example.com", "phone": "0811111111", "password": "longenough", "name": "Mae", "pdpa_ok": true });
    let req = test::TestRequest::post().uri("/auth/parent/register").set_json(&register).to_request();
    let (status, parent) = send(&app, req).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(parent["email"], "mother@example.com");
    assert!(parent.get("password_hash").is_none());

    let req = test::TestRequest::post().uri("/auth/parent/register").set_json(&register).to_request();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "EMAIL_EXISTS");

    let req = test::TestRequest::post()
        .uri("/auth/parent/register")
        .set_json(json!({ "email": "dad@example.com", "password": "short" }))
        .to_request();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["fields"]["password"].is_string());

    let req = test::TestRequest::post()
        .uri("/auth/parent/login")
        .set_json(json!({ "email": "mother@example.com", "password": "longenough" }))
        .to_request();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    let token = body["token"].as_str().unwrap().to_string();

    let req = test::TestRequest::get().uri("/parent/me").insert_header(bearer(&token)).to_request();
    let (status, me) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(me["name"], "Mae");

    let req = test::TestRequest::get().uri("/teacher/attendance").insert_header(bearer(&token)).to_request();
    let (status, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[actix_web::test]
async fn repeated_failures_are_throttled() {
    let c = ctx();
    c.user("admin", Role::Admin, None).await;
    let throttle = LoginThrottle::new(LoginThrottleConfig { limit: 2, window: std::time::Duration::from_secs(60) });
    let app = app!(c.state.clone().with_login_throttle(throttle));

    let attempt = || {
        test::TestRequest::post().uri("/auth/staff/login").set_json(json!({ "username": "admin", "password": "bad-guess" })).to_request()
    };
    for _ in 0..2 {
        let (status, _) = send(&app, attempt()).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
    let (status, body) = send(&app, attempt()).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"], "LOGIN_RATE_LIMITED");
}

#[actix_web::test]
async fn health_is_public() {
    let c = ctx();
    let app = app!(c.state.clone());
    let (status, body) = send(&app, test::TestRequest::get().uri("/health").to_request()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}
