#![cfg(feature = "inmem-store")]

#[macro_use]
mod common;

use actix_web::{http::StatusCode, test};
use common::{bearer, ctx, send, teacher_json};
use schooldesk::repo::{TeacherRepo, UserRepo};
use serde_json::json;

#[actix_web::test]
async fn teacher_codes_and_emails_stay_unique() {
    let c = ctx();
    let token = c.admin_token().await;
    let app = app!(c.state.clone());

    let req = test::TestRequest::post().uri("/teachers").insert_header(bearer(&token)).set_json(teacher_json("T01", "Anan@School.ac.th")).to_request();
    let (status, created) = send(&app, req).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["email"], "anan@school.ac.th");

    let req = test::TestRequest::post().uri("/teachers").insert_header(bearer(&token)).set_json(teacher_json("T02", "ANAN@school.ac.th")).to_request();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "DUP_CODE_OR_EMAIL");

    // updating a teacher with its own email is fine
    let id = created["id"].as_i64().unwrap();
    let req = test::TestRequest::put()
        .uri(&format!("/teachers/{id}"))
        .insert_header(bearer(&token))
        .set_json(json!({ "email": "anan@school.ac.th", "position": "Head of Science" }))
        .to_request();
    let (status, updated) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["position"], "Head of Science");

    let req = test::TestRequest::get().uri("/teachers?q=science").insert_header(bearer(&token)).to_request();
    let (_, page) = send(&app, req).await;
    assert_eq!(page["total"], 1);
}

#[actix_web::test]
async fn teacher_import_checks_emails_in_file() {
    let c = ctx();
    let token = c.admin_token().await;
    let app = app!(c.state.clone());

    let rows = json!([teacher_json("T01", "a@school.ac.th"), teacher_json("T02", "A@school.ac.th")]);
    let req = test::TestRequest::post().uri("/teachers/import").insert_header(bearer(&token)).set_json(rows).to_request();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["issues"][0]["index"], 1);
    assert!(body["issues"][0]["fields"]["email"].is_string());
    assert_eq!(c.repo.count_teachers().await.unwrap(), 0);
}

fn homeroom(teacher: serde_json::Value, room: &str, position: &str) -> serde_json::Value {
    json!({
        "academic_year": "2568",
        "education_stage": "primary",
        "grade": "P.1",
        "room": room,
        "position": position,
        "teacher_id": teacher,
    })
}

#[actix_web::test]
async fn homeroom_rules_hold() {
    let c = ctx();
    let t1 = c.teacher("T01").await;
    let t2 = c.teacher("T02").await;
    let token = c.admin_token().await;
    let app = app!(c.state.clone());

    // teacher referenced by code
    let req = test::TestRequest::post().uri("/homerooms").insert_header(bearer(&token)).set_json(homeroom(json!("T01"), "1", "main")).to_request();
    let (status, first) = send(&app, req).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(first["teacher_id"], t1.id);
    assert_eq!(first["status"], "active");

    let req = test::TestRequest::post().uri("/homerooms").insert_header(bearer(&token)).set_json(homeroom(json!(t2.id), "1", "main")).to_request();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "DUP_CLASS_POSITION");

    let req = test::TestRequest::post().uri("/homerooms").insert_header(bearer(&token)).set_json(homeroom(json!(t1.id.to_string()), "2", "main")).to_request();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "TEACHER_ALREADY_MAIN");

    let req = test::TestRequest::post().uri("/homerooms").insert_header(bearer(&token)).set_json(homeroom(json!("NOPE"), "2", "main")).to_request();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "TEACHER_NOT_FOUND");

    // re-saving the same row is not a conflict with itself
    let id = first["id"].as_i64().unwrap();
    let req = test::TestRequest::put()
        .uri(&format!("/homerooms/{id}"))
        .insert_header(bearer(&token))
        .set_json(json!({ "note": "moved to building B" }))
        .to_request();
    let (status, updated) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["note"], "moved to building B");
    assert_eq!(updated["room"], "1");

    let req = test::TestRequest::get().uri(&format!("/homerooms?teacher_id={}", t1.id)).insert_header(bearer(&token)).to_request();
    let (_, page) = send(&app, req).await;
    assert_eq!(page["total"], 1);
    assert_eq!(page["data"][0]["teacher_name"], "Mrs. Somsri Rakdee");
}

#[actix_web::test]
async fn homeroom_field_errors_come_first() {
    let c = ctx();
    let token = c.admin_token().await;
    let app = app!(c.state.clone());

    let mut bad = homeroom(json!("NOPE"), "1234", "head");
    bad["academic_year"] = json!("68");
    let req = test::TestRequest::post().uri("/homerooms").insert_header(bearer(&token)).set_json(bad).to_request();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    for f in ["academic_year", "room", "position"] {
        assert!(body["fields"][f].is_string(), "missing {f}");
    }
}

#[actix_web::test]
async fn deleting_a_teacher_frees_their_homeroom() {
    let c = ctx();
    let (t1, account, _) = c.teacher_login("T01").await;
    c.teacher("T02").await;
    let token = c.admin_token().await;
    let app = app!(c.state.clone());

    let req = test::TestRequest::post().uri("/homerooms").insert_header(bearer(&token)).set_json(homeroom(json!("T01"), "1", "main")).to_request();
    let (status, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::CREATED);

    let req = test::TestRequest::delete().uri(&format!("/teachers/{}", t1.id)).insert_header(bearer(&token)).to_request();
    let (status, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let req = test::TestRequest::post().uri("/homerooms").insert_header(bearer(&token)).set_json(homeroom(json!("T02"), "1", "main")).to_request();
    let (status, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::CREATED);

    let req = test::TestRequest::get().uri("/homerooms").insert_header(bearer(&token)).to_request();
    let (_, page) = send(&app, req).await;
    assert_eq!(page["total"], 1);
    // the login survives, unlinked
    assert_eq!(c.repo.get_user(account.id).await.unwrap().teacher_id, None);
}
