#![cfg(feature = "inmem-store")]

#[macro_use]
mod common;

use actix_web::{http::StatusCode, test};
use common::{bearer, ctx, send, student_json};
use schooldesk::repo::StudentRepo;
use serde_json::json;

#[actix_web::test]
async fn student_crud_round() {
    let c = ctx();
    let token = c.admin_token().await;
    let app = app!(c.state.clone());

    let req = test::TestRequest::post().uri("/students").insert_header(bearer(&token)).set_json(student_json("S-100")).to_request();
    let (status, created) = send(&app, req).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["status"], "active");
    let id = created["id"].as_i64().unwrap();

    let req = test::TestRequest::post().uri("/students").insert_header(bearer(&token)).set_json(student_json("S-100")).to_request();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "STUDENT_CODE_EXISTS");

    // blank fields keep what is stored
    let req = test::TestRequest::put()
        .uri(&format!("/students/{id}"))
        .insert_header(bearer(&token))
        .set_json(json!({ "room": "4", "first_name": "" }))
        .to_request();
    let (status, updated) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["room"], "4");
    assert_eq!(updated["first_name"], "Malee");

    let req = test::TestRequest::get().uri("/students?q=mal&room=4").insert_header(bearer(&token)).to_request();
    let (_, page) = send(&app, req).await;
    assert_eq!(page["total"], 1);
    assert_eq!(page["size"], 20);

    let req = test::TestRequest::delete().uri(&format!("/students/{id}")).insert_header(bearer(&token)).to_request();
    let (status, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let req = test::TestRequest::get().uri(&format!("/students/{id}")).insert_header(bearer(&token)).to_request();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "NOT_FOUND");

    let req = test::TestRequest::get().uri("/students/abc").insert_header(bearer(&token)).to_request();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "INVALID_ID");
}

#[actix_web::test]
async fn invalid_fields_are_listed() {
    let c = ctx();
    let token = c.admin_token().await;
    let app = app!(c.state.clone());

    let mut bad = student_json("S-1");
    bad["phone"] = json!("12");
    bad["education_stage"] = json!("university");
    let req = test::TestRequest::post().uri("/students").insert_header(bearer(&token)).set_json(bad).to_request();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "VALIDATION_ERROR");
    assert!(body["fields"]["phone"].is_string());
    assert!(body["fields"]["education_stage"].is_string());

    let req = test::TestRequest::post()
        .uri("/students")
        .insert_header(bearer(&token))
        .insert_header(("Content-Type", "application/json"))
        .set_payload("{not json")
        .to_request();
    let (_, body) = send(&app, req).await;
    assert_eq!(body["error"], "INVALID_PAYLOAD");
}

#[actix_web::test]
async fn import_with_one_bad_row_inserts_nothing() {
    let c = ctx();
    let token = c.admin_token().await;
    let app = app!(c.state.clone());

    let mut second = student_json("S-2");
    second["room"] = json!("A1");
    let rows = json!([student_json("S-1"), second, student_json("S-3")]);
    let req = test::TestRequest::post().uri("/students/import").insert_header(bearer(&token)).set_json(rows).to_request();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "BULK_VALIDATION_ERROR");
    let issues = body["issues"].as_array().unwrap();
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0]["index"], 1);
    assert!(issues[0]["fields"]["room"].is_string());
    assert_eq!(c.repo.count_students().await.unwrap(), 0);
}

#[actix_web::test]
async fn import_flags_in_file_and_stored_duplicates() {
    let c = ctx();
    c.student("S-9", "P.1", "1").await;
    let token = c.admin_token().await;
    let app = app!(c.state.clone());

    let rows = json!([student_json("S-1"), student_json("S-1"), student_json("S-9")]);
    let req = test::TestRequest::post().uri("/students/import").insert_header(bearer(&token)).set_json(rows).to_request();
    let (_, body) = send(&app, req).await;
    let issues = body["issues"].as_array().unwrap();
    assert_eq!(issues.len(), 2);
    assert_eq!(issues[0]["index"], 1);
    assert_eq!(issues[0]["fields"]["student_code"], "duplicate of row 0 in this file");
    assert_eq!(issues[1]["index"], 2);
    assert_eq!(issues[1]["fields"]["student_code"], "already exists");

    let rows = json!([student_json("S-1"), student_json("S-2")]);
    let req = test::TestRequest::post().uri("/students/import").insert_header(bearer(&token)).set_json(rows).to_request();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["inserted"], 2);
    assert_eq!(c.repo.count_students().await.unwrap(), 3);
}

#[actix_web::test]
async fn school_code_length_caps_student_codes() {
    let c = ctx();
    let token = c.admin_token().await;
    let app = app!(c.state.clone());

    let school = json!({
        "school_code": "SCH01",
        "school_name": "Ban Nong School",
        "address": "1 Moo 2, Tambon Nai",
        "phone": "042-123456",
        "education_level": "primary",
        "code_lengths": { "teacher_code_digits": 4, "student_code_digits": 5 },
    });
    let req = test::TestRequest::post().uri("/school").insert_header(bearer(&token)).set_json(&school).to_request();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["code_lengths"]["student_code_digits"], 5);

    let req = test::TestRequest::post().uri("/school").insert_header(bearer(&token)).set_json(&school).to_request();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "EXISTS");

    let req = test::TestRequest::post().uri("/students").insert_header(bearer(&token)).set_json(student_json("S-12345")).to_request();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["fields"]["student_code"].is_string());

    let req = test::TestRequest::post().uri("/students").insert_header(bearer(&token)).set_json(student_json("S-123")).to_request();
    let (status, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::CREATED);
}

#[actix_web::test]
async fn far_pages_are_empty() {
    let c = ctx();
    c.student("S-1", "P.1", "1").await;
    let token = c.admin_token().await;
    let app = app!(c.state.clone());

    let req = test::TestRequest::get()
        .uri("/students?page=9223372036854775807&size=100")
        .insert_header(bearer(&token))
        .to_request();
    let (status, page) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["total"], 1);
    assert!(page["data"].as_array().unwrap().is_empty());
}
