#![cfg(feature = "inmem-store")]

#[macro_use]
mod common;

use actix_web::{http::StatusCode, test};
use common::{bearer, ctx, send};
use schooldesk::models::{LeaveDecision, LeaveStatus, LeaveType, NewLeaveRequest};
use schooldesk::repo::LeaveRepo;
use serde_json::json;

#[actix_web::test]
async fn marking_resolves_leave_aliases() {
    let c = ctx();
    let s = c.student("S-1", "P.1", "1").await;
    let (_, user, token) = c.teacher_login("T01").await;
    let app = app!(c.state.clone());

    let req = test::TestRequest::post()
        .uri("/teacher/attendance/mark")
        .insert_header(bearer(&token))
        .set_json(json!({ "studentId": s.id.to_string(), "date": "2025-06-02", "status": "sick_leave" }))
        .to_request();
    let (status, row) = send(&app, req).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(row["status"], "leave");
    assert_eq!(row["note"], "sick");
    assert!(row["time"].is_null());
    assert_eq!(row["operator"], user.username);

    let req = test::TestRequest::post()
        .uri("/teacher/attendance/mark")
        .insert_header(bearer(&token))
        .set_json(json!({ "student_id": s.id, "date": "2025-06-03", "status": "late", "operator": "Kru Anan" }))
        .to_request();
    let (_, row) = send(&app, req).await;
    assert_eq!(row["status"], "late");
    assert!(row["time"].is_string());
    assert_eq!(row["operator"], "Kru Anan");

    let req = test::TestRequest::get()
        .uri(&format!("/teacher/attendance?studentId={}&statuses=sick_leave", s.id))
        .insert_header(bearer(&token))
        .to_request();
    let (_, rows) = send(&app, req).await;
    assert_eq!(rows.as_array().unwrap().len(), 1);
    assert_eq!(rows[0]["date"], "2025-06-02");
}

#[actix_web::test]
async fn marking_checks_input_in_order() {
    let c = ctx();
    let (_, _, token) = c.teacher_login("T01").await;
    let app = app!(c.state.clone());

    let cases = [
        (json!({ "date": "2025-06-02", "status": "present" }), "MISSING_FIELDS"),
        (json!({ "student_id": "abc", "date": "2025-06-02", "status": "present" }), "INVALID_ID"),
        (json!({ "student_id": 999, "date": "2025-06-02", "status": "present" }), "STUDENT_NOT_FOUND"),
    ];
    for (body, code) in cases {
        let req = test::TestRequest::post().uri("/teacher/attendance/mark").insert_header(bearer(&token)).set_json(body).to_request();
        let (_, resp) = send(&app, req).await;
        assert_eq!(resp["error"], code);
    }

    let req = test::TestRequest::post()
        .uri("/teacher/attendance/mark")
        .insert_header(bearer(&token))
        .set_json(json!({ "student_id": 999, "date": "2025-06-02", "status": "asleep" }))
        .to_request();
    let (status, resp) = send(&app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(resp["fields"]["status"].is_string());
}

#[actix_web::test]
async fn daily_view_merges_attendance_with_approved_leave() {
    let c = ctx();
    let a = c.student("S-1", "P.1", "1").await;
    let b = c.student("S-2", "P.1", "1").await;
    let other = c.student("S-3", "P.2", "1").await;
    let (_, _, token) = c.teacher_login("T01").await;
    let app = app!(c.state.clone());

    for (student, status) in [(a.id, "present"), (b.id, "late")] {
        let req = test::TestRequest::post()
            .uri("/teacher/attendance/mark")
            .insert_header(bearer(&token))
            .set_json(json!({ "student_id": student, "date": "2025-06-02", "status": status }))
            .to_request();
        send(&app, req).await;
    }

    for student in [a.id, other.id] {
        let leave = c
            .repo
            .create_leave(NewLeaveRequest {
                student_id: student,
                parent_id: None,
                leave_type: LeaveType::Personal,
                reason: "family trip".into(),
                date_from: "2025-06-01".parse().unwrap(),
                date_to: "2025-06-03".parse().unwrap(),
                attachments: vec![],
            })
            .await
            .unwrap();
        c.repo
            .decide_leave(leave.id, LeaveDecision { status: LeaveStatus::Approved, decided_by: "admin".into(), reject_reason: None })
            .await
            .unwrap();
    }

    let req = test::TestRequest::get()
        .uri("/teacher/dashboard/daily?date=2025-06-02&classroom=P.1/1")
        .insert_header(bearer(&token))
        .to_request();
    let (status, view) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["holiday"]["isHoliday"], false);
    let rows = view["rows"].as_array().unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["student_id"], a.id);
    assert_eq!(rows[0]["status"], "leave");
    assert_eq!(rows[0]["note"], "personal business");
    assert!(rows[0]["id"].as_str().unwrap().starts_with("leave-2025-06-02-"));
    assert!(rows[0]["student_name"].as_str().unwrap().contains("Somchai"));
    assert_eq!(rows[1]["status"], "late");

    let req = test::TestRequest::get().uri("/teacher/dashboard/daily?date=2025-06-02").insert_header(bearer(&token)).to_request();
    let (_, view) = send(&app, req).await;
    assert_eq!(view["rows"].as_array().unwrap().len(), 3);
}

#[actix_web::test]
async fn daily_view_flags_holidays() {
    let c = ctx();
    let admin = c.admin_token().await;
    let app = app!(c.state.clone());

    let req = test::TestRequest::post()
        .uri("/calendar/holidays")
        .insert_header(bearer(&admin))
        .set_json(json!({ "name": "Visakha Bucha", "start_date": "2025-05-11", "end_date": "2025-05-12" }))
        .to_request();
    send(&app, req).await;

    let req = test::TestRequest::get().uri("/teacher/dashboard/daily?date=2025-05-12").insert_header(bearer(&admin)).to_request();
    let (_, view) = send(&app, req).await;
    assert_eq!(view["holiday"]["isHoliday"], true);
    assert_eq!(view["holiday"]["name"], "Visakha Bucha");

    let req = test::TestRequest::get().uri("/teacher/dashboard/daily?date=12-05-2025").insert_header(bearer(&admin)).to_request();
    let (status, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let req = test::TestRequest::get().uri("/admin/dashboard/summary").insert_header(bearer(&admin)).to_request();
    let (status, counts) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(counts["students"], 0);
}

#[actix_web::test]
async fn daily_view_keeps_the_most_recent_mark() {
    let c = ctx();
    let s = c.student("S-1", "P.1", "1").await;
    let (_, _, token) = c.teacher_login("T01").await;
    let app = app!(c.state.clone());

    for status in ["absent", "late"] {
        let req = test::TestRequest::post()
            .uri("/teacher/attendance/mark")
            .insert_header(bearer(&token))
            .set_json(json!({ "student_id": s.id, "date": "2025-06-04", "status": status }))
            .to_request();
        let (status, _) = send(&app, req).await;
        assert_eq!(status, StatusCode::CREATED);
    }

    let req = test::TestRequest::get().uri("/teacher/dashboard/daily?date=2025-06-04").insert_header(bearer(&token)).to_request();
    let (_, view) = send(&app, req).await;
    let rows = view["rows"].as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["status"], "late");
    assert!(rows[0]["time"].is_string());
}
