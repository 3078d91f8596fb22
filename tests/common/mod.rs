#![allow(dead_code)]

use std::sync::Arc;

use actix_web::{body::MessageBody, dev::{Service, ServiceResponse}, http::StatusCode, test};
use serde_json::{json, Value};

use schooldesk::auth::{hash_password, JwtKeys, Role};
use schooldesk::models::{EducationStage, NewParent, NewStudent, NewTeacher, NewUser, Parent, Student, StudentStatus, Teacher, User};
use schooldesk::repo::inmem::InMemRepo;
use schooldesk::repo::{ParentRepo, StudentRepo, TeacherRepo, UserRepo};
use schooldesk::AppState;

pub const TEST_SECRET: &[u8] = b"test-secret";
pub const PASSWORD: &str = "password123";

/// Build the full application around a state value.
#[macro_export]
macro_rules! app {
    ($state:expr) => {
        actix_web::test::init_service(
            actix_web::App::new()
                .app_data(actix_web::web::Data::new($state))
                .configure(schooldesk::config),
        )
        .await
    };
}

/// Fresh in-memory store plus a state sharing it.
pub struct Ctx {
    pub repo: InMemRepo,
    pub state: AppState,
}

pub fn ctx() -> Ctx {
    let repo = InMemRepo::new();
    let state = AppState::new(Arc::new(repo.clone()), JwtKeys::new(TEST_SECRET, chrono::Duration::hours(8))).with_password_cost(4);
    Ctx { repo, state }
}

impl Ctx {
    pub fn token(&self, user: &User) -> String {
        self.state.jwt.issue(user.id, user.role, &user.username).unwrap()
    }

    pub async fn user(&self, username: &str, role: Role, teacher_id: Option<i64>) -> User {
        self.repo
            .create_user(NewUser {
                username: username.into(),
                password_hash: hash_password(PASSWORD, 4).unwrap(),
                role,
                teacher_id,
                email: String::new(),
                phone: String::new(),
                force_password_change: false,
            })
            .await
            .unwrap()
    }

    pub async fn admin_token(&self) -> String {
        let admin = self.user("admin", Role::Admin, None).await;
        self.token(&admin)
    }

    pub async fn teacher(&self, code: &str) -> Teacher {
        self.repo.create_teacher(new_teacher(code)).await.unwrap()
    }

    /// Teacher record plus a linked login.
    pub async fn teacher_login(&self, code: &str) -> (Teacher, User, String) {
        let teacher = self.teacher(code).await;
        let user = self.user(&format!("kru.{}", code.to_lowercase()), Role::Teacher, Some(teacher.id)).await;
        let token = self.token(&user);
        (teacher, user, token)
    }

    pub async fn parent_login(&self, email: &str) -> (Parent, String) {
        let parent = self
            .repo
            .create_parent(NewParent {
                email: email.into(),
                phone: "0811111111".into(),
                password_hash: hash_password(PASSWORD, 4).unwrap(),
                name: "Mae Malee".into(),
                pdpa_ok: true,
            })
            .await
            .unwrap();
        let token = self.state.jwt.issue(parent.id, Role::Parent, &parent.name).unwrap();
        (parent, token)
    }

    pub async fn student(&self, code: &str, grade: &str, room: &str) -> Student {
        let mut s = new_student(code);
        s.grade = grade.into();
        s.room = room.into();
        self.repo.create_student(s).await.unwrap()
    }
}

pub fn new_student(code: &str) -> NewStudent {
    NewStudent {
        student_code: code.into(),
        national_id: "1103700012345".into(),
        prefix: "ด.ช.".into(),
        first_name: "Somchai".into(),
        last_name: "Jaidee".into(),
        birth_date: None,
        education_stage: EducationStage::Primary,
        grade: "P.1".into(),
        room: "1".into(),
        address: "12/3 Moo 4".into(),
        phone: "0812345678".into(),
        status: StudentStatus::Active,
    }
}

pub fn new_teacher(code: &str) -> NewTeacher {
    NewTeacher {
        teacher_code: code.into(),
        prefix: "Mrs.".into(),
        first_name: "Somsri".into(),
        last_name: "Rakdee".into(),
        phone: "0898765432".into(),
        email: format!("{}@school.ac.th", code.to_lowercase()),
        position: "Teacher".into(),
    }
}

pub fn student_json(code: &str) -> Value {
    json!({
        "student_code": code,
        "national_id": "1103700012345",
        "prefix": "ด.ญ.",
        "first_name": "Malee",
        "last_name": "Sukjai",
        "birth_date": "2016-02-29",
        "education_stage": "primary",
        "grade": "P.2",
        "room": "3",
        "address": "99 Moo 1",
        "phone": "081-234-5678",
    })
}

pub fn teacher_json(code: &str, email: &str) -> Value {
    json!({
        "teacher_code": code,
        "prefix": "Mr.",
        "first_name": "Anan",
        "last_name": "Suk-Jai",
        "phone": "021234567",
        "email": email,
        "position": "Teacher",
    })
}

pub fn bearer(token: &str) -> (&'static str, String) {
    ("Authorization", format!("Bearer {token}"))
}

/// Call the service and decode the body as JSON (`Null` when empty).
pub async fn send<S, R, B>(app: &S, req: R) -> (StatusCode, Value)
where
    S: Service<R, Response = ServiceResponse<B>, Error = actix_web::Error>,
    B: MessageBody,
{
    let resp = test::call_service(app, req).await;
    let status = resp.status();
    let body = test::read_body(resp).await;
    let value = if body.is_empty() { Value::Null } else { serde_json::from_slice(&body).unwrap() };
    (status, value)
}
