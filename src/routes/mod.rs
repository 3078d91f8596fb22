use std::sync::Arc;

use actix_web::{web, HttpResponse};
use serde::Serialize;

use crate::auth::JwtKeys;
use crate::error::ApiError;
use crate::rate_limit::LoginThrottle;
use crate::repo::{Repo, RepoError};
use crate::security::RequireRoles;

pub mod accounts;
pub mod attendance;
pub mod auth;
pub mod calendar;
pub mod dashboard;
pub mod homerooms;
pub mod leave;
pub mod moves;
pub mod parent;
pub mod school;
pub mod students;
pub mod teacher_profile;
pub mod teachers;

#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<dyn Repo>,
    pub jwt: JwtKeys,
    pub password_cost: u32,
    pub login_throttle: LoginThrottle,
}

impl AppState {
    pub fn new(repo: Arc<dyn Repo>, jwt: JwtKeys) -> Self {
        Self { repo, jwt, password_cost: bcrypt::DEFAULT_COST, login_throttle: LoginThrottle::disabled() }
    }

    pub fn with_password_cost(mut self, cost: u32) -> Self {
        self.password_cost = cost;
        self
    }

    pub fn with_login_throttle(mut self, throttle: LoginThrottle) -> Self {
        self.login_throttle = throttle;
        self
    }

    /// Code-length policy `(teacher, student)` from the school record; 0 when unset.
    pub async fn code_limits(&self) -> Result<(usize, usize), ApiError> {
        match self.repo.get_school().await {
            Ok(s) => Ok((s.teacher_code_digits.max(0) as usize, s.student_code_digits.max(0) as usize)),
            Err(RepoError::NotFound) => Ok((0, 0)),
            Err(e) => Err(e.into()),
        }
    }
}

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::JsonConfig::default().limit(4 * 1024 * 1024).error_handler(|err, _req| {
        log::debug!("rejected json body: {err}");
        ApiError::INVALID_PAYLOAD.into()
    }))
    .app_data(web::PathConfig::default().error_handler(|_err, _req| ApiError::INVALID_ID.into()))
    .app_data(web::QueryConfig::default().error_handler(|err, _req| {
        log::debug!("rejected query string: {err}");
        ApiError::INVALID_PAYLOAD.into()
    }));

    cfg.route("/health", web::get().to(health))
        .service(
            web::scope("/auth")
                .route("/staff/login", web::post().to(auth::staff_login))
                .route("/parent/register", web::post().to(auth::parent_register))
                .route("/parent/login", web::post().to(auth::parent_login))
                .route("/me", web::get().to(auth::me)),
        )
        // must precede the guarded /admin scope
        .service(web::resource("/admin/login").route(web::post().to(auth::admin_login)))
        .service(
            web::scope("/admin")
                .wrap(RequireRoles::admin())
                .route("/dashboard/summary", web::get().to(dashboard::summary))
                .service(
                    web::resource("/teacher-accounts")
                        .route(web::get().to(accounts::list))
                        .route(web::post().to(accounts::create)),
                )
                .route("/teacher-accounts/{id}", web::patch().to(accounts::set_flags))
                .route("/teacher-accounts/{id}/reset", web::post().to(accounts::reset_password)),
        )
        .service(
            web::scope("/school").wrap(RequireRoles::admin()).service(
                web::resource("")
                    .route(web::get().to(school::get))
                    .route(web::post().to(school::create))
                    .route(web::put().to(school::update))
                    .route(web::delete().to(school::delete)),
            ),
        )
        .service(
            web::scope("/students")
                .wrap(RequireRoles::admin())
                .service(
                    web::resource("")
                        .route(web::get().to(students::list))
                        .route(web::post().to(students::create)),
                )
                .route("/import", web::post().to(students::import))
                .route("/move/single", web::post().to(moves::move_single))
                .route("/move/bulk", web::post().to(moves::move_bulk))
                .service(
                    web::resource("/{id}")
                        .route(web::get().to(students::get))
                        .route(web::put().to(students::update))
                        .route(web::delete().to(students::delete)),
                ),
        )
        .service(
            web::scope("/teachers")
                .wrap(RequireRoles::admin())
                .service(
                    web::resource("")
                        .route(web::get().to(teachers::list))
                        .route(web::post().to(teachers::create)),
                )
                .route("/import", web::post().to(teachers::import))
                .service(
                    web::resource("/{id}")
                        .route(web::get().to(teachers::get))
                        .route(web::put().to(teachers::update))
                        .route(web::delete().to(teachers::delete)),
                ),
        )
        .service(
            web::scope("/homerooms")
                .wrap(RequireRoles::admin())
                .service(
                    web::resource("")
                        .route(web::get().to(homerooms::list))
                        .route(web::post().to(homerooms::create)),
                )
                .service(
                    web::resource("/{id}")
                        .route(web::get().to(homerooms::get))
                        .route(web::put().to(homerooms::update))
                        .route(web::delete().to(homerooms::delete)),
                ),
        )
        .service(
            web::scope("/moves")
                .wrap(RequireRoles::admin())
                .service(
                    web::resource("")
                        .route(web::get().to(moves::list))
                        .route(web::post().to(moves::dispatch)),
                )
                .service(
                    web::resource("/{id}")
                        .route(web::get().to(moves::get))
                        .route(web::put().to(moves::update))
                        .route(web::delete().to(moves::delete)),
                ),
        )
        .service(
            web::scope("/calendar")
                .wrap(RequireRoles::admin())
                .service(
                    web::resource("")
                        .route(web::get().to(calendar::list))
                        .route(web::post().to(calendar::create)),
                )
                .service(
                    web::resource("/{segment}")
                        .route(web::get().to(calendar::get_segment))
                        .route(web::post().to(calendar::create_kind)),
                )
                .service(
                    web::resource("/{kind}/{id}")
                        .route(web::put().to(calendar::update))
                        .route(web::delete().to(calendar::delete)),
                ),
        )
        .service(
            web::scope("/teacher")
                .wrap(RequireRoles::staff())
                .route("/me", web::get().to(teacher_profile::me))
                .service(
                    web::resource("/profile")
                        .route(web::get().to(teacher_profile::get_profile))
                        .route(web::put().to(teacher_profile::update_profile)),
                )
                .route("/password/change", web::post().to(teacher_profile::change_password))
                .route("/students-summary", web::get().to(teacher_profile::students_summary))
                .route("/attendance", web::get().to(attendance::list))
                .route("/attendance/mark", web::post().to(attendance::mark))
                .route("/dashboard/daily", web::get().to(dashboard::daily))
                .service(
                    web::resource("/leave-requests")
                        .route(web::get().to(leave::list))
                        .route(web::post().to(leave::create)),
                )
                .route("/leave-requests/pending-count", web::get().to(leave::pending_count))
                .route("/leave-requests/{id}/approve", web::post().to(leave::approve))
                .route("/leave-requests/{id}/reject", web::post().to(leave::reject)),
        )
        .service(
            web::scope("/parent")
                .wrap(RequireRoles::parent())
                .route("/me", web::get().to(parent::me))
                .service(
                    web::resource("/leave-requests")
                        .route(web::get().to(parent::list_leaves))
                        .route(web::post().to(parent::submit_leave)),
                ),
        );
}

pub async fn health() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({ "status": "ok" }))
}

pub(crate) fn created<T: Serialize>(body: &T) -> HttpResponse {
    HttpResponse::Created().json(body)
}
