use actix_web::body::EitherBody;
use actix_web::dev::{Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::Error;
use futures_util::future::{ready, LocalBoxFuture, Ready};
use std::rc::Rc;

use crate::auth::{claims_from_request, Role};
use crate::error::ApiError;

/// Route-group guard: authenticates the bearer token and admits only the listed roles.
/// Verified claims are left in the request extensions for the `Auth` extractor.
#[derive(Clone)]
pub struct RequireRoles {
    allowed: Rc<[Role]>,
}

impl RequireRoles {
    pub fn new(allowed: &[Role]) -> Self {
        Self { allowed: allowed.into() }
    }

    pub fn admin() -> Self { Self::new(&[Role::Admin]) }
    pub fn staff() -> Self { Self::new(&[Role::Teacher, Role::Admin]) }
    pub fn parent() -> Self { Self::new(&[Role::Parent]) }
}

impl<S, B> Transform<S, ServiceRequest> for RequireRoles
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type InitError = ();
    type Transform = RequireRolesMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RequireRolesMiddleware {
            service: Rc::new(service),
            allowed: self.allowed.clone(),
        }))
    }
}

pub struct RequireRolesMiddleware<S> {
    service: Rc<S>,
    allowed: Rc<[Role]>,
}

impl<S, B> Service<ServiceRequest> for RequireRolesMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &self,
        ctx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.service.poll_ready(ctx)
    }

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let svc = self.service.clone();
        let allowed = self.allowed.clone();
        Box::pin(async move {
            let denied = match claims_from_request(req.request()) {
                Ok(claims) if allowed.contains(&claims.role) => None,
                Ok(claims) => {
                    tracing::debug!(sub = claims.sub, role = claims.role.as_str(), path = %req.path(), "role not admitted");
                    Some(ApiError::FORBIDDEN)
                }
                Err(e) => Some(e),
            };
            match denied {
                None => svc.call(req).await.map(ServiceResponse::map_into_left_body),
                Some(err) => Ok(req.error_response(err).map_into_right_body()),
            }
        })
    }
}
