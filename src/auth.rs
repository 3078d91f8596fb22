use actix_web::{dev::Payload, http::header, web, Error, FromRequest, HttpMessage, HttpRequest};
use actix_web_httpauth::extractors::bearer::BearerAuth;
use jsonwebtoken::{decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use std::future::{ready, Ready};

use crate::error::ApiError;
use crate::models::{Id, UnknownVariant};
use crate::routes::AppState;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Teacher,
    Parent,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Teacher => "teacher",
            Role::Parent => "parent",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = UnknownVariant;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Role::Admin),
            "teacher" => Ok(Role::Teacher),
            "parent" => Ok(Role::Parent),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

impl TryFrom<String> for Role {
    type Error = UnknownVariant;
    fn try_from(s: String) -> Result<Self, Self::Error> { s.parse() }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Id,
    pub role: Role,
    pub name: String,
    pub iat: i64,
    pub exp: i64,
}

/// HS256 signing material and token lifetime.
#[derive(Clone)]
pub struct JwtKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: chrono::Duration,
}

impl JwtKeys {
    pub fn new(secret: &[u8], ttl: chrono::Duration) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            ttl,
        }
    }

    /// Create a token for an authenticated principal.
    pub fn issue(&self, sub: Id, role: Role, name: &str) -> Result<String, ApiError> {
        let now = chrono::Utc::now();
        let claims = Claims {
            sub,
            role,
            name: name.to_string(),
            iat: now.timestamp(),
            exp: (now + self.ttl).timestamp(),
        };
        self.sign(&claims)
    }

    pub fn sign(&self, claims: &Claims) -> Result<String, ApiError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding).map_err(|e| {
            log::error!("token signing failed: {e}");
            ApiError::Internal("TOKEN_GEN_FAILED")
        })
    }

    /// Validate signature, algorithm and expiry.
    pub fn verify(&self, token: &str) -> Result<Claims, ApiError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        decode::<Claims>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => ApiError::Unauthorized("TOKEN_EXPIRED"),
                _ => ApiError::Unauthorized("INVALID_TOKEN"),
            })
    }
}

/// Resolve the caller's claims: reuse what a role guard already attached, else decode the header.
pub fn claims_from_request(req: &HttpRequest) -> Result<Claims, ApiError> {
    if let Some(claims) = req.extensions().get::<Claims>() {
        return Ok(claims.clone());
    }
    if !req.headers().contains_key(header::AUTHORIZATION) {
        return Err(ApiError::Unauthorized("MISSING_AUTH_HEADER"));
    }
    let bearer = BearerAuth::from_request(req, &mut Payload::None)
        .into_inner()
        .map_err(|_| ApiError::Unauthorized("INVALID_AUTH_HEADER"))?;
    let state = req
        .app_data::<web::Data<AppState>>()
        .ok_or(ApiError::Internal("STATE_MISSING"))?;
    let claims = state.jwt.verify(bearer.token())?;
    req.extensions_mut().insert(claims.clone());
    Ok(claims)
}

/// Extractor yielding validated `Claims`.
pub struct Auth(pub Claims);

impl Auth {
    pub fn user_id(&self) -> Id { self.0.sub }
    pub fn role(&self) -> Role { self.0.role }
}

impl FromRequest for Auth {
    type Error = Error;
    type Future = Ready<Result<Self, Error>>;

    fn from_request(req: &HttpRequest, _pl: &mut Payload) -> Self::Future {
        ready(claims_from_request(req).map(Auth).map_err(Error::from))
    }
}

pub fn hash_password(plain: &str, cost: u32) -> Result<String, ApiError> {
    bcrypt::hash(plain, cost).map_err(|e| {
        log::error!("password hashing failed: {e}");
        ApiError::Internal("HASH_FAILED")
    })
}

pub fn verify_password(plain: &str, hash: &str) -> bool {
    bcrypt::verify(plain, hash).unwrap_or(false)
}

/// Random alphanumeric password handed out once on an account reset.
pub fn one_time_password(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> JwtKeys {
        JwtKeys::new(b"unit-test-secret", chrono::Duration::hours(8))
    }

    #[test]
    fn issued_token_round_trips() {
        let k = keys();
        let token = k.issue(7, Role::Teacher, "krusomsri").unwrap();
        let claims = k.verify(&token).unwrap();
        assert_eq!(claims.sub, 7);
        assert_eq!(claims.role, Role::Teacher);
        assert_eq!(claims.exp - claims.iat, 8 * 3600);
    }

    #[test]
    fn expired_and_foreign_tokens_are_rejected() {
        let k = keys();
        let now = chrono::Utc::now().timestamp();
        let stale = Claims { sub: 1, role: Role::Admin, name: "a".into(), iat: now - 7200, exp: now - 3600 };
        let token = k.sign(&stale).unwrap();
        assert_eq!(k.verify(&token).unwrap_err().code(), "TOKEN_EXPIRED");

        let other = JwtKeys::new(b"another-secret", chrono::Duration::hours(1));
        let token = other.issue(1, Role::Admin, "a").unwrap();
        assert_eq!(k.verify(&token).unwrap_err().code(), "INVALID_TOKEN");

        let hs512 = encode(
            &Header::new(Algorithm::HS512),
            &Claims { sub: 1, role: Role::Admin, name: "a".into(), iat: now, exp: now + 60 },
            &EncodingKey::from_secret(b"unit-test-secret"),
        )
        .unwrap();
        assert_eq!(k.verify(&hs512).unwrap_err().code(), "INVALID_TOKEN");
    }

    #[test]
    fn password_hash_verifies() {
        let h = hash_password("correct horse", 4).unwrap();
        assert!(verify_password("correct horse", &h));
        assert!(!verify_password("wrong", &h));
        assert!(!verify_password("x", "not-a-hash"));
    }

    #[test]
    fn one_time_passwords_have_requested_length() {
        let p = one_time_password(12);
        assert_eq!(p.len(), 12);
        assert!(p.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
