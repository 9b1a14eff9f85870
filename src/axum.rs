//! Axum integration utilities.

use std::convert::Infallible;
use std::future::poll_fn;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use crate::error::Error;
use crate::guard::{require_authenticated, require_role};
use crate::identity::Identity;
use crate::middleware::IdentityResolver;
use crate::role::Role;
use crate::store::UserDirectory;

use ::axum::body::Body;
use ::axum::extract::FromRequestParts;
use ::axum::http::request::Parts;
use ::axum::http::{Request, StatusCode};
use ::axum::response::{IntoResponse, Response};
use ::http::HeaderValue;
use ::http::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use ::tower::{Layer, Service};

/// Middleware layer that resolves the caller once per request and inserts
/// the resulting [`Identity`] into the request extensions.
#[derive(Debug)]
pub struct IdentityLayer<D> {
    resolver: Arc<IdentityResolver<D>>,
}

impl<D> Clone for IdentityLayer<D> {
    fn clone(&self) -> Self {
        Self {
            resolver: self.resolver.clone(),
        }
    }
}

impl<D> IdentityLayer<D> {
    /// Creates a new identity layer.
    pub fn new(resolver: Arc<IdentityResolver<D>>) -> Self {
        Self { resolver }
    }
}

impl<D, Inner> Layer<Inner> for IdentityLayer<D> {
    type Service = IdentityService<Inner, D>;

    fn layer(&self, inner: Inner) -> Self::Service {
        IdentityService {
            inner,
            resolver: self.resolver.clone(),
        }
    }
}

/// Middleware service that attaches a fresh [`Identity`] to every request.
#[derive(Debug)]
pub struct IdentityService<Inner, D> {
    inner: Inner,
    resolver: Arc<IdentityResolver<D>>,
}

impl<Inner: Clone, D> Clone for IdentityService<Inner, D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            resolver: self.resolver.clone(),
        }
    }
}

impl<Inner, D> Service<Request<Body>> for IdentityService<Inner, D>
where
    Inner: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    Inner::Future: Send + 'static,
    D: UserDirectory + 'static,
{
    type Response = Response;
    type Error = Inner::Error;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let mut inner = self.inner.clone();
        let resolver = self.resolver.clone();

        Box::pin(async move {
            let header = req
                .headers()
                .get(AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                .map(str::to_owned);

            match resolver.resolve_authorization(header.as_deref()).await {
                Ok(identity) => {
                    req.extensions_mut().insert(identity);
                    poll_fn(|cx| inner.poll_ready(cx)).await?;
                    inner.call(req).await
                }
                Err(err) => {
                    tracing::error!(error = %err, "identity resolution failed");
                    Ok(err.into_response())
                }
            }
        })
    }
}

/// Route-level gate that requires the resolved identity to hold a role.
///
/// Must run inside an [`IdentityLayer`]; without one every caller is
/// anonymous and gets 401.
#[derive(Debug, Clone)]
pub struct RequireRoleLayer {
    role: Role,
}

impl RequireRoleLayer {
    /// Creates a new role gate.
    pub fn new(role: Role) -> Self {
        Self { role }
    }
}

impl<Inner> Layer<Inner> for RequireRoleLayer {
    type Service = RequireRoleService<Inner>;

    fn layer(&self, inner: Inner) -> Self::Service {
        RequireRoleService {
            inner,
            role: self.role.clone(),
        }
    }
}

/// Middleware service that enforces a role requirement.
#[derive(Debug, Clone)]
pub struct RequireRoleService<Inner> {
    inner: Inner,
    role: Role,
}

impl<Inner> Service<Request<Body>> for RequireRoleService<Inner>
where
    Inner: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    Inner::Future: Send + 'static,
{
    type Response = Response;
    type Error = Inner::Error;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let mut inner = self.inner.clone();
        let role = self.role.clone();

        Box::pin(async move {
            let allowed = match req.extensions().get::<Identity>() {
                Some(identity) => require_role(identity, &role),
                None => Err(Error::Unauthorized),
            };
            match allowed {
                Ok(()) => {
                    poll_fn(|cx| inner.poll_ready(cx)).await?;
                    inner.call(req).await
                }
                Err(err) => Ok(err.into_response()),
            }
        })
    }
}

/// The caller of the current request; anonymous when no [`IdentityLayer`] ran.
#[derive(Debug, Clone)]
pub struct CurrentIdentity(pub Identity);

impl<S> FromRequestParts<S> for CurrentIdentity
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(
            parts
                .extensions
                .get::<Identity>()
                .cloned()
                .unwrap_or_default(),
        ))
    }
}

/// An authenticated caller; rejects anonymous requests with 401.
#[derive(Debug, Clone)]
pub struct Authenticated(pub Identity);

impl<S> FromRequestParts<S> for Authenticated
where
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let identity = parts
            .extensions
            .get::<Identity>()
            .cloned()
            .unwrap_or_default();
        require_authenticated(&identity)?;
        Ok(Self(identity))
    }
}

impl Error {
    /// HTTP status this error is reported with.
    pub fn status(&self) -> StatusCode {
        match self {
            Error::Unauthorized | Error::InvalidCredentials | Error::Token(_) => {
                StatusCode::UNAUTHORIZED
            }
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::NotFound(_) | Error::SubjectNotFound(_) => StatusCode::NOT_FOUND,
            Error::AccountExists(_) => StatusCode::CONFLICT,
            Error::InvalidId(_) | Error::InvalidRole(_) => StatusCode::BAD_REQUEST,
            Error::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Store(_)
            | Error::WeakSigningKey { .. }
            | Error::Config(_)
            | Error::PasswordHash(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            return (status, "internal error").into_response();
        }
        let mut res = (status, self.to_string()).into_response();
        if status == StatusCode::UNAUTHORIZED {
            res.headers_mut()
                .insert(WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }
        res
    }
}
