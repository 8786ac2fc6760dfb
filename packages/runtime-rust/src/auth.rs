//! Bearer-token propagation.
//!
//! [`BearerTokenWrapper`] stamps outgoing requests with an `authorization`
//! metadata entry; [`RequireBearer`] rejects incoming requests without one.
//! Token verification itself is left to the application.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;
use xmicro_core::{Message, Request, Response};

pub use xmicro_core::envelope::{extract_token_from_auth_header, generate_auth_header};

use crate::client::{Client, ClientError, ClientOptions, ClientWrapper};
use crate::server::{HandlerWrapper, RequestHandler, ServerError};

/// Name under which [`RequireBearer`] is installed as a server wrapper.
pub const AUTH_WRAPPER: &str = "auth";

/// Client wrapper adding a fixed bearer token to every call.
#[derive(Debug, Clone)]
pub struct BearerTokenWrapper {
    token: String,
}

impl BearerTokenWrapper {
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }
}

impl ClientWrapper for BearerTokenWrapper {
    fn wrap(&self, client: Arc<dyn Client>) -> Arc<dyn Client> {
        Arc::new(BearerTokenClient {
            inner: client,
            token: self.token.clone(),
        })
    }
}

pub struct BearerTokenClient {
    inner: Arc<dyn Client>,
    token: String,
}

#[async_trait]
impl Client for BearerTokenClient {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn options(&self) -> ClientOptions {
        self.inner.options()
    }

    fn init(&self, options: ClientOptions) {
        self.inner.init(options);
    }

    async fn call(&self, mut request: Request) -> Result<Response, ClientError> {
        // An explicit per-request token wins.
        if request.bearer_token().is_none() {
            request.set_bearer_token(&self.token);
        }
        self.inner.call(request).await
    }

    async fn publish(&self, topic: &str, message: Message) -> Result<(), ClientError> {
        self.inner.publish(topic, message).await
    }
}

/// Server wrapper rejecting requests without a well-formed bearer token.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequireBearer;

impl HandlerWrapper for RequireBearer {
    fn wrap(&self, inner: Arc<dyn RequestHandler>) -> Arc<dyn RequestHandler> {
        Arc::new(RequireBearerHandler { inner })
    }
}

struct RequireBearerHandler {
    inner: Arc<dyn RequestHandler>,
}

#[async_trait]
impl RequestHandler for RequireBearerHandler {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn serve(&self, request: Request) -> Result<Response, ServerError> {
        if request.bearer_token().is_none() {
            debug!(endpoint = %request.endpoint, "rejecting request without bearer token");
            return Err(ServerError::Unauthorized);
        }
        self.inner.serve(request).await
    }
}
