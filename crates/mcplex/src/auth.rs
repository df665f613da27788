use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use http::{StatusCode, header};

use crate::store::UserId;

/// Verified user identity, set as a request extension by [`authenticate`].
/// Absence means anonymous; anonymous requests still reach global handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthUser(pub UserId);

pub trait TokenVerifier: Send + Sync + 'static {
	fn verify(&self, token: &str) -> Option<UserId>;
}

/// Token table sourced from the config file. Deployments with a real
/// identity provider implement [`TokenVerifier`] in front of it instead.
#[derive(Debug, Default)]
pub struct StaticTokens {
	tokens: HashMap<String, UserId>,
}

impl StaticTokens {
	pub fn new(tokens: HashMap<String, UserId>) -> Self {
		Self { tokens }
	}
}

impl TokenVerifier for StaticTokens {
	fn verify(&self, token: &str) -> Option<UserId> {
		self.tokens.get(token).copied()
	}
}

/// Bearer-token middleware. A valid token becomes an [`AuthUser`] extension;
/// no token passes through anonymously; a present-but-invalid token is
/// rejected so a user expecting their overrides never silently falls back.
pub async fn authenticate(
	State(verifier): State<Arc<dyn TokenVerifier>>,
	mut request: Request,
	next: Next,
) -> Response {
	let token = request
		.headers()
		.get(header::AUTHORIZATION)
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.strip_prefix("Bearer "));
	match token {
		None => next.run(request).await,
		Some(token) => match verifier.verify(token) {
			Some(user) => {
				request.extensions_mut().insert(AuthUser(user));
				next.run(request).await
			},
			None => (StatusCode::UNAUTHORIZED, "invalid bearer token").into_response(),
		},
	}
}
