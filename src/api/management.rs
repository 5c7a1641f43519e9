// Management API handlers - runtime edits to the credential pools

use axum::{
    body::Bytes,
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::error::{ProxyError, ProxyResult};
use crate::proxy::credentials::{mask_credential, CredentialStore};

/// Which pool a management request addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pool {
    ApiKeys,
    AuthTokens,
}

impl Pool {
    fn label(self) -> &'static str {
        match self {
            Pool::ApiKeys => "API Key",
            Pool::AuthTokens => "Auth token",
        }
    }

    fn list(self, store: &CredentialStore) -> Vec<String> {
        match self {
            Pool::ApiKeys => store.list_api_keys(),
            Pool::AuthTokens => store.list_auth_tokens(),
        }
    }

    fn add(self, store: &CredentialStore, value: &str) -> bool {
        match self {
            Pool::ApiKeys => store.add_api_key(value),
            Pool::AuthTokens => store.add_auth_token(value),
        }
    }

    fn remove(self, store: &CredentialStore, value: &str) -> bool {
        match self {
            Pool::ApiKeys => store.remove_api_key(value),
            Pool::AuthTokens => store.remove_auth_token(value),
        }
    }
}

#[derive(Debug, Serialize)]
struct MaskedCredential {
    id: String,
}

/// GET lists masked entries, POST adds and DELETE removes the credential sent
/// as the raw text body.
pub fn handle(
    store: &CredentialStore,
    pool: Pool,
    method: &Method,
    body: &Bytes,
) -> ProxyResult<Response> {
    match *method {
        Method::GET => {
            let masked: Vec<MaskedCredential> = pool
                .list(store)
                .iter()
                .map(|c| MaskedCredential {
                    id: mask_credential(c),
                })
                .collect();
            Ok(Json(masked).into_response())
        }
        Method::POST => {
            let value = credential_from_body(pool, body)?;
            if !pool.add(store, &value) {
                tracing::debug!("{} {} already present", pool.label(), mask_credential(&value));
            }
            Ok((StatusCode::CREATED, format!("{} added", pool.label())).into_response())
        }
        Method::DELETE => {
            let value = credential_from_body(pool, body)?;
            if !pool.remove(store, &value) {
                tracing::debug!("{} {} was not present", pool.label(), mask_credential(&value));
            }
            Ok((StatusCode::OK, format!("{} removed", pool.label())).into_response())
        }
        _ => Err(ProxyError::ManagementMethodNotAllowed),
    }
}

fn credential_from_body(pool: Pool, body: &Bytes) -> ProxyResult<String> {
    let value = String::from_utf8_lossy(body).trim().to_string();
    if value.is_empty() {
        return Err(ProxyError::BadRequest(format!(
            "{} must not be empty",
            pool.label()
        )));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> CredentialStore {
        CredentialStore::new(
            vec!["AIzaSyA1234567890abcd".to_string()],
            vec!["client-token".to_string()],
        )
    }

    #[test]
    fn post_trims_and_adds() {
        let store = store();
        let response = handle(
            &store,
            Pool::ApiKeys,
            &Method::POST,
            &Bytes::from_static(b"  new-key-0000000000\n"),
        )
        .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(
            store.list_api_keys(),
            vec!["AIzaSyA1234567890abcd", "new-key-0000000000"]
        );
    }

    #[test]
    fn empty_body_is_rejected() {
        let err = handle(&store(), Pool::AuthTokens, &Method::POST, &Bytes::from_static(b" \n"))
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn delete_removes_from_the_right_pool() {
        let store = store();
        let response = handle(
            &store,
            Pool::AuthTokens,
            &Method::DELETE,
            &Bytes::from_static(b"client-token"),
        )
        .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(store.list_auth_tokens().is_empty());
        assert_eq!(store.list_api_keys().len(), 1);
    }

    #[test]
    fn other_verbs_are_refused() {
        let err = handle(&store(), Pool::ApiKeys, &Method::PUT, &Bytes::new()).unwrap_err();
        assert!(matches!(err, ProxyError::ManagementMethodNotAllowed));
    }
}
