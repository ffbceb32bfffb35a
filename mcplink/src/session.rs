//! The single logical session an HTTP transport serves.
use crate::config::COMPATIBILITY_PROTOCOL_VERSION;
use crate::util::{is_visible_ascii, random_token};
use axum::http::StatusCode;
use std::net::IpAddr;
use std::sync::Mutex;
use tracing::*;

/// Who is making a request, as established by the authorizer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Principal {
    pub id: String,
    pub scopes: Vec<String>,
}

impl Principal {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            scopes: vec![],
        }
    }

    pub fn with_scopes(mut self, scopes: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Session {
    pub id: String,
    pub owner_address: IpAddr,
    pub principal: Principal,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionOutcome {
    /// A new session was minted; the caller has to tell the client its ID
    Created(String),
    Existing(String),
}

impl SessionOutcome {
    pub fn session_id(&self) -> &str {
        match self {
            SessionOutcome::Created(id) | SessionOutcome::Existing(id) => id,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SessionRejection {
    #[error("Bad request: {0}")]
    BadRequest(&'static str),

    #[error("Session not found")]
    NotFound,

    #[error("Session belongs to a different principal")]
    Forbidden,
}

impl SessionRejection {
    pub fn status(&self) -> StatusCode {
        match self {
            SessionRejection::BadRequest(_) => StatusCode::BAD_REQUEST,
            SessionRejection::NotFound => StatusCode::NOT_FOUND,
            SessionRejection::Forbidden => StatusCode::FORBIDDEN,
        }
    }
}

#[derive(Debug)]
struct SessionState {
    session: Option<Session>,

    /// ID of the most recently terminated session, so a client still using it gets "not found"
    /// rather than "bad request"
    last_terminated: Option<String>,
    protocol_version: String,
}

#[derive(Debug)]
pub struct SessionManager {
    id_bytes: usize,
    strict_protocol_version: bool,
    state: Mutex<SessionState>,
}

impl SessionManager {
    pub fn new(id_bytes: usize, strict_protocol_version: bool) -> Self {
        Self {
            id_bytes,
            strict_protocol_version,
            state: Mutex::new(SessionState {
                session: None,
                last_terminated: None,
                protocol_version: COMPATIBILITY_PROTOCOL_VERSION.to_string(),
            }),
        }
    }

    /// Check an incoming HTTP request against the session, creating the session if this is the
    /// initialize request that starts it.
    #[instrument(skip(self, principal), fields(principal = %principal.id))]
    pub fn validate(
        &self,
        remote_address: IpAddr,
        principal: &Principal,
        session_id: Option<&str>,
        protocol_version: Option<&str>,
        initializing: bool,
    ) -> Result<SessionOutcome, SessionRejection> {
        if session_id.is_some_and(|id| !is_visible_ascii(id)) {
            return Err(SessionRejection::BadRequest("invalid session id"));
        }
        if protocol_version.is_some_and(|v| !is_visible_ascii(v)) {
            return Err(SessionRejection::BadRequest("invalid protocol version"));
        }

        let mut state = self.lock();
        let Some(session) = state.session.clone() else {
            if initializing {
                let id = random_token(self.id_bytes);
                debug!(session_id = %id, "Created session");
                state.session = Some(Session {
                    id: id.clone(),
                    owner_address: remote_address,
                    principal: principal.clone(),
                });
                state.last_terminated = None;
                return Ok(SessionOutcome::Created(id));
            }

            return match (session_id, &state.last_terminated) {
                (Some(presented), Some(last)) if presented == last => {
                    Err(SessionRejection::NotFound)
                }
                _ => Err(SessionRejection::BadRequest("no session")),
            };
        };

        let Some(presented) = session_id else {
            return Err(SessionRejection::BadRequest("missing session id"));
        };
        if presented != session.id || remote_address != session.owner_address {
            debug!(%remote_address, "Session ID or address mismatch");
            return Err(SessionRejection::NotFound);
        }
        if *principal != session.principal {
            return Err(SessionRejection::Forbidden);
        }

        if !initializing {
            match protocol_version {
                Some(version) if version != state.protocol_version => {
                    return Err(SessionRejection::BadRequest("protocol version mismatch"));
                }
                None if self.strict_protocol_version => {
                    return Err(SessionRejection::BadRequest("missing protocol version"));
                }
                _ => {}
            }
        }

        Ok(SessionOutcome::Existing(session.id))
    }

    /// End the session, if there is one.  With `record`, the terminated ID is remembered so later
    /// use of it is reported as "not found".  Safe to call repeatedly.
    pub fn terminate(&self, record: bool) -> Option<String> {
        let mut state = self.lock();
        let terminated = state.session.take().map(|session| session.id);

        match (&terminated, record) {
            (Some(id), true) => state.last_terminated = Some(id.clone()),
            (_, false) => state.last_terminated = None,
            (None, true) => {}
        }
        state.protocol_version = COMPATIBILITY_PROTOCOL_VERSION.to_string();

        if let Some(id) = &terminated {
            debug!(session_id = %id, record, "Terminated session");
        }
        terminated
    }

    pub fn set_protocol_version(&self, version: impl Into<String>) {
        self.lock().protocol_version = version.into();
    }

    pub fn protocol_version(&self) -> String {
        self.lock().protocol_version.clone()
    }

    pub fn session(&self) -> Option<Session> {
        self.lock().session.clone()
    }

    pub fn session_id(&self) -> Option<String> {
        self.lock().session.as_ref().map(|session| session.id.clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LATEST_PROTOCOL_VERSION;
    use assert_matches::assert_matches;

    const A: IpAddr = IpAddr::V4(std::net::Ipv4Addr::new(127, 0, 0, 1));
    const B: IpAddr = IpAddr::V4(std::net::Ipv4Addr::new(10, 0, 0, 2));

    fn created(manager: &SessionManager, principal: &Principal) -> String {
        match manager.validate(A, principal, None, None, true) {
            Ok(SessionOutcome::Created(id)) => id,
            other => panic!("expected a new session, got {other:?}"),
        }
    }

    #[test]
    fn requests_without_session_are_bad_requests() {
        let manager = SessionManager::new(32, false);
        let p = Principal::new("default");

        for _ in 0..2 {
            assert_matches!(
                manager.validate(A, &p, None, None, false),
                Err(SessionRejection::BadRequest(_))
            );
        }
        assert_matches!(
            manager.validate(A, &p, Some("X"), None, false),
            Err(SessionRejection::BadRequest(_))
        );
    }

    #[test]
    fn session_identity_is_bound_to_address_and_principal() {
        let manager = SessionManager::new(32, false);
        let p = Principal::new("p");
        let id = created(&manager, &p);

        assert_matches!(
            manager.validate(A, &p, Some(&id), None, false),
            Ok(SessionOutcome::Existing(existing)) if existing == id
        );

        let err = manager.validate(B, &p, Some(&id), None, false).unwrap_err();
        assert_eq!(err, SessionRejection::NotFound);
        assert_eq!(err.status(), StatusCode::NOT_FOUND);

        let err = manager
            .validate(A, &Principal::new("q"), Some(&id), None, false)
            .unwrap_err();
        assert_eq!(err, SessionRejection::Forbidden);
        assert_eq!(err.status(), StatusCode::FORBIDDEN);

        assert_matches!(
            manager.validate(A, &p, Some("X"), None, false),
            Err(SessionRejection::NotFound)
        );
        assert_matches!(
            manager.validate(A, &p, None, None, false),
            Err(SessionRejection::BadRequest(_))
        );
    }

    #[test]
    fn header_values_must_be_visible_ascii() {
        let manager = SessionManager::new(32, false);
        let p = Principal::new("p");
        assert_matches!(
            manager.validate(A, &p, Some("has space"), None, true),
            Err(SessionRejection::BadRequest(_))
        );
        assert_matches!(
            manager.validate(A, &p, None, Some("2025-06-18\u{7f}"), true),
            Err(SessionRejection::BadRequest(_))
        );
    }

    #[test]
    fn protocol_version_header_checks() {
        let manager = SessionManager::new(16, false);
        let p = Principal::new("p");
        let id = created(&manager, &p);
        manager.set_protocol_version(LATEST_PROTOCOL_VERSION);

        assert_matches!(
            manager.validate(A, &p, Some(&id), Some(LATEST_PROTOCOL_VERSION), false),
            Ok(_)
        );
        assert_matches!(
            manager.validate(A, &p, Some(&id), Some(COMPATIBILITY_PROTOCOL_VERSION), false),
            Err(SessionRejection::BadRequest("protocol version mismatch"))
        );
        // Missing header is tolerated by default
        assert_matches!(manager.validate(A, &p, Some(&id), None, false), Ok(_));

        let strict = SessionManager::new(16, true);
        let id = created(&strict, &p);
        assert_matches!(
            strict.validate(A, &p, Some(&id), None, false),
            Err(SessionRejection::BadRequest("missing protocol version"))
        );
    }

    #[test]
    fn termination_is_idempotent() {
        let manager = SessionManager::new(32, false);
        let p = Principal::new("p");
        let id = created(&manager, &p);
        manager.set_protocol_version(LATEST_PROTOCOL_VERSION);

        assert_eq!(manager.terminate(true), Some(id.clone()));
        assert_eq!(manager.protocol_version(), COMPATIBILITY_PROTOCOL_VERSION);

        // The terminated id is now "not found", anything else "bad request"
        assert_matches!(
            manager.validate(A, &p, Some(&id), None, false),
            Err(SessionRejection::NotFound)
        );
        assert_matches!(
            manager.validate(A, &p, Some("other"), None, false),
            Err(SessionRejection::BadRequest(_))
        );

        // Second termination is a no-op
        assert_eq!(manager.terminate(true), None);
        assert_eq!(manager.session(), None);
        assert_matches!(
            manager.validate(A, &p, Some(&id), None, false),
            Err(SessionRejection::NotFound)
        );

        // Terminating without recording forgets the id
        assert_eq!(manager.terminate(false), None);
        assert_matches!(
            manager.validate(A, &p, Some(&id), None, false),
            Err(SessionRejection::BadRequest(_))
        );
    }

    #[test]
    fn new_session_after_termination() {
        let manager = SessionManager::new(32, false);
        let p = Principal::new("p");
        let first = created(&manager, &p);
        manager.terminate(true);

        let second = created(&manager, &p);
        assert_ne!(first, second);
        assert_eq!(manager.session_id(), Some(second));
    }
}
