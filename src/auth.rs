//! Session handling and the auth interceptor wrapped around every request.
//!
//! The runtime never acquires or refreshes tokens. It reads the current
//! session from a [`SessionSource`], attaches the bearer token, and on a 401
//! tears the session down once and asks the [`Navigator`] to show sign-in.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard};

use serde_json::Value;
use tracing::{debug, info};

use crate::error::ApiError;
use crate::transport::{HttpRequest, Transport};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
  pub token: Option<String>,
  pub is_authenticated: bool,
}

impl Session {
  pub fn authenticated(token: impl Into<String>) -> Self {
    Self {
      token: Some(token.into()),
      is_authenticated: true,
    }
  }

  pub fn anonymous() -> Self {
    Self::default()
  }

  /// Token to attach, only while authenticated.
  pub fn bearer(&self) -> Option<&str> {
    if self.is_authenticated {
      self.token.as_deref()
    } else {
      None
    }
  }
}

/// Externally owned session store.
pub trait SessionSource: Send + Sync {
  fn current(&self) -> Session;

  /// Clear the token and the authenticated flag together.
  fn clear(&self);

  /// Counter bumped on every session change, including [`clear`](Self::clear).
  fn generation(&self) -> u64;
}

/// Receives the sign-in redirect after a session teardown.
///
/// Called while the interceptor holds its teardown lock, so implementations
/// must not issue requests synchronously.
pub trait Navigator: Send + Sync {
  fn redirect_to_sign_in(&self);
}

/// In-process session store.
#[derive(Debug, Default)]
pub struct MemorySession {
  state: RwLock<(Session, u64)>,
}

impl MemorySession {
  pub fn new(session: Session) -> Self {
    Self {
      state: RwLock::new((session, 0)),
    }
  }

  fn read(&self) -> RwLockReadGuard<'_, (Session, u64)> {
    self.state.read().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn set(&self, session: Session) {
    let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
    state.0 = session;
    state.1 += 1;
  }
}

impl SessionSource for MemorySession {
  fn current(&self) -> Session {
    self.read().0.clone()
  }

  fn clear(&self) {
    self.set(Session::anonymous());
  }

  fn generation(&self) -> u64 {
    self.read().1
  }
}

/// Wraps the transport: attaches credentials and reacts to 401s globally.
pub struct AuthInterceptor {
  transport: Arc<dyn Transport>,
  session: Arc<dyn SessionSource>,
  navigator: Arc<dyn Navigator>,
  /// Session generation whose 401 was last handled
  teardown: Mutex<Option<u64>>,
  teardowns: AtomicU64,
}

impl AuthInterceptor {
  pub fn new(
    transport: Arc<dyn Transport>,
    session: Arc<dyn SessionSource>,
    navigator: Arc<dyn Navigator>,
  ) -> Self {
    Self {
      transport,
      session,
      navigator,
      teardown: Mutex::new(None),
      teardowns: AtomicU64::new(0),
    }
  }

  pub fn session(&self) -> Session {
    self.session.current()
  }

  /// Number of 401 reactions (teardown and redirect) performed so far.
  pub fn teardown_count(&self) -> u64 {
    self.teardowns.load(Ordering::SeqCst)
  }

  /// Send `request` and classify the response.
  ///
  /// A 401 triggers the global teardown and is still returned to the caller.
  pub async fn execute(&self, mut request: HttpRequest) -> Result<Value, ApiError> {
    let generation = self.session.generation();
    let attached = self.session.current().bearer().map(String::from);
    if let Some(token) = &attached {
      request = request.with_header("Authorization", format!("Bearer {}", token));
    }

    let response = self.transport.send(request).await?;
    if response.is_success() {
      return Ok(response.body);
    }

    let error = ApiError::from_status(response.status, &response.body);
    if error.is_auth() {
      self.handle_unauthorized(generation);
    }
    Err(error)
  }

  /// Sign out and redirect, unless the session changed since the failing
  /// request was sent. Concurrent 401s for one session generation collapse
  /// into a single reaction; a request sent without credentials still gets
  /// the redirect.
  fn handle_unauthorized(&self, sent_with: u64) -> bool {
    let mut handled = self.teardown.lock().unwrap_or_else(PoisonError::into_inner);

    if self.session.generation() != sent_with {
      debug!("401 received for a previous session; keeping current session");
      return false;
    }
    if *handled == Some(sent_with) {
      debug!("401 already handled for this session");
      return false;
    }

    let current = self.session.current();
    if current.is_authenticated || current.token.is_some() {
      self.session.clear();
    }
    *handled = Some(self.session.generation());
    self.teardowns.fetch_add(1, Ordering::SeqCst);
    info!("Request rejected as unauthenticated, redirecting to sign-in");
    self.navigator.redirect_to_sign_in();
    true
  }
}
