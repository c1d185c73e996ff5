//! Scripted transport, session and navigator used by unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{json, Value};

use crate::auth::{AuthInterceptor, MemorySession, Navigator, Session, SessionSource};
use crate::endpoint::{Endpoint, EndpointRegistry};
use crate::error::ApiError;
use crate::query::{QueryClient, QueryConfig};
use crate::tag::{Tag, TagType};
use crate::transport::{HttpRequest, HttpResponse, Method, Transport};

#[derive(Debug, Clone)]
pub struct MockReply {
  pub status: u16,
  pub body: Value,
  pub delay: Duration,
  pub network_error: Option<String>,
}

impl MockReply {
  pub fn ok(body: Value) -> Self {
    Self::status(200, body)
  }

  pub fn status(status: u16, body: Value) -> Self {
    Self {
      status,
      body,
      delay: Duration::ZERO,
      network_error: None,
    }
  }

  pub fn network(message: &str) -> Self {
    Self {
      network_error: Some(message.to_string()),
      ..Self::status(0, Value::Null)
    }
  }

  pub fn after(mut self, delay: Duration) -> Self {
    self.delay = delay;
    self
  }
}

type Handler = Box<dyn Fn(&HttpRequest, usize) -> MockReply + Send + Sync>;

/// Records every request and answers from a handler given the request and
/// its zero-based call index.
pub struct MockTransport {
  calls: Mutex<Vec<HttpRequest>>,
  handler: Handler,
}

impl MockTransport {
  pub fn new<F>(handler: F) -> Arc<Self>
  where
    F: Fn(&HttpRequest, usize) -> MockReply + Send + Sync + 'static,
  {
    Arc::new(Self {
      calls: Mutex::new(Vec::new()),
      handler: Box::new(handler),
    })
  }

  pub fn always(reply: MockReply) -> Arc<Self> {
    Self::new(move |_, _| reply.clone())
  }

  pub fn calls(&self) -> Vec<HttpRequest> {
    self.calls.lock().unwrap().clone()
  }

  pub fn call_count(&self) -> usize {
    self.calls.lock().unwrap().len()
  }

  pub fn calls_to(&self, path: &str) -> usize {
    self
      .calls
      .lock()
      .unwrap()
      .iter()
      .filter(|r| r.path == path)
      .count()
  }
}

impl Transport for MockTransport {
  fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, ApiError>> {
    let index = {
      let mut calls = self.calls.lock().unwrap();
      calls.push(request.clone());
      calls.len() - 1
    };
    let reply = (self.handler)(&request, index);

    async move {
      if !reply.delay.is_zero() {
        tokio::time::sleep(reply.delay).await;
      }
      match reply.network_error {
        Some(message) => Err(ApiError::Network(message)),
        None => Ok(HttpResponse {
          status: reply.status,
          body: reply.body,
        }),
      }
    }
    .boxed()
  }
}

#[derive(Debug, Default)]
pub struct RecordingNavigator {
  redirects: AtomicUsize,
}

impl RecordingNavigator {
  pub fn redirect_count(&self) -> usize {
    self.redirects.load(Ordering::SeqCst)
  }
}

impl Navigator for RecordingNavigator {
  fn redirect_to_sign_in(&self) {
    self.redirects.fetch_add(1, Ordering::SeqCst);
  }
}

/// Memory session that counts teardowns.
#[derive(Debug, Default)]
pub struct CountingSession {
  inner: MemorySession,
  clears: AtomicUsize,
}

impl CountingSession {
  pub fn new(session: Session) -> Self {
    Self {
      inner: MemorySession::new(session),
      clears: AtomicUsize::new(0),
    }
  }

  pub fn set(&self, session: Session) {
    self.inner.set(session);
  }

  pub fn clear_count(&self) -> usize {
    self.clears.load(Ordering::SeqCst)
  }
}

impl SessionSource for CountingSession {
  fn current(&self) -> Session {
    self.inner.current()
  }

  fn clear(&self) {
    self.clears.fetch_add(1, Ordering::SeqCst);
    self.inner.clear();
  }

  fn generation(&self) -> u64 {
    self.inner.generation()
  }
}

/// A small HR endpoint table used across tests.
pub fn hr_registry() -> EndpointRegistry {
  let endpoints = vec![
    Endpoint::query("listEmployees")
      .path("/employees")
      .tags(vec![Tag::list(TagType::Employee)])
      .build(),
    Endpoint::query("getEmployee")
      .path("/employees/{id}")
      .provides(|_, args| Tag::from_value(TagType::Employee, &args["id"]).into_iter().collect())
      .build(),
    Endpoint::query("listLeaveRequests")
      .path("/leave-requests")
      .provides(|result, _| {
        let mut tags = vec![Tag::list(TagType::LeaveRequest)];
        if let Some(items) = result.as_array() {
          tags.extend(
            items
              .iter()
              .filter_map(|item| Tag::from_value(TagType::LeaveRequest, &item["id"])),
          );
        }
        tags
      })
      .build(),
    Endpoint::mutation("createEmployee")
      .path("/employees")
      .tags(vec![Tag::list(TagType::Employee)])
      .build(),
    Endpoint::mutation("updateEmployee")
      .method(Method::Put)
      .path("/employees/{id}")
      .invalidates(|args, _| Tag::from_value(TagType::Employee, &args["id"]).into_iter().collect())
      .build(),
    Endpoint::mutation("approveLeaveRequest")
      .method(Method::Patch)
      .path("/leave-requests/{id}/approve")
      .invalidates(|args, _| Tag::from_value(TagType::LeaveRequest, &args["id"]).into_iter().collect())
      .build(),
  ];

  let mut registry = EndpointRegistry::new();
  for endpoint in endpoints {
    registry.register(endpoint).unwrap();
  }
  registry
}

pub struct Harness {
  pub client: QueryClient,
  pub transport: Arc<MockTransport>,
  pub session: Arc<CountingSession>,
  pub navigator: Arc<RecordingNavigator>,
}

pub fn harness(transport: Arc<MockTransport>) -> Harness {
  harness_with(transport, QueryConfig::default())
}

pub fn harness_with(transport: Arc<MockTransport>, config: QueryConfig) -> Harness {
  let session = Arc::new(CountingSession::new(Session::authenticated("test-token")));
  let navigator = Arc::new(RecordingNavigator::default());
  let interceptor = AuthInterceptor::new(transport.clone(), session.clone(), navigator.clone());
  let client = QueryClient::new(hr_registry(), interceptor, config);
  Harness {
    client,
    transport,
    session,
    navigator,
  }
}

/// Echo handler: returns `{ "path": ..., "call": n }` for every request.
pub fn echo(request: &HttpRequest, index: usize) -> MockReply {
  MockReply::ok(json!({ "path": request.path, "call": index }))
}
