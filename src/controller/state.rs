//! Per-exchange response-assembly state.

use std::any::{Any, TypeId};
use std::collections::HashMap;

use bytes::{Bytes, BytesMut};

use crate::http::{Headers, Response, StatusCode};

/// Type-keyed storage for controller-specific per-exchange data.
#[derive(Default)]
pub struct Extensions {
    map: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value`, replacing any previous value of the same type.
    pub fn insert<T>(&mut self, value: T)
    where
        T: Send + Sync + 'static,
    {
        self.map.insert(TypeId::of::<T>(), Box::new(value));
    }

    pub fn get<T>(&self) -> Option<&T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    pub fn get_mut<T>(&mut self) -> Option<&mut T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .get_mut(&TypeId::of::<T>())
            .and_then(|value| value.downcast_mut::<T>())
    }

    pub fn remove<T>(&mut self) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast::<T>().ok())
            .map(|value| *value)
    }
}

impl std::fmt::Debug for Extensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Extensions")
            .field("len", &self.map.len())
            .finish()
    }
}

/// Progress of one exchange across re-entrant dispatch calls.
///
/// Created lazily on the first dispatch, owned by the dispatcher's table slot
/// for the exchange and released by the completion callback. Once
/// [`is_sent`](Self::is_sent) is true every mutator is a no-op.
#[derive(Debug)]
pub struct ConnectionState {
    response_sent: bool,
    response_status: StatusCode,
    response_headers: Headers,
    // `Some` once a response has been assembled, even if the body is empty.
    response_body: Option<Bytes>,
    wait_loop_count: u32,
    request_body: BytesMut,
    extensions: Extensions,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionState {
    pub fn new() -> Self {
        Self {
            response_sent: false,
            response_status: StatusCode::Ok,
            response_headers: Headers::new(),
            response_body: None,
            wait_loop_count: 0,
            request_body: BytesMut::new(),
            extensions: Extensions::new(),
        }
    }

    pub fn is_sent(&self) -> bool {
        self.response_sent
    }

    /// Finalizes the state after the response was queued.
    pub fn mark_sent(&mut self) {
        self.response_sent = true;
    }

    pub fn is_assembled(&self) -> bool {
        self.response_body.is_some()
    }

    /// Stores the response parts to be queued.
    pub fn assemble(&mut self, status: StatusCode, headers: Headers, body: Bytes) {
        if self.response_sent {
            return;
        }
        self.response_status = status;
        self.response_headers = headers;
        self.response_body = Some(body);
    }

    pub fn response_status(&self) -> StatusCode {
        self.response_status
    }

    pub fn response_headers(&self) -> &Headers {
        &self.response_headers
    }

    pub fn response_body(&self) -> Option<&[u8]> {
        self.response_body.as_deref()
    }

    /// Builds the response object from the stored parts.
    pub fn to_response(&self) -> Option<Response> {
        let body = self.response_body.clone()?;
        Some(Response::from_parts(
            self.response_status,
            self.response_headers.clone(),
            body,
        ))
    }

    pub fn wait_loop_count(&self) -> u32 {
        self.wait_loop_count
    }

    /// Counts one idle wait and returns the new total.
    pub fn record_wait(&mut self) -> u32 {
        if !self.response_sent {
            self.wait_loop_count = self.wait_loop_count.saturating_add(1);
        }
        self.wait_loop_count
    }

    /// All request body bytes received so far.
    pub fn request_body(&self) -> &[u8] {
        &self.request_body
    }

    pub fn append_request_body(&mut self, chunk: &[u8]) {
        if !self.response_sent && !chunk.is_empty() {
            self.request_body.extend_from_slice(chunk);
        }
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    /// `None` once the response was sent.
    pub fn extensions_mut(&mut self) -> Option<&mut Extensions> {
        if self.response_sent {
            None
        } else {
            Some(&mut self.extensions)
        }
    }
}
