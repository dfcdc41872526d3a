//! The wrapped response sink handlers write into.
//!
//! Handlers never return a response. They write a status, headers and body
//! into a [`ResponseWriter`], and the middleware around them can inspect
//! what was written after the handler returns or panics. That introspection
//! is what lets `Counter` label by the final status and lets `PanicRecovery`
//! decide whether a 500 may still be written.
//!
//! A writer is a cheap handle: clones share the same underlying response.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderName};
use http::{HeaderMap, HeaderValue, StatusCode};
use http_body_util::Full;

pub(crate) const TEXT_PLAIN: &str = "text/plain; charset=utf-8";
pub(crate) const APPLICATION_JSON: &str = "application/json";

#[derive(Default)]
struct Written {
    status: Option<StatusCode>,
    headers: HeaderMap,
    body: Vec<u8>,
}

/// Response sink with introspection of the status and body written so far.
#[derive(Clone, Default)]
pub struct ResponseWriter {
    inner: Arc<Mutex<Written>>,
}

impl ResponseWriter {
    pub fn new() -> Self {
        Self::default()
    }

    // A poisoned lock only means some handler panicked mid-write; the data is
    // still the best record of what was written.
    fn lock(&self) -> MutexGuard<'_, Written> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sets (replaces) a response header.
    pub fn set_header(&self, name: HeaderName, value: HeaderValue) {
        self.lock().headers.insert(name, value);
    }

    pub fn header(&self, name: &HeaderName) -> Option<HeaderValue> {
        self.lock().headers.get(name).cloned()
    }

    /// Writes the status line. Only the first call has an effect, later
    /// calls are ignored the same way a real connection cannot resend it.
    pub fn write_header(&self, status: StatusCode) {
        let mut w = self.lock();
        if w.status.is_none() {
            w.status = Some(status);
        }
    }

    /// Appends to the body, implicitly writing `200 OK` if no status was
    /// written yet.
    pub fn write(&self, chunk: impl AsRef<[u8]>) {
        let mut w = self.lock();
        w.status.get_or_insert(StatusCode::OK);
        w.body.extend_from_slice(chunk.as_ref());
    }

    /// `status` with a `text/plain` body.
    pub fn text(&self, status: StatusCode, body: impl AsRef<str>) {
        self.set_header(CONTENT_TYPE, HeaderValue::from_static(TEXT_PLAIN));
        self.write_header(status);
        self.write(body.as_ref());
    }

    /// `status` with an `application/json` body.
    pub fn json(&self, status: StatusCode, body: impl AsRef<[u8]>) {
        self.set_header(CONTENT_TYPE, HeaderValue::from_static(APPLICATION_JSON));
        self.write_header(status);
        self.write(body);
    }

    /// The written status, or `200 OK` when nothing was written (which is
    /// what the client receives in that case).
    pub fn status(&self) -> StatusCode {
        self.lock().status.unwrap_or(StatusCode::OK)
    }

    pub fn status_written(&self) -> bool {
        self.lock().status.is_some()
    }

    pub fn body_written(&self) -> bool {
        !self.lock().body.is_empty()
    }

    /// A copy of the body written so far.
    pub fn body(&self) -> Bytes {
        Bytes::copy_from_slice(&self.lock().body)
    }

    /// Takes what was written and turns it into the wire response.
    pub(crate) fn into_response(self) -> http::Response<Full<Bytes>> {
        let written = std::mem::take(&mut *self.lock());

        let mut res = http::Response::new(Full::new(Bytes::from(written.body)));
        *res.status_mut() = written.status.unwrap_or(StatusCode::OK);
        *res.headers_mut() = written.headers;
        res
    }
}
