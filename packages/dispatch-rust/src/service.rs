//! Tower adapter: exposes a [`Dispatcher`] as a `tower::Service<BoxRecord>`.

use std::future::{ready, Ready};
use std::sync::Arc;
use std::task::{Context, Poll};

use switchyard_core::BoxRecord;
use tower::Service;

use crate::dispatcher::Dispatcher;
use crate::error::DispatchError;

/// Dispatch runs synchronously inside `call`; the returned future is already
/// complete. The service is always ready.
#[derive(Debug, Clone)]
pub struct DispatchService {
    dispatcher: Arc<Dispatcher>,
}

impl DispatchService {
    #[must_use]
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    #[must_use]
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }
}

impl Service<BoxRecord> for DispatchService {
    type Response = BoxRecord;
    type Error = DispatchError;
    type Future = Ready<Result<BoxRecord, DispatchError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, command: BoxRecord) -> Self::Future {
        ready(self.dispatcher.call_boxed(command))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
