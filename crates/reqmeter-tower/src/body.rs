//! Response body wrapper that completes the observation once the body has
//! been fully sent.

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use http_body::{Body, Frame, SizeHint};
use reqmeter_core::{RequestObservation, type_name_of};

/// A response body carrying the request's observation.
///
/// * end of stream: duration, histogram and terminal step are recorded
/// * body error: the error type is counted as an exception
/// * dropped early: terminal step only, no histogram observation
pub struct ObservedBody<B> {
    inner: Pin<Box<B>>,
    observation: Option<RequestObservation>,
}

impl<B: Body> ObservedBody<B> {
    pub(crate) fn new(body: B, observation: RequestObservation) -> Self {
        let mut this = Self {
            inner: Box::pin(body),
            observation: Some(observation),
        };
        // Servers never poll a body that is already at its end.
        if this.inner.is_end_stream() {
            this.complete();
        }
        this
    }

    pub(crate) fn unobserved(body: B) -> Self {
        Self {
            inner: Box::pin(body),
            observation: None,
        }
    }

    /// Whether the observation is still pending.
    pub fn is_observing(&self) -> bool {
        self.observation.is_some()
    }

    fn complete(&mut self) {
        if let Some(mut observation) = self.observation.take() {
            observation.response_completed();
            observation.finish();
        }
    }

    fn fail(&mut self) {
        if let Some(mut observation) = self.observation.take() {
            observation.fault(type_name_of::<B::Error>());
            observation.finish();
        }
    }
}

impl<B> fmt::Debug for ObservedBody<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObservedBody")
            .field("observing", &self.observation.is_some())
            .finish_non_exhaustive()
    }
}

impl<B: Body> Body for ObservedBody<B> {
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let poll = this.inner.as_mut().poll_frame(cx);
        match &poll {
            Poll::Ready(None) => this.complete(),
            Poll::Ready(Some(Err(_))) => this.fail(),
            Poll::Ready(Some(Ok(_))) if this.inner.is_end_stream() => this.complete(),
            _ => {}
        }
        poll
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
