// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! Trace context travels from publisher to worker inside the message headers.
//! The publisher injects the current context with the global propagator; the
//! worker extracts it and starts a consumer span for every task it processes.

use crate::message::MessageHeaders;
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::borrow::Cow;

struct HeaderInjector<'a> {
    headers: &'a mut MessageHeaders,
}

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(key.to_lowercase(), value);
    }
}

struct HeaderExtractor<'a> {
    headers: &'a MessageHeaders,
}

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(String::as_str).collect()
    }
}

/// Writes the propagation fields of `ctx` into `headers`.
pub(crate) fn inject_context(ctx: &Context, headers: &mut MessageHeaders) {
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut HeaderInjector { headers })
    });
}

/// Creates a consumer span parented on the context carried by `headers`.
///
/// # Returns
/// A tuple containing the extracted context and the new span
pub(crate) fn new_span(
    headers: &MessageHeaders,
    tracer: &BoxedTracer,
    name: &str,
) -> (Context, BoxedSpan) {
    let ctx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderExtractor { headers })
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injected_keys_are_lowercased() {
        let mut headers = MessageHeaders::new();
        HeaderInjector {
            headers: &mut headers,
        }
        .set("TraceParent", "00-abc-def-01".to_owned());

        assert_eq!(
            HeaderExtractor { headers: &headers }.get("traceparent"),
            Some("00-abc-def-01")
        );
    }
}
