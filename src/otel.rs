// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration for RabbitMQ
//!
//! Trace context travels in the message headers: it is injected on every publish
//! and extracted on delivery, where it becomes the context the handler runs in.

use lapin::types::{AMQPValue, FieldTable, ShortString};
use opentelemetry::{
    global::{BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::{borrow::Cow, collections::BTreeMap};
use tracing::error;

/// An adapter for injecting and extracting OpenTelemetry context from RabbitMQ headers.
pub(crate) struct RabbitMQTracePropagator<'a> {
    headers: &'a mut BTreeMap<ShortString, AMQPValue>,
}

impl<'a> RabbitMQTracePropagator<'a> {
    /// Wraps a header map for injection or extraction.
    pub(crate) fn new(headers: &'a mut BTreeMap<ShortString, AMQPValue>) -> Self {
        Self { headers }
    }
}

impl Injector for RabbitMQTracePropagator<'_> {
    /// Stores a propagation field as a long string header, key lowercased.
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(
            key.to_lowercase().into(),
            AMQPValue::LongString(value.into()),
        );
    }
}

impl Extractor for RabbitMQTracePropagator<'_> {
    /// Reads a propagation field. Headers that aren't utf-8 long strings are skipped.
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(|header_value| {
            if let AMQPValue::LongString(header_value) = header_value {
                std::str::from_utf8(header_value.as_bytes())
                    .map_err(|e| error!("Error decoding header value {:?}", e))
                    .ok()
            } else {
                None
            }
        })
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|header| header.as_str()).collect()
    }
}

/// Returns a copy of `headers` carrying the trace context of `ctx`.
///
/// # Parameters
/// * `ctx` - The context to propagate, usually the caller's current one
/// * `headers` - Headers the message already carries
///
/// # Returns
/// The headers with the propagator's fields added
pub(crate) fn inject_context(ctx: &Context, headers: &FieldTable) -> FieldTable {
    let mut btree = headers.inner().clone();

    opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut RabbitMQTracePropagator::new(&mut btree))
    });

    FieldTable::from(btree)
}

/// Extracts the trace context from `headers` and starts a consumer span named `name`.
///
/// # Parameters
/// * `headers` - Headers of the received message
/// * `tracer` - Tracer the span is created with
/// * `name` - Span name, the handler name
///
/// # Returns
/// The extracted context, in which the handler runs, and the started span
pub(crate) fn new_span(headers: &FieldTable, tracer: &BoxedTracer, name: &str) -> (Context, BoxedSpan) {
    let ctx = opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.extract(&RabbitMQTracePropagator::new(&mut headers.inner().clone()))
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
    use lapin::types::LongString;

    #[test]
    fn injector_lowercases_keys() {
        let mut btree = BTreeMap::new();
        RabbitMQTracePropagator::new(&mut btree).set("TraceParent", "00-abc".to_owned());

        assert_eq!(
            btree.get("traceparent"),
            Some(&AMQPValue::LongString(LongString::from("00-abc")))
        );
    }

    #[test]
    fn extractor_reads_long_strings_only() {
        let mut btree = BTreeMap::new();
        btree.insert(ShortString::from("traceparent"), AMQPValue::LongString("00-abc".into()));
        btree.insert(ShortString::from("retry"), AMQPValue::LongInt(1));

        let propagator = RabbitMQTracePropagator::new(&mut btree);

        assert_eq!(propagator.get("traceparent"), Some("00-abc"));
        assert_eq!(propagator.get("retry"), None);
        assert_eq!(propagator.keys().len(), 2);
    }

    #[test]
    fn inject_keeps_existing_headers() {
        let mut headers = FieldTable::default();
        headers.insert("retry".into(), AMQPValue::LongInt(2));

        let injected = inject_context(&Context::new(), &headers);

        assert_eq!(injected.inner().get("retry"), Some(&AMQPValue::LongInt(2)));
    }
}
