//! Trace-context propagation over stream entry fields.
//!
//! Propagation fields ride in the same extensible key/value list as
//! storage hints, namespaced `telemetry~`; the consumer side needs no
//! special casing to skip them. Everything here is a no-op unless the
//! `otel` feature is enabled.

use crate::transport::EntryFields;

/// Namespace for propagation fields inside a stream entry.
pub const TELEMETRY_PREFIX: &str = "telemetry~";

/// Inject W3C trace context from the current span into the entry fields.
#[cfg(feature = "otel")]
pub fn inject_trace_fields(entry_fields: &mut EntryFields) {
    use tracing_opentelemetry::OpenTelemetrySpanExt;

    let cx = tracing::Span::current().context();

    struct FieldInjector<'a>(&'a mut EntryFields);
    impl opentelemetry::propagation::Injector for FieldInjector<'_> {
        fn set(&mut self, key: &str, value: String) {
            self.0.push(format!("{TELEMETRY_PREFIX}{key}"), value);
        }
    }

    opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.inject_context(&cx, &mut FieldInjector(entry_fields));
    });
}

#[cfg(not(feature = "otel"))]
pub fn inject_trace_fields(_entry_fields: &mut EntryFields) {}

/// Adopt the producer's trace context on a consume span.
///
/// Recent messages reparent the span under the producer's context; stale
/// ones only get a link, so a replayed backlog does not graft onto
/// long-finished traces.
#[cfg(feature = "otel")]
pub fn adopt_trace_fields(span: &tracing::Span, entry_fields: &EntryFields, treat_as_parent: bool) {
    use opentelemetry::trace::TraceContextExt;
    use tracing_opentelemetry::OpenTelemetrySpanExt;

    struct FieldExtractor<'a>(&'a EntryFields);
    impl opentelemetry::propagation::Extractor for FieldExtractor<'_> {
        fn get(&self, key: &str) -> Option<&str> {
            self.0.get(&format!("{TELEMETRY_PREFIX}{key}"))
        }
        fn keys(&self) -> Vec<&str> {
            self.0
                .iter()
                .filter_map(|(k, _)| k.strip_prefix(TELEMETRY_PREFIX))
                .collect()
        }
    }

    let cx = opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.extract(&FieldExtractor(entry_fields))
    });
    if !cx.span().span_context().is_valid() {
        return;
    }
    if treat_as_parent {
        span.set_parent(cx);
    } else {
        span.add_link(cx.span().span_context().clone());
    }
}

#[cfg(not(feature = "otel"))]
pub fn adopt_trace_fields(
    _span: &tracing::Span,
    _entry_fields: &EntryFields,
    _treat_as_parent: bool,
) {
}
