use std::collections::HashMap;

use opentelemetry::propagation::Injector;

/// Adapter that lets the W3C propagator write `traceparent`/`tracestate`
/// into an event's header map.
pub struct HeaderInjector<'a>(pub &'a mut HashMap<String, String>);

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.0.insert(key.to_string(), value);
    }
}

/// Merge the trace context of `cx` into `headers` using the globally
/// installed text-map propagator.
pub fn inject_context(cx: &opentelemetry::Context, headers: &mut HashMap<String, String>) {
    opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.inject_context(cx, &mut HeaderInjector(headers));
    });
}
