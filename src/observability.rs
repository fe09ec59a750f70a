use biometrics::{Collector, Counter, Moments};

pub(crate) static CLIENT_REQUESTS: Counter = Counter::new("confab.client.requests");
pub(crate) static CLIENT_REQUEST_ERRORS: Counter = Counter::new("confab.client.request_errors");
pub(crate) static CLIENT_REQUEST_DURATION: Moments =
    Moments::new("confab.client.request_duration_seconds");

pub(crate) static STREAM_TOKENS: Counter = Counter::new("confab.stream.tokens");
pub(crate) static STREAM_BYTES: Counter = Counter::new("confab.stream.bytes");
pub(crate) static STREAM_ABORTS: Counter = Counter::new("confab.stream.aborts");
pub(crate) static STREAM_TTFB: Moments = Moments::new("confab.stream.ttfb_seconds");

pub(crate) static GENERATIONS: Counter = Counter::new("confab.controller.generations");
pub(crate) static GENERATIONS_REJECTED: Counter =
    Counter::new("confab.controller.generations_rejected");
pub(crate) static FALLBACKS: Counter = Counter::new("confab.controller.fallbacks");
pub(crate) static FALLBACK_FAILURES: Counter = Counter::new("confab.controller.fallback_failures");
pub(crate) static PARTIAL_COMMITS: Counter = Counter::new("confab.controller.partial_commits");

pub(crate) static TITLE_FAILURES: Counter = Counter::new("confab.title.failures");

pub(crate) static PERSIST_ERRORS: Counter = Counter::new("confab.store.persist_errors");
pub(crate) static LOAD_FAILURES: Counter = Counter::new("confab.store.load_failures");

/// Register this crate's biometrics with the provided collector.
pub fn register_biometrics(collector: Collector) {
    collector.register_counter(&CLIENT_REQUESTS);
    collector.register_counter(&CLIENT_REQUEST_ERRORS);
    collector.register_moments(&CLIENT_REQUEST_DURATION);

    collector.register_counter(&STREAM_TOKENS);
    collector.register_counter(&STREAM_BYTES);
    collector.register_counter(&STREAM_ABORTS);
    collector.register_moments(&STREAM_TTFB);

    collector.register_counter(&GENERATIONS);
    collector.register_counter(&GENERATIONS_REJECTED);
    collector.register_counter(&FALLBACKS);
    collector.register_counter(&FALLBACK_FAILURES);
    collector.register_counter(&PARTIAL_COMMITS);

    collector.register_counter(&TITLE_FAILURES);

    collector.register_counter(&PERSIST_ERRORS);
    collector.register_counter(&LOAD_FAILURES);
}
