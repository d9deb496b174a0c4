use std::sync::LazyLock;
use std::time::Duration;

static VERBOSE: LazyLock<bool> =
    LazyLock::new(|| std::env::var("BATCH_EXCHANGE_VERBOSE").as_deref() == Ok("1"));

pub(crate) fn verbose() -> bool {
    *VERBOSE
}

static DEFAULT_ENGINE_TIMEOUT: LazyLock<Option<Duration>> = LazyLock::new(|| {
    std::env::var("BATCH_EXCHANGE_ENGINE_TIMEOUT_MS")
        .ok()
        .map(|v| {
            Duration::from_millis(v.parse().expect(
                "BATCH_EXCHANGE_ENGINE_TIMEOUT_MS does not contain a valid number of milliseconds",
            ))
        })
});

/// Default bound on waiting for an engine response. `None` means block forever,
/// which matches the behavior of engines that are trusted to always answer.
pub(crate) fn default_engine_timeout() -> Option<Duration> {
    *DEFAULT_ENGINE_TIMEOUT
}
