//! Shared plumbing for the HTTP services the release stage talks to.

use std::future::Future;
use std::pin::Pin;
use std::sync::LazyLock;
use std::time::Duration;

const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// Boxed future returned by service traits.
pub type ServiceFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Client shared by every service. Requests are rare, so connections are not
/// pooled.
pub(crate) static HTTP_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .pool_max_idle_per_host(0)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
});

/// Trims a trailing slash so paths can be appended with `/`.
pub(crate) fn base_url(url: &str) -> String {
    url.trim_end_matches('/').to_owned()
}
