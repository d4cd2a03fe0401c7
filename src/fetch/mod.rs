//! Raw HTTP plumbing underneath the upstream transport.

mod basic;

pub use basic::BasicClient;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Method, Request, Response, StatusCode, Url};

/// Executes prepared requests. Wrappers (auth, tracing, test doubles) implement
/// this around an inner client.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn execute(&self, req: Request) -> reqwest::Result<Response>;
}

/// Issues a GET and returns the status together with the full body, leaving
/// status interpretation to the caller.
pub async fn fetch_bytes<C: HttpClient + ?Sized>(
    client: &C,
    url: Url,
) -> reqwest::Result<(StatusCode, Bytes)> {
    let resp = client.execute(Request::new(Method::GET, url)).await?;
    let status = resp.status();
    Ok((status, resp.bytes().await?))
}
