//! Paginator: turns a cursor-returning fetch function into a lazy sequence
//! of pages (§4.3).

use async_trait::async_trait;
use futures_util::stream::{self, Stream as FutureStream};

use crate::error::SourceError;

/// One page of results plus an optional cursor for the next page.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub next_cursor: Option<String>,
}

/// A fetch function: given the previous page's cursor (`None` on the first
/// call), returns the next page.
#[async_trait]
pub trait Fetch<T>: Send + Sync {
    async fn fetch(&self, cursor: Option<&str>) -> Result<Page<T>, SourceError>;
}

#[async_trait]
impl<T, F, Fut> Fetch<T> for F
where
    T: Send,
    F: Fn(Option<String>) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Page<T>, SourceError>> + Send,
{
    async fn fetch(&self, cursor: Option<&str>) -> Result<Page<T>, SourceError> {
        (self)(cursor.map(str::to_owned)).await
    }
}

/// Turn `fetcher` into a lazy stream of `data[]` page arrays, stopping once
/// a page arrives without a `next_cursor`. Empty pages are forwarded as-is
/// and do not terminate iteration on their own.
///
/// Each call to `fetcher` is expected to already be wrapped by the caller in
/// the retrying invoker and rate limiter (§4.3: "Each fetch is composed
/// through Retrying Invoker and Rate Limiter"); the paginator itself only
/// sequences cursors.
pub fn paginate<T, F>(fetcher: F) -> impl FutureStream<Item = Result<Vec<T>, SourceError>>
where
    T: Send + 'static,
    F: Fetch<T> + 'static,
{
    stream::unfold(
        (Some(None::<String>), fetcher),
        move |(cursor, fetcher)| async move {
            let cursor = cursor?;
            match fetcher.fetch(cursor.as_deref()).await {
                Ok(page) => {
                    let next_state = page.next_cursor.map(Some);
                    Some((Ok(page.data), (next_state, fetcher)))
                }
                Err(e) => Some((Err(e), (None, fetcher))),
            }
        },
    )
}
