//! Helpers for chaining process results
//!
//! Library code returns typed errors; callers at a program boundary usually want an
//! [`eyre::Report`]. These helpers bridge the two.

use std::future::{Future, IntoFuture};

use serde::de::DeserializeOwned;

use crate::error::{Error, ParsingError};
use crate::exited::ExitedProcess;

/// Await `future` and lift its typed error into an [`eyre::Report`]
///
/// Accepts anything awaitable that yields a `Result`, including a `Process`.
///
/// # Errors
/// The awaited error, wrapped
pub async fn unwrap<F, T, E>(future: F) -> eyre::Result<T>
where
    F: IntoFuture<Output = Result<T, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    Ok(future.await?)
}

/// [`unwrap`] for a result that is already at hand
///
/// # Errors
/// `result`'s error, wrapped
pub fn lift<T, E>(result: Result<T, E>) -> eyre::Result<T>
where
    E: std::error::Error + Send + Sync + 'static,
{
    Ok(result?)
}

/// Decode `text` as JSON
///
/// # Errors
/// Returns `ParsingError` if `text` is not valid JSON for `T`
pub fn parse_json<T: DeserializeOwned>(text: &str) -> Result<T, ParsingError> {
    serde_json::from_str(text).map_err(|e| ParsingError::new(format!("invalid JSON: {e}")))
}

/// Combinators on futures that resolve to an [`ExitedProcess`]
pub trait ProcessFutureExt<E>: Future<Output = Result<ExitedProcess, E>> + Send + Sized
where
    E: Into<Error> + Send,
{
    /// Resolve to stdout as text
    fn stdout(self) -> impl Future<Output = Result<String, Error>> + Send {
        async move {
            let exited = self.await.map_err(Into::<Error>::into)?;
            Ok::<_, Error>(exited.stdout().into_owned())
        }
    }

    /// Resolve to stdout decoded as JSON
    fn json<T: DeserializeOwned + Send>(self) -> impl Future<Output = Result<T, Error>> + Send {
        async move {
            let exited = self.await.map_err(Into::<Error>::into)?;
            Ok::<T, Error>(exited.stdout_json()?)
        }
    }
}

impl<F, E> ProcessFutureExt<E> for F
where
    F: Future<Output = Result<ExitedProcess, E>> + Send,
    E: Into<Error> + Send,
{
}
