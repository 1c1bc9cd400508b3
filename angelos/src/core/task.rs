use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;

/// A boxed error that can be sent across threads.
///
/// Handlers may fail with any error type convertible into this one.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Argument type for tasks that take no arguments.
///
/// Serializes as `{}` so it matches what the beat sends for scheduled
/// entries without explicit arguments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoArgs {}

/// A task declared in code.
///
/// The same declaration serves both sides: producers use [`Task::NAME`] and
/// [`Task::Args`] to submit (see `Dispatcher::send`), and workers register
/// the implementation to execute it. Usually derived with `#[task]`.
///
/// ```ignore
/// use angelos::prelude::*;
///
/// #[task(name = "tasks.echo")]
/// async fn echo(args: serde_json::Value) -> Result<serde_json::Value, String> {
///     Ok(args)
/// }
///
/// let mut registry = Registry::new();
/// registry.register_task(echo)?;
/// ```
pub trait Task: Send + Sync + 'static {
    /// Registry key this task is submitted and resolved under.
    const NAME: &'static str;

    /// Whether running the task twice for the same invocation is harmless.
    const IDEMPOTENT: bool = false;

    type Args: Serialize + DeserializeOwned + Send + 'static;
    type Output: Serialize + Send + 'static;

    fn run(
        &self,
        args: Self::Args,
    ) -> impl Future<Output = Result<Self::Output, BoxError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_no_args_matches_empty_object() {
        assert_eq!(serde_json::to_value(NoArgs {}).unwrap(), json!({}));
        let parsed: NoArgs = serde_json::from_value(json!({})).unwrap();
        assert_eq!(parsed, NoArgs {});
    }
}
