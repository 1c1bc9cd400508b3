use proc_macro::TokenStream;

mod parsing;
mod task;

/// Declares an async function as an angelos task.
///
/// The function is replaced by a unit struct of the same name that
/// implements `angelos::Task`, so the declaration can be shared by
/// producers (which only need the name and argument type) and workers
/// (which register it).
///
/// # Attributes
///
/// - `name = "..."`: registry key (defaults to the function name)
/// - `idempotent`: the task may be re-run after its worker was lost
///
/// # Requirements
///
/// - The function must be `async`.
/// - It takes zero or one argument. With zero arguments the task's
///   `Args` is `angelos::NoArgs` (sent as `{}`).
/// - It returns `Result<T, E>` where `T: Serialize` and `E` converts into
///   `angelos::BoxError` (e.g. `String` or any `std::error::Error`).
///
/// # Example
///
/// ```ignore
/// use angelos::prelude::*;
///
/// #[derive(Serialize, Deserialize)]
/// struct Email {
///     to: String,
///     subject: String,
/// }
///
/// #[task(name = "tasks.send_email_task")]
/// async fn send_email(email: Email) -> Result<String, String> {
///     Ok(format!("Email sent to {}", email.to))
/// }
///
/// #[task(name = "tasks.periodic_cleanup", idempotent)]
/// async fn periodic_cleanup() -> Result<(), String> {
///     Ok(())
/// }
///
/// let mut registry = Registry::new();
/// registry.register_task(send_email)?;
/// registry.register_task(periodic_cleanup)?;
/// ```
#[proc_macro_attribute]
pub fn task(attr: TokenStream, item: TokenStream) -> TokenStream {
    task::task_impl(attr, item)
}
