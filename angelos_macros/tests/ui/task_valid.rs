use angelos::prelude::*;

#[derive(Serialize, Deserialize)]
struct Email {
    to: String,
    subject: String,
}

/// Sends one email.
#[task(name = "tasks.send_email_task")]
async fn send_email(email: Email) -> Result<String, String> {
    if email.subject.is_empty() {
        return Err("empty subject".to_string());
    }
    Ok(format!("Email sent to {}", email.to))
}

#[task(idempotent)]
async fn periodic_cleanup() -> Result<u32, std::io::Error> {
    Ok(0)
}

fn main() {
    assert_eq!(<send_email as Task>::NAME, "tasks.send_email_task");
    assert!(!<send_email as Task>::IDEMPOTENT);
    assert_eq!(<periodic_cleanup as Task>::NAME, "periodic_cleanup");
    assert!(<periodic_cleanup as Task>::IDEMPOTENT);

    let mut registry = Registry::new();
    registry.register_task(send_email).unwrap();
    registry.register_task(periodic_cleanup).unwrap();
    assert_eq!(registry.len(), 2);
}
