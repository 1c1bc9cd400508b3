use angelos::prelude::*;

#[task(name = "tasks.sync")]
fn not_async() -> Result<(), String> {
    Ok(())
}

fn main() {}
