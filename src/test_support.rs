use std::future::Future;

use tokio::task::LocalSet;

use crate::model::{ProductId, Scope, UserId};

/// Drives `fut` inside a `LocalSet`, so it may `spawn_local` like the components do.
pub async fn run_local<F: Future>(fut: F) -> F::Output {
    LocalSet::new().run_until(fut).await
}

pub fn bar() -> Scope {
    Scope::new("feria-2026", "bar-north")
}

pub fn operator() -> UserId {
    UserId::from("op-1")
}

pub fn product(id: &str) -> ProductId {
    ProductId::from(id)
}
