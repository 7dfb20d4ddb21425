//! Zone propagation across `.await` points.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::zone::Zone;

/// A future that is always polled with its zone as the current zone.
///
/// Created by [`Zone::bind_future`]. The zone is entered directly for each
/// poll; `on_invoke` hooks are not consulted.
pub struct ZonedFuture<F> {
    zone: Zone,
    future: Pin<Box<F>>,
}

impl<F> ZonedFuture<F> {
    pub fn zone(&self) -> &Zone {
        &self.zone
    }
}

impl<F: Future> Future for ZonedFuture<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let _frame = this.zone.runtime_state().enter(this.zone.clone());
        this.future.as_mut().poll(cx)
    }
}

impl Zone {
    /// Bind `future` to this zone so code inside it sees this zone as current
    /// on every resumption, whichever zone the executor polls it from.
    pub fn bind_future<F: Future>(&self, future: F) -> ZonedFuture<F> {
        ZonedFuture {
            zone: self.clone(),
            future: Box::pin(future),
        }
    }
}
