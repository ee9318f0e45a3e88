//! LIFO stack of compensating actions for the launch pipeline.
//!
//! Each successful external side effect pushes its inverse; a failure
//! later in the pipeline rewinds the stack in reverse order. Undo
//! failures are logged and skipped — rewinding is best-effort cleanup,
//! not a transaction.

use futures_util::future::BoxFuture;

use updraft_domain::Result;

type UndoOp = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

#[derive(Default)]
pub struct UndoStack {
    ops: Vec<(String, UndoOp)>,
}

impl UndoStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<F>(&mut self, label: impl Into<String>, op: F)
    where
        F: FnOnce() -> BoxFuture<'static, Result<()>> + Send + 'static,
    {
        self.ops.push((label.into(), Box::new(op)));
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Run every pushed action, most recent first.
    pub async fn rewind(self) {
        for (label, op) in self.ops.into_iter().rev() {
            tracing::info!(step = %label, "rewinding");
            if let Err(error) = op().await {
                tracing::warn!(step = %label, %error, "undo step failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use parking_lot::Mutex;

    #[tokio::test]
    async fn rewind_runs_in_reverse_order() {
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let mut undo = UndoStack::new();
        for label in ["first", "second", "third"] {
            let order = order.clone();
            undo.push(label, move || {
                Box::pin(async move {
                    order.lock().push(label);
                    Ok(())
                })
            });
        }

        undo.rewind().await;
        assert_eq!(*order.lock(), vec!["third", "second", "first"]);
    }

    #[tokio::test]
    async fn a_failing_step_does_not_stop_the_rewind() {
        let ran: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let mut undo = UndoStack::new();

        let ran_ok = ran.clone();
        undo.push("survivor", move || {
            Box::pin(async move {
                ran_ok.lock().push("survivor");
                Ok(())
            })
        });
        undo.push("doomed", || {
            Box::pin(async { Err(updraft_domain::Error::Transport("boom".into())) })
        });

        undo.rewind().await;
        assert_eq!(*ran.lock(), vec!["survivor"]);
    }
}
