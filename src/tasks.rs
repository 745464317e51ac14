use std::any::Any;
use std::future::Future;
use thiserror::Error;
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
pub enum TaskFailure {
    #[error("task {name} failed: {source:#}")]
    Errored {
        name: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("task {name} panicked: {message}")]
    Panicked { name: String, message: String },
    #[error("task {name} was cancelled")]
    Cancelled { name: String },
}

/// Runs `fut` in its own task and reports how it ended. Errors and panics are
/// logged and returned as a [`TaskFailure`]; the task is not restarted.
pub fn spawn_supervised<F>(name: impl Into<String>, fut: F) -> JoinHandle<Result<(), TaskFailure>>
where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let name = name.into();
    let inner = tokio::spawn(fut);
    tokio::spawn(async move {
        let outcome = match inner.await {
            Ok(Ok(())) => {
                tracing::debug!(task=%name, "task finished");
                return Ok(());
            }
            Ok(Err(source)) => TaskFailure::Errored { name, source },
            Err(err) if err.is_panic() => TaskFailure::Panicked {
                name,
                message: panic_message(err.into_panic()),
            },
            Err(_) => TaskFailure::Cancelled { name },
        };
        tracing::error!(error=%outcome, "supervised task exited");
        Err(outcome)
    })
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
