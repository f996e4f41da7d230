//! Queued units of work and their completion handles.

use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{Instrument, error};

use super::types::{JobError, Tally};

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A unit of work held by a queue, independent of its result type.
pub(crate) trait ErasedJob: Send {
    /// Number of caller-visible results this job fulfils.
    fn weight(&self) -> u64 {
        1
    }

    /// Execute the job and fulfil its handle(s).
    fn run(self: Box<Self>, timeout: Option<Duration>) -> BoxFuture<'static, Tally>;

    /// Fulfil the handle(s) with `error` without running.
    fn reject(self: Box<Self>, error: JobError);
}

/// A job whose result is delivered to one [`JobHandle`].
pub(crate) struct PendingJob<T> {
    future: BoxFuture<'static, Result<T, JobError>>,
    reply: oneshot::Sender<Result<T, JobError>>,
}

impl<T: Send + 'static> PendingJob<T> {
    pub(crate) fn new<Fut>(future: Fut) -> (Self, JobHandle<T>)
    where
        Fut: Future<Output = Result<T, JobError>> + Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        let job = Self {
            future: Box::pin(future),
            reply,
        };
        (job, JobHandle { rx })
    }
}

impl<T: Send + 'static> ErasedJob for PendingJob<T> {
    fn run(self: Box<Self>, timeout: Option<Duration>) -> BoxFuture<'static, Tally> {
        let PendingJob { future, reply } = *self;
        Box::pin(async move {
            let result = run_isolated(future, timeout).await;
            let tally = Tally::of(&result);
            // The caller may have dropped its handle.
            let _ = reply.send(result);
            tally
        })
    }

    fn reject(self: Box<Self>, error: JobError) {
        let _ = self.reply.send(Err(error));
    }
}

/// Completion handle of a submitted job.
///
/// Resolves once that job (or that batch entry) has finished. Dropping the
/// handle does not cancel the job.
#[derive(Debug)]
pub struct JobHandle<T> {
    rx: oneshot::Receiver<Result<T, JobError>>,
}

impl<T> Future for JobHandle<T> {
    type Output = Result<T, JobError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(JobError::Discarded)))
    }
}

/// Run `future` in its own task, bounded by `timeout`.
///
/// A panic is contained to the job and reported as an exhausted single
/// attempt; a timeout aborts the task.
pub(crate) async fn run_isolated<T: Send + 'static>(
    future: BoxFuture<'static, Result<T, JobError>>,
    timeout: Option<Duration>,
) -> Result<T, JobError> {
    let mut task = tokio::spawn(future.in_current_span());

    let joined = match timeout {
        Some(limit) => match tokio::time::timeout(limit, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                task.abort();
                error!(timeout_ms = limit.as_millis() as u64, "job timed out");
                return Err(JobError::Timeout(limit));
            }
        },
        None => task.await,
    };

    match joined {
        Ok(result) => result,
        Err(join_error) if join_error.is_panic() => {
            let message = panic_message(join_error.into_panic());
            error!(panic = %message, "job panicked");
            Err(JobError::ExhaustedRetries {
                attempts: 1,
                last: Box::new(JobError::Internal(format!("job panicked: {message}"))),
            })
        }
        Err(_) => Err(JobError::internal("job task was cancelled")),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
