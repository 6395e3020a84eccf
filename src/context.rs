//! Request-scoped context: the acting principal plus cancellation
//!
//! Every driver operation receives a [`RequestContext`]. It carries the
//! authenticated principal explicitly (the permission checker reads it at
//! check time) and a cancellation token with an optional deadline that
//! aborts in-flight I/O.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, ReadBuf};
use tokio::time::{Instant, Sleep};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::error::{FileHubError, Result};
use crate::model::{Role, UserId};

/// Authenticated identity on whose behalf an operation runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: UserId,
    pub username: String,
    pub role: Role,
}

impl Principal {
    pub fn new(user_id: UserId, username: impl Into<String>, role: Role) -> Self {
        Self {
            user_id,
            username: username.into(),
            role,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    principal: Option<Principal>,
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl RequestContext {
    /// Context with no principal, no deadline and a fresh token
    pub fn background() -> Self {
        Self::default()
    }

    pub fn for_principal(principal: Principal) -> Self {
        Self::background().with_principal(principal)
    }

    pub fn with_principal(mut self, principal: Principal) -> Self {
        self.principal = Some(principal);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    /// Child context whose token is cancelled along with this one
    pub fn child(&self) -> Self {
        Self {
            principal: self.principal.clone(),
            cancel: self.cancel.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Fail fast if the context is already done
    pub fn check(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(FileHubError::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(FileHubError::TimedOut);
            }
        }
        Ok(())
    }

    /// Run a future, aborting it on cancellation or deadline expiry
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check()?;
        let deadline = async {
            match self.deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(FileHubError::Cancelled),
            _ = deadline => Err(FileHubError::TimedOut),
            res = fut => res,
        }
    }

    /// Wrap a reader so that reads fail once the context is done
    pub fn bind_reader<R>(&self, inner: R) -> CancellableReader<R>
    where
        R: AsyncRead + Send + Unpin,
    {
        CancellableReader {
            inner,
            cancelled: Box::pin(self.cancel.clone().cancelled_owned()),
            deadline: self.deadline.map(|at| Box::pin(tokio::time::sleep_until(at))),
        }
    }
}

/// Reader that surfaces cancellation as an I/O error
pub struct CancellableReader<R> {
    inner: R,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    deadline: Option<Pin<Box<Sleep>>>,
}

impl<R: AsyncRead + Send + Unpin> AsyncRead for CancellableReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.cancelled.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::Interrupted,
                "operation cancelled",
            )));
        }
        if let Some(deadline) = self.deadline.as_mut() {
            if deadline.as_mut().poll(cx).is_ready() {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "operation timed out",
                )));
            }
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

/// Translate an I/O error raised by a [`CancellableReader`] back into the
/// context error it stands for
pub fn map_copy_error(ctx: &RequestContext, err: io::Error) -> FileHubError {
    match ctx.check() {
        Err(ctx_err) => ctx_err,
        Ok(()) => FileHubError::Io(err),
    }
}
