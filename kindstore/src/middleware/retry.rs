use std::time::Duration;

use futures::future::BoxFuture;

use super::{LogFn, Middleware, MiddlewareInfo, Operation, emit};
use crate::{Context, Error, Key, PendingKey, PropertyList, QueryDump};

#[derive(Clone)]
pub struct RetryOptions {
    /// Total attempts, the first one included.
    pub retry_limit: u32,
    pub min_backoff: Duration,
    pub max_backoff: Option<Duration>,
    pub max_doublings: Option<u32>,
    pub logf: Option<LogFn>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            retry_limit: 3,
            min_backoff: Duration::from_millis(100),
            max_backoff: None,
            max_doublings: None,
            logf: None,
        }
    }
}

impl RetryOptions {
    /// Wait after failed attempt `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let doublings = match self.max_doublings {
            Some(max) => attempt.min(max),
            None => attempt,
        }
        .saturating_sub(1)
        .min(31);
        let wait = self.min_backoff.saturating_mul(1u32 << doublings);
        match self.max_backoff {
            Some(max) => wait.min(max),
            None => wait,
        }
    }
}

/// Re-issues failed calls with exponential backoff.
///
/// Per-key failures (`Error::Multi`), cancellations and validation errors
/// are returned at once. `run`, `next` and the commit hooks are never retried.
#[derive(Clone, Default)]
pub struct Retry {
    options: RetryOptions,
}

impl Retry {
    pub fn new(options: RetryOptions) -> Self {
        Self { options }
    }

    fn attempts(&self, operation: Operation) -> Attempts<'_> {
        Attempts {
            options: &self.options,
            operation,
            attempt: 0,
        }
    }
}

struct Attempts<'o> {
    options: &'o RetryOptions,
    operation: Operation,
    attempt: u32,
}

impl Attempts<'_> {
    /// Called after a failed attempt. Waits out the backoff and returns
    /// whether to try again.
    async fn again(&mut self, ctx: &Context, err: &Error) -> Result<bool, Error> {
        self.attempt += 1;
        if err.is_multi()
            || err.is_cancellation()
            || err.is_validation()
            || self.attempt >= self.options.retry_limit
        {
            return Ok(false);
        }
        let wait = self.options.backoff(self.attempt);
        emit(
            &self.options.logf,
            &format!(
                "{}: attempt {} failed: {}; retrying after {:?}",
                self.operation, self.attempt, err, wait
            ),
        );
        ctx.sleep(wait).await?;
        Ok(true)
    }
}

/// Retries `$call` while `$attempts` allows it.
macro_rules! retrying {
    ($attempts:expr, $ctx:expr, $call:expr) => {{
        let mut attempts = $attempts;
        loop {
            let err = match $call.await {
                Err(err) => err,
                result => break result,
            };
            if !attempts.again($ctx, &err).await? {
                break Err(err);
            }
        }
    }};
}

impl Middleware for Retry {
    fn allocate_ids<'a>(
        &'a self,
        info: &'a MiddlewareInfo<'a>,
        keys: &'a [Key],
    ) -> BoxFuture<'a, Result<Vec<Key>, Error>> {
        Box::pin(async move {
            retrying!(
                self.attempts(Operation::AllocateIds),
                info.context,
                info.next.allocate_ids(keys)
            )
        })
    }

    fn put_multi_without_tx<'a>(
        &'a self,
        info: &'a MiddlewareInfo<'a>,
        keys: &'a [Key],
        src: &'a [PropertyList],
    ) -> BoxFuture<'a, Result<Vec<Key>, Error>> {
        Box::pin(async move {
            retrying!(
                self.attempts(Operation::PutMultiWithoutTx),
                info.context,
                info.next.put_multi_without_tx(keys, src)
            )
        })
    }

    fn put_multi_with_tx<'a>(
        &'a self,
        info: &'a MiddlewareInfo<'a>,
        keys: &'a [Key],
        src: &'a [PropertyList],
    ) -> BoxFuture<'a, Result<Vec<PendingKey>, Error>> {
        Box::pin(async move {
            retrying!(
                self.attempts(Operation::PutMultiWithTx),
                info.context,
                info.next.put_multi_with_tx(keys, src)
            )
        })
    }

    fn get_multi_without_tx<'a>(
        &'a self,
        info: &'a MiddlewareInfo<'a>,
        keys: &'a [Key],
        dst: &'a mut [PropertyList],
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            retrying!(
                self.attempts(Operation::GetMultiWithoutTx),
                info.context,
                info.next.get_multi_without_tx(keys, &mut *dst)
            )
        })
    }

    fn get_multi_with_tx<'a>(
        &'a self,
        info: &'a MiddlewareInfo<'a>,
        keys: &'a [Key],
        dst: &'a mut [PropertyList],
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            retrying!(
                self.attempts(Operation::GetMultiWithTx),
                info.context,
                info.next.get_multi_with_tx(keys, &mut *dst)
            )
        })
    }

    fn delete_multi_without_tx<'a>(
        &'a self,
        info: &'a MiddlewareInfo<'a>,
        keys: &'a [Key],
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            retrying!(
                self.attempts(Operation::DeleteMultiWithoutTx),
                info.context,
                info.next.delete_multi_without_tx(keys)
            )
        })
    }

    fn delete_multi_with_tx<'a>(
        &'a self,
        info: &'a MiddlewareInfo<'a>,
        keys: &'a [Key],
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            retrying!(
                self.attempts(Operation::DeleteMultiWithTx),
                info.context,
                info.next.delete_multi_with_tx(keys)
            )
        })
    }

    fn get_all<'a>(
        &'a self,
        info: &'a MiddlewareInfo<'a>,
        dump: &'a QueryDump,
    ) -> BoxFuture<'a, Result<(Vec<Key>, Vec<PropertyList>), Error>> {
        Box::pin(async move {
            retrying!(
                self.attempts(Operation::GetAll),
                info.context,
                info.next.get_all(dump)
            )
        })
    }

    fn count<'a>(
        &'a self,
        info: &'a MiddlewareInfo<'a>,
        dump: &'a QueryDump,
    ) -> BoxFuture<'a, Result<usize, Error>> {
        Box::pin(async move {
            retrying!(
                self.attempts(Operation::Count),
                info.context,
                info.next.count(dump)
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_from_the_minimum() {
        let options = RetryOptions::default();
        assert_eq!(options.backoff(1), Duration::from_millis(100));
        assert_eq!(options.backoff(2), Duration::from_millis(200));
        assert_eq!(options.backoff(4), Duration::from_millis(800));
    }

    #[test]
    fn backoff_respects_caps() {
        let options = RetryOptions {
            max_doublings: Some(2),
            ..Default::default()
        };
        assert_eq!(options.backoff(5), Duration::from_millis(200));

        let options = RetryOptions {
            max_backoff: Some(Duration::from_millis(250)),
            ..Default::default()
        };
        assert_eq!(options.backoff(3), Duration::from_millis(250));
        assert_eq!(options.backoff(60), Duration::from_millis(250));
    }

    #[tokio::test]
    async fn stops_on_multi_and_cancellation() {
        let options = RetryOptions {
            min_backoff: Duration::from_millis(1),
            ..Default::default()
        };
        let ctx = Context::background();
        let mut attempts = Attempts {
            options: &options,
            operation: Operation::GetMultiWithoutTx,
            attempt: 0,
        };
        assert!(!attempts.again(&ctx, &Error::Multi(crate::MultiError::new(1))).await.unwrap());
        let mut attempts = Attempts { attempt: 0, ..attempts };
        assert!(!attempts.again(&ctx, &Error::Canceled).await.unwrap());
        let mut attempts = Attempts { attempt: 0, ..attempts };
        assert!(attempts.again(&ctx, &Error::transient("busy")).await.unwrap());
        assert!(attempts.again(&ctx, &Error::transient("busy")).await.unwrap());
        assert!(!attempts.again(&ctx, &Error::transient("busy")).await.unwrap());
    }

    #[tokio::test]
    async fn stops_on_validation_errors() {
        let options = RetryOptions {
            min_backoff: Duration::from_millis(1),
            ..Default::default()
        };
        let ctx = Context::background();
        for err in [
            Error::InvalidQuery("bad".to_string()),
            Error::InvalidKey("bad".to_string()),
            Error::InvalidArgument("bad".to_string()),
            Error::TransactionFinished,
        ] {
            let mut attempts = Attempts {
                options: &options,
                operation: Operation::GetMultiWithoutTx,
                attempt: 0,
            };
            assert!(!attempts.again(&ctx, &err).await.unwrap(), "{err} was retried");
        }
    }
}
