use futures::future::BoxFuture;

use super::{LogFn, Middleware, MiddlewareInfo, Operation, emit};
use crate::{Error, Key, MultiError, PropertyList};

#[derive(Clone)]
pub struct SplitOptions {
    pub put_split_threshold: usize,
    pub get_split_threshold: usize,
    pub logf: Option<LogFn>,
}

impl Default for SplitOptions {
    fn default() -> Self {
        Self {
            put_split_threshold: 500,
            get_split_threshold: 1000,
            logf: None,
        }
    }
}

/// Breaks large non-transactional puts and gets into windows the backend
/// accepts, issued in order.
#[derive(Clone, Default)]
pub struct Split {
    options: SplitOptions,
}

impl Split {
    pub fn new(options: SplitOptions) -> Self {
        Self { options }
    }

    fn announce(&self, operation: Operation, len: usize, threshold: usize) {
        emit(
            &self.options.logf,
            &format!(
                "{}: splitting {} keys into {} requests",
                operation,
                len,
                len.div_ceil(threshold)
            ),
        );
    }
}

/// Folds a window's outcome into the merged multi error. Whole-call errors
/// abort the split.
fn merge(merged: &mut MultiError, offset: usize, result: Result<(), Error>) -> Result<(), Error> {
    match result {
        Ok(()) => Ok(()),
        Err(Error::Multi(m)) => {
            for (i, err) in m.into_inner().into_iter().enumerate() {
                if let Some(err) = err {
                    merged.set(offset + i, err);
                }
            }
            Ok(())
        }
        Err(err) => Err(err),
    }
}

impl Middleware for Split {
    fn put_multi_without_tx<'a>(
        &'a self,
        info: &'a MiddlewareInfo<'a>,
        keys: &'a [Key],
        src: &'a [PropertyList],
    ) -> BoxFuture<'a, Result<Vec<Key>, Error>> {
        let threshold = self.options.put_split_threshold.max(1);
        if keys.len() <= threshold || keys.len() != src.len() {
            return info.next.put_multi_without_tx(keys, src);
        }
        Box::pin(async move {
            self.announce(Operation::PutMultiWithoutTx, keys.len(), threshold);
            let mut merged = MultiError::new(keys.len());
            let mut done = Vec::with_capacity(keys.len());
            for (window, (ks, ss)) in keys.chunks(threshold).zip(src.chunks(threshold)).enumerate() {
                match info.next.put_multi_without_tx(ks, ss).await {
                    Ok(stored) => done.extend(stored),
                    Err(err) => {
                        merge(&mut merged, window * threshold, Err(err))?;
                        done.extend(ks.iter().cloned());
                    }
                }
            }
            merged.into_result()?;
            Ok(done)
        })
    }

    fn get_multi_without_tx<'a>(
        &'a self,
        info: &'a MiddlewareInfo<'a>,
        keys: &'a [Key],
        dst: &'a mut [PropertyList],
    ) -> BoxFuture<'a, Result<(), Error>> {
        let threshold = self.options.get_split_threshold.max(1);
        if keys.len() <= threshold || keys.len() != dst.len() {
            return info.next.get_multi_without_tx(keys, dst);
        }
        Box::pin(async move {
            self.announce(Operation::GetMultiWithoutTx, keys.len(), threshold);
            let mut merged = MultiError::new(keys.len());
            for (window, (ks, ds)) in keys
                .chunks(threshold)
                .zip(dst.chunks_mut(threshold))
                .enumerate()
            {
                let result = info.next.get_multi_without_tx(ks, ds).await;
                merge(&mut merged, window * threshold, result)?;
            }
            merged.into_result()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_places_errors_at_original_positions() {
        let mut merged = MultiError::new(5);
        let mut window = MultiError::new(2);
        window.set(1, Error::NoSuchEntity);
        merge(&mut merged, 2, Err(Error::Multi(window))).unwrap();
        assert!(merged.get(3).is_some_and(Error::is_no_such_entity));
        assert!(merged.get(2).is_none());
        assert!(merge(&mut merged, 0, Err(Error::Canceled)).is_err());
    }
}
