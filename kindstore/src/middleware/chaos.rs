use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;

use super::{Middleware, MiddlewareInfo, Operation};
use crate::iterator::IteratorState;
use crate::{Commit, Error, Key, PendingKey, PropertyList, QueryDump, Transaction};

/// When and how [`FailureInjection`] fails a call.
#[derive(Clone, Debug)]
pub struct FaultRule {
    operations: Vec<Operation>,
    key: Option<Key>,
    remaining: Option<usize>,
    error: Error,
}

impl FaultRule {
    /// Fails every call with `error` until narrowed down.
    pub fn new(error: Error) -> Self {
        Self {
            operations: Vec::new(),
            key: None,
            remaining: None,
            error,
        }
    }

    pub fn on(mut self, operation: Operation) -> Self {
        self.operations.push(operation);
        self
    }

    /// Only calls involving `key`.
    pub fn for_key(mut self, key: Key) -> Self {
        self.key = Some(key);
        self
    }

    /// Only the next `count` matching calls.
    pub fn times(mut self, count: usize) -> Self {
        self.remaining = Some(count);
        self
    }

    fn matches(&self, operation: Operation, keys: &[Key]) -> bool {
        if self.remaining == Some(0) {
            return false;
        }
        if !self.operations.is_empty() && !self.operations.contains(&operation) {
            return false;
        }
        match &self.key {
            Some(key) => keys.contains(key),
            None => true,
        }
    }
}

#[derive(Default)]
struct State {
    rules: Vec<FaultRule>,
    calls: HashMap<Operation, usize>,
}

/// Returns configured errors instead of calling the rest of the pipeline.
/// Counts every call it sees, failed or not.
#[derive(Default)]
pub struct FailureInjection {
    state: Mutex<State>,
}

impl FailureInjection {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_rule(&self, rule: FaultRule) {
        self.state().rules.push(rule);
    }

    pub fn clear(&self) {
        self.state().rules.clear();
    }

    /// Calls seen for `operation`.
    pub fn calls(&self, operation: Operation) -> usize {
        self.state().calls.get(&operation).copied().unwrap_or(0)
    }

    fn intercept(&self, operation: Operation, keys: &[Key]) -> Result<(), Error> {
        let mut state = self.state();
        *state.calls.entry(operation).or_default() += 1;
        let Some(rule) = state
            .rules
            .iter_mut()
            .find(|rule| rule.matches(operation, keys))
        else {
            return Ok(());
        };
        if let Some(remaining) = rule.remaining.as_mut() {
            *remaining -= 1;
        }
        log::debug!("injecting failure into {}: {}", operation, rule.error);
        Err(rule.error.clone())
    }
}

/// Fails the hook with the injected error, or forwards it.
macro_rules! intercept {
    ($self:ident, $operation:expr, $keys:expr, $forward:expr) => {
        match $self.intercept($operation, $keys) {
            Ok(()) => $forward,
            Err(err) => Box::pin(async move { Err(err) }),
        }
    };
}

impl Middleware for FailureInjection {
    fn allocate_ids<'a>(
        &'a self,
        info: &'a MiddlewareInfo<'a>,
        keys: &'a [Key],
    ) -> BoxFuture<'a, Result<Vec<Key>, Error>> {
        intercept!(self, Operation::AllocateIds, keys, info.next.allocate_ids(keys))
    }

    fn put_multi_without_tx<'a>(
        &'a self,
        info: &'a MiddlewareInfo<'a>,
        keys: &'a [Key],
        src: &'a [PropertyList],
    ) -> BoxFuture<'a, Result<Vec<Key>, Error>> {
        intercept!(
            self,
            Operation::PutMultiWithoutTx,
            keys,
            info.next.put_multi_without_tx(keys, src)
        )
    }

    fn put_multi_with_tx<'a>(
        &'a self,
        info: &'a MiddlewareInfo<'a>,
        keys: &'a [Key],
        src: &'a [PropertyList],
    ) -> BoxFuture<'a, Result<Vec<PendingKey>, Error>> {
        intercept!(
            self,
            Operation::PutMultiWithTx,
            keys,
            info.next.put_multi_with_tx(keys, src)
        )
    }

    fn get_multi_without_tx<'a>(
        &'a self,
        info: &'a MiddlewareInfo<'a>,
        keys: &'a [Key],
        dst: &'a mut [PropertyList],
    ) -> BoxFuture<'a, Result<(), Error>> {
        intercept!(
            self,
            Operation::GetMultiWithoutTx,
            keys,
            info.next.get_multi_without_tx(keys, dst)
        )
    }

    fn get_multi_with_tx<'a>(
        &'a self,
        info: &'a MiddlewareInfo<'a>,
        keys: &'a [Key],
        dst: &'a mut [PropertyList],
    ) -> BoxFuture<'a, Result<(), Error>> {
        intercept!(
            self,
            Operation::GetMultiWithTx,
            keys,
            info.next.get_multi_with_tx(keys, dst)
        )
    }

    fn delete_multi_without_tx<'a>(
        &'a self,
        info: &'a MiddlewareInfo<'a>,
        keys: &'a [Key],
    ) -> BoxFuture<'a, Result<(), Error>> {
        intercept!(
            self,
            Operation::DeleteMultiWithoutTx,
            keys,
            info.next.delete_multi_without_tx(keys)
        )
    }

    fn delete_multi_with_tx<'a>(
        &'a self,
        info: &'a MiddlewareInfo<'a>,
        keys: &'a [Key],
    ) -> BoxFuture<'a, Result<(), Error>> {
        intercept!(
            self,
            Operation::DeleteMultiWithTx,
            keys,
            info.next.delete_multi_with_tx(keys)
        )
    }

    fn post_commit<'a>(
        &'a self,
        info: &'a MiddlewareInfo<'a>,
        tx: &'a Transaction,
        commit: &'a Commit,
    ) -> BoxFuture<'a, Result<(), Error>> {
        intercept!(self, Operation::PostCommit, &[], info.next.post_commit(tx, commit))
    }

    fn post_rollback<'a>(
        &'a self,
        info: &'a MiddlewareInfo<'a>,
        tx: &'a Transaction,
    ) -> BoxFuture<'a, Result<(), Error>> {
        intercept!(self, Operation::PostRollback, &[], info.next.post_rollback(tx))
    }

    fn run<'a>(
        &'a self,
        info: &'a MiddlewareInfo<'a>,
        dump: &'a QueryDump,
    ) -> BoxFuture<'a, Result<IteratorState, Error>> {
        intercept!(self, Operation::Run, &[], info.next.run(dump))
    }

    fn get_all<'a>(
        &'a self,
        info: &'a MiddlewareInfo<'a>,
        dump: &'a QueryDump,
    ) -> BoxFuture<'a, Result<(Vec<Key>, Vec<PropertyList>), Error>> {
        intercept!(self, Operation::GetAll, &[], info.next.get_all(dump))
    }

    fn next<'a>(
        &'a self,
        info: &'a MiddlewareInfo<'a>,
        dump: &'a QueryDump,
        iter: &'a mut IteratorState,
    ) -> BoxFuture<'a, Result<(Key, PropertyList), Error>> {
        intercept!(self, Operation::Next, &[], info.next.next(dump, iter))
    }

    fn count<'a>(
        &'a self,
        info: &'a MiddlewareInfo<'a>,
        dump: &'a QueryDump,
    ) -> BoxFuture<'a, Result<usize, Error>> {
        intercept!(self, Operation::Count, &[], info.next.count(dump))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rules_narrow_by_operation_key_and_count() {
        let chaos = FailureInjection::new();
        let key = Key::with_id("Data", 1, None);
        chaos.add_rule(
            FaultRule::new(Error::transient("down"))
                .on(Operation::GetMultiWithoutTx)
                .for_key(key.clone())
                .times(1),
        );
        assert!(chaos.intercept(Operation::PutMultiWithoutTx, &[key.clone()]).is_ok());
        assert!(chaos.intercept(Operation::GetMultiWithoutTx, &[]).is_ok());
        assert!(chaos.intercept(Operation::GetMultiWithoutTx, &[key.clone()]).is_err());
        assert!(chaos.intercept(Operation::GetMultiWithoutTx, &[key]).is_ok());
        assert_eq!(chaos.calls(Operation::GetMultiWithoutTx), 3);
    }
}
