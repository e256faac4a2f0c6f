//! Retirement manager: decides when a completed request may be acknowledged.
//!
//! Every dispatched invocation is registered under a [`CompletionToken`]. A
//! token retires once its own processing completed, it is not held, and every
//! token it was deferred onto has retired. Retiring a token releases the
//! waiters of every chain that was deferred onto it, earliest-deferred first,
//! followed by its own waiters in registration order.
//!
//! One manager exists per entity. Deferral only links tokens of the same
//! entity, so the manager's lock covers exactly the tokens a retirement can
//! touch.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use thiserror::Error;

use crate::core::{ClientId, CompletionToken, ConcurrencyKey, ServerEntityRequest};
use crate::error::{Effect, Transience};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RetirementError {
    #[error("completion token {0} is not registered")]
    UnknownToken(CompletionToken),
    #[error("completion token {0} completed twice")]
    CompletedTwice(CompletionToken),
    #[error("completion token {0} cannot defer onto itself")]
    SelfDeferral(CompletionToken),
    #[error("completion token {0} released without a hold")]
    NotHeld(CompletionToken),
    #[error("retirement state poisoned")]
    Poisoned,
}

impl RetirementError {
    /// All retirement errors are protocol bugs: ordering can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        true
    }

    pub fn transience(&self) -> Transience {
        Transience::Permanent
    }

    pub fn effect(&self) -> Effect {
        Effect::Unknown
    }
}

#[derive(Debug)]
struct Entry {
    key: ConcurrencyKey,
    waiters: Vec<ServerEntityRequest>,
    completed: bool,
    /// Deferral targets that have not retired yet.
    blocked_on: usize,
    /// Tokens deferred onto this one, in deferral order.
    dependents: Vec<CompletionToken>,
    holds: u32,
}

impl Entry {
    fn new(key: ConcurrencyKey) -> Self {
        Self {
            key,
            waiters: Vec::new(),
            completed: false,
            blocked_on: 0,
            dependents: Vec::new(),
            holds: 0,
        }
    }

    fn is_retireable(&self) -> bool {
        self.completed && self.blocked_on == 0 && self.holds == 0
    }
}

#[derive(Debug, Default)]
struct RetirementState {
    entries: HashMap<CompletionToken, Entry>,
}

enum Visit {
    Enter(CompletionToken),
    Emit(CompletionToken),
}

impl RetirementState {
    /// Removes `root` and every dependent chain it unblocks.
    ///
    /// Post-order walk: dependents (in deferral order) are emitted before the
    /// token they were waiting on.
    fn drain_from(&mut self, root: CompletionToken) -> Vec<ServerEntityRequest> {
        let mut out = Vec::new();
        let mut stack = vec![Visit::Enter(root)];
        while let Some(visit) = stack.pop() {
            match visit {
                Visit::Enter(token) => {
                    stack.push(Visit::Emit(token));
                    let dependents = self
                        .entries
                        .get_mut(&token)
                        .map(|entry| std::mem::take(&mut entry.dependents))
                        .unwrap_or_default();
                    let mut unblocked = Vec::new();
                    for dependent in dependents {
                        if let Some(entry) = self.entries.get_mut(&dependent) {
                            entry.blocked_on = entry.blocked_on.saturating_sub(1);
                            if entry.is_retireable() {
                                unblocked.push(dependent);
                            }
                        }
                    }
                    for dependent in unblocked.into_iter().rev() {
                        stack.push(Visit::Enter(dependent));
                    }
                }
                Visit::Emit(token) => {
                    if let Some(entry) = self.entries.remove(&token) {
                        tracing::trace!(
                            token = %token,
                            key = %entry.key,
                            waiters = entry.waiters.len(),
                            "retired"
                        );
                        out.extend(entry.waiters);
                    }
                }
            }
        }
        out
    }
}

#[derive(Debug, Default)]
pub struct RetirementManager {
    state: Mutex<RetirementState>,
}

impl RetirementManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, RetirementState>, RetirementError> {
        self.state.lock().map_err(|_| RetirementError::Poisoned)
    }

    /// Adds `request` as a waiter on `token`, creating the entry if needed.
    pub fn register_with_message(
        &self,
        request: ServerEntityRequest,
        token: CompletionToken,
        key: ConcurrencyKey,
    ) -> Result<(), RetirementError> {
        let mut state = self.lock()?;
        state
            .entries
            .entry(token)
            .or_insert_with(|| Entry::new(key))
            .waiters
            .push(request);
        Ok(())
    }

    /// Makes `current` wait for `next` to retire.
    ///
    /// `next` is created if it has not been registered yet; its waiters
    /// typically arrive when the follow-up is dispatched.
    pub fn defer_retirement(
        &self,
        current: CompletionToken,
        next: CompletionToken,
    ) -> Result<(), RetirementError> {
        if current == next {
            return Err(RetirementError::SelfDeferral(current));
        }
        let mut state = self.lock()?;
        let key = match state.entries.get_mut(&current) {
            Some(entry) => {
                entry.blocked_on += 1;
                entry.key
            }
            None => return Err(RetirementError::UnknownToken(current)),
        };
        state
            .entries
            .entry(next)
            .or_insert_with(|| Entry::new(key))
            .dependents
            .push(current);
        Ok(())
    }

    /// Marks `token` complete and returns every request now safe to retire.
    ///
    /// Empty when the token is still held or waiting on a deferral target.
    pub fn retire_for_completion(
        &self,
        token: CompletionToken,
    ) -> Result<Vec<ServerEntityRequest>, RetirementError> {
        let mut state = self.lock()?;
        let entry = state
            .entries
            .get_mut(&token)
            .ok_or(RetirementError::UnknownToken(token))?;
        if entry.completed {
            return Err(RetirementError::CompletedTwice(token));
        }
        entry.completed = true;
        if !entry.is_retireable() {
            tracing::trace!(
                token = %token,
                blocked_on = entry.blocked_on,
                holds = entry.holds,
                "retirement pending"
            );
            return Ok(Vec::new());
        }
        Ok(state.drain_from(token))
    }

    /// Prevents `token` from retiring until a matching [`release`](Self::release).
    pub fn hold(&self, token: CompletionToken) -> Result<(), RetirementError> {
        let mut state = self.lock()?;
        let entry = state
            .entries
            .get_mut(&token)
            .ok_or(RetirementError::UnknownToken(token))?;
        entry.holds += 1;
        Ok(())
    }

    /// Drops one hold. `true` when the token is now retireable; collect its
    /// requests with [`drain_released`](Self::drain_released).
    pub fn release(&self, token: CompletionToken) -> Result<bool, RetirementError> {
        let mut state = self.lock()?;
        let entry = state
            .entries
            .get_mut(&token)
            .ok_or(RetirementError::UnknownToken(token))?;
        if entry.holds == 0 {
            return Err(RetirementError::NotHeld(token));
        }
        entry.holds -= 1;
        Ok(entry.is_retireable())
    }

    /// Retires a token that became retireable through [`release`](Self::release).
    pub fn drain_released(
        &self,
        token: CompletionToken,
    ) -> Result<Vec<ServerEntityRequest>, RetirementError> {
        let mut state = self.lock()?;
        match state.entries.get(&token) {
            Some(entry) if entry.is_retireable() => Ok(state.drain_from(token)),
            Some(_) => Ok(Vec::new()),
            None => Err(RetirementError::UnknownToken(token)),
        }
    }

    pub fn is_retireable(&self, token: CompletionToken) -> Result<bool, RetirementError> {
        let state = self.lock()?;
        Ok(state
            .entries
            .get(&token)
            .is_some_and(Entry::is_retireable))
    }

    /// Drops every waiter that belongs to `client`.
    ///
    /// Tokens stay registered so internal waiters and dependents still retire
    /// normally. Returns the purged requests.
    pub fn purge_client(
        &self,
        client: ClientId,
    ) -> Result<Vec<ServerEntityRequest>, RetirementError> {
        let mut state = self.lock()?;
        let mut purged = Vec::new();
        for entry in state.entries.values_mut() {
            let (gone, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut entry.waiters)
                .into_iter()
                .partition(|request| request.client() == Some(client));
            entry.waiters = kept;
            purged.extend(gone);
        }
        Ok(purged)
    }

    /// Whether `token` still has a waiter that belongs to `client`.
    pub fn has_client_waiter(
        &self,
        token: CompletionToken,
        client: ClientId,
    ) -> Result<bool, RetirementError> {
        let state = self.lock()?;
        Ok(state.entries.get(&token).is_some_and(|entry| {
            entry
                .waiters
                .iter()
                .any(|request| request.client() == Some(client))
        }))
    }

    /// Number of tokens not yet retired.
    pub fn pending(&self) -> usize {
        self.lock().map(|state| state.entries.len()).unwrap_or(0)
    }
}
