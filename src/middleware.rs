// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Middleware
//!
//! Hooks run synchronously around every handler invocation. Before-hooks run for
//! every parsed delivery; after-hooks only once the handler succeeded. A hook
//! error stops the chain and is reported as a delivery failure.

use crate::{
    errors::HandlerError,
    message::{Envelope, MessageBody},
};
use std::fmt;

type HookFn = dyn Fn(&MessageBody, &Envelope) -> Result<(), HandlerError> + Send + Sync;

/// Where a hook is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MiddlewarePhase {
    HandleBefore,
    HandleAfter,
}

/// A registered hook.
pub struct Middleware {
    phase: MiddlewarePhase,
    func: Box<HookFn>,
}

impl Middleware {
    pub fn phase(&self) -> MiddlewarePhase {
        self.phase
    }

    fn call(&self, body: &MessageBody, envelope: &Envelope) -> Result<(), HandlerError> {
        (self.func)(body, envelope)
    }
}

impl fmt::Debug for Middleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Middleware")
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}

/// Ordered before/after hook lists.
#[derive(Debug, Default)]
pub struct MiddlewareChain {
    before: Vec<Middleware>,
    after: Vec<Middleware>,
}

impl MiddlewareChain {
    pub fn new() -> MiddlewareChain {
        MiddlewareChain::default()
    }

    pub fn register<F>(&mut self, phase: MiddlewarePhase, func: F)
    where
        F: Fn(&MessageBody, &Envelope) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let middleware = Middleware {
            phase,
            func: Box::new(func),
        };

        match phase {
            MiddlewarePhase::HandleBefore => self.before.push(middleware),
            MiddlewarePhase::HandleAfter => self.after.push(middleware),
        }
    }

    pub fn register_before<F>(&mut self, func: F)
    where
        F: Fn(&MessageBody, &Envelope) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.register(MiddlewarePhase::HandleBefore, func)
    }

    pub fn register_after<F>(&mut self, func: F)
    where
        F: Fn(&MessageBody, &Envelope) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.register(MiddlewarePhase::HandleAfter, func)
    }

    pub fn run_before(&self, body: &MessageBody, envelope: &Envelope) -> Result<(), HandlerError> {
        self.before.iter().try_for_each(|m| m.call(body, envelope))
    }

    pub fn run_after(&self, body: &MessageBody, envelope: &Envelope) -> Result<(), HandlerError> {
        self.after.iter().try_for_each(|m| m.call(body, envelope))
    }

    pub fn len(&self, phase: MiddlewarePhase) -> usize {
        match phase {
            MiddlewarePhase::HandleBefore => self.before.len(),
            MiddlewarePhase::HandleAfter => self.after.len(),
        }
    }
}
