//! Multiplexer registrations shared by the dispatcher and the event loop
//!
//! The dispatcher adds registrations while the event loop may be parked in
//! `Poll::poll`. Both sides go through one lock: the dispatcher wakes the
//! loop and registers under it, and the loop passes through it before every
//! poll. Channels are only closed under the same lock.

use crate::error::{EngineError, Result};
use crate::flow::Flow;
use mio::{Interest, Poll, Registry, Token, Waker};
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{trace, warn};

/// Reserved for the waker; flow tokens start above it.
pub const WAKE_TOKEN: Token = Token(0);

pub struct Selector {
    registry: Registry,
    waker: Waker,
    flows: Mutex<HashMap<Token, Arc<Flow>>>,
    next_token: AtomicUsize,
}

impl Selector {
    pub fn new(poll: &Poll) -> Result<Self> {
        let registry = poll
            .registry()
            .try_clone()
            .map_err(|e| EngineError::Multiplexer(format!("Failed to clone registry: {}", e)))?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)
            .map_err(|e| EngineError::Multiplexer(format!("Failed to create waker: {}", e)))?;

        Ok(Self {
            registry,
            waker,
            flows: Mutex::new(HashMap::new()),
            next_token: AtomicUsize::new(WAKE_TOKEN.0 + 1),
        })
    }

    pub fn lock(&self) -> SelectorGuard<'_> {
        SelectorGuard {
            selector: self,
            flows: self.flows.lock(),
        }
    }

    /// Wait for any registration in progress to finish.
    pub fn barrier(&self) {
        drop(self.flows.lock());
    }

    pub fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            warn!("Failed to wake event loop: {}", e);
        }
    }

    /// Flow registered under `token`, if it is still registered.
    pub fn flow_for(&self, token: Token) -> Option<Arc<Flow>> {
        self.flows.lock().get(&token).cloned()
    }

    pub fn len(&self) -> usize {
        self.flows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.lock().is_empty()
    }

    fn allocate(&self) -> Token {
        Token(self.next_token.fetch_add(1, Ordering::Relaxed))
    }
}

/// Held while touching registrations or closing channels.
pub struct SelectorGuard<'a> {
    selector: &'a Selector,
    flows: MutexGuard<'a, HashMap<Token, Arc<Flow>>>,
}

impl SelectorGuard<'_> {
    /// Register the flow's channel with `interest`, waking the loop first.
    pub fn register(&mut self, flow: &Arc<Flow>, interest: Interest) -> Result<Token> {
        self.selector.wake();

        let mut channel = flow.channel();
        let channel = channel.as_mut().ok_or(EngineError::NoChannel)?;
        let token = self.selector.allocate();
        self.selector
            .registry
            .register(channel.source(), token, interest)?;

        self.flows.insert(token, flow.clone());
        flow.set_token(Some(token));
        trace!("[{}] {} registered as {:?} for {:?}", flow.id(), flow.key(), token, interest);
        Ok(token)
    }

    pub fn reregister(&mut self, flow: &Arc<Flow>, interest: Interest) -> Result<()> {
        let token = flow.token().ok_or(EngineError::NoChannel)?;
        let mut channel = flow.channel();
        let channel = channel.as_mut().ok_or(EngineError::NoChannel)?;
        self.selector
            .registry
            .reregister(channel.source(), token, interest)?;
        Ok(())
    }

    /// Cancel the flow's registration, keeping its channel open.
    pub fn deregister(&mut self, flow: &Arc<Flow>) {
        if let Some(token) = flow.token() {
            self.flows.remove(&token);
            flow.set_token(None);
        }
        if let Some(channel) = flow.channel().as_mut() {
            // Never-registered or already-deregistered sources report an
            // error here; nothing is left to undo either way
            let _ = self.selector.registry.deregister(channel.source());
        }
    }

    /// Cancel the registration and drop the channel.
    pub fn close(&mut self, flow: &Arc<Flow>) {
        self.deregister(flow);
        if flow.channel().take().is_some() {
            trace!("[{}] {} channel closed", flow.id(), flow.key());
        }
    }
}
