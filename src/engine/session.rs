//! Session Coordinator
//!
//! Single owner of the update session. The protocol state machine and the
//! Update Manager are only reached through this lock, one call at a time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::{info, warn};

use crate::engine::protocol::{IngestResult, ProtocolState, ProtocolStateMachine};
use crate::engine::storage::FirmwareStorage;
use crate::engine::updater::UpdateManager;

struct Session<S> {
    machine: ProtocolStateMachine,
    manager: UpdateManager<S>,
}

impl<S: FirmwareStorage> Session<S> {
    fn reset(&mut self) {
        self.machine.reset();
        self.manager.abort();
    }
}

pub struct SessionCoordinator<S> {
    session: Mutex<Session<S>>,
}

impl<S: FirmwareStorage> SessionCoordinator<S> {
    pub fn new(storage: S) -> Self {
        Self {
            session: Mutex::new(Session {
                machine: ProtocolStateMachine::new(),
                manager: UpdateManager::new(storage),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Session<S>> {
        match self.session.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Session lock poisoned, resetting update session");
                let mut guard = poisoned.into_inner();
                guard.reset();
                self.session.clear_poison();
                guard
            }
        }
    }

    /// Feed one received chunk through the state machine
    pub fn ingest(&self, chunk: &[u8]) -> IngestResult {
        let mut session = self.lock();
        let Session { machine, manager } = &mut *session;
        machine.ingest(manager, chunk)
    }

    /// `ingest`, unless the connection behind `open` has already ended.
    ///
    /// The flag is checked under the session lock, so a chunk still queued
    /// when its connection is cleaned can never reach the next session.
    pub fn ingest_while_open(&self, open: &AtomicBool, chunk: &[u8]) -> Option<IngestResult> {
        let mut session = self.lock();
        if !open.load(Ordering::SeqCst) {
            warn!(len = chunk.len(), "Dropping chunk from a closed connection");
            return None;
        }
        let Session { machine, manager } = &mut *session;
        Some(machine.ingest(manager, chunk))
    }

    /// Drop any in-flight update and rearm for a new header.
    ///
    /// Called by the transport whenever a connection ends, so an abandoned
    /// transfer can never be resumed by the next peer.
    pub fn clean(&self) {
        let mut session = self.lock();
        if session.machine.state() != ProtocolState::ReadHeader || session.manager.is_in_progress() {
            info!(
                received = session.machine.bytes_written(),
                "Discarding unfinished update session"
            );
        }
        session.reset();
    }

    pub fn state(&self) -> ProtocolState {
        self.lock().machine.state()
    }

    pub fn bytes_received(&self) -> u64 {
        self.lock().machine.bytes_written()
    }

    pub fn is_update_in_progress(&self) -> bool {
        self.lock().manager.is_in_progress()
    }
}
