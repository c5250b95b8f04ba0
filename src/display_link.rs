use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::mpsc::{self, SyncSender};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use log::{debug, warn};

use crate::display_msg::{Instruction, InstructionKind, Reply};

/// How long a correlated call waits for its reply.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(3);

type PendingCalls = Mutex<HashMap<u32, SyncSender<bool>>>;

/// The host side of one connected screen unit.
///
/// Outbound frames are written under a lock so concurrent callers never
/// interleave. Replies are fed in by the connection's reader thread through
/// [`DisplayLink::resolve`].
pub struct DisplayLink {
    unit: u8,
    writer: Mutex<Box<dyn Write + Send>>,
    pending: PendingCalls,
    timeout: Duration,
}

/// Removes the pending entry when the call is over, however it ended.
struct PendingSlot<'a> {
    pending: &'a PendingCalls,
    correlation: u32,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.correlation);
    }
}

impl DisplayLink {
    pub fn new(unit: u8, writer: impl Write + Send + 'static) -> DisplayLink {
        DisplayLink {
            unit,
            writer: Mutex::new(Box::new(writer)),
            pending: Mutex::new(HashMap::new()),
            timeout: CALL_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> DisplayLink {
        self.timeout = timeout;
        self
    }

    pub fn unit(&self) -> u8 {
        self.unit
    }

    /// Fire and forget.
    pub fn send(&self, instruction: &Instruction) -> io::Result<()> {
        let frame = instruction.encode();
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer.write_all(&frame)?;
        writer.flush()
    }

    /// Sends an acknowledged instruction and blocks until the unit answers.
    ///
    /// Returns false on timeout, on a write error and when the unit reports failure.
    pub fn call(&self, kind: InstructionKind, param: u16, payload: Vec<u8>) -> bool {
        let (tx, rx) = mpsc::sync_channel(1);
        let slot = self.register(tx);
        let instruction = Instruction::new(kind, param, payload).with_correlation(slot.correlation);

        if let Err(e) = self.send(&instruction) {
            warn!("unit {}: sending {:?} failed: {}", self.unit, kind, e);
            return false;
        }

        match rx.recv_timeout(self.timeout) {
            Ok(success) => success,
            Err(_) => {
                warn!(
                    "unit {}: no reply to {:?} within {:?}",
                    self.unit, kind, self.timeout
                );
                false
            }
        }
    }

    fn register(&self, tx: SyncSender<bool>) -> PendingSlot<'_> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        // Zero marks "no reply wanted" on the unit side.
        let correlation = loop {
            let candidate: u32 = rand::random();
            if candidate != 0 && !pending.contains_key(&candidate) {
                break candidate;
            }
        };
        pending.insert(correlation, tx);
        PendingSlot {
            pending: &self.pending,
            correlation,
        }
    }

    /// Completes the call waiting for this reply. Unknown ids are discarded.
    pub fn resolve(&self, reply: Reply) -> bool {
        let pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        match pending.get(&reply.correlation) {
            Some(tx) => {
                let _ = tx.try_send(reply.success);
                true
            }
            None => {
                debug!(
                    "unit {}: discarding reply for unknown call {:#010x}",
                    self.unit, reply.correlation
                );
                false
            }
        }
    }

    pub fn pending_calls(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
