use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use log::{error, info, warn};
use thiserror::Error;

use crate::catalog;
use crate::device_ids::ProbePath;
use crate::protocol;
use crate::transport::{
    ControlRequest, SubmissionError, TransferHandle, TransferStatus, UsbTransport,
};

/// Bound on each stabilization packet; the asynchronous transactions rely on
/// the substrate's own timeout behavior instead.
const STABILIZE_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors that are fatal to a probe attempt. They can only arise while the
/// session is being set up; once the first transfer is queued, later
/// failures are reported on the log and leave the session idle, because
/// there is no caller left to propagate to.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProbeError {
    #[error("unable to queue the identification transfer")]
    Identify(#[source] SubmissionError),

    #[error("unable to queue the mode-switch transfer")]
    Switch(#[source] SubmissionError),
}

/// Where a session currently is in the handshake.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for the wheel to report its identity.
    Identifying,
    /// Waiting for the mode-switch request to go out.
    Switching,
    /// Nothing outstanding: the wheel either switched, or a failure was
    /// logged and it was left alone.
    Idle,
    /// Torn down; completion callbacks must not touch the session.
    Closed,
}

/// Live handshake state for one attached wheel.
///
/// Created on connect; [probe](WheelSession::probe) queues the first
/// transfer and returns. Everything after that (decode, resolution, the
/// mode-switch submission) runs inside the transport's completion context.
/// Dropping the session (or calling [disconnect](WheelSession::disconnect))
/// cancels any in-flight transfer before the buffers go away.
pub struct WheelSession {
    shared: Arc<SessionShared>,
}

struct SessionShared {
    transport: Arc<dyn UsbTransport>,
    state: Mutex<SessionState>,
    settled: Condvar,
}

struct SessionState {
    phase: Phase,
    /// At most one transfer is outstanding per session; the switch transfer
    /// is only built after the identify completion has run. The handle
    /// stays here for the whole delivery so that teardown's cancel waits
    /// out a callback already in progress.
    pending: Option<TransferHandle>,
    /// Identity bytes, kept from the identify completion until teardown.
    response: Option<Box<[u8]>>,
    /// Mode-switch template; the resolved switch code is written into its
    /// value field right before submission.
    switch_request: ControlRequest,
}

impl SessionShared {
    fn state(&self) -> MutexGuard<'_, SessionState> {
        // A poisoned lock means a completion callback panicked; the state
        // is still sound to read and teardown must keep working.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// End the handshake: drop the outstanding-transfer slot and go idle.
    /// Teardown wins if it got there first.
    fn settle_idle(&self) {
        let mut state = self.state();
        state.pending = None;
        if state.phase != Phase::Closed {
            state.phase = Phase::Idle;
        }
        self.settled.notify_all();
    }

    fn is_closed(&self) -> bool {
        self.state().phase == Phase::Closed
    }
}

impl WheelSession {
    /// Start the handshake for a newly connected wheel.
    ///
    /// Returns as soon as the first transfer is queued. `path` comes from
    /// the device table: wheels on the identify path get the stabilization
    /// sequence and the identity query; the T128 is switched blindly with
    /// its hard-coded code since its identity response is unreliable.
    pub fn probe(
        transport: Arc<dyn UsbTransport>,
        path: ProbePath,
    ) -> Result<WheelSession, ProbeError> {
        let shared = Arc::new(SessionShared {
            transport,
            state: Mutex::new(SessionState {
                phase: Phase::Identifying,
                pending: None,
                response: None,
                switch_request: protocol::SWITCH_REQUEST,
            }),
            settled: Condvar::new(),
        });
        let session = WheelSession {
            shared: Arc::clone(&shared),
        };

        match path {
            ProbePath::BlindSwitch {
                switch_code,
            } => {
                submit_switch(&shared, switch_code).map_err(ProbeError::Switch)?;
            }
            ProbePath::Identify => {
                stabilize(shared.transport.as_ref());
                submit_identify(&shared).map_err(ProbeError::Identify)?;
            }
        }

        Ok(session)
    }

    /// Cancel anything in flight and close the session. Once this returns,
    /// no completion callback is running or will run against it.
    pub fn disconnect(&self) {
        let pending = {
            let mut state = self.shared.state();
            state.phase = Phase::Closed;
            state.response = None;
            state.pending.take()
        };
        if let Some(handle) = pending {
            self.shared.transport.cancel_transfer(&handle);
        }
        self.shared.settled.notify_all();
    }

    pub fn phase(&self) -> Phase {
        self.shared.state().phase
    }

    /// Block until the handshake chain has finished (idle or closed), or
    /// until the timeout passes. For callers that report an outcome; the
    /// handshake itself never waits on anything.
    pub fn wait_until_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state();
        while !matches!(state.phase, Phase::Idle | Phase::Closed) {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return false;
            };
            let (next, _) = self
                .shared
                .settled
                .wait_timeout(state, remaining)
                .unwrap_or_else(PoisonError::into_inner);
            state = next;
        }
        true
    }
}

impl Drop for WheelSession {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Send the settling packets that keep a T300RS from crashing when asked for
/// its identity. Runs synchronously before the identify submission. Nothing
/// here can fail the probe: a missing endpoint skips the sequence and a
/// transfer error abandons the remaining packets.
fn stabilize(transport: &dyn UsbTransport) {
    let endpoints = transport.endpoint_addresses();
    let Some(&endpoint) = endpoints.get(1) else {
        warn!("Wrong number of endpoints? Skipping stabilization");
        return;
    };

    for packet in protocol::STABILIZE_PACKETS {
        if let Err(e) = transport.send_interrupt_out(endpoint, packet, STABILIZE_TIMEOUT) {
            warn!("Stabilization packet couldn't be sent: {e}");
            return;
        }
    }
}

fn submit_identify(shared: &Arc<SessionShared>) -> Result<(), SubmissionError> {
    let weak = Arc::downgrade(shared);
    let response = vec![0u8; protocol::IDENTIFY_RESPONSE_LEN].into_boxed_slice();

    let handle = shared.transport.submit_control_in(
        protocol::IDENTIFY_REQUEST,
        response,
        Box::new(move |status, response, received| {
            on_identify_complete(&weak, status, response, received);
        }),
    )?;

    track_pending(shared, handle, Phase::Identifying);
    Ok(())
}

fn submit_switch(shared: &Arc<SessionShared>, switch_code: u16) -> Result<(), SubmissionError> {
    let request = {
        let mut state = shared.state();
        if state.phase == Phase::Closed {
            return Ok(());
        }
        state.phase = Phase::Switching;
        state.switch_request.value = switch_code;
        state.switch_request
    };

    let weak = Arc::downgrade(shared);
    let handle = shared.transport.submit_control_out(
        request,
        Box::new(move |status| on_switch_complete(&weak, status)),
    )?;

    track_pending(shared, handle, Phase::Switching);
    Ok(())
}

/// Record a just-submitted transfer as the session's outstanding one. By the
/// time submission returns, the completion may already have moved the phase
/// along, and teardown may already have begun; only a session still in
/// `expected` takes ownership of the handle.
fn track_pending(shared: &Arc<SessionShared>, handle: TransferHandle, expected: Phase) {
    let mut state = shared.state();
    match state.phase {
        phase if phase == expected => state.pending = Some(handle),
        Phase::Closed => {
            drop(state);
            handle.cancel();
        }
        _ => {}
    }
}

/// Identify completion: decode the record, resolve it against the catalog,
/// and fire the mode-switch. Runs on the transport's completion context;
/// every failure ends the handshake with a log line and an idle session.
fn on_identify_complete(
    session: &Weak<SessionShared>,
    status: TransferStatus,
    response: Box<[u8]>,
    received: usize,
) {
    let Some(shared) = session.upgrade() else {
        return;
    };
    if shared.is_closed() {
        return;
    }

    // The wheel kills the transfer after replying on some setups, so a
    // protocol violation or stall still carries a usable record.
    if !status.device_likely_replied() {
        error!("Transfer to get the wheel model failed: {status:?}");
        shared.settle_idle();
        return;
    }

    let identity = match protocol::decode_identity(&response[..received]) {
        Ok(identity) => identity,
        Err(e) => {
            error!("{e}");
            shared.settle_idle();
            return;
        }
    };
    shared.state().response = Some(response);

    let resolved = match catalog::resolve(identity) {
        Ok(resolved) => resolved,
        Err(e) => {
            error!("{e}, unable to proceed further");
            shared.settle_idle();
            return;
        }
    };

    info!(
        "Wheel with (model, attachment) = ({:#04x}, {:#04x}) is a {}. attachment_found={}",
        identity.model, identity.attachment, resolved.entry.name, resolved.attachment_found
    );

    if let Err(e) = submit_switch(&shared, resolved.entry.switch_code) {
        error!("Error while submitting the mode-switch transfer: {e}");
        shared.settle_idle();
    }
}

/// Mode-switch completion. The wheel is not expected to acknowledge the
/// request in the ordinary sense; nothing is retried or rolled back either
/// way, since the wheel may already be half-switched.
fn on_switch_complete(session: &Weak<SessionShared>, status: TransferStatus) {
    let Some(shared) = session.upgrade() else {
        return;
    };
    if shared.is_closed() {
        return;
    }

    if status.device_likely_replied() {
        info!("Success, the wheel should have been initialized!");
    } else {
        warn!("Mode-switch request seems to have failed: {status:?}");
    }
    shared.settle_idle();
}
