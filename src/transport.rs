use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;

/// Setup stage of a control transfer, in host byte order. Backends convert
/// the multi-byte fields to little-endian when putting them on the wire.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ControlRequest {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

/// Completion status of an asynchronous transfer, normalized across
/// backends.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TransferStatus {
    /// Completed cleanly.
    Completed,
    /// The device broke off the transfer in a way that violates the
    /// protocol. These wheels do this after replying, so the response may
    /// still be usable.
    ProtocolViolation,
    /// The endpoint stalled the request.
    Stall,
    /// The device is no longer on the bus.
    Disconnected,
    /// The substrate's own timeout expired.
    TimedOut,
    /// Any other failure.
    Failed,
}

impl TransferStatus {
    /// Statuses after which the wheel has likely seen and acted on the
    /// request. This family is known to kill a transfer after replying,
    /// which surfaces as a protocol violation or a stall rather than a
    /// clean completion; both count as the device having answered. Not a
    /// documented success path, so do not extend this to other hardware.
    pub fn device_likely_replied(self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::ProtocolViolation | TransferStatus::Stall
        )
    }
}

/// Errors reported synchronously when a transfer cannot be queued at all.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum SubmissionError {
    #[error("device is gone")]
    Disconnected,

    #[error("transfer queue is no longer accepting work")]
    QueueClosed,

    #[error("could not queue transfer: {0}")]
    Other(String),
}

/// Errors from the synchronous interrupt-OUT path used by stabilization.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TransferError {
    #[error("transfer timed out")]
    TimedOut,

    #[error("endpoint stalled")]
    Stall,

    #[error("device is gone")]
    Disconnected,

    #[error("transfer failed: {0}")]
    Other(String),
}

/// Completion callback of a control-IN transfer: the final status, the
/// response buffer handed to [UsbTransport::submit_control_in] (returned to
/// its owner), and the number of bytes actually received, never more than
/// the buffer holds.
pub type ControlInComplete = Box<dyn FnOnce(TransferStatus, Box<[u8]>, usize) + Send>;

/// Completion callback of a control-OUT transfer.
pub type ControlOutComplete = Box<dyn FnOnce(TransferStatus) + Send>;

/// Tracks one submitted transfer so it can be cancelled.
///
/// A backend delivers the completion through [TransferHandle::complete],
/// which refuses to run the callback once the handle is cancelled. In the
/// other direction, [TransferHandle::cancel] waits out a delivery already in
/// progress, so when it returns the callback either has fully run or never
/// will. Session teardown relies on that guarantee.
#[derive(Clone)]
pub struct TransferHandle {
    inner: Arc<HandleState>,
}

struct HandleState {
    phase: Mutex<DeliveryPhase>,
    finished: Condvar,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum DeliveryPhase {
    Pending,
    Delivering,
    Done,
    Cancelled,
}

impl TransferHandle {
    pub fn new() -> Self {
        TransferHandle {
            inner: Arc::new(HandleState {
                phase: Mutex::new(DeliveryPhase::Pending),
                finished: Condvar::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DeliveryPhase> {
        // Poisoning here only means a completion callback panicked; the
        // phase value itself is still meaningful.
        self.inner.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `deliver` unless the transfer was cancelled first. Backends call
    /// this exactly once per transfer; the callback must be consumed (or
    /// dropped) through here so cancellation can suppress it.
    pub fn complete(&self, deliver: impl FnOnce()) {
        {
            let mut phase = self.lock();
            if *phase != DeliveryPhase::Pending {
                return;
            }
            *phase = DeliveryPhase::Delivering;
        }

        deliver();

        let mut phase = self.lock();
        *phase = DeliveryPhase::Done;
        self.inner.finished.notify_all();
    }

    /// Request cancellation. Returns once no completion callback can run
    /// anymore: a pending delivery is suppressed outright, one already in
    /// progress is waited for. Safe to call on a completed transfer.
    pub fn cancel(&self) {
        let mut phase = self.lock();
        match *phase {
            DeliveryPhase::Pending => *phase = DeliveryPhase::Cancelled,
            DeliveryPhase::Delivering => {
                while *phase == DeliveryPhase::Delivering {
                    phase = self
                        .inner
                        .finished
                        .wait(phase)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
            DeliveryPhase::Done | DeliveryPhase::Cancelled => {}
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.lock() == DeliveryPhase::Cancelled
    }
}

impl Default for TransferHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// The bus substrate the handshake runs on. Submissions return immediately;
/// completion callbacks are invoked later from a context the substrate owns,
/// and must not block in it.
pub trait UsbTransport: Send + Sync {
    /// Queue a control-IN transfer. `response` is owned by the caller and
    /// handed back, filled, through the completion.
    fn submit_control_in(
        &self,
        request: ControlRequest,
        response: Box<[u8]>,
        on_complete: ControlInComplete,
    ) -> Result<TransferHandle, SubmissionError>;

    /// Queue a control-OUT transfer with no data stage.
    fn submit_control_out(
        &self,
        request: ControlRequest,
        on_complete: ControlOutComplete,
    ) -> Result<TransferHandle, SubmissionError>;

    /// Best-effort cancellation; see [TransferHandle::cancel] for the
    /// guarantee callers get.
    fn cancel_transfer(&self, handle: &TransferHandle) {
        handle.cancel();
    }

    /// Synchronously send `bytes` over an interrupt-OUT endpoint. Only the
    /// stabilization sequence uses this.
    fn send_interrupt_out(
        &self,
        endpoint: u8,
        bytes: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransferError>;

    /// Endpoint addresses of the claimed interface's active alternate
    /// setting, in descriptor order.
    fn endpoint_addresses(&self) -> Vec<u8>;
}
