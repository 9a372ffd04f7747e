use std::sync::Arc;
use std::sync::mpsc::{Receiver, Sender, channel};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, trace};
use rusb::{Context, DeviceHandle};

use crate::transport::{
    ControlInComplete, ControlOutComplete, ControlRequest, SubmissionError, TransferError,
    TransferHandle, TransferStatus, UsbTransport,
};

/// Timeout this backend applies to each queued control transfer; the
/// handshake core imposes none of its own.
const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

/// Substrate backend over libusb.
///
/// libusb's portable API is synchronous, so submissions are queued to one
/// dedicated worker thread that executes them in order and invokes the
/// completion callbacks. That worker is the "bus-managed context" all of the
/// session's completion code runs on.
pub struct RusbTransport {
    device: Arc<DeviceHandle<Context>>,
    endpoints: Vec<u8>,
    jobs: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
}

enum Job {
    ControlIn {
        request: ControlRequest,
        response: Box<[u8]>,
        on_complete: ControlInComplete,
        handle: TransferHandle,
    },
    ControlOut {
        request: ControlRequest,
        on_complete: ControlOutComplete,
        handle: TransferHandle,
    },
}

impl RusbTransport {
    /// Wrap an already-open, already-claimed device. Reads the endpoint
    /// layout of `interface`'s active alternate setting up front and spawns
    /// the worker thread.
    pub fn new(device: DeviceHandle<Context>, interface: u8) -> Result<Self, rusb::Error> {
        let endpoints = endpoint_addresses(&device, interface)?;
        let device = Arc::new(device);

        let (jobs, queue) = channel();
        let worker_device = Arc::clone(&device);
        let worker = thread::Builder::new()
            .name("usb-transfers".to_string())
            .spawn(move || run_worker(&worker_device, &queue))
            .map_err(|_| rusb::Error::Other)?;

        Ok(RusbTransport {
            device,
            endpoints,
            jobs: Some(jobs),
            worker: Some(worker),
        })
    }

    fn submit(&self, job: Job) -> Result<(), SubmissionError> {
        let Some(jobs) = self.jobs.as_ref() else {
            return Err(SubmissionError::QueueClosed);
        };
        jobs.send(job).map_err(|_| SubmissionError::QueueClosed)
    }
}

impl Drop for RusbTransport {
    fn drop(&mut self) {
        // Closing the channel stops the worker after the jobs already
        // queued; their handles may still suppress the callbacks.
        self.jobs = None;
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl UsbTransport for RusbTransport {
    fn submit_control_in(
        &self,
        request: ControlRequest,
        response: Box<[u8]>,
        on_complete: ControlInComplete,
    ) -> Result<TransferHandle, SubmissionError> {
        let handle = TransferHandle::new();
        self.submit(Job::ControlIn {
            request,
            response,
            on_complete,
            handle: handle.clone(),
        })?;
        Ok(handle)
    }

    fn submit_control_out(
        &self,
        request: ControlRequest,
        on_complete: ControlOutComplete,
    ) -> Result<TransferHandle, SubmissionError> {
        let handle = TransferHandle::new();
        self.submit(Job::ControlOut {
            request,
            on_complete,
            handle: handle.clone(),
        })?;
        Ok(handle)
    }

    fn send_interrupt_out(
        &self,
        endpoint: u8,
        bytes: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransferError> {
        self.device
            .write_interrupt(endpoint, bytes, timeout)
            .map_err(|e| match e {
                rusb::Error::Timeout => TransferError::TimedOut,
                rusb::Error::Pipe => TransferError::Stall,
                rusb::Error::NoDevice | rusb::Error::NotFound => TransferError::Disconnected,
                e => TransferError::Other(e.to_string()),
            })
    }

    fn endpoint_addresses(&self) -> Vec<u8> {
        self.endpoints.clone()
    }
}

fn run_worker(device: &DeviceHandle<Context>, queue: &Receiver<Job>) {
    debug!("USB transfer worker started");

    while let Ok(job) = queue.recv() {
        match job {
            Job::ControlIn {
                request,
                mut response,
                on_complete,
                handle,
            } => {
                let want = usize::from(request.length).min(response.len());
                let result = device.read_control(
                    request.request_type,
                    request.request,
                    request.value,
                    request.index,
                    &mut response[..want],
                    CONTROL_TIMEOUT,
                );
                let (status, received) = match result {
                    Ok(received) => (TransferStatus::Completed, received),
                    Err(e) => (completion_status(e), 0),
                };
                trace!("control-IN finished: {status:?}, {received} bytes");
                handle.complete(move || on_complete(status, response, received));
            }
            Job::ControlOut {
                request,
                on_complete,
                handle,
            } => {
                let result = device.write_control(
                    request.request_type,
                    request.request,
                    request.value,
                    request.index,
                    &[],
                    CONTROL_TIMEOUT,
                );
                let status = match result {
                    Ok(_) => TransferStatus::Completed,
                    Err(e) => completion_status(e),
                };
                trace!("control-OUT finished: {status:?}");
                handle.complete(move || on_complete(status));
            }
        }
    }

    debug!("USB transfer worker stopped");
}

/// Map libusb's transfer errors onto completion statuses. libusb folds a
/// device dying mid-transfer into `Io`, which for these wheels is the
/// reply-then-reset quirk rather than a host-side failure.
fn completion_status(err: rusb::Error) -> TransferStatus {
    match err {
        rusb::Error::Io => TransferStatus::ProtocolViolation,
        rusb::Error::Pipe => TransferStatus::Stall,
        rusb::Error::NoDevice | rusb::Error::NotFound => TransferStatus::Disconnected,
        rusb::Error::Timeout => TransferStatus::TimedOut,
        _ => TransferStatus::Failed,
    }
}

/// Endpoint addresses of `interface`'s active alternate setting, in
/// descriptor order.
fn endpoint_addresses(
    device: &DeviceHandle<Context>,
    interface: u8,
) -> Result<Vec<u8>, rusb::Error> {
    let config = device.device().active_config_descriptor()?;

    for candidate in config.interfaces() {
        if candidate.number() != interface {
            continue;
        }
        if let Some(setting) = candidate.descriptors().next() {
            return Ok(setting
                .endpoint_descriptors()
                .map(|endpoint| endpoint.address())
                .collect());
        }
    }

    Ok(Vec::new())
}
