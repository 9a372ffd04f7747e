//! Handshake tests driving [WheelSession] against a scripted transport.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tminit::device_ids::ProbePath;
use tminit::protocol::{IDENTIFY_REQUEST, STABILIZE_PACKETS};
use tminit::session::{Phase, ProbeError, WheelSession};
use tminit::transport::{
    ControlInComplete, ControlOutComplete, ControlRequest, SubmissionError, TransferError,
    TransferHandle, TransferStatus, UsbTransport,
};

/// What the transport observed, in submission order.
#[derive(Debug, Clone, PartialEq)]
enum Event {
    Interrupt { endpoint: u8, bytes: Vec<u8> },
    ControlIn(ControlRequest),
    ControlOut(ControlRequest),
}

/// Scripted reply to the identification transfer.
struct IdentifyReply {
    status: TransferStatus,
    record: Vec<u8>,
}

/// In-process transport: completions run synchronously on the submitting
/// thread, which is as hostile an ordering as the session must survive
/// (the callback finishes before submission even returns).
struct ScriptedTransport {
    endpoints: Vec<u8>,
    /// `None` holds the identify transfer open until [deliver_held].
    identify_reply: Option<IdentifyReply>,
    switch_status: TransferStatus,
    /// Interrupt attempt index at which sends start failing.
    interrupt_fail_from: Option<usize>,
    refuse_submissions: bool,
    events: Mutex<Vec<Event>>,
    held: Mutex<Option<HeldTransfer>>,
}

struct HeldTransfer {
    handle: TransferHandle,
    response: Box<[u8]>,
    on_complete: ControlInComplete,
}

impl ScriptedTransport {
    /// Two endpoints and a clean T300RS compact-record reply.
    fn new() -> Self {
        ScriptedTransport {
            endpoints: vec![0x81, 0x01],
            identify_reply: Some(IdentifyReply {
                status: TransferStatus::Completed,
                record: vec![0x47, 0x00, 0x00, 0x00, 0x06, 0x02, 0x00, 0x00],
            }),
            switch_status: TransferStatus::Completed,
            interrupt_fail_from: None,
            refuse_submissions: false,
            events: Mutex::new(Vec::new()),
            held: Mutex::new(None),
        }
    }

    fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    fn interrupt_events(&self) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|event| matches!(event, Event::Interrupt { .. }))
            .collect()
    }

    fn control_out_requests(&self) -> Vec<ControlRequest> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::ControlOut(request) => Some(request),
                _ => None,
            })
            .collect()
    }

    fn submitted_identify(&self) -> bool {
        self.events()
            .iter()
            .any(|event| matches!(event, Event::ControlIn(_)))
    }

    /// Deliver a held identify transfer as if the wheel had finally
    /// answered. A cancelled handle must swallow the completion.
    fn deliver_held(&self) {
        let Some(held) = self.held.lock().unwrap().take() else {
            panic!("no transfer held open");
        };
        let HeldTransfer {
            handle,
            mut response,
            on_complete,
        } = held;

        let record = [0x47, 0x00, 0x00, 0x00, 0x06, 0x02, 0x00, 0x00];
        response[..record.len()].copy_from_slice(&record);
        let received = record.len();
        handle.complete(move || on_complete(TransferStatus::Completed, response, received));
    }

    fn held_handle(&self) -> TransferHandle {
        self.held
            .lock()
            .unwrap()
            .as_ref()
            .expect("no transfer held open")
            .handle
            .clone()
    }
}

impl UsbTransport for ScriptedTransport {
    fn submit_control_in(
        &self,
        request: ControlRequest,
        mut response: Box<[u8]>,
        on_complete: ControlInComplete,
    ) -> Result<TransferHandle, SubmissionError> {
        if self.refuse_submissions {
            return Err(SubmissionError::QueueClosed);
        }
        self.events.lock().unwrap().push(Event::ControlIn(request));

        let handle = TransferHandle::new();
        match &self.identify_reply {
            Some(reply) => {
                let received = reply.record.len().min(response.len());
                response[..received].copy_from_slice(&reply.record[..received]);
                let status = reply.status;
                handle.complete(move || on_complete(status, response, received));
            }
            None => {
                *self.held.lock().unwrap() = Some(HeldTransfer {
                    handle: handle.clone(),
                    response,
                    on_complete,
                });
            }
        }
        Ok(handle)
    }

    fn submit_control_out(
        &self,
        request: ControlRequest,
        on_complete: ControlOutComplete,
    ) -> Result<TransferHandle, SubmissionError> {
        if self.refuse_submissions {
            return Err(SubmissionError::QueueClosed);
        }
        self.events.lock().unwrap().push(Event::ControlOut(request));

        let handle = TransferHandle::new();
        let status = self.switch_status;
        handle.complete(move || on_complete(status));
        Ok(handle)
    }

    fn send_interrupt_out(
        &self,
        endpoint: u8,
        bytes: &[u8],
        _timeout: Duration,
    ) -> Result<usize, TransferError> {
        let attempt = {
            let mut events = self.events.lock().unwrap();
            let attempt = events
                .iter()
                .filter(|event| matches!(event, Event::Interrupt { .. }))
                .count();
            events.push(Event::Interrupt {
                endpoint,
                bytes: bytes.to_vec(),
            });
            attempt
        };

        match self.interrupt_fail_from {
            Some(first_bad) if attempt >= first_bad => Err(TransferError::Stall),
            _ => Ok(bytes.len()),
        }
    }

    fn endpoint_addresses(&self) -> Vec<u8> {
        self.endpoints.clone()
    }
}

fn probe(transport: &Arc<ScriptedTransport>, path: ProbePath) -> WheelSession {
    let session = WheelSession::probe(
        Arc::clone(transport) as Arc<dyn UsbTransport>,
        path,
    )
    .expect("probe failed");
    assert!(session.wait_until_idle(Duration::from_secs(1)));
    session
}

#[test]
fn full_handshake_switches_a_t300rs() {
    let transport = Arc::new(ScriptedTransport::new());
    let session = probe(&transport, ProbePath::Identify);
    assert_eq!(session.phase(), Phase::Idle);

    let events = transport.events();
    assert_eq!(events.len(), STABILIZE_PACKETS.len() + 2);

    // The settling burst goes out first, in order, over the second endpoint.
    for (i, packet) in STABILIZE_PACKETS.iter().enumerate() {
        assert_eq!(
            events[i],
            Event::Interrupt {
                endpoint: 0x01,
                bytes: packet.to_vec(),
            }
        );
    }

    assert_eq!(
        events[STABILIZE_PACKETS.len()],
        Event::ControlIn(IDENTIFY_REQUEST)
    );
    assert_eq!(
        events[STABILIZE_PACKETS.len() + 1],
        Event::ControlOut(ControlRequest {
            request_type: 0x41,
            request: 83,
            value: 0x0005,
            index: 0,
            length: 0,
        })
    );
}

#[test]
fn extended_record_resolves_a_t500rs() {
    let mut transport = ScriptedTransport::new();
    transport.identify_reply = Some(IdentifyReply {
        status: TransferStatus::Completed,
        record: vec![
            0x49, 0x00, 0x00, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00,
        ],
    });
    let transport = Arc::new(transport);

    probe(&transport, ProbePath::Identify);

    let switches = transport.control_out_requests();
    assert_eq!(switches.len(), 1);
    assert_eq!(switches[0].value, 0x0002);
}

#[test]
fn unlisted_attachment_still_switches_with_the_model_fallback() {
    let mut transport = ScriptedTransport::new();
    // Extended record, model 0x02 with an attachment the catalog does not
    // list; the T300RS base entry's code must still go out.
    transport.identify_reply = Some(IdentifyReply {
        status: TransferStatus::Completed,
        record: vec![
            0x49, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00,
        ],
    });
    let transport = Arc::new(transport);

    probe(&transport, ProbePath::Identify);

    let switches = transport.control_out_requests();
    assert_eq!(switches.len(), 1);
    assert_eq!(switches[0].value, 0x0005);
}

#[test]
fn unknown_record_tag_leaves_the_wheel_alone() {
    let mut transport = ScriptedTransport::new();
    transport.identify_reply = Some(IdentifyReply {
        status: TransferStatus::Completed,
        record: vec![0x42, 0x00, 0x00, 0x00, 0x06, 0x02, 0x00, 0x00],
    });
    let transport = Arc::new(transport);

    let session = probe(&transport, ProbePath::Identify);
    assert_eq!(session.phase(), Phase::Idle);
    assert!(transport.control_out_requests().is_empty());
}

#[test]
fn unknown_model_leaves_the_wheel_alone() {
    let mut transport = ScriptedTransport::new();
    transport.identify_reply = Some(IdentifyReply {
        status: TransferStatus::Completed,
        record: vec![0x47, 0x00, 0x00, 0x00, 0x06, 0x7f, 0x00, 0x00],
    });
    let transport = Arc::new(transport);

    probe(&transport, ProbePath::Identify);
    assert!(transport.control_out_requests().is_empty());
}

#[test]
fn protocol_violation_on_identify_still_counts_as_a_reply() {
    let mut transport = ScriptedTransport::new();
    transport.identify_reply = Some(IdentifyReply {
        status: TransferStatus::ProtocolViolation,
        record: vec![0x47, 0x00, 0x00, 0x00, 0x06, 0x02, 0x00, 0x00],
    });
    let transport = Arc::new(transport);

    probe(&transport, ProbePath::Identify);

    let switches = transport.control_out_requests();
    assert_eq!(switches.len(), 1);
    assert_eq!(switches[0].value, 0x0005);
}

#[test]
fn timed_out_identify_aborts_the_handshake() {
    let mut transport = ScriptedTransport::new();
    transport.identify_reply = Some(IdentifyReply {
        status: TransferStatus::TimedOut,
        record: Vec::new(),
    });
    let transport = Arc::new(transport);

    let session = probe(&transport, ProbePath::Identify);
    assert_eq!(session.phase(), Phase::Idle);
    assert!(transport.control_out_requests().is_empty());
}

#[test]
fn t128_switches_blind() {
    let transport = Arc::new(ScriptedTransport::new());
    let session = probe(
        &transport,
        ProbePath::BlindSwitch {
            switch_code: 0x000b,
        },
    );
    assert_eq!(session.phase(), Phase::Idle);

    // No settling burst and no identity query, just the hard-coded switch.
    assert!(transport.interrupt_events().is_empty());
    assert!(!transport.submitted_identify());

    let switches = transport.control_out_requests();
    assert_eq!(switches.len(), 1);
    assert_eq!(switches[0].value, 0x000b);
    assert_eq!(switches[0].length, 0);
}

#[test]
fn missing_second_endpoint_skips_stabilization() {
    let mut transport = ScriptedTransport::new();
    transport.endpoints = vec![0x81];
    let transport = Arc::new(transport);

    probe(&transport, ProbePath::Identify);

    assert!(transport.interrupt_events().is_empty());
    assert!(transport.submitted_identify());
    assert_eq!(transport.control_out_requests().len(), 1);
}

#[test]
fn interrupt_failure_abandons_the_rest_of_the_sequence() {
    let mut transport = ScriptedTransport::new();
    transport.interrupt_fail_from = Some(2);
    let transport = Arc::new(transport);

    probe(&transport, ProbePath::Identify);

    // Two good sends plus the failed attempt, then straight to identify.
    assert_eq!(transport.interrupt_events().len(), 3);
    assert!(transport.submitted_identify());
    assert_eq!(transport.control_out_requests().len(), 1);
}

#[test]
fn probe_fails_when_the_identify_transfer_cannot_be_queued() {
    let mut transport = ScriptedTransport::new();
    transport.refuse_submissions = true;
    let transport = Arc::new(transport);

    let result = WheelSession::probe(
        Arc::clone(&transport) as Arc<dyn UsbTransport>,
        ProbePath::Identify,
    );
    assert!(matches!(result, Err(ProbeError::Identify(_))));
}

#[test]
fn teardown_cancels_the_outstanding_transfer() {
    let mut transport = ScriptedTransport::new();
    transport.identify_reply = None;
    let transport = Arc::new(transport);

    let session = WheelSession::probe(
        Arc::clone(&transport) as Arc<dyn UsbTransport>,
        ProbePath::Identify,
    )
    .expect("probe failed");
    assert_eq!(session.phase(), Phase::Identifying);

    session.disconnect();
    assert_eq!(session.phase(), Phase::Closed);
    assert!(transport.held_handle().is_cancelled());

    // A late completion from the bus must be swallowed by the cancelled
    // handle: no callback runs, so no switch ever goes out.
    transport.deliver_held();
    assert!(transport.control_out_requests().is_empty());
    assert_eq!(session.phase(), Phase::Closed);
}

#[test]
fn dropping_the_session_tears_it_down() {
    let mut transport = ScriptedTransport::new();
    transport.identify_reply = None;
    let transport = Arc::new(transport);

    {
        let _session = WheelSession::probe(
            Arc::clone(&transport) as Arc<dyn UsbTransport>,
            ProbePath::Identify,
        )
        .expect("probe failed");
    }

    // The session is gone; the late completion has nothing to poke.
    transport.deliver_held();
    assert!(transport.control_out_requests().is_empty());
}
