/// Check which devices speak the pre-switch protocol and how, based on USB IDs.
pub mod device_ids;

/// Known wheel personalities and the resolver that picks one from a reported identity.
pub mod catalog;

/// Wire formats: vendor request templates, identity records, stabilization packets.
pub mod protocol;

/// The transfer substrate the handshake runs on, and the cancellable transfer handle.
pub mod transport;

/// Per-wheel handshake state machine: stabilize, identify, resolve, switch.
pub mod session;

/// libusb-backed implementation of the transfer substrate.
pub mod rusb_transport;
