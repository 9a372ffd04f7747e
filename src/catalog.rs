use thiserror::Error;

use crate::protocol::WheelIdentity;

/// One known wheel personality: the (model, attachment) pair a wheel reports
/// and the code that switches it to full-featured mode.
#[derive(Debug, PartialEq)]
pub struct WheelInfo {
    pub model: u8,
    pub attachment: u8,
    /// Sent as the value field of the mode-switch request.
    pub switch_code: u16,
    pub name: &'static str,
}

/// Known wheels, ordered so that entries sharing a model are adjacent; the
/// resolver's forward scan stops at the first entry of a different model.
///
/// The TMX (model 0x04, attachment 0x07) is deliberately absent: it needs two
/// switch packets in a row and sending only the first would leave it wedged.
pub static WHEELS: &[WheelInfo] = &[
    WheelInfo {
        model: 0x00,
        attachment: 0x02,
        switch_code: 0x0002,
        name: "Thrustmaster T500RS",
    },
    WheelInfo {
        model: 0x00,
        attachment: 0x09,
        switch_code: 0x000b,
        name: "Thrustmaster T128",
    },
    WheelInfo {
        model: 0x02,
        attachment: 0x00,
        switch_code: 0x0005,
        name: "Thrustmaster T300RS (Missing Attachment)",
    },
    WheelInfo {
        model: 0x02,
        attachment: 0x03,
        switch_code: 0x0005,
        name: "Thrustmaster T300RS (F1 attachment)",
    },
    WheelInfo {
        model: 0x02,
        attachment: 0x04,
        switch_code: 0x0005,
        name: "Thrustmaster T300 Ferrari Alcantara Edition",
    },
    WheelInfo {
        model: 0x02,
        attachment: 0x06,
        switch_code: 0x0005,
        name: "Thrustmaster T300RS",
    },
    WheelInfo {
        model: 0x02,
        attachment: 0x09,
        switch_code: 0x0005,
        name: "Thrustmaster T300RS (Open Wheel Attachment)",
    },
    WheelInfo {
        model: 0x03,
        attachment: 0x06,
        switch_code: 0x0006,
        name: "Thrustmaster T150RS",
    },
];

/// Outcome of resolving a reported identity against [WHEELS].
#[derive(Copy, Clone, Debug)]
pub struct ResolvedWheel {
    pub entry: &'static WheelInfo,
    /// False when the reported attachment is unlisted for its model and the
    /// model's first entry was kept as a best-effort fallback.
    pub attachment_found: bool,
}

#[derive(Error, Debug, PartialEq)]
#[error("unknown wheel model id {0:#04x}")]
pub struct UnknownModel(pub u8);

/// Pick the catalog entry for a reported (model, attachment) pair.
///
/// The first entry matching the model is the initial candidate. If its
/// attachment differs from the reported one, the scan continues through the
/// model's remaining entries looking for an exact attachment match; several
/// attachments share one base model, and the base entry is a reasonable
/// default when the specific attachment is unlisted.
pub fn resolve(identity: WheelIdentity) -> Result<ResolvedWheel, UnknownModel> {
    let first = WHEELS
        .iter()
        .position(|wheel| wheel.model == identity.model)
        .ok_or(UnknownModel(identity.model))?;

    let candidate = &WHEELS[first];
    if candidate.attachment == identity.attachment {
        return Ok(ResolvedWheel {
            entry: candidate,
            attachment_found: true,
        });
    }

    for wheel in WHEELS[first + 1..]
        .iter()
        .take_while(|wheel| wheel.model == identity.model)
    {
        if wheel.attachment == identity.attachment {
            return Ok(ResolvedWheel {
                entry: wheel,
                attachment_found: true,
            });
        }
    }

    Ok(ResolvedWheel {
        entry: candidate,
        attachment_found: false,
    })
}
