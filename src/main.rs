use anyhow::{Context as _, Result, bail};
use clap::{Args, Parser};
use rusb::UsbContext;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tminit::device_ids::{DeviceCompat, UsbId, identify_device};
use tminit::rusb_transport::RusbTransport;
use tminit::session::WheelSession;

/// How long `init` waits for the handshake chain to finish before giving up
/// on the wheel.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "tminit", version, about)]
enum Opt {
    /// List connected Thrustmaster devices (vendor ID 0x044f)
    List,

    /// Identify a wheel and switch it to full-featured mode
    Init {
        #[command(flatten)]
        spec: DeviceSpec,
    },
}

#[derive(Error, Debug)]
enum MatchError {
    #[error("no devices match specification")]
    NoDevices,

    #[error("multiple devices match specification")]
    MultipleDevices,
}

#[derive(Args, Debug)]
struct DeviceSpec {
    /// Product ID, in hex (vendor ID is always matched against
    /// Thrustmaster's, 0x044f)
    #[arg(short, value_parser = parse_hex_id)]
    pid: Option<u16>,

    /// Bus number, to tell apart identical wheels
    #[arg(long)]
    bus: Option<u8>,

    /// Address on the bus
    #[arg(long)]
    address: Option<u8>,
}

fn parse_hex_id(arg: &str) -> Result<u16, String> {
    let digits = arg.trim_start_matches("0x");
    u16::from_str_radix(digits, 16).map_err(|e| e.to_string())
}

impl DeviceSpec {
    fn matches(&self, device: &rusb::Device<rusb::Context>, id: UsbId) -> bool {
        if !matches!(identify_device(id), DeviceCompat::Recognized(_)) {
            return false;
        }

        if let Some(pid) = self.pid {
            if id.pid != pid {
                return false;
            }
        }

        if let Some(bus) = self.bus {
            if device.bus_number() != bus {
                return false;
            }
        }

        if let Some(address) = self.address {
            if device.address() != address {
                return false;
            }
        }

        true
    }

    fn get_device(&self, context: &rusb::Context) -> Result<(rusb::Device<rusb::Context>, UsbId)> {
        let devices = context.devices()?;
        let mut candidates = devices
            .iter()
            .filter_map(|device| Some((usb_id(&device)?, device)))
            .filter(|(id, device)| self.matches(device, *id));

        match candidates.next() {
            None => Err(MatchError::NoDevices.into()),
            Some((id, device)) => {
                if candidates.next().is_some() {
                    Err(MatchError::MultipleDevices.into())
                } else {
                    Ok((device, id))
                }
            }
        }
    }
}

fn usb_id(device: &rusb::Device<rusb::Context>) -> Option<UsbId> {
    let descriptor = device.device_descriptor().ok()?;
    Some(UsbId {
        vid: descriptor.vendor_id(),
        pid: descriptor.product_id(),
    })
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(
        env_logger::Env::new()
            .filter_or("TMINIT_LOG", "info")
            .write_style("TMINIT_LOG_STYLE"),
    )
    .init();

    let opt = Opt::parse();

    let context = rusb::Context::new().context("initializing libusb")?;

    match opt {
        Opt::List => list(&context)?,
        Opt::Init { spec } => {
            let (device, id) = spec.get_device(&context)?;
            let DeviceCompat::Recognized(path) = identify_device(id) else {
                unreachable!("get_device only matches recognized wheels");
            };

            let handle = device.open().context("opening the wheel")?;
            // The generic wheel binds a kernel HID driver; reclaim the
            // interface for the handshake.
            let _ = handle.set_auto_detach_kernel_driver(true);
            handle.claim_interface(0).context("claiming interface 0")?;

            let transport =
                Arc::new(RusbTransport::new(handle, 0).context("reading the endpoint layout")?);
            let session = WheelSession::probe(transport, path)?;

            if !session.wait_until_idle(HANDSHAKE_TIMEOUT) {
                bail!("timed out waiting for the wheel to finish the handshake");
            }
            println!("Handshake finished; the wheel should re-enumerate with its real identity.");
        }
    };

    Ok(())
}

fn list(context: &rusb::Context) -> Result<()> {
    for device in context.devices()?.iter() {
        let Some(id) = usb_id(&device) else {
            continue;
        };

        let compat = identify_device(id);
        if matches!(compat, DeviceCompat::Incompatible) {
            continue;
        }

        println!(
            "bus {:03} device {:03} {} [{}]",
            device.bus_number(),
            device.address(),
            id,
            compat,
        );
    }

    Ok(())
}
