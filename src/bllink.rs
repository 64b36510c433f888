use crazyradio::{Crazyradio, SharedCrazyradio};
use std::collections::VecDeque;
use std::time::Duration;

use crate::error::{Error, Result};

/// # Crazyflie bootloader link
///
/// The bootloader link is very similar to the Crazyflie link over ESB except
/// that it is based on a very early iteration and does not implement safelink.
///
/// As such the link requires some special handling in order to work properly,
/// hence this implementation is kept separate from crazyflie-link. The link is
/// half-duplex, only sending or receiving at any one time, and responses ride
/// on the acknowledgement payload of a later uplink packet.
///
/// The protocol engine consumes the link through the [`Link`] and
/// [`LinkFactory`] traits so that it can be exercised against a scripted
/// device in tests and against other transports.
pub trait Link {
    /// Send one command packet, waiting for the transport acknowledgement
    fn send(&mut self, packet: &[u8]) -> impl Future<Output = Result<()>>;

    /// Receive one packet, waiting at most `timeout`
    ///
    /// Returns `Ok(None)` when no packet arrived within the timeout. Packet
    /// boundaries are preserved: one call yields at most one packet.
    fn receive(&mut self, timeout: Duration) -> impl Future<Output = Result<Option<Vec<u8>>>>;

    /// Release the transport
    fn close(&mut self) -> impl Future<Output = ()>;
}

/// Factory opening [`Link`]s from a URI, plus the bootloader scan facility
///
/// The upgrade session opens and closes links several times during a warm
/// upgrade, so link construction is a capability of its own rather than a
/// one-shot constructor.
pub trait LinkFactory {
    /// Concrete link type produced by this factory
    type Link: Link;

    /// Passive discovery of a device already in bootloader mode
    ///
    /// Returns the URI of the first responding bootloader, or `None` if
    /// nothing answered.
    fn scan(&mut self) -> impl Future<Output = Result<Option<String>>>;

    /// Open a link to the given URI
    fn open(&mut self, uri: &str) -> impl Future<Output = Result<Self::Link>>;
}

const DEFAULT_ADDRESS: [u8; 5] = [0xE7, 0xE7, 0xE7, 0xE7, 0xE7];
const BOOTLOADER_CHANNEL: u8 = 0; // Bootloader channel
const MAX_RETRIES: usize = 10; // Maximum number of retries for packet transmission
const SEND_TIMEOUT: Duration = Duration::from_millis(1000);

/// URI of the radio bootloader with its fixed channel and address
pub const BOOTLOADER_URI: &str = "radio://0/0/2M/E7E7E7E7E7";

/// Crazyradio implementation of the bootloader [`Link`]
pub struct RadioLink {
    radio: SharedCrazyradio,
    address: [u8; 5],
    channel: crazyradio::Channel,
    // Response payloads that arrived on the ack of an earlier send
    rx: VecDeque<Vec<u8>>,
}

impl RadioLink {
    fn new(radio: SharedCrazyradio, channel: u8, address: [u8; 5]) -> Result<Self> {
        let channel = crazyradio::Channel::from_number(channel)
            .map_err(|e| Error::Link(format!("invalid channel: {}", e)))?;
        Ok(RadioLink {
            radio,
            address,
            channel,
            rx: VecDeque::new(),
        })
    }

    async fn send_raw(&mut self, data: &[u8]) -> Result<(bool, Vec<u8>)> {
        let (ack, payload) = self
            .radio
            .send_packet_async(self.channel, self.address, data.to_vec())
            .await
            .map_err(|e| Error::Link(format!("radio error during send: {}", e)))?;
        Ok((ack.received, payload))
    }
}

impl Link for RadioLink {
    async fn send(&mut self, packet: &[u8]) -> Result<()> {
        for attempt in 0..MAX_RETRIES {
            let start_time = std::time::Instant::now();
            while start_time.elapsed() < SEND_TIMEOUT {
                let (acked, payload) = self.send_raw(packet).await?;
                if acked {
                    if !payload.is_empty() {
                        self.rx.push_back(payload);
                    }
                    return Ok(());
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            tracing::debug!(attempt, "no ACK within {:?}, retrying", SEND_TIMEOUT);
        }
        Err(Error::Link(format!(
            "failed to send packet after {} attempts",
            MAX_RETRIES
        )))
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        if let Some(packet) = self.rx.pop_front() {
            return Ok(Some(packet));
        }

        // Poll with a null packet, the response rides on the ack payload
        let start_time = std::time::Instant::now();
        while start_time.elapsed() < timeout {
            let (acked, payload) = self.send_raw(&[0xFF]).await?;
            if acked && !payload.is_empty() {
                return Ok(Some(payload));
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        Ok(None)
    }

    async fn close(&mut self) {
        self.rx.clear();
    }
}

/// [`LinkFactory`] opening Crazyradio links
///
/// Each open claims the first Crazyradio dongle found on USB. The scan sends
/// a null packet on the fixed bootloader channel and reports the bootloader
/// URI when the packet is acknowledged.
#[derive(Default)]
pub struct RadioLinkFactory;

impl LinkFactory for RadioLinkFactory {
    type Link = RadioLink;

    async fn scan(&mut self) -> Result<Option<String>> {
        let mut link = self.open(BOOTLOADER_URI).await?;
        let (acked, _) = link.send_raw(&[0xFF]).await?;
        if acked {
            Ok(Some(BOOTLOADER_URI.to_string()))
        } else {
            Ok(None)
        }
    }

    async fn open(&mut self, uri: &str) -> Result<RadioLink> {
        let (channel, address) = parse_radio_uri(uri)?;
        let radio = Crazyradio::open_first_async()
            .await
            .map_err(|e| Error::Link(format!("cannot open Crazyradio: {}", e)))?;
        let radio = SharedCrazyradio::new(radio);
        RadioLink::new(radio, channel, address)
    }
}

// Accepts radio://<devid>/<channel>[/<rate>[/<address>]]
fn parse_radio_uri(uri: &str) -> Result<(u8, [u8; 5])> {
    let rest = uri
        .strip_prefix("radio://")
        .ok_or_else(|| Error::Link(format!("not a radio URI: {}", uri)))?;
    let mut parts = rest.split('/');

    let _devid = parts.next();
    let channel = match parts.next() {
        Some(c) => c
            .parse::<u8>()
            .map_err(|_| Error::Link(format!("invalid channel in URI: {}", uri)))?,
        None => BOOTLOADER_CHANNEL,
    };
    let _rate = parts.next();
    let address = match parts.next() {
        Some(a) => {
            if a.len() != 10 || !a.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(Error::Link(format!("invalid address in URI: {}", uri)));
            }
            let mut address = [0u8; 5];
            for (i, byte) in address.iter_mut().enumerate() {
                *byte = u8::from_str_radix(&a[i * 2..i * 2 + 2], 16)
                    .map_err(|_| Error::Link(format!("invalid address in URI: {}", uri)))?;
            }
            address
        }
        None => DEFAULT_ADDRESS,
    };

    Ok((channel, address))
}
