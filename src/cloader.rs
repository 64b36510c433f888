//! # Bootloader wire-protocol engine
//!
//! Crazyflie 2.x platform has 2 bootloaders, one in the nRF51822 and one in
//! the STM32F405; the nRF51 relays commands to the STM32 and sends back the
//! responses. This module speaks the bootloader wire protocol to either of
//! them over a [`Link`] and caches the flash geometry of every target it has
//! interrogated.
//!
//! For most use cases, prefer the high-level [`Bootloader`](crate::Bootloader)
//! session on top of this engine.

use std::collections::HashMap;
use std::time::Duration;

use crate::bllink::{Link, LinkFactory};
use crate::error::{Error, Result};
use crate::packets::{FlashReadPacket, FlashWriteResponse, TargetInfo};

// Bootloader command constants
const CMD_GET_INFO: u8 = 0x10;
const CMD_LOAD_BUFFER: u8 = 0x14;
const CMD_WRITE_FLASH: u8 = 0x18;
const CMD_READ_FLASH: u8 = 0x1C;
const CMD_RESET_INIT: u8 = 0xFF;
const CMD_RESET: u8 = 0xF0;

/// STM32 bootloader target identifier
pub const TARGET_STM32: u8 = 0xFF;
/// nRF51 bootloader target identifier
pub const TARGET_NRF51: u8 = 0xFE;

/// Protocol version of the first-generation Crazyflie 1.0 bootloader
pub const CF1_PROTO_VER_0: u8 = 0x00;
/// Protocol version of the updated Crazyflie 1.0 bootloader
pub const CF1_PROTO_VER_1: u8 = 0x01;
/// Protocol version of the Crazyflie 2.x dual-MCU bootloader
pub const CF2_PROTO_VER: u8 = 0x10;

/// True only for the current dual-MCU protocol
pub fn is_cf2(version: u8) -> bool {
    version == CF2_PROTO_VER
}

/// Translate a symbolic target name to its id code
pub fn target_id_from_name(name: &str) -> Option<u8> {
    match name {
        "stm32" => Some(TARGET_STM32),
        "nrf51" => Some(TARGET_NRF51),
        _ => None,
    }
}

/// Translate a target id code to its symbolic name
pub fn target_name(id: u8) -> &'static str {
    match id {
        TARGET_STM32 => "stm32",
        TARGET_NRF51 => "nrf51",
        _ => "unknown",
    }
}

// Default short timeout for bootloader operations that should return directly
const SHORT_TIMEOUT: Duration = Duration::from_millis(10);
// Timeout for flash operation, flash operation can take up to one second to complete
const FLASH_TIMEOUT: Duration = Duration::from_secs(2);
// Maximum number of times a request is resent before giving up
const MAX_RETRIES: usize = 10;
// A LOAD_BUFFER frame carries at most this many image bytes
const LOAD_CHUNK: usize = 25;

/// Bootloader protocol engine
///
/// Owns the link to the device and the registry of per-target flash
/// geometries. Commands address one MCU by its id; upload and program frames
/// carry the target's address byte verbatim.
pub struct Cloader<F: LinkFactory> {
    factory: F,
    link: Option<F::Link>,
    uri: Option<String>,
    targets: HashMap<u8, TargetInfo>,
    protocol_version: u8,
    error_code: u8,
}

impl<F: LinkFactory> Cloader<F> {
    /// Create an engine with no link bound
    pub fn new(factory: F) -> Self {
        Cloader {
            factory,
            link: None,
            uri: None,
            targets: HashMap::new(),
            protocol_version: 0,
            error_code: 0,
        }
    }

    /// Passive discovery over the link adapter's scan facility
    pub async fn scan_for_bootloader(&mut self) -> Result<Option<String>> {
        self.factory.scan().await
    }

    /// Bind the link adapter to the given URI
    ///
    /// Any previously open link is released first.
    pub async fn open(&mut self, uri: &str) -> Result<()> {
        self.close().await;
        let link = self.factory.open(uri).await?;
        self.link = Some(link);
        self.uri = Some(uri.to_string());
        Ok(())
    }

    /// Release the link, keeping the cached geometries
    pub async fn close(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.close().await;
        }
    }

    /// Whether a link is currently bound
    pub fn is_open(&self) -> bool {
        self.link.is_some()
    }

    /// URI of the currently or last bound link
    pub fn uri(&self) -> Option<&str> {
        self.uri.as_deref()
    }

    /// Protocol version probed by [`check_link_and_get_info`](Self::check_link_and_get_info)
    pub fn protocol_version(&self) -> u8 {
        self.protocol_version
    }

    /// Device error code left by the last failed flash command
    pub fn error_code(&self) -> u8 {
        self.error_code
    }

    /// Cached geometry for a target id
    pub fn target(&self, target_id: u8) -> Option<&TargetInfo> {
        self.targets.get(&target_id)
    }

    /// Cached geometry for a symbolic target name
    pub fn target_by_name(&self, name: &str) -> Option<&TargetInfo> {
        target_id_from_name(name).and_then(|id| self.targets.get(&id))
    }

    fn link(&mut self) -> Result<&mut F::Link> {
        self.link
            .as_mut()
            .ok_or_else(|| Error::InvalidOperation("no link open".to_string()))
    }

    // Send a command and poll for the response whose first match_len bytes
    // echo the command. Stale packets are discarded; a quiet link triggers a
    // resend, up to MAX_RETRIES times.
    async fn request(&mut self, frame: &[u8], match_len: usize, timeout: Duration) -> Result<Vec<u8>> {
        for attempt in 0..MAX_RETRIES {
            self.link()?.send(frame).await?;
            loop {
                match self.link()?.receive(timeout).await? {
                    Some(answer) if answer.len() >= match_len && answer[..match_len] == frame[..match_len] => {
                        return Ok(answer);
                    }
                    Some(stale) => {
                        tracing::trace!(?stale, "discarding stale packet");
                    }
                    None => break,
                }
            }
            tracing::debug!(attempt, "no response within {:?}, resending", timeout);
        }
        Err(Error::Link(format!(
            "no response after {} attempts",
            MAX_RETRIES
        )))
    }

    /// Probe the link and read the protocol version
    ///
    /// Interrogates the STM32 target, whose GET_INFO response carries the
    /// protocol version for the whole device. For the CF1 protocols the
    /// geometry is read inline by the same exchange; for CF2 the caller also
    /// requests the NRF51 link target.
    pub async fn check_link_and_get_info(&mut self) -> Result<bool> {
        match self.request_info_update(TARGET_STM32).await {
            Ok(info) => {
                self.protocol_version = info.version;
                Ok(true)
            }
            Err(Error::Link(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Issue the info-update request for one target and cache the response
    pub async fn request_info_update(&mut self, target_id: u8) -> Result<TargetInfo> {
        let frame = vec![0xFF, target_id, CMD_GET_INFO];
        let response = self.request(&frame, 3, SHORT_TIMEOUT).await?;
        let info = TargetInfo::from_bytes(target_id, &response[2..])
            .ok_or_else(|| Error::Link("malformed GET_INFO response".to_string()))?;
        tracing::debug!(target = target_name(target_id), ?info, "info updated");
        self.targets.insert(target_id, info.clone());
        Ok(info)
    }

    /// Reboot a device running application firmware into its bootloader
    ///
    /// Only meaningful for warm boot. Returns false when the device did not
    /// answer the reset handshake.
    pub async fn reset_to_bootloader(&mut self, target_id: u8) -> Result<bool> {
        let init = vec![0xFF, target_id, CMD_RESET_INIT];
        match self.request(&init, 3, Duration::from_millis(100)).await {
            Ok(_) => {}
            Err(Error::Link(_)) => return Ok(false),
            Err(e) => return Err(e),
        }
        self.link()?.send(&[0xFF, target_id, CMD_RESET, 0x00]).await?;
        Ok(true)
    }

    /// Boot the device back into application firmware
    pub async fn reset_to_firmware(&mut self, target_id: u8) -> Result<()> {
        self.link()?.send(&[0xFF, target_id, CMD_RESET_INIT]).await?;
        self.link()?.send(&[0xFF, target_id, CMD_RESET, 0x01]).await?;
        Ok(())
    }

    /// Copy up to one page of image bytes into the device staging buffer
    ///
    /// The bytes land in buffer page `buffer_page` starting at `offset`. The
    /// transfer is chunked into LOAD_BUFFER frames of at most 25 data bytes
    /// to fit the radio MTU; each frame is acknowledged by the transport.
    pub async fn upload_buffer(
        &mut self,
        addr: u8,
        buffer_page: u16,
        offset: u16,
        data: &[u8],
    ) -> Result<()> {
        let mut sent = 0;
        while sent < data.len() {
            let chunk = &data[sent..(sent + LOAD_CHUNK).min(data.len())];
            let mut frame = vec![0xFF, addr, CMD_LOAD_BUFFER];
            frame.extend_from_slice(&buffer_page.to_le_bytes());
            frame.extend_from_slice(&(offset + sent as u16).to_le_bytes());
            frame.extend_from_slice(chunk);
            self.link()?.send(&frame).await?;
            sent += chunk.len();
        }
        Ok(())
    }

    /// Program `num_pages` pages from the staging buffer into flash
    ///
    /// Pages are copied from buffer page `buffer_start_page` onward into
    /// flash starting at `flash_dest_page`. Returns false and records the
    /// device [`error_code`](Self::error_code) when the device reports a
    /// failure.
    pub async fn write_flash(
        &mut self,
        addr: u8,
        buffer_start_page: u16,
        flash_dest_page: u16,
        num_pages: u16,
    ) -> Result<bool> {
        let mut frame = vec![0xFF, addr, CMD_WRITE_FLASH];
        frame.extend_from_slice(&buffer_start_page.to_le_bytes());
        frame.extend_from_slice(&flash_dest_page.to_le_bytes());
        frame.extend_from_slice(&num_pages.to_le_bytes());

        // TODO: When the ack of a WRITE_FLASH is lost, resend a flash status
        //       request instead of the write itself, a reprogram costs time
        //       and flash endurance.
        let response = self.request(&frame, 3, FLASH_TIMEOUT).await?;
        let status = FlashWriteResponse::from_bytes(&response[2..])
            .ok_or_else(|| Error::Link("malformed WRITE_FLASH response".to_string()))?;
        if status.is_success() {
            self.error_code = 0;
            Ok(true)
        } else {
            self.error_code = status.error;
            Ok(false)
        }
    }

    /// Read a chunk of flash starting at `offset` inside `page`
    ///
    /// The device returns up to 27 bytes per read. The response echoes page
    /// and offset; a mismatch means a stale packet and is reported as a link
    /// error.
    pub async fn read_flash(&mut self, addr: u8, page: u16, offset: u16) -> Result<FlashReadPacket> {
        let mut frame = vec![0xFF, addr, CMD_READ_FLASH];
        frame.extend_from_slice(&page.to_le_bytes());
        frame.extend_from_slice(&offset.to_le_bytes());

        let response = self.request(&frame, 3, SHORT_TIMEOUT).await?;
        let packet = FlashReadPacket::from_bytes(&response[2..])
            .ok_or_else(|| Error::Link("malformed READ_FLASH response".to_string()))?;
        if packet.page != page || packet.address != offset {
            return Err(Error::Link(format!(
                "stale READ_FLASH response: requested page={} offset={}, got page={} offset={}",
                page, offset, packet.page, packet.address
            )));
        }
        Ok(packet)
    }
}
