//! # Packet structures for bootloader communication
//!
//! This module defines the data structures used to parse responses from the
//! Crazyflie bootloader protocol.

use std::fmt::{Debug, Display};

// Info packet structure:
// [0xff, target, 0x10, pageSize, nBuffPage, nFlashPage, flashStart, cpuId, version]
//
// Command: 0x10
// pageSize (2 bytes): Size of flash and buffer pages
// nBuffPage (2 bytes): Number of RAM buffer pages available
// nFlashPage (2 bytes): Total number of flash pages
// flashStart (2 bytes): Start flash page of firmware
// cpuId (12 bytes): Legacy CPU ID (should be ignored)
// version (1 byte): Protocol version, absent on first-generation bootloaders

/// Flash geometry and identity of one microcontroller target
///
/// Populated from the GET_INFO response of the target's bootloader. The
/// geometry drives the flashing engine: images are staged in `buffer_pages`
/// RAM pages of `page_size` bytes and programmed into the page range
/// `[start_page, flash_pages)`.
#[derive(Clone, PartialEq, Eq)]
pub struct TargetInfo {
    /// Target id code (STM32 = 0xFF, NRF51 = 0xFE)
    pub id: u8,
    /// Address byte carried verbatim in upload and program frames
    pub addr: u8,
    /// Size of flash and buffer pages in bytes
    pub page_size: u16,
    /// Number of RAM buffer pages available for staging
    pub buffer_pages: u16,
    /// Total number of flash pages
    pub flash_pages: u16,
    /// First page writable by the engine, lower pages hold the bootloader
    pub start_page: u16,
    /// Protocol version advertised by this target's bootloader
    pub version: u8,
}

impl TargetInfo {
    /// Parse a GET_INFO response payload for the given target id
    ///
    /// `bytes` starts at the command echo byte. Returns `None` if the payload
    /// is too short to carry the geometry. A payload without the trailing
    /// version byte comes from a first-generation bootloader and is reported
    /// as protocol version 0.
    pub fn from_bytes(id: u8, bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 9 {
            return None;
        }
        let version = if bytes.len() >= 22 { bytes[21] } else { 0 };
        Some(TargetInfo {
            id,
            addr: id,
            page_size: u16::from_le_bytes([bytes[1], bytes[2]]),
            buffer_pages: u16::from_le_bytes([bytes[3], bytes[4]]),
            flash_pages: u16::from_le_bytes([bytes[5], bytes[6]]),
            start_page: u16::from_le_bytes([bytes[7], bytes[8]]),
            version,
        })
    }

    /// Number of image bytes that fit in the writable flash range
    pub fn writable_bytes(&self) -> usize {
        (self.flash_pages - self.start_page) as usize * self.page_size as usize
    }
}

impl Debug for TargetInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("TargetInfo")
            .field("id", &self.id)
            .field("page_size", &self.page_size)
            .field("buffer_pages", &self.buffer_pages)
            .field("flash_pages", &self.flash_pages)
            .field("start_page", &self.start_page)
            .field("version", &self.version)
            .finish()
    }
}

impl Display for TargetInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "pages: {}x{} bytes, buffer: {} pages, firmware start: page {}, version: 0x{:02X}",
            self.flash_pages, self.page_size, self.buffer_pages, self.start_page, self.version
        )
    }
}

/// Response from a flash write operation
///
/// Contains the status of the flash write operation, including whether it
/// completed and any error that occurred.
pub struct FlashWriteResponse {
    /// Non-zero if the operation has completed
    pub done: u8,
    /// Error code (0 = no error)
    pub error: u8,
}

impl FlashWriteResponse {
    /// Parse a WRITE_FLASH response payload starting at the command echo byte
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 3 {
            return None;
        }
        Some(FlashWriteResponse {
            done: bytes[1],
            error: bytes[2],
        })
    }

    /// Get the error status as an enum
    pub fn error(&self) -> DeviceFlashError {
        DeviceFlashError::from(self.error)
    }

    /// Check if the flash operation completed successfully
    pub fn is_success(&self) -> bool {
        self.done != 0 && self.error() == DeviceFlashError::NoError
    }
}

impl Debug for FlashWriteResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("FlashWriteResponse")
            .field("done", &self.done)
            .field("error", &self.error)
            .finish()
    }
}

/// Response from reading flash memory
///
/// Contains the data read from a specific page and address in flash memory.
#[derive(Debug)]
pub struct FlashReadPacket {
    /// The flash page number that was read
    pub page: u16,
    /// The address offset within the page
    pub address: u16,
    /// The data read from flash memory
    pub data: Vec<u8>,
}

impl FlashReadPacket {
    /// Parse a READ_FLASH response payload starting at the command echo byte
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 5 {
            return None;
        }
        Some(FlashReadPacket {
            page: u16::from_le_bytes([bytes[1], bytes[2]]),
            address: u16::from_le_bytes([bytes[3], bytes[4]]),
            data: bytes[5..].to_vec(),
        })
    }
}

/// Device-side error codes for flash operations
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeviceFlashError {
    /// No error occurred
    NoError = 0,
    /// The specified address is outside valid boundaries
    AddressOutOfBounds = 1,
    /// Flash erase operation failed
    FlashEraseFailed = 2,
    /// Flash programming operation failed
    FlashProgrammingFailed = 3,
}

impl From<u8> for DeviceFlashError {
    fn from(value: u8) -> Self {
        match value {
            1 => DeviceFlashError::AddressOutOfBounds,
            2 => DeviceFlashError::FlashEraseFailed,
            3 => DeviceFlashError::FlashProgrammingFailed,
            _ => DeviceFlashError::NoError,
        }
    }
}

impl Display for DeviceFlashError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            DeviceFlashError::NoError => write!(f, "No error"),
            DeviceFlashError::AddressOutOfBounds => {
                write!(f, "Addresses are outside of authorized boundaries")
            }
            DeviceFlashError::FlashEraseFailed => write!(f, "Flash erase failed"),
            DeviceFlashError::FlashProgrammingFailed => write!(f, "Flash programming failed"),
        }
    }
}
