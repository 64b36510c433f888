//! Scripted fake device and collaborator doubles for the test suite.
//!
//! `FakeDevice` implements the device side of the bootloader wire protocol
//! and records every upload and page-program command, so tests can assert on
//! the exact frame traffic. `MockFactory`/`MockLink` expose it through the
//! link seam, `FakeAppClient` stands in for the application-mode client.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::rc::Rc;
use std::time::Duration;

use crate::bllink::{Link, LinkFactory};
use crate::deck::{AppClient, DeckRecord};
use crate::error::Result;
use crate::packets::TargetInfo;

const CMD_GET_INFO: u8 = 0x10;
const CMD_LOAD_BUFFER: u8 = 0x14;
const CMD_WRITE_FLASH: u8 = 0x18;
const CMD_READ_FLASH: u8 = 0x1C;
const CMD_RESET_INIT: u8 = 0xFF;
const CMD_RESET: u8 = 0xF0;

/// One recorded LOAD_BUFFER frame
#[derive(Debug, Clone)]
pub struct UploadRecord {
    pub addr: u8,
    pub buffer_page: u16,
    pub offset: u16,
    pub data: Vec<u8>,
}

/// One recorded WRITE_FLASH frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub addr: u8,
    pub buffer_page: u16,
    pub flash_page: u16,
    pub num_pages: u16,
}

struct DeviceInner {
    targets: HashMap<u8, TargetInfo>,
    silent: bool,
    fail_write_with: Option<u8>,
    skew_read_echo: bool,
    uploads: Vec<UploadRecord>,
    writes: Vec<WriteRecord>,
    bootloader_resets: usize,
    firmware_resets: usize,
}

/// Device side of the bootloader protocol, shared between links
#[derive(Clone)]
pub struct FakeDevice(Rc<RefCell<DeviceInner>>);

impl FakeDevice {
    /// A CF2 with the reference geometry used throughout the test suite:
    /// 1024-byte pages, 10 buffer pages, 128 flash pages, firmware at 16
    pub fn cf2() -> Self {
        let mut targets = HashMap::new();
        targets.insert(0xFF, target_info(0xFF, 1024, 10, 128, 16, 0x10));
        targets.insert(0xFE, target_info(0xFE, 1024, 1, 232, 88, 0x10));
        FakeDevice(Rc::new(RefCell::new(DeviceInner {
            targets,
            silent: false,
            fail_write_with: None,
            skew_read_echo: false,
            uploads: Vec::new(),
            writes: Vec::new(),
            bootloader_resets: 0,
            firmware_resets: 0,
        })))
    }

    /// A single-MCU CF1 advertising the given protocol version
    pub fn cf1(version: u8) -> Self {
        let device = FakeDevice::cf2();
        {
            let mut inner = device.0.borrow_mut();
            inner.targets.remove(&0xFE);
            inner.targets.insert(0xFF, target_info(0xFF, 1024, 10, 128, 16, version));
        }
        device
    }

    /// Override the protocol version advertised by the STM32 target
    pub fn with_protocol_version(self, version: u8) -> Self {
        {
            let mut inner = self.0.borrow_mut();
            let info = inner.targets.get_mut(&0xFF).unwrap();
            info.version = version;
        }
        self
    }

    /// Stop answering any request, as if the device were gone
    pub fn set_silent(&self, silent: bool) {
        self.0.borrow_mut().silent = silent;
    }

    pub fn is_silent(&self) -> bool {
        self.0.borrow().silent
    }

    /// Answer every WRITE_FLASH with the given device error code
    pub fn fail_writes_with(&self, code: u8) {
        self.0.borrow_mut().fail_write_with = Some(code);
    }

    /// Echo the wrong page in READ_FLASH responses, as a stale packet would
    pub fn skew_read_echo(&self) {
        self.0.borrow_mut().skew_read_echo = true;
    }

    pub fn uploads(&self) -> Vec<UploadRecord> {
        self.0.borrow().uploads.clone()
    }

    /// Buffer pages touched by uploads, one entry per page (chunks collapsed)
    pub fn uploaded_pages(&self) -> Vec<u16> {
        let mut pages: Vec<u16> = Vec::new();
        for upload in self.0.borrow().uploads.iter() {
            if pages.last() != Some(&upload.buffer_page) {
                pages.push(upload.buffer_page);
            }
        }
        pages
    }

    pub fn writes(&self) -> Vec<WriteRecord> {
        self.0.borrow().writes.clone()
    }

    pub fn bootloader_resets(&self) -> usize {
        self.0.borrow().bootloader_resets
    }

    pub fn firmware_resets(&self) -> usize {
        self.0.borrow().firmware_resets
    }

    /// Handle one command frame, returning the device response if any
    pub fn handle(&self, frame: &[u8]) -> Option<Vec<u8>> {
        let mut inner = self.0.borrow_mut();
        if inner.silent || frame.len() < 3 || frame[0] != 0xFF {
            return None;
        }
        let target = frame[1];
        match frame[2] {
            CMD_GET_INFO => {
                let info = inner.targets.get(&target)?;
                let mut response = vec![0xFF, target, CMD_GET_INFO];
                response.extend_from_slice(&info.page_size.to_le_bytes());
                response.extend_from_slice(&info.buffer_pages.to_le_bytes());
                response.extend_from_slice(&info.flash_pages.to_le_bytes());
                response.extend_from_slice(&info.start_page.to_le_bytes());
                response.extend_from_slice(&[0u8; 12]);
                response.push(info.version);
                Some(response)
            }
            CMD_LOAD_BUFFER => {
                inner.uploads.push(UploadRecord {
                    addr: target,
                    buffer_page: u16::from_le_bytes([frame[3], frame[4]]),
                    offset: u16::from_le_bytes([frame[5], frame[6]]),
                    data: frame[7..].to_vec(),
                });
                None
            }
            CMD_WRITE_FLASH => {
                inner.writes.push(WriteRecord {
                    addr: target,
                    buffer_page: u16::from_le_bytes([frame[3], frame[4]]),
                    flash_page: u16::from_le_bytes([frame[5], frame[6]]),
                    num_pages: u16::from_le_bytes([frame[7], frame[8]]),
                });
                let error = inner.fail_write_with.unwrap_or(0);
                Some(vec![0xFF, target, CMD_WRITE_FLASH, 1, error])
            }
            CMD_READ_FLASH => {
                let mut page = u16::from_le_bytes([frame[3], frame[4]]);
                if inner.skew_read_echo {
                    page = page.wrapping_add(1);
                }
                let mut response = vec![0xFF, target, CMD_READ_FLASH];
                response.extend_from_slice(&page.to_le_bytes());
                response.extend_from_slice(&frame[5..7]);
                response.extend_from_slice(&[0x5A; 27]);
                Some(response)
            }
            CMD_RESET_INIT => {
                Some(vec![0xFF, target, CMD_RESET_INIT, 0xE7, 0xE7, 0xE7, 0xE7, 0xE7])
            }
            CMD_RESET => {
                if frame.get(3) == Some(&0x01) {
                    inner.firmware_resets += 1;
                } else {
                    inner.bootloader_resets += 1;
                }
                None
            }
            _ => None,
        }
    }
}

fn target_info(id: u8, page_size: u16, buffer_pages: u16, flash_pages: u16, start_page: u16, version: u8) -> TargetInfo {
    TargetInfo {
        id,
        addr: id,
        page_size,
        buffer_pages,
        flash_pages,
        start_page,
        version,
    }
}

/// [`Link`] backed by a [`FakeDevice`]
pub struct MockLink {
    device: FakeDevice,
    rx: VecDeque<Vec<u8>>,
}

impl Link for MockLink {
    async fn send(&mut self, packet: &[u8]) -> Result<()> {
        if let Some(response) = self.device.handle(packet) {
            self.rx.push_back(response);
        }
        Ok(())
    }

    async fn receive(&mut self, _timeout: Duration) -> Result<Option<Vec<u8>>> {
        Ok(self.rx.pop_front())
    }

    async fn close(&mut self) {
        self.rx.clear();
    }
}

/// [`LinkFactory`] handing out [`MockLink`]s to one shared [`FakeDevice`]
pub struct MockFactory {
    device: FakeDevice,
}

impl MockFactory {
    pub fn new(device: FakeDevice) -> Self {
        MockFactory { device }
    }
}

impl LinkFactory for MockFactory {
    type Link = MockLink;

    async fn scan(&mut self) -> Result<Option<String>> {
        if self.device.is_silent() {
            Ok(None)
        } else {
            Ok(Some("mock://bootloader".to_string()))
        }
    }

    async fn open(&mut self, _uri: &str) -> Result<MockLink> {
        Ok(MockLink {
            device: self.device.clone(),
            rx: VecDeque::new(),
        })
    }
}

struct AppInner {
    decks: BTreeMap<u8, DeckRecord>,
    // index -> number of queries before the deck reports started
    started_after: HashMap<u8, usize>,
    queries: usize,
    writes: Vec<(u8, u32, Vec<u8>)>,
    write_result: bool,
    connected: bool,
    connects: usize,
}

/// Scripted application-mode client for deck pipeline tests
#[derive(Clone)]
pub struct FakeAppClient(Rc<RefCell<AppInner>>);

impl FakeAppClient {
    pub fn new(decks: Vec<DeckRecord>) -> Self {
        let decks = decks.into_iter().map(|d| (d.index, d)).collect();
        FakeAppClient(Rc::new(RefCell::new(AppInner {
            decks,
            started_after: HashMap::new(),
            queries: 0,
            writes: Vec::new(),
            write_result: true,
            connected: false,
            connects: 0,
        })))
    }

    /// Report the deck as not started until `queries` queries have been made
    pub fn started_after(&self, index: u8, queries: usize) {
        self.0.borrow_mut().started_after.insert(index, queries);
    }

    pub fn fail_writes(&self) {
        self.0.borrow_mut().write_result = false;
    }

    pub fn writes(&self) -> Vec<(u8, u32, Vec<u8>)> {
        self.0.borrow().writes.clone()
    }

    pub fn connects(&self) -> usize {
        self.0.borrow().connects
    }

    pub fn is_connected(&self) -> bool {
        self.0.borrow().connected
    }
}

impl AppClient for FakeAppClient {
    async fn connect(&mut self, _uri: &str) -> Result<()> {
        let mut inner = self.0.borrow_mut();
        inner.connected = true;
        inner.connects += 1;
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.0.borrow_mut().connected = false;
    }

    async fn query_decks(&mut self) -> Result<BTreeMap<u8, DeckRecord>> {
        let mut inner = self.0.borrow_mut();
        inner.queries += 1;
        let queries = inner.queries;
        let started_after = inner.started_after.clone();
        let mut decks = inner.decks.clone();
        for (index, deck) in decks.iter_mut() {
            if let Some(after) = started_after.get(index) {
                deck.is_started = queries > *after;
            }
        }
        Ok(decks)
    }

    async fn deck_write(&mut self, index: u8, offset: u32, data: &[u8]) -> Result<bool> {
        let mut inner = self.0.borrow_mut();
        inner.writes.push((index, offset, data.to_vec()));
        Ok(inner.write_result)
    }
}

/// A deck record with every upgrade capability enabled
pub fn upgradable_deck(index: u8, name: &str) -> DeckRecord {
    DeckRecord {
        index,
        name: name.to_string(),
        is_started: true,
        supports_fw_upgrade: true,
        is_fw_upgrade_required: true,
        is_bootloader_active: true,
    }
}
