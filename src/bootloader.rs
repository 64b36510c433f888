//! # Firmware upgrade session
//!
//! The session drives a full upgrade: entering bootloader mode (cold or
//! warm), matching bundle artifacts against the device, streaming images
//! page by page through the staging buffer, and, on a warm boot, the
//! excursion back into application mode to reflash expansion decks.
//!
//! The session owns the link exclusively. During deck flashing the
//! bootloader link is closed before the application-mode client connects,
//! and bootloader mode is re-entered afterwards so a warm upgrade ends in
//! the mode it started in.

use std::path::Path;
use std::time::Duration;

use tracing::{info, warn};

use crate::bllink::{BOOTLOADER_URI, LinkFactory};
use crate::bundle::{self, FlashArtifact, Target};
use crate::cloader::{
    CF1_PROTO_VER_0, CF1_PROTO_VER_1, CF2_PROTO_VER, Cloader, TARGET_NRF51, TARGET_STM32, is_cf2,
    target_name,
};
use crate::deck::{AppClient, DECK_STARTED_POLL_BUDGET, DECK_STARTED_POLL_INTERVAL};
use crate::error::{Error, Result};
use crate::packets::{DeviceFlashError, TargetInfo};

// Bridges the host-USB open/close race after a cold-boot scan
const COLD_BOOT_SETTLE: Duration = Duration::from_secs(1);
// Time for the device to re-enumerate in application mode
const FIRMWARE_RESTART_SETTLE: Duration = Duration::from_secs(3);

/// Progress sink: a human-readable milestone and a percentage in `[0, 100]`
pub type ProgressCallback = Box<dyn FnMut(&str, u8)>;
/// Cancellation predicate, polled once per page and once per deck
pub type TerminateCallback = Box<dyn Fn() -> bool>;
/// Invoked once after bootloader entry with the protocol version and the
/// geometry of the connected targets
pub type InfoCallback = Box<dyn FnMut(u8, &[TargetInfo])>;

/// Mode of the device as observed by this session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// The bootloader link is open and the device accepts flash commands
    Bootloader,
    /// The device runs application firmware
    Firmware,
    /// No link is open
    Closed,
}

/// Firmware upgrade session for one device
///
/// Created around an optional link URI. A session enters bootloader mode with
/// [`start_bootloader`](Self::start_bootloader), flashes one bundle or raw
/// image with [`flash`](Self::flash), and terminates when closed. Exactly one
/// session owns the link at a time.
pub struct Bootloader<F: LinkFactory> {
    clink: Option<String>,
    cload: Cloader<F>,
    mode: Mode,
    warm_booted: bool,
    progress_cb: Option<ProgressCallback>,
    terminate_cb: Option<TerminateCallback>,
}

impl<F: LinkFactory> Bootloader<F> {
    /// Create a session around the link address used after resetting to the
    /// bootloader
    ///
    /// `clink` defaults to the fixed radio bootloader URI.
    pub fn new(factory: F, clink: Option<String>) -> Self {
        Bootloader {
            clink,
            cload: Cloader::new(factory),
            mode: Mode::Closed,
            warm_booted: false,
            progress_cb: None,
            terminate_cb: None,
        }
    }

    /// Register the progress sink
    pub fn set_progress_callback(&mut self, cb: ProgressCallback) {
        self.progress_cb = Some(cb);
    }

    /// Register the cancellation predicate
    pub fn set_terminate_callback(&mut self, cb: TerminateCallback) {
        self.terminate_cb = Some(cb);
    }

    /// Mode the session currently observes the device in
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Protocol version probed at bootloader entry
    pub fn protocol_version(&self) -> u8 {
        self.cload.protocol_version()
    }

    /// Access the underlying protocol engine
    pub fn cloader(&mut self) -> &mut Cloader<F> {
        &mut self.cload
    }

    fn report(&mut self, message: &str, percent: u8) {
        if let Some(cb) = self.progress_cb.as_mut() {
            cb(message, percent);
        } else {
            info!(percent, "{}", message);
        }
    }

    fn should_terminate(&self) -> bool {
        self.terminate_cb.as_ref().is_some_and(|cb| cb())
    }

    /// Enter bootloader mode
    ///
    /// On warm boot the open application-mode link is closed, the bootloader
    /// link is opened at the known URI and the device is rebooted into its
    /// bootloader. On cold boot the device is expected to already sit in
    /// bootloader mode and is discovered by scanning.
    ///
    /// Returns false when no bootloader answered. A device advertising an
    /// unrecognized protocol version aborts with
    /// [`Error::ProtocolUnsupported`].
    pub async fn start_bootloader<A: AppClient>(
        &mut self,
        warm_boot: bool,
        app: Option<&mut A>,
    ) -> Result<bool> {
        self.warm_booted = warm_boot;

        let started = if warm_boot {
            if let Some(app) = app {
                app.disconnect().await;
            }
            let uri = self.boot_uri();
            self.cload.open(&uri).await?;
            let mut started = self.cload.reset_to_bootloader(TARGET_NRF51).await?;
            if started {
                started = self.cload.check_link_and_get_info().await?;
            }
            started
        } else if self.cload.is_open() {
            true
        } else {
            match self.cload.scan_for_bootloader().await? {
                Some(uri) => {
                    // Workaround for libusb on Windows (open/close too fast)
                    tokio::time::sleep(COLD_BOOT_SETTLE).await;
                    self.cload.open(&uri).await?;
                    self.cload.check_link_and_get_info().await?
                }
                None => false,
            }
        };

        if started {
            match self.cload.protocol_version() {
                CF1_PROTO_VER_0 | CF1_PROTO_VER_1 => {
                    // Single-MCU device, geometry already read inline
                }
                CF2_PROTO_VER => {
                    self.cload.request_info_update(TARGET_NRF51).await?;
                }
                other => {
                    self.close().await;
                    return Err(Error::ProtocolUnsupported(other));
                }
            }
            self.mode = Mode::Bootloader;
        }

        Ok(started)
    }

    /// Interrogate one target and return its geometry
    pub async fn get_target(&mut self, target_id: u8) -> Result<TargetInfo> {
        self.cload.request_info_update(target_id).await
    }

    /// Boot the device back into application firmware
    ///
    /// For the CF2 protocol the reset is issued against the NRF51 link
    /// target, for CF1 against the STM32.
    pub async fn reset_to_firmware(&mut self) -> Result<()> {
        if self.mode != Mode::Bootloader {
            return Err(Error::InvalidOperation(
                "cannot reset to firmware outside bootloader mode".to_string(),
            ));
        }
        let target_id = if is_cf2(self.cload.protocol_version()) {
            TARGET_NRF51
        } else {
            TARGET_STM32
        };
        self.cload.reset_to_firmware(target_id).await?;
        self.mode = Mode::Firmware;
        Ok(())
    }

    /// Release the link
    pub async fn close(&mut self) {
        self.cload.close().await;
        self.mode = Mode::Closed;
    }

    /// Full upgrade: enter the bootloader, flash, reset to firmware
    ///
    /// `info_cb`, if given, is invoked once after bootloader entry with the
    /// protocol version and the geometry of the STM32 and, on CF2, the NRF51.
    pub async fn flash_full<A: AppClient>(
        &mut self,
        filename: &Path,
        warm: bool,
        targets: &[Target],
        mut app: Option<&mut A>,
        mut info_cb: Option<InfoCallback>,
    ) -> Result<()> {
        let started = self
            .start_bootloader(warm, app.as_mut().map(|a| &mut **a))
            .await?;
        if !started {
            return Err(Error::Link("could not connect to bootloader".to_string()));
        }

        if let Some(cb) = info_cb.as_mut() {
            let mut connected = vec![self.get_target(TARGET_STM32).await?];
            if is_cf2(self.cload.protocol_version()) {
                connected.push(self.get_target(TARGET_NRF51).await?);
            }
            cb(self.cload.protocol_version(), &connected);
        }

        self.flash(filename, targets, app).await?;
        self.reset_to_firmware().await
    }

    /// Flash a bundle or raw image to the requested targets
    ///
    /// An empty `targets` list flashes everything the bundle offers; a
    /// non-empty list is an allow-filter by full triple equality. Deck
    /// targets are handled through the warm-boot excursion and require an
    /// application-mode client.
    pub async fn flash<A: AppClient>(
        &mut self,
        filename: &Path,
        targets: &[Target],
        mut app: Option<&mut A>,
    ) -> Result<()> {
        if self.mode != Mode::Bootloader {
            return Err(Error::InvalidOperation(
                "session is not in bootloader mode".to_string(),
            ));
        }

        // Separate flash targets from decks
        let platform = self.platform_id();
        let any_flash_target = targets.iter().any(|t| t.platform == platform);
        let any_deck_target = targets.iter().any(|t| t.platform == "deck");

        // Fetch artifacts from the source file
        let mut artifacts = bundle::read_bundle(filename)?;
        if artifacts.is_empty() {
            if targets.len() == 1 {
                let content = std::fs::read(filename)?;
                artifacts = vec![FlashArtifact {
                    content,
                    target: targets[0].clone(),
                }];
            } else {
                return Err(Error::RawBinaryMultipleTargets);
            }
        }

        let selected =
            |target: &Target| targets.is_empty() || targets.contains(target);
        let (flash_artifacts, rest): (Vec<_>, Vec<_>) = artifacts
            .into_iter()
            .partition(|a| a.target.platform == platform && selected(&a.target));
        let deck_artifacts: Vec<_> = rest
            .into_iter()
            .filter(|a| a.target.platform == "deck")
            .collect();

        // Flash the MCU flash
        if targets.is_empty() || any_flash_target {
            for (i, artifact) in flash_artifacts.iter().enumerate() {
                self.flash_artifact(artifact, i + 1, flash_artifacts.len())
                    .await?;
            }
        }

        // Flash the decks
        let mut deck_update_msg = "Deck update skipped.";
        if targets.is_empty() || any_deck_target {
            if self.warm_booted {
                match app.take() {
                    Some(app) => {
                        self.report("Restarting firmware to update decks.", 0);

                        // Hand the link over to the application-mode client
                        self.reset_to_firmware().await?;
                        self.close().await;
                        tokio::time::sleep(FIRMWARE_RESTART_SETTLE).await;

                        self.flash_decks(app, &deck_artifacts, targets).await?;

                        self.report("Deck updated! Restarting firmware.", 100);

                        // Exit the function in the same mode we entered it
                        if !self.start_bootloader(true, Some(app)).await? {
                            return Err(Error::Link(
                                "could not re-enter bootloader after deck update".to_string(),
                            ));
                        }
                        deck_update_msg = "Deck update complete.";
                    }
                    None => {
                        warn!("no application-mode client, skipping deck update");
                        deck_update_msg = "Deck update skipped, no application-mode client.";
                    }
                }
            } else {
                info!("Skipping updating deck on coldboot");
                deck_update_msg = "Deck update skipped in ColdBoot mode.";
            }
        }

        let total = flash_artifacts.len();
        self.report(
            &format!("({}/{}) Flashing done! {}", total, total, deck_update_msg),
            100,
        );
        Ok(())
    }

    /// Platform identifier used in the bundle manifest for this device
    fn platform_id(&self) -> &'static str {
        if is_cf2(self.cload.protocol_version()) {
            "cf2"
        } else {
            "cf1"
        }
    }

    // Stream one artifact onto its target, page by page through the staging
    // buffer. Page programs are batched up to the buffer capacity and always
    // address the first page of the batch.
    async fn flash_artifact(
        &mut self,
        artifact: &FlashArtifact,
        current_file: usize,
        total_files: usize,
    ) -> Result<()> {
        let geometry = self
            .cload
            .target_by_name(&artifact.target.target)
            .cloned()
            .ok_or_else(|| {
                Error::InvalidOperation(format!(
                    "no geometry for target '{}'",
                    artifact.target.target
                ))
            })?;
        let name = target_name(geometry.id);

        let image = &artifact.content;
        let page_size = geometry.page_size as usize;
        let start_page = geometry.start_page;

        let factor = (100.0 * page_size as f64) / image.len() as f64;
        let mut progress = 0.0f64;

        self.report(
            &format!("Firmware ({}/{}) Starting...", current_file, total_files),
            0,
        );

        if image.len() > geometry.writable_bytes() {
            self.report("Error: Not enough space to flash the image file.", 0);
            return Err(Error::InsufficientSpace {
                image: image.len(),
                available: geometry.writable_bytes(),
            });
        }

        let num_pages = image.len().div_ceil(page_size);
        info!(
            bytes = image.len(),
            pages = num_pages,
            target = name,
            "flashing image"
        );

        let mut ctr: u16 = 0; // Buffer counter
        for i in 0..num_pages {
            if self.should_terminate() {
                return Err(Error::Terminated);
            }

            // Load the buffer, the final partial page keeps its short length
            let begin = i * page_size;
            let end = ((i + 1) * page_size).min(image.len());
            self.cload
                .upload_buffer(geometry.addr, ctr, 0, &image[begin..end])
                .await?;
            ctr += 1;

            progress += factor;
            self.report(
                &format!(
                    "Firmware ({}/{}) Uploading buffer to {}...",
                    current_file, total_files, name
                ),
                progress.min(100.0) as u8,
            );

            // Flash when the complete buffers are full
            if ctr >= geometry.buffer_pages {
                self.report(
                    &format!(
                        "Firmware ({}/{}) Writing buffer to {}...",
                        current_file, total_files, name
                    ),
                    progress.min(100.0) as u8,
                );
                let dest = start_page + i as u16 - (ctr - 1);
                if !self.cload.write_flash(geometry.addr, 0, dest, ctr).await? {
                    return self.flash_error(progress);
                }
                ctr = 0;
            }
        }

        // Residual pages, destination derived from the first buffered page
        if ctr > 0 {
            self.report(
                &format!(
                    "Firmware ({}/{}) Writing buffer to {}...",
                    current_file, total_files, name
                ),
                progress.min(100.0) as u8,
            );
            let dest = start_page + (num_pages - 1) as u16 - (ctr - 1);
            if !self.cload.write_flash(geometry.addr, 0, dest, ctr).await? {
                return self.flash_error(progress);
            }
        }

        Ok(())
    }

    fn flash_error(&mut self, progress: f64) -> Result<()> {
        let code = self.cload.error_code();
        self.report(
            &format!(
                "Error during flash operation (code {}): {}",
                code,
                DeviceFlashError::from(code)
            ),
            progress.min(100.0) as u8,
        );
        Err(Error::DeviceProgram { code })
    }

    // Application-mode excursion: enumerate deck memories and write every
    // deck that is selected, has an artifact and is ready for an upgrade.
    async fn flash_decks<A: AppClient>(
        &mut self,
        app: &mut A,
        artifacts: &[FlashArtifact],
        targets: &[Target],
    ) -> Result<()> {
        let flash_all_targets = targets.is_empty();

        self.report("Detecting deck to be updated", 25);

        let uri = self.boot_uri();
        app.connect(&uri).await?;
        let result = self
            .flash_decks_connected(app, artifacts, flash_all_targets, targets)
            .await;
        app.disconnect().await;
        result
    }

    async fn flash_decks_connected<A: AppClient>(
        &mut self,
        app: &mut A,
        artifacts: &[FlashArtifact],
        flash_all_targets: bool,
        targets: &[Target],
    ) -> Result<()> {
        let decks = app.query_decks().await?;
        if decks.is_empty() {
            return Ok(());
        }

        'decks: for (deck_index, mut deck) in decks {
            if self.should_terminate() {
                return Err(Error::Terminated);
            }

            // Check that we want to flash this deck
            if !flash_all_targets && !targets.contains(&Target::deck_fw(&deck.name)) {
                info!("Skipping {}", deck.name);
                continue;
            }

            // Check that we have an artifact for this deck
            let Some(artifact) = artifacts
                .iter()
                .find(|a| a.target == Target::deck_fw(&deck.name))
            else {
                info!("Skipping {}, no artifact for it in the bundle", deck.name);
                continue;
            };

            self.report(&format!("Updating deck {}", deck.name), 50);
            info!("Handling {}", deck.name);

            // Wait for the deck to be started, within the poll budget
            let mut polls = 0;
            while !deck.is_started {
                if polls >= DECK_STARTED_POLL_BUDGET {
                    warn!("Deck {} did not start, skipping!", deck.name);
                    continue 'decks;
                }
                info!("Deck not yet started ...");
                tokio::time::sleep(DECK_STARTED_POLL_INTERVAL).await;
                match app.query_decks().await?.remove(&deck_index) {
                    Some(requeried) => deck = requeried,
                    None => {
                        warn!("Deck {} disappeared, skipping!", deck.name);
                        continue 'decks;
                    }
                }
                polls += 1;
            }

            if !deck.supports_fw_upgrade {
                warn!("Deck {} does not support firmware update, skipping!", deck.name);
                continue;
            }
            if !deck.is_fw_upgrade_required {
                info!("Deck {} firmware up to date, skipping", deck.name);
                continue;
            }
            if !deck.is_bootloader_active {
                warn!("Error: Deck {} bootloader not active, skipping!", deck.name);
                continue;
            }

            if app.deck_write(deck_index, 0, &artifact.content).await? {
                self.report(&format!("Deck {} updated successfully!", deck.name), 75);
            } else {
                self.report(&format!("Failed to update deck {}", deck.name), 0);
                return Err(Error::DeckUpdateFailed(deck.name));
            }
        }

        Ok(())
    }

    fn boot_uri(&self) -> String {
        self.clink
            .clone()
            .unwrap_or_else(|| BOOTLOADER_URI.to_string())
    }
}
