//! # Deck memory collaborator interface
//!
//! Expansion decks carry their own microcontrollers and expose a firmware
//! upgrade path through the deck-memory subsystem of the application
//! firmware. The upgrade session consumes that subsystem through the
//! [`AppClient`] trait; the concrete client lives in the application-protocol
//! crate, this crate only drives it during the warm-boot excursion.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::{Error, Result};

/// How often a not-yet-started deck is re-queried
pub(crate) const DECK_STARTED_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// How many polls before a not-yet-started deck is given up on
pub(crate) const DECK_STARTED_POLL_BUDGET: usize = 50;

/// State of one deck as reported by the deck-memory query
#[derive(Debug, Clone)]
pub struct DeckRecord {
    /// Index of the deck in the deck-memory enumeration
    pub index: u8,
    /// Product name of the deck, e.g. "bcLighthouse4"
    pub name: String,
    /// Whether the deck has finished starting up
    pub is_started: bool,
    /// Whether the deck supports firmware upgrades at all
    pub supports_fw_upgrade: bool,
    /// Whether the deck firmware differs from the one it requires
    pub is_fw_upgrade_required: bool,
    /// Whether the deck is currently running its bootloader
    pub is_bootloader_active: bool,
}

/// Application-mode client consumed by the deck pipeline
///
/// Implementations bind the application-level protocol: connecting a link in
/// firmware mode, enumerating deck memories and writing deck payloads. The
/// session owns the link handoff; a client is only ever connected while the
/// bootloader link is closed.
pub trait AppClient {
    /// Open an application-mode session on the given URI
    fn connect(&mut self, uri: &str) -> impl Future<Output = Result<()>>;

    /// Close the application-mode session
    fn disconnect(&mut self) -> impl Future<Output = ()>;

    /// Enumerate the decks exposing a deck memory
    fn query_decks(&mut self) -> impl Future<Output = Result<BTreeMap<u8, DeckRecord>>>;

    /// Write `data` at `offset` of the deck's upgrade memory
    ///
    /// Returns false when the deck rejected the write.
    fn deck_write(&mut self, index: u8, offset: u32, data: &[u8]) -> impl Future<Output = Result<bool>>;
}

/// Placeholder client for upgrades without an application-mode session
///
/// Satisfies the [`AppClient`] bound of the session API when the embedder has
/// no application-protocol stack, a cold-boot CLI for instance. Connecting it
/// fails, so deck flashing is reported as unavailable instead of silently
/// doing nothing.
pub struct NoAppClient;

impl AppClient for NoAppClient {
    async fn connect(&mut self, _uri: &str) -> Result<()> {
        Err(Error::InvalidOperation(
            "no application-mode client available".to_string(),
        ))
    }

    async fn disconnect(&mut self) {}

    async fn query_decks(&mut self) -> Result<BTreeMap<u8, DeckRecord>> {
        Ok(BTreeMap::new())
    }

    async fn deck_write(&mut self, _index: u8, _offset: u32, _data: &[u8]) -> Result<bool> {
        Err(Error::InvalidOperation(
            "no application-mode client available".to_string(),
        ))
    }
}
