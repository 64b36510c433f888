//! # Firmware upgrade engine for the Crazyflie bootloader
//!
//! This crate reprograms a Crazyflie 2.x quadcopter over the radio
//! bootloader. It takes a firmware bundle (a ZIP archive with a manifest and
//! several targeted images) or a single raw binary image and writes it to
//! the flash of the aircraft's microcontrollers and, during a warm upgrade,
//! to the microcontrollers of attached expansion decks.
//!
//! The supported quadcopters are:
//! - Crazyflie 2.0
//! - Crazyflie 2.1
//! - Crazyflie Bolt
//! - Crazyflie Brushless 2.1
//!
//! # Crazyflie bootloader architecture
//!
//! The Crazyflie 2.x has a radio bootloader which is the main mean by which
//! it can be programmed. The radio bootloader gives access to two separate
//! chip bootloaders:
//! - The STM32 bootloader, which is used to program the main flight
//!   controller chip.
//! - The nRF51 bootloader, which is used to program the radio chip.
//!
//! The nRF51 bootloader also acts as a proxy between the Crazyradio and the
//! STM32 bootloader. It relays all commands to the STM32 bootloader and
//! sends back the responses.
//!
//! # Upgrade flow
//!
//! A [`Bootloader`] session enters bootloader mode either cold (the device
//! was powered on with the power switch held and is discovered by scanning)
//! or warm (a running device is rebooted into its bootloader via a software
//! reset). The session probes the protocol version and flash geometry of
//! each target, matches the bundle's artifacts against the device platform,
//! and streams each image through the device staging buffer in page batches.
//!
//! Expansion decks are upgraded during warm upgrades only: the session
//! temporarily returns the aircraft to application mode, enumerates deck
//! memories through an application-mode client, writes each selected deck,
//! and re-enters bootloader mode.
//!
//! The application-mode protocol itself is left to another crate (such as
//! [cflib](https://github.com/bitcraze/crazyflie-lib-rs)) and is consumed
//! through the [`AppClient`] trait.
//!
//! See the `cfupgrade` binary in this repository for a CLI embedder.

#![deny(missing_docs)]

mod bllink;
pub mod bootloader;
pub mod bundle;
pub mod cloader;
pub mod deck;
mod error;
pub mod packets;

#[cfg(test)]
pub(crate) mod testutil;

pub use bllink::{BOOTLOADER_URI, Link, LinkFactory, RadioLink, RadioLinkFactory};
pub use bootloader::{Bootloader, InfoCallback, Mode, ProgressCallback, TerminateCallback};
pub use bundle::{FlashArtifact, Target};
pub use cloader::Cloader;
pub use deck::{AppClient, DeckRecord, NoAppClient};
pub use error::{Error, Result};
