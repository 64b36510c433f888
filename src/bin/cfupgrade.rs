use std::path::PathBuf;

use anyhow::{Result, bail};
use cfupgrade::cloader::{self, TARGET_NRF51, TARGET_STM32, is_cf2};
use cfupgrade::{Bootloader, InfoCallback, NoAppClient, RadioLinkFactory, Target};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cfupgrade")]
#[command(about = "Firmware upgrade tool for the Crazyflie 2.x radio bootloader")]
struct Cli {
    /// Bootloader link URI, defaults to the fixed radio bootloader address
    #[arg(long, global = true)]
    uri: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print protocol version and flash geometry of the connected bootloaders
    Info,
    /// Flash a firmware bundle (.zip) or a raw binary to the device
    Flash {
        /// Bundle or binary file to flash
        file: PathBuf,
        /// Restrict flashing to these targets (platform:target[:kind]),
        /// flash everything the bundle offers when omitted
        #[arg(short, long = "target")]
        targets: Vec<String>,
        /// Warm boot: reboot a running device into its bootloader first
        #[arg(short, long)]
        warm: bool,
    },
    /// Read back flash and compare it against a binary image
    Verify {
        /// Binary image to compare against
        file: PathBuf,
        /// MCU to read from (stm32 or nrf51)
        #[arg(short, long, default_value = "stm32")]
        mcu: String,
    },
    /// Reset a device in bootloader mode back to firmware
    Reset,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    if let Err(error) = run(Cli::parse()).await {
        eprintln!("Error: {:#}", error);
        let code = error
            .downcast_ref::<cfupgrade::Error>()
            .map(|e| e.exit_code())
            .unwrap_or(1);
        std::process::exit(code);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut session = Bootloader::new(RadioLinkFactory, cli.uri);

    match cli.command {
        Commands::Info => {
            connect_cold(&mut session).await?;

            let version = session.protocol_version();
            println!("Connected to bootloader protocol 0x{:02X}", version);
            let stm32 = session.get_target(TARGET_STM32).await?;
            println!("  stm32: {}", stm32);
            if is_cf2(version) {
                let nrf51 = session.get_target(TARGET_NRF51).await?;
                println!("  nrf51: {}", nrf51);
            }
            session.close().await;
        }
        Commands::Flash {
            file,
            targets,
            warm,
        } => {
            let targets = targets
                .iter()
                .map(|t| t.parse())
                .collect::<cfupgrade::Result<Vec<Target>>>()?;

            let progress = ProgressBar::new(100);
            progress.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{wide_bar:.cyan/blue}] {pos:>3}% {msg}")
                    .unwrap()
                    .progress_chars("#>-"),
            );
            let bar = progress.clone();
            session.set_progress_callback(Box::new(move |message, percent| {
                bar.set_position(percent as u64);
                bar.set_message(message.to_string());
            }));

            let info_cb: InfoCallback = Box::new(|version, targets| {
                println!("Connected to bootloader protocol 0x{:02X}", version);
                for info in targets {
                    println!("  {}: {}", cloader::target_name(info.id), info);
                }
            });

            session
                .flash_full::<NoAppClient>(&file, warm, &targets, None, Some(info_cb))
                .await?;
            progress.finish_with_message("Flashing done!");
        }
        Commands::Verify { file, mcu } => {
            let Some(target_id) = cloader::target_id_from_name(&mcu) else {
                bail!("unknown MCU '{}', expected stm32 or nrf51", mcu);
            };
            let image = tokio::fs::read(&file).await?;

            connect_cold(&mut session).await?;
            let geometry = session.get_target(target_id).await?;

            println!(
                "Reading back {} bytes from {}...",
                image.len(),
                cloader::target_name(target_id)
            );
            let readback = read_image(&mut session, &geometry, image.len()).await?;
            session.reset_to_firmware().await?;
            session.close().await;

            match image.iter().zip(&readback).position(|(a, b)| a != b) {
                None if readback.len() == image.len() => println!("Verification passed"),
                Some(offset) => bail!("verification failed at offset {}", offset),
                None => bail!(
                    "device returned only {} of {} bytes",
                    readback.len(),
                    image.len()
                ),
            }
        }
        Commands::Reset => {
            connect_cold(&mut session).await?;
            session.reset_to_firmware().await?;
            session.close().await;
            println!("Device restarted into firmware");
        }
    }

    Ok(())
}

async fn connect_cold(session: &mut Bootloader<RadioLinkFactory>) -> Result<()> {
    println!("Searching for a bootloader...");
    if !session.start_bootloader::<NoAppClient>(false, None).await? {
        bail!("no bootloader found, hold the power button to enter bootloader mode");
    }
    Ok(())
}

// Read back an image-sized region starting at the firmware start page
async fn read_image(
    session: &mut Bootloader<RadioLinkFactory>,
    geometry: &cfupgrade::packets::TargetInfo,
    length: usize,
) -> Result<Vec<u8>> {
    let page_size = geometry.page_size as usize;
    let base = geometry.start_page as usize * page_size;
    let mut image = Vec::with_capacity(length);

    while image.len() < length {
        let address = base + image.len();
        let page = (address / page_size) as u16;
        let offset = (address % page_size) as u16;
        let packet = session.cloader().read_flash(geometry.addr, page, offset).await?;
        if packet.data.is_empty() {
            break;
        }
        let wanted = (length - image.len()).min(packet.data.len());
        image.extend_from_slice(&packet.data[..wanted]);
    }

    Ok(image)
}
