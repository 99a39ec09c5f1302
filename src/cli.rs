//! CLI surface for scopewire.
//!
//! `serve` runs a server on simulated hardware; the other commands are thin
//! clients against a running server.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use clap::{ArgAction, Parser, Subcommand};
use crossbeam::channel::RecvTimeoutError;

use crate::config::{self, Config};
use crate::remote::{self, ClientEvent, RemoteClient, RemoteServerConfig, SimulatedStage};
use crate::signals::Vec3;
use crate::store::SliceStore;
use crate::{Error, Result};

#[derive(Parser, Debug)]
#[command(
    name = "scopewire",
    version,
    about = "Remote microscope control and slice transfer",
    arg_required_else_help = true
)]
pub struct Cli {
    /// Host to bind or dial (default: from config).
    #[arg(long, global = true, value_name = "HOST")]
    pub host: Option<String>,

    /// Control port; the data plane uses the next port up.
    #[arg(long, global = true, value_name = "PORT")]
    pub port: Option<u16>,

    /// Debug output (repeat for more).
    #[arg(short = 'v', long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a server on simulated hardware until a shutdown command arrives.
    Serve,

    /// Print the server status.
    Status,

    /// Snap one image and report the transferred slice.
    Snap,

    /// Move the stage to a position, in micrometers.
    MoveStage { x: f32, y: f32, z: f32 },

    /// Ask the server to shut down.
    Shutdown,

    /// Follow server events until it shuts down.
    Watch,
}

pub fn run(cli: Cli) -> Result<()> {
    let mut config = config::load_or_init();
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.base_port = port;
    }

    match cli.command {
        Commands::Serve => serve(&config),
        Commands::Status => status(&config),
        Commands::Snap => snap(&config),
        Commands::MoveStage { x, y, z } => move_stage(&config, Vec3::new(x, y, z)),
        Commands::Shutdown => shutdown(&config),
        Commands::Watch => watch(&config),
    }
}

fn serve(config: &Config) -> Result<()> {
    let store = Arc::new(Mutex::new(SliceStore::new(config.storage_budget_bytes)));
    let handle = remote::start_server(
        Box::new(SimulatedStage::small()),
        store,
        RemoteServerConfig {
            control_addr: config.control_addr(),
            data_addr: config.data_addr(),
        },
    )?;
    println!(
        "serving control on {}:{} and data on {}:{}",
        config.host,
        handle.control_port(),
        config.host,
        handle.data_port()
    );
    handle.join();
    println!("server stopped");
    Ok(())
}

fn connect(config: &Config) -> Result<RemoteClient> {
    Ok(RemoteClient::connect(
        &config.control_addr(),
        &config.data_addr(),
    )?)
}

fn status(config: &Config) -> Result<()> {
    let client = connect(config)?;
    let result = wait_for(&client, Duration::from_secs(5), |event| match event {
        ClientEvent::Status(status) => Some(status),
        _ => None,
    });
    let status = match result {
        Some(status) => status,
        None => {
            client.close();
            return Err(Error::Timeout("server status"));
        }
    };

    println!("state:   {:?}", status.state);
    println!("clients: {}", status.connected_clients);
    println!("data:    {:?}", status.data_ports);
    let hw = &status.hardware_dimensions;
    println!(
        "stage:   {:?} .. {:?}, image {}x{} ({:?})",
        hw.stage_min, hw.stage_max, hw.image_size.x, hw.image_size.y, hw.numeric_type
    );
    client.close();
    Ok(())
}

fn snap(config: &Config) -> Result<()> {
    let client = connect(config)?;
    client.snap_image();
    let result = wait_for(&client, Duration::from_secs(10), |event| match event {
        ClientEvent::SliceReady { meta, data } => Some((meta, data)),
        _ => None,
    });
    match result {
        Some((meta, data)) => {
            println!(
                "slice {} at {:?}: {} bytes",
                meta.id,
                meta.stage_pos,
                data.len()
            );
            client.close();
            Ok(())
        }
        None => {
            client.close();
            Err(Error::Timeout("snapped slice"))
        }
    }
}

fn move_stage(config: &Config, target: Vec3) -> Result<()> {
    let client = connect(config)?;
    client.move_stage(target);
    // Leave the control loop a moment to flush the queued command.
    thread::sleep(Duration::from_millis(500));
    client.close();
    println!("move to {target:?} sent");
    Ok(())
}

fn shutdown(config: &Config) -> Result<()> {
    let client = connect(config)?;
    client.request_server_shutdown();
    client.join();
    println!("server shut down");
    Ok(())
}

fn watch(config: &Config) -> Result<()> {
    let client = connect(config)?;
    loop {
        match client.events().recv_timeout(Duration::from_millis(200)) {
            Ok(ClientEvent::Status(status)) => {
                println!("status: {:?}, {} clients", status.state, status.connected_clients);
            }
            Ok(ClientEvent::Stack(stack)) => {
                println!(
                    "stack {}: {} slices from {:?} to {:?}",
                    stack.id, stack.slice_count, stack.from, stack.to
                );
            }
            Ok(ClientEvent::SliceReady { meta, data }) => {
                println!(
                    "slice {} at {:?}: {} bytes{}",
                    meta.id,
                    meta.stage_pos,
                    data.len(),
                    meta.stack_id
                        .map(|id| format!(" (stack {id})"))
                        .unwrap_or_default()
                );
            }
            Ok(ClientEvent::SliceDropped { slice_id }) => {
                println!("slice {slice_id} dropped by the server");
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if client.is_closed() {
            break;
        }
    }
    client.close();
    println!("server closed the control link");
    Ok(())
}

fn wait_for<T>(
    client: &RemoteClient,
    timeout: Duration,
    mut pick: impl FnMut(ClientEvent) -> Option<T>,
) -> Option<T> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.checked_duration_since(Instant::now())?;
        match client.events().recv_timeout(remaining) {
            Ok(event) => {
                if let Some(found) = pick(event) {
                    return Some(found);
                }
            }
            Err(RecvTimeoutError::Timeout) => return None,
            Err(RecvTimeoutError::Disconnected) => return None,
        }
    }
}
