//! `alma-master` binary: operator front-end for the servo-fleet master.
//!
//! Commands given on the command line run before the stdin loop starts,
//! so a full bring-up can be scripted:
//!
//! ```text
//! alma-master fake "load#libcanfestival_can_socket.so,0,1M,8" "CT0 M1"
//! ```

use std::io::BufRead;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::mpsc;
use std::thread;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use alma_common::MasterConfig;
use alma_master::{Master, MasterEvent, Shared};

#[derive(Debug, Parser)]
#[command(name = "alma-master", about = "CANopen master for a fleet of servo drives")]
struct Args {
    /// Optional TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Start against the simulated drive fleet (same as the `fake`
    /// command).
    #[arg(long)]
    fake: bool,

    /// Enable verbose diagnostics (same as the `verb` command).
    #[arg(long)]
    verbose: bool,

    /// Operator commands executed before reading stdin.
    commands: Vec<String>,
}

fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = match &args.config {
        Some(path) => match MasterConfig::load(path) {
            Ok(config) => config,
            Err(error) => {
                eprintln!("configuration error: {error}");
                return ExitCode::from(2);
            }
        },
        None => MasterConfig::default(),
    };

    let (tx, rx) = mpsc::channel::<MasterEvent>();
    let shared = Shared::new();
    let mut master = Master::new(config.clone(), shared, tx.clone());

    // Create the operator FIFO up front so readers can attach; ignore an
    // existing one.
    let pipe = config.pipe_path(args.fake);
    if let Err(error) = nix::unistd::mkfifo(pipe, nix::sys::stat::Mode::from_bits_truncate(0o666)) {
        if error != nix::errno::Errno::EEXIST {
            warn!(?pipe, %error, "cannot create operator pipe");
        }
    }

    {
        let tx = tx.clone();
        if let Err(error) = ctrlc::set_handler(move || {
            let _ = tx.send(MasterEvent::Shutdown);
        }) {
            warn!(%error, "cannot install signal handler");
        }
    }

    if args.fake {
        let _ = tx.send(MasterEvent::Command("fake".into()));
    }
    if args.verbose {
        let _ = tx.send(MasterEvent::Command("verb".into()));
    }
    for command in &args.commands {
        let _ = tx.send(MasterEvent::Command(command.clone()));
    }

    // Operator input task.
    {
        let tx = tx.clone();
        thread::Builder::new()
            .name("operator-stdin".into())
            .spawn(move || {
                let stdin = std::io::stdin();
                for line in stdin.lock().lines() {
                    let Ok(line) = line else { break };
                    if tx.send(MasterEvent::Command(line)).is_err() {
                        break;
                    }
                }
                let _ = tx.send(MasterEvent::Shutdown);
            })
            .expect("spawn stdin reader");
    }

    let code = master.run(rx);
    let _ = std::fs::remove_file(pipe);
    info!(code, "exiting");
    ExitCode::from(code as u8)
}
