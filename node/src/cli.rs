//! # CLI Interface
//!
//! `clap` derive definitions for `seatpass-node`.

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::logging::LogFormat;

/// SeatPass device host.
///
/// Runs simulated SeatPass devices in-process, either as a self-contained
/// handshake demo or as a single device behind an HTTP/WebSocket API for a
/// UI to drive.
#[derive(Parser, Debug)]
#[command(
    name = "seatpass-node",
    about = "SeatPass device host",
    version,
    propagate_version = true
)]
pub struct SeatPassCli {
    /// Protocol tunables as a JSON file. Missing fields keep their defaults.
    #[arg(long, short = 'c', global = true, env = "SEATPASS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run several simulated devices through the full handshake and print
    /// each ledger.
    Simulate(SimulateArgs),
    /// Run one device with a persisted ledger and serve the UI API.
    Serve(ServeArgs),
    /// Print the persisted ledger.
    Points(PointsArgs),
    /// Print version information and exit.
    Version,
}

/// How the seeker in a simulation answers offers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum AnswerMode {
    /// Accept each offer as soon as it arrives.
    #[default]
    Explicit,
    /// Never answer; the confirmation timeout settles every offer.
    Timeout,
}

#[derive(Args, Debug)]
pub struct SimulateArgs {
    /// Number of devices. The first needs a seat, the rest offer theirs.
    #[arg(
        long,
        short = 'n',
        default_value_t = 3,
        value_parser = clap::value_parser!(u16).range(2..=64)
    )]
    pub devices: u16,

    /// How the seeker answers.
    #[arg(long, value_enum, default_value_t = AnswerMode::Explicit)]
    pub answer: AnswerMode,

    /// Reason carried in each offer.
    #[arg(long, default_value = "pregnant")]
    pub receiver_type: String,

    /// Wall-clock seconds to let the simulation run.
    #[arg(long, default_value_t = 8)]
    pub duration_secs: u64,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Directory holding the ledger and settings database.
    #[arg(long, short = 'd', env = "SEATPASS_DATA_DIR", default_value = ".seatpass")]
    pub data_dir: PathBuf,

    /// Address to bind the API on.
    #[arg(long, env = "SEATPASS_API_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Port for the HTTP/WebSocket API and `/metrics`.
    #[arg(long, env = "SEATPASS_API_PORT", default_value_t = 8787)]
    pub api_port: u16,

    /// Simulated peers to run alongside the served device. Each offers its
    /// seat to any seeker it finds.
    #[arg(long, default_value_t = 0)]
    pub peers: u16,

    /// Expose `POST /test/inject` for feeding a synthetic request.
    #[arg(long, default_value_t = false)]
    pub test_routes: bool,
}

#[derive(Args, Debug)]
pub struct PointsArgs {
    /// Directory holding the ledger database.
    #[arg(long, short = 'd', env = "SEATPASS_DATA_DIR", default_value = ".seatpass")]
    pub data_dir: PathBuf,
}
