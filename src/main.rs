//! `kr` - the Krypton CLI.
//!
//! Drives pairing, identity display, pinned hosts, ad-hoc signing, and
//! daemon control through the local control socket.
//!
//! Exit codes: `0` success, `1` generic failure, `2` not paired,
//! `3` rejected by phone, `4` timed out.

use clap::{Parser, Subcommand};

use kr::constants::VERSION;
use kr::error::Result;

#[derive(Parser)]
#[command(name = "kr")]
#[command(version = VERSION)]
#[command(about = "Split SSH agent: keys live on your phone")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pair this workstation with a phone
    Pair {
        /// Edit SSH config even if foreign Krypton lines are present
        #[arg(long)]
        force: bool,
        /// Workstation name shown on the phone (default: hostname)
        #[arg(long)]
        name: Option<String>,
    },
    /// Remove the pairing and cached identity
    Unpair,
    /// Show the paired phone's identity
    Me {
        /// Fetch a fresh profile from the phone
        #[arg(long)]
        refresh: bool,
        /// Git user id to attach to PGP derivation
        #[arg(long)]
        user_id: Option<String>,
    },
    /// List host records pinned on the phone
    Hosts,
    /// Request an ad-hoc signature (base64 in, base64 out)
    Sign {
        /// Base64 SHA-256 fingerprint of the signing key
        #[arg(long)]
        fingerprint: String,
        /// Base64 data to sign
        #[arg(long)]
        data: String,
    },
    /// Poke the phone to check liveness
    Noop,
    /// Show CLI and daemon versions
    Version,
    /// Restart the daemon through the service supervisor
    Restart,
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Pair { force, name } => kr::commands::pair::pair(force, name).await,
        Commands::Unpair => kr::commands::pair::unpair().await,
        Commands::Me { refresh, user_id } => kr::commands::me::me(refresh, user_id).await,
        Commands::Hosts => kr::commands::hosts::hosts().await,
        Commands::Sign { fingerprint, data } => kr::commands::sign::sign(&fingerprint, &data).await,
        Commands::Noop => kr::commands::noop().await,
        Commands::Version => kr::commands::version().await,
        Commands::Restart => kr::commands::restart(),
    }
}

#[tokio::main]
async fn main() {
    kr::logging::init("kr", None);
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        if !kr::env::no_stderr() {
            eprintln!("kr: {e}");
        }
        std::process::exit(e.exit_code());
    }
}
