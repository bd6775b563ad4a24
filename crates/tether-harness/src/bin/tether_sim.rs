//! Tether pairing simulator.
//!
//! Runs a complete pairing between two in-process devices over the in-memory
//! relay and reports the outcome through the log.
//!
//! # Usage
//!
//! ```bash
//! tether-sim --identity alice --device-name "work laptop"
//!
//! # Simulate a misheard phrase
//! tether-sim --provisionee-phrase "alpha bravo charlie delta zulu" --timeout-secs 2
//! ```

use std::{process::ExitCode, time::Duration};

use clap::Parser;
use tether_core::DeviceType;
use tether_crypto::KdfParams;
use tether_harness::{DEFAULT_PHRASE, InvariantRegistry, PairingScenario};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Tether pairing simulator
#[derive(Parser, Debug)]
#[command(name = "tether-sim")]
#[command(about = "Run a simulated device pairing")]
#[command(version)]
struct Args {
    /// Identity the new device joins
    #[arg(long, default_value = "alice")]
    identity: String,

    /// Description of the new device
    #[arg(long, default_value = "phone")]
    device_name: String,

    /// New device is a desktop rather than a mobile
    #[arg(long)]
    desktop: bool,

    /// Phrase typed on the provisioner (five words)
    #[arg(long)]
    phrase: Option<String>,

    /// Phrase typed on the provisionee, if different
    #[arg(long)]
    provisionee_phrase: Option<String>,

    /// Log2 of the scrypt cost parameter
    #[arg(long, default_value_t = KdfParams::default().log_n)]
    kdf_log_n: u8,

    /// Seed for keys and device ids
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Budget for each side of the attempt
    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn split(phrase: &str) -> Vec<&str> {
    phrase.split_whitespace().collect()
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let kind = if args.desktop { DeviceType::Desktop } else { DeviceType::Mobile };
    let phrase = args.phrase.as_deref().map_or_else(|| DEFAULT_PHRASE.to_vec(), split);

    let mut scenario = PairingScenario::new(args.identity.clone())
        .phrase(&phrase)
        .kdf(KdfParams { log_n: args.kdf_log_n, ..KdfParams::default() })
        .seed(args.seed)
        .timeout(Duration::from_secs(args.timeout_secs))
        .device(kind, args.device_name.clone());
    if let Some(other) = args.provisionee_phrase.as_deref() {
        scenario = scenario.provisionee_phrase(&split(other));
    }

    tracing::info!(identity = %args.identity, device = %args.device_name, "pairing");
    let outcome = scenario.run().await;

    if let Err(violations) = InvariantRegistry::standard().check_all(&outcome.snapshot()) {
        for violation in violations {
            tracing::error!(%violation, "invariant violated");
        }
        return ExitCode::FAILURE;
    }

    match (&outcome.provisioner, &outcome.provisionee) {
        (Ok(kid), Ok(identity)) => {
            tracing::info!(
                delegated = %kid,
                sibkeys = identity.sibkeys.len(),
                chain_len = identity.chain_len,
                "pairing succeeded"
            );
            ExitCode::SUCCESS
        },
        (provisioner, provisionee) => {
            if let Err(err) = provisioner {
                tracing::error!(error = %err, "provisioner failed");
            }
            if let Err(err) = provisionee {
                tracing::error!(error = %err, "provisionee failed");
            }
            ExitCode::FAILURE
        },
    }
}
