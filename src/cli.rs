use clap::{Parser, Subcommand};

/// PinPay: PIN rendezvous and sponsored relay for ERC-3009 payments
#[derive(Parser)]
#[command(name = "pinpay", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP server and the expiry job
    Serve {
        /// Port to bind (overrides PINPAY_PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Run one expiry pass and exit
    Sweep {
        /// Maximum requests to expire
        #[arg(long, default_value = "500")]
        limit: usize,
    },

    /// Apply database migrations and exit
    Migrate,

    /// Operate on payment requests
    Request {
        #[command(subcommand)]
        command: RequestCommands,
    },
}

#[derive(Subcommand)]
pub enum RequestCommands {
    /// Create a pending request and print its PIN
    Create {
        /// Address receiving the funds
        #[arg(long)]
        payee: String,
        /// Amount in token base units
        #[arg(long)]
        amount: String,
        /// Seconds from now until the authorization stops being valid
        #[arg(long, default_value = "300")]
        valid_for: i64,
        /// Unix time before which the authorization is not yet valid
        #[arg(long, default_value = "0")]
        valid_after: i64,
    },
    /// Print a request by id or PIN
    Show {
        #[arg(long, conflicts_with = "pin", required_unless_present = "pin")]
        id: Option<String>,
        #[arg(long)]
        pin: Option<String>,
    },
    /// Relay a signed request
    Submit {
        #[arg(long)]
        id: String,
    },
}
