//! Identity key generation for the authenticated transport.
//!
//! Writes a 32-byte secp256k1 secret (hex) and prints the compressed
//! public key in the format the `known-peers` and `authorized-peers`
//! files expect, plus the Base58Check identity address.
//!
//! Usage:
//!   cargo run --bin keygen -- --output ./identity.key

use clap::Parser;
use rcoin::crypto::{Identity, identity_address};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "keygen", version, about = "rcoin identity key generator")]
struct Args {
    /// Secret key output file (hex, 32 bytes)
    #[arg(short, long, default_value = "identity.key")]
    output: PathBuf,

    /// Hostname to print a ready-made known-peers line for
    #[arg(long)]
    host: Option<String>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let identity = Identity::generate();
    let pubkey = identity.public_key();

    std::fs::write(&args.output, hex::encode(identity.secret_bytes()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(&args.output)?.permissions();
        perms.set_mode(0o600);
        std::fs::set_permissions(&args.output, perms)?;
    }

    println!("secret key written to {}", args.output.display());
    println!("public key:       {}", hex::encode(pubkey));
    println!("identity address: {}", identity_address(&pubkey));
    if let Some(host) = args.host {
        println!("known-peers line: {} {}", host, hex::encode(pubkey));
    }
    Ok(())
}
