//! buildmesh key generation tool.
//!
//! Generates the deployment-wide application key and per-peer identities.
//!
//! # Usage
//!
//! ```bash
//! # Generate both (human-readable output)
//! buildmesh-keygen
//!
//! # Write an identity file for a worker
//! buildmesh-keygen identity --out ~/.buildmesh/identity.key
//!
//! # Generate both (JSON output)
//! buildmesh-keygen --json
//! ```

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use buildmesh_core::{AppKey, KeyPair};
use clap::{Parser, ValueEnum};
use serde::Serialize;

/// buildmesh key generation tool.
#[derive(Parser, Debug)]
#[command(name = "buildmesh-keygen")]
#[command(about = "Generate application keys and peer identities for buildmesh")]
#[command(version)]
struct Cli {
    /// What to generate.
    #[arg(value_enum, default_value_t = Kind::Both)]
    kind: Kind,

    /// Output in JSON format for machine parsing.
    #[arg(long)]
    json: bool,

    /// Write the key to this file instead of printing it (app-key or identity only).
    #[arg(long)]
    out: Option<PathBuf>,

    /// Overwrite an existing --out file.
    #[arg(long)]
    force: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    /// A shared application key.
    AppKey,
    /// A peer identity.
    Identity,
    /// One of each.
    Both,
}

/// JSON output format.
#[derive(Serialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct KeysJson {
    /// Application key, URL-safe base64.
    #[serde(skip_serializing_if = "Option::is_none")]
    app_key: Option<String>,
    /// Identity secret, URL-safe base64 of the 64-byte expanded key.
    #[serde(skip_serializing_if = "Option::is_none")]
    identity: Option<String>,
    /// Identity public key; also the peer's brokerage file name.
    #[serde(skip_serializing_if = "Option::is_none")]
    public_key: Option<String>,
}

fn generate(kind: Kind) -> KeysJson {
    let mut keys = KeysJson::default();
    if matches!(kind, Kind::AppKey | Kind::Both) {
        keys.app_key = Some(AppKey::generate().to_base64());
    }
    if matches!(kind, Kind::Identity | Kind::Both) {
        let identity = KeyPair::generate();
        keys.identity = Some(identity.to_base64());
        keys.public_key = Some(identity.public_key().to_base64());
    }
    keys
}

fn write_key(path: &Path, text: &str, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        bail!("{} already exists; pass --force to overwrite", path.display());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    std::fs::write(path, format!("{}\n", text)).with_context(|| format!("writing {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let keys = generate(cli.kind);

    if let Some(path) = &cli.out {
        let secret = match cli.kind {
            Kind::AppKey => keys.app_key.as_deref(),
            Kind::Identity => keys.identity.as_deref(),
            Kind::Both => bail!("--out needs a single key kind (app-key or identity)"),
        };
        let Some(secret) = secret else {
            bail!("nothing generated");
        };
        write_key(path, secret, cli.force)?;
        if let Some(public_key) = &keys.public_key {
            println!("{}", public_key);
        }
        return Ok(());
    }

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&keys)?);
        return Ok(());
    }

    println!("=== buildmesh keys ===");
    println!();
    if let Some(app_key) = &keys.app_key {
        println!("Application Key: {}", app_key);
    }
    if let (Some(identity), Some(public_key)) = (&keys.identity, &keys.public_key) {
        println!("Identity:        {}", identity);
        println!("Public Key:      {}", public_key);
    }
    println!();
    println!("IMPORTANT: Every peer of a deployment needs the same application key.");
    println!("           Keep identities private; each peer should have its own.");
    Ok(())
}
