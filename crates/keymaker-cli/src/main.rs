use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use base64::{engine::general_purpose, Engine as _};
use clap::{Parser, Subcommand};
use keymaker_core::paths::settings_path;
use keymaker_core::{
    Keymaker, KeymakerSettings, KeyringStore, Locked, MainKey, PinProtection, ProtectorKind,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "keymaker")]
#[command(author, version, about = "Main-key custody over the OS keyring", long_about = None)]
struct Cli {
    /// Settings file (defaults to the per-user config dir)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show active protectors
    Status,

    /// Check that the main key can be unlocked
    Unlock,

    /// Protect the main key with a PIN
    SetPin,

    /// Remove PIN protection
    RemovePin,

    /// Delete every persisted copy of the main key
    Wipe {
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },

    /// Encrypt a string with the main key, printing base64
    Seal { value: String },

    /// Decrypt base64 produced by `seal`
    Open { sealed: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let settings_file = cli
        .settings
        .or_else(settings_path)
        .ok_or_else(|| anyhow!("no settings location available"))?;
    let settings = KeymakerSettings::load(&settings_file)
        .with_context(|| format!("loading {}", settings_file.display()))?;

    let store = Arc::new(KeyringStore::new(settings.service_name.clone()));
    let (keymaker, _autolocker) = Keymaker::from_settings(store, &settings)?;

    match cli.command {
        Commands::Status => status(&keymaker),
        Commands::Unlock => {
            unlock(&keymaker, &settings).await?;
            println!("unlocked");
            Ok(())
        }
        Commands::SetPin => set_pin(&keymaker, &settings).await,
        Commands::RemovePin => remove_pin(&keymaker, &settings).await,
        Commands::Wipe { yes } => wipe(&keymaker, yes).await,
        Commands::Seal { value } => {
            let key = unlock(&keymaker, &settings).await?;
            let locked = Locked::<String>::seal(&value, key.as_bytes())?;
            println!("{}", general_purpose::STANDARD.encode(locked.encrypted_value()));
            Ok(())
        }
        Commands::Open { sealed } => {
            let key = unlock(&keymaker, &settings).await?;
            let bytes = general_purpose::STANDARD
                .decode(sealed.trim())
                .context("sealed value is not base64")?;
            let clear = Locked::<String>::from_encrypted(bytes).open(key.as_bytes())?;
            println!("{clear}");
            Ok(())
        }
    }
}

fn status(keymaker: &Keymaker) -> Result<()> {
    let active = keymaker.active_protectors();
    if active.is_empty() {
        println!("no main key persisted");
        return Ok(());
    }
    for kind in active {
        println!("active: {kind}");
    }
    Ok(())
}

fn prompt_pin(prompt: &str) -> Result<String> {
    let pin = rpassword::prompt_password(prompt)?;
    if pin.is_empty() {
        bail!("PIN must not be empty");
    }
    Ok(pin)
}

fn pin_protection(settings: &KeymakerSettings, pin: String) -> PinProtection {
    PinProtection::with_params(pin, settings.pin_kdf)
}

async fn unlock(keymaker: &Keymaker, settings: &KeymakerSettings) -> Result<MainKey> {
    if let Some(key) = keymaker.main_key() {
        return Ok(key);
    }
    if !keymaker.is_protector_active(ProtectorKind::Pin) {
        bail!("main key is guarded by a protector this tool cannot drive");
    }
    let pin = prompt_pin("PIN: ")?;
    keymaker
        .obtain_main_key(pin_protection(settings, pin))
        .await
        .ok_or_else(|| anyhow!("wrong PIN"))
}

async fn set_pin(keymaker: &Keymaker, settings: &KeymakerSettings) -> Result<()> {
    unlock(keymaker, settings).await?;
    let pin = prompt_pin("New PIN: ")?;
    let confirm = prompt_pin("Repeat PIN: ")?;
    if pin != confirm {
        bail!("PINs do not match");
    }
    if !keymaker.activate(pin_protection(settings, pin)).await {
        bail!("could not enable PIN protection");
    }
    info!("PIN protection enabled");
    Ok(())
}

async fn remove_pin(keymaker: &Keymaker, settings: &KeymakerSettings) -> Result<()> {
    if !keymaker.is_protector_active(ProtectorKind::Pin) {
        println!("PIN protection is not enabled");
        return Ok(());
    }
    unlock(keymaker, settings).await?;
    // Deactivation only clears the slot; the PIN itself is not consulted.
    if !keymaker
        .deactivate(pin_protection(settings, String::new()))
        .await
    {
        bail!("could not remove PIN protection");
    }
    info!("PIN protection removed");
    Ok(())
}

async fn wipe(keymaker: &Keymaker, yes: bool) -> Result<()> {
    if !yes {
        print!("Type 'wipe' to delete the main key: ");
        io::stdout().flush()?;
        let mut answer = String::new();
        io::stdin().read_line(&mut answer)?;
        if answer.trim() != "wipe" {
            bail!("aborted");
        }
    }
    keymaker.wipe_main_key().await;
    println!("main key wiped");
    Ok(())
}
