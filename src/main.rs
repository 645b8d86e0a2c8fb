use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use castforge::cast::interactive::spawn_printer;
use castforge::cast::{Server, ServerConf};
use castforge::cert::{self, length_search};
use castforge::config::CastforgeConfig;
use castforge::patch;

#[derive(Parser)]
#[command(
    name = "castforge",
    about = "Chromecast root-CA trust substitution: certificate factory, binary patcher, and Cast v2 receiver",
    version,
    long_about = None
)]
struct Cli {
    /// Directory holding (or to receive) ca.crt / ca.key
    #[arg(long, global = true, default_value = ".")]
    cert_dir: PathBuf,

    /// Increase log verbosity (debug level)
    #[arg(long, global = true)]
    verbose: bool,

    /// Decrease log verbosity (errors only)
    #[arg(long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ensure ca.crt/ca.key exist (generating a length-matched replacement
    /// root if not), then splice that root into a shared library under <dir>
    Patch {
        /// Directory to search for a patchable shared library
        dir: PathBuf,

        /// PEM or DER file containing the root certificate currently
        /// embedded in the target library
        #[arg(long)]
        original_root: PathBuf,
    },

    /// Restore a shared library under <dir> from its .bak backup
    Unpatch {
        /// Directory to search for a .bak backup
        dir: PathBuf,

        /// PEM or DER file containing the root certificate that was
        /// originally embedded (used to locate the matching backup)
        #[arg(long)]
        original_root: PathBuf,
    },

    /// Load ca.crt/ca.key and run the Cast v2 receiver
    Serve {
        /// `host:port` to bind; overrides the config file default
        #[arg(long)]
        listen: Option<String>,

        /// Skip mDNS advertisement
        #[arg(long)]
        no_advertise: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose && cli.quiet {
        bail!("--verbose and --quiet are mutually exclusive");
    }
    init_tracing(cli.verbose, cli.quiet);

    let result = match cli.command {
        Commands::Patch { dir, original_root } => run_patch(&cli.cert_dir, &dir, &original_root).await,
        Commands::Unpatch { dir, original_root } => run_unpatch(&dir, &original_root).await,
        Commands::Serve { listen, no_advertise } => run_serve(&cli.cert_dir, listen, no_advertise).await,
    };

    if let Err(e) = &result {
        tracing::error!(error = %e, "castforge failed");
    }
    result
}

fn init_tracing(verbose: bool, quiet: bool) {
    let level = if verbose {
        "debug"
    } else if quiet {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .init();
}

fn read_root_der(path: &Path) -> Result<Vec<u8>> {
    let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    if let Ok(text) = std::str::from_utf8(&bytes) {
        if let Ok(parsed) = pem::parse(text) {
            return Ok(parsed.into_contents());
        }
    }
    Ok(bytes)
}

async fn run_patch(cert_dir: &Path, target_dir: &Path, original_root_path: &Path) -> Result<()> {
    let cert_path = cert_dir.join("ca.crt");
    let key_path = cert_dir.join("ca.key");
    let original_root_der = read_root_der(original_root_path)?;

    let replacement = if cert_path.exists() && key_path.exists() {
        info!(dir = %cert_dir.display(), "using existing ca.crt/ca.key");
        let (cert_der, private_key) = cert::load_from_files(&cert_path, &key_path)?;
        if cert_der.len() != original_root_der.len() {
            bail!(
                "existing ca.crt is {} bytes, but the target library's root is {} bytes -- regenerate or supply a matching pair",
                cert_der.len(),
                original_root_der.len()
            );
        }
        let _ = private_key;
        cert_der
    } else {
        info!(
            target_len = original_root_der.len(),
            "generating a length-matched replacement root CA"
        );
        std::fs::create_dir_all(cert_dir)
            .with_context(|| format!("failed to create {}", cert_dir.display()))?;
        let kp = length_search::generate_replacement_root_ca(original_root_der.len(), None, None)
            .context("length-targeted root generation failed")?;
        kp.persist_to_files(&cert_path, &key_path)?;
        kp.cert_der().to_vec()
    };

    let mut handle = patch::locate_for_patch(target_dir, &original_root_der)
        .context("failed to locate a patchable shared library")?;
    handle.patch(&replacement)?;

    println!("patched {}", handle.path().display());
    Ok(())
}

async fn run_unpatch(target_dir: &Path, original_root_path: &Path) -> Result<()> {
    let original_root_der = read_root_der(original_root_path)?;
    let handle = patch::locate_for_unpatch(target_dir, &original_root_der)
        .context("failed to locate a backup to restore")?;
    let path = handle.path().to_path_buf();
    handle.unpatch()?;

    println!("restored {}", path.display());
    Ok(())
}

async fn run_serve(cert_dir: &Path, listen_override: Option<String>, no_advertise: bool) -> Result<()> {
    let config = CastforgeConfig::load_or_default();

    let cert_path = cert_dir.join("ca.crt");
    let key_path = cert_dir.join("ca.key");
    let (cert_der, private_key) = cert::load_from_files(&cert_path, &key_path)
        .with_context(|| format!("failed to load ca.crt/ca.key from {}", cert_dir.display()))?;

    let root = cert::KeyPair::from_parts(private_key, cert_der, true);

    let (events, printer_handle) = spawn_printer(std::io::stdout());

    let conf = ServerConf {
        root: Some(root),
        listen_address: listen_override.unwrap_or(config.network.listen_address),
        txt_overrides: config.network.txt_overrides,
        advertise: !no_advertise,
        events: Some(events),
        ..ServerConf::default()
    };

    let mut server = Server::listen(conf).await.context("failed to start Cast receiver")?;
    info!(addr = %server.local_addr(), "serving");

    let run_result = server.run().await;
    server.close()?;
    drop(printer_handle);

    run_result.map_err(Into::into)
}
