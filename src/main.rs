use std::collections::BTreeSet;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use keyfleet::{
    ca::{CaFactory, CertRole, TrustBundle},
    config::AppConfig,
    escrow::{self, EscrowIdentity, EscrowService},
    keystore::{KeyStore, OperatorKey, ProjectKeyPair, RecipientKey},
    persist::write_atomic,
    unlock::{
        BootReference, CryptsetupVolume, EscrowEndpoint, HardwareModule, HttpEscrowClient,
        ProvisionPlan, SoftwareModule, UnlockBinding, UnlockCoordinator,
    },
    vault::SecretVault,
    TrustError,
};
use keyfleet_types::BundleUpdate;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use zeroize::Zeroizing;

#[derive(Parser)]
#[command(name = "keyfleet")]
#[command(about = "Project CA, sealed secrets and unattended disk unlock")]
#[command(version)]
struct Cli {
    /// Extra configuration file, applied after config/default and config/local
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an escrow endpoint
    ServeEscrow,
    /// Fetch key shares, reconstruct the disk key and unlock the volume
    BootUnlock,
    /// Generate a key
    Keygen {
        #[arg(value_enum)]
        kind: KeyKind,
        /// Where to write the private key
        #[arg(long)]
        out: PathBuf,
    },
    /// Manage the authorized recipient set
    Recipient {
        #[command(subcommand)]
        command: RecipientCommand,
    },
    /// Seal and unseal project secrets
    Secret {
        #[command(subcommand)]
        command: SecretCommand,
    },
    /// Project certificate authority
    Ca {
        #[command(subcommand)]
        command: CaCommand,
    },
    /// Query escrow endpoints for liveness, bundle generation and held shares
    EscrowStatus {
        #[arg(long = "escrow", value_parser = parse_endpoint, required = true)]
        escrows: Vec<EscrowEndpoint>,
    },
    /// Split a disk key across escrow endpoints and prepare the machine's boot files
    Provision {
        machine_id: String,
        /// Shares needed to unlock
        #[arg(long, default_value_t = 2)]
        threshold: u8,
        /// Escrow endpoint as `id,url,server_name` (repeat once per endpoint)
        #[arg(long = "escrow", value_parser = parse_endpoint, required = true)]
        escrows: Vec<EscrowEndpoint>,
        /// File holding the disk encryption key
        #[arg(long)]
        disk_key_file: PathBuf,
        /// Directory receiving the machine's boot files
        #[arg(long)]
        out_dir: PathBuf,
        /// Where those files will live on the machine
        #[arg(long, default_value = "/etc/keyfleet")]
        target_dir: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum KeyKind {
    /// Operator Ed25519 key, passphrase protected
    Operator,
    /// X25519 recipient key (escrow endpoints, devices)
    Recipient,
}

#[derive(Subcommand)]
enum RecipientCommand {
    /// List authorized recipients
    List,
    /// Authorize a recipient key (`x25519:<base64>`)
    Authorize {
        recipient: RecipientKey,
        #[arg(long, default_value = "")]
        comment: String,
    },
}

#[derive(Subcommand)]
enum SecretCommand {
    /// List sealed secrets and their recipient counts
    List,
    /// Seal a file (or stdin) for all authorized recipients
    Seal {
        name: String,
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Write a secret's plaintext to stdout
    Unseal { name: String },
    /// Re-wrap existing secrets for the current recipient set
    Reseal { names: Vec<String> },
}

#[derive(Clone, Copy, ValueEnum)]
enum RoleArg {
    Server,
    Client,
}

impl From<RoleArg> for CertRole {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Server => CertRole::Server,
            RoleArg::Client => CertRole::Client,
        }
    }
}

#[derive(Subcommand)]
enum CaCommand {
    /// Create the root of trust
    Bootstrap {
        #[arg(long)]
        days: Option<i64>,
    },
    /// Issue a leaf certificate and key
    Issue {
        subject: String,
        #[arg(long, value_enum)]
        role: RoleArg,
        #[arg(long)]
        days: Option<i64>,
        #[arg(long)]
        out_dir: PathBuf,
    },
    /// Sign a certificate request
    Sign {
        csr: PathBuf,
        subject: String,
        #[arg(long, value_enum)]
        role: RoleArg,
        #[arg(long)]
        days: Option<i64>,
        #[arg(long)]
        out: PathBuf,
    },
    /// Revoke a certificate by serial
    Revoke {
        serial: u64,
        #[arg(long, default_value = "unspecified")]
        reason: String,
    },
    /// Roll to a new root generation and re-issue tracked leaves
    Rotate {
        #[arg(long)]
        days: Option<i64>,
    },
    /// Show the current anchor and tracked leaves
    Status,
    /// Export the trust bundle
    Bundle {
        #[arg(long)]
        out: PathBuf,
        /// Export for a booting machine, without a revocation staleness bound
        #[arg(long)]
        machine: bool,
    },
    /// Push the current trust bundle to escrow endpoints
    PushBundle {
        #[arg(long = "escrow", value_parser = parse_endpoint, required = true)]
        escrows: Vec<EscrowEndpoint>,
    },
}

fn parse_endpoint(value: &str) -> Result<EscrowEndpoint, String> {
    let parts: Vec<&str> = value.split(',').map(str::trim).collect();
    match parts.as_slice() {
        [id, url, server_name] if !id.is_empty() && !url.is_empty() && !server_name.is_empty() => {
            Ok(EscrowEndpoint {
                id: id.to_string(),
                url: url.to_string(),
                server_name: server_name.to_string(),
            })
        }
        _ => Err("expected `id,url,server_name`".to_string()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command {
        Commands::ServeEscrow => serve_escrow(&config).await,
        Commands::BootUnlock => boot_unlock(&config).await,
        Commands::Keygen { kind, out } => keygen(&config, kind, &out),
        Commands::Recipient { command } => recipient(&config, command),
        Commands::Secret { command } => secret(&config, command),
        Commands::Ca { command } => ca(&config, command).await,
        Commands::EscrowStatus { escrows } => escrow_status(&escrows).await,
        Commands::Provision {
            machine_id,
            threshold,
            escrows,
            disk_key_file,
            out_dir,
            target_dir,
        } => {
            let plan = ProvisionPlan {
                machine_id,
                threshold,
                escrows,
            };
            provision(&config, plan, &disk_key_file, &out_dir, &target_dir).await
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "keyfleet=info,tower_http=info".into());
    let json = std::env::var("KEYFLEET_LOG_JSON")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

/// Operator key, project key and store, loaded for operator commands.
struct OperatorContext {
    operator: OperatorKey,
    keypair: Arc<ProjectKeyPair>,
    store: KeyStore,
    vault: Arc<SecretVault>,
}

impl OperatorContext {
    fn load(config: &AppConfig) -> anyhow::Result<Self> {
        let source = config.operator()?.key.key_source()?;
        let operator = OperatorKey::load(&source)?;
        let store = KeyStore::new(config.vault.project.clone(), config.recipients_path());
        let keypair = Arc::new(store.derive_project_key(&operator)?);
        let vault = Arc::new(SecretVault::open(
            &config.vault.state_dir,
            config.vault.project.clone(),
            config.vault.stack.clone(),
        )?);
        Ok(Self {
            operator,
            keypair,
            store,
            vault,
        })
    }

    /// Authorized recipients plus the project key itself.
    fn recipients(&self) -> anyhow::Result<BTreeSet<RecipientKey>> {
        let mut recipients = match self.store.list_authorized_recipients() {
            Ok(set) => set,
            Err(TrustError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => BTreeSet::new(),
            Err(e) => return Err(e.into()),
        };
        recipients.insert(*self.keypair.recipient());
        Ok(recipients)
    }

    fn ca(&self, config: &AppConfig) -> anyhow::Result<CaFactory> {
        Ok(CaFactory::open(
            Arc::clone(&self.vault),
            Arc::clone(&self.keypair),
            self.recipients()?,
            config.ca.settings(),
        )?)
    }

    fn sign_bundle(&self, bundle: &TrustBundle) -> anyhow::Result<BundleUpdate> {
        let mut update = BundleUpdate {
            bundle: serde_json::to_string(bundle)?,
            issued_at: Utc::now().timestamp(),
            signature: String::new(),
        };
        update.signature = BASE64.encode(self.operator.sign(&update.signing_bytes()).to_bytes());
        Ok(update)
    }
}

async fn serve_escrow(config: &AppConfig) -> anyhow::Result<()> {
    let settings = config.escrow()?;
    let read = |path: &Path| {
        std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
    };

    let identity = EscrowIdentity {
        endpoint_id: settings.endpoint_id.clone(),
        server_cert_pem: read(&settings.server_cert_path)?,
        server_key_pem: Zeroizing::new(read(&settings.server_key_path)?),
        keypair: ProjectKeyPair::load(&settings.recipient_key_path)?,
        operator_public_key: settings.operator_public_key.clone(),
    };
    let vault = SecretVault::open(
        &config.vault.state_dir,
        config.vault.project.clone(),
        config.vault.stack.clone(),
    )?;
    let bundle = TrustBundle::load(&settings.bundle_path)
        .with_context(|| format!("failed to load trust bundle {}", settings.bundle_path.display()))?;

    let service = EscrowService::new(identity, vault, bundle, Some(settings.bundle_path.clone()))?
        .with_clock_skew(settings.clock_skew_secs);
    escrow::serve(Arc::new(service), settings.socket_addr()?).await?;
    Ok(())
}

async fn boot_unlock(config: &AppConfig) -> anyhow::Result<()> {
    let settings = config.boot()?;
    let reference = BootReference::load(&settings.reference_path)?;
    let binding = reference.binding()?;
    let identity = reference.identity()?;
    let bundle = reference.trust_bundle()?;

    let hardware = match &settings.hardware {
        Some(hw) => match SoftwareModule::load(&hw.device_key_path, hw.measured_paths.clone()) {
            Ok(module) => Some(module),
            Err(e) => {
                warn!(error = %e, "Hardware module unavailable, relying on escrow shares");
                None
            }
        },
        None => None,
    };
    let volume = CryptsetupVolume {
        device: settings.device.clone(),
        mapper_name: settings.mapper_name.clone(),
        cryptsetup_path: settings.cryptsetup_path.clone(),
    };

    let transport = Arc::new(HttpEscrowClient::new(settings.request_timeout())?);
    let coordinator = UnlockCoordinator::new(transport)
        .with_endpoint_timeout(settings.endpoint_timeout())
        .with_retry(settings.retry.clone());

    info!(machine = %binding.machine_id, threshold = binding.threshold, "Starting unattended unlock");
    let hardware_ref = hardware.as_ref().map(|m| m as &dyn HardwareModule);
    match coordinator
        .unlock(&binding, &identity, &bundle, hardware_ref, &volume)
        .await
    {
        Ok(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Unattended unlock failed, boot cannot continue");
            Err(e.into())
        }
    }
}

fn keygen(config: &AppConfig, kind: KeyKind, out: &Path) -> anyhow::Result<()> {
    if out.exists() {
        anyhow::bail!("{} already exists", out.display());
    }
    match kind {
        KeyKind::Operator => {
            let passphrase_env = config
                .operator
                .as_ref()
                .and_then(|o| match &o.key {
                    keyfleet::config::OperatorKeyConfig::Encrypted { passphrase_env, .. } => {
                        Some(passphrase_env.clone())
                    }
                    _ => None,
                })
                .unwrap_or_else(|| "KEYFLEET_PASSPHRASE".to_string());
            let passphrase = Zeroizing::new(
                std::env::var(&passphrase_env)
                    .with_context(|| format!("set {} to the key passphrase", passphrase_env))?,
            );

            let key = OperatorKey::generate();
            key.save_encrypted(out, &passphrase)?;
            println!("{}", key.public_key_base64());
        }
        KeyKind::Recipient => {
            let keypair = ProjectKeyPair::generate();
            write_atomic(out, keypair.to_base64().as_bytes())?;
            println!("{}", keypair.recipient());
        }
    }
    info!(path = %out.display(), "Wrote new key");
    Ok(())
}

fn recipient(config: &AppConfig, command: RecipientCommand) -> anyhow::Result<()> {
    let store = KeyStore::new(config.vault.project.clone(), config.recipients_path());
    match command {
        RecipientCommand::List => {
            for recipient in store.list_authorized_recipients()? {
                println!("{}", recipient);
            }
        }
        RecipientCommand::Authorize { recipient, comment } => {
            if !store.authorize(&recipient, &comment)? {
                println!("{} is already authorized", recipient);
            }
        }
    }
    Ok(())
}

fn secret(config: &AppConfig, command: SecretCommand) -> anyhow::Result<()> {
    let ctx = OperatorContext::load(config)?;
    match command {
        SecretCommand::List => {
            for name in ctx.vault.list()? {
                let recipients = ctx.vault.recipients_of(&name)?;
                println!("{}\t{} recipients", name, recipients.len());
            }
        }
        SecretCommand::Seal { name, file } => {
            let plaintext = Zeroizing::new(match file {
                Some(file) => std::fs::read(&file)
                    .with_context(|| format!("failed to read {}", file.display()))?,
                None => {
                    let mut buf = Vec::new();
                    std::io::stdin().read_to_end(&mut buf)?;
                    buf
                }
            });
            let sealed = ctx.vault.seal(&name, &plaintext, &ctx.recipients()?)?;
            println!("{} v{}", sealed.name, sealed.version);
        }
        SecretCommand::Unseal { name } => {
            let plaintext = ctx.vault.unseal_named(&name, &ctx.keypair)?;
            std::io::stdout().write_all(&plaintext)?;
        }
        SecretCommand::Reseal { names } => {
            let recipients = ctx.recipients()?;
            let names = if names.is_empty() { ctx.vault.list()? } else { names };
            for name in names {
                let Some(sealed) = ctx.vault.load(&name)? else {
                    anyhow::bail!("no secret named '{}'", name);
                };
                if sealed.recipient_set() == recipients {
                    continue;
                }
                let resealed = ctx.vault.reseal(&sealed, &ctx.keypair, &recipients)?;
                println!("{} v{}", resealed.name, resealed.version);
            }
        }
    }
    Ok(())
}

fn write_leaf(dir: &Path, certificate_pem: &str, key_pem: Option<&str>) -> anyhow::Result<()> {
    std::fs::create_dir_all(dir)?;
    write_atomic(&dir.join("cert.pem"), certificate_pem.as_bytes())?;
    if let Some(key_pem) = key_pem {
        write_atomic(&dir.join("key.pem"), key_pem.as_bytes())?;
    }
    Ok(())
}

fn days_or(days: Option<i64>, default: chrono::Duration) -> chrono::Duration {
    days.map(chrono::Duration::days).unwrap_or(default)
}

async fn ca(config: &AppConfig, command: CaCommand) -> anyhow::Result<()> {
    let ctx = OperatorContext::load(config)?;
    let ca = ctx.ca(config)?;

    match command {
        CaCommand::Bootstrap { days } => {
            let anchor = ca.bootstrap_root(days_or(days, config.ca.root_validity()))?;
            println!("generation {} valid until {}", anchor.generation, anchor.not_after);
        }
        CaCommand::Issue {
            subject,
            role,
            days,
            out_dir,
        } => {
            let issued = ca.issue_leaf(&subject, role.into(), days_or(days, config.ca.leaf_validity()))?;
            write_leaf(
                &out_dir,
                &issued.certificate.certificate_pem,
                Some(issued.private_key_pem.as_str()),
            )?;
            println!("serial {}", issued.certificate.serial);
        }
        CaCommand::Sign {
            csr,
            subject,
            role,
            days,
            out,
        } => {
            let csr_pem = std::fs::read_to_string(&csr)
                .with_context(|| format!("failed to read {}", csr.display()))?;
            let leaf = ca.sign_request(
                &csr_pem,
                &subject,
                role.into(),
                days_or(days, config.ca.leaf_validity()),
            )?;
            write_atomic(&out, leaf.certificate_pem.as_bytes())?;
            println!("serial {}", leaf.serial);
        }
        CaCommand::Revoke { serial, reason } => {
            ca.revoke(serial, &reason)?;
            println!("revoked {}; push the bundle to escrow endpoints", serial);
        }
        CaCommand::Rotate { days } => {
            let report = ca.rotate(days_or(days, config.ca.root_validity()))?;
            println!(
                "generation {} -> {}, {} leaves re-issued",
                report.previous_generation,
                report.anchor.generation,
                report.reissued.len()
            );
        }
        CaCommand::Status => {
            println!("{:?}", ca.phase());
            if let Some(anchor) = ca.current() {
                println!("root valid {} .. {}", anchor.not_before, anchor.not_after);
            }
            for leaf in ca.tracked_leaves() {
                println!(
                    "{}\t{}\t{}\tuntil {}",
                    leaf.serial, leaf.role, leaf.subject, leaf.not_after
                );
            }
        }
        CaCommand::Bundle { out, machine } => {
            let bundle = if machine {
                ca.machine_bundle()?
            } else {
                ca.trust_bundle()?
            };
            bundle.save(&out)?;
            println!("wrote {}", out.display());
        }
        CaCommand::PushBundle { escrows } => {
            let update = ctx.sign_bundle(&ca.trust_bundle()?)?;
            let client = HttpEscrowClient::new(std::time::Duration::from_secs(10))?;
            let mut failures = 0;
            for endpoint in &escrows {
                match client.push_bundle(endpoint, &update).await {
                    Ok(status) => println!(
                        "{}: generation {}, {} shares held",
                        status.endpoint_id, status.bundle_generation, status.shares_held
                    ),
                    Err(e) => {
                        error!(endpoint = %endpoint.id, error = %e, "Bundle push failed");
                        failures += 1;
                    }
                }
            }
            if failures > 0 {
                anyhow::bail!("{} of {} endpoints did not accept the bundle", failures, escrows.len());
            }
        }
    }
    Ok(())
}

async fn escrow_status(escrows: &[EscrowEndpoint]) -> anyhow::Result<()> {
    let client = HttpEscrowClient::new(std::time::Duration::from_secs(10))?;
    let mut unreachable = 0;
    for endpoint in escrows {
        match client.status(endpoint).await {
            Ok(status) => println!(
                "{}\tgeneration {}\t{} shares held",
                status.endpoint_id, status.bundle_generation, status.shares_held
            ),
            Err(e) => {
                println!("{}\tunavailable: {}", endpoint.id, e);
                unreachable += 1;
            }
        }
    }
    if unreachable > 0 {
        anyhow::bail!("{} of {} endpoints unavailable", unreachable, escrows.len());
    }
    Ok(())
}

async fn provision(
    config: &AppConfig,
    plan: ProvisionPlan,
    disk_key_file: &Path,
    out_dir: &Path,
    target_dir: &Path,
) -> anyhow::Result<()> {
    let ctx = OperatorContext::load(config)?;
    let ca = ctx.ca(config)?;
    let bundle = ca.trust_bundle()?;
    let machine_bundle = ca.machine_bundle()?;
    let disk_key = Zeroizing::new(
        std::fs::read(disk_key_file)
            .with_context(|| format!("failed to read {}", disk_key_file.display()))?,
    );

    let client = ca.issue_leaf(&plan.machine_id, CertRole::Client, config.ca.leaf_validity())?;

    let transport = Arc::new(HttpEscrowClient::new(std::time::Duration::from_secs(10))?);
    let binding = UnlockCoordinator::new(transport)
        .provision(&ctx.vault, &ctx.operator, &bundle, &plan, &disk_key, None)
        .await?;
    let record = ctx
        .vault
        .get_public::<UnlockBinding>(&UnlockBinding::record_name(&binding.machine_id))?
        .context("binding record missing after provisioning")?;

    std::fs::create_dir_all(out_dir)?;
    write_atomic(&out_dir.join("binding.json"), &serde_json::to_vec_pretty(&record)?)?;
    write_atomic(&out_dir.join("client.pem"), client.certificate.certificate_pem.as_bytes())?;
    write_atomic(&out_dir.join("client.key"), client.private_key_pem.as_bytes())?;
    machine_bundle.save(&out_dir.join("bundle.json"))?;

    let reference = BootReference::for_binding(
        &binding,
        target_dir.join("binding.json"),
        target_dir.join("client.pem"),
        target_dir.join("client.key"),
        target_dir.join("bundle.json"),
    );
    reference.save(&out_dir.join("boot.json"))?;

    println!(
        "{}: {}-of-{} shares placed, boot files in {}",
        binding.machine_id,
        binding.threshold,
        binding.total,
        out_dir.display()
    );
    Ok(())
}
