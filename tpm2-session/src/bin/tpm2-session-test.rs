// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Smoke tests for the TPM session engine.
//!
//! Runs against `/dev/tpmrm0` (or `TPM2TOOLS_TCTI`) by default, or against the
//! in-process software TPM with `--sim`.

use std::io::Read;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fs_err as fs;
use serde::Serialize;
use tpm2_session::{
    AuthDescriptor, Config, CredentialBlob, DigestSource, PolicyStep, SessionParams, SoftTpm,
    TpmAlgId, TpmContext, TpmSe, TpmaSession, TpmlPcrSelection, Transport,
};
use tracing::info;

/// TPM session engine smoke tests
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Use the in-process software TPM
    #[arg(long)]
    sim: bool,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Digest a file (or stdin) on the TPM
    Hash(HashArgs),
    /// HMAC a file (or stdin) with a loaded keyed-hash key
    Hmac(HmacArgs),
    /// Compute a PolicyPCR digest in a trial session
    PolicyPcr(PolicyPcrArgs),
    /// Start, inspect and close one session of each type
    Sessions,
    /// Decode a MakeCredential output file
    Credential(CredentialArgs),
}

#[derive(Parser)]
struct HashArgs {
    /// Hash algorithm
    #[arg(short = 'g', long, default_value = "sha256")]
    alg: String,

    /// Input file; stdin when omitted
    input: Option<PathBuf>,
}

#[derive(Parser)]
struct HmacArgs {
    /// Key handle or context file; a demo key is loaded with --sim
    #[arg(short = 'c', long)]
    key: Option<String>,

    /// Key authorization descriptor
    #[arg(short = 'p', long, default_value = "")]
    auth: String,

    /// Input file; stdin when omitted
    input: Option<PathBuf>,
}

#[derive(Parser)]
struct PolicyPcrArgs {
    /// PCR selection, e.g. `sha256:0,2-4`
    #[arg(short = 'l', long)]
    pcrs: String,

    /// Policy digest algorithm
    #[arg(short = 'g', long, default_value = "sha256")]
    alg: String,
}

#[derive(Parser)]
struct CredentialArgs {
    /// Credential file (magic, version, credential, secret)
    file: PathBuf,
}

#[derive(Serialize)]
struct DigestReport {
    digest: String,
    ticket: bool,
}

#[derive(Serialize)]
struct SessionReport {
    session_type: String,
    handle: String,
    attributes: String,
}

fn hash_alg(name: &str) -> Result<TpmAlgId> {
    TpmAlgId::from_hash_name(name).with_context(|| format!("unknown hash algorithm {name:?}"))
}

fn open_input(input: Option<&PathBuf>) -> Result<(Box<dyn Read>, Option<u64>)> {
    match input {
        Some(path) => {
            let size = fs::metadata(path)?.len();
            let file = fs::File::open(path)?;
            Ok((Box::new(file), Some(size)))
        }
        None => Ok((Box::new(std::io::stdin()), None)),
    }
}

fn print_json<S: Serialize>(value: &S) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn cmd_hash<T: Transport>(ctx: &mut TpmContext<T>, args: HashArgs) -> Result<()> {
    let alg = hash_alg(&args.alg)?;
    let (mut input, size) = open_input(args.input.as_ref())?;
    let output = ctx
        .digest_reader(DigestSource::Hash(alg), &mut input, size)
        .context("failed to digest input")?;
    print_json(&DigestReport {
        digest: hex::encode(&output.digest),
        ticket: output.validation.is_some(),
    })
}

fn cmd_hmac<T: Transport>(
    ctx: &mut TpmContext<T>,
    args: HmacArgs,
    sim_key: Option<u32>,
) -> Result<()> {
    let target = match (&args.key, sim_key) {
        (Some(target), _) => target.clone(),
        (None, Some(handle)) => format!("0x{handle:08x}"),
        (None, None) => anyhow::bail!("--key is required without --sim"),
    };
    let key = ctx
        .load_object_with_auth(&target, &args.auth)
        .with_context(|| format!("failed to load key {target}"))?;
    let (mut input, size) = open_input(args.input.as_ref())?;
    let mac = ctx.hmac_input(&key, &mut input, size);
    ctx.close_object(key).context("failed to release key")?;
    print_json(&DigestReport {
        digest: hex::encode(mac.context("failed to HMAC input")?),
        ticket: false,
    })
}

fn cmd_policy_pcr<T: Transport>(ctx: &mut TpmContext<T>, args: PolicyPcrArgs) -> Result<()> {
    let alg = hash_alg(&args.alg)?;
    let descriptor = format!("pcr:{}", args.pcrs);
    let AuthDescriptor::Pcr { bank, pcrs, .. } = descriptor.parse::<AuthDescriptor>()? else {
        anyhow::bail!("bad PCR selection {:?}", args.pcrs);
    };
    let steps = [PolicyStep::Pcr {
        pcr_digest: Vec::new(),
        selection: TpmlPcrSelection::single(bank, &pcrs),
    }];
    let digest = ctx
        .trial_policy_digest(alg, &steps)
        .context("trial session failed")?;
    info!("PolicyPCR over {} PCRs", pcrs.len());
    println!("{digest}");
    Ok(())
}

fn cmd_sessions<T: Transport>(ctx: &mut TpmContext<T>) -> Result<()> {
    let hash = ctx.config().session_hash;
    let mut reports = Vec::new();
    for session_type in [TpmSe::Hmac, TpmSe::Policy, TpmSe::Trial] {
        let session = ctx
            .start_auth_session(&SessionParams::new(session_type, hash))
            .with_context(|| format!("failed to start {session_type:?} session"))?;
        let mask = TpmaSession(TpmaSession::CONTINUE_SESSION);
        ctx.set_session_attributes(session, TpmaSession::new().with_continue_session(), mask)?;
        reports.push(SessionReport {
            session_type: format!("{session_type:?}"),
            handle: format!("0x{:08x}", ctx.session_handle(session)?),
            attributes: format!("{:?}", ctx.get_session_attributes(session)?),
        });
        ctx.close_session(session)?;
    }
    info!("{} sessions left open", ctx.open_session_count());
    print_json(&reports)
}

fn cmd_credential(args: &CredentialArgs) -> Result<()> {
    let blob = CredentialBlob::load(&args.file)
        .with_context(|| format!("failed to read {}", args.file.display()))?;
    print_json(&blob)
}

fn run<T: Transport>(
    mut ctx: TpmContext<T>,
    command: Commands,
    sim_key: Option<u32>,
) -> Result<()> {
    match command {
        Commands::Hash(args) => cmd_hash(&mut ctx, args),
        Commands::Hmac(args) => cmd_hmac(&mut ctx, args, sim_key),
        Commands::PolicyPcr(args) => cmd_policy_pcr(&mut ctx, args),
        Commands::Sessions => cmd_sessions(&mut ctx),
        Commands::Credential(args) => cmd_credential(&args),
    }
}

fn main() -> Result<()> {
    {
        use tracing_subscriber::{fmt, EnvFilter};
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        fmt().with_env_filter(filter).init();
    }

    let cli = Cli::parse();
    if let Commands::Credential(args) = &cli.command {
        return cmd_credential(args);
    }
    let config = Config::from_env().context("invalid configuration")?;

    if cli.sim {
        let mut tpm = SoftTpm::new();
        let key = tpm.add_hmac_key(b"tpm2-session demo key", b"");
        info!("using the software TPM");
        run(TpmContext::new(tpm, config), cli.command, Some(key))
    } else {
        let ctx = TpmContext::open(config).context("failed to open TPM device")?;
        info!("opened {}", ctx.device_path());
        run(ctx, cli.command, None)
    }
}
