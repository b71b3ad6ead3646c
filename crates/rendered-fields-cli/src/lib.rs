//! Embedded rendered-snapshot command surface.
//!
//! Hosts that execute work units can drive snapshots through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_snapshot_with_db`] for direct [`SnapshotCommand`] execution against a DB path.
//! - [`run_snapshot`] for execution against an existing [`SqliteSnapshotStore`].
//!
//! Every command prints a single JSON document on stdout. Lookups of absent
//! snapshots print `null` and succeed.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use rendered_fields_core::{
    fields_from_json, fields_to_json, format_rfc3339, AttributeObject, EnvVariables,
    ExpressionTemplateEngine, RenderContext, RenderedFields, RenderedSnapshot, RunIdentity,
    RunKey, SecretsMasker, SnapshotError, SnapshotRecorder, SnapshotSettings, SnapshotStore,
};
use rendered_fields_store_sqlite::SqliteSnapshotStore;
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub const SNAPSHOT_CONTRACT_VERSION: &str = "rendered_snapshot.v1";
pub const CAPTURE_CONTRACT_VERSION: &str = "capture_report.v1";
pub const PRUNE_CONTRACT_VERSION: &str = "prune_report.v1";
pub const DELETE_CONTRACT_VERSION: &str = "delete_report.v1";

#[derive(Debug, Parser)]
#[command(name = "rfs")]
#[command(about = "Rendered field snapshot CLI")]
pub struct Cli {
    #[arg(long, default_value = "./rendered_fields.sqlite3")]
    db: PathBuf,

    /// JSON settings file; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Snapshot {
        #[command(subcommand)]
        command: Box<SnapshotCommand>,
    },
}

#[derive(Debug, Subcommand)]
pub enum SnapshotCommand {
    /// Render, redact and store the template fields of an owner.
    Capture(CaptureArgs),
    Show(IdentityArgs),
    Fields(IdentityArgs),
    PodSpec(IdentityArgs),
    List(ListArgs),
    Prune(PruneArgs),
    Delete(IdentityArgs),
}

#[derive(Debug, Args)]
pub struct IdentityArgs {
    #[arg(long)]
    workflow_id: String,
    #[arg(long)]
    task_id: String,
    #[arg(long, conflicts_with = "logical_date", required_unless_present = "logical_date")]
    run_id: Option<String>,
    /// RFC3339 logical date; stored canonicalised to UTC.
    #[arg(long)]
    logical_date: Option<String>,
    #[arg(long)]
    map_index: Option<u32>,
}

#[derive(Debug, Args)]
pub struct CaptureArgs {
    #[command(flatten)]
    identity: IdentityArgs,
    /// Owner descriptor `{"kind", "template_fields", "attributes"}`, inline or `@path`.
    #[arg(long)]
    owner_json: String,
    #[arg(long, default_value = "{}")]
    context_json: String,
    /// Variables for `{{ var.value.NAME }}`; `RFS_VAR_<NAME>` is consulted next.
    #[arg(long, default_value = "{}")]
    variables_json: String,
    #[arg(long)]
    pod_spec_json: Option<String>,
    #[arg(long)]
    no_prune: bool,
}

#[derive(Debug, Args)]
pub struct ListArgs {
    #[arg(long)]
    workflow_id: String,
    #[arg(long)]
    task_id: Option<String>,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Args)]
pub struct PruneArgs {
    #[arg(long)]
    workflow_id: String,
    #[arg(long)]
    task_id: String,
    /// Overrides `max_snapshots_per_task` from settings.
    #[arg(long, allow_hyphen_values = true)]
    keep: Option<i64>,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct SnapshotJsonPayload {
    contract_version: String,
    snapshot_id: String,
    workflow_id: String,
    task_id: String,
    run_key: String,
    map_index: Option<u32>,
    created_at: String,
    rendered_fields: Value,
    pod_spec_snapshot: Option<Value>,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct CaptureJsonPayload {
    contract_version: String,
    pruned: usize,
    snapshot: SnapshotJsonPayload,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct PruneJsonPayload {
    contract_version: String,
    workflow_id: String,
    task_id: String,
    keep: i64,
    deleted: usize,
    remaining: usize,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct DeleteJsonPayload {
    contract_version: String,
    identity: String,
    deleted: bool,
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when settings loading, migration, or command execution
/// fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let settings = load_settings(cli.config.as_deref())?;
    match cli.command {
        Command::Snapshot { command } => run_snapshot_with_db(&cli.db, &settings, *command),
    }
}

/// Executes a parsed snapshot command using the provided `SQLite` DB path.
///
/// # Errors
/// Returns an error when store open/migrate fails or the requested command fails.
pub fn run_snapshot_with_db(
    db_path: &Path,
    settings: &SnapshotSettings,
    command: SnapshotCommand,
) -> Result<()> {
    let mut store = SqliteSnapshotStore::open_and_migrate(db_path)?;
    run_snapshot(command, settings, &mut store)
}

/// Executes a parsed snapshot command against an existing store handle.
///
/// # Errors
/// Returns an error when argument decoding, rendering, redaction, or
/// persistence fails.
pub fn run_snapshot(
    command: SnapshotCommand,
    settings: &SnapshotSettings,
    store: &mut SqliteSnapshotStore,
) -> Result<()> {
    let output = execute_snapshot(command, settings, store)?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn execute_snapshot(
    command: SnapshotCommand,
    settings: &SnapshotSettings,
    store: &mut SqliteSnapshotStore,
) -> Result<Value> {
    match command {
        SnapshotCommand::Capture(args) => {
            let payload = capture(&args, settings, store)?;
            Ok(serde_json::to_value(payload)?)
        }
        SnapshotCommand::Show(args) => {
            let identity = parse_identity(&args)?;
            match store.get_snapshot(&identity)? {
                Some(snapshot) => Ok(serde_json::to_value(build_snapshot_json_payload(&snapshot)?)?),
                None => Ok(Value::Null),
            }
        }
        SnapshotCommand::Fields(args) => {
            let identity = parse_identity(&args)?;
            Ok(store
                .get_rendered_fields(&identity)?
                .map_or(Value::Null, |fields| fields_to_json(&fields)))
        }
        SnapshotCommand::PodSpec(args) => {
            let identity = parse_identity(&args)?;
            Ok(store
                .get_pod_spec_snapshot(&identity)?
                .map_or(Value::Null, |spec| fields_to_json(&spec)))
        }
        SnapshotCommand::List(args) => {
            let snapshots =
                store.list_snapshots(&args.workflow_id, args.task_id.as_deref(), args.limit)?;
            let payloads = snapshots
                .iter()
                .map(build_snapshot_json_payload)
                .collect::<Result<Vec<_>>>()?;
            Ok(serde_json::to_value(payloads)?)
        }
        SnapshotCommand::Prune(args) => {
            let keep = args.keep.unwrap_or(settings.max_snapshots_per_task);
            let deleted = store.prune_old_snapshots(&args.workflow_id, &args.task_id, keep)?;
            let remaining = store.count_snapshots(&args.workflow_id, &args.task_id)?;
            Ok(serde_json::to_value(PruneJsonPayload {
                contract_version: PRUNE_CONTRACT_VERSION.to_string(),
                workflow_id: args.workflow_id,
                task_id: args.task_id,
                keep,
                deleted,
                remaining,
            })?)
        }
        SnapshotCommand::Delete(args) => {
            let identity = parse_identity(&args)?;
            let deleted = store.delete_snapshot(&identity)?;
            Ok(serde_json::to_value(DeleteJsonPayload {
                contract_version: DELETE_CONTRACT_VERSION.to_string(),
                identity: identity.to_string(),
                deleted,
            })?)
        }
    }
}

fn capture(
    args: &CaptureArgs,
    settings: &SnapshotSettings,
    store: &mut SqliteSnapshotStore,
) -> Result<CaptureJsonPayload> {
    let identity = parse_identity(&args.identity)?;
    let owner = AttributeObject::from_json(&read_json_arg(&args.owner_json)?)
        .context("invalid --owner-json")?;
    let context = RenderContext::from_json(read_json_arg(&args.context_json)?)
        .context("invalid --context-json")?;
    let variables = parse_variables(&read_json_arg(&args.variables_json)?)?;
    let pod_spec = match &args.pod_spec_json {
        Some(raw) => Some(fields_from_json(read_json_arg(raw)?).context("invalid --pod-spec-json")?),
        None => None,
    };

    let mut masker = SecretsMasker::from_settings(settings)
        .map_err(|err| anyhow!("invalid redaction settings: {err}"))?;
    let env_variables = EnvVariables::default();
    let env_values = env_variables.variables();
    let registered = masker.register_variables(
        variables
            .iter()
            .chain(env_values.iter())
            .map(|(name, value)| (name.as_str(), value.as_str())),
    );
    tracing::debug!(registered, "registered sensitive variable values");

    let engine = ExpressionTemplateEngine::new((variables, env_variables));
    let effective_settings = if args.no_prune {
        SnapshotSettings {
            max_snapshots_per_task: 0,
            ..settings.clone()
        }
    } else {
        settings.clone()
    };

    let recorder = SnapshotRecorder::new(&engine, &masker, &effective_settings);
    let builder = |_: &RunIdentity| -> Result<Option<RenderedFields>, SnapshotError> {
        Ok(pod_spec.clone())
    };
    let outcome = recorder
        .record(store, &identity, &owner, &context, Some(&builder))
        .with_context(|| format!("failed to capture snapshot for {identity}"))?;

    Ok(CaptureJsonPayload {
        contract_version: CAPTURE_CONTRACT_VERSION.to_string(),
        pruned: outcome.pruned,
        snapshot: build_snapshot_json_payload(&outcome.snapshot)?,
    })
}

/// Loads settings from a JSON file, or defaults when no path is given.
///
/// # Errors
/// Returns an error when the file cannot be read or holds invalid settings.
pub fn load_settings(path: Option<&Path>) -> Result<SnapshotSettings> {
    let Some(path) = path else {
        return Ok(SnapshotSettings::default());
    };

    let body = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read settings file {}", path.display()))?;
    let value: Value = serde_json::from_str(&body)
        .with_context(|| format!("failed to parse settings file {}", path.display()))?;
    SnapshotSettings::from_json(&value)
        .with_context(|| format!("invalid settings in {}", path.display()))
}

fn parse_identity(args: &IdentityArgs) -> Result<RunIdentity> {
    let run_key = match (&args.run_id, &args.logical_date) {
        (Some(run_id), None) => RunKey::new(run_id.clone()),
        (None, Some(raw)) => {
            let logical_date = OffsetDateTime::parse(raw, &Rfc3339)
                .with_context(|| format!("invalid --logical-date {raw}"))?;
            RunKey::from_logical_date(logical_date)?
        }
        _ => return Err(anyhow!("exactly one of --run-id or --logical-date is required")),
    };

    let mut identity = RunIdentity::new(args.workflow_id.clone(), args.task_id.clone(), run_key);
    identity.map_index = args.map_index;
    identity.validate()?;
    Ok(identity)
}

fn read_json_arg(raw: &str) -> Result<Value> {
    if let Some(path) = raw.strip_prefix('@') {
        let body = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read JSON file {path}"))?;
        return serde_json::from_str(&body).with_context(|| format!("invalid JSON in {path}"));
    }
    serde_json::from_str(raw).context("invalid JSON argument")
}

fn parse_variables(value: &Value) -> Result<BTreeMap<String, String>> {
    let Some(map) = value.as_object() else {
        return Err(anyhow!("--variables-json MUST be a JSON object"));
    };

    let mut variables = BTreeMap::new();
    for (name, raw) in map {
        let text = match raw {
            Value::String(text) => text.clone(),
            Value::Number(_) | Value::Bool(_) => raw.to_string(),
            _ => return Err(anyhow!("variable {name} MUST be a string, number, or bool")),
        };
        variables.insert(name.clone(), text);
    }
    Ok(variables)
}

fn build_snapshot_json_payload(snapshot: &RenderedSnapshot) -> Result<SnapshotJsonPayload> {
    Ok(SnapshotJsonPayload {
        contract_version: SNAPSHOT_CONTRACT_VERSION.to_string(),
        snapshot_id: snapshot.snapshot_id.to_string(),
        workflow_id: snapshot.identity.workflow_id.clone(),
        task_id: snapshot.identity.task_id.clone(),
        run_key: snapshot.identity.run_key.to_string(),
        map_index: snapshot.identity.map_index,
        created_at: format_rfc3339(snapshot.created_at).map_err(|err| anyhow!(err.to_string()))?,
        rendered_fields: fields_to_json(&snapshot.rendered_fields),
        pod_spec_snapshot: snapshot.pod_spec_snapshot.as_ref().map(fields_to_json),
    })
}
