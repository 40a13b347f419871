//! qe: queryable-encryption write-path tool
//!
//! Commands:
//!   keygen              - generate index/user keys as a TOML key file
//!   tag <key-id> <v>    - show the index tokens and row ids derived for a value
//!   simulate            - run inserts, updates and deletes against an in-memory store
//!   config show         - display the effective configuration

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;
use uuid::Uuid;

use qe_core::config::{QueryConfig, QueryType};
use qe_core::{
    Document, EncryptedField, EncryptedFieldConfig, QeConfig, UpdateModifier, UpdateOperator,
    Value, ValueType,
};
use qe_crud::{
    process_delete, process_insert, process_update, DeleteOpEntry, DeleteRequest, MemoryStore,
    QueryInterface, UpdateOpEntry, UpdateRequest,
};
use qe_crypto::keys::{KeyFile, KeyFileEntry};
use qe_crypto::{
    collect_insert_payloads, derive_contention_token, transform_modifier, transform_placeholders,
    EncryptionContext, EncryptionInformation, EncryptionPlaceholder, Existence, KeyMaterial,
    KeyVault, MemoryKeyVault, Tombstone,
};

/// Primary collection used by `simulate`
const SIMULATED_COLLECTION: &str = "coll";

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "qe",
    version,
    about = "Queryable-encryption write path",
    long_about = "qe: generate keys, inspect index tokens, and exercise the encrypted write path"
)]
struct Cli {
    /// Path to qe.toml configuration file
    #[arg(long, short = 'c', env = "QE_CONFIG", default_value = "qe.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long, env = "QE_LOG")]
    log: Option<String>,

    /// Log format; overrides the config file
    #[arg(long, env = "QE_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate fresh key material
    Keygen {
        /// Number of keys to generate
        #[arg(long, short = 'n', default_value_t = 1)]
        count: usize,
        /// Write the key file here instead of stdout
        #[arg(long, short = 'o')]
        out: Option<PathBuf>,
        /// Overwrite an existing key file
        #[arg(long)]
        force: bool,
    },

    /// Show the existence and tombstone tokens of a string value
    Tag {
        /// Index key id
        key_id: Uuid,
        /// Plaintext value
        value: String,
        /// Contention slot
        #[arg(long, default_value_t = 0)]
        slot: u64,
        /// Number of existence row ids to list
        #[arg(long, default_value_t = 3)]
        positions: u64,
        /// Key file (overrides config)
        #[arg(long, env = "QE_KEY_FILE")]
        key_file: Option<PathBuf>,
    },

    /// Run a write workload against an in-memory store and report collection sizes
    Simulate {
        /// Documents to insert
        #[arg(long, default_value_t = 10)]
        inserts: u64,
        /// Values to cycle through on insert
        #[arg(long = "value", default_values_t = vec!["secret".to_string()])]
        values: Vec<String>,
        /// Inserted documents to update afterwards (lowest ids first)
        #[arg(long, default_value_t = 0)]
        updates: u64,
        /// Value written by updates
        #[arg(long, default_value = "top secret")]
        update_value: String,
        /// Inserted documents to delete afterwards (highest ids first)
        #[arg(long, default_value_t = 0)]
        deletes: u64,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(&cli.config)?;
    let level = cli.log.clone().unwrap_or_else(|| config.log.level.clone());
    let format = cli.log_format.unwrap_or(match config.log.format.as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    });
    init_logging(&level, format);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "qe starting"
    );
    if !cli.config.exists() {
        tracing::warn!("config file not found: {}  (using defaults)", cli.config.display());
    }

    match cli.command {
        Commands::Keygen { count, out, force } => cmd_keygen(count, out.as_deref(), force),
        Commands::Tag {
            key_id,
            value,
            slot,
            positions,
            key_file,
        } => {
            let vault = load_vault(&config, key_file.as_deref())?
                .context("tag needs a key file (--key-file or encryption.key_file)")?;
            cmd_tag(&vault, key_id, &value, slot, positions)
        }
        Commands::Simulate {
            inserts,
            values,
            updates,
            update_value,
            deletes,
            json,
        } => {
            let workload = Workload {
                inserts,
                values,
                updates,
                update_value,
                deletes,
            };
            let report = cmd_simulate(&config, &workload)?;
            print_report(&report, json)
        }
        Commands::Config { action: ConfigAction::Show } => cmd_config_show(&config, &cli.config),
    }
}

fn load_config(path: &Path) -> Result<QeConfig> {
    QeConfig::load(path).with_context(|| format!("loading config {}", path.display()))
}

fn init_logging(level: &str, format: LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

/// Key vault from `--key-file`, else from the config file, else none.
fn load_vault(config: &QeConfig, override_path: Option<&Path>) -> Result<Option<MemoryKeyVault>> {
    let Some(path) = override_path.or(config.encryption.key_file.as_deref()) else {
        return Ok(None);
    };
    let vault = MemoryKeyVault::load(path).with_context(|| format!("loading key file {}", path.display()))?;
    Ok(Some(vault))
}

// ── `qe keygen` ───────────────────────────────────────────────────────────────

fn render_key_file(count: usize) -> Result<String> {
    let file = KeyFile {
        keys: (0..count)
            .map(|_| KeyFileEntry::new(Uuid::new_v4(), &KeyMaterial::generate()))
            .collect(),
    };
    toml::to_string_pretty(&file).context("serializing key file")
}

fn cmd_keygen(count: usize, out: Option<&Path>, force: bool) -> Result<()> {
    anyhow::ensure!(count > 0, "--count must be at least 1");
    let rendered = render_key_file(count)?;
    match out {
        None => print!("{rendered}"),
        Some(path) => {
            anyhow::ensure!(
                force || !path.exists(),
                "{} already exists (use --force to overwrite)",
                path.display()
            );
            std::fs::write(path, &rendered).with_context(|| format!("writing {}", path.display()))?;
            info!(path = %path.display(), count, "wrote key file");
        }
    }
    Ok(())
}

// ── `qe tag` ──────────────────────────────────────────────────────────────────

fn cmd_tag(vault: &dyn KeyVault, key_id: Uuid, value: &str, slot: u64, positions: u64) -> Result<()> {
    let key = vault.resolve_key(&key_id)?;
    let bytes = Value::from(value).to_canonical_bytes()?;

    let existence = derive_contention_token::<Existence>(&key, &bytes, slot)?.tag()?;
    let tombstone = derive_contention_token::<Tombstone>(&key, &bytes, slot)?.tag()?;

    println!("key:            {key_id}");
    println!("slot:           {slot}");
    println!("existence tag:  {}", STANDARD.encode(existence.as_bytes()));
    println!("tombstone tag:  {}", STANDARD.encode(tombstone.as_bytes()));
    for position in 1..=positions {
        println!("esc row {position:<6} {}", STANDARD.encode(existence.row_id(position)?));
    }
    Ok(())
}

// ── `qe simulate` ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Workload {
    inserts: u64,
    values: Vec<String>,
    updates: u64,
    update_value: String,
    deletes: u64,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
struct CollectionSize {
    collection: String,
    documents: u64,
}

#[derive(Debug, Serialize)]
struct SimulationReport {
    field: String,
    inserted: u64,
    updated: u64,
    deleted: u64,
    reconciled: u64,
    collections: Vec<CollectionSize>,
}

/// The schema to simulate with. An empty schema gets a single indexed
/// string field under a fresh key.
fn simulation_schema(config: &QeConfig) -> EncryptedFieldConfig {
    let mut schema = config.schema.clone();
    if schema.fields.is_empty() {
        schema.fields.push(EncryptedField {
            key_id: Uuid::new_v4(),
            path: "encrypted".into(),
            value_type: ValueType::String,
            queries: Some(QueryConfig {
                query_type: QueryType::Equality,
                contention: 0,
            }),
        });
    }
    schema
}

/// Configured key file, or freshly generated keys for every schema field.
fn simulation_vault(config: &QeConfig, schema: &EncryptedFieldConfig) -> Result<MemoryKeyVault> {
    if let Some(vault) = load_vault(config, None)? {
        return Ok(vault);
    }
    let mut vault = MemoryKeyVault::new();
    for field in &schema.fields {
        vault.insert(field.key_id, KeyMaterial::generate());
    }
    Ok(vault)
}

fn cmd_simulate(config: &QeConfig, workload: &Workload) -> Result<SimulationReport> {
    anyhow::ensure!(!workload.values.is_empty(), "at least one --value is required");
    anyhow::ensure!(
        workload.updates <= workload.inserts && workload.deletes <= workload.inserts,
        "cannot update or delete more documents than were inserted"
    );

    let schema = simulation_schema(config);
    schema.validate()?;
    let field = schema
        .fields
        .iter()
        .find(|f| f.value_type == ValueType::String && f.queries.is_some())
        .context("schema has no indexed string field to simulate with")?
        .clone();
    let vault = simulation_vault(config, &schema)?;
    let mut ctx = EncryptionContext::from_config(&config.encryption);
    let store = MemoryStore::new();
    let contention = field.queries.as_ref().map_or(0, |q| q.contention);

    let placeholder = |value: &str| {
        EncryptionPlaceholder::insert(field.key_id, field.key_id, value, contention).to_value()
    };

    let mut reconciled = 0;
    for i in 0..workload.inserts {
        let value = &workload.values[(i % workload.values.len() as u64) as usize];
        let mut doc = Document::new().with("_id", i as i64);
        doc.set_path(&field.path, placeholder(value)?)?;

        let doc = transform_placeholders(&doc, &vault, &mut ctx)?;
        let payloads = collect_insert_payloads(&doc)?;
        let outcome = process_insert(&store, SIMULATED_COLLECTION, &payloads, &schema, &config.crud, &doc)?;
        reconciled += outcome.reconciled;
    }

    let info = EncryptionInformation::for_delete(&schema, &vault)?;
    let by_id = |i: u64| Document::new().with("_id", i as i64);

    for i in 0..workload.updates {
        let modifier = UpdateModifier::Operators(vec![UpdateOperator::Set(
            Document::new().with(field.path.as_str(), placeholder(&workload.update_value)?),
        )]);
        let request = UpdateRequest {
            collection: SIMULATED_COLLECTION.into(),
            updates: vec![UpdateOpEntry {
                filter: by_id(i),
                modifier: transform_modifier(&modifier, &vault, &mut ctx)?,
                multi: false,
            }],
            encryption_information: info.clone(),
        };
        reconciled += process_update(&store, &request, &config.crud)?.reconciled;
    }

    for i in (workload.inserts - workload.deletes..workload.inserts).rev() {
        let request = DeleteRequest {
            collection: SIMULATED_COLLECTION.into(),
            deletes: vec![DeleteOpEntry {
                filter: by_id(i),
                multi: false,
            }],
            encryption_information: info.clone(),
        };
        process_delete(&store, &request, &config.crud)?;
    }

    let collections = [
        SIMULATED_COLLECTION,
        schema.existence_collection.as_str(),
        schema.tombstone_collection.as_str(),
        schema.compaction_collection.as_str(),
    ]
    .into_iter()
    .map(|name| {
        Ok(CollectionSize {
            collection: name.to_string(),
            documents: store.count_documents(name)?,
        })
    })
    .collect::<Result<Vec<_>>>()?;

    info!(
        field = %field.path,
        inserts = workload.inserts,
        updates = workload.updates,
        deletes = workload.deletes,
        "simulation complete"
    );
    Ok(SimulationReport {
        field: field.path,
        inserted: workload.inserts,
        updated: workload.updates,
        deleted: workload.deletes,
        reconciled,
        collections,
    })
}

fn print_report(report: &SimulationReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report).context("serializing report")?);
        return Ok(());
    }
    println!("field:      {}", report.field);
    println!(
        "writes:     {} inserted, {} updated, {} deleted ({} reconciled)",
        report.inserted, report.updated, report.deleted, report.reconciled
    );
    for size in &report.collections {
        println!("  {:<12} {:>8}", size.collection, size.documents);
    }
    Ok(())
}

// ── `qe config show` ──────────────────────────────────────────────────────────

fn cmd_config_show(config: &QeConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}
