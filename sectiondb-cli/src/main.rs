use clap::{Parser, Subcommand, ValueEnum};
use sectiondb::{
    compile_view, BindingOptions, CompositeKey, Item, KeyStrategy, ListBinding, ListControl,
    Patch, Snapshot, Store, StoreConfig,
};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

/// SectionDB CLI: inspect and edit a record store, and watch its views
#[derive(Parser)]
#[command(name = "sectiondb", version, about)]
struct Cli {
    /// Path to the database file (overrides the config file's `database`)
    #[arg(long)]
    db: Option<PathBuf>,

    /// Path to a YAML config file declaring views
    #[arg(long)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "yaml")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Yaml,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Get a single record
    Get {
        /// Collection name
        collection: String,
        /// Record key
        key: String,
    },

    /// List all records in a collection, in key order
    List {
        /// Collection name
        collection: String,
    },

    /// Insert or replace a record
    Put {
        /// Collection name
        collection: String,
        /// Record key (omit with --auto-key)
        key: Option<String>,
        /// Field values (e.g. --field name=Columbus --field population=905000)
        #[arg(long = "field", value_parser = parse_key_value)]
        fields: Vec<(String, String)>,
        /// Generate the key with this strategy (ulid, uuid, nanoid)
        #[arg(long)]
        auto_key: Option<KeyStrategy>,
        /// Metadata as a JSON document
        #[arg(long)]
        metadata: Option<String>,
    },

    /// Remove a record
    Remove {
        /// Collection name
        collection: String,
        /// Record key
        key: String,
    },

    /// Remove every record in a collection in one transaction
    RemoveAll {
        /// Collection name
        collection: String,
    },

    /// Import a JSON array of objects into a collection in one transaction
    Import {
        /// Collection name
        collection: String,
        /// Path of the JSON file
        file: PathBuf,
        /// Field holding each record's key; records without it get a ULID
        #[arg(long, default_value = "id")]
        key_field: String,
    },

    /// Print the current sections of a configured view
    View {
        /// View name
        name: String,
        /// Search term for views with a search stage
        #[arg(long)]
        search: Option<String>,
    },

    /// Bind a configured view and print every patch as other processes write
    Watch {
        /// View name
        name: String,
        /// Search term for views with a search stage
        #[arg(long)]
        search: Option<String>,
        /// Polling interval in milliseconds
        #[arg(long, default_value = "200")]
        interval_ms: u64,
    },

    /// Show commit position, observers and collection counts
    Status,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("Invalid key=value pair: no '=' found in '{s}'"))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("ERROR:{e}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(cli.config.as_deref(), cli.db.as_deref())?;
    let store = Store::with_config(&config)?;
    let format = cli.format;

    match cli.command {
        Command::Get { collection, key } => {
            let key = CompositeKey::new(collection, key);
            let item = store
                .get_item::<Value>(&key)?
                .ok_or_else(|| format!("Record not found: {key}"))?;
            print_output(&item_to_value(&item)?, format)?;
        }

        Command::List { collection } => {
            let items = store.read(|txn| txn.items::<Value>(&collection))?;
            let items = items
                .iter()
                .map(item_to_value)
                .collect::<Result<Vec<_>, _>>()?;
            print_output(&Value::Array(items), format)?;
        }

        Command::Put {
            collection,
            key,
            fields,
            auto_key,
            metadata,
        } => {
            let key = match (key, auto_key) {
                (Some(key), None) => key,
                (None, Some(strategy)) => strategy.generate(),
                (Some(_), Some(_)) => return Err("Pass either a key or --auto-key, not both".into()),
                (None, None) => return Err("A key or --auto-key is required".into()),
            };
            let metadata = metadata
                .map(|m| serde_json::from_str::<Value>(&m))
                .transpose()
                .map_err(|e| format!("Invalid metadata: {e}"))?;
            let key = CompositeKey::new(collection, key);
            let value = fields_to_value(&fields);
            store.write(|txn| txn.put_value(&key, &value, metadata.as_ref()))?;
            print_output(
                &serde_json::json!({ "ok": true, "key": key.key, "commit": store.last_commit() }),
                format,
            )?;
        }

        Command::Remove { collection, key } => {
            let key = CompositeKey::new(collection, key);
            if !store.remove_key(&key)? {
                return Err(format!("Record not found: {key}").into());
            }
            print_output(&serde_json::json!({ "ok": true, "removed": key.key }), format)?;
        }

        Command::RemoveAll { collection } => {
            let removed = store.remove_all(&collection)?;
            print_output(&serde_json::json!({ "ok": true, "removed": removed }), format)?;
        }

        Command::Import {
            collection,
            file,
            key_field,
        } => {
            let text = std::fs::read_to_string(&file)
                .map_err(|e| format!("Failed to read '{}': {e}", file.display()))?;
            let records: Vec<Value> = serde_json::from_str(&text)?;
            let imported = store.write(|txn| {
                for record in &records {
                    let key = match record.get(&key_field) {
                        Some(Value::String(s)) => s.clone(),
                        Some(Value::Null) | None => KeyStrategy::Ulid.generate(),
                        Some(other) => other.to_string(),
                    };
                    txn.put_value(&CompositeKey::new(collection.as_str(), key), record, None)?;
                }
                Ok(records.len())
            })?;
            print_output(&serde_json::json!({ "ok": true, "imported": imported }), format)?;
        }

        Command::View { name, search } => {
            let compiled = compile_configured(&config, &name, search.as_deref())?;
            let sections = store.read(|txn| {
                let snapshot = sectiondb::projection::project_full(&compiled.view, txn)?;
                Ok(snapshot
                    .sections
                    .iter()
                    .map(|section| {
                        let header = compiled.view.header_title(txn, &section.group);
                        serde_json::json!({
                            "group": section.group,
                            "header": header.unwrap_or_else(|| section.group.clone()),
                            "rows": section
                                .items
                                .iter()
                                .map(|item| serde_json::json!({ "key": item.key.key, "value": item.value }))
                                .collect::<Vec<_>>(),
                        })
                    })
                    .collect::<Vec<_>>())
            })?;
            print_output(
                &serde_json::json!({ "view": compiled.title, "sections": sections }),
                format,
            )?;
        }

        Command::Watch {
            name,
            search,
            interval_ms,
        } => {
            let compiled = compile_configured(&config, &name, search.as_deref())?;
            let binding = ListBinding::bind(
                name.as_str(),
                &store,
                compiled.view,
                PrintingControl { format },
                BindingOptions::default().with_title(compiled.title),
            )?;
            store.watch()?;
            log::info!("Watching view '{}'", binding.title());

            loop {
                store.process_watcher_events()?;
                if let Some(e) = binding.take_last_error() {
                    log::warn!("Binding '{}' recovered from: {e}", binding.id());
                }
                std::thread::sleep(Duration::from_millis(interval_ms));
            }
        }

        Command::Status => {
            let mut status = store.status()?;
            if let Some(object) = status.as_object_mut() {
                object.insert(
                    "views".to_string(),
                    Value::Array(config.views.keys().cloned().map(Value::String).collect()),
                );
            }
            print_output(&status, format)?;
        }
    }

    Ok(())
}

/// Read the config file if one was given, then apply `--db`. A relative
/// database path in a config file is resolved against the file's directory.
fn load_config(
    config_path: Option<&Path>,
    db: Option<&Path>,
) -> Result<StoreConfig, Box<dyn std::error::Error>> {
    let mut config = match config_path {
        Some(path) => {
            let mut config = sectiondb::parse_config(path)?;
            let database = Path::new(&config.database);
            if !config.is_in_memory() && database.is_relative() {
                if let Some(dir) = path.parent() {
                    config.database = dir.join(database).display().to_string();
                }
            }
            config
        }
        None => StoreConfig::default(),
    };
    if let Some(db) = db {
        config.database = db.display().to_string();
    }
    Ok(config)
}

fn compile_configured(
    config: &StoreConfig,
    name: &str,
    search: Option<&str>,
) -> Result<sectiondb::CompiledView, Box<dyn std::error::Error>> {
    let view_config = config
        .views
        .get(name)
        .ok_or_else(|| format!("View '{name}' not found"))?;
    let compiled = compile_view(name, view_config, &config.search);
    match (search, &compiled.search) {
        (Some(term), Some(handle)) => {
            handle.set_term(term);
        }
        (Some(_), None) => return Err(format!("View '{name}' has no search stage").into()),
        (None, _) => {}
    }
    Ok(compiled)
}

/// A list control that prints what a UI list would have to do.
struct PrintingControl {
    format: OutputFormat,
}

impl ListControl<Value> for PrintingControl {
    fn apply_patch(&mut self, patch: &Patch, new: &Snapshot<Value>) -> sectiondb::Result<()> {
        let output = serde_json::json!({
            "patch": patch.iter().map(|op| op.to_string()).collect::<Vec<_>>(),
            "sections": new.section_count(),
            "rows": new.len(),
        });
        print_output(&output, self.format)
            .map_err(|e| sectiondb::SectionDbError::Other(e.to_string()))
    }

    fn reload_data(&mut self, snapshot: &Snapshot<Value>) {
        let output = serde_json::json!({
            "reload": snapshot
                .sections
                .iter()
                .map(|s| serde_json::json!({ "group": s.group, "rows": s.items.len() }))
                .collect::<Vec<_>>(),
        });
        if let Err(e) = print_output(&output, self.format) {
            log::error!("Failed to print reload: {e}");
        }
    }
}

fn print_output(value: &Value, format: OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(value)?),
    }
    Ok(())
}

fn item_to_value(item: &Item<Value>) -> Result<Value, serde_json::Error> {
    serde_json::to_value(item)
}

fn fields_to_value(fields: &[(String, String)]) -> Value {
    let mut map = serde_json::Map::new();
    for (key, val) in fields {
        // Numbers, booleans, arrays and objects parse as JSON; anything else is a string
        let json_val = serde_json::from_str(val).unwrap_or_else(|_| Value::String(val.clone()));
        map.insert(key.clone(), json_val);
    }
    Value::Object(map)
}
