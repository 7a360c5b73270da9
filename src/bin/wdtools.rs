use std::io::Read;
use std::process::ExitCode;

use camino::{Utf8Path, Utf8PathBuf};
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use wdtools::collect::{
    CollectOptions, Collector, IdentifierSource, bbox_to_sink, instance_of_ids, read_id_chunks,
};
use wdtools::config::{Config, ConfigLoader};
use wdtools::domain::{EntityId, Language};
use wdtools::error::HarvestError;
use wdtools::export::{CsvSink, SqliteSink, TableSink, csv_to_sqlite};
use wdtools::geometry::BoundingBox;
use wdtools::labels::with_label_cache;
use wdtools::output::JsonOutput;
use wdtools::query::{QuerySource, WikidataClient};
use wdtools::sparql::GEOM_COLUMN;
use wdtools::store::RecordStore;

#[derive(Parser)]
#[command(name = "wdtools")]
#[command(about = "Harvest Wikidata entities, labels and bounding-box results for offline use")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<String>,

    #[arg(long, global = true)]
    language: Option<String>,

    #[arg(long, global = true)]
    label_cache: Option<Utf8PathBuf>,

    #[arg(long, global = true)]
    max_retries: Option<u32>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Run a SPARQL query read from a file (or - for stdin)")]
    Query(QueryArgs),
    #[command(about = "Resolve labels through the label cache")]
    Label(LabelArgs),
    #[command(about = "Collect entity records into a folder, skipping ones already present")]
    Collect(CollectArgs),
    #[command(about = "Export items inside a bounding box with their class labels")]
    Bbox(BboxArgs),
    #[command(about = "Load a CSV export into a SQLite table")]
    Import(ImportArgs),
}

#[derive(Args)]
struct QueryArgs {
    file: String,

    #[arg(long)]
    output: Option<Utf8PathBuf>,
}

#[derive(Args)]
struct LabelArgs {
    #[arg(required = true)]
    ids: Vec<String>,
}

#[derive(Args)]
struct CollectArgs {
    #[arg(long = "id")]
    ids: Vec<String>,

    #[arg(long)]
    ids_file: Option<Utf8PathBuf>,

    #[arg(long)]
    instance_of: Option<String>,

    #[arg(long, requires = "instance_of")]
    ids_cache: Option<Utf8PathBuf>,

    /// Re-run the instance-of query even if the id cache file exists
    #[arg(long, requires = "instance_of")]
    refresh_ids: bool,

    #[arg(long)]
    dest: Utf8PathBuf,

    #[arg(long)]
    overwrite: bool,

    #[arg(long)]
    chunk_size: Option<usize>,

    #[arg(long, default_value = "claims|labels")]
    props: String,

    #[arg(long)]
    failed_manifest: Option<Utf8PathBuf>,
}

#[derive(Args)]
struct BboxArgs {
    #[arg(allow_hyphen_values = true)]
    bbox: String,

    #[arg(long, default_value_t = 1)]
    splits: usize,

    #[arg(long)]
    output: Utf8PathBuf,

    #[arg(long, default_value = "wikidata")]
    table: String,
}

#[derive(Args)]
struct ImportArgs {
    csv: Utf8PathBuf,

    #[arg(long)]
    db: Utf8PathBuf,

    #[arg(long)]
    table: String,

    #[arg(long, default_value = GEOM_COLUMN)]
    geometry_column: String,

    #[arg(long, default_value_t = 200_000)]
    chunk_size: usize,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<HarvestError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &HarvestError) -> u8 {
    match error {
        HarvestError::InvalidEntityId(_)
        | HarvestError::InvalidLanguage(_)
        | HarvestError::InvalidBoundingBox(_)
        | HarvestError::InvalidIdentifierSource(_)
        | HarvestError::MissingConfig(_)
        | HarvestError::ConfigRead(_)
        | HarvestError::ConfigParse(_)
        | HarvestError::LabelLanguageMismatch { .. } => 2,
        HarvestError::QueryProtocol(_)
        | HarvestError::QueryEmpty
        | HarvestError::UnexpectedStatus { .. }
        | HarvestError::Http(_)
        | HarvestError::Encoding(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = resolve_config(&cli)?;

    match cli.command {
        Command::Query(args) => run_query(args, &config),
        Command::Label(args) => run_label(args, &config),
        Command::Collect(args) => run_collect(args, &config),
        Command::Bbox(args) => run_bbox(args, &config),
        Command::Import(args) => run_import(args),
    }
}

fn resolve_config(cli: &Cli) -> Result<Config, HarvestError> {
    let mut config = ConfigLoader::resolve(cli.config.as_deref())?;
    if let Some(language) = &cli.language {
        config.language = language.parse::<Language>()?;
    }
    if let Some(path) = &cli.label_cache {
        config.label_cache = Some(path.clone());
    }
    if let Some(max_retries) = cli.max_retries {
        config.max_retries = max_retries;
    }
    Ok(config)
}

fn run_query(args: QueryArgs, config: &Config) -> miette::Result<()> {
    let sparql = if args.file == "-" {
        let mut buffer = String::new();
        std::io::stdin()
            .read_to_string(&mut buffer)
            .into_diagnostic()?;
        buffer
    } else {
        std::fs::read_to_string(&args.file).into_diagnostic()?
    };

    let client = WikidataClient::from_config(config)?;
    let table = client.run_query(&sparql)?;
    match args.output {
        Some(path) => {
            let mut sink = open_sink(&path, "query")?;
            sink.write_table(&table, false)?;
            JsonOutput::print_json(&serde_json::json!({
                "rows": table.len(),
                "output": path.as_str(),
            }))
            .into_diagnostic()?;
        }
        None => JsonOutput::print_table(&table).into_diagnostic()?,
    }
    Ok(())
}

fn run_label(args: LabelArgs, config: &Config) -> miette::Result<()> {
    let ids = args
        .ids
        .iter()
        .map(|value| EntityId::from_uri(value))
        .collect::<Result<Vec<_>, _>>()?;
    let client = WikidataClient::from_config(config)?;
    let labels = with_label_cache(
        config.label_cache_path()?,
        config.language.clone(),
        &client,
        |cache| {
            Ok(ids
                .iter()
                .map(|id| (id.to_string(), cache.get(id).map(str::to_string)))
                .collect::<std::collections::BTreeMap<_, _>>())
        },
    )?;
    JsonOutput::print_json(&labels).into_diagnostic()?;
    Ok(())
}

fn run_collect(args: CollectArgs, config: &Config) -> miette::Result<()> {
    let client = WikidataClient::from_config(config)?;
    let chunk_size = args.chunk_size.unwrap_or(config.chunk_size);

    let source = if let Some(class) = &args.instance_of {
        let class: EntityId = class.parse()?;
        let cache = args
            .ids_cache
            .clone()
            .unwrap_or_else(|| args.dest.with_file_name(format!("{class}.csv")));
        IdentifierSource::paged(instance_of_ids(
            &client,
            &class,
            &cache,
            args.refresh_ids,
            chunk_size,
        )?)
    } else if let Some(path) = &args.ids_file {
        IdentifierSource::paged(read_id_chunks(path, chunk_size)?)
    } else {
        let mut ids = args
            .ids
            .iter()
            .map(|value| EntityId::from_uri(value))
            .collect::<Result<Vec<_>, _>>()?;
        match ids.len() {
            0 => {
                return Err(miette::Report::msg(
                    "nothing to collect (use --id, --ids-file or --instance-of)",
                ));
            }
            1 => IdentifierSource::Single(ids.remove(0)),
            _ => IdentifierSource::Batch(ids),
        }
    };

    let options = CollectOptions {
        language: config.language.clone(),
        overwrite: args.overwrite,
        chunk_size,
        props: args.props,
    };
    let collector = Collector::new(&client, RecordStore::new(args.dest));
    let report = collector.collect(source, &options)?;
    if let Some(path) = &args.failed_manifest {
        report.write_failed_manifest(path)?;
    }
    JsonOutput::print_collect(&report).into_diagnostic()?;
    Ok(())
}

fn run_bbox(args: BboxArgs, config: &Config) -> miette::Result<()> {
    let bbox: BoundingBox = args.bbox.parse()?;
    let client = WikidataClient::from_config(config)?;
    let mut sink = open_sink(&args.output, &args.table)?;
    let report = with_label_cache(
        config.label_cache_path()?,
        config.language.clone(),
        &client,
        |labels| bbox_to_sink(&client, labels, bbox, args.splits, sink.as_mut()),
    )?;
    JsonOutput::print_bbox(&report).into_diagnostic()?;
    Ok(())
}

fn run_import(args: ImportArgs) -> miette::Result<()> {
    let rows = csv_to_sqlite(
        &args.csv,
        &args.db,
        &args.table,
        Some(args.geometry_column.as_str()),
        args.chunk_size,
    )?;
    JsonOutput::print_json(&serde_json::json!({
        "rows": rows,
        "table": args.table,
        "db": args.db.as_str(),
    }))
    .into_diagnostic()?;
    Ok(())
}

fn open_sink(path: &Utf8Path, table: &str) -> Result<Box<dyn TableSink>, HarvestError> {
    match path.extension() {
        Some("sqlite" | "db") => Ok(Box::new(
            SqliteSink::open(path, table)?.with_geometry(GEOM_COLUMN, 4326),
        )),
        _ => Ok(Box::new(CsvSink::new(path.to_path_buf()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect_args(argv: &[&str]) -> CollectArgs {
        let cli = Cli::try_parse_from(argv).unwrap();
        match cli.command {
            Command::Collect(args) => args,
            _ => panic!("expected collect"),
        }
    }

    #[test]
    fn overwrite_does_not_refresh_id_cache() {
        let args = collect_args(&[
            "wdtools", "collect", "--instance-of", "Q515", "--dest", "out", "--overwrite",
        ]);
        assert!(args.overwrite);
        assert!(!args.refresh_ids);

        let args = collect_args(&[
            "wdtools", "collect", "--instance-of", "Q515", "--dest", "out", "--refresh-ids",
        ]);
        assert!(!args.overwrite);
        assert!(args.refresh_ids);
    }

    #[test]
    fn refresh_ids_requires_instance_of() {
        let result = Cli::try_parse_from(["wdtools", "collect", "--dest", "out", "--refresh-ids"]);
        assert!(result.is_err());
    }
}
