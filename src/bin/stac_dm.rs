use std::process::ExitCode;
use std::sync::atomic::AtomicBool;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use stac_dataset_manager::app::App;
use stac_dataset_manager::app::DownloadArgs;
use stac_dataset_manager::config::{ProfileStore, resolve_api_key};
use stac_dataset_manager::domain::{
    BoundingBox, DatasetRef, IfExists, TemporalQuery, parse_temporal_query,
};
use stac_dataset_manager::error::MlhubError;
use stac_dataset_manager::filter::CollectionFilter;
use stac_dataset_manager::output::{JsonOutput, LogSink};
use stac_dataset_manager::scheduler::DEFAULT_CONCURRENCY;
use stac_dataset_manager::session::HttpSession;

#[derive(Parser)]
#[command(name = "stac-dm")]
#[command(about = "Download STAC-like dataset catalogs and their assets")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true, help = "API key to use instead of any profile")]
    api_key: Option<String>,

    #[arg(long, global = true, help = "Profile name from ~/.mlhub/profiles.json")]
    profile: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Store an API key in a named profile")]
    Configure(ConfigureArgs),
    #[command(about = "Browse datasets on the remote catalog")]
    Datasets(DatasetsArgs),
    #[command(about = "Download a dataset's catalog and assets")]
    Download(DownloadCliArgs),
}

#[derive(Args)]
struct ConfigureArgs {
    #[arg(long, default_value = "default")]
    name: String,

    #[arg(long)]
    api_key: String,
}

#[derive(Args)]
struct DatasetsArgs {
    #[command(subcommand)]
    command: DatasetsCommand,
}

#[derive(Subcommand)]
enum DatasetsCommand {
    #[command(about = "List datasets, optionally filtered by tag or text")]
    List(ListArgs),
    #[command(about = "Show one dataset and its collection archives")]
    Info(InfoArgs),
}

#[derive(Args)]
struct ListArgs {
    #[arg(long)]
    tag: Vec<String>,

    #[arg(long)]
    text: Vec<String>,
}

#[derive(Args)]
struct InfoArgs {
    dataset: String,
}

#[derive(Args)]
struct DownloadCliArgs {
    /// Dataset id or DOI
    dataset: String,

    #[arg(long, default_value = ".")]
    output_dir: Utf8PathBuf,

    #[arg(long, value_enum, default_value_t = IfExists::Resume)]
    if_exists: IfExists,

    #[arg(long, help = "Fetch and unpack the catalog archive only, no assets")]
    catalog_only: bool,

    #[arg(long, default_value_t = DEFAULT_CONCURRENCY)]
    concurrency: usize,

    #[arg(
        long,
        help = "JSON map of collection id to allowed asset keys, e.g. '{\"c1\":[\"B02\"]}'"
    )]
    collection_filter: Option<String>,

    #[arg(long, help = "Single date or start/end range, e.g. 2019-04-01/2019-06-30")]
    datetime: Option<String>,

    #[arg(
        long,
        num_args = 4,
        value_names = ["WEST", "SOUTH", "EAST", "NORTH"],
        allow_negative_numbers = true
    )]
    bbox: Option<Vec<f64>>,

    #[arg(long, help = "Path to a GeoJSON geometry or feature for an intersects filter")]
    intersects: Option<Utf8PathBuf>,

    #[arg(long, help = "Reset previously failed assets to pending before downloading")]
    retry_failed: bool,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(mlhub) = report.downcast_ref::<MlhubError>() {
            return ExitCode::from(map_exit_code(mlhub));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &MlhubError) -> u8 {
    match error {
        MlhubError::DatasetNotFound(_) | MlhubError::ApiKeyNotFound(_) => 2,
        MlhubError::ApiHttp(_)
        | MlhubError::ApiStatus { .. }
        | MlhubError::CatalogFetch(_)
        | MlhubError::CatalogCorrupt(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Configure(args) => {
            let path = ProfileStore::save_profile(&args.name, &args.api_key).into_diagnostic()?;
            eprintln!("wrote profile \"{}\" to {}", args.name, path.display());
            Ok(())
        }
        Commands::Datasets(args) => {
            let app = build_app(cli.api_key.as_deref(), cli.profile.as_deref())?;
            match args.command {
                DatasetsCommand::List(list) => {
                    let datasets = app
                        .list_datasets(&list.tag, &list.text, &LogSink)
                        .into_diagnostic()?;
                    JsonOutput::print_datasets(&datasets).into_diagnostic()?;
                    Ok(())
                }
                DatasetsCommand::Info(info) => {
                    let dataset: DatasetRef = info.dataset.parse().into_diagnostic()?;
                    let result = app.dataset_info(&dataset, &LogSink).into_diagnostic()?;
                    JsonOutput::print_info(&result).into_diagnostic()?;
                    Ok(())
                }
            }
        }
        Commands::Download(args) => {
            let app = build_app(cli.api_key.as_deref(), cli.profile.as_deref())?;
            let download_args = build_download_args(args)?;
            let cancel = AtomicBool::new(false);
            let summary = app
                .download(download_args, &cancel, &LogSink)
                .into_diagnostic()?;
            JsonOutput::print_download(&summary).into_diagnostic()?;
            Ok(())
        }
    }
}

fn build_app(
    api_key: Option<&str>,
    profile: Option<&str>,
) -> miette::Result<App<HttpSession>> {
    let api_key = resolve_api_key(api_key, profile).into_diagnostic()?;
    let session = HttpSession::new(&api_key).into_diagnostic()?;
    Ok(App::new(session))
}

fn build_download_args(args: DownloadCliArgs) -> miette::Result<DownloadArgs> {
    let dataset: DatasetRef = args.dataset.parse().into_diagnostic()?;

    let collection_filter: Option<CollectionFilter> = args
        .collection_filter
        .as_deref()
        .map(|raw| {
            serde_json::from_str(raw).map_err(|err| {
                MlhubError::InvalidFilter(format!("collection filter is not a JSON map: {err}"))
            })
        })
        .transpose()
        .into_diagnostic()?;

    let temporal: Option<TemporalQuery> = args
        .datetime
        .as_deref()
        .map(parse_temporal_query)
        .transpose()
        .into_diagnostic()?;

    let bbox = args
        .bbox
        .as_deref()
        .map(BoundingBox::from_slice)
        .transpose()
        .into_diagnostic()?;

    let intersects = args
        .intersects
        .map(|path| {
            let content = std::fs::read_to_string(path.as_std_path())
                .map_err(|err| MlhubError::Filesystem(format!("read {path}: {err}")))?;
            serde_json::from_str::<serde_json::Value>(&content).map_err(|err| {
                MlhubError::InvalidFilter(format!("{path} is not valid JSON: {err}"))
            })
        })
        .transpose()
        .into_diagnostic()?;

    Ok(DownloadArgs {
        dataset,
        output_dir: args.output_dir,
        if_exists: args.if_exists,
        catalog_only: args.catalog_only,
        concurrency: args.concurrency,
        collection_filter,
        temporal,
        bbox,
        intersects,
        retry_failed: args.retry_failed,
    })
}
