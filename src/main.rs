mod cache;
mod catalog;
mod config;
mod error;
mod gateway;
mod logging;
mod proxy;

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, warn};
use uuid::Uuid;

use cache::{CacheLayer, NoopStorage, SqliteStorage};
use catalog::{CatalogService, CatalogStore, EntryInput, PolicyInput, ProductInput, ProductUpdate};
use config::Config;
use error::{CatalogError, CatalogResult};
use gateway::{GatewayClient, GatewaySyncer};
use proxy::{TestProxy, TestRequest};

#[derive(Parser, Debug)]
#[command(name = "capi")]
#[command(about = "API catalog that keeps a Kong-style gateway in sync")]
#[command(version)]
struct Cli {
  /// Path to config file (default: ./capi.yaml, then $XDG_CONFIG_HOME/capi/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Manage catalog entries
  #[command(subcommand)]
  Apis(ApiCommand),
  /// Manage products
  #[command(subcommand)]
  Products(ProductCommand),
  /// Reconcile entries whose last gateway sync did not complete
  Sync {
    /// Reconcile every entry
    #[arg(long)]
    all: bool,
  },
}

#[derive(Subcommand, Debug)]
enum ApiCommand {
  List,
  Get {
    id: Uuid,
  },
  Create(EntryArgs),
  /// Replace an entry's fields
  Update {
    id: Uuid,
    #[command(flatten)]
    entry: EntryArgs,
  },
  Delete {
    id: Uuid,
  },
  /// Replace an entry's policies with a JSON array of {type, configuration}
  Policies {
    id: Uuid,
    /// File with the policy array, `-` for stdin
    #[arg(long)]
    file: PathBuf,
  },
  /// Send a request to the entry's upstream and print the response
  Test {
    id: Uuid,
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,
    /// Header as `Name: value`, repeatable
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,
    #[arg(short, long)]
    body: Option<String>,
  },
}

#[derive(Args, Debug)]
struct EntryArgs {
  #[arg(long)]
  name: String,
  #[arg(long)]
  route: String,
  #[arg(long)]
  upstream: String,
  #[arg(long = "method")]
  methods: Vec<String>,
  #[arg(long = "host")]
  hosts: Vec<String>,
  #[arg(long = "tag")]
  tags: Vec<String>,
  /// Register the entry with the gateway but reject its traffic
  #[arg(long)]
  disabled: bool,
  #[arg(long)]
  product: Option<Uuid>,
}

impl From<EntryArgs> for EntryInput {
  fn from(args: EntryArgs) -> Self {
    Self {
      name: args.name,
      route: args.route,
      upstream_url: args.upstream,
      methods: args.methods,
      hosts: args.hosts,
      tags: args.tags,
      enabled: !args.disabled,
      product_id: args.product,
    }
  }
}

#[derive(Subcommand, Debug)]
enum ProductCommand {
  List,
  Get {
    id: Uuid,
  },
  Create {
    #[arg(long)]
    name: String,
    #[arg(long)]
    description: Option<String>,
  },
  /// Change name or description; an empty description clears it
  Update {
    id: Uuid,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    description: Option<String>,
  },
  Delete {
    id: Uuid,
  },
  AddApi {
    product: Uuid,
    api: Uuid,
  },
  RemoveApi {
    product: Uuid,
    api: Uuid,
  },
  /// List the entries in a product
  Apis {
    product: Uuid,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let cli = Cli::parse();

  // Load configuration
  let config = Config::load(cli.config.as_deref())?;
  let guard = logging::init(&config.log)?;

  let service = build_service(&config)?;

  match run(&service, cli.command).await {
    Ok(output) => {
      println!("{}", output);
      Ok(())
    }
    Err(e) => {
      error!(error = %e, "command failed");
      eprintln!("error: {}", e);
      // Flush the file sink before exiting without unwinding
      drop(guard);
      std::process::exit(e.exit_code());
    }
  }
}

fn build_service(config: &Config) -> Result<CatalogService> {
  let store = CatalogStore::open(&config.catalog_path()?)?;
  let syncer = GatewaySyncer::new(GatewayClient::new(&config.gateway)?);
  let proxy = TestProxy::new(config.proxy.timeout())?;
  let cache = open_cache(config).with_ttl(config.cache.ttl());

  Ok(CatalogService::new(store, syncer, cache, proxy))
}

/// A cache that cannot be opened only costs speed, so fall back to none.
fn open_cache(config: &Config) -> CacheLayer {
  if !config.cache.enabled {
    return CacheLayer::new(NoopStorage);
  }

  let storage = config
    .cache_path()
    .and_then(|path| SqliteStorage::open(&path));
  match storage {
    Ok(storage) => {
      match storage.purge_expired() {
        Ok(purged) => debug!(purged, "expired cache entries removed"),
        Err(e) => warn!(error = %e, "cache purge skipped"),
      }
      CacheLayer::new(storage)
    }
    Err(e) => {
      warn!(error = %e, "cache unavailable, reading from the catalog only");
      CacheLayer::new(NoopStorage)
    }
  }
}

async fn run(service: &CatalogService, command: Command) -> CatalogResult<String> {
  match command {
    Command::Apis(command) => run_api(service, command).await,
    Command::Products(command) => run_product(service, command).await,
    Command::Sync { all } => render(&service.resync(all).await?),
  }
}

async fn run_api(service: &CatalogService, command: ApiCommand) -> CatalogResult<String> {
  match command {
    ApiCommand::List => render(&service.list_entries().await?.data),
    ApiCommand::Get { id } => render(&service.get_entry(id).await?.data),
    ApiCommand::Create(entry) => render(&service.create_entry(entry.into()).await?),
    ApiCommand::Update { id, entry } => render(&service.update_entry(id, entry.into()).await?),
    ApiCommand::Delete { id } => {
      service.delete_entry(id).await?;
      render(&json!({ "deleted": id }))
    }
    ApiCommand::Policies { id, file } => {
      let policies = read_policies(&file)?;
      render(&service.replace_policies(id, policies).await?)
    }
    ApiCommand::Test {
      id,
      method,
      headers,
      body,
    } => {
      let request = TestRequest {
        method,
        headers: parse_headers(&headers)?,
        body,
      };
      render(&service.test_entry(id, request).await?)
    }
  }
}

async fn run_product(service: &CatalogService, command: ProductCommand) -> CatalogResult<String> {
  match command {
    ProductCommand::List => render(&service.list_products()?),
    ProductCommand::Get { id } => render(&service.get_product(id)?),
    ProductCommand::Create { name, description } => {
      render(&service.create_product(ProductInput { name, description }).await?)
    }
    ProductCommand::Update {
      id,
      name,
      description,
    } => render(
      &service
        .update_product(id, ProductUpdate { name, description })
        .await?,
    ),
    ProductCommand::Delete { id } => {
      service.delete_product(id).await?;
      render(&json!({ "deleted": id }))
    }
    ProductCommand::AddApi { product, api } => {
      render(&service.add_entry_to_product(product, api).await?)
    }
    ProductCommand::RemoveApi { product, api } => {
      render(&service.remove_entry_from_product(product, api).await?)
    }
    ProductCommand::Apis { product } => render(&service.list_product_entries(product)?),
  }
}

fn render<T: Serialize>(value: &T) -> CatalogResult<String> {
  serde_json::to_string_pretty(value)
    .map_err(|e| CatalogError::Store(eyre!("Failed to render output: {}", e)))
}

fn read_policies(path: &Path) -> CatalogResult<Vec<PolicyInput>> {
  let contents = if path == Path::new("-") {
    let mut buf = String::new();
    std::io::stdin()
      .read_to_string(&mut buf)
      .map_err(|e| CatalogError::validation(format!("failed to read stdin: {e}")))?;
    buf
  } else {
    std::fs::read_to_string(path)
      .map_err(|e| CatalogError::validation(format!("failed to read {}: {e}", path.display())))?
  };

  serde_json::from_str(&contents)
    .map_err(|e| CatalogError::validation(format!("policies must be a JSON array: {e}")))
}

fn parse_headers(raw: &[String]) -> CatalogResult<BTreeMap<String, String>> {
  raw
    .iter()
    .map(|header| {
      let (name, value) = header
        .split_once(':')
        .ok_or_else(|| CatalogError::validation(format!("header {header:?} is not `Name: value`")))?;
      Ok((name.trim().to_string(), value.trim().to_string()))
    })
    .collect()
}
