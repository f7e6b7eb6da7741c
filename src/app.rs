use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tierfetch::cache::{CacheStore, Cacheable, FallbackLayer, FetchResult, Source};
use tierfetch::config::Config;
use tierfetch::connection::ConnectionState;
use tierfetch::content::{CachedContentClient, ContentClient, Post, Service};
use tierfetch::dataset::StaticDataset;
use tierfetch::monitor::ConnectivityMonitor;
use tierfetch::query::{Query, QueryStatus};
use tracing::info;

/// How often the watch loop applies finished fetches
const TICK: Duration = Duration::from_millis(250);

/// What `watch` keeps mounted
#[derive(Debug, Clone)]
pub enum WatchTarget {
  Posts { service: Option<String> },
  Services,
}

/// JSON shape printed for every result
#[derive(Serialize)]
struct Output<'a, T> {
  source: Source,
  timestamp: DateTime<Utc>,
  data: &'a T,
}

/// Wired-up content stack for one CLI invocation
pub struct App {
  config: Config,
  client: CachedContentClient,
  connection: Arc<ConnectionState>,
}

impl App {
  pub fn new(config: Config) -> Result<Self> {
    let dataset = match &config.dataset.path {
      Some(path) => StaticDataset::load(path)?,
      None => StaticDataset::bundled()?,
    };
    let cache = CacheStore::new()
      .with_default_ttl(config.cache_ttl())?
      .with_capacity(config.cache.capacity)?;
    let layer = FallbackLayer::new(Arc::new(cache), Arc::new(dataset));

    let database_path = config.database_path()?;
    info!(path = %database_path.display(), "opening content database");
    let inner = ContentClient::open(&database_path)?;
    let client =
      CachedContentClient::new(inner, layer, config.cache_ttl()).with_timeout(config.live_timeout());

    Ok(Self {
      config,
      client,
      connection: Arc::new(ConnectionState::new()),
    })
  }

  pub async fn posts(&self, service: Option<&str>) -> Result<()> {
    let result = match service {
      Some(service) => self.client.posts_by_service(service).await?,
      None => self.client.list_posts().await?,
    };
    print_result(&result)
  }

  pub async fn post(&self, id: i64) -> Result<()> {
    let result = self.client.get_post(id).await?;
    print_result(&result)
  }

  pub async fn services(&self) -> Result<()> {
    let result = self.client.list_services().await?;
    print_result(&result)
  }

  /// Copy the snapshot's services and posts into the database.
  pub async fn seed(&self) -> Result<()> {
    let dataset = self.client.layer().dataset();
    let services: Vec<Service> = dataset
      .lookup("services")
      .ok_or_else(|| eyre!("Dataset has no services entry"))?;
    let posts: Vec<Post> = dataset
      .lookup("posts")
      .ok_or_else(|| eyre!("Dataset has no posts entry"))?;

    let written = self.client.inner().seed(services, posts).await?;
    info!(written, "seeded content database");
    println!("seeded {} rows", written);
    Ok(())
  }

  pub async fn watch(&self, target: WatchTarget) -> Result<()> {
    let layer = self.client.layer().clone();
    match target {
      WatchTarget::Posts { service } => {
        let client = self.client.clone();
        let query = Query::new(layer, &self.connection, service, move |service| {
          match service {
            Some(service) => client.posts_by_service_request(service),
            None => client.posts_request(),
          }
        })?;
        self.run_watch(query).await
      }
      WatchTarget::Services => {
        let client = self.client.clone();
        let query = Query::simple(layer, &self.connection, move || client.services_request())?;
        self.run_watch(query).await
      }
    }
  }

  /// Keep the query mounted, printing each state change until Ctrl-C.
  async fn run_watch<T, P>(&self, mut query: Query<T, P>) -> Result<()>
  where
    T: Cacheable,
    P: PartialEq + Send + 'static,
  {
    let ping = self.client.inner().clone();
    let _monitor = ConnectivityMonitor::spawn(
      Arc::clone(&self.connection),
      self.config.probe_interval(),
      self.config.live_timeout(),
      move || {
        let ping = ping.clone();
        async move { ping.ping().await }
      },
    );
    let mut connection = self.connection.subscribe();

    query.fetch();
    let mut ticker = tokio::time::interval(TICK);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
      tokio::select! {
        _ = &mut ctrl_c => {
          info!("interrupted, stopping watch");
          break;
        }
        _ = ticker.tick() => {
          if let Some(transition) = connection.poll_transition() {
            eprintln!("connectivity: {:?}", transition);
          }
          if query.poll() {
            print_query(&query)?;
          }
        }
      }
    }

    let stats = self.client.layer().cache().stats();
    info!(?stats, attempts = query.attempts(), "watch finished");
    Ok(())
  }
}

fn print_result<T: Serialize>(result: &FetchResult<T>) -> Result<()> {
  print_output(result.source, result.timestamp, &result.data)
}

fn print_output<T: Serialize>(source: Source, timestamp: DateTime<Utc>, data: &T) -> Result<()> {
  let output = Output {
    source,
    timestamp,
    data,
  };
  let json = serde_json::to_string_pretty(&output)
    .map_err(|e| eyre!("Failed to serialize output: {}", e))?;
  println!("{}", json);
  Ok(())
}

fn print_query<T: Cacheable, P: PartialEq + Send + 'static>(query: &Query<T, P>) -> Result<()> {
  match query.status() {
    QueryStatus::Loading => eprintln!("refreshing..."),
    QueryStatus::Errored => {
      if let Some(error) = query.error() {
        eprintln!("error: {}", error);
      }
    }
    QueryStatus::Ready => {
      if let (Some(data), Some(source), Some(timestamp)) =
        (query.data(), query.source(), query.last_updated())
      {
        print_output(source, timestamp, data)?;
      }
    }
    QueryStatus::Idle => {}
  }
  Ok(())
}
