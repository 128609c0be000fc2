use clap::{Parser, Subcommand, ValueEnum};

use showsync::jobs::actions;
use showsync::{
    Database, ListItemType, MovieFlag, Service, ShowFlag, ShowSync, SyncOptions, SyncReport,
    SyncStatus, SyncType, WatchedState,
};

#[derive(Parser)]
#[command(name = "showsync", about = "Keep a local show and movie library in sync")]
struct Cli {
    /// Database path (default: ~/.showsync/showsync.db)
    #[arg(long)]
    db: Option<String>,

    /// Increase logging verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send queued changes and reconcile with the configured services
    Sync {
        /// Refresh every show from the catalog, not only stale ones
        #[arg(long, conflicts_with_all = ["jobs", "show"])]
        full: bool,
        /// Only send queued changes
        #[arg(long, conflicts_with = "show")]
        jobs: bool,
        /// Send queued changes, then refresh this show
        #[arg(long, value_name = "SHOW_ID")]
        show: Option<i64>,
        /// Output the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Inspect the queue of changes waiting to be sent
    Jobs {
        #[command(subcommand)]
        action: JobsAction,
    },
    /// Set the watched state of an episode
    Episode {
        episode_id: i64,
        #[arg(value_enum)]
        state: WatchArg,
    },
    /// Set the watched state of a whole season
    Season {
        show_id: i64,
        season: i32,
        #[arg(value_enum)]
        state: WatchArg,
    },
    /// Add an episode to or remove it from the collection
    Collect {
        episode_id: i64,
        #[arg(long)]
        remove: bool,
    },
    /// Turn a show flag on or off
    Show {
        show_id: i64,
        #[arg(value_enum)]
        flag: ShowFlagArg,
        #[arg(long)]
        off: bool,
    },
    /// Turn a movie flag on or off
    Movie {
        tmdb_id: i32,
        #[arg(value_enum)]
        flag: MovieFlagArg,
        #[arg(long)]
        off: bool,
        /// Title stored if the movie is not in the library yet
        #[arg(long, default_value = "")]
        title: String,
    },
    /// Rate a show, episode or movie (0 removes the rating)
    Rate {
        #[command(subcommand)]
        target: RateTarget,
    },
    /// Manage lists
    List {
        #[command(subcommand)]
        action: ListAction,
    },
    /// Forget sync state so the next sync merges with a service from scratch
    Reset {
        #[arg(value_enum)]
        service: ServiceArg,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Show library status
    Status,
}

#[derive(Subcommand)]
enum JobsAction {
    /// List queued jobs, oldest first
    List {
        #[arg(long)]
        json: bool,
    },
    /// Drop every queued job without sending it
    Purge,
}

#[derive(Subcommand)]
enum RateTarget {
    Show { show_id: i64, rating: i32 },
    Episode { episode_id: i64, rating: i32 },
    Movie {
        tmdb_id: i32,
        rating: i32,
        #[arg(long, default_value = "")]
        title: String,
    },
}

#[derive(Subcommand)]
enum ListAction {
    Create { name: String },
    Rename { list_id: String, name: String },
    Remove { list_id: String },
    /// Add an item to a list
    Add {
        list_id: String,
        #[arg(value_enum)]
        item_type: ItemTypeArg,
        item_ref_id: String,
    },
    /// Remove an item by its composite id
    RemoveItem { list_item_id: String },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a config value
    Get { key: String },
    /// Set a config value
    Set { key: String, value: String },
    /// List all config values
    List,
}

#[derive(Clone, Copy, ValueEnum)]
enum WatchArg {
    Watched,
    Skipped,
    Unwatched,
}

impl From<WatchArg> for WatchedState {
    fn from(arg: WatchArg) -> Self {
        match arg {
            WatchArg::Watched => WatchedState::Watched,
            WatchArg::Skipped => WatchedState::Skipped,
            WatchArg::Unwatched => WatchedState::Unwatched,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ShowFlagArg {
    Favorite,
    Notify,
    Hidden,
}

impl From<ShowFlagArg> for ShowFlag {
    fn from(arg: ShowFlagArg) -> Self {
        match arg {
            ShowFlagArg::Favorite => ShowFlag::Favorite,
            ShowFlagArg::Notify => ShowFlag::Notify,
            ShowFlagArg::Hidden => ShowFlag::Hidden,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum MovieFlagArg {
    Collection,
    Watchlist,
    Watched,
}

impl From<MovieFlagArg> for MovieFlag {
    fn from(arg: MovieFlagArg) -> Self {
        match arg {
            MovieFlagArg::Collection => MovieFlag::Collection,
            MovieFlagArg::Watchlist => MovieFlag::Watchlist,
            MovieFlagArg::Watched => MovieFlag::Watched,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ItemTypeArg {
    Show,
    Season,
    Episode,
    Movie,
}

impl From<ItemTypeArg> for ListItemType {
    fn from(arg: ItemTypeArg) -> Self {
        match arg {
            ItemTypeArg::Show => ListItemType::Show,
            ItemTypeArg::Season => ListItemType::Season,
            ItemTypeArg::Episode => ListItemType::Episode,
            ItemTypeArg::Movie => ListItemType::Movie,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ServiceArg {
    Cloud,
    Tracker,
}

impl From<ServiceArg> for Service {
    fn from(arg: ServiceArg) -> Self {
        match arg {
            ServiceArg::Cloud => Service::Cloud,
            ServiceArg::Tracker => Service::Tracker,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let db = match &cli.db {
        Some(path) => Database::open_at(path).await?,
        None => Database::open().await?,
    };

    match cli.command {
        Commands::Sync {
            full,
            jobs,
            show,
            json,
        } => {
            let sync_type = match (full, jobs, show) {
                (_, _, Some(show_id)) => SyncType::Single(show_id),
                (_, true, None) => SyncType::Jobs,
                (true, false, None) => SyncType::Full,
                (false, false, None) => SyncType::Delta,
            };
            let app = ShowSync::from_env(db)?;
            let report = app.sync(&SyncOptions::new(sync_type)).await?;
            print_report(&report, json)?;
            if report.status == SyncStatus::Failed {
                std::process::exit(1);
            }
        }
        Commands::Jobs { action } => handle_jobs(db, action).await?,
        Commands::Episode { episode_id, state } => {
            actions::set_episode_watched(&db, episode_id, state.into()).await?;
            println!("Episode {episode_id} updated.");
        }
        Commands::Season {
            show_id,
            season,
            state,
        } => {
            let count = actions::set_season_watched(&db, show_id, season, state.into()).await?;
            println!("{count} episodes updated.");
        }
        Commands::Collect { episode_id, remove } => {
            actions::set_episode_collected(&db, episode_id, !remove).await?;
            println!("Episode {episode_id} updated.");
        }
        Commands::Show { show_id, flag, off } => {
            actions::set_show_flag(&db, show_id, flag.into(), !off).await?;
            println!("Show {show_id} updated.");
        }
        Commands::Movie {
            tmdb_id,
            flag,
            off,
            title,
        } => {
            actions::set_movie_flag(&db, tmdb_id, &title, flag.into(), !off).await?;
            println!("Movie {tmdb_id} updated.");
        }
        Commands::Rate { target } => {
            match target {
                RateTarget::Show { show_id, rating } => {
                    actions::rate_show(&db, show_id, rating).await?
                }
                RateTarget::Episode { episode_id, rating } => {
                    actions::rate_episode(&db, episode_id, rating).await?
                }
                RateTarget::Movie {
                    tmdb_id,
                    rating,
                    title,
                } => actions::rate_movie(&db, tmdb_id, &title, rating).await?,
            }
            println!("Rating saved.");
        }
        Commands::List { action } => handle_list(&db, action).await?,
        Commands::Reset { service } => {
            let service: Service = service.into();
            ShowSync::new(showsync::SyncContext::new(db))
                .reset_service(service)
                .await?;
            println!("{service} will be merged from scratch on the next sync.");
        }
        Commands::Config { action } => handle_config(db, action).await?,
        Commands::Status => print_status(&db).await?,
    }

    Ok(())
}

fn print_report(report: &SyncReport, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    println!("Sync {}: {}", report.sync_type.as_str(), report.status.as_str());
    for stage_error in &report.stage_errors {
        match stage_error.stage {
            Some(stage) => println!("  {stage}: {}", stage_error.message),
            None => println!("  {}", stage_error.message),
        }
    }
    if let Some(error) = &report.error {
        println!("  Error: {error}");
    }
    Ok(())
}

async fn handle_jobs(db: Database, action: JobsAction) -> anyhow::Result<()> {
    let queue = showsync::JobQueue::new(db);
    match action {
        JobsAction::List { json } => {
            let jobs = queue.peek_all().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&jobs)?);
            } else if jobs.is_empty() {
                println!("No queued jobs.");
            } else {
                for raw in jobs {
                    match raw.decode() {
                        Ok(job) => println!(
                            "{:>6}  {}  {}  {}",
                            job.job_id,
                            job.created_at().format("%Y-%m-%d %H:%M"),
                            job.action.display_name(),
                            job.payload.label()
                        ),
                        Err(e) => println!("{:>6}  {}  (unreadable: {e})", raw.job_id, raw.action),
                    }
                }
            }
        }
        JobsAction::Purge => {
            let removed = queue.clear().await?;
            println!("Removed {removed} jobs.");
        }
    }
    Ok(())
}

async fn handle_list(db: &Database, action: ListAction) -> anyhow::Result<()> {
    match action {
        ListAction::Create { name } => {
            let list_id = actions::create_list(db, &name).await?;
            println!("Created list {list_id}.");
        }
        ListAction::Rename { list_id, name } => {
            actions::rename_list(db, &list_id, &name).await?;
            println!("List renamed.");
        }
        ListAction::Remove { list_id } => {
            actions::remove_list(db, &list_id).await?;
            println!("List removed.");
        }
        ListAction::Add {
            list_id,
            item_type,
            item_ref_id,
        } => {
            let id = actions::add_list_item(db, &list_id, &item_ref_id, item_type.into()).await?;
            println!("Added {id}.");
        }
        ListAction::RemoveItem { list_item_id } => {
            actions::remove_list_item(db, &list_item_id).await?;
            println!("Item removed.");
        }
    }
    Ok(())
}

async fn handle_config(db: Database, action: ConfigAction) -> anyhow::Result<()> {
    let app = ShowSync::new(showsync::SyncContext::new(db));
    match action {
        ConfigAction::Get { key } => match app.config_get(&key).await? {
            Some(v) => println!("{key} = {v}"),
            None => println!("{key} is not set"),
        },
        ConfigAction::Set { key, value } => {
            app.config_set(&key, &value).await?;
            println!("Config updated.");
        }
        ConfigAction::List => {
            let items = app.config_list().await?;
            if items.is_empty() {
                println!("No configuration set.");
            } else {
                for (k, v) in items {
                    println!("{k} = {v}");
                }
            }
        }
    }
    Ok(())
}

async fn print_status(db: &Database) -> anyhow::Result<()> {
    let stats = db
        .reader()
        .call(|conn| {
            let shows: i64 = conn.query_row("SELECT COUNT(*) FROM shows", [], |row| row.get(0))?;
            let watched: i64 = conn.query_row(
                "SELECT COUNT(*) FROM episodes WHERE watched = 1",
                [],
                |row| row.get(0),
            )?;
            let movies: i64 =
                conn.query_row("SELECT COUNT(*) FROM movies", [], |row| row.get(0))?;
            let lists: i64 = conn.query_row("SELECT COUNT(*) FROM lists", [], |row| row.get(0))?;
            let jobs: i64 = conn.query_row("SELECT COUNT(*) FROM jobs", [], |row| row.get(0))?;
            Ok::<_, rusqlite::Error>((shows, watched, movies, lists, jobs))
        })
        .await?;
    let last_run = ShowSync::new(showsync::SyncContext::new(db.clone()))
        .last_sync_run()
        .await?;

    let (shows, watched, movies, lists, jobs) = stats;
    println!("Library Status");
    println!("  Shows:            {shows}");
    println!("  Watched episodes: {watched}");
    println!("  Movies:           {movies}");
    println!("  Lists:            {lists}");
    println!("  Queued jobs:      {jobs}");
    match last_run {
        Some(run) => {
            println!(
                "  Last sync:        {} ({}, {})",
                run.completed_at.unwrap_or_default(),
                run.sync_type,
                run.status
            );
            if let Some(error) = run.error {
                println!("  Last error:       {error}");
            }
        }
        None => println!("  Last sync:        never"),
    }
    Ok(())
}
