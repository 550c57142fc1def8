pub mod config;
pub mod model;
pub mod search;
pub mod session;
pub mod settings;
pub mod shell;
pub mod storage;

use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand};
use config::EngineConfig;
use model::types::{BookOrder, Facets, ResultKind, SearchArea, SizeBucket};
use search::{SearchEngine, SearchRequest};
use session::SessionKey;
use settings::{SettingUpdate, SettingsStore};
use std::collections::BTreeSet;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use storage::sqlite::{CatalogRecord, CatalogStorage};

/// Command-line interface.
#[derive(Parser, Debug)]
#[command(
    name = "catalog",
    version,
    about = "Faceted book catalog search with pageable, cached results"
)]
pub struct Cli {
    /// Path to the catalog database (defaults to platform data dir)
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// Path to the settings database
    #[arg(long, global = true)]
    pub settings_db: Option<PathBuf>,

    /// Config file to use instead of the platform config dir
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Load catalog records from a JSON-lines file
    Import {
        file: PathBuf,

        /// Records per transaction
        #[arg(long, default_value_t = 1000)]
        batch_size: usize,

        /// Rebuild all full-text tables after loading
        #[arg(long)]
        rebuild_fts: bool,
    },
    /// Run one search and print a page
    Search {
        /// Query text; words, +required, -excluded, prefix*, (a b) groups, or field:value criteria
        #[arg(required = true, num_args = 1..)]
        query: Vec<String>,

        #[command(flatten)]
        facets: FacetArgs,

        /// Result view
        #[arg(long)]
        view: Option<ResultKind>,

        /// Ordering of the books view
        #[arg(long, default_value = "relevance")]
        order: BookOrder,

        /// 1-based page to print
        #[arg(long, default_value_t = 1)]
        page: usize,

        #[arg(long)]
        page_size: Option<usize>,

        /// Start from this user's saved settings
        #[arg(long)]
        user: Option<i64>,

        /// Print the page as JSON
        #[arg(long)]
        json: bool,
    },
    /// Interactive search session
    Shell {
        #[arg(long, default_value_t = 0)]
        user: i64,

        /// Conversation id; defaults to the user id (a private session)
        #[arg(long)]
        chat: Option<i64>,
    },
    /// Show one book: authors, series, genres, rating, annotation and reviews
    Book {
        file_id: i64,

        #[arg(long)]
        json: bool,
    },
    /// Show one author and their annotation
    Author {
        author_id: i64,

        #[arg(long)]
        json: bool,
    },
    /// List catalog languages
    Langs,
    /// List genre groups, or the genres of one group
    Genres { group: Option<String> },
    /// Catalog statistics
    Stats {
        #[arg(long)]
        json: bool,
    },
    /// Show or change a user's settings
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
    /// Generate shell completions to stdout
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
    /// Generate man page to stdout
    Man,
}

#[derive(Subcommand, Debug)]
pub enum SettingsAction {
    Show {
        #[arg(long)]
        user: i64,
    },
    Set {
        #[arg(long)]
        user: i64,
        key: String,
        value: String,
    },
}

/// Facet flags; each overrides the matching saved setting.
#[derive(Args, Debug, Default)]
pub struct FacetArgs {
    /// Language code, e.g. ru
    #[arg(long)]
    pub lang: Option<String>,

    /// less800 or more800
    #[arg(long)]
    pub size: Option<SizeBucket>,

    /// Accepted ratings, comma separated (0 = unrated)
    #[arg(long, value_delimiter = ',')]
    pub rating: Vec<u8>,

    /// primary (b), book-annotations (ba) or author-annotations (aa)
    #[arg(long)]
    pub area: Option<SearchArea>,
}

impl FacetArgs {
    fn apply(&self, facets: &mut Facets) {
        if let Some(lang) = &self.lang {
            facets.language = Some(lang.clone());
        }
        if let Some(size) = self.size {
            facets.size_bucket = Some(size);
        }
        if !self.rating.is_empty() {
            facets.ratings = self.rating.iter().copied().collect::<BTreeSet<u8>>();
        }
        if let Some(area) = self.area {
            facets.search_area = area;
        }
    }
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    let mut config = EngineConfig::load(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        config.db_path = db;
    }
    if let Some(path) = cli.settings_db {
        config.settings_path = path;
    }

    match cli.command {
        Commands::Import {
            file,
            batch_size,
            rebuild_fts,
        } => run_import(&config.db_path, &file, batch_size, rebuild_fts),
        Commands::Search {
            query,
            facets,
            view,
            order,
            page,
            page_size,
            user,
            json,
        } => {
            let settings = match user {
                Some(id) => Some(SettingsStore::open(&config.settings_path)?.get_or_create(id)?),
                None => None,
            };
            if let Some(s) = &settings
                && s.blocked
            {
                anyhow::bail!("user {} is blocked", s.user_id);
            }
            let mut request_facets = settings.as_ref().map(|s| s.facets()).unwrap_or_default();
            facets.apply(&mut request_facets);
            let request = SearchRequest {
                query: query.join(" "),
                facets: request_facets,
                kind: view
                    .or(settings.as_ref().map(|s| s.view))
                    .unwrap_or_default(),
                order,
            };
            let page_size = page_size
                .or(settings.as_ref().map(|s| s.page_size))
                .unwrap_or(config.default_page_size);
            run_search(&config, request, page.max(1) - 1, page_size, json).await
        }
        Commands::Shell { user, chat } => {
            let engine = SearchEngine::new(&config);
            let _sweeper = engine.spawn_sweeper(config.session_ttl, config.sweep_interval)?;
            let settings = SettingsStore::open(&config.settings_path)?;
            let mut shell = shell::Shell::new(&engine, &settings, user, chat.unwrap_or(user));
            let stdin = std::io::stdin();
            shell.run(stdin.lock(), std::io::stdout())
        }
        Commands::Book { file_id, json } => {
            let engine = SearchEngine::new(&config);
            let card = engine
                .book_details(file_id)?
                .with_context(|| format!("no book with id {file_id}"))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&card)?);
            } else {
                print!("{card}");
            }
            Ok(())
        }
        Commands::Author { author_id, json } => {
            let engine = SearchEngine::new(&config);
            let card = engine
                .author_details(author_id)?
                .with_context(|| format!("no author with id {author_id}"))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&card)?);
            } else {
                print!("{card}");
            }
            Ok(())
        }
        Commands::Langs => {
            let engine = SearchEngine::new(&config);
            for lang in &engine.reference().get()?.languages {
                println!("{:<8} {}", lang.code, lang.books);
            }
            Ok(())
        }
        Commands::Genres { group } => {
            let engine = SearchEngine::new(&config);
            let data = engine.reference().get()?;
            match group {
                Some(name) => {
                    let group = data
                        .genre_group(&name)
                        .with_context(|| format!("no genre group named '{name}'"))?;
                    for genre in &group.genres {
                        println!("{:<24} {:<40} {}", genre.code, genre.description, genre.books);
                    }
                }
                None => {
                    for group in &data.genres {
                        let books: i64 = group.genres.iter().map(|g| g.books).sum();
                        println!("{} ({} genres, {} books)", group.meta, group.genres.len(), books);
                    }
                }
            }
            Ok(())
        }
        Commands::Stats { json } => {
            let stats = CatalogStorage::open_readonly(&config.db_path)?.stats()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("books      {}", stats.books);
                println!("authors    {}", stats.authors);
                println!("series     {}", stats.series);
                println!("genres     {}", stats.genres);
                println!("languages  {}", stats.languages);
                match stats.last_import {
                    Some(ts) => println!("imported   {}", ts.format("%Y-%m-%d %H:%M:%S UTC")),
                    None => println!("imported   never"),
                }
            }
            Ok(())
        }
        Commands::Settings { action } => {
            let store = SettingsStore::open(&config.settings_path)?;
            let settings = match action {
                SettingsAction::Show { user } => store.get_or_create(user)?,
                SettingsAction::Set { user, key, value } => {
                    store.apply(user, SettingUpdate::parse(&key, &value)?)?
                }
            };
            println!("{settings}");
            Ok(())
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "catalog", &mut std::io::stdout());
            Ok(())
        }
        Commands::Man => {
            let cmd = Cli::command();
            let man = clap_mangen::Man::new(cmd);
            let mut out = std::io::stdout();
            man.render(&mut out)?;
            Ok(())
        }
    }
}

async fn run_search(
    config: &EngineConfig,
    request: SearchRequest,
    page_index: usize,
    page_size: usize,
    json: bool,
) -> Result<()> {
    let engine = std::sync::Arc::new(SearchEngine::new(config));
    // One-shot searches still go through the session cache so paging works
    // the same way it does in the shell.
    let key = SessionKey::user(0);
    let kind = request.kind;
    let first = std::sync::Arc::clone(&engine)
        .search_into_session_async(key, request, page_size)
        .await?;
    let page = if page_index == 0 {
        first
    } else {
        engine.get_page(&key, kind, page_index)?
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&page)?);
    } else {
        println!("{}", shell::render_page(&page));
    }
    Ok(())
}

fn run_import(db_path: &Path, file: &Path, batch_size: usize, rebuild_fts: bool) -> Result<()> {
    let reader = BufReader::new(
        std::fs::File::open(file).with_context(|| format!("opening {}", file.display()))?,
    );
    let records = reader
        .lines()
        .enumerate()
        .filter(|(_, line)| line.as_ref().map_or(true, |l| !l.trim().is_empty()))
        .map(|(idx, line)| -> Result<CatalogRecord> {
            let line = line.with_context(|| format!("reading line {}", idx + 1))?;
            serde_json::from_str(&line).with_context(|| format!("parsing line {}", idx + 1))
        });

    let mut storage = CatalogStorage::open(db_path)?;
    let written = storage.import_records(records, batch_size)?;
    if rebuild_fts {
        storage.rebuild_fts()?;
    }
    println!("imported {written} records into {}", db_path.display());
    Ok(())
}

pub fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("org", "catalog-search", "catalog-search").map_or_else(
        || PathBuf::from("."),
        |dirs| dirs.data_dir().to_path_buf(),
    )
}
