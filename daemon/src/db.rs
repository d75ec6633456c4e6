use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::event::EngineCommand;

/// Remote endpoint listing every application the detection engine can recognize.
pub const DETECTABLE_URL: &str = "https://discord.com/api/v9/applications/detectable";

/// How often the remote database is re-fetched while the daemon runs.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(4 * 60 * 60);

/// One detectable application. Immutable once handed to the detection index;
/// the whole list is replaced on refresh.
#[derive(Debug, Clone, PartialEq)]
pub struct Game {
    pub id: String,
    pub name: String,
    pub executables: Vec<Executable>,
}

/// One executable pattern identifying a [`Game`]'s process.
///
/// Invariant: `name` is lowercase and never empty. A raw database name
/// prefixed with `>` ingests as `strict = true` with the marker stripped;
/// strict entries match only on exact filename equality.
#[derive(Debug, Clone, PartialEq)]
pub struct Executable {
    pub name: String,
    pub arguments: Option<String>,
    pub strict: bool,
}

#[derive(Debug, Deserialize)]
struct RawGame {
    id: String,
    name: String,
    #[serde(default)]
    executables: Vec<RawExecutable>,
}

#[derive(Debug, Deserialize)]
struct RawExecutable {
    name: String,
    #[serde(default)]
    arguments: Option<String>,
    #[serde(default)]
    is_launcher: bool,
}

impl Executable {
    /// Normalizes one raw database entry. Launcher entries and entries whose
    /// name is empty after normalization are dropped.
    fn from_raw(raw: RawExecutable) -> Option<Self> {
        if raw.is_launcher {
            return None;
        }
        let mut name = raw.name.trim().to_string();
        let strict = name.starts_with('>');
        if strict {
            name.remove(0);
        }
        let name = name.to_lowercase();
        if name.is_empty() {
            return None;
        }
        let arguments = raw.arguments.filter(|a| !a.is_empty());
        Some(Self {
            name,
            arguments,
            strict,
        })
    }
}

fn ingest(raw: Vec<RawGame>) -> Vec<Game> {
    raw.into_iter()
        .map(|g| Game {
            id: g.id,
            name: g.name,
            executables: g
                .executables
                .into_iter()
                .filter_map(Executable::from_raw)
                .collect(),
        })
        .collect()
}

/// Parses the JSON body of the detectable-applications endpoint.
pub fn parse_games(bytes: &[u8]) -> Result<Vec<Game>> {
    let raw: Vec<RawGame> =
        serde_json::from_slice(bytes).context("Failed to parse games database JSON")?;
    Ok(ingest(raw))
}

/// Loads the on-disk database cache at `path`.
pub fn load_disk(path: &Path) -> Result<Vec<Game>> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read database cache: {}", path.display()))?;
    parse_games(&bytes)
}

/// Conditionally fetches the remote database, keyed by the local cache's
/// last-modified time. A 304 answer resolves to the on-disk copy; a fresh
/// body is parsed first and only then persisted over the cache.
async fn fetch_remote(path: &Path) -> Result<Vec<Game>> {
    let client = reqwest::Client::new();
    let mut request = client.get(DETECTABLE_URL);

    if let Ok(modified) = std::fs::metadata(path).and_then(|m| m.modified()) {
        let stamp = DateTime::<Utc>::from(modified)
            .format("%a, %d %b %Y %H:%M:%S GMT")
            .to_string();
        request = request.header(reqwest::header::IF_MODIFIED_SINCE, stamp);
    }

    let response = request.send().await.context("Database request failed")?;
    if response.status() == reqwest::StatusCode::NOT_MODIFIED {
        return load_disk(path);
    }
    if !response.status().is_success() {
        bail!("Database endpoint returned {}", response.status());
    }

    let bytes = response
        .bytes()
        .await
        .context("Failed to read database response body")?;
    let games = parse_games(&bytes)?;

    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if let Err(e) = std::fs::write(path, &bytes) {
        eprintln!("[db] Failed to persist database cache: {e}");
    }

    Ok(games)
}

/// Loads the games database: remote first, then the on-disk cache, then an
/// empty list. Never fails; database trouble must not stop the daemon.
pub async fn load(path: &Path) -> Vec<Game> {
    match fetch_remote(path).await {
        Ok(games) => games,
        Err(e) => {
            eprintln!("[db] Remote fetch failed ({e:#}); using on-disk cache");
            match load_disk(path) {
                Ok(games) => games,
                Err(e) => {
                    eprintln!("[db] No usable database cache ({e:#}); starting empty");
                    Vec::new()
                }
            }
        }
    }
}

/// Re-fetches the database on a long fixed period and hands the fresh list to
/// the detection engine, which rebuilds its index wholesale. A refresh that
/// produced nothing keeps the previous index.
pub async fn refresh_periodically(path: PathBuf, tx: mpsc::Sender<EngineCommand>) {
    let mut ticker = interval(REFRESH_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The startup load already happened; skip the immediate first tick.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let games = load(&path).await;
        if games.is_empty() {
            continue;
        }
        println!("[db] Database refreshed: {} games", games.len());
        if tx.send(EngineCommand::ReplaceDatabase(games)).await.is_err() {
            break;
        }
    }
}
