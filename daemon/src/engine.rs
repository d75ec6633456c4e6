use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::config;
use crate::db::{Executable, Game};
use crate::event::{DaemonEvent, EngineCommand};
use crate::index::{self, DetectionIndex};
use crate::process::{ProcessRecord, ProcessSource};

/// Fixed period between scheduled scans.
pub const SCAN_INTERVAL: Duration = Duration::from_millis(5000);
/// No two scan starts may be closer than this, whoever triggered them.
pub const MIN_SCAN_SPACING: Duration = Duration::from_millis(1000);

/// Executable path prefixes that are never games: OS internals produce
/// constant churn and have historically matched loosely-named short entries.
const EXCLUDED_PREFIXES: &[&str] = &[
    "/proc/",
    "/sys/",
    "/dev/",
    "/usr/lib/",
    "/usr/libexec/",
    "/system/library/",
    "c:/windows/",
];

/// Known false positives by bare filename. The KDE file manager shares its
/// name with a GameCube emulator's database entry.
const DENY_LIST: &[&str] = &["dolphin"];

/// One game currently visible in the process table. `timestamp` is the wall
/// clock (ms) at which the current uninterrupted detection streak began; it
/// stays fixed across scans and is regenerated when the game is re-detected
/// after a gap.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedGame {
    pub id: String,
    pub name: String,
    pub pid: u32,
    pub timestamp: i64,
}

/// Activity transitions produced by the per-scan diff. Within one scan every
/// `Set` precedes every `Clear`.
#[derive(Debug, Clone, PartialEq)]
pub enum ActivityEvent {
    Set(DetectedGame),
    Clear { game_id: String, pid: u32 },
}

/// Memoized match outcome for one process signature. Pid and timestamp are
/// refreshed from live state on reuse, so only the identity is stored. A
/// signature caches every game it matched (shared interpreter entries map one
/// process to several); an empty list is a cached non-match.
#[derive(Debug, Clone)]
struct CachedMatch {
    game_id: String,
    name: String,
}

/// The detection engine: owns the index, the scan cache, and the active-game
/// state. All three are mutated only inside [`Engine::scan`], which runs in a
/// single task; transports see its output purely as events.
pub struct Engine {
    index: DetectionIndex,
    cache: HashMap<String, Vec<CachedMatch>>,
    timestamps: HashMap<String, i64>,
    names: HashMap<String, String>,
    pids: HashMap<String, u32>,
    scanning: AtomicBool,
    last_scan_start: Option<Instant>,
}

impl Engine {
    pub fn new(index: DetectionIndex) -> Self {
        Self {
            index,
            cache: HashMap::new(),
            timestamps: HashMap::new(),
            names: HashMap::new(),
            pids: HashMap::new(),
            scanning: AtomicBool::new(false),
            last_scan_start: None,
        }
    }

    /// Replaces the database and rebuilds the index wholesale. Cached match
    /// results were computed against the old database and are discarded.
    pub fn replace_database(&mut self, games: Vec<Game>) {
        self.index = DetectionIndex::build(games);
        self.cache.clear();
        println!(
            "[engine] Detection index rebuilt: {} games",
            self.index.game_count()
        );
    }

    /// Runs one guarded scan: at most one in flight, and no two starts within
    /// [`MIN_SCAN_SPACING`]. Returns `None` when the scan was dropped or the
    /// process listing failed (partial results are discarded either way).
    pub fn run_scan(
        &mut self,
        source: &mut dyn ProcessSource,
        now_ms: i64,
    ) -> Option<Vec<ActivityEvent>> {
        if self.scanning.swap(true, Ordering::SeqCst) {
            return None; // a scan is already in flight
        }
        if let Some(started) = self.last_scan_start {
            if started.elapsed() < MIN_SCAN_SPACING {
                self.scanning.store(false, Ordering::SeqCst);
                return None;
            }
        }
        self.last_scan_start = Some(Instant::now());

        let result = match source.list() {
            Ok(procs) => Some(self.scan(&procs, now_ms)),
            Err(e) => {
                eprintln!("[engine] Process listing failed: {e:#}");
                None
            }
        };
        self.scanning.store(false, Ordering::SeqCst);
        result
    }

    /// The scan critical section: match every process, diff against active
    /// state, emit transitions, and bound the cache.
    pub fn scan(&mut self, procs: &[ProcessRecord], now_ms: i64) -> Vec<ActivityEvent> {
        let mut detected: HashMap<String, (String, u32)> = HashMap::new();
        let mut seen: HashSet<String> = HashSet::with_capacity(procs.len());

        for record in procs {
            let path = normalize(&record.path);
            let cwd = normalize(&record.cwd);
            let joined_args = record.args.join(" ");
            let signature = format!("{path}\0{joined_args} {cwd}");

            if let Some(cached) = self.cache.get(&signature) {
                for hit in cached {
                    detected.insert(hit.game_id.clone(), (hit.name.clone(), record.pid));
                }
                seen.insert(signature);
                continue;
            }
            seen.insert(signature.clone());

            // Excluded processes are rejected outright and never cached.
            if is_excluded(record.pid, &path) {
                continue;
            }

            let filename = path.rsplit('/').next().unwrap_or("").to_string();
            let keys = index::candidate_keys(&filename);
            let mut tried: HashSet<&str> = HashSet::new();
            let mut matches: Vec<CachedMatch> = Vec::new();

            for key in &keys {
                for game in self.index.candidates(key) {
                    // A game matches at most once per process.
                    if !tried.insert(game.id.as_str()) {
                        continue;
                    }
                    let matched = game.executables.iter().any(|exe| {
                        executable_matches(exe, key, &filename, &path, &cwd, &joined_args)
                    });
                    if matched {
                        if config::debug_enabled() {
                            eprintln!(
                                "[engine] pid {} ({filename}) matched {} ({})",
                                record.pid, game.name, game.id
                            );
                        }
                        detected.insert(game.id.clone(), (game.name.clone(), record.pid));
                        matches.push(CachedMatch {
                            game_id: game.id.clone(),
                            name: game.name.clone(),
                        });
                    }
                }
            }

            self.cache.insert(signature, matches);
        }

        let mut events = Vec::with_capacity(detected.len());
        for (id, (name, pid)) in &detected {
            // First scan of a streak records the start time; later scans
            // re-emit with the unchanged timestamp (idempotent refresh).
            let timestamp = *self.timestamps.entry(id.clone()).or_insert(now_ms);
            self.names.insert(id.clone(), name.clone());
            self.pids.insert(id.clone(), *pid);
            events.push(ActivityEvent::Set(DetectedGame {
                id: id.clone(),
                name: name.clone(),
                pid: *pid,
                timestamp,
            }));
        }

        // Clears are computed only after every set above: a single
        // authoritative diff against the previous active set.
        let lost: Vec<String> = self
            .timestamps
            .keys()
            .filter(|id| !detected.contains_key(*id))
            .cloned()
            .collect();
        for id in lost {
            self.timestamps.remove(&id);
            self.names.remove(&id);
            let pid = self.pids.remove(&id).unwrap_or(0);
            events.push(ActivityEvent::Clear { game_id: id, pid });
        }

        // Cache maintenance: once the cache far outgrows the live process
        // set, sweep it down to exactly the signatures seen this scan.
        if self.cache.len() > 2 * seen.len() {
            self.cache.retain(|sig, _| seen.contains(sig));
        }

        events
    }

    #[cfg(test)]
    fn cache_len(&self) -> usize {
        self.cache.len()
    }

    #[cfg(test)]
    fn active_count(&self) -> usize {
        self.timestamps.len()
    }
}

/// Drives the engine: an immediate scan, then one every [`SCAN_INTERVAL`],
/// interleaved with database replacement commands.
pub async fn run(
    mut engine: Engine,
    mut source: Box<dyn ProcessSource>,
    events: mpsc::Sender<DaemonEvent>,
    mut commands: mpsc::Receiver<EngineCommand>,
) {
    let mut ticker = interval(SCAN_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now_ms = Utc::now().timestamp_millis();
                let Some(transitions) = engine.run_scan(source.as_mut(), now_ms) else {
                    continue;
                };
                for transition in transitions {
                    if events.send(DaemonEvent::Activity(transition)).await.is_err() {
                        return;
                    }
                }
            }
            cmd = commands.recv() => match cmd {
                Some(EngineCommand::ReplaceDatabase(games)) => engine.replace_database(games),
                None => return,
            }
        }
    }
}

fn normalize(path: &str) -> String {
    path.to_lowercase().replace('\\', "/")
}

fn is_excluded(pid: u32, path: &str) -> bool {
    if pid == 1 || path.is_empty() {
        return true;
    }
    if EXCLUDED_PREFIXES.iter().any(|p| path.starts_with(p)) {
        return true;
    }
    if path.contains("systemd") || path.contains("crashpad") {
        return true;
    }
    let filename = path.rsplit('/').next().unwrap_or(path);
    DENY_LIST.contains(&filename)
}

/// Per-executable match test; the first executable of a game that passes
/// yields the match. Strict entries allow exact filename equality only.
fn executable_matches(
    exe: &Executable,
    candidate_key: &str,
    filename: &str,
    path: &str,
    cwd: &str,
    args: &str,
) -> bool {
    if let Some(required) = &exe.arguments {
        if !args.to_lowercase().contains(&required.to_lowercase()) {
            return false;
        }
    }
    if exe.strict {
        return exe.name == filename;
    }
    exe.name == filename
        || exe.name == index::strip_exe(filename)
        || exe.name == format!("{filename}.exe")
        // Database entries that encode a relative sub-path ("bin/game").
        || format!("{cwd}/{path}").contains(&format!("/{}", exe.name))
        || exe.name == candidate_key
}
