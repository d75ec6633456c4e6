use std::collections::HashMap;

use crate::db::Game;

/// Precomputed lookup from normalized executable key to candidate games.
///
/// Many-to-many: one key can name several games and one game is reachable via
/// several keys (exact name, extension-less name, bitness-stripped name).
/// Rebuilt in full whenever the database refreshes, never mutated in place.
pub struct DetectionIndex {
    games: Vec<Game>,
    by_key: HashMap<String, Vec<usize>>,
}

impl DetectionIndex {
    pub fn build(games: Vec<Game>) -> Self {
        let mut by_key: HashMap<String, Vec<usize>> = HashMap::new();

        for (idx, game) in games.iter().enumerate() {
            for exe in &game.executables {
                // Entries that encode a relative sub-path ("bin/game") are
                // indexed by their last segment; the match test re-checks the
                // full sub-path against cwd + path.
                let segment = exe.name.rsplit('/').next().unwrap_or(&exe.name);
                for key in [
                    segment.to_string(),
                    strip_exe(segment).to_string(),
                    strip_bitness(segment),
                ] {
                    let slot = by_key.entry(key).or_default();
                    if slot.last() != Some(&idx) {
                        slot.push(idx);
                    }
                }
            }
        }

        Self { games, by_key }
    }

    /// Games reachable from one normalized candidate key.
    pub fn candidates(&self, key: &str) -> impl Iterator<Item = &Game> {
        self.by_key
            .get(key)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
            .iter()
            .map(|&idx| &self.games[idx])
    }

    pub fn game_count(&self) -> usize {
        self.games.len()
    }
}

/// Strips a single trailing ".exe".
pub fn strip_exe(name: &str) -> &str {
    name.strip_suffix(".exe").unwrap_or(name)
}

/// Removes every occurrence of the bitness tokens ".x64", "_64", "x64", "64".
pub fn strip_bitness(name: &str) -> String {
    let mut out = name.to_string();
    for token in [".x64", "_64", "x64", "64"] {
        out = out.replace(token, "");
    }
    out
}

/// Candidate lookup keys for one process filename: the bare name, the
/// extension-less name, the bitness-stripped name, and both combined.
/// Order is preserved and duplicates removed.
pub fn candidate_keys(filename: &str) -> Vec<String> {
    let stripped = strip_bitness(filename);
    let mut keys = vec![
        filename.to_string(),
        strip_exe(filename).to_string(),
        stripped.clone(),
        strip_exe(&stripped).to_string(),
    ];
    let mut seen = std::collections::HashSet::new();
    keys.retain(|k| seen.insert(k.clone()));
    keys
}
