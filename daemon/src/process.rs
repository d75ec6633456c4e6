use anyhow::Result;

/// One running process as reported by a scanner. `path` is the executable
/// path as the OS reports it; normalization happens in the engine.
#[derive(Debug, Clone)]
pub struct ProcessRecord {
    pub pid: u32,
    pub path: String,
    pub args: Vec<String>,
    pub cwd: String,
}

/// Uniform process-listing contract; one implementation is selected per host
/// OS at startup. Each call returns a full snapshot of the process table.
pub trait ProcessSource: Send {
    fn list(&mut self) -> Result<Vec<ProcessRecord>>;
}

/// Selects the scanner for the host OS. An unsupported platform is a fatal
/// startup error.
#[cfg(target_os = "linux")]
pub fn platform_source() -> Result<Box<dyn ProcessSource>> {
    Ok(Box::new(ProcfsSource))
}

#[cfg(any(target_os = "windows", target_os = "macos"))]
pub fn platform_source() -> Result<Box<dyn ProcessSource>> {
    Ok(Box::new(SysinfoSource::new()))
}

#[cfg(not(any(target_os = "linux", target_os = "windows", target_os = "macos")))]
pub fn platform_source() -> Result<Box<dyn ProcessSource>> {
    anyhow::bail!("no process scanner for platform {}", std::env::consts::OS)
}

/// Direct /proc reader. Cheaper than a full sysinfo refresh for the once-per-
/// scan snapshot, and reports cmdline arguments and cwd exactly.
#[cfg(target_os = "linux")]
pub struct ProcfsSource;

#[cfg(target_os = "linux")]
impl ProcessSource for ProcfsSource {
    fn list(&mut self) -> Result<Vec<ProcessRecord>> {
        let mut records = Vec::new();

        for entry in std::fs::read_dir("/proc")? {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };
            let pid: u32 = match entry.file_name().to_string_lossy().parse() {
                Ok(pid) => pid,
                Err(_) => continue, // not a process directory
            };

            let proc_dir = entry.path();
            let cmdline = match std::fs::read(proc_dir.join("cmdline")) {
                Ok(bytes) => bytes,
                Err(_) => continue, // exited or inaccessible
            };
            let mut parts = cmdline
                .split(|&b| b == 0)
                .filter(|s| !s.is_empty())
                .map(|s| String::from_utf8_lossy(s).into_owned());

            // Prefer the exe symlink; kernel threads and permission-denied
            // entries fall back to argv[0].
            let argv0 = parts.next();
            let path = match std::fs::read_link(proc_dir.join("exe")) {
                Ok(target) => target.to_string_lossy().into_owned(),
                Err(_) => match argv0 {
                    Some(p) => p,
                    None => continue,
                },
            };
            let cwd = std::fs::read_link(proc_dir.join("cwd"))
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default();

            records.push(ProcessRecord {
                pid,
                path,
                args: parts.collect(),
                cwd,
            });
        }

        Ok(records)
    }
}

/// Portable scanner backed by the sysinfo crate (Windows and macOS).
pub struct SysinfoSource {
    sys: sysinfo::System,
}

impl SysinfoSource {
    pub fn new() -> Self {
        Self {
            sys: sysinfo::System::new(),
        }
    }
}

impl ProcessSource for SysinfoSource {
    fn list(&mut self) -> Result<Vec<ProcessRecord>> {
        self.sys
            .refresh_processes(sysinfo::ProcessesToUpdate::All, true);

        let records = self
            .sys
            .processes()
            .iter()
            .map(|(pid, proc_)| {
                let path = proc_
                    .exe()
                    .map(|p| p.to_string_lossy().into_owned())
                    .unwrap_or_else(|| proc_.name().to_string_lossy().into_owned());
                let args = proc_
                    .cmd()
                    .iter()
                    .skip(1)
                    .map(|a| a.to_string_lossy().into_owned())
                    .collect();
                let cwd = proc_
                    .cwd()
                    .map(|p| p.to_string_lossy().into_owned())
                    .unwrap_or_default();
                ProcessRecord {
                    pid: pid.as_u32(),
                    path,
                    args,
                    cwd,
                }
            })
            .collect();

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_os = "linux")]
    #[test]
    fn procfs_source_lists_this_process() {
        let mut source = ProcfsSource;
        let records = source.list().unwrap();
        let me = std::process::id();
        assert!(records.iter().any(|r| r.pid == me));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn procfs_records_have_nonempty_paths() {
        let mut source = ProcfsSource;
        let records = source.list().unwrap();
        let me = std::process::id();
        let record = records.iter().find(|r| r.pid == me).unwrap();
        assert!(!record.path.is_empty());
    }

    #[test]
    fn platform_source_is_available_here() {
        // Build hosts are one of the three supported platforms.
        assert!(platform_source().is_ok());
    }
}
