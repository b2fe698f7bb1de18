use std::fs;
use std::io::{BufReader, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{mpsc, Arc, Mutex, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use regex::Regex;

/// Compile `pattern` once into `cell`. Patterns are literals, so `None` only means a typo
/// that the module's tests catch.
pub fn cached_regex(cell: &'static OnceLock<Option<Regex>>, pattern: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern).ok()).as_ref()
}

pub fn truncate(s: &str, max: usize) -> String {
    if max == 0 {
        return String::new();
    }

    let char_count = s.chars().count();
    if char_count <= max {
        return s.to_string();
    }

    if max <= 3 {
        return s.chars().take(max).collect();
    }

    let truncated: String = s.chars().take(max - 3).collect();
    format!("{}...", truncated)
}

/// Keep the last `max_chars` characters. Compiler errors live at the end of build logs.
pub fn tail_chars(s: &str, max_chars: usize) -> String {
    if max_chars == 0 {
        return String::new();
    }
    let count = s.chars().count();
    if count <= max_chars {
        return s.to_string();
    }
    s.chars()
        .skip(count.saturating_sub(max_chars))
        .collect::<String>()
}

#[derive(Debug)]
pub struct CommandRunResult {
    pub status: Option<ExitStatus>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl CommandRunResult {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.map(|s| s.success()).unwrap_or(false)
    }

    /// stdout followed by stderr, the single blob build-error scanning works on.
    pub fn combined(&self) -> String {
        let mut out = String::with_capacity(self.stdout.len() + self.stderr.len() + 1);
        out.push_str(&self.stdout);
        if !self.stdout.is_empty() && !self.stderr.is_empty() && !self.stdout.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(&self.stderr);
        out
    }
}

/// How long pipe readers get to finish once the child is gone. A grandchild that
/// inherited the pipes can keep them open indefinitely.
const PIPE_GRACE: Duration = Duration::from_millis(500);

struct PipeDrain {
    buf: Arc<Mutex<Vec<u8>>>,
    done: mpsc::Receiver<()>,
}

impl PipeDrain {
    fn spawn<R: Read + Send + 'static>(pipe: R) -> Self {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&buf);
        let (tx, done) = mpsc::channel();
        thread::spawn(move || {
            let mut reader = BufReader::new(pipe);
            let mut chunk = [0u8; 8192];
            loop {
                match reader.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => {
                        if let Ok(mut buf) = sink.lock() {
                            buf.extend_from_slice(&chunk[..n]);
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
            let _ = tx.send(());
        });
        Self { buf, done }
    }

    /// Whatever was read by `until`, complete or not.
    fn collect(self, until: Instant) -> String {
        let _ = self
            .done
            .recv_timeout(until.saturating_duration_since(Instant::now()));
        let bytes = self.buf.lock().map(|b| b.clone()).unwrap_or_default();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// Kill the child and, on unix, every process in its group.
fn kill_process_tree(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Ok(pid) = i32::try_from(child.id()) {
            // The child leads its own group (see `process_group(0)` below).
            unsafe {
                let _ = libc::kill(-pid, libc::SIGKILL);
            }
        }
    }
    let _ = child.kill();
}

/// Run a command to completion, killing it and everything it spawned once `timeout`
/// elapses.
///
/// Output pipes are drained on helper threads so a chatty child can't deadlock
/// on a full pipe while we poll for exit. Those threads are never joined: after
/// the child exits they get `PIPE_GRACE` to finish, and partial output is kept.
pub fn run_command_with_timeout(
    command: &mut Command,
    timeout: Duration,
) -> Result<CommandRunResult, String> {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| format!("Failed to start command: {}", e))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| "Failed to capture stdout".to_string())?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| "Failed to capture stderr".to_string())?;

    let stdout_drain = PipeDrain::spawn(stdout);
    let stderr_drain = PipeDrain::spawn(stderr);

    let start = Instant::now();
    let mut timed_out = false;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) => {
                if start.elapsed() >= timeout {
                    timed_out = true;
                    kill_process_tree(&mut child);
                    match child.wait() {
                        Ok(status) => break Some(status),
                        Err(_) => break None,
                    }
                }
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                kill_process_tree(&mut child);
                return Err(format!("Failed to wait for command: {}", e));
            }
        }
    };

    let until = Instant::now() + PIPE_GRACE;
    Ok(CommandRunResult {
        status,
        stdout: stdout_drain.collect(until),
        stderr: stderr_drain.collect(until),
        timed_out,
    })
}

/// A path inside the project tree, both as written to disk and as the model named it.
pub struct ProjectPath {
    pub absolute: PathBuf,
    pub relative: PathBuf,
}

/// Returns true for relative, non-empty paths with no `..`, root or drive components.
pub fn is_safe_relative_path(candidate: &Path) -> bool {
    if candidate.as_os_str().is_empty() {
        return false;
    }
    if candidate.to_string_lossy().contains('\0') {
        return false;
    }
    let mut has_normal = false;
    for component in candidate.components() {
        match component {
            Component::Normal(_) => has_normal = true,
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return false,
        }
    }
    has_normal
}

/// Resolve a (possibly not yet existing) file beneath `root`, refusing anything that
/// would land outside it, including through a symlinked parent directory.
pub fn resolve_project_path_allow_new(root: &Path, candidate: &Path) -> Result<ProjectPath, String> {
    if !is_safe_relative_path(candidate) {
        return Err(format!(
            "Refusing unsafe project path: {}",
            candidate.display()
        ));
    }

    let root = root
        .canonicalize()
        .map_err(|e| format!("Failed to resolve project root: {}", e))?;
    let joined = root.join(candidate);
    let parent = joined
        .parent()
        .ok_or_else(|| format!("Invalid path: {}", candidate.display()))?;
    let parent_canon = canonicalize_existing_parent(parent)?;

    if !parent_canon.starts_with(&root) {
        return Err(format!("Path escapes project: {}", candidate.display()));
    }

    Ok(ProjectPath {
        absolute: joined,
        relative: candidate.to_path_buf(),
    })
}

fn canonicalize_existing_parent(path: &Path) -> Result<PathBuf, String> {
    let mut current = path.to_path_buf();
    while !current.exists() {
        if !current.pop() {
            return Err("Path has no existing parent".to_string());
        }
    }
    current
        .canonicalize()
        .map_err(|e| format!("Failed to resolve path {}: {}", current.display(), e))
}

/// Write `content` to a sibling temp file and rename it over `path`, so a crash
/// mid-write never leaves a half-written file behind.
pub fn write_atomic(path: &Path, content: &str) -> std::io::Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".to_string());
    let tmp_path = path.with_file_name(format!(".{}.genforge-tmp", file_name));

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp_path)?;
    file.write_all(content.as_bytes())?;
    file.sync_all()?;
    drop(file);

    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_unicode_safe() {
        let input = "ééééé";
        assert_eq!(truncate(input, 4), "é...");
        assert_eq!(truncate(input, 0), "");
    }

    #[test]
    fn test_tail_chars_keeps_end() {
        assert_eq!(tail_chars("abcdef", 3), "def");
        assert_eq!(tail_chars("ab", 3), "ab");
        assert_eq!(tail_chars("ab", 0), "");
    }

    #[test]
    fn test_safe_relative_path_rules() {
        assert!(is_safe_relative_path(Path::new("src/app/page.tsx")));
        assert!(is_safe_relative_path(Path::new("./package.json")));
        assert!(!is_safe_relative_path(Path::new("")));
        assert!(!is_safe_relative_path(Path::new(".")));
        assert!(!is_safe_relative_path(Path::new("../escape.ts")));
        assert!(!is_safe_relative_path(Path::new("src/../../escape.ts")));
        assert!(!is_safe_relative_path(Path::new("/etc/passwd")));
    }

    #[test]
    fn test_resolve_project_path_allow_new_accepts_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let candidate = PathBuf::from("new_dir/new_file.ts");
        let resolved = resolve_project_path_allow_new(dir.path(), &candidate).unwrap();
        assert_eq!(resolved.relative, candidate);
        assert!(resolved.absolute.ends_with("new_dir/new_file.ts"));
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_project_path_rejects_symlink_escape() {
        let outside = tempfile::tempdir().unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();
        let err = resolve_project_path_allow_new(dir.path(), Path::new("link/evil.ts"));
        assert!(err.is_err());
    }

    #[test]
    fn test_write_atomic_replaces_content_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("package.json");
        write_atomic(&path, "{}").unwrap();
        write_atomic(&path, "{\"name\":\"x\"}").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "{\"name\":\"x\"}");
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("genforge-tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_run_command_with_timeout_kills_slow_command() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "sleep 5"]);
        let start = Instant::now();
        let result = run_command_with_timeout(&mut cmd, Duration::from_millis(200)).unwrap();
        assert!(result.timed_out);
        assert!(!result.success());
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[cfg(unix)]
    #[test]
    fn test_timeout_kills_grandchildren_holding_the_pipes() {
        // `sh` forks `sleep`, which inherits stdout; killing only `sh` would leave the
        // reader blocked until `sleep` exits.
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo starting; sleep 6; echo done"]);
        let start = Instant::now();
        let result = run_command_with_timeout(&mut cmd, Duration::from_secs(1)).unwrap();
        let elapsed = start.elapsed();
        assert!(result.timed_out);
        assert!(elapsed < Duration::from_secs(4), "took {:?}", elapsed);
        assert!(result.stdout.contains("starting"));
        assert!(!result.stdout.contains("done"));
    }

    #[cfg(unix)]
    #[test]
    fn test_background_child_does_not_hold_up_a_finished_command() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "sleep 6 & echo launched"]);
        let start = Instant::now();
        let result = run_command_with_timeout(&mut cmd, Duration::from_secs(10)).unwrap();
        assert!(result.success());
        assert!(start.elapsed() < Duration::from_secs(4));
        assert!(result.stdout.contains("launched"));
    }

    #[cfg(unix)]
    #[test]
    fn test_run_command_combines_streams() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo out; echo err 1>&2; exit 3"]);
        let result = run_command_with_timeout(&mut cmd, Duration::from_secs(10)).unwrap();
        assert!(!result.success());
        let combined = result.combined();
        assert!(combined.contains("out"));
        assert!(combined.contains("err"));
    }
}
