use std::{
    fs,
    io::{self, Read},
    path::{Path, PathBuf},
    process::{Command, Stdio},
    thread::{self, sleep, JoinHandle},
    time::{Duration, Instant},
};
use model_plugin::{plugin::PARAM_PROPERTIES, ModelPackage, ModelRepository, PluginArgs, PluginClass, PluginError};
use tracing::{debug, info, warn};

pub const PROP_REPO_URL: &str = "repoUrl";
pub const PROP_TIMEOUT_SECONDS: &str = "timeoutSeconds";
pub const PROP_RETRIES: &str = "retries";
pub const PROP_RETRY_DELAY_MS: &str = "retryDelayMs";

const DEFAULT_TIMEOUT_SECONDS: u64 = 60;
const DEFAULT_RETRIES: usize = 1;
const DEFAULT_RETRY_DELAY_MS: u64 = 500;
const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Stderr kept for error messages; the rest is read and dropped.
const MAX_STDERR_BYTES: u64 = 64 * 1024;

/// Checks packages out of a git repository at a pinned ref (tag, branch or
/// commit), using the `git` executable.
#[derive(Debug, Clone)]
pub struct GitRepository {
    repo_url: String,
    timeout: Duration,
    retries: usize,
    retry_delay: Duration,
}

fn parse_property<T: std::str::FromStr>(args: &PluginArgs, key: &str, default: T) -> Result<T, PluginError> {
    match args.optional_property(key)? {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| PluginError::Config(format!("property `{key}` has invalid value `{raw}`"))),
        None => Ok(default),
    }
}

impl GitRepository {
    pub fn new(repo_url: &str) -> Self {
        Self {
            repo_url: repo_url.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECONDS),
            retries: DEFAULT_RETRIES,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retries: usize, delay: Duration) -> Self {
        self.retries = retries;
        self.retry_delay = delay;
        self
    }

    pub fn plugin_class() -> PluginClass<dyn ModelRepository> {
        PluginClass::new("GitRepository", &[PARAM_PROPERTIES], |args| {
            let repo = GitRepository::new(&args.require_property(PROP_REPO_URL)?)
                .with_timeout(Duration::from_secs(parse_property(args, PROP_TIMEOUT_SECONDS, DEFAULT_TIMEOUT_SECONDS)?))
                .with_retry(
                    parse_property(args, PROP_RETRIES, DEFAULT_RETRIES)?,
                    Duration::from_millis(parse_property(args, PROP_RETRY_DELAY_MS, DEFAULT_RETRY_DELAY_MS)?),
                );
            Ok(Box::new(repo) as Box<dyn ModelRepository>)
        })
    }

    /// Run one git command, killing it when it outlives the timeout.
    fn git(&self, dir: &Path, args: &[&str]) -> Result<(), PluginError> {
        let mut command = Command::new("git");
        command.args(args).current_dir(dir).env("GIT_TERMINAL_PROMPT", "0");
        run_with_timeout(command, self.timeout)
            .map_err(|e| match e {
                PluginError::Checkout(stderr) => PluginError::Checkout(format!("git {} failed: {stderr}", args.join(" "))),
                other => other,
            })
    }

    fn checkout_once(&self, package: &ModelPackage, checkout_dir: &Path) -> Result<(), PluginError> {
        self.git(checkout_dir, &["init", "--quiet"])?;
        self.git(checkout_dir, &["fetch", "--quiet", "--depth", "1", &self.repo_url, &package.version])?;
        self.git(checkout_dir, &["checkout", "--quiet", "--detach", "FETCH_HEAD"])
    }

    fn clear(checkout_dir: &Path) -> Result<(), PluginError> {
        for entry in fs::read_dir(checkout_dir)? {
            let path = entry?.path();
            if path.is_dir() {
                fs::remove_dir_all(&path)?;
            } else {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}

/// Read `pipe` to its end on its own thread so the child never blocks on a
/// full stderr pipe. Only the first [`MAX_STDERR_BYTES`] are kept.
fn drain(mut pipe: impl Read + Send + 'static) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut kept = Vec::new();
        let _ = pipe.by_ref().take(MAX_STDERR_BYTES).read_to_end(&mut kept);
        let _ = io::copy(&mut pipe, &mut io::sink());
        String::from_utf8_lossy(&kept).into_owned()
    })
}

/// Run `command` with no stdin or stdout, killing it once `timeout` passes.
/// A non-zero exit is a `Checkout` error carrying the command's stderr.
fn run_with_timeout(mut command: Command, timeout: Duration) -> Result<(), PluginError> {
    let mut child = command.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::piped()).spawn()?;
    let stderr = child.stderr.take().map(drain);

    let started = Instant::now();
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if started.elapsed() >= timeout {
            let _ = child.kill();
            let _ = child.wait();
            return Err(PluginError::Timeout(timeout.as_millis() as u64));
        }
        sleep(POLL_INTERVAL);
    };

    let stderr = stderr.and_then(|handle| handle.join().ok()).unwrap_or_default();
    if status.success() {
        return Ok(());
    }
    Err(PluginError::Checkout(stderr.trim().to_string()))
}

impl ModelRepository for GitRepository {
    fn checkout(&self, package: &ModelPackage, checkout_dir: &Path) -> Result<Option<PathBuf>, PluginError> {
        info!(%package, url = %self.repo_url, "git checkout");
        let mut attempt = 0;

        let result = loop {
            match self.checkout_once(package, checkout_dir) {
                Ok(()) => break Ok(()),
                Err(err) if err.is_transient() && attempt < self.retries => {
                    attempt += 1;
                    warn!(%package, attempt, error = %err, "git checkout failed, retrying");
                    sleep(self.retry_delay);
                    Self::clear(checkout_dir)?;
                }
                Err(err) => break Err(err),
            }
        };

        match result {
            Ok(()) => {
                debug!(%package, attempts = attempt + 1, "git checkout complete");
                self.get_checkout_path(package, checkout_dir)
            }
            Err(err) => Err(PluginError::Checkout(format!("{} after {} attempt(s): {err}", self.repo_url, attempt + 1))),
        }
    }

    fn get_checkout_path(&self, package: &ModelPackage, checkout_dir: &Path) -> Result<Option<PathBuf>, PluginError> {
        Ok(Some(match &package.path {
            Some(path) => checkout_dir.join(path),
            None => checkout_dir.to_path_buf(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model_plugin::ModelDescriptor;

    fn git_available() -> bool {
        Command::new("git").arg("--version").output().map(|o| o.status.success()).unwrap_or(false)
    }

    fn run(dir: &Path, args: &[&str]) {
        let status = Command::new("git").args(args).current_dir(dir).status().unwrap();
        assert!(status.success(), "git {args:?}");
    }

    #[test]
    fn checkout_fetches_the_pinned_ref() {
        if !git_available() {
            return;
        }
        let origin = tempfile::tempdir().unwrap();
        fs::create_dir_all(origin.path().join("src/hello")).unwrap();
        fs::write(origin.path().join("src/hello/mod.rhai"), "export const X = 1;").unwrap();
        run(origin.path(), &["init", "--quiet"]);
        run(origin.path(), &["add", "."]);
        run(origin.path(), &["-c", "user.name=t", "-c", "user.email=t@example.com", "commit", "--quiet", "-m", "init"]);
        run(origin.path(), &["tag", "v1.0"]);

        let url = origin.path().to_string_lossy().to_string();
        let repo = GitRepository::new(&url);
        let package = ModelDescriptor::new("git", "hello", "v1.0", "hello.X").with_path("src").package();
        let checkout = tempfile::tempdir().unwrap();

        let path = repo.checkout(&package, checkout.path()).unwrap().unwrap();
        assert_eq!(path, checkout.path().join("src"));
        assert!(path.join("hello/mod.rhai").is_file());
    }

    #[test]
    fn failed_checkout_is_retried_then_reported() {
        if !git_available() {
            return;
        }
        let missing = tempfile::tempdir().unwrap();
        let url = missing.path().join("no-such-repo").to_string_lossy().to_string();
        let repo = GitRepository::new(&url).with_retry(1, Duration::from_millis(1));
        let package = ModelDescriptor::new("git", "hello", "v9", "hello.X").package();
        let checkout = tempfile::tempdir().unwrap();

        let err = repo.checkout(&package, checkout.path()).unwrap_err();
        assert!(err.to_string().contains("2 attempt(s)"), "{err}");
    }

    #[cfg(unix)]
    fn shell(script: &str) -> Command {
        let mut command = Command::new("sh");
        command.args(["-c", script]);
        command
    }

    #[cfg(unix)]
    #[test]
    fn large_stderr_does_not_stall_the_command() {
        // far more than a pipe buffer of stderr before a failing exit
        let chatty = shell("i=0; while [ $i -lt 4000 ]; do echo 'warning: something noisy happened here' >&2; i=$((i+1)); done; exit 3");
        let started = Instant::now();
        let err = run_with_timeout(chatty, Duration::from_secs(20)).unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(20));
        match err {
            PluginError::Checkout(stderr) => {
                assert!(stderr.starts_with("warning: something noisy"));
                assert!(stderr.len() as u64 <= MAX_STDERR_BYTES);
            }
            other => panic!("expected a checkout error, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn slow_commands_are_killed_at_the_timeout() {
        let err = run_with_timeout(shell("sleep 5"), Duration::from_millis(200)).unwrap_err();
        assert!(matches!(err, PluginError::Timeout(200)));
        assert!(run_with_timeout(shell("exit 0"), Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn properties_configure_the_retry_policy() {
        let config = model_plugin::PluginConfig::new("git")
            .with_property(PROP_REPO_URL, "https://example.com/models.git")
            .with_property(PROP_RETRIES, "3")
            .with_property(PROP_TIMEOUT_SECONDS, "5");
        let args = PluginArgs::for_declared(&[PARAM_PROPERTIES.to_string()], "models", &config);
        assert_eq!(parse_property(&args, PROP_RETRIES, DEFAULT_RETRIES).unwrap(), 3);
        assert_eq!(parse_property(&args, PROP_RETRY_DELAY_MS, DEFAULT_RETRY_DELAY_MS).unwrap(), 500);

        let bad = config.with_property(PROP_RETRIES, "lots");
        let args = PluginArgs::for_declared(&[PARAM_PROPERTIES.to_string()], "models", &bad);
        assert!(parse_property(&args, PROP_RETRIES, DEFAULT_RETRIES).is_err());
    }
}
