use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Instant;

use async_trait::async_trait;
use regex::Regex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::debug;

use super::{CodeSandbox, SandboxError, SandboxLimits, SandboxOutput};
use crate::config::SandboxConfig;
use crate::dataset::Dataset;

/// The only directories searched for the interpreter and launchers.
const SAFE_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

const DATASET_FILE: &str = "dataset.json";

/// Where the scratch directory is mounted inside the namespace.
const ISOLATED_WORKDIR: &str = "/work";

/// Read-only system paths visible inside the namespace. Nothing else of the
/// host file system is mounted.
const SYSTEM_PATHS: &[&str] = &[
    "/usr",
    "/bin",
    "/sbin",
    "/lib",
    "/lib32",
    "/lib64",
    "/etc/alternatives",
    "/etc/ld.so.cache",
];

/// Modules generated analysis code may import.
const ALLOWED_MODULES: &[&str] = &[
    "pandas",
    "numpy",
    "scipy",
    "sklearn",
    "math",
    "statistics",
    "json",
    "collections",
    "itertools",
    "datetime",
];

/// Submodules of allowed packages that exist to read or write files.
const BLOCKED_SUBMODULES: &[&str] = &["scipy.io", "pandas.io", "numpy.lib.npyio", "sklearn.datasets"];

/// Loads the dataset into `df` ahead of the generated code.
const PYTHON_PRELUDE: &str = r#"import json
import pandas as pd

with open("dataset.json") as _fh:
    _payload = json.load(_fh)
df = pd.DataFrame(_payload["rows"], columns=_payload["columns"])
del _fh, _payload
"#;

/// Runs generated code in a child process.
pub struct ProcessSandbox {
    interpreter: Vec<String>,
    prelude: Option<String>,
    script_name: String,
    screen_python: bool,
    isolate: bool,
    limit_memory: bool,
    /// Search path for `bwrap` and `prlimit`.
    tool_path: String,
}

fn import_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?m)^\s*(?:from\s+([\w\.]+)\s+import\s+([^#\n]+)|import\s+([^#\n]+))")
            .expect("valid import regex")
    })
}

fn blocked_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?:^|[^\.\w])(open|eval|exec|compile|input|breakpoint|globals|locals|vars|getattr|setattr|delattr)\s*\(|__\w+__|\b(os|sys|io|subprocess|socket|shutil|importlib|ctypes|pathlib|urllib|http|pickle|glob|tempfile)\s*\.",
        )
        .expect("valid blocked-call regex")
    })
}

/// Library calls that read or write files or URLs: the pandas readers and
/// file writers, the numpy loaders and savers, and the scipy matrix formats.
fn io_call_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"\b(read_\w+|to_(?:csv|excel|parquet|pickle|feather|hdf|sql|stata|orc|xml|clipboard)|load|loadtxt|genfromtxt|fromfile|fromregex|save|savez|savez_compressed|savetxt|tofile|memmap|DataSource|ExcelWriter|HDFStore|loadmat|savemat|mmread|mmwrite)\s*\(",
        )
        .expect("valid io-call regex")
    })
}

fn check_module(module: &str) -> Result<(), SandboxError> {
    let root = module.split('.').next().unwrap_or(module);
    if !ALLOWED_MODULES.contains(&root) {
        return Err(SandboxError::Disallowed(format!("import of module '{root}'")));
    }
    let blocked = BLOCKED_SUBMODULES
        .iter()
        .find(|sub| module == **sub || module.starts_with(&format!("{sub}.")));
    match blocked {
        Some(sub) => Err(SandboxError::Disallowed(format!("import of module '{sub}'"))),
        None => Ok(()),
    }
}

/// Static screen for Python code: imports outside the allowed modules and
/// escape hatches (file access, dynamic evaluation, dunder access) are
/// refused before anything runs.
pub fn screen_python(code: &str) -> Result<(), SandboxError> {
    for caps in import_pattern().captures_iter(code) {
        let modules: Vec<String> = match (caps.get(1), caps.get(2), caps.get(3)) {
            // `from pkg import a, b` imports `pkg` and may name submodules `pkg.a`, `pkg.b`.
            (Some(from), Some(names), _) => std::iter::once(from.as_str().to_string())
                .chain(
                    names
                        .as_str()
                        .trim_matches(|c: char| c == '(' || c == ')' || c.is_whitespace())
                        .split(',')
                        .filter_map(|part| part.split_whitespace().next())
                        .map(|name| format!("{}.{name}", from.as_str())),
                )
                .collect(),
            (_, _, Some(list)) => list
                .as_str()
                .split(',')
                .filter_map(|part| part.split_whitespace().next())
                .map(str::to_string)
                .collect(),
            _ => continue,
        };
        for module in &modules {
            check_module(module)?;
        }
    }

    for pattern in [blocked_pattern(), io_call_pattern()] {
        if let Some(found) = pattern.find(code) {
            return Err(SandboxError::Disallowed(format!(
                "use of '{}'",
                found.as_str().trim_start_matches(|c: char| !c.is_alphanumeric() && c != '_')
            )));
        }
    }
    Ok(())
}

fn find_program(search_path: &str, name: &str) -> Option<PathBuf> {
    search_path
        .split(':')
        .map(|dir| Path::new(dir).join(name))
        .find(|candidate| candidate.is_file())
}

/// Read at most `max` bytes, reporting whether the stream had more. The
/// reader is dropped on return, closing the pipe for the writer.
async fn read_capped<R: AsyncRead + Unpin>(reader: Option<R>, max: usize) -> io::Result<(Vec<u8>, bool)> {
    let mut buf = Vec::new();
    if let Some(reader) = reader {
        reader.take(max as u64 + 1).read_to_end(&mut buf).await?;
    }
    let truncated = buf.len() > max;
    buf.truncate(max);
    Ok((buf, truncated))
}

/// Last lines of stderr, where interpreters put the actual error.
fn error_tail(stderr: &str, lines: usize) -> String {
    let collected: Vec<&str> = stderr.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = collected.len().saturating_sub(lines);
    collected[start..].join("\n")
}

impl ProcessSandbox {
    /// Python sandbox per configuration: import screening, dataset prelude,
    /// memory limit and namespace isolation.
    pub fn python(config: &SandboxConfig) -> Self {
        Self {
            interpreter: config.interpreter.clone(),
            prelude: Some(PYTHON_PRELUDE.to_string()),
            script_name: "analysis.py".to_string(),
            screen_python: true,
            isolate: config.isolate,
            limit_memory: true,
            tool_path: SAFE_PATH.to_string(),
        }
    }

    /// Bare interpreter without screening, prelude or launchers.
    pub fn with_interpreter(interpreter: Vec<String>, script_name: &str) -> Self {
        Self {
            interpreter,
            prelude: None,
            script_name: script_name.to_string(),
            screen_python: false,
            isolate: false,
            limit_memory: false,
            tool_path: SAFE_PATH.to_string(),
        }
    }

    pub fn with_tool_path(mut self, tool_path: impl Into<String>) -> Self {
        self.tool_path = tool_path.into();
        self
    }

    fn require(&self, tool: &str) -> Result<String, SandboxError> {
        find_program(&self.tool_path, tool)
            .map(|path| path.to_string_lossy().into_owned())
            .ok_or_else(|| SandboxError::Unavailable(format!("{tool} not found in {}", self.tool_path)))
    }

    /// Full argv: `prlimit` outermost, then `bwrap`, then the interpreter.
    /// A configured launcher that cannot be found refuses the run.
    fn launcher_argv(&self, workdir: &Path, limits: &SandboxLimits) -> Result<Vec<String>, SandboxError> {
        let bwrap = if self.isolate { Some(self.require("bwrap")?) } else { None };
        let prlimit = if self.limit_memory { Some(self.require("prlimit")?) } else { None };

        let mut argv: Vec<String> = Vec::new();
        if let Some(prlimit) = prlimit {
            argv.push(prlimit);
            argv.push(format!("--as={}", limits.memory_mb * 1024 * 1024));
            argv.push(format!("--cpu={}", limits.timeout.as_secs() + 1));
            argv.push("--".to_string());
        }
        if let Some(bwrap) = bwrap {
            argv.push(bwrap);
            for flag in ["--unshare-all", "--die-with-parent", "--new-session"] {
                argv.push(flag.to_string());
            }
            for &path in SYSTEM_PATHS {
                argv.extend(["--ro-bind-try", path, path].map(String::from));
            }
            argv.extend(["--proc", "/proc", "--dev", "/dev", "--tmpfs", "/tmp"].map(String::from));
            argv.push("--bind".to_string());
            argv.push(workdir.to_string_lossy().into_owned());
            argv.push(ISOLATED_WORKDIR.to_string());
            argv.extend(["--chdir", ISOLATED_WORKDIR, "--"].map(String::from));
        }
        argv.extend(self.interpreter.iter().cloned());
        argv.push(self.script_name.clone());
        Ok(argv)
    }

    fn command(&self, workdir: &Path, limits: &SandboxLimits) -> Result<Command, SandboxError> {
        let argv = self.launcher_argv(workdir, limits)?;
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| SandboxError::Unavailable("no interpreter configured".to_string()))?;
        let home = if self.isolate { Path::new(ISOLATED_WORKDIR) } else { workdir };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(workdir)
            .env_clear()
            .env("PATH", SAFE_PATH)
            .env("HOME", home)
            .env("LANG", "C.UTF-8")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(cmd)
    }
}

#[async_trait]
impl CodeSandbox for ProcessSandbox {
    async fn run(&self, code: &str, dataset: &Dataset, limits: &SandboxLimits) -> Result<SandboxOutput, SandboxError> {
        if self.screen_python {
            screen_python(code)?;
        }

        let workdir = tempfile::tempdir().map_err(|e| SandboxError::Unavailable(e.to_string()))?;
        let payload = serde_json::to_vec(&dataset.to_json()).map_err(|e| SandboxError::Unavailable(e.to_string()))?;
        tokio::fs::write(workdir.path().join(DATASET_FILE), payload)
            .await
            .map_err(|e| SandboxError::Unavailable(e.to_string()))?;

        let script = match &self.prelude {
            Some(prelude) => format!("{prelude}\n{code}\n"),
            None => code.to_string(),
        };
        tokio::fs::write(workdir.path().join(&self.script_name), script)
            .await
            .map_err(|e| SandboxError::Unavailable(e.to_string()))?;

        let mut cmd = self.command(workdir.path(), limits)?;
        let start = Instant::now();
        let mut child = cmd
            .spawn()
            .map_err(|e| SandboxError::Unavailable(format!("failed to start interpreter: {e}")))?;

        let max = limits.max_output_bytes;
        let (stdout, stderr) = (child.stdout.take(), child.stderr.take());
        let collect = async {
            let ((out, out_truncated), (err, err_truncated)) =
                tokio::try_join!(read_capped(stdout, max), read_capped(stderr, max))?;
            if out_truncated || err_truncated {
                // Stop the writer once nobody reads the rest of its output.
                let _ = child.start_kill();
            }
            let status = child.wait().await?;
            Ok::<_, io::Error>((status, out, err, out_truncated))
        };

        // Dropping the child on timeout kills it.
        let (status, out, err, truncated) = match tokio::time::timeout(limits.timeout, collect).await {
            Ok(Ok(collected)) => collected,
            Ok(Err(e)) => return Err(SandboxError::Unavailable(e.to_string())),
            Err(_) => return Err(SandboxError::Timeout(limits.timeout.as_millis() as u64)),
        };
        let duration_ms = start.elapsed().as_millis() as u64;

        let stdout = String::from_utf8_lossy(&out).into_owned();
        let stderr = String::from_utf8_lossy(&err).into_owned();
        debug!(
            exit_code = status.code().unwrap_or(-1),
            duration_ms,
            stdout_bytes = out.len(),
            truncated,
            "Sandbox process finished"
        );

        if !truncated && !status.success() {
            let detail = error_tail(&stderr, 20);
            return Err(SandboxError::Exception(if detail.is_empty() {
                format!("process exited with {status}")
            } else {
                detail
            }));
        }

        Ok(SandboxOutput {
            stdout,
            stderr,
            truncated,
            duration_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn limits() -> SandboxLimits {
        SandboxLimits {
            timeout: Duration::from_secs(5),
            memory_mb: 256,
            max_output_bytes: 1024,
        }
    }

    fn dataset() -> Dataset {
        Dataset {
            columns: vec!["alt".to_string()],
            rows: vec![vec![json!(10)], vec![json!(20)]],
        }
    }

    fn shell() -> ProcessSandbox {
        ProcessSandbox::with_interpreter(vec!["sh".to_string()], "analysis.sh")
    }

    #[test]
    fn test_screen_allows_analysis_imports() {
        let code = "import numpy as np, pandas as pd\nfrom scipy import stats\nimport math\n\
                    r = df['alt'].corr(df['voltage'])\nprint(round(r, 4))\nprint(df.eval('a + b'))\n\
                    from collections import Counter\nt = pd.to_datetime(df['time_boot_ms'], unit='ms')\n\
                    print(json.dumps(df.describe().to_dict()), df['alt'].to_numpy().mean(), df.to_string())";
        assert!(screen_python(code).is_ok());
    }

    #[test]
    fn test_screen_rejects_modules_and_escape_hatches() {
        let cases = [
            "import os",
            "import numpy, subprocess",
            "from urllib.request import urlopen",
            "data = open('/etc/passwd').read()",
            "eval('1+1')",
            "x = ().__class__.__bases__",
            "import pandas as pd\nos.system('ls')",
            "print(pd.read_csv('/proc/1/environ').to_string())",
            "pd.read_html('http://example.com')",
            "df.to_csv('/tmp/out.csv')",
            "print(np.loadtxt('/etc/hosts', dtype=str))",
            "np.fromfile('/dev/urandom', count=8)",
            "from scipy import io",
            "from scipy import stats, io",
            "import scipy.io",
            "print(scipy.io.loadmat('x.mat'))",
        ];
        for code in cases {
            assert!(
                matches!(screen_python(code), Err(SandboxError::Disallowed(_))),
                "expected {code:?} to be refused"
            );
        }
    }

    #[tokio::test]
    async fn test_read_capped() {
        assert_eq!(read_capped(Some(&b"hello"[..]), 10).await.unwrap(), (b"hello".to_vec(), false));
        assert_eq!(read_capped(Some(&b"hello"[..]), 5).await.unwrap(), (b"hello".to_vec(), false));
        assert_eq!(read_capped(Some(&b"hello world"[..]), 5).await.unwrap(), (b"hello".to_vec(), true));
        assert_eq!(read_capped(None::<&[u8]>, 5).await.unwrap(), (Vec::new(), false));
    }

    #[tokio::test]
    async fn test_runs_with_dataset_in_workdir() {
        let output = shell()
            .run("cat dataset.json", &dataset(), &limits())
            .await
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&output.stdout).unwrap();
        assert_eq!(parsed["columns"], json!(["alt"]));
        assert_eq!(parsed["rows"], json!([[10], [20]]));
    }

    #[tokio::test]
    async fn test_environment_is_cleared() {
        std::env::set_var("FLIGHT_INSIGHT_SECRET", "leak");
        let output = shell()
            .run("echo \"[$FLIGHT_INSIGHT_SECRET]\"", &dataset(), &limits())
            .await
            .unwrap();
        assert_eq!(output.stdout.trim(), "[]");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_exception() {
        let err = shell()
            .run("echo 'ZeroDivisionError: division by zero' >&2; exit 1", &dataset(), &limits())
            .await
            .unwrap_err();
        assert_eq!(err, SandboxError::Exception("ZeroDivisionError: division by zero".to_string()));
    }

    #[tokio::test]
    async fn test_timeout() {
        let limits = SandboxLimits {
            timeout: Duration::from_millis(200),
            ..limits()
        };
        let err = shell().run("sleep 5", &dataset(), &limits).await.unwrap_err();
        assert_eq!(err, SandboxError::Timeout(200));
    }

    #[tokio::test]
    async fn test_output_is_capped() {
        let limits = SandboxLimits {
            max_output_bytes: 8,
            ..limits()
        };
        let output = shell().run("echo 0123456789abcdef", &dataset(), &limits).await.unwrap();
        assert_eq!(output.stdout, "01234567");
        assert!(output.truncated);
    }

    #[tokio::test]
    async fn test_endless_output_stops_at_cap() {
        let limits = SandboxLimits {
            max_output_bytes: 64,
            ..limits()
        };
        let started = Instant::now();
        let output = shell().run("yes 0123456789", &dataset(), &limits).await.unwrap();
        assert!(output.truncated);
        assert_eq!(output.stdout.len(), 64);
        assert!(output.stdout.starts_with("0123456789\n"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_missing_bubblewrap_is_unavailable() {
        let empty = tempfile::tempdir().unwrap();
        let sandbox = ProcessSandbox::python(&SandboxConfig::default())
            .with_tool_path(empty.path().to_string_lossy().into_owned());
        let err = sandbox
            .run("print(df['alt'].max())", &dataset(), &limits())
            .await
            .unwrap_err();
        assert!(matches!(&err, SandboxError::Unavailable(msg) if msg.contains("bwrap")), "{err:?}");
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_isolated_launcher_argv() {
        let tools = tempfile::tempdir().unwrap();
        std::fs::write(tools.path().join("bwrap"), "").unwrap();
        std::fs::write(tools.path().join("prlimit"), "").unwrap();
        let sandbox = ProcessSandbox::python(&SandboxConfig::default())
            .with_tool_path(tools.path().to_string_lossy().into_owned());

        let argv = sandbox.launcher_argv(Path::new("/tmp/run-1"), &limits()).unwrap();
        assert!(argv[0].ends_with("prlimit"));
        assert!(argv.contains(&format!("--as={}", 256 * 1024 * 1024)));
        let bwrap = argv.iter().position(|a| a.ends_with("bwrap")).unwrap();
        let launcher = &argv[bwrap..];
        assert!(launcher.contains(&"--unshare-all".to_string()));
        assert!(launcher.windows(3).any(|w| w == ["--bind", "/tmp/run-1", "/work"]));
        assert!(launcher.windows(3).any(|w| w == ["--ro-bind-try", "/usr", "/usr"]));
        assert!(!launcher.iter().any(|a| a == "/" || a == "/home" || a == "/proc/self"));
        assert!(argv.ends_with(&["python3".to_string(), "-I".to_string(), "analysis.py".to_string()]));

        let bare = ProcessSandbox::python(&SandboxConfig {
            isolate: false,
            ..SandboxConfig::default()
        })
        .with_tool_path(tools.path().to_string_lossy().into_owned());
        let argv = bare.launcher_argv(Path::new("/tmp/run-1"), &limits()).unwrap();
        assert!(!argv.iter().any(|a| a.ends_with("bwrap")));
    }

    #[tokio::test]
    async fn test_python_screen_runs_before_spawn() {
        let sandbox = ProcessSandbox::python(&SandboxConfig {
            interpreter: vec!["/nonexistent/python".to_string()],
            ..SandboxConfig::default()
        });
        let err = sandbox.run("import socket", &dataset(), &limits()).await.unwrap_err();
        assert!(matches!(err, SandboxError::Disallowed(_)));
    }

    #[tokio::test]
    async fn test_missing_interpreter_is_unavailable() {
        let sandbox = ProcessSandbox::with_interpreter(vec!["/nonexistent/python".to_string()], "a.py");
        let err = sandbox.run("print(1)", &dataset(), &limits()).await.unwrap_err();
        assert!(matches!(err, SandboxError::Unavailable(_)));
        assert!(!err.is_recoverable());
    }
}
