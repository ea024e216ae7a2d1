use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

const STDERR_TAIL: usize = 2048;

/// One external tool call, fully described before anything runs. Arguments
/// are passed as discrete strings (never through a shell), and credentials
/// travel in `env` or a staged config file, never in `args`, so they cannot
/// surface in process listings or captured stderr.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub stdin_file: Option<PathBuf>,
}

impl ToolInvocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            stdin_file: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn stdin_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdin_file = Some(path.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("failed to launch {program}: {message}")]
    Launch { program: String, message: String },
    #[error("{program} exited with code {code}: {stderr}")]
    Failed {
        program: String,
        code: i32,
        stderr: String,
    },
}

/// Seam between strategies and the dump/restore binaries. The system
/// implementation spawns real processes; the in-memory one records
/// invocations for tests.
#[async_trait]
pub trait DumpToolRunner: Send + Sync {
    async fn run(&self, invocation: ToolInvocation) -> Result<ToolOutput, ToolError>;
}

/// Runs tools via `tokio::process`. Dump and restore calls may block for
/// minutes on large datasets; callers run inside a worker task, never inside
/// a request handler.
#[derive(Debug, Default)]
pub struct SystemToolRunner;

impl SystemToolRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DumpToolRunner for SystemToolRunner {
    async fn run(&self, invocation: ToolInvocation) -> Result<ToolOutput, ToolError> {
        let mut command = tokio::process::Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        match &invocation.stdin_file {
            Some(path) => {
                let file = std::fs::File::open(path).map_err(|e| ToolError::Launch {
                    program: invocation.program.clone(),
                    message: format!("cannot open stdin file {}: {e}", path.display()),
                })?;
                command.stdin(Stdio::from(file));
            }
            None => {
                command.stdin(Stdio::null());
            }
        }

        info!(program = %invocation.program, args = ?invocation.args, "running external tool");

        let output = command.output().await.map_err(|e| ToolError::Launch {
            program: invocation.program.clone(),
            message: e.to_string(),
        })?;

        let stderr = tail(&String::from_utf8_lossy(&output.stderr));
        if output.status.success() {
            Ok(ToolOutput {
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr,
            })
        } else {
            Err(ToolError::Failed {
                program: invocation.program.clone(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            })
        }
    }
}

fn tail(text: &str) -> String {
    if text.len() <= STDERR_TAIL {
        return text.to_string();
    }
    let start = text.len() - STDERR_TAIL;
    let mut cut = start;
    while !text.is_char_boundary(cut) {
        cut += 1;
    }
    text[cut..].to_string()
}

/// Records every invocation instead of running it. Tests can make a single
/// program fail to exercise the failure paths.
#[derive(Default)]
pub struct InMemoryToolRunner {
    invocations: Mutex<Vec<ToolInvocation>>,
    fail_on: Mutex<Option<String>>,
}

impl InMemoryToolRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on_program(&self, program: impl Into<String>) {
        *self.fail_on.lock().expect("runner lock") = Some(program.into());
    }

    pub fn invocations(&self) -> Vec<ToolInvocation> {
        self.invocations.lock().expect("runner lock").clone()
    }
}

#[async_trait]
impl DumpToolRunner for InMemoryToolRunner {
    async fn run(&self, invocation: ToolInvocation) -> Result<ToolOutput, ToolError> {
        let program = invocation.program.clone();
        self.invocations.lock().expect("runner lock").push(invocation);

        let fail = self.fail_on.lock().expect("runner lock").clone();
        if fail.as_deref() == Some(program.as_str()) {
            return Err(ToolError::Failed {
                program,
                code: 1,
                stderr: "simulated tool failure".to_string(),
            });
        }

        Ok(ToolOutput {
            stdout: String::new(),
            stderr: String::new(),
        })
    }
}
