#![allow(dead_code)]

use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use local_backup_lib::config::BackupConfig;
use local_backup_lib::credentials::StaticCredentials;
use local_backup_lib::orchestrator::BackupOrchestrator;
use local_backup_lib::retry::RetryPolicy;
use local_backup_lib::runner::{CommandOutput, CommandRequest, CommandRunner, RunnerError};

pub const COMPLETE_DUMP: &str = "-- MariaDB dump 10.19  Distrib 10.11.6-MariaDB\n\
    CREATE DATABASE /*!32312 IF NOT EXISTS*/ `shop`;\n\
    INSERT INTO `orders` VALUES (1,'book'),(2,'lamp');\n\
    -- Dump completed on 2024-05-01 12:00:00\n";

/// Runner answering every command with `script(request, call number)`.
pub struct ScriptedRunner<F> {
    script: F,
    calls: AtomicU32,
}

impl<F> ScriptedRunner<F>
where
    F: Fn(&CommandRequest, u32) -> Result<CommandOutput, RunnerError> + Send + Sync,
{
    pub fn new(script: F) -> Arc<Self> {
        Arc::new(Self {
            script,
            calls: AtomicU32::new(0),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl<F> CommandRunner for ScriptedRunner<F>
where
    F: Fn(&CommandRequest, u32) -> Result<CommandOutput, RunnerError> + Send + Sync,
{
    fn run(&self, request: &CommandRequest) -> Result<CommandOutput, RunnerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        (self.script)(request, call)
    }
}

pub fn exit(code: i32, stderr: &str) -> CommandOutput {
    CommandOutput {
        exit_code: Some(code),
        stdout: Vec::new(),
        stderr: stderr.as_bytes().to_vec(),
    }
}

/// Does what `cp -a -- SRC DST` would do, minus the attributes.
pub fn copy_like_cp(request: &CommandRequest) -> Result<CommandOutput, RunnerError> {
    let n = request.argv.len();
    copy_tree(Path::new(&request.argv[n - 2]), Path::new(&request.argv[n - 1]))?;
    Ok(exit(0, ""))
}

fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    if src.is_dir() {
        fs::create_dir(dst)?;
        for entry in fs::read_dir(src)? {
            let entry = entry?;
            copy_tree(&entry.path(), &dst.join(entry.file_name()))?;
        }
        Ok(())
    } else {
        fs::copy(src, dst).map(|_| ())
    }
}

/// Writes `content` where a `cp` invocation would write its copy.
pub fn write_copy_destination(request: &CommandRequest, content: &str) -> io::Result<()> {
    let dst = request.argv.last().expect("cp has a destination");
    fs::write(dst, content)
}

/// Emulates a dump program writing `content` to its `--result-file`.
pub fn dump_to_result_file(request: &CommandRequest, content: &str) -> Result<CommandOutput, RunnerError> {
    for arg in &request.argv {
        if let Some(path) = arg.to_string_lossy().strip_prefix("--result-file=") {
            fs::write(path, content)?;
        }
    }
    Ok(exit(0, ""))
}

/// Defaults with `destination` and retries without delay.
pub fn config(destination: &Path) -> BackupConfig {
    let mut config = BackupConfig::default().with_destination(destination);
    config.retry = RetryPolicy {
        max_attempts: 3,
        base_delay_ms: 0,
        max_delay_ms: 0,
    };
    config
}

pub fn orchestrator(config: &BackupConfig, runner: Arc<dyn CommandRunner>) -> BackupOrchestrator {
    BackupOrchestrator::new(
        config,
        runner,
        Arc::new(StaticCredentials::new("root", "secret")),
    )
    .expect("manifest should open")
}

/// Creates a directory with three files below `root/name`.
pub fn sample_dir(root: &Path, name: &str) -> std::path::PathBuf {
    let dir = root.join(name);
    fs::create_dir_all(dir.join("static")).unwrap();
    fs::write(dir.join("index.html"), "<h1>app</h1>").unwrap();
    fs::write(dir.join("config.ini"), "[server]\nport=8080\n").unwrap();
    fs::write(dir.join("static/app.js"), "console.log('hi')").unwrap();
    dir
}

/// Moves the modification time of `path` and everything below it an hour
/// into the past.
pub fn backdate(path: &Path) {
    let past = SystemTime::now() - Duration::from_secs(3600);
    if path.is_dir() {
        for entry in fs::read_dir(path).unwrap() {
            backdate(&entry.unwrap().path());
        }
    }
    fs::File::open(path).unwrap().set_modified(past).unwrap();
}
