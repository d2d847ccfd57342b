// Main entry point for the application

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use pmlink::client::{
    format_size, ConsoleSink, ManagerAction, ManagerCommand, Notice, UploadProgress,
};
use pmlink::common::types::ConnectionState;
use pmlink::protocol::{DeploymentUpdate, LogFileInfo, NoticeLevel, StatusSnapshot};
use pmlink::{ClientConfig, ConsoleSession, UploadOutcome};

type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(name = "pmlink")]
#[command(about = "Process-monitor console client: live status, logs and project deployment", long_about = None)]
struct Cli {
    /// Console base URL [default: http://127.0.0.1:8080]
    #[arg(long, global = true)]
    server: Option<String>,

    /// JSON config file; --server and --chunk-size override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Upload chunk size in bytes
    #[arg(long, global = true)]
    chunk_size: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Follow live status, deployments and optionally one log file
    Watch {
        /// Log file to follow
        #[arg(long)]
        log: Option<String>,

        /// Offset to start the log from
        #[arg(long, default_value_t = 0)]
        since: u64,
    },

    /// Deploy a project archive
    Upload {
        /// Archive to upload
        file: PathBuf,

        /// Restart the project after deployment
        #[arg(long)]
        restart: bool,

        /// Send the file in a single request instead of chunks
        #[arg(long)]
        whole: bool,
    },

    /// List log files, or read one
    Logs {
        file: Option<String>,

        #[arg(long, default_value_t = 0)]
        since: u64,
    },

    /// Show deployment history
    History,

    /// Start, stop or restart a manager
    Manager {
        /// start | stop | restart
        action: String,
        shm_id: i64,
        hostname: String,
    },

    /// Restart one or more project instances
    Restart {
        #[arg(required = true)]
        hosts: Vec<String>,
    },
}

/// Prints what the session reports; drives a progress bar during uploads.
#[derive(Default)]
struct TerminalSink {
    bar: Mutex<Option<ProgressBar>>,
}

impl TerminalSink {
    fn bar(&self) -> ProgressBar {
        let mut slot = self.bar.lock().unwrap_or_else(PoisonError::into_inner);
        slot.get_or_insert_with(|| {
            let bar = ProgressBar::new(100);
            if let Ok(style) = ProgressStyle::default_bar()
                .template("{bar:40.cyan/blue} {pos:>3}% {msg}")
            {
                bar.set_style(style.progress_chars("=> "));
            }
            bar
        })
        .clone()
    }

    fn finish_bar(&self) {
        if let Some(bar) = self.bar.lock().unwrap_or_else(PoisonError::into_inner).take() {
            bar.finish();
        }
    }
}

impl ConsoleSink for TerminalSink {
    fn connection_status(&self, state: ConnectionState) {
        println!("[channel] {}", state);
    }

    fn status_snapshot(&self, snapshot: &StatusSnapshot) {
        for instance in &snapshot.instances {
            let running = instance.progs.iter().filter(|m| m.is_running()).count();
            println!(
                "[pmon] {} ({}): {}/{} managers running",
                instance.hostname.as_deref().unwrap_or("?"),
                instance.project_name.as_deref().unwrap_or("-"),
                running,
                instance.progs.len()
            );
        }
    }

    fn deployment(&self, update: &DeploymentUpdate) {
        if let Some(progress) = update.details.progress {
            println!("[deploy] {:?} {}%", update.status, progress);
        }
    }

    fn log_lines(&self, _file: Option<&str>, lines: &[String], replace: bool) {
        if replace {
            println!("----");
        }
        for line in lines {
            println!("{}", line);
        }
    }

    fn log_files(&self, files: &[LogFileInfo]) {
        for file in files {
            println!("{:>10} KB  {}", file.size, file.name);
        }
    }

    fn notify(&self, notice: &Notice) {
        let tag = match notice.level {
            NoticeLevel::Info => "info",
            NoticeLevel::Success => "ok",
            NoticeLevel::Warning => "warn",
            NoticeLevel::Error => "error",
        };
        let line = format!("[{}] {}: {}", tag, notice.title, notice.message);
        match self.bar.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            Some(bar) => bar.println(line),
            None => println!("{}", line),
        }
    }

    fn upload_progress(&self, progress: &UploadProgress) {
        let bar = self.bar();
        bar.set_position(progress.percent as u64);
        bar.set_message(progress.message.clone());
    }

    fn history_changed(&self) {
        println!("[deploy] history updated");
    }
}

fn load_config(cli: &Cli) -> Result<ClientConfig> {
    let mut config = match &cli.config {
        Some(path) => ClientConfig::from_file(path)?,
        None => ClientConfig::default(),
    };
    if let Some(server) = &cli.server {
        config.base_url = server.clone();
    }
    if let Some(size) = cli.chunk_size {
        config = config.with_chunk_size(size)?;
    }
    config.validate()?;
    Ok(config)
}

async fn watch(session: &ConsoleSession, log: Option<String>, since: u64) -> Result<()> {
    session.connect()?;
    if let Some(file) = log {
        session.channel().subscribe_log(file, since)?;
    }
    println!("Watching {} (Ctrl+C to stop)", session.config().base_url);
    tokio::signal::ctrl_c().await?;
    session.close()?;
    // let the close frame go out
    tokio::time::sleep(Duration::from_millis(200)).await;
    Ok(())
}

async fn upload(session: &ConsoleSession, sink: &TerminalSink, file: &Path, restart: bool, whole: bool) -> Result<()> {
    let size = std::fs::metadata(file)?.len();
    println!("Uploading {:?} ({})", file, format_size(size));

    let transfer = async {
        if whole {
            session.upload_whole(file, restart).await
        } else {
            session.upload_chunked(file, restart).await
        }
    };
    tokio::pin!(transfer);

    let outcome = tokio::select! {
        outcome = &mut transfer => outcome,
        _ = tokio::signal::ctrl_c() => {
            session.cancel_upload();
            transfer.await
        }
    };
    sink.finish_bar();

    match outcome {
        UploadOutcome::Completed => {
            println!("Upload successful");
            Ok(())
        }
        UploadOutcome::Cancelled => {
            println!("Upload cancelled");
            Ok(())
        }
        UploadOutcome::Failed(reason) => Err(reason.into()),
        UploadOutcome::Busy => Err("another upload is in progress".into()),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let sink = Arc::new(TerminalSink::default());
    let session = ConsoleSession::new(config, sink.clone())?;

    match cli.command {
        Commands::Watch { log, since } => watch(&session, log, since).await?,

        Commands::Upload { file, restart, whole } => {
            upload(&session, &sink, &file, restart, whole).await?
        }

        Commands::Logs { file: None, .. } => {
            for file in session.log_files().await? {
                println!("{:>10} KB  {}", file.size, file.name);
            }
        }

        Commands::Logs { file: Some(file), since } => {
            let read = session.read_log(&file, since).await?;
            for line in &read.lines {
                println!("{}", line);
            }
            if let Some(last_id) = read.last_id {
                println!("-- next offset: {}", last_id);
            }
        }

        Commands::History => {
            let page = session.deployment_history().await?;
            println!("{} deployments", page.total_count);
            for entry in &page.history {
                println!(
                    "{}  {:<7}  {:<24} {:>10}  {}@{}  {}",
                    entry.timestamp.as_deref().unwrap_or("-"),
                    if entry.is_success() { "success" } else { "failed" },
                    entry.file_name.as_deref().unwrap_or("-"),
                    format_size(entry.file_size.unwrap_or(0)),
                    entry.user.as_deref().unwrap_or("-"),
                    entry.hostname.as_deref().unwrap_or("-"),
                    entry.status_message.as_deref().unwrap_or(""),
                );
            }
        }

        Commands::Manager { action, shm_id, hostname } => {
            let action: ManagerAction = action.parse()?;
            let reply = session
                .manager_command(&ManagerCommand { action, shm_id, hostname })
                .await?;
            if !reply.success {
                return Err(reply.error.unwrap_or_else(|| "command failed".to_string()).into());
            }
        }

        Commands::Restart { hosts } => {
            let summary = session.restart_all_instances(&hosts).await;
            if summary.failed > 0 {
                return Err(format!("{} of {} restarts failed", summary.failed, hosts.len()).into());
            }
        }
    }

    Ok(())
}
