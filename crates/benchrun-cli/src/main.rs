use anyhow::Result;
use benchrun_exec::{
    check_kernel_alive, list_specs, probe_kernel_info, read_connection_info, ChannelClient,
    ExecutionBridge, KernelProcess, OutputEvent, RunEvent, SessionIo, SessionTimeouts,
    CONNECTION_FILE_PREFIX,
};
use clap::{Parser, Subcommand};
use futures::future::join_all;
use jupyter_protocol::{ConnectionInfo, MediaType};
use log::debug;
use runtimelib::runtime_dir;
use serde::Serialize;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tabled::{settings::Style, Table, Tabled};
use tokio::fs;
use tokio::sync::mpsc;

#[derive(Serialize, Clone, Copy, Debug)]
#[serde(rename_all = "lowercase")]
enum KernelStatus {
    Alive,
    Unresponsive,
}

impl std::fmt::Display for KernelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KernelStatus::Alive => write!(f, "alive"),
            KernelStatus::Unresponsive => write!(f, "unresponsive"),
        }
    }
}

#[derive(Serialize)]
struct KernelInfo {
    name: String,
    connection_file: PathBuf,
    language: Option<String>,
    language_version: Option<String>,
    status: KernelStatus,
    #[serde(flatten)]
    connection_info: ConnectionInfo,
}

/// Shorten a path for display by replacing home directory with ~
fn shorten_path(path: &Path) -> String {
    if let Some(home) = dirs::home_dir() {
        if let Ok(relative) = path.strip_prefix(&home) {
            return format!("~/{}", relative.display());
        }
    }
    path.display().to_string()
}

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level filter (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// List the kernelspecs installed on this machine
    Specs {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Run code in a fresh kernel and stream its output
    Run {
        /// The code to execute (reads stdin when neither this nor --file is given)
        code: Option<String>,
        /// Read the code from a file instead
        #[arg(long, short)]
        file: Option<PathBuf>,
        /// The kernelspec to launch (e.g., python3, deno)
        #[arg(long, default_value = "python3")]
        spec: String,
        /// Seconds to wait for the kernel to answer after launch
        #[arg(long, default_value = "60")]
        startup_timeout: u64,
        /// Leave the kernel running afterwards
        #[arg(long)]
        keep: bool,
    },
    /// Open an interactive console on a kernel
    Console {
        /// The kernelspec to launch (e.g., python3, deno)
        #[arg(long, default_value = "python3")]
        spec: String,
        /// Attach to a running kernel's connection file instead of launching
        #[arg(long)]
        existing: Option<PathBuf>,
    },
    /// List running kernels
    Ps {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
        /// Show verbose output including port numbers
        #[arg(short, long)]
        verbose: bool,
    },
    /// Interrupt a kernel given an ID
    Interrupt { id: String },
    /// Stop a kernel given an ID
    Stop {
        id: Option<String>,
        /// Stop all running kernels
        #[arg(long)]
        all: bool,
    },
    /// Remove connection files for kernels that no longer respond
    Clean {
        /// Timeout in seconds for the heartbeat check
        #[arg(long, default_value = "2")]
        timeout: u64,
        /// Show what would be removed without removing anything
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    match cli.command {
        Some(Commands::Specs { json }) => list_kernelspecs(json).await,
        Some(Commands::Run {
            code,
            file,
            spec,
            startup_timeout,
            keep,
        }) => run_code(code, file, &spec, startup_timeout, keep).await,
        Some(Commands::Console { spec, existing }) => console(&spec, existing.as_deref()).await,
        Some(Commands::Ps { json, verbose }) => list_kernels(json, verbose).await,
        Some(Commands::Interrupt { id }) => interrupt_kernel(&id).await,
        Some(Commands::Stop { id, all }) => stop_kernels(id.as_deref(), all).await,
        Some(Commands::Clean { timeout, dry_run }) => clean_kernels(timeout, dry_run).await,
        None => {
            println!("No command specified. Use --help for usage information.");
            Ok(())
        }
    }
}

async fn list_kernelspecs(json_output: bool) -> Result<()> {
    let specs = list_specs().await;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&specs)?);
        return Ok(());
    }

    if specs.is_empty() {
        println!("No kernelspecs found.");
        return Ok(());
    }

    #[derive(Tabled)]
    struct SpecRow {
        #[tabled(rename = "NAME")]
        name: String,
        #[tabled(rename = "DISPLAY NAME")]
        display_name: String,
        #[tabled(rename = "LANGUAGE")]
        language: String,
    }

    let rows: Vec<SpecRow> = specs
        .into_iter()
        .map(|spec| SpecRow {
            name: spec.name,
            display_name: spec.display_name,
            language: spec.language,
        })
        .collect();

    let table = Table::new(rows).with(Style::rounded()).to_string();
    println!("{}", table);

    Ok(())
}

/// How the shared event printer wants the caller to react to one event.
enum Reaction {
    Continue,
    Answer(String),
    Finished(bool),
}

/// Print one run event and collect an answer when the kernel asks for input.
///
/// Interactive prompts go to stderr so that piped stdout stays clean kernel
/// output.
fn react(event: &RunEvent) -> Result<Reaction> {
    match event {
        RunEvent::Output(OutputEvent::Text(text)) => {
            print!("{}", text);
            let _ = io::stdout().flush();
        }
        RunEvent::Output(OutputEvent::Rich(media)) => match media {
            MediaType::Html(html) => println!("{}", html),
            other => println!("{}", serde_json::to_string(other)?),
        },
        RunEvent::Output(OutputEvent::Image { mime, data }) => {
            println!("[{} image, {} base64 bytes]", mime, data.len());
        }
        RunEvent::Output(OutputEvent::Error(text)) => eprintln!("{}", text),
        RunEvent::Output(OutputEvent::Warning(text)) => eprintln!("warning: {}", text),
        RunEvent::InputRequested { prompt, password } => {
            let value = if *password {
                eprint!("{}", prompt);
                let _ = io::stderr().flush();
                rpassword::read_password().unwrap_or_default()
            } else {
                eprint!("{}", prompt);
                let _ = io::stderr().flush();
                let mut input = String::new();
                io::stdin().read_line(&mut input)?;
                input.trim_end_matches('\n').to_string()
            };
            return Ok(Reaction::Answer(value));
        }
        RunEvent::Finished { success } => return Ok(Reaction::Finished(*success)),
    }
    Ok(Reaction::Continue)
}

async fn run_code(
    code: Option<String>,
    file: Option<PathBuf>,
    spec: &str,
    startup_timeout: u64,
    keep: bool,
) -> Result<()> {
    let code = match (code, file) {
        (Some(code), _) => code,
        (None, Some(path)) => fs::read_to_string(&path).await?,
        (None, None) => {
            let mut buffer = String::new();
            io::stdin().read_to_string(&mut buffer)?;
            buffer
        }
    };

    let (bridge, mut events) = ExecutionBridge::new();
    let kernel_id = bridge
        .start_kernel(spec, Duration::from_secs(startup_timeout))
        .await?;
    debug!("kernel {} answered the startup probe", kernel_id);

    let run_id = bridge.run(&kernel_id, &code).await?;

    let mut success = false;
    while let Some(tagged) = events.recv().await {
        if tagged.run_id != run_id {
            continue;
        }
        match react(&tagged.event)? {
            Reaction::Continue => {}
            Reaction::Answer(value) => bridge.answer_input(&run_id, &value)?,
            Reaction::Finished(result) => {
                success = result;
                break;
            }
        }
    }

    if keep {
        if let Some(path) = bridge.connection_file(&kernel_id).await {
            println!("Kernel started with ID: {}", kernel_id);
            println!("Connection file: {}", path.display());
        }
    } else {
        bridge.shutdown(&kernel_id, false).await?;
    }

    if !success {
        std::process::exit(1);
    }

    Ok(())
}

async fn console(spec: &str, existing: Option<&Path>) -> Result<()> {
    let (mut client, kernel) = match existing {
        Some(path) => {
            let info = read_connection_info(path).await?;
            let client = ChannelClient::connect(&info, Duration::from_secs(10)).await?;
            let name = info.kernel_name.as_deref().unwrap_or("kernel");
            println!("{} console (attached to {})", name, shorten_path(path));
            (client, None)
        }
        None => {
            let mut process = KernelProcess::start(spec).await?;
            let client =
                match ChannelClient::connect(process.connection_info(), Duration::from_secs(60))
                    .await
                {
                    Ok(client) => client,
                    Err(e) => {
                        let _ = process.shutdown(true).await;
                        return Err(e.into());
                    }
                };
            println!("{} console", spec);
            (client, Some(process))
        }
    };
    println!("Use Ctrl+D to exit.\n");

    let timeouts = SessionTimeouts::default();
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let mut execution_count: u32 = 0;

    loop {
        execution_count += 1;
        print!("In [{}]: ", execution_count);
        io::stdout().flush()?;

        // Read one line without holding a persistent StdinLock, so that
        // input prompts from the kernel can also read from terminal stdin.
        let mut line = String::new();
        if io::stdin().read_line(&mut line)? == 0 {
            break; // EOF
        }

        let code = line.trim();
        if code.is_empty() {
            execution_count -= 1;
            continue;
        }

        let (answer_tx, answers) = mpsc::channel(1);
        let mut session_io = SessionIo {
            run_id: execution_count.to_string(),
            events: events_tx.clone(),
            answers,
            input_pending: Arc::new(AtomicBool::new(false)),
        };

        // Drive the run and the event printer together; the session blocks
        // on the answer channel whenever the kernel asks for input.
        {
            let run = benchrun_exec::run_session(&mut client, code, &timeouts, &mut session_io);
            tokio::pin!(run);
            loop {
                tokio::select! {
                    _ = &mut run => break,
                    maybe = events.recv() => {
                        if let Some(tagged) = maybe {
                            if let Reaction::Answer(value) = react(&tagged.event)? {
                                let _ = answer_tx.try_send(value);
                            }
                        }
                    }
                }
            }
        }

        // Anything still buffered arrived between the last poll and the
        // end of the run.
        while let Ok(tagged) = events.try_recv() {
            if let Reaction::Answer(value) = react(&tagged.event)? {
                let _ = answer_tx.try_send(value);
            }
        }

        // Blank line between output and the next prompt
        println!();
    }

    if let Some(mut process) = kernel {
        println!("\nShutting down kernel...");
        process.shutdown(false).await?;
        println!("Done.");
    } else {
        client.disconnect();
        println!("\nDetached. Kernel left running.");
    }

    Ok(())
}

async fn list_kernels(json_output: bool, verbose: bool) -> Result<()> {
    let runtime_dir = runtime_dir();
    let timeout = Duration::from_secs(2);

    let mut kernels = Vec::new();
    if let Ok(mut entries) = fs::read_dir(&runtime_dir).await {
        let mut connection_files: Vec<PathBuf> = Vec::new();
        while let Some(entry) = entries.next_entry().await.ok().flatten() {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let file_name = path.file_name().and_then(|s| s.to_str()).unwrap_or("");
            if !file_name.starts_with(CONNECTION_FILE_PREFIX) {
                continue;
            }
            connection_files.push(path);
        }

        let kernel_futures = connection_files
            .into_iter()
            .map(|path| async move { gather_kernel_info(path, timeout).await });

        kernels = join_all(kernel_futures).await.into_iter().flatten().collect();
    }

    kernels.sort_by(|a, b| a.name.cmp(&b.name));

    if json_output {
        println!("{}", serde_json::to_string_pretty(&kernels)?);
    } else if verbose {
        print_verbose_kernel_table(&kernels);
    } else {
        print_kernel_table(&kernels);
    }

    Ok(())
}

async fn gather_kernel_info(path: PathBuf, timeout: Duration) -> Option<KernelInfo> {
    let connection_info = read_connection_info(&path).await.ok()?;

    let full_name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("unknown");
    let name = full_name
        .strip_prefix(CONNECTION_FILE_PREFIX)
        .unwrap_or(full_name)
        .to_string();

    let (language, language_version, status) = if check_kernel_alive(&connection_info, timeout).await
    {
        match probe_kernel_info(&connection_info, timeout).await {
            Some((language, version)) => (Some(language), Some(version), KernelStatus::Alive),
            None => (None, None, KernelStatus::Alive),
        }
    } else {
        (None, None, KernelStatus::Unresponsive)
    };

    Some(KernelInfo {
        name,
        connection_file: path,
        language,
        language_version,
        status,
        connection_info,
    })
}

fn print_kernel_table(kernels: &[KernelInfo]) {
    if kernels.is_empty() {
        println!("No running kernels found.");
        return;
    }

    #[derive(Tabled)]
    struct Row {
        #[tabled(rename = "NAME")]
        name: String,
        #[tabled(rename = "LANGUAGE")]
        language: String,
        #[tabled(rename = "STATUS")]
        status: String,
        #[tabled(rename = "CONNECTION FILE")]
        connection_file: String,
    }

    let rows: Vec<Row> = kernels
        .iter()
        .map(|k| Row {
            name: k.name.clone(),
            language: k.language.clone().unwrap_or_else(|| "-".to_string()),
            status: k.status.to_string(),
            connection_file: shorten_path(&k.connection_file),
        })
        .collect();

    let table = Table::new(rows).with(Style::rounded()).to_string();
    println!("{}", table);
}

fn print_verbose_kernel_table(kernels: &[KernelInfo]) {
    if kernels.is_empty() {
        println!("No running kernels found.");
        return;
    }

    #[derive(Tabled)]
    struct VerboseRow {
        #[tabled(rename = "NAME")]
        name: String,
        #[tabled(rename = "LANGUAGE")]
        language: String,
        #[tabled(rename = "STATUS")]
        status: String,
        #[tabled(rename = "SHELL")]
        shell_port: u16,
        #[tabled(rename = "IOPUB")]
        iopub_port: u16,
        #[tabled(rename = "STDIN")]
        stdin_port: u16,
        #[tabled(rename = "CTRL")]
        control_port: u16,
        #[tabled(rename = "HB")]
        hb_port: u16,
        #[tabled(rename = "CONNECTION FILE")]
        connection_file: String,
    }

    let rows: Vec<VerboseRow> = kernels
        .iter()
        .map(|k| VerboseRow {
            name: k.name.clone(),
            language: format!(
                "{} {}",
                k.language.as_deref().unwrap_or("-"),
                k.language_version.as_deref().unwrap_or("")
            )
            .trim()
            .to_string(),
            status: k.status.to_string(),
            shell_port: k.connection_info.shell_port,
            iopub_port: k.connection_info.iopub_port,
            stdin_port: k.connection_info.stdin_port,
            control_port: k.connection_info.control_port,
            hb_port: k.connection_info.hb_port,
            connection_file: shorten_path(&k.connection_file),
        })
        .collect();

    let table = Table::new(rows).with(Style::rounded()).to_string();
    println!("{}", table);
}

async fn interrupt_kernel(id: &str) -> Result<()> {
    let connection_file = runtime_dir().join(format!("{}{}.json", CONNECTION_FILE_PREFIX, id));
    let info = read_connection_info(&connection_file).await?;
    benchrun_exec::interrupt_kernel(&info).await?;
    println!("Interrupt sent to kernel {}", id);
    Ok(())
}

async fn stop_kernels(id: Option<&str>, all: bool) -> Result<()> {
    if all {
        let runtime_dir = runtime_dir();
        let mut entries = fs::read_dir(&runtime_dir).await?;
        let mut stopped = 0;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let file_name = path.file_name().and_then(|s| s.to_str()).unwrap_or("");
            if !file_name.starts_with(CONNECTION_FILE_PREFIX) {
                continue;
            }

            let kernel_id = file_name
                .strip_prefix(CONNECTION_FILE_PREFIX)
                .and_then(|s| s.strip_suffix(".json"))
                .unwrap_or("unknown");

            if stop_kernel_at(&path).await.is_ok() {
                println!("Stopped {}", kernel_id);
                stopped += 1;
            } else {
                eprintln!("Failed to stop {}", kernel_id);
            }
        }

        if stopped == 0 {
            println!("No running kernels found.");
        } else {
            println!("\nStopped {} kernel(s)", stopped);
        }
    } else if let Some(id) = id {
        let connection_file = runtime_dir().join(format!("{}{}.json", CONNECTION_FILE_PREFIX, id));
        stop_kernel_at(&connection_file).await?;
        println!("Kernel with ID {} stopped", id);
    } else {
        anyhow::bail!("Either provide a kernel ID or use --all to stop all kernels");
    }
    Ok(())
}

/// Ask the kernel behind a connection file to shut down, then remove the file.
///
/// The file is the only record of the kernel, so it is only removed once the
/// kernel stops answering heartbeats (or after a grace period).
async fn stop_kernel_at(path: &Path) -> Result<()> {
    let info = read_connection_info(path).await?;
    benchrun_exec::shutdown_kernel(&info).await?;

    for _ in 0..10 {
        if !check_kernel_alive(&info, Duration::from_millis(500)).await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    fs::remove_file(path).await?;
    Ok(())
}

async fn clean_kernels(timeout_secs: u64, dry_run: bool) -> Result<()> {
    let runtime_dir = runtime_dir();
    let mut entries = fs::read_dir(&runtime_dir).await?;

    let timeout = Duration::from_secs(timeout_secs);
    let mut cleaned = 0;
    let mut alive = 0;
    let mut errors = 0;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();

        // Only process kernel-*.json and benchrun-kernel-*.json files
        let file_name = path.file_name().and_then(|s| s.to_str()).unwrap_or("");
        let is_kernel_file =
            file_name.starts_with("kernel-") || file_name.starts_with(CONNECTION_FILE_PREFIX);
        if !is_kernel_file || path.extension().and_then(|s| s.to_str()) != Some("json") {
            continue;
        }

        let connection_info = match read_connection_info(&path).await {
            Ok(info) => info,
            Err(_) => {
                errors += 1;
                continue;
            }
        };

        let is_alive = check_kernel_alive(&connection_info, timeout).await;

        if is_alive {
            alive += 1;
        } else {
            if dry_run {
                println!("Would remove: {}", path.display());
            } else if let Err(e) = fs::remove_file(&path).await {
                eprintln!("Failed to remove {}: {}", path.display(), e);
                errors += 1;
            } else {
                println!("Removed: {}", path.display());
            }
            cleaned += 1;
        }
    }

    println!();
    if dry_run {
        println!(
            "Dry run complete: {} stale, {} alive, {} errors",
            cleaned, alive, errors
        );
    } else {
        println!(
            "Cleaned {} stale connection files ({} alive, {} errors)",
            cleaned, alive, errors
        );
    }

    Ok(())
}
