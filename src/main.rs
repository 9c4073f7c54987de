mod audio;
mod chat;
mod config;
mod dialogue;
mod interceptor;
mod replay;
mod router;
mod service;
mod typing;
mod watch;

use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use log::{error, info, warn, LevelFilter};

use audio::{AudioFormat, ChunkAssembler};
use chat::ChatLine;
use config::StoryConfig;

#[derive(Parser)]
#[command(name = "npc-typing-client", about = "Routes NPC typing indicators out of the chat feed")]
struct Cli {
    /// Config file (defaults to config.toml next to the executable).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level regardless of config.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Replay a recorded chat log, one payload per line ("-" for stdin).
    Replay {
        input: PathBuf,
        #[arg(long, default_value_t = config::TICKS_PER_SECOND)]
        ticks_per_line: u32,
        /// Emit typing events and dialogue snapshots as JSON lines.
        #[arg(long)]
        json: bool,
    },
    /// Read live payloads from stdin and run the typing service in real time.
    Watch,
    /// Reassemble recorded voice payloads, one file per packet, into clips.
    Audio {
        inputs: Vec<PathBuf>,
        /// Directory the finished clips are written to.
        #[arg(long, default_value = ".")]
        out: PathBuf,
    },
}

// ─── Logging & history helpers ────────────────────────────────────────

const MAX_LOG_SIZE: u64 = 10 * 1024 * 1024; // 10 MB

fn rotate_file(path: &Path) {
    if let Ok(meta) = std::fs::metadata(path) {
        if meta.len() >= MAX_LOG_SIZE {
            let old = path.with_extension("old");
            let _ = std::fs::rename(path, old);
        }
    }
}

fn setup_logging(dir: &Path, level: LevelFilter) {
    let log_path = dir.join("npc-typing.log");
    rotate_file(&log_path);

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path);

    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                humantime::format_rfc3339_millis(std::time::SystemTime::now()),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stderr());

    if let Ok(file) = log_file {
        dispatch = dispatch.chain(file);
    } else {
        eprintln!("Warning: could not open log file {}", log_path.display());
    }

    if let Err(e) = dispatch.apply() {
        eprintln!("Warning: logger already initialized: {}", e);
    }
}

fn append_chat_history(dir: &Path, lines: &[&ChatLine]) {
    if lines.is_empty() {
        return;
    }
    let history_path = dir.join("chat.history");
    rotate_file(&history_path);

    let Ok(mut file) = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&history_path)
    else {
        error!("Failed to open chat history file");
        return;
    };

    let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
    for line in lines {
        let _ = writeln!(file, "[{}] {}", now, line.display_line());
    }
}

// ─── Commands ────────────────────────────────────────────────────────

fn run_replay(
    input: &Path,
    config: &StoryConfig,
    options: replay::ReplayOptions,
    data_dir: &Path,
) -> io::Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let finished = if input.as_os_str() == "-" {
        replay::run(io::stdin().lock(), config, options, &mut out)?
    } else {
        let file = std::fs::File::open(input)?;
        replay::run(BufReader::new(file), config, options, &mut out)?
    };
    let lines: Vec<&ChatLine> = finished.history().messages().collect();
    append_chat_history(data_dir, &lines);
    Ok(())
}

fn run_watch(config: &StoryConfig, data_dir: &Path) -> io::Result<()> {
    let stdin = io::stdin();
    watch::run(stdin.lock(), config, io::stdout(), |line| {
        append_chat_history(data_dir, &[line])
    })?;
    Ok(())
}

fn run_audio(inputs: &[PathBuf], out_dir: &Path) -> io::Result<()> {
    std::fs::create_dir_all(out_dir)?;
    let mut assembler = ChunkAssembler::new();
    let mut clips = 0usize;

    for input in inputs {
        let payload = std::fs::read(input)?;
        let clip = match assembler.receive(&payload) {
            Ok(Some(clip)) => clip,
            Ok(None) => continue,
            Err(e) => {
                warn!("Voice payload {} rejected: {}", input.display(), e);
                continue;
            }
        };
        clips += 1;
        let stem = clip.audio_id.clone().unwrap_or_else(|| format!("clip-{clips}"));
        let path = out_dir.join(format!("{stem}.{}", clip.format.extension()));
        let bytes = match clip.format {
            AudioFormat::Mp3 => audio::skip_id3(&clip.data),
            AudioFormat::Wav | AudioFormat::Raw => clip.data.as_slice(),
        };
        std::fs::write(&path, bytes)?;
        println!("[audio] {} ({} bytes)", path.display(), bytes.len());
    }

    let pending: Vec<String> = assembler.pending_ids().map(str::to_owned).collect();
    for id in pending {
        if let Some(missing) = assembler.missing(&id) {
            warn!("Audio {} incomplete, missing chunk(s) {:?}", id, missing);
        }
        assembler.evict(&id);
    }
    info!("{} audio clip(s) written to {}", clips, out_dir.display());
    Ok(())
}

// ─── Main ────────────────────────────────────────────────────────────

fn main() {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(config::default_config_path);
    let data_dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(config::config_dir);

    // Read the config before logging starts so its level applies; the
    // load itself is logged again once the logger is up.
    let level = StoryConfig::load_from(&config_path)
        .map(|c| c.level_filter())
        .unwrap_or(LevelFilter::Info);
    let level = if cli.verbose { LevelFilter::Debug } else { level };
    setup_logging(&data_dir, level);

    info!("NPC typing client starting");
    let config = StoryConfig::load_or_create(&config_path);

    let result = match cli.command {
        Command::Replay {
            input,
            ticks_per_line,
            json,
        } => run_replay(
            &input,
            &config,
            replay::ReplayOptions {
                ticks_per_line,
                json,
            },
            &data_dir,
        ),
        Command::Watch => run_watch(&config, &data_dir),
        Command::Audio { inputs, out } => run_audio(&inputs, &out),
    };

    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }
}
