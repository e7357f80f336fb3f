use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::EnvFilter;

use companion_live::fallback::Turn;
use companion_live::voice::{
    AudioBackend, AudioFrame, CAPTURE_SAMPLE_RATE, CaptureQueue, PLAYBACK_SAMPLE_RATE,
    capture_channel, encode_capture, f32_to_i16, i16_to_f32, playback_channel, write_wav,
};
use companion_live::{
    Config, CpalBackend, FallbackClient, SessionContext, SessionCoordinator, SessionPhase,
    WsConnector,
};

/// Samples per test-speaker frame (100 ms at the playback rate)
const TONE_FRAME_LEN: usize = 2_400;

/// Companion - live voice conversations grounded in a person's memories
#[derive(Parser)]
#[command(name = "companion", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,

    /// Profile JSON used when no subcommand is given
    #[arg(short, long, env = "COMPANION_PROFILE")]
    profile: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Hold a live voice conversation (default)
    Talk {
        /// Profile JSON with the user's name, family and memories
        #[arg(short, long, env = "COMPANION_PROFILE")]
        profile: PathBuf,
    },
    /// Print the grounding instruction for a profile
    Instruction {
        /// Profile JSON
        #[arg(short, long, env = "COMPANION_PROFILE")]
        profile: PathBuf,
    },
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,

        /// Save the encoded 16 kHz capture as a WAV file
        #[arg(long)]
        save: Option<PathBuf>,
    },
    /// Test speaker output
    TestSpeaker,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,companion_live=info",
        1 => "info,companion_live=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Some(Command::Talk { profile }) => talk(&profile).await,
        Some(Command::Instruction { profile }) => {
            let context = SessionContext::from_json_file(&profile)?;
            println!("{}", context.system_instruction());
            Ok(())
        }
        Some(Command::TestMic { duration, save }) => test_mic(duration, save.as_deref()).await,
        Some(Command::TestSpeaker) => test_speaker().await,
        None => {
            let profile = cli
                .profile
                .ok_or_else(|| anyhow::anyhow!("--profile is required"))?;
            talk(&profile).await
        }
    }
}

/// Run one live session, falling back to text if it fails
async fn talk(profile: &Path) -> anyhow::Result<()> {
    let config = Config::load()?;
    let context = SessionContext::from_json_file(profile)?;

    let coordinator = SessionCoordinator::new(
        config.live.clone(),
        Arc::new(WsConnector::new(config.live.connect_timeout)),
        Arc::new(CpalBackend::new()),
    );
    let mut phases = coordinator.begin(context.clone())?;

    println!("Starting session for {} (Ctrl-C to end)\n", context.user_name);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut ending = false;
    let mut failure = None;

    loop {
        tokio::select! {
            phase = phases.next() => {
                let Some(phase) = phase else { break };
                println!("[{phase}]");
                if let SessionPhase::Error(reason) = phase {
                    failure = Some(reason);
                }
            }
            _ = &mut ctrl_c, if !ending => {
                ending = true;
                println!();
                coordinator.end().await;
            }
        }
    }
    coordinator.end().await;

    if let Some(reason) = failure {
        tracing::warn!(%reason, "live session unavailable, switching to text");
        return fallback_repl(&config, &context).await;
    }

    Ok(())
}

/// Text request/response conversation on stdin/stdout
async fn fallback_repl(config: &Config, context: &SessionContext) -> anyhow::Result<()> {
    let client = FallbackClient::new(config.fallback.clone(), context)?;
    let mut history: Vec<Turn> = Vec::new();

    println!("\nVoice is unavailable right now. Type to talk, or 'quit' to leave.\n");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        if text.eq_ignore_ascii_case("quit") {
            break;
        }

        match client.reply(&history, text).await {
            Ok(reply) => {
                println!("{reply}\n");
                history.push(Turn::user(text));
                history.push(Turn::model(reply));
            }
            Err(e) => println!("(could not reach the companion: {e})\n"),
        }
    }

    Ok(())
}

/// Test microphone input through the capture pipeline's encoder
async fn test_mic(duration: u64, save: Option<&Path>) -> anyhow::Result<()> {
    println!("Recording {duration}s from the default input device, say something");

    let (producer, queue) = capture_channel(256);
    let (_playback, renderer) = playback_channel();
    let device = CpalBackend::new().start(producer, renderer)?;

    println!("Levels after encoding to {CAPTURE_SAMPLE_RATE} Hz mono:\n");

    let mut recorded: Vec<i16> = Vec::new();
    for second in 1..=duration {
        tokio::time::sleep(Duration::from_secs(1)).await;

        let samples = drain_encoded(&queue)?;
        let energy = calculate_rms(&samples);
        let peak = samples
            .iter()
            .map(|&s| i16_to_f32(s).abs())
            .fold(0.0f32, f32::max);

        println!("{second:>3}s  rms {energy:.4}  peak {peak:.4}  {}", level_bar(energy));

        recorded.extend(samples);
    }

    device.shutdown();

    if queue.dropped_buffers() > 0 {
        println!("\n{} buffers dropped (backlog full)", queue.dropped_buffers());
    }

    if let Some(path) = save {
        let frame = AudioFrame::new(recorded, CAPTURE_SAMPLE_RATE, 1);
        write_wav(path, &frame)?;
        println!("\nSaved {:.1}s to {}", frame.duration().as_secs_f32(), path.display());
    }

    println!("\nA flat bar the whole time means no input reached the session.");
    println!("Check the default source with `pactl get-default-source` or `arecord -l`.");

    Ok(())
}

/// Encode everything queued so far into 16 kHz samples
fn drain_encoded(queue: &CaptureQueue) -> anyhow::Result<Vec<i16>> {
    let mut samples = Vec::new();
    while let Ok(Some(buffer)) = queue.try_next() {
        if let Some(frame) = encode_capture(&buffer.samples, buffer.sample_rate, buffer.channels)? {
            samples.extend(frame.into_samples());
        }
    }
    Ok(samples)
}

/// Root mean square of normalised samples
#[allow(clippy::cast_precision_loss)]
fn calculate_rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let power: f32 = samples.iter().map(|&s| i16_to_f32(s).powi(2)).sum();
    (power / samples.len() as f32).sqrt()
}

/// Fixed-width level bar, full at an RMS of 0.4
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss
)]
fn level_bar(rms: f32) -> String {
    const WIDTH: usize = 40;
    let filled = ((rms / 0.4).clamp(0.0, 1.0) * WIDTH as f32) as usize;
    format!("|{}{}|", "#".repeat(filled), ".".repeat(WIDTH - filled))
}

/// Test speaker output with a sine wave through the playback queue
async fn test_speaker() -> anyhow::Result<()> {
    println!("Playing a 2s 440 Hz tone through the playback queue");

    let (producer, _queue) = capture_channel(1);
    let (playback, renderer) = playback_channel();
    let device = CpalBackend::new().start(producer, renderer)?;

    // Queue the tone as 100 ms frames, the way response audio arrives
    for chunk in 0..20 {
        let samples = (0..TONE_FRAME_LEN)
            .map(|n| tone_sample(chunk * TONE_FRAME_LEN + n))
            .collect();
        playback.enqueue(AudioFrame::new(samples, PLAYBACK_SAMPLE_RATE, 1));
    }

    while playback.is_playing() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    // Let the device drain its own buffer
    tokio::time::sleep(Duration::from_millis(200)).await;
    device.shutdown();

    println!("Silence means the output device is muted or not the default sink.");
    println!("Check it with `pactl get-default-sink`.");

    Ok(())
}

#[allow(clippy::cast_precision_loss)]
fn tone_sample(index: usize) -> i16 {
    let t = index as f32 / PLAYBACK_SAMPLE_RATE as f32;
    f32_to_i16((std::f32::consts::TAU * 440.0 * t).sin() * 0.3)
}
