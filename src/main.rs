use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use beacon_talk::voice::{
    AmplitudeMonitor, AudioCaptureSession, AudioPayload, CpalMicrophone, CpalSink,
    PlaybackService, samples_to_wav,
};
use beacon_talk::{Activation, Config, HttpVoiceClient, RemoteVoiceClient, UtteranceController};

/// Time allowed past the submit timeout for capture flush and reply playback
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Beacon Talk - push-to-talk voice client
#[derive(Parser)]
#[command(name = "beacon-talk", version, about)]
struct Cli {
    /// Speech endpoint base URL
    #[arg(long, env = "BEACON_TALK_URL")]
    url: Option<String>,

    /// Skip the welcome prompt
    #[arg(long)]
    no_welcome: bool,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output
    TestSpeaker,
    /// Fetch and play the welcome prompt
    Welcome,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,beacon_talk=info",
        1 => "info,beacon_talk=debug",
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
    let mut config = Config::load()?;
    if let Some(url) = cli.url {
        config.remote.base_url = url.trim_end_matches('/').to_string();
    }
    if cli.no_welcome {
        config.welcome.enabled = false;
    }
    config.validate()?;
    tracing::debug!(?config, "loaded configuration");

    if let Some(cmd) = cli.command {
        return match cmd {
            Command::TestMic { duration } => test_mic(&config, duration).await,
            Command::TestSpeaker => test_speaker().await,
            Command::Welcome => play_welcome(&config).await,
        };
    }

    interactive(&config).await
}

/// Push-to-talk loop on stdin
async fn interactive(config: &Config) -> anyhow::Result<()> {
    tracing::info!(
        url = %config.remote.process_url(),
        welcome = config.welcome.enabled,
        "starting beacon talk"
    );

    let controller = UtteranceController::from_config(config);
    let mut events = controller.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    println!("Press Enter to talk, Enter again to stop early, q to quit.");

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line? {
                    Some(line) if line.trim().eq_ignore_ascii_case("q") => break,
                    Some(_) => match controller.activate() {
                        Activation::Started { session } => println!("[{session}] listening..."),
                        Activation::Stopping { session } => println!("[{session}] stopping"),
                        Activation::Ignored { state } => println!("busy ({state}), try again shortly"),
                    },
                    None => break,
                }
            }
            event = events.recv() => {
                match event {
                    Ok(event) => tracing::info!(session = event.session(), ?event, "controller event"),
                    Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "event receiver lagged"),
                    Err(RecvError::Closed) => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received shutdown signal");
                break;
            }
        }
    }

    // Let the last utterance reach the endpoint and play back
    let limit = config.remote.submit_timeout + SHUTDOWN_GRACE;
    if !controller.shutdown(limit).await {
        tracing::warn!(status = ?controller.status(), "session abandoned at shutdown");
    }
    tracing::info!(status = ?controller.status(), "shutting down");
    Ok(())
}

/// Live amplitude meter using the silence rule
async fn test_mic(config: &Config, duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let input = Arc::new(CpalMicrophone::new(&config.capture, &config.vad));
    let mut session = AudioCaptureSession::new(input, config.capture.container.clone());
    session.start().await?;

    let analyser = session
        .analyser()
        .ok_or_else(|| anyhow::anyhow!("capture opened without an analyser"))?;
    let monitor = AmplitudeMonitor::new(analyser, config.vad.silence_threshold);

    println!("Silence threshold: {:.1}", monitor.threshold());
    println!("---");

    let ticks = duration * 4;
    for i in 0..ticks {
        tokio::time::sleep(Duration::from_millis(250)).await;

        let sample = monitor.sample();

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (sample.mean() / 2.0).min(50.0) as usize;
        let meter: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);
        let label = if monitor.is_silent(sample) { "silent" } else { "active" };

        #[allow(clippy::cast_precision_loss)]
        let elapsed = (i + 1) as f32 / 4.0;
        println!("[{elapsed:5.2}s] mean: {:6.2} {label} | [{meter}]", sample.mean());
    }

    let utterance = session.finalize().await?;

    println!("\n---");
    match utterance {
        Some(u) => println!("Captured {} bytes ({})", u.len(), u.mime()),
        None => println!("Nothing captured"),
    }
    println!("If the meter moved and went active while you spoke, your mic is working!");
    println!("If it stayed silent, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");

    Ok(())
}

/// Test speaker output with a sine wave
async fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    // Generate 2 seconds of 440Hz sine wave at 24kHz sample rate
    let sample_rate = 24000_u32;
    let frequency = 440.0_f32;
    let num_samples = sample_rate as usize * 2;

    #[allow(clippy::cast_precision_loss)]
    let samples: Vec<f32> = (0..num_samples)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3 // 30% volume
        })
        .collect();

    println!("Playing {} samples at {} Hz...", samples.len(), sample_rate);

    let wav = samples_to_wav(&samples, sample_rate)?;
    let playback = PlaybackService::new(Arc::new(CpalSink::new()));
    playback.play(&AudioPayload::new(wav, "audio/wav")).await?;

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Run: pactl list sinks short");
    println!("  3. Try: pavucontrol (to check output levels)");

    Ok(())
}

/// Fetch and play the welcome prompt once
async fn play_welcome(config: &Config) -> anyhow::Result<()> {
    let client = HttpVoiceClient::new(&config.remote);
    println!("Fetching {}", client.welcome_url());

    let prompt = client.fetch_welcome_prompt().await?;
    println!("Playing {} bytes ({})", prompt.data.len(), prompt.mime);

    PlaybackService::new(Arc::new(CpalSink::new()))
        .play(&prompt)
        .await?;
    Ok(())
}
