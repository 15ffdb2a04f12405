//! Audiotrigger - acoustic event detector
//!
//! Entry point: load configuration, open the audio source, and run the
//! trigger engine until Ctrl+C or the end of a replayed file.

use anyhow::{Context, Result};
use audiotrigger::audio::source::{block_queue, AudioSource, CpalSource, WavFileSource};
use audiotrigger::bus::LogBus;
use audiotrigger::trigger::writer::DiskEventWriter;
use audiotrigger::{
    BroadcastBus, Calibrator, Engine, EngineContext, MessageBus, TriggerConfig, Weighting,
};
use audiotrigger_server::{AppState, ServerConfig};
use clap::{ArgAction, Parser};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{error, info};

/// Acoustic event detector
#[derive(Parser, Debug)]
#[command(name = "audiotrigger", version, about)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long, env = "AUDIOTRIGGER_CONFIG")]
    config: Option<PathBuf>,

    /// Input device name (empty = default device)
    #[arg(short, long, env = "AUDIOTRIGGER_DEVICE")]
    device: Option<String>,

    /// Requested sample rate in Hz
    #[arg(short = 'r', long, env = "AUDIOTRIGGER_SAMPLERATE")]
    samplerate: Option<u32>,

    /// Fast level threshold in dB
    #[arg(long, env = "AUDIOTRIGGER_THRESH_A80")]
    thresh_a80: Option<f64>,

    /// Slow level threshold in dB
    #[arg(long, env = "AUDIOTRIGGER_THRESH_A160")]
    thresh_a160: Option<f64>,

    /// Hold-off after each event, in seconds
    #[arg(long, env = "AUDIOTRIGGER_HOLD_SEC")]
    hold_sec: Option<f64>,

    /// Pre-roll kept before the trigger, in seconds
    #[arg(long, env = "AUDIOTRIGGER_PRE_TRIGGER")]
    pre_trigger: Option<f64>,

    /// Capture continues this long after the last exceedance, in seconds
    #[arg(long, env = "AUDIOTRIGGER_POST_TRIGGER")]
    post_trigger: Option<f64>,

    /// Exceedance must persist this long before an event opens, in seconds
    #[arg(long, env = "AUDIOTRIGGER_CONFIRM_SEC")]
    confirm_sec: Option<f64>,

    /// Longest single event, in seconds
    #[arg(long, env = "AUDIOTRIGGER_MAX_EVENT_SEC")]
    max_event_sec: Option<f64>,

    /// Directory for captured events
    #[arg(long, env = "AUDIOTRIGGER_EVENT_DIR")]
    event_dir: Option<PathBuf>,

    /// Calibration file
    #[arg(long, env = "AUDIOTRIGGER_CAL_FILE")]
    cal_file: Option<PathBuf>,

    /// Base for all bus topics
    #[arg(long, env = "AUDIOTRIGGER_TOPIC_BASE")]
    topic_base: Option<String>,

    /// Status server port (0 disables the server)
    #[arg(long, env = "AUDIOTRIGGER_UI_PORT")]
    ui_port: Option<u16>,

    /// Publish periodic third-octave spectra (true/false)
    #[arg(long, env = "AUDIOTRIGGER_PUBLISH_SPECTRUM", action = ArgAction::Set, value_name = "BOOL")]
    publish_spectrum: Option<bool>,

    /// Spectrum weighting: A, C or Z
    #[arg(long, env = "AUDIOTRIGGER_SPECTRUM_WEIGHTING")]
    spectrum_weighting: Option<Weighting>,

    /// Spectrum publish interval in seconds
    #[arg(long, env = "AUDIOTRIGGER_SPECTRUM_INTERVAL")]
    spectrum_interval: Option<f64>,

    /// Message bus host
    #[arg(long, env = "AUDIOTRIGGER_BUS_HOST")]
    bus_host: Option<String>,

    /// Message bus port
    #[arg(long, env = "AUDIOTRIGGER_BUS_PORT")]
    bus_port: Option<u16>,

    /// Message bus username
    #[arg(long, env = "AUDIOTRIGGER_BUS_USERNAME")]
    bus_username: Option<String>,

    /// Message bus password
    #[arg(long, env = "AUDIOTRIGGER_BUS_PASSWORD", hide_env_values = true)]
    bus_password: Option<String>,

    /// Replay a WAV file instead of capturing from a device
    #[arg(long, value_name = "WAV")]
    replay: Option<PathBuf>,

    /// Pace the replay at the file's sample rate
    #[arg(long, requires = "replay")]
    realtime: bool,

    /// List input devices and exit
    #[arg(short, long)]
    list: bool,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Save the effective configuration to a file and exit
    #[arg(long, value_name = "PATH")]
    write_config: Option<PathBuf>,
}

impl Cli {
    /// Flags take precedence over file values
    fn apply(&self, config: &mut TriggerConfig) {
        if let Some(device) = &self.device {
            config.device = device.clone();
        }
        if let Some(v) = self.samplerate {
            config.samplerate = v;
        }
        if let Some(v) = self.thresh_a80 {
            config.thresh_a80 = v;
        }
        if let Some(v) = self.thresh_a160 {
            config.thresh_a160 = v;
        }
        if let Some(v) = self.hold_sec {
            config.hold_sec = v;
        }
        if let Some(v) = self.pre_trigger {
            config.pre_trigger = v;
        }
        if let Some(v) = self.post_trigger {
            config.post_trigger = v;
        }
        if let Some(v) = self.confirm_sec {
            config.confirm_sec = v;
        }
        if let Some(v) = self.max_event_sec {
            config.max_event_sec = v;
        }
        if let Some(dir) = &self.event_dir {
            config.event_dir = dir.clone();
        }
        if let Some(path) = &self.cal_file {
            config.cal_file = path.clone();
        }
        if let Some(base) = &self.topic_base {
            config.topic_base = base.clone();
        }
        if let Some(port) = self.ui_port {
            config.ui_port = port;
        }
        if let Some(enabled) = self.publish_spectrum {
            config.spectrum.enabled = enabled;
        }
        if let Some(weighting) = self.spectrum_weighting {
            config.spectrum.weighting = weighting;
        }
        if let Some(interval) = self.spectrum_interval {
            config.spectrum.interval = interval;
        }
        if let Some(host) = &self.bus_host {
            config.bus.host = host.clone();
        }
        if let Some(port) = self.bus_port {
            config.bus.port = port;
        }
        if let Some(username) = &self.bus_username {
            config.bus.username = username.clone();
        }
        if let Some(password) = &self.bus_password {
            config.bus.password = password.clone();
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("audiotrigger=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    if cli.list {
        return list_devices();
    }

    let mut config = match &cli.config {
        Some(path) => TriggerConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => TriggerConfig::default(),
    };
    cli.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    if cli.print_config {
        println!("{}", serde_json::to_string_pretty(&config.redacted())?);
        return Ok(());
    }
    if let Some(path) = &cli.write_config {
        config
            .save(path)
            .with_context(|| format!("Failed to write config {}", path.display()))?;
        return Ok(());
    }

    info!(version = audiotrigger::VERSION, "Audiotrigger starting");
    run(config, &cli)
}

fn list_devices() -> Result<()> {
    let devices = CpalSource::list_devices().context("Failed to enumerate input devices")?;
    if devices.is_empty() {
        println!("No input devices found");
    }
    for name in devices {
        println!("{}", name);
    }
    Ok(())
}

fn run(config: TriggerConfig, cli: &Cli) -> Result<()> {
    let calibrator = Calibrator::load(&config.cal_file, &config.device)
        .with_context(|| format!("Failed to load calibration {}", config.cal_file.display()))?;

    let mut source: Box<dyn AudioSource> = match &cli.replay {
        Some(path) => Box::new(WavFileSource::new(path, cli.realtime)),
        None => Box::new(CpalSource::new(&config.device, config.samplerate)),
    };
    let sample_rate = source.open().context("Failed to open audio source")?;
    let device = source.describe();
    info!(%device, sample_rate, "Audio source opened");

    let ctx = EngineContext::init(config, sample_rate, calibrator)?;
    let config = Arc::clone(&ctx.config);
    let counters = Arc::clone(&ctx.counters);
    let block_len = ctx.block_len;

    let sink = DiskEventWriter::new(
        config.event_dir.clone(),
        sample_rate,
        TriggerConfig::frames(config.pre_trigger, sample_rate),
        ctx.calibrator.clone(),
    );

    let stop = Arc::new(AtomicBool::new(false));
    let handler_stop = Arc::clone(&stop);
    ctrlc::set_handler(move || {
        handler_stop.store(true, Ordering::Release);
    })
    .context("Failed to install Ctrl+C handler")?;

    let (bus, server): (Arc<dyn MessageBus>, Option<JoinHandle<()>>) = if config.ui_port == 0 {
        (Arc::new(LogBus), None)
    } else {
        let bus = BroadcastBus::default();
        let state = AppState::new(ctx.status_handle(), bus.clone(), &config, Some(device));
        let server = spawn_server(state, ServerConfig::from_trigger_config(&config), Arc::clone(&stop))
            .context("Failed to start status server thread")?;
        (Arc::new(bus), Some(server))
    };

    let mut engine = Engine::init(ctx, Box::new(sink), bus)?;

    let (producer, consumer) = block_queue(config.queue_blocks, counters);
    source
        .start(block_len, producer)
        .context("Failed to start audio source")?;

    let result = engine.run(&consumer, &stop);
    source.stop();
    let counters = engine.shutdown();

    stop.store(true, Ordering::Release);
    if let Some(server) = server {
        let _ = server.join();
    }

    result.context("Audio source failed")?;
    info!(
        events_persisted = counters.events_persisted,
        persistence_failures = counters.persistence_failures,
        "Audiotrigger stopped"
    );
    Ok(())
}

/// Run the status server on its own thread with a dedicated runtime
fn spawn_server(
    state: AppState,
    server_config: ServerConfig,
    stop: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("status-server".into())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    error!(error = %e, "Failed to build server runtime");
                    return;
                }
            };
            let shutdown = async move {
                while !stop.load(Ordering::Acquire) {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
            };
            if let Err(e) =
                runtime.block_on(audiotrigger_server::start_server(state, &server_config, shutdown))
            {
                // The engine keeps running without its status surface
                error!(error = %e, port = server_config.port, "Status server error");
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> TriggerConfig {
        let cli = Cli::try_parse_from(std::iter::once("audiotrigger").chain(args.iter().copied()))
            .unwrap();
        let mut config = TriggerConfig::default();
        cli.apply(&mut config);
        config
    }

    #[test]
    fn test_no_flags_keep_file_values() {
        let mut expected = TriggerConfig::default();
        expected.thresh_a80 = 77.0;
        let mut config = expected.clone();
        Cli::try_parse_from(["audiotrigger"]).unwrap().apply(&mut config);
        assert_eq!(config, expected);
    }

    #[test]
    fn test_trigger_flags() {
        let config = parse(&[
            "--thresh-a80",
            "82.5",
            "--thresh-a160",
            "75",
            "--hold-sec",
            "4",
            "--max-event-sec",
            "120",
            "--ui-port",
            "0",
        ]);
        assert_eq!(config.thresh_a80, 82.5);
        assert_eq!(config.thresh_a160, 75.0);
        assert_eq!(config.hold_sec, 4.0);
        assert_eq!(config.max_event_sec, 120.0);
        assert_eq!(config.ui_port, 0);
    }

    #[test]
    fn test_spectrum_flags() {
        let config = parse(&[
            "--publish-spectrum",
            "false",
            "--spectrum-weighting",
            "c",
            "--spectrum-interval",
            "0.5",
        ]);
        assert!(!config.spectrum.enabled);
        assert_eq!(config.spectrum.weighting, Weighting::C);
        assert_eq!(config.spectrum.interval, 0.5);

        assert!(Cli::try_parse_from(["audiotrigger", "--spectrum-weighting", "B"]).is_err());
    }

    #[test]
    fn test_bus_flags() {
        let config = parse(&[
            "--bus-host",
            "broker.lan",
            "--bus-port",
            "1884",
            "--bus-username",
            "mic",
            "--bus-password",
            "pw",
        ]);
        assert_eq!(config.bus.host, "broker.lan");
        assert_eq!(config.bus.port, 1884);
        assert_eq!(config.bus.username, "mic");
        assert_eq!(config.bus.password, "pw");
    }

    #[test]
    fn test_realtime_requires_replay() {
        assert!(Cli::try_parse_from(["audiotrigger", "--realtime"]).is_err());
        assert!(Cli::try_parse_from(["audiotrigger", "--replay", "in.wav", "--realtime"]).is_ok());
    }
}
