use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Duration, Utc};
use clap::{Args as ClapArgs, Parser, Subcommand};
use snapper_core::session::{
    DeviceSession, RecordingWindow, ReferenceLocation, SessionConfig, UploadOptions,
    UploadSummary, upload_archive,
};
use snapper_core::upload::{HttpBackend, ProcessingPriority, UploadRequest};
use snapper_core::{ImportedArchive, TracingObserver};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "SnapperGPS receiver tool", long_about = None)]
struct Args {
    /// Path to a TOML session config
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Upload server base URL
    #[arg(long, global = true)]
    backend: Option<String>,

    /// Concurrent snapshot uploads
    #[arg(long, global = true)]
    workers: Option<usize>,

    /// Do not set the device clock on connect
    #[arg(long, global = true)]
    no_time_sync: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Show device status
    Info,
    /// Set the device clock to the host clock
    SetTime,
    /// Schedule a recording
    Start {
        /// Seconds between snapshots
        #[arg(long, default_value_t = 60)]
        interval: u32,
        /// Start of recording (RFC 3339), defaults to now
        #[arg(long)]
        start: Option<String>,
        /// End of recording (RFC 3339)
        #[arg(long, conflicts_with = "hours")]
        end: Option<String>,
        /// Recording length in hours from the start
        #[arg(long)]
        hours: Option<i64>,
    },
    /// Shut the device down once unplugged
    Shutdown,
    /// Copy stored snapshots into a directory
    Transfer {
        #[arg(short, long, default_value = "snapshots")]
        out: PathBuf,
    },
    /// Upload stored snapshots for processing
    Upload(UploadArgs),
    /// Upload snapshots from an archive JSON file, without a device
    UploadFile {
        /// JSON document written by `transfer`
        json: PathBuf,
        #[command(flatten)]
        upload: UploadArgs,
    },
    /// Flash a firmware binary
    Flash { firmware: PathBuf },
}

#[derive(ClapArgs, Debug)]
struct UploadArgs {
    #[arg(long)]
    email: String,
    #[arg(long, default_value = "")]
    nickname: String,
    /// Maximum receiver velocity in m/s
    #[arg(long, default_value_t = 0.0)]
    max_velocity: f64,
    /// immediate, rapid or delayed
    #[arg(long, default_value = "delayed")]
    priority: ProcessingPriority,
    /// Known start and end latitude
    #[arg(long, requires = "lng", allow_hyphen_values = true)]
    lat: Option<f64>,
    /// Known start and end longitude
    #[arg(long, requires = "lat", allow_hyphen_values = true)]
    lng: Option<f64>,
}

impl UploadArgs {
    fn request(&self, device_id: String) -> UploadRequest {
        UploadRequest {
            device_id,
            email: self.email.clone(),
            max_velocity: self.max_velocity,
            nickname: self.nickname.clone(),
            subscription: None,
        }
    }

    fn options(&self) -> UploadOptions {
        let reference = self.lat.zip(self.lng).map(|(lat, lng)| ReferenceLocation {
            lat,
            lng,
            start: None,
            end: None,
        });
        UploadOptions {
            priority: self.priority,
            reference,
        }
    }
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("'{value}' is not an RFC 3339 timestamp"))?;
    Ok(parsed.with_timezone(&Utc))
}

/// `start` plus `hours`, refusing lengths chrono cannot represent.
fn end_after_hours(start: DateTime<Utc>, hours: i64) -> Result<DateTime<Utc>> {
    Duration::try_hours(hours)
        .and_then(|length| start.checked_add_signed(length))
        .with_context(|| format!("--hours {hours} is out of range"))
}

fn load_config(args: &Args) -> Result<SessionConfig> {
    let mut config = match &args.config {
        Some(path) => SessionConfig::load_from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SessionConfig::default(),
    };
    if let Some(url) = &args.backend {
        config.backend_url = url.clone();
    }
    if let Some(workers) = args.workers {
        config.max_workers = workers;
    }
    Ok(config)
}

fn run(args: Args) -> Result<()> {
    let config = load_config(&args)?;
    match args.command {
        Cmd::UploadFile { json, upload } => upload_file(&config, &json, &upload),
        command => run_on_device(config, command, args.no_time_sync),
    }
}

fn run_on_device(config: SessionConfig, command: Cmd, no_time_sync: bool) -> Result<()> {
    let session = DeviceSession::open(config)?;

    if !no_time_sync && !matches!(command, Cmd::Flash { .. }) {
        session.set_time(Utc::now())?;
    }

    match command {
        Cmd::Info => {
            let info = session.refresh_info()?;
            println!("Device ID:        {}", info.device_id_hex());
            println!(
                "Firmware:         {} {}",
                info.firmware_description, info.firmware_version
            );
            println!("Status:           {}", info.status);
            println!("Snapshots:        {}", info.snapshot_count);
            println!("Battery:          {:.2} V", info.battery_voltage);
            println!("Device time:      {}", info.time);
            let [x, y, z] = info.motion.acceleration_g();
            println!("Acceleration (g): {x:.3} {y:.3} {z:.3}");
        }
        Cmd::SetTime => {
            if no_time_sync {
                session.set_time(Utc::now())?;
            }
            println!("Device clock set");
        }
        Cmd::Start {
            interval,
            start,
            end,
            hours,
        } => {
            let start = match start {
                Some(s) => parse_time(&s)?,
                None => Utc::now(),
            };
            let end = match (end, hours) {
                (Some(e), _) => parse_time(&e)?,
                (None, Some(h)) => end_after_hours(start, h)?,
                (None, None) => bail!("either --end or --hours is required"),
            };
            session.start_recording(RecordingWindow {
                interval_secs: interval,
                start,
                end,
            })?;
            println!("Recording from {start} to {end} every {interval}s");
        }
        Cmd::Shutdown => {
            session.shutdown()?;
            println!("Device will shut down when unplugged");
        }
        Cmd::Transfer { out } => {
            let summary = session.export_snapshots(&out)?;
            println!(
                "Wrote {} snapshots to {} ({})",
                summary.snapshots,
                out.display(),
                summary.json.display()
            );
        }
        Cmd::Upload(upload) => {
            let info = session.refresh_info()?;
            let backend = HttpBackend::new(session.config().backend_url.clone())?;
            let summary = session.upload_snapshots(
                &backend,
                &upload.request(info.device_id_hex()),
                &upload.options(),
            )?;
            report(&summary, "No snapshots on the device, nothing uploaded");
        }
        Cmd::UploadFile { json, upload } => upload_file(session.config(), &json, &upload)?,
        Cmd::Flash { firmware } => {
            let binary = std::fs::read(&firmware)
                .with_context(|| format!("reading {}", firmware.display()))?;
            let crc = session.update_firmware(&binary)?;
            println!("Firmware flashed (CRC 0x{crc:04X}), device is restarting");
        }
    }
    Ok(())
}

fn upload_file(config: &SessionConfig, json: &Path, upload: &UploadArgs) -> Result<()> {
    let archive = ImportedArchive::read(json)
        .with_context(|| format!("reading {}", json.display()))?;
    let backend = HttpBackend::new(config.backend_url.clone())?;
    let summary = upload_archive(
        &backend,
        &upload.request(archive.device_id),
        archive.snapshots,
        &upload.options(),
        config,
        &TracingObserver,
    )?;
    report(&summary, "The file holds no snapshots, nothing uploaded");
    Ok(())
}

fn report(summary: &UploadSummary, when_empty: &str) {
    for failure in &summary.report.failures {
        warn!("{failure}");
    }
    match &summary.earliest_processing {
        Some(date) => println!(
            "Uploaded {}/{} snapshots as {} (processing from {date})",
            summary.report.uploaded, summary.report.enqueued, summary.upload_id
        ),
        None => println!("{when_empty}"),
    }
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to install logger: {e}");
    }

    info!("Starting snapper (nusb backend)...");

    if let Err(e) = run(args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_end_after_hours() {
        let start = Utc.timestamp_opt(1_650_000_000, 0).unwrap();
        assert_eq!(
            end_after_hours(start, 2).unwrap(),
            Utc.timestamp_opt(1_650_007_200, 0).unwrap()
        );
    }

    #[test]
    fn test_out_of_range_hours_are_an_error() {
        let start = Utc.timestamp_opt(1_650_000_000, 0).unwrap();
        // Too large for a chrono duration.
        assert!(end_after_hours(start, i64::MAX).is_err());
        // A valid duration, but past the last representable date.
        assert!(end_after_hours(start, 10_000_000_000).is_err());
        assert!(end_after_hours(start, i64::MIN).is_err());
    }

    #[test]
    fn test_upload_file_parses_without_device_flags() {
        let args = Args::try_parse_from([
            "snapper",
            "upload-file",
            "walk.json",
            "--email",
            "someone@example.com",
            "--lat",
            "-0.5",
            "--lng",
            "52.2",
        ])
        .unwrap();
        let Cmd::UploadFile { json, upload } = args.command else {
            panic!("expected upload-file");
        };
        assert_eq!(json, PathBuf::from("walk.json"));
        let options = upload.options();
        assert_eq!(options.priority, ProcessingPriority::Delayed);
        assert_eq!(options.reference.map(|r| r.lat), Some(-0.5));
        assert_eq!(upload.request("ABC".into()).device_id, "ABC");
    }
}
