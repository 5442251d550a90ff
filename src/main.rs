//! Pi-shutter binary for exercising preview, capture and scheduling.
//!
//! Usage: `pi-shutter [OUTPUT_DIR] [--frames N] [--schedule SECS]`
//!
//! Without `--schedule` it runs the preview/capture exercise: capture before
//! preview, preview a few frames, capture mid-preview, read more frames, stop
//! preview and capture once more. With `--schedule` it binds a directory
//! project captured every `SECS` seconds until Ctrl-C.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use pi_shutter::validation::validate_jpeg;
use pi_shutter::{Arbiter, Config, DeviceSession, PreviewFrames, Project, Scheduler, V4L2Driver};
use tracing::{info, warn};

const DEFAULT_FRAMES: usize = 10;

/// Time-lapse project writing `<name>-<n>.jpg` files into a directory.
struct DirProject {
    name: String,
    dir: PathBuf,
    interval: Duration,
    count: AtomicU64,
}

impl Project for DirProject {
    fn name(&self) -> &str {
        &self.name
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn save_image(&self, image: &[u8]) -> Result<()> {
        validate_jpeg(image)?;
        let n = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        let path = self.dir.join(format!("{}-{n}.jpg", self.name));
        std::fs::write(&path, image).with_context(|| format!("writing {}", path.display()))?;
        info!(path = %path.display(), bytes = image.len(), "saved image");
        Ok(())
    }

    fn close(&self) -> Result<()> {
        info!(
            project = %self.name,
            images = self.count.load(Ordering::SeqCst),
            "project closed"
        );
        Ok(())
    }
}

struct Args {
    output: PathBuf,
    frames: usize,
    schedule: Option<Duration>,
}

impl Args {
    fn parse() -> Result<Self> {
        let mut output = PathBuf::from(".");
        let mut frames = DEFAULT_FRAMES;
        let mut schedule = None;

        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--frames" => {
                    let value = args.next().context("--frames needs a value")?;
                    frames = value.parse().context("invalid --frames")?;
                }
                "--schedule" => {
                    let value = args.next().context("--schedule needs a value")?;
                    let secs: u64 = value.parse().context("invalid --schedule")?;
                    schedule = Some(Duration::from_secs(secs.max(1)));
                }
                _ => output = PathBuf::from(arg),
            }
        }

        Ok(Self {
            output,
            frames,
            schedule,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("pi_shutter=info".parse()?),
        )
        .init();

    let args = Args::parse()?;
    let config = Config::from_env()?;

    info!("Pi-shutter starting");
    info!("  Device: {}", config.device);
    info!("  Preview: {}", config.preview);
    info!("  Capture: {}", config.capture);

    tokio::fs::create_dir_all(&args.output)
        .await
        .with_context(|| format!("creating {}", args.output.display()))?;

    let session = DeviceSession::new(
        Arc::new(V4L2Driver::new()),
        config.device.as_str(),
        config.session,
    );
    match session.get_max_size().await {
        Ok((width, height)) => info!("  Sensor max: {width}x{height}"),
        Err(err) => warn!(error = %err, "could not query frame sizes"),
    }
    let arbiter = Arc::new(Arbiter::new(Arc::new(session), config.resume));

    match args.schedule {
        Some(interval) => schedule(arbiter, &config, &args.output, interval).await,
        None => exercise(&arbiter, &config, &args.output, args.frames).await,
    }
}

async fn exercise(arbiter: &Arbiter, config: &Config, output: &Path, frames: usize) -> Result<()> {
    let (cw, ch) = (config.capture.width, config.capture.height);

    let image = arbiter.capture(cw, ch).await.context("capture before preview")?;
    save(output, "before", &image).await?;

    let preview = arbiter
        .start_preview(config.preview.width, config.preview.height)
        .await
        .context("starting preview")?;

    match arbiter.known_ctrl_configs().await {
        Ok(configs) => {
            for ctrl in configs {
                info!(id = ctrl.id, name = %ctrl.name, value = ctrl.value, "control");
            }
        }
        Err(err) => warn!(error = %err, "could not read controls"),
    }

    read_frames(&preview, frames).await?;

    let image = arbiter.capture(cw, ch).await.context("capture during preview")?;
    save(output, "during", &image).await?;

    read_frames(&preview, frames).await?;

    arbiter.stop_preview().await.context("stopping preview")?;

    let image = arbiter.capture(cw, ch).await.context("capture after preview")?;
    save(output, "after", &image).await?;

    info!("exercise complete");
    Ok(())
}

async fn schedule(
    arbiter: Arc<Arbiter>,
    config: &Config,
    output: &Path,
    interval: Duration,
) -> Result<()> {
    let scheduler = Scheduler::new(arbiter, config.capture);
    let project = Arc::new(DirProject {
        name: "timelapse".to_owned(),
        dir: output.to_path_buf(),
        interval,
        count: AtomicU64::new(0),
    });

    scheduler.begin(Some(project)).await;
    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;

    info!("shutting down");
    scheduler.stop().await;
    scheduler.clear().await;
    Ok(())
}

async fn read_frames(preview: &PreviewFrames, count: usize) -> Result<()> {
    for i in 0..count {
        let frame = tokio::time::timeout(Duration::from_secs(5), preview.recv())
            .await
            .context("timed out waiting for preview frame")?
            .context("preview channel closed")?;
        validate_jpeg(&frame).with_context(|| format!("preview frame {i}"))?;
        info!(frame = i, bytes = frame.len(), "preview frame");
    }
    Ok(())
}

async fn save(dir: &Path, name: &str, image: &[u8]) -> Result<()> {
    validate_jpeg(image).with_context(|| format!("{name} image"))?;
    let path = dir.join(format!("{name}.jpg"));
    tokio::fs::write(&path, image)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    info!(path = %path.display(), bytes = image.len(), "saved capture");
    Ok(())
}
