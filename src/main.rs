use std::io::{Read, Write};
use std::path::PathBuf;
use std::{fs, io};

use anyhow::{bail, ensure, Context, Result};
use bytes::BytesMut;
use diskio::file_disk::FileDisk;
use diskio::memory_disk::{Delivery, MemoryDisk};
use diskio::{DiskIo, Token};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use serde_inline_default::serde_inline_default;
use tokio::runtime::Runtime;
use tracing_subscriber::EnvFilter;

#[derive(Debug, clap::Parser)]
enum Cli {
    Read(ReadCmd),
    Write(WriteCmd),
    Exercise(ExerciseCmd),
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();
    let cli = <Cli as clap::Parser>::parse();
    match cli {
        Cli::Read(cmd) => read_cmd(cmd),
        Cli::Write(cmd) => write_cmd(cmd),
        Cli::Exercise(cmd) => exercise_cmd(cmd),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct Config {
    #[serde(default)]
    disk_io: diskio::Config,
    #[serde(default)]
    device: DeviceConfig,
}

#[serde_inline_default]
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DeviceConfig {
    #[serde_inline_default(512)]
    block_size: u32,
    /// Only used by the memory disk. Image files have no alignment requirement.
    #[serde_inline_default(4)]
    io_align: u32,
    /// Size of the memory disk.
    #[serde_inline_default(bytesize::ByteSize::mib(16))]
    size: bytesize::ByteSize,
    #[serde(default)]
    delivery: Delivery,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        toml::from_str("").expect("all fields have defaults")
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    let Some(path) = path else {
        return Ok(Config::default());
    };
    let buf = fs::read_to_string(path).context("failed to read config file")?;
    let config = toml::from_str::<Config>(&buf).context("failed to parse config file")?;
    config.disk_io.validate().context("invalid disk_io config")?;
    Ok(config)
}

fn new_runtime() -> Result<Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")
}

/// Read a byte range of a disk image and dump it to stdout.
#[derive(Debug, clap::Args)]
struct ReadCmd {
    #[clap(long, short)]
    config_file: Option<PathBuf>,
    /// Go through the asynchronous interface.
    #[clap(long = "async")]
    use_async: bool,
    #[clap(long)]
    offset: u64,
    #[clap(long)]
    len: usize,
    image: PathBuf,
}

fn read_cmd(cmd: ReadCmd) -> Result<()> {
    let config = load_config(cmd.config_file.as_ref())?;
    let dev = FileDisk::open(&cmd.image, config.device.block_size, true)?;
    let disk = DiskIo::new(config.disk_io, dev)?;
    let media_id = disk.geometry().media_id;

    let data = if cmd.use_async {
        let token = Token::new();
        disk.read_async(media_id, cmd.offset, BytesMut::zeroed(cmd.len), &token)
            .context("failed to submit read")?;
        new_runtime()?
            .block_on(token.wait())
            .context("read failed")?
    } else {
        let mut buf = BytesMut::zeroed(cmd.len);
        disk.read(media_id, cmd.offset, &mut buf)
            .context("read failed")?;
        buf
    };
    io::stdout()
        .lock()
        .write_all(&data)
        .context("failed to write stdout")?;
    Ok(())
}

/// Write stdin into a disk image at a byte offset.
#[derive(Debug, clap::Args)]
struct WriteCmd {
    #[clap(long, short)]
    config_file: Option<PathBuf>,
    /// Go through the asynchronous interface.
    #[clap(long = "async")]
    use_async: bool,
    #[clap(long)]
    offset: u64,
    image: PathBuf,
}

fn write_cmd(cmd: WriteCmd) -> Result<()> {
    let config = load_config(cmd.config_file.as_ref())?;
    let mut data = Vec::new();
    io::stdin()
        .lock()
        .read_to_end(&mut data)
        .context("failed to read stdin")?;

    let dev = FileDisk::open(&cmd.image, config.device.block_size, false)?;
    let disk = DiskIo::new(config.disk_io, dev)?;
    let media_id = disk.geometry().media_id;
    if cmd.use_async {
        let rt = new_runtime()?;
        let token = Token::new();
        disk.write_async(media_id, cmd.offset, BytesMut::from(&data[..]), &token)
            .context("failed to submit write")?;
        rt.block_on(token.wait()).context("write failed")?;
        disk.flush_async(&token).context("failed to submit flush")?;
        rt.block_on(token.wait()).context("flush failed")?;
    } else {
        disk.write(media_id, cmd.offset, &data)
            .context("write failed")?;
        disk.flush().context("flush failed")?;
    }
    tracing::info!(offset = cmd.offset, len = data.len(), "written");
    Ok(())
}

/// Run random concurrent round-trips through the asynchronous interface on a memory disk, checking
/// every byte against a shadow copy.
#[derive(Debug, clap::Args)]
struct ExerciseCmd {
    #[clap(long, short)]
    config_file: Option<PathBuf>,
    #[clap(long, default_value_t = 1000)]
    rounds: usize,
    /// Requests in flight per round.
    #[clap(long, default_value_t = 4)]
    concurrency: usize,
    #[clap(long)]
    seed: Option<u64>,
}

fn exercise_cmd(cmd: ExerciseCmd) -> Result<()> {
    let config = load_config(cmd.config_file.as_ref())?;
    let dc = &config.device;
    let total_blocks = dc.size.0 / u64::from(dc.block_size);
    ensure!(total_blocks != 0, "memory disk is smaller than one block");
    ensure!(cmd.concurrency != 0, "concurrency must not be zero");
    if dc.delivery == Delivery::Queued {
        bail!("queued delivery needs a driver, use `inline` or `spawn`");
    }
    let dev = MemoryDisk::new(dc.block_size, dc.io_align, total_blocks);
    dev.set_delivery(dc.delivery);
    let disk = DiskIo::new(config.disk_io, dev)?;

    let seed = cmd.seed.unwrap_or_else(rand::random);
    tracing::info!(seed, rounds = cmd.rounds, "exercising");
    let mut rng = StdRng::seed_from_u64(seed);
    let size = usize::try_from(disk.geometry().size()).context("disk too large")?;
    let mut shadow = vec![0u8; size];
    // Disjoint slots keep concurrent requests of a round from overlapping.
    let slot = size / cmd.concurrency;
    ensure!(slot != 0, "disk too small for the concurrency");

    new_runtime()?.block_on(async {
        for round in 0..cmd.rounds {
            let media_id = disk.geometry().media_id;
            let mut reqs = Vec::with_capacity(cmd.concurrency);
            for i in 0..cmd.concurrency {
                let len = rng.random_range(0..=slot.min(4 * dc.block_size as usize));
                let start = i * slot + rng.random_range(0..=slot - len);
                // Random misalignment of the caller buffer.
                let skew = rng.random_range(0..8);
                let mut buf = diskio::alloc_aligned(len + skew, 8)?;
                let _ = buf.split_to(skew);
                rng.fill(&mut buf[..]);
                shadow[start..start + len].copy_from_slice(&buf);

                let token = Token::new();
                disk.write_async(media_id, start as u64, buf, &token)
                    .with_context(|| format!("round {round}: failed to submit write"))?;
                reqs.push((start, len, token));
            }
            let waits = reqs.iter().map(|(_, _, token)| token.wait());
            for ret in futures_util::future::join_all(waits).await {
                ret.with_context(|| format!("round {round}: write failed"))?;
            }

            for (start, len, token) in &reqs {
                disk.read_async(media_id, *start as u64, BytesMut::zeroed(*len), token)
                    .with_context(|| format!("round {round}: failed to submit read"))?;
            }
            let waits = reqs.iter().map(|(_, _, token)| token.wait());
            let got = futures_util::future::join_all(waits).await;
            for ((start, len, _), ret) in reqs.iter().zip(got) {
                let data = ret.with_context(|| format!("round {round}: read failed"))?;
                ensure!(
                    data[..] == shadow[*start..*start + *len],
                    "round {round}: data mismatch at {start}+{len}",
                );
            }
        }
        disk.shutdown().await.context("failed to shut down")?;
        anyhow::Ok(())
    })?;

    tracing::info!(rounds = cmd.rounds, "passed");
    Ok(())
}
