use std::num::NonZeroU32;
use std::sync::Arc;

use anyhow::{ensure, Context};
use blkio::{BlockIo, Error, IoOutcome};
use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;

use crate::buffer::Buffers;
use crate::engine::{CallerBuf, Engine, Scratch};
use crate::geometry::Geometry;
use crate::plan::{plan, Op, Subtask};
use crate::task::{Registry, Token};

const MAX_SCRATCH_BLOCKS: u32 = 1 << 16;
// Workaround: `Option::unwrap` is not const stable yet.
const DEFAULT_SCRATCH_BLOCKS: NonZeroU32 = match NonZeroU32::new(64) {
    Some(n) => n,
    None => unreachable!(),
};

#[serde_inline_default]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Capacity of the shared scratch buffer in blocks. Misaligned whole-block transfers are
    /// chunked by this size when they cannot get a dedicated buffer.
    #[serde_inline_default(DEFAULT_SCRATCH_BLOCKS)]
    pub scratch_blocks: NonZeroU32,
    /// Upper bound of bytes held by working buffers of in-flight asynchronous requests.
    /// Unlimited if unset.
    #[serde(default, deserialize_with = "de_opt_size")]
    pub async_buffer_limit: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scratch_blocks: DEFAULT_SCRATCH_BLOCKS,
            async_buffer_limit: None,
        }
    }
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(
            self.scratch_blocks.get() <= MAX_SCRATCH_BLOCKS,
            "scratch_blocks must not exceed {MAX_SCRATCH_BLOCKS}",
        );
        Ok(())
    }
}

fn de_opt_size<'de, D: serde::de::Deserializer<'de>>(de: D) -> Result<Option<usize>, D::Error> {
    use serde::de::Error;

    let Some(n) = Option::<bytesize::ByteSize>::deserialize(de)? else {
        return Ok(None);
    };
    n.0.try_into()
        .map(Some)
        .map_err(|_| D::Error::custom(format_args!("overflow: {}", n.0)))
}

/// Byte-granular access to a device that only transfers whole, aligned blocks.
///
/// Blocking requests run to completion on the calling thread. Asynchronous requests return once
/// every subtask is handed to the device, and report through their [`Token`].
#[derive(Debug)]
pub struct DiskIo<D> {
    config: Config,
    device: D,
    buffers: Buffers,
    tasks: Arc<Registry>,
}

impl<D: BlockIo> DiskIo<D> {
    pub fn new(config: Config, device: D) -> anyhow::Result<Self> {
        config.validate().context("invalid configuration")?;
        let geo = Geometry::resolve(&device);
        let buffers = Buffers::new(
            config.scratch_blocks.get(),
            config.async_buffer_limit,
            &geo,
        )
        .context("failed to allocate scratch buffer")?;
        tracing::debug!(?geo, ?config, "disk opened");
        Ok(Self {
            config,
            device,
            buffers,
            tasks: Arc::default(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    /// The current media geometry.
    pub fn geometry(&self) -> Geometry {
        Geometry::resolve(&self.device)
    }

    /// Number of asynchronous requests with subtasks still in the device.
    pub fn pending_tasks(&self) -> usize {
        self.tasks.pending()
    }

    /// Read `buf.len()` bytes at byte `offset`.
    pub fn read(&self, media_id: u32, offset: u64, buf: &mut [u8]) -> Result<(), Error> {
        let (geo, subtasks) =
            self.prepare(Op::Read, media_id, offset, buf.len(), buf.as_ptr(), true)?;
        let mut scratch = Scratch::new(&self.buffers, &geo);
        Engine::new(&self.device, &geo, media_id, Op::Read).execute(
            subtasks,
            CallerBuf::Read(buf),
            &mut scratch,
        )
    }

    /// Write `buf` at byte `offset`, preserving the untouched bytes of partially covered blocks.
    pub fn write(&self, media_id: u32, offset: u64, buf: &[u8]) -> Result<(), Error> {
        let (geo, subtasks) =
            self.prepare(Op::Write, media_id, offset, buf.len(), buf.as_ptr(), true)?;
        let mut scratch = Scratch::new(&self.buffers, &geo);
        Engine::new(&self.device, &geo, media_id, Op::Write).execute(
            subtasks,
            CallerBuf::Write(buf),
            &mut scratch,
        )
    }

    /// Start reading `buf.len()` bytes at byte `offset`.
    ///
    /// On `Ok`, `token` is signaled later, or already, with the filled buffer. On `Err`, the
    /// request did not start and `token` is never signaled.
    pub fn read_async(
        &self,
        media_id: u32,
        offset: u64,
        buf: BytesMut,
        token: &Token,
    ) -> Result<(), Error> {
        self.submit(Op::Read, media_id, offset, buf, token)
    }

    /// Start writing `buf` at byte `offset`. Same contract as [`DiskIo::read_async`].
    ///
    /// Partially covered blocks are read back synchronously before the request returns.
    pub fn write_async(
        &self,
        media_id: u32,
        offset: u64,
        buf: BytesMut,
        token: &Token,
    ) -> Result<(), Error> {
        self.submit(Op::Write, media_id, offset, buf, token)
    }

    pub fn flush(&self) -> Result<(), Error> {
        self.device.flush_blocks()
    }

    /// Start flushing device caches. Same contract as [`DiskIo::read_async`], with an empty
    /// buffer handed back.
    pub fn flush_async(&self, token: &Token) -> Result<(), Error> {
        let Some(aio) = self.device.async_io() else {
            self.device.flush_blocks()?;
            token.arm();
            token.signal(Ok(BytesMut::new()));
            return Ok(());
        };
        self.tasks.sweep();
        let id = self.tasks.register(token, 1);
        let tasks = Arc::clone(&self.tasks);
        let ret = aio.flush_blocks_ex(Box::new(move |out: IoOutcome| {
            tasks.complete(id, 0, out.status, out.buf);
        }));
        ret.or_else(|err| self.tasks.fail_issue(id, 0, err))
    }

    /// Signal every in-flight asynchronous request with [`Error::Aborted`].
    ///
    /// Transfers already in the device still finish, but their results are discarded.
    pub fn cancel_all(&self) -> Result<(), Error> {
        let cnt = self.tasks.cancel_all();
        if cnt != 0 {
            tracing::debug!(cnt, "cancelled in-flight requests");
        }
        Ok(())
    }

    /// Abort every in-flight request, reset the device and wait until it drained.
    pub async fn shutdown(&self) -> Result<(), Error> {
        self.cancel_all()?;
        let ret = self.device.reset(false);
        if let Err(err) = &ret {
            tracing::warn!(%err, "failed to reset device");
        }
        self.tasks.wait_idle().await;
        tracing::debug!("disk shut down");
        ret
    }

    fn submit(
        &self,
        op: Op,
        media_id: u32,
        offset: u64,
        buf: BytesMut,
        token: &Token,
    ) -> Result<(), Error> {
        // Without a non-blocking device, asynchronous requests complete before returning.
        let blocking = self.device.async_io().is_none();
        let (geo, subtasks) =
            self.prepare(op, media_id, offset, buf.len(), buf.as_ptr(), blocking)?;
        let mut scratch = Scratch::new(&self.buffers, &geo);
        Engine::new(&self.device, &geo, media_id, op).submit(
            subtasks,
            buf,
            &self.tasks,
            token,
            &mut scratch,
        )
    }

    fn prepare(
        &self,
        op: Op,
        media_id: u32,
        offset: u64,
        len: usize,
        ptr: *const u8,
        blocking: bool,
    ) -> Result<(Geometry, Vec<Subtask>), Error> {
        self.tasks.sweep();
        let geo = Geometry::resolve(&self.device);
        geo.validate(media_id, op)?;
        geo.check_range(offset, len)?;
        let subtasks = plan(&geo, op, offset, len, ptr, blocking, &self.buffers)?;
        tracing::trace!(
            ?op,
            offset,
            len,
            blocking,
            subtasks = subtasks.len(),
            "planned request",
        );
        Ok((geo, subtasks))
    }
}
