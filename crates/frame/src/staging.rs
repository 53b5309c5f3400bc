//! Recyclable pool of CPU-writable staging buffers.
//!
//! Every buffer in the pool has the same fixed capacity, so any free buffer
//! satisfies any request. Buffers move through
//!
//! ```text
//!            acquire                unmap_active           map completes Ok
//!   Free ──────────────▶ Active ──────────────▶ InFlight ──────────────────▶ Free
//!                                                   │
//!                                                   └── map fails ──▶ Leaked
//! ```
//!
//! A buffer is created mapped and goes straight to `Active` when the free
//! list is empty. The free list is a LIFO stack: the most recently recycled
//! buffer is handed out first. The pool only grows; buffers are destroyed at
//! [`StagingPool::shutdown`].
//!
//! Re-map completions do not touch pool state from the device callback.
//! The callback posts a [`MapCompletion`] on a channel that the frame driver
//! drains with [`StagingPool::drain_completions`] at the start of each frame.

use std::collections::BTreeMap;

use crossbeam_channel::{Receiver, Sender};
use stagehand_core::{Config, ShutdownPolicy};
use stagehand_rhi::{
    BufferDesc, BufferId, COPY_BUFFER_ALIGNMENT, GpuDevice, MapMode, MapResult,
};
use tracing::{debug, info, warn};

use crate::error::{FrameError, FrameResult};

/// Where a staging buffer is in its recycle loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StagingState {
    /// In the free list, mapped, ready to hand out.
    Free,
    /// Handed out this frame; its mapped range may be written.
    Active,
    /// Unmapped and owned by the GPU until its re-map completes.
    InFlight,
    /// Its re-map failed. Never handed out again; destroyed at shutdown.
    Leaked,
}

/// Staging memory handed to a caller for the rest of the current frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StagingAllocation {
    buffer: BufferId,
    len: u64,
}

impl StagingAllocation {
    /// Buffer backing the allocation; the source of resource-stream copies.
    #[inline]
    pub fn buffer(&self) -> BufferId {
        self.buffer
    }

    /// Writable bytes, starting at offset 0 of the buffer.
    #[inline]
    pub fn len(&self) -> u64 {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Message posted by a re-map callback.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MapCompletion {
    pub buffer: BufferId,
    pub result: MapResult,
}

/// Snapshot of pool occupancy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StagingStats {
    /// Buffers owned by the pool in any state.
    pub buffers: usize,
    pub free: usize,
    pub active: usize,
    pub in_flight: usize,
    pub leaked: usize,
    /// Buffers created over the pool's lifetime.
    pub created: u64,
    /// Acquisitions served from the free list.
    pub reused: u64,
}

/// Fixed-capacity staging buffer allocator.
#[derive(Debug)]
pub struct StagingPool {
    buffer_size: u64,
    states: BTreeMap<BufferId, StagingState>,
    free: Vec<BufferId>,
    /// Buffers acquired this frame, `Active` until unmapped, then `InFlight`
    /// until their re-map is requested.
    active: Vec<BufferId>,
    completions_tx: Sender<MapCompletion>,
    completions_rx: Receiver<MapCompletion>,
    created: u64,
    reused: u64,
}

impl StagingPool {
    /// Creates an empty pool of `buffer_size`-byte buffers.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::Misaligned`] if the size is zero or not a
    /// multiple of the copy alignment.
    pub fn new(buffer_size: u64) -> FrameResult<Self> {
        if buffer_size == 0 || buffer_size % COPY_BUFFER_ALIGNMENT != 0 {
            return Err(FrameError::Misaligned(format!(
                "staging buffer size {} must be a non-zero multiple of {}",
                buffer_size, COPY_BUFFER_ALIGNMENT
            )));
        }
        let (completions_tx, completions_rx) = crossbeam_channel::unbounded();
        Ok(Self {
            buffer_size,
            states: BTreeMap::new(),
            free: Vec::new(),
            active: Vec::new(),
            completions_tx,
            completions_rx,
            created: 0,
            reused: 0,
        })
    }

    pub fn from_config(config: &Config) -> FrameResult<Self> {
        Self::new(config.staging_buffer_size)
    }

    /// Capacity of every buffer in the pool.
    #[inline]
    pub fn buffer_size(&self) -> u64 {
        self.buffer_size
    }

    /// Hands out a whole buffer for this frame.
    ///
    /// Reuses the most recently freed buffer if there is one, otherwise
    /// creates a new one mapped at creation.
    ///
    /// # Errors
    ///
    /// Returns the device error if a new buffer cannot be created.
    pub fn acquire<D: GpuDevice + ?Sized>(
        &mut self,
        device: &mut D,
    ) -> FrameResult<StagingAllocation> {
        let buffer = match self.free.pop() {
            Some(buffer) => {
                self.reused += 1;
                buffer
            }
            None => {
                let buffer =
                    device.create_buffer(&BufferDesc::staging("staging", self.buffer_size))?;
                self.created += 1;
                info!(
                    "Staging pool grew to {} buffer(s) of {} bytes",
                    self.states.len() + 1,
                    self.buffer_size
                );
                buffer
            }
        };

        self.states.insert(buffer, StagingState::Active);
        self.active.push(buffer);
        Ok(StagingAllocation {
            buffer,
            len: self.buffer_size,
        })
    }

    /// Like [`acquire`](Self::acquire), limited to `bytes`.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::StagingOverflow`] if `bytes` exceeds the fixed
    /// buffer capacity.
    pub fn acquire_sized<D: GpuDevice + ?Sized>(
        &mut self,
        device: &mut D,
        bytes: u64,
    ) -> FrameResult<StagingAllocation> {
        if bytes > self.buffer_size {
            return Err(FrameError::StagingOverflow {
                requested: bytes,
                capacity: self.buffer_size,
            });
        }
        let mut allocation = self.acquire(device)?;
        allocation.len = bytes;
        Ok(allocation)
    }

    /// Mapped bytes of an active allocation.
    pub fn slice_mut<'d, D: GpuDevice + ?Sized>(
        &self,
        device: &'d mut D,
        allocation: StagingAllocation,
    ) -> FrameResult<&'d mut [u8]> {
        self.expect_state(allocation.buffer, StagingState::Active)?;
        Ok(device.mapped_range_mut(allocation.buffer, 0, allocation.len)?)
    }

    /// Unmaps every buffer acquired this frame (`Active -> InFlight`).
    ///
    /// Must run before the command buffers copying from them are submitted.
    /// Returns the number of buffers unmapped. A buffer whose unmap fails
    /// has an unknown mapping and becomes `Leaked`.
    pub fn unmap_active<D: GpuDevice + ?Sized>(&mut self, device: &mut D) -> FrameResult<usize> {
        let mut unmapped = 0;
        for &buffer in &self.active {
            if self.states.get(&buffer) != Some(&StagingState::Active) {
                continue;
            }
            if let Err(e) = device.unmap_buffer(buffer) {
                warn!("Unmap of {} failed, leaking it: {}", buffer, e);
                self.states.insert(buffer, StagingState::Leaked);
                return Err(e.into());
            }
            self.states.insert(buffer, StagingState::InFlight);
            unmapped += 1;
        }
        Ok(unmapped)
    }

    /// Requests an asynchronous re-map of every buffer unmapped this frame
    /// and clears the frame's active list.
    ///
    /// The buffers return to the free list once their completions are
    /// drained. A request the device refuses outright leaks the buffer.
    pub fn request_remaps<D: GpuDevice + ?Sized>(&mut self, device: &mut D) {
        for buffer in std::mem::take(&mut self.active) {
            if self.states.get(&buffer) != Some(&StagingState::InFlight) {
                warn!(
                    "Re-map skipped for {} in state {:?}",
                    buffer,
                    self.states.get(&buffer)
                );
                continue;
            }

            let tx = self.completions_tx.clone();
            let callback = Box::new(move |result: MapResult| {
                // The pool may already be gone (detached shutdown).
                let _ = tx.send(MapCompletion { buffer, result });
            });
            if let Err(e) =
                device.map_buffer_async(buffer, MapMode::Write, 0, self.buffer_size, callback)
            {
                warn!("Re-map request for {} refused, leaking it: {}", buffer, e);
                self.states.insert(buffer, StagingState::Leaked);
            }
        }
    }

    /// Applies every re-map completion received so far.
    ///
    /// Successful completions push the buffer onto the free list; failures
    /// move it to `Leaked`. Completions for buffers that are not in flight
    /// are ignored, so a buffer is freed at most once per trip.
    ///
    /// Returns the number of buffers returned to the free list.
    pub fn drain_completions(&mut self) -> usize {
        let mut freed = 0;
        while let Ok(completion) = self.completions_rx.try_recv() {
            match self.states.get(&completion.buffer) {
                Some(StagingState::InFlight) => {}
                state => {
                    debug!(
                        "Ignoring completion for {} in state {:?}",
                        completion.buffer, state
                    );
                    continue;
                }
            }

            match completion.result {
                Ok(()) => {
                    self.states.insert(completion.buffer, StagingState::Free);
                    self.free.push(completion.buffer);
                    freed += 1;
                }
                Err(e) => {
                    warn!("Re-map of {} failed, leaking it: {}", completion.buffer, e);
                    self.states.insert(completion.buffer, StagingState::Leaked);
                }
            }
        }
        freed
    }

    /// Returns this frame's buffers after an aborted frame.
    ///
    /// Buffers still `Active` were never handed to `unmap_buffer` and go
    /// straight back to the free list. Buffers already unmapped were never
    /// submitted and are re-mapped as usual.
    pub fn reclaim_active<D: GpuDevice + ?Sized>(&mut self, device: &mut D) {
        let mut remap = Vec::new();
        for buffer in std::mem::take(&mut self.active) {
            match self.states.get(&buffer) {
                Some(StagingState::Active) => {
                    self.states.insert(buffer, StagingState::Free);
                    self.free.push(buffer);
                }
                Some(StagingState::InFlight) => remap.push(buffer),
                _ => {}
            }
        }
        if !remap.is_empty() {
            self.active = remap;
            self.request_remaps(device);
        }
    }

    /// Destroys the pool's buffers according to `policy`.
    ///
    /// `Drain` waits for the device, applies every outstanding completion
    /// and destroys all buffers. `Detach` destroys only buffers with no
    /// outstanding re-map and leaves the rest to device teardown.
    pub fn shutdown<D: GpuDevice + ?Sized>(
        &mut self,
        device: &mut D,
        policy: ShutdownPolicy,
    ) -> FrameResult<()> {
        self.reclaim_active(device);

        if policy == ShutdownPolicy::Drain {
            device.wait_idle()?;
            self.drain_completions();
        }

        let mut detached = 0;
        for (buffer, state) in std::mem::take(&mut self.states) {
            match (policy, state) {
                (ShutdownPolicy::Detach, StagingState::InFlight | StagingState::Active) => {
                    detached += 1;
                }
                (ShutdownPolicy::Drain, StagingState::InFlight | StagingState::Active) => {
                    warn!("{} still {:?} after drain; destroying", buffer, state);
                    device.destroy_buffer(buffer)?;
                }
                _ => device.destroy_buffer(buffer)?,
            }
        }
        self.free.clear();
        self.active.clear();

        if detached > 0 {
            info!("Staging pool detached {} in-flight buffer(s)", detached);
        }
        debug!("Staging pool shut down ({:?})", policy);
        Ok(())
    }

    /// State of a buffer owned by the pool.
    #[inline]
    pub fn state(&self, buffer: BufferId) -> Option<StagingState> {
        self.states.get(&buffer).copied()
    }

    pub fn stats(&self) -> StagingStats {
        let count = |wanted| self.states.values().filter(|&&s| s == wanted).count();
        StagingStats {
            buffers: self.states.len(),
            free: count(StagingState::Free),
            active: count(StagingState::Active),
            in_flight: count(StagingState::InFlight),
            leaked: count(StagingState::Leaked),
            created: self.created,
            reused: self.reused,
        }
    }

    /// Errors unless `buffer` is in state `expected`.
    pub(crate) fn expect_state(
        &self,
        buffer: BufferId,
        expected: StagingState,
    ) -> FrameResult<()> {
        let actual = self.state(buffer);
        if actual == Some(expected) {
            Ok(())
        } else {
            Err(FrameError::StagingState {
                buffer,
                actual,
                expected,
            })
        }
    }

    /// A sender for posting completions by hand.
    #[cfg(test)]
    pub(crate) fn completion_sender(&self) -> Sender<MapCompletion> {
        self.completions_tx.clone()
    }
}

#[cfg(test)]
mod tests {
    use stagehand_core::FramebufferSize;
    use stagehand_rhi::{BufferUsage, HeadlessDevice, MapError, RhiError};

    use super::*;

    const SIZE: u64 = 256;

    fn device() -> HeadlessDevice {
        HeadlessDevice::new(FramebufferSize::new(800, 600))
    }

    /// Unmaps, submits an empty batch, re-maps and lets the device retire it.
    fn cycle(pool: &mut StagingPool, dev: &mut HeadlessDevice) {
        pool.unmap_active(dev).unwrap();
        let enc = dev.create_command_encoder("resource").unwrap();
        let cb = dev.finish_encoder(enc).unwrap();
        dev.submit(&[cb]).unwrap();
        pool.request_remaps(dev);
        dev.poll().unwrap();
        pool.drain_completions();
    }

    #[test]
    fn test_rejects_misaligned_capacity() {
        assert!(matches!(StagingPool::new(0), Err(FrameError::Misaligned(_))));
        assert!(matches!(StagingPool::new(66), Err(FrameError::Misaligned(_))));
        assert_eq!(StagingPool::new(64).unwrap().buffer_size(), 64);
    }

    #[test]
    fn test_acquire_grows_when_empty() {
        let mut dev = device();
        let mut pool = StagingPool::new(SIZE).unwrap();

        let a = pool.acquire(&mut dev).unwrap();
        let b = pool.acquire(&mut dev).unwrap();
        assert_ne!(a.buffer(), b.buffer());
        assert_eq!(a.len(), SIZE);
        assert_eq!(pool.state(a.buffer()), Some(StagingState::Active));
        assert_eq!(dev.buffer_count_by_usage(BufferUsage::Staging), 2);

        let stats = pool.stats();
        assert_eq!(stats.buffers, 2);
        assert_eq!(stats.active, 2);
        assert_eq!(stats.created, 2);
        assert_eq!(stats.reused, 0);
    }

    #[test]
    fn test_acquire_sized_rejects_overflow() {
        let mut dev = device();
        let mut pool = StagingPool::new(SIZE).unwrap();

        let err = pool.acquire_sized(&mut dev, SIZE + 4).unwrap_err();
        assert!(matches!(
            err,
            FrameError::StagingOverflow {
                requested: 260,
                capacity: 256
            }
        ));
        assert_eq!(pool.stats().buffers, 0);

        let alloc = pool.acquire_sized(&mut dev, 64).unwrap();
        assert_eq!(alloc.len(), 64);
        assert_eq!(pool.slice_mut(&mut dev, alloc).unwrap().len(), 64);
    }

    #[test]
    fn test_slice_mut_only_while_active() {
        let mut dev = device();
        let mut pool = StagingPool::new(SIZE).unwrap();
        let alloc = pool.acquire(&mut dev).unwrap();
        pool.slice_mut(&mut dev, alloc).unwrap()[0] = 7;

        pool.unmap_active(&mut dev).unwrap();
        let err = pool.slice_mut(&mut dev, alloc).unwrap_err();
        assert!(matches!(
            err,
            FrameError::StagingState {
                actual: Some(StagingState::InFlight),
                expected: StagingState::Active,
                ..
            }
        ));
    }

    #[test]
    fn test_buffers_recycle_through_completions() {
        let mut dev = device();
        let mut pool = StagingPool::new(SIZE).unwrap();
        let alloc = pool.acquire(&mut dev).unwrap();

        assert_eq!(pool.unmap_active(&mut dev).unwrap(), 1);
        assert_eq!(pool.state(alloc.buffer()), Some(StagingState::InFlight));

        let enc = dev.create_command_encoder("resource").unwrap();
        let cb = dev.finish_encoder(enc).unwrap();
        dev.submit(&[cb]).unwrap();
        pool.request_remaps(&mut dev);

        // Nothing arrives before the device reports completion.
        assert_eq!(pool.drain_completions(), 0);
        assert_eq!(pool.state(alloc.buffer()), Some(StagingState::InFlight));

        dev.poll().unwrap();
        assert_eq!(pool.state(alloc.buffer()), Some(StagingState::InFlight));
        assert_eq!(pool.drain_completions(), 1);
        assert_eq!(pool.state(alloc.buffer()), Some(StagingState::Free));
    }

    #[test]
    fn test_free_list_is_lifo() {
        let mut dev = device();
        let mut pool = StagingPool::new(SIZE).unwrap();
        let first = pool.acquire(&mut dev).unwrap().buffer();
        let second = pool.acquire(&mut dev).unwrap().buffer();
        pool.unmap_active(&mut dev).unwrap();

        let tx = pool.completion_sender();
        tx.send(MapCompletion {
            buffer: first,
            result: Ok(()),
        })
        .unwrap();
        tx.send(MapCompletion {
            buffer: second,
            result: Ok(()),
        })
        .unwrap();
        pool.active.clear();
        assert_eq!(pool.drain_completions(), 2);

        assert_eq!(pool.acquire(&mut dev).unwrap().buffer(), second);
        assert_eq!(pool.acquire(&mut dev).unwrap().buffer(), first);
        assert_eq!(pool.stats().reused, 2);
    }

    #[test]
    fn test_duplicate_completion_is_ignored() {
        let mut dev = device();
        let mut pool = StagingPool::new(SIZE).unwrap();
        let buffer = pool.acquire(&mut dev).unwrap().buffer();
        cycle(&mut pool, &mut dev);
        assert_eq!(pool.state(buffer), Some(StagingState::Free));

        pool.completion_sender()
            .send(MapCompletion {
                buffer,
                result: Ok(()),
            })
            .unwrap();
        assert_eq!(pool.drain_completions(), 0);
        assert_eq!(pool.stats().free, 1);

        pool.acquire(&mut dev).unwrap();
        let again = pool.acquire(&mut dev).unwrap();
        assert_ne!(again.buffer(), buffer);
    }

    #[test]
    fn test_failed_remap_leaks_buffer() {
        let mut dev = device();
        let mut pool = StagingPool::new(SIZE).unwrap();
        let buffer = pool.acquire(&mut dev).unwrap().buffer();

        dev.fail_next_maps(1);
        cycle(&mut pool, &mut dev);
        assert_eq!(pool.state(buffer), Some(StagingState::Leaked));
        assert_eq!(pool.stats().leaked, 1);

        // A leaked buffer is never handed out again.
        let next = pool.acquire(&mut dev).unwrap();
        assert_ne!(next.buffer(), buffer);
        assert_eq!(pool.stats().buffers, 2);
    }

    #[test]
    fn test_reclaim_returns_mapped_buffers_immediately() {
        let mut dev = device();
        let mut pool = StagingPool::new(SIZE).unwrap();
        let buffer = pool.acquire(&mut dev).unwrap().buffer();

        pool.reclaim_active(&mut dev);
        assert_eq!(pool.state(buffer), Some(StagingState::Free));
        assert_eq!(dev.pending_maps(), 0);
    }

    #[test]
    fn test_reclaim_remaps_unmapped_buffers() {
        let mut dev = device();
        let mut pool = StagingPool::new(SIZE).unwrap();
        let buffer = pool.acquire(&mut dev).unwrap().buffer();
        pool.unmap_active(&mut dev).unwrap();

        pool.reclaim_active(&mut dev);
        assert_eq!(pool.state(buffer), Some(StagingState::InFlight));
        dev.poll().unwrap();
        pool.drain_completions();
        assert_eq!(pool.state(buffer), Some(StagingState::Free));
    }

    #[test]
    fn test_failed_unmap_never_returns_to_free_list() {
        let mut dev = device();
        let mut pool = StagingPool::new(SIZE).unwrap();
        let first = pool.acquire(&mut dev).unwrap().buffer();
        let second = pool.acquire(&mut dev).unwrap().buffer();
        dev.unmap_buffer(second).unwrap();

        let err = pool.unmap_active(&mut dev).unwrap_err();
        assert!(matches!(err, FrameError::Rhi(RhiError::InvalidState(_))));
        assert_eq!(pool.state(first), Some(StagingState::InFlight));
        assert_eq!(pool.state(second), Some(StagingState::Leaked));

        pool.reclaim_active(&mut dev);
        dev.poll().unwrap();
        pool.drain_completions();
        assert_eq!(pool.state(first), Some(StagingState::Free));
        assert_eq!(pool.state(second), Some(StagingState::Leaked));
        assert_eq!(pool.stats().free, 1);

        let next = pool.acquire(&mut dev).unwrap();
        assert_eq!(next.buffer(), first);
    }

    #[test]
    fn test_shutdown_drain_destroys_everything() {
        let mut dev = device();
        let mut pool = StagingPool::new(SIZE).unwrap();
        pool.acquire(&mut dev).unwrap();
        pool.acquire(&mut dev).unwrap();
        dev.hold_completions(true);
        pool.unmap_active(&mut dev).unwrap();
        pool.request_remaps(&mut dev);

        pool.shutdown(&mut dev, ShutdownPolicy::Drain).unwrap();
        assert_eq!(pool.stats().buffers, 0);
        assert_eq!(dev.buffer_count_by_usage(BufferUsage::Staging), 0);
        assert_eq!(dev.pending_maps(), 0);
    }

    #[test]
    fn test_shutdown_detach_keeps_in_flight_buffers() {
        let mut dev = device();
        let mut pool = StagingPool::new(SIZE).unwrap();
        let held = pool.acquire(&mut dev).unwrap().buffer();
        pool.unmap_active(&mut dev).unwrap();
        let enc = dev.create_command_encoder("resource").unwrap();
        let cb = dev.finish_encoder(enc).unwrap();
        dev.hold_completions(true);
        dev.submit(&[cb]).unwrap();
        pool.request_remaps(&mut dev);

        // One more buffer that is free at shutdown.
        pool.acquire(&mut dev).unwrap();
        pool.reclaim_active(&mut dev);

        pool.shutdown(&mut dev, ShutdownPolicy::Detach).unwrap();
        assert_eq!(dev.buffer_count_by_usage(BufferUsage::Staging), 1);
        assert!(dev.read_buffer(held).is_some());
        assert_eq!(pool.stats().buffers, 0);

        // The late completion finds no receiver state to update.
        dev.wait_idle().unwrap();
        assert_eq!(pool.drain_completions(), 0);
    }

    #[test]
    fn test_refused_remap_request_leaks() {
        let mut dev = device();
        let mut pool = StagingPool::new(SIZE).unwrap();
        let buffer = pool.acquire(&mut dev).unwrap().buffer();
        pool.unmap_active(&mut dev).unwrap();

        // Destroying the buffer behind the pool's back makes the request fail.
        dev.destroy_buffer(buffer).unwrap();
        pool.request_remaps(&mut dev);
        assert_eq!(pool.state(buffer), Some(StagingState::Leaked));
    }

    #[test]
    fn test_destroyed_completion_leaks() {
        let mut pool = StagingPool::new(SIZE).unwrap();
        let mut dev = device();
        let buffer = pool.acquire(&mut dev).unwrap().buffer();
        pool.unmap_active(&mut dev).unwrap();
        pool.active.clear();

        pool.completion_sender()
            .send(MapCompletion {
                buffer,
                result: Err(MapError::Destroyed),
            })
            .unwrap();
        assert_eq!(pool.drain_completions(), 0);
        assert_eq!(pool.state(buffer), Some(StagingState::Leaked));
    }

    #[test]
    fn test_slice_mut_reports_device_error() {
        let mut dev = device();
        let mut pool = StagingPool::new(SIZE).unwrap();
        let alloc = pool.acquire(&mut dev).unwrap();
        dev.destroy_buffer(alloc.buffer()).unwrap();

        let err = pool.slice_mut(&mut dev, alloc).unwrap_err();
        assert!(matches!(err, FrameError::Rhi(RhiError::InvalidHandle(_))));
    }
}
