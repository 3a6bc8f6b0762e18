//! GPU device implementation using WGPU + WGSL.
//!
//! Owns the `wgpu` device and queue, the precompiled compute pipelines, and
//! the live buffer table. All state is per-instance: the device context is
//! an explicit object passed by reference into the operations, never a
//! global.
//!
//! Profiled timing is wall-clock around a blocking queue drain. That is the
//! measurement the autotuner compares candidates with, so drains happen one
//! candidate at a time.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use briny::raw::slice_to_bytes;
use wgpu::util::DeviceExt;

use crate::desc::MemoryDescriptor;
use crate::device::{BufferId, Device, KernelLaunch};
use crate::error::Error;

const FULLY_CONNECTED: &str = include_str!("shaders/fully_connected.wgsl");
const POOLING: &str = include_str!("shaders/pooling.wgsl");

/// The WGPU-backed compute device.
pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipelines: HashMap<&'static str, wgpu::ComputePipeline>,
    buffers: HashMap<u64, wgpu::Buffer>,
    next_id: u64,
    encoder: Option<wgpu::CommandEncoder>,
    profiling: bool,
    last_elapsed: Option<Duration>,
}

fn load_shader(device: &wgpu::Device, label: &str, source: &str) -> wgpu::ShaderModule {
    device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(source.into()),
    })
}

fn pipeline(
    device: &wgpu::Device,
    module: &wgpu::ShaderModule,
    label: &'static str,
    entry: &'static str,
) -> wgpu::ComputePipeline {
    device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(label),
        layout: None,
        module,
        entry_point: Some(entry),
        cache: None,
        compilation_options: wgpu::PipelineCompilationOptions::default(),
    })
}

impl WgpuDevice {
    /// Initializes the device: selects the default adapter, creates a
    /// device + queue, and precompiles every kernel pipeline.
    pub fn new() -> Result<Self, Error> {
        let instance = wgpu::Instance::default();
        let adapter =
            pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions::default()))
                .map_err(|e| Error::Device(format!("adapter: {e}")))?;
        log::info!("wgpu adapter: {:?}", adapter.get_info().name);
        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: None,
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::default(),
        }))
        .map_err(|e| Error::Device(format!("device: {e}")))?;

        let fc = load_shader(&device, "fully_connected", FULLY_CONNECTED);
        let pool = load_shader(&device, "pooling", POOLING);
        let mut pipelines = HashMap::new();
        pipelines.insert(
            super::fully_connected::FC_KERNEL,
            pipeline(&device, &fc, super::fully_connected::FC_KERNEL, "main"),
        );
        pipelines.insert(
            super::pooling::POOL_MAX_KERNEL,
            pipeline(&device, &pool, super::pooling::POOL_MAX_KERNEL, "pool_max"),
        );
        pipelines.insert(
            super::pooling::POOL_MEAN_KERNEL,
            pipeline(&device, &pool, super::pooling::POOL_MEAN_KERNEL, "pool_mean"),
        );

        Ok(Self {
            device,
            queue,
            pipelines,
            buffers: HashMap::new(),
            next_id: 1,
            encoder: None,
            profiling: false,
            last_elapsed: None,
        })
    }

    fn encoder(&mut self) -> &mut wgpu::CommandEncoder {
        self.encoder.get_or_insert_with(|| {
            self.device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("edgerun") })
        })
    }

    fn buffer(&self, buf: BufferId) -> Result<&wgpu::Buffer, Error> {
        self.buffers.get(&buf.0).ok_or(Error::NullArgument)
    }
}

impl Device for WgpuDevice {
    fn alloc_buffer(&mut self, desc: &MemoryDescriptor) -> Result<BufferId, Error> {
        // Sizes must be non-zero and copy-aligned for wgpu.
        let size = (desc.byte_size.max(4).next_multiple_of(4)) as u64;
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("edgerun_buffer"),
            size,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let id = self.next_id;
        self.next_id += 1;
        self.buffers.insert(id, buffer);
        Ok(BufferId(id))
    }

    fn free_buffer(&mut self, buf: BufferId) {
        if let Some(b) = self.buffers.remove(&buf.0) {
            b.destroy();
        }
    }

    fn write_buffer(&mut self, buf: BufferId, bytes: &[u8]) -> Result<(), Error> {
        let buffer = self.buffer(buf)?;
        self.queue.write_buffer(buffer, 0, bytes);
        Ok(())
    }

    fn read_buffer(&mut self, buf: BufferId, out: &mut [u8]) -> Result<(), Error> {
        // Drain pending work so the copy sees it.
        self.finish()?;
        let size = out.len() as u64;
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("edgerun_staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        {
            let buffer = self.buffer(buf)?;
            let mut encoder = self
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("readback") });
            encoder.copy_buffer_to_buffer(buffer, 0, &staging, 0, size);
            self.queue.submit(Some(encoder.finish()));
        }
        let slice = staging.slice(..);
        slice.map_async(wgpu::MapMode::Read, move |r| {
            if let Err(e) = r {
                log::warn!("readback mapping failed: {e:?}");
            }
        });
        self.device
            .poll(wgpu::PollType::Wait)
            .map_err(|e| Error::Device(format!("poll: {e:?}")))?;
        let data = slice.get_mapped_range();
        out.copy_from_slice(&data);
        drop(data);
        staging.unmap();
        Ok(())
    }

    fn enqueue(&mut self, launch: &KernelLaunch) -> Result<(), Error> {
        let pipeline = self
            .pipelines
            .get(launch.name)
            .ok_or_else(|| Error::Device(format!("unknown kernel {}", launch.name)))?;
        let params = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("params"),
            contents: slice_to_bytes(&launch.params),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let mut entries = vec![wgpu::BindGroupEntry { binding: 0, resource: params.as_entire_binding() }];
        for (i, id) in launch.buffers.iter().enumerate() {
            let buffer = self.buffers.get(&id.0).ok_or(Error::NullArgument)?;
            entries.push(wgpu::BindGroupEntry {
                binding: (i + 1) as u32,
                resource: buffer.as_entire_binding(),
            });
        }
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(launch.name),
            layout: &pipeline.get_bind_group_layout(0),
            entries: &entries,
        });
        let pipeline = pipeline.clone();
        let [gx, gy, gz] = launch.global;
        let encoder = self.encoder();
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(launch.name),
                timestamp_writes: None,
            });
            pass.set_pipeline(&pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(gx.max(1), gy.max(1), gz.max(1));
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<(), Error> {
        let start = Instant::now();
        if let Some(encoder) = self.encoder.take() {
            self.queue.submit(Some(encoder.finish()));
        }
        self.device
            .poll(wgpu::PollType::Wait)
            .map_err(|e| Error::Device(format!("poll: {e:?}")))?;
        if self.profiling {
            self.last_elapsed = Some(start.elapsed());
        }
        Ok(())
    }

    fn set_profiling(&mut self, enabled: bool) {
        self.profiling = enabled;
        self.last_elapsed = None;
    }

    fn elapsed(&self) -> Option<Duration> {
        self.last_elapsed
    }

    fn clear_queue(&mut self) {
        self.encoder = None;
    }
}
