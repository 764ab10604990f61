//! wgpu compute backend.
//!
//! Every pass of the frame pipeline is a WGSL compute kernel:
//! - integrate: ping-pong between two particle storage buffers
//! - accumulate: atomic histogram of the readable particle buffer
//! - estimate / analytic: one invocation per output pixel into a packed RGBA
//!   buffer the size of the display, read back into the [`Surface`]
//!
//! Noise comes from a 32-bit hash on the device, so trajectories are
//! reproducible per seed but differ from the CPU backend's.

use crate::backend::Backend;
use crate::config::GridSize;
use crate::density::{DensityEstimator, EstimateStats};
use crate::error::{Error, Result, check_grid};
use crate::field::{PingPong, Slot, initial_grid};
use crate::mixture::MixtureOfGaussians;
use crate::render::{ParticleRenderer, Surface};
use crate::viewport::{ViewTransform, Viewport};
use bytemuck::{Pod, Zeroable};
use glam::Vec2;
use wgpu::util::DeviceExt;

const COMMON_WGSL: &str = include_str!("shaders/common.wgsl");

/// Threads per workgroup of the per-particle kernels
const PARTICLE_WORKGROUP: u32 = 64;

/// Side of the per-pixel kernels' square workgroup
const PIXEL_WORKGROUP: u32 = 8;

/// Matches `struct Step` in integrate.wgsl
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct StepUniforms {
    seed: [u32; 2],
    step: [u32; 2],
    dt: f32,
    count: u32,
    _pad: [u32; 2],
}

/// Matches `struct View` in common.wgsl
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct ViewUniforms {
    sim_min: [f32; 2],
    sim_max: [f32; 2],
    pix_min: [f32; 2],
    pix_max: [f32; 2],
    origin: [u32; 2],
    extent: [u32; 2],
    grid: [u32; 2],
    surface_width: u32,
    particle_count: u32,
}

fn split_u64(v: u64) -> [u32; 2] {
    [v as u32, (v >> 32) as u32]
}

/// Workgroup counts covering `items` threads, spilling into y past the
/// per-dimension limit.
fn particle_dispatch(items: usize) -> (u32, u32) {
    let groups = (items as u32).div_ceil(PARTICLE_WORKGROUP).max(1);
    let x = groups.min(65_535);
    (x, groups.div_ceil(x))
}

struct Kernel {
    pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
}

fn uniform_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    buffer_entry(binding, wgpu::BufferBindingType::Uniform)
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    buffer_entry(binding, wgpu::BufferBindingType::Storage { read_only })
}

fn buffer_entry(binding: u32, ty: wgpu::BufferBindingType) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

/// Compile `source` (prefixed with the shared definitions) into a compute
/// pipeline. Validation failures come back with the driver's message intact.
fn build_kernel(
    device: &wgpu::Device,
    label: &str,
    source: &str,
    entries: &[wgpu::BindGroupLayoutEntry],
) -> Result<Kernel> {
    device.push_error_scope(wgpu::ErrorFilter::Validation);

    let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(format!("{COMMON_WGSL}\n{source}").into()),
    });
    let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some(label),
        entries,
    });
    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(label),
        bind_group_layouts: &[&layout],
        push_constant_ranges: &[],
    });
    let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(label),
        layout: Some(&pipeline_layout),
        module: &module,
        entry_point: Some("main"),
        compilation_options: Default::default(),
        cache: None,
    });

    if let Some(err) = pollster::block_on(device.pop_error_scope()) {
        return Err(Error::KernelCompile {
            label: label.to_string(),
            diagnostics: err.to_string(),
        });
    }
    Ok(Kernel { pipeline, layout })
}

/// Display-sized output buffer plus the bind groups that write it
struct OutputTarget {
    width: u32,
    height: u32,
    buffer: wgpu::Buffer,
    staging: wgpu::Buffer,
    estimate_group: wgpu::BindGroup,
    analytic_group: wgpu::BindGroup,
}

pub struct GpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    adapter_name: String,
    grid: GridSize,
    seed: u64,
    particles: PingPong<wgpu::Buffer>,
    particle_staging: wgpu::Buffer,
    accumulator: GridSize,
    cells: wgpu::Buffer,
    cells_staging: wgpu::Buffer,
    mixture: MixtureOfGaussians,
    mixture_buffer: wgpu::Buffer,
    step_buffer: wgpu::Buffer,
    estimate_view: wgpu::Buffer,
    analytic_view: wgpu::Buffer,
    integrate: Kernel,
    accumulate: Kernel,
    estimate: Kernel,
    analytic: Kernel,
    /// Indexed by the readable slot
    integrate_groups: [wgpu::BindGroup; 2],
    accumulate_groups: [wgpu::BindGroup; 2],
    output: Option<OutputTarget>,
    plot: ParticleRenderer,
}

impl std::fmt::Debug for GpuBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuBackend")
            .field("adapter", &self.adapter_name)
            .field("grid", &self.grid)
            .field("accumulator", &self.accumulator)
            .field("steps", &self.particles.steps())
            .finish()
    }
}

impl GpuBackend {
    pub fn new(particles: GridSize, accumulator: GridSize, seed: u64) -> Result<Self> {
        check_grid("particle", particles.width, particles.height)?;
        check_grid("accumulator", accumulator.width, accumulator.height)?;

        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .map_err(|e| Error::NoAdapter(e.to_string()))?;
        let info = adapter.get_info();
        log::info!("Using GPU: {} ({:?})", info.name, info.backend);

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("langevin"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::Performance,
            experimental_features: Default::default(),
            trace: Default::default(),
        }))
        .map_err(|e| Error::RequestDevice(e.to_string()))?;

        let integrate = build_kernel(
            &device,
            "integrate",
            include_str!("shaders/integrate.wgsl"),
            &[uniform_entry(0), uniform_entry(1), storage_entry(2, true), storage_entry(3, false)],
        )?;
        let accumulate = build_kernel(
            &device,
            "accumulate",
            include_str!("shaders/accumulate.wgsl"),
            &[uniform_entry(0), uniform_entry(1), storage_entry(2, true), storage_entry(3, false)],
        )?;
        let estimate = build_kernel(
            &device,
            "estimate",
            include_str!("shaders/estimate.wgsl"),
            &[uniform_entry(0), uniform_entry(1), storage_entry(2, true), storage_entry(3, false)],
        )?;
        let analytic = build_kernel(
            &device,
            "analytic",
            include_str!("shaders/analytic.wgsl"),
            &[uniform_entry(0), uniform_entry(1), storage_entry(2, false)],
        )?;

        let grid = initial_grid(particles.width, particles.height);
        let particle_bytes = (grid.len() * std::mem::size_of::<Vec2>()) as u64;
        let particle_buffer = |label: &str| {
            device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents: bytemuck::cast_slice(&grid),
                usage: wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_SRC
                    | wgpu::BufferUsages::COPY_DST,
            })
        };
        let particle_buffers = PingPong::new(particle_buffer("particles_a"), particle_buffer("particles_b"));
        let particle_staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("particles_staging"),
            size: particle_bytes,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let cell_bytes = (accumulator.len() * std::mem::size_of::<u32>()) as u64;
        let cells = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("accumulator"),
            size: cell_bytes,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let cells_staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("accumulator_staging"),
            size: cell_bytes,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mixture = MixtureOfGaussians::default();
        let mixture_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("mixture"),
            contents: bytemuck::bytes_of(&mixture.to_gpu()),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });
        let uniform = |label: &str, size: u64| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
        };
        let step_buffer = uniform("step", std::mem::size_of::<StepUniforms>() as u64);
        let estimate_view = uniform("estimate_view", std::mem::size_of::<ViewUniforms>() as u64);
        let analytic_view = uniform("analytic_view", std::mem::size_of::<ViewUniforms>() as u64);

        let integrate_group = |read: Slot| {
            device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("integrate"),
                layout: &integrate.layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: mixture_buffer.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: step_buffer.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: particle_buffers.get(read).as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 3,
                        resource: particle_buffers.get(read.other()).as_entire_binding(),
                    },
                ],
            })
        };
        let accumulate_group = |read: Slot| {
            device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("accumulate"),
                layout: &accumulate.layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: mixture_buffer.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: estimate_view.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: particle_buffers.get(read).as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 3,
                        resource: cells.as_entire_binding(),
                    },
                ],
            })
        };
        let integrate_groups = [integrate_group(Slot::A), integrate_group(Slot::B)];
        let accumulate_groups = [accumulate_group(Slot::A), accumulate_group(Slot::B)];

        log::info!(
            "gpu backend: {}x{} particles, {}x{} accumulator",
            particles.width,
            particles.height,
            accumulator.width,
            accumulator.height
        );

        Ok(Self {
            device,
            queue,
            adapter_name: info.name,
            grid: particles,
            seed,
            particles: particle_buffers,
            particle_staging,
            accumulator,
            cells,
            cells_staging,
            mixture,
            mixture_buffer,
            step_buffer,
            estimate_view,
            analytic_view,
            integrate,
            accumulate,
            estimate,
            analytic,
            integrate_groups,
            accumulate_groups,
            output: None,
            plot: ParticleRenderer::default(),
        })
    }

    pub fn adapter_name(&self) -> &str {
        &self.adapter_name
    }

    fn wait(&self) -> Result<()> {
        self.device
            .poll(wgpu::PollType::Wait {
                submission_index: None,
                timeout: None,
            })
            .map_err(|e| Error::Device(e.to_string()))?;
        Ok(())
    }

    /// Map the first `size` bytes of `staging` and copy them out.
    fn read_staging(&self, staging: &wgpu::Buffer, size: u64) -> Result<Vec<u8>> {
        let slice = staging.slice(..size);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |r| {
            let _ = tx.send(r);
        });
        self.wait()?;
        rx.recv()
            .map_err(|e| Error::BufferMap(e.to_string()))?
            .map_err(|e| Error::BufferMap(e.to_string()))?;
        let bytes = slice.get_mapped_range().to_vec();
        staging.unmap();
        Ok(bytes)
    }

    fn view_uniforms(&self, transform: &ViewTransform, bounds: (u32, u32, u32, u32), surface_width: u32) -> ViewUniforms {
        let (x0, y0, x1, y1) = bounds;
        ViewUniforms {
            sim_min: transform.sim.pmin.to_array(),
            sim_max: transform.sim.pmax.to_array(),
            pix_min: transform.pixels.pmin.to_array(),
            pix_max: transform.pixels.pmax.to_array(),
            origin: [x0, y0],
            extent: [x1 - x0, y1 - y0],
            grid: [self.accumulator.width as u32, self.accumulator.height as u32],
            surface_width,
            particle_count: self.grid.len() as u32,
        }
    }

    /// Clear the accumulator and bin the readable particles under `sim`.
    fn encode_accumulate(&self, encoder: &mut wgpu::CommandEncoder) {
        encoder.clear_buffer(&self.cells, 0, None);
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("accumulate"),
            timestamp_writes: None,
        });
        let (x, y) = particle_dispatch(self.grid.len());
        pass.set_pipeline(&self.accumulate.pipeline);
        pass.set_bind_group(0, &self.accumulate_groups[self.particles.readable().index()], &[]);
        pass.dispatch_workgroups(x, y, 1);
    }

    /// (Re)create the output buffer when the display size changes.
    fn ensure_output(&mut self, width: u32, height: u32) {
        if self
            .output
            .as_ref()
            .is_some_and(|o| o.width == width && o.height == height)
        {
            return;
        }
        log::debug!("gpu output resized to {width}x{height}");
        let size = (width as u64 * height as u64 * 4).max(4);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("output"),
            size,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("output_staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let estimate_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("estimate"),
            layout: &self.estimate.layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: self.mixture_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: self.estimate_view.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: self.cells.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: buffer.as_entire_binding(),
                },
            ],
        });
        let analytic_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("analytic"),
            layout: &self.analytic.layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: self.mixture_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: self.analytic_view.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: buffer.as_entire_binding(),
                },
            ],
        });
        self.output = Some(OutputTarget {
            width,
            height,
            buffer,
            staging,
            estimate_group,
            analytic_group,
        });
    }

    /// Run a per-pixel kernel over `transform.pixels` and copy the result
    /// into the same region of `surface`.
    fn render_region(
        &mut self,
        transform: &ViewTransform,
        surface: &mut Surface,
        estimate: bool,
    ) -> Result<()> {
        let (width, height) = (surface.width(), surface.height());
        let bounds = transform.pixels.pixel_bounds(width, height);
        let (x0, y0, x1, y1) = bounds;
        if x0 >= x1 || y0 >= y1 {
            return Ok(());
        }
        self.ensure_output(width, height);
        let uniforms = self.view_uniforms(transform, bounds, width);
        let view_buffer = if estimate { &self.estimate_view } else { &self.analytic_view };
        self.queue.write_buffer(view_buffer, 0, bytemuck::bytes_of(&uniforms));

        let Some(output) = self.output.as_ref() else {
            return Ok(());
        };
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("render") });
        if estimate {
            self.encode_accumulate(&mut encoder);
        }
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(if estimate { "estimate" } else { "analytic" }),
                timestamp_writes: None,
            });
            let (kernel, group) = if estimate {
                (&self.estimate, &output.estimate_group)
            } else {
                (&self.analytic, &output.analytic_group)
            };
            pass.set_pipeline(&kernel.pipeline);
            pass.set_bind_group(0, group, &[]);
            pass.dispatch_workgroups(
                (x1 - x0).div_ceil(PIXEL_WORKGROUP),
                (y1 - y0).div_ceil(PIXEL_WORKGROUP),
                1,
            );
        }
        // only the rows the pass touched
        let row_bytes = width as u64 * 4;
        let size = (y1 - y0) as u64 * row_bytes;
        encoder.copy_buffer_to_buffer(&output.buffer, y0 as u64 * row_bytes, &output.staging, 0, size);
        self.queue.submit(Some(encoder.finish()));

        let bytes = self.read_staging(&output.staging, size)?;
        let rows: &[[u8; 4]] = bytemuck::cast_slice(&bytes);
        let (x0, x1, w) = (x0 as usize, x1 as usize, width as usize);
        for (row, y) in rows.chunks_exact(w).zip(y0 as usize..) {
            surface.pixels_mut()[y * w + x0..y * w + x1].copy_from_slice(&row[x0..x1]);
        }
        Ok(())
    }

    /// Accumulate under `sim` on the device and read the grid back.
    pub fn read_accumulator(&mut self, sim: &Viewport) -> Result<Vec<u32>> {
        let transform = ViewTransform {
            sim: *sim,
            pixels: Viewport::new(Vec2::ZERO, Vec2::ONE),
        };
        let uniforms = self.view_uniforms(&transform, (0, 0, 0, 0), 0);
        self.queue.write_buffer(&self.estimate_view, 0, bytemuck::bytes_of(&uniforms));

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("read_accumulator") });
        self.encode_accumulate(&mut encoder);
        let size = self.cells.size();
        encoder.copy_buffer_to_buffer(&self.cells, 0, &self.cells_staging, 0, size);
        self.queue.submit(Some(encoder.finish()));

        let bytes = self.read_staging(&self.cells_staging, size)?;
        Ok(bytemuck::cast_slice::<u8, u32>(&bytes).to_vec())
    }
}

impl Backend for GpuBackend {
    fn name(&self) -> &'static str {
        "gpu"
    }

    fn particle_count(&self) -> usize {
        self.grid.len()
    }

    fn steps(&self) -> u64 {
        self.particles.steps()
    }

    fn set_mixture(&mut self, mixture: &MixtureOfGaussians) -> Result<()> {
        log::debug!("mixture resynchronised: {} components, peak {}", mixture.count(), mixture.peak());
        self.mixture = mixture.clone();
        self.queue
            .write_buffer(&self.mixture_buffer, 0, bytemuck::bytes_of(&mixture.to_gpu()));
        Ok(())
    }

    fn step(&mut self, dt: f32) -> Result<()> {
        let uniforms = StepUniforms {
            seed: split_u64(self.seed),
            step: split_u64(self.particles.steps()),
            dt,
            count: self.grid.len() as u32,
            _pad: [0; 2],
        };
        self.queue.write_buffer(&self.step_buffer, 0, bytemuck::bytes_of(&uniforms));

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("step") });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("integrate"),
                timestamp_writes: None,
            });
            let (x, y) = particle_dispatch(self.grid.len());
            pass.set_pipeline(&self.integrate.pipeline);
            pass.set_bind_group(0, &self.integrate_groups[self.particles.readable().index()], &[]);
            pass.dispatch_workgroups(x, y, 1);
        }
        self.queue.submit(Some(encoder.finish()));
        // the write target becomes readable once the submission is queued;
        // later submissions are ordered after it
        self.particles.advance(|_, _, _| ());
        Ok(())
    }

    fn render_estimate(&mut self, transform: &ViewTransform, surface: &mut Surface) -> Result<()> {
        self.render_region(transform, surface, true)
    }

    fn render_analytic(&mut self, transform: &ViewTransform, surface: &mut Surface) -> Result<()> {
        self.render_region(transform, surface, false)
    }

    fn render_particles(&mut self, transform: &ViewTransform, surface: &mut Surface) -> Result<()> {
        let particles = self.read_particles()?;
        self.plot.render(&particles, transform, surface);
        Ok(())
    }

    fn read_particles(&mut self) -> Result<Vec<Vec2>> {
        let size = self.particle_staging.size();
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("read_particles") });
        encoder.copy_buffer_to_buffer(self.particles.current(), 0, &self.particle_staging, 0, size);
        self.queue.submit(Some(encoder.finish()));

        let bytes = self.read_staging(&self.particle_staging, size)?;
        Ok(bytemuck::cast_slice::<u8, [f32; 2]>(&bytes)
            .iter()
            .map(|&p| Vec2::from(p))
            .collect())
    }

    fn reset_particles(&mut self, seed: u64) -> Result<()> {
        let grid = initial_grid(self.grid.width, self.grid.height);
        let queue = &self.queue;
        self.particles
            .reset_with(|buffer| queue.write_buffer(buffer, 0, bytemuck::cast_slice(&grid)));
        self.seed = seed;
        Ok(())
    }

    fn estimate_stats(&mut self, sim: &Viewport) -> Result<EstimateStats> {
        let cells = self.read_accumulator(sim)?;
        let mut estimator = DensityEstimator::new(self.accumulator.width, self.accumulator.height)?;
        estimator.load(&cells, sim, self.grid.len());
        Ok(estimator.stats(&self.mixture))
    }
}
