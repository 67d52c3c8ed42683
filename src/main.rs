// =============================================================================
// STAGED RENDERER - rotating textured quad
// =============================================================================
//
// Sample application driving the frame lifecycle:
//
//   permanent tier: frame sync, quad geometry and texture (staged uploads),
//                   sampler, layouts, descriptors, uniform buffer, shaders
//   frame tier:     swapchain + views, depth buffer, render pass,
//                   framebuffers, pipeline, per-image command buffers
//
// FRAME FLOW (Lifecycle::tick):
// 1. Wait for the previous frame's fence
// 2. Acquire a swapchain image
// 3. Update hook rewrites the uniform buffer
// 4. Submit the pre-recorded command buffer for that image
// 5. Present; out-of-date or suboptimal swapchains are rebuilt
//
// F11 toggles fullscreen and Escape quits. Edits to the [graphics] and [sync]
// sections of config.toml and to the window title are applied live.
//
// =============================================================================

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use ash::vk;
use glam::{Mat4, Vec3};
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Fullscreen, Window, WindowAttributes},
};

use staged_renderer::backend::memory::{create_depth_buffer, create_host_buffer, create_view, find_depth_format};
use staged_renderer::backend::pipeline::{self, Uniforms, Vertex};
use staged_renderer::backend::shader::{create_shader_module, read_spirv};
use staged_renderer::backend::{BoundBuffer, DepthBuffer, DeviceApi, SwapchainFrame, WaitTimeouts};
use staged_renderer::config::{Config, ConfigWatcher};
use staged_renderer::error::VkResultExt;
use staged_renderer::transfer::{upload_image, upload_slice, ImageUpload};
use staged_renderer::{
    FrameHooks, GpuError, GpuResult, ImageTarget, Lifecycle, LifecycleSettings, TickOutcome, TierScope, VulkanDevice,
};

const QUAD_VERTICES: [Vertex; 4] = [
    Vertex { position: [-0.5, -0.5, 0.0], uv: [0.0, 0.0] },
    Vertex { position: [0.5, -0.5, 0.0], uv: [1.0, 0.0] },
    Vertex { position: [0.5, 0.5, 0.0], uv: [1.0, 1.0] },
    Vertex { position: [-0.5, 0.5, 0.0], uv: [0.0, 1.0] },
];
const QUAD_INDICES: [u16; 6] = [0, 1, 2, 2, 3, 0];

const TEXTURE_SIZE: u32 = 64;
const CHECKER_CELL: u32 = 8;

/// Radians per second
const SPIN_SPEED: f32 = 1.0;

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    let config = Config::load();

    init_logging(&config)?;
    log::info!("Starting staged renderer");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );
    log::info!("Present mode: {}", config.graphics.present_mode);

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    Ok(())
}

/// Initialize logging from the config, honouring RUST_LOG when set
fn init_logging(config: &Config) -> Result<()> {
    use env_logger::{Builder, Env, Target};

    let mut builder = Builder::from_env(Env::default().default_filter_or(config.debug.log_level.as_str()));

    if config.debug.log_to_file {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.debug.log_file)
            .with_context(|| format!("Failed to open log file {:?}", config.debug.log_file))?;
        builder.target(Target::Pipe(Box::new(file)));
    }

    builder.init();
    Ok(())
}

fn shader_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("shaders")
}

/// RGBA checkerboard, one byte per channel
fn checkerboard() -> Vec<u8> {
    let mut pixels = Vec::with_capacity((TEXTURE_SIZE * TEXTURE_SIZE * 4) as usize);
    for y in 0..TEXTURE_SIZE {
        for x in 0..TEXTURE_SIZE {
            let light = ((x / CHECKER_CELL) + (y / CHECKER_CELL)) % 2 == 0;
            let rgba = if light { [235, 235, 235, 255] } else { [40, 40, 60, 255] };
            pixels.extend_from_slice(&rgba);
        }
    }
    pixels
}

// =============================================================================
// RENDER STATE
// =============================================================================

/// Resources rebuilt with the swapchain
struct QuadFrame {
    depth: DepthBuffer,
    render_pass: vk::RenderPass,
    framebuffers: Vec<vk::Framebuffer>,
    pipeline: vk::Pipeline,
}

/// Everything the hooks need. Handles are owned by the lifecycle's registry.
struct Quad {
    vertices: BoundBuffer,
    indices: BoundBuffer,
    uniforms: BoundBuffer,
    pipeline_layout: vk::PipelineLayout,
    descriptor_set: vk::DescriptorSet,
    vert_shader: vk::ShaderModule,
    frag_shader: vk::ShaderModule,
    depth_format: vk::Format,

    clear_color: [f32; 4],
    angle: f32,

    frame: Option<QuadFrame>,
}

/// Permanent tier: staged geometry and texture, descriptors, shaders
fn create_quad(
    device: &VulkanDevice,
    scope: &mut TierScope<'_>,
    shaders: &(Vec<u32>, Vec<u32>),
    timeouts: &WaitTimeouts,
    clear_color: [f32; 4],
) -> GpuResult<Quad> {
    let vertices = scope.adopt(upload_slice(device, &QUAD_VERTICES, vk::BufferUsageFlags::VERTEX_BUFFER, timeouts)?);
    let indices = scope.adopt(upload_slice(device, &QUAD_INDICES, vk::BufferUsageFlags::INDEX_BUFFER, timeouts)?);

    let texture_upload = ImageUpload::new(
        vk::Extent2D { width: TEXTURE_SIZE, height: TEXTURE_SIZE },
        vk::Format::R8G8B8A8_SRGB,
        vk::ImageUsageFlags::SAMPLED,
    );
    let texture = scope.adopt(upload_image(device, &checkerboard(), &texture_upload, timeouts)?);
    let texture_view = scope.adopt(create_view(device, texture.image(), texture.format(), texture.mip_levels())?);
    let sampler = scope.adopt(pipeline::create_sampler(device)?);

    let identity = Uniforms { mvp: Mat4::IDENTITY.to_cols_array_2d() };
    let uniforms = scope.adopt(create_host_buffer(
        device,
        vk::BufferUsageFlags::UNIFORM_BUFFER,
        bytemuck::bytes_of(&identity),
    )?);

    let set_layout = scope.adopt(pipeline::create_descriptor_set_layout(device)?);
    let pipeline_layout = scope.adopt(pipeline::create_pipeline_layout(device, set_layout)?);
    let descriptor_pool = scope.adopt(pipeline::create_descriptor_pool(device)?);
    let descriptor_set = pipeline::allocate_descriptor_set(
        device,
        descriptor_pool,
        set_layout,
        uniforms.buffer(),
        texture_view,
        sampler,
    )?;

    let vert_shader = scope.adopt(create_shader_module(device, &shaders.0)?);
    let frag_shader = scope.adopt(create_shader_module(device, &shaders.1)?);

    Ok(Quad {
        vertices,
        indices,
        uniforms,
        pipeline_layout,
        descriptor_set,
        vert_shader,
        frag_shader,
        depth_format: find_depth_format(device)?,
        clear_color,
        angle: 0.0,
        frame: None,
    })
}

/// Frame tier: depth buffer, render pass, framebuffers, pipeline
fn build_quad_frame(
    device: &VulkanDevice,
    scope: &mut TierScope<'_>,
    quad: &mut Quad,
    swapchain: &SwapchainFrame,
) -> GpuResult<()> {
    let depth = scope.adopt(create_depth_buffer(device, swapchain.extent, quad.depth_format)?);
    let render_pass = scope.adopt(pipeline::create_render_pass(device, swapchain.format.format, quad.depth_format)?);
    let framebuffers = scope.adopt(pipeline::create_framebuffers(
        device,
        &swapchain.views,
        depth.view,
        render_pass,
        swapchain.extent,
    )?);
    let pipeline = scope.adopt(pipeline::create_graphics_pipeline(
        device,
        render_pass,
        quad.pipeline_layout,
        swapchain.extent,
        quad.vert_shader,
        quad.frag_shader,
    )?);

    quad.frame = Some(QuadFrame { depth, render_pass, framebuffers, pipeline });
    Ok(())
}

/// Body of one swapchain image's command buffer
fn record_quad(device: &VulkanDevice, command_buffer: vk::CommandBuffer, quad: &Quad, target: ImageTarget) {
    let Some(frame) = quad.frame.as_ref() else {
        log::error!("Recording without frame resources");
        return;
    };
    log::trace!(
        "Recording image {} into framebuffer {:?} (depth {:?})",
        target.index,
        frame.framebuffers[target.index],
        frame.depth.view
    );

    let clear_values = [
        vk::ClearValue { color: vk::ClearColorValue { float32: quad.clear_color } },
        vk::ClearValue { depth_stencil: vk::ClearDepthStencilValue { depth: 1.0, stencil: 0 } },
    ];
    let render_pass_info = vk::RenderPassBeginInfo::builder()
        .render_pass(frame.render_pass)
        .framebuffer(frame.framebuffers[target.index])
        .render_area(vk::Rect2D { offset: vk::Offset2D { x: 0, y: 0 }, extent: target.extent })
        .clear_values(&clear_values);

    let ash_device = &device.device;
    unsafe {
        ash_device.cmd_begin_render_pass(command_buffer, &render_pass_info, vk::SubpassContents::INLINE);
        ash_device.cmd_bind_pipeline(command_buffer, vk::PipelineBindPoint::GRAPHICS, frame.pipeline);
        ash_device.cmd_bind_vertex_buffers(command_buffer, 0, &[quad.vertices.buffer()], &[0]);
        ash_device.cmd_bind_index_buffer(command_buffer, quad.indices.buffer(), 0, vk::IndexType::UINT16);
        ash_device.cmd_bind_descriptor_sets(
            command_buffer,
            vk::PipelineBindPoint::GRAPHICS,
            quad.pipeline_layout,
            0,
            &[quad.descriptor_set],
            &[],
        );
        ash_device.cmd_draw_indexed(command_buffer, QUAD_INDICES.len() as u32, 1, 0, 0, 0);
        ash_device.cmd_end_render_pass(command_buffer);
    }
}

/// Spin the quad and rewrite the uniform buffer (the previous frame has completed)
fn update_quad(device: &VulkanDevice, quad: &mut Quad, delta: std::time::Duration, target: ImageTarget) -> GpuResult<()> {
    quad.angle = (quad.angle + delta.as_secs_f32() * SPIN_SPEED) % std::f32::consts::TAU;

    let aspect = target.extent.width as f32 / target.extent.height.max(1) as f32;
    let mut projection = Mat4::perspective_rh(45f32.to_radians(), aspect, 0.1, 10.0);
    // Vulkan clip space has Y pointing down
    projection.y_axis.y *= -1.0;
    let view = Mat4::look_at_rh(Vec3::new(0.0, 0.0, 2.0), Vec3::ZERO, Vec3::Y);
    let model = Mat4::from_rotation_y(quad.angle);

    let uniforms = Uniforms { mvp: (projection * view * model).to_cols_array_2d() };
    device
        .write_memory(quad.uniforms.memory(), 0, bytemuck::bytes_of(&uniforms))
        .creating("uniform update")
}

fn quad_hooks() -> FrameHooks<VulkanDevice, Quad> {
    FrameHooks::new(build_quad_frame, record_quad).with_update(update_quad)
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Field order matters for Drop: the lifecycle (and the device it owns)
/// must go before the window its surface was created from.
struct App {
    config: Config,
    watcher: Option<ConfigWatcher>,

    lifecycle: Option<Lifecycle<VulkanDevice, Quad>>,
    window: Option<Arc<Window>>,
    is_fullscreen: bool,

    /// Set when the window size changes; the rebuild happens before the next tick
    needs_resize: bool,

    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        let is_fullscreen = config.window.fullscreen;
        let watcher = match ConfigWatcher::new(Config::DEFAULT_PATH) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                log::warn!("Config hot reload disabled: {:#}", e);
                None
            }
        };
        let now = Instant::now();
        Self {
            config,
            watcher,
            lifecycle: None,
            window: None,
            is_fullscreen,
            needs_resize: false,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    // =========================================================================
    // INITIALIZATION
    // =========================================================================

    fn init_vulkan(&mut self, window: &Window) -> Result<()> {
        log::info!("Initializing Vulkan...");

        let shaders = (
            read_spirv(shader_dir().join("quad.vert.spv"))?,
            read_spirv(shader_dir().join("quad.frag.spv"))?,
        );

        let device = VulkanDevice::new(
            &self.config.window.title,
            self.config.debug.validation_layers,
            window.raw_display_handle(),
            window.raw_window_handle(),
        )?;

        let settings = LifecycleSettings {
            surface: self.config.surface_preferences(),
            timeouts: self.config.timeouts(),
        };
        let timeouts = settings.timeouts;
        let clear_color = self.config.graphics.clear_color;

        let mut lifecycle = Lifecycle::new(device, settings);
        lifecycle
            .initialize_permanent(|device, scope| create_quad(device, scope, &shaders, &timeouts, clear_color))
            .context("Failed to create permanent resources")?;

        let size = window.inner_size();
        lifecycle
            .initialize_frame(vk::Extent2D { width: size.width, height: size.height }, quad_hooks())
            .context("Failed to create frame resources")?;

        self.lifecycle = Some(lifecycle);
        log::info!("Vulkan initialized successfully!");
        Ok(())
    }

    // =========================================================================
    // RENDERING
    // =========================================================================

    fn apply_config_changes(&mut self) -> Result<()> {
        let Some(new_config) = self.watcher.as_ref().and_then(ConfigWatcher::take_update) else {
            return Ok(());
        };
        log::info!("config.toml changed, applying");

        if let Some(lifecycle) = self.lifecycle.as_mut() {
            if new_config.sync != self.config.sync {
                lifecycle.set_timeouts(new_config.timeouts());
            }
            if self.config.requires_frame_rebuild(&new_config) {
                lifecycle.set_surface_preferences(new_config.surface_preferences());
                if let Some(quad) = lifecycle.app_mut() {
                    quad.clear_color = new_config.graphics.clear_color;
                }
                // Clear colour is baked into the recorded command buffers
                self.needs_resize = true;
            }
        }
        if let Some(window) = self.window.as_ref() {
            if new_config.window.title != self.config.window.title {
                window.set_title(&new_config.window.title);
            }
        }

        self.config = new_config;
        Ok(())
    }

    /// Returns whether a frame was presented
    fn render_frame(&mut self) -> Result<bool> {
        self.apply_config_changes()?;

        let (Some(lifecycle), Some(window)) = (self.lifecycle.as_mut(), self.window.as_ref()) else {
            return Ok(false);
        };

        if self.needs_resize {
            let size = window.inner_size();
            lifecycle.resize(vk::Extent2D { width: size.width, height: size.height })?;
            // Only cleared once the rebuild succeeded; a failed one is retried next frame
            self.needs_resize = false;
        }

        let now = Instant::now();
        let delta = now.duration_since(self.last_frame_time);
        self.last_frame_time = now;

        Ok(lifecycle.tick(delta)? == TickOutcome::Presented)
    }

    // =========================================================================
    // FULLSCREEN TOGGLE
    // =========================================================================

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;

            if self.is_fullscreen {
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }

            self.needs_resize = true;
        }
    }

    // =========================================================================
    // FPS TRACKING
    // =========================================================================

    fn update_fps(&mut self) {
        self.frame_count += 1;

        let now = Instant::now();
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;
            if let Some(ref window) = self.window {
                let mode = if self.is_fullscreen { "fullscreen" } else { "windowed" };
                window.set_title(&format!("{} - {:.0} FPS [{}]", self.config.window.title, fps, mode));
            }
            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }

    fn shutdown(&mut self, event_loop: &ActiveEventLoop) {
        if let Some(mut lifecycle) = self.lifecycle.take() {
            if let Err(e) = lifecycle.dispose() {
                log::error!("Disposal failed: {}", e);
            }
        }
        event_loop.exit();
    }
}

fn is_device_lost(error: &anyhow::Error) -> bool {
    error.downcast_ref::<GpuError>().is_some_and(GpuError::is_device_lost)
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(self.config.window.width, self.config.window.height));
        if self.config.window.fullscreen {
            window_attributes = window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };

        if let Err(e) = self.init_vulkan(&window) {
            log::error!("Failed to initialize Vulkan: {:#}", e);
            event_loop.exit();
            return;
        }

        self.window = Some(window);
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: winit::window::WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                self.shutdown(event_loop);
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                self.needs_resize = true;
            }

            WindowEvent::RedrawRequested => match self.render_frame() {
                Ok(true) => self.update_fps(),
                Ok(false) => {}
                Err(e) if is_device_lost(&e) => {
                    log::error!("Device lost, exiting: {:#}", e);
                    self.shutdown(event_loop);
                }
                Err(e) => log::error!("Render error: {:#}", e),
            },

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() {
                    if let PhysicalKey::Code(key) = event.physical_key {
                        match key {
                            KeyCode::Escape => {
                                log::info!("ESC pressed, exiting...");
                                self.shutdown(event_loop);
                            }
                            KeyCode::F11 => self.toggle_fullscreen(),
                            _ => {}
                        }
                    }
                }
            }

            _ => {}
        }
    }

    /// Request continuous redraws
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}
