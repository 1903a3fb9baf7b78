//! Reference [`GpuBackend`] implementation on top of `wgpu`.
//!
//! Grounded in the buffer/texture/pipeline bookkeeping conventions used
//! elsewhere in this crate's renderer module, generalized from the three
//! fixed tile-drawing shapes this engine needs (texture, grid, dotgrid)
//! rather than a general vector-tile pipeline cache. Actual WGSL source
//! lives with the host — this backend only compiles whatever modules the
//! host registers with [`WgpuBackend::register_shader`] and wires them into
//! a pipeline the first time a given `(vert, frag, blend, depth, primitive)`
//! combination is drawn.

use super::buffer::{BufferKind, BufferRegistry};
use super::texture::TextureRegistry;
use super::{BandResource, DrawPass, GpuBackend, Primitive};
use crate::error::{MapEngineError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use wgpu::util::DeviceExt;
use wgpu::{BindGroupLayout, Device, Queue, RenderPipeline, Sampler, ShaderModule, Texture, TextureView};

type PipelineKey = (&'static str, &'static str, bool, bool, PrimitiveKey, PipelineShape);

/// Whether a pipeline samples textures (`Texture` draw mode) or reads
/// per-instance attribute buffers (`Grid`/`Dotgrid` draw mode) — these need
/// different bind group layouts and vertex buffer layouts, so they can never
/// share a pipeline even when vert/frag/blend/depth/primitive all match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum PipelineShape {
    Sampler,
    Attribute(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum PrimitiveKey {
    TriangleList,
    TriangleStrip,
    PointList,
}

impl From<Primitive> for PrimitiveKey {
    fn from(p: Primitive) -> Self {
        match p {
            Primitive::TriangleList => PrimitiveKey::TriangleList,
            Primitive::TriangleStrip => PrimitiveKey::TriangleStrip,
            Primitive::PointList => PrimitiveKey::PointList,
        }
    }
}

fn primitive_topology(p: PrimitiveKey) -> wgpu::PrimitiveTopology {
    match p {
        PrimitiveKey::TriangleList => wgpu::PrimitiveTopology::TriangleList,
        PrimitiveKey::TriangleStrip => wgpu::PrimitiveTopology::TriangleStrip,
        PrimitiveKey::PointList => wgpu::PrimitiveTopology::PointList,
    }
}

fn buffer_usage(kind: BufferKind) -> wgpu::BufferUsages {
    match kind {
        BufferKind::Attribute => wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
        BufferKind::Index => wgpu::BufferUsages::INDEX | wgpu::BufferUsages::COPY_DST,
        BufferKind::Uniform => wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
    }
}

/// `wgpu`-backed [`GpuBackend`]. Owns no surface or window — the host drives
/// `begin_frame`/`end_frame` around whatever surface texture it acquired.
pub struct WgpuBackend {
    device: Arc<Device>,
    queue: Arc<Queue>,
    color_format: wgpu::TextureFormat,

    buffer_reg: BufferRegistry,
    buffers: HashMap<super::BufferHandle, wgpu::Buffer>,

    texture_reg: TextureRegistry,
    textures: HashMap<super::TextureHandle, (Texture, TextureView)>,
    sampler: Sampler,

    shaders: HashMap<&'static str, ShaderModule>,
    uniform_layout: BindGroupLayout,
    band_layout: BindGroupLayout,
    pipelines: HashMap<PipelineKey, RenderPipeline>,

    encoder: Option<wgpu::CommandEncoder>,
    target: Option<TextureView>,
}

impl WgpuBackend {
    /// Build a backend targeting `color_format` (the surface/swapchain format).
    pub fn new(device: Arc<Device>, queue: Arc<Queue>, color_format: wgpu::TextureFormat) -> Self {
        let uniform_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("pyramid-engine uniform layout"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            }],
        });

        let band_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("pyramid-engine band layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("pyramid-engine band sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        Self {
            device,
            queue,
            color_format,
            buffer_reg: BufferRegistry::new(),
            buffers: HashMap::new(),
            texture_reg: TextureRegistry::new(),
            textures: HashMap::new(),
            sampler,
            shaders: HashMap::new(),
            uniform_layout,
            band_layout,
            pipelines: HashMap::new(),
            encoder: None,
            target: None,
        }
    }

    /// Register a compiled WGSL module under `name` so later [`DrawPass`]es
    /// referencing it as `vert`/`frag` can find it. The engine core never
    /// calls this — the host supplies its own shader text at startup.
    pub fn register_shader(&mut self, name: &'static str, wgsl_source: &str) {
        let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(name),
            source: wgpu::ShaderSource::Wgsl(wgsl_source.into()),
        });
        self.shaders.insert(name, module);
    }

    /// Begin recording a frame against `target`. Must be paired with
    /// [`Self::end_frame`].
    pub fn begin_frame(&mut self, target: TextureView) {
        self.encoder = Some(
            self.device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("pyramid-engine frame"),
                }),
        );
        self.target = Some(target);
    }

    /// Finish recording and submit the frame's command buffer.
    pub fn end_frame(&mut self) {
        if let Some(encoder) = self.encoder.take() {
            self.queue.submit(std::iter::once(encoder.finish()));
        }
        self.target = None;
    }

    fn pipeline_for(&mut self, pass: &DrawPass) -> Result<RenderPipeline> {
        let attribute_count = pass
            .bands
            .iter()
            .filter(|b| matches!(b, BandResource::Attribute(_)))
            .count();
        let shape = if attribute_count > 0 {
            PipelineShape::Attribute(attribute_count as u8)
        } else {
            PipelineShape::Sampler
        };
        let key: PipelineKey = (pass.vert, pass.frag, pass.blend, pass.depth, pass.primitive.into(), shape);
        if !self.pipelines.contains_key(&key) {
            let vert = self
                .shaders
                .get(pass.vert)
                .ok_or_else(|| MapEngineError::NotSupported(format!("unregistered vertex shader {}", pass.vert)))?;
            let frag = self
                .shaders
                .get(pass.frag)
                .ok_or_else(|| MapEngineError::NotSupported(format!("unregistered fragment shader {}", pass.frag)))?;

            let layout = match shape {
                PipelineShape::Sampler => self.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                    label: Some("pyramid-engine pipeline layout"),
                    bind_group_layouts: &[&self.uniform_layout, &self.band_layout],
                    push_constant_ranges: &[],
                }),
                PipelineShape::Attribute(_) => self.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                    label: Some("pyramid-engine attribute pipeline layout"),
                    bind_group_layouts: &[&self.uniform_layout],
                    push_constant_ranges: &[],
                }),
            };

            let blend = if pass.blend {
                Some(wgpu::BlendState::ALPHA_BLENDING)
            } else {
                None
            };

            // One vertex buffer per attribute band, each a tightly packed
            // f32 read once per instance (one grid cell per instance).
            let attribute_slots: Vec<[wgpu::VertexAttribute; 1]> = match shape {
                PipelineShape::Sampler => Vec::new(),
                PipelineShape::Attribute(n) => (0..n)
                    .map(|slot| {
                        [wgpu::VertexAttribute {
                            format: wgpu::VertexFormat::Float32,
                            offset: 0,
                            shader_location: slot as u32,
                        }]
                    })
                    .collect(),
            };
            let vertex_buffers: Vec<wgpu::VertexBufferLayout> = attribute_slots
                .iter()
                .map(|attrs| wgpu::VertexBufferLayout {
                    array_stride: std::mem::size_of::<f32>() as wgpu::BufferAddress,
                    step_mode: wgpu::VertexStepMode::Instance,
                    attributes: attrs,
                })
                .collect();

            let pipeline = self.device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some("pyramid-engine pipeline"),
                layout: Some(&layout),
                vertex: wgpu::VertexState {
                    module: vert,
                    entry_point: "vs_main",
                    buffers: &vertex_buffers,
                },
                fragment: Some(wgpu::FragmentState {
                    module: frag,
                    entry_point: "fs_main",
                    targets: &[Some(wgpu::ColorTargetState {
                        format: self.color_format,
                        blend,
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                }),
                primitive: wgpu::PrimitiveState {
                    topology: primitive_topology(key.4),
                    strip_index_format: None,
                    front_face: wgpu::FrontFace::Ccw,
                    cull_mode: None,
                    unclipped_depth: false,
                    polygon_mode: wgpu::PolygonMode::Fill,
                    conservative: false,
                },
                depth_stencil: pass.depth.then(|| wgpu::DepthStencilState {
                    format: wgpu::TextureFormat::Depth32Float,
                    depth_write_enabled: true,
                    depth_compare: wgpu::CompareFunction::Less,
                    stencil: wgpu::StencilState::default(),
                    bias: wgpu::DepthBiasState::default(),
                }),
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
            });

            self.pipelines.insert(key, pipeline);
        }
        Ok(self.pipelines.get(&key).expect("just inserted").clone())
    }
}

impl GpuBackend for WgpuBackend {
    fn create_buffer(&mut self, kind: BufferKind, data: &[u8]) -> Result<super::BufferHandle> {
        let handle = self.buffer_reg.allocate(kind, data.len());
        let buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("pyramid-engine buffer"),
            contents: data,
            usage: buffer_usage(kind),
        });
        self.buffers.insert(handle, buffer);
        Ok(handle)
    }

    fn update_buffer(&mut self, handle: super::BufferHandle, data: &[u8]) -> Result<()> {
        let buffer = self
            .buffers
            .get(&handle)
            .ok_or_else(|| MapEngineError::Buffer("unknown buffer handle".into()))?;
        self.queue.write_buffer(buffer, 0, data);
        self.buffer_reg.resize(handle, data.len());
        Ok(())
    }

    fn destroy_buffer(&mut self, handle: super::BufferHandle) {
        self.buffers.remove(&handle);
        self.buffer_reg.release(handle);
    }

    fn create_texture(&mut self, width: u32, height: u32) -> Result<super::TextureHandle> {
        let handle = self.texture_reg.allocate(width, height);
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("pyramid-engine band texture"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::R32Float,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        self.textures.insert(handle, (texture, view));
        Ok(handle)
    }

    fn update_texture(&mut self, handle: super::TextureHandle, width: u32, height: u32, data: &[f32]) -> Result<()> {
        let (texture, _) = self
            .textures
            .get(&handle)
            .ok_or_else(|| MapEngineError::Texture("unknown texture handle".into()))?;
        self.queue.write_texture(
            wgpu::ImageCopyTexture {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            bytemuck::cast_slice(data),
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(4 * width),
                rows_per_image: Some(height),
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        Ok(())
    }

    fn destroy_texture(&mut self, handle: super::TextureHandle) {
        self.textures.remove(&handle);
        self.texture_reg.release(handle);
    }

    fn create_colormap_texture(&mut self, samples: &[[f32; 4]]) -> Result<super::TextureHandle> {
        let width = samples.len().max(1) as u32;
        let handle = self.texture_reg.allocate(width, 1);
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("pyramid-engine colormap"),
            size: wgpu::Extent3d {
                width,
                height: 1,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba32Float,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let flat: Vec<f32> = samples.iter().flat_map(|c| c.iter().copied()).collect();
        self.queue.write_texture(
            wgpu::ImageCopyTexture {
                texture: &texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            bytemuck::cast_slice(&flat),
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(16 * width),
                rows_per_image: Some(1),
            },
            wgpu::Extent3d {
                width,
                height: 1,
                depth_or_array_layers: 1,
            },
        );
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        self.textures.insert(handle, (texture, view));
        Ok(handle)
    }

    fn submit(&mut self, pass: &DrawPass) -> Result<()> {
        let uniform_bytes = bytemuck::bytes_of(&UniformsPod::from(&pass.uniforms));
        let uniform_buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("pyramid-engine draw uniforms"),
            contents: uniform_bytes,
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let uniform_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("pyramid-engine uniform group"),
            layout: &self.uniform_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: uniform_buffer.as_entire_binding(),
            }],
        });

        let sampler_views: Vec<&TextureView> = pass
            .bands
            .iter()
            .filter_map(|b| match b {
                BandResource::Sampler(handle) => self.textures.get(handle).map(|(_, v)| v),
                BandResource::Attribute(_) => None,
            })
            .collect();
        let attribute_buffers: Vec<&wgpu::Buffer> = pass
            .bands
            .iter()
            .filter_map(|b| match b {
                BandResource::Attribute(handle) => self.buffers.get(handle),
                BandResource::Sampler(_) => None,
            })
            .collect();

        let pipeline = self.pipeline_for(pass)?;
        let target = self
            .target
            .as_ref()
            .ok_or_else(|| MapEngineError::NotSupported("submit called outside begin_frame/end_frame".into()))?;
        let encoder = self
            .encoder
            .as_mut()
            .ok_or_else(|| MapEngineError::NotSupported("submit called outside begin_frame/end_frame".into()))?;

        let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("pyramid-engine tile pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: target,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Load,
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        render_pass.set_pipeline(&pipeline);
        render_pass.set_bind_group(0, &uniform_group, &[]);

        if !attribute_buffers.is_empty() {
            // Grid/dotgrid draw modes: one instance per grid cell, each band
            // bound as its own per-instance vertex buffer, no texture group.
            for (slot, buffer) in attribute_buffers.iter().enumerate() {
                render_pass.set_vertex_buffer(slot as u32, buffer.slice(..));
            }
            render_pass.draw(0..pass.count, 0..1);
        } else if let Some(view) = sampler_views.first() {
            let band_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("pyramid-engine band group"),
                layout: &self.band_layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: wgpu::BindingResource::TextureView(view),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::Sampler(&self.sampler),
                    },
                ],
            });
            render_pass.set_bind_group(1, &band_group, &[]);
            render_pass.draw(0..pass.count, 0..1);
        }

        Ok(())
    }
}

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct UniformsPod {
    camera: [f32; 2],
    viewport: [f32; 2],
    pixel_ratio: f32,
    zoom: f32,
    size: f32,
    global_level: f32,
    level: f32,
    offset: [f32; 2],
    order: [f32; 2],
    projection: f32,
    clim: [f32; 2],
    opacity: f32,
    fill_value: f32,
    center_y: f32,
    _pad: f32,
}

impl From<&super::DrawUniforms> for UniformsPod {
    fn from(u: &super::DrawUniforms) -> Self {
        Self {
            camera: u.camera,
            viewport: u.viewport,
            pixel_ratio: u.pixel_ratio,
            zoom: u.zoom,
            size: u.size,
            global_level: u.global_level as f32,
            level: u.level as f32,
            offset: u.offset,
            order: u.order,
            projection: u.projection as f32,
            clim: u.clim,
            opacity: u.opacity,
            fill_value: u.fill_value,
            center_y: u.center_y,
            _pad: 0.0,
        }
    }
}
