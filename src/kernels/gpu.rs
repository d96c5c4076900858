//! WGSL compute pipelines.
//!
//! Every kernel source is embedded with `include_str!`, checked through
//! [`WgslSource`] and compiled once when the runtime is created. A kernel
//! keeps its pipeline, bind group layout and a 16-byte parameter uniform;
//! each dispatch rewrites the uniform, binds the tensors and submits one
//! compute pass.

use super::{Kernel, Launch, Params};
use crate::device::GpuDevice;
use crate::error::{Error, Result};
use briny::prelude::*;
use std::collections::HashMap;

const MATMUL: &str = include_str!("shaders/matmul.wgsl");
const ADD: &str = include_str!("shaders/add.wgsl");
const MUL: &str = include_str!("shaders/mul.wgsl");
const BIAS_ADD: &str = include_str!("shaders/bias_add.wgsl");
const RELU: &str = include_str!("shaders/relu.wgsl");
const RELU_BACKWARD: &str = include_str!("shaders/relu_backward.wgsl");
const SOFTMAX: &str = include_str!("shaders/softmax.wgsl");
const SOFTMAX_BACKWARD: &str = include_str!("shaders/softmax_backward.wgsl");
const CROSS_ENTROPY: &str = include_str!("shaders/cross_entropy.wgsl");
const SOFTMAX_CE_BACKWARD: &str = include_str!("shaders/softmax_cross_entropy_backward.wgsl");
const TRANSPOSE: &str = include_str!("shaders/transpose.wgsl");
const SUM_ALL: &str = include_str!("shaders/sum_all.wgsl");
const SUM_REDUCE: &str = include_str!("shaders/sum_reduce.wgsl");
const INPLACE_ADD: &str = include_str!("shaders/inplace_add.wgsl");
const SCALAR_MUL: &str = include_str!("shaders/scalar_mul.wgsl");
const CLIP_GRAD_NORM: &str = include_str!("shaders/clip_grad_norm.wgsl");

fn source(kernel: Kernel) -> &'static str {
    match kernel {
        Kernel::MatMul => MATMUL,
        Kernel::Add => ADD,
        Kernel::Mul => MUL,
        Kernel::BiasAdd => BIAS_ADD,
        Kernel::Relu => RELU,
        Kernel::ReluBackward => RELU_BACKWARD,
        Kernel::Softmax => SOFTMAX,
        Kernel::SoftmaxBackward => SOFTMAX_BACKWARD,
        Kernel::CrossEntropy => CROSS_ENTROPY,
        Kernel::SoftmaxCrossEntropyBackward => SOFTMAX_CE_BACKWARD,
        Kernel::Transpose => TRANSPOSE,
        Kernel::SumAll => SUM_ALL,
        Kernel::SumReduce => SUM_REDUCE,
        Kernel::InplaceAdd => INPLACE_ADD,
        Kernel::ScalarMul => SCALAR_MUL,
        Kernel::ClipGradNorm => CLIP_GRAD_NORM,
    }
}

/// Wrapper for embedded WGSL that must pass basic checks before compilation.
pub(crate) struct WgslSource<'a>(pub &'a str);

impl Validate for WgslSource<'_> {
    fn validate(&self) -> Result<(), ValidationError> {
        let src = self.0;

        if src.len() > 65536 {
            return Err(ValidationError);
        }
        if !src.contains("@compute") || !src.contains("fn main") {
            return Err(ValidationError);
        }
        if !src.contains("var<uniform> params: Params") {
            return Err(ValidationError);
        }
        if src.contains("#include") || src.contains("import") {
            return Err(ValidationError);
        }

        let forbidden = ["asm", "unsafe", "std::"];
        if forbidden.iter().any(|bad| src.contains(bad)) {
            return Err(ValidationError);
        }

        Ok(())
    }
}

/// Validates `source` and compiles it into a shader module.
pub(crate) fn load_shader(
    device: &wgpu::Device,
    label: &'static str,
    source: &str,
) -> Result<wgpu::ShaderModule> {
    WgslSource(source)
        .validate()
        .map_err(|_| Error::Shader(label))?;

    Ok(device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(source.into()),
    }))
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

/// Uniform at 0, read-only storage for each input, read-write storage last.
fn layout_entries(inputs: usize) -> Vec<wgpu::BindGroupLayoutEntry> {
    let mut entries = vec![buffer_entry(0, wgpu::BufferBindingType::Uniform)];
    for binding in 1..=inputs as u32 {
        entries.push(buffer_entry(
            binding,
            wgpu::BufferBindingType::Storage { read_only: true },
        ));
    }
    entries.push(buffer_entry(
        inputs as u32 + 1,
        wgpu::BufferBindingType::Storage { read_only: false },
    ));
    entries
}

struct CompiledKernel {
    pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
    params: wgpu::Buffer,
}

impl CompiledKernel {
    fn new(device: &wgpu::Device, kernel: Kernel) -> Result<Self> {
        let label = kernel.label();
        let module = load_shader(device, label, source(kernel))?;
        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(label),
            entries: &layout_entries(kernel.inputs()),
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
            cache: None,
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        });
        let params = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: size_of::<Params>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        Ok(Self {
            pipeline,
            layout,
            params,
        })
    }
}

/// All compiled kernels of one device.
pub(crate) struct GpuKernels {
    kernels: HashMap<Kernel, CompiledKernel>,
}

impl GpuKernels {
    pub(crate) fn compile(gpu: &GpuDevice) -> Result<Self> {
        let mut kernels = HashMap::with_capacity(Kernel::ALL.len());
        for kernel in Kernel::ALL {
            kernels.insert(kernel, CompiledKernel::new(&gpu.device, kernel)?);
        }
        log::debug!("compiled {} compute pipelines", kernels.len());
        Ok(Self { kernels })
    }

    pub(crate) fn run(&self, gpu: &GpuDevice, launch: &Launch<'_>) -> Result<()> {
        let kernel = launch.kernel;
        let compiled = self
            .kernels
            .get(&kernel)
            .ok_or(Error::Shader(kernel.label()))?;

        gpu.queue
            .write_buffer(&compiled.params, 0, bytemuck::bytes_of(&launch.params));

        let mut entries = vec![wgpu::BindGroupEntry {
            binding: 0,
            resource: compiled.params.as_entire_binding(),
        }];
        for (binding, &id) in launch
            .inputs
            .iter()
            .chain(std::iter::once(&launch.output))
            .enumerate()
        {
            entries.push(wgpu::BindGroupEntry {
                binding: binding as u32 + 1,
                resource: gpu.buffer(id)?.as_entire_binding(),
            });
        }
        let bind_group = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(kernel.label()),
            layout: &compiled.layout,
            entries: &entries,
        });

        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(kernel.label()),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(kernel.label()),
                timestamp_writes: None,
            });
            pass.set_pipeline(&compiled.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            let [x, y, z] = kernel.grid(&launch.params);
            pass.dispatch_workgroups(x, y, z);
        }
        gpu.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_sources_pass_validation() {
        for kernel in Kernel::ALL {
            assert!(
                WgslSource(source(kernel)).validate().is_ok(),
                "{} rejected",
                kernel.label()
            );
        }
    }

    #[test]
    fn rejects_foreign_sources() {
        assert!(WgslSource("fn helper() {}").validate().is_err());
        let with_include = format!("#include \"x\"\n{MATMUL}");
        assert!(WgslSource(&with_include).validate().is_err());
    }

    #[test]
    fn layouts_follow_binding_convention() {
        let entries = layout_entries(Kernel::SoftmaxCrossEntropyBackward.inputs());
        assert_eq!(entries.len(), 5);
        assert!(matches!(
            entries[4].ty,
            wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only: false },
                ..
            }
        ));
    }
}
