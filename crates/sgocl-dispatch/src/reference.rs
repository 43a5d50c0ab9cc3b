//! Host implementations of `multOCL` and `multTransOCL` for
//! [`HostBackend`](sgocl_runtime::HostBackend).
//!
//! They read the same buffers and scalar arguments as the generated
//! OpenCL C and follow the same direct/stream evaluation, so dispatch
//! logic can be tested without an OpenCL runtime.

use sgocl_common::{ClStatus, OclError, Real, Result};
use sgocl_runtime::{HostArgs, HostKernel, HostLaunch, LaunchDims};

use crate::layout::{DESCRIPTOR_WORDS, KIND_SUBSPACE, direct_lookup, hat};
use crate::source::Operation;

/// Host kernels for both operators in precision `T`.
#[must_use]
pub fn kernels<T: Real>() -> [HostKernel; 2] {
    [
        HostKernel { entry: Operation::Mult.entry(), outputs: &[5], run: mult::<T> },
        HostKernel { entry: Operation::MultTranspose.entry(), outputs: &[5], run: mult_transpose::<T> },
    ]
}

fn bad_args(device: usize) -> OclError {
    OclError::Device { device, call: "clEnqueueNDRangeKernel", code: ClStatus::INVALID_ARG_VALUE }
}

/// Inputs common to both entry points.
struct GridArgs<'a, T> {
    levels: &'a [T],
    indices: &'a [T],
    descriptors: &'a [u32],
    data: &'a [T],
    dims: usize,
    num_subspaces: usize,
}

impl<'a, T: Real> GridArgs<'a, T> {
    fn bind(args: &HostArgs<'a>, device: usize, stride: usize, global_end: usize) -> Result<Self> {
        let levels = args.input::<T>(0)?;
        let indices = args.input::<T>(1)?;
        let descriptors = args.input::<u32>(2)?;
        let data = args.input::<T>(3)?;
        let num_subspaces = args.u32_arg(9)? as usize;

        let dims = if num_subspaces == 0 { 1 } else { levels.len() / num_subspaces };
        if dims == 0
            || descriptors.len() < num_subspaces * DESCRIPTOR_WORDS
            || levels.len() < num_subspaces * dims
            || data.len() < stride * dims
            || global_end > stride
        {
            return Err(bad_args(device));
        }
        Ok(Self { levels, indices, descriptors, data, dims, num_subspaces })
    }

    fn point(&self, j: usize, stride: usize) -> Vec<T> {
        (0..self.dims).map(|d| self.data[j + stride * d]).collect()
    }

    /// Calls `visit(slot, phi_slot(x))` for every slot of subspace `s`
    /// with non-zero support at `x`.
    fn for_each_support(&self, s: usize, x: &[T], mut visit: impl FnMut(usize, T)) {
        let record = &self.descriptors[s * DESCRIPTOR_WORDS..(s + 1) * DESCRIPTOR_WORDS];
        let (start, count) = (record[1] as usize, record[2] as usize);
        let level = &self.levels[s * self.dims..(s + 1) * self.dims];

        if record[0] == KIND_SUBSPACE {
            if let Some((lin, value)) = direct_lookup(level, x) {
                if lin < count {
                    visit(start + lin, value);
                }
            }
        } else {
            for p in start..start + count {
                let Some(index) = self.indices.get(p * self.dims..(p + 1) * self.dims) else {
                    return;
                };
                let value = hat(level, index, x);
                if value != T::ZERO {
                    visit(p, value);
                }
            }
        }
    }
}

fn mult<T: Real>(launch: &mut HostLaunch<'_>) -> Result<()> {
    let device = launch.device;
    let LaunchDims { global_offset, global_size, .. } = launch.dims;
    let (args, out) = launch.split_output::<T>(5)?;
    let alpha = args.input::<T>(4)?;
    let result_size = args.u32_arg(6)? as usize;
    let start_grid = args.u32_arg(7)? as usize;
    let end_grid = args.u32_arg(8)? as usize;

    let global_end = global_offset + global_size;
    let grid = GridArgs::<T>::bind(&args, device, result_size, global_end)?;
    if out.len() < global_end {
        return Err(bad_args(device));
    }
    let last = end_grid.min(grid.num_subspaces);

    for (j, slot) in out.iter_mut().enumerate().take(global_end).skip(global_offset) {
        let x = grid.point(j, result_size);
        let mut res = T::ZERO;
        for s in start_grid..last {
            grid.for_each_support(s, &x, |g, value| {
                if let Some(&a) = alpha.get(g) {
                    res += value * a;
                }
            });
        }
        *slot = res;
    }
    Ok(())
}

fn mult_transpose<T: Real>(launch: &mut HostLaunch<'_>) -> Result<()> {
    let device = launch.device;
    let LaunchDims { global_offset, global_size, .. } = launch.dims;
    let (args, out) = launch.split_output::<T>(5)?;
    let source = args.input::<T>(4)?;
    let source_size = args.u32_arg(6)? as usize;
    let start_data = args.u32_arg(7)? as usize;
    let end_data = args.u32_arg(8)? as usize;

    let global_end = global_offset + global_size;
    let grid = GridArgs::<T>::bind(&args, device, source_size, global_end)?;
    if source.len() < global_end {
        return Err(bad_args(device));
    }

    for j in global_offset.max(start_data)..global_end.min(end_data) {
        let x = grid.point(j, source_size);
        let weight = source[j];
        for s in 0..grid.num_subspaces {
            grid.for_each_support(s, &x, |g, value| {
                if let Some(slot) = out.get_mut(g) {
                    *slot += value * weight;
                }
            });
        }
    }
    Ok(())
}
