//! OpenCL C generation for the `mult` and `multTranspose` operators.
//!
//! The emitted entry points follow the argument order bound by
//! [`DispatchEngine`](crate::DispatchEngine):
//!
//! | # | `multOCL`      | `multTransOCL` |
//! |---|----------------|----------------|
//! | 0 | levels         | levels         |
//! | 1 | indices        | indices        |
//! | 2 | descriptors    | descriptors    |
//! | 3 | dataset        | dataset        |
//! | 4 | alpha          | source         |
//! | 5 | result         | result         |
//! | 6 | resultSize     | sourceSize     |
//! | 7 | start_grid     | start_data     |
//! | 8 | end_grid       | end_data       |
//! | 9 | numSubspaces   | numSubspaces   |

use std::fs;
use std::path::PathBuf;

use sgocl_common::{OclConfig, OclError, Precision, Result};
use tracing::{debug, info};

/// Device extension providing native floating-point atomics.
pub const FLOAT_ATOMICS_EXTENSION: &str = "cl_ext_float_atomics";

/// The two evaluation operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// `result[j] = sum_g alpha[g] * phi_g(x_j)` over data points `j`.
    Mult,
    /// `result[g] += sum_j source[j] * phi_g(x_j)` over grid slots `g`.
    MultTranspose,
}

impl Operation {
    /// Kernel entry point name.
    #[must_use]
    pub const fn entry(self) -> &'static str {
        match self {
            Self::Mult => "multOCL",
            Self::MultTranspose => "multTransOCL",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.entry())
    }
}

/// Generated or cached kernel text for one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelSource {
    pub operation: Operation,
    pub text: String,
    /// `true` when read from the source cache instead of generated.
    pub from_cache: bool,
}

/// Line-oriented text sink with indentation.
struct Emitter {
    out: String,
    depth: usize,
}

impl Emitter {
    fn new() -> Self {
        Self { out: String::with_capacity(4096), depth: 0 }
    }

    fn line(&mut self, text: impl AsRef<str>) {
        let text = text.as_ref();
        if !text.is_empty() {
            for _ in 0..self.depth {
                self.out.push_str("    ");
            }
            self.out.push_str(text);
        }
        self.out.push('\n');
    }

    fn open(&mut self, text: impl AsRef<str>) {
        self.line(text);
        self.depth += 1;
    }

    fn close(&mut self, text: impl AsRef<str>) {
        self.depth = self.depth.saturating_sub(1);
        self.line(text);
    }

    /// `} else {` style line: dedent, emit, indent.
    fn close_open(&mut self, text: impl AsRef<str>) {
        self.depth = self.depth.saturating_sub(1);
        self.line(text);
        self.depth += 1;
    }
}

/// Emits kernel source for a fixed precision, dimensionality and
/// work-group size.
#[derive(Debug, Clone)]
pub struct KernelSourceBuilder {
    precision: Precision,
    dims: usize,
    local_size: usize,
    max_dim_unroll: usize,
    native_float_atomics: bool,
    source_dir: PathBuf,
    reuse_source: bool,
    write_source: bool,
}

impl KernelSourceBuilder {
    #[must_use]
    pub fn new(config: &OclConfig, dims: usize) -> Self {
        Self {
            precision: config.internal_precision,
            dims,
            local_size: config.local_size,
            max_dim_unroll: config.kernel_max_dim_unroll,
            native_float_atomics: false,
            source_dir: config.kernel_source_dir.clone(),
            reuse_source: config.reuse_source,
            write_source: config.write_source,
        }
    }

    /// Use `atomic_fetch_add_explicit` instead of a compare-and-swap loop.
    /// Only valid if every device advertises [`FLOAT_ATOMICS_EXTENSION`].
    #[must_use]
    pub const fn with_native_float_atomics(mut self, enabled: bool) -> Self {
        self.native_float_atomics = enabled;
        self
    }

    #[must_use]
    pub const fn dims(&self) -> usize {
        self.dims
    }

    #[must_use]
    pub const fn precision(&self) -> Precision {
        self.precision
    }

    /// Per-dimension values become named scalars instead of arrays.
    #[must_use]
    pub const fn unrolled(&self) -> bool {
        self.dims <= self.max_dim_unroll
    }

    /// Cache file for `op`, keyed by everything that changes the text.
    #[must_use]
    pub fn cache_path(&self, op: Operation) -> PathBuf {
        self.source_dir.join(format!(
            "{}_{}_d{}_u{}_l{}.cl",
            op.entry(),
            self.precision,
            self.dims,
            self.max_dim_unroll,
            self.local_size
        ))
    }

    /// Source for `op`: read verbatim from the cache when `REUSE_SOURCE`
    /// is set, generated otherwise (and written out under `WRITE_SOURCE`).
    pub fn source(&self, op: Operation) -> Result<KernelSource> {
        let path = self.cache_path(op);
        if self.reuse_source {
            if !path.is_file() {
                return Err(OclError::SourceCacheMissing { path });
            }
            let text = fs::read_to_string(&path)?;
            info!("Reusing kernel source {} for {}", path.display(), op);
            return Ok(KernelSource { operation: op, text, from_cache: true });
        }

        let text = self.generate(op);
        if self.write_source {
            fs::write(&path, &text)?;
            debug!("Wrote kernel source {} ({} bytes)", path.display(), text.len());
        }
        Ok(KernelSource { operation: op, text, from_cache: false })
    }

    /// Deterministic kernel text for `op`.
    #[must_use]
    pub fn generate(&self, op: Operation) -> String {
        let mut e = Emitter::new();
        e.line(format!(
            "// {} precision={} dims={} unroll={} local={}",
            op.entry(),
            self.precision,
            self.dims,
            self.max_dim_unroll,
            self.local_size
        ));
        if self.precision == Precision::Double {
            e.line("#pragma OPENCL EXTENSION cl_khr_fp64 : enable");
        }
        if op == Operation::MultTranspose {
            self.emit_atomic_add(&mut e);
        }
        e.line("");
        match op {
            Operation::Mult => self.emit_mult(&mut e),
            Operation::MultTranspose => self.emit_transpose(&mut e),
        }
        e.out
    }

    fn real(&self) -> &'static str {
        self.precision.cl_type()
    }

    fn lit(&self, value: &str) -> String {
        format!("{value}{}", self.precision.literal_suffix())
    }

    fn emit_atomic_add(&self, e: &mut Emitter) {
        let t = self.real();
        if self.native_float_atomics {
            e.line(format!("#pragma OPENCL EXTENSION {FLOAT_ATOMICS_EXTENSION} : enable"));
            e.line("");
            e.open(format!("void atomicAddReal(volatile __global {t}* target, const {t} operand) {{"));
            e.line(format!(
                "atomic_fetch_add_explicit((volatile __global atomic_{t}*) target, operand, memory_order_relaxed);"
            ));
            e.close("}");
            return;
        }

        let int_t = self.precision.cas_int_type();
        let cmpxchg = match self.precision {
            Precision::Float => "atomic_cmpxchg",
            Precision::Double => {
                e.line("#pragma OPENCL EXTENSION cl_khr_int64_base_atomics : enable");
                "atom_cmpxchg"
            }
        };
        e.line("");
        e.open(format!("void atomicAddReal(volatile __global {t}* target, const {t} operand) {{"));
        e.open("union {");
        e.line(format!("{int_t} intVal;"));
        e.line(format!("{t} realVal;"));
        e.close("} prevVal, newVal;");
        e.open("do {");
        e.line("prevVal.realVal = *target;");
        e.line("newVal.realVal = prevVal.realVal + operand;");
        e.close(format!(
            "}} while ({cmpxchg}((volatile __global {int_t}*) target, prevVal.intVal, newVal.intVal) != prevVal.intVal);"
        ));
        e.close("}");
    }

    fn emit_signature(&self, e: &mut Emitter, op: Operation) {
        let t = self.real();
        let (input, size, first, last) = match op {
            Operation::Mult => ("ptrAlpha", "resultSize", "start_grid", "end_grid"),
            Operation::MultTranspose => ("ptrSource", "sourceSize", "start_data", "end_data"),
        };
        e.line("__kernel");
        e.line(format!("__attribute__((reqd_work_group_size({}, 1, 1)))", self.local_size));
        e.line(format!("void {}(__global const {t}* ptrLevels,", op.entry()));
        e.depth += 1;
        e.line(format!("__global const {t}* ptrIndices,"));
        e.line("__global const uint* ptrDescriptors,");
        e.line(format!("__global const {t}* ptrData,"));
        e.line(format!("__global const {t}* {input},"));
        e.line(format!("__global {t}* ptrResult,"));
        e.line(format!("uint {size},"));
        e.line(format!("uint {first},"));
        e.line(format!("uint {last},"));
        e.line("uint numSubspaces)");
        e.depth -= 1;
    }

    /// Name of the work-item coordinate in dimension `d`.
    fn coord(&self, d: &str) -> String {
        if self.unrolled() { format!("data_{d}") } else { format!("data[{d}]") }
    }

    fn emit_load_point(&self, e: &mut Emitter, stride: &str) {
        let t = self.real();
        if self.unrolled() {
            for d in 0..self.dims {
                e.line(format!("const {t} data_{d} = ptrData[globalIdx + {stride} * {d}];"));
            }
        } else {
            e.line(format!("{t} data[{}];", self.dims));
            e.open(format!("for (uint d = 0; d < {}; d++) {{", self.dims));
            e.line(format!("data[d] = ptrData[globalIdx + {stride} * d];"));
            e.close("}");
        }
    }

    /// Calls `body(e, d)` once per dimension, either unrolled or inside a loop.
    fn for_each_dim(&self, e: &mut Emitter, mut body: impl FnMut(&mut Emitter, &str)) {
        if self.unrolled() {
            for d in 0..self.dims {
                body(e, &d.to_string());
            }
        } else {
            e.open(format!("for (uint d = 0; d < {}; d++) {{", self.dims));
            body(e, "d");
            e.close("}");
        }
    }

    /// Subspace loop shared by both operators; `accumulate(e, slot, support)`
    /// emits the per-point update.
    fn emit_subspace_loop(
        &self,
        e: &mut Emitter,
        first: &str,
        last: &str,
        accumulate: impl Fn(&mut Emitter, &str, &str),
    ) {
        let t = self.real();
        let dims = self.dims;
        let one = self.lit("1.0");
        let zero = self.lit("0.0");

        e.open(format!("for (uint s = {first}; s < {last}; s++) {{"));
        e.line("const uint kind = ptrDescriptors[3 * s];");
        e.line("const uint start = ptrDescriptors[3 * s + 1];");
        e.line("const uint count = ptrDescriptors[3 * s + 2];");
        e.line(format!("const uint levelOffset = s * {dims};"));

        e.open("if (kind == 1) {");
        e.line("uint lin = 0;");
        e.line("int inside = 1;");
        e.line(format!("{t} support = {one};"));
        self.for_each_dim(e, |e, d| {
            let x = self.coord(d);
            e.open("{");
            e.line(format!("const {t} level = ptrLevels[levelOffset + {d}];"));
            e.line(format!("const {t} scaled = level * {x};"));
            e.line(format!("const uint idx = ((uint) floor(fmax(scaled, {zero}))) | 1u;"));
            e.line("const uint radix = ((uint) level) >> 1;");
            e.line(format!("inside &= ((idx >> 1) < radix) && (scaled >= {zero});"));
            e.line("lin = lin * radix + (idx >> 1);");
            e.line(format!("support *= fmax({one} - fabs(scaled - ({t}) idx), {zero});"));
            e.close("}");
        });
        e.open("if (inside && lin < count) {");
        accumulate(e, "start + lin", "support");
        e.close("}");
        e.close_open("} else {");
        e.open("for (uint p = start; p < start + count; p++) {");
        e.line(format!("{t} support = {one};"));
        self.for_each_dim(e, |e, d| {
            let x = self.coord(d);
            e.line(format!(
                "support *= fmax({one} - fabs(ptrLevels[levelOffset + {d}] * {x} - ptrIndices[p * {dims} + {d}]), {zero});"
            ));
        });
        accumulate(e, "p", "support");
        e.close("}");
        e.close("}");
        e.close("}");
    }

    fn emit_mult(&self, e: &mut Emitter) {
        let t = self.real();
        self.emit_signature(e, Operation::Mult);
        e.open("{");
        e.line("const uint globalIdx = get_global_id(0);");
        self.emit_load_point(e, "resultSize");
        e.line(format!("{t} res = {};", self.lit("0.0")));
        e.line("const uint lastSubspace = min(end_grid, numSubspaces);");
        self.emit_subspace_loop(e, "start_grid", "lastSubspace", |e, slot, support| {
            e.line(format!("res += {support} * ptrAlpha[{slot}];"));
        });
        e.line("ptrResult[globalIdx] = res;");
        e.close("}");
    }

    fn emit_transpose(&self, e: &mut Emitter) {
        let t = self.real();
        self.emit_signature(e, Operation::MultTranspose);
        e.open("{");
        e.line("const uint globalIdx = get_global_id(0);");
        e.open("if (globalIdx < start_data || globalIdx >= end_data) {");
        e.line("return;");
        e.close("}");
        self.emit_load_point(e, "sourceSize");
        e.line(format!("const {t} source = ptrSource[globalIdx];"));
        self.emit_subspace_loop(e, "0", "numSubspaces", |e, slot, support| {
            e.line(format!("atomicAddReal(&ptrResult[{slot}], {support} * source);"));
        });
        e.close("}");
    }
}
