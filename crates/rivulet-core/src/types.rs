//! Element types and local buffer storage.
//!
//! A [`Buffer`] is the physical, per-rank storage unit of the engine: a flat, row-major,
//! dtype-tagged vector of elements. Logical tensors never own buffers directly — buffers live in
//! the execution graph's value slots, one per rank of the owning placement — but every kernel and
//! every collective primitive ultimately reads and writes `Buffer`s.
//!
//! The helpers in this module (`slice_axis`, `concat_axis`, `add`) are the shared element-level
//! machinery behind both the reference kernels and the in-process collective backend.

use std::fmt::Display;

use half::{bf16, f16};
use num_traits::Zero;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Error type for element-level buffer operations.
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum BufferError {
    /// Error returned when two buffers that must share a dtype do not.
    #[error("buffer dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch { expected: DType, got: DType },

    /// Error returned when two buffers that must share a length do not.
    #[error("buffer length mismatch: expected {expected} element(s), got {got}")]
    LengthMismatch { expected: usize, got: usize },

    /// Error returned when an operation does not support the buffer's dtype.
    #[error("operation '{operation}' does not support dtype {dtype}")]
    UnsupportedDType { operation: &'static str, dtype: DType },

    /// Error returned when a buffer's length does not match the shape it is paired with.
    #[error("buffer holds {len} element(s) but shape {shape:?} implies {expected}")]
    ShapeLengthMismatch { len: usize, expected: usize, shape: Vec<usize> },

    /// Error returned when an axis index is out of range for a shape.
    #[error("axis {axis} is out of range for shape {shape:?}")]
    AxisOutOfRange { axis: usize, shape: Vec<usize> },

    /// Error returned when a slice range is invalid for the extent of an axis.
    #[error("slice [{start}, {end}) is invalid for axis extent {extent}")]
    InvalidSliceRange { start: usize, end: usize, extent: usize },
}

// ---------------------------------------------------------------------------
// DType
// ---------------------------------------------------------------------------

/// Element type of a tensor.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DType {
    F32,
    F64,
    F16,
    BF16,
    I32,
    I64,
    Bool,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F32 | DType::I32 => 4,
            DType::F64 | DType::I64 => 8,
            DType::F16 | DType::BF16 => 2,
            DType::Bool => 1,
        }
    }

    /// Returns `true` iff this is a floating-point dtype.
    pub fn is_float(&self) -> bool {
        matches!(self, DType::F32 | DType::F64 | DType::F16 | DType::BF16)
    }
}

impl Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::F16 => "f16",
            DType::BF16 => "bf16",
            DType::I32 => "i32",
            DType::I64 => "i64",
            DType::Bool => "bool",
        };
        write!(f, "{name}")
    }
}

// ---------------------------------------------------------------------------
// Buffer
// ---------------------------------------------------------------------------

/// Flat, row-major, dtype-tagged element storage for one rank-local shard.
#[derive(Clone, Debug, PartialEq)]
pub enum Buffer {
    F32(Vec<f32>),
    F64(Vec<f64>),
    F16(Vec<f16>),
    BF16(Vec<bf16>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    Bool(Vec<bool>),
}

/// Applies `$body` to the element vector of one numeric buffer.
macro_rules! map_numeric {
    ($operation:literal, $buffer:expr, |$a:ident| $body:expr) => {
        match $buffer {
            Buffer::F32($a) => Ok(Buffer::F32($body)),
            Buffer::F64($a) => Ok(Buffer::F64($body)),
            Buffer::F16($a) => Ok(Buffer::F16($body)),
            Buffer::BF16($a) => Ok(Buffer::BF16($body)),
            Buffer::I32($a) => Ok(Buffer::I32($body)),
            Buffer::I64($a) => Ok(Buffer::I64($body)),
            Buffer::Bool(_) => Err(BufferError::UnsupportedDType { operation: $operation, dtype: DType::Bool }),
        }
    };
}

/// Applies `$body` to the element vectors of two same-dtype numeric buffers.
macro_rules! zip_numeric {
    ($operation:literal, $lhs:expr, $rhs:expr, |$a:ident, $b:ident| $body:expr) => {
        match ($lhs, $rhs) {
            (Buffer::F32($a), Buffer::F32($b)) => Ok(Buffer::F32($body)),
            (Buffer::F64($a), Buffer::F64($b)) => Ok(Buffer::F64($body)),
            (Buffer::F16($a), Buffer::F16($b)) => Ok(Buffer::F16($body)),
            (Buffer::BF16($a), Buffer::BF16($b)) => Ok(Buffer::BF16($body)),
            (Buffer::I32($a), Buffer::I32($b)) => Ok(Buffer::I32($body)),
            (Buffer::I64($a), Buffer::I64($b)) => Ok(Buffer::I64($body)),
            (Buffer::Bool(_), _) | (_, Buffer::Bool(_)) => {
                Err(BufferError::UnsupportedDType { operation: $operation, dtype: DType::Bool })
            }
            (lhs, rhs) => Err(BufferError::DTypeMismatch { expected: lhs.dtype(), got: rhs.dtype() }),
        }
    };
}

/// Returns `T::zero()` with the element type pinned to `_value`'s; exists only to guide type
/// inference inside the numeric macro bodies.
fn zero_like<T: Zero>(_value: &T) -> T {
    T::zero()
}

impl Buffer {
    /// Creates a zero-filled buffer of `len` elements.
    pub fn zeros(dtype: DType, len: usize) -> Self {
        match dtype {
            DType::F32 => Buffer::F32(vec![0.0; len]),
            DType::F64 => Buffer::F64(vec![0.0; len]),
            DType::F16 => Buffer::F16(vec![f16::ZERO; len]),
            DType::BF16 => Buffer::BF16(vec![bf16::ZERO; len]),
            DType::I32 => Buffer::I32(vec![0; len]),
            DType::I64 => Buffer::I64(vec![0; len]),
            DType::Bool => Buffer::Bool(vec![false; len]),
        }
    }

    /// Creates a one-filled numeric buffer of `len` elements.
    pub fn ones(dtype: DType, len: usize) -> Result<Self, BufferError> {
        Ok(match dtype {
            DType::F32 => Buffer::F32(vec![1.0; len]),
            DType::F64 => Buffer::F64(vec![1.0; len]),
            DType::F16 => Buffer::F16(vec![f16::ONE; len]),
            DType::BF16 => Buffer::BF16(vec![bf16::ONE; len]),
            DType::I32 => Buffer::I32(vec![1; len]),
            DType::I64 => Buffer::I64(vec![1; len]),
            DType::Bool => return Err(BufferError::UnsupportedDType { operation: "ones", dtype: DType::Bool }),
        })
    }

    /// The dtype of this buffer's elements.
    pub fn dtype(&self) -> DType {
        match self {
            Buffer::F32(_) => DType::F32,
            Buffer::F64(_) => DType::F64,
            Buffer::F16(_) => DType::F16,
            Buffer::BF16(_) => DType::BF16,
            Buffer::I32(_) => DType::I32,
            Buffer::I64(_) => DType::I64,
            Buffer::Bool(_) => DType::Bool,
        }
    }

    /// Number of elements in this buffer.
    pub fn len(&self) -> usize {
        match self {
            Buffer::F32(elements) => elements.len(),
            Buffer::F64(elements) => elements.len(),
            Buffer::F16(elements) => elements.len(),
            Buffer::BF16(elements) => elements.len(),
            Buffer::I32(elements) => elements.len(),
            Buffer::I64(elements) => elements.len(),
            Buffer::Bool(elements) => elements.len(),
        }
    }

    /// Returns `true` iff this buffer holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads the single element of a scalar buffer as `f64`, if this is a one-element numeric
    /// buffer.
    pub fn scalar_f64(&self) -> Option<f64> {
        if self.len() != 1 {
            return None;
        }
        match self {
            Buffer::F32(elements) => Some(f64::from(elements[0])),
            Buffer::F64(elements) => Some(elements[0]),
            Buffer::F16(elements) => Some(f64::from(elements[0])),
            Buffer::BF16(elements) => Some(f64::from(elements[0])),
            Buffer::I32(elements) => Some(f64::from(elements[0])),
            Buffer::I64(elements) => Some(elements[0] as f64),
            Buffer::Bool(_) => None,
        }
    }

    /// Elementwise sum of two same-dtype, same-length numeric buffers.
    pub fn add(&self, other: &Buffer) -> Result<Buffer, BufferError> {
        if self.len() != other.len() {
            return Err(BufferError::LengthMismatch { expected: self.len(), got: other.len() });
        }
        zip_numeric!("add", self, other, |a, b| a.iter().zip(b.iter()).map(|(x, y)| *x + *y).collect())
    }

    /// Elementwise difference of two same-dtype, same-length numeric buffers.
    pub fn sub(&self, other: &Buffer) -> Result<Buffer, BufferError> {
        if self.len() != other.len() {
            return Err(BufferError::LengthMismatch { expected: self.len(), got: other.len() });
        }
        zip_numeric!("sub", self, other, |a, b| a.iter().zip(b.iter()).map(|(x, y)| *x - *y).collect())
    }

    /// Elementwise product of two same-dtype, same-length numeric buffers.
    pub fn mul(&self, other: &Buffer) -> Result<Buffer, BufferError> {
        if self.len() != other.len() {
            return Err(BufferError::LengthMismatch { expected: self.len(), got: other.len() });
        }
        zip_numeric!("mul", self, other, |a, b| a.iter().zip(b.iter()).map(|(x, y)| *x * *y).collect())
    }

    /// Elementwise negation of a numeric buffer.
    pub fn neg(&self) -> Result<Buffer, BufferError> {
        map_numeric!("neg", self, |a| a.iter().map(|x| zero_like(x) - *x).collect())
    }

    /// Elementwise `max(x, 0)` of a numeric buffer.
    pub fn relu(&self) -> Result<Buffer, BufferError> {
        map_numeric!("relu", self, |a| a
            .iter()
            .map(|x| if *x > Zero::zero() { *x } else { Zero::zero() })
            .collect())
    }

    /// Masks `self` (a gradient) by the positivity of `activation`: passes elements where the
    /// matching activation input was positive, zeroes the rest.
    pub fn relu_mask(&self, activation: &Buffer) -> Result<Buffer, BufferError> {
        if self.len() != activation.len() {
            return Err(BufferError::LengthMismatch { expected: self.len(), got: activation.len() });
        }
        zip_numeric!("relu_mask", self, activation, |a, b| a
            .iter()
            .zip(b.iter())
            .map(|(g, x)| if *x > Zero::zero() { *g } else { Zero::zero() })
            .collect())
    }

    /// Sums every element of a numeric buffer into a one-element buffer of the same dtype.
    pub fn sum_all(&self) -> Result<Buffer, BufferError> {
        map_numeric!("sum_all", self, |a| {
            let mut total = Zero::zero();
            for x in a.iter() {
                total = total + *x;
            }
            vec![total]
        })
    }

    /// Row-major matrix product of an `[m, k]` buffer with a `[k, n]` buffer.
    pub fn matmul(&self, other: &Buffer, m: usize, k: usize, n: usize) -> Result<Buffer, BufferError> {
        if self.len() != m * k {
            return Err(BufferError::ShapeLengthMismatch { len: self.len(), expected: m * k, shape: vec![m, k] });
        }
        if other.len() != k * n {
            return Err(BufferError::ShapeLengthMismatch { len: other.len(), expected: k * n, shape: vec![k, n] });
        }
        zip_numeric!("matmul", self, other, |a, b| {
            let mut out = vec![Zero::zero(); m * n];
            for row in 0..m {
                for inner in 0..k {
                    let lhs = a[row * k + inner];
                    for col in 0..n {
                        out[row * n + col] = out[row * n + col] + lhs * b[inner * n + col];
                    }
                }
            }
            out
        })
    }

    /// Transposes a `[rows, cols]` buffer into `[cols, rows]`.
    pub fn transpose_2d(&self, rows: usize, cols: usize) -> Result<Buffer, BufferError> {
        if self.len() != rows * cols {
            return Err(BufferError::ShapeLengthMismatch {
                len: self.len(),
                expected: rows * cols,
                shape: vec![rows, cols],
            });
        }
        macro_rules! transpose_block {
            ($elements:expr) => {{
                let elements = $elements;
                let mut out = Vec::with_capacity(rows * cols);
                for col in 0..cols {
                    for row in 0..rows {
                        out.push(elements[row * cols + col]);
                    }
                }
                out
            }};
        }
        Ok(match self {
            Buffer::F32(elements) => Buffer::F32(transpose_block!(elements)),
            Buffer::F64(elements) => Buffer::F64(transpose_block!(elements)),
            Buffer::F16(elements) => Buffer::F16(transpose_block!(elements)),
            Buffer::BF16(elements) => Buffer::BF16(transpose_block!(elements)),
            Buffer::I32(elements) => Buffer::I32(transpose_block!(elements)),
            Buffer::I64(elements) => Buffer::I64(transpose_block!(elements)),
            Buffer::Bool(elements) => Buffer::Bool(transpose_block!(elements)),
        })
    }

    /// Broadcasts a buffer laid out with `from` to the larger shape `to`.
    ///
    /// Shapes align right; every `from` axis must either match the `to` axis or have extent 1.
    pub fn broadcast_to(&self, from: &[usize], to: &[usize]) -> Result<Buffer, BufferError> {
        let expected = from.iter().product::<usize>();
        if self.len() != expected {
            return Err(BufferError::ShapeLengthMismatch { len: self.len(), expected, shape: from.to_vec() });
        }
        if from.len() > to.len() {
            return Err(BufferError::ShapeLengthMismatch {
                len: self.len(),
                expected: to.iter().product(),
                shape: to.to_vec(),
            });
        }
        let offset = to.len() - from.len();
        for (axis, extent) in from.iter().enumerate() {
            if *extent != 1 && *extent != to[offset + axis] {
                return Err(BufferError::InvalidSliceRange { start: 0, end: *extent, extent: to[offset + axis] });
            }
        }

        // Map every output index back to its source element through the right-aligned strides,
        // with stride 0 on broadcast axes.
        let mut strides = vec![0usize; to.len()];
        let mut running = 1usize;
        for axis in (0..from.len()).rev() {
            if from[axis] != 1 {
                strides[offset + axis] = running;
            }
            running *= from[axis];
        }
        let total = to.iter().product::<usize>();
        let mut source_indices = Vec::with_capacity(total);
        for mut index in 0..total {
            let mut source = 0usize;
            for axis in (0..to.len()).rev() {
                let coordinate = index % to[axis];
                index /= to[axis];
                source += coordinate * strides[axis];
            }
            source_indices.push(source);
        }
        macro_rules! gather_block {
            ($elements:expr) => {{
                let elements = $elements;
                source_indices.iter().map(|source| elements[*source]).collect()
            }};
        }
        Ok(match self {
            Buffer::F32(elements) => Buffer::F32(gather_block!(elements)),
            Buffer::F64(elements) => Buffer::F64(gather_block!(elements)),
            Buffer::F16(elements) => Buffer::F16(gather_block!(elements)),
            Buffer::BF16(elements) => Buffer::BF16(gather_block!(elements)),
            Buffer::I32(elements) => Buffer::I32(gather_block!(elements)),
            Buffer::I64(elements) => Buffer::I64(gather_block!(elements)),
            Buffer::Bool(elements) => Buffer::Bool(gather_block!(elements)),
        })
    }

    /// Extracts the `[start, end)` range along `axis` of a buffer laid out with `shape`.
    pub fn slice_axis(&self, shape: &[usize], axis: usize, start: usize, end: usize) -> Result<Buffer, BufferError> {
        let expected = shape.iter().product::<usize>();
        if self.len() != expected {
            return Err(BufferError::ShapeLengthMismatch { len: self.len(), expected, shape: shape.to_vec() });
        }
        if axis >= shape.len() {
            return Err(BufferError::AxisOutOfRange { axis, shape: shape.to_vec() });
        }
        let extent = shape[axis];
        if start > end || end > extent {
            return Err(BufferError::InvalidSliceRange { start, end, extent });
        }

        // Row-major layout decomposes as [outer, extent, inner] around `axis`, so a slice is a
        // strided copy of `outer` contiguous runs of `(end - start) * inner` elements.
        let outer = shape[..axis].iter().product::<usize>();
        let inner = shape[axis + 1..].iter().product::<usize>();
        macro_rules! slice_block {
            ($elements:expr) => {{
                let elements = $elements;
                let mut sliced = Vec::with_capacity(outer * (end - start) * inner);
                for outer_index in 0..outer {
                    let row = outer_index * extent * inner;
                    sliced.extend_from_slice(&elements[row + start * inner..row + end * inner]);
                }
                sliced
            }};
        }
        Ok(match self {
            Buffer::F32(elements) => Buffer::F32(slice_block!(elements)),
            Buffer::F64(elements) => Buffer::F64(slice_block!(elements)),
            Buffer::F16(elements) => Buffer::F16(slice_block!(elements)),
            Buffer::BF16(elements) => Buffer::BF16(slice_block!(elements)),
            Buffer::I32(elements) => Buffer::I32(slice_block!(elements)),
            Buffer::I64(elements) => Buffer::I64(slice_block!(elements)),
            Buffer::Bool(elements) => Buffer::Bool(slice_block!(elements)),
        })
    }

    /// Concatenates `parts` (each laid out with the matching entry of `shapes`) along `axis`.
    ///
    /// All parts must share a dtype, and their shapes must agree on every axis except `axis`.
    pub fn concat_axis(parts: &[&Buffer], shapes: &[&[usize]], axis: usize) -> Result<Buffer, BufferError> {
        debug_assert_eq!(parts.len(), shapes.len());
        debug_assert!(!parts.is_empty());

        let dtype = parts[0].dtype();
        for part in parts.iter().skip(1) {
            if part.dtype() != dtype {
                return Err(BufferError::DTypeMismatch { expected: dtype, got: part.dtype() });
            }
        }
        for (part, shape) in parts.iter().zip(shapes.iter()) {
            let expected = shape.iter().product::<usize>();
            if part.len() != expected {
                return Err(BufferError::ShapeLengthMismatch { len: part.len(), expected, shape: shape.to_vec() });
            }
            if axis >= shape.len() {
                return Err(BufferError::AxisOutOfRange { axis, shape: shape.to_vec() });
            }
        }

        let outer = shapes[0][..axis].iter().product::<usize>();
        let inner = shapes[0][axis + 1..].iter().product::<usize>();
        let total_extent = shapes.iter().map(|shape| shape[axis]).sum::<usize>();
        let mut result = Buffer::zeros(dtype, outer * total_extent * inner);

        let mut offset = 0;
        for (part, shape) in parts.iter().zip(shapes.iter()) {
            let extent = shape[axis];
            copy_axis_block(&mut result, part, outer, total_extent, extent, inner, offset)?;
            offset += extent;
        }
        Ok(result)
    }
}

/// Copies one concatenation block into `result` at `offset` along the concatenation axis.
fn copy_axis_block(
    result: &mut Buffer,
    part: &Buffer,
    outer: usize,
    total_extent: usize,
    extent: usize,
    inner: usize,
    offset: usize,
) -> Result<(), BufferError> {
    macro_rules! copy_block {
        ($dst:expr, $src:expr) => {{
            for outer_index in 0..outer {
                let dst_row = outer_index * total_extent * inner + offset * inner;
                let src_row = outer_index * extent * inner;
                $dst[dst_row..dst_row + extent * inner].copy_from_slice(&$src[src_row..src_row + extent * inner]);
            }
            Ok(())
        }};
    }
    match (result, part) {
        (Buffer::F32(dst), Buffer::F32(src)) => copy_block!(dst, src),
        (Buffer::F64(dst), Buffer::F64(src)) => copy_block!(dst, src),
        (Buffer::F16(dst), Buffer::F16(src)) => copy_block!(dst, src),
        (Buffer::BF16(dst), Buffer::BF16(src)) => copy_block!(dst, src),
        (Buffer::I32(dst), Buffer::I32(src)) => copy_block!(dst, src),
        (Buffer::I64(dst), Buffer::I64(src)) => copy_block!(dst, src),
        (Buffer::Bool(dst), Buffer::Bool(src)) => copy_block!(dst, src),
        (result, part) => Err(BufferError::DTypeMismatch { expected: result.dtype(), got: part.dtype() }),
    }
}

/// Elementwise sum of a non-empty group of same-dtype, same-length buffers.
pub fn sum_buffers(buffers: &[&Buffer]) -> Result<Buffer, BufferError> {
    debug_assert!(!buffers.is_empty());
    let mut total = buffers[0].clone();
    for buffer in buffers.iter().skip(1) {
        total = total.add(buffer)?;
    }
    Ok(total)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slice_axis_rows() {
        let buffer = Buffer::F32(vec![1.0, 1.0, 1.0, 2.0, 2.0, 2.0, 3.0, 3.0, 3.0, 4.0, 4.0, 4.0]);
        let sliced = buffer.slice_axis(&[4, 3], 0, 1, 3).unwrap();
        assert_eq!(sliced, Buffer::F32(vec![2.0, 2.0, 2.0, 3.0, 3.0, 3.0]));
    }

    #[test]
    fn test_slice_axis_columns() {
        let buffer = Buffer::F32(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let sliced = buffer.slice_axis(&[2, 3], 1, 0, 2).unwrap();
        assert_eq!(sliced, Buffer::F32(vec![1.0, 2.0, 4.0, 5.0]));
    }

    #[test]
    fn test_concat_axis_inverts_slice() {
        let full = Buffer::F32(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let left = full.slice_axis(&[2, 3], 1, 0, 1).unwrap();
        let right = full.slice_axis(&[2, 3], 1, 1, 3).unwrap();
        let rejoined = Buffer::concat_axis(&[&left, &right], &[&[2, 1], &[2, 2]], 1).unwrap();
        assert_eq!(rejoined, full);
    }

    #[test]
    fn test_add_checks_dtype_and_length() {
        let lhs = Buffer::F32(vec![1.0, 2.0]);
        assert!(matches!(
            lhs.add(&Buffer::F64(vec![1.0, 2.0])),
            Err(BufferError::DTypeMismatch { .. }),
        ));
        assert!(matches!(lhs.add(&Buffer::F32(vec![1.0])), Err(BufferError::LengthMismatch { .. })));
        assert_eq!(lhs.add(&Buffer::F32(vec![3.0, 4.0])).unwrap(), Buffer::F32(vec![4.0, 6.0]));
    }

    #[test]
    fn test_unary_element_ops() {
        let buffer = Buffer::F32(vec![-1.0, 0.0, 2.0]);
        assert_eq!(buffer.neg().unwrap(), Buffer::F32(vec![1.0, 0.0, -2.0]));
        assert_eq!(buffer.relu().unwrap(), Buffer::F32(vec![0.0, 0.0, 2.0]));
        assert_eq!(buffer.sum_all().unwrap(), Buffer::F32(vec![1.0]));
        assert!(matches!(
            Buffer::Bool(vec![true]).neg(),
            Err(BufferError::UnsupportedDType { operation: "neg", .. }),
        ));
    }

    #[test]
    fn test_relu_mask_gates_gradient() {
        let grad = Buffer::F32(vec![5.0, 6.0, 7.0]);
        let activation = Buffer::F32(vec![-1.0, 0.0, 2.0]);
        assert_eq!(grad.relu_mask(&activation).unwrap(), Buffer::F32(vec![0.0, 0.0, 7.0]));
    }

    #[test]
    fn test_matmul_2x2() {
        let lhs = Buffer::F32(vec![1.0, 2.0, 3.0, 4.0]);
        let rhs = Buffer::F32(vec![5.0, 6.0, 7.0, 8.0]);
        assert_eq!(lhs.matmul(&rhs, 2, 2, 2).unwrap(), Buffer::F32(vec![19.0, 22.0, 43.0, 50.0]));
    }

    #[test]
    fn test_transpose_2d() {
        let buffer = Buffer::F32(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(
            buffer.transpose_2d(2, 3).unwrap(),
            Buffer::F32(vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]),
        );
    }

    #[test]
    fn test_broadcast_to() {
        let scalar = Buffer::F32(vec![3.0]);
        assert_eq!(
            scalar.broadcast_to(&[], &[2, 2]).unwrap(),
            Buffer::F32(vec![3.0, 3.0, 3.0, 3.0]),
        );
        let row = Buffer::F32(vec![1.0, 2.0]);
        assert_eq!(
            row.broadcast_to(&[1, 2], &[2, 2]).unwrap(),
            Buffer::F32(vec![1.0, 2.0, 1.0, 2.0]),
        );
        assert!(row.broadcast_to(&[2], &[3]).is_err());
    }
}
