use crate::backend::{GemmBackend, Transpose};
use crate::dtype::DType;
use crate::error::{Result, TensorError};
use crate::shape::Shape;
use crate::storage::CpuStorage;

/// A dense tensor backed by CPU storage.
///
/// Holds contiguous, row-major f32 data with an associated shape and dtype.
/// Matrix multiplication is dispatched to a `GemmBackend`.
#[derive(Debug, Clone)]
pub struct Tensor {
    storage: CpuStorage,
    shape: Shape,
    dtype: DType,
}

impl Tensor {
    /// Create a new tensor from f32 data and a shape.
    ///
    /// # Panics
    /// Panics if `data.len() != shape.numel()`.
    pub fn new(data: Vec<f32>, shape: Shape) -> Self {
        assert_eq!(
            data.len(),
            shape.numel(),
            "data length {} does not match shape {:?} (numel={})",
            data.len(),
            shape,
            shape.numel()
        );
        Tensor {
            storage: CpuStorage::from_f32_vec(data),
            shape,
            dtype: DType::F32,
        }
    }

    /// Create a zero-filled tensor with the given shape.
    pub fn zeros(shape: Shape) -> Self {
        let n = shape.numel();
        Tensor {
            storage: CpuStorage::from_f32_vec(vec![0.0; n]),
            shape,
            dtype: DType::F32,
        }
    }

    /// Create a tensor filled with ones with the given shape.
    pub fn ones(shape: Shape) -> Self {
        let n = shape.numel();
        Tensor {
            storage: CpuStorage::from_f32_vec(vec![1.0; n]),
            shape,
            dtype: DType::F32,
        }
    }

    /// Returns a reference to the tensor's shape.
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Total number of elements.
    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    /// Returns the tensor's data type.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Returns the underlying data as an f32 slice.
    ///
    /// # Panics
    /// Panics if the storage is not F32.
    pub fn data_f32(&self) -> &[f32] {
        self.storage
            .as_f32_slice()
            .expect("tensor storage is not F32")
    }

    /// Returns the underlying data as a mutable f32 slice.
    ///
    /// # Panics
    /// Panics if the storage is not F32.
    pub fn data_f32_mut(&mut self) -> &mut [f32] {
        self.storage
            .as_f32_slice_mut()
            .expect("tensor storage is not F32")
    }

    /// Overwrite every element with `value`.
    pub fn fill(&mut self, value: f32) {
        self.storage.fill(value);
    }

    /// Reshape the tensor, returning a new tensor with the same data but
    /// a different shape.
    ///
    /// The total number of elements must remain the same.
    pub fn reshape(&self, new_shape: Shape) -> Result<Tensor> {
        if self.shape.numel() != new_shape.numel() {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape.dims().to_vec(),
                got: new_shape.dims().to_vec(),
            });
        }
        Ok(Tensor {
            storage: self.storage.clone(),
            shape: new_shape,
            dtype: self.dtype,
        })
    }

    /// Borrow the elements covering rows `begin..end` of dimension 0.
    ///
    /// The returned slice shares storage with this tensor and holds
    /// `(end - begin) * dim0_stride` contiguous elements.
    pub fn slice_dim0(&self, begin: usize, end: usize) -> Result<&[f32]> {
        let (start, stop) = self.dim0_range(begin, end)?;
        Ok(&self.data_f32()[start..stop])
    }

    /// Mutable counterpart of `slice_dim0`.
    pub fn slice_dim0_mut(&mut self, begin: usize, end: usize) -> Result<&mut [f32]> {
        let (start, stop) = self.dim0_range(begin, end)?;
        Ok(&mut self.data_f32_mut()[start..stop])
    }

    fn dim0_range(&self, begin: usize, end: usize) -> Result<(usize, usize)> {
        if self.shape.ndim() == 0 {
            return Err(TensorError::SliceOutOfBounds { begin, end, len: 0 });
        }
        let len = self.shape.dim(0);
        if begin > end || end > len {
            return Err(TensorError::SliceOutOfBounds { begin, end, len });
        }
        let row = self.shape.dim0_stride();
        Ok((begin * row, end * row))
    }

    /// Matrix multiplication of two 2-D tensors through the given backend.
    ///
    /// self is [m, k], other is [k, n], result is [m, n]. Uses no transpose
    /// and unit scaling, so a CPU backend takes its contraction fast path.
    pub fn matmul(&self, other: &Tensor, backend: &dyn GemmBackend) -> Result<Tensor> {
        if self.shape.ndim() != 2 || other.shape.ndim() != 2 {
            return Err(TensorError::Other("matmul requires 2-d tensors".to_string()));
        }

        let m = self.shape.dim(0);
        let k = self.shape.dim(1);
        let k2 = other.shape.dim(0);
        let n = other.shape.dim(1);

        if k != k2 {
            return Err(TensorError::MatmulMismatch { m, k, k2, n });
        }

        let mut out = Tensor::zeros(Shape::new(vec![m, n]));
        backend.gemm(
            Transpose::No,
            Transpose::No,
            m,
            n,
            k,
            1.0,
            self.data_f32(),
            k,
            other.data_f32(),
            n,
            0.0,
            out.data_f32_mut(),
            n,
        )?;
        Ok(out)
    }

    /// Returns the underlying storage reference.
    pub fn storage(&self) -> &CpuStorage {
        &self.storage
    }
}
