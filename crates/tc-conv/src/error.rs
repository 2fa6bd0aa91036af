use thiserror::Error;

#[derive(Error, Debug)]
pub enum OpError {
    #[error("expected a {expected}-d tensor for {name}, got {got} dimensions")]
    BadRank {
        name: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("{name} shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        name: &'static str,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("{name} buffer holds {got} elements, expected {expected}")]
    BufferSize {
        name: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("invalid convolution parameters: {0}")]
    BadParams(String),
    #[error("tensor error: {0}")]
    Tensor(#[from] tc_tensor::TensorError),
    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, OpError>;
