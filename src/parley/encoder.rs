//! Text-to-vector encoding.
//!
//! The [`Encoder`] trait maps UTF-8 text to unit-length vectors of a
//! configuration-fixed dimension. Batch encoding preserves input order.
//! Implementations must be deterministic for identical input within a
//! process lifetime; the bundled [`HashingEncoder`] is deterministic across
//! process lifetimes as well.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::error::Error;
use std::fmt;

/// Errors surfaced by [`Encoder`] implementations.
#[derive(Debug)]
pub enum EncoderError {
    /// The upstream embedding model failed or is misconfigured. Fatal to
    /// the session; the caller does not retry.
    Model(String),
    /// An implementation produced a vector of the wrong dimension.
    Dimension { expected: usize, got: usize },
}

impl fmt::Display for EncoderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncoderError::Model(msg) => write!(f, "encoder model error: {}", msg),
            EncoderError::Dimension { expected, got } => {
                write!(f, "encoder dimension mismatch: expected {}, got {}", expected, got)
            }
        }
    }
}

impl Error for EncoderError {}

/// Maps text to fixed-dimension unit vectors.
///
/// Implementations are shared as `Arc<dyn Encoder>`. Synchronous encoders
/// are still exposed through async methods so that every model access in
/// the engine is a uniform suspension point.
#[async_trait]
pub trait Encoder: Send + Sync {
    /// The dimension of every vector this encoder produces.
    fn dimension(&self) -> usize;

    /// Encode one text into a unit-length vector of [`dimension`](Encoder::dimension)
    /// components. Empty or signal-free text yields the zero vector, which
    /// scores zero against everything.
    async fn encode(&self, text: &str) -> Result<Vec<f32>, EncoderError>;

    /// Encode a sequence of texts, yielding vectors in the same order.
    ///
    /// The default implementation encodes one at a time; batching
    /// implementations should override it.
    async fn encode_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EncoderError> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.encode(text).await?);
        }
        Ok(out)
    }
}

/// Deterministic feature-hashing encoder.
///
/// Tokenises on non-alphanumeric boundaries, lowercases, hashes each token
/// with SHA-256 to pick a bucket and a sign, accumulates, and L2-normalises.
/// No model, no I/O: suitable for tests, air-gapped deployments, and as the
/// reference implementation of the [`Encoder`] contract. Semantically naive
/// by construction; production deployments substitute an embedding-model
/// backed implementation behind the same trait.
///
/// # Example
///
/// ```rust
/// use parley::encoder::{Encoder, HashingEncoder};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let encoder = HashingEncoder::new(64);
/// let a = encoder.encode("project manager").await.unwrap();
/// let b = encoder.encode("project manager").await.unwrap();
/// assert_eq!(a, b);
/// assert_eq!(a.len(), 64);
/// let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
/// assert!((norm - 1.0).abs() < 1e-5);
/// # }
/// ```
pub struct HashingEncoder {
    dimension: usize,
}

impl HashingEncoder {
    /// Create an encoder producing vectors of the given dimension.
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    fn accumulate(&self, text: &str, acc: &mut [f32]) {
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let lowered = token.to_lowercase();
            let digest = Sha256::digest(lowered.as_bytes());
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&digest[..8]);
            let bucket = (u64::from_be_bytes(raw) % self.dimension as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            acc[bucket] += sign;
        }
    }
}

#[async_trait]
impl Encoder for HashingEncoder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn encode(&self, text: &str) -> Result<Vec<f32>, EncoderError> {
        let mut acc = vec![0.0f32; self.dimension];
        self.accumulate(text, &mut acc);
        let norm: f32 = acc.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut acc {
                *x /= norm;
            }
        }
        Ok(acc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn identical_input_identical_vector() {
        let encoder = HashingEncoder::new(32);
        let a = encoder.encode("machine learning engineer").await.unwrap();
        let b = encoder.encode("machine learning engineer").await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn batch_preserves_order() {
        let encoder = HashingEncoder::new(32);
        let texts = vec!["one".to_string(), "two".to_string(), "three".to_string()];
        let batch = encoder.encode_batch(&texts).await.unwrap();
        assert_eq!(batch.len(), 3);
        for (text, vec) in texts.iter().zip(&batch) {
            assert_eq!(vec, &encoder.encode(text).await.unwrap());
        }
    }

    #[tokio::test]
    async fn empty_text_is_zero_vector() {
        let encoder = HashingEncoder::new(16);
        let v = encoder.encode("").await.unwrap();
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[tokio::test]
    async fn tokenisation_is_case_and_punctuation_insensitive() {
        let encoder = HashingEncoder::new(64);
        let a = encoder.encode("Healthcare, Startup!").await.unwrap();
        let b = encoder.encode("healthcare startup").await.unwrap();
        assert_eq!(a, b);
    }
}
