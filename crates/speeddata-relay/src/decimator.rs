//! Rate reduction for the decimated multicast stream.

use speeddata_core::DecimationAlgorithm;
use tracing::info;

/// Fixed-size window decimator.
///
/// Collects `factor` consecutive payloads, then emits one representative and
/// starts over. Payloads are opaque bytes, so every algorithm picks the most
/// recent payload of the window.
#[derive(Debug)]
pub struct Decimator {
    factor: usize,
    algorithm: DecimationAlgorithm,
    window: Vec<Vec<u8>>,
}

impl Decimator {
    /// A `factor` of 0 or 1 lets every payload through.
    pub fn new(factor: u32, algorithm: DecimationAlgorithm) -> Self {
        let factor = usize::try_from(factor).unwrap_or(usize::MAX).max(1);
        if algorithm != DecimationAlgorithm::Downsample {
            info!(
                %algorithm,
                "Payloads are opaque; decimation emits the most recent payload per window"
            );
        }
        Self {
            factor,
            algorithm,
            window: Vec::with_capacity(factor.min(1024)),
        }
    }

    pub const fn factor(&self) -> usize {
        self.factor
    }

    pub const fn algorithm(&self) -> DecimationAlgorithm {
        self.algorithm
    }

    /// Payloads held in the current window.
    pub fn pending(&self) -> usize {
        self.window.len()
    }

    /// Feed one payload; returns the representative when the window fills.
    pub fn push(&mut self, payload: &[u8]) -> Option<Vec<u8>> {
        if self.factor == 1 {
            return Some(payload.to_vec());
        }

        self.window.push(payload.to_vec());
        if self.window.len() < self.factor {
            return None;
        }

        let representative = self.representative();
        self.window.clear();
        representative
    }

    fn representative(&mut self) -> Option<Vec<u8>> {
        match self.algorithm {
            DecimationAlgorithm::Downsample
            | DecimationAlgorithm::Average
            | DecimationAlgorithm::MinMax
            | DecimationAlgorithm::Rms => self.window.pop(),
        }
    }
}
