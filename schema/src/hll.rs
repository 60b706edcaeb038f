//! Dense hyperloglog sketch used by the `hyperloglog(p)` measure.

/// Cardinality sketch with `2^precision` one-byte registers.
///
/// Two sketches of the same precision merge by elementwise register max,
/// which is associative, commutative and idempotent. Callers comparing
/// aggregates across differently-grouped merges should compare estimates
/// within [`standard_error`](Self::standard_error), not register bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HllSketch {
    precision: u8,
    registers: Vec<u8>,
}

/// Inclusive bounds on sketch precision.
pub const HLL_MIN_PRECISION: u8 = 4;
/// Inclusive bounds on sketch precision.
pub const HLL_MAX_PRECISION: u8 = 16;

impl HllSketch {
    /// Create an empty sketch. `precision` must lie in
    /// `[HLL_MIN_PRECISION, HLL_MAX_PRECISION]`.
    pub fn new(precision: u8) -> Self {
        assert!(
            (HLL_MIN_PRECISION..=HLL_MAX_PRECISION).contains(&precision),
            "hll precision {} out of range",
            precision
        );
        Self {
            precision,
            registers: vec![0; 1 << precision],
        }
    }

    /// Reassemble a sketch from its stored parts.
    pub fn from_parts(precision: u8, registers: Vec<u8>) -> Self {
        assert_eq!(registers.len(), 1 << precision, "register count mismatch");
        Self {
            precision,
            registers,
        }
    }

    /// Sketch precision.
    pub fn precision(&self) -> u8 {
        self.precision
    }

    /// The raw register array, `2^precision` bytes.
    pub fn registers(&self) -> &[u8] {
        &self.registers
    }

    /// Record one hashed element.
    pub fn insert_hash(&mut self, hash: u64) {
        let index = (hash >> (64 - self.precision)) as usize;
        let remainder = hash << self.precision;
        // rank = position of the first set bit in the remaining stream
        let rank = (remainder.leading_zeros() as u8).min(64 - self.precision) + 1;
        if rank > self.registers[index] {
            self.registers[index] = rank;
        }
    }

    /// Merge `other` into `self`. Both sketches must share a precision.
    pub fn merge(&mut self, other: &Self) {
        assert_eq!(
            self.precision, other.precision,
            "cannot merge sketches of different precision"
        );
        for (mine, theirs) in self.registers.iter_mut().zip(other.registers.iter()) {
            if *theirs > *mine {
                *mine = *theirs;
            }
        }
    }

    /// Estimated cardinality with bias and small-range corrections.
    pub fn estimate(&self) -> f64 {
        let m = self.registers.len() as f64;
        let alpha = match self.registers.len() {
            16 => 0.673,
            32 => 0.697,
            64 => 0.709,
            n => 0.7213 / (1.0 + 1.079 / n as f64),
        };

        let sum: f64 = self
            .registers
            .iter()
            .map(|&r| 2.0_f64.powi(-i32::from(r)))
            .sum();
        let raw = alpha * m * m / sum;

        if raw <= 2.5 * m {
            let zeros = self.registers.iter().filter(|&&r| r == 0).count();
            if zeros > 0 {
                // linear counting regime
                return m * (m / zeros as f64).ln();
            }
        }
        raw
    }

    /// Relative standard error for this precision, `1.04 / sqrt(2^p)`.
    pub fn standard_error(&self) -> f64 {
        1.04 / (self.registers.len() as f64).sqrt()
    }
}
