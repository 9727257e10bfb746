//! Streaming rational resampling of a double-precision source.
//!
//! Implements polyphase FIR resampling with a Kaiser-windowed-sinc prototype
//! lowpass. Unlike a whole-signal resampler, [`Resampler`] keeps its filter
//! history across calls so a stream can be fed in arbitrary chunks; the
//! output of each call is exactly the set of output samples that became
//! computable with the new input.
//!
//! Resampling by the rational factor P/Q is equivalent to upsampling by P,
//! lowpass filtering at `min(1/P, 1/Q)` normalized frequency, and
//! downsampling by Q. The polyphase decomposition computes only the output
//! samples actually needed: for output sample `m`, the contributing input
//! frame is `n = floor(m·Q / P)` and the sub-filter phase is `k = (m·Q) mod P`.
//!
//! The Kaiser window is sized for ≥140 dB stopband rejection, i.e. beyond
//! 24-bit equivalence.
//!
//! Reference: P. P. Vaidyanathan, *Multirate Systems and Filter Banks*,
//! Prentice Hall, 1993, Section 4.3 (Polyphase Representation).

use libm::sin;

use core::f64::consts::PI;

/// Kaiser shape parameter for ~140 dB stopband attenuation
/// (`beta = 0.1102 · (A − 8.7)` with `A = 140`).
const KAISER_BETA: f64 = 14.47;

/// Prototype length per unit of the larger rate factor. 32 taps per phase
/// keeps the per-output cost constant regardless of the ratio.
const TAPS_PER_FACTOR: usize = 32;

/// Zeroth-order modified Bessel function of the first kind.
///
/// Plain power series; converges in well under 40 terms for the argument
/// range a Kaiser window uses.
fn bessel_i0(x: f64) -> f64 {
    let half = x / 2.0;
    let mut term = 1.0;
    let mut sum = 1.0;
    for k in 1..=40 {
        term *= (half / k as f64) * (half / k as f64);
        sum += term;
        if term < sum * 1e-18 {
            break;
        }
    }
    sum
}

/// Kaiser-windowed-sinc lowpass FIR, normalized to unity DC gain.
///
/// `cutoff` is normalized to the (upsampled) Nyquist frequency, range (0, 1).
fn design_lowpass(num_taps: usize, cutoff: f64) -> Vec<f64> {
    let m = (num_taps - 1) as f64;
    let denom = bessel_i0(KAISER_BETA);
    let mut coeffs = Vec::with_capacity(num_taps);

    for n in 0..num_taps {
        let x = n as f64 - m / 2.0;

        let sinc = if x.abs() < 1e-9 {
            cutoff
        } else {
            sin(PI * cutoff * x) / (PI * x)
        };

        let r = 2.0 * n as f64 / m - 1.0;
        let window = bessel_i0(KAISER_BETA * (1.0 - r * r).max(0.0).sqrt()) / denom;

        coeffs.push(sinc * window);
    }

    let sum: f64 = coeffs.iter().sum();
    if sum.abs() > 1e-12 {
        for c in &mut coeffs {
            *c /= sum;
        }
    }
    coeffs
}

fn gcd(mut a: usize, mut b: usize) -> usize {
    while b != 0 {
        let t = b;
        b = a % b;
        a = t;
    }
    a
}

/// Streaming rational resampler from `input_rate` to `output_rate`.
///
/// `process` may be called with chunks of any length; the concatenation of
/// all outputs equals the one-shot polyphase resampling of the concatenated
/// inputs. The filter introduces the usual linear-phase warm-up delay of half
/// the prototype length; [`Resampler::flush`] drains the tail.
#[derive(Debug, Clone)]
pub struct Resampler {
    /// Upsampling factor (reduced).
    p: usize,
    /// Downsampling factor (reduced).
    q: usize,
    taps_per_phase: usize,
    /// `polyphase[k][i] = prototype[k + i·P]`, zero-padded.
    polyphase: Vec<Vec<f64>>,
    /// Last `taps_per_phase − 1` input samples, oldest first.
    history: Vec<f64>,
    /// Total input samples consumed so far.
    consumed: u64,
    /// Index of the next output sample to produce.
    next_out: u64,
    work: Vec<f64>,
    out_buf: Vec<f64>,
}

impl Resampler {
    /// Create a resampler converting `input_rate` Hz to `output_rate` Hz.
    ///
    /// # Panics
    ///
    /// Panics if either rate is zero.
    pub fn new(input_rate: u32, output_rate: u32) -> Self {
        assert!(input_rate > 0 && output_rate > 0, "rates must be nonzero");

        let g = gcd(output_rate as usize, input_rate as usize);
        let p = output_rate as usize / g;
        let q = input_rate as usize / g;

        if p == 1 && q == 1 {
            // Identity ratio: no filter needed, process() short-circuits.
            return Self {
                p,
                q,
                taps_per_phase: 1,
                polyphase: Vec::new(),
                history: Vec::new(),
                consumed: 0,
                next_out: 0,
                work: Vec::new(),
                out_buf: Vec::new(),
            };
        }

        let num_taps = TAPS_PER_FACTOR * p.max(q);
        let cutoff = 0.9 / p.max(q) as f64;
        let prototype = design_lowpass(num_taps, cutoff);

        let taps_per_phase = num_taps.div_ceil(p);
        let mut polyphase = vec![vec![0.0f64; taps_per_phase]; p];
        for (tap_idx, &coeff) in prototype.iter().enumerate() {
            polyphase[tap_idx % p][tap_idx / p] = coeff;
        }

        Self {
            p,
            q,
            taps_per_phase,
            polyphase,
            history: vec![0.0; taps_per_phase - 1],
            consumed: 0,
            next_out: 0,
            work: Vec::new(),
            out_buf: Vec::new(),
        }
    }

    /// The reduced upsampling factor P.
    pub fn upsample_factor(&self) -> usize {
        self.p
    }

    /// The reduced downsampling factor Q.
    pub fn downsample_factor(&self) -> usize {
        self.q
    }

    /// Feed `input` and return the newly computable output samples.
    ///
    /// The returned slice is owned by the resampler and valid until the next
    /// call.
    pub fn process(&mut self, input: &[f64]) -> &[f64] {
        if self.p == 1 && self.q == 1 {
            self.out_buf.clear();
            self.out_buf.extend_from_slice(input);
            return &self.out_buf;
        }

        self.out_buf.clear();

        // Assemble the window of reachable input: retained history followed
        // by the fresh chunk. `base` is the global index of work[0].
        let hist_len = self.history.len() as u64;
        let base = self.consumed as i64 - hist_len as i64;
        self.work.clear();
        self.work.extend_from_slice(&self.history);
        self.work.extend_from_slice(input);

        let total = self.consumed + input.len() as u64;

        loop {
            let full = self.next_out * self.q as u64;
            let n = (full / self.p as u64) as i64;
            if n >= total as i64 {
                break;
            }
            let k = (full % self.p as u64) as usize;

            let mut acc = 0.0f64;
            for (i, &coeff) in self.polyphase[k].iter().enumerate() {
                let g = n - i as i64;
                if g < base {
                    break; // leading zeros of the stream
                }
                acc += coeff * self.work[(g - base) as usize];
            }
            self.out_buf.push(acc * self.p as f64);
            self.next_out += 1;
        }

        // Retain the newest taps_per_phase − 1 samples as history.
        let keep = self.taps_per_phase - 1;
        let len = self.work.len();
        if len >= keep {
            self.history.clear();
            self.history.extend_from_slice(&self.work[len - keep..]);
        }
        self.consumed = total;

        &self.out_buf
    }

    /// Push enough silence through the filter to drain the tail of the
    /// stream, returning the final output samples.
    pub fn flush(&mut self) -> &[f64] {
        if self.p == 1 && self.q == 1 {
            self.out_buf.clear();
            return &self.out_buf;
        }
        let zeros = vec![0.0f64; self.taps_per_phase * self.q.div_ceil(self.p).max(1)];
        self.process(&zeros)
    }
}
