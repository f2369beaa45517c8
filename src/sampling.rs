//! Quasi-random design samplers for mask construction
//!
//! Sobol-designed masking draws its base design matrix from a low-discrepancy
//! sequence. Three samplers are available: a digitally-shifted Sobol sequence
//! built from programmatically-generated primitive polynomials over GF(2), a
//! Halton sequence with Cranley-Patterson rotation, and seeded Latin-hypercube
//! sampling. All three are deterministic under a fixed seed.
//!
//! ## Sobol construction
//!
//! Dimension 0 is the base-2 van der Corput sequence. Dimension `d >= 1` uses
//! the `d`-th primitive polynomial (ascending by binary encoding), direction
//! numbers initialized to odd value 1 and extended with the Bratley-Fox
//! recurrence, and gray-code point generation. The seed drives one random
//! digital shift per dimension, which preserves base-2 equidistribution.

use anyhow::{ensure, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

const SOBOL_BITS: usize = 32;

/// Low-discrepancy sampler selection for the Sobol mask design.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceSampler {
    Sobol,
    Halton,
    LatinHypercube,
}

impl Default for SequenceSampler {
    fn default() -> Self {
        SequenceSampler::Sobol
    }
}

impl SequenceSampler {
    /// Draw `rows` points in `[0, 1)^dims`, deterministic under `seed`.
    pub fn sample(&self, rows: usize, dims: usize, seed: u64) -> Result<Vec<Vec<f32>>> {
        ensure!(rows > 0, "sampler needs at least one row");
        ensure!(dims > 0, "sampler needs at least one dimension");
        match self {
            SequenceSampler::Sobol => sample_sobol(rows, dims, seed),
            SequenceSampler::Halton => Ok(sample_halton(rows, dims, seed)),
            SequenceSampler::LatinHypercube => Ok(sample_latin_hypercube(rows, dims, seed)),
        }
    }
}

/// Reduce a polynomial over GF(2) modulo another.
fn gf2_mod(mut a: u64, modulus: u64) -> u64 {
    let deg_m = 63 - modulus.leading_zeros();
    while a != 0 {
        let deg_a = 63 - a.leading_zeros();
        if deg_a < deg_m {
            break;
        }
        a ^= modulus << (deg_a - deg_m);
    }
    a
}

/// Multiply two polynomials over GF(2) modulo `modulus`.
fn gf2_mul_mod(a: u64, b: u64, modulus: u64) -> u64 {
    let deg_m = 63 - modulus.leading_zeros();
    let mut a = gf2_mod(a, modulus);
    let mut b = gf2_mod(b, modulus);
    let mut result = 0u64;
    while b != 0 {
        if b & 1 == 1 {
            result ^= a;
        }
        b >>= 1;
        a <<= 1;
        if (a >> deg_m) & 1 == 1 {
            a ^= modulus;
        }
    }
    result
}

/// Raise `base` to `exp` over GF(2) modulo `modulus`.
fn gf2_pow_mod(mut base: u64, mut exp: u64, modulus: u64) -> u64 {
    let mut result = 1u64;
    base = gf2_mod(base, modulus);
    while exp != 0 {
        if exp & 1 == 1 {
            result = gf2_mul_mod(result, base, modulus);
        }
        base = gf2_mul_mod(base, base, modulus);
        exp >>= 1;
    }
    result
}

fn prime_factors(mut n: u64) -> Vec<u64> {
    let mut factors = Vec::new();
    let mut p = 2u64;
    while p * p <= n {
        if n % p == 0 {
            factors.push(p);
            while n % p == 0 {
                n /= p;
            }
        }
        p += 1;
    }
    if n > 1 {
        factors.push(n);
    }
    factors
}

/// A degree-`s` polynomial is primitive iff `x` has multiplicative order
/// `2^s - 1` modulo it.
fn is_primitive(poly: u64) -> bool {
    if poly < 3 || poly & 1 == 0 {
        return false;
    }
    let degree = 63 - poly.leading_zeros();
    let group = (1u64 << degree) - 1;
    if gf2_pow_mod(2, group, poly) != 1 {
        return false;
    }
    for q in prime_factors(group) {
        if gf2_pow_mod(2, group / q, poly) == 1 {
            return false;
        }
    }
    true
}

/// First `count` primitive polynomials over GF(2), ascending by binary
/// encoding (constant term always 1).
fn primitive_polynomials(count: usize) -> Vec<u64> {
    let mut polys = Vec::with_capacity(count);
    let mut candidate = 3u64;
    while polys.len() < count {
        if is_primitive(candidate) {
            polys.push(candidate);
        }
        candidate += 2;
    }
    polys
}

/// Direction numbers for one Sobol dimension, scaled to 32 fractional bits.
fn sobol_direction_numbers(poly: u64, bits: usize) -> Vec<u32> {
    let degree = (63 - poly.leading_zeros()) as usize;
    let mut v = vec![0u32; bits];
    for (j, slot) in v.iter_mut().enumerate().take(degree.min(bits)) {
        *slot = 1u32 << (31 - j);
    }
    for j in degree..bits {
        let mut value = v[j - degree] ^ (v[j - degree] >> degree);
        for t in 1..degree {
            if (poly >> (degree - t)) & 1 == 1 {
                value ^= v[j - t];
            }
        }
        v[j] = value;
    }
    v
}

fn sample_sobol(rows: usize, dims: usize, seed: u64) -> Result<Vec<Vec<f32>>> {
    ensure!(
        rows < (1usize << SOBOL_BITS),
        "sobol sampler supports at most 2^32 - 1 rows"
    );
    let mut rng = StdRng::seed_from_u64(seed);
    let mut directions: Vec<Vec<u32>> = Vec::with_capacity(dims);
    directions.push((0..SOBOL_BITS).map(|j| 1u32 << (31 - j)).collect());
    for poly in primitive_polynomials(dims.saturating_sub(1)) {
        directions.push(sobol_direction_numbers(poly, SOBOL_BITS));
    }
    let shifts: Vec<u32> = (0..dims).map(|_| rng.gen()).collect();
    let mut state = vec![0u32; dims];
    let mut points = Vec::with_capacity(rows);
    for i in 0..rows {
        if i > 0 {
            let bit = (i as u32).trailing_zeros() as usize;
            for d in 0..dims {
                state[d] ^= directions[d][bit];
            }
        }
        let row = (0..dims)
            .map(|d| (f64::from(state[d] ^ shifts[d]) / 4294967296.0) as f32)
            .collect();
        points.push(row);
    }
    Ok(points)
}

/// Van der Corput radical inverse of `index` in the given base.
fn radical_inverse(mut index: u64, base: u64) -> f64 {
    let mut fraction = 1.0;
    let mut result = 0.0;
    while index > 0 {
        fraction /= base as f64;
        result += fraction * (index % base) as f64;
        index /= base;
    }
    result
}

fn first_primes(count: usize) -> Vec<u64> {
    let mut primes: Vec<u64> = Vec::with_capacity(count);
    let mut candidate = 2u64;
    while primes.len() < count {
        if primes
            .iter()
            .take_while(|p| *p * *p <= candidate)
            .all(|p| candidate % p != 0)
        {
            primes.push(candidate);
        }
        candidate += 1;
    }
    primes
}

fn sample_halton(rows: usize, dims: usize, seed: u64) -> Vec<Vec<f32>> {
    let mut rng = StdRng::seed_from_u64(seed);
    let bases = first_primes(dims);
    let rotations: Vec<f64> = (0..dims).map(|_| rng.gen::<f64>()).collect();
    (1..=rows as u64)
        .map(|index| {
            (0..dims)
                .map(|d| {
                    let value = radical_inverse(index, bases[d]) + rotations[d];
                    (value - value.floor()) as f32
                })
                .collect()
        })
        .collect()
}

fn sample_latin_hypercube(rows: usize, dims: usize, seed: u64) -> Vec<Vec<f32>> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut points = vec![vec![0f32; dims]; rows];
    for d in 0..dims {
        let mut strata: Vec<usize> = (0..rows).collect();
        strata.shuffle(&mut rng);
        for (row, stratum) in strata.into_iter().enumerate() {
            points[row][d] = ((stratum as f64 + rng.gen::<f64>()) / rows as f64) as f32;
        }
    }
    points
}
