use crate::vocab::ScoringType;
use crate::{BowVector, WordId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Norm {
    L1,
    L2,
}

/// Provides method(s) for building bow vectors and computing the similarity score between them.
///
/// All scores expect vectors normalized with [`ScoringType::norm`].
pub trait BowTrait {
    fn add_weight(&mut self, id: WordId, w: f64);
    fn add_if_not_exist(&mut self, id: WordId, w: f64);
    fn normalize(&mut self, norm: Norm);

    /// Score with the given measure.
    fn score(&self, other: &Self, scoring: ScoringType) -> f64 {
        match scoring {
            ScoringType::L1 => self.l1(other),
            ScoringType::L2 => self.l2(other),
            ScoringType::ChiSquare => self.chi_square(other),
            ScoringType::Kl => self.kl(other),
            ScoringType::Bhattacharyya => self.bhattacharyya(other),
            ScoringType::DotProduct => self.dot_product(other),
        }
    }

    /// `1 - 0.5 * |v - w|` (Galvez, Eq 2). In [0, 1].
    fn l1(&self, other: &Self) -> f64;
    /// `1 - sqrt(1 - v.w)`. In [0, 1].
    fn l2(&self, other: &Self) -> f64;
    /// `2 * sum(vi * wi / (vi + wi))`. In [0, 1].
    fn chi_square(&self, other: &Self) -> f64;
    /// KL divergence of `other` from `self`. Missing words count as `ln(eps)`.
    fn kl(&self, other: &Self) -> f64;
    /// `sum(sqrt(vi * wi))`. In [0, 1].
    fn bhattacharyya(&self, other: &Self) -> f64;
    fn dot_product(&self, other: &Self) -> f64;
}

/// Pairs of values for words present in both vectors.
fn common<'a>(a: &'a BowVector, b: &'a BowVector) -> impl Iterator<Item = (f64, f64)> + 'a {
    a.iter().filter_map(move |(id, &v)| b.get(id).map(|&w| (v, w)))
}

impl BowTrait for BowVector {
    fn add_weight(&mut self, id: WordId, w: f64) {
        *self.entry(id).or_insert(0.) += w;
    }

    fn add_if_not_exist(&mut self, id: WordId, w: f64) {
        self.entry(id).or_insert(w);
    }

    fn normalize(&mut self, norm: Norm) {
        let n: f64 = match norm {
            Norm::L1 => self.values().map(|v| v.abs()).sum(),
            Norm::L2 => self.values().map(|v| v * v).sum::<f64>().sqrt(),
        };
        if n > 0. {
            for v in self.values_mut() {
                *v /= n;
            }
        }
    }

    fn l1(&self, other: &Self) -> f64 {
        let s: f64 = common(self, other)
            .map(|(v, w)| (v - w).abs() - v.abs() - w.abs())
            .sum();
        -s / 2.
    }

    fn l2(&self, other: &Self) -> f64 {
        let s = self.dot_product(other);
        if s >= 1. {
            1.
        } else {
            1. - (1. - s).sqrt()
        }
    }

    fn chi_square(&self, other: &Self) -> f64 {
        let s: f64 = common(self, other)
            .filter(|(v, w)| v + w != 0.)
            .map(|(v, w)| v * w / (v + w))
            .sum();
        2. * s
    }

    fn kl(&self, other: &Self) -> f64 {
        let log_eps = f64::EPSILON.ln();
        self.iter()
            .filter(|(_, &v)| v != 0.)
            .map(|(id, &v)| match other.get(id) {
                Some(&w) if w != 0. => v * (v / w).ln(),
                _ => v * (v.ln() - log_eps),
            })
            .sum()
    }

    fn bhattacharyya(&self, other: &Self) -> f64 {
        common(self, other).map(|(v, w)| (v * w).sqrt()).sum()
    }

    fn dot_product(&self, other: &Self) -> f64 {
        common(self, other).map(|(v, w)| v * w).sum()
    }
}
