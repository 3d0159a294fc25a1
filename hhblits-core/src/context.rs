//! Pseudocount strategies applied to a raw profile before it is scored.

use crate::alphabet::BACKGROUND;
use crate::profile::Profile;

/// Turns a raw profile into a pseudocount-augmented profile.
///
/// Implementations must be pure: identical input and configuration always give
/// the identical output.
pub trait ContextProvider: Send + Sync {
    fn augment(&self, profile: &Profile) -> Profile;
}

/// Leaves the profile untouched.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoPseudocounts;

impl ContextProvider for NoPseudocounts {
    fn augment(&self, profile: &Profile) -> Profile {
        profile.clone()
    }
}

/// Mixes every column with the background distribution.
///
/// The admixture is `tau = a / (1 + neff / b)`; with `b = f32::INFINITY` it is
/// the constant `a`.
#[derive(Clone, Copy, Debug)]
pub struct BackgroundAdmix {
    a: f32,
    b: f32,
}

impl BackgroundAdmix {
    pub fn constant(tau: f32) -> Self {
        Self {
            a: tau.clamp(0.0, 1.0),
            b: f32::INFINITY,
        }
    }

    /// Diversity-dependent admixture: diverse profiles receive fewer pseudocounts.
    pub fn diversity_scaled(a: f32, b: f32) -> Self {
        Self {
            a: a.clamp(0.0, 1.0),
            b: b.max(f32::EPSILON),
        }
    }

    pub fn tau(&self, neff: f32) -> f32 {
        (self.a / (1.0 + neff / self.b)).clamp(0.0, 1.0)
    }
}

impl Default for BackgroundAdmix {
    fn default() -> Self {
        Self::diversity_scaled(0.9, 4.0)
    }
}

impl ContextProvider for BackgroundAdmix {
    fn augment(&self, profile: &Profile) -> Profile {
        let tau = self.tau(profile.neff());
        let mut out = profile.clone();
        for col in out.columns_mut() {
            for (f, &bg) in col.freqs.iter_mut().zip(BACKGROUND.iter()) {
                *f = (1.0 - tau) * *f + tau * bg;
            }
            col.normalize();
        }
        out.refresh_neff();
        out
    }
}
