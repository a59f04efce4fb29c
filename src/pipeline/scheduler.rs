//! Noise schedules and the DDIM sampler.

use std::f32::consts::TAU;

use ndarray::Array4;
use rand::rngs::StdRng;
use rand::Rng;

/// Number of diffusion steps the models were trained with.
pub const TRAIN_TIMESTEPS: usize = 1000;

/// How betas are spaced between `beta_start` and `beta_end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BetaSchedule {
    /// Betas spaced linearly.
    Linear,
    /// Square roots of the betas spaced linearly (Stable Diffusion default).
    ScaledLinear,
}

/// What the `UNet` predicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prediction {
    /// The added noise.
    Epsilon,
    /// The velocity `sqrt(a) * noise - sqrt(1 - a) * x0`.
    VPrediction,
}

/// Cumulative products of `1 - beta` for a beta schedule.
#[derive(Debug, Clone)]
pub struct NoiseSchedule {
    alphas_cumprod: Vec<f64>,
}

impl NoiseSchedule {
    /// Build a schedule over [`TRAIN_TIMESTEPS`] steps.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn new(schedule: BetaSchedule, beta_start: f64, beta_end: f64) -> Self {
        let last = (TRAIN_TIMESTEPS - 1) as f64;
        let lerp = |from: f64, to: f64, i: usize| (to - from).mul_add(i as f64 / last, from);

        let mut product = 1.0;
        let alphas_cumprod = (0..TRAIN_TIMESTEPS)
            .map(|i| {
                let beta = match schedule {
                    BetaSchedule::Linear => lerp(beta_start, beta_end, i),
                    BetaSchedule::ScaledLinear => {
                        lerp(beta_start.sqrt(), beta_end.sqrt(), i).powi(2)
                    }
                };
                product *= 1.0 - beta;
                product
            })
            .collect();

        Self { alphas_cumprod }
    }

    /// Cumulative alpha at training timestep `t`.
    #[must_use]
    pub fn alpha_cumprod(&self, t: usize) -> f64 {
        self.alphas_cumprod[t.min(TRAIN_TIMESTEPS - 1)]
    }

    /// Forward-diffuse `original` to timestep `t`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn add_noise(&self, original: &Array4<f32>, noise: &Array4<f32>, t: usize) -> Array4<f32> {
        let alpha = self.alpha_cumprod(t);
        let signal = alpha.sqrt() as f32;
        let sigma = (1.0 - alpha).sqrt() as f32;
        original * signal + noise * sigma
    }
}

/// Parameters of a DDIM scheduler.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub beta_schedule: BetaSchedule,
    pub beta_start: f64,
    pub beta_end: f64,
    pub prediction: Prediction,
    pub steps_offset: usize,
}

impl SchedulerConfig {
    /// Stable Diffusion 1.5.
    pub const SD15: Self = Self {
        beta_schedule: BetaSchedule::ScaledLinear,
        beta_start: 0.000_85,
        beta_end: 0.012,
        prediction: Prediction::Epsilon,
        steps_offset: 1,
    };

    /// Stable Diffusion x4 upscaler.
    pub const X4_UPSCALER: Self = Self {
        beta_schedule: BetaSchedule::ScaledLinear,
        beta_start: 0.0001,
        beta_end: 0.02,
        prediction: Prediction::VPrediction,
        steps_offset: 1,
    };
}

/// Deterministic DDIM sampler (eta = 0) with "leading" timestep spacing.
#[derive(Debug, Clone)]
pub struct DdimScheduler {
    schedule: NoiseSchedule,
    prediction: Prediction,
    timesteps: Vec<usize>,
    step_ratio: usize,
    /// Alpha used past the last step. `set_alpha_to_one = false` semantics.
    final_alpha_cumprod: f64,
}

impl DdimScheduler {
    /// Build a scheduler sampling `inference_steps` timesteps, highest first.
    ///
    /// `inference_steps` must be non-zero.
    #[must_use]
    pub fn new(config: &SchedulerConfig, inference_steps: usize) -> Self {
        let schedule = NoiseSchedule::new(config.beta_schedule, config.beta_start, config.beta_end);
        let step_ratio = TRAIN_TIMESTEPS / inference_steps.clamp(1, TRAIN_TIMESTEPS);
        let timesteps = (0..inference_steps.min(TRAIN_TIMESTEPS))
            .rev()
            .map(|i| (i * step_ratio + config.steps_offset).min(TRAIN_TIMESTEPS - 1))
            .collect();
        let final_alpha_cumprod = schedule.alpha_cumprod(0);

        Self {
            schedule,
            prediction: config.prediction,
            timesteps,
            step_ratio,
            final_alpha_cumprod,
        }
    }

    /// Timesteps to visit, in descending order.
    #[must_use]
    pub fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    /// Timesteps left when starting from a partially noised image.
    ///
    /// `strength` 1.0 runs every step; 0.0 runs none.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn img2img_timesteps(&self, strength: f32) -> &[usize] {
        let total = self.timesteps.len();
        let init = ((total as f32 * strength) as usize).min(total);
        &self.timesteps[total - init..]
    }

    /// Forward-diffuse a clean sample to timestep `t`.
    #[must_use]
    pub fn add_noise(&self, original: &Array4<f32>, noise: &Array4<f32>, t: usize) -> Array4<f32> {
        self.schedule.add_noise(original, noise, t)
    }

    /// Compute the sample at the previous timestep from the model output at `t`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn step(&self, model_output: &Array4<f32>, t: usize, sample: &Array4<f32>) -> Array4<f32> {
        let alpha_t = self.schedule.alpha_cumprod(t);
        let alpha_prev = t
            .checked_sub(self.step_ratio)
            .map_or(self.final_alpha_cumprod, |prev| self.schedule.alpha_cumprod(prev));

        let sqrt_alpha = alpha_t.sqrt() as f32;
        let sqrt_beta = (1.0 - alpha_t).sqrt() as f32;

        let (pred_original, pred_epsilon) = match self.prediction {
            Prediction::Epsilon => (
                (sample - &(model_output * sqrt_beta)) / sqrt_alpha,
                model_output.clone(),
            ),
            Prediction::VPrediction => (
                sample * sqrt_alpha - model_output * sqrt_beta,
                model_output * sqrt_alpha + sample * sqrt_beta,
            ),
        };

        pred_original * alpha_prev.sqrt() as f32 + pred_epsilon * (1.0 - alpha_prev).sqrt() as f32
    }
}

/// Draw standard normal noise with the Box-Muller transform.
pub fn randn(shape: (usize, usize, usize, usize), rng: &mut StdRng) -> Array4<f32> {
    Array4::from_shape_simple_fn(shape, || {
        let u1: f32 = rng.random_range(f32::EPSILON..1.0);
        let u2: f32 = rng.random();
        (-2.0 * u1.ln()).sqrt() * (TAU * u2).cos()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn alphas_decrease_monotonically() {
        let schedule = NoiseSchedule::new(BetaSchedule::ScaledLinear, 0.000_85, 0.012);
        assert!((schedule.alpha_cumprod(0) - (1.0 - 0.000_85)).abs() < 1e-9);
        assert!(schedule.alpha_cumprod(999) < schedule.alpha_cumprod(500));
        assert!(schedule.alpha_cumprod(999) > 0.0);
    }

    #[test]
    fn linear_schedule_endpoints() {
        let schedule = NoiseSchedule::new(BetaSchedule::Linear, 0.0001, 0.02);
        let ratio = schedule.alpha_cumprod(1) / schedule.alpha_cumprod(0);
        assert!((schedule.alpha_cumprod(0) - 0.9999).abs() < 1e-9);
        assert!((ratio - (1.0 - (0.0001 + 0.0199 / 999.0))).abs() < 1e-9);
    }

    #[test]
    fn leading_timesteps_with_offset() {
        let scheduler = DdimScheduler::new(&SchedulerConfig::SD15, 4);
        assert_eq!(scheduler.timesteps(), &[751, 501, 251, 1]);
    }

    #[test]
    fn img2img_keeps_the_tail() {
        let scheduler = DdimScheduler::new(&SchedulerConfig::SD15, 10);
        assert_eq!(scheduler.img2img_timesteps(0.6), &[501, 401, 301, 201, 101, 1]);
        assert_eq!(scheduler.img2img_timesteps(1.0).len(), 10);
        assert!(scheduler.img2img_timesteps(0.0).is_empty());
    }

    #[test]
    fn epsilon_step_with_exact_noise_recovers_clean_sample() {
        let scheduler = DdimScheduler::new(&SchedulerConfig::SD15, 1);
        let t = scheduler.timesteps()[0];
        let original = Array4::from_elem((1, 4, 2, 2), 0.5_f32);
        let noise = Array4::from_elem((1, 4, 2, 2), -0.25_f32);
        let noisy = scheduler.add_noise(&original, &noise, t);

        // Single step lands on the final alpha, which is close to one.
        let prev = scheduler.step(&noise, t, &noisy);
        let alpha = scheduler.final_alpha_cumprod;
        #[allow(clippy::cast_possible_truncation)]
        let expected = 0.5 * alpha.sqrt() as f32 - 0.25 * (1.0 - alpha).sqrt() as f32;
        assert!(prev.iter().all(|v| (v - expected).abs() < 1e-4));
    }

    #[test]
    fn v_prediction_step_with_exact_velocity_recovers_clean_sample() {
        let scheduler = DdimScheduler::new(&SchedulerConfig::X4_UPSCALER, 2);
        let t = scheduler.timesteps()[0];
        let alpha = scheduler.schedule.alpha_cumprod(t);
        let original = Array4::from_elem((1, 4, 2, 2), 0.3_f32);
        let noise = Array4::from_elem((1, 4, 2, 2), 1.0_f32);
        let noisy = scheduler.add_noise(&original, &noise, t);
        #[allow(clippy::cast_possible_truncation)]
        let velocity = &noise * alpha.sqrt() as f32 - &original * (1.0 - alpha).sqrt() as f32;

        let prev = scheduler.step(&velocity, t, &noisy);
        let expected = scheduler.add_noise(&original, &noise, t - scheduler.step_ratio);
        for (a, b) in prev.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-4, "{a} != {b}");
        }
    }

    #[test]
    fn randn_is_seeded_and_roughly_standard() {
        let mut a = StdRng::seed_from_u64(7);
        let mut b = StdRng::seed_from_u64(7);
        let x = randn((1, 4, 32, 32), &mut a);
        assert_eq!(x, randn((1, 4, 32, 32), &mut b));

        #[allow(clippy::cast_precision_loss)]
        let n = x.len() as f32;
        let mean = x.sum() / n;
        let var = x.mapv(|v| (v - mean).powi(2)).sum() / n;
        assert!(mean.abs() < 0.1);
        assert!((var - 1.0).abs() < 0.15);
    }
}
