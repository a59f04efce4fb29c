//! Noise prediction with the `UNet`.

use ndarray::{Array1, Array3, Array4, Ix4};
use ort::session::Session;

use crate::error::Result;
use crate::model::{ModelCache, ModelFile, SessionOptions};

use super::session::{extract, float_input, has_input, inference_err, integer_input, missing_output};
use super::text::PromptEmbeddings;

/// A loaded denoising `UNet`.
pub struct Unet {
    session: Session,
    /// The x4 upscaler conditions on the noise level through `class_labels`.
    takes_class_labels: bool,
}

impl Unet {
    /// Load the `UNet` of a model export.
    ///
    /// # Errors
    ///
    /// Returns an error if the model cannot be resolved or loaded.
    pub fn load(models: &ModelCache, options: &SessionOptions) -> Result<Self> {
        let session = models.load_session(ModelFile::Unet, options)?;
        let takes_class_labels = has_input(&session, "class_labels");
        Ok(Self {
            session,
            takes_class_labels,
        })
    }

    /// Predict the model output for `sample` at `timestep`, applying
    /// classifier-free guidance when unconditional embeddings are present.
    ///
    /// # Errors
    ///
    /// Returns an error if inference fails.
    pub fn predict(
        &mut self,
        sample: &Array4<f32>,
        timestep: usize,
        embeddings: &PromptEmbeddings,
        guidance: f32,
        class_label: Option<i64>,
    ) -> Result<Array4<f32>> {
        let cond = self.run(sample, timestep, &embeddings.cond, class_label)?;

        match &embeddings.uncond {
            Some(uncond) => {
                let uncond = self.run(sample, timestep, uncond, class_label)?;
                Ok(guide(&uncond, &cond, guidance))
            }
            None => Ok(cond),
        }
    }

    #[allow(clippy::cast_possible_wrap)]
    fn run(
        &mut self,
        sample: &Array4<f32>,
        timestep: usize,
        hidden_states: &Array3<f32>,
        class_label: Option<i64>,
    ) -> Result<Array4<f32>> {
        let sample_value = float_input(sample.clone())?;
        let timestep_value =
            integer_input(&self.session, "timestep", Array1::from_vec(vec![timestep as i64]))?;
        let hidden_value = float_input(hidden_states.clone())?;

        let outputs = match (self.takes_class_labels, class_label) {
            (true, Some(label)) => {
                let labels =
                    integer_input(&self.session, "class_labels", Array1::from_vec(vec![label]))?;
                self.session.run(ort::inputs![
                    "sample" => sample_value,
                    "timestep" => timestep_value,
                    "encoder_hidden_states" => hidden_value,
                    "class_labels" => labels,
                ])
            }
            _ => self.session.run(ort::inputs![
                "sample" => sample_value,
                "timestep" => timestep_value,
                "encoder_hidden_states" => hidden_value,
            ]),
        }
        .map_err(inference_err)?;

        let output = outputs
            .values()
            .next()
            .ok_or_else(|| missing_output("noise prediction"))?;

        extract::<Ix4>(&output, "noise prediction")
    }
}

/// Classifier-free guidance: push the prediction away from the unconditional one.
#[must_use]
pub fn guide(uncond: &Array4<f32>, cond: &Array4<f32>, scale: f32) -> Array4<f32> {
    uncond + &((cond - uncond) * scale)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guidance_of_one_returns_conditional() {
        let uncond = Array4::from_elem((1, 4, 2, 2), 1.0_f32);
        let cond = Array4::from_elem((1, 4, 2, 2), 3.0_f32);
        assert_eq!(guide(&uncond, &cond, 1.0), cond);
    }

    #[test]
    fn guidance_extrapolates() {
        let uncond = Array4::from_elem((1, 1, 1, 1), 1.0_f32);
        let cond = Array4::from_elem((1, 1, 1, 1), 2.0_f32);
        assert!((guide(&uncond, &cond, 7.5)[[0, 0, 0, 0]] - 8.5).abs() < 1e-6);
    }
}
